//! On-demand services.
//!
//! The first CONNECT naming a configured service spawns its program with
//! one end of a socketpair and `-ondemand <fd>` appended to the argv. The
//! daemon end is adopted as a regular client connection.

use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::process::Command;

use tokio::net::UnixStream;

use crate::config::OnDemandStart;

/// Clear close-on-exec so the child inherits the fd. Everything else the
/// daemon holds stays CLOEXEC.
fn clear_cloexec(fd: i32) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Spawn `entry`'s program with a fresh socketpair and return the daemon
/// end, nonblocking and registered with the runtime.
pub fn launch(entry: &OnDemandStart) -> io::Result<UnixStream> {
    let (ours, theirs) = StdUnixStream::pair()?;
    clear_cloexec(theirs.as_raw_fd())?;

    let mut command = Command::new(&entry.program);
    command.args(entry.arguments.get(1..).unwrap_or(&[]));
    command.arg("-ondemand");
    command.arg(theirs.as_raw_fd().to_string());

    let child = command.spawn()?;
    tracing::info!(
        service = %entry.service_name,
        program = %entry.program,
        pid = child.id(),
        "launched on-demand service"
    );
    // The child inherited its end; closing our copy now leaves the pair
    // owned by exactly one process per side.
    drop(theirs);

    ours.set_nonblocking(true)?;
    UnixStream::from_std(ours)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(program: &str) -> OnDemandStart {
        OnDemandStart {
            service_name: "test".into(),
            program: program.into(),
            arguments: vec![program.into()],
        }
    }

    #[tokio::test]
    async fn launch_returns_a_usable_stream() {
        let stream = launch(&entry("/bin/true")).unwrap();
        // The child exits immediately; the daemon end must still be a
        // valid registered stream.
        drop(stream);
    }

    #[tokio::test]
    async fn launch_missing_program_fails() {
        assert!(launch(&entry("/nonexistent/program")).is_err());
    }
}

//! The interrupt line from the A314 board.
//!
//! The board raises GPIO 25 whenever the Amiga side has posted events. The
//! pin is exported through sysfs with edge triggering on both flanks; the
//! value file then signals exceptional readiness on every edge, which the
//! runtime surfaces through [`AsyncFd`] priority interest.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

const IRQ_GPIO: &str = "25";
const GPIO_ROOT: &str = "/sys/class/gpio";

fn gpio_path(leaf: &str) -> String {
    format!("{GPIO_ROOT}/gpio{IRQ_GPIO}/{leaf}")
}

fn open_write_close(path: &str, text: &str) -> io::Result<()> {
    let mut f = OpenOptions::new().write(true).open(path)?;
    f.write_all(text.as_bytes())
}

/// Async edge events from the interrupt pin.
///
/// The first event after startup is a spurious level notification from the
/// freshly armed edge trigger and is discarded. `Drop` disarms the edge and
/// unexports the pin.
pub struct GpioIrq {
    value: AsyncFd<File>,
    discarded_first: bool,
}

impl GpioIrq {
    pub fn init() -> io::Result<Self> {
        open_write_close(&format!("{GPIO_ROOT}/export"), IRQ_GPIO)?;

        // udev takes a moment to apply permissions to the freshly exported
        // pin; retry the direction write until the file appears writable.
        for _ in 0..100 {
            if open_write_close(&gpio_path("direction"), "in").is_ok() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        open_write_close(&gpio_path("edge"), "both")?;

        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(gpio_path("value"))?;

        Ok(GpioIrq {
            value: AsyncFd::with_interest(file, Interest::PRIORITY)?,
            discarded_first: false,
        })
    }

    /// Wait for the next edge. Reading the value file re-arms the trigger.
    pub async fn wait(&mut self) -> io::Result<()> {
        loop {
            let mut guard = self.value.ready(Interest::PRIORITY).await?;

            let mut byte = [0u8; 1];
            let mut file = self.value.get_ref();
            file.seek(SeekFrom::Start(0))?;
            let n = file.read(&mut byte)?;
            if n != 1 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "gpio value file returned no data",
                ));
            }
            guard.clear_ready();

            if !self.discarded_first {
                tracing::debug!("discarding first gpio event");
                self.discarded_first = true;
                continue;
            }

            tracing::trace!("gpio interrupt");
            return Ok(());
        }
    }
}

impl Drop for GpioIrq {
    fn drop(&mut self) {
        let _ = open_write_close(&gpio_path("edge"), "none");
        let _ = open_write_close(&format!("{GPIO_ROOT}/unexport"), IRQ_GPIO);
    }
}

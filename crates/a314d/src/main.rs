//! a314d: bridge daemon between Amiga programs and Raspberry Pi services.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use a314d::bridge::{Bridge, BridgeError};
use a314d::bus::SpiBus;
use a314d::config;
use a314d::gpio::GpioIrq;

const LISTEN_ADDR: &str = "127.0.0.1:7110";
const LISTEN_BACKLOG: u32 = 16;

#[derive(Parser)]
#[command(name = "a314d", about = "Bridge daemon for the A314 expansion board")]
struct Cli {
    /// Service table listing on-demand services
    #[arg(default_value = "/etc/opt/a314/a314d.conf")]
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "a314d=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let services = config::load(&cli.config);
    if services.is_empty() {
        tracing::warn!("no registered services");
    }

    match run(services).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(services: Vec<config::OnDemandStart>) -> Result<(), BridgeError> {
    let bus = SpiBus::open(SpiBus::DEVICE).map_err(BridgeError::Bus)?;
    let irq = GpioIrq::init().map_err(BridgeError::Io)?;

    let addr: SocketAddr = LISTEN_ADDR.parse().map_err(|_| {
        BridgeError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "bad listen address",
        ))
    })?;
    let socket = tokio::net::TcpSocket::new_v4().map_err(BridgeError::Io)?;
    socket.bind(addr).map_err(BridgeError::Io)?;
    let listener = socket.listen(LISTEN_BACKLOG).map_err(BridgeError::Io)?;
    tracing::info!(%addr, "listening");

    Bridge::new(bus, services).run(listener, irq).await
}

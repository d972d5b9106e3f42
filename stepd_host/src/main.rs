use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_serial::SerialPortBuilderExt;

use stepd_core::config::Config;
use stepd_host::pipeline::{
    attach, ConfigStage, DeltaStage, DeviceStage, PhysicsStage, Port, SourceStage, StageError,
    StepStage, MAX_PENDING_COMMANDS, NUM_PAGES,
};
use stepd_host::transport::line_pipe;

/// Host-side motion daemon: turns a gcode stream into bit-packed step
/// pages for a paged-step controller.
#[derive(Parser, Debug)]
#[command(name = "stepd")]
struct Cli {
    /// Path to the HJSON configuration file
    #[arg(long)]
    config: PathBuf,

    /// Path to the serial device
    #[arg(long, requires = "baud")]
    device: Option<PathBuf>,

    /// Baud rate for the serial device
    #[arg(long)]
    baud: Option<u32>,

    /// Connect over TCP (host:port) instead of serial
    #[arg(long, conflicts_with = "device")]
    addr: Option<String>,

    /// Log at TRACE level
    #[arg(long)]
    trace: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.trace {
            tracing::Level::TRACE
        } else {
            tracing::Level::INFO
        })
        .init();

    if let Err(e) = run(cli).await {
        tracing::error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), StageError> {
    let conf = Config::load(&cli.config)?;
    tracing::info!("loaded config from {}", cli.config.display());

    // upstream transport: the gcode producer on stdio
    let (upstream, c) = Port::pair(8);
    tokio::spawn(line_pipe(tokio::io::stdin(), tokio::io::stdout(), upstream));

    let c = attach(c, 8, "source", |h, t| SourceStage::new().run(h, t));
    let c = attach(c, 1, "config", {
        let conf = conf.clone();
        move |h, t| ConfigStage::new(conf).run(h, t)
    });
    let c = attach(c, 1, "delta", |h, t| DeltaStage::new().run(h, t));
    let c = attach(c, 1, "physics", |h, t| PhysicsStage::new().run(h, t));
    let c = attach(c, NUM_PAGES, "step", |h, t| StepStage::new().run(h, t));
    let c = attach(c, MAX_PENDING_COMMANDS, "device", |h, t| DeviceStage::new().run(h, t));

    let pipe = device_transport(&cli, &conf, c).await?;
    tokio::select! {
        res = pipe => res,
        _ = shutdown_signal() => {
            tracing::info!("closing device transport");
            // give in-flight pages a moment to drain
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

type PipeFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), StageError>> + Send>>;

/// Open the downstream transport per the CLI: serial with `--device` and
/// `--baud`, or TCP with `--addr` (which also pushes the config as the
/// first line, for simulator peers).
async fn device_transport(cli: &Cli, conf: &Config, c: Port) -> Result<PipeFuture, StageError> {
    if let (Some(device), Some(baud)) = (&cli.device, cli.baud) {
        let stream = tokio_serial::new(device.to_string_lossy(), baud)
            .open_native_async()
            .map_err(|e| StageError::Fatal(format!("failed to open {}: {e}", device.display())))?;
        tracing::info!("opened serial device {} @ {} baud", device.display(), baud);
        let (read, write) = tokio::io::split(stream);
        return Ok(Box::pin(line_pipe(read, write, c)));
    }

    if let Some(addr) = &cli.addr {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| StageError::Fatal(format!("failed to connect to {addr}: {e}")))?;
        tracing::info!("connected to {addr}");
        let mut first = serde_json::to_vec(conf)
            .map_err(|e| StageError::Fatal(format!("failed to serialize config: {e}")))?;
        first.push(b'\n');
        stream.write_all(&first).await?;
        let (read, write) = stream.into_split();
        return Ok(Box::pin(line_pipe(read, write, c)));
    }

    Err(StageError::Fatal(
        "either --device with --baud, or --addr is required".into(),
    ))
}

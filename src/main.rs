mod workers;

use anyhow::Context;
use rtcportal::utils::sos::SignalOfStop;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use workers::args::{Args, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (args, file_config) = Args::load()?;

    // webrtc_ice reports late STUN responses as "unknown TransactionID"
    // warnings, which are normal. Keep them out unless tracing everything.
    let filter = match args.verbose {
        0 => "warn,rtcportal=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let file_layer = match &args.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    let session_config = file_config.client.session_config();
    match args.command {
        Command::Relay(relay) => workers::relay::run(relay, sos).await,
        Command::Send(send) => workers::peer::send(send, session_config, sos).await,
        Command::Receive(recv) => workers::peer::receive(recv, session_config, sos).await,
    }
}

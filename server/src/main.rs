use clap::Parser;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use treadmill_mock_backend::{bind, AppState, Simulator};

/// Serve simulated treadmill telemetry over SSE and polling endpoints
#[derive(Parser, Debug)]
#[command(name = "treadmill-mock-backend", version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:3000")]
    bind: String,

    /// Milliseconds between generated samples
    #[arg(long, default_value_t = 1000)]
    tick_ms: u64,

    /// Require this key (header or query parameter) on both endpoints
    #[arg(long, env = "TREADMILL_API_KEY")]
    api_key: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    let simulator = Simulator::new();
    let _ticker = simulator.spawn(Duration::from_millis(args.tick_ms.max(1)));

    if args.api_key.is_some() {
        info!("[MOCK] API key required");
    }
    let (_, server) = bind(&args.bind, AppState::new(simulator, args.api_key)).await?;

    tokio::select! {
        result = server => result??,
        _ = tokio::signal::ctrl_c() => info!("[MOCK] Shutting down"),
    }

    Ok(())
}

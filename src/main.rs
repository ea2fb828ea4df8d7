use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use treadmill_live::credential::{
    default_credential_path, CredentialStorage, FileCredentialStorage, MemoryCredentialStorage,
};
use treadmill_live::network::ReachabilityProbe;
use treadmill_live::{connectivity, CredentialStore, LiveConfig, LiveConnectionManager};

/// Follow the live treadmill feed and log every sample and state change
#[derive(Parser, Debug)]
#[command(name = "treadmill-live", version)]
struct Args {
    /// Backend base URL
    #[arg(long, env = "TREADMILL_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// Default access key; forces polling
    #[arg(long, env = "TREADMILL_API_KEY")]
    api_key: Option<String>,

    /// Polling interval in milliseconds (minimum 500)
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Never use the event stream
    #[arg(long)]
    no_push: bool,

    /// Where the user-set key is persisted
    #[arg(long)]
    credential_file: Option<PathBuf>,

    /// Reachability probe period in milliseconds (0, the default, disables the probe)
    #[arg(long, default_value_t = 0)]
    probe_interval_ms: u64,

    /// `host:port` the probe connects to (defaults to the backend host)
    #[arg(long)]
    probe_target: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    let config = LiveConfig {
        base_url: args.api_url.clone(),
        default_api_key: args.api_key.clone(),
        push_supported: !args.no_push,
        polling_interval: Duration::from_millis(args.poll_interval_ms),
        ..Default::default()
    }
    .validate()
    .context("invalid configuration")?;

    info!("Treadmill live client starting");
    info!("  API: {}", config.base_url);

    let storage: Box<dyn CredentialStorage> =
        match args.credential_file.or_else(default_credential_path) {
            Some(path) => {
                info!("  Credential file: {}", path.display());
                Box::new(FileCredentialStorage::new(path))
            }
            None => {
                warn!("No config directory; user key will not be persisted");
                Box::new(MemoryCredentialStorage::new())
            }
        };
    let credentials = Arc::new(CredentialStore::new(config.default_api_key.clone(), storage));

    let (signal, watch) = connectivity(true);
    let _probe = if args.probe_interval_ms > 0 {
        let period = Duration::from_millis(args.probe_interval_ms);
        let probe = match &args.probe_target {
            Some(target) => ReachabilityProbe::new(target.clone(), period),
            None => ReachabilityProbe::for_base_url(&config.base_url, period)?,
        };
        info!("  Probing {}", probe.address());
        Some(probe.spawn(signal.clone()))
    } else {
        None
    };

    let manager = LiveConnectionManager::with_http_transports(config, watch, credentials)
        .context("failed to create HTTP transports")?;

    // Log state changes
    let mut states = manager.subscribe_state();
    tokio::spawn(async move {
        while let Some(state) = states.next().await {
            match (&state.retry_in_seconds, &state.last_error) {
                (Some(secs), Some(err)) => info!(
                    "[MAIN] {} via {} (retry in {}s: {})",
                    state.status, state.transport, secs, err
                ),
                (None, Some(err)) => {
                    info!("[MAIN] {} via {} ({})", state.status, state.transport, err)
                }
                _ => info!("[MAIN] {} via {}", state.status, state.transport),
            }
        }
    });

    // Log samples
    let mut samples = manager.subscribe_samples();
    tokio::spawn(async move {
        while let Some(sample) = samples.next().await {
            info!(
                "[SAMPLE] {} speed={:.1} incline={:.1} distance={:.2} calories={:.0}",
                sample.timestamp, sample.speed, sample.incline, sample.distance, sample.calories
            );
        }
    });

    info!("Commands: retry | interval <ms> | key <value> | key | online | offline | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("[MAIN] Interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let mut parts = line.split_whitespace();

                match (parts.next(), parts.next()) {
                    (Some("retry"), _) => {
                        if !manager.retry() {
                            warn!("[MAIN] Retry is only possible after polling gave up");
                        }
                    }
                    (Some("interval"), Some(ms)) => match ms.parse::<u64>() {
                        Ok(ms) => {
                            let applied = manager.set_polling_interval(Duration::from_millis(ms));
                            info!("[MAIN] Polling interval set to {}ms", applied.as_millis());
                        }
                        Err(_) => warn!("[MAIN] Not a number: {}", ms),
                    },
                    (Some("key"), value) => manager.set_credential(value.map(str::to_string)),
                    (Some("online"), _) => signal.set_online(true),
                    (Some("offline"), _) => signal.set_online(false),
                    (Some("quit"), _) => break,
                    (None, _) => {}
                    (Some(other), _) => warn!("[MAIN] Unknown command: {}", other),
                }
            }
        }
    }

    manager.shutdown();
    info!("Treadmill live client stopped");
    Ok(())
}

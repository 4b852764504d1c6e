use clap::Parser;
use onionseed::cli::{Args, TunnelConfig};
use onionseed::run_tunnel;
use onionseed::tunnel::DirectTransport;
use std::str::FromStr;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let env_filter = match std::env::var_os(EnvFilter::DEFAULT_ENV) {
        Some(_) => EnvFilter::from_default_env(),
        None => EnvFilter::from_str(&args.log)?,
    };
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = TunnelConfig::from(&args);
    warn!("Using the direct transport: traffic is not anonymised");

    let http_timeout = config.http_timeout;
    tokio::select! {
        res = run_tunnel(&config, |events| DirectTransport::new(events, http_timeout)) => {
            if let Err(e) = res {
                error!("Tunnel failed: {}", e);
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C received, shutting down.");
        }
    }
    Ok(())
}

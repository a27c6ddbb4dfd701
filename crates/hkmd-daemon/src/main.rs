//! hkmd-daemon entry point.
//!
//! This file is intentionally thin: it loads `.env.local` (dev
//! convenience), installs the tracing subscriber, loads configuration,
//! and hands off to `hkmd_daemon::run`. Everything else lives in
//! `lifecycle.rs`.

use std::sync::Arc;

use hkmd_clock::SystemClock;
use hkmd_daemon::gateway_stub::UnwiredGateway;
use tracing::error;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars
    // directly rather than shipping a `.env.local`.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let config = match hkmd_config::Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(2);
        }
    };

    let gateway: Arc<dyn hkmd_gateway::QuoteGateway> = Arc::new(UnwiredGateway);
    let clock: Arc<dyn hkmd_clock::Clock> = Arc::new(SystemClock::new());

    // No caller-supplied shutdown trigger beyond OS signals for the real
    // binary; a future that never resolves leaves SIGINT/SIGTERM as the
    // only shutdown path.
    let exit_code = hkmd_daemon::run(config, gateway, clock, std::future::pending()).await?;
    std::process::exit(exit_code);
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

//! Headless host bridge binary for stdin/stdout JSON communication.
//!
//! This binary reads `CommandEnvelope` and `ReplyEnvelope` messages as
//! newline-delimited JSON from stdin and writes responses, events and
//! browser calls to stdout.
//!
//! All tracing/diagnostic output goes to stderr (and optionally a rolling log
//! file) so that stdout remains a clean JSON protocol channel.

use pixel_pulse::PulseConfig;
use pixel_pulse::diagnostics::init_tracing;
use pixel_pulse::host::stdio::run_stdio_bridge;
use pixel_pulse::pulse_dirs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = pulse_dirs::config_file();
    let config = PulseConfig::load_or_default(&config_path).map_err(|e| {
        anyhow::anyhow!("failed to load config {}: {e}", config_path.display())
    })?;

    // Held for the life of the process so buffered log lines are flushed.
    let _log_guard = init_tracing(&config.logging)
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "pixel-pulse-host starting"
    );

    run_stdio_bridge(&config).await.map_err(|e| {
        tracing::error!(error = %e, "pixel-pulse-host exited with error");
        anyhow::anyhow!("pixel-pulse-host failed: {e}")
    })?;

    tracing::info!("pixel-pulse-host shut down cleanly");
    Ok(())
}

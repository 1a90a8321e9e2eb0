use tokio_util::sync::CancellationToken;

use tagpilot_core::UpdaterConfig;

use crate::driver::Driver;
use crate::error::{io_err, EngineError};
use crate::ports::Collaborators;

/// Build the engine on a multi-threaded runtime and block the current thread
/// until it stops. Ctrl-C requests a graceful stop.
pub fn start_blocking(config: UpdaterConfig, collab: Collaborators) -> Result<(), EngineError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;

    runtime.block_on(async move {
        let driver = Driver::new(config, collab)?;
        let stop = CancellationToken::new();
        let signal_stop = stop.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("interrupt received, stopping"),
                Err(err) => tracing::warn!(error = %err, "cannot listen for ctrl-c"),
            }
            signal_stop.cancel();
        });
        driver.run(stop).await
    })
}

/// Install the `RUST_LOG`-driven subscriber (default `info`). Safe to call
/// more than once.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

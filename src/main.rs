use amas_core::{config::AppConfig, logger::init_tracing, supervisor};

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable; SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sqlx::any::install_default_drivers();

    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    init_tracing(is_production);

    // Panics should be visible in the log stream before the process dies.
    std::panic::set_hook(Box::new(|info| {
        tracing::error!(panic = %info, "uncaught panic; exiting");
        std::process::exit(1);
    }));

    tracing::info!("Starting AMAS core...");

    let cfg = AppConfig::from_env();
    let app = supervisor::start(cfg).await?;

    tracing::info!("AMAS core started; waiting for shutdown signal");
    wait_for_signal().await;
    tracing::info!("Shutdown signal received");

    app.shutdown().await;
    Ok(())
}

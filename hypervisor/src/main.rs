use std::sync::Arc;

use hypervisor::{
    api, config, db, orchestrator::Orchestrator, outbox::ReplyOutbox, sandbox::DockerRuntime,
    session_registry::SessionRegistry, supervisor, AppState,
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hypervisor=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    info!(
        port = config.port,
        image = %config.sandbox_image,
        max_concurrent = config.max_concurrent,
        "hypervisor starting"
    );

    // Database
    let pool = db::connect(&config.database_url).await?;
    let registry = SessionRegistry::new(pool);

    // Sandboxes from a previous run hold stale mailboxes and sessions.
    let runtime = Arc::new(DockerRuntime::new(
        config.sandbox_cli.clone(),
        config.grace,
    ));
    if let Err(e) = supervisor::cleanup_orphans(runtime.as_ref(), &config.sandbox_name_prefix).await {
        warn!("orphan cleanup failed: {e}");
    }

    let outbox = Arc::new(ReplyOutbox::new());
    let orchestrator = Orchestrator::new(
        config.orchestrator_settings(),
        runtime,
        registry.clone(),
        outbox.clone(),
    );

    // Spawn idle watchdog
    tokio::spawn(Arc::clone(&orchestrator).run_idle_watchdog());

    let state = Arc::new(AppState {
        orchestrator: Arc::clone(&orchestrator),
        outbox,
        registry,
    });
    let app = api::router(state).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("ctrl-c handler failed: {e}");
            }
            info!("shutdown requested");
        })
        .await?;

    orchestrator.shutdown(config.grace * 3).await;
    Ok(())
}

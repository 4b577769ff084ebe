use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use std::env;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rustiscorm_sync::cloud::{CloudApi, CloudClient};
use rustiscorm_sync::config::Settings;
use rustiscorm_sync::ledger::Ledger;
use rustiscorm_sync::registration::RegistrationService;
use rustiscorm_sync::routes::{self, AppState};
use rustiscorm_sync::store::postgres::PgStore;
use rustiscorm_sync::upload::lock::PgLock;
use rustiscorm_sync::upload::UploadQueue;
use rustiscorm_sync::db;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "rustiscorm_sync=info,axum=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env().context("loading settings")?;

    let pool = db::connect(&settings).await.context("connecting to postgres")?;
    db::migrate(&pool).await.context("running migrations")?;
    let store = Arc::new(PgStore::new(pool.clone()));

    let client = CloudClient::new(settings.cloud.clone()).context("building cloud client")?;
    if !client.is_configured() {
        tracing::warn!("cloud credentials missing, cloud features will report unavailable");
    }
    let cloud: Arc<dyn CloudApi> = Arc::new(client);

    let ledger = Ledger::new(store.clone());
    let registrations = Arc::new(RegistrationService::new(
        cloud.clone(),
        store.clone(),
        ledger.clone(),
        settings.default_destination.clone(),
    ));
    let uploads = Arc::new(UploadQueue::new(
        cloud,
        store.clone(),
        Arc::new(PgLock::new(pool)),
        settings.worker.clone(),
    ));
    uploads.ensure_worker_running().await;
    let monitor = uploads.spawn_health_monitor(settings.health_interval);

    let webhook_auth = settings
        .webhook_user
        .clone()
        .zip(settings.webhook_password.clone());
    let state = AppState {
        ledger,
        store,
        registrations,
        uploads: uploads.clone(),
        packages_dir: settings.data_dir.join("packages"),
        max_package_bytes: settings.cloud.max_package_bytes,
        webhook_auth,
    };

    // multipart framing needs a little room above the package limit
    let body_limit = usize::try_from(settings.cloud.max_package_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(1024 * 1024);
    let app = routes::router(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = format!("0.0.0.0:{}", settings.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    uploads.stop().await;
    monitor.await.ok();
    Ok(())
}

mod config;
mod error;
mod portal;
mod routes;

use std::sync::Arc;

use anyhow::Context;
use minijinja::Environment;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::portal::{
    BrowserAuthenticator, FileSessionStore, LoginTimeouts, ReportFetcher, SessionManager,
};

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub config: Config,
    pub fetcher: ReportFetcher,
    pub templates: Environment<'static>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "renewal_report=debug,tower_http=info".into()),
        )
        .with(fmt::layer().with_target(true))
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env().context("invalid configuration")?;
    tracing::info!(
        port = config.port,
        report_url = %config.report_url,
        cookie_file = %config.cookie_file.display(),
        zone = ?config.display_zone,
        "Starting renewal-report"
    );

    let authenticator = BrowserAuthenticator::new(
        config.login_url.clone(),
        config.chromium_path.clone(),
        LoginTimeouts {
            navigation: config.login_timeout,
            field: config.field_timeout,
            idle: config.login_timeout,
        },
    );
    let session = SessionManager::new(
        config.credentials.clone(),
        Arc::new(FileSessionStore::new(config.cookie_file.clone())),
        Arc::new(authenticator),
    );
    let fetcher = ReportFetcher::new(
        session,
        config.report_url.clone(),
        config.query.clone(),
        config.display_zone,
        config.http_timeout,
    )?;

    let state = Arc::new(AppState {
        config: config.clone(),
        fetcher,
        templates: routes::templates()?,
    });

    let app = routes::router(state).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!("Listening on 0.0.0.0:{}", config.port);
    axum::serve(listener, app).await?;

    Ok(())
}

use std::sync::Arc;

use axum::http::{HeaderValue, Method, header};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing_subscriber::EnvFilter;

use ride_dispatch::api::rest::extract::{USER_ID_HEADER, USER_ROLE_HEADER};
use ride_dispatch::config::Config;
use ride_dispatch::engine::rematch::run_rematch_engine;
use ride_dispatch::error::AppError;
use ride_dispatch::state::AppState;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;
    init_tracing(&config);

    let cors = cors_layer(&config);
    let (app_state, rematch_rx) = AppState::new(config.clone());
    let shared_state = Arc::new(app_state);

    tokio::spawn(run_rematch_engine(shared_state.clone(), rematch_rx));

    let app = ride_dispatch::api::rest::router(shared_state).layer(cors);

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    Ok(())
}

fn init_tracing(config: &Config) {
    let builder = tracing_subscriber::fmt().with_env_filter(EnvFilter::new(&config.log_level));

    if config.log_format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.with_target(false).compact().init();
    }
}

fn cors_layer(config: &Config) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static(USER_ID_HEADER),
            header::HeaderName::from_static(USER_ROLE_HEADER),
        ]);

    match config.frontend_url.as_deref().map(HeaderValue::from_str) {
        Some(Ok(origin)) => cors.allow_origin(AllowOrigin::exact(origin)),
        Some(Err(_)) => {
            tracing::warn!(frontend_url = ?config.frontend_url, "invalid FRONTEND_URL, allowing any origin");
            cors.allow_origin(Any)
        }
        None => cors.allow_origin(Any),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}

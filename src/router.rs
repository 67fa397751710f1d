use axum::{
    Router,
    routing::{get, post},
};
use http::{HeaderValue, Method, header};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::handlers;
use crate::repositories::TwoFactorStore;
use crate::state::AppState;

/// Router の構築
pub fn create_router<S: TwoFactorStore>(state: AppState<S>) -> Router {
    let cors = cors_layer(&state.config.allowed_origins());

    Router::new()
        .route("/api/health", get(handlers::health_check::<S>))
        .route("/api/2fa/setup", post(handlers::setup_2fa::<S>))
        .route("/api/2fa/verify", post(handlers::verify_2fa::<S>))
        .route("/api/2fa/cancel", post(handlers::cancel_2fa::<S>))
        .route("/api/2fa/login/verify", post(handlers::login_verify_2fa::<S>))
        .route("/api/2fa/disable", post(handlers::disable_2fa::<S>))
        .route(
            "/api/2fa/backup-codes/regenerate",
            post(handlers::regenerate_backup_codes::<S>),
        )
        .route("/api/2fa/status/{user_id}", get(handlers::status_2fa::<S>))
        .layer(cors)
        .with_state(state)
}

/// CORS レイヤー（オリジン未設定の場合はクロスオリジンを許可しない）
fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = ?e, origin = %origin, "不正な CORS オリジンを無視");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
}

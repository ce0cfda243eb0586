use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, options},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};

use crate::api::{handlers, state::AppState};

const ALLOWED_METHODS: &str = "GET, POST, OPTIONS, PUT, PATCH, DELETE";

pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::OPTIONS,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        // Worker endpoints
        .route(
            "/workers",
            get(handlers::list_workers)
                .post(handlers::upsert_worker)
                .delete(handlers::delete_worker)
                .options(handlers::preflight),
        )
        // System endpoints
        .route("/ping", get(handlers::ping).options(handlers::preflight))
        .route(
            "/ping_redis",
            get(handlers::ping_remote).options(handlers::preflight),
        )
        .route(
            "/inspector_url",
            get(handlers::inspector_url).options(handlers::preflight),
        )
        .route("/", get(handlers::identity).options(handlers::preflight))
        .route("/*path", options(handlers::preflight))
        // Add state, CORS and tracing
        .with_state(state)
        .layer(cors)
        // Sent on every response, not only on preflight
        .layer(SetResponseHeaderLayer::if_not_present(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOWED_METHODS),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("content-type"),
        ))
        .layer(TraceLayer::new_for_http())
}

use axum::{
    http::Request,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::instrument;

use crate::handlers::{proxy, settings};
use crate::types::AppState;

#[instrument(skip_all)]
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Operator control surface
        .route("/settings", post(settings::update_settings))
        // Everything else is proxied to the gateway
        .route("/*path", get(proxy::proxy_request))
        // A fault in one request task must never take down the others
        .layer(CatchPanicLayer::new())
        .layer(
            // We allow cross-origin requests from any origin
            CorsLayer::permissive(),
        )
        .layer(
            // Add logging middleware
            ServiceBuilder::new().layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new())
                    .on_request(|request: &Request<axum::body::Body>, _span: &tracing::Span| {
                        // Segment fetches arrive at media rate, don't log them
                        if request.uri().path().ends_with(".m4s") {
                            return;
                        }

                        tracing::info!("Received request for endpoint: {}", request.uri().path());
                    }),
            ),
        )
        .with_state(state)
}

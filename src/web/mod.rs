use axum::{
    Router,
    extract::{Request, State},
    middleware::{self as axum_middleware, Next},
    response::Response,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::server::config::ServerConfig;
use crate::server::counter::ProcessCounter;
use crate::tenant::Tenant;

pub mod error;
pub mod routes;
pub mod templates;

use routes::{static_routes, tenant_routes};

/// Every request counts as a running operation, so shutdown waits for it.
async fn count_requests(State(counter): State<ProcessCounter>, request: Request, next: Next) -> Response {
    let _guard = counter.start();
    next.run(request).await
}

pub fn create_axum_router(config: Arc<ServerConfig>, tenants: &[Arc<Tenant>], counter: ProcessCounter) -> Router {
    let mut router = static_routes::router(config.clone());
    for tenant in tenants {
        router = router.merge(tenant_routes::router(tenant.clone(), config.clone()));
    }
    router
        .layer(axum_middleware::from_fn_with_state(counter, count_requests))
        .layer(TraceLayer::new_for_http())
}

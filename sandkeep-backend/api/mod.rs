pub mod middleware;
mod routes;
pub mod sandbox;

use std::sync::Arc;

use axum::Router;

use crate::sandbox::factory::SandboxFactory;
use sandbox::publish::HostPolicy;

#[derive(Clone)]
pub struct AppState {
    /// Selected backend plus its timeout registry, chosen once at startup.
    pub factory: Arc<SandboxFactory>,
    /// Hosts a published sandbox URL may point at.
    pub host_policy: Arc<HostPolicy>,
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}

//! Shared state handed to every HTTP handler.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::access::AccessControlEngine;
use crate::config::AppConfig;
use crate::factory::ProxyFactory;
use crate::stores::{EndpointStore, SessionValidator};

#[derive(Clone)]
pub struct AppState {
    pub endpoints: Arc<dyn EndpointStore>,
    pub sessions: Arc<dyn SessionValidator>,
    pub engine: AccessControlEngine,
    pub factory: ProxyFactory,
    /// Max body size buffered for decoration or create pre-checks.
    pub proxy_body_limit: usize,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        endpoints: Arc<dyn EndpointStore>,
        sessions: Arc<dyn SessionValidator>,
        engine: AccessControlEngine,
        factory: ProxyFactory,
        config: &AppConfig,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            endpoints,
            sessions,
            engine,
            factory,
            proxy_body_limit: config.limits.proxy_body_bytes,
            metrics,
        }
    }
}

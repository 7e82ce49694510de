use axum::http::Request;
use metrics::counter;
use tower_http::request_id::RequestId;

pub(crate) fn request_id_from_request<B>(req: &Request<B>) -> Option<String> {
    req.extensions()
        .get::<RequestId>()
        .and_then(|id| id.header_value().to_str().ok().map(|v| v.to_string()))
}

pub(crate) fn record_proxy_error_metrics(kind: &'static str) {
    counter!("gateway_proxy_errors_total", "kind" => kind).increment(1);
}

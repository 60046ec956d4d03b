use {
    std::{convert::Infallible, pin::Pin, sync::Arc, time::Duration},
    tracing::error,
    hyper::{Response, Method, body::Bytes},
    http_body_util::Full,
    prometheus::IntGauge,
    tokio::time::timeout,
    visitor_common::HttpResponse,
    crate::handler::{
        VisitorHandler,
        response_internal_error,
        response_method_not_allowed,
        response_preflight,
        response_timeout,
    },
};

pub struct HttpHandler {
    handler: Arc<VisitorHandler>,
    invocation_timeout: Duration,
}

impl HttpHandler {
    pub fn new(handler: Arc<VisitorHandler>, invocation_timeout: Duration) -> Self {
        Self {
            handler,
            invocation_timeout,
        }
    }
}

impl<B: Send + 'static> hyper::service::Service<hyper::Request<B>> for HttpHandler {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: hyper::Request<B>) -> Self::Future {
        let handler = self.handler.clone();
        let invocation_timeout = self.invocation_timeout;

        Box::pin(async move {
            let metrics = handler.metrics().clone();
            metrics.http_requests_in_flight.inc();
            let in_flight_guard = MetricGaugeDecreaseGuard::wrap(metrics.http_requests_in_flight.clone());

            let response = handle_request(req.method(), handler, invocation_timeout).await;

            drop(in_flight_guard);
            metrics.http_requests_total.inc();

            Ok(into_hyper_response(response))
        })
    }
}

/// Request body and path are ignored, the function has no inputs.
pub async fn handle_request(method: &Method, handler: Arc<VisitorHandler>, invocation_timeout: Duration) -> HttpResponse {
    match *method {
        Method::OPTIONS => response_preflight(),
        Method::GET | Method::POST => invoke_with_timeout(handler, invocation_timeout).await,
        _ => response_method_not_allowed(),
    }
}

/// Storage access blocks, so the invocation runs on the blocking pool. On timeout the caller gets a 504;
/// the attempt in flight either commits whole or not at all.
pub async fn invoke_with_timeout(handler: Arc<VisitorHandler>, invocation_timeout: Duration) -> HttpResponse {
    let invocation = tokio::task::spawn_blocking(move || handler.invoke());

    match timeout(invocation_timeout, invocation).await {
        Ok(Ok(v)) => v,
        Ok(Err(err)) => {
            error!("visitor function invocation failed: {err:?}");
            response_internal_error()
        },
        Err(err) => {
            error!("timeout when serving request: {err:?}");
            response_timeout()
        }
    }
}

fn into_hyper_response(function_response: HttpResponse) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(function_response.body)));
    *response.status_mut() = function_response.status;
    *response.headers_mut() = function_response.headers;
    response
}

struct MetricGaugeDecreaseGuard {
    gauge: IntGauge,
}

impl MetricGaugeDecreaseGuard {
    fn wrap(gauge: IntGauge) -> Self {
        Self { gauge }
    }
}

impl Drop for MetricGaugeDecreaseGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

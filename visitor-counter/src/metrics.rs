use {
    std::{convert::Infallible, net::SocketAddr, pin::Pin},
    tracing::{info, error},
    tokio::net::TcpListener,
    hyper::{Request, body::{Incoming, Bytes}, Response, server::conn::http1, http::StatusCode},
    hyper_util::rt::{TokioIo, TokioTimer},
    http_body_util::Full,
    thiserror::Error,
    prometheus::{
        TextEncoder,
        Registry,
        IntGauge,
        IntCounter,
        IntCounterVec,
        register_int_gauge_with_registry,
        register_int_counter_with_registry,
        register_int_counter_vec_with_registry,
    },
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub(crate) increments_total: IntCounter,
    pub(crate) conflicts_total: IntCounter,
    pub(crate) errors_total: IntCounterVec,

    pub(crate) http_requests_total: IntCounter,
    pub(crate) http_requests_in_flight: IntGauge,
}

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("failed to register: {reason}")]
    FailedToRegister {
        reason: String
    },

    #[error("failed to collect: {reason}")]
    FailedToCollect {
        reason: String
    },
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let register_error = |err: prometheus::Error| MetricsError::FailedToRegister { reason: format!("{err:?}") };

        let increments_total = register_int_counter_with_registry!("visitor_increments_total", "counter increments committed to storage", registry)
            .map_err(register_error)?;
        let conflicts_total = register_int_counter_with_registry!("visitor_conflicts_total", "conditional writes rejected because of a concurrent update", registry)
            .map_err(register_error)?;
        let errors_total = register_int_counter_vec_with_registry!("visitor_errors_total", "failed invocations by error kind", &["kind"], registry)
            .map_err(register_error)?;
        let http_requests_total = register_int_counter_with_registry!("http_requests_total", "total http requests processed", registry)
            .map_err(register_error)?;
        let http_requests_in_flight = register_int_gauge_with_registry!("http_requests_in_flight", "http requests being processed", registry)
            .map_err(register_error)?;

        Ok(Self {
            registry,

            increments_total,
            conflicts_total,
            errors_total,

            http_requests_total,
            http_requests_in_flight,
        })
    }

    pub fn encode(&self) -> Result<String, MetricsError> {
        let metrics = self.registry.gather();
        let encoder = TextEncoder::new();
        encoder.encode_to_string(&metrics)
            .map_err(|err| MetricsError::FailedToCollect { reason: format!("{err:?}") })
    }
}

pub async fn run_metrics_server(metrics: Metrics, port: u16) {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = match TcpListener::bind(addr).await {
        Ok(v) => v,
        Err(err) => {
            error!("failed to create TcpListener for metrics server: {err:?}");
            return;
        }
    };

    info!("running metrics server on {addr:?}");
    serve_metrics(metrics, listener).await
}

/// Answers every request on `listener` with the prometheus text exposition, `/metrics` included.
pub async fn serve_metrics(metrics: Metrics, listener: TcpListener) {
    let metrics_server = MetricsServer::new(metrics);

    loop {
        let (tcp, _) = match listener.accept().await {
            Ok(v) => v,
            Err(err) => {
                error!("failed to accept connection in metrics server: {err:?}");
                continue;
            }
        };
        let io = TokioIo::new(tcp);
        let metrics_server = metrics_server.clone();
        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .timer(TokioTimer::new())
                .serve_connection(io, metrics_server)
                .await {
                    error!("error while handling metrics request: {err:?}");
                }
        });
    }
}

#[derive(Clone)]
struct MetricsServer {
    metrics: Metrics,
}

impl MetricsServer {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            metrics,
        }
    }
}

impl hyper::service::Service<Request<Incoming>> for MetricsServer {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, _req: Request<Incoming>) -> Self::Future {
        let response = match self.metrics.encode() {
            Ok(v) => Response::new(Full::new(Bytes::from(v))),
            Err(err) => {
                error!("failed to encode metrics: {err:?}");
                let mut response = Response::new(Full::new(Bytes::from("internal server error.\n")));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        };

        Box::pin(async move { Ok(response) })
    }
}

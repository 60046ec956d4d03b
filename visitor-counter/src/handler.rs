use {
    std::time::Instant,
    once_cell::sync::OnceCell,
    tracing::{info, warn, error},
    hyper::http::StatusCode,
    visitor_common::{HttpResponse, VisitorCount, ErrorBody},
    crate::{
        counter::{CounterService, Increment},
        error::CounterError,
        metrics::Metrics,
        server::config::{CounterConfig, StorageConfig, counter_from_config},
    },
};

/// The visitor function: one invocation increments the counter and renders the response.
///
/// The counter service (and the storage connection behind it) is built on first invocation
/// and then shared by every concurrent invocation. A failed construction is not cached, the
/// next invocation tries again.
pub struct VisitorHandler {
    storage_config: StorageConfig,
    counter_config: CounterConfig,
    service: OnceCell<CounterService>,
    metrics: Metrics,
}

impl VisitorHandler {
    pub fn new(storage_config: StorageConfig, counter_config: CounterConfig, metrics: Metrics) -> Self {
        Self {
            storage_config,
            counter_config,
            service: OnceCell::new(),
            metrics,
        }
    }

    /// Skips lazy construction and serves from an already built service.
    pub fn with_service(mut self, service: CounterService) -> Self {
        self.service = OnceCell::with_value(service);
        self
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn service(&self) -> Result<&CounterService, CounterError> {
        self.service.get_or_try_init(|| {
            info!("opening counter storage: {:?}", self.storage_config);
            counter_from_config(&self.storage_config, &self.counter_config)
                .map_err(|err| CounterError::StoreUnavailable { reason: err.to_string() })
        })
    }

    pub fn increment(&self) -> Result<Increment, CounterError> {
        self.service()?.increment()
    }

    pub fn invoke(&self) -> HttpResponse {
        let started_at = Instant::now();

        match self.increment() {
            Ok(increment) => {
                self.metrics.increments_total.inc();
                self.metrics.conflicts_total.inc_by(u64::from(increment.attempts - 1));
                info!(
                    count = increment.count,
                    attempts = increment.attempts,
                    total_time_millis = (Instant::now() - started_at).as_millis() as u64,
                    "visitor counter incremented"
                );
                response_visitor_count(increment.count)
            },
            Err(err) => {
                self.metrics.errors_total.with_label_values(&[err.kind()]).inc();
                match &err {
                    CounterError::StoreUnavailable { .. } => warn!("failed to increment visitor counter: {err}"),
                    _ => error!("failed to increment visitor counter: {err}"),
                }
                response_for_error(&err)
            },
        }
    }
}

pub fn response_visitor_count(count: u64) -> HttpResponse {
    match HttpResponse::new().with_cors().with_json(&VisitorCount::new(count)) {
        Ok(v) => v,
        Err(err) => {
            error!("failed to render visitor count response: {err:?}");
            response_internal_error()
        }
    }
}

pub fn response_for_error(err: &CounterError) -> HttpResponse {
    match err {
        CounterError::StoreUnavailable { .. } => error_response(StatusCode::SERVICE_UNAVAILABLE, "store unavailable"),
        CounterError::NotFound { .. } => error_response(StatusCode::INTERNAL_SERVER_ERROR, "counter not initialized"),
        CounterError::CorruptData { .. } => error_response(StatusCode::INTERNAL_SERVER_ERROR, "counter data corrupted"),
        CounterError::Overflow => error_response(StatusCode::INTERNAL_SERVER_ERROR, "counter overflow"),
        CounterError::AlreadyExists { .. } => response_internal_error(),
    }
}

pub fn response_timeout() -> HttpResponse {
    error_response(StatusCode::GATEWAY_TIMEOUT, "invocation timed out")
}

pub fn response_internal_error() -> HttpResponse {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

pub fn response_method_not_allowed() -> HttpResponse {
    error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

pub fn response_preflight() -> HttpResponse {
    HttpResponse::new().with_status(StatusCode::NO_CONTENT).with_cors()
}

fn error_response(status: StatusCode, message: &str) -> HttpResponse {
    let response = HttpResponse::new().with_status(status).with_cors();
    match response.clone().with_json(&ErrorBody::new(message)) {
        Ok(v) => v,
        Err(err) => {
            error!("failed to render error response: {err:?}");
            response.with_body(format!("{message}.\n"))
        }
    }
}

use {
    std::{sync::Arc, time::Duration},
    tokio::net::TcpListener,
    hyper::server::conn::http1,
    hyper_util::rt::{TokioIo, TokioTimer},
    tracing::{info, error},
    thiserror::Error,
    crate::{
        handler::VisitorHandler,
        metrics::{Metrics, run_metrics_server},
        server::{config::ServerConfig, http::HttpHandler},
    },
};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind tcp listener for http server: {0:?}")]
    FailedToBind(std::io::Error),
}

pub struct VisitorServer {
    config: ServerConfig,
    handler: Arc<VisitorHandler>,
}

impl VisitorServer {
    pub fn new(config: ServerConfig, metrics: Metrics) -> Self {
        let handler = VisitorHandler::new(config.storage.clone(), config.counter.clone(), metrics);
        Self::with_handler(config, Arc::new(handler))
    }

    pub fn with_handler(config: ServerConfig, handler: Arc<VisitorHandler>) -> Self {
        Self {
            config,
            handler,
        }
    }

    pub async fn serve(self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.listen).await
            .map_err(ServerError::FailedToBind)?;
        self.serve_on(listener).await;
        Ok(())
    }

    /// Accepts connections until ctrl-c.
    pub async fn serve_on(self, listener: TcpListener) {
        if let Some(metrics_port) = self.config.metrics_port {
            tokio::spawn(run_metrics_server(self.handler.metrics().clone(), metrics_port));
        }

        let http_handler = Arc::new(HttpHandler::new(self.handler.clone(), self.config.invocation_timeout()));
        let graceful = hyper_util::server::graceful::GracefulShutdown::new();

        match listener.local_addr() {
            Ok(addr) => info!("started http server on {addr:?}"),
            Err(err) => error!("failed to get local address of http server: {err:?}"),
        }

        loop {
            tokio::select! {
                connection = listener.accept() => {
                    let (tcp, _) = match connection {
                        Ok(v) => v,
                        Err(err) => {
                            error!("failed to accept http connection: {err:?}");
                            continue;
                        }
                    };
                    let io = TokioIo::new(tcp);

                    let conn = http1::Builder::new()
                        .timer(TokioTimer::new())
                        .serve_connection(io, http_handler.clone());
                    let conn = graceful.watch(conn);

                    tokio::spawn(async move {
                        if let Err(err) = conn.await {
                            error!("error while handling http request: {err:?}");
                        }
                    });
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("received ctrl-c, stopping http server.");
                    break;
                }
            }
        }

        tokio::select! {
            _ = graceful.shutdown() => info!("all http connections closed."),
            _ = tokio::time::sleep(Duration::from_secs(10)) => error!("timed out waiting for http connections to close."),
        }
    }
}

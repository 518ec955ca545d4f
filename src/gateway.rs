use std::future::{Future, IntoFuture};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::{Config, DispatchConfig};
use crate::queue::DispatchQueue;
use crate::receiver::{self, ReceiverState};
use crate::router::CommandRouter;
use crate::secret::Secret;
use crate::worker::{DispatchStats, WorkerPool};

/// What the gateway needs from the configuration.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub path_secret: Secret,
    pub header_secret: Option<Secret>,
    pub serve_page: bool,
    pub dispatch: DispatchConfig,
}

impl GatewaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            path_secret: config.webhook.path_secret.clone(),
            header_secret: config.webhook.header_secret.clone(),
            serve_page: config.webapp.serve_page,
            dispatch: config.dispatch.clone(),
        }
    }
}

/// Receiver, queue and worker pool wired together. Built once in `main` and
/// consumed by [`Gateway::serve`].
pub struct Gateway {
    settings: GatewaySettings,
    queue: Arc<DispatchQueue>,
    router: Arc<CommandRouter>,
    stats: Arc<DispatchStats>,
}

impl Gateway {
    pub fn new(settings: GatewaySettings, router: CommandRouter) -> Self {
        let queue = Arc::new(DispatchQueue::new(
            settings.dispatch.queue_capacity,
            settings.dispatch.overflow,
        ));
        Self {
            settings,
            queue,
            router: Arc::new(router),
            stats: Arc::new(DispatchStats::default()),
        }
    }

    pub fn http_router(&self) -> axum::Router {
        receiver::build_router(ReceiverState {
            queue: self.queue.clone(),
            path_secret: self.settings.path_secret.clone(),
            header_secret: self.settings.header_secret.clone(),
            serve_page: self.settings.serve_page,
        })
    }

    /// Serve until `shutdown` resolves, then drain the queue.
    ///
    /// Order: stop accepting HTTP, close the queue, give workers the grace
    /// period to finish what was already acknowledged. In-flight HTTP requests
    /// get the same grace period before their connections are dropped.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let dispatch = &self.settings.dispatch;
        let pool = WorkerPool::spawn(
            dispatch.workers,
            self.queue.clone(),
            self.router.clone(),
            self.stats.clone(),
        );

        let addr = listener.local_addr().context("Listener has no local address")?;
        info!(
            "Webhook gateway listening on http://{} (queue capacity {}, overflow {}, {} worker(s), {} route(s))",
            addr,
            self.queue.capacity(),
            dispatch.overflow,
            dispatch.workers,
            self.router.route_count()
        );

        let grace = dispatch.shutdown_grace();
        let (signalled_tx, signalled_rx) = oneshot::channel::<()>();
        let server = axum::serve(listener, self.http_router())
            .with_graceful_shutdown(async move {
                shutdown.await;
                let _ = signalled_tx.send(());
            })
            .into_future();
        let deadline = async move {
            match signalled_rx.await {
                Ok(()) => tokio::time::sleep(grace).await,
                Err(_) => std::future::pending::<()>().await,
            }
        };

        let served = tokio::select! {
            result = server => result.context("Server error"),
            () = deadline => {
                warn!("HTTP connections still open after {:?}, dropping them", grace);
                Ok(())
            }
        };

        if !self.queue.is_empty() {
            info!(
                "HTTP server stopped, draining {} queued update(s)",
                self.queue.len()
            );
        }
        self.queue.close();
        pool.shutdown(grace).await;

        info!(
            "Gateway stopped: {} accepted, {} rejected, {} evicted, {} processed ({} handled, {} failed, {} unrouted, {} ignored)",
            self.queue.accepted(),
            self.queue.rejected(),
            self.queue.evicted(),
            self.stats.processed(),
            self.stats.handled(),
            self.stats.failed(),
            self.stats.unrouted(),
            self.stats.ignored()
        );
        served
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use crate::event::tests::text_update;
    use crate::router::tests::Probe;
    use crate::router::RouteKey;
    use crate::event::InboundEvent;
    use crate::router::Handler;
    use async_trait::async_trait;
    use std::time::{Duration, Instant};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    struct Slow;

    #[async_trait]
    impl Handler for Slow {
        async fn handle(&self, _event: &InboundEvent) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    fn settings(capacity: usize, workers: usize) -> GatewaySettings {
        settings_with_grace(capacity, workers, 2)
    }

    fn settings_with_grace(capacity: usize, workers: usize, grace_secs: u64) -> GatewaySettings {
        GatewaySettings {
            path_secret: Secret::new("gateway-test-secret"),
            header_secret: None,
            serve_page: false,
            dispatch: DispatchConfig {
                queue_capacity: capacity,
                workers,
                overflow: OverflowPolicy::RejectNewest,
                shutdown_grace_secs: grace_secs,
            },
        }
    }

    #[tokio::test]
    async fn test_end_to_end_over_http() {
        let text = Arc::new(Probe::default());
        let mut router = CommandRouter::new();
        router.register(RouteKey::Text, text.clone()).unwrap();

        let gateway = Gateway::new(settings(16, 2), router);
        let stats = gateway.stats.clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(gateway.serve(listener, async {
            let _ = stop_rx.await;
        }));

        {
            let client = reqwest::Client::new();
            for id in 1..=5 {
                let resp = client
                    .post(format!("http://{}/webhook/gateway-test-secret", addr))
                    .json(&text_update(id, "hello"))
                    .send()
                    .await
                    .unwrap();
                assert_eq!(resp.status(), reqwest::StatusCode::OK);
            }
            let resp = client
                .get(format!("http://{}/health", addr))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.text().await.unwrap(), "OK");
        }

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(text.calls(), 5);
        assert_eq!(stats.handled(), 5);
    }

    #[tokio::test]
    async fn test_http_router_shares_queue() {
        use axum::body::Body;
        use axum::http::{Request, StatusCode};
        use tower::ServiceExt;

        let gateway = Gateway::new(settings(1, 1), CommandRouter::new());
        let body = serde_json::to_string(&text_update(1, "hi")).unwrap();
        let req = Request::builder()
            .method("POST")
            .uri("/webhook/gateway-test-secret")
            .body(Body::from(body))
            .unwrap();
        let resp = gateway.http_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(gateway.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_ack_does_not_wait_for_slow_handler() {
        let mut router = CommandRouter::new();
        router.register(RouteKey::Text, Arc::new(Slow)).unwrap();

        let gateway = Gateway::new(settings_with_grace(16, 1, 1), router);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(gateway.serve(listener, async {
            let _ = stop_rx.await;
        }));

        {
            let client = reqwest::Client::new();
            for id in 1..=3 {
                let started = Instant::now();
                let resp = client
                    .post(format!("http://{}/webhook/gateway-test-secret", addr))
                    .json(&text_update(id, "slow"))
                    .send()
                    .await
                    .unwrap();
                assert_eq!(resp.status(), reqwest::StatusCode::OK);
                assert!(started.elapsed() < Duration::from_secs(2));
            }
        }

        // The handler sleeps far longer than the grace period; shutdown
        // still returns once the grace period is over.
        let started = Instant::now();
        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_stalled_request_does_not_block_shutdown() {
        let gateway = Gateway::new(settings_with_grace(4, 1, 1), CommandRouter::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(gateway.serve(listener, async {
            let _ = stop_rx.await;
        }));

        // Headers promise a body that never arrives.
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"POST /webhook/gateway-test-secret HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: 1000\r\n\r\n{",
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("shutdown blocked by an open request")
            .unwrap()
            .unwrap();
        drop(stream);
    }
}

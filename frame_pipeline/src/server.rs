use crate::{config::ServerConfig, routes::api_routes, stream::StreamSink, telemetry::Metrics};
use axum::Router;
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};

#[derive(Clone)]
pub struct SharedState {
    pub metrics: Arc<Metrics>,
    /// Present only when the stream sink is selected.
    pub stream: Option<StreamSink>,
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(config: &ServerConfig, state: SharedState) -> anyhow::Result<Self> {
        let addr = config.get_address();
        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        let router = Router::new()
            .merge(api_routes())
            .with_state(state)
            .layer(metrics_layer);

        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(
        self,
        shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn({
            let mut shutdown_rx = shutdown_rx.resubscribe();
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        shutdown_rx.recv().await.ok();
                    })
                    .await?;
                Ok(())
            }
        });

        Ok(server_handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::tests::bgr_frame, config::tests, sink::FrameSink};
    use std::time::Duration;
    use tokio::sync::broadcast;

    type Running = (String, broadcast::Sender<()>, JoinHandle<anyhow::Result<()>>);

    async fn start(stream: Option<StreamSink>) -> Running {
        let mut config = tests::parse(tests::BASE);
        config.server.port = 0;
        let state = SharedState {
            metrics: Arc::new(Metrics::new().unwrap()),
            stream,
        };
        let server = HttpServer::new(&config.server, state).await.unwrap();
        let url = format!("http://{}", server.local_addr().unwrap());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = server.run(shutdown_rx).await.unwrap();
        (url, shutdown_tx, handle)
    }

    #[tokio::test]
    async fn test_health_reports_available() {
        let (url, shutdown, handle) = start(None).await;

        let body: serde_json::Value = reqwest::get(format!("{}/health", url))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, serde_json::json!({"status": "Available"}));

        shutdown.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_metrics_are_exposed_as_text() {
        let (url, _shutdown, _handle) = start(None).await;

        let response = reqwest::get(format!("{}/metrics", url)).await.unwrap();

        assert!(response.status().is_success());
    }

    #[tokio::test]
    async fn test_video_feed_without_stream_sink_is_not_found() {
        let (url, _shutdown, _handle) = start(None).await;

        let response = reqwest::get(format!("{}/video_feed", url)).await.unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_video_feed_streams_multipart_frames() {
        let config = tests::parse(tests::BASE);
        let sink = StreamSink::new(&config.sink, Arc::new(Metrics::new().unwrap()));
        sink.send(&bgr_frame(8, 8, 0)).unwrap();
        let (url, _shutdown, _handle) = start(Some(sink)).await;

        let mut response = reqwest::get(format!("{}/video_feed", url)).await.unwrap();
        assert_eq!(
            response.headers()["content-type"],
            "multipart/x-mixed-replace; boundary=frame"
        );

        let chunk = tokio::time::timeout(Duration::from_secs(2), response.chunk())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(chunk.starts_with(b"--frame\r\n"));
    }
}

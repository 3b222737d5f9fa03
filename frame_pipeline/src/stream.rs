use crate::{
    codec::FrameEnvelope,
    config::SinkConfig,
    sink::{FrameSink, SinkError},
    telemetry::Metrics,
};
use bytes::Bytes;
use futures::stream;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::watch, time::sleep};
use tracing::instrument;

pub const FRAME_BOUNDARY: &str = "frame";

#[derive(Error, Debug)]
pub enum VideoStreamError {
    #[error("Stream sink is not enabled")]
    Disabled,
    #[error("Http builder error: {0}")]
    HttpBuilderError(String),
}

/// Keeps the newest annotated frame as JPEG and serves it to every connected viewer.
#[derive(Clone)]
pub struct StreamSink {
    latest: Arc<watch::Sender<Option<Bytes>>>,
    closed: Arc<AtomicBool>,
    jpeg_quality: u8,
    frame_interval: Duration,
    metrics: Arc<Metrics>,
}

impl StreamSink {
    pub fn new(config: &SinkConfig, metrics: Arc<Metrics>) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            latest: Arc::new(latest),
            closed: Arc::new(AtomicBool::new(false)),
            jpeg_quality: config.jpeg_quality,
            frame_interval: config.frame_interval(),
            metrics,
        }
    }

    /// Ends every open stream so graceful shutdown does not wait on viewers.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    #[instrument(skip(self))]
    pub fn generate_stream(&self) -> impl futures::Stream<Item = Result<Bytes, VideoStreamError>> {
        let viewer = ViewerGuard::new(self.metrics.clone());
        let latest = self.latest.subscribe();
        let closed = self.closed.clone();
        let interval = self.frame_interval;

        stream::unfold((latest, viewer), move |(latest, viewer)| {
            let closed = closed.clone();
            async move {
                loop {
                    sleep(interval).await;
                    if closed.load(Ordering::Relaxed) {
                        return None;
                    }
                    let frame = latest.borrow().clone();
                    if let Some(frame) = frame {
                        let part = Ok::<_, VideoStreamError>(multipart_part(&frame));
                        return Some((part, (latest, viewer)));
                    }
                }
            }
        })
    }
}

impl FrameSink for StreamSink {
    fn send(&self, frame: &FrameEnvelope) -> Result<(), SinkError> {
        let jpeg = frame.to_jpeg(self.jpeg_quality)?;
        self.latest.send_replace(Some(Bytes::from(jpeg)));
        self.metrics.record_frame_published();
        Ok(())
    }

    fn flush(&self, _timeout: Duration) -> Result<(), SinkError> {
        Ok(())
    }
}

fn multipart_part(jpeg: &[u8]) -> Bytes {
    let part_header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        FRAME_BOUNDARY,
        jpeg.len()
    );
    let mut body = part_header.into_bytes();
    body.extend_from_slice(jpeg);
    body.extend_from_slice(b"\r\n");
    Bytes::from(body)
}

struct ViewerGuard {
    metrics: Arc<Metrics>,
}

impl ViewerGuard {
    fn new(metrics: Arc<Metrics>) -> Self {
        metrics.record_viewer_connected();
        tracing::info!("Stream viewer connected");
        Self { metrics }
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.metrics.record_viewer_disconnected();
        tracing::info!("Stream viewer disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::bgr_frame;
    use futures::StreamExt;
    use prometheus::{Encoder, TextEncoder};
    use std::time::Instant;
    use tokio::time::timeout;

    fn stream_sink() -> StreamSink {
        let config = SinkConfig {
            frame_interval_ms: 1,
            ..crate::config::tests::parse(crate::config::tests::BASE).sink
        };
        StreamSink::new(&config, Arc::new(Metrics::new().unwrap()))
    }

    fn connected_viewers(metrics: &Metrics) -> f64 {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metrics.registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let line = text
            .lines()
            .find(|line| line.starts_with("stream_viewers"))
            .unwrap();
        line.rsplit(' ').next().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn test_viewer_receives_latest_frame_as_jpeg_part() {
        let sink = stream_sink();
        sink.send(&bgr_frame(8, 8, 100)).unwrap();

        let stream = sink.generate_stream();
        futures::pin_mut!(stream);
        let part = timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let header = b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: ";
        assert!(part.starts_with(header));
        let body_start = part.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        assert_eq!(&part[body_start..body_start + 2], &[0xFF, 0xD8]);
        assert!(part.ends_with(b"\r\n"));
    }

    #[tokio::test]
    async fn test_viewer_waits_for_first_frame() {
        let sink = stream_sink();
        let stream = sink.generate_stream();
        futures::pin_mut!(stream);

        assert!(timeout(Duration::from_millis(30), stream.next()).await.is_err());

        sink.send(&bgr_frame(8, 8, 0)).unwrap();
        let part = timeout(Duration::from_secs(2), stream.next()).await.unwrap();
        assert!(part.is_some());
    }

    #[tokio::test]
    async fn test_close_ends_open_streams() {
        let sink = stream_sink();
        sink.send(&bgr_frame(8, 8, 0)).unwrap();
        let stream = sink.generate_stream();
        futures::pin_mut!(stream);

        sink.close();

        let next = timeout(Duration::from_secs(2), stream.next()).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_idle_viewer_does_not_hold_back_ingestion() {
        let sink = stream_sink();
        let _idle = sink.generate_stream();
        let active = sink.generate_stream();
        futures::pin_mut!(active);

        let started = Instant::now();
        for fill in 0..50 {
            sink.send(&bgr_frame(8, 8, fill)).unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        let part = timeout(Duration::from_secs(2), active.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let newest = bgr_frame(8, 8, 49).to_jpeg(sink.jpeg_quality).unwrap();
        assert_eq!(part, multipart_part(&newest));
    }

    #[tokio::test]
    async fn test_disconnect_leaves_other_viewers_streaming() {
        let sink = stream_sink();
        sink.send(&bgr_frame(8, 8, 0)).unwrap();
        let first = sink.generate_stream();
        let second = sink.generate_stream();
        futures::pin_mut!(second);
        assert_eq!(connected_viewers(&sink.metrics), 2.0);

        drop(first);

        assert_eq!(connected_viewers(&sink.metrics), 1.0);
        for _ in 0..3 {
            let part = timeout(Duration::from_secs(2), second.next()).await.unwrap();
            assert!(matches!(part, Some(Ok(_))));
        }
    }
}

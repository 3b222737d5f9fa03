use crate::{
    config::{Config, SinkConfig, SinkKind},
    consumer::{LatestOffsetConsumer, ReseekPolicy},
    kafka::{KafkaConsumer, KafkaProducer},
    pipeline::{stop_and_flush, Pipeline},
    registry::WorkerRegistry,
    server::{HttpServer, SharedState},
    sink::{drain_delivery_reports, FrameSink, RepublishSink},
    stream::StreamSink,
    supervisor::{RestartPolicy, Supervisor},
    telemetry::Metrics,
};
use anyhow::Context;
use parking_lot::Mutex;
use std::sync::{atomic::AtomicBool, Arc};
use tokio::{
    signal,
    sync::{broadcast, mpsc},
};

const DELIVERY_REPORT_CAPACITY: usize = 1024;

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new()?);
    let (shutdown_tx, _) = broadcast::channel(1);
    let supervisor = Supervisor::new(
        RestartPolicy::from(&config.supervisor),
        metrics.clone(),
        shutdown_tx.clone(),
    );

    let registry = WorkerRegistry::from_config(&config, &supervisor, metrics.clone())
        .context("Failed to initialize models")?;
    if registry.is_empty() {
        tracing::warn!("No models configured, frames are forwarded without overlay");
    }

    let (sink, stream): (Box<dyn FrameSink>, Option<StreamSink>) = match config.sink.kind {
        SinkKind::Stream => {
            let stream = StreamSink::new(&config.sink, metrics.clone());
            (Box::new(stream.clone()), Some(stream))
        }
        SinkKind::Republish => {
            let topic = config
                .broker
                .output_topic
                .as_deref()
                .context("The republish sink needs broker.output_topic")?;
            let (reports_tx, reports_rx) = mpsc::channel(DELIVERY_REPORT_CAPACITY);
            let producer = KafkaProducer::new(&config.broker, reports_tx)
                .context("Failed to create broker producer")?;
            tokio::spawn(drain_delivery_reports(reports_rx, metrics.clone()));
            let sink = RepublishSink::new(producer, topic, &config.sink.key, metrics.clone());
            (Box::new(sink), None)
        }
        SinkKind::Display => (display_sink(&config.sink, metrics.clone())?, None),
    };

    let client = KafkaConsumer::new(&config.broker).context("Failed to create broker consumer")?;
    let consumer = LatestOffsetConsumer::new(
        client,
        &[config.broker.input_topic.clone()],
        ReseekPolicy::from(&config.consumer),
        metrics.clone(),
    )?;

    // Lives outside the supervised closure so a restart resumes with the same client and models.
    let consume = Arc::new(Mutex::new((consumer, Pipeline::new(registry, sink))));
    let stop = Arc::new(AtomicBool::new(false));
    let poll_timeout = config.consumer.poll_timeout();

    let consume_handle = supervisor.supervise_blocking("consumer", {
        let consume = consume.clone();
        let stop = stop.clone();
        move || {
            let mut guard = consume.lock();
            let (consumer, pipeline) = &mut *guard;
            consumer.run(pipeline, poll_timeout, &stop);
            Ok(())
        }
    });

    let state = SharedState {
        metrics: metrics.clone(),
        stream: stream.clone(),
    };
    let server = HttpServer::new(&config.server, state).await?;
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    if let Some(stream) = &stream {
        stream.close();
    }
    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    stop_and_flush(
        consume,
        &stop,
        consume_handle,
        config.sink.flush_timeout(),
        poll_timeout,
    )
    .await;

    Ok(())
}

#[cfg(feature = "camera")]
fn display_sink(
    config: &SinkConfig,
    metrics: Arc<Metrics>,
) -> anyhow::Result<Box<dyn FrameSink>> {
    let window = crate::camera::Window::new(&config.window_name, config.jpeg_quality);
    Ok(Box::new(crate::display::DisplaySink::new(window, metrics)))
}

#[cfg(not(feature = "camera"))]
fn display_sink(
    _config: &SinkConfig,
    _metrics: Arc<Metrics>,
) -> anyhow::Result<Box<dyn FrameSink>> {
    anyhow::bail!("The display sink needs the camera feature")
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

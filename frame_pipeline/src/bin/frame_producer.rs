use anyhow::Context;
use frame_pipeline::{
    app::shutdown_signal,
    broker::BrokerProducer,
    camera::Camera,
    capture::CaptureLoop,
    config,
    kafka::KafkaProducer,
    sink::drain_delivery_reports,
    telemetry::Metrics,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::get_configuration().context("Failed to load configuration")?;
    let log_level = &format!("{},rdkafka=info", config.log_level.as_str());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_level(true))
        .init();

    let metrics = Arc::new(Metrics::new()?);
    let (reports_tx, reports_rx) = mpsc::channel(1024);
    let producer =
        KafkaProducer::new(&config.broker, reports_tx).context("Failed to create broker producer")?;
    tokio::spawn(drain_delivery_reports(reports_rx, metrics));

    let camera = Camera::open(config.capture.device)?;
    let mut capture = CaptureLoop::new(
        camera,
        producer,
        &config.broker.input_topic,
        &config.sink.key,
        config.capture.frame_interval(),
    );

    let stop = Arc::new(AtomicBool::new(false));
    tokio::spawn({
        let stop = stop.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, stopping capture.");
            stop.store(true, Ordering::Relaxed);
        }
    });

    let flush_timeout = config.sink.flush_timeout();
    tokio::task::spawn_blocking(move || {
        let result = capture.run(&stop);
        if let Err(e) = capture.producer().flush(flush_timeout) {
            tracing::error!("Failed to flush producer: {}", e);
        }
        result
    })
    .await??;

    Ok(())
}

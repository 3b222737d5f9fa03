use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider, UpDownCounter},
    KeyValue,
};
use prometheus::Registry;

pub struct Metrics {
    frames_consumed: Counter<u64>,
    frames_dropped: Counter<u64>,
    frames_published: Counter<u64>,
    decode_failures: Counter<u64>,
    reseeks: Counter<u64>,
    messages_skipped: Counter<u64>,
    task_restarts: Counter<u64>,
    delivery_failures: Counter<u64>,
    inference_duration: Histogram<u64>,
    stream_viewers: UpDownCounter<i64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("frame_pipeline");
        global::set_meter_provider(provider);

        let boundaries = latency_boundaries(5.0, 12);

        Ok(Metrics {
            frames_consumed: meter
                .u64_counter("frames_consumed_total")
                .with_description("Frames decoded from the input topic")
                .build(),
            frames_dropped: meter
                .u64_counter("frames_dropped_total")
                .with_description("Frames shed because a model was still busy")
                .build(),
            frames_published: meter
                .u64_counter("frames_published_total")
                .with_description("Annotated frames handed to the output sink")
                .build(),
            decode_failures: meter
                .u64_counter("decode_failures_total")
                .with_description("Messages skipped because the envelope was malformed")
                .build(),
            reseeks: meter
                .u64_counter("reseeks_total")
                .with_description("Partitions moved to their high watermark")
                .build(),
            messages_skipped: meter
                .u64_counter("messages_skipped_total")
                .with_description("Backlog messages discarded by reseeks")
                .build(),
            task_restarts: meter
                .u64_counter("task_restarts_total")
                .with_description("Supervised task restarts")
                .build(),
            delivery_failures: meter
                .u64_counter("delivery_failures_total")
                .with_description("Republished frames the broker failed to deliver")
                .build(),
            inference_duration: meter
                .u64_histogram("inference_duration_ms")
                .with_boundaries(boundaries)
                .with_description("Duration of remote inference calls in milliseconds")
                .build(),
            stream_viewers: meter
                .i64_up_down_counter("stream_viewers")
                .with_description("Currently connected stream viewers")
                .build(),
            registry,
        })
    }

    pub fn record_frame_consumed(&self) {
        self.frames_consumed.add(1, &[]);
    }

    pub fn record_frame_dropped(&self, model: &str) {
        let attributes = vec![KeyValue::new("model", model.to_string())];
        self.frames_dropped.add(1, &attributes);
    }

    pub fn record_frame_published(&self) {
        self.frames_published.add(1, &[]);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.add(1, &[]);
    }

    pub fn record_reseek(&self, skipped: u64) {
        self.reseeks.add(1, &[]);
        self.messages_skipped.add(skipped, &[]);
    }

    pub fn record_task_restart(&self, task: &str) {
        let attributes = vec![KeyValue::new("task", task.to_string())];
        self.task_restarts.add(1, &attributes);
    }

    pub fn record_delivery_failure(&self) {
        self.delivery_failures.add(1, &[]);
    }

    pub fn record_inference_duration(&self, duration_ms: u64, model: &str) {
        let attributes = vec![KeyValue::new("model", model.to_string())];
        self.inference_duration.record(duration_ms, &attributes);
    }

    pub fn record_viewer_connected(&self) {
        self.stream_viewers.add(1, &[]);
    }

    pub fn record_viewer_disconnected(&self) {
        self.stream_viewers.add(-1, &[]);
    }
}

/// Doubling buckets from `first_ms`, wide enough for remote calls that run into their timeout.
fn latency_boundaries(first_ms: f64, count: usize) -> Vec<f64> {
    std::iter::successors(Some(first_ms), |bound| Some(bound * 2.0))
        .take(count)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_boundaries_double() {
        assert_eq!(latency_boundaries(5.0, 5), vec![5.0, 10.0, 20.0, 40.0, 80.0]);
        assert_eq!(latency_boundaries(5.0, 12).last(), Some(&10240.0));
    }
}

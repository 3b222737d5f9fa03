use crate::{
    codec::{CodecError, FrameEnvelope},
    sink::{FrameSink, SinkError},
    telemetry::Metrics,
};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("Failed to prepare frame for display: {0}")]
    Codec(#[from] CodecError),
    #[error("Display backend error: {0}")]
    Backend(String),
}

/// A local window annotated frames are pushed to.
pub trait FrameDisplay: Send {
    fn show(&mut self, frame: &FrameEnvelope) -> Result<(), DisplayError>;
}

/// Shows every annotated frame on a local display.
pub struct DisplaySink<D> {
    display: Mutex<D>,
    metrics: Arc<Metrics>,
}

impl<D: FrameDisplay> DisplaySink<D> {
    pub fn new(display: D, metrics: Arc<Metrics>) -> Self {
        Self {
            display: Mutex::new(display),
            metrics,
        }
    }
}

impl<D: FrameDisplay> FrameSink for DisplaySink<D> {
    fn send(&self, frame: &FrameEnvelope) -> Result<(), SinkError> {
        self.display.lock().show(frame)?;
        self.metrics.record_frame_published();
        Ok(())
    }

    fn flush(&self, _timeout: Duration) -> Result<(), SinkError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::{tests::bgr_frame, PixelType},
        config::OverlayConfig,
        consumer::FrameHandler,
        overlay::OverlayStyle,
        pipeline::Pipeline,
        registry::{tests::ScriptedHandler, WorkerRegistry},
    };

    #[derive(Clone, Default)]
    struct RecordingDisplay {
        shown: Arc<Mutex<Vec<FrameEnvelope>>>,
    }

    impl FrameDisplay for RecordingDisplay {
        fn show(&mut self, frame: &FrameEnvelope) -> Result<(), DisplayError> {
            if frame.pixel_type() != PixelType::CV_8UC3 {
                return Err(DisplayError::Backend("window expects BGR".into()));
            }
            self.shown.lock().push(frame.clone());
            Ok(())
        }
    }

    fn display_sink() -> (DisplaySink<RecordingDisplay>, RecordingDisplay) {
        let display = RecordingDisplay::default();
        let metrics = Arc::new(Metrics::new().unwrap());
        (DisplaySink::new(display.clone(), metrics), display)
    }

    #[test]
    fn test_frames_are_pushed_to_the_window() {
        let (sink, display) = display_sink();
        let frame = bgr_frame(4, 4, 9);

        sink.send(&frame).unwrap();

        assert_eq!(*display.shown.lock(), vec![frame]);
    }

    #[test]
    fn test_backend_failure_surfaces_as_sink_error() {
        let (sink, display) = display_sink();
        let grey = FrameEnvelope::new(vec![0u8; 4], 2, 2, PixelType::CV_8UC1).unwrap();

        let err = sink.send(&grey).unwrap_err();

        assert!(matches!(err, SinkError::Display(DisplayError::Backend(_))));
        assert!(display.shown.lock().is_empty());
    }

    #[test]
    fn test_pipeline_shows_annotated_frames() {
        let (sink, display) = display_sink();
        let mut registry = WorkerRegistry::new(OverlayStyle::from(&OverlayConfig::default()));
        registry.register(Box::new(ScriptedHandler::new("imagenet", &[Some("cat")])));
        let mut pipeline = Pipeline::new(registry, sink);
        let frame = bgr_frame(60, 200, 0);

        pipeline.handle(frame.clone());

        let shown = display.shown.lock();
        assert_eq!(shown.len(), 1);
        assert_ne!(shown[0].pixels(), frame.pixels());
    }
}

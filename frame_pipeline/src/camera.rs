use crate::{
    capture::{CaptureError, FrameSource},
    codec::{FrameEnvelope, PixelType},
    display::{DisplayError, FrameDisplay},
};
use opencv::{
    core::{Mat, Vector},
    highgui, imgcodecs,
    prelude::*,
    videoio,
};

fn device_error(err: opencv::Error) -> CaptureError {
    CaptureError::Device(err.to_string())
}

/// Local capture device read through OpenCV.
pub struct Camera {
    capture: videoio::VideoCapture,
}

impl Camera {
    pub fn open(device: i32) -> Result<Self, CaptureError> {
        let capture = videoio::VideoCapture::new(device, videoio::CAP_ANY).map_err(device_error)?;
        if !capture.is_opened().map_err(device_error)? {
            return Err(CaptureError::Device(format!(
                "Failed to open capture device {}",
                device
            )));
        }
        tracing::info!("Opened capture device {}", device);
        Ok(Self { capture })
    }
}

impl FrameSource for Camera {
    fn read(&mut self) -> Result<Option<FrameEnvelope>, CaptureError> {
        let mut frame = Mat::default();
        if !self.capture.read(&mut frame).map_err(device_error)? || frame.empty() {
            return Ok(None);
        }

        let pixels = frame.data_bytes().map_err(device_error)?.to_vec();
        let envelope = FrameEnvelope::new(
            pixels,
            frame.rows(),
            frame.cols(),
            PixelType::from_code(frame.typ()),
        )?;
        Ok(Some(envelope))
    }
}

fn backend_error(err: opencv::Error) -> DisplayError {
    DisplayError::Backend(err.to_string())
}

/// HighGUI window that shows each pushed frame.
pub struct Window {
    name: String,
    jpeg_quality: u8,
}

impl Window {
    pub fn new(name: &str, jpeg_quality: u8) -> Self {
        Self {
            name: name.to_string(),
            jpeg_quality,
        }
    }
}

impl FrameDisplay for Window {
    fn show(&mut self, frame: &FrameEnvelope) -> Result<(), DisplayError> {
        let jpeg = frame.to_jpeg(self.jpeg_quality)?;
        let mat = imgcodecs::imdecode(&Vector::from_slice(&jpeg), imgcodecs::IMREAD_UNCHANGED)
            .map_err(backend_error)?;
        highgui::imshow(&self.name, &mat).map_err(backend_error)?;
        highgui::wait_key(1).map_err(backend_error)?;
        Ok(())
    }
}

impl Drop for Window {
    fn drop(&mut self) {
        if let Err(e) = highgui::destroy_window(&self.name) {
            tracing::debug!("Failed to close window {}: {}", self.name, e);
        }
    }
}

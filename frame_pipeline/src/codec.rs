use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use image::{codecs::jpeg::JpegEncoder, ExtendedColorType};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const CN_SHIFT: i32 = 3;
const CN_MAX: i32 = 512;
const DEPTH_MASK: i32 = 7;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Invalid frame shape {rows}x{cols}")]
    InvalidShape { rows: i32, cols: i32 },
    #[error("Frame shape {rows}x{cols}x{channels} does not fit in memory")]
    ShapeOverflow { rows: i32, cols: i32, channels: i32 },
    #[error("Envelope declares {declared} channels but pixel type {code} carries {implied}")]
    ChannelMismatch { declared: i32, implied: i32, code: i32 },
    #[error("Pixel buffer holds {actual} bytes, shape requires {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("Pixel type {0} cannot be encoded as JPEG")]
    UnsupportedPixelType(i32),
    #[error("Failed to encode JPEG: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// Sample depth carried in the low bits of a pixel type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    U8,
    I8,
    U16,
    I16,
    I32,
    F32,
    F64,
    F16,
}

impl Depth {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Depth::U8 | Depth::I8 => 1,
            Depth::U16 | Depth::I16 | Depth::F16 => 2,
            Depth::I32 | Depth::F32 => 4,
            Depth::F64 => 8,
        }
    }
}

/// OpenCV-style `CV_<depth>C<n>` pixel format code.
///
/// The code is carried verbatim across the wire so producers and consumers agree on it even
/// when this process only understands a subset of the formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelType(i32);

impl PixelType {
    pub const CV_8UC1: PixelType = PixelType(0);
    pub const CV_8UC3: PixelType = PixelType(16);
    pub const CV_8UC4: PixelType = PixelType(24);

    pub fn from_code(code: i32) -> Self {
        PixelType(code)
    }

    pub fn code(self) -> i32 {
        self.0
    }

    pub fn depth(self) -> Depth {
        match self.0 & DEPTH_MASK {
            0 => Depth::U8,
            1 => Depth::I8,
            2 => Depth::U16,
            3 => Depth::I16,
            4 => Depth::I32,
            5 => Depth::F32,
            6 => Depth::F64,
            _ => Depth::F16,
        }
    }

    pub fn channels(self) -> i32 {
        ((self.0 >> CN_SHIFT) & (CN_MAX - 1)) + 1
    }

    pub fn bytes_per_sample(self) -> usize {
        self.depth().bytes_per_sample()
    }
}

/// A decoded frame: raw pixel rows plus the shape needed to interpret them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameEnvelope {
    pixels: Bytes,
    channels: i32,
    rows: i32,
    cols: i32,
    pixel_type: PixelType,
}

impl FrameEnvelope {
    pub fn new(
        pixels: impl Into<Bytes>,
        rows: i32,
        cols: i32,
        pixel_type: PixelType,
    ) -> Result<Self, CodecError> {
        Self::from_parts(pixels.into(), pixel_type.channels(), rows, cols, pixel_type)
    }

    fn from_parts(
        pixels: Bytes,
        channels: i32,
        rows: i32,
        cols: i32,
        pixel_type: PixelType,
    ) -> Result<Self, CodecError> {
        if rows <= 0 || cols <= 0 {
            return Err(CodecError::InvalidShape { rows, cols });
        }
        if channels != pixel_type.channels() {
            return Err(CodecError::ChannelMismatch {
                declared: channels,
                implied: pixel_type.channels(),
                code: pixel_type.code(),
            });
        }
        let expected = (rows as usize)
            .checked_mul(cols as usize)
            .and_then(|n| n.checked_mul(channels as usize))
            .and_then(|n| n.checked_mul(pixel_type.bytes_per_sample()))
            .ok_or(CodecError::ShapeOverflow { rows, cols, channels })?;
        if pixels.len() != expected {
            return Err(CodecError::LengthMismatch {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            pixels,
            channels,
            rows,
            cols,
            pixel_type,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn channels(&self) -> i32 {
        self.channels
    }

    pub fn rows(&self) -> i32 {
        self.rows
    }

    pub fn cols(&self) -> i32 {
        self.cols
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    /// Returns a new envelope of the same shape backed by `pixels`.
    pub fn with_pixels(&self, pixels: Vec<u8>) -> Result<Self, CodecError> {
        Self::from_parts(
            pixels.into(),
            self.channels,
            self.rows,
            self.cols,
            self.pixel_type,
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let wire = WireEnvelopeRef {
            mat: &self.pixels,
            channels: self.channels,
            rows: self.rows,
            cols: self.cols,
            pixel_type: self.pixel_type.code(),
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let wire: WireEnvelope = serde_json::from_slice(payload)?;
        Self::from_parts(
            wire.mat.into(),
            wire.channels,
            wire.rows,
            wire.cols,
            PixelType::from_code(wire.pixel_type),
        )
    }

    /// Encodes 8-bit grey, BGR or BGRA frames as an RGB/grey JPEG.
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>, CodecError> {
        if self.pixel_type.depth() != Depth::U8 {
            return Err(CodecError::UnsupportedPixelType(self.pixel_type.code()));
        }
        let (data, color) = match self.channels {
            1 => (self.pixels.to_vec(), ExtendedColorType::L8),
            3 => (bgr_to_rgb(&self.pixels, 3), ExtendedColorType::Rgb8),
            4 => (bgr_to_rgb(&self.pixels, 4), ExtendedColorType::Rgb8),
            _ => return Err(CodecError::UnsupportedPixelType(self.pixel_type.code())),
        };

        let mut buffer = Vec::new();
        JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode(
            &data,
            self.cols as u32,
            self.rows as u32,
            color,
        )?;
        Ok(buffer)
    }
}

fn bgr_to_rgb(input: &[u8], stride: usize) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len() / stride * 3);
    for chunk in input.chunks_exact(stride) {
        output.push(chunk[2]);
        output.push(chunk[1]);
        output.push(chunk[0]);
    }
    output
}

#[derive(Serialize)]
struct WireEnvelopeRef<'a> {
    #[serde(serialize_with = "serialize_b64")]
    mat: &'a [u8],
    channels: i32,
    rows: i32,
    cols: i32,
    #[serde(rename = "type")]
    pixel_type: i32,
}

#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(deserialize_with = "deserialize_b64")]
    mat: Vec<u8>,
    channels: i32,
    rows: i32,
    cols: i32,
    #[serde(rename = "type")]
    pixel_type: i32,
}

fn serialize_b64<S>(bytes: &&[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&STANDARD.encode(bytes))
}

fn deserialize_b64<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    STANDARD.decode(s).map_err(serde::de::Error::custom)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn bgr_frame(rows: i32, cols: i32, fill: u8) -> FrameEnvelope {
        let pixels = vec![fill; (rows * cols * 3) as usize];
        FrameEnvelope::new(pixels, rows, cols, PixelType::CV_8UC3).unwrap()
    }

    #[test]
    fn test_envelope_round_trip() {
        let pixels: Vec<u8> = (0..4 * 6 * 3).map(|v| v as u8).collect();
        let frame = FrameEnvelope::new(pixels.clone(), 4, 6, PixelType::CV_8UC3).unwrap();

        let decoded = FrameEnvelope::decode(&frame.encode().unwrap()).unwrap();

        assert_eq!(decoded.rows(), 4);
        assert_eq!(decoded.cols(), 6);
        assert_eq!(decoded.channels(), 3);
        assert_eq!(decoded.pixel_type().code(), 16);
        assert_eq!(decoded.pixels(), pixels.as_slice());
    }

    #[test]
    fn test_unknown_type_code_survives_round_trip() {
        // 32-bit float, three channels
        let pixel_type = PixelType::from_code(21);
        let frame = FrameEnvelope::new(vec![0u8; 2 * 2 * 3 * 4], 2, 2, pixel_type).unwrap();

        let decoded = FrameEnvelope::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.pixel_type(), pixel_type);
        assert_eq!(decoded.pixel_type().depth(), Depth::F32);
    }

    #[test]
    fn test_decode_wire_field_names() {
        let payload = format!(
            r#"{{"mat":"{}","channels":1,"rows":1,"cols":2,"type":0}}"#,
            STANDARD.encode([7u8, 9u8])
        );
        let frame = FrameEnvelope::decode(payload.as_bytes()).unwrap();
        assert_eq!(frame.pixels(), &[7, 9]);

        let encoded: serde_json::Value = serde_json::from_slice(&frame.encode().unwrap()).unwrap();
        assert_eq!(encoded["type"], 0);
        assert_eq!(encoded["mat"], STANDARD.encode([7u8, 9u8]));
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        let payload = format!(
            r#"{{"mat":"{}","channels":3,"rows":2,"cols":2,"type":16}}"#,
            STANDARD.encode([0u8; 5])
        );
        match FrameEnvelope::decode(payload.as_bytes()) {
            Err(CodecError::LengthMismatch { expected, actual }) => {
                assert_eq!(expected, 12);
                assert_eq!(actual, 5);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_shape_too_large_to_address() {
        let payload =
            br#"{"mat":"","channels":16,"rows":1073741824,"cols":1073741824,"type":120}"#;

        assert!(matches!(
            FrameEnvelope::decode(payload),
            Err(CodecError::ShapeOverflow {
                rows: 1073741824,
                cols: 1073741824,
                channels: 16
            })
        ));
    }

    #[test]
    fn test_decode_rejects_channel_mismatch() {
        let payload = format!(
            r#"{{"mat":"{}","channels":1,"rows":1,"cols":1,"type":16}}"#,
            STANDARD.encode([0u8; 3])
        );
        assert!(matches!(
            FrameEnvelope::decode(payload.as_bytes()),
            Err(CodecError::ChannelMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            FrameEnvelope::decode(b"not json"),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_to_jpeg_emits_jpeg_magic() {
        let jpeg = bgr_frame(8, 8, 120).to_jpeg(80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_to_jpeg_rejects_float_frames() {
        let frame = FrameEnvelope::new(vec![0u8; 4 * 3 * 4], 2, 2, PixelType::from_code(21))
            .unwrap();
        assert!(matches!(
            frame.to_jpeg(80),
            Err(CodecError::UnsupportedPixelType(21))
        ));
    }
}

//! V4L2 camera capture via the `v4l` crate.
//!
//! MJPEG buffers are passed through as they arrive. Raw YUYV, GREY and
//! Y16 buffers are converted and re-encoded as binary PNM so every frame
//! in the slot is a self-describing image.

use crate::source::{CaptureError, FrameSource};
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use std::io::Cursor;
use std::path::Path;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const STREAM_BUFFERS: u32 = 4;

/// Pixel layouts the camera source can turn into frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Motion JPEG; each buffer is a complete JPEG.
    Mjpeg,
    /// YUYV 4:2:2 packed, converted to RGB.
    Yuyv,
    /// 8-bit grayscale (common for IR cameras).
    Grey,
    /// 16-bit little-endian grayscale, reduced to 8 bits.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"MJPG" => Some(Self::Mjpeg),
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }
}

/// A V4L2 capture device streaming through memory-mapped buffers.
pub struct CameraSource {
    name: String,
    width: u32,
    height: u32,
    format: PixelFormat,
    stream: MmapStream<'static>,
    // keeps the device open for the stream's lifetime
    _device: Device,
}

impl CameraSource {
    /// Open a device (e.g. "/dev/video0"), negotiate a format near
    /// `width` x `height` and start streaming.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CaptureError> {
        if !Path::new(device_path).exists() {
            return Err(CaptureError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path)
            .map_err(|e| CaptureError::DeviceNotFound(format!("{device_path}: {e}")))?;

        let caps = device
            .query_caps()
            .map_err(|e| CaptureError::CaptureFailed(format!("query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CaptureError::Unsupported(format!(
                "{device_path} is not a video capture device"
            )));
        }
        tracing::info!(device = device_path, driver = %caps.driver, card = %caps.card, "opened camera");

        // Prefer MJPEG; drivers answer with the closest format they support.
        let mut fmt = device
            .format()
            .map_err(|e| CaptureError::Unsupported(format!("get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"MJPG");
        fmt.width = width;
        fmt.height = height;
        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CaptureError::Unsupported(format!("set format: {e}")))?;

        let format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CaptureError::Unsupported(format!(
                "pixel format {:?} (need MJPG, YUYV, GREY or Y16)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CaptureError::CaptureFailed(format!("create mmap stream: {e}")))?;

        Ok(Self {
            name: device_path.to_string(),
            width: negotiated.width,
            height: negotiated.height,
            format,
            stream,
            _device: device,
        })
    }
}

impl FrameSource for CameraSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CaptureError::CaptureFailed(format!("dequeue buffer: {e}")))?;
        let used = match meta.bytesused as usize {
            0 => buf.len(),
            n => n.min(buf.len()),
        };
        encode_buffer(&buf[..used], self.format, self.width, self.height).map(Some)
    }
}

/// Turn one raw buffer into an encoded image.
pub fn encode_buffer(
    buf: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<Vec<u8>, CaptureError> {
    let pixels = width as usize * height as usize;
    let too_short = |need: usize| {
        CaptureError::CaptureFailed(format!(
            "{format:?} buffer too short: expected {need}, got {}",
            buf.len()
        ))
    };

    let image = match format {
        PixelFormat::Mjpeg => return Ok(buf.to_vec()),
        PixelFormat::Grey => {
            let data = buf.get(..pixels).ok_or_else(|| too_short(pixels))?;
            GrayImage::from_raw(width, height, data.to_vec()).map(DynamicImage::ImageLuma8)
        }
        PixelFormat::Y16 => {
            let data = buf.get(..pixels * 2).ok_or_else(|| too_short(pixels * 2))?;
            let gray = data.chunks_exact(2).map(|px| px[1]).collect();
            GrayImage::from_raw(width, height, gray).map(DynamicImage::ImageLuma8)
        }
        PixelFormat::Yuyv => {
            let data = buf.get(..pixels * 2).ok_or_else(|| too_short(pixels * 2))?;
            RgbImage::from_raw(width, height, yuyv_to_rgb(data)).map(DynamicImage::ImageRgb8)
        }
    }
    .ok_or_else(|| too_short(pixels))?;

    let mut out = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Pnm)
        .map_err(|e| CaptureError::CaptureFailed(format!("encode frame: {e}")))?;
    Ok(out)
}

/// BT.601 studio-range YUYV to packed RGB.
fn yuyv_to_rgb(yuyv: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(yuyv.len() / 2 * 3);
    for macro_px in yuyv.chunks_exact(4) {
        let (u, v) = (macro_px[1] as i32 - 128, macro_px[3] as i32 - 128);
        for y in [macro_px[0], macro_px[2]] {
            let c = 298 * (y as i32 - 16);
            rgb.push(((c + 409 * v + 128) >> 8).clamp(0, 255) as u8);
            rgb.push(((c - 100 * u - 208 * v + 128) >> 8).clamp(0, 255) as u8);
            rgb.push(((c + 516 * u + 128) >> 8).clamp(0, 255) as u8);
        }
    }
    rgb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_device_fails_fast() {
        let err = CameraSource::open("/dev/nonexistent-video", 640, 480).err().unwrap();
        assert!(matches!(err, CaptureError::DeviceNotFound(_)));
    }

    #[test]
    fn test_fourcc_mapping() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"Y16 ")), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"NV12")), None);
    }

    #[test]
    fn test_yuyv_black_and_white() {
        let rgb = yuyv_to_rgb(&[16, 128, 235, 128]);
        assert_eq!(rgb, vec![0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn test_raw_formats_encode_to_decodable_images() {
        let yuyv = [235u8, 128, 235, 128].repeat(4 * 3 / 2);
        let encoded = encode_buffer(&yuyv, PixelFormat::Yuyv, 4, 3).unwrap();
        let decoded = image::load_from_memory(&encoded).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (4, 3));
        assert_eq!(decoded.get_pixel(3, 2).0, [255, 255, 255]);

        let y16: Vec<u8> = (0..6).flat_map(|i: u8| [0xff, i * 10]).collect();
        let encoded = encode_buffer(&y16, PixelFormat::Y16, 3, 2).unwrap();
        let decoded = image::load_from_memory(&encoded).unwrap().to_luma8();
        assert_eq!(decoded.as_raw(), &vec![0, 10, 20, 30, 40, 50]);
    }

    #[test]
    fn test_short_buffer_is_capture_error() {
        let err = encode_buffer(&[0u8; 5], PixelFormat::Grey, 3, 2).unwrap_err();
        assert!(matches!(err, CaptureError::CaptureFailed(_)));
    }

    #[test]
    fn test_mjpeg_passes_through() {
        let jpeg = vec![0xff, 0xd8, 1, 2, 3];
        assert_eq!(encode_buffer(&jpeg, PixelFormat::Mjpeg, 640, 480).unwrap(), jpeg);
    }
}

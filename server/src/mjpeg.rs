//! Motion-JPEG framing for `multipart/x-mixed-replace` responses.

use bytes::{BufMut, Bytes, BytesMut};
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, ImageResult, Rgb, RgbImage};

pub const BOUNDARY: &str = "frame";
pub const JPEG_QUALITY: u8 = 80;

pub fn content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={BOUNDARY}")
}

pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> ImageResult<Vec<u8>> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode(
        frame.as_raw(),
        frame.width(),
        frame.height(),
        ColorType::Rgb8,
    )?;
    Ok(buf)
}

/// Black frame sent first so clients render something before synthesis starts.
pub fn placeholder(width: u32, height: u32) -> ImageResult<Vec<u8>> {
    encode_jpeg(&RgbImage::from_pixel(width, height, Rgb([0, 0, 0])), JPEG_QUALITY)
}

/// One multipart part holding a JPEG.
pub fn part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut buf = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    buf.put_slice(header.as_bytes());
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

pub fn closing() -> Bytes {
    Bytes::from(format!("--{BOUNDARY}--\r\n"))
}

//! Common utilities for integration tests

#![allow(dead_code)]

use std::f32::consts::PI;
use std::io::Cursor;
use std::path::PathBuf;

use avatar_core::{encode_wav, AudioClip, ModelService};
use axum::{body::Body, http::Request, Router};
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use server::{app, config::ServerConfig, AppState};

pub const AVATAR_KEY: &str = "avatars/face.png";
pub const AUDIO_KEY: &str = "audio/clip.wav";
/// Three seconds, for streams that must outlive the test's reads.
pub const LONG_AUDIO_KEY: &str = "audio/long.wav";

/// Temporary media root, removed on drop.
pub struct MediaDir {
    pub path: PathBuf,
}

impl MediaDir {
    pub fn new() -> Self {
        let path = std::env::temp_dir().join(format!("avatar-media-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(path.join("avatars")).unwrap();
        std::fs::create_dir_all(path.join("audio")).unwrap();
        std::fs::write(path.join(AVATAR_KEY), png_bytes(96, 96)).unwrap();
        std::fs::write(path.join(AUDIO_KEY), wav_bytes(0.3)).unwrap();
        std::fs::write(path.join(LONG_AUDIO_KEY), wav_bytes(3.0)).unwrap();
        std::fs::write(path.join("audio/broken.wav"), b"RIFF\x00\x00\x00\x00WAVEnope").unwrap();
        std::fs::write(path.join("avatars/broken.png"), b"not a png").unwrap();
        Self { path }
    }
}

impl Drop for MediaDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

pub fn wav_bytes(secs: f32) -> Vec<u8> {
    let samples = (0..(secs * 16_000.0) as usize)
        .map(|i| 0.5 * (2.0 * PI * 220.0 * i as f32 / 16_000.0).sin())
        .collect();
    encode_wav(&AudioClip::new(samples, 16_000).unwrap()).unwrap()
}

/// A valid WAV whose header claims `rate` Hz.
pub fn wav_bytes_with_rate(rate: u32) -> Vec<u8> {
    let mut bytes = wav_bytes(0.01);
    bytes[24..28].copy_from_slice(&rate.to_le_bytes());
    bytes[28..32].copy_from_slice(&(rate * 2).to_le_bytes());
    bytes
}

pub fn png_bytes(w: u32, h: u32) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([230, 200, 180])));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png).unwrap();
    buf
}

pub fn test_config(media: &MediaDir) -> ServerConfig {
    ServerConfig {
        media_root: media.path.clone(),
        default_width: 96,
        default_height: 96,
        default_fps: 10,
        ..ServerConfig::default()
    }
}

/// Create a test app instance backed by a fresh media directory
pub fn create_test_app() -> (Router, MediaDir) {
    let media = MediaDir::new();
    let state = AppState::with_models(test_config(&media), ModelService::disabled()).unwrap();
    (app(state).unwrap(), media)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(body).unwrap()))
        .unwrap()
}

pub async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

/// Number of JPEG parts in a multipart body.
pub fn count_parts(body: &[u8]) -> usize {
    let needle = b"--frame\r\n";
    body.windows(needle.len()).filter(|w| *w == needle).count()
}

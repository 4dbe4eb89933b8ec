//! Avatar preparation and caching.
//!
//! An [`AvatarResource`] is the base raster every strategy draws on, sized to
//! the requested output. The 96×96 face tensors used for model input are
//! derived lazily, the first time a model-backed stream asks for them.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use ahash::AHasher;
use dashmap::DashMap;
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::AnimatorError;

/// Side length of the model face input.
pub const FACE_SIZE: u32 = 96;

/// Region of the avatar handed to the model.
///
/// Avatar framings vary, so this is a tunable rather than a fixed contract.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CropGeometry {
    /// Square of side `size_frac * min(w, h)`, horizontally centered, with its
    /// center at `center_y_frac * h`, shifted to stay inside the frame.
    Centered { size_frac: f32, center_y_frac: f32 },
    /// The whole frame; the model output is stretched back to full size.
    Full,
}

impl Default for CropGeometry {
    fn default() -> Self {
        CropGeometry::Centered {
            size_frac: 0.62,
            center_y_frac: 0.38,
        }
    }
}

/// Pixel rectangle inside the base raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropGeometry {
    pub fn region(&self, width: u32, height: u32) -> FaceRegion {
        match *self {
            CropGeometry::Full => FaceRegion { x: 0, y: 0, width, height },
            CropGeometry::Centered { size_frac, center_y_frac } => {
                let size = ((width.min(height) as f32 * size_frac.clamp(0.0, 1.0)) as u32)
                    .clamp(1, width.min(height));
                let x = (width / 2).saturating_sub(size / 2).min(width - size);
                let cy = (height as f32 * center_y_frac) as u32;
                let y = cy.saturating_sub(size / 2).min(height - size);
                FaceRegion { x, y, width: size, height: size }
            }
        }
    }
}

/// Normalised 96×96 face tensors, channel-first, values in [-1, 1].
#[derive(Debug, Clone)]
pub struct FaceTensors {
    /// Face crop, `[3, 96, 96]`.
    pub reference: Array3<f32>,
    /// Same crop with the lower half blanked before normalisation, `[3, 96, 96]`.
    pub masked: Array3<f32>,
}

/// Base raster at output resolution plus the lazily-built model input.
#[derive(Debug)]
pub struct AvatarResource {
    base: RgbImage,
    region: FaceRegion,
    face: OnceLock<FaceTensors>,
}

impl AvatarResource {
    pub fn base(&self) -> &RgbImage {
        &self.base
    }

    pub fn width(&self) -> u32 {
        self.base.width()
    }

    pub fn height(&self) -> u32 {
        self.base.height()
    }

    pub fn region(&self) -> FaceRegion {
        self.region
    }

    /// Whether the model tensors have been built yet.
    pub fn has_face_tensors(&self) -> bool {
        self.face.get().is_some()
    }

    /// Model input tensors, built on first use.
    pub fn face_tensors(&self) -> &FaceTensors {
        self.face.get_or_init(|| {
            let r = self.region;
            let crop = imageops::crop_imm(&self.base, r.x, r.y, r.width, r.height).to_image();
            let face = imageops::resize(&crop, FACE_SIZE, FACE_SIZE, FilterType::Triangle);
            let mut masked = face.clone();
            for (_, y, px) in masked.enumerate_pixels_mut() {
                if y >= FACE_SIZE / 2 {
                    *px = image::Rgb([0, 0, 0]);
                }
            }
            debug!(region = ?r, "built face tensors");
            FaceTensors {
                reference: to_chw(&face),
                masked: to_chw(&masked),
            }
        })
    }
}

fn to_chw(img: &RgbImage) -> Array3<f32> {
    let (w, h) = img.dimensions();
    Array3::from_shape_fn((3, h as usize, w as usize), |(c, y, x)| {
        img.get_pixel(x as u32, y as u32)[c] as f32 / 255.0 * 2.0 - 1.0
    })
}

/// Turns decoded avatar images into [`AvatarResource`]s.
#[derive(Debug, Clone, Default)]
pub struct AvatarPreprocessor {
    crop: CropGeometry,
}

impl AvatarPreprocessor {
    pub fn new(crop: CropGeometry) -> Self {
        Self { crop }
    }

    /// Resize `image` to `out_w`×`out_h` RGB with a Lanczos filter.
    pub fn prepare(
        &self,
        image: &DynamicImage,
        out_w: u32,
        out_h: u32,
    ) -> Result<AvatarResource, AnimatorError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(AnimatorError::InvalidImage(format!(
                "source has zero area ({}x{})",
                image.width(),
                image.height()
            )));
        }
        if out_w == 0 || out_h == 0 {
            return Err(AnimatorError::InvalidImage(format!(
                "output size {out_w}x{out_h} has zero area"
            )));
        }

        let rgb = image.to_rgb8();
        let base = if rgb.dimensions() == (out_w, out_h) {
            rgb
        } else {
            imageops::resize(&rgb, out_w, out_h, FilterType::Lanczos3)
        };

        Ok(AvatarResource {
            base,
            region: self.crop.region(out_w, out_h),
            face: OnceLock::new(),
        })
    }

    /// Decode encoded image bytes (PNG, JPEG, ...) and prepare them.
    pub fn prepare_bytes(
        &self,
        bytes: &[u8],
        out_w: u32,
        out_h: u32,
    ) -> Result<AvatarResource, AnimatorError> {
        let image = image::load_from_memory(bytes)?;
        self.prepare(&image, out_w, out_h)
    }
}

/// Identity of an avatar image. Named and inline avatars never share keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AvatarOrigin {
    /// Storage key of the image.
    Named(String),
    /// Content hash of an image sent with the request.
    Inline(u64),
    /// Flat placeholder canvas, no source image.
    Blank,
}

/// Cache key: where the avatar came from and the size it was prepared at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AvatarKey {
    pub source: AvatarOrigin,
    pub width: u32,
    pub height: u32,
}

impl AvatarKey {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self { source: AvatarOrigin::Named(name.into()), width, height }
    }

    /// Key for a payload with no stable name, identified by content hash.
    pub fn for_bytes(bytes: &[u8], width: u32, height: u32) -> Self {
        let mut hasher = AHasher::default();
        bytes.hash(&mut hasher);
        Self { source: AvatarOrigin::Inline(hasher.finish()), width, height }
    }
}

struct CachedAvatar {
    resource: Arc<AvatarResource>,
    last_accessed: Instant,
}

/// Shared, bounded cache of prepared avatars.
///
/// Entries are immutable once inserted; eviction drops the least recently
/// accessed entry when the cache is full.
pub struct AvatarCache {
    entries: DashMap<AvatarKey, CachedAvatar>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for AvatarCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvatarCache")
            .field("len", &self.entries.len())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

impl AvatarCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn get(&self, key: &AvatarKey) -> Option<Arc<AvatarResource>> {
        self.entries.get_mut(key).map(|mut cached| {
            cached.last_accessed = Instant::now();
            cached.resource.clone()
        })
    }

    /// Return the cached resource for `key`, preparing it with `prepare` on a miss.
    ///
    /// Preparation errors are not cached. If two callers race on the same key the
    /// first insert wins and both receive that entry.
    pub fn get_or_prepare<F>(
        &self,
        key: AvatarKey,
        prepare: F,
    ) -> Result<Arc<AvatarResource>, AnimatorError>
    where
        F: FnOnce() -> Result<AvatarResource, AnimatorError>,
    {
        if let Some(resource) = self.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(resource);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let resource = Arc::new(prepare()?);

        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            self.evict_oldest();
        }

        let entry = self.entries.entry(key.clone()).or_insert_with(|| CachedAvatar {
            resource,
            last_accessed: Instant::now(),
        });
        info!(source = ?key.source, width = key.width, height = key.height, "cached avatar");
        Ok(entry.resource.clone())
    }

    fn evict_oldest(&self) {
        let mut oldest: Option<(AvatarKey, Instant)> = None;
        for entry in self.entries.iter() {
            let seen = entry.last_accessed;
            if oldest.as_ref().map_or(true, |(_, t)| seen < *t) {
                oldest = Some((entry.key().clone(), seen));
            }
        }
        if let Some((key, _)) = oldest {
            debug!(source = ?key.source, "evicting avatar");
            self.entries.remove(&key);
        }
    }
}

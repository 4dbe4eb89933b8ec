//! Viseme timelines as a second source of mouth openness.
//!
//! A timeline is a list of `(time, viseme)` events, typically produced by a
//! TTS engine alongside its audio. At stream time `t` the active viseme is the
//! last one whose time is `<= t`; before the first event the mouth rests.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AnimatorError;
use crate::synth::heuristic::openness_from_normalized;

/// Viseme reported before the first event.
pub const REST: &str = "rest";

/// Upper bound on events per timeline.
pub const MAX_VISEMES: usize = 10_000;

/// Latest accepted event time, ten minutes.
pub const MAX_TIME_MS: u64 = 600_000;

/// How long the last viseme is held before the stream ends.
pub const DEFAULT_TAIL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viseme {
    #[serde(alias = "timeMs")]
    pub time_ms: u64,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Viseme {
    pub fn new(time_ms: u64, kind: impl Into<String>) -> Self {
        Self { time_ms, kind: kind.into() }
    }
}

/// How far a viseme opens the mouth, in [0, 1]. Matching ignores case.
pub fn open_amount(kind: &str) -> f32 {
    match kind.to_ascii_lowercase().as_str() {
        "aa" | "ae" | "ah" => 1.0,
        "ao" | "ow" => 0.8,
        "uw" | "uh" => 0.6,
        "iy" | "ih" => 0.4,
        "t" | "d" | "s" | "z" => 0.25,
        "p" | "b" | "m" => 0.1,
        "sil" | REST => 0.05,
        _ => 0.5,
    }
}

/// Time-ordered visemes. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct VisemeTimeline {
    visemes: Vec<Viseme>,
    tail: Duration,
}

impl VisemeTimeline {
    /// Sorts events by time, keeping the given order among equal times.
    pub fn new(visemes: Vec<Viseme>) -> Result<Self, AnimatorError> {
        Self::with_tail(visemes, DEFAULT_TAIL)
    }

    pub fn with_tail(mut visemes: Vec<Viseme>, tail: Duration) -> Result<Self, AnimatorError> {
        if visemes.len() > MAX_VISEMES {
            return Err(AnimatorError::InvalidConfig(format!(
                "{} visemes exceed the limit of {MAX_VISEMES}",
                visemes.len()
            )));
        }
        if let Some(v) = visemes.iter().find(|v| v.kind.trim().is_empty()) {
            return Err(AnimatorError::InvalidConfig(format!(
                "viseme at {} ms has an empty type",
                v.time_ms
            )));
        }
        if let Some(v) = visemes.iter().find(|v| v.time_ms > MAX_TIME_MS) {
            return Err(AnimatorError::InvalidConfig(format!(
                "viseme at {} ms is past the {MAX_TIME_MS} ms limit",
                v.time_ms
            )));
        }
        visemes.sort_by_key(|v| v.time_ms);
        Ok(Self { visemes, tail })
    }

    pub fn len(&self) -> usize {
        self.visemes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visemes.is_empty()
    }

    /// Active viseme at `t` after stream start.
    pub fn current(&self, t: Duration) -> &str {
        let t_ms = t.as_millis().min(u64::MAX as u128) as u64;
        let idx = self.visemes.partition_point(|v| v.time_ms <= t_ms);
        match idx {
            0 => REST,
            i => &self.visemes[i - 1].kind,
        }
    }

    /// Mouth openness at `t`, on the same [0.15, 1] scale as audio-driven frames.
    pub fn openness_at(&self, t: Duration) -> f32 {
        openness_from_normalized(open_amount(self.current(t)))
    }

    /// Last event time plus the hold tail.
    pub fn duration(&self) -> Duration {
        let last = self.visemes.last().map_or(0, |v| v.time_ms);
        Duration::from_millis(last).saturating_add(self.tail)
    }

    /// Frames needed to cover [`duration`](Self::duration) at `fps`, at least one.
    pub fn frame_count(&self, fps: u32) -> usize {
        let ms = self.duration().as_millis().min(u64::MAX as u128) as u64;
        let frames = ms.saturating_mul(fps as u64).div_ceil(1_000);
        (frames as usize).max(1)
    }
}

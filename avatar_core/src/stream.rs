//! Wall-clock paced frame emission.
//!
//! A [`FrameCursor`] walks a [`WindowPlan`] over the feature sequence,
//! synthesizes one frame per window and holds it back until its slot
//! `start + i / fps` on the monotonic clock. Model synthesis runs on the
//! blocking pool so a slow model never stalls another stream's timer.
//!
//! A cursor can also be driven by a [`VisemeTimeline`]: frame `i` then shows
//! the viseme active at `i / fps`, drawn with the heuristic mouth.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use futures_core::Stream;
use serde::Serialize;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::avatar::AvatarResource;
use crate::error::AnimatorError;
use crate::features::FeatureSequence;
use crate::synth::heuristic::draw_mouth;
use crate::synth::{Frame, HeuristicSynth, ModelSynth, MouthStyle, StrategyKind, SynthesisStrategy};
use crate::viseme::VisemeTimeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Init,
    Streaming,
    Done,
    /// Consumer went away. Terminal, not an error.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlanKind {
    /// Consecutive, non-overlapping column spans, one per frame.
    Framewise,
    /// Fixed-size windows advancing by the frame stride.
    Sliding { size: usize },
}

/// Which feature columns feed which frame.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowPlan {
    kind: PlanKind,
    columns_per_frame: f64,
    total: usize,
    count: usize,
}

impl WindowPlan {
    /// Frame `i` covers `[floor(i*c), floor((i+1)*c))` with `c = column_rate / fps`.
    pub fn framewise(total: usize, column_rate: f64, fps: u32) -> Self {
        let count = if total == 0 {
            0
        } else {
            ((total as f64 * fps as f64 / column_rate).floor() as usize).max(1)
        };
        Self {
            kind: PlanKind::Framewise,
            columns_per_frame: column_rate / fps as f64,
            total,
            count,
        }
    }

    /// Frame `i` covers `[floor(i*c), floor(i*c) + size)`. `None` when no window fits.
    pub fn sliding(total: usize, column_rate: f64, fps: u32, size: usize) -> Option<Self> {
        if size == 0 || total < size {
            return None;
        }
        let mut plan = Self {
            kind: PlanKind::Sliding { size },
            columns_per_frame: column_rate / fps as f64,
            total,
            count: 0,
        };
        let mut n = ((total - size) as f64 / plan.columns_per_frame).floor() as usize + 1;
        while n > 0 && plan.start(n - 1) + size > total {
            n -= 1;
        }
        while plan.start(n) + size <= total {
            n += 1;
        }
        plan.count = n;
        Some(plan)
    }

    fn start(&self, i: usize) -> usize {
        (i as f64 * self.columns_per_frame).floor() as usize
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Column range of frame `i`, clipped to the sequence.
    pub fn window(&self, i: usize) -> Range<usize> {
        let start = self.start(i).min(self.total);
        let end = match self.kind {
            PlanKind::Framewise => self.start(i + 1).max(start + 1),
            PlanKind::Sliding { size } => start + size,
        };
        start..end.min(self.total)
    }
}

/// A frame released by the pacer.
#[derive(Debug, Clone)]
pub struct PacedFrame {
    pub index: usize,
    pub frame: Frame,
    pub source: StrategyKind,
    /// `i / fps`, the frame's slot relative to stream start.
    pub target_offset: Duration,
    pub emitted_at: Instant,
    /// How far past its slot the frame was released.
    pub lag: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamStats {
    pub frames: usize,
    pub model_frames: usize,
    /// Heuristic frames produced because the model path was abandoned.
    pub fallback_frames: usize,
    pub max_lag: Duration,
}

/// Entry point: validates a request and builds its cursor.
#[derive(Debug, Clone, Default)]
pub struct PacedStreamer {
    style: MouthStyle,
}

impl PacedStreamer {
    pub fn new(style: MouthStyle) -> Self {
        Self { style }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn stream(
        &self,
        strategy: SynthesisStrategy,
        resource: Arc<AvatarResource>,
        features: Arc<FeatureSequence>,
        out_w: u32,
        out_h: u32,
        fps: u32,
        cancel: CancellationToken,
    ) -> Result<FrameCursor, AnimatorError> {
        check_output(&resource, out_w, out_h, fps)?;

        let heuristic = HeuristicSynth::for_sequence(&features, self.style.clone());
        let framewise = || WindowPlan::framewise(features.len(), features.column_rate(), fps);
        let mut downgraded = false;
        let (plan, model) = match strategy {
            SynthesisStrategy::Heuristic => (framewise(), None),
            SynthesisStrategy::ModelBacked(loaded) => {
                let synth = ModelSynth::for_sequence(loaded, &features);
                match WindowPlan::sliding(features.len(), features.column_rate(), fps, synth.window_size()) {
                    Some(plan) => (plan, Some(Arc::new(synth))),
                    None => {
                        warn!(
                            columns = features.len(),
                            window = synth.window_size(),
                            "audio too short for model windows, using heuristic synthesis"
                        );
                        downgraded = true;
                        (framewise(), None)
                    }
                }
            }
        };

        let driver = Driver::Audio {
            features,
            plan,
            heuristic: Arc::new(heuristic),
            model,
            downgraded,
        };
        Ok(FrameCursor::new(driver, resource, fps, cancel))
    }

    /// Stream heuristic frames whose openness follows a viseme timeline.
    pub fn visemes(
        &self,
        resource: Arc<AvatarResource>,
        timeline: Arc<VisemeTimeline>,
        out_w: u32,
        out_h: u32,
        fps: u32,
        cancel: CancellationToken,
    ) -> Result<FrameCursor, AnimatorError> {
        check_output(&resource, out_w, out_h, fps)?;
        let driver = Driver::Visemes {
            frames: timeline.frame_count(fps),
            timeline,
            style: self.style.clone(),
        };
        Ok(FrameCursor::new(driver, resource, fps, cancel))
    }
}

fn check_output(resource: &AvatarResource, out_w: u32, out_h: u32, fps: u32) -> Result<(), AnimatorError> {
    if fps == 0 {
        return Err(AnimatorError::InvalidConfig("fps must be positive".into()));
    }
    if (resource.width(), resource.height()) != (out_w, out_h) {
        return Err(AnimatorError::InvalidImage(format!(
            "avatar prepared at {}x{}, stream requested {out_w}x{out_h}",
            resource.width(),
            resource.height()
        )));
    }
    Ok(())
}

/// What decides the mouth shape of each frame.
enum Driver {
    Audio {
        features: Arc<FeatureSequence>,
        plan: WindowPlan,
        heuristic: Arc<HeuristicSynth>,
        model: Option<Arc<ModelSynth>>,
        /// Set once the model path is abandoned for this stream.
        downgraded: bool,
    },
    Visemes {
        timeline: Arc<VisemeTimeline>,
        style: MouthStyle,
        frames: usize,
    },
}

/// One request's stream. Pull frames with [`FrameCursor::next`].
pub struct FrameCursor {
    state: StreamState,
    resource: Arc<AvatarResource>,
    driver: Driver,
    frame_count: usize,
    interval: Duration,
    start: Option<Instant>,
    next_index: usize,
    cancel: CancellationToken,
    stats: StreamStats,
}

impl std::fmt::Debug for FrameCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCursor")
            .field("state", &self.state)
            .field("strategy", &self.strategy())
            .field("frames", &self.frame_count)
            .field("next_index", &self.next_index)
            .finish()
    }
}

impl FrameCursor {
    fn new(driver: Driver, resource: Arc<AvatarResource>, fps: u32, cancel: CancellationToken) -> Self {
        let frame_count = match &driver {
            Driver::Audio { plan, .. } => plan.len(),
            Driver::Visemes { frames, .. } => *frames,
        };
        Self {
            state: StreamState::Init,
            resource,
            driver,
            frame_count,
            interval: Duration::from_secs(1) / fps,
            start: None,
            next_index: 0,
            cancel,
            stats: StreamStats::default(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Strategy the next frame will be drawn with.
    pub fn strategy(&self) -> StrategyKind {
        match &self.driver {
            Driver::Audio { model: Some(_), .. } => StrategyKind::ModelBacked,
            _ => StrategyKind::Heuristic,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Set on the first call to [`next`](Self::next).
    pub fn started_at(&self) -> Option<Instant> {
        self.start
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Next paced frame, or `None` once the stream is done or aborted.
    pub async fn next(&mut self) -> Option<PacedFrame> {
        let start = match self.state {
            StreamState::Done | StreamState::Aborted => return None,
            StreamState::Init => {
                let now = Instant::now();
                self.start = Some(now);
                self.state = StreamState::Streaming;
                info!(
                    frames = self.frame_count,
                    interval_ms = self.interval.as_millis() as u64,
                    strategy = self.strategy().as_str(),
                    "stream started"
                );
                now
            }
            StreamState::Streaming => self.start.unwrap_or_else(Instant::now),
        };

        if self.cancel.is_cancelled() {
            self.abort();
            return None;
        }
        let index = self.next_index;
        if index >= self.frame_count {
            self.state = StreamState::Done;
            info!(
                frames = self.stats.frames,
                fallback_frames = self.stats.fallback_frames,
                max_lag_ms = self.stats.max_lag.as_millis() as u64,
                "stream done"
            );
            return None;
        }

        let Some((frame, source)) = self.render(index).await else {
            self.abort();
            return None;
        };

        let target_offset = self.interval * index as u32;
        let target = start + target_offset;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.abort();
                return None;
            }
            _ = sleep_until(target) => {}
        }

        let emitted_at = Instant::now();
        let lag = emitted_at.saturating_duration_since(target);
        self.record(source, lag);
        self.next_index += 1;
        debug!(index, lag_ms = lag.as_millis() as u64, source = source.as_str(), "frame emitted");

        Some(PacedFrame {
            index,
            frame,
            source,
            target_offset,
            emitted_at,
            lag,
        })
    }

    /// Drain the cursor as a `Stream`.
    pub fn into_stream(mut self) -> impl Stream<Item = PacedFrame> + Send + 'static {
        async_stream::stream! {
            while let Some(frame) = self.next().await {
                yield frame;
            }
        }
    }

    /// `None` when cancelled while the model was running.
    async fn render(&mut self, index: usize) -> Option<(Frame, StrategyKind)> {
        let (features, window, heuristic, model) = match &self.driver {
            Driver::Visemes { timeline, style, .. } => {
                let openness = timeline.openness_at(self.interval * index as u32);
                let frame = draw_mouth(self.resource.base(), openness, style);
                return Some((frame, StrategyKind::Heuristic));
            }
            Driver::Audio { features, plan, heuristic, model, .. } => {
                (features.clone(), plan.window(index), heuristic.clone(), model.clone())
            }
        };

        if let Some(model) = model {
            let resource = self.resource.clone();
            let seq = features.clone();
            let range = window.clone();
            let job = tokio::task::spawn_blocking(move || {
                model.synthesize(&resource, seq.window(range))
            });

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                joined = job => joined,
            };
            let reason = match outcome {
                Ok(Ok(frame)) => return Some((frame, StrategyKind::ModelBacked)),
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("synthesis task failed: {e}"),
            };
            warn!(index, error = %reason, "model synthesis failed, continuing with heuristic synthesis");
            if let Driver::Audio { model, downgraded, .. } = &mut self.driver {
                *model = None;
                *downgraded = true;
            }
        }

        let frame = heuristic.synthesize(&self.resource, features.window(window));
        Some((frame, StrategyKind::Heuristic))
    }

    fn downgraded(&self) -> bool {
        matches!(self.driver, Driver::Audio { downgraded: true, .. })
    }

    fn record(&mut self, source: StrategyKind, lag: Duration) {
        self.stats.frames += 1;
        match source {
            StrategyKind::ModelBacked => self.stats.model_frames += 1,
            StrategyKind::Heuristic if self.downgraded() => self.stats.fallback_frames += 1,
            StrategyKind::Heuristic => {}
        }
        self.stats.max_lag = self.stats.max_lag.max(lag);
    }

    fn abort(&mut self) {
        if self.state != StreamState::Aborted {
            info!(emitted = self.stats.frames, total = self.frame_count, "stream aborted");
        }
        self.state = StreamState::Aborted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avatar::{AvatarPreprocessor, CropGeometry};
    use image::{DynamicImage, Rgb, RgbImage};
    use ndarray::Array2;

    fn resource(w: u32, h: u32) -> Arc<AvatarResource> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([210, 180, 160])));
        Arc::new(AvatarPreprocessor::new(CropGeometry::default()).prepare(&img, w, h).unwrap())
    }

    fn features(cols: usize) -> Arc<FeatureSequence> {
        Arc::new(FeatureSequence::new(Array2::from_elem((80, cols), -10.0), 100.0))
    }

    #[test]
    fn test_framewise_plan_counts() {
        // 1.5 s of 16 kHz audio yields 151 columns
        assert_eq!(WindowPlan::framewise(151, 100.0, 15).len(), 22);
        assert_eq!(WindowPlan::framewise(101, 100.0, 25).len(), 25);
        assert_eq!(WindowPlan::framewise(3, 100.0, 15).len(), 1);
        assert!(WindowPlan::framewise(0, 100.0, 15).is_empty());
    }

    #[test]
    fn test_framewise_windows_tile_without_gaps() {
        let plan = WindowPlan::framewise(151, 100.0, 15);
        let mut expected_start = 0;
        for i in 0..plan.len() {
            let w = plan.window(i);
            assert_eq!(w.start, expected_start);
            assert!(!w.is_empty());
            expected_start = w.end;
        }
        assert!(expected_start <= 151);
    }

    #[test]
    fn test_framewise_window_never_empty_at_high_fps() {
        let plan = WindowPlan::framewise(5, 100.0, 30);
        for i in 0..plan.len() {
            assert!(!plan.window(i).is_empty());
        }
    }

    #[test]
    fn test_sliding_plan_fits_inside_sequence() {
        let plan = WindowPlan::sliding(151, 100.0, 15, 16).unwrap();
        let last = plan.window(plan.len() - 1);
        assert_eq!(last.len(), 16);
        assert!(last.end <= 151);
        // One more would overflow
        assert!((plan.len() as f64 * 100.0 / 15.0).floor() as usize + 16 > 151);
    }

    #[test]
    fn test_sliding_with_stride_equal_to_window() {
        // fps = 100/16 is not integral; use a 10-column window at 10 fps
        let plan = WindowPlan::sliding(95, 100.0, 10, 10).unwrap();
        assert_eq!(plan.len(), 95 / 10);
    }

    #[test]
    fn test_sliding_too_short() {
        assert!(WindowPlan::sliding(15, 100.0, 15, 16).is_none());
        assert_eq!(WindowPlan::sliding(16, 100.0, 15, 16).unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_zero_fps() {
        let err = PacedStreamer::default()
            .stream(SynthesisStrategy::Heuristic, resource(64, 64), features(50), 64, 64, 0, CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, AnimatorError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_size_mismatch() {
        let err = PacedStreamer::default()
            .stream(SynthesisStrategy::Heuristic, resource(64, 64), features(50), 80, 64, 10, CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, AnimatorError::InvalidImage(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_machine_runs_to_done() {
        let mut cursor = PacedStreamer::default()
            .stream(SynthesisStrategy::Heuristic, resource(64, 64), features(31), 64, 64, 10, CancellationToken::new())
            .unwrap();
        assert_eq!(cursor.state(), StreamState::Init);
        assert_eq!(cursor.frame_count(), 3);

        let mut indices = Vec::new();
        while let Some(f) = cursor.next().await {
            assert_eq!(cursor.state(), StreamState::Streaming);
            indices.push(f.index);
        }
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(cursor.state(), StreamState::Done);
        assert!(cursor.next().await.is_none());
        assert_eq!(cursor.stats().frames, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_not_emitted_early() {
        let mut cursor = PacedStreamer::default()
            .stream(SynthesisStrategy::Heuristic, resource(64, 64), features(101), 64, 64, 20, CancellationToken::new())
            .unwrap();
        while let Some(f) = cursor.next().await {
            let start = cursor.started_at().unwrap();
            assert!(f.emitted_at >= start + Duration::from_millis(50) * f.index as u32);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_features_finish_immediately() {
        let mut cursor = PacedStreamer::default()
            .stream(SynthesisStrategy::Heuristic, resource(64, 64), features(0), 64, 64, 10, CancellationToken::new())
            .unwrap();
        assert!(cursor.next().await.is_none());
        assert_eq!(cursor.state(), StreamState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_frame() {
        let cancel = CancellationToken::new();
        let mut cursor = PacedStreamer::default()
            .stream(SynthesisStrategy::Heuristic, resource(64, 64), features(100), 64, 64, 10, cancel.clone())
            .unwrap();
        cancel.cancel();
        assert!(cursor.next().await.is_none());
        assert_eq!(cursor.state(), StreamState::Aborted);
        assert!(cursor.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_viseme_cursor_follows_timeline() {
        use crate::synth::heuristic::openness_from_normalized;
        use crate::viseme::{open_amount, Viseme};

        let res = resource(64, 64);
        let timeline = Arc::new(
            VisemeTimeline::new(vec![Viseme::new(0, "aa"), Viseme::new(200, "m")]).unwrap(),
        );
        let mut cursor = PacedStreamer::default()
            .visemes(res.clone(), timeline, 64, 64, 10, CancellationToken::new())
            .unwrap();
        // 200 ms plus the 500 ms hold at 10 fps
        assert_eq!(cursor.frame_count(), 7);
        assert_eq!(cursor.strategy(), StrategyKind::Heuristic);

        let style = MouthStyle::default();
        let open = draw_mouth(res.base(), openness_from_normalized(open_amount("aa")), &style);
        let closed = draw_mouth(res.base(), openness_from_normalized(open_amount("m")), &style);
        let mut frames = Vec::new();
        while let Some(f) = cursor.next().await {
            assert_eq!(f.source, StrategyKind::Heuristic);
            frames.push(f.frame);
        }
        assert_eq!(frames.len(), 7);
        assert_eq!(frames[0], open);
        assert_eq!(frames[1], open);
        assert_eq!(frames[2], closed);
        assert_eq!(frames[6], closed);
        assert_eq!(cursor.state(), StreamState::Done);
        assert_eq!(cursor.stats().fallback_frames, 0);
    }

    #[test]
    fn test_viseme_cursor_rejects_zero_fps() {
        let timeline = Arc::new(VisemeTimeline::new(Vec::new()).unwrap());
        let err = PacedStreamer::default()
            .visemes(resource(64, 64), timeline, 64, 64, 0, CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, AnimatorError::InvalidConfig(_)));
    }
}

//! Frame performance lens.
//!
//! Hosts feed one [`PerfSample`] per frame into a [`PerfTracker`]; the
//! tracker keeps a bounded window of recent samples plus lifetime hitch and
//! peak-memory counters, and reports whether the run stays inside its
//! [`PerfThresholds`].

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of samples kept for averaging.
pub const DEFAULT_WINDOW: usize = 600;

/// One frame's measurements.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfSample {
    /// Frame duration in milliseconds.
    pub frame_time_ms: f64,
    /// Instantaneous frames per second derived from the frame time.
    pub fps: f64,
    /// Resident memory in megabytes.
    pub memory_mb: f64,
    /// Frame exceeded the hitch threshold.
    pub is_hitch: bool,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
}

/// Gates a run must stay within.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerfThresholds {
    /// Minimum acceptable average FPS.
    #[serde(rename = "minFPS")]
    pub min_fps: f64,
    /// Frame time budget (about 30 FPS).
    pub max_frame_time_ms: f64,
    /// Peak memory ceiling.
    pub max_memory_mb: f64,
    /// Frames slower than this count as hitches.
    pub hitch_threshold_ms: f64,
}

impl Default for PerfThresholds {
    fn default() -> Self {
        Self {
            min_fps: 30.0,
            max_frame_time_ms: 33.0,
            max_memory_mb: 2048.0,
            hitch_threshold_ms: 100.0,
        }
    }
}

/// Summary of a tracker's state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfReport {
    /// Samples currently in the window.
    pub samples: usize,
    /// Average FPS over the window.
    pub average_fps: f64,
    /// Highest memory reading since the last reset.
    pub peak_memory_mb: f64,
    /// Hitches since the last reset.
    pub hitch_count: u64,
    /// Whether the gates pass.
    pub passed_thresholds: bool,
    /// Active thresholds.
    pub thresholds: PerfThresholds,
    /// Most recent sample.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<PerfSample>,
}

/// Rolling frame statistics.
#[derive(Clone, Debug)]
pub struct PerfTracker {
    thresholds: PerfThresholds,
    window: VecDeque<PerfSample>,
    capacity: usize,
    hitches: u64,
    peak_memory_mb: f64,
}

impl Default for PerfTracker {
    fn default() -> Self {
        Self::new(PerfThresholds::default(), DEFAULT_WINDOW)
    }
}

impl PerfTracker {
    /// Tracker with the given thresholds and window size (at least 1).
    pub fn new(thresholds: PerfThresholds, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            thresholds,
            window: VecDeque::with_capacity(capacity),
            capacity,
            hitches: 0,
            peak_memory_mb: 0.0,
        }
    }

    /// Record one frame and return the classified sample.
    pub fn record(&mut self, frame_time_ms: f64, memory_mb: f64) -> PerfSample {
        self.record_at(frame_time_ms, memory_mb, Utc::now())
    }

    /// Record one frame captured at `timestamp`.
    pub fn record_at(
        &mut self,
        frame_time_ms: f64,
        memory_mb: f64,
        timestamp: DateTime<Utc>,
    ) -> PerfSample {
        let fps = if frame_time_ms > 0.0 {
            1000.0 / frame_time_ms
        } else {
            0.0
        };
        let sample = PerfSample {
            frame_time_ms,
            fps,
            memory_mb,
            is_hitch: frame_time_ms > self.thresholds.hitch_threshold_ms,
            timestamp,
        };
        if sample.is_hitch {
            self.hitches += 1;
            tracing::warn!(frame_time_ms, "hitch detected");
        }
        if memory_mb > self.peak_memory_mb {
            self.peak_memory_mb = memory_mb;
        }
        if self.window.len() == self.capacity {
            let _ = self.window.pop_front();
        }
        self.window.push_back(sample.clone());
        sample
    }

    /// Average FPS over the window; zero when empty.
    #[allow(clippy::cast_precision_loss)]
    pub fn average_fps(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().map(|s| s.fps).sum::<f64>() / self.window.len() as f64
    }

    /// Peak memory since the last reset.
    pub fn peak_memory_mb(&self) -> f64 {
        self.peak_memory_mb
    }

    /// Hitches since the last reset.
    pub fn hitch_count(&self) -> u64 {
        self.hitches
    }

    /// Active thresholds.
    pub fn thresholds(&self) -> PerfThresholds {
        self.thresholds
    }

    /// Replace the thresholds. Already-recorded samples keep their hitch flag.
    pub fn set_thresholds(&mut self, thresholds: PerfThresholds) {
        tracing::info!(
            min_fps = thresholds.min_fps,
            max_memory_mb = thresholds.max_memory_mb,
            hitch_threshold_ms = thresholds.hitch_threshold_ms,
            "performance thresholds set"
        );
        self.thresholds = thresholds;
    }

    /// Average FPS and peak memory within thresholds. An empty run passes.
    pub fn passes_gates(&self) -> bool {
        if self.window.is_empty() {
            return true;
        }
        self.average_fps() >= self.thresholds.min_fps
            && self.peak_memory_mb <= self.thresholds.max_memory_mb
    }

    /// Most recent sample.
    pub fn latest(&self) -> Option<&PerfSample> {
        self.window.back()
    }

    /// Clear samples and counters, keeping the thresholds.
    pub fn reset(&mut self) {
        self.window.clear();
        self.hitches = 0;
        self.peak_memory_mb = 0.0;
    }

    /// Snapshot of the current statistics.
    pub fn report(&self) -> PerfReport {
        PerfReport {
            samples: self.window.len(),
            average_fps: self.average_fps(),
            peak_memory_mb: self.peak_memory_mb,
            hitch_count: self.hitches,
            passed_thresholds: self.passes_gates(),
            thresholds: self.thresholds,
            latest: self.latest().cloned(),
        }
    }
}

//! Transfer progress reporting
//!
//! The orchestrator is the single producer; whoever started the operation
//! drains the channel. No shared mutable progress object exists.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// What the running operation is doing to the cartridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ReadRom,
    WriteRom,
    ReadSave,
    WriteSave,
    Detect,
}

impl Action {
    pub fn describe(self) -> &'static str {
        match self {
            Action::ReadRom => "reading ROM",
            Action::WriteRom => "writing ROM",
            Action::ReadSave => "backing up save",
            Action::WriteSave => "restoring save",
            Action::Detect => "detecting",
        }
    }
}

/// One event per chunk of work, plus lifecycle markers
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Initialize { action: Action, total_bytes: u32 },
    /// Position moved without transferring data (skipped sectors)
    UpdatePos { pos: u32 },
    Read { pos: u32, len: u32 },
    Write { pos: u32, len: u32 },
    /// Chip erase in progress; only elapsed time exists to report
    Erase { elapsed_ms: u64 },
    SectorErase { index: u32, count: u32, pos: u32 },
    Abort,
    Finished { bytes_transferred: u64, verified: bool },
}

/// Transfer speed over a sliding window of chunk timings. The median is
/// what gets displayed; single stalled chunks (sector erases, serial
/// hiccups) would whip a mean around.
#[derive(Debug)]
pub struct Throughput {
    samples: VecDeque<f64>,
    capacity: usize,
    last: Instant,
}

impl Throughput {
    pub const DEFAULT_WINDOW: usize = 32;

    pub fn new() -> Self {
        Self::with_window(Self::DEFAULT_WINDOW)
    }

    pub fn with_window(capacity: usize) -> Self {
        Throughput {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            last: Instant::now(),
        }
    }

    /// Record that `bytes` arrived since the previous call
    pub fn record(&mut self, bytes: u32) {
        let now = Instant::now();
        let dt = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        if dt <= 0.0 || bytes == 0 {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(bytes as f64 / dt);
    }

    /// Windowed-median rate in bytes per second
    pub fn median_bps(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 1 {
            sorted[mid]
        } else {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        }
    }

    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let bps = self.median_bps();
        if bps <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / bps))
    }
}

impl Default for Throughput {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_samples(samples: &[f64]) -> Throughput {
        let mut t = Throughput::new();
        t.samples.extend(samples.iter().copied());
        t
    }

    #[test]
    fn median_shrugs_off_a_stalled_chunk() {
        let t = with_samples(&[1000.0, 1010.0, 990.0, 1005.0, 3.0]);
        let m = t.median_bps();
        assert!((990.0..=1010.0).contains(&m), "median was {m}");
    }

    #[test]
    fn empty_window_reports_zero_and_no_eta() {
        let t = Throughput::new();
        assert_eq!(t.median_bps(), 0.0);
        assert!(t.eta(1024).is_none());
    }

    #[test]
    fn window_is_bounded() {
        let mut t = Throughput::with_window(4);
        for _ in 0..20 {
            std::thread::sleep(Duration::from_millis(1));
            t.record(100);
        }
        assert!(t.samples.len() <= 4);
    }

    #[test]
    fn eta_follows_the_median() {
        let t = with_samples(&[2048.0, 2048.0, 2048.0]);
        let eta = t.eta(4096).unwrap();
        assert_eq!(eta.as_secs(), 2);
    }
}

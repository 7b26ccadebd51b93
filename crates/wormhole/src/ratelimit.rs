use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Which allowance a frame would have exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exceeded {
    /// Too many frames in the window.
    Messages,
    /// Too many bytes in the window.
    Bandwidth,
}

impl Exceeded {
    /// Metric label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Messages => "msg_rate",
            Self::Bandwidth => "bw_rate",
        }
    }
}

/// Sliding one-minute window over a single connection's inbound frames.
///
/// Tracks each accepted frame individually rather than resetting a counter on
/// fixed boundaries, so a burst straddling a boundary is still counted once.
/// The window never holds more than `msg_rate` entries.
#[derive(Debug)]
pub struct RateLimiter {
    msg_rate: u32,
    bw_rate: u64,
    window: VecDeque<(Instant, u64)>,
    bytes_in_window: u64,
}

impl RateLimiter {
    /// Allow at most `msg_rate` frames and `bw_rate` bytes per minute.
    #[must_use]
    pub fn new(msg_rate: u32, bw_rate: u64) -> Self {
        Self {
            msg_rate,
            bw_rate,
            window: VecDeque::with_capacity((msg_rate as usize).min(64)),
            bytes_in_window: 0,
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(at, bytes)) = self.window.front() {
            if now.duration_since(at) < WINDOW {
                break;
            }
            self.bytes_in_window = self.bytes_in_window.saturating_sub(bytes);
            self.window.pop_front();
        }
    }

    fn frames_in_window(&self) -> u32 {
        self.window.len().try_into().unwrap_or(u32::MAX)
    }

    /// Record a frame of `bytes` if it fits both allowances.
    ///
    /// Rejected frames are not recorded.
    pub fn check(&mut self, bytes: usize) -> Result<(), Exceeded> {
        self.check_at(Instant::now(), bytes)
    }

    fn check_at(&mut self, now: Instant, bytes: usize) -> Result<(), Exceeded> {
        self.expire(now);
        let bytes = bytes as u64;

        if self.frames_in_window() >= self.msg_rate {
            return Err(Exceeded::Messages);
        }
        if self.bytes_in_window.saturating_add(bytes) > self.bw_rate {
            return Err(Exceeded::Bandwidth);
        }

        self.window.push_back((now, bytes));
        self.bytes_in_window = self.bytes_in_window.saturating_add(bytes);
        Ok(())
    }
}

//! Building blocks for per-device protocol state machines.
//!
//! Every driver decodes its byte stream the same way: accumulate bytes
//! until a completion predicate holds, decode the unit, reset. The helpers
//! here cover the parts that repeat across drivers: a bounded accumulation
//! buffer, terminator framing, rate limiting of repeated hold markers,
//! reply-pending timeouts and digit decoding.

use std::time::{Duration, Instant};

/// Why a state machine dropped its partial input. Logged, never returned to
/// callers outside the decoder.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolDesync {
    #[error("unknown token 0x{0:02x}")]
    UnknownToken(u8),

    #[error("accumulation buffer overflow ({capacity} bytes)")]
    Overflow { capacity: usize },

    #[error("bad frame trailer 0x{0:02x}")]
    BadTrailer(u8),

    #[error("invalid numeric field {0:02x?}")]
    InvalidDigits(Vec<u8>),

    #[error("unexpected reply {0:?}")]
    UnexpectedReply(String),
}

/// A byte-at-a-time decoder. `feed` returns a record whenever a unit
/// completes.
pub trait FrameDecoder {
    type Output;

    fn feed(&mut self, byte: u8) -> Option<Self::Output>;

    /// Drops any partial unit.
    fn reset(&mut self);

    fn feed_all(&mut self, bytes: &[u8]) -> Vec<Self::Output> {
        bytes.iter().filter_map(|b| self.feed(*b)).collect()
    }
}

/// Accumulation buffer that never grows past its capacity.
#[derive(Debug, Clone)]
pub struct Accumulator {
    buf: Vec<u8>,
    capacity: usize,
}

impl Accumulator {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a byte. On overflow the partial unit is discarded.
    pub fn push(&mut self, byte: u8) -> Result<(), ProtocolDesync> {
        if self.buf.len() >= self.capacity {
            self.buf.clear();
            return Err(ProtocolDesync::Overflow {
                capacity: self.capacity,
            });
        }
        self.buf.push(byte);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ends_with(&self, suffix: &[u8]) -> bool {
        self.buf.ends_with(suffix)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn take(&mut self) -> Vec<u8> {
        std::mem::replace(&mut self.buf, Vec::with_capacity(self.capacity))
    }
}

/// Splits a stream into units ending with a fixed terminator. After an
/// overflow everything up to the next terminator is dropped.
#[derive(Debug, Clone)]
pub struct TerminatedFrames {
    acc: Accumulator,
    terminator: Vec<u8>,
    discarding: bool,
}

impl TerminatedFrames {
    pub fn new(terminator: &[u8], capacity: usize) -> Self {
        Self {
            acc: Accumulator::new(capacity),
            terminator: terminator.to_vec(),
            discarding: false,
        }
    }

    pub fn pending(&self) -> &[u8] {
        self.acc.as_slice()
    }
}

impl FrameDecoder for TerminatedFrames {
    /// The unit without its terminator.
    type Output = Vec<u8>;

    fn feed(&mut self, byte: u8) -> Option<Vec<u8>> {
        if let Err(desync) = self.acc.push(byte) {
            if !self.discarding {
                log::debug!("Discarding partial reply: {desync}.");
            }
            self.discarding = true;
            return None;
        }
        if !self.acc.ends_with(&self.terminator) {
            return None;
        }
        if self.discarding {
            self.acc.clear();
            self.discarding = false;
            return None;
        }
        let mut unit = self.acc.take();
        unit.truncate(unit.len() - self.terminator.len());
        Some(unit)
    }

    fn reset(&mut self) {
        self.acc.clear();
        self.discarding = false;
    }
}

/// Lets a repeated marker through at most once per interval.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Arms the limiter so the next pass is one full interval away.
    pub fn arm_at(&mut self, now: Instant) {
        self.last = Some(now);
    }

    pub fn ready_at(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Tracks an outstanding request of a request/response protocol.
#[derive(Debug, Clone)]
pub struct ReplyTracker {
    timeout: Duration,
    sent_at: Option<Instant>,
}

impl ReplyTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sent_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.sent_at.is_some()
    }

    pub fn mark_sent_at(&mut self, now: Instant) {
        self.sent_at = Some(now);
    }

    pub fn mark_received(&mut self) {
        self.sent_at = None;
    }

    /// Whether a fresh request should go out now. A reply that has been
    /// pending for longer than the timeout is abandoned.
    pub fn should_request_at(&mut self, now: Instant) -> bool {
        match self.sent_at {
            None => true,
            Some(sent) if now.saturating_duration_since(sent) >= self.timeout => {
                log::debug!("No reply within {:?}, requesting again.", self.timeout);
                self.sent_at = None;
                true
            }
            Some(_) => false,
        }
    }
}

/// Both nibbles of a packed BCD byte, or `None` if either exceeds 9.
pub fn bcd_digits(byte: u8) -> Option<(u8, u8)> {
    let (hi, lo) = (byte >> 4, byte & 0x0f);
    (hi <= 9 && lo <= 9).then_some((hi, lo))
}

/// Parses a run of ASCII decimal digits.
pub fn parse_ascii_digits(digits: &[u8]) -> Option<u32> {
    if digits.is_empty() || digits.len() > 9 || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    Some(
        digits
            .iter()
            .fold(0u32, |acc, d| acc * 10 + u32::from(d - b'0')),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulator_overflow_discards() {
        let mut acc = Accumulator::new(3);
        for b in [1, 2, 3] {
            acc.push(b).unwrap();
        }
        assert_eq!(acc.push(4), Err(ProtocolDesync::Overflow { capacity: 3 }));
        assert!(acc.is_empty());
        acc.push(5).unwrap();
        assert_eq!(acc.as_slice(), &[5]);
    }

    #[test]
    fn test_terminated_frames() {
        let mut frames = TerminatedFrames::new(b"OK\r", 16);
        let units = frames.feed_all(b"3302\rOK\r0123\r");
        assert_eq!(units, vec![b"3302\r".to_vec()]);
        assert_eq!(frames.pending(), b"0123\r");
        let units = frames.feed_all(b"OK\r");
        assert_eq!(units, vec![b"0123\r".to_vec()]);
    }

    #[test]
    fn test_terminated_frames_recover_after_overflow() {
        let mut frames = TerminatedFrames::new(b"\r", 4);
        assert!(frames.feed_all(b"123456").is_empty());
        assert_eq!(frames.feed_all(b"\r12\r"), vec![b"12".to_vec()]);
    }

    #[test]
    fn test_rate_limiter() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(Duration::from_secs(1));
        assert!(limiter.ready_at(start));
        assert!(!limiter.ready_at(start + Duration::from_millis(500)));
        assert!(limiter.ready_at(start + Duration::from_millis(1000)));
        limiter.reset();
        assert!(limiter.ready_at(start + Duration::from_millis(1001)));
    }

    #[test]
    fn test_reply_tracker_times_out() {
        let start = Instant::now();
        let mut tracker = ReplyTracker::new(Duration::from_millis(500));
        assert!(tracker.should_request_at(start));
        tracker.mark_sent_at(start);
        assert!(!tracker.should_request_at(start + Duration::from_millis(100)));
        assert!(tracker.should_request_at(start + Duration::from_millis(500)));
        assert!(!tracker.is_pending());
        tracker.mark_sent_at(start);
        tracker.mark_received();
        assert!(tracker.should_request_at(start));
    }

    #[test]
    fn test_digit_helpers() {
        assert_eq!(bcd_digits(0x56), Some((5, 6)));
        assert_eq!(bcd_digits(0x5a), None);
        assert_eq!(parse_ascii_digits(b"0356"), Some(356));
        assert_eq!(parse_ascii_digits(b"03x6"), None);
        assert_eq!(parse_ascii_digits(b""), None);
    }
}

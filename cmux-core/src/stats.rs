//! Link statistics.
//!
//! Counters are bumped from the receive interrupt and from tasks, so each one
//! is an independent atomic. [`MuxStats::snapshot`] is not a consistent cut
//! across counters.

use portable_atomic::{AtomicU32, Ordering};

/// Running link counters.
#[derive(Default)]
pub struct MuxStats {
    frames_rx: AtomicU32,
    frames_tx: AtomicU32,
    framing_errors: AtomicU32,
    checksum_errors: AtomicU32,
    oversized: AtomicU32,
    unknown_dlci: AtomicU32,
    rx_dropped: AtomicU32,
    tx_dropped: AtomicU32,
    control_errors: AtomicU32,
}

/// Point-in-time copy of [`MuxStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatsSnapshot {
    /// Valid frames decoded.
    pub frames_rx: u32,
    /// Frames handed to the transport.
    pub frames_tx: u32,
    /// Non-flag octets where a closing flag was expected.
    pub framing_errors: u32,
    /// Frames dropped for FCS mismatch.
    pub checksum_errors: u32,
    /// Frames longer than the decoder buffer or channel MTU.
    pub oversized: u32,
    /// Data frames for channels that are not connected.
    pub unknown_dlci: u32,
    /// Payload bytes lost to full receive queues.
    pub rx_dropped: u32,
    /// Replies lost to a full high-priority queue.
    pub tx_dropped: u32,
    /// Malformed or unsupported control channel messages.
    pub control_errors: u32,
}

impl MuxStats {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            frames_rx: AtomicU32::new(0),
            frames_tx: AtomicU32::new(0),
            framing_errors: AtomicU32::new(0),
            checksum_errors: AtomicU32::new(0),
            oversized: AtomicU32::new(0),
            unknown_dlci: AtomicU32::new(0),
            rx_dropped: AtomicU32::new(0),
            tx_dropped: AtomicU32::new(0),
            control_errors: AtomicU32::new(0),
        }
    }

    #[inline]
    fn bump(counter: &AtomicU32, n: u32) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn frame_rx(&self) {
        Self::bump(&self.frames_rx, 1);
    }

    pub(crate) fn frame_tx(&self) {
        Self::bump(&self.frames_tx, 1);
    }

    pub(crate) fn framing_error(&self) {
        Self::bump(&self.framing_errors, 1);
    }

    pub(crate) fn checksum_error(&self) {
        Self::bump(&self.checksum_errors, 1);
    }

    pub(crate) fn oversized(&self) {
        Self::bump(&self.oversized, 1);
    }

    pub(crate) fn unknown_dlci(&self) {
        Self::bump(&self.unknown_dlci, 1);
    }

    pub(crate) fn rx_dropped(&self, bytes: u32) {
        Self::bump(&self.rx_dropped, bytes);
    }

    pub(crate) fn tx_dropped(&self) {
        Self::bump(&self.tx_dropped, 1);
    }

    pub(crate) fn control_error(&self) {
        Self::bump(&self.control_errors, 1);
    }

    /// Read all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_rx: self.frames_rx.load(Ordering::Relaxed),
            frames_tx: self.frames_tx.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            checksum_errors: self.checksum_errors.load(Ordering::Relaxed),
            oversized: self.oversized.load(Ordering::Relaxed),
            unknown_dlci: self.unknown_dlci.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
            control_errors: self.control_errors.load(Ordering::Relaxed),
        }
    }
}

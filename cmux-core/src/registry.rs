//! Channel registry: per-DLCI link state and the receive queue pool.
//!
//! Every field is an independent atomic so the receive interrupt can flip
//! connection flags and bump acknowledgement counters without locking.
//! Multi-step updates (queue allocation and release) run inside a critical
//! section.

use core::num::NonZeroU16;

use cmux_proto::{Dlci, FrameMode, NUM_DLCI};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver};
use portable_atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, Ordering};

/// Capacity of each channel receive queue in bytes.
pub const RX_QUEUE_CAPACITY: usize = 256;

/// Number of receive queues shared by the data channels.
pub const RX_QUEUE_POOL: usize = 4;

const NO_QUEUE: u8 = u8::MAX;

/// Byte queue filled by the receive interrupt.
pub type RxQueue = Channel<CriticalSectionRawMutex, u8, RX_QUEUE_CAPACITY>;

/// Consumer handle of a channel receive queue.
pub type RxReceiver<'a> = Receiver<'a, CriticalSectionRawMutex, u8, RX_QUEUE_CAPACITY>;

/// State of one data link connection.
pub struct ChannelEntry {
    connected: AtomicBool,
    ui: AtomicBool,
    /// Negotiated MTU, 0 while not negotiated.
    mtu: AtomicU16,
    queue: AtomicU8,
    ua_count: AtomicU32,
    dm_count: AtomicU32,
}

impl ChannelEntry {
    const fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            ui: AtomicBool::new(false),
            mtu: AtomicU16::new(0),
            queue: AtomicU8::new(NO_QUEUE),
            ua_count: AtomicU32::new(0),
            dm_count: AtomicU32::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn frame_mode(&self) -> FrameMode {
        if self.ui.load(Ordering::Relaxed) {
            FrameMode::Ui
        } else {
            FrameMode::Uih
        }
    }

    #[inline]
    pub fn set_frame_mode(&self, mode: FrameMode) {
        self.ui.store(mode == FrameMode::Ui, Ordering::Relaxed);
    }

    /// `None` until parameters have been negotiated.
    #[inline]
    #[must_use]
    pub fn mtu(&self) -> Option<NonZeroU16> {
        NonZeroU16::new(self.mtu.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_mtu(&self, mtu: Option<NonZeroU16>) {
        self.mtu
            .store(mtu.map_or(0, NonZeroU16::get), Ordering::Release);
    }

    /// Number of UA responses seen on this DLCI.
    #[inline]
    #[must_use]
    pub fn ua_count(&self) -> u32 {
        self.ua_count.load(Ordering::Acquire)
    }

    /// Number of DM responses seen on this DLCI.
    #[inline]
    #[must_use]
    pub fn dm_count(&self) -> u32 {
        self.dm_count.load(Ordering::Acquire)
    }

    pub(crate) fn record_ua(&self) {
        self.ua_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_dm(&self) {
        self.dm_count.fetch_add(1, Ordering::AcqRel);
    }

    fn queue_slot(&self) -> Option<usize> {
        match self.queue.load(Ordering::Acquire) {
            NO_QUEUE => None,
            slot => Some(usize::from(slot)),
        }
    }
}

/// Fixed table of [`NUM_DLCI`] channel entries plus the receive queue pool.
pub struct ChannelRegistry {
    channels: [ChannelEntry; NUM_DLCI],
    queues: [RxQueue; RX_QUEUE_POOL],
    in_use: [AtomicBool; RX_QUEUE_POOL],
}

impl ChannelRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            channels: [const { ChannelEntry::new() }; NUM_DLCI],
            queues: [const { Channel::new() }; RX_QUEUE_POOL],
            in_use: [const { AtomicBool::new(false) }; RX_QUEUE_POOL],
        }
    }

    /// Entry for `dlci`.
    #[inline]
    #[must_use]
    pub fn get(&self, dlci: Dlci) -> &ChannelEntry {
        &self.channels[dlci.index()]
    }

    /// Receive queue of `dlci`, if one has been allocated.
    #[must_use]
    pub fn queue(&self, dlci: Dlci) -> Option<&RxQueue> {
        self.get(dlci).queue_slot().map(|slot| &self.queues[slot])
    }

    /// Make sure `dlci` owns a receive queue.
    ///
    /// Returns `false` when the pool is exhausted. DLCI 0 never gets one.
    pub fn ensure_queue(&self, dlci: Dlci) -> bool {
        if dlci.is_control() {
            return false;
        }
        let entry = self.get(dlci);
        critical_section::with(|_| {
            if entry.queue_slot().is_some() {
                return true;
            }
            let Some(slot) = self
                .in_use
                .iter()
                .position(|used| !used.load(Ordering::Relaxed))
            else {
                return false;
            };
            self.in_use[slot].store(true, Ordering::Relaxed);
            self.queues[slot].clear();
            entry.queue.store(slot as u8, Ordering::Release);
            true
        })
    }

    /// Return `dlci`'s receive queue to the pool, discarding unread bytes.
    pub fn release_queue(&self, dlci: Dlci) {
        self.release(self.get(dlci));
    }

    /// Put `dlci` back in its initial state: disconnected, MTU not
    /// negotiated, UIH framing and no receive queue.
    pub fn reset(&self, dlci: Dlci) {
        self.reset_entry(self.get(dlci));
    }

    /// Reset every channel (multiplexer closed down).
    pub fn disconnect_all(&self) {
        for entry in &self.channels {
            self.reset_entry(entry);
        }
    }

    fn reset_entry(&self, entry: &ChannelEntry) {
        entry.set_connected(false);
        entry.set_mtu(None);
        entry.set_frame_mode(FrameMode::Uih);
        self.release(entry);
    }

    fn release(&self, entry: &ChannelEntry) {
        critical_section::with(|_| {
            if let Some(slot) = entry.queue_slot() {
                entry.queue.store(NO_QUEUE, Ordering::Release);
                self.queues[slot].clear();
                self.in_use[slot].store(false, Ordering::Relaxed);
            }
        });
    }

    /// Consumer handle for `dlci`'s receive queue.
    #[must_use]
    pub fn receiver(&self, dlci: Dlci) -> Option<RxReceiver<'_>> {
        self.queue(dlci).map(Channel::receiver)
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dlci(n: u8) -> Dlci {
        Dlci::new(n).unwrap()
    }

    #[test]
    fn test_defaults() {
        let registry = ChannelRegistry::new();
        let entry = registry.get(dlci(5));
        assert!(!entry.is_connected());
        assert_eq!(entry.frame_mode(), FrameMode::Uih);
        assert_eq!(entry.mtu(), None);
        assert!(registry.queue(dlci(5)).is_none());
    }

    #[test]
    fn test_mtu_roundtrip() {
        let registry = ChannelRegistry::new();
        let entry = registry.get(dlci(1));
        entry.set_mtu(NonZeroU16::new(32));
        assert_eq!(entry.mtu().map(NonZeroU16::get), Some(32));
        entry.set_mtu(None);
        assert_eq!(entry.mtu(), None);
    }

    #[test]
    fn test_queue_allocation_is_stable() {
        let registry = ChannelRegistry::new();
        assert!(registry.ensure_queue(dlci(2)));
        let first = registry.queue(dlci(2)).unwrap() as *const RxQueue;
        assert!(registry.ensure_queue(dlci(2)));
        let second = registry.queue(dlci(2)).unwrap() as *const RxQueue;
        assert_eq!(first, second);
    }

    #[test]
    fn test_queue_pool_exhaustion() {
        let registry = ChannelRegistry::new();
        for n in 1..=RX_QUEUE_POOL as u8 {
            assert!(registry.ensure_queue(dlci(n)));
        }
        assert!(!registry.ensure_queue(dlci(40)));
        assert!(!registry.ensure_queue(Dlci::CONTROL));
    }

    #[test]
    fn test_released_slot_is_reused_empty() {
        let registry = ChannelRegistry::new();
        for n in 1..=RX_QUEUE_POOL as u8 {
            assert!(registry.ensure_queue(dlci(n)));
        }
        registry.queue(dlci(2)).unwrap().try_send(0xAA).unwrap();
        registry.release_queue(dlci(2));
        assert!(registry.queue(dlci(2)).is_none());

        assert!(registry.ensure_queue(dlci(40)));
        assert!(registry.receiver(dlci(40)).unwrap().try_receive().is_err());
        assert!(!registry.ensure_queue(dlci(41)));
    }

    #[test]
    fn test_disconnect_all() {
        let registry = ChannelRegistry::new();
        registry.get(Dlci::CONTROL).set_connected(true);
        let entry = registry.get(dlci(7));
        entry.set_connected(true);
        entry.set_mtu(NonZeroU16::new(16));
        entry.set_frame_mode(FrameMode::Ui);
        assert!(registry.ensure_queue(dlci(7)));

        registry.disconnect_all();
        assert!(!registry.get(Dlci::CONTROL).is_connected());
        assert!(!entry.is_connected());
        assert_eq!(entry.mtu(), None);
        assert_eq!(entry.frame_mode(), FrameMode::Uih);
        assert!(registry.queue(dlci(7)).is_none());
        for n in 1..=RX_QUEUE_POOL as u8 {
            assert!(registry.ensure_queue(dlci(n)));
        }
    }
}

//! Transmit side: priority-partitioned frame queues and the sink trait.
//!
//! Control traffic (DLCI 0, replies from the receive interrupt, raw AT
//! commands) goes through the high-priority queue so it is never starved by
//! bulk data on other channels. The transmit pump drains high priority first.

use core::future::Future;

use cmux_proto::MAX_FRAME_LEN;
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use portable_atomic::{AtomicBool, Ordering};

/// One encoded frame (or raw AT command) ready for the wire.
pub type TxFrame = heapless::Vec<u8, MAX_FRAME_LEN>;

/// Depth of the high-priority queue.
pub const TX_HIGH_DEPTH: usize = 8;

/// Depth of the low-priority queue.
pub const TX_LOW_DEPTH: usize = 8;

/// Error type for transmit operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// Queue full on a non-blocking send.
    Full,
    /// The sink no longer accepts frames.
    Closed,
}

/// Transmit queue selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Priority {
    /// Control channel and AT traffic.
    High,
    /// Data channel traffic.
    Low,
}

/// Async trait for the outgoing side of the serial link.
///
/// # `no_std` Compatibility
///
/// All implementations must be `#![no_std]` compatible with no heap allocation.
pub trait FrameSink {
    /// Enqueue a frame, waiting for space.
    fn send(&self, priority: Priority, frame: TxFrame)
        -> impl Future<Output = Result<(), TransportError>>;

    /// Enqueue a high-priority frame without waiting (interrupt context).
    fn try_send(&self, frame: TxFrame) -> Result<(), TransportError>;

    /// Allow (`true`) or hold back (`false`) low-priority traffic.
    fn set_flow(&self, enabled: bool);

    /// Wait until every queued high-priority frame has been taken for
    /// transmission.
    fn flush(&self) -> impl Future<Output = ()>;

    /// Drop every queued frame.
    fn clear(&self);
}

/// In-memory transmit queues drained by a UART transmit task.
pub struct TxQueues {
    high: Channel<CriticalSectionRawMutex, TxFrame, TX_HIGH_DEPTH>,
    low: Channel<CriticalSectionRawMutex, TxFrame, TX_LOW_DEPTH>,
    flow_stopped: AtomicBool,
    flow_resumed: Signal<CriticalSectionRawMutex, ()>,
    high_drained: Signal<CriticalSectionRawMutex, ()>,
}

impl TxQueues {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            high: Channel::new(),
            low: Channel::new(),
            flow_stopped: AtomicBool::new(false),
            flow_resumed: Signal::new(),
            high_drained: Signal::new(),
        }
    }

    /// True while the peer has paused data traffic (FCOFF).
    #[inline]
    #[must_use]
    pub fn flow_stopped(&self) -> bool {
        self.flow_stopped.load(Ordering::Acquire)
    }

    /// Wait for the next frame to transmit.
    ///
    /// High-priority frames always win; low-priority frames are held while
    /// flow control is off.
    pub async fn next_frame(&self) -> TxFrame {
        loop {
            if let Ok(frame) = self.high.try_receive() {
                return self.took_high(frame);
            }
            if self.flow_stopped() {
                match select(self.high.receive(), self.flow_resumed.wait()).await {
                    Either::First(frame) => return self.took_high(frame),
                    Either::Second(()) => continue,
                }
            }
            // `select` polls the high-priority queue first.
            match select(self.high.receive(), self.low.receive()).await {
                Either::First(frame) => return self.took_high(frame),
                Either::Second(frame) => return frame,
            }
        }
    }

    /// Take a frame if one is ready, honouring priority and flow control.
    pub fn try_next_frame(&self) -> Option<TxFrame> {
        if let Ok(frame) = self.high.try_receive() {
            return Some(self.took_high(frame));
        }
        if self.flow_stopped() {
            return None;
        }
        self.low.try_receive().ok()
    }

    fn took_high(&self, frame: TxFrame) -> TxFrame {
        if self.high.is_empty() {
            self.high_drained.signal(());
        }
        frame
    }
}

impl Default for TxQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSink for TxQueues {
    async fn send(&self, priority: Priority, frame: TxFrame) -> Result<(), TransportError> {
        match priority {
            Priority::High => self.high.send(frame).await,
            Priority::Low => self.low.send(frame).await,
        }
        Ok(())
    }

    fn try_send(&self, frame: TxFrame) -> Result<(), TransportError> {
        self.high
            .try_send(frame)
            .map_err(|_| TransportError::Full)
    }

    fn set_flow(&self, enabled: bool) {
        self.flow_stopped.store(!enabled, Ordering::Release);
        if enabled {
            self.flow_resumed.signal(());
        }
    }

    async fn flush(&self) {
        while !self.high.is_empty() {
            self.high_drained.wait().await;
        }
    }

    fn clear(&self) {
        self.high.clear();
        self.low.clear();
        self.flow_stopped.store(false, Ordering::Release);
    }
}

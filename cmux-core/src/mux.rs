//! Multiplexer: shared link state and the application API.
//!
//! A single [`Multiplexer`] is shared (usually as a `static`) between the
//! receive interrupt, the session task and application tasks. Every method
//! takes `&self`.
//!
//! Exchanges on the control channel (connect, disconnect, negotiate, test)
//! are serialized by an async mutex, so each reply signal has at most one
//! waiter.

use core::num::NonZeroU16;

use cmux_proto::{
    encode_command_to_vec, encode_control, encode_data_to_vec, segments, Address, CommandType,
    Dlci, FrameMode, FrameType, PnParams, SerializeError, MAX_CONTROL_LEN, MAX_FRAME_LEN,
};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{with_deadline, with_timeout, Duration, Instant};
use portable_atomic::{AtomicU8, Ordering};
use rand_core::RngCore;

use crate::at::AtLine;
use crate::config::MuxConfig;
use crate::registry::{ChannelRegistry, RxReceiver};
use crate::stats::{MuxStats, StatsSnapshot};
use crate::transport::{FrameSink, Priority, TransportError, TxFrame};

/// Largest TEST payload we generate or accept.
pub const MAX_TEST_LEN: usize = 8;

/// Depth of the control event queue read by the session manager.
pub const EVENT_DEPTH: usize = 4;

/// Depth of the raw AT line queue.
pub const AT_LINE_DEPTH: usize = 4;

/// Payload of a TEST command or response.
pub type TestPayload = heapless::Vec<u8, MAX_TEST_LEN>;

/// Error type for multiplexer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MuxError {
    /// DLCI 0 used where a data channel is required.
    InvalidDlci,
    /// Channel (or the control channel) is not connected.
    NotConnected,
    /// Channel MTU has not been negotiated yet.
    NotReady,
    /// No answer within the configured window.
    Timeout,
    /// Peer answered DM, ERROR, or rejected the parameters.
    Refused,
    /// TEST response payload differs from the command.
    TestMismatch,
    /// No receive queue left in the pool.
    NoResources,
    /// Transmit path failure.
    Transport(TransportError),
    /// Frame encoding failure.
    Encode(SerializeError),
}

impl From<TransportError> for MuxError {
    fn from(err: TransportError) -> Self {
        MuxError::Transport(err)
    }
}

impl From<SerializeError> for MuxError {
    fn from(err: SerializeError) -> Self {
        MuxError::Encode(err)
    }
}

/// Which handler the receive entry point feeds bytes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RxMode {
    /// Line-oriented AT responses on the raw link.
    RawAt = 0,
    /// Basic-mode frames.
    Mux = 1,
}

/// Events escalated from the receive interrupt to the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlEvent {
    /// Peer sent a PN command.
    Negotiate(PnParams),
    /// DLCI 0 was disconnected or the peer closed the multiplexer down.
    Closed,
}

/// TS 27.010 basic-mode multiplexer over a [`FrameSink`].
pub struct Multiplexer<T> {
    pub(crate) config: MuxConfig,
    pub(crate) transport: T,
    pub(crate) registry: ChannelRegistry,
    pub(crate) stats: MuxStats,
    rx_mode: AtomicU8,
    exchange: Mutex<CriticalSectionRawMutex, ()>,
    pub(crate) ack: Signal<CriticalSectionRawMutex, Dlci>,
    pub(crate) pn_response: Signal<CriticalSectionRawMutex, PnParams>,
    pub(crate) test_echo: Signal<CriticalSectionRawMutex, TestPayload>,
    pub(crate) events: Channel<CriticalSectionRawMutex, ControlEvent, EVENT_DEPTH>,
    pub(crate) at_lines: Channel<CriticalSectionRawMutex, AtLine, AT_LINE_DEPTH>,
}

impl<T: FrameSink> Multiplexer<T> {
    /// Create a multiplexer in raw-AT mode with every channel disconnected.
    #[must_use]
    pub const fn new(config: MuxConfig, transport: T) -> Self {
        Self {
            config,
            transport,
            registry: ChannelRegistry::new(),
            stats: MuxStats::new(),
            rx_mode: AtomicU8::new(RxMode::RawAt as u8),
            exchange: Mutex::new(()),
            ack: Signal::new(),
            pn_response: Signal::new(),
            test_echo: Signal::new(),
            events: Channel::new(),
            at_lines: Channel::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    #[inline]
    #[must_use]
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Current link counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    #[inline]
    #[must_use]
    pub fn rx_mode(&self) -> RxMode {
        match self.rx_mode.load(Ordering::Acquire) {
            0 => RxMode::RawAt,
            _ => RxMode::Mux,
        }
    }

    /// Select the receive handler.
    pub fn set_rx_mode(&self, mode: RxMode) {
        self.rx_mode.store(mode as u8, Ordering::Release);
    }

    /// True once the SABM/UA handshake has completed for `dlci`.
    #[inline]
    #[must_use]
    pub fn is_connected(&self, dlci: Dlci) -> bool {
        self.registry.get(dlci).is_connected()
    }

    /// Wait for the next event escalated by the receive path.
    pub async fn next_event(&self) -> ControlEvent {
        self.events.receive().await
    }

    /// Open `dlci` with SABM and wait for UA.
    ///
    /// Connecting an already connected channel repeats the handshake and
    /// leaves the channel connected. A failed attempt on a channel that is
    /// not connected returns its receive queue to the pool.
    pub async fn connect(&self, dlci: Dlci) -> Result<(), MuxError> {
        if !dlci.is_control() && !self.registry.ensure_queue(dlci) {
            return Err(MuxError::NoResources);
        }
        let result = self.handshake(dlci, FrameType::Sabm).await;
        let entry = self.registry.get(dlci);
        match result {
            Ok(()) => {
                entry.set_connected(true);
                info!("DLCI {} connected", dlci.raw());
            }
            Err(_) if !entry.is_connected() => self.registry.release_queue(dlci),
            Err(_) => {}
        }
        result
    }

    /// Close `dlci` with DISC.
    ///
    /// The channel is marked disconnected even if the peer does not answer.
    /// Closing DLCI 0 shuts the whole multiplexer down and returns the link
    /// to raw-AT mode.
    pub async fn disconnect(&self, dlci: Dlci) -> Result<(), MuxError> {
        let result = self.handshake(dlci, FrameType::Disc).await;
        self.registry.reset(dlci);
        if dlci.is_control() {
            self.close_down();
        }
        info!("DLCI {} disconnected", dlci.raw());
        match result {
            Ok(()) | Err(MuxError::Refused) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Negotiate frame type and MTU for `dlci` with a PN command.
    ///
    /// Returns the MTU now in effect: the smaller of our proposal and the
    /// peer's answer.
    pub async fn negotiate(&self, dlci: Dlci) -> Result<NonZeroU16, MuxError> {
        if dlci.is_control() {
            return Err(MuxError::InvalidDlci);
        }
        if !self.is_connected(Dlci::CONTROL) {
            return Err(MuxError::NotConnected);
        }
        let _exchange = self.exchange.lock().await;
        let entry = self.registry.get(dlci);
        let proposal =
            PnParams::proposal(dlci, entry.frame_mode(), self.config.local_mtu().get());
        self.pn_response.reset();
        let frame = self.control_frame(CommandType::Pn, true, &proposal.to_bytes())?;
        self.send_frame(Priority::High, frame).await?;

        let answer = async {
            loop {
                let params = self.pn_response.wait().await;
                if params.dlci == dlci {
                    return params;
                }
            }
        };
        let answer = with_timeout(self.config.test_timeout, answer)
            .await
            .map_err(|_| MuxError::Timeout)?;
        let mtu = NonZeroU16::new(answer.max_frame_size.min(proposal.max_frame_size))
            .ok_or(MuxError::Refused)?;
        entry.set_frame_mode(answer.frame_mode);
        entry.set_mtu(Some(mtu));
        debug!("DLCI {} negotiated mtu {}", dlci.raw(), mtu.get());
        Ok(mtu)
    }

    /// Send `data` on `dlci`, split into frames of at most the channel MTU.
    ///
    /// Waits for space in the low-priority transmit queue. Returns the number
    /// of payload bytes queued.
    pub async fn send(&self, dlci: Dlci, data: &[u8]) -> Result<usize, MuxError> {
        if dlci.is_control() {
            return Err(MuxError::InvalidDlci);
        }
        let entry = self.registry.get(dlci);
        if !entry.is_connected() {
            return Err(MuxError::NotConnected);
        }
        let mtu = entry.mtu().ok_or(MuxError::NotReady)?;
        let address = Address::new(dlci, self.config.role.command_cr());
        let mode = entry.frame_mode();

        let mut sent = 0;
        for segment in segments(data, mtu) {
            let frame = encode_data_to_vec::<MAX_FRAME_LEN>(address, mode, segment)?;
            self.send_frame(Priority::Low, frame).await?;
            sent += segment.len();
        }
        Ok(sent)
    }

    /// Read until a newline (included) or until `buf` is full.
    ///
    /// Blocks without timeout.
    pub async fn read_line(&self, dlci: Dlci, buf: &mut [u8]) -> Result<usize, MuxError> {
        let rx = self.data_receiver(dlci)?;
        let mut n = 0;
        while n < buf.len() {
            let byte = rx.receive().await;
            buf[n] = byte;
            n += 1;
            if byte == b'\n' {
                break;
            }
        }
        Ok(n)
    }

    /// Fill `buf`, giving up after `timeout`. Returns the number of bytes read.
    pub async fn read_exact(
        &self,
        dlci: Dlci,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, MuxError> {
        let rx = self.data_receiver(dlci)?;
        let deadline = Instant::now() + timeout;
        let mut n = 0;
        while n < buf.len() {
            match with_deadline(deadline, rx.receive()).await {
                Ok(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                Err(_) => break,
            }
        }
        Ok(n)
    }

    /// Receive queue handle of `dlci` for callers with their own wait logic.
    #[must_use]
    pub fn receiver(&self, dlci: Dlci) -> Option<RxReceiver<'_>> {
        self.registry.receiver(dlci)
    }

    /// Loop-back check: send a TEST command with 1 to 8 random bytes and
    /// require the identical payload back within the test timeout.
    pub async fn connection_test<R: RngCore + ?Sized>(&self, rng: &mut R) -> Result<(), MuxError> {
        let len = 1 + (rng.next_u32() >> 29) as usize;
        let mut payload = [0u8; MAX_TEST_LEN];
        rng.fill_bytes(&mut payload[..len]);
        self.test_link(&payload[..len]).await
    }

    /// Loop-back check with a caller-chosen payload of up to [`MAX_TEST_LEN`] bytes.
    pub async fn test_link(&self, payload: &[u8]) -> Result<(), MuxError> {
        if payload.len() > MAX_TEST_LEN {
            return Err(MuxError::Encode(SerializeError::PayloadTooLarge));
        }
        if !self.is_connected(Dlci::CONTROL) {
            return Err(MuxError::NotConnected);
        }
        let _exchange = self.exchange.lock().await;
        self.test_echo.reset();
        let frame = self.control_frame(CommandType::Test, true, payload)?;
        self.send_frame(Priority::High, frame).await?;
        let echo = with_timeout(self.config.test_timeout, self.test_echo.wait())
            .await
            .map_err(|_| MuxError::Timeout)?;
        if echo.as_slice() == payload {
            Ok(())
        } else {
            warn!("TEST echo mismatch");
            Err(MuxError::TestMismatch)
        }
    }

    fn data_receiver(&self, dlci: Dlci) -> Result<RxReceiver<'_>, MuxError> {
        if dlci.is_control() {
            return Err(MuxError::InvalidDlci);
        }
        self.registry.receiver(dlci).ok_or(MuxError::NotConnected)
    }

    /// Send SABM or DISC on `dlci` and wait for the answer.
    async fn handshake(&self, dlci: Dlci, kind: FrameType) -> Result<(), MuxError> {
        let _exchange = self.exchange.lock().await;
        let entry = self.registry.get(dlci);
        let (ua, dm) = (entry.ua_count(), entry.dm_count());
        self.ack.reset();
        self.send_frame(Priority::High, self.command_frame(dlci, kind, false)?)
            .await?;
        self.await_ack(dlci, ua, dm).await
    }

    /// Wait until the UA or DM counter of `dlci` moves past the given values.
    async fn await_ack(&self, dlci: Dlci, ua: u32, dm: u32) -> Result<(), MuxError> {
        let entry = self.registry.get(dlci);
        let wait = async {
            loop {
                if entry.ua_count() != ua {
                    return Ok(());
                }
                if entry.dm_count() != dm {
                    return Err(MuxError::Refused);
                }
                self.ack.wait().await;
            }
        };
        with_timeout(self.config.connect_timeout, wait)
            .await
            .map_err(|_| MuxError::Timeout)?
    }

    pub(crate) async fn send_frame(&self, priority: Priority, frame: TxFrame) -> Result<(), MuxError> {
        self.transport.send(priority, frame).await?;
        self.stats.frame_tx();
        Ok(())
    }

    /// SABM/UA/DM/DISC with P/F set.
    pub(crate) fn command_frame(
        &self,
        dlci: Dlci,
        kind: FrameType,
        response: bool,
    ) -> Result<TxFrame, SerializeError> {
        let role = self.config.role;
        let cr = if response { role.response_cr() } else { role.command_cr() };
        encode_command_to_vec(
            Address::new(dlci, cr),
            kind,
            true,
            self.config.command_length_field,
        )
    }

    /// UIH frame on DLCI 0 carrying one control message.
    pub(crate) fn control_frame(
        &self,
        kind: CommandType,
        command: bool,
        value: &[u8],
    ) -> Result<TxFrame, SerializeError> {
        let mut buf = [0u8; MAX_CONTROL_LEN];
        let len = encode_control(kind, command, value, &mut buf)?;
        let address = Address::new(Dlci::CONTROL, self.config.role.command_cr());
        encode_data_to_vec(address, FrameMode::Uih, &buf[..len])
    }

    /// Mark everything down and hand the link back to the AT handler.
    pub(crate) fn close_down(&self) {
        self.registry.disconnect_all();
        self.set_rx_mode(RxMode::RawAt);
        if self.events.try_send(ControlEvent::Closed).is_err() {
            warn!("control event queue full, close-down not reported");
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::dispatch::RxDispatcher;
    use crate::testing::{decode_frames, feed, peer_control, peer_frame, test_mux, Rng};
    use crate::transport::TxQueues;
    use cmux_proto::CR;
    use embassy_futures::block_on;
    use embassy_futures::join::join;
    use std::vec::Vec;

    fn dlci(n: u8) -> Dlci {
        Dlci::new(n).unwrap()
    }

    fn open(mux: &Multiplexer<TxQueues>, rx: &mut RxDispatcher<'_, TxQueues>, n: u8) {
        let (result, ()) = block_on(join(mux.connect(dlci(n)), async {
            let sabm = mux.transport().next_frame().await;
            let frames = decode_frames(&sabm);
            assert_eq!(frames[0].kind, FrameType::Sabm);
            feed(rx, &peer_frame(dlci(n), FrameType::Ua));
        }));
        result.unwrap();
    }

    #[test]
    fn test_connect_control_channel() {
        let mux = test_mux();
        let mut rx = RxDispatcher::new(&mux);
        let (result, ()) = block_on(join(mux.connect(Dlci::CONTROL), async {
            let sabm = mux.transport().next_frame().await;
            assert_eq!(sabm.as_slice(), &[0xF9, 0x03, 0x3F, 0xFC, 0xF9]);
            feed(&mut rx, &peer_frame(Dlci::CONTROL, FrameType::Ua));
        }));
        assert_eq!(result, Ok(()));
        assert!(mux.is_connected(Dlci::CONTROL));
    }

    #[test]
    fn test_connect_refused_by_dm() {
        let mux = test_mux();
        let mut rx = RxDispatcher::new(&mux);
        let (result, ()) = block_on(join(mux.connect(dlci(2)), async {
            mux.transport().next_frame().await;
            feed(&mut rx, &peer_frame(dlci(2), FrameType::Dm));
        }));
        assert_eq!(result, Err(MuxError::Refused));
        assert!(!mux.is_connected(dlci(2)));
    }

    #[test]
    fn test_connect_times_out() {
        let mux = test_mux();
        assert_eq!(block_on(mux.connect(dlci(1))), Err(MuxError::Timeout));
        assert!(!mux.is_connected(dlci(1)));
    }

    #[test]
    fn test_ua_for_other_dlci_is_not_an_ack() {
        let mux = test_mux();
        let mut rx = RxDispatcher::new(&mux);
        let (result, ()) = block_on(join(mux.connect(dlci(1)), async {
            mux.transport().next_frame().await;
            feed(&mut rx, &peer_frame(dlci(2), FrameType::Ua));
        }));
        assert_eq!(result, Err(MuxError::Timeout));
    }

    #[test]
    fn test_connect_is_idempotent() {
        let mux = test_mux();
        let mut rx = RxDispatcher::new(&mux);
        open(&mux, &mut rx, 1);
        open(&mux, &mut rx, 1);
        assert!(mux.is_connected(dlci(1)));
        assert!(mux.receiver(dlci(1)).is_some());
    }

    #[test]
    fn test_failed_connects_return_queues() {
        let mux = test_mux();
        for n in 1..=crate::registry::RX_QUEUE_POOL as u8 + 1 {
            assert_eq!(block_on(mux.connect(dlci(n))), Err(MuxError::Timeout));
            assert!(mux.receiver(dlci(n)).is_none());
        }
        mux.transport().clear();

        let mut rx = RxDispatcher::new(&mux);
        open(&mux, &mut rx, 9);
        assert!(mux.receiver(dlci(9)).is_some());
        mux.transport().clear();
        feed(&mut rx, &peer_frame(dlci(10), FrameType::Sabm));
        assert!(mux.is_connected(dlci(10)));
    }

    #[test]
    fn test_refused_connect_returns_queue() {
        let mux = test_mux();
        let mut rx = RxDispatcher::new(&mux);
        let (result, ()) = block_on(join(mux.connect(dlci(2)), async {
            mux.transport().next_frame().await;
            feed(&mut rx, &peer_frame(dlci(2), FrameType::Dm));
        }));
        assert_eq!(result, Err(MuxError::Refused));
        assert!(mux.receiver(dlci(2)).is_none());
    }

    #[test]
    fn test_disconnect_resets_channel() {
        let mux = test_mux();
        let mut rx = RxDispatcher::new(&mux);
        open(&mux, &mut rx, 2);
        mux.registry().get(dlci(2)).set_mtu(NonZeroU16::new(16));
        let (result, ()) = block_on(join(mux.disconnect(dlci(2)), async {
            mux.transport().next_frame().await;
            feed(&mut rx, &peer_frame(dlci(2), FrameType::Ua));
        }));
        assert_eq!(result, Ok(()));
        assert!(!mux.is_connected(dlci(2)));
        assert_eq!(mux.registry().get(dlci(2)).mtu(), None);
        assert!(mux.receiver(dlci(2)).is_none());
    }

    #[test]
    fn test_send_requires_negotiated_mtu() {
        let mux = test_mux();
        let mut rx = RxDispatcher::new(&mux);
        assert_eq!(block_on(mux.send(dlci(3), b"x")), Err(MuxError::NotConnected));
        open(&mux, &mut rx, 3);
        assert_eq!(block_on(mux.send(dlci(3), b"x")), Err(MuxError::NotReady));
        assert_eq!(block_on(mux.send(Dlci::CONTROL, b"x")), Err(MuxError::InvalidDlci));
    }

    #[test]
    fn test_send_segments_by_mtu() {
        let mux = test_mux();
        let mut rx = RxDispatcher::new(&mux);
        open(&mux, &mut rx, 3);
        mux.registry().get(dlci(3)).set_mtu(NonZeroU16::new(4));

        let (sent, payload) = block_on(join(mux.send(dlci(3), b"hello world"), async {
            let mut payload = Vec::new();
            while payload.len() < 11 {
                let frame = mux.transport().next_frame().await;
                for decoded in decode_frames(&frame) {
                    assert!(decoded.payload.len() <= 4);
                    assert_eq!(decoded.address.dlci, dlci(3));
                    payload.extend_from_slice(&decoded.payload);
                }
            }
            payload
        }));
        assert_eq!(sent, Ok(11));
        assert_eq!(payload, b"hello world");
    }

    #[test]
    fn test_ping_on_the_wire() {
        let config = MuxConfig {
            role: crate::config::Role::Responder,
            ..MuxConfig::DEFAULT
        };
        let mux = Multiplexer::new(config, TxQueues::new());
        let entry = mux.registry().get(dlci(3));
        entry.set_connected(true);
        entry.set_mtu(NonZeroU16::new(32));
        assert_eq!(block_on(mux.send(dlci(3), b"PING")), Ok(4));
        let frame = mux.transport().try_next_frame().unwrap();
        assert_eq!(
            frame.as_slice(),
            &[0xF9, 0x0D, 0xEF, 0x09, 0x50, 0x49, 0x4E, 0x47, 0x1D, 0xF9]
        );
    }

    #[test]
    fn test_negotiate_takes_smaller_mtu() {
        let mux = test_mux();
        let mut rx = RxDispatcher::new(&mux);
        mux.registry().get(Dlci::CONTROL).set_connected(true);
        let (result, ()) = block_on(join(mux.negotiate(dlci(2)), async {
            let frame = mux.transport().next_frame().await;
            let decoded = &decode_frames(&frame)[0];
            let msg = cmux_proto::ControlMessage::parse(&decoded.payload).unwrap();
            assert_eq!(msg.kind, CommandType::Pn);
            assert!(msg.command);
            let mut answer = PnParams::from_bytes(msg.value).unwrap();
            answer.max_frame_size = 31;
            feed(&mut rx, &peer_control(CommandType::Pn, false, &answer.to_bytes()));
        }));
        assert_eq!(result.map(NonZeroU16::get), Ok(31));
        assert_eq!(mux.registry().get(dlci(2)).frame_mode(), FrameMode::Uih);
    }

    #[test]
    fn test_negotiate_needs_control_channel() {
        let mux = test_mux();
        assert_eq!(block_on(mux.negotiate(dlci(2))), Err(MuxError::NotConnected));
        assert_eq!(block_on(mux.negotiate(Dlci::CONTROL)), Err(MuxError::InvalidDlci));
    }

    #[test]
    fn test_read_line_and_read_exact() {
        let mux = test_mux();
        let mut rx = RxDispatcher::new(&mux);
        open(&mux, &mut rx, 1);
        let mut frame = [0u8; 32];
        let len = cmux_proto::encode_data(
            Address::new(dlci(1), false),
            FrameMode::Uih,
            b"OK\nrest",
            &mut frame,
        )
        .unwrap();
        feed(&mut rx, &frame[..len]);

        let mut line = [0u8; 16];
        assert_eq!(block_on(mux.read_line(dlci(1), &mut line)), Ok(3));
        assert_eq!(&line[..3], b"OK\n");

        let mut rest = [0u8; 8];
        let n = block_on(mux.read_exact(dlci(1), &mut rest, Duration::from_millis(20))).unwrap();
        assert_eq!(&rest[..n], b"rest");
    }

    #[test]
    fn test_connection_test_roundtrip() {
        let mux = test_mux();
        let mut rx = RxDispatcher::new(&mux);
        mux.registry().get(Dlci::CONTROL).set_connected(true);
        let (result, ()) = block_on(join(mux.test_link(&[1, 2, 3, 4, 5]), async {
            let frame = mux.transport().next_frame().await;
            let decoded = &decode_frames(&frame)[0];
            let msg = cmux_proto::ControlMessage::parse(&decoded.payload).unwrap();
            assert_eq!(decoded.payload[0], CommandType::Test.octet() | CR);
            assert_eq!(msg.value, &[1, 2, 3, 4, 5]);
            feed(&mut rx, &peer_control(CommandType::Test, false, msg.value));
        }));
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn test_connection_test_mismatch_and_timeout() {
        let mux = test_mux();
        let mut rx = RxDispatcher::new(&mux);
        mux.registry().get(Dlci::CONTROL).set_connected(true);
        let mut rng = Rng(7);
        let (result, ()) = block_on(join(mux.connection_test(&mut rng), async {
            let frame = mux.transport().next_frame().await;
            let decoded = &decode_frames(&frame)[0];
            let msg = cmux_proto::ControlMessage::parse(&decoded.payload).unwrap();
            assert!((1..=MAX_TEST_LEN).contains(&msg.value.len()));
            let mut corrupted = msg.value.to_vec();
            corrupted[0] ^= 0xFF;
            feed(&mut rx, &peer_control(CommandType::Test, false, &corrupted));
        }));
        assert_eq!(result, Err(MuxError::TestMismatch));

        assert_eq!(block_on(mux.connection_test(&mut rng)), Err(MuxError::Timeout));
    }

    #[test]
    fn test_disconnect_control_closes_mux() {
        let mux = test_mux();
        let mut rx = RxDispatcher::new(&mux);
        open(&mux, &mut rx, 0);
        open(&mux, &mut rx, 4);
        let (result, ()) = block_on(join(mux.disconnect(Dlci::CONTROL), async {
            let disc = mux.transport().next_frame().await;
            assert_eq!(decode_frames(&disc)[0].kind, FrameType::Disc);
            feed(&mut rx, &peer_frame(Dlci::CONTROL, FrameType::Ua));
        }));
        assert_eq!(result, Ok(()));
        assert!(!mux.is_connected(dlci(4)));
        assert_eq!(mux.rx_mode(), RxMode::RawAt);
        assert_eq!(block_on(mux.next_event()), ControlEvent::Closed);
    }
}

//! Connection manager: reacts to decoded frames in receive-interrupt context.
//!
//! Nothing here blocks. Replies go through [`FrameSink::try_send`] on the
//! high-priority queue and are dropped (and counted) when it is full. PN
//! commands are escalated to the session manager, which answers them from
//! task context.

use core::num::NonZeroU16;

use cmux_proto::{
    CommandType, ControlMessage, DecodeError, Dlci, Frame, FrameType, PnParams, CR,
};

use crate::mux::{ControlEvent, MuxError, Multiplexer, TestPayload};
use crate::transport::{FrameSink, Priority, TxFrame};

impl<T: FrameSink> Multiplexer<T> {
    /// Handle one checksum-valid frame from the decoder.
    pub fn handle_frame(&self, frame: Frame<'_>) {
        self.stats.frame_rx();
        let dlci = frame.address.dlci;
        match frame.kind {
            FrameType::Uih | FrameType::Ui => self.deliver(dlci, frame.payload),
            FrameType::Sabm => self.on_sabm(dlci),
            FrameType::Disc => self.on_disc(dlci),
            FrameType::Ua => {
                self.registry.get(dlci).record_ua();
                self.ack.signal(dlci);
            }
            FrameType::Dm => {
                self.registry.get(dlci).record_dm();
                self.ack.signal(dlci);
            }
        }
    }

    /// Count a frame the decoder dropped.
    pub fn record_decode_error(&self, err: DecodeError) {
        trace!("frame dropped: {:?}", err);
        match err {
            DecodeError::Framing => self.stats.framing_error(),
            DecodeError::Checksum => self.stats.checksum_error(),
            DecodeError::Oversized => self.stats.oversized(),
            DecodeError::ExtendedAddress | DecodeError::UnknownControl => {
                self.stats.unknown_dlci()
            }
        }
    }

    /// Answer a PN command: accept the peer's values, clamping the MTU to
    /// what we can buffer, and reply with the values now in effect.
    pub async fn accept_parameters(&self, request: PnParams) -> Result<PnParams, MuxError> {
        let cap = self.config.local_mtu();
        let mtu = NonZeroU16::new(request.max_frame_size).map_or(cap, |mtu| mtu.min(cap));
        let accepted = PnParams {
            max_frame_size: mtu.get(),
            ..request
        };
        let entry = self.registry.get(request.dlci);
        entry.set_frame_mode(accepted.frame_mode);
        entry.set_mtu(Some(mtu));
        let frame = self.control_frame(CommandType::Pn, false, &accepted.to_bytes())?;
        self.send_frame(Priority::High, frame).await?;
        debug!("DLCI {} accepted mtu {}", request.dlci.raw(), mtu.get());
        Ok(accepted)
    }

    fn deliver(&self, dlci: Dlci, payload: &[u8]) {
        if dlci.is_control() {
            self.on_control(payload);
            return;
        }
        let entry = self.registry.get(dlci);
        if !entry.is_connected() {
            debug!("data for unconnected DLCI {}", dlci.raw());
            self.stats.unknown_dlci();
            return;
        }
        if entry
            .mtu()
            .is_some_and(|mtu| payload.len() > usize::from(mtu.get()))
        {
            self.stats.oversized();
            return;
        }
        let Some(queue) = self.registry.queue(dlci) else {
            self.stats.unknown_dlci();
            return;
        };
        let mut dropped = 0u32;
        for &byte in payload {
            if queue.try_send(byte).is_err() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!("DLCI {} queue full, {} bytes lost", dlci.raw(), dropped);
            self.stats.rx_dropped(dropped);
        }
    }

    fn on_sabm(&self, dlci: Dlci) {
        let entry = self.registry.get(dlci);
        let kind = if dlci.is_control() || self.registry.ensure_queue(dlci) {
            entry.set_connected(true);
            FrameType::Ua
        } else {
            warn!("no receive queue for DLCI {}", dlci.raw());
            FrameType::Dm
        };
        self.reply(self.command_frame(dlci, kind, true).map_err(MuxError::from));
    }

    fn on_disc(&self, dlci: Dlci) {
        let entry = self.registry.get(dlci);
        let kind = if entry.is_connected() {
            self.registry.reset(dlci);
            FrameType::Ua
        } else {
            FrameType::Dm
        };
        self.reply(self.command_frame(dlci, kind, true).map_err(MuxError::from));
        if dlci.is_control() {
            info!("peer closed DLCI 0");
            self.close_down();
        }
    }

    fn on_control(&self, payload: &[u8]) {
        let msg = match ControlMessage::parse(payload) {
            Ok(msg) => msg,
            Err(err) => {
                debug!("bad control message: {:?}", err);
                self.stats.control_error();
                return;
            }
        };
        if !msg.command {
            self.on_control_response(msg);
            return;
        }
        match msg.kind {
            CommandType::Test | CommandType::Msc | CommandType::Psc => {
                self.reply_control(msg.kind, msg.value)
            }
            CommandType::Fcon => {
                self.transport.set_flow(true);
                self.reply_control(msg.kind, msg.value);
            }
            CommandType::Fcoff => {
                self.transport.set_flow(false);
                self.reply_control(msg.kind, msg.value);
            }
            CommandType::Cld => {
                self.reply_control(msg.kind, msg.value);
                info!("peer closed the multiplexer down");
                self.close_down();
            }
            CommandType::Pn => match PnParams::from_bytes(msg.value) {
                Ok(params) => {
                    if self.events.try_send(ControlEvent::Negotiate(params)).is_err() {
                        warn!("control event queue full, PN dropped");
                        self.stats.control_error();
                    }
                }
                Err(_) => self.stats.control_error(),
            },
            CommandType::Nsc => self.stats.control_error(),
            other => {
                self.stats.control_error();
                self.reply_control(CommandType::Nsc, &[other.octet() | CR]);
            }
        }
    }

    fn on_control_response(&self, msg: ControlMessage<'_>) {
        match msg.kind {
            CommandType::Test => match TestPayload::from_slice(msg.value) {
                Ok(echo) => self.test_echo.signal(echo),
                Err(()) => self.stats.control_error(),
            },
            CommandType::Pn => match PnParams::from_bytes(msg.value) {
                Ok(params) => self.pn_response.signal(params),
                Err(_) => self.stats.control_error(),
            },
            CommandType::Nsc => {
                warn!("peer does not support command {:?}", msg.value.first());
                self.stats.control_error();
            }
            // Acknowledgements of commands we never issue.
            _ => {}
        }
    }

    fn reply_control(&self, kind: CommandType, value: &[u8]) {
        self.reply(self.control_frame(kind, false, value).map_err(MuxError::from));
    }

    fn reply(&self, frame: Result<TxFrame, MuxError>) {
        let sent = frame.and_then(|frame| self.transport.try_send(frame).map_err(MuxError::from));
        match sent {
            Ok(()) => self.stats.frame_tx(),
            Err(err) => {
                warn!("reply dropped: {:?}", err);
                self.stats.tx_dropped();
            }
        }
    }
}

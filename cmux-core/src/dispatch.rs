//! Receive entry point.
//!
//! [`RxDispatcher`] owns the per-byte receive state and routes each octet to
//! either the AT line assembler or the frame decoder, depending on the
//! multiplexer's current [`RxMode`]. It is driven from a single context (the
//! UART receive task or interrupt) and never blocks.

use cmux_proto::FrameDecoder;

use crate::at::AtLine;
use crate::mux::{Multiplexer, RxMode};
use crate::transport::FrameSink;

/// Per-byte receive handler bound to one multiplexer.
pub struct RxDispatcher<'a, T> {
    mux: &'a Multiplexer<T>,
    decoder: FrameDecoder,
    line: AtLine,
    mode: RxMode,
}

impl<'a, T: FrameSink> RxDispatcher<'a, T> {
    pub fn new(mux: &'a Multiplexer<T>) -> Self {
        Self {
            mux,
            decoder: FrameDecoder::new().with_command_length(mux.config().command_length_field),
            line: AtLine::new(),
            mode: mux.rx_mode(),
        }
    }

    /// Handle one received octet.
    pub fn on_rx_byte(&mut self, byte: u8) {
        let mode = self.mux.rx_mode();
        if mode != self.mode {
            trace!("receive mode now {:?}", mode);
            self.reset();
            self.mode = mode;
        }
        match mode {
            RxMode::RawAt => self.on_at_byte(byte),
            RxMode::Mux => match self.decoder.push_byte(byte) {
                Ok(Some(frame)) => self.mux.handle_frame(frame),
                Ok(None) => {}
                Err(err) => self.mux.record_decode_error(err),
            },
        }
    }

    /// Handle a block of received octets.
    pub fn on_rx(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.on_rx_byte(byte);
        }
    }

    /// Drop partial lines and frames.
    pub fn reset(&mut self) {
        self.decoder.reset();
        self.line.clear();
    }

    fn on_at_byte(&mut self, byte: u8) {
        if self.line.push(byte).is_err() {
            // Overlong line: nothing useful can be classified from it.
            self.line.clear();
            return;
        }
        if byte == b'\n' {
            let line = core::mem::take(&mut self.line);
            if self.mux.at_lines.try_send(line).is_err() {
                debug!("AT line queue full");
            }
        }
    }
}

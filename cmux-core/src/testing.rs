//! Helpers shared by the unit tests: a fast-timing multiplexer, a frame
//! splitter for captured transmit bytes and frames as the peer would send them.

extern crate std;

use std::vec::Vec;

use cmux_proto::{
    encode_command, encode_control, encode_data, Address, CommandType, Dlci, FrameDecoder,
    FrameMode, FrameType, MAX_CONTROL_LEN,
};
use embassy_time::Duration;
use rand_core::{impls, RngCore};

use crate::config::MuxConfig;
use crate::dispatch::RxDispatcher;
use crate::mux::{Multiplexer, RxMode};
use crate::transport::TxQueues;

/// Multiplexer in frame mode with timeouts short enough for unit tests.
pub fn test_mux() -> Multiplexer<TxQueues> {
    let config = MuxConfig {
        at_response_timeout: Duration::from_millis(50),
        connect_timeout: Duration::from_millis(20),
        retry_backoff: Duration::from_millis(10),
        test_timeout: Duration::from_millis(50),
        ..MuxConfig::DEFAULT
    };
    let mux = Multiplexer::new(config, TxQueues::new());
    mux.set_rx_mode(RxMode::Mux);
    mux
}

/// Owned copy of a decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub address: Address,
    pub kind: FrameType,
    pub poll_final: bool,
    pub payload: Vec<u8>,
}

/// Decode every valid frame in `bytes`.
pub fn decode_frames(bytes: &[u8]) -> Vec<Decoded> {
    let mut decoder = FrameDecoder::new();
    let mut frames = Vec::new();
    for &byte in bytes {
        if let Ok(Some(frame)) = decoder.push_byte(byte) {
            frames.push(Decoded {
                address: frame.address,
                kind: frame.kind,
                poll_final: frame.poll_final,
                payload: frame.payload.to_vec(),
            });
        }
    }
    frames
}

pub fn feed(rx: &mut RxDispatcher<'_, TxQueues>, bytes: &[u8]) {
    rx.on_rx(bytes);
}

/// Command or response frame from a responder-role peer.
pub fn peer_frame(dlci: Dlci, kind: FrameType) -> Vec<u8> {
    let cr = matches!(kind, FrameType::Ua | FrameType::Dm);
    let mut buf = [0u8; 8];
    let len = encode_command(Address::new(dlci, cr), kind, true, &mut buf).unwrap();
    buf[..len].to_vec()
}

/// Control channel message from a responder-role peer.
pub fn peer_control(kind: CommandType, command: bool, value: &[u8]) -> Vec<u8> {
    let mut msg = [0u8; MAX_CONTROL_LEN];
    let len = encode_control(kind, command, value, &mut msg).unwrap();
    let mut buf = [0u8; 32];
    let n = encode_data(
        Address::new(Dlci::CONTROL, false),
        FrameMode::Uih,
        &msg[..len],
        &mut buf,
    )
    .unwrap();
    buf[..n].to_vec()
}

/// Deterministic xorshift generator.
pub struct Rng(pub u32);

impl RngCore for Rng {
    fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    fn next_u64(&mut self) -> u64 {
        impls::next_u64_via_u32(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        impls::fill_bytes_via_next(self, dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

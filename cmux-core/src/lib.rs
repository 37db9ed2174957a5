//! TS 27.010 basic-mode multiplexer core.
//!
//! Platform-agnostic link logic on top of [`cmux_proto`]: channel registry,
//! connection manager, receive dispatch and the session manager. The UART
//! itself stays outside; bytes come in through [`RxDispatcher::on_rx_byte`]
//! and frames go out through a [`FrameSink`] (usually [`TxQueues`], drained
//! by a transmit task).
//!
//! # Architecture
//!
//! ```text
//!   UART RX --> RxDispatcher --+--> AT lines ------------> SessionManager
//!                              |                               |
//!                              +--> FrameDecoder               | AT / SABM / PN
//!                                      |                       v
//!                             Multiplexer::handle_frame    Multiplexer
//!                                      |                       |
//!                           per-DLCI RxQueue, replies      TxQueues --> UART TX
//! ```
//!
//! # Example
//!
//! ```ignore
//! static MUX: Multiplexer<TxQueues> = Multiplexer::new(MuxConfig::DEFAULT, TxQueues::new());
//!
//! // Receive context
//! let mut rx = RxDispatcher::new(&MUX);
//! rx.on_rx_byte(byte);
//!
//! // Session task
//! SessionManager::new(&MUX).run().await;
//!
//! // Application task, once the session is up
//! MUX.connect(dlci).await?;
//! MUX.negotiate(dlci).await?;
//! MUX.send(dlci, b"AT+CSQ\r\n").await?;
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

#[macro_use]
mod fmt;

pub mod at;
pub mod config;
mod connection;
pub mod dispatch;
pub mod mux;
pub mod registry;
pub mod session;
pub mod stats;
pub mod transport;

#[cfg(test)]
mod testing;

pub use at::{classify, AtLine, AtResponse, AT_LINE_LEN};
pub use config::{MuxConfig, Role, DEFAULT_AT_COMMANDS};
pub use dispatch::RxDispatcher;
pub use mux::{ControlEvent, MuxError, Multiplexer, RxMode, TestPayload, MAX_TEST_LEN};
pub use registry::{ChannelEntry, ChannelRegistry, RxQueue, RxReceiver, RX_QUEUE_CAPACITY, RX_QUEUE_POOL};
pub use session::{SessionManager, SessionState};
pub use stats::{MuxStats, StatsSnapshot};
pub use transport::{FrameSink, Priority, TransportError, TxFrame, TxQueues};

pub use cmux_proto::{Dlci, FrameMode, PnParams};

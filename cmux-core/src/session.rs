//! Session manager: brings the multiplexer up and keeps it up.
//!
//! ```text
//! Connecting --(AT sequence OK, DLCI 0 UA)--> Started
//!     ^  |                                       |
//!     |  +--(max attempts reached)--> Stopped    |
//!     +-------------(DLCI 0 closed)--------------+
//! ```
//!
//! While `Started` the manager also answers PN commands escalated by the
//! receive path.

use cmux_proto::Dlci;
use embassy_time::{with_timeout, Duration, Timer};

use crate::mux::{ControlEvent, Multiplexer, RxMode};
use crate::transport::FrameSink;

/// Poll period once the session has given up.
const STOPPED_IDLE: Duration = Duration::from_millis(500);

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    /// Running the AT sequence and opening DLCI 0.
    Connecting,
    /// DLCI 0 is open.
    Started,
    /// Too many failed attempts; waiting for [`SessionManager::restart`].
    Stopped,
}

/// Drives one [`Multiplexer`] through its session lifecycle.
pub struct SessionManager<'a, T> {
    mux: &'a Multiplexer<T>,
    state: SessionState,
    failures: u32,
}

impl<'a, T: FrameSink> SessionManager<'a, T> {
    pub fn new(mux: &'a Multiplexer<T>) -> Self {
        Self {
            mux,
            state: SessionState::Connecting,
            failures: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Consecutive failed connection cycles.
    #[inline]
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Leave `Stopped` and try again from scratch.
    pub fn restart(&mut self) {
        self.failures = 0;
        self.state = SessionState::Connecting;
    }

    /// Run the session forever.
    pub async fn run(&mut self) -> ! {
        loop {
            self.step().await;
        }
    }

    /// Perform one unit of work and return the resulting state.
    pub async fn step(&mut self) -> SessionState {
        self.state = match self.state {
            SessionState::Connecting => self.establish().await,
            SessionState::Started => self.serve().await,
            SessionState::Stopped => {
                Timer::after(STOPPED_IDLE).await;
                SessionState::Stopped
            }
        };
        self.state
    }

    async fn establish(&mut self) -> SessionState {
        let mux = self.mux;
        // Replies to the peer's DISC or CLD go out before the link is reset.
        if with_timeout(mux.config().connect_timeout, mux.transport().flush())
            .await
            .is_err()
        {
            warn!("transmit queue stalled, dropping pending frames");
        }
        mux.transport().clear();
        mux.registry().disconnect_all();
        mux.set_rx_mode(RxMode::RawAt);
        mux.flush_at_lines();
        mux.events.clear();

        for command in mux.config().at_commands {
            if let Err(err) = mux.send_at_command(command).await {
                warn!("AT setup failed: {:?}", err);
                return self.fail().await;
            }
        }

        mux.set_rx_mode(RxMode::Mux);
        for attempt in 0..mux.config().connect_retries {
            match mux.connect(Dlci::CONTROL).await {
                Ok(()) => {
                    info!("multiplexer started");
                    self.failures = 0;
                    return SessionState::Started;
                }
                Err(err) => debug!("DLCI 0 attempt {} failed: {:?}", attempt + 1, err),
            }
        }
        mux.set_rx_mode(RxMode::RawAt);
        self.fail().await
    }

    async fn serve(&mut self) -> SessionState {
        match self.mux.next_event().await {
            ControlEvent::Negotiate(params) => {
                if let Err(err) = self.mux.accept_parameters(params).await {
                    warn!("PN answer failed: {:?}", err);
                }
                SessionState::Started
            }
            ControlEvent::Closed => {
                info!("multiplexer closed, reconnecting");
                SessionState::Connecting
            }
        }
    }

    async fn fail(&mut self) -> SessionState {
        self.failures += 1;
        if self
            .mux
            .config()
            .max_session_attempts
            .is_some_and(|max| self.failures >= max)
        {
            error!("giving up after {} attempts", self.failures);
            return SessionState::Stopped;
        }
        Timer::after(self.mux.config().retry_backoff).await;
        SessionState::Connecting
    }
}

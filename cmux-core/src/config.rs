//! Multiplexer configuration.

use core::num::NonZeroU16;

use cmux_proto::MAX_MTU;
use embassy_time::Duration;

/// AT commands that switch a modem into basic-mode multiplexing.
pub const DEFAULT_AT_COMMANDS: &[&str] = &[
    "AT\r\n",
    "AT\\Q3\r\n",
    "AT&S0\r\n",
    "AT+CMUX=?\r\n",
    "AT+CMUX=0\r\n",
];

/// Which end of the link this multiplexer plays.
///
/// The initiator is the side that sent `AT+CMUX` and opened DLCI 0; it sets
/// the C/R bit on commands and clears it on responses. The responder does the
/// opposite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    #[default]
    Initiator,
    Responder,
}

impl Role {
    /// C/R bit for commands (SABM, DISC, UIH) we originate.
    #[inline]
    #[must_use]
    pub const fn command_cr(self) -> bool {
        matches!(self, Role::Initiator)
    }

    /// C/R bit for responses (UA, DM) we send.
    #[inline]
    #[must_use]
    pub const fn response_cr(self) -> bool {
        !self.command_cr()
    }
}

/// Timing, retry and sizing parameters of the multiplexer.
#[derive(Debug, Clone, Copy)]
pub struct MuxConfig {
    /// Setup sequence sent on the raw link before the multiplexer starts.
    pub at_commands: &'static [&'static str],
    /// Attempts per AT command before the sequence is abandoned.
    pub at_retries: u8,
    /// How long to wait for a final result code after each AT command.
    pub at_response_timeout: Duration,
    /// Maximum number of lines inspected per AT attempt.
    pub at_max_lines: u8,
    /// Wait window for UA/DM after SABM or DISC.
    pub connect_timeout: Duration,
    /// SABM attempts on DLCI 0 per session cycle.
    pub connect_retries: u8,
    /// Pause after a failed session cycle.
    pub retry_backoff: Duration,
    /// Wait window for TEST and PN responses.
    pub test_timeout: Duration,
    /// Failed session cycles before giving up (`None` retries forever).
    pub max_session_attempts: Option<u32>,
    /// Send and expect an empty length octet on SABM/UA/DM/DISC.
    pub command_length_field: bool,
    /// Largest information field we propose or accept.
    pub mtu: NonZeroU16,
    pub role: Role,
}

impl MuxConfig {
    /// Configuration used when nothing else is specified.
    pub const DEFAULT: Self = Self {
        at_commands: DEFAULT_AT_COMMANDS,
        at_retries: 3,
        at_response_timeout: Duration::from_secs(5),
        at_max_lines: 30,
        connect_timeout: Duration::from_millis(50),
        connect_retries: 3,
        retry_backoff: Duration::from_millis(5000),
        test_timeout: Duration::from_millis(1000),
        max_session_attempts: None,
        command_length_field: false,
        mtu: match NonZeroU16::new(98) {
            Some(mtu) => mtu,
            None => unreachable!(),
        },
        role: Role::Initiator,
    };

    /// Local MTU capped to the decoder buffer.
    #[must_use]
    pub fn local_mtu(&self) -> NonZeroU16 {
        let cap = u16::try_from(MAX_MTU).unwrap_or(u16::MAX);
        if self.mtu.get() > cap {
            NonZeroU16::new(cap).unwrap_or(self.mtu)
        } else {
            self.mtu
        }
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

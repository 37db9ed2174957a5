//! Raw AT command exchange used before the multiplexer starts.

use cmux_proto::SerializeError;
use embassy_time::{with_deadline, Instant};

use crate::mux::{MuxError, Multiplexer};
use crate::transport::{FrameSink, Priority, TxFrame};

/// Longest response line kept; longer lines are discarded.
pub const AT_LINE_LEN: usize = 80;

/// One `\n`-terminated response line.
pub type AtLine = heapless::Vec<u8, AT_LINE_LEN>;

/// Final result code of an AT command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AtResponse {
    Ok,
    Error,
}

/// Classify a response line. Echoes and intermediate lines yield `None`.
#[must_use]
pub fn classify(line: &[u8]) -> Option<AtResponse> {
    let line = line.trim_ascii();
    if line == b"OK" {
        Some(AtResponse::Ok)
    } else if line == b"ERROR" || line.starts_with(b"+CME ERROR:") {
        Some(AtResponse::Error)
    } else {
        None
    }
}

impl<T: FrameSink> Multiplexer<T> {
    /// Send `command` on the raw link and wait for its final result code.
    ///
    /// The command is retried up to `at_retries` times. Each attempt waits
    /// `at_response_timeout` and looks at no more than `at_max_lines` lines.
    pub async fn send_at_command(&self, command: &str) -> Result<(), MuxError> {
        let frame = TxFrame::from_slice(command.as_bytes())
            .map_err(|()| MuxError::Encode(SerializeError::BufferTooSmall))?;
        for attempt in 0..self.config.at_retries {
            self.send_frame(Priority::High, frame.clone()).await?;
            let deadline = Instant::now() + self.config.at_response_timeout;
            for _ in 0..self.config.at_max_lines {
                let Ok(line) = with_deadline(deadline, self.at_lines.receive()).await else {
                    break;
                };
                match classify(&line) {
                    Some(AtResponse::Ok) => return Ok(()),
                    Some(AtResponse::Error) => {
                        warn!("AT command rejected");
                        return Err(MuxError::Refused);
                    }
                    None => {}
                }
            }
            debug!("no AT result, attempt {}", attempt + 1);
        }
        Err(MuxError::Timeout)
    }

    /// Discard response lines left over from an earlier exchange.
    pub fn flush_at_lines(&self) {
        self.at_lines.clear();
    }
}

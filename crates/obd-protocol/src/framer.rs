//! ELM327 Command Framing
//!
//! Commands are ASCII terminated by a carriage return. The interpreter
//! answers with one or more CR-separated lines and then prints the `>`
//! prompt, which is the only reliable end-of-response marker.

use crate::error::TransportError;
use crate::transport::Transport;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// End-of-response prompt
pub const PROMPT: u8 = b'>';
/// Command terminator
pub const TERMINATOR: u8 = b'\r';
/// Responses longer than this are treated as a runaway stream
pub const MAX_RESPONSE_BYTES: usize = 4096;

/// Turns commands into wire bytes and reads back prompt-terminated responses
pub struct Framer {
    transport: Box<dyn Transport>,
    timeout: Duration,
    /// A late answer to a timed-out command may still be in flight
    stale: bool,
}

impl Framer {
    pub fn new(transport: Box<dyn Transport>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            stale: false,
        }
    }

    /// Open the underlying transport
    pub async fn open(&mut self) -> Result<(), TransportError> {
        self.stale = false;
        self.transport.connect().await
    }

    /// Close the underlying transport
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.transport.close().await
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    /// Send a command and return the cleaned response lines joined by spaces
    pub async fn send(&mut self, command: &str) -> Result<String, TransportError> {
        Ok(self.send_lines(command).await?.join(" "))
    }

    /// Send a command and return the cleaned, non-empty response lines
    pub async fn send_lines(&mut self, command: &str) -> Result<Vec<String>, TransportError> {
        let timeout = self.timeout;
        self.send_lines_with_timeout(command, timeout).await
    }

    /// Like [`Framer::send_lines`] with an explicit deadline for this command
    pub async fn send_lines_with_timeout(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, TransportError> {
        let mut wire = Vec::with_capacity(command.len() + 1);
        wire.extend_from_slice(command.trim().as_bytes());
        wire.push(TERMINATOR);

        if self.stale {
            self.discard_pending().await?;
        }

        debug!("Sending to adapter: {:?}", command);
        self.transport.send(&wire).await?;

        let raw = match self.read_until_prompt(timeout).await {
            Ok(raw) => raw,
            Err(e) => {
                self.stale = matches!(e, TransportError::Timeout(_));
                return Err(e);
            }
        };
        let lines = clean_response(command, &raw);
        debug!("Adapter response to {}: {:?}", command, lines);
        Ok(lines)
    }

    /// Drop whatever is already buffered without waiting for more
    async fn discard_pending(&mut self) -> Result<(), TransportError> {
        let mut chunk = [0u8; 128];
        let mut dropped = 0;
        while let Ok(read) = tokio::time::timeout(Duration::ZERO, self.transport.receive(&mut chunk)).await {
            match read? {
                0 => return Err(TransportError::Closed),
                n => dropped += n,
            }
        }
        if dropped > 0 {
            debug!("Discarded {} stale bytes from {}", dropped, self.describe());
        }
        self.stale = false;
        Ok(())
    }

    async fn read_until_prompt(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut response = Vec::with_capacity(64);
        let mut chunk = [0u8; 128];

        loop {
            let n = tokio::time::timeout_at(deadline, self.transport.receive(&mut chunk))
                .await
                .map_err(|_| TransportError::Timeout(timeout))??;

            if n == 0 {
                return Err(TransportError::Closed);
            }

            trace!("Received {} bytes", n);
            response.extend_from_slice(&chunk[..n]);

            if let Some(end) = response.iter().position(|b| *b == PROMPT) {
                response.truncate(end);
                return Ok(response);
            }

            if response.len() > MAX_RESPONSE_BYTES {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("no prompt within {} bytes", MAX_RESPONSE_BYTES),
                )));
            }
        }
    }
}

/// Split a raw response into trimmed lines, dropping the prompt, NUL
/// padding, blank lines and the echoed command
pub fn clean_response(command: &str, raw: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(raw);
    let echo = compact_upper(command);

    text.split(|c| c == '\r' || c == '\n')
        .map(|line| {
            line.chars()
                .filter(|c| *c != '\0' && *c != PROMPT as char)
                .collect::<String>()
                .trim()
                .to_string()
        })
        .filter(|line| !line.is_empty())
        .filter(|line| compact_upper(line) != echo)
        .collect()
}

fn compact_upper(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Reply, ScriptedTransport};

    #[test]
    fn test_clean_strips_echo_and_prompt() {
        let lines = clean_response("010C", b"010C\r41 0C 1A F8\r\r>");
        assert_eq!(lines, vec!["41 0C 1A F8".to_string()]);
    }

    #[test]
    fn test_clean_keeps_multiline_payload() {
        let raw = b"\r014\r0: 49 02 01 31 48 47\r1: 43 4D 38 32 36 33 33\r\n>";
        let lines = clean_response("0902", raw);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "014");
        assert!(lines[2].starts_with("1:"));
    }

    #[tokio::test]
    async fn test_send_reassembles_chunked_response() {
        let transport = ScriptedTransport::new(|cmd| match cmd {
            "ATI" => Reply::text("ELM327 v1.5 with a long banner string"),
            _ => Reply::Default,
        })
        .with_chunk_size(3);
        let sent = transport.history();

        let mut framer = Framer::new(Box::new(transport), Duration::from_millis(200));
        framer.open().await.unwrap();
        let response = framer.send("ATI").await.unwrap();

        assert_eq!(response, "ELM327 v1.5 with a long banner string");
        assert_eq!(sent.commands(), vec!["ATI".to_string()]);
    }

    #[tokio::test]
    async fn test_send_times_out_without_prompt() {
        let transport = ScriptedTransport::new(|_| Reply::Silent);
        let mut framer = Framer::new(Box::new(transport), Duration::from_millis(30));
        framer.open().await.unwrap();

        assert!(matches!(
            framer.send("ATZ").await,
            Err(TransportError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_send_recovers_after_timeout() {
        let mut first = true;
        let transport = ScriptedTransport::new(move |cmd| match cmd {
            "ATZ" if first => {
                first = false;
                Reply::Silent
            }
            _ => Reply::Default,
        });
        let mut framer = Framer::new(Box::new(transport), Duration::from_millis(30));
        framer.open().await.unwrap();

        assert!(framer.send("ATZ").await.is_err());
        assert_eq!(framer.send("010D").await.unwrap(), "41 0D 32");
    }

    #[tokio::test]
    async fn test_send_reports_closed_channel() {
        let transport = ScriptedTransport::new(|_| Reply::Hangup);
        let mut framer = Framer::new(Box::new(transport), Duration::from_millis(100));
        framer.open().await.unwrap();

        assert!(matches!(framer.send("ATZ").await, Err(TransportError::Closed)));
    }
}

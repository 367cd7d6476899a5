//! Serial link plumbing shared by the stage and velocimeter drivers.
//!
//! Both devices speak line-oriented ASCII over an 8-N-1 serial port. The
//! [`Transport`] trait is the hardware seam; [`SerialLink`] adds command
//! termination and response framing on top of it.

#[cfg(test)]
pub(crate) mod mock;

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use crate::error::RigError;

/// Responses longer than this are handed back even without a terminator
const MAX_LINE_LEN: usize = 256;

/// Byte-level access to a serial device
pub trait Transport: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    /// Read whatever arrives within the port's own read timeout.
    /// Returns `Ok(0)` when nothing arrived.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Drop everything in the receive buffer
    fn clear_input(&mut self) -> io::Result<()>;

    fn bytes_available(&mut self) -> io::Result<usize>;
}

/// Port parameters common to both devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSettings {
    pub port: String,
    pub baud_rate: u32,
}

/// [`Transport`] over a real serial port
pub struct SerialPortTransport {
    port: Box<dyn SerialPort>,
}

impl SerialPortTransport {
    /// Open a port at 8-N-1 without flow control.
    ///
    /// The port-level read timeout is kept short; response deadlines are
    /// enforced by [`SerialLink`].
    pub fn open(settings: &PortSettings) -> Result<Self, RigError> {
        debug!("Opening {} @ {} baud", settings.port, settings.baud_rate);

        let port = serialport::new(&settings.port, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|e| {
                RigError::Connection(format!("Failed to open {}: {}", settings.port, e))
            })?;

        Ok(Self { port })
    }
}

impl Transport for SerialPortTransport {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(io::Error::from)
    }
}

/// Line framing over a [`Transport`].
///
/// Commands get the configured terminator appended. Responses end at CR or
/// LF; when a device sends an unterminated burst, whatever arrived before
/// the deadline is returned instead.
pub struct SerialLink {
    name: String,
    transport: Box<dyn Transport>,
    terminator: String,
    response_timeout: Duration,
    pending: Vec<u8>,
}

impl SerialLink {
    pub fn new(
        name: impl Into<String>,
        transport: Box<dyn Transport>,
        terminator: impl Into<String>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            terminator: terminator.into(),
            response_timeout,
            pending: Vec::with_capacity(MAX_LINE_LEN),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Write `text` followed by the line terminator
    pub fn send_line(&mut self, text: &str) -> io::Result<()> {
        let payload = format!("{}{}", text, self.terminator);
        trace!("[{}] -> {:?}", self.name, payload);
        self.transport.write_all(payload.as_bytes())?;
        self.transport.flush()
    }

    /// Discard buffered input, both in the port and in the framer
    pub fn clear_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.transport.clear_input()
    }

    /// Clear input, send a command and wait for its single-line reply
    pub fn request(&mut self, command: &str) -> io::Result<Option<String>> {
        self.clear_input()?;
        self.send_line(command)?;
        self.read_line()
    }

    /// Read one response line within the response timeout.
    ///
    /// Returns `Ok(None)` only when nothing at all arrived.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        let deadline = Instant::now() + self.response_timeout;
        let mut buf = [0u8; 128];

        loop {
            if let Some(line) = self.take_line() {
                trace!("[{}] <- {:?}", self.name, line);
                return Ok(Some(line));
            }
            if Instant::now() >= deadline || self.pending.len() >= MAX_LINE_LEN {
                break;
            }

            let n = self.transport.read_available(&mut buf)?;
            if n > 0 {
                self.pending.extend_from_slice(&buf[..n]);
            } else {
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        // No terminator: take whatever the device managed to send
        let available = self.transport.bytes_available()?;
        if available > 0 {
            let mut rest = vec![0u8; available];
            let n = self.transport.read_available(&mut rest)?;
            self.pending.extend_from_slice(&rest[..n]);
        }

        let partial = decode(&self.pending);
        self.pending.clear();
        if partial.is_empty() {
            Ok(None)
        } else {
            debug!("[{}] unterminated response {:?}", self.name, partial);
            Ok(Some(partial))
        }
    }

    /// Pop the next complete, non-empty line from the framer buffer
    fn take_line(&mut self) -> Option<String> {
        while let Some(end) = self.pending.iter().position(|b| is_line_end(*b)) {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            let text = decode(&line);
            if !text.is_empty() {
                return Some(text);
            }
        }
        None
    }
}

fn is_line_end(byte: u8) -> bool {
    byte == b'\r' || byte == b'\n'
}

fn decode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| b.is_ascii() && !is_line_end(**b))
        .map(|b| *b as char)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Lifecycle of a driver's link; the driver owns it behind a mutex
pub enum LinkState {
    Closed,
    Open(SerialLink),
}

impl LinkState {
    pub fn is_open(&self) -> bool {
        matches!(self, LinkState::Open(_))
    }

    pub fn link_mut(&mut self) -> Result<&mut SerialLink, RigError> {
        match self {
            LinkState::Open(link) => Ok(link),
            LinkState::Closed => Err(RigError::Connection("link is not open".to_string())),
        }
    }

    /// Move out the open link, leaving `Closed` behind
    pub fn take(&mut self) -> Option<SerialLink> {
        match std::mem::replace(self, LinkState::Closed) {
            LinkState::Open(link) => Some(link),
            LinkState::Closed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;

    fn link(transport: &MockTransport) -> SerialLink {
        SerialLink::new(
            "test",
            Box::new(transport.clone()),
            "\r",
            Duration::from_millis(60),
        )
    }

    #[test]
    fn test_request_appends_terminator() {
        let transport = MockTransport::new();
        transport.reply("V", "R\r");
        let mut link = link(&transport);

        assert_eq!(link.request("V").unwrap(), Some("R".to_string()));
        assert_eq!(transport.raw_written(), "V\r");
    }

    #[test]
    fn test_partial_response_fallback() {
        let transport = MockTransport::new();
        transport.reply("X", "+0001234");
        let mut link = link(&transport);

        let start = Instant::now();
        let response = link.request("X").unwrap();
        assert_eq!(response, Some("+0001234".to_string()));
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_silence_reads_as_none() {
        let transport = MockTransport::new();
        let mut link = link(&transport);
        assert_eq!(link.request("?V").unwrap(), None);
    }

    #[test]
    fn test_lines_are_kept_across_reads() {
        let transport = MockTransport::new();
        let mut link = link(&transport);
        transport.feed("1,2,3\r\n\r\n4,5,6\r");

        assert_eq!(link.read_line().unwrap(), Some("1,2,3".to_string()));
        assert_eq!(link.read_line().unwrap(), Some("4,5,6".to_string()));
        assert_eq!(link.read_line().unwrap(), None);
    }

    #[test]
    fn test_closed_link_is_connection_error() {
        let mut state = LinkState::Closed;
        assert!(matches!(state.link_mut(), Err(RigError::Connection(_))));
        assert!(state.take().is_none());
    }
}

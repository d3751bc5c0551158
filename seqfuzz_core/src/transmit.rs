//! Sending fuzzed messages to the target.

use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// Response bytes beyond this are dropped.
const MAX_RESPONSE_LEN: usize = 1 << 20;
const READ_CHUNK: usize = 4096;
/// Silence that ends the unsolicited-data drain.
const DRAIN_QUIET: Duration = Duration::from_millis(50);

/// Result of one send attempt. Only [`TransmitOutcome::Responded`] counts as
/// success; a silent target is indistinguishable from a crashed one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransmitOutcome {
    Responded,
    NoResponse,
    Failed(String),
}

impl TransmitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransmitOutcome::Responded)
    }
}

pub trait Transmitter {
    /// Sends `message` in a fresh exchange with the target.
    fn transmit(&mut self, message: &[u8]) -> TransmitOutcome;

    /// Bytes received by the last [`Transmitter::transmit`], empty unless it
    /// succeeded.
    fn last_response(&self) -> &[u8];

    /// Checks that the target accepts connections again.
    fn handshake(&mut self) -> bool;
}

/// Host and port of the fuzzed service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddress {
    pub host: String,
    pub port: u16,
}

impl TargetAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One TCP connection per message, with a single timeout bounding connecting,
/// writing and each read.
#[derive(Debug)]
pub struct TcpTransmitter {
    target: TargetAddress,
    timeout: Duration,
    response: Vec<u8>,
}

impl TcpTransmitter {
    pub fn new(target: TargetAddress, timeout: Duration) -> Self {
        Self {
            target,
            timeout,
            response: Vec::new(),
        }
    }

    pub fn target(&self) -> &TargetAddress {
        &self.target
    }

    fn connect(&self) -> io::Result<TcpStream> {
        let mut last_error = None;
        for addr in (self.target.host.as_str(), self.target.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                ErrorKind::NotFound,
                format!("{} did not resolve to any address", self.target),
            )
        }))
    }

    /// Discards whatever the target sent on its own before the request, such
    /// as a greeting banner. Stops after [`DRAIN_QUIET`] without data, or once
    /// the timeout has passed.
    fn drain_unsolicited(&self, stream: &mut TcpStream) -> io::Result<()> {
        let deadline = Instant::now() + self.timeout;
        let quiet = DRAIN_QUIET.min(self.timeout).max(Duration::from_millis(1));
        let mut scratch = [0u8; READ_CHUNK];
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            stream.set_read_timeout(Some(quiet.min(left).max(Duration::from_millis(1))))?;
            match stream.read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => log::debug!("Discarded {n} unsolicited bytes"),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn exchange(&mut self, stream: &mut TcpStream, message: &[u8]) -> io::Result<()> {
        self.drain_unsolicited(stream)?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.write_all(message)?;
        stream.flush()?;

        stream.set_read_timeout(Some(self.timeout))?;
        let mut chunk = [0u8; READ_CHUNK];
        while self.response.len() < MAX_RESPONSE_LEN {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.response.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Transmitter for TcpTransmitter {
    fn transmit(&mut self, message: &[u8]) -> TransmitOutcome {
        self.response.clear();
        let mut stream = match self.connect() {
            Ok(stream) => stream,
            Err(e) => {
                log::debug!("Connecting to {} failed: {}", self.target, e);
                return TransmitOutcome::Failed(e.to_string());
            }
        };
        let result = self.exchange(&mut stream, message);
        let _ = stream.shutdown(Shutdown::Both);
        match result {
            Err(e) => {
                log::debug!("Exchange with {} failed: {}", self.target, e);
                self.response.clear();
                TransmitOutcome::Failed(e.to_string())
            }
            Ok(()) if self.response.is_empty() => TransmitOutcome::NoResponse,
            Ok(()) => TransmitOutcome::Responded,
        }
    }

    fn last_response(&self) -> &[u8] {
        &self.response
    }

    fn handshake(&mut self) -> bool {
        match self.connect() {
            Ok(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
                true
            }
            Err(e) => {
                log::debug!("Handshake with {} failed: {}", self.target, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn local_listener() -> (TcpListener, TargetAddress) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, TargetAddress::new("127.0.0.1", port))
    }

    #[test]
    fn echo_target_responds() {
        let (listener, target) = local_listener();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).unwrap();
            conn.write_all(&buf[..n]).unwrap();
        });

        let mut transmitter = TcpTransmitter::new(target, Duration::from_secs(2));
        let outcome = transmitter.transmit(b"HELLO\n");
        server.join().unwrap();
        assert_eq!(outcome, TransmitOutcome::Responded);
        assert_eq!(transmitter.last_response(), b"HELLO\n");
    }

    #[test]
    fn greeting_banner_is_not_taken_for_a_response() {
        let (listener, target) = local_listener();
        let rounds = 10;
        let server = thread::spawn(move || {
            for _ in 0..rounds {
                let (mut conn, _) = listener.accept().unwrap();
                conn.write_all(b"BANNER\n").unwrap();
                let mut buf = [0u8; 64];
                let n = conn.read(&mut buf).unwrap();
                conn.write_all(&buf[..n]).unwrap();
            }
        });

        let mut transmitter = TcpTransmitter::new(target, Duration::from_secs(2));
        for _ in 0..rounds {
            assert_eq!(transmitter.transmit(b"REQ\n"), TransmitOutcome::Responded);
            assert_eq!(transmitter.last_response(), b"REQ\n");
        }
        server.join().unwrap();
    }

    #[test]
    fn banner_only_target_is_silent() {
        let (listener, target) = local_listener();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"220 ready\r\n").unwrap();
            let mut buf = [0u8; 64];
            let _ = conn.read(&mut buf);
            thread::sleep(Duration::from_millis(400));
        });

        let mut transmitter = TcpTransmitter::new(target, Duration::from_millis(150));
        assert_eq!(transmitter.transmit(b"HELP\r\n"), TransmitOutcome::NoResponse);
        assert!(transmitter.last_response().is_empty());
        server.join().unwrap();
    }

    #[test]
    fn silent_target_is_a_failure() {
        let (listener, target) = local_listener();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let _ = conn.read(&mut buf);
            thread::sleep(Duration::from_millis(400));
        });

        let mut transmitter = TcpTransmitter::new(target, Duration::from_millis(100));
        let outcome = transmitter.transmit(b"ping");
        assert_eq!(outcome, TransmitOutcome::NoResponse);
        assert!(!outcome.is_success());
        assert!(transmitter.last_response().is_empty());
        server.join().unwrap();
    }

    #[test]
    fn closed_port_fails_to_connect() {
        let (listener, target) = local_listener();
        drop(listener);
        let mut transmitter = TcpTransmitter::new(target, Duration::from_millis(200));
        assert!(matches!(
            transmitter.transmit(b"x"),
            TransmitOutcome::Failed(_)
        ));
        assert!(!transmitter.handshake());
    }

    #[test]
    fn handshake_succeeds_on_listening_target() {
        let (listener, target) = local_listener();
        let server = thread::spawn(move || {
            let _ = listener.accept();
        });
        let mut transmitter = TcpTransmitter::new(target.clone(), Duration::from_secs(1));
        assert!(transmitter.handshake());
        assert_eq!(transmitter.target().to_string(), target.to_string());
        server.join().unwrap();
    }
}

//! External signal generator used as a trigger source

use crate::error::{Result, StreamError};
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// SCPI socket port
pub const SCPI_PORT: u16 = 5025;

/// A bench instrument that can emit a trigger on command
#[cfg_attr(test, mockall::automock)]
pub trait SignalGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Emit one trigger
    fn trigger(&self) -> Result<()>;
}

/// Generator driven by SCPI `*TRG` over a raw socket
#[derive(Debug, Clone)]
pub struct ScpiSignalGenerator {
    host: String,
    port: u16,
    timeout: Duration,
}

impl ScpiSignalGenerator {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port: SCPI_PORT,
            timeout,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl SignalGenerator for ScpiSignalGenerator {
    fn name(&self) -> &str {
        &self.host
    }

    fn trigger(&self) -> Result<()> {
        let fail = |e: std::io::Error| StreamError::Trigger(format!("{}: {}", self.host, e));

        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(fail)?
            .next()
            .ok_or_else(|| StreamError::Trigger(format!("{}: no address", self.host)))?;
        let mut stream = TcpStream::connect_timeout(&addr, self.timeout).map_err(fail)?;
        stream.set_write_timeout(Some(self.timeout)).map_err(fail)?;
        stream.write_all(b"*TRG\n").map_err(fail)?;
        stream.flush().map_err(fail)?;

        tracing::info!("Triggered {}", self.host);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn test_scpi_trigger_sends_trg() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = String::new();
            stream.read_to_string(&mut buf).unwrap();
            buf
        });

        let generator =
            ScpiSignalGenerator::new("127.0.0.1", Duration::from_secs(1)).with_port(port);
        generator.trigger().unwrap();
        drop(generator);

        assert_eq!(server.join().unwrap(), "*TRG\n");
    }

    #[test]
    fn test_unreachable_generator_is_trigger_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let generator =
            ScpiSignalGenerator::new("127.0.0.1", Duration::from_millis(200)).with_port(port);
        assert!(matches!(generator.trigger(), Err(StreamError::Trigger(_))));
    }
}

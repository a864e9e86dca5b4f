//! Remote attribute access for acquisition units
//!
//! A unit exposes string-valued keys grouped by scope: site scopes (`s0` is
//! the carrier, `s1`.. are modules) and comms-aggregator scopes (`cA`, `cB`,
//! `cC`). [`RemoteDevice`] is the seam the engine talks through; [`TcpDevice`]
//! is a thin line-oriented transport for real hardware.

use super::siggen::{ScpiSignalGenerator, SignalGenerator};
use crate::error::{Result, StreamError};
use crate::types::RemotePort;
use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Key scope on a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// Site scope; 0 is the carrier
    Site(u8),
    /// Comms-aggregator scope for a remote port
    Comm(RemotePort),
}

impl Scope {
    /// Site number used to address this scope's control service
    pub fn service_site(&self) -> u8 {
        match self {
            Scope::Site(site) => *site,
            Scope::Comm(RemotePort::A) => 13,
            Scope::Comm(RemotePort::B) => 12,
            Scope::Comm(RemotePort::C) => 11,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Site(site) => write!(f, "s{}", site),
            Scope::Comm(port) => write!(f, "c{}", port),
        }
    }
}

/// Typed remote key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Hostname,
    ContinuousState,
    StreamToNowhere,
    Spad,
    /// Scratch-pad marker register `spad1`..`spad7`
    SpadMarker(u8),
    Run0,
    Sites,
    Aggregator,
    Decimate,
    SigSrcTrg0,
    SigSrcTrg1,
    Ssb,
    /// Burst length, site 1
    RtmTranslen,
    ActiveChan(u8),
    Data32(u8),
    TxDisable(RemotePort),
    CommAggregator(RemotePort),
    CommSpad(RemotePort),
    CommDecimate(RemotePort),
    /// Free-form site-scoped knob
    Site { site: u8, name: String },
}

impl Key {
    pub fn scope(&self) -> Scope {
        match self {
            Key::RtmTranslen => Scope::Site(1),
            Key::ActiveChan(site) | Key::Data32(site) => Scope::Site(*site),
            Key::Site { site, .. } => Scope::Site(*site),
            Key::TxDisable(port)
            | Key::CommAggregator(port)
            | Key::CommSpad(port)
            | Key::CommDecimate(port) => Scope::Comm(*port),
            _ => Scope::Site(0),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Key::Hostname => "HN".to_string(),
            Key::ContinuousState => "CONTINUOUS_STATE".to_string(),
            Key::StreamToNowhere => "streamtonowhered".to_string(),
            Key::Spad => "spad".to_string(),
            Key::SpadMarker(n) => format!("spad{}", n),
            Key::Run0 => "run0".to_string(),
            Key::Sites => "sites".to_string(),
            Key::Aggregator | Key::CommAggregator(_) => "aggregator".to_string(),
            Key::Decimate | Key::CommDecimate(_) => "decimate".to_string(),
            Key::SigSrcTrg0 => "SIG_SRC_TRG_0".to_string(),
            Key::SigSrcTrg1 => "SIG_SRC_TRG_1".to_string(),
            Key::Ssb => "ssb".to_string(),
            Key::RtmTranslen => "RTM_TRANSLEN".to_string(),
            Key::ActiveChan(_) => "active_chan".to_string(),
            Key::Data32(_) => "data32".to_string(),
            Key::TxDisable(_) => "TX_DISABLE".to_string(),
            Key::CommSpad(_) => "spad".to_string(),
            Key::Site { name, .. } => name.clone(),
        }
    }

    /// Parse a `s<site>.<knob>` parameter name
    pub fn from_param(param: &str) -> Result<Key> {
        let invalid = || StreamError::Config(format!("Invalid parameter: {}", param));
        let (scope, name) = param.split_once('.').ok_or_else(invalid)?;
        let site = scope
            .strip_prefix('s')
            .and_then(|s| s.parse::<u8>().ok())
            .ok_or_else(invalid)?;
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(invalid());
        }
        Ok(Key::Site {
            site,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope(), self.name())
    }
}

/// Attribute access to one unit
///
/// Implementations must be safe to share between the unit's poller and the
/// control thread.
pub trait RemoteDevice: Send + Sync {
    /// Name the device was reached by
    fn name(&self) -> &str;

    /// Read a key
    fn get(&self, key: &Key) -> Result<String>;

    /// Write a key
    fn set(&self, key: &Key, value: &str) -> Result<()>;

    /// Send a raw command line to a scope
    fn send(&self, scope: Scope, line: &str) -> Result<String>;

    /// Sites in the carrier aggregator, in aggregation order
    ///
    /// The aggregator report carries a `sites=1,2,3` token.
    fn aggregator_sites(&self) -> Result<Vec<u8>> {
        let report = self.get(&Key::Aggregator)?;
        let Some(list) = report
            .split_whitespace()
            .find_map(|tok| tok.strip_prefix("sites="))
        else {
            return Ok(Vec::new());
        };
        list.split(',')
            .filter(|s| !s.is_empty() && *s != "none")
            .map(|s| {
                s.parse::<u8>().map_err(|_| {
                    StreamError::connectivity(self.name(), format!("Bad aggregator report: {}", report))
                })
            })
            .collect()
    }
}

/// Opens sessions to network instruments by name
pub trait Connector: Send + Sync {
    /// Connect to an acquisition unit
    fn connect(&self, name: &str) -> Result<Arc<dyn RemoteDevice>>;

    /// Handle for a trigger signal generator; nothing is opened until it fires
    fn signal_generator(&self, name: &str) -> Arc<dyn SignalGenerator>;
}

// ==================== TCP Transport ====================

/// Line-oriented TCP transport
///
/// Each scope is served on `port_base + site`. A request is one line (`key`
/// to read, `key=value` to write) and the reply is one line. Replies
/// starting with `ERROR` mean the key is not recognised.
pub struct TcpDevice {
    name: String,
    port_base: u16,
    timeout: Duration,
    sessions: Mutex<HashMap<Scope, BufReader<TcpStream>>>,
}

impl TcpDevice {
    /// Connect to a unit, verifying the carrier service answers
    pub fn connect(name: &str, port_base: u16, timeout: Duration) -> Result<Self> {
        let device = Self {
            name: name.to_string(),
            port_base,
            timeout,
            sessions: Mutex::new(HashMap::new()),
        };
        let carrier = device.open(Scope::Site(0))?;
        if let Ok(mut sessions) = device.sessions.lock() {
            sessions.insert(Scope::Site(0), carrier);
        }
        Ok(device)
    }

    fn open(&self, scope: Scope) -> Result<BufReader<TcpStream>> {
        let port = self.port_base + u16::from(scope.service_site());
        let addr = (self.name.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| StreamError::connectivity(&self.name, e.to_string()))?
            .next()
            .ok_or_else(|| StreamError::connectivity(&self.name, "No address"))?;

        let stream = TcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|e| StreamError::connectivity(&self.name, e.to_string()))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;

        tracing::debug!("Opened {}:{} on port {}", self.name, scope, port);
        Ok(BufReader::new(stream))
    }

    fn transact(&self, scope: Scope, line: &str) -> Result<String> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| StreamError::Internal("session lock poisoned".to_string()))?;

        if !sessions.contains_key(&scope) {
            let session = self.open(scope)?;
            sessions.insert(scope, session);
        }
        let Some(session) = sessions.get_mut(&scope) else {
            return Err(StreamError::connectivity(&self.name, "No session"));
        };

        let result = exchange(session, line);
        if result.is_err() {
            // Drop the session so the next request reconnects
            sessions.remove(&scope);
        }
        result.map_err(|e| StreamError::connectivity(&self.name, format!("{}: {}", scope, e)))
    }
}

fn exchange(session: &mut BufReader<TcpStream>, line: &str) -> std::io::Result<String> {
    let stream = session.get_mut();
    stream.write_all(line.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    let mut reply = String::new();
    if session.read_line(&mut reply)? == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed",
        ));
    }
    Ok(reply.trim().to_string())
}

impl RemoteDevice for TcpDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &Key) -> Result<String> {
        let reply = self.transact(key.scope(), &key.name())?;
        if reply.starts_with("ERROR") {
            return Err(StreamError::UnknownKey {
                unit: self.name.clone(),
                key: key.to_string(),
            });
        }
        Ok(reply)
    }

    fn set(&self, key: &Key, value: &str) -> Result<()> {
        let reply = self.transact(key.scope(), &format!("{}={}", key.name(), value))?;
        if reply.starts_with("ERROR") {
            return Err(StreamError::UnknownKey {
                unit: self.name.clone(),
                key: key.to_string(),
            });
        }
        Ok(())
    }

    fn send(&self, scope: Scope, line: &str) -> Result<String> {
        self.transact(scope, line)
    }
}

/// Connects [`TcpDevice`]s
pub struct TcpConnector {
    pub port_base: u16,
    pub timeout: Duration,
}

impl Connector for TcpConnector {
    fn connect(&self, name: &str) -> Result<Arc<dyn RemoteDevice>> {
        let device = TcpDevice::connect(name, self.port_base, self.timeout)?;
        Ok(Arc::new(device))
    }

    fn signal_generator(&self, name: &str) -> Arc<dyn SignalGenerator> {
        Arc::new(ScpiSignalGenerator::new(name, self.timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_key_scopes() {
        assert_eq!(Key::Hostname.to_string(), "s0:HN");
        assert_eq!(Key::RtmTranslen.to_string(), "s1:RTM_TRANSLEN");
        assert_eq!(Key::Data32(3).to_string(), "s3:data32");
        assert_eq!(Key::TxDisable(RemotePort::B).to_string(), "cB:TX_DISABLE");
        assert_eq!(Key::CommSpad(RemotePort::A).to_string(), "cA:spad");
        assert_eq!(Key::SpadMarker(4).to_string(), "s0:spad4");
    }

    #[test]
    fn test_comm_service_sites() {
        assert_eq!(Scope::Comm(RemotePort::A).service_site(), 13);
        assert_eq!(Scope::Comm(RemotePort::C).service_site(), 11);
        assert_eq!(Scope::Site(2).service_site(), 2);
    }

    #[test]
    fn test_from_param() {
        assert_eq!(
            Key::from_param("s1.trg").unwrap(),
            Key::Site {
                site: 1,
                name: "trg".to_string()
            }
        );
        assert!(Key::from_param("trg").is_err());
        assert!(Key::from_param("x1.trg").is_err());
        assert!(Key::from_param("s1.").is_err());
    }

    /// Minimal line server answering one scope
    fn serve(replies: HashMap<&'static str, &'static str>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut writer = stream;
                let mut line = String::new();
                while reader.read_line(&mut line).unwrap_or(0) > 0 {
                    let reply = replies.get(line.trim()).copied().unwrap_or("ERROR");
                    writeln!(writer, "{}", reply).unwrap();
                    line.clear();
                }
            }
        });
        port
    }

    #[test]
    fn test_tcp_get_and_unknown_key() {
        let mut replies = HashMap::new();
        replies.insert("HN", "acq2106_007");
        replies.insert("run0=1,2 1,16,0", "");
        // Carrier scope is site 0, so the service listens on port_base itself
        let port = serve(replies);

        let device = TcpDevice::connect("127.0.0.1", port, Duration::from_secs(2)).unwrap();
        assert_eq!(device.get(&Key::Hostname).unwrap(), "acq2106_007");
        device.set(&Key::Run0, "1,2 1,16,0").unwrap();

        let err = device.get(&Key::Ssb).unwrap_err();
        assert!(err.is_unknown_key());
    }

    #[test]
    fn test_connect_refused_is_connectivity() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = TcpDevice::connect("127.0.0.1", port, Duration::from_millis(200))
            .err()
            .unwrap();
        assert!(matches!(err, StreamError::Connectivity { .. }));
    }
}

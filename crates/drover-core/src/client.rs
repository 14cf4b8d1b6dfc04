//! Outbound command path and backend liveness tracking.
//!
//! Commands go out over whichever channels are configured: always over OSC
//! (fire-and-forget datagrams), and over the reliable stream whenever it is
//! connected, mirroring how the backend listens. The [`Outbound`] trait is
//! the seam the synchronizer and the presentation layer send through, so
//! tests can swap in a recording sink.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rosc::OscType;

use crate::error::SyncError;
use crate::osc::OscLink;
use crate::stream::StreamLink;

/// How long without an `/alive` beacon before the backend counts as down
/// (only relevant when no stream channel is configured).
pub const ALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// One argument of an outbound command.
#[derive(Clone, Debug, PartialEq)]
pub enum CmdArg {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl CmdArg {
    /// Text encoding used on the stream channel. Booleans travel as "1"/"0".
    pub fn to_wire_string(&self) -> String {
        match self {
            CmdArg::Str(s) => s.clone(),
            CmdArg::Int(i) => i.to_string(),
            CmdArg::Float(f) => f.to_string(),
            CmdArg::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
        }
    }

    /// Typed encoding used on the OSC channel.
    pub fn to_osc_type(&self) -> OscType {
        match self {
            CmdArg::Str(s) => OscType::String(s.clone()),
            CmdArg::Int(i) => OscType::Int(*i as i32),
            CmdArg::Float(f) => OscType::Float(*f as f32),
            CmdArg::Bool(b) => OscType::Int(if *b { 1 } else { 0 }),
        }
    }
}

impl From<&str> for CmdArg {
    fn from(v: &str) -> Self {
        CmdArg::Str(v.to_string())
    }
}

impl From<String> for CmdArg {
    fn from(v: String) -> Self {
        CmdArg::Str(v)
    }
}

impl From<i64> for CmdArg {
    fn from(v: i64) -> Self {
        CmdArg::Int(v)
    }
}

impl From<f64> for CmdArg {
    fn from(v: f64) -> Self {
        CmdArg::Float(v)
    }
}

impl From<bool> for CmdArg {
    fn from(v: bool) -> Self {
        CmdArg::Bool(v)
    }
}

/// Anything that can deliver a command to the backend.
pub trait Outbound: Send + Sync {
    fn send(&self, address: &str, args: &[CmdArg]) -> Result<(), SyncError>;
}

/// The real outbound path: OSC always, stream when connected.
#[derive(Clone)]
pub struct BackendClient {
    osc: OscLink,
    stream: Option<StreamLink>,
}

impl BackendClient {
    pub fn new(osc: OscLink, stream: Option<StreamLink>) -> Self {
        Self { osc, stream }
    }
}

impl Outbound for BackendClient {
    fn send(&self, address: &str, args: &[CmdArg]) -> Result<(), SyncError> {
        let mut delivered = false;
        let mut last_err = None;

        if !self.osc.is_noop() {
            let osc_args = args.iter().map(CmdArg::to_osc_type).collect();
            match self.osc.send_msg(address, osc_args) {
                Ok(()) => delivered = true,
                Err(e) => {
                    log::warn!("[CLIENT] osc send of {} failed: {}", address, e);
                    last_err = Some(e);
                }
            }
        }

        if let Some(stream) = &self.stream {
            if stream.is_connected() {
                let wire_args: Vec<String> = args.iter().map(CmdArg::to_wire_string).collect();
                match stream.send_frame(address, &wire_args) {
                    Ok(()) => delivered = true,
                    Err(e) => {
                        log::warn!("[CLIENT] stream send of {} failed: {}", address, e);
                        last_err = Some(e);
                    }
                }
            }
        }

        match (delivered, last_err) {
            (true, _) => Ok(()),
            (false, Some(e)) => Err(e),
            (false, None) => Err(SyncError::Transport(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no outbound channel available",
            ))),
        }
    }
}

/// Liveness view of the backend.
///
/// The backend counts as down only when every configured signal says so:
/// the stream connection is down (or absent) AND no `/alive` beacon has
/// arrived within [`ALIVE_TIMEOUT`] (beacons only flow on the OSC channel).
pub struct ChannelHealth {
    stream: Option<StreamLink>,
    last_alive: Mutex<Option<Instant>>,
    alive_timeout: Duration,
}

impl ChannelHealth {
    pub fn new(stream: Option<StreamLink>) -> Self {
        Self {
            stream,
            last_alive: Mutex::new(None),
            alive_timeout: ALIVE_TIMEOUT,
        }
    }

    /// Record an `/alive` beacon.
    pub fn note_alive(&self) {
        *self
            .last_alive
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
    }

    /// Whether the backend should currently be treated as down.
    pub fn backend_may_be_down(&self) -> bool {
        let stream_down = match &self.stream {
            Some(stream) => !stream.is_connected(),
            None => true,
        };
        let last = *self
            .last_alive
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let beacon_stale = match last {
            Some(t) => t.elapsed() > self.alive_timeout,
            None => true,
        };
        stream_down && beacon_stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_arg_wire_encoding() {
        assert_eq!(CmdArg::from("full").to_wire_string(), "full");
        assert_eq!(CmdArg::from(42i64).to_wire_string(), "42");
        assert_eq!(CmdArg::from(true).to_wire_string(), "1");
        assert_eq!(CmdArg::from(false).to_wire_string(), "0");
        assert_eq!(CmdArg::from(1.5f64).to_wire_string(), "1.5");
    }

    #[test]
    fn test_cmd_arg_osc_encoding() {
        assert_eq!(
            CmdArg::from("x").to_osc_type(),
            OscType::String("x".to_string())
        );
        assert_eq!(CmdArg::from(7i64).to_osc_type(), OscType::Int(7));
        assert_eq!(CmdArg::from(true).to_osc_type(), OscType::Int(1));
    }

    #[test]
    fn test_no_channel_is_an_error() {
        let client = BackendClient::new(OscLink::noop(), None);
        assert!(client.send("/transport/play", &[]).is_err());
    }

    #[test]
    fn test_health_without_stream_uses_alive_beacons() {
        let health = ChannelHealth::new(None);
        assert!(health.backend_may_be_down());
        health.note_alive();
        assert!(!health.backend_may_be_down());
    }
}

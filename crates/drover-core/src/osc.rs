//! OSC (Open Sound Control) transport to the sequencer backend.
//!
//! The unreliable channel is plain OSC over UDP: we send commands to the
//! backend's receive port and listen on our own port for `/alive` beacons
//! and state traffic. Delivery is best-effort; the synchronizer's sequence
//! checking covers lost datagrams.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use rosc::{encoder, OscMessage, OscPacket, OscType};

use crate::error::SyncError;
use crate::router::{self, BackendEvent};

const RECV_BUF_SIZE: usize = 65536;
const RECV_POLL: Duration = Duration::from_millis(250);

/// UDP-based OSC sender targeting the backend.
#[derive(Clone)]
pub struct OscLink {
    /// The underlying UDP socket (None in noop mode).
    sock: Option<Arc<UdpSocket>>,
    /// Target address in "host:port" format.
    pub addr: String,
}

impl OscLink {
    /// Create a new sender bound to an ephemeral port.
    pub fn new<A: Into<String>>(addr: A) -> Result<Self, SyncError> {
        let sock = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self {
            sock: Some(Arc::new(sock)),
            addr: addr.into(),
        })
    }

    /// Create a no-op sender for tests and stream-only setups.
    ///
    /// All send operations succeed but do nothing.
    pub fn noop() -> Self {
        Self {
            sock: None,
            addr: "noop".to_string(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.sock.is_none()
    }

    /// Encode and send one OSC message.
    pub fn send_msg(&self, path: &str, args: Vec<OscType>) -> Result<(), SyncError> {
        let sock = match &self.sock {
            Some(s) => s,
            None => return Ok(()), // noop mode
        };
        let packet = OscPacket::Message(OscMessage {
            addr: path.into(),
            args,
        });
        let buf = encoder::encode(&packet)?;
        sock.send_to(&buf, &self.addr)?;
        Ok(())
    }
}

impl std::fmt::Debug for OscLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OscLink")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

/// Background thread decoding incoming OSC traffic into [`BackendEvent`]s.
pub struct OscReceiver {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    local_port: u16,
}

impl OscReceiver {
    /// Bind `bind_addr` (e.g. "0.0.0.0:9004") and start pumping decoded
    /// events into `events`.
    pub fn spawn(bind_addr: &str, events: Sender<BackendEvent>) -> Result<Self, SyncError> {
        let sock = UdpSocket::bind(bind_addr)?;
        sock.set_read_timeout(Some(RECV_POLL))?;
        let local_port = sock.local_addr()?.port();
        log::info!("[OSC] listening on port {}", local_port);

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name("osc-recv".into())
            .spawn(move || pump(sock, events, flag))?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
            local_port,
        })
    }

    /// Port the receiver actually bound (useful with port 0).
    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

impl Drop for OscReceiver {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn pump(sock: UdpSocket, events: Sender<BackendEvent>, shutdown: Arc<AtomicBool>) {
    let mut buf = [0u8; RECV_BUF_SIZE];
    while !shutdown.load(Ordering::SeqCst) {
        let size = match sock.recv_from(&mut buf) {
            Ok((size, _)) => size,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                log::warn!("[OSC] receive failed: {}", e);
                continue;
            }
        };
        match rosc::decoder::decode_udp(&buf[..size]) {
            Ok((_, packet)) => dispatch_packet(&packet, &events),
            Err(e) => log::warn!("[OSC] undecodable packet ({} bytes): {}", size, e),
        }
    }
}

/// Flatten bundles and forward each decoded message.
fn dispatch_packet(packet: &OscPacket, events: &Sender<BackendEvent>) {
    match packet {
        OscPacket::Message(msg) => match router::parse_osc_message(msg) {
            Ok(Some(event)) => {
                if events.send(event).is_err() {
                    // Synchronizer is gone; the receiver will be dropped soon.
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("[OSC] dropping message for {}: {}", msg.addr, e),
        },
        OscPacket::Bundle(bundle) => {
            for inner in &bundle.content {
                dispatch_packet(inner, events);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_link_creation_and_noop() {
        assert!(OscLink::new("127.0.0.1:9003").is_ok());
        let noop = OscLink::noop();
        assert!(noop.is_noop());
        assert!(noop.send_msg("/get_state", vec![OscType::String("full".into())]).is_ok());
    }

    #[test]
    fn test_receiver_decodes_alive_beacon() {
        let (tx, rx) = unbounded();
        let receiver = OscReceiver::spawn("127.0.0.1:0", tx).unwrap();
        let link = OscLink::new(format!("127.0.0.1:{}", receiver.local_port())).unwrap();

        link.send_msg("/alive", vec![]).unwrap();
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event, BackendEvent::Alive);
    }

    #[test]
    fn test_receiver_decodes_state_update() {
        let (tx, rx) = unbounded();
        let receiver = OscReceiver::spawn("127.0.0.1:0", tx).unwrap();
        let link = OscLink::new(format!("127.0.0.1:{}", receiver.local_port())).unwrap();

        link.send_msg(
            "/state_update",
            vec![
                OscType::String("propertyChanged".into()),
                OscType::Int(1),
                OscType::String("c1".into()),
                OscType::String("clip".into()),
                OscType::String("playing".into()),
                OscType::String("1".into()),
            ],
        )
        .unwrap();
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(event, BackendEvent::StateUpdate { id: 1, .. }));
    }
}

//! Reliable stream transport to the sequencer backend.
//!
//! A TCP connection carrying newline-framed text frames of the form
//! `address:arg;arg;...`. Unlike the OSC channel this one has connection
//! state: opening it counts as the backend having (re)started, losing it
//! means the backend is down until the next successful reconnect. The
//! connection thread retries every [`RECONNECT_INTERVAL`] forever.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::error::SyncError;
use crate::router::{self, BackendEvent};

pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const READ_POLL: Duration = Duration::from_millis(250);

struct StreamShared {
    addr: String,
    connected: AtomicBool,
    shutdown: AtomicBool,
    /// Write half of the live connection, if any.
    writer: Mutex<Option<TcpStream>>,
}

/// Handle to the reliable channel: connection state plus outbound frames.
///
/// Cloneable; all clones share the same underlying connection.
#[derive(Clone)]
pub struct StreamLink {
    inner: Arc<StreamShared>,
}

impl StreamLink {
    /// Start the connection thread against `addr` (e.g. "127.0.0.1:8125").
    ///
    /// Decoded frames, connection-opened (`AppStarted`) and
    /// connection-dropped (`ConnectionLost`) events all land in `events`.
    pub fn spawn(
        addr: &str,
        events: Sender<BackendEvent>,
    ) -> Result<(Self, JoinHandle<()>), SyncError> {
        let inner = Arc::new(StreamShared {
            addr: addr.to_string(),
            connected: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            writer: Mutex::new(None),
        });
        let link = Self {
            inner: Arc::clone(&inner),
        };
        let handle = std::thread::Builder::new()
            .name("stream-conn".into())
            .spawn(move || connection_loop(inner, events))?;
        Ok((link, handle))
    }

    /// Whether the connection is currently up.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Send one frame. Fails when the connection is down.
    pub fn send_frame(&self, address: &str, args: &[String]) -> Result<(), SyncError> {
        let mut guard = self
            .inner
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let stream = guard.as_mut().ok_or_else(|| {
            SyncError::Transport(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "stream channel is down",
            ))
        })?;
        let frame = format!("{}:{}\n", address, args.join(";"));
        stream.write_all(frame.as_bytes())?;
        stream.flush()?;
        Ok(())
    }

    /// Stop the connection thread. Join the handle after calling this.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let guard = self
            .inner
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(stream) = guard.as_ref() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

fn resolve(addr: &str) -> Option<SocketAddr> {
    addr.to_socket_addrs().ok()?.next()
}

fn connection_loop(inner: Arc<StreamShared>, events: Sender<BackendEvent>) {
    while !inner.shutdown.load(Ordering::SeqCst) {
        let target = match resolve(&inner.addr) {
            Some(t) => t,
            None => {
                log::warn!("[STREAM] cannot resolve {}", inner.addr);
                sleep_interruptible(&inner, RECONNECT_INTERVAL);
                continue;
            }
        };
        match TcpStream::connect_timeout(&target, CONNECT_TIMEOUT) {
            Ok(stream) => {
                log::info!("[STREAM] connected to {}", inner.addr);
                if let Err(e) = serve_connection(&inner, &events, stream) {
                    log::debug!("[STREAM] connection setup failed: {}", e);
                }
                inner.connected.store(false, Ordering::SeqCst);
                *inner
                    .writer
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
                if inner.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                log::info!(
                    "[STREAM] connection lost, retrying in {:?}",
                    RECONNECT_INTERVAL
                );
                if events.send(BackendEvent::ConnectionLost).is_err() {
                    break;
                }
            }
            Err(e) => {
                log::debug!("[STREAM] connect to {} failed: {}", inner.addr, e);
            }
        }
        sleep_interruptible(&inner, RECONNECT_INTERVAL);
    }
}

/// Run one established connection until it drops or we shut down.
fn serve_connection(
    inner: &Arc<StreamShared>,
    events: &Sender<BackendEvent>,
    stream: TcpStream,
) -> Result<(), SyncError> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(READ_POLL))?;
    *inner
        .writer
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(stream.try_clone()?);
    inner.connected.store(true, Ordering::SeqCst);

    // An open connection means the backend is (newly) up.
    if events.send(BackendEvent::AppStarted).is_err() {
        return Ok(());
    }

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        match reader.read_line(&mut line) {
            Ok(0) => return Ok(()), // EOF
            Ok(_) => {
                let frame = line.trim_end_matches(['\r', '\n']);
                if !frame.is_empty() {
                    match router::parse_frame(frame) {
                        Ok(Some(event)) => {
                            if events.send(event).is_err() {
                                return Ok(());
                            }
                        }
                        Ok(None) => {}
                        Err(e) => log::warn!("[STREAM] dropping frame: {}", e),
                    }
                }
                line.clear();
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                // Partial line (if any) stays in `line`; keep reading.
                continue;
            }
            Err(e) => {
                log::debug!("[STREAM] read failed: {}", e);
                return Ok(());
            }
        }
    }
}

fn sleep_interruptible(inner: &Arc<StreamShared>, total: Duration) {
    let mut remaining = total;
    while !inner.shutdown.load(Ordering::SeqCst) && remaining > Duration::ZERO {
        let step = remaining.min(READ_POLL);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::net::TcpListener;

    fn wait_connected(link: &StreamLink) {
        for _ in 0..100 {
            if link.is_connected() {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("stream never connected");
    }

    #[test]
    fn test_connect_emits_app_started_and_routes_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = unbounded();
        let (link, handle) = StreamLink::spawn(&addr, tx).unwrap();

        let (mut server_side, _) = listener.accept().unwrap();
        wait_connected(&link);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            BackendEvent::AppStarted
        );

        server_side
            .write_all(b"/state_update:removedChild;4;c1;clip\n")
            .unwrap();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            BackendEvent::StateUpdate { id: 4, .. }
        ));

        link.shutdown();
        let _ = handle.join();
    }

    #[test]
    fn test_dropped_connection_emits_connection_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = unbounded();
        let (link, handle) = StreamLink::spawn(&addr, tx).unwrap();

        let (server_side, _) = listener.accept().unwrap();
        wait_connected(&link);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            BackendEvent::AppStarted
        );

        drop(server_side);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            BackendEvent::ConnectionLost
        );
        assert!(!link.is_connected());

        link.shutdown();
        let _ = handle.join();
    }

    #[test]
    fn test_send_frame_reaches_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, _rx) = unbounded();
        let (link, handle) = StreamLink::spawn(&addr, tx).unwrap();

        let (server_side, _) = listener.accept().unwrap();
        wait_connected(&link);

        link.send_frame("/get_state", &["full".to_string()]).unwrap();
        let mut reader = BufReader::new(server_side);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "/get_state:full\n");

        link.shutdown();
        let _ = handle.join();
    }

    #[test]
    fn test_send_frame_fails_when_down() {
        let (tx, _rx) = unbounded();
        // Nothing listens on this address.
        let (link, handle) = StreamLink::spawn("127.0.0.1:1", tx).unwrap();
        assert!(link.send_frame("/get_state", &["full".to_string()]).is_err());
        link.shutdown();
        let _ = handle.join();
    }
}

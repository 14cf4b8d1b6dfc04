//! The state synchronizer: keeps the mirrored graph converged with the
//! backend's session tree.
//!
//! A single consumer thread owns all mutation. Every input (decoded OSC
//! messages, stream frames, connection events, poll ticks) lands in one
//! crossbeam channel and is applied in arrival order, so the graph behind
//! the `RwLock` only ever has one writer.
//!
//! Convergence rules, in order of application:
//!
//! 1. Updates arriving before the first snapshot are not applicable;
//!    they flag a full-state request and are dropped.
//! 2. An applicable update is applied FIRST, then its sequence id is
//!    checked: if it does not directly follow the previous one, a resync
//!    is flagged. The id is recorded either way, so one hole in the
//!    sequence triggers exactly one resync.
//! 3. Any failure to apply (unknown uuid, bad fragment, bad coercion)
//!    logs a warning and flags a resync; the mirror stays self-consistent
//!    because a fresh snapshot is on its way.
//! 4. The poll tick turns the resync flag into an actual `/get_state`
//!    request, at most one in flight, re-asked after
//!    [`FULL_STATE_REQUEST_TIMEOUT`] without an answer, and never while
//!    the backend looks down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::client::{BackendClient, ChannelHealth, Outbound};
use crate::commands::Command;
use crate::error::SyncError;
use crate::graph::Graph;
use crate::markup;
use crate::osc::{OscLink, OscReceiver};
use crate::router::{BackendEvent, Update};
use crate::stream::StreamLink;

/// How long to wait for a requested snapshot before asking again.
pub const FULL_STATE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll tick rate for pending full-state requests.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where the synchronizer currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPhase {
    /// No snapshot yet and none requested.
    NoState,
    /// No usable mirror; waiting for the first snapshot.
    AwaitingFullState,
    /// Mirror built and updates flowing in sequence.
    Synced,
    /// Mirror built but a discrepancy was detected; resync pending.
    ResyncPending,
}

/// Presentation-layer callbacks, invoked from the synchronizer thread with
/// no locks held. Implementations read the mirror through their own handle.
pub trait MirrorDelegate: Send + Sync {
    /// The backend (re)started; the mirror is about to be rebuilt.
    fn on_backend_started(&self) {}
    /// The reliable channel dropped.
    fn on_backend_connection_lost(&self) {}
    /// A snapshot was applied and the mirror rebuilt.
    fn on_full_state_received(&self) {}
    /// One incremental update was applied.
    fn on_state_update(&self, _update: &Update) {}
}

/// No-op delegate for headless or test use.
pub struct NullDelegate;

impl MirrorDelegate for NullDelegate {}

/// Sequencing and resync state machine. Single-threaded by construction:
/// exactly one of these lives on the consumer thread.
pub struct Synchronizer {
    mirror: Arc<RwLock<Graph>>,
    outbound: Arc<dyn Outbound>,
    health: Arc<ChannelHealth>,
    delegate: Arc<dyn MirrorDelegate>,
    /// Id of the last applied update; `None` until the first one after a
    /// backend (re)start, which is accepted without a gap check.
    last_update_id: Option<u64>,
    should_request_full_state: bool,
    full_state_requested: bool,
    last_request_at: Option<Instant>,
    request_timeout: Duration,
}

impl Synchronizer {
    pub fn new(
        mirror: Arc<RwLock<Graph>>,
        outbound: Arc<dyn Outbound>,
        health: Arc<ChannelHealth>,
        delegate: Arc<dyn MirrorDelegate>,
    ) -> Self {
        Self {
            mirror,
            outbound,
            health,
            delegate,
            last_update_id: None,
            // Ask for a snapshot as soon as the backend looks up.
            should_request_full_state: true,
            full_state_requested: false,
            last_request_at: None,
            request_timeout: FULL_STATE_REQUEST_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn set_request_timeout(&mut self, timeout: Duration) {
        self.request_timeout = timeout;
    }

    pub fn phase(&self) -> SyncPhase {
        let built = self
            .mirror
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_built();
        match (built, self.should_request_full_state || self.full_state_requested) {
            (true, false) => SyncPhase::Synced,
            (true, true) => SyncPhase::ResyncPending,
            (false, true) => SyncPhase::AwaitingFullState,
            (false, false) => SyncPhase::NoState,
        }
    }

    /// Consume one event. The whole protocol dispatch lives here.
    pub fn handle_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::AppStarted => self.on_app_started(),
            BackendEvent::ConnectionLost => self.delegate.on_backend_connection_lost(),
            BackendEvent::Alive => self.health.note_alive(),
            BackendEvent::Poll => self.maybe_request_full_state(),
            BackendEvent::FullState { id, markup } => self.set_full_state(id, &markup),
            BackendEvent::StateUpdate { id, update } => self.apply_update(id, &update),
        }
    }

    /// Backend came up (fresh process or reconnect): whatever mirror we
    /// have is stale, and the update sequence starts over.
    fn on_app_started(&mut self) {
        log::info!("[SYNC] backend started");
        self.last_update_id = None;
        self.full_state_requested = false;
        self.should_request_full_state = true;
        self.delegate.on_backend_started();
    }

    fn maybe_request_full_state(&mut self) {
        if let Some(at) = self.last_request_at {
            if at.elapsed() > self.request_timeout {
                // The snapshot never arrived; allow a new request.
                self.full_state_requested = false;
            }
        }
        if !self.should_request_full_state
            || self.full_state_requested
            || self.health.backend_may_be_down()
        {
            return;
        }
        log::debug!("[SYNC] requesting full state");
        self.full_state_requested = true;
        self.last_request_at = Some(Instant::now());
        if let Err(e) = Command::get_state_full().send_via(self.outbound.as_ref()) {
            log::warn!("[SYNC] full state request failed: {}", e);
        }
    }

    /// Replace the mirror with a fresh snapshot.
    ///
    /// Does NOT touch `last_update_id`: the stream of update ids continues
    /// across snapshots, and only a backend restart resets it.
    fn set_full_state(&mut self, id: u64, raw: &str) {
        log::debug!("[SYNC] received full state (update id {})", id);
        let graph = match markup::parse(raw).and_then(|el| Graph::rebuild(&el)) {
            Ok(graph) => graph,
            Err(e) => {
                log::warn!("[SYNC] discarding unusable snapshot: {}", e);
                self.full_state_requested = false;
                return;
            }
        };
        log::info!("[SYNC] mirror rebuilt with {} nodes", graph.len());
        *self
            .mirror
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = graph;
        self.full_state_requested = false;
        self.should_request_full_state = false;
        // Tell the backend we have a usable mirror.
        if let Err(e) = Command::controller_ready().send_via(self.outbound.as_ref()) {
            log::warn!("[SYNC] controller ready notification failed: {}", e);
        }
        self.delegate.on_full_state_received();
    }

    fn apply_update(&mut self, id: u64, update: &Update) {
        {
            let mut mirror = self
                .mirror
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !mirror.is_built() {
                // Nothing to apply it to; a snapshot will cover it.
                self.should_request_full_state = true;
                return;
            }
            if let Err(e) = apply_to_graph(&mut mirror, update) {
                log::warn!("[SYNC] update {} not applicable: {}", id, e);
                self.should_request_full_state = true;
            }
        }

        // Sequence check AFTER applying: a missed update means the mirror
        // may have silently diverged, so schedule a resync. Recording the
        // received id unconditionally makes one hole fire one resync.
        if let Some(last) = self.last_update_id {
            if last + 1 != id {
                log::warn!(
                    "[SYNC] update id gap (expected {}, got {}), scheduling resync",
                    last + 1,
                    id
                );
                self.should_request_full_state = true;
            }
        }
        self.last_update_id = Some(id);

        self.delegate.on_state_update(update);
    }
}

/// Apply one update to the graph.
fn apply_to_graph(graph: &mut Graph, update: &Update) -> Result<(), SyncError> {
    match update {
        Update::PropertyChanged {
            uuid,
            property,
            value,
            ..
        } => graph.set_property(uuid, property, value),
        Update::AddedChild {
            parent_uuid,
            index,
            markup: fragment,
            ..
        } => {
            let el = markup::parse(fragment)?;
            graph.insert_child(parent_uuid, *index, &el)?;
            Ok(())
        }
        Update::RemovedChild { uuid, .. } => graph.remove_child(uuid),
    }
}

/// Addresses of the backend's channels.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Where the backend listens for OSC commands ("host:port").
    pub osc_send_addr: String,
    /// Where we listen for backend OSC traffic ("host:port").
    pub osc_bind_addr: String,
    /// Reliable channel endpoint ("host:port"), if configured.
    pub stream_addr: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            osc_send_addr: "127.0.0.1:9003".to_string(),
            osc_bind_addr: "0.0.0.0:9004".to_string(),
            stream_addr: Some("127.0.0.1:8125".to_string()),
        }
    }
}

/// Running mirror: transports, poll loop and synchronizer thread, wired.
pub struct MirrorService {
    mirror: Arc<RwLock<Graph>>,
    client: Arc<BackendClient>,
    events: Sender<BackendEvent>,
    shutdown: Arc<AtomicBool>,
    stream: Option<StreamLink>,
    _osc_receiver: Option<OscReceiver>,
    threads: Vec<JoinHandle<()>>,
}

impl MirrorService {
    /// Bring up every channel from `config` and start synchronizing.
    pub fn start(
        config: &SyncConfig,
        delegate: Arc<dyn MirrorDelegate>,
    ) -> Result<Self, SyncError> {
        let (tx, rx) = unbounded();
        let mut threads = Vec::new();

        let osc_receiver = OscReceiver::spawn(&config.osc_bind_addr, tx.clone())?;
        let osc_link = OscLink::new(config.osc_send_addr.clone())?;

        let stream = match &config.stream_addr {
            Some(addr) => {
                let (link, handle) = StreamLink::spawn(addr, tx.clone())?;
                threads.push(handle);
                Some(link)
            }
            None => None,
        };

        let mirror = Arc::new(RwLock::new(Graph::new()));
        let client = Arc::new(BackendClient::new(osc_link, stream.clone()));
        let health = Arc::new(ChannelHealth::new(stream.clone()));

        let shutdown = Arc::new(AtomicBool::new(false));
        threads.push(spawn_poll_thread(tx.clone(), Arc::clone(&shutdown))?);

        let synchronizer = Synchronizer::new(
            Arc::clone(&mirror),
            client.clone() as Arc<dyn Outbound>,
            health,
            delegate,
        );
        threads.push(spawn_consumer_thread(synchronizer, rx)?);

        Ok(Self {
            mirror,
            client,
            events: tx,
            shutdown,
            stream,
            _osc_receiver: Some(osc_receiver),
            threads,
        })
    }

    /// Shared handle to the mirrored graph.
    pub fn mirror(&self) -> Arc<RwLock<Graph>> {
        Arc::clone(&self.mirror)
    }

    /// Run a closure against a read-locked view of the mirror.
    pub fn with_mirror_read<R>(&self, f: impl FnOnce(&Graph) -> R) -> R {
        let guard = self
            .mirror
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    /// Outbound command path.
    pub fn client(&self) -> Arc<BackendClient> {
        Arc::clone(&self.client)
    }

    /// Inject an event into the funnel (used by embedders and tests).
    pub fn inject(&self, event: BackendEvent) {
        let _ = self.events.send(event);
    }

    /// Stop every thread and wait for them.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(stream) = &self.stream {
            stream.shutdown();
        }
        // Dropping the OSC receiver stops its thread; dropping our sender
        // closes the funnel once the other senders are gone, which ends
        // the consumer thread.
        self._osc_receiver = None;
        drop(self.events);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn spawn_poll_thread(
    tx: Sender<BackendEvent>,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, SyncError> {
    Ok(std::thread::Builder::new()
        .name("sync-poll".into())
        .spawn(move || {
            while !shutdown.load(Ordering::SeqCst) {
                std::thread::sleep(POLL_INTERVAL);
                if tx.send(BackendEvent::Poll).is_err() {
                    break;
                }
            }
        })?)
}

fn spawn_consumer_thread(
    mut synchronizer: Synchronizer,
    rx: Receiver<BackendEvent>,
) -> Result<JoinHandle<()>, SyncError> {
    Ok(std::thread::Builder::new()
        .name("sync-consumer".into())
        .spawn(move || {
            // Runs until every sender is gone.
            while let Ok(event) = rx.recv() {
                synchronizer.handle_event(event);
            }
            log::debug!("[SYNC] consumer thread exiting");
        })?)
}

//! Drover Core - Backend state mirroring for the Drover controller.
//!
//! This crate keeps a local, typed mirror of a sequencer backend's session
//! tree and lets a controller front end mutate it through commands:
//!
//! - **Markup** - Fragment/snapshot parsing of the backend's wire markup
//! - **Model** - Typed nodes (state, session, track, clip, event, device)
//! - **Graph** - The uuid-indexed mirrored tree and its mutations
//! - **Router** - Decoding both transports into one event stream
//! - **OSC / Stream** - The unreliable and reliable channels
//! - **Client** - Outbound command path and backend liveness
//! - **Commands** - The full outbound command vocabulary
//! - **Sync** - The synchronizer state machine and the wired-up service
//!
//! # Architecture
//!
//! All inputs funnel into one crossbeam channel consumed by a single
//! synchronizer thread, so the mirror behind the `RwLock` has exactly one
//! writer. Readers (UI, CLI) take short read locks through
//! [`MirrorService::with_mirror_read`].

pub mod client;
pub mod commands;
pub mod error;
pub mod graph;
pub mod markup;
pub mod model;
pub mod osc;
pub mod router;
pub mod stream;
pub mod sync;

// Re-export main types for convenience
pub use client::{BackendClient, ChannelHealth, CmdArg, Outbound, ALIVE_TIMEOUT};
pub use commands::{Command, SequenceEdit, SequenceEventSpec, SequenceSpec};
pub use error::SyncError;
pub use graph::Graph;
pub use markup::Element;
pub use model::{
    AttrKind, ClipNode, HardwareDeviceNode, Node, SequenceEventNode, SessionNode, StateNode,
    TrackNode,
};
pub use osc::{OscLink, OscReceiver};
pub use router::{BackendEvent, Update};
pub use stream::{StreamLink, RECONNECT_INTERVAL};
pub use sync::{
    MirrorDelegate, MirrorService, NullDelegate, SyncConfig, SyncPhase, Synchronizer,
    FULL_STATE_REQUEST_TIMEOUT, POLL_INTERVAL,
};

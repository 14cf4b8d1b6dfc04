//! UUID-indexed object graph mirroring the backend's session tree.
//!
//! The graph owns every node in a single uuid-keyed map; parents hold
//! ordered lists of child uuids and children hold their parent's uuid,
//! wired at construction and never reassigned. The three incremental
//! mutations (set property, insert child, remove child) and the wholesale
//! rebuild from a snapshot all live here; sequencing and resync policy do
//! not; that is the synchronizer's job.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::error::SyncError;
use crate::markup::Element;
use crate::model::{ClipNode, HardwareDeviceNode, Node, SequenceEventNode, SessionNode, StateNode, TrackNode};

/// The mirrored tree. Empty until the first full-state snapshot lands.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: HashMap<String, Node>,
    root: Option<String>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the whole graph from a full-state snapshot.
    ///
    /// Construction order follows the document: the state root, then its
    /// hardware devices, then the session with its tracks, clips and
    /// sequence events. Every node is registered as it is created.
    pub fn rebuild(snapshot: &Element) -> Result<Self, SyncError> {
        let root_el = snapshot.find("state").ok_or_else(|| {
            SyncError::MalformedFragment("snapshot has no <state> root".into())
        })?;
        let mut graph = Self::new();
        let root_uuid = graph.build_subtree(root_el, None)?;
        graph.root = Some(root_uuid);
        Ok(graph)
    }

    /// Whether a snapshot has been applied yet.
    pub fn is_built(&self) -> bool {
        self.root.is_some()
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.nodes.contains_key(uuid)
    }

    pub fn node(&self, uuid: &str) -> Option<&Node> {
        self.nodes.get(uuid)
    }

    // === Incremental mutations ===

    /// Coerce and assign one property on an existing node.
    pub fn set_property(&mut self, uuid: &str, property: &str, raw: &str) -> Result<(), SyncError> {
        let node = self
            .nodes
            .get_mut(uuid)
            .ok_or_else(|| SyncError::LookupMiss(uuid.to_string()))?;
        node.apply_attr(&property.to_ascii_lowercase(), raw)
    }

    /// Build the fragment's node(s) and attach the new child under
    /// `parent_uuid` at `index` (`-1` appends). Returns the child's uuid.
    ///
    /// A fragment normally carries exactly one node (new nodes are created
    /// before their children) but nested children are accepted and wired
    /// the same way the rebuild does.
    pub fn insert_child(
        &mut self,
        parent_uuid: &str,
        index: i64,
        fragment: &Element,
    ) -> Result<String, SyncError> {
        if !self.nodes.contains_key(parent_uuid) {
            return Err(SyncError::LookupMiss(parent_uuid.to_string()));
        }
        let built = self
            .build_subtree(fragment, Some(parent_uuid))
            .and_then(|child_uuid| {
                self.attach(parent_uuid, &child_uuid, index)?;
                Ok(child_uuid)
            });
        if built.is_err() {
            // Do not leave an unreachable subtree registered.
            if let Ok(root_uuid) = fragment.uuid() {
                let root_uuid = root_uuid.to_string();
                self.detach(parent_uuid, &root_uuid);
                self.deregister_subtree(&root_uuid);
            }
        }
        built
    }

    /// Remove a node: unlink it from its parent's ordered collection
    /// (preserving the remainder's order) and deregister the whole subtree
    /// from the uuid map.
    pub fn remove_child(&mut self, uuid: &str) -> Result<(), SyncError> {
        let parent_uuid = self
            .nodes
            .get(uuid)
            .ok_or_else(|| SyncError::LookupMiss(uuid.to_string()))?
            .parent()
            .map(str::to_string);
        if let Some(parent_uuid) = parent_uuid {
            self.detach(&parent_uuid, uuid);
        }
        self.deregister_subtree(uuid);
        if self.root.as_deref() == Some(uuid) {
            self.root = None;
        }
        Ok(())
    }

    // === Tree wiring ===

    fn build_subtree(&mut self, el: &Element, parent_uuid: Option<&str>) -> Result<String, SyncError> {
        let node = Node::from_element(el, parent_uuid)?;
        let uuid = node.uuid().to_string();
        self.nodes.insert(uuid.clone(), node);
        for child in &el.children {
            // The snapshot groups devices under a <hardware_devices>
            // wrapper that is not itself a node; flatten it.
            if child.tag == "hardware_devices" {
                for dev in &child.children {
                    let dev_uuid = self.build_subtree(dev, Some(&uuid))?;
                    self.attach(&uuid, &dev_uuid, -1)?;
                }
                continue;
            }
            let child_uuid = self.build_subtree(child, Some(&uuid))?;
            self.attach(&uuid, &child_uuid, -1)?;
        }
        Ok(uuid)
    }

    /// Link an already-registered child into its parent's typed collection.
    fn attach(&mut self, parent_uuid: &str, child_uuid: &str, index: i64) -> Result<(), SyncError> {
        let child_tag = self
            .nodes
            .get(child_uuid)
            .ok_or_else(|| SyncError::LookupMiss(child_uuid.to_string()))?
            .tag();
        let parent = self
            .nodes
            .get_mut(parent_uuid)
            .ok_or_else(|| SyncError::LookupMiss(parent_uuid.to_string()))?;
        match (parent, child_tag) {
            (Node::State(state), "hardware_device") => {
                insert_at(&mut state.hardware_devices, child_uuid, index)
            }
            (Node::State(state), "session") => state.session = Some(child_uuid.to_string()),
            (Node::Session(session), "track") => insert_at(&mut session.tracks, child_uuid, index),
            (Node::Track(track), "clip") => insert_at(&mut track.clips, child_uuid, index),
            (Node::Clip(clip), "sequence_event") => {
                insert_at(&mut clip.sequence_events, child_uuid, index)
            }
            (parent, child_tag) => {
                return Err(SyncError::MalformedFragment(format!(
                    "cannot attach <{}> under <{}>",
                    child_tag,
                    parent.tag()
                )))
            }
        }
        Ok(())
    }

    fn detach(&mut self, parent_uuid: &str, child_uuid: &str) {
        if let Some(parent) = self.nodes.get_mut(parent_uuid) {
            match parent {
                Node::State(state) => {
                    state.hardware_devices.retain(|u| u != child_uuid);
                    if state.session.as_deref() == Some(child_uuid) {
                        state.session = None;
                    }
                }
                Node::Session(session) => session.tracks.retain(|u| u != child_uuid),
                Node::Track(track) => track.clips.retain(|u| u != child_uuid),
                Node::Clip(clip) => clip.sequence_events.retain(|u| u != child_uuid),
                Node::SequenceEvent(_) | Node::HardwareDevice(_) => {}
            }
        }
    }

    fn deregister_subtree(&mut self, uuid: &str) {
        let mut pending = vec![uuid.to_string()];
        while let Some(u) = pending.pop() {
            if let Some(node) = self.nodes.remove(&u) {
                pending.extend(node.child_uuids());
            }
        }
    }

    // === Read accessors for the presentation layer ===

    pub fn state(&self) -> Option<&StateNode> {
        match self.root.as_deref().and_then(|u| self.nodes.get(u)) {
            Some(Node::State(s)) => Some(s),
            _ => None,
        }
    }

    pub fn session(&self) -> Option<&SessionNode> {
        match self
            .state()
            .and_then(|s| s.session.as_deref())
            .and_then(|u| self.nodes.get(u))
        {
            Some(Node::Session(s)) => Some(s),
            _ => None,
        }
    }

    pub fn track(&self, uuid: &str) -> Option<&TrackNode> {
        match self.nodes.get(uuid) {
            Some(Node::Track(t)) => Some(t),
            _ => None,
        }
    }

    pub fn clip(&self, uuid: &str) -> Option<&ClipNode> {
        match self.nodes.get(uuid) {
            Some(Node::Clip(c)) => Some(c),
            _ => None,
        }
    }

    pub fn sequence_event(&self, uuid: &str) -> Option<&SequenceEventNode> {
        match self.nodes.get(uuid) {
            Some(Node::SequenceEvent(e)) => Some(e),
            _ => None,
        }
    }

    pub fn hardware_device(&self, uuid: &str) -> Option<&HardwareDeviceNode> {
        match self.nodes.get(uuid) {
            Some(Node::HardwareDevice(d)) => Some(d),
            _ => None,
        }
    }

    /// Track at a session index, if any.
    pub fn track_at(&self, track_idx: usize) -> Option<&TrackNode> {
        let session = self.session()?;
        self.track(session.tracks.get(track_idx)?)
    }

    /// Clip at a (track, clip) index pair, if any.
    pub fn clip_at(&self, track_idx: usize, clip_idx: usize) -> Option<&ClipNode> {
        let track = self.track_at(track_idx)?;
        self.clip(track.clips.get(clip_idx)?)
    }

    /// All hardware devices in backend order.
    pub fn hardware_devices(&self) -> Vec<&HardwareDeviceNode> {
        self.state()
            .map(|s| {
                s.hardware_devices
                    .iter()
                    .filter_map(|u| self.hardware_device(u))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Find an input device by name or shortname.
    pub fn input_device_by_name(&self, name: &str) -> Option<&HardwareDeviceNode> {
        self.hardware_devices()
            .into_iter()
            .find(|d| d.is_input() && (d.name == name || d.shortname == name))
    }

    /// Find an output device by name or shortname.
    pub fn output_device_by_name(&self, name: &str) -> Option<&HardwareDeviceNode> {
        self.hardware_devices()
            .into_iter()
            .find(|d| d.is_output() && (d.name == name || d.shortname == name))
    }

    /// Human-readable tree dump, used by the CLI monitor.
    pub fn render(&self, include_attributes: bool) -> String {
        let mut out = String::from("BACKEND SESSION STATE\n");
        if let Some(session) = self.session() {
            let _ = writeln!(out, "* SESSION {} ({})", session.name, session.uuid);
            if include_attributes {
                let _ = writeln!(
                    out,
                    "  bpm: {}  meter: {}  playing: {}  metronome: {}",
                    session.bpm, session.meter, session.isplaying, session.metronomeon
                );
            }
            for track_uuid in &session.tracks {
                let Some(track) = self.track(track_uuid) else {
                    continue;
                };
                let _ = writeln!(out, "  * TRACK {} ({})", track.name, track.uuid);
                if include_attributes {
                    let _ = writeln!(
                        out,
                        "    device: {}  monitoring: {}",
                        track.hardwaredevicename, track.inputmonitoring
                    );
                }
                for clip_uuid in &track.clips {
                    let Some(clip) = self.clip(clip_uuid) else {
                        continue;
                    };
                    let _ = writeln!(
                        out,
                        "    * CLIP {} ({}) {}",
                        clip.name,
                        clip.uuid,
                        clip.status()
                    );
                    for ev_uuid in &clip.sequence_events {
                        if let Some(ev) = self.sequence_event(ev_uuid) {
                            let _ = writeln!(out, "      * SEQUENCE_EVENT {}", ev.uuid);
                            if include_attributes {
                                let _ = writeln!(
                                    out,
                                    "        type: {}  note: {}  t: {}  dur: {}",
                                    ev.event_type, ev.midinote, ev.timestamp, ev.duration
                                );
                            }
                        }
                    }
                }
            }
        }
        let devices = self.hardware_devices();
        if !devices.is_empty() {
            let _ = writeln!(out, "* HARDWARE DEVICES ({})", devices.len());
            for dev in devices {
                let _ = writeln!(out, "  * HARDWARE_DEVICE {} ({})", dev.name, dev.uuid);
            }
        }
        out
    }
}

fn insert_at(list: &mut Vec<String>, uuid: &str, index: i64) {
    if index < 0 || index as usize >= list.len() {
        list.push(uuid.to_string());
    } else {
        list.insert(index as usize, uuid.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markup;

    const SNAPSHOT: &str = r#"
        <state uuid="st">
          <hardware_devices>
            <hardware_device uuid="hd1" name="Synth A" shortname="synA" type="1"/>
            <hardware_device uuid="hd2" name="Pads In" shortname="pads" type="0"/>
          </hardware_devices>
          <session uuid="se" name="Jam" bpm="120.0" meter="4">
            <track uuid="t1" name="Bass" hardwaredevicename="synA">
              <clip uuid="c1" name="Bass 1" cliplengthinbeats="4.0" playing="1"
                    willplayat="-1.0" willstopat="-1.0" willstartrecordingat="-1.0"
                    willstoprecordingat="-1.0">
                <sequence_event uuid="e1" type="1" midinote="36" timestamp="0.0" duration="0.5"/>
                <sequence_event uuid="e2" type="1" midinote="38" timestamp="1.0" duration="0.5"/>
              </clip>
              <clip uuid="c2" name="Bass 2" cliplengthinbeats="0.0"/>
            </track>
            <track uuid="t2" name="Lead" hardwaredevicename="synA"/>
          </session>
        </state>"#;

    fn build() -> Graph {
        Graph::rebuild(&markup::parse(SNAPSHOT).unwrap()).unwrap()
    }

    /// Walk the tree from the root and check every reachable node resolves
    /// to itself through the uuid map, and nothing unreachable lingers.
    fn assert_map_consistent(graph: &Graph) {
        let root = graph.state().expect("graph has a root").uuid.clone();
        let mut reachable = vec![root];
        let mut seen = std::collections::HashSet::new();
        while let Some(uuid) = reachable.pop() {
            let node = graph.node(&uuid).expect("reachable node is registered");
            assert_eq!(node.uuid(), uuid);
            assert!(seen.insert(uuid.clone()), "uuid registered twice: {}", uuid);
            reachable.extend(node.child_uuids());
        }
        assert_eq!(seen.len(), graph.len(), "unreachable nodes left in map");
    }

    #[test]
    fn test_rebuild_registers_every_node() {
        // state + 2 devices + session + 2 tracks + 2 clips + 2 events
        let graph = build();
        assert_eq!(graph.len(), 10);
        assert_map_consistent(&graph);
        assert_eq!(graph.session().unwrap().name, "Jam");
        assert_eq!(graph.track_at(0).unwrap().name, "Bass");
        assert_eq!(graph.clip_at(0, 1).unwrap().name, "Bass 2");
        assert_eq!(graph.sequence_event("e2").unwrap().midinote, 38);
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let a = build();
        let b = build();
        assert_eq!(a.len(), b.len());
        assert_eq!(a.render(true), b.render(true));
        let mut uuids_a: Vec<&String> = a.nodes.keys().collect();
        let mut uuids_b: Vec<&String> = b.nodes.keys().collect();
        uuids_a.sort();
        uuids_b.sort();
        assert_eq!(uuids_a, uuids_b);
    }

    #[test]
    fn test_set_property_coerces() {
        let mut graph = build();
        graph.set_property("c1", "playing", "0").unwrap();
        assert!(!graph.clip("c1").unwrap().playing);
        graph.set_property("se", "bpm", "133.5").unwrap();
        assert!((graph.session().unwrap().bpm - 133.5).abs() < 1e-9);
    }

    #[test]
    fn test_set_property_missing_uuid_is_lookup_miss() {
        let mut graph = build();
        assert!(matches!(
            graph.set_property("nope", "playing", "1"),
            Err(SyncError::LookupMiss(_))
        ));
    }

    #[test]
    fn test_insert_child_at_index() {
        let mut graph = build();
        // Three clips on t1 after this append.
        let el = markup::parse(r#"<clip uuid="c3" name="Bass 3"/>"#).unwrap();
        graph.insert_child("t1", -1, &el).unwrap();
        assert_eq!(graph.track("t1").unwrap().clips, vec!["c1", "c2", "c3"]);

        // Explicit index 1 shifts the remainder right.
        let el = markup::parse(r#"<clip uuid="c4" name="Bass 4"/>"#).unwrap();
        graph.insert_child("t1", 1, &el).unwrap();
        assert_eq!(
            graph.track("t1").unwrap().clips,
            vec!["c1", "c4", "c2", "c3"]
        );
        assert_map_consistent(&graph);
    }

    #[test]
    fn test_insert_child_missing_parent() {
        let mut graph = build();
        let el = markup::parse(r#"<clip uuid="c9"/>"#).unwrap();
        assert!(matches!(
            graph.insert_child("nope", -1, &el),
            Err(SyncError::LookupMiss(_))
        ));
        assert!(!graph.contains("c9"));
    }

    #[test]
    fn test_insert_child_wrong_parent_kind_rolls_back() {
        let mut graph = build();
        let el = markup::parse(r#"<track uuid="t9"/>"#).unwrap();
        assert!(graph.insert_child("c1", -1, &el).is_err());
        assert!(!graph.contains("t9"));
        assert_map_consistent(&graph);
    }

    #[test]
    fn test_remove_child_preserves_order_and_cascades() {
        let mut graph = build();
        graph.remove_child("c1").unwrap();
        // Remaining clips keep their relative order.
        assert_eq!(graph.track("t1").unwrap().clips, vec!["c2"]);
        // The clip and its sequence events are all deregistered.
        assert!(!graph.contains("c1"));
        assert!(!graph.contains("e1"));
        assert!(!graph.contains("e2"));
        assert_map_consistent(&graph);
    }

    #[test]
    fn test_remove_child_missing_uuid() {
        let mut graph = build();
        assert!(matches!(
            graph.remove_child("nope"),
            Err(SyncError::LookupMiss(_))
        ));
    }

    #[test]
    fn test_device_lookup_by_name_and_direction() {
        let graph = build();
        assert_eq!(graph.output_device_by_name("synA").unwrap().uuid, "hd1");
        assert_eq!(graph.input_device_by_name("Pads In").unwrap().uuid, "hd2");
        assert!(graph.output_device_by_name("pads").is_none());
    }

    #[test]
    fn test_render_contains_tree() {
        let graph = build();
        let text = graph.render(false);
        assert!(text.contains("* SESSION Jam (se)"));
        assert!(text.contains("* TRACK Bass (t1)"));
        assert!(text.contains("* CLIP Bass 1 (c1)"));
        assert!(text.contains("HARDWARE DEVICES (2)"));
    }
}

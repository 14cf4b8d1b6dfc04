//! Typed node model for the mirrored session tree.
//!
//! Every node the backend serializes becomes one of six structs here:
//!
//! - [`StateNode`] - the root, owning hardware devices and the session
//! - [`SessionNode`] - transport and arrangement state
//! - [`TrackNode`] - one track, owning clips
//! - [`ClipNode`] - one clip, owning sequence events
//! - [`SequenceEventNode`] - a note or raw-MIDI event in a clip
//! - [`HardwareDeviceNode`] - a MIDI input or output the backend knows
//!
//! Attribute values arrive as strings and are coerced through a static
//! name → type table ([`attr_kind`]). Attribute names a node has no field
//! for are kept verbatim in its `extra` map; names missing from the table
//! entirely are assumed to be new backend attributes and logged once as a
//! warning when stored.

use std::collections::HashMap;

use crate::error::SyncError;
use crate::markup::Element;

/// Value type for a known backend attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrKind {
    Float,
    Int,
    Bool,
    Text,
}

/// Static attribute-name → type table.
///
/// Mirrors the backend's full property vocabulary, including attributes
/// that only appear in device-definition nodes; anything not listed here
/// is passed through as a raw string.
pub fn attr_kind(name: &str) -> Option<AttrKind> {
    use AttrKind::*;
    Some(match name {
        "allowaftertouchmessages" => Bool,
        "allowchannelpressuremessages" => Bool,
        "allowcontrollermessages" => Bool,
        "allowedmidiinputchannel" => Int,
        "allownotemessages" => Bool,
        "allowpitchbendmessages" => Bool,
        "availablehardwaredevicenames" => Text,
        "barcount" => Int,
        "bpm" => Float,
        "chance" => Float,
        "cliplengthinbeats" => Float,
        "controlchangemapping" => Text,
        "controlchangemessagesarerelative" => Bool,
        "countinplayheadpositioninbeats" => Float,
        "currentquantizationstep" => Float,
        "datalocation" => Text,
        "doingcountin" => Bool,
        "duration" => Float,
        "eventmidibytes" => Text,
        "fixedlengthrecordingbars" => Int,
        "fixedvelocity" => Bool,
        "hardwaredevicename" => Text,
        "inputmonitoring" => Bool,
        "isplaying" => Bool,
        "meter" => Int,
        "metronomeon" => Bool,
        "midiccparametervalueslist" => Text,
        "midichannel" => Int,
        "mididevicename" => Text,
        "midiinputdevicename" => Text,
        "midinote" => Int,
        "midioutputdevicename" => Text,
        "midivelocity" => Float,
        "name" => Text,
        "notesmapping" => Text,
        "notesmonitoringdevicename" => Text,
        "order" => Int,
        "playheadpositioninbeats" => Float,
        "playing" => Bool,
        "recordautomationenabled" => Bool,
        "recording" => Bool,
        "renderedendtimestamp" => Float,
        "renderedstarttimestamp" => Float,
        "renderwithinternalsynth" => Bool,
        "shortname" => Text,
        "timestamp" => Float,
        "type" => Int,
        "utime" => Float,
        "uuid" => Text,
        "version" => Text,
        "willplayat" => Float,
        "willstartrecordingat" => Float,
        "willstopat" => Float,
        "willstoprecordingat" => Float,
        "wrapeventsacrosscliploop" => Bool,
        _ => return None,
    })
}

fn coerce_f64(name: &str, raw: &str) -> Result<f64, SyncError> {
    raw.parse().map_err(|_| {
        SyncError::MalformedFragment(format!("{}={:?} is not a float", name, raw))
    })
}

fn coerce_i64(name: &str, raw: &str) -> Result<i64, SyncError> {
    raw.parse().map_err(|_| {
        SyncError::MalformedFragment(format!("{}={:?} is not an integer", name, raw))
    })
}

/// Booleans travel as the string "1" for true; anything else is false.
fn coerce_bool(raw: &str) -> bool {
    raw == "1"
}

/// Stash an attribute a node has no typed field for.
fn stash_extra(extra: &mut HashMap<String, String>, tag: &str, name: &str, raw: &str) {
    if attr_kind(name).is_none() {
        log::warn!("[MODEL] unknown attribute {}={:?} on <{}>", name, raw, tag);
    }
    extra.insert(name.to_string(), raw.to_string());
}

// === Node types ===

/// Root of the mirrored tree. Owns hardware devices and (at most) one session.
#[derive(Clone, Debug, Default)]
pub struct StateNode {
    pub uuid: String,
    /// Uuids of hardware devices, in backend order.
    pub hardware_devices: Vec<String>,
    /// Uuid of the session, once built.
    pub session: Option<String>,
    pub extra: HashMap<String, String>,
}

/// Transport and arrangement state.
#[derive(Clone, Debug)]
pub struct SessionNode {
    pub uuid: String,
    pub parent: Option<String>,
    pub name: String,
    pub bpm: f64,
    pub meter: i64,
    pub isplaying: bool,
    pub metronomeon: bool,
    pub doingcountin: bool,
    pub countinplayheadpositioninbeats: f64,
    pub fixedlengthrecordingbars: i64,
    pub recordautomationenabled: bool,
    /// Uuids of tracks, ordered.
    pub tracks: Vec<String>,
    pub extra: HashMap<String, String>,
}

impl Default for SessionNode {
    fn default() -> Self {
        Self {
            uuid: String::new(),
            parent: None,
            name: String::new(),
            bpm: 120.0,
            meter: 4,
            isplaying: false,
            metronomeon: false,
            doingcountin: false,
            countinplayheadpositioninbeats: 0.0,
            fixedlengthrecordingbars: 0,
            recordautomationenabled: false,
            tracks: Vec::new(),
            extra: HashMap::new(),
        }
    }
}

/// One track, owning an ordered list of clips.
#[derive(Clone, Debug, Default)]
pub struct TrackNode {
    pub uuid: String,
    pub parent: Option<String>,
    pub name: String,
    pub hardwaredevicename: String,
    pub inputmonitoring: bool,
    pub notesmonitoringdevicename: String,
    /// Uuids of clips, ordered.
    pub clips: Vec<String>,
    pub extra: HashMap<String, String>,
}

/// One clip, owning an ordered list of sequence events.
///
/// The `will*at` attributes hold the beat position of a cued transition,
/// or a negative value when nothing is cued.
#[derive(Clone, Debug)]
pub struct ClipNode {
    pub uuid: String,
    pub parent: Option<String>,
    pub name: String,
    pub cliplengthinbeats: f64,
    pub playing: bool,
    pub recording: bool,
    pub willplayat: f64,
    pub willstopat: f64,
    pub willstartrecordingat: f64,
    pub willstoprecordingat: f64,
    pub currentquantizationstep: f64,
    pub playheadpositioninbeats: f64,
    /// Uuids of sequence events, ordered.
    pub sequence_events: Vec<String>,
    pub extra: HashMap<String, String>,
}

impl Default for ClipNode {
    fn default() -> Self {
        Self {
            uuid: String::new(),
            parent: None,
            name: String::new(),
            cliplengthinbeats: 0.0,
            playing: false,
            recording: false,
            willplayat: -1.0,
            willstopat: -1.0,
            willstartrecordingat: -1.0,
            willstoprecordingat: -1.0,
            currentquantizationstep: 0.0,
            playheadpositioninbeats: 0.0,
            sequence_events: Vec::new(),
            extra: HashMap::new(),
        }
    }
}

impl ClipNode {
    /// Derived clip status, recomputed on every call (never stored).
    ///
    /// Three flags (play, record, empty) followed by the clip length and
    /// the current quantization step:
    /// `{p|s|c|C}{r|n|w|W}{E|e}|<length>|<quantization>`.
    pub fn status(&self) -> String {
        let record = if self.willstartrecordingat >= 0.0 {
            'w' // cued to record
        } else if self.willstoprecordingat >= 0.0 {
            'W' // cued to stop recording
        } else if self.recording {
            'r'
        } else {
            'n'
        };

        let play = if self.willplayat >= 0.0 {
            'c' // cued to play
        } else if self.willstopat >= 0.0 {
            'C' // cued to stop
        } else if self.playing {
            'p'
        } else {
            's'
        };

        let empty = if self.cliplengthinbeats == 0.0 { 'E' } else { 'e' };

        format!(
            "{}{}{}|{:.3}|{}",
            play, record, empty, self.cliplengthinbeats, self.currentquantizationstep
        )
    }

    pub fn is_empty(&self) -> bool {
        self.cliplengthinbeats == 0.0
    }
}

/// A single event inside a clip's sequence.
#[derive(Clone, Debug)]
pub struct SequenceEventNode {
    pub uuid: String,
    pub parent: Option<String>,
    /// 0 = generic MIDI event, 1 = note event.
    pub event_type: i64,
    pub midinote: i64,
    /// Normalized 0.0-1.0.
    pub midivelocity: f64,
    pub timestamp: f64,
    pub duration: f64,
    pub utime: f64,
    pub chance: f64,
    pub renderedstarttimestamp: f64,
    pub renderedendtimestamp: f64,
    pub eventmidibytes: String,
    pub extra: HashMap<String, String>,
}

impl Default for SequenceEventNode {
    fn default() -> Self {
        Self {
            uuid: String::new(),
            parent: None,
            event_type: 1,
            midinote: 0,
            midivelocity: 1.0,
            timestamp: 0.0,
            duration: 0.0,
            utime: 0.0,
            chance: 1.0,
            renderedstarttimestamp: -1.0,
            renderedendtimestamp: -1.0,
            eventmidibytes: String::new(),
            extra: HashMap::new(),
        }
    }
}

impl SequenceEventNode {
    pub fn is_note(&self) -> bool {
        self.event_type == 1
    }

    pub fn is_midi(&self) -> bool {
        self.event_type == 0
    }
}

/// A MIDI hardware device the backend exposes.
#[derive(Clone, Debug, Default)]
pub struct HardwareDeviceNode {
    pub uuid: String,
    pub parent: Option<String>,
    pub name: String,
    pub shortname: String,
    /// 0 = input, 1 = output.
    pub device_type: i64,
    /// Comma-separated current CC values, indexed by controller number.
    pub midiccparametervalueslist: String,
    pub extra: HashMap<String, String>,
}

impl HardwareDeviceNode {
    pub fn is_input(&self) -> bool {
        self.device_type == 0
    }

    pub fn is_output(&self) -> bool {
        self.device_type == 1
    }

    /// Current value of a MIDI CC parameter, if the backend reported one.
    pub fn cc_parameter_value(&self, cc_number: usize) -> Option<i64> {
        self.midiccparametervalueslist
            .split(',')
            .nth(cc_number)
            .and_then(|v| v.trim().parse().ok())
    }
}

// === The closed node variant ===

/// Any node in the mirrored tree.
#[derive(Clone, Debug)]
pub enum Node {
    State(StateNode),
    Session(SessionNode),
    Track(TrackNode),
    Clip(ClipNode),
    SequenceEvent(SequenceEventNode),
    HardwareDevice(HardwareDeviceNode),
}

impl Node {
    /// Construct a node from a parsed fragment, keyed by its tag name.
    ///
    /// Children of the element are NOT consumed here; tree wiring is the
    /// graph's job.
    pub fn from_element(el: &Element, parent: Option<&str>) -> Result<Node, SyncError> {
        let uuid = el.uuid()?.to_string();
        let parent = parent.map(str::to_string);
        let mut node = match el.tag.as_str() {
            "state" => Node::State(StateNode {
                uuid,
                ..Default::default()
            }),
            "session" => Node::Session(SessionNode {
                uuid,
                parent,
                ..Default::default()
            }),
            "track" => Node::Track(TrackNode {
                uuid,
                parent,
                ..Default::default()
            }),
            "clip" => Node::Clip(ClipNode {
                uuid,
                parent,
                ..Default::default()
            }),
            "sequence_event" => Node::SequenceEvent(SequenceEventNode {
                uuid,
                parent,
                ..Default::default()
            }),
            "hardware_device" => Node::HardwareDevice(HardwareDeviceNode {
                uuid,
                parent,
                ..Default::default()
            }),
            other => return Err(SyncError::UnknownTag(other.to_string())),
        };
        for (name, raw) in &el.attrs {
            if name == "uuid" {
                continue;
            }
            node.apply_attr(name, raw)?;
        }
        Ok(node)
    }

    pub fn uuid(&self) -> &str {
        match self {
            Node::State(n) => &n.uuid,
            Node::Session(n) => &n.uuid,
            Node::Track(n) => &n.uuid,
            Node::Clip(n) => &n.uuid,
            Node::SequenceEvent(n) => &n.uuid,
            Node::HardwareDevice(n) => &n.uuid,
        }
    }

    pub fn parent(&self) -> Option<&str> {
        match self {
            Node::State(_) => None,
            Node::Session(n) => n.parent.as_deref(),
            Node::Track(n) => n.parent.as_deref(),
            Node::Clip(n) => n.parent.as_deref(),
            Node::SequenceEvent(n) => n.parent.as_deref(),
            Node::HardwareDevice(n) => n.parent.as_deref(),
        }
    }

    /// Tag name this node serializes as.
    pub fn tag(&self) -> &'static str {
        match self {
            Node::State(_) => "state",
            Node::Session(_) => "session",
            Node::Track(_) => "track",
            Node::Clip(_) => "clip",
            Node::SequenceEvent(_) => "sequence_event",
            Node::HardwareDevice(_) => "hardware_device",
        }
    }

    /// Uuids of this node's ordered children (owned collections only).
    pub fn child_uuids(&self) -> Vec<String> {
        match self {
            Node::State(n) => {
                let mut all = n.hardware_devices.clone();
                all.extend(n.session.iter().cloned());
                all
            }
            Node::Session(n) => n.tracks.clone(),
            Node::Track(n) => n.clips.clone(),
            Node::Clip(n) => n.sequence_events.clone(),
            Node::SequenceEvent(_) | Node::HardwareDevice(_) => Vec::new(),
        }
    }

    /// Coerce and assign one attribute.
    ///
    /// Attributes without a matching typed field land in the node's
    /// `extra` map; coercion failures are malformed-fragment errors.
    pub fn apply_attr(&mut self, name: &str, raw: &str) -> Result<(), SyncError> {
        match self {
            Node::State(n) => {
                // The root carries bookkeeping attributes only.
                stash_extra(&mut n.extra, "state", name, raw);
            }
            Node::Session(n) => match name {
                "name" => n.name = raw.to_string(),
                "bpm" => n.bpm = coerce_f64(name, raw)?,
                "meter" => n.meter = coerce_i64(name, raw)?,
                "isplaying" => n.isplaying = coerce_bool(raw),
                "metronomeon" => n.metronomeon = coerce_bool(raw),
                "doingcountin" => n.doingcountin = coerce_bool(raw),
                "countinplayheadpositioninbeats" => {
                    n.countinplayheadpositioninbeats = coerce_f64(name, raw)?
                }
                "fixedlengthrecordingbars" => {
                    n.fixedlengthrecordingbars = coerce_i64(name, raw)?
                }
                "recordautomationenabled" => n.recordautomationenabled = coerce_bool(raw),
                _ => stash_extra(&mut n.extra, "session", name, raw),
            },
            Node::Track(n) => match name {
                "name" => n.name = raw.to_string(),
                "hardwaredevicename" => n.hardwaredevicename = raw.to_string(),
                "inputmonitoring" => n.inputmonitoring = coerce_bool(raw),
                "notesmonitoringdevicename" => n.notesmonitoringdevicename = raw.to_string(),
                _ => stash_extra(&mut n.extra, "track", name, raw),
            },
            Node::Clip(n) => match name {
                "name" => n.name = raw.to_string(),
                "cliplengthinbeats" => n.cliplengthinbeats = coerce_f64(name, raw)?,
                "playing" => n.playing = coerce_bool(raw),
                "recording" => n.recording = coerce_bool(raw),
                "willplayat" => n.willplayat = coerce_f64(name, raw)?,
                "willstopat" => n.willstopat = coerce_f64(name, raw)?,
                "willstartrecordingat" => n.willstartrecordingat = coerce_f64(name, raw)?,
                "willstoprecordingat" => n.willstoprecordingat = coerce_f64(name, raw)?,
                "currentquantizationstep" => {
                    n.currentquantizationstep = coerce_f64(name, raw)?
                }
                "playheadpositioninbeats" => {
                    n.playheadpositioninbeats = coerce_f64(name, raw)?
                }
                _ => stash_extra(&mut n.extra, "clip", name, raw),
            },
            Node::SequenceEvent(n) => match name {
                "type" => n.event_type = coerce_i64(name, raw)?,
                "midinote" => n.midinote = coerce_i64(name, raw)?,
                "midivelocity" => n.midivelocity = coerce_f64(name, raw)?,
                "timestamp" => n.timestamp = coerce_f64(name, raw)?,
                "duration" => n.duration = coerce_f64(name, raw)?,
                "utime" => n.utime = coerce_f64(name, raw)?,
                "chance" => n.chance = coerce_f64(name, raw)?,
                "renderedstarttimestamp" => {
                    n.renderedstarttimestamp = coerce_f64(name, raw)?
                }
                "renderedendtimestamp" => n.renderedendtimestamp = coerce_f64(name, raw)?,
                "eventmidibytes" => n.eventmidibytes = raw.to_string(),
                _ => stash_extra(&mut n.extra, "sequence_event", name, raw),
            },
            Node::HardwareDevice(n) => match name {
                "name" => n.name = raw.to_string(),
                "shortname" => n.shortname = raw.to_string(),
                "type" => n.device_type = coerce_i64(name, raw)?,
                "midiccparametervalueslist" => {
                    n.midiccparametervalueslist = raw.to_string()
                }
                _ => stash_extra(&mut n.extra, "hardware_device", name, raw),
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markup;

    #[test]
    fn test_attr_kind_table() {
        assert_eq!(attr_kind("bpm"), Some(AttrKind::Float));
        assert_eq!(attr_kind("meter"), Some(AttrKind::Int));
        assert_eq!(attr_kind("playing"), Some(AttrKind::Bool));
        assert_eq!(attr_kind("name"), Some(AttrKind::Text));
        assert_eq!(attr_kind("somefutureattribute"), None);
    }

    #[test]
    fn test_bool_coercion_is_literal_one() {
        assert!(coerce_bool("1"));
        assert!(!coerce_bool("0"));
        assert!(!coerce_bool("true"));
        assert!(!coerce_bool(""));
    }

    #[test]
    fn test_clip_from_element() {
        let el = markup::parse(
            r#"<clip uuid="c1" name="Groove" cliplengthinbeats="8.0" playing="1"
                     willplayat="-1.0" willstopat="-1.0" currentquantizationstep="0.25"/>"#,
        )
        .unwrap();
        let node = Node::from_element(&el, Some("t1")).unwrap();
        let Node::Clip(clip) = node else {
            panic!("expected a clip")
        };
        assert_eq!(clip.name, "Groove");
        assert!(clip.playing);
        assert!((clip.cliplengthinbeats - 8.0).abs() < 1e-9);
        assert_eq!(clip.parent.as_deref(), Some("t1"));
    }

    #[test]
    fn test_unknown_attribute_goes_to_extra() {
        let el = markup::parse(r#"<track uuid="t1" futureknob="42"/>"#).unwrap();
        let node = Node::from_element(&el, None).unwrap();
        let Node::Track(track) = node else {
            panic!("expected a track")
        };
        assert_eq!(track.extra.get("futureknob").map(String::as_str), Some("42"));
    }

    #[test]
    fn test_unknown_tag_is_error() {
        let el = markup::parse(r#"<widget uuid="w1"/>"#).unwrap();
        assert!(matches!(
            Node::from_element(&el, None),
            Err(SyncError::UnknownTag(_))
        ));
    }

    #[test]
    fn test_bad_coercion_is_error() {
        let el = markup::parse(r#"<session uuid="s1" bpm="fast"/>"#).unwrap();
        assert!(matches!(
            Node::from_element(&el, None),
            Err(SyncError::MalformedFragment(_))
        ));
    }

    #[test]
    fn test_clip_status_flags() {
        let mut clip = ClipNode::default();
        // Empty, stopped, not recording.
        assert_eq!(clip.status(), "snE|0.000|0");

        clip.cliplengthinbeats = 4.0;
        clip.playing = true;
        assert_eq!(clip.status(), "pne|4.000|0");

        clip.willstopat = 8.0;
        clip.recording = true;
        assert_eq!(clip.status(), "Cre|4.000|0");

        clip.willstoprecordingat = 8.0;
        assert_eq!(clip.status(), "CWe|4.000|0");
    }

    #[test]
    fn test_clip_status_cued_to_record_empty() {
        // Scenario: a fresh clip armed for recording.
        let mut clip = ClipNode::default();
        clip.willstartrecordingat = 0.0;
        clip.currentquantizationstep = 0.25;
        assert_eq!(clip.status(), "swE|0.000|0.25");
        assert!(clip.is_empty());
    }

    #[test]
    fn test_sequence_event_kinds() {
        let mut ev = SequenceEventNode::default();
        assert!(ev.is_note());
        ev.event_type = 0;
        assert!(ev.is_midi());
    }

    #[test]
    fn test_device_cc_parameter_lookup() {
        let mut dev = HardwareDeviceNode::default();
        dev.midiccparametervalueslist = "0,64,127".to_string();
        assert_eq!(dev.cc_parameter_value(1), Some(64));
        assert_eq!(dev.cc_parameter_value(2), Some(127));
        assert_eq!(dev.cc_parameter_value(9), None);
    }
}

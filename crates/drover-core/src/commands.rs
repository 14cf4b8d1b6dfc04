//! The outbound command vocabulary.
//!
//! Every mutation the controller can ask of the backend is a [`Command`]:
//! an address plus positional arguments. Constructors cover the whole
//! vocabulary so call sites never hand-build addresses. Sequence contents
//! travel as JSON payloads inside a single argument.

use serde::{Deserialize, Serialize};

use crate::client::{CmdArg, Outbound};
use crate::error::SyncError;

/// One outbound command, ready to send through any [`Outbound`].
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub address: &'static str,
    pub args: Vec<CmdArg>,
}

impl Command {
    fn new(address: &'static str, args: Vec<CmdArg>) -> Self {
        Self { address, args }
    }

    pub fn send_via(&self, outbound: &dyn Outbound) -> Result<(), SyncError> {
        outbound.send(self.address, &self.args)
    }

    // === Handshake ===

    /// Ask for a full snapshot of the backend state.
    pub fn get_state_full() -> Self {
        Self::new("/get_state", vec!["full".into()])
    }

    /// Tell the backend the controller has a built mirror and is ready.
    pub fn controller_ready() -> Self {
        Self::new("/controllerReady", vec![])
    }

    // === Transport ===

    pub fn transport_play() -> Self {
        Self::new("/transport/play", vec![])
    }

    pub fn transport_stop() -> Self {
        Self::new("/transport/stop", vec![])
    }

    pub fn transport_play_stop() -> Self {
        Self::new("/transport/playStop", vec![])
    }

    pub fn set_bpm(bpm: f64) -> Self {
        Self::new("/transport/setBpm", vec![bpm.into()])
    }

    pub fn set_meter(meter: i64) -> Self {
        Self::new("/transport/setMeter", vec![meter.into()])
    }

    pub fn metronome_on_off() -> Self {
        Self::new("/metronome/onOff", vec![])
    }

    // === Session settings ===

    pub fn save_session(name: &str) -> Self {
        Self::new("/settings/save", vec![name.into()])
    }

    pub fn load_session(name: &str) -> Self {
        Self::new("/settings/load", vec![name.into()])
    }

    pub fn new_session(num_tracks: i64, num_scenes: i64) -> Self {
        Self::new("/settings/new", vec![num_tracks.into(), num_scenes.into()])
    }

    pub fn set_fixed_length_recording_bars(bars: i64) -> Self {
        Self::new("/settings/fixedLength", vec![bars.into()])
    }

    pub fn set_fixed_velocity(enabled: bool) -> Self {
        Self::new("/settings/fixedVelocity", vec![enabled.into()])
    }

    pub fn toggle_record_automation() -> Self {
        Self::new("/settings/toggleRecordAutomation", vec![])
    }

    // === Scenes ===

    pub fn scene_play(scene_number: i64) -> Self {
        Self::new("/scene/play", vec![scene_number.into()])
    }

    pub fn scene_duplicate(scene_number: i64) -> Self {
        Self::new("/scene/duplicate", vec![scene_number.into()])
    }

    // === Tracks ===

    pub fn set_input_monitoring(track_uuid: &str, enabled: bool) -> Self {
        Self::new(
            "/track/setInputMonitoring",
            vec![track_uuid.into(), enabled.into()],
        )
    }

    pub fn set_active_notes_monitoring_track(track_uuid: &str) -> Self {
        Self::new(
            "/track/setActiveUiNotesMonitoringTrack",
            vec![track_uuid.into()],
        )
    }

    pub fn set_output_hardware_device(track_uuid: &str, device_name: &str) -> Self {
        Self::new(
            "/track/setOutputHardwareDevice",
            vec![track_uuid.into(), device_name.into()],
        )
    }

    // === Clips ===

    pub fn clip_play_stop(track_uuid: &str, clip_uuid: &str) -> Self {
        Self::new("/clip/playStop", vec![track_uuid.into(), clip_uuid.into()])
    }

    pub fn clip_play(track_uuid: &str, clip_uuid: &str) -> Self {
        Self::new("/clip/play", vec![track_uuid.into(), clip_uuid.into()])
    }

    pub fn clip_stop(track_uuid: &str, clip_uuid: &str) -> Self {
        Self::new("/clip/stop", vec![track_uuid.into(), clip_uuid.into()])
    }

    pub fn clip_record_on_off(track_uuid: &str, clip_uuid: &str) -> Self {
        Self::new(
            "/clip/recordOnOff",
            vec![track_uuid.into(), clip_uuid.into()],
        )
    }

    pub fn clip_clear(track_uuid: &str, clip_uuid: &str) -> Self {
        Self::new("/clip/clear", vec![track_uuid.into(), clip_uuid.into()])
    }

    pub fn clip_double(track_uuid: &str, clip_uuid: &str) -> Self {
        Self::new("/clip/double", vec![track_uuid.into(), clip_uuid.into()])
    }

    pub fn clip_undo(track_uuid: &str, clip_uuid: &str) -> Self {
        Self::new("/clip/undo", vec![track_uuid.into(), clip_uuid.into()])
    }

    pub fn clip_quantize(track_uuid: &str, clip_uuid: &str, step: f64) -> Self {
        Self::new(
            "/clip/quantize",
            vec![track_uuid.into(), clip_uuid.into(), step.into()],
        )
    }

    pub fn clip_set_length(track_uuid: &str, clip_uuid: &str, length_in_beats: f64) -> Self {
        Self::new(
            "/clip/setLength",
            vec![track_uuid.into(), clip_uuid.into(), length_in_beats.into()],
        )
    }

    /// Replace a clip's whole sequence.
    pub fn clip_set_sequence(
        track_uuid: &str,
        clip_uuid: &str,
        sequence: &SequenceSpec,
    ) -> Result<Self, SyncError> {
        let payload = serde_json::to_string(sequence)?;
        Ok(Self::new(
            "/clip/setSequence",
            vec![track_uuid.into(), clip_uuid.into(), payload.into()],
        ))
    }

    /// Apply one add/edit/remove to a clip's sequence.
    pub fn clip_edit_sequence(
        track_uuid: &str,
        clip_uuid: &str,
        edit: &SequenceEdit,
    ) -> Result<Self, SyncError> {
        let payload = serde_json::to_string(edit)?;
        Ok(Self::new(
            "/clip/editSequence",
            vec![track_uuid.into(), clip_uuid.into(), payload.into()],
        ))
    }

    // === Hardware devices ===

    pub fn device_send_midi(device_name: &str, bytes: &[u8]) -> Self {
        let mut args: Vec<CmdArg> = vec![device_name.into()];
        args.extend(bytes.iter().map(|b| CmdArg::Int(*b as i64)));
        Self::new("/device/sendMidi", args)
    }

    pub fn device_all_notes_off(device_name: &str) -> Self {
        Self::new("/device/sendAllNotesOff", vec![device_name.into()])
    }

    pub fn device_load_preset(device_name: &str, bank: i64, preset: i64) -> Self {
        Self::new(
            "/device/loadDevicePreset",
            vec![device_name.into(), bank.into(), preset.into()],
        )
    }

    pub fn device_set_notes_mapping(device_name: &str, mapping: &[i64]) -> Self {
        Self::new(
            "/device/setNotesMapping",
            vec![device_name.into(), join_mapping(mapping).into()],
        )
    }

    pub fn device_set_cc_mapping(device_name: &str, mapping: &[i64]) -> Self {
        Self::new(
            "/device/setCCMapping",
            vec![device_name.into(), join_mapping(mapping).into()],
        )
    }

    // === Diagnostics ===

    pub fn toggle_debug_synth() -> Self {
        Self::new("/settings/debugSynthOnOff", vec![])
    }
}

fn join_mapping(mapping: &[i64]) -> String {
    mapping
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Properties of one sequence event, as the backend's JSON expects them.
///
/// Optional fields are omitted when unset so the same type serves both
/// full event definitions (`addEvent`) and partial edits (`editEvent`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceEventSpec {
    /// 0 = generic MIDI event, 1 = note event.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub midi_note: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub midi_velocity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utime: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_midi_bytes: Option<String>,
}

impl SequenceEventSpec {
    /// A complete note event.
    pub fn note(midi_note: i64, midi_velocity: f64, timestamp: f64, duration: f64) -> Self {
        Self {
            event_type: Some(1),
            midi_note: Some(midi_note),
            midi_velocity: Some(midi_velocity),
            timestamp: Some(timestamp),
            duration: Some(duration),
            chance: Some(1.0),
            utime: Some(0.0),
            ..Default::default()
        }
    }

    /// A complete generic MIDI event ("b1,b2,b3" byte list).
    pub fn midi(event_midi_bytes: &str, timestamp: f64) -> Self {
        Self {
            event_type: Some(0),
            event_midi_bytes: Some(event_midi_bytes.to_string()),
            timestamp: Some(timestamp),
            ..Default::default()
        }
    }
}

/// A full sequence replacing a clip's contents.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceSpec {
    pub clip_length: f64,
    pub sequence_events: Vec<SequenceEventSpec>,
}

/// One incremental edit to a clip's sequence.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "action")]
pub enum SequenceEdit {
    #[serde(rename = "addEvent")]
    AddEvent {
        #[serde(rename = "eventData")]
        event_data: SequenceEventSpec,
    },
    #[serde(rename = "editEvent")]
    EditEvent {
        #[serde(rename = "eventUUID")]
        event_uuid: String,
        #[serde(rename = "eventData")]
        event_data: SequenceEventSpec,
    },
    #[serde(rename = "removeEvent")]
    RemoveEvent {
        #[serde(rename = "eventUUID")]
        event_uuid: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_state_full() {
        let cmd = Command::get_state_full();
        assert_eq!(cmd.address, "/get_state");
        assert_eq!(cmd.args, vec![CmdArg::Str("full".into())]);
    }

    #[test]
    fn test_clip_commands_carry_both_uuids() {
        let cmd = Command::clip_quantize("t1", "c1", 0.25);
        assert_eq!(cmd.address, "/clip/quantize");
        assert_eq!(
            cmd.args,
            vec![
                CmdArg::Str("t1".into()),
                CmdArg::Str("c1".into()),
                CmdArg::Float(0.25),
            ]
        );
    }

    #[test]
    fn test_input_monitoring_bool_goes_as_number() {
        let cmd = Command::set_input_monitoring("t1", true);
        assert_eq!(cmd.args[1].to_wire_string(), "1");
        let cmd = Command::set_input_monitoring("t1", false);
        assert_eq!(cmd.args[1].to_wire_string(), "0");
    }

    #[test]
    fn test_set_sequence_payload_shape() {
        let spec = SequenceSpec {
            clip_length: 6.0,
            sequence_events: vec![
                SequenceEventSpec::note(79, 1.0, 0.29, 0.65),
                SequenceEventSpec::midi("176,21,56", 2.99),
            ],
        };
        let cmd = Command::clip_set_sequence("t1", "c1", &spec).unwrap();
        assert_eq!(cmd.address, "/clip/setSequence");
        let CmdArg::Str(payload) = &cmd.args[2] else {
            panic!("payload must be a string arg")
        };
        let value: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(value["clipLength"], 6.0);
        assert_eq!(value["sequenceEvents"][0]["type"], 1);
        assert_eq!(value["sequenceEvents"][0]["midiNote"], 79);
        assert_eq!(value["sequenceEvents"][1]["eventMidiBytes"], "176,21,56");
        // Unset fields never appear in the payload.
        assert!(value["sequenceEvents"][1].get("midiNote").is_none());
    }

    #[test]
    fn test_edit_sequence_actions() {
        let edit = SequenceEdit::RemoveEvent {
            event_uuid: "e1".into(),
        };
        let cmd = Command::clip_edit_sequence("t1", "c1", &edit).unwrap();
        let CmdArg::Str(payload) = &cmd.args[2] else {
            panic!("payload must be a string arg")
        };
        let value: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(value["action"], "removeEvent");
        assert_eq!(value["eventUUID"], "e1");

        let edit = SequenceEdit::EditEvent {
            event_uuid: "e2".into(),
            event_data: SequenceEventSpec {
                midi_note: Some(60),
                ..Default::default()
            },
        };
        let cmd = Command::clip_edit_sequence("t1", "c1", &edit).unwrap();
        let CmdArg::Str(payload) = &cmd.args[2] else {
            panic!("payload must be a string arg")
        };
        let value: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(value["action"], "editEvent");
        assert_eq!(value["eventData"]["midiNote"], 60);
    }

    #[test]
    fn test_device_send_midi_flattens_bytes() {
        let cmd = Command::device_send_midi("synA", &[0x90, 60, 100]);
        assert_eq!(cmd.address, "/device/sendMidi");
        assert_eq!(cmd.args.len(), 4);
        assert_eq!(cmd.args[1], CmdArg::Int(144));
    }

    #[test]
    fn test_mapping_joined_with_commas() {
        let cmd = Command::device_set_cc_mapping("synA", &[1, 2, 3]);
        assert_eq!(cmd.args[1].to_wire_string(), "1,2,3");
    }
}

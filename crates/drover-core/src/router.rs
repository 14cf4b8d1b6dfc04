//! Decoding of backend traffic into a single event stream.
//!
//! Both transports carry the same four logical messages (`/app_started`,
//! `/alive`, `/state_update` and `/full_state`) and both feed the same
//! [`BackendEvent`] funnel the synchronizer consumes. The OSC channel
//! delivers them as typed argument lists; the reliable stream delivers
//! newline-framed text of the form `address:arg;arg;...`.
//!
//! Splitting the text frames needs care: markup payloads may themselves
//! contain `;`. An `addedChild` frame therefore rejoins everything past the
//! fourth data field, and a `/full_state` frame splits at the first `;`
//! only.

use rosc::{OscMessage, OscType};

use crate::error::SyncError;

/// One incremental mutation of the mirrored tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Update {
    /// A single property changed on an existing node.
    PropertyChanged {
        uuid: String,
        node_type: String,
        property: String,
        value: String,
    },
    /// A new node appeared under `parent_uuid` at `index` (-1 = append).
    /// `markup` is the serialized fragment for the new node.
    AddedChild {
        parent_uuid: String,
        parent_type: String,
        index: i64,
        markup: String,
    },
    /// A node (and implicitly its subtree) was removed.
    RemovedChild { uuid: String, node_type: String },
}

/// Everything the synchronizer thread reacts to, from any source.
#[derive(Clone, Debug, PartialEq)]
pub enum BackendEvent {
    /// The backend (re)started, or the reliable channel (re)connected.
    AppStarted,
    /// The reliable channel dropped.
    ConnectionLost,
    /// Liveness beacon on the unreliable channel.
    Alive,
    /// A sequenced incremental update.
    StateUpdate { id: u64, update: Update },
    /// A full snapshot, answering `/get_state`.
    FullState { id: u64, markup: String },
    /// Periodic tick from the poll thread.
    Poll,
}

fn build_update(update_type: &str, data: &[String]) -> Result<Update, SyncError> {
    let field = |i: usize| -> Result<&String, SyncError> {
        data.get(i).ok_or_else(|| {
            SyncError::MalformedFrame(format!(
                "{} update carries {} fields, needs at least {}",
                update_type,
                data.len(),
                i + 1
            ))
        })
    };
    match update_type {
        "propertyChanged" => Ok(Update::PropertyChanged {
            uuid: field(0)?.clone(),
            node_type: field(1)?.clone(),
            property: field(2)?.clone(),
            value: field(3)?.clone(),
        }),
        "addedChild" => Ok(Update::AddedChild {
            parent_uuid: field(0)?.clone(),
            parent_type: field(1)?.clone(),
            index: field(2)?.parse().map_err(|_| {
                SyncError::MalformedFrame(format!("bad child index {:?}", field(2)))
            })?,
            markup: field(3)?.clone(),
        }),
        "removedChild" => Ok(Update::RemovedChild {
            uuid: field(0)?.clone(),
            node_type: field(1)?.clone(),
        }),
        other => Err(SyncError::MalformedFrame(format!(
            "unknown update type {:?}",
            other
        ))),
    }
}

fn parse_update_id(raw: &str) -> Result<u64, SyncError> {
    raw.trim()
        .parse()
        .map_err(|_| SyncError::MalformedFrame(format!("bad update id {:?}", raw)))
}

/// Decode one newline-framed text frame from the reliable channel.
///
/// Returns `Ok(None)` for addresses we do not handle.
pub fn parse_frame(frame: &str) -> Result<Option<BackendEvent>, SyncError> {
    let (address, payload) = match frame.split_once(':') {
        Some((a, p)) => (a, p),
        None => (frame, ""),
    };
    match address {
        "/app_started" => Ok(Some(BackendEvent::AppStarted)),
        "/alive" => Ok(Some(BackendEvent::Alive)),
        "/state_update" => {
            let parts: Vec<&str> = payload.split(';').collect();
            if parts.len() < 2 {
                return Err(SyncError::MalformedFrame(format!(
                    "state_update frame too short: {:?}",
                    payload
                )));
            }
            let update_type = parts[0];
            let id = parse_update_id(parts[1])?;
            // The last data field of propertyChanged/addedChild may itself
            // contain `;` (markup, free-form values), so it is everything
            // past the third field rejoined.
            let data: Vec<String> = match update_type {
                "propertyChanged" | "addedChild" => {
                    if parts.len() < 6 {
                        return Err(SyncError::MalformedFrame(format!(
                            "{} frame too short: {:?}",
                            update_type, payload
                        )));
                    }
                    vec![
                        parts[2].to_string(),
                        parts[3].to_string(),
                        parts[4].to_string(),
                        parts[5..].join(";"),
                    ]
                }
                _ => parts[2..].iter().map(|s| s.to_string()).collect(),
            };
            let update = build_update(update_type, &data)?;
            Ok(Some(BackendEvent::StateUpdate { id, update }))
        }
        "/full_state" => {
            // Split at the FIRST `;` only: the snapshot markup follows.
            let (id_raw, markup) = payload.split_once(';').ok_or_else(|| {
                SyncError::MalformedFrame("full_state frame has no payload".into())
            })?;
            Ok(Some(BackendEvent::FullState {
                id: parse_update_id(id_raw)?,
                markup: markup.to_string(),
            }))
        }
        other => {
            log::debug!("[ROUTER] ignoring frame for {}", other);
            Ok(None)
        }
    }
}

/// Normalize one OSC argument to a string.
///
/// The backend sends long markup payloads as blobs; everything else arrives
/// as strings or integers.
fn osc_arg_to_string(arg: &OscType) -> Result<String, SyncError> {
    match arg {
        OscType::String(s) => Ok(s.clone()),
        OscType::Blob(b) => Ok(String::from_utf8_lossy(b).into_owned()),
        OscType::Int(i) => Ok(i.to_string()),
        OscType::Long(i) => Ok(i.to_string()),
        OscType::Float(f) => Ok(f.to_string()),
        OscType::Double(d) => Ok(d.to_string()),
        other => Err(SyncError::MalformedFrame(format!(
            "unsupported osc argument {:?}",
            other
        ))),
    }
}

/// Decode one OSC message from the unreliable channel.
///
/// Returns `Ok(None)` for addresses we do not handle.
pub fn parse_osc_message(msg: &OscMessage) -> Result<Option<BackendEvent>, SyncError> {
    match msg.addr.as_str() {
        "/app_started" => Ok(Some(BackendEvent::AppStarted)),
        "/alive" => Ok(Some(BackendEvent::Alive)),
        "/state_update" => {
            let args: Vec<String> = msg
                .args
                .iter()
                .map(osc_arg_to_string)
                .collect::<Result<_, _>>()?;
            if args.len() < 2 {
                return Err(SyncError::MalformedFrame(format!(
                    "state_update message with {} args",
                    args.len()
                )));
            }
            let update = build_update(&args[0], &args[2..])?;
            Ok(Some(BackendEvent::StateUpdate {
                id: parse_update_id(&args[1])?,
                update,
            }))
        }
        "/full_state" => {
            let args: Vec<String> = msg
                .args
                .iter()
                .map(osc_arg_to_string)
                .collect::<Result<_, _>>()?;
            if args.len() < 2 {
                return Err(SyncError::MalformedFrame(format!(
                    "full_state message with {} args",
                    args.len()
                )));
            }
            Ok(Some(BackendEvent::FullState {
                id: parse_update_id(&args[0])?,
                markup: args[1].clone(),
            }))
        }
        other => {
            log::debug!("[ROUTER] ignoring message for {}", other);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_app_started_and_alive() {
        assert_eq!(
            parse_frame("/app_started:").unwrap(),
            Some(BackendEvent::AppStarted)
        );
        assert_eq!(parse_frame("/alive").unwrap(), Some(BackendEvent::Alive));
    }

    #[test]
    fn test_parse_frame_property_changed() {
        let ev = parse_frame("/state_update:propertyChanged;42;c1;clip;playing;1")
            .unwrap()
            .unwrap();
        assert_eq!(
            ev,
            BackendEvent::StateUpdate {
                id: 42,
                update: Update::PropertyChanged {
                    uuid: "c1".into(),
                    node_type: "clip".into(),
                    property: "playing".into(),
                    value: "1".into(),
                },
            }
        );
    }

    #[test]
    fn test_parse_frame_added_child_rejoins_markup() {
        // The markup itself contains `;` characters.
        let frame = r#"/state_update:addedChild;7;t1;track;1;<clip uuid="c9" name="A;B;C"/>"#;
        let ev = parse_frame(frame).unwrap().unwrap();
        assert_eq!(
            ev,
            BackendEvent::StateUpdate {
                id: 7,
                update: Update::AddedChild {
                    parent_uuid: "t1".into(),
                    parent_type: "track".into(),
                    index: 1,
                    markup: r#"<clip uuid="c9" name="A;B;C"/>"#.into(),
                },
            }
        );
    }

    #[test]
    fn test_parse_frame_removed_child() {
        let ev = parse_frame("/state_update:removedChild;9;c1;clip")
            .unwrap()
            .unwrap();
        assert_eq!(
            ev,
            BackendEvent::StateUpdate {
                id: 9,
                update: Update::RemovedChild {
                    uuid: "c1".into(),
                    node_type: "clip".into(),
                },
            }
        );
    }

    #[test]
    fn test_parse_frame_full_state_splits_at_first_semicolon() {
        let frame = r#"/full_state:3;<state uuid="s"><session uuid="x" name="A;B"/></state>"#;
        let ev = parse_frame(frame).unwrap().unwrap();
        assert_eq!(
            ev,
            BackendEvent::FullState {
                id: 3,
                markup: r#"<state uuid="s"><session uuid="x" name="A;B"/></state>"#.into(),
            }
        );
    }

    #[test]
    fn test_parse_frame_unknown_address_ignored() {
        assert_eq!(parse_frame("/other:1;2;3").unwrap(), None);
    }

    #[test]
    fn test_parse_frame_errors() {
        assert!(parse_frame("/state_update:propertyChanged").is_err());
        assert!(parse_frame("/state_update:propertyChanged;notanid;a;b;c;d").is_err());
        assert!(parse_frame("/state_update:shuffled;1;a;b").is_err());
        assert!(parse_frame("/full_state:nopayload").is_err());
    }

    #[test]
    fn test_parse_osc_state_update_with_blob() {
        let msg = OscMessage {
            addr: "/state_update".to_string(),
            args: vec![
                OscType::String("addedChild".into()),
                OscType::Int(5),
                OscType::String("t1".into()),
                OscType::String("track".into()),
                OscType::Int(-1),
                OscType::Blob(br#"<clip uuid="c3"/>"#.to_vec()),
            ],
        };
        let ev = parse_osc_message(&msg).unwrap().unwrap();
        assert_eq!(
            ev,
            BackendEvent::StateUpdate {
                id: 5,
                update: Update::AddedChild {
                    parent_uuid: "t1".into(),
                    parent_type: "track".into(),
                    index: -1,
                    markup: r#"<clip uuid="c3"/>"#.into(),
                },
            }
        );
    }

    #[test]
    fn test_parse_osc_full_state() {
        let msg = OscMessage {
            addr: "/full_state".to_string(),
            args: vec![
                OscType::Int(1),
                OscType::Blob(br#"<state uuid="s"/>"#.to_vec()),
            ],
        };
        let ev = parse_osc_message(&msg).unwrap().unwrap();
        assert_eq!(
            ev,
            BackendEvent::FullState {
                id: 1,
                markup: r#"<state uuid="s"/>"#.into(),
            }
        );
    }

    #[test]
    fn test_parse_osc_unknown_address_ignored() {
        let msg = OscMessage {
            addr: "/status".to_string(),
            args: vec![],
        };
        assert_eq!(parse_osc_message(&msg).unwrap(), None);
    }
}

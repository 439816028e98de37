use crate::timeline::{Snapshot, SnapshotEntry, StopRecord, Timeline};
use crate::{ChatRequestId, ChatSessionId, EntryState, TelemetryInfo, UndoStopId};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The opaque blob round-tripped through the state store, keyed by chat
/// session id. The schema is internal; a corrupt or partial blob degrades to
/// a clean start at load time.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionStateBlob {
    pub initial_file_contents: BTreeMap<PathBuf, String>,
    pub pending_snapshot: Option<PersistedSnapshot>,
    pub recent_snapshot: Option<PersistedSnapshot>,
    pub linear_history: Vec<PersistedStop>,
    pub linear_history_index: usize,
}

impl SessionStateBlob {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub entries: Vec<PersistedSnapshotEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedSnapshotEntry {
    pub path: PathBuf,
    pub original: String,
    pub current: String,
    pub state: EntryState,
    pub request_id: String,
    pub agent_id: Option<String>,
    pub language_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedStop {
    pub request_id: String,
    pub stop_id: Option<String>,
    pub snapshot: PersistedSnapshot,
}

impl PersistedSnapshot {
    pub(crate) fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            entries: snapshot
                .entries
                .values()
                .map(|entry| PersistedSnapshotEntry {
                    path: entry.path.to_path_buf(),
                    original: entry.original.to_string(),
                    current: entry.current.to_string(),
                    state: entry.state,
                    request_id: entry.telemetry.request_id.to_string(),
                    agent_id: entry.telemetry.agent_id.as_ref().map(|id| id.to_string()),
                    language_id: entry.language_id.to_string(),
                })
                .collect(),
        }
    }

    pub(crate) fn into_snapshot(self, session_id: &ChatSessionId) -> Snapshot {
        let mut snapshot = Snapshot::default();
        for entry in self.entries {
            snapshot.insert(SnapshotEntry {
                path: Arc::from(entry.path.as_path()),
                original: entry.original.into(),
                current: entry.current.into(),
                state: entry.state,
                telemetry: TelemetryInfo {
                    request_id: ChatRequestId::new(entry.request_id),
                    session_id: session_id.clone(),
                    agent_id: entry.agent_id.map(Arc::from),
                },
                language_id: entry.language_id.into(),
            });
        }
        snapshot
    }
}

pub(crate) fn timeline_to_persisted(timeline: &Timeline) -> (Vec<PersistedStop>, usize) {
    let stops = timeline
        .records()
        .iter()
        .map(|record| PersistedStop {
            request_id: record.request_id.to_string(),
            stop_id: record.stop_id.as_ref().map(|id| id.to_string()),
            snapshot: PersistedSnapshot::from_snapshot(&record.snapshot),
        })
        .collect();
    (stops, timeline.index())
}

pub(crate) fn timeline_from_persisted(
    stops: Vec<PersistedStop>,
    index: usize,
    session_id: &ChatSessionId,
) -> Result<Timeline> {
    let records = stops
        .into_iter()
        .map(|stop| StopRecord {
            request_id: ChatRequestId::new(stop.request_id),
            stop_id: stop.stop_id.map(UndoStopId::new),
            snapshot: stop.snapshot.into_snapshot(session_id),
        })
        .collect();
    Timeline::from_records(records, index)
}

pub(crate) fn initial_contents_to_persisted(
    contents: &std::collections::HashMap<Arc<Path>, Arc<str>>,
) -> BTreeMap<PathBuf, String> {
    contents
        .iter()
        .map(|(path, content)| (path.to_path_buf(), content.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_json_roundtrip() {
        let blob = SessionStateBlob {
            initial_file_contents: BTreeMap::from([(PathBuf::from("a.rs"), "fn a() {}".into())]),
            pending_snapshot: None,
            recent_snapshot: Some(PersistedSnapshot {
                entries: vec![PersistedSnapshotEntry {
                    path: PathBuf::from("a.rs"),
                    original: "fn a() {}".into(),
                    current: "fn a() { body() }".into(),
                    state: EntryState::Modified,
                    request_id: "req-1".into(),
                    agent_id: Some("agent".into()),
                    language_id: "rust".into(),
                }],
            }),
            linear_history: vec![PersistedStop {
                request_id: "req-1".into(),
                stop_id: Some("stop-1".into()),
                snapshot: PersistedSnapshot { entries: vec![] },
            }],
            linear_history_index: 1,
        };

        let json = blob.to_json().unwrap();
        let restored = SessionStateBlob::from_json(&json).unwrap();
        assert_eq!(restored.linear_history_index, 1);
        assert_eq!(restored.linear_history.len(), 1);
        assert_eq!(
            restored.recent_snapshot.unwrap().entries[0].current,
            "fn a() { body() }"
        );
        assert_eq!(
            restored.initial_file_contents[&PathBuf::from("a.rs")],
            "fn a() {}"
        );
    }

    #[test]
    fn test_corrupt_blob_is_an_error_not_a_panic() {
        assert!(SessionStateBlob::from_json("{\"not\": \"valid\"").is_err());
        assert!(SessionStateBlob::from_json("[]").is_err());
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        let result = timeline_from_persisted(Vec::new(), 3, &ChatSessionId::new("s"));
        assert!(result.is_err());
    }
}

use crate::{ChatRequestId, EntryState, TelemetryInfo, UndoStopId};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Recorded content and review state of one file at a stop. Both sides of
/// the buffer pair are recorded: the original can advance mid-session (e.g.
/// a kept hunk), so it is not reconstructible from the initial content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub path: Arc<Path>,
    pub original: Arc<str>,
    pub current: Arc<str>,
    pub state: EntryState,
    pub telemetry: TelemetryInfo,
    pub language_id: Arc<str>,
}

/// The recorded state of every file under edit at one stop.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub entries: BTreeMap<Arc<Path>, SnapshotEntry>,
}

impl Snapshot {
    pub fn insert(&mut self, entry: SnapshotEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }
}

#[derive(Clone, Debug)]
pub(crate) struct StopRecord {
    pub request_id: ChatRequestId,
    pub stop_id: Option<UndoStopId>,
    pub snapshot: Snapshot,
}

/// Where a committed restore lands.
#[derive(Clone, Debug)]
pub enum RestoreTarget {
    /// A recorded stop's snapshot.
    Stop(Snapshot),
    /// The position past the last stop. The session owns that state (its
    /// pending or recent snapshot); the timeline only names it.
    LiveTail,
}

/// A restore that has been computed but not committed. Applying the target
/// may fail; the index only moves in [`Timeline::commit`], so a failed
/// restore never leaves the timeline pointing somewhere the buffers aren't.
#[derive(Clone, Debug)]
pub struct PendingRestore {
    pub new_index: usize,
    pub target: RestoreTarget,
}

/// A request grayed out by the current timeline position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestDisablement {
    /// Every stop of the request is undone.
    Request(ChatRequestId),
    /// Stops from this one onward are undone.
    FromStop {
        request_id: ChatRequestId,
        stop_id: Option<UndoStopId>,
    },
}

/// Append-only ordered history of per-request stops. The index is the
/// number of stops currently applied: each stop's snapshot records the state
/// *before* that stop's edits, and position `len` is the live tail.
#[derive(Default)]
pub struct Timeline {
    stops: Vec<StopRecord>,
    index: usize,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn stop_count(&self) -> usize {
        self.stops.len()
    }

    pub fn at_live_tail(&self) -> bool {
        self.index == self.stops.len()
    }

    pub fn can_undo(&self) -> bool {
        self.index > 0
    }

    pub fn can_redo(&self) -> bool {
        self.index < self.stops.len()
    }

    /// Appends a stop. Pushing from an undone position drops the undone
    /// tail, linearizing history.
    pub fn push_snapshot(
        &mut self,
        request_id: ChatRequestId,
        stop_id: Option<UndoStopId>,
        snapshot: Snapshot,
    ) {
        self.stops.truncate(self.index);
        self.stops.push(StopRecord {
            request_id,
            stop_id,
            snapshot,
        });
        self.index = self.stops.len();
    }

    pub fn get_undo_snapshot(&self) -> Option<PendingRestore> {
        if self.index == 0 {
            return None;
        }
        Some(PendingRestore {
            new_index: self.index - 1,
            target: RestoreTarget::Stop(self.stops[self.index - 1].snapshot.clone()),
        })
    }

    pub fn get_redo_snapshot(&self) -> Option<PendingRestore> {
        if self.index >= self.stops.len() {
            return None;
        }
        let new_index = self.index + 1;
        let target = if new_index < self.stops.len() {
            RestoreTarget::Stop(self.stops[new_index].snapshot.clone())
        } else {
            RestoreTarget::LiveTail
        };
        Some(PendingRestore { new_index, target })
    }

    /// Locates an arbitrary stop for a jump-to-checkpoint restore.
    pub fn get_snapshot_for_restore(
        &self,
        request_id: &ChatRequestId,
        stop_id: Option<&UndoStopId>,
    ) -> Option<PendingRestore> {
        let position = self.position_of(request_id, stop_id)?;
        Some(PendingRestore {
            new_index: position,
            target: RestoreTarget::Stop(self.stops[position].snapshot.clone()),
        })
    }

    /// Commits a restore that has been successfully applied.
    pub fn commit(&mut self, restore: PendingRestore) {
        debug_assert!(restore.new_index <= self.stops.len());
        self.index = restore.new_index.min(self.stops.len());
    }

    /// Reconciles a recorded stop with an entry's live state when a stream
    /// resumes mid-history (e.g. a retried request). With `is_next` the
    /// following stop is patched instead, the one recording the state this
    /// entry produced. Returns whether anything was rewritten.
    pub fn ensure_edit_in_undo_stop_matches(
        &mut self,
        request_id: &ChatRequestId,
        stop_id: Option<&UndoStopId>,
        entry: &SnapshotEntry,
        is_next: bool,
    ) -> bool {
        let Some(mut position) = self.position_of(request_id, stop_id) else {
            return false;
        };
        if is_next {
            position += 1;
            if position >= self.stops.len() {
                return false;
            }
        }
        let snapshot = &mut self.stops[position].snapshot;
        match snapshot.entries.get(&entry.path) {
            Some(recorded) if recorded == entry => false,
            _ => {
                snapshot.insert(entry.clone());
                true
            }
        }
    }

    /// The requests (or request suffixes) that are undone relative to the
    /// current index, for graying out in the transcript.
    pub fn request_disablement(&self) -> Vec<RequestDisablement> {
        let mut disablement = Vec::new();
        let mut seen_requests: Vec<&ChatRequestId> = Vec::new();
        for (position, stop) in self.stops.iter().enumerate() {
            if seen_requests.contains(&&stop.request_id) {
                continue;
            }
            seen_requests.push(&stop.request_id);
            let request_positions = self
                .stops
                .iter()
                .enumerate()
                .filter(|(_, s)| s.request_id == stop.request_id)
                .map(|(p, _)| p)
                .collect::<Vec<_>>();
            debug_assert_eq!(request_positions.first(), Some(&position));
            if position >= self.index {
                disablement.push(RequestDisablement::Request(stop.request_id.clone()));
            } else if let Some(first_undone) =
                request_positions.iter().find(|p| **p >= self.index)
            {
                disablement.push(RequestDisablement::FromStop {
                    request_id: stop.request_id.clone(),
                    stop_id: self.stops[*first_undone].stop_id.clone(),
                });
            }
        }
        disablement
    }

    fn position_of(
        &self,
        request_id: &ChatRequestId,
        stop_id: Option<&UndoStopId>,
    ) -> Option<usize> {
        self.stops.iter().position(|stop| {
            stop.request_id == *request_id && stop.stop_id.as_ref() == stop_id
        })
    }

    /// The snapshot pair for rendering what a stop changed: the state at
    /// `(request_id, stop_id)` and the state at the following stop, if any.
    pub fn snapshots_for_stop_span(
        &self,
        request_id: &ChatRequestId,
        stop_id: Option<&UndoStopId>,
    ) -> Option<(Snapshot, Option<Snapshot>)> {
        let position = self.position_of(request_id, stop_id)?;
        let next = self.stops.get(position + 1).map(|s| s.snapshot.clone());
        Some((self.stops[position].snapshot.clone(), next))
    }

    pub(crate) fn records(&self) -> &[StopRecord] {
        &self.stops
    }

    pub(crate) fn from_records(stops: Vec<StopRecord>, index: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(
            index <= stops.len(),
            "timeline index {} out of range for {} stops",
            index,
            stops.len()
        );
        Ok(Self { stops, index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChatSessionId;

    fn snapshot_entry(path: &str, current: &str) -> SnapshotEntry {
        SnapshotEntry {
            path: Arc::from(Path::new(path)),
            original: "original".into(),
            current: current.into(),
            state: EntryState::Modified,
            telemetry: TelemetryInfo {
                request_id: ChatRequestId::new("req"),
                session_id: ChatSessionId::new("session"),
                agent_id: None,
            },
            language_id: "rust".into(),
        }
    }

    fn snapshot(current: &str) -> Snapshot {
        let mut snapshot = Snapshot::default();
        snapshot.insert(snapshot_entry("a.rs", current));
        snapshot
    }

    fn target_content(restore: &PendingRestore) -> Option<String> {
        match &restore.target {
            RestoreTarget::Stop(snapshot) => Some(
                snapshot.entries[Path::new("a.rs")]
                    .current
                    .to_string(),
            ),
            RestoreTarget::LiveTail => None,
        }
    }

    #[test]
    fn test_undo_redo_walks_stops() {
        let mut timeline = Timeline::new();
        timeline.push_snapshot(ChatRequestId::new("r1"), None, snapshot("v0"));
        timeline.push_snapshot(ChatRequestId::new("r2"), None, snapshot("v1"));
        assert!(timeline.at_live_tail());

        let undo = timeline.get_undo_snapshot().unwrap();
        assert_eq!(target_content(&undo), Some("v1".into()));
        timeline.commit(undo);
        assert_eq!(timeline.index(), 1);

        let undo = timeline.get_undo_snapshot().unwrap();
        assert_eq!(target_content(&undo), Some("v0".into()));
        timeline.commit(undo);
        assert!(timeline.get_undo_snapshot().is_none());

        let redo = timeline.get_redo_snapshot().unwrap();
        assert_eq!(target_content(&redo), Some("v1".into()));
        timeline.commit(redo);

        let redo = timeline.get_redo_snapshot().unwrap();
        assert!(matches!(redo.target, RestoreTarget::LiveTail));
        timeline.commit(redo);
        assert!(timeline.at_live_tail());
        assert!(timeline.get_redo_snapshot().is_none());
    }

    #[test]
    fn test_uncommitted_restore_leaves_index_alone() {
        let mut timeline = Timeline::new();
        timeline.push_snapshot(ChatRequestId::new("r1"), None, snapshot("v0"));
        let _restore = timeline.get_undo_snapshot().unwrap();
        assert_eq!(timeline.index(), 1);
    }

    #[test]
    fn test_push_after_undo_truncates_tail() {
        let mut timeline = Timeline::new();
        timeline.push_snapshot(ChatRequestId::new("r1"), None, snapshot("v0"));
        timeline.push_snapshot(ChatRequestId::new("r2"), None, snapshot("v1"));
        let undo = timeline.get_undo_snapshot().unwrap();
        timeline.commit(undo);

        timeline.push_snapshot(ChatRequestId::new("r3"), None, snapshot("v1b"));
        assert_eq!(timeline.stop_count(), 2);
        assert!(timeline.at_live_tail());
        assert!(timeline
            .get_snapshot_for_restore(&ChatRequestId::new("r2"), None)
            .is_none());
    }

    #[test]
    fn test_restore_by_id() {
        let mut timeline = Timeline::new();
        timeline.push_snapshot(
            ChatRequestId::new("r1"),
            Some(UndoStopId::new("s1")),
            snapshot("v0"),
        );
        timeline.push_snapshot(
            ChatRequestId::new("r1"),
            Some(UndoStopId::new("s2")),
            snapshot("v1"),
        );

        let restore = timeline
            .get_snapshot_for_restore(&ChatRequestId::new("r1"), Some(&UndoStopId::new("s1")))
            .unwrap();
        assert_eq!(target_content(&restore), Some("v0".into()));
        timeline.commit(restore);
        assert_eq!(timeline.index(), 0);
    }

    #[test]
    fn test_request_disablement() {
        let mut timeline = Timeline::new();
        timeline.push_snapshot(
            ChatRequestId::new("r1"),
            Some(UndoStopId::new("s1")),
            snapshot("v0"),
        );
        timeline.push_snapshot(
            ChatRequestId::new("r1"),
            Some(UndoStopId::new("s2")),
            snapshot("v1"),
        );
        timeline.push_snapshot(ChatRequestId::new("r2"), None, snapshot("v2"));

        assert_eq!(timeline.request_disablement(), vec![]);

        let undo = timeline.get_undo_snapshot().unwrap();
        timeline.commit(undo);
        assert_eq!(
            timeline.request_disablement(),
            vec![RequestDisablement::Request(ChatRequestId::new("r2"))]
        );

        let undo = timeline.get_undo_snapshot().unwrap();
        timeline.commit(undo);
        assert_eq!(
            timeline.request_disablement(),
            vec![
                RequestDisablement::FromStop {
                    request_id: ChatRequestId::new("r1"),
                    stop_id: Some(UndoStopId::new("s2")),
                },
                RequestDisablement::Request(ChatRequestId::new("r2")),
            ]
        );
    }

    #[test]
    fn test_ensure_edit_in_undo_stop_matches() {
        let mut timeline = Timeline::new();
        timeline.push_snapshot(
            ChatRequestId::new("r1"),
            Some(UndoStopId::new("s1")),
            snapshot("v0"),
        );
        timeline.push_snapshot(
            ChatRequestId::new("r1"),
            Some(UndoStopId::new("s2")),
            snapshot("v1"),
        );

        let live = snapshot_entry("a.rs", "diverged");
        let changed = timeline.ensure_edit_in_undo_stop_matches(
            &ChatRequestId::new("r1"),
            Some(&UndoStopId::new("s1")),
            &live,
            true,
        );
        assert!(changed);
        let (snapshot, _) = timeline
            .snapshots_for_stop_span(&ChatRequestId::new("r1"), Some(&UndoStopId::new("s2")))
            .unwrap();
        assert_eq!(&*snapshot.entries[Path::new("a.rs")].current, "diverged");

        // Already consistent: nothing to rewrite.
        let changed = timeline.ensure_edit_in_undo_stop_matches(
            &ChatRequestId::new("r1"),
            Some(&UndoStopId::new("s1")),
            &live,
            true,
        );
        assert!(!changed);
    }
}

use crate::diff::{DiffSnapshot, DIFF_BUDGET};
use crate::entry::{EntryHandle, ModifiedFileEntry};
use crate::host::{ConfirmRequest, DialogPrompt, Fs, RelatedFilesProvider, StateStore, UndoRedoLog};
use crate::persistence::{self, PersistedSnapshot, SessionStateBlob};
use crate::sequencer::{SequencerByKey, ThrottledSequencer};
use crate::timeline::{RequestDisablement, RestoreTarget, Snapshot, Timeline};
use crate::{
    ChatRequestId, ChatSessionId, EntryId, EntryState, SessionConfig, SessionState, TelemetryInfo,
    UndoStopId,
};
use anyhow::{Context as _, Result};
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::future::{BoxFuture, FutureExt as _, Shared};
use parking_lot::{Mutex, RwLock};
use postage::watch;
use smol::lock::{Mutex as AsyncMutex, MutexGuardArc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use text_edit::Patch;
use util::{post_inc, ResultExt as _};

/// Minimum spacing between two applied edit batches for one resource, so
/// streamed edits don't flicker faster than a reader can follow.
const STREAM_MIN_GAP: Duration = Duration::from_millis(15);
/// Cap on the total pacing latency added across a backlog of batches.
const STREAM_MAX_DELAY: Duration = Duration::from_millis(1000);

/// The capability set a session needs from its host, injected at
/// construction.
#[derive(Clone)]
pub struct SessionCollaborators {
    pub fs: Arc<dyn Fs>,
    pub dialog: Arc<dyn DialogPrompt>,
    pub store: Arc<dyn StateStore>,
    pub undo_log: Arc<dyn UndoRedoLog>,
    pub related_files: Option<Arc<dyn RelatedFilesProvider>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    EntryAdded(Arc<Path>),
    EntryRemoved(Arc<Path>),
    /// Fired when an accept lands; the UI layer maps these to the
    /// accessibility/audio signal.
    EditsAccepted(Vec<Arc<Path>>),
    EditsRejected(Vec<Arc<Path>>),
}

/// Summary of what changed for one file between two adjacent stops.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryDiff {
    pub identical: bool,
    pub added_lines: usize,
    pub removed_lines: usize,
    pub quit_early: bool,
}

struct EntryHolder {
    entry: Arc<ModifiedFileEntry>,
    _handle: EntryHandle,
}

struct SessionInner {
    state: SessionState,
    entries: Vec<EntryHolder>,
    lent_entries: HashMap<Arc<Path>, Weak<ModifiedFileEntry>>,
    initial_file_contents: HashMap<Arc<Path>, Arc<str>>,
    timeline: Timeline,
    pending_snapshot: Option<Snapshot>,
    recent_snapshot: Option<Snapshot>,
    active_streams: usize,
    next_entry_id: usize,
    stop_task: Option<Shared<BoxFuture<'static, ()>>>,
}

/// Orchestrates the working set for one chat conversation: streaming-edit
/// intake, snapshotting, undo/redo, accept/reject, persistence.
pub struct EditingSession {
    session_id: ChatSessionId,
    config: Arc<RwLock<SessionConfig>>,
    collab: SessionCollaborators,
    inner: Mutex<SessionInner>,
    state_tx: Mutex<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
    streaming_edit_locks: SequencerByKey<Arc<Path>>,
    events: Mutex<Vec<UnboundedSender<SessionEvent>>>,
}

impl EditingSession {
    pub fn new(
        session_id: ChatSessionId,
        config: SessionConfig,
        collab: SessionCollaborators,
    ) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel_with(SessionState::Initial);
        Arc::new(Self {
            session_id,
            config: Arc::new(RwLock::new(config)),
            collab,
            inner: Mutex::new(SessionInner {
                state: SessionState::Initial,
                entries: Vec::new(),
                lent_entries: HashMap::new(),
                initial_file_contents: HashMap::new(),
                timeline: Timeline::new(),
                pending_snapshot: None,
                recent_snapshot: None,
                active_streams: 0,
                next_entry_id: 0,
                stop_task: None,
            }),
            state_tx: Mutex::new(state_tx),
            state_rx,
            streaming_edit_locks: SequencerByKey::new(),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn session_id(&self) -> &ChatSessionId {
        &self.session_id
    }

    pub fn config(&self) -> &Arc<RwLock<SessionConfig>> {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn observe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn subscribe(&self) -> UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.events.lock().push(tx);
        rx
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().state == SessionState::Disposed
    }

    pub fn entries(&self) -> Vec<Arc<ModifiedFileEntry>> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|holder| holder.entry.clone())
            .collect()
    }

    pub fn entry_for_path(&self, path: &Path) -> Option<Arc<ModifiedFileEntry>> {
        self.inner
            .lock()
            .entries
            .iter()
            .find(|holder| holder.entry.path().as_ref() == path)
            .map(|holder| holder.entry.clone())
    }

    pub fn request_disablement(&self) -> Vec<RequestDisablement> {
        self.inner.lock().timeline.request_disablement()
    }

    fn check_not_disposed(&self) -> Result<()> {
        anyhow::ensure!(!self.is_disposed(), "session {} is disposed", self.session_id);
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        self.events
            .lock()
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    fn set_state_locked(&self, inner: &mut SessionInner, state: SessionState) -> bool {
        if inner.state == state {
            return false;
        }
        inner.state = state;
        *self.state_tx.lock().borrow_mut() = state;
        true
    }

    /// Restores persisted state if any, degrading to a clean start on any
    /// corruption, then settles at Idle.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        self.check_not_disposed()?;
        match self.collab.store.read(&self.session_id.0).await {
            Ok(Some(json)) => match SessionStateBlob::from_json(&json) {
                Ok(blob) => {
                    if let Err(error) = self.restore_blob(blob).await {
                        log::warn!(
                            "discarding inconsistent state for session {}: {:?}",
                            self.session_id,
                            error
                        );
                        self.reset_to_clean();
                    }
                }
                Err(error) => {
                    log::warn!(
                        "discarding corrupt state for session {}: {:?}",
                        self.session_id,
                        error
                    );
                }
            },
            Ok(None) => {}
            Err(error) => {
                log::warn!(
                    "failed to read state for session {}: {:?}",
                    self.session_id,
                    error
                );
            }
        }
        let changed = {
            let mut inner = self.inner.lock();
            self.set_state_locked(&mut inner, SessionState::Idle)
        };
        if changed {
            self.emit(SessionEvent::StateChanged(SessionState::Idle));
        }
        Ok(())
    }

    async fn restore_blob(self: &Arc<Self>, blob: SessionStateBlob) -> Result<()> {
        let timeline = persistence::timeline_from_persisted(
            blob.linear_history,
            blob.linear_history_index,
            &self.session_id,
        )?;
        let recent_snapshot = blob
            .recent_snapshot
            .map(|snapshot| snapshot.into_snapshot(&self.session_id));
        {
            let mut inner = self.inner.lock();
            inner.initial_file_contents = blob
                .initial_file_contents
                .into_iter()
                .map(|(path, content)| (Arc::from(path.as_path()), Arc::from(content.as_str())))
                .collect();
            inner.pending_snapshot = blob
                .pending_snapshot
                .map(|snapshot| snapshot.into_snapshot(&self.session_id));
            inner.recent_snapshot = recent_snapshot.clone();
            inner.timeline = timeline;
        }
        if let Some(snapshot) = recent_snapshot {
            self.restore_snapshot_contents(&snapshot)?;
        }
        Ok(())
    }

    fn reset_to_clean(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.initial_file_contents.clear();
        inner.pending_snapshot = None;
        inner.recent_snapshot = None;
        inner.timeline = Timeline::new();
    }

    /// Opens a streaming-edit handle for one resource. Edits pushed through
    /// the handle apply in order with pacing; across handles, at most one
    /// stream per resource applies at a time; a second stream queues behind
    /// the first's `complete`.
    pub fn start_streaming_edits(
        self: &Arc<Self>,
        path: Arc<Path>,
        request_id: ChatRequestId,
        undo_stop: Option<UndoStopId>,
    ) -> Result<Arc<StreamingEditsHandle>> {
        self.check_not_disposed()?;
        let changed = {
            let mut inner = self.inner.lock();
            inner.active_streams += 1;
            self.set_state_locked(&mut inner, SessionState::StreamingEdits)
        };
        if changed {
            self.emit(SessionEvent::StateChanged(SessionState::StreamingEdits));
        }
        Ok(Arc::new(StreamingEditsHandle {
            session: self.clone(),
            path,
            request_id,
            undo_stop,
            throttle: ThrottledSequencer::new(STREAM_MIN_GAP, STREAM_MAX_DELAY),
            state: AsyncMutex::new(HandleState {
                started: false,
                completed: false,
                resolved: false,
                guard: None,
                entry: None,
            }),
        }))
    }

    fn resolve_stream(&self) {
        let changed = {
            let mut inner = self.inner.lock();
            inner.active_streams = inner.active_streams.saturating_sub(1);
            if inner.active_streams == 0 && inner.state == SessionState::StreamingEdits {
                let snapshot = self.capture_snapshot_locked(&inner);
                inner.recent_snapshot = Some(snapshot);
                self.set_state_locked(&mut inner, SessionState::Idle)
            } else {
                false
            }
        };
        if changed {
            self.emit(SessionEvent::StateChanged(SessionState::Idle));
        }
    }

    /// Finds the entry for a resource, in order: one this session already
    /// tracks, an entry lent by an external owner, or a fresh one. A file
    /// that doesn't exist yet is created once and the open retried; a second
    /// failure is fatal.
    async fn get_or_create_entry(
        self: &Arc<Self>,
        path: &Arc<Path>,
        request: &ChatRequestId,
    ) -> Result<Arc<ModifiedFileEntry>> {
        let mut must_exist = false;
        loop {
            enum Found {
                Existing(Arc<ModifiedFileEntry>),
                Adopted(Arc<ModifiedFileEntry>),
            }
            let found = {
                let mut inner = self.inner.lock();
                if let Some(holder) = inner
                    .entries
                    .iter()
                    .find(|holder| holder.entry.path() == path)
                {
                    Some(Found::Existing(holder.entry.clone()))
                } else if let Some(lent) = inner
                    .lent_entries
                    .get(path)
                    .and_then(Weak::upgrade)
                {
                    let handle = lent.acquire();
                    inner.entries.push(EntryHolder {
                        entry: lent.clone(),
                        _handle: handle,
                    });
                    Some(Found::Adopted(lent))
                } else {
                    None
                }
            };
            match found {
                Some(Found::Existing(entry)) => return Ok(entry),
                Some(Found::Adopted(entry)) => {
                    self.emit(SessionEvent::EntryAdded(path.clone()));
                    return Ok(entry);
                }
                None => {}
            }

            match self.collab.fs.load(path).await {
                Ok(content) => {
                    let entry = self.insert_new_entry(path, &content, request);
                    self.emit(SessionEvent::EntryAdded(path.clone()));
                    return Ok(entry);
                }
                Err(error) => {
                    if must_exist {
                        return Err(error)
                            .with_context(|| format!("opening {} for chat edits", path.display()));
                    }
                    self.collab
                        .fs
                        .create(path, "")
                        .await
                        .with_context(|| format!("creating {} for chat edits", path.display()))?;
                    must_exist = true;
                }
            }
        }
    }

    fn insert_new_entry(
        self: &Arc<Self>,
        path: &Arc<Path>,
        content: &str,
        request: &ChatRequestId,
    ) -> Arc<ModifiedFileEntry> {
        let mut inner = self.inner.lock();
        // A concurrent creation may have won while we were reading the file.
        if let Some(holder) = inner
            .entries
            .iter()
            .find(|holder| holder.entry.path() == path)
        {
            return holder.entry.clone();
        }
        let id = EntryId(post_inc(&mut inner.next_entry_id));
        let entry = ModifiedFileEntry::new(
            id,
            path.clone(),
            content,
            language_id_for(path),
            TelemetryInfo {
                request_id: request.clone(),
                session_id: self.session_id.clone(),
                agent_id: None,
            },
            self.config.clone(),
            self.collab.fs.clone(),
            self.collab.undo_log.clone(),
        );
        let handle = entry.acquire();
        inner.entries.push(EntryHolder {
            entry: entry.clone(),
            _handle: handle,
        });
        inner
            .initial_file_contents
            .entry(path.clone())
            .or_insert_with(|| content.into());
        entry
    }

    /// Lends an externally owned entry (e.g. an inline-edit session's) so a
    /// stream touching the same file reuses it instead of duplicating.
    pub fn lend_entry(&self, entry: &Arc<ModifiedFileEntry>) {
        self.inner
            .lock()
            .lent_entries
            .insert(entry.path().clone(), Arc::downgrade(entry));
    }

    fn resolve_targets(&self, paths: &[Arc<Path>]) -> Vec<Arc<ModifiedFileEntry>> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .map(|holder| holder.entry.clone())
            .filter(|entry| paths.is_empty() || paths.iter().any(|p| p == entry.path()))
            .collect()
    }

    /// Accepts the named entries' edits; an empty list means all of them.
    pub async fn accept(self: &Arc<Self>, paths: &[Arc<Path>]) -> Result<()> {
        self.check_not_disposed()?;
        let targets = self.resolve_targets(paths);
        for entry in &targets {
            entry.accept().await.log_err();
        }
        self.prune_missing_files(&targets).await;
        self.emit(SessionEvent::EditsAccepted(
            targets.iter().map(|entry| entry.path().clone()).collect(),
        ));
        Ok(())
    }

    /// Rejects the named entries' edits; an empty list means all of them.
    pub async fn reject(self: &Arc<Self>, paths: &[Arc<Path>]) -> Result<()> {
        self.check_not_disposed()?;
        let targets = self.resolve_targets(paths);
        for entry in &targets {
            entry.reject().await.log_err();
        }
        self.prune_missing_files(&targets).await;
        self.emit(SessionEvent::EditsRejected(
            targets.iter().map(|entry| entry.path().clone()).collect(),
        ));
        Ok(())
    }

    async fn prune_missing_files(&self, targets: &[Arc<ModifiedFileEntry>]) {
        for entry in targets {
            if !self.collab.fs.is_file(entry.path()).await {
                self.remove_entry(entry.path());
            }
        }
    }

    /// Drops an entry from the working set, disposing it once the last
    /// external handle lets go.
    pub fn remove_entry(&self, path: &Path) {
        let removed = {
            let mut inner = self.inner.lock();
            let before = inner.entries.len();
            inner
                .entries
                .retain(|holder| holder.entry.path().as_ref() != path);
            inner.entries.len() != before
        };
        if removed {
            self.emit(SessionEvent::EntryRemoved(Arc::from(path)));
        }
    }

    /// Discards all pending edits, asking first when there is anything
    /// non-trivial to lose. Returns whether the discard happened.
    pub async fn discard_all_edits_with_confirmation(self: &Arc<Self>) -> Result<bool> {
        self.check_not_disposed()?;
        let pending = self
            .entries()
            .into_iter()
            .filter(|entry| {
                entry.state() == EntryState::Modified
                    && entry.modified_text() != entry.original_text()
            })
            .count();
        if pending == 0 {
            self.reject(&[]).await?;
            return Ok(true);
        }
        if !self.config.read().bypass_discard_confirmation {
            let response = self
                .collab
                .dialog
                .confirm(ConfirmRequest {
                    title: "Discard all edits?".into(),
                    message: format!("Pending edits in {pending} file(s) will be lost."),
                    offer_dont_ask_again: true,
                })
                .await;
            if response.confirmed && response.dont_ask_again {
                self.config.write().bypass_discard_confirmation = true;
            }
            if !response.confirmed {
                return Ok(false);
            }
        }
        self.reject(&[]).await?;
        Ok(true)
    }

    fn capture_snapshot_locked(&self, inner: &SessionInner) -> Snapshot {
        let mut snapshot = Snapshot::default();
        for holder in &inner.entries {
            snapshot.insert(holder.entry.snapshot_entry());
        }
        snapshot
    }

    /// Records the current state of the working set as the stop
    /// `(request_id, stop_id)`, the unit of undo granularity.
    pub fn create_snapshot(
        &self,
        request_id: ChatRequestId,
        stop_id: Option<UndoStopId>,
    ) -> Result<()> {
        self.check_not_disposed()?;
        let mut inner = self.inner.lock();
        let snapshot = self.capture_snapshot_locked(&inner);
        inner.timeline.push_snapshot(request_id, stop_id, snapshot);
        Ok(())
    }

    /// Steps one stop backward, replaying that snapshot onto live entries.
    pub async fn undo_interaction(self: &Arc<Self>) -> Result<bool> {
        self.check_not_disposed()?;
        let restore = {
            let mut inner = self.inner.lock();
            let restore = inner.timeline.get_undo_snapshot();
            if restore.is_some() && inner.timeline.at_live_tail() {
                // Leaving the live tail: remember it so redo can return.
                let snapshot = self.capture_snapshot_locked(&inner);
                inner.recent_snapshot = Some(snapshot);
            }
            restore
        };
        let Some(restore) = restore else {
            return Ok(false);
        };
        let RestoreTarget::Stop(snapshot) = restore.target.clone() else {
            unreachable!("undo always lands on a recorded stop");
        };
        self.restore_snapshot_contents(&snapshot)?;
        self.inner.lock().timeline.commit(restore);
        Ok(true)
    }

    /// Steps one stop forward; past the last stop, returns to where editing
    /// last left off.
    pub async fn redo_interaction(self: &Arc<Self>) -> Result<bool> {
        self.check_not_disposed()?;
        let restore = self.inner.lock().timeline.get_redo_snapshot();
        let Some(restore) = restore else {
            return Ok(false);
        };
        let snapshot = match &restore.target {
            RestoreTarget::Stop(snapshot) => snapshot.clone(),
            RestoreTarget::LiveTail => {
                let mut inner = self.inner.lock();
                let Some(snapshot) = inner
                    .pending_snapshot
                    .take()
                    .or_else(|| inner.recent_snapshot.clone())
                else {
                    return Ok(false);
                };
                snapshot
            }
        };
        self.restore_snapshot_contents(&snapshot)?;
        self.inner.lock().timeline.commit(restore);
        Ok(true)
    }

    /// Explicit jump to an arbitrary checkpoint. The current state is parked
    /// as the pending snapshot so one plain redo returns to it.
    pub async fn restore_snapshot(
        self: &Arc<Self>,
        request_id: &ChatRequestId,
        stop_id: Option<&UndoStopId>,
    ) -> Result<()> {
        self.check_not_disposed()?;
        let restore = {
            let mut inner = self.inner.lock();
            let parked = self.capture_snapshot_locked(&inner);
            inner.pending_snapshot = Some(parked);
            inner.timeline.get_snapshot_for_restore(request_id, stop_id)
        };
        let restore = restore.with_context(|| {
            format!("no snapshot recorded for request {request_id}")
        })?;
        let RestoreTarget::Stop(snapshot) = restore.target.clone() else {
            unreachable!("restore by id always lands on a recorded stop");
        };
        self.restore_snapshot_contents(&snapshot)?;
        self.inner.lock().timeline.commit(restore);
        Ok(())
    }

    /// Replays a snapshot onto the live working set: entries absent from it
    /// reset to their pre-edit content and drop; entries present are reused
    /// or recreated with the recorded contents.
    fn restore_snapshot_contents(self: &Arc<Self>, snapshot: &Snapshot) -> Result<()> {
        let mut removed_paths = Vec::new();
        let mut added_paths = Vec::new();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let mut kept = Vec::new();
            for holder in inner.entries.drain(..) {
                let path = holder.entry.path().clone();
                if snapshot.entries.contains_key(&path) {
                    kept.push(holder);
                } else {
                    if let Some(initial) = inner.initial_file_contents.get(&path) {
                        holder.entry.force_content(initial);
                    }
                    removed_paths.push(path);
                    // Dropping the holder releases this session's share.
                }
            }
            inner.entries = kept;

            for (path, snapshot_entry) in &snapshot.entries {
                let existing = inner
                    .entries
                    .iter()
                    .find(|holder| holder.entry.path() == path)
                    .map(|holder| holder.entry.clone());
                let entry = match existing {
                    Some(entry) => entry,
                    None => {
                        let id = EntryId(post_inc(&mut inner.next_entry_id));
                        let entry = ModifiedFileEntry::new(
                            id,
                            path.clone(),
                            &snapshot_entry.original,
                            snapshot_entry.language_id.clone(),
                            snapshot_entry.telemetry.clone(),
                            self.config.clone(),
                            self.collab.fs.clone(),
                            self.collab.undo_log.clone(),
                        );
                        let handle = entry.acquire();
                        inner.entries.push(EntryHolder {
                            entry: entry.clone(),
                            _handle: handle,
                        });
                        inner
                            .initial_file_contents
                            .entry(path.clone())
                            .or_insert_with(|| snapshot_entry.original.clone());
                        added_paths.push(path.clone());
                        entry
                    }
                };
                entry.restore_from_snapshot(snapshot_entry);
            }
        }
        for path in removed_paths {
            self.emit(SessionEvent::EntryRemoved(path));
        }
        for path in added_paths {
            self.emit(SessionEvent::EntryAdded(path));
        }
        Ok(())
    }

    /// Diff summary for one file across a stop: from the state recorded at
    /// `(request_id, stop_id)` to the following stop, or to the live content
    /// when the stop is the last one.
    pub fn entry_diff_between_stops(
        &self,
        path: &Path,
        request_id: &ChatRequestId,
        stop_id: Option<&UndoStopId>,
    ) -> Option<EntryDiff> {
        let (before, after) = {
            let inner = self.inner.lock();
            let (start, next) = inner
                .timeline
                .snapshots_for_stop_span(request_id, stop_id)?;
            let before = start
                .entries
                .get(path)
                .map(|entry| entry.current.clone())
                .or_else(|| inner.initial_file_contents.get(path).cloned())
                .unwrap_or_else(|| "".into());
            let after = match next {
                Some(snapshot) => snapshot.entries.get(path)?.current.clone(),
                None => {
                    let holder = inner
                        .entries
                        .iter()
                        .find(|holder| holder.entry.path().as_ref() == path)?;
                    holder.entry.modified_text().into()
                }
            };
            (before, after)
        };
        let diff = DiffSnapshot::compute(&before, &after, DIFF_BUDGET);
        Some(EntryDiff {
            identical: diff.identical,
            added_lines: diff
                .hunks
                .iter()
                .map(|hunk| hunk.modified_row_range.len())
                .sum(),
            removed_lines: diff
                .hunks
                .iter()
                .map(|hunk| hunk.original_row_range.len())
                .sum(),
            quit_early: diff.quit_early,
        })
    }

    pub async fn related_files(&self, path: &Path) -> Vec<(PathBuf, String)> {
        match &self.collab.related_files {
            Some(provider) => provider.related_files(path).await,
            None => Vec::new(),
        }
    }

    /// Persists the session's state through the store collaborator.
    pub async fn store_state(&self) -> Result<()> {
        self.check_not_disposed()?;
        self.store_state_internal().await
    }

    async fn store_state_internal(&self) -> Result<()> {
        let blob = {
            let inner = self.inner.lock();
            let (linear_history, linear_history_index) =
                persistence::timeline_to_persisted(&inner.timeline);
            SessionStateBlob {
                initial_file_contents: persistence::initial_contents_to_persisted(
                    &inner.initial_file_contents,
                ),
                pending_snapshot: inner
                    .pending_snapshot
                    .as_ref()
                    .map(PersistedSnapshot::from_snapshot),
                recent_snapshot: Some(PersistedSnapshot::from_snapshot(
                    &self.capture_snapshot_locked(&inner),
                )),
                linear_history,
                linear_history_index,
            }
        };
        self.collab
            .store
            .write(&self.session_id.0, blob.to_json()?)
            .await
    }

    pub async fn clear_state(&self) -> Result<()> {
        self.collab.store.clear(&self.session_id.0).await
    }

    /// Tears the session down: disposes entries, drops queued stream work,
    /// and persists (or clears) storage. Idempotent: repeated calls share
    /// one in-flight future.
    pub fn stop(self: &Arc<Self>, clear_state: bool) -> Shared<BoxFuture<'static, ()>> {
        let mut inner = self.inner.lock();
        if let Some(task) = inner.stop_task.clone() {
            return task;
        }
        let this = self.clone();
        let task = async move {
            let changed = {
                let mut inner = this.inner.lock();
                this.set_state_locked(&mut inner, SessionState::Disposed)
            };
            if changed {
                this.emit(SessionEvent::StateChanged(SessionState::Disposed));
            }
            if clear_state {
                // Stale state left behind is recoverable on the next load.
                this.clear_state().await.warn_on_err();
            } else {
                this.store_state_internal().await.log_err();
            }
            let holders = std::mem::take(&mut this.inner.lock().entries);
            drop(holders);
        }
        .boxed()
        .shared();
        inner.stop_task = Some(task.clone());
        task
    }
}

struct HandleState {
    started: bool,
    completed: bool,
    resolved: bool,
    guard: Option<MutexGuardArc<()>>,
    entry: Option<Arc<ModifiedFileEntry>>,
}

/// Push-based handle consumed by the response-streaming layer. Edits apply
/// strictly in push order; `complete` is idempotent and finalizes the
/// stream with an empty last batch.
pub struct StreamingEditsHandle {
    session: Arc<EditingSession>,
    path: Arc<Path>,
    request_id: ChatRequestId,
    undo_stop: Option<UndoStopId>,
    throttle: ThrottledSequencer,
    state: AsyncMutex<HandleState>,
}

impl StreamingEditsHandle {
    pub fn path(&self) -> &Arc<Path> {
        &self.path
    }

    pub async fn push_text(&self, patch: Patch) -> Result<()> {
        self.push(patch, false).await
    }

    /// Notebook cell payloads route through the plain text path: the cell's
    /// text edits apply to this handle's resource.
    pub async fn push_notebook_cell_text(&self, _cell: Arc<Path>, patch: Patch) -> Result<()> {
        self.push(patch, false).await
    }

    /// Replaces the whole document, for notebook payloads that arrive as a
    /// serialized document rather than cell edits.
    pub async fn push_notebook(&self, content: String) -> Result<()> {
        let mut state = self.state.lock().await;
        anyhow::ensure!(!state.completed, "stream already completed");
        if self.session.is_disposed() {
            return Ok(());
        }
        self.ensure_started(&mut state).await?;
        self.throttle.enqueue();
        self.throttle.throttle().await;
        if self.session.is_disposed() {
            return Ok(());
        }
        let Some(entry) = state.entry.clone() else {
            return Ok(());
        };
        let current_len = entry.modified_text().len();
        entry.accept_agent_edits(
            &self.path,
            Patch::unit(text_edit::Replacement::new(0..current_len, content)),
            false,
            &self.request_id,
        )?;
        Ok(())
    }

    async fn push(&self, patch: Patch, is_last: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        if !is_last {
            anyhow::ensure!(!state.completed, "stream already completed");
        }
        if self.session.is_disposed() {
            // Disposal silently drops queued work.
            return Ok(());
        }
        self.ensure_started(&mut state).await?;
        self.throttle.enqueue();
        self.throttle.throttle().await;
        if self.session.is_disposed() {
            return Ok(());
        }
        let Some(entry) = state.entry.clone() else {
            return Ok(());
        };
        entry.accept_agent_edits(&self.path, patch, is_last, &self.request_id)?;
        Ok(())
    }

    async fn ensure_started(&self, state: &mut HandleState) -> Result<()> {
        if state.started {
            return Ok(());
        }
        // Serializes whole streams per resource: a second stream's first
        // push parks here until the first stream completes.
        let guard = self
            .session
            .streaming_edit_locks
            .acquire(self.path.clone())
            .await;
        if self.session.is_disposed() {
            state.started = true;
            return Ok(());
        }
        let entry = self
            .session
            .get_or_create_entry(&self.path, &self.request_id)
            .await?;
        entry.accept_streaming_edits_start(self.request_id.clone());
        {
            let mut inner = self.session.inner.lock();
            inner.timeline.ensure_edit_in_undo_stop_matches(
                &self.request_id,
                self.undo_stop.as_ref(),
                &entry.snapshot_entry(),
                false,
            );
        }
        state.guard = Some(guard);
        state.entry = Some(entry);
        state.started = true;
        Ok(())
    }

    /// Finalizes the stream. Safe to call more than once: edits are applied
    /// once and the session resolves once.
    pub async fn complete(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.completed {
            return Ok(());
        }
        state.completed = true;
        if !self.session.is_disposed() {
            if let Err(error) = self.ensure_started(&mut state).await {
                log::warn!(
                    "stream for {} failed to start: {:?}",
                    self.path.display(),
                    error
                );
            }
            if let Some(entry) = state.entry.clone() {
                entry
                    .accept_agent_edits(&self.path, Patch::default(), true, &self.request_id)
                    .log_err();
                entry.accept_streaming_edits_end().await;
            }
        }
        state.guard.take();
        if !state.resolved {
            state.resolved = true;
            drop(state);
            self.session.resolve_stream();
        }
        Ok(())
    }
}

impl Drop for StreamingEditsHandle {
    fn drop(&mut self) {
        // A handle dropped without `complete` must still release the
        // session's stream accounting.
        let state = self.state.get_mut();
        if !state.resolved {
            state.resolved = true;
            state.guard.take();
            self.session.resolve_stream();
        }
    }
}

fn language_id_for(path: &Path) -> Arc<str> {
    match path.extension().and_then(|extension| extension.to_str()) {
        Some(extension) => extension.into(),
        None => "plaintext".into(),
    }
}

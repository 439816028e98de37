use crate::change_tracker::{AgentEditOutcome, ChangeTracker, StreamingDecorations};
use crate::diff::{DiffSnapshot, DIFF_BUDGET};
use crate::host::{Fs, UndoRedoLog};
use crate::timeline::SnapshotEntry;
use crate::{ChatRequestId, EntryId, EntryState, SessionConfig, TelemetryInfo};
use anyhow::Result;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use parking_lot::{Mutex, RwLock};
use postage::watch;
use smol::Timer;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use text_edit::Patch;
use util::ResultExt as _;

const AUTO_ACCEPT_TICK: Duration = Duration::from_secs(1);
const JUST_APPLIED_FLASH: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryEvent {
    /// The user accepted or rejected the whole entry.
    UserActioned { accepted: bool },
    /// Hunk-level resolution left no unresolved hunks.
    AllHunksResolved,
    /// The live diff or its decorations changed.
    DiffUpdated,
    /// The backing file disappeared underneath a best-effort write. The
    /// session prunes the entry in response.
    FileDeleted,
}

/// Cancelable countdown toward auto-accepting a settled entry.
#[derive(Clone)]
pub struct AutoAcceptControl {
    cancelled: Arc<AtomicBool>,
    deadline: Instant,
}

impl AutoAcceptControl {
    fn new(delay: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Instant::now() + delay,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(SeqCst)
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Data the UI layer needs to render one pane's view of an entry. Built
/// lazily and cached per pane; holds no widget types.
pub struct EditorIntegration {
    pub pane: u64,
    entry: Weak<ModifiedFileEntry>,
}

impl EditorIntegration {
    pub fn decorations(&self) -> Option<StreamingDecorations> {
        let entry = self.entry.upgrade()?;
        let inner = entry.inner.lock();
        Some(inner.tracker.decorations().clone())
    }

    pub fn diff(&self) -> Option<DiffSnapshot> {
        let entry = self.entry.upgrade()?;
        let inner = entry.inner.lock();
        Some(inner.tracker.diff().clone())
    }

    pub fn diff_revision(&self) -> Option<u64> {
        let entry = self.entry.upgrade()?;
        let inner = entry.inner.lock();
        Some(inner.tracker.diff_revision())
    }
}

/// Keeps the entry alive. Teardown runs when the last handle drops, so a
/// release without a matching acquire cannot be expressed.
pub struct EntryHandle {
    entry: Arc<ModifiedFileEntry>,
}

impl EntryHandle {
    pub fn entry(&self) -> &Arc<ModifiedFileEntry> {
        &self.entry
    }
}

impl Drop for EntryHandle {
    fn drop(&mut self) {
        if self.entry.ref_count.fetch_sub(1, SeqCst) == 1 {
            self.entry.dispose_now();
        }
    }
}

/// One file under edit: wraps a [`ChangeTracker`] in the
/// Modified → Accepted/Rejected state machine, with streaming bookkeeping
/// and the auto-accept countdown.
pub struct ModifiedFileEntry {
    id: EntryId,
    path: Arc<Path>,
    config: Arc<RwLock<SessionConfig>>,
    fs: Arc<dyn Fs>,
    undo_log: Arc<dyn UndoRedoLog>,
    ref_count: AtomicUsize,
    inner: Mutex<EntryInner>,
    state_tx: Mutex<watch::Sender<EntryState>>,
    state_rx: watch::Receiver<EntryState>,
    events: Mutex<Vec<UnboundedSender<EntryEvent>>>,
}

struct EntryInner {
    tracker: ChangeTracker,
    state: EntryState,
    telemetry: TelemetryInfo,
    language_id: Arc<str>,
    rewrite_ratio: f32,
    waits_for_last_edits: bool,
    is_currently_being_modified_by: Option<ChatRequestId>,
    last_modifying_request: Option<ChatRequestId>,
    review_until_settled: bool,
    auto_accept: Option<AutoAcceptControl>,
    disposed: bool,
    integrations: HashMap<u64, Arc<EditorIntegration>>,
}

impl ModifiedFileEntry {
    pub fn new(
        id: EntryId,
        path: Arc<Path>,
        content: &str,
        language_id: Arc<str>,
        telemetry: TelemetryInfo,
        config: Arc<RwLock<SessionConfig>>,
        fs: Arc<dyn Fs>,
        undo_log: Arc<dyn UndoRedoLog>,
    ) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel_with(EntryState::Modified);
        Arc::new(Self {
            id,
            path: path.clone(),
            config,
            fs,
            undo_log,
            ref_count: AtomicUsize::new(0),
            inner: Mutex::new(EntryInner {
                tracker: ChangeTracker::new(path, content),
                state: EntryState::Modified,
                telemetry,
                language_id,
                rewrite_ratio: 0.0,
                waits_for_last_edits: false,
                is_currently_being_modified_by: None,
                last_modifying_request: None,
                review_until_settled: false,
                auto_accept: None,
                disposed: false,
                integrations: HashMap::new(),
            }),
            state_tx: Mutex::new(state_tx),
            state_rx,
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn path(&self) -> &Arc<Path> {
        &self.path
    }

    pub fn state(&self) -> EntryState {
        self.inner.lock().state
    }

    pub fn observe_state(&self) -> watch::Receiver<EntryState> {
        self.state_rx.clone()
    }

    pub fn subscribe(&self) -> UnboundedReceiver<EntryEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.events.lock().push(tx);
        rx
    }

    pub fn telemetry(&self) -> TelemetryInfo {
        self.inner.lock().telemetry.clone()
    }

    pub fn language_id(&self) -> Arc<str> {
        self.inner.lock().language_id.clone()
    }

    pub fn rewrite_ratio(&self) -> f32 {
        self.inner.lock().rewrite_ratio
    }

    pub fn waits_for_last_edits(&self) -> bool {
        self.inner.lock().waits_for_last_edits
    }

    pub fn is_currently_being_modified_by(&self) -> Option<ChatRequestId> {
        self.inner.lock().is_currently_being_modified_by.clone()
    }

    pub fn last_modifying_request(&self) -> Option<ChatRequestId> {
        self.inner.lock().last_modifying_request.clone()
    }

    pub fn modified_text(&self) -> String {
        self.inner.lock().tracker.modified_text().to_string()
    }

    pub fn original_text(&self) -> String {
        self.inner.lock().tracker.original_text().to_string()
    }

    pub fn diff_snapshot(&self) -> DiffSnapshot {
        self.inner.lock().tracker.diff().clone()
    }

    pub fn decorations(&self) -> StreamingDecorations {
        self.inner.lock().tracker.decorations().clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    pub fn auto_accept_control(&self) -> Option<AutoAcceptControl> {
        self.inner.lock().auto_accept.clone()
    }

    /// Whether edits sit pending until explicitly reviewed, either by
    /// configuration or because a review override is active.
    pub fn review_mode(&self) -> bool {
        self.inner.lock().review_until_settled || self.config.read().review_mode()
    }

    /// Takes a share of ownership. The entry is torn down when the last
    /// handle drops.
    pub fn acquire(self: &Arc<Self>) -> EntryHandle {
        self.ref_count.fetch_add(1, SeqCst);
        EntryHandle {
            entry: self.clone(),
        }
    }

    fn emit(&self, event: EntryEvent) {
        self.events
            .lock()
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    fn set_state(&self, inner: &mut EntryInner, state: EntryState) {
        inner.state = state;
        if state != EntryState::Modified {
            inner.review_until_settled = false;
        }
        *self.state_tx.lock().borrow_mut() = state;
    }

    fn cancel_auto_accept(inner: &mut EntryInner) {
        if let Some(control) = inner.auto_accept.take() {
            control.cancel();
        }
    }

    /// Keeps the agent's edits: converges the original buffer onto the
    /// modified content and transitions to Accepted. No-op outside
    /// `Modified`. The file write is best effort; a file deleted externally
    /// raises [`EntryEvent::FileDeleted`] instead of failing.
    pub async fn accept(self: &Arc<Self>) -> Result<()> {
        let content = {
            let mut inner = self.inner.lock();
            if inner.disposed || inner.state != EntryState::Modified {
                return Ok(());
            }
            Self::cancel_auto_accept(&mut inner);
            inner.tracker.keep();
            self.set_state(&mut inner, EntryState::Accepted);
            inner.tracker.modified_text().to_string()
        };
        self.emit(EntryEvent::UserActioned { accepted: true });
        self.write_back(&content).await;
        Ok(())
    }

    /// Discards the agent's edits: restores the original content and
    /// transitions to Rejected. No-op outside `Modified`.
    pub async fn reject(self: &Arc<Self>) -> Result<()> {
        let content = {
            let mut inner = self.inner.lock();
            if inner.disposed || inner.state != EntryState::Modified {
                return Ok(());
            }
            Self::cancel_auto_accept(&mut inner);
            inner.tracker.undo();
            self.set_state(&mut inner, EntryState::Rejected);
            inner.tracker.modified_text().to_string()
        };
        self.emit(EntryEvent::UserActioned { accepted: false });
        self.write_back(&content).await;
        Ok(())
    }

    async fn write_back(&self, content: &str) {
        if let Err(error) = self.fs.save(&self.path, content).await {
            if self.fs.is_file(&self.path).await {
                log::warn!("failed to save {}: {:?}", self.path.display(), error);
            } else {
                self.emit(EntryEvent::FileDeleted);
            }
        }
    }

    /// Marks the start of one streamed turn. Resets transient stream state,
    /// records an undo group so the host editor undoes the turn as a unit,
    /// and cancels any running countdown.
    pub fn accept_streaming_edits_start(&self, request: ChatRequestId) {
        {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return;
            }
            Self::cancel_auto_accept(&mut inner);
            if inner.state != EntryState::Modified {
                // State is a per-request concept; a new request reopens the
                // entry for review.
                self.set_state(&mut inner, EntryState::Modified);
            }
            inner.waits_for_last_edits = true;
            inner.rewrite_ratio = 0.0;
            inner.is_currently_being_modified_by = Some(request.clone());
            inner.last_modifying_request = Some(request.clone());
            inner.telemetry.request_id = request;
        }
        self.undo_log.push_group(&self.path, "chat editing turn");
    }

    pub fn accept_agent_edits(
        &self,
        path: &Path,
        patch: Patch,
        is_last_batch: bool,
        request: &ChatRequestId,
    ) -> Result<AgentEditOutcome> {
        let mut inner = self.inner.lock();
        let outcome = inner
            .tracker
            .accept_agent_edits(path, patch, is_last_batch, request)?;
        inner.rewrite_ratio = outcome.rewrite_ratio;
        Ok(outcome)
    }

    /// Marks the end of a streamed turn: clears transient fields, refreshes
    /// the diff, and either auto-accepts a no-op result or arms the
    /// countdown when review mode is off.
    pub async fn accept_streaming_edits_end(self: &Arc<Self>) {
        enum Next {
            AutoAccept,
            Countdown(Duration),
            Settle,
        }

        let next = {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return;
            }
            inner.waits_for_last_edits = false;
            inner.is_currently_being_modified_by = None;

            if inner.tracker.modified_text() == inner.tracker.original_text() {
                Next::AutoAccept
            } else if !inner.review_until_settled {
                match self.config.read().auto_accept_delay() {
                    Some(delay) => Next::Countdown(delay),
                    None => Next::Settle,
                }
            } else {
                Next::Settle
            }
        };

        self.schedule_clear_just_applied();
        match next {
            Next::AutoAccept => {
                // A no-op edit never lingers as pending review.
                self.accept().await.log_err();
            }
            Next::Countdown(delay) => {
                self.spawn_update_diff();
                self.start_auto_accept(delay);
            }
            Next::Settle => self.spawn_update_diff(),
        }
    }

    /// Forces review mode on until the entry leaves `Modified`, then the
    /// configured setting applies again.
    pub fn enable_review_mode_until_settled(&self) {
        let mut inner = self.inner.lock();
        inner.review_until_settled = true;
        Self::cancel_auto_accept(&mut inner);
    }

    fn start_auto_accept(self: &Arc<Self>, delay: Duration) {
        let control = AutoAcceptControl::new(delay);
        {
            let mut inner = self.inner.lock();
            Self::cancel_auto_accept(&mut inner);
            inner.auto_accept = Some(control.clone());
        }
        let weak = Arc::downgrade(self);
        smol::spawn(async move {
            loop {
                Timer::after(AUTO_ACCEPT_TICK).await;
                let Some(entry) = weak.upgrade() else {
                    return;
                };
                if control.is_cancelled() {
                    return;
                }
                // Review mode may have been toggled back on mid-countdown.
                if entry.review_mode() {
                    control.cancel();
                    entry.inner.lock().auto_accept = None;
                    return;
                }
                if Instant::now() >= control.deadline() {
                    entry.inner.lock().auto_accept = None;
                    entry.accept().await.log_err();
                    return;
                }
            }
        })
        .detach();
    }

    /// Mirrors a user edit into the tracker and refreshes the diff.
    pub fn apply_user_edits(self: &Arc<Self>, patch: Patch) {
        {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return;
            }
            inner.tracker.apply_user_edits(patch);
        }
        self.spawn_update_diff();
    }

    pub fn keep_hunk(self: &Arc<Self>, hunk_index: usize) -> Result<()> {
        let resolved = {
            let mut inner = self.inner.lock();
            inner.tracker.keep_hunk(hunk_index)?
        };
        self.emit(EntryEvent::DiffUpdated);
        if resolved {
            self.emit(EntryEvent::AllHunksResolved);
        }
        Ok(())
    }

    pub fn undo_hunk(self: &Arc<Self>, hunk_index: usize) -> Result<()> {
        let resolved = {
            let mut inner = self.inner.lock();
            inner.tracker.undo_hunk(hunk_index)?
        };
        self.emit(EntryEvent::DiffUpdated);
        if resolved {
            self.emit(EntryEvent::AllHunksResolved);
        }
        Ok(())
    }

    fn spawn_update_diff(self: &Arc<Self>) {
        let this = self.clone();
        smol::spawn(async move { this.update_diff().await }).detach();
    }

    /// Recomputes the diff off-thread. Both buffer versions are snapshotted
    /// first and the result is discarded if either moved on; stale results
    /// are dropped, not cancelled.
    pub async fn update_diff(self: &Arc<Self>) {
        let (original, modified) = {
            let inner = self.inner.lock();
            if inner.disposed {
                return;
            }
            inner.tracker.diff_inputs()
        };
        let (original_text, modified_text) = (original.text.clone(), modified.text.clone());
        let diff = smol::unblock(move || {
            DiffSnapshot::compute(&original_text, &modified_text, DIFF_BUDGET)
        })
        .await;
        let installed = {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return;
            }
            let was_resolved = inner.tracker.is_settled();
            if inner
                .tracker
                .apply_diff_result(diff, original.version, modified.version)
            {
                Some(inner.tracker.diff().identical && !was_resolved)
            } else {
                None
            }
        };
        match installed {
            Some(newly_resolved) => {
                self.emit(EntryEvent::DiffUpdated);
                if newly_resolved {
                    self.emit(EntryEvent::AllHunksResolved);
                }
            }
            None => {}
        }
    }

    fn schedule_clear_just_applied(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        smol::spawn(async move {
            Timer::after(JUST_APPLIED_FLASH).await;
            let Some(entry) = weak.upgrade() else { return };
            let mut inner = entry.inner.lock();
            if inner.disposed {
                return;
            }
            inner.tracker.clear_just_applied();
            drop(inner);
            entry.emit(EntryEvent::DiffUpdated);
        })
        .detach();
    }

    /// Records this entry's contribution to a snapshot.
    pub fn snapshot_entry(&self) -> SnapshotEntry {
        let inner = self.inner.lock();
        SnapshotEntry {
            path: self.path.clone(),
            original: inner.tracker.original_text().into(),
            current: inner.tracker.modified_text().into(),
            state: inner.state,
            telemetry: inner.telemetry.clone(),
            language_id: inner.language_id.clone(),
        }
    }

    /// Forces the entry back to a recorded snapshot.
    pub fn restore_from_snapshot(&self, snapshot: &SnapshotEntry) {
        let mut inner = self.inner.lock();
        Self::cancel_auto_accept(&mut inner);
        inner.tracker.force_contents(&snapshot.original, &snapshot.current);
        inner.telemetry = snapshot.telemetry.clone();
        inner.language_id = snapshot.language_id.clone();
        inner.rewrite_ratio = 0.0;
        inner.waits_for_last_edits = false;
        inner.is_currently_being_modified_by = None;
        self.set_state(&mut inner, snapshot.state);
    }

    /// Resets both buffers to the given content, e.g. the pre-edit original
    /// when the entry is dropped from a restored snapshot.
    pub fn force_content(&self, content: &str) {
        let mut inner = self.inner.lock();
        Self::cancel_auto_accept(&mut inner);
        inner.tracker.force_contents(content, content);
    }

    pub fn editor_integration(self: &Arc<Self>, pane: u64) -> Arc<EditorIntegration> {
        let mut inner = self.inner.lock();
        inner
            .integrations
            .entry(pane)
            .or_insert_with(|| {
                Arc::new(EditorIntegration {
                    pane,
                    entry: Arc::downgrade(self),
                })
            })
            .clone()
    }

    fn dispose_now(&self) {
        let mut inner = self.inner.lock();
        inner.disposed = true;
        Self::cancel_auto_accept(&mut inner);
        inner.integrations.clear();
    }
}

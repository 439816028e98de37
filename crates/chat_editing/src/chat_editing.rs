mod change_tracker;
mod diff;
mod entry;
mod host;
mod persistence;
mod sequencer;
mod session;
mod timeline;

pub use change_tracker::{AgentEditOutcome, ChangeTracker, StreamingDecorations};
pub use diff::{DiffHunk, DiffSnapshot, DIFF_BUDGET};
pub use entry::{
    AutoAcceptControl, EditorIntegration, EntryEvent, EntryHandle, ModifiedFileEntry,
};
pub use host::{
    ConfirmRequest, ConfirmResponse, DialogPrompt, Fs, RelatedFilesProvider, StateStore,
    UndoRedoLog,
};
#[cfg(any(test, feature = "test-support"))]
pub use host::{FakeDialog, FakeFs, MemoryStateStore, RecordingUndoLog};
pub use persistence::{
    PersistedSnapshot, PersistedSnapshotEntry, PersistedStop, SessionStateBlob,
};
pub use sequencer::{SequencerByKey, ThrottledSequencer};
pub use session::{
    EditingSession, EntryDiff, SessionCollaborators, SessionEvent, StreamingEditsHandle,
};
pub use timeline::{
    PendingRestore, RequestDisablement, RestoreTarget, Snapshot, SnapshotEntry, Timeline,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

macro_rules! str_id {
    ($name:ident) => {
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Arc<str>);

        impl $name {
            pub fn new(id: impl Into<Arc<str>>) -> Self {
                Self(id.into())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }
    };
}

str_id!(ChatSessionId);
str_id!(ChatRequestId);
str_id!(UndoStopId);

/// Process-local identity of a [`ModifiedFileEntry`]. Entries are recreated
/// across snapshot restores, so ids are not stable across them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub usize);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry-{}", self.0)
    }
}

/// Provenance of the request that produced an entry's edits. Mutable: a later
/// request resuming edits to the same file takes the entry over.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryInfo {
    pub request_id: ChatRequestId,
    pub session_id: ChatSessionId,
    pub agent_id: Option<Arc<str>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    Modified,
    Accepted,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    StreamingEdits,
    Idle,
    Disposed,
}

const MAX_AUTO_ACCEPT_DELAY: Duration = Duration::from_secs(100);

/// User-facing knobs shared by a session and its entries. Entries re-read the
/// config on every countdown tick, so toggling review mode takes effect on
/// in-flight countdowns.
#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    /// `None` keeps edits pending until an explicit accept or reject
    /// (review mode). `Some` auto-accepts after the delay, clamped to 100 s.
    pub auto_accept_delay: Option<Duration>,
    /// Skip the confirmation dialog for destructive discards.
    pub bypass_discard_confirmation: bool,
}

impl SessionConfig {
    pub fn auto_accept_delay(&self) -> Option<Duration> {
        self.auto_accept_delay.map(|d| d.min(MAX_AUTO_ACCEPT_DELAY))
    }

    pub fn review_mode(&self) -> bool {
        self.auto_accept_delay.is_none()
    }
}

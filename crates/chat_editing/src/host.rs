use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File access as the engine needs it. The editor host provides the real
/// implementation; tests use [`FakeFs`].
#[async_trait]
pub trait Fs: Send + Sync {
    async fn load(&self, path: &Path) -> Result<String>;
    async fn save(&self, path: &Path, content: &str) -> Result<()>;
    /// Creates the file, failing if it already exists.
    async fn create(&self, path: &Path, content: &str) -> Result<()>;
    async fn is_file(&self, path: &Path) -> bool;
}

#[derive(Clone, Debug)]
pub struct ConfirmRequest {
    pub title: String,
    pub message: String,
    /// When set, the dialog offers a "don't ask again" checkbox.
    pub offer_dont_ask_again: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ConfirmResponse {
    pub confirmed: bool,
    pub dont_ask_again: bool,
}

/// Gate for destructive user actions. The host renders the actual dialog.
#[async_trait]
pub trait DialogPrompt: Send + Sync {
    async fn confirm(&self, request: ConfirmRequest) -> ConfirmResponse;
}

/// Opaque blob storage keyed by chat session id.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>>;
    async fn write(&self, key: &str, value: String) -> Result<()>;
    async fn clear(&self, key: &str) -> Result<()>;
}

/// The host editor's undo stack. The engine pushes one group per streamed
/// turn so a whole turn undoes as a unit from the editor's perspective.
pub trait UndoRedoLog: Send + Sync {
    fn push_group(&self, path: &Path, description: &str);
}

#[async_trait]
pub trait RelatedFilesProvider: Send + Sync {
    async fn related_files(&self, path: &Path) -> Vec<(PathBuf, String)>;
}

#[cfg(any(test, feature = "test-support"))]
pub use fake::{FakeDialog, FakeFs, MemoryStateStore, RecordingUndoLog};

#[cfg(any(test, feature = "test-support"))]
mod fake {
    use super::*;
    use anyhow::{anyhow, bail};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};

    #[derive(Default)]
    pub struct FakeFs {
        files: Mutex<HashMap<PathBuf, String>>,
    }

    impl FakeFs {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn insert_file(&self, path: impl Into<PathBuf>, content: impl Into<String>) {
            self.files.lock().insert(path.into(), content.into());
        }

        pub fn remove_file(&self, path: &Path) {
            self.files.lock().remove(path);
        }

        pub fn read_file_sync(&self, path: &Path) -> Option<String> {
            self.files.lock().get(path).cloned()
        }
    }

    #[async_trait]
    impl Fs for FakeFs {
        async fn load(&self, path: &Path) -> Result<String> {
            self.files
                .lock()
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow!("no such file: {}", path.display()))
        }

        async fn save(&self, path: &Path, content: &str) -> Result<()> {
            let mut files = self.files.lock();
            if !files.contains_key(path) {
                bail!("no such file: {}", path.display());
            }
            files.insert(path.to_path_buf(), content.to_string());
            Ok(())
        }

        async fn create(&self, path: &Path, content: &str) -> Result<()> {
            let mut files = self.files.lock();
            if files.contains_key(path) {
                bail!("file already exists: {}", path.display());
            }
            files.insert(path.to_path_buf(), content.to_string());
            Ok(())
        }

        async fn is_file(&self, path: &Path) -> bool {
            self.files.lock().contains_key(path)
        }
    }

    pub struct FakeDialog {
        response: Mutex<ConfirmResponse>,
        prompt_count: AtomicUsize,
    }

    impl FakeDialog {
        pub fn new(response: ConfirmResponse) -> Arc<Self> {
            Arc::new(Self {
                response: Mutex::new(response),
                prompt_count: AtomicUsize::new(0),
            })
        }

        pub fn set_response(&self, response: ConfirmResponse) {
            *self.response.lock() = response;
        }

        pub fn prompt_count(&self) -> usize {
            self.prompt_count.load(SeqCst)
        }
    }

    #[async_trait]
    impl DialogPrompt for FakeDialog {
        async fn confirm(&self, _request: ConfirmRequest) -> ConfirmResponse {
            self.prompt_count.fetch_add(1, SeqCst);
            *self.response.lock()
        }
    }

    #[derive(Default)]
    pub struct MemoryStateStore {
        blobs: Mutex<HashMap<String, String>>,
    }

    impl MemoryStateStore {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn insert_blob(&self, key: impl Into<String>, value: impl Into<String>) {
            self.blobs.lock().insert(key.into(), value.into());
        }
    }

    #[async_trait]
    impl StateStore for MemoryStateStore {
        async fn read(&self, key: &str) -> Result<Option<String>> {
            Ok(self.blobs.lock().get(key).cloned())
        }

        async fn write(&self, key: &str, value: String) -> Result<()> {
            self.blobs.lock().insert(key.to_string(), value);
            Ok(())
        }

        async fn clear(&self, key: &str) -> Result<()> {
            self.blobs.lock().remove(key);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingUndoLog {
        groups: Mutex<Vec<(PathBuf, String)>>,
    }

    impl RecordingUndoLog {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn groups(&self) -> Vec<(PathBuf, String)> {
            self.groups.lock().clone()
        }
    }

    impl UndoRedoLog for RecordingUndoLog {
        fn push_group(&self, path: &Path, description: &str) {
            self.groups
                .lock()
                .push((path.to_path_buf(), description.to_string()));
        }
    }
}

use crate::{EditSource, Patch};
use std::sync::Arc;

/// A plain string buffer with a monotonically increasing version id. Buffers
/// are single-owner: the component that owns one is the only mutator, so
/// every change flows through [`TextBuffer::edit`] and is observable from the
/// returned [`BufferEvent`].
#[derive(Debug)]
pub struct TextBuffer {
    text: String,
    version: u64,
}

/// A point-in-time copy of a buffer's content and version, safe to move to
/// another task while the buffer keeps changing.
#[derive(Clone, Debug)]
pub struct BufferSnapshot {
    pub text: Arc<str>,
    pub version: u64,
}

/// Describes one committed edit: the patch that was applied, its provenance,
/// and the version transition it produced.
#[derive(Clone, Debug)]
pub struct BufferEvent {
    pub patch: Patch,
    pub source: EditSource,
    pub old_version: u64,
    pub new_version: u64,
}

impl TextBuffer {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            version: 0,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn snapshot(&self) -> BufferSnapshot {
        BufferSnapshot {
            text: self.text.as_str().into(),
            version: self.version,
        }
    }

    /// Applies `patch` and bumps the version. The returned event carries the
    /// applied patch so the owner can mirror it elsewhere.
    pub fn edit(&mut self, patch: Patch, source: EditSource) -> BufferEvent {
        let old_version = self.version;
        self.text = patch.apply(&self.text);
        self.version += 1;
        BufferEvent {
            patch,
            source,
            old_version,
            new_version: self.version,
        }
    }

    /// Replaces the entire content in one edit.
    pub fn set_text(&mut self, text: impl Into<String>, source: EditSource) -> BufferEvent {
        let text = text.into();
        let patch = Patch::unit(crate::Replacement::new(0..self.text.len(), text));
        self.edit(patch, source)
    }

    /// Number of lines, counting the trailing fragment after the last newline.
    pub fn line_count(&self) -> u32 {
        self.text.bytes().filter(|b| *b == b'\n').count() as u32 + 1
    }

    /// Zero-based line containing the given byte offset.
    pub fn line_for_offset(&self, offset: usize) -> u32 {
        let offset = offset.min(self.text.len());
        self.text[..offset].bytes().filter(|b| *b == b'\n').count() as u32
    }
}

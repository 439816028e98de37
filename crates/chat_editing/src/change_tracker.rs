use crate::diff::{DiffSnapshot, DIFF_BUDGET};
use crate::ChatRequestId;
use anyhow::{ensure, Result};
use std::path::Path;
use std::sync::Arc;
use text_edit::{BufferEvent, BufferSnapshot, EditSource, Patch, Replacement, TextBuffer};

/// What one batch of agent edits did to the modified buffer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AgentEditOutcome {
    /// Fraction of the document the stream has rewritten so far, 0..=1.
    pub rewrite_ratio: f32,
    /// Highest zero-based line touched by the batch.
    pub max_line_number: u32,
}

/// Render state for an in-flight stream: everything up to
/// `edited_up_to_line` has been written, everything from `pending_from_line`
/// is still awaiting content. `just_applied` flashes after the final batch
/// and is cleared by a delayed task.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamingDecorations {
    pub edited_up_to_line: Option<u32>,
    pub pending_from_line: Option<u32>,
    pub just_applied: bool,
}

/// Owns the original/modified buffer pair for one file under edit, keeps a
/// live structural diff between them, and reconciles agent-authored edits
/// with concurrent user edits.
///
/// The accumulated `original_to_modified` patch lets user edits fast-forward
/// the original buffer without a full diff: a user edit that doesn't touch
/// any agent-inserted region is rebased through the inverse patch and
/// applied to the original directly. Overlap degrades to composition plus a
/// full diff recomputation, which is slower but never wrong.
pub struct ChangeTracker {
    path: Arc<Path>,
    original: TextBuffer,
    modified: TextBuffer,
    original_to_modified: Patch,
    all_edits_are_from_us: bool,
    diff: DiffSnapshot,
    diff_is_stale: bool,
    diff_revision: u64,
    decorations: StreamingDecorations,
}

impl ChangeTracker {
    pub fn new(path: Arc<Path>, content: &str) -> Self {
        Self {
            path,
            original: TextBuffer::new(content),
            modified: TextBuffer::new(content),
            original_to_modified: Patch::default(),
            all_edits_are_from_us: true,
            diff: DiffSnapshot::identical(),
            diff_is_stale: false,
            diff_revision: 0,
            decorations: StreamingDecorations::default(),
        }
    }

    pub fn path(&self) -> &Arc<Path> {
        &self.path
    }

    pub fn original_text(&self) -> &str {
        self.original.text()
    }

    pub fn modified_text(&self) -> &str {
        self.modified.text()
    }

    pub fn diff(&self) -> &DiffSnapshot {
        &self.diff
    }

    pub fn diff_revision(&self) -> u64 {
        self.diff_revision
    }

    pub fn diff_is_stale(&self) -> bool {
        self.diff_is_stale
    }

    pub fn decorations(&self) -> &StreamingDecorations {
        &self.decorations
    }

    pub fn all_edits_are_from_us(&self) -> bool {
        self.all_edits_are_from_us
    }

    pub fn is_settled(&self) -> bool {
        !self.diff_is_stale && self.diff.identical
    }

    /// Applies one batch of streamed agent edits. `path` must name the file
    /// this tracker owns; anything else is a caller bug.
    pub fn accept_agent_edits(
        &mut self,
        path: &Path,
        patch: Patch,
        is_last_batch: bool,
        request: &ChatRequestId,
    ) -> Result<AgentEditOutcome> {
        ensure!(
            path == self.path.as_ref(),
            "edits for {} routed to tracker for {}",
            path.display(),
            self.path.display(),
        );

        let max_new_end = patch.max_new_end();
        if !patch.is_empty() || is_last_batch {
            self.edit_modified(
                patch,
                EditSource::AgentEdits {
                    request_id: request.0.clone(),
                },
            );
        }

        let max_line_number = max_new_end
            .map(|offset| self.modified.line_for_offset(offset))
            .unwrap_or(0);
        let line_count = self.modified.line_count();

        let rewrite_ratio;
        if is_last_batch {
            rewrite_ratio = 1.0;
            self.decorations = StreamingDecorations {
                edited_up_to_line: None,
                pending_from_line: None,
                just_applied: true,
            };
            self.diff_is_stale = true;
        } else {
            rewrite_ratio = ((max_line_number + 1) as f32 / line_count as f32).clamp(0.0, 1.0);
            self.decorations.edited_up_to_line = Some(max_line_number);
            self.decorations.pending_from_line = if max_line_number + 1 < line_count {
                Some(max_line_number + 1)
            } else {
                None
            };
            self.decorations.just_applied = false;
        }

        Ok(AgentEditOutcome {
            rewrite_ratio,
            max_line_number,
        })
    }

    /// Routes a user-authored edit through the modified buffer.
    pub fn apply_user_edits(&mut self, patch: Patch) -> BufferEvent {
        self.edit_modified(patch, EditSource::Cursor)
    }

    /// Clears the post-apply flash, if it is still showing.
    pub fn clear_just_applied(&mut self) {
        self.decorations.just_applied = false;
    }

    fn edit_modified(&mut self, patch: Patch, source: EditSource) -> BufferEvent {
        let event = self.modified.edit(patch, source);
        self.mirror_edits(&event);
        event
    }

    /// Runs on every modified-buffer change, keeping the accumulated
    /// original→modified patch truthful for the change's provenance.
    fn mirror_edits(&mut self, event: &BufferEvent) {
        match &event.source {
            EditSource::AgentEdits { .. } => {
                self.original_to_modified = self.original_to_modified.compose(&event.patch);
                self.diff_is_stale = true;
            }
            EditSource::Cursor => {
                let inverse = self.original_to_modified.inverse(self.original.text());
                let rebased_onto_original = event
                    .patch
                    .try_rebase(&inverse)
                    .and_then(|user_on_original| {
                        let shifted = self.original_to_modified.try_rebase(&user_on_original)?;
                        Some((user_on_original, shifted))
                    });
                match rebased_onto_original {
                    Some((user_on_original, shifted)) => {
                        self.original.edit(user_on_original, EditSource::Reset);
                        self.original_to_modified = shifted;
                        self.diff_is_stale = true;
                    }
                    None => {
                        self.original_to_modified =
                            self.original_to_modified.compose(&event.patch);
                        self.all_edits_are_from_us = false;
                        self.diff_is_stale = true;
                    }
                }
            }
            // Convergence edits rewrite the accumulated patch wholesale at
            // the call site.
            EditSource::AgentUndo | EditSource::Reset => {}
        }
    }

    /// Force-sets the original to the modified content, discarding the diff.
    pub fn keep(&mut self) {
        self.original
            .set_text(self.modified.text().to_string(), EditSource::Reset);
        self.converge();
    }

    /// Force-replaces the modified content with the original's. The edit is
    /// tagged so provenance tracking does not classify it as agent output.
    pub fn undo(&mut self) {
        let text = self.original.text().to_string();
        self.modified.set_text(text, EditSource::AgentUndo);
        self.converge();
    }

    fn converge(&mut self) {
        self.original_to_modified = Patch::default();
        self.all_edits_are_from_us = true;
        self.diff = DiffSnapshot::identical();
        self.diff_is_stale = false;
        self.diff_revision += 1;
        self.decorations = StreamingDecorations::default();
    }

    /// Applies one hunk's content to the original buffer, accepting just
    /// that change. Returns true when no unresolved hunks remain.
    pub fn keep_hunk(&mut self, hunk_index: usize) -> Result<bool> {
        let hunk = self
            .diff
            .hunks
            .get(hunk_index)
            .ok_or_else(|| anyhow::anyhow!("no hunk at index {hunk_index}"))?
            .clone();
        let new_text = self.modified.text()[hunk.modified_byte_range].to_string();
        self.original.edit(
            Patch::unit(Replacement::new(hunk.original_byte_range, new_text)),
            EditSource::Reset,
        );
        Ok(self.recompute_diff_sync())
    }

    /// Reverts one hunk in the modified buffer to the original's content.
    /// Returns true when no unresolved hunks remain.
    pub fn undo_hunk(&mut self, hunk_index: usize) -> Result<bool> {
        let hunk = self
            .diff
            .hunks
            .get(hunk_index)
            .ok_or_else(|| anyhow::anyhow!("no hunk at index {hunk_index}"))?
            .clone();
        let original_text = self.original.text()[hunk.original_byte_range].to_string();
        self.modified.edit(
            Patch::unit(Replacement::new(hunk.modified_byte_range, original_text)),
            EditSource::AgentUndo,
        );
        Ok(self.recompute_diff_sync())
    }

    fn recompute_diff_sync(&mut self) -> bool {
        let diff = DiffSnapshot::compute(self.original.text(), self.modified.text(), DIFF_BUDGET);
        self.original_to_modified = diff.to_patch(self.modified.text());
        self.diff = diff;
        self.diff_is_stale = false;
        self.diff_revision += 1;
        self.diff.identical
    }

    /// Inputs for an asynchronous diff recomputation. The caller computes
    /// off-thread and feeds the result to [`Self::apply_diff_result`].
    pub fn diff_inputs(&self) -> (BufferSnapshot, BufferSnapshot) {
        (self.original.snapshot(), self.modified.snapshot())
    }

    /// Installs an asynchronously computed diff unless either buffer moved
    /// on while it was being computed. Returns whether it was installed.
    pub fn apply_diff_result(
        &mut self,
        diff: DiffSnapshot,
        original_version: u64,
        modified_version: u64,
    ) -> bool {
        if self.original.version() != original_version
            || self.modified.version() != modified_version
        {
            return false;
        }
        self.original_to_modified = diff.to_patch(self.modified.text());
        self.diff = diff;
        self.diff_is_stale = false;
        self.diff_revision += 1;
        true
    }

    /// Force-sets both buffers, e.g. when restoring a snapshot. Recomputes
    /// the diff inline so the tracker is immediately consistent.
    pub fn force_contents(&mut self, original: &str, modified: &str) {
        self.original.set_text(original.to_string(), EditSource::Reset);
        self.modified.set_text(modified.to_string(), EditSource::Reset);
        self.recompute_diff_sync();
        self.all_edits_are_from_us = true;
        self.decorations = StreamingDecorations::default();
    }
}

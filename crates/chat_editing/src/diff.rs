use similar::{Algorithm, DiffOp, TextDiff};
use std::ops::Range;
use std::time::{Duration, Instant};
use text_edit::{Patch, Replacement};

/// Wall-clock budget for one diff computation. When it runs out the engine
/// keeps whatever the diff produced rather than blocking.
pub const DIFF_BUDGET: Duration = Duration::from_millis(3000);

/// A run of changed lines between the original and modified text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffHunk {
    /// Row range in the original text, expressed as zero-based lines.
    pub original_row_range: Range<u32>,
    /// Row range in the modified text.
    pub modified_row_range: Range<u32>,
    /// The byte range in the original text this hunk replaces.
    pub original_byte_range: Range<usize>,
    /// The byte range in the modified text that replaces it.
    pub modified_byte_range: Range<usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiffSnapshot {
    pub hunks: Vec<DiffHunk>,
    pub identical: bool,
    /// The diff ran out of budget and the hunks are best-effort.
    pub quit_early: bool,
}

impl DiffSnapshot {
    /// A snapshot for a pair that is known to be in lockstep.
    pub fn identical() -> Self {
        Self {
            hunks: Vec::new(),
            identical: true,
            quit_early: false,
        }
    }

    pub fn compute(original: &str, modified: &str, budget: Duration) -> Self {
        if original == modified {
            return Self::identical();
        }

        let started = Instant::now();
        let diff = TextDiff::configure()
            .algorithm(Algorithm::Myers)
            .deadline(started + budget)
            .diff_lines(original, modified);

        let original_lines = line_starts(original);
        let modified_lines = line_starts(modified);

        let mut hunks: Vec<DiffHunk> = Vec::new();
        for op in diff.ops() {
            let (old_range, new_range) = match *op {
                DiffOp::Equal { .. } => continue,
                DiffOp::Delete {
                    old_index,
                    old_len,
                    new_index,
                } => (old_index..old_index + old_len, new_index..new_index),
                DiffOp::Insert {
                    old_index,
                    new_index,
                    new_len,
                } => (old_index..old_index, new_index..new_index + new_len),
                DiffOp::Replace {
                    old_index,
                    old_len,
                    new_index,
                    new_len,
                } => (
                    old_index..old_index + old_len,
                    new_index..new_index + new_len,
                ),
            };

            // Adjacent change ops fold into one hunk.
            if let Some(last) = hunks.last_mut() {
                if last.original_row_range.end as usize == old_range.start
                    && last.modified_row_range.end as usize == new_range.start
                {
                    last.original_row_range.end = old_range.end as u32;
                    last.modified_row_range.end = new_range.end as u32;
                    last.original_byte_range.end = original_lines[old_range.end];
                    last.modified_byte_range.end = modified_lines[new_range.end];
                    continue;
                }
            }

            hunks.push(DiffHunk {
                original_byte_range: original_lines[old_range.start]..original_lines[old_range.end],
                modified_byte_range: modified_lines[new_range.start]..modified_lines[new_range.end],
                original_row_range: old_range.start as u32..old_range.end as u32,
                modified_row_range: new_range.start as u32..new_range.end as u32,
            });
        }

        Self {
            identical: hunks.is_empty(),
            quit_early: started.elapsed() >= budget,
            hunks,
        }
    }

    /// Re-derives the original→modified patch from the hunks.
    pub fn to_patch(&self, modified: &str) -> Patch {
        Patch::new(self.hunks.iter().map(|hunk| {
            Replacement::new(
                hunk.original_byte_range.clone(),
                &modified[hunk.modified_byte_range.clone()],
            )
        }))
    }
}

/// Byte offsets of each line token's start, with a trailing sentinel at the
/// text's end. Lines are newline-inclusive, matching `similar`'s
/// tokenization.
fn line_starts(text: &str) -> Vec<usize> {
    let mut starts = vec![0];
    for (offset, byte) in text.bytes().enumerate() {
        if byte == b'\n' && offset + 1 < text.len() {
            starts.push(offset + 1);
        }
    }
    if text.is_empty() {
        return vec![0];
    }
    starts.push(text.len());
    starts
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    /// (original rows, original text, modified text) per hunk.
    #[track_caller]
    fn assert_hunks(
        snapshot: &DiffSnapshot,
        original: &str,
        modified: &str,
        expected: &[(Range<u32>, &str, &str)],
    ) {
        let actual = snapshot
            .hunks
            .iter()
            .map(|hunk| {
                (
                    hunk.original_row_range.clone(),
                    &original[hunk.original_byte_range.clone()],
                    &modified[hunk.modified_byte_range.clone()],
                )
            })
            .collect::<Vec<_>>();
        let expected = expected
            .iter()
            .map(|(rows, old, new)| (rows.clone(), *old, *new))
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_identical() {
        let snapshot = DiffSnapshot::compute("same\n", "same\n", DIFF_BUDGET);
        assert!(snapshot.identical);
        assert!(snapshot.hunks.is_empty());
    }

    #[test]
    fn test_single_modification() {
        let original = indoc! {"
            one
            two
            three
        "};
        let modified = indoc! {"
            one
            HELLO
            three
        "};
        let snapshot = DiffSnapshot::compute(original, modified, DIFF_BUDGET);
        assert!(!snapshot.identical);
        assert_hunks(&snapshot, original, modified, &[(1..2, "two\n", "HELLO\n")]);
    }

    #[test]
    fn test_insertion_and_deletion() {
        let original = indoc! {"
            one
            two
            three
            four
        "};
        let modified = indoc! {"
            zero
            one
            two
            four
        "};
        let snapshot = DiffSnapshot::compute(original, modified, DIFF_BUDGET);
        assert_hunks(
            &snapshot,
            original,
            modified,
            &[(0..0, "", "zero\n"), (2..3, "three\n", "")],
        );
    }

    #[test]
    fn test_to_patch_roundtrip() {
        let original = "a\nb\nc\nd\n";
        let modified = "a\nB\nc\nd\ne\n";
        let snapshot = DiffSnapshot::compute(original, modified, DIFF_BUDGET);
        assert_eq!(snapshot.to_patch(modified).apply(original), modified);
    }

    #[test]
    fn test_no_trailing_newline() {
        let original = "alpha\nbeta";
        let modified = "alpha\ngamma";
        let snapshot = DiffSnapshot::compute(original, modified, DIFF_BUDGET);
        assert_hunks(&snapshot, original, modified, &[(1..2, "beta", "gamma")]);
        assert_eq!(snapshot.to_patch(modified).apply(original), modified);
    }
}

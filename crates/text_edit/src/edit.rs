use smallvec::SmallVec;
use std::fmt;
use std::ops::Range;

/// A single replacement of a byte range in some base text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Replacement {
    /// Byte range in the base text that gets removed.
    pub range: Range<usize>,
    /// Text inserted in its place.
    pub new_text: String,
}

impl Replacement {
    pub fn new(range: Range<usize>, new_text: impl Into<String>) -> Self {
        Self {
            range,
            new_text: new_text.into(),
        }
    }

    pub fn insert(offset: usize, new_text: impl Into<String>) -> Self {
        Self::new(offset..offset, new_text)
    }

    pub fn delete(range: Range<usize>) -> Self {
        Self::new(range, "")
    }

    pub fn old_len(&self) -> usize {
        self.range.end - self.range.start
    }

    pub fn new_len(&self) -> usize {
        self.new_text.len()
    }
}

/// An ordered, non-overlapping sequence of [`Replacement`]s over a flat
/// string. Patches compose associatively and can be rebased over a
/// concurrently produced patch from the same base text.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Patch {
    replacements: SmallVec<[Replacement; 2]>,
}

impl fmt::Debug for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.replacements.iter()).finish()
    }
}

impl Patch {
    /// Builds a patch from replacements expressed against the same base
    /// text. Replacements are sorted by position; they must not overlap.
    /// Malformed input is a caller bug and fails fast.
    pub fn new(replacements: impl IntoIterator<Item = Replacement>) -> Self {
        let mut replacements: SmallVec<[Replacement; 2]> = replacements.into_iter().collect();
        replacements.sort_by_key(|r| (r.range.start, r.range.end));
        for pair in replacements.windows(2) {
            assert!(
                pair[0].range.end <= pair[1].range.start,
                "replacements overlap: {:?} and {:?}",
                pair[0],
                pair[1]
            );
        }
        for replacement in &replacements {
            assert!(
                replacement.range.start <= replacement.range.end,
                "inverted range {:?}",
                replacement.range
            );
        }
        Self { replacements }
    }

    pub fn unit(replacement: Replacement) -> Self {
        Self::new([replacement])
    }

    pub fn is_empty(&self) -> bool {
        self.replacements.is_empty()
    }

    pub fn replacements(&self) -> &[Replacement] {
        &self.replacements
    }

    /// Net change in length produced by applying this patch.
    pub fn delta(&self) -> isize {
        self.replacements
            .iter()
            .map(|r| r.new_len() as isize - r.old_len() as isize)
            .sum()
    }

    /// Highest offset in the *new* text touched by this patch, if any.
    pub fn max_new_end(&self) -> Option<usize> {
        let mut delta = 0isize;
        let mut max_end = None;
        for r in &self.replacements {
            let new_start = (r.range.start as isize + delta) as usize;
            max_end = Some(new_start + r.new_len());
            delta += r.new_len() as isize - r.old_len() as isize;
        }
        max_end
    }

    pub fn apply(&self, base: &str) -> String {
        let mut output = String::with_capacity(
            (base.len() as isize + self.delta()).max(0) as usize,
        );
        let mut pos = 0;
        for r in &self.replacements {
            assert!(
                r.range.start >= pos && r.range.end <= base.len(),
                "replacement {:?} out of bounds for base of length {}",
                r,
                base.len()
            );
            output.push_str(&base[pos..r.range.start]);
            output.push_str(&r.new_text);
            pos = r.range.end;
        }
        output.push_str(&base[pos..]);
        output
    }

    /// Composes two patches: `self` maps S→T and `other` maps T→U; the result
    /// maps S→U. Composition is associative.
    pub fn compose(&self, other: &Patch) -> Patch {
        let composed = compose_ops(self.to_ops(), other.to_ops());
        ops_to_patch(composed)
    }

    /// Re-expresses `self` against the text produced by `base`, where both
    /// patches were made against the same base text. Returns `None` when the
    /// two touch overlapping ranges; at equal boundaries `base` orders first.
    /// Two insertions at the same point also conflict: there is no ordering
    /// that holds from both sides.
    pub fn try_rebase(&self, base: &Patch) -> Option<Patch> {
        let mut delta = 0isize;
        let mut base_iter = base.replacements.iter().peekable();
        let mut rebased = Vec::with_capacity(self.replacements.len());
        for r in &self.replacements {
            while let Some(b) = base_iter.peek() {
                if b.range.end > r.range.start {
                    break;
                }
                if b.range == r.range && r.range.is_empty() {
                    return None;
                }
                delta += b.new_len() as isize - b.old_len() as isize;
                base_iter.next();
            }
            if let Some(b) = base_iter.peek() {
                if b.range.start < r.range.end {
                    return None;
                }
            }
            let start = (r.range.start as isize + delta) as usize;
            let end = (r.range.end as isize + delta) as usize;
            rebased.push(Replacement::new(start..end, r.new_text.clone()));
        }
        Some(Patch::new(rebased))
    }

    /// Produces the patch that undoes `self`, expressed against the text that
    /// `self` produces. `base` must be the text `self` was made against.
    pub fn inverse(&self, base: &str) -> Patch {
        let mut delta = 0isize;
        let mut inverted = Vec::with_capacity(self.replacements.len());
        for r in &self.replacements {
            let start = (r.range.start as isize + delta) as usize;
            inverted.push(Replacement::new(
                start..start + r.new_len(),
                &base[r.range.clone()],
            ));
            delta += r.new_len() as isize - r.old_len() as isize;
        }
        Patch::new(inverted)
    }

    fn to_ops(&self) -> Vec<Op> {
        let mut ops = Vec::with_capacity(self.replacements.len() * 3);
        let mut pos = 0;
        for r in &self.replacements {
            if r.range.start > pos {
                ops.push(Op::Retain(r.range.start - pos));
            }
            if r.old_len() > 0 {
                ops.push(Op::Delete(r.old_len()));
            }
            if !r.new_text.is_empty() {
                ops.push(Op::Insert(r.new_text.clone()));
            }
            pos = r.range.end;
        }
        ops
    }
}

impl FromIterator<Replacement> for Patch {
    fn from_iter<I: IntoIterator<Item = Replacement>>(iter: I) -> Self {
        Patch::new(iter)
    }
}

/// Retain/delete/insert stream over the base text, with an implicit retain of
/// the remainder. The standard formulation for operational composition.
#[derive(Debug)]
enum Op {
    Retain(usize),
    Delete(usize),
    Insert(String),
}

struct OpCursor {
    ops: std::vec::IntoIter<Op>,
    head: Option<Op>,
}

impl OpCursor {
    fn new(ops: Vec<Op>) -> Self {
        let mut ops = ops.into_iter();
        let head = ops.next();
        Self { ops, head }
    }

    fn advance(&mut self) -> Option<Op> {
        std::mem::replace(&mut self.head, self.ops.next())
    }
}

fn compose_ops(a: Vec<Op>, b: Vec<Op>) -> Vec<Op> {
    let mut a = OpCursor::new(a);
    let mut b = OpCursor::new(b);
    let mut output: Vec<Op> = Vec::new();

    loop {
        match (&mut a.head, &mut b.head) {
            (None, None) => break,
            // Deletions in `a` consume base text that `b` never saw.
            (Some(Op::Delete(_)), _) => {
                let Some(Op::Delete(n)) = a.advance() else {
                    unreachable!()
                };
                output.push(Op::Delete(n));
            }
            // Insertions in `b` are independent of `a`'s output.
            (_, Some(Op::Insert(_))) => {
                let Some(Op::Insert(text)) = b.advance() else {
                    unreachable!()
                };
                output.push(Op::Insert(text));
            }
            (None, Some(Op::Retain(_))) => {
                let Some(Op::Retain(n)) = b.advance() else {
                    unreachable!()
                };
                output.push(Op::Retain(n));
            }
            (None, Some(Op::Delete(_))) => {
                let Some(Op::Delete(n)) = b.advance() else {
                    unreachable!()
                };
                output.push(Op::Delete(n));
            }
            (Some(Op::Retain(_)), None) => {
                let Some(Op::Retain(n)) = a.advance() else {
                    unreachable!()
                };
                output.push(Op::Retain(n));
            }
            (Some(Op::Insert(_)), None) => {
                let Some(Op::Insert(text)) = a.advance() else {
                    unreachable!()
                };
                output.push(Op::Insert(text));
            }
            (Some(Op::Retain(n)), Some(Op::Retain(m))) => {
                let len = (*n).min(*m);
                output.push(Op::Retain(len));
                consume(&mut a, len);
                consume(&mut b, len);
            }
            (Some(Op::Retain(n)), Some(Op::Delete(m))) => {
                let len = (*n).min(*m);
                output.push(Op::Delete(len));
                consume(&mut a, len);
                consume(&mut b, len);
            }
            (Some(Op::Insert(text)), Some(Op::Retain(m))) => {
                let len = text.len().min(*m);
                let retained = text[..len].to_string();
                output.push(Op::Insert(retained));
                consume(&mut a, len);
                consume(&mut b, len);
            }
            (Some(Op::Insert(text)), Some(Op::Delete(m))) => {
                let len = text.len().min(*m);
                consume(&mut a, len);
                consume(&mut b, len);
            }
        }
    }

    output
}

/// Shrinks the cursor's head op by `len` bytes of its output (or input, for
/// deletions), dropping it once exhausted.
fn consume(cursor: &mut OpCursor, len: usize) {
    let exhausted = match cursor.head.as_mut() {
        Some(Op::Retain(n)) | Some(Op::Delete(n)) => {
            *n -= len;
            *n == 0
        }
        Some(Op::Insert(text)) => {
            text.drain(..len);
            text.is_empty()
        }
        None => return,
    };
    if exhausted {
        cursor.advance();
    }
}

fn ops_to_patch(ops: Vec<Op>) -> Patch {
    let mut replacements = Vec::new();
    let mut pos = 0;
    let mut pending: Option<Replacement> = None;
    for op in ops {
        match op {
            Op::Retain(n) => {
                if let Some(replacement) = pending.take() {
                    pos = replacement.range.end;
                    replacements.push(replacement);
                }
                pos += n;
            }
            Op::Delete(n) => {
                let replacement = pending.get_or_insert_with(|| Replacement::new(pos..pos, ""));
                replacement.range.end += n;
            }
            Op::Insert(text) => {
                let replacement = pending.get_or_insert_with(|| Replacement::new(pos..pos, ""));
                replacement.new_text.push_str(&text);
            }
        }
    }
    if let Some(replacement) = pending {
        replacements.push(replacement);
    }
    replacements.retain(|r| r.old_len() > 0 || !r.new_text.is_empty());
    Patch::new(replacements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    #[test]
    fn test_apply() {
        let patch = Patch::new([
            Replacement::new(0..3, "uno"),
            Replacement::insert(8, "!"),
            Replacement::delete(9..13),
        ]);
        assert_eq!(patch.apply("one two three four"), "uno two !t four");
    }

    #[test]
    fn test_compose() {
        let base = "the quick brown fox";
        let a = Patch::new([Replacement::new(4..9, "slow")]);
        let b = Patch::new([Replacement::new(9..14, "green")]);
        let composed = a.compose(&b);
        assert_eq!(composed.apply(base), b.apply(&a.apply(base)));
        assert_eq!(composed.apply(base), "the slow green fox");
    }

    #[test]
    fn test_compose_insert_then_delete_within_insertion() {
        let base = "abc";
        let a = Patch::new([Replacement::insert(1, "XYZ")]);
        let b = Patch::new([Replacement::delete(2..4)]);
        let composed = a.compose(&b);
        assert_eq!(composed.apply(base), b.apply(&a.apply(base)));
        assert_eq!(composed.apply(base), "aXbc");
    }

    #[test]
    fn test_compose_is_associative() {
        let mut rng = StdRng::seed_from_u64(999);
        for _ in 0..100 {
            let base = random_text(&mut rng, 40);
            let a = random_patch(&mut rng, &base);
            let t = a.apply(&base);
            let b = random_patch(&mut rng, &t);
            let u = b.apply(&t);
            let c = random_patch(&mut rng, &u);

            let left = a.compose(&b).compose(&c);
            let right = a.compose(&b.compose(&c));
            assert_eq!(left.apply(&base), right.apply(&base));
            assert_eq!(left.apply(&base), c.apply(&u));
        }
    }

    #[test]
    fn test_try_rebase_disjoint() {
        let base = "one two three";
        let agent = Patch::new([Replacement::new(0..3, "ONE")]);
        let user = Patch::new([Replacement::new(8..13, "3")]);

        let user_rebased = user.try_rebase(&agent).unwrap();
        let agent_rebased = agent.try_rebase(&user).unwrap();
        assert_eq!(
            user_rebased.apply(&agent.apply(base)),
            agent_rebased.apply(&user.apply(base)),
        );
        assert_eq!(user_rebased.apply(&agent.apply(base)), "ONE two 3");
    }

    #[test]
    fn test_try_rebase_conflict() {
        let agent = Patch::new([Replacement::new(2..8, "x")]);
        let user = Patch::new([Replacement::new(5..10, "y")]);
        assert_eq!(user.try_rebase(&agent), None);
    }

    #[test]
    fn test_try_rebase_insertion_at_edit_boundary() {
        let base = "ab";
        let agent = Patch::new([Replacement::new(0..1, "X")]);
        let user = Patch::new([Replacement::insert(1, "Y")]);

        let user_rebased = user.try_rebase(&agent).unwrap();
        let agent_rebased = agent.try_rebase(&user).unwrap();
        assert_eq!(user_rebased.apply(&agent.apply(base)), "XYb");
        assert_eq!(agent_rebased.apply(&user.apply(base)), "XYb");
    }

    #[test]
    fn test_try_rebase_same_point_insertions_conflict() {
        let agent = Patch::new([Replacement::insert(1, "X")]);
        let user = Patch::new([Replacement::insert(1, "Y")]);
        assert_eq!(user.try_rebase(&agent), None);
        assert_eq!(agent.try_rebase(&user), None);
    }

    #[test]
    fn test_try_rebase_deletion_swallowing_insertion_point_conflicts() {
        let agent = Patch::new([Replacement::insert(3, "inserted")]);
        let user = Patch::new([Replacement::delete(1..5)]);
        assert_eq!(user.try_rebase(&agent), None);
    }

    #[test]
    fn test_inverse() {
        let base = "alpha beta gamma";
        let patch = Patch::new([
            Replacement::new(0..5, "a"),
            Replacement::delete(10..16),
        ]);
        let applied = patch.apply(base);
        let inverse = patch.inverse(base);
        assert_eq!(inverse.apply(&applied), base);
    }

    #[test]
    fn test_random_rebase_commutes() {
        let mut rng = StdRng::seed_from_u64(404);
        let mut checked = 0;
        for _ in 0..200 {
            let base = random_text(&mut rng, 60);
            let a = random_patch(&mut rng, &base);
            let b = random_patch(&mut rng, &base);
            let (Some(b_rebased), Some(a_rebased)) = (b.try_rebase(&a), a.try_rebase(&b)) else {
                continue;
            };
            checked += 1;
            assert_eq!(
                b_rebased.apply(&a.apply(&base)),
                a_rebased.apply(&b.apply(&base)),
                "rebase of {:?} and {:?} over {:?} did not commute",
                a,
                b,
                base,
            );
        }
        assert!(checked > 20);
    }

    fn random_text(rng: &mut StdRng, max_len: usize) -> String {
        let len = rng.gen_range(0..=max_len);
        (0..len)
            .map(|_| (b'a' + rng.gen_range(0..26)) as char)
            .collect()
    }

    fn random_patch(rng: &mut StdRng, base: &str) -> Patch {
        let mut replacements = Vec::new();
        let mut pos = 0;
        while pos <= base.len() && replacements.len() < 4 {
            if rng.gen_bool(0.4) {
                let start = rng.gen_range(pos..=base.len());
                let end = rng.gen_range(start..=base.len());
                let new_text = random_text(rng, 6);
                if start != end || !new_text.is_empty() {
                    replacements.push(Replacement::new(start..end, new_text));
                }
                pos = end + 1;
            } else {
                pos += rng.gen_range(1..=4);
            }
        }
        Patch::new(replacements)
    }
}

// Copyright 2024 The Arbor Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Line-based diffing and three-way merge.
//!
//! The merge integrates an incoming change (`base` -> `theirs`) into a
//! locally modified text (`ours`). Regions changed on only one side take
//! that side; regions changed identically on both sides resolve. A region
//! both sides changed differently is re-merged at byte granularity, so
//! edits that touch the same line without overlapping within it still
//! integrate; only genuinely overlapping edits conflict, keeping the local
//! text and emitting the losing incoming hunk in patch-reject form. Inputs
//! are expected in repository normal form (LF line endings, keywords
//! contracted).

#![expect(missing_docs)]

use std::collections::HashMap;
use std::fmt::Write as _;
use std::hash::Hash;
use std::iter::Peekable;
use std::ops::Range;
use std::slice::Iter;

use bstr::BStr;
use bstr::BString;

/// Outcome of a three-way merge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// All changes integrated cleanly.
    Resolved(BString),
    /// Some incoming hunks lost to local modifications.
    Conflicted {
        /// The merged text: clean incoming hunks applied, conflicted regions
        /// keeping the local side.
        merged: BString,
        /// The losing incoming hunks, in patch-reject form. Never empty.
        reject: BString,
        conflict_count: usize,
    },
}

/// One changed region between two token sequences, as index ranges.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Change {
    base: Range<usize>,
    other: Range<usize>,
}

fn lines(text: &[u8]) -> Vec<&BStr> {
    text.split_inclusive(|&byte| byte == b'\n')
        .map(BStr::new)
        .collect()
}

/// Computes the changed regions turning `base` into `other`. Tokens are
/// lines for the outer merge and bytes for the intra-line refinement.
///
/// Common prefix and suffix are trimmed first; the remainder goes through a
/// longest-common-subsequence pass over interned tokens. Inputs too large
/// for the quadratic table fall back to one whole-region change.
fn diff_changes<T: Eq + Hash>(base: &[T], other: &[T]) -> Vec<Change> {
    let prefix = base
        .iter()
        .zip(other)
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = base[prefix..]
        .iter()
        .rev()
        .zip(other[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let base_mid = &base[prefix..base.len() - suffix];
    let other_mid = &other[prefix..other.len() - suffix];
    if base_mid.is_empty() && other_mid.is_empty() {
        return vec![];
    }

    const LCS_LIMIT: usize = 1 << 22;
    if base_mid.len().saturating_mul(other_mid.len()) > LCS_LIMIT {
        return vec![Change {
            base: prefix..base.len() - suffix,
            other: prefix..other.len() - suffix,
        }];
    }

    // Intern tokens so the LCS table compares small ids.
    let mut interner: HashMap<&T, u32> = HashMap::new();
    let mut base_ids = Vec::with_capacity(base_mid.len());
    for token in base_mid {
        let next = interner.len() as u32;
        base_ids.push(*interner.entry(token).or_insert(next));
    }
    let mut other_ids = Vec::with_capacity(other_mid.len());
    for token in other_mid {
        let next = interner.len() as u32;
        other_ids.push(*interner.entry(token).or_insert(next));
    }

    // Classic LCS table, then backtrack emitting maximal changed regions.
    let rows = base_ids.len();
    let cols = other_ids.len();
    let mut table = vec![0u32; (rows + 1) * (cols + 1)];
    for row in (0..rows).rev() {
        for col in (0..cols).rev() {
            table[row * (cols + 1) + col] = if base_ids[row] == other_ids[col] {
                table[(row + 1) * (cols + 1) + col + 1] + 1
            } else {
                table[(row + 1) * (cols + 1) + col].max(table[row * (cols + 1) + col + 1])
            };
        }
    }

    let mut changes = vec![];
    let mut row = 0;
    let mut col = 0;
    let mut pending: Option<(usize, usize)> = None;
    while row < rows || col < cols {
        if row < rows
            && col < cols
            && base_ids[row] == other_ids[col]
        {
            if let Some((base_start, other_start)) = pending.take() {
                changes.push(Change {
                    base: prefix + base_start..prefix + row,
                    other: prefix + other_start..prefix + col,
                });
            }
            row += 1;
            col += 1;
        } else {
            if pending.is_none() {
                pending = Some((row, col));
            }
            if col < cols
                && (row == rows
                    || table[row * (cols + 1) + col + 1] >= table[(row + 1) * (cols + 1) + col])
            {
                col += 1;
            } else {
                row += 1;
            }
        }
    }
    if let Some((base_start, other_start)) = pending {
        changes.push(Change {
            base: prefix + base_start..prefix + rows,
            other: prefix + other_start..prefix + cols,
        });
    }
    changes
}

/// The earliest base position either side changes next.
fn next_region_start(
    our_iter: &mut Peekable<Iter<'_, Change>>,
    their_iter: &mut Peekable<Iter<'_, Change>>,
) -> Option<usize> {
    [
        our_iter.peek().map(|change| change.base.start),
        their_iter.peek().map(|change| change.base.start),
    ]
    .into_iter()
    .flatten()
    .min()
}

/// Grows the region starting at `start` until no change on either side
/// straddles it, consuming the straddling changes. Returns the region's end
/// and each side's changes within it.
fn take_region<'c>(
    start: usize,
    our_iter: &mut Peekable<Iter<'c, Change>>,
    their_iter: &mut Peekable<Iter<'c, Change>>,
) -> (usize, Vec<&'c Change>, Vec<&'c Change>) {
    let mut hi = start;
    let mut ours_taken = vec![];
    let mut theirs_taken = vec![];
    loop {
        let mut extended = false;
        while let Some(change) = our_iter.peek()
            && change.base.start <= hi
        {
            hi = hi.max(change.base.end);
            ours_taken.push(our_iter.next().unwrap());
            extended = true;
        }
        while let Some(change) = their_iter.peek()
            && change.base.start <= hi
        {
            hi = hi.max(change.base.end);
            theirs_taken.push(their_iter.next().unwrap());
            extended = true;
        }
        if !extended {
            break;
        }
    }
    (hi, ours_taken, theirs_taken)
}

/// The side text corresponding to base region `lo..hi`, rebuilt from the
/// side's changes that fall inside the region.
fn side_region<'a>(
    lo: usize,
    hi: usize,
    base: &[&'a BStr],
    side: &[&'a BStr],
    changes: &[&Change],
) -> Vec<&'a BStr> {
    let mut out = vec![];
    let mut cursor = lo;
    for change in changes {
        out.extend_from_slice(&base[cursor..change.base.start]);
        out.extend_from_slice(&side[change.other.clone()]);
        cursor = change.base.end;
    }
    out.extend_from_slice(&base[cursor..hi]);
    out
}

/// Byte-level counterpart of [`side_region`].
fn byte_side_region(
    lo: usize,
    hi: usize,
    base: &[u8],
    side: &[u8],
    changes: &[&Change],
) -> BString {
    let mut out = BString::default();
    let mut cursor = lo;
    for change in changes {
        out.extend_from_slice(&base[cursor..change.base.start]);
        out.extend_from_slice(&side[change.other.clone()]);
        cursor = change.base.end;
    }
    out.extend_from_slice(&base[cursor..hi]);
    out
}

fn concat_lines(lines: &[&BStr]) -> BString {
    let mut out = BString::default();
    for line in lines {
        out.extend_from_slice(line);
    }
    out
}

/// Re-merges a both-sides-changed region at byte granularity. Returns the
/// merged bytes when the edits stay apart (or agree) within the region, or
/// `None` when they genuinely overlap.
fn merge_region_by_byte(base: &[u8], ours: &[u8], theirs: &[u8]) -> Option<BString> {
    let our_changes = diff_changes(base, ours);
    let their_changes = diff_changes(base, theirs);
    let mut merged = BString::default();
    let mut our_iter = our_changes.iter().peekable();
    let mut their_iter = their_changes.iter().peekable();
    let mut pos = 0;
    while let Some(start) = next_region_start(&mut our_iter, &mut their_iter) {
        let (hi, ours_taken, theirs_taken) = take_region(start, &mut our_iter, &mut their_iter);
        merged.extend_from_slice(&base[pos..start]);
        let our_bytes = byte_side_region(start, hi, base, ours, &ours_taken);
        let their_bytes = byte_side_region(start, hi, base, theirs, &theirs_taken);
        match (ours_taken.is_empty(), theirs_taken.is_empty()) {
            (true, false) => merged.extend_from_slice(&their_bytes),
            (false, true) => merged.extend_from_slice(&our_bytes),
            (false, false) if our_bytes == their_bytes => merged.extend_from_slice(&our_bytes),
            (false, false) => return None,
            (true, true) => unreachable!("region exists only when a side changed"),
        }
        pos = hi;
    }
    merged.extend_from_slice(&base[pos..]);
    Some(merged)
}

fn push_lines(out: &mut BString, lines: &[&BStr]) {
    for line in lines {
        out.extend_from_slice(line);
    }
}

/// Formats one losing incoming hunk in reject form.
fn reject_hunk(reject: &mut BString, lo: usize, base_lines: &[&BStr], their_lines: &[&BStr]) {
    let mut header = String::new();
    writeln!(
        header,
        "@@ -{},{} +{},{} @@",
        lo + 1,
        base_lines.len(),
        lo + 1,
        their_lines.len(),
    )
    .unwrap();
    reject.extend_from_slice(header.as_bytes());
    for line in base_lines {
        reject.push(b'-');
        reject.extend_from_slice(line);
        ensure_newline(reject);
    }
    for line in their_lines {
        reject.push(b'+');
        reject.extend_from_slice(line);
        ensure_newline(reject);
    }
}

fn ensure_newline(text: &mut BString) {
    if !text.ends_with(b"\n") {
        text.push(b'\n');
    }
}

/// Merges the incoming change `base -> theirs` into `ours`.
pub fn merge_three(base: &[u8], ours: &[u8], theirs: &[u8]) -> MergeOutcome {
    let base_lines = lines(base);
    let our_lines = lines(ours);
    let their_lines = lines(theirs);
    let our_changes = diff_changes(&base_lines, &our_lines);
    let their_changes = diff_changes(&base_lines, &their_lines);

    let mut merged = BString::default();
    let mut reject = BString::default();
    let mut conflict_count = 0;
    let mut our_iter = our_changes.iter().peekable();
    let mut their_iter = their_changes.iter().peekable();
    let mut pos = 0;

    while let Some(lo) = next_region_start(&mut our_iter, &mut their_iter) {
        let (hi, ours_taken, theirs_taken) = take_region(lo, &mut our_iter, &mut their_iter);
        push_lines(&mut merged, &base_lines[pos..lo]);
        let our_side = side_region(lo, hi, &base_lines, &our_lines, &ours_taken);
        let their_side = side_region(lo, hi, &base_lines, &their_lines, &theirs_taken);
        match (ours_taken.is_empty(), theirs_taken.is_empty()) {
            (true, false) => push_lines(&mut merged, &their_side),
            (false, true) => push_lines(&mut merged, &our_side),
            (false, false) if our_side == their_side => push_lines(&mut merged, &our_side),
            (false, false) => {
                // Both sides touched the region. Retry at byte granularity
                // before declaring a conflict; edits within the same line
                // integrate as long as they don't overlap.
                let region_base = concat_lines(&base_lines[lo..hi]);
                let region_ours = concat_lines(&our_side);
                let region_theirs = concat_lines(&their_side);
                match merge_region_by_byte(&region_base, &region_ours, &region_theirs) {
                    Some(resolved) => merged.extend_from_slice(&resolved),
                    None => {
                        // Local side wins; the incoming hunk goes to the
                        // reject.
                        push_lines(&mut merged, &our_side);
                        reject_hunk(&mut reject, lo, &base_lines[lo..hi], &their_side);
                        conflict_count += 1;
                    }
                }
            }
            (true, true) => unreachable!("region exists only when a side changed"),
        }
        pos = hi;
    }
    push_lines(&mut merged, &base_lines[pos..]);

    if conflict_count == 0 {
        MergeOutcome::Resolved(merged)
    } else {
        MergeOutcome::Conflicted {
            merged,
            reject,
            conflict_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::*;

    fn changes(base: &[u8], other: &[u8]) -> Vec<Change> {
        diff_changes(&lines(base), &lines(other))
    }

    #[test]
    fn test_diff_changes_identical() {
        assert_eq!(changes(b"a\nb\n", b"a\nb\n"), vec![]);
        assert_eq!(changes(b"", b""), vec![]);
    }

    #[test]
    fn test_diff_changes_replace_line() {
        assert_eq!(
            changes(b"a\nb\nc\n", b"a\nB\nc\n"),
            vec![Change {
                base: 1..2,
                other: 1..2
            }]
        );
    }

    #[test]
    fn test_diff_changes_insert_and_delete() {
        assert_eq!(
            changes(b"a\nc\n", b"a\nb\nc\n"),
            vec![Change {
                base: 1..1,
                other: 1..2
            }]
        );
        assert_eq!(
            changes(b"a\nb\nc\n", b"a\nc\n"),
            vec![Change {
                base: 1..2,
                other: 1..1
            }]
        );
    }

    #[test]
    fn test_diff_changes_multiple_regions() {
        let changed = changes(b"a\nb\nc\nd\ne\n", b"A\nb\nc\nd\nE\n");
        assert_eq!(
            changed,
            vec![
                Change {
                    base: 0..1,
                    other: 0..1
                },
                Change {
                    base: 4..5,
                    other: 4..5
                },
            ]
        );
    }

    #[test]
    fn test_diff_changes_by_byte() {
        assert_eq!(
            diff_changes(b"abc\n", b"aXbc\n"),
            vec![Change {
                base: 1..1,
                other: 1..2
            }]
        );
        assert_eq!(
            diff_changes(b"abc\n", b"abd\n"),
            vec![Change {
                base: 2..3,
                other: 2..3
            }]
        );
    }

    #[test]
    fn test_merge_disjoint_changes() {
        let base = b"a\nb\nc\n";
        let ours = b"a2\nb\nc\n";
        let theirs = b"a\nb\nc2\n";
        assert_eq!(
            merge_three(base, ours, theirs),
            MergeOutcome::Resolved("a2\nb\nc2\n".into())
        );
    }

    #[test]
    fn test_merge_within_a_single_line() {
        // Both sides rewrote the single line, but the local insertion and
        // the incoming change don't overlap within it: the byte-granular
        // pass integrates them cleanly.
        let base = b"abc\n";
        let ours = b"aXbc\n";
        let theirs = b"abd\n";
        assert_eq!(
            merge_three(base, ours, theirs),
            MergeOutcome::Resolved("aXbd\n".into())
        );
    }

    #[test]
    fn test_merge_single_line_overlap_conflicts() {
        // The same byte span changed differently on both sides: a real
        // conflict even at byte granularity.
        let base = b"abc\n";
        let ours = b"aZc\n";
        let theirs = b"aYc\n";
        let MergeOutcome::Conflicted {
            merged,
            reject,
            conflict_count,
        } = merge_three(base, ours, theirs)
        else {
            panic!("expected conflict");
        };
        assert_eq!(merged, "aZc\n");
        assert_eq!(conflict_count, 1);
        assert!(!reject.is_empty());
    }

    #[test]
    fn test_merge_same_change_both_sides() {
        let base = b"a\nb\n";
        let ours = b"a\nB\n";
        let theirs = b"a\nB\n";
        assert_eq!(
            merge_three(base, ours, theirs),
            MergeOutcome::Resolved("a\nB\n".into())
        );
    }

    #[test]
    fn test_merge_intra_line_edits_at_opposite_ends() {
        let base = b"hello\n";
        let ours = b"Xhello\n";
        let theirs = b"hello!\n";
        assert_eq!(
            merge_three(base, ours, theirs),
            MergeOutcome::Resolved("Xhello!\n".into())
        );
    }

    #[test]
    fn test_merge_conflict_keeps_ours_and_rejects_theirs() {
        let base = b"a\nb\nc\n";
        let ours = b"a\nZ\nc\n";
        let theirs = b"a\nY\nc\n";
        let MergeOutcome::Conflicted {
            merged,
            reject,
            conflict_count,
        } = merge_three(base, ours, theirs)
        else {
            panic!("expected conflict");
        };
        assert_eq!(merged, "a\nZ\nc\n");
        assert_eq!(conflict_count, 1);
        assert_eq!(
            reject,
            indoc! {"
                @@ -2,1 +2,1 @@
                -b
                +Y
            "}
        );
    }

    #[test]
    fn test_merge_only_theirs_changed() {
        let base = b"one\ntwo\nthree\n";
        let theirs = b"one\n2\nthree\n";
        assert_eq!(
            merge_three(base, base, theirs),
            MergeOutcome::Resolved("one\n2\nthree\n".into())
        );
    }

    #[test]
    fn test_merge_insertions_at_different_spots() {
        let base = b"a\nb\nc\nd\n";
        let ours = b"start\na\nb\nc\nd\n";
        let theirs = b"a\nb\nc\nd\nend\n";
        assert_eq!(
            merge_three(base, ours, theirs),
            MergeOutcome::Resolved("start\na\nb\nc\nd\nend\n".into())
        );
    }

    #[test]
    fn test_merge_conflicting_insertions_at_same_spot() {
        let base = b"a\nb\n";
        let ours = b"a\nX\nb\n";
        let theirs = b"a\nY\nb\n";
        let MergeOutcome::Conflicted { merged, reject, .. } = merge_three(base, ours, theirs)
        else {
            panic!("expected conflict");
        };
        assert_eq!(merged, "a\nX\nb\n");
        assert!(!reject.is_empty());
    }
}

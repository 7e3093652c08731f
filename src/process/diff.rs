// src/process/diff.rs
//! Line-level diff (LCS) between the prior snapshot and the new text.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "line", rename_all = "snake_case")]
pub enum DiffLine {
    Same(String),
    Added(String),
    Removed(String),
}

/// Above this many cells the LCS table is skipped and the diff degrades to
/// "everything removed, everything added".
const MAX_TABLE_CELLS: usize = 4_000_000;

pub fn diff_lines(old: &str, new: &str) -> Vec<DiffLine> {
    let a: Vec<&str> = old.lines().collect();
    let b: Vec<&str> = new.lines().collect();

    // Common prefix/suffix keep the table small for typical small edits.
    let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let (am, bm) = (&a[prefix..a.len() - suffix], &b[prefix..b.len() - suffix]);

    let mut out: Vec<DiffLine> = a[..prefix].iter().map(|l| DiffLine::Same(l.to_string())).collect();

    if am.len().saturating_mul(bm.len()) > MAX_TABLE_CELLS {
        out.extend(am.iter().map(|l| DiffLine::Removed(l.to_string())));
        out.extend(bm.iter().map(|l| DiffLine::Added(l.to_string())));
    } else {
        let (n, m) = (am.len(), bm.len());
        let mut t = vec![0u32; (n + 1) * (m + 1)];
        let idx = |i: usize, j: usize| i * (m + 1) + j;
        for i in (0..n).rev() {
            for j in (0..m).rev() {
                t[idx(i, j)] = if am[i] == bm[j] {
                    t[idx(i + 1, j + 1)] + 1
                } else {
                    t[idx(i + 1, j)].max(t[idx(i, j + 1)])
                };
            }
        }
        let (mut i, mut j) = (0, 0);
        while i < n && j < m {
            if am[i] == bm[j] {
                out.push(DiffLine::Same(am[i].to_string()));
                i += 1;
                j += 1;
            } else if t[idx(i + 1, j)] >= t[idx(i, j + 1)] {
                out.push(DiffLine::Removed(am[i].to_string()));
                i += 1;
            } else {
                out.push(DiffLine::Added(bm[j].to_string()));
                j += 1;
            }
        }
        out.extend(am[i..].iter().map(|l| DiffLine::Removed(l.to_string())));
        out.extend(bm[j..].iter().map(|l| DiffLine::Added(l.to_string())));
    }

    out.extend(a[a.len() - suffix..].iter().map(|l| DiffLine::Same(l.to_string())));
    out
}

pub fn added(lines: &[DiffLine]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|l| match l {
            DiffLine::Added(s) => Some(s.clone()),
            _ => None,
        })
        .collect()
}

pub fn removed(lines: &[DiffLine]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|l| match l {
            DiffLine::Removed(s) => Some(s.clone()),
            _ => None,
        })
        .collect()
}

/// Changed lines only, prefixed `(added)` / `(removed)`.
pub fn render_changes(lines: &[DiffLine]) -> String {
    lines
        .iter()
        .filter_map(|l| match l {
            DiffLine::Added(s) => Some(format!("(added) {s}")),
            DiffLine::Removed(s) => Some(format!("(removed) {s}")),
            DiffLine::Same(_) => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_has_no_changes() {
        let d = diff_lines("a\nb\nc", "a\nb\nc");
        assert!(added(&d).is_empty() && removed(&d).is_empty());
        assert_eq!(d.len(), 3);
    }

    #[test]
    fn middle_edit_is_minimal() {
        let d = diff_lines("title\nprice 10\nfooter", "title\nprice 12\nfooter");
        assert_eq!(removed(&d), vec!["price 10"]);
        assert_eq!(added(&d), vec!["price 12"]);
        assert_eq!(render_changes(&d), "(removed) price 10\n(added) price 12");
    }

    #[test]
    fn insertions_and_empty_inputs() {
        let d = diff_lines("", "x\ny");
        assert_eq!(added(&d), vec!["x", "y"]);
        let d = diff_lines("a\nc", "a\nb\nc");
        assert_eq!(d[1], DiffLine::Added("b".into()));
    }
}

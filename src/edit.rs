//! The edit engine: targeted string replacement with tiered matching.
//!
//! Each edit is matched against the current content in three tiers:
//! exact, whitespace-normalized, then fuzzy (normalized Levenshtein over
//! a sliding line window). Edits that match nowhere aggregate into one
//! error so callers see every failure at once.

use similar::TextDiff;
use strsim::normalized_levenshtein;

use crate::error::{NexusError, NexusResult};

/// One requested replacement.
#[derive(Debug, Clone)]
pub struct EditRequest {
    pub old_str: String,
    pub new_str: String,
    /// 1-based line near which the match is expected; breaks ties.
    pub hint_line: Option<usize>,
    /// Replace every occurrence instead of requiring a unique one.
    pub allow_multiple: bool,
}

impl EditRequest {
    pub fn new(old_str: impl Into<String>, new_str: impl Into<String>) -> Self {
        Self { old_str: old_str.into(), new_str: new_str.into(), hint_line: None, allow_multiple: false }
    }

    pub fn near_line(mut self, line: usize) -> Self {
        self.hint_line = Some(line);
        self
    }

    pub fn multiple(mut self) -> Self {
        self.allow_multiple = true;
        self
    }
}

/// Which tier satisfied an edit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MatchTier {
    Exact,
    WhitespaceNormalized,
    Fuzzy,
}

/// Where and how one edit landed.
#[derive(Debug, Clone)]
pub struct EditMatch {
    pub tier: MatchTier,
    /// 1-based line of the replacement.
    pub line: usize,
    pub replaced: usize,
    /// Similarity of the matched window, 1.0 for the exact tier.
    pub score: f64,
}

/// Result of applying a batch of edits.
#[derive(Debug, Clone)]
pub struct EditOutcome {
    pub content: String,
    pub matches: Vec<EditMatch>,
    pub diff: String,
    pub applied_count: usize,
}

/// Applies `edits` in order. `fuzzy_threshold` of 1.0 disables the fuzzy
/// tier in practice: only exact and whitespace-normalized matches score
/// that high.
pub fn apply_edits(
    content: &str,
    edits: &[EditRequest],
    fuzzy_threshold: f64,
) -> NexusResult<EditOutcome> {
    let mut current = content.to_owned();
    let mut matches = Vec::with_capacity(edits.len());
    let mut failures: Vec<String> = Vec::new();

    for (index, edit) in edits.iter().enumerate() {
        if edit.old_str.is_empty() {
            failures.push(format!("edit {index}: old_str is empty"));
            continue;
        }
        match apply_one(&current, edit, fuzzy_threshold) {
            Some((next, matched)) => {
                current = next;
                matches.push(matched);
            }
            None => {
                failures.push(format!(
                    "edit {index}: no match for {:?}",
                    truncate(&edit.old_str, 80)
                ));
            }
        }
    }

    if !failures.is_empty() {
        return Err(NexusError::validation(format!(
            "{} edit(s) failed: {}",
            failures.len(),
            failures.join("; ")
        )));
    }

    let diff = TextDiff::from_lines(content, &current)
        .unified_diff()
        .context_radius(3)
        .to_string();
    let applied_count = matches.len();
    Ok(EditOutcome { content: current, matches, diff, applied_count })
}

fn apply_one(content: &str, edit: &EditRequest, threshold: f64) -> Option<(String, EditMatch)> {
    // Tier 1: exact.
    let occurrences: Vec<usize> = content.match_indices(&edit.old_str).map(|(i, _)| i).collect();
    match occurrences.len() {
        0 => {}
        1 => {
            let line = line_of_offset(content, occurrences[0]);
            let next = content.replacen(&edit.old_str, &edit.new_str, 1);
            return Some((next, EditMatch { tier: MatchTier::Exact, line, replaced: 1, score: 1.0 }));
        }
        n if edit.allow_multiple => {
            let line = line_of_offset(content, occurrences[0]);
            let next = content.replace(&edit.old_str, &edit.new_str);
            return Some((
                next,
                EditMatch { tier: MatchTier::Exact, line, replaced: n, score: 1.0 },
            ));
        }
        _ => match edit.hint_line {
            // Ambiguous: a hint picks the occurrence nearest to it.
            Some(hint) => {
                let nearest = occurrences
                    .iter()
                    .copied()
                    .min_by_key(|&offset| line_of_offset(content, offset).abs_diff(hint))?;
                let line = line_of_offset(content, nearest);
                let mut next = String::with_capacity(content.len());
                next.push_str(&content[..nearest]);
                next.push_str(&edit.new_str);
                next.push_str(&content[nearest + edit.old_str.len()..]);
                return Some((
                    next,
                    EditMatch { tier: MatchTier::Exact, line, replaced: 1, score: 1.0 },
                ));
            }
            None => return None,
        },
    }

    // Tiers 2 and 3 work on line windows.
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    let old_lines: Vec<&str> = edit.old_str.split('\n').collect();
    let window = old_lines.len();
    if window == 0 || lines.is_empty() || window > lines.len() {
        return None;
    }

    let normalized_old = normalize_whitespace(&edit.old_str);
    let mut fuzzy_best: Option<(usize, f64)> = None;

    for start in 0..=(lines.len() - window) {
        let candidate: String = lines[start..start + window].concat();
        let candidate_trimmed = candidate.strip_suffix('\n').unwrap_or(&candidate);

        // Tier 2: whitespace-normalized equality.
        if normalize_whitespace(candidate_trimmed) == normalized_old {
            let next = splice_lines(&lines, start, window, &edit.new_str, candidate.ends_with('\n'));
            return Some((
                next,
                EditMatch {
                    tier: MatchTier::WhitespaceNormalized,
                    line: start + 1,
                    replaced: 1,
                    score: 1.0,
                },
            ));
        }

        // Tier 3: best fuzzy candidate, hint-aware on ties.
        let score = normalized_levenshtein(candidate_trimmed, &edit.old_str);
        if score >= threshold && threshold < 1.0 {
            let better = match fuzzy_best {
                None => true,
                Some((best_start, best_score)) => {
                    score > best_score
                        || (score == best_score
                            && closer_to_hint(edit.hint_line, start + 1, best_start + 1))
                }
            };
            if better {
                fuzzy_best = Some((start, score));
            }
        }
    }

    let (start, score) = fuzzy_best?;
    let candidate: String = lines[start..start + window].concat();
    let next = splice_lines(&lines, start, window, &edit.new_str, candidate.ends_with('\n'));
    Some((next, EditMatch { tier: MatchTier::Fuzzy, line: start + 1, replaced: 1, score }))
}

fn closer_to_hint(hint: Option<usize>, candidate_line: usize, incumbent_line: usize) -> bool {
    match hint {
        Some(hint) => candidate_line.abs_diff(hint) < incumbent_line.abs_diff(hint),
        None => false,
    }
}

fn splice_lines(
    lines: &[&str],
    start: usize,
    window: usize,
    replacement: &str,
    trailing_newline: bool,
) -> String {
    let mut out = String::new();
    for line in &lines[..start] {
        out.push_str(line);
    }
    out.push_str(replacement);
    if trailing_newline && !replacement.ends_with('\n') {
        out.push('\n');
    }
    for line in &lines[start + window..] {
        out.push_str(line);
    }
    out
}

fn normalize_whitespace(text: &str) -> String {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_owned()
}

fn line_of_offset(content: &str, offset: usize) -> usize {
    content[..offset].matches('\n').count() + 1
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NexusError;

    #[test]
    fn test_exact_match_replaces_once() {
        let outcome =
            apply_edits("fn main() {}\n", &[EditRequest::new("main", "start")], 0.8).unwrap();
        assert_eq!(outcome.content, "fn start() {}\n");
        assert_eq!(outcome.matches[0].tier, MatchTier::Exact);
        assert_eq!(outcome.applied_count, 1);
        assert!(outcome.diff.contains("-fn main() {}"));
    }

    #[test]
    fn test_ambiguous_exact_needs_allow_multiple_or_hint() {
        let content = "let x = 1;\nlet x = 1;\n";
        let err = apply_edits(content, &[EditRequest::new("let x = 1;", "let y = 2;")], 0.8)
            .unwrap_err();
        assert!(matches!(err, NexusError::ValidationError { .. }));

        let all = apply_edits(
            content,
            &[EditRequest::new("let x = 1;", "let y = 2;").multiple()],
            0.8,
        )
        .unwrap();
        assert_eq!(all.content, "let y = 2;\nlet y = 2;\n");
        assert_eq!(all.matches[0].replaced, 2);

        let hinted = apply_edits(
            content,
            &[EditRequest::new("let x = 1;", "let y = 2;").near_line(2)],
            0.8,
        )
        .unwrap();
        assert_eq!(hinted.content, "let x = 1;\nlet y = 2;\n");
    }

    #[test]
    fn test_whitespace_normalized_tier() {
        let content = "if  x   ==  1 {\n";
        let outcome =
            apply_edits(content, &[EditRequest::new("if x == 1 {", "if x == 2 {")], 1.0).unwrap();
        assert_eq!(outcome.content, "if x == 2 {\n");
        assert_eq!(outcome.matches[0].tier, MatchTier::WhitespaceNormalized);
    }

    #[test]
    fn test_fuzzy_tier_respects_threshold() {
        let content = "let total_amount = compute();\n";
        // One-character typo in the needle.
        let edit = EditRequest::new("let total_amuont = compute();", "let total = compute();");

        let fuzzy = apply_edits(content, &[edit.clone()], 0.8).unwrap();
        assert_eq!(fuzzy.matches[0].tier, MatchTier::Fuzzy);
        assert!(fuzzy.matches[0].score >= 0.8);
        assert_eq!(fuzzy.content, "let total = compute();\n");

        // Threshold 1.0 disables fuzzy matching entirely.
        assert!(apply_edits(content, &[edit], 1.0).is_err());
    }

    #[test]
    fn test_multiline_window_replacement() {
        let content = "fn a() {\n    1\n}\nfn b() {}\n";
        let outcome = apply_edits(
            content,
            &[EditRequest::new("fn a() {\n    1\n}", "fn a() {\n    2\n}")],
            0.8,
        )
        .unwrap();
        assert_eq!(outcome.content, "fn a() {\n    2\n}\nfn b() {}\n");
    }

    #[test]
    fn test_failures_aggregate() {
        let content = "hello\n";
        let err = apply_edits(
            content,
            &[
                EditRequest::new("nope-1", "x"),
                EditRequest::new("hello", "hi"),
                EditRequest::new("nope-2", "y"),
            ],
            0.9,
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("2 edit(s) failed"));
        assert!(message.contains("nope-1"));
        assert!(message.contains("nope-2"));
    }

    #[test]
    fn test_edits_apply_sequentially() {
        let content = "a\nb\n";
        let outcome = apply_edits(
            content,
            &[EditRequest::new("a", "b"), EditRequest::new("b\nb", "c\nc")],
            0.8,
        )
        .unwrap();
        assert_eq!(outcome.content, "c\nc\n");
        assert_eq!(outcome.applied_count, 2);
    }
}

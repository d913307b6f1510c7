//! Fuzzy location of a search block inside file content
//!
//! Strategies run in order: exact substring, line-trimmed whitespace-normalized
//! match, then a sliding line window scored by edit distance over block length.

use serde::Serialize;

/// Accept an edit-distance window only below this relative distance
pub const DEFAULT_THRESHOLD: f64 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Exact,
    WhitespaceNormalized,
    EditDistance,
}

/// Byte range `[start, end)` of the matched region in the content
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FuzzyMatch {
    pub start: usize,
    pub end: usize,
    /// Edit distance over search length; 0 for exact matches
    pub distance: f64,
    pub strategy: MatchStrategy,
}

struct Line<'a> {
    start: usize,
    /// Excludes the line terminator
    end: usize,
    text: &'a str,
}

fn split_lines(content: &str) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    let mut offset = 0;
    for raw in content.split_inclusive('\n') {
        let text = raw.strip_suffix('\n').unwrap_or(raw);
        let text = text.strip_suffix('\r').unwrap_or(text);
        lines.push(Line {
            start: offset,
            end: offset + text.len(),
            text,
        });
        offset += raw.len();
    }
    lines
}

/// Search block lines with leading and trailing blank lines dropped
fn search_lines(search: &str) -> Vec<&str> {
    let lines: Vec<&str> = search.lines().collect();
    let first = lines.iter().position(|l| !l.trim().is_empty());
    let last = lines.iter().rposition(|l| !l.trim().is_empty());
    match (first, last) {
        (Some(f), Some(l)) => lines[f..=l].to_vec(),
        _ => Vec::new(),
    }
}

fn relative_distance(a: &str, b: &str) -> f64 {
    let len = b.chars().count().max(1);
    strsim::levenshtein(a, b) as f64 / len as f64
}

/// Find the region of `content` that best matches `search`
pub fn fuzzy_find(content: &str, search: &str, threshold: f64) -> Option<FuzzyMatch> {
    if search.is_empty() {
        return None;
    }

    if let Some(start) = content.find(search) {
        return Some(FuzzyMatch {
            start,
            end: start + search.len(),
            distance: 0.0,
            strategy: MatchStrategy::Exact,
        });
    }

    let needle = search_lines(search);
    if needle.is_empty() {
        return None;
    }
    let lines = split_lines(content);
    let n = needle.len();
    if lines.len() < n {
        return find_by_edit_distance(&lines, content, &needle, threshold);
    }

    for i in 0..=lines.len() - n {
        let window = &lines[i..i + n];
        if window
            .iter()
            .zip(&needle)
            .all(|(l, s)| l.text.trim() == s.trim())
        {
            let start = window[0].start;
            let end = window[n - 1].end;
            return Some(FuzzyMatch {
                start,
                end,
                distance: relative_distance(&content[start..end], search.trim_matches('\n')),
                strategy: MatchStrategy::WhitespaceNormalized,
            });
        }
    }

    find_by_edit_distance(&lines, content, &needle, threshold)
}

fn find_by_edit_distance(
    lines: &[Line<'_>],
    content: &str,
    needle: &[&str],
    threshold: f64,
) -> Option<FuzzyMatch> {
    if lines.is_empty() {
        return None;
    }
    let target = needle.join("\n");
    let n = needle.len();
    let mut best: Option<FuzzyMatch> = None;

    // Windows one line shorter and longer catch an added or dropped line
    for size in [n.saturating_sub(1), n, n + 1] {
        if size == 0 || size > lines.len() {
            continue;
        }
        for i in 0..=lines.len() - size {
            let window = &lines[i..i + size];
            let text: Vec<&str> = window.iter().map(|l| l.text).collect();
            let distance = relative_distance(&text.join("\n"), &target);
            if distance >= threshold {
                continue;
            }
            if best.as_ref().map_or(true, |b| distance < b.distance) {
                let start = window[0].start;
                let end = window[size - 1].end;
                debug_assert!(end <= content.len());
                best = Some(FuzzyMatch {
                    start,
                    end,
                    distance,
                    strategy: MatchStrategy::EditDistance,
                });
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = "fn main() {\n    let x = 1;\n    println!(\"{x}\");\n}\n";

    #[test]
    fn test_exact_match_offsets() {
        let m = fuzzy_find(SRC, "let x = 1;", DEFAULT_THRESHOLD).unwrap();
        assert_eq!(m.strategy, MatchStrategy::Exact);
        assert_eq!(m.distance, 0.0);
        assert_eq!(&SRC[m.start..m.end], "let x = 1;");
        assert_eq!(m.start, SRC.find("let x").unwrap());
    }

    #[test]
    fn test_whitespace_normalized() {
        let search = "let x = 1;\nprintln!(\"{x}\");";
        let m = fuzzy_find(SRC, search, DEFAULT_THRESHOLD).unwrap();
        assert_eq!(m.strategy, MatchStrategy::WhitespaceNormalized);
        assert_eq!(
            &SRC[m.start..m.end],
            "    let x = 1;\n    println!(\"{x}\");"
        );
    }

    #[test]
    fn test_edit_distance_small_typo() {
        let search = "    let x = 1;\n    printn!(\"{x}\");";
        let m = fuzzy_find(SRC, search, DEFAULT_THRESHOLD).unwrap();
        assert_eq!(m.strategy, MatchStrategy::EditDistance);
        assert!(m.distance > 0.0 && m.distance < DEFAULT_THRESHOLD);
        assert!(SRC[m.start..m.end].contains("println!"));
    }

    #[test]
    fn test_far_off_block_rejected() {
        assert!(fuzzy_find(SRC, "completely unrelated text here", DEFAULT_THRESHOLD).is_none());
    }

    #[test]
    fn test_empty_search() {
        assert!(fuzzy_find(SRC, "", DEFAULT_THRESHOLD).is_none());
        assert!(fuzzy_find(SRC, "\n\n", DEFAULT_THRESHOLD).is_none());
    }

    #[test]
    fn test_distance_at_threshold_rejected() {
        // one edit over four chars is exactly 0.25
        assert!(fuzzy_find("abce\n", "abcd", 0.25).is_none());
        let m = fuzzy_find("abce\n", "abcd", 0.26).unwrap();
        assert_eq!(m.strategy, MatchStrategy::EditDistance);
        assert_eq!(m.distance, 0.25);
    }

    #[test]
    fn test_best_window_chosen() {
        let content = "alpha beta gamma\nalpha beta gamma delta\n";
        let m = fuzzy_find(content, "alpha beta gama delta", DEFAULT_THRESHOLD).unwrap();
        assert_eq!(&content[m.start..m.end], "alpha beta gamma delta");
    }
}

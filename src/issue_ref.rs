//! Extraction of issue references from commit messages and merge-request
//! text.
//!
//! Commit messages and merge-request descriptions are scanned line by line;
//! the first line carrying a recognized reference wins. Matching is
//! case-sensitive and anchored at the start of the (trimmed) line, which is
//! how the tracker itself renders closing references.

/// Closing-keyword prefixes, in match priority order.
const KEYWORD_PREFIXES: [&str; 4] = ["Fix #", "Closes #", "Resolves #", "Fixes #"];

/// Back-reference the tracker appends to squash-merge commit messages.
const MERGE_REQUEST_BACKREF: &str = "See merge request ";

/// Extract the first issue reference from free-form text.
///
/// Recognized per line: `Fix #<n>`, `Closes #<n>`, `Resolves #<n>`,
/// `Fixes #<n>`, a bare `#<n>`, and the back-reference
/// `See merge request <path>!<n>`. Returns `None` when nothing matches;
/// an unreferenced commit is not an error.
pub fn extract_issue_ref(text: &str) -> Option<i64> {
    text.lines().find_map(|line| match_line(line.trim()))
}

/// Extract an issue reference from a merge request.
///
/// The description is scanned first with the full pattern set; if it yields
/// nothing, the title is searched (anywhere, not just at the start) for
/// `Fix #<n>` and then a bare `#<n>`.
pub fn extract_issue_ref_from_merge_request(title: &str, description: &str) -> Option<i64> {
    if let Some(id) = extract_issue_ref(description) {
        return Some(id);
    }
    if let Some(pos) = title.find("Fix #") {
        if let Some(id) = leading_number(&title[pos + "Fix #".len()..]) {
            return Some(id);
        }
    }
    if let Some(pos) = title.find('#') {
        if let Some(id) = leading_number(&title[pos + 1..]) {
            return Some(id);
        }
    }
    None
}

fn match_line(line: &str) -> Option<i64> {
    for prefix in KEYWORD_PREFIXES {
        if let Some(rest) = line.strip_prefix(prefix) {
            if let Some(id) = leading_number(rest) {
                return Some(id);
            }
        }
    }
    if let Some(rest) = line.strip_prefix('#') {
        if let Some(id) = leading_number(rest) {
            return Some(id);
        }
    }
    if let Some(rest) = line.strip_prefix(MERGE_REQUEST_BACKREF) {
        if let Some((_, after_bang)) = rest.rsplit_once('!') {
            if let Some(id) = leading_number(after_bang) {
                return Some(id);
            }
        }
    }
    None
}

/// Parse the run of ASCII digits at the start of `s`. Trailing text is
/// ignored; no digits (or an overflow) is no match.
fn leading_number(s: &str) -> Option<i64> {
    let end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    s[..end].parse().ok()
}

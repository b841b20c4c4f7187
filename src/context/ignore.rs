//! `.dockerignore`-style pattern matching.
//!
//! Faithfully reproduces standard dockerignore semantics: patterns are
//! gitignore-like globs rooted at the context root, later patterns override
//! earlier ones, and a leading `!` negates a match. This implementation
//! does not attempt to special-case the documented podman `[...]`
//! character-class incompatibility with other builders — that divergence
//! is left as-is rather than silently papered over (see `IgnoreSet::new`'s
//! doc comment).

use regex::Regex;

#[derive(Debug, Clone)]
struct Pattern {
    regex: Regex,
    negate: bool,
    /// Anchored to the context root (pattern contained a `/` other than a
    /// trailing one) vs. matchable at any depth.
    anchored: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    patterns: Vec<Pattern>,
}

impl IgnoreSet {
    /// Builds an ignore set from `.dockerignore`-style pattern lines.
    /// Blank lines and `#`-comments are skipped.
    ///
    /// Builder incompatibility note: podman's `[...]` character-class
    /// handling diverges from the Go `dockerignore`/`filepath.Match`
    /// reference behaviour this implementation follows. Callers that need
    /// byte-for-byte builder parity should treat character classes as
    /// advisory.
    pub fn new(patterns: &[String]) -> Result<Self, String> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let raw = raw.trim();
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }
            let (negate, pat) = match raw.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, raw),
            };
            let pat = pat.trim_start_matches("./");
            let anchored = pat.trim_end_matches('/').contains('/');
            let regex_src = glob_to_regex(pat);
            let regex = Regex::new(&regex_src)
                .map_err(|e| format!("invalid ignore pattern '{}': {}", raw, e))?;
            compiled.push(Pattern {
                regex,
                negate,
                anchored,
            });
        }
        Ok(IgnoreSet { patterns: compiled })
    }

    /// Returns true if `relative_path` (forward-slash separated, relative to
    /// the context root) is ignored. Patterns are evaluated in order; the
    /// last matching pattern (match or negated-match) wins, matching
    /// dockerignore's documented last-match-wins semantics.
    pub fn is_ignored(&self, relative_path: &str) -> bool {
        let mut ignored = false;
        for p in &self.patterns {
            let candidate: &str = if p.anchored {
                relative_path
            } else {
                relative_path.rsplit('/').next().unwrap_or(relative_path)
            };
            let full_match = p.regex.is_match(relative_path);
            let base_match = !p.anchored && p.regex.is_match(candidate);
            if full_match || base_match {
                ignored = !p.negate;
            }
        }
        ignored
    }
}

/// Converts a single dockerignore glob pattern into an anchored regex.
/// Supports `*` (any run of non-separator chars), `**` (any run including
/// separators), `?` (single char), and `[...]` character classes passed
/// through to the regex engine largely as-is.
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                if i + 1 < chars.len() && chars[i + 1] == '*' {
                    out.push_str(".*");
                    i += 2;
                    // swallow an immediately following separator so `**/`
                    // can also match zero directories.
                    if i < chars.len() && chars[i] == '/' {
                        i += 1;
                    }
                } else {
                    out.push_str("[^/]*");
                    i += 1;
                }
            }
            '?' => {
                out.push_str("[^/]");
                i += 1;
            }
            '[' => {
                let close = chars[i..].iter().position(|&c| c == ']').map(|p| p + i);
                if let Some(close) = close {
                    out.push('[');
                    out.extend(&chars[i + 1..close]);
                    out.push(']');
                    i = close + 1;
                } else {
                    out.push_str("\\[");
                    i += 1;
                }
            }
            c if "\\.+^$()|{}".contains(c) => {
                out.push('\\');
                out.push(c);
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out.push_str("(/.*)?$");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_within_a_single_component() {
        let set = IgnoreSet::new(&["*.log".to_string()]).unwrap();
        assert!(set.is_ignored("debug.log"));
        assert!(set.is_ignored("sub/debug.log"));
        assert!(!set.is_ignored("debug.txt"));
    }

    #[test]
    fn doublestar_matches_across_directories() {
        let set = IgnoreSet::new(&["**/node_modules".to_string()]).unwrap();
        assert!(set.is_ignored("node_modules"));
        assert!(set.is_ignored("pkg/node_modules"));
        assert!(set.is_ignored("pkg/sub/node_modules"));
    }

    #[test]
    fn negation_overrides_a_broad_match_for_specific_paths() {
        let set = IgnoreSet::new(&["*".to_string(), "!keep".to_string(), "!sub/keep".to_string()]).unwrap();
        assert!(set.is_ignored("a"));
        assert!(!set.is_ignored("keep"));
        assert!(!set.is_ignored("sub/keep"));
        assert!(set.is_ignored("sub/other"));
    }

    #[test]
    fn last_matching_pattern_wins() {
        let set = IgnoreSet::new(&["!important".to_string(), "important".to_string()]).unwrap();
        assert!(set.is_ignored("important"));
    }
}

//! Ignore-pattern matching contract.
//!
//! Pattern compilation and the full matching language live in the matcher
//! subsystem; the controller only reloads patterns, compares pattern hashes
//! across scans and pulls, and asks whether a path is ignored.

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use crate::paths;

pub trait IgnoreMatcher: Send + Sync {
    /// Reload patterns from the named file inside the folder. A missing file
    /// is reported as `io::ErrorKind::NotFound` and means "no patterns".
    fn load(&self, name: &str) -> io::Result<()>;

    /// Hash of the currently loaded pattern set. Controllers compare hashes
    /// around scans and pulls to detect pattern edits.
    fn hash(&self) -> String;

    fn is_ignored(&self, path: &str) -> bool;
}

/// Fixed-rule matcher backed by an in-memory pattern list.
///
/// Rules are matched first-wins, a leading `!` negates, and a rule covers the
/// named path and everything beneath it. Used by tests and by hosts without a
/// pattern file.
#[derive(Default)]
pub struct StaticMatcher {
    inner: Mutex<MatcherState>,
}

#[derive(Default)]
struct MatcherState {
    patterns: Vec<String>,
    /// Pattern sets to adopt on subsequent `load` calls.
    pending: VecDeque<Vec<String>>,
    load_error: Option<io::ErrorKind>,
}

impl StaticMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let m = Self::new();
        m.set_patterns(patterns);
        m
    }

    pub fn set_patterns<I, S>(&self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.inner.lock().expect("matcher state poisoned");
        state.patterns = patterns.into_iter().map(Into::into).collect();
    }

    /// Queue a pattern set that replaces the current one on the next `load`.
    pub fn queue_patterns<I, S>(&self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.inner.lock().expect("matcher state poisoned");
        state
            .pending
            .push_back(patterns.into_iter().map(Into::into).collect());
    }

    pub fn set_load_error(&self, kind: Option<io::ErrorKind>) {
        self.inner.lock().expect("matcher state poisoned").load_error = kind;
    }
}

impl IgnoreMatcher for StaticMatcher {
    fn load(&self, name: &str) -> io::Result<()> {
        let mut state = self.inner.lock().expect("matcher state poisoned");
        if let Some(kind) = state.load_error {
            return Err(io::Error::new(kind, format!("loading {name}")));
        }
        if let Some(next) = state.pending.pop_front() {
            state.patterns = next;
        }
        Ok(())
    }

    fn hash(&self) -> String {
        self.inner
            .lock()
            .expect("matcher state poisoned")
            .patterns
            .join("\n")
    }

    fn is_ignored(&self, path: &str) -> bool {
        let state = self.inner.lock().expect("matcher state poisoned");
        for pattern in &state.patterns {
            let (negated, pat) = match pattern.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, pattern.as_str()),
            };
            if path == pat || paths::is_parent(path, pat) {
                return !negated;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_match_wins() {
        let m = StaticMatcher::with_patterns(["!docs/keep.txt", "docs"]);
        assert!(m.is_ignored("docs"));
        assert!(m.is_ignored("docs/other.txt"));
        assert!(!m.is_ignored("docs/keep.txt"));
        assert!(!m.is_ignored("src/main.rs"));
    }

    #[test]
    fn load_adopts_queued_patterns_and_changes_hash() {
        let m = StaticMatcher::with_patterns(["a"]);
        let before = m.hash();
        m.queue_patterns(["a", "b"]);
        m.load(".stromignore").unwrap();
        assert_ne!(m.hash(), before);
        assert!(m.is_ignored("b"));
    }
}

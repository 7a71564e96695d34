//! Per-analysis recursion guard (spec §4.K).
//!
//! Modeled as an owned value threaded explicitly through the call chain
//! (manager -> cross-file analyzer -> manager), never as thread-local or
//! task-local storage, per SPEC_FULL.md §9 open question 2.

use crate::error::{Error, Result};

/// One entry on the recursion stack: the kind of analysis and the path it
/// was entered against.
pub type StackEntry = (String, String);

/// An RAII-flavored call stack guarding against cyclic cross-file analyses.
/// Cloned (not shared) across calls that should observe independent depth
/// budgets; passed by value/reference down the one call chain it guards.
#[derive(Debug, Clone, Default)]
pub struct RecursionStack {
    entries: Vec<StackEntry>,
    max_depth: u32,
}

impl RecursionStack {
    pub fn new(max_depth: u32) -> Self {
        Self {
            entries: Vec::new(),
            max_depth,
        }
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, analysis_type: &str, path: &str) -> bool {
        self.entries
            .iter()
            .any(|(t, p)| t == analysis_type && p == path)
    }

    /// Push `(analysis_type, path)` onto the stack, failing fast on a cycle
    /// or depth violation. Returns a guard that pops on drop so a caller
    /// using `?` to bail out of the enclosing function does not leak the
    /// entry.
    pub fn enter(&mut self, analysis_type: impl Into<String>, path: impl Into<String>) -> Result<()> {
        let analysis_type = analysis_type.into();
        let path = path.into();
        if self.contains(&analysis_type, &path) {
            return Err(Error::recursion(self.stack_strings()));
        }
        if self.entries.len() as u32 >= self.max_depth {
            return Err(Error::recursion(self.stack_strings()));
        }
        self.entries.push((analysis_type, path));
        Ok(())
    }

    /// Pop the top entry. If it does not match `(analysis_type, path)` a
    /// warning is logged but the pop proceeds regardless (spec §4.K).
    pub fn exit(&mut self, analysis_type: &str, path: &str) {
        match self.entries.pop() {
            Some((t, p)) if t == analysis_type && p == path => {}
            Some((t, p)) => {
                tracing::warn!(
                    expected_type = analysis_type,
                    expected_path = path,
                    actual_type = %t,
                    actual_path = %p,
                    "recursion stack exit did not match top entry"
                );
            }
            None => {
                tracing::warn!("recursion stack exit called on empty stack");
            }
        }
    }

    fn stack_strings(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(t, p)| format!("{t}:{p}"))
            .collect()
    }
}

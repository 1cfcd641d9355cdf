// src/labels.rs
//
// =============================================================================
// DATALAB: LABEL NAMESPACE
// =============================================================================
//
// Every field exposed by the build has exactly one display label, and no two
// fields share one. The namespace is a snapshot: reserving a name does not
// record it. Use `claim` when several labels are handed out in one batch.

use crate::core::{Build, Label};
use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct LabelNamespace {
    used: HashSet<Label>,
}

impl LabelNamespace {
    pub fn of(build: &Build) -> Self {
        Self {
            used: build.labels().into_iter().collect(),
        }
    }

    /// Same as `of`, minus the label currently held by `field` of `step_index`.
    /// Used when a field is being renamed and may keep its own label.
    pub fn excluding(build: &Build, step_index: usize, field: &str) -> Self {
        let mut ns = Self::of(build);
        if let Some(step) = build.steps.get(step_index) {
            ns.used.remove(&step.label_of(field));
        }
        ns
    }

    pub fn is_used(&self, label: &str) -> bool {
        self.used.contains(label)
    }

    /// `candidate` if free, else `candidate_<n>` for the smallest free `n >= 1`.
    pub fn reserve(&self, candidate: &str) -> Label {
        if !self.is_used(candidate) {
            return candidate.to_string();
        }
        let mut n = 1usize;
        loop {
            let label = format!("{candidate}_{n}");
            if !self.is_used(&label) {
                return label;
            }
            n += 1;
        }
    }

    /// Reserve and record.
    pub fn claim(&mut self, candidate: &str) -> Label {
        let label = self.reserve(candidate);
        self.used.insert(label.clone());
        label
    }

    pub fn insert(&mut self, label: impl Into<Label>) {
        self.used.insert(label.into());
    }
}

/// Free-standing query for UI callers.
pub fn is_used(build: &Build, label: &str) -> bool {
    LabelNamespace::of(build).is_used(label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_suffixes_only_on_collision() {
        let mut ns = LabelNamespace::default();
        assert_eq!(ns.claim("x"), "x");
        assert_eq!(ns.claim("x"), "x_1");
        assert_eq!(ns.claim("x"), "x_2");
    }

    #[test]
    fn reserve_fills_the_smallest_gap() {
        let mut ns = LabelNamespace::default();
        ns.insert("x");
        ns.insert("x_2");
        assert_eq!(ns.reserve("x"), "x_1");
        assert!(!ns.is_used("x_1"));
    }
}

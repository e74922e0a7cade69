//! Shared call recorder for the deterministic fakes.
//!
//! The fake runtime, storage maintainer and node repository can all write
//! into the same recorder, so tests can assert the relative order of calls
//! across components (e.g. remove container → archive storage → mark ready).

use std::sync::{Arc, Mutex, MutexGuard};

/// One call observed by a fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// `runtime`, `storage` or `repository`.
    pub component: &'static str,
    pub operation: String,
    /// Container name or hostname the call was about.
    pub target: String,
}

impl RecordedCall {
    pub fn matches(&self, component: &str, operation: &str, target: &str) -> bool {
        self.component == component && self.operation == operation && self.target == target
    }
}

/// Cloneable handle to a shared, ordered call log.
#[derive(Debug, Clone, Default)]
pub struct CallRecorder {
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl CallRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RecordedCall>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, component: &'static str, operation: &str, target: &str) {
        self.lock().push(RecordedCall {
            component,
            operation: operation.to_string(),
            target: target.to_string(),
        });
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Calls made by one component.
    pub fn calls_for(&self, component: &str) -> Vec<RecordedCall> {
        self.lock()
            .iter()
            .filter(|c| c.component == component)
            .cloned()
            .collect()
    }

    /// Number of calls of `operation` on `target`.
    pub fn count(&self, component: &str, operation: &str, target: &str) -> usize {
        self.lock()
            .iter()
            .filter(|c| c.matches(component, operation, target))
            .count()
    }

    /// Index of the first matching call at or after `from`.
    pub fn position_from(
        &self,
        from: usize,
        component: &str,
        operation: &str,
        target: &str,
    ) -> Option<usize> {
        self.lock()
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, c)| c.matches(component, operation, target))
            .map(|(i, _)| i)
    }

    /// True if the expected `(component, operation, target)` calls appear in
    /// this order (other calls may be interleaved).
    pub fn contains_in_order(&self, expected: &[(&str, &str, &str)]) -> bool {
        let mut from = 0;
        for (component, operation, target) in expected {
            match self.position_from(from, component, operation, target) {
                Some(idx) => from = idx + 1,
                None => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_in_order_across_clones() {
        let recorder = CallRecorder::new();
        let other = recorder.clone();
        recorder.record("runtime", "remove", "host2");
        other.record("storage", "archive", "host2");
        recorder.record("repository", "set_node_state", "host2.test");

        assert_eq!(recorder.len(), 3);
        assert!(recorder.contains_in_order(&[
            ("runtime", "remove", "host2"),
            ("storage", "archive", "host2"),
            ("repository", "set_node_state", "host2.test"),
        ]));
        assert!(!recorder.contains_in_order(&[
            ("storage", "archive", "host2"),
            ("runtime", "remove", "host2"),
        ]));
    }

    #[test]
    fn test_count_and_filter() {
        let recorder = CallRecorder::new();
        recorder.record("runtime", "inspect", "host1");
        recorder.record("runtime", "inspect", "host1");
        recorder.record("runtime", "create", "host1");
        recorder.record("storage", "archive", "host1");

        assert_eq!(recorder.count("runtime", "inspect", "host1"), 2);
        assert_eq!(recorder.calls_for("runtime").len(), 3);
        recorder.clear();
        assert!(recorder.is_empty());
    }
}

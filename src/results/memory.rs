//! In-memory result sink, for tests and embedding applications.

use parking_lot::Mutex;

use crate::error::HarnessResult;
use crate::results::{ExportReceipt, ResultSet, ResultSink};

/// Keeps every exported result set.
#[derive(Debug, Default)]
pub struct MemoryResultSink {
    exports: Mutex<Vec<ResultSet>>,
}

impl MemoryResultSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies of everything exported so far.
    pub fn exports(&self) -> Vec<ResultSet> {
        self.exports.lock().clone()
    }

    /// Qualified names in export order.
    pub fn names(&self) -> Vec<String> {
        self.exports.lock().iter().map(ResultSet::qualified_name).collect()
    }

    /// Number of exports.
    pub fn len(&self) -> usize {
        self.exports.lock().len()
    }

    /// True when nothing was exported.
    pub fn is_empty(&self) -> bool {
        self.exports.lock().is_empty()
    }
}

impl ResultSink for MemoryResultSink {
    fn export(&self, result: &ResultSet) -> HarnessResult<ExportReceipt> {
        let receipt = ExportReceipt {
            name: result.qualified_name(),
            location: None,
            rows: result.samples.len(),
        };
        self.exports.lock().push(result.clone());
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::fixtures::result_set;

    #[test]
    fn test_keeps_every_iteration() {
        let sink = MemoryResultSink::new();
        for i in 1..=3 {
            let receipt = sink.export(&result_set(i, 3)).unwrap();
            assert_eq!(receipt.rows, 3);
        }
        assert_eq!(
            sink.names(),
            vec!["screen_onoff_iter01", "screen_onoff_iter02", "screen_onoff_iter03"]
        );
    }
}

use tgw_schemas::CounterKind;

/// Routes a `consistency-error` message to exactly one counter by prefix.
#[derive(Debug, Clone)]
pub struct ConsistencyClassifier {
    /// Longest prefix first so "LOCAL_X" is not swallowed by "LOCAL".
    rules: Vec<(String, CounterKind)>,
}

impl Default for ConsistencyClassifier {
    fn default() -> Self {
        Self::new("LOCAL", "GLOBAL", "NOT_PERSISTED")
    }
}

impl ConsistencyClassifier {
    pub fn new(
        local_detection: impl Into<String>,
        global_concurrent_write: impl Into<String>,
        not_persisted: impl Into<String>,
    ) -> Self {
        let mut rules: Vec<(String, CounterKind)> = [
            (local_detection.into(), CounterKind::LocalDetection),
            (global_concurrent_write.into(), CounterKind::GlobalConcurrentWrite),
            (not_persisted.into(), CounterKind::NotPersisted),
        ]
        .into_iter()
        .filter(|(prefix, _)| !prefix.is_empty())
        .collect();
        rules.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { rules }
    }

    /// `None` for an unrecognized prefix.
    pub fn classify(&self, message: &str) -> Option<CounterKind> {
        let message = message.trim_start();
        self.rules
            .iter()
            .find(|(prefix, _)| message.starts_with(prefix.as_str()))
            .map(|(_, kind)| *kind)
    }
}

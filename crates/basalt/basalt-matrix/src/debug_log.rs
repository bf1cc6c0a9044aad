use parking_lot::Mutex;

/// Output of the consistency and forensics passes.
pub trait DebugLog {
    fn info(&self, msg: &str);
    fn warn(&self, msg: &str);
}

/// Forwards to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl DebugLog for TracingLog {
    fn info(&self, msg: &str) {
        tracing::info!(target: "basalt::debug", "{msg}");
    }

    fn warn(&self, msg: &str) {
        tracing::warn!(target: "basalt::debug", "{msg}");
    }
}

/// Keeps every line; used by tests and by callers that render reports.
#[derive(Debug, Default)]
pub struct CollectingLog {
    infos: Mutex<Vec<String>>,
    warnings: Mutex<Vec<String>>,
}

impl CollectingLog {
    pub fn infos(&self) -> Vec<String> {
        self.infos.lock().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }
}

impl DebugLog for CollectingLog {
    fn info(&self, msg: &str) {
        self.infos.lock().push(msg.to_string());
    }

    fn warn(&self, msg: &str) {
        self.warnings.lock().push(msg.to_string());
    }
}

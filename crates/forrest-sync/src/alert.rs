//! # User Alerts
//!
//! Short human-readable notices raised by the engines: the server's answer
//! to a write, a rejected record, a busy flag that timed out.
//!
//! The host decides how to surface them. Headless agents log them; an
//! embedding UI plugs in its own sink.

use std::sync::Mutex;
use tracing::info;

/// Receives alert text.
pub trait AlertSink: Send + Sync {
    fn alert(&self, message: &str);
}

/// Writes alerts to the log at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&self, message: &str) {
        info!(target: "forrest::alert", "{}", message);
    }
}

/// Keeps alerts in memory, oldest first.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    messages: Mutex<Vec<String>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything alerted so far.
    pub fn messages(&self) -> Vec<String> {
        match self.messages.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Removes and returns everything alerted so far.
    pub fn take(&self) -> Vec<String> {
        match self.messages.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl AlertSink for MemoryAlertSink {
    fn alert(&self, message: &str) {
        match self.messages.lock() {
            Ok(mut guard) => guard.push(message.to_string()),
            Err(poisoned) => poisoned.into_inner().push(message.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemoryAlertSink::new();
        sink.alert("first");
        sink.alert("second");
        assert_eq!(sink.messages(), vec!["first", "second"]);
        assert_eq!(sink.take().len(), 2);
        assert!(sink.messages().is_empty());
    }

    #[test]
    fn test_sinks_are_object_safe() {
        let sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogAlertSink), Arc::new(MemoryAlertSink::new())];
        for sink in &sinks {
            sink.alert("hello");
        }
    }
}

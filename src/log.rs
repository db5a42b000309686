//! Message handlers and the tracing bridge.
//!
//! Engine diagnostics flow two ways: structured `tracing` events for
//! ambient subscribers, and an explicit per-core handler list for
//! embedders that want `(severity, message)` pairs without pulling in a
//! tracing subscriber. Handlers are identified by stable integer ids so
//! they can be removed independently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Severity of an engine message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageSeverity {
    /// Verbose diagnostics.
    Debug,
    /// Informational messages.
    Information,
    /// Something is off but the engine can continue.
    Warning,
    /// Unrecoverable; the process aborts after handlers run.
    Critical,
}

/// Callback receiving engine messages.
pub type MessageHandler = Box<dyn Fn(MessageSeverity, &str) + Send + Sync>;

/// Per-core list of message handlers with stable integer ids.
pub struct HandlerRegistry {
    handlers: Mutex<Vec<(u64, MessageHandler)>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a handler, returning its id.
    pub fn add(&self, handler: MessageHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().unwrap().push((id, handler));
        id
    }

    /// Remove a handler by id. Returns `false` if the id is unknown.
    pub fn remove(&self, id: u64) -> bool {
        let mut handlers = self.handlers.lock().unwrap();
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        handlers.len() != before
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }

    /// Whether the registry has no handlers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatch a message to every handler and to `tracing`.
    ///
    /// Critical messages abort the process after handlers have run.
    pub fn dispatch(&self, severity: MessageSeverity, message: &str) {
        match severity {
            MessageSeverity::Debug => tracing::debug!(target: "vantage", "{message}"),
            MessageSeverity::Information => tracing::info!(target: "vantage", "{message}"),
            MessageSeverity::Warning => tracing::warn!(target: "vantage", "{message}"),
            MessageSeverity::Critical => tracing::error!(target: "vantage", "{message}"),
        }
        for (_, handler) in self.handlers.lock().unwrap().iter() {
            handler(severity, message);
        }
        if severity == MessageSeverity::Critical {
            std::process::abort();
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_add_and_remove() {
        let registry = HandlerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let id = registry.add(Box::new(move |_, _| {
            c.fetch_add(1, Ordering::Relaxed);
        }));

        registry.dispatch(MessageSeverity::Information, "hello");
        assert_eq!(count.load(Ordering::Relaxed), 1);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));

        registry.dispatch(MessageSeverity::Information, "ignored");
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_ids_are_distinct() {
        let registry = HandlerRegistry::new();
        let a = registry.add(Box::new(|_, _| {}));
        let b = registry.add(Box::new(|_, _| {}));
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }
}

use std::sync::Mutex;

/// Notification interface for session events.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, session_id: &str, message: &str);
}

/// Emits an `info` tracing event per notification.
pub struct TracingNotifier;

#[async_trait::async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, session_id: &str, message: &str) {
        tracing::info!(session = session_id, "{message}");
    }
}

/// Collects messages in memory (for testing).
#[derive(Default)]
pub struct CollectNotifier {
    messages: Mutex<Vec<String>>,
}

impl CollectNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages as `"<session>: <message>"`, in arrival order.
    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait::async_trait]
impl Notifier for CollectNotifier {
    async fn notify(&self, session_id: &str, message: &str) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(format!("{session_id}: {message}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_keeps_order() {
        let n = CollectNotifier::new();
        n.notify("a", "first").await;
        n.notify("b", "second").await;
        assert_eq!(n.messages(), vec!["a: first", "b: second"]);
    }
}

//! Mid-loop user interjections.

use std::sync::Arc;
use tilt_core::store::InterjectionStore;
use tracing::{debug, info, warn};

/// Claims unprocessed interjections for one loop invocation.
///
/// Claiming is atomic in the store, so a message is folded into at most one
/// history even when several loops poll the same store.
#[derive(Clone)]
pub struct InterjectionPoller {
    store: Arc<dyn InterjectionStore>,
    session_id: Option<String>,
}

impl InterjectionPoller {
    /// Poll for messages addressed to `session_id`, or for every pending
    /// message when it is `None`.
    pub fn new(store: Arc<dyn InterjectionStore>, session_id: Option<String>) -> Self {
        Self { store, session_id }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Message texts, oldest first. Store failures count as "nothing new".
    pub async fn poll(&self) -> Vec<String> {
        debug!(session_id = ?self.session_id, "Checking for pending chat messages");
        match self.store.claim_interjections(self.session_id.as_deref()).await {
            Ok(claimed) => {
                if !claimed.is_empty() {
                    info!(count = claimed.len(), "Processing pending chat messages");
                }
                claimed.into_iter().map(|i| i.message).collect()
            }
            Err(e) => {
                warn!(error = %e, "Failed to check chat messages");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tilt_core::error::StoreError;
    use tilt_core::store::Interjection;
    use tilt_store::InMemoryStore;

    struct Unreachable;

    #[async_trait]
    impl InterjectionStore for Unreachable {
        async fn push_interjection(
            &self,
            _session_id: Option<&str>,
            _message: &str,
            _timestamp: Option<&str>,
        ) -> Result<String, StoreError> {
            Err(StoreError::Connection("refused".into()))
        }

        async fn claim_interjections(
            &self,
            _session_id: Option<&str>,
        ) -> Result<Vec<Interjection>, StoreError> {
            Err(StoreError::Connection("refused".into()))
        }
    }

    #[tokio::test]
    async fn claims_in_order_once() {
        let store = Arc::new(InMemoryStore::new());
        store.push_interjection(None, "first", None).await.unwrap();
        store.push_interjection(None, "second", None).await.unwrap();

        let poller = InterjectionPoller::new(store, None);
        assert_eq!(poller.poll().await, vec!["first", "second"]);
        assert!(poller.poll().await.is_empty());
    }

    #[tokio::test]
    async fn session_scoping() {
        let store = Arc::new(InMemoryStore::new());
        store.push_interjection(Some("a"), "for a", None).await.unwrap();
        store.push_interjection(Some("b"), "for b", None).await.unwrap();

        let poller_a = InterjectionPoller::new(store.clone(), Some("a".into()));
        assert_eq!(poller_a.poll().await, vec!["for a"]);
        let everyone = InterjectionPoller::new(store, None);
        assert_eq!(everyone.poll().await, vec!["for b"]);
    }

    #[tokio::test]
    async fn concurrent_pollers_never_share_a_message() {
        let store = Arc::new(InMemoryStore::new());
        for i in 0..20 {
            store.push_interjection(None, &format!("m{i}"), None).await.unwrap();
        }
        let a = InterjectionPoller::new(store.clone(), None);
        let b = InterjectionPoller::new(store, None);
        let (left, right) = tokio::join!(a.poll(), b.poll());
        assert_eq!(left.len() + right.len(), 20);
        assert!(left.iter().all(|m| !right.contains(m)));
    }

    #[tokio::test]
    async fn store_failure_yields_nothing() {
        let poller = InterjectionPoller::new(Arc::new(Unreachable), None);
        assert!(poller.poll().await.is_empty());
    }
}

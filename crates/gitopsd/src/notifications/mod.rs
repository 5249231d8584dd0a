pub mod github;
pub mod message;
pub mod slack;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

pub use message::Message;

const QUEUE_CAPACITY: usize = 1024;

#[async_trait]
pub trait Provider: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    async fn send(&self, msg: &Message) -> anyhow::Result<()>;
}

/// Fan-out bus for pipeline notifications: a bounded queue drained by a
/// single consumer that hands every message to each registered provider in
/// turn. Best-effort by design; provider errors are logged, never surfaced.
pub struct NotificationsManager {
    providers: Vec<Box<dyn Provider>>,
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<Message>,
}

/// Cheap handle the workers hold to enqueue messages without blocking.
#[derive(Clone)]
pub struct Broadcaster {
    tx: mpsc::Sender<Message>,
}

impl Broadcaster {
    pub fn broadcast(&self, msg: Message) {
        if let Err(e) = self.tx.try_send(msg) {
            warn!(error=%e, "notification dropped");
        }
    }
}

impl NotificationsManager {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Self { providers: Vec::new(), tx, rx }
    }

    pub fn add_provider(&mut self, provider: Box<dyn Provider>) {
        self.providers.push(provider);
    }

    pub fn broadcaster(&self) -> Broadcaster {
        Broadcaster { tx: self.tx.clone() }
    }

    /// Consumes the queue until every broadcaster handle is gone.
    pub async fn run(mut self) {
        drop(self.tx);
        while let Some(msg) = self.rx.recv().await {
            for provider in &self.providers {
                if let Err(e) = provider.send(&msg).await {
                    warn!(provider = provider.name(), error=%e, "could not send notification");
                }
            }
        }
    }
}

impl Default for NotificationsManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::outcome::{DeleteOutcome, OutcomeStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingProvider {
        sent: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Provider for CountingProvider {
        fn name(&self) -> &'static str {
            "counting"
        }
        async fn send(&self, _msg: &Message) -> anyhow::Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("provider down");
            }
            Ok(())
        }
    }

    fn delete_message() -> Message {
        Message::Delete(DeleteOutcome {
            env: "staging".into(),
            app: "my-app".into(),
            repository: "acme/my-app".into(),
            branch: "feature/x".into(),
            triggered_by: "policy".into(),
            status: OutcomeStatus::Success,
            status_desc: String::new(),
            gitops_ref: String::new(),
            gitops_repo: String::new(),
        })
    }

    #[tokio::test]
    async fn every_provider_sees_every_message_despite_failures() {
        let sent_a = Arc::new(AtomicUsize::new(0));
        let sent_b = Arc::new(AtomicUsize::new(0));
        let mut manager = NotificationsManager::new();
        manager.add_provider(Box::new(CountingProvider { sent: sent_a.clone(), fail: true }));
        manager.add_provider(Box::new(CountingProvider { sent: sent_b.clone(), fail: false }));

        let broadcaster = manager.broadcaster();
        broadcaster.broadcast(delete_message());
        broadcaster.broadcast(delete_message());
        drop(broadcaster);

        manager.run().await;
        assert_eq!(sent_a.load(Ordering::SeqCst), 2, "failing provider still sees all messages");
        assert_eq!(sent_b.load(Ordering::SeqCst), 2);
    }
}

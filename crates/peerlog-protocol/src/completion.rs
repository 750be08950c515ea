use std::sync::Arc;

use peerlog_transport::PublicKey;
use tokio::sync::watch;

use crate::ProtocolError;

/// Why a [`Completion`] was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Intentional teardown.
    Cancelled,
    /// The transport behind the completion failed.
    Failed { peer: PublicKey, reason: String },
}

impl From<Rejection> for ProtocolError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::Cancelled => ProtocolError::Cancelled,
            Rejection::Failed { peer, reason } => ProtocolError::ConnectionFailed { peer, reason },
        }
    }
}

/// A settle-once result that any number of tasks can await.
///
/// The first `resolve` or `reject` wins; later calls are ignored, so
/// teardown paths can reject unconditionally. Clones share the outcome.
pub struct Completion<T> {
    state: Arc<watch::Sender<Option<Result<T, Rejection>>>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            state: Arc::new(tx),
        }
    }

    /// Returns false if the completion was already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Returns false if the completion was already settled.
    pub fn reject(&self, rejection: Rejection) -> bool {
        self.settle(Err(rejection))
    }

    fn settle(&self, outcome: Result<T, Rejection>) -> bool {
        let mut outcome = Some(outcome);
        self.state.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    pub fn is_settled(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Wait for the outcome.
    pub async fn wait(&self) -> Result<T, Rejection> {
        let mut rx = self.state.subscribe();
        // `self` holds the sender, so the channel cannot close under us.
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(settled) => settled.clone().unwrap_or(Err(Rejection::Cancelled)),
            Err(_) => Err(Rejection::Cancelled),
        };
        outcome
    }
}

//! Exactly-once completion of an asynchronous operation.
//!
//! Fan-out operations complete from whichever worker task finishes the
//! operation: the last successful partition, or the first failing one.
//! [`Completion`] guarantees that exactly one of them delivers a result and
//! every later attempt is a no-op.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{CoreError, CoreResult};

/// Sender half that accepts one result and ignores the rest.
pub struct Completion<T> {
    sender: Mutex<Option<oneshot::Sender<CoreResult<T>>>>,
}

/// Receiver half; resolves with the delivered result.
pub struct CompletionReceiver<T> {
    receiver: oneshot::Receiver<CoreResult<T>>,
}

impl<T> Completion<T> {
    /// Creates a linked completion pair.
    #[must_use]
    pub fn channel() -> (Arc<Self>, CompletionReceiver<T>) {
        let (sender, receiver) = oneshot::channel();
        (
            Arc::new(Self {
                sender: Mutex::new(Some(sender)),
            }),
            CompletionReceiver { receiver },
        )
    }

    /// Delivers `result` if nothing was delivered yet.
    ///
    /// Returns `true` when this call was the one that completed the operation.
    pub fn complete(&self, result: CoreResult<T>) -> bool {
        match self.sender.lock().take() {
            Some(sender) => {
                // A dropped receiver means the caller stopped waiting; the
                // operation still counts as completed.
                let _ = sender.send(result);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl<T> CompletionReceiver<T> {
    /// Waits for the result.
    ///
    /// # Errors
    ///
    /// Returns the delivered error, or `CoreError::Closed` if every sender
    /// was dropped without completing.
    pub async fn wait(self) -> CoreResult<T> {
        self.receiver
            .await
            .map_err(|_| CoreError::Closed("operation dropped before completion".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_result_wins() {
        let (completion, receiver) = Completion::<u32>::channel();
        assert!(!completion.is_completed());

        assert!(completion.complete(Err(CoreError::internal("first"))));
        assert!(!completion.complete(Ok(7)));
        assert!(completion.is_completed());

        let err = receiver.wait().await.unwrap_err();
        assert!(err.to_string().contains("first"));
    }

    #[tokio::test]
    async fn test_dropped_sender_is_closed() {
        let (completion, receiver) = Completion::<()>::channel();
        drop(completion);
        assert!(matches!(receiver.wait().await, Err(CoreError::Closed(_))));
    }
}

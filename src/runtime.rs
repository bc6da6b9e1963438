//! Thin wrappers over the async runtime plus small concurrency primitives.

use std::{future::Future, time::Duration};

use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Spawns a new async task, allowing the callers to drop the returned handle without cancelling
/// the task.
pub(crate) fn spawn<F, O>(fut: F) -> tokio::task::JoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    tokio::task::spawn(fut)
}

/// Awaits `future` for at most `timeout`, producing a timeout error if it does not complete in
/// time.
pub(crate) async fn timeout<F: Future>(timeout: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| Error::network_timeout("operation timed out"))
}

pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}

/// A message each of whose receipt and processing can be awaited by the sender.
#[derive(Debug)]
pub(crate) struct AcknowledgedMessage<M, R = ()> {
    acknowledger: AcknowledgmentSender<R>,
    message: M,
}

impl<M, R> AcknowledgedMessage<M, R> {
    /// Creates a new message and a receiver that the sender can use to await acknowledgment.
    pub(crate) fn package(message: M) -> (Self, AcknowledgmentReceiver<R>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                message,
                acknowledger: AcknowledgmentSender { sender },
            },
            AcknowledgmentReceiver { receiver },
        )
    }

    /// Splits into the message and the means of acknowledging it.
    pub(crate) fn into_parts(self) -> (M, AcknowledgmentSender<R>) {
        (self.message, self.acknowledger)
    }
}

#[derive(Debug)]
pub(crate) struct AcknowledgmentSender<R> {
    sender: oneshot::Sender<R>,
}

impl<R> AcknowledgmentSender<R> {
    /// Acknowledges the message. If the receiver has stopped listening, the result is dropped.
    pub(crate) fn acknowledge(self, result: impl Into<R>) {
        let _ = self.sender.send(result.into());
    }
}

pub(crate) struct AcknowledgmentReceiver<R> {
    receiver: oneshot::Receiver<R>,
}

impl<R> AcknowledgmentReceiver<R> {
    /// Waits for the message to be acknowledged. Returns `None` if the other end dropped the
    /// message without acknowledging it.
    pub(crate) async fn wait_for_acknowledgment(self) -> Option<R> {
        self.receiver.await.ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn acknowledgment_round_trip() {
        let (message, receiver) = AcknowledgedMessage::<&str, i32>::package("ping");
        let (payload, ack) = message.into_parts();
        assert_eq!(payload, "ping");
        ack.acknowledge(5);
        assert_eq!(receiver.wait_for_acknowledgment().await, Some(5));
    }

    #[tokio::test]
    async fn dropped_message_yields_none() {
        let (message, receiver) = AcknowledgedMessage::<&str, i32>::package("ping");
        drop(message);
        assert_eq!(receiver.wait_for_acknowledgment().await, None);
    }
}

//! ChannelSender port and its type-erased wrapper.

use futures_util::future::BoxFuture;
use thiserror::Error;

/// Delivery failure reported by a channel sender.
#[derive(Debug, Error)]
#[error("delivery to '{target}' failed: {reason}")]
pub struct DeliveryError {
    pub target: String,
    pub reason: String,
}

/// Sends text to a channel target (e.g. `telegram:1234`, `slack:#ops`).
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition).
pub trait ChannelSender: Send + Sync {
    fn send_message(
        &self,
        target: &str,
        text: &str,
    ) -> impl std::future::Future<Output = Result<(), DeliveryError>> + Send;
}

/// Object-safe version of [`ChannelSender`] with boxed futures.
pub trait ChannelSenderDyn: Send + Sync {
    fn send_message_boxed<'a>(
        &'a self,
        target: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, Result<(), DeliveryError>>;
}

impl<T: ChannelSender> ChannelSenderDyn for T {
    fn send_message_boxed<'a>(
        &'a self,
        target: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, Result<(), DeliveryError>> {
        Box::pin(self.send_message(target, text))
    }
}

/// Type-erased channel sender injected into the engine at construction.
pub struct BoxChannelSender {
    inner: Box<dyn ChannelSenderDyn>,
}

impl BoxChannelSender {
    pub fn new<T: ChannelSender + 'static>(sender: T) -> Self {
        Self {
            inner: Box::new(sender),
        }
    }

    pub async fn send_message(&self, target: &str, text: &str) -> Result<(), DeliveryError> {
        self.inner.send_message_boxed(target, text).await
    }
}

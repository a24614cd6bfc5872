//! Contract for the external webhook sender collaborator.
//!
//! The component that actually formats and executes the HTTP POST lives
//! outside this subsystem. Its contract is deliberately narrow: return a
//! receipt for any outcome that counts as success, or an error for any
//! failure that should consume retry budget (timeout, DNS/TLS failure,
//! non-2xx response, malformed config). The pipeline never interprets
//! status codes itself.

use relay_core::{Delivery, WebhookConfig};

use crate::{error::Result, store::BoxFuture};

/// Bookkeeping returned by a successful send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReceipt {
    /// HTTP status of the response, when one was received.
    pub response_status: Option<i32>,
    /// Round-trip time in milliseconds.
    pub response_time_ms: Option<i32>,
}

/// External sender collaborator.
pub trait WebhookSender: Send + Sync + 'static {
    /// Sends a delivery's payload to the configured endpoint.
    ///
    /// Resolving normally means the attempt succeeded; the receipt is
    /// recorded on the delivery for observability. Any error counts as a
    /// failed attempt and is fed to the retry policy.
    fn send_webhook<'a>(
        &'a self,
        config: &'a WebhookConfig,
        delivery: &'a Delivery,
    ) -> BoxFuture<'a, Result<SendReceipt>>;
}

pub mod mock {
    //! Scripted sender for testing the processing pipeline.

    use std::collections::VecDeque;

    use relay_core::DeliveryId;
    use tokio::sync::Mutex;

    use super::*;
    use crate::error::DeliveryError;

    /// Mock sender driven by a scripted queue of outcomes.
    ///
    /// Each call pops the next scripted outcome; once the script is
    /// exhausted every call succeeds with a `200` receipt.
    #[derive(Default)]
    pub struct MockSender {
        script: Mutex<VecDeque<Result<SendReceipt>>>,
        calls: Mutex<Vec<DeliveryId>>,
    }

    impl MockSender {
        /// Creates a sender that always succeeds.
        pub fn new() -> Self {
            Self::default()
        }

        /// Queues a successful outcome with the given status.
        pub async fn push_success(&self, status: i32) {
            self.script.lock().await.push_back(Ok(SendReceipt {
                response_status: Some(status),
                response_time_ms: Some(12),
            }));
        }

        /// Queues a failed outcome.
        pub async fn push_failure(&self, message: &str) {
            self.script.lock().await.push_back(Err(DeliveryError::send_failed(message)));
        }

        /// Delivery ids this sender was invoked with, in order.
        pub async fn calls(&self) -> Vec<DeliveryId> {
            self.calls.lock().await.clone()
        }
    }

    impl WebhookSender for MockSender {
        fn send_webhook<'a>(
            &'a self,
            _config: &'a WebhookConfig,
            delivery: &'a Delivery,
        ) -> BoxFuture<'a, Result<SendReceipt>> {
            Box::pin(async move {
                self.calls.lock().await.push(delivery.id);
                self.script.lock().await.pop_front().unwrap_or(Ok(SendReceipt {
                    response_status: Some(200),
                    response_time_ms: Some(5),
                }))
            })
        }
    }
}

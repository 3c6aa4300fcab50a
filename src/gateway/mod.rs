//! Outbound messaging: the transport trait and the bounded send pool.
//!
//! The gateway owns the concurrency and timeout policy around a transport.
//! Every send goes through [`MessagingGateway::send`], which holds a
//! semaphore permit for the duration of the call and converts a hung
//! transport into a `Timeout` error — a timed-out send is treated as a
//! transient failure, never as an ack.

pub mod email;
pub mod sms;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::error::GatewayError;

pub use email::{EmailNotifier, SmtpConfig};
pub use sms::{SmsConfig, SmsTransport};

/// Provider acknowledgment for a sent message.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    /// Provider-assigned message id, used to correlate delivery callbacks.
    pub provider_message_id: String,
}

/// A channel capable of delivering a text to a phone number.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, to: &str, body: &str) -> Result<DeliveryReceipt, GatewayError>;
}

/// Bounded, timeout-guarded wrapper around a transport.
pub struct MessagingGateway {
    transport: Arc<dyn MessageTransport>,
    permits: Arc<Semaphore>,
    send_timeout: Duration,
}

impl MessagingGateway {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        max_in_flight: usize,
        send_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            send_timeout,
        }
    }

    /// Send a message, waiting for a pool permit first.
    ///
    /// Returns the provider receipt only after the transport acknowledged
    /// the send. Timeouts and transport failures surface as errors and the
    /// caller must not record the message as sent.
    pub async fn send(&self, to: &str, body: &str) -> Result<DeliveryReceipt, GatewayError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| GatewayError::PoolClosed)?;

        let name = self.transport.name().to_string();
        match tokio::time::timeout(self.send_timeout, self.transport.send(to, body)).await {
            Ok(Ok(receipt)) => {
                info!(transport = %name, provider_message_id = %receipt.provider_message_id, "Message sent");
                Ok(receipt)
            }
            Ok(Err(e)) => {
                warn!(transport = %name, error = %e, "Send failed");
                Err(e)
            }
            Err(_) => {
                warn!(transport = %name, timeout = ?self.send_timeout, "Send timed out");
                Err(GatewayError::Timeout {
                    name,
                    timeout: self.send_timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowTransport {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageTransport for SlowTransport {
        fn name(&self) -> &str {
            "slow"
        }

        async fn send(&self, _to: &str, _body: &str) -> Result<DeliveryReceipt, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(DeliveryReceipt {
                provider_message_id: "SM1".into(),
            })
        }
    }

    #[tokio::test]
    async fn timeout_surfaces_as_error_not_ack() {
        let transport = Arc::new(SlowTransport {
            delay: Duration::from_secs(60),
            calls: AtomicUsize::new(0),
        });
        let gateway =
            MessagingGateway::new(transport.clone(), 4, Duration::from_millis(20));

        let err = gateway.send("+15551230000", "hi").await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fast_send_returns_receipt() {
        let transport = Arc::new(SlowTransport {
            delay: Duration::from_millis(1),
            calls: AtomicUsize::new(0),
        });
        let gateway = MessagingGateway::new(transport, 4, Duration::from_secs(5));

        let receipt = gateway.send("+15551230000", "hi").await.unwrap();
        assert_eq!(receipt.provider_message_id, "SM1");
    }
}

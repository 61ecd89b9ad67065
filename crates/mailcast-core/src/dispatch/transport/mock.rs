//! Mock transport for testing

use super::{OutboundMessage, Transport, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct FailurePlan {
    remaining: Option<u32>,
    error: TransportError,
}

/// Transport that captures messages instead of sending them
#[derive(Default)]
pub struct MockTransport {
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
    failures: Mutex<HashMap<String, FailurePlan>>,
    attempts: Mutex<HashMap<String, u32>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before every send
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the first `times` sends to `recipient`
    pub async fn fail_times(&self, recipient: &str, times: u32, error: TransportError) {
        self.failures.lock().await.insert(
            recipient.to_string(),
            FailurePlan {
                remaining: Some(times),
                error,
            },
        );
    }

    /// Fail every send to `recipient`
    pub async fn always_fail(&self, recipient: &str, error: TransportError) {
        self.failures.lock().await.insert(
            recipient.to_string(),
            FailurePlan {
                remaining: None,
                error,
            },
        );
    }

    /// Messages accepted so far
    pub async fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }

    /// Number of send calls for a recipient, failed ones included
    pub async fn attempts_for(&self, recipient: &str) -> u32 {
        self.attempts
            .lock()
            .await
            .get(recipient)
            .copied()
            .unwrap_or(0)
    }

    /// Number of send calls overall
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<String, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .attempts
            .lock()
            .await
            .entry(message.to.clone())
            .or_insert(0) += 1;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failures = self.failures.lock().await;
            if let Some(plan) = failures.get_mut(&message.to) {
                match plan.remaining.as_mut() {
                    None => return Err(plan.error.clone()),
                    Some(0) => {}
                    Some(n) => {
                        *n -= 1;
                        return Err(plan.error.clone());
                    }
                }
            }
        }

        self.sent.lock().await.push(message.clone());
        Ok(message.message_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(to: &str) -> OutboundMessage {
        OutboundMessage {
            message_id: format!("<{}@test>", to),
            from_name: None,
            from_email: "news@example.com".into(),
            reply_to: None,
            to: to.into(),
            subject: "Hi".into(),
            html_body: String::new(),
            list_unsubscribe: None,
        }
    }

    #[tokio::test]
    async fn test_fail_times_then_succeed() {
        let transport = MockTransport::new();
        transport
            .fail_times("a@example.com", 2, TransportError::retryable("421 busy"))
            .await;

        assert!(transport.send(&outbound("a@example.com")).await.is_err());
        assert!(transport.send(&outbound("a@example.com")).await.is_err());
        assert!(transport.send(&outbound("a@example.com")).await.is_ok());
        assert_eq!(transport.attempts_for("a@example.com").await, 3);
        assert_eq!(transport.sent_count().await, 1);
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ShardError, TransportError};
use crate::heartbeat::packet::HeartbeatPacket;
use crate::heartbeat::response::HeartbeatResponse;

/// Name of the RPC the master serves heartbeats on.
pub const HEARTBEAT_ENDPOINT: &str = "shard_heartbeat";

/// Path of the AFE JSON-RPC handler on the master.
pub const RPC_PATH: &str = "/afe/server/rpc/";

/// Carries one heartbeat to the master and returns its reply.
///
/// Implementations may retry internally; an `Err` means the call is given up
/// for this tick.
#[async_trait]
pub trait HeartbeatTransport: Send + Sync {
    async fn heartbeat(
        &self,
        packet: &HeartbeatPacket,
    ) -> Result<HeartbeatResponse, TransportError>;
}

/// Keep retrying until `timeout` has passed, sleeping `delay` between
/// attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5 * 60),
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Policy from command line units: minutes of retrying, seconds between
    /// attempts.
    pub fn from_minutes(timeout_min: u64, delay_sec: u64) -> Result<Self, ShardError> {
        let timeout_sec = timeout_min.checked_mul(60).ok_or_else(|| {
            ShardError::Configuration(format!(
                "RPC timeout of {} minutes is out of range.",
                timeout_min
            ))
        })?;
        Ok(Self {
            timeout: Duration::from_secs(timeout_sec),
            delay: Duration::from_secs(delay_sec),
        })
    }

    /// Run `attempt` until it succeeds, fails with a non-retryable error, or
    /// the policy's deadline passes.
    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> Result<T, TransportError>
    where
        F: FnMut(Duration) -> Fut,
        Fut: std::future::Future<Output = Result<T, TransportError>>,
    {
        // None when the timeout is past what the clock can represent; such a
        // policy never gives up.
        let deadline = Instant::now().checked_add(self.timeout);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => self.timeout,
            };
            let err = match attempt(remaining.max(Duration::from_millis(1))).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            let exhausted = deadline.is_some_and(|deadline| {
                Instant::now()
                    .checked_add(self.delay)
                    .map_or(true, |next| next >= deadline)
            });
            if exhausted {
                return Err(TransportError::Exhausted {
                    attempts,
                    last_error: err.to_string(),
                });
            }
            tracing::warn!(attempt = attempts, error = %err, "RPC failed, retrying");
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    id: u64,
    method: &'a str,
    params: [&'a HeartbeatPacket; 1],
}

#[derive(Deserialize)]
struct RpcFault {
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct RpcReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcFault>,
}

/// JSON-RPC over HTTP to the master's AFE.
pub struct RpcTransport {
    client: reqwest::Client,
    url: String,
    retry: RetryPolicy,
    next_id: AtomicU64,
}

impl RpcTransport {
    /// `server` is a hostname (`cautotest`), `host:port`, or a full URL.
    pub fn new(server: &str, retry: RetryPolicy) -> Self {
        let base = if server.starts_with("http://") || server.starts_with("https://") {
            server.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", server.trim_end_matches('/'))
        };
        Self {
            client: reqwest::Client::new(),
            url: format!("{}{}", base, RPC_PATH),
            retry,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call_once(
        &self,
        packet: &HeartbeatPacket,
        timeout: Duration,
    ) -> Result<HeartbeatResponse, TransportError> {
        let request = RpcRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: HEARTBEAT_ENDPOINT,
            params: [packet],
        };

        let response = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let reply: RpcReply = response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        if let Some(fault) = reply.error {
            return Err(TransportError::Rpc {
                name: fault.name,
                message: fault.message,
            });
        }
        let result = reply
            .result
            .ok_or_else(|| TransportError::Decode("reply has neither result nor error".into()))?;
        serde_json::from_value(result).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[async_trait]
impl HeartbeatTransport for RpcTransport {
    async fn heartbeat(
        &self,
        packet: &HeartbeatPacket,
    ) -> Result<HeartbeatResponse, TransportError> {
        self.retry
            .run(|remaining| self.call_once(packet, remaining))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn url_from_hostname() {
        let transport = RpcTransport::new("cautotest", RetryPolicy::default());
        assert_eq!(transport.url(), "http://cautotest/afe/server/rpc/");

        let transport = RpcTransport::new("https://afe.example.com/", RetryPolicy::default());
        assert_eq!(transport.url(), "https://afe.example.com/afe/server/rpc/");
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.timeout, Duration::from_secs(300));
        assert_eq!(policy.delay, Duration::from_secs(5));
    }

    #[test]
    fn policy_from_command_line_units() {
        let policy = RetryPolicy::from_minutes(5, 5).unwrap();
        assert_eq!(policy, RetryPolicy::default());

        let err = RetryPolicy::from_minutes(u64::MAX, 5).unwrap_err();
        assert!(matches!(err, ShardError::Configuration(_)));
        assert!(RetryPolicy::from_minutes(u64::MAX / 60, 5).is_ok());
    }

    #[tokio::test]
    async fn unbounded_timeout_keeps_retrying() {
        let policy = RetryPolicy {
            timeout: Duration::MAX,
            delay: Duration::from_millis(5),
        };
        let calls = AtomicU32::new(0);
        let result = policy
            .run(|remaining| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    assert_eq!(remaining, Duration::MAX);
                    if n < 3 {
                        Err(TransportError::Status(502))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let policy = RetryPolicy {
            timeout: Duration::from_secs(5),
            delay: Duration::from_millis(10),
        };
        let calls = AtomicU32::new(0);
        let result = policy
            .run(|_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TransportError::Status(503))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn rpc_fault_is_returned_immediately() {
        let policy = RetryPolicy {
            timeout: Duration::from_secs(5),
            delay: Duration::from_millis(10),
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(TransportError::Rpc {
                        name: "ValidationError".to_string(),
                        message: "no such shard".to_string(),
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(TransportError::Rpc { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_at_deadline() {
        let policy = RetryPolicy {
            timeout: Duration::from_millis(50),
            delay: Duration::from_millis(20),
        };
        let result: Result<(), _> = policy
            .run(|_| async { Err(TransportError::Status(500)) })
            .await;
        match result {
            Err(TransportError::Exhausted { attempts, .. }) => assert!(attempts >= 1),
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }
}

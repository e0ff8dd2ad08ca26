//! Leader-job retry policy.
//!
//! A leader that cannot do its job should not keep the role: [`Retrying`]
//! wraps a set of hooks, retries a failing leader job with jittered
//! exponential backoff and resigns leadership once every attempt has failed,
//! which lets another node take over.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use log::{info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::raft::{HookContext, Message, NodeHooks};

/// Upper bound of the random jitter added to each backoff step.
const MAX_JITTER_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Doubles `current`, adds jitter and caps the result at `max_backoff`.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        let jitter = Duration::from_millis(rand::rng().random_range(0..MAX_JITTER_MS));
        (current * 2 + jitter).min(self.max_backoff())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 500,
        }
    }
}

pub struct Retrying<H> {
    inner: H,
    policy: RetryPolicy,
}

impl<H: NodeHooks> Retrying<H> {
    pub fn new(inner: H, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

#[async_trait]
impl<H: NodeHooks> NodeHooks for Retrying<H> {
    async fn leader_job(&self, ctx: HookContext) -> anyhow::Result<()> {
        let attempts = self.policy.max_attempts.max(1);
        let mut backoff = self.policy.initial_backoff();

        for attempt in 1..=attempts {
            match self.inner.leader_job(ctx.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!("Leader job attempt {attempt}/{attempts} failed: {e:#}"),
            }
            if attempt == attempts {
                break;
            }

            backoff = self.policy.next_backoff(backoff);
            tokio::select! {
                _ = ctx.cancellation().cancelled() => {
                    return Err(anyhow!("leadership ended while retrying the leader job"));
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        if ctx.resign() {
            info!(
                "Node {} resigned after {attempts} failed leader job attempts",
                ctx.raft().identity()
            );
        }
        Err(anyhow!("leader job failed after {attempts} attempts"))
    }

    async fn handle_custom_message(&self, ctx: HookContext, message: Message) -> anyhow::Result<()> {
        self.inner.handle_custom_message(ctx, message).await
    }
}

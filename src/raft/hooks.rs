//! Extension points for the layer that runs on top of the election.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Message, Raft};

/// Handed to every hook invocation.
#[derive(Clone)]
pub struct HookContext {
    raft: Raft,
    cancel: CancellationToken,
}

impl HookContext {
    pub(crate) fn new(raft: Raft, cancel: CancellationToken) -> Self {
        Self { raft, cancel }
    }

    /// The node running the hook. Leader jobs hand leadership over with
    /// [`HookContext::resign`] rather than [`Raft::resign`].
    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    /// For a leader job this fires as soon as leadership ends; for a custom
    /// message it fires on shutdown.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resigns the leadership this context belongs to. Does nothing once that
    /// leadership has ended, even if the node has been elected again since.
    pub fn resign(&self) -> bool {
        self.raft.resign_within(&self.cancel)
    }
}

#[async_trait]
pub trait NodeHooks: Send + Sync {
    /// Runs on every leader-job tick while this node leads. Each run is its
    /// own task: errors and panics are logged and never stop the node.
    async fn leader_job(&self, ctx: HookContext) -> anyhow::Result<()>;

    /// Receives messages whose type the election protocol does not know.
    async fn handle_custom_message(&self, ctx: HookContext, message: Message) -> anyhow::Result<()>;
}

#[async_trait]
impl<T: NodeHooks + ?Sized> NodeHooks for Arc<T> {
    async fn leader_job(&self, ctx: HookContext) -> anyhow::Result<()> {
        (**self).leader_job(ctx).await
    }

    async fn handle_custom_message(&self, ctx: HookContext, message: Message) -> anyhow::Result<()> {
        (**self).handle_custom_message(ctx, message).await
    }
}

mod config;
mod error;
mod hooks;
pub mod message;
mod node;
mod state;
mod task;
pub mod timer;

pub use self::config::RaftConfig;
pub use self::error::RaftError;
pub use self::hooks::{HookContext, NodeHooks};
pub use self::message::{Message, MessageType};
pub use self::node::{quorum, Effect, RaftNode};
pub use self::state::{NodeRole, NodeState};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use self::timer::{LeaderTickers, TimerArm};
use crate::transport::{Inbound, Transport};

/// Election service for one process.
///
/// Cloning is cheap; every clone drives the same node. All election state
/// sits behind one lock that is held for a single read or transition and
/// never across a publish.
#[derive(Clone)]
pub struct Raft {
    inner: Arc<Shared>,
}

struct Shared {
    id: String,
    config: RaftConfig,
    node: Mutex<RaftNode>,
    transport: Arc<dyn Transport>,
    hooks: RwLock<Option<Arc<dyn NodeHooks>>>,
    // Mirrors the node's election timer for the coordination loop.
    timer: watch::Sender<Option<TimerArm>>,
}

impl Raft {
    pub fn new(transport: Arc<dyn Transport>, config: RaftConfig) -> Result<Self, RaftError> {
        config.validate()?;

        let id = transport.identity();
        let node = RaftNode::new(id.clone(), config.clone());
        let (timer, _) = watch::channel(None);

        Ok(Self {
            inner: Arc::new(Shared {
                id,
                config,
                node: Mutex::new(node),
                transport,
                hooks: RwLock::new(None),
                timer,
            }),
        })
    }

    pub fn with_hooks(self, hooks: Arc<dyn NodeHooks>) -> Self {
        self.set_hooks(hooks);
        self
    }

    pub fn set_hooks(&self, hooks: Arc<dyn NodeHooks>) {
        *self
            .inner
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(hooks);
    }

    pub fn identity(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.inner.config
    }

    pub fn current_term(&self) -> u64 {
        self.lock().current_term()
    }

    pub fn current_role(&self) -> NodeRole {
        self.lock().role()
    }

    pub fn current_leader(&self) -> Option<String> {
        self.lock().leader_id().map(str::to_string)
    }

    pub fn voted_for(&self) -> Option<String> {
        self.lock().voted_for().map(str::to_string)
    }

    pub fn votes_received(&self) -> usize {
        self.lock().votes_received()
    }

    pub fn is_leader(&self) -> bool {
        self.lock().is_leader()
    }

    pub fn state(&self) -> NodeState {
        self.lock().state()
    }

    /// Peers currently visible on the topic, excluding this node.
    pub fn live_peer_count(&self) -> usize {
        self.inner.transport.live_peer_count()
    }

    /// Steps down from leadership. Returns false if this node was not leading.
    pub fn resign(&self) -> bool {
        let mut node = self.lock();
        let resigned = node.resign();
        self.sync_timer(&node);
        resigned
    }

    /// Resigns only while `scope` is still live. Leader jobs pass the signal of
    /// the leadership they were started under, so a job that outlives it
    /// cannot resign a later term. The signal is cancelled under the node
    /// lock, which makes the check and the resignation atomic.
    pub(crate) fn resign_within(&self, scope: &CancellationToken) -> bool {
        let mut node = self.lock();
        if scope.is_cancelled() {
            return false;
        }
        let resigned = node.resign();
        self.sync_timer(&node);
        resigned
    }

    /// Publishes a message on the election topic, e.g. a custom message for
    /// peers' [`NodeHooks::handle_custom_message`].
    pub async fn publish(&self, message: &Message) -> Result<(), RaftError> {
        let data = message.encode()?;
        self.inner.transport.publish(data).await?;
        Ok(())
    }

    /// Runs the node until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), RaftError> {
        let inbound = self.inner.transport.subscribe().await?;
        let (buffer_tx, mut buffer_rx) = mpsc::channel(self.inner.config.message_buffer);
        let receiver = tokio::spawn(receive_loop(inbound, buffer_tx, cancel.clone()));

        {
            let mut node = self.lock();
            node.start();
            self.sync_timer(&node);
        }
        let mut timer_rx = self.inner.timer.subscribe();
        info!("Node {} started", self.inner.id);

        loop {
            let armed = *timer_rx.borrow_and_update();
            let expiry = async move {
                match armed {
                    Some(arm) => {
                        time::sleep_until(arm.deadline).await;
                        arm.epoch
                    }
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(message) = buffer_rx.recv() => {
                    let raft = self.clone();
                    let cancel = cancel.clone();
                    task::spawn_contained("message handler", async move {
                        if let Err(e) = raft.dispatch(message, &cancel).await {
                            error!("Failed to handle message: {e}");
                        }
                    });
                }
                epoch = expiry => self.on_election_timeout(epoch, &cancel),
                changed = timer_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = receiver.await {
            warn!("Receive task ended abnormally: {e}");
        }
        {
            let mut node = self.lock();
            node.shutdown();
            self.sync_timer(&node);
        }
        info!("Node {} stopped", self.inner.id);
        Ok(())
    }

    fn on_election_timeout(&self, epoch: u64, cancel: &CancellationToken) {
        let effects = {
            let mut node = self.lock();
            let effects = node.on_election_timeout(epoch);
            self.sync_timer(&node);
            effects
        };

        match effects {
            Ok(effects) if effects.is_empty() => {}
            Ok(effects) => {
                // Publishing may block on the transport; keep it off the loop.
                let raft = self.clone();
                let cancel = cancel.clone();
                task::spawn_contained("election", async move {
                    raft.apply(effects, &cancel).await;
                });
            }
            Err(e) => error!("Failed to start election: {e}"),
        }
    }

    async fn dispatch(&self, message: Message, cancel: &CancellationToken) -> Result<(), RaftError> {
        debug!(
            "Node {} received {} from {}",
            self.inner.id, message.kind, message.sent_from
        );

        if cancel.is_cancelled() {
            return Ok(());
        }

        if let MessageType::Custom(kind) = &message.kind {
            let Some(hooks) = self.hooks() else {
                return Err(RaftError::UnhandledMessage(kind.clone()));
            };
            let ctx = HookContext::new(self.clone(), cancel.clone());
            return hooks
                .handle_custom_message(ctx, message)
                .await
                .map_err(|e| RaftError::Hook(format!("{e:#}")));
        }

        let live_peers = match message.kind {
            MessageType::ReplyVote => self.inner.transport.live_peer_count(),
            _ => 0,
        };
        let effects = {
            let mut node = self.lock();
            // Shutdown happens under this lock after `cancel` fires.
            if cancel.is_cancelled() {
                debug!("Node {} dropping {} after shutdown", self.inner.id, message.kind);
                return Ok(());
            }
            let effects = node.handle_message(&message, live_peers);
            self.sync_timer(&node);
            effects?
        };

        self.apply(effects, cancel).await;
        Ok(())
    }

    async fn apply(&self, effects: Vec<Effect>, cancel: &CancellationToken) {
        for effect in effects {
            match effect {
                Effect::Publish(message) => {
                    if let Err(e) = self.publish(&message).await {
                        warn!("Failed to publish {}: {e}", message.kind);
                    }
                }
                Effect::StartLeading(tickers) => {
                    let raft = self.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move { raft.lead(tickers, cancel).await });
                }
            }
        }
    }

    /// Leader task: heartbeats and leader jobs until leadership ends.
    async fn lead(&self, tickers: LeaderTickers, cancel: CancellationToken) {
        let resign = tickers.resign_signal();

        let mut heartbeat = time::interval(tickers.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut leader_job =
            time::interval_at(Instant::now() + tickers.leader_job, tickers.leader_job);
        leader_job.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = resign.cancelled() => {
                    info!("Node {} leader task stopping", self.inner.id);
                    return;
                }
                _ = cancel.cancelled() => return,
                _ = heartbeat.tick() => self.send_heartbeat().await,
                _ = leader_job.tick() => self.spawn_leader_job(&resign),
            }
        }
    }

    async fn send_heartbeat(&self) {
        let term = {
            let node = self.lock();
            if !node.is_leader() {
                return;
            }
            node.current_term()
        };

        let result = match Message::heartbeat(&self.inner.id, term) {
            Ok(message) => self.publish(&message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Failed to send heartbeat for term {term}: {e}");
        }
    }

    fn spawn_leader_job(&self, resign: &CancellationToken) {
        let Some(hooks) = self.hooks() else {
            return;
        };
        let ctx = HookContext::new(self.clone(), resign.clone());
        task::spawn_contained("leader job", async move {
            if let Err(e) = hooks.leader_job(ctx).await {
                error!("Leader job failed: {e:#}");
            }
        });
    }

    fn hooks(&self) -> Option<Arc<dyn NodeHooks>> {
        self.inner
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock(&self) -> MutexGuard<'_, RaftNode> {
        self.inner.node.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sync_timer(&self, node: &RaftNode) {
        let next = node.election_timer();
        self.inner.timer.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn receive_loop(
    mut inbound: Inbound,
    buffer: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            _ = cancel.cancelled() => return,
            raw = inbound.recv() => raw,
        };
        let Some(raw) = raw else {
            warn!("Subscription closed, no further messages will be received");
            return;
        };

        let message = match Message::decode(&raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping undecodable message: {e}");
                continue;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = buffer.send(message) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryMesh;

    fn solo_candidate() -> Raft {
        let mesh = MemoryMesh::new();
        let raft = Raft::new(Arc::new(mesh.join("solo")), RaftConfig::default()).expect("raft");
        raft.lock().start_election().expect("election");
        raft
    }

    #[tokio::test]
    async fn messages_after_cancellation_leave_state_alone() {
        let raft = solo_candidate();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let vote = Message::reply_vote("solo", "solo", true).expect("reply");
        raft.dispatch(vote, &cancel).await.expect("dispatch");

        assert_eq!(raft.current_role(), NodeRole::Candidate);
        assert!(raft.lock().leader_tickers().is_none());
    }

    #[tokio::test]
    async fn live_vote_still_elects() {
        let raft = solo_candidate();
        let cancel = CancellationToken::new();

        let vote = Message::reply_vote("solo", "solo", true).expect("reply");
        raft.dispatch(vote, &cancel).await.expect("dispatch");

        assert!(raft.is_leader());
        cancel.cancel();
    }

    #[tokio::test]
    async fn resign_within_ignores_ended_leadership() {
        let raft = solo_candidate();
        let cancel = CancellationToken::new();
        let vote = Message::reply_vote("solo", "solo", true).expect("reply");
        raft.dispatch(vote.clone(), &cancel).await.expect("dispatch");
        let first = raft.lock().leader_tickers().expect("leading").resign_signal();

        // Leadership ends and is won again in a later term.
        assert!(raft.resign());
        raft.lock().start_election().expect("election");
        raft.dispatch(vote, &cancel).await.expect("dispatch");
        assert!(raft.is_leader());
        let term = raft.current_term();

        assert!(!raft.resign_within(&first));
        assert!(raft.is_leader());
        assert_eq!(raft.current_term(), term);

        let second = raft.lock().leader_tickers().expect("leading").resign_signal();
        assert!(raft.resign_within(&second));
        assert!(!raft.is_leader());
        cancel.cancel();
    }
}

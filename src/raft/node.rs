use std::collections::HashSet;

use log::{debug, info};

use super::message::{HeartbeatMessage, ReplyVoteMessage, RequestVoteMessage};
use super::timer::{ElectionTimer, LeaderTickers, TimerArm};
use super::{Message, MessageType, NodeRole, NodeState, RaftConfig, RaftError};

/// Work a transition asks the service to carry out once the node lock is
/// released.
#[derive(Debug)]
pub enum Effect {
    Publish(Message),
    StartLeading(LeaderTickers),
}

/// Votes needed to lead: a strict majority of the visible peers plus self.
pub fn quorum(live_peers: usize) -> usize {
    (live_peers + 1) / 2 + 1
}

/// Election state machine. Holds no I/O; every handler mutates state and
/// returns the effects to execute.
pub struct RaftNode {
    // Node identity
    id: String,

    config: RaftConfig,

    // Election state
    current_term: u64,
    voted_for: Option<String>,
    role: NodeRole,
    leader_id: Option<String>,
    votes_received: HashSet<String>,

    // Timing
    election_timer: ElectionTimer,
    leader_tickers: Option<LeaderTickers>,
}

impl RaftNode {
    pub fn new(id: impl Into<String>, config: RaftConfig) -> Self {
        Self {
            id: id.into(),
            config,
            current_term: 0,
            voted_for: None,
            role: NodeRole::Follower,
            leader_id: None,
            votes_received: HashSet::new(),
            election_timer: ElectionTimer::default(),
            leader_tickers: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn leader_id(&self) -> Option<&str> {
        self.leader_id.as_deref()
    }

    pub fn voted_for(&self) -> Option<&str> {
        self.voted_for.as_deref()
    }

    pub fn votes_received(&self) -> usize {
        self.votes_received.len()
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, NodeRole::Leader)
    }

    pub fn state(&self) -> NodeState {
        NodeState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            role: self.role,
            leader_id: self.leader_id.clone(),
            votes_received: self.votes_received.len(),
        }
    }

    pub fn election_timer(&self) -> Option<TimerArm> {
        self.election_timer.current()
    }

    pub fn leader_tickers(&self) -> Option<&LeaderTickers> {
        self.leader_tickers.as_ref()
    }

    /// Arms the first election timer. Called once when the service starts.
    pub fn start(&mut self) -> TimerArm {
        self.election_timer.arm(self.config.election_timeout())
    }

    /// Tears the node down on cancellation.
    pub fn shutdown(&mut self) {
        self.stop_leading();
        self.election_timer.stop();
        self.role = NodeRole::Follower;
        self.votes_received.clear();
    }

    pub fn on_election_timeout(&mut self, epoch: u64) -> Result<Vec<Effect>, RaftError> {
        if !self.election_timer.consume(epoch) {
            debug!("Ignoring stale election timer expiry (epoch {epoch})");
            return Ok(Vec::new());
        }
        if self.is_leader() {
            return Ok(Vec::new());
        }
        self.start_election()
    }

    pub fn start_election(&mut self) -> Result<Vec<Effect>, RaftError> {
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.votes_received.clear();
        self.role = NodeRole::Candidate;
        self.election_timer.arm(self.config.election_timeout());

        info!(
            "Node {} starting election for term {}",
            self.id, self.current_term
        );

        // Our own request comes back over gossip and is granted by ourselves,
        // which is how the self-vote gets counted.
        let request = Message::request_vote(&self.id, self.current_term)?;
        Ok(vec![Effect::Publish(request)])
    }

    /// Applies one protocol message. `live_peers` is the current number of
    /// visible peers and is only consulted when counting votes.
    pub fn handle_message(
        &mut self,
        message: &Message,
        live_peers: usize,
    ) -> Result<Vec<Effect>, RaftError> {
        match &message.kind {
            MessageType::Heartbeat => self.handle_heartbeat(message),
            MessageType::RequestVote => self.handle_request_vote(message),
            MessageType::ReplyVote => self.handle_reply_vote(message, live_peers),
            MessageType::Custom(kind) => Err(RaftError::UnhandledMessage(kind.clone())),
        }
    }

    fn handle_heartbeat(&mut self, message: &Message) -> Result<Vec<Effect>, RaftError> {
        if message.sent_from == self.id {
            return Ok(Vec::new());
        }

        let heartbeat: HeartbeatMessage = message.payload()?;
        if heartbeat.leader_id != message.sent_from {
            return Err(RaftError::LeaderMismatch {
                sent_from: message.sent_from.clone(),
                leader_id: heartbeat.leader_id,
            });
        }

        if heartbeat.term < self.current_term {
            debug!(
                "Ignoring stale heartbeat from {} (term {} < {})",
                heartbeat.leader_id, heartbeat.term, self.current_term
            );
            return Ok(Vec::new());
        }

        if heartbeat.term > self.current_term {
            self.current_term = heartbeat.term;
            self.voted_for = None;
        }

        if self.role != NodeRole::Follower
            || self.leader_id.as_deref() != Some(heartbeat.leader_id.as_str())
        {
            info!(
                "Node {} following {} in term {}",
                self.id, heartbeat.leader_id, self.current_term
            );
        }
        self.become_follower(Some(heartbeat.leader_id));

        Ok(Vec::new())
    }

    fn handle_request_vote(&mut self, message: &Message) -> Result<Vec<Effect>, RaftError> {
        let request: RequestVoteMessage = message.payload()?;
        let candidate = message.sent_from.as_str();

        if request.term < self.current_term {
            debug!(
                "Rejecting vote request from {candidate} for stale term {} (current {})",
                request.term, self.current_term
            );
            return self.reply_vote(candidate, false);
        }

        if request.term > self.current_term {
            debug!(
                "Node {} adopting term {} from vote request by {candidate}",
                self.id, request.term
            );
            self.current_term = request.term;
            self.voted_for = None;
            self.become_follower(None);
        } else if self.role == NodeRole::Candidate && candidate != self.id {
            // Two candidates in the same term: step aside instead of splitting votes.
            info!(
                "Node {} yielding term {} candidacy to {candidate}",
                self.id, self.current_term
            );
            self.become_follower(self.leader_id.clone());
            return self.reply_vote(candidate, false);
        }

        let vote_granted = match self.voted_for.as_deref() {
            None => true,
            Some(voted) => voted == candidate,
        };

        if vote_granted {
            self.voted_for = Some(candidate.to_string());
            if !self.is_leader() {
                self.election_timer.arm(self.config.election_timeout());
            }
        }

        self.reply_vote(candidate, vote_granted)
    }

    fn handle_reply_vote(
        &mut self,
        message: &Message,
        live_peers: usize,
    ) -> Result<Vec<Effect>, RaftError> {
        let reply: ReplyVoteMessage = message.payload()?;

        if reply.leader_id != self.id || self.role != NodeRole::Candidate {
            return Ok(Vec::new());
        }
        if !reply.vote_granted {
            debug!("Vote denied by {} in term {}", message.sent_from, self.current_term);
            return Ok(Vec::new());
        }

        self.votes_received.insert(message.sent_from.clone());
        let needed = quorum(live_peers);
        debug!(
            "Node {} has {} of {needed} votes in term {}",
            self.id,
            self.votes_received.len(),
            self.current_term
        );

        if self.votes_received.len() >= needed {
            return Ok(self.become_leader());
        }
        Ok(Vec::new())
    }

    fn become_leader(&mut self) -> Vec<Effect> {
        info!(
            "Node {} becoming leader for term {}",
            self.id, self.current_term
        );

        self.election_timer.stop();
        self.role = NodeRole::Leader;
        self.leader_id = Some(self.id.clone());

        let tickers = LeaderTickers::start(
            self.config.heartbeat_interval(),
            self.config.leader_job_interval(),
        );
        self.leader_tickers = Some(tickers.clone());

        vec![Effect::StartLeading(tickers)]
    }

    fn become_follower(&mut self, leader_id: Option<String>) {
        self.stop_leading();
        self.role = NodeRole::Follower;
        self.leader_id = leader_id;
        self.votes_received.clear();
        self.election_timer.arm(self.config.election_timeout());
    }

    /// Gives up leadership without a message from a peer. Returns false when
    /// the node was not leading.
    pub fn resign(&mut self) -> bool {
        if !self.is_leader() {
            return false;
        }

        info!(
            "Node {} resigning leadership of term {}",
            self.id, self.current_term
        );
        self.become_follower(None);
        true
    }

    fn stop_leading(&mut self) {
        if let Some(tickers) = self.leader_tickers.take() {
            debug!("Node {} stopping leader tickers", self.id);
            tickers.stop();
        }
    }

    fn reply_vote(&self, candidate: &str, vote_granted: bool) -> Result<Vec<Effect>, RaftError> {
        let reply = Message::reply_vote(&self.id, candidate, vote_granted)?;
        Ok(vec![Effect::Publish(reply)])
    }
}

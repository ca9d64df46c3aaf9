//! The Raft consensus module.
//!
//! [`ConsensusModule`] runs leader election, log replication and commit
//! index advancement for one node. It talks to other nodes only through the
//! [`PeerTransport`] seam and hands committed entries to the state machine
//! through a [`CommitSender`].
//!
//! # Concurrency
//!
//! All mutable state (role, term, vote, log, peer indices, election timer)
//! lives in a single [`State`] behind one `std::sync::Mutex`. RPC handlers
//! and background tasks take the lock for the duration of one state
//! transition and never hold it across an `.await`. Outbound RPCs are sent
//! after the lock is released; when a reply arrives the lock is taken again
//! and the reply is checked against the term it was sent in, so late or
//! stale replies are discarded.
//!
//! Three background tasks run per module:
//!
//! - **election timer**: polls every 10ms, starts an election when a
//!   follower or candidate has heard nothing for its randomized timeout
//! - **replicator**: on every heartbeat tick, or when poked by `submit` or a
//!   commit advance, sends AppendEntries to each peer while leader
//! - **commit sender**: publishes newly committed entries in index order
//!
//! All three exit once [`ConsensusModule::stop`] fires the quit signal.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::command::Command;
use crate::commit::{CommitEntry, CommitSender};
use crate::config::RaftConfig;
use crate::observer::Observer;
use crate::rpc::{
    AppendEntriesArgs, AppendEntriesReply, LogEntry, MAX_APPEND_BYTES, NodeId, RequestVoteArgs,
    RequestVoteReply, RpcError,
};
use crate::signal::{Signal, fired};
use crate::storage::{Storage, StorageError};

const TERM_KEY: &str = "current_term";
const VOTE_KEY: &str = "voted_for";
const LOG_KEY: &str = "log";

const ELECTION_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on entries shipped in one AppendEntries call.
const MAX_ENTRIES_PER_APPEND: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Dead,
}

/// Outbound half of the peer service.
///
/// The server implements this over TCP; tests implement it in memory.
/// Errors are transient from the module's point of view: the next heartbeat
/// or election simply tries again. Implementations bound every call with
/// their own deadline and must never answer one request with the reply to
/// another.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn request_vote(
        &self,
        peer: &str,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, RpcError>;

    async fn append_entries(
        &self,
        peer: &str,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RpcError>;
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("consensus module is stopped")]
    Stopped,
    #[error("failed to persist raft state: {0}")]
    Storage(#[from] StorageError),
}

/// Snapshot of a node's consensus state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub id: NodeId,
    pub term: u64,
    pub role: Role,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub log_len: u64,
}

struct State {
    role: Role,
    current_term: u64,
    voted_for: Option<NodeId>,
    /// Entry `i` of the Raft log lives at `log[i - 1]`.
    log: Vec<LogEntry>,
    commit_index: u64,
    last_applied: u64,
    leader_id: Option<NodeId>,
    election_reset: Instant,
    election_timeout: Duration,
    peer_ids: BTreeSet<NodeId>,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    votes: BTreeSet<NodeId>,
    /// Term, vote or log changed since the last successful persist.
    dirty: bool,
}

impl State {
    fn last_log_index(&self) -> u64 {
        self.log.len() as u64
    }

    fn last_log_index_and_term(&self) -> (u64, u64) {
        let index = self.last_log_index();
        (index, self.term_at(index))
    }

    /// Term of the entry at `index`, 0 for index 0 or past the end.
    fn term_at(&self, index: u64) -> u64 {
        if index == 0 {
            return 0;
        }
        self.log
            .get(index as usize - 1)
            .map(|entry| entry.term)
            .unwrap_or(0)
    }

    fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.log
            .iter()
            .rposition(|entry| entry.term == term)
            .map(|pos| pos as u64 + 1)
    }

    /// First index of the run of `term` entries that ends at `index`.
    fn first_index_of_term(&self, term: u64, mut index: u64) -> u64 {
        while index > 1 && self.term_at(index - 1) == term {
            index -= 1;
        }
        index
    }

    fn is_quorum(&self, count: usize) -> bool {
        count * 2 > self.peer_ids.len() + 1
    }

    fn reset_election_timer(&mut self, config: &RaftConfig) {
        self.election_reset = Instant::now();
        self.election_timeout = config.random_election_timeout();
    }
}

/// Entries from the front of `pending` that fit in one AppendEntries call,
/// capped by count and by encoded size. The first entry always goes out so
/// a lagging follower keeps making progress.
fn append_batch(pending: &[LogEntry]) -> Vec<LogEntry> {
    let mut bytes: u64 = 0;
    let mut end = 0;
    for entry in pending.iter().take(MAX_ENTRIES_PER_APPEND) {
        let size = bincode::serialized_size(entry).unwrap_or(u64::MAX);
        bytes = bytes.saturating_add(size);
        if end > 0 && bytes > MAX_APPEND_BYTES as u64 {
            break;
        }
        end += 1;
    }
    pending[..end].to_vec()
}

/// Largest log index stored on a majority, given one match index per
/// cluster member (the leader contributes its own last index).
pub fn majority_match_index(match_indexes: &mut [u64]) -> u64 {
    if match_indexes.is_empty() {
        return 0;
    }
    match_indexes.sort_unstable();
    match_indexes[(match_indexes.len() - 1) / 2]
}

struct Inner {
    id: NodeId,
    config: RaftConfig,
    state: Mutex<State>,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn PeerTransport>,
    observer: Arc<dyn Observer>,
    replicate: Notify,
    commit_ready: Notify,
    ready: Signal,
    quit: Signal,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running consensus module. Cheap to clone.
#[derive(Clone)]
pub struct ConsensusModule {
    inner: Arc<Inner>,
}

impl ConsensusModule {
    /// Creates the module and spawns its background tasks on the current
    /// tokio runtime.
    ///
    /// Term, vote and log are restored from `storage` when it holds data.
    /// No election can start until [`start`](Self::start) is called.
    pub fn new(
        id: impl Into<NodeId>,
        config: RaftConfig,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn PeerTransport>,
        observer: Arc<dyn Observer>,
        commit_tx: CommitSender,
    ) -> Result<Self, ConsensusError> {
        let id = id.into();
        let (current_term, voted_for, log) = restore(storage.as_ref())?;
        if current_term > 0 || !log.is_empty() {
            info!(node = %id, term = current_term, log_len = log.len(), "restored persisted state");
        }

        let election_timeout = config.random_election_timeout();
        let state = State {
            role: Role::Follower,
            current_term,
            voted_for,
            log,
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            election_reset: Instant::now(),
            election_timeout,
            peer_ids: BTreeSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes: BTreeSet::new(),
            dirty: false,
        };

        let inner = Arc::new(Inner {
            id,
            config,
            state: Mutex::new(state),
            storage,
            transport,
            observer,
            replicate: Notify::new(),
            commit_ready: Notify::new(),
            ready: Signal::new(),
            quit: Signal::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let tasks = vec![
            tokio::spawn(run_election_timer(Arc::clone(&inner))),
            tokio::spawn(run_replicator(Arc::clone(&inner))),
            tokio::spawn(run_commit_sender(Arc::clone(&inner), commit_tx)),
        ];
        *inner.tasks.lock().unwrap_or_else(PoisonError::into_inner) = tasks;

        Ok(Self { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Lets the election timer run. Called once every known peer has been
    /// registered.
    pub fn start(&self) {
        if !self.inner.ready.is_fired() {
            self.inner.state().reset_election_timer(&self.inner.config);
            self.inner.ready.fire();
        }
    }

    /// Registers a voting peer.
    pub fn add_peer_id(&self, peer: impl Into<NodeId>) {
        let peer = peer.into();
        if peer == self.inner.id {
            return;
        }
        let mut state = self.inner.state();
        if state.peer_ids.insert(peer.clone()) && state.role == Role::Leader {
            let next = state.last_log_index() + 1;
            state.next_index.insert(peer.clone(), next);
            state.match_index.insert(peer, 0);
        }
    }

    pub fn report(&self) -> Status {
        let state = self.inner.state();
        Status {
            id: self.inner.id.clone(),
            term: state.current_term,
            role: state.role,
            leader_id: state.leader_id.clone(),
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            log_len: state.last_log_index(),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.state().role
    }

    /// Id of the leader this node last heard from in its current term.
    pub fn leader_id(&self) -> Option<NodeId> {
        self.inner.state().leader_id.clone()
    }

    /// Copy of the local log, for diagnostics and tests.
    pub fn log(&self) -> Vec<LogEntry> {
        self.inner.state().log.clone()
    }

    /// Appends `command` to the log if this node believes it is the leader.
    ///
    /// Returns immediately. `true` only means the entry was appended
    /// locally; whether it commits is observed through the commit stream.
    pub fn submit(&self, command: Command) -> bool {
        let inner = &self.inner;
        let mut state = inner.state();
        if state.role != Role::Leader {
            return false;
        }

        let term = state.current_term;
        state.log.push(LogEntry { term, command });
        state.dirty = true;
        if inner.sync(&mut state).is_err() {
            return false;
        }
        debug!(node = %inner.id, index = state.last_log_index(), term, "submitted");

        inner.advance_commit_index(&mut state);
        inner.replicate.notify_one();
        true
    }

    /// Handles an incoming RequestVote RPC.
    pub fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply, ConsensusError> {
        let inner = &self.inner;
        let mut state = inner.state();
        if state.role == Role::Dead {
            return Err(ConsensusError::Stopped);
        }

        if args.term > state.current_term {
            debug!(node = %inner.id, term = args.term, "term out of date in RequestVote");
            inner.step_down(&mut state, args.term);
        }

        let (last_index, last_term) = state.last_log_index_and_term();
        let log_ok = args.last_log_term > last_term
            || (args.last_log_term == last_term && args.last_log_index >= last_index);
        let vote_free = state
            .voted_for
            .as_ref()
            .map_or(true, |voted| *voted == args.candidate_id);

        let vote_granted = args.term == state.current_term && vote_free && log_ok;
        if vote_granted && state.voted_for.is_none() {
            state.voted_for = Some(args.candidate_id.clone());
            state.dirty = true;
        }
        if vote_granted {
            state.reset_election_timer(&inner.config);
        }

        inner.sync(&mut state)?;
        debug!(
            node = %inner.id,
            candidate = %args.candidate_id,
            term = args.term,
            vote_granted,
            "handled RequestVote"
        );
        Ok(RequestVoteReply {
            term: state.current_term,
            vote_granted,
        })
    }

    /// Handles an incoming AppendEntries RPC.
    pub fn append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, ConsensusError> {
        let inner = &self.inner;
        let mut state = inner.state();
        if state.role == Role::Dead {
            return Err(ConsensusError::Stopped);
        }

        if args.term > state.current_term {
            debug!(node = %inner.id, term = args.term, "term out of date in AppendEntries");
            inner.step_down(&mut state, args.term);
        }

        let mut reply = AppendEntriesReply {
            term: 0,
            success: false,
            conflict_index: 0,
            conflict_term: None,
        };

        if args.term == state.current_term {
            if state.role != Role::Follower {
                inner.step_down(&mut state, args.term);
            }
            state.reset_election_timer(&inner.config);
            state.leader_id = Some(args.leader_id.clone());

            let last_index = state.last_log_index();
            let prev_matches = args.prev_log_index == 0
                || (args.prev_log_index <= last_index
                    && state.term_at(args.prev_log_index) == args.prev_log_term);

            if prev_matches {
                reply.success = true;
                inner.merge_entries(&mut state, &args);
            } else if args.prev_log_index > last_index {
                reply.conflict_index = last_index + 1;
            } else {
                let conflict_term = state.term_at(args.prev_log_index);
                reply.conflict_term = Some(conflict_term);
                reply.conflict_index = state.first_index_of_term(conflict_term, args.prev_log_index);
            }
        }

        reply.term = state.current_term;
        inner.sync(&mut state)?;
        Ok(reply)
    }

    /// Moves to [`Role::Dead`] and signals every background task to exit.
    pub fn stop(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state();
            inner.set_role(&mut state, Role::Dead);
        }
        inner.quit.fire();
        info!(node = %inner.id, "consensus module stopped");
    }

    /// Waits for the background tasks to finish after [`stop`](Self::stop).
    pub async fn join(&self) {
        let handles: Vec<_> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for result in futures::future::join_all(handles).await {
            if let Err(err) = result {
                warn!(node = %self.inner.id, error = %err, "consensus task ended abnormally");
            }
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_role(&self, state: &mut State, role: Role) {
        if state.role != role {
            let from = state.role;
            state.role = role;
            self.observer
                .role_changed(&self.id, state.current_term, from, role);
        }
    }

    /// Reverts to follower, adopting `term` if it is newer. The election
    /// timer is only reset when leaving the candidate or leader role.
    fn step_down(&self, state: &mut State, term: u64) {
        if term > state.current_term {
            state.current_term = term;
            state.voted_for = None;
            state.leader_id = None;
            state.dirty = true;
        }
        if state.role != Role::Follower && state.role != Role::Dead {
            if state.role == Role::Leader {
                state.leader_id = None;
            }
            self.set_role(state, Role::Follower);
            state.reset_election_timer(&self.config);
        }
    }

    /// Persists term, vote and log if any of them changed. A storage
    /// failure stops the module.
    fn sync(&self, state: &mut State) -> Result<(), ConsensusError> {
        if !state.dirty {
            return Ok(());
        }
        match self.persist(state) {
            Ok(()) => {
                state.dirty = false;
                Ok(())
            }
            Err(err) => {
                error!(node = %self.id, error = %err, "failed to persist raft state, stopping");
                self.set_role(state, Role::Dead);
                self.quit.fire();
                Err(err.into())
            }
        }
    }

    fn persist(&self, state: &State) -> Result<(), StorageError> {
        self.storage.set(TERM_KEY, encode(TERM_KEY, &state.current_term)?)?;
        self.storage.set(VOTE_KEY, encode(VOTE_KEY, &state.voted_for)?)?;
        self.storage.set(LOG_KEY, encode(LOG_KEY, &state.log)?)?;
        Ok(())
    }

    /// Appends the entries of an accepted AppendEntries call. Entries that
    /// already match are skipped, so retransmissions leave the log alone.
    fn merge_entries(&self, state: &mut State, args: &AppendEntriesArgs) {
        let mut log_insert = args.prev_log_index + 1;
        let mut new_from = 0;
        while log_insert <= state.last_log_index()
            && new_from < args.entries.len()
            && state.term_at(log_insert) == args.entries[new_from].term
        {
            log_insert += 1;
            new_from += 1;
        }

        if new_from < args.entries.len() {
            state.log.truncate(log_insert as usize - 1);
            state.log.extend_from_slice(&args.entries[new_from..]);
            state.dirty = true;
            debug!(node = %self.id, log_len = state.log.len(), "log updated");
        }

        let last_new = args.prev_log_index + args.entries.len() as u64;
        let new_commit = args.leader_commit.min(last_new);
        if new_commit > state.commit_index {
            self.commit_through(state, new_commit);
        }
    }

    fn commit_through(&self, state: &mut State, index: u64) {
        for committed in state.commit_index + 1..=index {
            self.observer
                .entry_committed(&self.id, committed, state.term_at(committed));
        }
        state.commit_index = index;
        self.commit_ready.notify_one();
    }

    /// Leader only: commits the majority match index if it belongs to the
    /// current term. Older-term entries become committed implicitly once a
    /// current-term entry after them does.
    fn advance_commit_index(&self, state: &mut State) {
        if state.role != Role::Leader {
            return;
        }
        let mut matched: Vec<u64> = state
            .peer_ids
            .iter()
            .map(|peer| state.match_index.get(peer).copied().unwrap_or(0))
            .collect();
        matched.push(state.last_log_index());

        let candidate = majority_match_index(&mut matched);
        if candidate > state.commit_index && state.term_at(candidate) == state.current_term {
            debug!(node = %self.id, commit_index = candidate, "leader advanced commit index");
            self.commit_through(state, candidate);
            self.replicate.notify_one();
        }
    }

    fn check_election_timeout(self: &Arc<Self>) {
        let state = self.state();
        if !matches!(state.role, Role::Follower | Role::Candidate) {
            return;
        }
        if state.election_reset.elapsed() >= state.election_timeout {
            self.start_election(state);
        }
    }

    fn start_election(self: &Arc<Self>, mut state: MutexGuard<'_, State>) {
        state.current_term += 1;
        state.voted_for = Some(self.id.clone());
        state.leader_id = None;
        state.dirty = true;
        self.set_role(&mut state, Role::Candidate);
        state.reset_election_timer(&self.config);
        state.votes = BTreeSet::from([self.id.clone()]);
        if self.sync(&mut state).is_err() {
            return;
        }

        let term = state.current_term;
        info!(node = %self.id, term, "starting election");
        if state.is_quorum(state.votes.len()) {
            self.become_leader(&mut state);
            return;
        }

        let (last_log_index, last_log_term) = state.last_log_index_and_term();
        let peers: Vec<NodeId> = state.peer_ids.iter().cloned().collect();
        drop(state);

        for peer in peers {
            let args = RequestVoteArgs {
                term,
                candidate_id: self.id.clone(),
                last_log_index,
                last_log_term,
            };
            tokio::spawn(Arc::clone(self).solicit_vote(peer, args));
        }
    }

    #[instrument(level = "debug", skip_all, fields(node = %self.id, peer = %peer, term = args.term))]
    async fn solicit_vote(self: Arc<Self>, peer: NodeId, args: RequestVoteArgs) {
        let call = self.transport.request_vote(&peer, args.clone());
        let Some(reply) = self.await_reply(&peer, "RequestVote", call).await else {
            return;
        };

        let mut state = self.state();
        if state.role != Role::Candidate {
            return;
        }
        if reply.term > state.current_term {
            debug!(node = %self.id, peer = %peer, term = reply.term, "newer term in vote reply");
            self.step_down(&mut state, reply.term);
        }
        if self.sync(&mut state).is_err() || state.role != Role::Candidate {
            return;
        }
        if reply.vote_granted && reply.term == args.term && state.current_term == args.term {
            state.votes.insert(peer);
            if state.is_quorum(state.votes.len()) {
                self.become_leader(&mut state);
            }
        }
    }

    fn become_leader(&self, state: &mut State) {
        self.set_role(state, Role::Leader);
        state.leader_id = Some(self.id.clone());
        let next = state.last_log_index() + 1;
        let peers: Vec<NodeId> = state.peer_ids.iter().cloned().collect();
        for peer in peers {
            state.next_index.insert(peer.clone(), next);
            state.match_index.insert(peer, 0);
        }
        info!(node = %self.id, term = state.current_term, "became leader");
        self.replicate.notify_one();
    }

    fn broadcast_append_entries(self: &Arc<Self>) {
        let state = self.state();
        if state.role != Role::Leader {
            return;
        }

        let last_index = state.last_log_index();
        let mut calls = Vec::with_capacity(state.peer_ids.len());
        for peer in &state.peer_ids {
            let next_index = state
                .next_index
                .get(peer)
                .copied()
                .unwrap_or(last_index + 1)
                .clamp(1, last_index + 1);
            let prev_log_index = next_index - 1;
            calls.push((
                peer.clone(),
                AppendEntriesArgs {
                    term: state.current_term,
                    leader_id: self.id.clone(),
                    prev_log_index,
                    prev_log_term: state.term_at(prev_log_index),
                    entries: append_batch(&state.log[prev_log_index as usize..]),
                    leader_commit: state.commit_index,
                },
            ));
        }
        drop(state);

        for (peer, args) in calls {
            tokio::spawn(Arc::clone(self).replicate_to(peer, args));
        }
    }

    #[instrument(
        level = "debug",
        skip_all,
        fields(node = %self.id, peer = %peer, prev_log_index = args.prev_log_index, entries = args.entries.len())
    )]
    async fn replicate_to(self: Arc<Self>, peer: NodeId, args: AppendEntriesArgs) {
        let call = self.transport.append_entries(&peer, args.clone());
        let Some(reply) = self.await_reply(&peer, "AppendEntries", call).await else {
            return;
        };

        let mut state = self.state();
        if state.role == Role::Dead {
            return;
        }
        if reply.term > state.current_term {
            debug!(node = %self.id, peer = %peer, term = reply.term, "newer term in append reply");
            self.step_down(&mut state, reply.term);
        }
        if self.sync(&mut state).is_err()
            || state.role != Role::Leader
            || state.current_term != args.term
            || reply.term != args.term
        {
            return;
        }

        if reply.success {
            let matched = args.prev_log_index + args.entries.len() as u64;
            let previous = state.match_index.get(&peer).copied().unwrap_or(0);
            let next = state.next_index.get(&peer).copied().unwrap_or(1);
            state.next_index.insert(peer.clone(), next.max(matched + 1));
            if matched > previous {
                state.match_index.insert(peer, matched);
                self.advance_commit_index(&mut state);
            }
        } else {
            let next = match reply.conflict_term {
                Some(term) => state
                    .last_index_of_term(term)
                    .map(|index| index + 1)
                    .unwrap_or(reply.conflict_index),
                None => reply.conflict_index,
            };
            let next = next.clamp(1, state.last_log_index() + 1);
            debug!(node = %self.id, peer = %peer, next_index = next, "follower log diverged, backing up");
            state.next_index.insert(peer, next);
            self.replicate.notify_one();
        }
    }

    /// Awaits an outbound call. Deadlines belong to the transport. Failures
    /// are reported to the observer and swallowed.
    async fn await_reply<T>(
        &self,
        peer: &str,
        rpc: &'static str,
        call: impl std::future::Future<Output = Result<T, RpcError>>,
    ) -> Option<T> {
        match call.await {
            Ok(reply) => Some(reply),
            Err(err) => {
                self.observer
                    .peer_rpc_failed(&self.id, peer, rpc, &err.to_string());
                None
            }
        }
    }

    /// Committed entries not yet handed to the state machine.
    fn take_committed(&self) -> Vec<CommitEntry> {
        let mut state = self.state();
        if state.commit_index <= state.last_applied {
            return Vec::new();
        }
        let from = state.last_applied;
        let entries = state.log[from as usize..state.commit_index as usize]
            .iter()
            .enumerate()
            .map(|(offset, entry)| CommitEntry {
                command: entry.command.clone(),
                index: from + offset as u64 + 1,
                term: entry.term,
            })
            .collect();
        state.last_applied = state.commit_index;
        entries
    }
}

async fn run_election_timer(inner: Arc<Inner>) {
    let mut quit = inner.quit.listener();
    let mut ready = inner.ready.listener();
    tokio::select! {
        _ = fired(&mut quit) => return,
        _ = fired(&mut ready) => {}
    }

    let mut ticker = tokio::time::interval(ELECTION_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = fired(&mut quit) => return,
            _ = ticker.tick() => inner.check_election_timeout(),
        }
    }
}

async fn run_replicator(inner: Arc<Inner>) {
    let mut quit = inner.quit.listener();
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = fired(&mut quit) => return,
            _ = ticker.tick() => {}
            _ = inner.replicate.notified() => {}
        }
        inner.broadcast_append_entries();
    }
}

async fn run_commit_sender(inner: Arc<Inner>, mut commit_tx: CommitSender) {
    let mut quit = inner.quit.listener();
    loop {
        tokio::select! {
            _ = fired(&mut quit) => return,
            _ = inner.commit_ready.notified() => {}
        }
        for entry in inner.take_committed() {
            if let Err(err) = commit_tx.send(entry) {
                warn!(node = %inner.id, error = %err, "commit stream closed");
                return;
            }
        }
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|source| StorageError::Codec {
        key: key.to_string(),
        source,
    })
}

fn load<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> Result<Option<T>, StorageError> {
    storage
        .get(key)?
        .map(|bytes| {
            bincode::deserialize(&bytes).map_err(|source| StorageError::Codec {
                key: key.to_string(),
                source,
            })
        })
        .transpose()
}

fn restore(storage: &dyn Storage) -> Result<(u64, Option<NodeId>, Vec<LogEntry>), StorageError> {
    if !storage.has_data()? {
        return Ok((0, None, Vec::new()));
    }
    let term = load::<u64>(storage, TERM_KEY)?.unwrap_or(0);
    let voted_for = load::<Option<NodeId>>(storage, VOTE_KEY)?.flatten();
    let log = load::<Vec<LogEntry>>(storage, LOG_KEY)?.unwrap_or_default();
    Ok((term, voted_for, log))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::commit::{CommitReceiver, commit_channel};
    use crate::observer::NoopObserver;
    use crate::storage::MapStorage;

    /// In-memory transport: calls go straight to the target module unless
    /// either end has been isolated.
    #[derive(Default)]
    struct LocalNetwork {
        nodes: Mutex<HashMap<NodeId, ConsensusModule>>,
        isolated: Mutex<HashSet<NodeId>>,
    }

    impl LocalNetwork {
        fn target(&self, from: &str, to: &str) -> Result<ConsensusModule, RpcError> {
            let isolated = self.isolated.lock().unwrap();
            if isolated.contains(from) || isolated.contains(to) {
                return Err(RpcError::NotConnected(to.to_string()));
            }
            self.nodes
                .lock()
                .unwrap()
                .get(to)
                .cloned()
                .ok_or_else(|| RpcError::NotConnected(to.to_string()))
        }
    }

    struct LocalTransport {
        from: NodeId,
        network: Arc<LocalNetwork>,
    }

    #[async_trait]
    impl PeerTransport for LocalTransport {
        async fn request_vote(
            &self,
            peer: &str,
            args: RequestVoteArgs,
        ) -> Result<RequestVoteReply, RpcError> {
            self.network
                .target(&self.from, peer)?
                .request_vote(args)
                .map_err(|err| RpcError::NotConnected(err.to_string()))
        }

        async fn append_entries(
            &self,
            peer: &str,
            args: AppendEntriesArgs,
        ) -> Result<AppendEntriesReply, RpcError> {
            self.network
                .target(&self.from, peer)?
                .append_entries(args)
                .map_err(|err| RpcError::NotConnected(err.to_string()))
        }
    }

    /// Test harness for simulating a cluster without sockets.
    struct TestCluster {
        network: Arc<LocalNetwork>,
        ids: Vec<NodeId>,
        applied: HashMap<NodeId, Arc<Mutex<Vec<CommitEntry>>>>,
    }

    impl TestCluster {
        fn new(n: usize) -> Self {
            let network = Arc::new(LocalNetwork::default());
            let ids: Vec<NodeId> = (1..=n).map(|i| format!("n{i}")).collect();
            let mut applied = HashMap::new();

            for id in &ids {
                let (commit_tx, commit_rx) = commit_channel();
                let module = ConsensusModule::new(
                    id.clone(),
                    RaftConfig::default(),
                    Arc::new(MapStorage::new()),
                    Arc::new(LocalTransport {
                        from: id.clone(),
                        network: Arc::clone(&network),
                    }),
                    Arc::new(NoopObserver),
                    commit_tx,
                )
                .expect("create module");
                for peer in &ids {
                    module.add_peer_id(peer.clone());
                }
                applied.insert(id.clone(), collect_commits(commit_rx));
                network.nodes.lock().unwrap().insert(id.clone(), module);
            }

            for id in &ids {
                network.nodes.lock().unwrap()[id].start();
            }

            Self {
                network,
                ids,
                applied,
            }
        }

        fn node(&self, id: &str) -> ConsensusModule {
            self.network.nodes.lock().unwrap()[id].clone()
        }

        fn isolate(&self, id: &str) {
            self.network.isolated.lock().unwrap().insert(id.to_string());
        }

        fn heal(&self, id: &str) {
            self.network.isolated.lock().unwrap().remove(id);
        }

        fn leaders_among(&self, ids: &[NodeId]) -> Vec<(NodeId, u64)> {
            ids.iter()
                .map(|id| self.node(id).report())
                .filter(|status| status.role == Role::Leader)
                .map(|status| (status.id, status.term))
                .collect()
        }

        async fn wait_for_leader_among(&self, ids: &[NodeId]) -> NodeId {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                let leaders = self.leaders_among(ids);
                if leaders.len() == 1 {
                    return leaders[0].0.clone();
                }
                assert!(Instant::now() < deadline, "no single leader among {ids:?}");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }

        async fn wait_for_leader(&self) -> NodeId {
            let ids = self.ids.clone();
            self.wait_for_leader_among(&ids).await
        }

        fn applied(&self, id: &str) -> Vec<CommitEntry> {
            self.applied[id].lock().unwrap().clone()
        }

        async fn wait_for_applied(&self, id: &str, count: usize) -> Vec<CommitEntry> {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                let applied = self.applied(id);
                if applied.len() >= count {
                    return applied;
                }
                assert!(
                    Instant::now() < deadline,
                    "node {id} applied {} of {count} entries",
                    applied.len()
                );
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }

        fn stop_all(&self) {
            for id in &self.ids {
                self.node(id).stop();
            }
        }
    }

    fn collect_commits(mut commit_rx: CommitReceiver) -> Arc<Mutex<Vec<CommitEntry>>> {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&applied);
        tokio::spawn(async move {
            while let Some(entry) = commit_rx.recv().await {
                sink.lock().unwrap().push(entry);
            }
        });
        applied
    }

    /// A module whose election timer never starts, for poking RPC handlers
    /// directly.
    fn idle_module(id: &str, storage: Arc<dyn Storage>) -> (ConsensusModule, CommitReceiver) {
        let (commit_tx, commit_rx) = commit_channel();
        let module = ConsensusModule::new(
            id,
            RaftConfig::default(),
            storage,
            Arc::new(LocalTransport {
                from: id.to_string(),
                network: Arc::new(LocalNetwork::default()),
            }),
            Arc::new(NoopObserver),
            commit_tx,
        )
        .expect("create module");
        (module, commit_rx)
    }

    fn entry(term: u64, value: &str) -> LogEntry {
        LogEntry {
            term,
            command: Command::set("k", value),
        }
    }

    fn append(
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> AppendEntriesArgs {
        AppendEntriesArgs {
            term,
            leader_id: "leader".into(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        }
    }

    fn vote(term: u64, candidate: &str, last_log_index: u64, last_log_term: u64) -> RequestVoteArgs {
        RequestVoteArgs {
            term,
            candidate_id: candidate.into(),
            last_log_index,
            last_log_term,
        }
    }

    #[test]
    fn majority_match_index_picks_median() {
        assert_eq!(majority_match_index(&mut [5]), 5);
        assert_eq!(majority_match_index(&mut [7, 3, 5]), 5);
        assert_eq!(majority_match_index(&mut [9, 0, 0]), 0);
        assert_eq!(majority_match_index(&mut [4, 4, 2, 1]), 2);
        assert_eq!(majority_match_index(&mut [10, 8, 8, 3, 1]), 8);
        assert_eq!(majority_match_index(&mut []), 0);
    }

    #[tokio::test]
    async fn grants_vote_to_up_to_date_candidate() {
        let (node, _rx) = idle_module("n1", Arc::new(MapStorage::new()));

        let reply = node.request_vote(vote(1, "n2", 0, 0)).unwrap();
        assert!(reply.vote_granted);
        assert_eq!(reply.term, 1);
        assert_eq!(node.report().term, 1);
        assert_eq!(node.role(), Role::Follower);
    }

    #[tokio::test]
    async fn refuses_second_candidate_in_same_term() {
        let (node, _rx) = idle_module("n1", Arc::new(MapStorage::new()));

        assert!(node.request_vote(vote(1, "n2", 0, 0)).unwrap().vote_granted);
        assert!(!node.request_vote(vote(1, "n3", 0, 0)).unwrap().vote_granted);
        // the same candidate asking again keeps its vote
        assert!(node.request_vote(vote(1, "n2", 0, 0)).unwrap().vote_granted);
    }

    #[tokio::test]
    async fn refuses_candidate_with_stale_log() {
        let (node, _rx) = idle_module("n1", Arc::new(MapStorage::new()));
        node.append_entries(append(2, 0, 0, vec![entry(1, "a"), entry(2, "b")], 0))
            .unwrap();

        // older last term
        assert!(!node.request_vote(vote(3, "n2", 5, 1)).unwrap().vote_granted);
        // same last term, shorter log
        assert!(!node.request_vote(vote(3, "n3", 1, 2)).unwrap().vote_granted);
        // term was still adopted
        assert_eq!(node.report().term, 3);
        assert!(node.request_vote(vote(3, "n4", 2, 2)).unwrap().vote_granted);
    }

    #[tokio::test]
    async fn rejects_stale_term_requests() {
        let (node, _rx) = idle_module("n1", Arc::new(MapStorage::new()));
        node.request_vote(vote(5, "n2", 0, 0)).unwrap();

        let reply = node.request_vote(vote(4, "n3", 0, 0)).unwrap();
        assert!(!reply.vote_granted);
        assert_eq!(reply.term, 5);

        let reply = node.append_entries(append(4, 0, 0, vec![], 0)).unwrap();
        assert!(!reply.success);
        assert_eq!(reply.term, 5);
        assert_eq!(node.leader_id(), None);
    }

    #[tokio::test]
    async fn append_records_leader_and_adopts_term() {
        let (node, _rx) = idle_module("n1", Arc::new(MapStorage::new()));

        let reply = node.append_entries(append(3, 0, 0, vec![], 0)).unwrap();
        assert!(reply.success);
        assert_eq!(reply.term, 3);
        assert_eq!(node.leader_id().as_deref(), Some("leader"));
    }

    #[tokio::test]
    async fn short_log_reports_next_missing_index() {
        let (node, _rx) = idle_module("n1", Arc::new(MapStorage::new()));
        node.append_entries(append(1, 0, 0, vec![entry(1, "a")], 0))
            .unwrap();

        let reply = node
            .append_entries(append(1, 4, 1, vec![entry(1, "e")], 0))
            .unwrap();
        assert!(!reply.success);
        assert_eq!(reply.conflict_index, 2);
        assert_eq!(reply.conflict_term, None);
    }

    #[tokio::test]
    async fn term_mismatch_reports_first_index_of_conflicting_term() {
        let (node, _rx) = idle_module("n1", Arc::new(MapStorage::new()));
        let entries = vec![entry(1, "a"), entry(2, "b"), entry(2, "c"), entry(2, "d")];
        node.append_entries(append(2, 0, 0, entries, 0)).unwrap();

        let reply = node
            .append_entries(append(3, 4, 3, vec![entry(3, "x")], 0))
            .unwrap();
        assert!(!reply.success);
        assert_eq!(reply.conflict_term, Some(2));
        assert_eq!(reply.conflict_index, 2);
    }

    #[tokio::test]
    async fn retransmitted_entries_leave_log_unchanged() {
        let (node, _rx) = idle_module("n1", Arc::new(MapStorage::new()));
        let batch = append(1, 0, 0, vec![entry(1, "a"), entry(1, "b")], 0);

        node.append_entries(batch.clone()).unwrap();
        node.append_entries(append(1, 2, 1, vec![entry(1, "c")], 0))
            .unwrap();
        let before = node.log();

        // a late duplicate of the first batch must not drop entry 3
        let reply = node.append_entries(batch).unwrap();
        assert!(reply.success);
        assert_eq!(node.log(), before);
        assert_eq!(node.log().len(), 3);
    }

    #[tokio::test]
    async fn conflicting_suffix_is_truncated() {
        let (node, _rx) = idle_module("n1", Arc::new(MapStorage::new()));
        node.append_entries(append(1, 0, 0, vec![entry(1, "a"), entry(1, "b"), entry(1, "c")], 0))
            .unwrap();

        let reply = node
            .append_entries(append(2, 1, 1, vec![entry(2, "x")], 0))
            .unwrap();
        assert!(reply.success);
        assert_eq!(node.log(), vec![entry(1, "a"), entry(2, "x")]);
    }

    #[tokio::test]
    async fn commit_index_is_capped_by_last_new_entry() {
        let (node, mut commit_rx) = idle_module("n1", Arc::new(MapStorage::new()));
        node.append_entries(append(1, 0, 0, vec![entry(1, "a"), entry(1, "b")], 10))
            .unwrap();
        assert_eq!(node.report().commit_index, 2);

        let first = commit_rx.recv().await.expect("first commit");
        let second = commit_rx.recv().await.expect("second commit");
        assert_eq!((first.index, second.index), (1, 2));
        assert_eq!(second.command, Command::set("k", "b"));
    }

    #[tokio::test]
    async fn persisted_state_survives_restart() {
        let storage: Arc<dyn Storage> = Arc::new(MapStorage::new());
        {
            let (node, _rx) = idle_module("n1", Arc::clone(&storage));
            node.append_entries(append(4, 0, 0, vec![entry(4, "a")], 0))
                .unwrap();
            node.request_vote(vote(5, "n2", 1, 4)).unwrap();
            node.stop();
        }

        let (restarted, _rx) = idle_module("n1", storage);
        let status = restarted.report();
        assert_eq!(status.term, 5);
        assert_eq!(status.log_len, 1);
        assert_eq!(status.commit_index, 0);
        // the vote for n2 in term 5 is remembered
        assert!(!restarted.request_vote(vote(5, "n3", 1, 4)).unwrap().vote_granted);
    }

    struct FailingStorage;

    impl Storage for FailingStorage {
        fn set(&self, _key: &str, _value: Vec<u8>) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disk gone".into()))
        }

        fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            Ok(None)
        }

        fn has_data(&self) -> Result<bool, StorageError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn storage_failure_stops_the_module() {
        let (node, _rx) = idle_module("n1", Arc::new(FailingStorage));

        let result = node.request_vote(vote(1, "n2", 0, 0));
        assert!(matches!(result, Err(ConsensusError::Storage(_))));
        assert_eq!(node.role(), Role::Dead);
        assert!(matches!(
            node.append_entries(append(1, 0, 0, vec![], 0)),
            Err(ConsensusError::Stopped)
        ));
    }

    #[tokio::test]
    async fn stopped_module_refuses_everything() {
        let (node, _rx) = idle_module("n1", Arc::new(MapStorage::new()));
        node.stop();
        node.join().await;

        assert_eq!(node.role(), Role::Dead);
        assert!(!node.submit(Command::set("k", "v")));
        assert!(matches!(
            node.request_vote(vote(1, "n2", 0, 0)),
            Err(ConsensusError::Stopped)
        ));
    }

    #[tokio::test]
    async fn single_node_elects_itself_and_commits() {
        let cluster = TestCluster::new(1);
        let leader = cluster.wait_for_leader().await;
        assert_eq!(leader, "n1");

        assert!(cluster.node("n1").submit(Command::set("k", "v")));
        let applied = cluster.wait_for_applied("n1", 1).await;
        assert_eq!(applied[0].command, Command::set("k", "v"));
        cluster.stop_all();
    }

    #[tokio::test]
    async fn three_nodes_elect_one_leader() {
        let cluster = TestCluster::new(3);
        let leader = cluster.wait_for_leader().await;
        let term = cluster.node(&leader).report().term;

        // followers learn who leads once heartbeats arrive
        tokio::time::sleep(Duration::from_millis(200)).await;
        for id in &cluster.ids {
            let status = cluster.node(id).report();
            assert!(status.term >= term);
            if status.term == term {
                assert_eq!(status.leader_id.as_deref(), Some(leader.as_str()));
            }
        }
        cluster.stop_all();
    }

    #[tokio::test]
    async fn never_two_leaders_in_one_term() {
        let cluster = TestCluster::new(5);
        let ids = cluster.ids.clone();
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) {
            let leaders = cluster.leaders_among(&ids);
            let terms: HashSet<u64> = leaders.iter().map(|(_, term)| *term).collect();
            assert_eq!(terms.len(), leaders.len(), "split brain: {leaders:?}");

            // keep elections coming
            if let Some((leader, _)) = leaders.first() {
                if start.elapsed() > Duration::from_millis(700) {
                    cluster.isolate(leader);
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cluster.stop_all();
    }

    #[tokio::test]
    async fn followers_reject_submit() {
        let cluster = TestCluster::new(3);
        let leader = cluster.wait_for_leader().await;
        for id in cluster.ids.iter().filter(|id| **id != leader) {
            assert!(!cluster.node(id).submit(Command::set("k", "v")));
        }
        cluster.stop_all();
    }

    #[tokio::test]
    async fn committed_entries_reach_every_node_in_order() {
        let cluster = TestCluster::new(3);
        let leader = cluster.wait_for_leader().await;
        let node = cluster.node(&leader);
        for i in 0..5 {
            assert!(node.submit(Command::set(format!("k{i}"), format!("v{i}"))));
        }

        let reference = cluster.wait_for_applied(&leader, 5).await;
        for id in &cluster.ids {
            let applied = cluster.wait_for_applied(id, 5).await;
            let indexes: Vec<u64> = applied.iter().map(|entry| entry.index).collect();
            assert_eq!(indexes, vec![1, 2, 3, 4, 5]);
            assert_eq!(applied, reference);
        }
        cluster.stop_all();
    }

    #[tokio::test]
    async fn minority_leader_stalls_and_converges_after_heal() {
        let cluster = TestCluster::new(3);
        let old_leader = cluster.wait_for_leader().await;
        assert!(cluster.node(&old_leader).submit(Command::set("k", "v1")));
        cluster.wait_for_applied(&old_leader, 1).await;

        cluster.isolate(&old_leader);
        // still believes it leads; the entry can never commit
        assert!(cluster.node(&old_leader).submit(Command::set("k", "lost")));

        let majority: Vec<NodeId> = cluster
            .ids
            .iter()
            .filter(|id| **id != old_leader)
            .cloned()
            .collect();
        let new_leader = cluster.wait_for_leader_among(&majority).await;
        assert!(cluster.node(&new_leader).submit(Command::set("k", "v2")));
        cluster.wait_for_applied(&new_leader, 2).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(cluster.node(&old_leader).report().commit_index, 1);

        cluster.heal(&old_leader);
        let applied = cluster.wait_for_applied(&old_leader, 2).await;
        assert_eq!(applied[1].command, Command::set("k", "v2"));

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let logs: Vec<Vec<LogEntry>> =
                cluster.ids.iter().map(|id| cluster.node(id).log()).collect();
            if logs.windows(2).all(|pair| pair[0] == pair[1]) {
                assert!(logs[0].iter().all(|e| e.command != Command::set("k", "lost")));
                break;
            }
            assert!(Instant::now() < deadline, "logs did not converge: {logs:?}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_ne!(cluster.node(&old_leader).role(), Role::Leader);
        cluster.stop_all();
    }

    fn entry_of(bytes: usize) -> LogEntry {
        LogEntry {
            term: 1,
            command: Command::set("k", "x".repeat(bytes)),
        }
    }

    #[test]
    fn append_batch_is_cut_by_encoded_size() {
        let big = crate::rpc::MAX_COMMAND_BYTES - 64;
        let pending = vec![entry_of(big), entry_of(big), entry_of(big)];
        let batch = append_batch(&pending);
        assert_eq!(batch.len(), 2);

        // one batch of the largest accepted commands still fits in a frame
        let args = AppendEntriesArgs {
            term: 1,
            leader_id: "n1".into(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: batch,
            leader_commit: 0,
        };
        let size = bincode::serialized_size(&crate::rpc::Request::AppendEntries(args)).unwrap();
        assert!(size < crate::rpc::MAX_FRAME_LEN as u64);
    }

    #[test]
    fn append_batch_is_cut_by_count() {
        let pending: Vec<LogEntry> = (0..MAX_ENTRIES_PER_APPEND + 10).map(|_| entry_of(8)).collect();
        assert_eq!(append_batch(&pending).len(), MAX_ENTRIES_PER_APPEND);
        assert!(append_batch(&[]).is_empty());
    }

    #[test]
    fn oversized_single_entry_still_goes_out() {
        let pending = vec![entry_of(MAX_APPEND_BYTES + 1), entry_of(8)];
        assert_eq!(append_batch(&pending).len(), 1);
    }
}

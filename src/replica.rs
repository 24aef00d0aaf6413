use crate::cluster::Cluster;
use crate::message::{Body, Envelope, LogEntry, BROADCAST};
use crate::state_machine::KeyValueStore;
use crate::timer::Timer;
use crossbeam_channel::{Receiver, RecvTimeoutError, Select};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::Rng;
use std::cmp;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

// A follower that hears nothing from a leader within a timeout drawn from
// this range (milliseconds) starts an election. Re-randomized on every arm
// to keep split votes rare.
const ELECTION_TIMEOUT: (u64, u64) = (400, 650);

// How often the leader must contact each peer.
const HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(175);

// A leader that cannot show responses from a quorum within this window
// abandons leadership rather than keep serving possibly-stale reads.
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(800);

// Cap on entries per append so a record stays well inside one datagram.
const APPEND_BATCH: usize = 10;

#[derive(Clone, Copy, PartialEq, Debug)]
enum State {
    Follower,
    Candidate,
    Leader,
}

// One in-flight `get`, parked until a quorum has been heard from at or after
// `arrived`. That confirms this replica was still leader when the read came
// in, so the applied state cannot be stale.
struct PendingRead {
    client: String,
    key: String,
    mid: String,
    arrived: Instant,
}

/// Replica is the consensus core: a single state machine that owns the
/// replicated log, the applied key→value state, and the client-facing
/// semantics, driven by one event loop. All mutation happens on the loop
/// thread; the transport feeds decoded records in through a channel.
pub struct Replica<C: Cluster> {
    /// ID of this replica.
    id: String,

    /// IDs of the other replicas in the cluster.
    peer_ids: Vec<String>,

    /// Interface the replica uses to reach the rest of the cluster and its
    /// clients.
    cluster: C,

    /// Applied key→value state. Committed entries only, in log order.
    store: KeyValueStore,

    /// Role of this replica.
    state: State,

    /// Current term.
    current_term: u64,

    /// Who the vote was cast for in `current_term`, if anyone.
    voted_for: Option<String>,

    /// IDs of peers with votes for self.
    current_votes: Option<Box<BTreeSet<String>>>,

    /// Believed leader, BROADCAST while unknown.
    leader: String,

    /// The replicated log. Zero-indexed; followers may truncate a
    /// conflicting suffix, never a committed prefix.
    log: Vec<LogEntry>,

    /// Highest log index known to be committed; -1 before the first commit.
    commit_index: i64,

    /// Highest log index applied to the store.
    last_applied: i64,

    /// For each peer, the next log index to send. Leaders only.
    next_index: BTreeMap<String, usize>,

    /// For each peer, the highest index verified replicated there; -1 when
    /// unknown. Leaders only.
    match_index: BTreeMap<String, i64>,

    /// When each peer was last sent an append. Leaders only.
    last_send: BTreeMap<String, Instant>,

    /// When each peer was last heard from at all. Drives the read-freshness
    /// check and the step-down deadline.
    last_heard: BTreeMap<String, Instant>,

    /// Reads waiting on the leadership freshness check.
    pending_reads: Vec<PendingRead>,

    /// Paces leader appends.
    heartbeat_timer: Timer,

    /// If no leader is heard before this deadline, campaign.
    next_election_deadline: Instant,

    /// Source of election jitter. Injected so tests can pin the seed.
    rng: StdRng,
}

impl<C: Cluster> Replica<C> {
    /// Create a new replica. `peer_ids` lists every other replica in the
    /// cluster; the set is fixed for the life of the process.
    pub fn new(id: &str, peer_ids: Vec<String>, cluster: C, rng: StdRng) -> Replica<C> {
        let now = Instant::now();
        let mut replica = Replica {
            id: id.to_string(),
            peer_ids,
            cluster,
            store: KeyValueStore::new(),
            state: State::Follower,
            current_term: 0,
            voted_for: None,
            current_votes: None,
            leader: BROADCAST.to_string(),
            log: Vec::new(),
            commit_index: -1,
            last_applied: -1,
            next_index: BTreeMap::new(),
            match_index: BTreeMap::new(),
            last_send: BTreeMap::new(),
            last_heard: BTreeMap::new(),
            pending_reads: Vec::new(),
            heartbeat_timer: Timer::new(HEARTBEAT_FREQUENCY),
            next_election_deadline: now,
            rng,
        };
        replica.update_election_deadline(now);
        replica
    }

    /// Announce ourselves and run the event loop until the cluster halts or
    /// the transport goes away.
    pub fn start(&mut self, inbox: Receiver<Envelope>) {
        info!("[{}] starting with peers {:?}", self.id, self.peer_ids);
        self.emit(BROADCAST, Body::Hello);
        self.update_election_deadline(Instant::now());
        while !self.cluster.halt() {
            let alive = match self.state {
                State::Leader => self.poll_as_leader(&inbox),
                State::Follower | State::Candidate => self.poll_with_election_deadline(&inbox),
            };
            if !alive {
                return;
            }
        }
    }

    // Leaders multiplex inbound records with heartbeat ticks, then settle
    // all leader duties: due appends, the step-down check, pending reads.
    fn poll_as_leader(&mut self, inbox: &Receiver<Envelope>) -> bool {
        let tick_rx = self.heartbeat_timer.get_rx().clone();
        let mut select = Select::new();
        let msg_op = select.recv(inbox);
        let tick_op = select.recv(&tick_rx);
        let oper = select.select();
        let index = oper.index();
        if index == msg_op {
            match oper.recv(inbox) {
                Ok(msg) => self.process_message(msg, Instant::now()),
                Err(_) => return false,
            }
        } else if index == tick_op {
            let _ = oper.recv(&tick_rx);
            self.heartbeat_timer.renew();
        }

        let now = Instant::now();
        if self.state == State::Leader {
            self.send_due_heartbeats(now);
            self.check_step_down(now);
            self.check_pending_reads();
        }
        true
    }

    // Followers and candidates block until a record arrives or the election
    // deadline passes, whichever is first.
    fn poll_with_election_deadline(&mut self, inbox: &Receiver<Envelope>) -> bool {
        match inbox.recv_deadline(self.next_election_deadline) {
            Ok(msg) => self.process_message(msg, Instant::now()),
            Err(RecvTimeoutError::Timeout) => self.become_candidate(Instant::now()),
            Err(RecvTimeoutError::Disconnected) => return false,
        }
        true
    }

    fn process_message(&mut self, msg: Envelope, now: Instant) {
        if self.peer_ids.contains(&msg.src) {
            self.last_heard.insert(msg.src.clone(), now);
        }

        // A newer term in any record forces follower state before dispatch.
        let term = match &msg.body {
            Body::RequestVote { term, .. } => Some(*term),
            Body::RequestVoteResponse { term } => Some(*term),
            Body::Append { term, .. } => Some(*term),
            _ => None,
        };
        if let Some(term) = term {
            if term > self.current_term {
                self.become_follower(term, now);
            }
        }

        match msg.body {
            Body::Hello => debug!("[{}] hello from {}", self.id, msg.src),
            Body::Get { .. } | Body::Put { .. } => self.process_client_request(msg, now),
            Body::Ok { .. } | Body::Redirect { .. } => {
                debug!("[{}] dropping client-bound record from {}", self.id, msg.src)
            }
            _ => match self.state {
                State::Leader => self.process_message_as_leader(msg, now),
                State::Candidate => self.process_message_as_candidate(msg, now),
                State::Follower => self.process_message_as_follower(msg, now),
            },
        }
    }

    // ---- client interface ----

    fn process_client_request(&mut self, msg: Envelope, now: Instant) {
        let Envelope { src, body, .. } = msg;
        match body {
            Body::Get { mid, key } => {
                if self.state == State::Leader {
                    self.handle_get(src, key, mid, now);
                } else {
                    self.emit(&src, Body::Redirect { mid });
                }
            }
            Body::Put { mid, key, value } => {
                if self.state == State::Leader {
                    self.handle_put(src, key, value, mid, now);
                } else {
                    self.emit(&src, Body::Redirect { mid });
                }
            }
            _ => {}
        }
    }

    fn handle_put(&mut self, client: String, key: String, value: String, mid: String, now: Instant) {
        // A retried MID means the original write is already in the log; it
        // is committed or will be. Acknowledge instead of appending twice.
        if self.log.iter().any(|e| e.mid == mid) {
            self.emit(&client, Body::Ok { mid, value: None });
            return;
        }
        debug!("[{}] accepted put {} at index {}", self.id, mid, self.log.len());
        self.log.push(LogEntry {
            term: self.current_term,
            key,
            value,
            client,
            origin_leader: self.id.clone(),
            mid,
        });
        self.broadcast_appends(now);
    }

    fn handle_get(&mut self, client: String, key: String, mid: String, now: Instant) {
        if !self.pending_reads.iter().any(|r| r.mid == mid) {
            self.pending_reads.push(PendingRead {
                client,
                key,
                mid,
                arrived: now,
            });
        }
        // The freshness check needs responses dated after the read arrived;
        // probe every peer immediately rather than wait for the next tick.
        self.broadcast_appends(now);
        // A cluster of one is its own quorum.
        self.check_pending_reads();
    }

    // Answer every read whose arrival time a quorum has confirmed us since.
    fn check_pending_reads(&mut self) {
        if self.pending_reads.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_reads);
        let (ready, waiting): (Vec<_>, Vec<_>) = pending.into_iter().partition(|read| {
            let fresh = self
                .last_heard
                .values()
                .filter(|heard| **heard >= read.arrived)
                .count();
            fresh + 1 >= self.quorum()
        });
        self.pending_reads = waiting;
        for read in ready {
            let value = self.store.get(&read.key).to_string();
            self.emit(
                &read.client,
                Body::Ok {
                    mid: read.mid,
                    value: Some(value),
                },
            );
        }
    }

    // ---- leader ----

    fn process_message_as_leader(&mut self, msg: Envelope, now: Instant) {
        let Envelope { src, body, .. } = msg;
        match body {
            Body::AppendResponse {
                success,
                match_index,
            } => self.process_append_response(src, success, match_index, now),
            Body::Append { term, .. } => {
                // Equal-term appends cannot come from another leader; drop.
                warn!(
                    "[{}] unexpected append from {} in term {}",
                    self.id, src, term
                );
            }
            // Our leadership for this term already has its quorum.
            Body::RequestVote { .. } | Body::RequestVoteResponse { .. } => {}
            _ => {}
        }
    }

    fn process_append_response(
        &mut self,
        peer: String,
        success: bool,
        match_index: Option<i64>,
        now: Instant,
    ) {
        if !self.peer_ids.contains(&peer) {
            return;
        }
        if success {
            let reported = match_index.unwrap_or(-1);
            if reported > self.last_log_index() {
                // We hold nothing at that index; ignore rather than run
                // next_index past the log.
                return;
            }
            // Never regress on a reordered older response.
            let matched = self.match_index.entry(peer.clone()).or_insert(-1);
            if reported > *matched {
                *matched = reported;
            }
            let next = (*matched + 1) as usize;
            self.next_index.insert(peer.clone(), next);
            self.advance_commit_index();
            if next < self.log.len() {
                // Still behind; push the next batch without waiting for a
                // heartbeat tick.
                self.send_append(&peer, now);
            }
        } else {
            let next = self.next_index.entry(peer.clone()).or_insert(0);
            *next = next.saturating_sub(1);
            self.send_append(&peer, now);
        }
    }

    // Move the commit index to the highest entry of the current term that a
    // quorum holds. Entries from earlier terms only commit through it.
    fn advance_commit_index(&mut self) {
        let mut n = self.last_log_index();
        while n > self.commit_index {
            let replicated = 1 + self.match_index.values().filter(|m| **m >= n).count();
            if replicated >= self.quorum() && self.log[n as usize].term == self.current_term {
                self.commit_index = n;
                break;
            }
            n -= 1;
        }
        self.apply_ready_entries();
    }

    // Apply every newly committed entry in order. On the leader this is
    // also the write-acknowledgement path: the entry is now durable on a
    // quorum, so its client gets an ok.
    fn apply_ready_entries(&mut self) {
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            let entry = self.log[self.last_applied as usize].clone();
            info!(
                "[{}] applied index {} ({} <- {:?})",
                self.id, self.last_applied, entry.key, entry.value
            );
            self.store.apply(&entry.key, &entry.value);
            if self.state == State::Leader {
                self.emit(
                    &entry.client,
                    Body::Ok {
                        mid: entry.mid.clone(),
                        value: None,
                    },
                );
            }
        }
    }

    fn broadcast_appends(&mut self, now: Instant) {
        for peer in self.peer_ids.clone() {
            self.send_append(&peer, now);
        }
    }

    // Send peer P its next batch, or a bare empty heartbeat when it has
    // nothing outstanding. Batches carry the consistency fields for the
    // position right before them, absent when the batch starts at index 0;
    // forced heartbeats carry none.
    fn send_append(&mut self, peer: &str, now: Instant) {
        let next = cmp::min(
            self.next_index.get(peer).copied().unwrap_or_else(|| self.log.len()),
            self.log.len(),
        );
        let (prev_log_index, prev_log_term) = if next == 0 || next == self.log.len() {
            (None, None)
        } else {
            (Some((next - 1) as u64), Some(self.log[next - 1].term))
        };
        let end = cmp::min(next + APPEND_BATCH, self.log.len());
        let entries = self.log[next..end].to_vec();
        self.emit(
            peer,
            Body::Append {
                term: self.current_term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
            },
        );
        self.last_send.insert(peer.to_string(), now);
    }

    fn send_due_heartbeats(&mut self, now: Instant) {
        for peer in self.peer_ids.clone() {
            let due = match self.last_send.get(&peer) {
                Some(sent) => now.duration_since(*sent) >= HEARTBEAT_FREQUENCY,
                None => true,
            };
            if due {
                self.send_append(&peer, now);
            }
        }
    }

    // A leader that cannot show a quorum of peers responding within
    // RESPONSE_TIMEOUT may have been partitioned away and deposed; abandon
    // leadership instead of answering reads from a stale lease.
    fn check_step_down(&mut self, now: Instant) {
        let fresh = self
            .last_heard
            .values()
            .filter(|heard| now.duration_since(**heard) <= RESPONSE_TIMEOUT)
            .count();
        if fresh + 1 < self.quorum() {
            info!(
                "[{}] no quorum heard within {:?}; stepping down",
                self.id, RESPONSE_TIMEOUT
            );
            self.leader = BROADCAST.to_string();
            self.become_follower(self.current_term, now);
        }
    }

    // ---- candidate ----

    fn process_message_as_candidate(&mut self, msg: Envelope, now: Instant) {
        match msg.body {
            Body::Append { term, .. } => {
                if term >= self.current_term {
                    // A legitimate leader for this term exists; stand down
                    // and handle the append as a follower.
                    self.become_follower(term, now);
                    self.process_message_as_follower(msg, now);
                }
            }
            Body::RequestVoteResponse { term } => {
                if term == self.current_term {
                    self.process_vote_response(msg.src, now);
                }
            }
            // We voted for ourselves this term.
            Body::RequestVote { .. } => {}
            Body::AppendResponse { .. } => {}
            _ => {}
        }
    }

    fn process_vote_response(&mut self, voter: String, now: Instant) {
        let quorum = self.quorum();
        if let Some(votes) = &mut self.current_votes {
            votes.insert(voter);
            if votes.len() >= quorum {
                self.become_leader(now);
            }
        }
    }

    // ---- follower ----

    fn process_message_as_follower(&mut self, msg: Envelope, now: Instant) {
        let Envelope { src, body, .. } = msg;
        match body {
            Body::RequestVote {
                term,
                last_log_index,
                last_log_term,
            } => self.process_vote_request(src, term, last_log_index, last_log_term, now),
            Body::Append {
                term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.process_append(
                src,
                term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                now,
            ),
            // Stale election traffic or leftovers from a lost leadership.
            Body::RequestVoteResponse { .. } => {}
            Body::AppendResponse { .. } => {}
            _ => {}
        }
    }

    // Grant at most one vote per term, and only to candidates whose log is
    // at least as up-to-date as ours. Denials are silent; the candidate
    // reads no response as a no.
    fn process_vote_request(
        &mut self,
        candidate: String,
        term: u64,
        last_log_index: i64,
        last_log_term: i64,
        now: Instant,
    ) {
        if term < self.current_term {
            return;
        }
        if let Some(voted_for) = &self.voted_for {
            if *voted_for != candidate {
                return;
            }
        }
        if (last_log_term, last_log_index) < (self.last_log_term(), self.last_log_index()) {
            return;
        }
        info!(
            "[{}] voting for {} in term {}",
            self.id, candidate, self.current_term
        );
        self.voted_for = Some(candidate.clone());
        self.update_election_deadline(now);
        self.emit(
            &candidate,
            Body::RequestVoteResponse {
                term: self.current_term,
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn process_append(
        &mut self,
        leader: String,
        term: u64,
        prev_log_index: Option<u64>,
        prev_log_term: Option<u64>,
        entries: Vec<LogEntry>,
        leader_commit: i64,
        now: Instant,
    ) {
        if term < self.current_term {
            self.emit(
                &leader,
                Body::AppendResponse {
                    success: false,
                    match_index: None,
                },
            );
            return;
        }

        // A live leader for the current term.
        self.update_election_deadline(now);
        if self.leader != leader {
            info!(
                "[{}] following leader {} in term {}",
                self.id, leader, term
            );
            self.leader = leader.clone();
        }

        // Consistency check against the entry right before the batch. A
        // missing prev (a heartbeat, or a batch starting at index 0) skips
        // the check.
        let base = match prev_log_index {
            None => 0,
            Some(prev) => {
                let prev = prev as usize;
                if prev >= self.log.len() || Some(self.log[prev].term) != prev_log_term {
                    self.emit(
                        &leader,
                        Body::AppendResponse {
                            success: false,
                            match_index: None,
                        },
                    );
                    return;
                }
                prev + 1
            }
        };

        // Merge the batch: truncate from the first conflicting entry only,
        // then append what is new. A stale or duplicated append must never
        // cut entries it did not conflict with, let alone committed ones.
        for (offset, entry) in entries.iter().enumerate() {
            let index = base + offset;
            if index < self.log.len() && self.log[index].term != entry.term {
                self.log.truncate(index);
            }
            if index == self.log.len() {
                self.log.push(entry.clone());
            }
        }

        // Commit whatever the leader has committed that we now hold.
        let new_commit = cmp::min(leader_commit, self.last_log_index());
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.apply_ready_entries();
        }

        // Acknowledge with the tip of our log.
        self.emit(
            &leader,
            Body::AppendResponse {
                success: true,
                match_index: Some(self.last_log_index()),
            },
        );
    }

    // ---- role transitions ----

    fn become_follower(&mut self, term: u64, now: Instant) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader = BROADCAST.to_string();
        }
        if self.state != State::Follower {
            info!("[{}] now follower in term {}", self.id, self.current_term);
            self.pending_reads.clear();
            self.update_election_deadline(now);
        }
        self.state = State::Follower;
        self.current_votes = None;
    }

    fn become_candidate(&mut self, now: Instant) {
        self.current_term += 1;
        self.state = State::Candidate;
        self.leader = BROADCAST.to_string();
        self.voted_for = Some(self.id.clone());
        let mut votes = BTreeSet::new();
        votes.insert(self.id.clone());
        self.current_votes = Some(Box::new(votes));
        self.pending_reads.clear();
        self.update_election_deadline(now);
        info!(
            "[{}] election timeout; campaigning in term {}",
            self.id, self.current_term
        );
        let body = Body::RequestVote {
            term: self.current_term,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };
        for peer in self.peer_ids.clone() {
            self.emit(&peer, body.clone());
        }
        if self.peer_ids.is_empty() {
            self.become_leader(now);
        }
    }

    fn become_leader(&mut self, now: Instant) {
        info!(
            "[{}] won the election for term {}",
            self.id, self.current_term
        );
        self.state = State::Leader;
        self.leader = self.id.clone();
        self.current_votes = None;
        self.next_index.clear();
        self.match_index.clear();
        for peer in &self.peer_ids {
            self.next_index.insert(peer.clone(), self.log.len());
            self.match_index.insert(peer.clone(), -1);
            self.last_heard.insert(peer.clone(), now);
        }
        self.heartbeat_timer.renew();
        // The initial heartbeat asserts leadership cluster-wide.
        self.broadcast_appends(now);
    }

    // ---- helpers ----

    fn quorum(&self) -> usize {
        (self.peer_ids.len() + 1) / 2 + 1
    }

    fn last_log_index(&self) -> i64 {
        self.log.len() as i64 - 1
    }

    fn last_log_term(&self) -> i64 {
        self.log.last().map_or(-1, |entry| entry.term as i64)
    }

    fn update_election_deadline(&mut self, now: Instant) {
        let (min, max) = ELECTION_TIMEOUT;
        self.next_election_deadline = now + Duration::from_millis(self.rng.gen_range(min..=max));
    }

    fn emit(&mut self, dst: &str, body: Body) {
        let msg = Envelope::new(&self.id, dst, &self.leader, body);
        self.cluster.send_message(msg);
    }
}

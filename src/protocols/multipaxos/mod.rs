//! Replication protocol: MultiPaxos, one independent instance per group.
//!
//! Multi-decree Paxos with a stable leader, a single Prepare phase covering
//! every slot from the leader's commit point onwards, batched and pipelined
//! Accepts, and leader-driven membership changes embedded in the log.
//! References:
//!   - Lamport, "Paxos Made Simple", ACM SIGACT News 32(4), 2001
//!   - <https://dl.acm.org/doi/pdf/10.1145/1281100.1281103>
//!   - <https://www.microsoft.com/en-us/research/publication/stoppable-paxos/>

mod control;
mod durability;
mod execution;
mod leadership;
mod messages;
mod reconfig;
mod recovery;
mod request;
mod snapshot;

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::client::RoutingTable;
use crate::server::{
    Command, ControlHub, Epoch, ExternalApi, GenericReplica,
    IdentityVerifier, LogActionId, LogSlot, RecordStore, ReplicaId,
    ReplicaSetup, ReplicaTag, ReqBatch, SlotLog, StateMachine, StorageHub,
    TransportHub,
};
use crate::utils::{Bitmap, GuidStoreError, Timer};

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use tokio::time::{self, Duration, Instant, Interval, MissedTickBehavior};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfigMultiPaxos {
    /// Client request batching maximum batch size.
    pub max_batch_size: usize,

    /// Directory holding the WAL and snapshot files.
    pub data_dir: String,

    /// Whether to call `fsync()`/`fdatasync()` on logger.
    pub logger_sync: bool,

    /// Min timeout of not hearing any heartbeat from leader in millisecs.
    pub hb_hear_timeout_min: u64,
    /// Max timeout of not hearing any heartbeat from leader in millisecs.
    pub hb_hear_timeout_max: u64,

    /// Interval of leader sending heartbeats to followers.
    pub hb_send_interval_ms: u64,

    /// Disable heartbeat timer (to force a deterministic leader during tests).
    pub disable_hb_timer: bool,

    /// Snapshot self-triggering interval in secs. 0 means never trigger
    /// snapshotting autonomously.
    pub snapshot_interval_s: u64,

    /// Best-effort reads are marked stale once the replica lags this many
    /// slots behind the highest commit point it has heard of.
    pub stale_read_slots: usize,

    /// Check ACLs against current state before proposing, so that requests
    /// already denied never consume a slot.
    pub acl_precheck: bool,

    /// Minimum gap between two checkpoint requests in millisecs.
    pub checkpoint_retry_ms: u64,

    /// Maximum chunk size (in slots) of any bulk messages.
    pub msg_chunk_size: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfigMultiPaxos {
    fn default() -> Self {
        ReplicaConfigMultiPaxos {
            max_batch_size: 64,
            data_dir: "/tmp/guidstore".into(),
            logger_sync: false,
            hb_hear_timeout_min: 300,
            hb_hear_timeout_max: 600,
            hb_send_interval_ms: 50,
            disable_hb_timer: false,
            snapshot_interval_s: 0,
            stale_read_slots: 16,
            acl_precheck: true,
            checkpoint_retry_ms: 200,
            msg_chunk_size: 32,
        }
    }
}

/// Ballot: a round number plus the proposer that made it. Ordered by round,
/// ties broken by proposer ID. Round 0 is the null ballot.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct Ballot {
    pub round: u64,
    pub proposer: ReplicaId,
}

impl Ballot {
    #[inline]
    pub fn new(round: u64, proposer: ReplicaId) -> Self {
        Ballot { round, proposer }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.round == 0
    }

    /// Smallest ballot of `proposer` that beats `max_seen`.
    #[inline]
    pub fn make_greater(max_seen: Ballot, proposer: ReplicaId) -> Self {
        Ballot::new(max_seen.round + 1, proposer)
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<{}.{}>", self.round, self.proposer)
    }
}

/// Instance status enum.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Serialize, Deserialize,
)]
pub(crate) enum InstStatus {
    Null = 0,
    Accepting = 1,
    Committed = 2,
    Executed = 3,
}

/// Leader-side bookkeeping info for each instance initiated.
#[derive(Debug, Clone)]
pub(crate) struct LeaderBookkeeping {
    /// Replicas from which I have received Accept confirmations.
    accept_acks: Bitmap,
}

/// Follower-side bookkeeping info for each instance received.
#[derive(Debug, Clone)]
pub(crate) struct ReplicaBookkeeping {
    /// Source leader replica ID for replying to Accepts.
    source: ReplicaId,
}

/// In-memory instance containing a commands batch.
#[derive(Debug, Clone)]
pub(crate) struct Instance {
    /// Ballot number.
    bal: Ballot,

    /// Instance status.
    status: InstStatus,

    /// Batch of client requests.
    reqs: ReqBatch,

    /// Highest ballot and associated value I have accepted.
    voted: (Ballot, ReqBatch),

    /// Leader-side bookkeeping info.
    leader_bk: Option<LeaderBookkeeping>,

    /// Follower-side bookkeeping info.
    replica_bk: Option<ReplicaBookkeeping>,

    /// True if clients should get replies from me once executed.
    external: bool,

    /// Offset of first durable WAL log entry related to this instance.
    wal_offset: Option<usize>,
}

impl Instance {
    /// Instance holding `reqs` under `bal`, voted for by me.
    fn accepting(bal: Ballot, reqs: ReqBatch) -> Self {
        Instance {
            bal,
            status: InstStatus::Accepting,
            reqs: reqs.clone(),
            voted: (bal, reqs),
            ..Self::null()
        }
    }
}

impl LogSlot for Instance {
    fn null() -> Self {
        Instance {
            bal: Ballot::default(),
            status: InstStatus::Null,
            reqs: Vec::new(),
            voted: (Ballot::default(), Vec::new()),
            leader_bk: None,
            replica_bk: None,
            external: false,
            wal_offset: None,
        }
    }

    fn is_decided(&self) -> bool {
        self.status >= InstStatus::Committed
    }

    fn carry_over(&mut self, prev: &Self) {
        if self.wal_offset.is_none() {
            self.wal_offset = prev.wal_offset;
        }
    }
}

/// Leader-side bookkeeping of the Prepare phase in progress.
#[derive(Debug, Clone)]
pub(crate) struct PrepareBookkeeping {
    ballot: Ballot,

    /// Every slot from here on is covered by this Prepare.
    trigger_slot: usize,

    /// Replicas from which I have received promises.
    acks: Bitmap,

    /// Highest-ballot voted value per slot among promises so far.
    voted: BTreeMap<usize, (Ballot, ReqBatch)>,

    /// Highest compaction point reported by any promise.
    max_snap_start: usize,

    /// The peer that reported `max_snap_start`.
    snap_peer: ReplicaId,
}

/// A promise waiting for its PrepareBal entry to become durable.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingPromise {
    peer: ReplicaId,
    ballot: Ballot,
    trigger_slot: usize,
    epoch: Epoch,
}

/// Stable storage WAL log entry type. Entries of other epochs than the
/// current one are ignored on replay.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) enum WalEntry {
    /// Records an update to the largest prepare ballot seen.
    PrepareBal {
        epoch: Epoch,
        trigger_slot: usize,
        ballot: Ballot,
    },

    /// Records a newly accepted request batch data at slot index.
    AcceptData {
        epoch: Epoch,
        slot: usize,
        ballot: Ballot,
        reqs: ReqBatch,
    },

    /// Records an event of committing the instance at index.
    CommitSlot { epoch: Epoch, slot: usize },
}

/// Snapshot file entry type. A snapshot is a `SlotInfo` immediately
/// followed by a `State`; only the last complete pair counts.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) enum SnapEntry {
    /// Slots covered and highest ballot seen when taken.
    SlotInfo { start_slot: usize, ballot: Ballot },

    /// Applied state up to `start_slot`, membership included.
    State { store: Box<RecordStore> },
}

/// Applied state of a group shipped between replicas.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) struct Checkpoint {
    /// First slot not covered.
    slot: usize,

    /// Highest ballot the sender had seen.
    ballot: Ballot,

    state: Box<RecordStore>,
}

/// Peer-peer message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum PeerMsg {
    /// Prepare message from leader to replicas, covering every slot in
    /// `[trigger_slot, +infinity)`.
    Prepare { ballot: Ballot, trigger_slot: usize },

    /// Promise from replica to leader.
    PrepareReply {
        ballot: Ballot,
        /// Every voted `(slot, ballot, value)` at or beyond the trigger slot.
        voted: Vec<(usize, Ballot, ReqBatch)>,
        /// Compaction point of the replier's log.
        snap_start: usize,
    },

    /// Accept message from leader to replicas.
    Accept {
        slot: usize,
        ballot: Ballot,
        reqs: ReqBatch,
    },

    /// Accept reply from replica to leader.
    AcceptReply { slot: usize, ballot: Ballot },

    /// Decision broadcast, carrying the value.
    Decide {
        slot: usize,
        ballot: Ballot,
        reqs: ReqBatch,
    },

    /// Refusal of a message with an outdated ballot.
    Reject { ballot: Ballot },

    /// Leader activity heartbeat.
    Heartbeat {
        ballot: Ballot,
        commit_bar: usize,
        exec_bar: usize,
        start_slot: usize,
    },

    /// Request from a lagging follower for decided values of these slots.
    FillHoles { slots: Vec<usize> },

    CheckpointRequest,

    CheckpointReply(Checkpoint),

    /// Tells a removed member that the group stopped at `slot`.
    Stop { slot: usize, members: Vec<ReplicaId> },

    /// Starts a joining member from the checkpoint right after a stop.
    Start { checkpoint: Checkpoint },
}

/// Peer message tagged with the sender's group epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    epoch: Epoch,
    msg: PeerMsg,
}

/// WAL log action kinds, encoded in the low bits of a `LogActionId`.
const LOG_PREPARE: u64 = 1;
const LOG_ACCEPT: u64 = 2;
const LOG_COMMIT: u64 = 3;

/// MultiPaxos server replica module for one group.
pub struct PaxosReplica {
    /// Which replica of which group.
    me: ReplicaTag,

    /// Current epoch; 0 while waiting to be started by a reconfiguration.
    epoch: Epoch,

    /// Current members of the group.
    members: Vec<ReplicaId>,

    /// Majority quorum size.
    quorum_cnt: u8,

    /// Configuration parameters struct.
    config: ReplicaConfigMultiPaxos,

    /// ControlHub module.
    control_hub: ControlHub,

    /// ExternalApi module.
    external_api: ExternalApi,

    /// StateMachine module.
    state_machine: StateMachine,

    /// StorageHub module.
    storage_hub: StorageHub<WalEntry>,

    /// StorageHub module for the snapshot file.
    snapshot_hub: StorageHub<SnapEntry>,

    /// TransportHub module.
    transport_hub: TransportHub<Envelope>,

    /// Credential checker for requesters.
    verifier: Arc<dyn IdentityVerifier>,

    /// Shared group routing table.
    routing: Arc<RwLock<RoutingTable>>,

    /// Who do I think is the effective leader of the group right now?
    leader: Option<ReplicaId>,

    /// In-memory log of instances.
    insts: SlotLog<Instance>,

    /// Largest ballot number that a leader has sent Prepare messages in.
    bal_prep_sent: Ballot,

    /// Largest ballot number that a leader knows has been safely prepared.
    bal_prepared: Ballot,

    /// Largest ballot number seen as acceptor.
    bal_max_seen: Ballot,

    /// Prepare phase in progress, if any.
    prepare_bk: Option<PrepareBookkeeping>,

    /// Promises in the order their PrepareBal entries were submitted.
    pending_promises: VecDeque<PendingPromise>,

    /// Client requests held while my Prepare phase is in progress.
    pending_reqs: ReqBatch,

    /// Set if a Prepare phase must restart once a checkpoint is installed.
    reprepare_after_ckpt: bool,

    /// Index of the first instance not yet committed and handed to the
    /// state machine.
    commit_bar: usize,

    /// Index of the first non-executed instance.
    /// It is always true that exec_bar <= commit_bar <= insts.end_slot().
    exec_bar: usize,

    /// Slot of a reconfiguration handed to the state machine; nothing past
    /// it is executed in the current epoch.
    exec_gate: Option<usize>,

    /// Slot of a reconfiguration I proposed; nothing past it is proposed in
    /// the current epoch.
    reconfig_slot: Option<usize>,

    /// Highest commit point heard of from any leader.
    highest_commit_heard: usize,

    /// Current durable WAL log file size.
    wal_end: usize,

    /// Current durable snapshot file size.
    snap_end: usize,

    /// Timer for hearing heartbeat from leader.
    hb_hear_timer: Timer,

    /// Interval for sending heartbeat to followers.
    hb_send_interval: Interval,

    /// Timer for taking a new autonomous snapshot.
    snapshot_interval: Interval,

    /// When I last asked a peer for a checkpoint.
    last_ckpt_request: Option<Instant>,

    /// Set once I am no longer a member of the group.
    retired: bool,

    /// Members that took over when I retired.
    successors: Vec<ReplicaId>,
}

// PaxosReplica common helpers
impl PaxosReplica {
    /// Do I think I am the current effective leader?
    #[inline]
    fn is_leader(&self) -> bool {
        self.leader == Some(self.me.node)
    }

    /// Am I waiting to be started by a reconfiguration?
    #[inline]
    fn awaiting_start(&self) -> bool {
        self.epoch == 0
    }

    #[inline]
    fn is_member(&self) -> bool {
        self.members.contains(&self.me.node)
    }

    /// Majority quorum size of a membership.
    #[inline]
    fn quorum_of(members: &[ReplicaId]) -> u8 {
        (members.len() / 2 + 1) as u8
    }

    /// Bitmap sized for every node ID that may vote in this group.
    fn new_acks(&self) -> Bitmap {
        let max_id = self.members.iter().copied().max().unwrap_or(0);
        Bitmap::new(max_id.max(self.me.node).saturating_add(1))
    }

    /// Wraps a message with my current epoch.
    #[inline]
    fn envelope(&self, msg: PeerMsg) -> Envelope {
        Envelope {
            epoch: self.epoch,
            msg,
        }
    }

    /// Sends a message to one peer.
    fn send_peer(
        &mut self,
        msg: PeerMsg,
        peer: ReplicaId,
    ) -> Result<(), GuidStoreError> {
        let env = self.envelope(msg);
        self.transport_hub.send_msg(env, peer)
    }

    /// Broadcasts a message to all current peers, or the given subset.
    fn bcast_peers(
        &mut self,
        msg: PeerMsg,
        targets: Option<&[ReplicaId]>,
    ) -> Result<(), GuidStoreError> {
        let env = self.envelope(msg);
        self.transport_hub.bcast_msg(env, targets)
    }

    /// The new membership if the batch holds a reconfiguration.
    fn reconfig_members(reqs: &ReqBatch) -> Option<&Vec<ReplicaId>> {
        reqs.iter().find_map(|(_, req)| match &req.cmd {
            Command::Reconfigure { members } => Some(members),
            _ => None,
        })
    }

    /// Every voted `(slot, ballot, value)` at or beyond `from_slot`.
    fn voted_from(&self, from_slot: usize) -> Vec<(usize, Ballot, ReqBatch)> {
        self.insts
            .iter_from(from_slot)
            .filter(|(_, inst)| !inst.voted.0.is_null())
            .map(|(slot, inst)| (slot, inst.voted.0, inst.voted.1.clone()))
            .collect()
    }

    /// Slot where the next new proposal goes.
    #[inline]
    fn next_proposal_slot(&self) -> usize {
        self.insts.end_slot().max(self.commit_bar)
    }

    /// Compose LogActionId from slot index & entry kind.
    #[inline]
    fn make_log_action_id(slot: usize, kind: u64) -> LogActionId {
        ((slot as u64) << 2) | kind
    }

    /// Decompose LogActionId into slot index & entry kind.
    #[inline]
    fn split_log_action_id(log_action_id: LogActionId) -> (usize, u64) {
        ((log_action_id >> 2) as usize, log_action_id & 0b11)
    }

    /// Publishes my current membership to the shared routing table.
    fn update_routing(&self) -> Result<(), GuidStoreError> {
        if self.awaiting_start() {
            return Ok(());
        }
        self.routing.write()?.update_membership(
            self.me.group,
            self.epoch,
            self.members.clone(),
        );
        Ok(())
    }

    fn wal_path(dir: &str, me: ReplicaTag) -> PathBuf {
        PathBuf::from(dir).join(format!("{}.wal", me))
    }

    fn snap_path(dir: &str, me: ReplicaTag) -> PathBuf {
        PathBuf::from(dir).join(format!("{}.snap", me))
    }
}

#[async_trait]
impl GenericReplica for PaxosReplica {
    type Msg = Envelope;

    async fn new_and_setup(
        setup: ReplicaSetup<Envelope>,
    ) -> Result<Self, GuidStoreError> {
        let me = setup.tag;

        // parse protocol-specific configs
        let config_str = setup.config_str.as_deref();
        let config = parsed_config!(config_str => ReplicaConfigMultiPaxos;
                                    max_batch_size, data_dir, logger_sync,
                                    hb_hear_timeout_min, hb_hear_timeout_max,
                                    hb_send_interval_ms, disable_hb_timer,
                                    snapshot_interval_s, stale_read_slots,
                                    acl_precheck, checkpoint_retry_ms,
                                    msg_chunk_size)?;
        if config.hb_hear_timeout_min == 0 {
            return logged_err!(
                me;
                "invalid config.hb_hear_timeout_min '{}'",
                config.hb_hear_timeout_min
            );
        }
        if config.hb_hear_timeout_max < config.hb_hear_timeout_min {
            return logged_err!(
                me;
                "invalid config.hb_hear_timeout_max '{}'",
                config.hb_hear_timeout_max
            );
        }
        if config.hb_send_interval_ms == 0 {
            return logged_err!(
                me;
                "invalid config.hb_send_interval_ms '{}'",
                config.hb_send_interval_ms
            );
        }
        if config.checkpoint_retry_ms == 0 {
            return logged_err!(
                me;
                "invalid config.checkpoint_retry_ms '{}'",
                config.checkpoint_retry_ms
            );
        }
        if config.msg_chunk_size == 0 {
            return logged_err!(
                me;
                "invalid config.msg_chunk_size '{}'",
                config.msg_chunk_size
            );
        }

        // initial members start in the first epoch; joiners wait for Start
        let (epoch, members) = if setup.members.is_empty() {
            (0, vec![])
        } else {
            (crate::server::INITIAL_EPOCH, setup.members.clone())
        };

        // setup state machine module
        let state_machine = StateMachine::new_and_setup(
            me,
            RecordStore::new(epoch, members.clone()),
        )
        .await?;

        // setup storage hub modules
        let storage_hub = StorageHub::new_and_setup(
            me,
            &Self::wal_path(&config.data_dir, me),
        )
        .await?;
        let snapshot_hub = StorageHub::new_and_setup(
            me,
            &Self::snap_path(&config.data_dir, me),
        )
        .await?;

        // setup transport hub module
        let mut transport_hub =
            TransportHub::new_and_setup(me, setup.network)?;
        transport_hub.set_peers(&members);

        // setup control hub module
        let control_hub = ControlHub::new_and_setup(me, setup.rx_ctrl);

        // setup external API module, ready to take in client requests
        let external_api = ExternalApi::new_and_setup(
            me,
            setup.endpoints,
            setup.registry,
            config.max_batch_size,
        )?;

        let mut hb_send_interval =
            time::interval(Duration::from_millis(config.hb_send_interval_ms));
        hb_send_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut snapshot_interval = time::interval(Duration::from_secs(
            if config.snapshot_interval_s > 0 {
                config.snapshot_interval_s
            } else {
                60 // dummy non-zero value to make `time::interval` happy
            },
        ));
        snapshot_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Ok(PaxosReplica {
            me,
            epoch,
            quorum_cnt: Self::quorum_of(&members),
            members,
            config,
            control_hub,
            external_api,
            state_machine,
            storage_hub,
            snapshot_hub,
            transport_hub,
            verifier: setup.verifier,
            routing: setup.routing,
            leader: None,
            insts: SlotLog::new(0),
            bal_prep_sent: Ballot::default(),
            bal_prepared: Ballot::default(),
            bal_max_seen: Ballot::default(),
            prepare_bk: None,
            pending_promises: VecDeque::new(),
            pending_reqs: vec![],
            reprepare_after_ckpt: false,
            commit_bar: 0,
            exec_bar: 0,
            exec_gate: None,
            reconfig_slot: None,
            highest_commit_heard: 0,
            wal_end: 0,
            snap_end: 0,
            hb_hear_timer: Timer::new(),
            hb_send_interval,
            snapshot_interval,
            last_ckpt_request: None,
            retired: false,
            successors: vec![],
        })
    }

    async fn run(&mut self) -> Result<bool, GuidStoreError> {
        // recover state from durable snapshot file
        self.recover_from_snapshot().await?;

        // recover the tail-piece memory log & state from durable WAL log
        self.recover_from_wal().await?;

        // kick off leader activity hearing timer
        if self.is_member() {
            self.kickoff_hb_hear_timer()?;
        }

        // main event loop
        let snapshotting = self.config.snapshot_interval_s > 0;
        loop {
            let is_leader = self.is_leader();
            tokio::select! {
                // client request batch
                req_batch = self.external_api.get_req_batch() => {
                    let handled = req_batch
                        .and_then(|req_batch| self.handle_req_batch(req_batch));
                    if let Err(e) = handled {
                        pf_error!(self.me; "error on req batch: {}", e);
                    }
                },

                // durable logging result
                log_result = self.storage_hub.get_result() => {
                    let handled = log_result.and_then(|(action_id, result)| {
                        self.handle_log_result(action_id, result)
                    });
                    if let Err(e) = handled {
                        pf_error!(self.me; "error on log result: {}", e);
                    }
                },

                // message from peer
                msg = self.transport_hub.recv_msg() => {
                    let handled = match msg {
                        Ok((peer, env)) => {
                            self.handle_msg_recv(peer, env).await
                        }
                        Err(e) => Err(e),
                    };
                    if let Err(e) = handled {
                        pf_error!(self.me; "error on peer msg: {}", e);
                    }
                },

                // state machine execution result
                exec_result = self.state_machine.get_result() => {
                    let handled = match exec_result {
                        Ok((_, exec_result)) => {
                            self.handle_exec_result(exec_result).await
                        }
                        Err(e) => Err(e),
                    };
                    if let Err(e) = handled {
                        pf_error!(self.me; "error on exec result: {}", e);
                    }
                },

                // leader inactivity timeout
                _ = self.hb_hear_timer.timeout() => {
                    if let Err(e) = self.hear_timed_out() {
                        pf_error!(self.me; "error becoming a leader: {}", e);
                    }
                },

                // leader sending heartbeat
                _ = self.hb_send_interval.tick(), if is_leader => {
                    if let Err(e) = self.bcast_heartbeats() {
                        pf_error!(self.me; "error sending heartbeats: {}", e);
                    }
                },

                // autonomous snapshot taking timeout
                _ = self.snapshot_interval.tick(), if snapshotting => {
                    if let Err(e) = self.take_new_snapshot(false).await {
                        pf_error!(self.me; "error taking snapshot: {}", e);
                    }
                },

                // manager control message
                ctrl_msg = self.control_hub.recv_ctrl() => {
                    let ctrl_msg = match ctrl_msg {
                        Ok(ctrl_msg) => ctrl_msg,
                        Err(e) => {
                            pf_warn!(self.me; "control channel gone: {}", e);
                            return Ok(false);
                        }
                    };
                    match self.handle_ctrl_msg(ctrl_msg).await {
                        Ok(Some(restart)) => return Ok(restart),
                        Ok(None) => {}
                        Err(e) => {
                            pf_error!(self.me; "error on ctrl msg: {}", e)
                        }
                    }
                },
            }
        }
    }

    fn tag(&self) -> ReplicaTag {
        self.me
    }
}

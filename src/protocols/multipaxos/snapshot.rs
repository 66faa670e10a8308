//! MultiPaxos -- snapshotting, compaction & state transfer.

use super::*;

use crate::server::{ApiReply, ExecAction, ExecResult, LogAction, LogResult};
use crate::utils::GuidStoreError;

// PaxosReplica snapshotting & state transfer logic
impl PaxosReplica {
    /// Copies out the applied record store.
    pub(super) async fn dump_state(
        &mut self,
    ) -> Result<Box<RecordStore>, GuidStoreError> {
        match self.state_machine.do_sync_action(ExecAction::Dump).await? {
            ExecResult::Dumped(store) => Ok(store),
            other => logged_err!(self.me; "unexpected exec result {:?}", other),
        }
    }

    /// Appends a snapshot entry to the snapshot file.
    async fn snapshot_append(
        &mut self,
        entry: SnapEntry,
    ) -> Result<usize, GuidStoreError> {
        match self
            .snapshot_hub
            .do_sync_action(LogAction::Append {
                entry,
                sync: self.config.logger_sync,
            })
            .await?
            .1
        {
            LogResult::Append { now_size } => Ok(now_size),
            _ => logged_err!(self.me; "unexpected log result type"),
        }
    }

    /// Takes a snapshot of the applied state, then discards the in-mem log
    /// up to that point as well as outdated entries in the durable WAL log.
    /// Only happens when nothing is in the middle of execution. Returns the
    /// snapshotted state if one was taken.
    pub(super) async fn take_new_snapshot(
        &mut self,
        force: bool,
    ) -> Result<Option<Box<RecordStore>>, GuidStoreError> {
        self.flush_wal().await?;
        if self.awaiting_start() || self.commit_bar != self.exec_bar {
            return Ok(None);
        }

        let store = self.dump_state().await?;
        let new_start = store.next_slot();
        if !force && new_start <= self.insts.start_slot() && self.snap_end > 0 {
            return Ok(None);
        }
        pf_debug!(self.me; "taking new snapshot: start {} exec {}",
                           self.insts.start_slot(), new_start);

        // write the new pair after the current one, then drop the current
        let old_end = self.snap_end;
        self.snapshot_append(SnapEntry::SlotInfo {
            start_slot: new_start,
            ballot: self.bal_max_seen,
        })
        .await?;
        let now_size = self
            .snapshot_append(SnapEntry::State {
                store: store.clone(),
            })
            .await?;
        self.snap_end = now_size;

        if old_end > 0 {
            match self
                .snapshot_hub
                .do_sync_action(LogAction::Discard {
                    offset: old_end,
                    keep: 0,
                })
                .await?
                .1
            {
                LogResult::Discard {
                    offset_ok: true,
                    now_size,
                } => {
                    self.snap_end = now_size;
                }
                _ => {
                    return logged_err!(self.me; "unexpected discard result");
                }
            }
        }

        // discard all in-memory log instances up to the snapshot
        if new_start > 0 {
            self.insts.truncate(new_start - 1);
        }
        self.discard_wal_prefix().await?;

        pf_info!(self.me; "took snapshot up to: start {}",
                          self.insts.start_slot());
        Ok(Some(store))
    }

    /// Sends a checkpoint request to `peer`, at most once per retry interval
    /// unless forced.
    pub(super) fn request_checkpoint(
        &mut self,
        peer: ReplicaId,
        force: bool,
    ) -> Result<(), GuidStoreError> {
        let now = Instant::now();
        if !force {
            if let Some(last) = self.last_ckpt_request {
                let retry =
                    Duration::from_millis(self.config.checkpoint_retry_ms);
                if now.duration_since(last) < retry {
                    return Ok(());
                }
            }
        }
        self.last_ckpt_request = Some(now);
        self.send_peer(PeerMsg::CheckpointRequest, peer)?;
        pf_debug!(self.me; "requested checkpoint from {}", peer);
        Ok(())
    }

    /// Handler of a checkpoint request: ships my applied state.
    pub(super) async fn handle_msg_checkpoint_request(
        &mut self,
        peer: ReplicaId,
    ) -> Result<(), GuidStoreError> {
        if self.awaiting_start() {
            return Ok(());
        }
        let state = self.dump_state().await?;
        let slot = state.next_slot();
        self.send_peer(
            PeerMsg::CheckpointReply(Checkpoint {
                slot,
                ballot: self.bal_max_seen,
                state,
            }),
            peer,
        )?;
        pf_debug!(self.me; "sent checkpoint -> {} up to slot {}", peer, slot);
        Ok(())
    }

    /// Replaces my state with a checkpoint from a peer that is ahead of me,
    /// moving into its epoch if newer.
    pub(super) async fn install_checkpoint(
        &mut self,
        checkpoint: Checkpoint,
    ) -> Result<(), GuidStoreError> {
        let Checkpoint {
            slot,
            ballot,
            state,
        } = checkpoint;
        let ck_epoch = state.epoch();
        if ck_epoch < self.epoch
            || (ck_epoch == self.epoch && slot <= self.commit_bar)
        {
            pf_trace!(self.me; "ignoring checkpoint of epoch {} slot {}",
                               ck_epoch, slot);
            return Ok(());
        }
        pf_info!(self.me; "installing checkpoint of epoch {} up to slot {}",
                          ck_epoch, slot);

        self.flush_wal().await?;
        let members = state.members().to_vec();
        match self
            .state_machine
            .do_sync_action(ExecAction::Restore(state))
            .await?
        {
            ExecResult::Restored { next_slot } if next_slot == slot => {}
            other => {
                return logged_err!(self.me; "unexpected exec result {:?}",
                                            other);
            }
        }

        if ck_epoch != self.epoch {
            // everything past the stop point belonged to a voided epoch
            self.epoch = ck_epoch;
            self.quorum_cnt = Self::quorum_of(&members);
            self.members = members;
            self.insts.truncate_tail(slot);
            self.leader = None;
            self.bal_prep_sent = Ballot::default();
            self.bal_prepared = Ballot::default();
            self.prepare_bk = None;
            self.reconfig_slot = None;
            for (client, req) in std::mem::take(&mut self.pending_reqs) {
                self.external_api
                    .send_reply(ApiReply::retry_later(req.id), client)?;
            }
        }

        if slot > 0 {
            self.insts.truncate(slot - 1);
        }
        self.commit_bar = slot;
        self.exec_bar = slot;
        self.exec_gate = None;
        self.highest_commit_heard = self.highest_commit_heard.max(slot);
        self.bal_max_seen = self.bal_max_seen.max(ballot);

        self.update_routing()?;
        self.take_new_snapshot(true).await?;

        if !self.is_member() {
            return self.retire();
        }
        self.transport_hub.set_peers(&self.members);
        self.kickoff_hb_hear_timer()?;
        if self.reprepare_after_ckpt {
            self.reprepare_after_ckpt = false;
            if self.is_leader() {
                self.start_prepare()?;
            }
        }
        self.advance_commit_bar()
    }
}

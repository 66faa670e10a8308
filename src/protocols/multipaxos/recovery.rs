//! MultiPaxos -- recovery from snapshot & WAL.

use super::*;

use crate::server::{ExecAction, ExecResult, LogAction, LogResult};
use crate::utils::GuidStoreError;

/// A reconfiguration applied during WAL replay, to be carried out once the
/// replay is over.
struct ReplayedReconfig {
    slot: usize,
    members: Vec<ReplicaId>,
    epoch: Epoch,
}

// PaxosReplica recovery from durable files
impl PaxosReplica {
    /// Recover initial state from the last complete pair in the durable
    /// snapshot file. An initial member without one writes the initial
    /// snapshot; a joiner without one waits to be started.
    pub(super) async fn recover_from_snapshot(
        &mut self,
    ) -> Result<(), GuidStoreError> {
        debug_assert_eq!(self.snap_end, 0);

        let mut offset = 0;
        let mut slot_info = None;
        let mut latest = None;
        loop {
            match self
                .snapshot_hub
                .do_sync_action(LogAction::Read { offset })
                .await?
                .1
            {
                LogResult::Read {
                    entry: Some(entry),
                    end_offset,
                } => {
                    match entry {
                        SnapEntry::SlotInfo { start_slot, ballot } => {
                            slot_info = Some((start_slot, ballot));
                        }
                        SnapEntry::State { store } => {
                            if let Some((start, ballot)) = slot_info.take() {
                                latest =
                                    Some((start, ballot, store, end_offset));
                            }
                        }
                    }
                    offset = end_offset;
                }
                LogResult::Read { entry: None, .. } => break,
                _ => {
                    return logged_err!(self.me; "unexpected log result type");
                }
            }
        }

        let Some((start_slot, ballot, store, end_offset)) = latest else {
            // fresh start
            self.truncate_snapshot(0).await?;
            if !self.awaiting_start() {
                self.take_new_snapshot(true).await?;
            }
            return Ok(());
        };

        // drop any torn pair written after the last complete one
        self.truncate_snapshot(end_offset).await?;
        self.snap_end = end_offset;

        if store.next_slot() != start_slot {
            return logged_err!(self.me; "snapshot slot mismatch: {} vs {}",
                                        store.next_slot(), start_slot);
        }
        self.epoch = store.epoch();
        self.members = store.members().to_vec();
        self.quorum_cnt = Self::quorum_of(&self.members);
        match self
            .state_machine
            .do_sync_action(ExecAction::Restore(store))
            .await?
        {
            ExecResult::Restored { .. } => {}
            other => {
                return logged_err!(self.me; "unexpected exec result {:?}",
                                            other);
            }
        }

        self.insts = SlotLog::new(start_slot);
        self.commit_bar = start_slot;
        self.exec_bar = start_slot;
        self.highest_commit_heard = start_slot;
        self.bal_max_seen = ballot;

        self.update_routing()?;
        if self.is_member() {
            self.transport_hub.set_peers(&self.members);
        } else {
            self.retire()?;
        }
        pf_info!(self.me; "recovered from snapshot: epoch {} start {}",
                          self.epoch, start_slot);
        Ok(())
    }

    /// Truncates the snapshot file at `offset`.
    async fn truncate_snapshot(
        &mut self,
        offset: usize,
    ) -> Result<(), GuidStoreError> {
        match self
            .snapshot_hub
            .do_sync_action(LogAction::Truncate { offset })
            .await?
            .1
        {
            LogResult::Truncate {
                offset_ok: true, ..
            } => Ok(()),
            _ => {
                logged_err!(self.me; "unexpected truncate result")
            }
        }
    }

    /// Applies every contiguously committed instance synchronously during
    /// replay. Returns the reconfiguration hit, if any.
    async fn recover_apply_committed(
        &mut self,
    ) -> Result<Option<ReplayedReconfig>, GuidStoreError> {
        while self.commit_bar < self.insts.end_slot() {
            let slot = self.commit_bar;
            let reqs = match self.insts.get(slot) {
                Some(inst) if inst.status == InstStatus::Committed => {
                    inst.reqs.clone()
                }
                _ => break,
            };

            let results = match self
                .state_machine
                .do_sync_action(ExecAction::Apply {
                    slot,
                    reqs: reqs.clone(),
                })
                .await?
            {
                ExecResult::Applied { results, .. } => results,
                ExecResult::Failed { error, .. } => return Err(error),
                other => {
                    return logged_err!(self.me; "unexpected exec result {:?}",
                                                other);
                }
            };
            if let Some(inst) = self.insts.get_mut(slot) {
                inst.status = InstStatus::Executed;
            }
            self.commit_bar += 1;
            self.exec_bar += 1;

            if let (Some(members), Some(results)) =
                (Self::reconfig_members(&reqs), results)
            {
                let epoch = reqs
                    .iter()
                    .zip(results.iter())
                    .find(|((_, req), result)| {
                        req.cmd.is_reconfigure() && result.is_ok()
                    })
                    .map(|(_, result)| result.version);
                if let Some(epoch) = epoch {
                    return Ok(Some(ReplayedReconfig {
                        slot,
                        members: members.clone(),
                        epoch,
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Apply a durable storage log entry for recovery.
    async fn recover_apply_entry(
        &mut self,
        entry: WalEntry,
        offset: usize,
    ) -> Result<Option<ReplayedReconfig>, GuidStoreError> {
        match entry {
            WalEntry::PrepareBal { epoch, ballot, .. } => {
                if epoch == self.epoch && self.bal_max_seen < ballot {
                    self.bal_max_seen = ballot;
                }
                Ok(None)
            }

            WalEntry::AcceptData {
                epoch,
                slot,
                ballot,
                reqs,
            } => {
                if epoch != self.epoch || slot < self.insts.start_slot() {
                    return Ok(None); // ignore if outdated
                }
                if self.bal_max_seen < ballot {
                    self.bal_max_seen = ballot;
                }
                let inst = self.insts.locate(slot)?;
                if inst.wal_offset.is_none() {
                    inst.wal_offset = Some(offset);
                }
                if !inst.is_decided() && inst.voted.0 <= ballot {
                    self.insts
                        .append(slot, Instance::accepting(ballot, reqs))?;
                }
                Ok(None)
            }

            WalEntry::CommitSlot { epoch, slot } => {
                if epoch != self.epoch || slot < self.insts.start_slot() {
                    return Ok(None);
                }
                let inst = self.insts.locate(slot)?;
                if inst.wal_offset.is_none() {
                    inst.wal_offset = Some(offset);
                }
                if inst.status < InstStatus::Committed {
                    inst.status = InstStatus::Committed;
                }
                self.highest_commit_heard =
                    self.highest_commit_heard.max(slot + 1);
                self.recover_apply_committed().await
            }
        }
    }

    /// Recover state from durable storage WAL log, keeping only entries of
    /// my current epoch.
    pub(super) async fn recover_from_wal(
        &mut self,
    ) -> Result<(), GuidStoreError> {
        debug_assert_eq!(self.wal_end, 0);

        let mut replayed = None;
        loop {
            let (_, log_result) = self
                .storage_hub
                .do_sync_action(LogAction::Read {
                    offset: self.wal_end,
                })
                .await?;

            match log_result {
                LogResult::Read {
                    entry: Some(entry),
                    end_offset,
                } => {
                    // nothing after a stop point counts in its epoch
                    if replayed.is_none() && !self.awaiting_start() {
                        let offset = self.wal_end;
                        replayed =
                            self.recover_apply_entry(entry, offset).await?;
                    }
                    self.wal_end = end_offset;
                }
                LogResult::Read { entry: None, .. } => {
                    // end of log reached
                    break;
                }
                _ => {
                    return logged_err!(self.me; "unexpected log result type");
                }
            }
        }

        // do an extra Truncate to remove partial entry at the end if any
        match self
            .storage_hub
            .do_sync_action(LogAction::Truncate {
                offset: self.wal_end,
            })
            .await?
            .1
        {
            LogResult::Truncate {
                offset_ok: true, ..
            } => {}
            _ => {
                return logged_err!(self.me; "unexpected truncate result");
            }
        }
        if self.wal_end > 0 {
            pf_info!(self.me; "recovered from wal log: commit {} exec {}",
                              self.commit_bar, self.exec_bar);
        }

        if let Some(ReplayedReconfig {
            slot,
            members,
            epoch,
        }) = replayed
        {
            self.apply_reconfiguration(slot, members, epoch).await?;
        }
        Ok(())
    }
}

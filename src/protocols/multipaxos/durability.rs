//! MultiPaxos -- durable logging.

use super::*;

use crate::server::{LogAction, LogResult};
use crate::utils::GuidStoreError;

// PaxosReplica durable WAL logging
impl PaxosReplica {
    /// Submits a WAL append for the given slot.
    pub(super) fn log_append(
        &mut self,
        slot: usize,
        kind: u64,
        entry: WalEntry,
    ) -> Result<(), GuidStoreError> {
        self.storage_hub.submit_action(
            Self::make_log_action_id(slot, kind),
            LogAction::Append {
                entry,
                sync: self.config.logger_sync,
            },
        )
    }

    /// Waits until every WAL action submitted so far has finished, handling
    /// their results.
    pub(super) async fn flush_wal(&mut self) -> Result<(), GuidStoreError> {
        let (old_results, _) = self
            .storage_hub
            .do_sync_action(LogAction::Read {
                offset: self.wal_end,
            })
            .await?;
        for (action_id, log_result) in old_results {
            self.handle_log_result(action_id, log_result)?;
        }
        Ok(())
    }

    /// Handler of PrepareBal logging result chan recv.
    fn handle_logged_prepare_bal(&mut self) -> Result<(), GuidStoreError> {
        let promise = match self.pending_promises.pop_front() {
            Some(promise) => promise,
            None => return logged_err!(self.me; "no pending promise to reply"),
        };
        if promise.epoch != self.epoch {
            return Ok(());
        }
        pf_trace!(self.me; "finished PrepareBal logging for trigger {} bal {}",
                           promise.trigger_slot, promise.ballot);

        let voted = self.voted_from(promise.trigger_slot);
        let snap_start = self.insts.start_slot();
        if promise.peer == self.me.node {
            // my own promise as the aspiring leader
            self.handle_msg_prepare_reply(
                self.me.node,
                promise.ballot,
                voted,
                snap_start,
            )
        } else {
            self.send_peer(
                PeerMsg::PrepareReply {
                    ballot: promise.ballot,
                    voted,
                    snap_start,
                },
                promise.peer,
            )?;
            pf_trace!(self.me; "sent PrepareReply -> {} bal {}",
                               promise.peer, promise.ballot);
            Ok(())
        }
    }

    /// Handler of AcceptData logging result chan recv.
    fn handle_logged_accept_data(
        &mut self,
        slot: usize,
        offset: usize,
    ) -> Result<(), GuidStoreError> {
        let me = self.me.node;
        let inst = match self.insts.get_mut(slot) {
            Some(inst) => inst,
            None => return Ok(()), // compacted or voided meanwhile
        };
        if inst.wal_offset.is_none() {
            inst.wal_offset = Some(offset);
        }
        if inst.status != InstStatus::Accepting {
            return Ok(());
        }
        pf_trace!(self.me; "finished AcceptData logging for slot {} bal {}",
                           slot, inst.bal);

        let ballot = inst.bal;
        if inst.leader_bk.is_some() {
            // my own vote as the leader
            self.handle_msg_accept_reply(me, slot, ballot)
        } else if let Some(bk) = inst.replica_bk.as_ref() {
            let source = bk.source;
            self.send_peer(PeerMsg::AcceptReply { slot, ballot }, source)?;
            pf_trace!(self.me; "sent AcceptReply -> {} for slot {} bal {}",
                               source, slot, ballot);
            Ok(())
        } else {
            Ok(())
        }
    }

    /// Handler of CommitSlot logging result chan recv.
    fn handle_logged_commit_slot(
        &mut self,
        slot: usize,
        offset: usize,
    ) -> Result<(), GuidStoreError> {
        if let Some(inst) = self.insts.get_mut(slot) {
            if inst.wal_offset.is_none() {
                inst.wal_offset = Some(offset);
            }
        }
        pf_trace!(self.me; "finished CommitSlot logging for slot {}", slot);
        self.advance_commit_bar()
    }

    /// Synthesized handler of durable logging result chan recv.
    pub(super) fn handle_log_result(
        &mut self,
        action_id: LogActionId,
        log_result: LogResult<WalEntry>,
    ) -> Result<(), GuidStoreError> {
        let (slot, kind) = Self::split_log_action_id(action_id);
        let offset = self.wal_end;
        match log_result {
            LogResult::Append { now_size } => {
                if now_size <= offset {
                    return logged_err!(self.me; "wal did not grow: {} -> {}",
                                                offset, now_size);
                }
                self.wal_end = now_size;
            }
            _ => {
                return logged_err!(self.me; "unexpected log result for {}",
                                            action_id);
            }
        }

        match kind {
            LOG_PREPARE => self.handle_logged_prepare_bal(),
            LOG_ACCEPT => self.handle_logged_accept_data(slot, offset),
            LOG_COMMIT => self.handle_logged_commit_slot(slot, offset),
            _ => logged_err!(self.me; "unknown log entry kind {}", kind),
        }
    }

    /// Discards every WAL entry no remaining instance needs, after the log
    /// has been truncated to a new snapshot.
    pub(super) async fn discard_wal_prefix(
        &mut self,
    ) -> Result<(), GuidStoreError> {
        self.flush_wal().await?;
        let cut = self
            .insts
            .iter_from(self.insts.start_slot())
            .filter_map(|(_, inst)| inst.wal_offset)
            .min()
            .unwrap_or(self.wal_end);
        if cut == 0 {
            return Ok(());
        }

        let (old_results, log_result) = self
            .storage_hub
            .do_sync_action(LogAction::Discard {
                offset: cut,
                keep: 0,
            })
            .await?;
        debug_assert!(old_results.is_empty());
        match log_result {
            LogResult::Discard {
                offset_ok: true,
                now_size,
            } => {
                for (_, inst) in self.insts.iter_mut_from(0) {
                    if let Some(offset) = inst.wal_offset.as_mut() {
                        *offset -= cut;
                    }
                }
                self.wal_end = now_size;
                pf_debug!(self.me; "discarded wal prefix of {} bytes", cut);
                Ok(())
            }
            _ => logged_err!(self.me; "unexpected discard result"),
        }
    }
}

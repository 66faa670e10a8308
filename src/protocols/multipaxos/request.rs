//! MultiPaxos -- client request entrance.

use super::*;

use crate::server::{
    ApiReply, CommandResult, Consistency, ExecAction, Operation, Status,
};
use crate::utils::GuidStoreError;

// PaxosReplica client requests entrance
impl PaxosReplica {
    /// Where to send a client that reached me while I am not the leader.
    /// `None` while no leader is known; the client then backs off.
    fn redirect_target(&self) -> Option<ReplicaId> {
        self.leader.filter(|&leader| leader != self.me.node)
    }

    /// Handler of client request batch chan recv.
    pub(super) fn handle_req_batch(
        &mut self,
        req_batch: ReqBatch,
    ) -> Result<(), GuidStoreError> {
        let batch_size = req_batch.len();
        debug_assert!(batch_size > 0);
        pf_debug!(self.me; "got request batch of size {}", batch_size);

        // a retired replica points clients at its successors
        if self.retired || self.awaiting_start() {
            let target = self.successors.first().copied();
            for (client, req) in req_batch {
                let reply = match target {
                    Some(to) => ApiReply::redirect(req.id, to),
                    None => ApiReply::retry_later(req.id),
                };
                self.external_api.send_reply(reply, client)?;
            }
            return Ok(());
        }

        let mut coordinated = Vec::with_capacity(batch_size);
        for (client, req) in req_batch {
            // requester must prove who they are
            if let Command::Record { requester, .. } = &req.cmd {
                if !self.verifier.verify(requester, req.proof.as_ref()) {
                    pf_debug!(self.me; "unverified requester '{}' from {}",
                                       requester, client);
                    self.external_api.send_reply(
                        ApiReply::result(
                            req.id,
                            CommandResult::status(Status::Denied, 0),
                        ),
                        client,
                    )?;
                    continue;
                }
            }

            // best-effort reads are served from my applied state
            if req.consistency == Consistency::BestEffort {
                if let Command::Record {
                    key,
                    requester,
                    op: Operation::Read { field },
                } = &req.cmd
                {
                    self.state_machine.submit_action(ExecAction::Inspect {
                        client,
                        req_id: req.id,
                        key: key.clone(),
                        requester: requester.clone(),
                        field: field.clone(),
                    })?;
                    pf_trace!(self.me; "submitted Inspect for client {} req {}",
                                       client, req.id);
                    continue;
                }
            }

            coordinated.push((client, req));
        }

        if coordinated.is_empty() {
            return Ok(());
        }
        self.admit_reqs(coordinated, false)
    }

    /// Takes coordinated requests in if I am a leader ready to propose;
    /// `prechecked` is set once current state has not denied them.
    pub(super) fn admit_reqs(
        &mut self,
        reqs: ReqBatch,
        prechecked: bool,
    ) -> Result<(), GuidStoreError> {
        // if I'm not a leader, tell the clients where to go
        if !self.is_leader() {
            let target = self.redirect_target();
            for (client, req) in reqs {
                let reply = match target {
                    Some(to) => ApiReply::redirect(req.id, to),
                    None => ApiReply::retry_later(req.id),
                };
                self.external_api.send_reply(reply, client)?;
                pf_trace!(self.me; "redirected client {} to replica {:?}",
                                   client, target);
            }
            return Ok(());
        }

        // hold requests until my Prepare phase completes
        if self.bal_prepared.is_null() {
            pf_trace!(self.me; "holding {} requests until prepared",
                               reqs.len());
            self.pending_reqs.extend(reqs);
            return Ok(());
        }

        // nothing goes after a pending reconfiguration in this epoch
        if self.reconfig_slot.is_some() {
            for (client, req) in reqs {
                self.external_api
                    .send_reply(ApiReply::retry_later(req.id), client)?;
            }
            return Ok(());
        }

        if self.config.acl_precheck && !prechecked {
            self.state_machine
                .submit_action(ExecAction::Precheck { reqs })?;
            return Ok(());
        }

        self.propose_batch(reqs)
    }

    /// Splits out reconfigurations, which get a slot of their own after the
    /// regular requests, then proposes.
    fn propose_batch(&mut self, reqs: ReqBatch) -> Result<(), GuidStoreError> {
        let mut regular = Vec::with_capacity(reqs.len());
        let mut reconfig = None;
        for (client, req) in reqs {
            // Some(empty?) for reconfigurations
            let reconfig_empty = match &req.cmd {
                Command::Reconfigure { members } => Some(members.is_empty()),
                _ => None,
            };
            match reconfig_empty {
                Some(true) => {
                    self.external_api.send_reply(
                        ApiReply::result(
                            req.id,
                            CommandResult::status(Status::Conflict, self.epoch),
                        ),
                        client,
                    )?;
                }
                Some(false) if reconfig.is_some() => {
                    self.external_api
                        .send_reply(ApiReply::retry_later(req.id), client)?;
                }
                Some(false) => reconfig = Some((client, req)),
                None => regular.push((client, req)),
            }
        }

        if !regular.is_empty() {
            self.propose_slot(regular)?;
        }
        if let Some(entry) = reconfig {
            let slot = self.propose_slot(vec![entry])?;
            self.reconfig_slot = Some(slot);
            pf_info!(self.me; "proposed reconfiguration at slot {}", slot);
        }
        Ok(())
    }

    /// Proposes a batch in the next free slot, returning that slot.
    fn propose_slot(
        &mut self,
        reqs: ReqBatch,
    ) -> Result<usize, GuidStoreError> {
        let slot = self.next_proposal_slot();
        let ballot = self.bal_prepared;
        let acks = self.new_acks();

        self.insts.append(
            slot,
            Instance {
                leader_bk: Some(LeaderBookkeeping { accept_acks: acks }),
                external: true,
                ..Instance::accepting(ballot, reqs.clone())
            },
        )?;

        // record update to largest accepted ballot and corresponding data
        self.log_append(
            slot,
            LOG_ACCEPT,
            WalEntry::AcceptData {
                epoch: self.epoch,
                slot,
                ballot,
                reqs: reqs.clone(),
            },
        )?;
        pf_trace!(self.me; "submitted AcceptData log action for slot {} bal {}",
                           slot, ballot);

        // send Accept messages to all peers
        self.bcast_peers(PeerMsg::Accept { slot, ballot, reqs }, None)?;
        pf_trace!(self.me; "broadcast Accept messages for slot {} bal {}",
                           slot, ballot);
        Ok(slot)
    }
}

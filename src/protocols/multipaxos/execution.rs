//! MultiPaxos -- command execution.

use super::*;

use crate::server::{
    ApiReply, ApiRequest, ClientId, CommandResult, ExecAction, ExecResult,
    ReqBatch, RequestId, Status,
};
use crate::utils::GuidStoreError;

// PaxosReplica state machine execution
impl PaxosReplica {
    /// Hands every newly decided instance, in slot order, to the state
    /// machine. Stops behind a reconfiguration until it has been applied.
    pub(super) fn advance_commit_bar(&mut self) -> Result<(), GuidStoreError> {
        while self.commit_bar < self.insts.end_slot()
            && self.exec_gate.is_none()
        {
            let slot = self.commit_bar;
            let inst = match self.insts.get(slot) {
                Some(inst) if inst.status == InstStatus::Committed => inst,
                _ => break,
            };
            let reqs = inst.reqs.clone();
            if Self::reconfig_members(&reqs).is_some() {
                self.exec_gate = Some(slot);
            }
            self.state_machine
                .submit_action(ExecAction::Apply { slot, reqs })?;
            pf_trace!(self.me; "submitted Apply action for slot {}", slot);
            self.commit_bar += 1;
        }
        Ok(())
    }

    /// Handler of a slot applied by the state machine.
    async fn handle_applied(
        &mut self,
        slot: usize,
        results: Option<Vec<CommandResult>>,
    ) -> Result<(), GuidStoreError> {
        let is_leader = self.is_leader();
        let inst = match self.insts.get_mut(slot) {
            Some(inst) => inst,
            None => return Ok(()),
        };
        inst.status = InstStatus::Executed;
        let reqs = inst.reqs.clone();
        let external = inst.external;
        self.exec_bar = self.exec_bar.max(slot + 1);
        pf_trace!(self.me; "executed all cmds in instance at slot {}", slot);

        let results = match results {
            Some(results) => results,
            None => {
                // applied before, e.g. through a checkpoint
                if self.exec_gate == Some(slot) {
                    self.exec_gate = None;
                    self.advance_commit_bar()?;
                }
                return Ok(());
            }
        };

        // reply back to clients if I proposed or lead
        if is_leader || external {
            for ((client, req), result) in reqs.iter().zip(results.iter()) {
                let reply = ApiReply::result(req.id, result.clone());
                self.external_api.send_reply(reply, *client)?;
                pf_trace!(self.me; "replied -> client {} for slot {} req {}",
                                   client, slot, req.id);
            }
        }

        // an applied reconfiguration ends the current epoch
        if let Some(members) = Self::reconfig_members(&reqs) {
            let new_epoch = reqs
                .iter()
                .zip(results.iter())
                .find(|((_, req), _)| req.cmd.is_reconfigure())
                .filter(|(_, result)| result.is_ok())
                .map(|(_, result)| result.version);
            match new_epoch {
                Some(new_epoch) => {
                    let members = members.clone();
                    self.apply_reconfiguration(slot, members, new_epoch)
                        .await?;
                }
                None => {
                    // rejected at apply time; the epoch goes on
                    self.exec_gate = None;
                    if self.reconfig_slot == Some(slot) {
                        self.reconfig_slot = None;
                    }
                    self.advance_commit_bar()?;
                }
            }
        }
        Ok(())
    }

    /// Settles a precheck outcome. Denials stand only if the store they were
    /// checked against had applied every slot proposed so far; otherwise a
    /// pending slot may still grant access, so the denied requests go on to
    /// be proposed and checked again at apply time.
    #[allow(clippy::type_complexity)]
    fn settle_precheck(
        caught_up: bool,
        mut allowed: ReqBatch,
        denied: Vec<(ClientId, ApiRequest, CommandResult)>,
    ) -> (ReqBatch, Vec<(ClientId, RequestId, CommandResult)>) {
        if caught_up {
            let denied = denied
                .into_iter()
                .map(|(client, req, result)| (client, req.id, result))
                .collect();
            return (allowed, denied);
        }
        let deferred = denied.into_iter().map(|(client, req, _)| (client, req));
        allowed.extend(deferred);
        (allowed, vec![])
    }

    /// Synthesized handler of execution result chan recv.
    pub(super) async fn handle_exec_result(
        &mut self,
        exec_result: ExecResult,
    ) -> Result<(), GuidStoreError> {
        match exec_result {
            ExecResult::Applied { slot, results } => {
                self.handle_applied(slot, results).await
            }

            ExecResult::Failed { slot, error } => {
                pf_warn!(self.me; "applying slot {} failed: {}", slot, error);
                if let GuidStoreError::SlotGap { .. } = error {
                    let me = self.me.node;
                    if let Some(leader) = self.leader.filter(|&l| l != me) {
                        self.request_checkpoint(leader, false)?;
                    }
                }
                Ok(())
            }

            ExecResult::Inspected {
                client,
                req_id,
                mut result,
            } => {
                // tell the client if my state lags noticeably
                let lag =
                    self.highest_commit_heard.saturating_sub(self.exec_bar);
                if result.status == Status::Ok
                    && lag > self.config.stale_read_slots
                {
                    result.status = Status::Stale;
                }
                self.external_api
                    .send_reply(ApiReply::result(req_id, result), client)
            }

            ExecResult::Prechecked { allowed, denied } => {
                let caught_up = self.exec_bar == self.next_proposal_slot();
                let (allowed, denied) =
                    Self::settle_precheck(caught_up, allowed, denied);
                for (client, req_id, result) in denied {
                    pf_trace!(self.me; "denied client {} req {} at precheck",
                                       client, req_id);
                    self.external_api
                        .send_reply(ApiReply::result(req_id, result), client)?;
                }
                if allowed.is_empty() {
                    return Ok(());
                }
                self.admit_reqs(allowed, true)
            }

            // results of synchronous actions are consumed where submitted
            other => {
                logged_err!(self.me; "unexpected exec result {:?}", other)
            }
        }
    }
}

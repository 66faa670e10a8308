//! MultiPaxos -- manager control actions.

use super::*;

use crate::server::{CtrlMsg, CtrlReply, ReplicaInfo};
use crate::utils::GuidStoreError;

// PaxosReplica control messages handling
impl PaxosReplica {
    /// Current consensus progress.
    fn replica_info(&self) -> ReplicaInfo {
        ReplicaInfo {
            tag: self.me,
            epoch: self.epoch,
            members: self.members.clone(),
            ballot_round: self.bal_max_seen.round,
            is_leader: self.is_leader() && !self.bal_prepared.is_null(),
            leader: self.leader,
            commit_bar: self.commit_bar,
            exec_bar: self.exec_bar,
            start_slot: self.insts.start_slot(),
            retired: self.retired,
            awaiting_start: self.awaiting_start(),
        }
    }

    /// Decided `(slot, batch)` pairs held in the log, in slot order.
    fn decided_log(&self) -> Vec<(usize, ReqBatch)> {
        self.insts
            .iter_from(self.insts.start_slot())
            .filter(|(_, inst)| inst.is_decided())
            .map(|(slot, inst)| (slot, inst.reqs.clone()))
            .collect()
    }

    /// Handler of Pause control message. Blocks until told to resume;
    /// returns false if told to terminate meanwhile.
    async fn handle_ctrl_pause(&mut self) -> Result<bool, GuidStoreError> {
        pf_warn!(self.me; "server got pause req");
        self.control_hub.send_reply(CtrlReply::Paused)?;
        if !self.control_hub.wait_resume().await? {
            return Ok(false);
        }

        // reset leader heartbeat timer
        pf_warn!(self.me; "server resumed");
        if self.is_member() && !self.retired {
            self.kickoff_hb_hear_timer()?;
        }
        Ok(true)
    }

    /// Handler of TakeSnapshot control message.
    async fn handle_ctrl_take_snapshot(
        &mut self,
    ) -> Result<(), GuidStoreError> {
        pf_warn!(self.me; "server told to take snapshot");
        self.take_new_snapshot(true).await?;

        self.control_hub.send_reply(CtrlReply::SnapshotUpTo {
            new_start: self.insts.start_slot(),
        })
    }

    /// Synthesized handler of manager control messages. If ok, returns
    /// `Some(false)` if decides to shutdown completely, and `None` if not
    /// terminating.
    pub(super) async fn handle_ctrl_msg(
        &mut self,
        msg: CtrlMsg,
    ) -> Result<Option<bool>, GuidStoreError> {
        match msg {
            CtrlMsg::StepUp => {
                pf_warn!(self.me; "server told to step up");
                self.become_a_leader()?;
                self.control_hub.send_reply(CtrlReply::SteppedUp)?;
                Ok(None)
            }

            CtrlMsg::TakeSnapshot => {
                self.handle_ctrl_take_snapshot().await?;
                Ok(None)
            }

            CtrlMsg::Pause => {
                if self.handle_ctrl_pause().await? {
                    Ok(None)
                } else {
                    Ok(Some(false))
                }
            }

            CtrlMsg::Resume => {
                self.control_hub.send_reply(CtrlReply::Resumed)?;
                Ok(None)
            }

            CtrlMsg::QueryInfo => {
                let info = self.replica_info();
                self.control_hub.send_reply(CtrlReply::Info(info))?;
                Ok(None)
            }

            CtrlMsg::DumpState => {
                let state = self.dump_state().await?;
                self.control_hub.send_reply(CtrlReply::State(state))?;
                Ok(None)
            }

            CtrlMsg::DumpLog => {
                let decided = self.decided_log();
                self.control_hub.send_reply(CtrlReply::Decided(decided))?;
                Ok(None)
            }

            CtrlMsg::Terminate => {
                pf_warn!(self.me; "server told to terminate");
                self.control_hub.send_reply(CtrlReply::Terminated)?;
                Ok(Some(false))
            }
        }
    }
}

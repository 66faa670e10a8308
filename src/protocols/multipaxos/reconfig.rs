//! MultiPaxos -- membership reconfiguration.
//!
//! A `Reconfigure` command decided at slot `s` stops the current epoch: no
//! slot after `s` counts in it. Once `s` is applied every member moves into
//! the next epoch, starting at `s + 1` with the new membership. Replicas that
//! are added get the state at `s + 1` shipped by the old leader; replicas that
//! are removed get told to stop and retire once they catch up.

use super::*;

use crate::server::{ApiReply, ClientId, RequestId};
use crate::utils::GuidStoreError;

// PaxosReplica reconfiguration logic
impl PaxosReplica {
    /// Moves into `new_epoch` right after the reconfiguration decided at
    /// `slot` has been applied.
    pub(super) async fn apply_reconfiguration(
        &mut self,
        slot: usize,
        members: Vec<ReplicaId>,
        new_epoch: Epoch,
    ) -> Result<(), GuidStoreError> {
        pf_info!(self.me; "reconfiguring at slot {}: epoch {} -> {} {:?}",
                          slot, self.epoch, new_epoch, members);
        self.flush_wal().await?;

        let was_leader = self.is_leader();
        let old_members = std::mem::replace(&mut self.members, members);
        self.epoch = new_epoch;
        self.quorum_cnt = Self::quorum_of(&self.members);

        // whatever was proposed after the stop point is void
        if was_leader {
            let voided: Vec<(ClientId, RequestId)> = self
                .insts
                .iter_from(slot + 1)
                .filter(|(_, inst)| inst.external)
                .flat_map(|(_, inst)| inst.reqs.iter().map(|(c, r)| (*c, r.id)))
                .collect();
            for (client, req_id) in voided {
                self.external_api
                    .send_reply(ApiReply::retry_later(req_id), client)?;
            }
        }
        self.insts.truncate_tail(slot + 1);
        self.commit_bar = slot + 1;
        self.exec_bar = slot + 1;
        self.exec_gate = None;
        self.reconfig_slot = None;
        self.prepare_bk = None;
        self.bal_prepared = Ballot::default();

        self.update_routing()?;
        let state = match self.take_new_snapshot(true).await? {
            Some(state) => state,
            None => self.dump_state().await?,
        };

        // the old leader starts the joiners and stops the removed
        if was_leader {
            let joiners: Vec<ReplicaId> = self
                .members
                .iter()
                .copied()
                .filter(|m| !old_members.contains(m) && *m != self.me.node)
                .collect();
            if !joiners.is_empty() {
                self.transport_hub.set_peers(&joiners);
                let checkpoint = Checkpoint {
                    slot: slot + 1,
                    ballot: self.bal_max_seen,
                    state,
                };
                let start = PeerMsg::Start { checkpoint };
                self.bcast_peers(start, Some(&joiners))?;
                pf_info!(self.me; "sent Start -> {:?}", joiners);
            }

            let removed: Vec<ReplicaId> = old_members
                .iter()
                .copied()
                .filter(|m| !self.members.contains(m) && *m != self.me.node)
                .collect();
            if !removed.is_empty() {
                self.transport_hub.set_peers(&removed);
                let msg = PeerMsg::Stop {
                    slot,
                    members: self.members.clone(),
                };
                self.bcast_peers(msg, Some(&removed))?;
                pf_info!(self.me; "sent Stop -> {:?}", removed);
            }
        }

        if !self.is_member() {
            return self.retire();
        }
        self.transport_hub.set_peers(&self.members);
        if was_leader {
            // keep leading the new membership
            self.start_prepare()
        } else {
            self.leader = None;
            self.kickoff_hb_hear_timer()
        }
    }

    /// Leaves the group for good; clients get sent to the successors.
    pub(super) fn retire(&mut self) -> Result<(), GuidStoreError> {
        pf_warn!(self.me; "no longer a member, retiring in favor of {:?}",
                          self.members);
        self.retired = true;
        self.successors = self.members.clone();
        self.leader = None;
        self.bal_prep_sent = Ballot::default();
        self.bal_prepared = Ballot::default();
        self.prepare_bk = None;
        self.hb_hear_timer.cancel();
        self.transport_hub.set_peers(&[]);

        let target = self.successors.first().copied();
        for (client, req) in std::mem::take(&mut self.pending_reqs) {
            let reply = match target {
                Some(to) => ApiReply::redirect(req.id, to),
                None => ApiReply::retry_later(req.id),
            };
            self.external_api.send_reply(reply, client)?;
        }
        Ok(())
    }
}

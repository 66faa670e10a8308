//! MultiPaxos -- leader election.

use super::*;

use crate::server::ApiReply;
use crate::utils::GuidStoreError;

use rand::prelude::*;

// PaxosReplica leadership related logic
impl PaxosReplica {
    /// If a larger ballot number is seen, consider its proposer as the new
    /// leader, stepping down if I was one.
    pub(super) fn check_leader(
        &mut self,
        ballot: Ballot,
    ) -> Result<(), GuidStoreError> {
        if ballot > self.bal_max_seen {
            self.bal_max_seen = ballot;

            // clear my leader status if I was one
            if self.is_leader() && ballot.proposer != self.me.node {
                self.step_down(ballot)?;
            }
        }

        if ballot == self.bal_max_seen
            && !ballot.is_null()
            && ballot.proposer != self.me.node
        {
            self.leader = Some(ballot.proposer);
        }
        Ok(())
    }

    /// Gives up leadership after being preempted by `ballot`. Requests held
    /// for my Prepare phase, and those of my proposals not yet decided, are
    /// redirected to its proposer.
    fn step_down(&mut self, ballot: Ballot) -> Result<(), GuidStoreError> {
        pf_info!(self.me; "preempted by bal {}, no longer a leader...", ballot);
        self.leader = Some(ballot.proposer);
        self.bal_prep_sent = Ballot::default();
        self.bal_prepared = Ballot::default();
        self.prepare_bk = None;
        self.reconfig_slot = None;
        self.reprepare_after_ckpt = false;

        // an undecided proposal of mine may lose its slot; its clients retry
        // under the same request IDs, which executes them at most once
        let mut orphaned = std::mem::take(&mut self.pending_reqs)
            .into_iter()
            .map(|(client, req)| (client, req.id))
            .collect::<Vec<_>>();
        for (_, inst) in self.insts.iter_mut_from(self.commit_bar) {
            if inst.leader_bk.take().is_some()
                && !inst.is_decided()
                && inst.external
            {
                inst.external = false;
                orphaned.extend(inst.reqs.iter().map(|(c, r)| (*c, r.id)));
            }
        }
        for (client, req_id) in orphaned {
            let reply = ApiReply::redirect(req_id, ballot.proposer);
            self.external_api.send_reply(reply, client)?;
        }
        self.kickoff_hb_hear_timer()
    }

    /// Becomes a leader unless I already am one or cannot be one.
    pub(super) fn become_a_leader(&mut self) -> Result<(), GuidStoreError> {
        if self.is_leader()
            || self.retired
            || self.awaiting_start()
            || !self.is_member()
        {
            return Ok(());
        }
        self.start_prepare()
    }

    /// Makes a greater ballot and sends Prepare for every slot from my
    /// commit point onwards, then starts broadcasting heartbeats.
    pub(super) fn start_prepare(&mut self) -> Result<(), GuidStoreError> {
        self.leader = Some(self.me.node);
        self.bal_prepared = Ballot::default();
        self.bal_prep_sent =
            Ballot::make_greater(self.bal_max_seen, self.me.node);
        self.bal_max_seen = self.bal_prep_sent;
        let ballot = self.bal_prep_sent;
        let trigger_slot = self.commit_bar;
        pf_info!(self.me; "becoming a leader with bal {} from slot {}...",
                          ballot, trigger_slot);

        self.prepare_bk = Some(PrepareBookkeeping {
            ballot,
            trigger_slot,
            acks: self.new_acks(),
            voted: BTreeMap::new(),
            max_snap_start: 0,
            snap_peer: self.me.node,
        });

        // record update to largest prepare ballot; my own promise counts
        // once durable
        self.log_append(
            trigger_slot,
            LOG_PREPARE,
            WalEntry::PrepareBal {
                epoch: self.epoch,
                trigger_slot,
                ballot,
            },
        )?;
        self.pending_promises.push_back(PendingPromise {
            peer: self.me.node,
            ballot,
            trigger_slot,
            epoch: self.epoch,
        });
        pf_trace!(self.me; "submitted PrepareBal for trigger {} bal {}",
                           trigger_slot, ballot);

        // send Prepare messages to all peers
        self.bcast_peers(
            PeerMsg::Prepare {
                ballot,
                trigger_slot,
            },
            None,
        )?;
        pf_trace!(self.me; "broadcast Prepare messages for trigger {} bal {}",
                           trigger_slot, ballot);

        self.bcast_heartbeats()
    }

    /// Handler of hearing timeout: the leader is presumed dead.
    pub(super) fn hear_timed_out(&mut self) -> Result<(), GuidStoreError> {
        if self.is_leader() {
            return self.kickoff_hb_hear_timer();
        }
        pf_debug!(self.me; "leader {:?} heartbeat timed out", self.leader);
        self.become_a_leader()
    }

    /// Broadcasts heartbeats to all replicas, retransmitting the Prepare and
    /// Accept messages that have not been answered yet.
    pub(super) fn bcast_heartbeats(&mut self) -> Result<(), GuidStoreError> {
        self.bcast_peers(
            PeerMsg::Heartbeat {
                ballot: self.bal_max_seen,
                commit_bar: self.commit_bar,
                exec_bar: self.exec_bar,
                start_slot: self.insts.start_slot(),
            },
            None,
        )?;
        self.kickoff_hb_hear_timer()?;

        // re-send Prepare to members yet to promise
        if let Some(bk) = self.prepare_bk.as_ref() {
            let targets: Vec<ReplicaId> = self
                .members
                .iter()
                .copied()
                .filter(|&m| m != self.me.node && !bk.acks.contains(m))
                .collect();
            let msg = PeerMsg::Prepare {
                ballot: bk.ballot,
                trigger_slot: bk.trigger_slot,
            };
            self.bcast_peers(msg, Some(&targets))?;
        }

        // re-send Accepts to members yet to vote
        if !self.bal_prepared.is_null() {
            let mut resend = vec![];
            for (slot, inst) in self.insts.iter_from(self.commit_bar) {
                if resend.len() >= self.config.msg_chunk_size {
                    break;
                }
                if inst.status != InstStatus::Accepting {
                    continue;
                }
                if let Some(bk) = inst.leader_bk.as_ref() {
                    let targets: Vec<ReplicaId> = self
                        .members
                        .iter()
                        .copied()
                        .filter(|&m| {
                            m != self.me.node && !bk.accept_acks.contains(m)
                        })
                        .collect();
                    if !targets.is_empty() {
                        let reqs = inst.reqs.clone();
                        resend.push((slot, inst.bal, reqs, targets));
                    }
                }
            }
            for (slot, ballot, reqs, targets) in resend {
                self.bcast_peers(
                    PeerMsg::Accept { slot, ballot, reqs },
                    Some(&targets),
                )?;
                pf_trace!(self.me; "re-sent Accept -> {:?} for slot {} bal {}",
                                   targets, slot, ballot);
            }
        }

        Ok(())
    }

    /// Chooses a random hb_hear_timeout from the min-max range and kicks off
    /// the hb_hear_timer.
    pub(super) fn kickoff_hb_hear_timer(
        &mut self,
    ) -> Result<(), GuidStoreError> {
        self.hb_hear_timer.cancel();
        if self.config.disable_hb_timer || self.retired {
            return Ok(());
        }

        let timeout_ms = thread_rng().gen_range(
            self.config.hb_hear_timeout_min..=self.config.hb_hear_timeout_max,
        );
        self.hb_hear_timer
            .kickoff(Duration::from_millis(timeout_ms))
    }

    /// Heard a heartbeat from the leader. Refreshes my hearing timer and
    /// asks for whatever decided slots I am missing.
    pub(super) fn heard_heartbeat(
        &mut self,
        peer: ReplicaId,
        ballot: Ballot,
        commit_bar: usize,
        start_slot: usize,
    ) -> Result<(), GuidStoreError> {
        // ignore outdated heartbeats
        if ballot < self.bal_max_seen {
            return self.send_peer(
                PeerMsg::Reject {
                    ballot: self.bal_max_seen,
                },
                peer,
            );
        }
        self.check_leader(ballot)?;
        self.kickoff_hb_hear_timer()?;
        self.highest_commit_heard = self.highest_commit_heard.max(commit_bar);

        // slots I miss have been compacted at the leader
        if start_slot > self.commit_bar {
            pf_debug!(self.me; "lagging behind leader compaction at {}",
                               start_slot);
            return self.request_checkpoint(peer, false);
        }

        let holes: Vec<usize> = (self.commit_bar..commit_bar)
            .filter(|&s| {
                self.insts.get(s).map_or(true, |inst| !inst.is_decided())
            })
            .take(self.config.msg_chunk_size)
            .collect();
        if !holes.is_empty() {
            pf_debug!(self.me; "asking {} to fill holes {:?}", peer, holes);
            self.send_peer(PeerMsg::FillHoles { slots: holes }, peer)?;
        }
        Ok(())
    }
}

//! MultiPaxos -- peer-peer messaging.

use super::*;

use crate::utils::GuidStoreError;

// PaxosReplica peer-peer messages handling
impl PaxosReplica {
    /// Handler of Prepare message from leader.
    fn handle_msg_prepare(
        &mut self,
        peer: ReplicaId,
        ballot: Ballot,
        trigger_slot: usize,
    ) -> Result<(), GuidStoreError> {
        pf_trace!(self.me; "received Prepare <- {} for trigger {} bal {}",
                           peer, trigger_slot, ballot);

        // if ballot is not smaller than what I have seen:
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

        // record update to largest prepare ballot
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
            peer,
            ballot,
            trigger_slot,
            epoch: self.epoch,
        });
        pf_trace!(self.me; "submitted PrepareBal for trigger {} bal {}",
                           trigger_slot, ballot);
        Ok(())
    }

    /// Handler of Prepare reply from replica.
    pub(super) fn handle_msg_prepare_reply(
        &mut self,
        peer: ReplicaId,
        ballot: Ballot,
        voted: Vec<(usize, Ballot, ReqBatch)>,
        snap_start: usize,
    ) -> Result<(), GuidStoreError> {
        pf_trace!(self.me; "received PrepareReply <- {} bal {} voted {}",
                           peer, ballot, voted.len());
        if !self.is_leader() {
            return Ok(());
        }

        let bk = match self.prepare_bk.as_mut() {
            Some(bk) if bk.ballot == ballot => bk,
            _ => return Ok(()), // outdated or already finished
        };
        if !bk.acks.insert(peer) {
            return Ok(()); // duplicate
        }

        // keep the highest-ballot vote reported for every slot
        for (slot, vbal, reqs) in voted {
            if slot < bk.trigger_slot {
                continue;
            }
            match bk.voted.get(&slot) {
                Some((known, _)) if *known >= vbal => {}
                _ => {
                    bk.voted.insert(slot, (vbal, reqs));
                }
            }
        }
        if snap_start > bk.max_snap_start {
            bk.max_snap_start = snap_start;
            bk.snap_peer = peer;
        }

        if bk.acks.count_within(&self.members) >= self.quorum_cnt {
            self.finish_prepare()?;
        }
        Ok(())
    }

    /// Completes the Prepare phase once a quorum promised: re-proposes every
    /// slot some acceptor voted for, fills the others with no-ops, and
    /// starts taking requests.
    fn finish_prepare(&mut self) -> Result<(), GuidStoreError> {
        let bk = match self.prepare_bk.take() {
            Some(bk) => bk,
            None => return Ok(()),
        };

        // a promiser compacted beyond my commit point; their votes below it
        // are gone, so catch up first and prepare again
        if bk.max_snap_start > self.commit_bar {
            pf_info!(self.me; "quorum compacted past us at {}, catching up",
                              bk.snap_peer);
            self.reprepare_after_ckpt = true;
            return self.request_checkpoint(bk.snap_peer, true);
        }

        self.bal_prepared = bk.ballot;
        pf_info!(self.me; "prepared as leader with bal {}", bk.ballot);

        let end_slot = bk
            .voted
            .keys()
            .next_back()
            .map_or(0, |&s| s + 1)
            .max(self.insts.end_slot());
        let ballot = bk.ballot;
        let mut voted = bk.voted;
        for slot in self.commit_bar.max(self.insts.start_slot())..end_slot {
            let acks = self.new_acks();
            let inst = self.insts.locate(slot)?;
            if inst.is_decided() {
                let reqs = inst.reqs.clone();
                let bal = inst.bal;
                self.bcast_peers(
                    PeerMsg::Decide {
                        slot,
                        ballot: bal,
                        reqs,
                    },
                    None,
                )?;
                continue;
            }

            let reqs = voted
                .remove(&slot)
                .map(|(_, reqs)| reqs)
                .unwrap_or_default();
            self.insts.append(
                slot,
                Instance {
                    leader_bk: Some(LeaderBookkeeping { accept_acks: acks }),
                    external: true,
                    ..Instance::accepting(ballot, reqs.clone())
                },
            )?;

            if Self::reconfig_members(&reqs).is_some() {
                self.reconfig_slot = Some(slot);
            }

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
            self.bcast_peers(PeerMsg::Accept { slot, ballot, reqs }, None)?;
            pf_trace!(self.me; "re-proposed slot {} bal {}", slot, ballot);
        }

        // requests held during the Prepare phase
        let held = std::mem::take(&mut self.pending_reqs);
        if !held.is_empty() {
            self.admit_reqs(held, false)?;
        }
        Ok(())
    }

    /// Handler of Accept message from leader.
    fn handle_msg_accept(
        &mut self,
        peer: ReplicaId,
        slot: usize,
        ballot: Ballot,
        reqs: ReqBatch,
    ) -> Result<(), GuidStoreError> {
        pf_trace!(self.me; "received Accept <- {} for slot {} bal {}",
                           peer, slot, ballot);
        if slot < self.insts.start_slot() {
            return Ok(()); // compacted, necessarily decided
        }

        // if ballot is not smaller than what I have made promises for:
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

        let epoch = self.epoch;
        if self.insts.locate(slot)?.is_decided() {
            // the value is settled; a fresh vote changes nothing
            return self.send_peer(PeerMsg::AcceptReply { slot, ballot }, peer);
        }
        self.insts.append(
            slot,
            Instance {
                replica_bk: Some(ReplicaBookkeeping { source: peer }),
                ..Instance::accepting(ballot, reqs.clone())
            },
        )?;

        // record update to largest accepted ballot and corresponding data
        self.log_append(
            slot,
            LOG_ACCEPT,
            WalEntry::AcceptData {
                epoch,
                slot,
                ballot,
                reqs,
            },
        )?;
        pf_trace!(self.me; "submitted AcceptData log action for slot {} bal {}",
                           slot, ballot);
        Ok(())
    }

    /// Handler of Accept reply from replica.
    pub(super) fn handle_msg_accept_reply(
        &mut self,
        peer: ReplicaId,
        slot: usize,
        ballot: Ballot,
    ) -> Result<(), GuidStoreError> {
        pf_trace!(self.me; "received AcceptReply <- {} for slot {} bal {}",
                           peer, slot, ballot);
        if !self.is_leader() || ballot != self.bal_prepared {
            return Ok(());
        }

        let inst = match self.insts.get_mut(slot) {
            Some(inst) => inst,
            None => return Ok(()),
        };
        if inst.status != InstStatus::Accepting || inst.bal != ballot {
            return Ok(());
        }
        let bk = match inst.leader_bk.as_mut() {
            Some(bk) => bk,
            None => return Ok(()),
        };
        if !bk.accept_acks.insert(peer) {
            return Ok(());
        }

        // if quorum size reached, mark this instance as committed
        if bk.accept_acks.count_within(&self.members) >= self.quorum_cnt {
            inst.status = InstStatus::Committed;
            let reqs = inst.reqs.clone();
            pf_debug!(self.me; "committed instance at slot {} bal {}",
                               slot, ballot);

            self.log_append(
                slot,
                LOG_COMMIT,
                WalEntry::CommitSlot {
                    epoch: self.epoch,
                    slot,
                },
            )?;
            pf_trace!(self.me; "submitted CommitSlot for slot {} bal {}",
                               slot, ballot);

            self.bcast_peers(PeerMsg::Decide { slot, ballot, reqs }, None)?;
            pf_trace!(self.me; "broadcast Decide messages for slot {} bal {}",
                               slot, ballot);
        }
        Ok(())
    }

    /// Handler of a decision, whether broadcast or filling a hole.
    fn handle_msg_decide(
        &mut self,
        peer: ReplicaId,
        slot: usize,
        ballot: Ballot,
        reqs: ReqBatch,
    ) -> Result<(), GuidStoreError> {
        pf_trace!(self.me; "received Decide <- {} for slot {} bal {}",
                           peer, slot, ballot);
        if slot < self.insts.start_slot() {
            return Ok(());
        }
        self.highest_commit_heard = self.highest_commit_heard.max(slot + 1);

        let epoch = self.epoch;
        let inst = self.insts.locate(slot)?;
        if inst.is_decided() {
            return Ok(());
        }

        // persist the decided value first unless it is what I voted for
        let relog = inst.voted != (ballot, reqs.clone());
        let external = inst.external && !relog;
        self.insts.append(
            slot,
            Instance {
                status: InstStatus::Committed,
                external,
                ..Instance::accepting(ballot, reqs.clone())
            },
        )?;
        if relog {
            self.log_append(
                slot,
                LOG_ACCEPT,
                WalEntry::AcceptData {
                    epoch,
                    slot,
                    ballot,
                    reqs,
                },
            )?;
        }
        let entry = WalEntry::CommitSlot { epoch, slot };
        self.log_append(slot, LOG_COMMIT, entry)?;
        pf_trace!(self.me; "submitted CommitSlot for slot {} bal {}",
                           slot, ballot);
        Ok(())
    }

    /// Handler of a Reject: someone has seen a higher ballot than mine.
    fn handle_msg_reject(
        &mut self,
        peer: ReplicaId,
        ballot: Ballot,
    ) -> Result<(), GuidStoreError> {
        pf_debug!(self.me; "received Reject <- {} bal {}", peer, ballot);
        if ballot > self.bal_max_seen {
            self.check_leader(ballot)?;
        }
        Ok(())
    }

    /// Handler of a lagging follower asking for decided values.
    fn handle_msg_fill_holes(
        &mut self,
        peer: ReplicaId,
        slots: Vec<usize>,
    ) -> Result<(), GuidStoreError> {
        let decided: Vec<(usize, Ballot, ReqBatch)> = slots
            .into_iter()
            .filter_map(|slot| {
                self.insts
                    .get(slot)
                    .filter(|inst| inst.is_decided())
                    .map(|inst| (slot, inst.bal, inst.reqs.clone()))
            })
            .collect();
        for (slot, ballot, reqs) in decided {
            self.send_peer(PeerMsg::Decide { slot, ballot, reqs }, peer)?;
        }
        Ok(())
    }

    /// Synthesized handler of receiving message from peer.
    pub(super) async fn handle_msg_recv(
        &mut self,
        peer: ReplicaId,
        env: Envelope,
    ) -> Result<(), GuidStoreError> {
        if self.retired {
            return Ok(());
        }
        let Envelope { epoch, msg } = env;

        // state transfer works across epochs
        match msg {
            PeerMsg::CheckpointRequest => {
                return self.handle_msg_checkpoint_request(peer).await;
            }
            PeerMsg::CheckpointReply(checkpoint) => {
                return self.install_checkpoint(checkpoint).await;
            }
            PeerMsg::Start { checkpoint } => {
                if epoch > self.epoch {
                    pf_info!(self.me; "started by {} into epoch {}",
                                      peer, epoch);
                    return self.install_checkpoint(checkpoint).await;
                }
                return Ok(());
            }
            PeerMsg::Stop { slot, members } => {
                if epoch >= self.epoch {
                    pf_info!(self.me; "group stopped at {} -> {:?} per {}",
                                      slot, members, peer);
                    return self.request_checkpoint(peer, true);
                }
                return Ok(());
            }
            _ => {}
        }

        if epoch < self.epoch {
            // sender missed a reconfiguration; our reply makes it catch up
            if !matches!(msg, PeerMsg::Reject { .. }) {
                self.send_peer(
                    PeerMsg::Reject {
                        ballot: self.bal_max_seen,
                    },
                    peer,
                )?;
            }
            return Ok(());
        }
        if epoch > self.epoch {
            pf_debug!(self.me; "heard epoch {} > mine {} from {}",
                               epoch, self.epoch, peer);
            return self.request_checkpoint(peer, false);
        }
        if self.awaiting_start() {
            return Ok(());
        }

        match msg {
            PeerMsg::Prepare {
                ballot,
                trigger_slot,
            } => self.handle_msg_prepare(peer, ballot, trigger_slot),
            PeerMsg::PrepareReply {
                ballot,
                voted,
                snap_start,
            } => self.handle_msg_prepare_reply(peer, ballot, voted, snap_start),
            PeerMsg::Accept { slot, ballot, reqs } => {
                self.handle_msg_accept(peer, slot, ballot, reqs)
            }
            PeerMsg::AcceptReply { slot, ballot } => {
                self.handle_msg_accept_reply(peer, slot, ballot)
            }
            PeerMsg::Decide { slot, ballot, reqs } => {
                self.handle_msg_decide(peer, slot, ballot, reqs)
            }
            PeerMsg::Reject { ballot } => self.handle_msg_reject(peer, ballot),
            PeerMsg::Heartbeat {
                ballot,
                commit_bar,
                start_slot,
                ..
            } => self.heard_heartbeat(peer, ballot, commit_bar, start_slot),
            PeerMsg::FillHoles { slots } => {
                self.handle_msg_fill_holes(peer, slots)
            }
            _ => Ok(()), // handled above
        }
    }
}

//! GuidStore server control messages module implementation.

use crate::server::{Epoch, RecordStore, ReplicaId, ReplicaTag, ReqBatch};
use crate::utils::GuidStoreError;

use serde::{Deserialize, Serialize};

use tokio::sync::{mpsc, oneshot};

/// Control message from the cluster manager to one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CtrlMsg {
    /// Try to become the group leader now.
    StepUp,

    /// Take a snapshot now.
    TakeSnapshot,

    /// Pause event loop execution.
    Pause,

    /// Resume event loop execution.
    Resume,

    /// Report consensus progress.
    QueryInfo,

    /// Copy out the applied record store.
    DumpState,

    /// Copy out the decided log slots still held in memory.
    DumpLog,

    /// Stop the replica.
    Terminate,
}

/// Consensus progress of one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub tag: ReplicaTag,
    pub epoch: Epoch,
    pub members: Vec<ReplicaId>,

    /// Round of the highest ballot seen.
    pub ballot_round: u64,

    pub is_leader: bool,
    pub leader: Option<ReplicaId>,

    /// First slot not yet committed.
    pub commit_bar: usize,

    /// First slot not yet executed.
    pub exec_bar: usize,

    /// First slot still held in the log.
    pub start_slot: usize,

    pub retired: bool,
    pub awaiting_start: bool,
}

/// Reply of a replica to a control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CtrlReply {
    SteppedUp,
    SnapshotUpTo { new_start: usize },
    Paused,
    Resumed,
    Info(ReplicaInfo),
    State(Box<RecordStore>),
    Decided(Vec<(usize, ReqBatch)>),
    Terminated,
}

/// A control message paired with the channel for its reply.
pub type CtrlRequest = (CtrlMsg, oneshot::Sender<CtrlReply>);

/// Manager-side handle to one replica's control channel.
#[derive(Debug, Clone)]
pub struct CtrlHandle {
    tx_ctrl: mpsc::UnboundedSender<CtrlRequest>,
}

impl CtrlHandle {
    /// Creates a handle and the receiver to hand to the replica.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CtrlRequest>) {
        let (tx_ctrl, rx_ctrl) = mpsc::unbounded_channel();
        (CtrlHandle { tx_ctrl }, rx_ctrl)
    }

    /// Sends a control message and waits for the replica's reply.
    pub async fn request(
        &self,
        msg: CtrlMsg,
    ) -> Result<CtrlReply, GuidStoreError> {
        let (tx_reply, rx_reply) = oneshot::channel();
        self.tx_ctrl
            .send((msg, tx_reply))
            .map_err(|e| GuidStoreError::msg(e.to_string()))?;
        Ok(rx_reply.await?)
    }
}

/// The manager control message handler module of one replica.
pub struct ControlHub {
    /// My replica tag.
    me: ReplicaTag,

    /// Receiver side of the control channel.
    rx_ctrl: mpsc::UnboundedReceiver<CtrlRequest>,

    /// Reply channel of the control message being handled.
    pending_reply: Option<oneshot::Sender<CtrlReply>>,
}

// ControlHub public API implementation
impl ControlHub {
    pub fn new_and_setup(
        me: ReplicaTag,
        rx_ctrl: mpsc::UnboundedReceiver<CtrlRequest>,
    ) -> Self {
        ControlHub {
            me,
            rx_ctrl,
            pending_reply: None,
        }
    }

    /// Waits for the next control message. Its reply goes out with the next
    /// `send_reply()`. Cancellation safe.
    pub async fn recv_ctrl(&mut self) -> Result<CtrlMsg, GuidStoreError> {
        match self.rx_ctrl.recv().await {
            Some((msg, tx_reply)) => {
                if self.pending_reply.replace(tx_reply).is_some() {
                    pf_warn!(self.me; "previous ctrl msg left unanswered");
                }
                Ok(msg)
            }
            None => logged_err!(self.me; "ctrl channel has been closed"),
        }
    }

    /// Replies to the control message last received.
    pub fn send_reply(
        &mut self,
        reply: CtrlReply,
    ) -> Result<(), GuidStoreError> {
        match self.pending_reply.take() {
            Some(tx_reply) => {
                if tx_reply.send(reply).is_err() {
                    pf_debug!(self.me; "ctrl requester has gone");
                }
                Ok(())
            }
            None => logged_err!(self.me; "no ctrl msg to reply to"),
        }
    }

    /// Waits until a `Resume` arrives, replying to everything received in
    /// the meantime. Returns false if told to terminate instead.
    pub async fn wait_resume(&mut self) -> Result<bool, GuidStoreError> {
        loop {
            match self.recv_ctrl().await? {
                CtrlMsg::Resume => {
                    self.send_reply(CtrlReply::Resumed)?;
                    return Ok(true);
                }
                CtrlMsg::Terminate => {
                    self.send_reply(CtrlReply::Terminated)?;
                    return Ok(false);
                }
                CtrlMsg::Pause => self.send_reply(CtrlReply::Paused)?,
                msg => {
                    pf_debug!(self.me; "ignoring {:?} while paused", msg);
                    self.pending_reply = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn request_reply() -> Result<(), GuidStoreError> {
        let (handle, rx_ctrl) = CtrlHandle::new();
        let mut hub = ControlHub::new_and_setup(ReplicaTag::new(0, 1), rx_ctrl);
        let requester = tokio::spawn(async move {
            handle.request(CtrlMsg::TakeSnapshot).await
        });
        assert_eq!(hub.recv_ctrl().await?, CtrlMsg::TakeSnapshot);
        hub.send_reply(CtrlReply::SnapshotUpTo { new_start: 4 })?;
        assert_eq!(requester.await??, CtrlReply::SnapshotUpTo { new_start: 4 });
        assert!(hub.send_reply(CtrlReply::Paused).is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn paused_until_resume() -> Result<(), GuidStoreError> {
        let (handle, rx_ctrl) = CtrlHandle::new();
        let mut hub = ControlHub::new_and_setup(ReplicaTag::new(0, 1), rx_ctrl);
        let waiter = tokio::spawn(async move {
            let resumed = hub.wait_resume().await;
            (hub, resumed)
        });
        assert!(handle.request(CtrlMsg::QueryInfo).await.is_err());
        assert_eq!(handle.request(CtrlMsg::Pause).await?, CtrlReply::Paused);
        assert_eq!(handle.request(CtrlMsg::Resume).await?, CtrlReply::Resumed);
        let (_hub, resumed) = waiter.await?;
        assert!(resumed?);
        Ok(())
    }
}

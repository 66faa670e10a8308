//! GuidStore server internal peer-peer transport module implementation.
//!
//! Replicas of one node and of different nodes talk over an in-process
//! network of per-replica inboxes. Delivery is best effort: messages to or
//! from a node that is down, or over a cut link, are silently dropped, and
//! protocols retransmit as needed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::server::{GroupId, ReplicaId, ReplicaTag};
use crate::utils::GuidStoreError;

use tokio::sync::mpsc;

/// Fault injection state shared by peer and client-facing traffic.
#[derive(Debug, Default)]
pub struct LinkFaults {
    /// Nodes that are currently unreachable.
    down: HashSet<ReplicaId>,

    /// Directed links `(from, to)` that currently drop messages.
    cut: HashSet<(ReplicaId, ReplicaId)>,
}

impl LinkFaults {
    #[inline]
    pub fn is_down(&self, node: ReplicaId) -> bool {
        self.down.contains(&node)
    }

    /// Whether a message from `from` can reach `to` right now.
    #[inline]
    pub fn can_reach(&self, from: ReplicaId, to: ReplicaId) -> bool {
        !self.down.contains(&from)
            && !self.down.contains(&to)
            && !self.cut.contains(&(from, to))
    }
}

/// Inbox sender type of one replica.
type Inbox<Msg> = mpsc::UnboundedSender<(ReplicaId, Msg)>;

/// Handle to the in-process network. Cloning yields another handle to the
/// same network.
pub struct Network<Msg> {
    inboxes: Arc<RwLock<HashMap<ReplicaTag, Inbox<Msg>>>>,
    faults: Arc<RwLock<LinkFaults>>,
}

impl<Msg> Clone for Network<Msg> {
    fn clone(&self) -> Self {
        Network {
            inboxes: self.inboxes.clone(),
            faults: self.faults.clone(),
        }
    }
}

impl<Msg> Default for Network<Msg> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Msg> Network<Msg> {
    pub fn new() -> Self {
        Network {
            inboxes: Arc::new(RwLock::new(HashMap::new())),
            faults: Arc::new(RwLock::new(LinkFaults::default())),
        }
    }

    /// Shared fault state, for other channels that should obey it.
    pub fn faults(&self) -> Arc<RwLock<LinkFaults>> {
        self.faults.clone()
    }

    /// Registers (or replaces) the inbox of `tag`, returning its receiver.
    pub fn register(
        &self,
        tag: ReplicaTag,
    ) -> Result<mpsc::UnboundedReceiver<(ReplicaId, Msg)>, GuidStoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.write()?.insert(tag, tx);
        Ok(rx)
    }

    /// Delivers `msg` from node `from` to node `to` within `group`. Returns
    /// whether the message was handed to the receiver's inbox.
    pub fn deliver(
        &self,
        group: GroupId,
        from: ReplicaId,
        to: ReplicaId,
        msg: Msg,
    ) -> Result<bool, GuidStoreError> {
        if !self.faults.read()?.can_reach(from, to) {
            return Ok(false);
        }
        let inboxes = self.inboxes.read()?;
        match inboxes.get(&ReplicaTag::new(group, to)) {
            Some(tx) => Ok(tx.send((from, msg)).is_ok()),
            None => Ok(false),
        }
    }

    /// Makes `node` unreachable.
    pub fn isolate(&self, node: ReplicaId) -> Result<(), GuidStoreError> {
        self.faults.write()?.down.insert(node);
        Ok(())
    }

    /// Makes `node` reachable again and restores all its links.
    pub fn heal(&self, node: ReplicaId) -> Result<(), GuidStoreError> {
        let mut faults = self.faults.write()?;
        faults.down.remove(&node);
        faults.cut.retain(|&(from, to)| from != node && to != node);
        Ok(())
    }

    /// Drops messages on the directed link `from -> to`.
    pub fn cut(
        &self,
        from: ReplicaId,
        to: ReplicaId,
    ) -> Result<(), GuidStoreError> {
        self.faults.write()?.cut.insert((from, to));
        Ok(())
    }

    /// Restores the directed link `from -> to`.
    pub fn mend(
        &self,
        from: ReplicaId,
        to: ReplicaId,
    ) -> Result<(), GuidStoreError> {
        self.faults.write()?.cut.remove(&(from, to));
        Ok(())
    }

    pub fn is_down(&self, node: ReplicaId) -> Result<bool, GuidStoreError> {
        Ok(self.faults.read()?.is_down(node))
    }
}

/// The peer-peer messaging module of one replica.
pub struct TransportHub<Msg> {
    /// My replica tag.
    me: ReplicaTag,

    /// Network handle.
    network: Network<Msg>,

    /// Current peers, excluding myself.
    peers: Vec<ReplicaId>,

    /// Receiver side of my inbox.
    rx_recv: mpsc::UnboundedReceiver<(ReplicaId, Msg)>,
}

// TransportHub public API implementation
impl<Msg> TransportHub<Msg>
where
    Msg: Clone + Send + 'static,
{
    /// Creates a new transport hub, registering my inbox on the network.
    pub fn new_and_setup(
        me: ReplicaTag,
        network: Network<Msg>,
    ) -> Result<Self, GuidStoreError> {
        let rx_recv = network.register(me)?;
        Ok(TransportHub {
            me,
            network,
            peers: vec![],
            rx_recv,
        })
    }

    /// Sets the group members to broadcast to.
    pub fn set_peers(&mut self, members: &[ReplicaId]) {
        self.peers = members
            .iter()
            .copied()
            .filter(|&m| m != self.me.node)
            .collect();
    }

    #[inline]
    pub fn peers(&self) -> &[ReplicaId] {
        &self.peers
    }

    /// Sends a message to a specified peer. Undeliverable messages are
    /// dropped.
    pub fn send_msg(
        &mut self,
        msg: Msg,
        peer: ReplicaId,
    ) -> Result<(), GuidStoreError> {
        if !self.network.deliver(self.me.group, self.me.node, peer, msg)? {
            pf_trace!(self.me; "dropped msg -> {}", peer);
        }
        Ok(())
    }

    /// Broadcasts message to all current peers, or only those in `targets`
    /// when given.
    pub fn bcast_msg(
        &mut self,
        msg: Msg,
        targets: Option<&[ReplicaId]>,
    ) -> Result<(), GuidStoreError> {
        let peers = self.peers.clone();
        for peer in peers {
            if let Some(targets) = targets {
                if !targets.contains(&peer) {
                    continue;
                }
            }
            self.send_msg(msg.clone(), peer)?;
        }
        Ok(())
    }

    /// Receives a message from some peer. Cancellation safe.
    pub async fn recv_msg(
        &mut self,
    ) -> Result<(ReplicaId, Msg), GuidStoreError> {
        match self.rx_recv.recv().await {
            Some((peer, msg)) => Ok((peer, msg)),
            None => logged_err!(self.me; "recv channel has been closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{self, Duration};

    #[derive(Debug, Clone, PartialEq)]
    enum TestMsg {
        Ping(u32),
    }

    fn hub(
        network: &Network<TestMsg>,
        group: GroupId,
        node: ReplicaId,
    ) -> Result<TransportHub<TestMsg>, GuidStoreError> {
        let tag = ReplicaTag::new(group, node);
        TransportHub::new_and_setup(tag, network.clone())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_bcast_recv() -> Result<(), GuidStoreError> {
        let network = Network::new();
        let mut hubs = vec![];
        for node in 0..3 {
            let mut peer = hub(&network, 7, node)?;
            peer.set_peers(&[0, 1, 2]);
            hubs.push(peer);
        }
        assert_eq!(hubs[0].peers(), &[1, 2]);

        hubs[0].bcast_msg(TestMsg::Ping(1), None)?;
        assert_eq!(hubs[1].recv_msg().await?, (0, TestMsg::Ping(1)));
        assert_eq!(hubs[2].recv_msg().await?, (0, TestMsg::Ping(1)));

        hubs[2].send_msg(TestMsg::Ping(2), 1)?;
        assert_eq!(hubs[1].recv_msg().await?, (2, TestMsg::Ping(2)));

        hubs[1].bcast_msg(TestMsg::Ping(3), Some(&[2]))?;
        assert_eq!(hubs[2].recv_msg().await?, (1, TestMsg::Ping(3)));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn groups_are_separate() -> Result<(), GuidStoreError> {
        let network = Network::new();
        let mut a = hub(&network, 0, 1)?;
        let mut b = hub(&network, 1, 1)?;
        let mut sender = hub(&network, 1, 0)?;
        sender.send_msg(TestMsg::Ping(9), 1)?;
        assert_eq!(b.recv_msg().await?, (0, TestMsg::Ping(9)));
        assert!(time::timeout(Duration::from_millis(50), a.recv_msg())
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn faults_drop_messages() -> Result<(), GuidStoreError> {
        let network = Network::new();
        let mut a = hub(&network, 0, 0)?;
        let mut b = hub(&network, 0, 1)?;

        network.cut(0, 1)?;
        a.send_msg(TestMsg::Ping(1), 1)?;
        b.send_msg(TestMsg::Ping(2), 0)?;
        assert_eq!(a.recv_msg().await?, (1, TestMsg::Ping(2)));
        assert!(time::timeout(Duration::from_millis(50), b.recv_msg())
            .await
            .is_err());
        network.mend(0, 1)?;
        a.send_msg(TestMsg::Ping(5), 1)?;
        assert_eq!(b.recv_msg().await?, (0, TestMsg::Ping(5)));

        network.isolate(1)?;
        assert!(network.is_down(1)?);
        b.send_msg(TestMsg::Ping(3), 0)?;
        assert!(time::timeout(Duration::from_millis(50), a.recv_msg())
            .await
            .is_err());

        network.heal(1)?;
        a.send_msg(TestMsg::Ping(4), 1)?;
        assert_eq!(b.recv_msg().await?, (0, TestMsg::Ping(4)));
        Ok(())
    }
}

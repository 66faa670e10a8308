//! GuidStore generic replica trait to be implemented by all protocol-specific
//! server replica structs, plus the identifiers every replica is named by.

use std::fmt;
use std::sync::{Arc, RwLock};

use crate::client::RoutingTable;
use crate::server::{
    ApiEndpoints, ClientRegistry, CtrlRequest, IdentityVerifier, Network,
};
use crate::utils::GuidStoreError;

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use tokio::sync::mpsc;

/// Server node ID type.
pub type ReplicaId = u8;

/// Consensus group ID type.
pub type GroupId = u32;

/// Membership configuration number of a group.
pub type Epoch = u64;

/// Epoch every initially launched group starts in. Epoch 0 is reserved for
/// replicas that are waiting to be started by a reconfiguration.
pub const INITIAL_EPOCH: Epoch = 1;

/// Names one replica of one consensus group; also used as logging prefix.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub struct ReplicaTag {
    pub group: GroupId,
    pub node: ReplicaId,
}

impl ReplicaTag {
    pub fn new(group: GroupId, node: ReplicaId) -> Self {
        ReplicaTag { group, node }
    }
}

impl fmt::Display for ReplicaTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "g{}.r{}", self.group, self.node)
    }
}

/// Everything a replica needs from its hosting node to set itself up.
pub struct ReplicaSetup<Msg> {
    /// Which replica of which group.
    pub tag: ReplicaTag,

    /// Initial membership if the group has not persisted one yet. Empty for
    /// a replica joining through reconfiguration.
    pub members: Vec<ReplicaId>,

    /// Protocol-specific config in TOML format.
    pub config_str: Option<String>,

    /// In-process peer network.
    pub network: Network<Msg>,

    /// Client-facing request endpoints to register with.
    pub endpoints: ApiEndpoints,

    /// Client reply channels.
    pub registry: ClientRegistry,

    /// Control requests from the cluster manager.
    pub rx_ctrl: mpsc::UnboundedReceiver<CtrlRequest>,

    /// Credential checker for requesters.
    pub verifier: Arc<dyn IdentityVerifier>,

    /// Shared group routing table, updated when a reconfiguration commits.
    pub routing: Arc<RwLock<RoutingTable>>,
}

/// Replica trait to be implement by all protocol-specific server structs.
#[async_trait]
pub trait GenericReplica {
    /// Peer-peer message type of the protocol.
    type Msg;

    /// Creates a new replica module and sets up required functionality
    /// modules according to protocol-specific logic.
    async fn new_and_setup(
        setup: ReplicaSetup<Self::Msg>,
    ) -> Result<Self, GuidStoreError>
    where
        Self: Sized;

    /// Main event loop logic of running this replica. Returns `Ok(true)` if
    /// the replica should be restarted by its host, `Ok(false)` on clean
    /// termination.
    async fn run(&mut self) -> Result<bool, GuidStoreError>;

    /// Which replica this is.
    fn tag(&self) -> ReplicaTag;
}

//! GuidStore: a replicated store of GUID-keyed records with field-level
//! access control. Records are partitioned over consensus groups, each run
//! as an independent MultiPaxos instance.

#[macro_use]
mod utils;

pub mod client;
pub mod manager;
pub mod protocols;
pub mod server;

pub use utils::{logger_init, Bitmap, GuidStoreError, Timer};

pub use client::{
    ClientConfigCoordinator, ClientContext, ClientRequest, RoutingTable,
};
pub use manager::{ClusterConfig, GroupSpec, LocalCluster};
pub use protocols::{PaxosReplica, ReplicaConfigMultiPaxos};
pub use server::{
    AccessType, Accessor, CommandResult, Consistency, GroupId, Guid,
    Operation, ReplicaId, ReplicaTag, Status,
};

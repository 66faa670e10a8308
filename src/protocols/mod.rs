//! GuidStore's replication protocol.

mod multipaxos;

pub use multipaxos::{Ballot, Envelope, PaxosReplica, ReplicaConfigMultiPaxos};

//! GuidStore's server functionality modules and trait.

mod acl;
mod control;
mod external;
mod identity;
mod records;
mod replica;
mod slotlog;
mod statemach;
mod storage;
mod transport;

pub use acl::{
    authorize, authorize_owner, AccessType, Accessor, Authorization, FieldAcl,
    ENTIRE_RECORD,
};
pub use control::{CtrlHandle, CtrlMsg, CtrlReply, CtrlRequest, ReplicaInfo};
pub use external::{
    ApiEndpoints, ApiReply, ApiRequest, ClientId, ClientRegistry, Consistency,
    ReplyReceiver, ReqBatch, RequestId,
};
pub use identity::{AcceptAll, IdentityVerifier, TokenVerifier};
pub use records::{
    Command, CommandResult, Guid, Operation, Record, RecordStore, Status,
};
pub use replica::{
    Epoch, GenericReplica, GroupId, ReplicaId, ReplicaSetup, ReplicaTag,
    INITIAL_EPOCH,
};
pub use slotlog::{LogSlot, SlotLog};
pub use transport::{LinkFaults, Network};

pub(crate) use control::ControlHub;
pub(crate) use external::ExternalApi;
pub(crate) use statemach::{ExecAction, ExecResult, StateMachine};
pub(crate) use storage::{LogAction, LogActionId, LogResult, StorageHub};
pub(crate) use transport::TransportHub;

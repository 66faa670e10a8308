//! GuidStore's client functionality modules.

mod coordinator;
mod routing;

pub use coordinator::{ClientConfigCoordinator, ClientContext, ClientRequest};
pub use routing::RoutingTable;

//! GuidStore server external API module implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::server::transport::LinkFaults;
use crate::server::{Command, CommandResult, ReplicaId, ReplicaTag};
use crate::utils::GuidStoreError;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// Client ID type.
pub type ClientId = u64;

/// External API request ID type.
pub type RequestId = u64;

/// Consistency mode a client asks for.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize,
)]
pub enum Consistency {
    /// Ordered through consensus at the group leader.
    #[default]
    Coordinated,

    /// Reads served from any replica's locally applied state.
    BestEffort,
}

/// Request received from client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    /// Client request ID, reused across retries of the same request.
    pub id: RequestId,

    /// Command to be replicated and executed.
    pub cmd: Command,

    pub consistency: Consistency,

    /// Optional proof of the requester's identity.
    pub proof: Option<Bytes>,
}

/// Reply back to client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ApiReply {
    /// ID of the corresponding client request.
    pub id: RequestId,

    /// Command result, or `None` if not handled here.
    pub result: Option<CommandResult>,

    /// Set if the service wants me to talk to a specific server.
    pub redirect: Option<ReplicaId>,
}

impl ApiReply {
    /// Reply telling the client to come back later.
    pub fn retry_later(id: RequestId) -> Self {
        ApiReply {
            id,
            result: None,
            redirect: None,
        }
    }

    pub fn redirect(id: RequestId, to: ReplicaId) -> Self {
        ApiReply {
            id,
            result: None,
            redirect: Some(to),
        }
    }

    pub fn result(id: RequestId, result: CommandResult) -> Self {
        ApiReply {
            id,
            result: Some(result),
            redirect: None,
        }
    }
}

/// A batch of client requests, in arrival order.
pub type ReqBatch = Vec<(ClientId, ApiRequest)>;

/// Reply channel sender of one client, tagged with the replying replica.
pub type ReplySender = mpsc::UnboundedSender<(ReplicaTag, ApiReply)>;

/// Reply channel receiver of one client.
pub type ReplyReceiver = mpsc::UnboundedReceiver<(ReplicaTag, ApiReply)>;

/// Map from client ID -> its reply channel, shared by every replica of the
/// cluster. Readers never block on writers.
pub struct ClientRegistry {
    tx_replies_write: Arc<Mutex<flashmap::WriteHandle<ClientId, ReplySender>>>,
    tx_replies_read: flashmap::ReadHandle<ClientId, ReplySender>,
}

impl Clone for ClientRegistry {
    fn clone(&self) -> Self {
        ClientRegistry {
            tx_replies_write: self.tx_replies_write.clone(),
            tx_replies_read: self.tx_replies_read.clone(),
        }
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        let (tx_replies_write, tx_replies_read) =
            flashmap::new::<ClientId, ReplySender>();
        ClientRegistry {
            tx_replies_write: Arc::new(Mutex::new(tx_replies_write)),
            tx_replies_read,
        }
    }

    /// Registers a new client, returning the receiver side of its reply
    /// channel. A client ID whose previous holder has left is reused.
    pub fn register(
        &self,
        client: ClientId,
    ) -> Result<ReplyReceiver, GuidStoreError> {
        let mut tx_replies = self.tx_replies_write.lock()?;
        let mut tx_replies_guard = tx_replies.guard();
        if let Some(sender) = tx_replies_guard.get(&client) {
            if !sender.is_closed() {
                return Err(GuidStoreError::msg(format!(
                    "duplicate client ID {}",
                    client
                )));
            }
            tx_replies_guard.remove(client);
        }
        let (tx_reply, rx_reply) = mpsc::unbounded_channel();
        tx_replies_guard.insert(client, tx_reply);
        tx_replies_guard.publish();
        Ok(rx_reply)
    }

    pub fn deregister(&self, client: ClientId) -> Result<(), GuidStoreError> {
        let mut tx_replies = self.tx_replies_write.lock()?;
        let mut tx_replies_guard = tx_replies.guard();
        tx_replies_guard.remove(client);
        tx_replies_guard.publish();
        Ok(())
    }

    pub fn contains(&self, client: ClientId) -> bool {
        self.tx_replies_read.guard().contains_key(&client)
    }

    /// Hands a reply to the client's channel. Returns false if the client is
    /// unknown or gone.
    fn deliver(
        &self,
        client: ClientId,
        from: ReplicaTag,
        reply: ApiReply,
    ) -> bool {
        match self.tx_replies_read.guard().get(&client) {
            Some(tx_reply) => tx_reply.send((from, reply)).is_ok(),
            None => false,
        }
    }
}

/// Request channel sender of one replica.
type ReqSender = mpsc::UnboundedSender<(ClientId, ApiRequest)>;

/// Client-facing inboxes of every replica, keyed by replica tag.
pub struct ApiEndpoints {
    inboxes: Arc<RwLock<HashMap<ReplicaTag, ReqSender>>>,
    faults: Arc<RwLock<LinkFaults>>,
}

impl Clone for ApiEndpoints {
    fn clone(&self) -> Self {
        ApiEndpoints {
            inboxes: self.inboxes.clone(),
            faults: self.faults.clone(),
        }
    }
}

impl ApiEndpoints {
    /// Creates an endpoint table obeying the given fault state.
    pub fn new(faults: Arc<RwLock<LinkFaults>>) -> Self {
        ApiEndpoints {
            inboxes: Arc::new(RwLock::new(HashMap::new())),
            faults,
        }
    }

    fn register(
        &self,
        tag: ReplicaTag,
    ) -> Result<mpsc::UnboundedReceiver<(ClientId, ApiRequest)>, GuidStoreError>
    {
        let (tx_req, rx_req) = mpsc::unbounded_channel();
        self.inboxes.write()?.insert(tag, tx_req);
        Ok(rx_req)
    }

    /// Sends a request to replica `tag`. Returns false if it cannot be
    /// delivered right now.
    pub fn send(
        &self,
        tag: ReplicaTag,
        client: ClientId,
        req: ApiRequest,
    ) -> Result<bool, GuidStoreError> {
        if self.is_down(tag.node)? {
            return Ok(false);
        }
        match self.inboxes.read()?.get(&tag) {
            Some(tx_req) => Ok(tx_req.send((client, req)).is_ok()),
            None => Ok(false),
        }
    }

    pub fn is_down(&self, node: ReplicaId) -> Result<bool, GuidStoreError> {
        Ok(self.faults.read()?.is_down(node))
    }
}

/// The external client-facing API module of one replica.
pub struct ExternalApi {
    /// My replica tag.
    me: ReplicaTag,

    /// Receiver side of the req channel.
    rx_req: mpsc::UnboundedReceiver<(ClientId, ApiRequest)>,

    /// Shared client reply channels.
    registry: ClientRegistry,

    /// Shared endpoint table, consulted for my own reachability.
    endpoints: ApiEndpoints,

    /// Maximum number of requests taken per batch.
    max_batch_size: usize,
}

// ExternalApi public API implementation
impl ExternalApi {
    /// Creates a new external API module, registering my request inbox.
    pub fn new_and_setup(
        me: ReplicaTag,
        endpoints: ApiEndpoints,
        registry: ClientRegistry,
        max_batch_size: usize,
    ) -> Result<Self, GuidStoreError> {
        if max_batch_size == 0 {
            return logged_err!(me; "invalid max_batch_size {}", max_batch_size);
        }
        let rx_req = endpoints.register(me)?;
        Ok(ExternalApi {
            me,
            rx_req,
            registry,
            endpoints,
            max_batch_size,
        })
    }

    /// Returns whether a client ID is connected.
    pub fn has_client(&self, client: ClientId) -> bool {
        self.registry.contains(client)
    }

    /// Waits for at least one request and collects whatever else is
    /// currently queued, up to the batch size. Returns a non-empty batch.
    /// Cancellation safe.
    pub async fn get_req_batch(&mut self) -> Result<ReqBatch, GuidStoreError> {
        let mut batch = match self.rx_req.recv().await {
            Some(first) => vec![first],
            None => return logged_err!(self.me; "req channel has been closed"),
        };
        while batch.len() < self.max_batch_size {
            match self.rx_req.try_recv() {
                Ok(req) => batch.push(req),
                Err(TryRecvError::Empty) => break,
                Err(e) => return Err(GuidStoreError::msg(e.to_string())),
            }
        }
        Ok(batch)
    }

    /// Sends a reply back to client. Replies from an unreachable node and
    /// replies to departed clients are dropped.
    pub fn send_reply(
        &mut self,
        reply: ApiReply,
        client: ClientId,
    ) -> Result<(), GuidStoreError> {
        if self.endpoints.is_down(self.me.node)? {
            return Ok(());
        }
        if !self.registry.deliver(client, self.me, reply) {
            pf_debug!(self.me; "client {} not found among active clients",
                              client);
        }
        Ok(())
    }
}

//! Request coordinator: routes each request to the group owning its key,
//! follows leader redirects, and retries with backoff.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::client::RoutingTable;
use crate::server::{
    ApiEndpoints, ApiReply, ApiRequest, ClientId, ClientRegistry, Command,
    CommandResult, Consistency, Epoch, GroupId, Guid, Operation, ReplicaId,
    ReplicaTag, ReplyReceiver, RequestId, Status, ENTIRE_RECORD,
};
use crate::utils::GuidStoreError;

use bytes::Bytes;

use serde::Deserialize;

use tokio::time::{self, Duration, Instant};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfigCoordinator {
    /// How long to wait for a reply to one attempt in millisecs.
    pub attempt_timeout_ms: u64,

    /// Attempts made before giving up on a request.
    pub max_retries: usize,

    /// Backoff after the first failed attempt in millisecs; doubles after
    /// every further one.
    pub backoff_min_ms: u64,

    /// Backoff cap in millisecs.
    pub backoff_max_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ClientConfigCoordinator {
    fn default() -> Self {
        ClientConfigCoordinator {
            attempt_timeout_ms: 800,
            max_retries: 12,
            backoff_min_ms: 20,
            backoff_max_ms: 640,
        }
    }
}

/// One client operation on one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    pub key: Guid,
    pub requester: Guid,
    pub op: Operation,
    pub consistency: Consistency,
    pub proof: Option<Bytes>,
}

impl ClientRequest {
    /// A coordinated request by `requester` on record `key`.
    pub fn new(
        key: impl Into<Guid>,
        requester: impl Into<Guid>,
        op: Operation,
    ) -> Self {
        ClientRequest {
            key: key.into(),
            requester: requester.into(),
            op,
            consistency: Consistency::Coordinated,
            proof: None,
        }
    }

    /// Asks for the best-effort path. Only reads take it.
    pub fn best_effort(mut self) -> Self {
        self.consistency = Consistency::BestEffort;
        self
    }

    pub fn with_proof(mut self, proof: Bytes) -> Self {
        self.proof = Some(proof);
        self
    }
}

/// Outcome of waiting on one attempt.
enum Attempt {
    Done(CommandResult),
    Redirect(ReplicaId),
    RetryLater,
    NoReply,
}

/// Client-side context, created once and passed along to every operation.
/// Caches the believed leader of each group.
pub struct ClientContext {
    /// My client ID.
    id: ClientId,

    /// Configuration parameters struct.
    config: ClientConfigCoordinator,

    /// Shared group routing table.
    routing: Arc<RwLock<RoutingTable>>,

    /// Replica request inboxes.
    endpoints: ApiEndpoints,

    /// Receiver side of my reply channel.
    rx_reply: ReplyReceiver,

    /// Believed leader per group.
    leaders: HashMap<GroupId, ReplicaId>,

    /// Next request ID to use.
    next_req: RequestId,
}

impl ClientContext {
    /// Creates a client context, registering my reply channel.
    pub fn new_and_setup(
        id: ClientId,
        routing: Arc<RwLock<RoutingTable>>,
        endpoints: ApiEndpoints,
        registry: &ClientRegistry,
        config_str: Option<&str>,
    ) -> Result<Self, GuidStoreError> {
        let config = parsed_config!(config_str => ClientConfigCoordinator;
                                    attempt_timeout_ms, max_retries,
                                    backoff_min_ms, backoff_max_ms)?;
        if config.attempt_timeout_ms == 0 {
            return logged_err!(
                id;
                "invalid config.attempt_timeout_ms '{}'",
                config.attempt_timeout_ms
            );
        }
        if config.max_retries == 0 {
            return logged_err!(
                id;
                "invalid config.max_retries '{}'",
                config.max_retries
            );
        }
        if config.backoff_max_ms < config.backoff_min_ms {
            return logged_err!(
                id;
                "invalid config.backoff_max_ms '{}'",
                config.backoff_max_ms
            );
        }

        let rx_reply = registry.register(id)?;
        Ok(ClientContext {
            id,
            config,
            routing,
            endpoints,
            rx_reply,
            leaders: HashMap::new(),
            next_req: 0,
        })
    }

    #[inline]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Believed leader of `group`, if any.
    pub fn cached_leader(&self, group: GroupId) -> Option<ReplicaId> {
        self.leaders.get(&group).copied()
    }

    /// Runs a request to completion. Surfaces `ConsensusTimeout` if replicas
    /// answered but nothing decided within the retry budget, and
    /// `GroupUnavailable` if no replica of the group answered at all.
    pub async fn execute(
        &mut self,
        req: ClientRequest,
    ) -> Result<CommandResult, GuidStoreError> {
        let group = self.routing.read()?.locate(&req.key)?;
        let best_effort = req.consistency == Consistency::BestEffort
            && matches!(req.op, Operation::Read { .. });
        let consistency = if best_effort {
            Consistency::BestEffort
        } else {
            Consistency::Coordinated
        };
        let api_req = ApiRequest {
            id: self.new_req_id(),
            cmd: Command::Record {
                key: req.key,
                requester: req.requester,
                op: req.op,
            },
            consistency,
            proof: req.proof,
        };

        if best_effort {
            self.execute_best_effort(group, api_req).await
        } else {
            self.execute_coordinated(group, api_req).await
        }
    }

    /// Like `execute`, but folds surfaced errors into a `Timeout` status.
    pub async fn submit(&mut self, req: ClientRequest) -> CommandResult {
        match self.execute(req).await {
            Ok(result) => result,
            Err(e) => {
                pf_warn!(self.id; "request failed: {}", e);
                CommandResult::status(Status::Timeout, 0)
            }
        }
    }

    /// Reads `field` of record `key` as `requester`. A refusal surfaces as
    /// `AclDenied` and a missing record as `RecordNotFound`.
    pub async fn read_field(
        &mut self,
        key: &str,
        requester: &str,
        field: &str,
    ) -> Result<Bytes, GuidStoreError> {
        let op = Operation::Read {
            field: field.into(),
        };
        let req = ClientRequest::new(key, requester, op);
        let result = self.execute(req).await?;
        Self::surface(result, key, requester, field)?
            .value
            .ok_or_else(|| GuidStoreError::msg("read returned no value"))
    }

    /// Reads every field of record `key` that `requester` may read.
    pub async fn read_record(
        &mut self,
        key: &str,
        requester: &str,
    ) -> Result<BTreeMap<String, Bytes>, GuidStoreError> {
        let value = self.read_field(key, requester, ENTIRE_RECORD).await?;
        Ok(rmp_serde::from_slice(&value)?)
    }

    /// Upserts `field` of record `key`, returning the record's new version.
    pub async fn write_field(
        &mut self,
        key: &str,
        requester: &str,
        field: &str,
        value: Bytes,
    ) -> Result<u64, GuidStoreError> {
        let op = Operation::Write {
            field: field.into(),
            value,
        };
        let req = ClientRequest::new(key, requester, op);
        let result = self.execute(req).await?;
        Ok(Self::surface(result, key, requester, field)?.version)
    }

    /// Maps a refused result onto the error kind callers act upon.
    fn surface(
        result: CommandResult,
        key: &str,
        requester: &str,
        field: &str,
    ) -> Result<CommandResult, GuidStoreError> {
        match result.status {
            Status::Ok | Status::Stale => Ok(result),
            Status::Denied => Err(GuidStoreError::AclDenied {
                accessor: requester.into(),
                field: field.into(),
            }),
            Status::NotFound if result.version == 0 => {
                Err(GuidStoreError::RecordNotFound(key.into()))
            }
            status => Err(GuidStoreError::msg(format!(
                "{:?} on field '{}' of '{}'",
                status, field, key
            ))),
        }
    }

    /// Changes the membership of `group`, returning the epoch it enters.
    pub async fn reconfigure(
        &mut self,
        group: GroupId,
        members: Vec<ReplicaId>,
    ) -> Result<Epoch, GuidStoreError> {
        let api_req = ApiRequest {
            id: self.new_req_id(),
            cmd: Command::Reconfigure {
                members: members.clone(),
            },
            consistency: Consistency::Coordinated,
            proof: None,
        };
        let result = self.execute_coordinated(group, api_req).await?;
        if !result.is_ok() {
            return Err(GuidStoreError::msg(format!(
                "reconfiguration of group {} refused: {:?}",
                group, result.status
            )));
        }

        let epoch = result.version;
        self.routing.write()?.update_membership(group, epoch, members);
        pf_info!(self.id; "group {} reconfigured into epoch {}", group, epoch);
        Ok(epoch)
    }

    fn new_req_id(&mut self) -> RequestId {
        let id = self.next_req;
        self.next_req += 1;
        id
    }

    fn group_members(
        &self,
        group: GroupId,
    ) -> Result<Vec<ReplicaId>, GuidStoreError> {
        match self.routing.read()?.members(group) {
            Some(members) if !members.is_empty() => Ok(members.to_vec()),
            _ => Err(GuidStoreError::GroupUnavailable(group)),
        }
    }

    /// Member after `node` in `members`, wrapping around.
    fn next_member(members: &[ReplicaId], node: ReplicaId) -> ReplicaId {
        let pos = members
            .iter()
            .position(|&m| m == node)
            .map_or(0, |p| p + 1);
        members[pos % members.len()]
    }

    /// Sleeps for the backoff of the `failures`-th consecutive failure.
    async fn backoff(&self, failures: u32) {
        let factor = 1u64 << failures.min(16);
        let ms = self
            .config
            .backoff_min_ms
            .saturating_mul(factor)
            .min(self.config.backoff_max_ms);
        time::sleep(Duration::from_millis(ms)).await;
    }

    /// Sends one attempt to `target` and waits for its outcome. Replies to
    /// earlier requests are discarded.
    async fn attempt(
        &mut self,
        group: GroupId,
        target: ReplicaId,
        req: &ApiRequest,
    ) -> Result<Attempt, GuidStoreError> {
        let tag = ReplicaTag::new(group, target);
        if !self.endpoints.send(tag, self.id, req.clone())? {
            pf_debug!(self.id; "replica {} unreachable", tag);
            return Ok(Attempt::NoReply);
        }

        let deadline = Instant::now()
            + Duration::from_millis(self.config.attempt_timeout_ms);
        loop {
            let recv = time::timeout_at(deadline, self.rx_reply.recv());
            let reply = match recv.await {
                Ok(Some(reply)) => reply,
                Ok(None) => return logged_err!(self.id; "reply channel closed"),
                Err(_) => return Ok(Attempt::NoReply),
            };
            let (from, ApiReply { id, result, redirect }) = reply;
            if id != req.id || from.group != group {
                continue; // late reply to something else
            }
            return Ok(match (result, redirect) {
                (Some(result), _) => Attempt::Done(result),
                (None, Some(to)) => Attempt::Redirect(to),
                (None, None) => Attempt::RetryLater,
            });
        }
    }

    /// Coordinated path: talk to the believed leader, following redirects.
    async fn execute_coordinated(
        &mut self,
        group: GroupId,
        req: ApiRequest,
    ) -> Result<CommandResult, GuidStoreError> {
        let mut members = self.group_members(group)?;
        let mut target = self.cached_leader(group).unwrap_or(members[0]);
        let mut heard_any = false;
        let mut failures = 0;

        for _ in 0..self.config.max_retries {
            match self.attempt(group, target, &req).await? {
                Attempt::Done(result) => {
                    self.leaders.insert(group, target);
                    return Ok(result);
                }
                Attempt::Redirect(to) => {
                    heard_any = true;
                    pf_trace!(self.id; "redirected {} -> {} for group {}",
                                       target, to, group);
                    self.leaders.insert(group, to);
                    if to == target {
                        failures += 1;
                        self.backoff(failures).await;
                    }
                    target = to;
                }
                Attempt::RetryLater => {
                    // no leader known there, or leader busy reconfiguring
                    heard_any = true;
                    if self.cached_leader(group) != Some(target) {
                        target = Self::next_member(&members, target);
                    }
                    failures += 1;
                    self.backoff(failures).await;
                }
                Attempt::NoReply => {
                    self.leaders.remove(&group);
                    members = self.group_members(group)?;
                    target = Self::next_member(&members, target);
                    failures += 1;
                    self.backoff(failures).await;
                }
            }
        }

        if heard_any {
            Err(GuidStoreError::ConsensusTimeout {
                group,
                attempts: self.config.max_retries,
            })
        } else {
            Err(GuidStoreError::GroupUnavailable(group))
        }
    }

    /// Best-effort path: any replica answers from its applied state,
    /// starting from one picked by my client ID.
    async fn execute_best_effort(
        &mut self,
        group: GroupId,
        req: ApiRequest,
    ) -> Result<CommandResult, GuidStoreError> {
        let members = self.group_members(group)?;
        let start = (self.id as usize) % members.len();
        let mut heard_any = false;

        for round in 0..self.config.max_retries {
            let target = members[(start + round) % members.len()];
            match self.attempt(group, target, &req).await? {
                Attempt::Done(result) => return Ok(result),
                Attempt::Redirect(_) | Attempt::RetryLater => heard_any = true,
                Attempt::NoReply => {}
            }
            if (round + 1) % members.len() == 0 {
                self.backoff((round / members.len()) as u32).await;
            }
        }

        if heard_any {
            Err(GuidStoreError::ConsensusTimeout {
                group,
                attempts: self.config.max_retries,
            })
        } else {
            Err(GuidStoreError::GroupUnavailable(group))
        }
    }
}

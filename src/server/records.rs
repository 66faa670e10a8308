//! GuidStore record store: the replicated state every group applies decided
//! commands to.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::server::acl::{self, AccessType, Accessor, FieldAcl};
use crate::server::{
    ApiRequest, Authorization, ClientId, Epoch, ReplicaId, RequestId,
    ENTIRE_RECORD,
};
use crate::utils::GuidStoreError;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// Globally unique identity naming a record and its owner.
pub type Guid = String;

/// Number of recently executed requests remembered per client.
const DEDUP_WINDOW: usize = 128;

/// One GUID record. Owned by the consensus group covering its key and only
/// mutated through decided commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Owning identity; always has full access.
    pub guid: Guid,

    /// Field name -> value, ordered by name.
    pub fields: BTreeMap<String, Bytes>,

    /// Field name (or `+ALL+`) -> access lists.
    pub acl: BTreeMap<String, FieldAcl>,

    /// Record-local named groups usable as ACL entries.
    pub groups: BTreeMap<String, BTreeSet<Guid>>,

    /// Bumped on every mutation.
    pub version: u64,
}

impl Record {
    pub fn new(guid: Guid) -> Self {
        Record {
            guid,
            fields: BTreeMap::new(),
            acl: BTreeMap::new(),
            groups: BTreeMap::new(),
            version: 1,
        }
    }
}

/// Operation on a single record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Create the record keyed by the requester's own GUID.
    CreateRecord,

    /// Delete the whole record.
    RemoveRecord,

    Read {
        field: String,
    },

    /// Upsert a field value.
    Write {
        field: String,
        value: Bytes,
    },

    /// Create a field that must not exist yet.
    CreateField {
        field: String,
        value: Bytes,
    },

    RemoveField {
        field: String,
    },

    AddAcl {
        field: String,
        access: AccessType,
        accessor: Accessor,
    },

    RemoveAcl {
        field: String,
        access: AccessType,
        accessor: Accessor,
    },

    AddGroupMember {
        group: String,
        member: Guid,
    },

    RemoveGroupMember {
        group: String,
        member: Guid,
    },
}

impl Operation {
    /// Field targeted and access needed for field-level operations; `None`
    /// for operations reserved to the record owner.
    fn field_access(&self) -> Option<(&str, AccessType)> {
        match self {
            Operation::Read { field } => Some((field, AccessType::Read)),
            Operation::Write { field, .. }
            | Operation::CreateField { field, .. }
            | Operation::RemoveField { field } => {
                Some((field, AccessType::Write))
            }
            _ => None,
        }
    }

    /// Whether the operation may change the record.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Operation::Read { .. })
    }
}

/// Command replicated through consensus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Operation on the record keyed `key`, issued by `requester`.
    Record {
        key: Guid,
        requester: Guid,
        op: Operation,
    },

    /// Stop the current membership and continue with `members`.
    Reconfigure { members: Vec<ReplicaId> },
}

impl Command {
    #[inline]
    pub fn is_reconfigure(&self) -> bool {
        matches!(self, Command::Reconfigure { .. })
    }

    /// Whether this command only reads a field.
    #[inline]
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Command::Record {
                op: Operation::Read { .. },
                ..
            }
        )
    }
}

/// Response status of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Denied,
    NotFound,
    Timeout,
    Stale,
    Conflict,
}

/// Command execution result returned by the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: Status,
    pub value: Option<Bytes>,
    pub version: u64,
}

impl CommandResult {
    #[inline]
    pub fn status(status: Status, version: u64) -> Self {
        CommandResult {
            status,
            value: None,
            version,
        }
    }

    #[inline]
    pub fn ok(version: u64) -> Self {
        Self::status(Status::Ok, version)
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Replicated state of one consensus group: its records, the membership
/// derived from applied reconfigurations, and the per-client window of
/// recent results used to execute retried requests at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordStore {
    records: BTreeMap<Guid, Record>,

    recent: BTreeMap<ClientId, VecDeque<(RequestId, CommandResult)>>,

    /// Next slot to be applied.
    next_slot: usize,

    epoch: Epoch,

    members: Vec<ReplicaId>,
}

impl RecordStore {
    /// Creates an empty store for a group starting with `members`.
    pub fn new(epoch: Epoch, members: Vec<ReplicaId>) -> Self {
        RecordStore {
            records: BTreeMap::new(),
            recent: BTreeMap::new(),
            next_slot: 0,
            epoch,
            members,
        }
    }

    #[inline]
    pub fn next_slot(&self) -> usize {
        self.next_slot
    }

    #[inline]
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    #[inline]
    pub fn members(&self) -> &[ReplicaId] {
        &self.members
    }

    #[inline]
    pub fn get(&self, guid: &str) -> Option<&Record> {
        self.records.get(guid)
    }

    #[inline]
    pub fn num_records(&self) -> usize {
        self.records.len()
    }

    /// Applies the request batch decided at `slot`. Returns `Ok(None)` if the
    /// slot was applied before, and a `SlotGap` error if earlier slots are
    /// still missing.
    pub fn apply_slot(
        &mut self,
        slot: usize,
        reqs: &[(ClientId, ApiRequest)],
    ) -> Result<Option<Vec<CommandResult>>, GuidStoreError> {
        if slot < self.next_slot {
            return Ok(None);
        }
        if slot > self.next_slot {
            return Err(GuidStoreError::SlotGap {
                expected: self.next_slot,
                got: slot,
            });
        }

        let results = reqs
            .iter()
            .map(|(client, req)| self.apply_request(*client, req))
            .collect();
        self.next_slot += 1;
        Ok(Some(results))
    }

    /// Applies one request, at most once per `(client, request ID)`.
    fn apply_request(
        &mut self,
        client: ClientId,
        req: &ApiRequest,
    ) -> CommandResult {
        if let Some(result) = self.recent_result(client, req.id) {
            return result;
        }

        let result = self.execute(&req.cmd);
        let window = self.recent.entry(client).or_default();
        window.push_back((req.id, result.clone()));
        if window.len() > DEDUP_WINDOW {
            window.pop_front();
        }
        result
    }

    /// Result of a request already executed, if still remembered.
    pub fn recent_result(
        &self,
        client: ClientId,
        id: RequestId,
    ) -> Option<CommandResult> {
        self.recent.get(&client).and_then(|window| {
            window
                .iter()
                .find(|(rid, _)| *rid == id)
                .map(|(_, result)| result.clone())
        })
    }

    /// Executes a command against the store.
    fn execute(&mut self, cmd: &Command) -> CommandResult {
        match cmd {
            Command::Reconfigure { members } => {
                if members.is_empty() {
                    return CommandResult::status(
                        Status::Conflict,
                        self.epoch,
                    );
                }
                self.epoch += 1;
                self.members.clone_from(members);
                CommandResult::ok(self.epoch)
            }
            Command::Record { key, requester, op } => {
                self.execute_op(key, requester, op)
            }
        }
    }

    fn execute_op(
        &mut self,
        key: &str,
        requester: &str,
        op: &Operation,
    ) -> CommandResult {
        if let Operation::CreateRecord = op {
            if requester != key {
                return CommandResult::status(Status::Denied, 0);
            }
            if let Some(record) = self.records.get(key) {
                return CommandResult::status(
                    Status::Conflict,
                    record.version,
                );
            }
            self.records.insert(key.into(), Record::new(key.into()));
            return CommandResult::ok(1);
        }

        let record = match self.records.get_mut(key) {
            Some(record) => record,
            None => return CommandResult::status(Status::NotFound, 0),
        };
        // reads filter per field
        if op.is_mutation()
            && Self::authorize_op(requester, record, op) == Authorization::Deny
        {
            return CommandResult::status(Status::Denied, record.version);
        }

        match op {
            Operation::CreateRecord => {
                CommandResult::status(Status::Conflict, record.version)
            }

            Operation::RemoveRecord => {
                let version = record.version + 1;
                self.records.remove(key);
                CommandResult::ok(version)
            }

            Operation::Read { field } => {
                Self::read_field(record, requester, field)
            }

            Operation::Write { field, value } => {
                if field == ENTIRE_RECORD {
                    return CommandResult::status(
                        Status::Conflict,
                        record.version,
                    );
                }
                record.fields.insert(field.clone(), value.clone());
                record.version += 1;
                CommandResult::ok(record.version)
            }

            Operation::CreateField { field, value } => {
                if field == ENTIRE_RECORD || record.fields.contains_key(field)
                {
                    return CommandResult::status(
                        Status::Conflict,
                        record.version,
                    );
                }
                record.fields.insert(field.clone(), value.clone());
                record.version += 1;
                CommandResult::ok(record.version)
            }

            Operation::RemoveField { field } => {
                if record.fields.remove(field).is_none() {
                    return CommandResult::status(
                        Status::NotFound,
                        record.version,
                    );
                }
                record.version += 1;
                CommandResult::ok(record.version)
            }

            Operation::AddAcl {
                field,
                access,
                accessor,
            } => {
                record
                    .acl
                    .entry(field.clone())
                    .or_default()
                    .list_mut(*access)
                    .insert(accessor.clone());
                record.version += 1;
                CommandResult::ok(record.version)
            }

            Operation::RemoveAcl {
                field,
                access,
                accessor,
            } => {
                let removed = match record.acl.get_mut(field) {
                    Some(acl) => {
                        let removed = acl.list_mut(*access).remove(accessor);
                        if acl.is_empty() {
                            record.acl.remove(field);
                        }
                        removed
                    }
                    None => false,
                };
                if !removed {
                    return CommandResult::status(
                        Status::NotFound,
                        record.version,
                    );
                }
                record.version += 1;
                CommandResult::ok(record.version)
            }

            Operation::AddGroupMember { group, member } => {
                record
                    .groups
                    .entry(group.clone())
                    .or_default()
                    .insert(member.clone());
                record.version += 1;
                CommandResult::ok(record.version)
            }

            Operation::RemoveGroupMember { group, member } => {
                let removed = match record.groups.get_mut(group) {
                    Some(members) => {
                        let removed = members.remove(member);
                        if members.is_empty() {
                            record.groups.remove(group);
                        }
                        removed
                    }
                    None => false,
                };
                if !removed {
                    return CommandResult::status(
                        Status::NotFound,
                        record.version,
                    );
                }
                record.version += 1;
                CommandResult::ok(record.version)
            }
        }
    }

    /// Access check for one operation on an existing record.
    fn authorize_op(
        requester: &str,
        record: &Record,
        op: &Operation,
    ) -> Authorization {
        match op.field_access() {
            Some((field, access)) => {
                acl::authorize(requester, record, field, access)
            }
            None => acl::authorize_owner(requester, record),
        }
    }

    /// Reads `field` of `record` on behalf of `requester`. A stored field is
    /// returned as is. Otherwise the subtree under `field` (every field for
    /// the entire-record name) comes back as a MessagePack map holding only
    /// the fields `requester` may read.
    fn read_field(
        record: &Record,
        requester: &str,
        field: &str,
    ) -> CommandResult {
        let version = record.version;
        let readable = |name: &str| {
            acl::authorize(requester, record, name, AccessType::Read)
                .is_allowed()
        };

        if field != ENTIRE_RECORD {
            if let Some(value) = record.fields.get(field) {
                if !readable(field) {
                    return CommandResult::status(Status::Denied, version);
                }
                return CommandResult {
                    status: Status::Ok,
                    value: Some(value.clone()),
                    version,
                };
            }
        }

        let subtree: Vec<(&String, &Bytes)> = record
            .fields
            .iter()
            .filter(|(name, _)| in_subtree(field, name))
            .collect();
        if subtree.is_empty() {
            let status = if readable(field) {
                Status::NotFound
            } else {
                Status::Denied
            };
            return CommandResult::status(status, version);
        }

        let values: BTreeMap<&String, &Bytes> = subtree
            .into_iter()
            .filter(|(name, _)| readable(name))
            .collect();
        if values.is_empty() {
            return CommandResult::status(Status::Denied, version);
        }
        match rmp_serde::to_vec(&values) {
            Ok(buf) => CommandResult {
                status: Status::Ok,
                value: Some(Bytes::from(buf)),
                version,
            },
            Err(_) => CommandResult::status(Status::Conflict, version),
        }
    }

    /// Serves a read from locally applied state without going through
    /// consensus.
    pub fn inspect(
        &self,
        key: &str,
        requester: &str,
        field: &str,
    ) -> CommandResult {
        match self.records.get(key) {
            Some(record) => Self::read_field(record, requester, field),
            None => CommandResult::status(Status::NotFound, 0),
        }
    }

    /// Checks against current state whether a request would be denied. Only
    /// a definite denial counts; a request already executed for `client` is
    /// let through so that a retry gets its remembered result, and anything
    /// that depends on not-yet-applied state is decided at apply time.
    pub fn precheck(
        &self,
        client: ClientId,
        req: &ApiRequest,
    ) -> Authorization {
        if self.recent_result(client, req.id).is_some() {
            return Authorization::Allow;
        }
        match &req.cmd {
            Command::Reconfigure { .. } => Authorization::Allow,
            Command::Record { key, requester, op } => match op {
                Operation::CreateRecord => {
                    if requester == key {
                        Authorization::Allow
                    } else {
                        Authorization::Deny
                    }
                }
                _ => match self.records.get(key) {
                    Some(record) => match op {
                        Operation::Read { field } => {
                            if Self::read_field(record, requester, field)
                                .status
                                == Status::Denied
                            {
                                Authorization::Deny
                            } else {
                                Authorization::Allow
                            }
                        }
                        _ => Self::authorize_op(requester, record, op),
                    },
                    None => Authorization::Allow,
                },
            },
        }
    }
}

/// Whether field `name` sits under `root` in the dotted field hierarchy.
fn in_subtree(root: &str, name: &str) -> bool {
    root == ENTIRE_RECORD
        || name
            .strip_prefix(root)
            .map_or(false, |rest| rest.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Consistency;
    use rand::seq::SliceRandom;
    use rand::Rng;

    fn req(
        id: RequestId,
        key: &str,
        requester: &str,
        op: Operation,
    ) -> ApiRequest {
        ApiRequest {
            id,
            cmd: Command::Record {
                key: key.into(),
                requester: requester.into(),
                op,
            },
            consistency: Consistency::Coordinated,
            proof: None,
        }
    }

    fn write(field: &str, value: &'static str) -> Operation {
        Operation::Write {
            field: field.into(),
            value: Bytes::from_static(value.as_bytes()),
        }
    }

    fn read(field: &str) -> Operation {
        Operation::Read {
            field: field.into(),
        }
    }

    fn grant_read(field: &str, who: &str) -> Operation {
        Operation::AddAcl {
            field: field.into(),
            access: AccessType::Read,
            accessor: Accessor::Guid(who.into()),
        }
    }

    fn apply_one(
        store: &mut RecordStore,
        client: ClientId,
        req: ApiRequest,
    ) -> Result<CommandResult, GuidStoreError> {
        let slot = store.next_slot();
        let mut results = store
            .apply_slot(slot, &[(client, req)])?
            .ok_or_else(|| GuidStoreError::msg("slot replayed"))?;
        results.pop().ok_or_else(|| GuidStoreError::msg("no result"))
    }

    /// Applies `op` issued by the owner of record "alice".
    fn as_owner(
        store: &mut RecordStore,
        id: RequestId,
        op: Operation,
    ) -> Result<CommandResult, GuidStoreError> {
        apply_one(store, 1, req(id, "alice", "alice", op))
    }

    fn created(owner: &str) -> Result<RecordStore, GuidStoreError> {
        let mut store = RecordStore::new(1, vec![0]);
        let create = req(0, owner, owner, Operation::CreateRecord);
        apply_one(&mut store, 1, create)?;
        Ok(store)
    }

    fn decode_fields(
        result: &CommandResult,
    ) -> Result<BTreeMap<String, Bytes>, GuidStoreError> {
        let value = result
            .value
            .as_ref()
            .ok_or_else(|| GuidStoreError::msg("no value"))?;
        Ok(rmp_serde::from_slice(value)?)
    }

    #[test]
    fn create_write_read() -> Result<(), GuidStoreError> {
        let mut store = created("alice")?;
        let r = as_owner(&mut store, 1, write("email", "a@x"))?;
        assert_eq!(r, CommandResult::ok(2));
        let r = as_owner(&mut store, 2, read("email"))?;
        assert_eq!(r.status, Status::Ok);
        assert_eq!(r.value, Some(Bytes::from_static(b"a@x")));
        assert_eq!(r.version, 2);
        let r = as_owner(&mut store, 3, read("phone"))?;
        assert_eq!(r, CommandResult::status(Status::NotFound, 2));
        Ok(())
    }

    #[test]
    fn create_record_rules() -> Result<(), GuidStoreError> {
        let mut store = RecordStore::new(1, vec![0]);
        let create = |id, requester| {
            req(id, "alice", requester, Operation::CreateRecord)
        };
        let r = apply_one(&mut store, 1, create(0, "mallory"))?;
        assert_eq!(r.status, Status::Denied);
        assert_eq!(apply_one(&mut store, 1, create(1, "alice"))?.version, 1);
        let r = apply_one(&mut store, 1, create(2, "alice"))?;
        assert_eq!(r.status, Status::Conflict);
        let bobs = req(0, "bob", "bob", write("x", "1"));
        let r = apply_one(&mut store, 2, bobs)?;
        assert_eq!(r, CommandResult::status(Status::NotFound, 0));
        Ok(())
    }

    #[test]
    fn create_and_remove_field() -> Result<(), GuidStoreError> {
        let mut store = created("alice")?;
        let create = |id| {
            req(
                id,
                "alice",
                "alice",
                Operation::CreateField {
                    field: "nick".into(),
                    value: Bytes::from_static(b"al"),
                },
            )
        };
        assert!(apply_one(&mut store, 1, create(1))?.is_ok());
        let r = apply_one(&mut store, 1, create(2))?;
        assert_eq!(r.status, Status::Conflict);
        let remove = |id| {
            let op = Operation::RemoveField {
                field: "nick".into(),
            };
            req(id, "alice", "alice", op)
        };
        assert_eq!(apply_one(&mut store, 1, remove(3))?, CommandResult::ok(3));
        let r = apply_one(&mut store, 1, remove(4))?;
        assert_eq!(r.status, Status::NotFound);
        Ok(())
    }

    #[test]
    fn denied_read_no_mutation() -> Result<(), GuidStoreError> {
        let mut store = created("alice")?;
        as_owner(&mut store, 1, write("ssn", "123"))?;
        let before = store.clone();
        let r = apply_one(&mut store, 2, req(0, "alice", "bob", read("ssn")))?;
        assert_eq!(r, CommandResult::status(Status::Denied, 2));
        assert_eq!(store.get("alice"), before.get("alice"));
        Ok(())
    }

    #[test]
    fn subtree_read_filters_fields() -> Result<(), GuidStoreError> {
        let mut store = created("alice")?;
        for (id, (field, value)) in [
            ("contact.email", "a@x"),
            ("contact.phone", "555"),
            ("contactless", "yes"),
            ("ssn", "123"),
        ]
        .into_iter()
        .enumerate()
        {
            let op = write(field, value);
            let id = id as RequestId + 1;
            apply_one(&mut store, 1, req(id, "alice", "alice", op))?;
        }
        let grant = grant_read("contact.email", "bob");
        as_owner(&mut store, 5, grant)?;

        // owner sees the whole subtree, but not sibling prefixes
        let r = store.inspect("alice", "alice", "contact");
        let fields = decode_fields(&r)?;
        assert_eq!(
            fields.keys().collect::<Vec<_>>(),
            ["contact.email", "contact.phone"]
        );

        // bob only gets what the ACL admits
        let bobs = req(0, "alice", "bob", read("contact"));
        let r = apply_one(&mut store, 2, bobs)?;
        assert_eq!(r.status, Status::Ok);
        let fields = decode_fields(&r)?;
        assert_eq!(fields.len(), 1);
        assert_eq!(
            fields.get("contact.email"),
            Some(&Bytes::from_static(b"a@x"))
        );
        let r = store.inspect("alice", "bob", ENTIRE_RECORD);
        assert_eq!(decode_fields(&r)?.len(), 1);

        // nothing readable in the subtree
        let r = store.inspect("alice", "carol", "contact");
        assert_eq!(r.status, Status::Denied);
        let r = store.inspect("alice", "alice", "address");
        assert_eq!(r.status, Status::NotFound);
        Ok(())
    }

    #[test]
    fn whole_record_read() -> Result<(), GuidStoreError> {
        let mut store = created("alice")?;
        as_owner(&mut store, 1, write("a", "1"))?;
        as_owner(&mut store, 2, write("b.c", "2"))?;
        let r = store.inspect("alice", "alice", ENTIRE_RECORD);
        assert_eq!(r.version, 3);
        let fields = decode_fields(&r)?;
        assert_eq!(fields.get("a"), Some(&Bytes::from_static(b"1")));
        assert_eq!(fields.get("b.c"), Some(&Bytes::from_static(b"2")));

        // a whole-record grant covers every field
        let grant = grant_read(ENTIRE_RECORD, "bob");
        as_owner(&mut store, 3, grant)?;
        let r = store.inspect("alice", "bob", ENTIRE_RECORD);
        assert_eq!(decode_fields(&r)?.len(), 2);

        let empty = created("carol")?;
        let r = empty.inspect("carol", "carol", ENTIRE_RECORD);
        assert_eq!(r, CommandResult::status(Status::NotFound, 1));
        let r = empty.inspect("carol", "bob", ENTIRE_RECORD);
        assert_eq!(r, CommandResult::status(Status::Denied, 1));
        Ok(())
    }

    #[test]
    fn acl_linearized_by_slot() -> Result<(), GuidStoreError> {
        let mut store = created("alice")?;
        let grant = Operation::AddAcl {
            field: "email".into(),
            access: AccessType::Write,
            accessor: Accessor::Guid("bob".into()),
        };
        as_owner(&mut store, 1, grant)?;
        let bobs = req(0, "alice", "bob", write("email", "b"));
        let r = apply_one(&mut store, 2, bobs)?;
        assert!(r.is_ok());

        // bob's write was admitted before the revocation decided, but is
        // applied at a later slot
        let revoke = Operation::RemoveAcl {
            field: "email".into(),
            access: AccessType::Write,
            accessor: Accessor::Guid("bob".into()),
        };
        let slot = store.next_slot();
        let results = store
            .apply_slot(
                slot,
                &[
                    (1, req(2, "alice", "alice", revoke)),
                    (2, req(1, "alice", "bob", write("email", "evil"))),
                ],
            )?
            .ok_or_else(|| GuidStoreError::msg("slot replayed"))?;
        assert!(results[0].is_ok());
        assert_eq!(results[1].status, Status::Denied);
        let record =
            store.get("alice").ok_or_else(|| GuidStoreError::msg("gone"))?;
        assert_eq!(record.fields.get("email"), Some(&Bytes::from_static(b"b")));
        Ok(())
    }

    #[test]
    fn owner_only_ops() -> Result<(), GuidStoreError> {
        let mut store = created("alice")?;
        let join = Operation::AddGroupMember {
            group: "friends".into(),
            member: "bob".into(),
        };
        let r = apply_one(&mut store, 2, req(0, "alice", "bob", join.clone()))?;
        assert_eq!(r.status, Status::Denied);
        assert!(as_owner(&mut store, 1, join)?.is_ok());
        let remove = |id, requester| {
            req(id, "alice", requester, Operation::RemoveRecord)
        };
        let r = apply_one(&mut store, 2, remove(1, "bob"))?;
        assert_eq!(r.status, Status::Denied);
        let r = apply_one(&mut store, 1, remove(2, "alice"))?;
        assert_eq!(r, CommandResult::ok(3));
        assert!(store.get("alice").is_none());
        Ok(())
    }

    #[test]
    fn replay_and_gap() -> Result<(), GuidStoreError> {
        let mut store = RecordStore::new(1, vec![0]);
        let create = req(0, "alice", "alice", Operation::CreateRecord);
        let batch = vec![(1, create)];
        assert!(store.apply_slot(0, &batch)?.is_some());
        let snapshot = store.clone();
        assert_eq!(store.apply_slot(0, &batch)?, None);
        assert_eq!(store, snapshot);
        assert_eq!(
            store.apply_slot(5, &batch),
            Err(GuidStoreError::SlotGap {
                expected: 1,
                got: 5
            })
        );
        Ok(())
    }

    #[test]
    fn duplicate_request_executes_once() -> Result<(), GuidStoreError> {
        let mut store = created("alice")?;
        let once = || req(1, "alice", "alice", write("a", "1"));
        let first = apply_one(&mut store, 1, once())?;
        let again = apply_one(&mut store, 1, once())?;
        assert_eq!(first, again);
        assert_eq!(store.get("alice").map(|r| r.version), Some(2));
        Ok(())
    }

    #[test]
    fn reconfigure_changes_membership() -> Result<(), GuidStoreError> {
        let mut store = RecordStore::new(1, vec![0, 1, 2]);
        let reconf = |id, members: Vec<ReplicaId>| ApiRequest {
            id,
            cmd: Command::Reconfigure { members },
            consistency: Consistency::Coordinated,
            proof: None,
        };
        let r = apply_one(&mut store, 9, reconf(0, vec![0, 1, 5]))?;
        assert_eq!(r, CommandResult::ok(2));
        assert_eq!(store.epoch(), 2);
        assert_eq!(store.members(), &[0, 1, 5]);
        let r = apply_one(&mut store, 9, reconf(1, vec![]))?;
        assert_eq!(r.status, Status::Conflict);
        assert_eq!(store.epoch(), 2);
        Ok(())
    }

    #[test]
    fn inspect_and_precheck() -> Result<(), GuidStoreError> {
        let mut store = created("alice")?;
        as_owner(&mut store, 1, write("motd", "hi"))?;
        let r = store.inspect("alice", "bob", "motd");
        assert_eq!(r.status, Status::Denied);
        let r = store.inspect("carol", "bob", "motd");
        assert_eq!(r.status, Status::NotFound);
        assert_eq!(
            store.inspect("alice", "alice", "motd").value,
            Some(Bytes::from_static(b"hi"))
        );

        let check = |requester: &str, key: &str, op| {
            store.precheck(5, &req(0, key, requester, op))
        };
        assert_eq!(check("bob", "alice", read("motd")), Authorization::Deny);
        assert_eq!(check("alice", "alice", read("motd")), Authorization::Allow);
        assert_eq!(check("bob", "nobody", read("x")), Authorization::Allow);
        assert_eq!(
            check("bob", "alice", Operation::CreateRecord),
            Authorization::Deny
        );
        assert_eq!(
            check("bob", "alice", write("motd", "x")),
            Authorization::Deny
        );
        Ok(())
    }

    #[test]
    fn precheck_passes_executed_retry() -> Result<(), GuidStoreError> {
        let mut store = created("alice")?;
        let grant = Operation::AddAcl {
            field: "email".into(),
            access: AccessType::Write,
            accessor: Accessor::Guid("bob".into()),
        };
        as_owner(&mut store, 1, grant)?;
        let bobs = req(0, "alice", "bob", write("email", "b"));
        let first = apply_one(&mut store, 2, bobs.clone())?;
        assert!(first.is_ok());

        let revoke = Operation::RemoveAcl {
            field: "email".into(),
            access: AccessType::Write,
            accessor: Accessor::Guid("bob".into()),
        };
        as_owner(&mut store, 2, revoke)?;

        // the retry must reach the log and get its remembered result
        assert_eq!(store.precheck(2, &bobs), Authorization::Allow);
        assert_eq!(apply_one(&mut store, 2, bobs)?, first);

        // a fresh request from bob is now refused up front
        let fresh = req(1, "alice", "bob", write("email", "c"));
        assert_eq!(store.precheck(2, &fresh), Authorization::Deny);
        Ok(())
    }

    fn random_op(rng: &mut impl Rng) -> (String, Operation) {
        let guids = ["alice", "bob", "carol"];
        let fields = ["a", "a.b", "c", ENTIRE_RECORD];
        let requester = guids.choose(rng).copied().unwrap_or("alice");
        let field = fields.choose(rng).copied().unwrap_or("a").to_string();
        let op = match rng.gen_range(0..6) {
            0 => Operation::CreateRecord,
            1 => Operation::Read { field },
            2 | 3 => Operation::Write {
                field,
                value: Bytes::from(rng.gen::<u32>().to_string()),
            },
            4 => Operation::AddAcl {
                field,
                access: AccessType::Write,
                accessor: Accessor::Guid(
                    guids.choose(rng).copied().unwrap_or("bob").into(),
                ),
            },
            _ => Operation::RemoveField { field },
        };
        (requester.to_string(), op)
    }

    #[test]
    fn same_sequence_same_state() -> Result<(), GuidStoreError> {
        let mut rng = rand::thread_rng();
        let mut slots = vec![];
        for slot in 0..60 {
            let mut batch = vec![];
            for i in 0..rng.gen_range(0..4) {
                let (requester, op) = random_op(&mut rng);
                let key = if rng.gen_bool(0.7) {
                    "alice".to_string()
                } else {
                    requester.clone()
                };
                batch.push((
                    rng.gen_range(0..3),
                    req((slot * 10 + i) as RequestId, &key, &requester, op),
                ));
            }
            slots.push(batch);
        }

        let mut store_a = RecordStore::new(1, vec![0, 1, 2]);
        let mut store_b = RecordStore::new(1, vec![0, 1, 2]);
        let mut results_a = vec![];
        for (slot, batch) in slots.iter().enumerate() {
            results_a.push(store_a.apply_slot(slot, batch)?);
        }
        // b sees slots arrive shuffled, buffering until contiguous
        let mut order: Vec<usize> = (0..slots.len()).collect();
        order.shuffle(&mut rng);
        let mut pending = BTreeMap::new();
        let mut results_b = BTreeMap::new();
        for slot in order {
            pending.insert(slot, &slots[slot]);
            while let Some(batch) = pending.remove(&store_b.next_slot()) {
                let next = store_b.next_slot();
                results_b.insert(next, store_b.apply_slot(next, batch)?);
            }
        }
        assert_eq!(store_a, store_b);
        assert_eq!(results_a, results_b.into_values().collect::<Vec<_>>());
        Ok(())
    }
}

//! Field-level access control enforcement.
//!
//! An accessor may touch a field of a record if it owns the record, or if
//! some access list on the field's path allows it. Field names are dotted
//! paths: for `contact.email.work` the lists of `contact.email.work`,
//! `contact.email`, `contact` and finally the entire-record pseudo field
//! are consulted in turn. An entry allows when it names the accessor
//! directly, is the public wildcard, or names a record-local group the
//! accessor belongs to. Nothing allowing means deny.

use std::collections::BTreeSet;
use std::fmt;

use crate::server::{Guid, Record};

use serde::{Deserialize, Serialize};

/// Pseudo field name whose access lists cover every field of a record.
pub const ENTIRE_RECORD: &str = "+ALL+";

/// Kind of access being checked.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum AccessType {
    Read,
    Write,
}

/// One entry of an access list.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum Accessor {
    /// A single identity.
    Guid(Guid),

    /// A named group of identities kept on the same record.
    Group(String),

    /// Anyone.
    Public,
}

impl fmt::Display for Accessor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Accessor::Guid(guid) => write!(f, "{}", guid),
            Accessor::Group(name) => write!(f, "group:{}", name),
            Accessor::Public => write!(f, "+PUBLIC+"),
        }
    }
}

/// Read and write access lists of one field.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldAcl {
    pub read: BTreeSet<Accessor>,
    pub write: BTreeSet<Accessor>,
}

impl FieldAcl {
    /// The list for the given access type.
    pub fn list(&self, access: AccessType) -> &BTreeSet<Accessor> {
        match access {
            AccessType::Read => &self.read,
            AccessType::Write => &self.write,
        }
    }

    /// Mutable handle to the list for the given access type.
    pub fn list_mut(&mut self, access: AccessType) -> &mut BTreeSet<Accessor> {
        match access {
            AccessType::Read => &mut self.read,
            AccessType::Write => &mut self.write,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty()
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Authorization {
    Allow,
    Deny,
}

impl Authorization {
    #[inline]
    pub fn is_allowed(self) -> bool {
        self == Authorization::Allow
    }
}

/// Iterates the field path from the most specific name up to the
/// entire-record pseudo field.
fn field_path(field: &str) -> impl Iterator<Item = &str> {
    let mut next = if field == ENTIRE_RECORD {
        None
    } else {
        Some(field)
    };
    let mut done = false;
    std::iter::from_fn(move || {
        if done {
            return None;
        }
        match next {
            Some(name) => {
                next = name.rfind('.').map(|idx| &name[..idx]);
                Some(name)
            }
            None => {
                done = true;
                Some(ENTIRE_RECORD)
            }
        }
    })
}

/// Whether one access list entry admits the accessor.
fn entry_admits(entry: &Accessor, accessor: &str, record: &Record) -> bool {
    match entry {
        Accessor::Public => true,
        Accessor::Guid(guid) => guid == accessor,
        Accessor::Group(name) => record
            .groups
            .get(name)
            .map(|members| members.contains(accessor))
            .unwrap_or(false),
    }
}

/// Decides whether `accessor` may perform `access` on `field` of `record`.
pub fn authorize(
    accessor: &str,
    record: &Record,
    field: &str,
    access: AccessType,
) -> Authorization {
    if accessor == record.guid {
        return Authorization::Allow;
    }

    for name in field_path(field) {
        if let Some(acl) = record.acl.get(name) {
            if acl
                .list(access)
                .iter()
                .any(|entry| entry_admits(entry, accessor, record))
            {
                return Authorization::Allow;
            }
        }
    }

    Authorization::Deny
}

/// Only the owner may change access lists, groups, or remove the record.
pub fn authorize_owner(accessor: &str, record: &Record) -> Authorization {
    if accessor == record.guid {
        Authorization::Allow
    } else {
        Authorization::Deny
    }
}

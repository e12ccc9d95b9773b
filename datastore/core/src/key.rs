// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::hash::{Hash, Hasher};

/// Identifier of an object in the object keyspace. Allocated in batches from
/// the central server, never reused.
pub type ObjectId = u64;

/// Identifier assigned to a transaction by its scheduler.
pub type TxnId = u64;

/// Monotonically increasing ordinal assigned to a transaction when it joins
/// the store. Used for LRU ordering and settled-ness tests against the update
/// queue.
pub type ContextId = u64;

/// Identifier of this node, assigned by the server at registration.
pub type NodeId = u64;

/// A key in the ordered binding keyspace.
///
/// Names are compared by unsigned lexicographic byte order of their UTF-8
/// form, which is exactly the `Ord` of `str`. The two sentinels sort strictly
/// below and above every name and are never transmitted as strings.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BindingKey {
    /// Sorts strictly below any name. Only ever used as a range endpoint;
    /// no cache entry carries this key.
    First,
    /// A real binding name.
    Name(String),
    /// Sorts strictly above any name. The cache may hold one entry with this
    /// key, recording that the upper end of the keyspace is unbound.
    Last,
}

impl BindingKey {
    pub fn for_name(name: impl Into<String>) -> Self {
        BindingKey::Name(name.into())
    }

    /// The name carried by this key, if it is a real name.
    pub fn name(&self) -> Option<&str> {
        match self {
            BindingKey::Name(name) => Some(name),
            _ => None,
        }
    }

    /// The name for callers that treat `Last` as "no further bound name".
    /// `First` is never a valid answer to a name query.
    pub fn name_allow_last(&self) -> Option<&str> {
        match self {
            BindingKey::Name(name) => Some(name),
            BindingKey::Last => None,
            BindingKey::First => unreachable!("FIRST is not a next-name answer"),
        }
    }

    pub fn is_name(&self) -> bool {
        matches!(self, BindingKey::Name(_))
    }

    pub fn is_last(&self) -> bool {
        matches!(self, BindingKey::Last)
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingKey::First => write!(f, "<first>"),
            BindingKey::Name(name) => write!(f, "{name:?}"),
            BindingKey::Last => write!(f, "<last>"),
        }
    }
}

/// Key of a cache entry in either keyspace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryKey {
    Object(ObjectId),
    Binding(BindingKey),
}

impl EntryKey {
    /// Stripe index for per-key locks.
    pub(crate) fn stripe(&self, num_locks: usize) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        match self {
            EntryKey::Object(oid) => {
                0u8.hash(&mut hasher);
                oid.hash(&mut hasher);
            }
            EntryKey::Binding(key) => {
                1u8.hash(&mut hasher);
                key.hash(&mut hasher);
            }
        }
        (hasher.finish() % num_locks as u64) as usize
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKey::Object(oid) => write!(f, "oid:{oid}"),
            EntryKey::Binding(key) => write!(f, "name:{key}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_key_ordering() {
        let first = BindingKey::First;
        let a = BindingKey::for_name("a");
        let ab = BindingKey::for_name("ab");
        let b = BindingKey::for_name("b");
        let last = BindingKey::Last;

        assert!(first < a);
        assert!(a < ab);
        assert!(ab < b);
        assert!(b < last);
        assert!(first < last);
    }

    #[test]
    fn binding_key_ordering_is_byte_wise() {
        // "é" is two bytes (0xc3 0xa9), so it sorts above every ASCII name.
        let accented = BindingKey::for_name("é");
        let z = BindingKey::for_name("z");
        assert!(z < accented);
        assert!(accented < BindingKey::Last);
    }

    #[test]
    fn name_allow_last() {
        assert_eq!(BindingKey::for_name("a").name_allow_last(), Some("a"));
        assert_eq!(BindingKey::Last.name_allow_last(), None);
    }
}

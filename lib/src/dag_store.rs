// Copyright 2024 The Arbor Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use thiserror::Error;

use crate::object_id::ObjectId;
use crate::object_id::id_type;
use crate::props::PropList;
use crate::repo_path::DirentNameBuf;

id_type!(
    /// Identity of a node across its revisions. Every successor of a node
    /// revision carries the same `NodeId`; two node revisions are *related*
    /// iff their `NodeId`s are equal.
    pub NodeId
);
id_type!(
    /// Identity of a copy lineage. A fresh child shares its parent's
    /// `CopyId`; a history-preserving copy starts a new one.
    pub CopyId
);
id_type!(
    /// Identifier of an open transaction.
    pub TxnId
);
id_type!(
    /// Content-addressed key of a data or property representation. Equal keys
    /// imply identical content.
    pub RepKey
);

/// A committed revision number.
pub type RevisionNumber = u64;

/// Where a node revision lives: inside an uncommitted transaction (mutable)
/// or frozen in a committed revision.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum NodeScope {
    Transaction(TxnId),
    Revision(RevisionNumber),
}

/// Identity of one node revision: node identity, copy lineage, and the
/// transaction or revision the node revision belongs to.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct NodeRevId {
    pub node_id: NodeId,
    pub copy_id: CopyId,
    pub scope: NodeScope,
}

impl NodeRevId {
    pub fn in_txn(node_id: NodeId, copy_id: CopyId, txn_id: TxnId) -> Self {
        Self {
            node_id,
            copy_id,
            scope: NodeScope::Transaction(txn_id),
        }
    }

    pub fn in_revision(node_id: NodeId, copy_id: CopyId, revision: RevisionNumber) -> Self {
        Self {
            node_id,
            copy_id,
            scope: NodeScope::Revision(revision),
        }
    }

    /// A node revision is mutable iff it belongs to a transaction.
    pub fn is_mutable(&self) -> bool {
        matches!(self.scope, NodeScope::Transaction(_))
    }

    /// Mutable, and specifically within `txn_id`. Stricter than
    /// [`Self::is_mutable`]; mutation helpers use the loose form, this one
    /// backs debug assertions.
    pub fn is_mutable_in(&self, txn_id: &TxnId) -> bool {
        matches!(&self.scope, NodeScope::Transaction(t) if t == txn_id)
    }

    pub fn txn_id(&self) -> Option<&TxnId> {
        match &self.scope {
            NodeScope::Transaction(txn_id) => Some(txn_id),
            NodeScope::Revision(_) => None,
        }
    }

    pub fn revision(&self) -> Option<RevisionNumber> {
        match &self.scope {
            NodeScope::Transaction(_) => None,
            NodeScope::Revision(revision) => Some(*revision),
        }
    }

    /// Two ids are related iff they share node identity.
    pub fn is_related(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum NodeKind {
    File,
    Dir,
}

/// Where a history-preserving copy came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopySource {
    pub revision: RevisionNumber,
    pub path: String,
}

/// The immutable value a [`NodeRevId`] resolves to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRevision {
    pub kind: NodeKind,
    /// The previous revision of this node, if any. Always shares `node_id`
    /// with this node.
    pub predecessor: Option<NodeRevId>,
    /// Length of the predecessor chain. `None` when unknown; once unknown it
    /// stays unknown through successors.
    pub predecessor_count: Option<u32>,
    /// The node revision that originated the current copy lineage.
    pub copyroot: Option<NodeRevId>,
    pub copyfrom: Option<CopySource>,
    pub data_rep: Option<RepKey>,
    pub prop_rep: Option<RepKey>,
    /// Non-`None` iff a mutable text stream is currently open on this node.
    pub edit_key: Option<String>,
    pub created_path: String,
}

impl NodeRevision {
    pub fn new(kind: NodeKind, created_path: String) -> Self {
        Self {
            kind,
            predecessor: None,
            predecessor_count: Some(0),
            copyroot: None,
            copyfrom: None,
            data_rep: None,
            prop_rep: None,
            edit_key: None,
            created_path,
        }
    }
}

/// One entry of a directory's contents.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DirEntry {
    pub id: NodeRevId,
    pub kind: NodeKind,
}

/// Directory contents: entry name to entry, names unique, order irrelevant
/// (kept sorted for deterministic serialization).
pub type DirEntries = BTreeMap<DirentNameBuf, DirEntry>;

/// Error raised by the DAG layer and its stores.
#[derive(Debug, Error)]
pub enum DagError {
    #[error("Object {hash} of type {object_type} not found")]
    NotFound {
        object_type: String,
        hash: String,
    },
    #[error("{path} is not a directory")]
    NotDirectory { path: String },
    #[error("{path} is not a file")]
    NotFile { path: String },
    #[error("{path} is not mutable")]
    NotMutable { path: String },
    #[error("{path} already exists")]
    AlreadyExists { path: String },
    #[error("\"{name}\" is not a single path component")]
    NotSinglePathComponent { name: String },
    #[error("Directory {path} is not empty")]
    DirectoryNotEmpty { path: String },
    #[error("Checksum mismatch (expected {expected}, got {actual})")]
    ChecksumMismatch { expected: String, actual: String },
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

pub type DagResult<T> = Result<T, DagError>;

pub(crate) fn to_other_err(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> DagError {
    DagError::Other(err.into())
}

/// Resolves representation keys to byte streams and property lists. Writes
/// are content-addressed: writing identical content yields an equal key.
pub trait RepresentationStore: Send + Sync + Debug {
    fn read_data(&self, key: &RepKey) -> DagResult<Vec<u8>>;
    fn write_data(&self, data: &[u8]) -> DagResult<RepKey>;
    fn read_props(&self, key: &RepKey) -> DagResult<PropList>;
    fn write_props(&self, props: &PropList) -> DagResult<RepKey>;
}

/// Storage for node revisions and the transactions that mutate them.
///
/// A transaction is the unit of mutation: nodes created through one carry its
/// [`TxnId`] in their scope and stay mutable until [`Self::commit_txn`]
/// promotes all of them to a fresh committed revision.
pub trait TransactionStore: Send + Sync + Debug {
    fn get_node_revision(&self, id: &NodeRevId) -> DagResult<NodeRevision>;

    /// Overwrites the node revision stored under `id`. Refuses committed ids.
    fn put_node_revision(&self, id: &NodeRevId, node_rev: NodeRevision) -> DagResult<()>;

    /// Stores `node_rev` under a freshly allocated node identity within
    /// `txn_id`, sharing the given copy lineage.
    fn create_node(
        &self,
        txn_id: &TxnId,
        copy_id: &CopyId,
        node_rev: NodeRevision,
    ) -> DagResult<NodeRevId>;

    /// Stores `node_rev` as a successor of `base_id`: same node identity,
    /// the given copy lineage, mutable in `txn_id`.
    fn create_successor(
        &self,
        base_id: &NodeRevId,
        node_rev: NodeRevision,
        copy_id: &CopyId,
        txn_id: &TxnId,
    ) -> DagResult<NodeRevId>;

    /// Allocates a fresh copy lineage id for use by a history-preserving
    /// copy made in `txn_id`.
    fn reserve_copy_id(&self, txn_id: &TxnId) -> DagResult<CopyId>;

    /// Opens a new transaction based on the current head revision. The
    /// transaction's root initially *equals* its base root; the root is
    /// cloned on first mutation.
    fn begin_txn(&self) -> DagResult<TxnId>;

    fn txn_root(&self, txn_id: &TxnId) -> DagResult<NodeRevId>;
    fn txn_base_root(&self, txn_id: &TxnId) -> DagResult<NodeRevId>;
    fn set_txn_root(&self, txn_id: &TxnId, root: &NodeRevId) -> DagResult<()>;

    /// Atomically promotes every node of the transaction to a new committed
    /// revision and retires the transaction. Returns the new revision number.
    fn commit_txn(&self, txn_id: &TxnId) -> DagResult<RevisionNumber>;

    fn revision_root(&self, revision: RevisionNumber) -> DagResult<NodeRevId>;
    fn head_revision(&self) -> RevisionNumber;
}

/// The filesystem DAG: a transaction store plus the representation store its
/// nodes point into. Handles ([`crate::dag_node::DagNode`]) hold an `Arc` of
/// this.
#[derive(Debug)]
pub struct DagFs {
    txns: Arc<dyn TransactionStore>,
    reps: Arc<dyn RepresentationStore>,
}

impl DagFs {
    pub fn new(txns: Arc<dyn TransactionStore>, reps: Arc<dyn RepresentationStore>) -> Arc<Self> {
        Arc::new(Self { txns, reps })
    }

    pub fn transactions(&self) -> &Arc<dyn TransactionStore> {
        &self.txns
    }

    pub fn representations(&self) -> &Arc<dyn RepresentationStore> {
        &self.reps
    }

    /// Reads the directory contents stored behind `data_rep`. A `None` rep
    /// is an empty directory.
    pub fn read_dir_entries(&self, data_rep: Option<&RepKey>) -> DagResult<DirEntries> {
        let Some(key) = data_rep else {
            return Ok(DirEntries::new());
        };
        let data = self.reps.read_data(key)?;
        serde_json::from_slice(&data).map_err(to_other_err)
    }

    /// Serializes and stores directory contents, returning the new rep key.
    pub fn write_dir_entries(&self, entries: &DirEntries) -> DagResult<RepKey> {
        let data = serde_json::to_vec(entries).map_err(to_other_err)?;
        self.reps.write_data(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(node: &str, copy: &str) -> (NodeId, CopyId) {
        (NodeId::from_bytes(node.as_bytes()), CopyId::from_bytes(copy.as_bytes()))
    }

    #[test]
    fn test_scope_accessors() {
        let (node_id, copy_id) = id("n1", "c1");
        let txn = TxnId::from_bytes(b"t1");
        let mutable = NodeRevId::in_txn(node_id.clone(), copy_id.clone(), txn.clone());
        assert!(mutable.is_mutable());
        assert!(mutable.is_mutable_in(&txn));
        assert!(!mutable.is_mutable_in(&TxnId::from_bytes(b"t2")));
        assert_eq!(mutable.txn_id(), Some(&txn));
        assert_eq!(mutable.revision(), None);

        let committed = NodeRevId::in_revision(node_id, copy_id, 7);
        assert!(!committed.is_mutable());
        assert_eq!(committed.txn_id(), None);
        assert_eq!(committed.revision(), Some(7));
    }

    #[test]
    fn test_relatedness_ignores_copy_and_scope() {
        let a = NodeRevId::in_revision(NodeId::from_bytes(b"n"), CopyId::from_bytes(b"c1"), 1);
        let b = NodeRevId::in_txn(
            NodeId::from_bytes(b"n"),
            CopyId::from_bytes(b"c2"),
            TxnId::from_bytes(b"t"),
        );
        let c = NodeRevId::in_revision(NodeId::from_bytes(b"m"), CopyId::from_bytes(b"c1"), 1);
        assert!(a.is_related(&b));
        assert!(!a.is_related(&c));
        assert_ne!(a, b);
    }
}

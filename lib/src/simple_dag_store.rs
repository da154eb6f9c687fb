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

//! A deliberately simple in-memory implementation of the store traits.
//!
//! Node revisions, representations, and transactions live in mutex-guarded
//! maps; representation keys are BLAKE2 content hashes. This backs the test
//! suite and small in-process repositories.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use blake2::Blake2b512;
use digest::Digest as _;

use crate::dag_store::CopyId;
use crate::dag_store::DagError;
use crate::dag_store::DagFs;
use crate::dag_store::DagResult;
use crate::dag_store::DirEntries;
use crate::dag_store::NodeId;
use crate::dag_store::NodeKind;
use crate::dag_store::NodeRevId;
use crate::dag_store::NodeRevision;
use crate::dag_store::RepKey;
use crate::dag_store::RepresentationStore;
use crate::dag_store::RevisionNumber;
use crate::dag_store::TransactionStore;
use crate::dag_store::TxnId;
use crate::dag_store::to_other_err;
use crate::object_id::ObjectId as _;

#[derive(Debug)]
struct TxnRecord {
    root: NodeRevId,
    base_root: NodeRevId,
}

#[derive(Debug, Default)]
struct Inner {
    nodes: HashMap<NodeRevId, NodeRevision>,
    data_reps: HashMap<RepKey, Vec<u8>>,
    prop_reps: HashMap<RepKey, crate::props::PropList>,
    txns: HashMap<TxnId, TxnRecord>,
    /// Root node id per committed revision, indexed by revision number.
    revision_roots: Vec<NodeRevId>,
    next_node_id: u64,
    next_copy_id: u64,
    next_txn_id: u64,
}

/// In-memory [`TransactionStore`] + [`RepresentationStore`].
#[derive(Debug)]
pub struct SimpleDagStore {
    inner: Mutex<Inner>,
}

fn node_not_found(id: &NodeRevId) -> DagError {
    DagError::NotFound {
        object_type: "node".to_string(),
        hash: format!("{}.{}", id.node_id, id.copy_id),
    }
}

fn txn_not_found(id: &TxnId) -> DagError {
    DagError::NotFound {
        object_type: "transaction".to_string(),
        hash: id.hex(),
    }
}

fn rep_not_found(key: &RepKey) -> DagError {
    DagError::NotFound {
        object_type: "representation".to_string(),
        hash: key.hex(),
    }
}

fn content_key(data: &[u8]) -> RepKey {
    RepKey::new(Blake2b512::digest(data).to_vec())
}

fn fresh_id(counter: &mut u64) -> Vec<u8> {
    let id = *counter;
    *counter += 1;
    id.to_be_bytes().to_vec()
}

impl SimpleDagStore {
    /// The backend name recorded when a repository is created with this
    /// store.
    pub fn name() -> &'static str {
        "Simple"
    }

    /// Creates a store holding revision 0 with an empty root directory.
    pub fn init() -> Arc<Self> {
        let mut inner = Inner::default();
        let node_id = NodeId::new(fresh_id(&mut inner.next_node_id));
        let copy_id = CopyId::new(fresh_id(&mut inner.next_copy_id));
        let root_id = NodeRevId::in_revision(node_id, copy_id, 0);
        inner.nodes.insert(
            root_id.clone(),
            NodeRevision::new(NodeKind::Dir, crate::dag_node::ROOT_CREATED_PATH.to_string()),
        );
        inner.revision_roots.push(root_id);
        Arc::new(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Wraps this store into a [`DagFs`] serving both trait roles.
    pub fn to_dag_fs(self: &Arc<Self>) -> Arc<DagFs> {
        DagFs::new(self.clone(), self.clone())
    }
}

impl RepresentationStore for SimpleDagStore {
    fn read_data(&self, key: &RepKey) -> DagResult<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .data_reps
            .get(key)
            .cloned()
            .ok_or_else(|| rep_not_found(key))
    }

    fn write_data(&self, data: &[u8]) -> DagResult<RepKey> {
        let key = content_key(data);
        let mut inner = self.inner.lock().unwrap();
        inner.data_reps.insert(key.clone(), data.to_vec());
        Ok(key)
    }

    fn read_props(&self, key: &RepKey) -> DagResult<crate::props::PropList> {
        let inner = self.inner.lock().unwrap();
        inner
            .prop_reps
            .get(key)
            .cloned()
            .ok_or_else(|| rep_not_found(key))
    }

    fn write_props(&self, props: &crate::props::PropList) -> DagResult<RepKey> {
        let canonical = serde_json::to_vec(props).map_err(to_other_err)?;
        let key = content_key(&canonical);
        let mut inner = self.inner.lock().unwrap();
        inner.prop_reps.insert(key.clone(), props.clone());
        Ok(key)
    }
}

impl TransactionStore for SimpleDagStore {
    fn get_node_revision(&self, id: &NodeRevId) -> DagResult<NodeRevision> {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .get(id)
            .cloned()
            .ok_or_else(|| node_not_found(id))
    }

    fn put_node_revision(&self, id: &NodeRevId, node_rev: NodeRevision) -> DagResult<()> {
        if !id.is_mutable() {
            return Err(DagError::NotMutable {
                path: node_rev.created_path,
            });
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.nodes.contains_key(id) {
            return Err(node_not_found(id));
        }
        inner.nodes.insert(id.clone(), node_rev);
        Ok(())
    }

    fn create_node(
        &self,
        txn_id: &TxnId,
        copy_id: &CopyId,
        node_rev: NodeRevision,
    ) -> DagResult<NodeRevId> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.txns.contains_key(txn_id) {
            return Err(txn_not_found(txn_id));
        }
        let node_id = NodeId::new(fresh_id(&mut inner.next_node_id));
        let id = NodeRevId::in_txn(node_id, copy_id.clone(), txn_id.clone());
        inner.nodes.insert(id.clone(), node_rev);
        Ok(id)
    }

    fn create_successor(
        &self,
        base_id: &NodeRevId,
        node_rev: NodeRevision,
        copy_id: &CopyId,
        txn_id: &TxnId,
    ) -> DagResult<NodeRevId> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.txns.contains_key(txn_id) {
            return Err(txn_not_found(txn_id));
        }
        let id = NodeRevId::in_txn(base_id.node_id.clone(), copy_id.clone(), txn_id.clone());
        if inner.nodes.contains_key(&id) {
            return Err(DagError::AlreadyExists {
                path: node_rev.created_path,
            });
        }
        inner.nodes.insert(id.clone(), node_rev);
        Ok(id)
    }

    fn reserve_copy_id(&self, txn_id: &TxnId) -> DagResult<CopyId> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.txns.contains_key(txn_id) {
            return Err(txn_not_found(txn_id));
        }
        Ok(CopyId::new(fresh_id(&mut inner.next_copy_id)))
    }

    fn begin_txn(&self) -> DagResult<TxnId> {
        let mut inner = self.inner.lock().unwrap();
        let txn_id = TxnId::new(fresh_id(&mut inner.next_txn_id));
        let base_root = inner
            .revision_roots
            .last()
            .expect("store always has a head revision")
            .clone();
        inner.txns.insert(
            txn_id.clone(),
            TxnRecord {
                root: base_root.clone(),
                base_root,
            },
        );
        Ok(txn_id)
    }

    fn txn_root(&self, txn_id: &TxnId) -> DagResult<NodeRevId> {
        let inner = self.inner.lock().unwrap();
        let record = inner.txns.get(txn_id).ok_or_else(|| txn_not_found(txn_id))?;
        Ok(record.root.clone())
    }

    fn txn_base_root(&self, txn_id: &TxnId) -> DagResult<NodeRevId> {
        let inner = self.inner.lock().unwrap();
        let record = inner.txns.get(txn_id).ok_or_else(|| txn_not_found(txn_id))?;
        Ok(record.base_root.clone())
    }

    fn set_txn_root(&self, txn_id: &TxnId, root: &NodeRevId) -> DagResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .txns
            .get_mut(txn_id)
            .ok_or_else(|| txn_not_found(txn_id))?;
        record.root = root.clone();
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn commit_txn(&self, txn_id: &TxnId) -> DagResult<RevisionNumber> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.txns.remove(txn_id).ok_or_else(|| txn_not_found(txn_id))?;
        let new_revision = inner.revision_roots.len() as RevisionNumber;
        let new_root = if record.root == record.base_root {
            // Nothing was mutated; the new revision shares the old root.
            record.root
        } else {
            let mut promoted = HashMap::new();
            promote(&mut inner, &record.root, new_revision, &mut promoted)?
        };
        inner.revision_roots.push(new_root);
        // Drop any leftover mutable nodes of this transaction (e.g. nodes
        // made unreachable by a later delete in the same transaction).
        let txn_id = txn_id.clone();
        inner
            .nodes
            .retain(|id, _| !id.is_mutable_in(&txn_id));
        Ok(new_revision)
    }

    fn revision_root(&self, revision: RevisionNumber) -> DagResult<NodeRevId> {
        let inner = self.inner.lock().unwrap();
        inner
            .revision_roots
            .get(revision as usize)
            .cloned()
            .ok_or_else(|| DagError::NotFound {
                object_type: "revision".to_string(),
                hash: revision.to_string(),
            })
    }

    fn head_revision(&self) -> RevisionNumber {
        let inner = self.inner.lock().unwrap();
        (inner.revision_roots.len() - 1) as RevisionNumber
    }
}

/// Rewrites the mutable node `id` (and, for directories, every mutable node
/// below it) into revision `new_revision`, returning the promoted id.
/// Already-committed nodes pass through unchanged.
fn promote(
    inner: &mut Inner,
    id: &NodeRevId,
    new_revision: RevisionNumber,
    promoted: &mut HashMap<NodeRevId, NodeRevId>,
) -> DagResult<NodeRevId> {
    if !id.is_mutable() {
        return Ok(id.clone());
    }
    if let Some(done) = promoted.get(id) {
        return Ok(done.clone());
    }
    let mut node_rev = inner.nodes.get(id).cloned().ok_or_else(|| node_not_found(id))?;
    if node_rev.kind == NodeKind::Dir {
        let mut entries: DirEntries = match &node_rev.data_rep {
            Some(key) => {
                let data = inner
                    .data_reps
                    .get(key)
                    .cloned()
                    .ok_or_else(|| rep_not_found(key))?;
                serde_json::from_slice(&data).map_err(to_other_err)?
            }
            None => DirEntries::new(),
        };
        let mut changed = false;
        for entry in entries.values_mut() {
            let child_id = promote(inner, &entry.id, new_revision, promoted)?;
            if child_id != entry.id {
                entry.id = child_id;
                changed = true;
            }
        }
        if changed {
            let data = serde_json::to_vec(&entries).map_err(to_other_err)?;
            let key = content_key(&data);
            inner.data_reps.insert(key.clone(), data);
            node_rev.data_rep = Some(key);
        }
    }
    let new_id = NodeRevId::in_revision(id.node_id.clone(), id.copy_id.clone(), new_revision);
    if let Some(copyroot) = node_rev.copyroot.clone()
        && copyroot.is_mutable()
    {
        node_rev.copyroot = if copyroot == *id {
            Some(new_id.clone())
        } else {
            Some(promote(inner, &copyroot, new_revision, promoted)?)
        };
    }
    node_rev.edit_key = None;
    inner.nodes.remove(id);
    inner.nodes.insert(new_id.clone(), node_rev);
    promoted.insert(id.clone(), new_id.clone());
    Ok(new_id)
}

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

//! Handles over node revisions in the filesystem DAG, and the operations
//! that read and mutate them.
//!
//! A [`DagNode`] pairs a [`NodeRevId`] with a lazily loaded [`NodeRevision`].
//! Multiple handles over the same id may coexist, each with its own cache;
//! a handle's cache is dropped after any mutation through it, and callers
//! holding other handles must [`DagNode::reload`] after operations that may
//! have invalidated them.

#![expect(missing_docs)]

use std::fmt::Debug;
use std::sync::Arc;

use blake2::Blake2b512;
use digest::Digest as _;
use once_cell::unsync::OnceCell;

use crate::dag_store::CopyId;
use crate::dag_store::CopySource;
use crate::dag_store::DagError;
use crate::dag_store::DagFs;
use crate::dag_store::DagResult;
use crate::dag_store::DirEntries;
use crate::dag_store::NodeKind;
use crate::dag_store::NodeRevId;
use crate::dag_store::NodeRevision;
use crate::dag_store::TxnId;
use crate::object_id::ObjectId as _;
use crate::props::PropList;
use crate::repo_path::DirentName;
use crate::repo_path::WcPath;

/// The path recorded for a filesystem root node.
pub const ROOT_CREATED_PATH: &str = "/";

/// Joins a created-path with an entry name.
pub fn join_created_path(parent_path: &str, name: &DirentName) -> String {
    if parent_path == ROOT_CREATED_PATH {
        format!("/{}", name.as_str())
    } else {
        format!("{parent_path}/{}", name.as_str())
    }
}

fn id_desc(id: &NodeRevId) -> String {
    match id.revision() {
        Some(revision) => format!("{}.{}@r{revision}", id.node_id, id.copy_id),
        None => format!("{}.{} (txn)", id.node_id, id.copy_id),
    }
}

fn not_found(id: &NodeRevId) -> DagError {
    DagError::NotFound {
        object_type: "node".to_string(),
        hash: id_desc(id),
    }
}

/// A handle over one node revision.
pub struct DagNode {
    fs: Arc<DagFs>,
    id: NodeRevId,
    kind: NodeKind,
    created_path: String,
    data: OnceCell<NodeRevision>,
}

impl Debug for DagNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagNode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("created_path", &self.created_path)
            .finish()
    }
}

/// Fetches the node revision for `id` and wraps it in a new handle.
pub fn get_node(fs: &Arc<DagFs>, id: &NodeRevId) -> DagResult<DagNode> {
    let node_rev = fs.transactions().get_node_revision(id)?;
    Ok(DagNode {
        fs: fs.clone(),
        id: id.clone(),
        kind: node_rev.kind,
        created_path: node_rev.created_path.clone(),
        data: OnceCell::with_value(node_rev),
    })
}

impl DagNode {
    /// The identity of this node revision.
    pub fn id(&self) -> &NodeRevId {
        &self.id
    }

    /// The node's kind, available without touching the store.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// The path this node revision was created at, available without
    /// touching the store.
    pub fn created_path(&self) -> &str {
        &self.created_path
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    /// The node revision behind this handle, fetched on first use.
    pub fn node_revision(&self) -> DagResult<&NodeRevision> {
        self.data
            .get_or_try_init(|| self.fs.transactions().get_node_revision(&self.id))
    }

    /// Drops the cached node revision so the next read refetches. Callers
    /// must call this after another handle may have mutated this node.
    pub fn reload(&mut self) {
        self.data = OnceCell::new();
    }

    /// Whether this node may be mutated within the given transaction.
    ///
    /// Only the *presence* of a transaction scope is checked; the value of
    /// `txn_id` is not compared against the node's recorded transaction.
    /// `NodeRevId::is_mutable_in` performs the strict comparison.
    pub fn check_mutable(&self, _txn_id: &TxnId) -> bool {
        self.id.is_mutable()
    }

    fn ensure_mutable(&self) -> DagResult<()> {
        if self.id.is_mutable() {
            Ok(())
        } else {
            Err(DagError::NotMutable {
                path: self.created_path.clone(),
            })
        }
    }

    fn ensure_directory(&self) -> DagResult<()> {
        if self.is_dir() {
            Ok(())
        } else {
            Err(DagError::NotDirectory {
                path: self.created_path.clone(),
            })
        }
    }

    fn ensure_file(&self) -> DagResult<()> {
        if self.is_file() {
            Ok(())
        } else {
            Err(DagError::NotFile {
                path: self.created_path.clone(),
            })
        }
    }

    /// Lazily walks the predecessor chain, newest to oldest, starting from
    /// this node's immediate predecessor. The visitor may stop the walk by
    /// setting the `done` flag; after the last real node it is invoked once
    /// more with `None` to signal exhaustion.
    pub fn walk_predecessors<F>(&self, mut visit: F) -> DagResult<()>
    where
        F: FnMut(Option<&Self>, &mut bool) -> DagResult<()>,
    {
        let mut done = false;
        let mut current = self.node_revision()?.predecessor.clone();
        while let Some(id) = current {
            let node = get_node(&self.fs, &id)?;
            visit(Some(&node), &mut done)?;
            if done {
                return Ok(());
            }
            current = node.node_revision()?.predecessor.clone();
        }
        visit(None, &mut done)
    }

    /// Returns the directory's entry mapping.
    pub fn dir_entries(&self) -> DagResult<DirEntries> {
        self.ensure_directory()?;
        let node_rev = self.node_revision()?;
        self.fs.read_dir_entries(node_rev.data_rep.as_ref())
    }

    fn write_entries(&mut self, entries: &DirEntries) -> DagResult<()> {
        let data_rep = self.fs.write_dir_entries(entries)?;
        let mut node_rev = self.node_revision()?.clone();
        node_rev.data_rep = Some(data_rep);
        self.fs.transactions().put_node_revision(&self.id, node_rev)?;
        self.reload();
        Ok(())
    }

    /// Sets (or overwrites) `name` in this directory's entries. The caller
    /// is responsible for ensuring `id` does not name an ancestor of this
    /// directory.
    pub fn set_entry(
        &mut self,
        name: &DirentName,
        id: NodeRevId,
        kind: NodeKind,
        _txn_id: &TxnId,
    ) -> DagResult<()> {
        self.ensure_directory()?;
        self.ensure_mutable()?;
        let mut entries = self.dir_entries()?;
        entries.insert(name.to_owned(), crate::dag_store::DirEntry { id, kind });
        self.write_entries(&entries)
    }

    /// Allocates a fresh file node under this directory.
    pub fn make_file(
        &mut self,
        parent_path: &str,
        name: &str,
        txn_id: &TxnId,
    ) -> DagResult<Self> {
        self.make_entry(parent_path, name, NodeKind::File, txn_id)
    }

    /// Allocates a fresh directory node under this directory.
    pub fn make_dir(&mut self, parent_path: &str, name: &str, txn_id: &TxnId) -> DagResult<Self> {
        self.make_entry(parent_path, name, NodeKind::Dir, txn_id)
    }

    fn make_entry(
        &mut self,
        parent_path: &str,
        name: &str,
        kind: NodeKind,
        txn_id: &TxnId,
    ) -> DagResult<Self> {
        let name = DirentName::new(name).map_err(|err| DagError::NotSinglePathComponent {
            name: err.value,
        })?;
        self.ensure_directory()?;
        self.ensure_mutable()?;
        let mut entries = self.dir_entries()?;
        let created_path = join_created_path(parent_path, name);
        if entries.contains_key(name) {
            return Err(DagError::AlreadyExists { path: created_path });
        }
        let node_rev = NodeRevision::new(kind, created_path);
        // The fresh child shares this directory's copy lineage.
        let child_id = self
            .fs
            .transactions()
            .create_node(txn_id, &self.id.copy_id, node_rev)?;
        entries.insert(
            name.to_owned(),
            crate::dag_store::DirEntry {
                id: child_id.clone(),
                kind,
            },
        );
        self.write_entries(&entries)?;
        get_node(&self.fs, &child_id)
    }

    /// Obtains a mutable version of the child `name` within `txn_id`. If the
    /// child is already mutable it is returned as-is; otherwise a successor
    /// node is created, the predecessor chain extended, and the parent entry
    /// replaced.
    pub fn clone_child(
        &mut self,
        parent_path: &str,
        name: &DirentName,
        copy_id: &CopyId,
        txn_id: &TxnId,
    ) -> DagResult<Self> {
        self.ensure_directory()?;
        self.ensure_mutable()?;
        let entries = self.dir_entries()?;
        let entry = entries
            .get(name)
            .ok_or_else(|| not_found(&self.id))?
            .clone();
        if entry.id.is_mutable() {
            return get_node(&self.fs, &entry.id);
        }
        let txns = self.fs.transactions();
        let mut child_rev = txns.get_node_revision(&entry.id)?;
        child_rev.predecessor = Some(entry.id.clone());
        // An unknown count stays unknown.
        child_rev.predecessor_count = child_rev.predecessor_count.map(|count| count + 1);
        child_rev.created_path = join_created_path(parent_path, name);
        let new_id = txns.create_successor(&entry.id, child_rev, copy_id, txn_id)?;
        self.set_entry(name, new_id.clone(), entry.kind, txn_id)?;
        get_node(&self.fs, &new_id)
    }

    /// Inserts `name -> from` into this directory. With `preserve_history`,
    /// a successor of `from` is created recording the copy source and
    /// starting a fresh copy lineage rooted at itself; without, the entry
    /// simply aliases `from` (a "soft" copy).
    pub fn copy(
        &mut self,
        name: &DirentName,
        from: &Self,
        preserve_history: bool,
        from_rev: crate::dag_store::RevisionNumber,
        from_path: &str,
        txn_id: &TxnId,
    ) -> DagResult<()> {
        self.ensure_directory()?;
        self.ensure_mutable()?;
        if !preserve_history {
            return self.set_entry(name, from.id.clone(), from.kind, txn_id);
        }
        let txns = self.fs.transactions();
        let mut copy_rev = from.node_revision()?.clone();
        copy_rev.predecessor = Some(from.id.clone());
        copy_rev.predecessor_count = copy_rev.predecessor_count.map(|count| count + 1);
        copy_rev.copyfrom = Some(CopySource {
            revision: from_rev,
            path: from_path.to_owned(),
        });
        copy_rev.created_path = join_created_path(&self.created_path, name);
        let copy_id = txns.reserve_copy_id(txn_id)?;
        let new_id = txns.create_successor(&from.id, copy_rev, &copy_id, txn_id)?;
        // The copy begins its own lineage.
        let mut copy_rev = txns.get_node_revision(&new_id)?;
        copy_rev.copyroot = Some(new_id.clone());
        txns.put_node_revision(&new_id, copy_rev)?;
        self.set_entry(name, new_id, from.kind, txn_id)
    }

    /// Removes `name` from this directory. With `require_empty`, refuses to
    /// remove a directory that still has entries.
    pub fn delete(
        &mut self,
        name: &DirentName,
        require_empty: bool,
        _txn_id: &TxnId,
    ) -> DagResult<()> {
        self.ensure_directory()?;
        self.ensure_mutable()?;
        let mut entries = self.dir_entries()?;
        let entry = entries
            .get(name)
            .ok_or_else(|| not_found(&self.id))?
            .clone();
        if require_empty && entry.kind == NodeKind::Dir {
            let child = get_node(&self.fs, &entry.id)?;
            if !child.dir_entries()?.is_empty() {
                return Err(DagError::DirectoryNotEmpty {
                    path: join_created_path(&self.created_path, name),
                });
            }
        }
        entries.remove(name);
        self.write_entries(&entries)
    }

    /// Whether this node is a proper ancestor of `other` via the predecessor
    /// chain. Unrelated nodes are never ancestors.
    pub fn is_ancestor_of(&self, other: &Self) -> DagResult<bool> {
        if !self.id.is_related(&other.id) {
            return Ok(false);
        }
        let mut found = false;
        other.walk_predecessors(|current, _done| {
            if let Some(node) = current
                && node.id == self.id
            {
                found = true;
            }
            Ok(())
        })?;
        Ok(found)
    }

    /// Whether this node is the immediate predecessor of `other`. Implies
    /// [`Self::is_ancestor_of`].
    pub fn is_parent_of(&self, other: &Self) -> DagResult<bool> {
        if !self.id.is_related(&other.id) {
            return Ok(false);
        }
        let mut found = false;
        other.walk_predecessors(|current, done| {
            if let Some(node) = current {
                found = node.id == self.id;
            }
            // Only the immediate predecessor is consulted.
            *done = true;
            Ok(())
        })?;
        Ok(found)
    }

    /// The node's property list.
    pub fn proplist(&self) -> DagResult<PropList> {
        let node_rev = self.node_revision()?;
        match &node_rev.prop_rep {
            Some(key) => self.fs.representations().read_props(key),
            None => Ok(PropList::new()),
        }
    }

    /// Replaces the node's property list. The node must be mutable.
    pub fn set_proplist(&mut self, props: &PropList, _txn_id: &TxnId) -> DagResult<()> {
        self.ensure_mutable()?;
        let prop_rep = self.fs.representations().write_props(props)?;
        let mut node_rev = self.node_revision()?.clone();
        node_rev.prop_rep = Some(prop_rep);
        self.fs.transactions().put_node_revision(&self.id, node_rev)?;
        self.reload();
        Ok(())
    }

    /// The node's file contents.
    pub fn file_contents(&self) -> DagResult<Vec<u8>> {
        self.ensure_file()?;
        let node_rev = self.node_revision()?;
        match &node_rev.data_rep {
            Some(key) => self.fs.representations().read_data(key),
            None => Ok(vec![]),
        }
    }

    /// Opens a mutable text stream over this file node. Only one stream may
    /// be open at a time; the node records the open stream in its edit key.
    pub fn open_edit_stream(&mut self, _txn_id: &TxnId) -> DagResult<EditStream> {
        self.ensure_file()?;
        self.ensure_mutable()?;
        let mut node_rev = self.node_revision()?.clone();
        if node_rev.edit_key.is_some() {
            return Err(DagError::Other(
                format!("{}: edit stream already open", self.created_path).into(),
            ));
        }
        let edit_key = self.id.node_id.hex();
        node_rev.edit_key = Some(edit_key.clone());
        self.fs.transactions().put_node_revision(&self.id, node_rev)?;
        self.reload();
        Ok(EditStream {
            edit_key,
            buffer: vec![],
        })
    }

    /// Closes an edit stream, installing its content as the node's new data
    /// representation. When `expected_checksum` is given it is compared
    /// against the stream's running content hash; on mismatch the stream is
    /// still closed but the node's data is left untouched.
    pub fn finalize_edits(
        &mut self,
        stream: EditStream,
        expected_checksum: Option<&str>,
    ) -> DagResult<()> {
        let actual = hex::encode(Blake2b512::digest(&stream.buffer));
        let checksum_ok = expected_checksum.is_none_or(|expected| expected == actual);
        let mut node_rev = self.node_revision()?.clone();
        node_rev.edit_key = None;
        if checksum_ok {
            node_rev.data_rep = Some(self.fs.representations().write_data(&stream.buffer)?);
        }
        self.fs.transactions().put_node_revision(&self.id, node_rev)?;
        self.reload();
        if !checksum_ok {
            return Err(DagError::ChecksumMismatch {
                expected: expected_checksum.unwrap().to_owned(),
                actual,
            });
        }
        Ok(())
    }
}

/// A mutable text stream opened by [`DagNode::open_edit_stream`].
#[derive(Debug)]
pub struct EditStream {
    #[expect(dead_code)] // ties the stream to the node's recorded edit key
    edit_key: String,
    buffer: Vec<u8>,
}

impl EditStream {
    /// Appends `data` to the stream.
    pub fn write_all(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// The hex checksum of everything written so far.
    pub fn checksum(&self) -> String {
        hex::encode(Blake2b512::digest(&self.buffer))
    }
}

/// Returns a mutable handle to the transaction's root directory, cloning it
/// from the base root first if the transaction hasn't diverged yet.
pub fn clone_root(fs: &Arc<DagFs>, txn_id: &TxnId) -> DagResult<DagNode> {
    let txns = fs.transactions();
    let root_id = txns.txn_root(txn_id)?;
    let base_id = txns.txn_base_root(txn_id)?;
    if root_id != base_id {
        // Already cloned by an earlier mutation in this transaction.
        return get_node(fs, &root_id);
    }
    let mut root_rev = txns.get_node_revision(&base_id)?;
    root_rev.predecessor = Some(base_id.clone());
    root_rev.predecessor_count = root_rev.predecessor_count.map(|count| count + 1);
    let new_id = txns.create_successor(&base_id, root_rev, &base_id.copy_id, txn_id)?;
    txns.set_txn_root(txn_id, &new_id)?;
    get_node(fs, &new_id)
}

/// Compares the property and data representations of two nodes, returning
/// `(props_changed, contents_changed)`. Equal rep keys mean unchanged; this
/// is a conservative pointer-level comparison, not a content comparison.
pub fn things_different(n1: &DagNode, n2: &DagNode) -> DagResult<(bool, bool)> {
    let rev1 = n1.node_revision()?;
    let rev2 = n2.node_revision()?;
    Ok((rev1.prop_rep != rev2.prop_rep, rev1.data_rep != rev2.data_rep))
}

/// Resolves a slash-separated path from `root`, failing `NotFound` when an
/// entry is missing and `NotDirectory` when traversal hits a file.
pub fn open_path(fs: &Arc<DagFs>, root: &DagNode, path: &WcPath) -> DagResult<DagNode> {
    let mut current = get_node(fs, root.id())?;
    for name in path.components() {
        let entries = current.dir_entries()?;
        let entry = entries.get(name).ok_or_else(|| DagError::NotFound {
            object_type: "entry".to_string(),
            hash: join_created_path(current.created_path(), name),
        })?;
        current = get_node(fs, &entry.id)?;
    }
    Ok(current)
}

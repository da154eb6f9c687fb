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

use arbor_lib::dag_node;
use arbor_lib::dag_node::DagNode;
use arbor_lib::dag_node::clone_root;
use arbor_lib::dag_node::get_node;
use arbor_lib::dag_node::open_path;
use arbor_lib::dag_node::things_different;
use arbor_lib::dag_store::DagError;
use arbor_lib::dag_store::NodeRevId;
use arbor_lib::dag_store::TransactionStore as _;
use arbor_lib::dag_store::TxnId;
use arbor_lib::props::PropList;
use arbor_lib::repo_path::DirentName;
use arbor_lib::repo_path::WcPath;
use assert_matches::assert_matches;
use testutils::TestFs;

fn name(value: &str) -> &DirentName {
    DirentName::new(value).unwrap()
}

fn wc_path(value: &str) -> &WcPath {
    WcPath::from_internal_string(value).unwrap()
}

/// Commits a `dir/file` tree with the given file contents, returning the
/// new revision number.
fn commit_dir_file_tree(test: &TestFs, contents: &[u8]) -> u64 {
    let txn = test.store.begin_txn().unwrap();
    let mut root = clone_root(&test.fs, &txn).unwrap();
    let mut dir = root.make_dir("/", "dir", &txn).unwrap();
    let mut file = dir.make_file("/dir", "file", &txn).unwrap();
    let mut stream = file.open_edit_stream(&txn).unwrap();
    stream.write_all(contents);
    file.finalize_edits(stream, None).unwrap();
    test.store.commit_txn(&txn).unwrap()
}

/// Checks that every node reachable from the transaction root is either
/// mutable in that transaction or committed, and that directory entries
/// never name an ancestor of their directory.
fn check_reachable_invariants(test: &TestFs, root: &DagNode, txn: &TxnId) {
    assert!(
        root.id().is_mutable_in(txn) || root.id().revision().is_some(),
        "{:?} is neither mutable in the transaction nor committed",
        root.id()
    );
    if !root.is_dir() {
        return;
    }
    for entry in root.dir_entries().unwrap().values() {
        let child = get_node(&test.fs, &entry.id).unwrap();
        let cycle = root.id() == &entry.id || child.is_ancestor_of(root).unwrap();
        assert!(!cycle, "directory entry names an ancestor");
        check_reachable_invariants(test, &child, txn);
    }
}

#[test]
fn test_make_entry_then_open_returns_same_node() {
    let test = TestFs::init();
    let txn = test.store.begin_txn().unwrap();
    let mut root = clone_root(&test.fs, &txn).unwrap();
    let file = root.make_file("/", "greeting", &txn).unwrap();
    let entries = root.dir_entries().unwrap();
    assert_eq!(&entries[name("greeting")].id, file.id());
    let reopened = get_node(&test.fs, file.id()).unwrap();
    assert_eq!(reopened.id(), file.id());
    assert_eq!(reopened.created_path(), "/greeting");
}

#[test]
fn test_make_entry_rejects_duplicates_and_bad_names() {
    let test = TestFs::init();
    let txn = test.store.begin_txn().unwrap();
    let mut root = clone_root(&test.fs, &txn).unwrap();
    root.make_file("/", "x", &txn).unwrap();
    assert_matches!(
        root.make_file("/", "x", &txn),
        Err(DagError::AlreadyExists { .. })
    );
    assert_matches!(
        root.make_dir("/", "a/b", &txn),
        Err(DagError::NotSinglePathComponent { .. })
    );
    assert_matches!(
        root.make_dir("/", "..", &txn),
        Err(DagError::NotSinglePathComponent { .. })
    );
}

#[test]
fn test_mutation_refuses_immutable_node() {
    let test = TestFs::init();
    commit_dir_file_tree(&test, b"contents\n");
    let txn = test.store.begin_txn().unwrap();
    let root_id = test.store.revision_root(1).unwrap();
    let mut committed_root = get_node(&test.fs, &root_id).unwrap();
    assert_matches!(
        committed_root.make_file("/", "new", &txn),
        Err(DagError::NotMutable { .. })
    );
    assert_matches!(
        committed_root.delete(name("dir"), false, &txn),
        Err(DagError::NotMutable { .. })
    );
}

#[test]
fn test_clone_child_chain() {
    // Start from committed root/dir/file, clone the path mutable, and
    // check identities line up.
    let test = TestFs::init();
    let revision = commit_dir_file_tree(&test, b"contents\n");
    assert_eq!(revision, 1);
    let old_file_id = {
        let root = get_node(&test.fs, &test.store.revision_root(1).unwrap()).unwrap();
        let file = open_path(&test.fs, &root, wc_path("dir/file")).unwrap();
        file.id().clone()
    };

    let txn = test.store.begin_txn().unwrap();
    let mut root = clone_root(&test.fs, &txn).unwrap();
    let root_copy_id = root.id().copy_id.clone();
    let mut dir = root
        .clone_child("/", name("dir"), &root_copy_id, &txn)
        .unwrap();
    let file = dir
        .clone_child("/dir", name("file"), &dir.id().copy_id.clone(), &txn)
        .unwrap();

    assert!(root.check_mutable(&txn));
    assert!(dir.check_mutable(&txn));
    assert!(file.check_mutable(&txn));
    assert_eq!(&root.dir_entries().unwrap()[name("dir")].id, dir.id());
    assert_eq!(&dir.dir_entries().unwrap()[name("file")].id, file.id());
    assert_eq!(
        file.node_revision().unwrap().predecessor.as_ref(),
        Some(&old_file_id)
    );
    // Cloning again within the same transaction returns the mutable node.
    let again = root
        .clone_child("/", name("dir"), &root_copy_id, &txn)
        .unwrap();
    assert_eq!(again.id(), dir.id());

    check_reachable_invariants(&test, &root, &txn);
}

#[test]
fn test_check_mutable_ignores_which_transaction() {
    // Mutability only checks that the node is in *a* transaction; the
    // strict same-transaction comparison lives on NodeRevId.
    let test = TestFs::init();
    let txn = test.store.begin_txn().unwrap();
    let mut root = clone_root(&test.fs, &txn).unwrap();
    let file = root.make_file("/", "f", &txn).unwrap();
    let other_txn = test.store.begin_txn().unwrap();
    assert!(file.check_mutable(&other_txn));
    assert!(!file.id().is_mutable_in(&other_txn));
    assert!(file.id().is_mutable_in(&txn));
}

#[test]
fn test_walk_predecessors_order_and_exhaustion() {
    let test = TestFs::init();
    commit_dir_file_tree(&test, b"one\n");

    // Two more committed generations of the same file.
    for generation in [b"two\n".as_slice(), b"three\n"] {
        let txn = test.store.begin_txn().unwrap();
        let mut root = clone_root(&test.fs, &txn).unwrap();
        let root_copy_id = root.id().copy_id.clone();
        let mut dir = root
            .clone_child("/", name("dir"), &root_copy_id, &txn)
            .unwrap();
        let mut file = dir
            .clone_child("/dir", name("file"), &dir.id().copy_id.clone(), &txn)
            .unwrap();
        let mut stream = file.open_edit_stream(&txn).unwrap();
        stream.write_all(generation);
        file.finalize_edits(stream, None).unwrap();
        test.store.commit_txn(&txn).unwrap();
    }

    let root = get_node(&test.fs, &test.store.revision_root(3).unwrap()).unwrap();
    let file = open_path(&test.fs, &root, wc_path("dir/file")).unwrap();
    let mut visited = vec![];
    let mut saw_exhaustion = false;
    file.walk_predecessors(|current, _done| {
        match current {
            Some(node) => visited.push(node.id().revision()),
            None => saw_exhaustion = true,
        }
        Ok(())
    })
    .unwrap();
    // Newest to oldest, excluding the node itself, then the null call.
    assert_eq!(visited, [Some(2), Some(1)]);
    assert!(saw_exhaustion);

    // An early stop suppresses both the rest of the chain and the null
    // call.
    let mut steps = 0;
    file.walk_predecessors(|current, done| {
        assert!(current.is_some());
        steps += 1;
        *done = true;
        Ok(())
    })
    .unwrap();
    assert_eq!(steps, 1);
}

#[test]
fn test_ancestry_relations() {
    let test = TestFs::init();
    commit_dir_file_tree(&test, b"one\n");
    let txn = test.store.begin_txn().unwrap();
    let mut root = clone_root(&test.fs, &txn).unwrap();
    let root_copy_id = root.id().copy_id.clone();
    let mut dir = root
        .clone_child("/", name("dir"), &root_copy_id, &txn)
        .unwrap();
    let new_file = dir
        .clone_child("/dir", name("file"), &dir.id().copy_id.clone(), &txn)
        .unwrap();

    let committed_root = get_node(&test.fs, &test.store.revision_root(1).unwrap()).unwrap();
    let old_file = open_path(&test.fs, &committed_root, wc_path("dir/file")).unwrap();

    assert!(old_file.is_parent_of(&new_file).unwrap());
    assert!(old_file.is_ancestor_of(&new_file).unwrap());
    // is-parent implies is-ancestor implies is-related.
    assert!(old_file.id().is_related(new_file.id()));
    // Not the other way around.
    assert!(!new_file.is_ancestor_of(&old_file).unwrap());
    // Unrelated nodes are never ancestors, whatever their history.
    assert!(!old_file.is_ancestor_of(&dir).unwrap());
    assert!(!old_file.is_parent_of(&dir).unwrap());
}

#[test]
fn test_copy_soft_aliases_source() {
    let test = TestFs::init();
    commit_dir_file_tree(&test, b"contents\n");
    let txn = test.store.begin_txn().unwrap();
    let mut root = clone_root(&test.fs, &txn).unwrap();
    let committed_root = get_node(&test.fs, &test.store.revision_root(1).unwrap()).unwrap();
    let source = open_path(&test.fs, &committed_root, wc_path("dir/file")).unwrap();

    root.copy(name("alias"), &source, false, 1, "/dir/file", &txn)
        .unwrap();
    let entries = root.dir_entries().unwrap();
    assert_eq!(&entries[name("alias")].id, source.id());
}

#[test]
fn test_copy_with_history_starts_new_lineage() {
    let test = TestFs::init();
    commit_dir_file_tree(&test, b"contents\n");
    let txn = test.store.begin_txn().unwrap();
    let mut root = clone_root(&test.fs, &txn).unwrap();
    let committed_root = get_node(&test.fs, &test.store.revision_root(1).unwrap()).unwrap();
    let source = open_path(&test.fs, &committed_root, wc_path("dir/file")).unwrap();

    root.copy(name("copied"), &source, true, 1, "/dir/file", &txn)
        .unwrap();
    let entries = root.dir_entries().unwrap();
    let copy = get_node(&test.fs, &entries[name("copied")].id).unwrap();
    let copy_rev = copy.node_revision().unwrap();
    assert_eq!(copy_rev.copyfrom.as_ref().map(|c| c.path.as_str()), Some("/dir/file"));
    assert_eq!(copy_rev.copyfrom.as_ref().map(|c| c.revision), Some(1));
    // The copy roots its own lineage under a fresh copy id.
    assert_eq!(copy_rev.copyroot.as_ref(), Some(copy.id()));
    assert_ne!(copy.id().copy_id, source.id().copy_id);
    assert_eq!(copy_rev.predecessor.as_ref(), Some(source.id()));
    assert!(source.id().is_related(copy.id()));
}

#[test]
fn test_delete_entry_and_require_empty() {
    let test = TestFs::init();
    commit_dir_file_tree(&test, b"contents\n");
    let txn = test.store.begin_txn().unwrap();
    let mut root = clone_root(&test.fs, &txn).unwrap();

    assert_matches!(
        root.delete(name("dir"), true, &txn),
        Err(DagError::DirectoryNotEmpty { .. })
    );
    root.delete(name("dir"), false, &txn).unwrap();
    assert!(root.dir_entries().unwrap().is_empty());
    assert_matches!(
        root.delete(name("dir"), false, &txn),
        Err(DagError::NotFound { .. })
    );
}

#[test]
fn test_finalize_edits_checksum() {
    let test = TestFs::init();
    let txn = test.store.begin_txn().unwrap();
    let mut root = clone_root(&test.fs, &txn).unwrap();
    let mut file = root.make_file("/", "f", &txn).unwrap();

    let mut stream = file.open_edit_stream(&txn).unwrap();
    stream.write_all(b"payload");
    let good_checksum = stream.checksum();
    assert_matches!(
        file.finalize_edits(stream, Some("0badc0de")),
        Err(DagError::ChecksumMismatch { .. })
    );

    // The failed close released the edit key, so a new stream may open.
    let mut stream = file.open_edit_stream(&txn).unwrap();
    stream.write_all(b"payload");
    file.finalize_edits(stream, Some(&good_checksum)).unwrap();
    assert_eq!(file.file_contents().unwrap(), b"payload");
}

#[test]
fn test_edit_stream_exclusive() {
    let test = TestFs::init();
    let txn = test.store.begin_txn().unwrap();
    let mut root = clone_root(&test.fs, &txn).unwrap();
    let mut file = root.make_file("/", "f", &txn).unwrap();
    let _stream = file.open_edit_stream(&txn).unwrap();
    assert_matches!(file.open_edit_stream(&txn), Err(DagError::Other(_)));
}

#[test]
fn test_things_different_compares_rep_keys() {
    let test = TestFs::init();
    let txn = test.store.begin_txn().unwrap();
    let mut root = clone_root(&test.fs, &txn).unwrap();
    let mut a = root.make_file("/", "a", &txn).unwrap();
    let mut b = root.make_file("/", "b", &txn).unwrap();

    for file in [&mut a, &mut b] {
        let mut stream = file.open_edit_stream(&txn).unwrap();
        stream.write_all(b"same\n");
        file.finalize_edits(stream, None).unwrap();
    }
    assert_eq!(things_different(&a, &b).unwrap(), (false, false));

    let mut props = PropList::new();
    props.insert("color".to_owned(), "red".to_owned());
    a.set_proplist(&props, &txn).unwrap();
    assert_eq!(things_different(&a, &b).unwrap(), (true, false));

    let mut stream = b.open_edit_stream(&txn).unwrap();
    stream.write_all(b"different\n");
    b.finalize_edits(stream, None).unwrap();
    assert_eq!(things_different(&a, &b).unwrap(), (true, true));
    assert_eq!(a.proplist().unwrap(), props);
}

#[test]
fn test_clone_root_is_idempotent_per_txn() {
    let test = TestFs::init();
    let txn = test.store.begin_txn().unwrap();
    let first = clone_root(&test.fs, &txn).unwrap();
    assert!(first.id().is_mutable_in(&txn));
    assert_ne!(Some(first.id()), test.store.txn_base_root(&txn).ok().as_ref());
    let second = clone_root(&test.fs, &txn).unwrap();
    assert_eq!(first.id(), second.id());
}

#[test]
fn test_commit_promotes_whole_tree() {
    let test = TestFs::init();
    commit_dir_file_tree(&test, b"v1\n");
    let txn = test.store.begin_txn().unwrap();
    let mut root = clone_root(&test.fs, &txn).unwrap();
    let root_copy_id = root.id().copy_id.clone();
    let mut dir = root
        .clone_child("/", name("dir"), &root_copy_id, &txn)
        .unwrap();
    let mut file = dir
        .clone_child("/dir", name("file"), &dir.id().copy_id.clone(), &txn)
        .unwrap();
    let mut stream = file.open_edit_stream(&txn).unwrap();
    stream.write_all(b"v2\n");
    file.finalize_edits(stream, None).unwrap();

    let revision = test.store.commit_txn(&txn).unwrap();
    assert_eq!(revision, 2);
    assert_eq!(test.store.head_revision(), 2);

    fn assert_committed(test: &TestFs, node: &DagNode, revision: u64) {
        assert_eq!(node.id().revision(), Some(revision));
        if node.is_dir() {
            for entry in node.dir_entries().unwrap().values() {
                let child = get_node(&test.fs, &entry.id).unwrap();
                assert_committed(test, &child, revision);
            }
        }
    }
    let new_root = get_node(&test.fs, &test.store.revision_root(2).unwrap()).unwrap();
    assert_committed(&test, &new_root, 2);
    let new_file = open_path(&test.fs, &new_root, wc_path("dir/file")).unwrap();
    assert_eq!(new_file.file_contents().unwrap(), b"v2\n");
    // Predecessor chains survive promotion.
    let old_root = get_node(&test.fs, &test.store.revision_root(1).unwrap()).unwrap();
    let old_file = open_path(&test.fs, &old_root, wc_path("dir/file")).unwrap();
    assert!(old_file.is_parent_of(&new_file).unwrap());
    // The transaction is gone.
    assert_matches!(test.store.txn_root(&txn), Err(DagError::NotFound { .. }));
}

#[test]
fn test_open_path_failures() {
    let test = TestFs::init();
    commit_dir_file_tree(&test, b"contents\n");
    let root = get_node(&test.fs, &test.store.revision_root(1).unwrap()).unwrap();
    assert_matches!(
        open_path(&test.fs, &root, wc_path("dir/absent")),
        Err(DagError::NotFound { .. })
    );
    assert_matches!(
        open_path(&test.fs, &root, wc_path("dir/file/deeper")),
        Err(DagError::NotDirectory { .. })
    );
    let file = open_path(&test.fs, &root, wc_path("dir/file")).unwrap();
    assert_eq!(file.created_path(), "/dir/file");
    assert_matches!(file.dir_entries(), Err(DagError::NotDirectory { .. }));
    assert_matches!(
        dag_node::get_node(
            &test.fs,
            &NodeRevId::in_revision(
                arbor_lib::dag_store::NodeId::from_bytes(b"nope"),
                arbor_lib::dag_store::CopyId::from_bytes(b"nope"),
                1,
            )
        ),
        Err(DagError::NotFound { .. })
    );
}

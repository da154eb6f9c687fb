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

//! Scaffolding shared by the arbor-lib integration tests.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use arbor_lib::admin::AdminArea;
use arbor_lib::admin::Entry;
use arbor_lib::dag_store::DagFs;
use arbor_lib::dag_store::NodeKind;
use arbor_lib::dag_store::RevisionNumber;
use arbor_lib::simple_dag_store::SimpleDagStore;
use tempfile::TempDir;

/// The URL test working copies are nominally checked out from.
pub const TEST_REPO_URL: &str = "https://repo.example.com/trunk";

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("arbor-test-")
        .tempdir()
        .unwrap()
}

/// An in-memory repository: the simple store wrapped as a [`DagFs`].
pub struct TestFs {
    pub store: Arc<SimpleDagStore>,
    pub fs: Arc<DagFs>,
}

impl TestFs {
    pub fn init() -> Self {
        let store = SimpleDagStore::init();
        let fs = store.to_dag_fs();
        Self { store, fs }
    }
}

/// A versioned directory on disk, rooted in its own temp dir.
pub struct TestWorkingCopy {
    _temp_dir: TempDir,
    pub root: PathBuf,
}

impl TestWorkingCopy {
    /// Creates a fresh working copy versioned at `revision`.
    pub fn init(revision: RevisionNumber) -> Self {
        let temp_dir = new_temp_dir();
        let root = temp_dir.path().join("wc");
        fs::create_dir(&root).unwrap();
        AdminArea::init(&root, revision, Some(TEST_REPO_URL.to_owned())).unwrap();
        Self {
            _temp_dir: temp_dir,
            root,
        }
    }

    pub fn area(&self) -> AdminArea {
        AdminArea::open(&self.root).unwrap()
    }

    /// Records `name` as an unmodified versioned file at `revision`: entry,
    /// pristine text base, and working file all in agreement.
    pub fn add_versioned_file(&self, name: &str, contents: &[u8], revision: RevisionNumber) {
        let area = self.area();
        fs::write(area.text_base_path(name), contents).unwrap();
        fs::write(area.working_file_path(name), contents).unwrap();
        let mut entries = area.load_entries().unwrap();
        let mut entry = Entry::new(NodeKind::File);
        entry.revision = Some(revision);
        entry.url = Some(format!("{TEST_REPO_URL}/{name}"));
        entries.insert(name, entry);
        area.save_entries(&entries).unwrap();
    }

    /// Overwrites the working file, leaving the pristine base alone (a
    /// local modification).
    pub fn write_working(&self, name: &str, contents: &[u8]) {
        fs::write(self.root.join(name), contents).unwrap();
    }

    pub fn read(&self, name: &str) -> Vec<u8> {
        fs::read(self.root.join(name)).unwrap()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.root.join(name).exists()
    }

    pub fn path(&self) -> &Path {
        &self.root
    }
}

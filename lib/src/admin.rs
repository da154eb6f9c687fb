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

//! The per-directory administrative area of a working copy.
//!
//! Every versioned directory carries a `.arbor/` subdirectory holding the
//! entries file, pristine text bases and property bases, working and private
//! property files, the pending-operation log, and the lock sentinel. All
//! state mutations route through [`crate::log_journal`] so that a crash
//! leaves either the old state or a replayable log.

#![expect(missing_docs)]

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use crate::dag_store::NodeKind;
use crate::dag_store::RevisionNumber;
use crate::file_util::IoResultExt as _;
use crate::file_util::create_or_reuse_dir;
use crate::file_util::write_file_atomically;
use crate::lock::FileLock;
use crate::lock::FileLockError;
use crate::props::PropList;
use crate::working_copy::WcError;
use crate::working_copy::WcResult;

/// Name of the administrative subdirectory under each versioned directory.
pub const ADM_DIR_NAME: &str = ".arbor";

/// The entries-file key of the directory's own entry.
pub const THIS_DIR: &str = "";

const TEXT_BASE_SUFFIX: &str = ".base";

/// Milliseconds since the Unix epoch.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct MillisSinceEpoch(pub i64);

/// Reads a file's modification time.
pub fn file_mtime(path: &Path) -> io::Result<MillisSinceEpoch> {
    let modified = fs::metadata(path)?.modified()?;
    let millis = match modified.duration_since(UNIX_EPOCH) {
        Ok(duration) => i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
        Err(before_epoch) => -i64::try_from(before_epoch.duration().as_millis()).unwrap_or(i64::MAX),
    };
    Ok(MillisSinceEpoch(millis))
}

/// A pending local change recorded on an entry.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Schedule {
    #[default]
    Normal,
    Add,
    Delete,
    Replace,
}

/// One versioned child (or the directory itself) as recorded in the entries
/// file.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Entry {
    pub kind: NodeKind,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub revision: Option<RevisionNumber>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub text_time: Option<MillisSinceEpoch>,
    #[serde(default)]
    pub prop_time: Option<MillisSinceEpoch>,
    #[serde(default)]
    pub conflicted: bool,
    /// Name of the reject file recording unmergeable incoming text hunks,
    /// when the entry is conflicted.
    #[serde(default)]
    pub reject_file: Option<String>,
    /// Name of the reject file recording unmergeable incoming property
    /// changes, when the entry is conflicted.
    #[serde(default)]
    pub prop_reject_file: Option<String>,
    #[serde(default)]
    pub committed_rev: Option<RevisionNumber>,
    #[serde(default)]
    pub committed_date: Option<String>,
    #[serde(default)]
    pub last_author: Option<String>,
}

impl Entry {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            schedule: Schedule::Normal,
            revision: None,
            url: None,
            text_time: None,
            prop_time: None,
            conflicted: false,
            reject_file: None,
            prop_reject_file: None,
            committed_rev: None,
            committed_date: None,
            last_author: None,
        }
    }
}

/// The deserialized entries file: basename to entry, with [`THIS_DIR`] as
/// the directory's own key.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Entries {
    entries: BTreeMap<String, Entry>,
}

impl Entries {
    pub fn this_dir(&self) -> Option<&Entry> {
        self.entries.get(THIS_DIR)
    }

    pub fn this_dir_mut(&mut self) -> Option<&mut Entry> {
        self.entries.get_mut(THIS_DIR)
    }

    pub fn get(&self, name: &str) -> Option<&Entry> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Entry> {
        self.entries.get_mut(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, entry: Entry) {
        self.entries.insert(name.into(), entry);
    }

    pub fn remove(&mut self, name: &str) -> Option<Entry> {
        self.entries.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Iterates child entries, skipping the this-dir entry.
    pub fn children(&self) -> impl Iterator<Item = (&str, &Entry)> {
        self.entries
            .iter()
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, entry)| (name.as_str(), entry))
    }
}

/// Handle over one directory's administrative area.
#[derive(Clone, Debug)]
pub struct AdminArea {
    dir_abspath: PathBuf,
}

impl AdminArea {
    pub fn new(dir_abspath: impl Into<PathBuf>) -> Self {
        Self {
            dir_abspath: dir_abspath.into(),
        }
    }

    /// The versioned directory this area administers.
    pub fn dir_path(&self) -> &Path {
        &self.dir_abspath
    }

    fn adm_path(&self) -> PathBuf {
        self.dir_abspath.join(ADM_DIR_NAME)
    }

    /// Whether the directory carries an administrative area.
    pub fn exists(&self) -> bool {
        self.entries_path().is_file()
    }

    /// Creates the administrative layout for a directory entering version
    /// control, recording its this-dir entry at `revision` with `url`.
    pub fn init(
        dir_abspath: impl Into<PathBuf>,
        revision: RevisionNumber,
        url: Option<String>,
    ) -> WcResult<Self> {
        let area = Self::new(dir_abspath);
        let adm = area.adm_path();
        create_or_reuse_dir(&adm).context(&adm)?;
        for sub in [
            "text-base",
            "prop-base",
            "props",
            "wc-props",
            "tmp",
            "tmp/text-base",
            "tmp/prop-base",
            "tmp/props",
        ] {
            let path = adm.join(sub);
            create_or_reuse_dir(&path).context(&path)?;
        }
        let mut entries = Entries::default();
        let mut this_dir = Entry::new(NodeKind::Dir);
        this_dir.revision = Some(revision);
        this_dir.url = url;
        entries.insert(THIS_DIR, this_dir);
        area.save_entries(&entries)?;
        Ok(area)
    }

    /// Opens an existing administrative area.
    pub fn open(dir_abspath: impl Into<PathBuf>) -> WcResult<Self> {
        let area = Self::new(dir_abspath);
        if !area.exists() {
            return Err(WcError::NotWorkingCopyDir {
                path: area.dir_abspath,
            });
        }
        Ok(area)
    }

    /// The administrative area of a child directory.
    pub fn child(&self, name: &str) -> Self {
        Self::new(self.dir_abspath.join(name))
    }

    pub fn entries_path(&self) -> PathBuf {
        self.adm_path().join("entries")
    }

    pub fn log_path(&self) -> PathBuf {
        self.adm_path().join("log")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.adm_path().join("lock")
    }

    pub fn tmp_path(&self) -> PathBuf {
        self.adm_path().join("tmp")
    }

    /// The working file for `name`, i.e. the versioned file itself.
    pub fn working_file_path(&self, name: &str) -> PathBuf {
        self.dir_abspath.join(name)
    }

    pub fn text_base_path(&self, name: &str) -> PathBuf {
        self.adm_path()
            .join("text-base")
            .join(format!("{name}{TEXT_BASE_SUFFIX}"))
    }

    pub fn tmp_text_base_path(&self, name: &str) -> PathBuf {
        self.adm_path()
            .join("tmp/text-base")
            .join(format!("{name}{TEXT_BASE_SUFFIX}"))
    }

    /// Pristine property file; `None` names the directory itself.
    pub fn prop_base_path(&self, name: Option<&str>) -> PathBuf {
        match name {
            Some(name) => self
                .adm_path()
                .join("prop-base")
                .join(format!("{name}{TEXT_BASE_SUFFIX}")),
            None => self.adm_path().join("dir-prop-base"),
        }
    }

    /// Working property file; `None` names the directory itself.
    pub fn prop_working_path(&self, name: Option<&str>) -> PathBuf {
        match name {
            Some(name) => self.adm_path().join("props").join(name),
            None => self.adm_path().join("dir-props"),
        }
    }

    /// Private (unversioned) property store; `None` names the directory.
    pub fn wc_prop_path(&self, name: Option<&str>) -> PathBuf {
        match name {
            Some(name) => self.adm_path().join("wc-props").join(name),
            None => self.adm_path().join("dir-wc-props"),
        }
    }

    pub fn tmp_prop_base_path(&self, name: Option<&str>) -> PathBuf {
        match name {
            Some(name) => self.adm_path().join("tmp/prop-base").join(name),
            None => self.adm_path().join("tmp/dir-prop-base"),
        }
    }

    pub fn tmp_prop_working_path(&self, name: Option<&str>) -> PathBuf {
        match name {
            Some(name) => self.adm_path().join("tmp/props").join(name),
            None => self.adm_path().join("tmp/dir-props"),
        }
    }

    /// A scratch file under `tmp/` for staging merge output.
    pub fn tmp_working_path(&self, name: &str) -> PathBuf {
        self.tmp_path().join(format!("{name}.tmp-working"))
    }

    /// Takes this directory's lock.
    pub fn lock(&self) -> Result<FileLock, FileLockError> {
        FileLock::lock(self.lock_path())
    }

    pub fn load_entries(&self) -> WcResult<Entries> {
        let path = self.entries_path();
        let data = fs::read(&path).context(&path)?;
        serde_json::from_slice(&data).map_err(|err| WcError::Corrupt {
            path,
            source: err.into(),
        })
    }

    pub fn save_entries(&self, entries: &Entries) -> WcResult<()> {
        let data = serde_json::to_vec_pretty(entries).expect("entries must serialize");
        write_file_atomically(&self.entries_path(), &data)?;
        Ok(())
    }

    pub fn load_props(&self, path: &Path) -> WcResult<PropList> {
        crate::props::read_prop_file(path).context(path).map_err(WcError::from)
    }

    /// Renders an absolute path inside this directory as the
    /// directory-relative string used by log commands.
    pub fn rel_str(&self, path: &Path) -> String {
        let relative = path
            .strip_prefix(&self.dir_abspath)
            .expect("path must be inside the directory");
        relative
            .to_str()
            .expect("administrative paths are UTF-8")
            .replace('\\', "/")
    }

    /// Reserves an unused reject-file name beside `name`.
    pub fn reserve_reject_name(&self, name: &str) -> String {
        reserve_sibling_name(&self.dir_abspath, name, "rej")
    }

    /// Reserves an unused property-reject name; `None` names the directory.
    pub fn reserve_prop_reject_name(&self, name: Option<&str>) -> String {
        reserve_sibling_name(&self.dir_abspath, name.unwrap_or("dir_conflicts"), "prej")
    }

    /// Reserves an unused backup name for a working file about to be
    /// overwritten by a binary update.
    pub fn reserve_backup_name(&self, name: &str) -> String {
        reserve_sibling_name(&self.dir_abspath, name, "orig")
    }
}

fn reserve_sibling_name(dir: &Path, name: &str, extension: &str) -> String {
    let candidate = format!("{name}.{extension}");
    if !dir.join(&candidate).exists() {
        return candidate;
    }
    (2..)
        .map(|n| format!("{name}.{extension}.{n}"))
        .find(|candidate| !dir.join(candidate).exists())
        .unwrap()
}

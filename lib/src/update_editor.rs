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

//! The update editor: the callback surface an external delta sender drives
//! to integrate a new revision into the working copy.
//!
//! The sender walks the incoming tree depth-first, opening a scope per
//! directory and file. A directory scope stays alive while any child scope
//! is open (reference counted through [`Rc`] handles, never raw
//! back-pointers); when its count reaches zero it is flushed to the target
//! revision. The first callback error aborts the whole edit; directories
//! whose journal was already appended recover through log replay on the
//! next operation.

#![expect(missing_docs)]

use std::cell::Cell;
use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

use tracing::instrument;

use crate::admin::AdminArea;
use crate::admin::THIS_DIR;
use crate::dag_store::NodeKind;
use crate::dag_store::RevisionNumber;
use crate::delta::DeltaApplier;
use crate::delta::DeltaWindow;
use crate::install::FileInstall;
use crate::install::PropInput;
use crate::install::install_dir_props;
use crate::install::install_file;
use crate::log_journal::EntryMods;
use crate::log_journal::LogCommand;
use crate::log_journal::LogJournal;
use crate::log_journal::run_existing_log;
use crate::props::PropChange;
use crate::props::PropKind;
use crate::props::strip_prop_prefix;
use crate::props::write_prop_file;
use crate::repo_path::DirentName;
use crate::working_copy::WcError;
use crate::working_copy::WcResult;
use crate::working_copy::bump_revisions;
use crate::working_copy::join_url;

/// What kind of edit is being driven.
#[derive(Clone, Debug)]
pub enum EditMode {
    /// Update an existing working copy in place.
    Update,
    /// Create a working copy from nothing; no base state is consulted.
    Checkout { ancestor_url: String },
    /// Retarget the working copy to a different repository URL.
    Switch { switch_url: String },
}

fn protocol_violation(message: &str) -> WcError {
    WcError::Other(format!("editor protocol violation: {message}").into())
}

/// Two URLs that can't belong to the same repository.
fn urls_disjoint(a: &str, b: &str) -> bool {
    fn authority(url: &str) -> Option<&str> {
        let (_, rest) = url.split_once("://")?;
        Some(rest.split('/').next().unwrap_or(rest))
    }
    match (authority(a), authority(b)) {
        (Some(a), Some(b)) => a != b,
        _ => true,
    }
}

#[derive(Debug)]
struct SessionState {
    anchor: AdminArea,
    target: Option<String>,
    mode: EditMode,
    recurse: bool,
    target_revision: Cell<RevisionNumber>,
    root_opened: Cell<bool>,
    closed: Cell<bool>,
    /// Scopes currently open, for the close-edit precondition.
    open_scopes: Cell<u32>,
}

/// The root of one update/checkout/switch edit.
pub struct UpdateEditor {
    session: Rc<SessionState>,
}

/// Per-directory state during one edit.
#[derive(Debug)]
pub struct DirScope {
    session: Rc<SessionState>,
    parent: Option<Rc<DirScope>>,
    area: AdminArea,
    /// The directory's URL in the incoming layout, when the mode derives
    /// one (checkout and switch). `None` during plain updates.
    url: Option<String>,
    ref_count: Cell<u32>,
    prop_changes: RefCell<Vec<PropChange>>,
}

/// Per-file state during one edit.
#[derive(Debug)]
pub struct FileScope {
    dir: Rc<DirScope>,
    name: String,
    added: bool,
    text_changed: Cell<bool>,
    delta_opened: Cell<bool>,
    staged_base: RefCell<Option<std::path::PathBuf>>,
    prop_changes: RefCell<Vec<PropChange>>,
    closed: Cell<bool>,
}

impl FileScope {
    /// Whether a text delta completed for this file.
    pub fn text_changed(&self) -> bool {
        self.text_changed.get()
    }
}

impl UpdateEditor {
    /// Creates an editor rooted at `anchor`, editing `target` inside it (or
    /// the anchor itself), toward `target_revision`.
    pub fn new(
        anchor: &std::path::Path,
        target: Option<String>,
        target_revision: RevisionNumber,
        mode: EditMode,
        recurse: bool,
    ) -> WcResult<Self> {
        if let Some(target) = &target
            && DirentName::new(target).is_err()
        {
            return Err(WcError::NotSinglePathComponent {
                name: target.clone(),
            });
        }
        Ok(Self {
            session: Rc::new(SessionState {
                anchor: AdminArea::new(anchor),
                target,
                mode,
                recurse,
                target_revision: Cell::new(target_revision),
                root_opened: Cell::new(false),
                closed: Cell::new(false),
                open_scopes: Cell::new(0),
            }),
        })
    }

    /// Whether this edit descends into subdirectories.
    pub fn recurse(&self) -> bool {
        self.session.recurse
    }

    /// Announces the revision the edit will arrive at. Called at most once,
    /// before any scope is opened.
    pub fn set_target_revision(&self, revision: RevisionNumber) -> WcResult<()> {
        if self.session.root_opened.get() {
            return Err(protocol_violation("set-target-revision after open-root"));
        }
        self.session.target_revision.set(revision);
        Ok(())
    }

    /// Opens the root directory scope. Called at most once.
    pub fn open_root(&self, _base_revision: Option<RevisionNumber>) -> WcResult<Rc<DirScope>> {
        let session = &self.session;
        if session.root_opened.replace(true) {
            return Err(protocol_violation("open-root called twice"));
        }
        let url = match &session.mode {
            EditMode::Checkout { ancestor_url } => {
                if !session.anchor.exists() {
                    fs::create_dir_all(session.anchor.dir_path()).map_err(|err| {
                        crate::file_util::PathError {
                            path: session.anchor.dir_path().to_path_buf(),
                            source: err,
                        }
                    })?;
                    AdminArea::init(
                        session.anchor.dir_path(),
                        session.target_revision.get(),
                        Some(ancestor_url.clone()),
                    )?;
                }
                Some(ancestor_url.clone())
            }
            EditMode::Update => {
                let anchor = AdminArea::open(session.anchor.dir_path())?;
                run_existing_log(&anchor)?;
                None
            }
            EditMode::Switch { switch_url } => {
                let anchor = AdminArea::open(session.anchor.dir_path())?;
                run_existing_log(&anchor)?;
                let entries = anchor.load_entries()?;
                let wc_url = entries
                    .this_dir()
                    .and_then(|entry| entry.url.clone())
                    .ok_or_else(|| WcError::EntryMissingUrl {
                        name: anchor.dir_path().display().to_string(),
                    })?;
                if urls_disjoint(&wc_url, switch_url) {
                    return Err(WcError::SwitchUrlDisjoint {
                        wc_url,
                        switch_url: switch_url.clone(),
                    });
                }
                Some(switch_url.clone())
            }
        };
        session.open_scopes.set(session.open_scopes.get() + 1);
        Ok(Rc::new(DirScope {
            session: session.clone(),
            parent: None,
            area: AdminArea::open(session.anchor.dir_path())?,
            url,
            ref_count: Cell::new(1),
            prop_changes: RefCell::new(vec![]),
        }))
    }

    /// Journals the removal of `name` under `parent` and runs the log
    /// immediately.
    pub fn delete_entry(
        &self,
        name: &str,
        _revision: Option<RevisionNumber>,
        parent: &Rc<DirScope>,
    ) -> WcResult<()> {
        let name = validated_name(name)?;
        let area = &parent.area;
        let _lock = area.lock()?;
        run_existing_log(area)?;
        let entries = area.load_entries()?;
        let Some(entry) = entries.get(name.as_str()) else {
            return Err(WcError::EntryNotFound {
                name: name.as_str().to_owned(),
            });
        };
        let kind = entry.kind;
        let mut journal = LogJournal::new(area);
        journal.push(LogCommand::DeleteEntry {
            name: name.as_str().to_owned(),
        });
        journal.push(LogCommand::Rm {
            name: name.as_str().to_owned(),
        });
        if kind == NodeKind::File {
            journal.push(LogCommand::Rm {
                name: area.rel_str(&area.text_base_path(name.as_str())),
            });
            journal.push(LogCommand::Rm {
                name: area.rel_str(&area.prop_base_path(Some(name.as_str()))),
            });
            journal.push(LogCommand::Rm {
                name: area.rel_str(&area.prop_working_path(Some(name.as_str()))),
            });
            journal.push(LogCommand::Rm {
                name: area.rel_str(&area.wc_prop_path(Some(name.as_str()))),
            });
        }
        journal.finish()
    }

    /// Adds a directory that doesn't exist on disk yet.
    pub fn add_directory(
        &self,
        name: &str,
        parent: &Rc<DirScope>,
        copyfrom: Option<(&str, RevisionNumber)>,
    ) -> WcResult<Rc<DirScope>> {
        if copyfrom.is_some() {
            return Err(WcError::UnsupportedFeature(
                "copy history on add-directory".to_owned(),
            ));
        }
        let name = validated_name(name)?;
        let disk_path = parent.area.dir_path().join(name.as_str());
        if disk_path.exists() {
            return Err(WcError::ObstructedUpdate { path: disk_path });
        }
        let revision = parent.session.target_revision.get();
        let url = parent
            .url
            .as_deref()
            .map(|parent_url| join_url(parent_url, name.as_str()));

        fs::create_dir(&disk_path).map_err(|err| crate::file_util::PathError {
            path: disk_path.clone(),
            source: err,
        })?;
        AdminArea::init(&disk_path, revision, url.clone())?;

        {
            let area = &parent.area;
            let _lock = area.lock()?;
            run_existing_log(area)?;
            let mut journal = LogJournal::new(area);
            journal.push(LogCommand::ModifyEntry(EntryMods {
                name: name.as_str().to_owned(),
                kind: Some(NodeKind::Dir),
                revision: Some(revision),
                url: url.clone(),
                ..EntryMods::default()
            }));
            journal.finish()?;
        }

        Ok(open_child_dir(parent, &disk_path, url))
    }

    /// Opens an existing versioned directory.
    pub fn open_directory(&self, name: &str, parent: &Rc<DirScope>) -> WcResult<Rc<DirScope>> {
        let name = validated_name(name)?;
        let entries = parent.area.load_entries()?;
        if entries.get(name.as_str()).is_none() {
            return Err(WcError::EntryNotFound {
                name: name.as_str().to_owned(),
            });
        }
        let child_area = AdminArea::open(parent.area.dir_path().join(name.as_str()))?;
        run_existing_log(&child_area)?;
        let url = parent
            .url
            .as_deref()
            .map(|parent_url| join_url(parent_url, name.as_str()));
        Ok(open_child_dir(parent, child_area.dir_path(), url))
    }

    /// Accumulates (or immediately routes) a directory property change.
    pub fn change_dir_prop(
        &self,
        dir: &Rc<DirScope>,
        name: &str,
        value: Option<&str>,
    ) -> WcResult<()> {
        let change = PropChange {
            name: name.to_owned(),
            value: value.map(str::to_owned),
        };
        match PropKind::of(name) {
            PropKind::Wc => store_wc_prop(&dir.area, None, &change),
            PropKind::Entry => store_entry_prop(&dir.area, THIS_DIR, &change),
            PropKind::Regular => {
                dir.prop_changes.borrow_mut().push(change);
                Ok(())
            }
        }
    }

    /// Closes a directory scope: merges accumulated property changes
    /// through the journal, then releases the scope's reference.
    #[instrument(skip_all, fields(dir = ?dir.area.dir_path()))]
    pub fn close_directory(&self, dir: Rc<DirScope>) -> WcResult<()> {
        let changes = std::mem::take(&mut *dir.prop_changes.borrow_mut());
        if !changes.is_empty() {
            install_dir_props(&dir.area, changes, dir.session.target_revision.get())?;
        }
        let session = dir.session.clone();
        session.open_scopes.set(session.open_scopes.get() - 1);
        release_dir(&dir)
    }

    /// Adds a file that doesn't exist on disk yet. Nothing on disk changes
    /// until the file scope closes.
    pub fn add_file(
        &self,
        name: &str,
        parent: &Rc<DirScope>,
        copyfrom: Option<(&str, RevisionNumber)>,
    ) -> WcResult<Rc<FileScope>> {
        if copyfrom.is_some() {
            return Err(WcError::UnsupportedFeature(
                "copy history on add-file".to_owned(),
            ));
        }
        let name = validated_name(name)?;
        let disk_path = parent.area.working_file_path(name.as_str());
        if disk_path.exists() {
            return Err(WcError::ObstructedUpdate { path: disk_path });
        }
        if parent.area.load_entries()?.contains(name.as_str()) {
            return Err(WcError::ObstructedUpdate { path: disk_path });
        }
        Ok(open_file_scope(parent, name.as_str(), true))
    }

    /// Opens an existing versioned file.
    pub fn open_file(&self, name: &str, parent: &Rc<DirScope>) -> WcResult<Rc<FileScope>> {
        let name = validated_name(name)?;
        if parent.area.load_entries()?.get(name.as_str()).is_none() {
            return Err(WcError::EntryNotFound {
                name: name.as_str().to_owned(),
            });
        }
        Ok(open_file_scope(parent, name.as_str(), false))
    }

    /// Prepares the windowed applier for the file's incoming text delta.
    /// Called at most once per file scope.
    pub fn apply_textdelta(&self, file: &Rc<FileScope>) -> WcResult<TextDeltaHandler> {
        if file.delta_opened.replace(true) {
            return Err(protocol_violation("apply-textdelta called twice"));
        }
        let source = if file.added || matches!(file.dir.session.mode, EditMode::Checkout { .. }) {
            // No pristine base exists for a checkout or an added file.
            vec![]
        } else {
            match fs::read(file.dir.area.text_base_path(&file.name)) {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => vec![],
                Err(err) => {
                    return Err(crate::file_util::PathError {
                        path: file.dir.area.text_base_path(&file.name),
                        source: err,
                    }
                    .into());
                }
            }
        };
        Ok(TextDeltaHandler {
            file: file.clone(),
            applier: Some(DeltaApplier::new(source)),
        })
    }

    /// Accumulates a file property change for the installer.
    pub fn change_file_prop(
        &self,
        file: &Rc<FileScope>,
        name: &str,
        value: Option<&str>,
    ) -> WcResult<()> {
        file.prop_changes.borrow_mut().push(PropChange {
            name: name.to_owned(),
            value: value.map(str::to_owned),
        });
        Ok(())
    }

    /// Closes a file scope: installs the new text and properties, then
    /// releases the parent directory's reference.
    #[instrument(skip_all, fields(name = %file.name))]
    pub fn close_file(&self, file: Rc<FileScope>) -> WcResult<()> {
        if file.closed.replace(true) {
            return Err(protocol_violation("close-file called twice"));
        }
        let session = &file.dir.session;
        let staged = file.staged_base.borrow_mut().take();
        let changes = std::mem::take(&mut *file.prop_changes.borrow_mut());
        let new_url = file
            .dir
            .url
            .as_deref()
            .map(|dir_url| join_url(dir_url, &file.name));
        install_file(FileInstall {
            area: &file.dir.area,
            name: &file.name,
            new_revision: session.target_revision.get(),
            new_text_base: staged.as_deref(),
            new_props: (!changes.is_empty()).then_some(PropInput::Diff(changes)),
            new_url,
        })?;
        session.open_scopes.set(session.open_scopes.get() - 1);
        release_dir(&file.dir)
    }

    /// Finishes the edit: requires every scope closed, then bumps the
    /// edited tree to the target revision (rewriting URLs on switch).
    #[instrument(skip_all)]
    pub fn close_edit(&self) -> WcResult<()> {
        let session = &self.session;
        if session.closed.replace(true) {
            return Err(protocol_violation("close-edit called twice"));
        }
        if session.open_scopes.get() != 0 {
            return Err(protocol_violation("close-edit with open scopes"));
        }
        let revision = session.target_revision.get();
        match &session.mode {
            EditMode::Update => {
                bump_revisions(&session.anchor, session.target.as_deref(), revision, None)?;
            }
            EditMode::Switch { switch_url } => {
                // The switch URL names the target subtree itself (or the
                // anchor when there is no target).
                bump_revisions(
                    &session.anchor,
                    session.target.as_deref(),
                    revision,
                    Some(switch_url),
                )?;
            }
            EditMode::Checkout { .. } => {}
        }
        Ok(())
    }
}

fn validated_name(name: &str) -> WcResult<&DirentName> {
    DirentName::new(name).map_err(|err| WcError::NotSinglePathComponent { name: err.value })
}

fn open_child_dir(
    parent: &Rc<DirScope>,
    disk_path: &std::path::Path,
    url: Option<String>,
) -> Rc<DirScope> {
    parent.ref_count.set(parent.ref_count.get() + 1);
    let session = parent.session.clone();
    session.open_scopes.set(session.open_scopes.get() + 1);
    Rc::new(DirScope {
        session,
        parent: Some(parent.clone()),
        area: AdminArea::new(disk_path),
        url,
        ref_count: Cell::new(1),
        prop_changes: RefCell::new(vec![]),
    })
}

fn open_file_scope(parent: &Rc<DirScope>, name: &str, added: bool) -> Rc<FileScope> {
    parent.ref_count.set(parent.ref_count.get() + 1);
    let session = parent.session.clone();
    session.open_scopes.set(session.open_scopes.get() + 1);
    Rc::new(FileScope {
        dir: parent.clone(),
        name: name.to_owned(),
        added,
        text_changed: Cell::new(false),
        delta_opened: Cell::new(false),
        staged_base: RefCell::new(None),
        prop_changes: RefCell::new(vec![]),
        closed: Cell::new(false),
    })
}

/// Decrements a directory's reference count; at zero the directory is
/// flushed to the target revision and its parent released in turn.
fn release_dir(dir: &Rc<DirScope>) -> WcResult<()> {
    let count = dir.ref_count.get() - 1;
    dir.ref_count.set(count);
    if count > 0 {
        return Ok(());
    }
    flush_dir(dir)?;
    match &dir.parent {
        Some(parent) => release_dir(parent),
        None => Ok(()),
    }
}

/// Stamps the directory's own entry at the edit's target revision.
fn flush_dir(dir: &Rc<DirScope>) -> WcResult<()> {
    let area = &dir.area;
    let _lock = area.lock()?;
    run_existing_log(area)?;
    let mut journal = LogJournal::new(area);
    journal.push(LogCommand::ModifyEntry(EntryMods {
        name: THIS_DIR.to_owned(),
        kind: Some(NodeKind::Dir),
        revision: Some(dir.session.target_revision.get()),
        ..EntryMods::default()
    }));
    journal.finish()
}

fn store_wc_prop(area: &AdminArea, name: Option<&str>, change: &PropChange) -> WcResult<()> {
    let path = area.wc_prop_path(name);
    let mut props = area.load_props(&path)?;
    match &change.value {
        Some(value) => {
            props.insert(strip_prop_prefix(&change.name).to_owned(), value.clone());
        }
        None => {
            props.remove(strip_prop_prefix(&change.name));
        }
    }
    write_prop_file(&path, &props)?;
    Ok(())
}

fn store_entry_prop(area: &AdminArea, entry_name: &str, change: &PropChange) -> WcResult<()> {
    let mut entries = area.load_entries()?;
    let Some(entry) = entries.get_mut(entry_name) else {
        return Err(WcError::EntryNotFound {
            name: entry_name.to_owned(),
        });
    };
    let value = change.value.clone();
    match strip_prop_prefix(&change.name) {
        "committed-rev" => entry.committed_rev = value.and_then(|value| value.parse().ok()),
        "committed-date" => entry.committed_date = value,
        "last-author" => entry.last_author = value,
        other => {
            tracing::debug!(name = other, "ignoring unrecognized entry prop");
        }
    }
    area.save_entries(&entries)
}

/// Feeds delta windows for one file; created by
/// [`UpdateEditor::apply_textdelta`].
#[derive(Debug)]
pub struct TextDeltaHandler {
    file: Rc<FileScope>,
    applier: Option<DeltaApplier>,
}

impl TextDeltaHandler {
    /// Applies the next window, or finishes the stream when `window` is
    /// `None`. On success the staged text base is recorded on the file
    /// scope; on error the stream is closed and nothing is staged.
    pub fn window(&mut self, window: Option<&DeltaWindow>) -> WcResult<()> {
        let Some(applier) = self.applier.as_mut() else {
            return Err(protocol_violation("delta window after end of stream"));
        };
        match window {
            Some(window) => {
                if let Err(err) = applier.apply_window(window) {
                    // Error closes the stream; the staging slot was never
                    // populated so there is nothing to clean up.
                    self.applier = None;
                    return Err(err.into());
                }
                Ok(())
            }
            None => {
                let applier = self.applier.take().unwrap();
                let file = &self.file;
                let staged_path = file
                    .dir
                    .area
                    .tmp_path()
                    .join(format!("{}.new-base", file.name));
                crate::file_util::write_file_atomically(&staged_path, &applier.into_target())?;
                *file.staged_base.borrow_mut() = Some(staged_path);
                file.text_changed.set(true);
                Ok(())
            }
        }
    }
}

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

//! Working-copy level helpers shared by the editor, installer, and status:
//! the error taxonomy, anchor/target selection, local-modification checks,
//! and the revision bump that finishes an edit.

#![expect(missing_docs)]

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use bstr::BString;
use thiserror::Error;

use crate::admin::AdminArea;
use crate::admin::Schedule;
use crate::dag_store::NodeKind;
use crate::dag_store::RevisionNumber;
use crate::delta::DeltaError;
use crate::eol::EolStyle;
use crate::file_util::PathError;
use crate::keywords;
use crate::lock::FileLockError;
use crate::props::PROP_EOL_STYLE;
use crate::props::PropList;

/// Error raised by working-copy operations.
#[derive(Debug, Error)]
pub enum WcError {
    /// On-disk state conflicts with an incoming change.
    #[error("Working copy path {path} is obstructed")]
    ObstructedUpdate { path: PathBuf },
    #[error("Entry \"{name}\" not found")]
    EntryNotFound { name: String },
    #[error("Entry \"{name}\" has no URL")]
    EntryMissingUrl { name: String },
    #[error("{path} is not a versioned directory")]
    NotWorkingCopyDir { path: PathBuf },
    #[error("\"{name}\" is not a single path component")]
    NotSinglePathComponent { name: String },
    #[error("Bad file name \"{name}\"")]
    BadFilename { name: String },
    #[error("Editor feature not supported: {0}")]
    UnsupportedFeature(String),
    #[error("Switch URL {switch_url} shares no ancestry with {wc_url}")]
    SwitchUrlDisjoint { wc_url: String, switch_url: String },
    #[error("Corrupt administrative data in {path}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error(transparent)]
    Lock(#[from] FileLockError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Delta(#[from] DeltaError),
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

pub type WcResult<T> = Result<T, WcError>;

/// Joins a repository URL with one path component.
pub fn join_url(base: &str, name: &str) -> String {
    format!("{}/{name}", base.trim_end_matches('/'))
}

/// Splits a URL into its parent and basename, if it has any path.
pub fn split_url(url: &str) -> Option<(&str, &str)> {
    let trimmed = url.trim_end_matches('/');
    let (parent, basename) = trimmed.rsplit_once('/')?;
    // Don't split through the scheme marker.
    if parent.ends_with(':') || parent.ends_with('/') {
        return None;
    }
    Some((parent, basename))
}

/// Whether `dir_abspath` is the root of its working copy: its parent is not
/// versioned, doesn't list it, or doesn't agree about its URL. A root can't
/// be split into anchor and target.
pub fn is_wc_root(dir_abspath: &Path) -> WcResult<bool> {
    let area = AdminArea::open(dir_abspath)?;
    let entries = area.load_entries()?;
    let Some(url) = entries.this_dir().and_then(|entry| entry.url.clone()) else {
        return Err(WcError::EntryMissingUrl {
            name: dir_abspath.display().to_string(),
        });
    };
    let Some(parent_path) = dir_abspath.parent() else {
        return Ok(true);
    };
    let Some(basename) = dir_abspath.file_name().and_then(|name| name.to_str()) else {
        return Ok(true);
    };
    let parent_area = AdminArea::new(parent_path);
    if !parent_area.exists() {
        return Ok(true);
    }
    let parent_entries = parent_area.load_entries()?;
    if !parent_entries.contains(basename) {
        return Ok(true);
    }
    let Some(parent_url) = parent_entries.this_dir().and_then(|entry| entry.url.as_deref())
    else {
        return Ok(true);
    };
    Ok(join_url(parent_url, basename) != url)
}

/// Splits the path to update into the directory the editor roots at and the
/// entry inside it being updated (`None` when the anchor itself is the
/// target).
///
/// Rooting at the parent permits replacing the target with an entity of a
/// different kind; rooting at the path itself is required when its parent
/// lies outside the working copy.
pub fn get_anchor_target(path: &Path) -> WcResult<(PathBuf, Option<String>)> {
    if AdminArea::new(path).exists() && is_wc_root(path)? {
        return Ok((path.to_path_buf(), None));
    }
    let basename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| WcError::BadFilename {
            name: path.display().to_string(),
        })?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((parent, Some(basename.to_owned())))
}

/// Translates working-file bytes to repository normal form: LF line endings
/// (when an `eol-style` applies) and contracted keywords.
pub fn repository_normal_form(bytes: &[u8], working_props: &PropList) -> BString {
    let eol_active = working_props
        .get(PROP_EOL_STYLE)
        .and_then(|value| EolStyle::from_prop_value(value))
        .is_some();
    let normalized: BString = if eol_active {
        // Repair unconditionally; local edits may have mixed line endings.
        crate::eol::translate_eol(bytes, b"\n", true).expect("repair mode cannot fail")
    } else {
        bytes.into()
    };
    keywords::contract_keywords(&normalized)
}

/// Whether the working file differs from its pristine text base, comparing
/// in repository normal form. A missing working file reads unmodified; a
/// missing text base (e.g. a scheduled add) reads modified.
pub fn text_modified(area: &AdminArea, name: &str) -> WcResult<bool> {
    let working_path = area.working_file_path(name);
    let working = match fs::read(&working_path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(PathError {
                path: working_path,
                source: err,
            }
            .into());
        }
    };
    let base_path = area.text_base_path(name);
    let base = match fs::read(&base_path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(err) => {
            return Err(PathError {
                path: base_path,
                source: err,
            }
            .into());
        }
    };
    let working_props = area.load_props(&area.prop_working_path(Some(name)))?;
    Ok(repository_normal_form(&working, &working_props) != base.as_slice())
}

/// Whether the working property list differs from the pristine one.
pub fn props_modified(area: &AdminArea, name: Option<&str>) -> WcResult<bool> {
    let working = area.load_props(&area.prop_working_path(name))?;
    let base = area.load_props(&area.prop_base_path(name))?;
    Ok(working != base)
}

/// Recursively stamps entries under `area` with the revision an edit
/// finished at, rewriting URLs when `switch_url` retargets the tree. Only
/// entries with no pending schedule are bumped.
pub fn bump_revisions(
    area: &AdminArea,
    target: Option<&str>,
    revision: RevisionNumber,
    switch_url: Option<&str>,
) -> WcResult<()> {
    match target {
        None => bump_dir(area, revision, switch_url),
        Some(name) => {
            let mut entries = area.load_entries()?;
            let Some(entry) = entries.get_mut(name) else {
                // The target may have been deleted by the edit.
                return Ok(());
            };
            let kind = entry.kind;
            if entry.schedule == Schedule::Normal {
                entry.revision = Some(revision);
                if let Some(url) = switch_url {
                    entry.url = Some(url.to_owned());
                }
                area.save_entries(&entries)?;
            }
            if kind == NodeKind::Dir {
                let child = area.child(name);
                if child.exists() {
                    bump_dir(&child, revision, switch_url)?;
                }
            }
            Ok(())
        }
    }
}

fn bump_dir(area: &AdminArea, revision: RevisionNumber, switch_url: Option<&str>) -> WcResult<()> {
    let mut entries = area.load_entries()?;
    let mut subdirs = vec![];
    if let Some(this_dir) = entries.this_dir_mut()
        && this_dir.schedule == Schedule::Normal
    {
        this_dir.revision = Some(revision);
        if let Some(url) = switch_url {
            this_dir.url = Some(url.to_owned());
        }
    }
    let child_names: Vec<String> = entries.children().map(|(name, _)| name.to_owned()).collect();
    for name in child_names {
        let entry = entries.get_mut(&name).unwrap();
        if entry.schedule != Schedule::Normal {
            continue;
        }
        entry.revision = Some(revision);
        if let Some(url) = switch_url {
            entry.url = Some(join_url(url, &name));
        }
        if entry.kind == NodeKind::Dir {
            subdirs.push(name);
        }
    }
    area.save_entries(&entries)?;
    for name in subdirs {
        let child = area.child(&name);
        if child.exists() {
            let child_url = switch_url.map(|url| join_url(url, &name));
            bump_dir(&child, revision, child_url.as_deref())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::admin::Entry;

    fn init_versioned(dir: &Path, url: &str) -> AdminArea {
        AdminArea::init(dir, 1, Some(url.to_owned())).unwrap()
    }

    #[test]
    fn test_join_split_url() {
        assert_eq!(join_url("https://host/repo", "dir"), "https://host/repo/dir");
        assert_eq!(join_url("https://host/repo/", "dir"), "https://host/repo/dir");
        assert_eq!(
            split_url("https://host/repo/dir"),
            Some(("https://host/repo", "dir"))
        );
        assert_eq!(split_url("https:"), None);
    }

    #[test]
    fn test_wc_root_no_versioned_parent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let wc = temp_dir.path().join("wc");
        fs::create_dir(&wc).unwrap();
        init_versioned(&wc, "https://host/trunk");
        assert!(is_wc_root(&wc).unwrap());
    }

    #[test]
    fn test_wc_child_is_not_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let wc = temp_dir.path().join("wc");
        let sub = wc.join("sub");
        fs::create_dir_all(&sub).unwrap();
        let parent = init_versioned(&wc, "https://host/trunk");
        init_versioned(&sub, "https://host/trunk/sub");
        let mut entries = parent.load_entries().unwrap();
        let mut entry = Entry::new(NodeKind::Dir);
        entry.revision = Some(1);
        entries.insert("sub", entry);
        parent.save_entries(&entries).unwrap();
        assert!(!is_wc_root(&sub).unwrap());
    }

    #[test]
    fn test_switched_subdir_is_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let wc = temp_dir.path().join("wc");
        let sub = wc.join("sub");
        fs::create_dir_all(&sub).unwrap();
        let parent = init_versioned(&wc, "https://host/trunk");
        // URL doesn't line up with parent's: a switched subtree.
        init_versioned(&sub, "https://host/branches/b/sub");
        let mut entries = parent.load_entries().unwrap();
        entries.insert("sub", Entry::new(NodeKind::Dir));
        parent.save_entries(&entries).unwrap();
        assert!(is_wc_root(&sub).unwrap());
    }

    #[test]
    fn test_anchor_target_for_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let wc = temp_dir.path().join("wc");
        fs::create_dir(&wc).unwrap();
        init_versioned(&wc, "https://host/trunk");
        let (anchor, target) = get_anchor_target(&wc.join("file.txt")).unwrap();
        assert_eq!(anchor, wc);
        assert_eq!(target.as_deref(), Some("file.txt"));
    }

    #[test]
    fn test_anchor_target_for_wc_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let wc = temp_dir.path().join("wc");
        fs::create_dir(&wc).unwrap();
        init_versioned(&wc, "https://host/trunk");
        let (anchor, target) = get_anchor_target(&wc).unwrap();
        assert_eq!(anchor, wc);
        assert_eq!(target, None);
    }

    #[test]
    fn test_text_modified() {
        let temp_dir = tempfile::tempdir().unwrap();
        let area = init_versioned(temp_dir.path(), "https://host/trunk");
        fs::write(area.text_base_path("f"), b"pristine\n").unwrap();
        fs::write(area.working_file_path("f"), b"pristine\n").unwrap();
        assert!(!text_modified(&area, "f").unwrap());
        fs::write(area.working_file_path("f"), b"edited\n").unwrap();
        assert!(text_modified(&area, "f").unwrap());
        // Missing working file counts as unmodified.
        fs::remove_file(area.working_file_path("f")).unwrap();
        assert!(!text_modified(&area, "f").unwrap());
    }

    #[test]
    fn test_text_modified_ignores_eol_differences() {
        let temp_dir = tempfile::tempdir().unwrap();
        let area = init_versioned(temp_dir.path(), "https://host/trunk");
        fs::write(area.text_base_path("f"), b"a\nb\n").unwrap();
        fs::write(area.working_file_path("f"), b"a\r\nb\r\n").unwrap();
        let mut props = PropList::new();
        props.insert(PROP_EOL_STYLE.to_owned(), "CRLF".to_owned());
        crate::props::write_prop_file(&area.prop_working_path(Some("f")), &props).unwrap();
        assert!(!text_modified(&area, "f").unwrap());
    }

    #[test]
    fn test_props_modified() {
        let temp_dir = tempfile::tempdir().unwrap();
        let area = init_versioned(temp_dir.path(), "https://host/trunk");
        assert!(!props_modified(&area, Some("f")).unwrap());
        let mut props = PropList::new();
        props.insert("color".to_owned(), "green".to_owned());
        crate::props::write_prop_file(&area.prop_working_path(Some("f")), &props).unwrap();
        assert!(props_modified(&area, Some("f")).unwrap());
    }

    #[test]
    fn test_bump_revisions_recursive() {
        let temp_dir = tempfile::tempdir().unwrap();
        let wc = temp_dir.path().join("wc");
        let sub = wc.join("sub");
        fs::create_dir_all(&sub).unwrap();
        let parent = init_versioned(&wc, "https://host/trunk");
        init_versioned(&sub, "https://host/trunk/sub");
        let mut entries = parent.load_entries().unwrap();
        let mut file_entry = Entry::new(NodeKind::File);
        file_entry.revision = Some(1);
        entries.insert("f", file_entry);
        let mut added = Entry::new(NodeKind::File);
        added.schedule = Schedule::Add;
        entries.insert("new", added);
        entries.insert("sub", Entry::new(NodeKind::Dir));
        parent.save_entries(&entries).unwrap();

        bump_revisions(&parent, None, 9, None).unwrap();
        let entries = parent.load_entries().unwrap();
        assert_eq!(entries.this_dir().unwrap().revision, Some(9));
        assert_eq!(entries.get("f").unwrap().revision, Some(9));
        // Scheduled adds keep their pending state.
        assert_eq!(entries.get("new").unwrap().revision, None);
        let sub_entries = AdminArea::new(&sub).load_entries().unwrap();
        assert_eq!(sub_entries.this_dir().unwrap().revision, Some(9));
    }

    #[test]
    fn test_bump_revisions_switch_rewrites_urls() {
        let temp_dir = tempfile::tempdir().unwrap();
        let wc = temp_dir.path().join("wc");
        fs::create_dir_all(&wc).unwrap();
        let area = init_versioned(&wc, "https://host/trunk");
        let mut entries = area.load_entries().unwrap();
        let mut file_entry = Entry::new(NodeKind::File);
        file_entry.url = Some("https://host/trunk/f".to_owned());
        entries.insert("f", file_entry);
        area.save_entries(&entries).unwrap();

        bump_revisions(&area, None, 4, Some("https://host/branches/b")).unwrap();
        let entries = area.load_entries().unwrap();
        assert_eq!(
            entries.this_dir().unwrap().url.as_deref(),
            Some("https://host/branches/b")
        );
        assert_eq!(
            entries.get("f").unwrap().url.as_deref(),
            Some("https://host/branches/b/f")
        );
    }

    #[test]
    fn test_missing_url_is_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let wc = temp_dir.path().join("wc");
        fs::create_dir(&wc).unwrap();
        AdminArea::init(&wc, 1, None).unwrap();
        assert_matches!(is_wc_root(&wc), Err(WcError::EntryMissingUrl { .. }));
    }
}

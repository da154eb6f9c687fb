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

//! Installing an incoming file revision into the working copy.
//!
//! This is the three-way reconciliation at the heart of an update: the new
//! pristine text and property changes arrive here, local modifications are
//! detected, and a journal is assembled that lands the new state atomically
//! with respect to crashes. Until [`crate::log_journal::LogJournal::finish`]
//! appends the log, nothing outside `tmp/` has changed; afterwards the log
//! is the source of truth and replay completes the installation.

use std::fs;
use std::path::Path;

use bstr::BString;
use tracing::instrument;

use crate::admin::AdminArea;
use crate::admin::THIS_DIR;
use crate::dag_store::NodeKind;
use crate::dag_store::RevisionNumber;
use crate::file_util::IoResultExt as _;
use crate::file_util::write_file_atomically;
use crate::log_journal::EntryMods;
use crate::log_journal::LogCommand;
use crate::log_journal::LogJournal;
use crate::log_journal::TimeValue;
use crate::log_journal::Translation;
use crate::log_journal::run_existing_log;
use crate::props::PROP_EOL_STYLE;
use crate::props::PROP_KEYWORDS;
use crate::props::PROP_MIME_TYPE;
use crate::props::PropChange;
use crate::props::PropConflict;
use crate::props::PropKind;
use crate::props::PropList;
use crate::props::diff_props;
use crate::props::merge_prop_diffs;
use crate::props::strip_prop_prefix;
use crate::props::write_prop_file;
use crate::text_merge::MergeOutcome;
use crate::text_merge::merge_three;
use crate::working_copy::WcResult;
use crate::working_copy::join_url;
use crate::working_copy::repository_normal_form;
use crate::working_copy::text_modified;

/// Incoming property state: either the revision's definitive full list, or
/// a diff against the previous pristine list.
#[derive(Clone, Debug)]
pub enum PropInput {
    /// The revision's complete property list.
    Full(PropList),
    /// Changes relative to the previous pristine list.
    Diff(Vec<PropChange>),
}

/// Everything needed to install one file revision.
#[derive(Debug)]
pub struct FileInstall<'a> {
    /// Admin area of the file's parent directory.
    pub area: &'a AdminArea,
    /// The file's basename.
    pub name: &'a str,
    /// Revision being installed.
    pub new_revision: RevisionNumber,
    /// Staged location of the new pristine text, `None` when the text is
    /// unchanged. The file is *moved* from here into the admin area.
    pub new_text_base: Option<&'a Path>,
    /// Incoming property state, `None` when the props are unchanged.
    pub new_props: Option<PropInput>,
    /// Overwrites the entry's recorded URL (e.g. on switch).
    pub new_url: Option<String>,
}

fn partition_changes(changes: Vec<PropChange>) -> (Vec<PropChange>, Vec<PropChange>, Vec<PropChange>) {
    let mut regular = vec![];
    let mut entry = vec![];
    let mut wc = vec![];
    for change in changes {
        match PropKind::of(&change.name) {
            PropKind::Regular => regular.push(change),
            PropKind::Entry => entry.push(change),
            PropKind::Wc => wc.push(change),
        }
    }
    (regular, entry, wc)
}

fn split_prop_input(
    area: &AdminArea,
    name: Option<&str>,
    input: PropInput,
) -> WcResult<(Vec<PropChange>, Vec<PropChange>, Vec<PropChange>)> {
    match input {
        PropInput::Diff(changes) => Ok(partition_changes(changes)),
        PropInput::Full(list) => {
            // The definitive list may carry routed props; regular ones are
            // diffed against the pristine set to form the incoming change.
            let as_changes: Vec<PropChange> = list
                .into_iter()
                .map(|(name, value)| PropChange {
                    name,
                    value: Some(value),
                })
                .collect();
            let (regular, entry, wc) = partition_changes(as_changes);
            let new_regular: PropList = regular
                .into_iter()
                .filter_map(|change| change.value.map(|value| (change.name, value)))
                .collect();
            let base = area.load_props(&area.prop_base_path(name))?;
            let base_regular: PropList = base
                .into_iter()
                .filter(|(name, _)| PropKind::of(name) == PropKind::Regular)
                .collect();
            Ok((diff_props(&base_regular, &new_regular), entry, wc))
        }
    }
}

struct PropMergeOutcome {
    /// The merged working property list, reflecting which incoming changes
    /// won and which local values survived.
    working: PropList,
    locally_modified: bool,
    conflicts: Vec<PropConflict>,
}

/// Merges regular property changes and appends the commands installing the
/// merged lists (and any property reject) to the journal.
fn log_regular_prop_merge(
    area: &AdminArea,
    name: Option<&str>,
    changes: &[PropChange],
    journal: &mut LogJournal,
) -> WcResult<PropMergeOutcome> {
    let mut base = area.load_props(&area.prop_base_path(name))?;
    let mut working = area.load_props(&area.prop_working_path(name))?;
    let conflicts = merge_prop_diffs(&mut working, &mut base, changes);

    if !changes.is_empty() {
        write_prop_file(&area.tmp_prop_base_path(name), &base)?;
        write_prop_file(&area.tmp_prop_working_path(name), &working)?;
        journal.push(LogCommand::Mv {
            name: area.rel_str(&area.tmp_prop_base_path(name)),
            dest: area.rel_str(&area.prop_base_path(name)),
        });
        journal.push(LogCommand::Mv {
            name: area.rel_str(&area.tmp_prop_working_path(name)),
            dest: area.rel_str(&area.prop_working_path(name)),
        });
    }

    if !conflicts.is_empty() {
        let mut reject_text = String::new();
        for conflict in &conflicts {
            let describe = |value: &Option<String>| match value {
                Some(value) => format!("'{value}'"),
                None => "<unset>".to_owned(),
            };
            reject_text.push_str(&format!(
                "Property '{}': local value {}, incoming value {}, base {}.\n",
                conflict.name,
                describe(&conflict.working),
                describe(&conflict.incoming),
                describe(&conflict.base),
            ));
        }
        let reject_name = area.reserve_prop_reject_name(name);
        let tmp_reject = area.tmp_path().join(&reject_name);
        write_file_atomically(&tmp_reject, reject_text.as_bytes())?;
        journal.push(LogCommand::Mv {
            name: area.rel_str(&tmp_reject),
            dest: reject_name.clone(),
        });
        journal.push(LogCommand::DetectConflict {
            name: name.unwrap_or(THIS_DIR).to_owned(),
            reject_file: reject_name,
            prop: true,
        });
    }

    Ok(PropMergeOutcome {
        locally_modified: working != base,
        working,
        conflicts,
    })
}

fn apply_entry_prop_changes(mods: &mut EntryMods, changes: &[PropChange]) {
    for change in changes {
        let Some(value) = &change.value else {
            continue;
        };
        match strip_prop_prefix(&change.name) {
            "committed-rev" => mods.committed_rev = value.parse().ok(),
            "committed-date" => mods.committed_date = Some(value.clone()),
            "last-author" => mods.last_author = Some(value.clone()),
            other => {
                tracing::debug!(name = other, "ignoring unrecognized entry prop");
            }
        }
    }
}

fn install_wc_props(area: &AdminArea, name: Option<&str>, changes: &[PropChange]) -> WcResult<()> {
    if changes.is_empty() {
        return Ok(());
    }
    let path = area.wc_prop_path(name);
    let mut props = area.load_props(&path)?;
    for change in changes {
        match &change.value {
            Some(value) => {
                props.insert(strip_prop_prefix(&change.name).to_owned(), value.clone());
            }
            None => {
                props.remove(strip_prop_prefix(&change.name));
            }
        }
    }
    write_prop_file(&path, &props)?;
    Ok(())
}

/// Installs one incoming file revision, reconciling it with local
/// modifications. Takes the parent directory's lock for the duration; any
/// pending log is replayed first.
#[instrument(skip_all, fields(name = install.name, revision = install.new_revision))]
pub fn install_file(install: FileInstall<'_>) -> WcResult<()> {
    let area = install.area;
    let _lock = area.lock()?;
    run_existing_log(area)?;

    let name = install.name;
    let entries = area.load_entries()?;
    let existing_entry = entries.get(name).cloned();
    // The props the working file was written under; detranslation for the
    // local-modification check must use these, not the merged set.
    let old_working_props = area.load_props(&area.prop_working_path(Some(name)))?;

    let mut journal = LogJournal::new(area);
    let mut entry_mods = EntryMods {
        name: name.to_owned(),
        kind: Some(NodeKind::File),
        revision: Some(install.new_revision),
        url: install.new_url.clone(),
        ..EntryMods::default()
    };

    let mut wc_changes = vec![];
    let merged_working_props = match install.new_props {
        Some(input) => {
            let (regular, entry_changes, wc) = split_prop_input(area, Some(name), input)?;
            wc_changes = wc;
            apply_entry_prop_changes(&mut entry_mods, &entry_changes);
            let outcome = log_regular_prop_merge(area, Some(name), &regular, &mut journal)?;
            entry_mods.prop_time = (!outcome.locally_modified).then_some(TimeValue::Working);
            outcome.working
        }
        None => old_working_props.clone(),
    };

    if let Some(staging) = install.new_text_base {
        let text_locally_modified = text_modified(area, name)?;

        // Text or binary, per the possibly freshly-changed mime type.
        let is_binary = merged_working_props
            .get(PROP_MIME_TYPE)
            .is_some_and(|mime| !mime.starts_with("text/"));
        let eol_style = merged_working_props
            .get(PROP_EOL_STYLE)
            .and_then(|value| crate::eol::EolStyle::from_prop_value(value));
        let keywords_prop = merged_working_props.get(PROP_KEYWORDS).cloned();

        let committed_rev = entry_mods
            .committed_rev
            .or(existing_entry.as_ref().and_then(|entry| entry.committed_rev));
        let committed_date = entry_mods
            .committed_date
            .clone()
            .or_else(|| existing_entry.as_ref().and_then(|entry| entry.committed_date.clone()));
        let last_author = entry_mods
            .last_author
            .clone()
            .or_else(|| existing_entry.as_ref().and_then(|entry| entry.last_author.clone()));
        let url = install
            .new_url
            .clone()
            .or_else(|| existing_entry.as_ref().and_then(|entry| entry.url.clone()))
            .or_else(|| {
                entries
                    .this_dir()
                    .and_then(|this_dir| this_dir.url.as_deref())
                    .map(|dir_url| join_url(dir_url, name))
            });
        let translation = Translation {
            eol: eol_style,
            repair: true,
            keywords: keywords_prop,
            revision: committed_rev.map(|revision| revision.to_string()),
            date: committed_date,
            author: last_author,
            url,
        };

        // Move the staged bytes into the admin area now; later log commands
        // can only reference paths under this directory.
        let tmp_base_abs = area.tmp_text_base_path(name);
        fs::rename(staging, &tmp_base_abs).context(staging)?;
        let tmp_base_rel = area.rel_str(&tmp_base_abs);
        let text_base_rel = area.rel_str(&area.text_base_path(name));

        if !text_locally_modified {
            // Clean install: the new pristine simply becomes the working
            // file, translated.
            journal.push(LogCommand::Mv {
                name: tmp_base_rel,
                dest: text_base_rel.clone(),
            });
            journal.push(LogCommand::Cp {
                name: text_base_rel.clone(),
                dest: name.to_owned(),
                translation,
            });
        } else if is_binary {
            // Binary with local edits: save the edited copy aside, then
            // install the new pristine verbatim.
            let backup_name = area.reserve_backup_name(name);
            journal.push(LogCommand::Mv {
                name: tmp_base_rel,
                dest: text_base_rel.clone(),
            });
            journal.push(LogCommand::Mv {
                name: name.to_owned(),
                dest: backup_name,
            });
            journal.push(LogCommand::Cp {
                name: text_base_rel.clone(),
                dest: name.to_owned(),
                translation: Translation::default(),
            });
        } else {
            // Text with local edits: merge in repository normal form, stage
            // the result and the losing hunks, and let the log land them.
            let old_base = match fs::read(area.text_base_path(name)) {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => vec![],
                Err(err) => {
                    return Err(crate::file_util::PathError {
                        path: area.text_base_path(name),
                        source: err,
                    }
                    .into());
                }
            };
            let new_base = fs::read(&tmp_base_abs).context(&tmp_base_abs)?;
            let working_path = area.working_file_path(name);
            let working = fs::read(&working_path).context(&working_path)?;
            let working_normal = repository_normal_form(&working, &old_working_props);

            let (merged, reject) = match merge_three(&old_base, &working_normal, &new_base) {
                MergeOutcome::Resolved(merged) => (merged, BString::default()),
                MergeOutcome::Conflicted { merged, reject, .. } => (merged, reject),
            };
            let tmp_working_abs = area.tmp_working_path(name);
            write_file_atomically(&tmp_working_abs, &merged)?;
            let tmp_reject_abs = area.tmp_path().join(format!("{name}.rej"));
            write_file_atomically(&tmp_reject_abs, &reject)?;
            let reject_name = area.reserve_reject_name(name);

            journal.push(LogCommand::Mv {
                name: tmp_base_rel,
                dest: text_base_rel.clone(),
            });
            journal.push(LogCommand::Cp {
                name: area.rel_str(&tmp_working_abs),
                dest: name.to_owned(),
                translation,
            });
            journal.push(LogCommand::Mv {
                name: area.rel_str(&tmp_reject_abs),
                dest: reject_name.clone(),
            });
            journal.push(LogCommand::DetectConflict {
                name: name.to_owned(),
                reject_file: reject_name,
                prop: false,
            });
        }

        journal.push(LogCommand::Readonly {
            name: text_base_rel,
        });
        entry_mods.text_time = (!text_locally_modified).then_some(TimeValue::Working);
    }

    journal.push(LogCommand::ModifyEntry(entry_mods));
    journal.finish()?;
    install_wc_props(area, Some(name), &wc_changes)?;
    Ok(())
}

/// Merges accumulated directory property changes and bumps the directory
/// entry, through the journal. The working-copy counterpart of closing a
/// directory scope.
#[instrument(skip_all, fields(dir = ?area.dir_path(), revision = new_revision))]
pub fn install_dir_props(
    area: &AdminArea,
    changes: Vec<PropChange>,
    new_revision: RevisionNumber,
) -> WcResult<()> {
    let _lock = area.lock()?;
    run_existing_log(area)?;

    let (regular, entry_changes, wc_changes) = partition_changes(changes);
    let mut journal = LogJournal::new(area);
    let mut entry_mods = EntryMods {
        name: THIS_DIR.to_owned(),
        kind: Some(NodeKind::Dir),
        revision: Some(new_revision),
        ..EntryMods::default()
    };
    apply_entry_prop_changes(&mut entry_mods, &entry_changes);
    let outcome = log_regular_prop_merge(area, None, &regular, &mut journal)?;
    entry_mods.prop_time = (!outcome.locally_modified).then_some(TimeValue::Working);
    if !outcome.conflicts.is_empty() {
        tracing::debug!(
            count = outcome.conflicts.len(),
            "directory property conflicts recorded"
        );
    }
    journal.push(LogCommand::ModifyEntry(entry_mods));
    journal.finish()?;
    install_wc_props(area, None, &wc_changes)?;
    Ok(())
}

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

//! Classifying working-copy entries into per-dimension statuses.

#![expect(missing_docs)]

use indexmap::IndexMap;

use crate::admin::AdminArea;
use crate::admin::Entry;
use crate::admin::Schedule;
use crate::dag_store::NodeKind;
use crate::working_copy::WcResult;
use crate::working_copy::props_modified;
use crate::working_copy::text_modified;

/// Classification of one dimension (text or properties) of an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusKind {
    /// The dimension doesn't exist (e.g. no property file).
    None,
    Normal,
    Modified,
    Added,
    Replaced,
    Deleted,
    Conflicted,
}

/// Status of one entry across both dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status {
    pub text: StatusKind,
    pub props: StatusKind,
}

/// Classifies one entry. `name` is `None` for the directory's own entry.
pub fn entry_status(area: &AdminArea, name: Option<&str>, entry: &Entry) -> WcResult<Status> {
    let mut text = StatusKind::Normal;
    let mut props = StatusKind::None;

    let prop_file_exists = area.prop_working_path(name).is_file();
    if prop_file_exists {
        props = if props_modified(area, name)? {
            StatusKind::Modified
        } else {
            StatusKind::Normal
        };
    }
    if entry.kind == NodeKind::File
        && let Some(name) = name
        && text_modified(area, name)?
    {
        text = StatusKind::Modified;
    }

    // A pending schedule overrides both dimensions (the property dimension
    // only where a property file exists at all).
    let scheduled = match entry.schedule {
        Schedule::Normal => None,
        Schedule::Add => Some(StatusKind::Added),
        Schedule::Replace => Some(StatusKind::Replaced),
        Schedule::Delete => Some(StatusKind::Deleted),
    };
    if let Some(kind) = scheduled {
        text = kind;
        if prop_file_exists {
            props = kind;
        }
    }

    if entry.conflicted {
        if let Some(reject) = &entry.reject_file
            && area.dir_path().join(reject).is_file()
        {
            text = StatusKind::Conflicted;
        }
        if let Some(reject) = &entry.prop_reject_file
            && area.dir_path().join(reject).is_file()
        {
            props = StatusKind::Conflicted;
        }
    }

    Ok(Status { text, props })
}

/// Assembles statuses for a directory tree, keyed by path relative to
/// `area` (the empty key is the directory itself). A directory reached both
/// as its parent's child entry and as its own this-dir entry keeps the
/// first insertion, so no path appears twice.
pub fn assemble_statuses(area: &AdminArea, recurse: bool) -> WcResult<IndexMap<String, Status>> {
    let mut statuses = IndexMap::new();
    walk(area, "", recurse, &mut statuses)?;
    Ok(statuses)
}

fn walk(
    area: &AdminArea,
    prefix: &str,
    recurse: bool,
    statuses: &mut IndexMap<String, Status>,
) -> WcResult<()> {
    let entries = area.load_entries()?;
    if let Some(this_dir) = entries.this_dir() {
        let status = entry_status(area, None, this_dir)?;
        statuses.entry(prefix.to_owned()).or_insert(status);
    }
    for (name, entry) in entries.children() {
        let key = if prefix.is_empty() {
            name.to_owned()
        } else {
            format!("{prefix}/{name}")
        };
        let status = entry_status(area, Some(name), entry)?;
        statuses.entry(key.clone()).or_insert(status);
        if entry.kind == NodeKind::Dir && recurse {
            let child = area.child(name);
            if child.exists() {
                walk(&child, &key, recurse, statuses)?;
            }
        }
    }
    Ok(())
}

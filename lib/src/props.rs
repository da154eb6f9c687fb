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

//! Versioned property lists and the property-name classifier.
//!
//! Property names route by prefix: `entry:` props are stored as entry
//! attributes, `wc:` props live in the working copy's private property store,
//! and everything else is a regular versioned property merged at scope close.
//! The classification is centralized in [`PropKind::of`] so every caller
//! partitions identically.

#![expect(missing_docs)]

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use itertools::EitherOrBoth;
use itertools::Itertools as _;

use crate::file_util::PathError;
use crate::file_util::write_file_atomically;

/// A property list: name to value, sorted for deterministic serialization.
pub type PropList = BTreeMap<String, String>;

/// Regular property controlling line-ending translation of a file.
pub const PROP_EOL_STYLE: &str = "eol-style";
/// Regular property listing the keywords to expand in a file.
pub const PROP_KEYWORDS: &str = "keywords";
/// Regular property giving a file's MIME type; `text/*` or absent means text.
pub const PROP_MIME_TYPE: &str = "mime-type";

/// Entry property recording the revision of the last commit touching a node.
pub const ENTRY_PROP_COMMITTED_REV: &str = "entry:committed-rev";
/// Entry property recording the date of the last commit touching a node.
pub const ENTRY_PROP_COMMITTED_DATE: &str = "entry:committed-date";
/// Entry property recording the author of the last commit touching a node.
pub const ENTRY_PROP_LAST_AUTHOR: &str = "entry:last-author";

const ENTRY_PREFIX: &str = "entry:";
const WC_PREFIX: &str = "wc:";

/// How a property routes, by name prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropKind {
    /// Versioned property, merged against pristine and working sets.
    Regular,
    /// Stored as an attribute of the working-copy entry (prefix stripped).
    Entry,
    /// Stored immediately in the working copy's private property store.
    Wc,
}

impl PropKind {
    /// Classifies a property name. This is the single source of truth for
    /// prefix routing.
    pub fn of(name: &str) -> Self {
        if name.starts_with(ENTRY_PREFIX) {
            Self::Entry
        } else if name.starts_with(WC_PREFIX) {
            Self::Wc
        } else {
            Self::Regular
        }
    }
}

/// Strips the routing prefix from an `entry:` or `wc:` property name.
pub fn strip_prop_prefix(name: &str) -> &str {
    name.strip_prefix(ENTRY_PREFIX)
        .or_else(|| name.strip_prefix(WC_PREFIX))
        .unwrap_or(name)
}

/// A single property change. `None` value means deletion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropChange {
    pub name: String,
    pub value: Option<String>,
}

/// An incoming property change that couldn't be applied because the working
/// copy modified the same property differently.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropConflict {
    pub name: String,
    pub base: Option<String>,
    pub working: Option<String>,
    pub incoming: Option<String>,
}

/// Computes the changes turning `base` into `target`.
pub fn diff_props(base: &PropList, target: &PropList) -> Vec<PropChange> {
    base.iter()
        .merge_join_by(target.iter(), |(base_name, _), (target_name, _)| {
            base_name.cmp(target_name)
        })
        .filter_map(|entry| match entry {
            EitherOrBoth::Both((_, base_value), (name, target_value)) => {
                (base_value != target_value).then(|| PropChange {
                    name: name.clone(),
                    value: Some(target_value.clone()),
                })
            }
            EitherOrBoth::Left((name, _)) => Some(PropChange {
                name: name.clone(),
                value: None,
            }),
            EitherOrBoth::Right((name, target_value)) => Some(PropChange {
                name: name.clone(),
                value: Some(target_value.clone()),
            }),
        })
        .collect()
}

/// Applies `changes` to the pristine `base` set unconditionally, and to the
/// `working` set where the working copy hasn't modified the property. A
/// working-side modification that disagrees with the incoming change is
/// reported as a conflict and the working value is left alone.
pub fn merge_prop_diffs(
    working: &mut PropList,
    base: &mut PropList,
    changes: &[PropChange],
) -> Vec<PropConflict> {
    let mut conflicts = vec![];
    for change in changes {
        let base_value = base.get(&change.name).cloned();
        let working_value = working.get(&change.name).cloned();
        apply_change(base, change);
        if working_value == base_value {
            // No local modification; the incoming change wins.
            apply_change(working, change);
        } else if working_value != change.value {
            conflicts.push(PropConflict {
                name: change.name.clone(),
                base: base_value,
                working: working_value,
                incoming: change.value.clone(),
            });
        }
    }
    conflicts
}

fn apply_change(props: &mut PropList, change: &PropChange) {
    match &change.value {
        Some(value) => {
            props.insert(change.name.clone(), value.clone());
        }
        None => {
            props.remove(&change.name);
        }
    }
}

/// Reads a property file. A missing file is an empty list.
pub fn read_prop_file(path: &Path) -> io::Result<PropList> {
    match fs::read(path) {
        Ok(data) => serde_json::from_slice(&data).map_err(io::Error::other),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(PropList::new()),
        Err(err) => Err(err),
    }
}

/// Serializes `props` to a property file, atomically.
pub fn write_prop_file(path: &Path, props: &PropList) -> Result<(), PathError> {
    let data = serde_json::to_vec_pretty(props).expect("prop list must serialize");
    write_file_atomically(path, &data)
}

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

//! The append-only journal that mutates one directory's working copy.
//!
//! Commands accumulate in memory, are written to the admin area's `log` file
//! in one synced batch, then replayed. The log file exists exactly while
//! replay is pending: a crash between save and completion is recovered by
//! [`run_existing_log`] on the next operation against the directory. Every
//! primitive tolerates re-application, so a partially replayed log can
//! simply run again from the top.
//!
//! The on-disk grammar is a sequence of self-closing XML-like tags, one per
//! line, with attribute values escaped.

#![expect(missing_docs)]

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::process::Stdio;

use tracing::instrument;

use crate::admin::AdminArea;
use crate::admin::Entry;
use crate::admin::MillisSinceEpoch;
use crate::admin::Schedule;
use crate::admin::file_mtime;
use crate::dag_store::NodeKind;
use crate::dag_store::RevisionNumber;
use crate::eol::EolStyle;
use crate::file_util::IoResultExt as _;
use crate::file_util::remove_file_if_exists;
use crate::file_util::set_file_read_only;
use crate::file_util::write_file_atomically;
use crate::keywords::KeywordValues;
use crate::keywords::expand_keywords;
use crate::keywords::parse_keywords_prop;
use crate::working_copy::WcError;
use crate::working_copy::WcResult;

/// A timestamp attribute: either an absolute time or the sentinel resolved
/// from the installed file at replay time. The sentinel keeps replay
/// idempotent in effect; a re-run re-stamps from the same file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeValue {
    Working,
    At(MillisSinceEpoch),
}

/// Translation applied by a [`LogCommand::Cp`]: line-ending conversion and
/// keyword expansion performed while copying.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Translation {
    pub eol: Option<EolStyle>,
    pub repair: bool,
    /// Space-separated `keywords` property value naming what to expand.
    pub keywords: Option<String>,
    pub revision: Option<String>,
    pub date: Option<String>,
    pub author: Option<String>,
    pub url: Option<String>,
}

impl Translation {
    fn is_noop(&self) -> bool {
        self.eol.is_none() && self.keywords.is_none()
    }
}

/// The field updates carried by a `modify-entry` command. Unset fields
/// leave the entry's value alone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntryMods {
    pub name: String,
    pub kind: Option<NodeKind>,
    pub revision: Option<RevisionNumber>,
    pub schedule: Option<Schedule>,
    pub text_time: Option<TimeValue>,
    pub prop_time: Option<TimeValue>,
    pub url: Option<String>,
    pub committed_rev: Option<RevisionNumber>,
    pub committed_date: Option<String>,
    pub last_author: Option<String>,
}

/// One journaled operation. All paths are relative to the directory the
/// journal belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogCommand {
    /// Remove `name` from the entries file.
    DeleteEntry { name: String },
    /// Create or update the named entry. Creating requires `kind`.
    ModifyEntry(EntryMods),
    /// Rename `name` to `dest`.
    Mv { name: String, dest: String },
    /// Copy `name` to `dest`, optionally translating on the way.
    Cp {
        name: String,
        dest: String,
        translation: Translation,
    },
    /// Remove the file or directory tree at `name`.
    Rm { name: String },
    /// Make the file at `name` read-only.
    Readonly { name: String },
    /// Invoke an external tool with literal arguments, in the directory.
    RunCmd {
        name: String,
        args: Vec<String>,
        infile: Option<String>,
    },
    /// Decide the conflicted state of entry `name` from the reject file: a
    /// non-empty reject marks the entry conflicted; an empty one is removed.
    /// `prop` selects the property dimension instead of the text dimension.
    DetectConflict {
        name: String,
        reject_file: String,
        prop: bool,
    },
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape_attr(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn push_attr(out: &mut String, key: &str, value: &str) {
    write!(out, " {key}=\"{}\"", escape_attr(value)).unwrap();
}

fn kind_str(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::File => "file",
        NodeKind::Dir => "dir",
    }
}

fn schedule_str(schedule: Schedule) -> &'static str {
    match schedule {
        Schedule::Normal => "normal",
        Schedule::Add => "add",
        Schedule::Delete => "delete",
        Schedule::Replace => "replace",
    }
}

fn time_value_str(value: TimeValue) -> String {
    match value {
        TimeValue::Working => "working".to_owned(),
        TimeValue::At(MillisSinceEpoch(millis)) => millis.to_string(),
    }
}

fn eol_style_str(style: EolStyle) -> &'static str {
    match style {
        EolStyle::Native => "native",
        EolStyle::Lf => "LF",
        EolStyle::Crlf => "CRLF",
        EolStyle::Cr => "CR",
    }
}

impl LogCommand {
    fn serialize(&self, out: &mut String) {
        match self {
            Self::DeleteEntry { name } => {
                out.push_str("<delete-entry");
                push_attr(out, "name", name);
            }
            Self::ModifyEntry(mods) => {
                out.push_str("<modify-entry");
                push_attr(out, "name", &mods.name);
                if let Some(kind) = mods.kind {
                    push_attr(out, "kind", kind_str(kind));
                }
                if let Some(revision) = mods.revision {
                    push_attr(out, "revision", &revision.to_string());
                }
                if let Some(schedule) = mods.schedule {
                    push_attr(out, "schedule", schedule_str(schedule));
                }
                if let Some(text_time) = mods.text_time {
                    push_attr(out, "text-time", &time_value_str(text_time));
                }
                if let Some(prop_time) = mods.prop_time {
                    push_attr(out, "prop-time", &time_value_str(prop_time));
                }
                if let Some(url) = &mods.url {
                    push_attr(out, "url", url);
                }
                if let Some(committed_rev) = mods.committed_rev {
                    push_attr(out, "committed-rev", &committed_rev.to_string());
                }
                if let Some(committed_date) = &mods.committed_date {
                    push_attr(out, "committed-date", committed_date);
                }
                if let Some(last_author) = &mods.last_author {
                    push_attr(out, "last-author", last_author);
                }
            }
            Self::Mv { name, dest } => {
                out.push_str("<mv");
                push_attr(out, "name", name);
                push_attr(out, "dest", dest);
            }
            Self::Cp {
                name,
                dest,
                translation,
            } => {
                out.push_str("<cp");
                push_attr(out, "name", name);
                push_attr(out, "dest", dest);
                if let Some(eol) = translation.eol {
                    push_attr(out, "eol-str", eol_style_str(eol));
                }
                if translation.repair {
                    push_attr(out, "repair", "true");
                }
                if let Some(keywords) = &translation.keywords {
                    push_attr(out, "expand", keywords);
                }
                if let Some(revision) = &translation.revision {
                    push_attr(out, "revision", revision);
                }
                if let Some(date) = &translation.date {
                    push_attr(out, "date", date);
                }
                if let Some(author) = &translation.author {
                    push_attr(out, "author", author);
                }
                if let Some(url) = &translation.url {
                    push_attr(out, "url", url);
                }
            }
            Self::Rm { name } => {
                out.push_str("<rm");
                push_attr(out, "name", name);
            }
            Self::Readonly { name } => {
                out.push_str("<readonly");
                push_attr(out, "name", name);
            }
            Self::RunCmd { name, args, infile } => {
                out.push_str("<run-cmd");
                push_attr(out, "name", name);
                for (index, arg) in args.iter().enumerate() {
                    push_attr(out, &format!("arg-{}", index + 1), arg);
                }
                if let Some(infile) = infile {
                    push_attr(out, "infile", infile);
                }
            }
            Self::DetectConflict {
                name,
                reject_file,
                prop,
            } => {
                out.push_str("<detect-conflict");
                push_attr(out, "name", name);
                push_attr(out, "reject-file", reject_file);
                if *prop {
                    push_attr(out, "prop", "true");
                }
            }
        }
        out.push_str("/>\n");
    }
}

fn corrupt(area: &AdminArea, message: impl Into<String>) -> WcError {
    WcError::Corrupt {
        path: area.log_path(),
        source: message.into().into(),
    }
}

fn parse_line(area: &AdminArea, line: &str) -> WcResult<LogCommand> {
    let inner = line
        .strip_prefix('<')
        .and_then(|rest| rest.strip_suffix("/>"))
        .ok_or_else(|| corrupt(area, format!("malformed log line: {line}")))?;
    let (tag, mut rest) = inner
        .split_once(char::is_whitespace)
        .ok_or_else(|| corrupt(area, format!("log tag without attributes: {line}")))?;
    let mut attrs: Vec<(String, String)> = vec![];
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        let (key, after_key) = rest
            .split_once('=')
            .ok_or_else(|| corrupt(area, format!("malformed attribute in: {line}")))?;
        let after_quote = after_key
            .strip_prefix('"')
            .ok_or_else(|| corrupt(area, format!("unquoted attribute in: {line}")))?;
        let (value, remainder) = after_quote
            .split_once('"')
            .ok_or_else(|| corrupt(area, format!("unterminated attribute in: {line}")))?;
        attrs.push((key.to_owned(), unescape_attr(value)));
        rest = remainder;
    }

    let take = |key: &str| -> Option<String> {
        attrs
            .iter()
            .find(|(attr_key, _)| attr_key == key)
            .map(|(_, value)| value.clone())
    };
    let require = |key: &str| -> WcResult<String> {
        take(key).ok_or_else(|| corrupt(area, format!("missing {key} attribute in: {line}")))
    };

    let parse_kind = |value: String| -> WcResult<NodeKind> {
        match value.as_str() {
            "file" => Ok(NodeKind::File),
            "dir" => Ok(NodeKind::Dir),
            _ => Err(corrupt(area, format!("unknown kind \"{value}\""))),
        }
    };
    let parse_schedule = |value: String| -> WcResult<Schedule> {
        match value.as_str() {
            "normal" => Ok(Schedule::Normal),
            "add" => Ok(Schedule::Add),
            "delete" => Ok(Schedule::Delete),
            "replace" => Ok(Schedule::Replace),
            _ => Err(corrupt(area, format!("unknown schedule \"{value}\""))),
        }
    };
    let parse_time = |value: String| -> WcResult<TimeValue> {
        if value == "working" {
            Ok(TimeValue::Working)
        } else {
            value
                .parse()
                .map(|millis| TimeValue::At(MillisSinceEpoch(millis)))
                .map_err(|_| corrupt(area, format!("bad timestamp \"{value}\"")))
        }
    };
    let parse_revnum = |value: String| -> WcResult<RevisionNumber> {
        value
            .parse()
            .map_err(|_| corrupt(area, format!("bad revision \"{value}\"")))
    };

    match tag {
        "delete-entry" => Ok(LogCommand::DeleteEntry { name: require("name")? }),
        "modify-entry" => Ok(LogCommand::ModifyEntry(EntryMods {
            name: require("name")?,
            kind: take("kind").map(parse_kind).transpose()?,
            revision: take("revision").map(parse_revnum).transpose()?,
            schedule: take("schedule").map(parse_schedule).transpose()?,
            text_time: take("text-time").map(parse_time).transpose()?,
            prop_time: take("prop-time").map(parse_time).transpose()?,
            url: take("url"),
            committed_rev: take("committed-rev").map(parse_revnum).transpose()?,
            committed_date: take("committed-date"),
            last_author: take("last-author"),
        })),
        "mv" => Ok(LogCommand::Mv {
            name: require("name")?,
            dest: require("dest")?,
        }),
        "cp" => {
            let eol = take("eol-str")
                .map(|value| {
                    EolStyle::from_prop_value(&value)
                        .ok_or_else(|| corrupt(area, format!("unknown eol-str \"{value}\"")))
                })
                .transpose()?;
            Ok(LogCommand::Cp {
                name: require("name")?,
                dest: require("dest")?,
                translation: Translation {
                    eol,
                    repair: take("repair").as_deref() == Some("true"),
                    keywords: take("expand"),
                    revision: take("revision"),
                    date: take("date"),
                    author: take("author"),
                    url: take("url"),
                },
            })
        }
        "rm" => Ok(LogCommand::Rm { name: require("name")? }),
        "readonly" => Ok(LogCommand::Readonly { name: require("name")? }),
        "run-cmd" => {
            let mut args = vec![];
            for index in 1.. {
                match take(&format!("arg-{index}")) {
                    Some(arg) => args.push(arg),
                    None => break,
                }
            }
            Ok(LogCommand::RunCmd {
                name: require("name")?,
                args,
                infile: take("infile"),
            })
        }
        "detect-conflict" => Ok(LogCommand::DetectConflict {
            name: require("name")?,
            reject_file: require("reject-file")?,
            prop: take("prop").as_deref() == Some("true"),
        }),
        _ => Err(corrupt(area, format!("unknown log operation <{tag}>"))),
    }
}

/// The in-memory journal being assembled for one directory. The caller is
/// expected to hold the directory's lock.
#[derive(Debug)]
pub struct LogJournal {
    area: AdminArea,
    commands: Vec<LogCommand>,
}

impl LogJournal {
    pub fn new(area: &AdminArea) -> Self {
        Self {
            area: area.clone(),
            commands: vec![],
        }
    }

    pub fn push(&mut self, command: LogCommand) {
        self.commands.push(command);
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Writes the accumulated commands to the on-disk log in one synced
    /// batch. From this point the log is the source of truth.
    pub fn save(&self) -> WcResult<()> {
        let log_path = self.area.log_path();
        if log_path.exists() {
            return Err(corrupt(
                &self.area,
                "a pending log already exists; it must be replayed first",
            ));
        }
        let mut serialized = String::new();
        for command in &self.commands {
            command.serialize(&mut serialized);
        }
        write_file_atomically(&log_path, serialized.as_bytes())?;
        Ok(())
    }

    /// Saves and immediately replays the journal.
    pub fn finish(self) -> WcResult<()> {
        self.save()?;
        run_existing_log(&self.area)
    }
}

/// Replays the directory's pending log to completion, if one exists, and
/// removes it. Called before any new work against a directory.
#[instrument(skip_all, fields(dir = ?area.dir_path()))]
pub fn run_existing_log(area: &AdminArea) -> WcResult<()> {
    let log_path = area.log_path();
    let text = match fs::read_to_string(&log_path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(crate::file_util::PathError {
            path: log_path,
            source: err,
        }
        .into()),
    };
    tracing::debug!(dir = ?area.dir_path(), "replaying pending log");
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let command = parse_line(area, line)?;
        execute(area, &command)?;
    }
    remove_file_if_exists(&log_path).context(&log_path)?;
    Ok(())
}

fn execute(area: &AdminArea, command: &LogCommand) -> WcResult<()> {
    match command {
        LogCommand::DeleteEntry { name } => {
            let mut entries = area.load_entries()?;
            entries.remove(name);
            area.save_entries(&entries)
        }
        LogCommand::ModifyEntry(mods) => {
            let name = &mods.name;
            let mut entries = area.load_entries()?;
            if entries.get(name).is_none() {
                let Some(kind) = mods.kind else {
                    return Err(corrupt(
                        area,
                        format!("modify-entry for unknown entry \"{name}\" without kind"),
                    ));
                };
                entries.insert(name.clone(), Entry::new(kind));
            }
            let resolve_time = |value: &TimeValue| -> Option<MillisSinceEpoch> {
                match value {
                    TimeValue::At(millis) => Some(*millis),
                    TimeValue::Working => {
                        let path = if name.is_empty() {
                            area.dir_path().to_path_buf()
                        } else {
                            area.working_file_path(name)
                        };
                        file_mtime(&path).ok()
                    }
                }
            };
            let entry = entries.get_mut(name).unwrap();
            if let Some(kind) = mods.kind {
                entry.kind = kind;
            }
            if let Some(revision) = mods.revision {
                entry.revision = Some(revision);
            }
            if let Some(schedule) = mods.schedule {
                entry.schedule = schedule;
            }
            if let Some(text_time) = &mods.text_time {
                entry.text_time = resolve_time(text_time);
            }
            if let Some(prop_time) = &mods.prop_time {
                entry.prop_time = resolve_time(prop_time);
            }
            if let Some(url) = &mods.url {
                entry.url = Some(url.clone());
            }
            if let Some(committed_rev) = mods.committed_rev {
                entry.committed_rev = Some(committed_rev);
            }
            if let Some(committed_date) = &mods.committed_date {
                entry.committed_date = Some(committed_date.clone());
            }
            if let Some(last_author) = &mods.last_author {
                entry.last_author = Some(last_author.clone());
            }
            area.save_entries(&entries)
        }
        LogCommand::Mv { name, dest } => {
            let src_path = area.dir_path().join(name);
            let dest_path = area.dir_path().join(dest);
            if !src_path.exists() {
                // Already applied by a previous run of this log. The
                // destination may since have been consumed by a later
                // command (e.g. detect-conflict removing an empty reject),
                // so its absence is tolerated too.
                tracing::debug!(src = name, "mv source missing, treating as applied");
                return Ok(());
            }
            fs::rename(&src_path, &dest_path).context(&src_path)?;
            Ok(())
        }
        LogCommand::Cp {
            name,
            dest,
            translation,
        } => {
            let src_path = area.dir_path().join(name);
            let dest_path = area.dir_path().join(dest);
            let contents = fs::read(&src_path).context(&src_path)?;
            let translated = translate_for_cp(dest, &contents, translation)?;
            write_file_atomically(&dest_path, &translated)?;
            Ok(())
        }
        LogCommand::Rm { name } => {
            let path = area.dir_path().join(name);
            if path.is_dir() {
                fs::remove_dir_all(&path).context(&path)?;
            } else {
                remove_file_if_exists(&path).context(&path)?;
            }
            Ok(())
        }
        LogCommand::Readonly { name } => {
            let path = area.dir_path().join(name);
            set_file_read_only(&path).context(&path)?;
            Ok(())
        }
        LogCommand::RunCmd { name, args, infile } => {
            let mut command = Command::new(name);
            command.args(args).current_dir(area.dir_path());
            match infile {
                Some(infile) => {
                    let path = area.dir_path().join(infile);
                    let file = fs::File::open(&path).context(&path)?;
                    command.stdin(Stdio::from(file));
                }
                None => {
                    command.stdin(Stdio::null());
                }
            }
            let status = command
                .status()
                .map_err(|err| WcError::Other(Box::new(err)))?;
            if !status.success() {
                tracing::warn!(%name, ?status, "log-driven command reported failure");
            }
            Ok(())
        }
        LogCommand::DetectConflict {
            name,
            reject_file,
            prop,
        } => {
            let reject_path = area.dir_path().join(reject_file);
            let non_empty = fs::metadata(&reject_path)
                .map(|metadata| metadata.len() > 0)
                .unwrap_or(false);
            let mut entries = area.load_entries()?;
            let Some(entry) = entries.get_mut(name) else {
                return Err(corrupt(
                    area,
                    format!("detect-conflict for unknown entry \"{name}\""),
                ));
            };
            let dimension = if *prop {
                &mut entry.prop_reject_file
            } else {
                &mut entry.reject_file
            };
            if non_empty {
                *dimension = Some(reject_file.clone());
            } else {
                *dimension = None;
                remove_file_if_exists(&reject_path).context(&reject_path)?;
            }
            entry.conflicted = entry.reject_file.is_some() || entry.prop_reject_file.is_some();
            area.save_entries(&entries)
        }
    }
}

fn translate_for_cp(
    dest: &str,
    contents: &[u8],
    translation: &Translation,
) -> WcResult<Vec<u8>> {
    if translation.is_noop() {
        return Ok(contents.to_vec());
    }
    let eol_translated = match translation.eol {
        Some(style) => crate::eol::translate_eol(contents, style.eol_bytes(), translation.repair)
            .map_err(|err| WcError::Other(Box::new(err)))?,
        None => contents.into(),
    };
    let Some(keywords_prop) = &translation.keywords else {
        return Ok(eol_translated.into());
    };
    let enabled = parse_keywords_prop(keywords_prop);
    let basename = Path::new(dest)
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned);
    let values = KeywordValues {
        revision: translation.revision.clone(),
        date: translation.date.clone(),
        author: translation.author.clone(),
        url: translation.url.clone(),
        name: basename,
    };
    Ok(expand_keywords(&eol_translated, &enabled, &values).into())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::dag_store::NodeKind;

    fn test_area() -> (tempfile::TempDir, AdminArea) {
        let temp_dir = tempfile::tempdir().unwrap();
        let area = AdminArea::init(temp_dir.path(), 1, Some("https://host/trunk".into())).unwrap();
        (temp_dir, area)
    }

    fn roundtrip(area: &AdminArea, command: LogCommand) {
        let mut serialized = String::new();
        command.serialize(&mut serialized);
        let parsed = parse_line(area, serialized.trim_end()).unwrap();
        assert_eq!(parsed, command);
    }

    #[test]
    fn test_grammar_roundtrip() {
        let (_temp, area) = test_area();
        roundtrip(&area, LogCommand::DeleteEntry { name: "f".into() });
        roundtrip(
            &area,
            LogCommand::Mv {
                name: ".arbor/tmp/text-base/f.base".into(),
                dest: ".arbor/text-base/f.base".into(),
            },
        );
        roundtrip(
            &area,
            LogCommand::Cp {
                name: ".arbor/text-base/f.base".into(),
                dest: "f".into(),
                translation: Translation {
                    eol: Some(EolStyle::Crlf),
                    repair: true,
                    keywords: Some("Rev Author".into()),
                    revision: Some("42".into()),
                    date: Some("2024-03-01".into()),
                    author: Some("alice".into()),
                    url: Some("https://host/trunk/f".into()),
                },
            },
        );
        roundtrip(
            &area,
            LogCommand::RunCmd {
                name: "patch".into(),
                args: vec!["-p0".into(), "--quiet".into()],
                infile: Some("f.diff".into()),
            },
        );
        roundtrip(
            &area,
            LogCommand::DetectConflict {
                name: "f".into(),
                reject_file: "f.rej".into(),
                prop: false,
            },
        );
        roundtrip(
            &area,
            LogCommand::ModifyEntry(EntryMods {
                name: "f".into(),
                kind: Some(NodeKind::File),
                revision: Some(7),
                text_time: Some(TimeValue::Working),
                url: Some("https://host/trunk/f".into()),
                ..EntryMods::default()
            }),
        );
    }

    #[test]
    fn test_attr_escaping() {
        let (_temp, area) = test_area();
        roundtrip(
            &area,
            LogCommand::Rm {
                name: "weird \"<name>\" & co".into(),
            },
        );
    }

    #[test]
    fn test_finish_removes_log() {
        let (_temp, area) = test_area();
        fs::write(area.working_file_path("gone"), b"bye").unwrap();
        let mut journal = LogJournal::new(&area);
        journal.push(LogCommand::Rm { name: "gone".into() });
        journal.finish().unwrap();
        assert!(!area.log_path().exists());
        assert!(!area.working_file_path("gone").exists());
    }

    #[test]
    fn test_replay_is_idempotent() {
        let (_temp, area) = test_area();
        fs::write(area.working_file_path("src"), b"data\n").unwrap();
        let mut journal = LogJournal::new(&area);
        journal.push(LogCommand::Mv {
            name: "src".into(),
            dest: "dst".into(),
        });
        journal.push(LogCommand::Rm { name: "extra".into() });
        journal.push(LogCommand::ModifyEntry(EntryMods {
            name: "dst".into(),
            kind: Some(NodeKind::File),
            revision: Some(5),
            ..EntryMods::default()
        }));
        journal.save().unwrap();
        let log_contents = fs::read(area.log_path()).unwrap();

        run_existing_log(&area).unwrap();
        let entries_after_first = area.load_entries().unwrap();
        assert_eq!(fs::read(area.working_file_path("dst")).unwrap(), b"data\n");

        // Re-create the log as if the process crashed after a partial (or
        // full) replay; running it again must land in the same state.
        fs::write(area.log_path(), &log_contents).unwrap();
        run_existing_log(&area).unwrap();
        assert_eq!(area.load_entries().unwrap(), entries_after_first);
        assert_eq!(fs::read(area.working_file_path("dst")).unwrap(), b"data\n");
        assert!(!area.log_path().exists());
    }

    #[test]
    fn test_save_refuses_second_pending_log() {
        let (_temp, area) = test_area();
        let mut journal = LogJournal::new(&area);
        journal.push(LogCommand::Rm { name: "x".into() });
        journal.save().unwrap();
        let mut second = LogJournal::new(&area);
        second.push(LogCommand::Rm { name: "y".into() });
        assert_matches!(second.save(), Err(WcError::Corrupt { .. }));
    }

    #[test]
    fn test_cp_with_translation() {
        let (_temp, area) = test_area();
        fs::write(area.text_base_path("f"), b"rev $Rev$\nnext\n").unwrap();
        let mut journal = LogJournal::new(&area);
        journal.push(LogCommand::Cp {
            name: ".arbor/text-base/f.base".into(),
            dest: "f".into(),
            translation: Translation {
                eol: Some(EolStyle::Crlf),
                repair: false,
                keywords: Some("Rev".into()),
                revision: Some("8".into()),
                ..Translation::default()
            },
        });
        journal.finish().unwrap();
        assert_eq!(
            fs::read(area.working_file_path("f")).unwrap(),
            b"rev $Rev: 8 $\r\nnext\r\n"
        );
    }

    #[test]
    fn test_detect_conflict_nonempty_marks_entry() {
        let (_temp, area) = test_area();
        let mut entries = area.load_entries().unwrap();
        entries.insert("f", Entry::new(NodeKind::File));
        area.save_entries(&entries).unwrap();
        fs::write(area.working_file_path("f.rej"), b"@@ -1,1 +1,1 @@\n").unwrap();

        let mut journal = LogJournal::new(&area);
        journal.push(LogCommand::DetectConflict {
            name: "f".into(),
            reject_file: "f.rej".into(),
            prop: false,
        });
        journal.finish().unwrap();
        let entry = area.load_entries().unwrap().get("f").unwrap().clone();
        assert!(entry.conflicted);
        assert_eq!(entry.reject_file.as_deref(), Some("f.rej"));
        assert!(area.working_file_path("f.rej").exists());
    }

    #[test]
    fn test_detect_conflict_empty_removes_reject() {
        let (_temp, area) = test_area();
        let mut entries = area.load_entries().unwrap();
        entries.insert("f", Entry::new(NodeKind::File));
        area.save_entries(&entries).unwrap();
        fs::write(area.working_file_path("f.rej"), b"").unwrap();

        let mut journal = LogJournal::new(&area);
        journal.push(LogCommand::DetectConflict {
            name: "f".into(),
            reject_file: "f.rej".into(),
            prop: false,
        });
        journal.finish().unwrap();
        let entry = area.load_entries().unwrap().get("f").unwrap().clone();
        assert!(!entry.conflicted);
        assert_eq!(entry.reject_file, None);
        assert!(!area.working_file_path("f.rej").exists());
    }

    #[test]
    fn test_run_cmd_executes_in_directory() {
        let (_temp, area) = test_area();
        let mut journal = LogJournal::new(&area);
        journal.push(LogCommand::RunCmd {
            name: "touch".into(),
            args: vec!["ran-here".into()],
            infile: None,
        });
        journal.finish().unwrap();
        assert!(area.working_file_path("ran-here").exists());
    }

    #[test]
    fn test_unknown_tag_is_corrupt() {
        let (_temp, area) = test_area();
        fs::write(area.log_path(), "<frobnicate name=\"x\"/>\n").unwrap();
        assert_matches!(run_existing_log(&area), Err(WcError::Corrupt { .. }));
    }
}

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

//! Keyword anchors in file contents: `$Rev$`, `$Author$`, `$Date$`, `$URL$`,
//! `$Id$` and their long aliases.
//!
//! An enabled keyword expands from `$Kw$` to `$Kw: value $` on the way into
//! the working copy and contracts back for comparison against the pristine
//! text. Contraction is unconditional over all recognized keywords so that
//! repository-normal form doesn't depend on the (possibly conflicted)
//! `keywords` property.

#![expect(missing_docs)]

use std::collections::BTreeSet;
use std::sync::LazyLock;

use bstr::BString;
use regex::bytes::Captures;
use regex::bytes::Regex;

/// The canonical names of the keywords enabled by a `keywords` property.
pub type KeywordSet = BTreeSet<&'static str>;

/// Values substituted into expanded keywords, taken from the entry props of
/// the revision being installed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeywordValues {
    pub revision: Option<String>,
    pub date: Option<String>,
    pub author: Option<String>,
    pub url: Option<String>,
    /// The file's basename, used by `$Id$`.
    pub name: Option<String>,
}

static KEYWORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Longest alternatives first so the long aliases win over their
    // prefixes.
    Regex::new(
        r"\$(LastChangedRevision|LastChangedDate|LastChangedBy|HeadURL|Revision|Author|Date|URL|Rev|Id)(:[^$\r\n]*)?\$",
    )
    .unwrap()
});

fn canonical(keyword: &[u8]) -> &'static str {
    match keyword {
        b"Rev" | b"Revision" | b"LastChangedRevision" => "rev",
        b"Author" | b"LastChangedBy" => "author",
        b"Date" | b"LastChangedDate" => "date",
        b"URL" | b"HeadURL" => "url",
        b"Id" => "id",
        _ => unreachable!("regex only matches known keywords"),
    }
}

/// Parses a `keywords` property value into the set of enabled keywords.
/// Words are whitespace-separated; unknown words are ignored.
pub fn parse_keywords_prop(value: &str) -> KeywordSet {
    value
        .split_whitespace()
        .filter_map(|word| match word {
            "Rev" | "Revision" | "LastChangedRevision" => Some("rev"),
            "Author" | "LastChangedBy" => Some("author"),
            "Date" | "LastChangedDate" => Some("date"),
            "URL" | "HeadURL" => Some("url"),
            "Id" => Some("id"),
            _ => None,
        })
        .collect()
}

fn keyword_value(canon: &str, values: &KeywordValues) -> Option<String> {
    match canon {
        "rev" => values.revision.clone(),
        "author" => values.author.clone(),
        "date" => values.date.clone(),
        "url" => values.url.clone(),
        "id" => {
            let name = values.name.as_deref()?;
            Some(format!(
                "{name} {} {} {}",
                values.revision.as_deref().unwrap_or("?"),
                values.date.as_deref().unwrap_or("?"),
                values.author.as_deref().unwrap_or("?"),
            ))
        }
        _ => None,
    }
}

/// Expands every enabled keyword anchor in `input`. Anchors of disabled
/// keywords are left untouched; an enabled keyword with no value contracts.
pub fn expand_keywords(input: &[u8], enabled: &KeywordSet, values: &KeywordValues) -> BString {
    let replaced = KEYWORD_RE.replace_all(input, |captures: &Captures<'_>| {
        let keyword = &captures[1];
        let canon = canonical(keyword);
        if !enabled.contains(canon) {
            return captures[0].to_vec();
        }
        let mut out = vec![b'$'];
        out.extend_from_slice(keyword);
        if let Some(value) = keyword_value(canon, values) {
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.push(b' ');
        }
        out.push(b'$');
        out
    });
    replaced.into_owned().into()
}

/// Contracts every recognized keyword anchor back to its bare `$Kw$` form.
pub fn contract_keywords(input: &[u8]) -> BString {
    let replaced = KEYWORD_RE.replace_all(input, |captures: &Captures<'_>| {
        let mut out = vec![b'$'];
        out.extend_from_slice(&captures[1]);
        out.push(b'$');
        out
    });
    replaced.into_owned().into()
}

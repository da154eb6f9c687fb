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

#![expect(missing_docs)]

use std::borrow::Borrow;
use std::fmt;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::iter::FusedIterator;
use std::ops::Deref;
use std::path::Path;
use std::path::PathBuf;

use ref_cast::RefCastCustom;
use ref_cast::ref_cast_custom;
use thiserror::Error;

/// The `value` is not usable as a directory entry name. Entry names must be
/// non-empty single path components: no `/`, and neither `.` nor `..`.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error(r#"Invalid entry name "{value}""#)]
pub struct InvalidDirentNameError {
    pub value: String,
}

/// Owned directory entry name.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct DirentNameBuf {
    // Don't add more fields. Eq, Hash, and Ord must be compatible with the
    // borrowed DirentName type.
    value: String,
}

impl DirentNameBuf {
    /// Wraps `value` as `DirentNameBuf`, validating it as a single path
    /// component.
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidDirentNameError> {
        let value: String = value.into();
        if is_valid_dirent_name_str(&value) {
            Ok(Self { value })
        } else {
            Err(InvalidDirentNameError { value })
        }
    }
}

/// Borrowed directory entry name.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, RefCastCustom)]
#[repr(transparent)]
pub struct DirentName {
    value: str,
}

impl DirentName {
    /// Wraps `value` as `DirentName`, validating it as a single path
    /// component.
    pub fn new(value: &str) -> Result<&Self, InvalidDirentNameError> {
        if is_valid_dirent_name_str(value) {
            Ok(Self::new_unchecked(value))
        } else {
            Err(InvalidDirentNameError {
                value: value.to_string(),
            })
        }
    }

    #[ref_cast_custom]
    const fn new_unchecked(value: &str) -> &Self;

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl Debug for DirentName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &self.value)
    }
}

impl Debug for DirentNameBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        <DirentName as Debug>::fmt(self, f)
    }
}

impl AsRef<Self> for DirentName {
    fn as_ref(&self) -> &Self {
        self
    }
}

impl AsRef<DirentName> for DirentNameBuf {
    fn as_ref(&self) -> &DirentName {
        self
    }
}

impl Borrow<DirentName> for DirentNameBuf {
    fn borrow(&self) -> &DirentName {
        self
    }
}

impl Deref for DirentNameBuf {
    type Target = DirentName;

    fn deref(&self) -> &Self::Target {
        DirentName::new_unchecked(&self.value)
    }
}

impl ToOwned for DirentName {
    type Owned = DirentNameBuf;

    fn to_owned(&self) -> Self::Owned {
        let value = self.value.to_owned();
        DirentNameBuf { value }
    }
}

fn is_valid_dirent_name_str(value: &str) -> bool {
    !value.is_empty() && value != "." && value != ".." && !value.contains('/')
}

/// The `value` is not a valid working-copy path: it contains an empty or
/// non-normal component. For example, `"/"`, `"/foo"`, `"foo/"`, `"foo//bar"`,
/// and `"foo/../bar"` are all invalid.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error(r#"Invalid working-copy path "{value}""#)]
pub struct InvalidWcPathError {
    pub value: String,
}

/// Owned working-copy path: a `/`-separated path relative to some root. The
/// empty string is the root itself.
#[derive(Clone, Eq, Hash, PartialEq, serde::Serialize)]
#[serde(transparent)]
pub struct WcPathBuf {
    // Don't add more fields. Eq, Hash, and Ord must be compatible with the
    // borrowed WcPath type.
    value: String,
}

/// Borrowed working-copy path.
#[derive(Eq, Hash, PartialEq, RefCastCustom, serde::Serialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct WcPath {
    value: str,
}

impl Debug for WcPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &self.value)
    }
}

impl Debug for WcPathBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        <WcPath as Debug>::fmt(self, f)
    }
}

impl WcPathBuf {
    /// Creates an owned path pointing to the root.
    pub const fn root() -> Self {
        Self {
            value: String::new(),
        }
    }

    /// Creates `WcPathBuf` from a valid string representation.
    pub fn from_internal_string(value: impl Into<String>) -> Result<Self, InvalidWcPathError> {
        let value: String = value.into();
        if is_valid_wc_path_str(&value) {
            Ok(Self { value })
        } else {
            Err(InvalidWcPathError { value })
        }
    }

    /// Consumes this and returns the underlying string representation.
    pub fn into_internal_string(self) -> String {
        self.value
    }
}

impl WcPath {
    /// Returns the path pointing to the root.
    pub const fn root() -> &'static Self {
        Self::from_internal_string_unchecked("")
    }

    /// Wraps a valid string representation as `WcPath`.
    pub fn from_internal_string(value: &str) -> Result<&Self, InvalidWcPathError> {
        if is_valid_wc_path_str(value) {
            Ok(Self::from_internal_string_unchecked(value))
        } else {
            Err(InvalidWcPathError {
                value: value.to_string(),
            })
        }
    }

    #[ref_cast_custom]
    const fn from_internal_string_unchecked(value: &str) -> &Self;

    pub fn is_root(&self) -> bool {
        self.value.is_empty()
    }

    /// Returns the underlying string representation.
    pub fn as_internal_str(&self) -> &str {
        &self.value
    }

    /// The last component and the path up to it, or `None` for the root.
    pub fn split(&self) -> Option<(&Self, &DirentName)> {
        if self.is_root() {
            return None;
        }
        match self.value.rsplit_once('/') {
            Some((parent, basename)) => Some((
                Self::from_internal_string_unchecked(parent),
                DirentName::new_unchecked(basename),
            )),
            None => Some((Self::root(), DirentName::new_unchecked(&self.value))),
        }
    }

    pub fn parent(&self) -> Option<&Self> {
        self.split().map(|(parent, _)| parent)
    }

    pub fn basename(&self) -> Option<&DirentName> {
        self.split().map(|(_, basename)| basename)
    }

    pub fn join(&self, entry: &DirentName) -> WcPathBuf {
        let value = if self.value.is_empty() {
            entry.as_str().to_owned()
        } else {
            [&self.value, "/", entry.as_str()].concat()
        };
        WcPathBuf { value }
    }

    pub fn components(&self) -> WcPathComponentsIter<'_> {
        WcPathComponentsIter { value: &self.value }
    }

    /// Appends this path onto the given filesystem directory.
    pub fn to_fs_path(&self, base: &Path) -> PathBuf {
        let mut result = base.to_path_buf();
        for component in self.components() {
            result.push(component.as_str());
        }
        result
    }
}

impl AsRef<WcPath> for WcPathBuf {
    fn as_ref(&self) -> &WcPath {
        self
    }
}

impl Borrow<WcPath> for WcPathBuf {
    fn borrow(&self) -> &WcPath {
        self
    }
}

impl Deref for WcPathBuf {
    type Target = WcPath;

    fn deref(&self) -> &Self::Target {
        WcPath::from_internal_string_unchecked(&self.value)
    }
}

impl ToOwned for WcPath {
    type Owned = WcPathBuf;

    fn to_owned(&self) -> Self::Owned {
        let value = self.value.to_owned();
        WcPathBuf { value }
    }
}

fn is_valid_wc_path_str(value: &str) -> bool {
    value.is_empty() || value.split('/').all(is_valid_dirent_name_str)
}

/// Iterator over `WcPath` components.
#[derive(Clone, Debug)]
pub struct WcPathComponentsIter<'a> {
    value: &'a str,
}

impl<'a> Iterator for WcPathComponentsIter<'a> {
    type Item = &'a DirentName;

    fn next(&mut self) -> Option<Self::Item> {
        if self.value.is_empty() {
            return None;
        }
        let (name, remainder) = self
            .value
            .split_once('/')
            .unwrap_or_else(|| (self.value, &self.value[self.value.len()..]));
        self.value = remainder;
        Some(DirentName::new_unchecked(name))
    }
}

impl FusedIterator for WcPathComponentsIter<'_> {}

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

//! Line-ending translation driven by the `eol-style` property.

#![expect(missing_docs)]

use bstr::BString;
use thiserror::Error;

/// Target line-ending style of a working file, from the `eol-style`
/// property.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EolStyle {
    /// The platform's native line ending.
    Native,
    Lf,
    Crlf,
    Cr,
}

impl EolStyle {
    /// Parses an `eol-style` property value. Unknown values disable
    /// translation.
    pub fn from_prop_value(value: &str) -> Option<Self> {
        match value {
            "native" => Some(Self::Native),
            "LF" => Some(Self::Lf),
            "CRLF" => Some(Self::Crlf),
            "CR" => Some(Self::Cr),
            _ => {
                tracing::warn!(value, "unrecognized eol-style value");
                None
            }
        }
    }

    /// The bytes this style terminates lines with.
    pub fn eol_bytes(self) -> &'static [u8] {
        match self {
            Self::Native if cfg!(windows) => b"\r\n",
            Self::Native => b"\n",
            Self::Lf => b"\n",
            Self::Crlf => b"\r\n",
            Self::Cr => b"\r",
        }
    }
}

/// The input mixes line-ending styles and repair was not requested.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Inconsistent line endings")]
pub struct InconsistentEolsError;

/// The limit up to which file content is probed for binary-ness.
const PROBE_LIMIT: usize = 8 << 10;

/// Whether the content looks binary: a NUL byte within the probe window.
pub fn looks_binary(bytes: &[u8]) -> bool {
    bytes[..bytes.len().min(PROBE_LIMIT)].contains(&0)
}

/// Replaces every line terminator in `input` with `target`. Without
/// `repair`, the input must use one terminator style consistently.
pub fn translate_eol(
    input: &[u8],
    target: &[u8],
    repair: bool,
) -> Result<BString, InconsistentEolsError> {
    let mut out = Vec::with_capacity(input.len());
    let mut seen: Option<&[u8]> = None;
    let mut i = 0;
    while i < input.len() {
        let found: &[u8] = match input[i] {
            b'\n' => b"\n",
            b'\r' if input.get(i + 1) == Some(&b'\n') => b"\r\n",
            b'\r' => b"\r",
            byte => {
                out.push(byte);
                i += 1;
                continue;
            }
        };
        if !repair {
            match seen {
                None => seen = Some(found),
                Some(first) if first == found => {}
                Some(_) => return Err(InconsistentEolsError),
            }
        }
        out.extend_from_slice(target);
        i += found.len();
    }
    Ok(out.into())
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(b"a\nb\n", b"\r\n", b"a\r\nb\r\n"; "LF to CRLF")]
    #[test_case(b"a\r\nb\r\n", b"\n", b"a\nb\n"; "CRLF to LF")]
    #[test_case(b"a\rb\r", b"\n", b"a\nb\n"; "CR to LF")]
    #[test_case(b"a", b"\r\n", b"a"; "no terminator")]
    #[test_case(b"", b"\n", b""; "empty input")]
    #[test_case(b"a\nb", b"\r\n", b"a\r\nb"; "unterminated last line")]
    fn test_translate_uniform(input: &[u8], target: &[u8], expected: &[u8]) {
        assert_eq!(translate_eol(input, target, false).unwrap(), expected);
    }

    #[test]
    fn test_translate_mixed_requires_repair() {
        let input = b"a\nb\r\nc\r";
        assert_eq!(translate_eol(input, b"\n", false), Err(InconsistentEolsError));
        assert_eq!(translate_eol(input, b"\n", true).unwrap(), "a\nb\nc\n");
    }

    #[test]
    fn test_from_prop_value() {
        assert_eq!(EolStyle::from_prop_value("native"), Some(EolStyle::Native));
        assert_eq!(EolStyle::from_prop_value("LF"), Some(EolStyle::Lf));
        assert_eq!(EolStyle::from_prop_value("CRLF"), Some(EolStyle::Crlf));
        assert_eq!(EolStyle::from_prop_value("CR"), Some(EolStyle::Cr));
        assert_eq!(EolStyle::from_prop_value("lf"), None);
    }

    #[test]
    fn test_looks_binary() {
        assert!(looks_binary(b"ab\0cd"));
        assert!(!looks_binary(b"plain text\n"));
        // A NUL past the probe window doesn't flip the decision.
        let mut long = vec![b'a'; PROBE_LIMIT];
        long.push(0);
        assert!(!looks_binary(&long));
    }

}

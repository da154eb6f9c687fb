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

//! Windowed text-delta application.
//!
//! The delta *algorithm* is an external collaborator; this module only
//! interprets a stream of [`DeltaWindow`]s against a source text, producing
//! the target text. Each window views a contiguous span of the source and
//! carries instructions drawing from that view, from the target produced so
//! far within the window, or from the window's new data.

#![expect(missing_docs)]

use bstr::BString;
use thiserror::Error;

/// One instruction of a delta window. Offsets are relative to the window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeltaOp {
    /// Copy `len` bytes from offset `offset` of the window's source view.
    Source { offset: usize, len: usize },
    /// Copy `len` bytes from offset `offset` of the target produced so far
    /// by this window. The region may overlap the output being produced
    /// (run-length style).
    Target { offset: usize, len: usize },
    /// Copy `len` bytes from offset `offset` of the window's new data.
    New { offset: usize, len: usize },
}

/// One window of a text delta.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeltaWindow {
    /// Offset of this window's source view within the source text. Windows
    /// must arrive in order: each view starts at or after the end of the
    /// previous one.
    pub source_offset: u64,
    /// Length of the source view.
    pub source_len: usize,
    pub ops: Vec<DeltaOp>,
    pub new_data: BString,
}

impl DeltaWindow {
    /// A window that ignores the source and emits `data` verbatim. This is
    /// the whole of a delta against an empty source (e.g. a checkout).
    pub fn from_new_data(data: impl Into<BString>) -> Self {
        let new_data: BString = data.into();
        Self {
            source_offset: 0,
            source_len: 0,
            ops: vec![DeltaOp::New {
                offset: 0,
                len: new_data.len(),
            }],
            new_data,
        }
    }

    /// A window copying the source view through unchanged.
    pub fn copy_source(source_offset: u64, source_len: usize) -> Self {
        Self {
            source_offset,
            source_len,
            ops: vec![DeltaOp::Source {
                offset: 0,
                len: source_len,
            }],
            new_data: BString::default(),
        }
    }
}

/// Malformed delta stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeltaError {
    #[error("Delta window source view ({offset}+{len}) is outside the source text")]
    SourceViewOutOfBounds { offset: u64, len: usize },
    #[error("Delta windows arrived out of order")]
    WindowOutOfOrder,
    #[error("Delta instruction reads outside its {what} view")]
    OpOutOfBounds {
        /// Which view the instruction overran: "source", "target" or "new".
        what: &'static str,
    },
}

/// Applies a stream of windows against an in-memory source, accumulating the
/// target text.
#[derive(Debug)]
pub struct DeltaApplier {
    source: Vec<u8>,
    target: BString,
    next_source_offset: u64,
}

impl DeltaApplier {
    pub fn new(source: Vec<u8>) -> Self {
        Self {
            source,
            target: BString::default(),
            next_source_offset: 0,
        }
    }

    /// Applies one window, appending its output to the target.
    pub fn apply_window(&mut self, window: &DeltaWindow) -> Result<(), DeltaError> {
        if window.source_offset < self.next_source_offset {
            return Err(DeltaError::WindowOutOfOrder);
        }
        let view_start = usize::try_from(window.source_offset)
            .map_err(|_| DeltaError::SourceViewOutOfBounds {
                offset: window.source_offset,
                len: window.source_len,
            })?;
        let view_end = view_start
            .checked_add(window.source_len)
            .filter(|&end| end <= self.source.len())
            .ok_or(DeltaError::SourceViewOutOfBounds {
                offset: window.source_offset,
                len: window.source_len,
            })?;
        let source_view = &self.source[view_start..view_end];
        self.next_source_offset = window.source_offset + window.source_len as u64;

        let window_target_start = self.target.len();
        for op in &window.ops {
            match *op {
                DeltaOp::Source { offset, len } => {
                    let end = offset
                        .checked_add(len)
                        .filter(|&end| end <= source_view.len())
                        .ok_or(DeltaError::OpOutOfBounds { what: "source" })?;
                    self.target.extend_from_slice(&source_view[offset..end]);
                }
                DeltaOp::Target { offset, len } => {
                    // The copied region may extend into bytes this very
                    // instruction produces, so copy one byte at a time.
                    let start = window_target_start + offset;
                    if start > self.target.len() {
                        return Err(DeltaError::OpOutOfBounds { what: "target" });
                    }
                    for i in 0..len {
                        let Some(&byte) = self.target.get(start + i) else {
                            return Err(DeltaError::OpOutOfBounds { what: "target" });
                        };
                        self.target.push(byte);
                    }
                }
                DeltaOp::New { offset, len } => {
                    let end = offset
                        .checked_add(len)
                        .filter(|&end| end <= window.new_data.len())
                        .ok_or(DeltaError::OpOutOfBounds { what: "new" })?;
                    self.target.extend_from_slice(&window.new_data[offset..end]);
                }
            }
        }
        Ok(())
    }

    /// Finishes the stream and returns the accumulated target.
    pub fn into_target(self) -> BString {
        self.target
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_new_data_only() {
        let mut applier = DeltaApplier::new(vec![]);
        applier
            .apply_window(&DeltaWindow::from_new_data("fresh contents\n"))
            .unwrap();
        assert_eq!(applier.into_target(), "fresh contents\n");
    }

    #[test]
    fn test_copy_source_through() {
        let mut applier = DeltaApplier::new(b"abcdef".to_vec());
        applier.apply_window(&DeltaWindow::copy_source(0, 6)).unwrap();
        assert_eq!(applier.into_target(), "abcdef");
    }

    #[test]
    fn test_mixed_ops() {
        let mut applier = DeltaApplier::new(b"hello world\n".to_vec());
        let window = DeltaWindow {
            source_offset: 0,
            source_len: 12,
            ops: vec![
                DeltaOp::Source { offset: 0, len: 6 },
                DeltaOp::New { offset: 0, len: 5 },
                DeltaOp::Source { offset: 11, len: 1 },
            ],
            new_data: "earth".into(),
        };
        applier.apply_window(&window).unwrap();
        assert_eq!(applier.into_target(), "hello earth\n");
    }

    #[test]
    fn test_target_op_run_length() {
        let mut applier = DeltaApplier::new(vec![]);
        let window = DeltaWindow {
            source_offset: 0,
            source_len: 0,
            ops: vec![
                DeltaOp::New { offset: 0, len: 2 },
                // Reads its own output as it grows.
                DeltaOp::Target { offset: 0, len: 6 },
            ],
            new_data: "ab".into(),
        };
        applier.apply_window(&window).unwrap();
        assert_eq!(applier.into_target(), "abababab");
    }

    #[test]
    fn test_windows_must_be_ordered() {
        let mut applier = DeltaApplier::new(b"abcdef".to_vec());
        applier.apply_window(&DeltaWindow::copy_source(3, 3)).unwrap();
        assert_matches!(
            applier.apply_window(&DeltaWindow::copy_source(0, 3)),
            Err(DeltaError::WindowOutOfOrder)
        );
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let mut applier = DeltaApplier::new(b"abc".to_vec());
        assert_matches!(
            applier.apply_window(&DeltaWindow::copy_source(0, 4)),
            Err(DeltaError::SourceViewOutOfBounds { .. })
        );
        let window = DeltaWindow {
            source_offset: 0,
            source_len: 3,
            ops: vec![DeltaOp::New { offset: 0, len: 1 }],
            new_data: BString::default(),
        };
        assert_matches!(
            applier.apply_window(&window),
            Err(DeltaError::OpOutOfBounds { what: "new" })
        );
    }
}

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

//! Core library for Arbor, a version-control working-copy engine.
//!
//! The two halves of the library mirror the two halves of the system: the
//! repository side is an immutable node-revision DAG mutated through
//! transactions ([`dag_store`], [`dag_node`], [`simple_dag_store`]), and the
//! working-copy side is a crash-safe update editor that integrates incoming
//! revisions with local modifications ([`update_editor`], [`install`],
//! [`log_journal`]).

#![warn(missing_docs)]

pub mod admin;
pub mod dag_node;
pub mod dag_store;
pub mod delta;
pub mod eol;
pub mod file_util;
pub mod hex_util;
pub mod install;
pub mod keywords;
pub mod lock;
pub mod log_journal;
pub mod object_id;
pub mod props;
pub mod repo_path;
pub mod simple_dag_store;
pub mod status;
pub mod text_merge;
pub mod update_editor;
pub mod working_copy;

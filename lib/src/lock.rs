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

//! Advisory file-based locking.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use thiserror::Error;

/// Failure to take a [`FileLock`].
#[derive(Debug, Error)]
#[error("Failed to lock {path}")]
pub struct FileLockError {
    /// The location of the lock file.
    pub path: PathBuf,
    #[source]
    err: io::Error,
}

/// An exclusive advisory lock backed by a sentinel file.
///
/// The lock is held for the lifetime of the value and released by deleting
/// the sentinel on drop. Lock acquisition retries with backoff for a bounded
/// time, then fails with the underlying error.
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Takes the lock at `path`, waiting a bounded time for a holder to
    /// release it.
    pub fn lock(path: PathBuf) -> Result<Self, FileLockError> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut backoff = Duration::from_millis(10);
        loop {
            match OpenOptions::new().create_new(true).write(true).open(&path) {
                Ok(_file) => {
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(FileLockError { path, err });
                    }
                    tracing::debug!(?path, "waiting for lock");
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_millis(500));
                }
                Err(err) => {
                    return Err(FileLockError { path, err });
                }
            }
        }
    }

}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!(?err, path = ?self.path, "failed to release lock");
        }
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::Duration;

use fs4::fs_std::FileExt;
use rand::Rng;
use tracing::debug;

use crate::credentials::lock_path;
use crate::AuthError;

/// Number of acquisition attempts before giving up.
const MAX_ATTEMPTS: u32 = 5;

/// A held cross-process lock on the credentials file.
/// Dropping the guard releases the OS lock.
pub struct CredentialsLock {
    file: File,
}

impl CredentialsLock {
    /// Acquire the lock at `{config_dir}/.credentials.lock`.
    ///
    /// Acquisition is non-blocking: each failed attempt sleeps 1–2 s with
    /// jitter, up to [`MAX_ATTEMPTS`] attempts total.  Jitter spreads out the
    /// retries of processes that all woke up on the same expired token.
    pub async fn acquire(config_dir: &Path) -> Result<Self, AuthError> {
        std::fs::create_dir_all(config_dir)?;
        let path = lock_path(config_dir);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        for attempt in 1..=MAX_ATTEMPTS {
            match file.try_lock_exclusive() {
                Ok(true) => {
                    debug!(attempt, path = %path.display(), "acquired credentials lock");
                    return Ok(Self { file });
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(attempt, error = %e, "credentials lock attempt failed");
                }
            }
            if attempt < MAX_ATTEMPTS {
                let jitter_ms = rand::thread_rng().gen_range(1000..=2000);
                tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            }
        }
        Err(AuthError::Storage(format!(
            "could not acquire credentials lock at {} after {MAX_ATTEMPTS} attempts",
            path.display()
        )))
    }
}

impl Drop for CredentialsLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

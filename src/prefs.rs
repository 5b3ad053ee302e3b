// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! Durable key→value preferences.
//!
//! Every durable fact the engine keeps between attempts and across reboots
//! lives here: resume cursors, counters, last-known versions. Values are
//! UTF-8 strings, decimal integers, booleans, or base64-wrapped blobs, one
//! file per key on disk, each write atomic (write-temp, fsync, rename).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use thiserror::Error;

/// Well-known keys. The set is closed; new durable facts get a constant
/// here rather than an ad-hoc string at the call site.
pub mod keys {
    pub const PREVIOUS_VERSION: &str = "previous-version";
    pub const BOOT_ID: &str = "boot-id";
    pub const NUM_REBOOTS: &str = "num-reboots";
    pub const PAYLOAD_ATTEMPT_NUMBER: &str = "payload-attempt-number";
    pub const UPDATE_TIMESTAMP_START: &str = "update-timestamp-start";
    pub const SYSTEM_UPDATED_MARKER: &str = "system-updated-marker";
    pub const CURRENT_BYTES_DOWNLOADED: &str = "current-bytes-downloaded";
    pub const TOTAL_BYTES_DOWNLOADED: &str = "total-bytes-downloaded";
    pub const CURRENT_RESPONSE_SIGNATURE: &str = "current-response-signature";
    pub const RESUME_OFFSET: &str = "resume-offset";
    pub const MANIFEST_METADATA_SIZE: &str = "manifest-metadata-size";
    pub const CACHED_MANIFEST: &str = "cached-manifest";
    pub const UPDATE_STATE_PAYLOAD_INDEX: &str = "update-state-payload-index";
    pub const UPDATE_STATE_NEXT_OPERATION: &str = "update-state-next-operation";
    pub const UPDATE_STATE_HASHER_CONTEXT: &str = "update-state-hasher-context";
    pub const UPDATE_COMPLETED_ON_BOOT_ID: &str = "update-completed-on-boot-id";
    pub const ROLLBACK_HAPPENED: &str = "rollback-happened";
    pub const BACKOFF_EXPIRY: &str = "backoff-expiry";
    pub const NUM_URL_FAILURES: &str = "num-url-failures";
    pub const SCATTER_WAIT_PERIOD: &str = "scatter-wait-period";
    pub const SCATTER_CHECK_THRESHOLD: &str = "scatter-check-threshold";
    pub const P2P_NUM_ATTEMPTS: &str = "p2p-num-attempts";
    pub const P2P_FIRST_ATTEMPT_TIMESTAMP: &str = "p2p-first-attempt-timestamp";
    pub const CONSUMER_AUTO_UPDATE_DISABLED: &str = "consumer-auto-update-disabled";
    pub const ABNORMAL_TERMINATION_COUNT: &str = "abnormal-termination-count";
    pub const POWERWASH_MARKER: &str = "powerwash-marker";
}

/// Prefix a key with a subsystem scope, e.g. `scoped("dlc-a", NUM_REBOOTS)`.
pub fn scoped(scope: &str, key: &str) -> String {
    format!("{scope}/{key}")
}

#[derive(Debug, Error)]
pub enum PrefsError {
    #[error("invalid pref key {0:?}")]
    InvalidKey(String),
    #[error("pref io: {0}")]
    Io(#[from] std::io::Error),
}

pub trait Prefs {
    fn get_string(&self, key: &str) -> Option<String>;
    fn set_string(&mut self, key: &str, value: &str) -> Result<(), PrefsError>;
    fn remove(&mut self, key: &str) -> Result<(), PrefsError>;
    fn exists(&self, key: &str) -> bool {
        self.get_string(key).is_some()
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        self.get_string(key)?.trim().parse().ok()
    }
    fn set_int(&mut self, key: &str, value: i64) -> Result<(), PrefsError> {
        self.set_string(key, &value.to_string())
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get_string(key)?.trim() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }
    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), PrefsError> {
        self.set_string(key, if value { "true" } else { "false" })
    }

    fn get_blob(&self, key: &str) -> Option<Vec<u8>> {
        BASE64.decode(self.get_string(key)?).ok()
    }
    fn set_blob(&mut self, key: &str, value: &[u8]) -> Result<(), PrefsError> {
        self.set_string(key, &BASE64.encode(value))
    }
}

/// In-memory prefs for tests and dry runs.
#[derive(Clone, Debug, Default)]
pub struct MemPrefs {
    values: HashMap<String, String>,
}

impl MemPrefs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Prefs for MemPrefs {
    fn get_string(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<(), PrefsError> {
        validate_key(key)?;
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), PrefsError> {
        self.values.remove(key);
        Ok(())
    }
}

/// Filesystem prefs: one file per key under a root directory; scope
/// prefixes become subdirectories.
#[derive(Debug)]
pub struct FsPrefs {
    root: PathBuf,
}

impl FsPrefs {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PrefsError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(FsPrefs { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, PrefsError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

impl Prefs for FsPrefs {
    fn get_string(&self, key: &str) -> Option<String> {
        let path = self.path_for(key).ok()?;
        fs::read_to_string(path).ok()
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<(), PrefsError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write-then-rename keeps the previous value intact on a crash
        // mid-write; the rename is the commit point.
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(value.as_bytes())?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), PrefsError> {
        let path = self.path_for(key)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn validate_key(key: &str) -> Result<(), PrefsError> {
    let well_formed = !key.is_empty()
        && key.split('/').all(|part| {
            !part.is_empty()
                && part != "."
                && part != ".."
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        });
    if well_formed {
        Ok(())
    } else {
        Err(PrefsError::InvalidKey(key.to_string()))
    }
}

/// A counter that lives in a pref: loaded once, flushed on every mutation.
#[derive(Debug)]
pub struct PersistedCounter {
    key: &'static str,
    value: i64,
}

impl PersistedCounter {
    pub fn load(prefs: &dyn Prefs, key: &'static str) -> Self {
        // Negative persisted values are treated as corrupt and reset.
        let value = prefs.get_int(key).filter(|v| *v >= 0).unwrap_or(0);
        PersistedCounter { key, value }
    }

    pub fn get(&self) -> i64 {
        self.value
    }

    pub fn set(&mut self, prefs: &mut dyn Prefs, value: i64) -> Result<(), PrefsError> {
        self.value = value;
        prefs.set_int(self.key, value)
    }

    pub fn increment(&mut self, prefs: &mut dyn Prefs) -> Result<i64, PrefsError> {
        self.set(prefs, self.value + 1)?;
        Ok(self.value)
    }

    pub fn clear(&mut self, prefs: &mut dyn Prefs) -> Result<(), PrefsError> {
        self.value = 0;
        prefs.remove(self.key)
    }
}

/// Keys cleared when an attempt succeeds. Cumulative accounting
/// (total-bytes-downloaded) is retained.
pub const PER_ATTEMPT_KEYS: &[&str] = &[
    keys::PAYLOAD_ATTEMPT_NUMBER,
    keys::CURRENT_BYTES_DOWNLOADED,
    keys::CURRENT_RESPONSE_SIGNATURE,
    keys::RESUME_OFFSET,
    keys::MANIFEST_METADATA_SIZE,
    keys::CACHED_MANIFEST,
    keys::UPDATE_STATE_PAYLOAD_INDEX,
    keys::UPDATE_STATE_NEXT_OPERATION,
    keys::UPDATE_STATE_HASHER_CONTEXT,
    keys::NUM_URL_FAILURES,
    keys::BACKOFF_EXPIRY,
    keys::SCATTER_WAIT_PERIOD,
    keys::SCATTER_CHECK_THRESHOLD,
];

pub fn clear_per_attempt(prefs: &mut dyn Prefs) -> Result<(), PrefsError> {
    for key in PER_ATTEMPT_KEYS {
        prefs.remove(key)?;
    }
    Ok(())
}

/// The explicit reset request clears backoff, scattering, and the progress
/// cursor, leaving counters and accounting alone.
pub fn clear_on_explicit_reset(prefs: &mut dyn Prefs) -> Result<(), PrefsError> {
    for key in [
        keys::BACKOFF_EXPIRY,
        keys::SCATTER_WAIT_PERIOD,
        keys::SCATTER_CHECK_THRESHOLD,
        keys::RESUME_OFFSET,
        keys::MANIFEST_METADATA_SIZE,
        keys::CACHED_MANIFEST,
        keys::UPDATE_STATE_PAYLOAD_INDEX,
        keys::UPDATE_STATE_NEXT_OPERATION,
        keys::UPDATE_STATE_HASHER_CONTEXT,
    ] {
        prefs.remove(key)?;
    }
    Ok(())
}

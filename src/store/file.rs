//! JSON-file backing store.
//!
//! Layout:
//! ```text
//! data_dir/
//!   <session-id>.json        # ids made of [A-Za-z0-9_-]
//!   x-<hex(session-id)>.json # any other id
//! ```
//!
//! Writes go to a temporary sibling first and are renamed into place, so a
//! reader never observes a half-written record.

use super::BackingStore;
use crate::error::{StoreError, StoreResult};
use crate::session::model::SessionRecord;
use std::fmt::Write as _;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const EXTENSION: &str = "json";
const HEX_PREFIX: &str = "x-";

pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{EXTENSION}", encode_file_stem(session_id)))
    }
}

fn is_plain(session_id: &str) -> bool {
    !session_id.is_empty()
        && !session_id.starts_with(HEX_PREFIX)
        && session_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn encode_file_stem(session_id: &str) -> String {
    if is_plain(session_id) {
        return session_id.to_string();
    }
    let mut stem = String::with_capacity(HEX_PREFIX.len() + session_id.len() * 2);
    stem.push_str(HEX_PREFIX);
    for b in session_id.bytes() {
        let _ = write!(stem, "{b:02x}");
    }
    stem
}

fn decode_file_stem(stem: &str) -> Option<String> {
    let Some(hex) = stem.strip_prefix(HEX_PREFIX) else {
        return Some(stem.to_string());
    };
    if hex.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

impl BackingStore for FileStore {
    fn get(&self, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        match fs::read(self.path_for(session_id)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, session_id: &str, record: &SessionRecord) -> StoreResult<()> {
        let path = self.path_for(session_id);
        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
        let bytes = serde_json::to_vec_pretty(record)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, session_id: &str) -> StoreResult<bool> {
        match fs::remove_file(self.path_for(session_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn session_ids(&self) -> StoreResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let id = decode_file_stem(stem).ok_or_else(|| {
                StoreError::Backend(format!("unreadable session file name: {}", path.display()))
            })?;
            ids.push(id);
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

//! Local key/value store for NIC bindings
//!
//! One file per key under the data directory. Writes go to a temp file that
//! is persisted over the target, so a crash leaves either the old or the new
//! value. Keys are percent-encoded to keep `/` out of file names.

use crate::error::AgentError;
use crate::types::IpamMessage;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Ordered key/value store over a directory
#[derive(Debug)]
pub struct Store {
    dir: PathBuf,
}

fn encode_key(key: &str) -> String {
    urlencoding::encode(key).into_owned()
}

fn decode_key(name: &str) -> Option<String> {
    urlencoding::decode(name).ok().map(|k| k.into_owned())
}

/// Key of a shared-mode pod binding
pub fn binding_key(nic_id: &str, container_id: &str) -> String {
    format!("{}/{}", nic_id, container_id)
}

impl Store {
    /// Open (creating if needed) the store at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, AgentError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn put(&self, key: &str, value: &[u8]) -> Result<(), AgentError> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(value)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.dir.join(encode_key(key)))
            .map_err(|e| AgentError::Store(format!("persist {}: {}", key, e.error)))?;
        Ok(())
    }

    /// Remove `key`; a missing key is not an error
    pub fn delete(&self, key: &str) -> Result<(), AgentError> {
        match std::fs::remove_file(self.dir.join(encode_key(key))) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Visit every entry in ascending key order
    pub fn iterate<F>(&self, mut visitor: F) -> Result<(), AgentError>
    where
        F: FnMut(&str, &[u8]) -> Result<(), AgentError>,
    {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            // leftovers of interrupted writes
            if name.starts_with('.') {
                continue;
            }
            match decode_key(name) {
                Some(key) => keys.push((key, entry.path())),
                None => warn!("Skipping undecodable store entry {:?}", name),
            }
        }
        keys.sort();
        for (key, path) in keys {
            let value = std::fs::read(&path)?;
            visitor(&key, &value)?;
        }
        Ok(())
    }

    pub fn close(self) {
        debug!("Closed store at {}", self.dir.display());
    }

    pub fn put_message(&self, key: &str, msg: &IpamMessage) -> Result<(), AgentError> {
        self.put(key, &serde_json::to_vec(msg)?)
    }

    /// Every record, ascending by key
    pub fn load_messages(&self) -> Result<Vec<(String, IpamMessage)>, AgentError> {
        let mut out = Vec::new();
        self.iterate(|key, value| {
            match serde_json::from_slice::<IpamMessage>(value) {
                Ok(msg) => out.push((key.to_string(), msg)),
                Err(e) => warn!("Dropping corrupt store record {}: {}", key, e),
            }
            Ok(())
        })?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qingcloud_client::HostNic;

    fn message(id: &str) -> IpamMessage {
        IpamMessage {
            pod: None,
            nic: HostNic {
                id: id.to_string(),
                hardware_addr: id.to_string(),
                ..HostNic::default()
            },
        }
    }

    #[test]
    fn test_put_iterate_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.put("b", b"2").unwrap();
        store.put("a", b"1").unwrap();
        store.put("a", b"3").unwrap();

        let mut seen = Vec::new();
        store
            .iterate(|k, v| {
                seen.push((k.to_string(), v.to_vec()));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![("a".to_string(), b"3".to_vec()), ("b".to_string(), b"2".to_vec())]);
    }

    #[test]
    fn test_keys_with_slash_and_colon() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let key = binding_key("52:54:00:00:00:01", "c1");
        store.put_message(&key, &message("52:54:00:00:00:01")).unwrap();

        let all = store.load_messages().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "52:54:00:00:00:01/c1");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_delete_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.put("k", b"v").unwrap();
        store.delete("k").unwrap();
        store.delete("k").unwrap();
        assert!(store.load_messages().unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store.put_message("nic-1", &message("nic-1")).unwrap();
            store.close();
        }
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.load_messages().unwrap()[0].1, message("nic-1"));
    }

    #[test]
    fn test_corrupt_record_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.put("bad", b"{not json").unwrap();
        store.put_message("good", &message("good")).unwrap();
        let all = store.load_messages().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "good");
    }
}

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use rand::prelude::*;

use crate::flags::INFO_PREFIX;

pub fn now_msec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock is before unix epoch")
        .as_millis() as u64
}

/// Message keys must be unique without coordination between replicas, so
/// they combine the clock, per-process entropy and a sequence number.
struct KeyGenerator {
    entropy: u64,
    sn: AtomicU64,
}

impl KeyGenerator {
    fn new() -> Self {
        Self {
            entropy: thread_rng().gen::<u64>(),
            sn: AtomicU64::new(0),
        }
    }

    fn gen(&self) -> String {
        // Fixed-width fields keep lexicographic order equal to mint order
        let sn = self.sn.fetch_add(1, Ordering::Relaxed);
        format!("{:013}.R{:016x}Q{:08}.pluto", now_msec(), self.entropy, sn)
    }
}

lazy_static! {
    static ref GENERATOR: KeyGenerator = KeyGenerator::new();
}

pub fn gen_key() -> String {
    GENERATOR.gen()
}

/// One mailbox directory with the `cur`/`new`/`tmp` triple. Values handled
/// here are full Maildir filenames, flag suffix included.
pub struct MaildirFolder {
    root: PathBuf,
}

impl MaildirFolder {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        for sub in ["cur", "new", "tmp"] {
            std::fs::create_dir_all(self.root.join(sub))?;
        }
        Ok(())
    }

    pub fn remove_all(&self) -> std::io::Result<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }

    /// Deliver a new message: write to `tmp`, hardlink into `new`, unlink
    /// the temporary. Returns the minted key. Nothing is visible in `new`
    /// unless the full contents are durable.
    pub fn deliver(&self, contents: &[u8]) -> std::io::Result<String> {
        let key = gen_key();
        let tmp = self.root.join("tmp").join(&key);
        std::fs::write(&tmp, contents)?;
        let target = self.root.join("new").join(&key);
        if let Err(e) = std::fs::hard_link(&tmp, &target) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        std::fs::remove_file(&tmp)?;
        Ok(key)
    }

    /// Materialize a replicated message under the exact value a peer chose.
    /// Values with an info suffix land in `cur`, plain keys in `new`.
    pub fn deliver_as(&self, value: &str, contents: &[u8]) -> std::io::Result<()> {
        let sub = if value.contains(INFO_PREFIX) { "cur" } else { "new" };
        let tmp = self.root.join("tmp").join(value);
        std::fs::write(&tmp, contents)?;
        let target = self.root.join(sub).join(value);
        if let Err(e) = std::fs::hard_link(&tmp, &target) {
            let _ = std::fs::remove_file(&tmp);
            // A replayed delivery may find the file already there
            if target.exists() {
                return Ok(());
            }
            return Err(e);
        }
        std::fs::remove_file(&tmp)
    }

    /// Count messages still sitting in `new` (the RECENT answer).
    pub fn count_new(&self) -> std::io::Result<u32> {
        Ok(std::fs::read_dir(self.root.join("new"))?.count() as u32)
    }

    /// Move everything from `new` to `cur`, keeping filenames unchanged so
    /// the folder-set values stay valid.
    pub fn promote_new(&self) -> std::io::Result<()> {
        for entry in std::fs::read_dir(self.root.join("new"))? {
            let entry = entry?;
            std::fs::rename(entry.path(), self.root.join("cur").join(entry.file_name()))?;
        }
        Ok(())
    }

    /// Where a value currently lives, if anywhere.
    pub fn locate(&self, value: &str) -> Option<PathBuf> {
        for sub in ["cur", "new"] {
            let path = self.root.join(sub).join(value);
            if path.exists() {
                return Some(path);
            }
        }
        None
    }

    pub fn read_value(&self, value: &str) -> std::io::Result<Vec<u8>> {
        let path = self.locate(value).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("message file {} is missing", value),
            )
        })?;
        std::fs::read(path)
    }

    /// Flag change on disk: same key, new info suffix.
    pub fn rename_value(&self, old: &str, new: &str) -> std::io::Result<()> {
        let path = self.locate(old).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("message file {} is missing", old),
            )
        })?;
        // A flagged message belongs in cur, wherever it was before
        std::fs::rename(path, self.root.join("cur").join(new))
    }

    pub fn remove_value(&self, value: &str) -> std::io::Result<()> {
        match self.locate(value) {
            Some(path) => std::fs::remove_file(path),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(dir: &tempfile::TempDir) -> MaildirFolder {
        let f = MaildirFolder::new(dir.path().join("INBOX"));
        f.ensure().unwrap();
        f
    }

    #[test]
    fn deliver_lands_in_new_and_cleans_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let f = folder(&dir);

        let key = f.deliver(b"From: x\r\n\r\nbody\r\n").unwrap();
        assert!(f.root().join("new").join(&key).exists());
        assert!(!f.root().join("tmp").join(&key).exists());
        assert_eq!(f.count_new().unwrap(), 1);
        assert_eq!(f.read_value(&key).unwrap(), b"From: x\r\n\r\nbody\r\n");
    }

    #[test]
    fn promotion_keeps_filenames() {
        let dir = tempfile::tempdir().unwrap();
        let f = folder(&dir);

        let key = f.deliver(b"mail").unwrap();
        f.promote_new().unwrap();
        assert_eq!(f.count_new().unwrap(), 0);
        assert!(f.root().join("cur").join(&key).exists());
        assert!(f.locate(&key).is_some());
    }

    #[test]
    fn rename_moves_into_cur() {
        let dir = tempfile::tempdir().unwrap();
        let f = folder(&dir);

        let key = f.deliver(b"mail").unwrap();
        let flagged = format!("{}:2,S", key);
        f.rename_value(&key, &flagged).unwrap();
        assert!(f.root().join("cur").join(&flagged).exists());
        assert!(f.locate(&key).is_none());
    }

    #[test]
    fn generated_keys_are_unique_and_ordered_types() {
        let a = gen_key();
        let b = gen_key();
        assert_ne!(a, b);
        assert!(a.ends_with(".pluto"));
    }
}

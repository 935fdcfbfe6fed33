use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A file holding a single full snapshot. Every save rewrites the content in
/// place: seek to the start, write, truncate, fsync. The previous snapshot is
/// only gone once the new one is durable.
pub struct SnapFile {
    path: PathBuf,
    file: File,
}

impl SnapFile {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            path: path.to_owned(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back the whole current snapshot.
    pub fn load(&mut self) -> std::io::Result<String> {
        let mut buf = String::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_string(&mut buf)?;
        Ok(buf)
    }

    /// Replace the snapshot. Durable when this returns Ok.
    pub fn save(&mut self, content: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(content)?;
        self.file.set_len(content.len() as u64)?;
        self.file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_shrinks_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap");

        let mut f = SnapFile::open(&path).unwrap();
        f.save(b"a long first snapshot").unwrap();
        f.save(b"short").unwrap();
        assert_eq!(f.load().unwrap(), "short");

        // Reopening must see the last snapshot only
        let mut f2 = SnapFile::open(&path).unwrap();
        assert_eq!(f2.load().unwrap(), "short");
    }
}

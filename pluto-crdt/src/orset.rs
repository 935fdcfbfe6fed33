use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use base64::Engine;
use uuid::Uuid;

use crate::{CrdtError, SnapFile};

/// Unique tag minted for every add. Tags are what removal targets, never
/// values, which is what makes the set observed-remove.
pub type Tag = Uuid;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// An Observed-Remove Set over string values, persisted as a full snapshot
/// after every effect.
///
/// The mapping direction is `tag -> value`: values need not be unique, tags
/// are. `remove(v)` only deletes the tags the local replica has observed, so
/// a concurrent remote `add(v)` with a fresh tag survives the merge.
///
/// Operations are not internally synchronized; callers hold the owning
/// user's lock across mutation + emission.
pub struct OrSet {
    entries: BTreeMap<Tag, String>,
    file: SnapFile,
}

impl OrSet {
    /// Load the set from its snapshot file, creating an empty one if the
    /// file does not exist yet.
    pub fn open(path: &Path) -> Result<Self, CrdtError> {
        let mut file = SnapFile::open(path).map_err(CrdtError::Fatal)?;
        let raw = file.load().map_err(CrdtError::Fatal)?;
        let entries = decode_snapshot(&raw)?;
        Ok(Self { entries, file })
    }

    pub fn lookup(&self, value: &str) -> bool {
        self.entries.values().any(|v| v == value)
    }

    /// Sorted, deduplicated values. Two replicas that applied the same
    /// causal history return the same vector here.
    pub fn values(&self) -> Vec<String> {
        self.entries
            .values()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.entries.contains_key(tag)
    }

    /// Every tag currently bound to `value`.
    pub fn tags_of(&self, value: &str) -> Vec<Tag> {
        self.entries
            .iter()
            .filter(|(_, v)| v.as_str() == value)
            .map(|(t, _)| *t)
            .collect()
    }

    /// All `(tag, value)` pairs, in tag order.
    pub fn pairs(&self) -> Vec<(Tag, String)> {
        self.entries
            .iter()
            .map(|(t, v)| (*t, v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Local add: mint a fresh tag, insert, persist. Returns the
    /// `(value, tag)` pair the caller must broadcast. On a failed persist
    /// the insertion is rolled back before the error is returned.
    pub fn add(&mut self, value: &str) -> Result<(String, Tag), CrdtError> {
        let tag = Uuid::new_v4();
        self.entries.insert(tag, value.to_string());
        if let Err(e) = self.persist() {
            self.entries.remove(&tag);
            return Err(CrdtError::Fatal(e));
        }
        Ok((value.to_string(), tag))
    }

    /// Remote add effect. Idempotent: a tag already present is a no-op.
    pub fn apply_add(&mut self, value: &str, tag: Tag) -> Result<(), CrdtError> {
        if self.entries.contains_key(&tag) {
            return Ok(());
        }
        self.entries.insert(tag, value.to_string());
        if let Err(e) = self.persist() {
            self.entries.remove(&tag);
            return Err(CrdtError::Fatal(e));
        }
        Ok(())
    }

    /// Local remove: collect every tag bound to `value`, delete them,
    /// persist. Returns the observed `(tag, value)` pairs the caller must
    /// broadcast. Fails with `NotPresent` when no tag maps to `value`.
    pub fn remove(&mut self, value: &str) -> Result<Vec<(Tag, String)>, CrdtError> {
        let observed: Vec<(Tag, String)> = self
            .entries
            .iter()
            .filter(|(_, v)| v.as_str() == value)
            .map(|(t, v)| (*t, v.clone()))
            .collect();
        if observed.is_empty() {
            return Err(CrdtError::NotPresent);
        }

        for (tag, _) in &observed {
            self.entries.remove(tag);
        }
        if let Err(e) = self.persist() {
            for (tag, value) in &observed {
                self.entries.insert(*tag, value.clone());
            }
            return Err(CrdtError::Fatal(e));
        }
        Ok(observed)
    }

    /// Remote remove effect: delete each listed tag if present. Tags the
    /// local replica never saw (or already removed) are skipped.
    pub fn apply_remove(&mut self, pairs: &[(Tag, String)]) -> Result<(), CrdtError> {
        let mut deleted = Vec::new();
        for (tag, _) in pairs {
            if let Some(value) = self.entries.remove(tag) {
                deleted.push((*tag, value));
            }
        }
        if deleted.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.persist() {
            for (tag, value) in deleted {
                self.entries.insert(tag, value);
            }
            return Err(CrdtError::Fatal(e));
        }
        Ok(())
    }

    fn persist(&mut self) -> std::io::Result<()> {
        self.file.save(encode_snapshot(&self.entries).as_bytes())
    }
}

/// Snapshot line format: `base64(value);tag` repeated, semicolon-separated.
/// Base64 tolerates every byte in the value; tags are UUIDs and need no
/// escaping. A valid snapshot always has an even number of fields.
fn encode_snapshot(entries: &BTreeMap<Tag, String>) -> String {
    entries
        .iter()
        .map(|(tag, value)| format!("{};{}", B64.encode(value.as_bytes()), tag))
        .collect::<Vec<_>>()
        .join(";")
}

fn decode_snapshot(raw: &str) -> Result<BTreeMap<Tag, String>, CrdtError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(BTreeMap::new());
    }

    let fields: Vec<&str> = raw.split(';').collect();
    if fields.len() % 2 != 0 {
        return Err(CrdtError::BadSnapshot(format!(
            "odd number of fields ({})",
            fields.len()
        )));
    }

    let mut entries = BTreeMap::new();
    for pair in fields.chunks(2) {
        let value = B64
            .decode(pair[0])
            .map_err(|e| CrdtError::BadSnapshot(format!("bad base64 value: {}", e)))?;
        let value = String::from_utf8(value)
            .map_err(|_| CrdtError::BadSnapshot("value is not utf-8".to_string()))?;
        let tag = Uuid::parse_str(pair[1])
            .map_err(|e| CrdtError::BadSnapshot(format!("bad tag: {}", e)))?;
        entries.insert(tag, value);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_in(dir: &tempfile::TempDir, name: &str) -> OrSet {
        OrSet::open(&dir.path().join(name)).unwrap()
    }

    #[test]
    fn add_lookup_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = set_in(&dir, "s.crdt");

        s.add("INBOX").unwrap();
        s.add("Sports").unwrap();
        s.add("Sports").unwrap(); // duplicate value, distinct tag

        assert!(s.lookup("INBOX"));
        assert!(s.lookup("Sports"));
        assert!(!s.lookup("Work"));
        assert_eq!(s.len(), 3);
        assert_eq!(s.values(), vec!["INBOX".to_string(), "Sports".to_string()]);
    }

    #[test]
    fn remove_needs_presence() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = set_in(&dir, "s.crdt");

        assert!(matches!(s.remove("ghost"), Err(CrdtError::NotPresent)));

        s.add("m").unwrap();
        s.add("m").unwrap();
        let removed = s.remove("m").unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!s.lookup("m"));
    }

    #[test]
    fn apply_add_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = set_in(&dir, "s.crdt");

        let (value, tag) = s.add("m").unwrap();
        s.apply_add(&value, tag).unwrap();
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn observed_remove_spares_concurrent_add() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = set_in(&dir, "a.crdt");
        let mut b = set_in(&dir, "b.crdt");

        // Both replicas know v through the same original add
        let (value, tag) = a.add("v").unwrap();
        b.apply_add(&value, tag).unwrap();

        // Concurrently: A adds v again (fresh tag), B removes what it saw
        let (value2, tag2) = a.add("v").unwrap();
        let removed_at_b = b.remove("v").unwrap();

        // Exchange
        b.apply_add(&value2, tag2).unwrap();
        a.apply_remove(&removed_at_b).unwrap();

        // The concurrent add family survives on both sides
        assert!(a.lookup("v"));
        assert!(b.lookup("v"));
        assert_eq!(a.values(), b.values());
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.crdt");

        let mut s = OrSet::open(&path).unwrap();
        s.add("INBOX").unwrap();
        s.add("University.Thesis").unwrap();
        s.add("weird;name with spaces").unwrap();
        let before = s.values();
        let tags_before = s.pairs();
        drop(s);

        let reloaded = OrSet::open(&path).unwrap();
        assert_eq!(reloaded.values(), before);
        assert_eq!(reloaded.pairs(), tags_before);
    }

    #[test]
    fn rejects_odd_field_snapshot() {
        assert!(decode_snapshot("YQ==;not-even;YQ==").is_err());
    }

    #[test]
    fn empty_snapshot_is_empty_set() {
        assert!(decode_snapshot("").unwrap().is_empty());
        assert!(decode_snapshot("\n").unwrap().is_empty());
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use pluto_crdt::OrSet;
use pluto_sync::msg::{MailPayload, Op};
use pluto_sync::sender::SyncRouter;

use crate::flags::{self, Flag};
use crate::maildir::MaildirFolder;
use crate::seqset::SeqSet;
use crate::MailError;

const FOLDER_B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Strip trailing hierarchy separators and canonicalize the INBOX spelling,
/// which is case-insensitive on the wire.
pub fn normalize_name(name: &str) -> String {
    let name = name.trim_end_matches('.');
    if name.eq_ignore_ascii_case("INBOX") {
        "INBOX".to_string()
    } else {
        name.to_string()
    }
}

fn validate_name(name: &str) -> Result<(), MailError> {
    if name.is_empty() {
        return Err(MailError::Precondition("empty mailbox name".to_string()));
    }
    if name.contains(['/', '\0']) || name.starts_with('.') {
        return Err(MailError::Precondition(format!(
            "illegal mailbox name: {}",
            name
        )));
    }
    Ok(())
}

/// IMAP LIST wildcard match with `.` as hierarchy separator: `%` stops at a
/// separator, `*` does not.
pub fn imap_match(pattern: &str, name: &str) -> bool {
    fn rec(p: &[u8], n: &[u8]) -> bool {
        match p.first() {
            None => n.is_empty(),
            Some(b'*') => (0..=n.len()).any(|i| rec(&p[1..], &n[i..])),
            Some(b'%') => (0..=n.len())
                .take_while(|&i| i == 0 || n[i - 1] != b'.')
                .any(|i| rec(&p[1..], &n[i..])),
            Some(c) => n.first() == Some(c) && rec(&p[1..], &n[1..]),
        }
    }
    rec(pattern.as_bytes(), name.as_bytes())
}

/// What SELECT needs to answer: counts and the flag universe of the
/// mailbox.
#[derive(Clone, Debug)]
pub struct SelectSummary {
    pub exists: u32,
    pub recent: u32,
    pub flags: Vec<Flag>,
}

/// The state between the two halves of APPEND. Holding this holds the
/// user's write lock, so nothing else mutates the user until the literal
/// arrives (or the distributor aborts).
pub struct AppendInProgress {
    pub mailbox: String,
    pub size: usize,
    pub flags: Vec<Flag>,
    guard: OwnedRwLockWriteGuard<MailboxState>,
}

struct MailboxState {
    structure: OrSet,
    folders: HashMap<String, OrSet>,
}

/// All replicated state of one user: the mailbox-structure OR-Set, one
/// OR-Set of message values per mailbox, and the Maildir tree they mirror.
///
/// Every mutation happens under the user's write lock and follows the same
/// shape: stage the Maildir effect, persist the OR-Set effect (rolling the
/// staging back on failure), then emit the broadcast operation before the
/// lock is released, so outbound-journal order matches in-memory order.
pub struct UserMailbox {
    user: String,
    subnet: String,
    crdt_dir: PathBuf,
    maildir_dir: PathBuf,
    sync: SyncRouter,
    inner: Arc<RwLock<MailboxState>>,
}

impl UserMailbox {
    /// Load (or provision) one user: seed INBOX into an empty structure
    /// set and open the folder set of every known mailbox.
    pub fn open(
        user: &str,
        subnet: &str,
        crdt_root: &Path,
        maildir_root: &Path,
        sync: SyncRouter,
    ) -> Result<Self, MailError> {
        let crdt_dir = crdt_root.join(user);
        let maildir_dir = maildir_root.join(user);

        let mut structure = OrSet::open(&crdt_dir.join("structure.crdt"))?;
        if !structure.lookup("INBOX") {
            // Provisioning. Each replica seeds its own INBOX entry; the
            // name converges and INBOX is never removable, so the tags
            // never need to agree.
            structure.add("INBOX")?;
        }

        let mut folders = HashMap::new();
        for name in structure.values() {
            let set = OrSet::open(&folder_set_path(&crdt_dir, &name))?;
            MaildirFolder::new(maildir_dir.join(&name)).ensure()?;
            folders.insert(name, set);
        }

        Ok(Self {
            user: user.to_string(),
            subnet: subnet.to_string(),
            crdt_dir,
            maildir_dir,
            sync,
            inner: Arc::new(RwLock::new(MailboxState { structure, folders })),
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn subnet(&self) -> &str {
        &self.subnet
    }

    fn folder_dir(&self, mailbox: &str) -> MaildirFolder {
        MaildirFolder::new(self.maildir_dir.join(mailbox))
    }

    async fn emit(&self, op: Op) -> Result<(), MailError> {
        self.sync
            .submit(&self.subnet, op)
            .await
            .map_err(MailError::Fatal)
    }

    // ---- Observations ----

    /// SELECT: counts and flags. Promotes `new` to `cur` on the way (the
    /// folder-set values are filenames and are not touched by promotion).
    pub async fn select(&self, mailbox: &str) -> Result<SelectSummary, MailError> {
        let mailbox = normalize_name(mailbox);
        let inner = self.inner.write().await;
        let folder = match inner.folders.get(&mailbox) {
            Some(f) if inner.structure.lookup(&mailbox) => f,
            _ => return Err(MailError::NoSuchMailbox),
        };

        let dir = self.folder_dir(&mailbox);
        let recent = dir.count_new()?;
        dir.promote_new()?;

        let values = folder.values();
        let mut present = Vec::new();
        for value in &values {
            let (_, f) = flags::split_value(value);
            present.extend(f);
        }
        present.sort();
        present.dedup();

        Ok(SelectSummary {
            exists: values.len() as u32,
            recent,
            flags: present,
        })
    }

    /// LIST: every structure value matching the wildcard pattern, sorted.
    pub async fn list(&self, reference: &str, pattern: &str) -> Vec<String> {
        let full = format!("{}{}", reference, pattern);
        let inner = self.inner.read().await;
        inner
            .structure
            .values()
            .into_iter()
            .filter(|name| imap_match(&full, name))
            .collect()
    }

    // ---- Mutations ----

    /// CREATE. A dotted name refreshes every prefix segment with a fresh
    /// tag (one operation broadcast per segment), so the whole add-family
    /// outlives a concurrent DELETE of a parent on another replica.
    pub async fn create(&self, mailbox: &str) -> Result<(), MailError> {
        let mailbox = normalize_name(mailbox);
        validate_name(&mailbox)?;

        let mut inner = self.inner.write().await;
        if inner.structure.lookup(&mailbox) {
            return Err(MailError::MailboxExists);
        }

        let mut to_create = Vec::new();
        let mut prefix = String::new();
        for segment in mailbox.split('.') {
            if !prefix.is_empty() {
                prefix.push('.');
            }
            prefix.push_str(segment);
            to_create.push(prefix.clone());
        }

        for name in to_create {
            let fresh_folder = !inner.folders.contains_key(&name);
            let dir = self.folder_dir(&name);
            if fresh_folder {
                dir.ensure()?;
                let set = OrSet::open(&folder_set_path(&self.crdt_dir, &name))?;
                inner.folders.insert(name.clone(), set);
            }

            let add_mailbox = match inner.structure.add(&name) {
                Ok(pair) => pair,
                Err(e) => {
                    if fresh_folder {
                        inner.folders.remove(&name);
                        let _ = dir.remove_all();
                    }
                    return Err(e.into());
                }
            };

            self.emit(Op::Create {
                user: self.user.clone(),
                mailbox: name,
                add_mailbox,
            })
            .await?;
        }
        Ok(())
    }

    /// DELETE. The Maildir directory goes away only after the structure
    /// removal is durable and the folder set is swept; the broadcast
    /// carries the swept mail tags so the observed-remove cascade reaches
    /// the peer.
    pub async fn delete(&self, mailbox: &str) -> Result<(), MailError> {
        let mailbox = normalize_name(mailbox);
        if mailbox == "INBOX" {
            return Err(MailError::Forbidden("Forbidden to delete INBOX"));
        }

        let mut inner = self.inner.write().await;
        if !inner.structure.lookup(&mailbox) {
            return Err(MailError::NoSuchMailbox);
        }

        let rmv_mails = inner
            .folders
            .get(&mailbox)
            .map(|f| f.pairs())
            .unwrap_or_default();
        let rmv_mailbox = inner.structure.remove(&mailbox)?;

        inner.folders.remove(&mailbox);
        remove_file_if_exists(&folder_set_path(&self.crdt_dir, &mailbox))?;
        self.folder_dir(&mailbox).remove_all()?;

        self.emit(Op::Delete {
            user: self.user.clone(),
            mailbox,
            rmv_mailbox,
            rmv_mails,
        })
        .await
    }

    /// RENAME, forbidden on INBOX in either role. Folder-set entries keep
    /// their tags; only the structure entry is swapped.
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), MailError> {
        let from = normalize_name(from);
        let to = normalize_name(to);
        if from == "INBOX" || to == "INBOX" {
            return Err(MailError::Forbidden("Forbidden to rename INBOX"));
        }
        validate_name(&to)?;

        let mut inner = self.inner.write().await;
        if !inner.structure.lookup(&from) {
            return Err(MailError::NoSuchMailbox);
        }
        if inner.structure.lookup(&to) {
            return Err(MailError::MailboxExists);
        }

        let rmv_mailbox = inner.structure.remove(&from)?;
        let add_mailbox = match inner.structure.add(&to) {
            Ok(pair) => pair,
            Err(e) => {
                for (tag, value) in &rmv_mailbox {
                    let _ = inner.structure.apply_add(value, *tag);
                }
                return Err(e.into());
            }
        };

        move_folder_state(&self.crdt_dir, &self.maildir_dir, &mut inner, &from, &to)?;

        self.emit(Op::Rename {
            user: self.user.clone(),
            mailbox: from,
            new_name: to,
            rmv_mailbox,
            add_mailbox,
        })
        .await
    }

    /// First half of APPEND: take the user write lock and keep it until the
    /// literal arrives. `NoSuchMailbox` here becomes `NO [TRYCREATE]`.
    pub async fn append_begin(
        &self,
        mailbox: &str,
        size: usize,
        flags: Vec<Flag>,
    ) -> Result<AppendInProgress, MailError> {
        let mailbox = normalize_name(mailbox);
        let guard = self.inner.clone().write_owned().await;
        if !guard.structure.lookup(&mailbox) {
            return Err(MailError::NoSuchMailbox);
        }
        Ok(AppendInProgress {
            mailbox,
            size,
            flags,
            guard,
        })
    }

    /// Second half of APPEND: deliver through `tmp`, register the value,
    /// broadcast the mail bytes. A failed registration unlinks the
    /// delivered file, so no half-appended message survives.
    pub async fn append_end(
        &self,
        mut pending: AppendInProgress,
        contents: &[u8],
    ) -> Result<(), MailError> {
        if contents.len() != pending.size {
            return Err(MailError::Precondition(format!(
                "expected {} bytes of literal data, got {}",
                pending.size,
                contents.len()
            )));
        }

        let dir = self.folder_dir(&pending.mailbox);
        let key = dir.deliver(contents)?;
        let value = flags::compose_value(&key, &pending.flags);
        if !pending.flags.is_empty() {
            if let Err(e) = dir.rename_value(&key, &value) {
                let _ = dir.remove_value(&key);
                return Err(e.into());
            }
        }

        let folder = pending
            .guard
            .folders
            .get_mut(&pending.mailbox)
            .ok_or(MailError::NoSuchMailbox)?;
        let (value, tag) = match folder.add(&value) {
            Ok(pair) => pair,
            Err(e) => {
                let _ = dir.remove_value(&value);
                return Err(e.into());
            }
        };

        self.emit(Op::Append {
            user: self.user.clone(),
            mailbox: pending.mailbox.clone(),
            add_mail: MailPayload {
                value,
                tag,
                contents: contents.to_vec(),
            },
        })
        .await
        // pending.guard drops here, releasing the user lock
    }

    /// The distributor saw the client hang up between the two halves.
    pub fn append_abort(&self, pending: AppendInProgress) {
        drop(pending);
    }

    /// EXPUNGE every message flagged `\Deleted`. Returns the expunged
    /// sequence numbers in descending order, which is also the order the
    /// untagged responses must be sent in.
    pub async fn expunge(&self, mailbox: &str) -> Result<Vec<u32>, MailError> {
        let mailbox = normalize_name(mailbox);
        let mut inner = self.inner.write().await;
        let folder = inner
            .folders
            .get_mut(&mailbox)
            .ok_or(MailError::NoSuchMailbox)?;

        let values = folder.values();
        let dir = self.folder_dir(&mailbox);
        let mut expunged = Vec::new();
        let mut rmv_mails = Vec::new();

        for (idx, value) in values.iter().enumerate().rev() {
            let (_, value_flags) = flags::split_value(value);
            if !value_flags.contains(&Flag::Deleted) {
                continue;
            }
            rmv_mails.extend(folder.remove(value)?);
            dir.remove_value(value)?;
            expunged.push(idx as u32 + 1);
        }

        if !rmv_mails.is_empty() {
            self.emit(Op::Expunge {
                user: self.user.clone(),
                mailbox,
                rmv_mails,
            })
            .await?;
        }
        Ok(expunged)
    }

    /// STORE: flag edits modeled as remove-old-value + add-new-value, since
    /// the value is the flag-bearing Maildir filename. Returns
    /// `(seq, new flags)` for the untagged FETCH lines.
    pub async fn store(
        &self,
        mailbox: &str,
        seqset: &SeqSet,
        operator: StoreOperator,
        edit: &[Flag],
    ) -> Result<Vec<(u32, Vec<Flag>)>, MailError> {
        let mailbox = normalize_name(mailbox);
        let mut inner = self.inner.write().await;
        let folder = inner
            .folders
            .get_mut(&mailbox)
            .ok_or(MailError::NoSuchMailbox)?;

        let values = folder.values();
        let seqs = seqset.resolve(values.len() as u32)?;
        let dir = self.folder_dir(&mailbox);

        let mut rmv_mails = Vec::new();
        let mut add_mails = Vec::new();
        let mut results = Vec::new();

        for seq in seqs {
            let old_value = &values[(seq - 1) as usize];
            let (key, old_flags) = flags::split_value(old_value);

            let mut new_flags: Vec<Flag> = match operator {
                StoreOperator::Replace => edit.to_vec(),
                StoreOperator::Add => old_flags.iter().chain(edit).copied().collect(),
                StoreOperator::Remove => old_flags
                    .iter()
                    .filter(|f| !edit.contains(f))
                    .copied()
                    .collect(),
            };
            new_flags.sort();
            new_flags.dedup();

            let new_value = flags::compose_value(key, &new_flags);
            if &new_value != old_value {
                dir.rename_value(old_value, &new_value)?;
                let removed = match folder.remove(old_value) {
                    Ok(removed) => removed,
                    Err(e) => {
                        let _ = dir.rename_value(&new_value, old_value);
                        return Err(e.into());
                    }
                };
                let added = match folder.add(&new_value) {
                    Ok(pair) => pair,
                    Err(e) => {
                        for (tag, value) in &removed {
                            let _ = folder.apply_add(value, *tag);
                        }
                        let _ = dir.rename_value(&new_value, old_value);
                        return Err(e.into());
                    }
                };
                rmv_mails.extend(removed);
                add_mails.push(added);
            }
            results.push((seq, new_flags));
        }

        if !add_mails.is_empty() || !rmv_mails.is_empty() {
            self.emit(Op::Store {
                user: self.user.clone(),
                mailbox,
                rmv_mails,
                add_mails,
            })
            .await?;
        }
        Ok(results)
    }

    /// COPY into another mailbox of the same user. Fresh keys are minted so
    /// source and copies never share folder-set values; flags carry over.
    pub async fn copy(
        &self,
        mailbox: &str,
        seqset: &SeqSet,
        destination: &str,
    ) -> Result<(), MailError> {
        let mailbox = normalize_name(mailbox);
        let destination = normalize_name(destination);

        let mut inner = self.inner.write().await;
        if !inner.structure.lookup(&destination) {
            return Err(MailError::NoSuchMailbox);
        }
        let src = inner
            .folders
            .get(&mailbox)
            .ok_or(MailError::NoSuchMailbox)?;

        let values = src.values();
        let seqs = seqset.resolve(values.len() as u32)?;
        let src_dir = self.folder_dir(&mailbox);
        let dst_dir = self.folder_dir(&destination);

        let mut add_mails = Vec::new();
        for seq in seqs {
            let value = &values[(seq - 1) as usize];
            let (_, value_flags) = flags::split_value(value);
            let contents = src_dir.read_value(value)?;

            let new_key = crate::maildir::gen_key();
            let new_value = flags::compose_value(&new_key, &value_flags);
            dst_dir.deliver_as(&new_value, &contents)?;

            let dst = inner
                .folders
                .get_mut(&destination)
                .ok_or(MailError::NoSuchMailbox)?;
            let (new_value, tag) = match dst.add(&new_value) {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = dst_dir.remove_value(&new_value);
                    return Err(e.into());
                }
            };
            add_mails.push(MailPayload {
                value: new_value,
                tag,
                contents,
            });
        }

        if !add_mails.is_empty() {
            self.emit(Op::Copy {
                user: self.user.clone(),
                mailbox: destination,
                add_mails,
            })
            .await?;
        }
        Ok(())
    }

    // ---- Remote effects ----

    /// Apply one replicated operation from a peer. Effects are idempotent;
    /// the receiver guarantees causal order and exactly-once dispatch.
    pub async fn apply(&self, op: &Op) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        match op {
            Op::Create {
                mailbox,
                add_mailbox: (value, tag),
                ..
            } => {
                inner.structure.apply_add(value, *tag)?;
                self.ensure_folder(&mut inner, mailbox)?;
            }
            Op::Delete {
                mailbox,
                rmv_mailbox,
                rmv_mails,
                ..
            } => {
                inner.structure.apply_remove(rmv_mailbox)?;
                if let Some(folder) = inner.folders.get_mut(mailbox) {
                    folder.apply_remove(rmv_mails)?;
                    let dir = self.folder_dir(mailbox);
                    for (_, value) in rmv_mails {
                        if !folder.lookup(value) {
                            dir.remove_value(value)?;
                        }
                    }
                    // Tags from a concurrent add survive and keep the
                    // mailbox alive; only a fully swept one goes away.
                    if !inner.structure.lookup(mailbox) {
                        let fully_swept = inner
                            .folders
                            .get(mailbox)
                            .map(|f| f.is_empty())
                            .unwrap_or(true);
                        if fully_swept {
                            inner.folders.remove(mailbox);
                            remove_file_if_exists(&folder_set_path(&self.crdt_dir, mailbox))?;
                            self.folder_dir(mailbox).remove_all()?;
                        }
                    }
                }
            }
            Op::Rename {
                mailbox,
                new_name,
                rmv_mailbox,
                add_mailbox: (value, tag),
                ..
            } => {
                inner.structure.apply_remove(rmv_mailbox)?;
                inner.structure.apply_add(value, *tag)?;
                if inner.folders.contains_key(mailbox) {
                    move_folder_state(
                        &self.crdt_dir,
                        &self.maildir_dir,
                        &mut inner,
                        mailbox,
                        new_name,
                    )?;
                } else {
                    self.ensure_folder(&mut inner, new_name)?;
                }
            }
            Op::Append {
                mailbox, add_mail, ..
            } => {
                let dir = self.folder_dir(mailbox);
                let folder = self.ensure_folder(&mut inner, mailbox)?;
                if !folder.has_tag(&add_mail.tag) {
                    dir.ensure()?;
                    dir.deliver_as(&add_mail.value, &add_mail.contents)?;
                    folder.apply_add(&add_mail.value, add_mail.tag)?;
                }
            }
            Op::Expunge {
                mailbox, rmv_mails, ..
            } => {
                if let Some(folder) = inner.folders.get_mut(mailbox) {
                    folder.apply_remove(rmv_mails)?;
                    let dir = self.folder_dir(mailbox);
                    for (_, value) in rmv_mails {
                        if !folder.lookup(value) {
                            dir.remove_value(value)?;
                        }
                    }
                }
            }
            Op::Store {
                mailbox,
                rmv_mails,
                add_mails,
                ..
            } => {
                if let Some(folder) = inner.folders.get_mut(mailbox) {
                    folder.apply_remove(rmv_mails)?;
                    let dir = self.folder_dir(mailbox);
                    for (new_value, tag) in add_mails {
                        let fresh = !folder.has_tag(tag);
                        folder.apply_add(new_value, *tag)?;
                        if !fresh {
                            continue;
                        }
                        // Rebind the file on disk: the removed value with
                        // the same key is the old filename.
                        let (new_key, _) = flags::split_value(new_value);
                        let old = rmv_mails
                            .iter()
                            .map(|(_, v)| v)
                            .find(|v| flags::split_value(v).0 == new_key);
                        match old {
                            Some(old_value) if dir.locate(old_value).is_some() => {
                                dir.rename_value(old_value, new_value)?;
                            }
                            _ => tracing::warn!(
                                user = %self.user,
                                value = %new_value,
                                "no local file to carry a replicated flag change"
                            ),
                        }
                    }
                }
            }
            Op::Copy {
                mailbox, add_mails, ..
            } => {
                let dir = self.folder_dir(mailbox);
                let folder = self.ensure_folder(&mut inner, mailbox)?;
                for mail in add_mails {
                    if !folder.has_tag(&mail.tag) {
                        dir.ensure()?;
                        dir.deliver_as(&mail.value, &mail.contents)?;
                        folder.apply_add(&mail.value, mail.tag)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn ensure_folder<'a>(
        &self,
        inner: &'a mut MailboxState,
        mailbox: &str,
    ) -> Result<&'a mut OrSet, MailError> {
        if !inner.folders.contains_key(mailbox) {
            let set = OrSet::open(&folder_set_path(&self.crdt_dir, mailbox))?;
            MaildirFolder::new(self.maildir_dir.join(mailbox)).ensure()?;
            inner.folders.insert(mailbox.to_string(), set);
        }
        Ok(inner.folders.get_mut(mailbox).unwrap())
    }
}

/// Folder-set snapshots are named after the URL-safe base64 of the mailbox
/// name, so any mailbox name stays a legal filename.
fn folder_set_path(crdt_dir: &Path, mailbox: &str) -> PathBuf {
    crdt_dir.join(format!("{}.crdt", FOLDER_B64.encode(mailbox.as_bytes())))
}

fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Move a folder's local state (set snapshot + Maildir directory) under a
/// new mailbox name, keeping every tag.
fn move_folder_state(
    crdt_dir: &Path,
    maildir_dir: &Path,
    inner: &mut MailboxState,
    from: &str,
    to: &str,
) -> Result<(), MailError> {
    let old_set = inner.folders.remove(from);
    let mut new_set = OrSet::open(&folder_set_path(crdt_dir, to))?;
    if let Some(old_set) = old_set {
        for (tag, value) in old_set.pairs() {
            new_set.apply_add(&value, tag)?;
        }
    }
    remove_file_if_exists(&folder_set_path(crdt_dir, from))?;

    let old_dir = maildir_dir.join(from);
    let new_dir = maildir_dir.join(to);
    if old_dir.exists() {
        std::fs::rename(&old_dir, &new_dir)?;
    }
    MaildirFolder::new(new_dir).ensure()?;

    inner.folders.insert(to.to_string(), new_set);
    Ok(())
}

/// The three STORE operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StoreOperator {
    Replace,
    Add,
    Remove,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seqset::{Seq, SeqRange};
    use pluto_sync::sender::SyncRouter;

    fn mailbox_in(dir: &tempfile::TempDir, user: &str) -> UserMailbox {
        // No broadcast link registered: tests that mutate use a routed
        // collector instead (see below) or only observe.
        UserMailbox::open(
            user,
            "worker-1",
            &dir.path().join("crdt"),
            &dir.path().join("maildir"),
            SyncRouter::default(),
        )
        .unwrap()
    }

    /// A router whose link is a plain channel we can drain in the test.
    fn collecting_router() -> (SyncRouter, tokio::sync::mpsc::Receiver<Op>) {
        let (handle, rx) = pluto_sync::sender::SyncHandle::detached();
        let mut router = SyncRouter::default();
        router.insert("worker-1", handle);
        (router, rx)
    }

    fn mailbox_with_router(dir: &tempfile::TempDir, user: &str) -> (UserMailbox, tokio::sync::mpsc::Receiver<Op>) {
        let (router, rx) = collecting_router();
        let mb = UserMailbox::open(
            user,
            "worker-1",
            &dir.path().join("crdt"),
            &dir.path().join("maildir"),
            router,
        )
        .unwrap();
        (mb, rx)
    }

    fn whole_set() -> SeqSet {
        SeqSet(vec![SeqRange {
            from: Seq::Num(1),
            to: Some(Seq::Last),
        }])
    }

    #[test]
    fn wildcard_matching() {
        assert!(imap_match("*", "University.Thesis"));
        assert!(imap_match("%", "University"));
        assert!(!imap_match("%", "University.Thesis"));
        assert!(imap_match("University.%", "University.Thesis"));
        assert!(!imap_match("University.%", "University.Thesis.Draft"));
        assert!(imap_match("Uni*", "University.Thesis.Draft"));
        assert!(imap_match("INBOX", "INBOX"));
        assert!(!imap_match("INBOX", "INBOX2"));
    }

    #[test]
    fn name_normalization() {
        assert_eq!(normalize_name("University."), "University");
        assert_eq!(normalize_name("inbox"), "INBOX");
        assert_eq!(normalize_name("InBoX."), "INBOX");
        assert_eq!(normalize_name("Sports"), "Sports");
    }

    #[tokio::test]
    async fn provisioning_seeds_inbox() {
        let dir = tempfile::tempdir().unwrap();
        let mb = mailbox_in(&dir, "user6");
        assert_eq!(mb.list("", "*").await, vec!["INBOX".to_string()]);

        let summary = mb.select("inbox").await.unwrap();
        assert_eq!(summary.exists, 0);
        assert_eq!(summary.recent, 0);
    }

    #[tokio::test]
    async fn create_rejects_inbox_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let (mb, _ops) = mailbox_with_router(&dir, "user6");

        assert!(matches!(
            mb.create("INBOX").await,
            Err(MailError::MailboxExists)
        ));
        assert!(matches!(
            mb.create("inbox").await,
            Err(MailError::MailboxExists)
        ));

        mb.create("University.").await.unwrap();
        assert!(matches!(
            mb.create("University.").await,
            Err(MailError::MailboxExists)
        ));
    }

    #[tokio::test]
    async fn create_makes_missing_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let (mb, mut ops) = mailbox_with_router(&dir, "user6");

        mb.create("A.B.C").await.unwrap();
        let names = mb.list("", "*").await;
        assert_eq!(
            names,
            vec![
                "A".to_string(),
                "A.B".to_string(),
                "A.B.C".to_string(),
                "INBOX".to_string()
            ]
        );

        // One broadcast per created segment
        for expected in ["A", "A.B", "A.B.C"] {
            match ops.try_recv().unwrap() {
                Op::Create { mailbox, .. } => assert_eq!(mailbox, expected),
                other => panic!("unexpected op {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn delete_protects_inbox_and_requires_presence() {
        let dir = tempfile::tempdir().unwrap();
        let (mb, _ops) = mailbox_with_router(&dir, "user6");

        assert!(matches!(
            mb.delete("INBOX").await,
            Err(MailError::Forbidden(_))
        ));
        assert!(matches!(
            mb.delete("inBox").await,
            Err(MailError::Forbidden(_))
        ));
        assert!(matches!(
            mb.delete("Nope").await,
            Err(MailError::NoSuchMailbox)
        ));

        mb.create("Sports").await.unwrap();
        mb.delete("Sports").await.unwrap();
        assert!(matches!(
            mb.select("Sports").await,
            Err(MailError::NoSuchMailbox)
        ));
    }

    #[tokio::test]
    async fn append_store_expunge_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let (mb, _ops) = mailbox_with_router(&dir, "user6");
        mb.create("Sports").await.unwrap();

        for i in 0..5u8 {
            let mail = format!("Subject: m{}\r\n\r\nbody\r\n", i).into_bytes();
            let pending = mb.append_begin("Sports", mail.len(), vec![]).await.unwrap();
            mb.append_end(pending, &mail).await.unwrap();
        }

        let summary = mb.select("Sports").await.unwrap();
        assert_eq!(summary.exists, 5);
        assert_eq!(summary.recent, 5);

        // STORE 2,4:* +FLAGS (\Seen \Answered) -> seqs 2, 4, 5
        let seqset = SeqSet(vec![
            SeqRange {
                from: Seq::Num(2),
                to: None,
            },
            SeqRange {
                from: Seq::Num(4),
                to: Some(Seq::Last),
            },
        ]);
        let changed = mb
            .store(
                "Sports",
                &seqset,
                StoreOperator::Add,
                &[Flag::Seen, Flag::Answered],
            )
            .await
            .unwrap();
        assert_eq!(
            changed.iter().map(|(s, _)| *s).collect::<Vec<_>>(),
            vec![2, 4, 5]
        );
        for (_, flags) in &changed {
            assert_eq!(flags, &vec![Flag::Answered, Flag::Seen]);
        }

        // Flag everything deleted, then expunge in descending order
        mb.store("Sports", &whole_set(), StoreOperator::Add, &[Flag::Deleted])
            .await
            .unwrap();
        let expunged = mb.expunge("Sports").await.unwrap();
        assert_eq!(expunged, vec![5, 4, 3, 2, 1]);

        let summary = mb.select("Sports").await.unwrap();
        assert_eq!(summary.exists, 0);
    }

    #[tokio::test]
    async fn append_size_mismatch_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (mb, _ops) = mailbox_with_router(&dir, "user6");

        let pending = mb.append_begin("INBOX", 100, vec![]).await.unwrap();
        assert!(matches!(
            mb.append_end(pending, b"way too short").await,
            Err(MailError::Precondition(_))
        ));

        let summary = mb.select("INBOX").await.unwrap();
        assert_eq!(summary.exists, 0);
        assert_eq!(summary.recent, 0);
    }

    #[tokio::test]
    async fn append_into_absent_mailbox_asks_for_trycreate() {
        let dir = tempfile::tempdir().unwrap();
        let mb = mailbox_in(&dir, "user6");
        assert!(matches!(
            mb.append_begin("DoesNotExist", 301, vec![]).await,
            Err(MailError::NoSuchMailbox)
        ));
    }

    #[tokio::test]
    async fn concurrent_delete_and_child_create_converge() {
        // R1 deletes University while R2 concurrently creates
        // University.Thesis; both must converge to {INBOX, University,
        // University.Thesis}.
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        let (r1, mut ops1) = mailbox_with_router(&dir1, "user6");
        let (r2, mut ops2) = mailbox_with_router(&dir2, "user6");

        // Common history: University exists on both
        r1.create("University").await.unwrap();
        let create_univ = ops1.try_recv().unwrap();
        r2.apply(&create_univ).await.unwrap();

        // Concurrently: R1 deletes, R2 creates the child. The child create
        // refreshes the "University" prefix with a fresh tag.
        r1.delete("University").await.unwrap();
        let delete_univ = ops1.try_recv().unwrap();
        r2.create("University.Thesis").await.unwrap();
        let refresh_univ = ops2.try_recv().unwrap();
        let create_thesis = ops2.try_recv().unwrap();

        // Exchange
        r1.apply(&refresh_univ).await.unwrap();
        r1.apply(&create_thesis).await.unwrap();
        r2.apply(&delete_univ).await.unwrap();

        let expected = vec![
            "INBOX".to_string(),
            "University".to_string(),
            "University.Thesis".to_string(),
        ];
        assert_eq!(r1.list("", "*").await, expected);
        assert_eq!(r2.list("", "*").await, expected);
    }

    #[tokio::test]
    async fn replicated_append_and_expunge_converge() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        let (r1, mut ops1) = mailbox_with_router(&dir1, "user6");
        let (r2, _ops2) = mailbox_with_router(&dir2, "user6");

        let mail = b"Subject: hi\r\n\r\nhello\r\n".to_vec();
        let pending = r1.append_begin("INBOX", mail.len(), vec![]).await.unwrap();
        r1.append_end(pending, &mail).await.unwrap();

        let append = ops1.try_recv().unwrap();
        r2.apply(&append).await.unwrap();
        let summary = r2.select("INBOX").await.unwrap();
        assert_eq!(summary.exists, 1);

        // Flag + expunge on R1, replicate both to R2
        r1.select("INBOX").await.unwrap();
        r1.store("INBOX", &whole_set(), StoreOperator::Add, &[Flag::Deleted])
            .await
            .unwrap();
        let store = ops1.try_recv().unwrap();
        assert_eq!(r1.expunge("INBOX").await.unwrap(), vec![1]);
        let expunge = ops1.try_recv().unwrap();

        r2.apply(&store).await.unwrap();
        r2.apply(&expunge).await.unwrap();
        let summary = r2.select("INBOX").await.unwrap();
        assert_eq!(summary.exists, 0);
    }

    #[tokio::test]
    async fn rename_carries_messages() {
        let dir = tempfile::tempdir().unwrap();
        let (mb, _ops) = mailbox_with_router(&dir, "user6");
        mb.create("Old").await.unwrap();

        let mail = b"Subject: x\r\n\r\n.\r\n".to_vec();
        let pending = mb.append_begin("Old", mail.len(), vec![]).await.unwrap();
        mb.append_end(pending, &mail).await.unwrap();

        mb.rename("Old", "New").await.unwrap();
        assert!(matches!(
            mb.select("Old").await,
            Err(MailError::NoSuchMailbox)
        ));
        let summary = mb.select("New").await.unwrap();
        assert_eq!(summary.exists, 1);
    }

    #[tokio::test]
    async fn copy_preserves_flags_and_replicates() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        let (r1, mut ops1) = mailbox_with_router(&dir1, "user6");
        let (r2, _ops2) = mailbox_with_router(&dir2, "user6");

        r1.create("Archive").await.unwrap();
        let create = ops1.try_recv().unwrap();
        r2.apply(&create).await.unwrap();

        let mail = b"Subject: keep\r\n\r\n.\r\n".to_vec();
        let pending = r1.append_begin("INBOX", mail.len(), vec![]).await.unwrap();
        r1.append_end(pending, &mail).await.unwrap();
        let append = ops1.try_recv().unwrap();
        r2.apply(&append).await.unwrap();

        r1.select("INBOX").await.unwrap();
        r1.store("INBOX", &whole_set(), StoreOperator::Add, &[Flag::Seen])
            .await
            .unwrap();
        let store = ops1.try_recv().unwrap();
        r2.apply(&store).await.unwrap();

        r1.copy("INBOX", &whole_set(), "Archive").await.unwrap();
        let copy = ops1.try_recv().unwrap();
        r2.apply(&copy).await.unwrap();

        for replica in [&r1, &r2] {
            let summary = replica.select("Archive").await.unwrap();
            assert_eq!(summary.exists, 1);
            assert_eq!(summary.flags, vec![Flag::Seen]);
        }
    }
}

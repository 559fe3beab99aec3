//! The scan pipeline: walking results in, index corrections out.
//!
//! `scan_subdirs` is the single entry point for full and targeted rescans.
//! It consumes the walker's result stream, applies the folder-type policy to
//! every entry, detects renames, and then sweeps the index for entries that
//! disappeared or changed ignore status.

use std::collections::HashSet;

use async_trait::async_trait;
use strom_model::flags::FLAG_LOCAL_RECEIVE_ONLY;
use strom_model::{DeviceId, FileRecord, Version};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::FolderType;
use crate::error::{Result, SyncError};
use crate::index::IndexSnapshot;
use crate::paths;
use crate::walker::{WalkConfig, WalkItem};

use super::batch::{BatchSink, FileBatch};
use super::state::FolderState;
use super::FolderController;

/// Commits scanned changes: folder health is re-checked on every flush so a
/// scan aborts promptly when the folder goes away mid-walk.
struct ScanSink<'a> {
    folder: &'a FolderController,
}

#[async_trait]
impl BatchSink for ScanSink<'_> {
    async fn commit(&mut self, records: Vec<FileRecord>) -> Result<()> {
        if let Err(err) = self.folder.health_error_without_ignores().await {
            debug!(folder = self.folder.description(), %err, "stopping scan");
            return Err(err);
        }
        self.folder.update_locals_from_scanning(records);
        Ok(())
    }
}

impl FolderController {
    pub(crate) async fn scan_subdirs(&self, subs: Vec<String>) -> Result<()> {
        let old_hash = self.matcher.hash();
        let mut changes = 0i64;
        let res = self.scan_subdirs_inner(subs, &mut changes).await;

        if changes > 0 {
            self.schedule_pull();
        }
        // Pattern edits observed during the scan may have unignored entries
        // we now need from peers.
        if self.matcher.hash() != old_hash {
            debug!(
                folder = self.description(),
                "ignore patterns changed during scanning; triggering pull"
            );
            self.ignores_updated();
            self.schedule_pull();
        }
        res
    }

    async fn scan_subdirs_inner(&self, subs: Vec<String>, changes: &mut i64) -> Result<()> {
        match self.health_error_loading_ignores().await {
            Err(err) => {
                self.set_error(Some(&err));
                return Err(err);
            }
            Ok(()) => self.set_error(None),
        }

        self.state.set_state(FolderState::ScanWaiting);
        let token = self.ctx();
        let res = self.scan_gated(subs, changes, &token).await;
        self.state.set_state(FolderState::Idle);
        res
    }

    async fn scan_gated(
        &self,
        mut subs: Vec<String>,
        changes: &mut i64,
        token: &CancellationToken,
    ) -> Result<()> {
        let _permit = self.limiter.take(token).await?;

        // A blank element means the whole folder.
        if subs.iter().any(|sub| sub.is_empty()) {
            subs.clear();
        }

        let mut snap = self.fset.snapshot();
        let subs = {
            let snap = snap.as_ref();
            normalize_subtrees(subs, &|dir| snap.get(DeviceId::LOCAL, dir).is_some())
        };

        self.state.set_state(FolderState::Scanning);

        let scan_token = token.child_token();
        let walk_cfg = WalkConfig {
            folder_id: self.cfg.id.clone(),
            subs: subs.clone(),
            ignore_perms: self.cfg.ignore_perms,
            auto_normalize: self.cfg.auto_normalize,
            short_id: self.cfg.short_id,
            local_flags: self.cfg.local_flags,
            mod_time_window_ns: self.cfg.mod_time_window_ns,
        };
        let mut results = if self.cfg.folder_type == FolderType::ReceiveEncrypted {
            self.walker.walk_without_hashing(scan_token.clone(), walk_cfg)
        } else {
            self.walker.walk(scan_token.clone(), walk_cfg)
        };

        let mut batch = FileBatch::new();
        let mut sink = ScanSink { folder: self };

        self.journal.clear_scan(&subs);
        let mut already_used: HashSet<String> = HashSet::new();

        while let Some(item) = results.recv().await {
            match item {
                WalkItem::Failed { path, error } => {
                    self.journal.push_scan(path, error);
                }
                WalkItem::Entry(record) => {
                    if let Err(err) = batch.flush_if_full(&mut sink).await {
                        // Unwind without stranding the walker on a full
                        // channel: cancel it and drain what's in flight.
                        scan_token.cancel();
                        while results.recv().await.is_some() {}
                        return Err(err);
                    }

                    let rename_candidate = matches!(
                        self.cfg.folder_type,
                        FolderType::SendReceive | FolderType::SendOnly
                    )
                    .then(|| record.clone());

                    self.append_scanned(&mut batch, record, snap.as_ref(), changes)
                        .await;
                    *changes += 1;

                    if let Some(scanned) = rename_candidate {
                        if let Some(deleted) = self
                            .find_rename(snap.as_ref(), &scanned, &mut already_used, token)
                            .await
                        {
                            self.append_scanned(&mut batch, deleted, snap.as_ref(), changes)
                                .await;
                            *changes += 1;
                        }
                    }
                }
            }
        }

        batch.flush(&mut sink).await?;

        // One empty prefix walks the entire folder contents once.
        let sweep_subs = if subs.is_empty() {
            vec![String::new()]
        } else {
            subs.clone()
        };

        // The sweep needs to see what was just committed.
        drop(snap);
        snap = self.fset.snapshot();

        let mut to_ignore: Vec<FileRecord> = Vec::new();
        let mut ignored_parent = String::new();

        for sub in &sweep_subs {
            let mut iter_error: Option<SyncError> = None;

            let records: Vec<FileRecord> =
                snap.have_prefixed(DeviceId::LOCAL, sub).collect();
            for record in records {
                if token.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }

                if let Err(err) = batch.flush_if_full(&mut sink).await {
                    iter_error = Some(err);
                    break;
                }

                // Left the deferred subtree without meeting an un-ignored
                // child: the buffered entries really are ignored.
                if !ignored_parent.is_empty() && !paths::is_parent(&record.name, &ignored_parent) {
                    for buffered in std::mem::take(&mut to_ignore) {
                        debug!(folder = self.description(), path = %buffered.name, "marking file as ignored");
                        let converted = buffered.into_ignored(self.cfg.short_id);
                        self.append_scanned(&mut batch, converted, snap.as_ref(), changes)
                            .await;
                        *changes += 1;
                        if let Err(err) = batch.flush_if_full(&mut sink).await {
                            iter_error = Some(err);
                            break;
                        }
                    }
                    if iter_error.is_some() {
                        break;
                    }
                    ignored_parent.clear();
                }

                let currently_ignored = self.matcher.is_ignored(&record.name);
                let was_ignored = record.is_ignored();

                if was_ignored && currently_ignored {
                    // Unchanged.
                } else if !was_ignored && currently_ignored {
                    if record.is_directory() {
                        // Delay the conversion, a child might be un-ignored.
                        if ignored_parent.is_empty() {
                            ignored_parent = record.name.clone();
                        }
                        to_ignore.push(record);
                    } else {
                        debug!(folder = self.description(), path = %record.name, "marking file as ignored");
                        let converted = record.into_ignored(self.cfg.short_id);
                        self.append_scanned(&mut batch, converted, snap.as_ref(), changes)
                            .await;
                        *changes += 1;
                    }
                } else if was_ignored || (!record.is_deleted() && !record.is_unsupported()) {
                    // Not ignored (any more) and supposedly present. A plain
                    // stat misses corner cases (parent dir turned symlink,
                    // permission holes), hence the dedicated check.
                    if !self.fs.is_deleted(&record.name).await {
                        if !ignored_parent.is_empty() {
                            // A surviving child un-ignores the parent chain.
                            to_ignore.clear();
                            ignored_parent.clear();
                        }
                    } else {
                        let mut deleted = record.clone().into_deleted(self.cfg.short_id);
                        deleted.local_flags = self.cfg.local_flags;
                        if record.should_conflict() {
                            // The deletion must not override the global
                            // version; an empty version loses the election
                            // and the item comes back on the next pull.
                            deleted.version = Version::new();
                        }
                        debug!(folder = self.description(), path = %deleted.name, "marking file as deleted");
                        self.append_scanned(&mut batch, deleted, snap.as_ref(), changes)
                            .await;
                        *changes += 1;
                    }
                } else if record.is_deleted() && record.is_receive_only_changed() {
                    if self.cfg.folder_type == FolderType::ReceiveOnly {
                        if snap.availability(&record.name).is_empty() {
                            // Deleted, locally changed, and no peer has it:
                            // nothing left to protect.
                            let mut cleared = record;
                            cleared.version = Version::new();
                            cleared.local_flags &= !FLAG_LOCAL_RECEIVE_ONLY;
                            debug!(folder = self.description(), path = %cleared.name, "marking deleted item that doesn't exist anywhere as not receive-only");
                            self.append_scanned(&mut batch, cleared, snap.as_ref(), changes)
                                .await;
                            *changes += 1;
                        }
                    } else {
                        // Folder type changed; the flag no longer applies and
                        // the version needs no bump for a deleted entry.
                        let mut cleared = record;
                        cleared.local_flags &= !FLAG_LOCAL_RECEIVE_ONLY;
                        debug!(folder = self.description(), path = %cleared.name, "removing receive-only flag on deleted item");
                        self.append_scanned(&mut batch, cleared, snap.as_ref(), changes)
                            .await;
                        *changes += 1;
                    }
                }
            }

            if token.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            if iter_error.is_none() && !to_ignore.is_empty() {
                for buffered in std::mem::take(&mut to_ignore) {
                    debug!(folder = self.description(), path = %buffered.name, "marking file as ignored");
                    let converted = buffered.into_ignored(self.cfg.short_id);
                    self.append_scanned(&mut batch, converted, snap.as_ref(), changes)
                        .await;
                    *changes += 1;
                    if let Err(err) = batch.flush_if_full(&mut sink).await {
                        iter_error = Some(err);
                        break;
                    }
                }
                ignored_parent.clear();
            }

            if let Some(err) = iter_error {
                return Err(err);
            }
        }

        batch.flush(&mut sink).await?;

        self.scan_completed();
        Ok(())
    }

    /// Append one scanned entry, applying the folder-type policy.
    async fn append_scanned(
        &self,
        batch: &mut FileBatch,
        mut record: FileRecord,
        snap: &dyn IndexSnapshot,
        changes: &mut i64,
    ) {
        match self.cfg.folder_type {
            FolderType::ReceiveOnly => {
                if let Some(global) = snap.get_global(&record.name) {
                    if global.is_equivalent_ignoring(
                        &record,
                        self.cfg.mod_time_window_ns,
                        FLAG_LOCAL_RECEIVE_ONLY,
                    ) {
                        // Local content matches the global version: adopt it
                        // and drop the local-change marker.
                        record.version = global.version.clone();
                        record.local_flags &= !FLAG_LOCAL_RECEIVE_ONLY;
                    } else if record.is_deleted()
                        && (global.is_receive_only_changed() || global.is_deleted())
                    {
                        // Both sides deleted (or the global is our own
                        // receive-only change): a plain deleted entry will do.
                        record.local_flags &= !FLAG_LOCAL_RECEIVE_ONLY;
                    }
                }
                batch.append(record);
            }
            FolderType::ReceiveEncrypted => {
                if record.is_directory() && is_encrypted_parent(&record.name) {
                    // Virtual parent of encrypted files: never tracked, and
                    // removed from disk once empty.
                    if let Ok(names) = self.fs.dir_names(&record.name).await {
                        if names.is_empty() {
                            let _ = self.fs.remove(&record.name).await;
                        }
                    }
                    *changes -= 1;
                    return;
                }
                // Local changes must not reach remotes as index entries;
                // they surface as out-of-sync items instead.
                record.local_flags = FLAG_LOCAL_RECEIVE_ONLY;
                batch.append(record);
            }
            FolderType::SendReceive | FolderType::SendOnly => {
                batch.append(record);
            }
        }
    }

    /// When a scanned file's content matches an index entry whose path is
    /// gone from disk, emit the matching deletion so peers see a rename
    /// instead of delete-plus-add.
    async fn find_rename(
        &self,
        snap: &dyn IndexSnapshot,
        scanned: &FileRecord,
        already_used: &mut HashSet<String>,
        token: &CancellationToken,
    ) -> Option<FileRecord> {
        if !scanned.has_blocks() || scanned.size == 0 {
            return None;
        }
        let hash = scanned.blocks_hash?;

        let candidates: Vec<FileRecord> = snap.with_blocks_hash(&hash).collect();
        for candidate in candidates {
            if token.is_cancelled() {
                return None;
            }
            // Each name is claimed at most once per scan.
            if already_used.contains(&candidate.name) {
                continue;
            }
            if candidate.should_conflict() {
                continue;
            }
            if self.matcher.is_ignored(&candidate.name) {
                continue;
            }
            // Size is the only remaining cheap check; the blocks hash lookup
            // already compared content.
            if candidate.size != scanned.size {
                continue;
            }
            if !self.fs.is_deleted(&candidate.name).await {
                continue;
            }

            already_used.insert(candidate.name.clone());
            let mut deleted = candidate;
            deleted.set_deleted(self.cfg.short_id);
            deleted.local_flags = self.cfg.local_flags;
            return Some(deleted);
        }
        None
    }
}

/// Canonicalize and de-duplicate scan roots so the walker never receives two
/// overlapping subtrees and always starts at a directory the index knows.
/// `exists` reports whether the index has an entry for a path. An empty
/// result means "scan the whole folder".
pub(crate) fn normalize_subtrees(
    mut dirs: Vec<String>,
    exists: &dyn Fn(&str) -> bool,
) -> Vec<String> {
    if dirs.is_empty() {
        return dirs;
    }
    dirs.sort();
    if dirs[0].is_empty() || dirs[0] == "." || dirs[0] == "/" {
        return Vec::new();
    }

    let mut out: Vec<String> = Vec::with_capacity(dirs.len());
    // Anything that cannot be a parent of a clean path.
    let mut prev = String::from("./");
    for dir in dirs {
        let mut canon = match paths::canonicalize(&dir) {
            Ok(canon) if !canon.is_empty() => canon,
            Ok(_) => continue,
            Err(err) => {
                debug!(path = %dir, %err, "skipping path for scan");
                continue;
            }
        };
        if canon == prev || paths::is_parent(&canon, &prev) {
            continue;
        }
        // Start from the highest ancestor the index doesn't know, so the
        // walker begins at a known directory.
        let mut parent = paths::parent_of(&canon).to_string();
        while !parent.is_empty() && !exists(&parent) {
            canon = parent;
            parent = paths::parent_of(&canon).to_string();
        }
        prev = canon.clone();
        out.push(canon);
    }
    out
}

/// The on-disk layout fans encrypted files out below one- and two-character
/// prefix directories; those two levels are synthetic.
fn is_encrypted_parent(name: &str) -> bool {
    let mut comps = name.split('/');
    match (comps.next(), comps.next(), comps.next()) {
        (Some(first), None, _) => first.len() == 1,
        (Some(first), Some(second), None) => first.len() == 1 && second.len() == 2,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(dirs: &[&str], known: &[&str]) -> Vec<String> {
        let known: Vec<String> = known.iter().map(|s| s.to_string()).collect();
        normalize_subtrees(dirs.iter().map(|s| s.to_string()).collect(), &|dir| {
            known.iter().any(|k| k == dir)
        })
    }

    #[test]
    fn root_markers_mean_whole_folder() {
        assert!(norm(&["a", ""], &[]).is_empty());
        assert!(norm(&["."], &[]).is_empty());
        assert!(norm(&["/"], &[]).is_empty());
    }

    #[test]
    fn descendants_are_dropped() {
        let all = ["a", "a/b", "a/b/c", "b"];
        assert_eq!(norm(&all, &["a", "b"]), vec!["a", "b"]);
    }

    #[test]
    fn duplicates_collapse() {
        assert_eq!(norm(&["a", "a"], &["a"]), vec!["a"]);
    }

    #[test]
    fn unknown_parents_promote() {
        // "x" is unknown to the index, so a scan of "x/y/z" must start at "x".
        assert_eq!(norm(&["x/y/z"], &[]), vec!["x"]);
        assert_eq!(norm(&["x/y/z"], &["x", "x/y"]), vec!["x/y/z"]);
    }

    #[test]
    fn invalid_paths_are_skipped() {
        assert_eq!(norm(&["../evil", "ok"], &["ok"]), vec!["ok"]);
    }

    #[test]
    fn outputs_are_sorted_and_non_overlapping() {
        let out = norm(&["b/sub", "a", "b", "a/x"], &["a", "b", "b/sub", "a/x"]);
        assert_eq!(out, vec!["a", "b"]);
        for (i, dir) in out.iter().enumerate() {
            for other in &out[i + 1..] {
                assert!(!paths::is_parent(other, dir), "{other} under {dir}");
            }
        }
    }

    #[test]
    fn encrypted_parent_levels() {
        assert!(is_encrypted_parent("a"));
        assert!(is_encrypted_parent("a/bc"));
        assert!(!is_encrypted_parent("ab"));
        assert!(!is_encrypted_parent("a/bcd"));
        assert!(!is_encrypted_parent("a/bc/file"));
    }
}

// SPDX-License-Identifier: Apache-2.0

//! Follows the files of a flow across refreshes of the directory listing.
//!
//! Every refresh compares the previous snapshot with a fresh listing. Files
//! are matched by [`FileId`] first; files without a counterpart are matched
//! by header fingerprint to detect copy-truncate rotation and renames that
//! changed identity. Anything that cannot be matched confidently is treated
//! as a new file read from offset 0.
//!
//! The tracker owns the file currently tailed, including its open handle.
//! When a refresh finds the same file again the handle moves to the newer
//! snapshot so no bytes are lost.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::tailing::checkpoint::Checkpointer;
use crate::tailing::config::{FlowConfig, InitialPosition};
use crate::tailing::error::Result;
use crate::tailing::source::file_id::FileId;
use crate::tailing::source::finder::SourceFile;
use crate::tailing::source::header::FileHeader;
use crate::tailing::source::tracked_file::{FileSnapshot, TrackedFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingMode {
    /// Files grow; rotation is followed and the current file stays open
    Continuous,
    /// Files are complete once they stop changing
    WholeFile,
}

pub struct SourceFileTracker {
    source: SourceFile,
    checkpointer: Arc<Checkpointer>,
    mode: TrackingMode,
    initial_position: InitialPosition,
    dwell: Duration,
    ignore_empty_data: bool,
    snapshot: Vec<TrackedFile>,
    /// Files with unread data, in snapshot order
    pending: Vec<TrackedFile>,
    current: Option<TrackedFile>,
    last_refresh: Option<Instant>,
}

impl SourceFileTracker {
    pub fn new(flow: &FlowConfig, source: SourceFile, checkpointer: Arc<Checkpointer>) -> Self {
        let mode = if flow.file_appendable() {
            TrackingMode::Continuous
        } else {
            TrackingMode::WholeFile
        };
        Self {
            source,
            checkpointer,
            mode,
            initial_position: flow.initial_position,
            dwell: flow.max_file_checking(),
            ignore_empty_data: flow.ignore_empty_data,
            snapshot: Vec::new(),
            pending: Vec::new(),
            current: None,
            last_refresh: None,
        }
    }

    pub fn mode(&self) -> TrackingMode {
        self.mode
    }

    pub fn source(&self) -> &SourceFile {
        &self.source
    }

    pub fn snapshot(&self) -> &[TrackedFile] {
        &self.snapshot
    }

    pub fn pending(&self) -> &[TrackedFile] {
        &self.pending
    }

    /// Copies of the pending files, without handles.
    pub fn pending_files(&self) -> Vec<TrackedFile> {
        self.pending.iter().map(TrackedFile::detached).collect()
    }

    pub fn current(&self) -> Option<&TrackedFile> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut TrackedFile> {
        self.current.as_mut()
    }

    pub fn is_current(&self, id: FileId) -> bool {
        self.current.as_ref().is_some_and(|c| c.id() == id)
    }

    pub fn last_refresh(&self) -> Option<Instant> {
        self.last_refresh
    }

    /// Whether the refresh interval has passed since the last refresh.
    pub fn refresh_due(&self, interval: Duration) -> bool {
        self.last_refresh.is_none_or(|t| t.elapsed() >= interval)
    }

    fn flow(&self) -> &str {
        self.checkpointer.flow()
    }

    fn save_checkpoint(&self, file: &TrackedFile, offset: u64) {
        if let Err(e) = self
            .checkpointer
            .store()
            .save_checkpoint(self.flow(), file, offset)
        {
            warn!(flow = %self.flow(), file = %file, offset, error = %e, "Failed to save checkpoint");
        }
    }

    fn reset_checkpoint(&self, file: &TrackedFile) {
        if let Err(e) = self.checkpointer.reset(file) {
            warn!(flow = %self.flow(), file = %file, error = %e, "Failed to reset checkpoint");
        }
    }

    fn stored_offset(&self, id: FileId) -> u64 {
        match self
            .checkpointer
            .store()
            .get_offset_for_file_id(self.flow(), id)
        {
            Ok(offset) => offset,
            Err(e) => {
                warn!(flow = %self.flow(), file_id = %id, error = %e, "Failed to read checkpoint");
                0
            }
        }
    }

    /// Resume from the checkpoints of the flow. Returns false when the flow
    /// has no checkpoints at all.
    pub fn init_from_history(&mut self) -> Result<bool> {
        let rows = self
            .checkpointer
            .store()
            .get_all_checkpoints_for_flow(self.flow())?;
        if rows.is_empty() {
            info!(flow = %self.flow(), "No checkpoints found for flow");
            self.snapshot.clear();
            self.pending.clear();
            return Ok(false);
        }

        self.snapshot = rows
            .into_iter()
            .map(|cp| {
                TrackedFile::new(
                    FileSnapshot {
                        id: cp.file_id,
                        path: cp.path,
                        last_modified: cp.last_modified,
                        size: cp.size,
                    },
                    cp.header.unwrap_or_default(),
                    cp.offset,
                )
            })
            .collect();
        self.pending.clear();
        self.stop_tailing_current_file();

        if self.mode == TrackingMode::WholeFile {
            info!(flow = %self.flow(), files = self.snapshot.len(), "Restored delivered files from checkpoints");
            return Ok(true);
        }

        for i in 0..self.snapshot.len() {
            let candidate = &self.snapshot[i];
            if !self.is_same_file_on_disk(candidate) {
                continue;
            }
            let mut file = candidate.detached();
            match self.open_verified(&mut file) {
                Ok(()) => {
                    info!(flow = %self.flow(), file = %file, offset = file.last_offset(), "Resuming from checkpoint");
                    self.current = Some(file);
                    break;
                }
                Err(e) => {
                    warn!(flow = %self.flow(), file = %file, error = %e, "Cannot resume checkpointed file")
                }
            }
        }
        if self.current.is_none() {
            info!(
                flow = %self.flow(),
                "No checkpointed file is still present, waiting for the next refresh"
            );
        }
        Ok(true)
    }

    /// Whether the path of a checkpointed file still holds the same file.
    /// A header that no longer matches means the identity was reused; such a
    /// file restarts from offset 0 on the next refresh.
    fn is_same_file_on_disk(&self, file: &TrackedFile) -> bool {
        match self.source.resolver().resolve(file.path()) {
            Ok(id) if id == file.id() => {}
            _ => return false,
        }
        match FileHeader::read(file.path(), self.source.header_len()) {
            Ok(header) => header.is_starting_same_as(file.header()),
            Err(_) => false,
        }
    }

    fn open_verified(&self, file: &mut TrackedFile) -> io::Result<()> {
        file.open(file.last_offset())?;
        let opened = file
            .channel_mut()
            .map(|c| self.source.resolver().resolve_file(c))
            .transpose()?;
        if opened != Some(file.id()) {
            file.close();
            return Err(io::Error::other("file was replaced while opening"));
        }
        Ok(())
    }

    /// Start from the files currently on disk. Only the end-of-file initial
    /// position tracks existing files; otherwise they are picked up as new
    /// files by the first refresh.
    pub fn init_from_current_files(&mut self) -> Result<bool> {
        self.stop_tailing_current_file();
        self.pending.clear();
        self.snapshot.clear();
        if self.mode == TrackingMode::WholeFile
            || self.initial_position != InitialPosition::EndOfFile
        {
            return Ok(false);
        }

        let mut files = self.source.list_files()?;
        if files.is_empty() {
            info!(flow = %self.flow(), "No files match the flow");
            return Ok(false);
        }
        for file in files.iter_mut() {
            file.set_last_offset(file.size());
            self.save_checkpoint(file, file.size());
            info!(flow = %self.flow(), file = %file, "File starts from end");
        }
        let mut newest = files[0].detached();
        self.snapshot = files;
        match self.open_verified(&mut newest) {
            Ok(()) => {
                info!(flow = %self.flow(), file = %newest, "Tailing newest file");
                self.current = Some(newest);
            }
            Err(e) => warn!(flow = %self.flow(), file = %newest, error = %e, "Failed to open newest file"),
        }
        Ok(true)
    }

    /// Move the checkpoint of the current file to `offset`, where the
    /// parser found the first record it will emit.
    pub fn checkpoint_current_at(&mut self, offset: u64) {
        let Some(id) = self.current.as_ref().map(|f| f.id()) else {
            return;
        };
        let Some(file) = self.snapshot.iter_mut().find(|f| f.id() == id) else {
            return;
        };
        file.set_last_offset(offset);
        let file = file.detached();
        self.save_checkpoint(&file, offset);
        debug!(flow = %self.flow(), file = %file, offset, "Starting at last record boundary");
    }

    /// Whether the listing changed in a way the next refresh must see
    /// before the refresh interval elapses.
    pub fn must_refresh_snapshot(&self) -> bool {
        match self.source.count_files() {
            Ok(n) if n == self.snapshot.len() => {}
            Ok(_) => return true,
            Err(e) => {
                warn!(flow = %self.flow(), error = %e, "Failed to count files, must refresh");
                return true;
            }
        }
        let resolver = self.source.resolver();
        for file in &self.snapshot {
            let id = match resolver.resolve(file.path()) {
                Ok(id) => id,
                Err(e) => {
                    debug!(path = ?file.path(), error = %e, "Tracked file is gone, must refresh");
                    return true;
                }
            };
            if id != file.id() {
                debug!(path = ?file.path(), old_id = %file.id(), new_id = %id, "File id changed, must refresh");
                return true;
            }
            let size = match std::fs::metadata(file.path()) {
                Ok(m) => m.len(),
                Err(_) => return true,
            };
            if size < file.size() || (size > file.size() && !self.is_current(file.id())) {
                debug!(path = ?file.path(), old_size = file.size(), new_size = size, "File size changed, must refresh");
                return true;
            }
        }
        false
    }

    /// Refresh according to the tracking mode. Returns the number of
    /// pending files.
    pub fn refresh(&mut self) -> Result<usize> {
        match self.mode {
            TrackingMode::Continuous => self.refresh_rotations(),
            TrackingMode::WholeFile => self.refresh_whole_files(),
        }
    }

    fn refresh_rotations(&mut self) -> Result<usize> {
        trace!(flow = %self.flow(), "Refreshing tracked files");
        let mut listing = self.source.list_files()?;

        // the snapshot entry of the current file lags behind its handle
        if let Some(current) = self.current.as_mut() {
            let offset = match current.current_offset() {
                Ok(offset) => offset,
                Err(e) => {
                    warn!(file = %current, error = %e, "Failed to read position of current file");
                    current.last_offset()
                }
            };
            if let Some(old) = self.snapshot.iter_mut().find(|f| f.id() == current.id()) {
                old.set_last_offset(offset);
                old.set_miss_delimiter_since(current.miss_delimiter_since());
            }
        }
        let old = std::mem::take(&mut self.snapshot);
        let analysis = RotationAnalysis::new(&old, &listing);

        // read before the truncated files' own rows are reset below
        let truncated_offsets: HashMap<FileId, u64> = analysis
            .truncated
            .iter()
            .map(|&j| (old[j].id(), self.stored_offset(old[j].id())))
            .collect();

        let current_id = self.current.as_ref().map(|c| c.id());
        let mut same_as_current = None;
        let mut pending = Vec::new();

        for (i, new) in listing.iter_mut().enumerate() {
            let Some(j) = analysis.counterpart(new.id()) else {
                self.adopt_unmatched_file(new, &old, &analysis, &truncated_offsets);
                pending.push(i);
                continue;
            };
            let prior = &old[j];

            if Some(new.id()) == current_id {
                new.set_same_as_current(true);
                same_as_current = Some(i);
            }
            new.set_miss_delimiter_since(prior.miss_delimiter_since());

            if !prior.header().is_empty() && !new.is_starting_same_as(prior) {
                new.set_last_offset(0);
                self.reset_checkpoint(new);
                info!(flow = %self.flow(), file = %new, previous = %prior, "Found truncated file, its id was reused");
                pending.push(i);
                continue;
            }
            if new.size() < prior.size() {
                new.set_last_offset(0);
                self.reset_checkpoint(new);
                info!(flow = %self.flow(), file = %new, previous = %prior, "Found shrunk file");
                pending.push(i);
                continue;
            }
            if prior.is_deleting() {
                info!(flow = %self.flow(), file = %new, "Deleted file is back");
            }

            new.set_last_offset(prior.last_offset());
            if prior.last_offset() < new.size() {
                trace!(file = %new, offset = prior.last_offset(), "File has unread data");
                pending.push(i);
            }
        }

        let mut deleted = Vec::new();
        for &j in &analysis.vanished {
            let gone = &old[j];
            if gone.is_deleting() {
                info!(flow = %self.flow(), file = %gone, "Found deleted file");
                deleted.push(gone.id());
            } else {
                let mut missing = gone.detached();
                missing.set_deleting(true);
                listing.push(missing);
            }
        }
        if !deleted.is_empty() {
            if let Err(e) = self
                .checkpointer
                .store()
                .delete_checkpoints(self.flow(), &deleted)
            {
                warn!(flow = %self.flow(), error = %e, "Failed to delete checkpoints of deleted files");
            }
            self.checkpointer.forget(&deleted);
        }

        self.pending = pending.iter().map(|&i| listing[i].detached()).collect();
        self.snapshot = listing;

        if let Some(mut current) = self.current.take() {
            let next = same_as_current
                .map(|i| &self.snapshot[i])
                .filter(|next| !(next.last_offset() == 0 && current.last_offset() > 0))
                .map(TrackedFile::detached);
            match next {
                Some(next) => self.current = Some(carry_forward(next, &mut current)),
                None => {
                    info!(
                        flow = %self.flow(),
                        file = %current,
                        reason = if same_as_current.is_none() { "deleted" } else { "truncated" },
                        "Closing current file"
                    );
                    current.close();
                }
            }
        }

        self.last_refresh = Some(Instant::now());
        debug!(
            flow = %self.flow(),
            files = self.snapshot.len(),
            pending = self.pending.len(),
            "Refreshed tracked files"
        );
        Ok(self.pending.len())
    }

    /// Decide where a file without an id counterpart starts.
    fn adopt_unmatched_file(
        &self,
        new: &mut TrackedFile,
        old: &[TrackedFile],
        analysis: &RotationAnalysis,
        truncated_offsets: &HashMap<FileId, u64>,
    ) {
        let matches = |candidate: &TrackedFile| {
            !candidate.header().is_empty()
                && !new.header().is_empty()
                && new.is_starting_same_as(candidate)
                && new.size() >= candidate.size()
        };

        let copied: Vec<&TrackedFile> = analysis
            .truncated
            .iter()
            .map(|&j| &old[j])
            .filter(|f| matches(f))
            .collect();
        if let [original] = copied.as_slice() {
            let offset = truncated_offsets
                .get(&original.id())
                .copied()
                .unwrap_or_default();
            new.set_last_offset(offset);
            self.save_checkpoint(new, offset);
            info!(flow = %self.flow(), file = %new, original = %original, offset, "Found copy of truncated file");
            return;
        }

        let renamed: Vec<&TrackedFile> = analysis
            .vanished
            .iter()
            .map(|&j| &old[j])
            .filter(|f| !f.is_deleting() && matches(f))
            .collect();
        if let [original] = renamed.as_slice() {
            let acknowledged = self.stored_offset(original.id());
            new.set_last_offset(original.last_offset());
            self.save_checkpoint(new, acknowledged);
            info!(
                flow = %self.flow(),
                file = %new,
                original = %original,
                offset = original.last_offset(),
                "Found renamed file with a new id"
            );
            return;
        }

        if copied.len() > 1 || renamed.len() > 1 {
            warn!(
                flow = %self.flow(),
                file = %new,
                candidates = copied.len() + renamed.len(),
                "Ambiguous rotation, reading file from the start"
            );
        }
        new.set_last_offset(0);
        self.save_checkpoint(new, 0);
        info!(flow = %self.flow(), file = %new, "Found new file");
    }

    /// Whole files become pending once size and mtime stayed unchanged for
    /// the dwell time. Any change restarts the wait.
    fn refresh_whole_files(&mut self) -> Result<usize> {
        let mut listing = self.source.list_files()?;
        let old = std::mem::take(&mut self.snapshot);
        let analysis = RotationAnalysis::new(&old, &listing);
        let now = Instant::now();
        let mut pending = Vec::new();

        for (i, new) in listing.iter_mut().enumerate() {
            let Some(prior) = analysis.counterpart(new.id()).map(|j| &old[j]) else {
                new.set_stable_since(Some(now));
                info!(flow = %self.flow(), file = %new, "Found new file");
                continue;
            };
            let unchanged =
                prior.size() == new.size() && prior.last_modified() == new.last_modified();
            match prior.stable_since() {
                Some(since) if unchanged && since.elapsed() > self.dwell => {
                    new.set_stable_since(None);
                    new.set_last_offset(0);
                    if self.ignore_empty_data && new.size() == 0 {
                        info!(flow = %self.flow(), file = %new, "Skipping empty file");
                    } else {
                        info!(flow = %self.flow(), file = %new, "File is complete");
                        pending.push(i);
                    }
                }
                _ if !unchanged => {
                    new.set_stable_since(Some(now));
                    debug!(flow = %self.flow(), file = %new, previous = %prior, "File is still changing");
                }
                since => {
                    new.set_stable_since(since);
                    new.set_last_offset(prior.last_offset());
                }
            }
        }

        self.pending = pending.iter().map(|&i| listing[i].detached()).collect();
        self.snapshot = listing;
        self.last_refresh = Some(now);
        Ok(self.pending.len())
    }

    /// Close the current file and open `file` at its last offset.
    pub fn start_tailing_new_file(&mut self, mut file: TrackedFile) -> io::Result<()> {
        self.stop_tailing_current_file();
        self.open_verified(&mut file)?;
        trace!(flow = %self.flow(), file = %file, "Started tailing new file");
        self.pending.retain(|f| f.id() != file.id());
        self.current = Some(file);
        Ok(())
    }

    pub fn stop_tailing_current_file(&mut self) {
        if let Some(mut current) = self.current.take() {
            current.close();
        }
    }

    /// Called when the parser reached the end of the current file. Returns
    /// false when the file still has unread bytes.
    pub fn on_end_of_current_file(&mut self) -> bool {
        let Some(current) = self.current.as_mut() else {
            return true;
        };
        let (offset, size) = match (current.current_offset(), current.current_size()) {
            (Ok(offset), Ok(size)) => (offset, size),
            (Err(e), _) | (_, Err(e)) => {
                warn!(file = %current, error = %e, "Failed to check end of current file");
                return false;
            }
        };
        if offset < size {
            debug!(file = %current, offset, size, "Parser reported end of file before reaching its size");
            return false;
        }
        let id = current.id();
        self.remove_pending(id);
        true
    }

    /// Forget a pending file once it has been handed off.
    pub fn remove_pending(&mut self, id: FileId) {
        self.pending.retain(|f| f.id() != id);
    }

    /// Newest file that is not being deleted, used when nothing else is left
    /// to tail.
    pub fn newest_live_file(&self) -> Option<TrackedFile> {
        self.snapshot
            .iter()
            .find(|f| !f.is_deleting())
            .map(TrackedFile::detached)
    }

    /// Unread bytes of the pending files other than the current one.
    pub fn pending_bytes(&self) -> u64 {
        self.pending
            .iter()
            .filter(|f| !self.is_current(f.id()))
            .map(|f| f.size().saturating_sub(f.last_offset()))
            .sum()
    }
}

/// Move the tailing state of the current file onto its newer snapshot.
fn carry_forward(mut next: TrackedFile, current: &mut TrackedFile) -> TrackedFile {
    next.set_same_as_current(true);
    next.set_miss_delimiter_since(current.miss_delimiter_since());
    if current.is_open() {
        if let Err(e) = next.inherit_channel(current) {
            warn!(file = %next, error = %e, "Failed to carry handle to newer snapshot, reopening");
            current.close();
            if let Err(e) = next.open(current.last_offset()) {
                warn!(file = %next, error = %e, "Failed to reopen current file");
            }
        }
    }
    trace!(file = %next, "Continuing to tail current file");
    next
}

/// Pairs the files of two snapshots.
struct RotationAnalysis {
    /// Old index per file id
    old_by_id: HashMap<FileId, usize>,
    /// Old files whose id now holds different content
    truncated: Vec<usize>,
    /// Old files whose id is not listed anymore
    vanished: Vec<usize>,
}

impl RotationAnalysis {
    fn new(old: &[TrackedFile], new: &[TrackedFile]) -> Self {
        let mut old_by_id = HashMap::with_capacity(old.len());
        for (j, f) in old.iter().enumerate() {
            old_by_id.entry(f.id()).or_insert(j);
        }
        let mut new_by_id = HashMap::with_capacity(new.len());
        for (i, f) in new.iter().enumerate() {
            new_by_id.entry(f.id()).or_insert(i);
        }

        let unmatched_incoming = new.iter().filter(|f| !old_by_id.contains_key(&f.id())).count();
        let mut truncated = Vec::new();
        let mut vanished = Vec::new();
        for (j, prior) in old.iter().enumerate() {
            match new_by_id.get(&prior.id()) {
                None => vanished.push(j),
                Some(&i) if unmatched_incoming > 0 => {
                    let now = &new[i];
                    let rewritten = !prior.header().is_empty() && !now.is_starting_same_as(prior);
                    if now.size() < prior.size() || rewritten {
                        truncated.push(j);
                    }
                }
                Some(_) => {}
            }
        }
        Self {
            old_by_id,
            truncated,
            vanished,
        }
    }

    fn counterpart(&self, id: FileId) -> Option<usize> {
        self.old_by_id.get(&id).copied()
    }
}

// SPDX-License-Identifier: Apache-2.0

use std::cmp::Ordering;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};

use tracing::error;

use crate::tailing::config::FileComparator;
use crate::tailing::source::file_id::{FileId, IdentityResolver};
use crate::tailing::source::header::FileHeader;

/// Facts about a file as observed by one directory listing.
///
/// Shared by every record parsed from the file during that observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSnapshot {
    pub id: FileId,
    pub path: PathBuf,
    /// Milliseconds since the Unix epoch
    pub last_modified: i64,
    pub size: u64,
}

/// A snapshot of a file plus the tailing state attached to it.
///
/// The read handle lives here. It is owned by the tracker and lent to the
/// parser, and moves to the next snapshot of the same file on refresh.
pub struct TrackedFile {
    snapshot: Arc<FileSnapshot>,
    header: FileHeader,
    last_offset: u64,
    channel: Option<File>,
    deleting: bool,
    same_as_current: bool,
    miss_delimiter_since: Option<Instant>,
    stable_since: Option<Instant>,
}

impl TrackedFile {
    /// Snapshot the file at `path`, reading up to `header_len` bytes of header.
    pub fn from_path(
        path: &Path,
        header_len: usize,
        resolver: &dyn IdentityResolver,
    ) -> io::Result<Self> {
        let id = resolver.resolve(path)?;
        let metadata = fs::metadata(path)?;
        let header = FileHeader::read(path, header_len)?;

        // The file may have been replaced while we looked at it.
        let id_after = resolver.resolve(path)?;
        if id != id_after {
            return Err(io::Error::other(format!(
                "{} file id changed from {} to {}",
                path.display(),
                id,
                id_after
            )));
        }

        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();

        Ok(Self::new(
            FileSnapshot {
                id,
                path: path.to_path_buf(),
                last_modified,
                size: metadata.len(),
            },
            header,
            0,
        ))
    }

    pub fn new(snapshot: FileSnapshot, header: FileHeader, last_offset: u64) -> Self {
        Self {
            snapshot: Arc::new(snapshot),
            header,
            last_offset,
            channel: None,
            deleting: false,
            same_as_current: false,
            miss_delimiter_since: None,
            stable_since: None,
        }
    }

    /// Copy of the snapshot without the read handle.
    pub fn detached(&self) -> Self {
        Self {
            snapshot: self.snapshot.clone(),
            header: self.header.clone(),
            last_offset: self.last_offset,
            channel: None,
            deleting: self.deleting,
            same_as_current: false,
            miss_delimiter_since: self.miss_delimiter_since,
            stable_since: self.stable_since,
        }
    }

    pub fn snapshot(&self) -> &Arc<FileSnapshot> {
        &self.snapshot
    }

    pub fn id(&self) -> FileId {
        self.snapshot.id
    }

    pub fn path(&self) -> &Path {
        &self.snapshot.path
    }

    pub fn size(&self) -> u64 {
        self.snapshot.size
    }

    pub fn last_modified(&self) -> i64 {
        self.snapshot.last_modified
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn last_offset(&self) -> u64 {
        self.last_offset
    }

    pub fn set_last_offset(&mut self, offset: u64) {
        self.last_offset = offset;
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting
    }

    pub fn set_deleting(&mut self, deleting: bool) {
        self.deleting = deleting;
    }

    pub fn is_same_as_current(&self) -> bool {
        self.same_as_current
    }

    pub fn set_same_as_current(&mut self, same: bool) {
        self.same_as_current = same;
    }

    pub fn miss_delimiter_since(&self) -> Option<Instant> {
        self.miss_delimiter_since
    }

    pub fn set_miss_delimiter_since(&mut self, since: Option<Instant>) {
        self.miss_delimiter_since = since;
    }

    /// When a whole-file candidate was last seen changing. `None` once settled.
    pub fn stable_since(&self) -> Option<Instant> {
        self.stable_since
    }

    pub fn set_stable_since(&mut self, since: Option<Instant>) {
        self.stable_since = since;
    }

    pub fn is_same_as(&self, other: &TrackedFile) -> bool {
        self.id() == other.id()
    }

    pub fn is_starting_same_as(&self, other: &TrackedFile) -> bool {
        self.header.is_starting_same_as(&other.header)
    }

    pub fn open(&mut self, offset: u64) -> io::Result<()> {
        if self.channel.is_some() {
            return Err(io::Error::other(format!(
                "{} is already open",
                self.path().display()
            )));
        }
        let mut file = File::open(self.path())?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))?;
        }
        self.channel = Some(file);
        Ok(())
    }

    /// Release the read handle, remembering its position as the last offset.
    pub fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            match channel.stream_position() {
                Ok(pos) => self.last_offset = pos,
                Err(e) => error!(path = ?self.path(), error = %e, "Failed to read channel position"),
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    pub fn channel_mut(&mut self) -> Option<&mut File> {
        self.channel.as_mut()
    }

    /// Take over the open handle of an earlier snapshot of the same file.
    pub fn inherit_channel(&mut self, previous: &mut TrackedFile) -> io::Result<()> {
        if self.channel.is_some() {
            return Err(io::Error::other("file already has an open channel"));
        }
        if previous.id() != self.id() {
            return Err(io::Error::other(format!(
                "file id differs (old: {}, new: {})",
                previous.id(),
                self.id()
            )));
        }
        match previous.channel.take() {
            Some(channel) => {
                self.channel = Some(channel);
                Ok(())
            }
            None => Err(io::Error::other("previous file does not have an open channel")),
        }
    }

    /// Read position of the open handle, or the last offset when closed.
    pub fn current_offset(&mut self) -> io::Result<u64> {
        if let Some(channel) = self.channel.as_mut() {
            self.last_offset = channel.stream_position()?;
        }
        Ok(self.last_offset)
    }

    /// Live size through the open handle, or from the path when closed.
    pub fn current_size(&self) -> io::Result<u64> {
        match &self.channel {
            Some(channel) => Ok(channel.metadata()?.len()),
            None => match fs::metadata(self.path()) {
                Ok(m) => Ok(m.len()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
                Err(e) => Err(e),
            },
        }
    }
}

impl fmt::Debug for TrackedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedFile")
            .field("id", &self.id())
            .field("path", &self.path())
            .field("last_modified", &self.last_modified())
            .field("size", &self.size())
            .field("last_offset", &self.last_offset)
            .field("header_len", &self.header.len())
            .field("open", &self.is_open())
            .field("deleting", &self.deleting)
            .finish()
    }
}

impl fmt::Display for TrackedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.path().display(),
            self.id(),
            self.size(),
            self.last_modified()
        )
    }
}

/// Order two files, newest first: later mtime, then the naturally greater
/// file name. The full path breaks any remaining tie.
pub fn newest_first(a: &TrackedFile, b: &TrackedFile) -> Ordering {
    b.last_modified()
        .cmp(&a.last_modified())
        .then_with(|| compare_file_name(&file_name(b), &file_name(a)))
        .then_with(|| a.path().cmp(b.path()))
}

pub fn sort_files(files: &mut [TrackedFile], comparator: FileComparator) {
    match comparator {
        FileComparator::NewestFirst => files.sort_by(newest_first),
        FileComparator::OldestFirst => files.sort_by(|a, b| newest_first(b, a)),
    }
}

fn file_name(f: &TrackedFile) -> String {
    f.path()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Compare file names so that embedded numbers order by value:
/// `app.log.9` sorts before `app.log.10`.
pub fn compare_file_name(a: &str, b: &str) -> Ordering {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut i = 0;
    while i < a.len() && i < b.len() && a[i] == b[i] {
        i += 1;
    }
    if i == a.len() || i == b.len() {
        return a.len().cmp(&b.len());
    }

    let (c1, c2) = (a[i], b[i]);
    match (c1.is_ascii_digit(), c2.is_ascii_digit()) {
        (true, true) => {
            let run = |s: &[char]| {
                s[i + 1..]
                    .iter()
                    .take_while(|c| c.is_ascii_digit())
                    .count()
            };
            run(&a).cmp(&run(&b)).then(c1.cmp(&c2))
        }
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => c1.cmp(&c2),
    }
}

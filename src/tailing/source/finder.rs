// SPDX-License-Identifier: Apache-2.0

use glob::glob;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;

use crate::tailing::config::{FileComparator, FlowConfig};
use crate::tailing::error::{Error, Result};
use crate::tailing::source::file_id::IdentityResolver;
use crate::tailing::source::tracked_file::{TrackedFile, sort_files};

/// The set of files a flow reads: a directory plus a file-name glob.
pub struct SourceFile {
    directory: PathBuf,
    file_glob: String,
    name_pattern: glob::Pattern,
    recursive: bool,
    processed_suffix: Option<String>,
    ignored_extensions: &'static [&'static str],
    comparator: FileComparator,
    header_len: usize,
    resolver: Arc<dyn IdentityResolver>,
}

impl SourceFile {
    pub fn new(flow: &FlowConfig, resolver: Arc<dyn IdentityResolver>) -> Result<Self> {
        let (directory, file_glob) = flow.source_parts();
        if directory.as_os_str().is_empty() {
            return Err(Error::InvalidGlob(format!(
                "{} has no directory component",
                flow.file_pattern
            )));
        }
        let name_pattern =
            glob::Pattern::new(&file_glob).map_err(|e| Error::InvalidGlob(e.to_string()))?;

        Ok(Self {
            directory,
            file_glob,
            name_pattern,
            recursive: flow.directory_recursion,
            processed_suffix: flow.file_suffix.clone().filter(|s| !s.is_empty()),
            ignored_extensions: flow.limits().ignored_extensions,
            comparator: flow.file_comparator,
            header_len: flow.header_bytes,
            resolver,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn resolver(&self) -> &Arc<dyn IdentityResolver> {
        &self.resolver
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Snapshot every matching file, ordered by the flow's comparator.
    pub fn list_files(&self) -> Result<Vec<TrackedFile>> {
        let mut files = Vec::new();
        for path in self.find_paths()? {
            match TrackedFile::from_path(&path, self.header_len, self.resolver.as_ref()) {
                Ok(f) => files.push(f),
                Err(e) => warn!(
                    path = ?path,
                    error = %e,
                    "Skipping file that could not be tracked, it may have been removed"
                ),
            }
        }
        sort_files(&mut files, self.comparator);
        Ok(files)
    }

    pub fn count_files(&self) -> Result<usize> {
        Ok(self.find_paths()?.len())
    }

    fn find_paths(&self) -> Result<Vec<PathBuf>> {
        if !self.directory.exists() {
            return Ok(Vec::new());
        }

        let base = glob::Pattern::escape(&self.directory.to_string_lossy());
        let pattern = if self.recursive {
            format!("{}/**/*", base)
        } else {
            format!("{}/*", base)
        };
        let matches = glob(&pattern).map_err(|e| Error::InvalidGlob(e.to_string()))?;

        let mut seen = HashSet::new();
        let mut paths = Vec::new();
        for entry in matches {
            let path = match entry {
                Ok(path) => path,
                // unreadable entries are skipped rather than failing the listing
                Err(e) => {
                    warn!(path = ?e.path(), error = %e.error(), "Skipping unreadable entry");
                    continue;
                }
            };
            if self.accepts(&path) && seen.insert(path.clone()) {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    fn accepts(&self, path: &Path) -> bool {
        if !path.is_file() {
            return false;
        }
        let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
            return false;
        };
        if name.starts_with('.') || !self.name_pattern.matches(&name) {
            return false;
        }
        if let Some(suffix) = &self.processed_suffix {
            if name.ends_with(suffix.as_str()) {
                return false;
            }
        }
        let lower = name.to_lowercase();
        !self
            .ignored_extensions
            .iter()
            .any(|ext| lower.ends_with(ext))
    }
}

impl std::fmt::Display for SourceFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.directory.join(&self.file_glob).display())
    }
}

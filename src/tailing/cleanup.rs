// SPDX-License-Identifier: Apache-2.0

//! What to do with a source file once all of it has been delivered.
//!
//! Only applies to flows whose files do not grow. A file is handled when
//! the acknowledged end offset equals its size and the path still refers
//! to the same file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::tailing::config::{DeletePolicy, FlowConfig};
use crate::tailing::source::file_id::IdentityResolver;
use crate::tailing::source::tracked_file::FileSnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupAction {
    Delete,
    MoveTo(PathBuf),
    RenameWithSuffix(String),
}

pub struct FileCleanup {
    action: CleanupAction,
    resolver: Arc<dyn IdentityResolver>,
}

impl FileCleanup {
    /// The flow's cleanup, if it has one. Delete wins over move, move over rename.
    pub fn from_flow(flow: &FlowConfig, resolver: Arc<dyn IdentityResolver>) -> Option<Self> {
        if flow.file_appendable() {
            return None;
        }
        let action = if flow.delete_policy == DeletePolicy::Immediate {
            CleanupAction::Delete
        } else if let Some(dir) = &flow.file_move_to_dir {
            CleanupAction::MoveTo(dir.clone())
        } else if let Some(suffix) = flow.file_suffix.as_ref().filter(|s| !s.is_empty()) {
            CleanupAction::RenameWithSuffix(suffix.clone())
        } else {
            return None;
        };
        Some(Self { action, resolver })
    }

    pub fn action(&self) -> &CleanupAction {
        &self.action
    }

    /// Clean every file whose acknowledged end reached its size. Returns how
    /// many files were handled.
    pub fn apply(&self, acknowledged: &[(Arc<FileSnapshot>, u64)]) -> usize {
        let mut handled = 0;
        for (file, end_offset) in acknowledged {
            if *end_offset < file.size {
                continue;
            }
            match self.clean(file) {
                Ok(Some(target)) => {
                    handled += 1;
                    info!(path = ?file.path, target = ?target, "Moved delivered file");
                }
                Ok(None) => {
                    handled += 1;
                    info!(path = ?file.path, "Deleted delivered file");
                }
                Err(e) => warn!(
                    path = ?file.path,
                    file_id = %file.id,
                    error = %e,
                    action = ?self.action,
                    "Failed to clean up delivered file"
                ),
            }
        }
        handled
    }

    /// Returns the new path, or `None` when the file was deleted.
    fn clean(&self, file: &FileSnapshot) -> io::Result<Option<PathBuf>> {
        let id = self.resolver.resolve(&file.path)?;
        if id != file.id {
            return Err(io::Error::other(format!(
                "path now refers to file {} instead of {}",
                id, file.id
            )));
        }
        let size = fs::metadata(&file.path)?.len();
        if size != file.size {
            return Err(io::Error::other(format!(
                "file size changed from {} to {}",
                file.size, size
            )));
        }

        match &self.action {
            CleanupAction::Delete => {
                fs::remove_file(&file.path)?;
                Ok(None)
            }
            CleanupAction::MoveTo(dir) => {
                fs::create_dir_all(dir)?;
                let target = dir.join(file_name(&file.path)?);
                fs::rename(&file.path, &target)?;
                Ok(Some(target))
            }
            CleanupAction::RenameWithSuffix(suffix) => {
                let mut name = file_name(&file.path)?.to_os_string();
                name.push(suffix);
                let target = file.path.with_file_name(name);
                fs::rename(&file.path, &target)?;
                Ok(Some(target))
            }
        }
    }
}

fn file_name(path: &Path) -> io::Result<&std::ffi::OsStr> {
    path.file_name()
        .ok_or_else(|| io::Error::other(format!("{} has no file name", path.display())))
}

// SPDX-License-Identifier: Apache-2.0

//! Platform-independent file identity based on inode (Unix) or file index (Windows).
//!
//! The identity survives renames, which is what lets the tracker follow a log
//! file through rotation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::str::FromStr;

/// A platform-independent unique identifier for a file.
///
/// On Unix systems, this is the device ID + inode number.
/// On Windows, this is the volume serial number + file index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    /// Create a FileId from raw device and inode values.
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }

    /// Create a FileId from an open file handle.
    #[cfg(unix)]
    pub fn from_file(file: &File) -> io::Result<Self> {
        use std::os::unix::fs::MetadataExt;

        let metadata = file.metadata()?;
        Ok(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    /// Create a FileId from an open file handle.
    #[cfg(windows)]
    pub fn from_file(file: &File) -> io::Result<Self> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::{
            BY_HANDLE_FILE_INFORMATION, GetFileInformationByHandle,
        };

        let handle = file.as_raw_handle() as HANDLE;
        let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { std::mem::zeroed() };

        let result = unsafe { GetFileInformationByHandle(handle, &mut info) };
        if result == 0 {
            return Err(io::Error::last_os_error());
        }

        let file_index = ((info.nFileIndexHigh as u64) << 32) | (info.nFileIndexLow as u64);

        Ok(Self {
            dev: info.dwVolumeSerialNumber as u64,
            ino: file_index,
        })
    }

    /// Create a FileId from a path by opening the file.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        Self::from_file(&file)
    }

    pub fn dev(&self) -> u64 {
        self.dev
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

impl FromStr for FileId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (dev, ino) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid file id: {}", s))?;
        let dev = dev
            .parse()
            .map_err(|e| format!("invalid file id device {}: {}", s, e))?;
        let ino = ino
            .parse()
            .map_err(|e| format!("invalid file id inode {}: {}", s, e))?;
        Ok(Self { dev, ino })
    }
}

/// Resolves the identity of the file currently at a path.
///
/// Injected into the tracker so identity lookups can be substituted in tests.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, path: &Path) -> io::Result<FileId>;

    fn resolve_file(&self, file: &File) -> io::Result<FileId>;
}

/// Resolver backed by the filesystem's inode / file index.
#[derive(Debug, Default, Clone, Copy)]
pub struct InodeResolver;

impl IdentityResolver for InodeResolver {
    fn resolve(&self, path: &Path) -> io::Result<FileId> {
        FileId::from_path(path)
    }

    fn resolve_file(&self, file: &File) -> io::Result<FileId> {
        FileId::from_file(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_id_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "test").unwrap();
        drop(file);

        let id1 = FileId::from_path(&path).unwrap();
        let id2 = FileId::from_path(&path).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_file_id_survives_rename() {
        let dir = tempfile::tempdir().unwrap();
        let path1 = dir.path().join("app.log");
        let path2 = dir.path().join("app.log.1");
        File::create(&path1).unwrap();

        let before = InodeResolver.resolve(&path1).unwrap();
        std::fs::rename(&path1, &path2).unwrap();
        let after = InodeResolver.resolve(&path2).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_file_id_different_files() {
        let dir = tempfile::tempdir().unwrap();
        let path1 = dir.path().join("a.log");
        let path2 = dir.path().join("b.log");
        File::create(&path1).unwrap();
        File::create(&path2).unwrap();

        assert_ne!(
            FileId::from_path(&path1).unwrap(),
            FileId::from_path(&path2).unwrap()
        );
    }

    #[test]
    fn test_display_parse() {
        let id = FileId::new(2049, 131077);
        assert_eq!(id.to_string(), "2049:131077");
        assert_eq!("2049:131077".parse::<FileId>().unwrap(), id);
        assert!("nonsense".parse::<FileId>().is_err());
        assert!("1:x".parse::<FileId>().is_err());
    }
}

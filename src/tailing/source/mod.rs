// SPDX-License-Identifier: Apache-2.0

//! File identity, fingerprints, snapshots and directory listing.

pub mod file_id;
pub mod finder;
pub mod header;
pub mod tracked_file;

pub use file_id::{FileId, IdentityResolver, InodeResolver};
pub use finder::SourceFile;
pub use header::FileHeader;
pub use tracked_file::{FileSnapshot, TrackedFile};

// Copyright 2016 Mozilla Foundation
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use filetime::FileTime;
use memmap2::Mmap;
use std::fs::{self, File};
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Timestamps are compared at whole-second granularity, the resolution
/// the cache can rely on across filesystems.
pub fn unix_seconds(time: SystemTime) -> i64 {
    FileTime::from_system_time(time).unix_seconds()
}

/// A read-only view of a file's contents. Empty files aren't mapped at
/// all, since mapping zero bytes fails on most platforms.
pub struct FileView {
    map: Option<Mmap>,
}

impl Deref for FileView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.map {
            Some(ref map) => map,
            None => &[],
        }
    }
}

/// Map `file` for reading. The mapping is released when the returned view
/// is dropped.
pub fn map_file(file: &File) -> io::Result<FileView> {
    let len = file.metadata()?.len();
    if len == 0 {
        Ok(FileView { map: None })
    } else {
        let map = unsafe { Mmap::map(file)? };
        Ok(FileView { map: Some(map) })
    }
}

/// Compute a relative path from `from` to `to`. Both must be absolute;
/// anything else is returned unchanged.
pub fn relative_path(from: &Path, to: &Path) -> PathBuf {
    if !from.is_absolute() || !to.is_absolute() {
        return to.to_path_buf();
    }
    let from_parts: Vec<_> = from.components().collect();
    let to_parts: Vec<_> = to.components().collect();
    let common = from_parts
        .iter()
        .zip(to_parts.iter())
        .take_while(|&(a, b)| a == b)
        .count();
    let mut result = PathBuf::new();
    for _ in common..from_parts.len() {
        result.push("..");
    }
    for part in &to_parts[common..] {
        result.push(part.as_os_str());
    }
    if result.as_os_str().is_empty() {
        result.push(".");
    }
    result
}

/// Rewrite `path` relative to the current working directory if it is
/// prefixed by the configured base directory, to make cache entries
/// shareable between builds in different checkouts.
pub fn make_relative_path(base_dir: Option<&Path>, cwd: &Path, path: &Path) -> PathBuf {
    match base_dir {
        Some(base) if path.starts_with(base) => relative_path(cwd, path),
        _ => path.to_path_buf(),
    }
}

/// Move a file, falling back to copy-and-unlink when the rename crosses
/// filesystems.
pub fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
            Err(io::Error::new(io::ErrorKind::NotFound, "source missing"))
        }
        Err(_) => {
            fs::copy(src, dst)?;
            fs::remove_file(src)
        }
    }
}

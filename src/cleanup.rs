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

//! Cache maintenance: trimming each top-level directory to its configured
//! limits (oldest files first) and wiping the cache entirely. Deletion
//! races with running compilations are fine; readers treat a missing file
//! as a miss.

use config::Config;
use stats;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

use errors::*;

struct CacheFile {
    path: PathBuf,
    mtime: SystemTime,
    size: u64,
}

fn collect_files(dir: &Path) -> Vec<CacheFile> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || entry.file_name() == "stats" {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            files.push(CacheFile {
                path: entry.path().to_path_buf(),
                mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                size: meta.len(),
            });
        }
    }
    files
}

fn cleanup_dir(dir: &Path) -> Result<()> {
    let stats_file = dir.join("stats");
    let (max_files, max_size_kib) = stats::limits(&stats_file);
    let mut files = collect_files(dir);
    files.sort_by_key(|f| f.mtime);

    let mut total_files = files.len() as u64;
    let mut total_kib: u64 = files.iter().map(|f| f.size / 1024).sum();

    let mut deleted = 0;
    for file in &files {
        let over_files = max_files > 0 && total_files > max_files;
        let over_size = max_size_kib > 0 && total_kib > max_size_kib;
        if !over_files && !over_size {
            break;
        }
        match fs::remove_file(&file.path) {
            Ok(()) => {
                total_files -= 1;
                total_kib -= file.size / 1024;
                deleted += 1;
            }
            Err(e) => debug!("failed to remove {:?}: {}", file.path, e),
        }
    }
    if deleted > 0 {
        debug!("removed {} files from {:?}", deleted, dir);
    }
    stats::set_sizes(&stats_file, total_files, total_kib);
    Ok(())
}

/// Enforce the configured limits in every top-level cache directory and
/// recalculate the size counters.
pub fn cleanup_all(conf: &Config) -> Result<()> {
    for name in "0123456789abcdef".chars() {
        let dir = conf.cache_dir.join(name.to_string());
        if dir.is_dir() {
            cleanup_dir(&dir)?;
        }
    }
    Ok(())
}

/// Delete every cached file, keeping the statistics and limits.
pub fn wipe_all(conf: &Config) -> Result<()> {
    for name in "0123456789abcdef".chars() {
        let dir = conf.cache_dir.join(name.to_string());
        if !dir.is_dir() {
            continue;
        }
        for file in collect_files(&dir) {
            if let Err(e) = fs::remove_file(&file.path) {
                debug!("failed to remove {:?}: {}", file.path, e);
            }
        }
        stats::set_sizes(&dir.join("stats"), 0, 0);
    }
    Ok(())
}

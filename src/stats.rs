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

//! Persistent event counters, one small file per cache subdirectory plus
//! one at the cache root for events recorded before the object name is
//! known. Updates are read-modify-rewrite through a temporary file;
//! concurrent writers may lose a count, which is harmless.

use config::Config;
use number_prefix::NumberPrefix;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use errors::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    /// Update size counters only.
    None = 0,
    CompilerProducedStdout = 1,
    CompileFailed = 2,
    InternalError = 3,
    /// A miss that ran the real compiler and populated the cache.
    CacheMiss = 4,
    PreprocessorError = 5,
    CouldNotFindCompiler = 6,
    MissingCacheFile = 7,
    CacheHitPreprocessed = 8,
    BadCompilerArguments = 9,
    CalledForLink = 10,
    FilesInCache = 11,
    CacheSizeKib = 12,
    MaxFiles = 13,
    MaxSizeKib = 14,
    UnsupportedSourceLanguage = 15,
    OutputToDevice = 16,
    NoInputFile = 17,
    MultipleSourceFiles = 18,
    Autoconf = 19,
    UnsupportedCompilerOption = 20,
    OutputToStdout = 21,
    CacheHitDirect = 22,
    CompilerProducedNoOutput = 23,
    CompilerProducedEmptyOutput = 24,
    BadExtraFile = 25,
}

pub const NUM_COUNTERS: usize = 26;

/// Counters that describe the cache's contents rather than events; these
/// survive `zero-stats`.
const PERSISTENT_SLOTS: [usize; 4] = [
    Statistic::FilesInCache as usize,
    Statistic::CacheSizeKib as usize,
    Statistic::MaxFiles as usize,
    Statistic::MaxSizeKib as usize,
];

/// Counters shown by the summary, in display order, with their labels.
const DISPLAY: &'static [(Statistic, &'static str)] = &[
    (Statistic::CacheHitDirect, "cache hit (direct)"),
    (Statistic::CacheHitPreprocessed, "cache hit (preprocessed)"),
    (Statistic::CacheMiss, "cache miss"),
    (Statistic::CalledForLink, "called for link"),
    (Statistic::MultipleSourceFiles, "multiple source files"),
    (Statistic::CompilerProducedStdout, "compiler produced stdout"),
    (Statistic::CompilerProducedNoOutput, "compiler produced no output"),
    (Statistic::CompilerProducedEmptyOutput, "compiler produced empty output"),
    (Statistic::CompileFailed, "compile failed"),
    (Statistic::InternalError, "internal error"),
    (Statistic::PreprocessorError, "preprocessor error"),
    (Statistic::CouldNotFindCompiler, "couldn't find the compiler"),
    (Statistic::MissingCacheFile, "cache file missing"),
    (Statistic::BadCompilerArguments, "bad compiler arguments"),
    (Statistic::UnsupportedSourceLanguage, "unsupported source language"),
    (Statistic::UnsupportedCompilerOption, "unsupported compiler option"),
    (Statistic::OutputToStdout, "output to stdout"),
    (Statistic::OutputToDevice, "output to a non-regular file"),
    (Statistic::NoInputFile, "no input file"),
    (Statistic::Autoconf, "autoconf compile/link"),
    (Statistic::BadExtraFile, "error hashing extra file"),
];

pub fn read_counters(path: &Path) -> Vec<u64> {
    let mut counters = vec![0u64; NUM_COUNTERS];
    if let Ok(data) = fs::read_to_string(path) {
        for (i, token) in data.split_whitespace().take(NUM_COUNTERS).enumerate() {
            counters[i] = token.parse().unwrap_or(0);
        }
    }
    counters
}

pub fn write_counters(path: &Path, counters: &[u64]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).chain_err(|| format!("failed to create {:?}", parent))?;
    let mut tmp =
        NamedTempFile::new_in(parent).chain_err(|| format!("failed to create temp file in {:?}", parent))?;
    let line = counters
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    writeln!(tmp, "{}", line).chain_err(|| "failed to write stats")?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .chain_err(|| format!("failed to persist {:?}", path))?;
    Ok(())
}

/// Bump an event counter. Best effort: statistics never make a run fail.
pub fn update(stats_file: &Path, stat: Statistic) {
    update_size(stats_file, stat, 0, 0);
}

/// Bump an event counter and account for bytes/files added to the cache.
pub fn update_size(stats_file: &Path, stat: Statistic, size_kib: u64, files: u64) {
    let mut counters = read_counters(stats_file);
    if stat != Statistic::None {
        counters[stat as usize] += 1;
    }
    counters[Statistic::FilesInCache as usize] += files;
    counters[Statistic::CacheSizeKib as usize] += size_kib;
    if let Err(e) = write_counters(stats_file, &counters) {
        debug!("failed to update stats file {:?}: {}", stats_file, e);
    }
}

/// Overwrite the content counters after a cleanup recalculated them.
pub fn set_sizes(stats_file: &Path, files: u64, size_kib: u64) {
    let mut counters = read_counters(stats_file);
    counters[Statistic::FilesInCache as usize] = files;
    counters[Statistic::CacheSizeKib as usize] = size_kib;
    if let Err(e) = write_counters(stats_file, &counters) {
        debug!("failed to update stats file {:?}: {}", stats_file, e);
    }
}

fn subdir_names() -> Vec<String> {
    "0123456789abcdef".chars().map(|c| c.to_string()).collect()
}

fn all_stats_files(conf: &Config) -> Vec<PathBuf> {
    let mut files = vec![conf.cache_dir.join("stats")];
    for name in subdir_names() {
        files.push(conf.cache_dir.join(name).join("stats"));
    }
    files
}

fn collect(conf: &Config) -> Vec<u64> {
    let mut totals = vec![0u64; NUM_COUNTERS];
    for file in all_stats_files(conf) {
        for (total, value) in totals.iter_mut().zip(read_counters(&file)) {
            *total += value;
        }
    }
    totals
}

pub fn format_size(kib: u64) -> String {
    match NumberPrefix::binary((kib * 1024) as f64) {
        NumberPrefix::Standalone(bytes) => format!("{:.0} bytes", bytes),
        NumberPrefix::Prefixed(prefix, n) => format!("{:.1} {}B", n, prefix),
    }
}

/// Print the statistics summary for the whole cache.
pub fn summary(conf: &Config) {
    let totals = collect(conf);
    println!("{:<32} {:?}", "cache directory", conf.cache_dir);
    for &(stat, label) in DISPLAY {
        let value = totals[stat as usize];
        if value > 0 {
            println!("{:<32} {:8}", label, value);
        }
    }
    println!("{:<32} {:8}", "files in cache", totals[Statistic::FilesInCache as usize]);
    println!(
        "{:<32} {:>8}",
        "cache size",
        format_size(totals[Statistic::CacheSizeKib as usize])
    );
    let max_files = totals[Statistic::MaxFiles as usize];
    if max_files > 0 {
        println!("{:<32} {:8}", "max files", max_files);
    }
    let max_size = totals[Statistic::MaxSizeKib as usize];
    if max_size > 0 {
        println!("{:<32} {:>8}", "max cache size", format_size(max_size));
    }
}

/// Zero the event counters, keeping the content and limit counters.
pub fn zero(conf: &Config) -> Result<()> {
    for file in all_stats_files(conf) {
        if !file.exists() {
            continue;
        }
        let mut counters = read_counters(&file);
        for (slot, counter) in counters.iter_mut().enumerate() {
            if !PERSISTENT_SLOTS.contains(&slot) {
                *counter = 0;
            }
        }
        write_counters(&file, &counters)?;
    }
    Ok(())
}

/// Store new cache limits in every subdirectory's stats file. `None`
/// leaves the respective limit untouched; `0` means unlimited.
pub fn set_limits(conf: &Config, max_files: Option<u64>, max_size_kib: Option<u64>) -> Result<()> {
    for name in subdir_names() {
        let file = conf.cache_dir.join(name).join("stats");
        let mut counters = read_counters(&file);
        if let Some(files) = max_files {
            // Limits are spread evenly over the 16 top-level directories.
            counters[Statistic::MaxFiles as usize] = files / 16;
        }
        if let Some(size) = max_size_kib {
            counters[Statistic::MaxSizeKib as usize] = size / 16;
        }
        write_counters(&file, &counters)?;
    }
    Ok(())
}

/// The limits recorded in one subdirectory's stats file.
pub fn limits(stats_file: &Path) -> (u64, u64) {
    let counters = read_counters(stats_file);
    (
        counters[Statistic::MaxFiles as usize],
        counters[Statistic::MaxSizeKib as usize],
    )
}

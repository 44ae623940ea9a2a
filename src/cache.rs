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

//! The content-addressed disk store. Files are spread over a configurable
//! number of single-character subdirectories and only ever appear under
//! their final names via rename, so concurrent readers either see a
//! complete file or none at all.

use config::Config;
use filetime::{set_file_times, FileTime};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use errors::*;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Transform an object name into its full path inside the cache,
/// creating the intermediate levels as needed.
pub fn get_path_in_cache(conf: &Config, name: &str, suffix: &str) -> Result<PathBuf> {
    let mut path = conf.cache_dir.clone();
    for level in 0..conf.nlevels {
        path.push(&name[level..level + 1]);
    }
    fs::create_dir_all(&path).chain_err(|| format!("failed to create {:?}", path))?;
    path.push(format!("{}{}", &name[conf.nlevels..], suffix));
    Ok(path)
}

/// Whether a stored file is compressed, by its magic bytes.
pub fn test_if_compressed(path: &Path) -> bool {
    let mut magic = [0u8; 2];
    match File::open(path).and_then(|mut f| f.read_exact(&mut magic)) {
        Ok(()) => magic == GZIP_MAGIC,
        Err(_) => false,
    }
}

/// Open a stored file for reading, decompressing transparently.
pub fn open_cached_file(path: &Path) -> io::Result<Box<Read>> {
    let file = File::open(path)?;
    if test_if_compressed(path) {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// Copy `src` to `dst`, optionally compressing the destination and
/// always decompressing a compressed source. The copy is written to a
/// unique temporary sibling of `dst` and renamed into place.
pub fn copy_file(src: &Path, dst: &Path, compress_dest: bool) -> io::Result<()> {
    let mut reader = open_cached_file(src)?;
    let parent = dst.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(parent)?;
    if compress_dest {
        let mut encoder = GzEncoder::new(tmp.as_file_mut(), Compression::default());
        io::copy(&mut reader, &mut encoder)?;
        encoder.finish()?;
    } else {
        io::copy(&mut reader, tmp.as_file_mut())?;
    }
    tmp.as_file_mut().flush()?;
    tmp.persist(dst).map_err(|e| e.error)?;
    Ok(())
}

/// Move a freshly produced file into the cache under its final name.
/// The source is expected to live next to the destination already, so
/// the uncompressed case is a single rename.
pub fn move_file_into_cache(src: &Path, dst: &Path, compress: bool) -> io::Result<()> {
    if compress {
        copy_file(src, dst, true)?;
        fs::remove_file(src)
    } else {
        fs::rename(src, dst)
    }
}

/// Touch a cache file so LRU cleanup doesn't reclaim entries that are
/// still being used, and so hard-linked outputs get a sensible mtime.
pub fn update_mtime(path: &Path) {
    let now = FileTime::now();
    if let Err(e) = set_file_times(path, now, now) {
        debug!("failed to update mtime of {:?}: {}", path, e);
    }
}

/// Create the standard cache-marker file on first use.
pub fn create_cachedir_tag(cache_dir: &Path) -> io::Result<()> {
    let path = cache_dir.join("CACHEDIR.TAG");
    if path.exists() {
        return Ok(());
    }
    let mut file = File::create(&path)?;
    file.write_all(
        b"Signature: 8a477f597d28d172789f06886806bc55\n\
          # This file is a cache directory tag created by cache-tool.\n\
          # For information about cache directory tags, see:\n\
          #\thttp://www.brynosaurus.com/cachedir/\n",
    )
}

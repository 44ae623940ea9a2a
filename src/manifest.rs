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

//! The manifest maps a direct-mode key to the objects previously produced
//! from it, each paired with a snapshot of the include files observed at
//! the time. A lookup succeeds when some entry's entire snapshot still
//! matches the filesystem. Manifests are always stored compressed, and a
//! reader treats anything it can't parse as a miss.

use bincode;
use config::Config;
use digest::{Digest, FileHash};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hashutil::hash_source_code_file;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::NamedTempFile;

use errors::*;

const MAGIC: &'static [u8; 4] = b"cTmF";
const VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    object: FileHash,
    include_files: BTreeMap<PathBuf, FileHash>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    entries: Vec<ManifestEntry>,
}

fn read_manifest(path: &Path) -> Option<Manifest> {
    let mut file = File::open(path).ok()?;
    let mut header = [0u8; 5];
    file.read_exact(&mut header).ok()?;
    if &header[..4] != &MAGIC[..] || header[4] != VERSION {
        debug!("manifest {:?} has unknown format, treating as miss", path);
        return None;
    }
    let mut data = Vec::new();
    GzDecoder::new(file).read_to_end(&mut data).ok()?;
    match bincode::deserialize(&data) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            debug!("corrupt manifest {:?} ({}), treating as miss", path, e);
            None
        }
    }
}

fn write_manifest(path: &Path, manifest: &Manifest) -> Result<()> {
    let data = bincode::serialize(manifest).chain_err(|| "failed to serialize manifest")?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(parent)
        .chain_err(|| format!("failed to create temp file in {:?}", parent))?;
    tmp.write_all(&MAGIC[..]).chain_err(|| "failed to write manifest")?;
    tmp.write_all(&[VERSION]).chain_err(|| "failed to write manifest")?;
    {
        let mut encoder = GzEncoder::new(tmp.as_file_mut(), Compression::default());
        encoder.write_all(&data).chain_err(|| "failed to write manifest")?;
        encoder.finish().chain_err(|| "failed to write manifest")?;
    }
    tmp.persist(path)
        .map_err(|e| e.error)
        .chain_err(|| format!("failed to persist {:?}", path))?;
    Ok(())
}

/// Rehash one include file and compare against its recorded state. A file
/// that disappeared, changed, turned time-dependent or is newer than the
/// current compilation makes the candidate entry unusable.
fn verify_include(
    conf: &Config,
    time_of_compilation: SystemTime,
    path: &Path,
    stored: &FileHash,
) -> bool {
    if !conf.sloppiness.include_file_mtime {
        match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(mtime)
                if ::util::unix_seconds(mtime) < ::util::unix_seconds(time_of_compilation) => {}
            _ => return false,
        }
    }
    let mut digest = Digest::new();
    let source_hash = match hash_source_code_file(&mut digest, path) {
        Ok(result) => result,
        Err(_) => return false,
    };
    if source_hash.found_time_macros && !conf.sloppiness.time_macros {
        return false;
    }
    digest.finish() == *stored
}

/// Look up the object hash recorded for this manifest. Returns the first
/// entry whose include snapshot fully matches the current filesystem.
pub fn get(conf: &Config, path: &Path, time_of_compilation: SystemTime) -> Option<FileHash> {
    let manifest = read_manifest(path)?;
    'entries: for entry in &manifest.entries {
        for (include, stored) in &entry.include_files {
            if !verify_include(conf, time_of_compilation, include, stored) {
                continue 'entries;
            }
        }
        return Some(entry.object);
    }
    None
}

/// Add an (object, include snapshot) pair, keeping existing entries.
/// Written via temp file and rename; a concurrent writer may win the
/// rename and drop this entry, which only costs a future recomputation.
pub fn put(
    path: &Path,
    object: FileHash,
    included_files: &BTreeMap<PathBuf, FileHash>,
) -> Result<()> {
    let mut manifest = read_manifest(path).unwrap_or_default();
    if manifest.entries.iter().any(|e| e.object == object) {
        return Ok(());
    }
    manifest.entries.push(ManifestEntry {
        object: object,
        include_files: included_files.clone(),
    });
    write_manifest(path, &manifest)
}

#[cfg(test)]
mod test {
    use super::*;
    use config::Config;
    use filetime::{set_file_times, FileTime};
    use hashutil::hash_source_code_string;
    use tempdir::TempDir;

    struct Fixture {
        tempdir: TempDir,
        conf: Config,
    }

    impl Fixture {
        fn new() -> Fixture {
            let tempdir = TempDir::new("cache-tool-manifest").unwrap();
            let conf = Config::for_dirs(
                tempdir.path().join("cache"),
                tempdir.path().join("tmp"),
                tempdir.path().to_path_buf(),
            );
            Fixture {
                tempdir: tempdir,
                conf: conf,
            }
        }

        fn old_file(&self, name: &str, contents: &[u8]) -> (PathBuf, FileHash) {
            let path = self.tempdir.path().join(name);
            fs::write(&path, contents).unwrap();
            let old = FileTime::from_unix_time(1_000_000, 0);
            set_file_times(&path, old, old).unwrap();
            let mut digest = Digest::new();
            hash_source_code_string(&mut digest, contents);
            (path, digest.finish())
        }
    }

    fn object(n: u8) -> FileHash {
        FileHash {
            digest: [n; 16],
            size: n as u64,
        }
    }

    #[test]
    fn test_put_then_get() {
        let f = Fixture::new();
        let manifest_path = f.tempdir.path().join("m.manifest");
        let (header, header_hash) = f.old_file("a.h", b"int a;\n");
        let mut includes = BTreeMap::new();
        includes.insert(header, header_hash);
        put(&manifest_path, object(1), &includes).unwrap();
        assert_eq!(
            get(&f.conf, &manifest_path, SystemTime::now()),
            Some(object(1))
        );
    }

    #[test]
    fn test_get_misses_when_include_changed() {
        let f = Fixture::new();
        let manifest_path = f.tempdir.path().join("m.manifest");
        let (header, header_hash) = f.old_file("a.h", b"int a;\n");
        let mut includes = BTreeMap::new();
        includes.insert(header.clone(), header_hash);
        put(&manifest_path, object(1), &includes).unwrap();

        f.old_file("a.h", b"int b;\n");
        assert_eq!(get(&f.conf, &manifest_path, SystemTime::now()), None);
    }

    #[test]
    fn test_get_arbitrates_between_entries() {
        let f = Fixture::new();
        let manifest_path = f.tempdir.path().join("m.manifest");
        let (header, old_hash) = f.old_file("a.h", b"int a;\n");

        let mut includes = BTreeMap::new();
        includes.insert(header.clone(), old_hash);
        put(&manifest_path, object(1), &includes).unwrap();

        // The same source compiled under a different include state.
        let (_, new_hash) = f.old_file("a.h", b"int b;\n");
        let mut includes = BTreeMap::new();
        includes.insert(header.clone(), new_hash);
        put(&manifest_path, object(2), &includes).unwrap();

        assert_eq!(
            get(&f.conf, &manifest_path, SystemTime::now()),
            Some(object(2))
        );

        // Restoring the original contents resurrects the first object.
        f.old_file("a.h", b"int a;\n");
        assert_eq!(
            get(&f.conf, &manifest_path, SystemTime::now()),
            Some(object(1))
        );
    }

    #[test]
    fn test_missing_manifest_is_a_miss() {
        let f = Fixture::new();
        assert_eq!(
            get(&f.conf, &f.tempdir.path().join("none.manifest"), SystemTime::now()),
            None
        );
    }

    #[test]
    fn test_corrupt_manifest_is_a_miss() {
        let f = Fixture::new();
        let manifest_path = f.tempdir.path().join("m.manifest");
        fs::write(&manifest_path, b"garbage").unwrap();
        assert_eq!(get(&f.conf, &manifest_path, SystemTime::now()), None);

        // And a put over it starts fresh rather than failing.
        put(&manifest_path, object(3), &BTreeMap::new()).unwrap();
    }

    #[test]
    fn test_version_mismatch_is_a_miss() {
        let f = Fixture::new();
        let manifest_path = f.tempdir.path().join("m.manifest");
        put(&manifest_path, object(1), &BTreeMap::new()).unwrap();
        let mut data = fs::read(&manifest_path).unwrap();
        data[4] = VERSION + 1;
        fs::write(&manifest_path, &data).unwrap();
        assert_eq!(get(&f.conf, &manifest_path, SystemTime::now()), None);
    }

    #[test]
    fn test_too_new_include_is_a_miss() {
        let f = Fixture::new();
        let manifest_path = f.tempdir.path().join("m.manifest");
        let (header, header_hash) = f.old_file("a.h", b"int a;\n");
        let mut includes = BTreeMap::new();
        includes.insert(header.clone(), header_hash);
        put(&manifest_path, object(1), &includes).unwrap();

        // Same contents, but touched after the compilation started.
        let now = FileTime::now();
        set_file_times(&header, now, now).unwrap();
        let earlier = SystemTime::now() - ::std::time::Duration::from_secs(3600);
        assert_eq!(get(&f.conf, &manifest_path, earlier), None);

        let mut sloppy = f.conf.clone();
        sloppy.sloppiness.include_file_mtime = true;
        assert_eq!(get(&sloppy, &manifest_path, earlier), Some(object(1)));
    }

    #[test]
    fn test_put_is_idempotent_per_object() {
        let f = Fixture::new();
        let manifest_path = f.tempdir.path().join("m.manifest");
        put(&manifest_path, object(1), &BTreeMap::new()).unwrap();
        put(&manifest_path, object(1), &BTreeMap::new()).unwrap();
        let manifest = read_manifest(&manifest_path).unwrap();
        assert_eq!(manifest.entries.len(), 1);
    }
}

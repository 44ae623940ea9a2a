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

//! Scanning of preprocessor output: the text is hashed in a single pass
//! while the paths in line directives are extracted, rewritten relative
//! to the base directory, and recorded as the run's include set.

use config::Config;
use digest::{Digest, FileHash};
use hashutil::hash_source_code_string;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use util;

use errors::*;

/// What the scanner needs to know about the run it is part of.
pub struct ScanContext<'a> {
    pub conf: &'a Config,
    /// The (possibly relativized) input file, which is never recorded as
    /// an include of itself.
    pub input_file: &'a Path,
    /// Includes modified at or after this instant are rejected.
    pub time_of_compilation: SystemTime,
    /// Whether to build the include set at all (direct mode enabled).
    pub collect_includes: bool,
}

#[derive(Debug)]
pub struct ScanResult {
    /// Path -> content hash of every include the preprocessor read.
    pub included_files: BTreeMap<PathBuf, FileHash>,
    /// False when something made direct mode unsafe for this run (an
    /// unreadable or too-new include, or one containing time macros).
    pub direct_mode_ok: bool,
}

/// Hash `path` (the preprocessor's stdout), extracting include references
/// from `# N "file"` (GCC) and `#line N "file"` (HP) directives. Paths
/// under the base directory are hashed in relative form so the digest is
/// stable across checkouts.
pub fn process_preprocessed_file(
    digest: &mut Digest,
    path: &Path,
    ctx: &ScanContext,
) -> Result<ScanResult> {
    let file = File::open(path).chain_err(|| format!("failed to open {:?}", path))?;
    let data = util::map_file(&file).chain_err(|| format!("failed to map {:?}", path))?;
    let bytes: &[u8] = &data;
    let len = bytes.len();

    let mut result = ScanResult {
        included_files: BTreeMap::new(),
        direct_mode_ok: true,
    };

    // Bytes between p and q are pending to be hashed.
    let mut p = 0;
    let mut q = 0;
    // A line directive needs at least 7 more characters (`# 1 "x"`).
    let limit = len.saturating_sub(7);
    while q < limit {
        if bytes[q] == b'#'
            && ((bytes[q + 1] == b' ' && bytes[q + 2].is_ascii_digit())
                || &bytes[q + 1..q + 6] == &b"line "[..])
            && (q == 0 || bytes[q - 1] == b'\n')
        {
            while q < len && bytes[q] != b'"' {
                q += 1;
            }
            q += 1;
            if q >= len {
                bail!("failed to parse included file path");
            }
            // Hash everything up to and including the opening quote.
            digest.update(&bytes[p..q]);
            p = q;
            while q < len && bytes[q] != b'"' {
                q += 1;
            }
            // p and q now span the include file path.
            let include =
                PathBuf::from(OsStr::from_bytes(&bytes[p..q]).to_os_string());
            let include = util::make_relative_path(
                ctx.conf.base_dir.as_ref().map(|b| b.as_path()),
                &ctx.conf.cwd,
                &include,
            );
            digest.update_path(&include);
            if ctx.collect_includes {
                remember_include_file(ctx, include, &mut result);
            }
            p = q;
        } else {
            q += 1;
        }
    }
    digest.update(&bytes[p..]);
    Ok(result)
}

/// Hash an include file the preprocessor mentioned and record it in the
/// run's include set. Anything that makes the file unsafe to trust in a
/// later direct-mode lookup disables direct mode instead of failing.
fn remember_include_file(ctx: &ScanContext, path: PathBuf, result: &mut ScanResult) {
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= 2 && bytes[0] == b'<' && bytes[bytes.len() - 1] == b'>' {
        // Typically <built-in> or <command-line>.
        return;
    }
    if path == ctx.input_file {
        return;
    }
    if result.included_files.contains_key(&path) {
        return;
    }

    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) => {
            debug!("failed to open include file {:?}: {}", path, e);
            disable_direct(result);
            return;
        }
    };
    let meta = match file.metadata() {
        Ok(meta) => meta,
        Err(e) => {
            debug!("failed to stat include file {:?}: {}", path, e);
            disable_direct(result);
            return;
        }
    };
    if meta.is_dir() {
        // Ignore directories, typically $PWD.
        return;
    }
    if !ctx.conf.sloppiness.include_file_mtime {
        match meta.modified() {
            Ok(mtime)
                if util::unix_seconds(mtime)
                    >= util::unix_seconds(ctx.time_of_compilation) =>
            {
                debug!("include file {:?} too new", path);
                disable_direct(result);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("failed to read mtime of {:?}: {}", path, e);
                disable_direct(result);
                return;
            }
        }
    }

    let data = match util::map_file(&file) {
        Ok(data) => data,
        Err(e) => {
            debug!("failed to map include file {:?}: {}", path, e);
            disable_direct(result);
            return;
        }
    };
    let mut digest = Digest::new();
    let source_hash = hash_source_code_string(&mut digest, &data);
    if source_hash.found_time_macros && !ctx.conf.sloppiness.time_macros {
        debug!("include file {:?} contains time macros", path);
        disable_direct(result);
        return;
    }
    result.included_files.insert(path, digest.finish());
}

fn disable_direct(result: &mut ScanResult) {
    if result.direct_mode_ok {
        debug!("disabling direct mode");
        result.direct_mode_ok = false;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use config::Config;
    use filetime::{set_file_times, FileTime};
    use std::fs;
    use std::time::{Duration, SystemTime};
    use tempdir::TempDir;

    struct Fixture {
        tempdir: TempDir,
        conf: Config,
    }

    impl Fixture {
        fn new() -> Fixture {
            let tempdir = TempDir::new("cache-tool-cpp").unwrap();
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

        /// Create a file whose mtime predates any compilation in the test.
        fn old_file(&self, name: &str, contents: &[u8]) -> PathBuf {
            let path = self.tempdir.path().join(name);
            fs::write(&path, contents).unwrap();
            let old = FileTime::from_unix_time(1_000_000, 0);
            set_file_times(&path, old, old).unwrap();
            path
        }

        fn scan(&self, cpp_output: &[u8]) -> (FileHash, ScanResult) {
            let path = self.tempdir.path().join("out.i");
            fs::write(&path, cpp_output).unwrap();
            let mut digest = Digest::new();
            let ctx = ScanContext {
                conf: &self.conf,
                input_file: Path::new("input.c"),
                time_of_compilation: SystemTime::now(),
                collect_includes: true,
            };
            let result = process_preprocessed_file(&mut digest, &path, &ctx).unwrap();
            (digest.finish(), result)
        }
    }

    #[test]
    fn test_extracts_includes() {
        let f = Fixture::new();
        let header = f.old_file("foo.h", b"int foo(void);\n");
        let cpp = format!(
            "# 1 \"input.c\"\n# 1 \"<built-in>\"\n# 1 \"{}\"\nint foo(void);\n# 2 \"input.c\"\nint main(void) {{ return 0; }}\n",
            header.display()
        );
        let (_, result) = f.scan(cpp.as_bytes());
        assert!(result.direct_mode_ok);
        assert_eq!(result.included_files.len(), 1);
        assert!(result.included_files.contains_key(&header));
    }

    #[test]
    fn test_line_directive_form() {
        let f = Fixture::new();
        let header = f.old_file("hp.h", b"int hp;\n");
        let cpp = format!("#line 1 \"{}\"\nint hp;\n", header.display());
        let (_, result) = f.scan(cpp.as_bytes());
        assert_eq!(result.included_files.len(), 1);
    }

    #[test]
    fn test_skips_input_file_and_duplicates() {
        let f = Fixture::new();
        let header = f.old_file("dup.h", b"x\n");
        let cpp = format!(
            "# 1 \"input.c\"\n# 1 \"{0}\"\n# 2 \"{0}\"\nx\n",
            header.display()
        );
        let (_, result) = f.scan(cpp.as_bytes());
        assert_eq!(result.included_files.len(), 1);
        assert!(result.direct_mode_ok);
    }

    #[test]
    fn test_too_new_include_disables_direct_mode() {
        let f = Fixture::new();
        let header = f.tempdir.path().join("new.h");
        fs::write(&header, b"fresh\n").unwrap();
        let future = FileTime::from_system_time(SystemTime::now() + Duration::from_secs(3600));
        set_file_times(&header, future, future).unwrap();
        let cpp = format!("# 1 \"{}\"\nfresh\n", header.display());
        let (_, result) = f.scan(cpp.as_bytes());
        assert!(!result.direct_mode_ok);
        assert!(result.included_files.is_empty());
    }

    #[test]
    fn test_too_new_include_tolerated_with_sloppiness() {
        let mut f = Fixture::new();
        f.conf.sloppiness.include_file_mtime = true;
        let header = f.tempdir.path().join("new.h");
        fs::write(&header, b"fresh\n").unwrap();
        let cpp = format!("# 1 \"{}\"\nfresh\n", header.display());
        let (_, result) = f.scan(cpp.as_bytes());
        assert!(result.direct_mode_ok);
        assert_eq!(result.included_files.len(), 1);
    }

    #[test]
    fn test_time_macro_in_include_disables_direct_mode() {
        let f = Fixture::new();
        let header = f.old_file("t.h", b"char *t = __TIME__;\n");
        let cpp = format!("# 1 \"{}\"\nchar *t = \"12:00:00\";\n", header.display());
        let (_, result) = f.scan(cpp.as_bytes());
        assert!(!result.direct_mode_ok);
    }

    #[test]
    fn test_missing_include_disables_direct_mode() {
        let f = Fixture::new();
        let cpp = b"# 1 \"/no/such/file.h\"\nint x;\n";
        let (_, result) = f.scan(cpp);
        assert!(!result.direct_mode_ok);
    }

    #[test]
    fn test_rehash_is_idempotent() {
        let f = Fixture::new();
        let header = f.old_file("a.h", b"int a;\n");
        let cpp = format!("# 1 \"{}\"\nint a;\n", header.display());
        let (h1, _) = f.scan(cpp.as_bytes());
        let (h2, _) = f.scan(cpp.as_bytes());
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_base_dir_relativization_makes_digests_portable() {
        // The same logical source seen from two checkouts hashes the
        // same once paths under the base directory are made relative.
        let f = Fixture::new();
        for checkout in &["a", "b"] {
            fs::create_dir_all(f.tempdir.path().join(checkout)).unwrap();
        }
        let h_a = f.old_file("a/common.h", b"int c;\n");
        let h_b = f.old_file("b/common.h", b"int c;\n");

        let digest_for = |checkout: &str, header: &Path| {
            let mut conf = f.conf.clone();
            conf.base_dir = Some(f.tempdir.path().to_path_buf());
            conf.cwd = f.tempdir.path().join(checkout);
            let cpp_path = f.tempdir.path().join(format!("{}.out.i", checkout));
            fs::write(&cpp_path, format!("# 1 \"{}\"\nint c;\n", header.display())).unwrap();
            let mut digest = Digest::new();
            let ctx = ScanContext {
                conf: &conf,
                input_file: Path::new("input.c"),
                time_of_compilation: SystemTime::now(),
                collect_includes: false,
            };
            process_preprocessed_file(&mut digest, &cpp_path, &ctx).unwrap();
            digest.finish()
        };

        assert_eq!(digest_for("a", &h_a), digest_for("b", &h_b));
    }

    #[test]
    fn test_plain_hash_matches_without_directives() {
        let f = Fixture::new();
        let contents = b"int main(void) { return 0; }\n";
        let (hash, result) = f.scan(contents);
        let mut digest = Digest::new();
        digest.update(contents);
        assert_eq!(hash, digest.finish());
        assert!(result.included_files.is_empty());
    }
}

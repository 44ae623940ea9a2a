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

//! End-to-end tests of the cache driver against a stub compiler: a shell
//! script implementing just enough of `-E` and `-c` to be a deterministic
//! function of its inputs. Every test uses absolute paths so the suite is
//! independent of the test harness working directory.

extern crate cache_tool;
extern crate filetime;
extern crate tempdir;

use cache_tool::cache;
use cache_tool::config::Config;
use cache_tool::driver;
use cache_tool::stats::{self, Statistic};
use filetime::{set_file_times, FileTime};
use std::fs::{self, Permissions};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempdir::TempDir;

const STUB_COMPILER: &'static str = r#"#!/bin/sh
# Stub compiler: -E expands `#include "..."` one level and emits line
# markers; -c packs the input into a fake object file. Every invocation
# is appended to calls.log next to this script.
dir="$(cd "$(dirname "$0")" && pwd)"
echo "$@" >> "$dir/calls.log"
mode=compile
out=""
dep=""
input=""
prev=""
for arg in "$@"; do
    if [ "$prev" = "-o" ]; then out="$arg"; prev=""; continue; fi
    if [ "$prev" = "-MF" ]; then dep="$arg"; prev=""; continue; fi
    case "$arg" in
        -E) mode=cpp ;;
        -o) prev="-o" ;;
        -MF) prev="-MF" ;;
        -*) ;;
        *) input="$arg" ;;
    esac
done
if [ "$mode" = cpp ]; then
    if grep -q CPP_ERROR "$input"; then
        echo "$input:1: error: preprocessing failed" >&2
        exit 1
    fi
    printf '# 1 "%s"\n' "$input"
    while IFS= read -r line; do
        case "$line" in
            '#include "'*'"')
                f="${line#\#include \"}"
                f="${f%\"}"
                case "$f" in
                    /*) path="$f" ;;
                    *) path="$(dirname "$input")/$f" ;;
                esac
                printf '# 1 "%s"\n' "$path"
                cat "$path"
                printf '# 2 "%s"\n' "$input"
                ;;
            *) printf '%s\n' "$line" ;;
        esac
    done < "$input"
    if [ -n "$dep" ]; then
        printf '%s: %s\n' "$out" "$input" > "$dep"
    fi
    exit 0
fi
if grep -q SYNTAX_ERROR "$input"; then
    echo "$input:1: error: expected expression" >&2
    exit 1
fi
if grep -q WARNME "$input"; then
    echo "$input:1: warning: be careful" >&2
fi
printf 'ELF' > "$out"
cat "$input" >> "$out"
exit 0
"#;

struct Fixture {
    tempdir: TempDir,
    conf: Config,
    compiler: PathBuf,
}

impl Fixture {
    fn new() -> Fixture {
        let tempdir = TempDir::new("cache-tool-system").unwrap();
        let conf = Config::for_dirs(
            tempdir.path().join("cache"),
            tempdir.path().join("tmp"),
            tempdir.path().to_path_buf(),
        );
        let bin = tempdir.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        let compiler = bin.join("cc");
        fs::write(&compiler, STUB_COMPILER).unwrap();
        fs::set_permissions(&compiler, Permissions::from_mode(0o755)).unwrap();
        Fixture {
            tempdir: tempdir,
            conf: conf,
            compiler: compiler,
        }
    }

    /// Write a source file with an mtime safely in the past, the way real
    /// sources look when a build starts.
    fn write_source(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.tempdir.path().join(name);
        fs::write(&path, contents).unwrap();
        let old = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(600));
        set_file_times(&path, old, old).unwrap();
        path
    }

    fn run(&self, args: &[&str]) -> cache_tool::errors::Result<i32> {
        let mut argv = vec![self.compiler.to_str().unwrap().to_owned()];
        argv.extend(args.iter().map(|s| s.to_string()));
        driver::run(&self.conf, &argv)
    }

    fn compile(&self, src: &Path, out: &Path) -> cache_tool::errors::Result<i32> {
        self.run(&["-c", src.to_str().unwrap(), "-o", out.to_str().unwrap()])
    }

    /// How many times the stub compiler has been invoked (for anything).
    fn compiler_calls(&self) -> usize {
        fs::read_to_string(self.tempdir.path().join("bin").join("calls.log"))
            .map(|log| log.lines().count())
            .unwrap_or(0)
    }

    fn stat_total(&self, stat: Statistic) -> u64 {
        let mut total = stats::read_counters(&self.conf.cache_dir.join("stats"))[stat as usize];
        for c in "0123456789abcdef".chars() {
            let file = self.conf.cache_dir.join(c.to_string()).join("stats");
            total += stats::read_counters(&file)[stat as usize];
        }
        total
    }

    fn cached_objects(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut dirs = vec![self.conf.cache_dir.clone()];
        while let Some(dir) = dirs.pop() {
            if let Ok(entries) = fs::read_dir(&dir) {
                for entry in entries.filter_map(|e| e.ok()) {
                    let path = entry.path();
                    if path.is_dir() {
                        dirs.push(path);
                    } else if path.extension().map(|e| e == "o").unwrap_or(false) {
                        found.push(path);
                    }
                }
            }
        }
        found
    }
}

#[test]
fn test_cold_compile_populates_cache() {
    let f = Fixture::new();
    let src = f.write_source("hello.c", "int main(void) { return 0; }\n");
    let out = f.tempdir.path().join("hello.o");

    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    // One preprocessor run, one compile.
    assert_eq!(f.compiler_calls(), 2);
    let data = fs::read(&out).unwrap();
    assert!(data.starts_with(b"ELF"));
    assert_eq!(f.cached_objects().len(), 1);
    assert_eq!(f.stat_total(Statistic::CacheMiss), 1);
}

#[test]
fn test_warm_direct_hit() {
    let f = Fixture::new();
    let src = f.write_source("hello.c", "#include \"hello.h\"\nint main(void) { return hi; }\n");
    f.write_source("hello.h", "int hi = 0;\n");
    let out = f.tempdir.path().join("hello.o");

    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    let calls_after_cold = f.compiler_calls();
    let first = fs::read(&out).unwrap();
    fs::remove_file(&out).unwrap();

    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    // The real compiler was not invoked at all.
    assert_eq!(f.compiler_calls(), calls_after_cold);
    assert_eq!(fs::read(&out).unwrap(), first);
    assert_eq!(f.stat_total(Statistic::CacheHitDirect), 1);
    assert_eq!(f.stat_total(Statistic::CacheMiss), 1);
}

#[test]
fn test_touched_header_hits_preprocessor_mode() {
    let f = Fixture::new();
    let src = f.write_source("hello.c", "#include \"hello.h\"\nint main(void) { return hi; }\n");
    let header = f.write_source("hello.h", "int hi = 0;\n");
    let out = f.tempdir.path().join("hello.o");

    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    let calls_after_cold = f.compiler_calls();

    // Touch the header without changing its contents.
    let touched = FileTime::from_system_time(SystemTime::now() + Duration::from_secs(10));
    set_file_times(&header, touched, touched).unwrap();

    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    // Only the preprocessor ran; the object came from the cache.
    assert_eq!(f.compiler_calls(), calls_after_cold + 1);
    assert_eq!(f.stat_total(Statistic::CacheHitPreprocessed), 1);
    assert_eq!(f.stat_total(Statistic::CacheHitDirect), 0);
}

#[test]
fn test_changed_header_recompiles_and_extends_manifest() {
    let f = Fixture::new();
    let src = f.write_source("hello.c", "#include \"hello.h\"\nint main(void) { return hi; }\n");
    f.write_source("hello.h", "int hi = 0;\n");
    let out = f.tempdir.path().join("hello.o");

    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    f.write_source("hello.h", "int hi = 1;\n");
    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    assert_eq!(f.stat_total(Statistic::CacheMiss), 2);
    assert_eq!(f.cached_objects().len(), 2);

    // Restoring the first header contents gives a direct hit again.
    f.write_source("hello.h", "int hi = 0;\n");
    let calls = f.compiler_calls();
    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    assert_eq!(f.compiler_calls(), calls);
    assert_eq!(f.stat_total(Statistic::CacheHitDirect), 1);
}

#[test]
fn test_unsupported_option_falls_back() {
    let f = Fixture::new();
    let src = f.write_source("foo.c", "int x;\n");
    assert!(f.run(&["-E", src.to_str().unwrap()]).is_err());
    assert_eq!(f.compiler_calls(), 0);
    assert!(f.cached_objects().is_empty());
    assert_eq!(f.stat_total(Statistic::UnsupportedCompilerOption), 1);
}

#[test]
fn test_compiler_error_preserved() {
    let f = Fixture::new();
    let src = f.write_source("bad.c", "int SYNTAX_ERROR\n");
    let out = f.tempdir.path().join("bad.o");
    assert_eq!(f.compile(&src, &out).unwrap(), 1);
    assert!(f.cached_objects().is_empty());
    assert_eq!(f.stat_total(Statistic::CompileFailed), 1);
    assert_eq!(f.stat_total(Statistic::CacheMiss), 0);
}

#[test]
fn test_preprocessor_error_gives_up() {
    let f = Fixture::new();
    let src = f.write_source("bad.c", "int CPP_ERROR;\n");
    let out = f.tempdir.path().join("bad.o");
    assert!(f.compile(&src, &out).is_err());
    assert_eq!(f.stat_total(Statistic::PreprocessorError), 1);
    assert!(f.cached_objects().is_empty());
}

#[test]
fn test_read_only_mode_gives_up_on_miss() {
    let mut f = Fixture::new();
    f.conf.read_only = true;
    let src = f.write_source("foo.c", "int x;\n");
    let out = f.tempdir.path().join("foo.o");
    assert!(f.compile(&src, &out).is_err());
    assert!(f.cached_objects().is_empty());
}

#[test]
fn test_read_only_mode_serves_hits() {
    let mut f = Fixture::new();
    let src = f.write_source("foo.c", "int x;\n");
    let out = f.tempdir.path().join("foo.o");
    assert_eq!(f.compile(&src, &out).unwrap(), 0);

    f.conf.read_only = true;
    fs::remove_file(&out).unwrap();
    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    assert!(out.exists());
}

#[test]
fn test_recache_recompiles_but_stays_consistent() {
    let mut f = Fixture::new();
    let src = f.write_source("foo.c", "int x;\n");
    let out = f.tempdir.path().join("foo.o");
    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    let calls = f.compiler_calls();

    f.conf.recache = true;
    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    assert_eq!(f.compiler_calls(), calls + 2);
    assert_eq!(f.stat_total(Statistic::CacheMiss), 2);
    assert_eq!(f.cached_objects().len(), 1);
}

#[test]
fn test_hard_link_serving() {
    let mut f = Fixture::new();
    f.conf.hard_link = true;
    let src = f.write_source("foo.c", "int x;\n");
    let out = f.tempdir.path().join("foo.o");
    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    fs::remove_file(&out).unwrap();
    assert_eq!(f.compile(&src, &out).unwrap(), 0);

    let cached = f.cached_objects();
    assert_eq!(cached.len(), 1);
    let out_ino = fs::metadata(&out).unwrap().ino();
    let cached_ino = fs::metadata(&cached[0]).unwrap().ino();
    assert_eq!(out_ino, cached_ino);
}

#[test]
fn test_compressed_store_serves_identical_output() {
    let mut f = Fixture::new();
    f.conf.compress = true;
    let src = f.write_source("foo.c", "int x;\nint y;\nint z;\n");
    let out = f.tempdir.path().join("foo.o");
    assert_eq!(f.compile(&src, &out).unwrap(), 0);

    let cached = f.cached_objects();
    assert_eq!(cached.len(), 1);
    assert!(cache::test_if_compressed(&cached[0]));
    // The served output is uncompressed.
    assert!(fs::read(&out).unwrap().starts_with(b"ELF"));

    let first = fs::read(&out).unwrap();
    fs::remove_file(&out).unwrap();
    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    assert_eq!(fs::read(&out).unwrap(), first);
}

#[test]
fn test_output_to_dev_null() {
    let f = Fixture::new();
    let src = f.write_source("foo.c", "#include \"foo.h\"\nint x;\n");
    f.write_source("foo.h", "int h;\n");
    assert_eq!(
        f.run(&["-c", src.to_str().unwrap(), "-o", "/dev/null"]).unwrap(),
        0
    );
    // Hit path, still nothing written to /dev/null's name.
    assert_eq!(
        f.run(&["-c", src.to_str().unwrap(), "-o", "/dev/null"]).unwrap(),
        0
    );
    assert_eq!(f.stat_total(Statistic::CacheHitDirect), 1);
}

#[test]
fn test_preprocessed_input_skips_preprocessor() {
    let f = Fixture::new();
    let src = f.write_source("foo.i", "int already_preprocessed;\n");
    let out = f.tempdir.path().join("foo.o");
    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    // Only the compile ran, no -E invocation.
    assert_eq!(f.compiler_calls(), 1);
    // The input file must survive (it is not a temporary).
    assert!(src.exists());

    fs::remove_file(&out).unwrap();
    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    assert_eq!(f.compiler_calls(), 1);
    assert_eq!(f.stat_total(Statistic::CacheHitPreprocessed), 1);
}

#[test]
fn test_dependency_file_round_trip() {
    let f = Fixture::new();
    let src = f.write_source("foo.c", "#include \"dep.h\"\nint x;\n");
    f.write_source("dep.h", "int d;\n");
    let out = f.tempdir.path().join("foo.o");
    let dep = f.tempdir.path().join("foo.d");

    assert_eq!(
        f.run(&["-c", "-MD", src.to_str().unwrap(), "-o", out.to_str().unwrap()])
            .unwrap(),
        0
    );
    assert!(dep.exists());
    let dep_contents = fs::read(&dep).unwrap();
    fs::remove_file(&dep).unwrap();
    fs::remove_file(&out).unwrap();

    // A direct hit reproduces the dependency file from the cache.
    let calls = f.compiler_calls();
    assert_eq!(
        f.run(&["-c", "-MD", src.to_str().unwrap(), "-o", out.to_str().unwrap()])
            .unwrap(),
        0
    );
    assert_eq!(f.compiler_calls(), calls);
    assert_eq!(fs::read(&dep).unwrap(), dep_contents);
    assert_eq!(f.stat_total(Statistic::CacheHitDirect), 1);
}

#[test]
fn test_compiler_stderr_is_cached() {
    let f = Fixture::new();
    let src = f.write_source("warn.c", "int WARNME;\n");
    let out = f.tempdir.path().join("warn.o");
    assert_eq!(f.compile(&src, &out).unwrap(), 0);

    let mut stderr_files = Vec::new();
    let mut dirs = vec![f.conf.cache_dir.clone()];
    while let Some(dir) = dirs.pop() {
        for entry in fs::read_dir(&dir).unwrap().filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            } else if path.extension().map(|e| e == "stderr").unwrap_or(false) {
                stderr_files.push(path);
            }
        }
    }
    assert_eq!(stderr_files.len(), 1);
    let contents = fs::read_to_string(&stderr_files[0]).unwrap();
    assert!(contents.contains("warning: be careful"));
}

#[test]
fn test_nodirect_uses_preprocessor_mode_only() {
    let mut f = Fixture::new();
    f.conf.no_direct = true;
    let src = f.write_source("foo.c", "int x;\n");
    let out = f.tempdir.path().join("foo.o");
    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    assert_eq!(f.stat_total(Statistic::CacheHitPreprocessed), 1);
    assert_eq!(f.stat_total(Statistic::CacheHitDirect), 0);
    // No manifest is ever written.
    let mut manifests = 0;
    let mut dirs = vec![f.conf.cache_dir.clone()];
    while let Some(dir) = dirs.pop() {
        for entry in fs::read_dir(&dir).unwrap().filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            } else if path.extension().map(|e| e == "manifest").unwrap_or(false) {
                manifests += 1;
            }
        }
    }
    assert_eq!(manifests, 0);
}

#[test]
fn test_time_macro_in_source_disables_direct_mode() {
    let f = Fixture::new();
    let src = f.write_source("now.c", "char *now = __DATE__;\n");
    let out = f.tempdir.path().join("now.o");
    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    // Both lookups had to go through the preprocessor.
    assert_eq!(f.stat_total(Statistic::CacheHitDirect), 0);
    assert_eq!(f.stat_total(Statistic::CacheHitPreprocessed), 1);
}

#[test]
fn test_sloppy_time_macros_allows_direct_mode() {
    let mut f = Fixture::new();
    f.conf.sloppiness.time_macros = true;
    let src = f.write_source("now.c", "#include \"now.h\"\nchar *now = __DATE__;\n");
    f.write_source("now.h", "extern char *now;\n");
    let out = f.tempdir.path().join("now.o");
    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    assert_eq!(f.stat_total(Statistic::CacheHitDirect), 1);
}

#[test]
fn test_different_defines_give_different_objects() {
    let f = Fixture::new();
    let src = f.write_source("foo.c", "int x;\n");
    let out = f.tempdir.path().join("foo.o");
    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    // The stub preprocessor ignores -D, so the preprocessed output is
    // identical and preprocessor mode hits despite the new flag.
    assert_eq!(
        f.run(&["-c", "-DX=1", src.to_str().unwrap(), "-o", out.to_str().unwrap()])
            .unwrap(),
        0
    );
    assert_eq!(f.stat_total(Statistic::CacheHitPreprocessed), 1);
    // Direct mode hashed the new define, so it was a manifest miss.
    assert_eq!(f.stat_total(Statistic::CacheHitDirect), 0);
}

#[test]
fn test_unify_mode_ignores_reformatting() {
    let mut f = Fixture::new();
    f.conf.unify = true;
    let out = f.tempdir.path().join("foo.o");

    let src = f.write_source("foo.c", "int main(void) { return 0; }\n");
    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    assert_eq!(f.stat_total(Statistic::CacheMiss), 1);

    // Reformatting only changes whitespace; unify mode still hits.
    fs::remove_file(&src).unwrap();
    let src = f.write_source("foo.c", "int main(void)\n{\n    return 0;\n}\n");
    assert_eq!(f.compile(&src, &out).unwrap(), 0);
    assert_eq!(f.stat_total(Statistic::CacheHitPreprocessed), 1);
    assert_eq!(f.stat_total(Statistic::CacheMiss), 1);
}

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

//! The per-compilation state machine: classify the arguments, try a
//! direct (manifest) lookup, fall back to hashing preprocessor output,
//! compile and populate on a miss, and serve the result. Every path that
//! can't be handled returns an error so the caller can hand the original
//! invocation to the real compiler.

use cache;
use compiler::{self, CompilerArguments, ParsedArguments};
use config::{CompilerCheck, Config, MYNAME};
use digest::{Digest, FileHash};
use execute;
use hashutil;
use manifest;
use preprocessed::{self, ScanContext};
use stats::{self, Statistic};
use std::collections::BTreeMap;
use std::env;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::Builder;
use unify;
use util;

use errors::*;

/// This string identifies the current version of the hash. Bumping it
/// invalidates every existing cache entry, which is the right thing
/// whenever anything feeding the hash changes incompatibly.
const HASH_PREFIX: &'static str = "3";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheMode {
    Direct,
    Preprocessed,
    Compiled,
}

#[derive(Debug, Clone)]
struct CachedResult {
    object_hash: FileHash,
    obj: PathBuf,
    stderr: PathBuf,
    dep: PathBuf,
}

/// Locate the real compiler: strip our own name when invoked as
/// `cache-tool compiler args...`, honor the CACHE_CC override, and search
/// PATH for an executable that isn't this tool. Returns the original
/// arguments with `argv[0]` replaced by the resolved compiler.
pub fn find_compiler(conf: &Config, argv: &[String]) -> Result<Vec<String>> {
    let mut orig_args = argv.to_vec();
    let invoked_as = Path::new(&argv[0])
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| argv[0].clone());

    if invoked_as == MYNAME {
        orig_args.remove(0);
        if orig_args.is_empty() {
            bail!(ErrorKind::Fatal("no compiler given".into()));
        }
        if orig_args[0].contains('/') {
            // A full path was given; use it as is.
            return Ok(orig_args);
        }
    }

    let mut base = Path::new(&orig_args[0])
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| orig_args[0].clone());
    if let Some(ref cc) = conf.compiler {
        base = cc.clone();
    }

    let compiler = match find_executable(&base) {
        Some(path) => path,
        None => {
            stats::update(&conf.cache_dir.join("stats"), Statistic::CouldNotFindCompiler);
            bail!(ErrorKind::Fatal(format!(
                "could not find compiler \"{}\" in PATH",
                base
            )));
        }
    };
    if compiler == Path::new(&argv[0]) {
        bail!(ErrorKind::Fatal(format!(
            "recursive invocation (the name of the {} binary must be \"{}\")",
            MYNAME, MYNAME
        )));
    }
    orig_args[0] = compiler.to_string_lossy().into_owned();
    Ok(orig_args)
}

/// Search PATH for an executable of the given name, skipping anything
/// that resolves to this tool.
fn find_executable(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        return Some(PathBuf::from(name));
    }
    let self_exe = env::current_exe().ok().and_then(|p| p.canonicalize().ok());
    for dir in env::split_paths(&env::var_os("PATH")?) {
        let candidate = dir.join(name);
        if !is_executable(&candidate) {
            continue;
        }
        if let Ok(real) = candidate.canonicalize() {
            if real.file_name().map(|n| n == MYNAME).unwrap_or(false) {
                continue;
            }
            if Some(&real) == self_exe.as_ref() {
                continue;
            }
        }
        return Some(candidate);
    }
    None
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Drive one compilation through the cache. `orig_args[0]` must be the
/// resolved real compiler. Returns the exit code to use; an error means
/// the caller should fall back to running the real compiler (except for
/// `Fatal` errors, which should be reported and exit nonzero).
pub fn run(conf: &Config, orig_args: &[String]) -> Result<i32> {
    let parsed = match compiler::process_args(conf, orig_args) {
        CompilerArguments::Ok(parsed) => parsed,
        CompilerArguments::NotCompilation(stat) => {
            stats::update(&conf.cache_dir.join("stats"), stat);
            bail!("not a compilation");
        }
        CompilerArguments::CannotCache(why, stat) => {
            stats::update(&conf.cache_dir.join("stats"), stat);
            bail!("unsupported invocation: {}", why);
        }
    };

    let mut driver = Driver::new(conf, orig_args, parsed);
    let result = driver.run();
    if result.is_err() {
        driver.remove_tmp_files();
    }
    result
}

struct Driver<'a> {
    conf: &'a Config,
    orig_args: &'a [String],
    parsed: ParsedArguments,
    enable_direct: bool,
    enable_unify: bool,
    compile_preprocessed: bool,
    time_of_compilation: SystemTime,
    included_files: BTreeMap<PathBuf, FileHash>,
    i_tmpfile: Option<PathBuf>,
    cpp_stderr: Option<PathBuf>,
    manifest_path: Option<PathBuf>,
    cached: Option<CachedResult>,
    stats_file: PathBuf,
}

impl<'a> Driver<'a> {
    fn new(conf: &'a Config, orig_args: &'a [String], parsed: ParsedArguments) -> Driver<'a> {
        Driver {
            enable_direct: !conf.no_direct && !conf.unify && !parsed.disable_direct,
            enable_unify: conf.unify && !parsed.disable_unify,
            compile_preprocessed: parsed.compile_preprocessed,
            time_of_compilation: SystemTime::now(),
            included_files: BTreeMap::new(),
            i_tmpfile: None,
            cpp_stderr: None,
            manifest_path: None,
            cached: None,
            stats_file: conf.cache_dir.join("stats"),
            conf: conf,
            orig_args: orig_args,
            parsed: parsed,
        }
    }

    fn count(&self, stat: Statistic) {
        stats::update(&self.stats_file, stat);
    }

    fn run(&mut self) -> Result<i32> {
        debug!("source file: {:?}", self.parsed.input_file);
        if self.parsed.generating_dependencies {
            debug!("dependency file: {:?}", self.parsed.output_dep);
        }
        debug!("object file: {:?}", self.parsed.output_obj);

        let mut common_hash = Digest::new();
        self.calculate_common_hash(&mut common_hash)?;

        let mut put_object_in_manifest = false;
        let mut object_hash_from_manifest = None;

        // Try to find the object hash using the manifest.
        if self.enable_direct {
            debug!("trying direct lookup");
            match self.direct_lookup(common_hash.clone())? {
                Some(object_hash) => {
                    self.set_cached_result(&object_hash)?;
                    if let Some(code) = self.from_cache(CacheMode::Direct, false)? {
                        return Ok(code);
                    }
                    // The object was in the manifest but not the cache;
                    // don't re-add it after compiling.
                    object_hash_from_manifest = Some(object_hash);
                }
                None => {
                    // Add the object to the manifest later.
                    put_object_in_manifest = true;
                }
            }
        }

        // Find the hash using the preprocessed output. This also collects
        // the include set.
        debug!("running preprocessor");
        let object_hash = self.get_object_name_from_cpp(common_hash)?;

        if let Some(from_manifest) = object_hash_from_manifest {
            if from_manifest != object_hash {
                // The manifest pointed at a different object than the
                // preprocessor produced, most likely because a different
                // base directory was used. Drop the whole manifest; its
                // entries get recomputed on the next misses.
                debug!("hash from manifest doesn't match preprocessor output");
                debug!("removing manifest as a safety measure");
                if let Some(ref path) = self.manifest_path {
                    let _ = fs::remove_file(path);
                }
                put_object_in_manifest = true;
            }
        }
        self.set_cached_result(&object_hash)?;

        if let Some(code) = self.from_cache(CacheMode::Preprocessed, put_object_in_manifest)? {
            return Ok(code);
        }

        if self.conf.read_only {
            debug!("read-only mode; running real compiler");
            bail!("read-only mode");
        }

        // Run the real compiler, sending the output to the cache.
        if let Some(code) = self.to_cache()? {
            // The compiler failed; its stderr has been forwarded.
            return Ok(code);
        }

        if let Some(code) = self.from_cache(CacheMode::Compiled, put_object_in_manifest)? {
            return Ok(code);
        }

        debug!("secondary cache probe after compilation failed");
        self.count(Statistic::InternalError);
        bail!("failed to serve the result just stored");
    }

    /// Hash everything that is common to the direct and preprocessor
    /// modes.
    fn calculate_common_hash(&self, hash: &mut Digest) -> Result<()> {
        hash.update_str(HASH_PREFIX);

        // A .i file isn't treated the same as a .ii file, so the
        // extension matters.
        hash.delimiter("ext");
        hash.update_str(&self.parsed.i_extension);

        let compiler = Path::new(&self.orig_args[0]);
        let meta = match fs::metadata(compiler) {
            Ok(meta) => meta,
            Err(e) => {
                debug!("couldn't stat the compiler {:?}: {}", compiler, e);
                self.count(Statistic::CouldNotFindCompiler);
                bail!("couldn't stat the compiler");
            }
        };

        match self.conf.compiler_check {
            CompilerCheck::None => {}
            CompilerCheck::Content => {
                hash.delimiter("cc_content");
                hashutil::hash_file(hash, compiler)?;
            }
            CompilerCheck::Mtime => {
                hash.delimiter("cc_mtime");
                hash.update_int(meta.len() as i64);
                hash.update_int(
                    ::filetime::FileTime::from_last_modification_time(&meta).unix_seconds(),
                );
            }
        }

        // Compilers are often hard links of each other and behave
        // differently depending on the invoked name.
        hash.delimiter("cc_name");
        if let Some(name) = compiler.file_name() {
            hash.update_str(&name.to_string_lossy());
        }

        if self.conf.hash_working_dir {
            hash.delimiter("cwd");
            hash.update_path(&self.conf.cwd);
        }

        for path in &self.conf.extra_files_to_hash {
            debug!("hashing extra file {:?}", path);
            hash.delimiter("extrafile");
            if hashutil::hash_file(hash, path).is_err() {
                self.count(Statistic::BadExtraFile);
                bail!("failed to hash extra file {:?}", path);
            }
        }
        Ok(())
    }

    /// Hash the arguments that contribute in the given mode. When the
    /// preprocessor will run, options that only steer it (-D, -I, ...)
    /// are left out: if they matter, they already changed its output.
    fn hash_arguments(&self, hash: &mut Digest, direct_mode: bool) -> Result<()> {
        const SKIP_WITH_VALUE: &'static [&'static str] = &[
            "-D",
            "-I",
            "-U",
            "-idirafter",
            "-imacros",
            "-imultilib",
            "-include",
            "-iprefix",
            "-iquote",
            "-isysroot",
            "-isystem",
            "-iwithprefix",
            "-iwithprefixbefore",
        ];
        const SKIP_NO_VALUE: &'static [&'static str] = &["-nostdinc", "-nostdinc++"];

        let args = &self.parsed.preprocessor_args;
        let mut i = 1;
        while i < args.len() {
            let arg = &args[i];

            // -L doesn't affect compilation.
            if i < args.len() - 1 && arg == "-L" {
                i += 2;
                continue;
            }
            if arg.starts_with("-L") {
                i += 1;
                continue;
            }

            if !direct_mode {
                if i < args.len() - 1 && SKIP_WITH_VALUE.contains(&arg.as_str()) {
                    i += 2;
                    continue;
                }
                if SKIP_NO_VALUE.contains(&arg.as_str()) {
                    i += 1;
                    continue;
                }
                if arg.starts_with("-D") || arg.starts_with("-I") || arg.starts_with("-U") {
                    i += 1;
                    continue;
                }
            }

            if arg.starts_with("--specs=") {
                let specs = &arg["--specs=".len()..];
                if fs::metadata(specs).is_ok() {
                    // Hash the contents of an explicit specs file, but
                    // not the path to it.
                    hash.delimiter("specs");
                    hashutil::hash_file(hash, Path::new(specs))?;
                    i += 1;
                    continue;
                }
            }

            hash.delimiter("arg");
            hash.update_str(arg);
            i += 1;
        }
        Ok(())
    }

    /// Extend the common hash into the direct-mode manifest key and
    /// consult the manifest. Returns the recorded object hash when the
    /// stored include snapshot still matches the filesystem.
    fn direct_lookup(&mut self, mut hash: Digest) -> Result<Option<FileHash>> {
        self.hash_arguments(&mut hash, true)?;

        if !self.conf.sloppiness.file_macro {
            // The source or an include may use __FILE__, so the hash must
            // be unique per input name.
            hash.delimiter("inputfile");
            hash.update_path(&self.parsed.input_file);
        }

        hash.delimiter("sourcecode");
        let source_hash = hashutil::hash_source_code_file(&mut hash, &self.parsed.input_file)?;
        if source_hash.found_time_macros && !self.conf.sloppiness.time_macros {
            debug!("source file uses time macros; disabling direct mode");
            self.enable_direct = false;
            return Ok(None);
        }

        let manifest_name = hash.finish().object_name();
        let manifest_path = cache::get_path_in_cache(self.conf, &manifest_name, ".manifest")?;
        debug!("looking for object file hash in {:?}", manifest_path);
        let object_hash = manifest::get(self.conf, &manifest_path, self.time_of_compilation);
        self.manifest_path = Some(manifest_path);
        match object_hash {
            Some(_) => debug!("got object file hash from manifest"),
            None => debug!("did not find object file hash in manifest"),
        }
        Ok(object_hash)
    }

    /// Run the preprocessor (unless the input already is preprocessed),
    /// hash its filtered output and stderr, and produce the object key.
    fn get_object_name_from_cpp(&mut self, mut hash: Digest) -> Result<FileHash> {
        self.hash_arguments(&mut hash, false)?;

        // Limit the temp file prefix to cope with filesystems with small
        // name limits.
        let input_base = self
            .parsed
            .input_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_owned());
        let input_base = input_base.split('.').next().unwrap_or("input");
        let input_base: String = input_base.chars().take(10).collect();

        let path_stderr = self.make_temp_file("tmp.cpp_stderr.", "")?;
        let (path_stdout, status) = if !self.parsed.direct_i_file {
            // Run cpp on the input file to obtain the preprocessed text.
            let path_stdout = self.make_temp_file(
                &format!("{}.tmp.", input_base),
                &format!(".{}", self.parsed.i_extension),
            )?;
            let mut args = self.parsed.preprocessor_args.clone();
            args.push("-E".to_owned());
            args.push(self.parsed.input_file.to_string_lossy().into_owned());
            let status = execute::execute(&args, &path_stdout, &path_stderr)?;
            (path_stdout, status)
        } else {
            // Compiling a .i or .ii file directly: the input already is
            // the preprocessed text.
            File::create(&path_stderr)
                .chain_err(|| format!("failed to create {:?}", path_stderr))?;
            (self.parsed.input_file.clone(), 0)
        };

        if status != 0 {
            if !self.parsed.direct_i_file {
                let _ = fs::remove_file(&path_stdout);
            }
            let _ = fs::remove_file(&path_stderr);
            debug!("preprocessor gave exit status {}", status);
            self.count(Statistic::PreprocessorError);
            bail!("preprocessor error");
        }

        if self.enable_unify {
            // The input file name must contribute to the hash to keep the
            // file names in warnings right.
            hash.delimiter("unifyfilename");
            hash.update_path(&self.parsed.input_file);
            hash.delimiter("unifycpp");
            if let Err(e) = unify::unify_hash(&mut hash, &path_stdout) {
                self.count(Statistic::InternalError);
                let _ = fs::remove_file(&path_stderr);
                return Err(e);
            }
        } else {
            hash.delimiter("cpp");
            let scan_context = ScanContext {
                conf: self.conf,
                input_file: &self.parsed.input_file,
                time_of_compilation: self.time_of_compilation,
                collect_includes: self.enable_direct,
            };
            match preprocessed::process_preprocessed_file(&mut hash, &path_stdout, &scan_context) {
                Ok(scan) => {
                    if !scan.direct_mode_ok {
                        self.enable_direct = false;
                    }
                    self.included_files = scan.included_files;
                }
                Err(e) => {
                    self.count(Statistic::InternalError);
                    let _ = fs::remove_file(&path_stderr);
                    return Err(e);
                }
            }
        }

        hash.delimiter("cppstderr");
        hashutil::hash_file(&mut hash, &path_stderr)?;

        self.i_tmpfile = Some(path_stdout);
        if self.compile_preprocessed {
            // The preprocessor's stderr must be replayed just before the
            // compiler's own.
            self.cpp_stderr = Some(path_stderr);
        } else {
            let _ = fs::remove_file(&path_stderr);
        }

        Ok(hash.finish())
    }

    fn make_temp_file(&self, prefix: &str, suffix: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.conf.temp_dir)
            .chain_err(|| format!("failed to create {:?}", self.conf.temp_dir))?;
        let tmp = Builder::new()
            .prefix(prefix)
            .suffix(suffix)
            .tempfile_in(&self.conf.temp_dir)
            .chain_err(|| format!("failed to create temp file in {:?}", self.conf.temp_dir))?;
        let (_file, path) = tmp
            .keep()
            .chain_err(|| "failed to keep temp file")?;
        Ok(path)
    }

    fn set_cached_result(&mut self, object_hash: &FileHash) -> Result<()> {
        let name = object_hash.object_name();
        let obj = cache::get_path_in_cache(self.conf, &name, ".o")?;
        let stderr = cache::get_path_in_cache(self.conf, &name, ".stderr")?;
        let dep = cache::get_path_in_cache(self.conf, &name, ".d")?;
        self.stats_file = self.conf.cache_dir.join(&name[..1]).join("stats");
        self.cached = Some(CachedResult {
            object_hash: *object_hash,
            obj: obj,
            stderr: stderr,
            dep: dep,
        });
        Ok(())
    }

    fn cached(&self) -> Result<CachedResult> {
        match self.cached {
            Some(ref cached) => Ok(cached.clone()),
            None => bail!("no cached result set"),
        }
    }

    /// Copy or link one cached file to its destination, treating a racing
    /// deletion as a miss.
    fn serve_file(&self, cached: &Path, output: &Path) -> Result<Option<()>> {
        let _ = fs::remove_file(output);
        let result = if self.conf.hard_link && !cache::test_if_compressed(cached) {
            fs::hard_link(cached, output)
        } else {
            cache::copy_file(cached, output, false)
        };
        match result {
            Ok(()) => {
                debug!("created {:?} from {:?}", output, cached);
                Ok(Some(()))
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
                // Someone cleaned the file between our stat and the copy.
                debug!("cache file {:?} just disappeared", cached);
                self.count(Statistic::MissingCacheFile);
                Ok(None)
            }
            Err(e) => {
                debug!("failed to copy/link {:?} to {:?}: {}", cached, output, e);
                self.count(Statistic::InternalError);
                bail!("failed to copy {:?} to {:?}", cached, output);
            }
        }
    }

    /// Try to serve the compile result from the cache. Returns the exit
    /// code when everything needed was present.
    fn from_cache(
        &mut self,
        mode: CacheMode,
        put_object_in_manifest: bool,
    ) -> Result<Option<i32>> {
        // The user might be forcing misses.
        if mode != CacheMode::Compiled && self.conf.recache {
            return Ok(None);
        }

        let cached = self.cached()?;

        if fs::metadata(&cached.obj).is_err() {
            debug!("object file {:?} not in cache", cached.obj);
            return Ok(None);
        }

        // In the other modes the dependency file was just written by the
        // preprocessor.
        let produce_dep_file = self.parsed.generating_dependencies && mode == CacheMode::Direct;
        if produce_dep_file && fs::metadata(&cached.dep).is_err() {
            debug!("dependency file {:?} missing in cache", cached.dep);
            return Ok(None);
        }

        if self.parsed.output_obj.as_os_str() != "/dev/null" {
            let output_obj = self.parsed.output_obj.clone();
            if self.serve_file(&cached.obj, &output_obj)?.is_none() {
                let _ = fs::remove_file(&self.parsed.output_obj);
                self.forget_cached_files(&cached);
                return Ok(None);
            }
        }

        if produce_dep_file {
            let output_dep = match self.parsed.output_dep {
                Some(ref dep) => dep.clone(),
                None => bail!("dependency output without a file name"),
            };
            if self.serve_file(&cached.dep, &output_dep)?.is_none() {
                let _ = fs::remove_file(&self.parsed.output_obj);
                let _ = fs::remove_file(&output_dep);
                self.forget_cached_files(&cached);
                return Ok(None);
            }
        }

        // Update modification timestamps so LRU cleanup spares popular
        // entries.
        cache::update_mtime(&cached.obj);
        cache::update_mtime(&cached.stderr);
        if produce_dep_file {
            cache::update_mtime(&cached.dep);
        }

        if self.parsed.generating_dependencies && mode != CacheMode::Direct {
            // Store the dependency file the preprocessor just produced.
            if let Some(ref output_dep) = self.parsed.output_dep {
                match cache::copy_file(output_dep, &cached.dep, self.conf.compress) {
                    Ok(()) => {
                        debug!("stored in cache: {:?}", cached.dep);
                        if let Ok(meta) = fs::metadata(&cached.dep) {
                            stats::update_size(&self.stats_file, Statistic::None, meta.len() / 1024, 1);
                        }
                    }
                    // Continue despite the error.
                    Err(e) => debug!("failed to store {:?}: {}", cached.dep, e),
                }
            }
        }

        self.remove_tmp_files();

        // Replay the compiler's diagnostics.
        if let Ok(mut reader) = cache::open_cached_file(&cached.stderr) {
            let _ = io::copy(&mut reader, &mut io::stderr());
        }

        // Create or update the manifest.
        if self.enable_direct
            && put_object_in_manifest
            && !self.included_files.is_empty()
            && !self.conf.read_only
        {
            if let Some(manifest_path) = self.manifest_path.clone() {
                let old_size = fs::metadata(&manifest_path).map(|m| m.len()).unwrap_or(0);
                match manifest::put(&manifest_path, cached.object_hash, &self.included_files) {
                    Ok(()) => {
                        debug!("added object file hash to {:?}", manifest_path);
                        cache::update_mtime(&manifest_path);
                        let new_size =
                            fs::metadata(&manifest_path).map(|m| m.len()).unwrap_or(0);
                        stats::update_size(
                            &self.stats_file,
                            Statistic::None,
                            new_size.saturating_sub(old_size) / 1024,
                            if old_size == 0 { 1 } else { 0 },
                        );
                    }
                    Err(e) => {
                        debug!("failed to add object file hash to {:?}: {}", manifest_path, e)
                    }
                }
            }
        }

        match mode {
            CacheMode::Direct => {
                debug!("succeeded getting cached result");
                self.count(Statistic::CacheHitDirect);
            }
            CacheMode::Preprocessed => {
                debug!("succeeded getting cached result");
                self.count(Statistic::CacheHitPreprocessed);
            }
            // Already counted when the object was stored.
            CacheMode::Compiled => {}
        }

        Ok(Some(0))
    }

    fn forget_cached_files(&self, cached: &CachedResult) {
        let _ = fs::remove_file(&cached.stderr);
        let _ = fs::remove_file(&cached.obj);
        let _ = fs::remove_file(&cached.dep);
    }

    /// Run the real compiler and put the result in the cache. Returns the
    /// compiler's exit code if it failed (with its stderr forwarded), or
    /// `None` on success.
    fn to_cache(&mut self) -> Result<Option<i32>> {
        let cached = self.cached()?;
        let parent = match cached.obj.parent() {
            Some(parent) => parent.to_path_buf(),
            None => bail!("cache path without a parent"),
        };
        let tmp_stdout = self.make_temp_sibling(&parent, "tmp.stdout.")?;
        let tmp_stderr = self.make_temp_sibling(&parent, "tmp.stderr.")?;
        let tmp_obj = self.make_temp_sibling(&parent, "tmp.o.")?;
        // The compiler creates the object itself; its absence afterwards
        // must be observable.
        let _ = fs::remove_file(&tmp_obj);

        let mut args = self.parsed.compiler_args.clone();
        if let Some(ref prefix) = self.conf.prefix_command {
            match ::which::which(prefix) {
                Ok(path) => {
                    debug!("using command-line prefix {:?}", path);
                    args.insert(0, path.to_string_lossy().into_owned());
                }
                Err(_) => bail!(ErrorKind::Fatal(format!("{}: not found", prefix))),
            }
        }
        args.push("-o".to_owned());
        args.push(tmp_obj.to_string_lossy().into_owned());
        let input = if self.compile_preprocessed {
            match self.i_tmpfile {
                Some(ref path) => path.clone(),
                None => bail!("no preprocessed input available"),
            }
        } else {
            self.parsed.input_file.clone()
        };
        args.push(input.to_string_lossy().into_owned());

        // A DEPENDENCIES_OUTPUT setting would make the compiler emit a
        // dependency line naming our temporary files.
        env::remove_var("DEPENDENCIES_OUTPUT");

        debug!("running real compiler");
        let status = execute::execute(&args, &tmp_stdout, &tmp_stderr)?;

        let stdout_len = fs::metadata(&tmp_stdout).map(|m| m.len());
        if stdout_len.map(|len| len != 0).unwrap_or(true) {
            debug!("compiler produced stdout");
            self.count(Statistic::CompilerProducedStdout);
            let _ = fs::remove_file(&tmp_stdout);
            let _ = fs::remove_file(&tmp_stderr);
            let _ = fs::remove_file(&tmp_obj);
            bail!("compiler produced stdout");
        }
        let _ = fs::remove_file(&tmp_stdout);

        // Merge the preprocessor's stderr (if any) in front of the real
        // compiler's.
        if let Some(cpp_stderr) = self.cpp_stderr.take() {
            let mut merged = fs::read(&cpp_stderr)
                .chain_err(|| format!("failed to read {:?}", cpp_stderr))?;
            let compiler_stderr = fs::read(&tmp_stderr)
                .chain_err(|| format!("failed to read {:?}", tmp_stderr))?;
            merged.extend_from_slice(&compiler_stderr);
            fs::write(&tmp_stderr, &merged)
                .chain_err(|| format!("failed to write {:?}", tmp_stderr))?;
            let _ = fs::remove_file(&cpp_stderr);
        }

        if status != 0 {
            debug!("compiler gave exit status {}", status);
            self.count(Statistic::CompileFailed);

            if let Ok(mut stderr_file) = File::open(&tmp_stderr) {
                // Pass on whatever output the failed compile produced and
                // exit with its status.
                let usable = if self.parsed.output_obj.as_os_str() == "/dev/null" {
                    true
                } else {
                    match util::move_file(&tmp_obj, &self.parsed.output_obj) {
                        Ok(()) => true,
                        Err(ref e) if e.kind() == io::ErrorKind::NotFound => true,
                        Err(_) => false,
                    }
                };
                if usable {
                    let _ = io::copy(&mut stderr_file, &mut io::stderr());
                    let _ = fs::remove_file(&tmp_stderr);
                    self.remove_tmp_files();
                    return Ok(Some(status));
                }
            }
            let _ = fs::remove_file(&tmp_stderr);
            let _ = fs::remove_file(&tmp_obj);
            bail!("compile failed");
        }

        let obj_meta = match fs::metadata(&tmp_obj) {
            Ok(meta) => meta,
            Err(_) => {
                debug!("compiler didn't produce an object file");
                self.count(Statistic::CompilerProducedNoOutput);
                bail!("compiler produced no output");
            }
        };
        if obj_meta.len() == 0 {
            debug!("compiler produced an empty object file");
            self.count(Statistic::CompilerProducedEmptyOutput);
            bail!("compiler produced an empty object file");
        }

        let stderr_meta = match fs::metadata(&tmp_stderr) {
            Ok(meta) => meta,
            Err(e) => {
                debug!("failed to stat {:?}: {}", tmp_stderr, e);
                self.count(Statistic::InternalError);
                bail!("failed to stat compiler stderr");
            }
        };

        let mut added_kib = 0;
        let mut added_files = 0;
        if stderr_meta.len() > 0 {
            if let Err(e) =
                cache::move_file_into_cache(&tmp_stderr, &cached.stderr, self.conf.compress)
            {
                debug!("failed to move {:?} to {:?}: {}", tmp_stderr, cached.stderr, e);
                self.count(Statistic::InternalError);
                bail!("failed to store stderr in the cache");
            }
            debug!("stored in cache: {:?}", cached.stderr);
            if let Ok(meta) = fs::metadata(&cached.stderr) {
                added_kib += meta.len() / 1024;
                added_files += 1;
            }
        } else {
            let _ = fs::remove_file(&tmp_stderr);
        }

        if let Err(e) = cache::move_file_into_cache(&tmp_obj, &cached.obj, self.conf.compress) {
            debug!("failed to move {:?} to {:?}: {}", tmp_obj, cached.obj, e);
            self.count(Statistic::InternalError);
            bail!("failed to store the object in the cache");
        }
        debug!("stored in cache: {:?}", cached.obj);
        if let Ok(meta) = fs::metadata(&cached.obj) {
            added_kib += meta.len() / 1024;
            added_files += 1;
        }

        stats::update_size(&self.stats_file, Statistic::CacheMiss, added_kib, added_files);
        Ok(None)
    }

    fn make_temp_sibling(&self, parent: &Path, prefix: &str) -> Result<PathBuf> {
        let tmp = Builder::new()
            .prefix(prefix)
            .tempfile_in(parent)
            .chain_err(|| format!("failed to create temp file in {:?}", parent))?;
        let (_file, path) = tmp.keep().chain_err(|| "failed to keep temp file")?;
        Ok(path)
    }

    /// Get rid of the per-run intermediate files.
    fn remove_tmp_files(&mut self) {
        if let Some(path) = self.i_tmpfile.take() {
            if !self.parsed.direct_i_file {
                let _ = fs::remove_file(&path);
            }
        }
        if let Some(path) = self.cpp_stderr.take() {
            let _ = fs::remove_file(&path);
        }
    }
}

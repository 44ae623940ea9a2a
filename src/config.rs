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

use dirs;
use std::env;
use std::path::PathBuf;

use errors::*;

/// The name this tool must be invoked as (or prefixed with) to be told
/// apart from the compiler it wraps.
pub const MYNAME: &'static str = "cache-tool";

/// Correctness checks the user has chosen to relax, at their own risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sloppiness {
    /// Don't hash the input file name, ignoring `__FILE__` sensitivity.
    pub file_macro: bool,
    /// Accept include files modified after the compilation started.
    pub include_file_mtime: bool,
    /// Ignore `__DATE__`, `__TIME__` and `__TIMESTAMP__` in sources.
    pub time_macros: bool,
}

/// How much of the compiler binary's identity goes into the hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerCheck {
    None,
    Mtime,
    Content,
}

/// Per-run configuration, read once from the environment at startup and
/// threaded through the classifier, driver and cache.
#[derive(Debug, Clone)]
pub struct Config {
    pub cache_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub log_file: Option<PathBuf>,
    /// Paths prefixed by this absolute directory are stored relative.
    pub base_dir: Option<PathBuf>,
    pub disable: bool,
    pub read_only: bool,
    pub recache: bool,
    pub hard_link: bool,
    pub compress: bool,
    pub unify: bool,
    pub no_direct: bool,
    /// Cache directory fan-out, clamped to `[1, 8]` levels.
    pub nlevels: usize,
    /// CACHE_CPP2: run the compiler on the original source rather than
    /// the already-preprocessed temporary.
    pub run_second_cpp: bool,
    /// CACHE_EXTENSION: override of the intermediate file extension.
    pub i_extension: Option<String>,
    pub sloppiness: Sloppiness,
    pub compiler_check: CompilerCheck,
    pub extra_files_to_hash: Vec<PathBuf>,
    /// CACHE_CC: override of the real compiler's name.
    pub compiler: Option<String>,
    /// CACHE_PREFIX: executable to prepend to the compiler invocation.
    pub prefix_command: Option<String>,
    /// CACHE_UMASK, already parsed from octal.
    pub umask: Option<u32>,
    /// CACHE_HASHDIR: include the working directory in the hash.
    pub hash_working_dir: bool,
    pub cwd: PathBuf,
}

fn env_flag(name: &str) -> bool {
    env::var_os(name).is_some()
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.is_empty())
}

pub fn parse_sloppiness(list: &str) -> Sloppiness {
    let mut sloppiness = Sloppiness::default();
    for word in list.split(|c| c == ',' || c == ' ').filter(|w| !w.is_empty()) {
        match word {
            "file_macro" => {
                debug!("being sloppy about __FILE__");
                sloppiness.file_macro = true;
            }
            "include_file_mtime" => {
                debug!("being sloppy about include file mtime");
                sloppiness.include_file_mtime = true;
            }
            "time_macros" => {
                debug!("being sloppy about __DATE__ and __TIME__");
                sloppiness.time_macros = true;
            }
            w => debug!("ignoring unknown sloppiness word: {}", w),
        }
    }
    sloppiness
}

fn clamp_nlevels(value: i64) -> usize {
    if value < 1 {
        1
    } else if value > 8 {
        8
    } else {
        value as usize
    }
}

impl Config {
    pub fn from_env() -> Result<Config> {
        let cache_dir = env_string("CACHE_DIR")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".cache-tool")))
            .ok_or_else(|| {
                Error::from_kind(ErrorKind::Fatal("unable to determine cache directory".into()))
            })?;

        let temp_dir = env_string("CACHE_TEMPDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| cache_dir.join("tmp"));

        let base_dir = env_string("CACHE_BASEDIR").map(PathBuf::from).and_then(|dir| {
            if dir.is_absolute() {
                Some(dir)
            } else {
                debug!("ignoring non-absolute base directory {:?}", dir);
                None
            }
        });

        let nlevels = match env_string("CACHE_NLEVELS") {
            Some(s) => clamp_nlevels(s.parse().unwrap_or(0)),
            None => 2,
        };

        let compiler_check = match env_string("CACHE_COMPILERCHECK").as_ref().map(|s| s.as_str()) {
            Some("none") => CompilerCheck::None,
            Some("content") => CompilerCheck::Content,
            _ => CompilerCheck::Mtime,
        };

        let sloppiness = match env_string("CACHE_SLOPPINESS") {
            Some(list) => parse_sloppiness(&list),
            None => Sloppiness::default(),
        };

        let extra_files_to_hash = env_string("CACHE_EXTRAFILES")
            .map(|list| {
                list.split(':')
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_else(Vec::new);

        let umask = env_string("CACHE_UMASK").and_then(|s| u32::from_str_radix(&s, 8).ok());

        let cwd = env::current_dir().chain_err(|| "couldn't determine working directory")?;

        Ok(Config {
            cache_dir: cache_dir,
            temp_dir: temp_dir,
            log_file: env_string("CACHE_LOGFILE").map(PathBuf::from),
            base_dir: base_dir,
            disable: env_flag("CACHE_DISABLE"),
            read_only: env_flag("CACHE_READONLY"),
            recache: env_flag("CACHE_RECACHE"),
            hard_link: env_flag("CACHE_HARDLINK"),
            compress: env_flag("CACHE_COMPRESS"),
            unify: env_flag("CACHE_UNIFY"),
            no_direct: env_flag("CACHE_NODIRECT"),
            nlevels: nlevels,
            run_second_cpp: env_flag("CACHE_CPP2"),
            i_extension: env_string("CACHE_EXTENSION"),
            sloppiness: sloppiness,
            compiler_check: compiler_check,
            extra_files_to_hash: extra_files_to_hash,
            compiler: env_string("CACHE_CC"),
            prefix_command: env_string("CACHE_PREFIX"),
            umask: umask,
            hash_working_dir: env_flag("CACHE_HASHDIR"),
            cwd: cwd,
        })
    }

    /// A configuration for driving the cache programmatically; used by the
    /// test suites.
    pub fn for_dirs(cache_dir: PathBuf, temp_dir: PathBuf, cwd: PathBuf) -> Config {
        Config {
            cache_dir: cache_dir,
            temp_dir: temp_dir,
            log_file: None,
            base_dir: None,
            disable: false,
            read_only: false,
            recache: false,
            hard_link: false,
            compress: false,
            unify: false,
            no_direct: false,
            nlevels: 2,
            run_second_cpp: false,
            i_extension: None,
            sloppiness: Sloppiness::default(),
            compiler_check: CompilerCheck::Mtime,
            extra_files_to_hash: vec![],
            compiler: None,
            prefix_command: None,
            umask: None,
            hash_working_dir: false,
            cwd: cwd,
        }
    }
}

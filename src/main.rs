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

extern crate cache_tool;
extern crate env_logger;
extern crate fern;
extern crate libc;
#[macro_use]
extern crate log;

use cache_tool::config::{self, Config, MYNAME};
use cache_tool::errors::*;
use cache_tool::{cache, cmdline, commands, driver, fallback};
use std::env;
use std::fs;
use std::path::Path;
use std::process;

const USAGE: &'static str = "\
Usage:
    cache-tool [options]
    cache-tool compiler [compiler options]
    compiler [compiler options]          (via symbolic link)

Run `cache-tool --help` for the list of options.
";

/// Log to the configured file when there is one, to stderr via RUST_LOG
/// otherwise. Logging failures never break a compilation.
fn init_logging(conf: &Config) {
    match conf.log_file {
        Some(ref path) => {
            let result = fern::Dispatch::new()
                .format(|out, message, record| {
                    out.finish(format_args!("[{}] {}", record.level(), message))
                })
                .level(log::LevelFilter::Debug)
                .chain(fern::log_file(path).map(fern::Output::from).unwrap_or_else(
                    |_| fern::Output::stderr("\n"),
                ))
                .apply();
            if result.is_err() {
                drop(env_logger::try_init());
            }
        }
        None => {
            drop(env_logger::try_init());
        }
    }
}

fn apply_umask() {
    if let Ok(value) = env::var("CACHE_UMASK") {
        if let Ok(mask) = u32::from_str_radix(&value, 8) {
            unsafe {
                libc::umask(mask as libc::mode_t);
            }
        }
    }
}

fn fatal(message: &str) -> ! {
    eprintln!("{}: {}", MYNAME, message);
    process::exit(1);
}

fn run_management(argv: Vec<String>) -> ! {
    let commands_list = match cmdline::parse(&argv) {
        Ok(commands_list) => commands_list,
        Err(e) => fatal(&format!("{}", e)),
    };
    let conf = match Config::from_env() {
        Ok(conf) => conf,
        Err(e) => fatal(&format!("{}", e)),
    };
    init_logging(&conf);
    process::exit(commands::run_commands(&conf, commands_list));
}

fn run_compiler(argv: Vec<String>) -> ! {
    let conf = match Config::from_env() {
        Ok(conf) => conf,
        Err(e) => fatal(&format!("{}", e)),
    };
    init_logging(&conf);
    debug!("=== {} started ===", MYNAME);
    debug!("working directory: {:?}", conf.cwd);
    if let Some(ref base_dir) = conf.base_dir {
        debug!("base directory: {:?}", base_dir);
    }

    if let Err(e) = fs::create_dir_all(&conf.cache_dir) {
        fatal(&format!("failed to create {:?} ({})", conf.cache_dir, e));
    }
    if let Err(e) = fs::create_dir_all(&conf.temp_dir) {
        fatal(&format!("failed to create {:?} ({})", conf.temp_dir, e));
    }
    if !conf.read_only {
        if let Err(e) = cache::create_cachedir_tag(&conf.cache_dir) {
            fatal(&format!(
                "failed to create {:?}/CACHEDIR.TAG ({})",
                conf.cache_dir, e
            ));
        }
    }

    let orig_args = match driver::find_compiler(&conf, &argv) {
        Ok(orig_args) => orig_args,
        Err(e) => fatal(&format!("{}", e)),
    };

    if conf.disable {
        debug!("{} is disabled", MYNAME);
        fallback::run_real_compiler(&conf, orig_args);
    }

    match driver::run(&conf, &orig_args) {
        Ok(code) => process::exit(code),
        Err(e) => {
            if let ErrorKind::Fatal(ref message) = *e.kind() {
                fatal(message);
            }
            debug!("{}", e);
            fallback::run_real_compiler(&conf, orig_args);
        }
    }
}

fn main() {
    apply_umask();

    let argv: Vec<String> = match env::args_os()
        .map(|arg| arg.into_string())
        .collect::<::std::result::Result<Vec<String>, _>>()
    {
        Ok(argv) => argv,
        // Arguments we can't even represent are never cacheable.
        Err(_) => fatal("arguments must be valid UTF-8"),
    };
    if argv.is_empty() {
        fatal("no program name");
    }

    let program_name = Path::new(&argv[0])
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| argv[0].clone());

    if program_name == config::MYNAME {
        if argv.len() < 2 {
            eprint!("{}", USAGE);
            process::exit(1);
        }
        if argv[1].starts_with('-') {
            run_management(argv);
        }
    }

    run_compiler(argv);
}

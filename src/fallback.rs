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

//! The universal give-up path: re-exec the real compiler with the user's
//! original arguments, so the tool is never worse than not being there.

use config::{Config, MYNAME};
use std::os::unix::process::CommandExt;
use std::process::{self, Command};
use which;

/// Replace this process with the real compiler. `orig_args[0]` must
/// already be the resolved compiler path. Never returns.
pub fn run_real_compiler(conf: &Config, orig_args: Vec<String>) -> ! {
    // Strip any of our own options.
    let args: Vec<String> = orig_args
        .into_iter()
        .filter(|arg| !arg.starts_with("--ccache-"))
        .collect();
    let mut argv = args;
    if let Some(ref prefix) = conf.prefix_command {
        match which::which(prefix) {
            Ok(path) => {
                debug!("using command-line prefix {:?}", path);
                argv.insert(0, path.to_string_lossy().into_owned());
            }
            Err(_) => {
                eprintln!("{}: {}: not found", MYNAME, prefix);
                process::exit(1);
            }
        }
    }
    debug!("failed; falling back to running the real compiler");
    debug!("executing {:?}", argv);
    let err = Command::new(&argv[0]).args(&argv[1..]).exec();
    eprintln!("{}: failed to execute {}: {}", MYNAME, argv[0], err);
    process::exit(1);
}

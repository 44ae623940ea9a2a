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

use cleanup;
use cmdline::Command;
use config::Config;
use stats;

use errors::*;

/// Run the management commands in order. Returns the process exit code.
pub fn run_commands(conf: &Config, commands: Vec<Command>) -> i32 {
    for command in commands {
        if let Err(e) = run_one(conf, command) {
            eprintln!("{}: {}", ::config::MYNAME, e);
            return 1;
        }
    }
    0
}

fn run_one(conf: &Config, command: Command) -> Result<()> {
    match command {
        Command::ShowStats => {
            stats::summary(conf);
        }
        Command::ZeroStats => {
            stats::zero(conf)?;
            println!("Statistics cleared");
        }
        Command::Cleanup => {
            cleanup::cleanup_all(conf)?;
            println!("Cleaned cache");
        }
        Command::Clear => {
            cleanup::wipe_all(conf)?;
            println!("Cleared cache");
        }
        Command::SetMaxFiles(files) => {
            stats::set_limits(conf, Some(files), None)?;
            if files == 0 {
                println!("Unset cache file limit");
            } else {
                println!("Set cache file limit to {}", files);
            }
        }
        Command::SetMaxSize(size_kib) => {
            stats::set_limits(conf, None, Some(size_kib))?;
            if size_kib == 0 {
                println!("Unset cache size limit");
            } else {
                println!("Set cache size limit to {}", stats::format_size(size_kib));
            }
        }
    }
    Ok(())
}

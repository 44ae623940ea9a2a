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

use clap::{App, AppSettings, Arg};
use config::MYNAME;

use errors::*;

/// A management command, parsed from `cache-tool [option...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ShowStats,
    ZeroStats,
    Cleanup,
    Clear,
    /// Limit the number of files in the cache; 0 removes the limit.
    SetMaxFiles(u64),
    /// Limit the cache size, in KiB; 0 removes the limit.
    SetMaxSize(u64),
}

fn app() -> App<'static, 'static> {
    App::new(MYNAME)
        .version(env!("CARGO_PKG_VERSION"))
        .about("a compiler cache")
        .setting(AppSettings::ArgRequiredElseHelp)
        .arg(
            Arg::with_name("show-stats")
                .short("s")
                .long("show-stats")
                .help("show statistics summary"),
        )
        .arg(
            Arg::with_name("zero-stats")
                .short("z")
                .long("zero-stats")
                .help("zero statistics counters"),
        )
        .arg(
            Arg::with_name("cleanup")
                .short("c")
                .long("cleanup")
                .help("delete old files and recalculate size counters"),
        )
        .arg(
            Arg::with_name("clear")
                .short("C")
                .long("clear")
                .help("clear the cache completely"),
        )
        .arg(
            Arg::with_name("max-files")
                .short("F")
                .long("max-files")
                .takes_value(true)
                .value_name("N")
                .help("set maximum number of files in cache (0 = no limit)"),
        )
        .arg(
            Arg::with_name("max-size")
                .short("M")
                .long("max-size")
                .takes_value(true)
                .value_name("SIZE")
                .help("set maximum size of cache (suffixes G, M and K; default G)"),
        )
}

/// Parse a size with an optional G/M/K suffix (default G) into KiB.
pub fn value_units(value: &str) -> Option<u64> {
    let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let number: u64 = digits.parse().ok()?;
    match &value[digits.len()..] {
        "" | "G" | "g" => Some(number * 1024 * 1024),
        "M" | "m" => Some(number * 1024),
        "K" | "k" => Some(number),
        _ => None,
    }
}

/// Parse a management command line. Help/version output and option
/// errors are handled by clap, which exits 0 and 1 respectively.
pub fn parse(argv: &[String]) -> Result<Vec<Command>> {
    let matches = app().get_matches_from(argv);
    let mut commands = Vec::new();
    if matches.is_present("show-stats") {
        commands.push(Command::ShowStats);
    }
    if matches.is_present("zero-stats") {
        commands.push(Command::ZeroStats);
    }
    if matches.is_present("cleanup") {
        commands.push(Command::Cleanup);
    }
    if matches.is_present("clear") {
        commands.push(Command::Clear);
    }
    if let Some(value) = matches.value_of("max-files") {
        let files = value
            .parse()
            .chain_err(|| format!("invalid file count: {}", value))?;
        commands.push(Command::SetMaxFiles(files));
    }
    if let Some(value) = matches.value_of("max-size") {
        let size = match value_units(value) {
            Some(size) => size,
            None => bail!("invalid size: {}", value),
        };
        commands.push(Command::SetMaxSize(size));
    }
    Ok(commands)
}

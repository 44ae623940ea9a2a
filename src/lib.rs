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

extern crate bincode;
extern crate clap;
extern crate dirs;
#[macro_use]
extern crate error_chain;
extern crate filetime;
extern crate flate2;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
extern crate md5;
extern crate memmap2;
extern crate number_prefix;
extern crate regex;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate tempfile;
extern crate walkdir;
extern crate which;

#[cfg(test)]
extern crate tempdir;

/// Assert that two expressions compare unequal.
#[cfg(test)]
macro_rules! assert_neq {
    ($left:expr, $right:expr) => {
        match (&($left), &($right)) {
            (left_val, right_val) => {
                if left_val == right_val {
                    panic!(
                        "assertion failed: `(left != right)` (left: `{:?}`, right: `{:?}`)",
                        left_val, right_val
                    )
                }
            }
        }
    };
}

pub mod errors;

pub mod cache;
pub mod cleanup;
pub mod cmdline;
pub mod commands;
pub mod compiler;
pub mod config;
pub mod digest;
pub mod driver;
pub mod execute;
pub mod fallback;
pub mod hashutil;
pub mod manifest;
pub mod preprocessed;
pub mod stats;
pub mod unify;
pub mod util;

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

use digest::Digest;
use regex::bytes::Regex;
use std::fs::File;
use std::io;
use std::path::Path;
use util;

use errors::*;

lazy_static! {
    /// Macros that make a compilation depend on the time it ran.
    static ref TIME_MACROS: Regex = Regex::new(r"__(DATE|TIME|TIMESTAMP)__").unwrap();
}

/// What hashing a source file noticed along the way. `found_time_macros`
/// is advisory: callers that are sloppy about time macros ignore it,
/// everyone else must disable direct mode for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceHash {
    pub found_time_macros: bool,
}

/// Hash a source buffer, scanning it for `__DATE__`, `__TIME__` and
/// `__TIMESTAMP__`.
pub fn hash_source_code_string(digest: &mut Digest, source: &[u8]) -> SourceHash {
    digest.update(source);
    SourceHash {
        found_time_macros: TIME_MACROS.is_match(source),
    }
}

/// Hash a source file, scanning its contents for time macros.
pub fn hash_source_code_file(digest: &mut Digest, path: &Path) -> Result<SourceHash> {
    let file = File::open(path).chain_err(|| format!("failed to open {:?}", path))?;
    let data = util::map_file(&file).chain_err(|| format!("failed to map {:?}", path))?;
    Ok(hash_source_code_string(digest, &data))
}

/// Hash a file's raw bytes, with no scanning.
pub fn hash_file(digest: &mut Digest, path: &Path) -> Result<()> {
    let mut file = File::open(path).chain_err(|| format!("failed to open {:?}", path))?;
    io::copy(&mut file, digest).chain_err(|| format!("failed to read {:?}", path))?;
    Ok(())
}

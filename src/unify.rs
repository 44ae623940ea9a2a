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

//! The unify hash: an alternative digest of preprocessed output that is
//! insensitive to whitespace and line-number changes. The text is split
//! into tokens (identifier/number runs, string and character literals,
//! single punctuation characters) and each token is hashed with a
//! separator; preprocessor line markers are skipped entirely.

use digest::Digest;
use std::cmp;
use std::fs::File;
use std::path::Path;
use util;

use errors::*;

fn is_ident_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'.'
}

fn push_token(digest: &mut Digest, token: &[u8]) {
    digest.update(token);
    digest.update(b"\n");
}

fn unify(digest: &mut Digest, data: &[u8]) {
    let len = data.len();
    let mut i = 0;
    let mut at_line_start = true;
    while i < len {
        let byte = data[i];
        if byte == b'\n' {
            at_line_start = true;
            i += 1;
            continue;
        }
        if byte.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if at_line_start && byte == b'#' {
            // A line marker; its content must not affect the hash.
            while i < len && data[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        at_line_start = false;
        if is_ident_char(byte) {
            let start = i;
            while i < len && is_ident_char(data[i]) {
                i += 1;
            }
            push_token(digest, &data[start..i]);
            continue;
        }
        if byte == b'"' || byte == b'\'' {
            let quote = byte;
            let start = i;
            i += 1;
            while i < len {
                if data[i] == b'\\' {
                    i += 2;
                } else if data[i] == quote {
                    i += 1;
                    break;
                } else {
                    i += 1;
                }
            }
            i = cmp::min(i, len);
            push_token(digest, &data[start..i]);
            continue;
        }
        push_token(digest, &data[i..i + 1]);
        i += 1;
    }
}

/// Hash the preprocessed file at `path` in unified form.
pub fn unify_hash(digest: &mut Digest, path: &Path) -> Result<()> {
    let file = File::open(path).chain_err(|| format!("failed to open {:?}", path))?;
    let data = util::map_file(&file).chain_err(|| format!("failed to map {:?}", path))?;
    unify(digest, &data);
    Ok(())
}

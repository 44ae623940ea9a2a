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

use md5::{Digest as Md5Digest, Md5};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// A streaming message digest together with a count of the bytes fed into
/// it. The byte total is part of a cache entry's identity, so two hash
/// states are only equal if they saw the same number of bytes.
#[derive(Clone)]
pub struct Digest {
    md: Md5,
    total: u64,
}

impl Digest {
    pub fn new() -> Digest {
        Digest {
            md: Md5::new(),
            total: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.md.update(data);
        self.total += data.len() as u64;
    }

    /// Hash a string, including a terminating NUL so that adjacent strings
    /// can't run together.
    pub fn update_str(&mut self, s: &str) {
        self.update(s.as_bytes());
        self.update(&[0]);
    }

    pub fn update_path(&mut self, path: &Path) {
        self.update(path.as_os_str().as_bytes());
        self.update(&[0]);
    }

    pub fn update_int(&mut self, n: i64) {
        self.update(&n.to_le_bytes());
    }

    /// Hash a NUL-wrapped label marking the start of a semantically
    /// distinct field, so that concatenated fields can't collide.
    pub fn delimiter(&mut self, label: &str) {
        self.update(&[0]);
        self.update(label.as_bytes());
        self.update(&[0]);
    }

    pub fn finish(self) -> FileHash {
        let Digest { md, total } = self;
        FileHash {
            digest: md.finalize().into(),
            size: total,
        }
    }
}

impl io::Write for Digest {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The identity of a hashed byte stream: the digest plus the number of
/// bytes that went into it. Also used per included file, where `size` is
/// the file's length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHash {
    pub digest: [u8; 16],
    pub size: u64,
}

impl FileHash {
    /// The textual name used to derive cache paths: the hex digest
    /// followed by the decimal byte total.
    pub fn object_name(&self) -> String {
        let mut name = String::with_capacity(52);
        for byte in self.digest.iter() {
            name.push_str(&format!("{:02x}", byte));
        }
        name.push_str(&format!("{}", self.size));
        name
    }
}

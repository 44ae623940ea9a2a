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

use std::fs::File;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Stdio};
use std::path::Path;

use errors::*;

pub fn exit_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

/// Run a command with stdout and stderr captured to files, returning its
/// exit code.
pub fn execute(argv: &[String], stdout_path: &Path, stderr_path: &Path) -> Result<i32> {
    let stdout = File::create(stdout_path)
        .chain_err(|| format!("failed to create {:?}", stdout_path))?;
    let stderr = File::create(stderr_path)
        .chain_err(|| format!("failed to create {:?}", stderr_path))?;
    debug!("executing {:?}", argv);
    let status = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .status()
        .chain_err(|| format!("failed to execute {:?}", argv[0]))?;
    Ok(exit_code(status))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use tempdir::TempDir;

    #[test]
    fn test_execute_captures_output() {
        let t = TempDir::new("cache-tool-exec").unwrap();
        let out = t.path().join("out");
        let err = t.path().join("err");
        let args = vec![
            "/bin/sh".to_owned(),
            "-c".to_owned(),
            "echo to-stdout; echo to-stderr >&2; exit 3".to_owned(),
        ];
        let code = execute(&args, &out, &err).unwrap();
        assert_eq!(code, 3);
        assert_eq!(fs::read_to_string(&out).unwrap(), "to-stdout\n");
        assert_eq!(fs::read_to_string(&err).unwrap(), "to-stderr\n");
    }

    #[test]
    fn test_execute_missing_binary_is_an_error() {
        let t = TempDir::new("cache-tool-exec").unwrap();
        let out = t.path().join("out");
        let err = t.path().join("err");
        let args = vec!["/no/such/binary".to_owned()];
        assert!(execute(&args, &out, &err).is_err());
    }
}

//! Shell command execution with merged output capture.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::{debug, warn};

/// Returned by [`execute`] when the shell could not be started.
pub const SHELL_SPAWN_FAILED: &str = "ERROR: failed to spawn shell";

/// Size of the intermediate read buffer.
const READ_CHUNK_SIZE: usize = 256;

#[cfg(target_os = "android")]
const SHELL: &str = "/system/bin/sh";

#[cfg(not(target_os = "android"))]
const SHELL: &str = "/bin/sh";

/// Runs `command` through `sh -c` as a group with stderr redirected into
/// stdout and returns everything it printed.
///
/// Output is read synchronously until EOF, then the child is reaped. Invalid
/// UTF-8 is replaced rather than rejected. Returns [`SHELL_SPAWN_FAILED`] if
/// the shell itself cannot be spawned; a command that runs and fails still
/// yields its output.
#[must_use]
pub fn execute(command: &str) -> String {
    execute_with(Path::new(SHELL), command)
}

/// [`execute`] through an explicit shell binary.
pub(crate) fn execute_with(shell: &Path, command: &str) -> String {
    let mut child = match Command::new(shell)
        .arg("-c")
        .arg(format!("{{ {command}\n}} 2>&1"))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!(shell = %shell.display(), error = %e, "failed to spawn shell");
            return SHELL_SPAWN_FAILED.to_string();
        },
    };

    let mut output = Vec::new();
    if let Some(mut stdout) = child.stdout.take() {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match stdout.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => output.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {},
                Err(e) => {
                    debug!(error = %e, "shell output truncated");
                    break;
                },
            }
        }
    }

    match child.wait() {
        Ok(status) => debug!(%status, "shell command finished"),
        Err(e) => debug!(error = %e, "failed to reap shell"),
    }

    String::from_utf8_lossy(&output).into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout() {
        assert_eq!(execute("echo hello"), "hello\n");
    }

    #[test]
    fn merges_stderr_into_stdout() {
        let output = execute("echo out; echo err >&2");
        assert!(output.contains("out"));
        assert!(output.contains("err"));
    }

    #[test]
    fn failing_command_still_returns_output() {
        let output = execute("definitely-not-a-command-thanatos");
        assert!(!output.is_empty());
        assert_ne!(output, SHELL_SPAWN_FAILED);
    }

    #[test]
    fn missing_shell_yields_sentinel() {
        let output = execute_with(Path::new("/nonexistent/thanatos/sh"), "echo hello");
        assert_eq!(output, SHELL_SPAWN_FAILED);
    }

    #[test]
    fn output_larger_than_read_chunk_is_complete() {
        let output = execute("i=0; while [ $i -lt 200 ]; do echo line-$i; i=$((i+1)); done");
        assert_eq!(output.lines().count(), 200);
        assert!(output.ends_with("line-199\n"));
    }
}

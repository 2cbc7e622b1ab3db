//! OOM score adjustment.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use super::{TelemetryError, TelemetryResult};

/// Lowest value the kernel accepts for `oom_score_adj`.
pub const OOM_SCORE_ADJ_MIN: i32 = -1000;

/// Highest value the kernel accepts for `oom_score_adj`.
pub const OOM_SCORE_ADJ_MAX: i32 = 1000;

/// Writes `score` as text to `<proc_root>/<pid>/oom_score_adj`.
///
/// The file is never created: if the process has exited, the open fails
/// and so does this call.
///
/// # Errors
///
/// Returns an error if the control file cannot be opened or written.
pub fn write_score(proc_root: &Path, pid: i32, score: i32) -> TelemetryResult<()> {
    let path = proc_root.join(pid.to_string()).join("oom_score_adj");
    let io_error = |source| TelemetryError::Io {
        path: path.display().to_string(),
        source,
    };

    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(&path)
        .map_err(io_error)?;
    file.write_all(score.to_string().as_bytes())
        .map_err(io_error)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn writes_score_as_text() {
        let root = TempDir::new().unwrap();
        let pid_dir = root.path().join("1234");
        fs::create_dir(&pid_dir).unwrap();
        fs::write(pid_dir.join("oom_score_adj"), "0").unwrap();

        write_score(root.path(), 1234, OOM_SCORE_ADJ_MIN).unwrap();

        assert_eq!(
            fs::read_to_string(pid_dir.join("oom_score_adj")).unwrap(),
            "-1000"
        );
    }

    #[test]
    fn exited_process_is_an_error_and_creates_nothing() {
        let root = TempDir::new().unwrap();

        let result = write_score(root.path(), 99999, OOM_SCORE_ADJ_MAX);

        assert!(matches!(result, Err(TelemetryError::Io { .. })));
        assert!(!root.path().join("99999").exists());
    }
}

//! PID file lifecycle (spec §6 "Persisted state"): the only state this
//! daemon persists to disk across restarts.
//!
//! Grounded on the teacher's `exit::ExitHook`: a small guard type that
//! undoes process-owned external state on `Drop`. There, it restores PWM
//! settings; here, it removes the PID file.

use std::{fs, io::Write as _, os::unix::fs::OpenOptionsExt as _, path::PathBuf};

use anyhow::Context as _;

/// Mode bits for the PID file (spec §6: "mode 0600")
const PID_FILE_MODE: u32 = 0o600;

/// An owned PID file, removed when dropped
pub(crate) struct PidFile {
    /// Path the file was written to
    path: PathBuf,
}

impl PidFile {
    /// Write the current process PID to `path` (decimal, trailing newline,
    /// mode 0600), replacing any existing file at that path
    pub(crate) fn create(path: PathBuf) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(PID_FILE_MODE)
            .open(&path)
            .with_context(|| format!("failed to create PID file {}", path.display()))?;
        writeln!(file, "{pid}")
            .with_context(|| format!("failed to write PID file {}", path.display()))?;
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("failed to remove PID file {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt as _;

    use super::*;

    #[test]
    fn create_writes_decimal_pid_with_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smartd.pid");
        let pid_file = PidFile::create(path.clone()).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, format!("{}\n", std::process::id()));
        drop(pid_file);
        assert!(!path.exists());
    }

    #[test]
    fn create_sets_mode_0600() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smartd.pid");
        let pid_file = PidFile::create(path.clone()).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        drop(pid_file);
    }

    #[test]
    fn drop_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smartd.pid");
        {
            let _pid_file = PidFile::create(path.clone()).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}

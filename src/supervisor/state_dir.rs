use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;

use rand::Rng;

use super::SupervisorError;

pub const PID_FILE_NAME: &str = "llamafile.pid";
pub const API_KEY_FILE_NAME: &str = "api_key";

/// Directory holding the daemon's PID file and API key.
///
/// The PID file is trusted on a best-effort basis: a stale PID that the OS
/// has since reused for an unrelated process is not detected.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn pid_path(&self) -> PathBuf {
        self.root.join(PID_FILE_NAME)
    }

    pub fn api_key_path(&self) -> PathBuf {
        self.root.join(API_KEY_FILE_NAME)
    }

    pub fn ensure(&self) -> Result<(), SupervisorError> {
        fs::create_dir_all(&self.root).map_err(|source| SupervisorError::StateFile {
            path: self.root.clone(),
            source,
        })
    }

    pub fn write_pid(&self, pid: u32) -> Result<(), SupervisorError> {
        let path = self.pid_path();
        fs::write(&path, pid.to_string())
            .map_err(|source| SupervisorError::StateFile { path, source })
    }

    /// Returns `None` when no PID file exists.
    pub fn read_pid(&self) -> Result<Option<u32>, SupervisorError> {
        let path = self.pid_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(SupervisorError::StateFile { path, source }),
        };

        raw.trim()
            .parse::<u32>()
            .ok()
            .filter(|pid| *pid > 0)
            .map(Some)
            .ok_or_else(|| SupervisorError::InvalidPidFile {
                path,
                content: raw.trim().to_string(),
            })
    }

    pub fn remove_pid(&self) -> Result<(), SupervisorError> {
        let path = self.pid_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SupervisorError::StateFile { path, source }),
        }
    }

    pub fn write_api_key(&self, api_key: &str) -> Result<(), SupervisorError> {
        let path = self.api_key_path();
        let write = || -> io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&path)?;
            // mode() only applies on creation
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
            file.write_all(api_key.as_bytes())
        };
        write().map_err(|source| SupervisorError::StateFile {
            path: path.clone(),
            source,
        })
    }

    pub fn read_api_key(&self) -> Option<String> {
        fs::read_to_string(self.api_key_path())
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|key| !key.is_empty())
    }
}

pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

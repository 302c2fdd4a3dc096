use std::env;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

pub const EXECUTABLE_NAME: &str = "llamafile";

const ENV_LLAMAFILE: &str = "LLAMAFILE";
const ENV_LLAMAFILE_PATH: &str = "LLAMAFILE_PATH";

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("specified executable path {} not found or not executable", .0.display())]
    InvalidExplicitPath(PathBuf),
    #[error(
        "llamafile executable not found in LLAMAFILE, LLAMAFILE_PATH, current directory, or PATH"
    )]
    NotFound,
    #[error("failed to resolve current directory")]
    CurrentDir(#[source] io::Error),
}

/// Resolves the inference-server binary: explicit path, `LLAMAFILE`,
/// `LLAMAFILE_PATH`, `./llamafile`, then `PATH`.
#[derive(Debug, Clone)]
pub struct ExecutableLocator {
    llamafile_var: Option<OsString>,
    llamafile_path_var: Option<OsString>,
    search_path: Option<OsString>,
    cwd: PathBuf,
}

impl ExecutableLocator {
    pub fn from_env() -> Result<Self, LocateError> {
        let cwd = env::current_dir().map_err(LocateError::CurrentDir)?;
        Ok(Self::from_env_with(|key| env::var_os(key), cwd))
    }

    pub(crate) fn from_env_with(
        mut get_var: impl FnMut(&str) -> Option<OsString>,
        cwd: PathBuf,
    ) -> Self {
        Self {
            llamafile_var: get_var(ENV_LLAMAFILE).filter(|value| !value.is_empty()),
            llamafile_path_var: get_var(ENV_LLAMAFILE_PATH).filter(|value| !value.is_empty()),
            search_path: get_var("PATH"),
            cwd,
        }
    }

    pub fn locate(&self, explicit: Option<&Path>) -> Result<PathBuf, LocateError> {
        if let Some(path) = explicit {
            let candidate = self.absolute(path);
            debug!(path = %candidate.display(), "checking explicit executable path");
            if is_executable_file(&candidate) {
                return Ok(candidate);
            }
            return Err(LocateError::InvalidExplicitPath(candidate));
        }

        for (source, value) in [
            (ENV_LLAMAFILE, &self.llamafile_var),
            (ENV_LLAMAFILE_PATH, &self.llamafile_path_var),
        ] {
            let Some(value) = value else {
                debug!(source, "environment variable not set");
                continue;
            };
            let candidate = self.absolute(Path::new(value));
            if is_executable_file(&candidate) {
                debug!(source, path = %candidate.display(), "using executable from environment");
                return Ok(candidate);
            }
            warn!(
                source,
                path = %candidate.display(),
                "environment variable set but path is not an executable file"
            );
        }

        let in_cwd = self.cwd.join(EXECUTABLE_NAME);
        if is_executable_file(&in_cwd) {
            debug!(path = %in_cwd.display(), "using executable from current directory");
            return Ok(in_cwd);
        }

        if let Some(search_path) = &self.search_path
            && let Ok(found) = which::which_in(EXECUTABLE_NAME, Some(search_path), &self.cwd)
        {
            let candidate = self.absolute(&found);
            if is_executable_file(&candidate) {
                debug!(path = %candidate.display(), "using executable from PATH");
                return Ok(candidate);
            }
        }

        Err(LocateError::NotFound)
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }
}

/// True for an existing regular file with at least one execute bit set.
pub fn is_executable_file(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

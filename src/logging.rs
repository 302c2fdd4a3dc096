use std::env;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};

const QUIET_FILTER: &str = "warn";
const DEBUG_FILTER: &str = "warn,sumarai=debug";
const DEFAULT_LOG_FILE: &str = "logs/sumarai.log";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

type InitResult = Result<(), Box<dyn std::error::Error + Send + Sync + 'static>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Pretty,
    Json,
}

/// Where log lines go. Anything other than `file` or `both` means stderr.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LogOutput {
    Stderr,
    File,
    Both,
}

impl LogOutput {
    fn name(self) -> &'static str {
        match self {
            Self::Stderr => "stderr",
            Self::File => "file",
            Self::Both => "both",
        }
    }
}

/// Logging setup resolved from `LOG_FORMAT`, `LOG_OUTPUT`, `LOG_FILE_PATH`,
/// `RUST_LOG` and the `--debug` flag.
#[derive(Clone, Debug, PartialEq, Eq)]
struct LogSettings {
    format: LogFormat,
    output: LogOutput,
    file_path: PathBuf,
    directives: String,
}

impl LogSettings {
    fn from_env(debug: bool) -> Self {
        Self::from_lookup(debug, |key| env::var(key).ok())
    }

    fn from_lookup<F>(debug: bool, get_var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let normalized = |key: &str| {
            get_var(key)
                .map(|value| value.trim().to_ascii_lowercase())
                .filter(|value| !value.is_empty())
        };

        let format = match normalized("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
        let output = match normalized("LOG_OUTPUT").as_deref() {
            Some("file") => LogOutput::File,
            Some("both") => LogOutput::Both,
            _ => LogOutput::Stderr,
        };
        let file_path = get_var("LOG_FILE_PATH")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map_or_else(|| PathBuf::from(DEFAULT_LOG_FILE), PathBuf::from);

        // RUST_LOG wins over --debug.
        let directives = get_var("RUST_LOG")
            .filter(|value| EnvFilter::try_new(value).is_ok() && !value.trim().is_empty())
            .unwrap_or_else(|| String::from(if debug { DEBUG_FILTER } else { QUIET_FILTER }));

        Self {
            format,
            output,
            file_path,
            directives,
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.directives).unwrap_or_else(|_| EnvFilter::new(QUIET_FILTER))
    }

    fn install(&self) -> InitResult {
        if self.output == LogOutput::Stderr {
            return self.install_with(BoxMakeWriter::new(std::io::stderr));
        }

        match open_rolling_file(&self.file_path) {
            Ok((file_writer, guard)) => {
                let writer = if self.output == LogOutput::Both {
                    BoxMakeWriter::new(std::io::stderr.and(file_writer))
                } else {
                    BoxMakeWriter::new(file_writer)
                };
                self.install_with(writer)?;
                let _ = FILE_GUARD.set(guard);
                Ok(())
            }
            Err(err) => {
                let fallback = if self.output == LogOutput::Both {
                    "using stderr only"
                } else {
                    "using stderr instead"
                };
                eprintln!(
                    "sumarai: failed to initialize LOG_OUTPUT={} at '{}': {err}; {fallback}",
                    self.output.name(),
                    self.file_path.display(),
                );
                self.install_with(BoxMakeWriter::new(std::io::stderr))
            }
        }
    }

    fn install_with(&self, writer: BoxMakeWriter) -> InitResult {
        let builder = tracing_subscriber::fmt()
            .with_env_filter(self.filter())
            .with_writer(writer);
        match self.format {
            LogFormat::Pretty => builder.try_init(),
            LogFormat::Json => builder.json().try_init(),
        }
    }
}

fn open_rolling_file(path: &Path) -> std::io::Result<(NonBlocking, WorkerGuard)> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| OsStr::new("sumarai.log"));

    fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::daily(dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

/// Installs the global subscriber. A second call is a no-op.
pub fn init(debug: bool) {
    let _ = LogSettings::from_env(debug).install();
}

use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MODEL: &str = "local-model";
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant. Respond to the user's queries concisely and accurately.";
const DEFAULT_MODEL_TIMEOUT_SECS: u64 = 300;
const DEFAULT_READY_TIMEOUT_SECS: u64 = 60;
const DEFAULT_READY_INTERVAL_MS: u64 = 1000;
const DEFAULT_STOP_GRACE_SECS: u64 = 10;
const DEFAULT_STATE_DIR_NAME: &str = ".llamafile";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_READY_INTERVAL_MS),
            timeout: Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub model: String,
    pub system_prompt: String,
    pub api_key: Option<String>,
    pub model_timeout_secs: u64,
    pub readiness: ReadinessPolicy,
    pub stop_grace: Duration,
    pub state_dir: PathBuf,
    pub debug: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_env_with(|key| env::var(key).ok())
    }

    pub(crate) fn from_env_with(mut get_var: impl FnMut(&str) -> Option<String>) -> Self {
        let readiness = ReadinessPolicy {
            interval: Duration::from_millis(parse_positive_u64(
                get_var("READY_INTERVAL_MS").as_deref(),
                DEFAULT_READY_INTERVAL_MS,
            )),
            timeout: Duration::from_secs(parse_positive_u64(
                get_var("READY_TIMEOUT_SECS").as_deref(),
                DEFAULT_READY_TIMEOUT_SECS,
            )),
        };
        let state_dir = parse_state_dir(
            get_var("LLAMAFILE_STATE_DIR").as_deref(),
            get_var("HOME").map(PathBuf::from).or_else(dirs::home_dir),
        );

        Self {
            host: get_var("LLAMAFILE_HOST")
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_port(get_var("LLAMAFILE_PORT").as_deref()),
            model: get_var("MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            system_prompt: get_var("SYSTEM_PROMPT")
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            api_key: get_var("LLAMAFILE_API_KEY")
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            model_timeout_secs: parse_positive_u64(
                get_var("MODEL_TIMEOUT_SECS").as_deref(),
                DEFAULT_MODEL_TIMEOUT_SECS,
            ),
            readiness,
            stop_grace: Duration::from_secs(parse_positive_u64(
                get_var("STOP_GRACE_SECS").as_deref(),
                DEFAULT_STOP_GRACE_SECS,
            )),
            state_dir,
            debug: parse_bool(get_var("SUMARAI_DEBUG").as_deref(), false),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_positive_u64(raw: Option<&str>, default: u64) -> u64 {
    raw.and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn parse_port(raw: Option<&str>) -> u16 {
    raw.and_then(|value| value.trim().parse::<u16>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_PORT)
}

fn parse_bool(raw: Option<&str>, default: bool) -> bool {
    match raw.map(str::trim).map(str::to_ascii_lowercase).as_deref() {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

fn parse_state_dir(raw: Option<&str>, home: Option<PathBuf>) -> PathBuf {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            home.unwrap_or_else(|| PathBuf::from("."))
                .join(DEFAULT_STATE_DIR_NAME)
        })
}

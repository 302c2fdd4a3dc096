use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "sumarai", version, about = "Llamafile API client")]
pub struct Cli {
    /// Enable debug output
    #[arg(long)]
    pub debug: bool,

    /// System prompt for the shell, or instruction prepended to each file
    #[arg(short, long)]
    pub prompt: Option<String>,

    /// Path to the llamafile executable
    #[arg(short, long, value_name = "LLAMAFILE_PATH")]
    pub llamafile: Option<PathBuf>,

    /// Run llamafile as a service
    #[arg(long, group = "action")]
    pub service: bool,

    /// Stop the running llamafile service
    #[arg(long, group = "action")]
    pub stop: bool,

    /// Check if the llamafile service is running
    #[arg(long, group = "action")]
    pub status: bool,

    /// Files to summarize; none starts the interactive shell
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Service,
    Stop,
    Status,
    Chat,
}

impl Cli {
    pub fn action(&self) -> Action {
        if self.stop {
            Action::Stop
        } else if self.status {
            Action::Status
        } else if self.service {
            Action::Service
        } else {
            Action::Chat
        }
    }
}

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::model::Message;
use crate::model_gateway::ChatGateway;
use crate::transport::clean::clean_content;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummaryReport {
    pub summarized: usize,
    pub failed: usize,
}

pub(crate) fn summary_request(prompt: &str, contents: &str) -> Vec<Message> {
    vec![Message::user(format!("{prompt}\n\n{contents}"))]
}

/// Summarizes each file with one non-streamed request. A file that cannot be
/// read or summarized is reported on `output` and skipped.
pub async fn summarize_files<G, W>(
    gateway: &G,
    prompt: &str,
    files: &[PathBuf],
    output: &mut W,
) -> Result<SummaryReport>
where
    G: ChatGateway + ?Sized,
    W: Write,
{
    let mut report = SummaryReport::default();

    for path in files {
        match summarize_file(gateway, prompt, path).await {
            Ok(summary) => {
                writeln!(output, "{summary}").context("Failed to write summary")?;
                report.summarized += 1;
            }
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{err:#}"), "summarization failed");
                writeln!(output, "Error: {err:#}").context("Failed to write error")?;
                report.failed += 1;
            }
        }
    }

    info!(
        summarized = report.summarized,
        failed = report.failed,
        "file summarization finished"
    );
    Ok(report)
}

async fn summarize_file<G>(gateway: &G, prompt: &str, path: &Path) -> Result<String>
where
    G: ChatGateway + ?Sized,
{
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let messages = summary_request(prompt, &contents);
    let content = gateway
        .complete_chat(&messages)
        .await
        .with_context(|| format!("failed to summarize {}", path.display()))?;
    Ok(clean_content(&content))
}

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use openai_dive::v1::resources::chat::ChatCompletionParameters;
use serde::Serialize;
use tracing::{info, warn};

use crate::provider::LlmError;

const DEFAULT_FOLDER: &str = ".roundtable/llm/errors/";

/// One failed request, as written to disk
#[derive(Debug, Serialize)]
struct FailedRequest<'a> {
    timestamp: DateTime<Utc>,
    provider: &'a str,
    model: &'a str,
    error: String,
    request: &'a ChatCompletionParameters,
}

/// Dump a failed LLM request to a JSON file.
///
/// Off unless `ROUNDTABLE_LLM_LOGGING_ENABLED=true`; files go to
/// `ROUNDTABLE_LLM_LOGGING_FOLDER` (default `.roundtable/llm/errors/`).
pub fn log_llm_error(request: &ChatCompletionParameters, error: &LlmError, provider_name: &str) {
    let enabled = std::env::var("ROUNDTABLE_LLM_LOGGING_ENABLED")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if !enabled {
        return;
    }

    let folder = std::env::var("ROUNDTABLE_LLM_LOGGING_FOLDER")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_FOLDER));

    let entry = FailedRequest {
        timestamp: Utc::now(),
        provider: provider_name,
        model: &request.model,
        error: error.to_string(),
        request,
    };
    match write_entry(&folder, &entry) {
        Ok(path) => info!("[{}] Failed LLM request logged to {}", provider_name, path.display()),
        Err(e) => warn!("[{}] Could not log failed LLM request: {}", provider_name, e),
    }
}

fn write_entry(folder: &Path, entry: &FailedRequest<'_>) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(folder)?;
    let path = folder.join(format!(
        "{}_{}.json",
        entry.provider,
        entry.timestamp.format("%Y%m%d_%H%M%S_%3f")
    ));
    let body = serde_json::to_vec_pretty(entry).map_err(std::io::Error::other)?;
    std::fs::write(&path, body)?;
    Ok(path)
}

//! Detecting a finished answer and extracting it
//!
//! Text mode takes the first rendered markdown container. JSON mode needs
//! both a JSON code block and the `finished` key the prompt suffix asks for;
//! the key is the last thing the model emits, so its presence means the
//! block is no longer streaming.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info};

use crate::browser::{BrowserResult, PageDriver, Selector};
use crate::config::TimeoutConfig;
use crate::error::{AskError, AskResult};
use crate::wait::poll_until;

const TEXT_ANSWER: &str = "div.markdown";
const JSON_BLOCK: &str = "code.language-json";
const JSON_BLOCK_CONTENT: &str = "div.contain-inline-size code.language-json";
const FINISHED_TOKEN: &str = "finished";

/// The token renders either highlighted or as bold markdown
fn finished_marker() -> Selector {
    Selector::any([
        Selector::has_text("span.hljs-attr", FINISHED_TOKEN),
        Selector::has_text("strong[data-start][data-end]", FINISHED_TOKEN),
    ])
}

/// State of the response area at one instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionMarker {
    Pending,
    TextComplete(String),
    JsonComplete(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    Text(String),
    Json(Value),
}

#[derive(Debug, Clone)]
pub struct ResponseReader {
    timeout: Duration,
}

impl ResponseReader {
    pub fn new(timeouts: &TimeoutConfig) -> Self {
        Self {
            timeout: timeouts.response(),
        }
    }

    /// Inspect the page once
    pub async fn observe(
        &self,
        page: &dyn PageDriver,
        expect_json: bool,
    ) -> BrowserResult<CompletionMarker> {
        if !expect_json {
            return Ok(match page.text_content(&Selector::css(TEXT_ANSWER)).await? {
                Some(text) => CompletionMarker::TextComplete(text),
                None => CompletionMarker::Pending,
            });
        }

        if !page.exists(&Selector::css(JSON_BLOCK)).await? {
            return Ok(CompletionMarker::Pending);
        }
        if !page.exists(&finished_marker()).await? {
            debug!("JSON block present, waiting for the finished key");
            return Ok(CompletionMarker::Pending);
        }
        Ok(
            match page.text_content(&Selector::css(JSON_BLOCK_CONTENT)).await? {
                Some(raw) => CompletionMarker::JsonComplete(raw),
                None => CompletionMarker::Pending,
            },
        )
    }

    /// Wait for a complete answer and extract it
    pub async fn read(&self, page: &dyn PageDriver, expect_json: bool) -> AskResult<Answer> {
        let what = if expect_json { "JSON answer" } else { "answer" };
        info!("Waiting for {} (up to {}s)", what, self.timeout.as_secs());

        let marker = poll_until(self.timeout, move || async move {
            Ok::<_, AskError>(match self.observe(page, expect_json).await? {
                CompletionMarker::Pending => None,
                complete => Some(complete),
            })
        })
        .await?;

        match marker {
            Some(CompletionMarker::TextComplete(text)) => {
                debug!("Received text answer ({} chars)", text.chars().count());
                Ok(Answer::Text(text))
            }
            Some(CompletionMarker::JsonComplete(raw)) => {
                debug!("Received JSON text: {}", raw);
                serde_json::from_str(&raw).map(Answer::Json).map_err(|source| {
                    error!("Answer block is not valid JSON: {}", source);
                    AskError::ResponseFormat { source, raw }
                })
            }
            Some(CompletionMarker::Pending) | None => Err(AskError::ResponseTimeout {
                what,
                timeout: self.timeout,
            }),
        }
    }
}

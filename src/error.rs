//! Errors surfaced by a single ask

use std::time::Duration;
use thiserror::Error;

use crate::browser::BrowserError;
use crate::login::LoginError;
use crate::session_store::StorageError;

#[derive(Error, Debug)]
pub enum AskError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Login failed: {0}")]
    Login(#[from] LoginError),

    #[error("Submit button was not enabled after {attempts} checks")]
    SubmitTimeout { attempts: u32 },

    #[error("No {what} appeared within {}ms", .timeout.as_millis())]
    ResponseTimeout {
        what: &'static str,
        timeout: Duration,
    },

    #[error("Response is not valid JSON: {source}")]
    ResponseFormat {
        source: serde_json::Error,
        raw: String,
    },

    #[error(transparent)]
    Browser(#[from] BrowserError),
}

pub type AskResult<T> = Result<T, AskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failed_stage() {
        assert_eq!(
            AskError::SubmitTimeout { attempts: 30 }.to_string(),
            "Submit button was not enabled after 30 checks"
        );
        assert_eq!(
            AskError::ResponseTimeout {
                what: "JSON answer",
                timeout: Duration::from_secs(1200),
            }
            .to_string(),
            "No JSON answer appeared within 1200000ms"
        );
    }
}

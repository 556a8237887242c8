//! Browser automation for a chat web application
//!
//! Submits a prompt (optionally with a file) through the application's UI
//! and returns the answer as text or parsed JSON. The authenticated browser
//! profile is kept on disk and reused across runs; each run works on a
//! private copy and logs in again only when the stored session has expired.

pub mod browser;
pub mod browser_setup;
pub mod config;
pub mod error;
pub mod login;
pub mod orchestrator;
pub mod response;
pub mod session_store;
pub mod submit;
pub mod wait;

#[cfg(test)]
pub(crate) mod testing;

pub use browser::{
    BrowserError, BrowserLauncher, ChromiumLauncher, ContextDriver, LoadState, PageDriver,
    Selector,
};
pub use config::{BrowserConfig, Config, ConfigError, TimeoutConfig};
pub use error::{AskError, AskResult};
pub use login::{IdentifyStrategy, LoginError, LoginFlow, LoginOutcome, LoginStep};
pub use orchestrator::{RunContext, SessionOrchestrator, ask_once};
pub use response::{Answer, CompletionMarker, ResponseReader};
pub use session_store::{CommitOutcome, SessionLock, SessionStore, StorageError, Workspace};
pub use submit::{JSON_PROMPT_SUFFIX, PromptSubmitter, augment_prompt};
pub use wait::WaitPolicy;

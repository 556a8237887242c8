//! Browser capability consumed by the session state machine
//!
//! The login flow, prompt submitter and response reader only talk to the
//! traits in this module. `chromium` provides the production implementation
//! on top of chromiumoxide; tests plug in a scripted fake DOM.

mod chromium;
mod selector;

pub use chromium::{ChromiumContext, ChromiumLauncher, ChromiumPage};
pub use selector::Selector;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::wait::poll_until;

#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("Failed to find browser executable: {0}")]
    NotFound(String),

    #[error("Failed to launch browser: {0}")]
    LaunchFailed(String),

    #[error("Failed to create page: {0}")]
    PageCreationFailed(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Timed out after {}ms waiting for {what}", .timeout.as_millis())]
    Timeout { what: String, timeout: Duration },

    #[error("No element matches {0}")]
    ElementNotFound(String),

    #[error("Action '{action}' failed on {selector}: {reason}")]
    ActionFailed {
        action: &'static str,
        selector: String,
        reason: String,
    },

    #[error("Script evaluation failed: {0}")]
    Script(String),

    #[error("Failed to close browser: {0}")]
    CloseFailed(String),
}

impl BrowserError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BrowserError::Timeout { .. })
    }
}

pub type BrowserResult<T> = Result<T, BrowserError>;

/// Document readiness levels, mirroring `document.readyState`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    DomContentLoaded,
    Load,
}

impl LoadState {
    /// Whether a `document.readyState` value satisfies this level
    pub fn satisfied_by(self, ready_state: &str) -> bool {
        match self {
            LoadState::DomContentLoaded => matches!(ready_state, "interactive" | "complete"),
            LoadState::Load => ready_state == "complete",
        }
    }
}

/// One tab of the automated browser
///
/// Queries (`exists`, `is_visible`, `is_enabled`, `text_content`) inspect the
/// live DOM once and never cache. Actions (`click`, `fill`, `set_input_files`)
/// wait up to `timeout` for their target before acting.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Identifier of the underlying tab, stable for its lifetime
    fn id(&self) -> String;

    async fn goto(&self, url: &str) -> BrowserResult<()>;

    async fn exists(&self, selector: &Selector) -> BrowserResult<bool>;

    async fn is_visible(&self, selector: &Selector) -> BrowserResult<bool>;

    /// Fails with `ElementNotFound` when nothing matches
    async fn is_enabled(&self, selector: &Selector) -> BrowserResult<bool>;

    /// `Ok(None)` when nothing matches
    async fn text_content(&self, selector: &Selector) -> BrowserResult<Option<String>>;

    async fn ready_state(&self) -> BrowserResult<String>;

    async fn click(&self, selector: &Selector, timeout: Duration) -> BrowserResult<()>;

    async fn fill(&self, selector: &Selector, value: &str, timeout: Duration) -> BrowserResult<()>;

    async fn set_input_files(
        &self,
        selector: &Selector,
        path: &Path,
        timeout: Duration,
    ) -> BrowserResult<()>;

    async fn wait_for_selector(&self, selector: &Selector, timeout: Duration) -> BrowserResult<()> {
        let found = poll_until(timeout, move || async move {
            Ok::<_, BrowserError>(self.exists(selector).await?.then_some(()))
        })
        .await?;
        found.ok_or_else(|| BrowserError::Timeout {
            what: selector.to_string(),
            timeout,
        })
    }

    async fn wait_for_visible(&self, selector: &Selector, timeout: Duration) -> BrowserResult<()> {
        let found = poll_until(timeout, move || async move {
            Ok::<_, BrowserError>(self.is_visible(selector).await?.then_some(()))
        })
        .await?;
        found.ok_or_else(|| BrowserError::Timeout {
            what: format!("{selector} to become visible"),
            timeout,
        })
    }

    async fn wait_for_load_state(&self, state: LoadState, timeout: Duration) -> BrowserResult<()> {
        let reached = poll_until(timeout, move || async move {
            let ready_state = self.ready_state().await?;
            Ok::<_, BrowserError>(state.satisfied_by(&ready_state).then_some(()))
        })
        .await?;
        reached.ok_or_else(|| BrowserError::Timeout {
            what: format!("load state {state:?}"),
            timeout,
        })
    }
}

/// A persistent browser context rooted at one profile directory
#[async_trait]
pub trait ContextDriver: Send + Sync {
    async fn new_page(&self) -> BrowserResult<Arc<dyn PageDriver>>;

    /// Every open page, in no particular order
    async fn pages(&self) -> BrowserResult<Vec<Arc<dyn PageDriver>>>;

    /// Closes the browser and waits for it to release the profile.
    /// Calling it again is a no-op.
    async fn close(&mut self) -> BrowserResult<()>;
}

/// Opens browser contexts over a profile directory
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, user_data_dir: &Path) -> BrowserResult<Box<dyn ContextDriver>>;
}

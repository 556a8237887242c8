//! One end-to-end ask over an isolated copy of the session
//!
//! Order per run: session lock, working copy, browser, navigate, login,
//! submit, read, close browser. Commit and release run afterwards on every
//! path; their failures are logged and never replace the run's own result.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::browser::{BrowserLauncher, ChromiumLauncher, ContextDriver};
use crate::config::{Config, TimeoutConfig};
use crate::error::AskResult;
use crate::login::LoginFlow;
use crate::response::{Answer, ResponseReader};
use crate::session_store::{SessionStore, Workspace};
use crate::submit::PromptSubmitter;

const PROMPT_PREVIEW_CHARS: usize = 60;

/// Everything one ask needs, fixed for its duration
#[derive(Clone)]
pub struct RunContext {
    pub target_url: String,
    pub account: String,
    pub credential: String,
    pub prompt: String,
    pub file: Option<PathBuf>,
    pub expect_json: bool,
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("target_url", &self.target_url)
            .field("account", &self.account)
            .field("credential", &"<redacted>")
            .field("prompt", &preview(&self.prompt))
            .field("file", &self.file)
            .field("expect_json", &self.expect_json)
            .finish()
    }
}

fn preview(prompt: &str) -> String {
    if prompt.chars().count() > PROMPT_PREVIEW_CHARS {
        let head: String = prompt.chars().take(PROMPT_PREVIEW_CHARS).collect();
        format!("{head}...")
    } else {
        prompt.to_string()
    }
}

pub struct SessionOrchestrator {
    store: SessionStore,
    launcher: Arc<dyn BrowserLauncher>,
    timeouts: TimeoutConfig,
    login: LoginFlow,
    submitter: PromptSubmitter,
    reader: ResponseReader,
}

impl SessionOrchestrator {
    pub fn new(
        store: SessionStore,
        launcher: Arc<dyn BrowserLauncher>,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            login: LoginFlow::new(&timeouts),
            submitter: PromptSubmitter::new(&timeouts),
            reader: ResponseReader::new(&timeouts),
            store,
            launcher,
            timeouts,
        }
    }

    /// Chromium-backed orchestrator for the configured session directory
    pub fn from_config(config: &Config) -> Self {
        let mut store = SessionStore::new(&config.session_dir);
        if let Some(root) = &config.workspace_root {
            store = store.with_workspace_root(root);
        }
        Self::new(
            store,
            Arc::new(ChromiumLauncher::new(config.browser.clone())),
            config.timeouts.clone(),
        )
    }

    pub async fn ask(&self, run: &RunContext) -> AskResult<Answer> {
        let run_id = uuid::Uuid::new_v4();
        let span = info_span!("ask", %run_id, expect_json = run.expect_json);
        self.ask_in_span(run).instrument(span).await
    }

    async fn ask_in_span(&self, run: &RunContext) -> AskResult<Answer> {
        info!(
            "Starting ask: prompt={}, file={:?}",
            preview(&run.prompt),
            run.file
        );

        let lock = self.store.lock(self.timeouts.lock_wait()).await?;
        let workspace = self.store.acquire_working_copy().await?;

        let result = self.drive(&workspace, run).await;
        if let Err(e) = &result {
            error!("Ask failed: {}", e);
        }

        match self.store.commit(&workspace).await {
            Ok(outcome) => debug!("Profile commit: {:?}", outcome),
            Err(e) => warn!("Failed to save profile after ask: {}", e),
        }
        self.store.release(workspace).await;
        drop(lock);

        result
    }

    /// Browser lifetime: launched over the workspace, always closed before commit
    async fn drive(&self, workspace: &Workspace, run: &RunContext) -> AskResult<Answer> {
        let mut context = self.launcher.launch(workspace.profile_dir()).await?;
        let result = self.converse(context.as_ref(), run).await;
        if let Err(e) = context.close().await {
            warn!("Failed to close browser: {}", e);
        }
        result
    }

    async fn converse(&self, context: &dyn ContextDriver, run: &RunContext) -> AskResult<Answer> {
        let page = context.new_page().await?;
        debug!("Navigating to {}", run.target_url);
        page.goto(&run.target_url).await?;

        let outcome = self.login.run(page.clone(), context, run).await?;
        debug!("Login outcome: {:?}", outcome);

        self.submitter
            .submit(
                page.as_ref(),
                &run.prompt,
                run.file.as_deref(),
                run.expect_json,
            )
            .await?;
        self.reader.read(page.as_ref(), run.expect_json).await
    }
}

/// Build a Chromium orchestrator from `config` and run a single ask
pub async fn ask_once(
    config: &Config,
    prompt: impl Into<String>,
    file: Option<PathBuf>,
    expect_json: bool,
) -> AskResult<Answer> {
    let run = config.run_context(prompt, file, expect_json);
    SessionOrchestrator::from_config(config).ask(&run).await
}

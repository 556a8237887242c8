//! Federated login, run only when the stored session has expired
//!
//! One pass, no retries: look for the login button, then click through
//! provider selection, identify the account, enter the credential and go
//! back to the target page. Each step maps its failure to a `LoginStep`.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::browser::{BrowserError, ContextDriver, LoadState, PageDriver, Selector};
use crate::config::TimeoutConfig;
use crate::orchestrator::RunContext;
use crate::wait::WaitPolicy;

const LOGIN_BUTTON: &str = r#"button[data-testid="login-button"]"#;
const PROVIDER_BUTTON: &str = r#"button[value="google"]"#;
const EMAIL_INPUT: &str = r#"input[type="email"]"#;
const PASSWORD_INPUT: &str = r#"input[type="password"]"#;

fn next_button() -> Selector {
    Selector::has_text("button", "Next")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStep {
    Detect,
    InitiateLogin,
    ChooseProvider,
    IdentifySelf,
    Authenticate,
    Return,
}

impl fmt::Display for LoginStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            LoginStep::Detect => "checking for the login button",
            LoginStep::InitiateLogin => "opening the login page",
            LoginStep::ChooseProvider => "choosing the identity provider",
            LoginStep::IdentifySelf => "selecting the account",
            LoginStep::Authenticate => "entering the password",
            LoginStep::Return => "returning to the project page",
        };
        f.write_str(step)
    }
}

#[derive(Error, Debug)]
#[error("{step} failed: {source}")]
pub struct LoginError {
    pub step: LoginStep,
    pub source: BrowserError,
}

impl LoginError {
    fn at(step: LoginStep) -> impl FnOnce(BrowserError) -> LoginError {
        move |source| {
            error!("Login step '{}' failed: {}", step, source);
            LoginError { step, source }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    /// The stored session was still valid; nothing was clicked
    Authenticated,
    LoggedIn,
}

/// Ways the provider may ask who is signing in, tried in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifyStrategy {
    /// Account chooser listing the configured account
    RememberedAccount,
    /// Blank email form
    EmailForm,
}

impl IdentifyStrategy {
    async fn attempt(
        self,
        flow: &LoginFlow,
        page: &dyn PageDriver,
        account: &str,
    ) -> Result<(), BrowserError> {
        match self {
            IdentifyStrategy::RememberedAccount => {
                page.click(&Selector::text_is(account), flow.remembered_account_timeout)
                    .await
            }
            IdentifyStrategy::EmailForm => {
                page.fill(&Selector::css(EMAIL_INPUT), account, flow.action_timeout)
                    .await?;
                page.click(&next_button(), flow.action_timeout).await?;
                flow.after_email.settle(page).await;
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoginFlow {
    detect_timeout: Duration,
    action_timeout: Duration,
    provider_ready_timeout: Duration,
    remembered_account_timeout: Duration,
    after_login_click: WaitPolicy,
    after_provider_click: WaitPolicy,
    after_email: WaitPolicy,
    after_password: WaitPolicy,
    strategies: Vec<IdentifyStrategy>,
}

impl LoginFlow {
    pub fn new(timeouts: &TimeoutConfig) -> Self {
        Self {
            detect_timeout: timeouts.login_check(),
            action_timeout: timeouts.action(),
            provider_ready_timeout: timeouts.provider_ready(),
            remembered_account_timeout: timeouts.remembered_account(),
            after_login_click: WaitPolicy::fixed("login page", timeouts.login_settle())
                .until(Selector::css(PROVIDER_BUTTON)),
            after_provider_click: WaitPolicy::fixed("provider redirect", timeouts.provider_settle()),
            after_email: WaitPolicy::fixed("password form", timeouts.email_settle())
                .until(Selector::css(PASSWORD_INPUT)),
            // The redirect back has no reliable DOM signal on the provider page
            after_password: WaitPolicy::fixed("redirect back", timeouts.password_settle()),
            strategies: vec![
                IdentifyStrategy::RememberedAccount,
                IdentifyStrategy::EmailForm,
            ],
        }
    }

    pub fn with_strategies(mut self, strategies: Vec<IdentifyStrategy>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Log in if the page shows a login button
    ///
    /// `page` is the tab showing the target URL. If the provider opens its
    /// own tab, the identify and authenticate steps run there.
    pub async fn run(
        &self,
        page: Arc<dyn PageDriver>,
        context: &dyn ContextDriver,
        run: &RunContext,
    ) -> Result<LoginOutcome, LoginError> {
        info!("Checking if login is needed for {}", run.target_url);
        let login_button = Selector::css(LOGIN_BUTTON);

        match page.wait_for_selector(&login_button, self.detect_timeout).await {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {
                debug!("Already logged in (no login button)");
                return Ok(LoginOutcome::Authenticated);
            }
            Err(e) => return Err(LoginError::at(LoginStep::Detect)(e)),
        }

        info!("Session expired, starting login");
        page.click(&login_button, self.action_timeout)
            .await
            .map_err(LoginError::at(LoginStep::InitiateLogin))?;
        page.wait_for_load_state(LoadState::DomContentLoaded, self.action_timeout)
            .await
            .map_err(LoginError::at(LoginStep::InitiateLogin))?;
        self.after_login_click.settle(page.as_ref()).await;

        let known_pages = page_ids(context).await;
        page.click(&Selector::css(PROVIDER_BUTTON), self.action_timeout)
            .await
            .map_err(LoginError::at(LoginStep::ChooseProvider))?;
        self.after_provider_click.settle(page.as_ref()).await;

        let provider_page = provider_page(page.clone(), context, known_pages).await;
        if let Err(e) = provider_page
            .wait_for_load_state(LoadState::DomContentLoaded, self.provider_ready_timeout)
            .await
        {
            warn!("Provider login page not ready in time: {}", e);
        }

        self.identify(provider_page.as_ref(), &run.account).await?;

        provider_page
            .fill(&Selector::css(PASSWORD_INPUT), &run.credential, self.action_timeout)
            .await
            .map_err(LoginError::at(LoginStep::Authenticate))?;
        provider_page
            .click(&next_button(), self.action_timeout)
            .await
            .map_err(LoginError::at(LoginStep::Authenticate))?;
        self.after_password.settle(provider_page.as_ref()).await;

        page.goto(&run.target_url)
            .await
            .map_err(LoginError::at(LoginStep::Return))?;

        info!("Login successful");
        Ok(LoginOutcome::LoggedIn)
    }

    async fn identify(&self, page: &dyn PageDriver, account: &str) -> Result<(), LoginError> {
        let mut last_error = None;
        for strategy in &self.strategies {
            match strategy.attempt(self, page, account).await {
                Ok(()) => {
                    debug!("Account identified via {:?}", strategy);
                    return Ok(());
                }
                Err(e) => {
                    debug!("{:?} did not apply: {}", strategy, e);
                    last_error = Some(e);
                }
            }
        }
        let source = last_error
            .unwrap_or_else(|| BrowserError::ElementNotFound("no identify strategy".into()));
        Err(LoginError::at(LoginStep::IdentifySelf)(source))
    }
}

async fn page_ids(context: &dyn ContextDriver) -> Option<HashSet<String>> {
    match context.pages().await {
        Ok(pages) => Some(pages.iter().map(|p| p.id()).collect()),
        Err(e) => {
            warn!("Could not list pages: {}", e);
            None
        }
    }
}

/// A page opened by the provider click, or `page` if the provider stayed in it
///
/// Page listings are unordered and include tabs that predate the click (such
/// as Chrome's startup tab), so only ids missing from `known` count as new.
async fn provider_page(
    page: Arc<dyn PageDriver>,
    context: &dyn ContextDriver,
    known: Option<HashSet<String>>,
) -> Arc<dyn PageDriver> {
    let Some(known) = known else {
        return page;
    };
    match context.pages().await {
        Ok(pages) => match pages.into_iter().find(|p| !known.contains(&p.id())) {
            Some(popup) => {
                debug!("Provider opened a new page, switching to it");
                popup
            }
            None => page,
        },
        Err(e) => {
            warn!("Could not list pages, staying on the current one: {}", e);
            page
        }
    }
}

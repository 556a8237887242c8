//! Scripted fake browser for unit tests
//!
//! `FakePage` holds a list of elements keyed by the exact `Selector` the code
//! under test asks for. Elements can appear after a delay (measured on tokio's
//! clock, so paused-time tests run instantly) and report disabled for a
//! number of checks before enabling. Every action is recorded in order.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::browser::{
    BrowserError, BrowserLauncher, BrowserResult, ContextDriver, PageDriver, Selector,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Goto(String),
    Click(String),
    Fill { selector: String, value: String },
    SetInputFiles { selector: String, path: PathBuf },
}

#[derive(Debug, Clone, Copy)]
enum Enablement {
    Always,
    AfterChecks(u32),
    Never,
}

#[derive(Debug)]
struct FakeElement {
    selector: Selector,
    appears_at: Instant,
    text: String,
    visible: bool,
    enablement: Enablement,
    checks: u32,
}

#[derive(Debug, Default)]
struct DomState {
    elements: Vec<FakeElement>,
    actions: Vec<Action>,
    enabled_checks: u32,
    broken: Option<String>,
}

impl DomState {
    fn find(&mut self, selector: &Selector) -> Option<&mut FakeElement> {
        let now = Instant::now();
        let leaves = selector.alternatives();
        self.elements
            .iter_mut()
            .find(|el| el.appears_at <= now && leaves.iter().any(|leaf| **leaf == el.selector))
    }

    fn check(&self) -> BrowserResult<()> {
        match &self.broken {
            Some(reason) => Err(BrowserError::Script(reason.clone())),
            None => Ok(()),
        }
    }
}

type SharedPages = Arc<Mutex<Vec<Arc<FakePage>>>>;

static NEXT_PAGE_ID: AtomicU64 = AtomicU64::new(1);

pub struct FakePage {
    id: String,
    state: Mutex<DomState>,
    popups: Mutex<Vec<(Selector, Arc<FakePage>, SharedPages)>>,
}

impl FakePage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: format!("page-{}", NEXT_PAGE_ID.fetch_add(1, Ordering::SeqCst)),
            state: Mutex::default(),
            popups: Mutex::default(),
        })
    }

    fn push(&self, selector: Selector, delay: Duration, text: &str, visible: bool, enablement: Enablement) -> &Self {
        self.state.lock().unwrap().elements.push(FakeElement {
            selector,
            appears_at: Instant::now() + delay,
            text: text.to_string(),
            visible,
            enablement,
            checks: 0,
        });
        self
    }

    pub fn element(&self, selector: Selector) -> &Self {
        self.push(selector, Duration::ZERO, "", true, Enablement::Always)
    }

    pub fn element_with_text(&self, selector: Selector, text: &str) -> &Self {
        self.push(selector, Duration::ZERO, text, true, Enablement::Always)
    }

    pub fn element_after(&self, selector: Selector, delay: Duration, text: &str) -> &Self {
        self.push(selector, delay, text, true, Enablement::Always)
    }

    pub fn hidden_element(&self, selector: Selector) -> &Self {
        self.push(selector, Duration::ZERO, "", false, Enablement::Always)
    }

    /// Reports disabled for the first `checks` enabled-state queries
    pub fn enabled_after(&self, selector: Selector, checks: u32) -> &Self {
        self.push(selector, Duration::ZERO, "", true, Enablement::AfterChecks(checks))
    }

    pub fn never_enabled(&self, selector: Selector) -> &Self {
        self.push(selector, Duration::ZERO, "", true, Enablement::Never)
    }

    /// Every DOM query fails with a script error from now on
    pub fn fail_queries(&self, reason: &str) -> &Self {
        self.state.lock().unwrap().broken = Some(reason.to_string());
        self
    }

    pub fn actions(&self) -> Vec<Action> {
        self.state.lock().unwrap().actions.clone()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter_map(|action| match action {
                Action::Click(selector) => Some(selector),
                _ => None,
            })
            .collect()
    }

    pub fn enabled_checks(&self) -> u32 {
        self.state.lock().unwrap().enabled_checks
    }

    fn record(&self, action: Action) {
        self.state.lock().unwrap().actions.push(action);
    }
}

#[async_trait]
impl PageDriver for FakePage {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn goto(&self, url: &str) -> BrowserResult<()> {
        self.record(Action::Goto(url.to_string()));
        Ok(())
    }

    async fn exists(&self, selector: &Selector) -> BrowserResult<bool> {
        let mut state = self.state.lock().unwrap();
        state.check()?;
        Ok(state.find(selector).is_some())
    }

    async fn is_visible(&self, selector: &Selector) -> BrowserResult<bool> {
        let mut state = self.state.lock().unwrap();
        state.check()?;
        Ok(state.find(selector).is_some_and(|el| el.visible))
    }

    async fn is_enabled(&self, selector: &Selector) -> BrowserResult<bool> {
        let mut state = self.state.lock().unwrap();
        state.check()?;
        state.enabled_checks += 1;
        let el = state
            .find(selector)
            .ok_or_else(|| BrowserError::ElementNotFound(selector.to_string()))?;
        el.checks += 1;
        Ok(match el.enablement {
            Enablement::Always => true,
            Enablement::AfterChecks(n) => el.checks > n,
            Enablement::Never => false,
        })
    }

    async fn text_content(&self, selector: &Selector) -> BrowserResult<Option<String>> {
        let mut state = self.state.lock().unwrap();
        state.check()?;
        Ok(state.find(selector).map(|el| el.text.clone()))
    }

    async fn ready_state(&self) -> BrowserResult<String> {
        self.state.lock().unwrap().check()?;
        Ok("complete".to_string())
    }

    async fn click(&self, selector: &Selector, timeout: Duration) -> BrowserResult<()> {
        self.wait_for_selector(selector, timeout).await?;
        self.record(Action::Click(selector.to_string()));
        for (trigger, popup, pages) in self.popups.lock().unwrap().iter() {
            if trigger == selector {
                // Listings are unordered; put the new page first
                pages.lock().unwrap().insert(0, popup.clone());
            }
        }
        Ok(())
    }

    async fn fill(&self, selector: &Selector, value: &str, timeout: Duration) -> BrowserResult<()> {
        self.wait_for_selector(selector, timeout).await?;
        self.record(Action::Fill {
            selector: selector.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn set_input_files(
        &self,
        selector: &Selector,
        path: &Path,
        timeout: Duration,
    ) -> BrowserResult<()> {
        self.wait_for_selector(selector, timeout).await?;
        self.record(Action::SetInputFiles {
            selector: selector.to_string(),
            path: path.to_path_buf(),
        });
        Ok(())
    }
}

/// Context over a scripted set of pages; `new_page` hands out the first one
pub struct FakeContext {
    pages: SharedPages,
    closed: Arc<AtomicBool>,
}

impl FakeContext {
    pub fn new(pages: Vec<Arc<FakePage>>) -> Self {
        Self {
            pages: Arc::new(Mutex::new(pages)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Clicking `selector` on `opener` adds `popup` to this context
    pub fn open_on_click(&self, opener: &FakePage, selector: Selector, popup: Arc<FakePage>) {
        opener
            .popups
            .lock()
            .unwrap()
            .push((selector, popup, self.pages.clone()));
    }
}

#[async_trait]
impl ContextDriver for FakeContext {
    async fn new_page(&self) -> BrowserResult<Arc<dyn PageDriver>> {
        match self.pages.lock().unwrap().first() {
            Some(page) => Ok(page.clone() as Arc<dyn PageDriver>),
            None => Err(BrowserError::PageCreationFailed("no scripted page".into())),
        }
    }

    async fn pages(&self) -> BrowserResult<Vec<Arc<dyn PageDriver>>> {
        Ok(self
            .pages
            .lock()
            .unwrap()
            .iter()
            .map(|page| page.clone() as Arc<dyn PageDriver>)
            .collect())
    }

    async fn close(&mut self) -> BrowserResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeLauncher {
    pages: Vec<Arc<FakePage>>,
    write_profile: bool,
    fail: bool,
    launched: Mutex<Vec<PathBuf>>,
    closed: Arc<AtomicBool>,
}

impl FakeLauncher {
    pub fn new(pages: Vec<Arc<FakePage>>) -> Self {
        Self {
            pages,
            write_profile: false,
            fail: false,
            launched: Mutex::new(Vec::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Launching drops a cookie file into the profile, like a real login would
    pub fn writing_profile(mut self) -> Self {
        self.write_profile = true;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn launched_dirs(&self) -> Vec<PathBuf> {
        self.launched.lock().unwrap().clone()
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self, user_data_dir: &Path) -> BrowserResult<Box<dyn ContextDriver>> {
        self.launched
            .lock()
            .unwrap()
            .push(user_data_dir.to_path_buf());
        if self.fail {
            return Err(BrowserError::LaunchFailed("scripted launch failure".into()));
        }
        if self.write_profile {
            std::fs::write(user_data_dir.join("Cookies"), "session")
                .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;
        }
        Ok(Box::new(FakeContext {
            pages: Arc::new(Mutex::new(self.pages.clone())),
            closed: self.closed.clone(),
        }))
    }
}

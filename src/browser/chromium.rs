//! chromiumoxide implementation of the browser capability

use async_trait::async_trait;
use chromiumoxide::Page;
use chromiumoxide::browser::Browser;
use chromiumoxide::element::Element;
use chromiumoxide_cdp::cdp::browser_protocol::dom::SetFileInputFilesParams;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BrowserError, BrowserLauncher, BrowserResult, ContextDriver, PageDriver, Selector};
use crate::browser_setup::launch_browser;
use crate::config::BrowserConfig;

/// Attribute used to hand a script-resolved element over to CDP
const TARGET_ATTR: &str = "data-chat-automation-target";

/// How long a closed Chrome gets to flush the profile and exit
const BROWSER_EXIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Launches Chrome over a workspace profile
pub struct ChromiumLauncher {
    config: BrowserConfig,
}

impl ChromiumLauncher {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self, user_data_dir: &Path) -> BrowserResult<Box<dyn ContextDriver>> {
        let (browser, handler) = launch_browser(&self.config, user_data_dir)
            .await
            .map_err(|e| BrowserError::LaunchFailed(format!("{e:#}")))?;
        Ok(Box::new(ChromiumContext::new(browser, handler)))
    }
}

/// A running Chrome process and its CDP event handler
///
/// The handler task is aborted on drop. Dropping without `close()` leaves
/// Chrome to be killed by chromiumoxide, which may not flush the profile.
pub struct ChromiumContext {
    browser: Mutex<Option<Browser>>,
    handler: JoinHandle<()>,
}

impl ChromiumContext {
    pub(crate) fn new(browser: Browser, handler: JoinHandle<()>) -> Self {
        Self {
            browser: Mutex::new(Some(browser)),
            handler,
        }
    }
}

#[async_trait]
impl ContextDriver for ChromiumContext {
    async fn new_page(&self) -> BrowserResult<Arc<dyn PageDriver>> {
        let guard = self.browser.lock().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| BrowserError::PageCreationFailed("Browser already closed".into()))?;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::PageCreationFailed(e.to_string()))?;
        Ok(Arc::new(ChromiumPage::new(page)))
    }

    async fn pages(&self) -> BrowserResult<Vec<Arc<dyn PageDriver>>> {
        let guard = self.browser.lock().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| BrowserError::PageCreationFailed("Browser already closed".into()))?;
        let pages = browser
            .pages()
            .await
            .map_err(|e| BrowserError::PageCreationFailed(e.to_string()))?;
        Ok(pages
            .into_iter()
            .map(|page| Arc::new(ChromiumPage::new(page)) as Arc<dyn PageDriver>)
            .collect())
    }

    async fn close(&mut self) -> BrowserResult<()> {
        let Some(mut browser) = self.browser.get_mut().take() else {
            return Ok(());
        };

        info!("Closing browser");
        let closed = browser
            .close()
            .await
            .map(|_| ())
            .map_err(|e| BrowserError::CloseFailed(e.to_string()));

        // Chrome writes the profile on exit; wait for it before anyone copies it
        wait_or_kill(
            &mut browser,
            BROWSER_EXIT_TIMEOUT,
            |b| Box::pin(async move { b.wait().await.map(|_| ()) }),
            |b| Box::pin(b.kill()),
        )
        .await;
        self.handler.abort();
        closed
    }
}

impl Drop for ChromiumContext {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Exited,
    Killed,
}

/// Wait up to `timeout` for `process` to exit, then kill it
async fn wait_or_kill<T>(
    process: &mut T,
    timeout: Duration,
    wait: impl for<'a> FnOnce(&'a mut T) -> BoxFuture<'a, io::Result<()>>,
    kill: impl for<'a> FnOnce(&'a mut T) -> BoxFuture<'a, Option<io::Result<()>>>,
) -> Exit {
    match tokio::time::timeout(timeout, wait(process)).await {
        Ok(Ok(())) => Exit::Exited,
        Ok(Err(e)) => {
            warn!("Failed to wait for browser exit: {}", e);
            Exit::Exited
        }
        Err(_) => {
            warn!(
                "Browser still running {}s after close, killing it",
                timeout.as_secs()
            );
            if let Some(Err(e)) = kill(process).await {
                warn!("Failed to kill browser: {}", e);
            }
            Exit::Killed
        }
    }
}

/// One Chrome tab
#[derive(Clone)]
pub struct ChromiumPage {
    page: Page,
}

impl ChromiumPage {
    pub fn new(page: Page) -> Self {
        Self { page }
    }

    async fn eval<T: DeserializeOwned>(&self, expression: String) -> BrowserResult<T> {
        let result = self
            .page
            .evaluate(expression)
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))?;
        // CDP omits `value` for null/undefined results
        let value = result.value().cloned().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value).map_err(|e| BrowserError::Script(e.to_string()))
    }

    /// Tag the resolved element so CDP can address it by plain CSS
    async fn element(&self, selector: &Selector, action: &'static str) -> BrowserResult<Element> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let script = format!(
            "(() => {{ const el = {}; if (!el) return false; el.setAttribute('{TARGET_ATTR}', '{token}'); return true; }})()",
            selector.resolve_expression()
        );
        if !self.eval::<bool>(script).await? {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }

        self.page
            .find_element(format!("[{TARGET_ATTR}=\"{token}\"]"))
            .await
            .map_err(|e| BrowserError::ActionFailed {
                action,
                selector: selector.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl PageDriver for ChromiumPage {
    fn id(&self) -> String {
        self.page.target_id().inner().clone()
    }

    async fn goto(&self, url: &str) -> BrowserResult<()> {
        debug!("Navigating to {}", url);
        self.page
            .goto(url)
            .await
            .map(|_| ())
            .map_err(|e| BrowserError::NavigationFailed(format!("{url}: {e}")))
    }

    async fn exists(&self, selector: &Selector) -> BrowserResult<bool> {
        self.eval(format!("!!{}", selector.resolve_expression()))
            .await
    }

    async fn is_visible(&self, selector: &Selector) -> BrowserResult<bool> {
        self.eval(format!(
            "(() => {{ const el = {}; if (!el) return false; \
             const style = window.getComputedStyle(el); \
             return el.getClientRects().length > 0 && style.visibility !== 'hidden' && style.display !== 'none'; }})()",
            selector.resolve_expression()
        ))
        .await
    }

    async fn is_enabled(&self, selector: &Selector) -> BrowserResult<bool> {
        let enabled: Option<bool> = self
            .eval(format!(
                "(() => {{ const el = {}; if (!el) return null; \
                 return !(el.disabled || el.getAttribute('aria-disabled') === 'true'); }})()",
                selector.resolve_expression()
            ))
            .await?;
        enabled.ok_or_else(|| BrowserError::ElementNotFound(selector.to_string()))
    }

    async fn text_content(&self, selector: &Selector) -> BrowserResult<Option<String>> {
        self.eval(format!(
            "(() => {{ const el = {}; return el ? el.textContent : null; }})()",
            selector.resolve_expression()
        ))
        .await
    }

    async fn ready_state(&self) -> BrowserResult<String> {
        self.eval("document.readyState".to_string()).await
    }

    async fn click(&self, selector: &Selector, timeout: Duration) -> BrowserResult<()> {
        self.wait_for_selector(selector, timeout).await?;
        let element = self.element(selector, "click").await?;
        let failed = |reason: String| BrowserError::ActionFailed {
            action: "click",
            selector: selector.to_string(),
            reason,
        };

        element
            .scroll_into_view()
            .await
            .map_err(|e| failed(e.to_string()))?;
        // Clicking the point avoids chromiumoxide's IntersectionObserver wait
        let point = element
            .clickable_point()
            .await
            .map_err(|e| failed(e.to_string()))?;
        self.page
            .click(point)
            .await
            .map_err(|e| failed(e.to_string()))?;

        debug!("Clicked {}", selector);
        Ok(())
    }

    async fn fill(&self, selector: &Selector, value: &str, timeout: Duration) -> BrowserResult<()> {
        self.wait_for_selector(selector, timeout).await?;
        let value_json =
            serde_json::to_string(value).map_err(|e| BrowserError::Script(e.to_string()))?;

        // Inputs need the native setter so React sees the change; the chat
        // composer is contenteditable and only reacts to insertText
        let script = format!(
            r#"(() => {{
                const el = {resolve};
                if (!el) return false;
                const value = {value_json};
                el.focus();
                if (el instanceof HTMLInputElement || el instanceof HTMLTextAreaElement) {{
                    const proto = el instanceof HTMLInputElement ? HTMLInputElement.prototype : HTMLTextAreaElement.prototype;
                    Object.getOwnPropertyDescriptor(proto, 'value').set.call(el, value);
                }} else {{
                    document.execCommand('selectAll', false, null);
                    document.execCommand('insertText', false, value);
                }}
                el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return true;
            }})()"#,
            resolve = selector.resolve_expression(),
        );

        if !self.eval::<bool>(script).await? {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        debug!("Filled {} ({} chars)", selector, value.chars().count());
        Ok(())
    }

    async fn set_input_files(
        &self,
        selector: &Selector,
        path: &Path,
        timeout: Duration,
    ) -> BrowserResult<()> {
        self.wait_for_selector(selector, timeout).await?;
        let element = self.element(selector, "set_input_files").await?;

        let mut params = SetFileInputFilesParams::new(vec![path.display().to_string()]);
        params.backend_node_id = Some(element.backend_node_id);
        self.page
            .execute(params)
            .await
            .map_err(|e| BrowserError::ActionFailed {
                action: "set_input_files",
                selector: selector.to_string(),
                reason: e.to_string(),
            })?;

        debug!("Attached {} to {}", path.display(), selector);
        Ok(())
    }
}

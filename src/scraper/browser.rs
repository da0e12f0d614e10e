//! Chrome-backed fetch session.
//!
//! Each call launches its own headless browser, opens one tab, and tears both
//! down before returning, whatever the outcome. A poisoned page or browser
//! never outlives the attempt that produced it. Dropping the `fetch_markup`
//! future (run deadline, Ctrl-C) kills the browser at once and every wait
//! loop on the worker thread stops with `Cancelled`.

use crate::config::ScraperConfig;
use crate::models::Target;
use crate::scraper::{FetchError, PageSource, history_url};
use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::ffi::OsStr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const POLL: Duration = Duration::from_millis(100);

pub struct ChromeSession {
    config: ScraperConfig,
}

impl ChromeSession {
    pub fn new(config: &ScraperConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

#[async_trait]
impl PageSource for ChromeSession {
    async fn fetch_markup(&self, target: &Target) -> Result<String, FetchError> {
        let url = history_url(&self.config.base_url, target)
            .map_err(|e| FetchError::NavigationFailed(format!("bad url for {}: {}", target.symbol(), e)))?;
        let config = self.config.clone();

        let slot = Arc::new(SessionSlot::<Browser>::new());
        let _close = CloseOnDrop(Arc::clone(&slot));

        // headless_chrome is a blocking client.
        tokio::task::spawn_blocking(move || {
            let markup = fetch_blocking(&config, url.as_str(), &slot);
            slot.close();
            markup
        })
        .await
        .map_err(|e| FetchError::PageCrashed(format!("session task failed: {}", e)))?
    }
}

// ── Session ownership ─────────────────────────────────────────────────────────

/// Holds the attempt's browser so the async caller can kill it while the
/// blocking worker is still waiting on the page.
struct SessionSlot<B = Browser> {
    browser: Mutex<Option<B>>,
    closed: AtomicBool,
}

impl<B> SessionSlot<B> {
    fn new() -> Self {
        Self {
            browser: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Hand the launched browser over. Refused (and the browser dropped) once
    /// the session has been closed.
    fn install(&self, browser: B) -> Result<(), FetchError> {
        let mut slot = self.browser.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return Err(closed());
        }
        *slot = Some(browser);
        Ok(())
    }

    /// Drop the browser, killing its process. Idempotent.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let browser = self.browser.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(browser);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), FetchError> {
        if self.is_closed() {
            return Err(closed());
        }
        Ok(())
    }
}

fn closed() -> FetchError {
    FetchError::Cancelled("session closed".to_string())
}

/// Closes the session when the owning future is dropped, finished or not.
struct CloseOnDrop<B>(Arc<SessionSlot<B>>);

impl<B> Drop for CloseOnDrop<B> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Call `check` every `POLL` until it yields a value or `timeout` passes.
/// `Ok(None)` on timeout; `Cancelled` as soon as the session is closed.
fn poll_until<B, T>(
    slot: &SessionSlot<B>,
    timeout: Duration,
    mut check: impl FnMut() -> Option<T>,
) -> Result<Option<T>, FetchError> {
    let deadline = Instant::now() + timeout;
    loop {
        slot.check()?;
        if let Some(found) = check() {
            return Ok(Some(found));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(POLL);
    }
}

// ── Scoped page ───────────────────────────────────────────────────────────────

/// Closes its tab on drop, on every exit path.
struct PageGuard(Arc<Tab>);

impl Deref for PageGuard {
    type Target = Tab;

    fn deref(&self) -> &Tab {
        &self.0
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if let Err(e) = self.0.close(false) {
            debug!("Tab close failed: {}", e);
        }
    }
}

fn launch(config: &ScraperConfig) -> Result<Browser, FetchError> {
    let user_agent = format!("--user-agent={}", config.user_agent);
    let options = LaunchOptions {
        headless: config.headless,
        sandbox: false,
        window_size: Some((1920, 1080)),
        args: vec![
            OsStr::new(&user_agent),
            OsStr::new("--disable-blink-features=AutomationControlled"),
            OsStr::new("--disable-dev-shm-usage"),
        ],
        ..Default::default()
    };

    Browser::new(options).map_err(|e| FetchError::BrowserUnavailable(format!("{:#}", e)))
}

fn fetch_blocking(config: &ScraperConfig, url: &str, slot: &SessionSlot) -> Result<String, FetchError> {
    let browser = launch(config)?;
    let tab = browser
        .new_tab()
        .map_err(|e| FetchError::PageCrashed(format!("new tab: {:#}", e)))?;
    slot.install(browser)?;
    let page = PageGuard(tab);

    debug!("GET {}", url);
    page.navigate_to(url)
        .map_err(|e| FetchError::NavigationFailed(format!("{:#}", e)))?;
    wait_for_dom_ready(&page, slot, config.navigation_timeout())?;

    dismiss_consent(&page, slot, config)?;

    let table = poll_until(slot, config.table_timeout(), || {
        page.find_element(&config.table_selector).ok().map(|_| ())
    })?;
    table.ok_or_else(|| FetchError::Timeout {
        what: format!("`{}`", config.table_selector),
        secs: config.table_timeout_secs,
    })?;

    slot.check()?;
    page.get_content()
        .map_err(|e| FetchError::PageCrashed(format!("content: {:#}", e)))
}

/// Poll `document.readyState` until the DOM is parsed. Full resource load is
/// not awaited; the history table renders asynchronously after that anyway.
fn wait_for_dom_ready(tab: &Tab, slot: &SessionSlot, timeout: Duration) -> Result<(), FetchError> {
    // Evaluation errors while the old document is torn down are expected.
    let ready = poll_until(slot, timeout, || {
        let obj = tab.evaluate("document.readyState", false).ok()?;
        match obj.value {
            Some(serde_json::Value::String(state)) if state != "loading" => Some(()),
            _ => None,
        }
    })?;
    ready.ok_or_else(|| FetchError::Timeout {
        what: "DOM content".to_string(),
        secs: timeout.as_secs(),
    })
}

/// Watch for a consent overlay until one shows, the table shows, or
/// `consent_timeout` passes, then click the first button found.
/// Finding none is fine.
fn dismiss_consent(tab: &Tab, slot: &SessionSlot, config: &ScraperConfig) -> Result<(), FetchError> {
    let seen = poll_until(slot, config.consent_timeout(), || {
        for selector in &config.consent_selectors {
            if let Ok(button) = tab.find_element(selector) {
                return Some(Some((selector.as_str(), button)));
            }
        }
        tab.find_element(&config.table_selector).ok().map(|_| None)
    })?;

    match seen {
        Some(Some((selector, button))) => match button.click() {
            Ok(_) => info!("Dismissed consent overlay via {}", selector),
            Err(e) => debug!("Consent click on {} failed: {}", selector, e),
        },
        Some(None) => debug!("Table rendered with no consent overlay"),
        None => debug!("No consent overlay within {:?}", config.consent_timeout()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Stands in for a browser; records when it is dropped.
    struct Tracked(Arc<AtomicBool>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn tracked() -> (Tracked, Arc<AtomicBool>) {
        let dropped = Arc::new(AtomicBool::new(false));
        (Tracked(Arc::clone(&dropped)), dropped)
    }

    #[test]
    fn test_close_drops_installed_browser() {
        let slot = SessionSlot::new();
        let (browser, dropped) = tracked();
        slot.install(browser).unwrap();
        assert!(slot.check().is_ok());
        assert!(!dropped.load(Ordering::SeqCst));

        slot.close();
        assert!(dropped.load(Ordering::SeqCst));
        assert!(matches!(slot.check(), Err(FetchError::Cancelled(_))));
        slot.close();
    }

    #[test]
    fn test_install_after_close_is_refused() {
        let slot: SessionSlot<Tracked> = SessionSlot::new();
        slot.close();
        let (browser, dropped) = tracked();
        assert!(matches!(slot.install(browser), Err(FetchError::Cancelled(_))));
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dropping_the_fetch_future_kills_the_browser() {
        let slot = Arc::new(SessionSlot::<Tracked>::new());
        let (browser, dropped) = tracked();
        slot.install(browser).unwrap();

        let guard = CloseOnDrop(Arc::clone(&slot));
        let in_flight = async move {
            let _close = guard;
            std::future::pending::<()>().await
        };
        let timed_out = tokio::time::timeout(Duration::from_millis(10), in_flight).await;

        assert!(timed_out.is_err());
        assert!(dropped.load(Ordering::SeqCst));
        assert!(slot.is_closed());
    }

    #[test]
    fn test_poll_until_found_timeout_and_closed() {
        let slot: SessionSlot<Tracked> = SessionSlot::new();

        let calls = AtomicUsize::new(0);
        let found = poll_until(&slot, Duration::from_secs(5), || {
            (calls.fetch_add(1, Ordering::SeqCst) == 2).then_some("table")
        });
        assert_eq!(found.unwrap(), Some("table"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let missing = poll_until(&slot, Duration::ZERO, || None::<()>);
        assert_eq!(missing.unwrap(), None);

        slot.close();
        let calls = AtomicUsize::new(0);
        let closed = poll_until(&slot, Duration::from_secs(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Some(())
        });
        assert!(matches!(closed, Err(FetchError::Cancelled(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

//! Chrome via `headless_chrome`: session setup and the [`PageHandle`] used by
//! real runs. Every CDP call is blocking, so each one runs on the blocking pool.

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Network::events::ResponseReceivedEventParams;
use headless_chrome::protocol::cdp::Network::GetResponseBodyReturnObject;
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::error::{AgentError, PageError};
use crate::page::{NetworkBuffer, PageHandle};
use crate::types::{Direction, NetworkRecord};

const RESPONSE_HANDLER: &str = "autoapply-network";
const MAX_BODY_BYTES: usize = 256 * 1024;

/// One browser per run. Dropping it closes a launched browser; an attached
/// one is left running.
pub struct BrowserSession {
    _browser: Browser,
    tab: Arc<Tab>,
    network: NetworkBuffer,
    navigation_timeout: Duration,
    action_timeout: Duration,
}

impl BrowserSession {
    /// Blocking; call from `spawn_blocking`. Element lookups wait at most
    /// `action_timeout`; page loads get the configured navigation timeout.
    pub fn launch(config: &BrowserConfig, action_timeout: Duration) -> Result<Self, AgentError> {
        let navigation_timeout = Duration::from_millis(config.navigation_timeout_ms);
        let (browser, tab) = match &config.attach_url {
            Some(url) => attach(url)?,
            None => launch_new(config)?,
        };
        tab.set_default_timeout(action_timeout);

        let network = NetworkBuffer::new();
        let sink = network.clone();
        let handler = Box::new(
            move |params: ResponseReceivedEventParams,
                  fetch_body: &dyn Fn() -> anyhow::Result<GetResponseBodyReturnObject>| {
                let response = &params.response;
                if !response.mime_type.contains("json") {
                    return;
                }
                let body = match fetch_body() {
                    Ok(body) if !body.base_64_encoded => body.body,
                    Ok(_) => return,
                    Err(err) => {
                        debug!(url = %response.url, error = %err, "response body unavailable");
                        return;
                    }
                };
                if let Some(record) = network_record(&response.url, response.status as u16, &response.mime_type, &body) {
                    sink.push(record);
                }
            },
        );
        if let Err(err) = tab.register_response_handling(RESPONSE_HANDLER, handler) {
            warn!(error = %err, "network capture unavailable, continuing without it");
        }

        info!(attached = config.attach_url.is_some(), headless = config.headless, "browser ready");
        Ok(Self {
            _browser: browser,
            tab,
            network,
            navigation_timeout,
            action_timeout,
        })
    }

    pub fn page(&self) -> ChromePage {
        ChromePage {
            tab: self.tab.clone(),
            settle: self.navigation_timeout.min(Duration::from_secs(5)),
            navigation_timeout: self.navigation_timeout,
            action_timeout: self.action_timeout,
        }
    }

    pub fn network(&self) -> NetworkBuffer {
        self.network.clone()
    }
}

fn attach(url: &str) -> Result<(Browser, Arc<Tab>), AgentError> {
    info!(url, "attaching to running Chrome");
    let browser = Browser::connect(url.to_string()).map_err(|e| AgentError::Browser(format!("attach failed: {e:#}")))?;
    let existing = browser
        .get_tabs()
        .lock()
        .map_err(|_| AgentError::Browser("tab list lock poisoned".into()))?
        .first()
        .cloned();
    let tab = match existing {
        Some(tab) => tab,
        None => browser.new_tab().map_err(|e| AgentError::Browser(format!("{e:#}")))?,
    };
    Ok((browser, tab))
}

fn launch_new(config: &BrowserConfig) -> Result<(Browser, Arc<Tab>), AgentError> {
    let options = LaunchOptions {
        headless: config.headless,
        window_size: Some((config.window_width, config.window_height)),
        path: config.executable.clone(),
        user_data_dir: config.user_data_dir.clone(),
        args: vec![
            OsStr::new("--no-first-run"),
            OsStr::new("--no-default-browser-check"),
            OsStr::new("--disable-blink-features=AutomationControlled"),
            OsStr::new("--disable-infobars"),
            OsStr::new("--password-store=basic"),
        ],
        idle_browser_timeout: Duration::from_secs(600),
        ..Default::default()
    };
    info!(headless = config.headless, profile = ?config.user_data_dir, "launching Chrome");
    let browser = Browser::new(options).map_err(|e| AgentError::Browser(format!("launch failed: {e:#}")))?;
    let tab = browser.new_tab().map_err(|e| AgentError::Browser(format!("{e:#}")))?;
    Ok((browser, tab))
}

/// JSON bodies only; oversized or unparsable bodies are dropped.
pub fn network_record(url: &str, status: u16, mime_type: &str, body: &str) -> Option<NetworkRecord> {
    if body.len() > MAX_BODY_BYTES {
        return None;
    }
    let body = serde_json::from_str(body).ok()?;
    Some(NetworkRecord {
        url: url.to_string(),
        status,
        mime_type: mime_type.to_string(),
        body,
    })
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

pub struct ChromePage {
    tab: Arc<Tab>,
    settle: Duration,
    navigation_timeout: Duration,
    action_timeout: Duration,
}

impl ChromePage {
    /// Runs a page load with the navigation timeout, then restores the
    /// action timeout for element lookups.
    async fn loading<F>(&self, work: F) -> Result<(), PageError>
    where
        F: FnOnce(&Tab) -> anyhow::Result<()> + Send + 'static,
    {
        let (navigation, action) = (self.navigation_timeout, self.action_timeout);
        self.blocking(move |tab| {
            tab.set_default_timeout(navigation);
            let loaded = work(tab);
            tab.set_default_timeout(action);
            loaded
        })
        .await
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T, PageError>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> anyhow::Result<T> + Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || work(&tab))
            .await
            .map_err(|e| PageError::Other(format!("browser task failed: {e}")))?
            .map_err(|e| PageError::from_message(format!("{e:#}")))
    }

    async fn run_script(&self, script: String) -> Result<serde_json::Value, PageError> {
        self.blocking(move |tab| Ok(tab.evaluate(&script, false)?.value.unwrap_or(serde_json::Value::Null)))
            .await
    }
}

#[async_trait]
impl PageHandle for ChromePage {
    async fn url(&self) -> Result<String, PageError> {
        self.blocking(|tab| Ok(tab.get_url())).await
    }

    async fn title(&self) -> Result<String, PageError> {
        self.blocking(|tab| tab.get_title()).await
    }

    async fn content(&self) -> Result<String, PageError> {
        self.blocking(|tab| tab.get_content()).await
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, PageError> {
        self.run_script(script.to_string()).await
    }

    async fn goto(&self, url: &str) -> Result<(), PageError> {
        let url = url.to_string();
        self.loading(move |tab| {
            tab.navigate_to(&url)?.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn click(&self, selector: &str) -> Result<(), PageError> {
        let selector = selector.to_string();
        self.blocking(move |tab| {
            tab.find_element(&selector)?.click()?;
            Ok(())
        })
        .await
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), PageError> {
        let selector = selector.to_string();
        let value = value.to_string();
        self.blocking(move |tab| {
            tab.find_element(&selector)?.click()?;
            tab.evaluate(
                &format!("document.querySelector({}).value = ''", js_string(&selector)),
                false,
            )?;
            tab.type_str(&value)?;
            Ok(())
        })
        .await
    }

    async fn select_option(&self, selector: &str, value: &str) -> Result<(), PageError> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return 'missing';
                const wanted = {val};
                if (![...el.options].some(o => o.value === wanted)) return 'no-option';
                el.value = wanted;
                el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return 'ok';
            }})()"#,
            sel = js_string(selector),
            val = js_string(value),
        );
        match self.run_script(script).await?.as_str() {
            Some("ok") => Ok(()),
            Some("missing") => Err(PageError::NotFound(selector.to_string())),
            _ => Err(PageError::Other(format!("option '{value}' not available in {selector}"))),
        }
    }

    async fn upload(&self, selector: &str, path: &Path) -> Result<(), PageError> {
        let selector = selector.to_string();
        let path = path.to_string_lossy().into_owned();
        self.blocking(move |tab| {
            tab.find_element(&selector)?.set_input_files(&[path.as_str()])?;
            Ok(())
        })
        .await
    }

    async fn navigate(&self, direction: Direction) -> Result<(), PageError> {
        let settle = self.settle;
        self.loading(move |tab| {
            match direction {
                Direction::Back => {
                    tab.evaluate("history.back()", false)?;
                }
                Direction::Forward => {
                    tab.evaluate("history.forward()", false)?;
                }
                Direction::Reload => {
                    tab.reload(false, None)?;
                }
            }
            std::thread::sleep(settle.min(Duration::from_millis(1500)));
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_json_bodies_become_records() {
        let record = network_record(
            "https://acme.test/api/applications",
            201,
            "application/json",
            r#"{"status":"submitted"}"#,
        )
        .expect("record");
        assert_eq!(record.body["status"], "submitted");
        assert!(record.is_api_endpoint());
        assert!(network_record("https://acme.test/", 200, "application/json", "<html>").is_none());
    }

    #[test]
    fn oversized_bodies_are_dropped() {
        let body = format!("\"{}\"", "a".repeat(MAX_BODY_BYTES + 1));
        assert!(network_record("https://acme.test/api/x", 200, "application/json", &body).is_none());
    }

    #[test]
    fn selectors_are_quoted_for_scripts() {
        assert_eq!(js_string(r#"[data-eid="e3"]"#), r#""[data-eid=\"e3\"]""#);
    }
}

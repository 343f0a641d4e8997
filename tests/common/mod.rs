//! Scripted in-memory site for run loop tests.
//!
//! Each screen renders HTML from the shared form state and decides where a
//! click leads. Controls carry `data-eid` so the selectors the crate produces
//! map straight back to them.

#![allow(dead_code)]

use async_trait::async_trait;
use autoapply::config::AutomationConfig;
use autoapply::dom::LIVE_STATE_JS;
use autoapply::profile::{ConfigProfile, Masker, Profile, ProfileProvider};
use autoapply::types::{Direction, NetworkRecord};
use autoapply::{NetworkBuffer, PageError, PageHandle};
use scraper::{Html, Selector};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const EMAIL: &str = "jane@example.com";
pub const PASSWORD: &str = "hunter2-secret";

#[derive(Debug, Default, Clone)]
pub struct Form {
    pub values: BTreeMap<String, String>,
    pub checked: BTreeSet<String>,
    pub uploads: BTreeMap<String, PathBuf>,
}

impl Form {
    pub fn value(&self, eid: &str) -> &str {
        self.values.get(eid).map(String::as_str).unwrap_or_default()
    }

    pub fn filled(&self, eid: &str) -> bool {
        !self.value(eid).trim().is_empty()
    }
}

pub struct Screen {
    pub name: &'static str,
    pub render: fn(&Form) -> String,
    /// Where a click on `eid` leads, if anywhere.
    pub on_click: fn(&str, &Form) -> Option<&'static str>,
}

fn stay(_: &str, _: &Form) -> Option<&'static str> {
    None
}

impl Screen {
    pub fn fixed(name: &'static str, render: fn(&Form) -> String) -> Self {
        Self {
            name,
            render,
            on_click: stay,
        }
    }
}

struct SiteState {
    current: &'static str,
    form: Form,
    log: Vec<String>,
}

pub struct FakePage {
    screens: Vec<Screen>,
    state: Mutex<SiteState>,
    closed: AtomicBool,
    network: NetworkBuffer,
    /// JSON responses a click on the eid triggers.
    responses: Mutex<Vec<(String, NetworkRecord)>>,
    click_delay: Mutex<Duration>,
}

impl FakePage {
    /// The first screen is where `goto` lands.
    pub fn new(screens: Vec<Screen>) -> Arc<Self> {
        let current = screens.first().map(|s| s.name).unwrap_or("blank");
        Arc::new(Self {
            screens,
            state: Mutex::new(SiteState {
                current,
                form: Form::default(),
                log: Vec::new(),
            }),
            closed: AtomicBool::new(false),
            network: NetworkBuffer::new(),
            responses: Mutex::new(Vec::new()),
            click_delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Buffer the page pushes captured responses into; hand it to the run loop.
    pub fn network(&self) -> NetworkBuffer {
        self.network.clone()
    }

    pub fn respond_on_click(&self, eid: &str, record: NetworkRecord) {
        self.responses.lock().unwrap().push((eid.to_string(), record));
    }

    pub fn slow_clicks(&self, delay: Duration) {
        *self.click_delay.lock().unwrap() = delay;
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn current(&self) -> &'static str {
        self.state.lock().unwrap().current
    }

    pub fn show(&self, screen: &'static str) {
        self.state.lock().unwrap().current = screen;
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn screen(&self, name: &str) -> &Screen {
        self.screens.iter().find(|s| s.name == name).expect("unknown screen")
    }

    fn guard(&self) -> Result<(), PageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PageError::Closed("target closed".into()));
        }
        Ok(())
    }

    fn html(&self) -> String {
        let state = self.state.lock().unwrap();
        let body = (self.screen(state.current).render)(&state.form);
        format!("<html><head><title>{}</title></head><body>{body}</body></html>", state.current)
    }

    /// Live state the markup cannot carry: file counts.
    fn live_state(&self) -> serde_json::Value {
        let html = self.html();
        let document = Html::parse_document(&html);
        let selector = Selector::parse("input[type=file][data-eid]").unwrap();
        let state = self.state.lock().unwrap();
        let elements: Vec<serde_json::Value> = document
            .select(&selector)
            .filter_map(|el| el.value().attr("data-eid"))
            .map(|eid| serde_json::json!({"eid": eid, "visible": true, "files": usize::from(state.form.uploads.contains_key(eid))}))
            .collect();
        serde_json::Value::String(serde_json::json!({"elements": elements, "text": ""}).to_string())
    }

    fn eid_of(&self, selector: &str) -> Result<String, PageError> {
        let eid = selector
            .strip_prefix("[data-eid=\"")
            .and_then(|s| s.strip_suffix("\"]"))
            .ok_or_else(|| PageError::NotFound(selector.to_string()))?;
        let html = self.html();
        let document = Html::parse_document(&html);
        let found = Selector::parse(selector)
            .ok()
            .is_some_and(|s| document.select(&s).next().is_some());
        if !found {
            return Err(PageError::NotFound(selector.to_string()));
        }
        Ok(eid.to_string())
    }

    /// `(type, name)` of the element carrying `eid`.
    fn input_kind(&self, eid: &str) -> (String, String) {
        let html = self.html();
        let document = Html::parse_document(&html);
        let selector = Selector::parse(&format!("[data-eid=\"{eid}\"]")).unwrap();
        document
            .select(&selector)
            .next()
            .map(|el| {
                let ty = if el.value().name() == "input" {
                    el.value().attr("type").unwrap_or("text").to_string()
                } else {
                    el.value().name().to_string()
                };
                (ty, el.value().attr("name").unwrap_or_default().to_string())
            })
            .unwrap_or_default()
    }

    fn radio_group(&self, name: &str) -> Vec<String> {
        let html = self.html();
        let document = Html::parse_document(&html);
        let selector = Selector::parse(&format!("input[type=radio][name=\"{name}\"]")).unwrap();
        document
            .select(&selector)
            .filter_map(|el| el.value().attr("data-eid").map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl PageHandle for FakePage {
    async fn url(&self) -> Result<String, PageError> {
        self.guard()?;
        Ok(format!("https://jobs.acme.test/{}", self.current()))
    }

    async fn title(&self) -> Result<String, PageError> {
        self.guard()?;
        Ok(self.current().to_string())
    }

    async fn content(&self) -> Result<String, PageError> {
        self.guard()?;
        Ok(self.html())
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, PageError> {
        self.guard()?;
        if script == LIVE_STATE_JS {
            return Ok(self.live_state());
        }
        Ok(serde_json::Value::Null)
    }

    async fn goto(&self, url: &str) -> Result<(), PageError> {
        self.guard()?;
        let first = self.screens.first().map(|s| s.name).unwrap_or("blank");
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("goto {url}"));
        state.current = first;
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), PageError> {
        self.guard()?;
        let delay = *self.click_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        let eid = self.eid_of(selector)?;
        let (ty, name) = self.input_kind(&eid);
        let group = if ty == "radio" { self.radio_group(&name) } else { Vec::new() };
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("click {eid}"));
        match ty.as_str() {
            "checkbox" => {
                if !state.form.checked.remove(&eid) {
                    state.form.checked.insert(eid.clone());
                }
            }
            "radio" => {
                for other in &group {
                    state.form.checked.remove(other);
                }
                state.form.checked.insert(eid.clone());
            }
            _ => {}
        }
        let screen = self.screen(state.current);
        if let Some(next) = (screen.on_click)(&eid, &state.form) {
            state.current = next;
        }
        for (_, record) in self.responses.lock().unwrap().iter().filter(|(on, _)| *on == eid) {
            self.network.push(record.clone());
        }
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), PageError> {
        self.guard()?;
        let eid = self.eid_of(selector)?;
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("fill {eid} {value}"));
        state.form.values.insert(eid, value.to_string());
        Ok(())
    }

    async fn select_option(&self, selector: &str, value: &str) -> Result<(), PageError> {
        self.guard()?;
        let eid = self.eid_of(selector)?;
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("select {eid} {value}"));
        state.form.values.insert(eid, value.to_string());
        Ok(())
    }

    async fn upload(&self, selector: &str, path: &Path) -> Result<(), PageError> {
        self.guard()?;
        let eid = self.eid_of(selector)?;
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("upload {eid}"));
        state.form.uploads.insert(eid, path.to_path_buf());
        Ok(())
    }

    async fn navigate(&self, direction: Direction) -> Result<(), PageError> {
        self.guard()?;
        self.state.lock().unwrap().log.push(format!("navigate {direction:?}"));
        Ok(())
    }
}

pub fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Labelled text input bound to `eid`.
pub fn text_input(form: &Form, eid: &str, label: &str, input_type: &str, required: bool) -> String {
    format!(
        r#"<label for="{eid}">{label}</label><input data-eid="{eid}" id="{eid}" name="{eid}" type="{input_type}" value="{value}"{req}>"#,
        value = escape(form.value(eid)),
        req = if required { " required" } else { "" },
    )
}

pub fn checked(form: &Form, eid: &str) -> &'static str {
    if form.checked.contains(eid) { " checked" } else { "" }
}

pub fn selected(form: &Form, eid: &str, value: &str) -> &'static str {
    if form.value(eid) == value { " selected" } else { "" }
}

/// Automation settings with no pauses or scrolling.
pub fn fast_settings() -> AutomationConfig {
    AutomationConfig {
        max_iterations: 40,
        action_timeout_ms: 2_000,
        action_delay_ms: 0,
        captcha_wait_secs: 1,
        captcha_poll_ms: 50,
        max_scroll_steps: 0,
        ..AutomationConfig::default()
    }
}

pub fn profile(resume: &Path) -> Profile {
    let mut profile = Profile {
        email: Some(EMAIL.into()),
        first_name: Some("Jane".into()),
        last_name: Some("Doe".into()),
        phone: Some("555-0100".into()),
        resume_path: Some(resume.to_path_buf()),
        ..Default::default()
    };
    profile.answers.insert("sponsorship".into(), "No".into());
    profile.answers.insert("work-authorization".into(), "Yes".into());
    profile
}

pub fn provider(resume: &Path) -> Arc<dyn ProfileProvider> {
    Arc::new(ConfigProfile::new(profile(resume), Some(PASSWORD.into())))
}

pub fn masker(provider: &Arc<dyn ProfileProvider>) -> Masker {
    Masker::for_provider(provider.as_ref(), true)
}

/// JSON response captured from `path` on the fake site.
pub fn api_response(path: &str, status: u16, body: serde_json::Value) -> NetworkRecord {
    NetworkRecord {
        url: format!("https://jobs.acme.test{path}"),
        status,
        mime_type: "application/json".into(),
        body,
    }
}

//! Snapshot builder: turns the live page into an immutable [`Snapshot`].
//!
//! A tagging script runs first. It stamps every actionable node with a
//! stable `data-eid` and reports the state the serialized HTML cannot carry
//! (current values, visibility, attached files). The HTML is then parsed with
//! `scraper` and the two views are joined on `data-eid`.

use chrono::Utc;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{AgentError, PageError};
use crate::page::{evaluate_json, NetworkBuffer, PageHandle};
use crate::purpose;
use crate::types::{
    CONTEXT_MAX_CHARS, Element, ElementKind, FrameRef, HiddenData, InputFields, MarkerNode, SelectChoice, Snapshot,
};

/// Tags actionable nodes with `data-eid` and reports their live state.
/// Existing tags are kept so an element keeps its id across captures.
pub const LIVE_STATE_JS: &str = r#"
(() => {
  const CONTROL = new Set(['A','BUTTON','INPUT','TEXTAREA','SELECT','IFRAME']);
  const MARKER = /captcha|challenge|turnstile/i;
  window.__autoapplySeq = window.__autoapplySeq || 0;

  function isVisible(el) {
    const s = getComputedStyle(el);
    if (el.offsetParent === null && s.position !== 'fixed' && el.tagName !== 'BODY') return false;
    const r = el.getBoundingClientRect();
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0' && r.width > 0 && r.height > 0;
  }

  function wanted(el) {
    const tag = el.tagName;
    if (tag === 'INPUT' && (el.type || '').toLowerCase() === 'hidden') return false;
    if (CONTROL.has(tag)) return true;
    const role = el.getAttribute('role');
    if (role === 'button' || role === 'link') return true;
    if (tag.endsWith('-BUTTON') || el.getAttribute('data-tag-name') === 'button') return true;
    const cls = typeof el.className === 'string' ? el.className : '';
    return MARKER.test((el.id || '') + ' ' + cls);
  }

  const out = [];
  for (const el of document.querySelectorAll('*')) {
    if (!wanted(el)) continue;
    let eid = el.getAttribute('data-eid');
    if (!eid) {
      eid = 'e' + (window.__autoapplySeq++);
      el.setAttribute('data-eid', eid);
    }
    const entry = { eid, visible: isVisible(el) };
    if (el.tagName === 'INPUT' || el.tagName === 'TEXTAREA') {
      entry.value = el.value || '';
      if (el.type === 'checkbox' || el.type === 'radio') entry.checked = !!el.checked;
      if (el.type === 'file') entry.files = el.files ? el.files.length : 0;
    } else if (el.tagName === 'SELECT') {
      entry.value = el.value || '';
      entry.selected = [...el.options].map((o, i) => o.selected ? i : -1).filter(i => i >= 0);
    } else if (el.tagName !== 'IFRAME') {
      entry.text = (el.innerText || '').trim().slice(0, 300);
    }
    out.push(entry);
  }
  return JSON.stringify({ elements: out, text: document.body ? document.body.innerText : '' });
})()
"#;

const STORAGE_JS: &str = r#"
(() => {
  const out = {};
  const grab = (store, prefix) => {
    try {
      for (let i = 0; i < store.length; i++) {
        const k = store.key(i);
        out[prefix + k] = String(store.getItem(k)).slice(0, 500);
      }
    } catch (e) {}
  };
  grab(window.localStorage, 'local:');
  grab(window.sessionStorage, 'session:');
  return JSON.stringify(out);
})()
"#;

const SCROLL_STEP_JS: &str = r#"
(() => {
  window.scrollBy(0, window.innerHeight);
  const h = document.body ? document.body.scrollHeight : 0;
  return JSON.stringify({ height: h, atBottom: window.innerHeight + window.scrollY >= h - 2 });
})()
"#;

const TEXT_SKIP: &[&str] = &["script", "style", "noscript", "template"];
const LABEL_SKIP: &[&str] = &["script", "style", "noscript", "template", "select", "textarea", "option"];
const CSRF_PATTERNS: &[&str] = &["csrf", "xsrf", "_token", "authenticity", "requestverification"];
const CSRF_META: &[&str] = &["csrf-token", "csrf-param", "_csrf", "xsrf-token"];
const MARKER_HINTS: &[&str] = &["captcha", "challenge", "turnstile"];
const CONTEXT_MAX_DEPTH: usize = 6;
const ELEMENT_TEXT_MAX_CHARS: usize = 300;

#[derive(Debug, Clone, Deserialize)]
pub struct LiveState {
    pub eid: String,
    #[serde(default = "visible_default")]
    pub visible: bool,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub checked: Option<bool>,
    #[serde(default)]
    pub files: Option<usize>,
    #[serde(default)]
    pub selected: Option<Vec<usize>>,
    #[serde(default)]
    pub text: Option<String>,
}

fn visible_default() -> bool {
    true
}

/// Output of [`LIVE_STATE_JS`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LiveCapture {
    #[serde(default)]
    pub elements: Vec<LiveState>,
    #[serde(default)]
    pub text: String,
}

impl LiveCapture {
    fn index(&self) -> HashMap<&str, &LiveState> {
        self.elements.iter().map(|s| (s.eid.as_str(), s)).collect()
    }
}

/// Everything the parser extracts from one HTML document.
#[derive(Debug, Default)]
pub struct ParsedPage {
    pub title: String,
    pub elements: Vec<Element>,
    pub page_text: String,
    pub hidden_data: HiddenData,
    pub frames: Vec<FrameRef>,
    pub challenge_nodes: Vec<MarkerNode>,
}

pub struct SnapshotBuilder {
    max_scroll_steps: usize,
    scroll_pause: Duration,
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SnapshotBuilder {
    pub fn new(max_scroll_steps: usize) -> Self {
        Self {
            max_scroll_steps,
            scroll_pause: Duration::from_millis(250),
        }
    }

    /// Captures the page. Sub-extraction failures are logged and leave their
    /// part empty; only a lost page is returned as an error.
    pub async fn build<P>(&self, page: &P, network: &NetworkBuffer) -> Result<Snapshot, AgentError>
    where
        P: PageHandle + ?Sized,
    {
        if self.max_scroll_steps > 0 {
            absorb(self.scroll_for_lazy_content(page).await, "scroll")?;
        }
        let live = absorb(capture_live(page).await, "live state")?.unwrap_or_default();
        let html = absorb(page.content().await, "html")?.unwrap_or_default();
        let url = absorb(page.url().await, "url")?.unwrap_or_else(|| "about:blank".to_string());
        let title = absorb(page.title().await, "title")?.unwrap_or_default();
        let storage = absorb(capture_storage(page).await, "storage")?.unwrap_or_default();

        let mut parsed = parse_document(&html, &live);
        parsed.hidden_data.storage = storage;
        let network_records = network.drain();

        debug!(
            url = %url,
            elements = parsed.elements.len(),
            network = network_records.len(),
            frames = parsed.frames.len(),
            "snapshot captured"
        );

        Ok(Snapshot {
            url,
            title: if title.is_empty() { parsed.title } else { title },
            captured_at: Utc::now(),
            elements: parsed.elements,
            page_text: parsed.page_text,
            network_records,
            hidden_data: parsed.hidden_data,
            frames: parsed.frames,
            challenge_nodes: parsed.challenge_nodes,
        })
    }

    async fn scroll_for_lazy_content<P>(&self, page: &P) -> Result<(), PageError>
    where
        P: PageHandle + ?Sized,
    {
        let mut last_height = 0;
        for _ in 0..self.max_scroll_steps {
            let position = evaluate_json(page, SCROLL_STEP_JS).await?;
            let height = position["height"].as_u64().unwrap_or(0);
            let at_bottom = position["atBottom"].as_bool().unwrap_or(true);
            if at_bottom && height == last_height {
                break;
            }
            last_height = height;
            tokio::time::sleep(self.scroll_pause).await;
        }
        page.evaluate("window.scrollTo(0, 0)").await?;
        Ok(())
    }
}

/// Builds a snapshot with the default builder.
pub async fn build<P>(page: &P, network: &NetworkBuffer) -> Result<Snapshot, AgentError>
where
    P: PageHandle + ?Sized,
{
    SnapshotBuilder::default().build(page, network).await
}

/// Fresh element list for the executor. Unlike [`build`], any failure here
/// is returned to the caller.
pub async fn capture_elements<P>(page: &P) -> Result<Vec<Element>, PageError>
where
    P: PageHandle + ?Sized,
{
    let live = capture_live(page).await?;
    let html = page.content().await?;
    Ok(parse_document(&html, &live).elements)
}

/// Snapshot of static markup, without a live page.
pub fn snapshot_from_html(url: &str, html: &str) -> Snapshot {
    let parsed = parse_document(html, &LiveCapture::default());
    Snapshot {
        url: url.to_string(),
        title: parsed.title,
        captured_at: Utc::now(),
        elements: parsed.elements,
        page_text: parsed.page_text,
        network_records: Vec::new(),
        hidden_data: parsed.hidden_data,
        frames: parsed.frames,
        challenge_nodes: parsed.challenge_nodes,
    }
}

fn absorb<T>(result: Result<T, PageError>, extractor: &str) -> Result<Option<T>, AgentError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(PageError::Closed(msg)) => Err(AgentError::FatalIo(msg)),
        Err(err) => {
            warn!(extractor, error = %err, "sub-extraction failed, continuing with a partial snapshot");
            Ok(None)
        }
    }
}

async fn capture_live<P>(page: &P) -> Result<LiveCapture, PageError>
where
    P: PageHandle + ?Sized,
{
    let value = evaluate_json(page, LIVE_STATE_JS).await?;
    if value.is_null() {
        return Ok(LiveCapture::default());
    }
    serde_json::from_value(value).map_err(|e| PageError::Script(format!("live state: {e}")))
}

async fn capture_storage<P>(page: &P) -> Result<BTreeMap<String, String>, PageError>
where
    P: PageHandle + ?Sized,
{
    let value = evaluate_json(page, STORAGE_JS).await?;
    if value.is_null() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_value(value).map_err(|e| PageError::Script(format!("storage: {e}")))
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Text below `el`, skipping anything nested inside one of `skip`.
fn collect_text(el: ElementRef<'_>, skip: &[&str]) -> String {
    let root = el.id();
    let mut parts = Vec::new();
    for node in el.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .ancestors()
            .take_while(|a| a.id() != root)
            .chain(std::iter::once(*el))
            .filter_map(ElementRef::wrap)
            .any(|a| skip.contains(&a.value().name()));
        if !hidden {
            parts.push(text.trim().to_string());
        }
    }
    collapse(&parts.join(" "))
}

fn attr<'a>(el: &ElementRef<'a>, name: &str) -> Option<&'a str> {
    el.value().attr(name)
}

fn attr_owned(el: &ElementRef<'_>, name: &str) -> Option<String> {
    attr(el, name).map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

fn has_hidden_style(el: &ElementRef<'_>) -> bool {
    if attr(el, "hidden").is_some() {
        return true;
    }
    attr(el, "style").is_some_and(|style| {
        let style = style.replace(' ', "").to_lowercase();
        style.contains("display:none") || style.contains("visibility:hidden")
    })
}

/// Visibility judged from markup alone, used when the live script gave nothing.
fn statically_visible(el: &ElementRef<'_>) -> bool {
    if has_hidden_style(el) {
        return false;
    }
    !el.ancestors().filter_map(ElementRef::wrap).any(|a| has_hidden_style(&a))
}

fn inside_inert(el: &ElementRef<'_>) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| matches!(a.value().name(), "template" | "noscript" | "script"))
}

/// `tag:nth-child(n)` path from the document root.
fn css_path(el: ElementRef<'_>) -> String {
    let mut parts = Vec::new();
    let mut current = Some(el);
    while let Some(node) = current {
        let name = node.value().name();
        if name == "html" {
            parts.push("html".to_string());
            break;
        }
        let position = node.prev_siblings().filter(|s| s.value().is_element()).count() + 1;
        parts.push(format!("{name}:nth-child({position})"));
        current = node.parent().and_then(ElementRef::wrap);
    }
    parts.reverse();
    parts.join(" > ")
}

fn selector_for(el: ElementRef<'_>) -> String {
    match attr(&el, "data-eid") {
        Some(eid) => format!("[data-eid=\"{eid}\"]"),
        None => css_path(el),
    }
}

fn is_marker(el: &ElementRef<'_>) -> bool {
    let id = attr(el, "id").unwrap_or_default().to_lowercase();
    let class = attr(el, "class").unwrap_or_default().to_lowercase();
    MARKER_HINTS.iter().any(|h| id.contains(h) || class.contains(h))
}

struct LabelIndex<'a> {
    by_for: HashMap<String, String>,
    by_id: HashMap<String, ElementRef<'a>>,
}

impl<'a> LabelIndex<'a> {
    fn new(document: &'a Html) -> Self {
        let mut by_for = HashMap::new();
        let mut by_id = HashMap::new();
        for node in document.root_element().descendants() {
            let Some(el) = ElementRef::wrap(node) else {
                continue;
            };
            if let Some(id) = attr_owned(&el, "id") {
                by_id.entry(id).or_insert(el);
            }
            if el.value().name() == "label" {
                if let Some(target) = attr_owned(&el, "for") {
                    let text = collect_text(el, LABEL_SKIP);
                    if !text.is_empty() {
                        by_for.entry(target).or_insert(text);
                    }
                }
            }
        }
        Self { by_for, by_id }
    }

    /// `label[for]`, then an enclosing `<label>`, then `aria-labelledby`.
    fn label_for(&self, el: &ElementRef<'_>) -> Option<String> {
        if let Some(text) = attr_owned(el, "id").and_then(|id| self.by_for.get(&id)) {
            return Some(text.clone());
        }
        if let Some(label) = el
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|a| a.value().name() == "label")
        {
            let text = collect_text(label, LABEL_SKIP);
            if !text.is_empty() {
                return Some(text);
            }
        }
        let ids = attr(el, "aria-labelledby")?;
        let text = ids
            .split_whitespace()
            .filter_map(|id| self.by_id.get(id))
            .map(|target| collect_text(*target, TEXT_SKIP))
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        (!text.is_empty()).then_some(text)
    }
}

/// Text of the nearest ancestor that says more than the element itself.
fn context_for(el: &ElementRef<'_>, own: &[&str]) -> String {
    for ancestor in el.ancestors().filter_map(ElementRef::wrap).take(CONTEXT_MAX_DEPTH) {
        if matches!(ancestor.value().name(), "body" | "html") {
            break;
        }
        let text = collect_text(ancestor, LABEL_SKIP);
        if text.is_empty() || own.iter().any(|o| *o == text) {
            continue;
        }
        return truncate_chars(&text, CONTEXT_MAX_CHARS);
    }
    String::new()
}

fn select_options(el: &ElementRef<'_>, live: Option<&LiveState>) -> Vec<SelectChoice> {
    let mut options: Vec<SelectChoice> = el
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|o| o.value().name() == "option")
        .map(|o| {
            let text = collect_text(o, TEXT_SKIP);
            SelectChoice {
                value: attr(&o, "value").map(str::to_string).unwrap_or_else(|| text.clone()),
                text,
                selected: attr(&o, "selected").is_some(),
            }
        })
        .collect();
    if let Some(indices) = live.and_then(|l| l.selected.as_ref()) {
        for (i, opt) in options.iter_mut().enumerate() {
            opt.selected = indices.contains(&i);
        }
    } else if attr(el, "multiple").is_none() && !options.iter().any(|o| o.selected) {
        if let Some(first) = options.first_mut() {
            first.selected = true;
        }
    }
    options
}

enum Classified {
    Element(ElementKind),
    Hidden,
    Skip,
}

fn classify_node(el: &ElementRef<'_>, live: Option<&LiveState>) -> Classified {
    let tag = el.value().name();
    let live_value = live.and_then(|l| l.value.clone());
    let live_checked = live.and_then(|l| l.checked);
    match tag {
        "button" => Classified::Element(ElementKind::Button {
            button_type: attr(el, "type").unwrap_or("submit").to_lowercase(),
        }),
        "a" if attr(el, "role") == Some("button") => Classified::Element(ElementKind::Button {
            button_type: "link".into(),
        }),
        "a" => Classified::Element(ElementKind::Link {
            href: attr_owned(el, "href"),
        }),
        "select" => Classified::Element(ElementKind::Select {
            options: select_options(el, live),
            multiple: attr(el, "multiple").is_some(),
        }),
        "textarea" => Classified::Element(ElementKind::Textarea {
            placeholder: attr_owned(el, "placeholder"),
            value: live_value.unwrap_or_else(|| el.text().collect::<String>()),
        }),
        "input" => {
            let input_type = attr(el, "type").unwrap_or("text").trim().to_lowercase();
            let static_value = attr(el, "value").unwrap_or_default().to_string();
            match input_type.as_str() {
                "hidden" => Classified::Hidden,
                "submit" | "button" | "reset" | "image" => Classified::Element(ElementKind::Button { button_type: input_type }),
                "checkbox" => Classified::Element(ElementKind::Checkbox {
                    value: attr_owned(el, "value"),
                    checked: live_checked.unwrap_or_else(|| attr(el, "checked").is_some()),
                }),
                "radio" => Classified::Element(ElementKind::Radio {
                    value: attr_owned(el, "value"),
                    checked: live_checked.unwrap_or_else(|| attr(el, "checked").is_some()),
                }),
                "file" => Classified::Element(ElementKind::FileUpload {
                    accept: attr_owned(el, "accept"),
                    multiple: attr(el, "multiple").is_some(),
                    files: live.and_then(|l| l.files).unwrap_or(0),
                }),
                _ => Classified::Element(ElementKind::Input(InputFields {
                    input_type,
                    placeholder: attr_owned(el, "placeholder"),
                    autocomplete: attr_owned(el, "autocomplete"),
                    pattern: attr_owned(el, "pattern"),
                    value: live_value.unwrap_or(static_value),
                })),
            }
        }
        _ => {
            let role = attr(el, "role");
            let custom = tag.ends_with("-button") || attr(el, "data-tag-name") == Some("button");
            if role == Some("link") {
                Classified::Element(ElementKind::Link {
                    href: attr_owned(el, "href"),
                })
            } else if role == Some("button") || custom {
                Classified::Element(ElementKind::Button {
                    button_type: if custom { "custom".into() } else { "role".into() },
                })
            } else {
                Classified::Skip
            }
        }
    }
}

fn data_attributes(el: &ElementRef<'_>) -> BTreeMap<String, String> {
    el.value()
        .attrs()
        .filter_map(|(name, value)| {
            let key = name.strip_prefix("data-")?;
            (key != "eid").then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

fn record_hidden(el: &ElementRef<'_>, hidden: &mut HiddenData) {
    let Some(key) = attr_owned(el, "name").or_else(|| attr_owned(el, "id")) else {
        return;
    };
    let value = attr(el, "value").unwrap_or_default().to_string();
    let lower = key.to_lowercase();
    if CSRF_PATTERNS.iter().any(|p| lower.contains(p)) {
        hidden.csrf_tokens.insert(key.clone(), value.clone());
    }
    hidden.hidden_fields.insert(key, value);
}

/// Parses a serialized document into elements, text and hidden data, joining
/// the live state on `data-eid`.
pub fn parse_document(html: &str, live: &LiveCapture) -> ParsedPage {
    let document = Html::parse_document(html);
    let labels = LabelIndex::new(&document);
    let live_index = live.index();
    let mut page = ParsedPage::default();

    if let Ok(selector) = Selector::parse("title") {
        if let Some(title) = document.select(&selector).next() {
            page.title = collapse(&title.text().collect::<String>());
        }
    }
    if let Ok(selector) = Selector::parse("meta[name]") {
        for meta in document.select(&selector) {
            let name = attr(&meta, "name").unwrap_or_default().to_lowercase();
            if CSRF_META.contains(&name.as_str()) {
                if let Some(content) = attr(&meta, "content") {
                    page.hidden_data.csrf_tokens.insert(name, content.to_string());
                }
            }
        }
    }

    for node in document.root_element().descendants() {
        let Some(el) = ElementRef::wrap(node) else {
            continue;
        };
        if inside_inert(&el) {
            continue;
        }
        let live_state = attr(&el, "data-eid").and_then(|eid| live_index.get(eid).copied());
        let visible = live_state.map(|l| l.visible).unwrap_or_else(|| statically_visible(&el));

        if is_marker(&el) {
            page.challenge_nodes.push(MarkerNode {
                tag: el.value().name().to_string(),
                id: attr_owned(&el, "id"),
                classes: el.value().classes().map(str::to_string).collect(),
                data_size: attr_owned(&el, "data-size"),
                visible,
            });
        }

        if el.value().name() == "iframe" {
            let zero_sized = attr(&el, "width") == Some("0") || attr(&el, "height") == Some("0");
            page.frames.push(FrameRef {
                src: attr(&el, "src").unwrap_or_default().to_string(),
                title: attr(&el, "title").unwrap_or_default().to_string(),
                visible: visible && !zero_sized,
            });
            continue;
        }

        let kind = match classify_node(&el, live_state) {
            Classified::Element(kind) => kind,
            Classified::Hidden => {
                record_hidden(&el, &mut page.hidden_data);
                continue;
            }
            Classified::Skip => continue,
        };

        let mut text = live_state
            .and_then(|l| l.text.clone())
            .filter(|t| !t.is_empty())
            .map(|t| collapse(&t))
            .unwrap_or_else(|| collect_text(el, TEXT_SKIP));
        if text.is_empty() && matches!(kind, ElementKind::Button { .. }) {
            text = attr_owned(&el, "value").unwrap_or_default();
        }
        let text = truncate_chars(&text, ELEMENT_TEXT_MAX_CHARS);
        if text.is_empty() && matches!(&kind, ElementKind::Button { button_type } if button_type == "custom") {
            continue;
        }

        let label = match kind {
            ElementKind::Button { .. } | ElementKind::Link { .. } => None,
            _ => labels.label_for(&el),
        };
        let context = context_for(&el, &[text.as_str(), label.as_deref().unwrap_or_default()]);
        let required = attr(&el, "required").is_some()
            || attr(&el, "aria-required") == Some("true")
            || label.as_deref().is_some_and(|l| l.contains('*'));
        let disabled = attr(&el, "disabled").is_some() || attr(&el, "aria-disabled") == Some("true");

        let mut element = Element {
            index: page.elements.len(),
            tag: el.value().name().to_string(),
            id: attr_owned(&el, "id"),
            name: attr_owned(&el, "name"),
            class_list: el.value().classes().map(str::to_string).collect(),
            aria_label: attr_owned(&el, "aria-label"),
            disabled,
            data_attributes: data_attributes(&el),
            text,
            label,
            context,
            visible,
            required,
            selector: selector_for(el),
            purpose: None,
            purpose_source: None,
            kind,
        };
        if let Some((purpose, source)) = purpose::detect(&element) {
            element.purpose = Some(purpose);
            element.purpose_source = Some(source);
        }
        page.elements.push(element);
    }

    page.page_text = if live.text.trim().is_empty() {
        if let Ok(selector) = Selector::parse("body") {
            document
                .select(&selector)
                .next()
                .map(|body| collect_text(body, TEXT_SKIP))
                .unwrap_or_default()
        } else {
            String::new()
        }
    } else {
        collapse(&live.text)
    };
    page
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PurposeSource;

    const FORM: &str = r#"
    <html><head><title>Apply - Acme</title>
      <meta name="csrf-token" content="tok123">
    </head><body>
      <form>
        <input type="hidden" name="authenticity_token" value="abc">
        <input type="hidden" name="job_id" value="42">
        <div><label for="fn">First name *</label><input id="fn" name="first_name" type="text"></div>
        <div><label>Email <input name="contact" type="email" required></label></div>
        <div><span id="ph">Mobile</span><input aria-labelledby="ph" name="x1"></div>
        <fieldset><legend>Will you require visa sponsorship?</legend>
          <label><input type="radio" name="q7" value="yes"> Yes</label>
          <label><input type="radio" name="q7" value="no"> No</label>
        </fieldset>
        <div><label for="cv">Resume</label><input id="cv" type="file" style="display:none"></div>
        <select name="country" required><option value="">Select...</option><option value="us">United States</option></select>
        <textarea name="cover" placeholder="Anything else?"></textarea>
        <button type="submit" data-action="submit-application">Submit Application</button>
        <ukg-button>Continue</ukg-button>
        <ukg-button></ukg-button>
      </form>
      <script>var x = "Thank you for applying";</script>
    </body></html>"#;

    fn find<'a>(snapshot: &'a Snapshot, predicate: impl Fn(&Element) -> bool) -> &'a Element {
        snapshot.elements.iter().find(|e| predicate(e)).expect("element present")
    }

    #[test]
    fn parses_elements_in_dom_order() {
        let snapshot = snapshot_from_html("https://acme.test/apply", FORM);
        let kinds: Vec<&str> = snapshot.elements.iter().map(|e| e.variant_name()).collect();
        assert_eq!(
            kinds,
            vec!["input", "input", "input", "radio", "radio", "file", "select", "textarea", "button", "button"]
        );
        assert_eq!(snapshot.title, "Apply - Acme");
        for (i, el) in snapshot.elements.iter().enumerate() {
            assert_eq!(el.index, i);
        }
    }

    #[test]
    fn labels_come_from_for_wrapping_and_labelledby() {
        let snapshot = snapshot_from_html("https://acme.test/apply", FORM);
        let first = find(&snapshot, |e| e.name.as_deref() == Some("first_name"));
        assert_eq!(first.label.as_deref(), Some("First name *"));
        assert!(first.required);
        assert_eq!(first.purpose.as_deref(), Some("given-name"));

        let email = find(&snapshot, |e| e.name.as_deref() == Some("contact"));
        assert_eq!(email.label.as_deref(), Some("Email"));
        assert_eq!(email.purpose_source, Some(PurposeSource::InputType));

        let phone = find(&snapshot, |e| e.name.as_deref() == Some("x1"));
        assert_eq!(phone.label.as_deref(), Some("Mobile"));
        assert_eq!(phone.purpose.as_deref(), Some("tel"));
    }

    #[test]
    fn radios_take_purpose_from_context() {
        let snapshot = snapshot_from_html("https://acme.test/apply", FORM);
        let yes = find(&snapshot, |e| matches!(&e.kind, ElementKind::Radio { value: Some(v), .. } if v == "yes"));
        assert_eq!(yes.label.as_deref(), Some("Yes"));
        assert_eq!(yes.purpose.as_deref(), Some("sponsorship"));
        assert_eq!(yes.purpose_source, Some(PurposeSource::Context));
    }

    #[test]
    fn hidden_file_input_stays_reachable() {
        let snapshot = snapshot_from_html("https://acme.test/apply", FORM);
        let file = find(&snapshot, |e| matches!(e.kind, ElementKind::FileUpload { .. }));
        assert!(!file.visible);
        assert!(file.is_reachable());
        assert_eq!(file.purpose.as_deref(), Some("resume"));
    }

    #[test]
    fn select_defaults_to_first_option() {
        let snapshot = snapshot_from_html("https://acme.test/apply", FORM);
        let select = find(&snapshot, |e| e.name.as_deref() == Some("country"));
        assert_eq!(select.purpose.as_deref(), Some("country"));
        assert!(!snapshot.is_satisfied(select));
    }

    #[test]
    fn hidden_data_and_text() {
        let snapshot = snapshot_from_html("https://acme.test/apply", FORM);
        assert_eq!(snapshot.hidden_data.csrf_tokens.get("authenticity_token").map(String::as_str), Some("abc"));
        assert_eq!(snapshot.hidden_data.csrf_tokens.get("csrf-token").map(String::as_str), Some("tok123"));
        assert_eq!(snapshot.hidden_data.hidden_fields.get("job_id").map(String::as_str), Some("42"));
        assert!(!snapshot.page_text.contains("Thank you for applying"));
        assert!(snapshot.page_text.contains("First name"));
    }

    #[test]
    fn custom_button_components() {
        let snapshot = snapshot_from_html("https://acme.test/apply", FORM);
        let buttons: Vec<&Element> = snapshot.elements.iter().filter(|e| e.is_control()).collect();
        assert_eq!(buttons.len(), 2);
        assert_eq!(buttons[0].purpose.as_deref(), Some("submit"));
        assert_eq!(buttons[1].tag, "ukg-button");
        assert_eq!(buttons[1].purpose.as_deref(), Some("next"));
    }

    #[test]
    fn live_state_overrides_markup() {
        let html = r#"<html><body>
            <input data-eid="e0" type="text" name="email" value="">
            <input data-eid="e1" type="checkbox" name="terms">
            <select data-eid="e2" name="gender"><option value="">--</option><option value="f">Female</option></select>
            <input data-eid="e3" type="file" name="resume">
            <iframe data-eid="e4" src="https://www.google.com/recaptcha/api2/anchor?k=1"></iframe>
        </body></html>"#;
        let live: LiveCapture = serde_json::from_value(serde_json::json!({
            "elements": [
                {"eid": "e0", "visible": true, "value": "me@x.io"},
                {"eid": "e1", "visible": true, "checked": true},
                {"eid": "e2", "visible": true, "value": "f", "selected": [1]},
                {"eid": "e3", "visible": false, "files": 1},
                {"eid": "e4", "visible": true}
            ],
            "text": "  Apply\n\n now  "
        }))
        .expect("valid live capture");
        let parsed = parse_document(html, &live);
        assert_eq!(parsed.page_text, "Apply now");
        assert_eq!(parsed.elements.len(), 4);
        assert_eq!(parsed.elements[0].selector, "[data-eid=\"e0\"]");
        assert!(matches!(&parsed.elements[0].kind, ElementKind::Input(f) if f.value == "me@x.io"));
        assert!(matches!(parsed.elements[1].kind, ElementKind::Checkbox { checked: true, .. }));
        assert!(matches!(&parsed.elements[2].kind, ElementKind::Select { options, .. } if options[1].selected && !options[0].selected));
        assert!(matches!(parsed.elements[3].kind, ElementKind::FileUpload { files: 1, .. }));
        assert_eq!(parsed.frames.len(), 1);
        assert!(parsed.frames[0].visible);
    }

    #[test]
    fn css_path_without_eid() {
        let snapshot = snapshot_from_html("https://x", "<html><body><div><p>hi</p><button>Go</button></div></body></html>");
        assert_eq!(
            snapshot.elements[0].selector,
            "html > body:nth-child(2) > div:nth-child(1) > button:nth-child(2)"
        );
    }

    #[test]
    fn purpose_is_stable_across_parses() {
        let a = snapshot_from_html("https://acme.test/apply", FORM);
        let b = snapshot_from_html("https://acme.test/apply", FORM);
        let pa: Vec<_> = a.elements.iter().map(|e| e.purpose.clone()).collect();
        let pb: Vec<_> = b.elements.iter().map(|e| e.purpose.clone()).collect();
        assert_eq!(pa, pb);
    }
}

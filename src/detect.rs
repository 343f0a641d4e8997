//! Failure/progress detector. CAPTCHA beats BLOCKED beats SUCCESS.

use serde::Serialize;

use crate::purpose::normalize;
use crate::types::{Element, ElementKind, NetworkRecord, Snapshot};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "signal", content = "evidence", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    None,
    Success(String),
    Captcha(String),
    Blocked(String),
}

const CHALLENGE_FRAMES: &[&str] = &[
    "recaptcha/api2/anchor",
    "recaptcha/enterprise/anchor",
    "hcaptcha.com",
    "challenges.cloudflare.com",
    "arkoselabs",
    "funcaptcha",
    "geetest",
];

const CHALLENGE_MARKERS: &[&str] = &[
    "g-recaptcha",
    "h-captcha",
    "cf-turnstile",
    "cf-challenge",
    "challenge-running",
    "challenge-form",
    "captcha",
];

/// Hidden fields the widgets fill once a human solved them.
const SOLVED_TOKENS: &[&str] = &["g-recaptcha-response", "h-captcha-response", "cf-turnstile-response"];

const BOT_CHECK_TEXT: &[&str] = &[
    "verify you are human",
    "verify that you are human",
    "are you a robot",
    "not a robot",
    "checking your browser",
    "checking if the site connection is secure",
    "unusual activity",
    "unusual traffic",
    "automated requests",
    "press and hold",
    "complete the security check",
    "human verification",
];

const BLOCKED_TEXT: &[&str] = &[
    "access denied",
    "403 forbidden",
    "you don't have permission",
    "you do not have permission",
    "no longer available",
    "no longer accepting applications",
    "position has been filled",
    "this job has expired",
    "session expired",
    "session has expired",
    "too many requests",
    "something went wrong",
    "an error occurred",
];

const SUCCESS_TEXT: &[&str] = &[
    "thank you for applying",
    "thanks for applying",
    "application submitted",
    "application has been submitted",
    "application was submitted",
    "application received",
    "received your application",
    "successfully submitted",
    "application complete",
    "we'll be in touch",
];

const SUCCESS_URL: &[&str] = &[
    "/success",
    "/confirmation",
    "/thank-you",
    "/thankyou",
    "/thanks",
    "/submitted",
    "/application-submitted",
    "/complete",
];

const ACCEPTED_STATUSES: &[&str] = &["submitted", "complete", "completed", "accepted", "received"];

const CONSENT_MARKERS: &[&str] = &["cookie", "consent", "onetrust", "gdpr"];

const CONSENT_ACCEPT_TEXT: &[&str] = &[
    "accept",
    "accept all",
    "accept all cookies",
    "accept cookies",
    "i accept",
    "i agree",
    "agree",
    "allow all",
    "allow cookies",
    "got it",
    "ok",
];

/// Accept button of a cookie consent banner, if one is showing. The control
/// must carry accept wording and sit in or be named after a consent banner.
pub fn consent_control(snapshot: &Snapshot) -> Option<&Element> {
    snapshot.elements.iter().find(|el| {
        if !el.is_control() || !el.visible || el.disabled {
            return false;
        }
        let naming = format!("{} {}", el.id.as_deref().unwrap_or_default(), el.class_list.join(" ")).to_lowercase();
        let context = el.context.to_lowercase();
        let in_banner = CONSENT_MARKERS
            .iter()
            .any(|m| naming.contains(m) || context.contains(m));
        let text = normalize(&el.text);
        let aria = el.aria_label.as_deref().map(normalize).unwrap_or_default();
        let accepts = CONSENT_ACCEPT_TEXT.contains(&text.as_str())
            || aria.split(' ').any(|w| w == "accept")
            || naming.contains("accept");
        in_banner && accepts
    })
}

pub fn detect(snapshot: &Snapshot) -> Signal {
    if let Some(evidence) = captcha_evidence(snapshot) {
        return Signal::Captcha(evidence);
    }
    if let Some(evidence) = blocked_evidence(snapshot) {
        return Signal::Blocked(evidence);
    }
    if let Some(evidence) = success_evidence(snapshot) {
        return Signal::Success(evidence);
    }
    Signal::None
}

fn challenge_solved(snapshot: &Snapshot) -> bool {
    snapshot.elements.iter().any(|el| {
        let named = [el.name.as_deref(), el.id.as_deref()]
            .into_iter()
            .flatten()
            .any(|n| SOLVED_TOKENS.contains(&n));
        let value = match &el.kind {
            ElementKind::Textarea { value, .. } => value.as_str(),
            ElementKind::Input(fields) => fields.value.as_str(),
            _ => "",
        };
        named && !value.trim().is_empty()
    }) || SOLVED_TOKENS.iter().any(|token| {
        snapshot
            .hidden_data
            .hidden_fields
            .get(*token)
            .is_some_and(|v| !v.trim().is_empty())
    })
}

pub fn captcha_evidence(snapshot: &Snapshot) -> Option<String> {
    let text = snapshot.page_text.to_lowercase();
    if let Some(phrase) = BOT_CHECK_TEXT.iter().find(|p| text.contains(*p)) {
        return Some(format!("bot check text: '{phrase}'"));
    }
    if challenge_solved(snapshot) {
        return None;
    }
    for frame in &snapshot.frames {
        let src = frame.src.to_lowercase();
        if src.contains("size=invisible") {
            continue;
        }
        let title = frame.title.to_lowercase();
        if let Some(pattern) = CHALLENGE_FRAMES.iter().find(|p| src.contains(*p)) {
            return Some(format!("challenge iframe: {pattern}"));
        }
        if frame.visible && (title.contains("recaptcha") || title.contains("hcaptcha")) {
            return Some(format!("challenge iframe titled '{}'", frame.title));
        }
    }
    for node in snapshot.challenge_nodes.iter().filter(|n| n.visible) {
        if node.data_size.as_deref() == Some("invisible") || node.classes.iter().any(|c| c == "grecaptcha-badge") {
            continue;
        }
        let haystack = format!(
            "{} {}",
            node.id.as_deref().unwrap_or_default(),
            node.classes.join(" ")
        )
        .to_lowercase();
        if let Some(marker) = CHALLENGE_MARKERS.iter().find(|m| haystack.contains(*m)) {
            return Some(format!("challenge widget <{}> matching '{marker}'", node.tag));
        }
    }
    None
}

fn failed_application_call(record: &NetworkRecord) -> bool {
    record.status >= 400 && record.is_application_endpoint()
}

pub fn blocked_evidence(snapshot: &Snapshot) -> Option<String> {
    let text = snapshot.page_text.to_lowercase();
    if let Some(phrase) = BLOCKED_TEXT.iter().find(|p| text.contains(*p)) {
        return Some(format!("blocking text: '{phrase}'"));
    }
    snapshot
        .network_records
        .iter()
        .find(|r| failed_application_call(r))
        .map(|r| format!("HTTP {} from {}", r.status, r.url))
}

fn accepted_body(body: &serde_json::Value) -> Option<String> {
    let obj = body.as_object()?;
    if obj.get("applicationSubmitted").and_then(|v| v.as_bool()) == Some(true) {
        return Some("applicationSubmitted=true".into());
    }
    if obj.get("submitted").and_then(|v| v.as_bool()) == Some(true)
        && body.to_string().to_lowercase().contains("application")
    {
        return Some("submitted=true".into());
    }
    let status = obj
        .get("applicationStatus")
        .or_else(|| obj.get("status"))
        .and_then(|v| v.as_str())?
        .to_lowercase();
    ACCEPTED_STATUSES
        .contains(&status.as_str())
        .then(|| format!("status={status}"))
}

pub fn success_evidence(snapshot: &Snapshot) -> Option<String> {
    let text = snapshot.page_text.to_lowercase();
    if let Some(phrase) = SUCCESS_TEXT.iter().find(|p| text.contains(*p)) {
        return Some(format!("confirmation text: '{phrase}'"));
    }
    let url = snapshot.url.to_lowercase();
    let path = url.split(['?', '#']).next().unwrap_or_default();
    if let Some(pattern) = SUCCESS_URL.iter().find(|p| path.contains(*p)) {
        return Some(format!("success url pattern: {pattern}"));
    }
    snapshot
        .network_records
        .iter()
        .filter(|r| r.status < 400 && r.is_application_endpoint())
        .find_map(|r| accepted_body(&r.body).map(|why| format!("{why} from {}", r.url)))
}

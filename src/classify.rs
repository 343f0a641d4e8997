use serde::Serialize;
use tracing::debug;

use crate::detect::{self, Signal};
use crate::purpose::CONFIRM_PASSWORD;
use crate::types::{Element, ElementKind, FlowState, Snapshot};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub state: FlowState,
    pub evidence: String,
    /// True when no rule matched and the previous state was kept.
    pub retained: bool,
}

impl Classification {
    fn matched(state: FlowState, evidence: impl Into<String>) -> Self {
        Self {
            state,
            evidence: evidence.into(),
            retained: false,
        }
    }
}

fn usable(el: &Element) -> bool {
    el.visible && !el.disabled
}

fn has_input(snapshot: &Snapshot, purposes: &[&str]) -> bool {
    snapshot.elements.iter().any(|el| {
        matches!(el.kind, ElementKind::Input(_))
            && usable(el)
            && el.purpose.as_deref().is_some_and(|p| purposes.contains(&p))
    })
}

pub fn has_control(snapshot: &Snapshot, purpose: &str) -> bool {
    snapshot
        .elements
        .iter()
        .any(|el| el.is_control() && usable(el) && el.has_purpose(purpose))
}

pub fn classify(snapshot: &Snapshot, previous: FlowState) -> Classification {
    classify_with_signal(snapshot, previous, &detect::detect(snapshot))
}

/// Rules are tried in order and the first match wins: detector signal,
/// sign-in, unsatisfied required field, submit control, apply control.
pub fn classify_with_signal(snapshot: &Snapshot, previous: FlowState, signal: &Signal) -> Classification {
    match signal {
        Signal::Captcha(evidence) => return Classification::matched(FlowState::Captcha, evidence.clone()),
        Signal::Blocked(evidence) => return Classification::matched(FlowState::Blocked, evidence.clone()),
        Signal::Success(evidence) => return Classification::matched(FlowState::Confirmation, evidence.clone()),
        Signal::None => {}
    }

    if has_input(snapshot, &["password"]) && has_input(snapshot, &["email", "username"]) {
        if has_input(snapshot, &[CONFIRM_PASSWORD]) {
            return Classification::matched(FlowState::SignUp, "password confirmation field");
        }
        if has_control(snapshot, "signup") && !has_control(snapshot, "signin") {
            return Classification::matched(FlowState::SignUp, "credential fields with a sign-up control");
        }
        return Classification::matched(FlowState::SignIn, "password and email/username fields");
    }

    let missing = snapshot.unsatisfied_required();
    if let Some(first) = missing.first() {
        return Classification::matched(
            FlowState::FormFill,
            format!("{} unsatisfied required field(s), first {}", missing.len(), first.describe()),
        );
    }

    if has_control(snapshot, "submit") {
        return Classification::matched(FlowState::Review, "submit control with nothing left to fill");
    }

    if has_control(snapshot, "apply") {
        return Classification::matched(FlowState::Listing, "apply control");
    }

    debug!(previous = %previous, "no classification rule matched, keeping previous state");
    Classification {
        state: previous,
        evidence: "no rule matched".into(),
        retained: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::snapshot_from_html;

    fn page(body: &str) -> Snapshot {
        snapshot_from_html("https://jobs.acme.test/x", &format!("<html><body>{body}</body></html>"))
    }

    #[test]
    fn apply_button_is_listing() {
        let snapshot = page("<h1>Senior Engineer</h1><button>Apply Now</button>");
        let c = classify(&snapshot, FlowState::Initial);
        assert_eq!(c.state, FlowState::Listing);
        assert!(!c.retained);
    }

    #[test]
    fn credentials_are_sign_in() {
        let snapshot = page(
            r#"<input type="email" required><input type="password" required><button>Sign In</button>"#,
        );
        assert_eq!(classify(&snapshot, FlowState::Listing).state, FlowState::SignIn);
    }

    #[test]
    fn confirm_password_is_sign_up() {
        let snapshot = page(
            r#"<input type="email" required>
               <label for="p1">Password</label><input id="p1" type="password" required>
               <label for="p2">Confirm password</label><input id="p2" type="password" required>
               <button>Sign In</button>"#,
        );
        assert_eq!(classify(&snapshot, FlowState::Listing).state, FlowState::SignUp);
    }

    #[test]
    fn signup_control_without_signin_is_sign_up() {
        let snapshot = page(r#"<input type="email"><input type="password"><button>Create account</button>"#);
        assert_eq!(classify(&snapshot, FlowState::Listing).state, FlowState::SignUp);
    }

    #[test]
    fn required_field_beats_submit() {
        let snapshot = page(r#"<label for="a">City *</label><input id="a"><button type="submit">Submit</button>"#);
        assert_eq!(classify(&snapshot, FlowState::Listing).state, FlowState::FormFill);
    }

    #[test]
    fn filled_form_with_submit_is_review() {
        let snapshot = page(r#"<input required value="Berlin" name="city"><button type="submit">Submit</button>"#);
        assert_eq!(classify(&snapshot, FlowState::FormFill).state, FlowState::Review);
    }

    #[test]
    fn ambiguous_page_keeps_previous_state() {
        let snapshot = page("<p>Loading...</p>");
        let c = classify(&snapshot, FlowState::FormFill);
        assert_eq!(c.state, FlowState::FormFill);
        assert!(c.retained);
    }

    #[test]
    fn captcha_beats_confirmation() {
        let snapshot = page(
            r#"<p>Thank you for applying</p><iframe src="https://www.google.com/recaptcha/api2/anchor?k=1"></iframe>"#,
        );
        assert_eq!(classify(&snapshot, FlowState::Review).state, FlowState::Captcha);
    }

    #[test]
    fn disabled_apply_is_ignored() {
        let snapshot = page("<button disabled>Apply</button>");
        assert_eq!(classify(&snapshot, FlowState::Initial).state, FlowState::Initial);
    }
}

//! Action planner: proposes ordered candidates for the classified state.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::detect;
use crate::purpose::{contains_word, normalize, CONFIRM_PASSWORD};
use crate::profile::ProfileProvider;
use crate::types::{
    is_placeholder_choice, Action, Candidate, Direction, Element, ElementKind, FlaggedField, FlowState, SelectChoice,
    Snapshot, Target,
};

#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub candidates: Vec<Candidate>,
    /// Fields filled without a semantic signal.
    pub flagged: Vec<FlaggedField>,
    /// Set when local planning could not map everything it saw.
    pub needs_escalation: bool,
}

pub struct Planner {
    profile: Arc<dyn ProfileProvider>,
    fallback_text: String,
}

/// Lexical similarity in `0.0..=1.0` between an option and a wanted value.
pub fn option_score(option: &str, wanted: &str) -> f32 {
    let a = normalize(option);
    let b = normalize(wanted);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    if contains_word(&a, &b) || contains_word(&b, &a) {
        let (short, long) = if a.len() < b.len() { (a.len(), b.len()) } else { (b.len(), a.len()) };
        return 0.5 + 0.4 * short as f32 / long as f32;
    }
    let wa: BTreeSet<&str> = a.split(' ').collect();
    let wb: BTreeSet<&str> = b.split(' ').collect();
    let shared = wa.intersection(&wb).count() as f32;
    let union = wa.union(&wb).count() as f32;
    0.5 * shared / union
}

/// Best option for `wanted`, ignoring placeholders. `None` when nothing
/// shares a word with it.
pub fn best_option<'a>(options: &'a [SelectChoice], wanted: &str) -> Option<&'a SelectChoice> {
    let mut best: Option<(&SelectChoice, f32)> = None;
    for opt in options.iter().filter(|o| !is_placeholder(o)) {
        let score = option_score(&opt.text, wanted).max(option_score(&opt.value, wanted));
        if score > 0.0 && best.is_none_or(|(_, s)| score > s) {
            best = Some((opt, score));
        }
    }
    best.map(|(opt, _)| opt)
}

fn is_placeholder(opt: &SelectChoice) -> bool {
    opt.value.trim().is_empty() || is_placeholder_choice(&opt.text)
}

fn usable(el: &Element) -> bool {
    !el.disabled && el.is_reachable()
}

fn click(el: &Element, reason: impl Into<String>) -> Candidate {
    Candidate::single(
        Action::ClickButton {
            target: Target::for_element(el),
        },
        reason,
    )
}

/// Usable controls with `purpose`, strongest purpose signal first, then DOM order.
fn controls<'a>(snapshot: &'a Snapshot, purpose: &str) -> Vec<&'a Element> {
    let mut found: Vec<&Element> = snapshot
        .elements
        .iter()
        .filter(|el| el.is_control() && el.visible && !el.disabled && el.has_purpose(purpose))
        .collect();
    found.sort_by_key(|el| std::cmp::Reverse(el.purpose_source.map(|s| s.confidence()).unwrap_or(0)));
    found
}

fn first_control<'a>(snapshot: &'a Snapshot, purposes: &[&str]) -> Option<&'a Element> {
    purposes.iter().find_map(|p| controls(snapshot, p).into_iter().next())
}

fn first_input<'a>(snapshot: &'a Snapshot, purposes: &[&str]) -> Option<&'a Element> {
    purposes.iter().find_map(|p| {
        snapshot
            .elements
            .iter()
            .find(|el| matches!(el.kind, ElementKind::Input(_)) && usable(el) && el.has_purpose(p))
    })
}

enum FieldPlan {
    Mapped(Candidate),
    Fallback(Candidate, FlaggedField),
    Unmapped(FlaggedField),
}

impl Planner {
    pub fn new(profile: Arc<dyn ProfileProvider>, fallback_text: impl Into<String>) -> Self {
        Self {
            profile,
            fallback_text: fallback_text.into(),
        }
    }

    pub fn plan(&self, state: FlowState, snapshot: &Snapshot) -> Plan {
        let mut plan = match state {
            FlowState::Listing => self.plan_listing(snapshot),
            FlowState::SignIn => self.plan_sign_in(snapshot),
            FlowState::SignUp => self.plan_sign_up(snapshot),
            FlowState::FormFill => self.plan_form(snapshot),
            FlowState::Review => self.plan_review(snapshot),
            FlowState::Initial => self.plan_initial(snapshot),
            FlowState::Captcha | FlowState::Confirmation | FlowState::Blocked => return Plan::default(),
        };
        plan.needs_escalation = plan.needs_escalation || plan.candidates.is_empty();
        if let Some(banner) = detect::consent_control(snapshot) {
            info!(control = %banner.describe(), "cookie consent banner showing, accepting first");
            plan.candidates.insert(0, click(banner, "dismiss cookie consent"));
        }
        plan
    }

    fn plan_listing(&self, snapshot: &Snapshot) -> Plan {
        let candidates = controls(snapshot, "apply")
            .first()
            .map(|el| vec![click(el, "open the application")])
            .unwrap_or_default();
        Plan {
            candidates,
            ..Default::default()
        }
    }

    fn plan_review(&self, snapshot: &Snapshot) -> Plan {
        let candidates = controls(snapshot, "submit")
            .first()
            .map(|el| vec![click(el, "submit the application")])
            .unwrap_or_default();
        Plan {
            candidates,
            ..Default::default()
        }
    }

    fn plan_initial(&self, snapshot: &Snapshot) -> Plan {
        let mut candidates: Vec<Candidate> = ["apply", "next"]
            .iter()
            .filter_map(|p| controls(snapshot, p).into_iter().next())
            .map(|el| click(el, "explore from the start page"))
            .collect();
        if candidates.is_empty() && !snapshot.elements.iter().any(|el| el.visible) {
            candidates.push(Candidate::single(
                Action::Navigate {
                    direction: Direction::Reload,
                },
                "nothing actionable rendered yet",
            ));
        }
        Plan {
            candidates,
            ..Default::default()
        }
    }

    /// Fill identity, fill password, press the sign-in control, as one unit.
    fn plan_sign_in(&self, snapshot: &Snapshot) -> Plan {
        let Some(identity) = first_input(snapshot, &["email", "username"]) else {
            return Plan::default();
        };
        let Some(password_field) = first_input(snapshot, &["password"]) else {
            return Plan::default();
        };
        let identity_purpose = identity.purpose.as_deref().unwrap_or("email");
        let Some(identity_value) = self.profile.value_for(identity_purpose) else {
            warn!(purpose = identity_purpose, "no profile value for sign-in identity");
            return Plan::default();
        };
        let Some(password) = self.profile.password() else {
            warn!("sign-in page reached but no password is configured");
            return Plan::default();
        };
        let submit = first_control(snapshot, &["signin", "submit", "next"])
            .map(Target::for_element)
            .unwrap_or_else(|| Target::control("signin", None));

        let candidate = Candidate {
            actions: vec![
                Action::FillInput {
                    target: Target::for_element(identity),
                    value: identity_value,
                },
                Action::FillInput {
                    target: Target::for_element(password_field),
                    value: password,
                },
                Action::ClickButton { target: submit },
            ],
            reason: "sign in".into(),
            fallback: false,
        };
        Plan {
            candidates: vec![candidate],
            ..Default::default()
        }
    }

    /// Prefer switching to an existing account; otherwise register.
    fn plan_sign_up(&self, snapshot: &Snapshot) -> Plan {
        let mut candidates = Vec::new();
        if let Some(switch) = controls(snapshot, "signin").first() {
            candidates.push(click(switch, "switch to sign in with the existing account"));
        }
        let email = first_input(snapshot, &["email", "username"]);
        let email_value = email.and_then(|el| self.profile.value_for(el.purpose.as_deref().unwrap_or("email")));
        match (email, email_value, self.profile.password()) {
            (Some(email), Some(email_value), Some(password)) => {
                let mut actions = vec![Action::FillInput {
                    target: Target::for_element(email),
                    value: email_value,
                }];
                for field in snapshot.elements.iter().filter(|el| {
                    matches!(el.kind, ElementKind::Input(_))
                        && usable(el)
                        && (el.has_purpose("password") || el.has_purpose(CONFIRM_PASSWORD))
                }) {
                    actions.push(Action::FillInput {
                        target: Target::for_element(field),
                        value: password.clone(),
                    });
                }
                let submit = first_control(snapshot, &["signup", "submit", "next"])
                    .map(Target::for_element)
                    .unwrap_or_else(|| Target::control("signup", None));
                actions.push(Action::ClickButton { target: submit });
                candidates.push(Candidate {
                    actions,
                    reason: "create an account".into(),
                    fallback: false,
                });
            }
            _ => warn!("sign-up page reached without an email and password to register with"),
        }
        Plan {
            candidates,
            ..Default::default()
        }
    }

    /// Required fields first (DOM order), then optional fields the profile
    /// knows, then the advance control, then generic fallbacks.
    fn plan_form(&self, snapshot: &Snapshot) -> Plan {
        let mut plan = Plan::default();
        let mut fallbacks = Vec::new();

        for el in snapshot.unsatisfied_required() {
            match self.plan_field(snapshot, el) {
                FieldPlan::Mapped(candidate) => plan.candidates.push(candidate),
                FieldPlan::Fallback(candidate, flag) => {
                    fallbacks.push(candidate);
                    plan.flagged.push(flag);
                }
                FieldPlan::Unmapped(flag) => {
                    plan.flagged.push(flag);
                    plan.needs_escalation = true;
                }
            }
        }

        for el in snapshot.elements.iter().filter(|el| {
            !el.required
                && el.is_fillable()
                && usable(el)
                && !snapshot.is_satisfied(el)
                && !matches!(el.kind, ElementKind::Checkbox { .. } | ElementKind::Radio { .. })
        }) {
            if let Some(candidate) = self.plan_optional(el) {
                plan.candidates.push(candidate);
            }
        }

        if let Some(advance) = first_control(snapshot, &["next", "submit"]) {
            plan.candidates.push(click(advance, "advance to the next step"));
        }

        if !fallbacks.is_empty() {
            plan.needs_escalation = true;
        }
        plan.candidates.extend(fallbacks);
        plan
    }

    fn value_for(&self, el: &Element) -> Option<String> {
        let purpose = el.purpose.as_deref()?;
        if purpose == "password" || purpose == CONFIRM_PASSWORD {
            return self.profile.password();
        }
        self.profile.value_for(purpose)
    }

    fn fallback_value(&self, el: &Element) -> String {
        match el.input() {
            Some(fields) if fields.input_type == "number" => "0".to_string(),
            _ => self.fallback_text.clone(),
        }
    }

    fn flag(el: &Element, value: &str, reason: &str) -> FlaggedField {
        FlaggedField {
            field: el.describe(),
            purpose: el.purpose.clone(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    fn plan_field(&self, snapshot: &Snapshot, el: &Element) -> FieldPlan {
        let target = Target::for_element(el);
        let purpose = el.purpose.as_deref().unwrap_or("unknown");
        match &el.kind {
            ElementKind::Input(_) | ElementKind::Textarea { .. } => match self.value_for(el) {
                Some(value) => FieldPlan::Mapped(Candidate::single(
                    Action::FillInput { target, value },
                    format!("required {purpose}"),
                )),
                None => {
                    let value = self.fallback_value(el);
                    let flag = Self::flag(el, &value, "no profile value, generic text used");
                    let mut candidate =
                        Candidate::single(Action::FillInput { target, value }, format!("fallback for {purpose}"));
                    candidate.fallback = true;
                    FieldPlan::Fallback(candidate, flag)
                }
            },
            ElementKind::Select { options, .. } => {
                let wanted = self.value_for(el);
                if let Some(choice) = wanted.as_deref().and_then(|w| best_option(options, w)) {
                    return FieldPlan::Mapped(Candidate::single(
                        Action::SelectOption {
                            target,
                            value: choice.value.clone(),
                        },
                        format!("required {purpose}"),
                    ));
                }
                let Some(first) = options.iter().find(|o| !is_placeholder(o)) else {
                    return FieldPlan::Unmapped(Self::flag(el, "", "select has no usable option"));
                };
                info!(
                    field = %el.describe(),
                    option = %first.text,
                    wanted = wanted.as_deref().unwrap_or("<none>"),
                    "no matching profile value, choosing the first non-empty option"
                );
                let flag = Self::flag(el, &first.text, "first non-empty option chosen");
                let mut candidate = Candidate::single(
                    Action::SelectOption {
                        target,
                        value: first.value.clone(),
                    },
                    format!("fallback for {purpose}"),
                );
                candidate.fallback = true;
                FieldPlan::Fallback(candidate, flag)
            }
            ElementKind::FileUpload { .. } => {
                let file_purpose = el.purpose.as_deref().unwrap_or("resume");
                match self.profile.file_for(file_purpose) {
                    Some(path) if el.purpose.is_some() => FieldPlan::Mapped(Candidate::single(
                        Action::UploadFile { target, path },
                        format!("required {file_purpose} upload"),
                    )),
                    Some(path) => {
                        let flag = Self::flag(el, &path.display().to_string(), "unlabelled upload, resume used");
                        let mut candidate =
                            Candidate::single(Action::UploadFile { target, path }, "fallback upload");
                        candidate.fallback = true;
                        FieldPlan::Fallback(candidate, flag)
                    }
                    None => FieldPlan::Unmapped(Self::flag(el, "", "no file configured")),
                }
            }
            ElementKind::Checkbox { .. } => {
                let candidate = Candidate::single(Action::ClickButton { target }, format!("tick required {purpose}"));
                if el.purpose.is_some() {
                    FieldPlan::Mapped(candidate)
                } else {
                    let flag = Self::flag(el, "checked", "required checkbox without a known meaning");
                    FieldPlan::Fallback(Candidate { fallback: true, ..candidate }, flag)
                }
            }
            ElementKind::Radio { .. } => self.plan_radio(snapshot, el),
            ElementKind::Button { .. } | ElementKind::Link { .. } => {
                FieldPlan::Unmapped(Self::flag(el, "", "not a form field"))
            }
        }
    }

    fn plan_radio(&self, snapshot: &Snapshot, el: &Element) -> FieldPlan {
        let group: Vec<&Element> = match el.name.as_deref() {
            Some(name) => snapshot
                .elements
                .iter()
                .filter(|other| {
                    other.name.as_deref() == Some(name)
                        && matches!(other.kind, ElementKind::Radio { .. })
                        && usable(other)
                })
                .collect(),
            None => vec![el],
        };
        let purpose = el.purpose.as_deref().unwrap_or("unknown");
        let radio_text = |r: &Element| {
            let value = match &r.kind {
                ElementKind::Radio { value, .. } => value.clone().unwrap_or_default(),
                _ => String::new(),
            };
            (r.label.clone().unwrap_or_default(), value)
        };
        if let Some(wanted) = self.value_for(el) {
            let best = group
                .iter()
                .map(|r| {
                    let (label, value) = radio_text(r);
                    (*r, option_score(&label, &wanted).max(option_score(&value, &wanted)))
                })
                .filter(|(_, score)| *score > 0.0)
                .fold(None::<(&Element, f32)>, |best, (r, score)| match best {
                    Some((_, s)) if s >= score => best,
                    _ => Some((r, score)),
                });
            if let Some((radio, _)) = best {
                return FieldPlan::Mapped(Candidate::single(
                    Action::ClickButton {
                        target: Target::for_element(radio),
                    },
                    format!("required {purpose} choice"),
                ));
            }
        }
        let Some(first) = group.first() else {
            return FieldPlan::Unmapped(Self::flag(el, "", "radio group has no usable option"));
        };
        let (label, _) = radio_text(first);
        info!(field = %el.describe(), option = %label, "no profile answer, choosing the first radio option");
        let flag = Self::flag(el, &label, "first radio option chosen");
        let mut candidate = Candidate::single(
            Action::ClickButton {
                target: Target::for_element(first),
            },
            format!("fallback for {purpose}"),
        );
        candidate.fallback = true;
        FieldPlan::Fallback(candidate, flag)
    }

    fn plan_optional(&self, el: &Element) -> Option<Candidate> {
        let purpose = el.purpose.as_deref()?;
        if purpose.starts_with("password") {
            return None;
        }
        let target = Target::for_element(el);
        let reason = format!("optional {purpose}");
        match &el.kind {
            ElementKind::Input(_) | ElementKind::Textarea { .. } => {
                let value = self.profile.value_for(purpose)?;
                Some(Candidate::single(Action::FillInput { target, value }, reason))
            }
            ElementKind::Select { options, .. } => {
                let wanted = self.profile.value_for(purpose)?;
                let choice = best_option(options, &wanted)?;
                Some(Candidate::single(
                    Action::SelectOption {
                        target,
                        value: choice.value.clone(),
                    },
                    reason,
                ))
            }
            ElementKind::FileUpload { .. } => {
                let path = self.profile.file_for(purpose)?;
                Some(Candidate::single(Action::UploadFile { target, path }, reason))
            }
            _ => None,
        }
    }
}

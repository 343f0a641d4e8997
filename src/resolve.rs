//! Element resolver: maps a semantic [`Target`] onto one element of a fresh
//! capture. Pure read; the executor performs the effect.

use tracing::debug;

use crate::error::ResolveError;
use crate::purpose::{contains_word, keywords_for, normalize, split_identifier};
use crate::types::{Element, PurposeSource, Target, TargetKind};

#[derive(Debug, Clone, Copy)]
pub struct Resolution<'a> {
    pub element: &'a Element,
    pub strategy: &'static str,
}

type Strategy = (&'static str, fn(&Element, &Target) -> bool);

const FIELD_STRATEGIES: &[Strategy] = &[
    ("autocomplete", |el, t| sourced(el, t, PurposeSource::Autocomplete)),
    ("type", |el, t| sourced(el, t, PurposeSource::InputType)),
    ("label", |el, t| {
        sourced(el, t, PurposeSource::Label) || text_equals(el.label.as_deref(), t)
    }),
    ("placeholder", |el, t| {
        sourced(el, t, PurposeSource::Placeholder) || text_equals(el.placeholder(), t)
    }),
    ("name/id", |el, t| {
        sourced(el, t, PurposeSource::NameOrId)
            || text_equals(el.name.as_deref(), t)
            || text_equals(el.id.as_deref(), t)
            || text_equals(el.name.as_deref().map(split_identifier).as_deref(), t)
    }),
    ("aria-label", |el, t| {
        sourced(el, t, PurposeSource::AriaLabel) || text_equals(el.aria_label.as_deref(), t)
    }),
    ("context", |el, t| {
        sourced(el, t, PurposeSource::Context) || text_within(Some(el.context.as_str()), t)
    }),
];

const CONTROL_STRATEGIES: &[Strategy] = &[
    ("exact text", |el, t| {
        text_equals(Some(el.text.as_str()), t) || (t.text.is_none() && keyword_equals(&el.text, t))
    }),
    ("partial text", |el, t| text_within(Some(el.text.as_str()), t) || keyword_within(&el.text, t)),
    ("aria-label", |el, t| {
        let aria = el.aria_label.as_deref().unwrap_or_default();
        text_within(Some(aria), t) || keyword_within(aria, t)
    }),
    ("text proximity", |el, t| text_within(Some(el.context.as_str()), t)),
    ("data-action", |el, t| {
        let action = el.data_attributes.get("action").map(|a| split_identifier(a)).unwrap_or_default();
        text_within(Some(action.as_str()), t) || keyword_within(&action, t)
    }),
    ("purpose", |el, t| t.purpose.is_some() && el.purpose == t.purpose),
];

/// Elements carrying a different detected purpose never match by text.
fn compatible(el: &Element, target: &Target) -> bool {
    match (&target.purpose, &el.purpose) {
        (Some(wanted), Some(found)) => wanted == found,
        _ => true,
    }
}

fn sourced(el: &Element, target: &Target, source: PurposeSource) -> bool {
    target.purpose.is_some() && el.purpose == target.purpose && el.purpose_source == Some(source)
}

fn text_equals(signal: Option<&str>, target: &Target) -> bool {
    match (signal, target.text.as_deref()) {
        (Some(signal), Some(text)) => {
            let signal = normalize(signal);
            !signal.is_empty() && signal == normalize(text)
        }
        _ => false,
    }
}

fn text_within(signal: Option<&str>, target: &Target) -> bool {
    match (signal, target.text.as_deref()) {
        (Some(signal), Some(text)) => contains_word(signal, text),
        _ => false,
    }
}

fn keyword_equals(signal: &str, target: &Target) -> bool {
    let signal = normalize(signal);
    !signal.is_empty()
        && target
            .purpose
            .as_deref()
            .is_some_and(|p| keywords_for(p).iter().any(|k| normalize(k) == signal))
}

fn keyword_within(signal: &str, target: &Target) -> bool {
    target
        .purpose
        .as_deref()
        .is_some_and(|p| keywords_for(p).iter().any(|k| contains_word(signal, k)))
}

fn eligible(el: &Element, target: &Target) -> bool {
    target.kind.accepts(el) && !el.disabled && el.is_reachable() && compatible(el, target)
}

/// Elements sharing the target's scope. Falls back to every element when the
/// scope is gone, e.g. after the page renamed its fields.
fn scoped<'a>(elements: &'a [Element], target: &Target) -> Vec<&'a Element> {
    if let Some(scope) = target.scope.as_deref() {
        let within: Vec<&Element> = elements
            .iter()
            .filter(|el| el.scope_key().as_deref() == Some(scope) && eligible(el, target))
            .collect();
        if !within.is_empty() {
            return within;
        }
        debug!(target = %target, scope, "scope not found on the page, matching across all elements");
    }
    elements.iter().collect()
}

/// Tries the strategies for the target's kind in order. Within the first
/// strategy that matches, the earliest element in DOM order wins.
pub fn resolve<'a>(elements: &'a [Element], target: &Target) -> Result<Resolution<'a>, ResolveError> {
    let strategies = match target.kind {
        TargetKind::Control => CONTROL_STRATEGIES,
        TargetKind::Field | TargetKind::Select | TargetKind::File | TargetKind::Toggle => FIELD_STRATEGIES,
    };
    let pool = scoped(elements, target);
    for &(name, check) in strategies {
        let mut hits = pool
            .iter()
            .copied()
            .filter(|el| eligible(el, target) && check(el, target));
        let Some(first) = hits.next() else {
            continue;
        };
        let others = hits.count();
        if others > 0 {
            debug!(
                target = %target,
                strategy = name,
                matches = others + 1,
                chosen = %first.describe(),
                "ambiguous target, taking the first in document order"
            );
        }
        return Ok(Resolution {
            element: first,
            strategy: name,
        });
    }
    Err(ResolveError::NotFound(target.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::snapshot_from_html;

    fn elements(body: &str) -> Vec<Element> {
        snapshot_from_html("https://x", &format!("<html><body>{body}</body></html>")).elements
    }

    #[test]
    fn autocomplete_wins_over_label() {
        let els = elements(
            r#"<label for="a">Email</label><input id="a" name="a">
               <input id="b" autocomplete="email">"#,
        );
        let target = Target::new(TargetKind::Field, Some("email"), Some("Email"));
        let res = resolve(&els, &target).expect("resolves");
        assert_eq!(res.strategy, "autocomplete");
        assert_eq!(res.element.id.as_deref(), Some("b"));
    }

    #[test]
    fn label_text_without_purpose() {
        let els = elements(r#"<label for="q">Favourite colour</label><input id="q">"#);
        let target = Target::new(TargetKind::Field, None, Some("Favourite colour"));
        assert_eq!(resolve(&els, &target).expect("resolves").strategy, "label");
    }

    #[test]
    fn control_exact_then_partial() {
        let els = elements(r#"<button>Apply for this role</button><a href="/x">Apply</a>"#);
        let exact = Target::control("apply", Some("Apply"));
        let res = resolve(&els, &exact).expect("resolves");
        assert_eq!(res.strategy, "exact text");
        assert_eq!(res.element.tag, "a");

        let partial = Target::control("apply", Some("for this role"));
        let res = resolve(&els, &partial).expect("resolves");
        assert_eq!(res.strategy, "partial text");
        assert_eq!(res.element.tag, "button");
    }

    #[test]
    fn purpose_keywords_find_renamed_controls() {
        let els = elements(r#"<button>Cancel</button><button>Log in</button>"#);
        let target = Target::control("signin", None);
        let res = resolve(&els, &target).expect("resolves");
        assert_eq!(res.element.text, "Log in");
    }

    #[test]
    fn aria_and_data_action() {
        let els = elements(
            r#"<button aria-label="Continue to next step">→</button>
               <div role="button" data-action="submit-form">✓</div>"#,
        );
        let next = resolve(&els, &Target::control("next", None)).expect("next");
        assert_eq!(next.strategy, "aria-label");
        let submit = resolve(&els, &Target::control("submit", None)).expect("submit");
        assert_eq!(submit.strategy, "data-action");
    }

    #[test]
    fn disabled_and_invisible_are_skipped() {
        let els = elements(
            r#"<button disabled>Next</button>
               <button style="display:none">Next</button>
               <input type="file" id="cv" style="display:none" name="resume">"#,
        );
        assert!(resolve(&els, &Target::control("next", Some("Next"))).is_err());
        let file = resolve(&els, &Target::new(TargetKind::File, Some("resume"), None)).expect("file");
        assert_eq!(file.element.id.as_deref(), Some("cv"));
    }

    #[test]
    fn radios_resolve_within_their_group() {
        let els = elements(
            r#"<fieldset><legend>Are you willing to relocate?</legend>
                 <label><input type="radio" name="r1" value="y"> Yes</label>
                 <label><input type="radio" name="r1" value="n"> No</label></fieldset>
               <fieldset><legend>Do you require sponsorship?</legend>
                 <label><input type="radio" name="s1" value="y"> Yes</label>
                 <label><input type="radio" name="s1" value="n"> No</label></fieldset>"#,
        );
        let target = Target::new(TargetKind::Toggle, Some("sponsorship"), Some("Yes"));
        let res = resolve(&els, &target).expect("resolves");
        assert_eq!(res.element.name.as_deref(), Some("s1"));
        assert_eq!(res.strategy, "label");
    }

    #[test]
    fn same_label_resolves_inside_the_planned_group() {
        let els = elements(
            r#"<fieldset><legend>Have you worked here before?</legend>
                 <label><input type="radio" name="worked" value="y"> Yes</label>
                 <label><input type="radio" name="worked" value="n"> No</label></fieldset>
               <fieldset><legend>Do you hold a driving licence?</legend>
                 <label><input type="radio" name="licence" value="y"> Yes</label>
                 <label><input type="radio" name="licence" value="n"> No</label></fieldset>"#,
        );
        let second_yes = els
            .iter()
            .find(|el| el.name.as_deref() == Some("licence") && el.label.as_deref() == Some("Yes"))
            .expect("second group");
        let target = Target::for_element(second_yes);
        assert_eq!(target.scope.as_deref(), Some("licence"));
        let res = resolve(&els, &target).expect("resolves");
        assert_eq!(res.element.name.as_deref(), Some("licence"));
    }

    #[test]
    fn repeated_labels_resolve_by_id() {
        let els = elements(
            r#"<label for="o1">Please specify</label><input id="o1">
               <label for="o2">Please specify</label><input id="o2">"#,
        );
        let second = els.iter().find(|el| el.id.as_deref() == Some("o2")).expect("o2");
        let target = Target::for_element(second);
        let res = resolve(&els, &target).expect("resolves");
        assert_eq!(res.element.id.as_deref(), Some("o2"));
    }

    #[test]
    fn vanished_scope_falls_back_to_text() {
        let els = elements(r#"<label for="q">Favourite colour</label><input id="q">"#);
        let mut target = Target::new(TargetKind::Field, None, Some("Favourite colour"));
        target.scope = Some("renamed".into());
        assert_eq!(resolve(&els, &target).expect("resolves").element.id.as_deref(), Some("q"));
    }

    #[test]
    fn missing_target_is_not_found() {
        let els = elements("<p>nothing here</p>");
        let err = resolve(&els, &Target::control("submit", Some("Submit"))).unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
    }

    #[test]
    fn ambiguous_match_takes_first() {
        let els = elements(r#"<button id="one">Next</button><button id="two">Next</button>"#);
        let res = resolve(&els, &Target::control("next", Some("Next"))).expect("resolves");
        assert_eq!(res.element.id.as_deref(), Some("one"));
    }
}

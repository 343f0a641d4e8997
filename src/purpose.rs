//! Purpose detection: a best-effort semantic label per element.
//!
//! Every function here looks only at the element itself (attributes, label,
//! surrounding text), so the same element always yields the same purpose.

use crate::types::{Element, ElementKind, PurposeSource};

type Table = &'static [(&'static str, &'static [&'static str])];

pub const CONFIRM_PASSWORD: &str = "password-confirm";

/// Text-like inputs. Table order breaks ties inside one signal.
pub const FIELD_PURPOSES: Table = &[
    ("email", &["email", "e-mail", "email address"]),
    ("password", &["password", "passwd", "pwd", "passcode"]),
    ("username", &["username", "user name", "user id", "login id"]),
    ("given-name", &["first name", "firstname", "fname", "given name", "forename"]),
    ("family-name", &["last name", "lastname", "lname", "surname", "family name"]),
    ("tel", &["phone", "telephone", "mobile", "cell", "phone number"]),
    ("linkedin", &["linkedin"]),
    ("github", &["github"]),
    ("url", &["website", "portfolio", "url", "personal site", "homepage"]),
    ("company", &["company", "employer", "organization", "organisation"]),
    ("address-level2", &["city", "town"]),
    ("address-level1", &["state", "province", "region"]),
    ("postal-code", &["zip", "zipcode", "postal", "postcode", "zip code"]),
    ("country", &["country"]),
    ("address-line1", &["address", "street"]),
    ("resume", &["resume", "cv", "résumé"]),
    ("cover-letter", &["cover letter", "coverletter"]),
    (
        "additional-info",
        &["additional information", "anything else", "comments", "message", "summary", "why"],
    ),
    ("name", &["full name", "name", "your name", "legal name"]),
];

/// Selects, checkboxes and radios. Sponsorship precedes work authorization
/// because sponsorship questions usually mention visas too.
pub const CHOICE_PURPOSES: Table = &[
    (
        "consent",
        &["i agree", "agree", "consent", "acknowledge", "terms", "privacy policy", "certify"],
    ),
    ("sponsorship", &["sponsorship", "sponsor", "require sponsorship"]),
    (
        "work-authorization",
        &[
            "work authorization",
            "authorized to work",
            "legally authorized",
            "eligible to work",
            "right to work",
            "visa",
        ],
    ),
    ("gender", &["gender", "sex", "pronouns"]),
    ("veteran", &["veteran", "military", "protected veteran"]),
    ("disability", &["disability", "disabled"]),
    ("race", &["race", "ethnicity", "hispanic", "latino"]),
    ("relocation", &["relocate", "relocation"]),
    ("education", &["education", "degree", "highest level"]),
    ("experience", &["experience", "years"]),
    ("source", &["how did you hear", "hear about", "referral source", "source"]),
];

pub const FILE_PURPOSES: Table = &[
    ("cover-letter", &["cover letter", "coverletter", "cover"]),
    ("resume", &["resume", "cv", "résumé"]),
];

/// Buttons and links. Submit precedes apply so "Submit application" ends a
/// flow instead of starting one.
pub const BUTTON_PURPOSES: Table = &[
    (
        "submit",
        &["submit", "submit application", "send application", "send", "confirm", "finish"],
    ),
    (
        "apply",
        &["apply", "apply now", "start application", "apply for this job", "easy apply"],
    ),
    (
        "next",
        &["next", "continue", "proceed", "save and continue", "save continue", "next step"],
    ),
    ("back", &["back", "previous", "go back"]),
    ("signin", &["sign in", "log in", "login", "signin", "logon"]),
    (
        "signup",
        &["sign up", "register", "create account", "signup", "create an account"],
    ),
    ("cancel", &["cancel", "close", "dismiss"]),
    ("save", &["save", "save draft"]),
    ("upload", &["upload", "choose file", "attach"]),
];

const CONFIRM_HINTS: &[&str] = &["confirm", "re enter", "reenter", "repeat", "verify", "again", "retype"];

/// Lowercases, turns punctuation into spaces and collapses runs of spaces.
pub fn normalize(text: &str) -> String {
    let lowered: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Splits identifiers such as `firstName`, `first_name` or `applicant[email]`
/// into words.
pub fn split_identifier(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len() + 8);
    let mut prev_lower = false;
    for c in ident.chars() {
        if matches!(c, '_' | '-' | '.' | '[' | ']') {
            out.push(' ');
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower {
            out.push(' ');
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        out.push(c);
    }
    normalize(&out)
}

/// Case-insensitive, word-bounded containment.
pub fn contains_word(haystack: &str, keyword: &str) -> bool {
    let hay = normalize(haystack);
    let needle = normalize(keyword);
    if hay.is_empty() || needle.is_empty() {
        return false;
    }
    format!(" {hay} ").contains(&format!(" {needle} "))
}

fn lookup(table: Table, text: &str) -> Option<&'static str> {
    if text.trim().is_empty() {
        return None;
    }
    let hay = format!(" {} ", normalize(text));
    table.iter().find_map(|(purpose, keywords)| {
        keywords
            .iter()
            .any(|k| hay.contains(&format!(" {} ", normalize(k))))
            .then_some(*purpose)
    })
}

/// Keywords of a purpose across all tables.
pub fn keywords_for(purpose: &str) -> Vec<&'static str> {
    [FIELD_PURPOSES, CHOICE_PURPOSES, FILE_PURPOSES, BUTTON_PURPOSES]
        .iter()
        .flat_map(|table| table.iter())
        .filter(|(p, _)| *p == purpose || (purpose == CONFIRM_PASSWORD && *p == "password"))
        .flat_map(|(_, keywords)| keywords.iter().copied())
        .collect()
}

fn from_autocomplete(raw: &str) -> Option<&'static str> {
    let token = raw.split_whitespace().last()?.to_lowercase();
    let purpose = match token.as_str() {
        "on" | "off" => return None,
        "email" => "email",
        "username" => "username",
        "current-password" | "password" => "password",
        "new-password" => "password",
        "given-name" => "given-name",
        "family-name" => "family-name",
        "name" => "name",
        "tel" | "tel-national" | "tel-local" => "tel",
        "url" => "url",
        "organization" => "company",
        "street-address" | "address-line1" => "address-line1",
        "address-level1" => "address-level1",
        "address-level2" => "address-level2",
        "postal-code" => "postal-code",
        "country" | "country-name" => "country",
        _ => return None,
    };
    Some(purpose)
}

fn from_input_type(input_type: &str) -> Option<&'static str> {
    match input_type.to_lowercase().as_str() {
        "email" => Some("email"),
        "password" => Some("password"),
        "tel" => Some("tel"),
        "url" => Some("url"),
        _ => None,
    }
}

fn name_or_id(element: &Element) -> String {
    [element.name.as_deref(), element.id.as_deref()]
        .into_iter()
        .flatten()
        .map(split_identifier)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Text signals of a form element, strongest first.
fn field_signals(element: &Element) -> Vec<(PurposeSource, String)> {
    vec![
        (PurposeSource::Label, element.label.clone().unwrap_or_default()),
        (PurposeSource::Placeholder, element.placeholder().unwrap_or_default().to_string()),
        (PurposeSource::NameOrId, name_or_id(element)),
        (PurposeSource::AriaLabel, element.aria_label.clone().unwrap_or_default()),
        (PurposeSource::Context, element.context.clone()),
    ]
}

fn first_match(signals: &[(PurposeSource, String)], tables: &[Table]) -> Option<(String, PurposeSource)> {
    signals.iter().find_map(|(source, text)| {
        tables
            .iter()
            .find_map(|table| lookup(table, text))
            .map(|purpose| (purpose.to_string(), *source))
    })
}

fn refine_password(purpose: (String, PurposeSource), element: &Element) -> (String, PurposeSource) {
    if purpose.0 != "password" {
        return purpose;
    }
    let own_text = [
        element.label.clone().unwrap_or_default(),
        element.placeholder().unwrap_or_default().to_string(),
        name_or_id(element),
        element.aria_label.clone().unwrap_or_default(),
    ]
    .join(" ");
    if CONFIRM_HINTS.iter().any(|hint| contains_word(&own_text, hint)) {
        (CONFIRM_PASSWORD.to_string(), purpose.1)
    } else {
        purpose
    }
}

/// Derives the purpose of an element from its own attributes and local text.
pub fn detect(element: &Element) -> Option<(String, PurposeSource)> {
    match &element.kind {
        ElementKind::Input(fields) => {
            let found = fields
                .autocomplete
                .as_deref()
                .and_then(from_autocomplete)
                .map(|p| (p.to_string(), PurposeSource::Autocomplete))
                .or_else(|| from_input_type(&fields.input_type).map(|p| (p.to_string(), PurposeSource::InputType)))
                .or_else(|| first_match(&field_signals(element), &[FIELD_PURPOSES]))?;
            Some(refine_password(found, element))
        }
        ElementKind::Textarea { .. } => first_match(&field_signals(element), &[FIELD_PURPOSES]),
        ElementKind::Select { .. } => first_match(&field_signals(element), &[CHOICE_PURPOSES, FIELD_PURPOSES]),
        ElementKind::Checkbox { .. } | ElementKind::Radio { .. } => {
            first_match(&field_signals(element), &[CHOICE_PURPOSES])
        }
        ElementKind::FileUpload { .. } => first_match(&field_signals(element), &[FILE_PURPOSES]),
        ElementKind::Button { .. } | ElementKind::Link { .. } => {
            let mut signals = vec![
                (PurposeSource::VisibleText, element.text.clone()),
                (PurposeSource::AriaLabel, element.aria_label.clone().unwrap_or_default()),
                (
                    PurposeSource::DataAction,
                    element
                        .data_attributes
                        .get("action")
                        .map(|a| split_identifier(a))
                        .unwrap_or_default(),
                ),
                (PurposeSource::NameOrId, name_or_id(element)),
            ];
            if let ElementKind::Link { href: Some(href) } = &element.kind {
                let path = href.split(['?', '#']).next().unwrap_or_default();
                signals.push((PurposeSource::Href, split_identifier(&path.replace('/', " "))));
            }
            first_match(&signals, &[BUTTON_PURPOSES])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InputFields;
    use std::collections::BTreeMap;

    fn element(kind: ElementKind) -> Element {
        Element {
            index: 0,
            tag: "input".into(),
            id: None,
            name: None,
            class_list: vec![],
            aria_label: None,
            disabled: false,
            data_attributes: BTreeMap::new(),
            text: String::new(),
            label: None,
            context: String::new(),
            visible: true,
            required: false,
            selector: "#x".into(),
            purpose: None,
            purpose_source: None,
            kind,
        }
    }

    fn input(input_type: &str) -> Element {
        element(ElementKind::Input(InputFields {
            input_type: input_type.into(),
            ..Default::default()
        }))
    }

    #[test]
    fn autocomplete_beats_placeholder() {
        let mut el = element(ElementKind::Input(InputFields {
            input_type: "text".into(),
            placeholder: Some("phone number".into()),
            autocomplete: Some("email".into()),
            ..Default::default()
        }));
        el.label = Some("Phone".into());
        assert_eq!(detect(&el), Some(("email".into(), PurposeSource::Autocomplete)));
    }

    #[test]
    fn autocomplete_off_falls_through() {
        let el = element(ElementKind::Input(InputFields {
            input_type: "text".into(),
            placeholder: Some("Mobile".into()),
            autocomplete: Some("off".into()),
            ..Default::default()
        }));
        assert_eq!(detect(&el), Some(("tel".into(), PurposeSource::Placeholder)));
    }

    #[test]
    fn label_beats_name() {
        let mut el = input("text");
        el.label = Some("First name *".into());
        el.name = Some("candidate_surname".into());
        assert_eq!(detect(&el), Some(("given-name".into(), PurposeSource::Label)));
    }

    #[test]
    fn camel_case_identifiers_are_split() {
        let mut el = input("text");
        el.id = Some("lastName".into());
        assert_eq!(detect(&el).map(|p| p.0), Some("family-name".into()));
        assert_eq!(split_identifier("applicant[postalCode]"), "applicant postal code");
    }

    #[test]
    fn matching_is_word_bounded() {
        let mut el = input("text");
        el.name = Some("username".into());
        assert_eq!(detect(&el).map(|p| p.0), Some("username".into()));
        assert!(!contains_word("statement", "state"));
        assert!(contains_word("State / Province", "state"));
    }

    #[test]
    fn confirm_password_is_refined() {
        let mut el = input("password");
        el.label = Some("Confirm password".into());
        assert_eq!(detect(&el).map(|p| p.0), Some(CONFIRM_PASSWORD.into()));
        let mut plain = input("password");
        plain.label = Some("Password".into());
        assert_eq!(detect(&plain).map(|p| p.0), Some("password".into()));
    }

    #[test]
    fn context_is_last_resort() {
        let mut el = input("text");
        el.context = "Your LinkedIn profile".into();
        assert_eq!(detect(&el), Some(("linkedin".into(), PurposeSource::Context)));
    }

    #[test]
    fn button_text_then_aria_then_data_action() {
        let mut el = element(ElementKind::Button { button_type: "button".into() });
        el.text = "Apply Now".into();
        el.aria_label = Some("Next".into());
        assert_eq!(detect(&el), Some(("apply".into(), PurposeSource::VisibleText)));

        el.text = "→".into();
        assert_eq!(detect(&el), Some(("next".into(), PurposeSource::AriaLabel)));

        el.aria_label = None;
        el.data_attributes.insert("action".into(), "submitApplication".into());
        assert_eq!(detect(&el), Some(("submit".into(), PurposeSource::DataAction)));
    }

    #[test]
    fn submit_application_is_submit() {
        let mut el = element(ElementKind::Button { button_type: "submit".into() });
        el.text = "Submit Application".into();
        assert_eq!(detect(&el).map(|p| p.0), Some("submit".into()));
    }

    #[test]
    fn link_href_is_used() {
        let mut el = element(ElementKind::Link {
            href: Some("/accounts/login?next=/jobs/1".into()),
        });
        el.text = "Account".into();
        assert_eq!(detect(&el), Some(("signin".into(), PurposeSource::Href)));
    }

    #[test]
    fn choices_and_files() {
        let mut select = element(ElementKind::Select { options: vec![], multiple: false });
        select.label = Some("Will you require visa sponsorship?".into());
        assert_eq!(detect(&select).map(|p| p.0), Some("sponsorship".into()));

        let mut country = element(ElementKind::Select { options: vec![], multiple: false });
        country.label = Some("Country".into());
        assert_eq!(detect(&country).map(|p| p.0), Some("country".into()));

        let mut file = element(ElementKind::FileUpload { accept: None, multiple: false, files: 0 });
        file.label = Some("Resume/CV".into());
        assert_eq!(detect(&file).map(|p| p.0), Some("resume".into()));
    }

    #[test]
    fn detection_is_deterministic() {
        let mut el = input("text");
        el.label = Some("City".into());
        let first = detect(&el);
        for _ in 0..5 {
            assert_eq!(detect(&el), first);
        }
    }

    #[test]
    fn keywords_cover_confirm_password() {
        assert!(keywords_for(CONFIRM_PASSWORD).contains(&"password"));
        assert!(keywords_for("apply").contains(&"apply now"));
        assert!(keywords_for("nonexistent").is_empty());
    }
}

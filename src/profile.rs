use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Supplies applicant data keyed by field purpose. Read-only.
pub trait ProfileProvider: Send + Sync {
    fn value_for(&self, purpose: &str) -> Option<String>;
    fn file_for(&self, purpose: &str) -> Option<PathBuf>;
    /// Opaque to the rest of the crate; never logged.
    fn password(&self) -> Option<String>;
}

/// Applicant profile as written in YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// Falls back to `first_name last_name`.
    pub name: Option<String>,
    pub phone: Option<String>,
    pub linkedin: Option<String>,
    pub github: Option<String>,
    pub portfolio: Option<String>,
    pub company: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub resume_path: Option<PathBuf>,
    pub cover_letter_path: Option<PathBuf>,
    /// Free-form answers keyed by purpose, e.g. `sponsorship: "No"`.
    /// These win over the structured fields.
    pub answers: BTreeMap<String, String>,
}

impl Profile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn full_name(&self) -> Option<String> {
        if let Some(name) = non_empty(&self.name) {
            return Some(name);
        }
        let parts: Vec<String> = [non_empty(&self.first_name), non_empty(&self.last_name)]
            .into_iter()
            .flatten()
            .collect();
        (!parts.is_empty()).then(|| parts.join(" "))
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Profile from configuration plus a password read from the environment.
#[derive(Clone)]
pub struct ConfigProfile {
    profile: Profile,
    password: Option<String>,
}

impl ConfigProfile {
    pub fn new(profile: Profile, password: Option<String>) -> Self {
        Self { profile, password }
    }

    pub fn from_env(profile: Profile, password_env_var: &str) -> Self {
        let password = std::env::var(password_env_var).ok().filter(|p| !p.is_empty());
        Self::new(profile, password)
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }
}

impl std::fmt::Debug for ConfigProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigProfile")
            .field("email", &self.profile.email.as_deref().map(mask_email))
            .field("password", &self.password.as_ref().map(|_| MASKED))
            .finish()
    }
}

impl ProfileProvider for ConfigProfile {
    fn value_for(&self, purpose: &str) -> Option<String> {
        if let Some(answer) = self.profile.answers.get(purpose).filter(|a| !a.trim().is_empty()) {
            return Some(answer.clone());
        }
        let p = &self.profile;
        match purpose {
            "email" | "username" => non_empty(&p.email),
            "given-name" => non_empty(&p.first_name),
            "family-name" => non_empty(&p.last_name),
            "name" => p.full_name(),
            "tel" => non_empty(&p.phone),
            "linkedin" => non_empty(&p.linkedin),
            "github" => non_empty(&p.github),
            "url" => non_empty(&p.portfolio).or_else(|| non_empty(&p.linkedin)),
            "company" => non_empty(&p.company),
            "address-line1" => non_empty(&p.address),
            "address-level2" => non_empty(&p.city),
            "address-level1" => non_empty(&p.state),
            "postal-code" => non_empty(&p.postal_code),
            "country" => non_empty(&p.country),
            _ => None,
        }
    }

    fn file_for(&self, purpose: &str) -> Option<PathBuf> {
        match purpose {
            "cover-letter" => self.profile.cover_letter_path.clone(),
            _ => self.profile.resume_path.clone(),
        }
    }

    fn password(&self) -> Option<String> {
        self.password.clone()
    }
}

pub const MASKED: &str = "***MASKED***";

/// `jane.doe@x.io` becomes `ja***@x.io`.
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((user, domain)) => {
            let head: String = user.chars().take(2).collect();
            format!("{head}***@{domain}")
        }
        None => "***".to_string(),
    }
}

/// Scrubs secrets out of text bound for logs, events and artifacts.
#[derive(Clone, Default)]
pub struct Masker {
    password: Option<String>,
    email: Option<String>,
    enabled: bool,
}

impl Masker {
    pub fn new(password: Option<String>, email: Option<String>, enabled: bool) -> Self {
        Self {
            password: password.filter(|p| !p.is_empty()),
            email: email.filter(|e| e.contains('@')),
            enabled,
        }
    }

    pub fn for_provider(provider: &dyn ProfileProvider, enabled: bool) -> Self {
        Self::new(provider.password(), provider.value_for("email"), enabled)
    }

    pub fn mask(&self, text: &str) -> String {
        if !self.enabled {
            return text.to_string();
        }
        let mut out = text.to_string();
        if let Some(password) = &self.password {
            out = out.replace(password.as_str(), MASKED);
        }
        if let Some(email) = &self.email {
            out = out.replace(email.as_str(), &mask_email(email));
        }
        out
    }

    /// Masks every string inside a JSON document.
    pub fn mask_json(&self, value: &mut serde_json::Value) {
        if !self.enabled {
            return;
        }
        match value {
            serde_json::Value::String(s) => *s = self.mask(s),
            serde_json::Value::Array(items) => items.iter_mut().for_each(|v| self.mask_json(v)),
            serde_json::Value::Object(map) => map.values_mut().for_each(|v| self.mask_json(v)),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ConfigProfile {
        let mut profile = Profile {
            email: Some("jane.doe@example.com".into()),
            first_name: Some("Jane".into()),
            last_name: Some("Doe".into()),
            phone: Some("555-0100".into()),
            resume_path: Some(PathBuf::from("/tmp/resume.pdf")),
            ..Default::default()
        };
        profile.answers.insert("sponsorship".into(), "No".into());
        profile.answers.insert("tel".into(), "+1 555 0199".into());
        ConfigProfile::new(profile, Some("hunter22".into()))
    }

    #[test]
    fn values_by_purpose() {
        let p = provider();
        assert_eq!(p.value_for("given-name").as_deref(), Some("Jane"));
        assert_eq!(p.value_for("name").as_deref(), Some("Jane Doe"));
        assert_eq!(p.value_for("username").as_deref(), Some("jane.doe@example.com"));
        assert_eq!(p.value_for("sponsorship").as_deref(), Some("No"));
        assert_eq!(p.value_for("tel").as_deref(), Some("+1 555 0199"));
        assert_eq!(p.value_for("gender"), None);
        assert_eq!(p.file_for("resume"), Some(PathBuf::from("/tmp/resume.pdf")));
        assert_eq!(p.file_for("cover-letter"), None);
    }

    #[test]
    fn masker_hides_password_and_email() {
        let p = provider();
        let masker = Masker::for_provider(&p, true);
        let masked = masker.mask("login jane.doe@example.com / hunter22");
        assert_eq!(masked, "login ja***@example.com / ***MASKED***");
        assert_eq!(Masker::for_provider(&p, false).mask("hunter22"), "hunter22");

        let mut doc = serde_json::json!({"a": ["hunter22", 1], "b": {"c": "jane.doe@example.com"}});
        masker.mask_json(&mut doc);
        assert_eq!(doc["a"][0], "***MASKED***");
        assert_eq!(doc["b"]["c"], "ja***@example.com");
    }

    #[test]
    fn debug_output_never_shows_password() {
        let rendered = format!("{:?}", provider());
        assert!(!rendered.contains("hunter22"));
        assert!(!rendered.contains("jane.doe@"));
    }
}

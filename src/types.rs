use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

pub const DEFAULT_MAX_ITERATIONS: usize = 50;
pub const CONTEXT_MAX_CHARS: usize = 200;
pub const SUMMARY_TEXT_MAX_CHARS: usize = 4000;

/// One immutable capture of everything actionable on the page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub url: String,
    pub title: String,
    pub captured_at: DateTime<Utc>,
    pub elements: Vec<Element>,
    pub page_text: String,
    pub network_records: Vec<NetworkRecord>,
    pub hidden_data: HiddenData,
    pub frames: Vec<FrameRef>,
    pub challenge_nodes: Vec<MarkerNode>,
}

impl Snapshot {
    /// Stable hash of the observable page state. Two snapshots with the same
    /// fingerprint mean the last iteration changed nothing.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.url.hash(&mut hasher);
        self.page_text.hash(&mut hasher);
        for el in &self.elements {
            el.selector.hash(&mut hasher);
            el.visible.hash(&mut hasher);
            el.disabled.hash(&mut hasher);
            match &el.kind {
                ElementKind::Input(input) => input.value.hash(&mut hasher),
                ElementKind::Textarea { value, .. } => value.hash(&mut hasher),
                ElementKind::Checkbox { checked, .. } | ElementKind::Radio { checked, .. } => {
                    checked.hash(&mut hasher)
                }
                ElementKind::Select { options, .. } => {
                    for opt in options {
                        opt.selected.hash(&mut hasher);
                    }
                }
                ElementKind::FileUpload { files, .. } => files.hash(&mut hasher),
                ElementKind::Button { .. } | ElementKind::Link { .. } => {}
            }
        }
        hasher.finish()
    }

    /// Whether a form element already holds an acceptable value. Radios are
    /// satisfied when any radio of the same group is checked.
    pub fn is_satisfied(&self, element: &Element) -> bool {
        match &element.kind {
            ElementKind::Radio { .. } => match element.name.as_deref() {
                Some(group) => self.elements.iter().any(|other| {
                    other.name.as_deref() == Some(group)
                        && matches!(other.kind, ElementKind::Radio { checked: true, .. })
                }),
                None => element.is_filled(),
            },
            _ => element.is_filled(),
        }
    }

    /// Required, visible, enabled fields with no acceptable value, in DOM order.
    /// Only the first radio of each group is reported.
    pub fn unsatisfied_required(&self) -> Vec<&Element> {
        let mut seen_groups: Vec<&str> = Vec::new();
        let mut out = Vec::new();
        for el in &self.elements {
            if !el.is_fillable() || !el.required || el.disabled || !el.is_reachable() {
                continue;
            }
            if self.is_satisfied(el) {
                continue;
            }
            if let (ElementKind::Radio { .. }, Some(group)) = (&el.kind, el.name.as_deref()) {
                if seen_groups.contains(&group) {
                    continue;
                }
                seen_groups.push(group);
            }
            out.push(el);
        }
        out
    }

    pub fn has_unsatisfied_required(&self) -> bool {
        !self.unsatisfied_required().is_empty()
    }
}

/// Where a purpose came from. Ordered from strongest to weakest signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurposeSource {
    Autocomplete,
    InputType,
    VisibleText,
    Label,
    Placeholder,
    NameOrId,
    AriaLabel,
    DataAction,
    Href,
    Context,
}

impl PurposeSource {
    pub fn confidence(self) -> u8 {
        match self {
            PurposeSource::Autocomplete => 100,
            PurposeSource::InputType => 95,
            PurposeSource::VisibleText => 90,
            PurposeSource::Label => 85,
            PurposeSource::Placeholder => 70,
            PurposeSource::NameOrId => 65,
            PurposeSource::AriaLabel => 60,
            PurposeSource::DataAction => 50,
            PurposeSource::Href => 40,
            PurposeSource::Context => 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Element {
    pub index: usize,
    pub tag: String,
    pub id: Option<String>,
    pub name: Option<String>,
    pub class_list: Vec<String>,
    pub aria_label: Option<String>,
    pub disabled: bool,
    pub data_attributes: BTreeMap<String, String>,
    pub text: String,
    pub label: Option<String>,
    pub context: String,
    pub visible: bool,
    pub required: bool,
    pub selector: String,
    pub purpose: Option<String>,
    pub purpose_source: Option<PurposeSource>,
    pub kind: ElementKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "variant")]
pub enum ElementKind {
    Button {
        button_type: String,
    },
    Input(InputFields),
    Select {
        options: Vec<SelectChoice>,
        multiple: bool,
    },
    Link {
        href: Option<String>,
    },
    FileUpload {
        accept: Option<String>,
        multiple: bool,
        files: usize,
    },
    Textarea {
        placeholder: Option<String>,
        value: String,
    },
    Checkbox {
        value: Option<String>,
        checked: bool,
    },
    Radio {
        value: Option<String>,
        checked: bool,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputFields {
    pub input_type: String,
    pub placeholder: Option<String>,
    pub autocomplete: Option<String>,
    pub pattern: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectChoice {
    pub value: String,
    pub text: String,
    pub selected: bool,
}

impl Element {
    pub fn variant_name(&self) -> &'static str {
        match self.kind {
            ElementKind::Button { .. } => "button",
            ElementKind::Input(_) => "input",
            ElementKind::Select { .. } => "select",
            ElementKind::Link { .. } => "link",
            ElementKind::FileUpload { .. } => "file",
            ElementKind::Textarea { .. } => "textarea",
            ElementKind::Checkbox { .. } => "checkbox",
            ElementKind::Radio { .. } => "radio",
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self.kind, ElementKind::Button { .. } | ElementKind::Link { .. })
    }

    pub fn is_fillable(&self) -> bool {
        !self.is_control()
    }

    pub fn input(&self) -> Option<&InputFields> {
        match &self.kind {
            ElementKind::Input(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn placeholder(&self) -> Option<&str> {
        match &self.kind {
            ElementKind::Input(fields) => fields.placeholder.as_deref(),
            ElementKind::Textarea { placeholder, .. } => placeholder.as_deref(),
            _ => None,
        }
    }

    pub fn has_purpose(&self, purpose: &str) -> bool {
        self.purpose.as_deref() == Some(purpose)
    }

    /// File inputs and toggles are routinely styled away; they can still be
    /// driven through the DOM, so visibility is not required for them.
    pub fn is_reachable(&self) -> bool {
        self.visible
            || matches!(
                self.kind,
                ElementKind::FileUpload { .. }
                    | ElementKind::Checkbox { .. }
                    | ElementKind::Radio { .. }
            )
    }

    fn is_filled(&self) -> bool {
        match &self.kind {
            ElementKind::Input(fields) => !fields.value.trim().is_empty(),
            ElementKind::Textarea { value, .. } => !value.trim().is_empty(),
            ElementKind::Select { options, .. } => options
                .iter()
                .find(|opt| opt.selected)
                .is_some_and(|opt| !opt.value.trim().is_empty() && !is_placeholder_choice(&opt.text)),
            ElementKind::FileUpload { files, .. } => *files > 0,
            ElementKind::Checkbox { checked, .. } | ElementKind::Radio { checked, .. } => *checked,
            ElementKind::Button { .. } | ElementKind::Link { .. } => true,
        }
    }

    /// Key telling apart fields that share a label: the group name for
    /// radios, otherwise id, name or the surrounding text.
    pub fn scope_key(&self) -> Option<String> {
        let key = match self.kind {
            ElementKind::Radio { .. } => self.name.clone().or_else(|| self.id.clone()),
            _ => self.id.clone().or_else(|| self.name.clone()),
        };
        key.filter(|k| !k.trim().is_empty())
            .or_else(|| Some(self.context.clone()).filter(|c| !c.trim().is_empty()))
    }

    /// Best human-readable description, used for fallback target text.
    pub fn describe(&self) -> String {
        let label = self
            .label
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| Some(self.text.as_str()).filter(|s| !s.is_empty()))
            .or_else(|| self.placeholder().filter(|s| !s.is_empty()))
            .or(self.aria_label.as_deref())
            .or(self.name.as_deref())
            .or(self.id.as_deref())
            .unwrap_or("");
        format!("<{} {}> '{}'", self.tag, self.variant_name(), label)
    }
}

pub fn is_placeholder_choice(text: &str) -> bool {
    let t = text.trim().to_lowercase();
    t.is_empty() || t.starts_with("select") || t.starts_with("choose") || t.starts_with("--") || t == "please select"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub url: String,
    pub status: u16,
    pub mime_type: String,
    pub body: serde_json::Value,
}

const API_HINTS: &[&str] = &["/api/", "/graphql", "/v1/", "/v2/", "/rest/", "/_next/data/", "/trpc/"];
const APPLICATION_HINTS: &[&str] = &["/apply", "/application", "/submit"];

impl NetworkRecord {
    pub fn is_api_endpoint(&self) -> bool {
        let url = self.url.to_lowercase();
        API_HINTS.iter().any(|hint| url.contains(hint))
    }

    /// The endpoint the primary action (apply/submit) talks to.
    pub fn is_application_endpoint(&self) -> bool {
        let url = self.url.to_lowercase();
        APPLICATION_HINTS.iter().any(|hint| url.contains(hint))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HiddenData {
    pub csrf_tokens: BTreeMap<String, String>,
    pub hidden_fields: BTreeMap<String, String>,
    pub storage: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRef {
    pub src: String,
    pub title: String,
    pub visible: bool,
}

/// A node whose id or class hints at an anti-automation widget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerNode {
    pub tag: String,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub data_size: Option<String>,
    pub visible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowState {
    Initial,
    Listing,
    SignIn,
    SignUp,
    FormFill,
    Review,
    Captcha,
    Confirmation,
    Blocked,
}

impl FlowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowState::Confirmation | FlowState::Blocked)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlowState::Initial => "INITIAL",
            FlowState::Listing => "LISTING",
            FlowState::SignIn => "SIGN_IN",
            FlowState::SignUp => "SIGN_UP",
            FlowState::FormFill => "FORM_FILL",
            FlowState::Review => "REVIEW",
            FlowState::Captcha => "CAPTCHA",
            FlowState::Confirmation => "CONFIRMATION",
            FlowState::Blocked => "BLOCKED",
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which family of elements a target may resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Text-like inputs and textareas.
    Field,
    Select,
    File,
    /// Checkboxes and radios.
    Toggle,
    /// Buttons and links.
    Control,
}

impl TargetKind {
    pub fn accepts(self, element: &Element) -> bool {
        match (self, &element.kind) {
            (TargetKind::Field, ElementKind::Input(_) | ElementKind::Textarea { .. }) => true,
            (TargetKind::Select, ElementKind::Select { .. }) => true,
            (TargetKind::File, ElementKind::FileUpload { .. }) => true,
            (TargetKind::Toggle, ElementKind::Checkbox { .. } | ElementKind::Radio { .. }) => true,
            (TargetKind::Control, ElementKind::Button { .. } | ElementKind::Link { .. }) => true,
            _ => false,
        }
    }

    pub fn for_element(element: &Element) -> Self {
        match element.kind {
            ElementKind::Input(_) | ElementKind::Textarea { .. } => TargetKind::Field,
            ElementKind::Select { .. } => TargetKind::Select,
            ElementKind::FileUpload { .. } => TargetKind::File,
            ElementKind::Checkbox { .. } | ElementKind::Radio { .. } => TargetKind::Toggle,
            ElementKind::Button { .. } | ElementKind::Link { .. } => TargetKind::Control,
        }
    }
}

/// Semantic reference to an element: purpose plus fallback text. Resolved
/// afresh against the live page every time it is used.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub kind: TargetKind,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    /// [`Element::scope_key`] of the element the target was planned from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl Target {
    pub fn new(kind: TargetKind, purpose: Option<&str>, text: Option<&str>) -> Self {
        Self {
            kind,
            purpose: purpose.map(str::to_string),
            text: text.map(str::to_string).filter(|t| !t.trim().is_empty()),
            scope: None,
        }
    }

    pub fn control(purpose: &str, text: Option<&str>) -> Self {
        Self::new(TargetKind::Control, Some(purpose), text)
    }

    /// Target for an element observed in a snapshot.
    pub fn for_element(element: &Element) -> Self {
        let text = match element.kind {
            ElementKind::Button { .. } | ElementKind::Link { .. } => Some(element.text.as_str())
                .filter(|t| !t.is_empty())
                .or(element.aria_label.as_deref()),
            _ => element
                .label
                .as_deref()
                .filter(|t| !t.is_empty())
                .or_else(|| element.placeholder())
                .or(element.aria_label.as_deref())
                .or(element.name.as_deref())
                .or(element.id.as_deref()),
        };
        let mut target = Self::new(TargetKind::for_element(element), element.purpose.as_deref(), text);
        if !element.is_control() {
            target.scope = element.scope_key();
        }
        target
    }

    pub fn is_sensitive(&self) -> bool {
        self.purpose.as_deref().is_some_and(|p| p.starts_with("password"))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = serde_json::to_value(self.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        match (&self.purpose, &self.text) {
            (Some(p), Some(t)) => write!(f, "{kind}[{p}] '{t}'"),
            (Some(p), None) => write!(f, "{kind}[{p}]"),
            (None, Some(t)) => write!(f, "{kind} '{t}'"),
            (None, None) => write!(f, "{kind}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Back,
    Forward,
    Reload,
}

/// A single atomic step against the page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Action {
    ClickButton { target: Target },
    FillInput { target: Target, value: String },
    SelectOption { target: Target, value: String },
    UploadFile { target: Target, path: PathBuf },
    Navigate { direction: Direction },
}

pub const REDACTED: &str = "***";

impl Action {
    pub fn target(&self) -> Option<&Target> {
        match self {
            Action::ClickButton { target }
            | Action::FillInput { target, .. }
            | Action::SelectOption { target, .. }
            | Action::UploadFile { target, .. } => Some(target),
            Action::Navigate { .. } => None,
        }
    }

    /// Copy safe to log, stream and persist.
    pub fn redacted(&self) -> Action {
        match self {
            Action::FillInput { target, .. } if target.is_sensitive() => Action::FillInput {
                target: target.clone(),
                value: REDACTED.to_string(),
            },
            other => other.clone(),
        }
    }

    pub fn is_field_step(&self) -> bool {
        match self {
            Action::FillInput { .. } | Action::SelectOption { .. } | Action::UploadFile { .. } => true,
            Action::ClickButton { target } => target.kind == TargetKind::Toggle,
            Action::Navigate { .. } => false,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.redacted() {
            Action::ClickButton { target } => write!(f, "click {target}"),
            Action::FillInput { target, value } => write!(f, "fill {target} = '{value}'"),
            Action::SelectOption { target, value } => write!(f, "select {target} = '{value}'"),
            Action::UploadFile { target, path } => write!(f, "upload {} -> {target}", path.display()),
            Action::Navigate { direction } => write!(f, "navigate {direction:?}"),
        }
    }
}

/// One proposed next step. Several actions in one candidate run atomically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub actions: Vec<Action>,
    pub reason: String,
    pub fallback: bool,
}

impl Candidate {
    pub fn single(action: Action, reason: impl Into<String>) -> Self {
        Self {
            actions: vec![action],
            reason: reason.into(),
            fallback: false,
        }
    }

    pub fn key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.actions.hash(&mut hasher);
        hasher.finish()
    }

    pub fn is_field_step(&self) -> bool {
        !self.actions.is_empty() && self.actions.iter().all(Action::is_field_step)
    }

    pub fn describe(&self) -> String {
        self.actions
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Resolution,
    Action,
    Timeout,
    Fatal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecError {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub error: Option<ExecError>,
    pub elapsed_ms: u64,
    /// Description of the element the target resolved to.
    pub target: Option<String>,
    pub strategy: Option<String>,
}

impl ExecutionResult {
    pub fn is_fatal(&self) -> bool {
        self.error.as_ref().is_some_and(|e| e.kind == FailureKind::Fatal)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateOutcome {
    pub results: Vec<ExecutionResult>,
    pub completed: usize,
    pub total: usize,
}

impl CandidateOutcome {
    pub fn success(&self) -> bool {
        self.completed == self.total && self.results.iter().all(|r| r.success)
    }

    pub fn is_fatal(&self) -> bool {
        self.results.iter().any(ExecutionResult::is_fatal)
    }

    pub fn last_error(&self) -> Option<&ExecError> {
        self.results.iter().rev().find_map(|r| r.error.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    Blocked,
    CaptchaTimeout,
    MaxIterations,
    Cancelled,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Blocked => 2,
            RunStatus::CaptchaTimeout => 3,
            RunStatus::MaxIterations => 4,
            RunStatus::Cancelled => 130,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub iterations_used: usize,
    pub reason: String,
    pub flagged: Vec<FlaggedField>,
    pub finished_at: DateTime<Utc>,
}

/// A field filled without a semantic signal; the operator should review it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaggedField {
    pub field: String,
    pub purpose: Option<String>,
    pub value: String,
    pub reason: String,
}

/// Events streamed to the CLI or dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Iteration {
        run_id: String,
        iteration: usize,
        state: FlowState,
        action: Option<String>,
        result: Option<ExecutionResult>,
        flagged: Vec<FlaggedField>,
    },
    CaptchaWait {
        run_id: String,
        iteration: usize,
        evidence: String,
        remaining_secs: u64,
    },
    Finished(RunResult),
}

impl ProgressEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProgressEvent::Iteration { .. } => "iteration",
            ProgressEvent::CaptchaWait { .. } => "captcha_wait",
            ProgressEvent::Finished(_) => "finished",
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            ProgressEvent::Iteration { run_id, .. } | ProgressEvent::CaptchaWait { run_id, .. } => run_id,
            ProgressEvent::Finished(result) => &result.run_id,
        }
    }
}

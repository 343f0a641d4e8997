//! Executor: resolves a target against a fresh capture and performs one action.

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::dom;
use crate::error::PageError;
use crate::page::PageHandle;
use crate::planner::best_option;
use crate::resolve::resolve;
use crate::types::{
    Action, Candidate, CandidateOutcome, Element, ElementKind, ExecError, ExecutionResult, FailureKind,
};

pub struct Executor {
    timeout: Duration,
}

impl Executor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Runs the actions of a candidate in order, stopping at the first failure.
    pub async fn execute_candidate<P>(&self, page: &P, candidate: &Candidate) -> CandidateOutcome
    where
        P: PageHandle + ?Sized,
    {
        let mut results = Vec::with_capacity(candidate.actions.len());
        for action in &candidate.actions {
            let result = self.execute(page, action).await;
            let ok = result.success;
            results.push(result);
            if !ok {
                break;
            }
        }
        let completed = results.iter().filter(|r| r.success).count();
        if completed < candidate.actions.len() && completed > 0 {
            warn!(
                completed,
                total = candidate.actions.len(),
                candidate = %candidate.describe(),
                "candidate stopped part way"
            );
        }
        CandidateOutcome {
            results,
            completed,
            total: candidate.actions.len(),
        }
    }

    /// Performs one action. The timeout covers the whole action: capture,
    /// resolution, the effect and any script-click retry.
    pub async fn execute<P>(&self, page: &P, action: &Action) -> ExecutionResult
    where
        P: PageHandle + ?Sized,
    {
        let started = Instant::now();
        let mut result = ExecutionResult {
            success: false,
            error: None,
            elapsed_ms: 0,
            target: None,
            strategy: None,
        };

        let outcome = match tokio::time::timeout(self.timeout, self.perform(page, action, &mut result)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ExecError {
                kind: FailureKind::Timeout,
                message: format!("timed out after {} ms", self.timeout.as_millis()),
            }),
        };
        result.elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => {
                result.success = true;
                info!(action = %action, strategy = result.strategy.as_deref().unwrap_or("-"), elapsed_ms = result.elapsed_ms, "action done");
            }
            Err(err) => {
                warn!(action = %action, kind = ?err.kind, error = %err.message, "action failed");
                result.error = Some(err);
            }
        }
        result
    }

    async fn perform<P>(&self, page: &P, action: &Action, result: &mut ExecutionResult) -> Result<(), ExecError>
    where
        P: PageHandle + ?Sized,
    {
        let Some(target) = action.target() else {
            if let Action::Navigate { direction } = action {
                return page.navigate(*direction).await.map_err(exec_error);
            }
            return Ok(());
        };

        let elements = dom::capture_elements(page).await.map_err(exec_error)?;
        let resolution = resolve(&elements, target).map_err(|e| ExecError {
            kind: FailureKind::Resolution,
            message: e.to_string(),
        })?;
        let element = resolution.element;
        result.target = Some(element.describe());
        result.strategy = Some(resolution.strategy.to_string());
        debug!(target = %target, element = %element.describe(), strategy = resolution.strategy, "target resolved");

        let selector = element.selector.as_str();
        match action {
            Action::ClickButton { .. } => match page.click(selector).await.map_err(exec_error) {
                Err(err) if err.kind != FailureKind::Fatal => {
                    debug!(selector, error = %err.message, "native click failed, dispatching a script click");
                    self.script_click(page, selector).await
                }
                other => other,
            },
            Action::FillInput { value, .. } => page.fill(selector, value).await.map_err(exec_error),
            Action::SelectOption { value, .. } => {
                let value = option_value(element, value);
                page.select_option(selector, &value).await.map_err(exec_error)
            }
            Action::UploadFile { path, .. } => {
                if !path.is_file() {
                    return Err(ExecError {
                        kind: FailureKind::Action,
                        message: format!("file not found: {}", path.display()),
                    });
                }
                page.upload(selector, path).await.map_err(exec_error)
            }
            Action::Navigate { .. } => Ok(()),
        }
    }

    async fn script_click<P>(&self, page: &P, selector: &str) -> Result<(), ExecError>
    where
        P: PageHandle + ?Sized,
    {
        let quoted = serde_json::to_string(selector).unwrap_or_default();
        let script = format!(
            "(() => {{ const el = document.querySelector({quoted}); if (!el) return false; el.click(); return true; }})()"
        );
        let clicked = page.evaluate(&script).await.map_err(exec_error)?;
        if clicked.as_bool() == Some(false) {
            return Err(ExecError {
                kind: FailureKind::Action,
                message: format!("element vanished before click: {selector}"),
            });
        }
        Ok(())
    }
}

fn exec_error(err: PageError) -> ExecError {
    let kind = match &err {
        PageError::Closed(_) => FailureKind::Fatal,
        PageError::Timeout(_) => FailureKind::Timeout,
        PageError::NotFound(_) => FailureKind::Resolution,
        PageError::Script(_) | PageError::Other(_) => FailureKind::Action,
    };
    ExecError {
        kind,
        message: err.to_string(),
    }
}

/// Option `value` attribute for a requested value, which may be the option's
/// visible text rather than its value.
fn option_value(element: &Element, requested: &str) -> String {
    let ElementKind::Select { options, .. } = &element.kind else {
        return requested.to_string();
    };
    if options.iter().any(|o| o.value == requested) {
        return requested.to_string();
    }
    best_option(options, requested)
        .map(|o| o.value.clone())
        .unwrap_or_else(|| requested.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, Target, TargetKind};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        html: String,
        calls: Mutex<Vec<String>>,
        fail_click: Option<PageError>,
        hang: bool,
        /// Added to every capture and click.
        delay: Duration,
    }

    impl Recorder {
        fn new(body: &str) -> Self {
            Self {
                html: format!("<html><body>{body}</body></html>"),
                ..Default::default()
            }
        }

        fn log(&self, call: String) -> Result<(), PageError> {
            self.calls.lock().expect("lock").push(call);
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl PageHandle for Recorder {
        async fn url(&self) -> Result<String, PageError> {
            Ok("https://x".into())
        }
        async fn title(&self) -> Result<String, PageError> {
            Ok(String::new())
        }
        async fn content(&self) -> Result<String, PageError> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            tokio::time::sleep(self.delay).await;
            Ok(self.html.clone())
        }
        async fn evaluate(&self, script: &str) -> Result<serde_json::Value, PageError> {
            if script.contains("el.click()") {
                self.log("script-click".into())?;
                return Ok(serde_json::Value::Bool(true));
            }
            Ok(serde_json::Value::Null)
        }
        async fn goto(&self, url: &str) -> Result<(), PageError> {
            self.log(format!("goto {url}"))
        }
        async fn click(&self, selector: &str) -> Result<(), PageError> {
            tokio::time::sleep(self.delay).await;
            if let Some(err) = &self.fail_click {
                return Err(err.clone());
            }
            self.log(format!("click {selector}"))
        }
        async fn fill(&self, selector: &str, value: &str) -> Result<(), PageError> {
            self.log(format!("fill {selector} {value}"))
        }
        async fn select_option(&self, selector: &str, value: &str) -> Result<(), PageError> {
            self.log(format!("select {selector} {value}"))
        }
        async fn upload(&self, selector: &str, path: &Path) -> Result<(), PageError> {
            self.log(format!("upload {selector} {}", path.display()))
        }
        async fn navigate(&self, direction: Direction) -> Result<(), PageError> {
            self.log(format!("navigate {direction:?}"))
        }
    }

    fn executor() -> Executor {
        Executor::new(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn fill_resolves_by_label() {
        let page = Recorder::new(r#"<label for="e">Email</label><input id="e" name="email">"#);
        let action = Action::FillInput {
            target: Target::new(TargetKind::Field, Some("email"), Some("Email")),
            value: "a@b.io".into(),
        };
        let result = executor().execute(&page, &action).await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.strategy.as_deref(), Some("label"));
        assert_eq!(page.calls(), vec!["fill html > body:nth-child(2) > input:nth-child(2) a@b.io".to_string()]);
    }

    #[tokio::test]
    async fn unresolvable_target_is_a_resolution_failure() {
        let page = Recorder::new("<p>empty</p>");
        let action = Action::ClickButton {
            target: Target::control("submit", Some("Submit")),
        };
        let result = executor().execute(&page, &action).await;
        assert!(!result.success);
        assert_eq!(result.error.map(|e| e.kind), Some(FailureKind::Resolution));
        assert!(page.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_click_falls_back_to_script() {
        let mut page = Recorder::new("<button>Next</button>");
        page.fail_click = Some(PageError::Other("element is covered".into()));
        let action = Action::ClickButton {
            target: Target::control("next", Some("Next")),
        };
        let result = executor().execute(&page, &action).await;
        assert!(result.success);
        assert_eq!(page.calls(), vec!["script-click".to_string()]);
    }

    #[tokio::test]
    async fn closed_page_is_fatal() {
        let mut page = Recorder::new("<button>Next</button>");
        page.fail_click = Some(PageError::Closed("target closed".into()));
        let action = Action::ClickButton {
            target: Target::control("next", Some("Next")),
        };
        let result = executor().execute(&page, &action).await;
        assert!(result.is_fatal());
        assert!(page.calls().is_empty());
    }

    #[tokio::test]
    async fn slow_page_times_out() {
        let mut page = Recorder::new("<button>Next</button>");
        page.hang = true;
        let action = Action::ClickButton {
            target: Target::control("next", None),
        };
        let result = executor().execute(&page, &action).await;
        assert_eq!(result.error.map(|e| e.kind), Some(FailureKind::Timeout));
    }

    #[tokio::test]
    async fn timeout_covers_the_whole_action() {
        let mut page = Recorder::new("<button>Next</button>");
        page.delay = Duration::from_millis(120);
        let action = Action::ClickButton {
            target: Target::control("next", None),
        };
        let result = executor().execute(&page, &action).await;
        assert_eq!(result.error.map(|e| e.kind), Some(FailureKind::Timeout));
        assert!(result.elapsed_ms < 400, "{} ms", result.elapsed_ms);
        assert!(page.calls().is_empty());
    }

    #[tokio::test]
    async fn select_accepts_option_text() {
        let page = Recorder::new(
            r#"<label for="c">Country</label><select id="c"><option value="us">United States</option><option value="ca">Canada</option></select>"#,
        );
        let action = Action::SelectOption {
            target: Target::new(TargetKind::Select, Some("country"), Some("Country")),
            value: "Canada".into(),
        };
        assert!(executor().execute(&page, &action).await.success);
        assert!(page.calls()[0].ends_with(" ca"));
    }

    #[tokio::test]
    async fn missing_upload_file_fails_without_touching_the_page() {
        let page = Recorder::new(r#"<label for="r">Resume</label><input type="file" id="r">"#);
        let action = Action::UploadFile {
            target: Target::new(TargetKind::File, Some("resume"), None),
            path: "/definitely/missing.pdf".into(),
        };
        let result = executor().execute(&page, &action).await;
        assert_eq!(result.error.map(|e| e.kind), Some(FailureKind::Action));
        assert!(page.calls().is_empty());
    }

    #[tokio::test]
    async fn candidate_stops_at_first_failure() {
        let page = Recorder::new(r#"<input type="email"><button>Sign in</button>"#);
        let candidate = Candidate {
            actions: vec![
                Action::FillInput {
                    target: Target::new(TargetKind::Field, Some("email"), None),
                    value: "a@b.io".into(),
                },
                Action::FillInput {
                    target: Target::new(TargetKind::Field, Some("password"), None),
                    value: "pw".into(),
                },
                Action::ClickButton {
                    target: Target::control("signin", None),
                },
            ],
            reason: "sign in".into(),
            fallback: false,
        };
        let outcome = executor().execute_candidate(&page, &candidate).await;
        assert_eq!(outcome.completed, 1);
        assert_eq!(outcome.total, 3);
        assert_eq!(outcome.results.len(), 2);
        assert!(!outcome.success());
        assert_eq!(page.calls().len(), 1);
    }

    #[tokio::test]
    async fn navigate_needs_no_target() {
        let page = Recorder::new("");
        let action = Action::Navigate {
            direction: Direction::Back,
        };
        assert!(executor().execute(&page, &action).await.success);
        assert_eq!(page.calls(), vec!["navigate Back".to_string()]);
    }
}

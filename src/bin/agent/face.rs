use anyhow::{Context, Result};
use autoapply::artifacts::{ArtifactSink, FsSink};
use autoapply::types::{FlowState, ProgressEvent, RunResult, RunStatus};
use autoapply::{Config, RunControl, RunRequest};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
struct RunView {
    run_id: String,
    url: String,
    state: FlowState,
    iteration: usize,
    waiting_for_captcha: bool,
    result: Option<RunResult>,
}

struct RunEntry {
    control: RunControl,
    view: RunView,
}

type Runs = Arc<Mutex<HashMap<String, RunEntry>>>;

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    runs: Runs,
    events: broadcast::Sender<ProgressEvent>,
    sink: Arc<dyn ArtifactSink>,
}

#[derive(Deserialize)]
struct StartPayload {
    url: String,
    #[serde(default, rename = "profileRef", alias = "profile_ref")]
    profile_ref: Option<PathBuf>,
    #[serde(default, rename = "maxIterations", alias = "max_iterations")]
    max_iterations: Option<usize>,
    #[serde(default, rename = "timeoutMs", alias = "timeout_ms")]
    timeout_ms: Option<u64>,
}

/// Serves the dashboard and runs API until the process is stopped.
pub async fn serve(config: Config) -> Result<()> {
    let (events, _) = broadcast::channel::<ProgressEvent>(256);
    let sink: Arc<dyn ArtifactSink> = Arc::new(FsSink::new(
        config.automation.artifacts_dir.clone(),
        config.logging.save_snapshots,
    ));
    let bind = config.server.bind.clone();
    let state = AppState {
        config: Arc::new(config),
        runs: Arc::new(Mutex::new(HashMap::new())),
        events: events.clone(),
        sink,
    };
    tokio::spawn(track_runs(state.runs.clone(), events.subscribe()));

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/runs", post(start_run).get(list_runs))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/resume", post(resume_run))
        .route("/events", get(sse_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("could not bind {bind}"))?;
    info!("dashboard running at http://{bind}");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Keeps run views current from the shared progress stream.
async fn track_runs(runs: Runs, rx: broadcast::Receiver<ProgressEvent>) {
    let mut stream = BroadcastStream::new(rx);
    while let Some(event) = stream.next().await {
        let Ok(event) = event else {
            continue;
        };
        let mut guard = runs.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = guard.get_mut(event.run_id()) else {
            continue;
        };
        match event {
            ProgressEvent::Iteration { iteration, state, .. } => {
                entry.view.iteration = iteration;
                entry.view.state = state;
                entry.view.waiting_for_captcha = false;
            }
            ProgressEvent::CaptchaWait { .. } => {
                entry.view.state = FlowState::Captcha;
                entry.view.waiting_for_captcha = true;
            }
            ProgressEvent::Finished(result) => {
                entry.view.waiting_for_captcha = false;
                entry.view.result = Some(result);
            }
        }
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn start_run(State(state): State<AppState>, Json(payload): Json<StartPayload>) -> impl IntoResponse {
    if !payload.url.starts_with("http://") && !payload.url.starts_with("https://") {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "url must be http(s)"})));
    }
    let mut request = RunRequest::new(payload.url);
    request.profile_ref = payload.profile_ref;
    request.max_iterations = payload.max_iterations;
    request.timeout_ms = payload.timeout_ms;

    let control = RunControl::new();
    let run_id = request.run_id.clone();
    state
        .runs
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(
            run_id.clone(),
            RunEntry {
                control: control.clone(),
                view: RunView {
                    run_id: run_id.clone(),
                    url: request.url.clone(),
                    state: FlowState::Initial,
                    iteration: 0,
                    waiting_for_captcha: false,
                    result: None,
                },
            },
        );
    info!(run_id = %run_id, url = %request.url, "run requested");

    tokio::spawn(async move {
        let outcome = crate::execute_run(
            &state.config,
            &request,
            control,
            state.sink.clone(),
            Some(state.events.clone()),
        )
        .await;
        if let Err(err) = outcome {
            warn!(run_id = %request.run_id, error = %format!("{err:#}"), "run could not start");
            let _ = state.events.send(ProgressEvent::Finished(RunResult {
                run_id: request.run_id.clone(),
                status: RunStatus::Blocked,
                iterations_used: 0,
                reason: format!("fatal: {err:#}"),
                flagged: vec![],
                finished_at: Utc::now(),
            }));
        }
    });

    (StatusCode::ACCEPTED, Json(json!({ "run_id": run_id })))
}

async fn list_runs(State(state): State<AppState>) -> Json<Vec<RunView>> {
    let runs = state.runs.lock().unwrap_or_else(PoisonError::into_inner);
    Json(runs.values().map(|e| e.view.clone()).collect())
}

async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<RunView>, StatusCode> {
    let runs = state.runs.lock().unwrap_or_else(PoisonError::into_inner);
    runs.get(&id).map(|e| Json(e.view.clone())).ok_or(StatusCode::NOT_FOUND)
}

fn with_control(state: &AppState, id: &str, act: impl FnOnce(&RunControl)) -> StatusCode {
    let runs = state.runs.lock().unwrap_or_else(PoisonError::into_inner);
    match runs.get(id) {
        Some(entry) if entry.view.result.is_none() => {
            act(&entry.control);
            StatusCode::ACCEPTED
        }
        Some(_) => StatusCode::CONFLICT,
        None => StatusCode::NOT_FOUND,
    }
}

async fn cancel_run(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    info!(run_id = %id, "cancel requested");
    with_control(&state, &id, RunControl::cancel)
}

async fn resume_run(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    info!(run_id = %id, "CAPTCHA resume signalled");
    with_control(&state, &id, RunControl::resume)
}

async fn sse_handler(State(state): State<AppState>) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result: Result<ProgressEvent, _>| match result {
        Ok(event) => {
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            Some(Ok::<_, Infallible>(Event::default().event(event.name()).data(data)))
        }
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>autoapply</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body { background: #0a0a0f; color: #e0e0e0; font-family: system-ui, sans-serif; min-height: 100vh; }
  header { padding: 20px 32px; border-bottom: 1px solid #1a1a2e; }
  header h1 { font-size: 20px; color: #fff; }
  .main { max-width: 900px; margin: 0 auto; padding: 24px 32px; display: flex; flex-direction: column; gap: 16px; }
  form { display: flex; gap: 8px; }
  input { flex: 1; background: #111118; border: 1px solid #222; border-radius: 8px; padding: 10px 14px; color: #fff; }
  button { background: #6366f1; color: #fff; border: none; border-radius: 8px; padding: 10px 18px; cursor: pointer; }
  button.secondary { background: #333; }
  .run { background: #111118; border-radius: 8px; padding: 12px 16px; display: flex; gap: 12px; align-items: center; }
  .run .url { flex: 1; overflow: hidden; text-overflow: ellipsis; white-space: nowrap; }
  .state { font-family: monospace; color: #93c5fd; }
  .captcha { color: #fcd34d; }
  .SUCCESS { color: #86efac; }
  .BLOCKED, .CAPTCHA_TIMEOUT, .MAX_ITERATIONS, .CANCELLED { color: #fca5a5; }
  #log { font-family: monospace; font-size: 12px; display: flex; flex-direction: column; gap: 4px; }
</style>
</head>
<body>
  <header><h1>autoapply</h1></header>
  <div class="main">
    <form id="start">
      <input id="url" type="url" placeholder="https://jobs.example.com/posting/123" required>
      <button type="submit">Apply</button>
    </form>
    <div id="runs"></div>
    <div id="log"></div>
  </div>
<script>
  const runs = {};
  const esc = s => String(s ?? '').replace(/</g, '&lt;');

  function render() {
    const el = document.getElementById('runs');
    el.innerHTML = Object.values(runs).map(r => `
      <div class="run">
        <span class="url">${esc(r.url)}</span>
        <span class="state ${r.captcha ? 'captcha' : ''}">${esc(r.state)} #${r.iteration}</span>
        ${r.status ? `<span class="${r.status}">${r.status}</span>` : `
          ${r.captcha ? `<button onclick="act('${r.id}','resume')">Solved</button>` : ''}
          <button class="secondary" onclick="act('${r.id}','cancel')">Cancel</button>`}
      </div>`).join('');
  }

  function logLine(text) {
    const div = document.createElement('div');
    div.textContent = text;
    document.getElementById('log').prepend(div);
  }

  async function act(id, what) { await fetch(`/runs/${id}/${what}`, { method: 'POST' }); }

  document.getElementById('start').addEventListener('submit', async e => {
    e.preventDefault();
    const url = document.getElementById('url').value.trim();
    const res = await fetch('/runs', {
      method: 'POST',
      headers: { 'Content-Type': 'application/json' },
      body: JSON.stringify({ url }),
    });
    const body = await res.json();
    if (body.run_id) { runs[body.run_id] = { id: body.run_id, url, state: 'INITIAL', iteration: 0 }; render(); }
    else logLine('error: ' + body.error);
  });

  const es = new EventSource('/events');
  es.addEventListener('iteration', e => {
    const d = JSON.parse(e.data);
    const r = runs[d.run_id] ||= { id: d.run_id, url: '' };
    Object.assign(r, { state: d.state, iteration: d.iteration, captcha: false });
    logLine(`[${d.iteration}] ${d.state} ${d.action ?? ''} ${d.result && !d.result.success ? 'FAILED' : ''}`);
    render();
  });
  es.addEventListener('captcha_wait', e => {
    const d = JSON.parse(e.data);
    const r = runs[d.run_id] ||= { id: d.run_id, url: '' };
    Object.assign(r, { state: 'CAPTCHA', captcha: true });
    render();
  });
  es.addEventListener('finished', e => {
    const d = JSON.parse(e.data);
    const r = runs[d.run_id] ||= { id: d.run_id, url: '' };
    Object.assign(r, { status: d.status, captcha: false });
    logLine(`${d.status}: ${d.reason}`);
    render();
  });
</script>
</body>
</html>
"##;

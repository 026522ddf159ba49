//! HTTP adapter for a Temporal frontend.
//!
//! Talks to the JSON HTTP API (`/api/v1/namespaces/{ns}/workflows/...`) and maps
//! its responses onto [`RunHandle`] operations. Payloads are exchanged in their
//! plain-JSON shorthand form.

use super::{
    gen_request_id, EngineError, ExecutionStatus, RunHandle, RunUpdate, StartRequest,
    WorkflowEngine,
};
use crate::model::{EngineConfig, FinalResult, StatusSnapshot};
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode, Url};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const STATUS_QUERY: &str = "get_status";
const END_SIGNAL: &str = "end_workflow_signal";
const UPDATE_STAGE_COMPLETED: &str = "UPDATE_WORKFLOW_EXECUTION_LIFECYCLE_STAGE_COMPLETED";
const CLOSE_EVENT_FILTER: &str = "HISTORY_EVENT_FILTER_TYPE_CLOSE_EVENT";
const BODY_PREVIEW_LIMIT: usize = 512;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause before re-attaching to an update whose outcome was not ready yet.
const UPDATE_REPOLL_DELAY: Duration = Duration::from_millis(200);
const UPDATE_MAX_ATTEMPTS: usize = 10;

struct Inner {
    http: reqwest::Client,
    namespace_url: Url,
    api_key: Option<String>,
    request_timeout: Duration,
    long_poll_timeout: Duration,
}

/// Engine client; cheap to clone, handles share the underlying connection pool.
#[derive(Clone)]
pub struct TemporalClient {
    inner: Arc<Inner>,
}

impl TemporalClient {
    pub fn new(cfg: &EngineConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        let mut namespace_url = Url::parse(cfg.base_url.trim_end_matches('/'))?;
        namespace_url
            .path_segments_mut()
            .map_err(|_| anyhow::anyhow!("engine url cannot be a base: {}", cfg.base_url))?
            .pop_if_empty()
            .extend(["api", "v1", "namespaces", cfg.namespace.as_str()]);
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                namespace_url,
                api_key: cfg.api_key.clone().filter(|k| !k.trim().is_empty()),
                request_timeout: cfg.request_timeout,
                long_poll_timeout: cfg.long_poll_timeout,
            }),
        })
    }

    /// Confirms the engine answers and the namespace exists.
    pub async fn check_connection(&self) -> Result<(), EngineError> {
        let url = self.inner.namespace_url.clone();
        let req = self.inner.http.get(url.clone());
        match self.send(req, &url, self.inner.request_timeout, "").await {
            Ok(_) => Ok(()),
            Err(EngineError::NotFound { .. }) => Err(EngineError::Rejected {
                status: 404,
                url: url.to_string(),
                message: "namespace not found".into(),
            }),
            Err(e) => Err(e),
        }
    }

    fn workflow_url(&self, run_id: &str, tail: &[&str]) -> Url {
        let mut url = self.inner.namespace_url.clone();
        if let Ok(mut segs) = url.path_segments_mut() {
            segs.extend(["workflows", run_id]).extend(tail);
        }
        url
    }

    /// Sends a request and decodes a JSON body, mapping transport and status
    /// failures onto [`EngineError`].
    async fn send(
        &self,
        req: RequestBuilder,
        url: &Url,
        timeout: Duration,
        run_id: &str,
    ) -> Result<Value, EngineError> {
        let req = match self.inner.api_key.as_deref() {
            Some(key) => req.bearer_auth(key),
            None => req,
        };
        let resp = req
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, url))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| transport_error(e, url))?;
        tracing::debug!(url = %url, status = %status, body_len = body.len(), "engine response");

        if status == StatusCode::NOT_FOUND {
            return Err(EngineError::NotFound {
                run_id: run_id.to_string(),
            });
        }
        if status == StatusCode::CONFLICT {
            return Err(EngineError::AlreadyStarted {
                run_id: run_id.to_string(),
            });
        }
        if !status.is_success() {
            return Err(EngineError::Rejected {
                status: status.as_u16(),
                url: url.to_string(),
                message: error_message(&body),
            });
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| EngineError::Decode(format!("{e} | body={}", preview_body(&body))))
    }

    async fn describe_run(&self, run_id: &str) -> Result<ExecutionStatus, EngineError> {
        let url = self.workflow_url(run_id, &[]);
        let req = self.inner.http.get(url.clone());
        let v = self.send(req, &url, self.inner.request_timeout, run_id).await?;
        let raw = v
            .pointer("/workflowExecutionInfo/status")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Decode("describe response has no status".into()))?;
        Ok(ExecutionStatus::parse(raw))
    }
}

#[async_trait]
impl WorkflowEngine for TemporalClient {
    type Handle = TemporalRun;

    async fn get_handle(&self, run_id: &str) -> Result<TemporalRun, EngineError> {
        // A handle is only worth returning when the engine knows the id.
        let status = self.describe_run(run_id).await?;
        tracing::debug!(run_id, %status, "found existing run");
        Ok(TemporalRun {
            client: self.clone(),
            run_id: run_id.to_string(),
        })
    }

    async fn start(&self, req: &StartRequest) -> Result<TemporalRun, EngineError> {
        let url = self.workflow_url(&req.run_id, &[]);
        let body = json!({
            "workflowId": req.run_id,
            "workflowType": { "name": req.workflow_type },
            "taskQueue": { "name": req.task_queue },
            "input": req.initial_args(),
            "requestId": req.request_id,
        });
        let http_req = self.inner.http.post(url.clone()).json(&body);
        let v = self
            .send(http_req, &url, self.inner.request_timeout, &req.run_id)
            .await?;
        let engine_run = v.get("runId").and_then(Value::as_str).unwrap_or("-");
        tracing::info!(run_id = %req.run_id, engine_run, "started workflow run");
        Ok(TemporalRun {
            client: self.clone(),
            run_id: req.run_id.clone(),
        })
    }
}

/// Handle to one workflow id. Calls target the latest run under that id.
#[derive(Clone)]
pub struct TemporalRun {
    client: TemporalClient,
    run_id: String,
}

impl TemporalRun {
    async fn poll_close_event(&self, page_token: Option<&str>) -> Result<Value, EngineError> {
        let mut url = self.client.workflow_url(&self.run_id, &["history"]);
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("waitNewEvent", "true")
                .append_pair("historyEventFilterType", CLOSE_EVENT_FILTER);
            if let Some(token) = page_token {
                q.append_pair("nextPageToken", token);
            }
        }
        let req = self.client.inner.http.get(url.clone());
        self.client
            .send(req, &url, self.client.inner.long_poll_timeout, &self.run_id)
            .await
    }
}

#[async_trait]
impl RunHandle for TemporalRun {
    fn run_id(&self) -> &str {
        &self.run_id
    }

    async fn query_status(&self) -> Result<Option<StatusSnapshot>, EngineError> {
        let url = self.client.workflow_url(&self.run_id, &["query", STATUS_QUERY]);
        let body = json!({ "query": { "queryType": STATUS_QUERY } });
        let req = self.client.inner.http.post(url.clone()).json(&body);
        let v = self
            .client
            .send(req, &url, self.client.inner.request_timeout, &self.run_id)
            .await?;
        if let Some(rejected) = v.get("queryRejected").filter(|r| !r.is_null()) {
            return Err(EngineError::Rejected {
                status: 200,
                url: url.to_string(),
                message: format!("query rejected: {rejected}"),
            });
        }
        match first_payload(v.get("queryResult")) {
            None | Some(Value::Null) => Ok(None),
            Some(p) => serde_json::from_value(p)
                .map(Some)
                .map_err(|e| EngineError::Decode(format!("status snapshot: {e}"))),
        }
    }

    async fn update(&self, update: RunUpdate) -> Result<StatusSnapshot, EngineError> {
        let name = update.name();
        let url = self.client.workflow_url(&self.run_id, &["update", name]);
        let body = json!({
            "request": {
                "meta": { "updateId": gen_request_id() },
                "input": { "name": name, "args": [update.payload()?] },
            },
            "waitPolicy": { "lifecycleStage": UPDATE_STAGE_COMPLETED },
        });
        tracing::debug!(run_id = %self.run_id, update = name, "sending update");

        // The engine may answer before the handler finishes. Re-sending with the same
        // update id attaches to the same update rather than applying it again.
        for attempt in 1..=UPDATE_MAX_ATTEMPTS {
            let req = self.client.inner.http.post(url.clone()).json(&body);
            let v = self
                .client
                .send(req, &url, self.client.inner.long_poll_timeout, &self.run_id)
                .await?;
            let Some(outcome) = v.get("outcome").filter(|o| !o.is_null()) else {
                tracing::debug!(run_id = %self.run_id, update = name, attempt, "update still in flight");
                tokio::time::sleep(UPDATE_REPOLL_DELAY).await;
                continue;
            };
            if let Some(failure) = outcome.get("failure") {
                return Err(EngineError::UpdateRejected {
                    name,
                    message: failure_message(failure),
                });
            }
            return match first_payload(outcome.get("success")) {
                Some(p) if !p.is_null() => serde_json::from_value(p)
                    .map_err(|e| EngineError::Decode(format!("{name} result: {e}"))),
                _ => Err(EngineError::Decode(format!("{name} returned no snapshot"))),
            };
        }
        Err(EngineError::Unreachable {
            url: url.to_string(),
            message: format!(
                "update {name} still had no outcome after {UPDATE_MAX_ATTEMPTS} attempts"
            ),
        })
    }

    async fn signal_end(&self) -> Result<(), EngineError> {
        let url = self.client.workflow_url(&self.run_id, &["signal", END_SIGNAL]);
        let body = json!({ "input": [], "requestId": gen_request_id() });
        let req = self.client.inner.http.post(url.clone()).json(&body);
        self.client
            .send(req, &url, self.client.inner.request_timeout, &self.run_id)
            .await?;
        Ok(())
    }

    async fn describe(&self) -> Result<ExecutionStatus, EngineError> {
        self.client.describe_run(&self.run_id).await
    }

    async fn result(&self) -> Result<FinalResult, EngineError> {
        let mut page_token: Option<String> = None;
        loop {
            let v = self.poll_close_event(page_token.as_deref()).await?;
            let events = v
                .pointer("/history/events")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            let Some(event) = events.last() else {
                // Long poll expired without a close event.
                page_token = v
                    .get("nextPageToken")
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string);
                continue;
            };

            match close_event(&self.run_id, event)? {
                Closed::Done(result) => return Ok(result),
                Closed::ContinuedAsNew => {
                    tracing::info!(run_id = %self.run_id, "run continued as new, following");
                    page_token = None;
                }
            }
        }
    }
}

enum Closed {
    Done(FinalResult),
    ContinuedAsNew,
}

/// Interprets a workflow close event from the history long poll.
fn close_event(run_id: &str, event: &Value) -> Result<Closed, EngineError> {
    let raw = event.get("eventType").and_then(Value::as_str).unwrap_or("");
    let kind = raw
        .trim_start_matches("EVENT_TYPE_")
        .replace('_', "")
        .to_ascii_uppercase();
    let failed = |status: ExecutionStatus, message: String| EngineError::RunFailed {
        run_id: run_id.to_string(),
        status,
        message,
    };

    match kind.as_str() {
        "WORKFLOWEXECUTIONCOMPLETED" => {
            let payload =
                first_payload(event.pointer("/workflowExecutionCompletedEventAttributes/result"))
                    .unwrap_or(Value::Null);
            if payload.is_null() {
                return Ok(Closed::Done(FinalResult::Text(String::new())));
            }
            serde_json::from_value(payload)
                .map(Closed::Done)
                .map_err(|e| EngineError::Decode(format!("final result: {e}")))
        }
        "WORKFLOWEXECUTIONCONTINUEDASNEW" => Ok(Closed::ContinuedAsNew),
        "WORKFLOWEXECUTIONFAILED" => Err(failed(
            ExecutionStatus::Failed,
            event
                .pointer("/workflowExecutionFailedEventAttributes/failure")
                .map(failure_message)
                .unwrap_or_else(|| "workflow failed".into()),
        )),
        "WORKFLOWEXECUTIONTIMEDOUT" => {
            Err(failed(ExecutionStatus::TimedOut, "workflow timed out".into()))
        }
        "WORKFLOWEXECUTIONCANCELED" => {
            Err(failed(ExecutionStatus::Canceled, "workflow canceled".into()))
        }
        "WORKFLOWEXECUTIONTERMINATED" => Err(failed(
            ExecutionStatus::Terminated,
            event
                .pointer("/workflowExecutionTerminatedEventAttributes/reason")
                .and_then(Value::as_str)
                .filter(|r| !r.is_empty())
                .unwrap_or("workflow terminated")
                .to_string(),
        )),
        _ => Err(EngineError::Decode(format!(
            "unexpected close event type {raw:?}"
        ))),
    }
}

/// First value of a payload list, accepting both `[..]` and `{"payloads":[..]}`.
fn first_payload(v: Option<&Value>) -> Option<Value> {
    let v = v?;
    let list = v.get("payloads").unwrap_or(v);
    match list {
        Value::Array(items) => items.first().cloned(),
        Value::Null => None,
        other => Some(other.clone()),
    }
}

fn failure_message(failure: &Value) -> String {
    failure
        .get("message")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| failure.to_string())
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| preview_body(body))
}

fn transport_error(err: reqwest::Error, url: &Url) -> EngineError {
    if err.is_decode() {
        return EngineError::Decode(err.to_string());
    }
    EngineError::Unreachable {
        url: url.to_string(),
        message: err.to_string(),
    }
}

fn preview_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }
    let mut out: String = trimmed.chars().take(BODY_PREVIEW_LIMIT).collect();
    if trimmed.chars().count() > BODY_PREVIEW_LIMIT {
        out.push_str("...");
    }
    out
}

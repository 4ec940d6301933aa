//! CallbackSender - best-effort completion notices.
//!
//! A terminal task is POSTed as JSON to its `callback_url`. Delivery runs on
//! a detached tokio task: the completing caller never waits on it and never
//! sees its failures, which only show up in the logs.
//!
//! Transport errors (connect, timeout) are retried with `RetryPolicy`. A
//! response of any status ends delivery; non-2xx is logged and dropped.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::retry::RetryPolicy;
use crate::domain::{Task, TaskState};

pub const TRACEPARENT: &str = "traceparent";

#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("building callback http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("callback transport: {0}")]
    Transport(#[source] reqwest::Error),
}

/// JSON body of a completion notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub task_id: String,
    pub namespace: String,
    pub task_type: String,
    pub state: TaskState,
    /// Base64 (standard alphabet, padded).
    pub output_args: String,
    pub error_msg: String,
    pub trace_id: String,
    /// Unix millis of the terminal transition.
    pub completed_at: i64,
}

impl CallbackPayload {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.to_string(),
            namespace: task.namespace.clone(),
            task_type: task.task_type.to_string(),
            state: task.state,
            output_args: BASE64.encode(&task.output_args),
            error_msg: task.error_msg.clone(),
            trace_id: task.trace_id.clone(),
            completed_at: task.utime,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// No callback URL on the task.
    Skipped,
    Delivered { status: u16, attempts: u32 },
    Rejected { status: u16, attempts: u32 },
    Failed { attempts: u32, error: String },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

#[derive(Clone)]
pub struct CallbackSender {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl CallbackSender {
    pub fn new(timeout: Duration, policy: RetryPolicy) -> Result<Self, CallbackError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(CallbackError::Client)?;
        Ok(Self { client, policy })
    }

    /// Fire and forget. Returns `None` when there is nothing to send.
    pub fn notify(&self, task: &Task) -> Option<JoinHandle<DeliveryOutcome>> {
        if task.callback_url.is_empty() {
            return None;
        }
        let sender = self.clone();
        let task = task.clone();
        Some(tokio::spawn(async move { sender.deliver(&task).await }))
    }

    pub async fn deliver(&self, task: &Task) -> DeliveryOutcome {
        if task.callback_url.is_empty() {
            return DeliveryOutcome::Skipped;
        }
        let payload = CallbackPayload::from_task(task);

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.post(task, &payload).await {
                Ok(status) if (200..300).contains(&status) => {
                    info!(
                        task_id = %task.id,
                        url = %task.callback_url,
                        status,
                        attempts,
                        "callback delivered"
                    );
                    return DeliveryOutcome::Delivered { status, attempts };
                }
                Ok(status) => {
                    warn!(
                        task_id = %task.id,
                        url = %task.callback_url,
                        status,
                        "callback rejected by receiver"
                    );
                    return DeliveryOutcome::Rejected { status, attempts };
                }
                Err(e) if self.policy.should_retry(attempts) => {
                    let delay = self.policy.next_delay(attempts);
                    debug!(
                        task_id = %task.id,
                        error = %e,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "callback attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        task_id = %task.id,
                        url = %task.callback_url,
                        error = %e,
                        attempts,
                        "callback dropped"
                    );
                    return DeliveryOutcome::Failed {
                        attempts,
                        error: e.to_string(),
                    };
                }
            }
        }
    }

    async fn post(&self, task: &Task, payload: &CallbackPayload) -> Result<u16, CallbackError> {
        let mut request = self.client.post(&task.callback_url).json(payload);
        if let Some(header) = traceparent(&task.trace_id) {
            request = request.header(TRACEPARENT, header);
        }
        let response = request.send().await.map_err(CallbackError::Transport)?;
        Ok(response.status().as_u16())
    }
}

/// W3C `traceparent` continuing `trace_id` under a fresh span.
///
/// `None` unless the stored trace id is 32 lowercase hex chars and not all
/// zeros.
pub fn traceparent(trace_id: &str) -> Option<HeaderValue> {
    let valid = trace_id.len() == 32
        && trace_id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        && trace_id.bytes().any(|b| b != b'0');
    if !valid {
        return None;
    }
    let span_id = rand::random::<u64>().max(1);
    HeaderValue::from_str(&format!("00-{trace_id}-{span_id:016x}-01")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Settings, TaskId, TaskType};
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::sync::mpsc;
    use ulid::Ulid;

    const TRACE_ID: &str = "4bf92f3577b34da6a3ce929d0e0e4736";

    type Received = (Option<String>, CallbackPayload);

    #[derive(Clone)]
    struct Receiver {
        tx: mpsc::UnboundedSender<Received>,
        status: StatusCode,
    }

    async fn receive(
        State(receiver): State<Receiver>,
        headers: HeaderMap,
        Json(payload): Json<CallbackPayload>,
    ) -> StatusCode {
        let traceparent = headers
            .get(TRACEPARENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let _ = receiver.tx.send((traceparent, payload));
        receiver.status
    }

    async fn spawn_receiver(status: StatusCode) -> (String, mpsc::UnboundedReceiver<Received>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Router::new()
            .route("/done", post(receive))
            .with_state(Receiver { tx, status });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/done"), rx)
    }

    fn finished(callback_url: &str) -> Task {
        Task {
            id: TaskId::from_ulid(Ulid::new()),
            namespace: "media".into(),
            task_type: TaskType::new("resize_image"),
            input_args: b"in".to_vec(),
            output_args: b"thumb.png".to_vec(),
            callback_url: callback_url.into(),
            state: TaskState::Success,
            trace_id: TRACE_ID.into(),
            max_retry_cnt: 3,
            expire_time: 0,
            settings: Settings::new(),
            error_msg: String::new(),
            ctime: 1_000,
            utime: 2_000,
            version: 3,
        }
    }

    fn sender(max_attempts: u32) -> CallbackSender {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_attempts,
            ..RetryPolicy::default()
        };
        CallbackSender::new(Duration::from_secs(2), policy).unwrap()
    }

    #[tokio::test]
    async fn posts_payload_with_traceparent() {
        let (url, mut rx) = spawn_receiver(StatusCode::OK).await;
        let task = finished(&url);

        let outcome = sender(3).deliver(&task).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { status: 200, attempts: 1 });

        let (traceparent, payload) = rx.recv().await.unwrap();
        assert_eq!(payload, CallbackPayload::from_task(&task));
        assert_eq!(payload.state, TaskState::Success);
        assert_eq!(BASE64.decode(&payload.output_args).unwrap(), b"thumb.png");
        assert_eq!(payload.completed_at, 2_000);

        let traceparent = traceparent.unwrap();
        let parts: Vec<&str> = traceparent.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "00");
        assert_eq!(parts[1], TRACE_ID);
        assert_eq!(parts[2].len(), 16);
        assert_eq!(parts[3], "01");
    }

    #[tokio::test]
    async fn serialized_state_is_snake_case() {
        let (url, mut rx) = spawn_receiver(StatusCode::OK).await;
        let task = finished(&url);
        sender(1).notify(&task).unwrap().await.unwrap();
        let (_, payload) = rx.recv().await.unwrap();
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["state"], "success");
    }

    #[tokio::test]
    async fn non_2xx_is_not_retried() {
        let (url, mut rx) = spawn_receiver(StatusCode::INTERNAL_SERVER_ERROR).await;
        let outcome = sender(3).deliver(&finished(&url)).await;

        assert_eq!(outcome, DeliveryOutcome::Rejected { status: 500, attempts: 1 });
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn transport_errors_are_retried_then_dropped() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = sender(3).deliver(&finished(&format!("http://{addr}/done"))).await;
        assert!(matches!(outcome, DeliveryOutcome::Failed { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn empty_url_sends_nothing() {
        let sender = sender(3);
        let task = finished("");
        assert!(sender.notify(&task).is_none());
        assert_eq!(sender.deliver(&task).await, DeliveryOutcome::Skipped);
    }

    #[tokio::test]
    async fn malformed_trace_id_omits_header() {
        let (url, mut rx) = spawn_receiver(StatusCode::NO_CONTENT).await;
        let mut task = finished(&url);
        task.trace_id = "not-a-trace".into();

        assert!(sender(1).deliver(&task).await.is_delivered());
        let (traceparent, _) = rx.recv().await.unwrap();
        assert!(traceparent.is_none());
    }

    #[test]
    fn traceparent_requires_32_lowercase_hex() {
        assert!(traceparent(TRACE_ID).is_some());
        assert!(traceparent(&TRACE_ID.to_uppercase()).is_none());
        assert!(traceparent("00000000000000000000000000000000").is_none());
        assert!(traceparent("abc").is_none());
        assert!(traceparent("").is_none());
    }
}

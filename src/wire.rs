//! Line-delimited JSON protocol.
//!
//! Each request is one JSON object on its own line, tagged by `op`. Every
//! request gets exactly one response line, `{"ok":true,"result":…}` or
//! `{"ok":false,"error":{"kind":…,"message":…}}`. After `listen`, booking
//! events for that side are interleaved as `{"event":…}` lines.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::engine::{Engine, EngineError, Extension, InstanceEdit, TemplateDraft};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::notify::BookingEvent;
use crate::observability;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Submit {
        actor: Actor,
        booking: TemplateDraft,
    },
    EditInstances {
        actor: Actor,
        template_id: Ulid,
        edits: Vec<InstanceEdit>,
        #[serde(default)]
        override_reason: Option<String>,
    },
    Extend {
        actor: Actor,
        template_id: Ulid,
        extension: Extension,
    },
    RemoveInstance {
        actor: Actor,
        instance_id: Ulid,
        #[serde(default)]
        override_reason: Option<String>,
    },
    Cancel {
        actor: Actor,
        template_id: Ulid,
    },
    Confirm {
        actor: Actor,
        template_id: Ulid,
    },
    Complete {
        actor: Actor,
        template_id: Ulid,
    },
    MarkProcessed {
        actor: Actor,
        template_id: Ulid,
    },
    Get {
        template_id: Ulid,
    },
    ChangeReport {
        template_id: Ulid,
    },
    CapacitySchedule {
        side: Side,
    },
    SetCapacitySchedule {
        actor: Actor,
        side: Side,
        schedule: CapacitySchedule,
    },
    Listen {
        side: Side,
    },
    Unlisten {
        side: Side,
    },
    Ping,
}

impl Request {
    fn op(&self) -> &'static str {
        match self {
            Request::Submit { .. } => "submit",
            Request::EditInstances { .. } => "edit_instances",
            Request::Extend { .. } => "extend",
            Request::RemoveInstance { .. } => "remove_instance",
            Request::Cancel { .. } => "cancel",
            Request::Confirm { .. } => "confirm",
            Request::Complete { .. } => "complete",
            Request::MarkProcessed { .. } => "mark_processed",
            Request::Get { .. } => "get",
            Request::ChangeReport { .. } => "change_report",
            Request::CapacitySchedule { .. } => "capacity_schedule",
            Request::SetCapacitySchedule { .. } => "set_capacity_schedule",
            Request::Listen { .. } => "listen",
            Request::Unlisten { .. } => "unlisten",
            Request::Ping => "ping",
        }
    }
}

#[derive(Debug)]
pub enum WireError {
    Codec(LinesCodecError),
    Encode(serde_json::Error),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Codec(e) => write!(f, "codec: {e}"),
            WireError::Encode(e) => write!(f, "encode: {e}"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<LinesCodecError> for WireError {
    fn from(e: LinesCodecError) -> Self {
        WireError::Codec(e)
    }
}

impl From<serde_json::Error> for WireError {
    fn from(e: serde_json::Error) -> Self {
        WireError::Encode(e)
    }
}

fn ok(result: Value) -> Value {
    json!({ "ok": true, "result": result })
}

fn failure(kind: &str, message: String, detail: Option<Value>) -> Value {
    let mut error = json!({ "kind": kind, "message": message });
    if let Some(detail) = detail {
        error["detail"] = detail;
    }
    json!({ "ok": false, "error": error })
}

fn engine_failure(e: &EngineError) -> Value {
    metrics::counter!(observability::REJECTIONS_TOTAL, "kind" => e.kind()).increment(1);
    let detail = match e {
        EngineError::Validation(problems) => serde_json::to_value(problems).ok(),
        EngineError::Conflict(report) => serde_json::to_value(report).ok(),
        EngineError::Capacity(report) => serde_json::to_value(report).ok(),
        _ => None,
    };
    failure(e.kind(), e.to_string(), detail)
}

fn to_result<T: serde::Serialize>(r: Result<T, EngineError>) -> Value {
    match r {
        Ok(v) => match serde_json::to_value(v) {
            Ok(v) => ok(v),
            Err(e) => failure("internal", e.to_string(), None),
        },
        Err(e) => engine_failure(&e),
    }
}

/// Per-connection event subscriptions. Each listened side gets a forwarding
/// task that feeds the connection's outbound queue.
struct Subscriptions {
    tx: mpsc::Sender<BookingEvent>,
    active: HashMap<Side, JoinHandle<()>>,
}

impl Subscriptions {
    fn listen(&mut self, side: Side, mut rx: broadcast::Receiver<BookingEvent>) {
        if self.active.contains_key(&side) {
            return;
        }
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(side = %side, "listener lagged, {n} events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.active.insert(side, handle);
    }

    fn unlisten(&mut self, side: Side) -> bool {
        match self.active.remove(&side) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        for (_, handle) in self.active.drain() {
            handle.abort();
        }
    }
}

async fn execute(engine: &Engine, subs: &mut Subscriptions, req: Request) -> Value {
    match req {
        Request::Submit { actor, booking } => to_result(engine.submit_booking(&actor, booking).await),
        Request::EditInstances { actor, template_id, edits, override_reason } => {
            to_result(engine.edit_instances(&actor, template_id, edits, override_reason).await)
        }
        Request::Extend { actor, template_id, extension } => {
            to_result(engine.extend_booking(&actor, template_id, extension).await)
        }
        Request::RemoveInstance { actor, instance_id, override_reason } => to_result(
            engine
                .remove_instance(&actor, instance_id, override_reason)
                .await
                .map(|status| json!({ "status": status })),
        ),
        Request::Cancel { actor, template_id } => to_result(
            engine.cancel_booking(&actor, template_id).await.map(|status| json!({ "status": status })),
        ),
        Request::Confirm { actor, template_id } => to_result(
            engine.confirm_booking(&actor, template_id).await.map(|status| json!({ "status": status })),
        ),
        Request::Complete { actor, template_id } => to_result(
            engine.complete_booking(&actor, template_id).await.map(|status| json!({ "status": status })),
        ),
        Request::MarkProcessed { actor, template_id } => to_result(engine.mark_processed(&actor, template_id).await),
        Request::Get { template_id } => to_result(engine.get_booking(template_id).await),
        Request::ChangeReport { template_id } => to_result(engine.change_report(template_id).await),
        Request::CapacitySchedule { side } => to_result(engine.capacity_schedule(side).await),
        Request::SetCapacitySchedule { actor, side, schedule } => to_result(
            engine
                .set_capacity_schedule(&actor, side, schedule)
                .await
                .map(|()| json!({ "side": side })),
        ),
        Request::Listen { side } => {
            subs.listen(side, engine.notify.subscribe(side));
            ok(json!({ "listening": side }))
        }
        Request::Unlisten { side } => {
            let was = subs.unlisten(side);
            ok(json!({ "unlistened": side, "was_listening": was }))
        }
        Request::Ping => ok(json!("pong")),
    }
}

async fn handle_line(engine: &Engine, subs: &mut Subscriptions, line: &str) -> Value {
    let req: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => "unknown", "status" => "bad_request").increment(1);
            return failure("bad_request", e.to_string(), None);
        }
    };
    let op = req.op();
    let started = Instant::now();
    let response = execute(engine, subs, req).await;
    let status = if response["ok"] == Value::Bool(true) { "ok" } else { "error" };
    metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
    tracing::debug!(op, status, "request handled");
    response
}

/// Serve one client until it disconnects.
pub async fn process_connection<S>(socket: S, engine: Arc<Engine>) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (tx, mut events) = mpsc::channel(256);
    let mut subs = Subscriptions { tx, active: HashMap::new() };

    loop {
        tokio::select! {
            line = framed.next() => {
                let response = match line {
                    None => break,
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => handle_line(&engine, &mut subs, &line).await,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        failure("line_too_long", format!("requests are limited to {MAX_LINE_LEN} bytes"), None)
                    }
                    Some(Err(e)) => return Err(e.into()),
                };
                framed.send(serde_json::to_string(&response)?).await?;
            }
            Some(event) = events.recv() => {
                framed.send(serde_json::to_string(&event)?).await?;
            }
        }
    }
    Ok(())
}

use crate::activity::ActivityLog;
use crate::config::DispatchDefaults;
use crate::connections::Connections;
use crate::pending::PendingTable;
use crate::roster::Roster;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::wire::{events, Frame};
use switchboard_core::{CommandRequest, LastLocation, RelayError, RequestOptions, RequestResult};
use tracing::{debug, info, warn};

/// Upper bound on `options.retries`, whatever the controller asks for.
pub const MAX_RETRIES: u32 = 10;

/// Effective settings for one dispatch after applying per-kind defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPlan {
    pub timeout: Duration,
    pub retries: u32,
    pub wait_for_response: bool,
    pub high_accuracy: bool,
}

/// Turns controller commands into forwarded agent commands and reports
/// exactly one `requestResult` per dispatch.
pub struct Dispatcher {
    defaults: DispatchDefaults,
    roster: Arc<Roster>,
    pending: Arc<PendingTable>,
    connections: Arc<Connections>,
    activity: Arc<ActivityLog>,
}

impl Dispatcher {
    pub fn new(
        defaults: DispatchDefaults,
        roster: Arc<Roster>,
        pending: Arc<PendingTable>,
        connections: Arc<Connections>,
        activity: Arc<ActivityLog>,
    ) -> Self {
        Self {
            defaults,
            roster,
            pending,
            connections,
            activity,
        }
    }

    pub fn plan(&self, kind: &str, options: &RequestOptions) -> DispatchPlan {
        let location = self.defaults.is_location(kind);
        let default_timeout = if location {
            self.defaults.location_timeout
        } else {
            self.defaults.timeout
        };
        let default_retries = if location {
            self.defaults.location_retries
        } else {
            self.defaults.retries
        };
        DispatchPlan {
            timeout: options
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(default_timeout),
            retries: options.retries.unwrap_or(default_retries).min(MAX_RETRIES),
            wait_for_response: options.wait_for_response.unwrap_or(true),
            high_accuracy: options.high_accuracy.unwrap_or(true),
        }
    }

    /// Runs the command to completion and reports the outcome to `controller`.
    pub async fn dispatch(&self, controller: &str, request: CommandRequest) -> RequestResult {
        let result = self.execute(&request).await;
        let to = result.to.as_deref().unwrap_or("?");
        let action = result.action.as_deref().unwrap_or("?");
        if result.ok {
            self.activity
                .info(format!("{action} -> {to}: {}", result.message.as_deref().unwrap_or("ok")))
                .await;
        } else {
            self.activity
                .warn(format!(
                    "{action} -> {to} failed: {}",
                    result.reason.as_deref().unwrap_or("unknown")
                ))
                .await;
        }
        let frame = Frame::from_serializable(events::REQUEST_RESULT, &result);
        if !self.connections.send_to(controller, frame).await {
            debug!(event = "result_undeliverable", controller = controller);
        }
        result
    }

    async fn execute(&self, request: &CommandRequest) -> RequestResult {
        let (target, kind) = match (request.target(), request.kind()) {
            (Some(target), Some(kind)) => (target, kind),
            (target, kind) => {
                let missing = if target.is_none() { "target agent" } else { "command kind" };
                let error = RelayError::InvalidRequest(format!("missing {missing}"));
                return RequestResult::failure(target, kind, &error);
            }
        };
        if events::is_reserved(kind) {
            let error = RelayError::InvalidRequest(format!("'{kind}' is not a command kind"));
            return RequestResult::failure(Some(target), Some(kind), &error);
        }
        if self.roster.live_handle(target).await.is_none() {
            let error = RelayError::AgentNotConnected(target.to_string());
            return RequestResult::failure(Some(target), Some(kind), &error);
        }

        let plan = self.plan(kind, &request.options);
        let data = self.command_data(kind, &request.data, &plan);

        if !plan.wait_for_response {
            return match self.forward(target, kind, &data, None).await {
                Ok(()) => RequestResult::sent(target, kind),
                Err(error) => RequestResult::failure(Some(target), Some(kind), &error),
            };
        }

        let attempts = plan.retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(target, kind, &data, plan.timeout).await {
                Ok(reply) => {
                    info!(event = "dispatch_ok", agent_id = target, kind = kind, attempt);
                    return RequestResult::success(target, kind, reply);
                }
                Err(error) if error.is_retryable() && attempt < attempts => {
                    warn!(
                        event = "dispatch_retry",
                        agent_id = target,
                        kind = kind,
                        attempt,
                        reason = error.code()
                    );
                    tokio::time::sleep(self.defaults.retry_backoff).await;
                }
                Err(error) => {
                    warn!(
                        event = "dispatch_failed",
                        agent_id = target,
                        kind = kind,
                        attempt,
                        reason = error.code()
                    );
                    return RequestResult::failure(Some(target), Some(kind), &error);
                }
            }
        }
    }

    /// One registration, one emission, one wait.
    async fn attempt(&self, target: &str, kind: &str, data: &Value, timeout: Duration) -> Result<Value, RelayError> {
        let (token, completion) = self.pending.register(target, kind, timeout).await;
        if let Err(error) = self.forward(target, kind, data, Some(&token)).await {
            self.pending.fail(target, kind, &token, error).await;
        }

        let reply = completion
            .await
            .map_err(|_| RelayError::Transport("pending request dropped".to_string()))??;

        if self.defaults.is_location(kind) && LastLocation::from_reply(&reply, 0).is_none() {
            return Err(RelayError::InvalidReply(
                "location reply without numeric lat/lon".to_string(),
            ));
        }
        Ok(reply)
    }

    /// The agent may have dropped since the last check, so the handle is
    /// looked up again for every emission.
    async fn forward(&self, target: &str, kind: &str, data: &Value, token: Option<&str>) -> Result<(), RelayError> {
        let handle = self
            .roster
            .live_handle(target)
            .await
            .ok_or_else(|| RelayError::AgentNotConnected(target.to_string()))?;
        let mut frame = Frame::new(kind, data.clone());
        if let Some(token) = token {
            frame = frame.with_request_id(token);
        }
        debug!(
            event = "dispatch_forward",
            agent_id = target,
            kind = kind,
            conn_id = %handle,
            token = token.unwrap_or_default()
        );
        if self.connections.send_to(&handle, frame).await {
            Ok(())
        } else {
            Err(RelayError::Transport(format!("could not queue command for {handle}")))
        }
    }

    fn command_data(&self, kind: &str, data: &Value, plan: &DispatchPlan) -> Value {
        if !self.defaults.is_location(kind) {
            return data.clone();
        }
        let mut object = match data {
            Value::Object(object) => object.clone(),
            Value::Null => Map::new(),
            other => return other.clone(),
        };
        let options = object
            .entry("options")
            .or_insert_with(|| Value::Object(Map::new()));
        match options {
            Value::Object(options) => {
                options.insert("highAccuracy".to_string(), json!(plan.high_accuracy));
            }
            other => *other = json!({ "highAccuracy": plan.high_accuracy }),
        }
        Value::Object(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetentionConfig;
    use crate::connections::ClientRole;
    use switchboard_core::JoinPayload;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        roster: Arc<Roster>,
        pending: Arc<PendingTable>,
        connections: Arc<Connections>,
        controller: String,
        controller_rx: mpsc::Receiver<Frame>,
    }

    async fn fixture() -> Fixture {
        let connections = Arc::new(Connections::new());
        let roster = Arc::new(Roster::new(RetentionConfig::default()));
        let pending = Arc::new(PendingTable::new());
        let activity = Arc::new(ActivityLog::new(100, connections.clone()));
        let (controller, controller_rx) = connections.attach(64).await;
        connections.set_role(&controller, ClientRole::Controller).await;
        let dispatcher = Arc::new(Dispatcher::new(
            DispatchDefaults::default(),
            roster.clone(),
            pending.clone(),
            connections.clone(),
            activity,
        ));
        Fixture {
            dispatcher,
            roster,
            pending,
            connections,
            controller,
            controller_rx,
        }
    }

    impl Fixture {
        async fn agent(&self, agent_id: &str) -> (String, mpsc::Receiver<Frame>) {
            let (conn, rx) = self.connections.attach(64).await;
            self.connections.set_role(&conn, ClientRole::Agent).await;
            self.roster
                .upsert_on_join(JoinPayload::from_value(json!({ "agentId": agent_id })), &conn, None)
                .await;
            (conn, rx)
        }

        /// Request results delivered to the controller so far; log frames skipped.
        fn results(&mut self) -> Vec<RequestResult> {
            let mut results = Vec::new();
            while let Ok(frame) = self.controller_rx.try_recv() {
                if frame.event == events::REQUEST_RESULT {
                    results.push(serde_json::from_value(frame.data).expect("requestResult"));
                }
            }
            results
        }
    }

    fn request(value: Value) -> CommandRequest {
        CommandRequest::from_value(value).expect("request")
    }

    #[tokio::test]
    async fn missing_fields_are_invalid_requests() {
        let mut fx = fixture().await;
        let result = fx
            .dispatcher
            .dispatch(&fx.controller, request(json!({"action": "getStatus"})))
            .await;
        assert_eq!(result.reason.as_deref(), Some("invalid_request"));

        let result = fx
            .dispatcher
            .dispatch(&fx.controller, request(json!({"to": "A1"})))
            .await;
        assert_eq!(result.reason.as_deref(), Some("invalid_request"));

        let result = fx
            .dispatcher
            .dispatch(&fx.controller, request(json!({"to": "A1", "action": "join"})))
            .await;
        assert_eq!(result.reason.as_deref(), Some("invalid_request"));
        assert_eq!(fx.results().len(), 3);
    }

    #[tokio::test]
    async fn unknown_agent_fails_without_pending_request() {
        let mut fx = fixture().await;
        let result = fx
            .dispatcher
            .dispatch(&fx.controller, request(json!({"to": "ghost", "action": "getStatus"})))
            .await;
        assert!(!result.ok);
        assert_eq!(result.reason.as_deref(), Some("agent_not_connected"));
        assert_eq!(fx.pending.total().await, 0);
        assert_eq!(fx.results(), vec![result]);
    }

    #[tokio::test]
    async fn disconnected_agent_is_not_queued_for() {
        let fx = fixture().await;
        let (conn, _rx) = fx.agent("A1").await;
        fx.roster.handle_disconnect(&conn).await;
        let result = fx
            .dispatcher
            .dispatch(&fx.controller, request(json!({"to": "A1", "action": "getStatus"})))
            .await;
        assert_eq!(result.reason.as_deref(), Some("agent_not_connected"));
        assert_eq!(fx.pending.total().await, 0);
    }

    #[tokio::test]
    async fn fire_and_forget_reports_sent() {
        let mut fx = fixture().await;
        let (_conn, mut agent_rx) = fx.agent("A1").await;
        let result = fx
            .dispatcher
            .dispatch(
                &fx.controller,
                request(json!({
                    "to": "A1",
                    "action": "reboot",
                    "data": {"delay": 5},
                    "options": {"waitForResponse": false}
                })),
            )
            .await;
        assert!(result.ok);
        assert_eq!(result.message.as_deref(), Some("sent"));
        assert_eq!(fx.pending.total().await, 0);

        let forwarded = agent_rx.try_recv().expect("forwarded command");
        assert_eq!(forwarded.event, "reboot");
        assert_eq!(forwarded.data, json!({"delay": 5}));
        assert!(forwarded.request_id.is_none());
        assert_eq!(fx.results().len(), 1);
    }

    #[tokio::test]
    async fn reply_resolves_and_reports_once() {
        let mut fx = fixture().await;
        let (_conn, mut agent_rx) = fx.agent("A1").await;
        let dispatcher = fx.dispatcher.clone();
        let controller = fx.controller.clone();
        let task = tokio::spawn(async move {
            dispatcher
                .dispatch(
                    &controller,
                    request(json!({"to": "A1", "action": "getStatus", "options": {"timeoutMs": 5000}})),
                )
                .await
        });

        let forwarded = agent_rx.recv().await.expect("forwarded command");
        let token = forwarded.request_id.expect("token");
        assert!(fx.pending.resolve_token("A1", "getStatus", &token, json!({"up": true})).await);

        let result = task.await.expect("dispatch task");
        assert!(result.ok);
        assert_eq!(result.result, Some(json!({"up": true})));
        assert_eq!(fx.results(), vec![result]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_agent_times_out_within_margin() {
        let mut fx = fixture().await;
        let (_conn, mut agent_rx) = fx.agent("A1").await;
        let started = Instant::now();
        let result = fx
            .dispatcher
            .dispatch(
                &fx.controller,
                request(json!({"to": "A1", "action": "getStatus", "options": {"timeoutMs": 200}})),
            )
            .await;
        let elapsed = started.elapsed();
        assert_eq!(result.reason.as_deref(), Some("timeout"));
        assert!(elapsed >= Duration::from_millis(200) && elapsed <= Duration::from_millis(250));
        assert_eq!(fx.pending.total().await, 0);
        assert!(agent_rx.try_recv().is_ok());
        assert_eq!(fx.results().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_emit_command_once_per_attempt() {
        let mut fx = fixture().await;
        let (_conn, mut agent_rx) = fx.agent("A1").await;
        let started = Instant::now();
        let result = fx
            .dispatcher
            .dispatch(
                &fx.controller,
                request(json!({
                    "to": "A1",
                    "action": "getStatus",
                    "options": {"timeoutMs": 200, "retries": 2}
                })),
            )
            .await;
        assert_eq!(result.reason.as_deref(), Some("timeout"));

        let mut tokens = Vec::new();
        while let Ok(frame) = agent_rx.try_recv() {
            tokens.push(frame.request_id.expect("token"));
        }
        assert_eq!(tokens.len(), 3);
        tokens.dedup();
        assert_eq!(tokens.len(), 3, "each attempt registers a fresh token");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(3 * 200 + 2 * 700));
        assert!(elapsed < Duration::from_millis(2_100));
        assert_eq!(fx.results().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn location_reply_without_coordinates_is_retried() {
        let mut fx = fixture().await;
        let (_conn, mut agent_rx) = fx.agent("A1").await;
        let dispatcher = fx.dispatcher.clone();
        let controller = fx.controller.clone();
        let task = tokio::spawn(async move {
            dispatcher
                .dispatch(&controller, request(json!({"to": "A1", "action": "getLocation"})))
                .await
        });

        let first = agent_rx.recv().await.expect("first attempt");
        assert_eq!(first.data, json!({"options": {"highAccuracy": true}}));
        let token = first.request_id.expect("token");
        fx.pending
            .resolve_token("A1", "getLocation", &token, json!({"error": "no fix"}))
            .await;

        let second = agent_rx.recv().await.expect("second attempt");
        let token = second.request_id.expect("token");
        fx.pending
            .resolve_token("A1", "getLocation", &token, json!({"lat": 1.5, "lon": 2.5}))
            .await;

        let result = task.await.expect("dispatch task");
        assert!(result.ok);
        assert_eq!(result.result, Some(json!({"lat": 1.5, "lon": 2.5})));
        assert_eq!(fx.results().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn agent_leaving_between_attempts_stops_retries() {
        let mut fx = fixture().await;
        let (conn, mut agent_rx) = fx.agent("A1").await;
        let dispatcher = fx.dispatcher.clone();
        let controller = fx.controller.clone();
        let task = tokio::spawn(async move {
            dispatcher
                .dispatch(
                    &controller,
                    request(json!({"to": "A1", "action": "getStatus", "options": {"timeoutMs": 200, "retries": 5}})),
                )
                .await
        });

        agent_rx.recv().await.expect("first attempt");
        fx.roster.handle_disconnect(&conn).await;

        let result = task.await.expect("dispatch task");
        assert_eq!(result.reason.as_deref(), Some("agent_not_connected"));
        assert!(agent_rx.try_recv().is_err());
        assert_eq!(fx.pending.total().await, 0);
        assert_eq!(fx.results().len(), 1);
    }

    #[test]
    fn plan_applies_kind_defaults_and_caps_retries() {
        let connections = Arc::new(Connections::new());
        let dispatcher = Dispatcher::new(
            DispatchDefaults::default(),
            Arc::new(Roster::new(RetentionConfig::default())),
            Arc::new(PendingTable::new()),
            connections.clone(),
            Arc::new(ActivityLog::new(10, connections)),
        );
        let location = dispatcher.plan("getLocation", &RequestOptions::default());
        assert_eq!(location.timeout, Duration::from_millis(12_000));
        assert_eq!(location.retries, 2);

        let other = dispatcher.plan("getStatus", &RequestOptions::default());
        assert_eq!(other.timeout, Duration::from_millis(8_000));
        assert_eq!(other.retries, 0);
        assert!(other.wait_for_response);

        let capped = dispatcher.plan(
            "getStatus",
            &RequestOptions {
                retries: Some(1_000),
                ..RequestOptions::default()
            },
        );
        assert_eq!(capped.retries, MAX_RETRIES);
    }

    #[test]
    fn location_options_merge_into_existing_data() {
        let connections = Arc::new(Connections::new());
        let dispatcher = Dispatcher::new(
            DispatchDefaults::default(),
            Arc::new(Roster::new(RetentionConfig::default())),
            Arc::new(PendingTable::new()),
            connections.clone(),
            Arc::new(ActivityLog::new(10, connections)),
        );
        let plan = DispatchPlan {
            timeout: Duration::from_secs(1),
            retries: 0,
            wait_for_response: true,
            high_accuracy: false,
        };
        let data = dispatcher.command_data(
            "getLocation",
            &json!({"maxAge": 10, "options": {"cached": true}}),
            &plan,
        );
        assert_eq!(
            data,
            json!({"maxAge": 10, "options": {"cached": true, "highAccuracy": false}})
        );
        assert_eq!(dispatcher.command_data("getStatus", &json!([1]), &plan), json!([1]));
    }
}

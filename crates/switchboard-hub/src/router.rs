use crate::activity::ActivityLog;
use crate::connections::Connections;
use crate::enrich::Enricher;
use crate::pending::PendingTable;
use crate::roster::{now_ms, Roster};
use serde_json::Value;
use std::sync::Arc;
use switchboard_core::wire::Frame;
use switchboard_core::{AgentEvent, LastLocation, RawAgentEvent, RelayError};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    pub agent_id: String,
    /// Whether the event resolved an outstanding request.
    pub matched: bool,
}

/// Inbound agent events: record, correlate, fan out.
pub struct EventRouter {
    roster: Arc<Roster>,
    pending: Arc<PendingTable>,
    connections: Arc<Connections>,
    enricher: Arc<Enricher>,
    activity: Arc<ActivityLog>,
    location_command: String,
}

impl EventRouter {
    pub fn new(
        roster: Arc<Roster>,
        pending: Arc<PendingTable>,
        connections: Arc<Connections>,
        enricher: Arc<Enricher>,
        activity: Arc<ActivityLog>,
        location_command: impl Into<String>,
    ) -> Self {
        Self {
            roster,
            pending,
            connections,
            enricher,
            activity,
            location_command: location_command.into(),
        }
    }

    /// Never fails: events that cannot be attributed to an agent are logged and dropped.
    pub async fn on_agent_event(
        &self,
        origin: &str,
        kind: &str,
        frame_token: Option<String>,
        payload: Value,
    ) -> Option<RouteOutcome> {
        match self.route(origin, kind, frame_token, payload).await {
            Ok(outcome) => Some(outcome),
            Err(error) => {
                warn!(
                    event = "agent_event_dropped",
                    conn_id = origin,
                    kind = kind,
                    reason = error.code(),
                    error = %error
                );
                self.activity
                    .warn(format!("dropped {kind} from {origin}: {error}"))
                    .await;
                None
            }
        }
    }

    async fn route(
        &self,
        origin: &str,
        kind: &str,
        frame_token: Option<String>,
        payload: Value,
    ) -> Result<RouteOutcome, RelayError> {
        let event = RawAgentEvent::from_value(payload);
        let agent_id = match event.agent_id {
            Some(agent_id) => agent_id,
            None => self.roster.agent_for_handle(origin).await.ok_or_else(|| {
                RelayError::MalformedEvent(format!("no agent id for '{kind}' and {origin} never joined"))
            })?,
        };
        let token = frame_token.or(event.request_id);
        let data = event.data;

        self.roster.touch_from_event(&agent_id, origin).await;
        let location = if kind == self.location_command {
            let location = LastLocation::from_reply(&data, now_ms());
            if let Some(location) = &location {
                self.roster.set_location(&agent_id, location.clone()).await;
            }
            location
        } else {
            self.roster.record_payload(&agent_id, kind, &data).await;
            None
        };

        // Controllers see the event before any requestResult it produces.
        let fanout = AgentEvent {
            agent_id: agent_id.clone(),
            data,
        };
        self.connections
            .broadcast_to_controllers(Frame::from_serializable(kind, &fanout))
            .await;
        let data = fanout.data;

        // A token pins the reply to one request; without one the oldest wins.
        let matched = match &token {
            Some(token) => self.pending.resolve_token(&agent_id, kind, token, data).await,
            None => self.pending.resolve_oldest(&agent_id, kind, data).await,
        };
        if !matched {
            if let Some(token) = &token {
                debug!(event = "reply_unmatched", agent_id = %agent_id, kind = kind, token = %token);
            }
        }

        if let Some(location) = &location {
            self.enricher.spawn(&agent_id, location);
        }
        debug!(event = "agent_event", agent_id = %agent_id, kind = kind, matched);
        Ok(RouteOutcome { agent_id, matched })
    }
}

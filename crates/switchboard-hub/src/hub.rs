use crate::activity::ActivityLog;
use crate::config::Config;
use crate::connections::{ClientRole, Connections};
use crate::dispatcher::Dispatcher;
use crate::enrich::{Enricher, NominatimGeocoder, ReverseGeocoder};
use crate::pending::PendingTable;
use crate::roster::Roster;
use crate::router::EventRouter;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::wire::{events, Frame};
use switchboard_core::{CommandRequest, DisconnectNotice, JoinPayload, RelayError, RequestResult};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Owns every relay component and routes decoded frames between them.
pub struct Hub {
    pub config: Config,
    pub connections: Arc<Connections>,
    pub roster: Arc<Roster>,
    pub pending: Arc<PendingTable>,
    pub activity: Arc<ActivityLog>,
    pub enricher: Arc<Enricher>,
    pub dispatcher: Arc<Dispatcher>,
    pub router: Arc<EventRouter>,
}

impl Hub {
    pub fn new(config: Config, geocoder: Option<Arc<dyn ReverseGeocoder>>) -> Self {
        let connections = Arc::new(Connections::new());
        let roster = Arc::new(Roster::new(config.retention.clone()));
        let pending = Arc::new(PendingTable::new());
        let activity = Arc::new(ActivityLog::new(config.log_capacity, connections.clone()));
        let location_command = config.dispatch.location_command.clone();
        let enricher = Arc::new(Enricher::new(
            geocoder,
            roster.clone(),
            connections.clone(),
            location_command.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            config.dispatch.clone(),
            roster.clone(),
            pending.clone(),
            connections.clone(),
            activity.clone(),
        ));
        let router = Arc::new(EventRouter::new(
            roster.clone(),
            pending.clone(),
            connections.clone(),
            enricher.clone(),
            activity.clone(),
            location_command,
        ));
        Self {
            config,
            connections,
            roster,
            pending,
            activity,
            enricher,
            dispatcher,
            router,
        }
    }

    /// Builds the production geocoder from `config.geocode`, if enabled.
    pub fn from_config(config: Config) -> Self {
        let geocoder = config.geocode.as_ref().and_then(|geocode| {
            match NominatimGeocoder::new(geocode) {
                Ok(client) => Some(Arc::new(client) as Arc<dyn ReverseGeocoder>),
                Err(err) => {
                    warn!(event = "geocoder_disabled", error = %err);
                    None
                }
            }
        });
        Self::new(config, geocoder)
    }

    pub async fn handle_frame(&self, conn_id: &str, frame: Frame) {
        if !frame.version.is_supported() {
            warn!(
                event = "unsupported_version",
                conn_id = conn_id,
                version = frame.version.0,
                kind = %frame.event
            );
            return;
        }
        // Frames still buffered for a connection that was already dropped.
        if !self.connections.is_live(conn_id).await {
            debug!(event = "frame_after_close", conn_id = conn_id, kind = %frame.event);
            return;
        }
        match frame.event.as_str() {
            events::JOIN => self.handle_join(conn_id, frame.data).await,
            events::ADMIN_JOIN => self.handle_admin_join(conn_id).await,
            events::REQUEST | events::SEND_COMMAND => self.handle_request(conn_id, frame.data).await,
            events::REQUEST_RESULT | events::DISCONNECT_CLIENT | events::LOG => {
                debug!(event = "outbound_event_ignored", conn_id = conn_id, kind = %frame.event);
            }
            kind => {
                self.handle_agent_event(conn_id, kind, frame.request_id, frame.data)
                    .await
            }
        }
    }

    async fn handle_join(&self, conn_id: &str, data: Value) {
        let remote = self.connections.remote(conn_id).await;
        let record = self
            .roster
            .upsert_on_join(JoinPayload::from_value(data), conn_id, remote)
            .await;
        self.connections.set_role(conn_id, ClientRole::Agent).await;
        self.activity
            .info(format!("agent {} joined on {conn_id}", record.agent_id))
            .await;
        self.connections
            .broadcast_to_controllers(Frame::from_serializable(events::JOIN, &record))
            .await;
    }

    /// Marks the connection as a controller and replays the roster to it.
    async fn handle_admin_join(&self, conn_id: &str) {
        self.connections.set_role(conn_id, ClientRole::Controller).await;
        let snapshot = self.roster.snapshot().await;
        info!(event = "controller_joined", conn_id = conn_id, agents = snapshot.len());
        for record in snapshot {
            if !self
                .connections
                .send_to(conn_id, Frame::from_serializable(events::JOIN, &record))
                .await
            {
                break;
            }
        }
        self.activity.info(format!("controller joined on {conn_id}")).await;
    }

    async fn handle_request(&self, conn_id: &str, data: Value) {
        let (to, action) = CommandRequest::identify(&data);
        let parsed = match self.connections.role(conn_id).await {
            Some(ClientRole::Controller) => CommandRequest::from_value(data),
            _ => Err(RelayError::InvalidRequest(
                "commands require adminJoin first".to_string(),
            )),
        };
        let request = match parsed {
            Ok(request) => request,
            Err(error) => {
                warn!(event = "request_rejected", conn_id = conn_id, error = %error);
                let result = RequestResult::failure(to.as_deref(), action.as_deref(), &error);
                self.connections
                    .send_to(conn_id, Frame::from_serializable(events::REQUEST_RESULT, &result))
                    .await;
                return;
            }
        };

        // Dispatch waits on agent replies; the session keeps reading meanwhile.
        let dispatcher = self.dispatcher.clone();
        let controller = conn_id.to_string();
        tokio::spawn(async move {
            dispatcher.dispatch(&controller, request).await;
        });
    }

    async fn handle_agent_event(&self, conn_id: &str, kind: &str, token: Option<String>, data: Value) {
        match self.connections.role(conn_id).await {
            Some(ClientRole::Controller) => {
                warn!(event = "controller_event_ignored", conn_id = conn_id, kind = kind);
                return;
            }
            Some(ClientRole::Unbound) => {
                self.connections.set_role(conn_id, ClientRole::Agent).await;
            }
            Some(ClientRole::Agent) => {}
            None => return,
        }
        self.router.on_agent_event(conn_id, kind, token, data).await;
    }

    /// Single exit path for a connection, whatever closed it.
    pub async fn handle_disconnect(&self, conn_id: &str, reason: &str) {
        self.connections.unregister(conn_id, reason).await;
        let agents = self.roster.handle_disconnect(conn_id).await;
        for agent_id in &agents {
            self.activity
                .info(format!("agent {agent_id} disconnected ({reason})"))
                .await;
        }
        // Controllers only track sockets that carried an agent.
        if agents.is_empty() {
            return;
        }
        let notice = DisconnectNotice {
            socket_ref: conn_id.to_string(),
        };
        self.connections
            .broadcast_to_controllers(Frame::from_serializable(events::DISCONNECT_CLIENT, &notice))
            .await;
    }

    /// Starts the connection reaper and the roster sweeper. Both stop when
    /// `shutdown` flips to true or its sender is dropped.
    pub fn spawn_background(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();
        if let Some(stale_after) = self.config.stale_after {
            tasks.push(self.clone().spawn_reaper(stale_after, shutdown.clone()));
        }
        tasks.push(self.clone().spawn_sweeper(shutdown));
        tasks
    }

    fn spawn_reaper(self: Arc<Self>, stale_after: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = (stale_after / 2).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for conn_id in self.connections.stale_connections(stale_after).await {
                            warn!(event = "stale_close", conn_id = %conn_id);
                            // The session notices and runs `handle_disconnect`.
                            self.connections.unregister(&conn_id, "stale").await;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = self.config.sweep_interval;
        let threshold = self.config.inactive_after;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.roster.sweep_inactive(threshold).await;
                        if !removed.is_empty() {
                            self.activity
                                .info(format!("swept {} inactive agent(s)", removed.len()))
                                .await;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

use crate::config::GeocodeConfig;
use crate::connections::Connections;
use crate::roster::Roster;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use switchboard_core::wire::Frame;
use switchboard_core::{AgentEvent, LastLocation};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Best-effort coordinate to place-name lookup. Failures resolve to `None`.
pub trait ReverseGeocoder: Send + Sync {
    fn reverse(&self, lat: f64, lon: f64) -> BoxFuture<'_, Option<String>>;
}

/// Client for a Nominatim-compatible `/reverse` endpoint.
pub struct NominatimGeocoder {
    client: Client,
    url: String,
}

#[derive(Deserialize)]
struct ReverseResponse {
    #[serde(default)]
    display_name: Option<String>,
}

impl NominatimGeocoder {
    pub fn new(config: &GeocodeConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
        })
    }

    async fn lookup(&self, lat: f64, lon: f64) -> Result<Option<String>, reqwest::Error> {
        let url = format!("{}?format=jsonv2&lat={lat}&lon={lon}", self.url);
        let response = self.client.get(&url).send().await?.error_for_status()?;
        let body = response.json::<ReverseResponse>().await?;
        Ok(body.display_name.filter(|name| !name.trim().is_empty()))
    }
}

impl ReverseGeocoder for NominatimGeocoder {
    fn reverse(&self, lat: f64, lon: f64) -> BoxFuture<'_, Option<String>> {
        async move {
            match self.lookup(lat, lon).await {
                Ok(address) => address,
                Err(err) => {
                    warn!(event = "geocode_failed", error = %err);
                    None
                }
            }
        }
        .boxed()
    }
}

/// Resolves addresses for fresh locations off the reply path and re-announces
/// the location once the address is known.
pub struct Enricher {
    geocoder: Option<Arc<dyn ReverseGeocoder>>,
    roster: Arc<Roster>,
    connections: Arc<Connections>,
    location_event: String,
}

impl Enricher {
    pub fn new(
        geocoder: Option<Arc<dyn ReverseGeocoder>>,
        roster: Arc<Roster>,
        connections: Arc<Connections>,
        location_event: impl Into<String>,
    ) -> Self {
        Self {
            geocoder,
            roster,
            connections,
            location_event: location_event.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.geocoder.is_some()
    }

    /// Spawns the lookup for `location`. Returns `None` when geocoding is disabled.
    pub fn spawn(&self, agent_id: &str, location: &LastLocation) -> Option<JoinHandle<()>> {
        let geocoder = self.geocoder.clone()?;
        let roster = self.roster.clone();
        let connections = self.connections.clone();
        let event = self.location_event.clone();
        let agent_id = agent_id.to_string();
        let (lat, lon, ts) = (location.lat, location.lon, location.ts);

        Some(tokio::spawn(async move {
            let Some(address) = geocoder.reverse(lat, lon).await else {
                return;
            };
            // The agent may have reported a newer location while we waited.
            let Some(updated) = roster.apply_address(&agent_id, ts, address).await else {
                debug!(event = "geocode_stale", agent_id = %agent_id, ts);
                return;
            };
            debug!(event = "geocode_applied", agent_id = %agent_id, ts);
            let payload = AgentEvent {
                agent_id,
                data: serde_json::to_value(&updated).unwrap_or_default(),
            };
            connections
                .broadcast_to_controllers(Frame::from_serializable(event, &payload))
                .await;
        }))
    }
}

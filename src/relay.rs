//! Best-effort LAN relay between terminals of the same store.
//!
//! The relay is never authoritative: pushes are fire-and-forget and a failed
//! call only opens a cool-down window during which the relay is skipped.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::cloud::{normalize_base_url, status_error, transport_error};
use crate::db::{self, now_ts, DbState};
use crate::error::{RemoteError, StoreResult};
use crate::inbound::{self, InboundReport};
use crate::mutation::Mutation;

/// Default cool-down after a failed relay call.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(15);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// `sync_log` key for the relay pull cursor.
const RELAY_LOG_KEY: &str = "relay";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayPushOutcome {
    Sent(usize),
    /// Nothing to send.
    Empty,
    CoolingDown,
    Failed(RemoteError),
}

#[derive(Serialize)]
struct PushBody<'a> {
    events: &'a [Mutation],
}

/// One page of relay events.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayBatch {
    #[serde(default)]
    pub events: Vec<Value>,
    #[serde(default)]
    pub cursor: Option<String>,
}

pub struct LanRelay {
    base_url: String,
    secret: Zeroizing<String>,
    client: Client,
    cooldown: Duration,
    cooldown_until: Mutex<Option<Instant>>,
}

impl LanRelay {
    pub fn new(
        url: &str,
        secret: Zeroizing<String>,
        cooldown: Option<Duration>,
    ) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::Unavailable(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: normalize_base_url(url),
            secret,
            client,
            cooldown: cooldown.unwrap_or(DEFAULT_COOLDOWN),
            cooldown_until: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_cooling_down(&self) -> bool {
        match self.cooldown_until.lock() {
            Ok(guard) => guard.is_some_and(|until| Instant::now() < until),
            Err(_) => false,
        }
    }

    /// The relay counts as reachable until a call fails, and again once the
    /// cool-down has elapsed.
    pub fn is_reachable(&self) -> bool {
        !self.is_cooling_down()
    }

    fn trip(&self, reason: &RemoteError) {
        warn!(
            relay = %self.base_url,
            error = %reason,
            cooldown_secs = self.cooldown.as_secs(),
            "LAN relay unavailable, cooling down"
        );
        if let Ok(mut guard) = self.cooldown_until.lock() {
            *guard = Some(Instant::now() + self.cooldown);
        }
    }

    fn reset(&self) {
        if let Ok(mut guard) = self.cooldown_until.lock() {
            if guard.take().is_some() {
                info!(relay = %self.base_url, "LAN relay reachable again");
            }
        }
    }

    /// Broadcast row images to the other terminals.
    pub async fn push(&self, mutations: &[Mutation]) -> RelayPushOutcome {
        if mutations.is_empty() {
            return RelayPushOutcome::Empty;
        }
        if self.is_cooling_down() {
            debug!(count = mutations.len(), "Relay push skipped during cool-down");
            return RelayPushOutcome::CoolingDown;
        }

        let url = format!("{}/push", self.base_url);
        let result = self
            .client
            .post(&url)
            .bearer_auth(self.secret.as_str())
            .json(&PushBody { events: mutations })
            .send()
            .await;

        let failure = match result {
            Ok(resp) if resp.status().is_success() => None,
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Some(status_error(status, &body))
            }
            Err(e) => Some(transport_error(&self.base_url, &e)),
        };

        match failure {
            None => {
                self.reset();
                debug!(count = mutations.len(), "Relay push delivered");
                RelayPushOutcome::Sent(mutations.len())
            }
            Some(err) => {
                self.trip(&err);
                RelayPushOutcome::Failed(err)
            }
        }
    }

    /// Fetch events published since `cursor`.
    pub async fn pull(&self, cursor: Option<&str>) -> Result<RelayBatch, RemoteError> {
        if self.is_cooling_down() {
            return Err(RemoteError::CoolingDown);
        }

        let url = format!("{}/pull", self.base_url);
        let mut request = self.client.get(&url).bearer_auth(self.secret.as_str());
        if let Some(cursor) = cursor {
            request = request.query(&[("since", cursor)]);
        }

        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                let err = transport_error(&self.base_url, &e);
                self.trip(&err);
                return Err(err);
            }
        };

        let status = resp.status();
        if status == StatusCode::NO_CONTENT {
            self.reset();
            return Ok(RelayBatch {
                events: Vec::new(),
                cursor: cursor.map(str::to_string),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let err = status_error(status, &body);
            self.trip(&err);
            return Err(err);
        }

        let batch = resp
            .json::<RelayBatch>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        self.reset();
        Ok(batch)
    }

    /// Pull the next page and merge it into the local store, advancing the
    /// stored cursor. A relay problem yields `Ok(None)`; only store failures
    /// are errors.
    pub async fn pull_and_apply(&self, db: &DbState) -> StoreResult<Option<InboundReport>> {
        let cursor = db.with_conn(|conn| Ok(db::pull_cursor(conn, RELAY_LOG_KEY)))?;

        let batch = match self.pull(cursor.as_deref()).await {
            Ok(batch) => batch,
            Err(RemoteError::CoolingDown) => return Ok(None),
            Err(e) => {
                debug!(error = %e, "Relay pull failed");
                return Ok(None);
            }
        };

        let report = inbound::apply_events(db, &batch.events)?;
        let next_cursor = batch.cursor.or(cursor);
        db.with_conn(|conn| {
            db::mark_pulled(conn, RELAY_LOG_KEY, &now_ts(), next_cursor.as_deref())
        })?;
        Ok(Some(report))
    }
}

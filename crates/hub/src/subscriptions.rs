// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Status subscriptions: which sessions want which fields of which host objects, and keeping the
//! host's tracking declaration equal to the union of what is wanted.

use crate::bus::EventBus;
use crate::registry::SessionRegistry;
use crate::session::SessionId;
use crate::state_cache::{HostStateCache, newer};
use rpc_async_client::UpstreamLink;
use rpc_common::{
    ClientNotification, FieldSet, HOST_LIST_METHOD, HOST_READY_METHOD, HOST_SUBSCRIBE_METHOD,
    ObjectsRequest, RpcError, STATUS_UPDATE_METHOD,
};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace, warn};

/// Deltas held back while a resync snapshot is in flight. Older ones are superseded by the
/// snapshot anyway, so overflow drops from the front.
const MAX_BUFFERED_DELTAS: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
struct StatusDelta {
    eventtime: Option<f64>,
    status: Map<String, Value>,
}

enum Phase {
    /// No trustworthy host state: the link is down, or the last resync failed.
    Stale,
    /// Snapshot in flight for this connection; deltas are buffered.
    Resyncing {
        generation: u64,
        buffer: VecDeque<StatusDelta>,
    },
    Live {
        generation: u64,
    },
}

impl Phase {
    fn generation(&self) -> Option<u64> {
        match self {
            Phase::Stale => None,
            Phase::Resyncing { generation, .. } | Phase::Live { generation } => Some(*generation),
        }
    }

    fn is_live(&self) -> bool {
        matches!(self, Phase::Live { .. })
    }

    fn is_live_for(&self, generation: u64) -> bool {
        matches!(self, Phase::Live { generation: g } if *g == generation)
    }
}

struct EngineState {
    /// object -> session -> requested fields. An object is present only while it has subscribers.
    subscriptions: BTreeMap<String, HashMap<SessionId, FieldSet>>,
    /// What the host was last told to track.
    tracked: BTreeSet<String>,
    /// Objects the host says exist. `None` while unknown, in which case any name is accepted.
    catalogue: Option<BTreeSet<String>>,
    cache: HostStateCache,
    phase: Phase,
}

impl EngineState {
    /// The tracking declaration the host should have: every subscribed object it knows about.
    fn wanted(&self) -> BTreeSet<String> {
        self.subscriptions
            .keys()
            .filter(|name| {
                self.catalogue
                    .as_ref()
                    .is_none_or(|catalogue| catalogue.contains(*name))
            })
            .cloned()
            .collect()
    }

    fn unsubscribe(&mut self, object: &str, session_id: SessionId) {
        if let Some(subscribers) = self.subscriptions.get_mut(object) {
            subscribers.remove(&session_id);
            if subscribers.is_empty() {
                self.subscriptions.remove(object);
            }
        }
    }

    fn drop_session_where<F>(&mut self, session_id: SessionId, predicate: F)
    where
        F: Fn(&str) -> bool,
    {
        self.subscriptions.retain(|name, subscribers| {
            if predicate(name.as_str()) {
                subscribers.remove(&session_id);
            }
            !subscribers.is_empty()
        });
    }

    /// The cached status of the objects a session subscribes to, cut down to its fields.
    fn snapshot_for(
        &self,
        session_id: SessionId,
        only: Option<&BTreeSet<String>>,
    ) -> Map<String, Value> {
        let mut status = Map::new();
        for (name, subscribers) in &self.subscriptions {
            if only.is_some_and(|only| !only.contains(name)) {
                continue;
            }
            let (Some(fields), Some(cached)) = (subscribers.get(&session_id), self.cache.get(name))
            else {
                continue;
            };
            status.insert(name.clone(), Value::Object(fields.filter(cached)));
        }
        status
    }

    /// Split one delta into per-session batches. Sessions whose fields are untouched get nothing.
    fn fan_out(&self, status: &Map<String, Value>) -> BTreeMap<SessionId, Map<String, Value>> {
        let mut batches: BTreeMap<SessionId, Map<String, Value>> = BTreeMap::new();
        for (name, fields) in status {
            let Value::Object(fields) = fields else {
                continue;
            };
            let Some(subscribers) = self.subscriptions.get(name) else {
                continue;
            };
            for (session_id, wanted) in subscribers {
                let filtered = wanted.filter(fields);
                if filtered.is_empty() {
                    continue;
                }
                batches
                    .entry(*session_id)
                    .or_default()
                    .insert(name.clone(), Value::Object(filtered));
            }
        }
        batches
    }

    fn subscribed_sessions(&self) -> BTreeSet<SessionId> {
        self.subscriptions
            .values()
            .flat_map(|subscribers| subscribers.keys().copied())
            .collect()
    }
}

/// What a subscribe call hands back to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscribeOutcome {
    Snapshot {
        eventtime: Option<f64>,
        status: Map<String, Value>,
    },
    /// Recorded, but the host is unreachable. The snapshot follows as a status push once the
    /// link is back.
    Pending,
}

impl SubscribeOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, SubscribeOutcome::Pending)
    }

    pub fn to_json(&self) -> Value {
        match self {
            SubscribeOutcome::Snapshot { eventtime, status } => {
                json!({ "eventtime": eventtime, "status": status })
            }
            SubscribeOutcome::Pending => {
                json!({ "eventtime": null, "status": {}, "pending": true })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Unchanged,
    /// The tracking declaration was changed.
    Updated,
    /// Full catalogue + snapshot rebuild for a new connection.
    Resynced,
}

fn is_link_error(e: &RpcError) -> bool {
    matches!(e, RpcError::LinkReset | RpcError::LinkUnavailable(_))
}

fn subscribe_params(objects: &BTreeSet<String>) -> Value {
    let objects: Map<String, Value> = objects
        .iter()
        .map(|name| (name.clone(), Value::Null))
        .collect();
    json!({ "objects": objects, "response_template": {} })
}

/// `{"objects": [...]}` or a bare array of names.
fn parse_catalogue(reply: &Value) -> Option<BTreeSet<String>> {
    let names = match reply {
        Value::Array(names) => names,
        Value::Object(reply) => reply.get("objects")?.as_array()?,
        _ => return None,
    };
    Some(
        names
            .iter()
            .filter_map(|name| name.as_str().map(str::to_string))
            .collect(),
    )
}

fn parse_snapshot(reply: &Value) -> Result<(Option<f64>, Map<String, Value>), RpcError> {
    let Some(Value::Object(status)) = reply.get("status") else {
        return Err(RpcError::Internal(
            "control host subscribe reply has no status".to_string(),
        ));
    };
    let eventtime = reply.get("eventtime").and_then(Value::as_f64);
    Ok((eventtime, status.clone()))
}

/// `[{<object>: {<field>: ...}}, eventtime]`, or `{"status": {...}, "eventtime": ...}`.
fn parse_delta(params: &Value) -> Option<StatusDelta> {
    match params {
        Value::Array(items) => {
            let Some(Value::Object(status)) = items.first() else {
                return None;
            };
            Some(StatusDelta {
                eventtime: items.get(1).and_then(Value::as_f64),
                status: status.clone(),
            })
        }
        Value::Object(params) => match params.get("status") {
            Some(Value::Object(status)) => Some(StatusDelta {
                eventtime: params.get("eventtime").and_then(Value::as_f64),
                status: status.clone(),
            }),
            _ => Some(StatusDelta {
                eventtime: None,
                status: params.clone(),
            }),
        },
        _ => None,
    }
}

pub struct SubscriptionEngine {
    link: UpstreamLink,
    registry: SessionRegistry,
    bus: EventBus,
    state: Mutex<EngineState>,
    /// Serializes exchanges that change the host's tracking declaration.
    sync_lock: tokio::sync::Mutex<()>,
}

impl SubscriptionEngine {
    pub fn new(link: UpstreamLink, registry: SessionRegistry, bus: EventBus) -> Self {
        Self {
            link,
            registry,
            bus,
            state: Mutex::new(EngineState {
                subscriptions: BTreeMap::new(),
                tracked: BTreeSet::new(),
                catalogue: None,
                cache: HostStateCache::new(),
                phase: Phase::Stale,
            }),
            sync_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe `session_id` to one object, replacing any fields it previously asked for.
    /// An empty field set cancels.
    pub async fn subscribe(
        &self,
        session_id: SessionId,
        object: &str,
        fields: FieldSet,
    ) -> Result<SubscribeOutcome, RpcError> {
        let changes = BTreeMap::from([(object.to_string(), fields)]);
        self.update(session_id, &changes, false).await
    }

    pub async fn unsubscribe(&self, session_id: SessionId, object: &str) -> Result<(), RpcError> {
        self.lock().unsubscribe(object, session_id);
        self.sync_if_up().await
    }

    /// Make `request` the session's complete subscription set. Objects it doesn't name are
    /// dropped; an empty request cancels everything for the session.
    pub async fn apply(
        &self,
        session_id: SessionId,
        request: &ObjectsRequest,
    ) -> Result<SubscribeOutcome, RpcError> {
        self.update(session_id, &request.objects, true).await
    }

    async fn update(
        &self,
        session_id: SessionId,
        changes: &BTreeMap<String, FieldSet>,
        replace_all: bool,
    ) -> Result<SubscribeOutcome, RpcError> {
        {
            let mut state = self.lock();
            if let Some(catalogue) = &state.catalogue
                && let Some((unknown, _)) = changes
                    .iter()
                    .find(|(name, fields)| !fields.is_cancel() && !catalogue.contains(*name))
            {
                return Err(RpcError::UnknownObject(unknown.clone()));
            }
            if replace_all {
                state.drop_session_where(session_id, |name| !changes.contains_key(name));
            }
            for (name, fields) in changes {
                if fields.is_cancel() {
                    state.unsubscribe(name, session_id);
                } else {
                    state
                        .subscriptions
                        .entry(name.clone())
                        .or_default()
                        .insert(session_id, fields.clone());
                }
            }
        }
        let requested: BTreeSet<String> = changes
            .iter()
            .filter(|(_, fields)| !fields.is_cancel())
            .map(|(name, _)| name.clone())
            .collect();

        if !self.link.state().is_up() {
            debug!(session_id, "Subscription recorded while control host is down");
            return Ok(SubscribeOutcome::Pending);
        }
        match self.synchronize().await {
            Ok(_) => {}
            Err(e) if is_link_error(&e) => return Ok(SubscribeOutcome::Pending),
            Err(e) => return Err(e),
        }

        let state = self.lock();
        if !state.phase.is_live() {
            return Ok(SubscribeOutcome::Pending);
        }
        Ok(SubscribeOutcome::Snapshot {
            eventtime: state.cache.eventtime(),
            status: state.snapshot_for(session_id, Some(&requested)),
        })
    }

    /// Drop every subscription held by a session. Returns true if the host's tracking
    /// declaration now needs to shrink.
    pub fn remove_session(&self, session_id: SessionId) -> bool {
        let mut state = self.lock();
        state.drop_session_where(session_id, |_| true);
        state.phase.is_live() && state.wanted() != state.tracked
    }

    async fn sync_if_up(&self) -> Result<(), RpcError> {
        if !self.link.state().is_up() {
            return Ok(());
        }
        match self.synchronize().await {
            Ok(_) => Ok(()),
            Err(e) if is_link_error(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Bring the host in line with the subscription table. On a connection that hasn't been
    /// resynced yet this is a full rebuild; otherwise only the tracking declaration is updated.
    pub async fn synchronize(&self) -> Result<SyncOutcome, RpcError> {
        let _sync = self.sync_lock.lock().await;
        if !self.link.state().is_up() {
            return Err(RpcError::LinkUnavailable(
                "not connected to control host".to_string(),
            ));
        }
        let generation = self.link.generation();
        let live = self.lock().phase.is_live_for(generation);
        if live {
            self.update_tracking(generation).await
        } else {
            self.resync(generation).await
        }
    }

    async fn update_tracking(&self, generation: u64) -> Result<SyncOutcome, RpcError> {
        let wanted = {
            let state = self.lock();
            let wanted = state.wanted();
            if wanted == state.tracked {
                return Ok(SyncOutcome::Unchanged);
            }
            wanted
        };
        let reply = self
            .link
            .call(HOST_SUBSCRIBE_METHOD, subscribe_params(&wanted))
            .await?;
        let (eventtime, status) = parse_snapshot(&reply)?;
        self.commit_tracking(generation, wanted, eventtime, &status)
    }

    /// Record the host's reply to a tracking change. Updates that arrived while the call was in
    /// flight are already cached, and the eventtime guard keeps them over older snapshot values.
    fn commit_tracking(
        &self,
        generation: u64,
        wanted: BTreeSet<String>,
        eventtime: Option<f64>,
        status: &Map<String, Value>,
    ) -> Result<SyncOutcome, RpcError> {
        let mut state = self.lock();
        if !state.phase.is_live_for(generation) {
            return Err(RpcError::LinkReset);
        }
        debug!(
            added = ?wanted.difference(&state.tracked).collect::<Vec<_>>(),
            removed = ?state.tracked.difference(&wanted).collect::<Vec<_>>(),
            "Updated control host tracking"
        );
        state.cache.retain(&wanted);
        state.cache.apply_snapshot(eventtime, status);
        state.tracked = wanted;
        Ok(SyncOutcome::Updated)
    }

    async fn resync(&self, generation: u64) -> Result<SyncOutcome, RpcError> {
        {
            let mut state = self.lock();
            if !matches!(state.phase, Phase::Resyncing { generation: g, .. } if g == generation) {
                state.phase = Phase::Resyncing {
                    generation,
                    buffer: VecDeque::new(),
                };
            }
        }
        match self.rebuild(generation).await {
            Ok(outcome) => {
                self.link.set_healthy();
                let notified = self.bus.broadcast(HOST_READY_METHOD, json!({}));
                info!(generation, notified, "Control host state resynchronized");
                Ok(outcome)
            }
            Err(e) => {
                {
                    let mut state = self.lock();
                    if matches!(state.phase, Phase::Resyncing { generation: g, .. } if g == generation)
                    {
                        state.phase = Phase::Stale;
                    }
                }
                if !is_link_error(&e) {
                    warn!(generation, error = %e, "Resync with control host failed");
                    self.link.set_degraded();
                }
                Err(e)
            }
        }
    }

    async fn rebuild(&self, generation: u64) -> Result<SyncOutcome, RpcError> {
        let listing = self.link.call(HOST_LIST_METHOD, json!({})).await?;
        let catalogue = parse_catalogue(&listing);
        if catalogue.is_none() {
            warn!("Control host object list was not understood; accepting any object name");
        }
        let wanted = {
            let mut state = self.lock();
            state.catalogue = catalogue;
            state.wanted()
        };
        let reply = self
            .link
            .call(HOST_SUBSCRIBE_METHOD, subscribe_params(&wanted))
            .await?;
        let (eventtime, status) = parse_snapshot(&reply)?;

        let mut state = self.lock();
        let buffered = match &mut state.phase {
            Phase::Resyncing {
                generation: g,
                buffer,
            } if *g == generation => std::mem::take(buffer),
            _ => return Err(RpcError::LinkReset),
        };
        state.cache.clear();
        state.cache.apply_snapshot(eventtime, &status);
        let mut replayed = 0;
        for delta in buffered {
            if newer(delta.eventtime, eventtime) {
                state.cache.apply_delta(delta.eventtime, &delta.status);
                replayed += 1;
            }
        }
        state.cache.retain(&wanted);
        state.tracked = wanted;
        state.phase = Phase::Live { generation };
        debug!(generation, replayed, tracked = state.tracked.len(), "Rebuilt host state");

        // Pushed under the lock so no delta can overtake the snapshot into a mailbox.
        let eventtime = state.cache.eventtime();
        for session_id in state.subscribed_sessions() {
            let status = state.snapshot_for(session_id, None);
            if !status.is_empty() {
                self.deliver(session_id, status, eventtime);
            }
        }
        Ok(SyncOutcome::Resynced)
    }

    /// A new connection is up; start buffering deltas until its resync completes.
    pub fn handle_connected(&self, generation: u64) {
        self.lock().phase = Phase::Resyncing {
            generation,
            buffer: VecDeque::new(),
        };
    }

    /// The connection is gone; everything cached from it is stale.
    pub fn handle_disconnected(&self, generation: u64) {
        let mut state = self.lock();
        if state.phase.generation().is_some_and(|g| g > generation) {
            return;
        }
        state.phase = Phase::Stale;
        state.cache.clear();
        state.tracked.clear();
        state.catalogue = None;
    }

    /// A status delta from the host.
    pub fn on_status_update(&self, params: &Value) {
        let Some(delta) = parse_delta(params) else {
            debug!(?params, "Ignoring malformed status update");
            return;
        };
        let mut state = self.lock();
        match &mut state.phase {
            Phase::Stale => {
                trace!("Dropping status update while host state is stale");
                return;
            }
            Phase::Resyncing { buffer, .. } => {
                if buffer.len() >= MAX_BUFFERED_DELTAS {
                    buffer.pop_front();
                }
                buffer.push_back(delta);
                return;
            }
            Phase::Live { .. } => {}
        }
        // Subscribed but not yet tracked objects are cached too: their tracking reply may still
        // be in flight and carry an older snapshot.
        let cached: Map<String, Value> = delta
            .status
            .iter()
            .filter(|(name, _)| {
                state.tracked.contains(*name) || state.subscriptions.contains_key(*name)
            })
            .map(|(name, fields)| (name.clone(), fields.clone()))
            .collect();
        state.cache.apply_delta(delta.eventtime, &cached);
        for (session_id, status) in state.fan_out(&delta.status) {
            self.deliver(session_id, status, delta.eventtime);
        }
    }

    fn deliver(&self, session_id: SessionId, status: Map<String, Value>, eventtime: Option<f64>) {
        let Ok(session) = self.registry.get(session_id) else {
            return;
        };
        session.mailbox().push(ClientNotification::new(
            STATUS_UPDATE_METHOD,
            json!([status, eventtime]),
        ));
    }

    pub fn is_live(&self) -> bool {
        self.lock().phase.is_live()
    }

    /// Objects the host is currently asked to track.
    pub fn tracked_objects(&self) -> BTreeSet<String> {
        self.lock().tracked.clone()
    }

    pub fn subscriber_count(&self, object: &str) -> usize {
        self.lock()
            .subscriptions
            .get(object)
            .map_or(0, HashMap::len)
    }

    pub fn session_subscriptions(&self, session_id: SessionId) -> BTreeMap<String, FieldSet> {
        self.lock()
            .subscriptions
            .iter()
            .filter_map(|(name, subscribers)| {
                subscribers
                    .get(&session_id)
                    .map(|fields| (name.clone(), fields.clone()))
            })
            .collect()
    }

    pub fn catalogue(&self) -> Option<BTreeSet<String>> {
        self.lock().catalogue.clone()
    }

    #[cfg(test)]
    fn force_live(&self, catalogue: Option<BTreeSet<String>>) {
        let mut state = self.lock();
        state.catalogue = catalogue;
        state.tracked = state.wanted();
        state.phase = Phase::Live { generation: 0 };
    }
}

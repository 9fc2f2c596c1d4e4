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

use crate::bus::EventBus;
use crate::methods::MethodRegistry;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionId, TransportKind};
use crate::subscriptions::SubscriptionEngine;
use rpc_async_client::{LinkLifecycle, UpstreamLink};
use rpc_common::{HOST_DISCONNECTED_METHOD, HostNotification};
use serde_json::{Value, json};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Host notification method carrying status deltas, unless configured otherwise.
pub const DEFAULT_STATUS_METHOD: &str = "process_status_update";

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Events queued per session before the oldest start being discarded.
    pub mailbox_capacity: usize,
    /// The host notification that carries status deltas. Every other host notification is
    /// relayed to all sessions as-is.
    pub status_method: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            status_method: DEFAULT_STATUS_METHOD.to_string(),
        }
    }
}

struct HubInner {
    config: HubConfig,
    link: UpstreamLink,
    registry: SessionRegistry,
    bus: EventBus,
    subscriptions: SubscriptionEngine,
    methods: MethodRegistry,
}

/// Ties the client sessions to the one control host link. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

/// Client-facing name for a relayed host notification.
pub fn relay_method_name(host_method: &str) -> String {
    let name = host_method.replace('/', "_");
    if name.starts_with("notify_") {
        name
    } else {
        format!("notify_{name}")
    }
}

impl Hub {
    pub fn new(config: HubConfig, link: UpstreamLink) -> Self {
        Self::with_methods(config, link, MethodRegistry::standard())
    }

    pub fn with_methods(config: HubConfig, link: UpstreamLink, methods: MethodRegistry) -> Self {
        let registry = SessionRegistry::new(config.mailbox_capacity);
        let bus = EventBus::new(registry.clone());
        let subscriptions = SubscriptionEngine::new(link.clone(), registry.clone(), bus.clone());
        let inner = Arc::new(HubInner {
            config,
            link: link.clone(),
            registry,
            bus,
            subscriptions,
            methods,
        });

        // Handlers hold the hub weakly; the link must not keep it alive.
        let weak: Weak<HubInner> = Arc::downgrade(&inner);
        link.on_event(move |notification| {
            if let Some(inner) = weak.upgrade() {
                Hub { inner }.handle_host_notification(notification);
            }
        });
        let weak: Weak<HubInner> = Arc::downgrade(&inner);
        link.on_lifecycle(move |event| {
            if let Some(inner) = weak.upgrade() {
                Hub { inner }.handle_lifecycle(event);
            }
        });

        Self { inner }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn link(&self) -> &UpstreamLink {
        &self.inner.link
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn subscriptions(&self) -> &SubscriptionEngine {
        &self.inner.subscriptions
    }

    pub fn methods(&self) -> &MethodRegistry {
        &self.inner.methods
    }

    pub fn register_session(&self, kind: TransportKind) -> Arc<Session> {
        self.inner.registry.register(kind)
    }

    /// Tear a session down: its subscriptions go, its pending calls resolve with
    /// `SessionClosed`, and its mailbox is discarded. Safe to call more than once.
    pub fn unregister_session(&self, session_id: SessionId) {
        let Some(session) = self.inner.registry.remove(session_id) else {
            return;
        };
        let outstanding = session.pending_summary();
        session.begin_draining();
        for (request_id, method, elapsed) in &outstanding {
            debug!(session_id, %request_id, %method, ?elapsed, "Abandoning call of closed session");
        }
        if self.inner.subscriptions.remove_session(session_id) {
            let hub = self.clone();
            tokio::spawn(async move {
                if let Err(e) = hub.inner.subscriptions.synchronize().await {
                    debug!(error = %e, "Could not shrink control host tracking");
                }
            });
        }
        session.finish_closing();
        info!(
            session_id,
            kind = session.kind().id_str(),
            pending = outstanding.len(),
            dropped = session.dropped_events(),
            age = ?session.age(),
            "Session closed"
        );
    }

    pub fn server_info(&self) -> Value {
        let link_state = self.inner.link.state();
        json!({
            "version": stateplex_common::VERSION,
            "host_state": link_state.id_str(),
            "host_connected": link_state.is_up(),
            "host_ready": self.inner.subscriptions.is_live(),
            "connected_sessions": self.inner.registry.len(),
            "tracked_objects": self.inner.subscriptions.tracked_objects(),
        })
    }

    fn handle_host_notification(&self, notification: &HostNotification) {
        if notification.method == self.inner.config.status_method {
            self.inner
                .subscriptions
                .on_status_update(&notification.params);
            return;
        }
        let method = relay_method_name(&notification.method);
        self.inner.bus.broadcast(&method, notification.params.clone());
    }

    fn handle_lifecycle(&self, event: LinkLifecycle) {
        match event {
            LinkLifecycle::Connected { generation } => {
                self.inner.subscriptions.handle_connected(generation);
                let hub = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = hub.inner.subscriptions.synchronize().await {
                        warn!(generation, error = %e, "Control host resync did not complete");
                    }
                });
            }
            LinkLifecycle::Disconnected { generation } => {
                self.inner.subscriptions.handle_disconnected(generation);
                let notified = self
                    .inner
                    .bus
                    .broadcast(HOST_DISCONNECTED_METHOD, json!({}));
                info!(generation, notified, "Control host went away");
            }
        }
    }
}

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

mod common;

use common::{SimHost, eventually, printer_objects, within};
use pretty_assertions::assert_eq;
use rpc_common::{ClientRequest, ClientResponse, FieldSet, RpcError, error_codes};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use stateplex_hub::{Hub, HubConfig, Session, SubscribeOutcome, TransportKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

async fn connected_hub(host: &SimHost, config: HubConfig) -> Hub {
    let hub = Hub::new(config, host.link());
    hub.link().connect().await.unwrap();
    let engine_hub = hub.clone();
    eventually("initial resync", move || engine_hub.subscriptions().is_live()).await;
    hub
}

fn spawn_dispatch(hub: &Hub, session: &Arc<Session>, request: ClientRequest) -> JoinHandle<Option<ClientResponse>> {
    let hub = hub.clone();
    let session = session.clone();
    tokio::spawn(async move { hub.dispatch(&session, request).await })
}

fn names(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

async fn next_event(session: &Session) -> (String, Value) {
    let event = within(session.mailbox().recv()).await.unwrap();
    (event.method, event.params)
}

#[tokio::test]
async fn toolhead_position_reaches_only_position_subscribers() {
    let host = SimHost::start(printer_objects());
    let hub = connected_hub(&host, HubConfig::default()).await;
    let position = hub.register_session(TransportKind::Websocket);
    let status = hub.register_session(TransportKind::Websocket);

    let outcome = hub
        .subscriptions()
        .subscribe(position.id(), "toolhead", FieldSet::fields(["position"]))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        SubscribeOutcome::Snapshot {
            eventtime: Some(100.0),
            status: json!({"toolhead": {"position": [0.0, 0.0, 0.0, 0.0]}})
                .as_object()
                .cloned()
                .unwrap(),
        }
    );
    hub.subscriptions()
        .subscribe(status.id(), "toolhead", FieldSet::fields(["status"]))
        .await
        .unwrap();
    assert_eq!(host.subscribe_calls().last(), Some(&names(&["toolhead"])));

    let moved = host.push_delta(json!({"toolhead": {"position": [10.0, 20.0, 5.0, 0.0]}}));
    let printing = host.push_delta(json!({"toolhead": {"status": "Printing"}}));

    assert_eq!(
        next_event(&position).await,
        (
            "notify_status_update".to_string(),
            json!([{"toolhead": {"position": [10.0, 20.0, 5.0, 0.0]}}, moved])
        )
    );
    // The position delta was withheld: the first thing this session sees is its own field.
    assert_eq!(
        next_event(&status).await,
        (
            "notify_status_update".to_string(),
            json!([{"toolhead": {"status": "Printing"}}, printing])
        )
    );
    assert!(position.mailbox().try_recv().is_none());
}

#[tokio::test]
async fn unsubscribe_stops_tracking_and_delivery() {
    let host = SimHost::start(printer_objects());
    let hub = connected_hub(&host, HubConfig::default()).await;
    let session = hub.register_session(TransportKind::Websocket);

    hub.subscriptions()
        .subscribe(session.id(), "extruder", FieldSet::All)
        .await
        .unwrap();
    hub.subscriptions()
        .subscribe(session.id(), "toolhead", FieldSet::All)
        .await
        .unwrap();
    hub.subscriptions()
        .unsubscribe(session.id(), "toolhead")
        .await
        .unwrap();

    assert_eq!(hub.subscriptions().subscriber_count("toolhead"), 0);
    assert_eq!(hub.subscriptions().tracked_objects(), names(&["extruder"]));
    assert_eq!(host.subscribe_calls().last(), Some(&names(&["extruder"])));

    host.push_delta(json!({"toolhead": {"homed_axes": "xyz"}}));
    let heated = host.push_delta(json!({"extruder": {"temperature": 200.0}}));
    assert_eq!(
        next_event(&session).await.1,
        json!([{"extruder": {"temperature": 200.0}}, heated])
    );
}

#[tokio::test]
async fn repeated_subscribe_does_not_touch_the_host() {
    let host = SimHost::start(printer_objects());
    let hub = connected_hub(&host, HubConfig::default()).await;
    let session = hub.register_session(TransportKind::Websocket);

    let request = ClientRequest::new(
        1i64,
        "printer.objects.subscribe",
        json!({"objects": {"toolhead": ["position"], "webhooks": null}}),
    );
    let first = hub.dispatch(&session, request.clone()).await.unwrap();
    let calls = host.subscribe_calls().len();
    let second = hub.dispatch(&session, request).await.unwrap();

    assert_eq!(host.subscribe_calls().len(), calls);
    assert_eq!(first.outcome, second.outcome);
    assert_eq!(
        first.outcome.unwrap()["status"],
        json!({"toolhead": {"position": [0.0, 0.0, 0.0, 0.0]}, "webhooks": {"state": "ready"}})
    );
    assert_eq!(hub.subscriptions().subscriber_count("toolhead"), 1);
}

#[tokio::test]
async fn unknown_object_is_rejected() {
    let host = SimHost::start(printer_objects());
    let hub = connected_hub(&host, HubConfig::default()).await;
    let session = hub.register_session(TransportKind::Websocket);
    let response = hub
        .dispatch(
            &session,
            ClientRequest::new(
                1i64,
                "printer.objects.subscribe",
                json!({"objects": {"flux_capacitor": null}}),
            ),
        )
        .await
        .unwrap();
    assert_eq!(
        response.outcome.err().map(|e| e.code),
        Some(error_codes::NOT_FOUND)
    );
}

#[tokio::test]
async fn responses_route_to_their_sessions_in_any_order() {
    let host = SimHost::start(printer_objects());
    host.hold("gcode/script");
    let hub = connected_hub(&host, HubConfig::default()).await;

    let sessions: Vec<_> = (0..8)
        .map(|_| hub.register_session(TransportKind::Websocket))
        .collect();
    let calls: Vec<_> = sessions
        .iter()
        .enumerate()
        .map(|(n, session)| {
            spawn_dispatch(
                &hub,
                session,
                ClientRequest::new(
                    1i64,
                    "printer.gcode.script",
                    json!({"script": format!("M117 session {n}")}),
                ),
            )
        })
        .collect();
    eventually("all scripts held", || host.held().len() == 8).await;

    for held in host.held().iter().rev() {
        host.answer(held, held.params["script"].clone());
    }
    for (n, call) in calls.into_iter().enumerate() {
        let response = within(call).await.unwrap().unwrap();
        assert_eq!(response.id, Some(1i64.into()));
        assert_eq!(response.outcome, Ok(json!(format!("M117 session {n}"))));
    }
    assert!(sessions.iter().all(|s| s.pending_calls() == 0));
}

#[tokio::test]
async fn link_reset_fails_pending_calls_and_reconnect_resends_snapshot() {
    let host = SimHost::start(printer_objects());
    host.hold("gcode/script");
    let hub = Hub::new(HubConfig::default(), host.link());
    let shutdown = CancellationToken::new();
    let supervisor = tokio::spawn({
        let link = hub.link().clone();
        let shutdown = shutdown.clone();
        async move { link.run_supervisor(shutdown).await }
    });
    eventually("initial resync", || hub.subscriptions().is_live()).await;

    let session = hub.register_session(TransportKind::Websocket);
    hub.subscriptions()
        .subscribe(session.id(), "extruder", FieldSet::fields(["temperature"]))
        .await
        .unwrap();

    let calls: Vec<_> = (0..3i64)
        .map(|n| {
            spawn_dispatch(
                &hub,
                &session,
                ClientRequest::new(n, "printer.gcode.script", json!({"script": "G28"})),
            )
        })
        .collect();
    eventually("three held calls", || host.held().len() == 3).await;

    host.drop_connection();
    for call in calls {
        let response = within(call).await.unwrap().unwrap();
        assert_eq!(
            response.outcome.err().map(|e| e.code),
            Some(error_codes::SERVICE_UNAVAILABLE)
        );
    }
    assert_eq!(next_event(&session).await.0, "notify_host_disconnected");

    // The supervisor reconnects; the session gets a fresh snapshot, then the ready signal.
    assert_eq!(
        next_event(&session).await,
        (
            "notify_status_update".to_string(),
            json!([{"extruder": {"temperature": 21.5}}, 100.0])
        )
    );
    assert_eq!(next_event(&session).await.0, "notify_host_ready");
    assert_eq!(host.connections(), 2);
    assert_eq!(host.subscribe_calls().last(), Some(&names(&["extruder"])));

    shutdown.cancel();
    within(supervisor).await.unwrap();
}

#[tokio::test]
async fn full_mailbox_drops_oldest_without_stalling_others() {
    let host = SimHost::start(printer_objects());
    let config = HubConfig {
        mailbox_capacity: 4,
        ..Default::default()
    };
    let hub = connected_hub(&host, config).await;
    let stalled = hub.register_session(TransportKind::Websocket);
    let reader = hub.register_session(TransportKind::Websocket);
    for session in [&stalled, &reader] {
        hub.subscriptions()
            .subscribe(session.id(), "heater_bed", FieldSet::fields(["temperature"]))
            .await
            .unwrap();
    }

    let mut last = 0.0;
    for step in 0..20 {
        last = host.push_delta(json!({"heater_bed": {"temperature": 20.0 + step as f64}}));
        // The reader keeps up; the stalled session never reads.
        let (_, params) = next_event(&reader).await;
        assert_eq!(params[1], json!(last));
    }

    assert_eq!(stalled.mailbox().len(), 4);
    assert_eq!(stalled.dropped_events(), 16);
    let kept: Vec<_> = std::iter::from_fn(|| stalled.mailbox().try_recv())
        .map(|event| event.params[1].clone())
        .collect();
    assert_eq!(
        kept,
        vec![json!(last - 3.0), json!(last - 2.0), json!(last - 1.0), json!(last)]
    );
}

#[tokio::test]
async fn duplicate_request_id_is_rejected_per_session() {
    let host = SimHost::start(printer_objects());
    host.hold("gcode/script");
    let hub = connected_hub(&host, HubConfig::default()).await;
    let a = hub.register_session(TransportKind::Websocket);
    let b = hub.register_session(TransportKind::Websocket);

    let script = || ClientRequest::new(7i64, "printer.gcode.script", json!({"script": "G4 P100"}));
    let first = spawn_dispatch(&hub, &a, script());
    eventually("first call held", || host.held().len() == 1).await;

    let duplicate = hub.dispatch(&a, script()).await.unwrap();
    assert_eq!(
        duplicate,
        ClientResponse::failure(
            Some(7i64.into()),
            &RpcError::DuplicateRequestId("7".to_string())
        )
    );

    // The same id on another session is independent.
    let other = spawn_dispatch(&hub, &b, script());
    eventually("second call held", || host.held().len() == 2).await;
    for held in host.held() {
        host.answer(&held, json!("ok"));
    }
    assert_eq!(within(first).await.unwrap().unwrap().outcome, Ok(json!("ok")));
    assert_eq!(within(other).await.unwrap().unwrap().outcome, Ok(json!("ok")));
}

#[tokio::test]
async fn closing_a_session_resolves_its_pending_calls() {
    let host = SimHost::start(printer_objects());
    host.hold("gcode/script");
    let hub = connected_hub(&host, HubConfig::default()).await;
    let session = hub.register_session(TransportKind::Websocket);

    let call = spawn_dispatch(
        &hub,
        &session,
        ClientRequest::new("m1", "printer.gcode.script", json!({"script": "G28"})),
    );
    eventually("call held", || host.held().len() == 1).await;
    hub.unregister_session(session.id());

    let response = within(call).await.unwrap().unwrap();
    assert_eq!(
        response,
        ClientResponse::failure(Some("m1".into()), &RpcError::SessionClosed)
    );
    assert_eq!(session.pending_calls(), 0);
}

#[tokio::test]
async fn per_call_timeout_override() {
    let host = SimHost::start(printer_objects());
    host.hold("info");
    let hub = connected_hub(&host, HubConfig::default()).await;
    let session = hub.register_session(TransportKind::HttpOneshot);

    let response = hub
        .dispatch_with_timeout(
            &session,
            ClientRequest::new(3i64, "printer.info", json!({})),
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap();
    assert_eq!(
        response.outcome.err().map(|e| e.code),
        Some(error_codes::GATEWAY_TIMEOUT)
    );

    // The late answer is discarded without disturbing the link.
    for held in host.held() {
        host.answer(&held, json!({"state": "ready"}));
    }
    eventually("no pending host calls", || hub.link().pending_calls() == 0).await;
    assert!(hub.link().state().is_up());
}

#[tokio::test]
async fn query_and_forwarded_methods() {
    let host = SimHost::start(printer_objects());
    let hub = connected_hub(&host, HubConfig::default()).await;
    let session = hub.register_session(TransportKind::HttpOneshot);

    let query = hub
        .dispatch(
            &session,
            ClientRequest::new(
                1i64,
                "printer.objects.query",
                json!({"objects": {"extruder": ["target"], "toolhead": ["status"]}}),
            ),
        )
        .await
        .unwrap();
    assert_eq!(
        query.outcome,
        Ok(json!({
            "eventtime": 100.0,
            "status": {"extruder": {"target": 0.0}, "toolhead": {"status": "Ready"}}
        }))
    );

    let info = hub
        .dispatch(&session, ClientRequest::new(2i64, "printer.info", json!({})))
        .await
        .unwrap();
    assert_eq!(info.outcome, Ok(json!({"state": "ready", "hostname": "sim"})));

    let list = hub
        .dispatch(&session, ClientRequest::new(3i64, "printer.objects.list", json!({})))
        .await
        .unwrap();
    assert_eq!(
        list.outcome.unwrap()["objects"].as_array().map(Vec::len),
        Some(4)
    );
}

#[tokio::test]
async fn host_events_fan_out_to_every_session() {
    let host = SimHost::start(printer_objects());
    let hub = connected_hub(&host, HubConfig::default()).await;
    let sessions: Vec<_> = (0..3)
        .map(|_| hub.register_session(TransportKind::Websocket))
        .collect();
    host.notify("notify_gcode_response", json!(["echo: hello"]));
    for session in &sessions {
        assert_eq!(
            next_event(session).await,
            ("notify_gcode_response".to_string(), json!(["echo: hello"]))
        );
    }
}

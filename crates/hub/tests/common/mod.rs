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

//! A scripted control host on a unix socket, good enough to drive the hub end to end.

#![allow(dead_code)]

use rpc_async_client::{LinkConfig, UpstreamLink};
use serde_json::{Map, Value, json};
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct HeldCall {
    pub id: Value,
    pub method: String,
    pub params: Value,
}

#[derive(Default)]
struct SimState {
    objects: Map<String, Value>,
    eventtime: f64,
    subscribe_calls: Vec<BTreeSet<String>>,
    connections: usize,
    hold: HashSet<String>,
    held: Vec<HeldCall>,
    writer: Option<mpsc::UnboundedSender<String>>,
    connection: Option<CancellationToken>,
}

pub struct SimHost {
    _dir: TempDir,
    pub path: PathBuf,
    state: Arc<Mutex<SimState>>,
    shutdown: CancellationToken,
}

impl SimHost {
    /// Start serving with an initial object table.
    pub fn start(objects: Value) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let state = Arc::new(Mutex::new(SimState {
            objects: objects.as_object().cloned().unwrap(),
            eventtime: 100.0,
            ..Default::default()
        }));
        let shutdown = CancellationToken::new();
        tokio::spawn(accept_loop(listener, state.clone(), shutdown.clone()));
        Self {
            _dir: dir,
            path,
            state,
            shutdown,
        }
    }

    pub fn link_config(&self) -> LinkConfig {
        let mut config = LinkConfig::new(&self.path);
        config.reconnect_min = Duration::from_millis(10);
        config.reconnect_max = Duration::from_millis(50);
        config
    }

    pub fn link(&self) -> UpstreamLink {
        UpstreamLink::new(self.link_config())
    }

    /// Stop answering `method`; calls to it pile up in `held()`.
    pub fn hold(&self, method: &str) {
        self.state.lock().unwrap().hold.insert(method.to_string());
    }

    pub fn held(&self) -> Vec<HeldCall> {
        self.state.lock().unwrap().held.clone()
    }

    /// Answer a held call.
    pub fn answer(&self, call: &HeldCall, result: Value) {
        let mut state = self.state.lock().unwrap();
        state.held.retain(|held| held.id != call.id);
        send(&state, json!({"result": result, "id": call.id}));
    }

    pub fn subscribe_calls(&self) -> Vec<BTreeSet<String>> {
        self.state.lock().unwrap().subscribe_calls.clone()
    }

    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    /// Merge `status` into the object table and push it as a delta. Returns its eventtime.
    pub fn push_delta(&self, status: Value) -> f64 {
        let mut state = self.state.lock().unwrap();
        state.eventtime += 1.0;
        let eventtime = state.eventtime;
        for (name, fields) in status.as_object().unwrap() {
            let object = state
                .objects
                .entry(name.clone())
                .or_insert_with(|| json!({}));
            for (field, value) in fields.as_object().unwrap() {
                object[field] = value.clone();
            }
        }
        send(
            &state,
            json!({"method": "process_status_update", "params": [status, eventtime]}),
        );
        eventtime
    }

    pub fn notify(&self, method: &str, params: Value) {
        let state = self.state.lock().unwrap();
        send(&state, json!({"method": method, "params": params}));
    }

    /// Close the current connection from the host side.
    pub fn drop_connection(&self) {
        let mut state = self.state.lock().unwrap();
        state.writer = None;
        state.held.clear();
        if let Some(connection) = state.connection.take() {
            connection.cancel();
        }
    }
}

impl Drop for SimHost {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn send(state: &SimState, frame: Value) {
    if let Some(writer) = &state.writer {
        let _ = writer.send(format!("{frame}\n"));
    }
}

fn status_of(state: &SimState, names: &BTreeSet<String>) -> Value {
    let status: Map<String, Value> = names
        .iter()
        .filter_map(|name| {
            state
                .objects
                .get(name)
                .map(|fields| (name.clone(), fields.clone()))
        })
        .collect();
    json!({"eventtime": state.eventtime, "status": status})
}

fn requested(params: &Value) -> BTreeSet<String> {
    params["objects"]
        .as_object()
        .map(|objects| objects.keys().cloned().collect())
        .unwrap_or_default()
}

async fn accept_loop(listener: UnixListener, state: Arc<Mutex<SimState>>, shutdown: CancellationToken) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(_) => return,
            },
        };
        let (read, mut write) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let connection = shutdown.child_token();
        {
            let mut state = state.lock().unwrap();
            state.connections += 1;
            state.writer = Some(tx);
            state.connection = Some(connection.clone());
        }

        let writer_token = connection.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_token.cancelled() => return,
                    frame = rx.recv() => match frame {
                        Some(frame) => {
                            if write.write_all(frame.as_bytes()).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    },
                }
            }
        });

        let state = state.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read).lines();
            loop {
                let line = tokio::select! {
                    _ = connection.cancelled() => return,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => line,
                        _ => return,
                    },
                };
                let Ok(frame) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                handle_frame(&state, frame);
            }
        });
    }
}

fn handle_frame(state: &Arc<Mutex<SimState>>, frame: Value) {
    let mut state = state.lock().unwrap();
    let method = frame["method"].as_str().unwrap_or_default().to_string();
    let id = frame["id"].clone();
    let params = frame["params"].clone();
    if id.is_null() {
        return;
    }
    if state.hold.contains(&method) {
        state.held.push(HeldCall { id, method, params });
        return;
    }
    let reply = match method.as_str() {
        "objects/list" => json!({"result": {"objects": state.objects.keys().collect::<Vec<_>>()}, "id": id}),
        "objects/subscribe" => {
            let names = requested(&params);
            state.subscribe_calls.push(names.clone());
            json!({"result": status_of(&state, &names), "id": id})
        }
        "objects/query" => json!({"result": status_of(&state, &requested(&params)), "id": id}),
        "info" => json!({"result": {"state": "ready", "hostname": "sim"}, "id": id}),
        "gcode/script" => json!({"result": {}, "id": id}),
        _ => json!({"error": {"code": -32601, "message": format!("no method {method}")}, "id": id}),
    };
    send(&state, reply);
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

pub fn printer_objects() -> Value {
    json!({
        "toolhead": {"position": [0.0, 0.0, 0.0, 0.0], "status": "Ready", "homed_axes": ""},
        "extruder": {"temperature": 21.5, "target": 0.0},
        "heater_bed": {"temperature": 20.0, "target": 0.0},
        "webhooks": {"state": "ready"}
    })
}

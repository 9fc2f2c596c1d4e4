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

use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
struct CachedObject {
    fields: Map<String, Value>,
    /// Host time of the newest information merged into `fields`.
    eventtime: Option<f64>,
}

/// Last known status of every tracked host object, merged from snapshots and deltas.
#[derive(Debug, Default)]
pub struct HostStateCache {
    objects: HashMap<String, CachedObject>,
    eventtime: Option<f64>,
}

pub(crate) fn newer(candidate: Option<f64>, current: Option<f64>) -> bool {
    match (candidate, current) {
        (Some(candidate), Some(current)) => candidate >= current,
        _ => true,
    }
}

fn latest(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

impl HostStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an incremental update. Deltas arrive in host order so they always win.
    pub fn apply_delta(&mut self, eventtime: Option<f64>, status: &Map<String, Value>) {
        for (name, fields) in status {
            let Value::Object(fields) = fields else {
                continue;
            };
            let object = self.objects.entry(name.clone()).or_default();
            for (field, value) in fields {
                object.fields.insert(field.clone(), value.clone());
            }
            object.eventtime = latest(object.eventtime, eventtime);
        }
        self.eventtime = latest(self.eventtime, eventtime);
    }

    /// Merge a full snapshot. A snapshot older than what we already hold for an object only
    /// fills in fields we don't have; it never rolls newer values back.
    pub fn apply_snapshot(&mut self, eventtime: Option<f64>, status: &Map<String, Value>) {
        for (name, fields) in status {
            let Value::Object(fields) = fields else {
                continue;
            };
            let object = self.objects.entry(name.clone()).or_default();
            let overwrite = newer(eventtime, object.eventtime);
            for (field, value) in fields {
                if overwrite || !object.fields.contains_key(field) {
                    object.fields.insert(field.clone(), value.clone());
                }
            }
            if overwrite {
                object.eventtime = latest(object.eventtime, eventtime);
            }
        }
        self.eventtime = latest(self.eventtime, eventtime);
    }

    pub fn get(&self, name: &str) -> Option<&Map<String, Value>> {
        self.objects.get(name).map(|object| &object.fields)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.objects.contains_key(name)
    }

    /// Newest host time seen across all objects.
    pub fn eventtime(&self) -> Option<f64> {
        self.eventtime
    }

    /// Forget objects that are no longer tracked.
    pub fn retain(&mut self, tracked: &BTreeSet<String>) {
        self.objects.retain(|name, _| tracked.contains(name));
    }

    pub fn clear(&mut self) {
        self.objects.clear();
        self.eventtime = None;
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn status(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_delta_merges_fields() {
        let mut cache = HostStateCache::new();
        cache.apply_snapshot(
            Some(10.0),
            &status(json!({"toolhead": {"position": [0, 0, 0, 0], "status": "Ready"}})),
        );
        cache.apply_delta(Some(11.0), &status(json!({"toolhead": {"position": [1, 2, 3, 0]}})));
        assert_eq!(
            cache.get("toolhead").cloned(),
            Some(status(json!({"position": [1, 2, 3, 0], "status": "Ready"})))
        );
        assert_eq!(cache.eventtime(), Some(11.0));
    }

    #[test]
    fn test_stale_snapshot_does_not_roll_back() {
        let mut cache = HostStateCache::new();
        cache.apply_delta(Some(20.0), &status(json!({"toolhead": {"position": [5, 5, 5, 0]}})));
        cache.apply_snapshot(
            Some(15.0),
            &status(json!({"toolhead": {"position": [0, 0, 0, 0], "status": "Ready"}})),
        );
        assert_eq!(
            cache.get("toolhead").cloned(),
            Some(status(json!({"position": [5, 5, 5, 0], "status": "Ready"})))
        );
        assert_eq!(cache.eventtime(), Some(20.0));
    }

    #[test]
    fn test_retain_and_clear() {
        let mut cache = HostStateCache::new();
        cache.apply_snapshot(
            Some(1.0),
            &status(json!({"toolhead": {"x": 1}, "extruder": {"temperature": 20.5}})),
        );
        cache.retain(&BTreeSet::from(["extruder".to_string()]));
        assert!(!cache.contains("toolhead"));
        assert!(cache.contains("extruder"));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.eventtime(), None);
    }

    #[test]
    fn test_non_object_entries_ignored() {
        let mut cache = HostStateCache::new();
        cache.apply_delta(None, &status(json!({"toolhead": 3})));
        assert!(cache.is_empty());
    }
}

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

use crate::RpcError;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Which fields of an object a client wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSet {
    /// Every field the object currently has (`null` on the wire).
    All,
    /// Only the named fields. An empty set means "cancel".
    Fields(BTreeSet<String>),
}

impl FieldSet {
    pub fn fields<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldSet::Fields(names.into_iter().map(Into::into).collect())
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self, FieldSet::Fields(names) if names.is_empty())
    }

    /// Keep only the requested fields. Requested fields the object lacks are silently absent.
    pub fn filter(&self, values: &Map<String, Value>) -> Map<String, Value> {
        match self {
            FieldSet::All => values.clone(),
            FieldSet::Fields(names) => values
                .iter()
                .filter(|(name, _)| names.contains(name.as_str()))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        }
    }

    fn from_wire(object: &str, value: Value) -> Result<Self, RpcError> {
        match value {
            Value::Null => Ok(FieldSet::All),
            Value::Array(items) => {
                let mut names = BTreeSet::new();
                for item in items {
                    let Value::String(name) = item else {
                        return Err(RpcError::InvalidParams(format!(
                            "field names for {object} must be strings"
                        )));
                    };
                    names.insert(name);
                }
                Ok(FieldSet::Fields(names))
            }
            _ => Err(RpcError::InvalidParams(format!(
                "fields for {object} must be null or an array"
            ))),
        }
    }

    pub fn to_wire(&self) -> Value {
        match self {
            FieldSet::All => Value::Null,
            FieldSet::Fields(names) => {
                Value::Array(names.iter().map(|n| Value::from(n.as_str())).collect())
            }
        }
    }
}

/// The `{"objects": {<name>: null | [<field>, ...]}}` shape used by subscribe and query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectsRequest {
    pub objects: BTreeMap<String, FieldSet>,
}

impl ObjectsRequest {
    pub fn parse(params: &Value) -> Result<Self, RpcError> {
        let objects = match params {
            Value::Object(params) => params.get("objects").cloned().unwrap_or(Value::Null),
            // Positional form: `[{"objects": {...}}]`
            Value::Array(items) => items
                .first()
                .and_then(|first| first.get("objects"))
                .cloned()
                .unwrap_or(Value::Null),
            _ => Value::Null,
        };
        let Value::Object(objects) = objects else {
            return Err(RpcError::InvalidParams(
                "params must contain an \"objects\" object".to_string(),
            ));
        };
        let mut parsed = BTreeMap::new();
        for (name, fields) in objects {
            let fields = FieldSet::from_wire(&name, fields)?;
            parsed.insert(name, fields);
        }
        Ok(Self { objects: parsed })
    }

    pub fn to_wire(&self) -> Value {
        let objects: Map<String, Value> = self
            .objects
            .iter()
            .map(|(name, fields)| (name.clone(), fields.to_wire()))
            .collect();
        let mut params = Map::new();
        params.insert("objects".to_string(), Value::Object(objects));
        Value::Object(params)
    }
}

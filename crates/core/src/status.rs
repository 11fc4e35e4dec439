//! Status surface written by the reconciler: external identity, conditions and
//! bound references.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{Kind, Reference};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    Ready,
    Synced,
    Creating,
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    fn new(type_: ConditionType, status: ConditionStatus, reason: &str, message: Option<String>) -> Self {
        Self { type_, status, reason: reason.to_string(), message, last_transition_time: Utc::now() }
    }

    pub fn available() -> Self { Self::new(ConditionType::Ready, ConditionStatus::True, "Available", None) }

    pub fn unavailable(reason: &str, message: impl Into<String>) -> Self {
        Self::new(ConditionType::Ready, ConditionStatus::False, reason, Some(message.into()))
    }

    pub fn creating() -> Self { Self::new(ConditionType::Creating, ConditionStatus::True, "Creating", None) }

    pub fn deleting() -> Self { Self::new(ConditionType::Deleting, ConditionStatus::True, "Deleting", None) }

    pub fn synced() -> Self { Self::new(ConditionType::Synced, ConditionStatus::True, "ReconcileSuccess", None) }

    pub fn sync_failed(reason: &str, message: impl Into<String>) -> Self {
        Self::new(ConditionType::Synced, ConditionStatus::False, reason, Some(message.into()))
    }
}

/// A reference pinned at the value it resolved to. Once the owning external
/// resource exists this value wins over re-resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundReference {
    pub kind: Kind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub value: String,
}

impl BoundReference {
    pub fn points_at(&self, r: &Reference) -> bool { self.name == r.name && self.namespace == r.namespace }

    pub fn reference(&self) -> Reference { Reference { name: self.name.clone(), namespace: self.namespace.clone() } }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bound_references: BTreeMap<String, BoundReference>,
    /// Last observed external representation, for humans.
    #[serde(default, skip_serializing_if = "Json::is_null")]
    pub at_provider: Json,
}

impl ResourceStatus {
    pub fn condition(&self, t: ConditionType) -> Option<&Condition> { self.conditions.iter().find(|c| c.type_ == t) }

    /// Upsert by type. The transition time only moves when the status flips.
    pub fn set_condition(&mut self, mut c: Condition) {
        match self.conditions.iter_mut().find(|x| x.type_ == c.type_) {
            Some(existing) => {
                if existing.status == c.status {
                    c.last_transition_time = existing.last_transition_time;
                }
                *existing = c;
            }
            None => self.conditions.push(c),
        }
    }

    pub fn clear_condition(&mut self, t: ConditionType) { self.conditions.retain(|c| c.type_ != t); }

    /// Status equality ignoring condition timestamps; used to skip no-op writes.
    pub fn same_as(&self, other: &ResourceStatus) -> bool {
        let strip = |s: &ResourceStatus| {
            let mut s = s.clone();
            for c in s.conditions.iter_mut() {
                c.last_transition_time = DateTime::<Utc>::MIN_UTC;
            }
            s
        };
        strip(self) == strip(other)
    }
}

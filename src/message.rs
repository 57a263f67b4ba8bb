use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::VectorSnapshot;

/// Stable node identity. All back-references between components go through
/// ids plus lookup, never through owned pointers.
pub type NodeId = String;

/// Message body shared between an envelope and its clones. The inner value
/// is immutable once constructed, so cloning an envelope shares it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, derive_more::Deref)]
#[serde(transparent)]
pub struct Payload(pub Arc<serde_json::Value>);

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self(Arc::new(value))
    }
}

/// One message in flight: routing metadata, optional clock stamps, payload.
/// Immutable after creation except for `received_at`, which the transport
/// fills at delivery. `Clone` deep-copies the clock map and metadata and
/// shares the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub from: NodeId,
    pub to: NodeId,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Payload,
    pub sent_at: u64,
    pub received_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lamport: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<VectorSnapshot>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Envelope {
    pub fn new(
        id: u64,
        from: impl Into<NodeId>,
        to: impl Into<NodeId>,
        kind: impl Into<String>,
        payload: Payload,
        sent_at: u64,
    ) -> Self {
        Self {
            id,
            from: from.into(),
            to: to.into(),
            kind: kind.into(),
            payload,
            sent_at,
            received_at: None,
            lamport: None,
            vector: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Compact description used in event payloads and logs.
    pub fn summary(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut data = serde_json::Map::new();
        data.insert("id".into(), self.id.into());
        data.insert("from".into(), self.from.clone().into());
        data.insert("to".into(), self.to.clone().into());
        data.insert("message_type".into(), self.kind.clone().into());
        if let Some(lamport) = self.lamport {
            data.insert("lamport".into(), lamport.into());
        }
        data
    }
}

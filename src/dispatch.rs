//! Types crossing the ingress → dispatcher boundary.
//!
//! The ingress receiver builds a `DispatchRequest` and posts it to the
//! dispatcher's private endpoint; the dispatcher forwards the payload to
//! the agent runtime. The two processes share only these types (and an
//! internal bearer token) — the receiver never holds agent credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One inbound event handed to the dispatcher. Ephemeral — never
/// persisted past the dispatch boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Dedup key from the upstream source
    pub event_id: String,

    /// Opaque event body, forwarded verbatim to the agent
    pub payload: serde_json::Value,

    pub received_at: DateTime<Utc>,

    pub event_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_subtype: Option<String>,

    /// Channel to post failures back to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Thread within the channel, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

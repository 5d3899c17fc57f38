//! Observable state snapshots for invariant checking.
//!
//! Invariants operate on snapshots rather than live endpoints so every check
//! in a round sees the same state.

use keyphase_core::{Endpoint, Role, Timestamp};

/// Snapshot of one endpoint's observable key state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSnapshot {
    /// Which side this is.
    pub role: Role,
    /// Whether the endpoint has closed.
    pub closed: bool,
    /// Close reason, rendered.
    pub close_reason: Option<String>,
    /// Current write generation.
    pub local_generation: u64,
    /// Current read generation.
    pub remote_generation: u64,
    /// Write generation after every round so far.
    pub local_history: Vec<u64>,
    /// Read generation after every round so far.
    pub remote_history: Vec<u64>,
    /// Key phase transitions among packets this endpoint sent.
    pub sent_transitions: usize,
    /// Key phase transitions among packets this endpoint accepted.
    pub received_transitions: usize,
}

impl EndpointSnapshot {
    /// Capture `endpoint` with its recorded history and transition counts.
    pub fn capture<I: Timestamp>(
        endpoint: &Endpoint<I>,
        local_history: Vec<u64>,
        remote_history: Vec<u64>,
        sent_transitions: usize,
        received_transitions: usize,
    ) -> Self {
        let engine = endpoint.engine();
        Self {
            role: endpoint.role(),
            closed: endpoint.is_closed(),
            close_reason: endpoint.close_reason().map(ToString::to_string),
            local_generation: engine.local_generation().unwrap_or(0),
            remote_generation: engine.remote_generation().unwrap_or(0),
            local_history,
            remote_history,
            sent_transitions,
            received_transitions,
        }
    }
}

/// Snapshot of both endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemSnapshot {
    /// Per-endpoint snapshots, client first.
    pub endpoints: Vec<EndpointSnapshot>,
}

impl SystemSnapshot {
    /// Snapshot of a client/server pair.
    pub fn pair(client: EndpointSnapshot, server: EndpointSnapshot) -> Self {
        Self { endpoints: vec![client, server] }
    }

    /// The endpoint facing `role`, if present.
    pub fn peer_of(&self, role: Role) -> Option<&EndpointSnapshot> {
        self.endpoints.iter().find(|e| e.role == role.peer())
    }
}

//! Axum HTTP handlers for fbas-node.
//!
//! - `POST /scp` - Inbound protocol message
//! - `POST /nominate` - Propose a value for a slot (202 if held for a later round)
//! - `GET /slots/{slot}` - Decision for a slot
//! - `GET /externalized?after=N` - Decisions above slot N, for catching up
//! - `GET /health` - Health check

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use fbas::{Conductor, Msg, NodeError, SlotId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    peers::{PeerHealth, Peers},
    value::BlockId,
};

/// The conductor over block ids.
pub type NodeConductor = Conductor<BlockId>;

/// Shared application state for axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The conductor instance.
    pub conductor: NodeConductor,
    /// Peer transport, for the health report.
    pub peers: Peers,
}

/// Nominate request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NominateRequest {
    /// Slot to nominate for.
    pub slot: SlotId,
    /// The proposed block id.
    pub value: BlockId,
}

/// Decision for a slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotResponse {
    /// Slot id.
    pub slot: SlotId,
    /// Decided block id.
    pub value: BlockId,
    /// Counter of the committed ballot.
    pub counter: u32,
}

/// Query for the catch-up feed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AfterQuery {
    /// Only decisions for slots above this one.
    #[serde(default)]
    pub after: SlotId,
}

/// Health status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Whether the node is healthy.
    pub healthy: bool,
    /// The node's id.
    pub node_id: String,
    /// Highest decided slot.
    pub last_externalized: Option<SlotId>,
    /// Undecided slots.
    pub pending: Vec<SlotId>,
    /// Peer health.
    pub peers: Vec<PeerHealth>,
}

/// Error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message.
    pub error: String,
}

/// Creates the axum router with all RPC endpoints.
pub fn create_router(conductor: NodeConductor, peers: Peers) -> Router {
    let state = AppState { conductor, peers };

    Router::new()
        .route("/health", get(health_handler))
        .route("/scp", post(scp_handler))
        .route("/nominate", post(nominate_handler))
        .route("/slots/{slot}", get(slot_handler))
        .route("/externalized", get(externalized_handler))
        .with_state(state)
}

/// Errors returned by the RPC handlers.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The node could not process the message.
    #[error(transparent)]
    Rejected(#[from] NodeError),

    /// The slot has no decision yet.
    #[error("slot {slot} not externalized ({phase})")]
    NotExternalized {
        /// The requested slot.
        slot: SlotId,
        /// Its current phase, or `unseen`.
        phase: String,
    },
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Rejected(_) => StatusCode::CONFLICT,
            Self::NotExternalized { .. } => StatusCode::NOT_FOUND,
        };
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

/// Responds with the node's message, or 204 if there is none.
fn respond(out: Option<Msg<BlockId>>) -> Response {
    match out {
        Some(msg) => (StatusCode::OK, Json(msg)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Handler for `POST /scp`.
async fn scp_handler(
    State(state): State<AppState>,
    Json(msg): Json<Msg<BlockId>>,
) -> Result<Response, RpcError> {
    debug!(%msg, "inbound");
    Ok(respond(state.conductor.handle(msg).await?))
}

/// Handler for `POST /nominate`.
///
/// Answers 202 when the value is held until this node leads a round.
async fn nominate_handler(
    State(state): State<AppState>,
    Json(request): Json<NominateRequest>,
) -> Result<Response, RpcError> {
    let out = state.conductor.nominate(request.slot, request.value).await?;
    Ok(out.map_or_else(|| StatusCode::ACCEPTED.into_response(), |msg| respond(Some(msg))))
}

/// Handler for `GET /slots/{slot}`.
async fn slot_handler(
    State(state): State<AppState>,
    Path(slot): Path<SlotId>,
) -> Result<Json<SlotResponse>, RpcError> {
    let Some(ext) = state.conductor.externalized(slot).await else {
        let phase = state
            .conductor
            .phase(slot)
            .await
            .map_or_else(|| "unseen".to_string(), |phase| phase.to_string());
        return Err(RpcError::NotExternalized { slot, phase });
    };
    Ok(Json(SlotResponse { slot, value: ext.c.value, counter: ext.c.counter }))
}

/// Handler for `GET /externalized`.
async fn externalized_handler(
    State(state): State<AppState>,
    Query(query): Query<AfterQuery>,
) -> impl IntoResponse {
    Json(state.conductor.decisions_after(query.after).await)
}

/// Health endpoint handler.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = HealthStatus {
        healthy: true,
        node_id: state.conductor.id().to_string(),
        last_externalized: state.conductor.last_externalized().await.map(|(slot, _)| slot),
        pending: state.conductor.pending_slots().await,
        peers: state.peers.all_peers().await,
    };

    (StatusCode::OK, Json(status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominate_request_serde() {
        let json = format!(r#"{{"slot":3,"value":"0x{}"}}"#, "11".repeat(32));
        let request: NominateRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(request.slot, 3);
        assert_eq!(request.value, BlockId([0x11; 32]));
    }

    #[test]
    fn test_after_query_defaults_to_zero() {
        let query: AfterQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query.after, 0);
    }

    #[test]
    fn test_rpc_error_status() {
        let rejected = RpcError::from(NodeError::MissingPreviousValue { slot: 4 });
        assert_eq!(rejected.into_response().status(), StatusCode::CONFLICT);

        let missing = RpcError::NotExternalized { slot: 9, phase: "unseen".to_string() };
        assert_eq!(missing.to_string(), "slot 9 not externalized (unseen)");
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_slot_response_serde() {
        let response = SlotResponse { slot: 7, value: BlockId([2; 32]), counter: 1 };
        let json = serde_json::to_string(&response).unwrap();
        let parsed: SlotResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.slot, 7);
        assert_eq!(parsed.value, response.value);
    }
}

//! Contract for the turn backend.

use crate::stream::ByteStream;
use crate::Result;
use async_trait::async_trait;
use tether_types::{ActiveTurnStatus, Draft, SubmitRequest, TurnCoordinates};

/// Operations the client consumes from the agent service.
///
/// Streams returned here carry the raw event-stream bytes; framing and
/// decoding happen in [`crate::stream`] and [`crate::events`].
#[async_trait]
pub trait TurnBackend: Send + Sync + 'static {
    /// Start a turn. The backend treats `turn_id` as an idempotency key.
    async fn submit_turn(&self, request: &SubmitRequest) -> Result<ByteStream>;

    /// Look up a turn by the client's correlation id.
    async fn query_active_turn(&self, turn_id: &str) -> Result<ActiveTurnStatus>;

    /// Attach to the live app-event channel of a running turn.
    async fn attach_turn_events(&self, coordinates: &TurnCoordinates) -> Result<ByteStream>;

    async fn interrupt_turn(&self, target: &str) -> Result<()>;

    async fn reset_thread(&self, key: &str) -> Result<()>;

    async fn get_draft(&self, target: &str) -> Result<Option<Draft>>;

    async fn apply_draft(&self, target: &str, force: bool) -> Result<()>;

    async fn discard_draft(&self, target: &str) -> Result<()>;
}

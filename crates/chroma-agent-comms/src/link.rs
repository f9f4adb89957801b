//! The seam between the transport and whatever carries batches to the
//! manager: HTTPS in production, an in-process fake in tests.

use async_trait::async_trait;
use chroma_agent_core::Batch;

use crate::error::{TransportError, TransportResult};

#[async_trait]
pub trait ManagerLink: Send + Sync {
    /// Deliver one batch and return the manager's reply batch.
    async fn post(&self, batch: &Batch) -> TransportResult<Batch>;

    /// Make sure the agent holds usable credentials before the first post.
    async fn ensure_identity(&self) -> TransportResult<()> {
        Ok(())
    }

    /// Recover from an auth rejection, e.g. by reloading the certificate.
    async fn reauthenticate(&self) -> TransportResult<()> {
        Err(TransportError::Auth("reauthentication not supported".into()))
    }
}

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::AppResult;

/// Maps a content reference (an IPFS cid) to platform content.
///
/// Implementations must not open a ledger transaction of their own; the
/// engine resolves content before it starts one.
#[async_trait]
pub trait ContentResolver: Send + Sync {
    async fn resolve_content_reference(&self, reference: &str) -> AppResult<Option<Uuid>>;
}

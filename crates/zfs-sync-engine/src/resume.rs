//! Resumable-receive detection

use tracing::info;
use zfs_sync_types::{Endpoint, HostExecutor, TransferKind};

use crate::inventory::Inventory;

/// Check the destination for an interrupted receive
///
/// Returns the resume transfer when a token is pending. The token is read
/// fresh on every call; an unreadable marker counts as no token.
pub async fn detect_resume<E: HostExecutor + ?Sized>(
    inventory: &Inventory<'_, E>,
    destination: &Endpoint,
) -> Option<TransferKind> {
    let token = inventory.resume_token(destination).await?;
    info!(
        destination = %destination,
        token_len = token.len(),
        "Found resume token, continuing interrupted transfer"
    );
    Some(TransferKind::Resume { token })
}

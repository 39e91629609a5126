//! Raw byte relay used for pass-through tunnels.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::BoxedTransport;
use crate::{Error, Result};

/// Copies bytes both ways until each side has finished writing. Both transports are
/// dropped together when the relay ends, whichever side caused it.
pub async fn relay(
    mut client: BoxedTransport,
    mut server: BoxedTransport,
    cancel: CancellationToken,
) -> Result<(u64, u64)> {
    tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut client, &mut server) => {
            let (up, down) = copied?;
            debug!("TCP relay closed: {} bytes up, {} bytes down", up, down);
            Ok((up, down))
        }
        _ = cancel.cancelled() => {
            debug!("TCP relay cancelled");
            Err(Error::Cancelled)
        }
    }
}

//! Connection handshake with a storage node.
//!
//! Before the first frame the client announces its role and requested
//! compression level; the node acknowledges with `ok`. The select and
//! insert paths use distinct roles so a node can account for them
//! separately.

use crate::codec::{BufferedConn, RpcError, MAX_ERROR_MESSAGE_SIZE};

/// Role announced by query-path connections.
pub(crate) const SELECT_CLIENT_ROLE: &str = "select_client.v1";

/// Role announced by insert-path connections.
pub(crate) const INSERT_CLIENT_ROLE: &str = "insert_client.v1";

const HANDSHAKE_ACK: &[u8] = b"ok";

/// Performs the client side of the handshake on a fresh connection.
///
/// Requests are small enough that compression never pays off, so this
/// client always announces level 0.
pub(crate) async fn client_handshake(conn: &mut BufferedConn, role: &str) -> Result<(), RpcError> {
    conn.write_bytes(role.as_bytes()).await?;
    conn.write_u32(0).await?;
    conn.flush().await?;

    let ack = conn.read_bytes(MAX_ERROR_MESSAGE_SIZE).await?;
    if ack != HANDSHAKE_ACK {
        return Err(RpcError::Handshake {
            reason: format!(
                "unexpected handshake reply {:?}",
                String::from_utf8_lossy(&ack)
            ),
        });
    }
    Ok(())
}

/// Performs the node side of the handshake; used by in-process fake
/// storage nodes in tests.
pub(crate) async fn server_handshake(conn: &mut BufferedConn) -> Result<String, RpcError> {
    let role = conn.read_bytes(MAX_ERROR_MESSAGE_SIZE).await?;
    let _compression_level = conn.read_u32().await?;
    conn.write_bytes(HANDSHAKE_ACK).await?;
    conn.flush().await?;
    Ok(String::from_utf8_lossy(&role).into_owned())
}

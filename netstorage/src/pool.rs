//! Per-shard pool of authenticated, reusable connections.

use crate::codec::{with_deadline, BufferedConn, RpcError};
use crate::handshake::client_handshake;
use data_types::Deadline;
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use tokio::net::TcpStream;

/// A pool of handshaken connections to a single storage node.
///
/// Borrowed connections carry the caller's deadline. The caller decides
/// whether a connection goes back into the pool: remote errors leave the
/// protocol intact, local errors mean the socket state is unknown and
/// the connection must be dropped instead of returned.
#[derive(Debug)]
pub(crate) struct ConnPool {
    name: &'static str,
    addr: String,
    role: &'static str,
    free: Mutex<Vec<BufferedConn>>,
}

impl ConnPool {
    pub(crate) fn new(name: &'static str, addr: String, role: &'static str) -> Self {
        Self {
            name,
            addr,
            role,
            free: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn addr(&self) -> &str {
        &self.addr
    }

    /// Borrows a pooled connection, dialing a new one if the pool is
    /// empty. Dial and handshake are bounded by `deadline`.
    pub(crate) async fn get(&self, deadline: Deadline) -> Result<BufferedConn, RpcError> {
        if let Some(mut conn) = self.free.lock().pop() {
            conn.set_deadline(deadline);
            return Ok(conn);
        }

        let addr = self.addr.clone();
        let stream = with_deadline(Some(deadline), async move {
            let stream = TcpStream::connect(&addr).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        })
        .await?;

        let mut conn = BufferedConn::new(stream);
        conn.set_deadline(deadline);
        client_handshake(&mut conn, self.role).await?;
        debug!(pool = self.name, addr = %self.addr, "established storage node connection");
        Ok(conn)
    }

    /// Returns a healthy connection to the pool.
    pub(crate) fn put(&self, conn: BufferedConn) {
        self.free.lock().push(conn);
    }
}

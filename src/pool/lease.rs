//! Exclusive connection lease.

use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use crate::pool::connection::Connection;
use crate::pool::pool::PoolInner;
use crate::pool::ExecuteError;
use crate::upstream::{Upstream, UpstreamError};

/// A connection borrowed from the pool.
///
/// Returned to the pool by [`PooledConnection::release`] or on drop.
pub struct PooledConnection<U: Upstream> {
    conn: Arc<Connection<U>>,
    pool: Arc<PoolInner<U>>,
    released: bool,
}

impl<U: Upstream> PooledConnection<U> {
    pub(crate) fn new(conn: Arc<Connection<U>>, pool: Arc<PoolInner<U>>) -> Self {
        Self {
            conn,
            pool,
            released: false,
        }
    }

    pub fn connection(&self) -> &Arc<Connection<U>> {
        &self.conn
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Run `operation` on the leased connection.
    ///
    /// Terminal failures are handed to the pool's exception handler, which may
    /// reset the connection before this returns.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, ExecuteError>
    where
        F: FnMut(Arc<U::Handle>) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        if self.released {
            return Err(crate::pool::PoolError::Released.into());
        }
        let result = self.conn.execute(operation).await;
        if let Err(err) = &result {
            self.pool.report_failure(&self.conn, err).await;
        }
        result
    }

    /// Return the connection to the pool. Later calls are no-ops returning `false`.
    pub async fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.pool.release_connection(&self.conn).await
    }
}

impl<U: Upstream> Deref for PooledConnection<U> {
    type Target = Connection<U>;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<U: Upstream> fmt::Debug for PooledConnection<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.conn)
            .field("released", &self.released)
            .finish()
    }
}

impl<U: Upstream> Drop for PooledConnection<U> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release_detached(Arc::clone(&self.conn));
        }
    }
}

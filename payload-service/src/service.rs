//! Payload query service.
//!
//! Acquires a connection per request, runs the payload query on a task that
//! owns the connection, and exposes the rows as a plain-text body stream.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use futures::{stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use common::errors::{AppError, AppResult};
use common::models::{PayloadRow, PAYLOAD_PREAMBLE};

use crate::connector::{ConnectionProvider, PayloadConnection};

/// Rows buffered between the query task and the response writer.
const ROW_CHANNEL_CAPACITY: usize = 64;

/// Runs the payload query against a freshly acquired connection.
pub struct PayloadService {
    provider: Arc<dyn ConnectionProvider>,
    connect_timeout: Duration,
    query_timeout: Duration,
}

impl PayloadService {
    pub fn new(
        provider: Arc<dyn ConnectionProvider>,
        connect_timeout: Duration,
        query_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            connect_timeout,
            query_timeout,
        }
    }

    /// Acquires a connection and starts the query.
    ///
    /// Returns once the query has produced its first result, so acquisition
    /// and query-start failures surface here rather than mid-body.
    pub async fn open_stream(&self) -> AppResult<PayloadStream> {
        let conn = tokio::time::timeout(self.connect_timeout, self.provider.acquire())
            .await
            .map_err(|_| AppError::Timeout {
                operation: "connection acquisition",
                secs: self.connect_timeout.as_secs(),
            })??;

        let (tx, mut rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);
        tokio::spawn(pump_rows(conn, tx, self.query_timeout));

        let first = match rx.recv().await {
            Some(Ok(row)) => Some(row),
            Some(Err(e)) => return Err(e),
            None => None,
        };

        Ok(PayloadStream { first, rx })
    }
}

/// A started payload query.
pub struct PayloadStream {
    first: Option<PayloadRow>,
    rx: mpsc::Receiver<AppResult<PayloadRow>>,
}

impl PayloadStream {
    /// Preamble, then one line per row. A failure after the first row ends
    /// the body early; the status line has already gone out by then.
    pub fn into_body(self) -> Body {
        let head = stream::iter(
            std::iter::once(Bytes::from_static(PAYLOAD_PREAMBLE.as_bytes()))
                .chain(self.first.map(|row| Bytes::from(row.to_line())))
                .map(Ok::<_, AppError>),
        );
        let rest = ReceiverStream::new(self.rx).map(|item| item.map(|row| Bytes::from(row.to_line())));

        Body::from_stream(head.chain(rest))
    }
}

/// Owns the connection for the lifetime of the query and closes it on every
/// exit: end of rows, query error, timeout, or the receiver going away.
async fn pump_rows(
    mut conn: Box<dyn PayloadConnection>,
    tx: mpsc::Sender<AppResult<PayloadRow>>,
    query_timeout: Duration,
) {
    let deadline = Instant::now() + query_timeout;
    let mut sent = 0usize;

    {
        let mut rows = conn.rows();
        loop {
            let item = match tokio::time::timeout_at(deadline, rows.next()).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => Err(AppError::Timeout {
                    operation: "payload query",
                    secs: query_timeout.as_secs(),
                }),
            };

            let failed = item.is_err();
            if let Err(e) = &item {
                tracing::warn!(error = %e, rows = sent, "Payload query aborted");
            }
            if tx.send(item).await.is_err() {
                tracing::debug!(rows = sent, "Client went away, stopping query");
                break;
            }
            if failed {
                break;
            }
            sent += 1;
        }
    }

    match conn.close().await {
        Ok(()) => tracing::debug!(rows = sent, "Payload query finished, connection closed"),
        Err(e) => tracing::warn!(error = %e, "Closing database connection failed"),
    }
}

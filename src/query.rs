//! The `Query` collaborator: SQL text, bind parameters, and the channels
//! through which the engine streams results back to the consumer.
//!
//! A query is built with [`Query::simple`] or [`Query::new`] and handed to
//! the engine; the matching [`QueryHandle`] stays with the caller and
//! yields rows, the row description, and the completion result. COPY IN
//! queries attach a byte source; row-hungry consumers attach a
//! flow-control signal channel to pause and resume socket reads.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::Error;
use crate::messages::backend::RowDescription;

/// Which frontend message sequence the engine emits for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryKind {
    /// One `Query` message.
    Simple,
    /// Parse / Bind / Describe / Execute / Close / Sync.
    Extended,
}

/// One decoded result row, column values in text format.
#[derive(Debug, Clone)]
pub struct Row {
    description: Arc<RowDescription>,
    values: Vec<Option<String>>,
}

impl Row {
    pub(crate) fn new(description: Arc<RowDescription>, values: Vec<Option<String>>) -> Self {
        Row { description, values }
    }

    /// Wraps one COPY data chunk as a single-column row.
    pub(crate) fn copy_chunk(text: String) -> Self {
        Row {
            description: Arc::new(RowDescription::default()),
            values: vec![Some(text)],
        }
    }

    /// The value at `index`, or `None` for SQL NULL or out of range.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(|v| v.as_deref())
    }

    /// The value of the named column.
    pub fn get_by_name(&self, name: &str) -> Option<&str> {
        self.description.column(name).and_then(|i| self.get(i))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn description(&self) -> &RowDescription {
        &self.description
    }
}

/// A query as the engine consumes it.
pub struct Query {
    pub(crate) sql: String,
    pub(crate) params: Vec<Option<String>>,
    pub(crate) kind: QueryKind,
    pub(crate) row_sink: mpsc::UnboundedSender<Row>,
    pub(crate) description: watch::Sender<Option<Arc<RowDescription>>>,
    pub(crate) completed: oneshot::Sender<Result<String, Error>>,
    pub(crate) ready_to_stream: oneshot::Sender<()>,
    pub(crate) input: Option<mpsc::Receiver<Bytes>>,
    pub(crate) flow_control: Option<mpsc::Receiver<bool>>,
}

impl Query {
    /// Builds a simple-protocol query.
    pub fn simple(sql: impl Into<String>) -> (Query, QueryHandle) {
        Self::build(sql.into(), Vec::new(), QueryKind::Simple)
    }

    /// Builds an extended-protocol query with text-format bind
    /// parameters (`None` binds SQL NULL).
    pub fn new(sql: impl Into<String>, params: Vec<Option<String>>) -> (Query, QueryHandle) {
        Self::build(sql.into(), params, QueryKind::Extended)
    }

    fn build(sql: String, params: Vec<Option<String>>, kind: QueryKind) -> (Query, QueryHandle) {
        let (row_tx, row_rx) = mpsc::unbounded_channel();
        let (desc_tx, desc_rx) = watch::channel(None);
        let (done_tx, done_rx) = oneshot::channel();
        let (stream_tx, stream_rx) = oneshot::channel();

        let query = Query {
            sql,
            params,
            kind,
            row_sink: row_tx,
            description: desc_tx,
            completed: done_tx,
            ready_to_stream: stream_tx,
            input: None,
            flow_control: None,
        };
        let handle = QueryHandle {
            rows: RowStream { inner: row_rx },
            description: desc_rx,
            completed: Some(done_rx),
            ready_to_stream: Some(stream_rx),
        };
        (query, handle)
    }

    /// Attaches a COPY IN payload source. The engine defers `Close`/`Sync`
    /// until this source is exhausted.
    pub fn with_copy_in(mut self, source: mpsc::Receiver<Bytes>) -> Self {
        self.input = Some(source);
        self
    }

    /// Attaches a flow-control signal source: `true` resumes socket
    /// reads, `false` pauses them.
    pub fn with_flow_control(mut self, signals: mpsc::Receiver<bool>) -> Self {
        self.flow_control = Some(signals);
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// The consumer side of a [`Query`].
#[derive(Debug)]
pub struct QueryHandle {
    rows: RowStream,
    description: watch::Receiver<Option<Arc<RowDescription>>>,
    completed: Option<oneshot::Receiver<Result<String, Error>>>,
    ready_to_stream: Option<oneshot::Receiver<()>>,
}

impl QueryHandle {
    /// The next streamed row, or `None` once the engine finished the
    /// row sink.
    pub async fn next_row(&mut self) -> Option<Row> {
        self.rows.next().await
    }

    /// The row stream, for `futures::Stream` composition.
    pub fn rows(&mut self) -> &mut RowStream {
        &mut self.rows
    }

    /// Waits for the row description attached by the engine. Returns
    /// `None` when the query completes without producing one.
    pub async fn row_description(&mut self) -> Option<Arc<RowDescription>> {
        loop {
            if let Some(desc) = self.description.borrow().clone() {
                return Some(desc);
            }
            if self.description.changed().await.is_err() {
                return self.description.borrow().clone();
            }
        }
    }

    /// Resolves when the query completes: the command tag on success,
    /// the query failure otherwise. Waiting twice reports
    /// [`Error::Disconnected`].
    pub async fn completed(&mut self) -> Result<String, Error> {
        match self.completed.take() {
            Some(rx) => rx.await.unwrap_or(Err(Error::Disconnected)),
            None => Err(Error::Disconnected),
        }
    }

    /// For COPY IN queries: resolves when the server is ready for the
    /// payload stream.
    pub async fn ready_to_stream(&mut self) -> Result<(), Error> {
        match self.ready_to_stream.take() {
            Some(rx) => rx.await.map_err(|_| Error::Disconnected),
            None => Err(Error::Disconnected),
        }
    }
}

/// Stream of result rows.
#[derive(Debug)]
pub struct RowStream {
    inner: mpsc::UnboundedReceiver<Row>,
}

impl RowStream {
    pub async fn next(&mut self) -> Option<Row> {
        self.inner.recv().await
    }
}

impl futures::Stream for RowStream {
    type Item = Row;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::backend::FieldDescription;

    fn one_column_description(name: &str) -> Arc<RowDescription> {
        Arc::new(RowDescription {
            fields: vec![FieldDescription {
                name: name.to_string(),
                table_oid: 0,
                column_id: 0,
                type_oid: 25,
                type_len: -1,
                type_modifier: -1,
                format: 0,
            }],
        })
    }

    #[tokio::test]
    async fn rows_flow_from_engine_side_to_handle() {
        let (query, mut handle) = Query::simple("SELECT 1 AS value");
        let desc = one_column_description("value");

        query.description.send_replace(Some(desc.clone()));
        query
            .row_sink
            .send(Row::new(desc, vec![Some("1".to_string())]))
            .unwrap();
        drop(query.row_sink);
        query.completed.send(Ok("SELECT 1".to_string())).ok();

        let row = handle.next_row().await.unwrap();
        assert_eq!(row.get(0), Some("1"));
        assert_eq!(row.get_by_name("value"), Some("1"));
        assert_eq!(row.get_by_name("missing"), None);
        assert!(handle.next_row().await.is_none());
        assert_eq!(handle.completed().await.unwrap(), "SELECT 1");
    }

    #[tokio::test]
    async fn dropped_engine_side_fails_completion() {
        let (query, mut handle) = Query::new("SELECT $1", vec![Some("x".to_string())]);
        drop(query);
        assert!(matches!(
            handle.completed().await,
            Err(Error::Disconnected)
        ));
    }

    #[tokio::test]
    async fn null_values_read_as_none() {
        let desc = one_column_description("v");
        let row = Row::new(desc, vec![None]);
        assert_eq!(row.get(0), None);
        assert_eq!(row.len(), 1);
    }
}

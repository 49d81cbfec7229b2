//! Record-batch stream abstractions.

use std::pin::Pin;
use std::task::{Context, Poll};

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use futures::Stream;
use strata_common::Result;

/// A stream of RecordBatches that also knows its output schema.
pub trait RecordBatchStream: Stream<Item = Result<RecordBatch>> + Send {
    /// Output schema for every batch yielded by this stream.
    fn schema(&self) -> SchemaRef;
}

/// The stream type returned by [`ExecNode::execute`](crate::exec_node::ExecNode::execute).
pub type SendableRecordBatchStream = Pin<Box<dyn RecordBatchStream>>;

/// Adapter that attaches a schema to any `Stream<Item = Result<RecordBatch>>`.
pub struct StreamAdapter<S> {
    schema: SchemaRef,
    inner: S,
}

impl<S> StreamAdapter<S> {
    /// Create a new schema-attached stream adapter.
    pub fn new(schema: SchemaRef, inner: S) -> Self {
        Self { schema, inner }
    }
}

impl<S> RecordBatchStream for StreamAdapter<S>
where
    S: Stream<Item = Result<RecordBatch>> + Send + Unpin + 'static,
{
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

impl<S> Stream for StreamAdapter<S>
where
    S: Stream<Item = Result<RecordBatch>> + Unpin,
{
    type Item = Result<RecordBatch>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Array, Int64Array};
    use arrow_schema::{DataType, Field, Schema};
    use futures::StreamExt;

    use super::*;

    #[test]
    fn adapter_keeps_schema_and_order() {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, false)]));
        let batches = (0..3)
            .map(|i| {
                RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(vec![i]))])
                    .expect("batch")
            })
            .collect::<Vec<_>>();
        let inner = futures::stream::iter(batches.into_iter().map(Ok));
        let stream: SendableRecordBatchStream = Box::pin(StreamAdapter::new(schema.clone(), inner));
        assert_eq!(stream.schema(), schema);
        let out = futures::executor::block_on(stream.collect::<Vec<_>>());
        let firsts = out
            .into_iter()
            .map(|b| b.expect("batch").column(0).as_any().downcast_ref::<Int64Array>().expect("int64").value(0))
            .collect::<Vec<_>>();
        assert_eq!(firsts, [0, 1, 2]);
    }
}

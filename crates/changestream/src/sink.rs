use async_trait::async_trait;

use crate::record::ReadResult;

/// Error returned by a sink to abort the whole read.
///
/// `eyre::Report` and most error types convert into it with `?` or `.into()`.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Receives every decoded row of every partition.
///
/// Called concurrently from all running partitions; within one partition calls
/// arrive in stream order. Returning an error cancels the read, and results
/// already delivered by other partitions are not retracted.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn on_result(&self, result: ReadResult) -> Result<(), SinkError>;
}

#[async_trait]
impl<F> ResultSink for F
where
    F: Fn(ReadResult) -> Result<(), SinkError> + Send + Sync,
{
    async fn on_result(&self, result: ReadResult) -> Result<(), SinkError> {
        self(result)
    }
}

use std::io::{stdout, Write};
use std::sync::Arc;

use calimero_changestream::{
    CancellationToken, ReadResult, Reader, ReaderConfig, ReplayExecutor, SinkError,
};
use camino::Utf8PathBuf;
use clap::Parser;
use eyre::{Result as EyreResult, WrapErr};
use parking_lot::Mutex;
use tokio::signal;
use tracing::{info, warn};

use crate::cli::RootArgs;

/// Read recorded partitions and print every result as a JSON line
#[derive(Debug, Parser)]
pub struct ReplayCommand {
    /// Directory holding `root.jsonl` and `partitions/<token>.jsonl` recordings
    #[arg(long, value_name = "PATH")]
    pub rows: Utf8PathBuf,
}

impl ReplayCommand {
    pub async fn run(self, root_args: &RootArgs) -> EyreResult<()> {
        let cancellation = CancellationToken::new();
        let _ignored = tokio::spawn({
            let cancellation = cancellation.clone();
            async move {
                if signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling read");
                    cancellation.cancel();
                }
            }
        });

        let _delivered = self
            .replay(root_args, &cancellation, Arc::new(Mutex::new(stdout())))
            .await?;

        Ok(())
    }

    /// Runs the read, writing one JSON line per result; returns the result count.
    async fn replay<W>(
        self,
        root_args: &RootArgs,
        cancellation: &CancellationToken,
        output: Arc<Mutex<W>>,
    ) -> EyreResult<usize>
    where
        W: Write + Send + 'static,
    {
        let config = ReaderConfig::load(&root_args.home)?;
        let reader = Reader::new(&config, ReplayExecutor::new(self.rows))?;

        let delivered = Arc::new(Mutex::new(0_usize));
        let counter = Arc::clone(&delivered);

        reader
            .read(cancellation, move |result: ReadResult| -> Result<(), SinkError> {
                let line = serde_json::to_string(&result)?;
                writeln!(output.lock(), "{line}")?;
                *counter.lock() += 1;
                Ok(())
            })
            .await
            .wrap_err("change stream read failed")?;

        let delivered = *delivered.lock();
        let stats = reader.registry_stats();
        info!(
            results = delivered,
            partitions = stats.finished,
            "Replay complete"
        );

        Ok(delivered)
    }
}

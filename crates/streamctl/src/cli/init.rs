use core::time::Duration;
use std::fs::create_dir_all;

use calimero_changestream::{Dialect, ReaderConfig, Timestamp};
use clap::Parser;
use eyre::{bail, Result as EyreResult, WrapErr};
use tracing::info;

use crate::cli::RootArgs;

/// Write a reader configuration
#[derive(Debug, Parser)]
pub struct InitCommand {
    /// Name of the change stream
    #[arg(long, value_name = "NAME")]
    pub stream_id: String,

    /// SQL dialect of the database
    #[arg(long, default_value = "googlesql")]
    pub dialect: String,

    /// First commit timestamp to read (RFC 3339); defaults to now
    #[arg(long, value_name = "TIMESTAMP")]
    pub start: Option<Timestamp>,

    /// Last commit timestamp to read (RFC 3339); reads forever when unset
    #[arg(long, value_name = "TIMESTAMP")]
    pub end: Option<Timestamp>,

    /// Heartbeat interval in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 10_000)]
    pub heartbeat_ms: u64,

    /// Overwrite an existing configuration
    #[arg(long)]
    pub force: bool,
}

impl InitCommand {
    pub fn run(self, root_args: &RootArgs) -> EyreResult<()> {
        let dir = &root_args.home;

        if ReaderConfig::exists(dir) && !self.force {
            bail!("configuration already exists in {dir:?}, pass --force to overwrite");
        }

        let dialect: Dialect = self.dialect.parse()?;

        let mut config = ReaderConfig::new(self.stream_id)
            .with_dialect(dialect)
            .with_heartbeat_interval(Duration::from_millis(self.heartbeat_ms));
        config.start_timestamp = self.start;
        config.end_timestamp = self.end;

        create_dir_all(dir).wrap_err_with(|| format!("failed to create directory {dir:?}"))?;
        config.save(dir)?;

        info!(%dir, stream_id = %config.stream_id, %dialect, "Initialized reader configuration");

        Ok(())
    }
}

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use const_format::concatcp;
use eyre::Result as EyreResult;

use crate::defaults;

mod init;
mod replay;

use init::InitCommand;
use replay::ReplayCommand;

pub const EXAMPLES: &str = r"
  # Write a configuration for the Orders change stream
  $ streamctl --home data/ init --stream-id Orders --dialect postgresql

  # Traverse recorded partitions, printing every result as JSON
  $ streamctl --home data/ replay --rows recordings/orders/
";

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
#[command(after_help = concatcp!(
    "Environment variables:\n",
    "  STREAMCTL_HOME    Directory holding changestream.toml\n\n",
    "Examples:",
    EXAMPLES
))]
pub struct RootCommand {
    #[command(flatten)]
    pub args: RootArgs,

    #[command(subcommand)]
    pub action: SubCommands,
}

#[derive(Debug, Subcommand)]
pub enum SubCommands {
    Init(InitCommand),
    Replay(ReplayCommand),
}

#[derive(Debug, Parser)]
pub struct RootArgs {
    /// Directory for the reader configuration
    #[arg(long, value_name = "PATH", default_value_t = defaults::default_home_dir())]
    #[arg(env = "STREAMCTL_HOME", hide_env_values = true)]
    pub home: Utf8PathBuf,
}

impl RootCommand {
    pub async fn run(self) -> EyreResult<()> {
        match self.action {
            SubCommands::Init(init) => init.run(&self.args),
            SubCommands::Replay(replay) => replay.run(&self.args).await,
        }
    }
}

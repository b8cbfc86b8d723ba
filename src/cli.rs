use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "spotils", version)]
#[command(about = "Keeps Spotify mirror playlists in sync with your library")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Keep every enabled task on its schedule until Ctrl-C (default)
    Run,
    /// Run one cycle of every enabled task
    Sync,
    /// Forget a job's snapshot so its next cycle starts from scratch
    Reset {
        /// Job name from the config file
        job: String,
    },
    /// Show recently played tracks, newest first
    Recent {
        /// Number of tracks to show
        #[arg(short, long, default_value_t = 50, value_parser = clap::value_parser!(u32).range(1..=50))]
        limit: u32,
    },
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command.unwrap_or(Command::Run)
    }
}

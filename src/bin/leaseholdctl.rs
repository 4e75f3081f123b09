//! Leasehold administration CLI.
//!
//! `leaseholdctl` lets operators inspect and repair the schedule records that
//! workers coordinate through, directly against the configured store.

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use leasehold::ctl::{self, GlobalOptions};

#[derive(Parser, Debug)]
#[command(name = "leaseholdctl")]
#[command(about = "Administration CLI for leasehold schedule records")]
#[command(version)]
struct Args {
    /// Worker configuration file (TOML) naming the store
    #[arg(long, short = 'c', global = true, env = "LEASEHOLD_CONFIG")]
    config: Option<PathBuf>,

    /// Key prefix of the deployment, overriding scheduler.key_prefix
    #[arg(long, short = 'p', global = true)]
    prefix: Option<String>,

    /// Output in JSON format instead of human-readable tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

impl Args {
    fn to_global_options(&self) -> GlobalOptions {
        GlobalOptions {
            config: self.config.clone(),
            key_prefix: self.prefix.clone(),
            json: self.json,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Schedule record operations
    Schedules {
        #[command(subcommand)]
        action: SchedulesAction,
    },
}

#[derive(Subcommand, Debug)]
enum SchedulesAction {
    /// List all schedule records
    List,
    /// Show one schedule record
    Show {
        /// Job name
        job: String,
    },
    /// Clear the lease on a schedule, letting any worker acquire it
    ClearLease {
        /// Job name
        job: String,
    },
    /// Change the trigger interval of a schedule
    SetInterval {
        /// Job name
        job: String,
        /// New trigger interval in milliseconds
        interval_ms: i64,
    },
    /// Delete a schedule record
    Remove {
        /// Job name
        job: String,
    },
}

async fn run(args: Args) -> anyhow::Result<()> {
    let opts = args.to_global_options();
    let config = ctl::load_config(&opts)?;
    leasehold::trace::init(config.log_format)?;
    let admin = ctl::open_admin(&opts, &config)?;
    let mut stdout = io::stdout();

    match &args.command {
        Command::Schedules { action } => match action {
            SchedulesAction::List => ctl::schedules_list(&admin, &opts, &mut stdout).await,
            SchedulesAction::Show { job } => {
                ctl::schedules_show(&admin, &opts, &mut stdout, job).await
            }
            SchedulesAction::ClearLease { job } => {
                ctl::schedules_clear_lease(&admin, &opts, &mut stdout, job).await
            }
            SchedulesAction::SetInterval { job, interval_ms } => {
                ctl::schedules_set_interval(&admin, &opts, &mut stdout, job, *interval_ms).await
            }
            SchedulesAction::Remove { job } => {
                ctl::schedules_remove(&admin, &opts, &mut stdout, job).await
            }
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

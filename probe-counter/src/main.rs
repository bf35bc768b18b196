use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use env_logger::Env;

use probe_counter_common::TABLE_CAPACITY;

mod ebpf_loader;
mod metrics;

#[derive(Parser)]
#[command(name = "probe-counter")]
#[command(about = "Kernel event counter", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the eBPF object, attach every hook point and report counters until Ctrl+C
    Attach(AttachCommand),
    /// Print the counter tables pinned by a running `attach` as JSON
    Dump(DumpCommand),
}

#[derive(Args)]
struct AttachCommand {
    /// Directory the counter tables are pinned under
    #[arg(long, value_name = "DIR", default_value = ebpf_loader::DEFAULT_PIN_DIR)]
    pin_dir: PathBuf,
    /// Keep the counter tables private to this process
    #[arg(long = "no-pin", action = ArgAction::SetTrue)]
    disable_pin: bool,
    /// Entries provisioned for each counter table
    #[arg(long, value_name = "COUNT", default_value_t = TABLE_CAPACITY)]
    map_entries: u32,
    /// Seconds between counter reports
    #[arg(long, default_value_t = 5)]
    report_interval_secs: u64,
}

#[derive(Args)]
struct DumpCommand {
    /// Directory the counter tables were pinned under
    #[arg(long, value_name = "DIR", default_value = ebpf_loader::DEFAULT_PIN_DIR)]
    pin_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if let Err(err) = run().await {
        eprintln!("probe-counter error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Attach(cmd)) => {
            let opts = ebpf_loader::AttachOptions {
                pin_dir: (!cmd.disable_pin).then_some(cmd.pin_dir),
                map_entries: cmd.map_entries,
                report_interval: Duration::from_secs(cmd.report_interval_secs.max(1)),
            };
            ebpf_loader::attach_hooks(opts).await?;
        }
        Some(Commands::Dump(cmd)) => {
            let value = ebpf_loader::dump_pinned(&cmd.pin_dir)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use warden::clock::SystemClock;
use warden::config::Config;
use warden::driver::channel_from_config;
use warden::inbox::parse;
use warden::monitor::HealthSummary;
use warden::notice::Notices;
use warden::tasks::TaskBook;
use warden::{wlog, wlog_error, Result, Scheduler};

/// Warden - coordinates externally driven worker sessions
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    WARDEN_DEBUG=1          Enable debug logging (alternative to --debug)\n    WARDEN_LOG_LEVEL=trace  Log level: error, warn, info, debug or trace")]
pub struct Cli {
    /// Config file (default: ~/.warden/warden.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging (writes to ~/.warden/warden.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the coordination loop until Ctrl-C
    Run,

    /// Print the last written health summary
    Status,

    /// Print the task book
    Tasks {
        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Parse a worker response and print the payload
    Parse {
        /// File to parse (stdin if omitted)
        file: Option<PathBuf>,
    },

    /// Load and validate the configuration
    CheckConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    warden::log::init_with_debug(cli.debug);

    match cli.command {
        Command::Run => run_loop(cli.config),
        Command::Status => run_status(cli.config),
        Command::Tasks { json } => run_tasks(cli.config, json),
        Command::Parse { file } => run_parse(file),
        Command::CheckConfig => run_check_config(cli.config),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let config = match path {
        Some(p) => Config::load_from(&p)?,
        None => Config::load()?,
    };
    config.validate()?;
    Ok(config)
}

fn run_loop(path: Option<PathBuf>) -> Result<()> {
    let config = load_config(path)?;
    if warden::log::is_debug() {
        wlog!("Warden starting (debug mode enabled)");
    } else {
        wlog!("Warden starting");
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let channel = channel_from_config(&config.driver);
        let notices = Notices::standard(config.notices_path());
        let scheduler = Scheduler::new(config, Arc::new(SystemClock), channel, notices)?;

        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_signal.cancel();
            }
        });

        println!("warden running; Ctrl-C to stop");
        let result = scheduler.run(cancel).await;
        if let Err(e) = &result {
            wlog_error!("Warden stopped with error: {}", e);
        }
        result
    })
}

fn run_status(path: Option<PathBuf>) -> Result<()> {
    let config = load_config(path)?;
    match HealthSummary::load(&config.status_path())? {
        Some(summary) => print!("{}", summary.render()),
        None => println!("No status yet. Is `warden run` running?"),
    }
    Ok(())
}

fn run_tasks(path: Option<PathBuf>, json: bool) -> Result<()> {
    let config = load_config(path)?;
    let book = TaskBook::load(&config.tasks_path())?;
    if json {
        println!("{}", serde_json::to_string_pretty(&book)?);
        return Ok(());
    }
    if book.tasks.is_empty() {
        println!("No tasks recorded");
        return Ok(());
    }
    println!("{:<24} {:<12} {:<12} {:>8}  verified", "TASK", "STATE", "OWNER", "EVIDENCE");
    for task in book.tasks.values() {
        println!(
            "{:<24} {:<12} {:<12} {:>8}  {}",
            task.id,
            task.state.as_str(),
            task.owner.as_str(),
            task.evidence.len(),
            task.verified_at
                .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

fn run_parse(file: Option<PathBuf>) -> Result<()> {
    let text = match file {
        Some(p) => String::from_utf8_lossy(&std::fs::read(p)?).into_owned(),
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            String::from_utf8_lossy(&buf).into_owned()
        }
    };
    println!("{}", serde_json::to_string_pretty(&parse(&text))?);
    Ok(())
}

fn run_check_config(path: Option<PathBuf>) -> Result<()> {
    let config = load_config(path)?;
    println!(
        "config ok: {} workers, tick {}s, thresholds {}/{}/{}s",
        config.workers.len(),
        config.scheduler.tick_secs,
        config.activity.normal_secs,
        config.activity.warn_secs,
        config.activity.stall_secs
    );
    Ok(())
}

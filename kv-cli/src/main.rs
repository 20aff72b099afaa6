use std::io::{stdin, IsTerminal};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{env, panic};

use anyhow::Result;
use clap::Parser;
use log::info;

use meshkv_cli::config::ConfigLoad;
use meshkv_cli::session::Session;
use meshkv_cli::trace;

#[derive(Debug, Parser)]
#[command(version, author, about = "Node runner and interactive client for meshkv")]
pub struct Args {
    /// Configuration file path, holding node id, listen address, peers and
    /// cache tuning.
    #[clap(short = 'c', long = "config", default_value = "config/meshkv.toml")]
    config: PathBuf,

    /// Join an already-running cluster instead of founding a new one.
    #[clap(long)]
    join: bool,

    #[clap(short, long)]
    debug: bool,

    #[clap(long = "quiet", short = 'q')]
    quiet: bool,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,

    #[clap(short = 'n', long, help = "Force non-interactive mode")]
    non_interactive: bool,

    /// A single command to run non-interactively, e.g. `"GET order_key"`.
    #[clap(long)]
    query: Option<String>,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    setup_panic_hooks();

    eprintln!();
    eprintln!("██  ██  █        █");
    eprintln!("██ ██   ██      ██");
    eprintln!("███      ██    ██");
    eprintln!("██ ██     ██  ██");
    eprintln!("██  ██     ████  meshkv CLI");
    eprintln!();

    let args = Args::parse();
    if args.debug {
        println!("{args:?}");
    }

    let log_dir = format!("{}/.meshkv", env::var("HOME").unwrap_or_else(|_| ".".to_string()));
    let _guards = trace::init_logging(&log_dir, &args.log_level).await?;
    info!("meshkv cli starting with args: {args:?}");

    let mut cfg: ConfigLoad = confy::load_path(&args.config).unwrap_or_else(|e| {
        eprintln!("could not load {}: {e}, using defaults", args.config.display());
        ConfigLoad::default()
    });
    if args.debug {
        println!("{cfg:?}");
        eprintln!();
    }
    info!("meshkv cli starting with config: {cfg:?}");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("received Ctrl+C!");
        r.store(false, Ordering::SeqCst);
    })
    .expect("error setting Ctrl-C handler");

    let is_terminal = stdin().is_terminal();
    let is_repl = is_terminal && !args.non_interactive && args.query.is_none();
    if is_repl {
        cfg.terminal_update();
    }

    let mut session = Session::try_new(cfg, is_repl, running.clone(), args.join).await?;

    if is_repl {
        session.handle_repl().await;
        return Ok(());
    }

    match args.query {
        None => session.handle_reader(stdin().lock()).await?,
        Some(query) => session.handle_reader(std::io::Cursor::new(query)).await?,
    }

    Ok(())
}

fn setup_panic_hooks() {
    let meta = human_panic::Metadata {
        version: env!("CARGO_PKG_VERSION").into(),
        name: env!("CARGO_PKG_NAME").into(),
        authors: env!("CARGO_PKG_AUTHORS").replace(':', ", ").into(),
        homepage: env!("CARGO_PKG_HOMEPAGE").into(),
    };

    let default_hook = panic::take_hook();

    if env::var("RUST_BACKTRACE").is_err() {
        panic::set_hook(Box::new(move |info: &panic::PanicInfo| {
            default_hook(info);
            let file_path = human_panic::handle_dump(&meta, info);
            human_panic::print_msg(file_path, &meta).expect("human-panic: printing error message to console failed");
        }));
    }
}

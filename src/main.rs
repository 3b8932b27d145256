//! Command-line client for the engine's TCP command server.
//!
//! Modes:
//! - `repl`: connect to a running engine and send commands interactively
//! - `exec`: send one command and print the decoded reply
//! - `start`: launch the engine, then drop into the REPL

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use fimmlink::{DecodedValue, LinkConfig, Session, TemplateValue};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const PROMPT: &str = "COMMAND: ";

#[derive(Parser)]
#[command(name = "fimmlink", version, about = "Engine command client")]
struct Cli {
    #[command(flatten)]
    link: LinkArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to a running engine and read commands from stdin
    Repl(ConnectArgs),
    /// Send a single command and print the reply
    Exec(ExecArgs),
    /// Launch the engine executable, then start the REPL
    Start(StartArgs),
}

/// Transfer tunables; each flag overrides the config file.
#[derive(Args)]
struct LinkArgs {
    /// JSON file with connection settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Connection attempts before giving up
    #[arg(long, global = true)]
    connect_attempts: Option<u32>,
    /// Maximum bytes requested per read
    #[arg(long, global = true)]
    max_chunk_size: Option<usize>,
    /// Pause between reply chunks in milliseconds
    #[arg(long, global = true)]
    chunk_delay_ms: Option<u64>,
    /// Socket read timeout in milliseconds
    #[arg(long, global = true)]
    read_timeout_ms: Option<u64>,
}

impl LinkArgs {
    fn resolve(&self) -> anyhow::Result<LinkConfig> {
        let mut config = match &self.config {
            Some(path) => LinkConfig::from_json_file(path)?,
            None => LinkConfig::default(),
        };
        if let Some(attempts) = self.connect_attempts {
            config = config.with_connect_attempts(attempts);
        }
        if let Some(size) = self.max_chunk_size {
            config = config.with_max_chunk_size(size);
        }
        if let Some(ms) = self.chunk_delay_ms {
            config = config.with_chunk_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = self.read_timeout_ms {
            config = config.with_read_timeout(Some(Duration::from_millis(ms)));
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args)]
struct ConnectArgs {
    /// Engine host
    #[arg(long, default_value = "localhost")]
    host: String,
    /// Engine port
    #[arg(long, default_value_t = fimmlink::config::DEFAULT_PORT)]
    port: u16,
}

#[derive(Args)]
struct ExecArgs {
    #[command(flatten)]
    connect: ConnectArgs,
    /// Command template, e.g. "app.subnodes[{%}].nodename()"
    command: String,
    /// Positional values for `%` placeholders, in order
    #[arg(long = "value", short = 'v')]
    values: Vec<String>,
    /// Print the decoded reply as JSON
    #[arg(long)]
    json: bool,
    /// Remove the leading unused slot from 1-based arrays
    #[arg(long)]
    strip: bool,
}

#[derive(Args)]
struct StartArgs {
    /// Path to the engine executable
    #[arg(long)]
    exe: PathBuf,
    /// Port the engine should serve on
    #[arg(long, default_value_t = fimmlink::config::DEFAULT_PORT)]
    port: u16,
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries replies.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fimmlink=info")))
        .init();

    let cli = Cli::parse();
    let config = cli.link.resolve()?;
    match cli.command {
        Command::Repl(args) => run_repl(config, args),
        Command::Exec(args) => run_exec(config, args),
        Command::Start(args) => run_start(config, args),
    }
}

fn run_repl(config: LinkConfig, args: ConnectArgs) -> anyhow::Result<()> {
    let mut session = Session::new(config);
    let report = session
        .connect(&args.host, args.port)
        .with_context(|| format!("connecting to {}:{}", args.host, args.port))?;
    print!("{}", report.notes());
    interact(&mut session)
}

fn run_start(config: LinkConfig, args: StartArgs) -> anyhow::Result<()> {
    let mut session = Session::new(config);
    let report = session
        .start_app(&args.exe, args.port)
        .with_context(|| format!("starting {}", args.exe.display()))?;
    print!("{}", report.notes());
    interact(&mut session)
}

fn run_exec(config: LinkConfig, args: ExecArgs) -> anyhow::Result<()> {
    let values: Vec<TemplateValue> = args.values.iter().map(|v| parse_value(v)).collect();
    let mut session = Session::new(config);
    session
        .connect(&args.connect.host, args.connect.port)
        .with_context(|| format!("connecting to {}:{}", args.connect.host, args.connect.port))?;

    let reply = session.execute_with_report(&args.command, &values)?;
    if !reply.is_complete() {
        warn!(integrity = ?reply.integrity, "Reply was truncated");
    }
    let value = if args.strip {
        reply.value.stripped()
    } else {
        reply.value
    };
    print_value(&value, args.json)?;
    session.close();
    Ok(())
}

/// Read commands from stdin until `exit` or end of input.
fn interact(session: &mut Session) -> anyhow::Result<()> {
    let nodes = session.verify().context("engine did not answer")?;
    println!("Connected! ({} Project nodes found)", nodes);

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("{}", PROMPT);
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        if command == "exit" {
            break;
        }

        match session.execute(command, &[]) {
            Ok(value) => print_value(&value, false)?,
            Err(e) => {
                error!(error = %e, "Command failed");
                if !session.is_connected() {
                    return Err(e.into());
                }
            }
        }
    }

    info!("Closing session");
    session.close();
    Ok(())
}

fn print_value(value: &DecodedValue, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else if !value.is_empty() {
        println!("{}", value);
    }
    Ok(())
}

/// Integers stay integers, other numbers become reals, anything else is text.
fn parse_value(raw: &str) -> TemplateValue {
    if let Ok(v) = raw.parse::<i64>() {
        return TemplateValue::Int(v);
    }
    match raw.parse::<f64>() {
        Ok(v) => TemplateValue::Real(v),
        Err(_) => TemplateValue::Text(raw.to_string()),
    }
}

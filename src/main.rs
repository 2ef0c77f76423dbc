//! hoist - deploy applications from git onto this host
//!
//! Usage:
//!   hoist add <name> <repo> [branch] [subfolder]   Deploy a new application
//!   hoist update <name>                            Pull, rebuild and restart
//!   hoist remove <name>                            Stop and unregister
//!   hoist status [name]                            Show process state
//!   hoist autopull                                 Update apps as upstream moves

use anyhow::{Context, Result};
use hoist::autopull::Poller;
use hoist::backup::BackupInfo;
use hoist::config::Config;
use hoist::engine::Engine;
use hoist::error::DeployError;
use hoist::exec::Invocation;
use hoist::models::{AppRecord, SourceRef};
use std::collections::BTreeMap;
use std::env;
use std::io::{BufRead, Write};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

const DEFAULT_BRANCH: &str = "main";
const DEFAULT_LOG_LINES: usize = 100;
const USAGE_EXIT_CODE: i32 = 2;

#[derive(Debug, PartialEq)]
enum Command {
    Help,
    Version,
    Add(AddOptions),
    Remove(RemoveOptions),
    List,
    Status { name: Option<String> },
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    Update { name: String },
    Logs { name: String, lines: usize },
    Exec { name: String, argv: Vec<String> },
    Backup { name: String },
    Restore { name: String, backup_id: Option<String> },
    Backups { name: String },
    Autopull,
    Config(ConfigCommand),
}

#[derive(Debug, PartialEq)]
struct AddOptions {
    name: String,
    source: SourceRef,
    /// `Some(true)` for --restore, `Some(false)` for --no-restore, else ask
    restore: Option<bool>,
}

#[derive(Debug, PartialEq)]
struct RemoveOptions {
    name: String,
    purge: bool,
    yes: bool,
}

#[derive(Debug, PartialEq)]
enum ConfigCommand {
    Show { name: String },
    Set { name: String, vars: BTreeMap<String, String> },
    Unset { name: String, keys: Vec<String> },
}

/// A command line that could not be understood
#[derive(Debug)]
struct UsageError(String);

impl std::fmt::Display for UsageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for UsageError {}

fn usage(msg: impl Into<String>) -> anyhow::Error {
    UsageError(msg.into()).into()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hoist=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match run() {
        Ok(code) => code,
        Err(e) => report(&e),
    };
    std::process::exit(code);
}

/// Print `error[<KIND>]: <message>` and pick the exit code
fn report(e: &anyhow::Error) -> i32 {
    if let Some(deploy) = e.downcast_ref::<DeployError>() {
        let kind = deploy.kind();
        eprintln!("error[{}]: {}", kind, deploy);
        return kind.exit_code();
    }
    if let Some(bad) = e.downcast_ref::<UsageError>() {
        eprintln!("error[USAGE]: {}", bad);
        eprintln!("Run `hoist help` for usage.");
        return USAGE_EXIT_CODE;
    }
    eprintln!("error[INTERNAL]: {:#}", e);
    1
}

fn run() -> Result<i32> {
    let args: Vec<String> = env::args().skip(1).collect();
    let command = parse_command(&args)?;

    match command {
        Command::Help => {
            print_help();
            return Ok(0);
        }
        Command::Version => {
            print_version();
            return Ok(0);
        }
        _ => {}
    }

    let config = Config::load_default().context("Failed to load configuration")?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;

    runtime.block_on(async move {
        let engine = Arc::new(Engine::open(config)?);
        dispatch(engine, command).await
    })
}

async fn dispatch(engine: Arc<Engine>, command: Command) -> Result<i32> {
    match command {
        Command::Help | Command::Version => {}
        Command::Add(opts) => handle_add(&engine, opts).await?,
        Command::Remove(opts) => handle_remove(&engine, opts).await?,
        Command::List => handle_list(&engine)?,
        Command::Status { name } => handle_status(&engine, name.as_deref()).await?,
        Command::Start { name } => {
            engine.start(&name).await?;
            println!("Started {}", name);
        }
        Command::Stop { name } => {
            engine.stop(&name).await?;
            println!("Stopped {}", name);
        }
        Command::Restart { name } => {
            engine.restart(&name).await?;
            println!("Restarted {}", name);
        }
        Command::Update { name } => {
            let app = engine.update(&name).await?;
            println!("Updated {} to {}", name, short_rev(app.revision.as_deref()));
        }
        Command::Logs { name, lines } => {
            print!("{}", engine.logs(&name, lines).await?);
        }
        Command::Exec { name, argv } => return Ok(engine.exec(&name, &argv).await?),
        Command::Backup { name } => {
            let backup = engine.backup(&name).await?;
            println!("Created backup {} ({})", backup.id, format_size(backup.size_bytes));
        }
        Command::Restore { name, backup_id } => {
            let app = engine.restore(&name, backup_id.as_deref()).await?;
            println!("Restored {} at {}", name, short_rev(app.revision.as_deref()));
            print_endpoints(&engine, &app);
        }
        Command::Backups { name } => handle_backups(&engine, &name)?,
        Command::Autopull => handle_autopull(engine).await?,
        Command::Config(cmd) => handle_config(&engine, cmd).await?,
    }
    Ok(0)
}

// ==================== Parsing ====================

fn parse_command(args: &[String]) -> Result<Command> {
    let Some(first) = args.first() else {
        return Ok(Command::Help);
    };
    let rest = &args[1..];

    let command = match first.as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "version" | "--version" | "-V" => Command::Version,
        "add" => parse_add_command(rest)?,
        "remove" | "rm" => parse_remove_command(rest)?,
        "list" | "ls" => Command::List,
        "status" => Command::Status {
            name: rest.first().cloned(),
        },
        "start" => Command::Start { name: required_name(rest)? },
        "stop" => Command::Stop { name: required_name(rest)? },
        "restart" => Command::Restart { name: required_name(rest)? },
        "update" => Command::Update { name: required_name(rest)? },
        "logs" => parse_logs_command(rest)?,
        "exec" => parse_exec_command(rest)?,
        "backup" => Command::Backup { name: required_name(rest)? },
        "restore" => Command::Restore {
            name: required_name(rest)?,
            backup_id: rest.get(1).cloned(),
        },
        "backups" => Command::Backups { name: required_name(rest)? },
        "autopull" => Command::Autopull,
        "config" => Command::Config(ConfigCommand::Show {
            name: required_name(rest)?,
        }),
        "config:set" => parse_config_set_command(rest)?,
        "config:unset" => {
            let name = required_name(rest)?;
            let keys = rest[1..].to_vec();
            if keys.is_empty() {
                return Err(usage("config:unset needs at least one KEY"));
            }
            Command::Config(ConfigCommand::Unset { name, keys })
        }
        other => return Err(usage(format!("unknown command '{}'", other))),
    };
    Ok(command)
}

fn required_name(args: &[String]) -> Result<String> {
    args.first()
        .filter(|a| !a.starts_with('-'))
        .cloned()
        .ok_or_else(|| usage("missing application name"))
}

fn parse_add_command(args: &[String]) -> Result<Command> {
    let mut restore = None;
    let mut positional = Vec::new();
    for arg in args {
        match arg.as_str() {
            "--restore" => restore = Some(true),
            "--no-restore" => restore = Some(false),
            flag if flag.starts_with("--") => {
                return Err(usage(format!("unknown flag '{}' for add", flag)))
            }
            _ => positional.push(arg.clone()),
        }
    }

    let (name, repo) = match positional.as_slice() {
        [name, repo, ..] => (name.clone(), repo.clone()),
        _ => return Err(usage("add needs <name> <repository>")),
    };
    if positional.len() > 4 {
        return Err(usage("add takes at most <name> <repository> [branch] [subfolder]"));
    }
    let branch = positional
        .get(2)
        .cloned()
        .unwrap_or_else(|| DEFAULT_BRANCH.to_string());
    let mut source = SourceRef::new(repo, branch);
    if let Some(sub) = positional.get(3) {
        source = source.with_subfolder(sub.as_str());
    }

    Ok(Command::Add(AddOptions {
        name,
        source,
        restore,
    }))
}

fn parse_remove_command(args: &[String]) -> Result<Command> {
    let name = args
        .iter()
        .find(|a| !a.starts_with('-'))
        .cloned()
        .ok_or_else(|| usage("missing application name"))?;
    Ok(Command::Remove(RemoveOptions {
        name,
        purge: args.iter().any(|a| a == "--purge"),
        yes: args.iter().any(|a| a == "-y" || a == "--yes"),
    }))
}

fn parse_logs_command(args: &[String]) -> Result<Command> {
    let name = required_name(args)?;
    let lines = match args.get(1) {
        Some(n) => n
            .parse()
            .map_err(|_| usage(format!("line count must be a number, got '{}'", n)))?,
        None => DEFAULT_LOG_LINES,
    };
    Ok(Command::Logs { name, lines })
}

fn parse_exec_command(args: &[String]) -> Result<Command> {
    let name = required_name(args)?;
    let mut argv = args[1..].to_vec();
    if argv.first().map(String::as_str) == Some("--") {
        argv.remove(0);
    }
    if argv.is_empty() {
        return Err(usage("exec needs a command to run"));
    }
    // A single quoted argument is a whole command line
    if let [line] = argv.as_slice() {
        if line.contains(char::is_whitespace) {
            let inv = Invocation::parse(line).map_err(|e| usage(format!("{:#}", e)))?;
            argv = std::iter::once(inv.program).chain(inv.args).collect();
        }
    }
    Ok(Command::Exec { name, argv })
}

fn parse_config_set_command(args: &[String]) -> Result<Command> {
    let name = required_name(args)?;
    let mut vars = BTreeMap::new();
    for pair in &args[1..] {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| usage(format!("expected KEY=VALUE, got '{}'", pair)))?;
        vars.insert(key.to_string(), value.to_string());
    }
    if vars.is_empty() {
        return Err(usage("config:set needs at least one KEY=VALUE"));
    }
    Ok(Command::Config(ConfigCommand::Set { name, vars }))
}

// ==================== Handlers ====================

async fn handle_add(engine: &Engine, opts: AddOptions) -> Result<()> {
    let mut restore_from = None;
    if opts.restore != Some(false) {
        if let Some(backup) = engine.latest_config_backup(&opts.name)? {
            let accept = match opts.restore {
                Some(yes) => yes,
                None => confirm(&format!(
                    "Found configuration of a previous '{}' from {}. Restore it? [y/N] ",
                    opts.name,
                    backup.created_at.format("%Y-%m-%d %H:%M:%S UTC")
                ))?,
            };
            if accept {
                restore_from = Some(backup.id);
            }
        } else if opts.restore == Some(true) {
            return Err(DeployError::BackupNotFound(format!(
                "no configuration backup for {}",
                opts.name
            ))
            .into());
        }
    }

    println!("Deploying {} from {} ({})", opts.name, opts.source.repository, opts.source.branch);
    let app = engine
        .add_with(&opts.name, opts.source, restore_from.as_deref())
        .await?;

    println!();
    println!("{} is live at revision {}", app.name, short_rev(app.revision.as_deref()));
    print_endpoints(engine, &app);
    Ok(())
}

async fn handle_remove(engine: &Engine, opts: RemoveOptions) -> Result<()> {
    engine.get(&opts.name)?;

    if !opts.yes {
        println!("This stops every process of '{}' and deletes its working tree.", opts.name);
        if opts.purge {
            println!("All backups of '{}' will be deleted as well.", opts.name);
        }
        let answer = prompt("Type the application name to confirm: ")?;
        if answer != opts.name {
            println!("Aborted.");
            return Ok(());
        }
    }

    engine.remove(&opts.name, opts.purge).await?;
    println!("Removed {}", opts.name);
    if !opts.purge {
        println!("Configuration kept; `hoist add {} ...` can restore it.", opts.name);
    }
    Ok(())
}

fn handle_list(engine: &Engine) -> Result<()> {
    let apps = engine.list()?;
    if apps.is_empty() {
        println!("No applications yet. Deploy one with: hoist add <name> <repository>");
        return Ok(());
    }

    println!("{:<24} {:<8} {:<10} {:<12} DEPLOYED", "NAME", "PORT", "REVISION", "PROCESSES");
    for app in apps {
        let port = app
            .primary_port()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let deployed = app
            .last_deployed_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<8} {:<10} {:<12} {}",
            app.name,
            port,
            short_rev(app.revision.as_deref()),
            app.processes.len(),
            deployed
        );
    }
    Ok(())
}

async fn handle_status(engine: &Engine, name: Option<&str>) -> Result<()> {
    let names: Vec<String> = match name {
        Some(name) => vec![name.to_string()],
        None => engine.list()?.into_iter().map(|a| a.name).collect(),
    };
    if names.is_empty() {
        println!("No applications.");
        return Ok(());
    }

    for name in names {
        let status = engine.status(&name).await?;
        println!(
            "{} ({}) revision {}",
            status.name,
            status.summary(),
            short_rev(status.revision.as_deref())
        );
        for p in &status.processes {
            let port = match (p.port, p.listening) {
                (Some(port), Some(true)) => format!("port {} listening", port),
                (Some(port), _) => format!("port {} not listening", port),
                (None, _) => "no port".to_string(),
            };
            let state = if p.running { "running" } else { "stopped" };
            println!("  {:<12} {:<8} {:<24} {}", p.process, state, port, p.unit);
        }
    }
    Ok(())
}

fn handle_backups(engine: &Engine, name: &str) -> Result<()> {
    let backups = engine.backups(name)?;
    if backups.is_empty() {
        println!("No backups for {}.", name);
        return Ok(());
    }
    println!("{:<28} {:<8} {:<10} SIZE", "ID", "KIND", "REVISION");
    for BackupInfo {
        id,
        kind,
        revision,
        size_bytes,
        ..
    } in backups
    {
        println!(
            "{:<28} {:<8} {:<10} {}",
            id,
            kind.to_string(),
            short_rev(revision.as_deref()),
            format_size(size_bytes)
        );
    }
    Ok(())
}

async fn handle_autopull(engine: Arc<Engine>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let interval = engine.config().autopull.interval();
    let poller = Poller::new(engine, interval, shutdown_rx);
    let task = tokio::spawn(poller.run());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Interrupt received, stopping autopull");
    let _ = shutdown_tx.send(true);
    task.await.context("Autopull task failed")?;
    Ok(())
}

async fn handle_config(engine: &Engine, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show { name } => {
            let overrides = engine.overrides(&name)?;
            if overrides.is_empty() {
                println!("No overrides for {}.", name);
            }
            for (key, value) in overrides {
                println!("{}={}", key, value);
            }
        }
        ConfigCommand::Set { name, vars } => {
            let keys: Vec<String> = vars.keys().cloned().collect();
            engine.set_overrides(&name, vars).await?;
            println!("Set {} on {} and restarted", keys.join(", "), name);
        }
        ConfigCommand::Unset { name, keys } => {
            engine.unset_overrides(&name, &keys).await?;
            println!("Unset {} on {} and restarted", keys.join(", "), name);
        }
    }
    Ok(())
}

// ==================== Output helpers ====================

fn print_endpoints(engine: &Engine, app: &AppRecord) {
    if let Some(port) = app.primary_port() {
        println!("  https://{}.{}", app.name, engine.config().proxy.base_domain);
        println!("  http://localhost:{}", port);
    }
    for p in &app.processes {
        match p.port {
            Some(port) => println!("  {:<12} {} (port {})", p.name, p.command, port),
            None => println!("  {:<12} {}", p.name, p.command),
        }
    }
}

fn short_rev(rev: Option<&str>) -> String {
    match rev {
        Some(r) => r.chars().take(8).collect(),
        None => "-".to_string(),
    }
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn prompt(question: &str) -> Result<String> {
    print!("{}", question);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn confirm(question: &str) -> Result<bool> {
    let answer = prompt(question)?;
    Ok(matches!(answer.to_lowercase().as_str(), "y" | "yes"))
}

fn print_help() {
    println!(
        r#"
hoist - deploy applications from git onto this host

USAGE:
    hoist <command> [options]

COMMANDS:
    add <name> <repo> [branch] [subfolder]
                             Clone, install and start a new application
        --restore            Re-apply the configuration of a removed app
        --no-restore         Never ask about earlier configuration
    update <name>            Pull, reinstall and restart (rolls back on failure)
    remove <name>            Stop and unregister an application
        --purge              Also delete its backups
        -y, --yes            Do not ask for confirmation
    list                     List applications
    status [name]            Show process and port state
    start <name>             Start every process
    stop <name>              Stop every process
    restart <name>           Restart every process
    logs <name> [lines]      Show recent output (default 100 lines)
    exec <name> <cmd...>     Run a command in the application's environment

    backup <name>            Snapshot tree and configuration
    backups <name>           List snapshots
    restore <name> [id]      Bring back a snapshot (default: newest)

    config <name>            Show operator overrides
    config:set <name> K=V... Set overrides, regenerate and restart
    config:unset <name> K... Remove overrides, regenerate and restart

    autopull                 Update applications as their branches move

    help                     Show this help
    version                  Show version

ENVIRONMENT:
    HOIST_CONFIG             Config file (default: ~/.hoist/config.toml)
    RUST_LOG                 Log filter (default: hoist=info)
"#
    );
}

fn print_version() {
    println!("hoist {}", env!("CARGO_PKG_VERSION"));
}

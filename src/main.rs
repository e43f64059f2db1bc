//! Stormhub CLI - session middleware for text-game automation.
//!
//! This is the main binary entry point. See the `stormhub` library
//! for the core functionality.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use stormhub::constants::LEGACY_EXTENSIONS;
use stormhub::env::Environment;
use stormhub::script::{compile, transpile};
use stormhub::{Config, Dialect, Hub};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

/// Options that override the loaded configuration for one run.
#[derive(Debug, Default, clap::Args)]
struct StartArgs {
    /// Game server host
    #[arg(long)]
    host: Option<String>,
    /// Game server port
    #[arg(long)]
    port: Option<u16>,
    /// Address for the primary client listener
    #[arg(long)]
    listen: Option<String>,
    /// Address for the secondary client listener
    #[arg(long)]
    secondary: Option<String>,
    /// Dialect spoken by the primary client (wizard, stormfront, plain)
    #[arg(long)]
    dialect: Option<Dialect>,
}

impl StartArgs {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.game_host = host;
        }
        if let Some(port) = self.port {
            config.game_port = port;
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if self.secondary.is_some() {
            config.secondary_listen = self.secondary;
        }
        if let Some(dialect) = self.dialect {
            config.dialect = dialect;
        }
    }
}

/// Runs the hub until a signal arrives or the game connection closes.
fn run_hub(args: StartArgs) -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;

    let mut config = Config::load()?;
    args.apply(&mut config);

    println!("Starting stormhub v{}...", env!("CARGO_PKG_VERSION"));
    let mut hub = Hub::new(config)?;
    hub.listen()?;
    for addr in hub.listen_addrs() {
        println!("Waiting for clients on {}", addr);
    }

    hub.connect()?;
    println!("Connected to {}", hub.config().game_addr());
    log::info!("stormhub v{} started ({})", env!("CARGO_PKG_VERSION"), Environment::current());

    hub.run(&SHUTDOWN_FLAG)?;

    println!("Shutting down...");
    hub.shutdown();
    Ok(())
}

/// Read a script, transpiling legacy macro files.
fn read_script(path: &Path) -> Result<(String, Vec<(usize, String)>)> {
    let source =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let legacy = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| LEGACY_EXTENSIONS.iter().any(|l| l.eq_ignore_ascii_case(ext)));
    if legacy {
        let out = transpile(&source);
        Ok((out.source, out.report))
    } else {
        Ok((source, Vec::new()))
    }
}

/// Show or change one configuration key.
fn config_command(key: Option<String>, value: Option<String>) -> Result<()> {
    let config = Config::load()?;
    let mut json = serde_json::to_value(&config)?;
    match (key, value) {
        (None, _) => println!("{}", serde_json::to_string_pretty(&config)?),
        (Some(k), None) => match json.get(&k) {
            Some(v) => println!("{}", v),
            None => bail!("unknown config key '{}'", k),
        },
        (Some(k), Some(v)) => {
            let Some(slot) = json.get_mut(&k) else {
                bail!("unknown config key '{}'", k);
            };
            *slot = serde_json::from_str(&v).unwrap_or(serde_json::Value::String(v));
            let updated: Config =
                serde_json::from_value(json).with_context(|| format!("invalid value for '{k}'"))?;
            updated.save()?;
            println!("Saved {}", k);
        }
    }
    Ok(())
}

// CLI
#[derive(Parser)]
#[command(name = "stormhub")]
#[command(version)]
#[command(about = "Session middleware for text-game automation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the game server and serve clients
    Start(StartArgs),
    /// Show configuration, one key, or set a key (value parsed as JSON)
    Config {
        key: Option<String>,
        value: Option<String>,
    },
    /// Print the native form of a legacy macro script
    Transpile {
        /// Path to a .cmd or .wiz file
        file: PathBuf,
    },
    /// Compile a script and report its labels or the first error
    Check {
        /// Path to a script
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    // Log to a file so client-facing output stays clean
    // Use STORMHUB_LOG_FILE or the config dir's stormhub.log or fallback
    let log_path = if let Ok(path) = std::env::var("STORMHUB_LOG_FILE") {
        PathBuf::from(path)
    } else if let Ok(config_dir) = Config::config_dir() {
        config_dir.join("stormhub.log")
    } else {
        PathBuf::from("/tmp/stormhub.log")
    };
    let log_file = std::fs::File::create(&log_path)
        .with_context(|| format!("Failed to create log file at {}", log_path.display()))?;
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(Environment::current().default_log_filter()),
    )
    .target(env_logger::Target::Pipe(Box::new(log_file)))
    .format_timestamp_secs()
    .init();

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {:?}", panic_info);
        default_hook(panic_info);
    }));

    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_hub(args)?,
        Commands::Config { key, value } => config_command(key, value)?,
        Commands::Transpile { file } => {
            let (source, report) = read_script(&file)?;
            print!("{}", source);
            for (line, text) in report {
                eprintln!("{}:{}: not translated: {}", file.display(), line, text);
            }
        }
        Commands::Check { file } => {
            let (source, report) = read_script(&file)?;
            for (line, text) in &report {
                eprintln!("{}:{}: not translated: {}", file.display(), line, text);
            }
            match compile(&source) {
                Ok(program) => println!("ok: labels {}", program.label_names().join(", ")),
                Err(e) => {
                    eprintln!("{}: {}", file.display(), e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

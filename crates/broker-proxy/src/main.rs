use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use broker_proxy::config::ProxyConfig;
use broker_proxy::endpoint::BrokerEndpoint;
use broker_proxy::pidfile::{self, SingletonLease};
use broker_proxy::{ProxyOptions, activation, address};

const APP_NAME: &str = "broker-proxy";

/// Directory name of the container installation under the user data dir.
const CONTAINER_ROOT_NAME: &str = "intuneme";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_run(ctx: RuntimeContext, cmd: RunCommand) -> Result<()> {
    handle_run(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Run(cmd) => async_run(ctx, cmd),
        Command::Status(cmd) => handle_status(&ctx, cmd),
        Command::Stop(cmd) => handle_stop(&ctx, cmd),
        Command::Activation { command } => handle_activation(&ctx, command),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Forward the identity broker from a container session bus to the host session bus.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the broker proxy in the foreground
    Run(RunCommand),
    /// Show whether the broker proxy is running
    Status(RootArgs),
    /// Stop a running broker proxy
    Stop(RootArgs),
    /// Manage the D-Bus activation file
    Activation {
        #[command(subcommand)]
        command: ActivationCommand,
    },
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct RootArgs {
    /// Root directory of the container installation
    #[arg(long, value_name = "PATH")]
    root: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct RunCommand {
    #[command(flatten)]
    root: RootArgs,
    /// Dial immediately instead of waiting for the container bus socket
    #[arg(long = "no-wait")]
    no_wait: bool,
}

#[derive(Debug, Subcommand)]
enum ActivationCommand {
    /// Install the activation file so the session bus starts the proxy on demand
    Install,
    /// Remove the activation file and stop a running proxy
    Remove(RootArgs),
    /// Print the activation file contents
    Show,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths)?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("broker_proxy={level},zbus=warn"))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    /// Container root: CLI flag, then config, then the default data dir.
    fn root(&self, args: &RootArgs) -> Result<PathBuf> {
        if let Some(ref root) = args.root {
            return expand_path(root.clone());
        }
        if let Some(ref root) = self.config.proxy.root {
            return expand_str_path(root);
        }
        default_root()
    }

    fn pid_file(&self, root: &Path) -> PathBuf {
        self.config.proxy.pid_file_path(root)
    }

    fn bus_layout(&self) -> address::BusLayout {
        self.config
            .proxy
            .bus_layout(rustix::process::getuid().as_raw())
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self { config_file })
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config: {}", self.config_file.display())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    proxy: ProxyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

async fn handle_run(ctx: &RuntimeContext, cmd: RunCommand) -> Result<()> {
    let root = ctx.root(&cmd.root)?;
    let pid_path = ctx.pid_file(&root);

    let existing = pidfile::probe(&pid_path);
    if existing.alive && existing.pid != std::process::id() {
        return Err(anyhow!(
            "broker proxy already running (pid {}, pid file {})",
            existing.pid,
            pid_path.display()
        ));
    }

    let layout = ctx.bus_layout();
    let socket = address::session_bus_socket_path(&root, layout);
    if !cmd.no_wait {
        let retries = ctx.config.proxy.socket_wait_retries;
        let interval = ctx.config.proxy.socket_wait_interval();
        if !address::wait_for_socket(&socket, retries, interval).await {
            return Err(anyhow!(
                "container bus socket {} did not appear after {} checks; is the container running?",
                socket.display(),
                retries
            ));
        }
    }

    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating pid file directory {}", parent.display()))?;
    }
    let lease = SingletonLease::acquire(&pid_path)
        .with_context(|| format!("write pid file {}", pid_path.display()))?;
    info!(
        "broker proxy pid {} recorded in {}",
        lease.pid(),
        lease.path().display()
    );

    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));

    let options = ProxyOptions {
        endpoint: BrokerEndpoint::microsoft_identity(),
        container_address: address::container_bus_address(&root, layout),
        call_timeout: ctx.config.proxy.call_timeout(),
    };
    let result = broker_proxy::run(options, token).await;

    lease.remove();
    result.context("broker proxy failed")
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = token.cancelled() => return,
    }

    info!("Shutdown signal received");
    token.cancel();
}

#[derive(Debug, Serialize)]
struct StatusReport {
    root: PathBuf,
    pid_file: PathBuf,
    pid: u32,
    running: bool,
    bus_socket: PathBuf,
    bus_socket_present: bool,
    activation_file: Option<PathBuf>,
    activation_installed: bool,
}

fn handle_status(ctx: &RuntimeContext, args: RootArgs) -> Result<()> {
    let root = ctx.root(&args)?;
    let pid_file = ctx.pid_file(&root);
    let probe = pidfile::probe(&pid_file);
    let bus_socket = address::session_bus_socket_path(&root, ctx.bus_layout());
    let activation_file = activation::service_file_path(&BrokerEndpoint::microsoft_identity().bus_name);

    let report = StatusReport {
        bus_socket_present: bus_socket.exists(),
        activation_installed: activation_file.as_deref().is_some_and(Path::exists),
        root,
        pid_file,
        pid: probe.pid,
        running: probe.alive,
        bus_socket,
        activation_file,
    };

    if ctx.common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serializing status to JSON")?
        );
    } else if ctx.common.yaml {
        println!(
            "{}",
            serde_yaml::to_string(&report).context("serializing status to YAML")?
        );
    } else {
        println!("Root:        {}", report.root.display());
        if report.running {
            println!("Proxy:       running (pid {})", report.pid);
        } else if report.pid != 0 {
            println!("Proxy:       stopped (stale pid {})", report.pid);
        } else {
            println!("Proxy:       stopped");
        }
        println!(
            "Bus socket:  {} ({})",
            report.bus_socket.display(),
            if report.bus_socket_present {
                "present"
            } else {
                "missing"
            }
        );
        println!(
            "Activation:  {}",
            if report.activation_installed {
                "installed"
            } else {
                "not installed"
            }
        );
    }
    Ok(())
}

fn handle_stop(ctx: &RuntimeContext, args: RootArgs) -> Result<()> {
    let root = ctx.root(&args)?;
    let pid_file = ctx.pid_file(&root);
    let was_running = pidfile::probe(&pid_file).alive;

    pidfile::release(&pid_file);

    if was_running {
        println!("Broker proxy stopped.");
    } else {
        println!("Broker proxy is not running.");
    }
    Ok(())
}

fn handle_activation(ctx: &RuntimeContext, command: ActivationCommand) -> Result<()> {
    let bus_name = BrokerEndpoint::microsoft_identity().bus_name;
    let service_file = activation::service_file_path(&bus_name)
        .ok_or_else(|| anyhow!("unable to determine data directory for the activation file"))?;

    match command {
        ActivationCommand::Install => {
            let exec_path = env::current_exe().context("resolve executable path")?;
            activation::install(&service_file, &bus_name, &exec_path).with_context(|| {
                format!("write activation file {}", service_file.display())
            })?;
            println!("D-Bus activation file installed: {}", service_file.display());
            println!("The session bus will start the proxy when a host app calls the broker.");
        }
        ActivationCommand::Remove(args) => {
            let removed = activation::remove(&service_file).with_context(|| {
                format!("remove activation file {}", service_file.display())
            })?;
            let root = ctx.root(&args)?;
            pidfile::release(ctx.pid_file(&root));
            if removed {
                println!("D-Bus activation file removed: {}", service_file.display());
            } else {
                println!("No activation file at {}", service_file.display());
            }
        }
        ActivationCommand::Show => {
            let exec_path = env::current_exe().context("resolve executable path")?;
            println!("# {}", service_file.display());
            print!("{}", activation::service_file_content(&bus_name, &exec_path));
        }
    }
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            } else {
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => write_default_config(&ctx.paths.config_file),
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn load_or_init_config(paths: &AppPaths) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        write_default_config(&paths.config_file)?;
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .set_default("proxy.socket_wait_retries", 30_i64)?
        .set_default("proxy.socket_wait_interval_ms", 1000_i64)?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()?;

    let mut config: AppConfig = built.try_deserialize()?;

    if let Some(ref root) = config.proxy.root {
        config.proxy.root = Some(expand_str_path(root)?.display().to_string());
    }
    if let Some(ref pid_file) = config.proxy.pid_file {
        config.proxy.pid_file = Some(expand_str_path(pid_file)?.display().to_string());
    }

    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push('\n');
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_root() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(CONTAINER_ROOT_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(CONTAINER_ROOT_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(CONTAINER_ROOT_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

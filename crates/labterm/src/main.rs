use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use labterm::api::{self, AppState};
use labterm::container::{ContainerRuntime, ContainerRuntimeApi, RuntimeType};
use labterm::session::{SessionService, SessionServiceConfig};

const APP_NAME: &str = "labterm";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("config file: {}", ctx.config_file.display());

    match cli.command {
        Command::Serve(cmd) => async_main(ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "labterm - container labs with a browser terminal.",
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
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve(ServeCommand),
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
struct ServeCommand {
    /// Host address to bind to
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,
    /// Directory with one build context per lab
    #[arg(long, value_name = "PATH")]
    labs_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
    /// Overwrite the config file with defaults
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = discover_config_file(common.config.clone())?;
        let config = load_or_init_config(&config_file)?;
        Ok(Self {
            common,
            config_file,
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

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("labterm={level},tower_http={level}")));

        // try_init also routes `log` records into tracing.
        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let force_color = env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
                .try_init()
                .ok();
        }

        Ok(())
    }

    /// CLI flags win over `logging.level` from the config.
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
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    server: ServerConfig,
    container: ContainerRuntimeConfig,
    labs: LabsConfig,
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

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServerConfig {
    host: String,
    port: u16,
    /// Destroy all sessions when the server shuts down.
    stop_sessions_on_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            stop_sessions_on_shutdown: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ContainerRuntimeConfig {
    /// Container runtime type: "docker" or "podman" (auto-detected if not set)
    runtime: Option<RuntimeType>,
    /// Custom path to the container runtime binary
    binary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LabsConfig {
    labs_dir: String,
    default_lab: String,
    fallback_image: String,
    shell_command: Vec<String>,
    validator_command: Vec<String>,
    provision_timeout_secs: u64,
    stop_timeout_secs: u32,
}

impl Default for LabsConfig {
    fn default() -> Self {
        let service = SessionServiceConfig::default();
        Self {
            labs_dir: "./labs".to_string(),
            default_lab: "lab-01-3am-crash".to_string(),
            fallback_image: service.fallback_image,
            shell_command: service.shell_command,
            validator_command: service.validator_command,
            provision_timeout_secs: service.provision_timeout.as_secs(),
            stop_timeout_secs: service.stop_timeout_secs,
        }
    }
}

impl ContainerRuntimeConfig {
    fn build_runtime(&self) -> ContainerRuntime {
        match (self.runtime, self.binary.as_ref()) {
            (Some(rt), Some(binary)) => ContainerRuntime::with_binary(rt, binary.clone()),
            (Some(rt), None) => ContainerRuntime::with_type(rt),
            (None, Some(binary)) => ContainerRuntime::with_binary(
                ContainerRuntime::new().runtime_type(),
                binary.clone(),
            ),
            (None, None) => ContainerRuntime::new(),
        }
    }
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
            } else {
                println!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => write_default_config(&ctx.config_file),
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    info!("Starting lab terminal server...");

    let runtime = ctx.config.container.build_runtime();
    match runtime.health_check().await {
        Ok(_) => info!(
            "Container runtime: {} ({})",
            runtime.runtime_type(),
            runtime.binary()
        ),
        Err(e) => warn!(
            "Container runtime {} is not responding: {}",
            runtime.binary(),
            e
        ),
    }
    let runtime: Arc<dyn ContainerRuntimeApi> = Arc::new(runtime);

    let labs = &ctx.config.labs;
    let labs_dir = match cmd.labs_dir {
        Some(dir) => expand_path(dir)?,
        None => expand_str_path(&labs.labs_dir)?,
    };
    if !labs_dir.is_dir() {
        warn!(
            "Labs directory {} does not exist; every lab will use {}",
            labs_dir.display(),
            labs.fallback_image
        );
    }
    info!("Labs directory: {}", labs_dir.display());

    let defaults = SessionServiceConfig::default();
    let service_config = SessionServiceConfig {
        labs_dir,
        fallback_image: labs.fallback_image.clone(),
        shell_command: non_empty_or(&labs.shell_command, defaults.shell_command),
        validator_command: non_empty_or(&labs.validator_command, defaults.validator_command),
        provision_timeout: Duration::from_secs(labs.provision_timeout_secs),
        stop_timeout_secs: labs.stop_timeout_secs,
        bridge_shutdown_timeout: defaults.bridge_shutdown_timeout,
    };

    let sessions = SessionService::new(runtime, service_config);
    let sessions_for_shutdown = sessions.clone();
    let state = AppState::new(sessions, labs.default_lab.clone());
    let app = api::create_router(state);

    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("invalid address")?;

    info!("Listening on http://{}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    let stop_sessions_on_shutdown = ctx.config.server.stop_sessions_on_shutdown;

    let shutdown_signal = async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!("failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("Shutdown signal received");

        if stop_sessions_on_shutdown {
            sessions_for_shutdown.shutdown_all().await;
        } else {
            info!("Leaving lab sandboxes running");
        }

        info!("Shutdown complete");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("running server")?;

    Ok(())
}

fn non_empty_or(value: &[String], fallback: Vec<String>) -> Vec<String> {
    if value.is_empty() {
        fallback
    } else {
        value.to_vec()
    }
}

fn discover_config_file(override_path: Option<PathBuf>) -> Result<PathBuf> {
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
    Ok(config_file)
}

fn load_or_init_config(config_file: &Path) -> Result<AppConfig> {
    if !config_file.exists() {
        write_default_config(config_file)?;
    }

    let defaults = LabsConfig::default();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8000_i64)?
        .set_default("labs.default_lab", defaults.default_lab)?
        .set_default("labs.provision_timeout_secs", defaults.provision_timeout_secs as i64)?
        .add_source(
            File::from(config_file)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(&env_prefix()).separator("__"))
        .build()?;

    let config: AppConfig = built
        .try_deserialize()
        .with_context(|| format!("parsing config {}", config_file.display()))?;
    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = String::new();
    body.push_str("# Configuration for ");
    body.push_str(APP_NAME);
    body.push('\n');
    body.push_str("# File: ");
    body.push_str(&path.display().to_string());
    body.push_str("\n\n");
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write_default_config(&path).unwrap();

        let config = load_or_init_config(&path).unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.labs.default_lab, "lab-01-3am-crash");
        assert_eq!(config.labs.fallback_image, "ubuntu:22.04");
        assert_eq!(config.labs.shell_command, vec!["/bin/bash", "-i"]);
        assert_eq!(config.labs.provision_timeout_secs, 5);
        assert!(config.container.runtime.is_none());
    }

    #[test]
    fn missing_config_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        load_or_init_config(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[server]\nport = 9100\n\n[container]\nruntime = \"podman\"\n\n[labs]\nfallback_image = \"debian:12\"\n",
        )
        .unwrap();

        let config = load_or_init_config(&path).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.container.runtime, Some(RuntimeType::Podman));
        assert_eq!(config.labs.fallback_image, "debian:12");
        assert_eq!(config.labs.stop_timeout_secs, 2);
    }

    #[test]
    fn cli_parses_serve_overrides() {
        let cli = Cli::try_parse_from(["labterm", "-vv", "serve", "--port", "9000"]).unwrap();
        assert_eq!(cli.common.verbose, 2);
        match cli.command {
            Command::Serve(cmd) => {
                assert_eq!(cmd.port, Some(9000));
                assert!(cmd.host.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}

use std::{
    fs,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use regex::Regex;
use tracing_subscriber::{fmt, EnvFilter};
use warden_core::{config::Config, Loader, Plugin, Runtime};

const DEFAULT_CONFIG: &str = "config/warden.toml";

#[derive(Parser, Debug)]
#[command(name = "warden", author, version, about = "Run plugin executables over loopback RPC")]
struct Cli {
    /// Sets the log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Configuration file; built-in defaults apply when it does not exist.
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG, global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Lists the plugins discovered in a directory.
    List {
        /// Overrides `plugins.dir` from the configuration.
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
    },
    /// Starts a plugin, calls one function and prints the result.
    Invoke(InvokeArgs),
    /// Interact with configuration files.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Dump the resolved configuration as JSON.
    Diag,
}

#[derive(Args, Debug)]
struct InvokeArgs {
    /// Plugin executable to run.
    #[arg(long, value_name = "FILE", conflicts_with_all = ["dir", "name"])]
    plugin: Option<PathBuf>,

    /// Directory to discover the plugin in (defaults to `plugins.dir`).
    #[arg(long, value_name = "DIR")]
    dir: Option<PathBuf>,

    /// Name of the plugin within the directory.
    #[arg(long, value_name = "NAME", required_unless_present = "plugin")]
    name: Option<String>,

    /// Function to call.
    #[arg(short, long, default_value = "Execute")]
    function: String,

    /// String payload passed to the function.
    #[arg(short, long, default_value = "")]
    payload: String,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Validates the provided configuration file.
    Validate {
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },
    /// Prints the bundled example configuration.
    Example,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;
    match cli.command {
        Commands::List { dir } => handle_list(&cli.config, dir),
        Commands::Invoke(args) => handle_invoke(&cli.config, args).await,
        Commands::Config { command } => handle_config(command),
        Commands::Diag => handle_diag(&cli.config),
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
    Ok(())
}

fn handle_list(config_path: &Path, dir: Option<PathBuf>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let dir = dir.unwrap_or_else(|| PathBuf::from(&config.plugins.dir));
    let registry = loader(&config)
        .load_directory(&dir)
        .with_context(|| format!("failed to load plugins from {}", dir.display()))?;
    if registry.is_empty() {
        println!("no plugins found under {}", dir.display());
        return Ok(());
    }
    for name in registry.names() {
        if let Some(plugin) = registry.get(name) {
            println!("{plugin}");
        }
    }
    Ok(())
}

async fn handle_invoke(config_path: &Path, args: InvokeArgs) -> Result<()> {
    let config = resolve_config(config_path)?;
    let loader = loader(&config);
    let mut plugin = match (&args.plugin, &args.name) {
        (Some(path), _) => loader
            .load_one(path)
            .with_context(|| format!("failed to load plugin {}", path.display()))?,
        (None, Some(name)) => {
            let dir = args
                .dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(&config.plugins.dir));
            take_plugin(&loader, &dir, name)?
        }
        (None, None) => bail!("either --plugin or --name is required"),
    };

    let runtime = Runtime::new(config.runtime.clone());
    let response = runtime
        .invoke(&mut plugin, &args.function, &args.payload)
        .await
        .with_context(|| format!("invoke of `{}` on plugin `{}` failed", args.function, plugin.name()))?;
    println!("{response}");
    Ok(())
}

fn take_plugin(loader: &Loader, dir: &Path, name: &str) -> Result<Plugin> {
    let mut registry = loader
        .load_directory(dir)
        .with_context(|| format!("failed to load plugins from {}", dir.display()))?;
    registry
        .remove(name)
        .with_context(|| format!("no plugin named `{name}` under {}", dir.display()))
}

fn handle_config(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { config } => {
            let cfg = load_config(&config)?;
            cfg.validate()?;
            println!("configuration OK: {}", config.display());
        }
        ConfigCommands::Example => {
            println!("{}", include_str!("../../../config/warden.toml"));
        }
    }
    Ok(())
}

fn handle_diag(path: &Path) -> Result<()> {
    let cfg = resolve_config(path)?;
    let json = serde_json::to_string_pretty(&cfg)?;
    println!("{json}");
    Ok(())
}

fn loader(config: &Config) -> Loader {
    Loader::new().with_host(config.plugins.host.clone())
}

/// Loads and validates `path`, falling back to defaults when it is absent.
fn resolve_config(path: &Path) -> Result<Config> {
    let cfg = if path.exists() {
        load_config(path)?
    } else {
        tracing::debug!(path = %path.display(), "config file not found; using defaults");
        Config::default()
    };
    cfg.validate()
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    Ok(cfg)
}

fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let expanded = interpolate_env(&raw)?;
    let cfg = toml::from_str::<Config>(&expanded)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(cfg)
}

fn interpolate_env(input: &str) -> Result<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let regex = match RE.get() {
        Some(regex) => regex,
        None => {
            let compiled = Regex::new(r"\$\{([A-Z0-9_]+)(?::([^}]+))?\}")?;
            RE.get_or_init(|| compiled)
        }
    };
    let result = regex.replace_all(input, |caps: &regex::Captures| {
        let key = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(key).unwrap_or_else(|_| default.to_string())
    });
    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolation_falls_back_to_default() {
        let out = interpolate_env("dir = \"${WARDEN_TEST_UNSET_DIR:plugins}\"").unwrap();
        assert_eq!(out, "dir = \"plugins\"");
    }

    #[test]
    fn bundled_example_config_is_valid() {
        let cfg: Config = toml::from_str(include_str!("../../../config/warden.toml")).unwrap();
        cfg.validate().unwrap();
    }

    #[test]
    fn missing_config_file_resolves_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = resolve_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.plugins.host, "localhost");
    }

    #[test]
    fn invoke_requires_plugin_or_name() {
        assert!(Cli::try_parse_from(["warden", "invoke"]).is_err());
        assert!(Cli::try_parse_from(["warden", "invoke", "--name", "echo"]).is_ok());
        assert!(Cli::try_parse_from(["warden", "invoke", "--plugin", "p", "--name", "echo"]).is_err());
    }
}

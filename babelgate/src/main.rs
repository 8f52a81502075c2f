use clap::{Args, Parser, ValueEnum};
use std::path::PathBuf;

mod config;
use config::{Config, MetricsConfig};

use gateway::errors::GatewayError;
use gateway::keypool::KeySet;
use gateway::kv::UpstashStore;
use gateway::maintenance::{self, ProbeOptions};
use metrics_exporter_statsd::StatsdBuilder;
use std::future::Future;
use std::process;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "babelgate", version, about = "Translation gateway for the Gemini API")]
enum CliCommand {
    /// Run the gateway
    Serve(BaseArgs),
    /// Probe every credential in a set and remove the ones the upstream rejects
    CheckKeys(SetArgs),
    /// Add newline-separated credentials from a file to a set
    AddKeys(KeyFileArgs),
    /// Remove the credentials listed in a file from a set
    RemoveKeys(KeyFileArgs),
    /// Remove auth secrets whose expiration has passed
    PruneAuths(BaseArgs),
    /// Show all metrics definitions as markdown table
    ShowMetrics,
}

#[derive(Args, Debug, Clone)]
struct BaseArgs {
    #[arg(long)]
    config_file_path: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SetArgs {
    #[command(flatten)]
    base: BaseArgs,

    #[arg(long, value_enum, default_value_t = SetArg::Gemini)]
    set: SetArg,
}

#[derive(Args, Debug)]
struct KeyFileArgs {
    #[command(flatten)]
    base: BaseArgs,

    #[arg(long)]
    file: PathBuf,

    #[arg(long, value_enum, default_value_t = SetArg::Gemini)]
    set: SetArg,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SetArg {
    Gemini,
    Translate,
    Auth,
}

impl From<SetArg> for KeySet {
    fn from(arg: SetArg) -> Self {
        match arg {
            SetArg::Gemini => KeySet::GeminiApi,
            SetArg::Translate => KeySet::Translate,
            SetArg::Auth => KeySet::AuthSecrets,
        }
    }
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("Failed to load config file: {0}")]
    ConfigLoadError(#[from] config::ConfigError),
    #[error("Failed to create runtime: {0}")]
    RuntimeError(#[from] std::io::Error),
}

fn main() {
    init_tracing();

    if let Err(e) = cli() {
        tracing::error!(error = %e, "Startup error");
        std::process::exit(1);
    }
}

fn cli() -> Result<(), CliError> {
    let cmd = CliCommand::parse();

    match &cmd {
        CliCommand::Serve(args) => {
            let config = load_config(args)?;
            let _sentry_guard = init_sentry(config.common.logging);
            init_statsd_recorder("babelgate", config.common.metrics);

            run_async(gateway::run(config.gateway))?;
            Ok(())
        }
        CliCommand::CheckKeys(args) => {
            let config = load_config(&args.base)?;
            let store = Arc::new(UpstashStore::new(&config.gateway.kv));
            let upstream = config.gateway.upstream.clone();
            let set = KeySet::from(args.set);

            run_async(async move {
                let report =
                    maintenance::check_keys(store, &upstream, set, ProbeOptions::default())
                        .await?;
                println!(
                    "Checked {} keys in {}: {} active, {} removed",
                    report.checked,
                    set,
                    report.active,
                    report.removed.len()
                );
                Ok::<(), GatewayError>(())
            })?;
            Ok(())
        }
        CliCommand::AddKeys(args) => {
            let config = load_config(&args.base)?;
            let store = Arc::new(UpstashStore::new(&config.gateway.kv));
            let set = KeySet::from(args.set);
            let file = args.file.clone();

            run_async(async move {
                let added = maintenance::add_keys_from_file(store, set, &file).await?;
                println!("Added {added} new keys to {set}");
                Ok::<(), GatewayError>(())
            })?;
            Ok(())
        }
        CliCommand::RemoveKeys(args) => {
            let config = load_config(&args.base)?;
            let store = Arc::new(UpstashStore::new(&config.gateway.kv));
            let set = KeySet::from(args.set);
            let file = args.file.clone();

            run_async(async move {
                let removed = maintenance::remove_keys_from_file(store, set, &file).await?;
                println!("Removed {removed} keys from {set}");
                Ok::<(), GatewayError>(())
            })?;
            Ok(())
        }
        CliCommand::PruneAuths(args) => {
            let config = load_config(args)?;
            let store = Arc::new(UpstashStore::new(&config.gateway.kv));
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();

            run_async(async move {
                let pruned = maintenance::prune_expired_auths(store, now).await?;
                println!("Pruned {pruned} expired auth secrets");
                Ok::<(), GatewayError>(())
            })?;
            Ok(())
        }
        CliCommand::ShowMetrics => {
            println!(
                "{}",
                shared::metrics_defs::render_metrics_table(gateway::metrics_defs::ALL_METRICS)
            );
            Ok(())
        }
    }
}

fn load_config(args: &BaseArgs) -> Result<Config, CliError> {
    match &args.config_file_path {
        Some(path) => Ok(Config::from_file(path)?),
        None => {
            tracing::info!("no config file given, using built-in defaults");
            Ok(Config::default())
        }
    }
}

pub fn init_statsd_recorder(prefix: &str, metrics_config: Option<MetricsConfig>) {
    if let Some(MetricsConfig {
        statsd_host,
        statsd_port,
    }) = metrics_config
    {
        let recorder = StatsdBuilder::from(statsd_host, statsd_port)
            .build(Some(prefix))
            .expect("Could not create StatsdRecorder");

        metrics::set_global_recorder(recorder).expect("Could not set global metrics recorder")
    }
}

fn run_async(
    fut: impl Future<Output = Result<(), impl std::error::Error>>,
) -> Result<(), CliError> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    if let Err(e) = rt.block_on(fut) {
        tracing::error!(error = %e, "Runtime error");
        process::exit(1);
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(sentry::integrations::tracing::layer())
        .init();
}

fn init_sentry(logging_config: Option<config::LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    // The Sentry tracing layer is always installed; events only flow once a
    // client is initialized here.
    logging_config.map(|cfg| {
        sentry::init((
            cfg.sentry_dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    })
}

mod cli;
mod config;
mod credentials;
mod storage;

use crate::cli::ConfigCommand;
use clap::Parser;
use color_eyre::Result;
use credvault_core::{RecordStore, StoredRecord};
use credvault_keystore::{key_provider::HardwareKeyProvider, secure_store::SecureCredentialStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Entry point wiring the CLI to the credential vault.
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    match cli.command.unwrap_or(cli::Command::Health) {
        cli::Command::Health => run_health_check(&config).await?,
        cli::Command::Version => print_version(),
        cli::Command::Config(ConfigCommand::Init) => init_config(&config)?,
        cmd => credentials::handle(cmd, &config).await?,
    }

    Ok(())
}

fn init_tracing() {
    // Logs go to stderr-friendly fmt output; default to info unless RUST_LOG says otherwise.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("credvault {}", env!("CARGO_PKG_VERSION"));
}

/// Seals a probe through the device key and round-trips it via the local store.
async fn run_health_check(config: &config::Config) -> Result<()> {
    let vault = storage::vault_from_config(config)?;
    run_store_health(vault.store(), vault.local()).await?;
    println!("Keystore: ok ({})", vault.store().alias());
    println!("Local store: ok");
    Ok(())
}

async fn run_store_health<P, L>(store: &SecureCredentialStore<P>, local: &L) -> Result<()>
where
    P: HardwareKeyProvider,
    L: RecordStore,
{
    let probe_user = "health/probe";
    let payload = b"ok";

    let envelope = store.protect(probe_user, payload)?;
    local.put(&StoredRecord::new(probe_user, envelope)).await?;
    let record = local.get(probe_user).await?;
    local.delete(probe_user).await?;

    let round_trip = store.unprotect(probe_user, &record.envelope)?;
    if round_trip != payload {
        color_eyre::eyre::bail!("credential round-trip failed");
    }
    Ok(())
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

use std::io::{self, Read, Write};

use color_eyre::{eyre::eyre, Report, Result, Section};
use credvault_core::StoredRecord;
use credvault_keystore::key_provider::HardwareKeyProvider;
use credvault_vault::VaultError;
use zeroize::Zeroizing;

use crate::{
    cli::{Command, KeyCommand},
    config,
    storage::{self, Vault},
};

/// Key presence as reported by `key status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStatus {
    pub alias: String,
    pub key_id: Option<String>,
}

/// Execute a credential or key subcommand against the configured vault.
pub async fn handle(cmd: Command, config: &config::Config) -> Result<()> {
    let vault = storage::vault_from_config(config)?;

    match cmd {
        Command::Protect { user, token } => {
            let record = protect(&vault, &user, token, io::stdin().lock()).await?;
            println!(
                "Stored credential for {} (envelope v{}, updated {})",
                record.user_id,
                record.envelope.version(),
                record.updated_at.to_rfc3339()
            );
        }
        Command::Reveal { user } => {
            let token = reveal(&vault, &user).await?;
            let mut stdout = io::stdout().lock();
            stdout.write_all(&token)?;
            writeln!(stdout)?;
        }
        Command::Forget { user } => {
            vault.forget(&user).await.map_err(with_hint)?;
            println!("Forgot credential for {user}");
        }
        Command::Key(KeyCommand::Status) => {
            let status = key_status(&vault)?;
            match status.key_id {
                Some(id) => println!("Device key {} present (id {id})", status.alias),
                None => println!("Device key {} not created yet", status.alias),
            }
        }
        Command::Key(KeyCommand::Rotate { yes }) => {
            let count = rotate(&vault, yes).await?;
            println!("Rotated device key; re-sealed {count} credential(s)");
        }
        other => return Err(eyre!("not a credential command: {other:?}")),
    }

    Ok(())
}

pub async fn protect<P: HardwareKeyProvider>(
    vault: &Vault<P>,
    user: &str,
    token: Option<String>,
    input: impl Read,
) -> Result<StoredRecord> {
    let token = match token {
        Some(token) => Zeroizing::new(token),
        None => read_token(input)?,
    };
    if token.is_empty() {
        color_eyre::eyre::bail!("refusing to store an empty token");
    }
    vault
        .save(user, token.as_bytes())
        .await
        .map_err(with_hint)
}

pub async fn reveal<P: HardwareKeyProvider>(
    vault: &Vault<P>,
    user: &str,
) -> Result<Zeroizing<Vec<u8>>> {
    vault.load(user).await.map_err(with_hint)
}

pub fn key_status<P: HardwareKeyProvider>(vault: &Vault<P>) -> Result<KeyStatus> {
    let store = vault.store();
    let key_id = if store.key_exists()? {
        Some(store.key_id()?)
    } else {
        None
    };
    Ok(KeyStatus {
        alias: store.alias().to_string(),
        key_id,
    })
}

pub async fn rotate<P: HardwareKeyProvider>(vault: &Vault<P>, confirmed: bool) -> Result<usize> {
    if !confirmed {
        color_eyre::eyre::bail!(
            "rotation destroys the current device key and re-seals every stored credential; re-run with --yes"
        );
    }
    vault.rotate_key().await.map_err(with_hint)
}

/// Read a token from `input`, dropping the trailing line break.
fn read_token(mut input: impl Read) -> Result<Zeroizing<String>> {
    let mut raw = Zeroizing::new(String::new());
    input.read_to_string(&mut raw)?;
    Ok(Zeroizing::new(raw.trim_end_matches(['\r', '\n']).to_string()))
}

fn with_hint(err: VaultError) -> Report {
    let reauth = err.requires_reauthentication();
    let partial_rotation = matches!(err, VaultError::RotationIncomplete { .. });
    let report = Report::new(err);
    if reauth {
        report.suggestion("discard the credential with `credvault forget` and sign the user in again")
    } else if partial_rotation {
        report.suggestion("credentials stay readable locally; rotate again once every store is reachable")
    } else {
        report
    }
}

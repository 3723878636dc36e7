use clap::{Parser, Subcommand};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "credvault",
    about = "Hardware-backed encryption for stored OAuth credentials",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Optional subcommand; defaults to a health check when absent.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Round-trip a probe credential through the keystore and local store.
    Health,
    /// Print version and exit.
    Version,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Seal a token for a user and persist it locally and remotely.
    Protect {
        /// User the token belongs to.
        #[arg(long)]
        user: String,
        /// Token value. Read from stdin when omitted (preferred: argv is visible to other processes).
        #[arg(long)]
        token: Option<String>,
    },
    /// Decrypt and print a user's stored token.
    Reveal {
        #[arg(long)]
        user: String,
    },
    /// Delete a user's stored token locally and remotely.
    Forget {
        #[arg(long)]
        user: String,
    },
    /// Inspect or rotate the device key.
    #[command(subcommand)]
    Key(KeyCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum KeyCommand {
    /// Show whether the device key exists and its identifier.
    Status,
    /// Replace the device key and re-seal every locally stored credential.
    Rotate {
        /// Confirm the rotation.
        #[arg(long)]
        yes: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_health_when_missing_subcommand() {
        let cli = Cli::try_parse_from(["credvault"]).expect("parse should succeed");
        assert_eq!(cli.command, None);
    }

    #[test]
    fn parses_health_subcommand() {
        let cli = Cli::try_parse_from(["credvault", "health"]).expect("parse should succeed");
        assert_eq!(cli.command, Some(Command::Health));
    }

    #[test]
    fn parses_config_init_subcommand() {
        let cli =
            Cli::try_parse_from(["credvault", "config", "init"]).expect("parse should succeed");
        assert_eq!(cli.command, Some(Command::Config(ConfigCommand::Init)));
    }

    #[test]
    fn parses_protect_with_optional_token() {
        let cli = Cli::try_parse_from(["credvault", "protect", "--user", "alice"])
            .expect("parse should succeed");
        assert_eq!(
            cli.command,
            Some(Command::Protect {
                user: "alice".into(),
                token: None
            })
        );

        let cli = Cli::try_parse_from(["credvault", "protect", "--user", "alice", "--token", "t"])
            .expect("parse should succeed");
        assert_eq!(
            cli.command,
            Some(Command::Protect {
                user: "alice".into(),
                token: Some("t".into())
            })
        );
    }

    #[test]
    fn reveal_requires_user() {
        assert!(Cli::try_parse_from(["credvault", "reveal"]).is_err());
    }

    #[test]
    fn parses_key_rotate_confirmation() {
        let cli = Cli::try_parse_from(["credvault", "key", "rotate", "--yes"])
            .expect("parse should succeed");
        assert_eq!(
            cli.command,
            Some(Command::Key(KeyCommand::Rotate { yes: true }))
        );
    }
}

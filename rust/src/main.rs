//! secretable: command-line front end over a local JSON store.
//!
//! Every command runs against a freshly loaded cache; the background refresh
//! task lives for the duration of the command and is stopped before exit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use secretable::cache::{CachedSecretStore, RefreshSchedule, RefreshTask};
use secretable::config::{generate_salt, load_config, FileSaltStore};
use secretable::custodian::KeyCustodian;
use secretable::generator::{generate_password, DEFAULT_LENGTH};
use secretable::store::JsonFileStore;
use secretable::vault::Vault;

#[derive(Parser)]
#[command(name = "secretable")]
#[command(about = "Encrypted credential store with a password-wrapped key pair")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "SECRETABLE_CONFIG", default_value = "secretable.json")]
    config: PathBuf,

    /// Master password
    #[arg(long, env = "SECRETABLE_MASTER_PASSWORD", hide_env_values = true)]
    master_password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Set the master password, generating the key pair on first use
    Init,
    /// Check that the master password opens the stored key
    Unlock,
    /// Encrypt and store a credential
    Add {
        description: String,
        username: String,
        secret: String,
    },
    /// List credentials whose description contains TEXT (case-insensitive)
    Query {
        #[arg(default_value = "")]
        text: String,
    },
    /// Delete a credential by its position in the latest listing
    Delete { index: usize },
    /// Re-wrap the key under a new salt (random when omitted)
    RotateSalt {
        #[arg(long)]
        salt: Option<String>,
    },
    /// Re-wrap the key under a new master password and a fresh salt
    ResetPassword {
        #[arg(long, env = "SECRETABLE_NEW_PASSWORD", hide_env_values = true)]
        new_password: String,
    },
    /// Print a random password
    Generate {
        #[arg(default_value_t = DEFAULT_LENGTH)]
        length: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("secretable=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Command::Generate { length } = cli.command {
        println!("{}", generate_password(length));
        return Ok(());
    }

    let config = load_config(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    let store = Arc::new(
        JsonFileStore::open(&config.storage_path)
            .await
            .with_context(|| format!("opening storage {}", config.storage_path.display()))?,
    );
    let cache = Arc::new(CachedSecretStore::connect(store).await?);
    let refresher = RefreshTask::spawn(
        cache.clone(),
        RefreshSchedule::Interval(config.refresh_interval()),
    );
    let custodian = KeyCustodian::new(cache.clone(), Arc::new(FileSaltStore::new(&cli.config)));
    let vault = Vault::new(cache, custodian);

    let outcome = run(&vault, cli.command, cli.master_password.as_deref()).await;
    vault.lock().await;
    refresher.stop().await;
    outcome
}

async fn run(vault: &Vault, command: Command, password: Option<&str>) -> anyhow::Result<()> {
    let Some(password) = password else {
        bail!("master password required: pass --master-password or set SECRETABLE_MASTER_PASSWORD");
    };

    match command {
        Command::Init => {
            let status = vault.set_master_password(password).await?;
            println!("master password set ({status:?} key)");
        }
        Command::Unlock => {
            let unlocked = vault.custodian().unlock(password).await.map_err(|err| {
                if err.is_authentication_failure() {
                    anyhow::anyhow!("wrong password")
                } else {
                    err.into()
                }
            })?;
            if unlocked.existed {
                println!("key unlocked");
            } else {
                println!("no key established yet; run `init`");
            }
        }
        Command::Add {
            description,
            username,
            secret,
        } => {
            vault.set_master_password(password).await?;
            vault.add_secret(&description, &username, &secret).await?;
            println!("secret added");
        }
        Command::Query { text } => {
            vault.set_master_password(password).await?;
            let found = vault.query(&text).await?;
            if found.is_empty() {
                println!("no matching secrets");
            }
            for entry in &found {
                println!(
                    "{}\t{}\t{}\t{}",
                    entry.index,
                    entry.description,
                    entry.username.as_str(),
                    entry.secret.as_str()
                );
            }
        }
        Command::Delete { index } => {
            vault.set_master_password(password).await?;
            vault.delete(index).await?;
            println!("secret {index} deleted");
        }
        Command::RotateSalt { salt } => {
            vault.set_master_password(password).await?;
            vault.rotate_salt(&salt.unwrap_or_else(generate_salt)).await?;
            println!("salt rotated");
        }
        Command::ResetPassword { new_password } => {
            vault.set_master_password(password).await?;
            vault.reset_password(&new_password).await?;
            println!("master password reset");
        }
        Command::Generate { .. } => {}
    }

    info!("command finished");
    Ok(())
}

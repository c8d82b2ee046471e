//! credstore CLI - inspect and manage stored credentials
//!
//! Uses the same settings and data directory as applications embedding
//! `credstore-core`, so it sees exactly what they store.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use credstore_core::{
    default_data_dir, CredentialAttributes, CredentialService, Credentials, EncryptionType,
    GpgEngine, Lookup, PgpEngine, ProviderType, ServiceOptions, SettingsManager,
};

/// credstore - credential storage for desktop applications
#[derive(Parser, Debug)]
#[command(name = "credstore")]
#[command(author = "Symbia Labs")]
#[command(version = "0.1.0")]
#[command(about = "Store and retrieve credentials in the OS keychain or an encrypted database")]
struct Args {
    /// Data directory holding settings, database and master key
    #[arg(long, env = "CREDSTORE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log progress to stderr
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the credentials stored for a service
    Get {
        service: String,
        #[arg(short, long)]
        user: Option<String>,
        /// Print the password instead of masking it
        #[arg(long)]
        show_password: bool,
    },
    /// Store a password (prompted when not given)
    Set {
        service: String,
        #[arg(short, long)]
        user: Option<String>,
        #[arg(long, env = "CREDSTORE_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// Keep the password in this process only
        #[arg(long)]
        memory_only: bool,
    },
    /// Remove the credentials stored for a service
    Delete {
        service: String,
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Delete the database and master key files
    Clear,
    /// Show or change where credentials are stored
    Provider {
        provider: Option<ProviderArg>,
        /// Database file for the database provider
        #[arg(long)]
        database_path: Option<PathBuf>,
        /// Protect the master key with this PGP key
        #[arg(long)]
        pgp_key_id: Option<String>,
    },
    /// List secret keys usable for master key protection
    GpgKeys,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProviderArg {
    Keychain,
    Database,
    MemoryOnly,
}

impl From<ProviderArg> for ProviderType {
    fn from(arg: ProviderArg) -> Self {
        match arg {
            ProviderArg::Keychain => ProviderType::Keychain,
            ProviderArg::Database => ProviderType::Database,
            ProviderArg::MemoryOnly => ProviderType::MemoryOnly,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => default_data_dir().ok_or("Cannot determine the data directory, use --data-dir")?,
    };
    let mut settings_manager = SettingsManager::new(&data_dir);
    let service = CredentialService::new(
        settings_manager.get().clone(),
        ServiceOptions::new(data_dir.clone()),
    );

    match args.command {
        Command::Get {
            service: service_name,
            user,
            show_password,
        } => {
            let attributes = CredentialAttributes::new(service_name, user.as_deref());
            match service.get(&attributes).await {
                Lookup::Found(credentials) => {
                    println!("user:     {}", credentials.user_name.as_deref().unwrap_or("-"));
                    let password = match credentials.password() {
                        Some(password) if show_password => password.to_string(),
                        Some(_) => "********".to_string(),
                        None => "-".to_string(),
                    };
                    println!("password: {}", password);
                }
                Lookup::Absent => println!("No credentials stored for {}", attributes.service_name),
                Lookup::Denied => println!("Access to {} was denied", attributes.service_name),
            }
        }
        Command::Set {
            service: service_name,
            user,
            password,
            memory_only,
        } => {
            let password = match password {
                Some(password) => password,
                None => rpassword::prompt_password(format!("Password for {}: ", service_name))?,
            };
            let mut attributes = CredentialAttributes::new(service_name, user.as_deref());
            if memory_only {
                attributes = attributes.memory_only();
            }
            service
                .set(&attributes, Some(Credentials::new(user.as_deref(), Some(&password))))
                .await;
            info!("Stored credentials for {}", attributes.service_name);
        }
        Command::Delete {
            service: service_name,
            user,
        } => {
            let attributes = CredentialAttributes::new(service_name, user.as_deref());
            service.set(&attributes, None).await;
            info!("Deleted credentials for {}", attributes.service_name);
        }
        Command::Clear => {
            service
                .clear_persistent_storage()
                .await
                .map_err(|e| format!("Failed to clear storage: {}", e))?;
            println!("Deleted stored credentials");
        }
        Command::Provider {
            provider,
            database_path,
            pgp_key_id,
        } => {
            let mut settings = settings_manager.get().clone();
            let changed = provider.is_some() || database_path.is_some() || pgp_key_id.is_some();

            if let Some(provider) = provider {
                settings.provider_type = provider.into();
            }
            if database_path.is_some() {
                settings.database_path = database_path;
            }
            if let Some(key_id) = pgp_key_id {
                settings.pgp_key_id = Some(key_id);
                settings.master_key_encryption = EncryptionType::PgpKey;
            }

            if changed {
                // open the previous store so its content is saved before switching
                service.provider_type().await;
                service.update_settings(settings.clone(), true).await;
                settings_manager
                    .update(settings)
                    .await
                    .map_err(|e| format!("Failed to save settings: {}", e))?;
            }

            println!("provider: {:?}", service.provider_type().await);
            println!("backend:  {}", service.backend_name().await);
            if service.provider_type().await == ProviderType::Database {
                println!("database: {}", service.database_path(&service.settings().await).display());
            }
        }
        Command::GpgKeys => list_gpg_keys()?,
    }

    service.save().await;
    service.close().await;
    Ok(())
}

fn list_gpg_keys() -> Result<(), Box<dyn std::error::Error>> {
    let keys = GpgEngine::default()
        .list_secret_keys()
        .map_err(|e| format!("Failed to list gpg keys: {}", e))?;

    if keys.is_empty() {
        println!("No secret keys found");
    }
    for key in keys {
        println!("{}  {}", key.key_id, key.user_id);
    }
    Ok(())
}

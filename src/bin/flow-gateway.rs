use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use flow_gateway::credential::{Credential, DirectCredential};
use flow_gateway::proxy::ProxyServices;
use flow_gateway::server;
use flow_gateway::{GatewayConfig, TrafficMode, Vendor};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "flow-gateway")]
#[command(version, about = "Local credential-pooling gateway for vendor LLM APIs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (TOML). Defaults to the user config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State file holding credentials and sampler weights.
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Serve {
        /// How the sampler reinforces its choices
        #[arg(long, value_enum)]
        traffic: Option<TrafficMode>,
        /// First port to try
        #[arg(long)]
        port: Option<u16>,
    },

    /// Manage stored credentials
    Credentials {
        #[command(subcommand)]
        action: CredentialAction,
    },
}

#[derive(Subcommand)]
enum CredentialAction {
    /// Print stored credentials as JSON
    List {
        /// Print secrets unmasked
        #[arg(long)]
        show_secrets: bool,
        /// Look up each credential's owner
        #[arg(long)]
        owners: bool,
    },
    /// Upsert a credential from a JSON record
    Set {
        #[arg(long)]
        json: String,
    },
    /// Store a direct vendor key
    AddKey {
        #[arg(long)]
        vendor: Vendor,
        #[arg(long)]
        api_key: String,
        #[arg(long, default_value = "")]
        name: String,
    },
    /// Delete a credential
    Remove { client_id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    flow_gateway::telemetry::init_tracing(cli.json_logs)?;

    let mut config = GatewayConfig::resolve(cli.config.as_deref())?;
    if let Some(state) = cli.state.clone() {
        config.store.state_path = Some(state);
    }

    match cli.command {
        Commands::Serve { traffic, port } => {
            if let Some(traffic) = traffic {
                config.traffic = traffic;
            }
            if let Some(port) = port {
                config.port = port;
            }
            serve(config).await
        }
        Commands::Credentials { action } => credentials(config, action).await,
    }
}

async fn serve(config: GatewayConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let stores = server::open_stores(&config, None).await?;
    let services = Arc::new(ProxyServices::from_parts(config, stores)?);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
        }
        signal.cancel();
    });

    server::serve(services, shutdown).await?;
    Ok(())
}

async fn credentials(
    config: GatewayConfig,
    action: CredentialAction,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let stores = server::open_stores(&config, None).await?;
    let client = reqwest::Client::new();
    let store = server::credential_store(&config, &stores, &client);

    match action {
        CredentialAction::List {
            show_secrets,
            owners,
        } => {
            let reveal = |credential: Credential| {
                if show_secrets {
                    credential
                } else {
                    credential.masked()
                }
            };
            let out = if owners {
                let listed = store.list().await?;
                let rows: Vec<serde_json::Value> = listed
                    .into_iter()
                    .map(|row| {
                        serde_json::json!({
                            "credential": reveal(row.credential),
                            "owner": row.owner,
                        })
                    })
                    .collect();
                serde_json::to_string_pretty(&rows)?
            } else {
                let rows: Vec<Credential> =
                    store.list_credentials().await?.into_iter().map(reveal).collect();
                serde_json::to_string_pretty(&rows)?
            };
            println!("{out}");
        }
        CredentialAction::Set { json } => {
            let record: serde_json::Value = serde_json::from_str(&json)?;
            let credential = Credential::from_record(record)?;
            store.set(&credential).await?;
            println!("{}", credential.client_id());
        }
        CredentialAction::AddKey {
            vendor,
            api_key,
            name,
        } => {
            let credential = Credential::Direct(DirectCredential::new(name, vendor, api_key));
            store.set(&credential).await?;
            println!("{}", credential.client_id());
        }
        CredentialAction::Remove { client_id } => {
            store.remove(&client_id).await?;
            tracing::info!(client_id, "credential removed");
        }
    }
    Ok(())
}

//! TMIS CLI - Command-line interface
//!
//! Usage:
//!   tmis migrate
//!   tmis seed
//!   tmis invite --company-id <id> [--hours N]
//!   tmis validate-invitation <token>

use clap::{Parser, Subcommand};
use serde_json::json;
use std::sync::Arc;
use tmis_api::auth::Argon2Hasher;
use tmis_api::invitation::InvitationService;
use tmis_api::seed::{seed_demo_data, SeedOutcome};
use tmis_core::{AppConfig, PgStore, Repositories};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "tmis")]
#[command(about = "Multi-tenant authentication service CLI")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,
    /// Create the demo company and administrator if missing
    Seed,
    /// Issue an invitation for a company
    Invite {
        /// Company to invite into
        #[arg(long)]
        company_id: Uuid,
        /// Hours until the invitation expires
        #[arg(long)]
        hours: Option<i64>,
    },
    /// Check whether an invitation token is usable
    ValidateInvitation {
        /// Invitation token
        token: String,
    },
}

async fn connect(config: &AppConfig) -> anyhow::Result<PgStore> {
    let store = PgStore::connect(
        &config.database.postgres_url,
        config.database.postgres_pool_size,
    )
    .await?;
    Ok(store)
}

fn invitation_service(config: &AppConfig, repos: &Repositories) -> InvitationService {
    InvitationService::new(
        repos.invitations.clone(),
        repos.tenants.clone(),
        config.invitation.default_expiration_hours,
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = AppConfig::load()?;
    let store = connect(&config).await?;

    match cli.command {
        Commands::Migrate => {
            sqlx::migrate!("../../migrations").run(store.pool()).await?;
            println!("Migrations applied");
        }
        Commands::Seed => {
            let repos = Repositories::from_store(Arc::new(store));
            let hasher = Argon2Hasher::default();
            match seed_demo_data(&repos, &hasher).await? {
                SeedOutcome::Seeded { tenant_id } => {
                    println!("Demo data created for company {tenant_id}");
                }
                SeedOutcome::AlreadySeeded { tenant_id } => {
                    println!("Demo data already exists for company {tenant_id}");
                }
            }
        }
        Commands::Invite { company_id, hours } => {
            let repos = Repositories::from_store(Arc::new(store));
            let invitation = invitation_service(&config, &repos)
                .create(company_id, hours, None)
                .await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "id": invitation.id,
                    "token": invitation.token,
                    "companyId": invitation.tenant_id,
                    "companyName": invitation.tenant_name,
                    "expiresAt": invitation.expires_at,
                }))?
            );
        }
        Commands::ValidateInvitation { token } => {
            let repos = Repositories::from_store(Arc::new(store));
            match invitation_service(&config, &repos).validate(&token).await {
                Ok(invitation) => println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "isValid": true,
                        "companyId": invitation.tenant_id,
                        "companyName": invitation.tenant_name,
                        "expiresAt": invitation.expires_at,
                    }))?
                ),
                Err(e) => {
                    tracing::debug!(error = %e, "Invitation rejected");
                    println!("{}", json!({ "isValid": false }));
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

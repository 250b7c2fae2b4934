use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clst_closet::{
    AuthGate, Category, ClosetService, CognitoIdentity, Config, ItemDetails, ItemForm,
    ItemId, ItemQuery, ItemRepository, KeyNamer, ObjectStore, OrphanSweeper, PgItemRepository,
    PhotoFile, PhotoLimits, S3ObjectStore, UploadPipeline, UrlResolver,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Manage the items of your digital closet
#[derive(Debug, Parser)]
#[command(name = "clst-closet", version)]
struct Cli {
    /// Access token of the signed-in user
    #[arg(long, env = "CLST_ACCESS_TOKEN", global = true, hide_env_values = true)]
    access_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending database migrations
    Migrate,
    /// Show the session state
    Whoami,
    /// End the session everywhere
    SignOut,
    /// Add an item with 2 to 5 photos
    Add {
        #[arg(long)]
        brand: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        category: String,
        #[arg(long)]
        size: String,
        #[arg(long)]
        color: String,
        /// Photo file; repeat for each photo
        #[arg(long = "photo", required = true)]
        photos: Vec<PathBuf>,
    },
    /// List your items, newest first
    List {
        #[arg(long)]
        category: Option<Category>,
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long)]
        offset: Option<i64>,
    },
    /// Show one item
    Get { id: ItemId },
    /// Change the descriptive fields of an item
    Update {
        id: ItemId,
        #[arg(long)]
        brand: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        category: Option<Category>,
        #[arg(long)]
        size: Option<String>,
        #[arg(long)]
        color: Option<String>,
    },
    /// Delete an item and its photos
    Delete { id: ItemId },
    /// Remove closet photos no item references
    Sweep {
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove expired temp uploads
    CleanupTemp {
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(service = %config.service.name, "Starting closet command");

    if let Command::Migrate = cli.command {
        let repository = PgItemRepository::new(&config.database)
            .await
            .context("Failed to initialize item repository")?;
        repository.run_migrations().await?;
        return print(&serde_json::json!({ "migrated": true }));
    }

    let identity = CognitoIdentity::new(&config.identity, cli.access_token.clone()).await;
    let gate = Arc::new(AuthGate::new(identity).with_session_ttl(config.session_ttl()));

    match cli.command {
        Command::Whoami => return print(&gate.check().await),
        Command::SignOut => {
            gate.sign_out().await.context("Sign-out failed")?;
            return print(&gate.state());
        }
        _ => {}
    }

    let owner = gate
        .require_owner()
        .await
        .context("Not signed in: pass --access-token or set CLST_ACCESS_TOKEN")?;

    let store: Arc<dyn ObjectStore> = Arc::new(
        S3ObjectStore::new(&config.s3)
            .await
            .context("Failed to initialize object store")?,
    );

    let repository = PgItemRepository::new(&config.database)
        .await
        .context("Failed to initialize item repository")?;
    if config.database.run_migrations {
        repository
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }
    let repository: Arc<dyn ItemRepository> = Arc::new(repository);

    let sweeper = OrphanSweeper::new(store.clone(), repository.clone())
        .with_grace_period(config.sweep_grace_period())
        .with_temp_max_age(config.temp_max_age())
        .with_timeout(config.operation_timeout());

    let service = build_service(&config, gate, store, repository);

    match cli.command {
        Command::Add {
            brand,
            name,
            category,
            size,
            color,
            photos,
        } => {
            let mut files = Vec::with_capacity(photos.len());
            for path in &photos {
                files.push(PhotoFile::from_path(path).await?);
            }
            let form = ItemForm {
                brand,
                item_name: name,
                category,
                size,
                color,
                photos: files,
            };
            print(&service.create(form).await?)
        }
        Command::List {
            category,
            limit,
            offset,
        } => {
            let query = ItemQuery {
                category,
                limit,
                offset,
            };
            print(&service.list(&query).await?)
        }
        Command::Get { id } => print(&service.get(id).await?),
        Command::Update {
            id,
            brand,
            name,
            category,
            size,
            color,
        } => {
            let current = service.get(id).await?.item.details;
            let details = ItemDetails {
                brand: brand.unwrap_or(current.brand),
                item_name: name.unwrap_or(current.item_name),
                category: category.unwrap_or(current.category),
                size: size.unwrap_or(current.size),
                color: color.unwrap_or(current.color),
            };
            print(&service.update(id, details).await?)
        }
        Command::Delete { id } => print(&service.delete(id).await?),
        Command::Sweep { dry_run } => print(&sweeper.sweep_owner(&owner, dry_run).await?),
        Command::CleanupTemp { dry_run } => print(&sweeper.cleanup_temp(&owner, dry_run).await?),
        Command::Migrate | Command::Whoami | Command::SignOut => Ok(()),
    }
}

fn build_service(
    config: &Config,
    gate: Arc<AuthGate>,
    store: Arc<dyn ObjectStore>,
    repository: Arc<dyn ItemRepository>,
) -> ClosetService {
    let timeout = config.operation_timeout();

    let pipeline = UploadPipeline::new(store.clone(), Arc::new(KeyNamer::new()))
        .with_concurrency(config.closet.upload_concurrency)
        .with_timeout(timeout)
        .with_cleanup_on_failure(config.closet.cleanup_failed_uploads);
    let resolver = UrlResolver::new(store.clone(), config.signed_url_ttl()).with_timeout(timeout);

    ClosetService::new(gate, pipeline, resolver, store, repository)
        .with_limits(PhotoLimits {
            min: config.closet.min_photos,
            max: config.closet.max_photos,
        })
        .with_timeout(timeout)
}

/// Initialize tracing/logging; stdout is reserved for command output
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .init();
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{out}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_add_collects_repeated_photos() {
        let cli = Cli::try_parse_from([
            "clst-closet", "add", "--brand", "Nike", "--name", "Air Max", "--category", "shoes",
            "--size", "10", "--color", "White", "--photo", "a.jpg", "--photo", "b.jpg",
        ])
        .unwrap();

        match cli.command {
            Command::Add { photos, .. } => assert_eq!(photos.len(), 2),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_unknown_category_filter_is_rejected() {
        assert!(Cli::try_parse_from(["clst-closet", "list", "--category", "hats"]).is_err());
    }
}

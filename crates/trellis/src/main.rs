use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use trellis_core::{LastOperationType, ObjectKey, Shoot, ShootSpec, StoredObject};
use trellis_reconciler::{ShootController, TrellisConfig};
use trellis_storage::{KVStore, MemoryBackend, ObjectStore, RedbBackend};

#[derive(Parser)]
#[command(name = "trellis", about = "Trellis shoot control-plane orchestrator")]
struct Cli {
    /// Path to the redb database file
    #[arg(long, global = true, default_value = "./trellis.redb", env = "TRELLIS_DATA_DIR")]
    data_dir: PathBuf,
    /// Path to a YAML configuration file
    #[arg(long, global = true, env = "TRELLIS_CONFIG")]
    config: Option<PathBuf>,
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    /// Keep all state in memory instead of the database file
    #[arg(long, global = true)]
    in_memory: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller, reconciling every stored shoot until interrupted
    Run,
    /// Run a single pass over one shoot
    Reconcile {
        /// Shoot as <namespace>/<name>
        #[arg(long)]
        shoot: String,
    },
    /// Move a shoot's control plane to another seed
    Migrate {
        /// Shoot as <namespace>/<name>
        #[arg(long)]
        shoot: String,
        /// Destination seed
        #[arg(long)]
        to: String,
    },
    /// Request deletion of a shoot and run the deletion pass
    Delete {
        /// Shoot as <namespace>/<name>
        #[arg(long)]
        shoot: String,
    },
    /// Create or update a shoot from a YAML manifest
    Apply {
        /// Manifest with metadata.namespace, metadata.name and spec
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Debug, Deserialize)]
struct ShootManifest {
    metadata: ManifestMetadata,
    spec: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ManifestMetadata {
    namespace: String,
    name: String,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = match &cli.config {
        Some(path) => TrellisConfig::load(path)?,
        None => TrellisConfig::default(),
    };
    let kv = open_store(&cli.data_dir, cli.in_memory)?;
    let controller = Arc::new(ShootController::new(
        kv,
        config.timeouts.clone(),
        config.hibernation(),
        config.controller(),
    ));

    match cli.command {
        Commands::Run => run_controller(controller).await,
        Commands::Reconcile { shoot } => {
            let key = parse_shoot_key(&shoot)?;
            run_pass(&controller, &key).await.map(|_| ())
        }
        Commands::Migrate { shoot, to } => migrate_shoot(&controller, &parse_shoot_key(&shoot)?, &to).await,
        Commands::Delete { shoot } => delete_shoot(&controller, &parse_shoot_key(&shoot)?).await,
        Commands::Apply { file } => {
            let key = apply_manifest(controller.store().as_ref(), &file).await?;
            info!("Applied shoot {}", key);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn open_store(data_dir: &Path, in_memory: bool) -> miette::Result<Arc<dyn KVStore>> {
    if in_memory {
        warn!("Using in-memory store, state is lost on exit");
        return Ok(Arc::new(MemoryBackend::new()));
    }
    let backend = RedbBackend::new(data_dir).map_err(|e| {
        miette::miette!("Failed to open database at {}: {}", data_dir.display(), e)
    })?;
    Ok(Arc::new(backend))
}

fn parse_shoot_key(shoot: &str) -> miette::Result<ObjectKey> {
    match shoot.split_once('/') {
        Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok(Shoot::key_for(namespace, name))
        }
        _ => Err(miette::miette!(
            help = "Pass the shoot as <namespace>/<name>, e.g. garden-dev/alpha",
            "Invalid shoot reference '{}'",
            shoot
        )),
    }
}

/// Run the controller until ctrl-c
async fn run_controller(controller: Arc<ShootController>) -> miette::Result<()> {
    info!("Starting trellis controller");

    let token = CancellationToken::new();
    let controller_token = token.clone();
    let handle = tokio::spawn(async move {
        if let Err(e) = controller.run(controller_token).await {
            error!("Shoot controller error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;

    info!("Shutting down gracefully...");
    token.cancel();

    let shutdown_timeout = std::time::Duration::from_secs(30);
    if tokio::time::timeout(shutdown_timeout, handle).await.is_err() {
        warn!("Passes still running after {:?}, exiting anyway", shutdown_timeout);
    }

    info!("Shutdown complete");
    Ok(())
}

/// One pass, interruptible with ctrl-c
async fn run_pass(controller: &ShootController, key: &ObjectKey) -> miette::Result<LastOperationType> {
    let token = CancellationToken::new();
    let interrupt = token.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling pass");
            interrupt.cancel();
        }
    });

    let result = controller.reconcile_shoot(key, &token).await;
    watcher.abort();

    let operation = result.map_err(|e| miette::miette!("Pass over {} failed: {}", key, e))?;
    info!("{} of {} succeeded", operation, key);
    Ok(operation)
}

/// Point the shoot at another seed, then run passes until it is restored there
async fn migrate_shoot(controller: &ShootController, key: &ObjectKey, seed: &str) -> miette::Result<()> {
    update_spec(controller.store().as_ref(), key, |spec| {
        spec.seed_name = seed.to_string();
    })
    .await?;
    info!("Moving {} to seed {}", key, seed);

    // Migrate on the source, then restore on the destination
    for _ in 0..2 {
        if run_pass(controller, key).await? == LastOperationType::Restore {
            return Ok(());
        }
    }
    Err(miette::miette!(
        "Shoot {} did not reach the restore pass; check its last operation",
        key
    ))
}

async fn delete_shoot(controller: &ShootController, key: &ObjectKey) -> miette::Result<()> {
    update_spec(controller.store().as_ref(), key, |spec| {
        spec.deletion_requested = true;
    })
    .await?;
    run_pass(controller, key).await?;
    Ok(())
}

async fn update_spec(
    store: &dyn ObjectStore,
    key: &ObjectKey,
    f: impl FnOnce(&mut ShootSpec),
) -> miette::Result<()> {
    let mut object = store
        .get(key)
        .await
        .map_err(|e| miette::miette!("Failed to read {}: {}", key, e))?
        .ok_or_else(|| miette::miette!("Shoot {} not found", key))?;
    let mut spec: ShootSpec = trellis_core::from_value(object.spec.clone())?;
    f(&mut spec);
    object.spec = trellis_core::to_value(&spec)?;
    store
        .update(object)
        .await
        .map_err(|e| miette::miette!("Failed to update {}: {}", key, e))?;
    Ok(())
}

/// Create the shoot, or replace the spec of an existing one keeping its status
async fn apply_manifest(store: &dyn ObjectStore, file: &Path) -> miette::Result<ObjectKey> {
    let data = std::fs::read_to_string(file)
        .map_err(|e| miette::miette!("Failed to read {}: {}", file.display(), e))?;
    let manifest: ShootManifest = trellis_core::from_yaml(&data)?;
    // Reject specs the controller could not decode later
    let _: ShootSpec = trellis_core::from_value(manifest.spec.clone())?;

    let key = Shoot::key_for(&manifest.metadata.namespace, &manifest.metadata.name);
    let existing = store
        .get(&key)
        .await
        .map_err(|e| miette::miette!("Failed to read {}: {}", key, e))?;

    let result = match existing {
        Some(mut object) => {
            object.spec = manifest.spec;
            store.update(object).await
        }
        None => store.create(StoredObject::new(key.clone(), manifest.spec)).await,
    };
    result.map_err(|e| miette::miette!("Failed to store {}: {}", key, e))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use trellis_storage::KvObjectStore;

    #[test]
    fn test_parse_shoot_key() {
        let key = parse_shoot_key("garden-dev/alpha").unwrap();
        assert_eq!(key, Shoot::key_for("garden-dev", "alpha"));
        assert!(parse_shoot_key("alpha").is_err());
        assert!(parse_shoot_key("/alpha").is_err());
        assert!(parse_shoot_key("a/b/c").is_err());
    }

    #[tokio::test]
    async fn test_apply_creates_then_updates() {
        let store = KvObjectStore::new(Arc::new(MemoryBackend::new()));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "metadata:\n  namespace: garden-dev\n  name: alpha\nspec:\n  seedName: seed-a\n  kubernetesVersion: 1.31.2\n"
        )
        .unwrap();

        let key = apply_manifest(&store, file.path()).await.unwrap();
        let created = store.get(&key).await.unwrap().unwrap();
        assert_eq!(created.spec["seedName"], "seed-a");

        update_spec(&store, &key, |spec| spec.hibernation = true).await.unwrap();
        let updated = store.get(&key).await.unwrap().unwrap();
        assert_eq!(updated.spec["hibernation"], true);
        assert_eq!(updated.generation, created.generation + 1);

        // Re-applying the manifest overwrites the spec
        apply_manifest(&store, file.path()).await.unwrap();
        let reapplied = store.get(&key).await.unwrap().unwrap();
        assert_eq!(reapplied.spec["hibernation"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_apply_rejects_undecodable_spec() {
        let store = KvObjectStore::new(Arc::new(MemoryBackend::new()));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "metadata:\n  namespace: garden-dev\n  name: alpha\nspec:\n  hibernation: yes please\n").unwrap();

        assert!(apply_manifest(&store, file.path()).await.is_err());
        assert!(store.list(&trellis_core::GroupVersionKind::shoot(), None).await.unwrap().is_empty());
    }
}

use buildworld::{
    error::BuildWorldError, events::ModificationKind, workspace::VisibilityFilter, BuildWorldConfig, Builder,
    SignalOutcome, Visibility, WorkspaceService, WorkspaceStatus, WorldType,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "worldctl")]
#[command(about = "Manage build worlds: lifecycle, ownership and backups")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List workspaces
    List {
        /// Only workspaces created by this player id
        #[arg(long)]
        creator: Option<Uuid>,
        /// Include private workspaces
        #[arg(long)]
        all: bool,
    },
    /// Create a new workspace
    Create {
        name: String,
        #[arg(short, long, default_value = "normal")]
        world_type: WorldType,
        #[arg(long)]
        private: bool,
        #[arg(long, requires = "creator_name")]
        creator_id: Option<Uuid>,
        #[arg(long, requires = "creator_id")]
        creator_name: Option<String>,
    },
    /// Register existing world data
    Import {
        name: String,
        #[arg(short, long, default_value = "imported")]
        world_type: WorldType,
    },
    /// Delete a workspace
    Delete {
        name: String,
        /// Keep the workspace's backups even when the config says to purge them
        #[arg(long)]
        keep_backups: bool,
    },
    Rename {
        name: String,
        new_name: String,
    },
    /// Show or set a workspace's status
    Status {
        name: String,
        status: Option<WorkspaceStatus>,
        /// Return a hidden workspace to its previous status
        #[arg(long, conflicts_with = "status")]
        unhide: bool,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Report a content modification
    Touch { name: String },
    Content {
        #[command(subcommand)]
        command: ContentCommands,
    },
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
}

#[derive(Subcommand)]
enum ContentCommands {
    /// Replace a workspace's content with a file
    Put { name: String, file: PathBuf },
}

#[derive(Subcommand)]
enum BackupCommands {
    Create { name: String },
    List { name: String },
    Restore {
        name: String,
        key: String,
        #[arg(long)]
        actor: Option<String>,
    },
    Delete { name: String, key: String },
}

#[tokio::main]
async fn main() -> Result<(), BuildWorldError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("BUILDWORLD_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let service = WorkspaceService::open(load_config(&cli)?)?;
    let result = run(&service, cli.command).await;
    service.shutdown();
    result
}

fn load_config(cli: &Cli) -> Result<BuildWorldConfig, BuildWorldError> {
    let mut config = match &cli.config {
        Some(path) => BuildWorldConfig::from_file(path)?,
        None => BuildWorldConfig::default(),
    }
    .apply_env_overrides()?;
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    Ok(config)
}

async fn run(service: &WorkspaceService, command: Commands) -> Result<(), BuildWorldError> {
    match command {
        Commands::List { creator, all } => list_workspaces(service, creator, all),
        Commands::Create {
            name,
            world_type,
            private,
            creator_id,
            creator_name,
        } => {
            let creator = creator_id.zip(creator_name).map(|(id, name)| Builder::new(id, &name));
            let visibility = if private { Visibility::Private } else { Visibility::Public };
            let ws = service.create_workspace(&name, creator, world_type, visibility)?;
            println!("Created '{}' ({})", ws.name, ws.id);
            Ok(())
        }
        Commands::Import { name, world_type } => {
            let ws = service.import_workspace(&name, world_type)?;
            println!("Imported '{}' ({})", ws.name, ws.id);
            Ok(())
        }
        Commands::Delete { name, keep_backups } => {
            let ws = service.workspace(name.as_str())?;
            let purged = service.delete_workspace(ws.id, retain_override(keep_backups)).await?;
            println!("Deleted '{}', {} backup(s) removed", ws.name, purged);
            Ok(())
        }
        Commands::Rename { name, new_name } => {
            let ws = service.workspace(name.as_str())?;
            service.rename_workspace(ws.id, &new_name)?;
            println!("Renamed '{}' to '{}'", ws.name, new_name);
            Ok(())
        }
        Commands::Status {
            name,
            status,
            unhide,
            actor,
        } => {
            let ws = service.workspace(name.as_str())?;
            if unhide {
                match service.lifecycle().unhide(ws.id)? {
                    Some(change) => println!("{}: {} -> {}", ws.name, change.old_status, change.new_status),
                    None => println!("{} is not hidden", ws.name),
                }
            } else if let Some(status) = status {
                let change = service.lifecycle().set_status(ws.id, status, actor.as_deref())?;
                println!("{}: {} -> {}", ws.name, change.old_status, change.new_status);
            } else {
                println!("{}: {} (stage {})", ws.name, ws.status, ws.status.stage());
            }
            Ok(())
        }
        Commands::Touch { name } => {
            let ws = service.workspace(name.as_str())?;
            match service.lifecycle().apply_modification_signal(ws.id, ModificationKind::External)? {
                SignalOutcome::Advanced(change) => println!("{}: {} -> {}", ws.name, change.old_status, change.new_status),
                SignalOutcome::Unchanged => println!("{}: {}", ws.name, ws.status),
                SignalOutcome::Rejected => println!("{} is archived, modification ignored", ws.name),
            }
            Ok(())
        }
        Commands::Content {
            command: ContentCommands::Put { name, file },
        } => {
            let ws = service.workspace(name.as_str())?;
            let data = tokio::fs::read(&file).await?;
            service.write_content(ws.id, &data)?;
            println!("Wrote {} bytes to '{}'", data.len(), ws.name);
            Ok(())
        }
        Commands::Backup { command } => run_backup(service, command).await,
    }
}

/// Without `--keep-backups` the configured orphan policy applies.
fn retain_override(keep_backups: bool) -> Option<bool> {
    keep_backups.then_some(true)
}

fn list_workspaces(service: &WorkspaceService, creator: Option<Uuid>, all: bool) -> Result<(), BuildWorldError> {
    let filter = if all { VisibilityFilter::Any } else { VisibilityFilter::Public };
    let workspaces = match creator {
        Some(id) => service.registry().created_by(id, filter),
        None => service
            .registry()
            .all()
            .into_iter()
            .filter(|ws| ws.matches_visibility(filter))
            .collect(),
    };

    println!("{:<24} {:<16} {:<10} {}", "NAME", "STATUS", "TYPE", "CREATED");
    println!("{}", "─".repeat(64));
    for ws in workspaces {
        println!(
            "{:<24} {:<16} {:<10} {}",
            ws.name,
            ws.status.as_str(),
            format!("{:?}", ws.world_type).to_lowercase(),
            ws.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn run_backup(service: &WorkspaceService, command: BackupCommands) -> Result<(), BuildWorldError> {
    match command {
        BackupCommands::Create { name } => {
            let ws = service.workspace(name.as_str())?;
            let backup = service.backups().backup(ws.id).await?;
            println!("Created backup {} ({} bytes)", backup.key, backup.size);
        }
        BackupCommands::List { name } => {
            let ws = service.workspace(name.as_str())?;
            let backups = service.backups().profile(ws.id)?.list_backups().await?;
            println!("Backups of '{}' ({}/{}):", ws.name, backups.len(), service.backups().max_backups());
            for backup in backups {
                let created = backup
                    .created_at_utc()
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
                    .unwrap_or_else(|| backup.created_at.to_string());
                println!("  {}  {}  {} bytes", backup.key, created, backup.size);
            }
        }
        BackupCommands::Restore { name, key, actor } => {
            let ws = service.workspace(name.as_str())?;
            let backup = service.backups().find(ws.id, &key).await?;
            service
                .backups()
                .profile(ws.id)?
                .restore_backup(&backup, actor.as_deref())
                .await
                .map_err(|e| {
                    eprintln!("{}", e.user_message("restore"));
                    e
                })?;
            info!(workspace = %ws.name, backup = %key, "restore finished");
            println!("Restored '{}' from {}", ws.name, key);
        }
        BackupCommands::Delete { name, key } => {
            let ws = service.workspace(name.as_str())?;
            let backup = service.backups().find(ws.id, &key).await?;
            service.backups().profile(ws.id)?.delete_backup(&backup).await?;
            println!("Deleted backup {}", key);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_flag_defers_to_config() {
        assert_eq!(retain_override(false), None);
        assert_eq!(retain_override(true), Some(true));

        let cli = Cli::try_parse_from(["worldctl", "delete", "alpha"]).unwrap();
        match cli.command {
            Commands::Delete { keep_backups, .. } => assert_eq!(retain_override(keep_backups), None),
            _ => panic!("expected delete"),
        }
        let cli = Cli::try_parse_from(["worldctl", "delete", "alpha", "--keep-backups"]).unwrap();
        assert!(matches!(cli.command, Commands::Delete { keep_backups: true, .. }));
    }
}

// src/main.rs

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use pkgpool::db::models::SourceSpec;
use pkgpool::repository::layout::Layout;
use pkgpool::repository::lock::BaseLock;
use pkgpool::{Config, Session, config};
use std::io;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "pkgpool")]
#[command(author, version, about = "Maintain eopkg binary repositories backed by a shared package pool", long_about = None)]
struct Cli {
    /// Base directory holding the pool, repositories and databases
    #[arg(short, long, global = true, default_value = config::DEFAULT_BASE_DIR)]
    base_dir: PathBuf,

    /// Program printing package metadata as JSON
    #[arg(long, global = true, default_value = config::DEFAULT_METADATA_TOOL)]
    metadata_tool: String,

    /// zstd level used when generating deltas
    #[arg(long, global = true, default_value_t = config::DEFAULT_DELTA_LEVEL)]
    delta_level: i32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new repository
    CreateRepo {
        /// Repository name
        name: String,
    },
    /// Remove a repository and release its pool references
    RemoveRepo {
        /// Repository name
        name: String,
    },
    /// Add package files to a repository
    Add {
        /// Repository name
        repo: String,
        /// Package files (.eopkg)
        #[arg(required = true)]
        packages: Vec<PathBuf>,
    },
    /// Remove packages by source name (optionally pinned as name==release)
    RemoveSource {
        /// Repository name
        repo: String,
        /// Source names, e.g. nano or nano==5
        #[arg(required = true)]
        sources: Vec<SourceSpec>,
    },
    /// Regenerate deltas for a repository
    Delta {
        /// Repository name
        repo: String,
    },
    /// Clone a repository into a new one
    Clone {
        /// Repository to clone
        src: String,
        /// New repository name
        dest: String,
        /// Copy every release, not just the highest
        #[arg(short, long)]
        all_versions: bool,
    },
    /// Copy sources from one repository to another
    CopySource {
        /// Source repository
        src: String,
        /// Destination repository
        dest: String,
        /// Source names to copy
        #[arg(required = true)]
        sources: Vec<String>,
        /// Copy every release, not just the highest
        #[arg(short, long)]
        all_versions: bool,
    },
    /// Pull newer releases from an origin repository into a clone
    Pull {
        /// Repository receiving updates
        clone: String,
        /// Repository providing updates
        origin: String,
    },
    /// List repositories
    ListRepos,
    /// Check repositories against their databases and the pool
    Verify {
        /// Repository name (checks all if omitted)
        repo: Option<String>,
        /// Also verify recorded package checksums
        #[arg(long)]
        checksums: bool,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type
        shell: Shell,
    },
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = Config {
        metadata_tool: cli.metadata_tool.clone(),
        delta_level: cli.delta_level,
        ..Config::new(cli.base_dir.clone())
    };

    // Held until the end of main, after finish()
    let _lock = match cli.command {
        Commands::Completions { .. } => None,
        _ => Some(BaseLock::acquire(&Layout::new(config.base_dir.clone()))?),
    };
    let mut session = Session::from_config(&config);

    match cli.command {
        Commands::CreateRepo { name } => {
            session.create_repository(&name)?;
            println!("Created repository: {}", name);
        }
        Commands::RemoveRepo { name } => {
            session.remove_repository(&name)?;
            println!("Removed repository: {}", name);
        }
        Commands::Add { repo, packages } => {
            let report = session.add_artifacts(&repo, &packages)?;
            println!(
                "Added {} package(s) to {} ({} already present, {} deltas skipped)",
                report.added.len(),
                repo,
                report.already_present.len(),
                report.deltas_skipped.len()
            );
        }
        Commands::RemoveSource { repo, sources } => {
            let removed = session.remove_sources(&repo, &sources)?;
            for filename in &removed {
                println!("Removed {}", filename);
            }
        }
        Commands::Delta { repo } => {
            let report = session.delta(&repo)?;
            println!(
                "{}: {} delta(s) linked, {} stale delta(s) removed",
                repo,
                report.linked.len(),
                report.pruned.len()
            );
        }
        Commands::Clone {
            src,
            dest,
            all_versions,
        } => {
            let report = session.clone_repository(&src, &dest, all_versions)?;
            println!("Cloned {} into {}: {} package(s)", src, dest, report.copied.len());
        }
        Commands::CopySource {
            src,
            dest,
            sources,
            all_versions,
        } => {
            let report = session.copy_sources(&src, &dest, &sources, all_versions)?;
            println!(
                "Copied {} package(s) from {} to {} ({} skipped)",
                report.copied.len(),
                src,
                dest,
                report.skipped.len()
            );
        }
        Commands::Pull { clone, origin } => {
            let report = session.pull(&clone, &origin)?;
            if report.is_up_to_date() {
                println!("Everything up to date");
            }
            for update in &report.updates {
                match update.from_release {
                    Some(old) => println!(
                        "Updated {}: {} -> {}-{}",
                        update.source, old, update.version, update.to_release
                    ),
                    None => println!("New {}: {}-{}", update.source, update.version, update.to_release),
                }
            }
        }
        Commands::ListRepos => {
            let repos = session.list_repositories()?;
            if repos.is_empty() {
                println!("No repositories found.");
            }
            for repo in repos {
                println!("{}", repo);
            }
        }
        Commands::Verify { repo, checksums } => {
            let report = session.verify(repo.as_deref(), checksums)?;
            for repo in &report.repositories {
                if repo.is_consistent() {
                    println!("{}: OK", repo.repository);
                    continue;
                }
                println!("{}: INCONSISTENT", repo.repository);
                for name in &repo.missing {
                    println!("  missing: {}", name);
                }
                for name in &repo.unpooled {
                    println!("  not pooled: {}", name);
                }
                for path in &repo.untracked {
                    println!("  untracked: {}", path.display());
                }
                for path in &repo.unbacked_deltas {
                    println!("  unbacked delta: {}", path.display());
                }
                for name in &repo.checksum_mismatches {
                    println!("  checksum mismatch: {}", name);
                }
            }
            for orphan in &report.orphans {
                println!("orphaned pool file: {}", orphan);
            }
            if !report.is_consistent() {
                anyhow::bail!("Verification found inconsistencies");
            }
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "pkgpool", &mut io::stdout());
            return Ok(());
        }
    }

    let indexes = session.finish()?;
    for index in &indexes {
        info!("Wrote index {}", index.display());
    }

    Ok(())
}

//! sdcardfs-perms - Inspect and apply derived shared-storage permissions
//!
//! Usage:
//!   sdcardfs-perms init                  - Write a default mount config
//!   sdcardfs-perms classify <path>       - Show the derivation along a path
//!   sdcardfs-perms scan <lower_root>     - Derive a whole lower tree
//!   sdcardfs-perms obb                   - Check the global OBB directory
//!   sdcardfs-perms packages              - Dump the package list

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sdcardfs_perms::{
    config::MountConfig,
    derived::{
        derive, is_base_obb_anchor, is_obb_anchor, resolve_class, target_owner, DerivedPermissions,
        DerivedState,
    },
    lower::{HostFs, LowerFs},
    packages::{AppIdRegistry, PackageList},
    tree::{Node, NodeTree, ROOT_ID},
};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "sdcardfs-perms")]
#[command(author = "sdcardfs-perms Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Derived ownership for emulated Android shared storage")]
struct Cli {
    /// Mount configuration file path
    #[arg(short, long, default_value = "~/.config/sdcardfs-perms/config.json")]
    config: PathBuf,

    /// Package list (JSON, or Android packages.list format)
    #[arg(short, long)]
    packages: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default mount configuration
    Init {
        /// Single-user layout: the root is one user's storage
        #[arg(long)]
        single_user: bool,

        /// Global OBB directory
        #[arg(long)]
        obb_path: Option<String>,
    },

    /// Show the derived state of every component of an overlay path
    Classify {
        /// Path relative to the overlay root, e.g. 0/Android/data/com.foo
        path: PathBuf,

        /// Treat the last component as a regular file
        #[arg(long)]
        file: bool,
    },

    /// Derive permissions for an existing lower tree
    Scan {
        /// Lower directory backing the overlay root
        lower_root: PathBuf,

        /// Write the derived owners onto the lower tree
        #[arg(long)]
        apply: bool,
    },

    /// Check that the global OBB directory resolves
    Obb,

    /// Print the package list
    Packages,
}

fn main() {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let result = if std::env::var("RUST_LOG").is_ok() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    };
    if let Err(e) = result {
        eprintln!("Failed to set subscriber: {}", e);
    }

    let config_path = expand_tilde(&cli.config);

    if let Err(e) = run_command(cli.command, &config_path, cli.packages.as_deref()) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path, packages: Option<&Path>) -> Result<()> {
    match command {
        Commands::Init {
            single_user,
            obb_path,
        } => cmd_init(config_path, single_user, obb_path),

        Commands::Classify { path, file } => {
            let config = load_config(config_path)?;
            let registry = load_packages(packages)?;
            cmd_classify(&config, &registry, &path, file)
        }

        Commands::Scan { lower_root, apply } => {
            let config = load_config(config_path)?;
            let registry = load_packages(packages)?;
            cmd_scan(config, registry, &lower_root, apply)
        }

        Commands::Obb => cmd_obb(&load_config(config_path)?),

        Commands::Packages => cmd_packages(&load_packages(packages)?),
    }
}

fn load_config(path: &Path) -> Result<MountConfig> {
    if path.exists() {
        MountConfig::load(path).with_context(|| format!("loading {}", path.display()))
    } else {
        info!("No config at {:?}, using defaults", path);
        Ok(MountConfig::from_env()?)
    }
}

fn load_packages(path: Option<&Path>) -> Result<PackageList> {
    let path = match path {
        Some(path) => path,
        None => return Ok(PackageList::new()),
    };

    let list = if path.extension().map_or(false, |e| e == "json") {
        PackageList::load(path)?
    } else {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        PackageList::parse_packages_list(&text)?
    };

    info!(
        "Loaded {} packages, {} extensions from {:?}",
        list.package_count(),
        list.extension_count(),
        path
    );
    Ok(list)
}

fn cmd_init(config_path: &Path, single_user: bool, obb_path: Option<String>) -> Result<()> {
    let mut config = MountConfig::default();
    config.multiuser_enabled = !single_user;
    if let Some(obb_path) = obb_path {
        config.global_obb_path = obb_path;
    }
    config.validate()?;

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save(config_path)?;

    info!("Configuration saved to {:?}", config_path);
    Ok(())
}

fn cmd_classify(
    config: &MountConfig,
    registry: &dyn AppIdRegistry,
    path: &Path,
    file: bool,
) -> Result<()> {
    let names: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();

    let mut state = config.root_state();
    let mut current = PathBuf::from("/");
    print_row("/", &state, config.fallback_uid, config.fallback_gid, "");

    for (i, name) in names.iter().enumerate() {
        let mut notes = Vec::new();
        if is_obb_anchor(&state, name, config) {
            notes.push("redirect");
        }
        if is_base_obb_anchor(&state, name, config) {
            notes.push("base-obb");
        }

        state = derive(&state, name, registry);
        current.push(name);

        let is_dir = !(file && i + 1 == names.len());
        let (uid, gid) = target_owner(&state, is_dir, name, config, registry);
        print_row(&current.to_string_lossy(), &state, uid, gid, &notes.join(","));
    }

    Ok(())
}

fn print_row(
    path: &str,
    state: &DerivedState,
    uid: u32,
    gid: u32,
    notes: &str,
) {
    println!(
        "{:<48} {:<22} {:<22} user={:<4} app={:<8} -> {}:{} {}",
        path,
        state.class,
        resolve_class(state),
        state.owner_user,
        state.owner_uid,
        uid,
        gid,
        notes
    );
}

fn cmd_scan(
    mut config: MountConfig,
    registry: PackageList,
    lower_root: &Path,
    apply: bool,
) -> Result<()> {
    let lower = HostFs::new();
    let lower_root = lower
        .resolve_dir(lower_root)
        .with_context(|| format!("{} is not a directory", lower_root.display()))?;

    if apply && !config.gid_derivation_enabled {
        bail!("gid derivation is disabled in the mount config; refusing to apply");
    }
    // Dry runs derive without touching the lower tree
    let dry_run = !apply;
    if dry_run {
        config.gid_derivation_enabled = false;
    }

    let perms = DerivedPermissions::new(
        config,
        Arc::new(registry),
        Arc::new(lower),
        lower_root.clone(),
    );

    let created = perms.populate(ROOT_ID)?;
    info!("Derived {} nodes below {:?}", created, lower_root);

    print_tree(&perms, perms.tree(), &perms.tree().root())?;

    if apply {
        info!("Applied derived ownership to {:?}", lower_root);
    }
    Ok(())
}

fn print_tree(perms: &DerivedPermissions, tree: &NodeTree, node: &Node) -> Result<()> {
    for child in tree.children_of(node.id()) {
        let state = child.state();
        let (uid, gid) = target_owner(
            &state,
            child.is_dir(),
            &child.name(),
            perms.config(),
            perms.registry(),
        );
        let bound = perms.redirect_of(&child);
        let note = bound
            .redirected_path()
            .map(|p| format!("=> {}", p.display()))
            .unwrap_or_default();
        print_row(&tree.path_of(child.id())?.to_string_lossy(), &state, uid, gid, &note);

        if child.is_dir() {
            print_tree(perms, tree, &child)?;
        }
    }
    Ok(())
}

fn cmd_obb(config: &MountConfig) -> Result<()> {
    let lower = HostFs::new();
    match lower.resolve_dir(&config.global_obb_path()) {
        Ok(resolved) => {
            println!("Global OBB directory: {}", resolved.display());
            if resolved.to_string_lossy() != config.global_obb_path {
                println!(
                    "Note: configured as {}; bindings compare against the configured path",
                    config.global_obb_path
                );
            }
            Ok(())
        }
        Err(e) => bail!("global OBB directory {} is not available: {}", config.global_obb_path, e),
    }
}

fn cmd_packages(registry: &PackageList) -> Result<()> {
    let file = registry.to_file();

    println!("Packages ({})", file.packages.len());
    for (name, appid) in &file.packages {
        println!("  {:<48} {}", name, appid);
    }

    println!("Extensions ({})", file.extensions.len());
    for (ext, gid) in &file.extensions {
        println!("  {:<48} {}", ext, gid);
    }

    Ok(())
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

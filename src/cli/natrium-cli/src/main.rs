//! Natrium CLI - Inspect bundles and load native libraries.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use natrium_loader::{
    bundled_library_path, BindingTarget, BindingTargetSet, ExitCleanupGuard, LoadMode,
    LoaderConfig, ResourceAnchor, ResourceMaterializer, ResourceResolver,
};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// ============================================================================
// CLI Structure
// ============================================================================

#[derive(Parser)]
#[command(name = "natrium")]
#[command(about = "Natrium - Locate, extract and load native libraries")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the bundled resource path for this platform
    Platform {
        /// Library name without prefix or extension
        #[arg(long, default_value = "sodium")]
        name: String,
    },
    /// Extract a resource and print where it landed
    Inspect {
        /// Resource path inside the bundle
        resource: String,
        /// Expanded resource directory
        #[arg(long)]
        resource_dir: Option<PathBuf>,
        /// Resource bundle (.tar.gz)
        #[arg(long, conflicts_with = "resource_dir")]
        archive: Option<PathBuf>,
    },
    /// Load a library and bind symbols against it
    Load {
        /// Loader configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Load mode (prefer-system, prefer-bundled, system-only, bundled-only)
        #[arg(long)]
        mode: Option<LoadMode>,
        /// System library name
        #[arg(long)]
        system_name: Option<String>,
        /// Bundled resource path
        #[arg(long)]
        resource: Option<String>,
        /// Expanded resource directory
        #[arg(long)]
        resource_dir: Option<PathBuf>,
        /// Resource bundle (.tar.gz)
        #[arg(long, conflicts_with = "resource_dir")]
        archive: Option<PathBuf>,
        /// Binding target name
        #[arg(long, default_value = "natrium-cli")]
        target: String,
        /// Symbol the library must export
        #[arg(long = "symbol", required = true)]
        symbols: Vec<String>,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Platform { .. } => "platform",
            Commands::Inspect { .. } => "inspect",
            Commands::Load { .. } => "load",
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_platform(name: &str) -> Result<()> {
    println!("{}", bundled_library_path(name)?);
    Ok(())
}

fn cmd_inspect(
    resource: &str,
    resource_dir: Option<PathBuf>,
    archive: Option<PathBuf>,
) -> Result<()> {
    let anchor = archive
        .map(ResourceAnchor::Archive)
        .or(resource_dir.map(ResourceAnchor::Directory));
    let materializer = ResourceMaterializer::new(ResourceResolver::standard(anchor));

    let artifact = materializer
        .materialize(resource)
        .with_context(|| format!("Failed to extract {resource}"))?;

    println!("Resource:  {}", artifact.resource());
    println!("Path:      {}", artifact.path().display());
    println!("Kind:      {:?}", artifact.kind());
    println!("Size:      {} bytes", artifact.len());
    if let Some(digest) = artifact.sha256_hex() {
        println!("SHA-256:   {digest}");
    }
    Ok(())
}

struct LoadArgs {
    config: Option<PathBuf>,
    mode: Option<LoadMode>,
    system_name: Option<String>,
    resource: Option<String>,
    resource_dir: Option<PathBuf>,
    archive: Option<PathBuf>,
    target: String,
    symbols: Vec<String>,
}

fn cmd_load(args: LoadArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => LoaderConfig::from_file(path)?,
        None => LoaderConfig::default(),
    }
    .with_env_overrides()?;

    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if args.system_name.is_some() {
        config.system_library = args.system_name;
    }
    if args.resource.is_some() {
        config.bundled_resource = args.resource;
    }
    if args.resource_dir.is_some() {
        config.resource_dir = args.resource_dir;
        config.resource_archive = None;
    }
    if args.archive.is_some() {
        config.resource_archive = args.archive;
        config.resource_dir = None;
    }
    if config.system_library.is_none() && config.bundled_resource.is_none() {
        bail!("Nothing to load. Use --system-name or --resource");
    }

    let targets = BindingTargetSet::new().with(BindingTarget::new(args.target, args.symbols));
    let loader = config.builder()?.build();
    let loaded = loader.load(config.mode, &targets)?;

    println!("Loaded:    {}", loaded.origin());
    println!("Resolved:  {}", loaded.resolved().display());
    if let Some(strategy) = loaded.strategy() {
        println!("Strategy:  {strategy}");
    }
    if let Some(policy) = loaded.deletion_policy() {
        println!("Deletion:  {policy:?}");
    }
    if !loaded.failures().is_empty() {
        println!("Previous failures:");
        for failure in loaded.failures() {
            println!("  {failure}");
        }
    }
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let _cleanup = ExitCleanupGuard::new();
    let cli = Cli::parse();
    debug!(command = cli.command.name(), "Running command");

    match cli.command {
        Commands::Platform { name } => cmd_platform(&name),
        Commands::Inspect {
            resource,
            resource_dir,
            archive,
        } => cmd_inspect(&resource, resource_dir, archive),
        Commands::Load {
            config,
            mode,
            system_name,
            resource,
            resource_dir,
            archive,
            target,
            symbols,
        } => cmd_load(LoadArgs {
            config,
            mode,
            system_name,
            resource,
            resource_dir,
            archive,
            target,
            symbols,
        }),
    }
}

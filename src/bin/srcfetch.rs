//! srcfetch CLI
//!
//! Usage:
//!   srcfetch build [PKG...]               Fetch, verify, unpack, patch, build, install
//!   srcfetch fetch [PKG...]               Fetch and verify only
//!   srcfetch status [PKG...]              Show the pipeline state of each package
//!   srcfetch hash FILE                    Print checksums of a file
//!   srcfetch verify FILE CHECKSUM         Check a file against a checksum
//!   srcfetch unpack ARCHIVE DIR           Unpack an archive
//!   srcfetch patch PATCH_DIR TARGET       Apply a directory of patches

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use srcfetch::acquire::hash::compute_all_hashes;
use srcfetch::acquire::verify::{self, Verification};
use srcfetch::build::{PatchApplier, PatchPolicy, Unpacked, unpack};
use srcfetch::core::interrupt;
use srcfetch::{Checksum, HashAlgorithm, Interrupt, Manifest, PackageCache, VerifyMode, output};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "srcfetch")]
#[command(about = "Idempotent source fetch, verify and build cache")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Package manifest
    #[arg(short, long, global = true, default_value = "srcfetch.toml")]
    manifest: PathBuf,

    /// Override the shared source cache directory
    #[arg(long, global = true, env = "SRCFETCH_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Override the per-package work directory
    #[arg(long, global = true, env = "SRCFETCH_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline (all packages if none given)
    Build {
        packages: Vec<String>,

        /// Start every selected package over from scratch
        #[arg(long)]
        rebuild_all: bool,

        /// Start this package over from scratch (repeatable)
        #[arg(long, value_name = "PKG")]
        rebuild: Vec<String>,
    },

    /// Fetch and verify sources without building
    Fetch { packages: Vec<String> },

    /// Show the recorded state of packages
    Status { packages: Vec<String> },

    /// Print SHA256, SHA512 and BLAKE3 of a file
    Hash {
        file: PathBuf,

        /// raw, tar-content or decompressed
        #[arg(long, default_value = "raw")]
        mode: VerifyMode,
    },

    /// Verify a file against "<algorithm>:<hex>"
    Verify {
        file: PathBuf,
        checksum: Checksum,

        #[arg(long, default_value = "raw")]
        mode: VerifyMode,
    },

    /// Unpack an archive into a directory
    Unpack { archive: PathBuf, dir: PathBuf },

    /// Apply every *.patch of a directory in name order
    Patch {
        patch_dir: PathBuf,
        target: PathBuf,

        /// Leading path components to strip
        #[arg(short = 'p', long, default_value_t = 1)]
        strip: u32,

        /// Revert applied patches if any fails
        #[arg(long)]
        all_or_nothing: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match cli.verbose {
        0 => EnvFilter::new("srcfetch=warn"),
        1 => EnvFilter::new("srcfetch=info"),
        _ => EnvFilter::new("srcfetch=debug"),
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = interrupt::install_handlers() {
        output::warning(&e.to_string());
    }

    let result = run(cli);

    if let Some(signal) = interrupt::pending_signal() {
        output::error(&format!("interrupted by signal {}", signal));
        return ExitCode::from(interrupt::exit_status(signal));
    }
    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            output::error(&format!("{:#}", e));
            failure_code(&e)
        }
    }
}

/// Exit status of a failed external command, else 1.
fn failure_code(e: &anyhow::Error) -> ExitCode {
    match e.downcast_ref::<srcfetch::Error>() {
        Some(srcfetch::Error::CommandFailed {
            code: Some(code), ..
        }) => u8::try_from(*code)
            .ok()
            .filter(|c| *c != 0)
            .map(ExitCode::from)
            .unwrap_or(ExitCode::FAILURE),
        _ => ExitCode::FAILURE,
    }
}

/// Returns `Ok(false)` for a clean "no" answer (e.g. a checksum mismatch).
fn run(cli: Cli) -> Result<bool> {
    match cli.command {
        Commands::Build {
            packages,
            rebuild_all,
            rebuild,
        } => {
            let manifest = load_manifest(&cli.manifest, cli.cache_dir, cli.work_dir)?;
            let cache = PackageCache::from_manifest(&manifest, Interrupt::new());
            let selected = manifest.select(&packages)?;

            let total = selected.len();
            for (i, pkg) in selected.into_iter().enumerate() {
                output::action_numbered(i + 1, total, &format!("{} {}", pkg.name, pkg.version));
                let fresh = rebuild_all || rebuild.contains(&pkg.name);
                cache
                    .build(pkg, fresh)
                    .with_context(|| format!("{} {}", pkg.name, pkg.version))?;
            }
            output::success(&format!("{} package(s) ready", total));
        }

        Commands::Fetch { packages } => {
            let manifest = load_manifest(&cli.manifest, cli.cache_dir, cli.work_dir)?;
            let cache = PackageCache::from_manifest(&manifest, Interrupt::new());
            let selected = manifest.select(&packages)?;

            let total = selected.len();
            for (i, pkg) in selected.into_iter().enumerate() {
                output::action_numbered(i + 1, total, &format!("Fetching {}", pkg.name));
                cache
                    .fetch(pkg)
                    .with_context(|| format!("{} {}", pkg.name, pkg.version))?;
            }
            output::success(&format!(
                "{} source(s) in {}",
                total,
                cache.fetcher().cache_dir().display()
            ));
        }

        Commands::Status { packages } => {
            let manifest = load_manifest(&cli.manifest, cli.cache_dir, cli.work_dir)?;
            let cache = PackageCache::from_manifest(&manifest, Interrupt::new());
            output::action("Package status");
            for pkg in manifest.select(&packages)? {
                let status = cache.status(pkg)?;
                output::list_item(
                    &format!("{} {}", pkg.name, pkg.version),
                    status.state.as_str(),
                    status.state == srcfetch::PackageState::Installed,
                );
            }
        }

        Commands::Hash { file, mode } => {
            if !file.exists() {
                anyhow::bail!("file not found: {}", file.display());
            }
            if mode == VerifyMode::Raw {
                let hashes = compute_all_hashes(&file)?;
                println!("sha256:{}", hashes.sha256);
                println!("sha512:{}", hashes.sha512);
                println!("blake3:{}", hashes.blake3);
            } else {
                for algorithm in [
                    HashAlgorithm::Sha256,
                    HashAlgorithm::Sha512,
                    HashAlgorithm::Blake3,
                ] {
                    let value = verify::compute(&file, algorithm, mode)?;
                    println!("{}", Checksum::new(algorithm, value));
                }
            }
        }

        Commands::Verify {
            file,
            checksum,
            mode,
        } => match verify::verify(&file, &checksum, mode)? {
            Verification::Match { .. } => {
                output::success(&format!("{} OK", file.display()));
            }
            Verification::Mismatch { expected, actual } => {
                output::error(&format!(
                    "{} does not match\n  expected: {}\n  got:      {}",
                    file.display(),
                    expected,
                    actual
                ));
                return Ok(false);
            }
            Verification::Missing => {
                output::error(&format!("{} does not exist", file.display()));
                return Ok(false);
            }
        },

        Commands::Unpack { archive, dir } => match unpack(&archive, &dir)? {
            Unpacked::AlreadyPresent => {
                output::skip(&format!("{} already exists", dir.display()));
            }
            Unpacked::Extracted {
                format,
                promoted_root,
            } => {
                debug!(?format, ?promoted_root, "unpacked");
                output::success(&format!("unpacked into {}", dir.display()));
            }
        },

        Commands::Patch {
            patch_dir,
            target,
            strip,
            all_or_nothing,
        } => {
            let policy = if all_or_nothing {
                PatchPolicy::AllOrNothing
            } else {
                PatchPolicy::BestEffort
            };
            let report = PatchApplier::new(strip)
                .policy(policy)
                .apply_all(&patch_dir, &target)?;
            output::info(&format!(
                "{} applied, {} failed, {} reverted",
                report.applied.len(),
                report.failed.len(),
                report.reverted.len()
            ));
            report.into_result()?;
        }
    }
    Ok(true)
}

fn load_manifest(
    path: &Path,
    cache_dir: Option<PathBuf>,
    work_dir: Option<PathBuf>,
) -> Result<Manifest> {
    let mut manifest = Manifest::load(path)
        .with_context(|| format!("cannot load manifest {}", path.display()))?;
    // overrides are relative to the working directory, not the manifest
    if let Some(dir) = cache_dir {
        manifest.settings.cache_dir = Some(std::path::absolute(&dir)?);
    }
    if let Some(dir) = work_dir {
        manifest.settings.work_dir = Some(std::path::absolute(&dir)?);
    }
    Ok(manifest)
}

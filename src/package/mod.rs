//! Per-package pipeline: fetch, verify, unpack, patch, build, install
//!
//! Every package owns `<work_dir>/<name>-<version>/`, holding the link to
//! its cached source, the unpacked `src/` tree, an optional `build/` tree
//! and the status record. Each stage runs only when the record says it has
//! not completed yet, so re-running a finished pipeline does nothing.

pub mod manifest;
pub mod state;

pub use manifest::{Manifest, PackageSpec, Settings};
pub use state::{PackageState, PackageStatus};

use crate::acquire::fetcher::{FetchRequest, Fetcher};
use crate::acquire::retry::RetryPolicy;
use crate::acquire::verify::verify_or_fail;
use crate::build::extract::unpack;
use crate::build::patch::PatchApplier;
use crate::build::steps::StepRunner;
use crate::core::interrupt::Interrupt;
use crate::core::lock::acquire_lock;
use crate::core::output;
use crate::error::{IoContext, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Drives packages through their states
#[derive(Debug, Clone)]
pub struct PackageCache {
    fetcher: Fetcher,
    work_dir: PathBuf,
    base_dir: PathBuf,
    patcher: PatchApplier,
    prefix: PathBuf,
    target: String,
    jobs: usize,
    interrupt: Interrupt,
}

impl PackageCache {
    pub fn new(fetcher: Fetcher, work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        Self {
            fetcher,
            prefix: work_dir.join("prefix"),
            base_dir: PathBuf::from("."),
            work_dir,
            patcher: PatchApplier::default(),
            target: String::new(),
            jobs: 0,
            interrupt: Interrupt::new(),
        }
    }

    /// Cache configured from the manifest's `[settings]`.
    pub fn from_manifest(manifest: &Manifest, interrupt: Interrupt) -> Self {
        let settings = &manifest.settings;
        let fetcher = Fetcher::new(manifest.cache_dir())
            .retry(RetryPolicy::new(
                settings.retry_attempts,
                Duration::from_secs(settings.retry_delay_secs),
            ))
            .interrupt(interrupt.clone());

        let mut cache = Self::new(fetcher, manifest.work_dir())
            .base_dir(&manifest.base_dir)
            .patcher(PatchApplier::new(settings.patch_strip).policy(settings.patch_policy))
            .jobs(settings.jobs)
            .interrupt(interrupt);
        if let Some(prefix) = &settings.prefix {
            cache = cache.prefix(manifest.resolve(prefix));
        }
        if let Some(target) = &settings.target {
            cache = cache.target(target.clone());
        }
        cache
    }

    /// Directory relative patch paths resolve against.
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    pub fn patcher(mut self, patcher: PatchApplier) -> Self {
        self.patcher = patcher;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn package_dir(&self, pkg: &PackageSpec) -> PathBuf {
        self.work_dir.join(pkg.dir_name())
    }

    /// Persisted state of `pkg`.
    pub fn status(&self, pkg: &PackageSpec) -> Result<PackageStatus> {
        PackageStatus::read(&self.package_dir(pkg), &pkg.name, &pkg.version, &pkg.key()?)
    }

    /// Bring `pkg` up to `Verified`.
    pub fn fetch(&self, pkg: &PackageSpec) -> Result<PackageState> {
        self.run(pkg, PackageState::Verified, false)
    }

    /// Bring `pkg` up to `Installed`; `rebuild` starts over from scratch.
    pub fn build(&self, pkg: &PackageSpec, rebuild: bool) -> Result<PackageState> {
        self.run(pkg, PackageState::Installed, rebuild)
    }

    fn run(&self, pkg: &PackageSpec, goal: PackageState, rebuild: bool) -> Result<PackageState> {
        let key = pkg.key()?;
        let source = pkg.source()?;
        let dir = self.package_dir(pkg);
        std::fs::create_dir_all(&dir).io_context(|| format!("cannot create {}", dir.display()))?;
        let _lock = acquire_lock(&dir.join(".lock"), &format!("package {}", pkg.name))?;

        if rebuild {
            self.reset(pkg, &dir)?;
        }

        let mut status = PackageStatus::read(&dir, &pkg.name, &pkg.version, &key)?;
        if status.state >= goal {
            output::skip(&format!("{} {} is {}", pkg.name, pkg.version, status.state));
            return Ok(status.state);
        }

        let cache_path = self.fetcher.cache_path(&key);
        if status.state >= PackageState::Fetched && !cache_path.exists() {
            output::warning(&format!("{} vanished from the cache, fetching again", key));
            status.state = PackageState::NotFetched;
        }

        let src = dir.join("src");

        if status.state < PackageState::Fetched {
            let request = FetchRequest {
                source,
                key: key.clone(),
                target_dir: dir.clone(),
            };
            let fetched = self.fetcher.fetch(&request)?;
            debug!(package = %pkg.name, outcome = ?fetched.outcome, "fetched");
            status.advance(PackageState::Fetched, &dir)?;
        }

        if status.state < PackageState::Verified {
            match &pkg.checksum {
                Some(checksum) => verify_or_fail(&cache_path, checksum, pkg.verify)?,
                None => output::warning(&format!(
                    "{} has no checksum, skipping verification",
                    pkg.name
                )),
            }
            status.advance(PackageState::Verified, &dir)?;
        }
        if status.state >= goal {
            return Ok(status.state);
        }
        self.interrupt.check()?;

        if status.state < PackageState::Unpacked {
            if src.exists() {
                debug!(path = %src.display(), "removing stale source tree");
                remove_tree(&src)?;
            }
            unpack(&cache_path, &src)?;
            status.advance(PackageState::Unpacked, &dir)?;
        }

        if status.state < PackageState::Patched {
            if let Some(patch_dir) = pkg.patches.as_deref().map(|p| self.resolve(p)) {
                let report = self.patcher.apply_all(&patch_dir, &src)?;
                if !report.is_success() {
                    // next run starts again from a fresh tree
                    status.advance(PackageState::Verified, &dir)?;
                    report.into_result()?;
                }
            }
            status.advance(PackageState::Patched, &dir)?;
        }
        self.interrupt.check()?;

        let build_dir = if pkg.out_of_tree { dir.join("build") } else { src.clone() };
        let runner = self.runner(pkg, &src, &build_dir);

        if status.state < PackageState::Built {
            output::sub_action(&format!("Building {}", pkg.name));
            runner.run_all("build", &pkg.build)?;
            status.advance(PackageState::Built, &dir)?;
        }

        if status.state < PackageState::Installed {
            output::sub_action(&format!("Installing {}", pkg.name));
            runner.run_all("install", &pkg.install)?;
            status.advance(PackageState::Installed, &dir)?;
        }

        info!(package = %pkg.name, state = %status.state, "done");
        Ok(status.state)
    }

    /// Undo a previous build: run the uninstall hook, drop trees and record.
    fn reset(&self, pkg: &PackageSpec, dir: &Path) -> Result<()> {
        let src = dir.join("src");
        let build_dir = dir.join("build");

        if !pkg.uninstall.is_empty() && src.exists() {
            let work = if pkg.out_of_tree && build_dir.exists() { &build_dir } else { &src };
            if let Err(e) = self.runner(pkg, &src, work).run_all("uninstall", &pkg.uninstall) {
                output::warning(&format!("uninstall of {} failed: {}", pkg.name, e));
            }
        }

        for tree in [&src, &build_dir] {
            if tree.exists() {
                remove_tree(tree)?;
            }
        }
        PackageStatus::clear(dir)?;
        output::detail(&format!("reset {}", pkg.name));
        Ok(())
    }

    fn runner(&self, pkg: &PackageSpec, src: &Path, build_dir: &Path) -> StepRunner {
        let jobs = if self.jobs == 0 { num_cpus::get() } else { self.jobs };
        StepRunner::new(build_dir)
            .env("PREFIX", self.prefix.to_string_lossy())
            .env("TARGET", self.target.as_str())
            .env("NPROC", jobs.to_string())
            .env("SRC_DIR", src.to_string_lossy())
            .env("BUILD_DIR", build_dir.to_string_lossy())
            .env("CACHE_DIR", self.fetcher.cache_dir().to_string_lossy())
            .envs(pkg.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .diagnostic_logs(pkg.diagnostic_logs.iter().map(PathBuf::from))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

fn remove_tree(path: &Path) -> Result<()> {
    std::fs::remove_dir_all(path).io_context(|| format!("cannot remove {}", path.display()))
}

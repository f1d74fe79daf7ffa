//! Ordered patch application
//!
//! Every `*.patch` file of a directory is applied in file-name order with
//! the external `patch` tool. Each one is dry-run first and only committed
//! when the dry run succeeds, so a rejected patch never leaves half-applied
//! hunks behind.

use crate::core::output;
use crate::error::{Error, IoContext, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// What to do with already committed patches when a later one fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchPolicy {
    /// Keep what applied; report the failures
    #[default]
    BestEffort,
    /// Reverse every committed patch if any patch fails
    AllOrNothing,
}

/// Outcome of [`PatchApplier::apply_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub dir: PathBuf,
    pub applied: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
    /// Patches committed and then reversed under [`PatchPolicy::AllOrNothing`]
    pub reverted: Vec<PathBuf>,
}

impl PatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Turn a report with failures into [`Error::PatchFailed`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        Err(Error::PatchFailed {
            dir: self.dir,
            failed: self
                .failed
                .iter()
                .map(|p| file_name(p))
                .collect(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchApplier {
    strip: u32,
    policy: PatchPolicy,
}

impl Default for PatchApplier {
    fn default() -> Self {
        Self::new(1)
    }
}

impl PatchApplier {
    pub fn new(strip: u32) -> Self {
        Self {
            strip,
            policy: PatchPolicy::default(),
        }
    }

    pub fn policy(mut self, policy: PatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The `*.patch` files of `dir`, sorted by file name. A missing
    /// directory has no patches.
    pub fn patches(dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let pattern = format!(
            "{}/*.patch",
            glob::Pattern::escape(&dir.to_string_lossy())
        );
        let mut patches: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(|e| Error::InvalidArgument {
                what: "patch directory",
                value: format!("{}: {}", dir.display(), e),
            })?
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_file())
            .collect();
        patches.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(patches)
    }

    /// Apply every patch of `patch_dir` to `target_dir`.
    ///
    /// A failing patch is recorded and the remaining ones are still tried.
    /// Only failure to run `patch` at all is returned as an error; check
    /// the report (or call [`PatchReport::into_result`]) for rejections.
    pub fn apply_all(&self, patch_dir: &Path, target_dir: &Path) -> Result<PatchReport> {
        let mut report = PatchReport {
            dir: patch_dir.to_path_buf(),
            ..Default::default()
        };
        let patches = Self::patches(patch_dir)?;
        if patches.is_empty() {
            debug!(dir = %patch_dir.display(), "no patches");
            return Ok(report);
        }
        if !target_dir.is_dir() {
            return Err(Error::NotFound(target_dir.to_path_buf()));
        }

        output::sub_action(&format!(
            "Applying {} patch(es) from {}",
            patches.len(),
            patch_dir.display()
        ));

        for patch in patches {
            let patch = std::fs::canonicalize(&patch)
                .io_context(|| format!("cannot resolve {}", patch.display()))?;
            let name = file_name(&patch);

            if !self.run_patch(target_dir, &patch, &["--forward", "--dry-run"])? {
                output::warning(&format!("patch {} does not apply", name));
                report.failed.push(patch);
                continue;
            }
            if self.run_patch(target_dir, &patch, &["--forward"])? {
                output::detail(&format!("applied {}", name));
                report.applied.push(patch);
            } else {
                output::warning(&format!("patch {} failed after a clean dry run", name));
                report.failed.push(patch);
            }
        }

        if !report.failed.is_empty() && self.policy == PatchPolicy::AllOrNothing {
            self.revert(target_dir, &mut report)?;
        }

        Ok(report)
    }

    fn revert(&self, target_dir: &Path, report: &mut PatchReport) -> Result<()> {
        while let Some(patch) = report.applied.pop() {
            let name = file_name(&patch);
            if self.run_patch(target_dir, &patch, &["-R"])? {
                output::detail(&format!("reverted {}", name));
                report.reverted.push(patch);
            } else {
                // leave it listed as applied so the report stays truthful
                output::warning(&format!("could not revert {}", name));
                report.applied.push(patch);
                break;
            }
        }
        Ok(())
    }

    /// Run `patch` once; `Ok(false)` means the patch was rejected.
    fn run_patch(&self, target_dir: &Path, patch: &Path, extra: &[&str]) -> Result<bool> {
        let output = Command::new("patch")
            .current_dir(target_dir)
            .arg(format!("-p{}", self.strip))
            .arg("--batch")
            .args(extra)
            .arg("-i")
            .arg(patch)
            .stdin(Stdio::null())
            .output()
            .io_context(|| "failed to run patch")?;

        debug!(
            patch = %patch.display(),
            ?extra,
            code = ?output.status.code(),
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            "patch"
        );
        Ok(output.status.success())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Whether a usable `patch` binary is on PATH.
pub fn patch_available() -> bool {
    Command::new("patch")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GREETING: &str = "\
--- a/hello.txt
+++ b/hello.txt
@@ -1,2 +1,2 @@
-hello
+hello there
 world
";

    const FOLLOW_UP: &str = "\
--- a/hello.txt
+++ b/hello.txt
@@ -1,2 +1,2 @@
-hello there
+hello again
 world
";

    const BROKEN: &str = "\
--- a/hello.txt
+++ b/hello.txt
@@ -1,2 +1,2 @@
-goodbye
+farewell
 moon
";

    fn setup(patches: &[(&str, &str)]) -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let patch_dir = dir.path().join("patches");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(&patch_dir).unwrap();
        std::fs::write(src.join("hello.txt"), "hello\nworld\n").unwrap();
        for (name, body) in patches {
            std::fs::write(patch_dir.join(name), body).unwrap();
        }
        (dir, src, patch_dir)
    }

    #[test]
    fn test_patches_sorted_and_filtered() {
        let (_dir, _src, patch_dir) = setup(&[
            ("0002-b.patch", GREETING),
            ("0001-a.patch", GREETING),
            ("notes.txt", "ignore me"),
            ("0010-c.patch", GREETING),
        ]);
        let names: Vec<String> = PatchApplier::patches(&patch_dir)
            .unwrap()
            .iter()
            .map(|p| file_name(p))
            .collect();
        assert_eq!(names, vec!["0001-a.patch", "0002-b.patch", "0010-c.patch"]);
    }

    #[test]
    fn test_missing_dir_is_nothing_to_apply() {
        let dir = tempfile::tempdir().unwrap();
        let report = PatchApplier::new(1)
            .apply_all(&dir.path().join("none"), dir.path())
            .unwrap();
        assert!(report.is_success());
        assert!(report.applied.is_empty());
    }

    #[test]
    fn test_patches_applied_in_order() {
        if !patch_available() {
            return;
        }
        let (_dir, src, patch_dir) =
            setup(&[("0002-follow-up.patch", FOLLOW_UP), ("0001-greeting.patch", GREETING)]);

        let report = PatchApplier::new(1).apply_all(&patch_dir, &src).unwrap();

        assert!(report.is_success());
        assert_eq!(report.applied.len(), 2);
        assert_eq!(
            std::fs::read_to_string(src.join("hello.txt")).unwrap(),
            "hello again\nworld\n"
        );
    }

    #[test]
    fn test_best_effort_keeps_good_patch() {
        if !patch_available() {
            return;
        }
        let (_dir, src, patch_dir) =
            setup(&[("0001-broken.patch", BROKEN), ("0002-greeting.patch", GREETING)]);

        let report = PatchApplier::new(1).apply_all(&patch_dir, &src).unwrap();

        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(
            std::fs::read_to_string(src.join("hello.txt")).unwrap(),
            "hello there\nworld\n"
        );
        match report.into_result() {
            Err(Error::PatchFailed { failed, .. }) => {
                assert_eq!(failed, vec!["0001-broken.patch".to_string()])
            }
            other => panic!("expected PatchFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_all_or_nothing_reverts() {
        if !patch_available() {
            return;
        }
        let (_dir, src, patch_dir) =
            setup(&[("0001-greeting.patch", GREETING), ("0002-broken.patch", BROKEN)]);

        let report = PatchApplier::new(1)
            .policy(PatchPolicy::AllOrNothing)
            .apply_all(&patch_dir, &src)
            .unwrap();

        assert!(report.applied.is_empty());
        assert_eq!(report.reverted.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(
            std::fs::read_to_string(src.join("hello.txt")).unwrap(),
            "hello\nworld\n"
        );
    }

    #[test]
    fn test_dry_run_prevents_partial_hunks() {
        if !patch_available() {
            return;
        }
        let (_dir, src, patch_dir) = setup(&[]);
        std::fs::write(src.join("other.txt"), "one\ntwo\n").unwrap();
        // first file applies cleanly, second does not
        let mixed = format!(
            "{}{}",
            "--- a/other.txt\n+++ b/other.txt\n@@ -1,2 +1,2 @@\n-one\n+uno\n two\n",
            BROKEN
        );
        std::fs::write(patch_dir.join("0001-mixed.patch"), mixed).unwrap();

        let report = PatchApplier::new(1).apply_all(&patch_dir, &src).unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(std::fs::read_to_string(src.join("other.txt")).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn test_policy_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: PatchPolicy,
        }
        let w: Wrapper = toml::from_str("policy = \"all-or-nothing\"").unwrap();
        assert_eq!(w.policy, PatchPolicy::AllOrNothing);
    }
}

//! Pinned git checkouts
//!
//! Clones a repository into a scratch directory, checks out the pinned
//! revision with its submodules and strips all git metadata. The result is
//! a plain tree ready for [`ArchiveBuilder`](super::archive::ArchiveBuilder).
//! `git` runs as a child process that is killed when the interrupt fires.

use super::retry::RetryPolicy;
use crate::core::interrupt::Interrupt;
use crate::core::output;
use crate::core::progress::{ProgressGuard, create_spinner};
use crate::error::{Error, IoContext, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A checked-out tree living in a temp directory, removed on drop.
#[derive(Debug)]
pub struct Checkout {
    scratch: TempDir,
    /// Commit timestamp of the checked-out revision (seconds since epoch)
    pub commit_time: u64,
}

impl Checkout {
    pub fn tree(&self) -> PathBuf {
        self.scratch.path().join("tree")
    }
}

/// Validate that a URL uses a scheme git can fetch from.
///
/// Accepts https://, http://, ssh://, git://, git@ (scp-style SSH),
/// file:// and absolute local paths.
pub fn validate_git_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(Error::MissingParameter("git url"));
    }
    const SCHEMES: &[&str] = &["https://", "http://", "ssh://", "git://", "git@", "file://"];
    if SCHEMES.iter().any(|s| url.starts_with(s)) || Path::new(url).is_absolute() {
        Ok(())
    } else {
        Err(Error::InvalidArgument {
            what: "git URL (supported: https://, http://, ssh://, git://, git@, file://, absolute paths)",
            value: url.to_string(),
        })
    }
}

/// Repository name from a URL ("linux" from ".../torvalds/linux.git").
pub fn repo_name(url: &str) -> Option<String> {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed.rsplit(['/', ':']).next()?;
    let name = last.strip_suffix(".git").unwrap_or(last);
    (!name.is_empty()).then(|| name.to_string())
}

/// Clone `url`, check out `revision` with submodules and strip `.git`.
///
/// The clone is retried under `retry`; every attempt starts from an empty
/// directory. The scratch directory is created inside `scratch_parent`.
pub fn checkout(
    url: &str,
    revision: &str,
    scratch_parent: &Path,
    retry: &RetryPolicy,
    interrupt: &Interrupt,
) -> Result<Checkout> {
    validate_git_url(url)?;
    if revision.is_empty() {
        return Err(Error::MissingParameter("revision"));
    }

    let scratch = tempfile::Builder::new()
        .prefix(".git-checkout-")
        .tempdir_in(scratch_parent)
        .io_context(|| format!("cannot create scratch dir in {}", scratch_parent.display()))?;
    let tree = scratch.path().join("tree");
    let name = repo_name(url).unwrap_or_else(|| "repository".to_string());

    output::detail(&format!("git clone {}", url));
    {
        let _guard = ProgressGuard::new(create_spinner(&format!("cloning {}", name)));
        retry.run(&format!("git clone {}", name), interrupt, |_| {
            if tree.exists() {
                std::fs::remove_dir_all(&tree)
                    .io_context(|| format!("cannot clean {}", tree.display()))?;
            }
            let tree_arg = tree.to_string_lossy();
            run_git(&["clone", "--quiet", url, &tree_arg], None, interrupt).map(drop)
        })?;
    }

    output::detail(&format!("checking out {}", revision));
    run_git(&["checkout", "--quiet", revision], Some(&tree), interrupt)?;
    run_git(
        &["submodule", "update", "--init", "--recursive", "--quiet"],
        Some(&tree),
        interrupt,
    )?;

    let stamp = run_git(&["log", "-1", "--format=%ct"], Some(&tree), interrupt)?;
    let commit_time = stamp
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::InvalidArgument {
            what: "commit timestamp from git log",
            value: stamp.trim().to_string(),
        })?;
    debug!(url, revision, commit_time, "checked out");

    let removed = strip_git_metadata(&tree)?;
    debug!(removed, "stripped git metadata");

    Ok(Checkout {
        scratch,
        commit_time,
    })
}

/// Remove every `.git` file or directory below `tree`, returning how many
/// were removed. Submodules carry `.git` as a plain file.
pub fn strip_git_metadata(tree: &Path) -> Result<usize> {
    let mut found = Vec::new();
    let mut walker = WalkDir::new(tree).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| {
            Error::io(
                format!("cannot walk {}", tree.display()),
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
            )
        })?;
        if entry.file_name() == ".git" {
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            found.push((entry.path().to_path_buf(), entry.file_type().is_dir()));
        }
    }

    for (path, is_dir) in &found {
        let result = if *is_dir {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        };
        result.io_context(|| format!("cannot remove {}", path.display()))?;
    }
    Ok(found.len())
}

/// Run git to completion, returning its stdout.
///
/// Output goes to anonymous temp files so a chatty child can never block on
/// a full pipe while we poll for the interrupt.
fn run_git(args: &[&str], cwd: Option<&Path>, interrupt: &Interrupt) -> Result<String> {
    let mut stdout = tempfile::tempfile().io_context(|| "cannot create temp file")?;
    let mut stderr = tempfile::tempfile().io_context(|| "cannot create temp file")?;

    let mut cmd = Command::new("git");
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::from(
            stdout.try_clone().io_context(|| "cannot clone file handle")?,
        ))
        .stderr(Stdio::from(
            stderr.try_clone().io_context(|| "cannot clone file handle")?,
        ));

    let shown = format!("git {}", args.join(" "));
    debug!(cmd = %shown, "running");
    let mut child = cmd.spawn().io_context(|| "failed to run git")?;

    let status = loop {
        if let Some(status) = child.try_wait().io_context(|| "failed to wait for git")? {
            break status;
        }
        if interrupt.is_raised() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Interrupted);
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    if !status.success() {
        let errors = read_back(&mut stderr)?;
        return Err(Error::CommandFailed {
            cmd: shown,
            code: status.code(),
            diagnostics: errors
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
        });
    }

    read_back(&mut stdout)
}

fn read_back(file: &mut File) -> Result<String> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_string(&mut text))
        .io_context(|| "cannot read git output")?;
    Ok(text)
}

/// Whether a usable `git` binary is on PATH.
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Create a repository with one commit; returns (repo dir, commit hash).
    pub(crate) fn init_repo(root: &Path) -> (PathBuf, String) {
        let repo = root.join("upstream");
        std::fs::create_dir_all(repo.join("src")).unwrap();
        std::fs::write(repo.join("README"), "hello\n").unwrap();
        std::fs::write(repo.join("src/main.c"), "int main(void) { return 0; }\n").unwrap();

        let git = |args: &[&str]| {
            let status = Command::new("git")
                .current_dir(&repo)
                .args(args)
                .env("GIT_AUTHOR_NAME", "t")
                .env("GIT_AUTHOR_EMAIL", "t@example.com")
                .env("GIT_COMMITTER_NAME", "t")
                .env("GIT_COMMITTER_EMAIL", "t@example.com")
                .env("GIT_AUTHOR_DATE", "2024-01-01T00:00:00Z")
                .env("GIT_COMMITTER_DATE", "2024-01-01T00:00:00Z")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .unwrap();
            assert!(status.success(), "git {:?} failed", args);
        };
        git(&["init", "--quiet"]);
        git(&["add", "."]);
        git(&["commit", "--quiet", "-m", "initial"]);

        let out = Command::new("git")
            .current_dir(&repo)
            .args(["rev-parse", "HEAD"])
            .output()
            .unwrap();
        let rev = String::from_utf8(out.stdout).unwrap().trim().to_string();
        (repo, rev)
    }

    #[test]
    fn test_validate_git_url() {
        assert!(validate_git_url("https://github.com/madler/zlib.git").is_ok());
        assert!(validate_git_url("git@github.com:madler/zlib.git").is_ok());
        assert!(validate_git_url("ssh://git@example.com/repo.git").is_ok());
        assert!(validate_git_url("git://sourceware.org/git/binutils-gdb.git").is_ok());
        assert!(validate_git_url("file:///srv/git/repo").is_ok());
        assert!(validate_git_url("/srv/git/repo").is_ok());
        assert!(validate_git_url("relative/repo").is_err());
        assert!(validate_git_url("ftp://example.com/repo").is_err());
        assert!(matches!(
            validate_git_url(""),
            Err(Error::MissingParameter(_))
        ));
    }

    #[test]
    fn test_repo_name() {
        assert_eq!(
            repo_name("https://github.com/torvalds/linux.git"),
            Some("linux".to_string())
        );
        assert_eq!(
            repo_name("git@github.com:user/repo.git"),
            Some("repo".to_string())
        );
        assert_eq!(repo_name("/srv/git/musl/"), Some("musl".to_string()));
    }

    #[test]
    fn test_strip_git_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path();
        std::fs::create_dir_all(tree.join(".git/objects")).unwrap();
        std::fs::write(tree.join(".git/HEAD"), "ref").unwrap();
        std::fs::create_dir_all(tree.join("sub")).unwrap();
        std::fs::write(tree.join("sub/.git"), "gitdir: ../.git/modules/sub").unwrap();
        std::fs::write(tree.join("sub/file.c"), "x").unwrap();

        assert_eq!(strip_git_metadata(tree).unwrap(), 2);
        assert!(!tree.join(".git").exists());
        assert!(!tree.join("sub/.git").exists());
        assert!(tree.join("sub/file.c").exists());
    }

    #[test]
    fn test_checkout_pinned_revision() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (repo, rev) = init_repo(dir.path());

        let checkout = checkout(
            repo.to_str().unwrap(),
            &rev,
            dir.path(),
            &RetryPolicy::ONCE,
            &Interrupt::new(),
        )
        .unwrap();

        let tree = checkout.tree();
        assert_eq!(std::fs::read_to_string(tree.join("README")).unwrap(), "hello\n");
        assert!(tree.join("src/main.c").exists());
        assert!(!tree.join(".git").exists());
        // 2024-01-01T00:00:00Z
        assert_eq!(checkout.commit_time, 1_704_067_200);

        let scratch = checkout.scratch.path().to_path_buf();
        drop(checkout);
        assert!(!scratch.exists());
    }

    #[test]
    fn test_checkout_unknown_revision_fails() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (repo, _) = init_repo(dir.path());

        let err = checkout(
            repo.to_str().unwrap(),
            "0000000000000000000000000000000000000000",
            dir.path(),
            &RetryPolicy::ONCE,
            &Interrupt::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
    }

    #[test]
    fn test_checkout_requires_revision() {
        let dir = tempfile::tempdir().unwrap();
        let err = checkout(
            "https://example.com/repo.git",
            "",
            dir.path(),
            &RetryPolicy::ONCE,
            &Interrupt::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::MissingParameter("revision")));
    }
}

//! Archive unpacking
//!
//! Archives are extracted into a scratch directory next to the target and
//! then moved into place with a rename, so the target either does not exist
//! or holds a complete tree. A single top-level directory (the usual
//! `pkg-1.0/` layout) becomes the target itself; anything else is moved in
//! as a whole.
//!
//! Extraction refuses entries that could write outside the destination:
//! absolute or `..` paths, writes through symlinks created earlier in the
//! same archive, and link targets that escape the tree.

use super::codec::{ArchiveFormat, Compression};
use crate::core::output;
use crate::core::progress::{ProgressGuard, create_spinner};
use crate::error::{Error, IoContext, Result};
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Result of [`unpack`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unpacked {
    /// The target directory existed; nothing was done
    AlreadyPresent,
    Extracted {
        format: ArchiveFormat,
        /// Name of the single top-level directory that became the target
        promoted_root: Option<String>,
    },
}

/// Unpack `archive` so that its contents end up at `target`.
pub fn unpack(archive: &Path, target: &Path) -> Result<Unpacked> {
    if target.exists() {
        debug!(target = %target.display(), "already unpacked");
        return Ok(Unpacked::AlreadyPresent);
    }
    if !archive.exists() {
        return Err(Error::NotFound(archive.to_path_buf()));
    }

    let format = ArchiveFormat::detect(archive)?;
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)
        .io_context(|| format!("cannot create directory {}", parent.display()))?;

    let scratch = tempfile::Builder::new()
        .prefix(".unpack-")
        .tempdir_in(&parent)
        .io_context(|| format!("cannot create scratch dir in {}", parent.display()))?;
    let stage = scratch.path().join("stage");
    std::fs::create_dir(&stage).io_context(|| format!("cannot create {}", stage.display()))?;

    let filename = archive
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "archive".to_string());
    {
        let _guard = ProgressGuard::new(create_spinner(&format!("extracting {}", filename)));
        match format {
            ArchiveFormat::Tar(compression) => {
                extract_tar(open_tar(archive, compression)?, &stage)?
            }
            ArchiveFormat::Zip => extract_zip(archive, &stage)?,
        }
    }

    let mut top_level: Vec<PathBuf> = std::fs::read_dir(&stage)
        .io_context(|| format!("cannot read {}", stage.display()))?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<_>>()
        .io_context(|| format!("cannot read {}", stage.display()))?;
    top_level.sort();

    let promoted_root = match top_level.as_slice() {
        [only] if is_real_dir(only) => {
            std::fs::rename(only, target)
                .io_context(|| format!("cannot move tree into {}", target.display()))?;
            only.file_name().map(|n| n.to_string_lossy().to_string())
        }
        _ => {
            std::fs::rename(&stage, target)
                .io_context(|| format!("cannot move tree into {}", target.display()))?;
            None
        }
    };

    output::detail(&format!("extracted {} to {}", filename, target.display()));
    Ok(Unpacked::Extracted {
        format,
        promoted_root,
    })
}

fn open_tar(archive: &Path, compression: Compression) -> Result<Box<dyn Read>> {
    debug!(archive = %archive.display(), codec = compression.name(), "opening tar");
    compression.open(archive)
}

fn is_real_dir(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_dir())
        .unwrap_or(false)
}

/// Lexically normalise a path (no filesystem access), keeping leading `..`
/// of relative paths.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    let mut has_root = false;

    for c in path.components() {
        match c {
            Component::Prefix(p) => {
                out.clear();
                out.push(p.as_os_str());
                has_root = true;
            }
            Component::RootDir => {
                out.push(Component::RootDir.as_os_str());
                has_root = true;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = out
                    .components()
                    .next_back()
                    .is_some_and(|last| matches!(last, Component::Normal(_)));
                if popped {
                    out.pop();
                } else if !has_root {
                    out.push("..");
                }
            }
            Component::Normal(seg) => out.push(seg),
        }
    }

    out
}

/// Reject writes through an existing symlink anywhere below `dest`.
fn ensure_no_symlink_components(dest: &Path, full_path: &Path) -> Result<()> {
    let rel = full_path
        .strip_prefix(dest)
        .map_err(|_| Error::UnsafeArchiveEntry(format!("outside destination: {}", full_path.display())))?;

    let mut cur = dest.to_path_buf();
    for comp in rel.components() {
        cur.push(comp);
        if let Ok(md) = std::fs::symlink_metadata(&cur)
            && md.file_type().is_symlink()
        {
            return Err(Error::UnsafeArchiveEntry(format!(
                "symlink in path component: {}",
                cur.display()
            )));
        }
    }

    Ok(())
}

fn ensure_link_target_within_dest(dest: &Path, link_parent: &Path, link_name: &Path) -> Result<()> {
    if link_name.is_absolute()
        || link_name
            .components()
            .any(|c| matches!(c, Component::Prefix(_) | Component::RootDir))
    {
        return Err(Error::UnsafeArchiveEntry(format!(
            "absolute link target: {}",
            link_name.display()
        )));
    }

    let candidate = normalize_lexical(&link_parent.join(link_name));
    if candidate.strip_prefix(normalize_lexical(dest)).is_err() {
        return Err(Error::UnsafeArchiveEntry(format!(
            "link target escapes destination: {} -> {}",
            link_parent.display(),
            link_name.display()
        )));
    }

    Ok(())
}

fn extract_tar<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);

    for entry in archive.entries().io_context(|| "tar read error")? {
        let mut entry = entry.io_context(|| "tar entry error")?;
        let path = entry.path().io_context(|| "tar path error")?.into_owned();

        if path.is_absolute() || path.components().any(|c| c == Component::ParentDir) {
            return Err(Error::UnsafeArchiveEntry(path.display().to_string()));
        }
        if path.as_os_str().is_empty() || path == Path::new(".") {
            continue;
        }

        let full_path = dest.join(&path);
        ensure_no_symlink_components(dest, &full_path)?;

        let entry_type = entry.header().entry_type();
        if matches!(entry_type, tar::EntryType::Symlink | tar::EntryType::Link) {
            match entry.link_name().io_context(|| "tar link name error")? {
                Some(link_name) => {
                    let link_parent = full_path.parent().unwrap_or(dest);
                    ensure_link_target_within_dest(dest, link_parent, &link_name)?;
                }
                None => {
                    return Err(Error::UnsafeArchiveEntry(format!(
                        "link without target: {}",
                        path.display()
                    )));
                }
            }
        }

        if let Some(parent) = full_path.parent() {
            if parent.starts_with(dest) {
                ensure_no_symlink_components(dest, parent)?;
            }
            std::fs::create_dir_all(parent)
                .io_context(|| format!("cannot create directory {}", parent.display()))?;
        }

        entry
            .unpack(&full_path)
            .io_context(|| format!("unpack error for {}", path.display()))?;
    }

    Ok(())
}

fn extract_zip(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive_path)
        .io_context(|| format!("cannot open {}", archive_path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| Error::UnsupportedFormat(format!("{}: {}", archive_path.display(), e)))?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| Error::UnsupportedFormat(format!("zip entry {}: {}", i, e)))?;

        let outpath = match file.enclosed_name() {
            Some(path) => dest.join(path),
            None => return Err(Error::UnsafeArchiveEntry(file.name().to_string())),
        };
        ensure_no_symlink_components(dest, &outpath)?;

        if file.is_dir() {
            std::fs::create_dir_all(&outpath)
                .io_context(|| format!("cannot create directory {}", outpath.display()))?;
            continue;
        }

        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent)
                .io_context(|| format!("cannot create directory {}", parent.display()))?;
        }
        let mut outfile =
            File::create(&outpath).io_context(|| format!("cannot create {}", outpath.display()))?;
        std::io::copy(&mut file, &mut outfile)
            .io_context(|| format!("write error for {}", outpath.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = file.unix_mode() {
                std::fs::set_permissions(&outpath, std::fs::Permissions::from_mode(mode & 0o777))
                    .ok();
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tar(path: &Path, compression: Compression, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let encoder = compression.encoder(file).unwrap();
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, content) in files {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content).unwrap();
        }
        zip.finish().unwrap();
    }

    const SINGLE_ROOT: &[(&str, &[u8])] = &[
        ("pkg-1.0/README", b"readme" as &[u8]),
        ("pkg-1.0/src/main.c", b"int main;" as &[u8]),
    ];

    #[test]
    fn test_unpack_every_tar_codec_promotes_single_root() {
        for (ext, compression) in [
            ("tar.gz", Compression::Gzip),
            ("tgz", Compression::Gzip),
            ("tar.bz2", Compression::Bzip2),
            ("tar.xz", Compression::Xz),
            ("tar.zst", Compression::Zstd),
            ("tar", Compression::None),
        ] {
            let dir = tempfile::tempdir().unwrap();
            let archive = dir.path().join(format!("pkg-1.0.{}", ext));
            write_tar(&archive, compression, SINGLE_ROOT);

            let target = dir.path().join("work/src");
            let result = unpack(&archive, &target).unwrap();

            assert_eq!(
                result,
                Unpacked::Extracted {
                    format: ArchiveFormat::Tar(compression),
                    promoted_root: Some("pkg-1.0".to_string()),
                },
                "{ext}"
            );
            assert_eq!(std::fs::read(target.join("README")).unwrap(), b"readme");
            assert_eq!(std::fs::read(target.join("src/main.c")).unwrap(), b"int main;");
        }
    }

    #[test]
    fn test_unpack_zip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pkg-1.0.zip");
        write_zip(&archive, SINGLE_ROOT);

        let target = dir.path().join("src");
        let result = unpack(&archive, &target).unwrap();

        assert!(matches!(
            result,
            Unpacked::Extracted {
                format: ArchiveFormat::Zip,
                ..
            }
        ));
        assert_eq!(std::fs::read(target.join("src/main.c")).unwrap(), b"int main;");
    }

    #[test]
    fn test_unpack_multiple_roots_moved_together() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("flat.tar.gz");
        write_tar(
            &archive,
            Compression::Gzip,
            &[("Makefile", &b"all:"[..]), ("lib/a.c", &b"a"[..]), ("lib/b.c", &b"b"[..])],
        );

        let target = dir.path().join("src");
        let result = unpack(&archive, &target).unwrap();

        assert!(matches!(
            result,
            Unpacked::Extracted {
                promoted_root: None,
                ..
            }
        ));
        assert_eq!(std::fs::read(target.join("Makefile")).unwrap(), b"all:");
        assert_eq!(std::fs::read(target.join("lib/b.c")).unwrap(), b"b");
    }

    #[test]
    fn test_unpack_existing_target_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pkg-1.0.tar.gz");
        write_tar(&archive, Compression::Gzip, SINGLE_ROOT);

        let target = dir.path().join("src");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("local-edit"), "keep").unwrap();

        assert_eq!(unpack(&archive, &target).unwrap(), Unpacked::AlreadyPresent);
        assert!(target.join("local-edit").exists());
        assert!(!target.join("README").exists());
    }

    #[test]
    fn test_unpack_detects_format_by_magic() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("download");
        write_tar(&archive, Compression::Xz, SINGLE_ROOT);

        let target = dir.path().join("src");
        unpack(&archive, &target).unwrap();
        assert!(target.join("README").exists());
    }

    #[test]
    fn test_unpack_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let err = unpack(&dir.path().join("nope.tar.gz"), &dir.path().join("src")).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_unpack_leaves_no_scratch_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pkg-1.0.tar.gz");
        write_tar(&archive, Compression::Gzip, SINGLE_ROOT);
        let work = dir.path().join("work");

        unpack(&archive, &work.join("src")).unwrap();

        let names: Vec<String> = std::fs::read_dir(&work)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["src".to_string()]);
    }

    #[test]
    fn test_extract_tar_blocks_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("escape.tar.gz");

        let encoder = Compression::Gzip
            .encoder(File::create(&archive).unwrap())
            .unwrap();
        let mut builder = tar::Builder::new(encoder);

        // symlink "a" -> "/" followed by a write to "a/evil.txt"
        let mut link_header = tar::Header::new_gnu();
        link_header.set_entry_type(tar::EntryType::Symlink);
        link_header.set_size(0);
        link_header.set_mode(0o777);
        link_header.set_cksum();
        link_header.set_link_name("/").unwrap();
        builder
            .append_data(&mut link_header, "a", std::io::empty())
            .unwrap();

        let content = b"pwned";
        let mut file_header = tar::Header::new_gnu();
        file_header.set_size(content.len() as u64);
        file_header.set_mode(0o644);
        file_header.set_cksum();
        builder
            .append_data(&mut file_header, "a/evil.txt", &content[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let target = dir.path().join("src");
        let err = unpack(&archive, &target).unwrap_err();
        assert!(matches!(err, Error::UnsafeArchiveEntry(_)), "got: {err}");
        assert!(!target.exists());
    }

    #[test]
    fn test_extract_tar_blocks_hardlink_outside_dest() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("hardlink.tar.gz");

        let encoder = Compression::Gzip
            .encoder(File::create(&archive).unwrap())
            .unwrap();
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Link);
        header.set_size(0);
        header.set_mode(0o777);
        header.set_cksum();
        header.set_link_name("/etc/passwd").unwrap();
        builder
            .append_data(&mut header, "hl", std::io::empty())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let err = unpack(&archive, &dir.path().join("src")).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("absolute link target"), "got: {msg}");
    }

    #[test]
    fn test_relative_link_inside_tree_allowed() {
        let dest = Path::new("/work/src");
        assert!(
            ensure_link_target_within_dest(dest, &dest.join("lib"), Path::new("../include/a.h"))
                .is_ok()
        );
        assert!(
            ensure_link_target_within_dest(dest, &dest.join("lib"), Path::new("../../etc")).is_err()
        );
    }

    #[test]
    fn test_normalize_lexical() {
        assert_eq!(normalize_lexical(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(normalize_lexical(Path::new("../x/..")), PathBuf::from(".."));
    }
}

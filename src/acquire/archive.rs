//! Reproducible tarballs from checked-out trees
//!
//! Entries are written in file-name order with normalised metadata: owner
//! 0:0 with empty owner names, mode 0755 for directories and executables
//! and 0644 otherwise, and a single fixed mtime (the commit timestamp).
//! Two builds of the same tree content therefore produce identical bytes,
//! whatever the local clock, umask or user.

use crate::build::codec::{ArchiveFormat, Compression};
use crate::core::interrupt::Interrupt;
use crate::error::{Error, IoContext, Result};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Builds a deterministic tar archive rooted at `root_name/`.
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    root_name: String,
    mtime: u64,
    interrupt: Interrupt,
}

impl ArchiveBuilder {
    pub fn new(root_name: impl Into<String>, mtime: u64) -> Self {
        Self {
            root_name: root_name.into(),
            mtime,
            interrupt: Interrupt::new(),
        }
    }

    /// Abort between entries once `interrupt` is raised.
    pub fn interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Archive `tree` into `output`, compressing according to its extension.
    /// Returns the number of entries written.
    pub fn build(&self, tree: &Path, output: &Path) -> Result<usize> {
        let compression = match ArchiveFormat::from_path(output) {
            Some(ArchiveFormat::Tar(c)) => c,
            _ => {
                return Err(Error::UnsupportedFormat(format!(
                    "cannot build an archive named {}",
                    output.display()
                )));
            }
        };
        let file =
            File::create(output).io_context(|| format!("cannot create {}", output.display()))?;
        let (file, count) = self.write_to(tree, file, compression)?;
        file.sync_all()
            .io_context(|| format!("cannot sync {}", output.display()))?;
        Ok(count)
    }

    /// Archive `tree` into an arbitrary writer. Returns the writer after the
    /// compression trailer is flushed, together with the entry count.
    pub fn write_to<W: Write>(
        &self,
        tree: &Path,
        writer: W,
        compression: Compression,
    ) -> Result<(W, usize)> {
        if self.root_name.is_empty() || self.root_name.contains('/') {
            return Err(Error::InvalidArgument {
                what: "archive root name",
                value: self.root_name.clone(),
            });
        }
        if !tree.is_dir() {
            return Err(Error::NotFound(tree.to_path_buf()));
        }

        let encoder = compression.encoder(BufWriter::new(writer))?;
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        let mut count = 0;
        self.append_dir(&mut builder, &self.root_name)?;
        count += 1;

        let walker = WalkDir::new(tree)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name();
        for entry in walker {
            self.interrupt.check()?;
            let entry = entry.map_err(|e| {
                Error::io(
                    format!("cannot walk {}", tree.display()),
                    e.into_io_error()
                        .unwrap_or_else(|| io::Error::other("filesystem loop")),
                )
            })?;
            let rel = entry
                .path()
                .strip_prefix(tree)
                .map_err(|_| Error::UnsafeArchiveEntry(entry.path().display().to_string()))?;
            let name = format!("{}/{}", self.root_name, rel.to_string_lossy());
            let file_type = entry.file_type();

            if file_type.is_dir() {
                self.append_dir(&mut builder, &name)?;
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(entry.path())
                    .io_context(|| format!("cannot read link {}", entry.path().display()))?;
                let mut header = self.header(tar::EntryType::Symlink, 0o777, 0)?;
                builder
                    .append_link(&mut header, &name, &target)
                    .io_context(|| format!("cannot archive {}", name))?;
            } else if file_type.is_file() {
                let metadata = entry
                    .metadata()
                    .map_err(|e| Error::io(format!("cannot stat {}", name), e.into()))?;
                let mode = if is_executable(&metadata) { 0o755 } else { 0o644 };
                let mut header = self.header(tar::EntryType::Regular, mode, metadata.len())?;
                let file = File::open(entry.path())
                    .io_context(|| format!("cannot open {}", entry.path().display()))?;
                builder
                    .append_data(&mut header, &name, file)
                    .io_context(|| format!("cannot archive {}", name))?;
            } else {
                debug!(path = %entry.path().display(), "skipping special file");
                continue;
            }
            count += 1;
        }

        let encoder = builder
            .into_inner()
            .io_context(|| "cannot finish tar stream")?;
        let mut buffered = encoder
            .finish()
            .io_context(|| format!("cannot finish {} stream", compression.name()))?;
        buffered.flush().io_context(|| "cannot flush archive")?;
        let writer = buffered
            .into_inner()
            .map_err(|e| Error::io("cannot flush archive", e.into_error()))?;

        debug!(root = %self.root_name, entries = count, "archive built");
        Ok((writer, count))
    }

    fn header(&self, kind: tar::EntryType, mode: u32, size: u64) -> Result<tar::Header> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(kind);
        header.set_mode(mode);
        header.set_size(size);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(self.mtime);
        header
            .set_username("")
            .and_then(|_| header.set_groupname(""))
            .io_context(|| "cannot set tar owner names")?;
        Ok(header)
    }

    fn append_dir<W: Write>(&self, builder: &mut tar::Builder<W>, name: &str) -> Result<()> {
        let mut header = self.header(tar::EntryType::Directory, 0o755, 0)?;
        builder
            .append_data(&mut header, name, io::empty())
            .io_context(|| format!("cannot archive {}", name))
    }
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use std::io::Read;

    fn make_tree(root: &Path) {
        std::fs::create_dir_all(root.join("src/lib")).unwrap();
        std::fs::write(root.join("README"), "readme\n").unwrap();
        std::fs::write(root.join("src/main.c"), "int main;\n").unwrap();
        std::fs::write(root.join("src/lib/util.c"), "void util;\n").unwrap();
        std::fs::write(root.join("configure"), "#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                root.join("configure"),
                std::fs::Permissions::from_mode(0o775),
            )
            .unwrap();
            std::os::unix::fs::symlink("main.c", root.join("src/entry.c")).unwrap();
        }
    }

    fn touch_all(root: &Path, secs: i64) {
        for entry in WalkDir::new(root) {
            let entry = entry.unwrap();
            if entry.file_type().is_symlink() {
                continue;
            }
            filetime::set_file_mtime(entry.path(), FileTime::from_unix_time(secs, 0)).unwrap();
        }
    }

    fn entries(archive: &Path) -> Vec<(String, u32, u64, u64)> {
        let reader = Compression::Xz.open(archive).unwrap();
        let mut tar = tar::Archive::new(reader);
        tar.entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                let h = e.header();
                (
                    e.path().unwrap().to_string_lossy().to_string(),
                    h.mode().unwrap(),
                    h.uid().unwrap(),
                    h.mtime().unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_build_is_byte_identical_across_mtimes() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        make_tree(&a);
        make_tree(&b);
        touch_all(&a, 1_000_000);
        touch_all(&b, 1_600_000_000);

        let builder = ArchiveBuilder::new("pkg-1.0", 1_704_067_200);
        let out_a = dir.path().join("a.tar.gz");
        let out_b = dir.path().join("b.tar.gz");
        builder.build(&a, &out_a).unwrap();
        builder.build(&b, &out_b).unwrap();

        assert_eq!(std::fs::read(&out_a).unwrap(), std::fs::read(&out_b).unwrap());
    }

    #[test]
    fn test_build_normalises_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        make_tree(&tree);

        let out = dir.path().join("pkg.tar.xz");
        ArchiveBuilder::new("pkg-1.0", 42).build(&tree, &out).unwrap();

        let list = entries(&out);
        assert_eq!(list[0].0.trim_end_matches('/'), "pkg-1.0");
        assert!(list[1..].iter().all(|(path, ..)| path.starts_with("pkg-1.0/")));
        assert!(list.iter().all(|(_, _, uid, mtime)| *uid == 0 && *mtime == 42));

        let mode_of = |name: &str| {
            list.iter()
                .find(|e| e.0.trim_end_matches('/') == name)
                .unwrap()
                .1
        };
        assert_eq!(mode_of("pkg-1.0/README"), 0o644);
        assert_eq!(mode_of("pkg-1.0/src"), 0o755);
        #[cfg(unix)]
        assert_eq!(mode_of("pkg-1.0/configure"), 0o755);
    }

    #[test]
    fn test_build_orders_entries_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        make_tree(&tree);

        let out = dir.path().join("pkg.tar.xz");
        ArchiveBuilder::new("p", 0).build(&tree, &out).unwrap();

        let names: Vec<String> = entries(&out)
            .into_iter()
            .map(|e| e.0.trim_end_matches('/').to_string())
            .collect();
        let readme = names.iter().position(|n| n == "p/README").unwrap();
        let configure = names.iter().position(|n| n == "p/configure").unwrap();
        let src = names.iter().position(|n| n == "p/src").unwrap();
        // byte order: uppercase sorts first
        assert!(readme < configure);
        assert!(configure < src);
    }

    #[cfg(unix)]
    #[test]
    fn test_build_keeps_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        make_tree(&tree);

        let out = dir.path().join("pkg.tar.xz");
        ArchiveBuilder::new("p", 0).build(&tree, &out).unwrap();

        let reader = Compression::Xz.open(&out).unwrap();
        let mut tar = tar::Archive::new(reader);
        let link = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .find(|e| e.path().unwrap().to_string_lossy() == "p/src/entry.c")
            .unwrap();
        assert_eq!(link.header().entry_type(), tar::EntryType::Symlink);
        assert_eq!(
            link.link_name().unwrap().unwrap().to_string_lossy(),
            "main.c"
        );
    }

    #[test]
    fn test_build_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        make_tree(&tree);

        let out = dir.path().join("pkg.tar.zst");
        ArchiveBuilder::new("p", 0).build(&tree, &out).unwrap();

        let reader = Compression::Zstd.open(&out).unwrap();
        let mut tar = tar::Archive::new(reader);
        let mut found = false;
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().to_string_lossy() == "p/src/lib/util.c" {
                let mut text = String::new();
                entry.read_to_string(&mut text).unwrap();
                assert_eq!(text, "void util;\n");
                found = true;
            }
        }
        assert!(found);
    }

    #[test]
    fn test_build_rejects_zip_output() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        make_tree(&tree);
        let err = ArchiveBuilder::new("p", 0)
            .build(&tree, &dir.path().join("p.zip"))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    /// Writer that raises the interrupt once anything reaches it.
    #[derive(Debug)]
    struct TripWire {
        inner: Vec<u8>,
        interrupt: Interrupt,
    }

    impl Write for TripWire {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.interrupt.trigger();
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_stops_when_interrupted_midway() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        make_tree(&tree);
        // larger than the write buffer, so bytes reach the writer early
        std::fs::write(tree.join("big.bin"), vec![1u8; 64 * 1024]).unwrap();

        let interrupt = Interrupt::new();
        let sink = TripWire {
            inner: Vec::new(),
            interrupt: interrupt.clone(),
        };
        let err = ArchiveBuilder::new("p", 0)
            .interrupt(interrupt.clone())
            .write_to(&tree, sink, Compression::None)
            .unwrap_err();

        assert!(matches!(err, Error::Interrupted));
        assert!(interrupt.is_raised());
    }

    #[test]
    fn test_build_stops_when_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        make_tree(&tree);

        let interrupt = Interrupt::new();
        interrupt.trigger();
        let err = ArchiveBuilder::new("p", 0)
            .interrupt(interrupt)
            .build(&tree, &dir.path().join("p.tar.gz"))
            .unwrap_err();
        assert!(matches!(err, Error::Interrupted));
    }
}

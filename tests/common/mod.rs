//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use flate2::Compression as GzLevel;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::Path;

/// Write a `.tar.gz` whose entries all live under `root/`.
pub fn write_tar_gz(path: &Path, root: &str, files: &[(&str, &str)]) {
    let encoder = GzEncoder::new(File::create(path).unwrap(), GzLevel::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{}/{}", root, name), content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

/// Same, as bytes (for serving over HTTP).
pub fn tar_gz_bytes(root: &str, files: &[(&str, &str)]) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("archive.tar.gz");
    write_tar_gz(&path, root, files);
    std::fs::read(path).unwrap()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// A unified diff turning `old` into `new` in the one-line file `name`.
pub fn one_line_patch(name: &str, old: &str, new: &str) -> String {
    format!(
        "--- a/{name}\n+++ b/{name}\n@@ -1 +1 @@\n-{old}\n+{new}\n",
        name = name,
        old = old,
        new = new
    )
}

pub fn patch_available() -> bool {
    std::process::Command::new("patch")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

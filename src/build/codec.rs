//! Archive format registry
//!
//! Maps file extensions and magic bytes to an [`ArchiveFormat`]. Every
//! tar-based format goes through a [`Compression`] codec, which supplies
//! the matching streaming decoder and encoder. Extraction, content hashing
//! and archive building all dispatch through this table.

use crate::error::{Error, IoContext, Result};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

/// Stream compression wrapped around a tar archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
    Xz,
    Lzip,
    Zstd,
}

/// Container format of an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar(Compression),
    Zip,
}

/// Extension table, longest suffixes first.
const EXTENSIONS: &[(&str, ArchiveFormat)] = &[
    (".tar.gz", ArchiveFormat::Tar(Compression::Gzip)),
    (".tgz", ArchiveFormat::Tar(Compression::Gzip)),
    (".tar.bz2", ArchiveFormat::Tar(Compression::Bzip2)),
    (".tbz2", ArchiveFormat::Tar(Compression::Bzip2)),
    (".tbz", ArchiveFormat::Tar(Compression::Bzip2)),
    (".tar.xz", ArchiveFormat::Tar(Compression::Xz)),
    (".txz", ArchiveFormat::Tar(Compression::Xz)),
    (".tar.lz", ArchiveFormat::Tar(Compression::Lzip)),
    (".tlz", ArchiveFormat::Tar(Compression::Lzip)),
    (".tar.zst", ArchiveFormat::Tar(Compression::Zstd)),
    (".tzst", ArchiveFormat::Tar(Compression::Zstd)),
    (".tar", ArchiveFormat::Tar(Compression::None)),
    (".zip", ArchiveFormat::Zip),
];

const MAGIC: &[(&[u8], ArchiveFormat)] = &[
    (&[0x1f, 0x8b], ArchiveFormat::Tar(Compression::Gzip)),
    (b"BZh", ArchiveFormat::Tar(Compression::Bzip2)),
    (
        &[0xfd, b'7', b'z', b'X', b'Z', 0x00],
        ArchiveFormat::Tar(Compression::Xz),
    ),
    (b"LZIP", ArchiveFormat::Tar(Compression::Lzip)),
    (&[0x28, 0xb5, 0x2f, 0xfd], ArchiveFormat::Tar(Compression::Zstd)),
    (b"PK\x03\x04", ArchiveFormat::Zip),
];

/// Offset of the "ustar" magic inside a tar header block
const USTAR_OFFSET: usize = 257;

impl ArchiveFormat {
    /// Detect the format from the file name alone.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        EXTENSIONS
            .iter()
            .find(|(ext, _)| name.ends_with(ext))
            .map(|(_, format)| *format)
    }

    /// File name with a known archive extension removed
    /// ("zlib-1.3.1" from "zlib-1.3.1.tar.xz").
    pub fn strip_extension(name: &str) -> Option<&str> {
        EXTENSIONS.iter().find_map(|(ext, _)| {
            let cut = name.len().checked_sub(ext.len())?;
            let tail = name.get(cut..)?;
            tail.eq_ignore_ascii_case(ext).then(|| &name[..cut])
        })
    }

    /// Detect the format from the leading bytes of a file.
    pub fn sniff(path: &Path) -> Result<Option<Self>> {
        let mut file =
            File::open(path).io_context(|| format!("cannot open {}", path.display()))?;
        let mut head = [0u8; 512];
        let mut filled = 0;
        while filled < head.len() {
            let n = file
                .read(&mut head[filled..])
                .io_context(|| format!("cannot read {}", path.display()))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(Self::from_magic(&head[..filled]))
    }

    fn from_magic(head: &[u8]) -> Option<Self> {
        if let Some((_, format)) = MAGIC.iter().find(|(magic, _)| head.starts_with(magic)) {
            return Some(*format);
        }
        let ustar = head.get(USTAR_OFFSET..USTAR_OFFSET + 5);
        (ustar == Some(b"ustar")).then_some(ArchiveFormat::Tar(Compression::None))
    }

    /// Extension first, magic bytes as a fallback.
    pub fn detect(path: &Path) -> Result<Self> {
        if let Some(format) = Self::from_path(path) {
            return Ok(format);
        }
        Self::sniff(path)?
            .ok_or_else(|| Error::UnsupportedFormat(path.display().to_string()))
    }

    /// Compression of a tar archive; zip archives have none to peel off.
    pub fn compression(self) -> Option<Compression> {
        match self {
            Self::Tar(compression) => Some(compression),
            Self::Zip => None,
        }
    }
}

impl Compression {
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Xz => "xz",
            Self::Lzip => "lzip",
            Self::Zstd => "zstd",
        }
    }

    /// Open `path` and return a reader over its decompressed bytes.
    pub fn open(self, path: &Path) -> Result<Box<dyn Read>> {
        if self == Self::Lzip {
            return ChildReader::spawn("lzip", path).map(|r| Box::new(r) as Box<dyn Read>);
        }
        let file = File::open(path).io_context(|| format!("cannot open {}", path.display()))?;
        self.decoder(BufReader::new(file))
    }

    /// Wrap an arbitrary reader in the matching decoder.
    pub fn decoder<'a, R: Read + 'a>(self, reader: R) -> Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Self::None => Box::new(reader),
            Self::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
            Self::Bzip2 => Box::new(bzip2::read::BzDecoder::new(reader)),
            Self::Xz => Box::new(xz2::read::XzDecoder::new(reader)),
            Self::Zstd => Box::new(
                zstd::stream::read::Decoder::new(reader)
                    .io_context(|| "zstd init error")?,
            ),
            Self::Lzip => {
                return Err(Error::UnsupportedFormat(
                    "lzip streams can only be decoded from a file".into(),
                ));
            }
        })
    }

    /// Wrap a writer in the matching encoder at the default level.
    pub fn encoder<W: Write>(self, writer: W) -> Result<Encoder<W>> {
        Ok(match self {
            Self::None => Encoder::Plain(writer),
            Self::Gzip => Encoder::Gzip(flate2::write::GzEncoder::new(
                writer,
                flate2::Compression::best(),
            )),
            Self::Bzip2 => Encoder::Bzip2(bzip2::write::BzEncoder::new(
                writer,
                bzip2::Compression::best(),
            )),
            Self::Xz => Encoder::Xz(xz2::write::XzEncoder::new(writer, 6)),
            Self::Zstd => Encoder::Zstd(
                zstd::stream::write::Encoder::new(writer, 19)
                    .io_context(|| "zstd init error")?,
            ),
            Self::Lzip => {
                return Err(Error::UnsupportedFormat(
                    "writing lzip archives is not supported".into(),
                ));
            }
        })
    }
}

/// Streaming compressor; call [`Encoder::finish`] to flush the trailer.
pub enum Encoder<W: Write> {
    Plain(W),
    Gzip(flate2::write::GzEncoder<W>),
    Bzip2(bzip2::write::BzEncoder<W>),
    Xz(xz2::write::XzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::Plain(w) => Ok(w),
            Self::Gzip(e) => e.finish(),
            Self::Bzip2(e) => e.finish(),
            Self::Xz(e) => e.finish(),
            Self::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Gzip(e) => e.write(buf),
            Self::Bzip2(e) => e.write(buf),
            Self::Xz(e) => e.write(buf),
            Self::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Gzip(e) => e.flush(),
            Self::Bzip2(e) => e.flush(),
            Self::Xz(e) => e.flush(),
            Self::Zstd(e) => e.flush(),
        }
    }
}

/// Reads the stdout of an external decompressor, surfacing a non-zero exit
/// as a read error at end of stream.
struct ChildReader {
    program: &'static str,
    child: Child,
    stdout: ChildStdout,
    finished: bool,
}

impl ChildReader {
    fn spawn(program: &'static str, path: &Path) -> Result<Self> {
        let mut child = Command::new(program)
            .arg("-dc")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .io_context(|| format!("failed to run {}", program))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::io(format!("{} has no stdout", program), io::ErrorKind::BrokenPipe.into()))?;
        Ok(Self {
            program,
            child,
            stdout,
            finished: false,
        })
    }
}

impl Read for ChildReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() && !self.finished {
            self.finished = true;
            let status = self.child.wait()?;
            if !status.success() {
                return Err(io::Error::other(format!(
                    "{} exited with {}",
                    self.program, status
                )));
            }
        }
        Ok(n)
    }
}

impl Drop for ChildReader {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

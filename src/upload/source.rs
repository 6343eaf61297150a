//! Object sources
//!
//! An upload reads its object through [`ObjectSource`]: the total byte length
//! is known up front and any byte range can be read independently, which is
//! what lets parts be transferred concurrently.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// A sized object that can be read by byte range
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Total length in bytes
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remote name to use when none is configured
    fn name(&self) -> Option<&str> {
        None
    }

    /// Content type to use when none is configured
    fn content_type(&self) -> Option<&str> {
        None
    }

    /// Read `length` bytes starting at `offset`
    async fn slice(&self, offset: u64, length: u64) -> io::Result<Bytes>;
}

fn check_range(total: u64, offset: u64, length: u64) -> io::Result<()> {
    match offset.checked_add(length) {
        Some(end) if end <= total => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "range {}+{} is outside an object of {} bytes",
                offset, length, total
            ),
        )),
    }
}

#[async_trait]
impl ObjectSource for Bytes {
    fn len(&self) -> u64 {
        Bytes::len(self) as u64
    }

    async fn slice(&self, offset: u64, length: u64) -> io::Result<Bytes> {
        check_range(ObjectSource::len(self), offset, length)?;
        let start = offset as usize;
        Ok(Bytes::slice(self, start..start + length as usize))
    }
}

/// Object backed by a file on disk
///
/// Each slice opens its own handle so concurrent parts never share a cursor.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    len: u64,
    name: Option<String>,
    content_type: Option<String>,
}

impl FileSource {
    /// Open a file, capturing its length, file name and guessed MIME type
    pub async fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }

        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string);
        let content_type = mime_guess::from_path(&path)
            .first_raw()
            .map(str::to_string);

        Ok(Self {
            len: metadata.len(),
            path,
            name,
            content_type,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ObjectSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    async fn slice(&self, offset: u64, length: u64) -> io::Result<Bytes> {
        check_range(self.len, offset, length)?;

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf).await?;

        Ok(Bytes::from(buf))
    }
}

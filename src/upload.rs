use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use image::ImageFormat;
use log::{info, warn};
use sha2::{Digest, Sha256};

use crate::config::ServerConfig;
use crate::error::MapMarkError;

/// Formats accepted for marker images. Anything else is rejected even if the
/// client claims an image content type.
const ALLOWED_FORMATS: [ImageFormat; 4] = [
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::Gif,
    ImageFormat::WebP,
];

/// Hex characters of the digest kept in a stored filename.
const STORED_NAME_LEN: usize = 16;

/// create_new collisions are retried with a fresh salt this many times.
const MAX_NAME_ATTEMPTS: u32 = 8;

/// An upload that passed size and content checks and is ready to be written.
#[derive(Debug)]
pub struct PendingUpload {
    original_name: String,
    bytes: Vec<u8>,
    format: ImageFormat,
}

impl PendingUpload {
    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn mime_type(&self) -> &'static str {
        mime_type(self.format)
    }
}

/// A file written to the upload directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub filename: String,
    pub file_size: u64,
    pub mime_type: &'static str,
}

/// The directory marker images live in, together with the upload limits.
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
    max_file_size: u64,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>, max_file_size: u64) -> Self {
        Self {
            dir: dir.into(),
            max_file_size,
        }
    }

    pub fn from_config(server: &ServerConfig) -> Self {
        Self::new(&server.upload_dir, server.max_file_size)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Creates the upload directory (and parents) if it does not exist.
    pub fn ensure_dir(&self) -> Result<(), MapMarkError> {
        fs::create_dir_all(&self.dir)?;
        info!("Upload directory: {}", self.dir.display());
        Ok(())
    }

    /// Checks an uploaded file against the size limit and the allowed image
    /// formats. The format is sniffed from the bytes; the client's content
    /// type and file extension are ignored.
    pub fn validate(&self, original_name: &str, bytes: Vec<u8>) -> Result<PendingUpload, MapMarkError> {
        let size = bytes.len() as u64;
        if size > self.max_file_size {
            return Err(MapMarkError::FileTooLarge {
                filename: original_name.to_string(),
                size,
                max: self.max_file_size,
            });
        }

        let format = sniff_format(&bytes)
            .ok_or_else(|| MapMarkError::InvalidFileType(original_name.to_string()))?;

        Ok(PendingUpload {
            original_name: original_name.to_string(),
            bytes,
            format,
        })
    }

    /// Writes `upload` under a fresh hashed name. Existing files are never
    /// overwritten: a name collision is retried with a different salt.
    pub fn store(&self, upload: &PendingUpload) -> Result<StoredFile, MapMarkError> {
        let ext = extension(upload.format);

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let filename = format!(
                "{}.{}",
                hashed_name(&upload.original_name, timestamp_nanos(), attempt),
                ext
            );
            let path = self.dir.join(&filename);

            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            };

            if let Err(e) = file.write_all(&upload.bytes).and_then(|_| file.sync_all()) {
                drop(file);
                self.remove_best_effort(&filename);
                return Err(e.into());
            }

            return Ok(StoredFile {
                filename,
                file_size: upload.size(),
                mime_type: upload.mime_type(),
            });
        }

        Err(MapMarkError::Error(format!(
            "Could not find a free file name for '{}'",
            upload.original_name
        )))
    }

    /// Path of a stored file. `filename` is reduced to its final component,
    /// so `../x` resolves inside the upload directory.
    pub fn path_for(&self, filename: &str) -> Option<PathBuf> {
        sanitize_filename(filename).map(|name| self.dir.join(name))
    }

    /// Removes a stored file. A file that is already gone is not an error.
    pub fn remove(&self, filename: &str) -> Result<(), MapMarkError> {
        let Some(path) = self.path_for(filename) else {
            return Ok(());
        };

        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Image file already missing: {}", path.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Like `remove`, but failures are logged and swallowed.
    pub fn remove_best_effort(&self, filename: &str) {
        if let Err(e) = self.remove(filename) {
            warn!("Failed to remove image file '{}': {}", filename, e);
        }
    }
}

/// Final path component of `name`, or `None` when there isn't a usable one
/// (empty, `.`, `..`, or a bare root).
pub fn sanitize_filename(name: &str) -> Option<&str> {
    let base = Path::new(name).file_name()?.to_str()?;
    // file_name() stops at '/', but Windows clients may send '\'
    let base = base.rsplit('\\').next().unwrap_or(base);
    match base {
        "" | "." | ".." => None,
        b => Some(b),
    }
}

pub fn sniff_format(bytes: &[u8]) -> Option<ImageFormat> {
    image::guess_format(bytes)
        .ok()
        .filter(|format| ALLOWED_FORMATS.contains(format))
}

fn mime_type(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::Png => "image/png",
        ImageFormat::Gif => "image/gif",
        ImageFormat::WebP => "image/webp",
        _ => "application/octet-stream",
    }
}

fn extension(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "jpg",
        ImageFormat::Png => "png",
        ImageFormat::Gif => "gif",
        ImageFormat::WebP => "webp",
        _ => "bin",
    }
}

fn timestamp_nanos() -> i64 {
    let now = Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros())
}

fn hashed_name(original_name: &str, timestamp: i64, salt: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(original_name.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    if salt > 0 {
        hasher.update(salt.to_le_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    digest[..STORED_NAME_LEN].to_string()
}

#[cfg(test)]
pub(crate) mod test_images {
    pub const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01\x08\x06\0\0\0";
    pub const JPEG: &[u8] = b"\xff\xd8\xff\xe0\0\x10JFIF\0\x01\x01\0\0\x01\0\x01\0\0";
    pub const GIF: &[u8] = b"GIF89a\x01\0\x01\0\x80\0\0\0\0\0\xff\xff\xff";
    pub const WEBP: &[u8] = b"RIFF\x1a\0\0\0WEBPVP8L\x0d\0\0\0\x2f\0\0\0";
    pub const TEXT: &[u8] = b"just some text, not an image";
}

//! Upload persistence.
//!
//! [`UploadSink`] receives the events of the multipart parser: file parts are streamed
//! into fresh files of the upload directory, plain fields are collected in memory. The
//! sink never fails a callback; the first problem is recorded and reported by
//! [`UploadSink::checkpoint`], which the connection calls after every feed. Files written
//! by an upload that does not complete are removed again.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::mem;
use std::path::{Path, PathBuf};

use http::HeaderMap;
use http::header::CONTENT_DISPOSITION;
use tracing::{debug, info, warn};
use webserv_http::codec::{ContentDisposition, PartSink};

use crate::error::UploadError;

/// Upper bound for a non-file form field.
pub const MAX_FIELD_BYTES: usize = 64 * 1024;

const MAX_FILENAME_CHARS: usize = 100;
const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// A file stored by an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    pub field: String,
    pub filename: String,
    pub saved_as: String,
    pub size: u64,
}

/// What an upload stored.
///
/// Displayed as the plain text body of the `201 Created` reply:
///
/// ```text
/// Uploaded files:
///   notes.txt (7 bytes)
///   photo_1.jpg (5120 bytes, sent as photo.jpg)
/// title: hello world
/// ```
#[derive(Debug, Default)]
pub struct UploadSummary {
    pub files: Vec<SavedFile>,
    pub fields: Vec<(String, String)>,
}

impl fmt::Display for UploadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Uploaded files:")?;
        if self.files.is_empty() {
            writeln!(f, "  (none)")?;
        }
        for file in &self.files {
            if file.filename.is_empty() || file.filename == file.saved_as {
                writeln!(f, "  {} ({} bytes)", file.saved_as, file.size)?;
            } else {
                writeln!(f, "  {} ({} bytes, sent as {})", file.saved_as, file.size, file.filename)?;
            }
        }
        for (name, value) in &self.fields {
            writeln!(f, "{name}: {value}")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
enum Part {
    File { file: File, saved: SavedFile },
    Field { name: String, value: Vec<u8> },
    Skip,
}

#[derive(Debug)]
pub struct UploadSink {
    upload_dir: Option<PathBuf>,
    part: Part,
    summary: UploadSummary,
    created: Vec<PathBuf>,
    error: Option<UploadError>,
}

impl UploadSink {
    pub fn new(upload_dir: Option<PathBuf>) -> Self {
        Self { upload_dir, part: Part::Skip, summary: UploadSummary::default(), created: Vec::new(), error: None }
    }

    /// Surfaces the first failure recorded since the last call.
    ///
    /// On failure every file of this upload is removed.
    pub fn checkpoint(&mut self) -> Result<(), UploadError> {
        match self.error.take() {
            Some(e) => {
                self.rollback();
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Completes the upload, keeping the files it wrote.
    pub fn finish(mut self) -> Result<UploadSummary, UploadError> {
        self.checkpoint()?;
        self.created.clear();
        info!(files = self.summary.files.len(), fields = self.summary.fields.len(), "upload stored");
        Ok(mem::take(&mut self.summary))
    }

    fn fail(&mut self, e: UploadError) {
        warn!(cause = %e, "upload failed");
        self.part = Part::Skip;
        if self.error.is_none() {
            self.error = Some(e);
        }
    }

    fn rollback(&mut self) {
        self.part = Part::Skip;
        for path in self.created.drain(..) {
            if let Err(e) = fs::remove_file(&path) {
                debug!(cause = %e, path = %path.display(), "failed to remove partial upload");
            }
        }
    }

    fn begin_file(&mut self, field: String, filename: &str) -> Result<Part, UploadError> {
        let dir = self.upload_dir.as_deref().ok_or(UploadError::NoUploadDir)?;
        check_dir(dir)?;

        let (path, file) = unique_file(dir, &sanitize_filename(filename)).map_err(UploadError::write)?;
        self.created.push(path.clone());

        let saved_as = path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
        debug!(field = %field, filename, saved_as = %saved_as, "receiving file part");
        Ok(Part::File { file, saved: SavedFile { field, filename: filename.to_owned(), saved_as, size: 0 } })
    }
}

impl PartSink for UploadSink {
    fn on_part_begin(&mut self, headers: &HeaderMap) {
        if self.error.is_some() {
            return;
        }

        let disposition =
            headers.get(CONTENT_DISPOSITION).and_then(|value| value.to_str().ok()).and_then(ContentDisposition::parse);

        let Some(ContentDisposition { name: Some(name), filename, .. }) = disposition else {
            self.part = Part::Skip;
            return;
        };

        self.part = match filename {
            // a file input left empty by the browser
            Some(filename) if filename.is_empty() => Part::Skip,
            Some(filename) => match self.begin_file(name, &filename) {
                Ok(part) => part,
                Err(e) => return self.fail(e),
            },
            None => Part::Field { name, value: Vec::new() },
        };
    }

    fn on_part_data(&mut self, data: &[u8]) {
        let result = match &mut self.part {
            Part::File { file, saved } => {
                saved.size += data.len() as u64;
                file.write_all(data).map_err(UploadError::write)
            }
            Part::Field { value, .. } if value.len() + data.len() > MAX_FIELD_BYTES => {
                Err(UploadError::TooLargeField { limit: MAX_FIELD_BYTES })
            }
            Part::Field { value, .. } => {
                value.extend_from_slice(data);
                Ok(())
            }
            Part::Skip => Ok(()),
        };

        if let Err(e) = result {
            self.fail(e);
        }
    }

    fn on_part_end(&mut self) {
        match mem::replace(&mut self.part, Part::Skip) {
            Part::File { mut file, saved } => match file.flush() {
                Ok(()) => self.summary.files.push(saved),
                Err(e) => self.fail(UploadError::write(e)),
            },
            Part::Field { name, value } => {
                self.summary.fields.push((name, String::from_utf8_lossy(&value).into_owned()));
            }
            Part::Skip => {}
        }
    }
}

impl Drop for UploadSink {
    fn drop(&mut self) {
        self.rollback();
    }
}

/// Stores a non-multipart request body as one file of `dir`.
///
/// The file is named after the last segment of the request path.
pub fn save_raw(dir: &Path, request_path: &str, body: &[u8]) -> Result<SavedFile, UploadError> {
    check_dir(dir)?;

    let filename = request_path.rsplit('/').next().unwrap_or_default();
    let (path, mut file) = unique_file(dir, &sanitize_filename(filename)).map_err(UploadError::write)?;

    if let Err(e) = file.write_all(body).and_then(|()| file.flush()) {
        drop(file);
        if let Err(remove) = fs::remove_file(&path) {
            debug!(cause = %remove, path = %path.display(), "failed to remove partial upload");
        }
        return Err(UploadError::write(e));
    }

    let saved_as = path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
    info!(saved_as = %saved_as, size = body.len(), "raw upload stored");
    Ok(SavedFile { field: String::new(), filename: filename.to_owned(), saved_as, size: body.len() as u64 })
}

fn check_dir(dir: &Path) -> Result<(), UploadError> {
    match fs::metadata(dir) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(UploadError::UnusableUploadDir {
            path: dir.to_path_buf(),
            source: io::Error::new(io::ErrorKind::NotADirectory, "not a directory"),
        }),
        Err(source) => Err(UploadError::UnusableUploadDir { path: dir.to_path_buf(), source }),
    }
}

/// Reduces a client supplied filename to a safe single path component.
///
/// Directory parts and control characters are dropped and the result is capped at 100
/// characters. Names that end up empty or made of dots become `upload`.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base.chars().filter(|c| !c.is_control()).take(MAX_FILENAME_CHARS).collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') { "upload".to_owned() } else { cleaned.to_owned() }
}

/// Creates a new file named `name` in `dir`, or `stem_1.ext`, `stem_2.ext`, ... when
/// taken. Creation is exclusive, so concurrent writers never share a file.
pub fn unique_file(dir: &Path, name: &str) -> io::Result<(PathBuf, File)> {
    let (stem, extension) = match name.rfind('.') {
        Some(dot) if dot > 0 => name.split_at(dot),
        _ => (name, ""),
    };

    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = if attempt == 0 { name.to_owned() } else { format!("{stem}_{attempt}{extension}") };
        let path = dir.join(candidate);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }

    Err(io::Error::new(io::ErrorKind::AlreadyExists, format!("no free name for `{name}`")))
}

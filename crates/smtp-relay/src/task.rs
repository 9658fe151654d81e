use anyhow::Context;
use mailparse::MailHeaderMap;
use memmap2::Mmap;
use relay_scoring::{ScanResults, ScoredMessage};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempPath;

/// Used when the message carries no Message-ID header
const UNDEFINED_MESSAGE_ID: &str = "undef";

/// A read-only mapping of a captured message
#[derive(Debug)]
pub struct MappedMessage {
    map: Mmap,
}

impl MappedMessage {
    /// Maps `file`. Empty files cannot be mapped, so None is returned
    /// for them.
    pub fn map(file: &File) -> anyhow::Result<Option<Self>> {
        let len = file.metadata().context("stat captured message")?.len();
        if len == 0 {
            return Ok(None);
        }
        // The temp file is private to this session and is never
        // modified once it has been captured
        let map = unsafe { Mmap::map(file) }.context("mmap captured message")?;
        Ok(Some(Self { map }))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn unmap(self) {
        drop(self.map);
    }
}

/// The temp file that holds a captured message until it has been
/// relayed. Both the path and the descriptor are released by the
/// session teardown.
#[derive(Debug)]
pub struct TempStaging {
    pub file: File,
    pub path: TempPath,
    pub size: u64,
}

impl TempStaging {
    pub fn create(dir: &Path) -> anyhow::Result<Self> {
        let (file, path) = tempfile::Builder::new()
            .prefix("smtp-relay-")
            .suffix(".eml")
            .tempfile_in(dir)
            .with_context(|| format!("creating temp file in {}", dir.display()))?
            .into_parts();
        Ok(Self {
            file,
            path,
            size: 0,
        })
    }

    pub fn append(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.file
            .write_all(data)
            .with_context(|| format!("writing to {}", self.path.display()))?;
        self.size += data.len() as u64;
        Ok(())
    }

    pub fn finish(&mut self) -> anyhow::Result<()> {
        self.file
            .flush()
            .with_context(|| format!("flushing {}", self.path.display()))
    }
}

/// One captured inbound message plus its metadata and scan results
#[derive(Debug)]
pub struct Task {
    pub message_id: String,
    pub queue_id: String,
    /// The authenticated submitter, if any
    pub user: Option<String>,
    pub sender: String,
    pub recipients: Vec<String>,
    pub results: ScanResults,
    pub is_skipped: bool,
    pub message: Option<MappedMessage>,
    pub started: Instant,
}

impl Task {
    pub fn new(sender: String, recipients: Vec<String>, message: Option<MappedMessage>) -> Self {
        let message_id = message
            .as_ref()
            .and_then(|m| extract_message_id(m.as_bytes()))
            .unwrap_or_else(|| UNDEFINED_MESSAGE_ID.to_string());
        Self {
            message_id,
            queue_id: uuid::Uuid::new_v4().simple().to_string(),
            user: None,
            sender,
            recipients,
            results: ScanResults::new(),
            is_skipped: false,
            message,
            started: Instant::now(),
        }
    }

    /// The captured bytes as they travel on the wire, dot-stuffing
    /// included. This is what gets relayed upstream.
    pub fn message_bytes(&self) -> &[u8] {
        self.message.as_ref().map(|m| m.as_bytes()).unwrap_or(&[])
    }

    /// The message content with SMTP dot-stuffing removed
    pub fn unstuffed_message(&self) -> Vec<u8> {
        unstuff_dots(self.message_bytes())
    }

    /// Unmaps the message, if it was mapped.
    /// Returns true if a mapping was released.
    pub fn unmap_message(&mut self) -> bool {
        match self.message.take() {
            Some(message) => {
                message.unmap();
                true
            }
            None => false,
        }
    }

    /// Drops the recipient list.
    /// Returns true if there was one to release.
    pub fn release_recipients(&mut self) -> bool {
        if self.recipients.is_empty() {
            return false;
        }
        self.recipients = Vec::new();
        true
    }
}

impl ScoredMessage for Task {
    fn message_id(&self) -> &str {
        &self.message_id
    }

    fn queue_id(&self) -> &str {
        &self.queue_id
    }

    fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    fn recipients(&self) -> &[String] {
        &self.recipients
    }

    fn results(&self) -> &ScanResults {
        &self.results
    }

    fn is_skipped(&self) -> bool {
        self.is_skipped
    }

    fn message_len(&self) -> usize {
        self.message.as_ref().map(|m| m.len()).unwrap_or(0)
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Locates the Message-ID header in the header block of `data`,
/// returning its value without the surrounding angle brackets
pub fn extract_message_id(data: &[u8]) -> Option<String> {
    let (headers, _body_offset) = match mailparse::parse_headers(data) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::debug!("unable to parse message headers: {err:#}");
            return None;
        }
    };
    let value = headers.get_first_value("Message-ID")?;
    let value = value.trim().trim_start_matches('<').trim_end_matches('>');
    if value.is_empty() {
        return None;
    }
    Some(value.to_string())
}

/// Removes the leading `.` that SMTP transparency adds to every line
/// starting with one
pub fn unstuff_dots(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for line in data.split_inclusive(|&b| b == b'\n') {
        out.extend_from_slice(line.strip_prefix(b".").unwrap_or(line));
    }
    out
}

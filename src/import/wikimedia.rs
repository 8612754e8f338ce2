//! Wikimedia XML dump reader
//!
//! Streams `<page>` elements out of a Wikimedia export (raw or bzip2
//! compressed) and yields the latest revision of each page.

use super::source::{DumpCompression, ImportError, PageRecord, RecordSource};
use bzip2::read::MultiBzDecoder;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Read buffer in front of the XML tokenizer
const READ_BUFFER_BYTES: usize = 1024 * 1024;

/// Wikimedia XML dump source
pub struct WikimediaSource {
    /// Path or label of the dump
    path: PathBuf,
    /// XML reader over the (possibly decompressing) byte stream
    reader: Reader<Box<dyn BufRead + Send>>,
    /// Page currently being assembled
    current_page: Option<PartialPage>,
    /// Open element names inside the current page
    open_elements: Vec<String>,
    /// Character data of the innermost element
    text_buf: String,
    /// Set once EOF or an error has been returned
    finished: bool,
}

/// Page being built from XML events
#[derive(Debug, Default)]
struct PartialPage {
    title: Option<String>,
    revision: Option<PartialRevision>,
    latest: Option<PartialRevision>,
}

#[derive(Debug, Default)]
struct PartialRevision {
    id: Option<String>,
    timestamp: Option<String>,
    text: Option<String>,
}

/// Result of scanning the stream for the next page
enum ParseResult {
    Record(PageRecord),
    /// Page carried no revision
    Skipped,
    Eof,
}

impl WikimediaSource {
    /// Open a dump file; a `.bz2` suffix selects bzip2 decompression
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ImportError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let path = std::fs::canonicalize(&path).unwrap_or(path);
        let compression = DumpCompression::detect(&path);
        debug!("Opening {} ({:?})", path.display(), compression);
        Ok(Self::from_reader(path, file, compression))
    }

    /// Build a source over any byte stream
    pub fn from_reader<R: Read + Send + 'static>(
        path: impl Into<PathBuf>,
        reader: R,
        compression: DumpCompression,
    ) -> Self {
        let buffered: Box<dyn BufRead + Send> = match compression {
            DumpCompression::Bzip2 => Box::new(BufReader::with_capacity(
                READ_BUFFER_BYTES,
                MultiBzDecoder::new(reader),
            )),
            DumpCompression::None => Box::new(BufReader::with_capacity(READ_BUFFER_BYTES, reader)),
        };

        Self {
            path: path.into(),
            reader: Reader::from_reader(buffered),
            current_page: None,
            open_elements: Vec::new(),
            text_buf: String::new(),
            finished: false,
        }
    }

    /// Build a source over an in-memory XML document
    pub fn from_xml_string(xml: &str) -> Self {
        Self::from_reader("memory", Cursor::new(xml.as_bytes().to_vec()), DumpCompression::None)
    }

    /// Parent of the innermost open element
    fn parent_element(&self) -> Option<&str> {
        let len = self.open_elements.len();
        if len < 2 {
            return None;
        }
        Some(self.open_elements[len - 2].as_str())
    }

    /// Scan forward to the end of the next page
    fn parse_next_page(&mut self) -> Result<ParseResult, ImportError> {
        let mut buf = Vec::with_capacity(8192);

        loop {
            buf.clear();
            match self.reader.read_event_into(&mut buf)? {
                Event::Start(ref e) => {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    if name == "page" {
                        self.current_page = Some(PartialPage::default());
                        self.open_elements.clear();
                    }
                    if self.current_page.is_none() {
                        continue;
                    }
                    let in_page = self.open_elements.last().map(|p| p == "page").unwrap_or(false);
                    if in_page && name == "revision" {
                        if let Some(ref mut page) = self.current_page {
                            page.revision = Some(PartialRevision::default());
                        }
                    }
                    self.open_elements.push(name);
                    self.text_buf.clear();
                }
                Event::Empty(ref e) => {
                    // <text/> on a revision means an empty or deleted body
                    let in_revision = self
                        .open_elements
                        .last()
                        .map(|p| p == "revision")
                        .unwrap_or(false);
                    if in_revision && e.local_name().as_ref() == b"text" {
                        if let Some(rev) = self.current_page.as_mut().and_then(|p| p.revision.as_mut()) {
                            rev.text = Some(String::new());
                        }
                    }
                }
                Event::Text(ref e) => {
                    if self.current_page.is_some() {
                        self.text_buf.push_str(&e.unescape()?);
                    }
                }
                Event::CData(ref e) => {
                    if self.current_page.is_some() {
                        self.text_buf.push_str(&String::from_utf8_lossy(e));
                    }
                }
                Event::End(ref e) => {
                    if self.current_page.is_none() {
                        continue;
                    }
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    let parent = self.parent_element().map(str::to_owned);
                    let text = std::mem::take(&mut self.text_buf);

                    if name == "page" && parent.is_none() {
                        self.open_elements.clear();
                        if let Some(page) = self.current_page.take() {
                            return page_to_record(page);
                        }
                        continue;
                    }

                    if let Some(ref mut page) = self.current_page {
                        match (parent.as_deref(), name.as_str()) {
                            (Some("page"), "title") => page.title = Some(text),
                            (Some("page"), "revision") => {
                                // Dumps list revisions oldest first
                                if let Some(rev) = page.revision.take() {
                                    page.latest = Some(rev);
                                }
                            }
                            (Some("revision"), field) => {
                                if let Some(ref mut rev) = page.revision {
                                    match field {
                                        // The first <id> is the revision's own; contributor ids are nested deeper
                                        "id" if rev.id.is_none() => rev.id = Some(text),
                                        "timestamp" => rev.timestamp = Some(text),
                                        "text" => rev.text = Some(text),
                                        _ => {}
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                    self.open_elements.pop();
                }
                Event::Eof => {
                    if self.current_page.is_some() {
                        return Err(ImportError::InvalidFormat(
                            "dump ended inside a <page> element".to_string(),
                        ));
                    }
                    return Ok(ParseResult::Eof);
                }
                _ => {}
            }
        }
    }
}

/// Convert an assembled page into a record
fn page_to_record(page: PartialPage) -> Result<ParseResult, ImportError> {
    let title = match page.title {
        Some(t) if !t.is_empty() => t,
        _ => return Err(ImportError::InvalidFormat("page without a title".to_string())),
    };

    let Some(revision) = page.latest else {
        debug!("Skipping page '{}' without revisions", title);
        return Ok(ParseResult::Skipped);
    };

    let raw_id = revision.id.ok_or_else(|| {
        ImportError::InvalidFormat(format!("revision without id in page '{}'", title))
    })?;
    // Revision ids are stored as SQLite INTEGER, a signed 64-bit value
    let revision_id = raw_id
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|id| i64::try_from(*id).is_ok())
        .ok_or_else(|| {
            ImportError::InvalidFormat(format!("invalid revision id '{}' in page '{}'", raw_id, title))
        })?;
    let timestamp = revision.timestamp.ok_or_else(|| {
        ImportError::InvalidFormat(format!("revision {} of page '{}' has no timestamp", revision_id, title))
    })?;

    Ok(ParseResult::Record(PageRecord {
        title,
        revision_id,
        timestamp,
        body: revision.text.unwrap_or_default(),
    }))
}

impl RecordSource for WikimediaSource {
    fn iter_records(&mut self) -> Box<dyn Iterator<Item = Result<PageRecord, ImportError>> + '_> {
        Box::new(WikimediaIterator { source: self })
    }

    fn source_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("wikimedia dump")
    }

    fn source_path(&self) -> PathBuf {
        self.path.clone()
    }
}

/// Iterator over records in a Wikimedia dump
struct WikimediaIterator<'a> {
    source: &'a mut WikimediaSource,
}

impl Iterator for WikimediaIterator<'_> {
    type Item = Result<PageRecord, ImportError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.source.finished {
            return None;
        }
        loop {
            match self.source.parse_next_page() {
                Ok(ParseResult::Record(record)) => return Some(Ok(record)),
                Ok(ParseResult::Skipped) => continue,
                Ok(ParseResult::Eof) => {
                    self.source.finished = true;
                    return None;
                }
                Err(e) => {
                    self.source.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

use crate::error::IngestError;
use crate::models::{RawRecord, XmlElement};
use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::{debug, warn};

const RECORD_TAG: &[u8] = b"entity";
const READ_BUFFER_SIZE: usize = 256 * 1024;
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
}

impl Compression {
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let ext = path
            .as_ref()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("gz") | Some("gzip") => Compression::Gzip,
            Some("bz2") | Some("bzip2") => Compression::Bzip2,
            _ => Compression::None,
        }
    }
}

/// Pull-based reader yielding one `<entity>` element at a time.
///
/// Holds at most one record in memory. Parse errors produce
/// `MalformedRecord` and scanning resumes at the next record; read failures
/// (I/O, decompression) produce a final `SourceUnavailable`.
pub struct DumpReader {
    reader: Reader<BufReader<Box<dyn Read + Send>>>,
    buf: Vec<u8>,
    stack: Vec<XmlElement>,
    source: String,
    records_read: u64,
    last_error_at: Option<usize>,
    done: bool,
}

enum Step {
    Open(Result<XmlElement, String>),
    Leaf(Result<XmlElement, String>),
    Close(String),
    Text(String),
    Malformed(String),
    Fatal(String),
    Eof,
    Skip,
}

impl DumpReader {
    pub fn open(path: impl AsRef<Path>, compression: Compression) -> Result<Self, IngestError> {
        let path = path.as_ref();
        let source = path.display().to_string();
        let unavailable = |reason: String| IngestError::SourceUnavailable {
            path: source.clone(),
            reason,
        };

        let file = File::open(path).map_err(|e| unavailable(e.to_string()))?;
        let mut buffered = BufReader::with_capacity(READ_BUFFER_SIZE, file);
        let head = buffered.fill_buf().map_err(|e| unavailable(e.to_string()))?;

        match compression {
            Compression::Gzip if !head.starts_with(GZIP_MAGIC) => {
                return Err(unavailable("not a gzip stream".into()));
            }
            Compression::Bzip2 if !head.starts_with(BZIP2_MAGIC) => {
                return Err(unavailable("not a bzip2 stream".into()));
            }
            _ => {}
        }

        let inner: Box<dyn Read + Send> = match compression {
            Compression::None => Box::new(buffered),
            Compression::Gzip => Box::new(MultiGzDecoder::new(buffered)),
            Compression::Bzip2 => Box::new(MultiBzDecoder::new(buffered)),
        };

        debug!(path = %source, ?compression, "Opened dump");
        Ok(Self::from_boxed(inner, source))
    }

    /// Reads an already-decompressed XML stream.
    pub fn from_reader<R: Read + Send + 'static>(source: R, name: &str) -> Self {
        Self::from_boxed(Box::new(source), name.to_string())
    }

    fn from_boxed(inner: Box<dyn Read + Send>, source: String) -> Self {
        let mut reader = Reader::from_reader(BufReader::with_capacity(READ_BUFFER_SIZE, inner));
        reader.trim_text(true);
        // End tags are matched against our own stack so a bad record can be skipped.
        reader.check_end_names(false);
        Self {
            reader,
            buf: Vec::with_capacity(8 * 1024),
            stack: Vec::new(),
            source,
            records_read: 0,
            last_error_at: None,
            done: false,
        }
    }

    /// Records and malformed records yielded so far.
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn read_step(&mut self) -> Step {
        self.buf.clear();
        let in_record = !self.stack.is_empty();
        match self.reader.read_event_into(&mut self.buf) {
            Ok(Event::Start(e)) if in_record || e.local_name().as_ref() == RECORD_TAG => {
                Step::Open(element_from_start(&e))
            }
            Ok(Event::Empty(e)) if in_record || e.local_name().as_ref() == RECORD_TAG => {
                Step::Leaf(element_from_start(&e))
            }
            Ok(Event::End(e)) if in_record => {
                Step::Close(String::from_utf8_lossy(e.local_name().as_ref()).into_owned())
            }
            Ok(Event::Text(e)) if in_record => match e.unescape() {
                Ok(text) => Step::Text(text.into_owned()),
                Err(err) => Step::Malformed(err.to_string()),
            },
            Ok(Event::CData(e)) if in_record => {
                Step::Text(String::from_utf8_lossy(&e).into_owned())
            }
            Ok(Event::Eof) => Step::Eof,
            Ok(_) => Step::Skip,
            Err(quick_xml::Error::Io(err)) => Step::Fatal(err.to_string()),
            Err(err) => Step::Malformed(err.to_string()),
        }
    }

    fn next_position(&mut self) -> u64 {
        self.records_read += 1;
        self.records_read
    }

    fn record(&mut self, root: XmlElement) -> RawRecord {
        RawRecord {
            position: self.next_position(),
            root,
        }
    }

    fn malformed(&mut self, reason: String) -> Result<RawRecord, IngestError> {
        self.stack.clear();

        let at = self.reader.buffer_position();
        if self.last_error_at == Some(at) {
            return Err(self.fatal(format!("parser stuck at byte {at}: {reason}")));
        }
        self.last_error_at = Some(at);

        let position = self.next_position();
        debug!(position, byte = at, reason = %reason, "Malformed record");
        Err(IngestError::MalformedRecord { position, reason })
    }

    fn fatal(&mut self, reason: String) -> IngestError {
        self.done = true;
        self.stack.clear();
        warn!(path = %self.source, reason = %reason, "Dump became unreadable");
        IngestError::SourceUnavailable {
            path: self.source.clone(),
            reason,
        }
    }
}

impl Iterator for DumpReader {
    type Item = Result<RawRecord, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            match self.read_step() {
                Step::Skip => {}
                Step::Open(Ok(element)) => self.stack.push(element),
                Step::Leaf(Ok(element)) => match self.stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Some(Ok(self.record(element))),
                },
                Step::Text(text) => {
                    if let Some(top) = self.stack.last_mut() {
                        top.text.push_str(&text);
                    }
                }
                Step::Close(name) => {
                    let Some(element) = self.stack.pop() else {
                        continue;
                    };
                    if element.name != name {
                        let reason = format!(
                            "mismatched end tag </{}> for <{}>",
                            name, element.name
                        );
                        return Some(self.malformed(reason));
                    }
                    match self.stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => return Some(Ok(self.record(element))),
                    }
                }
                Step::Open(Err(reason)) | Step::Leaf(Err(reason)) | Step::Malformed(reason) => {
                    return Some(self.malformed(reason));
                }
                Step::Fatal(reason) => return Some(Err(self.fatal(reason))),
                Step::Eof => {
                    self.done = true;
                    if self.stack.is_empty() {
                        return None;
                    }
                    return Some(self.malformed("input ended inside a record".into()));
                }
            }
        }
    }
}

fn element_from_start(e: &BytesStart<'_>) -> Result<XmlElement, String> {
    let mut element = XmlElement::new(String::from_utf8_lossy(e.local_name().as_ref()));
    for attr in e.attributes() {
        let attr = attr.map_err(|err| err.to_string())?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| err.to_string())?
            .into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

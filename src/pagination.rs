// ==============================================================================
// pagination.rs - Page Index Construction
// ==============================================================================
// Description: Line/size bounded pages over a JSON-lines artifact
// Created: 2025-11-24
// Modified: 2025-12-02
// Version: 1.1.0
// ==============================================================================
// Pages are contiguous byte ranges that partition the artifact. A page is
// closed before the record that would push it past either limit; a single
// oversized record still gets a page of its own. Page numbers start at 1.
// ==============================================================================

use crate::config::PageLimits;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, Read, Write};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PaginationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Byte range `[start, end)` of one page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageEntry {
    pub start: u64,
    pub end: u64,
    pub records: u64,
}

impl PageEntry {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Page number -> byte range, persisted as gzip-compressed JSON
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageIndex {
    pages: BTreeMap<u32, PageEntry>,
}

impl PageIndex {
    /// Index covering a whole artifact as page 1
    pub fn single_page(size: u64, records: u64) -> Self {
        let mut pages = BTreeMap::new();
        pages.insert(
            1,
            PageEntry {
                start: 0,
                end: size,
                records,
            },
        );
        Self { pages }
    }

    pub fn get(&self, page: u32) -> Option<&PageEntry> {
        self.pages.get(&page)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &PageEntry)> {
        self.pages.iter().map(|(page, entry)| (*page, entry))
    }

    /// Records per page, as reported to readers
    pub fn record_counts(&self) -> BTreeMap<u32, u64> {
        self.iter().map(|(page, entry)| (page, entry.records)).collect()
    }

    /// Total bytes covered
    pub fn total_bytes(&self) -> u64 {
        self.pages.values().last().map(|entry| entry.end).unwrap_or(0)
    }

    pub fn to_compressed(&self) -> Result<Vec<u8>, PaginationError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        serde_json::to_writer(&mut encoder, self)?;
        Ok(encoder.finish()?)
    }

    pub fn from_compressed(bytes: &[u8]) -> Result<Self, PaginationError> {
        let mut json = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut json)?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Derive the index of an existing line artifact.
    ///
    /// Blank lines are not records; their bytes stay in the surrounding page.
    pub fn build_from_reader<R: BufRead>(mut reader: R, limits: PageLimits) -> Result<Self, PaginationError> {
        let mut builder = PageIndexBuilder::new(limits);
        let mut line = Vec::new();

        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            if read == 0 {
                break;
            }

            if line.iter().all(u8::is_ascii_whitespace) {
                builder.pad(read as u64);
            } else {
                builder.observe(read as u64);
            }
        }

        Ok(builder.finish())
    }
}

/// Tracks page boundaries while records are written
#[derive(Debug)]
pub struct PageIndexBuilder {
    limits: PageLimits,
    pages: BTreeMap<u32, PageEntry>,
    page_start: u64,
    position: u64,
    lines: usize,
    bytes: u64,
}

impl PageIndexBuilder {
    pub fn new(limits: PageLimits) -> Self {
        Self {
            limits,
            pages: BTreeMap::new(),
            page_start: 0,
            position: 0,
            lines: 0,
            bytes: 0,
        }
    }

    fn close_page(&mut self) {
        let page = self.pages.len() as u32 + 1;
        let entry = PageEntry {
            start: self.page_start,
            end: self.position,
            records: self.lines as u64,
        };
        debug!("Closing page {}: bytes {}..{} ({} records)", page, entry.start, entry.end, entry.records);

        self.pages.insert(page, entry);
        self.page_start = self.position;
        self.lines = 0;
        self.bytes = 0;
    }

    /// Account for one record of `len` bytes (newline included)
    pub fn observe(&mut self, len: u64) {
        let over_lines = self.lines + 1 > self.limits.max_lines;
        let over_bytes = self.bytes + len > self.limits.max_bytes;
        if self.lines > 0 && (over_lines || over_bytes) {
            self.close_page();
        }

        self.lines += 1;
        self.bytes += len;
        self.position += len;
    }

    /// Account for bytes that belong to no record
    pub fn pad(&mut self, len: u64) {
        self.bytes += len;
        self.position += len;
    }

    pub fn finish(mut self) -> PageIndex {
        if self.lines > 0 {
            self.close_page();
        } else if self.position > self.page_start {
            // Trailing padding joins the last page, or forms a record-less page 1
            match self.pages.values_mut().last() {
                Some(last) => last.end = self.position,
                None => self.close_page(),
            }
        }
        PageIndex { pages: self.pages }
    }
}

/// Writer that records page boundaries of the lines passing through it
pub struct PagedWriter<W> {
    inner: W,
    builder: PageIndexBuilder,
}

impl<W: Write> PagedWriter<W> {
    pub fn new(inner: W, limits: PageLimits) -> Self {
        Self {
            inner,
            builder: PageIndexBuilder::new(limits),
        }
    }

    /// Write one record; a trailing newline is added when missing
    pub fn write_record(&mut self, line: &[u8]) -> Result<(), PaginationError> {
        let body = line.strip_suffix(b"\n").unwrap_or(line);
        self.inner.write_all(body)?;
        self.inner.write_all(b"\n")?;
        self.builder.observe(body.len() as u64 + 1);
        Ok(())
    }

    pub fn finish(mut self) -> Result<(W, PageIndex), PaginationError> {
        self.inner.flush()?;
        Ok((self.inner, self.builder.finish()))
    }
}

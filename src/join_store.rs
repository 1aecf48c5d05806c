// ==============================================================================
// join_store.rs - Deferred Diplotype Join
// ==============================================================================
// Description: Offset-addressed record file and annotation merge
// Created: 2025-11-24
// Modified: 2025-12-02
// Version: 1.1.0
// ==============================================================================
// Diplotypes are appended to a line-oriented scratch file while only their
// byte offsets stay in memory, keyed by composite join key. Each annotation
// seeks to its diplotype, reads that one line and overlays drug fields.
// ==============================================================================

use crate::keys::annotation_key;
use crate::models::{AnnotationRecord, DiplotypeRecord};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum JoinStoreError {
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No record at offset {0}")]
    MissingRecord(u64),
}

/// Append-only JSON-lines file with an in-memory key -> offset index.
///
/// A repeated key points at its latest record.
pub struct KeyedJoinStore<T> {
    path: PathBuf,
    writer: BufWriter<File>,
    reader: BufReader<File>,
    offsets: HashMap<String, u64>,
    end: u64,
    _record: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> KeyedJoinStore<T> {
    /// Create (truncating) the backing file
    pub fn create(path: impl AsRef<Path>) -> Result<Self, JoinStoreError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source: std::io::Error| JoinStoreError::Io {
            path: path.clone(),
            source,
        };

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(io_err)?;
        let reader = File::open(&path).map_err(io_err)?;

        Ok(Self {
            writer: BufWriter::new(file),
            reader: BufReader::new(reader),
            offsets: HashMap::new(),
            end: 0,
            _record: PhantomData,
            path,
        })
    }

    fn io_err(&self, source: std::io::Error) -> JoinStoreError {
        JoinStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Append a record and remember its offset under `key`
    pub fn write(&mut self, key: &str, record: &T) -> Result<u64, JoinStoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let offset = self.end;
        self.writer.write_all(&line).map_err(|e| self.io_err(e))?;
        self.end += line.len() as u64;
        self.offsets.insert(key.to_string(), offset);
        Ok(offset)
    }

    pub fn offset_of(&self, key: &str) -> Option<u64> {
        self.offsets.get(key).copied()
    }

    /// Read the record starting at `offset`
    pub fn read_at(&mut self, offset: u64) -> Result<T, JoinStoreError> {
        if offset >= self.end {
            return Err(JoinStoreError::MissingRecord(offset));
        }

        self.writer.flush().map_err(|e| self.io_err(e))?;
        self.reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| self.io_err(e))?;

        let mut line = String::new();
        self.reader.read_line(&mut line).map_err(|e| self.io_err(e))?;
        if line.is_empty() {
            return Err(JoinStoreError::MissingRecord(offset));
        }
        Ok(serde_json::from_str(&line)?)
    }

    /// Record stored under `key`, if any
    pub fn lookup(&mut self, key: &str) -> Result<Option<T>, JoinStoreError> {
        match self.offset_of(key) {
            Some(offset) => self.read_at(offset).map(Some),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// First-seen filter over variant mapping keys
#[derive(Debug, Default)]
pub struct VariantDeduplicator {
    seen: HashSet<String>,
    duplicates: usize,
}

impl VariantDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time a mapping key is offered
    pub fn admit(&mut self, mapping: &str) -> bool {
        if self.seen.contains(mapping) {
            self.duplicates += 1;
            false
        } else {
            self.seen.insert(mapping.to_string());
            true
        }
    }

    pub fn kept(&self) -> usize {
        self.seen.len()
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinStats {
    pub merged: usize,
    pub skipped_unmatched: usize,
    pub duplicates: usize,
}

/// Merges drug annotations into stored diplotypes
pub struct DeferredJoin {
    store: KeyedJoinStore<DiplotypeRecord>,
    seen_annotations: HashSet<String>,
    stats: JoinStats,
}

impl DeferredJoin {
    pub fn new(store: KeyedJoinStore<DiplotypeRecord>) -> Self {
        Self {
            store,
            seen_annotations: HashSet::new(),
            stats: JoinStats::default(),
        }
    }

    /// Overlay `annotation` onto the diplotype stored under `join_key`.
    ///
    /// Returns `None` for a repeated annotation or one with no matching
    /// diplotype; both are counted in [`JoinStats`].
    pub fn merge(
        &mut self,
        join_key: &str,
        annotation: &AnnotationRecord,
    ) -> Result<Option<DiplotypeRecord>, JoinStoreError> {
        let identity = annotation_key(
            &annotation.org,
            &annotation.drug,
            &annotation.gene,
            &annotation.alleles,
        );
        if !self.seen_annotations.insert(identity) {
            self.stats.duplicates += 1;
            return Ok(None);
        }

        let Some(mut diplotype) = self.store.lookup(join_key)? else {
            warn!(
                "Skipping {} annotation for {} {:?}: no matching diplotype",
                annotation.drug, annotation.gene, annotation.alleles
            );
            self.stats.skipped_unmatched += 1;
            return Ok(None);
        };

        diplotype.overlay(annotation);
        self.stats.merged += 1;
        Ok(Some(diplotype))
    }

    pub fn stats(&self) -> JoinStats {
        self.stats
    }
}

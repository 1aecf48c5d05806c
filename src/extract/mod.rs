// ==============================================================================
// extract/mod.rs - Path-Table Extraction Engine
// ==============================================================================
// Description: Generic driver turning scanner tokens into per-entity batches
// Created: 2025-11-21
// Modified: 2025-12-02
// Version: 1.1.0
// ==============================================================================
// Report sections share one layout:
//
//   {"<section>": {"<organisation>": {"<entity>": { ... }}}}
//
// The engine tracks the current organisation and entity in a ScanContext,
// filters both through the extraction's allow-lists, and dispatches every
// token below an admitted entity against a static table of path rules.
// ==============================================================================

pub mod drugs;
pub mod genes;
pub mod messages;

pub use drugs::{DrugBatch, DrugExtraction, DrugExtractor};
pub use genes::{GeneBatch, GeneExtraction, GeneExtractor};
pub use messages::{MessageBatch, MessageExtraction, MessageExtractor};

use crate::scanner::{EventKind, ScanError, Token, TokenScanner};
use serde_json::Value;
use std::io::BufRead;
use thiserror::Error;

/// Extraction errors
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Missing {field} in {context}")]
    MissingField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid {field} in {context}: {value}")]
    InvalidValue {
        field: &'static str,
        context: String,
        value: String,
    },
}

impl ExtractError {
    /// Malformed documents and missing required fields are validation failures;
    /// only an I/O failure underneath the scanner is not
    pub fn is_validation(&self) -> bool {
        match self {
            ExtractError::Scan(e) => !e.is_io(),
            _ => true,
        }
    }
}

/// Event a path rule fires on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum On {
    StartMap,
    EndMap,
    StartArray,
    EndArray,
    Scalar,
}

impl On {
    fn from_event(kind: EventKind) -> Option<Self> {
        match kind {
            EventKind::StartMap => Some(On::StartMap),
            EventKind::EndMap => Some(On::EndMap),
            EventKind::StartArray => Some(On::StartArray),
            EventKind::EndArray => Some(On::EndArray),
            EventKind::Scalar => Some(On::Scalar),
            EventKind::MapKey => None,
        }
    }
}

/// Maps a path relative to the entity, plus an event, to a field assignment.
/// The empty path is the entity's own map.
#[derive(Debug, Clone, Copy)]
pub struct PathRule<F> {
    pub path: &'static str,
    pub on: On,
    pub field: F,
}

impl<F> PathRule<F> {
    pub const fn new(path: &'static str, on: On, field: F) -> Self {
        Self { path, on, field }
    }
}

/// Current position within a report section
#[derive(Debug, Clone, Default)]
pub struct ScanContext {
    organisation: Option<String>,
    entity: Option<String>,
    organisation_admitted: bool,
    entity_admitted: bool,
    organisation_prefix: String,
    entity_prefix: String,
}

impl ScanContext {
    pub fn organisation(&self) -> &str {
        self.organisation.as_deref().unwrap_or("")
    }

    pub fn entity(&self) -> &str {
        self.entity.as_deref().unwrap_or("")
    }

    /// Dotted prefix of the current entity, used in error messages
    pub fn describe(&self) -> &str {
        &self.entity_prefix
    }

    fn enter_organisation(&mut self, section: &str, organisation: String, admitted: bool) {
        self.organisation_prefix = format!("{}.{}", section, organisation);
        self.organisation = Some(organisation);
        self.organisation_admitted = admitted;
        self.entity = None;
        self.entity_admitted = false;
        self.entity_prefix.clear();
    }

    fn enter_entity(&mut self, entity: String, admitted: bool) {
        self.entity_prefix = format!("{}.{}", self.organisation_prefix, entity);
        self.entity = Some(entity);
        self.entity_admitted = admitted;
    }

    /// Path relative to the current entity, if the token lies within it
    fn relative<'p>(&self, path: &'p str) -> Option<&'p str> {
        let rest = path.strip_prefix(self.entity_prefix.as_str())?;
        if rest.is_empty() {
            Some(rest)
        } else {
            rest.strip_prefix('.')
        }
    }
}

/// One kind of extraction: a rule table plus the state it fills in
pub trait Extraction {
    type Field: Copy + 'static;
    type Batch;

    /// Top-level key of the report section
    const SECTION: &'static str;

    const RULES: &'static [PathRule<Self::Field>];

    fn admits_organisation(&self, organisation: &str) -> bool;

    fn admits_entity(&self, entity: &str) -> bool;

    /// Called when an admitted entity starts; resets per-entity state
    fn begin_entity(&mut self, ctx: &ScanContext);

    fn apply(
        &mut self,
        field: Self::Field,
        ctx: &ScanContext,
        token: &Token,
    ) -> Result<(), ExtractError>;

    /// Completed batch, if the last token finished one
    fn take_batch(&mut self) -> Option<Self::Batch>;
}

/// Text of a scalar token; `None` for null or non-scalar tokens
pub fn scalar_text(token: &Token) -> Option<String> {
    match token.value.as_ref()? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Drives an extraction over a token stream, yielding one batch per entity
pub struct Extractor<R, E> {
    tokens: TokenScanner<R>,
    extraction: E,
    ctx: ScanContext,
    finished: bool,
}

impl<R: BufRead, E: Extraction> Extractor<R, E> {
    pub fn new(tokens: TokenScanner<R>, extraction: E) -> Self {
        Self {
            tokens,
            extraction,
            ctx: ScanContext::default(),
            finished: false,
        }
    }

    pub fn extraction(&self) -> &E {
        &self.extraction
    }

    fn step(&mut self, token: &Token) -> Result<(), ExtractError> {
        if token.kind == EventKind::MapKey {
            if token.path == E::SECTION {
                let organisation = token.as_str().unwrap_or_default().to_string();
                let admitted = self.extraction.admits_organisation(&organisation);
                self.ctx.enter_organisation(E::SECTION, organisation, admitted);
                return Ok(());
            }

            if self.ctx.organisation_admitted && token.path == self.ctx.organisation_prefix {
                let entity = token.as_str().unwrap_or_default().to_string();
                let admitted = self.extraction.admits_entity(&entity);
                self.ctx.enter_entity(entity, admitted);
                if admitted {
                    self.extraction.begin_entity(&self.ctx);
                }
                return Ok(());
            }
        }

        if !(self.ctx.organisation_admitted && self.ctx.entity_admitted) {
            return Ok(());
        }

        let (Some(on), Some(relative)) = (On::from_event(token.kind), self.ctx.relative(&token.path))
        else {
            return Ok(());
        };

        for rule in E::RULES {
            if rule.on == on && rule.path == relative {
                self.extraction.apply(rule.field, &self.ctx, token)?;
            }
        }
        Ok(())
    }
}

impl<R: BufRead, E: Extraction> Iterator for Extractor<R, E> {
    type Item = Result<E::Batch, ExtractError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let token = match self.tokens.next() {
                Some(Ok(token)) => token,
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e.into()));
                }
                None => {
                    self.finished = true;
                    break;
                }
            };

            if let Err(e) = self.step(&token) {
                self.finished = true;
                return Some(Err(e));
            }

            if let Some(batch) = self.extraction.take_batch() {
                return Some(Ok(batch));
            }
        }
        None
    }
}

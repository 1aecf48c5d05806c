// ==============================================================================
// scanner.rs - Forward-Only JSON Token Scanner
// ==============================================================================
// Description: Lazy event scanner over nested report documents
// Created: 2025-11-20
// Modified: 2025-12-02
// Version: 1.1.0
// ==============================================================================
// Emits (path, event, value) tokens in document order without building a tree.
// Paths use dotted prefixes; array members contribute an "item" segment:
//
//   {"genes": {"CPIC": [{"name": "x"}]}}
//
//   ""                      StartMap
//   ""                      MapKey   "genes"
//   "genes"                 StartMap
//   "genes"                 MapKey   "CPIC"
//   "genes.CPIC"            StartArray
//   "genes.CPIC.item"       StartMap
//   "genes.CPIC.item"       MapKey   "name"
//   "genes.CPIC.item.name"  Scalar   "x"
//   ...
// ==============================================================================

use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::iter::FusedIterator;
use std::path::Path;
use thiserror::Error;

/// Kind of structural event produced by the scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    StartMap,
    EndMap,
    StartArray,
    EndArray,
    MapKey,
    Scalar,
}

/// A single scanner event
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// Dotted path of the value (or of the enclosing map for `MapKey`)
    pub path: String,
    pub kind: EventKind,
    /// Key text for `MapKey`, the decoded value for `Scalar`, `None` otherwise
    pub value: Option<Value>,
}

impl Token {
    /// String payload, if this token carries one
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_ref().and_then(Value::as_str)
    }
}

/// Errors raised while scanning a document
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected character '{found}' at byte {offset}")]
    UnexpectedChar { found: char, offset: u64 },

    #[error("Unexpected end of document at byte {offset}")]
    UnexpectedEof { offset: u64 },

    #[error("Invalid escape sequence at byte {offset}")]
    InvalidEscape { offset: u64 },

    #[error("Invalid number '{value}' at byte {offset}")]
    InvalidNumber { value: String, offset: u64 },

    #[error("Invalid UTF-8 in string starting at byte {offset}")]
    InvalidUtf8 { offset: u64 },
}

impl ScanError {
    /// True when the failure came from the underlying reader rather than the document
    pub fn is_io(&self) -> bool {
        matches!(self, ScanError::Io(_))
    }
}

/// Byte cursor over a buffered reader, tracking the absolute offset
struct ByteSource<R> {
    inner: R,
    offset: u64,
}

impl<R: BufRead> ByteSource<R> {
    fn peek(&mut self) -> Result<Option<u8>, ScanError> {
        loop {
            match self.inner.fill_buf() {
                Ok(buf) => return Ok(buf.first().copied()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn bump(&mut self) {
        self.inner.consume(1);
        self.offset += 1;
    }

    fn next_byte(&mut self) -> Result<Option<u8>, ScanError> {
        let byte = self.peek()?;
        if byte.is_some() {
            self.bump();
        }
        Ok(byte)
    }

    fn require_byte(&mut self) -> Result<u8, ScanError> {
        self.next_byte()?
            .ok_or(ScanError::UnexpectedEof { offset: self.offset })
    }

    fn skip_whitespace(&mut self) -> Result<(), ScanError> {
        while let Some(byte) = self.peek()? {
            if !matches!(byte, b' ' | b'\t' | b'\n' | b'\r') {
                break;
            }
            self.bump();
        }
        Ok(())
    }

    /// Read a string body; the opening quote has already been consumed
    fn read_string(&mut self) -> Result<String, ScanError> {
        let start = self.offset;
        let mut bytes = Vec::new();

        loop {
            let offset = self.offset;
            match self.require_byte()? {
                b'"' => break,
                b'\\' => match self.require_byte()? {
                    b'"' => bytes.push(b'"'),
                    b'\\' => bytes.push(b'\\'),
                    b'/' => bytes.push(b'/'),
                    b'b' => bytes.push(0x08),
                    b'f' => bytes.push(0x0c),
                    b'n' => bytes.push(b'\n'),
                    b'r' => bytes.push(b'\r'),
                    b't' => bytes.push(b'\t'),
                    b'u' => {
                        let ch = self.read_unicode_escape(offset)?;
                        let mut buf = [0u8; 4];
                        bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                    }
                    _ => return Err(ScanError::InvalidEscape { offset }),
                },
                control @ 0x00..=0x1f => {
                    return Err(ScanError::UnexpectedChar {
                        found: control as char,
                        offset,
                    })
                }
                byte => bytes.push(byte),
            }
        }

        String::from_utf8(bytes).map_err(|_| ScanError::InvalidUtf8 { offset: start })
    }

    fn read_hex4(&mut self, offset: u64) -> Result<u32, ScanError> {
        let mut code = 0u32;
        for _ in 0..4 {
            let digit = (self.require_byte()? as char)
                .to_digit(16)
                .ok_or(ScanError::InvalidEscape { offset })?;
            code = code * 16 + digit;
        }
        Ok(code)
    }

    fn read_unicode_escape(&mut self, offset: u64) -> Result<char, ScanError> {
        let first = self.read_hex4(offset)?;

        // Surrogate pairs arrive as two consecutive \uXXXX escapes
        let code = if (0xD800..0xDC00).contains(&first) {
            if self.require_byte()? != b'\\' || self.require_byte()? != b'u' {
                return Err(ScanError::InvalidEscape { offset });
            }
            let second = self.read_hex4(offset)?;
            if !(0xDC00..0xE000).contains(&second) {
                return Err(ScanError::InvalidEscape { offset });
            }
            0x10000 + ((first - 0xD800) << 10) + (second - 0xDC00)
        } else {
            first
        };

        char::from_u32(code).ok_or(ScanError::InvalidEscape { offset })
    }

    fn read_number(&mut self) -> Result<Value, ScanError> {
        let offset = self.offset;
        let mut raw = String::new();
        while let Some(byte) = self.peek()? {
            if !matches!(byte, b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E') {
                break;
            }
            raw.push(byte as char);
            self.bump();
        }

        match serde_json::from_str::<Value>(&raw) {
            Ok(value @ Value::Number(_)) => Ok(value),
            _ => Err(ScanError::InvalidNumber { value: raw, offset }),
        }
    }

    fn read_literal(&mut self, literal: &'static str, value: Value) -> Result<Value, ScanError> {
        for expected in literal.bytes() {
            let offset = self.offset;
            let found = self.require_byte()?;
            if found != expected {
                return Err(ScanError::UnexpectedChar {
                    found: found as char,
                    offset,
                });
            }
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Map,
    Array,
}

#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    prefix: String,
    key: Option<String>,
}

/// What the scanner accepts next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Value,
    FirstKeyOrEnd,
    Key,
    KeyCommaOrEnd,
    FirstValueOrEnd,
    ValueCommaOrEnd,
    Finished,
}

fn join_path(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{}.{}", prefix, segment)
    }
}

/// Forward-only, non-restartable token stream over a JSON document.
///
/// Memory use is bounded by nesting depth and the largest single string,
/// never by document size. After the first error or the end of the
/// document the iterator yields `None` forever.
pub struct TokenScanner<R> {
    source: ByteSource<R>,
    stack: Vec<Frame>,
    expect: Expect,
    fused: bool,
}

impl TokenScanner<BufReader<File>> {
    /// Open a document on disk
    pub fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> TokenScanner<R> {
    pub fn new(reader: R) -> Self {
        Self {
            source: ByteSource {
                inner: reader,
                offset: 0,
            },
            stack: Vec::new(),
            expect: Expect::Value,
            fused: false,
        }
    }

    fn value_prefix(&self) -> String {
        match self.stack.last() {
            None => String::new(),
            Some(frame) => match frame.kind {
                FrameKind::Map => join_path(&frame.prefix, frame.key.as_deref().unwrap_or("")),
                FrameKind::Array => join_path(&frame.prefix, "item"),
            },
        }
    }

    fn after_value(&mut self) {
        self.expect = match self.stack.last().map(|frame| frame.kind) {
            None => Expect::Finished,
            Some(FrameKind::Map) => Expect::KeyCommaOrEnd,
            Some(FrameKind::Array) => Expect::ValueCommaOrEnd,
        };
    }

    fn unexpected(byte: u8, offset: u64) -> ScanError {
        ScanError::UnexpectedChar {
            found: byte as char,
            offset,
        }
    }

    fn advance(&mut self) -> Result<Option<Token>, ScanError> {
        loop {
            self.source.skip_whitespace()?;
            let offset = self.source.offset;
            let next = self.source.peek()?;

            let byte = match (self.expect, next) {
                (Expect::Finished, None) => return Ok(None),
                (Expect::Finished, Some(byte)) => return Err(Self::unexpected(byte, offset)),
                (_, None) => return Err(ScanError::UnexpectedEof { offset }),
                (_, Some(byte)) => byte,
            };

            match (self.expect, byte) {
                (Expect::Value, _) => return self.read_value(byte).map(Some),
                (Expect::FirstValueOrEnd, b']') | (Expect::ValueCommaOrEnd, b']') => {
                    return Ok(Some(self.close(EventKind::EndArray)))
                }
                (Expect::FirstValueOrEnd, _) => return self.read_value(byte).map(Some),
                (Expect::ValueCommaOrEnd, b',') => {
                    self.source.bump();
                    self.expect = Expect::Value;
                }
                (Expect::FirstKeyOrEnd, b'}') | (Expect::KeyCommaOrEnd, b'}') => {
                    return Ok(Some(self.close(EventKind::EndMap)))
                }
                (Expect::FirstKeyOrEnd, b'"') | (Expect::Key, b'"') => {
                    return self.read_key().map(Some)
                }
                (Expect::KeyCommaOrEnd, b',') => {
                    self.source.bump();
                    self.expect = Expect::Key;
                }
                _ => return Err(Self::unexpected(byte, offset)),
            }
        }
    }

    fn read_value(&mut self, first: u8) -> Result<Token, ScanError> {
        let path = self.value_prefix();
        let offset = self.source.offset;

        let (kind, value) = match first {
            b'{' => {
                self.source.bump();
                self.stack.push(Frame {
                    kind: FrameKind::Map,
                    prefix: path.clone(),
                    key: None,
                });
                self.expect = Expect::FirstKeyOrEnd;
                return Ok(Token {
                    path,
                    kind: EventKind::StartMap,
                    value: None,
                });
            }
            b'[' => {
                self.source.bump();
                self.stack.push(Frame {
                    kind: FrameKind::Array,
                    prefix: path.clone(),
                    key: None,
                });
                self.expect = Expect::FirstValueOrEnd;
                return Ok(Token {
                    path,
                    kind: EventKind::StartArray,
                    value: None,
                });
            }
            b'"' => {
                self.source.bump();
                (EventKind::Scalar, Value::String(self.source.read_string()?))
            }
            b't' => (EventKind::Scalar, self.source.read_literal("true", Value::Bool(true))?),
            b'f' => (EventKind::Scalar, self.source.read_literal("false", Value::Bool(false))?),
            b'n' => (EventKind::Scalar, self.source.read_literal("null", Value::Null)?),
            b'-' | b'0'..=b'9' => (EventKind::Scalar, self.source.read_number()?),
            other => return Err(Self::unexpected(other, offset)),
        };

        self.after_value();
        Ok(Token {
            path,
            kind,
            value: Some(value),
        })
    }

    fn read_key(&mut self) -> Result<Token, ScanError> {
        self.source.bump();
        let key = self.source.read_string()?;

        self.source.skip_whitespace()?;
        let offset = self.source.offset;
        match self.source.next_byte()? {
            Some(b':') => {}
            Some(byte) => return Err(Self::unexpected(byte, offset)),
            None => return Err(ScanError::UnexpectedEof { offset }),
        }

        let path = match self.stack.last_mut() {
            Some(frame) if frame.kind == FrameKind::Map => {
                frame.key = Some(key.clone());
                frame.prefix.clone()
            }
            _ => return Err(Self::unexpected(b'"', offset)),
        };

        self.expect = Expect::Value;
        Ok(Token {
            path,
            kind: EventKind::MapKey,
            value: Some(Value::String(key)),
        })
    }

    fn close(&mut self, kind: EventKind) -> Token {
        self.source.bump();
        let path = self.stack.pop().map(|frame| frame.prefix).unwrap_or_default();
        self.after_value();
        Token {
            path,
            kind,
            value: None,
        }
    }
}

impl<R: BufRead> Iterator for TokenScanner<R> {
    type Item = Result<Token, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }

        match self.advance() {
            Ok(Some(token)) => Some(Ok(token)),
            Ok(None) => {
                self.fused = true;
                None
            }
            Err(e) => {
                self.fused = true;
                Some(Err(e))
            }
        }
    }
}

impl<R: BufRead> FusedIterator for TokenScanner<R> {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    fn scan(input: &str) -> Vec<(String, EventKind, Option<Value>)> {
        TokenScanner::new(Cursor::new(input.as_bytes().to_vec()))
            .map(|t| t.unwrap())
            .map(|t| (t.path, t.kind, t.value))
            .collect()
    }

    #[test]
    fn test_nested_paths() {
        let tokens = scan(r#"{"genes": {"CPIC": [{"name": "x", "n": 1}]}}"#);

        let expected = vec![
            ("".to_string(), EventKind::StartMap, None),
            ("".to_string(), EventKind::MapKey, Some(json!("genes"))),
            ("genes".to_string(), EventKind::StartMap, None),
            ("genes".to_string(), EventKind::MapKey, Some(json!("CPIC"))),
            ("genes.CPIC".to_string(), EventKind::StartArray, None),
            ("genes.CPIC.item".to_string(), EventKind::StartMap, None),
            ("genes.CPIC.item".to_string(), EventKind::MapKey, Some(json!("name"))),
            ("genes.CPIC.item.name".to_string(), EventKind::Scalar, Some(json!("x"))),
            ("genes.CPIC.item".to_string(), EventKind::MapKey, Some(json!("n"))),
            ("genes.CPIC.item.n".to_string(), EventKind::Scalar, Some(json!(1))),
            ("genes.CPIC.item".to_string(), EventKind::EndMap, None),
            ("genes.CPIC".to_string(), EventKind::EndArray, None),
            ("genes".to_string(), EventKind::EndMap, None),
            ("".to_string(), EventKind::EndMap, None),
        ];
        assert_eq!(tokens, expected);
    }

    #[test]
    fn test_nested_arrays_and_literals() {
        let tokens = scan(r#"[[true, null], [], -1.5e2, false]"#);
        let paths: Vec<&str> = tokens.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(
            paths,
            vec!["", "item", "item.item", "item.item", "item", "item", "item", "item", "item", ""]
        );
        assert_eq!(tokens[2].2, Some(json!(true)));
        assert_eq!(tokens[3].2, Some(Value::Null));
        assert_eq!(tokens[7].2, Some(json!(-150.0)));
        assert_eq!(tokens[8].2, Some(json!(false)));
    }

    #[test]
    fn test_string_escapes() {
        let tokens = scan(r#"{"k": "a\"b\\c\né🧬"}"#);
        assert_eq!(tokens[2].2, Some(json!("a\"b\\c\né🧬")));
    }

    #[test]
    fn test_empty_containers() {
        let tokens = scan(r#"{"a": {}, "b": []}"#);
        let kinds: Vec<EventKind> = tokens.iter().map(|t| t.1).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::StartMap,
                EventKind::MapKey,
                EventKind::StartMap,
                EventKind::EndMap,
                EventKind::MapKey,
                EventKind::StartArray,
                EventKind::EndArray,
                EventKind::EndMap,
            ]
        );
    }

    #[test]
    fn test_trailing_comma_rejected() {
        let results: Vec<_> = TokenScanner::new(Cursor::new(b"[1,]".to_vec())).collect();
        assert!(matches!(
            results.last(),
            Some(Err(ScanError::UnexpectedChar { found: ']', offset: 3 }))
        ));
    }

    #[test]
    fn test_truncated_document() {
        let results: Vec<_> =
            TokenScanner::new(Cursor::new(br#"{"genes": {"CPIC""#.to_vec())).collect();
        assert!(matches!(results.last(), Some(Err(ScanError::UnexpectedEof { .. }))));
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let results: Vec<_> = TokenScanner::new(Cursor::new(b"{} x".to_vec())).collect();
        assert_eq!(results.len(), 3);
        assert!(matches!(results[2], Err(ScanError::UnexpectedChar { found: 'x', .. })));
    }

    #[test]
    fn test_not_restartable_after_end() {
        let mut scanner = TokenScanner::new(Cursor::new(b"1".to_vec()));
        assert!(matches!(scanner.next(), Some(Ok(_))));
        assert!(scanner.next().is_none());
        assert!(scanner.next().is_none());
    }

    #[test]
    fn test_error_fuses_scanner() {
        let mut scanner = TokenScanner::new(Cursor::new(b"[01]".to_vec()));
        assert!(matches!(scanner.next(), Some(Ok(_))));
        assert!(matches!(scanner.next(), Some(Err(ScanError::InvalidNumber { .. }))));
        assert!(scanner.next().is_none());
    }

    #[test]
    fn test_small_buffer_reader() {
        // Token boundaries must not depend on the reader's buffer size
        let input = r#"{"alpha": ["one", "two"], "beta": 12345}"#;
        let reader = BufReader::with_capacity(2, Cursor::new(input.as_bytes().to_vec()));
        let tokens: Vec<Token> = TokenScanner::new(reader).map(|t| t.unwrap()).collect();
        assert_eq!(tokens.len(), 9);
        assert_eq!(tokens[4].value, Some(json!("two")));
        assert_eq!(tokens[7].path, "beta");
        assert_eq!(tokens[7].value, Some(json!(12345)));
    }
}

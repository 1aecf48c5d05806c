// ==============================================================================
// extract/messages.rs - Gene Message Extraction
// ==============================================================================
// Description: Rule messages reported per gene
// Created: 2025-11-23
// Modified: 2025-11-23
// Version: 1.0.0
// ==============================================================================

use super::{scalar_text, ExtractError, Extraction, Extractor, On, PathRule, ScanContext};
use crate::config::ExtractionConfig;
use crate::models::MessageRecord;
use crate::scanner::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageField {
    MessageStart,
    RuleName,
    Text,
    MessageEnd,
    GeneEnd,
}

const MESSAGE_RULES: &[PathRule<MessageField>] = &[
    PathRule::new("messages.item", On::StartMap, MessageField::MessageStart),
    PathRule::new("messages.item.rule_name", On::Scalar, MessageField::RuleName),
    PathRule::new("messages.item.message", On::Scalar, MessageField::Text),
    PathRule::new("messages.item", On::EndMap, MessageField::MessageEnd),
    PathRule::new("", On::EndMap, MessageField::GeneEnd),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageBatch {
    pub organisation: String,
    pub gene: String,
    pub messages: Vec<MessageRecord>,
}

pub struct MessageExtraction<'a> {
    config: &'a ExtractionConfig,
    message: Option<MessageRecord>,
    current: Option<MessageBatch>,
    ready: Option<MessageBatch>,
}

pub type MessageExtractor<'a, R> = Extractor<R, MessageExtraction<'a>>;

impl<'a> MessageExtraction<'a> {
    pub fn new(config: &'a ExtractionConfig) -> Self {
        Self {
            config,
            message: None,
            current: None,
            ready: None,
        }
    }
}

impl Extraction for MessageExtraction<'_> {
    type Field = MessageField;
    type Batch = MessageBatch;

    const SECTION: &'static str = "genes";
    const RULES: &'static [PathRule<MessageField>] = MESSAGE_RULES;

    fn admits_organisation(&self, organisation: &str) -> bool {
        self.config.admits_gene_organisation(organisation)
    }

    fn admits_entity(&self, entity: &str) -> bool {
        self.config.admits_gene(entity)
    }

    fn begin_entity(&mut self, ctx: &ScanContext) {
        self.current = Some(MessageBatch {
            organisation: ctx.organisation().to_string(),
            gene: ctx.entity().to_string(),
            messages: Vec::new(),
        });
        self.message = None;
    }

    fn apply(&mut self, field: MessageField, ctx: &ScanContext, token: &Token) -> Result<(), ExtractError> {
        match field {
            MessageField::MessageStart => {
                self.message = Some(MessageRecord {
                    org: ctx.organisation().to_string(),
                    gene: ctx.entity().to_string(),
                    name: String::new(),
                    message: String::new(),
                });
            }
            MessageField::RuleName => {
                if let (Some(message), Some(name)) = (self.message.as_mut(), scalar_text(token)) {
                    message.name = name;
                }
            }
            MessageField::Text => {
                if let (Some(message), Some(text)) = (self.message.as_mut(), scalar_text(token)) {
                    message.message = text;
                }
            }
            MessageField::MessageEnd => {
                if let (Some(message), Some(batch)) = (self.message.take(), self.current.as_mut()) {
                    batch.messages.push(message);
                }
            }
            MessageField::GeneEnd => self.ready = self.current.take(),
        }
        Ok(())
    }

    fn take_batch(&mut self) -> Option<MessageBatch> {
        self.ready.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrganisationPair;
    use crate::scanner::TokenScanner;
    use std::io::Cursor;

    #[test]
    fn test_messages_per_gene() {
        let config = ExtractionConfig::new(
            vec![OrganisationPair {
                gene: "CPIC".to_string(),
                drug: "CPIC Guideline Annotation".to_string(),
            }],
            ["CYP2C19", "CYP2D6"],
            Vec::<String>::new(),
        );

        let doc = r#"{"genes": {"CPIC": {
            "CYP2C19": {"messages": [
                {"rule_name": "reference-allele", "message": "Assumed reference"},
                {"rule_name": null, "message": "Unnamed"}
            ]},
            "CYP2D6": {"messages": []},
            "SLCO1B1": {"messages": [{"rule_name": "x", "message": "y"}]}
        }}}"#;

        let scanner = TokenScanner::new(Cursor::new(doc.as_bytes().to_vec()));
        let batches: Vec<MessageBatch> = Extractor::new(scanner, MessageExtraction::new(&config))
            .map(|batch| batch.unwrap())
            .collect();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].gene, "CYP2C19");
        assert_eq!(batches[0].messages.len(), 2);
        assert_eq!(batches[0].messages[0].name, "reference-allele");
        assert_eq!(batches[0].messages[0].message, "Assumed reference");
        assert_eq!(batches[0].messages[1].name, "");
        assert!(batches[1].messages.is_empty());
    }
}

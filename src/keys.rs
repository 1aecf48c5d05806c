// ==============================================================================
// keys.rs - Composite Join Keys
// ==============================================================================
// Description: Deterministic keys correlating records from independent passes
// Created: 2025-11-20
// Modified: 2025-11-20
// Version: 1.0.0
// ==============================================================================
// Components are joined with '_' and base64 encoded. Lists render as
// ['a', 'b'] so that keys stay stable across passes that see the same
// alleles in the same order.
// ==============================================================================

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Placeholder rendered for an absent optional component
const ABSENT: &str = "None";

/// Builder for a base64-encoded composite key
#[derive(Debug, Default, Clone)]
pub struct CompositeKeyBuilder {
    parts: Vec<String>,
}

impl CompositeKeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn part(mut self, value: impl AsRef<str>) -> Self {
        self.parts.push(value.as_ref().to_string());
        self
    }

    pub fn optional(mut self, value: Option<&str>) -> Self {
        self.parts.push(value.unwrap_or(ABSENT).to_string());
        self
    }

    pub fn list<S: AsRef<str>>(mut self, values: &[S]) -> Self {
        let rendered = values
            .iter()
            .map(|v| format!("'{}'", v.as_ref()))
            .collect::<Vec<_>>()
            .join(", ");
        self.parts.push(format!("[{}]", rendered));
        self
    }

    pub fn build(&self) -> String {
        STANDARD.encode(self.parts.join("_"))
    }
}

/// Key linking a diplotype to drug annotations: (gene organisation, gene, alleles)
pub fn diplotype_key<S: AsRef<str>>(organisation: &str, gene: &str, alleles: &[S]) -> String {
    CompositeKeyBuilder::new()
        .part(organisation)
        .part(gene)
        .list(alleles)
        .build()
}

/// Key identifying one physical variant call: (organisation, rsid, call, zygosity)
pub fn variant_key(organisation: &str, rsid: Option<&str>, call: &str, zygosity: &str) -> String {
    CompositeKeyBuilder::new()
        .part(organisation)
        .optional(rsid)
        .part(call)
        .part(zygosity)
        .build()
}

/// Key identifying one drug annotation within a run
pub fn annotation_key<S: AsRef<str>>(
    organisation: &str,
    drug: &str,
    gene: &str,
    alleles: &[S],
) -> String {
    CompositeKeyBuilder::new()
        .part(organisation)
        .part(drug)
        .part(gene)
        .list(alleles)
        .build()
}

// ==============================================================================
// config.rs - Processor Configuration
// ==============================================================================
// Description: Allow-lists, paging limits, tool paths and object key layout
// Created: 2025-11-21
// Modified: 2025-12-02
// Version: 1.1.0
// ==============================================================================

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use thiserror::Error;

/// Default maximum records per page
pub const DEFAULT_MAX_LINES: usize = 10_000;

/// Default maximum bytes per page
pub const DEFAULT_MAX_BYTES: u64 = 10_000_000;

/// Artifacts at or below this size are served whole without an index
pub const SMALL_ARTIFACT_THRESHOLD: u64 = 5_000_000;

/// Suffix appended to page index keys
pub const INDEX_SUFFIX: &str = ".index.json.gz";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid organisation list: {0}")]
    InvalidOrganisations(#[from] serde_json::Error),

    #[error("Invalid page limits: {0}")]
    InvalidLimits(String),
}

/// Gene organisation paired with the drug organisation whose annotations refer to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganisationPair {
    pub gene: String,
    pub drug: String,
}

/// Which organisations, genes and drugs are extracted from a report
#[derive(Debug, Clone, Default)]
pub struct ExtractionConfig {
    pub organisations: Vec<OrganisationPair>,
    pub genes: BTreeSet<String>,
    pub drugs: BTreeSet<String>,
    drug_to_gene: HashMap<String, String>,
}

fn split_list(csv: &str) -> BTreeSet<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl ExtractionConfig {
    pub fn new(
        organisations: Vec<OrganisationPair>,
        genes: impl IntoIterator<Item = impl Into<String>>,
        drugs: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let drug_to_gene = organisations
            .iter()
            .map(|pair| (pair.drug.clone(), pair.gene.clone()))
            .collect();

        Self {
            organisations,
            genes: genes.into_iter().map(Into::into).collect(),
            drugs: drugs.into_iter().map(Into::into).collect(),
            drug_to_gene,
        }
    }

    /// Build from the raw forms used in the environment:
    /// `[{"gene": "CPIC", "drug": "CPIC Guideline Annotation"}]`, `CYP2C19,CYP2D6`, `codeine`
    pub fn from_parts(organisations: &str, genes: &str, drugs: &str) -> Result<Self, ConfigError> {
        let organisations: Vec<OrganisationPair> = serde_json::from_str(organisations)?;
        Ok(Self::new(organisations, split_list(genes), split_list(drugs)))
    }

    pub fn admits_gene_organisation(&self, organisation: &str) -> bool {
        self.organisations.iter().any(|pair| pair.gene == organisation)
    }

    pub fn admits_drug_organisation(&self, organisation: &str) -> bool {
        self.drug_to_gene.contains_key(organisation)
    }

    pub fn admits_gene(&self, gene: &str) -> bool {
        self.genes.contains(gene)
    }

    pub fn admits_drug(&self, drug: &str) -> bool {
        self.drugs.contains(drug)
    }

    /// Gene organisation whose diplotypes a drug organisation's annotations join against
    pub fn gene_organisation_for_drug(&self, drug_organisation: &str) -> Option<&str> {
        self.drug_to_gene.get(drug_organisation).map(String::as_str)
    }
}

/// Page closing thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub max_lines: usize,
    pub max_bytes: u64,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            max_lines: DEFAULT_MAX_LINES,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl PageLimits {
    pub fn new(max_lines: usize, max_bytes: u64) -> Result<Self, ConfigError> {
        if max_lines == 0 || max_bytes == 0 {
            return Err(ConfigError::InvalidLimits(format!(
                "max_lines={} max_bytes={} (both must be positive)",
                max_lines, max_bytes
            )));
        }
        Ok(Self { max_lines, max_bytes })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderConfig {
    pub small_artifact_threshold: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            small_artifact_threshold: SMALL_ARTIFACT_THRESHOLD,
        }
    }
}

/// External executables used for zygosity lookups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub bcftools: PathBuf,
    pub tabix: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            bcftools: PathBuf::from("bcftools"),
            tabix: PathBuf::from("tabix"),
        }
    }
}

/// Object key of a job's flattened artifact
pub fn result_key(project: &str, job_id: &str, suffix: &str) -> String {
    format!("projects/{}/clinical-workflows/{}{}", project, job_id, suffix)
}

/// Object key of the compressed page index stored next to an artifact
pub fn index_key(result_key: &str) -> String {
    format!("{}{}", result_key, INDEX_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORGS: &str = r#"[
        {"gene": "CPIC", "drug": "CPIC Guideline Annotation"},
        {"gene": "DPWG", "drug": "DPWG Guideline Annotation"}
    ]"#;

    #[test]
    fn test_from_parts() {
        let config = ExtractionConfig::from_parts(ORGS, "CYP2C19, CYP2D6,,", "clopidogrel").unwrap();

        assert!(config.admits_gene_organisation("CPIC"));
        assert!(!config.admits_gene_organisation("CPIC Guideline Annotation"));
        assert!(config.admits_drug_organisation("DPWG Guideline Annotation"));
        assert!(config.admits_gene("CYP2D6"));
        assert_eq!(config.genes.len(), 2);
        assert!(config.admits_drug("clopidogrel"));
        assert_eq!(
            config.gene_organisation_for_drug("CPIC Guideline Annotation"),
            Some("CPIC")
        );
        assert_eq!(config.gene_organisation_for_drug("FDA Label Annotation"), None);
    }

    #[test]
    fn test_invalid_organisations() {
        let result = ExtractionConfig::from_parts("[{\"gene\": 1}]", "", "");
        assert!(matches!(result, Err(ConfigError::InvalidOrganisations(_))));
    }

    #[test]
    fn test_page_limits() {
        assert_eq!(PageLimits::default().max_lines, 10_000);
        assert_eq!(PageLimits::default().max_bytes, 10_000_000);
        assert!(PageLimits::new(0, 10).is_err());
        assert!(PageLimits::new(10, 10).is_ok());
    }

    #[test]
    fn test_object_keys() {
        let key = result_key("proj-1", "job-9", ".jsonl");
        assert_eq!(key, "projects/proj-1/clinical-workflows/job-9.jsonl");
        assert_eq!(
            index_key(&key),
            "projects/proj-1/clinical-workflows/job-9.jsonl.index.json.gz"
        );
    }
}

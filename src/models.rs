// ==============================================================================
// models.rs - Flattened Report Records
// ==============================================================================
// Description: Record types produced by extraction and the deferred join
// Created: 2025-11-20
// Modified: 2025-12-02
// Version: 1.1.0
// ==============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Diplotype called for a gene, later overlaid with drug annotation fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiplotypeRecord {
    /// Organisation (gene organisation until merged, then the annotation's)
    pub org: String,

    /// Gene symbol (e.g., "CYP2C19")
    pub gene: String,

    /// Drug name, empty until merged with an annotation
    pub drug: String,

    /// Allele pair in source order (e.g., ["*1", "*2"])
    pub alleles: Vec<String>,

    pub phenotypes: Vec<String>,

    /// rsIDs of variants sharing an allele with this diplotype
    pub variants: Vec<Option<String>>,

    /// Mapping keys of those variants, aligned with `variants`
    pub mapping: Vec<String>,

    #[serde(default)]
    pub pmids: Vec<String>,

    #[serde(default)]
    pub implications: Vec<String>,

    #[serde(default)]
    pub recommendation: String,

    #[serde(default)]
    pub dosing_information: Option<Value>,

    #[serde(default)]
    pub alternate_drug_available: Option<Value>,

    #[serde(default)]
    pub other_prescribing_guidance: Option<Value>,
}

impl DiplotypeRecord {
    pub fn new(org: &str, gene: &str) -> Self {
        Self {
            org: org.to_string(),
            gene: gene.to_string(),
            drug: String::new(),
            alleles: Vec::new(),
            phenotypes: Vec::new(),
            variants: Vec::new(),
            mapping: Vec::new(),
            pmids: Vec::new(),
            implications: Vec::new(),
            recommendation: String::new(),
            dosing_information: None,
            alternate_drug_available: None,
            other_prescribing_guidance: None,
        }
    }

    /// Whether any allele of this diplotype appears in `alleles`
    pub fn shares_allele(&self, alleles: &[String]) -> bool {
        self.alleles.iter().any(|a| alleles.contains(a))
    }

    /// Overwrite drug-derived fields with those of a matching annotation.
    /// The annotation's organisation replaces the gene organisation.
    pub fn overlay(&mut self, annotation: &AnnotationRecord) {
        self.org = annotation.org.clone();
        self.drug = annotation.drug.clone();
        self.pmids = annotation.pmids.clone();
        self.implications = annotation.implications.clone();
        self.recommendation = annotation.recommendation.clone();
        self.dosing_information = annotation.dosing_information.clone();
        self.alternate_drug_available = annotation.alternate_drug_available.clone();
        self.other_prescribing_guidance = annotation.other_prescribing_guidance.clone();
    }
}

/// Called variant with zygosity resolved against the source VCF
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantRecord {
    pub org: String,

    /// Chromosome as reported (e.g., "chr10")
    pub chr: String,

    /// Position as reported (GRCh38)
    pub pos: u64,

    pub rsid: Option<String>,

    /// Reported call (e.g., "C/T")
    pub call: String,

    /// Star alleles this variant participates in
    pub alleles: Vec<String>,

    /// Canonical chromosome name used for the VCF lookup
    pub chrom_ref: String,

    pub pos_vcf: u64,

    /// Reference base(s) from the VCF, "." when not found
    pub ref_vcf: String,

    /// Called bases per haplotype from the VCF
    pub alts_vcf: Vec<String>,

    /// Genotype string from the VCF (e.g., "0|1")
    pub zygosity: String,

    /// Mapping key over (org, rsid, call, zygosity)
    pub mapping: String,
}

/// Drug annotation attached to one gene diplotype
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationRecord {
    pub org: String,
    pub drug: String,
    pub gene: String,
    pub alleles: Vec<String>,

    /// Literature references (PubMed IDs)
    pub pmids: Vec<String>,

    /// Markup-stripped implication texts
    pub implications: Vec<String>,

    /// Markup-stripped recommendation text
    pub recommendation: String,

    pub dosing_information: Option<Value>,
    pub alternate_drug_available: Option<Value>,
    pub other_prescribing_guidance: Option<Value>,
}

/// Rule message reported for a gene
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub org: String,
    pub gene: String,
    pub name: String,
    pub message: String,
}

/// One line of the flattened artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutputRecord {
    Diplotype(DiplotypeRecord),
    Variant(VariantRecord),
    Message(MessageRecord),
}

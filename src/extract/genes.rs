// ==============================================================================
// extract/genes.rs - Gene Diplotype and Variant Extraction
// ==============================================================================
// Description: Per-gene diplotypes, join keys and zygosity-resolved variants
// Created: 2025-11-22
// Modified: 2025-12-02
// Version: 1.1.0
// ==============================================================================
// Diplotypes are expected before variants within a gene object; a variant is
// linked only to diplotypes already seen in the same gene.
// ==============================================================================

use super::{scalar_text, ExtractError, Extraction, Extractor, On, PathRule, ScanContext};
use crate::config::ExtractionConfig;
use crate::keys::{diplotype_key, variant_key};
use crate::models::{DiplotypeRecord, VariantRecord};
use crate::scanner::Token;
use crate::zygosity::{match_chromosome_name, ZygosityCall, ZygosityLookup, ZygosityResolver};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneField {
    DiplotypeStart,
    DiplotypeAllele,
    Phenotype,
    DiplotypeEnd,
    VariantStart,
    Chromosome,
    Position,
    RsId,
    Call,
    VariantAllele,
    VariantEnd,
    GeneEnd,
}

const GENE_RULES: &[PathRule<GeneField>] = &[
    PathRule::new("sourceDiplotypes.item", On::StartMap, GeneField::DiplotypeStart),
    PathRule::new("sourceDiplotypes.item.allele1.name", On::Scalar, GeneField::DiplotypeAllele),
    PathRule::new("sourceDiplotypes.item.allele2.name", On::Scalar, GeneField::DiplotypeAllele),
    PathRule::new("sourceDiplotypes.item.phenotypes.item", On::Scalar, GeneField::Phenotype),
    PathRule::new("sourceDiplotypes.item", On::EndMap, GeneField::DiplotypeEnd),
    PathRule::new("variants.item", On::StartMap, GeneField::VariantStart),
    PathRule::new("variants.item.chromosome", On::Scalar, GeneField::Chromosome),
    PathRule::new("variants.item.position", On::Scalar, GeneField::Position),
    PathRule::new("variants.item.dbSnpId", On::Scalar, GeneField::RsId),
    PathRule::new("variants.item.call", On::Scalar, GeneField::Call),
    PathRule::new("variants.item.alleles.item", On::Scalar, GeneField::VariantAllele),
    PathRule::new("variants.item", On::EndMap, GeneField::VariantEnd),
    PathRule::new("", On::EndMap, GeneField::GeneEnd),
];

/// Everything extracted for one gene
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneBatch {
    pub organisation: String,
    pub gene: String,
    pub diplotypes: Vec<DiplotypeRecord>,
    /// Join keys aligned with `diplotypes`
    pub diplotype_keys: Vec<String>,
    pub variants: Vec<VariantRecord>,
}

#[derive(Debug, Default)]
struct VariantDraft {
    chromosome: Option<String>,
    position: Option<u64>,
    rsid: Option<String>,
    call: Option<String>,
    alleles: Vec<String>,
}

/// Gene-section extraction state
pub struct GeneExtraction<'a> {
    config: &'a ExtractionConfig,
    resolver: &'a mut dyn ZygosityResolver,
    current: Option<GeneBatch>,
    diplotype: Option<DiplotypeRecord>,
    variant: Option<VariantDraft>,
    ready: Option<GeneBatch>,
    degraded_lookups: usize,
}

pub type GeneExtractor<'a, R> = Extractor<R, GeneExtraction<'a>>;

fn parse_position(token: &Token, ctx: &ScanContext) -> Result<Option<u64>, ExtractError> {
    let invalid = |value: String| ExtractError::InvalidValue {
        field: "position",
        context: ctx.describe().to_string(),
        value,
    };

    match token.value.as_ref() {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| invalid(n.to_string())),
        Some(Value::String(s)) => s.trim().parse().map(Some).map_err(|_| invalid(s.clone())),
        Some(other) => Err(invalid(other.to_string())),
    }
}

impl<'a> GeneExtraction<'a> {
    pub fn new(config: &'a ExtractionConfig, resolver: &'a mut dyn ZygosityResolver) -> Self {
        Self {
            config,
            resolver,
            current: None,
            diplotype: None,
            variant: None,
            ready: None,
            degraded_lookups: 0,
        }
    }

    /// Lookups that failed and were replaced by a reference sentinel
    pub fn degraded_lookups(&self) -> usize {
        self.degraded_lookups
    }

    fn resolve_zygosity(&mut self, chromosome: &str, position: u64) -> ZygosityCall {
        let chrom_ref = match_chromosome_name(chromosome).unwrap_or(chromosome);

        match self.resolver.resolve(chromosome, position) {
            Ok(ZygosityLookup::Found(call)) => call,
            Ok(ZygosityLookup::NotFound) => ZygosityCall::reference_sentinel(chrom_ref, position),
            Err(e) => {
                warn!(
                    "Zygosity lookup failed for {}:{}, using reference call: {}",
                    chromosome, position, e
                );
                self.degraded_lookups += 1;
                ZygosityCall::reference_sentinel(chrom_ref, position)
            }
        }
    }

    fn finish_variant(&mut self, ctx: &ScanContext) -> Result<(), ExtractError> {
        let draft = self.variant.take().unwrap_or_default();

        // Uncalled positions carry no genotype and are not reported
        let Some(call) = draft.call else {
            return Ok(());
        };

        let chromosome = draft.chromosome.ok_or_else(|| ExtractError::MissingField {
            field: "chromosome",
            context: ctx.describe().to_string(),
        })?;
        let position = draft.position.ok_or_else(|| ExtractError::MissingField {
            field: "position",
            context: ctx.describe().to_string(),
        })?;

        let zygosity = self.resolve_zygosity(&chromosome, position);
        let mapping = variant_key(ctx.organisation(), draft.rsid.as_deref(), &call, &zygosity.zygosity);

        let Some(batch) = self.current.as_mut() else {
            return Ok(());
        };

        for diplotype in batch.diplotypes.iter_mut() {
            if diplotype.shares_allele(&draft.alleles) {
                diplotype.variants.push(draft.rsid.clone());
                diplotype.mapping.push(mapping.clone());
            }
        }

        batch.variants.push(VariantRecord {
            org: ctx.organisation().to_string(),
            chr: chromosome,
            pos: position,
            rsid: draft.rsid,
            call,
            alleles: draft.alleles,
            chrom_ref: zygosity.chrom_ref,
            pos_vcf: zygosity.pos_vcf,
            ref_vcf: zygosity.ref_vcf,
            alts_vcf: zygosity.alts_vcf,
            zygosity: zygosity.zygosity,
            mapping,
        });
        Ok(())
    }
}

impl Extraction for GeneExtraction<'_> {
    type Field = GeneField;
    type Batch = GeneBatch;

    const SECTION: &'static str = "genes";
    const RULES: &'static [PathRule<GeneField>] = GENE_RULES;

    fn admits_organisation(&self, organisation: &str) -> bool {
        self.config.admits_gene_organisation(organisation)
    }

    fn admits_entity(&self, entity: &str) -> bool {
        self.config.admits_gene(entity)
    }

    fn begin_entity(&mut self, ctx: &ScanContext) {
        self.current = Some(GeneBatch {
            organisation: ctx.organisation().to_string(),
            gene: ctx.entity().to_string(),
            ..GeneBatch::default()
        });
        self.diplotype = None;
        self.variant = None;
    }

    fn apply(&mut self, field: GeneField, ctx: &ScanContext, token: &Token) -> Result<(), ExtractError> {
        match field {
            GeneField::DiplotypeStart => {
                self.diplotype = Some(DiplotypeRecord::new(ctx.organisation(), ctx.entity()));
            }
            GeneField::DiplotypeAllele => {
                if let (Some(diplotype), Some(name)) = (self.diplotype.as_mut(), token.as_str()) {
                    diplotype.alleles.push(name.to_string());
                }
            }
            GeneField::Phenotype => {
                if let (Some(diplotype), Some(phenotype)) = (self.diplotype.as_mut(), token.as_str()) {
                    diplotype.phenotypes.push(phenotype.to_string());
                }
            }
            GeneField::DiplotypeEnd => {
                if let (Some(diplotype), Some(batch)) = (self.diplotype.take(), self.current.as_mut()) {
                    let key = diplotype_key(&diplotype.org, &diplotype.gene, &diplotype.alleles);
                    batch.diplotype_keys.push(key);
                    batch.diplotypes.push(diplotype);
                }
            }
            GeneField::VariantStart => self.variant = Some(VariantDraft::default()),
            GeneField::Chromosome => {
                if let Some(variant) = self.variant.as_mut() {
                    variant.chromosome = scalar_text(token);
                }
            }
            GeneField::Position => {
                let position = parse_position(token, ctx)?;
                if let Some(variant) = self.variant.as_mut() {
                    variant.position = position;
                }
            }
            GeneField::RsId => {
                if let Some(variant) = self.variant.as_mut() {
                    variant.rsid = scalar_text(token);
                }
            }
            GeneField::Call => {
                if let Some(variant) = self.variant.as_mut() {
                    variant.call = scalar_text(token);
                }
            }
            GeneField::VariantAllele => {
                if let (Some(variant), Some(allele)) = (self.variant.as_mut(), scalar_text(token)) {
                    variant.alleles.push(allele);
                }
            }
            GeneField::VariantEnd => self.finish_variant(ctx)?,
            GeneField::GeneEnd => {
                if let Some(batch) = self.current.take() {
                    debug!(
                        "Gene {}/{}: {} diplotypes, {} variants",
                        batch.organisation,
                        batch.gene,
                        batch.diplotypes.len(),
                        batch.variants.len()
                    );
                    self.ready = Some(batch);
                }
            }
        }
        Ok(())
    }

    fn take_batch(&mut self) -> Option<GeneBatch> {
        self.ready.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrganisationPair;
    use crate::scanner::TokenScanner;
    use crate::zygosity::ZygosityError;
    use std::io::Cursor;

    struct FixedResolver;

    impl ZygosityResolver for FixedResolver {
        fn resolve(&mut self, chromosome: &str, position: u64) -> Result<ZygosityLookup, ZygosityError> {
            match position {
                1 => Ok(ZygosityLookup::NotFound),
                2 => Err(ZygosityError::UnknownChromosome(chromosome.to_string())),
                _ => Ok(ZygosityLookup::Found(ZygosityCall {
                    chrom_ref: "10".to_string(),
                    pos_vcf: position,
                    ref_vcf: "G".to_string(),
                    alts_vcf: vec!["G".to_string(), "A".to_string()],
                    zygosity: "0|1".to_string(),
                })),
            }
        }
    }

    fn config() -> ExtractionConfig {
        ExtractionConfig::new(
            vec![OrganisationPair {
                gene: "CPIC".to_string(),
                drug: "CPIC Guideline Annotation".to_string(),
            }],
            ["CYP2C19"],
            ["clopidogrel"],
        )
    }

    fn extract(doc: &str) -> (Vec<Result<GeneBatch, ExtractError>>, usize) {
        let config = config();
        let mut resolver = FixedResolver;
        let scanner = TokenScanner::new(Cursor::new(doc.as_bytes().to_vec()));
        let mut extractor = Extractor::new(scanner, GeneExtraction::new(&config, &mut resolver));
        let batches: Vec<_> = extractor.by_ref().collect();
        let degraded = extractor.extraction().degraded_lookups();
        (batches, degraded)
    }

    const DOC: &str = r#"{
        "genes": {
            "CPIC": {
                "CYP2C19": {
                    "sourceDiplotypes": [
                        {"allele1": {"name": "*1"}, "allele2": {"name": "*2"},
                         "phenotypes": ["Intermediate Metabolizer"]}
                    ],
                    "variants": [
                        {"chromosome": "chr10", "position": 94781859, "dbSnpId": "rs4244285",
                         "call": "G/A", "alleles": ["*2"]},
                        {"chromosome": "chr10", "position": 1, "dbSnpId": null,
                         "call": "C/C", "alleles": ["*4"]},
                        {"chromosome": "chr10", "position": 2, "dbSnpId": "rs2",
                         "call": "T/T", "alleles": ["*1"]},
                        {"chromosome": "chr10", "position": 3, "dbSnpId": "rs3",
                         "call": null, "alleles": ["*1"]}
                    ]
                },
                "CYP3A5": {"sourceDiplotypes": [{"allele1": {"name": "*3"}}], "variants": []}
            },
            "DPWG": {"CYP2C19": {"sourceDiplotypes": [], "variants": []}}
        }
    }"#;

    #[test]
    fn test_gene_batch() {
        let (batches, degraded) = extract(DOC);
        assert_eq!(batches.len(), 1);
        let batch = batches.into_iter().next().unwrap().unwrap();

        assert_eq!(batch.gene, "CYP2C19");
        assert_eq!(batch.diplotypes.len(), 1);
        assert_eq!(batch.diplotype_keys, vec![diplotype_key("CPIC", "CYP2C19", &["*1", "*2"])]);

        // The null call is dropped
        assert_eq!(batch.variants.len(), 3);
        let first = &batch.variants[0];
        assert_eq!(first.zygosity, "0|1");
        assert_eq!(first.pos, 94781859);
        assert_eq!(first.mapping, variant_key("CPIC", Some("rs4244285"), "G/A", "0|1"));

        let not_found = &batch.variants[1];
        assert_eq!(not_found.ref_vcf, ".");
        assert_eq!(not_found.zygosity, "0|0");
        assert_eq!(not_found.chrom_ref, "10");
        assert_eq!(not_found.rsid, None);

        assert_eq!(batch.variants[2].zygosity, "0|0");
        assert_eq!(degraded, 1);

        // Linked variants: *2 from the first, *1 from the third
        let diplotype = &batch.diplotypes[0];
        assert_eq!(diplotype.phenotypes, vec!["Intermediate Metabolizer"]);
        assert_eq!(
            diplotype.variants,
            vec![Some("rs4244285".to_string()), Some("rs2".to_string())]
        );
        assert_eq!(diplotype.mapping.len(), 2);
    }

    #[test]
    fn test_missing_position_is_validation_error() {
        let doc = r#"{"genes": {"CPIC": {"CYP2C19": {"variants": [
            {"chromosome": "chr10", "call": "A/A", "alleles": []}
        ]}}}}"#;
        let (batches, _) = extract(doc);
        let err = batches.into_iter().next().unwrap().unwrap_err();
        assert!(matches!(err, ExtractError::MissingField { field: "position", .. }));
        assert!(err.is_validation());
    }

    #[test]
    fn test_invalid_position() {
        let doc = r#"{"genes": {"CPIC": {"CYP2C19": {"variants": [
            {"chromosome": "chr10", "position": "abc", "call": "A/A"}
        ]}}}}"#;
        let (batches, _) = extract(doc);
        assert!(matches!(
            batches[0],
            Err(ExtractError::InvalidValue { field: "position", .. })
        ));
    }

    #[test]
    fn test_empty_gene_still_batched() {
        let doc = r#"{"genes": {"CPIC": {"CYP2C19": {}}}}"#;
        let (batches, _) = extract(doc);
        let batch = batches.into_iter().next().unwrap().unwrap();
        assert!(batch.diplotypes.is_empty());
        assert!(batch.variants.is_empty());
    }
}

// ==============================================================================
// extract/drugs.rs - Drug Annotation Extraction
// ==============================================================================
// Description: Per-drug guideline annotations keyed to gene diplotypes
// Created: 2025-11-23
// Modified: 2025-12-02
// Version: 1.1.0
// ==============================================================================

use super::{scalar_text, ExtractError, Extraction, Extractor, On, PathRule, ScanContext};
use crate::config::ExtractionConfig;
use crate::keys::diplotype_key;
use crate::markup::strip_markup;
use crate::models::AnnotationRecord;
use crate::scanner::Token;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrugField {
    CitationsStart,
    Pmid,
    AnnotationStart,
    Implication,
    Recommendation,
    DosingInformation,
    AlternateDrugAvailable,
    OtherPrescribingGuidance,
    GenotypeDiplotypeStart,
    GenotypeGene,
    GenotypeAllele,
    GenotypeDiplotypeEnd,
    AnnotationEnd,
    DrugEnd,
}

const ANNOTATION: &str = "guidelines.item.annotations.item";

const DRUG_RULES: &[PathRule<DrugField>] = &[
    PathRule::new("citations", On::StartArray, DrugField::CitationsStart),
    PathRule::new("citations.item.pmid", On::Scalar, DrugField::Pmid),
    PathRule::new(ANNOTATION, On::StartMap, DrugField::AnnotationStart),
    PathRule::new(
        "guidelines.item.annotations.item.implications.item",
        On::Scalar,
        DrugField::Implication,
    ),
    PathRule::new(
        "guidelines.item.annotations.item.drugRecommendation",
        On::Scalar,
        DrugField::Recommendation,
    ),
    PathRule::new(
        "guidelines.item.annotations.item.dosingInformation",
        On::Scalar,
        DrugField::DosingInformation,
    ),
    PathRule::new(
        "guidelines.item.annotations.item.alternateDrugAvailable",
        On::Scalar,
        DrugField::AlternateDrugAvailable,
    ),
    PathRule::new(
        "guidelines.item.annotations.item.otherPrescribingGuidance",
        On::Scalar,
        DrugField::OtherPrescribingGuidance,
    ),
    PathRule::new(
        "guidelines.item.annotations.item.genotypes.item.diplotypes.item",
        On::StartMap,
        DrugField::GenotypeDiplotypeStart,
    ),
    PathRule::new(
        "guidelines.item.annotations.item.genotypes.item.diplotypes.item.gene",
        On::Scalar,
        DrugField::GenotypeGene,
    ),
    PathRule::new(
        "guidelines.item.annotations.item.genotypes.item.diplotypes.item.allele1.name",
        On::Scalar,
        DrugField::GenotypeAllele,
    ),
    PathRule::new(
        "guidelines.item.annotations.item.genotypes.item.diplotypes.item.allele2.name",
        On::Scalar,
        DrugField::GenotypeAllele,
    ),
    PathRule::new(
        "guidelines.item.annotations.item.genotypes.item.diplotypes.item",
        On::EndMap,
        DrugField::GenotypeDiplotypeEnd,
    ),
    PathRule::new(ANNOTATION, On::EndMap, DrugField::AnnotationEnd),
    PathRule::new("", On::EndMap, DrugField::DrugEnd),
];

/// Annotations for one drug
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrugBatch {
    pub organisation: String,
    pub drug: String,
    pub annotations: Vec<AnnotationRecord>,
    /// Diplotype join keys aligned with `annotations`
    pub join_keys: Vec<String>,
    /// Genotype entries dropped for lack of a gene
    pub unkeyed: usize,
}

#[derive(Debug, Default)]
struct GenotypeDraft {
    gene: Option<String>,
    alleles: Vec<String>,
}

/// Annotation-level fields may appear on either side of the genotype array,
/// so records are only built once the whole annotation has been read.
#[derive(Debug, Default)]
struct AnnotationDraft {
    implications: Vec<String>,
    recommendation: String,
    dosing_information: Option<Value>,
    alternate_drug_available: Option<Value>,
    other_prescribing_guidance: Option<Value>,
    genotypes: Vec<GenotypeDraft>,
    genotype: Option<GenotypeDraft>,
}

/// Drug-section extraction state
pub struct DrugExtraction<'a> {
    config: &'a ExtractionConfig,
    pmids: Vec<String>,
    annotation: Option<AnnotationDraft>,
    current: Option<DrugBatch>,
    ready: Option<DrugBatch>,
}

pub type DrugExtractor<'a, R> = Extractor<R, DrugExtraction<'a>>;

impl<'a> DrugExtraction<'a> {
    pub fn new(config: &'a ExtractionConfig) -> Self {
        Self {
            config,
            pmids: Vec::new(),
            annotation: None,
            current: None,
            ready: None,
        }
    }

    fn finish_annotation(&mut self, ctx: &ScanContext) {
        let (Some(draft), Some(batch)) = (self.annotation.take(), self.current.as_mut()) else {
            return;
        };

        let gene_organisation = self
            .config
            .gene_organisation_for_drug(ctx.organisation())
            .unwrap_or_default();

        for genotype in draft.genotypes {
            let Some(gene) = genotype.gene else {
                batch.unkeyed += 1;
                continue;
            };
            if !self.config.admits_gene(&gene) {
                continue;
            }

            batch
                .join_keys
                .push(diplotype_key(gene_organisation, &gene, &genotype.alleles));
            batch.annotations.push(AnnotationRecord {
                org: ctx.organisation().to_string(),
                drug: ctx.entity().to_string(),
                gene,
                alleles: genotype.alleles,
                pmids: self.pmids.clone(),
                implications: draft.implications.clone(),
                recommendation: draft.recommendation.clone(),
                dosing_information: draft.dosing_information.clone(),
                alternate_drug_available: draft.alternate_drug_available.clone(),
                other_prescribing_guidance: draft.other_prescribing_guidance.clone(),
            });
        }
    }
}

impl Extraction for DrugExtraction<'_> {
    type Field = DrugField;
    type Batch = DrugBatch;

    const SECTION: &'static str = "drugs";
    const RULES: &'static [PathRule<DrugField>] = DRUG_RULES;

    fn admits_organisation(&self, organisation: &str) -> bool {
        self.config.admits_drug_organisation(organisation)
    }

    fn admits_entity(&self, entity: &str) -> bool {
        self.config.admits_drug(entity)
    }

    fn begin_entity(&mut self, ctx: &ScanContext) {
        self.current = Some(DrugBatch {
            organisation: ctx.organisation().to_string(),
            drug: ctx.entity().to_string(),
            ..DrugBatch::default()
        });
        self.pmids.clear();
        self.annotation = None;
    }

    fn apply(&mut self, field: DrugField, ctx: &ScanContext, token: &Token) -> Result<(), ExtractError> {
        match field {
            DrugField::CitationsStart => self.pmids.clear(),
            DrugField::Pmid => self.pmids.extend(scalar_text(token)),
            DrugField::AnnotationStart => self.annotation = Some(AnnotationDraft::default()),
            DrugField::AnnotationEnd => self.finish_annotation(ctx),
            DrugField::DrugEnd => {
                if let Some(batch) = self.current.take() {
                    debug!(
                        "Drug {}/{}: {} annotations",
                        batch.organisation,
                        batch.drug,
                        batch.annotations.len()
                    );
                    self.ready = Some(batch);
                }
            }
            _ => {
                let Some(draft) = self.annotation.as_mut() else {
                    return Ok(());
                };
                match field {
                    DrugField::Implication => {
                        if let Some(text) = token.as_str() {
                            draft.implications.push(strip_markup(text));
                        }
                    }
                    DrugField::Recommendation => {
                        if let Some(text) = token.as_str() {
                            draft.recommendation = strip_markup(text);
                        }
                    }
                    DrugField::DosingInformation => draft.dosing_information = token.value.clone(),
                    DrugField::AlternateDrugAvailable => {
                        draft.alternate_drug_available = token.value.clone()
                    }
                    DrugField::OtherPrescribingGuidance => {
                        draft.other_prescribing_guidance = token.value.clone()
                    }
                    DrugField::GenotypeDiplotypeStart => draft.genotype = Some(GenotypeDraft::default()),
                    DrugField::GenotypeGene => {
                        if let Some(genotype) = draft.genotype.as_mut() {
                            genotype.gene = token.as_str().map(str::to_string);
                        }
                    }
                    DrugField::GenotypeAllele => {
                        if let (Some(genotype), Some(name)) = (draft.genotype.as_mut(), token.as_str()) {
                            genotype.alleles.push(name.to_string());
                        }
                    }
                    DrugField::GenotypeDiplotypeEnd => {
                        if let Some(genotype) = draft.genotype.take() {
                            draft.genotypes.push(genotype);
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn take_batch(&mut self) -> Option<DrugBatch> {
        self.ready.take()
    }
}

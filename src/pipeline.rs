// ==============================================================================
// pipeline.rs - Report Post-Processing Pipeline
// ==============================================================================
// Description: Scan, extract, defer-join, paginate and persist one report
// Created: 2025-11-26
// Modified: 2025-12-09
// Version: 1.2.0
// ==============================================================================
// One invocation runs strictly in sequence:
//
//   1. download the source report into a private scratch directory
//   2. gene pass: diplotypes -> join store, variants -> de-duplicated lines
//   3. drug pass: annotations merged into stored diplotypes
//   4. message pass
//   5. merged diplotypes, variants, messages -> paginated artifact
//   6. upload artifact + compressed index, delete the source object
//
// Steps 2-5 are synchronous file work plus one bcftools call per variant and
// run on the blocking pool. Scratch files are discarded whether or not the
// run succeeds.
// ==============================================================================

use crate::config::{index_key, result_key, ExtractionConfig, PageLimits};
use crate::error::PipelineError;
use crate::extract::{DrugExtraction, Extractor, GeneExtraction, MessageExtraction};
use crate::jobs::JobTracker;
use crate::join_store::{DeferredJoin, KeyedJoinStore, VariantDeduplicator};
use crate::models::{DiplotypeRecord, OutputRecord};
use crate::pagination::{PageIndex, PagedWriter};
use crate::scanner::TokenScanner;
use crate::scratch::ScratchSpace;
use crate::storage::ObjectStore;
use crate::zygosity::ZygosityResolver;
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One post-processing job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub job_id: Uuid,
    pub project: String,
    /// Object key of the source report
    pub source_key: String,
    /// Object key the flattened artifact is written to
    pub result_key: String,
}

impl JobRequest {
    pub fn new(job_id: Uuid, project: &str, source_key: &str, result_suffix: &str) -> Self {
        Self {
            job_id,
            project: project.to_string(),
            source_key: source_key.to_string(),
            result_key: result_key(project, &job_id.to_string(), result_suffix),
        }
    }
}

/// Counts reported by a finished invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub genes: usize,
    pub diplotypes: usize,
    pub variants_kept: usize,
    pub variants_duplicate: usize,
    pub degraded_lookups: usize,
    pub zygosity_cache_hits: usize,
    pub annotations_merged: usize,
    pub annotations_skipped: usize,
    pub annotations_duplicate: usize,
    pub annotations_unkeyed: usize,
    pub messages: usize,
    pub pages: usize,
    pub artifact_bytes: u64,
}

fn write_line<W: Write, T: Serialize>(out: &mut W, record: &T) -> Result<(), PipelineError> {
    serde_json::to_writer(&mut *out, record)?;
    out.write_all(b"\n")?;
    Ok(())
}

/// Scratch files of one invocation
struct WorkFiles {
    source: PathBuf,
    diplotypes: PathBuf,
    variants: PathBuf,
    merged: PathBuf,
    messages: PathBuf,
    artifact: PathBuf,
}

impl WorkFiles {
    fn new(scratch: &ScratchSpace) -> Self {
        Self {
            source: scratch.file("source.json"),
            diplotypes: scratch.file("diplotypes.jsonl"),
            variants: scratch.file("variants.jsonl"),
            merged: scratch.file("merged.jsonl"),
            messages: scratch.file("messages.jsonl"),
            artifact: scratch.file("artifact.jsonl"),
        }
    }
}

/// Synchronous part of an invocation: the three report passes and assembly
struct Flattener {
    config: Arc<ExtractionConfig>,
    limits: PageLimits,
}

impl Flattener {
    fn flatten(
        &self,
        files: &WorkFiles,
        resolver: &mut dyn ZygosityResolver,
    ) -> Result<(PageIndex, RunSummary), PipelineError> {
        let mut summary = RunSummary::default();

        let join_store = self.gene_pass(files, resolver, &mut summary)?;
        self.drug_pass(files, join_store, &mut summary)?;
        self.message_pass(files, &mut summary)?;

        let parts = [
            files.merged.as_path(),
            files.variants.as_path(),
            files.messages.as_path(),
        ];
        let index = self.assemble(&parts, &files.artifact)?;
        summary.pages = index.len();
        Ok((index, summary))
    }

    fn gene_pass(
        &self,
        files: &WorkFiles,
        resolver: &mut dyn ZygosityResolver,
        summary: &mut RunSummary,
    ) -> Result<KeyedJoinStore<DiplotypeRecord>, PipelineError> {
        let mut join_store = KeyedJoinStore::create(&files.diplotypes)?;
        let mut variants_out = BufWriter::new(File::create(&files.variants)?);
        let mut dedup = VariantDeduplicator::new();

        let scanner = TokenScanner::from_path(&files.source)?;
        let mut genes = Extractor::new(scanner, GeneExtraction::new(&self.config, resolver));

        for batch in genes.by_ref() {
            let batch = batch?;
            summary.genes += 1;

            for (diplotype, key) in batch.diplotypes.iter().zip(&batch.diplotype_keys) {
                join_store.write(key, diplotype)?;
                summary.diplotypes += 1;
            }

            for variant in batch.variants {
                if dedup.admit(&variant.mapping) {
                    write_line(&mut variants_out, &OutputRecord::Variant(variant))?;
                }
            }
        }
        variants_out.flush()?;

        summary.degraded_lookups = genes.extraction().degraded_lookups();
        drop(genes);
        summary.zygosity_cache_hits = resolver.cache_hits();
        summary.variants_kept = dedup.kept();
        summary.variants_duplicate = dedup.duplicates();
        info!(
            "Gene pass: {} genes, {} diplotypes ({} join keys), {} variants ({} duplicates dropped, {} cached lookups)",
            summary.genes,
            summary.diplotypes,
            join_store.len(),
            summary.variants_kept,
            summary.variants_duplicate,
            summary.zygosity_cache_hits
        );
        Ok(join_store)
    }

    fn drug_pass(
        &self,
        files: &WorkFiles,
        join_store: KeyedJoinStore<DiplotypeRecord>,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        let mut merged_out = BufWriter::new(File::create(&files.merged)?);
        let mut join = DeferredJoin::new(join_store);

        let scanner = TokenScanner::from_path(&files.source)?;
        for batch in Extractor::new(scanner, DrugExtraction::new(&self.config)) {
            let batch = batch?;
            summary.annotations_unkeyed += batch.unkeyed;

            for (annotation, key) in batch.annotations.iter().zip(&batch.join_keys) {
                if let Some(diplotype) = join.merge(key, annotation)? {
                    write_line(&mut merged_out, &OutputRecord::Diplotype(diplotype))?;
                }
            }
        }
        merged_out.flush()?;

        let stats = join.stats();
        summary.annotations_merged = stats.merged;
        summary.annotations_skipped = stats.skipped_unmatched;
        summary.annotations_duplicate = stats.duplicates;
        info!(
            "Drug pass: {} annotations merged, {} without diplotype, {} duplicates, {} unkeyed",
            stats.merged, stats.skipped_unmatched, stats.duplicates, summary.annotations_unkeyed
        );
        Ok(())
    }

    fn message_pass(&self, files: &WorkFiles, summary: &mut RunSummary) -> Result<(), PipelineError> {
        let mut messages_out = BufWriter::new(File::create(&files.messages)?);

        let scanner = TokenScanner::from_path(&files.source)?;
        for batch in Extractor::new(scanner, MessageExtraction::new(&self.config)) {
            for message in batch?.messages {
                write_line(&mut messages_out, &OutputRecord::Message(message))?;
                summary.messages += 1;
            }
        }
        messages_out.flush()?;

        info!("Message pass: {} messages", summary.messages);
        Ok(())
    }

    /// Concatenate intermediate line files into the paginated artifact
    fn assemble(&self, parts: &[&Path], artifact: &Path) -> Result<PageIndex, PipelineError> {
        let mut writer = PagedWriter::new(BufWriter::new(File::create(artifact)?), self.limits);
        let mut line = Vec::new();

        for part in parts {
            let mut reader = BufReader::new(File::open(part)?);
            loop {
                line.clear();
                if reader.read_until(b'\n', &mut line)? == 0 {
                    break;
                }
                writer.write_record(&line)?;
            }
        }

        let (_, index) = writer.finish()?;
        Ok(index)
    }
}

/// Flattens clinical reports into paginated artifacts
pub struct PostProcessor {
    store: Arc<dyn ObjectStore>,
    config: Arc<ExtractionConfig>,
    limits: PageLimits,
    scratch_base: PathBuf,
}

impl PostProcessor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        config: ExtractionConfig,
        limits: PageLimits,
        scratch_base: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            config: Arc::new(config),
            limits,
            scratch_base: scratch_base.into(),
        }
    }

    /// Run one job and report its outcome to the job-status collaborator.
    ///
    /// Validation errors are returned without a status change; any other
    /// error marks the job failed (once).
    pub async fn execute(
        &self,
        request: &JobRequest,
        resolver: Box<dyn ZygosityResolver>,
        tracker: &JobTracker,
    ) -> Result<RunSummary, PipelineError> {
        match self.process(request, resolver).await {
            Ok(summary) => {
                tracker.mark_completed(request.job_id).await?;
                Ok(summary)
            }
            Err(e) if e.is_validation() => {
                warn!("Job {} rejected source document: {}", request.job_id, e);
                Err(e)
            }
            Err(e) => {
                tracker.record_failure(request.job_id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Run one job inside its own scratch space
    pub async fn process(
        &self,
        request: &JobRequest,
        resolver: Box<dyn ZygosityResolver>,
    ) -> Result<RunSummary, PipelineError> {
        let scratch = ScratchSpace::create(&self.scratch_base, &request.job_id.to_string())
            .map_err(PipelineError::Scratch)?;
        info!(
            "Processing job {} ({} -> {}) in {:?}",
            request.job_id,
            request.source_key,
            request.result_key,
            scratch.root()
        );

        let result = self.run(request, resolver, &scratch).await;

        match (result, scratch.discard().await) {
            (Ok(summary), Ok(())) => Ok(summary),
            (Ok(_), Err(e)) => Err(PipelineError::Scratch(e)),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(discard_error)) => {
                warn!("Failed to discard scratch space: {:#}", discard_error);
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        request: &JobRequest,
        mut resolver: Box<dyn ZygosityResolver>,
        scratch: &ScratchSpace,
    ) -> Result<RunSummary, PipelineError> {
        let files = WorkFiles::new(scratch);
        let size = self.store.download_file(&request.source_key, &files.source).await?;
        info!("Downloaded {} ({} bytes)", request.source_key, size);

        let artifact = files.artifact.clone();
        let flattener = Flattener {
            config: Arc::clone(&self.config),
            limits: self.limits,
        };
        let (index, mut summary) =
            tokio::task::spawn_blocking(move || flattener.flatten(&files, resolver.as_mut())).await??;

        summary.artifact_bytes = self.store.upload_file(&request.result_key, &artifact).await?;
        self.store
            .put(&index_key(&request.result_key), index.to_compressed()?)
            .await?;
        info!(
            "Stored {} ({} bytes, {} pages)",
            request.result_key, summary.artifact_bytes, summary.pages
        );

        if request.source_key != request.result_key {
            self.store.delete(&request.source_key).await?;
            debug!("Deleted intermediate object {}", request.source_key);
        }

        info!("Job {} summary: {:?}", request.job_id, summary);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OrganisationPair, ReaderConfig};
    use crate::jobs::{InMemoryJobStatusStore, JobStatus};
    use crate::reader::PagedReader;
    use crate::storage::{LocalObjectStore, StorageError};
    use crate::zygosity::{CachedResolver, ZygosityCall, ZygosityError, ZygosityLookup};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    const SOURCE_KEY: &str = "projects/proj/pharmcat/report.json";

    const REPORT: &str = r#"{
        "genes": {
            "CPIC": {
                "CYP2C19": {
                    "sourceDiplotypes": [
                        {"allele1": {"name": "*1"}, "allele2": {"name": "*2"},
                         "phenotypes": ["Intermediate Metabolizer"]}
                    ],
                    "variants": [
                        {"chromosome": "chr10", "position": 94781859, "dbSnpId": "rs4244285",
                         "call": "G/A", "alleles": ["*2"]}
                    ],
                    "messages": [
                        {"rule_name": "reference-allele", "message": "Reference allele assumed"}
                    ]
                },
                "CYP2D6": {
                    "sourceDiplotypes": [
                        {"allele1": {"name": "*1"}, "allele2": {"name": "*4"},
                         "phenotypes": ["Intermediate Metabolizer"]}
                    ],
                    "variants": [
                        {"chromosome": "chr10", "position": 94781859, "dbSnpId": "rs4244285",
                         "call": "G/A", "alleles": ["*4"]},
                        {"chromosome": "chr22", "position": 42128945, "dbSnpId": "rs3892097",
                         "call": "C/T", "alleles": ["*4"]}
                    ]
                }
            }
        },
        "drugs": {
            "CPIC Guideline Annotation": {
                "clopidogrel": {
                    "citations": [{"pmid": "23698643"}],
                    "guidelines": [{
                        "annotations": [
                            {"implications": ["Reduced platelet inhibition"],
                             "drugRecommendation": "<p>Use an alternative</p>",
                             "genotypes": [{"diplotypes": [
                                {"gene": "CYP2C19", "allele1": {"name": "*1"}, "allele2": {"name": "*2"}}
                             ]}]},
                            {"implications": ["Significantly reduced inhibition"],
                             "drugRecommendation": "Avoid",
                             "genotypes": [{"diplotypes": [
                                {"gene": "CYP2C19", "allele1": {"name": "*2"}, "allele2": {"name": "*2"}}
                             ]}]}
                        ]
                    }]
                }
            }
        }
    }"#;

    struct HeterozygousResolver;

    impl ZygosityResolver for HeterozygousResolver {
        fn resolve(&mut self, chromosome: &str, position: u64) -> Result<ZygosityLookup, ZygosityError> {
            Ok(ZygosityLookup::Found(ZygosityCall {
                chrom_ref: chromosome.trim_start_matches("chr").to_string(),
                pos_vcf: position,
                ref_vcf: "G".to_string(),
                alts_vcf: vec!["G".to_string(), "A".to_string()],
                zygosity: "0|1".to_string(),
            }))
        }
    }

    struct Fixture {
        _dir: TempDir,
        scratch_base: PathBuf,
        store: Arc<LocalObjectStore>,
        statuses: Arc<InMemoryJobStatusStore>,
        tracker: JobTracker,
        processor: PostProcessor,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let scratch_base = dir.path().join("scratch");
        let store = Arc::new(LocalObjectStore::new(dir.path().join("objects")));
        let statuses = Arc::new(InMemoryJobStatusStore::new());
        let tracker = JobTracker::new(statuses.clone(), "postprocessor");

        let config = ExtractionConfig::new(
            vec![OrganisationPair {
                gene: "CPIC".to_string(),
                drug: "CPIC Guideline Annotation".to_string(),
            }],
            ["CYP2C19", "CYP2D6"],
            ["clopidogrel"],
        );
        let processor = PostProcessor::new(
            store.clone(),
            config,
            PageLimits::new(2, 1_000_000).unwrap(),
            &scratch_base,
        );

        Fixture {
            _dir: dir,
            scratch_base,
            store,
            statuses,
            tracker,
            processor,
        }
    }

    fn records(content: &str) -> Vec<OutputRecord> {
        content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_job_request_keys() {
        let job_id = Uuid::nil();
        let request = JobRequest::new(job_id, "proj", SOURCE_KEY, ".jsonl");
        assert_eq!(
            request.result_key,
            "projects/proj/clinical-workflows/00000000-0000-0000-0000-000000000000.jsonl"
        );
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let f = fixture();
        f.store.put(SOURCE_KEY, REPORT.as_bytes().to_vec()).await.unwrap();
        let request = JobRequest::new(Uuid::new_v4(), "proj", SOURCE_KEY, ".jsonl");

        let summary = f
            .processor
            .execute(&request, Box::new(HeterozygousResolver), &f.tracker)
            .await
            .unwrap();

        assert_eq!(summary.genes, 2);
        assert_eq!(summary.diplotypes, 2);
        assert_eq!(summary.variants_kept, 2);
        assert_eq!(summary.variants_duplicate, 1);
        assert_eq!(summary.annotations_merged, 1);
        assert_eq!(summary.annotations_skipped, 1);
        assert_eq!(summary.messages, 1);
        assert_eq!(summary.pages, 2);

        // Merged diplotypes first, then variants, then messages
        let artifact = f.store.get(&request.result_key, None).await.unwrap();
        let lines = records(std::str::from_utf8(&artifact).unwrap());
        assert_eq!(lines.len(), 4);

        let OutputRecord::Diplotype(diplotype) = &lines[0] else {
            panic!("expected diplotype, got {:?}", lines[0]);
        };
        assert_eq!(diplotype.org, "CPIC Guideline Annotation");
        assert_eq!(diplotype.gene, "CYP2C19");
        assert_eq!(diplotype.drug, "clopidogrel");
        assert_eq!(diplotype.recommendation, "Use an alternative");
        assert_eq!(diplotype.pmids, vec!["23698643"]);
        assert_eq!(diplotype.variants, vec![Some("rs4244285".to_string())]);

        assert!(matches!(&lines[1], OutputRecord::Variant(v) if v.rsid.as_deref() == Some("rs4244285")));
        assert!(matches!(&lines[2], OutputRecord::Variant(v) if v.rsid.as_deref() == Some("rs3892097")));
        assert!(matches!(&lines[3], OutputRecord::Message(m) if m.gene == "CYP2C19"));

        // Source consumed, scratch discarded
        assert!(matches!(
            f.store.head(SOURCE_KEY).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(!f.scratch_base.join(request.job_id.to_string()).exists());

        let updates = f.statuses.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.status, JobStatus::Completed);

        // Paged retrieval through the stored index
        let reader = PagedReader::new(
            f.store.clone(),
            ReaderConfig {
                small_artifact_threshold: 0,
            },
        );
        let page = reader.read_page(&request.result_key, Some(2)).await.unwrap();
        assert_eq!(page.pages, BTreeMap::from([(1, 2), (2, 2)]));
        assert_eq!(records(&page.content), lines[2..].to_vec());
    }

    /// Records the thread each lookup runs on
    struct ThreadRecordingResolver {
        threads: Arc<std::sync::Mutex<Vec<std::thread::ThreadId>>>,
    }

    impl ZygosityResolver for ThreadRecordingResolver {
        fn resolve(&mut self, chromosome: &str, position: u64) -> Result<ZygosityLookup, ZygosityError> {
            self.threads.lock().unwrap().push(std::thread::current().id());
            HeterozygousResolver.resolve(chromosome, position)
        }
    }

    #[tokio::test]
    async fn test_lookups_run_on_blocking_pool() {
        let f = fixture();
        f.store.put(SOURCE_KEY, REPORT.as_bytes().to_vec()).await.unwrap();
        let request = JobRequest::new(Uuid::new_v4(), "proj", SOURCE_KEY, ".jsonl");

        let threads = Arc::new(std::sync::Mutex::new(Vec::new()));
        let resolver = CachedResolver::new(ThreadRecordingResolver {
            threads: threads.clone(),
        });

        let summary = f
            .processor
            .execute(&request, Box::new(resolver), &f.tracker)
            .await
            .unwrap();

        // rs4244285 is reported under both genes; the second lookup is cached
        let threads = threads.lock().unwrap();
        assert_eq!(threads.len(), 2);
        assert_eq!(summary.zygosity_cache_hits, 1);
        assert!(threads.iter().all(|id| *id != std::thread::current().id()));
    }

    #[tokio::test]
    async fn test_missing_source_fails_once() {
        let f = fixture();
        let request = JobRequest::new(Uuid::new_v4(), "proj", SOURCE_KEY, ".jsonl");

        for _ in 0..2 {
            let err = f
                .processor
                .execute(&request, Box::new(HeterozygousResolver), &f.tracker)
                .await
                .unwrap_err();
            assert!(matches!(err, PipelineError::Storage(StorageError::NotFound(_))));
        }

        let updates = f.statuses.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.status, JobStatus::Failed);
        assert_eq!(updates[0].1.failed_step.as_deref(), Some("postprocessor"));
        assert!(!f.scratch_base.join(request.job_id.to_string()).exists());
    }

    #[tokio::test]
    async fn test_malformed_report_leaves_status_untouched() {
        let f = fixture();
        let truncated = &REPORT[..REPORT.len() / 3];
        f.store.put(SOURCE_KEY, truncated.as_bytes().to_vec()).await.unwrap();
        let request = JobRequest::new(Uuid::new_v4(), "proj", SOURCE_KEY, ".jsonl");

        let err = f
            .processor
            .execute(&request, Box::new(HeterozygousResolver), &f.tracker)
            .await
            .unwrap_err();

        assert!(err.is_validation());
        assert!(f.statuses.updates().is_empty());
        assert!(f.store.head(SOURCE_KEY).await.is_ok());
        assert!(matches!(
            f.store.head(&request.result_key).await,
            Err(StorageError::NotFound(_))
        ));
    }
}

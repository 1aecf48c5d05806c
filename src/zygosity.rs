// ==============================================================================
// zygosity.rs - Variant Zygosity Lookup
// ==============================================================================
// Description: Genotype lookups against the source VCF via bcftools/tabix
// Created: 2025-11-22
// Modified: 2025-12-02
// Version: 1.1.0
// ==============================================================================

use crate::config::ToolPaths;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info};

/// Canonical chromosome names
pub const CHROMOSOMES: [&str; 25] = [
    "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16", "17",
    "18", "19", "20", "21", "22", "X", "Y", "MT",
];

const CHROMOSOME_ALIASES: [(&str, &str); 3] = [("M", "MT"), ("x", "X"), ("y", "Y")];

/// bcftools query format: position, reference, alternates, genotype
const QUERY_FORMAT: &str = "%POS\t%REF\t%ALT\t[%GT]\n";

#[derive(Error, Debug)]
pub enum ZygosityError {
    #[error("Failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("Unparseable query output '{line}': {reason}")]
    Parse { line: String, reason: String },

    #[error("Chromosome '{0}' not present in VCF")]
    UnknownChromosome(String),
}

/// Genotype view of one VCF position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZygosityCall {
    /// Canonical chromosome name
    pub chrom_ref: String,
    pub pos_vcf: u64,
    pub ref_vcf: String,
    /// Bases called on each haplotype, "." where the allele index is missing
    pub alts_vcf: Vec<String>,
    /// Raw genotype (e.g., "0|1", "1/1")
    pub zygosity: String,
}

impl ZygosityCall {
    /// Zero-depth reference call used when the VCF has no record
    pub fn reference_sentinel(chrom_ref: &str, position: u64) -> Self {
        Self {
            chrom_ref: chrom_ref.to_string(),
            pos_vcf: position,
            ref_vcf: ".".to_string(),
            alts_vcf: vec![".".to_string(), ".".to_string()],
            zygosity: "0|0".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZygosityLookup {
    Found(ZygosityCall),
    NotFound,
}

/// Resolves the genotype at a reported variant position
pub trait ZygosityResolver: Send {
    fn resolve(&mut self, chromosome: &str, position: u64) -> Result<ZygosityLookup, ZygosityError>;

    /// Lookups answered without consulting the VCF
    fn cache_hits(&self) -> usize {
        0
    }
}

/// Match a contig name to a canonical chromosome by stripping leading characters
///
/// `chr10` -> `10`, `chrM` -> `MT`, `CHRX` -> `X`. Returns `None` when no suffix
/// of the name is a known chromosome or alias. Unplaced and alt contigs
/// (`chrUn_KI270302v1`, `chr6_GL000250v2_alt`) never match.
pub fn match_chromosome_name(name: &str) -> Option<&'static str> {
    if name.contains('_') {
        return None;
    }

    name.char_indices().find_map(|(i, _)| {
        let suffix = &name[i..];
        CHROMOSOMES
            .iter()
            .copied()
            .find(|c| *c == suffix)
            .or_else(|| {
                CHROMOSOME_ALIASES
                    .iter()
                    .find(|(alias, _)| *alias == suffix)
                    .map(|(_, canonical)| *canonical)
            })
    })
}

/// Parse one line of `bcftools query` output in [`QUERY_FORMAT`]
pub fn parse_query_output(chrom_ref: &str, output: &str) -> Result<Option<ZygosityCall>, ZygosityError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .quoting(false)
        .flexible(true)
        .from_reader(output.as_bytes());

    let Some(record) = reader.records().next() else {
        return Ok(None);
    };
    let record = record.map_err(|e| ZygosityError::Parse {
        line: output.trim_end().to_string(),
        reason: e.to_string(),
    })?;

    let parse_error = |reason: &str| ZygosityError::Parse {
        line: output.trim_end().to_string(),
        reason: reason.to_string(),
    };

    if record.len() != 4 {
        return Err(parse_error("expected 4 tab-separated columns"));
    }

    let pos_vcf: u64 = record[0].parse().map_err(|_| parse_error("invalid position"))?;
    let ref_vcf = record[1].to_string();
    let genotype = record[3].to_string();

    let mut alleles = vec![ref_vcf.clone()];
    alleles.extend(record[2].split(',').map(str::to_string));

    let alts_vcf = genotype
        .split(['|', '/'])
        .map(|index| {
            index
                .parse::<usize>()
                .ok()
                .and_then(|i| alleles.get(i).cloned())
                .unwrap_or_else(|| ".".to_string())
        })
        .collect();

    Ok(Some(ZygosityCall {
        chrom_ref: chrom_ref.to_string(),
        pos_vcf,
        ref_vcf,
        alts_vcf,
        zygosity: genotype,
    }))
}

fn run_tool(program: &Path, args: &[&str]) -> Result<String, ZygosityError> {
    let tool = program.display().to_string();
    debug!("Running {} {}", tool, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| ZygosityError::Spawn {
            tool: tool.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(ZygosityError::Failed {
            tool,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Resolver backed by `bcftools query` against an indexed VCF
pub struct BcftoolsResolver {
    vcf: PathBuf,
    bcftools: PathBuf,
    /// Canonical chromosome -> contig name used in the VCF
    contigs: HashMap<&'static str, String>,
}

impl BcftoolsResolver {
    /// Open a VCF and read its contig list with `tabix --list-chroms`
    pub fn open(vcf: impl Into<PathBuf>, tools: &ToolPaths) -> Result<Self, ZygosityError> {
        let vcf = vcf.into();
        let listing = run_tool(&tools.tabix, &["--list-chroms", &vcf.to_string_lossy()])?;

        let contigs = Self::contig_mapping(listing.lines());
        info!("VCF {:?} exposes {} recognised contigs", vcf, contigs.len());

        Ok(Self {
            vcf,
            bcftools: tools.bcftools.clone(),
            contigs,
        })
    }

    /// First contig wins, so `chr1` is not shadowed by a later `chrUn_...v1`
    fn contig_mapping<'a>(names: impl Iterator<Item = &'a str>) -> HashMap<&'static str, String> {
        let mut contigs = HashMap::new();
        for name in names.map(str::trim).filter(|name| !name.is_empty()) {
            if let Some(canonical) = match_chromosome_name(name) {
                contigs.entry(canonical).or_insert_with(|| name.to_string());
            }
        }
        contigs
    }
}

impl ZygosityResolver for BcftoolsResolver {
    fn resolve(&mut self, chromosome: &str, position: u64) -> Result<ZygosityLookup, ZygosityError> {
        let canonical = match_chromosome_name(chromosome)
            .ok_or_else(|| ZygosityError::UnknownChromosome(chromosome.to_string()))?;
        let contig = self
            .contigs
            .get(canonical)
            .ok_or_else(|| ZygosityError::UnknownChromosome(chromosome.to_string()))?;

        let region = format!("{}:{}-{}", contig, position, position);
        let output = run_tool(
            &self.bcftools,
            &["query", "-f", QUERY_FORMAT, &self.vcf.to_string_lossy(), "-r", &region],
        )?;

        Ok(match parse_query_output(canonical, &output)? {
            Some(call) => ZygosityLookup::Found(call),
            None => ZygosityLookup::NotFound,
        })
    }
}

/// Memoises lookups per (chromosome, position)
pub struct CachedResolver<R> {
    inner: R,
    cache: HashMap<(String, u64), ZygosityLookup>,
    hits: usize,
}

impl<R: ZygosityResolver> CachedResolver<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            cache: HashMap::new(),
            hits: 0,
        }
    }
}

impl<R: ZygosityResolver> ZygosityResolver for CachedResolver<R> {
    fn resolve(&mut self, chromosome: &str, position: u64) -> Result<ZygosityLookup, ZygosityError> {
        let key = (chromosome.to_string(), position);
        if let Some(lookup) = self.cache.get(&key) {
            self.hits += 1;
            return Ok(lookup.clone());
        }

        // Errors are not cached; the caller degrades them per variant
        let lookup = self.inner.resolve(chromosome, position)?;
        self.cache.insert(key, lookup.clone());
        Ok(lookup)
    }

    fn cache_hits(&self) -> usize {
        self.hits
    }
}

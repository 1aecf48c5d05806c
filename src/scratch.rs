// ==============================================================================
// scratch.rs - Per-Invocation Scratch Space
// ==============================================================================
// Description: Private temp directory for one job, overwritten on discard
// Created: 2025-11-25
// Modified: 2025-12-02
// Version: 1.1.0
// Security: Files are overwritten (zeros, random, zeros) before unlinking
// ==============================================================================

use anyhow::{Context, Result};
use rand::RngCore;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Overwrite chunk size
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
enum Pass {
    Zeros,
    Random,
}

/// Scratch directory `<base>/<job-id>/`
#[derive(Debug)]
pub struct ScratchSpace {
    root: PathBuf,
}

impl ScratchSpace {
    /// Create the job's scratch directory; an existing one is reused
    pub fn create(base: &Path, job_id: &str) -> Result<Self> {
        let root = base.join(job_id);
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create scratch directory {:?}", root))?;
        debug!("Scratch space at {:?}", root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a file inside the scratch space
    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Overwrite and remove everything in the scratch space
    pub async fn discard(self) -> Result<()> {
        if !self.root.exists() {
            return Ok(());
        }
        secure_delete_directory(&self.root).await
    }
}

fn overwrite(file: &mut std::fs::File, size: u64, pass: Pass) -> Result<()> {
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut rng = rand::thread_rng();

    file.seek(SeekFrom::Start(0))
        .context("Failed to seek to file start")?;

    let mut remaining = size;
    while remaining > 0 {
        let len = remaining.min(CHUNK_SIZE as u64) as usize;
        match pass {
            Pass::Zeros => buffer[..len].fill(0),
            Pass::Random => rng.fill_bytes(&mut buffer[..len]),
        }
        file.write_all(&buffer[..len])
            .context("Failed to write overwrite pattern")?;
        remaining -= len as u64;
    }

    file.sync_all().context("Failed to sync file to disk")?;
    Ok(())
}

/// Overwrite a file three times (zeros, random, zeros) and unlink it
pub async fn secure_delete_file(path: &Path) -> Result<()> {
    let size = std::fs::metadata(path)
        .context("Failed to get file metadata")?
        .len();

    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .context("Failed to open file for writing")?;

    for (i, pass) in [Pass::Zeros, Pass::Random, Pass::Zeros].into_iter().enumerate() {
        debug!("Pass {}/3 ({:?}) over {} bytes of {:?}", i + 1, pass, size, path);
        overwrite(&mut file, size, pass)?;
    }
    drop(file);

    std::fs::remove_file(path).context("Failed to remove file after secure overwrite")?;
    Ok(())
}

/// Securely delete a directory tree, files first
pub async fn secure_delete_directory(path: &Path) -> Result<()> {
    let mut files = 0usize;

    for entry in walkdir::WalkDir::new(path)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let entry_path = entry.path();

        if entry.file_type().is_file() {
            secure_delete_file(entry_path).await?;
            files += 1;
        } else if entry.file_type().is_dir() && entry_path != path {
            std::fs::remove_dir(entry_path).context("Failed to remove directory")?;
        }
    }

    std::fs::remove_dir(path).context("Failed to remove root directory")?;

    info!("Scratch directory {:?} discarded ({} files)", path, files);
    Ok(())
}

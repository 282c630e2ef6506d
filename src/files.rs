//! Per-market log files under the output root.
//!
//! Each market gets one newline-delimited JSON file named by its bare
//! market id. At settlement the log is compressed to `<marketId>.bz2`
//! alongside the original; cleanup of both is a separate, idempotent step.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bzip2::write::BzEncoder;
use bzip2::Compression;

const DEFAULT_OUTPUT_PATH: &str = "market_files";

pub struct FileManager {
    output_path: PathBuf,
}

impl FileManager {
    pub fn new(output_path: &str) -> Self {
        let output_path = if output_path.is_empty() {
            DEFAULT_OUTPUT_PATH
        } else {
            output_path
        };
        Self {
            output_path: PathBuf::from(output_path),
        }
    }

    /// Create (or truncate) the log file for a market and return a buffered
    /// writer over it. The output root is created on first use.
    pub fn create_market_writer(&self, market_id: &str) -> Result<BufWriter<File>> {
        fs::create_dir_all(&self.output_path)
            .with_context(|| format!("create output directory {}", self.output_path.display()))?;

        let path = self.market_file_path(market_id);
        let file = File::create(&path).with_context(|| format!("create market file {}", path.display()))?;
        Ok(BufWriter::new(file))
    }

    pub fn market_file_path(&self, market_id: &str) -> PathBuf {
        self.output_path.join(market_id)
    }

    pub fn compressed_file_path(&self, market_id: &str) -> PathBuf {
        self.output_path.join(format!("{market_id}.bz2"))
    }

    /// Compress `input` into `output` as a bzip2 stream. The input file is
    /// left in place.
    pub fn compress_to_bzip2(&self, input: &Path, output: &Path) -> Result<()> {
        let mut reader = File::open(input).with_context(|| format!("open input file {}", input.display()))?;
        let writer = File::create(output).with_context(|| format!("create output file {}", output.display()))?;

        let mut encoder = BzEncoder::new(writer, Compression::default());
        io::copy(&mut reader, &mut encoder).context("compress data")?;
        encoder.finish().context("finish bzip2 stream")?;
        Ok(())
    }

    /// Remove the given files. Missing files are not an error; nothing is
    /// surfaced to the caller.
    pub fn cleanup_files<'a>(&self, files: impl IntoIterator<Item = &'a Path>) {
        for file in files {
            let _ = fs::remove_file(file);
        }
    }
}

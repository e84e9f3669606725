//! CSV Staging: compressed, line-oriented working files produced by the
//! Extractor, one per table, consumed by the External Sorter and then
//! the matching Grouper.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::store::Table;

pub const UNKNOWN_ADDRESS: &str = "unknown";

fn staging_file_name(table: Table) -> &'static str {
    match table {
        Table::Block => "block.csv.gz",
        Table::Vout => "vout.csv.gz",
        Table::VinTxid => "vin_txid.csv.gz",
        Table::VinSpent => "vin_spent.csv.gz",
        Table::Coinbase => "coinbase.csv.gz",
        Table::Address => "address.csv.gz",
    }
}

pub fn staging_path(working_dir: &Path, table: Table) -> PathBuf {
    working_dir.join(staging_file_name(table))
}

pub fn sorted_path(working_dir: &Path, table: Table) -> PathBuf {
    working_dir.join(staging_file_name(table).replace(".csv.gz", "_sorted.csv.gz"))
}

/// Writes one compressed CSV file. Rows are plain positional tuples
/// joined by `\t`; no quoting, since no field in this wire format
/// contains a raw tab or newline (JSON values and bulk TSVs are
/// produced separately, downstream of the Extractor).
pub struct StagingWriter {
    encoder: GzEncoder<BufWriter<File>>,
}

impl StagingWriter {
    pub fn create(path: impl AsRef<Path>, compress_level: u32) -> Result<Self> {
        let file = File::create(path)?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::new(compress_level));
        Ok(Self { encoder })
    }

    pub fn write_row(&mut self, fields: &[&str]) -> Result<()> {
        let line = fields.join("\t");
        self.encoder.write_all(line.as_bytes())?;
        self.encoder.write_all(b"\n")?;
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        self.encoder.finish()?;
        Ok(())
    }
}

/// Bundles the six staging writers the Extractor fills in one pass over
/// the chain.
pub struct StagingWriters {
    pub block: StagingWriter,
    pub vout: StagingWriter,
    pub vin_txid: StagingWriter,
    pub vin_spent: StagingWriter,
    pub coinbase: StagingWriter,
    pub address: StagingWriter,
}

impl StagingWriters {
    pub fn create(working_dir: &Path, compress_level: u32) -> Result<Self> {
        std::fs::create_dir_all(working_dir)?;
        Ok(Self {
            block: StagingWriter::create(staging_path(working_dir, Table::Block), compress_level)?,
            vout: StagingWriter::create(staging_path(working_dir, Table::Vout), compress_level)?,
            vin_txid: StagingWriter::create(staging_path(working_dir, Table::VinTxid), compress_level)?,
            vin_spent: StagingWriter::create(staging_path(working_dir, Table::VinSpent), compress_level)?,
            coinbase: StagingWriter::create(staging_path(working_dir, Table::Coinbase), compress_level)?,
            address: StagingWriter::create(staging_path(working_dir, Table::Address), compress_level)?,
        })
    }

    pub fn finish(self) -> Result<()> {
        self.block.finish()?;
        self.vout.finish()?;
        self.vin_txid.finish()?;
        self.vin_spent.finish()?;
        self.coinbase.finish()?;
        self.address.finish()?;
        Ok(())
    }
}

/// Reads rows out of a gzip-compressed, tab-delimited staging file.
pub struct StagingReader {
    lines: std::io::Lines<std::io::BufReader<flate2::read::MultiGzDecoder<File>>>,
}

impl StagingReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let decoder = flate2::read::MultiGzDecoder::new(file);
        let reader = std::io::BufReader::new(decoder);
        Ok(Self {
            lines: std::io::BufRead::lines(reader),
        })
    }
}

impl Iterator for StagingReader {
    type Item = Result<Vec<String>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.lines.next().map(|line| {
            let line = line.map_err(crate::error::IndexerError::from)?;
            Ok(line.split('\t').map(|s| s.to_string()).collect())
        })
    }
}

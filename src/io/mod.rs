pub mod config;
pub mod data;
pub mod newick;
pub mod report;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Reads a whole text file, decompressing it when the name ends in `.gz`.
pub fn read_to_string(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("failed to open {path:?}"))?;
    let mut reader: Box<dyn Read> = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut content = String::new();
    reader
        .read_to_string(&mut content)
        .with_context(|| format!("failed to read {path:?}"))?;
    Ok(content)
}

use anyhow::{Context, Result, bail};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::data::{CharacterData, TipState};

/// Parses `taxon<TAB>state` lines; blank lines and `#` comments are skipped.
pub fn parse_tip_states(content: &str, n_states: usize) -> Result<CharacterData> {
    let mut data = CharacterData::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim_end();
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split('\t');
        let taxon = fields.next().map(str::trim).unwrap_or_default();
        let Some(symbol) = fields.next() else {
            bail!("line {}: expected 'taxon<TAB>state', got {line:?}", lineno + 1);
        };
        if taxon.is_empty() {
            bail!("line {}: empty taxon name", lineno + 1);
        }
        if data.contains(taxon) {
            bail!("line {}: duplicate taxon '{taxon}'", lineno + 1);
        }
        let state = TipState::parse(symbol.trim(), n_states)
            .with_context(|| format!("line {}: bad state for '{taxon}'", lineno + 1))?;
        data.insert(taxon, state);
    }
    Ok(data)
}

pub fn read_tip_states(path: &Path, n_states: usize) -> Result<CharacterData> {
    let content = super::read_to_string(path)?;
    parse_tip_states(&content, n_states).with_context(|| format!("failed to parse {path:?}"))
}

pub fn write_tip_states(path: &Path, data: &CharacterData) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {path:?}"))?;
    let mut w = BufWriter::new(file);
    for (taxon, state) in data.iter() {
        writeln!(w, "{taxon}\t{}", state.symbol())?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_every_symbol_kind() {
        let data = parse_tip_states("# taxa\nA\t0\nB\t?\nC\t-\nD\t0/1\n\nE\t{0,1}\n", 2).unwrap();
        assert_eq!(data.len(), 5);
        assert_eq!(data.get("A"), Some(&TipState::Observed(0)));
        assert_eq!(data.get("B"), Some(&TipState::Missing));
        assert_eq!(data.get("C"), Some(&TipState::Gap));
        assert!(data.get("D").unwrap().allows(1));
        assert!(data.get("E").unwrap().allows(0));
    }

    #[test]
    fn rejects_duplicates_and_out_of_range_states() {
        assert!(parse_tip_states("A\t0\nA\t1\n", 2).is_err());
        assert!(parse_tip_states("A\t3\n", 2).is_err());
        assert!(parse_tip_states("A 0\n", 2).is_err());
    }
}

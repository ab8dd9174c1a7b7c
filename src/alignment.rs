use crate::{open, open_for_write};
use anyhow::{bail, Result};
use itertools::Itertools;
use kseq::parse_reader;
use log::info;
use std::{
    collections::{HashMap, HashSet},
    io::Write,
    path::Path,
};

// --------------------------------------------------
pub fn sequence_names(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let mut reader = parse_reader(open(path.as_ref())?)?;
    let mut names = vec![];
    while let Some(rec) = reader.iter_record()? {
        names.push(rec.head().to_string());
    }
    Ok(names)
}

// --------------------------------------------------
/// A usable alignment has at least one record, unique non-empty names,
/// and all sequences the same length.
pub fn validate_alignment(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let mut reader = parse_reader(open(path)?)?;
    let mut seen: HashSet<String> = HashSet::new();
    let mut width = None;

    while let Some(rec) = reader.iter_record()? {
        let name = rec.head().to_string();
        if name.is_empty() {
            bail!("{}: sequence without a name", path.display());
        }
        let length = rec.seq().len();
        if length == 0 {
            bail!("{}: sequence {name} is empty", path.display());
        }
        match width {
            Some(expected) if expected != length => bail!(
                "{}: sequence {name} has length {length}, expected {expected}",
                path.display()
            ),
            _ => width = Some(length),
        }
        if !seen.insert(name.clone()) {
            bail!("{}: duplicate sequence name {name}", path.display());
        }
    }

    if seen.is_empty() {
        bail!("{} contains no sequences", path.display());
    }
    Ok(())
}

// --------------------------------------------------
/// Rewrite an alignment into the normalized one-line-per-sequence form the
/// rest of the pipeline appends to.
pub fn reconvert_alignment(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<()> {
    let mut out = open_for_write(output.as_ref())?;
    let mut reader = parse_reader(open(input.as_ref())?)?;
    while let Some(rec) = reader.iter_record()? {
        writeln!(out, ">{}\n{}", rec.head(), rec.seq())?;
    }
    Ok(())
}

// --------------------------------------------------
/// Write a filtered copy of the alignment, dropping sequences missing more
/// than `filter_percentage` percent of their data and, optionally, later
/// exact duplicates. Returns the names of the removed sequences.
pub fn filter_alignment(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    filter_percentage: f64,
    remove_identical: bool,
) -> Result<Vec<String>> {
    let mut reader = parse_reader(open(input.as_ref())?)?;
    let mut out = open_for_write(output.as_ref())?;

    let mut removed = vec![];
    let mut seen_sequences: HashMap<String, String> = HashMap::new();

    while let Some(rec) = reader.iter_record()? {
        let name = rec.head().to_string();
        let seq = rec.seq().to_string();

        let missing = seq
            .chars()
            .filter(|c| matches!(c, '-' | 'N' | 'n' | '?'))
            .count();
        let fraction = if seq.is_empty() {
            100.0
        } else {
            missing as f64 * 100.0 / seq.len() as f64
        };
        if fraction > filter_percentage {
            info!("Removing {name}: {fraction:.1}% missing data");
            removed.push(name);
            continue;
        }

        if remove_identical {
            if let Some(first) = seen_sequences.get(&seq) {
                info!("Removing {name}: identical to {first}");
                removed.push(name);
                continue;
            }
            seen_sequences.insert(seq.clone(), name.clone());
        }

        writeln!(out, ">{name}\n{seq}")?;
    }

    if !removed.is_empty() {
        info!(
            "Filtered out {} sequences: {}",
            removed.len(),
            removed.iter().join(", ")
        );
    }
    Ok(removed)
}

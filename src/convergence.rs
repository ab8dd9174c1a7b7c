use crate::{open, tree, ConvergeMethod};
use anyhow::Result;
use log::info;
use regex::Regex;
use std::{
    collections::HashMap,
    io::BufRead,
    path::{Path, PathBuf},
};

/// One completed loop iteration: read-only once appended.
#[derive(Debug, Clone)]
pub struct IterationRecord {
    pub index: u32,
    pub tree_file: PathBuf,
    pub recombination_file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Continue,
    Stop,
}

// --------------------------------------------------
pub fn check_convergence(records: &[IterationRecord], method: &ConvergeMethod) -> Result<Verdict> {
    let converged = match method {
        ConvergeMethod::Recombination => have_recombinations_been_seen_before(records)?,
        _ => has_tree_been_seen_before(records, method)?,
    };
    Ok(if converged {
        Verdict::Stop
    } else {
        Verdict::Continue
    })
}

// --------------------------------------------------
/// The latest surviving tree is compared against every earlier surviving
/// tree, not just its predecessor, so early oscillations are caught. Tree
/// files removed by interim cleanup are skipped.
pub fn has_tree_been_seen_before(
    records: &[IterationRecord],
    method: &ConvergeMethod,
) -> Result<bool> {
    if records.len() <= 2 {
        return Ok(false);
    }

    let existing: Vec<&Path> = records
        .iter()
        .map(|r| r.tree_file.as_path())
        .filter(|p| p.exists())
        .collect();
    let (latest, earlier) = match existing.split_last() {
        Some(split) => split,
        _ => return Ok(false),
    };

    let latest_tree = tree::Tree::from_file(latest)?;
    for prior in earlier {
        let prior_tree = tree::Tree::from_file(prior)?;
        let identical = match method {
            ConvergeMethod::WeightedRobinsonFoulds => {
                tree::weighted_robinson_foulds_distance(&prior_tree, &latest_tree)? == 0.0
            }
            _ => tree::symmetric_difference(&prior_tree, &latest_tree)? == 0,
        };
        if identical {
            info!(
                "Tree {} observed before as {}",
                latest.display(),
                prior.display()
            );
            return Ok(true);
        }
    }

    Ok(false)
}

// --------------------------------------------------
/// Per-taxon recombinant region sets from an EMBL feature table:
/// `misc_feature START..END` rows followed by a `/taxa="a b"` qualifier.
pub fn extract_recombinations_from_embl(
    path: impl AsRef<Path>,
) -> Result<HashMap<String, Vec<(u64, u64)>>> {
    let feature_re = Regex::new(r"misc_feature\s+(\d+)\.\.(\d+)\s*$").unwrap();
    let taxa_re = Regex::new(r#"taxa="([^"]+)""#).unwrap();

    let mut regions: HashMap<String, Vec<(u64, u64)>> = HashMap::new();
    let mut current: Option<(u64, u64)> = None;

    for line in open(path.as_ref())?.lines().map_while(Result::ok) {
        if let Some(caps) = feature_re.captures(&line) {
            current = Some((caps[1].parse()?, caps[2].parse()?));
            continue;
        }
        if let Some((start, end)) = current {
            if let Some(caps) = taxa_re.captures(&line) {
                for taxon in caps[1].split_whitespace() {
                    regions.entry(taxon.to_string()).or_default().push((start, end));
                }
                current = None;
            }
        }
    }

    for coords in regions.values_mut() {
        coords.sort_unstable();
    }
    Ok(regions)
}

// --------------------------------------------------
/// Converged once the current iteration's taxon-to-region mapping is
/// identical to that of any earlier iteration. Missing report files are
/// skipped rather than raised.
pub fn have_recombinations_been_seen_before(records: &[IterationRecord]) -> Result<bool> {
    let (current, previous) = match records.split_last() {
        Some(split) => split,
        _ => return Ok(false),
    };
    if !current.recombination_file.exists() {
        return Ok(false);
    }

    let current_regions = extract_recombinations_from_embl(&current.recombination_file)?;
    for prior in previous {
        if !prior.recombination_file.exists() {
            continue;
        }
        if extract_recombinations_from_embl(&prior.recombination_file)? == current_regions {
            info!(
                "Recombinations in {} observed before in {}",
                current.recombination_file.display(),
                prior.recombination_file.display()
            );
            return Ok(true);
        }
    }
    Ok(false)
}

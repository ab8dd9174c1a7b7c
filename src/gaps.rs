use crate::{open, open_for_write};
use anyhow::{anyhow, bail, Result};
use kseq::parse_reader;
use log::debug;
use std::{collections::HashSet, fs::OpenOptions, io::BufRead, io::Write, path::Path};

/// One column of the original alignment, as described by the variant report:
/// either filled from a fixed base (gap/invariant columns stripped before
/// tree building) or taken from the compact reconstruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MaskColumn {
    Gap(char),
    Retained,
}

#[derive(Debug, Clone)]
pub struct VariantMask {
    pub samples: Vec<String>,
    pub columns: Vec<MaskColumn>,
}

// --------------------------------------------------
impl VariantMask {
    /// Build the column mask from a VCF-style variant report. The `#CHROM`
    /// header row names the samples (columns 10+); each data row describes
    /// one alignment column, in row order.
    pub fn from_vcf(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut samples = vec![];
        let mut columns = vec![];

        for line in open(path)?.lines().map_while(Result::ok) {
            if line.starts_with("#CHROM") {
                samples = line
                    .trim_end()
                    .split('\t')
                    .skip(9)
                    .map(String::from)
                    .collect();
            } else if line.as_bytes().first().is_some_and(u8::is_ascii_digit) {
                let fields: Vec<&str> = line.split('\t').collect();
                if fields.len() < 5 {
                    bail!(
                        "Malformed row in variant report {}: {line:?}",
                        path.display()
                    );
                }
                columns.push(classify_column(fields[3], fields[4]));
            }
        }

        debug!(
            "Variant report {}: {} samples, {} columns ({} retained)",
            path.display(),
            samples.len(),
            columns.len(),
            columns
                .iter()
                .filter(|c| **c == MaskColumn::Retained)
                .count()
        );

        Ok(VariantMask { samples, columns })
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn retained_count(&self) -> usize {
        self.columns
            .iter()
            .filter(|c| **c == MaskColumn::Retained)
            .count()
    }

    // --------------------------------------------------
    /// Expand a compact sequence back to full alignment width: gap columns
    /// emit their fill base, retained columns consume the next compact base.
    /// Trailing gap columns are still emitted after the compact bases run
    /// out, but running out at a retained column is an error.
    pub fn expand(&self, compact: &str, id: &str) -> Result<String> {
        let mut bases = compact.chars();
        let mut expanded = String::with_capacity(self.columns.len());
        for column in &self.columns {
            match column {
                MaskColumn::Gap(fill) => expanded.push(*fill),
                MaskColumn::Retained => match bases.next() {
                    Some(base) => expanded.push(base),
                    _ => bail!(
                        "Reconstructed sequence for {id} ran out of bases: \
                         expected {} but found {}",
                        self.retained_count(),
                        compact.len()
                    ),
                },
            }
        }
        Ok(expanded)
    }
}

// --------------------------------------------------
// A column produces a gap fill unless both the reference and the alternate
// are concrete single bases. Mixed rows fill from whichever side is
// concrete; rows where neither is fill with the gap character.
fn classify_column(reference: &str, alternate: &str) -> MaskColumn {
    match (single_base(reference), single_base(alternate)) {
        (Some(r), Some(a)) => match (is_concrete(r), is_concrete(a)) {
            (true, true) => MaskColumn::Retained,
            (true, false) => MaskColumn::Gap(r),
            (false, true) => MaskColumn::Gap(a),
            (false, false) => MaskColumn::Gap('-'),
        },
        _ => MaskColumn::Retained,
    }
}

fn single_base(field: &str) -> Option<char> {
    let mut chars = field.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}

fn is_concrete(base: char) -> bool {
    matches!(base, 'A' | 'C' | 'G' | 'T' | 'a' | 'c' | 'g' | 't')
}

// --------------------------------------------------
/// Expand every internal-node record of the compact reconstruction and
/// append the results to the combined alignment. Records named after a
/// sample are the original leaf sequences and are skipped.
pub fn reinsert_gaps(
    mask: &VariantMask,
    reconstruction: impl AsRef<Path>,
    output: impl AsRef<Path>,
) -> Result<()> {
    let output = output.as_ref();
    let samples: HashSet<&str> = mask.samples.iter().map(String::as_str).collect();

    let mut out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(output)
        .map_err(|e| anyhow!("Cannot write {}: {e}", output.display()))?;

    let mut reader = parse_reader(open(reconstruction.as_ref())?)?;
    while let Some(rec) = reader.iter_record()? {
        if samples.contains(rec.head()) {
            continue;
        }
        let expanded = mask.expand(rec.seq(), rec.head())?;
        writeln!(out, ">{}\n{}", rec.head(), expanded)?;
    }

    Ok(())
}

// --------------------------------------------------
/// Convert RAxML marginal ancestral state output (`LABEL SEQUENCE` lines)
/// into the FASTA the gap reinsertion step consumes.
pub fn ancestral_states_to_fasta(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
) -> Result<()> {
    let mut out = open_for_write(output.as_ref())?;
    for line in open(input.as_ref())?.lines().map_while(Result::ok) {
        let mut parts = line.split_whitespace();
        if let (Some(label), Some(seq)) = (parts.next(), parts.next()) {
            writeln!(out, ">{label}\n{seq}")?;
        }
    }
    Ok(())
}

// --------------------------------------------------
#[cfg(test)]
mod tests {
    use super::{ancestral_states_to_fasta, reinsert_gaps, MaskColumn, VariantMask};
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;

    const VCF: &str = "\
##fileformat=VCFv4.1\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tt1\tt2\tt3\tt4\tt5\n\
1\t1\t.\tA\tG\t.\t.\t.\tGT\tA\tA\tG\tG\tA\n\
1\t2\t.\t-\tA\t.\t.\t.\tGT\t-\tA\tA\tA\tA\n\
1\t3\t.\tC\t-\t.\t.\t.\tGT\tC\tC\t-\tC\tC\n\
1\t4\t.\tN\t-\t.\t.\t.\tGT\tN\tN\t-\tN\tN\n\
1\t5\t.\tG\tT\t.\t.\t.\tGT\tG\tT\tT\tG\tG\n";

    fn mask() -> Result<VariantMask> {
        let dir = tempdir()?;
        let vcf = dir.path().join("aln.fa.gaps.vcf");
        fs::write(&vcf, VCF)?;
        VariantMask::from_vcf(&vcf)
    }

    #[test]
    fn test_variant_mask_from_vcf() -> Result<()> {
        let mask = mask()?;
        assert_eq!(mask.samples, vec!["t1", "t2", "t3", "t4", "t5"]);
        assert_eq!(
            mask.columns,
            vec![
                MaskColumn::Retained,
                MaskColumn::Gap('A'),
                MaskColumn::Gap('C'),
                MaskColumn::Gap('-'),
                MaskColumn::Retained,
            ]
        );
        assert_eq!(mask.width(), 5);
        assert_eq!(mask.retained_count(), 2);
        Ok(())
    }

    #[test]
    fn test_expand() -> Result<()> {
        let mask = mask()?;
        assert_eq!(mask.expand("GT", "N1")?, "GAC-T");

        // Compact sequence too short for the retained columns
        let err = mask.expand("G", "N1").unwrap_err();
        assert!(err.to_string().contains("ran out of bases"));

        // Surplus compact bases are ignored
        assert_eq!(mask.expand("GTX", "N1")?, "GAC-T");
        Ok(())
    }

    #[test]
    fn test_expand_trailing_gap_columns() {
        let mask = VariantMask {
            samples: vec![],
            columns: vec![
                MaskColumn::Retained,
                MaskColumn::Gap('A'),
                MaskColumn::Gap('-'),
            ],
        };
        assert_eq!(mask.expand("T", "N1").unwrap(), "TA-");
    }

    #[test]
    fn test_reinsert_gaps_appends_internal_nodes_only() -> Result<()> {
        let dir = tempdir()?;
        let recon = dir.path().join("aln.fa.seq.joint.txt");
        let out = dir.path().join("aln.fa.gaps.snp_sites.aln");

        fs::write(&recon, ">t1\nGT\n>N1\nGT\n>N2\nCT\n")?;
        fs::write(&out, ">t1\nGAC-T\n")?;

        reinsert_gaps(&mask()?, &recon, &out)?;
        assert_eq!(
            fs::read_to_string(&out)?,
            ">t1\nGAC-T\n>N1\nGAC-T\n>N2\nCAC-T\n"
        );
        Ok(())
    }

    #[test]
    fn test_ancestral_states_to_fasta() -> Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("RAxML_marginalAncestralStates.run");
        let output = dir.path().join("aln.fa.seq.joint.txt");
        fs::write(&input, "N1 ACGT\nN2   TTGA\n\n")?;
        ancestral_states_to_fasta(&input, &output)?;
        assert_eq!(fs::read_to_string(&output)?, ">N1\nACGT\n>N2\nTTGA\n");
        Ok(())
    }
}

use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;
use std::{fs, os::unix::fs::PermissionsExt, path::Path};
use tempfile::{tempdir, TempDir};

const PRG: &str = "tessella";

struct Stubs {
    _dir: TempDir,
    scanner: String,
    raxml: String,
    fasttree: String,
}

// --------------------------------------------------
// Copy the fake external tools into a scratch bin directory and make
// them executable, since file modes do not survive every checkout.
fn install_stubs() -> Result<Stubs> {
    let dir = tempdir()?;
    let mut paths = vec![];
    for (name, source) in [
        ("tessella-scan", "tests/inputs/fake-tools/scanner.sh"),
        ("raxmlHPC", "tests/inputs/fake-tools/raxml.sh"),
        ("FastTree", "tests/inputs/fake-tools/fasttree.sh"),
    ] {
        let target = dir.path().join(name);
        fs::copy(source, &target)?;
        fs::set_permissions(&target, fs::Permissions::from_mode(0o755))?;
        paths.push(target.display().to_string());
    }
    Ok(Stubs {
        _dir: dir,
        scanner: paths[0].clone(),
        raxml: paths[1].clone(),
        fasttree: paths[2].clone(),
    })
}

// --------------------------------------------------
fn fixture(name: &str) -> Result<String> {
    Ok(fs::canonicalize(Path::new("tests/inputs").join(name))?
        .display()
        .to_string())
}

// --------------------------------------------------
#[test]
fn usage() -> Result<()> {
    for flag in &["-h", "--help"] {
        Command::cargo_bin(PRG)?
            .arg(flag)
            .assert()
            .stdout(predicate::str::contains("Usage"));
    }
    Ok(())
}

// --------------------------------------------------
#[test]
fn dies_on_missing_alignment() -> Result<()> {
    let stubs = install_stubs()?;
    let workdir = tempdir()?;
    Command::cargo_bin(PRG)?
        .current_dir(workdir.path())
        .args([
            "does-not-exist.fa",
            "--scanner",
            &stubs.scanner,
            "--raxml",
            &stubs.raxml,
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "Cannot access the input alignment file",
        ));
    Ok(())
}

// --------------------------------------------------
#[test]
fn dies_on_ragged_alignment() -> Result<()> {
    let stubs = install_stubs()?;
    let workdir = tempdir()?;
    let aln = fixture("ragged.fa")?;
    Command::cargo_bin(PRG)?
        .current_dir(workdir.path())
        .args([
            aln.as_str(),
            "--scanner",
            &stubs.scanner,
            "--raxml",
            &stubs.raxml,
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("has length 4, expected 7"));
    Ok(())
}

// --------------------------------------------------
#[test]
fn dies_on_starting_tree_taxa_mismatch() -> Result<()> {
    let stubs = install_stubs()?;
    let workdir = tempdir()?;
    let aln = fixture("aln.fa")?;
    let tree = fixture("wrong_taxa.tre")?;
    Command::cargo_bin(PRG)?
        .current_dir(workdir.path())
        .args([
            aln.as_str(),
            "--starting-tree",
            tree.as_str(),
            "--scanner",
            &stubs.scanner,
            "--raxml",
            &stubs.raxml,
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "references taxa missing from the alignment",
        ));
    Ok(())
}

// --------------------------------------------------
#[test]
fn dies_with_too_few_sequences() -> Result<()> {
    let stubs = install_stubs()?;
    let workdir = tempdir()?;
    let aln = fixture("small.fa")?;
    Command::cargo_bin(PRG)?
        .current_dir(workdir.path())
        .args([
            aln.as_str(),
            "--scanner",
            &stubs.scanner,
            "--raxml",
            &stubs.raxml,
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "At least 3 sequences are required",
        ));
    Ok(())
}

// --------------------------------------------------
// Full pipeline against the stub tools: the stub scanner reports the same
// recombinant regions from iteration 3 onward, so a five-iteration run
// with region-based convergence must stop after iteration 4 and leave
// only the stable-named outputs behind.
#[test]
fn run_to_convergence_with_region_identity() -> Result<()> {
    let stubs = install_stubs()?;
    let workdir = tempdir()?;
    let aln = fixture("aln.fa")?;
    let start_tree = fixture("start.tre")?;

    let output = Command::cargo_bin(PRG)?
        .current_dir(workdir.path())
        .args([
            aln.as_str(),
            "--starting-tree",
            start_tree.as_str(),
            "--outgroup",
            "t5",
            "--tree-builder",
            "fasttree",
            "--converge-method",
            "recombination",
            "--iterations",
            "5",
            "--scanner",
            &stubs.scanner,
            "--raxml",
            &stubs.raxml,
            "--fasttree",
            &stubs.fasttree,
        ])
        .output()?;
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(">>> Iteration 4 <<<"));
    assert!(stdout.contains("Converged after 4 iterations"));
    assert!(!stdout.contains(">>> Iteration 5 <<<"));

    for name in [
        "aln.final_tree.tre",
        "aln.node_labelled.final_tree.tre",
        "aln.node_labelled.tre",
        "aln.recombination_predictions.embl",
        "aln.recombination_predictions.gff",
        "aln.summary_of_snp_distribution.vcf",
        "aln.per_branch_statistics.csv",
        "aln.branch_base_reconstruction.embl",
        "aln.filtered_polymorphic_sites.fasta",
        "aln.filtered_polymorphic_sites.phylip",
    ] {
        assert!(workdir.path().join(name).exists(), "missing {name}");
    }

    // The delivered report is the iteration-4 one
    let embl = fs::read_to_string(workdir.path().join("aln.recombination_predictions.embl"))?;
    assert!(embl.contains("10..23"));

    // The canonical final tree is plain Newick
    let tre = fs::read_to_string(workdir.path().join("aln.final_tree.tre"))?;
    assert!(tre.starts_with('(') && tre.trim_end().ends_with(';'));

    // Intermediates are gone
    for entry in fs::read_dir(workdir.path())? {
        let name = entry?.file_name().to_string_lossy().to_string();
        assert!(!name.starts_with("RAxML_"), "{name} survived cleanup");
        assert!(
            !name.starts_with("aln.fa.iteration"),
            "{name} survived cleanup"
        );
        assert!(
            !name.starts_with("aln.fa.gaps"),
            "{name} survived cleanup"
        );
    }
    Ok(())
}

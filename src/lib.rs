pub mod alignment;
pub mod convergence;
pub mod gaps;
pub mod tree;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use clap::{builder::PossibleValue, Parser, ValueEnum};
use convergence::{IterationRecord, Verdict};
use itertools::Itertools;
use log::{debug, info};
use regex::Regex;
use std::{
    collections::HashSet,
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    process::Command,
    time::Instant,
};
use walkdir::WalkDir;

/// Iterative detection of recombination in bacterial whole-genome alignments
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Multi-FASTA whole-genome alignment
    #[arg(value_name = "ALIGNMENT")]
    pub alignment: PathBuf,

    /// Newick starting tree for the first iteration
    #[arg(long, value_name = "TREE")]
    pub starting_tree: Option<PathBuf>,

    /// Comma-separated outgroup taxa for rerooting (default: midpoint)
    #[arg(long, value_name = "OUTGROUP")]
    pub outgroup: Option<String>,

    /// Tree builder
    #[arg(long, value_name = "BUILDER", default_value = "raxml")]
    pub tree_builder: TreeBuilder,

    /// Convergence test applied between iterations
    #[arg(long, value_name = "METHOD", default_value = "weighted_robinson_foulds")]
    pub converge_method: ConvergeMethod,

    /// Maximum number of iterations
    #[arg(short, long, value_name = "ITERATIONS", default_value = "5")]
    pub iterations: u32,

    /// Minimum number of SNPs required to call a recombination block
    #[arg(long, value_name = "MIN_SNPS", default_value = "3")]
    pub min_snps: u32,

    /// Minimum window size for the recombination scanner
    #[arg(long, value_name = "SIZE", default_value = "100")]
    pub min_window_size: u32,

    /// Maximum window size for the recombination scanner
    #[arg(long, value_name = "SIZE", default_value = "10000")]
    pub max_window_size: u32,

    /// Remove sequences with more than this percentage of gaps or Ns
    #[arg(long, value_name = "PERCENT", default_value = "25.0")]
    pub filter_percentage: f64,

    /// Remove exact duplicate sequences before the first iteration
    #[arg(long)]
    pub remove_identical_sequences: bool,

    /// RAxML substitution model
    #[arg(long, value_name = "MODEL", default_value = "GTRGAMMA")]
    pub raxml_model: String,

    /// Threads for the PTHREADS RAxML executables (default: all cores)
    #[arg(long, value_name = "THREADS")]
    pub threads: Option<usize>,

    /// Prefix intermediate file names with a unique timestamp
    #[arg(long)]
    pub use_time_stamp: bool,

    /// Keep intermediate files
    #[arg(long)]
    pub no_cleanup: bool,

    /// Prefix for the final output files (default: alignment basename)
    #[arg(long, value_name = "PREFIX")]
    pub prefix: Option<String>,

    /// Path to the recombination scanner executable
    #[arg(long, value_name = "SCANNER")]
    pub scanner: Option<String>,

    /// Path to a RAxML executable
    #[arg(long, value_name = "RAXML")]
    pub raxml: Option<String>,

    /// Path to a FastTree executable
    #[arg(long, value_name = "FASTTREE")]
    pub fasttree: Option<String>,

    /// Log level
    #[arg(short, long)]
    pub log: Option<LogLevel>,
}

#[derive(Debug, Clone)]
pub enum LogLevel {
    Info,
    Debug,
}

impl ValueEnum for LogLevel {
    fn value_variants<'a>() -> &'a [Self] {
        &[LogLevel::Info, LogLevel::Debug]
    }

    fn to_possible_value<'a>(&self) -> Option<PossibleValue> {
        Some(match self {
            LogLevel::Info => PossibleValue::new("info"),
            LogLevel::Debug => PossibleValue::new("debug"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TreeBuilder {
    Raxml,
    Fasttree,
    Hybrid,
}

impl ValueEnum for TreeBuilder {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            TreeBuilder::Raxml,
            TreeBuilder::Fasttree,
            TreeBuilder::Hybrid,
        ]
    }

    fn to_possible_value<'a>(&self) -> Option<PossibleValue> {
        Some(match self {
            TreeBuilder::Raxml => PossibleValue::new("raxml"),
            TreeBuilder::Fasttree => PossibleValue::new("fasttree"),
            TreeBuilder::Hybrid => PossibleValue::new("hybrid"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConvergeMethod {
    WeightedRobinsonFoulds,
    SymmetricDifference,
    Recombination,
}

impl ValueEnum for ConvergeMethod {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            ConvergeMethod::WeightedRobinsonFoulds,
            ConvergeMethod::SymmetricDifference,
            ConvergeMethod::Recombination,
        ]
    }

    fn to_possible_value<'a>(&self) -> Option<PossibleValue> {
        Some(match self {
            ConvergeMethod::WeightedRobinsonFoulds => {
                PossibleValue::new("weighted_robinson_foulds")
            }
            ConvergeMethod::SymmetricDifference => PossibleValue::new("symmetric_difference"),
            ConvergeMethod::Recombination => PossibleValue::new("recombination"),
        })
    }
}

// --------------------------------------------------
/// Deterministic artifact naming shared by the loop, the convergence
/// tracker, and the cleanup pass.
#[derive(Debug, Clone)]
pub struct Naming {
    pub base: String,
    pub base_no_ext: String,
    pub time: String,
}

impl Naming {
    pub fn new(alignment: &Path, use_time_stamp: bool) -> Result<Self> {
        let base = alignment
            .file_name()
            .ok_or_else(|| anyhow!("Cannot get the file name of {}", alignment.display()))?
            .to_string_lossy()
            .to_string();
        let base_no_ext = alignment
            .file_stem()
            .ok_or_else(|| anyhow!("Cannot get the file stem of {}", alignment.display()))?
            .to_string_lossy()
            .to_string();
        let time = if use_time_stamp {
            format!("{}.", Utc::now().timestamp())
        } else {
            String::new()
        };
        Ok(Naming {
            base,
            base_no_ext,
            time,
        })
    }

    pub fn raxml_base(&self) -> String {
        format!("{}.{}iteration_", self.base_no_ext, self.time)
    }

    pub fn raxml_tree(&self, iteration: u32) -> String {
        format!("RAxML_result.{}{}", self.raxml_base(), iteration)
    }

    pub fn fasttree_tree(&self, iteration: u32) -> String {
        format!("{}.iteration_{}", self.base, iteration)
    }

    pub fn ancestor_run(&self, iteration: u32) -> String {
        format!("{}{}.ancestor", self.raxml_base(), iteration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Raxml,
    Fasttree,
}

impl TreeBuilder {
    fn phase(&self, iteration: u32) -> Phase {
        match self {
            TreeBuilder::Raxml => Phase::Raxml,
            TreeBuilder::Fasttree => Phase::Fasttree,
            TreeBuilder::Hybrid => {
                if iteration == 1 {
                    Phase::Fasttree
                } else {
                    Phase::Raxml
                }
            }
        }
    }

    pub fn tree_name(&self, naming: &Naming, iteration: u32) -> String {
        match self.phase(iteration) {
            Phase::Raxml => naming.raxml_tree(iteration),
            Phase::Fasttree => naming.fasttree_tree(iteration),
        }
    }

    /// Name stem whose `.phylip`/`.snp_sites.aln` artifacts feed this
    /// iteration's build: the base alignment name on iteration 1, the
    /// previous iteration's tree afterwards.
    pub fn input_stem(&self, naming: &Naming, iteration: u32) -> String {
        if iteration == 1 {
            naming.base.clone()
        } else {
            self.tree_name(naming, iteration - 1)
        }
    }
}

// --------------------------------------------------
/// One external invocation: program, arguments, and an optional file the
/// captured stdout is written to. Failure reports the pipeline stage.
#[derive(Debug)]
pub struct ExternalCommand {
    pub stage: &'static str,
    pub program: String,
    pub args: Vec<String>,
    pub stdout_to: Option<PathBuf>,
}

impl ExternalCommand {
    pub fn run(&self) -> Result<()> {
        info!(r#"Running "{} {}""#, self.program, self.args.join(" "));

        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .map_err(|e| {
                anyhow!(
                    "Failed while running {}: cannot execute {}: {e}",
                    self.stage,
                    self.program
                )
            })?;

        if !output.status.success() {
            debug!("{}", String::from_utf8_lossy(&output.stdout));
            bail!(
                "Failed while running {}: {}",
                self.stage,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        if let Some(path) = &self.stdout_to {
            let mut out = open_for_write(path)?;
            out.write_all(&output.stdout)?;
        }

        Ok(())
    }
}

// --------------------------------------------------
#[derive(Debug)]
pub struct RaxmlRunner {
    pub exec: String,
    pub threads: usize,
    pub model: String,
}

impl RaxmlRunner {
    pub fn discover(override_exec: Option<&str>, threads: usize, model: &str) -> Result<Self> {
        let exec = match override_exec {
            Some(path) => path.to_string(),
            _ => choose_executable(&[
                "raxmlHPC-PTHREADS-SSE3",
                "raxmlHPC-PTHREADS",
                "raxmlHPC-SSE3",
                "raxmlHPC",
            ])
            .ok_or_else(|| anyhow!("RAxML is not in your path"))?,
        };
        Ok(RaxmlRunner {
            exec,
            threads,
            model: model.to_string(),
        })
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "1".to_string(),
            "-m".to_string(),
            self.model.clone(),
        ];
        if self.exec.contains("PTHREADS") {
            args.push("-T".to_string());
            args.push(self.threads.to_string());
        }
        args
    }
}

// --------------------------------------------------
pub fn choose_executable(candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .find(|&&c| which::which(c).is_ok())
        .map(|c| c.to_string())
}

// --------------------------------------------------
fn tree_building_command(
    mode: TreeBuilder,
    naming: &Naming,
    iteration: u32,
    raxml: &RaxmlRunner,
    fasttree: Option<&str>,
) -> Result<ExternalCommand> {
    let stem = mode.input_stem(naming, iteration);

    match mode.phase(iteration) {
        Phase::Raxml => {
            let mut args = raxml.common_args();
            args.extend_from_slice(&[
                "-s".to_string(),
                format!("{stem}.phylip"),
                "-n".to_string(),
                format!("{}{}", naming.raxml_base(), iteration),
            ]);
            if iteration > 1 {
                args.extend_from_slice(&[
                    "-t".to_string(),
                    mode.tree_name(naming, iteration - 1),
                ]);
            }
            Ok(ExternalCommand {
                stage: "tree building",
                program: raxml.exec.clone(),
                args,
                stdout_to: None,
            })
        }
        Phase::Fasttree => {
            let program = fasttree
                .ok_or_else(|| anyhow!("FastTree is not in your path"))?
                .to_string();
            let mut args = vec![
                "-nosupport".to_string(),
                "-gtr".to_string(),
                "-gamma".to_string(),
                "-nt".to_string(),
            ];
            if iteration > 1 {
                args.extend_from_slice(&[
                    "-intree".to_string(),
                    mode.tree_name(naming, iteration - 1),
                ]);
            }
            args.push(format!("{stem}.snp_sites.aln"));
            Ok(ExternalCommand {
                stage: "tree building",
                program,
                args,
                stdout_to: Some(PathBuf::from(mode.tree_name(naming, iteration))),
            })
        }
    }
}

// --------------------------------------------------
fn reconstruction_command(
    raxml: &RaxmlRunner,
    naming: &Naming,
    iteration: u32,
    current_tree: &str,
) -> ExternalCommand {
    let mut args = vec!["-f".to_string(), "A".to_string()];
    args.extend(raxml.common_args());
    args.extend_from_slice(&[
        "-s".to_string(),
        format!("{}.snp_sites.aln", naming.base),
        "-t".to_string(),
        current_tree.to_string(),
        "-n".to_string(),
        naming.ancestor_run(iteration),
    ]);
    ExternalCommand {
        stage: "ancestral sequence reconstruction",
        program: raxml.exec.clone(),
        args,
        stdout_to: None,
    }
}

// --------------------------------------------------
fn scanner_command(
    scanner: &str,
    naming: &Naming,
    original_alignment: &Path,
    current_tree: &str,
    min_window_size: u32,
    max_window_size: u32,
    min_snps: u32,
) -> ExternalCommand {
    ExternalCommand {
        stage: "recombination detection",
        program: scanner.to_string(),
        args: vec![
            "-r".to_string(),
            "-v".to_string(),
            format!("{}.gaps.vcf", naming.base),
            "-a".to_string(),
            min_window_size.to_string(),
            "-b".to_string(),
            max_window_size.to_string(),
            "-f".to_string(),
            original_alignment.to_string_lossy().to_string(),
            "-t".to_string(),
            current_tree.to_string(),
            "-m".to_string(),
            min_snps.to_string(),
            format!("{}.gaps.snp_sites.aln", naming.base),
        ],
        stdout_to: None,
    }
}

// --------------------------------------------------
fn clamp_window_sizes(min: u32, max: u32) -> (u32, u32) {
    let min = min.max(3);
    let max = max.min(1_000_000);
    if min > max {
        (max, min)
    } else {
        (min, max)
    }
}

// --------------------------------------------------
fn raxml_regexes_for_deletion(naming: &Naming, last_iteration: u32) -> Vec<String> {
    let base = regex::escape(&naming.raxml_base());
    let mut regexes = vec![format!(
        "^RAxML_(bestTree|info|log|parsimonyTree|marginalAncestralStates\
         |marginalAncestralProbabilities|nodeLabelledRootedTree)\\.{base}"
    )];
    for iteration in 1..last_iteration {
        regexes.push(format!("^RAxML_result\\.{base}{iteration}\\."));
        regexes.push(format!("^RAxML_result\\.{base}{iteration}$"));
    }
    regexes
}

fn fasttree_regexes_for_deletion(naming: &Naming, last_iteration: u32) -> Vec<String> {
    let base = regex::escape(&naming.base);
    (1..last_iteration)
        .map(|iteration| format!("^{base}\\.iteration_{iteration}(\\.|$)"))
        .collect()
}

fn starting_files_regexes(naming: &Naming) -> Vec<String> {
    let base = regex::escape(&naming.base);
    vec![
        format!("^{base}\\.(gaps|vcf|snp_sites|phylip|start|seq\\.joint)"),
        "^log\\.txt$".to_string(),
    ]
}

// --------------------------------------------------
fn compile_regexes(regexes: &[String]) -> Result<Vec<Regex>> {
    regexes
        .iter()
        .map(|r| Regex::new(r).map_err(Into::into))
        .collect()
}

/// Best-effort removal of top-level files whose names match any of the
/// given patterns. Already-absent files are never an error.
pub fn delete_files_matching(dir: &Path, regexes: &[String]) -> Result<()> {
    let compiled = compile_regexes(regexes)?;
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if compiled.iter().any(|re| re.is_match(&name)) {
            debug!("Deleting file {}", entry.path().display());
            let _ = fs::remove_file(entry.path());
        }
    }
    Ok(())
}

pub fn any_file_matching(dir: &Path, regexes: &[String]) -> Result<bool> {
    let compiled = compile_regexes(regexes)?;
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if compiled.iter().any(|re| re.is_match(&name)) {
            return Ok(true);
        }
    }
    Ok(false)
}

// --------------------------------------------------
fn final_output_renames(input_prefix: &str, output_prefix: &str) -> Vec<(String, String)> {
    vec![
        (
            format!("{input_prefix}.vcf"),
            format!("{output_prefix}.summary_of_snp_distribution.vcf"),
        ),
        (
            format!("{input_prefix}.branch_snps.tab"),
            format!("{output_prefix}.branch_base_reconstruction.embl"),
        ),
        (
            format!("{input_prefix}.tab"),
            format!("{output_prefix}.recombination_predictions.embl"),
        ),
        (
            format!("{input_prefix}.gff"),
            format!("{output_prefix}.recombination_predictions.gff"),
        ),
        (
            format!("{input_prefix}.stats"),
            format!("{output_prefix}.per_branch_statistics.csv"),
        ),
        (
            format!("{input_prefix}.snp_sites.aln"),
            format!("{output_prefix}.filtered_polymorphic_sites.fasta"),
        ),
        (
            format!("{input_prefix}.phylip"),
            format!("{output_prefix}.filtered_polymorphic_sites.phylip"),
        ),
        (
            format!("{input_prefix}.output_tree"),
            format!("{output_prefix}.node_labelled.tre"),
        ),
        (
            input_prefix.to_string(),
            format!("{output_prefix}.final_tree.tre"),
        ),
    ]
}

fn rename_files(renames: &[(String, String)]) -> Result<()> {
    for (from, to) in renames {
        if Path::new(from).exists() {
            debug!("Renaming {from} to {to}");
            fs::rename(from, to)?;
        }
    }
    Ok(())
}

// --------------------------------------------------
pub fn run(args: Args) -> Result<()> {
    let start = Instant::now();
    env_logger::Builder::new()
        .filter_level(match args.log {
            Some(LogLevel::Debug) => log::LevelFilter::Debug,
            Some(LogLevel::Info) => log::LevelFilter::Info,
            _ => log::LevelFilter::Off,
        })
        .init();

    info!("args = {args:#?}");

    // Resolve the external collaborators up front
    let scanner = match &args.scanner {
        Some(path) => path.clone(),
        _ => choose_executable(&["tessella-scan"])
            .ok_or_else(|| anyhow!("tessella-scan is not in your path"))?,
    };
    let threads = args.threads.unwrap_or_else(num_cpus::get);
    // RAxML performs the ancestral reconstruction in every builder mode
    let raxml = RaxmlRunner::discover(args.raxml.as_deref(), threads, &args.raxml_model)?;
    let fasttree = match (&args.fasttree, args.tree_builder) {
        (Some(path), _) => Some(path.clone()),
        (_, TreeBuilder::Fasttree | TreeBuilder::Hybrid) => Some(
            choose_executable(&["FastTree", "fasttree"])
                .ok_or_else(|| anyhow!("FastTree is not in your path"))?,
        ),
        _ => None,
    };

    if !args.alignment.is_file() {
        bail!(
            "Cannot access the input alignment file {}. Check it has been entered correctly",
            args.alignment.display()
        );
    }
    alignment::validate_alignment(&args.alignment)?;

    if let Some(tree_path) = &args.starting_tree {
        if !tree_path.is_file() {
            bail!(
                "Cannot access the starting tree {}. Check it has been entered correctly",
                tree_path.display()
            );
        }
        let starting = tree::Tree::from_file(tree_path)
            .map_err(|e| anyhow!("The starting tree is invalid. Is it a valid Newick file? {e}"))?;
        starting
            .validate()
            .map_err(|e| anyhow!("The starting tree is invalid: {e}"))?;

        let known: HashSet<String> = alignment::sequence_names(&args.alignment)?
            .into_iter()
            .collect();
        let missing: Vec<_> = starting
            .leaf_labels()
            .into_iter()
            .filter(|label| !known.contains(label))
            .collect();
        if !missing.is_empty() {
            bail!(
                "The starting tree references taxa missing from the alignment: {}",
                missing.iter().join(", ")
            );
        }
    }

    let (min_window_size, max_window_size) =
        clamp_window_sizes(args.min_window_size, args.max_window_size);

    let naming = Naming::new(&args.alignment, args.use_time_stamp)?;
    if naming.base.len() > 115 {
        bail!(
            "The alignment filename is too long for RAxML at {} characters, \
             please shorten it to less than 115 characters",
            naming.base.len()
        );
    }

    // Filtered working copy of the alignment in a scratch directory
    let cwd = std::env::current_dir()?;
    let temp_dir = tempfile::tempdir_in(&cwd)?;
    let filtered_alignment = temp_dir.path().join(&naming.base);
    let removed = alignment::filter_alignment(
        &args.alignment,
        &filtered_alignment,
        args.filter_percentage,
        args.remove_identical_sequences,
    )?;

    // Taxa dropped by the filter must also leave the starting tree
    let starting_tree = match &args.starting_tree {
        Some(tree_path) => {
            let name = tree_path
                .file_name()
                .ok_or_else(|| anyhow!("Cannot get the file name of {}", tree_path.display()))?;
            let pruned = temp_dir.path().join(name);
            tree::filter_taxa_from_tree_file(tree_path, &pruned, &removed)?;
            Some(pruned)
        }
        _ => None,
    };

    ExternalCommand {
        stage: "variant site detection",
        program: scanner.clone(),
        args: vec![filtered_alignment.to_string_lossy().to_string()],
        stdout_to: None,
    }
    .run()?;

    alignment::reconvert_alignment(
        format!("{}.gaps.snp_sites.aln", naming.base),
        format!("{}.start", naming.base),
    )?;

    let n_sequences = alignment::sequence_names(&filtered_alignment)?.len();
    if n_sequences < 3 {
        bail!("At least 3 sequences are required after filtering, found {n_sequences}");
    }

    let stale = raxml_regexes_for_deletion(&naming, args.iterations);
    if !args.no_cleanup {
        delete_files_matching(&cwd, &stale)?;
    }
    if any_file_matching(&cwd, &stale)? {
        bail!(
            "Intermediate files from a previous run exist. Please rerun without \
             the --no-cleanup option to automatically delete them or with \
             --use-time-stamp to add a unique prefix"
        );
    }

    // The variant report is written once, so the mask is built once
    let mask = gaps::VariantMask::from_vcf(format!("{}.gaps.vcf", naming.base))?;

    let mut records: Vec<IterationRecord> = vec![];
    let mut last_iteration = 1;

    for iteration in 1..=args.iterations {
        last_iteration = iteration;
        println!("\n>>> Iteration {iteration} <<<");

        let current_tree = args.tree_builder.tree_name(&naming, iteration);

        match (&starting_tree, iteration) {
            (Some(tree_path), 1) => {
                fs::copy(tree_path, &current_tree)?;
            }
            _ => {
                tree_building_command(
                    args.tree_builder,
                    &naming,
                    iteration,
                    &raxml,
                    fasttree.as_deref(),
                )?
                .run()?;
            }
        }

        tree::reroot_tree(&current_tree, args.outgroup.as_deref())?;

        reconstruction_command(&raxml, &naming, iteration, &current_tree).run()?;
        gaps::ancestral_states_to_fasta(
            format!(
                "RAxML_marginalAncestralStates.{}",
                naming.ancestor_run(iteration)
            ),
            format!("{}.seq.joint.txt", naming.base),
        )?;
        fs::copy(
            format!(
                "RAxML_nodeLabelledRootedTree.{}",
                naming.ancestor_run(iteration)
            ),
            format!("{current_tree}.output_tree"),
        )?;

        // Restore the leaf alignment, then append the expanded ancestors
        fs::copy(
            format!("{}.start", naming.base),
            format!("{}.gaps.snp_sites.aln", naming.base),
        )?;
        gaps::reinsert_gaps(
            &mask,
            format!("{}.seq.joint.txt", naming.base),
            format!("{}.gaps.snp_sites.aln", naming.base),
        )?;

        alignment::validate_alignment(format!("{}.gaps.snp_sites.aln", naming.base)).map_err(
            |e| {
                anyhow!(
                    "There is a problem with the alignment after ancestral sequence \
                     reconstruction. Please check the intermediate file \
                     {}.gaps.snp_sites.aln: {e}",
                    naming.base
                )
            },
        )?;

        scanner_command(
            &scanner,
            &naming,
            &filtered_alignment,
            &current_tree,
            min_window_size,
            max_window_size,
            args.min_snps,
        )
        .run()?;

        records.push(IterationRecord {
            index: iteration,
            tree_file: PathBuf::from(&current_tree),
            recombination_file: PathBuf::from(format!("{current_tree}.tab")),
        });

        // The first two iterations always continue
        if iteration > 2 {
            if let Verdict::Stop =
                convergence::check_convergence(&records, &args.converge_method)?
            {
                println!("Converged after {iteration} iterations");
                break;
            }
        }
    }

    if !args.no_cleanup {
        delete_files_matching(&cwd, &raxml_regexes_for_deletion(&naming, last_iteration))?;
        delete_files_matching(&cwd, &fasttree_regexes_for_deletion(&naming, last_iteration))?;
        delete_files_matching(&cwd, &starting_files_regexes(&naming))?;
    } else {
        // Keep the scratch directory alongside the other intermediates
        let _ = temp_dir.into_path();
    }

    let prefix = args
        .prefix
        .clone()
        .unwrap_or_else(|| naming.base_no_ext.clone());
    let final_tree = args.tree_builder.tree_name(&naming, last_iteration);
    rename_files(&final_output_renames(&final_tree, &prefix))?;

    fs::copy(
        format!("{prefix}.final_tree.tre"),
        format!("{prefix}.node_labelled.final_tree.tre"),
    )
    .map_err(|e| anyhow!("Cannot copy the final tree {prefix}.final_tree.tre: {e}"))?;
    tree::remove_internal_node_labels(
        format!("{prefix}.final_tree.tre"),
        format!("{prefix}.no_internal_labels.final_tree.tre"),
    )?;
    fs::rename(
        format!("{prefix}.no_internal_labels.final_tree.tre"),
        format!("{prefix}.final_tree.tre"),
    )?;

    println!(
        r#"Finished in {} seconds, see output files prefixed "{prefix}""#,
        start.elapsed().as_secs()
    );

    Ok(())
}

// --------------------------------------------------
pub(crate) fn open(filename: &Path) -> Result<Box<dyn BufRead>> {
    Ok(Box::new(BufReader::new(File::open(filename).map_err(
        |e| anyhow!("Cannot read {}: {e}", filename.display()),
    )?)))
}

// --------------------------------------------------
pub(crate) fn open_for_write(filename: &Path) -> Result<Box<dyn Write>> {
    Ok(Box::new(BufWriter::new(File::create(filename).map_err(
        |e| anyhow!("Cannot write {}: {e}", filename.display()),
    )?)))
}

// --------------------------------------------------
#[cfg(test)]
mod tests {
    use super::{
        any_file_matching, clamp_window_sizes, delete_files_matching,
        fasttree_regexes_for_deletion, final_output_renames, raxml_regexes_for_deletion,
        tree_building_command, ExternalCommand, Naming, RaxmlRunner, TreeBuilder,
    };
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;

    fn naming() -> Naming {
        Naming {
            base: "aln.fa".to_string(),
            base_no_ext: "aln".to_string(),
            time: String::new(),
        }
    }

    fn raxml() -> RaxmlRunner {
        RaxmlRunner {
            exec: "raxmlHPC".to_string(),
            threads: 4,
            model: "GTRGAMMA".to_string(),
        }
    }

    #[test]
    fn test_tree_names() {
        let naming = naming();
        assert_eq!(
            TreeBuilder::Raxml.tree_name(&naming, 3),
            "RAxML_result.aln.iteration_3"
        );
        assert_eq!(
            TreeBuilder::Fasttree.tree_name(&naming, 3),
            "aln.fa.iteration_3"
        );

        // Hybrid switches families after the first iteration
        assert_eq!(
            TreeBuilder::Hybrid.tree_name(&naming, 1),
            "aln.fa.iteration_1"
        );
        assert_eq!(
            TreeBuilder::Hybrid.tree_name(&naming, 2),
            "RAxML_result.aln.iteration_2"
        );

        let stamped = Naming {
            time: "1390996092.".to_string(),
            ..naming
        };
        assert_eq!(
            stamped.raxml_tree(1),
            "RAxML_result.aln.1390996092.iteration_1"
        );
        assert_eq!(stamped.ancestor_run(2), "aln.1390996092.iteration_2.ancestor");
    }

    #[test]
    fn test_input_stems() {
        let naming = naming();
        assert_eq!(TreeBuilder::Raxml.input_stem(&naming, 1), "aln.fa");
        assert_eq!(
            TreeBuilder::Raxml.input_stem(&naming, 2),
            "RAxML_result.aln.iteration_1"
        );
        assert_eq!(
            TreeBuilder::Hybrid.input_stem(&naming, 2),
            "aln.fa.iteration_1"
        );
        assert_eq!(
            TreeBuilder::Fasttree.input_stem(&naming, 4),
            "aln.fa.iteration_3"
        );
    }

    #[test]
    fn test_tree_building_command() -> Result<()> {
        let naming = naming();

        let cmd = tree_building_command(TreeBuilder::Raxml, &naming, 1, &raxml(), None)?;
        assert_eq!(cmd.program, "raxmlHPC");
        assert_eq!(
            cmd.args,
            vec![
                "-p",
                "1",
                "-m",
                "GTRGAMMA",
                "-s",
                "aln.fa.phylip",
                "-n",
                "aln.iteration_1"
            ]
        );
        assert!(cmd.stdout_to.is_none());

        // Later RAxML iterations are seeded with the previous tree
        let cmd = tree_building_command(TreeBuilder::Raxml, &naming, 2, &raxml(), None)?;
        assert_eq!(
            cmd.args,
            vec![
                "-p",
                "1",
                "-m",
                "GTRGAMMA",
                "-s",
                "RAxML_result.aln.iteration_1.phylip",
                "-n",
                "aln.iteration_2",
                "-t",
                "RAxML_result.aln.iteration_1"
            ]
        );

        let threaded = RaxmlRunner {
            exec: "raxmlHPC-PTHREADS-SSE3".to_string(),
            threads: 8,
            model: "GTRGAMMA".to_string(),
        };
        let cmd = tree_building_command(TreeBuilder::Raxml, &naming, 1, &threaded, None)?;
        assert!(cmd.args.contains(&"-T".to_string()));
        assert!(cmd.args.contains(&"8".to_string()));

        // FastTree reads the previous compact alignment and writes stdout
        let cmd =
            tree_building_command(TreeBuilder::Fasttree, &naming, 2, &raxml(), Some("FastTree"))?;
        assert_eq!(cmd.program, "FastTree");
        assert_eq!(
            cmd.args,
            vec![
                "-nosupport",
                "-gtr",
                "-gamma",
                "-nt",
                "-intree",
                "aln.fa.iteration_1",
                "aln.fa.iteration_1.snp_sites.aln"
            ]
        );
        assert_eq!(
            cmd.stdout_to.as_ref().map(|p| p.display().to_string()),
            Some("aln.fa.iteration_2".to_string())
        );

        assert!(tree_building_command(TreeBuilder::Fasttree, &naming, 1, &raxml(), None).is_err());
        Ok(())
    }

    #[test]
    fn test_clamp_window_sizes() {
        assert_eq!(clamp_window_sizes(100, 10000), (100, 10000));
        assert_eq!(clamp_window_sizes(1, 2_000_000), (3, 1_000_000));
        assert_eq!(clamp_window_sizes(500, 100), (100, 500));
        assert_eq!(clamp_window_sizes(1, 2), (2, 3));
    }

    #[test]
    fn test_final_output_renames() {
        let renames = final_output_renames("RAxML_result.aln.iteration_4", "out");
        assert_eq!(renames.len(), 9);
        assert!(renames.contains(&(
            "RAxML_result.aln.iteration_4.tab".to_string(),
            "out.recombination_predictions.embl".to_string()
        )));
        assert!(renames.contains(&(
            "RAxML_result.aln.iteration_4.output_tree".to_string(),
            "out.node_labelled.tre".to_string()
        )));
        assert_eq!(
            renames.last(),
            Some(&(
                "RAxML_result.aln.iteration_4".to_string(),
                "out.final_tree.tre".to_string()
            ))
        );
    }

    #[test]
    fn test_delete_files_matching() -> Result<()> {
        let dir = tempdir()?;
        let keep = dir.path().join("RAxML_result.aln.iteration_3");
        let kill_tree = dir.path().join("RAxML_result.aln.iteration_1");
        let kill_info = dir.path().join("RAxML_info.aln.iteration_2");
        let kill_artifact = dir.path().join("RAxML_result.aln.iteration_2.tab");
        for path in [&keep, &kill_tree, &kill_info, &kill_artifact] {
            fs::write(path, "x")?;
        }

        let regexes = raxml_regexes_for_deletion(&naming(), 3);
        assert!(any_file_matching(dir.path(), &regexes)?);
        delete_files_matching(dir.path(), &regexes)?;

        assert!(keep.exists());
        assert!(!kill_tree.exists());
        assert!(!kill_info.exists());
        assert!(!kill_artifact.exists());
        assert!(!any_file_matching(dir.path(), &regexes)?);
        Ok(())
    }

    #[test]
    fn test_fasttree_regexes_spare_the_final_iteration() -> Result<()> {
        let dir = tempdir()?;
        let keep = dir.path().join("aln.fa.iteration_3");
        let keep_artifact = dir.path().join("aln.fa.iteration_3.tab");
        let kill = dir.path().join("aln.fa.iteration_1");
        let kill_artifact = dir.path().join("aln.fa.iteration_2.snp_sites.aln");
        for path in [&keep, &keep_artifact, &kill, &kill_artifact] {
            fs::write(path, "x")?;
        }

        delete_files_matching(dir.path(), &fasttree_regexes_for_deletion(&naming(), 3))?;
        assert!(keep.exists());
        assert!(keep_artifact.exists());
        assert!(!kill.exists());
        assert!(!kill_artifact.exists());
        Ok(())
    }

    #[test]
    fn test_external_command_reports_the_stage() {
        let err = ExternalCommand {
            stage: "tree building",
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo boom >&2; exit 1".to_string()],
            stdout_to: None,
        }
        .run()
        .unwrap_err();
        assert_eq!(err.to_string(), "Failed while running tree building: boom");
    }

    #[test]
    fn test_external_command_captures_stdout() -> Result<()> {
        let dir = tempdir()?;
        let out = dir.path().join("tree");
        ExternalCommand {
            stage: "tree building",
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "printf '(A:1,B:2);'".to_string()],
            stdout_to: Some(out.clone()),
        }
        .run()?;
        assert_eq!(fs::read_to_string(&out)?, "(A:1,B:2);");
        Ok(())
    }
}

use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};

use camus::errors::CamusError;
use camus::infer::{InferOptions, infer};
use camus::io::{
    GeneTreeFormat, read_constraint_tree, read_gene_trees, read_single_tree, write_results_csv,
    write_support_csv,
};
use camus::network::parse_extended_newick;
use camus::quartets::{QuartetFilter, QuartetOptions};
use camus::scorer::ScoreMode;
use camus::support::reticulation_support;

/// Infer a level-1 phylogenetic network by adding reticulation branches to
/// a rooted binary constraint tree, maximizing the gene-tree quartets the
/// network displays.
#[derive(Parser, Debug)]
#[command(name = "camus", version, disable_version_flag = true, about)]
struct Cli {
    /// Gene-tree file format
    #[arg(short = 'f', long = "format", global = true, value_enum, default_value_t = FormatArg::Newick)]
    format: FormatArg,

    /// Scoring mode for candidate reticulations
    #[arg(short = 's', long = "score", global = true, value_enum, default_value_t = ScoreArg::Max)]
    score: ScoreArg,

    /// Quartet filter mode (0 = off, 1 = drop minority, 2 = keep majority)
    #[arg(short = 'q', long = "quartet-filter", global = true, default_value_t = 0)]
    quartet_filter: u8,

    /// Quartet filter threshold in [0,1] (default 0.5; requires -q 1|2)
    #[arg(short = 't', long = "threshold", global = true)]
    threshold: Option<f64>,

    /// Alpha for sym mode, in (0,1] (default 0.1; requires -s sym)
    #[arg(short = 'a', long = "alpha", global = true)]
    alpha: Option<f64>,

    /// Worker threads; 0 or less uses every core
    #[arg(short = 'n', long = "nprocs", global = true, default_value_t = 0)]
    nprocs: i64,

    /// Count each distinct (gene tree, quartet) once
    #[arg(long = "asSet", alias = "as-set", global = true, default_value_t = false)]
    as_set: bool,

    /// Suppress progress messages
    #[arg(long = "quiet", global = true, default_value_t = false)]
    quiet: bool,

    /// Print version
    #[arg(short = 'v', long = "version", global = true, default_value_t = false)]
    version: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Infer the best network for every useful reticulation count
    Infer {
        /// Rooted binary constraint tree (newick)
        tree_file: PathBuf,
        /// Gene trees (newick lines or nexus)
        gene_tree_file: PathBuf,
    },
    /// Score each reticulation of a network against every gene tree
    Score {
        /// Extended-newick network, as written by `infer`
        tree_file: PathBuf,
        /// Gene trees (newick lines or nexus)
        gene_tree_file: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FormatArg {
    Newick,
    Nexus,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ScoreArg {
    Max,
    Norm,
    Sym,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    if cli.version {
        println!("camus {}", env!("CARGO_PKG_VERSION"));
        return;
    }
    if let Err(err) = run(cli) {
        eprintln!("camus: {err}");
        let code = match err {
            CamusError::InvalidOption(_) => 1,
            _ => 2,
        };
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> Result<(), CamusError> {
    let Some(command) = &cli.command else {
        return Err(CamusError::InvalidOption(
            "missing command (infer or score)".into(),
        ));
    };
    let opts = build_options(&cli)?;
    configure_threads(cli.nprocs);
    let format = match cli.format {
        FormatArg::Newick => GeneTreeFormat::Newick,
        FormatArg::Nexus => GeneTreeFormat::Nexus,
    };

    match command {
        Command::Infer {
            tree_file,
            gene_tree_file,
        } => {
            let t0 = Instant::now();
            let constraint = read_constraint_tree(tree_file)?;
            let gene_trees = read_gene_trees(gene_tree_file, format)?;
            log_if(
                !cli.quiet,
                format!("Read {} gene trees in {:.3}s", gene_trees.len(), t0.elapsed().as_secs_f64()),
            );

            let t1 = Instant::now();
            let result = infer(&constraint, &gene_trees, &opts, None)?;
            log_if(
                !cli.quiet,
                format!(
                    "Inferred networks for {} reticulation budgets in {:.3}s",
                    result.rows.len(),
                    t1.elapsed().as_secs_f64()
                ),
            );
            if result.omitted_taxa {
                eprintln!("camus: warning: some gene trees omit constraint taxa");
            }
            write_results_csv(std::io::stdout().lock(), &result.rows)?;
        }
        Command::Score {
            tree_file,
            gene_tree_file,
        } => {
            let t0 = Instant::now();
            let network = parse_extended_newick(&read_single_tree(tree_file)?)?;
            let gene_trees = read_gene_trees(gene_tree_file, format)?;
            log_if(
                !cli.quiet,
                format!("Read {} gene trees in {:.3}s", gene_trees.len(), t0.elapsed().as_secs_f64()),
            );

            let t1 = Instant::now();
            let table = reticulation_support(&network, &gene_trees, &opts.quartets, None)?;
            log_if(
                !cli.quiet,
                format!(
                    "Scored {} reticulations in {:.3}s",
                    table.labels.len(),
                    t1.elapsed().as_secs_f64()
                ),
            );
            write_support_csv(std::io::stdout().lock(), &table)?;
        }
    }
    Ok(())
}

fn build_options(cli: &Cli) -> Result<InferOptions, CamusError> {
    let filter = match cli.quartet_filter {
        0 => QuartetFilter::Off,
        1 => QuartetFilter::DropMin,
        2 => QuartetFilter::KeepMax,
        other => {
            return Err(CamusError::InvalidOption(format!(
                "-q must be 0, 1 or 2 (got {other})"
            )));
        }
    };
    if let Some(threshold) = cli.threshold {
        if filter == QuartetFilter::Off {
            return Err(CamusError::InvalidOption(
                "-t requires a quartet filter mode (-q 1 or -q 2)".into(),
            ));
        }
        if !(0.0..=1.0).contains(&threshold) {
            return Err(CamusError::InvalidOption(format!(
                "-t must lie in [0,1] (got {threshold})"
            )));
        }
    }
    if let Some(alpha) = cli.alpha {
        if !matches!(cli.score, ScoreArg::Sym) {
            return Err(CamusError::InvalidOption(
                "-a only applies to -s sym".into(),
            ));
        }
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(CamusError::InvalidOption(format!(
                "-a must lie in (0,1] (got {alpha})"
            )));
        }
    }

    let score_mode = match cli.score {
        ScoreArg::Max => ScoreMode::Max,
        ScoreArg::Norm => ScoreMode::Norm,
        ScoreArg::Sym => ScoreMode::Sym {
            alpha: cli.alpha.unwrap_or(0.1),
        },
    };
    Ok(InferOptions {
        score_mode,
        quartets: QuartetOptions {
            filter,
            threshold: cli.threshold.unwrap_or(0.5),
            as_set: cli.as_set,
            collapse_below: None,
        },
    })
}

fn configure_threads(nprocs: i64) {
    let available = std::thread::available_parallelism().map_or(1, |n| n.get());
    let threads = if nprocs <= 0 {
        available
    } else {
        (nprocs as usize).min(available)
    };
    // Err only when a global pool already exists, which is fine.
    let _ = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global();
}

fn log_if(show: bool, msg: String) {
    if show {
        println!("{msg}");
    }
}

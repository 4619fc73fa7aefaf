// ========================================================================================
//
//                               THE LDSTORE COMMAND LINE
//
// ========================================================================================
//
// Thin orchestration over the library: every subcommand resolves a `StoreConfig`
// (defaults, then the optional TOML file, then `LDSTORE_BLOCK_SIZE`, then flags),
// opens the files it needs and hands off to the storage engine.

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use ldstore::ld::format::FILE_EXTENSION;
use ldstore::ld::{LdComputer, LdMatrixReader, LdMatrixWriter, ReaderOptions, prune_groups};
use ldstore::shared::files::{self, ResultColumns, ResultGroup};
use ldstore::{LdError, Result, StoreConfig, VariantIndex};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser)]
#[command(
    name = "ldstore",
    version,
    about = "Indexed, compressed storage for sparse pairwise LD matrices",
    long_about = "Builds LD matrix files from r2 tables or per-parent allele probabilities \
                  and answers per-variant r2 queries without scanning the file."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Overrides shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
struct ConfigArgs {
    /// TOML configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Deflate level, 0 to 9
    #[arg(long, value_name = "LEVEL")]
    compression_level: Option<u32>,

    /// Bytes per memory-mapped block when reading
    #[arg(long, value_name = "BYTES")]
    block_size: Option<u64>,

    /// Pairs are kept only when r2 is strictly above this value
    #[arg(long, value_name = "R2")]
    min_r2: Option<f64>,

    /// Maximum distance in bp between the variants of a pair
    #[arg(long, value_name = "BP")]
    max_distance: Option<u32>,

    /// Worker threads (defaults to the number of CPUs)
    #[arg(long, value_name = "N")]
    threads: Option<usize>,

    /// Abort the computation after this many seconds
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,
}

impl ConfigArgs {
    fn resolve(&self) -> Result<StoreConfig> {
        let mut config = match &self.config {
            Some(path) => StoreConfig::load(path)?,
            None => StoreConfig::default(),
        };
        config.apply_env();
        if let Some(level) = self.compression_level {
            config.compression_level = level;
        }
        if let Some(block_size) = self.block_size {
            config.block_size = block_size;
        }
        if let Some(min_r2) = self.min_r2 {
            config.min_r2 = min_r2;
        }
        if let Some(max_distance) = self.max_distance {
            config.max_distance = max_distance;
        }
        if self.threads.is_some() {
            config.threads = self.threads;
        }
        if self.timeout.is_some() {
            config.timeout_secs = self.timeout;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build a matrix from a `variantA variantB r2` table
    #[command(about = "Build an LD matrix from an r2 table (tsv or tsv.gz)")]
    Build {
        /// Headerless tab-separated table of variantA, variantB, r2
        #[arg(long, value_name = "PATH")]
        pairs: PathBuf,

        /// Matrix file to create
        #[arg(long, value_name = "PATH")]
        output: PathBuf,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Compute LD from per-parent allele probabilities and store it
    #[command(about = "Compute LD in sliding windows and write an LD matrix")]
    Compute {
        /// Tab-separated rows of id, position, then one value per parent
        #[arg(long, value_name = "PATH")]
        dosages: PathBuf,

        /// Matrix file to create
        #[arg(long, value_name = "PATH")]
        output: PathBuf,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Look up the stored partners of variants
    #[command(about = "Query r2 values for one or more variants")]
    Query {
        /// Matrix file to read
        #[arg(long, value_name = "PATH")]
        matrix: PathBuf,

        /// Variant to look up (repeatable)
        #[arg(long = "variant", value_name = "ID", required_unless_present = "variants")]
        variant: Vec<String>,

        /// File with one variant id per line
        #[arg(long, value_name = "PATH", conflicts_with = "variant")]
        variants: Option<PathBuf>,

        /// Output file (defaults to stdout)
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Keep the most significant variant of every LD clump in a results table
    #[command(about = "LD-prune association results against an LD matrix")]
    Prune(PruneArgs),

    /// Print the summary of a matrix file
    #[command(about = "Summarize a matrix file and optionally check its integrity")]
    Inspect {
        /// Matrix file to read
        #[arg(value_name = "PATH")]
        matrix: PathBuf,

        /// Inflate every chunk and compare against the trailer
        #[arg(long)]
        verify: bool,

        #[command(flatten)]
        config: ConfigArgs,
    },
}

/// Placeholder in `--matrix` replaced by each contig name.
const CONTIG_PLACEHOLDER: &str = "{contig}";

#[derive(Args, Debug, Clone)]
struct PruneArgs {
    /// Matrix file to read; may contain {contig} to use one matrix per contig
    #[arg(long, value_name = "PATH")]
    matrix: PathBuf,

    /// Tab-separated results table with a header line
    #[arg(long, value_name = "PATH")]
    results: PathBuf,

    /// Output file (defaults to stdout)
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Name of the p-value column
    #[arg(long, value_name = "NAME", default_value = "h.intercept.p")]
    p_column: String,

    /// Name of the variant id column
    #[arg(long, value_name = "NAME", default_value = "variantId")]
    id_column: String,

    /// Name of the contig column; results are pruned per contig when given
    #[arg(long, value_name = "NAME")]
    contig_column: Option<String>,

    /// Name of the phenotype column; results are pruned per phenotype when given
    #[arg(long, value_name = "NAME")]
    pheno_column: Option<String>,

    /// Results with a larger p-value are ignored
    #[arg(long, value_name = "P", default_value_t = 1e-6)]
    max_p: f64,

    /// Partners with at least this r2 are suppressed
    #[arg(long, value_name = "R2", default_value_t = 0.05)]
    min_r2: f64,

    /// TOML configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Bytes per memory-mapped block when reading
    #[arg(long, value_name = "BYTES")]
    block_size: Option<u64>,

    /// Worker threads (defaults to the number of CPUs)
    #[arg(long, value_name = "N")]
    threads: Option<usize>,
}

impl PruneArgs {
    fn resolve(&self) -> Result<StoreConfig> {
        ConfigArgs {
            config: self.config.clone(),
            block_size: self.block_size,
            threads: self.threads,
            ..ConfigArgs::default()
        }
        .resolve()
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Build {
            pairs,
            output,
            config,
        }) => config.resolve().and_then(|config| run_build(&pairs, &output, &config)),
        Some(Commands::Compute {
            dosages,
            output,
            config,
        }) => config
            .resolve()
            .and_then(|config| run_compute(&dosages, &output, &config)),
        Some(Commands::Query {
            matrix,
            variant,
            variants,
            output,
            config,
        }) => config.resolve().and_then(|config| {
            run_query(&matrix, variant, variants.as_deref(), output.as_deref(), &config)
        }),
        Some(Commands::Prune(args)) => args.resolve().and_then(|config| run_prune(&args, &config)),
        Some(Commands::Inspect {
            matrix,
            verify,
            config,
        }) => config
            .resolve()
            .and_then(|config| run_inspect(&matrix, verify, &config)),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn warn_on_extension(output: &Path) {
    if output.extension().is_none_or(|ext| ext != FILE_EXTENSION) {
        log::warn!(
            "Output '{}' does not end in .{FILE_EXTENSION}",
            output.display()
        );
    }
}

fn run_build(pairs: &Path, output: &Path, config: &StoreConfig) -> Result<()> {
    let start = Instant::now();
    warn_on_extension(output);
    let rows = files::read_pair_table(pairs, config.min_r2)?;
    log::info!("Read {} rows from '{}'", rows.len(), pairs.display());

    let writer = LdMatrixWriter::open(Arc::new(VariantIndex::new()), output, config.compression_level)?;
    for (variant_a, partners) in rows {
        if let Err(e) = writer.add_pairs(&variant_a, partners) {
            discard_partial(writer);
            return Err(e);
        }
    }
    let summary = writer.close()?;
    eprintln!("> Wrote {summary} to '{}' in {:.2?}", output.display(), start.elapsed());
    Ok(())
}

fn run_compute(dosages: &Path, output: &Path, config: &StoreConfig) -> Result<()> {
    warn_on_extension(output);
    let mut variants = files::read_dosages(dosages)?;
    variants.sort_by_key(|variant| variant.position);
    log::info!("Read {} variants from '{}'", variants.len(), dosages.display());

    let writer = LdMatrixWriter::open(Arc::new(VariantIndex::new()), output, config.compression_level)?;
    let computed = LdComputer::new(config).compute(&variants, &writer);
    let computed = match computed {
        Ok(computed) => computed,
        Err(e) => {
            discard_partial(writer);
            return Err(e);
        }
    };
    let summary = writer.close()?;
    eprintln!(
        "> Computed {} rows in {:.2?}; wrote {summary} to '{}'",
        computed.rows,
        computed.elapsed,
        output.display()
    );
    Ok(())
}

/// Deletes a matrix that failed midway; a partial file would look complete to readers.
fn discard_partial(writer: LdMatrixWriter) {
    if let Err(e) = writer.discard() {
        log::warn!("Could not remove the partial matrix: {e}");
    }
}

fn run_query(
    matrix: &Path,
    mut ids: Vec<String>,
    list: Option<&Path>,
    output: Option<&Path>,
    config: &StoreConfig,
) -> Result<()> {
    if let Some(list) = list {
        ids.extend(files::read_variant_list(list)?);
    }
    if ids.is_empty() {
        return Err(LdError::InvalidArgument("No variants to query.".to_string()));
    }

    let reader = LdMatrixReader::open_with(
        matrix,
        ReaderOptions {
            block_size: config.block_size,
        },
    )?;
    let results = reader.par_lookup(&ids)?;

    let sink: Box<dyn Write> = match output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout().lock()),
    };
    let mut out = BufWriter::new(sink);
    writeln!(out, "variant_a\tvariant_b\tr2")?;

    let mut missing = 0usize;
    for (id, partners) in ids.iter().zip(results) {
        let Some(partners) = partners else {
            log::warn!("No LD data for '{id}'");
            missing += 1;
            continue;
        };
        let mut partners: Vec<(String, f32)> = partners.into_iter().collect();
        partners.sort_by(|a, b| a.0.cmp(&b.0));
        for (variant_b, r2) in partners {
            writeln!(out, "{id}\t{variant_b}\t{r2}")?;
        }
    }
    out.flush()?;

    if missing > 0 {
        log::info!("{missing} of {} variants had no stored row", ids.len());
    }
    reader.close();
    Ok(())
}

fn run_prune(args: &PruneArgs, config: &StoreConfig) -> Result<()> {
    let start = Instant::now();
    let matrix = args.matrix.to_string_lossy();
    let per_contig = matrix.contains(CONTIG_PLACEHOLDER);
    if per_contig && args.contig_column.is_none() {
        return Err(LdError::InvalidArgument(format!(
            "--matrix uses {CONTIG_PLACEHOLDER} but no --contig-column was given."
        )));
    }

    let columns = ResultColumns {
        id: &args.id_column,
        p: &args.p_column,
        contig: args.contig_column.as_deref(),
        pheno: args.pheno_column.as_deref(),
    };
    let table = files::read_results(&args.results, columns, args.max_p)?;
    let candidates: usize = table.groups.iter().map(|group| group.lines.len()).sum();
    log::info!(
        "Read {candidates} results at or below p {} in {} groups from '{}'",
        args.max_p,
        table.groups.len(),
        args.results.display()
    );

    // Groups arrive sorted by contig, so one contig's groups are adjacent.
    let batches: Vec<(PathBuf, &[ResultGroup])> = if per_contig {
        table
            .groups
            .chunk_by(|a, b| a.contig == b.contig)
            .map(|groups| {
                let contig = groups[0].contig.as_deref().unwrap_or_default();
                (PathBuf::from(matrix.replace(CONTIG_PLACEHOLDER, contig)), groups)
            })
            .collect()
    } else {
        vec![(args.matrix.clone(), table.groups.as_slice())]
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.effective_threads())
        .build()
        .map_err(|e| LdError::InvalidArgument(format!("Cannot start worker pool: {e}")))?;

    let mut kept: Vec<&str> = Vec::new();
    for (path, groups) in batches {
        let reader = LdMatrixReader::open_with(
            &path,
            ReaderOptions {
                block_size: config.block_size,
            },
        )?;
        let ids: Vec<Vec<&str>> = groups
            .iter()
            .map(|group| group.lines.iter().map(|line| line.id.as_str()).collect())
            .collect();
        let positions = pool.install(|| prune_groups(&ids, &reader, args.min_r2))?;
        for (group, positions) in groups.iter().zip(positions) {
            kept.extend(positions.into_iter().map(|at| group.lines[at].line.as_str()));
        }
        reader.close();
    }

    let sink: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout().lock()),
    };
    let mut out = BufWriter::new(sink);
    writeln!(out, "{}", table.header)?;
    for line in &kept {
        writeln!(out, "{line}")?;
    }
    out.flush()?;

    eprintln!(
        "> Kept {} of {candidates} results (r2 >= {}) in {:.2?}",
        kept.len(),
        args.min_r2,
        start.elapsed()
    );
    Ok(())
}

fn run_inspect(matrix: &Path, verify: bool, config: &StoreConfig) -> Result<()> {
    let reader = LdMatrixReader::open_with(
        matrix,
        ReaderOptions {
            block_size: config.block_size,
        },
    )?;
    println!("{}", reader.summary());
    if verify {
        reader.verify()?;
        println!("verified\tok");
    }
    reader.close();
    Ok(())
}

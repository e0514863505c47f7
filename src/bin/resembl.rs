//! Thin CLI layer over the `resembl` orchestrator. Exercises `add`,
//! `find`, `compare`, `reindex`, `stats`, and `clean` with plain-text
//! output; the full command surface, output formatting, and database
//! dialect selection are an external collaborator's concern, so this
//! binary always runs against a fresh in-memory store.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use resembl::core::config::ResemblConfig;
use resembl::orchestrator::Orchestrator;
use resembl::storage::InMemoryStorage;
use resembl::ResemblError;

#[derive(Parser)]
#[command(name = "resembl", about = "Local similarity search over assembly snippets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit debug-level logging.
    #[arg(long, global = true)]
    verbose: bool,

    /// Path to the on-disk LSH cache file.
    #[arg(long, global = true, default_value = "resembl.cache")]
    cache: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a snippet under a name.
    Add {
        name: String,
        /// Assembly text given directly on the command line.
        #[arg(long, conflicts_with = "file")]
        code: Option<String>,
        /// Read the assembly text from a file instead.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Find the most similar stored snippets to a query.
    Find {
        #[arg(long, conflicts_with = "file")]
        code: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
        /// Maximum number of results to return.
        #[arg(long, default_value_t = 5)]
        top_n: usize,
        /// Minimum Jaccard estimate a candidate must clear.
        #[arg(long, default_value_t = 0.5)]
        threshold: f64,
        /// Treat the query as already-canonical token text.
        #[arg(long)]
        raw: bool,
    },
    /// Compare two stored snippets by checksum prefix.
    Compare { a: String, b: String },
    /// Recompute every signature and rebuild the LSH cache from scratch.
    Reindex,
    /// Print corpus-wide statistics.
    Stats,
    /// Delete the on-disk cache.
    Clean,
}

fn read_code(code: Option<String>, file: Option<PathBuf>) -> Result<String, ResemblError> {
    match (code, file) {
        (Some(code), None) => Ok(code),
        (None, Some(path)) => std::fs::read_to_string(&path).map_err(ResemblError::from),
        (None, None) => Err(ResemblError::BadInput(
            "one of --code or --file is required".into(),
        )),
        (Some(_), Some(_)) => unreachable!("clap enforces --code/--file are mutually exclusive"),
    }
}

fn run(cli: Cli) -> Result<(), ResemblError> {
    let orchestrator = Orchestrator::new(
        InMemoryStorage::new(),
        ResemblConfig::default(),
        cli.cache,
    );

    match cli.command {
        Commands::Add { name, code, file } => {
            let code = read_code(code, file)?;
            let outcome = orchestrator.add(&name, &code)?;
            println!("{outcome:?}");
        }
        Commands::Find {
            code,
            file,
            top_n,
            threshold,
            raw,
        } => {
            let code = read_code(code, file)?;
            let results = orchestrator.find(&code, top_n, threshold, !raw)?;
            if results.is_empty() {
                println!("no matches");
            }
            for result in results {
                println!(
                    "{}  hybrid={:.2}  jaccard={:.3}  levenshtein={:.2}  names={}",
                    resembl::storage::to_hex(&result.checksum),
                    result.hybrid,
                    result.jaccard,
                    result.levenshtein,
                    result.names.join(","),
                );
            }
        }
        Commands::Compare { a, b } => {
            let comparison = orchestrator.compare(&a, &b)?;
            println!(
                "jaccard={:.3}  levenshtein={:.2}  hybrid={:.2}  cfg_similarity={:.3}  shared_tokens={}",
                comparison.jaccard,
                comparison.levenshtein,
                comparison.hybrid,
                comparison.cfg_similarity,
                comparison.shared_tokens,
            );
        }
        Commands::Reindex => {
            orchestrator.reindex()?;
            println!("reindex complete");
        }
        Commands::Stats => {
            let stats = orchestrator.stats();
            println!(
                "snippets={}  mean_token_count={:.2}  vocabulary_size={}  mean_pairwise_jaccard={:.3}",
                stats.num_snippets,
                stats.mean_token_count,
                stats.vocabulary_size,
                stats.mean_pairwise_jaccard,
            );
        }
        Commands::Clean => {
            orchestrator.clean()?;
            println!("cache cleaned");
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_add_with_inline_code() {
        let cli = Cli::parse_from(["resembl", "add", "f1", "--code", "mov eax, ebx"]);
        match cli.command {
            Commands::Add { name, code, file } => {
                assert_eq!(name, "f1");
                assert_eq!(code.as_deref(), Some("mov eax, ebx"));
                assert!(file.is_none());
            }
            _ => panic!("expected Add"),
        }
    }

    #[test]
    fn parses_find_defaults() {
        let cli = Cli::parse_from(["resembl", "find", "--code", "ret"]);
        match cli.command {
            Commands::Find {
                top_n, threshold, raw, ..
            } => {
                assert_eq!(top_n, 5);
                assert_eq!(threshold, 0.5);
                assert!(!raw);
            }
            _ => panic!("expected Find"),
        }
    }

    #[test]
    fn read_code_requires_exactly_one_source() {
        assert!(read_code(None, None).is_err());
    }
}

use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "nexus-rag",
    about = "On-device semantic retrieval over a precomputed embedding index"
)]
pub struct Cli {
    /// Override the XDG data directory holding the index artifacts
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Find the documents most similar to a query
    Search(SearchArgs),
    /// Show the token ids a query encodes to
    Tokenize(TokenizeArgs),
    /// Load the index and report what was found
    Status(StatusArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

/// Artifact overrides shared by every command that loads the index.
#[derive(Debug, Clone, Default, Args)]
pub struct IndexArgs {
    /// Embedding blob (default: <data-dir>/rag_embeddings.bin)
    #[arg(long)]
    pub index: Option<PathBuf>,

    /// tokenizer.json (default: <data-dir>/tokenizer.json if present)
    #[arg(long)]
    pub tokenizer: Option<PathBuf>,

    /// Encoder model (default: <data-dir>/embedding_model.onnx if present)
    #[arg(long)]
    pub encoder: Option<PathBuf>,

    /// Embedding dimension (default: from rag_config.json, else 384)
    #[arg(long)]
    pub dim: Option<usize>,

    /// Prefix prepended to queries (default: from rag_config.json)
    #[arg(long)]
    pub query_prefix: Option<String>,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "3")]
    pub count: usize,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub index: IndexArgs,
}

// -- Tokenize --

#[derive(Debug, Parser)]
pub struct TokenizeArgs {
    /// Text to tokenize
    pub text: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub index: IndexArgs,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub index: IndexArgs,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "nexus-rag",
            &mut std::io::stdout(),
        );
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn parse_search_defaults() {
        let cli = Cli::parse_from(["nexus-rag", "search", "hello"]);
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.query, "hello");
                assert_eq!(args.count, 3);
                assert!(!args.json);
                assert!(args.index.index.is_none());
                assert!(args.index.dim.is_none());
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn parse_index_overrides() {
        let cli = Cli::parse_from([
            "nexus-rag",
            "-vv",
            "status",
            "--index",
            "/tmp/blob.bin",
            "--dim",
            "2",
            "--query-prefix",
            "query: ",
        ]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Status(args) => {
                assert_eq!(args.index.index, Some(PathBuf::from("/tmp/blob.bin")));
                assert_eq!(args.index.dim, Some(2));
                assert_eq!(args.index.query_prefix.as_deref(), Some("query: "));
            }
            _ => panic!("expected status command"),
        }
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }
}

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "docrag",
    about = "Build cited retrieval context from your documents"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Read configuration from this JSON file instead of the data directory
    #[arg(long = "config", global = true)]
    pub config_file: Option<PathBuf>,

    /// Override the embedding model
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Apply the stored overrides of this user
    #[arg(long, global = true)]
    pub user: Option<String>,

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
    /// Split a file into chunks
    Chunk(ChunkArgs),
    /// Index files and build cited context for a query
    Search(SearchArgs),
    /// Print alternative phrasings of a query
    Expand(ExpandArgs),
    /// Embed a piece of text
    Embed(EmbedArgs),
    /// Inspect or clear the embedding cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Inspect or change stored configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Chunk --

#[derive(Debug, Parser)]
pub struct ChunkArgs {
    /// File to split
    pub path: PathBuf,

    /// Maximum chunk size in characters
    #[arg(short = 's', long)]
    pub size: Option<usize>,

    /// Characters shared by consecutive chunks
    #[arg(long)]
    pub overlap: Option<usize>,

    /// Splitting strategy (fixed, sentence, paragraph, recursive, overlap,
    /// semantic, token_aware, code_aware)
    #[arg(long)]
    pub strategy: Option<String>,

    /// Output chunks as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Files or directories to index
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Only index relative paths matching this glob (can be repeated)
    #[arg(short = 'g', long = "glob")]
    pub globs: Vec<String>,

    /// Number of results to return
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Retrieval method (semantic, keyword, hybrid)
    #[arg(long)]
    pub method: Option<String>,

    /// Reranking method (none, mmr, contextual, heuristic, ensemble)
    #[arg(long)]
    pub rerank: Option<String>,

    /// Citation style (inline, numbered, footnote, markdown, superscript)
    #[arg(long)]
    pub format: Option<String>,

    /// Minimum retrieval score
    #[arg(long)]
    pub min_score: Option<f32>,

    /// Context budget in tokens
    #[arg(long)]
    pub max_tokens: Option<usize>,

    /// Compress the context to sentences relevant to the query
    #[arg(long)]
    pub compress: bool,

    /// Leave the reference list off the context
    #[arg(long)]
    pub no_references: bool,

    /// Output the full response as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Expand --

#[derive(Debug, Parser)]
pub struct ExpandArgs {
    /// The query to expand
    pub query: String,

    /// Maximum number of variants, including the query itself
    #[arg(short = 'n', long, default_value = "4")]
    pub count: usize,

    /// Also print a hypothetical answer passage
    #[arg(long)]
    pub hyde: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Embed --

#[derive(Debug, Parser)]
pub struct EmbedArgs {
    /// Text to embed
    pub text: String,

    /// Bypass the embedding cache
    #[arg(long)]
    pub no_cache: bool,

    /// Output the full vector as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Cache --

#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Show entry count and hit statistics
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete every cached embedding
    Clear,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Store an override (e.g. retrieval.top_k 3)
    Set {
        /// Setting key, `section.field`
        key: String,
        /// New value; parsed as JSON when possible
        value: String,
    },
    /// Print one effective setting
    Get {
        /// Setting key, `section.field`
        key: String,
        /// Print the raw stored override (global, or for `--user`) instead
        #[arg(long)]
        stored: bool,
    },
    /// Remove stored overrides (all of them, or one key)
    Clear {
        /// Only remove this key
        key: Option<String>,
    },
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
            "docrag",
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
        let cli = Cli::parse_from(["docrag", "search", "cats", "notes/"]);
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.query, "cats");
                assert_eq!(args.paths, vec![PathBuf::from("notes/")]);
                assert!(args.globs.is_empty());
                assert_eq!(args.count, None);
                assert!(!args.json);
                assert!(!args.no_references);
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn search_requires_a_path() {
        assert!(Cli::try_parse_from(["docrag", "search", "cats"]).is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "docrag", "expand", "what is rrf", "-vv", "--user", "ana",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.user.as_deref(), Some("ana"));
        match cli.command {
            Command::Expand(args) => assert_eq!(args.count, 4),
            _ => panic!("expected expand command"),
        }
    }

    #[test]
    fn parse_config_set() {
        let cli = Cli::parse_from([
            "docrag",
            "config",
            "set",
            "retrieval.top_k",
            "3",
        ]);
        match cli.command {
            Command::Config {
                action: ConfigAction::Set { key, value },
            } => {
                assert_eq!(key, "retrieval.top_k");
                assert_eq!(value, "3");
            }
            _ => panic!("expected config set"),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::engine::DEFAULT_TOP_K;

#[derive(Parser, Debug)]
#[command(version, about = "Enrich repositories into briefing cards and search them", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch, extract and index one or more repositories
    Enrich {
        /// https://github.com/<owner>/<repo> URLs
        #[clap(required = true)]
        urls: Vec<String>,
    },
    /// Remove a repository from the index
    Delete {
        url: String,
    },
    /// Find repositories matching a goal
    Search {
        text: String,

        /// Number of results
        #[clap(short, default_value_t = DEFAULT_TOP_K)]
        k: usize,
    },
    /// Print the number of indexed repositories
    Size {},
    /// Rebuild the index from stored briefing cards
    Rebuild {},
    /// Print the stored briefing card of a repository
    Show {
        url: String,
    },
    /// Analyse one source file
    Analyse {
        file: PathBuf,

        /// Project root used to find dependents. Defaults to the file's directory.
        #[clap(long)]
        project: Option<PathBuf>,
    },
    /// Search the source files of a local project
    Codebase {
        /// Project root
        project: PathBuf,

        /// Text to search for
        query: Option<String>,

        /// Number of results
        #[clap(short, default_value_t = DEFAULT_TOP_K)]
        k: usize,

        /// Re-read the project before searching
        #[clap(long)]
        reindex: bool,
    },
    /// Rate how an enriched repository fits a project goal
    Impact {
        url: String,

        #[clap(long)]
        goal: String,

        /// JSON file describing the project structure
        #[clap(long)]
        structure: Option<PathBuf>,
    },
    /// List models available to the LLM backend
    Models {},
    /// Start the HTTP daemon
    Serve {
        /// Address to listen on. Defaults to web.listen from config.yaml.
        #[clap(long)]
        listen: Option<String>,
    },
}

//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

/// Resumable HTTP downloads with persisted state.
///
/// Downloads survive interruption: pause with Ctrl+C and pick them up later
/// with `resume`, from the exact byte they stopped at.
#[derive(Parser, Debug)]
#[command(name = "resumable-dl")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Database file holding download records
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Config file to read instead of the default location
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download URLs and wait for them to finish
    Get(GetArgs),
    /// List stored downloads
    List {
        /// Only downloads with this tag
        #[arg(long)]
        tag: Option<String>,
    },
    /// Continue paused or failed downloads and wait for them
    Resume(Selection),
    /// Restart downloads regardless of their state and wait for them
    Retry(Selection),
    /// Stop downloads and delete their files
    Cancel(Selection),
    /// Remove download records
    Clear {
        #[command(flatten)]
        selection: Selection,

        /// Also delete downloaded and partial files
        #[arg(long)]
        delete_file: bool,
    },
}

#[derive(ClapArgs, Debug)]
pub struct GetArgs {
    /// URLs to download
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Directory to save into (defaults to the config file's download_dir, then .)
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Tag to group these downloads under
    #[arg(short, long)]
    pub tag: Option<String>,

    /// File name to save as (only with a single URL)
    #[arg(short = 'o', long)]
    pub file_name: Option<String>,

    /// Extra request header, as `Name: value` (repeatable)
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,
}

/// Which records a command applies to.
#[derive(ClapArgs, Debug)]
#[group(required = true, multiple = false)]
pub struct Selection {
    /// Download ids as shown by `list`
    pub ids: Vec<i64>,

    /// Every download with this tag
    #[arg(long)]
    pub tag: Option<String>,

    /// Every download
    #[arg(long)]
    pub all: bool,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let Some((name, value)) = raw.split_once(':') else {
        return Err(format!("expected `Name: value`, got '{raw}'"));
    };
    let name = name.trim();
    if name.is_empty() {
        return Err("header name must not be empty".to_string());
    }
    Ok((name.to_string(), value.trim().to_string()))
}

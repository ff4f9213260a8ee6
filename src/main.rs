use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use log::debug;

use placegrid::{generate_crossword, CrosswordOptions, ValidationLevel};

/// Lay out a crossword-style grid from a word list.
#[derive(Debug, Parser)]
struct Opts {
    /// Word list file with one word per line, or `-` to read stdin.
    words: PathBuf,

    /// JSON file of generation options. Flags given here override it.
    #[arg(long)]
    options: Option<PathBuf>,

    /// How many words to try to place.
    #[arg(long)]
    count: Option<i64>,

    /// How many independent attempts to make.
    #[arg(long)]
    attempts: Option<i64>,

    /// Side length of the working grid. Also caps word length.
    #[arg(long)]
    grid_size: Option<i64>,

    /// strict, normal or lenient.
    #[arg(long)]
    level: Option<ValidationLevel>,

    #[arg(long)]
    min_length: Option<i64>,

    #[arg(long)]
    max_length: Option<i64>,

    /// Seed to regenerate a grid.
    #[arg(long)]
    seed: Option<u64>,
}

fn load_words(path: &Path) -> Result<Vec<String>> {
    let raw = if path.as_os_str() == "-" {
        let mut raw = String::new();
        io::stdin().read_to_string(&mut raw).context("reading word list from stdin")?;
        raw
    } else {
        fs::read_to_string(path)
            .with_context(|| format!("reading word list {}", path.display()))?
    };

    Ok(raw.lines().map(str::trim).filter(|line| !line.is_empty()).map(String::from).collect())
}

fn load_options(path: Option<&Path>) -> Result<CrosswordOptions> {
    let path = match path {
        Some(path) => path,
        None => return Ok(CrosswordOptions::default()),
    };

    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading options {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing options {}", path.display()))
}

fn main() -> Result<()> {
    env_logger::init();
    let opts = Opts::parse();

    let words = load_words(&opts.words)?;
    let mut options = load_options(opts.options.as_deref())?;

    if let Some(count) = opts.count {
        options.word_count = count;
    }
    if let Some(attempts) = opts.attempts {
        options.max_attempts = attempts;
    }
    if let Some(grid_size) = opts.grid_size {
        options.max_grid_size = grid_size;
    }
    if let Some(level) = opts.level {
        options.validation_level = level;
    }
    if let Some(min_length) = opts.min_length {
        options.min_word_length = min_length;
    }
    if opts.max_length.is_some() {
        options.max_word_length = opts.max_length;
    }
    if opts.seed.is_some() {
        options.seed = opts.seed;
    }

    debug!("loaded {} words, options: {:?}", words.len(), options);

    let result = generate_crossword(&words, &options);

    println!("{:?}", result.stats);
    println!("{}", result.grid);
    println!();

    for placed_word in &result.placed_words {
        println!(
            "{:<16} ({}, {}) -> ({}, {}) {:?}",
            placed_word.text(),
            placed_word.start_row(),
            placed_word.start_col(),
            placed_word.end_row(),
            placed_word.end_col(),
            placed_word.direction(),
        );
    }

    Ok(())
}

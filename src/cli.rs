use crate::model::Strictness;
use clap::{Parser, Subcommand, ValueEnum};
use std::fmt;
use std::path::PathBuf;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// JSON channel archive served as the chat platform
    #[clap(long, value_parser)]
    pub archive: Option<PathBuf>,

    #[clap(long, value_parser)]
    pub config: Option<PathBuf>,

    #[clap(long, value_parser)]
    pub log: Option<PathBuf>,

    #[clap(long, value_parser, default_value_t = false)]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan channel history for a keyword, regex or the bad-word list
    Search {
        /// Keyword or regex; ignored in bad-word mode
        query: Option<String>,

        #[clap(long, value_parser, default_value_t = SearchMode::Keyword)]
        mode: SearchMode,

        #[clap(long, value_parser, default_value_t = StrictnessArg::Substring)]
        strictness: StrictnessArg,

        /// Only messages by this user id
        #[clap(long, value_parser)]
        user: Option<u64>,

        /// Restrict the scan to these channel ids
        #[clap(long, value_parser, use_value_delimiter = true)]
        channels: Option<Vec<u64>>,

        #[clap(long, value_parser, use_value_delimiter = true)]
        include: Option<Vec<u64>>,

        #[clap(long, value_parser, use_value_delimiter = true)]
        exclude: Option<Vec<u64>>,

        /// Messages per channel, accepts k/m suffixes (e.g. 10k)
        #[clap(long, value_parser = parse_size, default_value = "1k")]
        depth: usize,

        #[clap(long, value_parser, default_value_t = false)]
        deep: bool,

        /// Bypass cached history
        #[clap(long, value_parser, default_value_t = false)]
        refresh: bool,

        /// Give up after this many seconds and print partial results
        #[clap(long, value_parser)]
        timeout: Option<u64>,

        /// Results printed
        #[clap(long, value_parser, default_value_t = 25)]
        show: usize,

        /// Print process metrics in Prometheus text format afterwards
        #[clap(long, value_parser, default_value_t = false)]
        metrics: bool,

        /// User id the search is attributed to in statistics
        #[clap(long, value_parser)]
        requester: Option<u64>,
    },
    /// Show a message with its surrounding messages
    Context {
        channel: u64,
        message: u64,

        #[clap(long, value_parser, default_value_t = 2)]
        radius: usize,
    },
    /// Check member names and display names against the bad-word list
    Members {
        #[clap(long, value_parser, default_value_t = StrictnessArg::Substring)]
        strictness: StrictnessArg,
    },
    /// Print or reset cumulative search statistics
    Stats {
        #[clap(long, value_parser, default_value_t = false)]
        reset: bool,
    },
    /// Run the periodic bad-word scan
    Watch {
        /// Minutes between runs
        #[clap(long, value_parser, default_value_t = 60)]
        interval: u64,

        /// Stop after this many runs
        #[clap(long, value_parser, default_value_t = 1)]
        runs: u64,

        #[clap(long, value_parser = parse_size, default_value = "100")]
        depth: usize,

        #[clap(long, value_parser, default_value_t = StrictnessArg::Substring)]
        strictness: StrictnessArg,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum SearchMode {
    #[default]
    Keyword,
    Regex,
    Badword,
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMode::Keyword => write!(f, "keyword"),
            SearchMode::Regex => write!(f, "regex"),
            SearchMode::Badword => write!(f, "badword"),
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum StrictnessArg {
    Exact,
    #[default]
    Substring,
    Fuzzy,
}

impl fmt::Display for StrictnessArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Strictness::from(*self).fmt(f)
    }
}

impl From<StrictnessArg> for Strictness {
    fn from(arg: StrictnessArg) -> Self {
        match arg {
            StrictnessArg::Exact => Strictness::Exact,
            StrictnessArg::Substring => Strictness::Substring,
            StrictnessArg::Fuzzy => Strictness::Fuzzy,
        }
    }
}

/// Parse a message count with an optional `k` (thousand) or `m` (million)
/// suffix. Fractions are allowed with a suffix: `2.5k` is 2500.
pub fn parse_size(input: &str) -> Result<usize, String> {
    let lowered = input.trim().to_ascii_lowercase();
    let (number, multiplier) = match lowered.chars().last() {
        Some('k') => (&lowered[..lowered.len() - 1], 1_000.0),
        Some('m') => (&lowered[..lowered.len() - 1], 1_000_000.0),
        _ => (lowered.as_str(), 1.0),
    };
    let value = if multiplier == 1.0 {
        number
            .parse::<usize>()
            .map_err(|_| format!("invalid count '{input}'"))?
    } else {
        let scaled = number
            .parse::<f64>()
            .map_err(|_| format!("invalid count '{input}'"))?
            * multiplier;
        if !scaled.is_finite() || scaled < 0.0 {
            return Err(format!("invalid count '{input}'"));
        }
        scaled as usize
    };
    if value == 0 {
        return Err("count must be positive".into());
    }
    Ok(value)
}

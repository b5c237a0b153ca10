//! The administrative command-line interface.
//!
//! Reached when the binary is invoked under its own name with a leading
//! option (`ccache -s`, `ccache --clear`, ...). Options are not mutually
//! exclusive; they are applied in a fixed order: limits first, then
//! zeroing, cleanup, and clearing, then the summary.

use clap::Parser;

use ccache_cache::stats::{self, Counter};
use ccache_cache::cleanup;

/// ccache — a fast C/C++ compiler cache.
#[derive(Parser, Debug)]
#[command(name = "ccache", version, about = "a fast C/C++ compiler cache")]
pub struct AdminCli {
    /// Show statistics summary.
    #[arg(short = 's', long = "show-stats")]
    pub show_stats: bool,

    /// Zero statistics counters.
    #[arg(short = 'z', long = "zero-stats")]
    pub zero_stats: bool,

    /// Delete old files and recalculate size counters.
    #[arg(short = 'c', long = "cleanup")]
    pub cleanup: bool,

    /// Clear the cache completely.
    #[arg(short = 'C', long = "clear")]
    pub clear: bool,

    /// Set the maximum number of files in the cache (0 = no limit).
    #[arg(short = 'F', long = "max-files", value_name = "N")]
    pub max_files: Option<u64>,

    /// Set the maximum cache size; suffixes K, M and G are accepted
    /// (default G). 0 = no limit.
    #[arg(short = 'M', long = "max-size", value_name = "SIZE")]
    pub max_size: Option<String>,
}

/// Parses a size with an optional K/M/G suffix into KiB. No suffix
/// means gibibytes.
fn parse_size_kib(value: &str) -> Option<u64> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last()? {
        'k' | 'K' => (&value[..value.len() - 1], 1),
        'm' | 'M' => (&value[..value.len() - 1], 1024),
        'g' | 'G' => (&value[..value.len() - 1], 1024 * 1024),
        c if c.is_ascii_digit() => (value, 1024 * 1024),
        _ => return None,
    };
    digits.trim().parse::<u64>().ok().map(|n| n * multiplier)
}

fn format_size_kib(kib: u64) -> String {
    if kib >= 1024 * 1024 {
        format!("{:.1} GB", kib as f64 / (1024.0 * 1024.0))
    } else if kib >= 1024 {
        format!("{:.1} MB", kib as f64 / 1024.0)
    } else {
        format!("{kib} KB")
    }
}

/// Runs the administrative interface. `args` excludes the program
/// name.
pub fn run(args: &[String]) -> i32 {
    let argv: Vec<String> = std::iter::once("ccache".to_string())
        .chain(args.iter().cloned())
        .collect();
    let cli = AdminCli::parse_from(argv);

    let cfg = match ccache_config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ccache: {e}");
            return 1;
        }
    };
    let cache_dir = &cfg.cache_dir;

    if let Some(files) = cli.max_files {
        if stats::set_limits(cache_dir, Some(files), None).is_err() {
            eprintln!("ccache: could not set cache file limit");
            return 1;
        }
        if files == 0 {
            println!("Unset cache file limit");
        } else {
            println!("Set cache file limit to {files}");
        }
    }

    if let Some(size) = &cli.max_size {
        let Some(kib) = parse_size_kib(size) else {
            eprintln!("ccache: invalid size: {size}");
            return 1;
        };
        if stats::set_limits(cache_dir, None, Some(kib)).is_err() {
            eprintln!("ccache: could not set cache size limit");
            return 1;
        }
        if kib == 0 {
            println!("Unset cache size limit");
        } else {
            println!("Set cache size limit to {}", format_size_kib(kib));
        }
    }

    if cli.zero_stats {
        if stats::zero_all(cache_dir).is_err() {
            eprintln!("ccache: could not zero statistics");
            return 1;
        }
        println!("Statistics cleared");
    }

    if cli.cleanup {
        match cleanup::cleanup_all(cache_dir) {
            Ok(_) => println!("Cleaned cache"),
            Err(e) => {
                eprintln!("ccache: cleanup failed: {e}");
                return 1;
            }
        }
    }

    if cli.clear {
        match cleanup::wipe_all(cache_dir) {
            Ok(()) => println!("Cleared cache"),
            Err(e) => {
                eprintln!("ccache: clear failed: {e}");
                return 1;
            }
        }
    }

    if cli.show_stats {
        print_stats(cache_dir);
    }

    0
}

fn print_stats(cache_dir: &std::path::Path) {
    let c = stats::summarize(cache_dir);
    println!("cache directory                     {}", cache_dir.display());

    let rows: &[(&str, Counter)] = &[
        ("cache hit (direct)", Counter::DirectCacheHit),
        ("cache hit (preprocessed)", Counter::PreprocessedCacheHit),
        ("cache miss", Counter::CacheMiss),
        ("called for link", Counter::CalledForLink),
        ("autoconf compile/link", Counter::AutoconfTest),
        ("multiple source files", Counter::MultipleSourceFiles),
        ("compiler produced stdout", Counter::CompilerProducedStdout),
        ("compiler produced no output", Counter::CompilerProducedNoOutput),
        ("compiler produced empty output", Counter::CompilerProducedEmptyOutput),
        ("compile failed", Counter::CompileFailed),
        ("ccache internal error", Counter::InternalError),
        ("preprocessor error", Counter::PreprocessorError),
        ("couldn't find the compiler", Counter::CouldNotFindCompiler),
        ("cache file missing", Counter::CacheFileMissing),
        ("bad compiler arguments", Counter::BadCompilerArguments),
        ("unsupported source language", Counter::UnsupportedSourceLanguage),
        ("unsupported compiler option", Counter::UnsupportedCompilerOption),
        ("output to stdout", Counter::OutputToStdout),
        ("output to a non-regular file", Counter::BadOutputFile),
        ("no input file", Counter::NoInputFile),
        ("error hashing extra file", Counter::BadExtraFile),
    ];
    for (label, counter) in rows {
        if c[*counter] > 0 {
            println!("{label:<36}{}", c[*counter]);
        }
    }

    println!("{:<36}{}", "files in cache", c[Counter::FilesInCache]);
    println!(
        "{:<36}{}",
        "cache size",
        format_size_kib(c[Counter::CacheSizeKib])
    );
    if c[Counter::MaxFiles] > 0 {
        println!("{:<36}{}", "max files", c[Counter::MaxFiles]);
    }
    if c[Counter::MaxSizeKib] > 0 {
        println!(
            "{:<36}{}",
            "max cache size",
            format_size_kib(c[Counter::MaxSizeKib])
        );
    }
}

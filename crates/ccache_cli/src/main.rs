//! ccache — a fast C/C++ compiler cache.
//!
//! Invoked one of three ways: masqueraded (argv[0] is a compiler-named
//! symlink pointing here), wrapped (`ccache gcc -c foo.c`), or as an
//! administrative tool (`ccache -s`). The first two cache a single
//! compilation; the third manages the cache itself.

mod admin;
mod compile;
mod driver;

use std::fs;
use std::path::Path;
use std::process::exit;
use std::sync::Arc;

use tracing::debug;

use ccache_common::paths::basename;
use ccache_config::Config;

const USAGE: &str = "\
Usage:
    ccache [options]
    ccache compiler [compiler options]
    compiler [compiler options]          (via symbolic link)

Run `ccache --help` for the list of options.
";

/// Contents of the cache directory marker, per the CACHEDIR.TAG
/// convention.
const CACHEDIR_TAG: &str = "\
Signature: 8a477f597d28d172789f06886806bc55
# This file is a cache directory tag created by ccache.
# For information about cache directory tags, see:
#\thttp://www.brynosaurus.com/cachedir/
";

fn main() {
    // Paths in argv are echoed back byte-identically through String;
    // lossy conversion only matters for non-UTF-8 argv, which the
    // compilers themselves reject anyway.
    let argv: Vec<String> = std::env::args_os()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    if argv.is_empty() {
        exit(1);
    }

    if basename(&argv[0]) == driver::MYNAME {
        if argv.len() < 2 {
            eprint!("{USAGE}");
            exit(1);
        }
        if argv[1].starts_with('-') {
            exit(admin::run(&argv[1..]));
        }
    }

    let cfg = match ccache_config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ccache: {e}");
            exit(1);
        }
    };

    if let Some(mask) = cfg.umask {
        // SAFETY: umask is async-signal-safe and we are single-threaded
        // this early.
        unsafe {
            libc::umask(mask as libc::mode_t);
        }
    }

    init_logging(&cfg);
    debug!(cwd = ?std::env::current_dir().ok(), "ccache started");

    if let Err(e) = fs::create_dir_all(&cfg.cache_dir) {
        eprintln!("ccache: failed to create {} ({e})", cfg.cache_dir.display());
        exit(1);
    }
    if let Err(e) = fs::create_dir_all(&cfg.temp_dir) {
        eprintln!("ccache: failed to create {} ({e})", cfg.temp_dir.display());
        exit(1);
    }
    if !cfg.read_only {
        if let Err(e) = create_cachedir_tag(&cfg.cache_dir) {
            eprintln!(
                "ccache: failed to create {}/CACHEDIR.TAG ({e})",
                cfg.cache_dir.display()
            );
            exit(1);
        }
    }

    setup_uncached_err();

    driver::run(argv, cfg);
}

/// Routes the debug log to CCACHE_LOGFILE when set; otherwise logging
/// stays off. The wrapper must never write diagnostics to the user's
/// terminal.
fn init_logging(cfg: &Config) {
    let Some(log_file) = &cfg.log_file else {
        return;
    };
    let Ok(file) = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
    else {
        return;
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_target(false)
        .with_writer(Arc::new(file))
        .try_init();
}

/// Marks the cache directory per the CACHEDIR.TAG convention so backup
/// tools skip it.
fn create_cachedir_tag(cache_dir: &Path) -> std::io::Result<()> {
    let path = cache_dir.join("CACHEDIR.TAG");
    if path.exists() {
        return Ok(());
    }
    fs::write(path, CACHEDIR_TAG)
}

/// Publishes a duplicate of stderr as UNCACHED_ERR_FD, so tools layered
/// under us (distcc and friends) can report errors without them being
/// captured into the cache.
fn setup_uncached_err() {
    // SAFETY: dup(2) on a valid fd.
    let fd = unsafe { libc::dup(2) };
    if fd == -1 {
        debug!("dup(2) failed");
        return;
    }
    std::env::set_var("UNCACHED_ERR_FD", fd.to_string());
}

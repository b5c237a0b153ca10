//! The compile driver.
//!
//! Sequences one cached compilation: resolve the real compiler, classify
//! the arguments, try the direct (manifest) lookup, then the
//! preprocessor lookup, and only then run the real compiler and store
//! its outputs. Every internal failure funnels into [`Context::failed`],
//! which replaces this process with the real compiler so the user never
//! observes the cache at all.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::SystemTime;

use tracing::debug;

use ccache_args::{hash_args, process_args, Bypass, HashArg, ProcessedArgs};
use ccache_cache::scan::{
    self, hash_source_file, scan_preprocessed, ScanParams, SourceHashOutcome,
};
use ccache_cache::stats::{self, Counter};
use ccache_cache::store::{self, CacheStore};
use ccache_cache::{manifest, unify, IncludeSet};
use ccache_common::paths::{basename, current_dir_preferring_pwd, find_executable, tmp_string};
use ccache_common::{FileHash, Hasher};
use ccache_config::{CompilerCheck, Config};

use crate::compile;

/// The wrapper's own name; used to detect masquerading and recursion.
pub const MYNAME: &str = "ccache";

/// Version tag mixed into every hash. Bump whenever the hash
/// composition or an on-disk format changes incompatibly (the `R1`
/// suffix marks this implementation's unify canonicalization).
const HASH_PREFIX: &str = "3R1";

/// Which lookup produced the result being materialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FromCacheMode {
    /// Hit decided from the manifest, without running the preprocessor.
    Direct,
    /// Hit decided from the preprocessor output.
    Cpp,
    /// The real compiler just ran; materialize what it produced.
    Compiled,
}

/// Cache locations of one result's sibling artifacts.
#[derive(Clone, Debug)]
struct CachedResult {
    hash: FileHash,
    obj: PathBuf,
    stderr: PathBuf,
    dep: PathBuf,
    stats: PathBuf,
}

/// Per-compile state. The configuration is immutable; everything the
/// compile discovers or creates along the way lives here.
struct Context {
    cfg: Config,
    cwd: PathBuf,
    store: CacheStore,
    /// Original argv with the resolved compiler as element 0; what the
    /// fallback execs.
    orig_args: Vec<String>,
    args: ProcessedArgs,
    /// Direct mode can be demoted at several points after
    /// classification.
    enable_direct: bool,
    enable_unify: bool,
    time_of_compilation: SystemTime,
    /// Includes collected by the scanner, for the manifest update.
    included: Option<IncludeSet>,
    /// The preprocessor output being compiled, if any.
    i_tmpfile: Option<PathBuf>,
    /// Whether `i_tmpfile` is ours to delete (false when the input was
    /// already preprocessed).
    owns_i_tmpfile: bool,
    /// Captured preprocessor stderr, replayed before the compiler's
    /// own.
    cpp_stderr: Option<PathBuf>,
    cached: Option<CachedResult>,
    manifest_path: Option<PathBuf>,
}

/// Runs one wrapped compilation. Never returns: every path ends in an
/// exit or an exec of the real compiler.
pub fn run(argv: Vec<String>, cfg: Config) -> ! {
    let cwd = match current_dir_preferring_pwd() {
        Ok(cwd) => cwd,
        Err(e) => fatal(&format!("could not determine working directory: {e}")),
    };

    let orig_args = find_compiler(argv, &cfg);

    if cfg.disabled {
        debug!("cache is disabled");
        fallback_exec(&cfg, orig_args);
    }

    let args = match process_args(&orig_args, &cfg, &cwd) {
        Ok(args) => args,
        Err(bypass) => {
            debug!(reason = %bypass, "cannot cache this invocation");
            stats::bump(&cfg.cache_dir.join("stats"), counter_for_bypass(&bypass));
            fallback_exec(&cfg, orig_args);
        }
    };

    debug!(source = %args.input_file, object = %args.output_obj, "classified");
    if args.generating_dependencies {
        debug!(dep = ?args.output_dep, "generating dependencies");
    }

    let enable_direct = cfg.enable_direct && !args.disable_direct;
    let enable_unify = cfg.enable_unify && !args.disable_unify;

    let mut ctx = Context {
        store: CacheStore::new(cfg.cache_dir.clone(), cfg.nlevels),
        cfg,
        cwd,
        orig_args,
        args,
        enable_direct,
        enable_unify,
        time_of_compilation: SystemTime::now(),
        included: None,
        i_tmpfile: None,
        owns_i_tmpfile: false,
        cpp_stderr: None,
        cached: None,
        manifest_path: None,
    };
    let code = ctx.compile();
    exit(code);
}

/// Resolves the real compiler, returning argv with it as element 0.
///
/// Wrapped invocations (`ccache gcc ...`) consume the wrapper name; a
/// compiler word containing a path separator is taken as-is, anything
/// else is searched on PATH, skipping the wrapper itself. Finding our
/// own path again means a recursive masquerade misconfiguration.
fn find_compiler(argv: Vec<String>, cfg: &Config) -> Vec<String> {
    let invoked_as = argv[0].clone();
    let mut args = argv;

    let mut name = basename(&args[0]).to_string();
    if name == MYNAME {
        args.remove(0);
        if args[0].contains('/') {
            // An explicit compiler path; take it as-is.
            return args;
        }
        name = basename(&args[0]).to_string();
    }

    if let Some(cc) = &cfg.compiler {
        name = cc.clone();
    }

    let compiler = match find_executable(&name, MYNAME) {
        Some(path) => path,
        None => {
            stats::bump(&cfg.cache_dir.join("stats"), Counter::CouldNotFindCompiler);
            fatal(&format!("could not find compiler \"{name}\" in PATH"));
        }
    };
    let compiler = compiler.to_string_lossy().into_owned();
    if compiler == invoked_as {
        fatal(&format!(
            "recursive invocation (the name of the ccache binary must be \"{MYNAME}\")"
        ));
    }
    args[0] = compiler;
    args
}

fn counter_for_bypass(bypass: &Bypass) -> Counter {
    match bypass {
        Bypass::UnsupportedOption(_) => Counter::UnsupportedCompilerOption,
        Bypass::MissingArgument(_) => Counter::BadCompilerArguments,
        Bypass::MultipleInputFiles(..) => Counter::MultipleSourceFiles,
        Bypass::CalledForLink { conftest: true } => Counter::AutoconfTest,
        Bypass::CalledForLink { conftest: false } => Counter::CalledForLink,
        Bypass::UnsupportedLanguage(_) => Counter::UnsupportedSourceLanguage,
        Bypass::NoInputFile => Counter::NoInputFile,
        Bypass::OutputToStdout => Counter::OutputToStdout,
        Bypass::OutputNotRegular(_) => Counter::BadOutputFile,
        Bypass::BadObjectName(_) => Counter::BadCompilerArguments,
    }
}

/// A misconfiguration the cache cannot paper over.
fn fatal(message: &str) -> ! {
    eprintln!("ccache: {message}");
    exit(1);
}

/// Execs the real compiler with the original arguments (minus our own
/// `--ccache-` options), prefixed with CCACHE_PREFIX when set.
fn fallback_exec(cfg: &Config, orig_args: Vec<String>) -> ! {
    let mut args: Vec<String> = orig_args
        .into_iter()
        .filter(|a| !a.starts_with("--ccache-"))
        .collect();

    if let Some(prefix) = &cfg.prefix_command {
        match find_executable(prefix, MYNAME) {
            Some(path) => args.insert(0, path.to_string_lossy().into_owned()),
            None => fatal(&format!("{prefix}: not found")),
        }
    }

    debug!("falling back to running the real compiler");
    compile::exec_fallback(&args);
}

/// What the direct lookup concluded.
enum DirectOutcome {
    /// The manifest produced an object hash.
    Found(FileHash),
    /// No manifest, or no entry matched.
    NotFound,
    /// The source itself cannot be trusted (time macros); direct mode
    /// is off for this compile.
    Demoted,
}

impl Context {
    fn compile(&mut self) -> i32 {
        let mut common = Hasher::new();
        self.calculate_common_hash(&mut common);

        let mut put_object_in_manifest = false;
        let mut manifest_hit: Option<FileHash> = None;

        if self.enable_direct {
            debug!("trying direct lookup");
            let mut direct = common.clone();
            match self.calculate_direct_hash(&mut direct) {
                DirectOutcome::Found(object_hash) => {
                    self.set_cached_result(object_hash);
                    if let Some(code) = self.from_cache(FromCacheMode::Direct, false) {
                        return code;
                    }
                    // The manifest knew the object but the artifacts
                    // were unusable; no point re-adding the entry.
                    manifest_hit = Some(object_hash);
                }
                DirectOutcome::NotFound => put_object_in_manifest = true,
                DirectOutcome::Demoted => {}
            }
        }

        debug!("running preprocessor");
        let mut cpp = common.clone();
        let object_hash = self.object_hash_from_cpp(&mut cpp);
        self.set_cached_result(object_hash);

        if let Some(from_manifest) = manifest_hit {
            if from_manifest != object_hash {
                // The likeliest cause is a different base directory; a
                // stale manifest would keep materializing the wrong
                // object, so drop it.
                debug!("manifest hash does not match preprocessor output; removing manifest");
                if let Some(path) = &self.manifest_path {
                    let _ = fs::remove_file(path);
                }
                put_object_in_manifest = true;
            }
        }

        if let Some(code) = self.from_cache(FromCacheMode::Cpp, put_object_in_manifest) {
            return code;
        }

        if self.cfg.read_only {
            debug!("read-only mode; running real compiler");
            self.failed();
        }

        let mut compiler_args = self.args.compiler_args.clone();
        if let Some(prefix) = &self.cfg.prefix_command {
            match find_executable(prefix, MYNAME) {
                Some(path) => {
                    debug!(prefix = %path.display(), "using command-line prefix");
                    compiler_args.insert(0, path.to_string_lossy().into_owned());
                }
                None => fatal(&format!("{prefix}: not found")),
            }
        }

        self.to_cache(&compiler_args);

        if let Some(code) = self.from_cache(FromCacheMode::Compiled, put_object_in_manifest) {
            return code;
        }

        debug!("freshly stored result could not be materialized");
        self.bump(Counter::InternalError);
        self.failed();
    }

    /// Mixes in everything shared by the direct and preprocessor
    /// hashes: version tag, intermediate extension, compiler identity,
    /// optionally the working directory, and the extra files.
    fn calculate_common_hash(&mut self, hash: &mut Hasher) {
        hash.update_str(HASH_PREFIX);

        hash.delimiter("ext");
        hash.update_str(&self.args.i_extension);

        let compiler = self.orig_args[0].clone();
        let meta = match fs::metadata(&compiler) {
            Ok(meta) => meta,
            Err(e) => {
                debug!(compiler = %compiler, error = %e, "could not stat the compiler");
                self.bump_root(Counter::CouldNotFindCompiler);
                self.failed();
            }
        };

        match self.cfg.compiler_check {
            CompilerCheck::None => {}
            CompilerCheck::Content => {
                hash.delimiter("cc_content");
                if hash.update_file(Path::new(&compiler)).is_err() {
                    self.bump_root(Counter::CouldNotFindCompiler);
                    self.failed();
                }
            }
            CompilerCheck::Mtime => {
                hash.delimiter("cc_mtime");
                hash.update_u64(meta.len());
                hash.update_u64(mtime_seconds(&meta));
            }
        }

        // Some compilers are hardlink farms (cc/gcc/g++) and behave
        // differently depending on the invoked name.
        hash.delimiter("cc_name");
        hash.update_str(basename(&compiler));

        if self.cfg.hash_dir {
            hash.delimiter("cwd");
            hash.update_str(&self.cwd.to_string_lossy());
        }

        for extra in self.cfg.extra_files_to_hash.clone() {
            debug!(file = %extra.display(), "hashing extra file");
            hash.delimiter("extrafile");
            if hash.update_file(&extra).is_err() {
                self.bump_root(Counter::BadExtraFile);
                self.failed();
            }
        }
    }

    /// Mixes the hash-participating argument tokens into `hash`.
    fn hash_argument_list(&mut self, hash: &mut Hasher, direct_mode: bool) {
        let args = self.args.preprocessor_args.clone();
        for item in hash_args(&args, direct_mode) {
            match item {
                HashArg::Verbatim(token) => {
                    hash.delimiter("arg");
                    hash.update_str(token);
                }
                HashArg::SpecsFile(path) => {
                    hash.delimiter("specs");
                    if hash.update_file(Path::new(path)).is_err() {
                        self.failed();
                    }
                }
            }
        }
    }

    /// Completes the direct hash and consults the manifest it names.
    fn calculate_direct_hash(&mut self, hash: &mut Hasher) -> DirectOutcome {
        self.hash_argument_list(hash, true);

        if !self.cfg.sloppiness.file_macro {
            // The source may use __FILE__, so the file name is part of
            // the identity unless the user opted out.
            hash.delimiter("inputfile");
            hash.update_str(&self.args.input_file);
        }

        hash.delimiter("sourcecode");
        let input_file = self.args.input_file.clone();
        match hash_source_file(
            hash,
            Path::new(&input_file),
            self.cfg.sloppiness.time_macros,
        ) {
            Err(e) => {
                debug!(source = %input_file, error = %e, "failed to hash source file");
                self.failed();
            }
            Ok(SourceHashOutcome::TimeMacroFound) => {
                debug!("source file uses __TIME__ or __DATE__; disabling direct mode");
                self.enable_direct = false;
                return DirectOutcome::Demoted;
            }
            Ok(SourceHashOutcome::Clean) => {}
        }

        let manifest_name = hash.finish();
        let manifest_path = match self.store.object_path(&manifest_name, ".manifest") {
            Ok(path) => path,
            Err(e) => {
                debug!(error = %e, "could not derive manifest path");
                self.failed();
            }
        };
        debug!(manifest = %manifest_path.display(), "looking for object hash in manifest");

        let sloppy_time = self.cfg.sloppiness.time_macros;
        let result = manifest::get(&manifest_path, |include_path| {
            let data = fs::read(include_path).ok()?;
            let mut h = Hasher::new();
            match scan::hash_source_bytes(&mut h, &data, sloppy_time) {
                SourceHashOutcome::Clean => Some(h.finish()),
                SourceHashOutcome::TimeMacroFound => None,
            }
        });
        self.manifest_path = Some(manifest_path);

        match result {
            Some(object_hash) => {
                debug!("got object file hash from manifest");
                DirectOutcome::Found(object_hash)
            }
            None => {
                debug!("did not find object file hash in manifest");
                DirectOutcome::NotFound
            }
        }
    }

    /// Runs the preprocessor (or adopts an already-preprocessed input)
    /// and completes the preprocessor-mode hash.
    fn object_hash_from_cpp(&mut self, hash: &mut Hasher) -> FileHash {
        self.hash_argument_list(hash, false);

        self.time_of_compilation = SystemTime::now();

        let (path_stdout, path_stderr, owns_stdout) = if self.args.direct_i_file {
            // Already preprocessed: the input is its own preprocessor
            // output and there is no preprocessor stderr.
            let path_stderr = self
                .cfg
                .temp_dir
                .join(format!("tmp.cpp_stderr.{}", tmp_string()));
            if fs::write(&path_stderr, b"").is_err() {
                self.bump_root(Counter::InternalError);
                self.failed();
            }
            (PathBuf::from(&self.args.input_file), path_stderr, false)
        } else {
            // Keep the temp name short: some filesystems have tight
            // name limits.
            let mut base = basename(&self.args.input_file)
                .split('.')
                .next()
                .unwrap_or("src")
                .to_string();
            base.truncate(10);
            let path_stdout = self.cfg.temp_dir.join(format!(
                "{base}.tmp.{}.{}",
                tmp_string(),
                self.args.i_extension
            ));
            let path_stderr = self
                .cfg
                .temp_dir
                .join(format!("tmp.cpp_stderr.{}", tmp_string()));

            let mut cpp_args = self.args.preprocessor_args.clone();
            cpp_args.push("-E".to_string());
            cpp_args.push(self.args.input_file.clone());
            let status = match compile::execute(&cpp_args, &path_stdout, &path_stderr) {
                Ok(status) => status,
                Err(e) => {
                    debug!(error = %e, "failed to run preprocessor");
                    self.bump_root(Counter::PreprocessorError);
                    self.failed();
                }
            };
            if status != 0 {
                debug!(status, "preprocessor gave nonzero exit status");
                let _ = fs::remove_file(&path_stdout);
                let _ = fs::remove_file(&path_stderr);
                self.bump_root(Counter::PreprocessorError);
                self.failed();
            }
            (path_stdout, path_stderr, true)
        };

        if self.enable_unify {
            // The input file name is folded in to keep warnings (which
            // embed it) correct across renames.
            hash.delimiter("unifyfilename");
            hash.update_str(&self.args.input_file);

            hash.delimiter("unifycpp");
            if let Err(e) = unify::unify_hash(hash, &path_stdout) {
                debug!(error = %e, "failed to unify preprocessor output");
                let _ = fs::remove_file(&path_stderr);
                self.bump_root(Counter::InternalError);
                self.failed();
            }
        } else {
            hash.delimiter("cpp");
            let params = ScanParams {
                cwd: &self.cwd,
                base_dir: self.cfg.base_dir.as_deref(),
                input_file: &self.args.input_file,
                time_of_compilation: self.time_of_compilation,
                sloppiness: self.cfg.sloppiness,
                collect_includes: self.enable_direct,
            };
            match scan_preprocessed(hash, &path_stdout, &params) {
                Ok(Some(includes)) => self.included = Some(includes),
                Ok(None) => {
                    if self.enable_direct {
                        debug!("disabling direct mode");
                        self.enable_direct = false;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "failed to process preprocessed output");
                    let _ = fs::remove_file(&path_stderr);
                    self.bump_root(Counter::InternalError);
                    self.failed();
                }
            }
        }

        hash.delimiter("cppstderr");
        if hash.update_file(&path_stderr).is_err() {
            fatal(&format!("failed to open {}", path_stderr.display()));
        }

        self.i_tmpfile = Some(path_stdout);
        self.owns_i_tmpfile = owns_stdout;

        if self.args.compile_preprocessed {
            // Replayed just before the compiler's own stderr so the
            // user sees the same messages in the same order.
            self.cpp_stderr = Some(path_stderr);
        } else {
            let _ = fs::remove_file(&path_stderr);
        }

        hash.finish()
    }

    /// Derives the cache paths of the result named by `object_hash`.
    fn set_cached_result(&mut self, object_hash: FileHash) {
        let paths = (|| {
            let obj = self.store.object_path(&object_hash, ".o")?;
            let stderr = self.store.object_path(&object_hash, ".stderr")?;
            let dep = self.store.object_path(&object_hash, ".d")?;
            Ok::<_, ccache_cache::CacheError>((obj, stderr, dep))
        })();
        match paths {
            Ok((obj, stderr, dep)) => {
                self.cached = Some(CachedResult {
                    hash: object_hash,
                    obj,
                    stderr,
                    dep,
                    stats: self.store.stats_file_for(&object_hash),
                });
            }
            Err(e) => {
                debug!(error = %e, "could not create cache directories");
                self.failed();
            }
        }
    }

    /// Tries to finish the compilation from the cache. Returns the exit
    /// code on success; `None` means "keep going" (genuine miss).
    fn from_cache(&mut self, mode: FromCacheMode, put_in_manifest: bool) -> Option<i32> {
        // The user might be forcing misses.
        if mode != FromCacheMode::Compiled && self.cfg.recache {
            return None;
        }

        let cached = self.cached.clone().expect("cached result paths are set");

        if !cached.obj.exists() {
            debug!(object = %cached.obj.display(), "object file not in cache");
            return None;
        }

        // In direct mode the dependency file must come from the cache;
        // in the other modes the preprocessor run already wrote it.
        let produce_dep_file =
            self.args.generating_dependencies && mode == FromCacheMode::Direct;
        if produce_dep_file && !cached.dep.exists() {
            debug!(dep = %cached.dep.display(), "dependency file missing in cache");
            return None;
        }

        if self.args.output_obj != "/dev/null" {
            match self.store.materialize(
                &cached.obj,
                Path::new(&self.args.output_obj),
                self.cfg.hard_link,
            ) {
                Ok(()) => {
                    debug!(object = %self.args.output_obj, "created object from cache")
                }
                Err(e) if e.is_missing() => {
                    // Removed between stat and open, presumably by
                    // cleanup. Drop the rest of the result set so the
                    // recompile starts clean.
                    debug!(object = %cached.obj.display(), "object just disappeared from cache");
                    stats::bump(&cached.stats, Counter::CacheFileMissing);
                    self.remove_result_set(&cached);
                    return None;
                }
                Err(e) => {
                    debug!(error = %e, "failed to materialize object");
                    stats::bump(&cached.stats, Counter::InternalError);
                    self.failed();
                }
            }
        }

        if produce_dep_file {
            let output_dep = self
                .args
                .output_dep
                .clone()
                .expect("generating_dependencies implies a dep path");
            match self
                .store
                .materialize(&cached.dep, Path::new(&output_dep), self.cfg.hard_link)
            {
                Ok(()) => debug!(dep = %output_dep, "created dependency file from cache"),
                Err(e) if e.is_missing() => {
                    debug!("dependency file just disappeared from cache");
                    stats::bump(&cached.stats, Counter::CacheFileMissing);
                    let _ = fs::remove_file(&self.args.output_obj);
                    let _ = fs::remove_file(&output_dep);
                    self.remove_result_set(&cached);
                    return None;
                }
                Err(e) => {
                    debug!(error = %e, "failed to materialize dependency file");
                    stats::bump(&cached.stats, Counter::InternalError);
                    self.failed();
                }
            }
        }

        // Fresh mtimes keep these files ahead of LRU cleanup, and give
        // hardlinked outputs a sensible timestamp.
        store::refresh_mtime(&cached.obj);
        store::refresh_mtime(&cached.stderr);
        if produce_dep_file {
            store::refresh_mtime(&cached.dep);
        }

        if self.args.generating_dependencies && mode != FromCacheMode::Direct {
            self.store_dep_file(&cached);
        }

        self.drop_i_tmpfile();
        self.drop_cpp_stderr();

        // Replay the captured stderr (compressed or not); absence just
        // means the compile was quiet.
        let stderr = std::io::stderr();
        let _ = self.store.cat_to(&cached.stderr, &mut stderr.lock());

        if self.enable_direct && put_in_manifest && !self.cfg.read_only {
            self.update_manifest(&cached);
        }

        match mode {
            FromCacheMode::Direct => {
                debug!("succeeded getting cached result (direct)");
                stats::bump(&cached.stats, Counter::DirectCacheHit);
            }
            FromCacheMode::Cpp => {
                debug!("succeeded getting cached result (preprocessed)");
                stats::bump(&cached.stats, Counter::PreprocessedCacheHit);
            }
            // Counted as a miss when the result was stored.
            FromCacheMode::Compiled => {}
        }

        Some(0)
    }

    /// Stores the dependency file the preprocessor wrote into the
    /// cache. Best effort: a failure here costs a future direct hit,
    /// nothing else.
    fn store_dep_file(&self, cached: &CachedResult) {
        let Some(output_dep) = &self.args.output_dep else {
            return;
        };
        match self
            .store
            .copy_into_cache(Path::new(output_dep), &cached.dep, self.cfg.enable_compression)
        {
            Ok(()) => {
                debug!(dep = %cached.dep.display(), "stored in cache");
                let kib = fs::metadata(&cached.dep).map(|m| m.len() / 1024).unwrap_or(0);
                stats::add_size(&cached.stats, 1, kib);
            }
            Err(e) => {
                debug!(error = %e, "failed to store dependency file");
            }
        }
    }

    /// Adds the (include set → object) association to the manifest.
    fn update_manifest(&self, cached: &CachedResult) {
        let (Some(manifest_path), Some(included)) = (&self.manifest_path, &self.included)
        else {
            return;
        };
        let old_kib = fs::metadata(manifest_path).map(|m| m.len() / 1024).ok();
        if manifest::put(manifest_path, cached.hash, included) {
            debug!(manifest = %manifest_path.display(), "added object file hash to manifest");
            store::refresh_mtime(manifest_path);
            let new_kib = fs::metadata(manifest_path).map(|m| m.len() / 1024).unwrap_or(0);
            match old_kib {
                Some(old) => stats::add_size(&cached.stats, 0, new_kib.saturating_sub(old)),
                None => stats::add_size(&cached.stats, 1, new_kib),
            }
        } else {
            debug!(manifest = %manifest_path.display(), "failed to add object file hash to manifest");
        }
    }

    /// Runs the real compiler and stages its outputs into the cache.
    /// Returns only when the result set is stored; a failing compile
    /// exits with the compiler's status.
    fn to_cache(&mut self, compiler_args: &[String]) {
        let cached = self.cached.clone().expect("cached result paths are set");

        let tmp_stdout = path_with_suffix(&cached.obj, &format!(".tmp.stdout.{}", tmp_string()));
        let tmp_stderr = path_with_suffix(&cached.obj, &format!(".tmp.stderr.{}", tmp_string()));
        let tmp_obj = path_with_suffix(&cached.obj, &format!(".tmp.{}", tmp_string()));

        let mut args = compiler_args.to_vec();
        args.push("-o".to_string());
        args.push(tmp_obj.to_string_lossy().into_owned());
        if self.args.compile_preprocessed {
            let i_tmpfile = self.i_tmpfile.clone().expect("preprocessor output exists");
            args.push(i_tmpfile.to_string_lossy().into_owned());
        } else {
            args.push(self.args.input_file.clone());
        }

        debug!("running real compiler");
        let status = match compile::execute(&args, &tmp_stdout, &tmp_stderr) {
            Ok(status) => status,
            Err(e) => {
                debug!(error = %e, "failed to run the real compiler");
                self.bump(Counter::InternalError);
                self.failed();
            }
        };

        // A compiler writing to stdout would collide with whatever the
        // build system does with it; don't cache such a thing.
        if fs::metadata(&tmp_stdout).map(|m| m.len()).unwrap_or(1) != 0 {
            debug!("compiler produced stdout");
            self.bump(Counter::CompilerProducedStdout);
            remove_all(&[&tmp_stdout, &tmp_stderr, &tmp_obj]);
            self.failed();
        }
        let _ = fs::remove_file(&tmp_stdout);

        if let Some(cpp_stderr) = self.cpp_stderr.take() {
            // Merge preprocessor stderr ahead of the compiler's so the
            // cached transcript matches an uncached compile.
            if let Err(e) = prepend_file(&cpp_stderr, &tmp_stderr) {
                debug!(error = %e, "failed to merge preprocessor stderr");
                self.bump(Counter::InternalError);
                remove_all(&[&tmp_stderr, &tmp_obj]);
                self.failed();
            }
            let _ = fs::remove_file(&cpp_stderr);
        }

        if status != 0 {
            debug!(status, "compiler gave nonzero exit status");
            self.bump(Counter::CompileFailed);

            // Put whatever the compiler produced where it was asked to
            // go, pass its stderr through, and mirror its exit code.
            let obj_in_place = self.args.output_obj == "/dev/null"
                || move_file(&tmp_obj, Path::new(&self.args.output_obj));
            if obj_in_place {
                if let Ok(data) = fs::read(&tmp_stderr) {
                    let _ = std::io::stderr().write_all(&data);
                }
                let _ = fs::remove_file(&tmp_stderr);
                self.drop_i_tmpfile();
                exit(status);
            }
            remove_all(&[&tmp_stderr, &tmp_obj]);
            self.failed();
        }

        let obj_meta = match fs::metadata(&tmp_obj) {
            Ok(meta) => meta,
            Err(_) => {
                debug!("compiler did not produce an object file");
                self.bump(Counter::CompilerProducedNoOutput);
                let _ = fs::remove_file(&tmp_stderr);
                self.failed();
            }
        };
        if obj_meta.len() == 0 {
            debug!("compiler produced an empty object file");
            self.bump(Counter::CompilerProducedEmptyOutput);
            remove_all(&[&tmp_stderr, &tmp_obj]);
            self.failed();
        }

        let mut added_files = 0u64;
        let mut added_kib = 0u64;

        let stderr_len = fs::metadata(&tmp_stderr).map(|m| m.len()).unwrap_or(0);
        if stderr_len > 0 {
            if let Err(e) =
                self.store
                    .stage_file(&tmp_stderr, &cached.stderr, self.cfg.enable_compression)
            {
                debug!(error = %e, "failed to store stderr in cache");
                self.bump(Counter::InternalError);
                let _ = fs::remove_file(&tmp_obj);
                self.failed();
            }
            debug!(file = %cached.stderr.display(), "stored in cache");
            added_files += 1;
            added_kib += fs::metadata(&cached.stderr).map(|m| m.len() / 1024).unwrap_or(0);
        } else {
            let _ = fs::remove_file(&tmp_stderr);
        }

        if let Err(e) = self
            .store
            .stage_file(&tmp_obj, &cached.obj, self.cfg.enable_compression)
        {
            debug!(error = %e, "failed to store object in cache");
            self.bump(Counter::InternalError);
            self.failed();
        }
        debug!(file = %cached.obj.display(), "stored in cache");
        added_files += 1;
        added_kib += fs::metadata(&cached.obj).map(|m| m.len() / 1024).unwrap_or(0);

        stats::bump(&cached.stats, Counter::CacheMiss);
        stats::add_size(&cached.stats, added_files, added_kib);
    }

    /// Deletes every artifact of a result set, forcing a clean
    /// recompile after partial damage.
    fn remove_result_set(&self, cached: &CachedResult) {
        let _ = fs::remove_file(&self.args.output_obj);
        remove_all(&[&cached.obj, &cached.stderr, &cached.dep]);
    }

    fn drop_i_tmpfile(&mut self) {
        if let Some(path) = self.i_tmpfile.take() {
            if self.owns_i_tmpfile {
                let _ = fs::remove_file(path);
            }
        }
    }

    fn drop_cpp_stderr(&mut self) {
        if let Some(path) = self.cpp_stderr.take() {
            let _ = fs::remove_file(path);
        }
    }

    /// Bumps a counter in the bucket of the current result, or at the
    /// cache root when no result is known yet.
    fn bump(&self, counter: Counter) {
        match &self.cached {
            Some(cached) => stats::bump(&cached.stats, counter),
            None => self.bump_root(counter),
        }
    }

    fn bump_root(&self, counter: Counter) {
        stats::bump(&self.cfg.cache_dir.join("stats"), counter);
    }

    /// Something went wrong: clean up and become the real compiler.
    fn failed(&mut self) -> ! {
        self.drop_i_tmpfile();
        self.drop_cpp_stderr();
        fallback_exec(&self.cfg, std::mem::take(&mut self.orig_args));
    }
}

fn mtime_seconds(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `path` with `suffix` appended to its file name.
fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

/// Moves a file across filesystems if need be. A missing source counts
/// as success (there is nothing to place).
fn move_file(src: &Path, dst: &Path) -> bool {
    match fs::rename(src, dst) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(_) => match fs::copy(src, dst) {
            Ok(_) => {
                let _ = fs::remove_file(src);
                true
            }
            Err(_) => false,
        },
    }
}

/// Rewrites `target` as `prefix` followed by `target`'s old contents.
fn prepend_file(prefix: &Path, target: &Path) -> std::io::Result<()> {
    let mut merged = fs::read(prefix)?;
    merged.extend(fs::read(target)?);
    fs::write(target, merged)
}

fn remove_all<P: AsRef<Path>>(paths: &[P]) {
    for path in paths {
        let _ = fs::remove_file(path.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_with_suffix_appends() {
        let p = path_with_suffix(Path::new("/a/b/czzz.o"), ".tmp.1");
        assert_eq!(p, Path::new("/a/b/czzz.o.tmp.1"));
    }

    #[test]
    fn prepend_file_orders_contents() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        fs::write(&first, b"cpp warning\n").unwrap();
        fs::write(&second, b"cc1 warning\n").unwrap();

        prepend_file(&first, &second).unwrap();
        assert_eq!(
            fs::read_to_string(&second).unwrap(),
            "cpp warning\ncc1 warning\n"
        );
    }

    #[test]
    fn bypass_counters() {
        assert_eq!(
            counter_for_bypass(&Bypass::UnsupportedOption("-E".into())),
            Counter::UnsupportedCompilerOption
        );
        assert_eq!(
            counter_for_bypass(&Bypass::CalledForLink { conftest: true }),
            Counter::AutoconfTest
        );
        assert_eq!(
            counter_for_bypass(&Bypass::CalledForLink { conftest: false }),
            Counter::CalledForLink
        );
        assert_eq!(
            counter_for_bypass(&Bypass::NoInputFile),
            Counter::NoInputFile
        );
    }

    #[test]
    fn mtime_seconds_reasonable() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("x");
        fs::write(&f, b"x").unwrap();
        let secs = mtime_seconds(&fs::metadata(&f).unwrap());
        // After 2020, before 2100.
        assert!(secs > 1_577_836_800);
        assert!(secs < 4_102_444_800);
    }
}

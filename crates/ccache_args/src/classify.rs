//! The argument classifier.

use std::path::Path;

use ccache_common::lang;
use ccache_common::paths::{basename, make_relative_path};
use ccache_config::Config;

use crate::error::Bypass;

/// Options that are never cacheable.
const HARD_BYPASS: &[&str] = &[
    "--coverage",
    "-M",
    "-MM",
    "-fbranch-probabilities",
    "-fprofile-arcs",
    "-fprofile-generate",
    "-fprofile-use",
    "-ftest-coverage",
    "-save-temps",
];

/// Options whose path operand is rewritten relative to the base
/// directory, for better hit rates across checkouts.
const REWRITE_PATH_OPTS: &[&str] = &[
    "-I",
    "-idirafter",
    "-imacros",
    "-include",
    "-iprefix",
    "-isystem",
];

/// Options that take a separate operand and are otherwise forwarded
/// untouched.
const TAKES_ARG_OPTS: &[&str] = &[
    "--param",
    "-A",
    "-D",
    "-G",
    "-L",
    "-MF",
    "-MQ",
    "-MT",
    "-U",
    "-V",
    "-Xassembler",
    "-Xlinker",
    "-aux-info",
    "-b",
    "-iwithprefix",
    "-iwithprefixbefore",
    "-u",
];

/// Preprocessor-only options whose effect is fully captured by the
/// preprocessed output, so they are excluded from the hash in
/// preprocessor mode. The bool records whether the option consumes a
/// separate operand.
const CPP_MODE_HASH_SKIP: &[(&str, bool)] = &[
    ("-D", true),
    ("-I", true),
    ("-U", true),
    ("-idirafter", true),
    ("-imacros", true),
    ("-imultilib", true),
    ("-include", true),
    ("-iprefix", true),
    ("-iquote", true),
    ("-isysroot", true),
    ("-isystem", true),
    ("-iwithprefix", true),
    ("-iwithprefixbefore", true),
    ("-nostdinc", false),
    ("-nostdinc++", false),
];

/// The classifier's output: argument lists plus the cache-control flags
/// derived from them.
#[derive(Debug, Clone)]
pub struct ProcessedArgs {
    /// Arguments for the preprocessor run (`argv[0]` is the compiler;
    /// `-E` and the input file are appended by the driver).
    pub preprocessor_args: Vec<String>,
    /// Arguments for the real compile (`-o` and the input are appended
    /// by the driver).
    pub compiler_args: Vec<String>,
    /// The single input source file, rewritten relative to the base
    /// directory when possible.
    pub input_file: String,
    /// Where the object file must end up.
    pub output_obj: String,
    /// Where the dependency file must end up, when one is generated.
    pub output_dep: Option<String>,
    /// Whether the compiler was asked to emit make dependencies.
    pub generating_dependencies: bool,
    /// Whether the input is already preprocessor output (`.i`, `.ii`,
    /// ...), letting the driver skip the preprocessor run.
    pub direct_i_file: bool,
    /// Extension (without dot) of the intermediate preprocessed file.
    pub i_extension: String,
    /// The classifier saw an option that makes direct mode unsafe.
    pub disable_direct: bool,
    /// The classifier saw an option that makes unify hashing unsafe.
    pub disable_unify: bool,
    /// Whether the preprocessed source may be fed to the compile step
    /// (`-g3` forces a recompile from the original source to keep line
    /// numbers of command-line macros correct).
    pub compile_preprocessed: bool,
}

/// Classifies a compiler command line.
///
/// `argv[0]` must already be the resolved compiler. `cwd` is the logical
/// working directory used for base-directory rewriting.
pub fn process_args(argv: &[String], cfg: &Config, cwd: &Path) -> Result<ProcessedArgs, Bypass> {
    let base_dir = cfg.base_dir.as_deref();
    let relativize = |p: &str| make_relative_path(cwd, base_dir, p);

    let mut stripped: Vec<String> = vec![argv[0].clone()];
    let mut input_file: Option<String> = None;
    let mut output_obj: Option<String> = None;
    let mut output_dep: Option<String> = None;
    let mut explicit_language: Option<String> = None;
    let mut input_charset: Option<String> = None;
    let mut found_c = false;
    let mut found_s_opt = false;
    let mut found_arch = false;
    let mut generating_dependencies = false;
    let mut dep_file_specified = false;
    let mut dep_target_specified = false;
    let mut disable_direct = false;
    let mut disable_unify = false;
    let mut compile_preprocessed = cfg.compile_preprocessed_source_code;

    let mut i = 1;
    while i < argv.len() {
        let arg = argv[i].as_str();

        if arg == "-E" {
            return Err(Bypass::UnsupportedOption(arg.to_string()));
        }
        if arg.starts_with('@') || HARD_BYPASS.contains(&arg) {
            return Err(Bypass::UnsupportedOption(arg.to_string()));
        }

        // -Xpreprocessor can smuggle arbitrary options past us, which
        // direct mode would never see.
        if arg == "-Xpreprocessor" {
            disable_direct = true;
        }

        if arg == "-arch" {
            if found_arch {
                return Err(Bypass::UnsupportedOption("-arch (multiple)".to_string()));
            }
            found_arch = true;
        }

        if arg == "-c" {
            stripped.push(arg.to_string());
            found_c = true;
            i += 1;
            continue;
        }

        if arg == "-S" {
            stripped.push(arg.to_string());
            found_s_opt = true;
            i += 1;
            continue;
        }

        // The last -x before the input file wins; all -x options are
        // stripped and re-added explicitly where needed.
        if arg == "-x" {
            let lang = argv
                .get(i + 1)
                .ok_or_else(|| Bypass::MissingArgument(arg.to_string()))?;
            if input_file.is_none() {
                explicit_language = Some(lang.clone());
            }
            i += 2;
            continue;
        }
        if let Some(lang) = arg.strip_prefix("-x") {
            if input_file.is_none() {
                explicit_language = Some(lang.to_string());
            }
            i += 1;
            continue;
        }

        if arg == "-o" {
            let out = argv
                .get(i + 1)
                .ok_or_else(|| Bypass::MissingArgument(arg.to_string()))?;
            output_obj = Some(out.clone());
            i += 2;
            continue;
        }
        if let Some(out) = arg.strip_prefix("-o") {
            output_obj = Some(out.to_string());
            i += 1;
            continue;
        }

        if arg.starts_with("-g") {
            stripped.push(arg.to_string());
            if arg != "-g0" {
                disable_unify = true;
            }
            if arg == "-g3" {
                compile_preprocessed = false;
            }
            i += 1;
            continue;
        }

        // The user knows best: swallow the next token verbatim.
        if arg == "--ccache-skip" {
            let next = argv
                .get(i + 1)
                .ok_or_else(|| Bypass::MissingArgument(arg.to_string()))?;
            stripped.push(next.clone());
            i += 2;
            continue;
        }

        // Dependency-generation options are detected here but still
        // forwarded below; they behave differently under -E when no
        // output file is given, which is why the driver must know about
        // them.
        if arg == "-MD" || arg == "-MMD" {
            generating_dependencies = true;
        }
        if i + 1 < argv.len() {
            if arg == "-MF" {
                dep_file_specified = true;
                output_dep = Some(relativize(&argv[i + 1]));
            } else if arg == "-MQ" || arg == "-MT" {
                dep_target_specified = true;
            }
        }

        if let Some(rest) = arg.strip_prefix("-Wp,") {
            if let Some(file) = rest.strip_prefix("-MD,").filter(|f| !f.contains(',')) {
                generating_dependencies = true;
                dep_file_specified = true;
                output_dep = Some(relativize(file));
            } else if let Some(file) = rest.strip_prefix("-MMD,").filter(|f| !f.contains(',')) {
                generating_dependencies = true;
                dep_file_specified = true;
                output_dep = Some(relativize(file));
            } else {
                // -Wp, can pass anything to the preprocessor behind our
                // back.
                disable_direct = true;
            }
        }

        // Remembered and applied only to the preprocessor run; feeding
        // recoded source through the compiler again would convert twice.
        if arg.starts_with("-finput-charset=") {
            input_charset = Some(arg.to_string());
            i += 1;
            continue;
        }

        if REWRITE_PATH_OPTS.contains(&arg) {
            let path = argv
                .get(i + 1)
                .ok_or_else(|| Bypass::MissingArgument(arg.to_string()))?;
            stripped.push(arg.to_string());
            stripped.push(relativize(path));
            i += 2;
            continue;
        }
        if let Some(path) = arg.strip_prefix("-I").filter(|p| !p.is_empty()) {
            stripped.push(format!("-I{}", relativize(path)));
            i += 1;
            continue;
        }

        if TAKES_ARG_OPTS.contains(&arg) {
            let operand = argv
                .get(i + 1)
                .ok_or_else(|| Bypass::MissingArgument(arg.to_string()))?;
            stripped.push(arg.to_string());
            stripped.push(operand.clone());
            i += 2;
            continue;
        }

        if arg.starts_with('-') {
            stripped.push(arg.to_string());
            i += 1;
            continue;
        }

        // A non-option token that isn't a plain file is assumed to be an
        // option after all; this copes with unusual compiler flags.
        match std::fs::metadata(arg) {
            Ok(md) if md.is_file() => {}
            _ => {
                stripped.push(arg.to_string());
                i += 1;
                continue;
            }
        }

        if let Some(first) = &input_file {
            if lang::language_for_file(arg).is_some() {
                return Err(Bypass::MultipleInputFiles(first.clone(), arg.to_string()));
            } else if !found_c {
                return Err(Bypass::CalledForLink {
                    conftest: arg.contains("conftest."),
                });
            }
            return Err(Bypass::UnsupportedLanguage(arg.to_string()));
        }
        input_file = Some(relativize(arg));
        i += 1;
    }

    let input_file = input_file.ok_or(Bypass::NoInputFile)?;

    let explicit_language = explicit_language.filter(|l| l != "none");
    let file_language = lang::language_for_file(&input_file);
    let actual_language = match &explicit_language {
        Some(lang) => {
            if !lang::language_is_supported(lang) {
                return Err(Bypass::UnsupportedLanguage(lang.clone()));
            }
            lang.as_str()
        }
        None => file_language.ok_or_else(|| Bypass::UnsupportedLanguage(input_file.clone()))?,
    };

    let direct_i_file = lang::language_is_preprocessed(actual_language);

    let i_extension = match &cfg.extension_override {
        Some(ext) => ext.clone(),
        // The table has an entry for every supported language, checked
        // above.
        None => lang::extension_for_language(actual_language).unwrap()[1..].to_string(),
    };

    if !found_c {
        return Err(Bypass::CalledForLink {
            conftest: input_file.contains("conftest."),
        });
    }

    if output_obj.as_deref() == Some("-") {
        return Err(Bypass::OutputToStdout);
    }

    let output_obj = match output_obj {
        Some(obj) => obj,
        None => {
            let name = basename(&input_file);
            match name.rfind('.') {
                Some(pos) if pos + 1 < name.len() => {
                    let ext = if found_s_opt { "s" } else { "o" };
                    format!("{}.{ext}", &name[..pos])
                }
                _ => return Err(Bypass::BadObjectName(input_file)),
            }
        }
    };

    if generating_dependencies {
        if !dep_file_specified {
            let stem = match output_obj.rfind('.') {
                Some(pos) => &output_obj[..pos],
                None => output_obj.as_str(),
            };
            let default_dep = format!("{stem}.d");
            stripped.push("-MF".to_string());
            stripped.push(default_dep.clone());
            output_dep = Some(relativize(&default_dep));
        }
        if !dep_target_specified {
            stripped.push("-MT".to_string());
            stripped.push(output_obj.clone());
        }
    }

    if output_obj != "/dev/null" {
        if let Ok(md) = std::fs::metadata(&output_obj) {
            if !md.is_file() {
                return Err(Bypass::OutputNotRegular(output_obj));
            }
        }
    }

    // The preprocessor must see the charset and the explicit language;
    // the compile of preprocessed output must see neither (the language
    // of the intermediate file is named instead).
    let mut preprocessor_args = stripped.clone();
    if let Some(charset) = &input_charset {
        preprocessor_args.push(charset.clone());
    }
    if let Some(lang) = &explicit_language {
        preprocessor_args.push("-x".to_string());
        preprocessor_args.push(lang.clone());
    }

    let compiler_args = if compile_preprocessed {
        let mut args = stripped;
        if explicit_language.is_some() {
            if let Some(lang) = lang::language_for_file(&format!("x.{i_extension}")) {
                args.push("-x".to_string());
                args.push(lang.to_string());
            }
        }
        args
    } else {
        preprocessor_args.clone()
    };

    Ok(ProcessedArgs {
        preprocessor_args,
        compiler_args,
        input_file,
        output_obj,
        output_dep,
        generating_dependencies,
        direct_i_file,
        i_extension,
        disable_direct,
        disable_unify,
        compile_preprocessed,
    })
}

/// One element of the hash-participating view of an argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashArg<'a> {
    /// The token itself is hashed.
    Verbatim(&'a str),
    /// The token named a specs file; its contents are hashed instead of
    /// the token (so the path to it doesn't matter).
    SpecsFile(&'a str),
}

/// Produces the subset of `args` that participates in the hash.
///
/// `-L` never participates. In preprocessor mode the include- and
/// macro-related options are excluded, because their effect is fully
/// captured by the preprocessed output; in direct mode they all
/// participate. `args[0]` (the compiler) is never included; the compiler
/// identity is hashed separately.
pub fn hash_args(args: &[String], direct_mode: bool) -> Vec<HashArg<'_>> {
    let mut result = Vec::new();
    let mut i = 1;
    while i < args.len() {
        let arg = args[i].as_str();

        // -L doesn't affect compilation.
        if arg == "-L" && i + 1 < args.len() {
            i += 2;
            continue;
        }
        if arg.starts_with("-L") {
            i += 1;
            continue;
        }

        if !direct_mode {
            if let Some(&(_, takes_arg)) =
                CPP_MODE_HASH_SKIP.iter().find(|(opt, _)| *opt == arg)
            {
                i += if takes_arg && i + 1 < args.len() { 2 } else { 1 };
                continue;
            }
            if arg.starts_with("-D") || arg.starts_with("-I") || arg.starts_with("-U") {
                i += 1;
                continue;
            }
        }

        if let Some(file) = arg.strip_prefix("--specs=") {
            if std::fs::metadata(file).map(|m| m.is_file()).unwrap_or(false) {
                result.push(HashArg::SpecsFile(file));
                i += 1;
                continue;
            }
        }

        result.push(HashArg::Verbatim(arg));
        i += 1;
    }
    result
}

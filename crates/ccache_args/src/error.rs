//! The reasons an invocation cannot be cached.

/// Why argument classification gave up on caching this invocation.
///
/// None of these are user-visible errors: every variant makes the driver
/// fall back to running the real compiler unchanged. They are
/// distinguished so the right statistics counter can be bumped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Bypass {
    /// An option the cache cannot handle (`-E`, coverage, `@file`,
    /// multiple `-arch`, ...).
    #[error("compiler option {0} is unsupported")]
    UnsupportedOption(String),

    /// An option was given without its required operand.
    #[error("missing argument to {0}")]
    MissingArgument(String),

    /// More than one input file with a recognizable source extension.
    #[error("multiple input files: {0} and {1}")]
    MultipleInputFiles(String, String),

    /// No `-c`, or extra non-source inputs: this is a link step.
    #[error("called for link")]
    CalledForLink {
        /// Whether the input smells like an autoconf probe.
        conftest: bool,
    },

    /// The input's extension (or explicit `-x` language) is not one the
    /// cache understands.
    #[error("unsupported source language for {0}")]
    UnsupportedLanguage(String),

    /// No input file was found on the command line.
    #[error("no input file found")]
    NoInputFile,

    /// `-o -`: the compiler would write the object to stdout.
    #[error("output file is stdout")]
    OutputToStdout,

    /// The output path exists but is not a regular file (and is not
    /// `/dev/null`).
    #[error("output file {0} is not a regular file")]
    OutputNotRegular(String),

    /// An object file name could not be derived from the input name.
    #[error("badly formed object file name from {0}")]
    BadObjectName(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert!(Bypass::UnsupportedOption("-E".into())
            .to_string()
            .contains("-E"));
        assert!(Bypass::MissingArgument("-o".into())
            .to_string()
            .contains("-o"));
        assert!(Bypass::MultipleInputFiles("a.c".into(), "b.c".into())
            .to_string()
            .contains("b.c"));
        assert_eq!(
            Bypass::CalledForLink { conftest: true }.to_string(),
            "called for link"
        );
    }
}

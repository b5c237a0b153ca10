//! Source file extension and language tables.
//!
//! These mirror the compiler's own `-x` language names. A language is
//! "preprocessed" when its default source extension already denotes
//! preprocessor output (`.i`, `.ii`, ...), in which case the cache can
//! skip the preprocessor run entirely.

use std::path::Path;

/// Extension (with dot) to `-x` language name.
const EXTENSIONS: &[(&str, &str)] = &[
    (".c", "c"),
    (".C", "c++"),
    (".cc", "c++"),
    (".CC", "c++"),
    (".cpp", "c++"),
    (".CPP", "c++"),
    (".cxx", "c++"),
    (".CXX", "c++"),
    (".c++", "c++"),
    (".C++", "c++"),
    (".i", "cpp-output"),
    (".ii", "c++-cpp-output"),
    (".mi", "objc-cpp-output"),
    (".mii", "objc++-cpp-output"),
    (".m", "objective-c"),
    (".M", "objective-c++"),
    (".mm", "objective-c++"),
];

/// Language name to default preprocessed extension (with dot).
const LANGUAGES: &[(&str, &str)] = &[
    ("c", ".i"),
    ("cpp-output", ".i"),
    ("c++", ".ii"),
    ("c++-cpp-output", ".ii"),
    ("objective-c", ".mi"),
    ("objc-cpp-output", ".mi"),
    ("objective-c++", ".mii"),
    ("objc++-cpp-output", ".mii"),
];

/// Guesses the language of a file from its extension.
///
/// The match is case-sensitive (`.C` is C++, `.c` is C). Returns `None`
/// for unrecognized extensions.
pub fn language_for_file(path: &str) -> Option<&'static str> {
    let ext = Path::new(path).extension()?.to_str()?;
    EXTENSIONS
        .iter()
        .find(|(e, _)| &e[1..] == ext)
        .map(|&(_, lang)| lang)
}

/// The default preprocessed-output extension (including dot) for a
/// language, or `None` if the language is not supported.
pub fn extension_for_language(language: &str) -> Option<&'static str> {
    LANGUAGES
        .iter()
        .find(|(l, _)| *l == language)
        .map(|&(_, ext)| ext)
}

/// Whether the cache knows how to handle this language.
pub fn language_is_supported(language: &str) -> bool {
    extension_for_language(language).is_some()
}

/// Whether sources in this language are already preprocessor output.
pub fn language_is_preprocessed(language: &str) -> bool {
    match extension_for_language(language) {
        Some(ext) => language_for_file(ext) == Some(language),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_and_cxx_extensions() {
        assert_eq!(language_for_file("foo.c"), Some("c"));
        assert_eq!(language_for_file("foo.C"), Some("c++"));
        assert_eq!(language_for_file("dir/foo.cpp"), Some("c++"));
        assert_eq!(language_for_file("foo.cxx"), Some("c++"));
        assert_eq!(language_for_file("foo.c++"), Some("c++"));
    }

    #[test]
    fn preprocessed_extensions() {
        assert_eq!(language_for_file("foo.i"), Some("cpp-output"));
        assert_eq!(language_for_file("foo.ii"), Some("c++-cpp-output"));
        assert_eq!(language_for_file("foo.mi"), Some("objc-cpp-output"));
        assert_eq!(language_for_file("foo.mii"), Some("objc++-cpp-output"));
    }

    #[test]
    fn objective_c_extensions() {
        assert_eq!(language_for_file("foo.m"), Some("objective-c"));
        assert_eq!(language_for_file("foo.M"), Some("objective-c++"));
        assert_eq!(language_for_file("foo.mm"), Some("objective-c++"));
    }

    #[test]
    fn unknown_extension() {
        assert_eq!(language_for_file("foo.rs"), None);
        assert_eq!(language_for_file("foo"), None);
        assert_eq!(language_for_file("foo.o"), None);
    }

    #[test]
    fn extension_for_language_roundtrip() {
        assert_eq!(extension_for_language("c"), Some(".i"));
        assert_eq!(extension_for_language("c++"), Some(".ii"));
        assert_eq!(extension_for_language("objective-c"), Some(".mi"));
        assert_eq!(extension_for_language("fortran"), None);
    }

    #[test]
    fn supported_languages() {
        assert!(language_is_supported("c"));
        assert!(language_is_supported("objc++-cpp-output"));
        assert!(!language_is_supported("ada"));
    }

    #[test]
    fn preprocessed_languages() {
        assert!(language_is_preprocessed("cpp-output"));
        assert!(language_is_preprocessed("c++-cpp-output"));
        assert!(!language_is_preprocessed("c"));
        assert!(!language_is_preprocessed("c++"));
        assert!(!language_is_preprocessed("not-a-language"));
    }
}

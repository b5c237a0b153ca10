//! Path utilities: base-directory relativization, PATH lookup, and
//! temp-file naming.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

/// Returns the final component of a path string, or the whole string if
/// there is no separator.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Computes a lexical relative path from `from` to `to`.
///
/// Both paths must be absolute. No filesystem access is performed and no
/// symlinks are resolved; the computation is purely structural.
pub fn relative_path_between(from: &Path, to: &Path) -> PathBuf {
    let from_comps: Vec<Component> = from.components().collect();
    let to_comps: Vec<Component> = to.components().collect();

    let mut common = 0;
    while common < from_comps.len()
        && common < to_comps.len()
        && from_comps[common] == to_comps[common]
    {
        common += 1;
    }

    let mut result = PathBuf::new();
    for _ in common..from_comps.len() {
        result.push("..");
    }
    for comp in &to_comps[common..] {
        result.push(comp.as_os_str());
    }
    if result.as_os_str().is_empty() {
        result.push(".");
    }
    result
}

/// Rewrites `path` relative to `cwd` when it lies under `base_dir`.
///
/// Paths outside the base directory (or any path when no base directory
/// is configured) are returned unchanged. This is what makes builds of
/// the same tree from different checkouts share cache entries.
pub fn make_relative_path(cwd: &Path, base_dir: Option<&Path>, path: &str) -> String {
    let base = match base_dir {
        Some(b) => b,
        None => return path.to_string(),
    };
    if !Path::new(path).starts_with(base) {
        return path.to_string();
    }
    relative_path_between(cwd, Path::new(path))
        .to_string_lossy()
        .into_owned()
}

/// Searches `PATH` for an executable called `name`, skipping candidates
/// that are really the wrapper itself.
///
/// A candidate is the wrapper when its symlink-resolved file name equals
/// `exclude_name`. Returns the first acceptable candidate.
pub fn find_executable(name: &str, exclude_name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    find_executable_in(name, exclude_name, &path_var)
}

/// `find_executable` over an explicit PATH value (testable without
/// touching the process environment).
pub fn find_executable_in(name: &str, exclude_name: &str, path_var: &OsStr) -> Option<PathBuf> {
    for dir in std::env::split_paths(path_var) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(name);
        if !is_executable(&candidate) {
            continue;
        }
        // Never return the wrapper itself; that way lies infinite
        // recursion when masquerading as the compiler.
        if let Ok(resolved) = std::fs::canonicalize(&candidate) {
            if resolved.file_name() == Some(OsStr::new(exclude_name)) {
                continue;
            }
        }
        return Some(candidate);
    }
    None
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(md) => md.is_file() && md.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

/// The current working directory, preferring `$PWD` when it names the
/// same directory as the kernel's answer.
///
/// `$PWD` preserves the logical path the user typed (through symlinks),
/// which gives more stable hashes for `hashdir` and nicer relative
/// paths.
pub fn current_dir_preferring_pwd() -> std::io::Result<PathBuf> {
    let real = std::env::current_dir()?;
    if let Some(pwd) = std::env::var_os("PWD") {
        let pwd = PathBuf::from(pwd);
        if pwd.is_absolute() {
            if let (Ok(a), Ok(b)) = (std::fs::canonicalize(&pwd), std::fs::canonicalize(&real)) {
                if a == b {
                    return Ok(pwd);
                }
            }
        }
    }
    Ok(real)
}

/// Returns a string unique to this process and call, for temp-file
/// suffixes.
pub fn tmp_string() -> String {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}.{n}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_variants() {
        assert_eq!(basename("/a/b/c.c"), "c.c");
        assert_eq!(basename("c.c"), "c.c");
        assert_eq!(basename("a/b"), "b");
    }

    #[test]
    fn relative_sibling_subtree() {
        let rel = relative_path_between(Path::new("/b/x/y"), Path::new("/b/x/z/h.h"));
        assert_eq!(rel, Path::new("../z/h.h"));
    }

    #[test]
    fn relative_same_dir() {
        let rel = relative_path_between(Path::new("/b/x"), Path::new("/b/x/h.h"));
        assert_eq!(rel, Path::new("h.h"));
    }

    #[test]
    fn relative_identical() {
        let rel = relative_path_between(Path::new("/b/x"), Path::new("/b/x"));
        assert_eq!(rel, Path::new("."));
    }

    #[test]
    fn relative_up_only() {
        let rel = relative_path_between(Path::new("/b/x/y"), Path::new("/b"));
        assert_eq!(rel, Path::new("../.."));
    }

    #[test]
    fn make_relative_inside_base() {
        let rewritten = make_relative_path(
            Path::new("/b/x/y"),
            Some(Path::new("/b")),
            "/b/x/z/h.h",
        );
        assert_eq!(rewritten, "../z/h.h");
    }

    #[test]
    fn make_relative_outside_base() {
        let rewritten = make_relative_path(
            Path::new("/b/x/y"),
            Some(Path::new("/b")),
            "/usr/include/stdio.h",
        );
        assert_eq!(rewritten, "/usr/include/stdio.h");
    }

    #[test]
    fn make_relative_no_base() {
        let rewritten = make_relative_path(Path::new("/b/x/y"), None, "/b/x/z/h.h");
        assert_eq!(rewritten, "/b/x/z/h.h");
    }

    #[test]
    fn make_relative_leaves_relative_paths_alone() {
        let rewritten = make_relative_path(Path::new("/b/x"), Some(Path::new("/b")), "z/h.h");
        assert_eq!(rewritten, "z/h.h");
    }

    #[test]
    fn find_executable_skips_the_wrapper() {
        use std::os::unix::fs::PermissionsExt;

        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        // dir_a/gcc is a symlink to a file named "ccache"; dir_b/gcc is
        // a real executable.
        let wrapper = dir_a.path().join("ccache");
        std::fs::write(&wrapper, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&wrapper, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::os::unix::fs::symlink(&wrapper, dir_a.path().join("gcc")).unwrap();

        let real = dir_b.path().join("gcc");
        std::fs::write(&real, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&real, std::fs::Permissions::from_mode(0o755)).unwrap();

        let path_var =
            std::env::join_paths([dir_a.path(), dir_b.path()]).unwrap();
        let found = find_executable_in("gcc", "ccache", &path_var).unwrap();
        assert_eq!(found, real);
    }

    #[test]
    fn find_executable_none_available() {
        let dir = tempfile::tempdir().unwrap();
        let path_var = std::env::join_paths([dir.path()]).unwrap();
        assert!(find_executable_in("gcc", "ccache", &path_var).is_none());
    }

    #[test]
    fn find_executable_ignores_non_executable_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gcc"), "not executable").unwrap();
        let path_var = std::env::join_paths([dir.path()]).unwrap();
        assert!(find_executable_in("gcc", "ccache", &path_var).is_none());
    }

    #[test]
    fn tmp_string_unique_per_call() {
        assert_ne!(tmp_string(), tmp_string());
    }
}

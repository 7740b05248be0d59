//! Resolving how to launch a stdio server command.
//!
//! Desktop apps launched from a dock or start menu often inherit a minimal
//! PATH that lacks Node or Python toolchains. Package-runner commands are
//! therefore looked up in well-known install locations, and the directory
//! they are found in is prepended to the child's PATH so the runner can find
//! its interpreter.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Commands resolved through [`candidate_dirs`] before falling back to PATH.
pub const PACKAGE_RUNNERS: &[&str] = &["npx", "npm", "pnpm", "yarn", "bunx", "uvx", "node"];

/// A resolved program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// PATH to set for the child, when resolution found a better one.
    pub path: Option<OsString>,
}

/// Work out the program and arguments to spawn for `command`.
pub fn resolve(command: &str, args: &[String]) -> LaunchSpec {
    let resolved = is_package_runner(command)
        .then(|| find_runner(command, &candidate_dirs()))
        .flatten();

    let path = resolved
        .as_deref()
        .and_then(Path::parent)
        .map(build_effective_path);

    let program = resolved.unwrap_or_else(|| PathBuf::from(command));
    wrap_for_platform(command, program, args, path)
}

#[cfg(windows)]
fn wrap_for_platform(
    command: &str,
    program: PathBuf,
    args: &[String],
    path: Option<OsString>,
) -> LaunchSpec {
    let is_script = program
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("cmd") || e.eq_ignore_ascii_case("bat"));
    let unresolved_runner = is_package_runner(command) && !program.is_absolute();

    if is_script || unresolved_runner {
        let mut wrapped = vec!["/C".to_string(), program.to_string_lossy().into_owned()];
        wrapped.extend(args.iter().cloned());
        return LaunchSpec {
            program: PathBuf::from("cmd.exe"),
            args: wrapped,
            path,
        };
    }

    LaunchSpec {
        program,
        args: args.to_vec(),
        path,
    }
}

#[cfg(not(windows))]
fn wrap_for_platform(
    _command: &str,
    program: PathBuf,
    args: &[String],
    path: Option<OsString>,
) -> LaunchSpec {
    LaunchSpec {
        program,
        args: args.to_vec(),
        path,
    }
}

/// Whether `command` names a package runner (by file stem, case-insensitively).
pub fn is_package_runner(command: &str) -> bool {
    let stem = Path::new(command)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(command)
        .to_ascii_lowercase();
    // Absolute paths are taken as given.
    !Path::new(command).is_absolute() && PACKAGE_RUNNERS.contains(&stem.as_str())
}

/// Well-known install locations, most specific first.
pub fn candidate_dirs() -> Vec<PathBuf> {
    let mut found = Vec::new();
    let home = dirs::home_dir();

    #[cfg(target_os = "macos")]
    {
        found.push(PathBuf::from("/opt/homebrew/bin"));
    }

    #[cfg(unix)]
    {
        found.push(PathBuf::from("/usr/local/bin"));
        if let Some(home) = &home {
            found.push(home.join(".volta/bin"));
            found.push(home.join(".bun/bin"));
            found.push(home.join(".local/bin"));
            found.push(home.join(".cargo/bin"));
            found.extend(nvm_bins(home));
        }
        found.push(PathBuf::from("/usr/bin"));
    }

    #[cfg(windows)]
    {
        if let Some(appdata) = env::var_os("APPDATA") {
            found.push(PathBuf::from(appdata).join("npm"));
        }
        if let Some(program_files) = env::var_os("ProgramFiles") {
            found.push(PathBuf::from(program_files).join("nodejs"));
        }
        if let Some(home) = &home {
            found.push(home.join(".volta").join("bin"));
            found.push(home.join(".bun").join("bin"));
            found.push(home.join(".local").join("bin"));
        }
    }

    found
}

/// `bin` directories of nvm-managed Node versions, newest name first.
#[cfg(unix)]
fn nvm_bins(home: &Path) -> Vec<PathBuf> {
    let root = env::var_os("NVM_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| home.join(".nvm"))
        .join("versions/node");
    let Ok(entries) = std::fs::read_dir(&root) else {
        return Vec::new();
    };
    let mut bins: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path().join("bin"))
        .filter(|p| p.is_dir())
        .collect();
    bins.sort();
    bins.reverse();
    bins
}

/// First executable named `command` in `dirs`.
pub fn find_runner(command: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter().find_map(|dir| {
        executable_names(command)
            .into_iter()
            .map(|name| dir.join(name))
            .find(|p| is_executable(p))
    })
}

#[cfg(windows)]
fn executable_names(command: &str) -> Vec<String> {
    if Path::new(command).extension().is_some() {
        return vec![command.to_string()];
    }
    ["cmd", "exe", "bat"]
        .iter()
        .map(|ext| format!("{command}.{ext}"))
        .collect()
}

#[cfg(not(windows))]
fn executable_names(command: &str) -> Vec<String> {
    vec![command.to_string()]
}

fn is_executable(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// PATH for the child: `dir` first, then the current PATH, deduplicated.
pub fn build_effective_path(dir: &Path) -> OsString {
    let mut entries = vec![dir.to_path_buf()];
    if let Some(current) = env::var_os("PATH") {
        entries.extend(env::split_paths(&current));
    }

    let mut seen = std::collections::HashSet::new();
    entries.retain(|e| !e.as_os_str().is_empty() && seen.insert(e.clone()));

    env::join_paths(&entries).unwrap_or_else(|_| dir.as_os_str().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    fn make_executable(dir: &Path, name: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_is_package_runner() {
        assert!(is_package_runner("npx"));
        assert!(is_package_runner("uvx"));
        assert!(is_package_runner("NPX.cmd"));
        assert!(!is_package_runner("python3"));
        assert!(!is_package_runner("/usr/local/bin/npx"));
    }

    #[test]
    fn test_non_runner_passes_through() {
        let spec = resolve("my-server", &["--port".to_string(), "0".to_string()]);
        #[cfg(not(windows))]
        {
            assert_eq!(spec.program, PathBuf::from("my-server"));
            assert_eq!(spec.args, vec!["--port", "0"]);
        }
        assert!(spec.path.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_find_runner_in_first_matching_dir() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let expected = make_executable(second.path(), "npx");
        std::fs::write(first.path().join("npx"), "not executable").unwrap();

        let dirs = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        assert_eq!(find_runner("npx", &dirs), Some(expected));
        assert_eq!(find_runner("uvx", &dirs), None);
    }

    #[test]
    fn test_effective_path_puts_dir_first_and_dedups() {
        let dir = TempDir::new().unwrap();
        let path = build_effective_path(dir.path());
        let entries: Vec<PathBuf> = env::split_paths(&path).collect();
        assert_eq!(entries[0], dir.path());
        let count = entries.iter().filter(|e| *e == dir.path()).count();
        assert_eq!(count, 1);
    }
}

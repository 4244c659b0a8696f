//! Locating the ONNX Runtime shared library.
//!
//! `ort` is built with `load-dynamic`, so the library is resolved at runtime
//! through `ORT_DYLIB_PATH`. When that variable is unset we probe a few
//! conventional locations and set it before the first session is created.

use std::env;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

pub const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";
#[cfg(not(any(unix, windows)))]
const ORT_LIB_NAME: &str = "libonnxruntime.dylib";

/// Probes, in order:
///   1. `<exe_dir>/` (Windows only)
///   2. `<exe_dir>/lib/`
///   3. `<exe_dir>/../lib/`
///   4. `<cwd>/lib/`
///   5. `/usr/local/lib/` and `/usr/lib/` (Unix only)
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            {
                dirs.push(exe_dir.to_path_buf());
            }
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Sets `ORT_DYLIB_PATH` from the probed locations unless already set.
///
/// Call at the start of `main()`, before any session is built.
pub fn setup_ort_dylib() -> Option<PathBuf> {
    if let Some(existing) = env::var_os(ORT_DYLIB_ENV) {
        return Some(PathBuf::from(existing));
    }
    let found = find_ort_dylib_in_dirs(&candidate_lib_dirs())?;
    env::set_var(ORT_DYLIB_ENV, &found);
    Some(found)
}

/// Call after tracing is initialized.
pub fn log_ort_dylib_status() {
    match env::var(ORT_DYLIB_ENV) {
        Ok(ort) if Path::new(&ort).is_file() => info!("ORT library: {ort}"),
        Ok(ort) => warn!("{ORT_DYLIB_ENV} set to {ort} but file not found"),
        Err(_) => warn!("{ORT_DYLIB_ENV} not set; ORT will try default search paths"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn candidate_lib_dirs_contains_system_paths() {
        let dirs = candidate_lib_dirs();
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
        assert!(dirs.contains(&PathBuf::from("/usr/lib")));
    }

    #[test]
    fn candidate_lib_dirs_includes_cwd_lib() {
        let dirs = candidate_lib_dirs();
        if let Ok(cwd) = env::current_dir() {
            assert!(dirs.contains(&cwd.join("lib")));
        }
    }

    #[test]
    fn find_ort_dylib_prefers_first_dir_with_library() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let third = tempfile::tempdir().unwrap();
        std::fs::write(second.path().join(ORT_LIB_NAME), b"").unwrap();
        std::fs::write(third.path().join(ORT_LIB_NAME), b"").unwrap();

        let dirs = vec![
            first.path().to_path_buf(),
            second.path().to_path_buf(),
            third.path().to_path_buf(),
        ];
        assert_eq!(
            find_ort_dylib_in_dirs(&dirs),
            Some(second.path().join(ORT_LIB_NAME))
        );
        assert_eq!(find_ort_dylib_in_dirs(&dirs[..1]), None);
    }
}

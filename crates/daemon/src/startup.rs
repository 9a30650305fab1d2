//! Startup checks for the label daemon
//!
//! Verifies that the external renderer and PDF assembler named in the
//! configuration can be launched before any file is picked up.

use crate::config::Config;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{role} program '{program}' not found; is it installed and on PATH?")]
    ProgramNotFound { role: &'static str, program: String },

    #[error("{role} program is not configured")]
    ProgramMissing { role: &'static str },
}

/// Locate `program` the way a shell would.
///
/// Names containing a path separator are checked directly; bare names are
/// searched on `PATH` (with `.exe` appended on Windows).
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }

    let as_path = Path::new(program);
    if as_path.components().count() > 1 {
        return is_executable(as_path).then(|| as_path.to_path_buf());
    }

    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search).find_map(|dir| {
        candidates(&dir, program)
            .into_iter()
            .find(|candidate| is_executable(candidate))
    })
}

fn candidates(dir: &Path, program: &str) -> Vec<PathBuf> {
    let plain = dir.join(program);
    if cfg!(windows) && plain.extension().is_none() {
        vec![plain.with_extension("exe"), plain]
    } else {
        vec![plain]
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Check one configured program.
pub fn check_program(role: &'static str, program: &str) -> Result<PathBuf, StartupError> {
    if program.trim().is_empty() {
        return Err(StartupError::ProgramMissing { role });
    }
    resolve_program(program).ok_or_else(|| StartupError::ProgramNotFound {
        role,
        program: program.to_string(),
    })
}

/// Run all startup checks
///
/// # Returns
/// * `Ok(())` - renderer and assembler both resolve
/// * `Err(StartupError)` - the first program that could not be found
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_program("renderer", &cfg.converter.renderer_program)?;
    check_program("assembler", &cfg.converter.assembler_program)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_unknown_programs_are_reported(name in "[a-z]{10,16}") {
            let program = format!("zz-no-such-label-tool-{}", name);
            prop_assert!(resolve_program(&program).is_none());
            let err = check_program("renderer", &program).unwrap_err();
            let is_not_found = matches!(err, StartupError::ProgramNotFound { .. });
            prop_assert!(is_not_found);
        }
    }

    #[test]
    fn test_empty_program_is_missing() {
        assert!(matches!(
            check_program("assembler", "  "),
            Err(StartupError::ProgramMissing { role: "assembler" })
        ));
        assert!(resolve_program("").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_finds_shell_on_path() {
        let found = resolve_program("sh").unwrap();
        assert!(found.is_absolute());
        assert_eq!(check_program("renderer", "sh").unwrap(), found);
    }

    #[cfg(unix)]
    #[test]
    fn test_explicit_path() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempfile::TempDir::new().unwrap();
        let tool = temp_dir.path().join("render.sh");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        assert!(resolve_program(tool.to_str().unwrap()).is_none());

        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(resolve_program(tool.to_str().unwrap()), Some(tool));
    }

    #[test]
    fn test_default_config_names_both_programs() {
        let cfg = Config::default();
        match run_startup_checks(&cfg) {
            Ok(()) => {}
            Err(StartupError::ProgramNotFound { program, .. }) => {
                assert!(program == "zpl2png" || program == "img2pdf")
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}

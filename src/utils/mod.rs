pub mod container;
pub mod identity;

use std::path::PathBuf;
use which::which;

use crate::errors::{BackupError, Result};

/// Finds an executable in the system PATH.
pub fn find_executable(program: &str) -> Result<PathBuf> {
    which(program).map_err(|_| BackupError::ToolNotFound {
        program: program.to_string(),
    })
}

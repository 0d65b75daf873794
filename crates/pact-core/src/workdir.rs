//! Agent workspace layout
//!
//! The workspace directory holds the agent's private state. It must not be
//! writable by group or other; startup fixes the mode when possible and
//! aborts otherwise. The standard subdirectories are created mode 0700.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{PolicyError, Result};

/// Subdirectories of every agent workspace.
pub const WORKDIR_SUBDIRS: [&str; 6] = [
    "state", "inputs", "outputs", "ppkeys", "reports", "modules",
];

/// Default workspace location.
pub fn default_workdir() -> PathBuf {
    if let Ok(dir) = std::env::var("PACT_WORKDIR") {
        return PathBuf::from(dir);
    }
    PathBuf::from("/var/pact")
}

/// Create (if needed) and sanity-check the workspace at `workdir`.
pub fn ensure_workspace(workdir: &Path) -> Result<()> {
    if !workdir.exists() {
        info!(workdir = %workdir.display(), "Creating agent workspace");
        create_private_dir(workdir)?;
    }

    let metadata = std::fs::metadata(workdir)
        .map_err(|e| PolicyError::Workspace(format!("cannot stat {}: {e}", workdir.display())))?;
    if !metadata.is_dir() {
        return Err(PolicyError::Workspace(format!(
            "{} is not a directory",
            workdir.display()
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode();
        if mode & 0o022 != 0 {
            warn!(
                workdir = %workdir.display(),
                mode = format!("{:o}", mode & 0o777),
                "Workspace is writable by group/other; tightening"
            );
            let mut permissions = metadata.permissions();
            permissions.set_mode(mode & !0o022);
            std::fs::set_permissions(workdir, permissions).map_err(|e| {
                PolicyError::Workspace(format!(
                    "workspace {} must be owner-only-writable: {e}",
                    workdir.display()
                ))
            })?;
        }
    }

    for sub in WORKDIR_SUBDIRS {
        let path = workdir.join(sub);
        if !path.exists() {
            create_private_dir(&path)?;
        }
    }

    Ok(())
}

fn create_private_dir(path: &Path) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(path)
        .map_err(|e| PolicyError::Workspace(format!("cannot create {}: {e}", path.display())))
}

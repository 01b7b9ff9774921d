use std::path::{Path, PathBuf};
use tracing::warn;

/// Answers "is this executable available?" before a start attempt.
///
/// Downloading and installing binaries is somebody else's job.
pub trait BinaryProvisioner: Send + Sync {
    fn is_installed(&self, executable: &Path) -> bool;
}

/// Looks for the executable on disk: as given if it is a path, otherwise in
/// the extra directories and then in `PATH`. Only files the current user can
/// execute count.
#[derive(Debug, Clone, Default)]
pub struct FileSystemProvisioner {
    search_dirs: Vec<PathBuf>,
}

impl FileSystemProvisioner {
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Self { search_dirs }
    }
}

impl BinaryProvisioner for FileSystemProvisioner {
    fn is_installed(&self, executable: &Path) -> bool {
        if executable.components().count() > 1 || executable.is_absolute() {
            return which::which(executable).is_ok();
        }
        let path = std::env::var_os("PATH");
        let dirs = self
            .search_dirs
            .iter()
            .cloned()
            .chain(path.iter().flat_map(std::env::split_paths));
        let search_path = match std::env::join_paths(dirs) {
            Ok(joined) => joined,
            Err(err) => {
                warn!(?err, "Unusable search directory, falling back to PATH");
                return which::which(executable).is_ok();
            }
        };
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        which::which_in(executable, Some(search_path), cwd).is_ok()
    }
}

use std::fs;
use std::io::ErrorKind;
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::SandboxError;

pub const SOURCE_FILE: &str = "main.algo";
pub const INPUT_FILE: &str = "input.txt";
pub const OUTPUT_DIR: &str = "out";
pub const OUTPUT_FILE: &str = "output.txt";

// Only the service user may list the workspace root
const ROOT_DIR_PERMISSIONS: u32 = 0o700;

/// Ephemeral on-disk area holding the artifacts of exactly one execution
///
/// The directory is named after a random v4 UUID and created with
/// `create_dir` (not `create_dir_all`), so two concurrent acquisitions can
/// never end up sharing a directory. `release` runs at most once; if the
/// owner never calls it, `Drop` does.
#[derive(Debug)]
pub struct Workspace {
    id: String,
    dir: PathBuf,
    source_path: PathBuf,
    input_path: Option<PathBuf>,
    output_dir: PathBuf,
    released: bool,
}

impl Workspace {
    /// Creates a fresh workspace under `root` and writes the request's artifacts
    pub fn acquire(root: &Path, source: &str, input: Option<&str>) -> Result<Self, SandboxError> {
        // Only directories created here get the restricted mode; an existing
        // root keeps whatever mode its owner gave it
        DirBuilder::new()
            .recursive(true)
            .mode(ROOT_DIR_PERMISSIONS)
            .create(root)
            .map_err(SandboxError::Workspace)?;

        let id = Uuid::new_v4().simple().to_string();
        let dir = root.join(&id);
        fs::create_dir(&dir).map_err(SandboxError::Workspace)?;

        // From here on, an early return drops `workspace` and removes the directory
        let mut workspace = Self {
            source_path: dir.join(SOURCE_FILE),
            input_path: None,
            output_dir: dir.join(OUTPUT_DIR),
            id,
            dir,
            released: false,
        };

        fs::write(&workspace.source_path, source).map_err(SandboxError::Workspace)?;
        if let Some(input) = input {
            let input_path = workspace.dir.join(INPUT_FILE);
            fs::write(&input_path, input).map_err(SandboxError::Workspace)?;
            workspace.input_path = Some(input_path);
        }
        fs::create_dir(&workspace.output_dir).map_err(SandboxError::Workspace)?;

        log::debug!("Workspace {} created at {}", workspace.id, workspace.dir.display());
        Ok(workspace)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn input_path(&self) -> Option<&Path> {
        self.input_path.as_deref()
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn output_file(&self) -> PathBuf {
        self.output_dir.join(OUTPUT_FILE)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Removes every artifact and the workspace directory itself
    ///
    /// Each deletion is attempted even if an earlier one failed. Failures are
    /// logged and reflected in the return value, never raised. Calling this
    /// again after the first time does nothing and returns `true`.
    pub fn release(&mut self) -> bool {
        if self.released {
            return true;
        }
        self.released = true;

        let mut clean = true;
        let output_file = self.output_file();
        let files = [
            Some(self.source_path.as_path()),
            self.input_path.as_deref(),
            Some(output_file.as_path()),
        ];
        for path in files.into_iter().flatten() {
            clean &= remove(path, fs::remove_file(path));
        }
        clean &= remove(&self.output_dir, fs::remove_dir_all(&self.output_dir));
        clean &= remove(&self.dir, fs::remove_dir_all(&self.dir));

        if clean {
            log::debug!("Workspace {} removed", self.id);
        }
        clean
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.released {
            log::debug!("Workspace {} released on drop", self.id);
            self.release();
        }
    }
}

fn remove(path: &Path, result: std::io::Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => true,
        Err(e) => {
            log::warn!("Failed to remove {}: {e}", path.display());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::os::unix::fs::PermissionsExt;

    fn mode(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    #[test]
    fn test_existing_root_keeps_its_mode() {
        let root = tempfile::tempdir().unwrap();
        fs::set_permissions(root.path(), fs::Permissions::from_mode(0o1777)).unwrap();

        let _ws = Workspace::acquire(root.path(), "Algorithme A", None).unwrap();
        assert_eq!(mode(root.path()), 0o1777);
    }

    #[test]
    fn test_created_root_is_private() {
        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().join("cache").join("workspaces");

        let _ws = Workspace::acquire(&root, "Algorithme A", None).unwrap();
        assert_eq!(mode(&root) & 0o077, 0);
        assert_eq!(mode(&parent.path().join("cache")) & 0o077, 0);
    }

    #[test]
    fn test_acquire_writes_artifacts() {
        let root = tempfile::tempdir().unwrap();
        let mut ws = Workspace::acquire(root.path(), "Algorithme A", Some("42")).unwrap();

        assert_eq!(fs::read_to_string(ws.source_path()).unwrap(), "Algorithme A");
        assert_eq!(fs::read_to_string(ws.input_path().unwrap()).unwrap(), "42");
        assert!(ws.output_dir().is_dir());
        assert!(ws.dir().starts_with(root.path()));

        assert!(ws.release());
        assert!(!ws.dir().exists());
    }

    #[test]
    fn test_acquire_without_input() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::acquire(root.path(), "Algorithme A", None).unwrap();
        assert!(ws.input_path().is_none());
        assert!(!ws.dir().join(INPUT_FILE).exists());
    }

    #[test]
    fn test_release_removes_files_written_by_the_run() {
        let root = tempfile::tempdir().unwrap();
        let mut ws = Workspace::acquire(root.path(), "Algorithme A", None).unwrap();
        fs::write(ws.output_file(), "2").unwrap();
        fs::write(ws.output_dir().join("scratch.tmp"), "x").unwrap();
        fs::write(ws.dir().join("stray"), "y").unwrap();

        assert!(ws.release());
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let mut ws = Workspace::acquire(root.path(), "Algorithme A", None).unwrap();
        assert!(ws.release());
        assert!(ws.is_released());
        assert!(ws.release());
    }

    #[test]
    fn test_drop_releases() {
        let root = tempfile::tempdir().unwrap();
        let dir = {
            let ws = Workspace::acquire(root.path(), "Algorithme A", Some("1")).unwrap();
            ws.dir().to_path_buf()
        };
        assert!(!dir.exists());
    }

    #[test]
    fn test_release_survives_externally_deleted_artifacts() {
        let root = tempfile::tempdir().unwrap();
        let mut ws = Workspace::acquire(root.path(), "Algorithme A", Some("1")).unwrap();
        fs::remove_file(ws.source_path()).unwrap();
        fs::remove_dir_all(ws.output_dir()).unwrap();
        assert!(ws.release());
        assert!(!ws.dir().exists());
    }

    #[test]
    fn test_concurrent_acquisitions_never_collide() {
        let root = tempfile::tempdir().unwrap();
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let root = root.path().to_path_buf();
                std::thread::spawn(move || {
                    let ws = Workspace::acquire(&root, &format!("program {i}"), None).unwrap();
                    let content = fs::read_to_string(ws.source_path()).unwrap();
                    (ws.id().to_string(), content == format!("program {i}"), ws)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let ids: HashSet<_> = results.iter().map(|(id, _, _)| id.clone()).collect();
        assert_eq!(ids.len(), 32);
        assert!(results.iter().all(|(_, own_content, _)| *own_content));

        drop(results);
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }
}

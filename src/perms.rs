use std::fs::{self, Permissions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub struct WritableGuard {
    path: PathBuf,
    original: Option<Permissions>,
}

impl WritableGuard {
    pub fn repaired(&self) -> bool {
        self.original.is_some()
    }

    // The rename happens while the guard is live; restoration must land on
    // the post-rename path.
    pub fn retarget(&mut self, path: PathBuf) {
        self.path = path;
    }
}

impl Drop for WritableGuard {
    fn drop(&mut self) {
        if let Some(original) = self.original.take() {
            if let Err(err) = fs::set_permissions(&self.path, original) {
                println!(
                    "warning: could not restore permissions on {}: {err}",
                    self.path.display()
                );
            }
        }
    }
}

pub fn ensure_writable(path: &Path) -> Result<WritableGuard> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("reading metadata for {}", path.display()))?;

    if is_writable(&metadata) {
        return Ok(WritableGuard {
            path: path.to_path_buf(),
            original: None,
        });
    }

    let original = metadata.permissions();
    let forced = writable_permissions(&metadata);
    if let Err(err) = fs::set_permissions(path, forced) {
        println!(
            "error: {} is not writable and its permissions cannot be changed ({err})",
            path.display()
        );
        println!("please make it writable and try again.");
        return Err(err).with_context(|| format!("making {} writable", path.display()));
    }

    Ok(WritableGuard {
        path: path.to_path_buf(),
        original: Some(original),
    })
}

#[cfg(unix)]
fn is_writable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o200 != 0
}

#[cfg(not(unix))]
fn is_writable(metadata: &fs::Metadata) -> bool {
    !metadata.permissions().readonly()
}

#[cfg(unix)]
fn writable_permissions(metadata: &fs::Metadata) -> Permissions {
    use std::os::unix::fs::PermissionsExt;
    Permissions::from_mode(if metadata.is_dir() { 0o755 } else { 0o644 })
}

#[cfg(not(unix))]
fn writable_permissions(metadata: &fs::Metadata) -> Permissions {
    let mut perms = metadata.permissions();
    perms.set_readonly(false);
    perms
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writable_entry_takes_no_snapshot() {
        let temp = tempdir().expect("temp dir");
        let file = temp.path().join("plain.txt");
        fs::write(&file, "data").expect("write file");

        let guard = ensure_writable(&file).expect("guard");
        assert!(!guard.repaired());
    }

    #[cfg(unix)]
    #[test]
    fn readonly_file_is_repaired_then_restored() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempdir().expect("temp dir");
        let file = temp.path().join("locked.txt");
        fs::write(&file, "data").expect("write file");
        fs::set_permissions(&file, Permissions::from_mode(0o444)).expect("chmod");

        {
            let guard = ensure_writable(&file).expect("guard");
            assert!(guard.repaired());
            let mode = fs::metadata(&file).expect("metadata").permissions().mode();
            assert_eq!(mode & 0o777, 0o644);
        }

        let mode = fs::metadata(&file).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o444);
    }

    #[cfg(unix)]
    #[test]
    fn readonly_directory_gets_directory_mode() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempdir().expect("temp dir");
        let dir = temp.path().join("Locked");
        fs::create_dir(&dir).expect("create dir");
        fs::set_permissions(&dir, Permissions::from_mode(0o555)).expect("chmod");

        let guard = ensure_writable(&dir).expect("guard");
        assert!(guard.repaired());
        let mode = fs::metadata(&dir).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        drop(guard);

        let mode = fs::metadata(&dir).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o555);
    }

    #[cfg(unix)]
    #[test]
    fn retarget_moves_restoration_to_new_path() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempdir().expect("temp dir");
        let old = temp.path().join("OLD");
        fs::create_dir(&old).expect("create dir");
        fs::set_permissions(&old, Permissions::from_mode(0o555)).expect("chmod");

        let new = temp.path().join("old");
        {
            let mut guard = ensure_writable(&old).expect("guard");
            fs::rename(&old, &new).expect("rename");
            guard.retarget(new.clone());
        }

        let mode = fs::metadata(&new).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o555);
    }
}

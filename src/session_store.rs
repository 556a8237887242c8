//! Durable session directory and per-run working copies
//!
//! A run never touches the durable profile directly. It gets a private copy
//! (`Workspace`), the browser runs over that copy, and at the end the copy is
//! written back only when the durable directory is empty or absent. The copy
//! is staged first and then renamed into place, so a reader never sees a
//! half-written profile. An absent directory is staged as a sibling and
//! renamed over; an existing empty one (possibly a mount point) is staged
//! inside itself and its children are renamed up, so the directory itself is
//! never replaced.
//!
//! Copying and removal run on tokio's blocking pool.
//!
//! The emptiness rule alone does not exclude concurrent runs. `SessionLock`
//! holds an OS advisory lock on `<session_dir>.lock` around the whole
//! acquire → commit window.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::wait::poll_until;

/// Name of the browser profile inside a workspace
const PROFILE_DIR_NAME: &str = "profile";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    #[error("Timed out after {}ms waiting for session lock {}", .waited.as_millis(), .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("Storage task failed: {0}")]
    Task(String),
}

impl StorageError {
    fn io(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> StorageError {
        let path = path.to_path_buf();
        move |source| StorageError::Io {
            action,
            path,
            source,
        }
    }
}

/// What `commit` did with a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Saved,
    /// The durable directory already holds a session; it is left untouched
    DestinationPopulated,
    /// The run produced no profile worth keeping
    EmptyWorkspace,
}

/// A run-scoped copy of the session directory
///
/// Removed by `SessionStore::release`; dropping an unreleased workspace
/// removes it too, so an abandoned run does not leak the copy.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    profile: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory the browser uses as its user data dir
    pub fn profile_dir(&self) -> &Path {
        &self.profile
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        remove_workspace_dir(&self.root);
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(
            "Workspace {} dropped without release, removing it",
            self.root.display()
        );
        self.released = true;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let root = self.root.clone();
                handle.spawn_blocking(move || remove_workspace_dir(&root));
            }
            Err(_) => remove_workspace_dir(&self.root),
        }
    }
}

fn remove_workspace_dir(root: &Path) {
    match fs::remove_dir_all(root) {
        Ok(()) => debug!("Removed workspace {}", root.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            "Failed to remove workspace {}: {}. Manual cleanup may be required.",
            root.display(),
            e
        ),
    }
}

/// Run blocking filesystem work off the async workers
async fn blocking<T, F>(work: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
{
    let span = tracing::Span::current();
    tokio::task::spawn_blocking(move || span.in_scope(work))
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    session_dir: PathBuf,
    workspace_root: PathBuf,
}

impl SessionStore {
    pub fn new(session_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_dir: session_dir.into(),
            workspace_root: std::env::temp_dir(),
        }
    }

    /// Create workspaces under `root` instead of the system temp dir
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Sibling lock file guarding the session directory
    pub fn lock_path(&self) -> PathBuf {
        let name = self
            .session_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "session".to_string());
        self.session_dir.with_file_name(format!("{name}.lock"))
    }

    /// Take the advisory lock, waiting at most `wait`
    pub async fn lock(&self, wait: Duration) -> Result<SessionLock, StorageError> {
        SessionLock::acquire(self.lock_path(), wait).await
    }

    /// Copy the session directory into a fresh workspace
    ///
    /// A missing session directory yields an empty profile, which is how the
    /// very first (interactive) login starts.
    pub async fn acquire_working_copy(&self) -> Result<Workspace, StorageError> {
        let store = self.clone();
        blocking(move || store.copy_into_workspace()).await
    }

    fn copy_into_workspace(&self) -> Result<Workspace, StorageError> {
        fs::create_dir_all(&self.workspace_root)
            .map_err(StorageError::io("create workspace root", &self.workspace_root))?;

        let root = self
            .workspace_root
            .join(format!("chat_automation_{}", uuid::Uuid::new_v4().simple()));
        fs::create_dir(&root).map_err(StorageError::io("create workspace", &root))?;

        let mut workspace = Workspace {
            profile: root.join(PROFILE_DIR_NAME),
            root,
            released: false,
        };

        let copied = if self.session_dir.is_dir() {
            copy_tree(&self.session_dir, &workspace.profile)
        } else {
            debug!(
                "Session directory {} does not exist, starting from an empty profile",
                self.session_dir.display()
            );
            fs::create_dir(&workspace.profile)
                .map_err(StorageError::io("create profile", &workspace.profile))
        };

        if let Err(e) = copied {
            workspace.remove();
            return Err(e);
        }

        info!(
            "Acquired workspace {} from {}",
            workspace.root.display(),
            self.session_dir.display()
        );
        Ok(workspace)
    }

    /// Write the workspace profile back if the session directory is empty or absent
    ///
    /// A populated session directory is never overwritten, even by a newer
    /// profile.
    pub async fn commit(&self, workspace: &Workspace) -> Result<CommitOutcome, StorageError> {
        let source = workspace.profile_dir().to_path_buf();
        let dest = self.session_dir.clone();
        blocking(move || commit_profile(&source, &dest)).await
    }

    /// Remove the workspace. Best effort: failures are logged, never returned.
    pub async fn release(&self, mut workspace: Workspace) {
        let removed = tokio::task::spawn_blocking(move || workspace.remove()).await;
        if let Err(e) = removed {
            warn!("Workspace removal task failed: {}", e);
        }
    }
}

fn commit_profile(source: &Path, dest: &Path) -> Result<CommitOutcome, StorageError> {
    if !has_entries(source)? {
        warn!(
            "Workspace profile {} is empty or missing, nothing to save",
            source.display()
        );
        return Ok(CommitOutcome::EmptyWorkspace);
    }

    if has_entries(dest)? {
        debug!(
            "Session directory {} already populated, keeping it",
            dest.display()
        );
        return Ok(CommitOutcome::DestinationPopulated);
    }

    if dest.is_dir() {
        fill_in_place(source, dest)?;
    } else {
        swap_in(source, dest)?;
    }

    info!("Profile saved to {}", dest.display());
    Ok(CommitOutcome::Saved)
}

/// Stage next to an absent `dest` and rename the staging dir onto it
fn swap_in(source: &Path, dest: &Path) -> Result<(), StorageError> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(StorageError::io("create parent of", dest))?;

    let staging = dest.with_file_name(format!(
        ".{}.staging-{}",
        dest.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        uuid::Uuid::new_v4().simple()
    ));

    let swapped = copy_tree(source, &staging).and_then(|()| {
        fs::rename(&staging, dest).map_err(StorageError::io("move staged profile to", dest))
    });
    if swapped.is_err() {
        remove_quietly(&staging);
    }
    swapped
}

/// Stage inside an existing empty `dest` and rename each child up into it
///
/// `dest` may be a mount point or otherwise pinned, so it is never removed
/// or replaced. On failure the moved children are taken out again and
/// `dest` is left empty.
fn fill_in_place(source: &Path, dest: &Path) -> Result<(), StorageError> {
    let staging = dest.join(format!(".staging-{}", uuid::Uuid::new_v4().simple()));
    let mut moved = Vec::new();

    let filled = copy_tree(source, &staging).and_then(|()| {
        let entries = fs::read_dir(&staging).map_err(StorageError::io("read", &staging))?;
        for entry in entries {
            let entry = entry.map_err(StorageError::io("read", &staging))?;
            let target = dest.join(entry.file_name());
            fs::rename(entry.path(), &target)
                .map_err(StorageError::io("move staged entry to", &target))?;
            moved.push(target);
        }
        Ok(())
    });

    if filled.is_err() {
        for path in &moved {
            remove_quietly(path);
        }
    }
    remove_quietly(&staging);
    filled
}

fn remove_quietly(path: &Path) {
    let removed = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    if let Err(e) = removed
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!("Failed to remove {}: {}", path.display(), e);
    }
}

/// Exclusive advisory lock on the session directory, released on drop
#[derive(Debug)]
pub struct SessionLock {
    file: File,
    path: PathBuf,
}

impl SessionLock {
    pub async fn acquire(path: PathBuf, wait: Duration) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(StorageError::io("create lock dir", parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(StorageError::io("open lock file", &path))?;

        let handle = &file;
        let lock_path = &path;
        let locked = poll_until(wait, move || async move {
            match handle.try_lock() {
                Ok(()) => Ok(Some(())),
                Err(TryLockError::WouldBlock) => Ok(None),
                Err(TryLockError::Error(e)) => Err(StorageError::io("lock", lock_path)(e)),
            }
        })
        .await?;

        if locked.is_none() {
            return Err(StorageError::LockTimeout {
                path,
                waited: wait,
            });
        }

        debug!("Acquired session lock {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

fn has_entries(path: &Path) -> Result<bool, StorageError> {
    match fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::io("read", path)(e)),
    }
}

/// Recursively copy `src` to `dest`, skipping symlinks
fn copy_tree(src: &Path, dest: &Path) -> Result<(), StorageError> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            StorageError::Io {
                action: "walk",
                path,
                source: e.into(),
            }
        })?;

        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(StorageError::io("create", &target))?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target).map_err(StorageError::io("copy", entry.path()))?;
        } else {
            // Chrome's process-singleton markers are symlinks tied to a live process
            debug!("Skipping non-regular entry {}", entry.path().display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn leftover_workspaces(root: &Path) -> usize {
        fs::read_dir(root)
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn acquire_copies_existing_session_recursively() {
        let tmp = tempdir().unwrap();
        let session = tmp.path().join("session");
        write(&session.join("Default/Cookies"), "cookie-jar");
        write(&session.join("Local State"), "{}");

        let store = SessionStore::new(&session).with_workspace_root(tmp.path().join("ws"));
        let workspace = store.acquire_working_copy().await.unwrap();

        assert_eq!(read(&workspace.profile_dir().join("Default/Cookies")), "cookie-jar");
        assert_eq!(read(&workspace.profile_dir().join("Local State")), "{}");
        // Source untouched
        assert_eq!(read(&session.join("Default/Cookies")), "cookie-jar");
        store.release(workspace).await;
    }

    #[tokio::test]
    async fn acquire_without_session_starts_empty() {
        let tmp = tempdir().unwrap();
        let store = SessionStore::new(tmp.path().join("missing"))
            .with_workspace_root(tmp.path().join("ws"));

        let workspace = store.acquire_working_copy().await.unwrap();
        assert!(workspace.profile_dir().is_dir());
        assert!(!has_entries(workspace.profile_dir()).unwrap());
        store.release(workspace).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn acquire_skips_symlinks() {
        let tmp = tempdir().unwrap();
        let session = tmp.path().join("session");
        write(&session.join("Preferences"), "prefs");
        std::os::unix::fs::symlink("host-1234", session.join("SingletonLock")).unwrap();

        let store = SessionStore::new(&session).with_workspace_root(tmp.path().join("ws"));
        let workspace = store.acquire_working_copy().await.unwrap();

        assert!(workspace.profile_dir().join("Preferences").exists());
        assert!(
            fs::symlink_metadata(workspace.profile_dir().join("SingletonLock")).is_err()
        );
        store.release(workspace).await;
    }

    #[tokio::test]
    async fn release_removes_workspace_and_tolerates_missing_dir() {
        let tmp = tempdir().unwrap();
        let ws_root = tmp.path().join("ws");
        let store = SessionStore::new(tmp.path().join("session")).with_workspace_root(&ws_root);

        let workspace = store.acquire_working_copy().await.unwrap();
        let root = workspace.root().to_path_buf();
        store.release(workspace).await;
        assert!(!root.exists());

        let workspace = store.acquire_working_copy().await.unwrap();
        fs::remove_dir_all(workspace.root()).unwrap();
        store.release(workspace).await;
        assert_eq!(leftover_workspaces(&ws_root), 0);
    }

    #[test]
    fn dropping_unreleased_workspace_outside_runtime_removes_it() {
        let tmp = tempdir().unwrap();
        let store = SessionStore::new(tmp.path().join("session"))
            .with_workspace_root(tmp.path().join("ws"));
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();

        let workspace = runtime.block_on(store.acquire_working_copy()).unwrap();
        let root = workspace.root().to_path_buf();
        drop(workspace);

        assert!(!root.exists());
    }

    #[tokio::test]
    async fn dropping_unreleased_workspace_inside_runtime_removes_it() {
        let tmp = tempdir().unwrap();
        let store = SessionStore::new(tmp.path().join("session"))
            .with_workspace_root(tmp.path().join("ws"));

        let workspace = store.acquire_working_copy().await.unwrap();
        let root = workspace.root().to_path_buf();
        drop(workspace);

        let root = &root;
        let gone = poll_until(Duration::from_secs(5), move || async move {
            Ok::<_, ()>((!root.exists()).then_some(()))
        })
        .await
        .unwrap();
        assert!(gone.is_some());
    }

    #[tokio::test]
    async fn commit_never_overwrites_populated_session() {
        let tmp = tempdir().unwrap();
        let session = tmp.path().join("session");
        write(&session.join("Cookies"), "known-good");

        let store = SessionStore::new(&session).with_workspace_root(tmp.path().join("ws"));
        let workspace = store.acquire_working_copy().await.unwrap();
        write(&workspace.profile_dir().join("Cookies"), "newer");
        write(&workspace.profile_dir().join("Extra"), "extra");

        assert_eq!(
            store.commit(&workspace).await.unwrap(),
            CommitOutcome::DestinationPopulated
        );
        assert_eq!(read(&session.join("Cookies")), "known-good");
        assert!(!session.join("Extra").exists());
        store.release(workspace).await;
    }

    #[tokio::test]
    async fn commit_fills_absent_session() {
        let tmp = tempdir().unwrap();
        let session = tmp.path().join("state").join("session");
        let store = SessionStore::new(&session).with_workspace_root(tmp.path().join("ws"));

        let workspace = store.acquire_working_copy().await.unwrap();
        write(&workspace.profile_dir().join("Default/Cookies"), "fresh");
        write(&workspace.profile_dir().join("Local State"), "state");

        assert_eq!(store.commit(&workspace).await.unwrap(), CommitOutcome::Saved);
        assert_eq!(read(&session.join("Default/Cookies")), "fresh");
        assert_eq!(read(&session.join("Local State")), "state");

        // No staging leftovers next to the session dir
        assert_eq!(names(session.parent().unwrap()), vec!["session"]);
        store.release(workspace).await;
    }

    #[tokio::test]
    async fn commit_fills_empty_session_dir() {
        let tmp = tempdir().unwrap();
        let session = tmp.path().join("session");
        fs::create_dir_all(&session).unwrap();
        let store = SessionStore::new(&session).with_workspace_root(tmp.path().join("ws"));

        let workspace = store.acquire_working_copy().await.unwrap();
        write(&workspace.profile_dir().join("Cookies"), "fresh");
        write(&workspace.profile_dir().join("Default/Preferences"), "prefs");

        assert_eq!(store.commit(&workspace).await.unwrap(), CommitOutcome::Saved);
        assert_eq!(read(&session.join("Cookies")), "fresh");
        assert_eq!(read(&session.join("Default/Preferences")), "prefs");
        assert_eq!(names(&session), vec!["Cookies", "Default"]);
        assert_eq!(names(tmp.path()), vec!["session", "ws"]);
        store.release(workspace).await;
    }

    /// A mount point cannot be removed or renamed over; the directory must
    /// survive the commit as the same inode
    #[cfg(unix)]
    #[tokio::test]
    async fn commit_into_empty_session_dir_keeps_the_directory() {
        use std::os::unix::fs::MetadataExt;

        let tmp = tempdir().unwrap();
        let session = tmp.path().join("session");
        fs::create_dir_all(&session).unwrap();
        let inode = fs::metadata(&session).unwrap().ino();
        let store = SessionStore::new(&session).with_workspace_root(tmp.path().join("ws"));

        let workspace = store.acquire_working_copy().await.unwrap();
        write(&workspace.profile_dir().join("Cookies"), "fresh");

        assert_eq!(store.commit(&workspace).await.unwrap(), CommitOutcome::Saved);
        assert_eq!(fs::metadata(&session).unwrap().ino(), inode);
        assert_eq!(read(&session.join("Cookies")), "fresh");
        store.release(workspace).await;
    }

    #[cfg(unix)]
    #[test]
    fn failed_fill_takes_moved_entries_back_out() {
        let tmp = tempdir().unwrap();
        let source = tmp.path().join("profile");
        write(&source.join("Cookies"), "fresh");
        write(&source.join("Local State"), "state");
        let session = tmp.path().join("session");
        // A file cannot be renamed onto a directory
        write(&session.join("Local State/keep"), "existing");

        let err = fill_in_place(&source, &session).unwrap_err();

        assert!(matches!(err, StorageError::Io { .. }));
        assert_eq!(names(&session), vec!["Local State"]);
        assert_eq!(read(&session.join("Local State/keep")), "existing");
        assert_eq!(read(&source.join("Cookies")), "fresh");
    }

    #[tokio::test]
    async fn commit_skips_empty_workspace() {
        let tmp = tempdir().unwrap();
        let session = tmp.path().join("session");
        let store = SessionStore::new(&session).with_workspace_root(tmp.path().join("ws"));

        let workspace = store.acquire_working_copy().await.unwrap();
        assert_eq!(
            store.commit(&workspace).await.unwrap(),
            CommitOutcome::EmptyWorkspace
        );
        assert!(!session.exists());
        store.release(workspace).await;
    }

    #[test]
    fn lock_path_is_a_sibling() {
        let store = SessionStore::new("/var/lib/chat/profile");
        assert_eq!(store.lock_path(), PathBuf::from("/var/lib/chat/profile.lock"));
    }

    #[tokio::test(start_paused = true)]
    async fn second_lock_waits_then_times_out() {
        let tmp = tempdir().unwrap();
        let store = SessionStore::new(tmp.path().join("session"));

        let held = store.lock(Duration::from_secs(1)).await.unwrap();
        let contended = store.lock(Duration::from_secs(2)).await;
        assert!(matches!(contended, Err(StorageError::LockTimeout { .. })));

        drop(held);
        let reacquired = store.lock(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reacquired.path(), store.lock_path().as_path());
    }
}

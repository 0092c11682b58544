//! The shared output directory and the files requests create inside it.
//!
//! Every path handed out by [`OutputDirectory::reserve`] is leased until its
//! [`ScratchFile`] is dropped or persisted. The retention sweeper skips leased
//! paths, so a file a request is still working on is never reclaimed.

use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct OutputDirectory {
    root: PathBuf,
    leases: Arc<Mutex<HashSet<PathBuf>>>,
}

impl OutputDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            leases: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Creates the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let directory = Self::new(root);
        tokio::fs::create_dir_all(&directory.root).await?;
        Ok(directory)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Timestamp plus a random suffix, unique across requests and restarts.
    pub fn unique_stem(&self) -> String {
        format!(
            "{}-{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            Uuid::new_v4().simple()
        )
    }

    pub fn reserve(&self, file_name: &str) -> ScratchFile {
        let path = self.root.join(file_name);
        self.leases.lock().insert(path.clone());
        ScratchFile {
            path,
            leases: Arc::clone(&self.leases),
            keep: false,
        }
    }

    /// A leased path also covers the in-progress files the extractor writes
    /// next to it.
    pub fn is_leased(&self, path: &Path) -> bool {
        let leases = self.leases.lock();
        if leases.contains(path) {
            return true;
        }

        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            return false;
        };
        leases.iter().any(|leased| {
            leased.parent() == path.parent()
                && leased
                    .file_name()
                    .and_then(|target| target.to_str())
                    .is_some_and(|target| is_partial_of(name, target))
        })
    }

    /// Maps a requested download name to a file inside the directory.
    /// Anything that is not a bare, visible file name is refused.
    pub async fn resolve_download(&self, file_name: &str) -> Option<PathBuf> {
        if !is_plain_file_name(file_name) {
            return None;
        }

        let path = self.root.join(file_name);
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Some(path),
            Ok(_) => None,
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    warn!("Could not stat download {:?}: {error}", path);
                }
                None
            }
        }
    }
}

fn is_plain_file_name(value: &str) -> bool {
    if value.is_empty() || value.starts_with('.') || value.contains(['/', '\\', '\0']) {
        return false;
    }

    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// A leased path in the output directory. Removed on drop unless persisted.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    leases: Arc<Mutex<HashSet<PathBuf>>>,
    keep: bool,
}

impl ScratchFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    /// Keeps the file on disk and hands its retention over to the sweeper.
    /// The modification time is reset so the retention age counts from here.
    pub fn persist(mut self) -> PathBuf {
        self.keep = true;
        if let Err(error) = touch(&self.path) {
            warn!("Could not refresh modification time of {:?}: {error}", self.path);
        }
        self.path.clone()
    }
}

fn touch(path: &Path) -> std::io::Result<()> {
    std::fs::File::options()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::now())
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        self.leases.lock().remove(&self.path);
        if self.keep {
            return;
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed intermediate file {:?}", self.path),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not remove intermediate file {:?}: {error}", self.path),
        }
        remove_partials(&self.path);
    }
}

/// `<name>.part`, `<name>.ytdl` and `<name>.part-Frag*` belong to an
/// unfinished extractor download of `<name>`.
fn is_partial_of(candidate: &str, target: &str) -> bool {
    candidate.strip_prefix(target).is_some_and(|suffix| {
        matches!(suffix, ".part" | ".ytdl") || suffix.starts_with(".part-Frag")
    })
}

/// Removes the extractor's in-progress files for `path` and returns how many
/// were deleted. Runs from `Drop`, so it stays synchronous.
pub fn remove_partials(path: &Path) -> usize {
    let Some(target) = path.file_name().and_then(|name| name.to_str()) else {
        return 0;
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not scan {:?} for partial downloads: {error}", dir);
            }
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        if !file_name
            .to_str()
            .is_some_and(|name| is_partial_of(name, target))
        {
            continue;
        }

        let partial = entry.path();
        match std::fs::remove_file(&partial) {
            Ok(()) => {
                debug!("Removed partial download {:?}", partial);
                removed += 1;
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not remove partial download {:?}: {error}", partial),
        }
    }

    removed
}

/// An artifact on disk at some stage of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFile {
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl MediaFile {
    pub async fn inspect(path: &Path) -> std::io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            size_bytes: metadata.len(),
        })
    }
}

/// Size of a regular file, or `None` when it is missing or empty.
pub async fn non_empty_len(path: &Path) -> std::io::Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() && metadata.len() > 0 => Ok(Some(metadata.len())),
        Ok(_) => Ok(None),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error),
    }
}

/// Removes a file, treating an already-missing file as success.
pub async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(error) if error.kind() != ErrorKind::NotFound => Err(error),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_stems_do_not_repeat() {
        let output = OutputDirectory::new("/tmp/unused");
        let stems: HashSet<String> = (0..200).map(|_| output.unique_stem()).collect();
        assert_eq!(stems.len(), 200);
    }

    #[test]
    fn dropping_scratch_file_removes_it_and_releases_lease() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputDirectory::new(dir.path());

        let scratch = output.reserve("clip_video.mp4");
        let path = scratch.path().to_path_buf();
        std::fs::write(&path, b"partial").unwrap();
        assert!(output.is_leased(&path));

        drop(scratch);
        assert!(!path.exists());
        assert!(!output.is_leased(&path));
    }

    #[test]
    fn persisted_scratch_file_stays_on_disk_unleased() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputDirectory::new(dir.path());

        let scratch = output.reserve("clip.mp4");
        std::fs::write(scratch.path(), b"done").unwrap();
        let path = scratch.persist();

        assert!(path.exists());
        assert!(!output.is_leased(&path));
    }

    #[test]
    fn persisting_restarts_the_retention_clock() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputDirectory::new(dir.path());
        let scratch = output.reserve("slow.mp4");
        let hour_ago = SystemTime::now() - std::time::Duration::from_secs(3_600);
        std::fs::File::create(scratch.path())
            .unwrap()
            .set_modified(hour_ago)
            .unwrap();

        let path = scratch.persist();
        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert!(modified > hour_ago + std::time::Duration::from_secs(3_000));
    }

    #[test]
    fn dropping_scratch_file_removes_extractor_partials_only() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputDirectory::new(dir.path());
        let scratch = output.reserve("clip_video.mp4");
        for name in [
            "clip_video.mp4.part",
            "clip_video.mp4.ytdl",
            "clip_video.mp4.part-Frag12",
            "clip_audio.m4a.part",
            "clip_video.mp4.partial-notes",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        drop(scratch);

        let mut left: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["clip_audio.m4a.part", "clip_video.mp4.partial-notes"]);
    }

    #[test]
    fn partial_files_share_the_lease_of_their_destination() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputDirectory::new(dir.path());
        let _scratch = output.reserve("clip_video.mp4");

        assert!(output.is_leased(&dir.path().join("clip_video.mp4.part")));
        assert!(output.is_leased(&dir.path().join("clip_video.mp4.part-Frag3")));
        assert!(!output.is_leased(&dir.path().join("clip_video.mp4.bak")));
        assert!(!output.is_leased(&dir.path().join("other.mp4.part")));
    }

    #[tokio::test]
    async fn resolve_download_only_accepts_bare_existing_names() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputDirectory::new(dir.path());
        std::fs::write(dir.path().join("clip.mp4"), b"data").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        assert_eq!(
            output.resolve_download("clip.mp4").await,
            Some(dir.path().join("clip.mp4"))
        );
        for name in ["", "missing.mp4", "nested", "../clip.mp4", "nested/clip.mp4", ".hidden", "..", "a\\b"] {
            assert_eq!(output.resolve_download(name).await, None, "{name}");
        }
    }

    #[tokio::test]
    async fn non_empty_len_distinguishes_missing_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.mp4");
        let full = dir.path().join("full.mp4");
        std::fs::write(&empty, b"").unwrap();
        std::fs::write(&full, b"1234").unwrap();

        assert_eq!(non_empty_len(&empty).await.unwrap(), None);
        assert_eq!(non_empty_len(&full).await.unwrap(), Some(4));
        assert_eq!(non_empty_len(&dir.path().join("nope")).await.unwrap(), None);
    }
}

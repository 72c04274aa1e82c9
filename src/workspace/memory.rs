use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::orchestration::track::TrackId;
use crate::workspace::{Artifact, MergeOutcome, WorkspaceBackend};
use crate::{clog_debug, Error, Result};

type Tree = BTreeMap<String, String>;

struct TrackSpace {
    /// Shared tree as it was when the track opened.
    base: Arc<Tree>,
    staged: Tree,
    committed: Tree,
}

struct MemoryInner {
    shared: Arc<Tree>,
    revision: u64,
    tracks: HashMap<TrackId, TrackSpace>,
}

/// In-process workspace backend.
///
/// Tracks fork a copy-on-write snapshot of the shared tree. A merge
/// conflicts on any path the shared tree changed since the snapshot to a
/// value other than the track's own.
pub struct MemoryWorkspace {
    inner: Mutex<MemoryInner>,
}

impl MemoryWorkspace {
    pub fn new() -> Self {
        Self::with_files(std::iter::empty::<(String, String)>())
    }

    pub fn with_files<I, K, V>(files: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let shared: Tree = files
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            inner: Mutex::new(MemoryInner {
                shared: Arc::new(shared),
                revision: 0,
                tracks: HashMap::new(),
            }),
        }
    }

    pub fn revision(&self) -> Result<u64> {
        Ok(self.lock()?.revision)
    }

    /// Write straight to the shared tree, as an out-of-band change would.
    pub fn write_shared(&self, path: &str, content: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let mut tree = (*inner.shared).clone();
        tree.insert(path.to_string(), content.to_string());
        inner.shared = Arc::new(tree);
        inner.revision += 1;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Validation("memory workspace lock poisoned".into()))
    }
}

impl Default for MemoryWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

fn track_space<'a>(inner: &'a mut MemoryInner, track: &TrackId) -> Result<&'a mut TrackSpace> {
    inner
        .tracks
        .get_mut(track)
        .ok_or(Error::TrackNotFound(*track))
}

impl WorkspaceBackend for MemoryWorkspace {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&self, track: &TrackId, name: &str) -> Result<Option<PathBuf>> {
        let mut inner = self.lock()?;
        let base = Arc::clone(&inner.shared);
        inner.tracks.entry(*track).or_insert_with(|| TrackSpace {
            base,
            staged: Tree::new(),
            committed: Tree::new(),
        });
        clog_debug!("MemoryWorkspace::open track={} name={}", track.short(), name);
        Ok(None)
    }

    fn path(&self, _track: &TrackId) -> Option<PathBuf> {
        None
    }

    fn stage(&self, track: &TrackId, artifact: &Artifact) -> Result<()> {
        let mut inner = self.lock()?;
        track_space(&mut inner, track)?
            .staged
            .insert(artifact.path.clone(), artifact.content.clone());
        Ok(())
    }

    fn commit(&self, track: &TrackId, message: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let space = track_space(&mut inner, track)?;
        let staged = std::mem::take(&mut space.staged);
        clog_debug!(
            "MemoryWorkspace::commit track={} files={} message={}",
            track.short(),
            staged.len(),
            message
        );
        space.committed.extend(staged);
        Ok(())
    }

    fn uncommitted(&self, track: &TrackId) -> Result<Vec<String>> {
        let mut inner = self.lock()?;
        Ok(track_space(&mut inner, track)?.staged.keys().cloned().collect())
    }

    fn merge(&self, track: &TrackId) -> Result<MergeOutcome> {
        let mut inner = self.lock()?;
        let shared = Arc::clone(&inner.shared);
        let space = track_space(&mut inner, track)?;

        let conflicts: Vec<String> = space
            .committed
            .iter()
            .filter(|(path, content)| {
                let ours = shared.get(*path);
                ours != space.base.get(*path) && ours != Some(*content)
            })
            .map(|(path, _)| path.clone())
            .collect();

        if !conflicts.is_empty() {
            return Ok(MergeOutcome::Conflict { paths: conflicts });
        }

        let mut tree = (*shared).clone();
        tree.extend(space.committed.clone());
        inner.shared = Arc::new(tree);
        inner.revision += 1;
        let revision = format!("mem-{}", inner.revision);
        inner.tracks.remove(track);
        Ok(MergeOutcome::Merged { revision })
    }

    fn resolve(&self, track: &TrackId) -> Result<()> {
        let mut inner = self.lock()?;
        let shared = Arc::clone(&inner.shared);
        let space = track_space(&mut inner, track)?;
        let staged = std::mem::take(&mut space.staged);
        space.committed.extend(staged);
        space.base = shared;
        clog_debug!(
            "MemoryWorkspace::resolve track={} files={}",
            track.short(),
            space.committed.len()
        );
        Ok(())
    }

    fn discard(&self, track: &TrackId) -> Result<()> {
        self.lock()?.tracks.remove(track);
        Ok(())
    }

    fn read(&self, track: &TrackId, path: &str) -> Result<Option<String>> {
        let mut inner = self.lock()?;
        let space = track_space(&mut inner, track)?;
        Ok(space
            .staged
            .get(path)
            .or_else(|| space.committed.get(path))
            .or_else(|| space.base.get(path))
            .cloned())
    }

    fn read_shared(&self, path: &str) -> Result<Option<String>> {
        Ok(self.lock()?.shared.get(path).cloned())
    }
}

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use git2::build::CheckoutBuilder;
use git2::{
    BranchType, Commit, ErrorCode, FileFavor, IndexAddOption, MergeOptions, Oid, Repository,
    Signature, StatusOptions,
};

use crate::orchestration::track::TrackId;
use crate::util::slugify;
use crate::workspace::{Artifact, MergeOutcome, WorkspaceBackend};
use crate::{clog_debug, clog_warn, Error, Result};

const TRACK_BRANCH_PREFIX: &str = "cadence/track";

#[derive(Debug, Clone)]
struct GitTrack {
    branch: String,
    path: PathBuf,
}

/// Git-backed workspaces: one branch and worktree per track.
///
/// Track branches fork from the integration branch. Merging folds a track
/// branch into the integration branch without touching any checkout.
pub struct GitWorkspace {
    repo_path: PathBuf,
    worktrees_dir: PathBuf,
    integration_branch: String,
    tracks: Mutex<HashMap<TrackId, GitTrack>>,
}

impl GitWorkspace {
    /// Open the repository and make sure the integration branch exists.
    ///
    /// A missing integration branch is created at the current HEAD.
    pub fn new(repo_path: &Path, worktrees_dir: &Path, integration_branch: &str) -> Result<Self> {
        clog_debug!(
            "GitWorkspace::new repo={} worktrees={} integration={}",
            repo_path.display(),
            worktrees_dir.display(),
            integration_branch
        );
        let repo = Repository::discover(repo_path)?;
        if let Err(e) = repo.find_branch(integration_branch, BranchType::Local) {
            if e.code() != ErrorCode::NotFound {
                return Err(e.into());
            }
            let head = repo.head()?.peel_to_commit()?;
            repo.branch(integration_branch, &head, false)?;
            clog_debug!("Created integration branch {} at {}", integration_branch, head.id());
        }
        fs::create_dir_all(worktrees_dir)?;

        let repo_path = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo.path().to_path_buf());

        Ok(Self {
            repo_path,
            worktrees_dir: worktrees_dir.to_path_buf(),
            integration_branch: integration_branch.to_string(),
            tracks: Mutex::new(HashMap::new()),
        })
    }

    pub fn integration_branch(&self) -> &str {
        &self.integration_branch
    }

    /// Commit id at the tip of the integration branch.
    pub fn integration_head(&self) -> Result<String> {
        let repo = self.repo()?;
        let id = self.integration_commit(&repo)?.id().to_string();
        Ok(id)
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.repo_path)?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<TrackId, GitTrack>>> {
        self.tracks
            .lock()
            .map_err(|_| Error::Validation("git workspace lock poisoned".into()))
    }

    fn track(&self, track: &TrackId) -> Result<GitTrack> {
        self.lock()?
            .get(track)
            .cloned()
            .ok_or(Error::TrackNotFound(*track))
    }

    fn integration_commit<'r>(&self, repo: &'r Repository) -> Result<Commit<'r>> {
        let branch = repo.find_branch(&self.integration_branch, BranchType::Local)?;
        Ok(branch.into_reference().peel_to_commit()?)
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        Ok(repo
            .signature()
            .or_else(|_| Signature::now("cadence", "cadence@localhost"))?)
    }

    /// Remove a worktree, its admin directory, and its branch.
    fn remove(&self, entry: &GitTrack) -> Result<()> {
        let repo = self.repo()?;
        let folder = entry
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from);

        if let Some(name) = &folder {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    clog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
            // A leftover admin dir makes git think the branch is still checked out.
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                let _ = fs::remove_dir_all(&admin_dir);
            }
        }

        if entry.path.exists() {
            fs::remove_dir_all(&entry.path)?;
        }

        match repo.find_branch(&entry.branch, BranchType::Local) {
            Ok(mut branch) => {
                if let Err(e) = branch.delete() {
                    clog_warn!("Failed to delete branch '{}': {}", entry.branch, e);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

fn conflict_path(entry: &git2::IndexEntry) -> String {
    String::from_utf8_lossy(&entry.path).into_owned()
}

impl WorkspaceBackend for GitWorkspace {
    fn name(&self) -> &'static str {
        "git"
    }

    fn open(&self, track: &TrackId, name: &str) -> Result<Option<PathBuf>> {
        if let Some(existing) = self.lock()?.get(track) {
            return Ok(Some(existing.path.clone()));
        }

        let slug = format!("{}-{}", slugify(name, "track"), track.short());
        let branch = format!("{}/{}", TRACK_BRANCH_PREFIX, slug);
        let path = self.worktrees_dir.join(&slug);

        if path.exists() {
            clog_debug!("GitWorkspace::open reattaching {}", path.display());
        } else {
            let repo = self.repo()?;
            let reference = match repo.find_branch(&branch, BranchType::Local) {
                Ok(existing) => existing.into_reference(),
                Err(e) if e.code() == ErrorCode::NotFound => {
                    let base = self.integration_commit(&repo)?;
                    repo.branch(&branch, &base, false)?.into_reference()
                }
                Err(e) => return Err(e.into()),
            };
            let mut opts = git2::WorktreeAddOptions::new();
            opts.reference(Some(&reference));
            repo.worktree(&slug, &path, Some(&opts))?;
            clog_debug!("GitWorkspace::open branch={} path={}", branch, path.display());
        }

        self.lock()?.insert(
            *track,
            GitTrack {
                branch,
                path: path.clone(),
            },
        );
        Ok(Some(path))
    }

    fn path(&self, track: &TrackId) -> Option<PathBuf> {
        self.lock().ok()?.get(track).map(|t| t.path.clone())
    }

    fn stage(&self, track: &TrackId, artifact: &Artifact) -> Result<()> {
        let entry = self.track(track)?;
        let target = entry.path.join(&artifact.path);
        if !target.starts_with(&entry.path) || artifact.path.contains("..") {
            return Err(Error::Validation(format!(
                "artifact path escapes workspace: {}",
                artifact.path
            )));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, &artifact.content)?;
        Ok(())
    }

    fn commit(&self, track: &TrackId, message: &str) -> Result<()> {
        let entry = self.track(track)?;
        let repo = Repository::open(&entry.path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;

        let parent = repo.head()?.peel_to_commit()?;
        if parent.tree_id() == tree_id {
            clog_debug!("GitWorkspace::commit nothing to commit in {}", entry.branch);
            return Ok(());
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(&repo)?;
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
        clog_debug!("GitWorkspace::commit {} on {}", commit_id, entry.branch);
        Ok(())
    }

    fn uncommitted(&self, track: &TrackId) -> Result<Vec<String>> {
        let entry = self.track(track)?;
        let repo = Repository::open(&entry.path)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        let mut paths: Vec<String> = statuses
            .iter()
            .filter_map(|s| s.path().map(String::from))
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn merge(&self, track: &TrackId) -> Result<MergeOutcome> {
        let entry = self.track(track)?;
        let repo = self.repo()?;
        let ours = self.integration_commit(&repo)?;
        let theirs = repo
            .find_branch(&entry.branch, BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        let refname = format!("refs/heads/{}", self.integration_branch);

        let revision: Oid = if ours.id() == theirs.id()
            || repo.graph_descendant_of(ours.id(), theirs.id())?
        {
            ours.id()
        } else if repo.graph_descendant_of(theirs.id(), ours.id())? {
            repo.find_reference(&refname)?
                .set_target(theirs.id(), &format!("cadence: fast-forward {}", entry.branch))?;
            theirs.id()
        } else {
            let mut index = repo.merge_commits(&ours, &theirs, None)?;
            if index.has_conflicts() {
                let mut paths = Vec::new();
                for conflict in index.conflicts()? {
                    let conflict = conflict?;
                    if let Some(e) = conflict
                        .our
                        .as_ref()
                        .or(conflict.their.as_ref())
                        .or(conflict.ancestor.as_ref())
                    {
                        paths.push(conflict_path(e));
                    }
                }
                paths.sort();
                paths.dedup();
                clog_debug!("GitWorkspace::merge conflicts in {}: {:?}", entry.branch, paths);
                return Ok(MergeOutcome::Conflict { paths });
            }
            let tree_id = index.write_tree_to(&repo)?;
            let tree = repo.find_tree(tree_id)?;
            let sig = Self::signature(&repo)?;
            let message = format!("Merge {} into {}", entry.branch, self.integration_branch);
            repo.commit(Some(refname.as_str()), &sig, &sig, &message, &tree, &[&ours, &theirs])?
        };

        clog_debug!("GitWorkspace::merge {} -> {}", entry.branch, revision);
        self.remove(&entry)?;
        self.lock()?.remove(track);
        Ok(MergeOutcome::Merged {
            revision: revision.to_string(),
        })
    }

    fn resolve(&self, track: &TrackId) -> Result<()> {
        self.commit(track, "cadence: operator resolution")?;
        let entry = self.track(track)?;
        let repo = Repository::open(&entry.path)?;
        let head = repo.head()?.peel_to_commit()?;
        let integration = self.integration_commit(&repo)?;
        if head.id() == integration.id() || repo.graph_descendant_of(head.id(), integration.id())? {
            return Ok(());
        }

        let mut opts = MergeOptions::new();
        opts.file_favor(FileFavor::Ours);
        let mut index = repo.merge_commits(&head, &integration, Some(&opts))?;
        if index.has_conflicts() {
            let mut paths = Vec::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                if let Some(e) = conflict.our.as_ref().or(conflict.their.as_ref()) {
                    paths.push(conflict_path(e));
                }
            }
            paths.sort();
            paths.dedup();
            return Err(Error::MergeConflict {
                track: *track,
                paths,
            });
        }

        let tree_id = index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(&repo)?;
        let message = format!("Resolve {} against {}", entry.branch, self.integration_branch);
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[&head, &integration])?;
        repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
        clog_debug!("GitWorkspace::resolve {} at {}", entry.branch, commit_id);
        Ok(())
    }

    fn discard(&self, track: &TrackId) -> Result<()> {
        let entry = self.lock()?.remove(track);
        match entry {
            Some(entry) => self.remove(&entry),
            None => Ok(()),
        }
    }

    fn read(&self, track: &TrackId, path: &str) -> Result<Option<String>> {
        let entry = self.track(track)?;
        match fs::read_to_string(entry.path.join(path)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_shared(&self, path: &str) -> Result<Option<String>> {
        let repo = self.repo()?;
        let tree = self.integration_commit(&repo)?.tree()?;
        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let object = entry.to_object(&repo)?;
        Ok(object
            .as_blob()
            .map(|blob| String::from_utf8_lossy(blob.content()).into_owned()))
    }
}

//! Session-scoped artifact store.
//!
//! Every document run gets its own directory:
//!
//! ```text
//! <output_root>/
//!   <document>_<YYYYmmdd_HHMMSS>/
//!     session.json            manifest (state, timestamps)
//!     converted_images/       Stage 1
//!     corrected_images/       Stage 2
//!     …
//!     extraction/             Stage 7 (results + aggregate)
//! ```
//!
//! Artifacts are addressed by `(session, stage, key)`. Writes go through a
//! temp file in the same directory followed by a rename, so a reader never
//! sees half an image even if the process dies mid-write. A failed run leaves
//! every intermediate artifact in place for inspection. Artifacts are only
//! removed by [`SessionStore::cleanup`], or when a closed session is reopened
//! under the same id and its stage directories start empty again.

use crate::error::PipelineError;
use crate::stage::{StageId, STAGES};
use chrono::{DateTime, Local, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MANIFEST: &str = "session.json";
/// Held from open until close; a crashed run leaves it behind.
const LOCK: &str = ".session.lock";

/// Lifecycle of a session directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Open,
    Completed,
    Failed,
    Closed,
}

/// Contents of `session.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub session_id: String,
    pub document_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Handle to one open session.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub document_id: String,
    pub created_at: DateTime<Utc>,
    /// `<output_root>/<session_id>`
    pub root: PathBuf,
}

/// Filesystem-backed store of session artifacts.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open a new session named `<document_id>_<YYYYmmdd_HHMMSS>`.
    ///
    /// Two sessions for the same document opened within the same second get
    /// `_2`, `_3`, … suffixes instead of colliding. The directory itself is
    /// the claim, so concurrent openers never share one.
    pub fn open(&self, document_id: &str) -> Result<Session, PipelineError> {
        std::fs::create_dir_all(&self.root).map_err(|e| PipelineError::io(&self.root, e))?;
        let base = format!(
            "{}_{}",
            sanitize(document_id),
            Local::now().format("%Y%m%d_%H%M%S")
        );
        let mut n = 1;
        loop {
            let candidate = if n == 1 { base.clone() } else { format!("{base}_{n}") };
            let root = self.root.join(&candidate);
            match std::fs::create_dir(&root) {
                Ok(()) => return self.claim(document_id, &candidate, root),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
                Err(e) => return Err(PipelineError::io(&root, e)),
            }
        }
    }

    /// Open a session with an explicit id.
    ///
    /// Fails with [`PipelineError::SessionConflict`] while another run holds
    /// the id open. A completed or failed session may be reopened; every
    /// stage directory of the previous run is removed first.
    pub fn open_with_id(&self, document_id: &str, session_id: &str) -> Result<Session, PipelineError> {
        validate_segment(session_id)?;
        let root = self.root.join(session_id);
        std::fs::create_dir_all(&root).map_err(|e| PipelineError::io(&root, e))?;
        self.claim(document_id, session_id, root)
    }

    /// Take the session lock, then write an `open` manifest.
    ///
    /// The lock is created with `create_new`, so exactly one opener wins;
    /// it is released by [`SessionStore::close`].
    fn claim(&self, document_id: &str, session_id: &str, root: PathBuf) -> Result<Session, PipelineError> {
        let lock_path = root.join(LOCK);
        match std::fs::OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(PipelineError::SessionConflict {
                    session_id: session_id.to_string(),
                })
            }
            Err(e) => return Err(PipelineError::io(&lock_path, e)),
        }

        let opened = self.start(document_id, session_id, root);
        if opened.is_err() {
            if let Err(e) = std::fs::remove_file(&lock_path) {
                warn!("Could not release {}: {}", lock_path.display(), e);
            }
        }
        opened
    }

    fn start(&self, document_id: &str, session_id: &str, root: PathBuf) -> Result<Session, PipelineError> {
        let manifest_path = root.join(MANIFEST);
        let now = Utc::now();

        let created_at = if manifest_path.exists() {
            let existing = self.read_manifest(&manifest_path)?;
            if existing.state == SessionState::Open {
                return Err(PipelineError::SessionConflict {
                    session_id: session_id.to_string(),
                });
            }
            info!("Reopening session {} (was {:?})", session_id, existing.state);
            reset_stage_dirs(&root)?;
            existing.created_at
        } else {
            now
        };

        let manifest = SessionManifest {
            session_id: session_id.to_string(),
            document_id: document_id.to_string(),
            state: SessionState::Open,
            created_at,
            updated_at: now,
        };
        write_json_atomic(&manifest_path, &manifest)?;
        debug!("Session {} opened at {}", session_id, root.display());

        Ok(Session {
            session_id: session_id.to_string(),
            document_id: document_id.to_string(),
            created_at,
            root,
        })
    }

    /// Directory owned by `stage` inside `session`.
    pub fn stage_dir(&self, session: &Session, stage: StageId) -> PathBuf {
        session.root.join(stage.dir())
    }

    /// Store an artifact. Overwriting an existing key logs a warning.
    pub fn put(
        &self,
        session: &Session,
        stage: StageId,
        key: &str,
        payload: &[u8],
    ) -> Result<PathBuf, PipelineError> {
        validate_segment(key)?;
        let dir = self.stage_dir(session, stage);
        std::fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
        let path = dir.join(key);
        if path.exists() {
            warn!("Overwriting artifact {}/{} in session {}", stage.dir(), key, session.session_id);
        }
        write_atomic(&path, payload)?;
        debug!("put {}/{} ({} bytes)", stage.dir(), key, payload.len());
        Ok(path)
    }

    /// Fetch an artifact, failing with [`PipelineError::ArtifactNotFound`].
    pub fn get(&self, session: &Session, stage: StageId, key: &str) -> Result<Vec<u8>, PipelineError> {
        validate_segment(key)?;
        let path = self.stage_dir(session, stage).join(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PipelineError::ArtifactNotFound {
                session_id: session.session_id.clone(),
                stage: stage.dir().to_string(),
                key: key.to_string(),
            }),
            Err(e) => Err(PipelineError::io(path, e)),
        }
    }

    pub fn contains(&self, session: &Session, stage: StageId, key: &str) -> bool {
        self.stage_dir(session, stage).join(key).is_file()
    }

    /// Store a value as pretty-printed JSON.
    pub fn put_json<T: Serialize>(
        &self,
        session: &Session,
        stage: StageId,
        key: &str,
        value: &T,
    ) -> Result<PathBuf, PipelineError> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| PipelineError::serialization(format!("{}/{}", stage.dir(), key), e))?;
        self.put(session, stage, key, &bytes)
    }

    /// Fetch and decode a JSON artifact.
    pub fn get_json<T: DeserializeOwned>(
        &self,
        session: &Session,
        stage: StageId,
        key: &str,
    ) -> Result<T, PipelineError> {
        let bytes = self.get(session, stage, key)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::serialization(format!("{}/{}", stage.dir(), key), e))
    }

    /// Artifact keys of a stage, sorted. Empty when the stage never wrote.
    pub fn list(&self, session: &Session, stage: StageId) -> Result<Vec<String>, PipelineError> {
        let dir = self.stage_dir(session, stage);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::io(dir, e)),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PipelineError::io(&dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // in-flight temp files
            if name.starts_with('.') {
                continue;
            }
            keys.push(name);
        }
        keys.sort();
        Ok(keys)
    }

    /// Current manifest of a session.
    pub fn manifest(&self, session: &Session) -> Result<SessionManifest, PipelineError> {
        self.read_manifest(&session.root.join(MANIFEST))
    }

    /// Record the final state of a session and release its lock.
    /// Artifacts are kept.
    pub fn close(&self, session: &Session, state: SessionState) -> Result<(), PipelineError> {
        let path = session.root.join(MANIFEST);
        let mut manifest = self.read_manifest(&path)?;
        manifest.state = state;
        manifest.updated_at = Utc::now();
        write_json_atomic(&path, &manifest)?;
        if state != SessionState::Open {
            let lock_path = session.root.join(LOCK);
            match std::fs::remove_file(&lock_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(PipelineError::io(lock_path, e)),
            }
        }
        info!("Session {} closed as {:?}", session.session_id, state);
        Ok(())
    }

    /// Remove the session directory and everything in it.
    pub fn cleanup(&self, session: &Session) -> Result<(), PipelineError> {
        match std::fs::remove_dir_all(&session.root) {
            Ok(()) => {
                info!("Removed session {}", session.session_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::io(&session.root, e)),
        }
    }

    fn read_manifest(&self, path: &Path) -> Result<SessionManifest, PipelineError> {
        let bytes = std::fs::read(path).map_err(|e| PipelineError::io(path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| PipelineError::serialization(MANIFEST, e))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn write_atomic(path: &Path, payload: &[u8]) -> Result<(), PipelineError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| PipelineError::io(dir, e))?;
    tmp.write_all(payload).map_err(|e| PipelineError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| PipelineError::io(path, e.error))?;
    Ok(())
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PipelineError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| PipelineError::serialization(path.display().to_string(), e))?;
    write_atomic(path, &bytes)
}

fn reset_stage_dirs(root: &Path) -> Result<(), PipelineError> {
    for stage in &STAGES {
        let dir = root.join(stage.dir);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => debug!("Cleared {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PipelineError::io(dir, e)),
        }
    }
    Ok(())
}

/// Keys and session ids are single path segments.
fn validate_segment(segment: &str) -> Result<(), PipelineError> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\'])
        || segment.starts_with('.')
    {
        return Err(PipelineError::InvalidInput {
            input: segment.to_string(),
        });
    }
    Ok(())
}

/// Make a document id usable as a directory name prefix.
fn sanitize(document_id: &str) -> String {
    let cleaned: String = document_id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "document".to_string()
    } else {
        cleaned
    }
}

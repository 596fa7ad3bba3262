//! Resource policies that mediate every external reference the guest can
//! trigger.
//!
//! Each request is two-phase: [`LoaderPolicy::sanitize`] vets and normalizes
//! the URI, then [`LoaderPolicy::load`] fetches the vetted form. `load` only
//! accepts a [`SanitizedUri`], and [`sanitize_and_load`] is the one place the
//! two are composed.
//!
//! Variants:
//! - [`DenyPolicy`]: refuses everything (the default)
//! - [`NetworkPolicy`](crate::NetworkPolicy): http/https with base URL and domain allow-list
//! - [`FilePolicy`]: relative paths under one base directory, symlink-contained
//! - [`StaticPolicy`]: serves a fixed JSON value for every request
//! - [`FallbackPolicy`]: tries children in order

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cap_std::ambient_authority;
use cap_std::fs::Dir;

use crate::error::{Error, SanitizeError};

/// A URI that passed `sanitize` on some policy.
///
/// Policies construct this only from their own `sanitize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedUri(String);

impl SanitizedUri {
    pub fn new(vetted: impl Into<String>) -> Self {
        Self(vetted.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SanitizedUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Policies holding an OS resource expose this. `close` must be idempotent.
pub trait Releasable {
    fn close(&self) -> Result<(), Error>;
}

#[async_trait]
pub trait LoaderPolicy: Send + Sync {
    /// Validate and normalize `uri`. Errors deny access.
    fn sanitize(&self, uri: &str) -> Result<SanitizedUri, SanitizeError>;

    /// Fetch the content of a URI previously vetted by `sanitize` on this
    /// same policy.
    async fn load(&self, uri: &SanitizedUri) -> Result<Vec<u8>, Error>;

    /// `Some` when the policy owns a resource that must be released.
    fn releasable(&self) -> Option<&dyn Releasable> {
        None
    }
}

/// Sanitize then load against the same policy.
pub async fn sanitize_and_load(policy: &dyn LoaderPolicy, uri: &str) -> Result<Vec<u8>, Error> {
    let vetted = policy.sanitize(uri)?;
    policy.load(&vetted).await
}

// ============================================================================
// Deny
// ============================================================================

/// Denies all resource loading.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyPolicy;

#[async_trait]
impl LoaderPolicy for DenyPolicy {
    fn sanitize(&self, uri: &str) -> Result<SanitizedUri, SanitizeError> {
        Err(SanitizeError::Denied { uri: uri.into() })
    }

    async fn load(&self, uri: &SanitizedUri) -> Result<Vec<u8>, Error> {
        Err(SanitizeError::Denied {
            uri: uri.as_str().into(),
        }
        .into())
    }
}

// ============================================================================
// File
// ============================================================================

/// Serves files from a base directory.
///
/// Security guarantees:
/// - Only relative, scheme-less paths are accepted
/// - Lexical traversal (`../`) is rejected at sanitize time
/// - Reads resolve beneath the held directory handle, so symlink escapes and
///   a base path swapped after opening are never followed
/// - The directory handle is opened on first load and released by `close`
pub struct FilePolicy {
    base_dir: PathBuf,
    root: Mutex<RootState>,
}

enum RootState {
    Unopened,
    Open(Dir),
    Closed,
}

impl FilePolicy {
    /// The base directory is not touched until the first load.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            root: Mutex::new(RootState::Unopened),
        }
    }

    /// Open the base directory now, failing if it does not exist.
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let policy = Self::new(base_dir);
        policy.with_root(|_| Ok(()))?;
        Ok(policy)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Run `f` against the root handle, opening it on first use.
    fn with_root<T>(&self, f: impl FnOnce(&Dir) -> Result<T, Error>) -> Result<T, Error> {
        let mut state = self
            .root
            .lock()
            .map_err(|_| Error::transport(self.base_dir.display().to_string(), "root lock poisoned"))?;

        if matches!(*state, RootState::Unopened) {
            let dir = Dir::open_ambient_dir(&self.base_dir, ambient_authority()).map_err(|e| {
                Error::Construction(format!(
                    "cannot open file root {}: {}",
                    self.base_dir.display(),
                    e
                ))
            })?;
            tracing::debug!(root = %self.base_dir.display(), "opened file policy root");
            *state = RootState::Open(dir);
        }

        match &*state {
            RootState::Open(dir) => f(dir),
            _ => Err(Error::transport(
                self.base_dir.display().to_string(),
                "file policy is closed",
            )),
        }
    }
}

/// Lexically clean a path: drop `.`, fold `name/..`, keep leading `..`.
fn clean_path(path: &Path) -> PathBuf {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return PathBuf::from(".");
    }
    parts.iter().collect()
}

/// cap-std reports resolution leaving the root as `PermissionDenied`.
fn is_escape_attempt(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::PermissionDenied && e.to_string().contains("outside")
}

#[async_trait]
impl LoaderPolicy for FilePolicy {
    fn sanitize(&self, uri: &str) -> Result<SanitizedUri, SanitizeError> {
        match url::Url::parse(uri) {
            Ok(parsed) => {
                return Err(SanitizeError::UnsupportedScheme {
                    scheme: parsed.scheme().to_string(),
                    uri: uri.into(),
                })
            }
            Err(url::ParseError::RelativeUrlWithoutBase) => {}
            Err(e) => {
                return Err(SanitizeError::InvalidUri {
                    uri: uri.into(),
                    reason: e.to_string(),
                })
            }
        }

        let path = Path::new(uri);
        if path.has_root() || path.is_absolute() {
            return Err(SanitizeError::AbsolutePath { uri: uri.into() });
        }

        let cleaned = clean_path(path);
        if matches!(cleaned.components().next(), Some(Component::ParentDir)) {
            return Err(SanitizeError::PathTraversal { uri: uri.into() });
        }

        Ok(SanitizedUri::new(cleaned.to_string_lossy()))
    }

    async fn load(&self, uri: &SanitizedUri) -> Result<Vec<u8>, Error> {
        self.with_root(|dir| {
            dir.read(uri.as_str()).map_err(|e| {
                if is_escape_attempt(&e) {
                    SanitizeError::PathTraversal {
                        uri: uri.as_str().into(),
                    }
                    .into()
                } else {
                    Error::transport(uri.as_str(), e)
                }
            })
        })
    }

    fn releasable(&self) -> Option<&dyn Releasable> {
        Some(self)
    }
}

impl Releasable for FilePolicy {
    fn close(&self) -> Result<(), Error> {
        let mut state = self
            .root
            .lock()
            .map_err(|_| Error::transport(self.base_dir.display().to_string(), "root lock poisoned"))?;
        if matches!(&*state, RootState::Open(_)) {
            tracing::debug!(root = %self.base_dir.display(), "closed file policy root");
        }
        *state = RootState::Closed;
        Ok(())
    }
}

// ============================================================================
// Static
// ============================================================================

/// Returns the JSON serialization of a fixed value for every load,
/// regardless of the URI. Useful for injecting test data.
#[derive(Debug, Clone)]
pub struct StaticPolicy {
    value: serde_json::Value,
}

impl StaticPolicy {
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }
}

#[async_trait]
impl LoaderPolicy for StaticPolicy {
    fn sanitize(&self, uri: &str) -> Result<SanitizedUri, SanitizeError> {
        Ok(SanitizedUri::new(uri))
    }

    async fn load(&self, uri: &SanitizedUri) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(&self.value).map_err(|e| Error::transport(uri.as_str(), e))
    }
}

// ============================================================================
// Fallback
// ============================================================================

/// Routes a request through child policies in order.
///
/// `sanitize` accepts when any child accepts and hands back the original URI
/// untouched; `load` re-runs sanitize+load on each child and returns the first
/// success. A URI vetted by one child may therefore be served by an earlier
/// child that also accepts it.
pub struct FallbackPolicy {
    children: Vec<Arc<dyn LoaderPolicy>>,
}

impl FallbackPolicy {
    pub fn new(children: Vec<Arc<dyn LoaderPolicy>>) -> Self {
        Self { children }
    }

    fn no_children(uri: &str) -> SanitizeError {
        SanitizeError::Denied { uri: uri.into() }
    }
}

#[async_trait]
impl LoaderPolicy for FallbackPolicy {
    fn sanitize(&self, uri: &str) -> Result<SanitizedUri, SanitizeError> {
        let mut last_err = None;
        for child in &self.children {
            match child.sanitize(uri) {
                Ok(_) => return Ok(SanitizedUri::new(uri)),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Self::no_children(uri)))
    }

    async fn load(&self, uri: &SanitizedUri) -> Result<Vec<u8>, Error> {
        let mut last_err = None;
        for child in &self.children {
            match sanitize_and_load(child.as_ref(), uri.as_str()).await {
                Ok(data) => return Ok(data),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Self::no_children(uri.as_str()).into()))
    }

    fn releasable(&self) -> Option<&dyn Releasable> {
        Some(self)
    }
}

impl Releasable for FallbackPolicy {
    fn close(&self) -> Result<(), Error> {
        let mut first_err = None;
        for child in &self.children {
            if let Some(releasable) = child.releasable() {
                if let Err(e) = releasable.close() {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

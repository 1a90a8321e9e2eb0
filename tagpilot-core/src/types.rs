//! Domain types for tagpilot applications, images and write-back targets.
//!
//! All path fields use `PathBuf`; paths inside a repository are relative to the
//! repository root. All types are serializable via serde so that orchestrator
//! clients can build them straight from their API payloads.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed application name, unique across the watched fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppName(pub String);

impl fmt::Display for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for AppName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AppName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A strongly-typed Git repository URL, used as the key for write coordination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoUrl(pub String);

impl fmt::Display for RepoUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RepoUrl {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RepoUrl {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

/// A container image reference: `registry/path/name[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    /// Everything before the tag, including the registry host.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn new(name: impl Into<String>, tag: Option<&str>) -> Self {
        Self {
            name: name.into(),
            tag: tag.map(str::to_owned),
            digest: None,
        }
    }

    /// The same image pointing at `tag`, with any digest dropped.
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            name: self.name.clone(),
            tag: Some(tag.to_owned()),
            digest: None,
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl FromStr for ImageRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConfigError::InvalidImageRef(s.to_owned()));
        }

        let (rest, digest) = match s.split_once('@') {
            Some((rest, digest)) if !digest.is_empty() => (rest, Some(digest.to_owned())),
            Some(_) => return Err(ConfigError::InvalidImageRef(s.to_owned())),
            None => (s, None),
        };

        // A colon only separates the tag when it follows the last path segment;
        // `registry:5000/app` carries a port, not a tag.
        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                let tag = &rest[split + 1..];
                if tag.is_empty() {
                    return Err(ConfigError::InvalidImageRef(s.to_owned()));
                }
                (&rest[..split], Some(tag.to_owned()))
            }
            None => (rest, None),
        };

        if name.is_empty() || name.ends_with('/') {
            return Err(ConfigError::InvalidImageRef(s.to_owned()));
        }

        Ok(Self {
            name: name.to_owned(),
            tag,
            digest,
        })
    }
}

/// Names of the Helm parameters carrying an image's repository and tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HelmParams {
    pub image_name: String,
    pub image_tag: String,
}

impl Default for HelmParams {
    fn default() -> Self {
        Self {
            image_name: "image.name".to_string(),
            image_tag: "image.tag".to_string(),
        }
    }
}

/// One image an application asks to keep updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    /// Short alias used in logs and commit messages.
    pub alias: String,
    /// Currently deployed reference.
    pub image: ImageRef,
    /// Version constraint handed to the registry resolver, e.g. `~1.2`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmParams>,
    /// Image name as it appears in a kustomization `images:` entry, when it
    /// differs from `image.name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kustomize_name: Option<String>,
}

/// A resolved tag change for one image of one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageChange {
    pub alias: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_tag: Option<String>,
    pub new_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kustomize_name: Option<String>,
}

impl ImageChange {
    pub fn from_spec(spec: &ImageSpec, new_tag: &str) -> Self {
        Self {
            alias: spec.alias.clone(),
            image: spec.image.name.clone(),
            old_tag: spec.image.tag.clone(),
            new_tag: new_tag.to_owned(),
            helm: spec.helm.clone(),
            kustomize_name: spec.kustomize_name.clone(),
        }
    }

    /// `name:new_tag`.
    pub fn new_reference(&self) -> String {
        format!("{}:{}", self.image, self.new_tag)
    }

    /// Name used to match kustomize `images:` entries.
    pub fn kustomize_key(&self) -> &str {
        self.kustomize_name.as_deref().unwrap_or(&self.image)
    }

    pub fn helm_params(&self) -> HelmParams {
        self.helm.clone().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// How an application's manifests are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Kustomize,
    Helm,
    Directory,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Kustomize => write!(f, "kustomize"),
            SourceKind::Helm => write!(f, "helm"),
            SourceKind::Directory => write!(f, "directory"),
        }
    }
}

/// File that receives the image overrides in a Git write-back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WriteBackTarget {
    /// `.argocd-source-<app>.yaml` next to the application's sources.
    #[default]
    SourceOverride,
    /// A `kustomization.yaml` whose `images:` list is edited in place.
    Kustomization { path: PathBuf },
    /// A Helm values file whose image keys are edited in place.
    HelmValues { path: PathBuf },
}

/// Git credentials for one repository.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Credentials {
    #[default]
    Anonymous,
    Token { username: String, token: String },
    SshKey { path: PathBuf },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Anonymous => write!(f, "Anonymous"),
            Credentials::Token { username, .. } => f
                .debug_struct("Token")
                .field("username", username)
                .field("token", &"[REDACTED]")
                .finish(),
            Credentials::SshKey { path } => f.debug_struct("SshKey").field("path", path).finish(),
        }
    }
}

/// Checkout branch plus optional push branch, written `base` or `base:target`.
///
/// An empty base (or `HEAD`) means the remote's default branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BranchSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl BranchSpec {
    pub fn new(base: &str) -> Self {
        Self {
            base: Some(base.to_owned()),
            target: None,
        }
    }

    /// True when the base must be resolved from the remote's `HEAD`.
    pub fn needs_default_branch(&self) -> bool {
        matches!(self.base.as_deref(), None | Some("") | Some("HEAD"))
    }
}

impl FromStr for BranchSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let non_empty = |v: &str| (!v.is_empty()).then(|| v.to_owned());
        match s.split_once(':') {
            None => Ok(Self {
                base: non_empty(s),
                target: None,
            }),
            Some((base, target)) => {
                if target.is_empty() || target.contains(':') {
                    return Err(ConfigError::InvalidBranchSpec(s.to_owned()));
                }
                Ok(Self {
                    base: non_empty(base),
                    target: Some(target.to_owned()),
                })
            }
        }
    }
}

impl fmt::Display for BranchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.base.as_deref().unwrap_or("HEAD"))?;
        if let Some(target) = &self.target {
            write!(f, ":{target}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Write-back
// ---------------------------------------------------------------------------

/// Git write-back settings for one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitWriteBack {
    pub repo_url: RepoUrl,
    #[serde(default)]
    pub branch: BranchSpec,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub target: WriteBackTarget,
}

/// Where resolved image changes are persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum WriteBackConfig {
    /// Through the orchestrator API.
    #[default]
    Api,
    /// Through a commit/push to the application's source repository.
    Git(GitWriteBack),
}

/// A Helm parameter override stored in an application spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelmParameter {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub force_string: bool,
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// A GitOps-managed application as reported by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub name: AppName,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub kind: SourceKind,
    /// Directory of the application's sources, relative to the repository root.
    #[serde(default)]
    pub source_path: PathBuf,
    #[serde(default)]
    pub images: Vec<ImageSpec>,
    #[serde(default)]
    pub write_back: WriteBackConfig,
    /// Kustomize image overrides (`name=name:tag`) in the live spec.
    #[serde(default)]
    pub kustomize_images: Vec<String>,
    /// Helm parameter overrides in the live spec.
    #[serde(default)]
    pub helm_parameters: Vec<HelmParameter>,
}

impl Application {
    pub fn new(name: impl Into<AppName>, kind: SourceKind) -> Self {
        Self {
            name: name.into(),
            namespace: String::new(),
            kind,
            source_path: PathBuf::new(),
            images: Vec::new(),
            write_back: WriteBackConfig::Api,
            kustomize_images: Vec::new(),
            helm_parameters: Vec::new(),
        }
    }

    /// Repository written by this application, if it uses Git write-back.
    pub fn repo_url(&self) -> Option<&RepoUrl> {
        match &self.write_back {
            WriteBackConfig::Git(git) => Some(&git.repo_url),
            WriteBackConfig::Api => None,
        }
    }

    /// Replace or add the kustomize override for `change`'s image.
    pub fn set_kustomize_image(&mut self, change: &ImageChange) {
        let key = change.kustomize_key();
        let entry = format!("{key}={}", change.new_reference());
        let prefix = format!("{key}=");
        match self
            .kustomize_images
            .iter_mut()
            .find(|existing| existing.starts_with(&prefix) || existing.as_str() == key)
        {
            Some(existing) => *existing = entry,
            None => self.kustomize_images.push(entry),
        }
    }

    /// Replace or add the Helm name/tag parameters for `change`'s image.
    pub fn set_helm_image(&mut self, change: &ImageChange) {
        let params = change.helm_params();
        self.set_helm_parameter(&params.image_name, &change.image);
        self.set_helm_parameter(&params.image_tag, &change.new_tag);
    }

    /// Apply every change to the live spec according to the source type.
    pub fn apply_image_changes(&mut self, changes: &[ImageChange]) -> Result<(), ConfigError> {
        match self.kind {
            SourceKind::Kustomize => changes.iter().for_each(|c| self.set_kustomize_image(c)),
            SourceKind::Helm => changes.iter().for_each(|c| self.set_helm_image(c)),
            SourceKind::Directory => {
                return Err(ConfigError::UnsupportedSource {
                    app: self.name.0.clone(),
                    kind: self.kind.to_string(),
                })
            }
        }
        Ok(())
    }

    fn set_helm_parameter(&mut self, name: &str, value: &str) {
        match self.helm_parameters.iter_mut().find(|p| p.name == name) {
            Some(param) => {
                param.value = value.to_owned();
                param.force_string = true;
            }
            None => self.helm_parameters.push(HelmParameter {
                name: name.to_owned(),
                value: value.to_owned(),
                force_string: true,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Manifest edits applied inside a checked-out working tree.
//!
//! ## Write protocol
//!
//! 1. Parse the current file (missing files start empty where allowed).
//! 2. Apply the image changes to the parsed document.
//! 3. Skip if the document is unchanged.
//! 4. Serialize, normalize line endings, SHA-256 compare with the on-disk bytes.
//! 5. Write to `<path>.tagpilot.tmp`, then rename over the target.
//!
//! Every step is synchronous; the coordinator runs [`ManifestEdit::apply`] on
//! the blocking pool.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};

use tagpilot_core::types::{
    AppName, Application, HelmParameter, ImageChange, SourceKind, WriteBackTarget,
};
use tagpilot_core::ConfigError;

use crate::error::{io_err, manifest_err, WriteBackError};

// ---------------------------------------------------------------------------
// Edit capability
// ---------------------------------------------------------------------------

/// Which file an intent rewrites and how.
///
/// All paths are relative to the working tree root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestEdit {
    /// `<source_path>/.argocd-source-<app>.yaml` parameter overrides.
    SourceOverride {
        app_name: AppName,
        source_path: PathBuf,
        kind: SourceKind,
    },
    /// `images:` entries of a kustomization file.
    Kustomization { path: PathBuf },
    /// Image keys of a Helm values file.
    HelmValues { path: PathBuf },
}

/// Result of applying one edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Edited file, relative to the working tree root.
    pub path: PathBuf,
    pub changed: bool,
}

impl ManifestEdit {
    /// Pick the edit for `app` writing to `target`. Target paths are relative
    /// to the application's source directory.
    pub fn for_application(
        app: &Application,
        target: &WriteBackTarget,
    ) -> Result<Self, ConfigError> {
        if app.kind == SourceKind::Directory {
            return Err(ConfigError::UnsupportedSource {
                app: app.name.0.clone(),
                kind: app.kind.to_string(),
            });
        }
        Ok(match target {
            WriteBackTarget::SourceOverride => ManifestEdit::SourceOverride {
                app_name: app.name.clone(),
                source_path: app.source_path.clone(),
                kind: app.kind,
            },
            WriteBackTarget::Kustomization { path } => ManifestEdit::Kustomization {
                path: kustomization_file(&app.source_path.join(path)),
            },
            WriteBackTarget::HelmValues { path } => {
                let joined = app.source_path.join(path);
                let path = if path.as_os_str().is_empty() {
                    joined.join("values.yaml")
                } else {
                    joined
                };
                ManifestEdit::HelmValues { path }
            }
        })
    }

    /// Path of the edited file relative to the working tree root.
    pub fn relative_path(&self) -> PathBuf {
        match self {
            ManifestEdit::SourceOverride {
                app_name,
                source_path,
                ..
            } => source_path.join(format!(".argocd-source-{}.yaml", app_name.0)),
            ManifestEdit::Kustomization { path } | ManifestEdit::HelmValues { path } => {
                path.clone()
            }
        }
    }

    /// Apply `changes` to the file under `root`, writing only when the
    /// rendered bytes differ from what is checked out.
    pub fn apply(
        &self,
        root: &Path,
        changes: &[ImageChange],
    ) -> Result<ApplyOutcome, WriteBackError> {
        let relative = self.relative_path();
        let path = root.join(&relative);
        let content = match self {
            ManifestEdit::SourceOverride { app_name, kind, .. } => {
                render_source_override(&path, app_name, *kind, changes)?
            }
            ManifestEdit::Kustomization { .. } => render_kustomization(&path, changes)?,
            ManifestEdit::HelmValues { .. } => render_helm_values(&path, changes)?,
        };
        let changed = match content {
            Some(content) => write_if_changed(&path, &content)?,
            None => false,
        };
        if changed {
            tracing::debug!(path = %relative.display(), "manifest updated");
        } else {
            tracing::debug!(path = %relative.display(), "manifest unchanged");
        }
        Ok(ApplyOutcome {
            path: relative,
            changed,
        })
    }
}

fn kustomization_file(path: &Path) -> PathBuf {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => path.to_path_buf(),
        _ => path.join("kustomization.yaml"),
    }
}

// ---------------------------------------------------------------------------
// Source override file
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct SourceOverrideFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kustomize: Option<KustomizeOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    helm: Option<HelmOverride>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct KustomizeOverride {
    #[serde(default)]
    images: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct HelmOverride {
    #[serde(default)]
    parameters: Vec<OverrideParameter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OverrideParameter {
    name: String,
    value: String,
    #[serde(default)]
    forcestring: bool,
}

/// `None` when the merged overrides equal the existing file.
fn render_source_override(
    path: &Path,
    app_name: &AppName,
    kind: SourceKind,
    changes: &[ImageChange],
) -> Result<Option<String>, WriteBackError> {
    let existing = match read_optional(path)? {
        Some(raw) if !raw.trim().is_empty() => {
            Some(serde_yaml::from_str::<SourceOverrideFile>(&raw).map_err(|e| {
                manifest_err(path, e.to_string())
            })?)
        }
        Some(_) => Some(SourceOverrideFile::default()),
        None => None,
    };
    let current = existing.clone().unwrap_or_default();

    // Reuse the application's override merge rules on a scratch spec.
    let mut scratch = Application::new(app_name.clone(), kind);
    scratch.kustomize_images = current
        .kustomize
        .as_ref()
        .map(|k| k.images.clone())
        .unwrap_or_default();
    scratch.helm_parameters = current
        .helm
        .as_ref()
        .map(|h| {
            h.parameters
                .iter()
                .map(|p| HelmParameter {
                    name: p.name.clone(),
                    value: p.value.clone(),
                    force_string: p.forcestring,
                })
                .collect()
        })
        .unwrap_or_default();
    scratch.apply_image_changes(changes)?;

    let mut updated = current.clone();
    match kind {
        SourceKind::Helm => {
            updated.helm = Some(HelmOverride {
                parameters: scratch
                    .helm_parameters
                    .into_iter()
                    .map(|p| OverrideParameter {
                        name: p.name,
                        value: p.value,
                        forcestring: p.force_string,
                    })
                    .collect(),
            });
        }
        _ => {
            updated.kustomize = Some(KustomizeOverride {
                images: scratch.kustomize_images,
            });
        }
    }

    if existing.as_ref() == Some(&updated) {
        return Ok(None);
    }
    Ok(Some(serde_yaml::to_string(&updated)?))
}

// ---------------------------------------------------------------------------
// Kustomization
// ---------------------------------------------------------------------------

fn render_kustomization(
    path: &Path,
    changes: &[ImageChange],
) -> Result<Option<String>, WriteBackError> {
    let raw = read_optional(path)?.ok_or_else(|| manifest_err(path, "kustomization not found"))?;
    let original = parse_document(path, &raw)?;
    let mut doc = original.clone();

    let map = doc
        .as_mapping_mut()
        .ok_or_else(|| manifest_err(path, "document is not a mapping"))?;
    if !map.contains_key("images") {
        map.insert(Value::from("images"), Value::Sequence(Vec::new()));
    }
    let images = map
        .get_mut("images")
        .and_then(Value::as_sequence_mut)
        .ok_or_else(|| manifest_err(path, "'images' is not a list"))?;

    for change in changes {
        let key = change.kustomize_key();
        let position = images
            .iter()
            .position(|v| v.get("name").and_then(Value::as_str) == Some(key));
        let index = match position {
            Some(index) => index,
            None => {
                let mut fresh = Mapping::new();
                fresh.insert(Value::from("name"), Value::from(key));
                images.push(Value::Mapping(fresh));
                images.len() - 1
            }
        };
        let entry = images[index]
            .as_mapping_mut()
            .ok_or_else(|| manifest_err(path, format!("image entry '{key}' is not a mapping")))?;
        if key != change.image {
            entry.insert(Value::from("newName"), Value::from(change.image.as_str()));
        }
        entry.insert(Value::from("newTag"), Value::from(change.new_tag.as_str()));
        entry.remove("digest");
    }

    if doc == original {
        return Ok(None);
    }
    Ok(Some(serde_yaml::to_string(&doc)?))
}

// ---------------------------------------------------------------------------
// Helm values
// ---------------------------------------------------------------------------

fn render_helm_values(
    path: &Path,
    changes: &[ImageChange],
) -> Result<Option<String>, WriteBackError> {
    let existed;
    let original = match read_optional(path)? {
        Some(raw) => {
            existed = true;
            parse_document(path, &raw)?
        }
        None => {
            existed = false;
            Value::Mapping(Mapping::new())
        }
    };
    let mut doc = original.clone();
    for change in changes {
        let params = change.helm_params();
        set_dotted(&mut doc, &params.image_name, Value::from(change.image.as_str()))
            .map_err(|reason| manifest_err(path, reason))?;
        set_dotted(&mut doc, &params.image_tag, Value::from(change.new_tag.as_str()))
            .map_err(|reason| manifest_err(path, reason))?;
    }

    if existed && doc == original {
        return Ok(None);
    }
    Ok(Some(serde_yaml::to_string(&doc)?))
}

/// Set `a.b.c` in a YAML document, creating intermediate mappings.
fn set_dotted(doc: &mut Value, dotted: &str, value: Value) -> Result<(), String> {
    let parts: Vec<&str> = dotted.split('.').filter(|p| !p.is_empty()).collect();
    let Some((last, parents)) = parts.split_last() else {
        return Err(format!("empty parameter name '{dotted}'"));
    };

    let mut cur = doc;
    for part in parents {
        let map = cur
            .as_mapping_mut()
            .ok_or_else(|| format!("cannot set '{dotted}': parent of '{part}' is not a mapping"))?;
        if !map.contains_key(*part) {
            map.insert(Value::from(*part), Value::Mapping(Mapping::new()));
        }
        cur = map
            .get_mut(*part)
            .ok_or_else(|| format!("cannot set '{dotted}': missing '{part}'"))?;
    }
    let map = cur
        .as_mapping_mut()
        .ok_or_else(|| format!("cannot set '{dotted}': parent of '{last}' is not a mapping"))?;
    map.insert(Value::from(*last), value);
    Ok(())
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

fn read_optional(path: &Path) -> Result<Option<String>, WriteBackError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path, e)),
    }
}

fn parse_document(path: &Path, raw: &str) -> Result<Value, WriteBackError> {
    if raw.trim().is_empty() {
        return Ok(Value::Mapping(Mapping::new()));
    }
    serde_yaml::from_str(raw).map_err(|e| manifest_err(path, e.to_string()))
}

fn digest(content: &str) -> String {
    let mut h = Sha256::new();
    h.update(content.replace("\r\n", "\n").as_bytes());
    hex::encode(h.finalize())
}

/// Atomically replace `path` with `content` unless the bytes already match.
/// Returns whether the file was written.
pub(crate) fn write_if_changed(path: &Path, content: &str) -> Result<bool, WriteBackError> {
    let normalized = content.replace("\r\n", "\n");
    if let Some(existing) = read_optional(path)? {
        if digest(&existing) == digest(&normalized) {
            return Ok(false);
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let tmp = PathBuf::from(format!("{}.tagpilot.tmp", path.display()));
    std::fs::write(&tmp, &normalized).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tagpilot_core::types::HelmParams;
    use tempfile::TempDir;

    fn change(image: &str, new_tag: &str) -> ImageChange {
        ImageChange {
            alias: "app".into(),
            image: image.into(),
            old_tag: Some("1.0.0".into()),
            new_tag: new_tag.into(),
            helm: None,
            kustomize_name: None,
        }
    }

    fn read(root: &Path, rel: &Path) -> String {
        std::fs::read_to_string(root.join(rel)).expect("read")
    }

    #[test]
    fn source_override_created_then_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let edit = ManifestEdit::SourceOverride {
            app_name: AppName::from("checkout"),
            source_path: PathBuf::from("apps/checkout"),
            kind: SourceKind::Kustomize,
        };

        let first = edit.apply(dir.path(), &[change("nginx", "1.1.0")]).expect("apply");
        assert!(first.changed);
        assert_eq!(first.path, PathBuf::from("apps/checkout/.argocd-source-checkout.yaml"));
        let body = read(dir.path(), &first.path);
        assert!(body.contains("nginx=nginx:1.1.0"), "got: {body}");

        let second = edit.apply(dir.path(), &[change("nginx", "1.1.0")]).expect("apply");
        assert!(!second.changed);
    }

    #[test]
    fn source_override_merges_helm_parameters() {
        let dir = TempDir::new().expect("tempdir");
        let rel = PathBuf::from("charts/api/.argocd-source-api.yaml");
        std::fs::create_dir_all(dir.path().join("charts/api")).expect("mkdir");
        std::fs::write(
            dir.path().join(&rel),
            "helm:\n  parameters:\n  - name: replicas\n    value: \"3\"\n    forcestring: false\n",
        )
        .expect("write");

        let edit = ManifestEdit::SourceOverride {
            app_name: AppName::from("api"),
            source_path: PathBuf::from("charts/api"),
            kind: SourceKind::Helm,
        };
        let mut c = change("ghcr.io/org/api", "2.0.0");
        c.helm = Some(HelmParams {
            image_name: "api.image.repository".into(),
            image_tag: "api.image.tag".into(),
        });
        assert!(edit.apply(dir.path(), &[c]).expect("apply").changed);

        let parsed: SourceOverrideFile =
            serde_yaml::from_str(&read(dir.path(), &rel)).expect("parse");
        let params = parsed.helm.expect("helm").parameters;
        let names: Vec<_> = params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["replicas", "api.image.repository", "api.image.tag"]);
        assert_eq!(params[2].value, "2.0.0");
    }

    #[test]
    fn kustomization_images_updated_in_place() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("overlays/prod")).expect("mkdir");
        std::fs::write(
            dir.path().join("overlays/prod/kustomization.yaml"),
            "resources:\n- ../../base\nimages:\n- name: nginx\n  newTag: 1.0.0\n  digest: sha256:abc\n",
        )
        .expect("write");

        let edit = ManifestEdit::Kustomization {
            path: PathBuf::from("overlays/prod/kustomization.yaml"),
        };
        let out = edit
            .apply(dir.path(), &[change("nginx", "1.2.0"), change("redis", "7.2")])
            .expect("apply");
        assert!(out.changed);

        let doc: Value = serde_yaml::from_str(&read(dir.path(), &out.path)).expect("parse");
        let images = doc["images"].as_sequence().expect("images");
        assert_eq!(images.len(), 2);
        assert_eq!(images[0]["newTag"].as_str(), Some("1.2.0"));
        assert!(images[0].get("digest").is_none());
        assert_eq!(images[1]["name"].as_str(), Some("redis"));
        assert_eq!(doc["resources"][0].as_str(), Some("../../base"));

        let again = edit.apply(dir.path(), &[change("nginx", "1.2.0")]).expect("apply");
        assert!(!again.changed);
    }

    #[test]
    fn missing_kustomization_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let edit = ManifestEdit::Kustomization {
            path: PathBuf::from("kustomization.yaml"),
        };
        let err = edit.apply(dir.path(), &[change("nginx", "1")]).unwrap_err();
        assert!(matches!(err, WriteBackError::Manifest { .. }), "got: {err}");
    }

    #[test]
    fn helm_values_nested_keys_created() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("values.yaml"), "replicaCount: 2\n").expect("write");

        let edit = ManifestEdit::HelmValues {
            path: PathBuf::from("values.yaml"),
        };
        assert!(edit
            .apply(dir.path(), &[change("ghcr.io/org/web", "3.1.0")])
            .expect("apply")
            .changed);

        let doc: Value = serde_yaml::from_str(&read(dir.path(), Path::new("values.yaml"))).expect("parse");
        assert_eq!(doc["image"]["name"].as_str(), Some("ghcr.io/org/web"));
        assert_eq!(doc["image"]["tag"].as_str(), Some("3.1.0"));
        assert_eq!(doc["replicaCount"].as_u64(), Some(2));
    }

    #[test]
    fn helm_values_scalar_parent_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("values.yaml"), "image: nginx\n").expect("write");
        let edit = ManifestEdit::HelmValues {
            path: PathBuf::from("values.yaml"),
        };
        let err = edit.apply(dir.path(), &[change("nginx", "2")]).unwrap_err();
        assert!(err.to_string().contains("not a mapping"), "got: {err}");
    }

    #[test]
    fn write_if_changed_ignores_line_endings_and_cleans_tmp() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("a.yaml");
        assert!(write_if_changed(&path, "a: 1\r\nb: 2\r\n").expect("write"));
        assert!(!write_if_changed(&path, "a: 1\nb: 2\n").expect("write"));
        assert!(!dir.path().join("a.yaml.tagpilot.tmp").exists());
    }

    #[test]
    fn for_application_resolves_paths() {
        let mut app = Application::new("web", SourceKind::Kustomize);
        app.source_path = PathBuf::from("apps/web");

        let edit = ManifestEdit::for_application(
            &app,
            &WriteBackTarget::Kustomization {
                path: PathBuf::from("overlays/prod"),
            },
        )
        .expect("edit");
        assert_eq!(
            edit.relative_path(),
            PathBuf::from("apps/web/overlays/prod/kustomization.yaml")
        );

        app.kind = SourceKind::Directory;
        assert!(ManifestEdit::for_application(&app, &WriteBackTarget::SourceOverride).is_err());
    }
}

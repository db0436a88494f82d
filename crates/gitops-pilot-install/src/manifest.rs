//! Manifest object builder
//!
//! Turns a multi-document install manifest into an ordered list of cluster
//! objects. Documents are unnamed until parsed, so each one is keyed by its
//! position (`template_<n>.yaml`); after decoding, objects are also
//! addressable by `kind/name`. Source order is kept so CRDs and namespaces
//! authored first are applied first.

use std::collections::{BTreeMap, HashSet};

use gitops_pilot_core::ManifestSource;
use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;

use crate::error::InstallError;

/// Separator between documents in a manifest
pub const DOCUMENT_SEPARATOR: &str = "\n---\n";

/// One decoded manifest document
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterObject {
    /// Positional key, `template_<n>.yaml`
    pub template: String,
    pub api_version: String,
    pub kind: String,
    pub name: String,
    /// Namespace from the document itself, if any
    pub namespace: Option<String>,
    /// Full desired object
    pub value: Value,
}

impl ClusterObject {
    /// `kind/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

/// Objects of one manifest, in source order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestObjects {
    objects: Vec<ClusterObject>,
}

impl ManifestObjects {
    pub fn iter(&self) -> impl Iterator<Item = &ClusterObject> {
        self.objects.iter()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Look up by `kind/name`
    pub fn get(&self, key: &str) -> Option<&ClusterObject> {
        self.objects.iter().find(|o| o.key() == key)
    }
}

/// Read the raw manifest from a file or URL
pub async fn fetch_manifest(source: &ManifestSource) -> Result<String, InstallError> {
    let fetch_error = |reason: String| InstallError::ManifestFetch {
        location: source.to_string(),
        reason,
    };

    match source {
        ManifestSource::Url(url) => {
            let response = reqwest::get(url)
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| fetch_error(e.to_string()))?;
            response.text().await.map_err(|e| fetch_error(e.to_string()))
        }
        ManifestSource::Path(path) => tokio::fs::read_to_string(path)
            .await
            .map_err(|e| fetch_error(e.to_string())),
    }
}

/// Split manifest content into positional templates
pub fn split_templates(content: &str) -> Vec<(String, String)> {
    let content = content.replace("\r\n", "\n");
    if content.trim().is_empty() {
        return Vec::new();
    }

    content
        .split(DOCUMENT_SEPARATOR)
        .enumerate()
        .map(|(n, doc)| (format!("template_{}.yaml", n), strip_markers(doc).to_string()))
        .collect()
}

/// Drop a leading or trailing `---` line left over at the edges of the file
fn strip_markers(doc: &str) -> &str {
    let doc = doc.strip_prefix("---\n").unwrap_or(doc);
    let doc = doc.strip_suffix("\n---").unwrap_or(doc);
    doc.strip_suffix("\n---\n").unwrap_or(doc)
}

/// Whether a document has nothing but blank lines and comments
fn is_blank_document(doc: &str) -> bool {
    doc.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with('#') || line == "---"
    })
}

/// Render a document against template values.
///
/// With no values the document is returned untouched, so manifests that
/// carry literal `{{ }}` text (notification templates and the like) pass
/// through.
pub fn render_template(
    template: &str,
    doc: &str,
    values: &BTreeMap<String, String>,
) -> Result<String, InstallError> {
    if values.is_empty() {
        return Ok(doc.to_string());
    }

    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.render_str(doc, values)
        .map_err(|e| InstallError::ManifestDecode {
            template: template.to_string(),
            reason: format!("template render failed: {}", e),
        })
}

/// Decode one document. Blank documents yield `None`.
pub fn decode_object(template: &str, doc: &str) -> Result<Option<ClusterObject>, InstallError> {
    if is_blank_document(doc) {
        return Ok(None);
    }

    let decode_error = |reason: String| InstallError::ManifestDecode {
        template: template.to_string(),
        reason,
    };

    let value: Value = serde_yaml::from_str(doc).map_err(|e| decode_error(e.to_string()))?;
    if value.is_null() {
        return Ok(None);
    }
    if !value.is_object() {
        return Err(decode_error("document is not a mapping".to_string()));
    }

    let field = |pointer: &str| {
        value
            .pointer(pointer)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let api_version =
        field("/apiVersion").ok_or_else(|| decode_error("missing apiVersion".to_string()))?;
    let kind = field("/kind").ok_or_else(|| decode_error("missing kind".to_string()))?;
    let name =
        field("/metadata/name").ok_or_else(|| decode_error("missing metadata.name".to_string()))?;
    let namespace = field("/metadata/namespace");

    Ok(Some(ClusterObject {
        template: template.to_string(),
        api_version,
        kind,
        name,
        namespace,
        value,
    }))
}

/// Build the ordered object set from raw manifest content
pub fn build_objects(
    content: &str,
    values: &BTreeMap<String, String>,
) -> Result<ManifestObjects, InstallError> {
    let mut objects = Vec::new();
    let mut seen = HashSet::new();

    for (template, doc) in split_templates(content) {
        let rendered = render_template(&template, &doc, values)?;
        let Some(object) = decode_object(&template, &rendered)? else {
            continue;
        };

        let identity = (
            object.kind.clone(),
            object.namespace.clone(),
            object.name.clone(),
        );
        if !seen.insert(identity) {
            return Err(InstallError::ManifestDecode {
                template,
                reason: format!("duplicate object {}", object.key()),
            });
        }
        objects.push(object);
    }

    Ok(ManifestObjects { objects })
}

/// Fetch a manifest and build its objects
pub async fn load_objects(
    source: &ManifestSource,
    values: &BTreeMap<String, String>,
) -> Result<ManifestObjects, InstallError> {
    let content = fetch_manifest(source).await?;
    let objects = build_objects(&content, values)?;
    tracing::debug!(source = %source, objects = objects.len(), "manifest decoded");
    Ok(objects)
}

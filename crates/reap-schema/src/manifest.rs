//! Image manifests as seen by the cleanup engine.
//!
//! Registries serve several manifest flavours (OCI image index, OCI image
//! manifest, Docker manifest list, Docker schema 2). The engine only cares
//! whether a manifest is an *index* with child descriptors or a *leaf* with
//! content layers, so parsing collapses them into [`Manifest`]. The original
//! JSON document is kept so a manifest can be cloned, emptied and pushed back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Digest;

/// OCI image index media type.
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// OCI image manifest media type.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// Docker manifest list media type.
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
/// Docker schema 2 image manifest media type.
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Every media type the engine knows how to read, in `Accept` header order.
pub const ACCEPTED_MEDIA_TYPES: [&str; 4] =
    [OCI_INDEX, DOCKER_MANIFEST_LIST, OCI_MANIFEST, DOCKER_MANIFEST];

/// Annotation buildx sets on attestation manifests inside an index.
const REFERENCE_TYPE_ANNOTATION: &str = "vnd.docker.reference.type";

/// Errors produced when parsing a manifest document.
#[derive(thiserror::Error, Debug)]
pub enum ManifestError {
    /// The body is not valid JSON.
    #[error("Manifest is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The body is JSON but not an object.
    #[error("Manifest must be a JSON object")]
    NotAnObject,

    /// The `manifests` array holds an entry that is not a descriptor.
    #[error("Malformed child descriptor at position {index}: {source}")]
    Descriptor {
        /// Position of the entry inside `manifests`.
        index: usize,
        /// Underlying decoding failure.
        source: serde_json::Error,
    },
}

/// Platform a child manifest was built for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture, e.g. `amd64`, `arm64`.
    pub architecture: String,
    /// Operating system, e.g. `linux`.
    #[serde(default)]
    pub os: String,
    /// CPU variant, e.g. `v8`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// An entry of an index manifest's `manifests` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildDescriptor {
    /// Digest of the child manifest.
    pub digest: Digest,
    /// Media type of the child manifest.
    #[serde(default)]
    pub media_type: Option<String>,
    /// Target platform, absent for artifacts.
    #[serde(default)]
    pub platform: Option<Platform>,
    /// Artifact type for non-image children (signatures, SBOMs, ...).
    #[serde(default)]
    pub artifact_type: Option<String>,
    /// Free-form descriptor annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl ChildDescriptor {
    /// Human-readable label used when logging deletion of this child.
    ///
    /// Platform images are labelled `architecture: <arch>[/<variant>]`,
    /// attestations `attestation`, other artifacts by their artifact type.
    pub fn label(&self) -> String {
        if let Some(kind) = self.annotations.get(REFERENCE_TYPE_ANNOTATION) {
            if kind == "attestation-manifest" {
                return "attestation".to_string();
            }
        }
        if let Some(artifact_type) = &self.artifact_type {
            return artifact_type.clone();
        }
        match &self.platform {
            Some(p) if p.architecture == "unknown" => "attestation".to_string(),
            Some(Platform {
                architecture,
                variant: Some(variant),
                ..
            }) => format!("architecture: {architecture}/{variant}"),
            Some(p) => format!("architecture: {}", p.architecture),
            None => "child".to_string(),
        }
    }
}

/// A parsed manifest: either a leaf with content layers or an index with children.
#[derive(Debug, Clone, PartialEq)]
pub enum Manifest {
    /// Single-platform image or artifact.
    Leaf {
        /// Number of content layers.
        layers: usize,
        /// Original manifest document.
        document: Value,
    },
    /// Multi-architecture image (or an index of artifacts).
    Index {
        /// Child descriptors in document order.
        children: Vec<ChildDescriptor>,
        /// Original manifest document.
        document: Value,
    },
}

impl Manifest {
    /// Parse a manifest body. A `manifests` array marks an index.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] if the body is not a JSON object or if an
    /// index entry cannot be decoded as a descriptor.
    pub fn parse(body: &[u8]) -> Result<Self, ManifestError> {
        let document: Value = serde_json::from_slice(body)?;
        Self::from_document(document)
    }

    /// Build a manifest from an already-decoded JSON document.
    ///
    /// # Errors
    ///
    /// See [`Manifest::parse`].
    pub fn from_document(document: Value) -> Result<Self, ManifestError> {
        let object = document.as_object().ok_or(ManifestError::NotAnObject)?;

        if let Some(Value::Array(entries)) = object.get("manifests") {
            let children = entries
                .iter()
                .enumerate()
                .map(|(index, entry)| {
                    ChildDescriptor::deserialize(entry)
                        .map_err(|source| ManifestError::Descriptor { index, source })
                })
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Self::Index { children, document });
        }

        let layers = object
            .get("layers")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        Ok(Self::Leaf { layers, document })
    }

    /// Whether this is a multi-architecture index.
    pub fn is_index(&self) -> bool {
        matches!(self, Self::Index { .. })
    }

    /// Child descriptors; empty for leaf manifests.
    pub fn children(&self) -> &[ChildDescriptor] {
        match self {
            Self::Index { children, .. } => children,
            Self::Leaf { .. } => &[],
        }
    }

    /// The original JSON document.
    pub fn document(&self) -> &Value {
        match self {
            Self::Leaf { document, .. } | Self::Index { document, .. } => document,
        }
    }

    /// Declared media type, falling back to the OCI type for this shape.
    pub fn media_type(&self) -> &str {
        self.document()
            .get("mediaType")
            .and_then(Value::as_str)
            .unwrap_or(if self.is_index() { OCI_INDEX } else { OCI_MANIFEST })
    }

    /// A copy of this manifest with its content removed: no children for an
    /// index, no layers for a leaf. Everything else (config, annotations,
    /// media type) is preserved, so the result hashes to a new digest.
    pub fn emptied(&self) -> Self {
        let mut document = self.document().clone();
        let key = if self.is_index() { "manifests" } else { "layers" };
        if let Some(object) = document.as_object_mut() {
            object.insert(key.to_string(), Value::Array(Vec::new()));
        }
        match self {
            Self::Index { .. } => Self::Index {
                children: Vec::new(),
                document,
            },
            Self::Leaf { .. } => Self::Leaf {
                layers: 0,
                document,
            },
        }
    }

    /// Serialize the document for upload.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be serialized.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self.document())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn index_doc() -> Value {
        json!({
            "schemaVersion": 2,
            "mediaType": OCI_INDEX,
            "manifests": [
                {
                    "mediaType": OCI_MANIFEST,
                    "digest": "sha256:aa",
                    "size": 100,
                    "platform": {"architecture": "amd64", "os": "linux"}
                },
                {
                    "mediaType": OCI_MANIFEST,
                    "digest": "sha256:bb",
                    "size": 100,
                    "platform": {"architecture": "arm64", "os": "linux", "variant": "v8"}
                },
                {
                    "mediaType": OCI_MANIFEST,
                    "digest": "sha256:cc",
                    "size": 100,
                    "platform": {"architecture": "unknown", "os": "unknown"},
                    "annotations": {
                        "vnd.docker.reference.digest": "sha256:aa",
                        "vnd.docker.reference.type": "attestation-manifest"
                    }
                }
            ]
        })
    }

    #[test]
    fn parses_index_children() {
        let manifest = Manifest::from_document(index_doc()).unwrap();
        assert!(manifest.is_index());
        let digests: Vec<&str> = manifest
            .children()
            .iter()
            .map(|c| c.digest.as_str())
            .collect();
        assert_eq!(digests, ["sha256:aa", "sha256:bb", "sha256:cc"]);
    }

    #[test]
    fn labels_describe_children() {
        let manifest = Manifest::from_document(index_doc()).unwrap();
        let labels: Vec<String> = manifest.children().iter().map(ChildDescriptor::label).collect();
        assert_eq!(
            labels,
            ["architecture: amd64", "architecture: arm64/v8", "attestation"]
        );
    }

    #[test]
    fn leaf_without_manifests_key() {
        let body = json!({
            "schemaVersion": 2,
            "mediaType": DOCKER_MANIFEST,
            "config": {"digest": "sha256:cf", "size": 1},
            "layers": [{"digest": "sha256:l1", "size": 1}, {"digest": "sha256:l2", "size": 1}]
        });
        let manifest = Manifest::parse(body.to_string().as_bytes()).unwrap();
        assert!(!manifest.is_index());
        assert!(matches!(manifest, Manifest::Leaf { layers: 2, .. }));
        assert_eq!(manifest.media_type(), DOCKER_MANIFEST);
    }

    #[test]
    fn emptied_index_keeps_envelope() {
        let manifest = Manifest::from_document(index_doc()).unwrap();
        let empty = manifest.emptied();
        assert!(empty.is_index());
        assert!(empty.children().is_empty());
        assert_eq!(empty.document()["manifests"], json!([]));
        assert_eq!(empty.media_type(), OCI_INDEX);
        assert_ne!(empty.to_bytes().unwrap(), manifest.to_bytes().unwrap());
    }

    #[test]
    fn emptied_leaf_drops_layers_only() {
        let body = json!({
            "schemaVersion": 2,
            "config": {"digest": "sha256:cf", "size": 1},
            "layers": [{"digest": "sha256:l1", "size": 1}]
        });
        let empty = Manifest::from_document(body).unwrap().emptied();
        assert_eq!(empty.document()["layers"], json!([]));
        assert_eq!(empty.document()["config"]["digest"], "sha256:cf");
    }

    #[test]
    fn rejects_non_object() {
        assert!(matches!(
            Manifest::parse(b"[1,2]"),
            Err(ManifestError::NotAnObject)
        ));
    }
}

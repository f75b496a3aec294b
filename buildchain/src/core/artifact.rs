//! References to artifacts published by a stage.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A handle to one artifact published by a stage of a run.
///
/// The artifact store resolves the reference back to its bytes; the
/// scheduler only passes references around.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// The run that produced the artifact.
    pub run_id: Uuid,
    /// The stage that published the artifact.
    pub stage_id: String,
    /// The declared path pattern the artifact matched.
    pub pattern: String,
    /// The concrete path of the artifact within the stage's output.
    pub path: String,
    /// Size in bytes, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Content digest, if the store computes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ArtifactRef {
    /// Creates a new artifact reference.
    #[must_use]
    pub fn new(
        run_id: Uuid,
        stage_id: impl Into<String>,
        pattern: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            stage_id: stage_id.into(),
            pattern: pattern.into(),
            path: path.into(),
            size: None,
            digest: None,
        }
    }

    /// Sets the size.
    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Sets the digest.
    #[must_use]
    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// A location string unique within the store: `<run>/<stage>/<path>`.
    #[must_use]
    pub fn location(&self) -> String {
        format!("{}/{}/{}", self.run_id, self.stage_id, self.path)
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.location())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_location() {
        let run_id = Uuid::nil();
        let artifact = ArtifactRef::new(run_id, "Package", "dist/**", "dist/app.js")
            .with_size(42)
            .with_digest("abc");

        assert_eq!(
            artifact.location(),
            "00000000-0000-0000-0000-000000000000/Package/dist/app.js"
        );
        assert_eq!(artifact.size, Some(42));
        assert_eq!(artifact.to_string(), artifact.location());
    }

    #[test]
    fn test_artifact_serialization_skips_empty_fields() {
        let artifact = ArtifactRef::new(Uuid::nil(), "Build", "*.log", "build.log");
        let json = serde_json::to_value(&artifact).unwrap();

        assert!(json.get("size").is_none());
        assert_eq!(json["stage_id"], "Build");
    }
}

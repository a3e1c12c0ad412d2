//! Plan documents: a brief plus the candidate approaches to choose from
//!
//! This is the file format the CLI reads. The candidates feed a
//! [`StaticProposer`](crate::planner::StaticProposer).

use retroplan_model::{Candidate, CapabilityId, Plan, PlanError, TaskBrief};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported document format `{0}` (expected yaml, yml or json)")]
    UnsupportedFormat(String),

    #[error("document has no candidates")]
    NoCandidates,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDocument {
    pub brief: TaskBrief,
    pub candidates: Vec<Candidate>,
}

/// Structural check of one candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateCheck {
    pub candidate: String,
    pub steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CandidateCheck {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }
}

impl PlanDocument {
    /// # Errors
    /// Returns error if the YAML is malformed or lists no candidates
    pub fn from_yaml_str(yaml: &str) -> Result<Self, DocumentError> {
        let doc: Self = serde_yaml::from_str(yaml)?;
        doc.non_empty()
    }

    /// # Errors
    /// Returns error if the JSON is malformed or lists no candidates
    pub fn from_json_str(json: &str) -> Result<Self, DocumentError> {
        let doc: Self = serde_json::from_str(json)?;
        doc.non_empty()
    }

    /// Load a document, choosing the format by extension
    ///
    /// # Errors
    /// Returns error if the file cannot be read, has an unknown extension,
    /// or does not parse
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DocumentError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| DocumentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "yaml" | "yml" => Self::from_yaml_str(&text),
            "json" => Self::from_json_str(&text),
            other => Err(DocumentError::UnsupportedFormat(other.to_string())),
        }
    }

    fn non_empty(self) -> Result<Self, DocumentError> {
        if self.candidates.is_empty() {
            return Err(DocumentError::NoCandidates);
        }
        Ok(self)
    }

    /// Build a plan from every candidate and report structural problems
    #[must_use]
    pub fn check(&self) -> Vec<CandidateCheck> {
        self.candidates
            .iter()
            .map(|c| CandidateCheck {
                candidate: c.name.clone(),
                steps: c.steps.len(),
                error: self.plan_for(c).err().map(|e| e.to_string()),
            })
            .collect()
    }

    /// Version 0 of the plan a candidate describes
    ///
    /// # Errors
    /// Returns the first structural problem of the candidate
    pub fn plan_for(&self, candidate: &Candidate) -> Result<Plan, PlanError> {
        Plan::new(
            self.brief.clone(),
            candidate.steps.clone(),
            candidate.dependencies.clone(),
        )
    }

    /// Every capability any candidate references
    #[must_use]
    pub fn capabilities(&self) -> BTreeSet<CapabilityId> {
        self.candidates
            .iter()
            .flat_map(Candidate::capabilities)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::example_document;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn example_round_trips_through_yaml() {
        let doc = example_document();
        let yaml = serde_yaml::to_string(&doc).unwrap();
        assert_eq!(PlanDocument::from_yaml_str(&yaml).unwrap(), doc);
        assert!(doc.check().iter().all(CandidateCheck::is_valid));
    }

    #[test]
    fn load_picks_format_by_extension() {
        let doc = example_document();
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(serde_json::to_string(&doc).unwrap().as_bytes())
            .unwrap();
        assert_eq!(PlanDocument::load(file.path()).unwrap().brief, doc.brief);

        let txt = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        assert!(matches!(
            PlanDocument::load(txt.path()),
            Err(DocumentError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn check_reports_broken_candidates() {
        let yaml = r"
brief:
  objective: broken
candidates:
  - name: dangling
    feasibility: 0.5
    steps:
      - id: a
        intent: first
        capability: echo
    dependencies:
      a: [ghost]
";
        let doc = PlanDocument::from_yaml_str(yaml).unwrap();
        let checks = doc.check();
        assert_eq!(checks.len(), 1);
        assert!(!checks[0].is_valid());
    }

    #[test]
    fn empty_candidate_list_is_rejected() {
        let yaml = "brief:\n  objective: nothing\ncandidates: []\n";
        assert!(matches!(
            PlanDocument::from_yaml_str(yaml),
            Err(DocumentError::NoCandidates)
        ));
    }
}

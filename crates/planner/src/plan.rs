//! The validated plan schema carried between human language and the pipeline.

use database::{DatasetProvider, Framework, TaskType};
use serde::{Deserialize, Serialize};
use vision::Architecture;

use crate::intent::{derive_title, truncate_at_boundary};

const NAME_MIN: usize = 3;
const NAME_MAX: usize = 80;
const MAX_KEYWORDS: usize = 8;
const DEFAULT_MAX_DATASET_SIZE_GB: f64 = 50.0;

/// A project plan as produced by the LLM and validated by the planner.
///
/// Unknown fields in the LLM output are discarded; missing optional fields
/// take these defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectPlan {
    #[serde(default)]
    pub name: String,

    #[serde(default = "default_task_type")]
    pub task_type: TaskType,

    #[serde(default = "default_framework")]
    pub framework: Framework,

    #[serde(default = "default_dataset_source")]
    pub dataset_source: DatasetProvider,

    #[serde(default)]
    pub search_keywords: Vec<String>,

    #[serde(default = "default_preferred_model")]
    pub preferred_model: String,

    #[serde(default = "default_target_metric")]
    pub target_metric: String,

    #[serde(default = "default_target_value")]
    pub target_value: f64,

    #[serde(default = "default_max_dataset_size_gb")]
    pub max_dataset_size_gb: f64,
}

fn default_task_type() -> TaskType {
    TaskType::ImageClassification
}

fn default_framework() -> Framework {
    Framework::Pytorch
}

fn default_dataset_source() -> DatasetProvider {
    DatasetProvider::Kaggle
}

fn default_preferred_model() -> String {
    "resnet18".to_string()
}

fn default_target_metric() -> String {
    "accuracy".to_string()
}

fn default_target_value() -> f64 {
    0.9
}

fn default_max_dataset_size_gb() -> f64 {
    DEFAULT_MAX_DATASET_SIZE_GB
}

impl ProjectPlan {
    /// Normalizes and validates the plan in place.
    ///
    /// Keywords are lowercased, trimmed, and deduplicated; the architecture
    /// is canonicalized through its aliases; a missing or too-short name is
    /// derived from the utterance.
    ///
    /// # Errors
    ///
    /// Returns a human-readable description of the first violation.
    pub fn validate(&mut self, utterance: &str) -> Result<(), String> {
        self.name = self.name.trim().to_string();
        if self.name.len() < NAME_MIN {
            self.name = derive_title(utterance);
        }
        truncate_at_boundary(&mut self.name, NAME_MAX);

        let mut keywords = Vec::new();
        for keyword in &self.search_keywords {
            let keyword = keyword.trim().to_lowercase();
            if !keyword.is_empty() && !keywords.contains(&keyword) {
                keywords.push(keyword);
            }
        }
        if keywords.is_empty() {
            return Err("search_keywords must contain at least one keyword".to_string());
        }
        keywords.truncate(MAX_KEYWORDS);
        self.search_keywords = keywords;

        let architecture: Architecture = self
            .preferred_model
            .parse()
            .map_err(|_| format!("unsupported preferred_model: {}", self.preferred_model))?;
        self.preferred_model = architecture.as_str().to_string();

        if !(0.0..=1.0).contains(&self.target_value) {
            return Err(format!(
                "target_value must be within 0..=1, got {}",
                self.target_value
            ));
        }

        if !self.max_dataset_size_gb.is_finite() || self.max_dataset_size_gb <= 0.0 {
            return Err(format!(
                "max_dataset_size_gb must be positive, got {}",
                self.max_dataset_size_gb
            ));
        }

        Ok(())
    }

    /// The metadata map stored on the project row.
    #[must_use]
    pub fn to_metadata(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }

    /// One-line human summary for the confirmation message.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Project created: {}\nTask: {:?}\nModel: {}\nKeywords: {}\nDataset cap: {} GB",
            self.name,
            self.task_type,
            self.preferred_model,
            self.search_keywords.join(", "),
            self.max_dataset_size_gb,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_plan(raw: &str) -> ProjectPlan {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let mut plan = parse_plan(r#"{"search_keywords": ["Flower", "flower", " Classifier "]}"#);
        plan.validate("Train a flower classifier").unwrap();

        assert_eq!(plan.task_type, TaskType::ImageClassification);
        assert_eq!(plan.framework, Framework::Pytorch);
        assert_eq!(plan.dataset_source, DatasetProvider::Kaggle);
        assert_eq!(plan.preferred_model, "resnet18");
        assert!((plan.target_value - 0.9).abs() < f64::EPSILON);
        assert!((plan.max_dataset_size_gb - 50.0).abs() < f64::EPSILON);
        // Lowercased, trimmed, deduplicated.
        assert_eq!(plan.search_keywords, vec!["flower", "classifier"]);
    }

    #[test]
    fn test_unknown_fields_are_discarded() {
        let plan = parse_plan(
            r#"{"search_keywords": ["cats"], "confidence": 0.99, "notes": "ignore me"}"#,
        );
        assert_eq!(plan.search_keywords, vec!["cats"]);
    }

    #[test]
    fn test_empty_keywords_rejected() {
        let mut plan = parse_plan(r#"{"search_keywords": ["  ", ""]}"#);
        assert!(plan.validate("anything").is_err());
    }

    #[test]
    fn test_model_alias_canonicalized() {
        let mut plan = parse_plan(
            r#"{"search_keywords": ["dogs"], "preferred_model": "efficientnet"}"#,
        );
        plan.validate("dogs").unwrap();
        assert_eq!(plan.preferred_model, "efficientnet_b0");
    }

    #[test]
    fn test_unsupported_model_rejected() {
        let mut plan =
            parse_plan(r#"{"search_keywords": ["dogs"], "preferred_model": "vgg16"}"#);
        assert!(plan.validate("dogs").is_err());
    }

    #[test]
    fn test_target_value_bounds() {
        let mut plan = parse_plan(r#"{"search_keywords": ["x"], "target_value": 1.5}"#);
        assert!(plan.validate("x").is_err());
    }

    #[test]
    fn test_short_name_is_derived_from_utterance() {
        let mut plan = parse_plan(r#"{"name": "ab", "search_keywords": ["x"]}"#);
        plan.validate("Train a skin lesion classifier").unwrap();
        assert_eq!(plan.name, "Train a skin lesion classifier");
    }
}

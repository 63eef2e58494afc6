//! Dataset source seam and candidate ranking.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Error returned when the source throttles us.
#[derive(Debug, Clone, Error)]
#[error("rate limited by the dataset source")]
pub struct RateLimitedError;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    RateLimited(#[from] RateLimitedError),

    #[error("dataset source request failed: {0}")]
    Request(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One search result from a dataset source.
#[derive(Debug, Clone)]
pub struct DatasetHit {
    /// Source-scoped identifier, e.g. `owner/dataset-name`.
    pub slug: String,
    pub title: String,
    pub total_bytes: u64,
    pub download_count: u64,
}

impl DatasetHit {
    #[must_use]
    pub fn size_gb(&self) -> f64 {
        self.total_bytes as f64 / BYTES_PER_GB
    }
}

/// Search-and-download access to a dataset provider.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    /// Returns candidates for the keyword list, best-effort ordered.
    async fn search(&self, keywords: &[String]) -> Result<Vec<DatasetHit>, SourceError>;

    /// Downloads the archive for `hit` into `dest_dir`, returning its path.
    async fn download(&self, hit: &DatasetHit, dest_dir: &Path) -> Result<PathBuf, SourceError>;
}

/// Ranks candidates and picks the best one under the size cap.
///
/// Scoring: keyword coverage dominates, download popularity breaks ties,
/// and a mid-range size (1-10 GB) is preferred over extremes. Candidates
/// over the cap or with no size information are skipped entirely.
#[must_use]
pub fn select_candidate(
    hits: &[DatasetHit],
    keywords: &[String],
    max_size_gb: f64,
) -> Option<DatasetHit> {
    let mut scored: Vec<(i64, &DatasetHit)> = hits
        .iter()
        .filter(|hit| {
            let size_gb = hit.size_gb();
            size_gb > 0.0 && size_gb <= max_size_gb
        })
        .map(|hit| (score(hit, keywords), hit))
        .collect();

    scored.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then_with(|| b.1.download_count.cmp(&a.1.download_count))
            .then_with(|| a.1.total_bytes.cmp(&b.1.total_bytes))
            .then_with(|| a.1.slug.cmp(&b.1.slug))
    });

    scored.first().map(|(candidate_score, hit)| {
        info!(
            slug = %hit.slug,
            score = *candidate_score,
            size_gb = hit.size_gb(),
            downloads = hit.download_count,
            "Selected dataset candidate"
        );
        (*hit).clone()
    })
}

fn score(hit: &DatasetHit, keywords: &[String]) -> i64 {
    let slug_lower = hit.slug.to_lowercase();
    let title_lower = hit.title.to_lowercase();

    let keyword_matches = keywords
        .iter()
        .filter(|kw| {
            let kw = kw.to_lowercase();
            slug_lower.contains(&kw) || title_lower.contains(&kw)
        })
        .count() as i64;
    let mut score = keyword_matches * 100;

    score += match hit.download_count {
        d if d > 1000 => 50,
        d if d > 100 => 25,
        d if d > 10 => 10,
        _ => 0,
    };

    let size_gb = hit.size_gb();
    score += if (1.0..=10.0).contains(&size_gb) {
        30
    } else if (0.1..1.0).contains(&size_gb) {
        15
    } else {
        5
    };

    score
}

/// Human-readable size recorded on the dataset row.
#[must_use]
pub fn format_size_gb(bytes: u64) -> String {
    format!("{:.2} GB", bytes as f64 / BYTES_PER_GB)
}

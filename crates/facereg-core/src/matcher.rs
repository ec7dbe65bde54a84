//! Nearest-person matching over a gallery snapshot.

use crate::types::{Embedding, MatchResult, Person};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Strategy for comparing a probe embedding against a gallery of persons.
///
/// A person's distance is the best distance over all of its embeddings.
/// Ties go to the person that appears first in `gallery`, so callers pass the
/// gallery in insertion order.
pub trait Matcher: Send + Sync {
    fn compare(&self, probe: &Embedding, gallery: &[Person], threshold: f32) -> MatchResult;

    /// Which metric this matcher implements.
    fn metric(&self) -> MatchMetric;
}

/// Distance metric selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMetric {
    Cosine,
    Euclidean,
}

impl MatchMetric {
    /// Acceptance threshold used when none is configured.
    ///
    /// Cosine: minimum similarity. Euclidean: maximum distance between
    /// unit vectors (≈ the same operating point as cosine 0.40).
    pub fn default_threshold(self) -> f32 {
        match self {
            MatchMetric::Cosine => 0.40,
            MatchMetric::Euclidean => 1.10,
        }
    }

    pub fn matcher(self) -> Box<dyn Matcher> {
        match self {
            MatchMetric::Cosine => Box::new(CosineMatcher),
            MatchMetric::Euclidean => Box::new(EuclideanMatcher),
        }
    }
}

impl fmt::Display for MatchMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchMetric::Cosine => f.write_str("cosine"),
            MatchMetric::Euclidean => f.write_str("euclidean"),
        }
    }
}

impl FromStr for MatchMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(MatchMetric::Cosine),
            "euclidean" | "l2" => Ok(MatchMetric::Euclidean),
            other => Err(format!("unknown match metric: {other}")),
        }
    }
}

/// Best (lowest) distance from `probe` to any of `person`'s embeddings.
///
/// Embeddings of a different dimension are not comparable and are skipped.
fn person_distance(
    probe: &Embedding,
    person: &Person,
    distance: impl Fn(&Embedding, &Embedding) -> f32,
) -> Option<f32> {
    person
        .embeddings
        .iter()
        .filter(|e| e.dim() == probe.dim())
        .map(|e| distance(probe, e))
        .fold(None, |best, d| match best {
            Some(b) if b <= d => Some(b),
            _ => Some(d),
        })
}

/// Scan the whole gallery and return the index and distance of the nearest
/// person. Strict `<` keeps the earliest person on ties.
fn nearest(
    probe: &Embedding,
    gallery: &[Person],
    distance: impl Fn(&Embedding, &Embedding) -> f32,
) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;

    // Always visit every entry, no early exit.
    for (i, person) in gallery.iter().enumerate() {
        let Some(d) = person_distance(probe, person, &distance) else {
            continue;
        };
        let better = match best {
            None => true,
            Some((_, best_d)) => d < best_d,
        };
        if better {
            best = Some((i, d));
        }
    }

    best
}

fn matched(person: &Person, distance: f32, confidence: f32) -> MatchResult {
    MatchResult {
        matched: true,
        distance,
        confidence,
        person_id: Some(person.id),
        name: Some(person.name.clone()),
    }
}

/// Cosine similarity matcher.
///
/// Distance is `1 - similarity`. A person is accepted when its similarity is
/// at least `threshold`. Confidence is the similarity scaled to [0, 100].
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[Person], threshold: f32) -> MatchResult {
        let Some((idx, distance)) = nearest(probe, gallery, |a, b| 1.0 - a.similarity(b)) else {
            return MatchResult::unmatched(f32::INFINITY);
        };

        let similarity = 1.0 - distance;
        if similarity >= threshold {
            matched(&gallery[idx], distance, similarity.clamp(0.0, 1.0) * 100.0)
        } else {
            MatchResult::unmatched(distance)
        }
    }

    fn metric(&self) -> MatchMetric {
        MatchMetric::Cosine
    }
}

/// Euclidean distance matcher.
///
/// A person is accepted when its distance is at most `threshold`. Confidence
/// is the cosine equivalent for unit vectors, `1 - d²/2`, scaled to [0, 100].
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[Person], threshold: f32) -> MatchResult {
        let Some((idx, distance)) = nearest(probe, gallery, Embedding::euclidean_distance) else {
            return MatchResult::unmatched(f32::INFINITY);
        };

        if distance <= threshold {
            let confidence = (1.0 - distance * distance / 2.0).clamp(0.0, 1.0) * 100.0;
            matched(&gallery[idx], distance, confidence)
        } else {
            MatchResult::unmatched(distance)
        }
    }

    fn metric(&self) -> MatchMetric {
        MatchMetric::Euclidean
    }
}

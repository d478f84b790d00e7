//! Distance-based comparison of encodings against enrolled templates.
//!
//! All thresholds are inclusive: a distance exactly equal to the threshold
//! counts as a match.

use facegate_vision::Encoding;

use crate::config::{DistanceMetric, MatchingConfig};
use crate::storage::FaceTemplate;

/// Per-cycle matching result surfaced to the session.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub identity: Option<String>,
    /// Advisory closeness in `[0, 1]`.
    pub similarity: f32,
    pub is_duplicate_of: Option<String>,
}

impl MatchResult {
    pub fn none(similarity: f32) -> Self {
        Self {
            identity: None,
            similarity,
            is_duplicate_of: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchingEngine {
    config: MatchingConfig,
}

impl Default for MatchingEngine {
    fn default() -> Self {
        Self::new(MatchingConfig::default())
    }
}

impl MatchingEngine {
    pub fn new(config: MatchingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    pub fn distance(&self, a: &Encoding, b: &Encoding) -> f32 {
        if a.len() != b.len() {
            return f32::INFINITY;
        }
        let (a, b) = (a.values(), b.values());
        match self.config.metric {
            DistanceMetric::Euclidean => {
                let diff = a - b;
                diff.dot(&diff).sqrt()
            }
            DistanceMetric::Cosine => {
                let norms = (a.dot(a) * b.dot(b)).sqrt();
                if norms == 0.0 {
                    return 1.0;
                }
                1.0 - (a.dot(b) / norms).clamp(-1.0, 1.0)
            }
        }
    }

    /// Map a distance onto `[0, 1]`, 1 meaning identical.
    pub fn similarity(&self, distance: f32) -> f32 {
        if distance.is_finite() {
            (1.0 - distance).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// 1:1 check against one template.
    pub fn verify(&self, encoding: &Encoding, template: &FaceTemplate) -> (bool, f32) {
        let distance = self.distance(encoding, &template.encoding);
        (
            distance <= self.config.threshold_verify,
            self.similarity(distance),
        )
    }

    /// 1:N search. `None` when nothing is close enough, or when another
    /// identity sits within `epsilon` of the best distance.
    pub fn identify(&self, encoding: &Encoding, templates: &[FaceTemplate]) -> Option<(String, f32)> {
        let (best, best_distance, runner_up) = self.rank(encoding, templates, None)?;
        if best_distance > self.config.threshold_identify {
            return None;
        }
        if let Some(second) = runner_up {
            if second - best_distance <= self.config.epsilon {
                log::debug!(
                    "ambiguous identification: {} at {:.4}, next at {:.4}",
                    best.identity,
                    best_distance,
                    second
                );
                return None;
            }
        }
        Some((best.identity.clone(), self.similarity(best_distance)))
    }

    /// Closest template of an identity other than `registering` within the
    /// identification threshold. Ties resolve to the closest, never to `None`.
    pub fn duplicate_of(
        &self,
        encoding: &Encoding,
        templates: &[FaceTemplate],
        registering: &str,
    ) -> Option<(String, f32)> {
        let (best, distance, _) = self.rank(encoding, templates, Some(registering))?;
        (distance <= self.config.threshold_identify)
            .then(|| (best.identity.clone(), self.similarity(distance)))
    }

    /// [`verify`](Self::verify) as a [`MatchResult`].
    pub fn verify_result(&self, encoding: &Encoding, template: &FaceTemplate) -> MatchResult {
        let (matched, similarity) = self.verify(encoding, template);
        MatchResult {
            identity: matched.then(|| template.identity.clone()),
            similarity,
            is_duplicate_of: None,
        }
    }

    /// [`identify`](Self::identify) as a [`MatchResult`]. On a miss the
    /// similarity of the closest template is still reported.
    pub fn identify_result(&self, encoding: &Encoding, templates: &[FaceTemplate]) -> MatchResult {
        match self.identify(encoding, templates) {
            Some((identity, similarity)) => MatchResult {
                identity: Some(identity),
                similarity,
                is_duplicate_of: None,
            },
            None => MatchResult::none(
                self.rank(encoding, templates, None)
                    .map(|(_, d, _)| self.similarity(d))
                    .unwrap_or(0.0),
            ),
        }
    }

    /// Duplicate scan for registering `identity`.
    pub fn registration_result(
        &self,
        encoding: &Encoding,
        templates: &[FaceTemplate],
        identity: &str,
    ) -> MatchResult {
        match self.duplicate_of(encoding, templates, identity) {
            Some((other, similarity)) => MatchResult {
                identity: None,
                similarity,
                is_duplicate_of: Some(other),
            },
            None => MatchResult {
                identity: Some(identity.to_string()),
                similarity: 1.0,
                is_duplicate_of: None,
            },
        }
    }

    /// Best template and its distance, plus the best distance of any other identity.
    fn rank<'a>(
        &self,
        encoding: &Encoding,
        templates: &'a [FaceTemplate],
        exclude: Option<&str>,
    ) -> Option<(&'a FaceTemplate, f32, Option<f32>)> {
        let mut scored: Vec<(&FaceTemplate, f32)> = templates
            .iter()
            .filter(|t| Some(t.identity.as_str()) != exclude)
            .map(|t| (t, self.distance(encoding, &t.encoding)))
            .filter(|(_, d)| d.is_finite())
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));

        let (best, best_distance) = *scored.first()?;
        let runner_up = scored
            .iter()
            .skip(1)
            .find(|(t, _)| t.identity != best.identity)
            .map(|(_, d)| *d);
        Some((best, best_distance, runner_up))
    }
}

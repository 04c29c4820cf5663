//! Similarity search over a gallery snapshot.
//!
//! The baseline is a brute-force linear scan, O(N·D) per query. An
//! approximate nearest-neighbour index can be slotted in behind [`Matcher`]
//! once galleries grow beyond a few thousand vectors.

use crate::store::Gallery;
use crate::types::{Match, Metric};

/// Strategy for comparing a probe vector against every enrolled embedding.
///
/// Callers have already checked that `probe` has the gallery's dimension.
pub trait Matcher {
    /// Closest stored embedding whose distance is `<= threshold`.
    fn best_match(&self, probe: &[f32], gallery: &Gallery, threshold: f64) -> Option<Match>;

    /// Best distance per identity, ascending, at most `k` entries.
    fn rank(&self, probe: &[f32], gallery: &Gallery, k: usize) -> Vec<Match>;
}

/// Exhaustive scan under a single metric.
///
/// Ties on distance go to the embedding inserted first.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearScan {
    pub metric: Metric,
}

impl LinearScan {
    pub fn new(metric: Metric) -> Self {
        Self { metric }
    }
}

/// (distance, insertion sequence): ordering key for candidates.
#[derive(Clone, Copy)]
struct Candidate {
    distance: f64,
    seq: u64,
}

impl Candidate {
    fn beats(&self, other: &Candidate) -> bool {
        self.distance < other.distance
            || (self.distance == other.distance && self.seq < other.seq)
    }
}

impl Matcher for LinearScan {
    fn best_match(&self, probe: &[f32], gallery: &Gallery, threshold: f64) -> Option<Match> {
        let mut best: Option<(Candidate, &str, &str)> = None;

        for identity in gallery.identities() {
            for stored in identity.vectors() {
                let candidate = Candidate {
                    distance: self.metric.distance(probe, stored.values()),
                    seq: stored.seq(),
                };
                let better = match &best {
                    None => true,
                    Some((prev, _, _)) => candidate.beats(prev),
                };
                if better {
                    best = Some((candidate, identity.name(), stored.id()));
                }
            }
        }

        match best {
            Some((c, name, id)) if c.distance <= threshold => Some(Match {
                name: name.to_string(),
                embedding_id: id.to_string(),
                distance: c.distance,
            }),
            Some((c, name, _)) => {
                tracing::debug!(
                    nearest = name,
                    distance = c.distance,
                    threshold,
                    "nearest identity above threshold"
                );
                None
            }
            None => None,
        }
    }

    fn rank(&self, probe: &[f32], gallery: &Gallery, k: usize) -> Vec<Match> {
        let mut per_identity: Vec<(Candidate, Match)> = Vec::with_capacity(gallery.identity_count());

        for identity in gallery.identities() {
            let mut best: Option<(Candidate, &str)> = None;
            for stored in identity.vectors() {
                let candidate = Candidate {
                    distance: self.metric.distance(probe, stored.values()),
                    seq: stored.seq(),
                };
                if best.as_ref().map_or(true, |(prev, _)| candidate.beats(prev)) {
                    best = Some((candidate, stored.id()));
                }
            }
            if let Some((c, id)) = best {
                per_identity.push((
                    c,
                    Match {
                        name: identity.name().to_string(),
                        embedding_id: id.to_string(),
                        distance: c.distance,
                    },
                ));
            }
        }

        per_identity.sort_by(|(a, _), (b, _)| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.seq.cmp(&b.seq))
        });
        per_identity.truncate(k);
        per_identity.into_iter().map(|(_, m)| m).collect()
    }
}

//! Reciprocal Rank Fusion

use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

/// Ranked list a candidate can come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchSource {
    /// Nearest neighbors by cosine similarity
    Dense,
    /// BM25 over tokenized content
    Lexical,
}

/// One ranked input list, best first
#[derive(Debug, Clone)]
pub struct RankedList {
    pub source: MatchSource,
    /// `(id, raw score)` in rank order
    pub hits: Vec<(Uuid, f64)>,
}

impl RankedList {
    pub fn new(source: MatchSource, hits: Vec<(Uuid, f64)>) -> Self {
        Self { source, hits }
    }
}

/// How one list contributed to a fused score
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contribution {
    pub source: MatchSource,
    /// 1-based rank within the source list
    pub rank: usize,
    pub raw_score: f64,
    /// `1 / (k + rank)`
    pub rrf_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedCandidate {
    pub id: Uuid,
    pub fused_score: f64,
    pub contributions: Vec<Contribution>,
}

impl FusedCandidate {
    pub fn contribution(&self, source: MatchSource) -> Option<&Contribution> {
        self.contributions.iter().find(|c| c.source == source)
    }
}

/// Fuse ranked lists: `score(d) = Σ 1 / (k + rank_i(d))` over the lists
/// containing `d`, with 1-based ranks.
///
/// A list that repeats an id only counts its best rank. Output is sorted by
/// fused score, ties broken by id.
pub fn reciprocal_rank_fusion(lists: &[RankedList], k: f64) -> Vec<FusedCandidate> {
    let mut fused: HashMap<Uuid, FusedCandidate> = HashMap::new();

    for list in lists {
        let mut rank = 0;
        for (id, raw_score) in &list.hits {
            let entry = fused.entry(*id).or_insert_with(|| FusedCandidate {
                id: *id,
                fused_score: 0.0,
                contributions: Vec::new(),
            });
            if entry.contribution(list.source).is_some() {
                continue;
            }
            rank += 1;
            let rrf_score = 1.0 / (k + rank as f64);
            entry.fused_score += rrf_score;
            entry.contributions.push(Contribution {
                source: list.source,
                rank,
                raw_score: *raw_score,
                rrf_score,
            });
        }
    }

    let mut out: Vec<FusedCandidate> = fused.into_values().collect();
    out.sort_by(|a, b| {
        b.fused_score
            .total_cmp(&a.fused_score)
            .then_with(|| a.id.cmp(&b.id))
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();
        ids.sort();
        ids
    }

    fn list(source: MatchSource, ids: &[Uuid]) -> RankedList {
        RankedList::new(
            source,
            ids.iter()
                .enumerate()
                .map(|(i, id)| (*id, 1.0 / (i as f64 + 1.0)))
                .collect(),
        )
    }

    fn score_of(fused: &[FusedCandidate], id: Uuid) -> f64 {
        fused
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.fused_score)
            .unwrap_or(0.0)
    }

    #[test]
    fn test_scores_sum_over_lists() {
        let d = ids(3);
        let fused = reciprocal_rank_fusion(
            &[
                list(MatchSource::Dense, &[d[0], d[1]]),
                list(MatchSource::Lexical, &[d[1], d[2]]),
            ],
            60.0,
        );

        assert_eq!(fused.len(), 3);
        assert_eq!(fused[0].id, d[1]);
        assert!((fused[0].fused_score - (1.0 / 62.0 + 1.0 / 61.0)).abs() < 1e-12);
        assert!((score_of(&fused, d[0]) - 1.0 / 61.0).abs() < 1e-12);
        assert!((score_of(&fused, d[2]) - 1.0 / 62.0).abs() < 1e-12);

        let lexical = fused[0].contribution(MatchSource::Lexical).unwrap();
        assert_eq!(lexical.rank, 1);
        assert_eq!(fused[1].id, d[0]);
        assert!(fused[1].contribution(MatchSource::Lexical).is_none());
    }

    #[test]
    fn test_duplicate_in_one_list_counts_once() {
        let d = ids(2);
        let fused = reciprocal_rank_fusion(
            &[RankedList::new(
                MatchSource::Lexical,
                vec![(d[0], 3.0), (d[0], 2.0), (d[1], 1.0)],
            )],
            60.0,
        );
        assert!((score_of(&fused, d[0]) - 1.0 / 61.0).abs() < 1e-12);
        assert!((score_of(&fused, d[1]) - 1.0 / 62.0).abs() < 1e-12);
    }

    #[test]
    fn test_improving_rank_never_lowers_score() {
        let d = ids(6);
        let target = d[5];
        let other: Vec<Uuid> = vec![d[2], target, d[4]];

        let mut previous = 0.0;
        // move the target from last place to first in the dense list
        for position in (0..6).rev() {
            let mut dense: Vec<Uuid> = d[..5].to_vec();
            dense.insert(position.min(dense.len()), target);
            let fused = reciprocal_rank_fusion(
                &[
                    list(MatchSource::Dense, &dense),
                    list(MatchSource::Lexical, &other),
                ],
                60.0,
            );
            let score = score_of(&fused, target);
            assert!(score >= previous, "score dropped at position {position}");
            previous = score;
        }
    }

    #[test]
    fn test_smaller_k_favors_top_ranks() {
        let d = ids(2);
        let lists = [list(MatchSource::Dense, &[d[0], d[1]])];
        let sharp = reciprocal_rank_fusion(&lists, 1.0);
        let flat = reciprocal_rank_fusion(&lists, 60.0);
        let ratio = |f: &[FusedCandidate]| score_of(f, d[0]) / score_of(f, d[1]);
        assert!(ratio(&sharp) > ratio(&flat));
    }

    #[test]
    fn test_empty_lists() {
        assert!(reciprocal_rank_fusion(&[], 60.0).is_empty());
        assert!(reciprocal_rank_fusion(&[RankedList::new(MatchSource::Dense, vec![])], 60.0).is_empty());
    }
}

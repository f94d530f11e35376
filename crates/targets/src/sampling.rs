//! Positive/negative subsampling
//!
//! When more candidates qualify than a cap allows, the sampler decides which
//! ones are kept. Selections are always returned in ascending index order.

use pyramid_rcnn_common::SamplingPolicy;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::cmp::Ordering;

/// Stage identifiers mixed into seeded streams
pub const STAGE_ANCHORS: u64 = 1;
pub const STAGE_ROIS: u64 = 2;

/// A positive candidate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub index: usize,
    /// Best `IoU` against ground truth
    pub iou: f32,
    /// Kept ahead of every other candidate (best match of some ground truth)
    pub forced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sampler {
    policy: SamplingPolicy,
    stage: u64,
}

impl Sampler {
    #[must_use]
    pub fn new(policy: SamplingPolicy, stage: u64) -> Self {
        Self { policy, stage }
    }

    #[must_use]
    pub fn policy(&self) -> SamplingPolicy {
        self.policy
    }

    /// Keep at most `cap` positives
    #[must_use]
    pub fn positives(&self, candidates: &[Candidate], cap: usize, image: usize) -> Vec<usize> {
        let mut ordered: Vec<Candidate> = candidates.to_vec();
        match self.policy {
            SamplingPolicy::Ranked => {
                ordered.sort_by(|a, b| {
                    b.forced
                        .cmp(&a.forced)
                        .then(b.iou.partial_cmp(&a.iou).unwrap_or(Ordering::Equal))
                        .then(a.index.cmp(&b.index))
                });
            }
            SamplingPolicy::Seeded { seed } => {
                let (mut forced, mut rest): (Vec<Candidate>, Vec<Candidate>) =
                    ordered.into_iter().partition(|c| c.forced);
                forced.sort_by_key(|c| c.index);
                rest.sort_by_key(|c| c.index);
                rest.shuffle(&mut self.rng(seed, image, 0));
                forced.extend(rest);
                ordered = forced;
            }
        }

        let mut kept: Vec<usize> = ordered.into_iter().take(cap).map(|c| c.index).collect();
        kept.sort_unstable();
        kept
    }

    /// Keep at most `cap` negatives out of `candidates` (ascending indices)
    #[must_use]
    pub fn negatives(&self, candidates: &[usize], cap: usize, image: usize) -> Vec<usize> {
        if candidates.len() <= cap {
            return candidates.to_vec();
        }
        let mut kept: Vec<usize> = match self.policy {
            SamplingPolicy::Ranked => {
                let n = candidates.len();
                (0..cap).map(|i| candidates[i * n / cap]).collect()
            }
            SamplingPolicy::Seeded { seed } => {
                let mut shuffled = candidates.to_vec();
                shuffled.shuffle(&mut self.rng(seed, image, 1));
                shuffled.truncate(cap);
                shuffled
            }
        };
        kept.sort_unstable();
        kept
    }

    fn rng(&self, seed: u64, image: usize, role: u64) -> StdRng {
        let stream = (self.stage << 32) ^ ((image as u64) << 1) ^ role;
        StdRng::seed_from_u64(seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }
}

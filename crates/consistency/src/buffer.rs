//! Ring buffer of big-object references and the consistency loss
//!
//! Each training pass pushes the pass's big-object class means into the ring
//! and compares the pass's small-object class means with the buffer-wide
//! reference. With capacity 1 the single slot is a running count-weighted
//! average over the whole history.

use crate::aggregate::StepFeatures;
use ndarray::{s, Array1, Array2, Array3, ArrayView2, Axis};
use pyramid_rcnn_common::{ConsistencyMetric, RcnnConfig, RcnnError, Result, EPS};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Distance between two `[n, dim]` arrays, averaged over every element
#[must_use]
pub fn distance(metric: ConsistencyMetric, a: ArrayView2<f32>, b: ArrayView2<f32>) -> f32 {
    let n = a.len();
    if n == 0 {
        return 0.0;
    }
    let total: f32 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| match metric {
            ConsistencyMetric::Mse => (x - y) * (x - y),
            ConsistencyMetric::L1 => (x - y).abs(),
        })
        .sum();
    total / n as f32
}

#[derive(Debug, Clone, PartialEq)]
struct BufferState {
    /// `[capacity, num_classes, dim]`
    features: Array3<f32>,
    /// `[capacity, num_classes]`
    counts: Array2<f32>,
}

/// Serializable copy of the buffer contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferSnapshot {
    pub capacity: usize,
    pub num_classes: usize,
    /// Zero while the buffer has not seen a descriptor
    pub dim: usize,
    /// Row-major `[capacity, num_classes, dim]`
    pub features: Vec<f32>,
    /// Row-major `[capacity, num_classes]`
    pub counts: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsistencyBuffer {
    capacity: usize,
    num_classes: usize,
    metric: ConsistencyMetric,
    state: Option<BufferState>,
}

impl ConsistencyBuffer {
    pub fn new(capacity: usize, num_classes: usize, metric: ConsistencyMetric) -> Result<Self> {
        if capacity == 0 {
            return Err(RcnnError::Config("buffer capacity must be at least 1".to_string()));
        }
        if num_classes < 2 {
            return Err(RcnnError::Config(format!(
                "at least 2 classes required, got {num_classes}"
            )));
        }
        Ok(Self {
            capacity,
            num_classes,
            metric,
            state: None,
        })
    }

    pub fn from_config(config: &RcnnConfig) -> Result<Self> {
        Self::new(config.dev.buffer_size, config.num_classes, config.dev.metric)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    #[must_use]
    pub fn metric(&self) -> ConsistencyMetric {
        self.metric
    }

    /// Descriptor dimension, known after the first observation
    #[must_use]
    pub fn dim(&self) -> Option<usize> {
        self.state.as_ref().map(|s| s.features.len_of(Axis(2)))
    }

    /// Per-class reference descriptor `[num_classes, dim]`
    #[must_use]
    pub fn reference(&self) -> Option<Array2<f32>> {
        let state = self.state.as_ref()?;
        if self.capacity == 1 {
            return Some(state.features.index_axis(Axis(0), 0).to_owned());
        }
        let weights = state.counts.view().insert_axis(Axis(2));
        let weighted = (&state.features * &weights).sum_axis(Axis(0));
        let totals = state.counts.sum_axis(Axis(0)).mapv(|c| c + EPS);
        Some(weighted / &totals.insert_axis(Axis(1)))
    }

    /// Per-class observation counts summed over the ring
    #[must_use]
    pub fn counts(&self) -> Option<Array1<f32>> {
        self.state.as_ref().map(|s| s.counts.sum_axis(Axis(0)))
    }

    /// Push one pass into the ring and return the consistency loss
    pub fn step(&mut self, step: &StepFeatures) -> Result<f32> {
        for aggregate in [&step.big, &step.small] {
            if aggregate.num_classes() != self.num_classes {
                return Err(RcnnError::Shape(format!(
                    "aggregate covers {} classes, buffer holds {}",
                    aggregate.num_classes(),
                    self.num_classes
                )));
            }
        }
        if step.big.dim() != step.small.dim() {
            return Err(RcnnError::Shape(format!(
                "big descriptors have dim {}, small descriptors {}",
                step.big.dim(),
                step.small.dim()
            )));
        }

        let dim = match (self.dim(), step.big.dim()) {
            (None, 0) => {
                debug!("Consistency buffer untouched: no descriptors yet");
                return Ok(0.0);
            }
            (None, d) => {
                self.state = Some(BufferState {
                    features: Array3::zeros((self.capacity, self.num_classes, d)),
                    counts: Array2::zeros((self.capacity, self.num_classes)),
                });
                debug!("Consistency buffer initialized with dim {}", d);
                d
            }
            (Some(d), 0) => d,
            (Some(d), s) if d == s => d,
            (Some(d), s) => {
                return Err(RcnnError::Shape(format!(
                    "descriptor dim {s}, buffer holds {d}"
                )));
            }
        };

        let (big_means, small_means) = if step.big.dim() == 0 {
            (
                Array2::zeros((self.num_classes, dim)),
                Array2::zeros((self.num_classes, dim)),
            )
        } else {
            (step.big.means.clone(), step.small.means.clone())
        };

        self.push(&big_means, &step.big.counts)?;
        let reference = self
            .reference()
            .ok_or_else(|| RcnnError::Shape("consistency buffer is empty".to_string()))?;

        let mut small_counts = step.small.counts.clone();
        small_counts[0] = 0.0;
        let observed: Vec<usize> = (0..self.num_classes)
            .filter(|&c| small_counts[c] != 0.0)
            .collect();
        if observed.is_empty() {
            debug!("No foreground small objects in this pass");
            return Ok(0.0);
        }

        let small = small_means.select(Axis(0), &observed);
        let big = reference.select(Axis(0), &observed);
        let loss = distance(self.metric, small.view(), big.view());
        debug!(
            "Consistency loss {:.6} over {} classes",
            loss,
            observed.len()
        );
        Ok(loss)
    }

    fn push(&mut self, means: &Array2<f32>, counts: &Array1<f32>) -> Result<()> {
        let capacity = self.capacity;
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| RcnnError::Shape("consistency buffer is empty".to_string()))?;

        if capacity == 1 {
            let mut features = state.features.index_axis_mut(Axis(0), 0);
            let mut held = state.counts.index_axis_mut(Axis(0), 0);
            let old = &features * &held.view().insert_axis(Axis(1));
            let new = means * &counts.view().insert_axis(Axis(1));
            held += counts;
            let denominator = held.mapv(|c| c + EPS).insert_axis(Axis(1));
            features.assign(&((old + new) / &denominator));
        } else {
            for k in 1..capacity {
                let features = state.features.index_axis(Axis(0), k).to_owned();
                state.features.index_axis_mut(Axis(0), k - 1).assign(&features);
                let counts = state.counts.index_axis(Axis(0), k).to_owned();
                state.counts.index_axis_mut(Axis(0), k - 1).assign(&counts);
            }
            state
                .features
                .slice_mut(s![capacity - 1, .., ..])
                .assign(means);
            state.counts.slice_mut(s![capacity - 1, ..]).assign(counts);
        }
        Ok(())
    }

    /// Forget every observation
    pub fn reset(&mut self) {
        self.state = None;
    }

    #[must_use]
    pub fn snapshot(&self) -> BufferSnapshot {
        match &self.state {
            Some(state) => BufferSnapshot {
                capacity: self.capacity,
                num_classes: self.num_classes,
                dim: state.features.len_of(Axis(2)),
                features: state.features.iter().copied().collect(),
                counts: state.counts.iter().copied().collect(),
            },
            None => BufferSnapshot {
                capacity: self.capacity,
                num_classes: self.num_classes,
                dim: 0,
                features: Vec::new(),
                counts: Vec::new(),
            },
        }
    }

    /// Load a snapshot taken from a buffer with the same capacity and classes
    pub fn restore(&mut self, snapshot: BufferSnapshot) -> Result<()> {
        if snapshot.capacity != self.capacity || snapshot.num_classes != self.num_classes {
            return Err(RcnnError::Shape(format!(
                "snapshot holds {} slots x {} classes, buffer {} x {}",
                snapshot.capacity, snapshot.num_classes, self.capacity, self.num_classes
            )));
        }
        if snapshot.dim == 0 {
            self.state = None;
            return Ok(());
        }
        if snapshot.counts.iter().any(|&c| c < 0.0) {
            return Err(RcnnError::Shape("snapshot holds negative counts".to_string()));
        }

        let features = Array3::from_shape_vec(
            (snapshot.capacity, snapshot.num_classes, snapshot.dim),
            snapshot.features,
        )?;
        let counts =
            Array2::from_shape_vec((snapshot.capacity, snapshot.num_classes), snapshot.counts)?;
        self.state = Some(BufferState { features, counts });
        Ok(())
    }
}

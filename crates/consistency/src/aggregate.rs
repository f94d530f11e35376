//! Per-class descriptor aggregates

use ndarray::{Array1, Array2, ArrayView2, Axis};
use pyramid_rcnn_common::{RcnnError, Result, EPS};
use pyramid_rcnn_roi_pooling::LevelDescriptors;

/// Mean descriptor and observation count per class
#[derive(Debug, Clone, PartialEq)]
pub struct ClassAggregate {
    /// `[num_classes, dim]`
    pub means: Array2<f32>,
    /// `[num_classes]`
    pub counts: Array1<f32>,
}

impl ClassAggregate {
    /// Aggregate with no observations
    #[must_use]
    pub fn empty(num_classes: usize, dim: usize) -> Self {
        Self {
            means: Array2::zeros((num_classes, dim)),
            counts: Array1::zeros(num_classes),
        }
    }

    /// Average `descriptors` (`[n, dim]`) per class id
    pub fn from_descriptors(
        class_ids: &[u32],
        descriptors: ArrayView2<f32>,
        num_classes: usize,
    ) -> Result<Self> {
        if class_ids.len() != descriptors.nrows() {
            return Err(RcnnError::Shape(format!(
                "{} class ids for {} descriptors",
                class_ids.len(),
                descriptors.nrows()
            )));
        }

        let mut sums = Self::empty(num_classes, descriptors.ncols());
        for (&class_id, row) in class_ids.iter().zip(descriptors.outer_iter()) {
            let class = class_id as usize;
            if class >= num_classes {
                return Err(RcnnError::Shape(format!(
                    "class id {class_id} outside 0..{num_classes}"
                )));
            }
            let mut mean = sums.means.row_mut(class);
            mean += &row;
            sums.counts[class] += 1.0;
        }

        for (mut mean, &count) in sums.means.outer_iter_mut().zip(sums.counts.iter()) {
            mean /= count + EPS;
        }
        Ok(sums)
    }

    /// Count-weighted merge of several aggregates
    ///
    /// Used across pyramid levels within a pass and across replicas of a batch.
    pub fn merge(parts: &[ClassAggregate]) -> Result<Self> {
        let Some(first) = parts.first() else {
            return Err(RcnnError::Shape("nothing to merge".to_string()));
        };
        let shape = first.means.dim();

        let mut weighted = Array2::<f32>::zeros(shape);
        let mut counts = Array1::<f32>::zeros(shape.0);
        for part in parts {
            if part.means.dim() != shape || part.counts.len() != shape.0 {
                return Err(RcnnError::Shape(format!(
                    "aggregate shape {:?} does not match {shape:?}",
                    part.means.dim()
                )));
            }
            weighted += &(&part.means * &part.counts.view().insert_axis(Axis(1)));
            counts += &part.counts;
        }

        let denominator = counts.mapv(|c| c + EPS).insert_axis(Axis(1));
        Ok(Self {
            means: weighted / &denominator,
            counts,
        })
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.means.ncols()
    }

    #[must_use]
    pub fn total_count(&self) -> f32 {
        self.counts.sum()
    }
}

/// Big- and small-object aggregates of one training pass
#[derive(Debug, Clone, PartialEq)]
pub struct StepFeatures {
    pub big: ClassAggregate,
    pub small: ClassAggregate,
}

impl StepFeatures {
    /// Merge the descriptors of every upsampled level
    ///
    /// With no levels the aggregates have dimension zero.
    pub fn from_levels(levels: &[LevelDescriptors], num_classes: usize) -> Result<Self> {
        let dim = levels.first().map_or(0, |l| l.small.ncols());

        let mut big = vec![ClassAggregate::empty(num_classes, dim)];
        let mut small = vec![ClassAggregate::empty(num_classes, dim)];
        for level in levels {
            big.push(ClassAggregate::from_descriptors(
                &level.big_class_ids,
                level.big.view(),
                num_classes,
            )?);
            small.push(ClassAggregate::from_descriptors(
                &level.small_class_ids,
                level.small.view(),
                num_classes,
            )?);
        }

        Ok(Self {
            big: ClassAggregate::merge(&big)?,
            small: ClassAggregate::merge(&small)?,
        })
    }

    /// Merge the step aggregates of several replicas
    pub fn merge(replicas: &[StepFeatures]) -> Result<Self> {
        let big: Vec<ClassAggregate> = replicas.iter().map(|r| r.big.clone()).collect();
        let small: Vec<ClassAggregate> = replicas.iter().map(|r| r.small.clone()).collect();
        Ok(Self {
            big: ClassAggregate::merge(&big)?,
            small: ClassAggregate::merge(&small)?,
        })
    }

    /// No descriptor was observed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.big.total_count() == 0.0 && self.small.total_count() == 0.0
    }
}

//! Per-ROI level routing and pooling
//!
//! Level assignment follows the FPN rule
//! ```text
//! level = clamp(round(4 + log2(sqrt(h * w) / (224 / sqrt(image_area)))), 2, 5)
//! ```
//! with `h`, `w` normalized and `image_area` in pixels. Rounding is half-to-even.
//!
//! In dynamic mode levels 2 and 3 are upsampled before their ROIs are cropped,
//! and the router emits two descriptor sets per upsampled level:
//! - small: the level's own ROIs, cropped from the upsampled map
//! - big: ROIs at least two levels coarser, cropped from the original map

use crate::trunk::{DescriptorTrunk, MeanPoolTrunk};
use crate::upsample::{BilinearUpsampler, FeatureUpsampler};
use ndarray::{Array2, Array4, ArrayView2, ArrayView3, ArrayView4, Axis};
use pyramid_rcnn_common::crop::crop_and_resize;
use pyramid_rcnn_common::{BoxCoords, RcnnConfig, RcnnError, Result, LEVEL_MAX, LEVEL_MIN};
use tracing::debug;

/// Levels that are upsampled in dynamic mode
const UPSAMPLED_LEVELS: usize = 2;

/// Chosen once at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterMode {
    /// Crop every ROI from its own level, nothing else
    Fixed,
    /// Upsample fine levels and emit consistency descriptors
    Dynamic,
}

/// Where one ROI is pooled from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoiRoute {
    pub image: usize,
    pub slot: usize,
    /// Pyramid level, 2..=5
    pub level: usize,
}

/// Pyramid level of a normalized box
#[must_use]
pub fn roi_level(bbox: &BoxCoords, image_area: f32) -> usize {
    let area = bbox.area();
    if area <= 0.0 || !area.is_finite() || image_area <= 0.0 {
        return LEVEL_MIN;
    }
    let level = 4.0 + (area.sqrt() / (224.0 / image_area.sqrt())).log2();
    level
        .round_ties_even()
        .clamp(LEVEL_MIN as f32, LEVEL_MAX as f32) as usize
}

/// Route every non-padded ROI of a `[batch, n, 4]` array
#[must_use]
pub fn assign_levels(rois: ArrayView3<f32>, image_area: f32) -> Vec<RoiRoute> {
    let mut routes = Vec::new();
    for (image, boxes) in rois.outer_iter().enumerate() {
        for (slot, bbox) in BoxCoords::rows(boxes).iter().enumerate() {
            if bbox.is_empty() {
                continue;
            }
            routes.push(RoiRoute {
                image,
                slot,
                level: roi_level(bbox, image_area),
            });
        }
    }
    routes
}

/// Descriptors produced on one upsampled level
#[derive(Debug, Clone, PartialEq)]
pub struct LevelDescriptors {
    pub level: usize,
    pub big_class_ids: Vec<u32>,
    /// `[big_class_ids.len(), dim]`
    pub big: Array2<f32>,
    pub small_class_ids: Vec<u32>,
    /// `[small_class_ids.len(), dim]`
    pub small: Array2<f32>,
}

/// Router output, ROI-major: row `image * n + slot`
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedFeatures {
    /// `[batch * n, channels, pool_size, pool_size]`
    pub classifier: Array4<f32>,
    /// `[batch * n, channels, mask_pool_size, mask_pool_size]`
    pub mask: Array4<f32>,
    /// Empty unless dynamic mode ran with class labels
    pub descriptors: Vec<LevelDescriptors>,
}

pub struct ScaleRouter {
    mode: RouterMode,
    pool_size: usize,
    mask_pool_size: usize,
    feat_pool_size: usize,
    image_area: f32,
    upsampler: Box<dyn FeatureUpsampler>,
    trunk: Box<dyn DescriptorTrunk>,
}

impl std::fmt::Debug for ScaleRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScaleRouter")
            .field("mode", &self.mode)
            .field("pool_size", &self.pool_size)
            .field("mask_pool_size", &self.mask_pool_size)
            .field("feat_pool_size", &self.feat_pool_size)
            .finish_non_exhaustive()
    }
}

impl ScaleRouter {
    /// Create a router; the mode follows `dev.enabled`
    pub fn new(
        config: &RcnnConfig,
        upsampler: Box<dyn FeatureUpsampler>,
        trunk: Box<dyn DescriptorTrunk>,
    ) -> Result<Self> {
        config.validate()?;
        let mode = if config.dev.enabled {
            RouterMode::Dynamic
        } else {
            RouterMode::Fixed
        };
        Ok(Self {
            mode,
            pool_size: config.heads.pool_size,
            mask_pool_size: config.heads.mask_pool_size,
            feat_pool_size: config.dev.feat_pool_size,
            image_area: config.image_area(),
            upsampler,
            trunk,
        })
    }

    /// Router with the parameter-free upsampler and trunk
    pub fn with_defaults(config: &RcnnConfig) -> Result<Self> {
        Self::new(config, Box::new(BilinearUpsampler), Box::new(MeanPoolTrunk))
    }

    #[must_use]
    pub fn mode(&self) -> RouterMode {
        self.mode
    }

    /// Pool every ROI
    ///
    /// # Arguments
    /// * `pyramid` - Feature maps starting at P2, at least four levels
    /// * `rois` - `[batch, n, 4]` normalized, zero rows are padding
    /// * `class_ids` - `[batch, n]` ROI classes; descriptors are only built when given
    pub fn route(
        &self,
        pyramid: &[Array4<f32>],
        rois: ArrayView3<f32>,
        class_ids: Option<ArrayView2<u32>>,
    ) -> Result<RoutedFeatures> {
        let (batch, slots, coords) = rois.dim();
        if coords != 4 {
            return Err(RcnnError::Shape(format!(
                "ROIs shape {:?}, expected [batch, n, 4]",
                rois.dim()
            )));
        }
        let levels = LEVEL_MAX - LEVEL_MIN + 1;
        if pyramid.len() < levels {
            return Err(RcnnError::Shape(format!(
                "{} feature maps, at least {levels} required",
                pyramid.len()
            )));
        }
        let channels = pyramid[0].len_of(Axis(1));
        for (i, map) in pyramid.iter().take(levels).enumerate() {
            if map.len_of(Axis(1)) != channels || map.len_of(Axis(0)) < batch {
                return Err(RcnnError::Shape(format!(
                    "P{} has shape {:?}, expected {batch} images with {channels} channels",
                    i + LEVEL_MIN,
                    map.dim()
                )));
            }
        }
        if let Some(ids) = class_ids {
            if ids.dim() != (batch, slots) {
                return Err(RcnnError::Shape(format!(
                    "ROI classes shape {:?}, expected ({batch}, {slots})",
                    ids.dim()
                )));
            }
        }

        let mut routed = RoutedFeatures {
            classifier: Array4::zeros((batch * slots, channels, self.pool_size, self.pool_size)),
            mask: Array4::zeros((
                batch * slots,
                channels,
                self.mask_pool_size,
                self.mask_pool_size,
            )),
            descriptors: Vec::new(),
        };

        let routes = assign_levels(rois, self.image_area);
        if routes.is_empty() {
            debug!("No ROIs to pool");
            return Ok(routed);
        }

        for level in LEVEL_MIN..=LEVEL_MAX {
            let members: Vec<RoiRoute> =
                routes.iter().copied().filter(|r| r.level == level).collect();
            if members.is_empty() {
                debug!("Level {} has no ROIs, skipped", level);
                continue;
            }

            let map = pyramid[level - LEVEL_MIN].view();
            let upsample =
                self.mode == RouterMode::Dynamic && level < LEVEL_MIN + UPSAMPLED_LEVELS;

            let upsampled;
            let source = if upsample {
                upsampled = self.upsampler.upsample(level, map)?;
                let (b, c, h, w) = map.dim();
                if upsampled.dim() != (b, c, h * 2, w * 2) {
                    return Err(RcnnError::Collaborator(format!(
                        "upsampler returned {:?} for P{level} of shape {:?}",
                        upsampled.dim(),
                        map.dim()
                    )));
                }
                upsampled.view()
            } else {
                map
            };

            let indices: Vec<usize> = members.iter().map(|r| r.image).collect();
            let boxes = pixel_boxes(rois, &members, source);
            let pooled = crop_and_resize(source, &boxes, &indices, [self.pool_size; 2])?;
            let mask_pooled =
                crop_and_resize(source, &boxes, &indices, [self.mask_pool_size; 2])?;

            for (k, route) in members.iter().enumerate() {
                let row = route.image * slots + route.slot;
                routed
                    .classifier
                    .index_axis_mut(Axis(0), row)
                    .assign(&pooled.index_axis(Axis(0), k));
                routed
                    .mask
                    .index_axis_mut(Axis(0), row)
                    .assign(&mask_pooled.index_axis(Axis(0), k));
            }
            debug!(
                "Level {}: pooled {} ROIs{}",
                level,
                members.len(),
                if upsample { " from upsampled map" } else { "" }
            );

            if let (true, Some(ids)) = (upsample, class_ids) {
                routed.descriptors.push(self.describe(
                    level,
                    map,
                    rois,
                    ids,
                    &routes,
                    &members,
                    mask_pooled.view(),
                )?);
            }
        }

        Ok(routed)
    }

    #[allow(clippy::too_many_arguments)]
    fn describe(
        &self,
        level: usize,
        map: ArrayView4<f32>,
        rois: ArrayView3<f32>,
        class_ids: ArrayView2<u32>,
        routes: &[RoiRoute],
        members: &[RoiRoute],
        mask_pooled: ArrayView4<f32>,
    ) -> Result<LevelDescriptors> {
        let small = self.extract(mask_pooled, members.len())?;
        let small_class_ids = members
            .iter()
            .map(|r| class_ids[[r.image, r.slot]])
            .collect();

        let big_members: Vec<RoiRoute> = routes
            .iter()
            .copied()
            .filter(|r| r.level >= level + 2)
            .collect();
        let big = if big_members.is_empty() {
            Array2::zeros((0, small.ncols()))
        } else {
            let indices: Vec<usize> = big_members.iter().map(|r| r.image).collect();
            let boxes = pixel_boxes(rois, &big_members, map);
            let crops = crop_and_resize(map, &boxes, &indices, [self.feat_pool_size; 2])?;
            self.extract(crops.view(), big_members.len())?
        };
        let big_class_ids = big_members
            .iter()
            .map(|r| class_ids[[r.image, r.slot]])
            .collect();

        debug!(
            "Level {}: {} small / {} big descriptors",
            level,
            members.len(),
            big_members.len()
        );
        Ok(LevelDescriptors {
            level,
            big_class_ids,
            big,
            small_class_ids,
            small,
        })
    }

    fn extract(&self, crops: ArrayView4<f32>, expected: usize) -> Result<Array2<f32>> {
        let descriptors = self.trunk.extract(crops)?;
        if descriptors.nrows() != expected {
            return Err(RcnnError::Collaborator(format!(
                "descriptor trunk returned {} rows for {expected} crops",
                descriptors.nrows()
            )));
        }
        Ok(descriptors)
    }
}

/// ROIs of `routes` in the pixel coordinates of `map`
fn pixel_boxes(rois: ArrayView3<f32>, routes: &[RoiRoute], map: ArrayView4<f32>) -> Vec<BoxCoords> {
    let (_, _, height, width) = map.dim();
    routes
        .iter()
        .map(|r| {
            let row = rois.slice(ndarray::s![r.image, r.slot, ..]);
            BoxCoords::new(row[0], row[1], row[2], row[3]).scale(height as f32, width as f32)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array3};
    use std::sync::{Arc, Mutex};

    struct CountingUpsampler {
        calls: Arc<Mutex<Vec<usize>>>,
    }

    impl FeatureUpsampler for CountingUpsampler {
        fn upsample(&self, level: usize, features: ArrayView4<f32>) -> Result<Array4<f32>> {
            self.calls.lock().unwrap().push(level);
            BilinearUpsampler.upsample(level, features)
        }
    }

    fn config(dev: bool) -> RcnnConfig {
        let mut config = RcnnConfig::default();
        config.dev.enabled = dev;
        config.heads.pool_size = 2;
        config.heads.mask_pool_size = 4;
        config.dev.feat_pool_size = 4;
        config
    }

    /// P2..P5 of a 1024 image, every cell holding its level number
    fn pyramid() -> Vec<Array4<f32>> {
        [256usize, 128, 64, 32]
            .iter()
            .enumerate()
            .map(|(i, &size)| Array4::from_elem((1, 2, size, size), (i + LEVEL_MIN) as f32))
            .collect()
    }

    fn rois(boxes: &[[f32; 4]], capacity: usize) -> Array3<f32> {
        let mut rois = Array3::zeros((1, capacity, 4));
        for (i, b) in boxes.iter().enumerate() {
            BoxCoords::from_array(*b).write_row(rois.slice_mut(s![0, i, ..]));
        }
        rois
    }

    const TINY: [f32; 4] = [0.5, 0.5, 0.5 + 16.0 / 1024.0, 0.5 + 16.0 / 1024.0];
    const FULL: [f32; 4] = [0.0, 0.0, 1.0, 1.0];

    #[test]
    fn test_level_formula() {
        let area = 1024.0 * 1024.0;
        let side = |px: f32| BoxCoords::new(0.0, 0.0, px / 1024.0, px / 1024.0);
        assert_eq!(roi_level(&side(224.0), area), 4);
        assert_eq!(roi_level(&side(112.0), area), 3);
        assert_eq!(roi_level(&side(16.0), area), 2);
        assert_eq!(roi_level(&side(1024.0), area), 5);
        assert_eq!(roi_level(&BoxCoords::default(), area), LEVEL_MIN);
    }

    #[test]
    fn test_padded_rois_get_no_route() {
        let rois = rois(&[TINY], 3);
        let routes = assign_levels(rois.view(), 1024.0 * 1024.0);
        assert_eq!(
            routes,
            vec![RoiRoute {
                image: 0,
                slot: 0,
                level: 2
            }]
        );
    }

    #[test]
    fn test_fixed_mode_pools_from_own_level() {
        let router = ScaleRouter::with_defaults(&config(false)).unwrap();
        assert_eq!(router.mode(), RouterMode::Fixed);

        let rois = rois(&[TINY, FULL], 3);
        let class_ids = Array2::from_elem((1, 3), 1u32);
        let routed = router
            .route(&pyramid(), rois.view(), Some(class_ids.view()))
            .unwrap();

        assert_eq!(routed.classifier.dim(), (3, 2, 2, 2));
        assert_eq!(routed.mask.dim(), (3, 2, 4, 4));
        assert!(routed
            .classifier
            .index_axis(Axis(0), 0)
            .iter()
            .all(|&v| (v - 2.0).abs() < 1e-6));
        assert!(routed
            .classifier
            .index_axis(Axis(0), 1)
            .iter()
            .all(|&v| (v - 5.0).abs() < 1e-6));
        // padded slot pools to zeros
        assert!(routed.mask.index_axis(Axis(0), 2).iter().all(|&v| v == 0.0));
        assert!(routed.descriptors.is_empty());
    }

    #[test]
    fn test_dynamic_upsamples_only_fine_levels() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let router = ScaleRouter::new(
            &config(true),
            Box::new(CountingUpsampler {
                calls: Arc::clone(&calls),
            }),
            Box::new(MeanPoolTrunk),
        )
        .unwrap();

        let rois = rois(&[TINY, FULL], 4);
        let mut class_ids = Array2::zeros((1, 4));
        class_ids[[0, 0]] = 1;
        class_ids[[0, 1]] = 3;
        let routed = router
            .route(&pyramid(), rois.view(), Some(class_ids.view()))
            .unwrap();

        // tiny box lives on P2 and is upsampled; the full-image box on P5 is not
        assert_eq!(*calls.lock().unwrap(), vec![2]);
        assert!(routed
            .classifier
            .index_axis(Axis(0), 0)
            .iter()
            .all(|&v| (v - 2.0).abs() < 1e-6));

        assert_eq!(routed.descriptors.len(), 1);
        let level2 = &routed.descriptors[0];
        assert_eq!(level2.level, 2);
        assert_eq!(level2.small_class_ids, vec![1]);
        assert_eq!(level2.big_class_ids, vec![3]);
        assert_eq!(level2.small.dim(), (1, 2));
        assert_eq!(level2.big.dim(), (1, 2));
        // big box cropped from the unmodified P2 map
        assert!(level2.big.iter().all(|&v| (v - 2.0).abs() < 1e-6));
    }

    #[test]
    fn test_dynamic_padded_slots_pool_to_zeros() {
        let router = ScaleRouter::with_defaults(&config(true)).unwrap();
        assert_eq!(router.mode(), RouterMode::Dynamic);

        // image 0 holds one tiny ROI, image 1 is all padding
        let two_images: Vec<Array4<f32>> = pyramid()
            .into_iter()
            .map(|level| {
                let (_, channels, h, w) = level.dim();
                Array4::from_shape_fn((2, channels, h, w), |(_, c, y, x)| level[[0, c, y, x]])
            })
            .collect();
        let mut rois = Array3::zeros((2, 3, 4));
        BoxCoords::from_array(TINY).write_row(rois.slice_mut(s![0, 0, ..]));
        let mut class_ids = Array2::zeros((2, 3));
        class_ids[[0, 0]] = 1;

        let routed = router
            .route(&two_images, rois.view(), Some(class_ids.view()))
            .unwrap();
        assert_eq!(routed.classifier.dim(), (6, 2, 2, 2));
        assert_eq!(routed.mask.dim(), (6, 2, 4, 4));
        assert!(routed
            .classifier
            .index_axis(Axis(0), 0)
            .iter()
            .all(|&v| (v - 2.0).abs() < 1e-6));
        for row in 1..6 {
            assert!(routed.classifier.index_axis(Axis(0), row).iter().all(|&v| v == 0.0));
            assert!(routed.mask.index_axis(Axis(0), row).iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn test_no_descriptors_without_labels() {
        let router = ScaleRouter::with_defaults(&config(true)).unwrap();
        let rois = rois(&[TINY, FULL], 2);
        let routed = router.route(&pyramid(), rois.view(), None).unwrap();
        assert!(routed.descriptors.is_empty());
    }

    #[test]
    fn test_empty_rois_yield_zero_tensors() {
        let router = ScaleRouter::with_defaults(&config(true)).unwrap();
        let rois = Array3::zeros((1, 5, 4));
        let routed = router.route(&pyramid(), rois.view(), None).unwrap();
        assert_eq!(routed.classifier.dim(), (5, 2, 2, 2));
        assert!(routed.classifier.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_shape_errors() {
        let router = ScaleRouter::with_defaults(&config(false)).unwrap();
        let rois = rois(&[TINY], 2);
        assert!(matches!(
            router.route(&pyramid()[..3], rois.view(), None),
            Err(RcnnError::Shape(_))
        ));

        let wrong_ids = Array2::<u32>::zeros((1, 5));
        assert!(matches!(
            router.route(&pyramid(), rois.view(), Some(wrong_ids.view())),
            Err(RcnnError::Shape(_))
        ));
    }
}

// 该文件是 Resistenz 项目的一部分。
// src/anchor.rs - 锚框匹配
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use ndarray::{Array4, ArrayView1, ArrayView2, ArrayView5, s};
use tracing::debug;

use crate::{
  config::ModelConfig,
  geometry::{OrientedRect, adjusted_iou},
  grid::{CONFIDENCE, GridError, GridShape, slot_rect},
};

/// 标签置信度高于该值的单元视为有目标（标签只取 0 或 1）
const OCCUPIED: f32 = 0.5;

/// 每个 (图像, 行, 列, 锚框) 的匹配结果，取值 0 或 1，三者互斥
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorMasks {
  /// 负责该单元目标的锚框
  pub active: Array4<f32>,
  /// 与目标足够接近：不施加无目标惩罚，也不向目标回归
  pub passive: Array4<f32>,
  /// 置信度被压向 0 的锚框
  pub inactive: Array4<f32>,
  /// 角度加权 IoU
  pub iou: Array4<f32>,
}

impl AnchorMasks {
  pub fn active_count(&self) -> f32 {
    self.active.sum()
  }

  pub fn passive_count(&self) -> f32 {
    self.passive.sum()
  }

  pub fn inactive_count(&self) -> f32 {
    self.inactive.sum()
  }

  /// 单元 (b, row, col) 中被激活的锚框
  pub fn active_anchor(&self, b: usize, row: usize, col: usize) -> Option<usize> {
    self
      .active
      .slice(s![b, row, col, ..])
      .iter()
      .position(|&a| a > 0.0)
  }
}

/// 把单元内偏移换算到图像归一化坐标（同一单元内，单元原点在 IoU 中抵消）
fn in_image_units(slot: ArrayView1<f32>, grid_size: usize) -> OrientedRect {
  let mut rect = slot_rect(slot);
  rect.center = [rect.center[0] / grid_size as f32, rect.center[1] / grid_size as f32];
  rect
}

/// 一个单元内各锚框与标签的角度加权 IoU
pub fn cell_ious(anchors: ArrayView2<f32>, label: ArrayView1<f32>, grid_size: usize) -> Vec<f32> {
  let label = in_image_units(label, grid_size);
  anchors
    .outer_iter()
    .map(|anchor| adjusted_iou(&in_image_units(anchor, grid_size), &label))
    .collect()
}

/// 最大值下标，相同时取最小下标
fn best_anchor(ious: &[f32]) -> usize {
  let mut best = 0;
  for (i, &iou) in ious.iter().enumerate() {
    if iou > ious[best] {
      best = i;
    }
  }
  best
}

#[derive(Debug, Clone)]
pub struct AnchorMatcher {
  prediction: GridShape,
  label: GridShape,
  iou_threshold: f32,
}

impl AnchorMatcher {
  pub fn new(config: &ModelConfig) -> Self {
    AnchorMatcher {
      prediction: GridShape::prediction(config),
      label: GridShape::label(config),
      iou_threshold: config.iou_threshold(),
    }
  }

  /// 训练开始前即可调用，形状不符直接报错，不做隐式广播
  pub fn check_shapes(&self, prediction: &ArrayView5<f32>, label: &ArrayView5<f32>) -> Result<usize, GridError> {
    let batch = self.prediction.check_batch(prediction)?;
    let label_batch = self.label.check_batch(label)?;
    if batch != label_batch {
      return Err(GridError::BatchMismatch {
        prediction: batch,
        label: label_batch,
      });
    }
    Ok(batch)
  }

  /// `prediction` 为解码后的批量网格 `[B, N, N, D, C]`，`label` 为 `[B, N, N, 1, C]`
  ///
  /// 每个单元中 IoU 最大的锚框（相同时取下标最小者）在单元有目标时成为 active；
  /// 其余 IoU ≥ 阈值的锚框为 passive；剩下的锚框以及空单元中的全部锚框为 inactive。
  pub fn match_anchors(&self, prediction: ArrayView5<f32>, label: ArrayView5<f32>) -> Result<AnchorMasks, GridError> {
    let batch = self.check_shapes(&prediction, &label)?;
    let n = self.prediction.grid_size;
    let depth = self.prediction.depth;

    let dims = (batch, n, n, depth);
    let mut masks = AnchorMasks {
      active: Array4::zeros(dims),
      passive: Array4::zeros(dims),
      inactive: Array4::ones(dims),
      iou: Array4::zeros(dims),
    };

    for b in 0..batch {
      for row in 0..n {
        for col in 0..n {
          let target = label.slice(s![b, row, col, 0, ..]);
          let ious = cell_ious(prediction.slice(s![b, row, col, .., ..]), target, n);
          for (d, &iou) in ious.iter().enumerate() {
            masks.iou[[b, row, col, d]] = iou;
          }

          if target[CONFIDENCE] <= OCCUPIED {
            continue;
          }

          let best = best_anchor(&ious);
          for (d, &iou) in ious.iter().enumerate() {
            let index = [b, row, col, d];
            if d == best {
              masks.active[index] = 1.0;
              masks.inactive[index] = 0.0;
            } else if iou >= self.iou_threshold {
              masks.passive[index] = 1.0;
              masks.inactive[index] = 0.0;
            }
          }
        }
      }
    }

    debug!(
      "锚框匹配: active {}, passive {}, inactive {}",
      masks.active_count(),
      masks.passive_count(),
      masks.inactive_count()
    );

    Ok(masks)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    config::Prior,
    grid::{ANGLE, BOX_CHANNELS, CENTER, GridBatch, SIZE},
  };
  use ndarray::{Array1, Array5, Axis, array};

  fn config(iou_threshold: f32) -> ModelConfig {
    ModelConfig::builder()
      .grid_size(2)
      .priors(vec![
        Prior::new(0.1, 0.1),
        Prior::new(0.2, 0.1),
        Prior::new(0.4, 0.4),
      ])
      .iou_threshold(iou_threshold)
      .build()
      .unwrap()
  }

  fn slot(cx: f32, cy: f32, w: f32, h: f32, theta: f32, conf: f32) -> Array1<f32> {
    array![cx, cy, w, h, theta.cos(), theta.sin(), conf]
  }

  fn batches(anchors: &[Array1<f32>], label: Array1<f32>) -> (GridBatch, GridBatch) {
    let mut prediction = Array5::zeros((1, 2, 2, anchors.len(), BOX_CHANNELS));
    for (d, anchor) in anchors.iter().enumerate() {
      prediction.slice_mut(s![0, 0, 0, d, ..]).assign(anchor);
    }
    // 其他单元的锚框给一个合法的默认形状
    for row in 0..2 {
      for col in 0..2 {
        if (row, col) != (0, 0) {
          for d in 0..anchors.len() {
            prediction
              .slice_mut(s![0, row, col, d, ..])
              .assign(&slot(0.5, 0.5, 0.1, 0.1, 0.0, 0.2));
          }
        }
      }
    }
    let mut labels = Array5::zeros((1, 2, 2, 1, BOX_CHANNELS));
    labels.slice_mut(s![0, 0, 0, 0, ..]).assign(&label);
    (prediction, labels)
  }

  fn assert_disjoint(masks: &AnchorMasks) {
    for ((a, p), i) in masks.active.iter().zip(&masks.passive).zip(&masks.inactive) {
      assert_eq!(a + p + i, 1.0);
      assert!(a + p <= 1.0);
      assert_eq!(a * i, 0.0);
    }
  }

  #[test]
  fn exact_match_is_active_and_others_inactive() {
    let label = slot(0.4, 0.6, 0.2, 0.1, 0.3, 1.0);
    let anchors = [
      slot(0.4, 0.6, 0.05, 0.05, 0.3, 0.1),
      label.clone(),
      slot(0.4, 0.6, 0.2, 0.1, 1.8, 0.3),
    ];
    let (prediction, labels) = batches(&anchors, label);
    let masks = AnchorMatcher::new(&config(0.5))
      .match_anchors(prediction.view(), labels.view())
      .unwrap();

    assert_eq!(masks.active_anchor(0, 0, 0), Some(1));
    assert_eq!(masks.inactive.slice(s![0, 0, 0, ..]).to_vec(), vec![1.0, 0.0, 1.0]);
    assert!((masks.iou[[0, 0, 0, 1]] - 1.0).abs() < 1e-5);
    assert!(masks.iou[[0, 0, 0, 0]] < 1.0);
    assert!(masks.iou[[0, 0, 0, 2]] < 1.0);
    assert_disjoint(&masks);
  }

  #[test]
  fn perturbations_lower_the_score() {
    let label = slot(0.5, 0.5, 0.2, 0.1, 0.3, 1.0);
    let mut wider = label.clone();
    wider[SIZE.start] = 0.21;
    let mut turned = label.clone();
    turned[ANGLE.start] = 0.35f32.cos();
    turned[ANGLE.start + 1] = 0.35f32.sin();
    let mut shifted = label.clone();
    shifted[CENTER.start] = 0.52;

    let exact = cell_ious(label.view().insert_axis(Axis(0)), label.view(), 2)[0];
    for anchor in [wider, turned, shifted] {
      let iou = cell_ious(anchor.view().insert_axis(Axis(0)), label.view(), 2)[0];
      assert!(iou < exact, "{} !< {}", iou, exact);
    }
  }

  #[test]
  fn close_runner_up_is_passive() {
    let label = slot(0.5, 0.5, 0.2, 0.1, 0.0, 1.0);
    let anchors = [
      slot(0.5, 0.5, 0.2, 0.1, 0.0, 0.9),
      slot(0.5, 0.5, 0.19, 0.1, 0.0, 0.5),
      slot(0.5, 0.5, 0.05, 0.05, 0.0, 0.1),
    ];
    let (prediction, labels) = batches(&anchors, label);
    let masks = AnchorMatcher::new(&config(0.5))
      .match_anchors(prediction.view(), labels.view())
      .unwrap();

    assert_eq!(masks.active.slice(s![0, 0, 0, ..]).to_vec(), vec![1.0, 0.0, 0.0]);
    assert_eq!(masks.passive.slice(s![0, 0, 0, ..]).to_vec(), vec![0.0, 1.0, 0.0]);
    assert_eq!(masks.inactive.slice(s![0, 0, 0, ..]).to_vec(), vec![0.0, 0.0, 1.0]);
    assert_disjoint(&masks);
  }

  #[test]
  fn empty_cells_are_all_inactive() {
    let anchors = [0.2, 0.5, 0.8].map(|conf| slot(0.5, 0.5, 0.1, 0.1, 0.0, conf));
    let (prediction, labels) = batches(&anchors, slot(0.5, 0.5, 0.1, 0.1, 0.0, 0.0));
    let masks = AnchorMatcher::new(&config(0.5))
      .match_anchors(prediction.view(), labels.view())
      .unwrap();
    assert_eq!(masks.active_count(), 0.0);
    assert_eq!(masks.passive_count(), 0.0);
    assert_eq!(masks.inactive_count(), 12.0);
  }

  #[test]
  fn ties_pick_lowest_anchor() {
    let label = slot(0.5, 0.5, 0.2, 0.1, 0.0, 1.0);
    let anchors = [label.clone(), label.clone(), label.clone()];
    let (prediction, labels) = batches(&anchors, label);
    let masks = AnchorMatcher::new(&config(0.99))
      .match_anchors(prediction.view(), labels.view())
      .unwrap();
    assert_eq!(masks.active_anchor(0, 0, 0), Some(0));
    assert_eq!(masks.passive_count(), 2.0);
  }

  #[test]
  fn shape_mismatch_fails_fast() {
    let matcher = AnchorMatcher::new(&config(0.5));
    let prediction = Array5::<f32>::zeros((2, 2, 2, 3, BOX_CHANNELS));
    let labels = Array5::<f32>::zeros((1, 2, 2, 1, BOX_CHANNELS));
    assert_eq!(
      matcher.match_anchors(prediction.view(), labels.view()),
      Err(GridError::BatchMismatch {
        prediction: 2,
        label: 1
      })
    );

    let deep_labels = Array5::<f32>::zeros((2, 2, 2, 3, BOX_CHANNELS));
    assert!(matches!(
      matcher.match_anchors(prediction.view(), deep_labels.view()),
      Err(GridError::ShapeMismatch { .. })
    ));
  }
}

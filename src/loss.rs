// 该文件是 Resistenz 项目的一部分。
// src/loss.rs - 损失组装
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

use ndarray::{ArrayView5, s};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
  anchor::{AnchorMasks, AnchorMatcher},
  color::{group_ranges, log_softmax},
  config::{LossWeights, ModelConfig},
  geometry::{EPSILON, cosine_similarity},
  grid::{ANGLE, CENTER, COLOR_START, CONFIDENCE, GridError, SIZE},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
  Weight,
  /// 归一化层的参数不参与权重衰减
  Normalization,
}

/// 可训练参数的只读视图
#[derive(Debug, Clone, Copy)]
pub struct Parameter<'a> {
  pub name: &'a str,
  pub kind: ParameterKind,
  pub values: &'a [f32],
}

impl<'a> Parameter<'a> {
  pub fn weight(name: &'a str, values: &'a [f32]) -> Self {
    Parameter {
      name,
      kind: ParameterKind::Weight,
      values,
    }
  }

  pub fn normalization(name: &'a str, values: &'a [f32]) -> Self {
    Parameter {
      name,
      kind: ParameterKind::Normalization,
      values,
    }
  }
}

/// 一个批次的损失及各子项
///
/// `center`、`size`、`angle` 为未乘 λ_coord 的原始项，`coordinate` 为加权后的和。
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossMetrics {
  pub objectness: f32,
  pub no_objectness: f32,
  pub coordinate: f32,
  pub center: f32,
  pub size: f32,
  pub angle: f32,
  pub classification: f32,
  pub regularization: f32,
  pub mean_iou: f32,
  pub total: f32,
  pub active_anchors: f32,
  pub passive_anchors: f32,
}

/// λ·Σw²/2，跳过归一化层参数
pub fn weight_decay(parameters: &[Parameter], lambda: f32) -> f32 {
  let sum = parameters
    .iter()
    .filter(|p| p.kind == ParameterKind::Weight)
    .flat_map(|p| p.values.iter())
    .fold(0.0f32, |acc, w| acc + w * w);
  lambda * sum / 2.0
}

#[derive(Debug, Clone)]
pub struct LossAssembler {
  matcher: AnchorMatcher,
  weights: LossWeights,
  color_bands: bool,
}

impl LossAssembler {
  pub fn new(config: &ModelConfig) -> Self {
    LossAssembler {
      matcher: AnchorMatcher::new(config),
      weights: *config.weights(),
      color_bands: config.color_bands(),
    }
  }

  pub fn matcher(&self) -> &AnchorMatcher {
    &self.matcher
  }

  /// `prediction` 为训练模式下的解码结果（色环通道保留 logits）
  pub fn compute(
    &self,
    prediction: ArrayView5<f32>,
    label: ArrayView5<f32>,
    parameters: &[Parameter],
  ) -> Result<LossMetrics, GridError> {
    let masks = self.matcher.match_anchors(prediction, label)?;
    self.assemble(prediction, label, &masks, parameters)
  }

  /// 用已有的匹配结果组装损失
  pub fn assemble(
    &self,
    prediction: ArrayView5<f32>,
    label: ArrayView5<f32>,
    masks: &AnchorMasks,
    parameters: &[Parameter],
  ) -> Result<LossMetrics, GridError> {
    self.matcher.check_shapes(&prediction, &label)?;
    let w = &self.weights;

    let confidence = prediction.slice(s![.., .., .., .., CONFIDENCE]);
    let n_active = masks.active_count();
    let n_inactive = masks.inactive_count();

    let objectness = (&masks.active * &confidence.mapv(|c| (c - 1.0).powi(2))).sum();
    let no_objectness = (&masks.inactive * &confidence.mapv(|c| c * c)).sum();

    let mut center = 0.0;
    let mut size = 0.0;
    let mut angle = 0.0;
    let mut iou = 0.0;
    let mut classification = 0.0;
    let mut colored_cells = 0.0;

    for ((b, row, col, d), &active) in masks.active.indexed_iter() {
      if active <= 0.0 {
        continue;
      }
      let p = prediction.slice(s![b, row, col, d, ..]);
      let t = label.slice(s![b, row, col, 0, ..]);

      // 每个分量取均值
      center += CENTER.map(|i| (p[i] - t[i]).powi(2)).sum::<f32>() / CENTER.len() as f32;
      size += SIZE
        .map(|i| (p[i].max(0.0).sqrt() - t[i].max(0.0).sqrt()).powi(2))
        .sum::<f32>()
        / SIZE.len() as f32;
      let similarity = cosine_similarity(
        [p[ANGLE.start], p[ANGLE.start + 1]],
        [t[ANGLE.start], t[ANGLE.start + 1]],
      );
      angle += 1.0 - similarity;
      iou += masks.iou[[b, row, col, d]];

      // 色环属于目标本身，每个单元只在其 active 锚框上计一次
      if self.color_bands {
        let target = t.slice(s![COLOR_START..]);
        if target.sum() > 0.0 {
          let logits = p.slice(s![COLOR_START..]);
          for range in group_ranges() {
            let logits = logits.slice(s![range.clone()]).to_vec();
            let logp = log_softmax(&logits);
            classification -= target
              .slice(s![range])
              .iter()
              .zip(logp)
              .map(|(t, l)| t * l)
              .sum::<f32>();
          }
          colored_cells += 1.0;
        }
      }
    }

    let active_norm = n_active + EPSILON;
    let center = center / active_norm;
    let size = size / active_norm;
    let angle = angle / active_norm;

    let mut metrics = LossMetrics {
      objectness: w.obj * objectness / active_norm,
      no_objectness: w.no_obj * no_objectness / (n_inactive + EPSILON),
      coordinate: w.coord * (center + size + w.angle * angle),
      center,
      size,
      angle,
      classification: w.class * classification / (colored_cells + EPSILON),
      regularization: weight_decay(parameters, w.weight_decay),
      mean_iou: iou / active_norm,
      total: 0.0,
      active_anchors: n_active,
      passive_anchors: masks.passive_count(),
    };
    metrics.total = metrics.objectness
      + metrics.no_objectness
      + metrics.coordinate
      + metrics.classification
      + metrics.regularization;

    debug!(
      "损失: 总计 {:.5}, 目标 {:.5}, 无目标 {:.5}, 坐标 {:.5}, 分类 {:.5}, 正则 {:.5}, 平均 IoU {:.4}",
      metrics.total,
      metrics.objectness,
      metrics.no_objectness,
      metrics.coordinate,
      metrics.classification,
      metrics.regularization,
      metrics.mean_iou
    );

    Ok(metrics)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    color::{COLOR_CHANNELS, ColorBands},
    config::Prior,
    grid::{BOX_CHANNELS, GridBatch},
  };
  use approx::assert_abs_diff_eq;
  use ndarray::{Array5, array};

  fn config(priors: usize, color_bands: bool) -> ModelConfig {
    ModelConfig::builder()
      .grid_size(2)
      .priors(vec![Prior::new(0.2, 0.1); priors])
      .color_bands(color_bands)
      .weights(LossWeights {
        weight_decay: 0.1,
        ..LossWeights::default()
      })
      .build()
      .unwrap()
  }

  /// 单元 (0, 0) 中有一个目标
  fn label(channels: usize) -> GridBatch {
    let mut label = Array5::zeros((1, 2, 2, 1, channels));
    label
      .slice_mut(s![0, 0, 0, 0, ..BOX_CHANNELS])
      .assign(&array![0.4, 0.6, 0.2, 0.1, 0.3f32.cos(), 0.3f32.sin(), 1.0]);
    label
  }

  fn exact_prediction(label: &GridBatch, depth: usize) -> GridBatch {
    let (b, n, _, _, c) = label.dim();
    let mut prediction = Array5::zeros((b, n, n, depth, c));
    for d in 0..depth {
      prediction
        .slice_mut(s![.., .., .., d, ..])
        .assign(&label.slice(s![.., .., .., 0, ..]));
    }
    prediction
  }

  fn total(assembler: &LossAssembler, prediction: &GridBatch, label: &GridBatch) -> LossMetrics {
    assembler
      .compute(prediction.view(), label.view(), &[])
      .unwrap()
  }

  #[test]
  fn exact_prediction_has_zero_loss() {
    let assembler = LossAssembler::new(&config(1, false));
    let label = label(BOX_CHANNELS);
    let metrics = total(&assembler, &exact_prediction(&label, 1), &label);
    assert_abs_diff_eq!(metrics.total, 0.0, epsilon = 1e-5);
    assert_abs_diff_eq!(metrics.mean_iou, 1.0, epsilon = 1e-5);
    assert_eq!(metrics.active_anchors, 1.0);
  }

  #[test]
  fn loss_grows_with_perturbation() {
    let assembler = LossAssembler::new(&config(1, false));
    let label = label(BOX_CHANNELS);

    let perturb = |channel: usize, delta: f32| {
      let mut prediction = exact_prediction(&label, 1);
      prediction[[0, 0, 0, 0, channel]] += delta;
      total(&assembler, &prediction, &label).total
    };

    for channel in [CENTER.start, CENTER.start + 1, SIZE.start, SIZE.start + 1] {
      let losses: Vec<f32> = [0.0, 0.01, 0.03, 0.06].iter().map(|&d| perturb(channel, d)).collect();
      for pair in losses.windows(2) {
        assert!(pair[0] < pair[1], "通道 {}: {:?}", channel, losses);
      }
    }

    let rotated = |theta: f32| {
      let mut prediction = exact_prediction(&label, 1);
      prediction[[0, 0, 0, 0, ANGLE.start]] = theta.cos();
      prediction[[0, 0, 0, 0, ANGLE.start + 1]] = theta.sin();
      total(&assembler, &prediction, &label)
    };
    let losses: Vec<f32> = [0.3, 0.4, 0.6, 1.0].iter().map(|&t| rotated(t).total).collect();
    for pair in losses.windows(2) {
      assert!(pair[0] < pair[1], "角度: {:?}", losses);
    }
    assert!(rotated(1.0).angle > 0.0);
  }

  #[test]
  fn coordinate_errors_average_components() {
    let assembler = LossAssembler::new(&config(1, false));
    let label = label(BOX_CHANNELS);

    let mut prediction = exact_prediction(&label, 1);
    prediction[[0, 0, 0, 0, CENTER.start]] += 0.1;
    let shifted = total(&assembler, &prediction, &label);
    assert_abs_diff_eq!(shifted.center, 0.01 / 2.0, epsilon = 1e-6);
    assert_abs_diff_eq!(shifted.size, 0.0, epsilon = 1e-9);

    let mut prediction = exact_prediction(&label, 1);
    prediction[[0, 0, 0, 0, SIZE.start]] = 0.25;
    let widened = total(&assembler, &prediction, &label);
    let expected = (0.25f32.sqrt() - 0.2f32.sqrt()).powi(2) / 2.0;
    assert_abs_diff_eq!(widened.size, expected, epsilon = 1e-6);
    assert_abs_diff_eq!(widened.center, 0.0, epsilon = 1e-9);
  }

  #[test]
  fn inactive_confidence_is_penalized() {
    let assembler = LossAssembler::new(&config(1, false));
    let label = label(BOX_CHANNELS);
    let mut prediction = exact_prediction(&label, 1);
    prediction[[0, 1, 1, 0, CONFIDENCE]] = 0.5;

    let metrics = total(&assembler, &prediction, &label);
    // 3 个空单元各一个 inactive 锚框
    assert_abs_diff_eq!(metrics.no_objectness, 0.5 * 0.25 / 3.0, epsilon = 1e-6);
    assert_abs_diff_eq!(metrics.total, metrics.no_objectness, epsilon = 1e-5);
  }

  #[test]
  fn passive_anchor_is_not_penalized() {
    let assembler = LossAssembler::new(&config(2, false));
    let label = label(BOX_CHANNELS);
    let mut prediction = exact_prediction(&label, 2);
    // 第二个锚框略小但 IoU 仍高于阈值
    prediction[[0, 0, 0, 1, SIZE.start]] = 0.19;

    prediction[[0, 0, 0, 1, CONFIDENCE]] = 0.0;
    let quiet = total(&assembler, &prediction, &label);
    prediction[[0, 0, 0, 1, CONFIDENCE]] = 0.9;
    let loud = total(&assembler, &prediction, &label);

    assert_eq!(loud.passive_anchors, 1.0);
    assert_abs_diff_eq!(quiet.total, loud.total, epsilon = 1e-6);
  }

  #[test]
  fn classification_prefers_correct_band() {
    let assembler = LossAssembler::new(&config(1, true));
    let mut label = label(BOX_CHANNELS + COLOR_CHANNELS);
    let bands = ColorBands::from_names(&["brown", "black", "black", "red", "gold"]).unwrap();
    bands.write_one_hot(label.slice_mut(s![0, 0, 0, 0, COLOR_START..]));

    let mut right = exact_prediction(&label, 1);
    right
      .slice_mut(s![0, 0, 0, 0, COLOR_START..])
      .mapv_inplace(|t| t * 12.0);
    let mut wrong = exact_prediction(&label, 1);
    wrong
      .slice_mut(s![0, 0, 0, 0, COLOR_START..])
      .mapv_inplace(|t| (1.0 - t) * 12.0);

    let right = total(&assembler, &right, &label).classification;
    let wrong = total(&assembler, &wrong, &label).classification;
    assert!(right > 0.0);
    assert!(right < 0.01);
    assert!(wrong > right);
  }

  #[test]
  fn uncolored_cells_skip_classification() {
    let assembler = LossAssembler::new(&config(1, true));
    let label = label(BOX_CHANNELS + COLOR_CHANNELS);
    let mut prediction = exact_prediction(&label, 1);
    prediction
      .slice_mut(s![0, 0, 0, 0, COLOR_START..])
      .fill(3.0);
    assert_eq!(total(&assembler, &prediction, &label).classification, 0.0);
  }

  #[test]
  fn weight_decay_skips_normalization() {
    let weights = [1.0, 2.0];
    let gamma = [10.0];
    let params = [
      Parameter::weight("conv1.weight", &weights),
      Parameter::normalization("bn1.gamma", &gamma),
    ];
    assert_abs_diff_eq!(weight_decay(&params, 0.1), 0.25, epsilon = 1e-6);

    let empty = weight_decay(&[], 0.1);
    assert_eq!(empty, 0.0);
    assert!(empty.is_sign_positive());
    let frozen = weight_decay(&params[1..], 0.1);
    assert!(frozen.is_sign_positive());

    let assembler = LossAssembler::new(&config(1, false));
    let label = label(BOX_CHANNELS);
    let metrics = assembler
      .compute(exact_prediction(&label, 1).view(), label.view(), &params)
      .unwrap();
    assert_abs_diff_eq!(metrics.regularization, 0.25, epsilon = 1e-6);
  }

  #[test]
  fn rejects_mismatched_channels() {
    let assembler = LossAssembler::new(&config(1, true));
    let label = label(BOX_CHANNELS);
    let prediction = exact_prediction(&label, 1);
    assert!(matches!(
      assembler.compute(prediction.view(), label.view(), &[]),
      Err(GridError::ShapeMismatch { .. })
    ));
  }
}

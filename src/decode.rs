// 该文件是 Resistenz 项目的一部分。
// src/decode.rs - 网络输出解码
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

use ndarray::{Array1, ArrayView1, ArrayView4, ArrayView5, ArrayViewMut1, Axis, Zip, s};
use tracing::debug;

use crate::{
  color::{ColorBands, softmax_groups},
  config::{ModelConfig, Prior},
  geometry::{EPSILON, OrientedRect, adjusted_iou},
  grid::{
    ANGLE, CENTER, COLOR_START, CONFIDENCE, Grid, GridBatch, GridError, GridShape,
    SIZE, absolute_center, slot_rect,
  },
};

/// 求 logit 时对概率的截断
const PROBABILITY_CLAMP: f32 = 1e-6;

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

fn logit(p: f32) -> f32 {
  let p = p.clamp(PROBABILITY_CLAMP, 1.0 - PROBABILITY_CLAMP);
  (p / (1.0 - p)).ln()
}

fn rotate(v: [f32; 2], angle: f32) -> [f32; 2] {
  let (sin, cos) = angle.sin_cos();
  [v[0] * cos - v[1] * sin, v[0] * sin + v[1] * cos]
}

/// 解码后的检测结果，中心为按图像归一化的绝对坐标
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub rect: OrientedRect,
  /// (行, 列)
  pub cell: (usize, usize),
  pub anchor: usize,
  pub bands: Option<ColorBands>,
}

impl Detection {
  pub fn score(&self) -> f32 {
    self.rect.confidence
  }
}

/// 网络原始输出 → 矩形参数
///
/// 中心取 sigmoid（限制在单元内），尺寸为 exp(raw) × 先验尺寸，角度向量做 L2 归一化
/// （有参考旋转时再旋转该角度），置信度取 sigmoid。色环通道在训练时保留 logits 供
/// 交叉熵使用，推理时按组做 softmax。
#[derive(Debug, Clone)]
pub struct BoxDecoder {
  shape: GridShape,
  priors: Box<[Prior]>,
  color_bands: bool,
}

impl BoxDecoder {
  pub fn new(config: &ModelConfig) -> Self {
    BoxDecoder {
      shape: GridShape::prediction(config),
      priors: config.priors().into(),
      color_bands: config.color_bands(),
    }
  }

  pub fn shape(&self) -> GridShape {
    self.shape
  }

  fn decode_slot(&self, raw: ArrayView1<f32>, mut out: ArrayViewMut1<f32>, depth: usize, training: bool) {
    let prior = &self.priors[depth];

    for i in CENTER {
      out[i] = sigmoid(raw[i]);
    }
    out[SIZE.start] = raw[SIZE.start].exp() * prior.width;
    out[SIZE.start + 1] = raw[SIZE.start + 1].exp() * prior.height;

    let v = [raw[ANGLE.start], raw[ANGLE.start + 1]];
    let norm = v[0].hypot(v[1]).max(EPSILON);
    let mut angle = [v[0] / norm, v[1] / norm];
    if let Some(reference) = prior.angle {
      angle = rotate(angle, reference);
    }
    out[ANGLE.start] = angle[0];
    out[ANGLE.start + 1] = angle[1];

    out[CONFIDENCE] = sigmoid(raw[CONFIDENCE]);

    if self.color_bands {
      out.slice_mut(s![COLOR_START..]).assign(&raw.slice(s![COLOR_START..]));
      if !training {
        softmax_groups(out.slice_mut(s![COLOR_START..]));
      }
    }
  }

  pub fn decode(&self, raw: ArrayView4<f32>, training: bool) -> Result<Grid, GridError> {
    self.shape.check(&raw)?;
    let mut decoded = self.shape.zeros();
    for depth in 0..self.shape.depth {
      Zip::from(raw.index_axis(Axis(2), depth).lanes(Axis(2)))
        .and(decoded.index_axis_mut(Axis(2), depth).lanes_mut(Axis(2)))
        .for_each(|raw, out| self.decode_slot(raw, out, depth, training));
    }
    Ok(decoded)
  }

  pub fn decode_batch(&self, raw: ArrayView5<f32>, training: bool) -> Result<GridBatch, GridError> {
    let batch = self.shape.check_batch(&raw)?;
    debug!("解码批次: {} 张图像, training = {}", batch, training);
    let mut decoded = GridBatch::zeros(raw.raw_dim());
    for (raw, mut out) in raw.outer_iter().zip(decoded.outer_iter_mut()) {
      out.assign(&self.decode(raw, training)?);
    }
    Ok(decoded)
  }

  /// 解码的逆运算：由槽位参数（中心为单元内偏移）求原始输出
  ///
  /// `training` 必须与解码时一致：训练模式下色环通道本身就是 logits，推理模式下取对数。
  pub fn encode_slot(&self, slot: ArrayView1<f32>, depth: usize, training: bool) -> Array1<f32> {
    let prior = &self.priors[depth];
    let mut raw = Array1::zeros(self.shape.channels);

    for i in CENTER {
      raw[i] = logit(slot[i]);
    }
    raw[SIZE.start] = (slot[SIZE.start].max(EPSILON) / prior.width).ln();
    raw[SIZE.start + 1] = (slot[SIZE.start + 1].max(EPSILON) / prior.height).ln();

    let mut angle = [slot[ANGLE.start], slot[ANGLE.start + 1]];
    if let Some(reference) = prior.angle {
      angle = rotate(angle, -reference);
    }
    raw[ANGLE.start] = angle[0];
    raw[ANGLE.start + 1] = angle[1];

    raw[CONFIDENCE] = logit(slot[CONFIDENCE]);

    if self.color_bands {
      let colors = slot.slice(s![COLOR_START..]);
      if training {
        raw.slice_mut(s![COLOR_START..]).assign(&colors);
      } else {
        raw
          .slice_mut(s![COLOR_START..])
          .assign(&colors.mapv(|p| p.max(f32::MIN_POSITIVE).ln()));
      }
    }

    raw
  }

  /// 对整张解码网格求逆
  pub fn encode(&self, decoded: ArrayView4<f32>, training: bool) -> Result<Grid, GridError> {
    self.shape.check(&decoded)?;
    let mut raw = self.shape.zeros();
    for depth in 0..self.shape.depth {
      Zip::from(decoded.index_axis(Axis(2), depth).lanes(Axis(2)))
        .and(raw.index_axis_mut(Axis(2), depth).lanes_mut(Axis(2)))
        .for_each(|slot, mut out| out.assign(&self.encode_slot(slot, depth, training)));
    }
    Ok(raw)
  }

  /// 列出置信度不低于阈值的锚框，需传入推理模式（`training = false`）的解码结果
  pub fn detections(&self, decoded: ArrayView4<f32>, threshold: f32) -> Result<Vec<Detection>, GridError> {
    self.shape.check(&decoded)?;
    let mut items = Vec::new();

    for ((row, col, anchor), _) in decoded.slice(s![.., .., .., CONFIDENCE]).indexed_iter() {
      let slot = decoded.slice(s![row, col, anchor, ..]);
      if slot[CONFIDENCE] < threshold {
        continue;
      }

      let mut rect = slot_rect(slot);
      rect.center = absolute_center(row, col, rect.center, self.shape.grid_size);
      let bands = self.color_bands.then(|| {
        let scores = slot.slice(s![COLOR_START..]).to_vec();
        ColorBands::from_scores(&scores)
      });

      items.push(Detection {
        rect,
        cell: (row, col),
        anchor,
        bands,
      });
    }

    debug!("检测到 {} 个目标", items.len());
    Ok(items)
  }
}

/// 非极大值抑制，重叠度使用角度加权 IoU
///
/// 按置信度降序处理，置信度相同时保持原有顺序。
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
  detections.sort_by(|a, b| b.score().total_cmp(&a.score()));

  let mut result: Vec<Detection> = Vec::new();
  for det in detections {
    if result
      .iter()
      .all(|kept| adjusted_iou(&kept.rect, &det.rect) < iou_threshold)
    {
      result.push(det);
    }
  }

  result
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    color::{COLOR_CHANNELS, group_ranges},
    grid::BOX_CHANNELS,
  };
  use approx::assert_abs_diff_eq;
  use ndarray::{Array4, array};

  fn config(color_bands: bool) -> ModelConfig {
    ModelConfig::builder()
      .grid_size(2)
      .priors(vec![Prior::new(0.2, 0.1), Prior::new(0.4, 0.3).with_angle(0.5)])
      .color_bands(color_bands)
      .build()
      .unwrap()
  }

  #[test]
  fn decodes_zero_logits_to_priors() {
    let decoder = BoxDecoder::new(&config(false));
    let mut raw = decoder.shape().zeros();
    raw.slice_mut(s![.., .., .., ANGLE.start]).fill(1.0);
    let decoded = decoder.decode(raw.view(), false).unwrap();

    let slot: ArrayView1<f32> = decoded.slice(s![1, 0, 0, ..]);
    assert_abs_diff_eq!(slot[0], 0.5, epsilon = 1e-6);
    assert_abs_diff_eq!(slot[SIZE.start], 0.2, epsilon = 1e-6);
    assert_abs_diff_eq!(slot[SIZE.start + 1], 0.1, epsilon = 1e-6);
    assert_abs_diff_eq!(slot[ANGLE.start], 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(slot[CONFIDENCE], 0.5, epsilon = 1e-6);

    // 第二个先验带 0.5 弧度的参考旋转
    let rotated: ArrayView1<f32> = decoded.slice(s![1, 0, 1, ..]);
    assert_abs_diff_eq!(rotated[ANGLE.start], 0.5f32.cos(), epsilon = 1e-6);
    assert_abs_diff_eq!(rotated[ANGLE.start + 1], 0.5f32.sin(), epsilon = 1e-6);
  }

  #[test]
  fn angle_is_projected_on_unit_circle() {
    let decoder = BoxDecoder::new(&config(false));
    let mut raw = decoder.shape().zeros();
    raw.slice_mut(s![.., .., .., ANGLE.start]).fill(3.0);
    raw.slice_mut(s![.., .., .., ANGLE.start + 1]).fill(-4.0);
    let decoded = decoder.decode(raw.view(), true).unwrap();
    let slot: ArrayView1<f32> = decoded.slice(s![0, 1, 0, ..]);
    assert_abs_diff_eq!(slot[ANGLE.start], 0.6, epsilon = 1e-6);
    assert_abs_diff_eq!(slot[ANGLE.start + 1], -0.8, epsilon = 1e-6);
  }

  #[test]
  fn inverse_encoding_round_trips() {
    let decoder = BoxDecoder::new(&config(false));
    let theta = 1.1f32;
    let slot = array![0.3, 0.8, 0.25, 0.05, theta.cos(), theta.sin(), 0.9];
    for depth in 0..2 {
      let raw = decoder.encode_slot(slot.view(), depth, false);
      let mut out = Array1::zeros(BOX_CHANNELS);
      decoder.decode_slot(raw.view(), out.view_mut(), depth, false);
      for (a, b) in out.iter().zip(slot.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
      }
    }
  }

  #[test]
  fn color_groups_follow_mode() {
    let decoder = BoxDecoder::new(&config(true));
    let mut raw = Array4::<f32>::zeros((2, 2, 2, BOX_CHANNELS + COLOR_CHANNELS));
    raw[[0, 0, 0, COLOR_START + 3]] = 5.0;

    let train = decoder.decode(raw.view(), true).unwrap();
    assert_eq!(train[[0, 0, 0, COLOR_START + 3]], 5.0);

    let infer = decoder.decode(raw.view(), false).unwrap();
    for range in group_ranges() {
      let sum = infer
        .slice(s![0, 0, 0, COLOR_START + range.start..COLOR_START + range.end])
        .sum();
      assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-5);
    }
    assert!(infer[[0, 0, 0, COLOR_START + 3]] > 0.9);

    let back = decoder.encode(infer.view(), false).unwrap();
    let again = decoder.decode(back.view(), false).unwrap();
    for (a, b) in again.iter().zip(infer.iter()) {
      assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
    }
  }

  #[test]
  fn rejects_wrong_shape() {
    let decoder = BoxDecoder::new(&config(false));
    let raw = Array4::<f32>::zeros((3, 3, 2, BOX_CHANNELS));
    assert!(matches!(
      decoder.decode(raw.view(), true),
      Err(GridError::ShapeMismatch { .. })
    ));
  }

  #[test]
  fn detections_use_absolute_centers() {
    let decoder = BoxDecoder::new(&config(false));
    let mut decoded = decoder.shape().zeros();
    decoded
      .slice_mut(s![1, 1, 0, ..])
      .assign(&array![0.5, 0.5, 0.2, 0.1, 1.0, 0.0, 0.8]);
    let items = decoder.detections(decoded.view(), 0.5).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].cell, (1, 1));
    assert_abs_diff_eq!(items[0].rect.center[0], 0.75, epsilon = 1e-6);
    assert_abs_diff_eq!(items[0].rect.center[1], 0.75, epsilon = 1e-6);
  }

  #[test]
  fn nms_keeps_best_of_overlapping() {
    let make = |cx: f32, conf: f32| Detection {
      rect: OrientedRect::from_theta([cx, 0.5], [0.2, 0.1], 0.0, conf),
      cell: (0, 0),
      anchor: 0,
      bands: None,
    };
    let kept = non_max_suppression(vec![make(0.5, 0.6), make(0.51, 0.9), make(0.9, 0.7)], 0.5);
    assert_eq!(kept.len(), 2);
    assert_eq!(kept[0].score(), 0.9);
    assert_eq!(kept[1].score(), 0.7);
  }
}

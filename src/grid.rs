// 该文件是 Resistenz 项目的一部分。
// src/grid.rs - 标签网格编码
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

//! 网格张量布局：`[grid_size, grid_size, depth, channels]`，批量时在最前面加批维度。
//!
//! 每个槽位的通道依次为：中心偏移 (2, 单元内 [0, 1))、尺寸 (2, 按图像归一化)、
//! 角度向量 (2)、置信度 (1)，之后是可选的色环通道。

use std::ops::Range;

use ndarray::{Array4, Array5, ArrayView1, ArrayView4, ArrayView5, Axis, s};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{color::ColorBands, config::ModelConfig, geometry::OrientedRect};

pub const CENTER: Range<usize> = 0..2;
pub const SIZE: Range<usize> = 2..4;
pub const ANGLE: Range<usize> = 4..6;
pub const CONFIDENCE: usize = 6;
pub const BOX_CHANNELS: usize = 7;
pub const COLOR_START: usize = BOX_CHANNELS;

/// 单张图像的网格
pub type Grid = Array4<f32>;
/// 一个批次的网格
pub type GridBatch = Array5<f32>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GridError {
  #[error("网格形状不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  ShapeMismatch {
    expected: Vec<usize>,
    actual: Vec<usize>,
  },
  #[error("批次大小不一致: 预测 {prediction}, 标签 {label}")]
  BatchMismatch { prediction: usize, label: usize },
  #[error("空批次")]
  EmptyBatch,
}

/// 网格形状约定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridShape {
  pub grid_size: usize,
  pub depth: usize,
  pub channels: usize,
}

impl GridShape {
  pub fn label(config: &ModelConfig) -> Self {
    GridShape {
      grid_size: config.grid_size(),
      depth: 1,
      channels: config.channels(),
    }
  }

  pub fn prediction(config: &ModelConfig) -> Self {
    GridShape {
      grid_size: config.grid_size(),
      depth: config.grid_depth(),
      channels: config.channels(),
    }
  }

  pub fn dims(&self) -> [usize; 4] {
    [self.grid_size, self.grid_size, self.depth, self.channels]
  }

  pub fn zeros(&self) -> Grid {
    Array4::zeros(self.dims())
  }

  pub fn check(&self, grid: &ArrayView4<f32>) -> Result<(), GridError> {
    if grid.shape() != self.dims() {
      return Err(GridError::ShapeMismatch {
        expected: self.dims().to_vec(),
        actual: grid.shape().to_vec(),
      });
    }
    Ok(())
  }

  /// 检查批量网格，返回批次大小
  pub fn check_batch(&self, batch: &ArrayView5<f32>) -> Result<usize, GridError> {
    let shape = batch.shape();
    if shape[1..] != self.dims() {
      let mut expected = vec![shape[0]];
      expected.extend(self.dims());
      return Err(GridError::ShapeMismatch {
        expected,
        actual: shape.to_vec(),
      });
    }
    if shape[0] == 0 {
      return Err(GridError::EmptyBatch);
    }
    Ok(shape[0])
  }
}

/// 带可选色环标注的目标
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Target {
  pub rect: OrientedRect,
  pub bands: Option<ColorBands>,
}

impl From<OrientedRect> for Target {
  fn from(rect: OrientedRect) -> Self {
    Target { rect, bands: None }
  }
}

/// 单张图像的编码统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeStats {
  /// 写入网格的目标
  pub placed: usize,
  /// 与先前目标落在同一单元而被丢弃
  pub collisions: usize,
  /// 中心不在图像内（填充、裁剪剔除）
  pub rejected: usize,
}

impl std::ops::AddAssign for EncodeStats {
  fn add_assign(&mut self, rhs: Self) {
    self.placed += rhs.placed;
    self.collisions += rhs.collisions;
    self.rejected += rhs.rejected;
  }
}

/// 将有向矩形放入 N×N×1 标签网格
///
/// 每个单元最多一个目标。多个目标的中心落入同一单元时，保留下标最小（最先出现）的目标，
/// 其余目标的信息被静默丢弃，只计入统计。
#[derive(Debug, Clone)]
pub struct GridEncoder {
  shape: GridShape,
  color_bands: bool,
}

impl GridEncoder {
  pub fn new(config: &ModelConfig) -> Self {
    GridEncoder {
      shape: GridShape::label(config),
      color_bands: config.color_bands(),
    }
  }

  pub fn shape(&self) -> GridShape {
    self.shape
  }

  /// 目标中心所在单元 (行, 列)
  pub fn cell_of(&self, rect: &OrientedRect) -> Option<(usize, usize)> {
    if !rect.is_inside_image() {
      return None;
    }
    let n = self.shape.grid_size;
    let col = (rect.center[0] * n as f32).floor() as usize;
    let row = (rect.center[1] * n as f32).floor() as usize;
    // 浮点舍入可能把 0.99999 推到 n
    Some((row.min(n - 1), col.min(n - 1)))
  }

  pub fn encode(&self, targets: &[Target]) -> Grid {
    self.encode_with_stats(targets).0
  }

  pub fn encode_with_stats(&self, targets: &[Target]) -> (Grid, EncodeStats) {
    let n = self.shape.grid_size as f32;
    let mut grid = self.shape.zeros();
    let mut stats = EncodeStats::default();

    for (index, target) in targets.iter().enumerate() {
      let Some((row, col)) = self.cell_of(&target.rect) else {
        stats.rejected += 1;
        continue;
      };

      let mut slot = grid.slice_mut(s![row, col, 0, ..]);
      if slot[CONFIDENCE] != 0.0 {
        debug!("目标 {} 与先前目标同在单元 ({}, {})，已丢弃", index, row, col);
        stats.collisions += 1;
        continue;
      }

      let rect = &target.rect;
      slot[CENTER.start] = rect.center[0] * n - col as f32;
      slot[CENTER.start + 1] = rect.center[1] * n - row as f32;
      slot[SIZE.start] = rect.size[0];
      slot[SIZE.start + 1] = rect.size[1];
      slot[ANGLE.start] = rect.angle[0];
      slot[ANGLE.start + 1] = rect.angle[1];
      slot[CONFIDENCE] = 1.0;

      if self.color_bands
        && let Some(bands) = target.bands
      {
        bands.write_one_hot(slot.slice_mut(s![COLOR_START..]));
      }

      stats.placed += 1;
    }

    if stats.collisions > 0 {
      warn!("{} 个目标因单元冲突被丢弃", stats.collisions);
    }

    (grid, stats)
  }
}

/// 把单元内偏移还原成按图像归一化的绝对中心
pub fn absolute_center(row: usize, col: usize, offset: [f32; 2], grid_size: usize) -> [f32; 2] {
  let n = grid_size as f32;
  [(col as f32 + offset[0]) / n, (row as f32 + offset[1]) / n]
}

/// 读取槽位中的矩形参数，中心仍为单元内偏移
pub fn slot_rect(slot: ArrayView1<f32>) -> OrientedRect {
  OrientedRect {
    center: [slot[CENTER.start], slot[CENTER.start + 1]],
    size: [slot[SIZE.start], slot[SIZE.start + 1]],
    angle: [slot[ANGLE.start], slot[ANGLE.start + 1]],
    confidence: slot[CONFIDENCE],
  }
}

/// 把多张网格叠成一个批次
pub fn stack_batch(grids: &[Grid]) -> Result<GridBatch, GridError> {
  let Some(first) = grids.first() else {
    return Err(GridError::EmptyBatch);
  };
  for grid in grids {
    if grid.shape() != first.shape() {
      return Err(GridError::ShapeMismatch {
        expected: first.shape().to_vec(),
        actual: grid.shape().to_vec(),
      });
    }
  }
  let views: Vec<_> = grids.iter().map(|g| g.view()).collect();
  ndarray::stack(Axis(0), &views).map_err(|_| GridError::ShapeMismatch {
    expected: first.shape().to_vec(),
    actual: Vec::new(),
  })
}

// 该文件是 Resistenz 项目的一部分。
// src/geometry.rs - 几何基础类型与 IoU
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

use std::ops::{Add, Div, Mul, Sub};

use serde::{Deserialize, Serialize};

/// 防止除零的加性小量
pub const EPSILON: f32 = 1e-9;

/// 填充多边形的坐标（远离图像范围，表示“没有目标”）
pub const PADDING_COORD: f32 = -1000.0;

/// 裁剪后被剔除目标的坐标
pub const INVALID_COORD: f32 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
  pub x: f32,
  pub y: f32,
}

impl Point {
  pub const fn new(x: f32, y: f32) -> Self {
    Point { x, y }
  }

  pub fn norm(self) -> f32 {
    self.x.hypot(self.y)
  }

  /// 二维叉积（z 分量）
  pub fn cross(self, other: Point) -> f32 {
    self.x * other.y - self.y * other.x
  }
}

impl Add for Point {
  type Output = Point;

  fn add(self, rhs: Point) -> Point {
    Point::new(self.x + rhs.x, self.y + rhs.y)
  }
}

impl Sub for Point {
  type Output = Point;

  fn sub(self, rhs: Point) -> Point {
    Point::new(self.x - rhs.x, self.y - rhs.y)
  }
}

impl Mul<f32> for Point {
  type Output = Point;

  fn mul(self, rhs: f32) -> Point {
    Point::new(self.x * rhs, self.y * rhs)
  }
}

impl Div<f32> for Point {
  type Output = Point;

  fn div(self, rhs: f32) -> Point {
    Point::new(self.x / rhs, self.y / rhs)
  }
}

/// 四个顶点的多边形，像素坐标，环绕方向一致即可
pub type Polygon = [Point; 4];

pub fn padding_polygon() -> Polygon {
  [Point::new(PADDING_COORD, PADDING_COORD); 4]
}

pub fn invalid_polygon() -> Polygon {
  [Point::new(INVALID_COORD, INVALID_COORD); 4]
}

pub fn polygon_center(polygon: &Polygon) -> Point {
  polygon.iter().fold(Point::default(), |acc, &p| acc + p) / polygon.len() as f32
}

/// 有向矩形
///
/// `center` 与 `size` 按图像尺寸归一化；`angle` 为 (cos θ, sin θ)，θ ∈ [0, π)。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrientedRect {
  pub center: [f32; 2],
  pub size: [f32; 2],
  pub angle: [f32; 2],
  pub confidence: f32,
}

impl OrientedRect {
  pub fn from_theta(center: [f32; 2], size: [f32; 2], theta: f32, confidence: f32) -> Self {
    OrientedRect {
      center,
      size,
      angle: [theta.cos(), theta.sin()],
      confidence,
    }
  }

  /// 以 [0, π) 表示的旋转角
  pub fn theta(&self) -> f32 {
    canonical_angle(self.angle[1].atan2(self.angle[0]))
  }

  pub fn top_left(&self) -> [f32; 2] {
    [
      self.center[0] - self.size[0] / 2.0,
      self.center[1] - self.size[1] / 2.0,
    ]
  }

  pub fn bottom_right(&self) -> [f32; 2] {
    [
      self.center[0] + self.size[0] / 2.0,
      self.center[1] + self.size[1] / 2.0,
    ]
  }

  pub fn area(&self) -> f32 {
    self.size[0] * self.size[1]
  }

  /// 中心落在归一化图像范围 [0, 1) 内
  pub fn is_inside_image(&self) -> bool {
    self
      .center
      .iter()
      .all(|&c| c.is_finite() && (0.0..1.0).contains(&c))
  }

  /// 按旋转角还原四个顶点（顺序：左上、右上、右下、左下）
  pub fn corners(&self) -> Polygon {
    let [cos, sin] = self.angle;
    let (hw, hh) = (self.size[0] / 2.0, self.size[1] / 2.0);
    let center = Point::new(self.center[0], self.center[1]);
    [(-hw, -hh), (hw, -hh), (hw, hh), (-hw, hh)].map(|(x, y)| {
      center + Point::new(x * cos - y * sin, x * sin + y * cos)
    })
  }
}

/// 将 atan2 的结果规范到 [0, π)
pub fn canonical_angle(angle: f32) -> f32 {
  let mut angle = angle;
  if angle < 0.0 {
    angle += std::f32::consts::PI;
  }
  if angle >= std::f32::consts::PI {
    angle -= std::f32::consts::PI;
  }
  angle
}

/// 基于中心 ± 尺寸/2 的轴对齐 IoU，旋转不参与几何重叠计算
pub fn axis_aligned_iou(a_center: [f32; 2], a_size: [f32; 2], b_center: [f32; 2], b_size: [f32; 2]) -> f32 {
  let mut intersection = 1.0;
  for i in 0..2 {
    let lo = (a_center[i] - a_size[i] / 2.0).max(b_center[i] - b_size[i] / 2.0);
    let hi = (a_center[i] + a_size[i] / 2.0).min(b_center[i] + b_size[i] / 2.0);
    intersection *= (hi - lo).max(0.0);
  }
  let union = a_size[0] * a_size[1] + b_size[0] * b_size[1] - intersection;
  intersection / (union + EPSILON)
}

/// 角度相似度：|1 − mean((cos_a − cos_b)², (sin_a − sin_b)²)|，等价于 |cos(Δθ)|
pub fn angle_similarity(a: [f32; 2], b: [f32; 2]) -> f32 {
  let diff = ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)) / 2.0;
  (1.0 - diff).abs()
}

/// 余弦相似度，零向量时返回 0
pub fn cosine_similarity(a: [f32; 2], b: [f32; 2]) -> f32 {
  let dot = a[0] * b[0] + a[1] * b[1];
  let norms = a[0].hypot(a[1]) * b[0].hypot(b[1]);
  dot / norms.max(EPSILON)
}

/// 角度加权 IoU
pub fn adjusted_iou(a: &OrientedRect, b: &OrientedRect) -> f32 {
  axis_aligned_iou(a.center, a.size, b.center, b.size) * angle_similarity(a.angle, b.angle)
}

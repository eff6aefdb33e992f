// 该文件是 Resistenz 项目的一部分。
// src/rect.rs - 四边形到有向矩形的转换
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

use std::sync::{
  Arc,
  atomic::{AtomicUsize, Ordering},
};

use tracing::{debug, warn};

use crate::geometry::{OrientedRect, Point, Polygon, canonical_angle, polygon_center};

/// 判别式相对 diag⁴ 的容差，超出即视为退化四边形
const DISCRIMINANT_TOLERANCE: f32 = 1e-4;

/// 退化几何诊断计数，可在多个工作线程间共享
#[derive(Debug, Default)]
pub struct GeometryDiagnostics {
  degenerate: AtomicUsize,
}

impl GeometryDiagnostics {
  pub fn record_degenerate(&self) {
    self.degenerate.fetch_add(1, Ordering::Relaxed);
  }

  pub fn degenerate_count(&self) -> usize {
    self.degenerate.load(Ordering::Relaxed)
  }
}

/// 像素空间中的矩形参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadGeometry {
  pub center: Point,
  pub width: f32,
  pub height: f32,
  /// [0, π)
  pub theta: f32,
  /// 判别式为负且超出容差
  pub degenerate: bool,
}

fn triangle_area(u: Point, v: Point) -> f32 {
  u.cross(v).abs() / 2.0
}

/// 由四个顶点估计等效矩形
///
/// 宽高由平均对角线长度与面积反解：w² + h² = diag²，w·h = area。
/// 判别式在零附近的负值被截断为零，这是数值稳定性处理而非几何修正；
/// 超出容差的负值（自相交或严重变形的四边形）同样被截断，但会标记为退化。
pub fn quad_geometry(polygon: &Polygon) -> QuadGeometry {
  let [p0, p1, p2, p3] = *polygon;

  let center = polygon_center(polygon);
  let diag = ((p0 - p2).norm() + (p1 - p3).norm()) / 2.0;

  let v01 = p0 - p1;
  let v03 = p0 - p3;
  let v21 = p2 - p1;
  let v23 = p2 - p3;

  let area = triangle_area(v01, v03) + triangle_area(v21, v23);

  let diag_sq = diag * diag;
  let disc_sq = diag_sq * diag_sq - 4.0 * area * area;
  let degenerate = disc_sq < -DISCRIMINANT_TOLERANCE * diag_sq * diag_sq;
  let disc = disc_sq.max(0.0).sqrt();

  let width = ((diag_sq + disc).abs() / 2.0).sqrt();
  let height = ((diag_sq - disc).abs() / 2.0).sqrt();

  // 最长边作为方向参考，长度相同时取先出现的边
  let mut longest = v01;
  for side in [v03, v21, v23] {
    if side.norm() > longest.norm() {
      longest = side;
    }
  }
  let theta = canonical_angle(longest.y.atan2(longest.x));

  QuadGeometry {
    center,
    width,
    height,
    theta,
    degenerate,
  }
}

/// 四边形 → 有向矩形
#[derive(Debug, Clone)]
pub struct RectangleExtractor {
  image_size: f32,
  diagnostics: Arc<GeometryDiagnostics>,
}

impl RectangleExtractor {
  pub fn new(image_size: u32) -> Self {
    RectangleExtractor {
      image_size: image_size as f32,
      diagnostics: Arc::new(GeometryDiagnostics::default()),
    }
  }

  pub fn with_diagnostics(mut self, diagnostics: Arc<GeometryDiagnostics>) -> Self {
    self.diagnostics = diagnostics;
    self
  }

  pub fn diagnostics(&self) -> &Arc<GeometryDiagnostics> {
    &self.diagnostics
  }

  /// 填充或被剔除的多边形会得到中心在图像外的矩形，由网格编码器排除
  pub fn extract(&self, polygon: &Polygon) -> OrientedRect {
    let quad = quad_geometry(polygon);
    if quad.degenerate {
      self.diagnostics.record_degenerate();
      warn!(
        "退化四边形: 中心 ({:.1}, {:.1}), 判别式为负，已截断",
        quad.center.x, quad.center.y
      );
    }

    let rect = OrientedRect::from_theta(
      [quad.center.x / self.image_size, quad.center.y / self.image_size],
      [quad.width / self.image_size, quad.height / self.image_size],
      quad.theta,
      1.0,
    );
    debug!("四边形转换结果: {:?}", rect);
    rect
  }

  pub fn extract_all(&self, polygons: &[Polygon]) -> Vec<OrientedRect> {
    polygons.iter().map(|p| self.extract(p)).collect()
  }
}

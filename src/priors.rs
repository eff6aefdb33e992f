// 该文件是 Resistenz 项目的一部分。
// src/priors.rs - 先验尺寸聚类
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

use thiserror::Error;
use tracing::debug;

use crate::{config::Prior, geometry::EPSILON};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PriorError {
  #[error("样本数 {samples} 少于聚类数 {clusters}")]
  NotEnoughSamples { samples: usize, clusters: usize },
  #[error("聚类数必须大于 0")]
  NoClusters,
}

/// 左上角对齐时两个尺寸的 IoU
fn size_iou(a: [f32; 2], b: [f32; 2]) -> f32 {
  let intersection = a[0].min(b[0]) * a[1].min(b[1]);
  intersection / (a[0] * a[1] + b[0] * b[1] - intersection + EPSILON)
}

fn distance(a: [f32; 2], b: [f32; 2]) -> f32 {
  1.0 - size_iou(a, b)
}

fn nearest(sample: [f32; 2], centers: &[[f32; 2]]) -> usize {
  let mut best = 0;
  for (i, &center) in centers.iter().enumerate() {
    if distance(sample, center) < distance(sample, centers[best]) {
      best = i;
    }
  }
  best
}

/// 以 1 − IoU 为距离的 k-means，返回按宽度升序的先验
///
/// 初始中心取按面积排序后等间距的样本，结果可复现。
pub fn kmeans_priors(sizes: &[[f32; 2]], k: usize, iterations: usize) -> Result<Vec<Prior>, PriorError> {
  if k == 0 {
    return Err(PriorError::NoClusters);
  }
  let samples: Vec<[f32; 2]> = sizes
    .iter()
    .copied()
    .filter(|s| s.iter().all(|v| v.is_finite() && *v > 0.0))
    .collect();
  if samples.len() < k {
    return Err(PriorError::NotEnoughSamples {
      samples: samples.len(),
      clusters: k,
    });
  }

  let mut sorted = samples.clone();
  sorted.sort_by(|a, b| (a[0] * a[1]).total_cmp(&(b[0] * b[1])));
  let mut centers: Vec<[f32; 2]> = (0..k)
    .map(|i| sorted[(2 * i + 1) * sorted.len() / (2 * k)])
    .collect();

  let mut assignment = vec![usize::MAX; samples.len()];
  for iteration in 0..iterations {
    let mut changed = 0;
    for (slot, &sample) in assignment.iter_mut().zip(&samples) {
      let cluster = nearest(sample, &centers);
      if *slot != cluster {
        *slot = cluster;
        changed += 1;
      }
    }

    let mut sums = vec![[0.0f32; 2]; k];
    let mut counts = vec![0usize; k];
    for (&cluster, sample) in assignment.iter().zip(&samples) {
      sums[cluster][0] += sample[0];
      sums[cluster][1] += sample[1];
      counts[cluster] += 1;
    }
    // 空簇保留原中心
    for ((center, sum), count) in centers.iter_mut().zip(sums).zip(counts) {
      if count > 0 {
        *center = [sum[0] / count as f32, sum[1] / count as f32];
      }
    }

    debug!("k-means 第 {} 轮: {} 个样本改变归属", iteration, changed);
    if changed == 0 {
      break;
    }
  }

  centers.sort_by(|a, b| a[0].total_cmp(&b[0]));
  Ok(centers.into_iter().map(|[w, h]| Prior::new(w, h)).collect())
}

/// 平均每个样本与其最近先验的 IoU
pub fn mean_best_iou(sizes: &[[f32; 2]], priors: &[Prior]) -> f32 {
  if sizes.is_empty() || priors.is_empty() {
    return 0.0;
  }
  let total: f32 = sizes
    .iter()
    .map(|&s| {
      priors
        .iter()
        .map(|p| size_iou(s, [p.width, p.height]))
        .fold(0.0, f32::max)
    })
    .sum();
  total / sizes.len() as f32
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_abs_diff_eq;

  fn clusters() -> Vec<[f32; 2]> {
    let mut sizes = Vec::new();
    for i in 0..10 {
      let jitter = i as f32 * 0.001;
      sizes.push([0.1 + jitter, 0.05 + jitter]);
      sizes.push([0.5 + jitter, 0.2 + jitter]);
    }
    sizes
  }

  #[test]
  fn finds_separated_clusters() {
    let priors = kmeans_priors(&clusters(), 2, 50).unwrap();
    assert_eq!(priors.len(), 2);
    assert_abs_diff_eq!(priors[0].width, 0.1045, epsilon = 1e-4);
    assert_abs_diff_eq!(priors[1].height, 0.2045, epsilon = 1e-4);
    assert!(mean_best_iou(&clusters(), &priors) > 0.9);
  }

  #[test]
  fn is_deterministic_and_sorted() {
    let a = kmeans_priors(&clusters(), 3, 50).unwrap();
    let b = kmeans_priors(&clusters(), 3, 50).unwrap();
    assert_eq!(a, b);
    assert!(a.windows(2).all(|w| w[0].width <= w[1].width));
  }

  #[test]
  fn rejects_too_few_samples() {
    assert_eq!(
      kmeans_priors(&[[0.1, 0.1], [0.0, 0.2]], 2, 10),
      Err(PriorError::NotEnoughSamples {
        samples: 1,
        clusters: 2
      })
    );
    assert_eq!(kmeans_priors(&clusters(), 0, 10), Err(PriorError::NoClusters));
  }
}

// 该文件是 Resistenz 项目的一部分。
// src/bin/gen_priors.rs - 先验尺寸生成
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

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use resistenz::{
  FromUrl, ModelConfig, RectangleExtractor,
  dataset::{LabelSet, SquareCrop},
  priors::{kmeans_priors, mean_best_iou},
};

/// 对训练集中的矩形尺寸做 k-means，输出先验框
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 标注目录，例如 labels:///data/processed
  #[arg(long, value_name = "LABELS")]
  pub labels: Url,
  /// 模型配置，决定图像尺寸与默认聚类数
  #[arg(long, value_name = "CONFIG")]
  pub config: Option<Url>,
  /// 聚类数，缺省为配置中的先验数量
  #[arg(long)]
  pub clusters: Option<usize>,
  #[arg(long, default_value_t = 100)]
  pub iterations: usize,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let config = match &args.config {
    Some(url) => ModelConfig::from_url(url)?,
    None => ModelConfig::default(),
  };
  let labels = LabelSet::from_url(&args.labels)?;
  let extractor = RectangleExtractor::new(config.image_size());

  let mut sizes = Vec::new();
  for image in labels.images() {
    let crop = SquareCrop::central(image.width, image.height);
    for polygon in &image.polygons {
      let rect = extractor.extract(&crop.transform(polygon, config.image_size()));
      if rect.is_inside_image() {
        sizes.push(rect.size);
      }
    }
  }
  info!("共 {} 个矩形", sizes.len());

  let clusters = args.clusters.unwrap_or(config.grid_depth());
  let priors = kmeans_priors(&sizes, clusters, args.iterations)?;
  info!("平均最佳 IoU: {:.4}", mean_best_iou(&sizes, &priors));

  println!("{}", serde_json::to_string_pretty(&priors)?);
  Ok(())
}

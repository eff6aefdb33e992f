// 该文件是 Resistenz 项目的一部分。
// src/bin/encode_labels.rs - 标注编码与基线损失
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

use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use ndarray::{Array5, s};
use tracing::{info, warn};
use url::Url;

use resistenz::{
  BoxDecoder, FromUrl, LossAssembler, ModelConfig,
  dataset::{DEFAULT_VALIDATE_SPLIT, DatasetEncoder, LabelSet, pad_polygons},
  grid::ANGLE,
  record::{Report, ReportWrapper},
  rect::GeometryDiagnostics,
};

/// 把多边形标注编码为标签网格，并计算只用先验框时的基线损失
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型配置，缺省使用内置默认值
  #[arg(long, value_name = "CONFIG")]
  pub config: Option<Url>,
  /// 标注目录，例如 labels:///data/processed
  #[arg(long, value_name = "LABELS")]
  pub labels: Url,
  /// 指标输出，log:// 或 folder:///path
  #[arg(long, value_name = "REPORT", default_value = "log://")]
  pub report: Url,
  /// 验证集比例
  #[arg(long, default_value_t = DEFAULT_VALIDATE_SPLIT)]
  pub validate: f32,
  /// 把标签网格写成 JSON
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<PathBuf>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let config = match &args.config {
    Some(url) => ModelConfig::from_url(url)?,
    None => ModelConfig::default(),
  };
  info!("标注目录: {}", args.labels);
  info!("指标输出: {}", args.report);

  let labels = LabelSet::from_url(&args.labels)?;
  let report = ReportWrapper::from_url(&args.report)?;
  if labels.is_empty() {
    warn!("没有找到标注文件");
    return Ok(());
  }

  let (mut training, mut validation) = labels.split(args.validate);
  let diagnostics = Arc::new(GeometryDiagnostics::default());
  let encoder = DatasetEncoder::new(&config).with_diagnostics(diagnostics.clone());
  let decoder = BoxDecoder::new(&config);
  let assembler = LossAssembler::new(&config);

  for (tag, images) in [("training", &mut training), ("validation", &mut validation)] {
    if images.is_empty() {
      continue;
    }
    let capacity = pad_polygons(images);
    info!("{}: {} 张图像, 每张最多 {} 个多边形", tag, images.len(), capacity);

    let now = std::time::Instant::now();
    let (label, stats) = encoder.encode_central(images)?;
    info!(
      "{}: 编码完成，耗时 {:.2?}, 放置 {}, 冲突 {}, 剔除 {}",
      tag,
      now.elapsed(),
      stats.placed,
      stats.collisions,
      stats.rejected
    );

    // 全零 logits 解码为各单元的先验框，角度向量取 (1, 0)
    let shape = decoder.shape();
    let mut raw = Array5::<f32>::zeros((
      label.shape()[0],
      shape.grid_size,
      shape.grid_size,
      shape.depth,
      shape.channels,
    ));
    raw.slice_mut(s![.., .., .., .., ANGLE.start]).fill(1.0);
    let prediction = decoder.decode_batch(raw.view(), true)?;
    let metrics = assembler.compute(prediction.view(), label.view(), &[])?;
    report.report(&format!("{}-baseline", tag), &metrics)?;

    if let Some(output) = &args.output {
      let path = output.join(format!("{}.json", tag));
      let json = serde_json::json!({
        "shape": label.shape(),
        "data": label.iter().collect::<Vec<_>>(),
      });
      std::fs::create_dir_all(output)?;
      std::fs::write(&path, serde_json::to_string(&json)?)?;
      info!("标签网格已写入 {}", path.display());
    }
  }

  if diagnostics.degenerate_count() > 0 {
    warn!("共有 {} 个退化四边形", diagnostics.degenerate_count());
  }

  Ok(())
}

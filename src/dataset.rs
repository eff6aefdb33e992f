// 该文件是 Resistenz 项目的一部分。
// src/dataset.rs - 标注数据集与批量编码
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

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  color::{ColorBands, ColorError},
  config::ModelConfig,
  geometry::{Point, Polygon, invalid_polygon, padding_polygon, polygon_center},
  grid::{EncodeStats, Grid, GridBatch, GridEncoder, GridError, Target, stack_batch},
  rect::{GeometryDiagnostics, RectangleExtractor},
};

#[derive(Error, Debug)]
pub enum DatasetError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("标注解析错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("色环标注错误: {0}")]
  ColorError(#[from] ColorError),
  #[error("网格错误: {0}")]
  GridError(#[from] GridError),
  #[cfg(feature = "read_image_file")]
  #[error("图像读取错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("标注无效: {0}")]
  Invalid(String),
}

/// 缺省的验证集比例
pub const DEFAULT_VALIDATE_SPLIT: f32 = 0.15;

/// 同名图像的扩展名，按顺序查找
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// 与图像同名的 JSON 标注文件
///
/// 图像尺寸优先从同名图像读取，`width`、`height` 只作后备。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelFile {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub width: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub height: Option<u32>,
  pub polygons: Vec<Vec<Point>>,
  /// 与 `polygons` 一一对应的色环颜色名
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub colors: Option<Vec<Vec<String>>>,
}

/// 一张图像的多边形标注
#[derive(Debug, Clone, PartialEq)]
pub struct ImageLabels {
  pub name: String,
  pub width: u32,
  pub height: u32,
  pub polygons: Vec<Polygon>,
  pub bands: Vec<Option<ColorBands>>,
}

impl LabelFile {
  pub fn size(&self) -> Option<(u32, u32)> {
    self.width.zip(self.height)
  }
}

/// 读取与标注同名的图像的尺寸，没有图像时返回 `None`
#[cfg(feature = "read_image_file")]
pub fn sibling_image_size(label: &Path) -> Result<Option<(u32, u32)>, DatasetError> {
  for extension in IMAGE_EXTENSIONS {
    let path = label.with_extension(extension);
    if path.is_file() {
      let size = image::ImageReader::open(&path)?.into_dimensions()?;
      debug!("{}: 图像尺寸 {}x{}", path.display(), size.0, size.1);
      return Ok(Some(size));
    }
  }
  Ok(None)
}

#[cfg(not(feature = "read_image_file"))]
pub fn sibling_image_size(label: &Path) -> Result<Option<(u32, u32)>, DatasetError> {
  if IMAGE_EXTENSIONS
    .iter()
    .any(|extension| label.with_extension(extension).is_file())
  {
    debug!("{}: 未启用 read_image_file, 使用标注中的尺寸", label.display());
  }
  Ok(None)
}

impl ImageLabels {
  /// 顶点数不为 4 的多边形连同其色环标注一起跳过，`file` 必须带有图像尺寸
  pub fn from_label_file(name: impl Into<String>, file: LabelFile) -> Result<Self, DatasetError> {
    let name = name.into();
    let Some((width, height)) = file.size() else {
      return Err(DatasetError::Invalid(format!("{}: 缺少图像尺寸", name)));
    };
    if let Some(colors) = &file.colors
      && colors.len() != file.polygons.len()
    {
      return Err(DatasetError::Invalid(format!(
        "{}: {} 个多边形, {} 组色环",
        name,
        file.polygons.len(),
        colors.len()
      )));
    }

    let mut polygons = Vec::with_capacity(file.polygons.len());
    let mut bands = Vec::with_capacity(file.polygons.len());
    for (i, points) in file.polygons.iter().enumerate() {
      let Ok(polygon) = Polygon::try_from(points.as_slice()) else {
        debug!("{}: 跳过第 {} 个多边形（{} 个顶点）", name, i, points.len());
        continue;
      };
      let band = match &file.colors {
        Some(colors) if !colors[i].is_empty() => Some(ColorBands::from_names(&colors[i])?),
        _ => None,
      };
      polygons.push(polygon);
      bands.push(band);
    }

    Ok(ImageLabels {
      name,
      width,
      height,
      polygons,
      bands,
    })
  }

  pub fn load(path: &Path) -> Result<Self, DatasetError> {
    let text = std::fs::read_to_string(path)?;
    let mut file: LabelFile = serde_json::from_str(&text)?;
    let name = path
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_default();

    let measured = match sibling_image_size(path) {
      Ok(size) => size,
      Err(err) if file.size().is_some() => {
        warn!("{}: 无法读取图像尺寸 ({}), 使用标注中的尺寸", name, err);
        None
      }
      Err(err) => return Err(err),
    };
    if let Some((width, height)) = measured {
      if let Some(declared) = file.size()
        && declared != (width, height)
      {
        warn!(
          "{}: 标注尺寸 {}x{} 与图像 {}x{} 不一致, 以图像为准",
          name, declared.0, declared.1, width, height
        );
      }
      file.width = Some(width);
      file.height = Some(height);
    }
    Self::from_label_file(name, file)
  }
}

/// 用填充多边形把每张图像的标注补齐到相同数量，返回该数量
pub fn pad_polygons(images: &mut [ImageLabels]) -> usize {
  let capacity = images.iter().map(|i| i.polygons.len()).max().unwrap_or(0);
  for image in images.iter_mut() {
    image.polygons.resize(capacity, padding_polygon());
    image.bands.resize(capacity, None);
  }
  capacity
}

/// 从图像中裁出的正方形区域（像素）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SquareCrop {
  pub offset: [f32; 2],
  pub size: f32,
}

impl SquareCrop {
  /// 验证集使用中心裁剪
  pub fn central(width: u32, height: u32) -> Self {
    Self::with_fraction(width, height, [0.5, 0.5])
  }

  /// `fraction` 为裁剪偏移占可移动范围的比例，训练时由调用方随机给出
  pub fn with_fraction(width: u32, height: u32, fraction: [f32; 2]) -> Self {
    let size = width.min(height);
    let delta = [width - size, height - size];
    let offset = [0usize, 1].map(|i| (delta[i] as f32 * fraction[i].clamp(0.0, 1.0)).floor());
    SquareCrop {
      offset,
      size: size as f32,
    }
  }

  /// 平移到裁剪区域坐标系，中心不在 [0, size] 内的多边形替换为无效多边形
  pub fn apply(&self, polygon: &Polygon) -> Polygon {
    let offset = Point::new(self.offset[0], self.offset[1]);
    let moved = polygon.map(|p| p - offset);
    let center = polygon_center(&moved);
    let range = 0.0..=self.size;
    if range.contains(&center.x) && range.contains(&center.y) {
      moved
    } else {
      invalid_polygon()
    }
  }

  /// 裁剪并缩放到网络输入尺寸
  pub fn transform(&self, polygon: &Polygon, image_size: u32) -> Polygon {
    let scale = image_size as f32 / self.size.max(1.0);
    self.apply(polygon).map(|p| p * scale)
  }
}

/// 一个目录下的全部标注文件（`*.json`，按文件名排序）
#[derive(Debug, Clone)]
pub struct LabelSet {
  root: PathBuf,
  images: Vec<ImageLabels>,
}

impl LabelSet {
  pub fn load_dir(root: &Path) -> Result<Self, DatasetError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(root)? {
      let path = entry?.path();
      if path.extension().is_some_and(|ext| ext == "json") {
        files.push(path);
      }
    }
    files.sort();

    let images = files
      .iter()
      .map(|path| ImageLabels::load(path))
      .collect::<Result<Vec<_>, _>>()?;
    info!("从 {} 加载了 {} 张图像的标注", root.display(), images.len());

    Ok(LabelSet {
      root: root.to_path_buf(),
      images,
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn images(&self) -> &[ImageLabels] {
    &self.images
  }

  pub fn len(&self) -> usize {
    self.images.len()
  }

  pub fn is_empty(&self) -> bool {
    self.images.is_empty()
  }

  /// 按比例切出验证集（取前面的图像），返回 (训练集, 验证集)
  pub fn split(mut self, validate: f32) -> (Vec<ImageLabels>, Vec<ImageLabels>) {
    let count = (self.images.len() as f32 * validate.clamp(0.0, 1.0)) as usize;
    let training = self.images.split_off(count);
    (training, self.images)
  }

  pub fn into_images(self) -> Vec<ImageLabels> {
    self.images
  }
}

impl FromUrlWithScheme for LabelSet {
  const SCHEME: &'static str = "labels";
}

impl FromUrl for LabelSet {
  type Error = DatasetError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(DatasetError::SchemeMismatch(url.scheme().to_string()));
    }
    Self::load_dir(Path::new(url.path()))
  }
}

/// 多边形标注 → 标签网格
///
/// 每张图像独立编码，批量编码在 rayon 线程池上并行执行。
#[derive(Debug, Clone)]
pub struct DatasetEncoder {
  image_size: u32,
  extractor: RectangleExtractor,
  encoder: GridEncoder,
}

impl DatasetEncoder {
  pub fn new(config: &ModelConfig) -> Self {
    DatasetEncoder {
      image_size: config.image_size(),
      extractor: RectangleExtractor::new(config.image_size()),
      encoder: GridEncoder::new(config),
    }
  }

  pub fn with_diagnostics(mut self, diagnostics: Arc<GeometryDiagnostics>) -> Self {
    self.extractor = self.extractor.with_diagnostics(diagnostics);
    self
  }

  pub fn diagnostics(&self) -> &Arc<GeometryDiagnostics> {
    self.extractor.diagnostics()
  }

  pub fn targets(&self, image: &ImageLabels, crop: &SquareCrop) -> Vec<Target> {
    image
      .polygons
      .iter()
      .zip(&image.bands)
      .map(|(polygon, bands)| Target {
        rect: self
          .extractor
          .extract(&crop.transform(polygon, self.image_size)),
        bands: *bands,
      })
      .collect()
  }

  pub fn encode_image(&self, image: &ImageLabels, crop: &SquareCrop) -> (Grid, EncodeStats) {
    self.encoder.encode_with_stats(&self.targets(image, crop))
  }

  /// 输出 `[B, N, N, 1, C]`，`crops` 与 `images` 一一对应
  pub fn encode_batch(
    &self,
    images: &[ImageLabels],
    crops: &[SquareCrop],
  ) -> Result<(GridBatch, EncodeStats), DatasetError> {
    if images.len() != crops.len() {
      return Err(DatasetError::Invalid(format!(
        "{} 张图像, {} 个裁剪区域",
        images.len(),
        crops.len()
      )));
    }

    let encoded: Vec<(Grid, EncodeStats)> = images
      .par_iter()
      .zip(crops.par_iter())
      .map(|(image, crop)| self.encode_image(image, crop))
      .collect();

    let mut stats = EncodeStats::default();
    let mut grids = Vec::with_capacity(encoded.len());
    for (grid, image_stats) in encoded {
      stats += image_stats;
      grids.push(grid);
    }

    let batch = stack_batch(&grids)?;
    if stats.collisions > 0 {
      warn!("批次中 {} 个目标因单元冲突被丢弃", stats.collisions);
    }
    debug!(
      "编码批次: {} 张图像, 放置 {}, 冲突 {}, 剔除 {}",
      images.len(),
      stats.placed,
      stats.collisions,
      stats.rejected
    );
    Ok((batch, stats))
  }

  /// 全部使用中心裁剪
  pub fn encode_central(&self, images: &[ImageLabels]) -> Result<(GridBatch, EncodeStats), DatasetError> {
    let crops: Vec<SquareCrop> = images
      .iter()
      .map(|i| SquareCrop::central(i.width, i.height))
      .collect();
    self.encode_batch(images, &crops)
  }
}

// 该文件是 Resistenz 项目的一部分。
// src/config.rs - 模型与损失配置
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

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, color::COLOR_CHANNELS, grid::BOX_CHANNELS};

pub const DEFAULT_IMAGE_SIZE: u32 = 416;
pub const DEFAULT_GRID_SIZE: usize = 13;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.5;

/// k-means 得到的默认先验尺寸（宽, 高），按图像尺寸归一化
pub const DEFAULT_PRIOR_SIZES: [[f32; 2]; 5] = [
  [0.464_723_07, 0.191_979_45],
  [0.470_095_5, 0.168_188_37],
  [0.496_416_66, 0.193_407_4],
  [0.592_247_1, 0.226_487_61],
  [0.628_718_6, 0.240_435_06],
];

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("配置解析错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("配置无效: {0}")]
  Invalid(String),
}

/// 单个锚框槽位的参考形状
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prior {
  pub width: f32,
  pub height: f32,
  /// 参考旋转角（弧度），缺省时不旋转
  #[serde(default)]
  pub angle: Option<f32>,
}

impl Prior {
  pub const fn new(width: f32, height: f32) -> Self {
    Prior {
      width,
      height,
      angle: None,
    }
  }

  pub const fn with_angle(mut self, angle: f32) -> Self {
    self.angle = Some(angle);
    self
  }
}

/// 损失权重
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossWeights {
  pub obj: f32,
  pub no_obj: f32,
  pub coord: f32,
  pub angle: f32,
  pub class: f32,
  pub weight_decay: f32,
}

impl Default for LossWeights {
  fn default() -> Self {
    LossWeights {
      obj: 1.0,
      no_obj: 0.5,
      coord: 5.0,
      angle: 1.0,
      class: 1.0,
      weight_decay: 0.0,
    }
  }
}

impl LossWeights {
  fn all(&self) -> [(&'static str, f32); 6] {
    [
      ("obj", self.obj),
      ("no_obj", self.no_obj),
      ("coord", self.coord),
      ("angle", self.angle),
      ("class", self.class),
      ("weight_decay", self.weight_decay),
    ]
  }
}

/// 模型配置，构造后不可修改，各组件在构造时取用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ModelConfigBuilder", into = "ModelConfigBuilder")]
pub struct ModelConfig {
  image_size: u32,
  grid_size: usize,
  priors: Box<[Prior]>,
  iou_threshold: f32,
  weights: LossWeights,
  color_bands: bool,
}

impl Default for ModelConfig {
  fn default() -> Self {
    ModelConfig {
      image_size: DEFAULT_IMAGE_SIZE,
      grid_size: DEFAULT_GRID_SIZE,
      priors: DEFAULT_PRIOR_SIZES
        .iter()
        .map(|&[w, h]| Prior::new(w, h))
        .collect(),
      iou_threshold: DEFAULT_IOU_THRESHOLD,
      weights: LossWeights::default(),
      color_bands: false,
    }
  }
}

impl ModelConfig {
  pub fn builder() -> ModelConfigBuilder {
    ModelConfigBuilder::default()
  }

  pub fn image_size(&self) -> u32 {
    self.image_size
  }

  pub fn grid_size(&self) -> usize {
    self.grid_size
  }

  /// 预测网格深度，即先验数量
  pub fn grid_depth(&self) -> usize {
    self.priors.len()
  }

  pub fn priors(&self) -> &[Prior] {
    &self.priors
  }

  pub fn iou_threshold(&self) -> f32 {
    self.iou_threshold
  }

  pub fn weights(&self) -> &LossWeights {
    &self.weights
  }

  pub fn color_bands(&self) -> bool {
    self.color_bands
  }

  pub fn color_channels(&self) -> usize {
    if self.color_bands { COLOR_CHANNELS } else { 0 }
  }

  /// 每个网格槽位的通道数
  pub fn channels(&self) -> usize {
    BOX_CHANNELS + self.color_channels()
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfigBuilder {
  image_size: u32,
  grid_size: usize,
  priors: Vec<Prior>,
  iou_threshold: f32,
  weights: LossWeights,
  color_bands: bool,
}

impl Default for ModelConfigBuilder {
  fn default() -> Self {
    ModelConfig::default().into()
  }
}

impl From<ModelConfig> for ModelConfigBuilder {
  fn from(config: ModelConfig) -> Self {
    ModelConfigBuilder {
      image_size: config.image_size,
      grid_size: config.grid_size,
      priors: config.priors.into_vec(),
      iou_threshold: config.iou_threshold,
      weights: config.weights,
      color_bands: config.color_bands,
    }
  }
}

impl TryFrom<ModelConfigBuilder> for ModelConfig {
  type Error = ConfigError;

  fn try_from(builder: ModelConfigBuilder) -> Result<Self, Self::Error> {
    builder.build()
  }
}

impl ModelConfigBuilder {
  pub fn image_size(mut self, image_size: u32) -> Self {
    self.image_size = image_size;
    self
  }

  pub fn grid_size(mut self, grid_size: usize) -> Self {
    self.grid_size = grid_size;
    self
  }

  pub fn priors(mut self, priors: impl Into<Vec<Prior>>) -> Self {
    self.priors = priors.into();
    self
  }

  pub fn iou_threshold(mut self, iou_threshold: f32) -> Self {
    self.iou_threshold = iou_threshold;
    self
  }

  pub fn weights(mut self, weights: LossWeights) -> Self {
    self.weights = weights;
    self
  }

  pub fn color_bands(mut self, enabled: bool) -> Self {
    self.color_bands = enabled;
    self
  }

  pub fn build(self) -> Result<ModelConfig, ConfigError> {
    if self.grid_size == 0 {
      return Err(ConfigError::Invalid("网格尺寸必须大于 0".to_string()));
    }
    if (self.image_size as usize) < self.grid_size {
      return Err(ConfigError::Invalid(format!(
        "图像尺寸 {} 小于网格尺寸 {}",
        self.image_size, self.grid_size
      )));
    }
    if self.priors.is_empty() {
      return Err(ConfigError::Invalid("至少需要一个先验框".to_string()));
    }
    for (i, prior) in self.priors.iter().enumerate() {
      let valid = prior.width.is_finite()
        && prior.height.is_finite()
        && prior.width > 0.0
        && prior.height > 0.0
        && prior.angle.is_none_or(f32::is_finite);
      if !valid {
        return Err(ConfigError::Invalid(format!(
          "第 {} 个先验框无效: {:?}",
          i, prior
        )));
      }
    }
    if !(0.0..=1.0).contains(&self.iou_threshold) {
      return Err(ConfigError::Invalid(format!(
        "IoU 阈值必须在 [0, 1] 内, 实际为 {}",
        self.iou_threshold
      )));
    }
    for (name, value) in self.weights.all() {
      if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::Invalid(format!(
          "损失权重 {} 无效: {}",
          name, value
        )));
      }
    }

    debug!(
      "模型配置: 图像 {}, 网格 {}x{}x{}",
      self.image_size,
      self.grid_size,
      self.grid_size,
      self.priors.len()
    );

    Ok(ModelConfig {
      image_size: self.image_size,
      grid_size: self.grid_size,
      priors: self.priors.into_boxed_slice(),
      iou_threshold: self.iou_threshold,
      weights: self.weights,
      color_bands: self.color_bands,
    })
  }
}

impl FromUrlWithScheme for ModelConfig {
  const SCHEME: &'static str = "config";
}

impl FromUrl for ModelConfig {
  type Error = ConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ConfigError::SchemeMismatch(format!(
        "期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    info!("加载模型配置: {}", url.path());
    let text = std::fs::read_to_string(url.path())?;
    let config: ModelConfig = serde_json::from_str(&text)?;
    Ok(config)
  }
}

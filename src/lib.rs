// 该文件是 Resistenz 项目的一部分。
// src/lib.rs - 库主文件
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

//! 电阻检测器的几何目标编码、锚框匹配与损失

pub mod anchor;
pub mod color;
pub mod config;
pub mod dataset;
pub mod decode;
pub mod geometry;
pub mod grid;
pub mod loss;
pub mod priors;
pub mod record;
pub mod rect;

pub use anchor::{AnchorMasks, AnchorMatcher};
pub use config::{ModelConfig, ModelConfigBuilder, Prior};
pub use decode::{BoxDecoder, Detection};
pub use geometry::OrientedRect;
pub use grid::GridEncoder;
pub use loss::{LossAssembler, LossMetrics};
pub use rect::RectangleExtractor;

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}

// 该文件是 Resistenz 项目的一部分。
// src/color.rs - 色环分类
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

use std::{ops::Range, str::FromStr};

use ndarray::{ArrayViewMut1, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ColorError {
  #[error("未知颜色: {0}")]
  UnknownColor(String),
  #[error("色环数量必须在 3 到 6 之间, 实际为 {0}")]
  BandCount(usize),
  #[error("{group} 色环不允许颜色 {color}")]
  InvalidBand { group: BandGroup, color: Color },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
  Black,
  Brown,
  Red,
  Orange,
  Yellow,
  Green,
  Blue,
  Violet,
  Grey,
  White,
  Gold,
  Silver,
}

impl Color {
  pub fn name(self) -> &'static str {
    match self {
      Color::Black => "black",
      Color::Brown => "brown",
      Color::Red => "red",
      Color::Orange => "orange",
      Color::Yellow => "yellow",
      Color::Green => "green",
      Color::Blue => "blue",
      Color::Violet => "violet",
      Color::Grey => "grey",
      Color::White => "white",
      Color::Gold => "gold",
      Color::Silver => "silver",
    }
  }
}

impl std::fmt::Display for Color {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for Color {
  type Err = ColorError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    use Color::*;
    let color = match s.trim().to_ascii_lowercase().as_str() {
      "black" => Black,
      "brown" => Brown,
      "red" => Red,
      "orange" => Orange,
      "yellow" => Yellow,
      "green" => Green,
      "blue" => Blue,
      "violet" => Violet,
      "grey" | "gray" => Grey,
      "white" => White,
      "gold" => Gold,
      "silver" => Silver,
      _ => return Err(ColorError::UnknownColor(s.to_string())),
    };
    Ok(color)
  }
}

const DIGIT: &[Color] = &[
  Color::Black,
  Color::Brown,
  Color::Red,
  Color::Orange,
  Color::Yellow,
  Color::Green,
  Color::Blue,
  Color::Violet,
  Color::Grey,
  Color::White,
];

const MULTIPLIER: &[Color] = &[
  Color::Black,
  Color::Brown,
  Color::Red,
  Color::Orange,
  Color::Yellow,
  Color::Green,
  Color::Blue,
  Color::Violet,
  Color::Gold,
  Color::Silver,
];

const TOLERANCE: &[Color] = &[
  Color::Brown,
  Color::Red,
  Color::Green,
  Color::Blue,
  Color::Violet,
  Color::Grey,
  Color::Gold,
  Color::Silver,
];

const TEMPERATURE: &[Color] = &[
  Color::Black,
  Color::Brown,
  Color::Red,
  Color::Orange,
  Color::Yellow,
  Color::Green,
  Color::Blue,
  Color::Violet,
  Color::Grey,
];

/// 色环分组，按通道中的排列顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BandGroup {
  FirstDigit,
  SecondDigit,
  ThirdDigit,
  Multiplier,
  Tolerance,
  Temperature,
}

impl std::fmt::Display for BandGroup {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      BandGroup::FirstDigit => "第一数字",
      BandGroup::SecondDigit => "第二数字",
      BandGroup::ThirdDigit => "第三数字",
      BandGroup::Multiplier => "倍率",
      BandGroup::Tolerance => "误差",
      BandGroup::Temperature => "温度系数",
    };
    f.write_str(name)
  }
}

pub const BAND_GROUPS: [BandGroup; 6] = [
  BandGroup::FirstDigit,
  BandGroup::SecondDigit,
  BandGroup::ThirdDigit,
  BandGroup::Multiplier,
  BandGroup::Tolerance,
  BandGroup::Temperature,
];

/// 全部色环分组的通道宽度之和
pub const COLOR_CHANNELS: usize = 10 + 10 + 10 + (10 + 1) + (8 + 1) + (9 + 1);

impl BandGroup {
  pub fn alphabet(self) -> &'static [Color] {
    match self {
      BandGroup::FirstDigit | BandGroup::SecondDigit | BandGroup::ThirdDigit => DIGIT,
      BandGroup::Multiplier => MULTIPLIER,
      BandGroup::Tolerance => TOLERANCE,
      BandGroup::Temperature => TEMPERATURE,
    }
  }

  /// 该分组可以缺省（“none” 占用最后一个通道）
  pub fn optional(self) -> bool {
    matches!(
      self,
      BandGroup::Multiplier | BandGroup::Tolerance | BandGroup::Temperature
    )
  }

  pub fn width(self) -> usize {
    self.alphabet().len() + usize::from(self.optional())
  }

  fn index_of(self, color: Option<Color>) -> Option<usize> {
    match color {
      Some(color) => self.alphabet().iter().position(|&c| c == color),
      None if self.optional() => Some(self.alphabet().len()),
      None => None,
    }
  }

  fn color_at(self, index: usize) -> Option<Color> {
    self.alphabet().get(index).copied()
  }
}

/// 各分组在色环通道中的区间（相对于色环通道起点）
pub fn group_ranges() -> [Range<usize>; 6] {
  let mut start = 0;
  BAND_GROUPS.map(|group| {
    let range = start..start + group.width();
    start = range.end;
    range
  })
}

/// 规范化的六段色环标注，`None` 表示该段不存在
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorBands(pub [Option<Color>; 6]);

impl ColorBands {
  /// 按标注工具的约定补齐为六段：
  /// 3 段 → 三位数字；4 段 → 三位数字 + 误差；5 段 → 缺温度系数；6 段原样。
  pub fn from_colors(colors: &[Color]) -> Result<Self, ColorError> {
    let bands = match colors {
      &[a, b, c] => [Some(a), Some(b), Some(c), None, None, None],
      &[a, b, c, tol] => [Some(a), Some(b), Some(c), None, Some(tol), None],
      &[a, b, c, mul, tol] => [Some(a), Some(b), Some(c), Some(mul), Some(tol), None],
      &[a, b, c, mul, tol, temp] => [Some(a), Some(b), Some(c), Some(mul), Some(tol), Some(temp)],
      _ => return Err(ColorError::BandCount(colors.len())),
    };

    for (group, band) in BAND_GROUPS.iter().zip(bands) {
      if let Some(color) = band
        && group.index_of(Some(color)).is_none()
      {
        return Err(ColorError::InvalidBand {
          group: *group,
          color,
        });
      }
    }

    Ok(ColorBands(bands))
  }

  pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, ColorError> {
    let colors = names
      .iter()
      .map(|n| n.as_ref().parse())
      .collect::<Result<Vec<Color>, _>>()?;
    Self::from_colors(&colors)
  }

  /// 写入独热编码，`out` 长度必须为 [`COLOR_CHANNELS`]，可以是非连续视图
  pub fn write_one_hot(&self, mut out: ArrayViewMut1<f32>) {
    debug_assert_eq!(out.len(), COLOR_CHANNELS);
    out.fill(0.0);
    for ((group, range), band) in BAND_GROUPS.iter().zip(group_ranges()).zip(self.0) {
      if let Some(i) = group.index_of(band) {
        out[range.start + i] = 1.0;
      }
    }
  }

  /// 每组取最大值对应的颜色
  pub fn from_scores(scores: &[f32]) -> Self {
    let mut bands = [None; 6];
    for ((group, range), band) in BAND_GROUPS.iter().zip(group_ranges()).zip(bands.iter_mut()) {
      let best = argmax(&scores[range]);
      *band = group.color_at(best);
    }
    ColorBands(bands)
  }
}

/// 最大值下标，相同时取最小下标
pub fn argmax(values: &[f32]) -> usize {
  let mut best = 0;
  for (i, &v) in values.iter().enumerate() {
    if v > values[best] {
      best = i;
    }
  }
  best
}

/// 数值稳定的 log-softmax
pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
  let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
  let log_sum = logits.iter().map(|&l| (l - max).exp()).sum::<f32>().ln();
  logits.iter().map(|&l| l - max - log_sum).collect()
}

/// 对色环通道逐组做 softmax
pub fn softmax_groups(mut values: ArrayViewMut1<f32>) {
  debug_assert_eq!(values.len(), COLOR_CHANNELS);
  for range in group_ranges() {
    let mut group = values.slice_mut(s![range]);
    let max = group.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    group.mapv_inplace(|v| (v - max).exp());
    let sum = group.sum();
    group.mapv_inplace(|v| v / sum);
  }
}

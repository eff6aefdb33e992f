// 该文件是 Resistenz 项目的一部分。
// src/record/directory_record.rs - 按日期分目录的指标记录
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
  fs::OpenOptions,
  io::Write,
  path::{Path, PathBuf},
  sync::{Arc, Mutex},
};

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::{FromUrl, FromUrlWithScheme, record::Report};

const METRICS_FILE: &str = "metrics.jsonl";

#[derive(Error, Debug)]
pub enum DirectoryReportError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("记录计数器锁已损坏")]
  Poisoned,
}

#[derive(Serialize)]
struct Line<'a, T> {
  time: String,
  seq: u64,
  tag: &'a str,
  metrics: &'a T,
}

/// 把指标追加到 `<dir>/<yyyy>/<mm>/<dd>/metrics.jsonl`，每行一个 JSON 对象
pub struct DirectoryReport {
  directory: PathBuf,
  counter: Arc<Mutex<u64>>,
}

impl FromUrlWithScheme for DirectoryReport {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryReport {
  type Error = DirectoryReportError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryReportError::SchemeMismatch);
    }
    Ok(DirectoryReport::new(uri.path()))
  }
}

impl DirectoryReport {
  pub fn new(directory: impl AsRef<Path>) -> Self {
    DirectoryReport {
      directory: directory.as_ref().to_path_buf(),
      counter: Arc::new(Mutex::new(0)),
    }
  }

  fn next_seq(&self) -> Result<u64, DirectoryReportError> {
    let mut counter = self
      .counter
      .lock()
      .map_err(|_| DirectoryReportError::Poisoned)?;
    *counter += 1;
    Ok(*counter)
  }

  pub fn path_for(&self, now: &DateTime<Utc>) -> PathBuf {
    self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()))
      .join(METRICS_FILE)
  }

  pub fn report_at<T: Serialize>(
    &self,
    now: DateTime<Utc>,
    tag: &str,
    item: &T,
  ) -> Result<PathBuf, DirectoryReportError> {
    let path = self.path_for(&now);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let line = Line {
      time: now.to_rfc3339(),
      seq: self.next_seq()?,
      tag,
      metrics: item,
    };
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(file, "{}", serde_json::to_string(&line)?)?;
    debug!("记录指标 {} 到 {}", tag, path.display());
    Ok(path)
  }
}

impl<T: Serialize> Report<T> for DirectoryReport {
  type Error = DirectoryReportError;

  fn report(&self, tag: &str, item: &T) -> Result<(), Self::Error> {
    self.report_at(Utc::now(), tag, item).map(|_| ())
  }
}

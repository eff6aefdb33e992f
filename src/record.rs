// 该文件是 Resistenz 项目的一部分。
// src/record.rs - 训练指标记录
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

use serde::Serialize;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

/// 指标输出
pub trait Report<Item>: Sized {
  type Error;
  fn report(&self, tag: &str, item: &Item) -> Result<(), Self::Error>;
}

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::{DirectoryReport, DirectoryReportError};

#[derive(Error, Debug)]
pub enum RecordError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[cfg(feature = "directory_record")]
  #[error("目录记录错误: {0}")]
  DirectoryReportError(#[from] DirectoryReportError),
}

/// 以 `info!` 事件输出指标
#[derive(Debug, Clone, Default)]
pub struct LogReport;

impl FromUrlWithScheme for LogReport {
  const SCHEME: &'static str = "log";
}

impl FromUrl for LogReport {
  type Error = RecordError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(RecordError::SchemeMismatch(url.scheme().to_string()));
    }
    Ok(LogReport)
  }
}

impl<T: Serialize> Report<T> for LogReport {
  type Error = RecordError;

  fn report(&self, tag: &str, item: &T) -> Result<(), Self::Error> {
    info!("[{}] {}", tag, serde_json::to_string(item)?);
    Ok(())
  }
}

pub enum ReportWrapper {
  LogReport(LogReport),
  #[cfg(feature = "directory_record")]
  DirectoryReport(DirectoryReport),
}

impl FromUrl for ReportWrapper {
  type Error = RecordError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      LogReport::SCHEME => Ok(ReportWrapper::LogReport(LogReport::from_url(url)?)),
      #[cfg(feature = "directory_record")]
      DirectoryReport::SCHEME => {
        let report = DirectoryReport::from_url(url)?;
        Ok(ReportWrapper::DirectoryReport(report))
      }
      scheme => Err(RecordError::SchemeMismatch(scheme.to_string())),
    }
  }
}

impl<T: Serialize> Report<T> for ReportWrapper {
  type Error = RecordError;

  fn report(&self, tag: &str, item: &T) -> Result<(), Self::Error> {
    match self {
      ReportWrapper::LogReport(report) => report.report(tag, item),
      #[cfg(feature = "directory_record")]
      ReportWrapper::DirectoryReport(report) => report
        .report(tag, item)
        .map_err(RecordError::from),
    }
  }
}

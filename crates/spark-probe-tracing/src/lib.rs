//! spark-probe 的日志安装层。
//!
//! # 教案式说明
//! - **意图（Why）**：探针核心只通过 `tracing` 宏发出事件，不关心事件落在哪里；宿主进程在启动时调用一次
//!   [`install`]，即可看到链路重建、摘除与边界上报等日志。
//! - **逻辑（How）**：以 `tracing-subscriber` 组装 `EnvFilter + fmt` 两层，设置为全局 Subscriber；
//!   安装状态由 `OnceLock` 记录，保证进程内只生效一次。
//! - **契约（What）**：重复调用返回 [`Error::AlreadyInstalled`]；外部已设置 Subscriber 时返回
//!   [`Error::SubscriberAlreadySet`]；过滤表达式非法时不触碰全局状态。

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
pub use spark_probe::observability::BOUNDARY_TARGET;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, filter::ParseError, layer::SubscriberExt};

/// 安装标记，确保 `install` 仅成功一次。
static INSTALLED: OnceLock<()> = OnceLock::new();

/// 日志安装参数。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    /// `EnvFilter` 语法的过滤表达式，例如 `info,spark_probe=debug`。
    pub filter: String,
    /// 是否输出 ANSI 颜色。
    pub ansi: bool,
    /// 是否在每行日志中打印事件 target。
    pub with_target: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
            ansi: true,
            with_target: true,
        }
    }
}

impl LoggingSettings {
    /// 从 TOML 文本解析安装参数，缺省字段取默认值。
    ///
    /// ```
    /// use spark_probe_tracing::LoggingSettings;
    ///
    /// let settings = LoggingSettings::from_toml_str("filter = \"spark_probe=debug\"")?;
    /// assert_eq!(settings.filter, "spark_probe=debug");
    /// assert!(settings.with_target);
    /// # Ok::<(), spark_probe_tracing::Error>(())
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self, Error> {
        Ok(toml::from_str(source)?)
    }

    /// 按当前设置构造过滤器。
    pub fn env_filter(&self) -> Result<EnvFilter, Error> {
        EnvFilter::try_new(&self.filter).map_err(|source| Error::InvalidFilter {
            filter: self.filter.clone(),
            source,
        })
    }
}

/// 安装过程可能出现的错误。
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `install` 被重复调用。
    #[error("spark-probe-tracing 已完成安装，禁止重复调用 install")]
    AlreadyInstalled,
    /// 外部提前设置了全局 Subscriber。
    #[error("全局 tracing Subscriber 已存在，无法覆盖")]
    SubscriberAlreadySet,
    /// 过滤表达式无法解析。
    #[error("非法的过滤表达式 `{filter}`: {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: ParseError,
    },
    /// TOML 配置解析失败。
    #[error("非法的日志配置: {0}")]
    Settings(#[from] toml::de::Error),
}

/// 安装全局 Subscriber。
///
/// # 教案式说明
/// - **逻辑（How）**：
///   1. 检查本进程是否已安装、外部是否已设置 Subscriber；
///   2. 解析过滤表达式，失败时直接返回，全局状态保持不变；
///   3. 组装 `EnvFilter + fmt` 并设置为全局默认；
///   4. 写入 `INSTALLED`，并发的第二个调用者在此处得到 [`Error::AlreadyInstalled`]。
/// - **契约（What）**：成功后 `spark_probe` 的所有事件按 `settings.filter` 输出到标准输出。
pub fn install(settings: &LoggingSettings) -> Result<(), Error> {
    if INSTALLED.get().is_some() {
        return Err(Error::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(Error::SubscriberAlreadySet);
    }

    let filter = settings.env_filter()?;
    let subscriber = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer()
            .with_ansi(settings.ansi)
            .with_target(settings.with_target),
    );
    if INSTALLED.set(()).is_err() {
        return Err(Error::AlreadyInstalled);
    }
    tracing::subscriber::set_global_default(subscriber).map_err(|_| Error::SubscriberAlreadySet)
}

/// 本进程是否已由 [`install`] 完成安装。
pub fn is_installed() -> bool {
    INSTALLED.get().is_some()
}

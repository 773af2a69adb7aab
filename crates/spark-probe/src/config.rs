//! 探针行为配置。
//!
//! # 设计背景（Why）
//! - 少数容错细节需要按部署调整：例如在排障环境中关闭 panic 捕获，让不可信观察者的 panic 直接暴露；
//! - 配置以 TOML 表达，与工作区其余组件的声明式配置保持一致。
//!
//! # 契约说明（What）
//! - 缺省字段取默认值，未知字段视为错误，避免拼写错误被静默忽略；
//! - 配置在探针构造时确定，运行期不可变。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 探针容错与校验开关。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeSettings {
    /// 校验 unwind 处理器返回值是否属于可互操作集合。
    pub validate_unwind_values: bool,
    /// 捕获不可信观察者的 panic 并按普通失败上报。
    pub catch_observer_panics: bool,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            validate_unwind_values: true,
            catch_observer_panics: true,
        }
    }
}

impl ProbeSettings {
    /// 从 TOML 文本解析配置。
    ///
    /// ```
    /// use spark_probe::ProbeSettings;
    ///
    /// let settings = ProbeSettings::from_toml_str("catch_observer_panics = false")?;
    /// assert!(settings.validate_unwind_values);
    /// assert!(!settings.catch_observer_panics);
    /// # Ok::<(), spark_probe::SettingsError>(())
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(source)?)
    }
}

/// 配置解析失败。
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid probe settings: {0}")]
    Parse(#[from] toml::de::Error),
}

//! 探针依赖的外部协作方。
//!
//! # 设计背景（Why）
//! - 绑定注册表、探针在宿主程序中的安装与移除、失败上报都不属于探针链本身，
//!   探针只通过三个窄接口与它们交互，便于在测试中替换为记录型桩件；
//! - [`ProbeServices`] 将协作方与配置打包，探针构造时一次性注入，派发期间只读。
//!
//! # 契约说明（What）
//! - [`ChainBuilder::active_bindings`] 在重建锁内调用，禁止回调同一探针的派发或重建；
//! - [`ProbeHost::detach_probe`] 从探针视角看是幂等的；
//! - [`BoundaryReporter::report`] 不得失败，也不应 panic。

use std::{fmt, sync::Arc};

use crate::{
    binding::Binding, config::ProbeSettings, error::ObserverError, observability::BOUNDARY_TARGET,
    probe::Probe,
};

/// 为探针提供当前适用的绑定列表，列表顺序即链路顺序。
pub trait ChainBuilder: Send + Sync + 'static {
    fn active_bindings(&self, probe: &Probe) -> Vec<Arc<Binding>>;
}

/// 宿主侧的探针管理。
pub trait ProbeHost: Send + Sync + 'static {
    /// 探针已无任何适用绑定，宿主可以将其从程序表示中移除。
    fn detach_probe(&self, probe: &Probe);
}

/// 不可信观察者失败的上报出口。
pub trait BoundaryReporter: Send + Sync + 'static {
    fn report(&self, binding: &Binding, operation: &'static str, error: &ObserverError);
}

/// 以 `tracing` 事件上报边界失败的默认实现。
///
/// 每次上报输出一条 `error` 级事件，目标为 [`BOUNDARY_TARGET`]。
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingBoundaryReporter;

impl BoundaryReporter for TracingBoundaryReporter {
    fn report(&self, binding: &Binding, operation: &'static str, error: &ObserverError) {
        tracing::error!(
            target: BOUNDARY_TARGET,
            {
                binding.id = %binding.id(),
                binding.label = binding.label(),
                probe.operation = operation,
                error.code = error.code(),
            },
            "untrusted observer failed: {}",
            error.message()
        );
    }
}

/// 探针的协作方与配置。
#[derive(Clone)]
pub struct ProbeServices {
    builder: Arc<dyn ChainBuilder>,
    host: Arc<dyn ProbeHost>,
    reporter: Arc<dyn BoundaryReporter>,
    settings: ProbeSettings,
}

impl ProbeServices {
    /// 以默认上报器与默认配置构造。
    pub fn new(builder: Arc<dyn ChainBuilder>, host: Arc<dyn ProbeHost>) -> Self {
        Self {
            builder,
            host,
            reporter: Arc::new(TracingBoundaryReporter),
            settings: ProbeSettings::default(),
        }
    }

    /// 替换边界上报器。
    pub fn with_reporter(mut self, reporter: Arc<dyn BoundaryReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// 替换配置。
    pub fn with_settings(mut self, settings: ProbeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn builder(&self) -> &dyn ChainBuilder {
        self.builder.as_ref()
    }

    pub fn host(&self) -> &dyn ProbeHost {
        self.host.as_ref()
    }

    pub fn reporter(&self) -> &dyn BoundaryReporter {
        self.reporter.as_ref()
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }
}

impl fmt::Debug for ProbeServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeServices")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

//! 探针协作方的测试桩集合。
//!
//! # 设计定位（Why）
//! - 集成测试、基准与文档示例都需要满足 [`ChainBuilder`]、[`ProbeHost`]、[`BoundaryReporter`]
//!   契约，但只关心探针本身的行为；统一出口避免各测试文件重复定义记录型桩件。
//!
//! # 使用方式（How）
//! - [`StaticChainBuilder`]：持有一份按优先级排序的绑定列表，可在测试中随时替换，并统计重建次数；
//! - [`RecordingHost`]：记录 `detach_probe` 调用；
//! - [`RecordingReporter`]：记录每一次边界上报；[`NoopReporter`] 忽略所有上报。
//!
//! # 契约说明（What）
//! - 桩件内部使用 `parking_lot::Mutex`，可在多线程测试中共享；
//! - 仅用于测试与示例，生产代码应接入真实的注册表与上报通道。

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    binding::{Binding, BindingId},
    error::ObserverError,
    probe::{Probe, ProbeId},
    services::{BoundaryReporter, ChainBuilder, ProbeHost},
};

/// 返回固定绑定列表的构建器，列表按 `priority` 稳定排序。
#[derive(Debug, Default)]
pub struct StaticChainBuilder {
    bindings: Mutex<Vec<Arc<Binding>>>,
    calls: AtomicUsize,
}

impl StaticChainBuilder {
    pub fn new(bindings: impl IntoIterator<Item = Arc<Binding>>) -> Self {
        let builder = Self::default();
        builder.set(bindings);
        builder
    }

    /// 替换全部绑定。调用方需自行让相关探针失效。
    pub fn set(&self, bindings: impl IntoIterator<Item = Arc<Binding>>) {
        let mut bindings: Vec<_> = bindings.into_iter().collect();
        bindings.sort_by_key(|binding| binding.priority());
        *self.bindings.lock() = bindings;
    }

    /// 追加一个绑定并保持排序。
    pub fn push(&self, binding: Arc<Binding>) {
        let mut bindings = self.bindings.lock();
        bindings.push(binding);
        bindings.sort_by_key(|binding| binding.priority());
    }

    /// 移除给定绑定，返回是否命中。
    pub fn remove(&self, id: BindingId) -> bool {
        let mut bindings = self.bindings.lock();
        let before = bindings.len();
        bindings.retain(|binding| binding.id() != id);
        bindings.len() != before
    }

    /// `active_bindings` 被调用的次数，即探针发起重建的次数。
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ChainBuilder for StaticChainBuilder {
    fn active_bindings(&self, _probe: &Probe) -> Vec<Arc<Binding>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bindings.lock().clone()
    }
}

/// 记录 `detach_probe` 调用的宿主。
#[derive(Debug, Default)]
pub struct RecordingHost {
    detached: Mutex<Vec<ProbeId>>,
}

impl RecordingHost {
    pub fn detached(&self) -> Vec<ProbeId> {
        self.detached.lock().clone()
    }

    pub fn detach_count(&self) -> usize {
        self.detached.lock().len()
    }
}

impl ProbeHost for RecordingHost {
    fn detach_probe(&self, probe: &Probe) {
        self.detached.lock().push(probe.id());
    }
}

/// 一次边界上报的快照。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundaryReport {
    pub binding: BindingId,
    pub label: String,
    pub operation: &'static str,
    pub code: &'static str,
    pub message: String,
}

/// 记录全部边界上报的上报器。
#[derive(Debug, Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<BoundaryReport>>,
}

impl RecordingReporter {
    pub fn reports(&self) -> Vec<BoundaryReport> {
        self.reports.lock().clone()
    }

    /// 已上报的错误码，按上报顺序。
    pub fn codes(&self) -> Vec<&'static str> {
        self.reports.lock().iter().map(|report| report.code).collect()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }
}

impl BoundaryReporter for RecordingReporter {
    fn report(&self, binding: &Binding, operation: &'static str, error: &ObserverError) {
        self.reports.lock().push(BoundaryReport {
            binding: binding.id(),
            label: binding.label().to_owned(),
            operation,
            code: error.code(),
            message: error.message().to_owned(),
        });
    }
}

/// 忽略全部上报。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopReporter;

impl BoundaryReporter for NoopReporter {
    fn report(&self, _binding: &Binding, _operation: &'static str, _error: &ObserverError) {}
}

//! 观察者钩子的调用上下文。

use std::{fmt, sync::Arc};

use crate::{
    binding::Binding,
    error::HookError,
    probe::{Probe, ProbeId},
    unwind::{UnwindPayload, UnwindSignal},
};

/// 插桩点的静态源码位置。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    source_name: Arc<str>,
    line: u32,
    column: u32,
}

impl SourceLocation {
    pub fn new(source_name: impl Into<Arc<str>>, line: u32, column: u32) -> Self {
        Self {
            source_name: source_name.into(),
            line,
            column,
        }
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn column(&self) -> u32 {
        self.column
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.source_name, self.line, self.column)
    }
}

/// 钩子调用期间可用的上下文句柄。
///
/// # 教案式说明
/// - **意图（Why）**：观察者需要知道“自己是谁、在哪里被调用”，并且只能以自己的名义发起 unwind；
///   将构造入口收敛到上下文上，保证 [`UnwindSignal`] 的归属绑定不可伪造。
/// - **契约（What）**：上下文借用探针与绑定，生命周期不超过单次钩子调用。
#[derive(Clone, Copy)]
pub struct EventContext<'a> {
    probe: &'a Probe,
    binding: &'a Arc<Binding>,
}

impl<'a> EventContext<'a> {
    pub(crate) fn new(probe: &'a Probe, binding: &'a Arc<Binding>) -> Self {
        Self { probe, binding }
    }

    /// 插桩点位置。
    pub fn location(&self) -> &'a SourceLocation {
        self.probe.location()
    }

    /// 当前钩子所属的绑定。
    pub fn binding(&self) -> &'a Arc<Binding> {
        self.binding
    }

    /// 当前探针标识。
    pub fn probe_id(&self) -> ProbeId {
        self.probe.id()
    }

    /// 以当前绑定的名义构造 unwind 请求，钩子直接 `return Err(..)` 即可发起。
    pub fn create_unwind<T>(&self, payload: T) -> HookError
    where
        T: std::any::Any + Send + Sync,
    {
        HookError::Unwind(UnwindSignal::new(
            self.binding.id(),
            UnwindPayload::new(payload),
        ))
    }
}

impl fmt::Debug for EventContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventContext")
            .field("probe", &self.probe.id())
            .field("binding", &self.binding.id())
            .field("location", self.location())
            .finish()
    }
}

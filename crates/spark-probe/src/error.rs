//! 探针链错误域。
//!
//! # 设计背景（Why）
//! - 插桩观察者分为“可信”（语言内部）与“不可信”（外部工具）两类，二者失败后的去向截然不同：
//!   前者必须原样逃逸以改变宿主语义，后者必须被吞没并上报，绝不能影响宿主计算；
//! - unwind 不是错误，而是显式的控制流请求，需要与普通失败在类型层面区分开，避免被容错逻辑误吞；
//! - 宿主级致命信号（例如全局拆除标记）必须绕过所有容错路径。
//!
//! # 逻辑解析（How）
//! - [`HookError`]：观察者钩子返回的错误，覆盖 unwind、普通失败、主动抛出的访客异常与致命信号；
//! - [`ExecutionFault`]：穿越插桩点、最终交给宿主的故障形态；
//! - [`ObserverError`]：沿用 `CoreError` 的“稳定错误码 + 人类可读消息 + 可选根因”结构；
//! - [`codes`]：集中维护错误码，防止裸字符串散落。
//!
//! # 契约说明（What）
//! - 所有类型均满足 `Send + Sync + 'static`，可在线程间移动；
//! - 不可信来源的失败永远不会以 [`ExecutionFault`] 的形式出现在宿主侧。

use std::{any::Any, borrow::Cow};

use thiserror::Error;

use crate::{binding::BindingId, unwind::UnwindSignal, value::GuestException};

/// 观察者失败的根因类型。
pub type ErrorCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 稳定错误码集合。
///
/// # 契约（What）
/// - 命名遵循 `<域>.<语义>`；新增码值需同步更新告警与排障文档。
pub mod codes {
    /// 观察者钩子返回的普通失败。
    pub const OBSERVER_FAILED: &str = "probe.observer_failed";
    /// 不可信观察者在钩子中 panic。
    pub const OBSERVER_PANICKED: &str = "probe.observer_panicked";
    /// 不可信观察者试图抛出访客异常。
    pub const GUEST_EXCEPTION: &str = "probe.guest_exception";
    /// 在 unwind 处理器内部再次发起 unwind。
    pub const NESTED_UNWIND: &str = "probe.nested_unwind";
    /// unwind 处理器返回了不可互操作的值。
    pub const UNWIND_TYPE_VIOLATION: &str = "probe.unwind_type_violation";
}

/// 观察者失败的统一载体。
///
/// # 教案式说明
/// - **意图（Why）**：边界上报需要稳定的机读维度（错误码）与排障信息（消息、根因），
///   该结构与核心错误保持同样的三段式形态，便于日志聚合。
/// - **逻辑（How）**：`code` 为 `'static` 字符串，`message` 使用 `Cow` 兼容静态与动态文案，
///   `cause` 通过 `#[source]` 暴露给 `std::error::Error::source`。
/// - **契约（What）**：构造后错误码不可变；消息不应包含敏感信息。
#[derive(Debug, Error)]
#[error("[{code}] {message}")]
pub struct ObserverError {
    code: &'static str,
    message: Cow<'static, str>,
    #[source]
    cause: Option<ErrorCause>,
}

impl ObserverError {
    /// 构造观察者错误。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// 以默认错误码 [`codes::OBSERVER_FAILED`] 构造。
    pub fn failed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::OBSERVER_FAILED, message)
    }

    /// 附带底层原因。
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 将 `catch_unwind` 捕获的 panic 负载转换为错误。
    ///
    /// # 逻辑（How）
    /// - `panic!` 的负载通常是 `&'static str` 或 `String`，两者均尝试提取；其余类型以占位文案代替。
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message: Cow<'static, str> = if let Some(text) = payload.downcast_ref::<&'static str>()
        {
            Cow::Borrowed(*text)
        } else if let Some(text) = payload.downcast_ref::<String>() {
            Cow::Owned(text.clone())
        } else {
            Cow::Borrowed("observer panicked with a non-string payload")
        };
        Self::new(codes::OBSERVER_PANICKED, message)
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 人类可读描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }
}

/// 宿主级致命信号，例如线程或上下文被强制拆除。
///
/// 致命信号在任何位置出现都会立即向外传播，不参与容错与 unwind 派发。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("fatal host signal: {reason}")]
pub struct FatalSignal {
    reason: Cow<'static, str>,
}

impl FatalSignal {
    /// 构造致命信号。
    pub fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// 信号原因。
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// 观察者钩子的失败返回。
///
/// # 教案式说明
/// - **意图（Why）**：用一个封闭枚举显式区分四类结果，使探针链能够逐一套用容错策略，
///   而不是依赖宿主语言原生的异常机制。
/// - **契约（What）**：
///   - `Unwind`：只能通过 [`EventContext::create_unwind`](crate::context::EventContext::create_unwind) 构造；
///   - `Failure`：普通失败，可信时逃逸、不可信时上报；
///   - `Guest`：观察者主动抛出的访客异常，仅可信观察者能借此改变宿主语义；
///   - `Fatal`：致命信号，任何情况下都直接传播。
#[derive(Debug, Error)]
pub enum HookError {
    /// 控制流重定向请求。
    #[error("unwind requested by {}", .0.origin())]
    Unwind(UnwindSignal),
    /// 普通失败。
    #[error(transparent)]
    Failure(ObserverError),
    /// 观察者抛出的访客异常。
    #[error("observer raised guest exception: {0}")]
    Guest(GuestException),
    /// 宿主级致命信号。
    #[error(transparent)]
    Fatal(FatalSignal),
}

impl HookError {
    /// 将可信绑定的失败转换为逃逸到宿主的故障。
    pub(crate) fn into_trusted_fault(
        self,
        binding: BindingId,
        operation: &'static str,
    ) -> ExecutionFault {
        match self {
            HookError::Unwind(signal) => ExecutionFault::Unwind(signal),
            HookError::Failure(error) => {
                ExecutionFault::Observer(ObserverFault::new(binding, operation, error))
            }
            HookError::Guest(exception) => ExecutionFault::Guest(exception),
            HookError::Fatal(signal) => ExecutionFault::Fatal(signal),
        }
    }

    /// 将不可信绑定的失败折叠为待上报的观察者错误。
    pub(crate) fn into_contained(self) -> ObserverError {
        match self {
            HookError::Failure(error) => error,
            HookError::Guest(exception) => {
                ObserverError::new(codes::GUEST_EXCEPTION, exception.message().to_owned())
            }
            HookError::Unwind(signal) => ObserverError::new(
                codes::NESTED_UNWIND,
                format!("unwind from {} raised where it cannot be dispatched", signal.origin()),
            ),
            HookError::Fatal(signal) => ObserverError::failed(signal.reason().to_owned()),
        }
    }
}

impl From<ObserverError> for HookError {
    fn from(error: ObserverError) -> Self {
        HookError::Failure(error)
    }
}

impl From<GuestException> for HookError {
    fn from(exception: GuestException) -> Self {
        HookError::Guest(exception)
    }
}

impl From<FatalSignal> for HookError {
    fn from(signal: FatalSignal) -> Self {
        HookError::Fatal(signal)
    }
}

/// 可信观察者失败逃逸时附带的上下文。
#[derive(Debug, Error)]
#[error("trusted {binding} failed in `{operation}`: {error}")]
pub struct ObserverFault {
    binding: BindingId,
    operation: &'static str,
    #[source]
    error: ObserverError,
}

impl ObserverFault {
    pub(crate) fn new(binding: BindingId, operation: &'static str, error: ObserverError) -> Self {
        Self {
            binding,
            operation,
            error,
        }
    }

    /// 失败的绑定。
    pub fn binding(&self) -> BindingId {
        self.binding
    }

    /// 失败发生时的操作名，取值见 [`crate::observability::operation`]。
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// 原始错误。
    pub fn error(&self) -> &ObserverError {
        &self.error
    }
}

/// 穿越插桩点并交给宿主的故障。
///
/// # 教案式说明
/// - **意图（Why）**：宿主执行体与探针生命周期方法共享同一故障类型，使“执行体抛出的异常”
///   与“观察者请求的 unwind”可以走同一条协调路径。
/// - **契约（What）**：
///   - `Guest`：访客语言异常；
///   - `Unwind`：尚未解析的 unwind，外层探针的观察者仍有机会处理；
///   - `Observer`：可信观察者失败；
///   - `Fatal`：致命信号，必须原样传播。
#[derive(Debug, Error)]
pub enum ExecutionFault {
    /// 访客语言异常。
    #[error("guest exception: {0}")]
    Guest(GuestException),
    /// 未被解析的 unwind 请求。
    #[error("unresolved unwind from {}", .0.origin())]
    Unwind(UnwindSignal),
    /// 可信观察者失败。
    #[error(transparent)]
    Observer(ObserverFault),
    /// 宿主级致命信号。
    #[error(transparent)]
    Fatal(FatalSignal),
}

impl ExecutionFault {
    /// 若为 unwind 则返回信号引用。
    pub fn as_unwind(&self) -> Option<&UnwindSignal> {
        match self {
            ExecutionFault::Unwind(signal) => Some(signal),
            _ => None,
        }
    }

    /// 是否为致命信号。
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecutionFault::Fatal(_))
    }
}

impl From<GuestException> for ExecutionFault {
    fn from(exception: GuestException) -> Self {
        ExecutionFault::Guest(exception)
    }
}

impl From<FatalSignal> for ExecutionFault {
    fn from(signal: FatalSignal) -> Self {
        ExecutionFault::Fatal(signal)
    }
}

//! 观察者契约。
//!
//! # 设计背景（Why）
//! - 探针链的节点分为两种形态：在所有探针间共享的无状态监听器，以及为每个探针单独创建、
//!   拥有独立释放周期的处理器。二者暴露相同的四个生命周期钩子，处理器额外拥有 `on_dispose`；
//! - 钩子通过返回 [`HookError`] 表达失败或 unwind，而不是 panic，使容错策略可以逐类处理。
//!
//! # 契约说明（What）
//! - 所有钩子在宿主执行线程上同步调用，同一探针可能被多个执行并发进入，实现必须 `Send + Sync`；
//! - 钩子收到的 [`EventContext`] 仅在本次调用内有效，不应被保存；
//! - 默认实现全部为空操作，观察者只需覆盖关心的事件。

use std::sync::Arc;

use crate::{
    context::EventContext,
    error::{ExecutionFault, HookError},
    unwind::UnwindPayload,
    value::GuestValue,
};

/// 生命周期钩子的返回类型。
pub type HookResult = Result<(), HookError>;

/// unwind 处理器对自己发起的请求给出的裁决。
#[derive(Clone, Debug, PartialEq)]
pub enum UnwindOutcome {
    /// 不表态，原始故障继续传播。
    NoOpinion,
    /// 从头重新执行插桩点。
    Reenter,
    /// 以给定值立即完成插桩点，值必须属于可互操作集合。
    Return(GuestValue),
}

/// 无状态监听器，同一实例被所有匹配的探针共享。
pub trait ExecutionListener: Send + Sync + 'static {
    /// 进入插桩点。
    fn on_enter(&self, _ctx: &EventContext<'_>) -> HookResult {
        Ok(())
    }

    /// 插桩点正常返回。
    fn on_return_value(&self, _ctx: &EventContext<'_>, _result: &GuestValue) -> HookResult {
        Ok(())
    }

    /// 插桩点以故障结束，`fault` 也可能是一个正在传播的 unwind。
    fn on_return_exceptional(&self, _ctx: &EventContext<'_>, _fault: &ExecutionFault) -> HookResult {
        Ok(())
    }

    /// 处理本绑定先前发起的 unwind，`payload` 为发起时附带的负载。
    fn on_unwind(
        &self,
        _ctx: &EventContext<'_>,
        _payload: &UnwindPayload,
    ) -> Result<UnwindOutcome, HookError> {
        Ok(UnwindOutcome::NoOpinion)
    }
}

/// 每探针处理器。
///
/// # 契约（What）
/// - 由 [`ExecutionHandlerFactory::create`] 在链路重建时创建，只服务于一个探针；
/// - 在替换它的新链路发布之后恰好收到一次 `on_dispose`，此后不会再被调用。
pub trait ExecutionHandler: Send + Sync + 'static {
    fn on_enter(&self, _ctx: &EventContext<'_>) -> HookResult {
        Ok(())
    }

    fn on_return_value(&self, _ctx: &EventContext<'_>, _result: &GuestValue) -> HookResult {
        Ok(())
    }

    fn on_return_exceptional(&self, _ctx: &EventContext<'_>, _fault: &ExecutionFault) -> HookResult {
        Ok(())
    }

    fn on_unwind(
        &self,
        _ctx: &EventContext<'_>,
        _payload: &UnwindPayload,
    ) -> Result<UnwindOutcome, HookError> {
        Ok(UnwindOutcome::NoOpinion)
    }

    /// 所属链路被替换后调用。
    fn on_dispose(&self, _ctx: &EventContext<'_>) -> HookResult {
        Ok(())
    }
}

/// 每探针处理器工厂。
///
/// # 教案式说明
/// - **意图（Why）**：有状态的观察者需要为每个插桩点维护独立状态（计数器、计时器等），
///   工厂让注册表只登记一次，而由探针在重建时按需实例化。
/// - **契约（What）**：`create` 在探针的重建锁内调用，禁止在其中对同一探针派发事件；
///   不可信绑定的创建失败会被上报，对应节点从链路中省略。
pub trait ExecutionHandlerFactory: Send + Sync + 'static {
    fn create(&self, ctx: &EventContext<'_>) -> Result<Arc<dyn ExecutionHandler>, HookError>;
}

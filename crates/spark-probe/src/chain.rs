//! 探针链节点与有序派发。
//!
//! # 设计背景（Why）
//! - 链路是一条按绑定顺序排列的单链表，进入事件从头到尾、返回事件从尾到头，
//!   从而让嵌套的观察者（计时器、作用域跟踪）天然获得 LIFO 配对；
//! - 节点形态封闭为两种：共享监听器与每探针处理器，派发通过 `match` 完成，无需动态类型判断。
//!
//! # 逻辑解析（How）
//! - 每次钩子调用经由 `invoke` 统一套用容错策略：不可信绑定的 panic 被捕获，
//!   普通失败被上报并吞没，可信失败立即中止遍历，致命信号无条件逃逸；
//! - unwind 请求不会在遍历中被吞没，而是按出现顺序合并后交还探针，由探针发起第二轮
//!   `on_unwind` 派发；
//! - `on_unwind` 先计算本地裁决、再计算后继裁决，二者经 [`UnwindAction::merge`] 合并。
//!
//! # 契约说明（What）
//! - 节点在重建时创建，替换它的新链路发布后恰好释放一次；
//! - 所有遍历均不持锁，可与重建并发执行。

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use crate::{
    binding::{Binding, BindingElement},
    context::EventContext,
    error::{ExecutionFault, HookError, ObserverError, ObserverFault, codes},
    internal::SeenFlags,
    observability::operation,
    observer::{ExecutionHandler, ExecutionListener, HookResult, UnwindOutcome},
    probe::Probe,
    unwind::{UnwindAction, UnwindPayload, UnwindSignal, merge_into},
    value::GuestValue,
};

/// 节点承载的观察者。
pub(crate) enum NodeSlot {
    /// 所有探针共享的无状态监听器。
    Listener(Arc<dyn ExecutionListener>),
    /// 本探针独享的处理器，接收 `on_dispose`。
    Handler(Arc<dyn ExecutionHandler>),
}

impl NodeSlot {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            NodeSlot::Listener(_) => "listener",
            NodeSlot::Handler(_) => "handler",
        }
    }

    fn on_enter(&self, ctx: &EventContext<'_>) -> HookResult {
        match self {
            NodeSlot::Listener(listener) => listener.on_enter(ctx),
            NodeSlot::Handler(handler) => handler.on_enter(ctx),
        }
    }

    fn on_return_value(&self, ctx: &EventContext<'_>, result: &GuestValue) -> HookResult {
        match self {
            NodeSlot::Listener(listener) => listener.on_return_value(ctx, result),
            NodeSlot::Handler(handler) => handler.on_return_value(ctx, result),
        }
    }

    fn on_return_exceptional(&self, ctx: &EventContext<'_>, fault: &ExecutionFault) -> HookResult {
        match self {
            NodeSlot::Listener(listener) => listener.on_return_exceptional(ctx, fault),
            NodeSlot::Handler(handler) => handler.on_return_exceptional(ctx, fault),
        }
    }

    fn on_unwind(
        &self,
        ctx: &EventContext<'_>,
        payload: &UnwindPayload,
    ) -> Result<UnwindOutcome, HookError> {
        match self {
            NodeSlot::Listener(listener) => listener.on_unwind(ctx, payload),
            NodeSlot::Handler(handler) => handler.on_unwind(ctx, payload),
        }
    }
}

/// 单次钩子调用经容错处理后的结果。
enum Step<T> {
    /// 钩子正常完成。
    Done(T),
    /// 钩子发起了 unwind。
    Unwind(UnwindSignal),
    /// 不可信绑定失败，已上报。
    Contained,
}

/// 链路中的一个节点。
pub(crate) struct ChainNode {
    binding: Arc<Binding>,
    slot: NodeSlot,
    next: Option<Box<ChainNode>>,
    seen: SeenFlags,
}

impl ChainNode {
    /// 按给定顺序为绑定组链。
    ///
    /// # 逻辑（How）
    /// - 已释放的绑定被跳过；工厂绑定在此处为当前探针创建处理器；
    /// - 不可信工厂失败时上报并省略该节点；可信工厂失败时，已创建的处理器随错误一并交还，
    ///   由调用方在释放重建锁之后再释放它们。
    pub(crate) fn build(
        probe: &Probe,
        bindings: Vec<Arc<Binding>>,
    ) -> Result<Option<Box<ChainNode>>, BuildFailure> {
        let mut slots: Vec<(Arc<Binding>, NodeSlot)> = Vec::with_capacity(bindings.len());
        for binding in bindings {
            if binding.is_disposed() {
                continue;
            }
            let slot = match binding.element() {
                BindingElement::Listener(listener) => NodeSlot::Listener(Arc::clone(listener)),
                BindingElement::Factory(factory) => {
                    let factory = Arc::clone(factory);
                    let created = invoke(probe, &binding, operation::HANDLER_FACTORY_CREATE, |ctx| {
                        factory.create(ctx)
                    });
                    match created {
                        Ok(Step::Done(handler)) => NodeSlot::Handler(handler),
                        Ok(Step::Contained) => continue,
                        Ok(Step::Unwind(signal)) => {
                            let stray =
                                stray_unwind(probe, &binding, operation::HANDLER_FACTORY_CREATE, signal);
                            if let Err(fault) = stray {
                                return Err(BuildFailure::new(fault, slots));
                            }
                            continue;
                        }
                        Err(fault) => return Err(BuildFailure::new(fault, slots)),
                    }
                }
            };
            slots.push((binding, slot));
        }
        Ok(link(slots))
    }

    pub(crate) fn binding(&self) -> &Arc<Binding> {
        &self.binding
    }

    pub(crate) fn slot(&self) -> &NodeSlot {
        &self.slot
    }

    /// 从本节点开始按链路顺序遍历。
    pub(crate) fn iter(&self) -> Nodes<'_> {
        Nodes { cursor: Some(self) }
    }

    /// 进入事件：头 → 尾。
    pub(crate) fn on_enter(&self, probe: &Probe) -> Result<Option<UnwindSignal>, ExecutionFault> {
        let mut collected = None;
        for node in self.iter() {
            let step = invoke(probe, &node.binding, operation::ON_ENTER, |ctx| {
                node.slot.on_enter(ctx)
            })?;
            if let Step::Unwind(signal) = step {
                merge_into(&mut collected, signal);
            }
        }
        Ok(collected)
    }

    /// 正常返回事件：尾 → 头。
    pub(crate) fn on_return_value(
        &self,
        probe: &Probe,
        result: &GuestValue,
    ) -> Result<Option<UnwindSignal>, ExecutionFault> {
        let mut collected = match &self.next {
            Some(next) => next.on_return_value(probe, result)?,
            None => None,
        };
        let step = invoke(probe, &self.binding, operation::ON_RETURN_VALUE, |ctx| {
            self.slot.on_return_value(ctx, result)
        })?;
        if let Step::Unwind(signal) = step {
            merge_into(&mut collected, signal);
        }
        Ok(collected)
    }

    /// 异常返回事件：尾 → 头。返回值只包含本轮新发起的 unwind。
    pub(crate) fn on_return_exceptional(
        &self,
        probe: &Probe,
        fault: &ExecutionFault,
    ) -> Result<Option<UnwindSignal>, ExecutionFault> {
        let mut collected = match &self.next {
            Some(next) => next.on_return_exceptional(probe, fault)?,
            None => None,
        };
        if self.seen.mark(SeenFlags::EXCEPTION) {
            first_seen(probe, &self.binding, SeenFlags::EXCEPTION);
        }
        let step = invoke(probe, &self.binding, operation::ON_RETURN_EXCEPTIONAL, |ctx| {
            self.slot.on_return_exceptional(ctx, fault)
        })?;
        if let Step::Unwind(signal) = step {
            merge_into(&mut collected, signal);
        }
        Ok(collected)
    }

    /// unwind 派发：本地裁决先于后继计算，再按优先级合并。
    pub(crate) fn on_unwind(
        &self,
        probe: &Probe,
        signal: &mut UnwindSignal,
    ) -> Result<UnwindAction, ExecutionFault> {
        let local = self.local_unwind(probe, signal)?;
        let rest = match &self.next {
            Some(next) => next.on_unwind(probe, signal)?,
            None => UnwindAction::Ignored,
        };
        Ok(UnwindAction::merge(local, rest))
    }

    fn local_unwind(
        &self,
        probe: &Probe,
        signal: &mut UnwindSignal,
    ) -> Result<UnwindAction, ExecutionFault> {
        let id = self.binding.id();
        let Some(payload) = signal.pending_payload(id) else {
            return Ok(UnwindAction::Ignored);
        };
        if self.seen.mark(SeenFlags::UNWIND) {
            first_seen(probe, &self.binding, SeenFlags::UNWIND);
        }

        let step = invoke(probe, &self.binding, operation::ON_UNWIND, |ctx| {
            self.slot.on_unwind(ctx, payload)
        })?;
        let outcome = match step {
            Step::Done(outcome) => outcome,
            Step::Contained => UnwindOutcome::NoOpinion,
            Step::Unwind(nested) => {
                stray_unwind(probe, &self.binding, operation::ON_UNWIND, nested)?;
                UnwindOutcome::NoOpinion
            }
        };

        let outcome = match outcome {
            UnwindOutcome::Return(value)
                if probe.services().settings().validate_unwind_values && !value.is_interop() =>
            {
                self.type_violation(probe, &value)?;
                UnwindOutcome::NoOpinion
            }
            outcome => outcome,
        };

        Ok(match outcome {
            UnwindOutcome::NoOpinion => UnwindAction::Rethrow,
            UnwindOutcome::Reenter => {
                signal.reset_for(id);
                UnwindAction::Reenter
            }
            UnwindOutcome::Return(value) => {
                signal.reset_for(id);
                UnwindAction::Return(value)
            }
        })
    }

    fn type_violation(&self, probe: &Probe, value: &GuestValue) -> Result<(), ExecutionFault> {
        let error = ObserverError::new(
            codes::UNWIND_TYPE_VIOLATION,
            format!(
                "unwind handler returned non-interop value of kind `{}`",
                value.kind()
            ),
        );
        if self.binding.is_trusted() {
            return Err(ExecutionFault::Observer(ObserverFault::new(
                self.binding.id(),
                operation::ON_UNWIND,
                error,
            )));
        }
        probe
            .services()
            .reporter()
            .report(&self.binding, operation::ON_UNWIND, &error);
        Ok(())
    }

    /// 释放整条链路：头 → 尾，始终走完全部节点，返回首个可信失败。
    pub(crate) fn dispose_all(&self, probe: &Probe) -> Result<(), ExecutionFault> {
        let mut first_failure = None;
        for node in self.iter() {
            let NodeSlot::Handler(handler) = &node.slot else {
                continue;
            };
            let outcome = invoke(probe, &node.binding, operation::ON_DISPOSE, |ctx| {
                handler.on_dispose(ctx)
            })
            .and_then(|step| match step {
                Step::Unwind(signal) => {
                    stray_unwind(probe, &node.binding, operation::ON_DISPOSE, signal)
                }
                Step::Done(()) | Step::Contained => Ok(()),
            });
            if let Err(fault) = outcome {
                if fault.is_fatal() {
                    return Err(fault);
                }
                if first_failure.is_none() {
                    first_failure = Some(fault);
                }
            }
        }
        first_failure.map_or(Ok(()), Err)
    }
}

/// 链路迭代器。
pub(crate) struct Nodes<'a> {
    cursor: Option<&'a ChainNode>,
}

impl<'a> Iterator for Nodes<'a> {
    type Item = &'a ChainNode;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.cursor?;
        self.cursor = current.next.as_deref();
        Some(current)
    }
}

/// 从尾部开始逆序链接，得到与输入顺序一致的链表。
fn link(slots: Vec<(Arc<Binding>, NodeSlot)>) -> Option<Box<ChainNode>> {
    slots.into_iter().rev().fold(None, |next, (binding, slot)| {
        Some(Box::new(ChainNode {
            binding,
            slot,
            next,
            seen: SeenFlags::new(),
        }))
    })
}

/// 可信失败中止的重建：失败本身，以及失败前已经创建、从未发布的处理器。
pub(crate) struct BuildFailure {
    fault: ExecutionFault,
    partial: Option<Box<ChainNode>>,
}

impl BuildFailure {
    fn new(fault: ExecutionFault, slots: Vec<(Arc<Binding>, NodeSlot)>) -> Self {
        Self {
            fault,
            partial: link(slots),
        }
    }

    /// 释放未发布的处理器并交还失败。
    ///
    /// 必须在重建锁释放之后调用：`on_dispose` 可能再次进入同一探针。
    pub(crate) fn discard(self, probe: &Probe) -> ExecutionFault {
        let BuildFailure { fault, partial } = self;
        if let Some(partial) = partial {
            if let Err(error) = partial.dispose_all(probe) {
                tracing::debug!(
                    probe.id = %probe.id(),
                    error = %error,
                    "discarding partially built chain failed"
                );
            }
        }
        fault
    }
}

/// 对单个绑定调用一次钩子，并套用容错策略。
///
/// # 契约（What）
/// - 致命信号无条件转为 `Err(ExecutionFault::Fatal)`；
/// - 可信绑定的失败转为 `Err`，调用方据此中止遍历；
/// - 不可信绑定的失败（含 panic，若配置允许捕获）上报后返回 [`Step::Contained`]；
/// - unwind 原样交还调用方，由其决定合并还是视为越界请求。
fn invoke<T>(
    probe: &Probe,
    binding: &Arc<Binding>,
    operation: &'static str,
    hook: impl FnOnce(&EventContext<'_>) -> Result<T, HookError>,
) -> Result<Step<T>, ExecutionFault> {
    let ctx = EventContext::new(probe, binding);
    let trusted = binding.is_trusted();
    let result = if !trusted && probe.services().settings().catch_observer_panics {
        match catch_unwind(AssertUnwindSafe(|| hook(&ctx))) {
            Ok(result) => result,
            Err(payload) => {
                let error = ObserverError::from_panic(payload);
                probe.services().reporter().report(binding, operation, &error);
                return Ok(Step::Contained);
            }
        }
    } else {
        hook(&ctx)
    };

    match result {
        Ok(value) => Ok(Step::Done(value)),
        Err(HookError::Unwind(signal)) => Ok(Step::Unwind(signal)),
        Err(HookError::Fatal(signal)) => Err(ExecutionFault::Fatal(signal)),
        Err(error) if trusted => Err(error.into_trusted_fault(binding.id(), operation)),
        Err(error) => {
            let error = error.into_contained();
            probe.services().reporter().report(binding, operation, &error);
            Ok(Step::Contained)
        }
    }
}

/// 在无法派发 unwind 的位置（工厂、unwind 处理器、释放）出现的 unwind。
fn stray_unwind(
    probe: &Probe,
    binding: &Arc<Binding>,
    operation: &'static str,
    signal: UnwindSignal,
) -> Result<(), ExecutionFault> {
    let error = HookError::Unwind(signal);
    if binding.is_trusted() {
        return Err(error.into_trusted_fault(binding.id(), operation));
    }
    let error = error.into_contained();
    probe.services().reporter().report(binding, operation, &error);
    Ok(())
}

fn first_seen(probe: &Probe, binding: &Binding, flag: u8) {
    tracing::trace!(
        probe.id = %probe.id(),
        binding.id = %binding.id(),
        path = SeenFlags::name(flag),
        "first observation of rare dispatch path"
    );
}

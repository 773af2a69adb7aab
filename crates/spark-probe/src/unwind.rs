//! unwind 协议的数据载体与合并规则。
//!
//! # 设计背景（Why）
//! - 观察者可以请求中止或重定向正在执行的插桩点（提前返回、重新执行、注入异常）。同一次遍历中
//!   可能有多个观察者各自发起请求，任何一个都不能丢失；
//! - 以显式的标签化结果 [`UnwindAction`] 贯穿派发流程，而非依赖宿主原生异常机制，
//!   从而让合并语义确定、可单独测试。
//!
//! # 逻辑解析（How）
//! - [`UnwindSignal`] 是一条单链表：首个请求为表头，后续请求通过 [`UnwindSignal::chain`] 追加到表尾；
//! - 派发阶段每个节点只处理归属于自己绑定、且尚未复位的条目，给出裁决后将该条目复位；
//! - 节点裁决与后继裁决通过 [`UnwindAction::merge`] 合并，优先级为
//!   `Rethrow` > `Ignored` 让位 > `Reenter` > 先计算者的返回值。
//!
//! # 契约说明（What）
//! - 信号的归属绑定在构造后不可变，构造入口仅有 `EventContext::create_unwind`；
//! - 信号只在一次执行内流转，不跨执行共享，因此复位标记无需同步。

use std::{any::Any, fmt};

use crate::{binding::BindingId, value::GuestValue};

/// unwind 请求附带的不透明负载，只有发起绑定的观察者会在派发时拿到它。
pub struct UnwindPayload(Box<dyn Any + Send + Sync>);

impl UnwindPayload {
    /// 包装任意负载。
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Box::new(value))
    }

    /// 按具体类型借用负载。
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// 负载是否为给定类型。
    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }
}

impl fmt::Debug for UnwindPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UnwindPayload(..)")
    }
}

/// 一个或多个合并后的 unwind 请求。
///
/// # 教案式说明
/// - **意图（Why）**：在第一个请求仍在传播时，另一个观察者也可能发起自己的请求；链表结构保证
///   二者都能抵达各自的 unwind 处理器。
/// - **逻辑（How）**：`chained` 形成单链表；成员查询、负载查找与复位都沿链表递归，
///   深度受并发发起的请求数约束，而与探针链长度无关。
/// - **契约（What）**：`origin` 构造后不可变；`chain` 只追加、从不丢弃任何一方。
pub struct UnwindSignal {
    origin: BindingId,
    payload: UnwindPayload,
    reset: bool,
    chained: Option<Box<UnwindSignal>>,
}

impl UnwindSignal {
    pub(crate) fn new(origin: BindingId, payload: UnwindPayload) -> Self {
        Self {
            origin,
            payload,
            reset: false,
            chained: None,
        }
    }

    /// 表头请求的发起绑定。
    pub fn origin(&self) -> BindingId {
        self.origin
    }

    /// 表头请求是否已被其所有者处理。
    pub fn is_reset(&self) -> bool {
        self.reset
    }

    /// 后继请求。
    pub fn next(&self) -> Option<&UnwindSignal> {
        self.chained.as_deref()
    }

    /// 按发起顺序遍历全部请求。
    pub fn iter(&self) -> Iter<'_> {
        Iter { cursor: Some(self) }
    }

    /// 合并后的请求数量。
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// 链表至少包含表头，恒为非空。
    pub fn is_empty(&self) -> bool {
        false
    }

    /// 是否存在由给定绑定发起的请求（无论是否已复位）。
    pub fn contains_binding(&self, binding: BindingId) -> bool {
        self.iter().any(|entry| entry.origin == binding)
    }

    /// 所有发起绑定，按链表顺序。
    pub fn origins(&self) -> Vec<BindingId> {
        self.iter().map(UnwindSignal::origin).collect()
    }

    /// 将另一个请求（及其后继）追加到表尾。
    pub fn chain(&mut self, other: UnwindSignal) {
        match self.chained.as_deref_mut() {
            Some(next) => next.chain(other),
            None => self.chained = Some(Box::new(other)),
        }
    }

    /// 给定绑定尚未处理的首个请求的负载。
    pub(crate) fn pending_payload(&self, binding: BindingId) -> Option<&UnwindPayload> {
        self.iter()
            .find(|entry| entry.origin == binding && !entry.reset)
            .map(|entry| &entry.payload)
    }

    /// 复位给定绑定尚未处理的首个请求，返回是否命中。
    pub(crate) fn reset_for(&mut self, binding: BindingId) -> bool {
        if self.origin == binding && !self.reset {
            self.reset = true;
            return true;
        }
        match self.chained.as_deref_mut() {
            Some(next) => next.reset_for(binding),
            None => false,
        }
    }
}

/// 将可选的已收集信号与新信号合并。
pub(crate) fn merge_into(collected: &mut Option<UnwindSignal>, incoming: UnwindSignal) {
    match collected {
        Some(signal) => signal.chain(incoming),
        None => *collected = Some(incoming),
    }
}

impl fmt::Debug for UnwindSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnwindSignal")
            .field("origin", &self.origin)
            .field("reset", &self.reset)
            .field("chained", &self.chained)
            .finish()
    }
}

/// [`UnwindSignal::iter`] 的迭代器。
pub struct Iter<'a> {
    cursor: Option<&'a UnwindSignal>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a UnwindSignal;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.cursor?;
        self.cursor = current.chained.as_deref();
        Some(current)
    }
}

/// unwind 派发过程中每个节点（及合并后整条链）的裁决。
#[derive(Clone, Debug, PartialEq)]
pub enum UnwindAction {
    /// 原始故障原样传播。
    Rethrow,
    /// 重新执行插桩点。
    Reenter,
    /// 以给定值完成插桩点。
    Return(GuestValue),
    /// 节点与本次 unwind 无关。
    Ignored,
}

impl UnwindAction {
    /// 合并两侧裁决，`first` 为先计算的一侧（当前节点），`second` 为后继。
    ///
    /// # 规则（What）
    /// 1. 任一侧 `Rethrow` → `Rethrow`，压过其余一切；
    /// 2. 一侧 `Ignored` → 取另一侧；
    /// 3. 任一侧 `Reenter` → `Reenter`；
    /// 4. 双方都给出返回值 → 先计算的一侧胜出。
    pub fn merge(first: Self, second: Self) -> Self {
        match (first, second) {
            (UnwindAction::Rethrow, _) | (_, UnwindAction::Rethrow) => UnwindAction::Rethrow,
            (UnwindAction::Ignored, other) | (other, UnwindAction::Ignored) => other,
            (UnwindAction::Reenter, _) | (_, UnwindAction::Reenter) => UnwindAction::Reenter,
            (first @ UnwindAction::Return(_), UnwindAction::Return(_)) => first,
        }
    }
}

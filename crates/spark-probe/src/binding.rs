//! 观察者注册（Binding）。
//!
//! # 设计背景（Why）
//! - 探针链节点需要一个稳定的身份来归属 unwind 请求、上报失败、定位每探针处理器；
//! - 注册本身由外部注册表管理，探针只读取其快照，因此 `Binding` 在构造后除“已释放”标记外不可变。
//!
//! # 契约说明（What）
//! - [`BindingId`] 在进程内唯一，比较与拷贝均为常数时间；
//! - [`Binding::dispose`] 幂等，释放后的绑定不会再进入任何重建出的链路。

use std::{
    borrow::Cow,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use crate::observer::{ExecutionHandlerFactory, ExecutionListener};

static NEXT_BINDING_ID: AtomicU64 = AtomicU64::new(1);

/// 绑定的进程内唯一标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BindingId(u64);

impl BindingId {
    fn next() -> Self {
        Self(NEXT_BINDING_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// 内部编码，供日志与调试工具使用。
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "binding#{}", self.0)
    }
}

/// 绑定的信任级别。
///
/// - `Trusted`：语言实现内部的观察者，失败直接逃逸，可改变访客语义；
/// - `Untrusted`：外部工具，失败一律被拦截并上报。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BindingTrust {
    Trusted,
    #[default]
    Untrusted,
}

/// 绑定承载的观察者元素。
#[derive(Clone)]
pub enum BindingElement {
    /// 无状态监听器，所有探针共享同一实例。
    Listener(Arc<dyn ExecutionListener>),
    /// 每探针处理器工厂，重建链路时为每个探针创建独立实例。
    Factory(Arc<dyn ExecutionHandlerFactory>),
}

impl BindingElement {
    /// 元素种类名称。
    pub fn kind(&self) -> &'static str {
        match self {
            BindingElement::Listener(_) => "listener",
            BindingElement::Factory(_) => "factory",
        }
    }
}

/// 一个观察者的注册记录。
///
/// # 教案式说明
/// - **意图（Why）**：把“谁在观察、以什么顺序、可信与否、是否已注销”聚合在一处，
///   让探针链只需持有 `Arc<Binding>` 即可完成派发、归属与上报。
/// - **逻辑（How）**：通过 [`Binding::listener`] / [`Binding::factory`] 构造，
///   再以 `with_priority`、`trusted` 等方法补充属性，最后 `into_shared` 交给注册表。
/// - **契约（What）**：`priority` 仅作为注册表排序依据，探针本身按构建器给出的顺序组链；
///   `dispose` 之后 `is_disposed` 恒为 `true`。
pub struct Binding {
    id: BindingId,
    label: Cow<'static, str>,
    priority: i32,
    trust: BindingTrust,
    element: BindingElement,
    disposed: AtomicBool,
}

impl Binding {
    fn new(label: impl Into<Cow<'static, str>>, element: BindingElement) -> Self {
        Self {
            id: BindingId::next(),
            label: label.into(),
            priority: 0,
            trust: BindingTrust::Untrusted,
            element,
            disposed: AtomicBool::new(false),
        }
    }

    /// 以无状态监听器构造绑定。
    pub fn listener(
        label: impl Into<Cow<'static, str>>,
        listener: Arc<dyn ExecutionListener>,
    ) -> Self {
        Self::new(label, BindingElement::Listener(listener))
    }

    /// 以每探针处理器工厂构造绑定。
    pub fn factory(
        label: impl Into<Cow<'static, str>>,
        factory: Arc<dyn ExecutionHandlerFactory>,
    ) -> Self {
        Self::new(label, BindingElement::Factory(factory))
    }

    /// 设置排序优先级，数值越小越靠近链头。
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// 标记为可信（语言内部）绑定。
    pub fn trusted(mut self) -> Self {
        self.trust = BindingTrust::Trusted;
        self
    }

    /// 显式设置信任级别。
    pub fn with_trust(mut self, trust: BindingTrust) -> Self {
        self.trust = trust;
        self
    }

    /// 转为共享句柄。
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn id(&self) -> BindingId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn trust(&self) -> BindingTrust {
        self.trust
    }

    /// 是否为可信绑定。
    pub fn is_trusted(&self) -> bool {
        self.trust == BindingTrust::Trusted
    }

    pub fn element(&self) -> &BindingElement {
        &self.element
    }

    /// 注销绑定，返回本次调用是否完成了首次注销。
    ///
    /// 注销只翻转标记；让相关探针失效并重建是注册表的职责。
    pub fn dispose(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("priority", &self.priority)
            .field("trust", &self.trust)
            .field("element", &self.element.kind())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

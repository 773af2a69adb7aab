//! 插桩探针：链路缓存、生命周期派发与 unwind 协调。
//!
//! # 设计背景（Why）
//! - **零开销快路径**：没有观察者的探针只需一次快照读取与一次原子布尔判断即可返回，
//!   不加锁、不分配；有观察者时也只在链路失效后才进入慢路径；
//! - **热更新安全**：绑定随时可能被注册或注销，探针通过“失效令牌 + 惰性重建”吸收变化，
//!   旧链路在新链路发布后、锁外逐一释放，派发线程永远看到一致的链路快照；
//! - **统一协调**：执行体抛出的访客异常与观察者发起的 unwind 走同一条协调路径，
//!   由 [`Probe::on_return_exceptional_or_unwind`] 给出最终裁决。
//!
//! # 逻辑解析（How）
//! - `ensure_chain`：快路径读取快照，令牌有效即返回；否则获取重建锁、复查令牌、
//!   向 [`ChainBuilder`](crate::ChainBuilder) 索取绑定、组链并一次性发布 `{令牌, 链路}`；
//! - 重建开始前记录失效计数，发布后复查；若期间有新的失效请求，立即失效刚发布的令牌，
//!   保证并发的 `invalidate` 不会丢失；
//! - 生命周期方法把链路遍历中收集到的 unwind 包装为 [`ExecutionFault::Unwind`] 交还宿主，
//!   宿主再把它连同其他故障一起交给协调器。
//!
//! # 契约说明（What）
//! - 同一探针可被多个执行并发进入；重建互斥，派发无锁；
//! - 每个节点恰好释放一次，释放发生在替换它的快照发布之后、重建锁释放之后；
//! - 空重建发布 `chain = None` 的有效快照，并恰好调用一次 `detach_probe`。
//!
//! # 风险与考量（Trade-offs）
//! - 旧链路释放时可能仍有并发执行在其上派发，处理器需容忍释放后的零星回调；
//! - `Reenter` 会无条件重新执行插桩点，是否终止由观察者自行保证。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    binding::{Binding, BindingId},
    chain::{ChainNode, NodeSlot},
    context::SourceLocation,
    error::ExecutionFault,
    internal::{ChainCell, ChainState, SeenFlags},
    observer::ExecutionHandler,
    services::ProbeServices,
    unwind::{UnwindAction, UnwindSignal},
    value::GuestValue,
};

static NEXT_PROBE_ID: AtomicU64 = AtomicU64::new(1);

/// 探针的进程内唯一标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProbeId(u64);

impl ProbeId {
    fn next() -> Self {
        Self(NEXT_PROBE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "probe#{}", self.0)
    }
}

/// 协调器对一次故障执行给出的最终裁决。
#[derive(Debug)]
pub enum Resolution {
    /// 重新执行插桩点。
    Reenter,
    /// 以给定值完成插桩点。
    Return(GuestValue),
    /// 故障继续向外传播。
    Propagate(ExecutionFault),
}

/// 当前发布链路中的一个条目，供调试与测试观察链路结构。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainEntry {
    pub binding: BindingId,
    pub label: String,
    /// `"listener"` 或 `"handler"`。
    pub kind: &'static str,
    pub trusted: bool,
}

/// 插桩探针。
///
/// # 教案式说明
/// - **意图（Why）**：作为宿主插桩点与观察者之间的唯一协调者，负责链路缓存、派发顺序、
///   容错与 unwind 协议。
/// - **逻辑（How）**：链路快照存放于 `ArcSwap`，重建由 `parking_lot::Mutex` 串行化；
///   生命周期方法在快照上无锁遍历。
/// - **契约（What）**：宿主按“`on_enter` → 执行体 → `on_return_value`”的顺序调用，
///   任何故障交给 [`Probe::on_return_exceptional_or_unwind`]；或者直接使用 [`Probe::execute`]。
pub struct Probe {
    id: ProbeId,
    location: SourceLocation,
    services: ProbeServices,
    cell: ChainCell,
    rebuild: Mutex<()>,
    invalidations: AtomicU64,
    seen: SeenFlags,
}

impl Probe {
    /// 构造尚未构建链路的探针，首次派发时按需重建。
    pub fn new(location: SourceLocation, services: ProbeServices) -> Self {
        Self {
            id: ProbeId::next(),
            location,
            services,
            cell: ChainCell::new(),
            rebuild: Mutex::new(()),
            invalidations: AtomicU64::new(0),
            seen: SeenFlags::new(),
        }
    }

    pub fn id(&self) -> ProbeId {
        self.id
    }

    pub fn location(&self) -> &SourceLocation {
        &self.location
    }

    pub fn services(&self) -> &ProbeServices {
        &self.services
    }

    /// 已发布的重建次数。
    pub fn epoch(&self) -> u64 {
        self.cell.epoch()
    }

    /// 当前有效快照是否带有链路；失效状态下返回 `false`。
    pub fn is_attached(&self) -> bool {
        let state = self.cell.load();
        state.token.is_valid() && state.chain.is_some()
    }

    /// 失效当前链路，下一次派发将触发重建。
    ///
    /// 注册表在绑定集合变化后调用；与进行中的重建并发调用也不会丢失。
    pub fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        if self.cell.load().token.invalidate() {
            tracing::trace!(probe.id = %self.id, "chain invalidated");
        }
    }

    /// 确保链路有效并返回当前快照；无观察者时返回 `None`。
    fn ensure_chain(&self) -> Result<Option<Arc<ChainState>>, ExecutionFault> {
        {
            let state = self.cell.load();
            if state.token.is_valid() {
                return Ok(if state.chain.is_some() {
                    Some(Arc::clone(&state))
                } else {
                    None
                });
            }
        }
        self.rebuild_chain()
    }

    /// 慢路径：在重建锁内组链并发布，锁外释放旧链与通知宿主。
    fn rebuild_chain(&self) -> Result<Option<Arc<ChainState>>, ExecutionFault> {
        let guard = self.rebuild.lock();
        let current = self.cell.load_full();
        if current.token.is_valid() {
            drop(guard);
            return Ok(if current.chain.is_some() {
                Some(current)
            } else {
                None
            });
        }

        let observed = self.invalidations.load(Ordering::SeqCst);
        let bindings = self.services.builder().active_bindings(self);
        let chain = match ChainNode::build(self, bindings) {
            Ok(chain) => chain,
            Err(failure) => {
                drop(guard);
                return Err(failure.discard(self));
            }
        };
        let detached = chain.is_none();
        let epoch = self.cell.bump_epoch();
        let next = Arc::new(ChainState::published(chain, epoch));
        let previous = self.cell.swap(Arc::clone(&next));
        if self.invalidations.load(Ordering::SeqCst) != observed {
            next.token.invalidate();
        }
        drop(guard);

        let nodes = next.head().map_or(0, |head| head.iter().count());
        tracing::debug!(probe.id = %self.id, probe.epoch = next.epoch, nodes, "probe.chain.rebuilt");

        let disposed = match previous.head() {
            Some(head) => head.dispose_all(self),
            None => Ok(()),
        };

        if detached {
            tracing::debug!(probe.id = %self.id, probe.epoch = epoch, "probe.detached");
            self.services.host().detach_probe(self);
        }

        disposed?;
        Ok(if detached { None } else { Some(next) })
    }

    /// 进入插桩点。
    ///
    /// 观察者发起的 unwind 以 `Err(ExecutionFault::Unwind)` 返回，宿主应跳过执行体，
    /// 直接把它交给协调器（`return_called = false`）。
    pub fn on_enter(&self) -> Result<(), ExecutionFault> {
        let Some(state) = self.ensure_chain()? else {
            return Ok(());
        };
        match state.head() {
            Some(head) => into_result(head.on_enter(self)?),
            None => Ok(()),
        }
    }

    /// 插桩点正常返回。
    ///
    /// 观察者发起的 unwind 以 `Err(ExecutionFault::Unwind)` 返回，宿主应把它交给协调器
    /// （`return_called = true`）。
    pub fn on_return_value(&self, result: &GuestValue) -> Result<(), ExecutionFault> {
        let Some(state) = self.ensure_chain()? else {
            return Ok(());
        };
        match state.head() {
            Some(head) => into_result(head.on_return_value(self, result)?),
            None => Ok(()),
        }
    }

    /// 插桩点以故障结束，仅派发通知，不解析 unwind。
    ///
    /// 需要完整协调语义的宿主应调用 [`Probe::on_return_exceptional_or_unwind`]。
    pub fn on_return_exceptional(&self, fault: &ExecutionFault) -> Result<(), ExecutionFault> {
        if fault.is_fatal() {
            return Ok(());
        }
        let Some(state) = self.ensure_chain()? else {
            return Ok(());
        };
        match state.head() {
            Some(head) => into_result(head.on_return_exceptional(self, fault)?),
            None => Ok(()),
        }
    }

    /// 协调一次故障执行。
    ///
    /// # 逻辑（How）
    /// 1. 致命信号原样传播；
    /// 2. `return_called` 为假时派发 `on_return_exceptional`，其中新发起的 unwind 追加在传入的 unwind 之后；
    /// 3. 没有 unwind 参与时原始故障继续传播；
    /// 4. 否则派发 `on_unwind`：`Reenter` → 重新执行，`Return(v)` → 以 `v` 完成，
    ///    `Rethrow`/`Ignored` → 传播合并后的 unwind，留给外层探针解析。
    pub fn on_return_exceptional_or_unwind(
        &self,
        fault: ExecutionFault,
        return_called: bool,
    ) -> Resolution {
        if fault.is_fatal() {
            return Resolution::Propagate(fault);
        }
        let state = match self.ensure_chain() {
            Ok(Some(state)) => state,
            Ok(None) => return Resolution::Propagate(fault),
            Err(error) => return Resolution::Propagate(error),
        };
        let Some(head) = state.head() else {
            return Resolution::Propagate(fault);
        };

        let mut fault = fault;
        if !return_called {
            match head.on_return_exceptional(self, &fault) {
                Ok(None) => {}
                Ok(Some(raised)) => {
                    fault = match fault {
                        ExecutionFault::Unwind(mut incoming) => {
                            incoming.chain(raised);
                            ExecutionFault::Unwind(incoming)
                        }
                        _ => ExecutionFault::Unwind(raised),
                    };
                }
                Err(error) => return Resolution::Propagate(error),
            }
        }

        let mut signal = match fault {
            ExecutionFault::Unwind(signal) => signal,
            other => return Resolution::Propagate(other),
        };
        self.mark_seen(SeenFlags::UNWIND);

        match head.on_unwind(self, &mut signal) {
            Err(error) => Resolution::Propagate(error),
            Ok(UnwindAction::Reenter) => {
                self.mark_seen(SeenFlags::REENTER);
                Resolution::Reenter
            }
            Ok(UnwindAction::Return(value)) => {
                self.mark_seen(SeenFlags::RETURNED);
                Resolution::Return(value)
            }
            Ok(UnwindAction::Rethrow | UnwindAction::Ignored) => {
                Resolution::Propagate(ExecutionFault::Unwind(signal))
            }
        }
    }

    /// 以标准插桩循环执行 `body`。
    ///
    /// ```
    /// use std::sync::Arc;
    /// use spark_probe::{GuestValue, Probe, ProbeServices, SourceLocation};
    /// use spark_probe::test_stubs::{RecordingHost, StaticChainBuilder};
    ///
    /// let services = ProbeServices::new(
    ///     Arc::new(StaticChainBuilder::default()),
    ///     Arc::new(RecordingHost::default()),
    /// );
    /// let probe = Probe::new(SourceLocation::new("demo.gs", 1, 1), services);
    /// let value = probe.execute(|| Ok(GuestValue::Int(7)))?;
    /// assert_eq!(value, GuestValue::Int(7));
    /// # Ok::<(), spark_probe::ExecutionFault>(())
    /// ```
    pub fn execute<F>(&self, mut body: F) -> Result<GuestValue, ExecutionFault>
    where
        F: FnMut() -> Result<GuestValue, ExecutionFault>,
    {
        loop {
            let (fault, return_called) = match self.run_once(&mut body) {
                Ok(value) => return Ok(value),
                Err(interrupted) => interrupted,
            };
            match self.on_return_exceptional_or_unwind(fault, return_called) {
                Resolution::Reenter => continue,
                Resolution::Return(value) => return Ok(value),
                Resolution::Propagate(fault) => return Err(fault),
            }
        }
    }

    fn run_once<F>(&self, body: &mut F) -> Result<GuestValue, (ExecutionFault, bool)>
    where
        F: FnMut() -> Result<GuestValue, ExecutionFault>,
    {
        self.on_enter().map_err(|fault| (fault, false))?;
        let value = body().map_err(|fault| (fault, false))?;
        self.on_return_value(&value).map_err(|fault| (fault, true))?;
        Ok(value)
    }

    /// 当前有效链路中为给定绑定创建的处理器。
    ///
    /// 链路失效、绑定已释放、绑定不在链路中或绑定为监听器时返回 `None`。
    pub fn lookup_handler(&self, binding: BindingId) -> Option<Arc<dyn ExecutionHandler>> {
        let state = self.cell.load();
        if !state.token.is_valid() {
            return None;
        }
        state
            .head()?
            .iter()
            .filter(|node| node.binding().id() == binding && !node.binding().is_disposed())
            .find_map(|node| match node.slot() {
                NodeSlot::Handler(handler) => Some(Arc::clone(handler)),
                NodeSlot::Listener(_) => None,
            })
    }

    /// 当前发布链路的有序结构。
    pub fn chain_snapshot(&self) -> Vec<ChainEntry> {
        self.cell
            .load()
            .head()
            .map(|head| head.iter().map(entry_of).collect())
            .unwrap_or_default()
    }

    fn mark_seen(&self, flag: u8) {
        if self.seen.mark(flag) {
            tracing::trace!(
                probe.id = %self.id,
                path = SeenFlags::name(flag),
                "first observation of rare probe path"
            );
        }
    }
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("epoch", &self.epoch())
            .field("attached", &self.is_attached())
            .finish()
    }
}

fn into_result(raised: Option<UnwindSignal>) -> Result<(), ExecutionFault> {
    match raised {
        Some(signal) => Err(ExecutionFault::Unwind(signal)),
        None => Ok(()),
    }
}

fn entry_of(node: &ChainNode) -> ChainEntry {
    let binding: &Binding = node.binding();
    ChainEntry {
        binding: binding.id(),
        label: binding.label().to_owned(),
        kind: node.slot().kind(),
        trusted: binding.is_trusted(),
    }
}

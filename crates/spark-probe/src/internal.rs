//! 探针内部的快照存储与标记位。
//!
//! # 设计背景（Why）
//! - **无锁快路径**：绝大多数执行只需确认“链路仍然有效”并读取链头，必须避免任何锁；
//!   因此将版本令牌与链路打包为一个不可变快照，通过 [`ArcSwap`] 一次性发布。
//! - **Epoch 逻辑时钟**：每次发布都自增 epoch，测试与调试工具据此判断重建是否发生、发生了几次。
//!
//! # 逻辑解析（How）
//! - [`ChainCell`]：`load` 返回当前快照守卫，`swap` 原子替换并交还旧快照，由调用方在锁外释放旧链；
//! - [`VersionToken`]：有效 → 失效 的单向状态机，失效后只能被新令牌替换，不可复活；
//! - [`SeenFlags`]：罕见路径的首见标记，只用于日志，允许竞态。
//!
//! # 风险与考量（Trade-offs）
//! - `epoch` 仅是逻辑时钟，写入的线性化由探针的重建锁保证；
//! - 旧快照可能仍被并发执行持有，`swap` 之后释放的是观察者状态，而非内存。

use std::sync::Arc;
#[cfg(not(any(loom, spark_loom)))]
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering as StdOrdering};

use arc_swap::{ArcSwap, Guard};
#[cfg(any(loom, spark_loom))]
use loom::sync::atomic::{AtomicBool, Ordering};

use crate::chain::ChainNode;

/// 链路有效性令牌。
///
/// # 契约（What）
/// - 只允许从“有效”单向转为“失效”；[`VersionToken::invalidate`] 返回本次调用是否完成了转换；
/// - 读取使用 `Acquire`、失效使用 `AcqRel`，保证看到失效的线程也能看到失效前的写入。
#[derive(Debug)]
pub struct VersionToken {
    valid: AtomicBool,
}

impl VersionToken {
    /// 新的有效令牌。
    pub fn new_valid() -> Self {
        Self {
            valid: AtomicBool::new(true),
        }
    }

    /// 一开始即失效的令牌，用于尚未构建过链路的探针。
    pub fn invalidated() -> Self {
        Self {
            valid: AtomicBool::new(false),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// 失效令牌，仅首次调用返回 `true`。
    pub fn invalidate(&self) -> bool {
        self.valid.swap(false, Ordering::AcqRel)
    }
}

/// 一次发布的不可变快照：令牌、链头与对应的 epoch。
pub(crate) struct ChainState {
    pub(crate) token: VersionToken,
    pub(crate) chain: Option<Box<ChainNode>>,
    pub(crate) epoch: u64,
}

impl ChainState {
    fn initial() -> Self {
        Self {
            token: VersionToken::invalidated(),
            chain: None,
            epoch: 0,
        }
    }

    pub(crate) fn published(chain: Option<Box<ChainNode>>, epoch: u64) -> Self {
        Self {
            token: VersionToken::new_valid(),
            chain,
            epoch,
        }
    }

    /// 链头（存在时）。
    pub(crate) fn head(&self) -> Option<&ChainNode> {
        self.chain.as_deref()
    }
}

/// 快照发布单元，结构与 Pipeline 的 epoch 缓冲区一致：`ArcSwap` 快照 + 逻辑时钟。
pub(crate) struct ChainCell {
    snapshot: ArcSwap<ChainState>,
    epoch: AtomicU64,
}

impl ChainCell {
    /// 尚未构建的初始状态：令牌失效、无链路、epoch 为 0。
    pub(crate) fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(ChainState::initial()),
            epoch: AtomicU64::new(0),
        }
    }

    /// 读取当前快照，不增加引用计数。
    #[inline]
    pub(crate) fn load(&self) -> Guard<Arc<ChainState>> {
        self.snapshot.load()
    }

    /// 读取当前快照并持有所有权。
    #[inline]
    pub(crate) fn load_full(&self) -> Arc<ChainState> {
        self.snapshot.load_full()
    }

    /// 原子发布新快照，返回被替换的旧快照。
    #[inline]
    pub(crate) fn swap(&self, next: Arc<ChainState>) -> Arc<ChainState> {
        self.snapshot.swap(next)
    }

    #[inline]
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(StdOrdering::SeqCst)
    }

    /// 为即将发布的快照分配下一个 epoch。
    #[inline]
    pub(crate) fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, StdOrdering::SeqCst) + 1
    }
}

/// 罕见路径首见标记。
///
/// 标记只服务于诊断日志：首次观察到某条罕见路径时输出一条 `trace` 事件。
/// 使用 `Relaxed` 读写，丢失或重复一次标记都不影响正确性。
#[derive(Debug, Default)]
pub(crate) struct SeenFlags(AtomicU8);

impl SeenFlags {
    pub(crate) const UNWIND: u8 = 1 << 0;
    pub(crate) const REENTER: u8 = 1 << 1;
    pub(crate) const RETURNED: u8 = 1 << 2;
    pub(crate) const EXCEPTION: u8 = 1 << 3;

    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// 标记路径已见，返回是否为首次。
    #[inline]
    pub(crate) fn mark(&self, flag: u8) -> bool {
        if self.0.load(StdOrdering::Relaxed) & flag != 0 {
            return false;
        }
        self.0.fetch_or(flag, StdOrdering::Relaxed) & flag == 0
    }

    pub(crate) fn name(flag: u8) -> &'static str {
        match flag {
            Self::UNWIND => "unwind",
            Self::REENTER => "reenter",
            Self::RETURNED => "returned",
            Self::EXCEPTION => "exception",
            _ => "unknown",
        }
    }
}

#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-probe: 零开销、可组合、支持 unwind 协议的插桩探针链核心。"]
#![doc = ""]
#![doc = "== 定位 =="]
#![doc = "任意数量、彼此独立注册的观察者可以在运行中程序的插桩点上挂接进入/返回/异常钩子：无观察者时探针近乎零开销；多个观察者共存时按确定顺序组合；任何观察者都可以通过 unwind 协议中止或重定向正在进行的计算（提前返回、重新执行），而不破坏同一链路上其他观察者的语义。"]
#![doc = ""]
#![doc = "== 容错边界 =="]
#![doc = "可信（语言内部）观察者的失败直接逃逸到宿主；不可信（外部工具）观察者的失败与 panic 一律被拦截，经 [`BoundaryReporter`] 上报后吞没，宿主计算不受影响。"]
#![doc = ""]
#![doc = "== 外部协作方 =="]
#![doc = "绑定注册表与匹配、探针在程序表示中的插入与移除均不属于本 crate，只通过 [`ChainBuilder`] 与 [`ProbeHost`] 两个接口交互。"]

pub mod binding;
mod chain;
pub mod config;
pub mod context;
pub mod error;
mod internal;
pub mod observability;
pub mod observer;
pub mod probe;
pub mod services;
/// 测试桩集合。
///
/// # 教案式导航
/// - 通过 `use spark_probe::test_stubs::*;` 引入记录型构建器、宿主与上报器；
/// - 仅用于测试、基准与文档示例。
pub mod test_stubs;
pub mod unwind;
pub mod value;

pub use binding::{Binding, BindingElement, BindingId, BindingTrust};
pub use config::{ProbeSettings, SettingsError};
pub use context::{EventContext, SourceLocation};
pub use error::{ExecutionFault, FatalSignal, HookError, ObserverError, ObserverFault};
pub use internal::VersionToken;
pub use observer::{
    ExecutionHandler, ExecutionHandlerFactory, ExecutionListener, HookResult, UnwindOutcome,
};
pub use probe::{ChainEntry, Probe, ProbeId, Resolution};
pub use services::{
    BoundaryReporter, ChainBuilder, ProbeHost, ProbeServices, TracingBoundaryReporter,
};
pub use unwind::{UnwindAction, UnwindPayload, UnwindSignal};
pub use value::{ForeignObject, GuestException, GuestValue, HostObject};

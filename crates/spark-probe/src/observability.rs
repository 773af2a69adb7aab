//! 可观测性键名：操作名、日志字段与日志目标的单一事实来源。
//!
//! 边界上报、可信失败与日志事件都引用这里的常量，避免同一语义在多处以不同字符串出现。

/// 生命周期操作名，出现在 [`ObserverFault::operation`](crate::ObserverFault::operation)
/// 与边界上报中。
pub mod operation {
    #[doc = "进入插桩点。"]
    pub const ON_ENTER: &str = "on_enter";

    #[doc = "插桩点正常返回。"]
    pub const ON_RETURN_VALUE: &str = "on_return_value";

    #[doc = "插桩点以故障结束。"]
    pub const ON_RETURN_EXCEPTIONAL: &str = "on_return_exceptional";

    #[doc = "unwind 派发。"]
    pub const ON_UNWIND: &str = "on_unwind";

    #[doc = "处理器释放。"]
    pub const ON_DISPOSE: &str = "on_dispose";

    #[doc = "每探针处理器创建。"]
    pub const HANDLER_FACTORY_CREATE: &str = "handler_factory.create";
}

/// 结构化日志字段名。
pub mod fields {
    #[doc = "探针标识。"]
    pub const PROBE_ID: &str = "probe.id";

    #[doc = "绑定标识。"]
    pub const BINDING_ID: &str = "binding.id";

    #[doc = "绑定标签。"]
    pub const BINDING_LABEL: &str = "binding.label";

    #[doc = "生命周期操作名，取值见 [`super::operation`]。"]
    pub const OPERATION: &str = "probe.operation";

    #[doc = "稳定错误码，取值见 [`crate::error::codes`]。"]
    pub const ERROR_CODE: &str = "error.code";

    #[doc = "链路发布 epoch。"]
    pub const EPOCH: &str = "probe.epoch";
}

/// 边界上报事件的日志目标。
pub const BOUNDARY_TARGET: &str = "spark_probe::boundary";

//! 访客值与访客异常。
//!
//! # 设计背景（Why）
//! - 探针本身不理解宿主程序的数据表示，但 unwind 处理器可以把一个值“塞回”插桩点作为返回值，
//!   因此必须约束可以跨越观察者边界的值种类；
//! - 约束采用封闭枚举表达：数值、布尔、字符、文本、外部对象句柄属于“可互操作”集合，
//!   `Host` 则代表宿主内部对象，只能沿执行路径透传，不得由 unwind 处理器返回。

use std::{any::Any, fmt, sync::Arc};

/// 外部对象句柄，按指针身份比较。
#[derive(Clone)]
pub struct ForeignObject {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl ForeignObject {
    /// 包装任意外部对象。
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// 尝试按具体类型借用。
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// 被包装对象的类型名，仅用于诊断。
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl PartialEq for ForeignObject {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ForeignObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ForeignObject").field(&self.type_name).finish()
    }
}

/// 宿主内部对象，不属于可互操作集合。
#[derive(Clone)]
pub struct HostObject {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl HostObject {
    /// 包装宿主内部对象。
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// 尝试按具体类型借用。
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// 被包装对象的类型名。
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl PartialEq for HostObject {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostObject").field(&self.type_name).finish()
    }
}

/// 流经插桩点的值。
///
/// # 契约（What）
/// - 除 `Host` 外的所有分支均满足 [`GuestValue::is_interop`]；
/// - `Foreign` 与 `Host` 按指针身份判等，其余分支按值判等。
#[derive(Clone, Debug, PartialEq)]
pub enum GuestValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Text(Arc<str>),
    Foreign(ForeignObject),
    Host(HostObject),
}

impl GuestValue {
    /// 构造文本值。
    pub fn text(value: impl Into<Arc<str>>) -> Self {
        GuestValue::Text(value.into())
    }

    /// 是否属于可互操作集合，只有可互操作值才允许由 unwind 处理器返回。
    pub fn is_interop(&self) -> bool {
        !matches!(self, GuestValue::Host(_))
    }

    /// 值种类名称，用于类型违例的诊断信息。
    pub fn kind(&self) -> &'static str {
        match self {
            GuestValue::Bool(_) => "bool",
            GuestValue::Int(_) => "int",
            GuestValue::Float(_) => "float",
            GuestValue::Char(_) => "char",
            GuestValue::Text(_) => "text",
            GuestValue::Foreign(_) => "foreign",
            GuestValue::Host(object) => object.type_name(),
        }
    }

    /// 若为整数则返回其值。
    pub fn as_int(&self) -> Option<i64> {
        match self {
            GuestValue::Int(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<bool> for GuestValue {
    fn from(value: bool) -> Self {
        GuestValue::Bool(value)
    }
}

impl From<i64> for GuestValue {
    fn from(value: i64) -> Self {
        GuestValue::Int(value)
    }
}

impl From<i32> for GuestValue {
    fn from(value: i32) -> Self {
        GuestValue::Int(i64::from(value))
    }
}

impl From<f64> for GuestValue {
    fn from(value: f64) -> Self {
        GuestValue::Float(value)
    }
}

impl From<char> for GuestValue {
    fn from(value: char) -> Self {
        GuestValue::Char(value)
    }
}

impl From<&str> for GuestValue {
    fn from(value: &str) -> Self {
        GuestValue::Text(Arc::from(value))
    }
}

impl From<String> for GuestValue {
    fn from(value: String) -> Self {
        GuestValue::Text(Arc::from(value))
    }
}

/// 访客语言异常。
#[derive(Clone, Debug, PartialEq)]
pub struct GuestException {
    message: Arc<str>,
    value: Option<GuestValue>,
}

impl GuestException {
    /// 以消息构造异常。
    pub fn new(message: impl Into<Arc<str>>) -> Self {
        Self {
            message: message.into(),
            value: None,
        }
    }

    /// 附带访客侧异常对象。
    pub fn with_value(mut self, value: GuestValue) -> Self {
        self.value = Some(value);
        self
    }

    /// 异常消息。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 访客侧异常对象。
    pub fn value(&self) -> Option<&GuestValue> {
        self.value.as_ref()
    }
}

impl fmt::Display for GuestException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for GuestException {}

//! 探针集成测试入口。
//!
//! 子模块按关注点划分：派发顺序、容错边界、unwind 协议、链路重建与并发。
#![cfg(not(any(loom, spark_loom)))]

mod concurrency;
mod containment;
mod ordering;

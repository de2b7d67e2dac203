//! 可观测性：tracing 日志
//!
//! 默认 info，可通过 RUST_LOG 覆盖。使用 try_init，重复调用（测试、多个入口）不会 panic。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

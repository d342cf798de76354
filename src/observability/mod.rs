//! 可观测性

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化日志：默认 info，可用 RUST_LOG 覆盖
pub fn init() {
    init_with("info");
}

/// 以给定的默认级别初始化；RUST_LOG 仍然优先
pub fn init_with(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

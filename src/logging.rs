/// 日志初始化
///
/// 日志统一写到 stderr: 进程拓扑下 stdout 是阶段之间的数据通道。
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 初始化全局日志; `RUST_LOG` 优先于 `level`。重复调用无副作用
pub fn init_logging(level: &str) {
    // ort 在 info 级别很吵
    let filter_string = format!("{level},ort=warn");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_string));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_names(true);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .try_init();
}

use std::io::Write;

/// 日志的默认过滤级别，可以通过 `RUST_LOG` 覆盖
pub const DEFAULT_LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;

/// 初始化全局 logger
///
/// 格式：`[时间] 级别 [文件:行号] 内容`，不同级别使用不同颜色。
/// 重复调用是安全的（测试中多次初始化时只有第一次生效）。
pub fn init_log() {
    let _ = builder().try_init();
}

fn builder() -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            let level_color = match record.level() {
                log::Level::Error => anstyle::AnsiColor::Red,
                log::Level::Warn => anstyle::AnsiColor::Yellow,
                log::Level::Info => anstyle::AnsiColor::Green,
                log::Level::Debug => anstyle::AnsiColor::Blue,
                log::Level::Trace => anstyle::AnsiColor::Magenta,
            };
            let level_style = buf.default_level_style(record.level()).fg_color(Some(anstyle::Color::Ansi(level_color)));
            let grey_style = anstyle::Style::new().fg_color(Some(anstyle::Color::Rgb(anstyle::RgbColor(110, 110, 110))));

            let line = record.line().unwrap_or(!0);
            // windows 和 unix 的路径分隔符都需要处理
            let file = record.file().unwrap_or("").rsplit(['\\', '/']).next().unwrap_or("");
            let time = chrono::Local::now().format("%H:%M:%S%.3f");
            let level = record.level();

            writeln!(
                buf,
                "{level_style}[{time}] {level:<5}{level_style:#} {grey_style}[{file}:{line}]{grey_style:#} {}",
                record.args()
            )
        })
        .filter(None, DEFAULT_LOG_LEVEL)
        .parse_default_env();
    builder
}

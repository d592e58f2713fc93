use crate::core::config::LogConfig;
use crate::libs::{APP_NAME, TIME_MILLISECOND_FORMAT};
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use time::{OffsetDateTime, UtcOffset};
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::util::SubscriberInitExt;

/// 初始化日志
///
/// `log.dir` 为空时输出到控制台，否则按天滚动写入该目录。`RUST_LOG` 优先于 `log.level`。
/// `offset` 用于日志和panic文件的时间戳。
pub(crate) fn init(log: &LogConfig, offset: UtcOffset) -> anyhow::Result<()> {
    let level = LevelFilter::from_str(&log.level)
        .with_context(|| format!("invalid log level {:?}", log.level))?;

    if log.dir.is_empty() {
        hook_panic_handler(None, offset);
        init_tracing(None, level, offset)
    } else {
        let logs_dir = PathBuf::from(&log.dir);
        fs::create_dir_all(&logs_dir)
            .with_context(|| format!("failed to create log directory {}", logs_dir.display()))?;
        hook_panic_handler(Some(logs_dir.clone()), offset);
        init_tracing(Some(&logs_dir), level, offset)
    }
}

/// 拦截panic，有日志目录时把panic信息和backtrace追加到 `<dir>/<app>.panic.log`
fn hook_panic_handler(logs_dir: Option<PathBuf>, offset: UtcOffset) {
    use std::backtrace;
    use std::fs::OpenOptions;
    use std::io::Write;

    std::panic::set_hook(Box::new(move |info| {
        let backtrace = backtrace::Backtrace::force_capture();
        let payload = info.payload();
        let payload_str = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str));

        match payload_str {
            Some(s) => eprintln!("panic occurred: payload:{}, location: {:?}", s, info.location()),
            None => eprintln!("panic occurred: location: {:?}", info.location()),
        }

        if let Some(dir) = &logs_dir {
            let current_time = timestamp_at(OffsetDateTime::now_utc(), offset);
            let _ = OpenOptions::new()
                .append(true)
                .create(true)
                .open(dir.join(format!("{APP_NAME}.panic.log")))
                .and_then(|mut f| {
                    f.write_all(format!("{} {}\n{:#?}\n", current_time, info, backtrace).as_bytes())
                });
            eprintln!("panic backtrace saved");
        }
        std::process::exit(1);
    }));
}

/// 读取本地时区，失败时退回 UTC
///
/// 多线程运行后 `time` 可能拒绝读取时区，需在启动 tokio 运行时之前调用。
pub(crate) fn local_offset() -> UtcOffset {
    UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC)
}

fn timestamp_at(now: OffsetDateTime, offset: UtcOffset) -> String {
    time::format_description::parse(TIME_MILLISECOND_FORMAT)
        .ok()
        .and_then(|format| now.to_offset(offset).format(&format).ok())
        .unwrap_or_default()
}

fn init_tracing(logs_dir: Option<&Path>, level: LevelFilter, offset: UtcOffset) -> anyhow::Result<()> {
    let format = time::format_description::parse(TIME_MILLISECOND_FORMAT)?;
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_level(true)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_timer(OffsetTime::new(offset, format))
        .with_ansi(false);

    match logs_dir {
        //输出到控制台：ERROR 到 stderr，其余到 stdout
        None => builder
            .with_writer(
                std::io::stdout
                    .with_filter(|meta| meta.level() > &Level::ERROR)
                    .or_else(std::io::stderr),
            )
            .finish()
            .try_init()?,
        //输出到日志文件，保留7天
        Some(dir) => builder
            .with_writer(
                tracing_appender::rolling::Builder::new()
                    .filename_prefix(APP_NAME)
                    .filename_suffix("log")
                    .max_log_files(7)
                    .rotation(tracing_appender::rolling::Rotation::DAILY)
                    .build(dir)?,
            )
            .finish()
            .try_init()?,
    }
    Ok(())
}

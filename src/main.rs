use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use tcpmon_rs::capture::PcapEventSource;
use tcpmon_rs::cli::{Args, Config, SinkConfig, SinkKind};
use tcpmon_rs::sink::{ChannelSink, EmissionSink, JsonLinesWriter, LogSink, ZmqSink};
use tcpmon_rs::state::NetlinkStateAccessor;
use tcpmon_rs::TcpMonitor;

type WriterHandle = JoinHandle<tcpmon_rs::Result<u64>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 解析命令行参数
    let args = Args::parse();

    // 加载配置, 命令行参数优先
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path))?,
        None => Config::for_interface(""),
    };
    config.apply_args(&args);

    // 初始化日志
    env_logger::Builder::new()
        .filter_level(config.log_level.parse().unwrap_or(log::LevelFilter::Info))
        .init();

    config.validate().context("invalid configuration")?;

    // 创建事件源
    let capture = config.interface.capture_config()?;
    let source = Arc::new(
        PcapEventSource::new(capture)
            .with_context(|| format!("cannot use interface {}", config.interface.name))?,
    );

    // 连接状态读取
    let accessor = Arc::new(
        NetlinkStateAccessor::new(
            Duration::from_millis(config.monitor.netlink_timeout_ms),
            config.monitor.srtt_scale_shift,
        )
        .context("failed to open sock_diag netlink socket")?,
    );

    // 创建输出
    let (sink, writer) = create_sink(&config.sink).await?;

    let monitor = TcpMonitor::new(source.clone(), accessor, sink, &config.monitor);
    monitor.start().context("failed to register the monitor hook")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    if let Err(e) = monitor.stop() {
        warn!("stopping the monitor: {}", e);
    }
    let stats = monitor.stats();
    let capture_stats = source.stats();
    drop(monitor);

    if let Some(writer) = writer {
        match writer.await? {
            Ok(written) => info!("{} snapshots written", written),
            Err(e) => error!("snapshot writer failed: {}", e),
        }
    }

    info!(
        "events={} sampled={} emitted={} rate_limited={} not_applicable={} untracked={} \
         accessor_errors={} sink_dropped={} overflowed={}",
        stats.events_seen,
        stats.sampled,
        stats.emitted,
        stats.rate_limited,
        stats.not_applicable,
        stats.untracked,
        stats.accessor_errors,
        stats.sink_dropped,
        stats.overflowed
    );
    info!(
        "capture received={} dropped={} if_dropped={}",
        capture_stats.packets_received,
        capture_stats.packets_dropped,
        capture_stats.packets_if_dropped
    );
    Ok(())
}

async fn create_sink(
    config: &SinkConfig,
) -> anyhow::Result<(Arc<dyn EmissionSink>, Option<WriterHandle>)> {
    match config.kind {
        SinkKind::Log => Ok((Arc::new(LogSink::new()), None)),
        SinkKind::Json => {
            let (sink, rx) = ChannelSink::new(config.queue_size);
            let writer = match &config.path {
                Some(path) => {
                    let file = tokio::fs::File::create(path)
                        .await
                        .with_context(|| format!("cannot create {}", path))?;
                    tokio::spawn(JsonLinesWriter::new(rx, file).run())
                }
                None => tokio::spawn(JsonLinesWriter::new(rx, tokio::io::stdout()).run()),
            };
            Ok((Arc::new(sink), Some(writer)))
        }
        SinkKind::Zmq => {
            let endpoint = config
                .endpoint
                .as_deref()
                .context("sink.endpoint is required for the zmq sink")?;
            let high_water_mark = i32::try_from(config.queue_size).unwrap_or(i32::MAX);
            let sink = if config.bind {
                ZmqSink::bind(endpoint, &config.topic, high_water_mark)?
            } else {
                ZmqSink::connect(endpoint, &config.topic, high_water_mark)?
            };
            Ok((Arc::new(sink), None))
        }
    }
}

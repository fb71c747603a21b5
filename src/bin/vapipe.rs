// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 多路视频分析流水线
///
/// 系统架构:
/// 1. 帧源 Stage: 按通道轮转输出帧
/// 2. 推理 Stage: 按通道分片, 批处理检测, 结果保持帧顺序
/// 3. 裁剪 + 分类 Stage (可选): 对检测框做二级分类
/// 4. 终端: 写 CSV 或直接释放
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use vapipe_rs::{Args, Pipeline};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let config = args.resolve().context("配置无效")?;
    let (width, height) = config.frame_size();

    println!("🚀 视频分析流水线启动");
    println!("📦 模型: {:?} (batch {}, nireq {})", config.model, config.batch_size, config.nireq);
    if config.classify {
        println!("🏷️ 分类级联: 已启用");
    }
    match &config.input {
        Some(path) => println!("📂 输入: {} ({}x{})", path.display(), width, height),
        None => println!("🎨 输入: 合成画面 ({}x{})", width, height),
    }
    println!("📹 通道: {}  推理 Stage: {}", config.channels, config.workers);
    if let Some(path) = &config.output_csv {
        println!("💾 输出: {}", path.display());
    }
    println!();

    let mut pipeline = Pipeline::from_config(&config).context("流水线搭建失败")?;
    let report = (config.report_interval_secs > 0.0)
        .then(|| Duration::from_secs_f32(config.report_interval_secs));
    pipeline
        .run_for(config.duration_secs.map(Duration::from_secs), report)
        .context("流水线运行失败")?;

    let snapshot = pipeline.stats().snapshot();
    let destroyed = pipeline.cleaner().destroyed_count();
    let rows = pipeline.rows_written();
    let consumed = pipeline.packets_consumed();
    pipeline.shutdown();

    println!();
    println!("📊 解码帧数: {}", snapshot.decoded_total);
    println!(
        "🎯 检测: {} / {}",
        snapshot.detections_processed, snapshot.detections_received
    );
    if config.classify {
        println!(
            "🏷️ 分类: {} / {}",
            snapshot.classifications_processed, snapshot.classifications_received
        );
    }
    println!("♻️ 已销毁 Buffer: {}", destroyed);
    if config.output_csv.is_some() {
        println!("💾 CSV 行数: {}", rows);
    } else {
        println!("📭 终端 Packet: {}", consumed);
    }
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

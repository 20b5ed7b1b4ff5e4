use anyhow::{Context, Result};
use log::{error, info};
use myy_avsync::core::{PlaybackState, PlayerConfig, PlayerEvent};
use myy_avsync::player::{CpalSinkFactory, FFmpegBackend, LogSurface, Player};
use std::env;
use std::sync::Arc;

fn usage() -> ! {
    eprintln!("用法: myy_avsync <媒体文件或URL> [--config <配置文件.json>]");
    std::process::exit(2);
}

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        // cpal 的设备枚举日志太吵
        .filter_module("cpal", log::LevelFilter::Warn)
        .init();

    info!("🎬 MYY AVSync 启动");

    let mut args = env::args().skip(1);
    let mut path = None;
    let mut config_path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = Some(args.next().unwrap_or_else(|| usage())),
            "-h" | "--help" => usage(),
            _ if path.is_none() => path = Some(arg),
            _ => usage(),
        }
    }
    let path = path.unwrap_or_else(|| usage());

    let config = match &config_path {
        Some(file) => PlayerConfig::load(file).with_context(|| format!("无法加载配置 {}", file))?,
        None => PlayerConfig::default(),
    };
    config.validate().context("配置无效")?;

    // 初始化 FFmpeg
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("FFmpeg 初始化失败: {}", e))?;
    info!("✅ FFmpeg 初始化成功");

    let mut player = Player::new(
        config,
        Arc::new(FFmpegBackend),
        Arc::new(CpalSinkFactory),
        Box::new(LogSurface::new()),
    );
    let events = player.events();
    player.open(&path).with_context(|| format!("无法打开 {}", path))?;

    // 命令行模式没有用户输入：进入暂停说明已播放到结尾
    for event in events.iter() {
        match event {
            PlayerEvent::Opened {
                duration,
                video_streams,
                audio_streams,
                subtitle_streams,
            } => {
                info!("📋 时长 {:.2}s", duration);
                for name in video_streams.iter().chain(&audio_streams).chain(&subtitle_streams) {
                    info!("   {}", name);
                }
            }
            PlayerEvent::PositionChanged(pos) => {
                log::debug!("⏱ {:.1}s / {:.1}s", pos, player.duration());
            }
            PlayerEvent::Error { code, message } => {
                error!("❌ 播放错误 [{}]: {}", code, message);
            }
            PlayerEvent::StateChanged(PlaybackState::Paused) => {
                info!("🏁 播放结束");
                break;
            }
            PlayerEvent::StateChanged(PlaybackState::Stopped) => break,
            _ => {}
        }
    }

    let stats = player.stats();
    info!(
        "📊 丢帧: 早 {} / 晚 {}",
        stats.frame_drops_early, stats.frame_drops_late
    );
    player.stop();
    Ok(())
}

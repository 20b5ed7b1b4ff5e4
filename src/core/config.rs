use crate::core::{PlayerError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 同步主时钟设置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMaster {
    #[default]
    Audio,
    Video,
    External,
}

/// 丢帧策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameDropMode {
    /// 视频不是主时钟时丢帧
    #[default]
    Auto,
    Always,
    Never,
}

impl FrameDropMode {
    pub fn enabled(self, video_is_master: bool) -> bool {
        match self {
            FrameDropMode::Always => true,
            FrameDropMode::Auto => !video_is_master,
            FrameDropMode::Never => false,
        }
    }
}

/// 网络流调优参数（传给 FFmpeg 的 AVDictionary）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkOptions {
    pub fflags: String,
    pub analyze_duration_us: u64,
    pub max_scan_bytes: u64,
    pub timeout_us: u64,
    pub rw_timeout_us: u64,
    pub buffer_size: u64,
    pub reconnect: bool,
    pub reconnect_delay_max: u32,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            fflags: "+discardcorrupt+genpts".to_string(),
            analyze_duration_us: 5_000_000,
            max_scan_bytes: 10_000_000,
            timeout_us: 15_000_000,
            rw_timeout_us: 8_000_000,
            buffer_size: 8 * 1024 * 1024,
            reconnect: true,
            reconnect_delay_max: 4,
        }
    }
}

impl NetworkOptions {
    /// 转成键值对，供后端写入选项字典
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("fflags", self.fflags.clone()),
            ("analyzeduration", self.analyze_duration_us.to_string()),
            ("probesize", self.max_scan_bytes.to_string()),
            ("timeout", self.timeout_us.to_string()),
            ("rw_timeout", self.rw_timeout_us.to_string()),
            ("buffer_size", self.buffer_size.to_string()),
        ];
        if self.reconnect {
            pairs.push(("reconnect", "1".to_string()));
            pairs.push(("reconnect_streamed", "1".to_string()));
            pairs.push(("reconnect_delay_max", self.reconnect_delay_max.to_string()));
        }
        pairs
    }
}

/// 播放引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub sync_master: SyncMaster,
    pub framedrop: FrameDropMode,
    /// None = 实时流自动开启
    pub infinite_buffer: Option<bool>,
    /// None = 时间戳不连续的格式自动按字节 seek
    pub seek_by_bytes: Option<bool>,
    /// 打开后立即 seek 到该位置（秒）
    pub start_time: Option<f64>,
    pub max_queue_bytes: usize,
    pub min_frames: usize,
    pub open_timeout_ms: u64,
    pub position_interval_ms: u64,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    pub volume: f64,
    pub muted: bool,
    pub network: NetworkOptions,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            sync_master: SyncMaster::Audio,
            framedrop: FrameDropMode::Auto,
            infinite_buffer: None,
            seek_by_bytes: None,
            start_time: None,
            max_queue_bytes: 15 * 1024 * 1024,
            min_frames: 25,
            open_timeout_ms: 10_000,
            position_interval_ms: 100,
            audio_sample_rate: 48_000,
            audio_channels: 2,
            volume: 1.0,
            muted: false,
            network: NetworkOptions::default(),
        }
    }
}

impl PlayerConfig {
    /// 从 JSON 文件加载
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: PlayerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_queue_bytes == 0 {
            return Err(PlayerError::Config("max_queue_bytes 不能为 0".into()));
        }
        if self.open_timeout_ms == 0 {
            return Err(PlayerError::Config("open_timeout_ms 不能为 0".into()));
        }
        if self.audio_sample_rate < 8_000 || self.audio_sample_rate > 384_000 {
            return Err(PlayerError::Config(format!(
                "不支持的采样率: {}",
                self.audio_sample_rate
            )));
        }
        if self.audio_channels == 0 || self.audio_channels > 8 {
            return Err(PlayerError::Config(format!(
                "不支持的声道数: {}",
                self.audio_channels
            )));
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(PlayerError::Config(format!("无效的音量: {}", self.volume)));
        }
        if let Some(start) = self.start_time {
            if !start.is_finite() || start < 0.0 {
                return Err(PlayerError::Config(format!("无效的起始时间: {}", start)));
            }
        }
        Ok(())
    }
}

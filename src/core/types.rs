use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 媒体流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Subtitle,
    Data,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "Video",
            MediaKind::Audio => "Audio",
            MediaKind::Subtitle => "Subtitle",
            MediaKind::Data => "Data",
        }
    }
}

/// 有理数（时间基、帧率、像素宽高比）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// 分母为 0 时返回 0.0
    pub fn to_f64(self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    pub fn is_valid(self) -> bool {
        self.num > 0 && self.den > 0
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

/// 数据包类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// 普通压缩数据
    Data,
    /// 冲刷哨兵：入队时队列序号 +1
    Flush,
    /// 空包：某条流的输入结束
    Null,
}

/// 压缩数据包（时间戳单位为所属流的时间基）
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketKind,
    pub stream_index: usize,
    pub data: Vec<u8>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub pos: i64,
    pub keyframe: bool,
}

impl Packet {
    pub fn data(stream_index: usize, data: Vec<u8>) -> Self {
        Self {
            kind: PacketKind::Data,
            stream_index,
            data,
            pts: None,
            dts: None,
            duration: 0,
            pos: -1,
            keyframe: false,
        }
    }

    pub fn flush() -> Self {
        Self {
            kind: PacketKind::Flush,
            ..Self::data(0, Vec::new())
        }
    }

    pub fn null(stream_index: usize) -> Self {
        Self {
            kind: PacketKind::Null,
            ..Self::data(stream_index, Vec::new())
        }
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self.dts = Some(pts);
        self
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_pos(mut self, pos: i64) -> Self {
        self.pos = pos;
        self
    }

    pub fn is_flush(&self) -> bool {
        self.kind == PacketKind::Flush
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// 流信息（打开容器时探测得到）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: MediaKind,
    pub codec_name: String,
    pub language: Option<String>,
    pub title: Option<String>,
    pub time_base: Rational,
    /// 以时间基计的起始时间
    pub start_time: Option<i64>,
    /// 以时间基计的时长
    pub duration: Option<i64>,
    /// 推测帧率（av_guess_frame_rate）
    pub frame_rate: Rational,
    pub width: u32,
    pub height: u32,
    pub sample_aspect_ratio: Rational,
    pub sample_rate: u32,
    pub channels: u16,
    /// 封面图片流（mp3/m4a 专辑封面）
    pub attached_pic: bool,
    /// 文本字幕（只有文本字幕会出现在字幕列表中）
    pub text_subtitle: bool,
}

impl StreamInfo {
    pub fn new(index: usize, kind: MediaKind) -> Self {
        Self {
            index,
            kind,
            codec_name: String::new(),
            language: None,
            title: None,
            time_base: Rational::new(1, 1000),
            start_time: None,
            duration: None,
            frame_rate: Rational::default(),
            width: 0,
            height: 0,
            sample_aspect_ratio: Rational::default(),
            sample_rate: 0,
            channels: 0,
            attached_pic: false,
            text_subtitle: false,
        }
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.duration.map(|d| d as f64 * self.time_base.to_f64())
    }

    /// 列表中展示的名称，例如 "Audio Stream #1: eng: Commentary [aac]"
    pub fn display_name(&self, ordinal: usize) -> String {
        let mut name = format!("{} Stream #{}: ", self.kind.as_str(), ordinal);
        match &self.language {
            Some(lang) => name.push_str(lang),
            None => name.push_str("Unknown"),
        }
        if let Some(title) = &self.title {
            name.push_str(": ");
            name.push_str(title);
        }
        name.push_str(&format!(" [{}]", self.codec_name));
        name
    }

    /// 是否会出现在对应类型的流列表中
    pub fn is_listed(&self) -> bool {
        match self.kind {
            MediaKind::Video | MediaKind::Audio => true,
            MediaKind::Subtitle => self.text_subtitle,
            MediaKind::Data => false,
        }
    }
}

/// 像素格式（平面布局由呈现端负责转换）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    YUV420P,
    YUV422P,
    YUV444P,
    YUV420P10,
    NV12,
    Gray8,
    RGBA,
}

impl PixelFormat {
    pub fn plane_count(&self) -> usize {
        match self {
            PixelFormat::YUV420P
            | PixelFormat::YUV422P
            | PixelFormat::YUV444P
            | PixelFormat::YUV420P10 => 3,
            PixelFormat::NV12 => 2,
            PixelFormat::Gray8 | PixelFormat::RGBA => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorSpace {
    Bt601,
    Bt709,
    Bt2020,
    #[default]
    Unspecified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorRange {
    Limited,
    Full,
    #[default]
    Unspecified,
}

/// 色彩描述，交给呈现端决定如何转换
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColorDescriptor {
    pub space: ColorSpace,
    pub range: ColorRange,
    pub bit_depth: u8,
}

/// 解码后的平面图像
#[derive(Debug, Clone)]
pub struct VideoPicture {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: Vec<Vec<u8>>,
    pub strides: Vec<usize>,
    pub color: ColorDescriptor,
    pub sample_aspect_ratio: Rational,
    /// 秒，None 表示未知
    pub pts: Option<f64>,
    pub pos: i64,
}

/// 解码后的音频（交错 f32）
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
    /// 秒，None 表示未知
    pub pts: Option<f64>,
    pub pos: i64,
}

impl AudioBuffer {
    /// 每声道采样数
    pub fn nb_samples(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.nb_samples() as f64 / self.sample_rate as f64
        }
    }
}

/// 字幕事件：开始/结束显示偏移相对于 pts
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleEvent {
    pub text: String,
    pub pts: Option<f64>,
    pub start_display: f64,
    pub end_display: f64,
}

/// 帧队列中的一帧
#[derive(Debug)]
pub struct Frame<T> {
    pub payload: Arc<T>,
    /// 秒，NaN 表示未知
    pub pts: f64,
    pub duration: f64,
    pub pos: i64,
    pub serial: i64,
}

impl<T> Clone for Frame<T> {
    fn clone(&self) -> Self {
        Self {
            payload: Arc::clone(&self.payload),
            pts: self.pts,
            duration: self.duration,
            pos: self.pos,
            serial: self.serial,
        }
    }
}

impl<T> Frame<T> {
    pub fn new(payload: T, pts: f64, duration: f64, pos: i64, serial: i64) -> Self {
        Self {
            payload: Arc::new(payload),
            pts,
            duration,
            pos,
            serial,
        }
    }
}

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

/// 推送给调用方的通知
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Opened {
        duration: f64,
        video_streams: Vec<String>,
        audio_streams: Vec<String>,
        subtitle_streams: Vec<String>,
    },
    StateChanged(PlaybackState),
    PositionChanged(f64),
    DurationChanged(f64),
    SpeedChanged(f64),
    VolumeChanged(f64),
    MuteChanged(bool),
    /// 某类流的活动流切换（相对序号，-1 表示关闭）
    StreamChanged { kind: MediaKind, active: i32 },
    Error { code: i32, message: String },
}

/// 运行统计（用于监控和调试）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerStats {
    pub frame_drops_early: u64,
    pub frame_drops_late: u64,
    pub video_packets: usize,
    pub audio_packets: usize,
    pub subtitle_packets: usize,
    pub queued_bytes: usize,
    pub video_frames: usize,
    pub audio_queued_bytes: usize,
    /// 音频时钟 - 视频时钟（秒），NaN 表示不可用
    pub av_diff: f64,
}

use crate::core::{
    AudioBuffer, MediaKind, Packet, PlayerConfig, Result, StreamInfo, SubtitleEvent, VideoPicture,
};
use crate::player::audio_output::AudioSpec;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// 向解码库送入一个压缩单元的结果
#[derive(Debug, Clone, PartialEq)]
pub enum Feed {
    Accepted,
    /// 内部缓冲已满，先取出输出再重送同一个包
    Again,
    Failure(String),
}

/// 从解码库取输出的结果
#[derive(Debug)]
pub enum Decoded<T> {
    Frame(T),
    NeedMoreInput,
    EndOfStream,
    Failure(String),
}

/// 解码库的窄接口：送入压缩单元，取出零个或多个解码单元
pub trait Codec: Send {
    type Output: Send + Sync + 'static;

    fn send_packet(&mut self, packet: &Packet) -> Feed;

    /// 输入结束，之后 `receive` 排空剩余输出并返回 `EndOfStream`
    fn send_eof(&mut self);

    fn receive(&mut self) -> Decoded<Self::Output>;

    /// 丢弃内部缓冲（seek 之后）
    fn flush(&mut self);

    fn description(&self) -> String {
        String::from("codec")
    }
}

/// 音频解码器：输出重采样到设备格式，并支持同步校正时的采样数补偿
pub trait AudioDecode: Codec<Output = AudioBuffer> {
    /// 之后输出的采样率和声道数
    fn set_output(&mut self, spec: AudioSpec);

    /// 在接下来 `distance` 个输出采样内多出（正）或少出（负）`delta` 个采样
    fn set_compensation(&mut self, delta: i32, distance: i32);
}

pub type VideoCodec = Box<dyn Codec<Output = VideoPicture>>;
pub type AudioCodec = Box<dyn AudioDecode>;
pub type SubtitleCodec = Box<dyn Codec<Output = SubtitleEvent>>;

/// `MediaSource::read_packet` 的结果
#[derive(Debug)]
pub enum ReadOutcome {
    Packet(Packet),
    /// 暂时没有数据（网络流）
    Again,
    Eof,
    /// 不可恢复的 IO 错误
    Failure(String),
}

/// seek 目标
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeekTarget {
    /// 秒
    Time(f64),
    /// 字节偏移
    Bytes(i64),
}

/// 已打开的容器
pub trait MediaSource: Send {
    fn streams(&self) -> &[StreamInfo];

    /// 容器时长（秒）
    fn duration(&self) -> Option<f64>;

    /// 容器起始时间（秒）
    fn start_time(&self) -> Option<f64> {
        None
    }

    /// 码率（bit/s），0 表示未知
    fn bit_rate(&self) -> i64 {
        0
    }

    fn read_packet(&mut self) -> ReadOutcome;

    /// 向后 seek 到不晚于目标的关键帧
    fn seek(&mut self, target: SeekTarget) -> Result<()>;

    /// 封面图片流的图片数据
    fn attached_picture(&self, _stream_index: usize) -> Option<Packet> {
        None
    }

    /// 网络流暂停/恢复读取
    fn read_pause(&mut self) {}

    fn read_play(&mut self) {}

    /// 实时流（rtsp/rtp/udp 等），外部时钟需要按缓冲调速
    fn is_realtime(&self) -> bool {
        false
    }

    /// 时间戳可能不连续（mpeg-ts 等）
    fn has_ts_discontinuity(&self) -> bool {
        false
    }

    /// 未配置时是否默认按字节 seek
    fn prefers_byte_seek(&self) -> bool {
        self.has_ts_discontinuity()
    }

    /// 最佳流选择；`related` 为关联的视频流
    fn best_stream(&self, kind: MediaKind, related: Option<usize>) -> Option<usize> {
        let _ = related;
        self.streams()
            .iter()
            .find(|s| s.kind == kind && (kind != MediaKind::Subtitle || s.text_subtitle))
            .map(|s| s.index)
    }

    fn open_video_codec(&self, stream_index: usize) -> Result<VideoCodec>;

    fn open_audio_codec(&self, stream_index: usize) -> Result<AudioCodec>;

    fn open_subtitle_codec(&self, stream_index: usize) -> Result<SubtitleCodec>;

    fn description(&self) -> String;
}

/// 打开容器的后端
pub trait MediaBackend: Send + Sync {
    /// `interrupt` 被置位时应尽快放弃阻塞的 IO
    fn open(
        &self,
        url: &str,
        config: &PlayerConfig,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Box<dyn MediaSource>>;
}

// 播放器核心模块

pub mod audio_output;
pub mod codec;
pub mod decoder;
pub mod demuxer;
pub mod demuxer_source; // 容器/解码器抽象接口
pub mod demuxer_thread; // 解复用线程管理
pub mod frame_queue;
pub mod manager;
pub mod packet_queue;
pub mod render_thread;
pub mod state;
pub mod surface;

#[cfg(test)]
pub mod testing;

pub use audio_output::{AudioSink, AudioSinkFactory, AudioSpec, CpalSink, CpalSinkFactory};
pub use decoder::{AudioDecoder, StreamDecoder, SubtitleDecoder, VideoDecoder};
pub use demuxer::{FFmpegBackend, FFmpegDemuxer};
pub use demuxer_source::{MediaBackend, MediaSource, SeekTarget};
pub use demuxer_thread::StreamDemuxer;
pub use frame_queue::FrameQueue;
pub use manager::Player;
pub use packet_queue::PacketQueue;
pub use render_thread::RenderThread;
pub use surface::{LogSurface, VideoSurface};

use std::process;
use std::thread;

/// 日志前缀：进程号 + 线程号
pub(crate) fn log_ctx() -> String {
    format!("[pid:{}-tid:{:?}]", process::id(), thread::current().id())
}

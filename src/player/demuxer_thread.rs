use crate::core::{MediaKind, Packet, PlayerError, Result};
use crate::player::audio_output::{AudioSinkFactory, AudioSpec};
use crate::player::decoder::{
    AudioDecoder, DecoderHandle, StreamDecoder, SubtitleDecoder, VideoDecoder,
};
use crate::player::demuxer_source::{MediaBackend, MediaSource, ReadOutcome, SeekTarget};
use crate::player::log_ctx;
use crate::player::state::{PlayerShared, SeekRequest};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// 队列已满或暂时没有数据时的等待时间
const READ_WAIT: Duration = Duration::from_millis(10);

/// 需要在解复用线程内执行的命令（解码器由该线程持有）
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DemuxCommand {
    /// 切换到指定的绝对流序号，None 表示关闭
    SelectStream(MediaKind, Option<usize>),
    /// 切到同类型的下一条流
    CycleStream(MediaKind),
}

/// 解复用线程句柄
///
/// 线程负责打开容器、选择默认流、启动解码线程，然后在读循环里
/// 处理暂停读取、seek、封面图、背压和 EOF。
pub struct StreamDemuxer {
    shared: Arc<PlayerShared>,
    command_tx: Sender<DemuxCommand>,
    thread_handle: Option<JoinHandle<()>>,
}

impl StreamDemuxer {
    /// 启动解复用线程；返回的通道在容器打开成功或失败时收到一次结果
    pub fn open(
        url: &str,
        shared: Arc<PlayerShared>,
        backend: Arc<dyn MediaBackend>,
        sinks: Arc<dyn AudioSinkFactory>,
    ) -> Result<(Self, Receiver<Result<()>>)> {
        let (command_tx, command_rx) = unbounded::<DemuxCommand>();
        let (opened_tx, opened_rx) = crossbeam_channel::bounded::<Result<()>>(1);

        let url = url.to_string();
        let thread_shared = Arc::clone(&shared);
        let thread_handle = thread::Builder::new()
            .name("demuxer".into())
            .spawn(move || {
                let source = match backend.open(
                    &url,
                    &thread_shared.config,
                    thread_shared.abort_flag(),
                ) {
                    Ok(source) => source,
                    Err(e) => {
                        let _ = opened_tx.send(Err(e));
                        return;
                    }
                };
                // 打开期间已被放弃（看门狗超时或关闭）
                if thread_shared.abort_requested() {
                    info!("{} 打开完成时会话已中止，直接退出", log_ctx());
                    return;
                }
                let mut demux = DemuxLoop::new(Arc::clone(&thread_shared), source, sinks, command_rx);
                match demux.prepare() {
                    Ok(()) => {
                        let _ = opened_tx.send(Ok(()));
                        demux.run();
                    }
                    Err(e) => {
                        let _ = opened_tx.send(Err(e));
                    }
                }
                demux.shutdown();
            })
            .map_err(|e| PlayerError::OpenFailure(format!("无法创建解复用线程: {}", e)))?;

        Ok((
            Self {
                shared,
                command_tx,
                thread_handle: Some(thread_handle),
            },
            opened_rx,
        ))
    }

    pub fn seek(&self, seconds: f64) {
        self.shared.request_seek(seconds);
    }

    pub fn seek_target(&self, target: SeekTarget, seconds: f64) {
        self.shared.request_seek_target(target, seconds);
    }

    pub fn pause_toggle(&self) {
        self.shared.pause_toggle();
    }

    pub fn step_frame(&self) {
        self.shared.step_frame();
    }

    pub fn select_stream(&self, kind: MediaKind, index: Option<usize>) -> Result<()> {
        self.send(DemuxCommand::SelectStream(kind, index))
    }

    pub fn cycle_stream(&self, kind: MediaKind) -> Result<()> {
        self.send(DemuxCommand::CycleStream(kind))
    }

    fn send(&self, command: DemuxCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| PlayerError::NotOpened)?;
        self.shared.continue_read.notify();
        Ok(())
    }

    /// 中止并等待线程退出；线程退出前会关闭全部解码器
    pub fn close(&mut self) {
        self.shared.request_abort();
        if let Some(handle) = self.thread_handle.take() {
            info!("{} 🛑 等待解复用线程退出", log_ctx());
            if handle.join().is_err() {
                error!("{} ❌ 解复用线程 panic", log_ctx());
            }
        }
    }

    /// 中止但不等待（打开超时时使用，阻塞的 IO 返回后线程自行清理）
    pub fn detach(mut self) {
        self.shared.request_abort();
        if self.thread_handle.take().is_some() {
            warn!("{} ⚠ 解复用线程已分离", log_ctx());
        }
    }
}

impl Drop for StreamDemuxer {
    fn drop(&mut self) {
        self.close();
    }
}

// ============= 线程内部 =============

struct DemuxLoop {
    shared: Arc<PlayerShared>,
    source: Box<dyn MediaSource>,
    sinks: Arc<dyn AudioSinkFactory>,
    commands: Receiver<DemuxCommand>,
    video: Option<DecoderHandle>,
    audio: Option<DecoderHandle>,
    subtitle: Option<DecoderHandle>,
    /// 每类流最近一次打开的流，循环切换从这里开始
    last_video: Option<usize>,
    last_audio: Option<usize>,
    last_subtitle: Option<usize>,
    last_paused: bool,
    read_failed: bool,
    packets_read: u64,
}

impl DemuxLoop {
    fn new(
        shared: Arc<PlayerShared>,
        source: Box<dyn MediaSource>,
        sinks: Arc<dyn AudioSinkFactory>,
        commands: Receiver<DemuxCommand>,
    ) -> Self {
        Self {
            shared,
            source,
            sinks,
            commands,
            video: None,
            audio: None,
            subtitle: None,
            last_video: None,
            last_audio: None,
            last_subtitle: None,
            last_paused: false,
            read_failed: false,
            packets_read: 0,
        }
    }

    /// 记录流信息、执行起始 seek、打开默认流
    fn prepare(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        shared.set_streams(self.source.streams().to_vec());
        shared.set_source_properties(
            self.source.duration(),
            self.source.is_realtime(),
            self.source.has_ts_discontinuity(),
            self.source.prefers_byte_seek(),
            self.source.bit_rate(),
        );
        shared.set_eof(false);

        if let Some(start) = shared.config.start_time {
            let target = start + self.source.start_time().unwrap_or(0.0);
            if let Err(e) = self.source.seek(SeekTarget::Time(target)) {
                warn!("{} 无法 seek 到起始位置 {:.3}: {}", log_ctx(), target, e);
            }
        }

        let video = self.source.best_stream(MediaKind::Video, None);
        let audio = self.source.best_stream(MediaKind::Audio, video);
        let subtitle = self
            .source
            .best_stream(MediaKind::Subtitle, audio.or(video));
        debug!(
            "{} 默认流: video={:?} audio={:?} subtitle={:?}",
            log_ctx(),
            video,
            audio,
            subtitle
        );

        if let Some(index) = audio {
            let _ = self.component_open(index);
        }
        if let Some(index) = video {
            let _ = self.component_open(index);
        }
        if let Some(index) = subtitle {
            let _ = self.component_open(index);
        }

        if shared.active_stream(MediaKind::Video).is_none()
            && shared.active_stream(MediaKind::Audio).is_none()
        {
            return Err(PlayerError::OpenFailure(format!(
                "没有可播放的音视频流: {}",
                self.source.description()
            )));
        }

        info!("{} 🎬 解复用线程就绪: {}", log_ctx(), self.source.description());
        shared.notify_loaded();
        Ok(())
    }

    fn run(&mut self) {
        let shared = Arc::clone(&self.shared);
        loop {
            if shared.abort_requested() {
                break;
            }
            self.handle_commands();

            let paused = shared.is_paused();
            if paused != self.last_paused {
                self.last_paused = paused;
                if paused {
                    self.source.read_pause();
                } else {
                    self.source.read_play();
                }
            }

            if let Some(request) = shared.take_seek_request() {
                self.handle_seek(request);
            }
            if shared.take_attachments_request() {
                self.queue_attachments();
            }

            if !shared.infinite_buffer() && shared.streams_have_enough_packets() {
                shared.continue_read.wait(READ_WAIT);
                continue;
            }

            if !shared.is_paused() && shared.reached_eof() {
                info!("{} 📄 播放到达结尾，自动暂停", log_ctx());
                shared.set_step(false);
                shared.pause_toggle();
                shared.notify_state();
            }

            if self.read_failed {
                shared.continue_read.wait(READ_WAIT);
                continue;
            }

            match self.source.read_packet() {
                ReadOutcome::Packet(packet) => {
                    shared.set_eof(false);
                    shared.set_read_pos(packet.pos);
                    self.packets_read += 1;
                    self.dispatch(packet);
                }
                ReadOutcome::Eof => {
                    if !shared.eof() {
                        info!(
                            "{} 📄 输入结束（共读取 {} 个包）",
                            log_ctx(),
                            self.packets_read
                        );
                        self.queue_end_of_input();
                    }
                    shared.continue_read.wait(READ_WAIT);
                }
                ReadOutcome::Again => shared.continue_read.wait(READ_WAIT),
                ReadOutcome::Failure(message) => {
                    error!("{} ❌ 读取包失败: {}", log_ctx(), message);
                    if !shared.eof() {
                        self.queue_end_of_input();
                    }
                    shared.report_error(&PlayerError::DecodeFailure(message));
                    self.read_failed = true;
                }
            }
        }
        info!(
            "{} 🛑 解复用循环退出（共读取 {} 个包）",
            log_ctx(),
            self.packets_read
        );
    }

    /// 关闭全部流（音频、视频、字幕）并通知状态
    fn shutdown(&mut self) {
        self.component_close(MediaKind::Audio);
        self.component_close(MediaKind::Video);
        self.component_close(MediaKind::Subtitle);
        self.shared.notify_state();
        info!("{} 🛑 解复用线程退出: {}", log_ctx(), self.source.description());
    }

    fn dispatch(&mut self, packet: Packet) {
        let shared = &self.shared;
        let index = packet.stream_index;
        if shared.active_stream(MediaKind::Audio) == Some(index) {
            shared.audio_pq.put(packet);
        } else if shared.active_stream(MediaKind::Video) == Some(index)
            && !shared.stream(index).is_some_and(|s| s.attached_pic)
        {
            shared.video_pq.put(packet);
        } else if shared.active_stream(MediaKind::Subtitle) == Some(index) {
            shared.subtitle_pq.put(packet);
        } else {
            trace!("丢弃未选中流的数据包 #{}", index);
        }
    }

    /// 每条活动流放一个空包，让解码器排空
    fn queue_end_of_input(&self) {
        for kind in [MediaKind::Video, MediaKind::Audio, MediaKind::Subtitle] {
            if let (Some(index), Some(queue)) =
                (self.shared.active_stream(kind), self.shared.packet_queue(kind))
            {
                queue.put_null(index);
            }
        }
        self.shared.set_eof(true);
    }

    fn handle_seek(&mut self, request: SeekRequest) {
        let shared = Arc::clone(&self.shared);
        let seek_seconds = match request.target {
            SeekTarget::Time(seconds) => seconds,
            SeekTarget::Bytes(_) => 0.0,
        };
        info!("{} ⏩ 执行 seek: {:?}", log_ctx(), request.target);
        // seek 只能落到关键帧，之后由解码器丢弃目标之前的帧
        shared.set_seek_decoder(seek_seconds);
        match self.source.seek(request.target) {
            Ok(()) => {
                for kind in [MediaKind::Audio, MediaKind::Subtitle, MediaKind::Video] {
                    if shared.active_stream(kind).is_some() {
                        if let Some(queue) = shared.packet_queue(kind) {
                            queue.flush();
                            queue.put_flush();
                        }
                    }
                }
                match request.target {
                    SeekTarget::Time(seconds) => shared.ext_clk.set(seconds, 0),
                    SeekTarget::Bytes(_) => shared.ext_clk.set(f64::NAN, 0),
                }
                shared.vid_clk.set(f64::NAN, 0);
                shared.aud_clk.set(f64::NAN, 0);
                self.read_failed = false;
            }
            Err(e) => {
                shared.set_seek_decoder(0.0);
                error!("{} ❌ seek 失败: {}", log_ctx(), e);
            }
        }
        shared.request_attachments();
        shared.set_eof(false);
        if shared.is_paused() {
            shared.step_frame();
        }
    }

    fn queue_attachments(&self) {
        let Some(index) = self.shared.active_stream(MediaKind::Video) else {
            return;
        };
        if !self.shared.stream(index).is_some_and(|s| s.attached_pic) {
            return;
        }
        if let Some(picture) = self.source.attached_picture(index) {
            debug!("{} 🖼 放入封面图片 #{}", log_ctx(), index);
            self.shared.video_pq.put(picture);
            self.shared.video_pq.put_null(index);
        }
    }

    fn handle_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(DemuxCommand::SelectStream(kind, index)) => self.select_stream(kind, index),
                Ok(DemuxCommand::CycleStream(kind)) => self.cycle_stream(kind),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn select_stream(&mut self, kind: MediaKind, index: Option<usize>) {
        let old = self.shared.active_stream(kind);
        info!(
            "{} 🔀 切换 {} 流 #{:?} -> #{:?}",
            log_ctx(),
            kind.as_str(),
            old,
            index
        );
        self.component_close(kind);
        if let Some(index) = index {
            let _ = self.component_open(index);
        }
        self.shared.notify_stream_changed(kind);
    }

    fn last_stream(&self, kind: MediaKind) -> Option<usize> {
        match kind {
            MediaKind::Video => self.last_video,
            MediaKind::Audio => self.last_audio,
            MediaKind::Subtitle => self.last_subtitle,
            MediaKind::Data => None,
        }
    }

    fn set_last_stream(&mut self, kind: MediaKind, index: Option<usize>) {
        match kind {
            MediaKind::Video => self.last_video = index,
            MediaKind::Audio => self.last_audio = index,
            MediaKind::Subtitle => self.last_subtitle = index,
            MediaKind::Data => {}
        }
    }

    /// 从上次打开的流开始找下一条可用的同类流；字幕越过末尾时关闭
    fn next_stream(&mut self, kind: MediaKind) -> Option<Option<usize>> {
        let shared = Arc::clone(&self.shared);
        let streams = shared.streams();
        let count = streams.len() as i64;
        let start = self.last_stream(kind).map(|i| i as i64).unwrap_or(-1);
        let mut index = start;
        loop {
            index += 1;
            if index >= count {
                if kind == MediaKind::Subtitle {
                    self.set_last_stream(kind, None);
                    return Some(None);
                }
                if start == -1 {
                    return None;
                }
                index = 0;
            }
            if index == start {
                return None;
            }
            let stream = &streams[index as usize];
            if stream.kind != kind {
                continue;
            }
            let usable = match kind {
                MediaKind::Audio => stream.sample_rate != 0 && stream.channels != 0,
                MediaKind::Video => true,
                MediaKind::Subtitle => stream.text_subtitle,
                MediaKind::Data => false,
            };
            if usable {
                return Some(Some(index as usize));
            }
        }
    }

    fn cycle_stream(&mut self, kind: MediaKind) {
        match self.next_stream(kind) {
            Some(target) => self.select_stream(kind, target),
            None => debug!("{} 没有可切换的 {} 流", log_ctx(), kind.as_str()),
        }
    }

    fn handle_slot(&mut self, kind: MediaKind) -> Option<&mut Option<DecoderHandle>> {
        match kind {
            MediaKind::Video => Some(&mut self.video),
            MediaKind::Audio => Some(&mut self.audio),
            MediaKind::Subtitle => Some(&mut self.subtitle),
            MediaKind::Data => None,
        }
    }

    /// 打开一条流；失败只影响这条流并上报
    fn component_open(&mut self, index: usize) -> Result<()> {
        let result = self.try_component_open(index);
        if let Err(e) = &result {
            warn!("{} ⚠ 打开流 #{} 失败: {}", log_ctx(), index, e);
            self.shared.report_error(e);
        }
        result
    }

    fn try_component_open(&mut self, index: usize) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let info = shared
            .stream(index)
            .cloned()
            .ok_or_else(|| PlayerError::InvalidStream(format!("流 #{} 不存在", index)))?;
        self.set_last_stream(info.kind, Some(index));

        let decoder = match info.kind {
            MediaKind::Audio => {
                let codec = self.source.open_audio_codec(index)?;
                let wanted = AudioSpec::new(
                    shared.config.audio_sample_rate,
                    shared.config.audio_channels,
                );
                let sink = self.sinks.open(wanted)?;
                sink.set_gain(shared.gain());
                sink.set_pitch(shared.speed());
                sink.pause();
                shared.set_audio_sink(Some(Arc::clone(&sink)));
                StreamDecoder::Audio(AudioDecoder::new(codec, sink, Arc::clone(&shared)))
            }
            MediaKind::Video => {
                let codec = self.source.open_video_codec(index)?;
                StreamDecoder::Video(VideoDecoder::new(codec, &info, Arc::clone(&shared)))
            }
            MediaKind::Subtitle => {
                let codec = self.source.open_subtitle_codec(index)?;
                StreamDecoder::Subtitle(SubtitleDecoder::new(codec, Arc::clone(&shared)))
            }
            MediaKind::Data => {
                return Err(PlayerError::InvalidStream(format!(
                    "流 #{} 不是音视频或字幕流",
                    index
                )))
            }
        };

        shared.set_eof(false);
        shared.set_active_stream(info.kind, Some(index));
        let handle = match decoder.spawn(Arc::clone(&shared)) {
            Ok(handle) => handle,
            Err(e) => {
                shared.set_active_stream(info.kind, None);
                if info.kind == MediaKind::Audio {
                    shared.set_audio_sink(None);
                }
                return Err(e);
            }
        };
        if info.kind == MediaKind::Video {
            shared.request_attachments();
        }
        if let Some(slot) = self.handle_slot(info.kind) {
            *slot = Some(handle);
        }
        info!(
            "{} ✅ 已打开 {} 流 #{} [{}]",
            log_ctx(),
            info.kind.as_str(),
            index,
            info.codec_name
        );
        Ok(())
    }

    /// 中止 → 等待线程 → 清空队列 → 释放解码器；音频再关闭输出设备
    fn component_close(&mut self, kind: MediaKind) {
        let handle = self.handle_slot(kind).and_then(|slot| slot.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        if kind == MediaKind::Audio {
            if let Some(sink) = self.shared.audio_sink() {
                sink.pause();
                sink.flush();
            }
            self.shared.set_audio_sink(None);
        }
        self.shared.set_active_stream(kind, None);
    }
}

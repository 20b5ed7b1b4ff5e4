use crate::core::{
    now_secs, MediaKind, PlaybackClock, PlaybackState, PlayerConfig, PlayerError, PlayerEvent,
    PlayerStats, StreamInfo, SubtitleEvent, SyncMaster, VideoPicture,
};
use crate::player::audio_output::AudioSink;
use crate::player::demuxer_source::SeekTarget;
use crate::player::frame_queue::{FrameQueue, SUBPICTURE_QUEUE_SIZE, VIDEO_PICTURE_QUEUE_SIZE};
use crate::player::packet_queue::PacketQueue;
use crossbeam::atomic::AtomicCell;
use crossbeam_channel::Sender;
use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

pub const EXTERNAL_CLOCK_MIN_FRAMES: usize = 2;
pub const EXTERNAL_CLOCK_MAX_FRAMES: usize = 10;
pub const EXTERNAL_CLOCK_SPEED_MIN: f64 = 0.900;
pub const EXTERNAL_CLOCK_SPEED_MAX: f64 = 1.010;
pub const EXTERNAL_CLOCK_SPEED_STEP: f64 = 0.001;

/// 按字节 seek 且码率未知时使用的估计码率（字节/秒）
const FALLBACK_BYTES_PER_SEC: f64 = 180_000.0;

/// 解码线程通知解复用线程继续读取
#[derive(Default)]
pub struct ReadSignal {
    lock: Mutex<()>,
    cond: Condvar,
}

impl ReadSignal {
    pub fn notify(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_one();
    }

    pub fn wait(&self, timeout: Duration) {
        let mut guard = self.lock.lock();
        let _ = self.cond.wait_for(&mut guard, timeout);
    }
}

/// 挂起的 seek 请求（单槽位，后来者覆盖）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekRequest {
    pub target: SeekTarget,
}

/// 一次会话的共享状态（VideoState）
///
/// 每个字段只有一个写线程，注释中标明；有两个写者的字段单独加锁或用原子量。
/// 跨线程的阻塞只发生在包队列和帧队列上。
pub struct PlayerShared {
    /// 只读
    pub config: PlayerConfig,

    pub video_pq: Arc<PacketQueue>,
    pub audio_pq: Arc<PacketQueue>,
    pub subtitle_pq: Arc<PacketQueue>,
    /// 写：视频解码线程；读：渲染线程
    pub video_fq: Arc<FrameQueue<VideoPicture>>,
    /// 写：字幕解码线程；读：渲染线程
    pub subtitle_fq: Arc<FrameQueue<SubtitleEvent>>,

    pub vid_clk: PlaybackClock,
    pub aud_clk: PlaybackClock,
    pub ext_clk: PlaybackClock,

    pub continue_read: Arc<ReadSignal>,

    /// 写：解复用线程（打开时一次）
    streams: OnceLock<Vec<StreamInfo>>,
    container_duration: AtomicCell<f64>,
    realtime: AtomicBool,
    seek_by_bytes: AtomicBool,
    infinite_buffer: AtomicBool,
    max_frame_duration: AtomicCell<f64>,
    bit_rate: AtomicI64,

    /// 写：解复用线程（打开/切换流）
    video_stream: AtomicI64,
    audio_stream: AtomicI64,
    subtitle_stream: AtomicI64,
    audio_sink: Mutex<Option<Arc<dyn AudioSink>>>,

    /// 写：调用方 close 或设备失败
    abort_request: Arc<AtomicBool>,

    /// 暂停/单步相关字段由调用方、解复用线程（EOF 自动暂停）、渲染线程（单步完成）
    /// 三方修改，统一在 `transport` 锁内写
    transport: Mutex<()>,
    paused: AtomicBool,
    step: AtomicBool,
    frame_timer: Mutex<f64>,
    force_refresh: AtomicBool,

    /// 写：调用方；取走：解复用线程
    seek_request: Mutex<Option<SeekRequest>>,
    /// 写：调用方
    seek_pos: AtomicCell<f64>,
    /// 写：解复用线程
    seek_decoder: AtomicCell<f64>,
    queue_attachments: AtomicBool,
    eof: AtomicBool,
    read_pos: AtomicI64,

    /// 写：各自的解码线程
    pub video_finished: Arc<AtomicI64>,
    pub audio_finished: Arc<AtomicI64>,
    pub subtitle_finished: Arc<AtomicI64>,
    frame_drops_early: AtomicU64,
    /// 写：渲染线程
    frame_drops_late: AtomicU64,

    /// 写：调用方
    volume: AtomicCell<f64>,
    muted: AtomicBool,
    speed: AtomicCell<f64>,

    events: Sender<PlayerEvent>,
}

impl PlayerShared {
    pub fn new(config: PlayerConfig, events: Sender<PlayerEvent>) -> Self {
        let video_pq = Arc::new(PacketQueue::new());
        let audio_pq = Arc::new(PacketQueue::new());
        let subtitle_pq = Arc::new(PacketQueue::new());

        let video_fq = Arc::new(FrameQueue::new(
            Arc::clone(&video_pq),
            VIDEO_PICTURE_QUEUE_SIZE,
            true,
        ));
        let subtitle_fq = Arc::new(FrameQueue::new(
            Arc::clone(&subtitle_pq),
            SUBPICTURE_QUEUE_SIZE,
            false,
        ));

        let vid_clk = PlaybackClock::new(Some(video_pq.serial_handle()));
        let aud_clk = PlaybackClock::new(Some(audio_pq.serial_handle()));
        let ext_clk = PlaybackClock::new(None);

        let volume = config.volume;
        let muted = config.muted;

        Self {
            config,
            video_pq,
            audio_pq,
            subtitle_pq,
            video_fq,
            subtitle_fq,
            vid_clk,
            aud_clk,
            ext_clk,
            continue_read: Arc::new(ReadSignal::default()),
            streams: OnceLock::new(),
            container_duration: AtomicCell::new(f64::NAN),
            realtime: AtomicBool::new(false),
            seek_by_bytes: AtomicBool::new(false),
            infinite_buffer: AtomicBool::new(false),
            max_frame_duration: AtomicCell::new(3600.0),
            bit_rate: AtomicI64::new(0),
            video_stream: AtomicI64::new(-1),
            audio_stream: AtomicI64::new(-1),
            subtitle_stream: AtomicI64::new(-1),
            audio_sink: Mutex::new(None),
            abort_request: Arc::new(AtomicBool::new(false)),
            transport: Mutex::new(()),
            paused: AtomicBool::new(false),
            step: AtomicBool::new(false),
            frame_timer: Mutex::new(0.0),
            force_refresh: AtomicBool::new(false),
            seek_request: Mutex::new(None),
            seek_pos: AtomicCell::new(0.0),
            seek_decoder: AtomicCell::new(0.0),
            queue_attachments: AtomicBool::new(false),
            eof: AtomicBool::new(false),
            read_pos: AtomicI64::new(-1),
            video_finished: Arc::new(AtomicI64::new(0)),
            audio_finished: Arc::new(AtomicI64::new(0)),
            subtitle_finished: Arc::new(AtomicI64::new(0)),
            frame_drops_early: AtomicU64::new(0),
            frame_drops_late: AtomicU64::new(0),
            volume: AtomicCell::new(volume),
            muted: AtomicBool::new(muted),
            speed: AtomicCell::new(1.0),
            events,
        }
    }

    // ============= 流信息 =============

    pub fn set_streams(&self, streams: Vec<StreamInfo>) {
        let _ = self.streams.set(streams);
    }

    pub fn streams(&self) -> &[StreamInfo] {
        self.streams.get().map(|s| s.as_slice()).unwrap_or(&[])
    }

    pub fn stream(&self, index: usize) -> Option<&StreamInfo> {
        self.streams().get(index)
    }

    pub fn set_source_properties(
        &self,
        container_duration: Option<f64>,
        realtime: bool,
        ts_discontinuity: bool,
        byte_seek_hint: bool,
        bit_rate: i64,
    ) {
        self.container_duration
            .store(container_duration.unwrap_or(f64::NAN));
        self.realtime.store(realtime, Ordering::Release);
        self.seek_by_bytes.store(
            self.config.seek_by_bytes.unwrap_or(byte_seek_hint),
            Ordering::Release,
        );
        self.infinite_buffer.store(
            self.config.infinite_buffer.unwrap_or(realtime),
            Ordering::Release,
        );
        self.max_frame_duration
            .store(if ts_discontinuity { 10.0 } else { 3600.0 });
        self.bit_rate.store(bit_rate, Ordering::Release);
    }

    pub fn is_realtime(&self) -> bool {
        self.realtime.load(Ordering::Acquire)
    }

    pub fn seek_by_bytes(&self) -> bool {
        self.seek_by_bytes.load(Ordering::Acquire)
    }

    pub fn infinite_buffer(&self) -> bool {
        self.infinite_buffer.load(Ordering::Acquire)
    }

    pub fn max_frame_duration(&self) -> f64 {
        self.max_frame_duration.load()
    }

    fn stream_slot(&self, kind: MediaKind) -> Option<&AtomicI64> {
        match kind {
            MediaKind::Video => Some(&self.video_stream),
            MediaKind::Audio => Some(&self.audio_stream),
            MediaKind::Subtitle => Some(&self.subtitle_stream),
            MediaKind::Data => None,
        }
    }

    pub fn active_stream(&self, kind: MediaKind) -> Option<usize> {
        self.stream_slot(kind)
            .map(|slot| slot.load(Ordering::Acquire))
            .filter(|index| *index >= 0)
            .map(|index| index as usize)
    }

    pub fn set_active_stream(&self, kind: MediaKind, index: Option<usize>) {
        if let Some(slot) = self.stream_slot(kind) {
            slot.store(index.map(|i| i as i64).unwrap_or(-1), Ordering::Release);
        }
    }

    pub fn packet_queue(&self, kind: MediaKind) -> Option<&Arc<PacketQueue>> {
        match kind {
            MediaKind::Video => Some(&self.video_pq),
            MediaKind::Audio => Some(&self.audio_pq),
            MediaKind::Subtitle => Some(&self.subtitle_pq),
            MediaKind::Data => None,
        }
    }

    /// 某类流中第 n 个（只计入列表中可见的流）
    pub fn relative_stream_index(&self, kind: MediaKind, absolute: usize) -> Option<usize> {
        self.streams()
            .iter()
            .filter(|s| s.kind == kind && s.is_listed())
            .position(|s| s.index == absolute)
    }

    pub fn absolute_stream_index(&self, kind: MediaKind, relative: usize) -> Option<usize> {
        self.streams()
            .iter()
            .filter(|s| s.kind == kind && s.is_listed())
            .nth(relative)
            .map(|s| s.index)
    }

    pub fn stream_names(&self, kind: MediaKind) -> Vec<String> {
        self.streams()
            .iter()
            .filter(|s| s.kind == kind && s.is_listed())
            .enumerate()
            .map(|(n, s)| s.display_name(n + 1))
            .collect()
    }

    // ============= 音频输出 =============

    pub fn set_audio_sink(&self, sink: Option<Arc<dyn AudioSink>>) {
        *self.audio_sink.lock() = sink;
    }

    pub fn audio_sink(&self) -> Option<Arc<dyn AudioSink>> {
        self.audio_sink.lock().clone()
    }

    /// 静音时增益为 0
    pub fn gain(&self) -> f64 {
        if self.muted.load(Ordering::Acquire) {
            0.0
        } else {
            self.volume.load()
        }
    }

    pub fn volume(&self) -> f64 {
        self.volume.load()
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn set_volume(&self, volume: f64) {
        self.volume.store(volume.max(0.0));
        self.apply_gain();
        self.emit(PlayerEvent::VolumeChanged(self.volume()));
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
        self.apply_gain();
        self.emit(PlayerEvent::MuteChanged(muted));
    }

    fn apply_gain(&self) {
        if let Some(sink) = self.audio_sink() {
            sink.set_gain(self.gain());
        }
    }

    pub fn speed(&self) -> f64 {
        match self.audio_sink() {
            Some(sink) => sink.pitch(),
            None => self.speed.load(),
        }
    }

    /// 调整音频音高，主时钟跟随
    pub fn set_speed(&self, speed: f64) {
        self.speed.store(speed);
        if let Some(sink) = self.audio_sink() {
            sink.set_pitch(speed);
        }
        self.notify_speed();
    }

    pub fn notify_speed(&self) {
        let speed = self.speed();
        self.master_clock().set_speed(speed);
        self.emit(PlayerEvent::SpeedChanged(speed));
    }

    // ============= 主时钟 =============

    pub fn master_sync_type(&self) -> SyncMaster {
        match self.config.sync_master {
            SyncMaster::Video => {
                if self.active_stream(MediaKind::Video).is_some() {
                    SyncMaster::Video
                } else {
                    SyncMaster::Audio
                }
            }
            SyncMaster::Audio => {
                if self.active_stream(MediaKind::Audio).is_some() {
                    SyncMaster::Audio
                } else {
                    SyncMaster::External
                }
            }
            SyncMaster::External => SyncMaster::External,
        }
    }

    pub fn master_clock(&self) -> &PlaybackClock {
        match self.master_sync_type() {
            SyncMaster::Video => &self.vid_clk,
            SyncMaster::Audio => &self.aud_clk,
            SyncMaster::External => &self.ext_clk,
        }
    }

    pub fn master_time(&self) -> f64 {
        self.master_clock().get()
    }

    pub fn master_time_at(&self, time: f64) -> f64 {
        self.master_clock().get_at(time)
    }

    pub fn framedrop_enabled(&self) -> bool {
        self.config
            .framedrop
            .enabled(self.master_sync_type() == SyncMaster::Video)
    }

    /// 实时流：按包队列水位微调外部时钟速度
    pub fn check_external_clock_speed(&self) {
        let video = self.active_stream(MediaKind::Video).is_some();
        let audio = self.active_stream(MediaKind::Audio).is_some();
        let video_packets = self.video_pq.nb_packets();
        let audio_packets = self.audio_pq.nb_packets();

        if (video && video_packets <= EXTERNAL_CLOCK_MIN_FRAMES)
            || (audio && audio_packets <= EXTERNAL_CLOCK_MIN_FRAMES)
        {
            let speed = self.ext_clk.speed() - EXTERNAL_CLOCK_SPEED_STEP;
            self.ext_clk.set_speed(speed.max(EXTERNAL_CLOCK_SPEED_MIN));
        } else if (!video || video_packets > EXTERNAL_CLOCK_MAX_FRAMES)
            && (!audio || audio_packets > EXTERNAL_CLOCK_MAX_FRAMES)
        {
            let speed = self.ext_clk.speed() + EXTERNAL_CLOCK_SPEED_STEP;
            self.ext_clk.set_speed(speed.min(EXTERNAL_CLOCK_SPEED_MAX));
        } else {
            let speed = self.ext_clk.speed();
            if speed != 1.0 {
                let step = EXTERNAL_CLOCK_SPEED_STEP * (1.0 - speed) / (1.0 - speed).abs();
                self.ext_clk.set_speed(speed + step);
            }
        }
    }

    // ============= 背压与 EOF =============

    fn stream_has_enough_packets(&self, kind: MediaKind) -> bool {
        let Some(index) = self.active_stream(kind) else {
            return true;
        };
        let Some(queue) = self.packet_queue(kind) else {
            return true;
        };
        let Some(info) = self.stream(index) else {
            return true;
        };
        if queue.is_aborted() || info.attached_pic {
            return true;
        }
        let duration = queue.duration();
        queue.nb_packets() > self.config.min_frames
            && (duration == 0 || info.time_base.to_f64() * duration as f64 > 1.0)
    }

    pub fn streams_have_enough_packets(&self) -> bool {
        let total = self.video_pq.size() + self.audio_pq.size() + self.subtitle_pq.size();
        total > self.config.max_queue_bytes
            || (self.stream_has_enough_packets(MediaKind::Audio)
                && self.stream_has_enough_packets(MediaKind::Video)
                && self.stream_has_enough_packets(MediaKind::Subtitle))
    }

    /// 所有活动解码器都已在当前序号上结束，且视频帧已显示完
    pub fn reached_eof(&self) -> bool {
        let audio_done = self.active_stream(MediaKind::Audio).is_none()
            || self.audio_finished.load(Ordering::Acquire) == self.audio_pq.serial();
        let video_done = self.active_stream(MediaKind::Video).is_none()
            || (self.video_finished.load(Ordering::Acquire) == self.video_pq.serial()
                && self.video_fq.nb_remaining() == 0);
        audio_done && video_done
    }

    pub fn set_eof(&self, eof: bool) {
        self.eof.store(eof, Ordering::Release);
    }

    pub fn eof(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }

    pub fn set_read_pos(&self, pos: i64) {
        if pos >= 0 {
            self.read_pos.store(pos, Ordering::Release);
        }
    }

    // ============= 传输控制 =============

    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort_request)
    }

    pub fn request_abort(&self) {
        self.abort_request.store(true, Ordering::Release);
        self.continue_read.notify();
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_request.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_stepping(&self) -> bool {
        self.step.load(Ordering::Acquire)
    }

    pub fn set_step(&self, step: bool) {
        let _guard = self.transport.lock();
        self.step.store(step, Ordering::Release);
    }

    pub fn frame_timer(&self) -> f64 {
        *self.frame_timer.lock()
    }

    pub fn set_frame_timer(&self, value: f64) {
        *self.frame_timer.lock() = value;
    }

    pub fn force_refresh(&self) -> bool {
        self.force_refresh.load(Ordering::Acquire)
    }

    pub fn set_force_refresh(&self, value: bool) {
        self.force_refresh.store(value, Ordering::Release);
    }

    /// 切换暂停；恢复时把暂停期间流逝的时间补进帧定时器
    pub fn pause_toggle(&self) {
        let _guard = self.transport.lock();
        let sink = self.audio_sink();
        let paused = self.paused.load(Ordering::Acquire);
        if paused {
            {
                let mut frame_timer = self.frame_timer.lock();
                *frame_timer += now_secs() - self.vid_clk.last_updated();
            }
            self.vid_clk.set(self.vid_clk.get(), self.vid_clk.serial());
            if let Some(sink) = &sink {
                sink.play();
            }
        } else if let Some(sink) = &sink {
            sink.pause();
        }
        self.ext_clk.set(self.ext_clk.get(), self.ext_clk.serial());
        let paused = !paused;
        self.paused.store(paused, Ordering::Release);
        self.aud_clk.set_paused(paused);
        self.vid_clk.set_paused(paused);
        self.ext_clk.set_paused(paused);
        debug!("⏯ 暂停状态切换: paused={}", paused);
    }

    /// 单步：暂停中先恢复，显示一帧后由渲染线程重新暂停
    pub fn step_frame(&self) {
        if self.is_paused() {
            self.pause_toggle();
        }
        self.set_step(true);
    }

    /// 记录 seek 请求（后来者覆盖），唤醒解复用线程
    pub fn request_seek(&self, seconds: f64) {
        let target = if self.seek_by_bytes() {
            let bit_rate = self.bit_rate.load(Ordering::Acquire);
            let bytes_per_sec = if bit_rate > 0 {
                bit_rate as f64 / 8.0
            } else {
                FALLBACK_BYTES_PER_SEC
            };
            SeekTarget::Bytes((seconds * bytes_per_sec) as i64)
        } else {
            SeekTarget::Time(seconds)
        };
        self.request_seek_target(target, seconds);
    }

    pub fn request_seek_target(&self, target: SeekTarget, seconds: f64) {
        self.seek_pos.store(seconds);
        *self.seek_request.lock() = Some(SeekRequest { target });
        if let Some(sink) = self.audio_sink() {
            sink.flush();
        }
        self.continue_read.notify();
        info!("⏩ 请求 seek: {:?}", target);
    }

    /// 按字节相对 seek 时的起点：已显示视频帧的位置，退化为最近读到的包位置
    pub fn current_byte_pos(&self) -> i64 {
        let pos = self.video_fq.last_pos();
        if pos >= 0 {
            pos
        } else {
            self.read_pos.load(Ordering::Acquire)
        }
    }

    pub fn bytes_per_sec(&self) -> f64 {
        let bit_rate = self.bit_rate.load(Ordering::Acquire);
        if bit_rate > 0 {
            bit_rate as f64 / 8.0
        } else {
            FALLBACK_BYTES_PER_SEC
        }
    }

    pub fn take_seek_request(&self) -> Option<SeekRequest> {
        self.seek_request.lock().take()
    }

    pub fn seek_decoder(&self) -> f64 {
        self.seek_decoder.load()
    }

    pub fn set_seek_decoder(&self, value: f64) {
        self.seek_decoder.store(value);
    }

    pub fn request_attachments(&self) {
        self.queue_attachments.store(true, Ordering::Release);
    }

    pub fn take_attachments_request(&self) -> bool {
        self.queue_attachments.swap(false, Ordering::AcqRel)
    }

    /// 当前位置：主时钟，不可用时为最后一次 seek 的目标
    pub fn position(&self) -> f64 {
        let pos = self.master_time();
        if pos.is_nan() {
            self.seek_pos.load()
        } else {
            pos
        }
    }

    /// 流时长与容器时长取较大者
    pub fn duration(&self) -> f64 {
        let stream = self
            .active_stream(MediaKind::Audio)
            .or_else(|| self.active_stream(MediaKind::Video))
            .and_then(|index| self.stream(index))
            .and_then(|info| info.duration_secs())
            .unwrap_or(0.0);
        let container = self.container_duration.load();
        let container = if container.is_nan() { 0.0 } else { container };
        stream.max(container)
    }

    // ============= 统计 =============

    pub fn count_early_drop(&self) {
        self.frame_drops_early.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_late_drop(&self) {
        self.frame_drops_late.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PlayerStats {
        PlayerStats {
            frame_drops_early: self.frame_drops_early.load(Ordering::Relaxed),
            frame_drops_late: self.frame_drops_late.load(Ordering::Relaxed),
            video_packets: self.video_pq.nb_packets(),
            audio_packets: self.audio_pq.nb_packets(),
            subtitle_packets: self.subtitle_pq.nb_packets(),
            queued_bytes: self.video_pq.size() + self.audio_pq.size() + self.subtitle_pq.size(),
            video_frames: self.video_fq.nb_remaining(),
            audio_queued_bytes: self.audio_sink().map(|s| s.queued_bytes()).unwrap_or(0),
            av_diff: self.aud_clk.get() - self.vid_clk.get(),
        }
    }

    // ============= 通知 =============

    pub fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }

    pub fn playback_state(&self) -> PlaybackState {
        if self.abort_requested() {
            PlaybackState::Stopped
        } else if self.is_paused() || self.is_stepping() {
            PlaybackState::Paused
        } else {
            PlaybackState::Playing
        }
    }

    pub fn notify_state(&self) {
        self.emit(PlayerEvent::StateChanged(self.playback_state()));
    }

    pub fn notify_loaded(&self) {
        let duration = self.duration();
        self.emit(PlayerEvent::Opened {
            duration,
            video_streams: self.stream_names(MediaKind::Video),
            audio_streams: self.stream_names(MediaKind::Audio),
            subtitle_streams: self.stream_names(MediaKind::Subtitle),
        });
        self.emit(PlayerEvent::DurationChanged(duration));
        self.notify_speed();
        self.emit(PlayerEvent::VolumeChanged(self.volume()));
        self.emit(PlayerEvent::MuteChanged(self.muted()));
        self.notify_state();
    }

    pub fn notify_stream_changed(&self, kind: MediaKind) {
        let active = self
            .active_stream(kind)
            .and_then(|index| self.relative_stream_index(kind, index))
            .map(|n| n as i32)
            .unwrap_or(-1);
        self.emit(PlayerEvent::StreamChanged { kind, active });
    }

    pub fn report_error(&self, err: &PlayerError) {
        if err.is_abort() {
            return;
        }
        self.emit(PlayerEvent::Error {
            code: err.code(),
            message: err.to_string(),
        });
    }

    /// 整个会话失败：上报一次并停止
    pub fn fail(&self, err: PlayerError) {
        if self.abort_requested() {
            return;
        }
        error!("❌ 播放会话失败: {}", err);
        self.report_error(&err);
        self.request_abort();
        self.notify_state();
    }
}

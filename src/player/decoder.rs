use crate::core::{
    now_secs, AudioBuffer, Frame, MediaKind, PacketKind, PlayerError, Rational, Result,
    StreamInfo, SubtitleEvent, SyncMaster, VideoPicture, AV_NOSYNC_THRESHOLD,
};
use crate::player::audio_output::AudioSink;
use crate::player::demuxer_source::{
    AudioCodec, AudioDecode, Codec, Decoded, Feed, SubtitleCodec, VideoCodec,
};
use crate::player::packet_queue::{PacketGet, PacketQueue};
use crate::player::state::{PlayerShared, ReadSignal};
use crate::player::log_ctx;
use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// 连续解码失败超过该次数后放弃这条流
pub const MAX_CONSECUTIVE_DECODE_ERRORS: u32 = 16;

/// 音频输出的最小缓冲（字节），决定等待输出端时的轮询间隔
pub const AUDIO_MIN_BUFFER_SIZE: usize = 512;
pub const AUDIO_DIFF_AVG_NB: u32 = 20;
pub const SAMPLE_CORRECTION_PERCENT_MAX: usize = 10;

/// `Decoder::decode_frame` 的结果
#[derive(Debug)]
pub enum DecodeStep<T> {
    Frame(T),
    /// 当前序号上的输入已解码完毕
    Finished,
    Aborted,
    /// 连续失败次数过多
    Failed,
}

/// 解码器公共部分：从包队列取包、过滤过期序号、驱动解码库
pub struct Decoder<C: Codec + ?Sized> {
    codec: Box<C>,
    queue: Arc<PacketQueue>,
    continue_read: Arc<ReadSignal>,
    pending: Option<(crate::core::Packet, i64)>,
    pkt_serial: i64,
    finished: Arc<AtomicI64>,
    errors: u32,
    /// 解码库不给时间戳时的推算值（秒），冲刷后回到 `start_pts`
    pub next_pts: f64,
    pub start_pts: f64,
}

impl<C: Codec + ?Sized> Decoder<C> {
    pub fn new(
        codec: Box<C>,
        queue: Arc<PacketQueue>,
        continue_read: Arc<ReadSignal>,
        finished: Arc<AtomicI64>,
    ) -> Self {
        Self {
            codec,
            queue,
            continue_read,
            pending: None,
            pkt_serial: -1,
            finished,
            errors: 0,
            next_pts: f64::NAN,
            start_pts: f64::NAN,
        }
    }

    pub fn pkt_serial(&self) -> i64 {
        self.pkt_serial
    }

    pub fn queue(&self) -> &Arc<PacketQueue> {
        &self.queue
    }

    pub fn description(&self) -> String {
        self.codec.description()
    }

    pub fn codec_mut(&mut self) -> &mut C {
        &mut self.codec
    }

    /// 记录一次失败，超过上限时返回 true
    fn record_failure(&mut self, message: &str) -> bool {
        self.errors += 1;
        warn!(
            "{} 解码错误（{}/{}，已跳过）: {}",
            log_ctx(),
            self.errors,
            MAX_CONSECUTIVE_DECODE_ERRORS,
            message
        );
        self.errors >= MAX_CONSECUTIVE_DECODE_ERRORS
    }

    /// 取下一帧；过期序号的包在这里被丢弃
    pub fn decode_frame(&mut self) -> DecodeStep<C::Output> {
        loop {
            if self.queue.serial() == self.pkt_serial {
                loop {
                    if self.queue.is_aborted() {
                        return DecodeStep::Aborted;
                    }
                    match self.codec.receive() {
                        Decoded::Frame(frame) => {
                            self.errors = 0;
                            return DecodeStep::Frame(frame);
                        }
                        Decoded::EndOfStream => {
                            self.finished.store(self.pkt_serial, Ordering::Release);
                            self.codec.flush();
                            return DecodeStep::Finished;
                        }
                        Decoded::NeedMoreInput => break,
                        Decoded::Failure(message) => {
                            if self.record_failure(&message) {
                                self.finished.store(self.pkt_serial, Ordering::Release);
                                return DecodeStep::Failed;
                            }
                            break;
                        }
                    }
                }
            }

            let (packet, serial) = loop {
                if self.queue.nb_packets() == 0 {
                    self.continue_read.notify();
                }
                let (packet, serial) = match self.pending.take() {
                    Some(pending) => pending,
                    None => match self.queue.get(true) {
                        PacketGet::Packet(packet, serial) => (packet, serial),
                        PacketGet::Empty | PacketGet::Aborted => return DecodeStep::Aborted,
                    },
                };
                self.pkt_serial = serial;
                if self.queue.serial() == serial {
                    break (packet, serial);
                }
                trace!("丢弃过期数据包 serial={}", serial);
            };

            match packet.kind {
                PacketKind::Flush => {
                    self.codec.flush();
                    self.finished.store(0, Ordering::Release);
                    self.next_pts = self.start_pts;
                }
                PacketKind::Null => self.codec.send_eof(),
                PacketKind::Data => match self.codec.send_packet(&packet) {
                    Feed::Accepted => {}
                    Feed::Again => {
                        // 先取出输出，再重送同一个包
                        self.pending = Some((packet, serial));
                    }
                    Feed::Failure(message) => {
                        if self.record_failure(&message) {
                            self.finished.store(self.pkt_serial, Ordering::Release);
                            return DecodeStep::Failed;
                        }
                    }
                },
            }
        }
    }
}

// ============= 视频 =============

/// 视频解码线程：提前丢帧，推入图像队列
pub struct VideoDecoder {
    base: Decoder<dyn Codec<Output = VideoPicture>>,
    shared: Arc<PlayerShared>,
    frame_duration: f64,
}

impl VideoDecoder {
    pub fn new(codec: VideoCodec, stream: &StreamInfo, shared: Arc<PlayerShared>) -> Self {
        let base = Decoder::new(
            codec,
            Arc::clone(&shared.video_pq),
            Arc::clone(&shared.continue_read),
            Arc::clone(&shared.video_finished),
        );
        Self {
            base,
            shared,
            frame_duration: frame_duration(stream.frame_rate),
        }
    }

    /// 解码后、入队前丢弃已经落后于主时钟的帧
    fn should_drop_early(&self, pts: f64) -> bool {
        if pts.is_nan() {
            return false;
        }
        let seek_decoder = self.shared.seek_decoder();
        if seek_decoder > 0.0 && seek_decoder > pts {
            return true;
        }
        if self.shared.framedrop_enabled() {
            let diff = pts - self.shared.master_time();
            if !diff.is_nan()
                && diff < 0.0
                && diff.abs() < AV_NOSYNC_THRESHOLD
                && self.base.pkt_serial() == self.shared.vid_clk.serial()
                && self.shared.video_pq.nb_packets() > 0
            {
                return true;
            }
        }
        false
    }

    pub fn run(&mut self) {
        info!("{} 🎬 视频解码线程启动: {}", log_ctx(), self.base.description());
        loop {
            let picture = match self.base.decode_frame() {
                DecodeStep::Frame(picture) => picture,
                DecodeStep::Finished => continue,
                DecodeStep::Aborted => break,
                DecodeStep::Failed => {
                    error!("{} ❌ 视频解码连续失败，停止视频解码", log_ctx());
                    break;
                }
            };
            let pts = picture.pts.unwrap_or(f64::NAN);
            if self.should_drop_early(pts) {
                self.shared.count_early_drop();
                trace!("提前丢帧 pts={:.3}", pts);
                continue;
            }
            let pos = picture.pos;
            let frame = Frame::new(picture, pts, self.frame_duration, pos, self.base.pkt_serial());
            match self.shared.video_fq.peek_writable() {
                Some(slot) => slot.push(frame),
                None => break,
            }
        }
        info!("{} 🎬 视频解码线程退出", log_ctx());
    }
}

/// 推测帧率对应的帧时长，帧率未知时为 0
pub fn frame_duration(frame_rate: Rational) -> f64 {
    if frame_rate.is_valid() {
        frame_rate.den as f64 / frame_rate.num as f64
    } else {
        0.0
    }
}

// ============= 音频 =============

/// 音频漂移校正：音频不是主时钟时，按平滑后的差值增减采样数
#[derive(Debug, Clone)]
pub struct AudioDriftFilter {
    coef: f64,
    cum: f64,
    count: u32,
}

impl Default for AudioDriftFilter {
    fn default() -> Self {
        Self {
            coef: (0.01f64.ln() / AUDIO_DIFF_AVG_NB as f64).exp(),
            cum: 0.0,
            count: 0,
        }
    }
}

impl AudioDriftFilter {
    /// `diff` = 音频时钟 - 主时钟；返回希望输出的采样数
    pub fn wanted_samples(&mut self, diff: f64, nb_samples: usize, sample_rate: u32) -> usize {
        if diff.is_nan() || diff.abs() >= AV_NOSYNC_THRESHOLD {
            // 差值太大，可能是起始时间戳错误，重置滤波器
            self.count = 0;
            self.cum = 0.0;
            return nb_samples;
        }
        self.cum = diff + self.coef * self.cum;
        if self.count < AUDIO_DIFF_AVG_NB {
            self.count += 1;
            return nb_samples;
        }
        let avg_diff = self.cum * (1.0 - self.coef);
        if avg_diff == 0.0 {
            return nb_samples;
        }
        let wanted = nb_samples as i64 + (diff * sample_rate as f64) as i64;
        let min = (nb_samples * (100 - SAMPLE_CORRECTION_PERCENT_MAX) / 100) as i64;
        let max = (nb_samples * (100 + SAMPLE_CORRECTION_PERCENT_MAX) / 100) as i64;
        trace!("diff={:.4} adiff={:.4} sample_diff={}", diff, avg_diff, wanted - nb_samples as i64);
        wanted.clamp(min, max) as usize
    }
}

/// 音频解码线程：直接写入输出端，输出端的缓冲就是音频的有界队列
pub struct AudioDecoder {
    base: Decoder<dyn AudioDecode>,
    shared: Arc<PlayerShared>,
    sink: Arc<dyn AudioSink>,
    drift: AudioDriftFilter,
}

impl AudioDecoder {
    pub fn new(mut codec: AudioCodec, sink: Arc<dyn AudioSink>, shared: Arc<PlayerShared>) -> Self {
        codec.set_output(sink.spec());
        let base = Decoder::new(
            codec,
            Arc::clone(&shared.audio_pq),
            Arc::clone(&shared.continue_read),
            Arc::clone(&shared.audio_finished),
        );
        Self {
            base,
            shared,
            sink,
            drift: AudioDriftFilter::default(),
        }
    }

    fn sync_audio(&mut self, nb_samples: usize, sample_rate: u32) -> usize {
        if self.shared.master_sync_type() == SyncMaster::Audio {
            return nb_samples;
        }
        let diff = self.shared.aud_clk.get() - self.shared.master_time();
        self.drift.wanted_samples(diff, nb_samples, sample_rate)
    }

    /// 等输出端缓冲降到 100ms 以下，期间持续用未播放量校正音频时钟；中止时返回 false
    fn wait_for_sink(&self, pts: f64, serial: i64) -> bool {
        let spec = self.sink.spec();
        let bytes_per_sec = spec.bytes_per_sec().max(1) as f64;
        let speed = self.shared.aud_clk.speed().max(0.01);
        let samples = (AUDIO_MIN_BUFFER_SIZE / spec.frame_size().max(1)) as f64;
        let sleep = Duration::from_secs_f64(samples / (spec.sample_rate.max(1) as f64 * speed));
        let hw_min_bytes = speed * bytes_per_sec * 0.1;

        while !self.shared.abort_requested() && !self.base.queue().is_aborted() {
            let queued = self.sink.queued_bytes() as f64;
            if !pts.is_nan() {
                self.shared
                    .aud_clk
                    .set_at(pts - queued / bytes_per_sec, serial, now_secs());
                self.shared.ext_clk.sync_to(&self.shared.aud_clk);
            }
            if !self.shared.is_paused() && queued < hw_min_bytes {
                return true;
            }
            thread::sleep(sleep);
        }
        false
    }

    fn queue_frame(&mut self, buffer: &AudioBuffer, serial: i64) -> Result<()> {
        if serial != self.base.queue().serial() {
            // seek 之后的过期帧直接跳过，不补静音
            return Ok(());
        }
        let spec = self.sink.spec();
        if buffer.channels != spec.channels || buffer.sample_rate != spec.sample_rate {
            warn!(
                "{} 音频帧格式 {} Hz/{}ch 与输出端 {} Hz/{}ch 不一致，已跳过",
                log_ctx(),
                buffer.sample_rate,
                buffer.channels,
                spec.sample_rate,
                spec.channels
            );
            return Ok(());
        }
        let nb_samples = buffer.nb_samples();
        let wanted = self.sync_audio(nb_samples, buffer.sample_rate);
        if wanted != nb_samples {
            // 补偿作用在下一次重采样上
            let delta = wanted as i64 - nb_samples as i64;
            self.base.codec_mut().set_compensation(delta as i32, wanted as i32);
        }
        self.sink.queue(&buffer.samples)?;
        if !self.sink.is_playing() && !self.shared.is_paused() && !self.shared.is_stepping() {
            self.sink.play();
        }
        Ok(())
    }

    pub fn run(&mut self) {
        info!("{} 🔊 音频解码线程启动: {}", log_ctx(), self.base.description());
        loop {
            let buffer = match self.base.decode_frame() {
                DecodeStep::Frame(buffer) => buffer,
                DecodeStep::Finished => continue,
                DecodeStep::Aborted => break,
                DecodeStep::Failed => {
                    error!("{} ❌ 音频解码连续失败，停止音频解码", log_ctx());
                    break;
                }
            };

            let pts = buffer.pts.or_else(|| {
                if self.base.next_pts.is_nan() {
                    None
                } else {
                    Some(self.base.next_pts)
                }
            });
            if let Some(pts) = pts {
                self.base.next_pts = pts + buffer.duration();
            }
            let pts = pts.unwrap_or(f64::NAN);

            let seek_decoder = self.shared.seek_decoder();
            if !pts.is_nan() && seek_decoder > 0.0 && seek_decoder > pts {
                continue;
            }

            let serial = self.base.pkt_serial();
            if !self.wait_for_sink(pts, serial) {
                break;
            }
            if let Err(e) = self.queue_frame(&buffer, serial) {
                self.shared.fail(e);
                break;
            }
        }
        info!("{} 🔊 音频解码线程退出", log_ctx());
    }
}

// ============= 字幕 =============

pub struct SubtitleDecoder {
    base: Decoder<dyn Codec<Output = SubtitleEvent>>,
    shared: Arc<PlayerShared>,
}

impl SubtitleDecoder {
    pub fn new(codec: SubtitleCodec, shared: Arc<PlayerShared>) -> Self {
        let base = Decoder::new(
            codec,
            Arc::clone(&shared.subtitle_pq),
            Arc::clone(&shared.continue_read),
            Arc::clone(&shared.subtitle_finished),
        );
        Self { base, shared }
    }

    pub fn run(&mut self) {
        info!("{} 💬 字幕解码线程启动: {}", log_ctx(), self.base.description());
        loop {
            let event = match self.base.decode_frame() {
                DecodeStep::Frame(event) => event,
                DecodeStep::Finished => continue,
                DecodeStep::Aborted | DecodeStep::Failed => break,
            };
            let pts = event.pts.unwrap_or(f64::NAN);
            let duration = event.end_display - event.start_display;
            let frame = Frame::new(event, pts, duration, -1, self.base.pkt_serial());
            match self.shared.subtitle_fq.peek_writable() {
                Some(slot) => slot.push(frame),
                None => break,
            }
        }
        info!("{} 💬 字幕解码线程退出", log_ctx());
    }
}

// ============= 线程管理 =============

/// 三种解码线程
pub enum StreamDecoder {
    Video(VideoDecoder),
    Audio(AudioDecoder),
    Subtitle(SubtitleDecoder),
}

impl StreamDecoder {
    pub fn kind(&self) -> MediaKind {
        match self {
            StreamDecoder::Video(_) => MediaKind::Video,
            StreamDecoder::Audio(_) => MediaKind::Audio,
            StreamDecoder::Subtitle(_) => MediaKind::Subtitle,
        }
    }

    fn queue(&self) -> Arc<PacketQueue> {
        match self {
            StreamDecoder::Video(d) => Arc::clone(d.base.queue()),
            StreamDecoder::Audio(d) => Arc::clone(d.base.queue()),
            StreamDecoder::Subtitle(d) => Arc::clone(d.base.queue()),
        }
    }

    pub fn run(&mut self) {
        match self {
            StreamDecoder::Video(d) => d.run(),
            StreamDecoder::Audio(d) => d.run(),
            StreamDecoder::Subtitle(d) => d.run(),
        }
    }

    /// 启动包队列并在独立线程中运行
    pub fn spawn(self, shared: Arc<PlayerShared>) -> Result<DecoderHandle> {
        let kind = self.kind();
        let queue = self.queue();
        queue.start();
        let mut decoder = self;
        let thread = thread::Builder::new()
            .name(format!("{}-decoder", kind.as_str().to_lowercase()))
            .spawn(move || {
                decoder.run();
                decoder
            })
            .map_err(|e| {
                queue.abort();
                PlayerError::DecodeFailure(format!("无法创建解码线程: {}", e))
            })?;
        Ok(DecoderHandle {
            kind,
            queue,
            shared,
            thread: Some(thread),
        })
    }
}

/// 运行中的解码线程
pub struct DecoderHandle {
    kind: MediaKind,
    queue: Arc<PacketQueue>,
    shared: Arc<PlayerShared>,
    thread: Option<JoinHandle<StreamDecoder>>,
}

impl DecoderHandle {
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// 中止 → 唤醒帧队列 → 等线程结束 → 清空包队列 → 释放解码上下文
    pub fn abort(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.queue.abort();
        match self.kind {
            MediaKind::Video => self.shared.video_fq.signal(),
            MediaKind::Subtitle => self.shared.subtitle_fq.signal(),
            _ => {}
        }
        let decoder = match thread.join() {
            Ok(decoder) => Some(decoder),
            Err(_) => {
                error!("{} ❌ {} 解码线程 panic", log_ctx(), self.kind.as_str());
                None
            }
        };
        self.queue.flush();
        drop(decoder);
        debug!("{} {} 解码器已关闭", log_ctx(), self.kind.as_str());
    }
}

impl Drop for DecoderHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Packet, PlaybackState, PlayerConfig, PlayerEvent};
    use crate::player::testing::{ScriptedCodec, ScriptedSink};
    use crossbeam_channel::unbounded;

    fn video_packet(pts_ms: i64) -> Packet {
        Packet::data(0, vec![0; 16]).with_pts(pts_ms)
    }

    #[test]
    fn test_decode_frame_discards_stale_serials() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        let finished = Arc::new(AtomicI64::new(0));
        let mut decoder = Decoder::new(
            Box::new(ScriptedCodec::video()),
            Arc::clone(&queue),
            Arc::new(ReadSignal::default()),
            Arc::clone(&finished),
        );

        // serial 1: 0, 40, 80；冲刷；serial 2: 1000, 1040
        queue.put(video_packet(0));
        queue.put(video_packet(40));
        queue.put(video_packet(80));

        let first = match decoder.decode_frame() {
            DecodeStep::Frame(p) => p,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(first.pts, Some(0.0));
        assert_eq!(decoder.pkt_serial(), 1);

        queue.put_flush();
        queue.put(video_packet(1000));
        queue.put(video_packet(1040));

        let mut seen = Vec::new();
        for _ in 0..2 {
            match decoder.decode_frame() {
                DecodeStep::Frame(p) => seen.push((p.pts, decoder.pkt_serial())),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(seen, vec![(Some(1.0), 2), (Some(1.04), 2)]);
    }

    #[test]
    fn test_null_packet_marks_finished() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        let finished = Arc::new(AtomicI64::new(0));
        let mut decoder = Decoder::new(
            Box::new(ScriptedCodec::video()),
            Arc::clone(&queue),
            Arc::new(ReadSignal::default()),
            Arc::clone(&finished),
        );
        queue.put(video_packet(0));
        queue.put_null(0);
        assert!(decoder.decode_frame().is_frame());
        assert!(matches!(decoder.decode_frame(), DecodeStep::Finished));
        assert_eq!(finished.load(Ordering::Acquire), queue.serial());
    }

    #[test]
    fn test_repeated_failures_stop_decoder() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        let mut decoder = Decoder::new(
            Box::new(ScriptedCodec::video().failing()),
            Arc::clone(&queue),
            Arc::new(ReadSignal::default()),
            Arc::new(AtomicI64::new(0)),
        );
        for i in 0..MAX_CONSECUTIVE_DECODE_ERRORS as i64 {
            queue.put(video_packet(i * 40));
        }
        assert!(matches!(decoder.decode_frame(), DecodeStep::Failed));
    }

    #[test]
    fn test_abort_unblocks_decode() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        let mut decoder = Decoder::new(
            Box::new(ScriptedCodec::video()),
            Arc::clone(&queue),
            Arc::new(ReadSignal::default()),
            Arc::new(AtomicI64::new(0)),
        );
        let worker = thread::spawn(move || matches!(decoder.decode_frame(), DecodeStep::Aborted));
        thread::sleep(Duration::from_millis(20));
        queue.abort();
        assert!(worker.join().unwrap());
    }

    #[test]
    fn test_drift_filter_waits_for_enough_measures() {
        let mut filter = AudioDriftFilter::default();
        for _ in 0..AUDIO_DIFF_AVG_NB {
            assert_eq!(filter.wanted_samples(0.05, 1000, 48_000), 1000);
        }
        // 音频超前 50ms：多输出采样（被限制在 +10%）
        assert_eq!(filter.wanted_samples(0.05, 1000, 48_000), 1100);
        // 差值过大时重置
        assert_eq!(filter.wanted_samples(20.0, 1000, 48_000), 1000);
        assert_eq!(filter.wanted_samples(-0.001, 1000, 48_000), 1000);
    }

    #[test]
    fn test_drift_filter_small_correction() {
        let mut filter = AudioDriftFilter::default();
        for _ in 0..=AUDIO_DIFF_AVG_NB {
            filter.wanted_samples(-0.001, 1000, 48_000);
        }
        assert_eq!(filter.wanted_samples(-0.001, 1000, 48_000), 952);
    }

    #[test]
    fn test_frame_duration_from_rate() {
        assert!((frame_duration(Rational::new(25, 1)) - 0.04).abs() < 1e-12);
        assert_eq!(frame_duration(Rational::new(0, 1)), 0.0);
    }

    #[test]
    fn test_video_decoder_drops_frames_before_seek_target() {
        let (tx, _rx) = unbounded();
        let shared = Arc::new(PlayerShared::new(PlayerConfig::default(), tx));
        let mut stream = StreamInfo::new(0, MediaKind::Video);
        stream.frame_rate = Rational::new(25, 1);
        shared.set_seek_decoder(1.0);

        let decoder = VideoDecoder::new(Box::new(ScriptedCodec::video()), &stream, Arc::clone(&shared));
        let handle = StreamDecoder::Video(decoder).spawn(Arc::clone(&shared)).unwrap();
        for pts in [920, 960, 1000, 1040] {
            shared.video_pq.put(video_packet(pts));
        }

        let mut frames = Vec::new();
        for _ in 0..200 {
            if shared.video_fq.nb_remaining() >= 2 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        while let Some(frame) = shared.video_fq.peek() {
            frames.push(frame.pts);
            shared.video_fq.next();
            if shared.video_fq.nb_remaining() == 0 {
                break;
            }
        }
        handle.abort();
        assert_eq!(frames, vec![1.0, 1.04]);
        assert_eq!(shared.stats().frame_drops_early, 2);
    }

    #[test]
    fn test_audio_decoder_feeds_sink_and_clock() {
        let (tx, _rx) = unbounded();
        let shared = Arc::new(PlayerShared::new(PlayerConfig::default(), tx));
        shared.set_active_stream(MediaKind::Audio, Some(0));
        let sink = Arc::new(ScriptedSink::new(48_000, 2));
        shared.set_audio_sink(Some(sink.clone()));

        let decoder = AudioDecoder::new(Box::new(ScriptedCodec::audio()), sink.clone(), Arc::clone(&shared));
        let handle = StreamDecoder::Audio(decoder).spawn(Arc::clone(&shared)).unwrap();
        shared.audio_pq.put(Packet::data(0, vec![0; 8]).with_pts(0));

        for _ in 0..200 {
            if sink.queued_bytes() > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(sink.queued_bytes() > 0);
        assert!(sink.is_playing());
        // 第一帧写入前缓冲为空，音频时钟等于该帧 pts
        assert!(shared.aud_clk.pts().abs() < 1e-9);
        handle.abort();
    }

    #[test]
    fn test_audio_drift_becomes_resampler_compensation() {
        let (tx, _rx) = unbounded();
        let config = PlayerConfig {
            sync_master: SyncMaster::Video,
            ..PlayerConfig::default()
        };
        let shared = Arc::new(PlayerShared::new(config, tx));
        shared.set_active_stream(MediaKind::Video, Some(0));
        shared.set_active_stream(MediaKind::Audio, Some(1));
        shared.video_pq.start();
        shared.audio_pq.start();
        // 音频比视频超前 50ms
        shared.vid_clk.set(1.0, shared.video_pq.serial());
        shared.aud_clk.set(1.05, shared.audio_pq.serial());

        let codec = ScriptedCodec::audio();
        let compensations = codec.compensations();
        let sink = Arc::new(ScriptedSink::new(48_000, 2));
        let mut decoder = AudioDecoder::new(Box::new(codec), sink.clone(), Arc::clone(&shared));
        let buffer = AudioBuffer {
            samples: vec![0.0; 960 * 2],
            channels: 2,
            sample_rate: 48_000,
            pts: Some(1.0),
            pos: -1,
        };
        let serial = shared.audio_pq.serial();
        for _ in 0..AUDIO_DIFF_AVG_NB {
            decoder.queue_frame(&buffer, serial).unwrap();
        }
        assert!(compensations.lock().is_empty());

        decoder.queue_frame(&buffer, serial).unwrap();
        // 校正量限制在 +10%
        assert_eq!(*compensations.lock(), vec![(96, 1056)]);
        assert_eq!(sink.queued_bytes(), 21 * 960 * 2 * 4);
    }

    #[test]
    fn test_audio_decoder_skips_frames_in_other_format() {
        let (tx, _rx) = unbounded();
        let shared = Arc::new(PlayerShared::new(PlayerConfig::default(), tx));
        shared.audio_pq.start();
        let sink = Arc::new(ScriptedSink::new(44_100, 2));
        let mut decoder =
            AudioDecoder::new(Box::new(ScriptedCodec::audio()), sink.clone(), Arc::clone(&shared));
        let buffer = AudioBuffer {
            samples: vec![0.0; 960 * 2],
            channels: 2,
            sample_rate: 48_000,
            pts: Some(0.0),
            pos: -1,
        };
        decoder.queue_frame(&buffer, shared.audio_pq.serial()).unwrap();
        assert_eq!(sink.queued_bytes(), 0);
    }

    #[test]
    fn test_stale_audio_frame_is_skipped_without_silence() {
        let (tx, _rx) = unbounded();
        let shared = Arc::new(PlayerShared::new(PlayerConfig::default(), tx));
        shared.audio_pq.start();
        let old_serial = shared.audio_pq.serial();
        shared.audio_pq.put_flush();
        let sink = Arc::new(ScriptedSink::new(48_000, 2));
        let mut decoder =
            AudioDecoder::new(Box::new(ScriptedCodec::audio()), sink.clone(), Arc::clone(&shared));
        let buffer = AudioBuffer {
            samples: vec![0.5; 960 * 2],
            channels: 2,
            sample_rate: 48_000,
            pts: Some(0.0),
            pos: -1,
        };

        decoder.queue_frame(&buffer, old_serial).unwrap();
        assert_eq!(sink.queued_bytes(), 0);
        assert!(!sink.is_playing());
    }

    #[test]
    fn test_audio_device_failure_stops_session() {
        let (tx, rx) = unbounded();
        let shared = Arc::new(PlayerShared::new(PlayerConfig::default(), tx));
        shared.set_active_stream(MediaKind::Audio, Some(0));
        let sink = Arc::new(ScriptedSink::new(48_000, 2));
        shared.set_audio_sink(Some(sink.clone()));
        sink.fail_next_queue();

        let decoder = AudioDecoder::new(Box::new(ScriptedCodec::audio()), sink.clone(), Arc::clone(&shared));
        let handle = StreamDecoder::Audio(decoder).spawn(Arc::clone(&shared)).unwrap();
        shared.audio_pq.put(Packet::data(0, vec![0; 8]).with_pts(0));

        for _ in 0..200 {
            if shared.abort_requested() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(shared.abort_requested());
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, PlayerEvent::Error { code: 3, .. }))
                .count(),
            1
        );
        assert!(events.contains(&PlayerEvent::StateChanged(PlaybackState::Stopped)));
        handle.abort();
    }

    impl<T> DecodeStep<T> {
        fn is_frame(&self) -> bool {
            matches!(self, DecodeStep::Frame(_))
        }
    }
}

//! 测试用的脚本化后端：数据包、解码输出、音频设备和呈现端都可预测

use crate::core::{
    AudioBuffer, ColorDescriptor, Frame, MediaKind, Packet, PixelFormat, PlayerConfig,
    PlayerError, Rational, Result, StreamInfo, SubtitleEvent, VideoPicture,
};
use crate::player::audio_output::{AudioSink, AudioSinkFactory, AudioSpec};
use crate::player::demuxer_source::{
    AudioCodec, AudioDecode, Codec, Decoded, Feed, MediaBackend, MediaSource, ReadOutcome, SeekTarget,
    SubtitleCodec, VideoCodec,
};
use crate::player::surface::VideoSurface;
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 测试流的时间基：毫秒
const TB_MS: Rational = Rational::new(1, 1000);

pub fn picture(pts: f64) -> VideoPicture {
    VideoPicture {
        width: 16,
        height: 16,
        format: PixelFormat::Gray8,
        planes: vec![vec![0; 256]],
        strides: vec![16],
        color: ColorDescriptor::default(),
        sample_aspect_ratio: Rational::new(1, 1),
        pts: Some(pts),
        pos: -1,
    }
}

fn pts_secs(packet: &Packet) -> Option<f64> {
    packet.pts.map(|p| p as f64 / 1000.0)
}

// ============= 解码 =============

/// 每个数据包产出一帧，pts 取包的毫秒时间戳
pub struct ScriptedCodec<T> {
    make: fn(&Packet) -> T,
    outputs: VecDeque<T>,
    eof: bool,
    failing: bool,
    compensations: Arc<Mutex<Vec<(i32, i32)>>>,
}

impl<T> ScriptedCodec<T> {
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// 解码线程下发的采样数补偿 (delta, distance)
    pub fn compensations(&self) -> Arc<Mutex<Vec<(i32, i32)>>> {
        Arc::clone(&self.compensations)
    }

    fn with(make: fn(&Packet) -> T) -> Self {
        Self {
            make,
            outputs: VecDeque::new(),
            eof: false,
            failing: false,
            compensations: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl ScriptedCodec<VideoPicture> {
    pub fn video() -> Self {
        Self::with(|packet| {
            let mut p = picture(0.0);
            p.pts = pts_secs(packet);
            p.pos = packet.pos;
            p
        })
    }
}

impl ScriptedCodec<AudioBuffer> {
    /// 20ms 立体声 48kHz
    pub fn audio() -> Self {
        Self::with(|packet| AudioBuffer {
            samples: vec![0.1; 960 * 2],
            channels: 2,
            sample_rate: 48_000,
            pts: pts_secs(packet),
            pos: packet.pos,
        })
    }
}

impl ScriptedCodec<SubtitleEvent> {
    /// 包内容即字幕文本
    pub fn subtitle() -> Self {
        Self::with(|packet| SubtitleEvent {
            text: String::from_utf8_lossy(&packet.data).into_owned(),
            pts: pts_secs(packet),
            start_display: 0.0,
            end_display: if packet.duration > 0 {
                packet.duration as f64 / 1000.0
            } else {
                1.0
            },
        })
    }
}

impl<T: Send + Sync + 'static> Codec for ScriptedCodec<T> {
    type Output = T;

    fn send_packet(&mut self, packet: &Packet) -> Feed {
        if self.failing {
            return Feed::Failure("scripted failure".into());
        }
        self.outputs.push_back((self.make)(packet));
        Feed::Accepted
    }

    fn send_eof(&mut self) {
        self.eof = true;
    }

    fn receive(&mut self) -> Decoded<T> {
        if let Some(output) = self.outputs.pop_front() {
            return Decoded::Frame(output);
        }
        if self.eof {
            self.eof = false;
            return Decoded::EndOfStream;
        }
        Decoded::NeedMoreInput
    }

    fn flush(&mut self) {
        self.outputs.clear();
        self.eof = false;
    }

    fn description(&self) -> String {
        "scripted".into()
    }
}

impl AudioDecode for ScriptedCodec<AudioBuffer> {
    // 脚本输出固定为 48kHz 立体声
    fn set_output(&mut self, _spec: AudioSpec) {}

    fn set_compensation(&mut self, delta: i32, distance: i32) {
        self.compensations.lock().push((delta, distance));
    }
}

// ============= 音频设备 =============

/// 不消费数据的音频设备；测试可以手动 `drain`
pub struct ScriptedSink {
    spec: AudioSpec,
    queued: AtomicUsize,
    playing: AtomicBool,
    gain: AtomicCell<f64>,
    pitch: AtomicCell<f64>,
    flushes: AtomicUsize,
    fail: AtomicBool,
}

impl ScriptedSink {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            spec: AudioSpec::new(sample_rate, channels),
            queued: AtomicUsize::new(0),
            playing: AtomicBool::new(false),
            gain: AtomicCell::new(1.0),
            pitch: AtomicCell::new(1.0),
            flushes: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub fn drain(&self, bytes: usize) {
        let _ = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |q| Some(q.saturating_sub(bytes)));
    }

    pub fn gain(&self) -> f64 {
        self.gain.load()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Acquire)
    }

    pub fn fail_next_queue(&self) {
        self.fail.store(true, Ordering::Release);
    }
}

impl AudioSink for ScriptedSink {
    fn spec(&self) -> AudioSpec {
        self.spec
    }

    fn queue(&self, samples: &[f32]) -> Result<()> {
        if self.fail.load(Ordering::Acquire) {
            return Err(PlayerError::DeviceFailure("scripted device lost".into()));
        }
        self.queued
            .fetch_add(samples.len() * std::mem::size_of::<f32>(), Ordering::AcqRel);
        Ok(())
    }

    fn queued_bytes(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    fn play(&self) {
        self.playing.store(true, Ordering::Release);
    }

    fn pause(&self) {
        self.playing.store(false, Ordering::Release);
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    fn flush(&self) {
        self.queued.store(0, Ordering::Release);
        self.flushes.fetch_add(1, Ordering::AcqRel);
    }

    fn set_gain(&self, gain: f64) {
        self.gain.store(gain);
    }

    fn set_pitch(&self, pitch: f64) {
        self.pitch.store(pitch);
    }

    fn pitch(&self) -> f64 {
        self.pitch.load()
    }
}

/// 记录打开过的设备；`failing` 时拒绝打开
#[derive(Default)]
pub struct ScriptedSinkFactory {
    pub sinks: Mutex<Vec<Arc<ScriptedSink>>>,
    pub failing: bool,
}

impl ScriptedSinkFactory {
    pub fn last(&self) -> Option<Arc<ScriptedSink>> {
        self.sinks.lock().last().cloned()
    }
}

impl AudioSinkFactory for ScriptedSinkFactory {
    fn open(&self, wanted: AudioSpec) -> Result<Arc<dyn AudioSink>> {
        if self.failing {
            return Err(PlayerError::DeviceFailure("no scripted device".into()));
        }
        let sink = Arc::new(ScriptedSink::new(wanted.sample_rate, wanted.channels));
        self.sinks.lock().push(Arc::clone(&sink));
        Ok(sink)
    }
}

// ============= 容器 =============

/// 按脚本依次返回数据包的容器
#[derive(Clone)]
pub struct ScriptedSource {
    pub streams: Vec<StreamInfo>,
    pub packets: Vec<Packet>,
    pub cursor: usize,
    pub duration: Option<f64>,
    pub realtime: bool,
    pub fail_seek: bool,
    pub seeks: Arc<Mutex<Vec<SeekTarget>>>,
}

impl ScriptedSource {
    pub fn new(streams: Vec<StreamInfo>, packets: Vec<Packet>) -> Self {
        Self {
            streams,
            packets,
            cursor: 0,
            duration: None,
            realtime: false,
            fail_seek: false,
            seeks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 25fps 视频 + 每 20ms 一包的音频，交错排列
    pub fn av(seconds: f64) -> Self {
        let mut video = StreamInfo::new(0, MediaKind::Video);
        video.codec_name = "scripted".into();
        video.time_base = TB_MS;
        video.frame_rate = Rational::new(25, 1);
        video.width = 16;
        video.height = 16;
        video.sample_aspect_ratio = Rational::new(1, 1);
        video.duration = Some((seconds * 1000.0) as i64);

        let mut audio = StreamInfo::new(1, MediaKind::Audio);
        audio.codec_name = "scripted".into();
        audio.language = Some("eng".into());
        audio.time_base = TB_MS;
        audio.sample_rate = 48_000;
        audio.channels = 2;
        audio.duration = Some((seconds * 1000.0) as i64);

        let end_ms = (seconds * 1000.0) as i64;
        let mut packets = Vec::new();
        let mut t = 0;
        while t < end_ms {
            if t % 40 == 0 {
                packets.push(Packet::data(0, vec![0; 64]).with_pts(t).with_duration(40).with_pos(t * 10));
            }
            packets.push(Packet::data(1, vec![0; 32]).with_pts(t).with_duration(20).with_pos(t * 10 + 1));
            t += 20;
        }

        let mut source = Self::new(vec![video, audio], packets);
        source.duration = Some(seconds);
        source
    }

    /// 只有音频流（每 20ms 一包）
    pub fn audio_only(seconds: f64) -> Self {
        let av = Self::av(seconds);
        let mut audio = av.streams[1].clone();
        audio.index = 0;
        let packets = av
            .packets
            .into_iter()
            .filter(|p| p.stream_index == 1)
            .map(|mut p| {
                p.stream_index = 0;
                p
            })
            .collect();
        let mut source = Self::new(vec![audio], packets);
        source.duration = Some(seconds);
        source
    }

    pub fn with_text_subtitles(mut self, lines: &[(i64, &str)]) -> Self {
        let index = self.streams.len();
        let mut sub = StreamInfo::new(index, MediaKind::Subtitle);
        sub.codec_name = "subrip".into();
        sub.text_subtitle = true;
        sub.time_base = TB_MS;
        self.streams.push(sub);
        for (pts, text) in lines {
            let packet = Packet::data(index, text.as_bytes().to_vec())
                .with_pts(*pts)
                .with_duration(1000);
            let at = self
                .packets
                .iter()
                .position(|p| p.pts.unwrap_or(0) > *pts)
                .unwrap_or(self.packets.len());
            self.packets.insert(at, packet);
        }
        self
    }
}

impl MediaSource for ScriptedSource {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn duration(&self) -> Option<f64> {
        self.duration
    }

    fn read_packet(&mut self) -> ReadOutcome {
        match self.packets.get(self.cursor) {
            Some(packet) => {
                self.cursor += 1;
                ReadOutcome::Packet(packet.clone())
            }
            None => ReadOutcome::Eof,
        }
    }

    fn seek(&mut self, target: SeekTarget) -> Result<()> {
        self.seeks.lock().push(target);
        if self.fail_seek {
            return Err(PlayerError::DecodeFailure("scripted seek failure".into()));
        }
        self.cursor = match target {
            SeekTarget::Time(seconds) => {
                let ms = (seconds * 1000.0).round() as i64;
                // 回到不晚于目标的视频关键帧
                self.packets
                    .iter()
                    .rposition(|p| p.stream_index == 0 && p.pts.unwrap_or(0) <= ms)
                    .unwrap_or(0)
            }
            SeekTarget::Bytes(pos) => self
                .packets
                .iter()
                .position(|p| p.pos >= pos)
                .unwrap_or(self.packets.len()),
        };
        Ok(())
    }

    fn is_realtime(&self) -> bool {
        self.realtime
    }

    fn open_video_codec(&self, _stream_index: usize) -> Result<VideoCodec> {
        Ok(Box::new(ScriptedCodec::video()))
    }

    fn open_audio_codec(&self, _stream_index: usize) -> Result<AudioCodec> {
        Ok(Box::new(ScriptedCodec::audio()))
    }

    fn open_subtitle_codec(&self, _stream_index: usize) -> Result<SubtitleCodec> {
        Ok(Box::new(ScriptedCodec::subtitle()))
    }

    fn description(&self) -> String {
        "scripted source".into()
    }
}

/// 返回脚本容器的后端；`open_delay` 模拟探测很慢的源
pub struct ScriptedBackend {
    pub source: Option<ScriptedSource>,
    pub open_delay: Duration,
    /// 像网络打开一样不理会中断标志
    pub uninterruptible: bool,
}

impl ScriptedBackend {
    pub fn new(source: ScriptedSource) -> Self {
        Self {
            source: Some(source),
            open_delay: Duration::ZERO,
            uninterruptible: false,
        }
    }

    pub fn unopenable() -> Self {
        Self {
            source: None,
            open_delay: Duration::ZERO,
            uninterruptible: false,
        }
    }
}

impl MediaBackend for ScriptedBackend {
    fn open(
        &self,
        url: &str,
        _config: &PlayerConfig,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Box<dyn MediaSource>> {
        let deadline = std::time::Instant::now() + self.open_delay;
        while std::time::Instant::now() < deadline {
            if !self.uninterruptible && interrupt.load(Ordering::Acquire) {
                return Err(PlayerError::Abort);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        match &self.source {
            Some(source) => Ok(Box::new(source.clone())),
            None => Err(PlayerError::OpenFailure(format!("无法打开文件: {}", url))),
        }
    }
}

// ============= 呈现 =============

/// 记录显示过的帧 pts 和字幕
#[derive(Default)]
pub struct RecordingSurface {
    presented: Arc<Mutex<Vec<f64>>>,
    subtitles: Arc<Mutex<Vec<Option<String>>>>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presented(&self) -> Arc<Mutex<Vec<f64>>> {
        Arc::clone(&self.presented)
    }

    pub fn subtitles(&self) -> Arc<Mutex<Vec<Option<String>>>> {
        Arc::clone(&self.subtitles)
    }
}

impl VideoSurface for RecordingSurface {
    fn present(&mut self, frame: &Frame<VideoPicture>) {
        self.presented.lock().push(frame.pts);
    }

    fn set_subtitle(&mut self, event: Option<&SubtitleEvent>) {
        self.subtitles.lock().push(event.map(|e| e.text.clone()));
    }
}

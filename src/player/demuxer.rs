use crate::core::{
    MediaKind, Packet, PacketKind, PlayerConfig, PlayerError, Rational, Result, StreamInfo,
};
use crate::player::codec::{FFmpegAudioCodec, FFmpegSubtitleCodec, FFmpegVideoCodec};
use crate::player::demuxer_source::{
    AudioCodec, MediaBackend, MediaSource, ReadOutcome, SeekTarget, SubtitleCodec, VideoCodec,
};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, ffi, format, media};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 微秒时间基（AV_TIME_BASE）
const TIME_BASE_US: f64 = 1_000_000.0;

fn is_network_url(url: &str) -> bool {
    url.starts_with("http://")
        || url.starts_with("https://")
        || url.starts_with("rtsp://")
        || url.starts_with("rtmp://")
        || url.starts_with("rtp:")
        || url.starts_with("udp:")
        || url.contains(".m3u8")
}

fn valid_ts(ts: i64) -> Option<i64> {
    (ts != ffi::AV_NOPTS_VALUE).then_some(ts)
}

fn rational(value: ffmpeg::Rational) -> Rational {
    Rational::new(value.numerator(), value.denominator())
}

fn media_kind(medium: media::Type) -> MediaKind {
    match medium {
        media::Type::Video => MediaKind::Video,
        media::Type::Audio => MediaKind::Audio,
        media::Type::Subtitle => MediaKind::Subtitle,
        _ => MediaKind::Data,
    }
}

fn is_text_subtitle(id: codec::Id) -> bool {
    unsafe {
        let descriptor = ffi::avcodec_descriptor_get(id.into());
        !descriptor.is_null()
            && ((*descriptor).props as i64 & ffi::AV_CODEC_PROP_TEXT_SUB as i64) != 0
    }
}

/// FFmpeg 数据包转成引擎数据包
fn from_native(packet: &ffmpeg::Packet) -> Packet {
    Packet {
        kind: PacketKind::Data,
        stream_index: packet.stream(),
        data: packet.data().map(|d| d.to_vec()).unwrap_or_default(),
        pts: packet.pts(),
        dts: packet.dts(),
        duration: packet.duration(),
        pos: packet.position() as i64,
        keyframe: packet.is_key(),
    }
}

/// 探测单条流的信息
fn describe_stream(stream: &format::stream::Stream) -> StreamInfo {
    let params = stream.parameters();
    let kind = media_kind(params.medium());
    let mut info = StreamInfo::new(stream.index(), kind);
    info.codec_name = params.id().name().to_string();
    info.language = stream.metadata().get("language").map(str::to_string);
    info.title = stream.metadata().get("title").map(str::to_string);
    info.time_base = rational(stream.time_base());
    info.start_time = valid_ts(stream.start_time());
    info.duration = valid_ts(stream.duration()).filter(|d| *d > 0);
    info.attached_pic = stream
        .disposition()
        .contains(format::stream::Disposition::ATTACHED_PIC);

    let avg = rational(stream.avg_frame_rate());
    info.frame_rate = if avg.is_valid() {
        avg
    } else {
        rational(stream.rate())
    };

    match kind {
        MediaKind::Video => {
            if let Ok(video) = codec::context::Context::from_parameters(params)
                .and_then(|ctx| ctx.decoder().video())
            {
                info.width = video.width();
                info.height = video.height();
                info.sample_aspect_ratio = rational(video.aspect_ratio());
            }
        }
        MediaKind::Audio => {
            if let Ok(audio) = codec::context::Context::from_parameters(params)
                .and_then(|ctx| ctx.decoder().audio())
            {
                info.sample_rate = audio.rate();
                info.channels = audio.channels();
            }
        }
        MediaKind::Subtitle => {
            info.text_subtitle = is_text_subtitle(stream.parameters().id());
        }
        MediaKind::Data => {}
    }
    info
}

/// 基于 FFmpeg 的容器
pub struct FFmpegDemuxer {
    input: format::context::Input,
    streams: Vec<StreamInfo>,
    url: String,
    format_name: String,
    realtime: bool,
    ts_discontinuity: bool,
}

impl FFmpegDemuxer {
    /// 打开媒体文件或网络流
    pub fn open(url: &str, config: &PlayerConfig, interrupt: Arc<AtomicBool>) -> Result<Self> {
        info!("正在打开文件: {}", url);

        let input = if is_network_url(url) {
            info!("🌐 检测到网络流，应用网络选项");
            let mut options = ffmpeg::Dictionary::new();
            for (key, value) in config.network.to_pairs() {
                options.set(key, &value);
            }
            if url.contains(".m3u8") {
                info!("🎬 HLS 流检测，应用 HLS 选项");
                options.set("live_start_index", "-1");
                options.set("max_reload", "10");
                options.set("http_persistent", "1");
            }
            format::input_with_dictionary(&url, options)
                .map_err(|e| PlayerError::OpenFailure(format!("无法打开网络流: {}", e)))?
        } else {
            let flag = Arc::clone(&interrupt);
            format::input_with_interrupt(&url, move || flag.load(Ordering::Acquire))
                .map_err(|e| PlayerError::OpenFailure(format!("无法打开文件: {}", e)))?
        };

        if interrupt.load(Ordering::Acquire) {
            return Err(PlayerError::Abort);
        }

        let streams: Vec<StreamInfo> = input.streams().map(|s| describe_stream(&s)).collect();
        let format_name = input.format().name().to_string();
        let ts_discontinuity = unsafe {
            let iformat = (*input.as_ptr()).iformat;
            !iformat.is_null() && ((*iformat).flags as i64 & ffi::AVFMT_TS_DISCONT as i64) != 0
        };
        let realtime = matches!(format_name.as_str(), "rtp" | "rtsp" | "sdp")
            || url.starts_with("rtp:")
            || url.starts_with("udp:");

        for stream in &streams {
            debug!(
                "流 #{}: {:?} [{}] tb={}/{}",
                stream.index,
                stream.kind,
                stream.codec_name,
                stream.time_base.num,
                stream.time_base.den
            );
        }
        info!(
            "✅ 容器已打开: {} ({}), {} 条流",
            url,
            format_name,
            streams.len()
        );

        Ok(Self {
            input,
            streams,
            url: url.to_string(),
            format_name,
            realtime,
            ts_discontinuity,
        })
    }

    fn stream_of(&self, index: usize) -> Result<format::stream::Stream<'_>> {
        self.input
            .stream(index)
            .ok_or_else(|| PlayerError::InvalidStream(format!("流 #{} 不存在", index)))
    }
}

impl MediaSource for FFmpegDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn duration(&self) -> Option<f64> {
        valid_ts(self.input.duration())
            .filter(|d| *d > 0)
            .map(|d| d as f64 / TIME_BASE_US)
    }

    fn start_time(&self) -> Option<f64> {
        let start = unsafe { (*self.input.as_ptr()).start_time };
        valid_ts(start).map(|s| s as f64 / TIME_BASE_US)
    }

    fn bit_rate(&self) -> i64 {
        self.input.bit_rate()
    }

    fn read_packet(&mut self) -> ReadOutcome {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => ReadOutcome::Packet(from_native(&packet)),
            Err(ffmpeg::Error::Eof) => ReadOutcome::Eof,
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                ReadOutcome::Again
            }
            Err(e) => ReadOutcome::Failure(e.to_string()),
        }
    }

    fn seek(&mut self, target: SeekTarget) -> Result<()> {
        match target {
            SeekTarget::Time(seconds) => {
                let ts = (seconds * TIME_BASE_US) as i64;
                self.input.seek(ts, ..ts)?;
            }
            SeekTarget::Bytes(pos) => {
                let ret = unsafe {
                    ffi::avformat_seek_file(
                        self.input.as_mut_ptr(),
                        -1,
                        i64::MIN,
                        pos,
                        pos,
                        ffi::AVSEEK_FLAG_BYTE as i32,
                    )
                };
                if ret < 0 {
                    return Err(ffmpeg::Error::from(ret).into());
                }
            }
        }
        Ok(())
    }

    fn attached_picture(&self, stream_index: usize) -> Option<Packet> {
        let stream = self.input.stream(stream_index)?;
        let pkt = unsafe { &(*stream.as_ptr()).attached_pic };
        if pkt.data.is_null() || pkt.size <= 0 {
            return None;
        }
        let data = unsafe { std::slice::from_raw_parts(pkt.data, pkt.size as usize) }.to_vec();
        let mut packet = Packet::data(stream_index, data);
        packet.pts = valid_ts(pkt.pts);
        packet.dts = valid_ts(pkt.dts);
        packet.keyframe = true;
        Some(packet)
    }

    fn read_pause(&mut self) {
        if let Err(e) = self.input.pause() {
            debug!("暂停读取失败: {}", e);
        }
    }

    fn read_play(&mut self) {
        if let Err(e) = self.input.play() {
            debug!("恢复读取失败: {}", e);
        }
    }

    fn is_realtime(&self) -> bool {
        self.realtime
    }

    fn has_ts_discontinuity(&self) -> bool {
        self.ts_discontinuity
    }

    fn prefers_byte_seek(&self) -> bool {
        self.ts_discontinuity && self.format_name != "ogg"
    }

    fn best_stream(&self, kind: MediaKind, related: Option<usize>) -> Option<usize> {
        let media_type = match kind {
            MediaKind::Video => ffi::AVMediaType::AVMEDIA_TYPE_VIDEO,
            MediaKind::Audio => ffi::AVMediaType::AVMEDIA_TYPE_AUDIO,
            MediaKind::Subtitle => ffi::AVMediaType::AVMEDIA_TYPE_SUBTITLE,
            MediaKind::Data => return None,
        };
        let related = related.map(|r| r as i32).unwrap_or(-1);
        let best = unsafe {
            ffi::av_find_best_stream(
                self.input.as_ptr() as *mut _,
                media_type,
                -1,
                related,
                std::ptr::null_mut(),
                0,
            )
        };
        let best = usize::try_from(best).ok();
        match kind {
            // 只接受文本字幕
            MediaKind::Subtitle => best
                .filter(|i| self.streams.get(*i).is_some_and(|s| s.text_subtitle))
                .or_else(|| {
                    self.streams
                        .iter()
                        .find(|s| s.kind == MediaKind::Subtitle && s.text_subtitle)
                        .map(|s| s.index)
                }),
            _ => best,
        }
    }

    fn open_video_codec(&self, stream_index: usize) -> Result<VideoCodec> {
        Ok(Box::new(FFmpegVideoCodec::from_stream(self.stream_of(stream_index)?)?))
    }

    fn open_audio_codec(&self, stream_index: usize) -> Result<AudioCodec> {
        Ok(Box::new(FFmpegAudioCodec::from_stream(self.stream_of(stream_index)?)?))
    }

    fn open_subtitle_codec(&self, stream_index: usize) -> Result<SubtitleCodec> {
        Ok(Box::new(FFmpegSubtitleCodec::from_stream(
            self.stream_of(stream_index)?,
        )?))
    }

    fn description(&self) -> String {
        format!("FFmpeg Demuxer: {} ({})", self.url, self.format_name)
    }
}

/// 用 FFmpeg 打开容器的后端
#[derive(Debug, Default, Clone, Copy)]
pub struct FFmpegBackend;

impl MediaBackend for FFmpegBackend {
    fn open(
        &self,
        url: &str,
        config: &PlayerConfig,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Box<dyn MediaSource>> {
        match FFmpegDemuxer::open(url, config, interrupt) {
            Ok(demuxer) => Ok(Box::new(demuxer)),
            Err(e) => {
                warn!("打开失败: {}", e);
                Err(e)
            }
        }
    }
}

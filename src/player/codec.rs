use crate::core::{
    AudioBuffer, ColorDescriptor, ColorRange, ColorSpace, Packet, PixelFormat, Rational, Result,
    SubtitleEvent, VideoPicture,
};
use crate::player::audio_output::AudioSpec;
use crate::player::demuxer_source::{AudioDecode, Codec, Decoded, Feed};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, format, software, util};
use log::{debug, warn};
use std::collections::VecDeque;

/// 未给出结束时间的字幕默认显示时长（秒）
const DEFAULT_SUBTITLE_DURATION: f64 = 3.0;

/// 把引擎的数据包转换成 FFmpeg 数据包
fn to_native(packet: &Packet) -> ffmpeg::Packet {
    let mut native = ffmpeg::Packet::copy(&packet.data);
    native.set_stream(packet.stream_index);
    native.set_pts(packet.pts);
    native.set_dts(packet.dts);
    native.set_duration(packet.duration);
    native.set_position(packet.pos as isize);
    if packet.keyframe {
        native.set_flags(codec::packet::Flags::KEY);
    }
    native
}

fn is_again(err: &ffmpeg::Error) -> bool {
    matches!(err, ffmpeg::Error::Other { errno } if *errno == ffmpeg::error::EAGAIN)
}

fn feed_result(result: std::result::Result<(), ffmpeg::Error>) -> Feed {
    match result {
        Ok(()) => Feed::Accepted,
        Err(e) if is_again(&e) => Feed::Again,
        // 已送过 EOF 的解码器拒绝新数据，等冲刷后再继续
        Err(ffmpeg::Error::Eof) => Feed::Accepted,
        Err(e) => Feed::Failure(e.to_string()),
    }
}

fn rational(value: util::rational::Rational) -> Rational {
    Rational::new(value.numerator(), value.denominator())
}

// ============= 视频 =============

/// 视频解码器（软件解码，平面格式直接透传）
pub struct FFmpegVideoCodec {
    decoder: codec::decoder::Video,
    scaler: Option<ScalerState>,
    time_base: f64,
    last_pos: i64,
}

struct ScalerState {
    context: software::scaling::Context,
    source: util::format::Pixel,
    width: u32,
    height: u32,
}

// SwsContext 本身不是 Send，但我们确保只在单个线程中使用它
// 这是安全的，因为每个解码器实例只会在一个线程中使用
unsafe impl Send for FFmpegVideoCodec {}

impl FFmpegVideoCodec {
    pub fn from_stream(stream: format::stream::Stream) -> Result<Self> {
        let context = codec::context::Context::from_parameters(stream.parameters())?;
        let decoder = context.decoder().video()?;
        let time_base = stream.time_base();
        let time_base = time_base.numerator() as f64 / time_base.denominator() as f64;

        debug!(
            "视频解码器: {}x{}, 格式: {:?}",
            decoder.width(),
            decoder.height(),
            decoder.format()
        );

        Ok(Self {
            decoder,
            scaler: None,
            time_base,
            last_pos: -1,
        })
    }

    fn native_format(format: util::format::Pixel) -> Option<PixelFormat> {
        use util::format::Pixel;
        match format {
            Pixel::YUV420P | Pixel::YUVJ420P => Some(PixelFormat::YUV420P),
            Pixel::YUV422P | Pixel::YUVJ422P => Some(PixelFormat::YUV422P),
            Pixel::YUV444P | Pixel::YUVJ444P => Some(PixelFormat::YUV444P),
            Pixel::YUV420P10LE => Some(PixelFormat::YUV420P10),
            Pixel::NV12 => Some(PixelFormat::NV12),
            Pixel::GRAY8 => Some(PixelFormat::Gray8),
            Pixel::RGBA => Some(PixelFormat::RGBA),
            _ => None,
        }
    }

    fn color_of(frame: &util::frame::Video, format: PixelFormat) -> ColorDescriptor {
        use util::color::{Range, Space};
        let space = match frame.color_space() {
            Space::BT709 => ColorSpace::Bt709,
            Space::BT470BG | Space::SMPTE170M => ColorSpace::Bt601,
            Space::BT2020NCL | Space::BT2020CL => ColorSpace::Bt2020,
            _ => ColorSpace::Unspecified,
        };
        let range = match frame.color_range() {
            Range::MPEG => ColorRange::Limited,
            Range::JPEG => ColorRange::Full,
            _ => ColorRange::Unspecified,
        };
        ColorDescriptor {
            space,
            range,
            bit_depth: if format == PixelFormat::YUV420P10 { 10 } else { 8 },
        }
    }

    /// 非平面或不常见格式统一转换为 YUV420P
    fn convert_frame(&mut self, frame: util::frame::Video) -> std::result::Result<VideoPicture, String> {
        let width = frame.width();
        let height = frame.height();
        let pts = frame.timestamp().map(|ts| ts as f64 * self.time_base);
        let sample_aspect_ratio = rational(frame.aspect_ratio());

        let (frame, format) = match Self::native_format(frame.format()) {
            Some(format) => (frame, format),
            None => {
                let source = frame.format();
                let stale = match &self.scaler {
                    Some(s) => s.source != source || s.width != width || s.height != height,
                    None => true,
                };
                if stale {
                    debug!("🔧 初始化像素转换: {:?} → YUV420P ({}x{})", source, width, height);
                    let context = software::scaling::Context::get(
                        source,
                        width,
                        height,
                        util::format::Pixel::YUV420P,
                        width,
                        height,
                        software::scaling::Flags::BILINEAR,
                    )
                    .map_err(|e| e.to_string())?;
                    self.scaler = Some(ScalerState {
                        context,
                        source,
                        width,
                        height,
                    });
                }
                let scaler = self.scaler.as_mut().ok_or("像素转换未初始化")?;
                let mut converted = util::frame::Video::empty();
                scaler
                    .context
                    .run(&frame, &mut converted)
                    .map_err(|e| e.to_string())?;
                (converted, PixelFormat::YUV420P)
            }
        };

        let color = Self::color_of(&frame, format);
        let mut planes = Vec::with_capacity(format.plane_count());
        let mut strides = Vec::with_capacity(format.plane_count());
        for index in 0..format.plane_count() {
            planes.push(frame.data(index).to_vec());
            strides.push(frame.stride(index));
        }

        Ok(VideoPicture {
            width,
            height,
            format,
            planes,
            strides,
            color,
            sample_aspect_ratio,
            pts,
            pos: self.last_pos,
        })
    }
}

impl Codec for FFmpegVideoCodec {
    type Output = VideoPicture;

    fn send_packet(&mut self, packet: &Packet) -> Feed {
        self.last_pos = packet.pos;
        feed_result(self.decoder.send_packet(&to_native(packet)))
    }

    fn send_eof(&mut self) {
        if let Err(e) = self.decoder.send_eof() {
            debug!("视频解码器 send_eof: {}", e);
        }
    }

    fn receive(&mut self) -> Decoded<VideoPicture> {
        let mut frame = util::frame::Video::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => match self.convert_frame(frame) {
                Ok(picture) => Decoded::Frame(picture),
                Err(e) => Decoded::Failure(e),
            },
            Err(e) if is_again(&e) => Decoded::NeedMoreInput,
            Err(ffmpeg::Error::Eof) => Decoded::EndOfStream,
            Err(e) => Decoded::Failure(e.to_string()),
        }
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }

    fn description(&self) -> String {
        format!("ffmpeg video ({:?})", self.decoder.id())
    }
}

// ============= 音频 =============

/// 音频解码器：经 swr 转换成输出端的交错 f32（声道布局和采样率一并转换）
pub struct FFmpegAudioCodec {
    decoder: codec::decoder::Audio,
    resampler: Option<ResamplerState>,
    /// 输出格式，未设置时保持源采样率和声道数
    output: Option<AudioSpec>,
    /// 待下发给 swr 的采样数补偿
    compensation: Option<(i32, i32)>,
    time_base: f64,
    last_pos: i64,
}

struct ResamplerState {
    context: software::resampling::Context,
    format: util::format::Sample,
    layout: util::channel_layout::ChannelLayout,
    rate: u32,
    target_layout: util::channel_layout::ChannelLayout,
    target_rate: u32,
}

// SwrContext 同样只在所属解码线程内使用
unsafe impl Send for FFmpegAudioCodec {}

impl FFmpegAudioCodec {
    pub fn from_stream(stream: format::stream::Stream) -> Result<Self> {
        let context = codec::context::Context::from_parameters(stream.parameters())?;
        let decoder = context.decoder().audio()?;
        let time_base = stream.time_base();
        let time_base = time_base.numerator() as f64 / time_base.denominator() as f64;

        debug!(
            "音频解码器: {} Hz, {} 声道, 格式: {:?}",
            decoder.rate(),
            decoder.channels(),
            decoder.format()
        );

        Ok(Self {
            decoder,
            resampler: None,
            output: None,
            compensation: None,
            time_base,
            last_pos: -1,
        })
    }

    fn target_of(
        &self,
        layout: util::channel_layout::ChannelLayout,
        rate: u32,
    ) -> (util::channel_layout::ChannelLayout, u32) {
        match self.output {
            Some(spec) => {
                let target_layout = match spec.channels {
                    1 => util::channel_layout::ChannelLayout::MONO,
                    2 => util::channel_layout::ChannelLayout::STEREO,
                    6 => util::channel_layout::ChannelLayout::_5POINT1,
                    n => util::channel_layout::ChannelLayout::default(i32::from(n)),
                };
                (target_layout, spec.sample_rate)
            }
            None => (layout, rate),
        }
    }

    fn convert_frame(&mut self, frame: util::frame::Audio) -> std::result::Result<AudioBuffer, String> {
        let rate = frame.rate();
        let format = frame.format();
        let mut layout = frame.channel_layout();
        if layout.is_empty() {
            layout = util::channel_layout::ChannelLayout::default(i32::from(frame.channels()));
        }
        let (target_layout, target_rate) = self.target_of(layout, rate);
        let pts = frame.timestamp().map(|ts| ts as f64 * self.time_base);

        let stale = match &self.resampler {
            Some(r) => {
                r.format != format
                    || r.layout != layout
                    || r.rate != rate
                    || r.target_layout != target_layout
                    || r.target_rate != target_rate
            }
            None => true,
        };
        if stale {
            debug!(
                "🔧 初始化音频重采样器: {:?} {}Hz/{}ch → f32 {}Hz/{}ch",
                format,
                rate,
                layout.channels(),
                target_rate,
                target_layout.channels()
            );
            let context = software::resampling::Context::get(
                format,
                layout,
                rate,
                util::format::Sample::F32(util::format::sample::Type::Packed),
                target_layout,
                target_rate,
            )
            .map_err(|e| e.to_string())?;
            self.resampler = Some(ResamplerState {
                context,
                format,
                layout,
                rate,
                target_layout,
                target_rate,
            });
        }

        let compensation = self.compensation.take();
        let resampler = self.resampler.as_mut().ok_or("重采样器未初始化")?;
        if let Some((delta, distance)) = compensation {
            // 单位是输出采样，swr 在 distance 个采样内均匀拉伸
            let ret = unsafe {
                ffmpeg::ffi::swr_set_compensation(resampler.context.as_mut_ptr(), delta, distance)
            };
            if ret < 0 {
                warn!("swr_set_compensation 失败: {}", ffmpeg::Error::from(ret));
            }
        }

        // 输出容量：按采样率换算后再留出补偿余量
        let expected = frame.samples() as u64 * u64::from(target_rate) / u64::from(rate.max(1));
        let capacity = (expected + expected / 8 + 256) as usize;
        let mut converted = util::frame::Audio::new(
            util::format::Sample::F32(util::format::sample::Type::Packed),
            capacity,
            target_layout,
        );
        resampler
            .context
            .run(&frame, &mut converted)
            .map_err(|e| e.to_string())?;

        let channels = target_layout.channels() as u16;
        let count = converted.samples() * channels as usize;
        let bytes = converted.data(0);
        let byte_len = (count * std::mem::size_of::<f32>()).min(bytes.len());
        let samples = bytes[..byte_len]
            .chunks_exact(std::mem::size_of::<f32>())
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        Ok(AudioBuffer {
            samples,
            channels,
            sample_rate: target_rate,
            pts,
            pos: self.last_pos,
        })
    }
}

impl Codec for FFmpegAudioCodec {
    type Output = AudioBuffer;

    fn send_packet(&mut self, packet: &Packet) -> Feed {
        self.last_pos = packet.pos;
        feed_result(self.decoder.send_packet(&to_native(packet)))
    }

    fn send_eof(&mut self) {
        if let Err(e) = self.decoder.send_eof() {
            debug!("音频解码器 send_eof: {}", e);
        }
    }

    fn receive(&mut self) -> Decoded<AudioBuffer> {
        let mut frame = util::frame::Audio::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => match self.convert_frame(frame) {
                Ok(buffer) => Decoded::Frame(buffer),
                Err(e) => Decoded::Failure(e),
            },
            Err(e) if is_again(&e) => Decoded::NeedMoreInput,
            Err(ffmpeg::Error::Eof) => Decoded::EndOfStream,
            Err(e) => Decoded::Failure(e.to_string()),
        }
    }

    fn flush(&mut self) {
        self.decoder.flush();
        // 重建 swr，丢掉内部残留的采样和补偿状态
        self.resampler = None;
        self.compensation = None;
    }

    fn description(&self) -> String {
        format!("ffmpeg audio ({:?})", self.decoder.id())
    }
}

impl AudioDecode for FFmpegAudioCodec {
    fn set_output(&mut self, spec: AudioSpec) {
        self.output = Some(spec);
    }

    fn set_compensation(&mut self, delta: i32, distance: i32) {
        self.compensation = Some((delta, distance));
    }
}

// ============= 字幕 =============

/// 文本字幕解码器
///
/// FFmpeg 的字幕接口是一进一出，这里把结果暂存起来，适配成送包/取帧的模型。
pub struct FFmpegSubtitleCodec {
    decoder: codec::decoder::Subtitle,
    time_base: f64,
    pending: VecDeque<SubtitleEvent>,
    eof: bool,
}

impl FFmpegSubtitleCodec {
    pub fn from_stream(stream: format::stream::Stream) -> Result<Self> {
        let context = codec::context::Context::from_parameters(stream.parameters())?;
        let decoder = context.decoder().subtitle()?;
        let tb = stream.time_base();
        let time_base = tb.numerator() as f64 / tb.denominator() as f64;

        debug!("字幕解码器初始化: time_base = {}", time_base);

        Ok(Self {
            decoder,
            time_base,
            pending: VecDeque::new(),
            eof: false,
        })
    }

    fn decode(&mut self, packet: &Packet) -> std::result::Result<(), ffmpeg::Error> {
        let mut subtitle = codec::subtitle::Subtitle::new();
        if !self.decoder.decode(&to_native(packet), &mut subtitle)? {
            return Ok(());
        }

        // AVSubtitle.pts 以 AV_TIME_BASE 为单位
        let pts = subtitle
            .pts()
            .map(|p| p as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE))
            .or_else(|| packet.pts.map(|p| p as f64 * self.time_base));
        let start_display = f64::from(subtitle.start()) / 1000.0;
        let end_display = match subtitle.end() {
            0 if packet.duration > 0 => packet.duration as f64 * self.time_base,
            0 => DEFAULT_SUBTITLE_DURATION,
            end => f64::from(end) / 1000.0,
        };

        let mut text = String::new();
        for rect in subtitle.rects() {
            match rect {
                codec::subtitle::Rect::Text(t) => {
                    text.push_str(t.get());
                    text.push('\n');
                }
                codec::subtitle::Rect::Ass(a) => {
                    text.push_str(ass_dialogue_text(a.get()));
                    text.push('\n');
                }
                codec::subtitle::Rect::Bitmap(_) | codec::subtitle::Rect::None(_) => {
                    debug!("跳过位图字幕（当前仅支持文本字幕）");
                }
            }
        }

        let text = clean_subtitle_text(&text);
        if !text.is_empty() {
            self.pending.push_back(SubtitleEvent {
                text,
                pts,
                start_display,
                end_display,
            });
        }
        Ok(())
    }
}

impl Codec for FFmpegSubtitleCodec {
    type Output = SubtitleEvent;

    fn send_packet(&mut self, packet: &Packet) -> Feed {
        match self.decode(packet) {
            Ok(()) => Feed::Accepted,
            Err(e) if is_again(&e) => Feed::Accepted,
            Err(e) => {
                warn!("字幕解码失败: {}", e);
                Feed::Failure(e.to_string())
            }
        }
    }

    fn send_eof(&mut self) {
        self.eof = true;
    }

    fn receive(&mut self) -> Decoded<SubtitleEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Decoded::Frame(event);
        }
        if self.eof {
            self.eof = false;
            return Decoded::EndOfStream;
        }
        Decoded::NeedMoreInput
    }

    fn flush(&mut self) {
        self.pending.clear();
        self.eof = false;
    }

    fn description(&self) -> String {
        format!("ffmpeg subtitle ({:?})", self.decoder.id())
    }
}

/// ASS 事件行 "ReadOrder,Layer,Style,Name,MarginL,MarginR,MarginV,Effect,Text" 中的文本字段
fn ass_dialogue_text(line: &str) -> &str {
    let line = line.strip_prefix("Dialogue:").unwrap_or(line);
    let fields: Vec<&str> = line.splitn(9, ',').collect();
    if fields.len() == 9 {
        fields[8]
    } else {
        line
    }
}

/// 清理字幕文本：移除 ASS/HTML 标签、格式化换行
pub fn clean_subtitle_text(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_ass_tag = false;

    while let Some(ch) = chars.next() {
        match ch {
            '{' => in_ass_tag = true,
            '}' => in_ass_tag = false,
            _ if in_ass_tag => {}
            '<' => {
                // 简单标签 <i>, </b>, <font color=..> 整段跳过
                let mut tag = String::from('<');
                let mut closed = false;
                while let Some(&next) = chars.peek() {
                    if next == '>' {
                        chars.next();
                        closed = true;
                        break;
                    }
                    if next == '<' || next == '\n' {
                        break;
                    }
                    tag.push(next);
                    chars.next();
                }
                if !closed {
                    result.push_str(&tag);
                }
            }
            '\\' => match chars.peek() {
                Some('N') | Some('n') => {
                    chars.next();
                    result.push('\n');
                }
                Some('h') => {
                    chars.next();
                    result.push(' ');
                }
                _ => result.push(ch),
            },
            '\r' => {}
            _ => result.push(ch),
        }
    }

    result
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_strips_ass_overrides() {
        assert_eq!(clean_subtitle_text("{\\an8}Hello\\Nworld"), "Hello\nworld");
    }

    #[test]
    fn test_clean_strips_html_tags() {
        assert_eq!(
            clean_subtitle_text("<i>Hi</i> <font color=\"red\">there</font>\r\n\n"),
            "Hi there"
        );
    }

    #[test]
    fn test_clean_keeps_unclosed_angle_bracket() {
        assert_eq!(clean_subtitle_text("a < b"), "a < b");
    }

    #[test]
    fn test_ass_dialogue_field() {
        assert_eq!(
            ass_dialogue_text("0,0,Default,,0,0,0,,Text, with comma"),
            "Text, with comma"
        );
        assert_eq!(ass_dialogue_text("plain"), "plain");
    }
}

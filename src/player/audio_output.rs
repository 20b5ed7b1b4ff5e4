use crate::core::{PlayerError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, StreamConfig, SupportedStreamConfigRange};
use crossbeam::atomic::AtomicCell;
use crossbeam::queue::SegQueue;
use crossbeam_channel::{bounded, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// 音频输出格式（交错 f32）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpec {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioSpec {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self { sample_rate, channels }
    }

    /// 一个采样帧（所有声道）的字节数
    pub fn frame_size(&self) -> usize {
        self.channels as usize * std::mem::size_of::<f32>()
    }

    pub fn bytes_per_sec(&self) -> usize {
        self.frame_size() * self.sample_rate as usize
    }
}

/// 音频输出端
///
/// `queued_bytes()` 是已排队但尚未播放的字节数，音频时钟据此推算真正在播放的位置。
pub trait AudioSink: Send + Sync {
    fn spec(&self) -> AudioSpec;

    /// 排队一段交错 PCM；设备失效时返回 `DeviceFailure`
    fn queue(&self, samples: &[f32]) -> Result<()>;

    fn queued_bytes(&self) -> usize;

    fn play(&self);

    fn pause(&self);

    fn is_playing(&self) -> bool;

    /// 丢弃所有已排队数据
    fn flush(&self);

    fn set_gain(&self, gain: f64);

    /// 播放速率（同时改变音高）
    fn set_pitch(&self, pitch: f64);

    fn pitch(&self) -> f64;
}

/// 为每条音频流打开一个输出端
pub trait AudioSinkFactory: Send + Sync {
    fn open(&self, wanted: AudioSpec) -> Result<Arc<dyn AudioSink>>;
}

/// 音频线程与回调共享的状态
struct SinkShared {
    chunks: SegQueue<Vec<f32>>,
    queued_samples: AtomicUsize,
    flush_epoch: AtomicU64,
    playing: AtomicBool,
    gain: AtomicCell<f32>,
    pitch: AtomicCell<f64>,
    failure: Mutex<Option<String>>,
}

impl SinkShared {
    fn push(&self, samples: &[f32]) {
        self.queued_samples.fetch_add(samples.len(), Ordering::AcqRel);
        self.chunks.push(samples.to_vec());
    }

    /// 只扣除真正从队列里取走的量；回调手上的剩余部分由回调在发现新纪元时扣除
    fn flush(&self) {
        let mut dropped = 0;
        while let Some(chunk) = self.chunks.pop() {
            dropped += chunk.len();
        }
        self.flush_epoch.fetch_add(1, Ordering::AcqRel);
        self.consume(dropped);
    }

    fn consume(&self, samples: usize) {
        let _ = self
            .queued_samples
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |q| Some(q.saturating_sub(samples)));
    }
}

/// 回调侧的读取状态：当前块 + 线性插值变速
struct CallbackState {
    channels: usize,
    chunk: Vec<f32>,
    offset: usize,
    epoch: u64,
    prev: Vec<f32>,
    cur: Vec<f32>,
    frac: f64,
}

impl CallbackState {
    fn new(channels: usize) -> Self {
        Self {
            channels,
            chunk: Vec::new(),
            offset: 0,
            epoch: 0,
            prev: vec![0.0; channels],
            cur: vec![0.0; channels],
            frac: 1.0,
        }
    }

    /// 取出一个采样帧到 `cur`，没有数据时返回 false
    fn pop_frame(&mut self, shared: &SinkShared) -> bool {
        let epoch = shared.flush_epoch.load(Ordering::Acquire);
        if epoch != self.epoch {
            self.epoch = epoch;
            shared.consume(self.chunk.len().saturating_sub(self.offset));
            self.chunk.clear();
            self.offset = 0;
        }
        while self.offset + self.channels > self.chunk.len() {
            match shared.chunks.pop() {
                Some(chunk) => {
                    self.chunk = chunk;
                    self.offset = 0;
                }
                None => return false,
            }
        }
        self.cur
            .copy_from_slice(&self.chunk[self.offset..self.offset + self.channels]);
        self.offset += self.channels;
        shared.consume(self.channels);
        true
    }

    fn fill(&mut self, data: &mut [f32], shared: &SinkShared) {
        if !shared.playing.load(Ordering::Acquire) {
            data.fill(0.0);
            return;
        }
        let gain = shared.gain.load();
        let pitch = shared.pitch.load().clamp(0.25, 4.0);
        for out in data.chunks_mut(self.channels) {
            let mut starved = false;
            while self.frac >= 1.0 {
                std::mem::swap(&mut self.prev, &mut self.cur);
                if !self.pop_frame(shared) {
                    // 欠载：保持位置，输出静音
                    std::mem::swap(&mut self.prev, &mut self.cur);
                    starved = true;
                    break;
                }
                self.frac -= 1.0;
            }
            if starved {
                out.fill(0.0);
                continue;
            }
            let frac = self.frac as f32;
            for (c, sample) in out.iter_mut().enumerate() {
                let a = self.prev[c];
                let b = self.cur[c];
                *sample = (a + (b - a) * frac) * gain;
            }
            self.frac += pitch;
        }
    }
}

/// 音频输出 - 使用 cpal 播放音频
///
/// cpal 的 Stream 不能跨线程移动，因此由专用线程创建并持有，
/// 其它线程只通过共享状态和命令通道与它交互。
pub struct CpalSink {
    spec: AudioSpec,
    shared: Arc<SinkShared>,
    stop_tx: Sender<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CpalSink {
    /// 创建音频输出（支持非标准配置自动回退）
    pub fn open(wanted: AudioSpec) -> Result<Self> {
        info!("初始化音频输出: {} Hz, {} 声道", wanted.sample_rate, wanted.channels);

        let shared = Arc::new(SinkShared {
            chunks: SegQueue::new(),
            queued_samples: AtomicUsize::new(0),
            flush_epoch: AtomicU64::new(0),
            playing: AtomicBool::new(false),
            gain: AtomicCell::new(1.0),
            pitch: AtomicCell::new(1.0),
            failure: Mutex::new(None),
        });

        let (ready_tx, ready_rx) = bounded::<Result<AudioSpec>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread_shared = Arc::clone(&shared);

        let handle = thread::Builder::new()
            .name("audio-sink".into())
            .spawn(move || {
                let stream = match Self::build_stream(wanted, &thread_shared) {
                    Ok((stream, spec)) => {
                        let _ = ready_tx.send(Ok(spec));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // 持有 stream 直到收到停止命令或发送端被丢弃
                let _ = stop_rx.recv();
                drop(stream);
                debug!("音频输出线程退出");
            })
            .map_err(|e| PlayerError::DeviceFailure(format!("无法创建音频线程: {}", e)))?;

        let spec = match ready_rx.recv() {
            Ok(Ok(spec)) => spec,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(PlayerError::DeviceFailure("音频线程意外退出".into()));
            }
        };

        info!("✅ 音频输出已启动: {} Hz, {} 声道", spec.sample_rate, spec.channels);

        Ok(Self {
            spec,
            shared,
            stop_tx,
            thread: Mutex::new(Some(handle)),
        })
    }

    fn build_stream(wanted: AudioSpec, shared: &Arc<SinkShared>) -> Result<(cpal::Stream, AudioSpec)> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlayerError::DeviceFailure("无法找到音频输出设备".to_string()))?;

        debug!("使用音频设备: {}", device.name().unwrap_or_default());

        let config = Self::resolve_config(&device, wanted)?;
        let spec = AudioSpec::new(config.sample_rate.0, config.channels);

        let mut state = CallbackState::new(spec.channels as usize);
        let data_shared = Arc::clone(shared);
        let error_shared = Arc::clone(shared);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    state.fill(data, &data_shared);
                },
                move |err| {
                    error!("音频流错误: {}", err);
                    *error_shared.failure.lock() = Some(err.to_string());
                },
                None,
            )
            .map_err(|e| PlayerError::DeviceFailure(format!("创建音频流失败: {}", e)))?;

        stream
            .play()
            .map_err(|e| PlayerError::DeviceFailure(format!("启动音频流失败: {}", e)))?;

        Ok((stream, spec))
    }

    /// 设备不支持请求的配置时回退到标准配置
    fn resolve_config(device: &Device, wanted: AudioSpec) -> Result<StreamConfig> {
        let candidates = [
            (wanted.sample_rate, wanted.channels),
            (48000, wanted.channels),
            (44100, wanted.channels),
            (48000, 2),  // 最常见
            (44100, 2),  // CD 音质
            (48000, 1),
            (44100, 1),
        ];

        for (index, (rate, channels)) in candidates.iter().enumerate() {
            let config = StreamConfig {
                channels: *channels,
                sample_rate: cpal::SampleRate(*rate),
                buffer_size: cpal::BufferSize::Default,
            };
            let supported = device
                .supported_output_configs()
                .map_err(|e| PlayerError::DeviceFailure(format!("无法获取支持的音频配置: {}", e)))?;
            let compatible = supported
                .into_iter()
                .any(|range| Self::is_config_compatible(&config, &range));
            if compatible {
                if index > 0 {
                    warn!(
                        "⚠️  音频设备不支持 {} Hz, {} 声道，回退到 {} Hz, {} 声道",
                        wanted.sample_rate, wanted.channels, rate, channels
                    );
                }
                return Ok(config);
            }
        }

        Err(PlayerError::DeviceFailure(format!(
            "音频设备不支持任何标准配置 (原请求: {} Hz, {} 声道)",
            wanted.sample_rate, wanted.channels
        )))
    }

    /// 检查配置是否兼容
    fn is_config_compatible(config: &StreamConfig, supported: &SupportedStreamConfigRange) -> bool {
        let rate_in_range = config.sample_rate.0 >= supported.min_sample_rate().0
            && config.sample_rate.0 <= supported.max_sample_rate().0;
        rate_in_range
            && config.channels == supported.channels()
            && supported.sample_format() == cpal::SampleFormat::F32
    }
}

impl AudioSink for CpalSink {
    fn spec(&self) -> AudioSpec {
        self.spec
    }

    fn queue(&self, samples: &[f32]) -> Result<()> {
        if let Some(reason) = self.shared.failure.lock().clone() {
            return Err(PlayerError::DeviceFailure(reason));
        }
        if samples.is_empty() {
            return Ok(());
        }
        self.shared.push(samples);
        Ok(())
    }

    fn queued_bytes(&self) -> usize {
        self.shared.queued_samples.load(Ordering::Acquire) * std::mem::size_of::<f32>()
    }

    fn play(&self) {
        self.shared.playing.store(true, Ordering::Release);
    }

    fn pause(&self) {
        self.shared.playing.store(false, Ordering::Release);
    }

    fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }

    fn flush(&self) {
        self.shared.flush();
    }

    fn set_gain(&self, gain: f64) {
        self.shared.gain.store(gain.max(0.0) as f32);
    }

    fn set_pitch(&self, pitch: f64) {
        self.shared.pitch.store(pitch);
    }

    fn pitch(&self) -> f64 {
        self.shared.pitch.load()
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        info!("音频输出已停止");
    }
}

/// 默认工厂：cpal 默认输出设备
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalSinkFactory;

impl AudioSinkFactory for CpalSinkFactory {
    fn open(&self, wanted: AudioSpec) -> Result<Arc<dyn AudioSink>> {
        Ok(Arc::new(CpalSink::open(wanted)?))
    }
}

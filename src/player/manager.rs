use crate::core::{
    MediaKind, PlaybackState, PlayerConfig, PlayerError, PlayerEvent, PlayerStats, Result,
};
use crate::player::audio_output::AudioSinkFactory;
use crate::player::demuxer_source::{MediaBackend, SeekTarget};
use crate::player::demuxer_thread::StreamDemuxer;
use crate::player::log_ctx;
use crate::player::render_thread::{RenderHandle, RenderThread};
use crate::player::state::PlayerShared;
use crate::player::surface::{LogSurface, VideoSurface};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// 一次打开对应的会话：共享状态、解复用线程、渲染线程
struct Session {
    shared: Arc<PlayerShared>,
    demuxer: StreamDemuxer,
    render: Option<RenderHandle>,
}

/// 播放器 - 整体控制播放流程
///
/// 所有方法都在调用方线程执行，只改共享状态或给解复用线程发命令，
/// 不会阻塞在解码或 IO 上（`open` 的看门狗等待除外）。
pub struct Player {
    config: PlayerConfig,
    backend: Arc<dyn MediaBackend>,
    sinks: Arc<dyn AudioSinkFactory>,
    surface: Option<Box<dyn VideoSurface>>,
    events_tx: Sender<PlayerEvent>,
    events_rx: Receiver<PlayerEvent>,
    session: Option<Session>,
    /// 当前打开的文件路径（用于停止后重新播放）
    current_path: Option<String>,
}

impl Player {
    pub fn new(
        config: PlayerConfig,
        backend: Arc<dyn MediaBackend>,
        sinks: Arc<dyn AudioSinkFactory>,
        surface: Box<dyn VideoSurface>,
    ) -> Self {
        info!("{} 🎮 创建播放器...", log_ctx());
        let (events_tx, events_rx) = unbounded();
        Self {
            config,
            backend,
            sinks,
            surface: Some(surface),
            events_tx,
            events_rx,
            session: None,
            current_path: None,
        }
    }

    /// 通知通道；可以多次获取，所有接收端共享同一队列
    pub fn events(&self) -> Receiver<PlayerEvent> {
        self.events_rx.clone()
    }

    /// 打开媒体文件
    ///
    /// 先关闭当前会话，再启动解复用线程并等待容器打开。超过
    /// `open_timeout_ms` 仍未完成时上报超时并放弃该线程，阻塞的
    /// 网络 IO 返回后它会自行退出。
    pub fn open(&mut self, path: &str) -> Result<()> {
        info!("{} 📂 打开媒体文件: {}", log_ctx(), path);
        self.close();

        let shared = Arc::new(PlayerShared::new(self.config.clone(), self.events_tx.clone()));
        let (demuxer, opened) = StreamDemuxer::open(
            path,
            Arc::clone(&shared),
            Arc::clone(&self.backend),
            Arc::clone(&self.sinks),
        )?;

        let timeout = Duration::from_millis(self.config.open_timeout_ms);
        let result = match opened.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                let err = PlayerError::Timeout(self.config.open_timeout_ms);
                error!("{} ❌ {}", log_ctx(), err);
                shared.report_error(&err);
                demuxer.detach();
                return Err(err);
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(PlayerError::OpenFailure("解复用线程意外退出".into()))
            }
        };
        if let Err(err) = result {
            error!("{} ❌ 打开失败: {}", log_ctx(), err);
            shared.report_error(&err);
            drop(demuxer);
            return Err(err);
        }

        let surface = self
            .surface
            .take()
            .unwrap_or_else(|| Box::new(LogSurface::new()));
        let render = match RenderThread::new(Arc::clone(&shared), surface).spawn() {
            Ok(render) => render,
            Err(err) => {
                shared.report_error(&err);
                drop(demuxer);
                return Err(err);
            }
        };

        self.session = Some(Session {
            shared,
            demuxer,
            render: Some(render),
        });
        self.current_path = Some(path.to_string());
        info!("{} ✅ 媒体已打开: {}", log_ctx(), path);
        Ok(())
    }

    /// 关闭当前会话：先停渲染线程（收回呈现端），再关闭解复用线程和解码器
    pub fn close(&mut self) -> bool {
        let Some(mut session) = self.session.take() else {
            return false;
        };
        info!("{} 🛑 关闭播放会话", log_ctx());
        session.shared.request_abort();
        if let Some(render) = session.render.take() {
            match render.stop() {
                Some(surface) => self.surface = Some(surface),
                None => warn!("{} ⚠ 呈现端丢失，改用日志呈现端", log_ctx()),
            }
        }
        session.demuxer.close();
        true
    }

    /// 播放；停止后会重新打开上一次的文件
    pub fn play(&mut self) -> Result<()> {
        if self.session.is_none() {
            let path = self.current_path.clone().ok_or(PlayerError::NotOpened)?;
            info!("{} ▶️ 重新打开: {}", log_ctx(), path);
            return self.open(&path);
        }
        let shared = Arc::clone(self.shared()?);
        if shared.is_paused() {
            self.pause_toggle()?;
        } else if shared.is_stepping() {
            shared.set_step(false);
            shared.notify_state();
        }
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        if !self.shared()?.is_paused() {
            self.pause_toggle()?;
        }
        Ok(())
    }

    pub fn pause_toggle(&mut self) -> Result<()> {
        let session = self.session.as_ref().ok_or(PlayerError::NotOpened)?;
        session.demuxer.pause_toggle();
        session.shared.set_step(false);
        session.shared.notify_state();
        Ok(())
    }

    /// 停止播放
    pub fn stop(&mut self) {
        info!("{} ⏹️ 停止播放", log_ctx());
        if self.close() {
            let _ = self.events_tx.send(PlayerEvent::StateChanged(PlaybackState::Stopped));
        }
        info!("{} ✅ 停止播放完成", log_ctx());
    }

    /// 跳转到绝对位置（秒）；字节模式下按码率换算成字节偏移
    pub fn seek(&mut self, seconds: f64) -> Result<()> {
        let session = self.session.as_ref().ok_or(PlayerError::NotOpened)?;
        let seconds = seconds.max(0.0);
        debug!("{} ⏩ seek 到 {:.3}s", log_ctx(), seconds);
        session.demuxer.seek(seconds);
        Ok(())
    }

    /// 相对跳转
    ///
    /// 时间模式以主时钟为起点；字节模式以当前显示帧的字节位置为起点，
    /// 按码率估算偏移。
    pub fn seek_relative(&mut self, delta: f64) -> Result<()> {
        let session = self.session.as_ref().ok_or(PlayerError::NotOpened)?;
        let shared = &session.shared;
        if shared.seek_by_bytes() {
            let pos = shared.current_byte_pos().max(0) as f64 + delta * shared.bytes_per_sec();
            let target = pos.max(0.0) as i64;
            let seconds = (shared.position() + delta).max(0.0);
            debug!("{} ⏩ 按字节相对 seek: {} ({:+.1}s)", log_ctx(), target, delta);
            session.demuxer.seek_target(SeekTarget::Bytes(target), seconds);
        } else {
            let target = (shared.position() + delta).max(0.0);
            debug!("{} ⏩ 相对 seek: {:+.1}s -> {:.3}s", log_ctx(), delta, target);
            session.demuxer.seek(target);
        }
        Ok(())
    }

    /// 单步；负数表示后退：暂停后 seek 到视频时钟之前的位置再前进一帧
    pub fn step_frame(&mut self, count: i32) -> Result<()> {
        let session = self.session.as_ref().ok_or(PlayerError::NotOpened)?;
        let shared = &session.shared;
        if shared.active_stream(MediaKind::Video).is_none() {
            // 没有视频时渲染线程不会重新暂停，单步无意义
            debug!("{} 没有视频流，忽略单步", log_ctx());
            return Ok(());
        }
        if count >= 0 {
            for _ in 0..count {
                session.demuxer.step_frame();
            }
            if count > 0 {
                shared.notify_state();
            }
            return Ok(());
        }

        if !shared.is_paused() {
            session.demuxer.pause_toggle();
        }
        let fps = self.video_fps();
        let pts = shared.vid_clk.pts();
        if pts.is_nan() || fps <= 0.0 {
            return Ok(());
        }
        let target = (pts + f64::from(count - 1) / fps).max(0.0);
        debug!("{} ⏪ 后退 {} 帧 -> {:.3}s", log_ctx(), -count, target);
        session.demuxer.seek(target);
        shared.set_force_refresh(true);
        session.demuxer.step_frame();
        shared.notify_state();
        Ok(())
    }

    // ============= 音量 / 速度 =============

    /// 音量，小于 0 按 0 处理；未变化时不发通知
    pub fn set_volume(&mut self, volume: f64) {
        let volume = volume.max(0.0);
        if volume == self.config.volume {
            return;
        }
        self.config.volume = volume;
        match &self.session {
            Some(session) => session.shared.set_volume(volume),
            None => {
                let _ = self.events_tx.send(PlayerEvent::VolumeChanged(volume));
            }
        }
    }

    pub fn volume(&self) -> f64 {
        self.config.volume
    }

    pub fn set_muted(&mut self, muted: bool) {
        if muted == self.config.muted {
            return;
        }
        self.config.muted = muted;
        match &self.session {
            Some(session) => session.shared.set_muted(muted),
            None => {
                let _ = self.events_tx.send(PlayerEvent::MuteChanged(muted));
            }
        }
    }

    pub fn muted(&self) -> bool {
        self.config.muted
    }

    /// 播放速度（音频音高），主时钟跟随
    pub fn set_speed(&mut self, speed: f64) -> Result<()> {
        if speed.is_nan() || speed <= 0.0 {
            return Err(PlayerError::Config(format!("无效的播放速度: {}", speed)));
        }
        self.shared()?.set_speed(speed);
        Ok(())
    }

    pub fn speed(&self) -> f64 {
        self.session
            .as_ref()
            .map(|s| s.shared.speed())
            .unwrap_or(1.0)
    }

    // ============= 查询 =============

    pub fn position(&self) -> f64 {
        self.session
            .as_ref()
            .map(|s| s.shared.position())
            .unwrap_or(0.0)
    }

    pub fn duration(&self) -> f64 {
        self.session
            .as_ref()
            .map(|s| s.shared.duration())
            .unwrap_or(0.0)
    }

    /// 暂停或单步中都算暂停
    pub fn paused(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| s.shared.is_paused() || s.shared.is_stepping())
            .unwrap_or(false)
    }

    pub fn state(&self) -> PlaybackState {
        self.session
            .as_ref()
            .map(|s| s.shared.playback_state())
            .unwrap_or(PlaybackState::Stopped)
    }

    pub fn stats(&self) -> PlayerStats {
        self.session
            .as_ref()
            .map(|s| s.shared.stats())
            .unwrap_or_default()
    }

    pub fn current_path(&self) -> Option<&str> {
        self.current_path.as_deref()
    }

    // ============= 流 =============

    pub fn active_video_stream(&self) -> i32 {
        self.active_relative(MediaKind::Video)
    }

    pub fn active_audio_stream(&self) -> i32 {
        self.active_relative(MediaKind::Audio)
    }

    pub fn active_subtitle_stream(&self) -> i32 {
        self.active_relative(MediaKind::Subtitle)
    }

    fn active_relative(&self, kind: MediaKind) -> i32 {
        self.session
            .as_ref()
            .and_then(|s| {
                let index = s.shared.active_stream(kind)?;
                s.shared.relative_stream_index(kind, index)
            })
            .map(|n| n as i32)
            .unwrap_or(-1)
    }

    /// 按相对序号切换音频流，负数表示关闭音频
    pub fn set_active_audio_stream(&mut self, relative: i32) -> Result<()> {
        let session = self.session.as_ref().ok_or(PlayerError::NotOpened)?;
        let index = if relative < 0 {
            None
        } else {
            let index = session
                .shared
                .absolute_stream_index(MediaKind::Audio, relative as usize)
                .ok_or_else(|| PlayerError::InvalidStream(format!("音频流 #{}", relative)))?;
            Some(index)
        };
        info!("{} 🔀 切换音频流: {:?}", log_ctx(), index);
        session.demuxer.select_stream(MediaKind::Audio, index)
    }

    /// 切到同类型的下一条流（字幕到末尾后关闭）
    pub fn cycle_stream(&mut self, kind: MediaKind) -> Result<()> {
        if kind == MediaKind::Data {
            return Err(PlayerError::InvalidStream("数据流不能切换".into()));
        }
        let session = self.session.as_ref().ok_or(PlayerError::NotOpened)?;
        info!("{} 🔀 循环切换 {} 流", log_ctx(), kind.as_str());
        session.demuxer.cycle_stream(kind)
    }

    pub fn video_streams(&self) -> Vec<String> {
        self.stream_names(MediaKind::Video)
    }

    pub fn audio_streams(&self) -> Vec<String> {
        self.stream_names(MediaKind::Audio)
    }

    pub fn subtitle_streams(&self) -> Vec<String> {
        self.stream_names(MediaKind::Subtitle)
    }

    fn stream_names(&self, kind: MediaKind) -> Vec<String> {
        self.session
            .as_ref()
            .map(|s| s.shared.stream_names(kind))
            .unwrap_or_default()
    }

    /// 当前视频流的宽高
    pub fn video_size(&self) -> Option<(u32, u32)> {
        let session = self.session.as_ref()?;
        let info = session
            .shared
            .active_stream(MediaKind::Video)
            .and_then(|index| session.shared.stream(index))?;
        Some((info.width, info.height))
    }

    pub fn video_fps(&self) -> f64 {
        self.session
            .as_ref()
            .and_then(|s| {
                let index = s.shared.active_stream(MediaKind::Video)?;
                s.shared.stream(index)
            })
            .filter(|info| info.frame_rate.is_valid())
            .map(|info| info.frame_rate.to_f64())
            .unwrap_or(0.0)
    }

    /// 显示宽高比：像素宽高比 × 宽 / 高，像素宽高比未知时按 1:1
    pub fn video_sar(&self) -> f64 {
        let Some(session) = &self.session else {
            return 0.0;
        };
        let Some(info) = session
            .shared
            .active_stream(MediaKind::Video)
            .and_then(|index| session.shared.stream(index))
        else {
            return 0.0;
        };
        if info.height == 0 {
            return 0.0;
        }
        let sar = if info.sample_aspect_ratio.is_valid() {
            info.sample_aspect_ratio.to_f64()
        } else {
            1.0
        };
        sar * info.width as f64 / info.height as f64
    }

    fn shared(&self) -> Result<&Arc<PlayerShared>> {
        self.session
            .as_ref()
            .map(|s| &s.shared)
            .ok_or(PlayerError::NotOpened)
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.close();
    }
}

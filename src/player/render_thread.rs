use crate::core::{now_secs, Frame, MediaKind, PlayerError, PlayerEvent, Result, SyncMaster};
use crate::player::log_ctx;
use crate::player::state::PlayerShared;
use crate::player::surface::VideoSurface;
use log::{error, info, trace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// 刷新循环的默认休眠（秒）
pub const REFRESH_RATE: f64 = 0.01;
/// 同步阈值下限
pub const AV_SYNC_THRESHOLD_MIN: f64 = 0.04;
/// 同步阈值上限
pub const AV_SYNC_THRESHOLD_MAX: f64 = 0.1;
/// 帧时长超过该值时不再用重复显示来等待，而是整段补上差值
pub const AV_SYNC_FRAMEDUP_THRESHOLD: f64 = 0.1;

/// 视频不是主时钟时，根据 `diff`（视频时钟 - 主时钟）调整本帧的显示时长
///
/// `diff` 为 None 表示视频就是主时钟。
pub fn compute_target_delay(delay: f64, diff: Option<f64>, max_frame_duration: f64) -> f64 {
    let Some(diff) = diff else {
        return delay;
    };
    let sync_threshold = AV_SYNC_THRESHOLD_MAX.min(delay).max(AV_SYNC_THRESHOLD_MIN);
    if !diff.is_nan() && diff.abs() < max_frame_duration {
        if diff <= -sync_threshold {
            return (delay + diff).max(0.0);
        } else if diff >= sync_threshold && delay > AV_SYNC_FRAMEDUP_THRESHOLD {
            return delay + diff;
        } else if diff >= sync_threshold {
            return 2.0 * delay;
        }
    }
    delay
}

/// 两帧之间的显示时长；序号不同时为 0
pub fn vp_duration<T>(vp: &Frame<T>, next: &Frame<T>, max_frame_duration: f64) -> f64 {
    if vp.serial != next.serial {
        return 0.0;
    }
    let duration = next.pts - vp.pts;
    if duration.is_nan() || duration <= 0.0 || duration > max_frame_duration {
        vp.duration
    } else {
        duration
    }
}

/// 渲染线程：按主时钟决定每一帧何时显示，过晚的帧直接丢弃
pub struct RenderThread {
    shared: Arc<PlayerShared>,
    surface: Box<dyn VideoSurface>,
    last_position_ms: Option<i64>,
    next_position_at: f64,
}

impl RenderThread {
    pub fn new(shared: Arc<PlayerShared>, surface: Box<dyn VideoSurface>) -> Self {
        Self {
            shared,
            surface,
            last_position_ms: None,
            next_position_at: 0.0,
        }
    }

    pub fn spawn(self) -> Result<RenderHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let mut render = self;
        let thread = thread::Builder::new()
            .name("render".into())
            .spawn(move || {
                render.run(&thread_stop);
                render.surface
            })
            .map_err(|e| PlayerError::DecodeFailure(format!("无法创建渲染线程: {}", e)))?;
        Ok(RenderHandle {
            stop,
            thread: Some(thread),
        })
    }

    fn run(&mut self, stop: &AtomicBool) {
        info!("{} 🖼 渲染线程启动", log_ctx());
        let mut remaining = 0.0;
        loop {
            if remaining > 0.0 {
                thread::sleep(Duration::from_secs_f64(remaining));
            }
            remaining = REFRESH_RATE;
            if stop.load(Ordering::Acquire) || self.shared.abort_requested() {
                break;
            }
            self.tick(now_secs(), &mut remaining);
        }
        info!("{} 🖼 渲染线程退出", log_ctx());
    }

    /// 一次刷新；`time` 为当前墙上时间，`remaining` 返回下次刷新前应休眠的时间
    pub fn tick(&mut self, time: f64, remaining: &mut f64) {
        let shared = Arc::clone(&self.shared);
        if !shared.is_paused()
            && shared.master_sync_type() == SyncMaster::External
            && shared.is_realtime()
        {
            shared.check_external_clock_speed();
        }
        if !shared.is_paused() || shared.force_refresh() {
            self.video_refresh(time, remaining);
        }
        self.notify_position(time);
    }

    fn video_refresh(&mut self, time: f64, remaining: &mut f64) {
        let shared = Arc::clone(&self.shared);
        if shared.active_stream(MediaKind::Video).is_some() {
            self.advance(&shared, time, remaining);
        }
        if shared.force_refresh() && shared.video_fq.has_shown() {
            self.display(&shared);
        }
        shared.set_force_refresh(false);
    }

    /// 决定是否换到下一帧
    fn advance(&mut self, shared: &PlayerShared, time: f64, remaining: &mut f64) {
        let fq = &shared.video_fq;
        let max_frame_duration = shared.max_frame_duration();
        loop {
            if fq.nb_remaining() == 0 {
                return;
            }
            let (Some(lastvp), Some(vp)) = (fq.peek_last(), fq.peek()) else {
                return;
            };

            if vp.serial != shared.video_pq.serial() {
                fq.next();
                continue;
            }
            if lastvp.serial != vp.serial {
                shared.set_frame_timer(time);
            }
            if shared.is_paused() {
                return;
            }

            let last_duration = vp_duration(&lastvp, &vp, max_frame_duration);
            let diff = if shared.master_sync_type() == SyncMaster::Video {
                None
            } else {
                Some(shared.vid_clk.get_at(time) - shared.master_time_at(time))
            };
            let delay = compute_target_delay(last_duration, diff, max_frame_duration);

            let mut frame_timer = shared.frame_timer();
            if time < frame_timer + delay {
                *remaining = (frame_timer + delay - time).min(*remaining);
                return;
            }

            frame_timer += delay;
            if delay > 0.0 && time - frame_timer > AV_SYNC_THRESHOLD_MAX {
                frame_timer = time;
            }
            shared.set_frame_timer(frame_timer);

            if !vp.pts.is_nan() {
                shared.vid_clk.set_at(vp.pts, vp.serial, time);
                shared.ext_clk.sync_to_at(&shared.vid_clk, time);
            }

            if fq.nb_remaining() > 1 {
                if let Some(nextvp) = fq.peek_next() {
                    let duration = vp_duration(&vp, &nextvp, max_frame_duration);
                    if !shared.is_stepping()
                        && shared.framedrop_enabled()
                        && time > frame_timer + duration
                    {
                        shared.count_late_drop();
                        trace!("延迟丢帧 pts={:.3}", vp.pts);
                        fq.next();
                        continue;
                    }
                }
            }

            self.expire_subtitles(shared);

            fq.next();
            shared.set_force_refresh(true);

            if shared.is_stepping() && !shared.is_paused() {
                shared.pause_toggle();
            }
            return;
        }
    }

    /// 丢弃过期或已被下一条取代的字幕
    fn expire_subtitles(&self, shared: &PlayerShared) {
        if shared.active_stream(MediaKind::Subtitle).is_none() {
            return;
        }
        let sq = &shared.subtitle_fq;
        let video_pts = shared.vid_clk.pts();
        while sq.nb_remaining() > 0 {
            let Some(sp) = sq.peek() else {
                break;
            };
            let sp2 = if sq.nb_remaining() > 1 { sq.peek_next() } else { None };
            let stale = sp.serial != shared.subtitle_pq.serial()
                || video_pts > sp.pts + sp.payload.end_display
                || sp2
                    .map(|sp2| video_pts > sp2.pts + sp2.payload.start_display)
                    .unwrap_or(false);
            if !stale {
                break;
            }
            sq.next();
        }
    }

    fn display(&mut self, shared: &PlayerShared) {
        let Some(frame) = shared.video_fq.peek_last() else {
            return;
        };
        self.surface.present(&frame);

        let video_pts = shared.vid_clk.pts();
        let subtitle = if shared.subtitle_fq.nb_remaining() > 0 {
            shared
                .subtitle_fq
                .peek()
                .filter(|sp| video_pts >= sp.pts + sp.payload.start_display)
        } else {
            None
        };
        self.surface.set_subtitle(subtitle.as_ref().map(|sp| sp.payload.as_ref()));
    }

    /// 位置按配置的间隔节流，毫秒值变化时才通知
    fn notify_position(&mut self, time: f64) {
        if time < self.next_position_at {
            return;
        }
        self.next_position_at = time + self.shared.config.position_interval_ms as f64 / 1000.0;
        let position = self.shared.position();
        if position.is_nan() {
            return;
        }
        let ms = (position * 1000.0) as i64;
        if self.last_position_ms != Some(ms) {
            self.last_position_ms = Some(ms);
            self.shared.emit(PlayerEvent::PositionChanged(position));
        }
    }
}

/// 运行中的渲染线程，停止后交还呈现端
pub struct RenderHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Box<dyn VideoSurface>>>,
}

impl RenderHandle {
    pub fn stop(mut self) -> Option<Box<dyn VideoSurface>> {
        self.join()
    }

    fn join(&mut self) -> Option<Box<dyn VideoSurface>> {
        let thread = self.thread.take()?;
        self.stop.store(true, Ordering::Release);
        match thread.join() {
            Ok(surface) => Some(surface),
            Err(_) => {
                error!("{} ❌ 渲染线程 panic", log_ctx());
                None
            }
        }
    }
}

impl Drop for RenderHandle {
    fn drop(&mut self) {
        let _ = self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PlayerConfig, StreamInfo, SubtitleEvent};
    use crate::player::testing::{picture, RecordingSurface};
    use crossbeam_channel::unbounded;

    fn video_shared(sync_master: SyncMaster) -> Arc<PlayerShared> {
        let (tx, _rx) = unbounded();
        let shared = Arc::new(PlayerShared::new(
            PlayerConfig {
                sync_master,
                ..PlayerConfig::default()
            },
            tx,
        ));
        shared.set_streams(vec![
            StreamInfo::new(0, MediaKind::Video),
            StreamInfo::new(1, MediaKind::Audio),
            StreamInfo::new(2, MediaKind::Subtitle),
        ]);
        shared.set_active_stream(MediaKind::Video, Some(0));
        shared.video_pq.start();
        shared
    }

    fn push_frame(shared: &PlayerShared, pts: f64) {
        let frame = Frame::new(picture(pts), pts, 0.04, -1, shared.video_pq.serial());
        shared.video_fq.peek_writable().unwrap().push(frame);
    }

    #[test]
    fn test_target_delay_video_master_unchanged() {
        assert_eq!(compute_target_delay(0.04, None, 3600.0), 0.04);
    }

    #[test]
    fn test_target_delay_video_behind_shortens() {
        // 视频落后主时钟 0.2 秒
        assert_eq!(compute_target_delay(0.04, Some(-0.2), 3600.0), 0.0);
        assert!((compute_target_delay(0.5, Some(-0.2), 3600.0) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_target_delay_video_ahead_lengthens() {
        // 短帧：重复显示（2 倍）
        assert!((compute_target_delay(0.04, Some(0.2), 3600.0) - 0.08).abs() < 1e-12);
        // 长帧：整段补上差值
        assert!((compute_target_delay(0.15, Some(0.2), 3600.0) - 0.35).abs() < 1e-12);
    }

    #[test]
    fn test_target_delay_ignores_nan_and_huge_diff() {
        assert_eq!(compute_target_delay(0.04, Some(f64::NAN), 3600.0), 0.04);
        assert_eq!(compute_target_delay(0.04, Some(20.0), 10.0), 0.04);
        assert_eq!(compute_target_delay(0.04, Some(0.01), 10.0), 0.04);
    }

    #[test]
    fn test_vp_duration_rules() {
        let a = Frame::new(0u8, 1.0, 0.04, -1, 1);
        let b = Frame::new(0u8, 1.05, 0.04, -1, 1);
        let c = Frame::new(0u8, 0.5, 0.04, -1, 1);
        let d = Frame::new(0u8, 1.1, 0.04, -1, 2);
        assert!((vp_duration(&a, &b, 3600.0) - 0.05).abs() < 1e-9);
        assert_eq!(vp_duration(&a, &c, 3600.0), 0.04);
        assert_eq!(vp_duration(&a, &d, 3600.0), 0.0);
    }

    #[test]
    fn test_steady_state_video_master_shows_every_frame() {
        let shared = video_shared(SyncMaster::Video);
        let surface = RecordingSurface::new();
        let presented = surface.presented();
        let mut render = RenderThread::new(Arc::clone(&shared), Box::new(surface));

        let mut next_pts = 0;
        let mut fill = |shared: &PlayerShared| {
            while shared.video_fq.size() < shared.video_fq.capacity() {
                push_frame(shared, next_pts as f64 * 0.04);
                next_pts += 1;
            }
        };

        fill(shared.as_ref());
        let mut remaining = REFRESH_RATE;
        render.tick(100.0, &mut remaining);
        for k in 1..10 {
            fill(shared.as_ref());
            let mut remaining = REFRESH_RATE;
            render.tick(100.0 + k as f64 * 0.04 + 0.01, &mut remaining);
        }

        let shown = presented.lock().clone();
        assert_eq!(shown.len(), 10);
        for (k, pts) in shown.iter().enumerate() {
            assert!((pts - k as f64 * 0.04).abs() < 1e-9, "frame {} at {}", k, pts);
        }
        assert_eq!(shared.stats().frame_drops_late, 0);
    }

    #[test]
    fn test_waits_until_frame_is_due() {
        let shared = video_shared(SyncMaster::Video);
        let surface = RecordingSurface::new();
        let presented = surface.presented();
        let mut render = RenderThread::new(Arc::clone(&shared), Box::new(surface));
        push_frame(&shared, 0.0);
        push_frame(&shared, 0.04);

        let mut remaining = REFRESH_RATE;
        render.tick(100.0, &mut remaining);
        let mut remaining = 1.0;
        render.tick(100.02, &mut remaining);
        assert_eq!(presented.lock().len(), 1);
        assert!((remaining - 0.02).abs() < 1e-6);
    }

    #[test]
    fn test_late_frame_dropped_when_audio_master() {
        let shared = video_shared(SyncMaster::Audio);
        shared.set_active_stream(MediaKind::Audio, Some(1));
        shared.audio_pq.start();
        let surface = RecordingSurface::new();
        let presented = surface.presented();
        let mut render = RenderThread::new(Arc::clone(&shared), Box::new(surface));
        for pts in [0.0, 0.04, 0.08] {
            push_frame(&shared, pts);
        }

        shared.aud_clk.set_at(0.0, shared.audio_pq.serial(), 100.0);
        let mut remaining = REFRESH_RATE;
        render.tick(100.0, &mut remaining);

        shared.aud_clk.set_at(0.09, shared.audio_pq.serial(), 100.09);
        let mut remaining = REFRESH_RATE;
        render.tick(100.09, &mut remaining);

        // 0.04 被丢弃，之后视频仍落后，0.08 立即显示
        assert_eq!(shared.stats().frame_drops_late, 1);
        assert_eq!(presented.lock().clone(), vec![0.0, 0.08]);
    }

    #[test]
    fn test_stale_serial_frames_are_skipped() {
        let shared = video_shared(SyncMaster::Video);
        let surface = RecordingSurface::new();
        let presented = surface.presented();
        let mut render = RenderThread::new(Arc::clone(&shared), Box::new(surface));
        push_frame(&shared, 5.0);
        shared.video_pq.put_flush();
        push_frame(&shared, 1.0);

        let mut remaining = REFRESH_RATE;
        render.tick(100.0, &mut remaining);
        assert_eq!(presented.lock().clone(), vec![1.0]);
    }

    #[test]
    fn test_step_shows_one_frame_then_pauses() {
        let shared = video_shared(SyncMaster::Video);
        let surface = RecordingSurface::new();
        let presented = surface.presented();
        let mut render = RenderThread::new(Arc::clone(&shared), Box::new(surface));
        for pts in [0.0, 0.04, 0.08] {
            push_frame(&shared, pts);
        }

        shared.pause_toggle();
        shared.step_frame();
        assert!(!shared.is_paused());

        let mut remaining = REFRESH_RATE;
        render.tick(100.0, &mut remaining);
        assert!(shared.is_paused());
        assert_eq!(presented.lock().len(), 1);

        // 暂停中不再前进
        let mut remaining = REFRESH_RATE;
        render.tick(101.0, &mut remaining);
        assert_eq!(presented.lock().len(), 1);
    }

    #[test]
    fn test_subtitle_shown_and_expired() {
        let shared = video_shared(SyncMaster::Video);
        shared.set_active_stream(MediaKind::Subtitle, Some(2));
        shared.subtitle_pq.start();
        let surface = RecordingSurface::new();
        let subtitles = surface.subtitles();
        let mut render = RenderThread::new(Arc::clone(&shared), Box::new(surface));

        let event = SubtitleEvent {
            text: "hello".into(),
            pts: Some(0.0),
            start_display: 0.0,
            end_display: 0.05,
        };
        let serial = shared.subtitle_pq.serial();
        shared
            .subtitle_fq
            .peek_writable()
            .unwrap()
            .push(Frame::new(event, 0.0, 0.05, -1, serial));

        for pts in [0.0, 0.04, 0.08] {
            push_frame(&shared, pts);
        }
        let mut remaining = REFRESH_RATE;
        render.tick(100.0, &mut remaining);
        for k in 1..3 {
            let mut remaining = REFRESH_RATE;
            render.tick(100.0 + k as f64 * 0.04 + 0.01, &mut remaining);
        }

        let seen = subtitles.lock().clone();
        assert_eq!(seen.first().cloned().flatten(), Some("hello".to_string()));
        assert_eq!(seen.last().cloned().flatten(), None);
        assert_eq!(shared.subtitle_fq.nb_remaining(), 0);
    }

    #[test]
    fn test_position_notified_when_changed() {
        let (tx, rx) = unbounded();
        let shared = Arc::new(PlayerShared::new(PlayerConfig::default(), tx));
        let mut render = RenderThread::new(Arc::clone(&shared), Box::new(RecordingSurface::new()));
        shared.request_seek(3.0);

        let mut remaining = REFRESH_RATE;
        render.tick(10.0, &mut remaining);
        render.tick(10.05, &mut remaining);
        render.tick(10.2, &mut remaining);

        let positions: Vec<f64> = rx
            .try_iter()
            .filter_map(|e| match e {
                PlayerEvent::PositionChanged(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(positions, vec![3.0]);
    }
}

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// 超过该差值（秒）不再尝试同步，视为时间戳错误
pub const AV_NOSYNC_THRESHOLD: f64 = 10.0;

/// 进程内单调时间（秒）
pub fn now_secs() -> f64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// 播放时钟 - 用于音视频同步
///
/// 音频、视频、外部时钟各一个。时钟绑定到某个包队列的序号，
/// 队列被冲刷（序号变化）后 `get()` 返回 NaN，直到用新序号重新设置。
/// 多个线程都会写时钟（音频解码、渲染、解复用 seek、调用方暂停），因此内部加锁。
#[derive(Clone)]
pub struct PlaybackClock {
    inner: Arc<Mutex<ClockInner>>,
    queue_serial: Option<Arc<AtomicI64>>,
}

struct ClockInner {
    pts: f64,            // 时钟基准（秒）
    pts_drift: f64,      // pts - 更新时刻
    last_updated: f64,   // 上次更新的墙上时间
    speed: f64,          // 播放速率（1.0 = 正常）
    serial: i64,         // 基于哪个序号的数据包
    paused: bool,
}

impl ClockInner {
    fn value_at(&self, time: f64) -> f64 {
        if self.paused {
            self.pts
        } else {
            self.pts_drift + time - (time - self.last_updated) * (1.0 - self.speed)
        }
    }

    fn set_at(&mut self, pts: f64, serial: i64, time: f64) {
        self.pts = pts;
        self.last_updated = time;
        self.pts_drift = pts - time;
        self.serial = serial;
    }
}

impl PlaybackClock {
    /// 绑定到队列序号；`None` 表示绑定自身序号（外部时钟）
    pub fn new(queue_serial: Option<Arc<AtomicI64>>) -> Self {
        let mut inner = ClockInner {
            pts: f64::NAN,
            pts_drift: f64::NAN,
            last_updated: 0.0,
            speed: 1.0,
            serial: -1,
            paused: false,
        };
        inner.set_at(f64::NAN, -1, now_secs());
        Self {
            inner: Arc::new(Mutex::new(inner)),
            queue_serial,
        }
    }

    fn stale(&self, inner: &ClockInner) -> bool {
        match &self.queue_serial {
            Some(serial) => serial.load(Ordering::Acquire) != inner.serial,
            None => false,
        }
    }

    /// 当前时钟值（秒）
    pub fn get(&self) -> f64 {
        self.get_at(now_secs())
    }

    /// 指定墙上时间的时钟值
    pub fn get_at(&self, time: f64) -> f64 {
        let inner = self.inner.lock();
        if self.stale(&inner) {
            return f64::NAN;
        }
        inner.value_at(time)
    }

    pub fn set_at(&self, pts: f64, serial: i64, time: f64) {
        self.inner.lock().set_at(pts, serial, time);
    }

    pub fn set(&self, pts: f64, serial: i64) {
        self.set_at(pts, serial, now_secs());
    }

    /// 改变速率前先用当前值重新锚定，避免跳变
    pub fn set_speed(&self, speed: f64) {
        self.set_speed_at(speed, now_secs());
    }

    pub fn set_speed_at(&self, speed: f64, time: f64) {
        let mut inner = self.inner.lock();
        let current = if self.stale(&inner) {
            f64::NAN
        } else {
            inner.value_at(time)
        };
        let serial = inner.serial;
        inner.set_at(current, serial, time);
        inner.speed = speed;
    }

    pub fn set_paused(&self, paused: bool) {
        self.inner.lock().paused = paused;
    }

    /// 本时钟为 NaN 或与 `other` 相差超过 `AV_NOSYNC_THRESHOLD` 时，采用 `other` 的值
    pub fn sync_to(&self, other: &PlaybackClock) {
        self.sync_to_at(other, now_secs());
    }

    pub fn sync_to_at(&self, other: &PlaybackClock, time: f64) {
        let clock = self.get_at(time);
        let slave = other.get_at(time);
        if !slave.is_nan() && (clock.is_nan() || (clock - slave).abs() > AV_NOSYNC_THRESHOLD) {
            self.set_at(slave, other.serial(), time);
        }
    }

    pub fn pts(&self) -> f64 {
        self.inner.lock().pts
    }

    pub fn serial(&self) -> i64 {
        self.inner.lock().serial
    }

    pub fn speed(&self) -> f64 {
        self.inner.lock().speed
    }

    pub fn last_updated(&self) -> f64 {
        self.inner.lock().last_updated
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_clock() -> (PlaybackClock, Arc<AtomicI64>) {
        let serial = Arc::new(AtomicI64::new(1));
        (PlaybackClock::new(Some(serial.clone())), serial)
    }

    #[test]
    fn test_clock_monotonic_at_normal_speed() {
        let (clock, _) = bound_clock();
        clock.set_at(5.0, 1, 100.0);
        let mut last = clock.get_at(100.0);
        for step in 1..50 {
            let value = clock.get_at(100.0 + step as f64 * 0.013);
            assert!(value >= last);
            last = value;
        }
        assert!((clock.get_at(101.0) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_clock_nan_after_queue_flush() {
        let (clock, serial) = bound_clock();
        clock.set_at(3.0, 1, 10.0);
        assert!(!clock.get_at(10.0).is_nan());
        serial.store(2, Ordering::Release);
        assert!(clock.get_at(10.0).is_nan());
        clock.set_at(0.5, 2, 11.0);
        assert!((clock.get_at(11.5) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_paused_clock_holds_pts() {
        let (clock, _) = bound_clock();
        clock.set_at(7.0, 1, 0.0);
        clock.set_paused(true);
        assert_eq!(clock.get_at(50.0), 7.0);
    }

    #[test]
    fn test_set_speed_does_not_jump() {
        let (clock, _) = bound_clock();
        clock.set_at(0.0, 1, 0.0);
        let before = clock.get_at(2.0);
        clock.set_speed_at(2.0, 2.0);
        assert!((clock.get_at(2.0) - before).abs() < 1e-9);
        // 之后按 2 倍速前进
        assert!((clock.get_at(3.0) - 4.0).abs() < 1e-9);
        assert_eq!(clock.speed(), 2.0);
    }

    #[test]
    fn test_sync_to_only_beyond_threshold() {
        let ext = PlaybackClock::new(None);
        let (vid, _) = bound_clock();
        vid.set_at(20.0, 1, 0.0);

        // 外部时钟为 NaN：直接采用
        ext.sync_to_at(&vid, 0.0);
        assert!((ext.get_at(0.0) - 20.0).abs() < 1e-9);

        // 差距小于阈值：保持不变
        ext.set_at(25.0, 1, 0.0);
        ext.sync_to_at(&vid, 0.0);
        assert!((ext.get_at(0.0) - 25.0).abs() < 1e-9);

        // 差距大于阈值：跟随
        ext.set_at(45.0, 1, 0.0);
        ext.sync_to_at(&vid, 0.0);
        assert!((ext.get_at(0.0) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_external_clock_never_stale() {
        let ext = PlaybackClock::new(None);
        ext.set_at(1.0, 0, 0.0);
        assert!((ext.get_at(1.0) - 2.0).abs() < 1e-9);
    }
}

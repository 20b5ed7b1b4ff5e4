use crate::core::{Packet, PacketKind};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 每个数据包在队列中的固定开销（计入字节数）
const PACKET_OVERHEAD: usize = 64;

/// `PacketQueue::get` 的结果
#[derive(Debug)]
pub enum PacketGet {
    /// 取到数据包及其入队时的序号
    Packet(Packet, i64),
    /// 非阻塞模式下队列为空
    Empty,
    /// 队列已中止
    Aborted,
}

struct QueueState {
    packets: VecDeque<(Packet, i64)>,
    size: usize,
    duration: i64,
    serial: i64,
    abort: bool,
}

/// 线程安全的数据包 FIFO
///
/// 冲刷哨兵入队时序号 +1，之后入队的包都带着新序号；
/// 序号同时镜像到原子变量，时钟和帧队列可以无锁读取。
/// 新建的队列处于中止状态，`start()` 之后才接受数据。
pub struct PacketQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    serial: Arc<AtomicI64>,
    aborted: AtomicBool,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                packets: VecDeque::new(),
                size: 0,
                duration: 0,
                serial: 0,
                abort: true,
            }),
            cond: Condvar::new(),
            serial: Arc::new(AtomicI64::new(0)),
            aborted: AtomicBool::new(true),
        }
    }

    /// 入队并唤醒一个等待者；队列已中止时丢弃并返回 false
    pub fn put(&self, packet: Packet) -> bool {
        let mut state = self.state.lock();
        if state.abort {
            return false;
        }
        if packet.kind == PacketKind::Flush {
            state.serial += 1;
            self.serial.store(state.serial, Ordering::Release);
        }
        state.size += packet.size() + PACKET_OVERHEAD;
        state.duration += packet.duration;
        let serial = state.serial;
        state.packets.push_back((packet, serial));
        self.cond.notify_one();
        true
    }

    pub fn put_flush(&self) -> bool {
        self.put(Packet::flush())
    }

    pub fn put_null(&self, stream_index: usize) -> bool {
        self.put(Packet::null(stream_index))
    }

    /// 出队；`block` 为 true 时一直等到有数据或被中止
    pub fn get(&self, block: bool) -> PacketGet {
        let mut state = self.state.lock();
        loop {
            if state.abort {
                return PacketGet::Aborted;
            }
            if let Some((packet, serial)) = state.packets.pop_front() {
                state.size = state.size.saturating_sub(packet.size() + PACKET_OVERHEAD);
                state.duration -= packet.duration;
                return PacketGet::Packet(packet, serial);
            }
            if !block {
                return PacketGet::Empty;
            }
            self.cond.wait(&mut state);
        }
    }

    /// 带超时的阻塞出队，超时返回 `Empty`
    pub fn get_timeout(&self, timeout: Duration) -> PacketGet {
        let mut state = self.state.lock();
        loop {
            if state.abort {
                return PacketGet::Aborted;
            }
            if let Some((packet, serial)) = state.packets.pop_front() {
                state.size = state.size.saturating_sub(packet.size() + PACKET_OVERHEAD);
                state.duration -= packet.duration;
                return PacketGet::Packet(packet, serial);
            }
            if self.cond.wait_for(&mut state, timeout).timed_out() {
                return PacketGet::Empty;
            }
        }
    }

    /// 丢弃全部数据包，计数清零，序号不变
    pub fn flush(&self) {
        let mut state = self.state.lock();
        state.packets.clear();
        state.size = 0;
        state.duration = 0;
    }

    /// 中止：唤醒所有等待者，可重复调用
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.abort = true;
        self.aborted.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// 解除中止并放入一个冲刷哨兵
    pub fn start(&self) {
        let mut state = self.state.lock();
        state.abort = false;
        self.aborted.store(false, Ordering::Release);
        state.serial += 1;
        self.serial.store(state.serial, Ordering::Release);
        let serial = state.serial;
        state.size += PACKET_OVERHEAD;
        state.packets.push_back((Packet::flush(), serial));
        self.cond.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn nb_packets(&self) -> usize {
        self.state.lock().packets.len()
    }

    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    /// 以流时间基计的累计时长
    pub fn duration(&self) -> i64 {
        self.state.lock().duration
    }

    pub fn serial(&self) -> i64 {
        self.serial.load(Ordering::Acquire)
    }

    /// 序号的共享句柄，用于绑定时钟
    pub fn serial_handle(&self) -> Arc<AtomicI64> {
        Arc::clone(&self.serial)
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn data(stream: usize, pts: i64) -> Packet {
        Packet::data(stream, vec![0u8; 100]).with_pts(pts).with_duration(10)
    }

    fn expect_packet(queue: &PacketQueue) -> (Packet, i64) {
        match queue.get(false) {
            PacketGet::Packet(packet, serial) => (packet, serial),
            other => panic!("expected packet, got {:?}", other),
        }
    }

    #[test]
    fn test_new_queue_is_aborted_until_started() {
        let queue = PacketQueue::new();
        assert!(queue.is_aborted());
        assert!(!queue.put(data(0, 0)));
        assert!(matches!(queue.get(false), PacketGet::Aborted));

        queue.start();
        assert!(!queue.is_aborted());
        assert_eq!(queue.serial(), 1);
        let (sentinel, serial) = expect_packet(&queue);
        assert!(sentinel.is_flush());
        assert_eq!(serial, 1);
    }

    #[test]
    fn test_fifo_order() {
        let queue = PacketQueue::new();
        queue.start();
        let _ = queue.get(false);
        for pts in 0..20 {
            assert!(queue.put(data(0, pts)));
        }
        for pts in 0..20 {
            let (packet, _) = expect_packet(&queue);
            assert_eq!(packet.pts, Some(pts));
        }
        assert!(matches!(queue.get(false), PacketGet::Empty));
    }

    #[test]
    fn test_flush_sentinel_bumps_serial() {
        let queue = PacketQueue::new();
        queue.start();
        let _ = queue.get(false);
        queue.put(data(0, 0));
        queue.put(data(0, 1));
        queue.put_flush();
        queue.put(data(0, 2));

        let serials: Vec<i64> = (0..4).map(|_| expect_packet(&queue).1).collect();
        assert_eq!(serials, vec![1, 1, 2, 2]);
        assert_eq!(queue.serial(), 2);
    }

    #[test]
    fn test_counters_and_flush() {
        let queue = PacketQueue::new();
        queue.start();
        let _ = queue.get(false);
        queue.put(data(0, 0));
        queue.put(data(0, 1));
        assert_eq!(queue.nb_packets(), 2);
        assert_eq!(queue.size(), 2 * (100 + PACKET_OVERHEAD));
        assert_eq!(queue.duration(), 20);

        let serial = queue.serial();
        queue.flush();
        assert_eq!(queue.nb_packets(), 0);
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.duration(), 0);
        assert_eq!(queue.serial(), serial);
    }

    #[test]
    fn test_abort_wakes_blocked_reader() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        let _ = queue.get(false);

        let reader = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || matches!(queue.get(true), PacketGet::Aborted))
        };
        thread::sleep(Duration::from_millis(30));
        queue.abort();
        queue.abort();
        assert!(reader.join().unwrap());
    }

    #[test]
    fn test_blocked_reader_receives_packet() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        let _ = queue.get(false);

        let reader = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || match queue.get(true) {
                PacketGet::Packet(packet, _) => packet.pts,
                _ => None,
            })
        };
        thread::sleep(Duration::from_millis(20));
        queue.put(data(3, 42));
        assert_eq!(reader.join().unwrap(), Some(42));
    }

    #[test]
    fn test_get_timeout_returns_empty() {
        let queue = PacketQueue::new();
        queue.start();
        let _ = queue.get(false);
        assert!(matches!(queue.get_timeout(Duration::from_millis(5)), PacketGet::Empty));
    }
}

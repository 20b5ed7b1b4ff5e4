use crate::core::Frame;
use crate::player::packet_queue::PacketQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

pub const VIDEO_PICTURE_QUEUE_SIZE: usize = 3;
pub const SUBPICTURE_QUEUE_SIZE: usize = 16;
/// 任意帧队列容量上限
pub const FRAME_QUEUE_SIZE: usize = 16;

struct Ring<T> {
    slots: Vec<Option<Frame<T>>>,
    rindex: usize,
    windex: usize,
    size: usize,
    rindex_shown: usize,
}

/// 固定容量的解码帧环形队列
///
/// 写端（解码线程）满时阻塞，读端（渲染线程）只做非阻塞的 peek/next；
/// 两端都观察绑定包队列的中止标志。`keep_last` 打开时，最新显示的一帧
/// 留在队列里，便于暂停/排空时重复绘制。
pub struct FrameQueue<T> {
    ring: Mutex<Ring<T>>,
    cond: Condvar,
    pktq: Arc<PacketQueue>,
    max_size: usize,
    keep_last: bool,
}

/// `peek_writable` 返回的写入位置，`push` 提交
pub struct WritableSlot<'a, T> {
    queue: &'a FrameQueue<T>,
}

impl<'a, T> WritableSlot<'a, T> {
    pub fn push(self, frame: Frame<T>) {
        self.queue.push(frame);
    }
}

impl<T> FrameQueue<T> {
    pub fn new(pktq: Arc<PacketQueue>, max_size: usize, keep_last: bool) -> Self {
        let max_size = max_size.clamp(1, FRAME_QUEUE_SIZE);
        Self {
            ring: Mutex::new(Ring {
                slots: (0..max_size).map(|_| None).collect(),
                rindex: 0,
                windex: 0,
                size: 0,
                rindex_shown: 0,
            }),
            cond: Condvar::new(),
            pktq,
            max_size,
            keep_last,
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// 唤醒所有等待者（中止时使用）
    pub fn signal(&self) {
        let _ring = self.ring.lock();
        self.cond.notify_all();
    }

    /// 等待空位；包队列中止时返回 None
    pub fn peek_writable(&self) -> Option<WritableSlot<'_, T>> {
        let mut ring = self.ring.lock();
        while ring.size >= self.max_size && !self.pktq.is_aborted() {
            self.cond.wait(&mut ring);
        }
        if self.pktq.is_aborted() {
            return None;
        }
        Some(WritableSlot { queue: self })
    }

    fn push(&self, frame: Frame<T>) {
        let mut ring = self.ring.lock();
        let windex = ring.windex;
        ring.slots[windex] = Some(frame);
        ring.windex = (windex + 1) % self.max_size;
        ring.size += 1;
        self.cond.notify_one();
    }

    /// 等待一帧可读；包队列中止时返回 None
    pub fn peek_readable(&self) -> Option<Frame<T>> {
        let mut ring = self.ring.lock();
        while ring.size <= ring.rindex_shown && !self.pktq.is_aborted() {
            self.cond.wait(&mut ring);
        }
        if self.pktq.is_aborted() {
            return None;
        }
        let index = (ring.rindex + ring.rindex_shown) % self.max_size;
        ring.slots[index].clone()
    }

    /// 最早的未显示帧
    pub fn peek(&self) -> Option<Frame<T>> {
        let ring = self.ring.lock();
        let index = (ring.rindex + ring.rindex_shown) % self.max_size;
        ring.slots[index].clone()
    }

    /// `peek()` 之后的一帧
    pub fn peek_next(&self) -> Option<Frame<T>> {
        let ring = self.ring.lock();
        let index = (ring.rindex + ring.rindex_shown + 1) % self.max_size;
        ring.slots[index].clone()
    }

    /// 当前显示的帧（keep_last 保留的那一帧）
    pub fn peek_last(&self) -> Option<Frame<T>> {
        let ring = self.ring.lock();
        ring.slots[ring.rindex].clone()
    }

    /// 释放最早的一帧
    pub fn next(&self) {
        let mut ring = self.ring.lock();
        if self.keep_last && ring.rindex_shown == 0 {
            ring.rindex_shown = 1;
            return;
        }
        if ring.size == 0 {
            return;
        }
        let rindex = ring.rindex;
        ring.slots[rindex] = None;
        ring.rindex = (rindex + 1) % self.max_size;
        ring.size -= 1;
        self.cond.notify_one();
    }

    /// 未显示的帧数
    pub fn nb_remaining(&self) -> usize {
        let ring = self.ring.lock();
        ring.size.saturating_sub(ring.rindex_shown)
    }

    pub fn size(&self) -> usize {
        self.ring.lock().size
    }

    /// 是否已有帧被标记为显示
    pub fn has_shown(&self) -> bool {
        self.ring.lock().rindex_shown != 0
    }

    /// 已显示帧的字节位置，序号过期或未显示时为 -1
    pub fn last_pos(&self) -> i64 {
        let ring = self.ring.lock();
        match &ring.slots[ring.rindex] {
            Some(frame) if ring.rindex_shown != 0 && frame.serial == self.pktq.serial() => frame.pos,
            _ => -1,
        }
    }
}

use crate::core::{Frame, SubtitleEvent, VideoPicture};
use log::{debug, trace};

/// 呈现端：调度器只决定何时显示，像素如何转换和绘制由实现负责
pub trait VideoSurface: Send {
    fn present(&mut self, frame: &Frame<VideoPicture>);

    /// 当前应显示的字幕，None 表示清除
    fn set_subtitle(&mut self, event: Option<&SubtitleEvent>);
}

/// 无界面呈现端：只记录日志（命令行模式使用）
#[derive(Debug, Default)]
pub struct LogSurface {
    presented: u64,
    subtitle: Option<String>,
}

impl LogSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }
}

impl VideoSurface for LogSurface {
    fn present(&mut self, frame: &Frame<VideoPicture>) {
        self.presented += 1;
        let picture = &frame.payload;
        if self.presented == 1 {
            debug!(
                "🖼 首帧: {}x{} {:?} {:?}",
                picture.width, picture.height, picture.format, picture.color
            );
        }
        trace!("🖼 显示帧 #{} pts={:.3}", self.presented, frame.pts);
    }

    fn set_subtitle(&mut self, event: Option<&SubtitleEvent>) {
        let text = event.map(|e| e.text.clone());
        if text != self.subtitle {
            match &text {
                Some(t) => debug!("💬 字幕: {}", t.replace('\n', " / ")),
                None => trace!("💬 字幕清除"),
            }
            self.subtitle = text;
        }
    }
}

//! 音视频同步播放引擎
//!
//! 解复用线程把数据包分发到各自的包队列，每条活动流一个解码线程，
//! 渲染线程按主时钟（音频、视频或外部时钟）决定每一帧的显示时机。
//! 调用方通过 [`player::Player`] 控制播放，通过事件通道接收通知。

pub mod core;
pub mod player;

pub use crate::core::{PlayerConfig, PlayerError, PlayerEvent, Result};
pub use crate::player::Player;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("FFmpeg 错误: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("配置解析错误: {0}")]
    JsonError(#[from] serde_json::Error),

    /// 探测/打开容器失败，只上报一次，不重试
    #[error("无法打开媒体: {0}")]
    OpenFailure(String),

    /// 打开超过看门狗时限，按打开失败处理
    #[error("打开媒体超时（{0} ms）")]
    Timeout(u64),

    /// 单个数据包解码失败，在解码线程内部吸收
    #[error("解码错误: {0}")]
    DecodeFailure(String),

    /// 音频设备拒绝数据或无法打开，触发停止
    #[error("音频设备错误: {0}")]
    DeviceFailure(String),

    /// 主动协作式关闭，不作为错误上报
    #[error("操作已中止")]
    Abort,

    #[error("尚未打开媒体")]
    NotOpened,

    #[error("无效的流: {0}")]
    InvalidStream(String),

    #[error("配置错误: {0}")]
    Config(String),
}

impl PlayerError {
    /// 错误事件中使用的稳定错误码
    pub fn code(&self) -> i32 {
        match self {
            PlayerError::OpenFailure(_) | PlayerError::Timeout(_) => 1,
            PlayerError::DecodeFailure(_) => 2,
            PlayerError::DeviceFailure(_) => 3,
            PlayerError::Abort => 4,
            PlayerError::NotOpened => 5,
            PlayerError::InvalidStream(_) => 6,
            PlayerError::Config(_) | PlayerError::JsonError(_) => 7,
            PlayerError::FFmpegError(_) => 8,
            PlayerError::IoError(_) => 9,
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, PlayerError::Abort)
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;

use std::path::PathBuf;

/// 库内统一使用的结果类型
pub type ForgeResult<T> = Result<T, ForgeError>;

/// 错误分类
///
/// - 输入错误在任何 I/O 之前立即返回
/// - 连接错误与超时错误分开，调用方可以区分"服务挂了"和"服务太慢"
/// - 拼接精灵图时的坏帧必须报错，不允许静默生成残缺的图
#[derive(thiserror::Error, Debug)]
pub enum ForgeError {
    /// 非法输入（空序列、帧数 <= 0、空帧列表等）
    #[error("输入无效: {0}")]
    InvalidInput(String),

    /// 找不到姿态序列
    #[error("未找到姿态序列: {0}")]
    PoseNotFound(String),

    /// 精灵图拼接失败，指明是哪一帧
    #[error("拼接精灵图失败: 第 {index} 帧 ({path}): {reason}")]
    Assembly {
        index: usize,
        path: PathBuf,
        reason: String,
    },

    /// 网络或连接失败
    #[error("连接失败: {0}")]
    Connectivity(String),

    /// 生成任务在限定时间内没有完成
    #[error("生成超时: 任务 {job} 等待超过 {seconds} 秒")]
    Timeout { job: String, seconds: u64 },

    /// 未调用 connect() 就使用后端
    #[error("{0} 后端未连接，请先调用 connect()")]
    NotConnected(&'static str),

    /// 后端返回了预期之外的状态或数据
    #[error("后端错误: {0}")]
    Backend(String),

    /// 光栅化失败
    #[error("渲染失败: {0}")]
    Render(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ForgeError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }

    /// 是否属于"这一帧失败"可以跳过的错误
    pub fn is_recoverable_frame_error(&self) -> bool {
        matches!(
            self,
            Self::Connectivity(_) | Self::Timeout { .. } | Self::Backend(_)
        )
    }
}

impl From<reqwest::Error> for ForgeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            // 单次 HTTP 请求超时属于连接问题，不等同于生成任务超时
            Self::Connectivity(format!("请求超时: {}", e))
        } else if e.is_status() {
            Self::Backend(e.to_string())
        } else if e.is_decode() {
            Self::Backend(format!("响应解析失败: {}", e))
        } else {
            Self::Connectivity(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembly_error_names_frame_index_and_path() {
        let err = ForgeError::Assembly {
            index: 3,
            path: PathBuf::from("/tmp/frame_003.png"),
            reason: "文件为空".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains('3'));
        assert!(msg.contains("frame_003.png"));
    }

    #[test]
    fn timeout_is_distinct_from_connectivity() {
        let timeout = ForgeError::Timeout {
            job: "abc".to_string(),
            seconds: 600,
        };
        assert!(matches!(timeout, ForgeError::Timeout { .. }));
        assert!(timeout.is_recoverable_frame_error());
        assert!(!ForgeError::invalid_input("x").is_recoverable_frame_error());
    }
}

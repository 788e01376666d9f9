use serde::{Deserialize, Serialize};

/// 低于该置信度的关键点视为不可见
pub const VISIBILITY_THRESHOLD: f32 = 0.1;

/// 默认每帧时长（约 12 fps）
pub const DEFAULT_FRAME_DURATION_MS: u32 = 83;

/// 单个关键点：归一化坐标 + 置信度
///
/// JSON 中写作 `[x, y, confidence]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 3]", into = "[f32; 3]")]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    pub const fn new(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }

    pub fn is_visible(&self) -> bool {
        self.confidence > VISIBILITY_THRESHOLD
    }

    /// 分量线性插值
    pub fn lerp(self, other: Keypoint, t: f32) -> Keypoint {
        Keypoint {
            x: self.x + (other.x - self.x) * t,
            y: self.y + (other.y - self.y) * t,
            confidence: self.confidence + (other.confidence - self.confidence) * t,
        }
    }

    fn components(&self) -> [f32; 3] {
        [self.x, self.y, self.confidence]
    }
}

impl From<[f32; 3]> for Keypoint {
    fn from(v: [f32; 3]) -> Self {
        Self::new(v[0], v[1], v[2])
    }
}

impl From<Keypoint> for [f32; 3] {
    fn from(k: Keypoint) -> Self {
        k.components()
    }
}

/// 骨骼关节（OpenPose 风格的 14 个点）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Joint {
    Nose,
    Neck,
    RightShoulder,
    LeftShoulder,
    RightElbow,
    LeftElbow,
    RightWrist,
    LeftWrist,
    RightHip,
    LeftHip,
    RightKnee,
    LeftKnee,
    RightAnkle,
    LeftAnkle,
}

impl Joint {
    /// 全部关节，顺序固定
    pub const ALL: [Joint; 14] = [
        Joint::Nose,
        Joint::Neck,
        Joint::RightShoulder,
        Joint::LeftShoulder,
        Joint::RightElbow,
        Joint::LeftElbow,
        Joint::RightWrist,
        Joint::LeftWrist,
        Joint::RightHip,
        Joint::LeftHip,
        Joint::RightKnee,
        Joint::LeftKnee,
        Joint::RightAnkle,
        Joint::LeftAnkle,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Joint::Nose => "nose",
            Joint::Neck => "neck",
            Joint::RightShoulder => "right_shoulder",
            Joint::LeftShoulder => "left_shoulder",
            Joint::RightElbow => "right_elbow",
            Joint::LeftElbow => "left_elbow",
            Joint::RightWrist => "right_wrist",
            Joint::LeftWrist => "left_wrist",
            Joint::RightHip => "right_hip",
            Joint::LeftHip => "left_hip",
            Joint::RightKnee => "right_knee",
            Joint::LeftKnee => "left_knee",
            Joint::RightAnkle => "right_ankle",
            Joint::LeftAnkle => "left_ankle",
        }
    }
}

/// 一组完整的关键点
///
/// JSON 中缺省的关节取站立姿态的默认值，所以每个关节始终存在
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseKeypoints {
    pub nose: Keypoint,
    pub neck: Keypoint,
    pub right_shoulder: Keypoint,
    pub left_shoulder: Keypoint,
    pub right_elbow: Keypoint,
    pub left_elbow: Keypoint,
    pub right_wrist: Keypoint,
    pub left_wrist: Keypoint,
    pub right_hip: Keypoint,
    pub left_hip: Keypoint,
    pub right_knee: Keypoint,
    pub left_knee: Keypoint,
    pub right_ankle: Keypoint,
    pub left_ankle: Keypoint,
}

impl Default for PoseKeypoints {
    /// 基本站姿
    fn default() -> Self {
        Self {
            nose: Keypoint::new(0.5, 0.15, 1.0),
            neck: Keypoint::new(0.5, 0.25, 1.0),
            right_shoulder: Keypoint::new(0.35, 0.25, 1.0),
            left_shoulder: Keypoint::new(0.65, 0.25, 1.0),
            right_elbow: Keypoint::new(0.25, 0.4, 1.0),
            left_elbow: Keypoint::new(0.75, 0.4, 1.0),
            right_wrist: Keypoint::new(0.2, 0.55, 1.0),
            left_wrist: Keypoint::new(0.8, 0.55, 1.0),
            right_hip: Keypoint::new(0.4, 0.55, 1.0),
            left_hip: Keypoint::new(0.6, 0.55, 1.0),
            right_knee: Keypoint::new(0.4, 0.75, 1.0),
            left_knee: Keypoint::new(0.6, 0.75, 1.0),
            right_ankle: Keypoint::new(0.4, 0.95, 1.0),
            left_ankle: Keypoint::new(0.6, 0.95, 1.0),
        }
    }
}

impl PoseKeypoints {
    pub fn get(&self, joint: Joint) -> Keypoint {
        match joint {
            Joint::Nose => self.nose,
            Joint::Neck => self.neck,
            Joint::RightShoulder => self.right_shoulder,
            Joint::LeftShoulder => self.left_shoulder,
            Joint::RightElbow => self.right_elbow,
            Joint::LeftElbow => self.left_elbow,
            Joint::RightWrist => self.right_wrist,
            Joint::LeftWrist => self.left_wrist,
            Joint::RightHip => self.right_hip,
            Joint::LeftHip => self.left_hip,
            Joint::RightKnee => self.right_knee,
            Joint::LeftKnee => self.left_knee,
            Joint::RightAnkle => self.right_ankle,
            Joint::LeftAnkle => self.left_ankle,
        }
    }

    pub fn set(&mut self, joint: Joint, point: Keypoint) {
        let slot = match joint {
            Joint::Nose => &mut self.nose,
            Joint::Neck => &mut self.neck,
            Joint::RightShoulder => &mut self.right_shoulder,
            Joint::LeftShoulder => &mut self.left_shoulder,
            Joint::RightElbow => &mut self.right_elbow,
            Joint::LeftElbow => &mut self.left_elbow,
            Joint::RightWrist => &mut self.right_wrist,
            Joint::LeftWrist => &mut self.left_wrist,
            Joint::RightHip => &mut self.right_hip,
            Joint::LeftHip => &mut self.left_hip,
            Joint::RightKnee => &mut self.right_knee,
            Joint::LeftKnee => &mut self.left_knee,
            Joint::RightAnkle => &mut self.right_ankle,
            Joint::LeftAnkle => &mut self.left_ankle,
        };
        *slot = point;
    }

    /// 逐关节插值
    pub fn lerp(&self, other: &PoseKeypoints, t: f32) -> PoseKeypoints {
        let mut out = *self;
        for joint in Joint::ALL {
            out.set(joint, self.get(joint).lerp(other.get(joint), t));
        }
        out
    }

    /// 检查所有分量都在 [0, 1] 之内，返回第一个越界的关节
    pub fn first_out_of_range(&self) -> Option<Joint> {
        Joint::ALL.into_iter().find(|&joint| {
            self.get(joint)
                .components()
                .iter()
                .any(|v| !v.is_finite() || !(0.0..=1.0).contains(v))
        })
    }
}

/// 姿态动画中的一帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseFrame {
    pub keypoints: PoseKeypoints,
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u32,
}

fn default_duration_ms() -> u32 {
    DEFAULT_FRAME_DURATION_MS
}

impl PoseFrame {
    pub fn new(keypoints: PoseKeypoints) -> Self {
        Self {
            keypoints,
            duration_ms: DEFAULT_FRAME_DURATION_MS,
        }
    }
}

/// 一段姿态关键帧序列
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseSequence {
    pub name: String,
    pub frames: Vec<PoseFrame>,
    #[serde(rename = "loop", default = "default_loop")]
    pub looping: bool,
}

fn default_loop() -> bool {
    true
}

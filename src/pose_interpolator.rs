use crate::error::{ForgeError, ForgeResult};
use crate::pose::{PoseKeypoints, PoseSequence};

/// 将姿态序列线性重采样为恰好 `target_frames` 帧
///
/// 首尾帧与源序列的首尾帧完全一致。帧数相同时原样返回，
/// 只有一帧时每个输出帧都是它的拷贝。
pub fn interpolate_poses(
    sequence: &PoseSequence,
    target_frames: usize,
) -> ForgeResult<Vec<PoseKeypoints>> {
    let src = &sequence.frames;
    let n_src = src.len();

    if n_src == 0 {
        return Err(ForgeError::invalid_input(format!(
            "姿态序列 '{}' 没有任何帧",
            sequence.name
        )));
    }
    if target_frames == 0 {
        return Err(ForgeError::invalid_input("目标帧数必须为正数"));
    }

    if n_src == target_frames {
        return Ok(src.iter().map(|f| f.keypoints).collect());
    }

    let out_span = (target_frames.max(2) - 1) as f64;
    let src_span = (n_src.max(2) - 1) as f64;

    let frames = (0..target_frames)
        .map(|i| {
            // 输出帧下标映射到源序列上的连续位置
            let t = i as f64 / out_span * src_span;
            let lo = (t.floor() as usize).min(n_src - 1);
            let hi = (lo + 1).min(n_src - 1);
            let alpha = (t - lo as f64) as f32;
            src[lo].keypoints.lerp(&src[hi].keypoints, alpha)
        })
        .collect();

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::{Joint, Keypoint, PoseFrame};

    fn sequence(frames: Vec<PoseKeypoints>) -> PoseSequence {
        PoseSequence {
            name: "test".to_string(),
            frames: frames.into_iter().map(PoseFrame::new).collect(),
            looping: true,
        }
    }

    fn with_nose(y: f32) -> PoseKeypoints {
        let mut kp = PoseKeypoints::default();
        kp.nose = Keypoint::new(0.5, y, 1.0);
        kp
    }

    fn approx_eq(a: &PoseKeypoints, b: &PoseKeypoints) -> bool {
        Joint::ALL.iter().all(|&j| {
            let (p, q) = (a.get(j), b.get(j));
            (p.x - q.x).abs() < 1e-6
                && (p.y - q.y).abs() < 1e-6
                && (p.confidence - q.confidence).abs() < 1e-6
        })
    }

    #[test]
    fn midpoint_of_two_frames() {
        let seq = sequence(vec![with_nose(0.1), with_nose(0.3)]);
        let out = interpolate_poses(&seq, 3).unwrap();
        assert_eq!(out.len(), 3);
        assert!((out[1].nose.x - 0.5).abs() < 1e-6);
        assert!((out[1].nose.y - 0.2).abs() < 1e-6);
        assert!((out[1].nose.confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn equal_count_is_identity() {
        let frames = vec![with_nose(0.1), with_nose(0.2), with_nose(0.4)];
        let seq = sequence(frames.clone());
        assert_eq!(interpolate_poses(&seq, 3).unwrap(), frames);
    }

    #[test]
    fn single_frame_is_repeated() {
        let seq = sequence(vec![with_nose(0.25)]);
        for target in 1..=7 {
            let out = interpolate_poses(&seq, target).unwrap();
            assert_eq!(out.len(), target);
            assert!(out.iter().all(|kp| *kp == with_nose(0.25)));
        }
    }

    #[test]
    fn always_returns_requested_count_with_exact_endpoints() {
        let frames = vec![with_nose(0.1), with_nose(0.6), with_nose(0.2), with_nose(0.9)];
        let seq = sequence(frames.clone());
        for target in 1..=20 {
            let out = interpolate_poses(&seq, target).unwrap();
            assert_eq!(out.len(), target);
            assert!(approx_eq(&out[0], &frames[0]));
            if target >= 2 {
                assert!(approx_eq(&out[target - 1], &frames[3]), "target={}", target);
            }
        }
    }

    #[test]
    fn downsampling_keeps_endpoints() {
        let frames: Vec<_> = (0..9).map(|i| with_nose(i as f32 / 10.0)).collect();
        let seq = sequence(frames.clone());
        let out = interpolate_poses(&seq, 3).unwrap();
        assert!(approx_eq(&out[0], &frames[0]));
        assert!(approx_eq(&out[1], &frames[4]));
        assert!(approx_eq(&out[2], &frames[8]));
    }

    #[test]
    fn zero_target_is_invalid() {
        let seq = sequence(vec![with_nose(0.1)]);
        let err = interpolate_poses(&seq, 0).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidInput(_)));
    }

    #[test]
    fn empty_sequence_is_invalid() {
        let seq = sequence(vec![]);
        let err = interpolate_poses(&seq, 4).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidInput(_)));
    }
}

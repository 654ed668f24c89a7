//! Estimator interfaces
//!
//! The sensor and camera classifiers are black boxes to the core. They are
//! consumed through these traits; closures with the matching signature
//! implement them directly.

use crate::types::{EstimateOutcome, SensorReading};
use chrono::{DateTime, Utc};

/// Pressure-array classifier. Cheap; treated as a pure function of the reading.
pub trait SensorEstimator {
    fn estimate(&self, reading: &SensorReading, now: DateTime<Utc>) -> EstimateOutcome;
}

/// Camera-pose classifier. Expensive and only invoked when the mode policy asks.
///
/// Timeouts are enforced by the caller, which reports them as
/// [`EstimateOutcome::TimedOut`].
pub trait CameraEstimator {
    /// Whatever the capture layer hands over (decoded image, keypoints, ...)
    type Frame;

    fn estimate(&self, frame: &Self::Frame, now: DateTime<Utc>) -> EstimateOutcome;
}

impl<F> SensorEstimator for F
where
    F: Fn(&SensorReading, DateTime<Utc>) -> EstimateOutcome,
{
    fn estimate(&self, reading: &SensorReading, now: DateTime<Utc>) -> EstimateOutcome {
        self(reading, now)
    }
}

/// Adapts a closure into a [`CameraEstimator`] over frames of type `T`
pub struct CameraFn<T, F> {
    f: F,
    _frame: std::marker::PhantomData<fn(&T)>,
}

impl<T, F> CameraFn<T, F>
where
    F: Fn(&T, DateTime<Utc>) -> EstimateOutcome,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _frame: std::marker::PhantomData,
        }
    }
}

impl<T, F> CameraEstimator for CameraFn<T, F>
where
    F: Fn(&T, DateTime<Utc>) -> EstimateOutcome,
{
    type Frame = T;

    fn estimate(&self, frame: &T, now: DateTime<Utc>) -> EstimateOutcome {
        (self.f)(frame, now)
    }
}

/// Camera estimator for deployments without a camera: always unavailable
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCamera;

impl CameraEstimator for NoCamera {
    type Frame = ();

    fn estimate(&self, _frame: &(), _now: DateTime<Utc>) -> EstimateOutcome {
        EstimateOutcome::Unavailable
    }
}

impl<T: CameraEstimator + ?Sized> CameraEstimator for std::sync::Arc<T> {
    type Frame = T::Frame;

    fn estimate(&self, frame: &Self::Frame, now: DateTime<Utc>) -> EstimateOutcome {
        (**self).estimate(frame, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Estimate, PostureLabel};
    use chrono::TimeZone;

    #[test]
    fn test_closure_sensor_estimator() {
        let sensor = |reading: &SensorReading, now: DateTime<Utc>| {
            let label = if reading.channels[0] > 500.0 {
                PostureLabel::LeaningForward
            } else {
                PostureLabel::CorrectPosture
            };
            EstimateOutcome::Ready(Estimate::sensor(label, 0.9, now).unwrap())
        };

        let now = Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
        let reading = SensorReading::new([800.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
        let outcome = sensor.estimate(&reading, now);

        assert_eq!(outcome.estimate().unwrap().label, PostureLabel::LeaningForward);
    }

    #[test]
    fn test_camera_fn_and_no_camera() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
        let camera = CameraFn::new(|frame: &Vec<u8>, now: DateTime<Utc>| {
            if frame.is_empty() {
                EstimateOutcome::Unavailable
            } else {
                EstimateOutcome::Ready(Estimate::camera(PostureLabel::LeaningLeft, 0.7, now).unwrap())
            }
        });

        assert_eq!(camera.estimate(&Vec::new(), now), EstimateOutcome::Unavailable);
        assert!(camera.estimate(&vec![1, 2, 3], now).estimate().is_some());
        assert_eq!(NoCamera.estimate(&(), now), EstimateOutcome::Unavailable);
    }
}

use std::time::Duration;

/// Failures the driver's callers need to tell apart.
///
/// Everything else travels as a plain `anyhow::Error`; these are wrapped into
/// one as well and can be recovered with `err.downcast_ref::<DriverError>()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverError {
    /// The device exposes no sensor that reports a depth scale.
    NoDepthSensor,
    /// The active profile contains no depth stream.
    NoDepthStream,
    /// The active profile contains no non-depth stream to register depth against.
    NoAlignmentTarget,
    /// No frame set arrived within the bounded wait.
    DeviceStalled { waited: Duration },
}

impl DriverError {
    /// Configuration errors are raised before the loop runs and are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DriverError::NoDepthSensor | DriverError::NoDepthStream | DriverError::NoAlignmentTarget
        )
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverError::NoDepthSensor => write!(f, "device does not have a depth sensor"),
            DriverError::NoDepthStream => write!(f, "no depth stream available"),
            DriverError::NoAlignmentTarget => write!(f, "no stream found to align with depth"),
            DriverError::DeviceStalled { waited } => write!(
                f,
                "device stalled: no frames within {} ms",
                waited.as_millis()
            ),
        }
    }
}

impl std::error::Error for DriverError {}

use thiserror::Error;

use super::capability::{Capability, InputMode};
use super::result::{BBox, Detection};
use crate::frame::Frame;

/// Why a capability produced no answer for a frame.
///
/// Both variants are recovered locally: the capability's output for the frame is
/// treated as empty, which fusion turns into `Unknown` attributes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider {provider} did not answer within {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },

    #[error("provider {provider} unavailable: {reason}")]
    Unavailable { provider: String, reason: String },
}

impl ProviderError {
    pub fn unavailable(provider: &str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// A detection capability the pipeline consumes.
///
/// Implementations answer for exactly one capability and must treat the frame
/// as read-only. Returned boxes are always in full-frame coordinates, also when
/// called with a region hint.
pub trait CapabilityProvider: Send {
    fn name(&self) -> &str;

    fn capability(&self) -> Capability;

    fn input_mode(&self) -> InputMode {
        InputMode::FullFrame
    }

    fn detect(
        &mut self,
        frame: &Frame,
        region_hint: Option<BBox>,
    ) -> Result<Vec<Detection>, ProviderError>;

    /// True when the output depends on the pixels alone, so a result may be
    /// reused for a frame with the same content. Providers that answer from
    /// anything else (sequence numbers, wall clock, external state) return false.
    fn cacheable(&self) -> bool {
        true
    }

    /// Optional warm-up hook, run once while the camera loop is starting.
    fn warm_up(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }
}

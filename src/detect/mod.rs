mod backends;
mod capability;
mod provider;
mod registry;
mod result;
mod worker;

pub use backends::ReplayProvider;
pub use capability::{BehaviorKind, Capability, GearKind, InputMode};
pub use provider::{CapabilityProvider, ProviderError};
pub use registry::{ProviderSet, ProviderSetBuilder, SecondaryProvider};
pub use result::{AttributeValue, BBox, Compliance, Detection, COMPLIANT_KEY};
pub use worker::{PendingCall, TimeBoxedProvider};

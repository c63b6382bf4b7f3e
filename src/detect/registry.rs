use anyhow::{anyhow, Result};
use std::collections::BTreeSet;
use std::time::Duration;

use super::capability::Capability;
use super::provider::{CapabilityProvider, ProviderError};
use super::worker::TimeBoxedProvider;

/// A secondary provider plus its correlation threshold override.
pub struct SecondaryProvider {
    pub provider: TimeBoxedProvider,
    /// Overrides the camera's `min_iou` for this capability.
    pub min_iou: Option<f32>,
}

/// The providers one camera runs: one primary-subject provider and any number
/// of secondary capabilities, each on its own worker thread.
///
/// Built once per camera; the set of capabilities never changes per frame.
pub struct ProviderSet {
    primary: TimeBoxedProvider,
    secondaries: Vec<SecondaryProvider>,
}

impl ProviderSet {
    pub fn builder() -> ProviderSetBuilder {
        ProviderSetBuilder::default()
    }

    pub fn primary(&self) -> &TimeBoxedProvider {
        &self.primary
    }

    pub fn secondaries(&self) -> &[SecondaryProvider] {
        &self.secondaries
    }

    /// Capabilities in registration order, primary first.
    pub fn capabilities(&self) -> Vec<Capability> {
        std::iter::once(self.primary.capability())
            .chain(self.secondaries.iter().map(|s| s.provider.capability()))
            .collect()
    }

    /// Whether fusion output for this set may be memoized by frame content.
    /// One provider answering from something other than pixels rules it out.
    pub fn cacheable(&self) -> bool {
        self.primary.cacheable() && self.secondaries.iter().all(|s| s.provider.cacheable())
    }

    /// Run every provider's warm-up hook. Failures are returned per provider,
    /// a failed warm-up does not disable the provider.
    pub fn warm_up(&self, timeout: Duration) -> Vec<(String, ProviderError)> {
        std::iter::once(&self.primary)
            .chain(self.secondaries.iter().map(|s| &s.provider))
            .filter_map(|p| {
                p.warm_up(timeout)
                    .err()
                    .map(|err| (p.name().to_string(), err))
            })
            .collect()
    }
}

#[derive(Default)]
pub struct ProviderSetBuilder {
    primary: Option<Box<dyn CapabilityProvider>>,
    secondaries: Vec<(Box<dyn CapabilityProvider>, Option<f32>)>,
}

impl ProviderSetBuilder {
    pub fn primary<P: CapabilityProvider + 'static>(self, provider: P) -> Self {
        self.primary_boxed(Box::new(provider))
    }

    pub fn primary_boxed(mut self, provider: Box<dyn CapabilityProvider>) -> Self {
        self.primary = Some(provider);
        self
    }

    pub fn secondary<P: CapabilityProvider + 'static>(self, provider: P) -> Self {
        self.secondary_boxed(Box::new(provider), None)
    }

    pub fn secondary_boxed(
        mut self,
        provider: Box<dyn CapabilityProvider>,
        min_iou: Option<f32>,
    ) -> Self {
        self.secondaries.push((provider, min_iou));
        self
    }

    /// Validate the capability layout and start every worker thread.
    pub fn build(self) -> Result<ProviderSet> {
        let primary = self
            .primary
            .ok_or_else(|| anyhow!("provider set needs a primary-subject provider"))?;
        if !primary.capability().is_primary() {
            return Err(anyhow!(
                "primary provider {} reports {}, expected presence",
                primary.name(),
                primary.capability()
            ));
        }

        let mut seen = BTreeSet::new();
        for (provider, min_iou) in &self.secondaries {
            let capability = provider.capability();
            if capability.is_primary() {
                return Err(anyhow!(
                    "secondary provider {} cannot report presence",
                    provider.name()
                ));
            }
            if !seen.insert(capability) {
                return Err(anyhow!(
                    "capability {} registered by more than one provider",
                    capability
                ));
            }
            if let Some(min_iou) = min_iou {
                if !(0.0..=1.0).contains(min_iou) {
                    return Err(anyhow!(
                        "min_iou for {} must be within [0, 1], got {}",
                        capability,
                        min_iou
                    ));
                }
            }
        }

        let primary = TimeBoxedProvider::spawn(primary)?;
        let mut secondaries = Vec::with_capacity(self.secondaries.len());
        for (provider, min_iou) in self.secondaries {
            secondaries.push(SecondaryProvider {
                provider: TimeBoxedProvider::spawn(provider)?,
                min_iou,
            });
        }
        Ok(ProviderSet {
            primary,
            secondaries,
        })
    }
}

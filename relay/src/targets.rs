//! The configured set of upstream instances.
//!
//! Targets are built once from [`RelayConfig`] at startup and shared
//! read-only across every request. Configured order is preserved; the primary
//! instance is either named explicitly by the `primary` config key or
//! defaults to the first entry.

use crate::config::{RelayConfig, ValidationError};
use std::fmt;
use std::sync::Arc;
use url::Url;

/// One configured upstream instance: where to send and what credential to use.
#[derive(Clone)]
pub struct InstanceTarget {
    pub base_url: Url,
    pub credential: String,
}

impl fmt::Debug for InstanceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceTarget")
            .field("base_url", &self.base_url.as_str())
            .field("credential", &"<redacted>")
            .finish()
    }
}

#[derive(Debug)]
struct TargetsInner {
    targets: Vec<InstanceTarget>,
    primary_index: usize,
}

/// Ordered, immutable collection of instance targets.
#[derive(Clone, Debug)]
pub struct Targets {
    inner: Arc<TargetsInner>,
}

impl Targets {
    pub fn from_config(config: &RelayConfig) -> Result<Self, ValidationError> {
        let mut targets = Vec::with_capacity(config.instances.len());
        for (base_url, credential) in &config.instances {
            let base_url = Url::parse(base_url)
                .map_err(|_| ValidationError::InvalidInstanceUrl(base_url.clone()))?;
            targets.push(InstanceTarget {
                base_url,
                credential: credential.clone(),
            });
        }
        if targets.is_empty() {
            return Err(ValidationError::NoInstances);
        }

        let primary_index = match &config.primary {
            Some(primary) => config
                .instances
                .get_index_of(primary)
                .ok_or_else(|| ValidationError::UnknownPrimary(primary.clone()))?,
            None => 0,
        };

        Ok(Self {
            inner: Arc::new(TargetsInner {
                targets,
                primary_index,
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.targets.is_empty()
    }

    /// Targets in configured order
    pub fn iter(&self) -> impl Iterator<Item = &InstanceTarget> {
        self.inner.targets.iter()
    }

    pub fn primary_index(&self) -> usize {
        self.inner.primary_index
    }

    pub fn primary(&self) -> &InstanceTarget {
        &self.inner.targets[self.inner.primary_index]
    }
}

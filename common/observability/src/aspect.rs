use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::AspectError;

const METRIC_ASPECT_UPDATES: &str = "config_aspect_updates_total";

/// Raw key/value contents of one configuration source.
pub type ConfigData = BTreeMap<String, String>;

/// One independently reconfigurable facet of the observability stack.
///
/// `parse` must be free of side effects; everything that touches the outside
/// world belongs in `apply`.
#[async_trait]
pub trait Aspect: Send + Sync + 'static {
    type Settings: Clone + Debug + PartialEq + Send + Sync + 'static;

    const NAME: &'static str;

    /// Name of the configuration source this aspect reads.
    fn source(&self) -> &'static str;

    /// Settings in effect before any source has been applied.
    fn defaults(&self) -> Self::Settings;

    fn parse(&self, data: &ConfigData) -> Result<Self::Settings, AspectError>;

    async fn apply(&self, settings: &Self::Settings) -> Result<(), AspectError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AspectUpdate {
    Applied,
    Unchanged,
}

/// Read side of an aspect's settings. Every `load` returns a consistent
/// snapshot; it never observes a half-applied update.
pub struct AspectHandle<S> {
    settings: Arc<ArcSwap<S>>,
}

impl<S> AspectHandle<S> {
    pub fn load(&self) -> Arc<S> {
        self.settings.load_full()
    }
}

impl<S> Clone for AspectHandle<S> {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings.clone(),
        }
    }
}

/// An [`Aspect`] together with its last successfully applied settings.
pub struct ConfigAspect<A: Aspect> {
    aspect: A,
    settings: Arc<ArcSwap<A::Settings>>,
    applied: Mutex<bool>,
}

impl<A: Aspect> ConfigAspect<A> {
    pub fn new(aspect: A) -> Self {
        let defaults = aspect.defaults();
        Self {
            aspect,
            settings: Arc::new(ArcSwap::from_pointee(defaults)),
            applied: Mutex::new(false),
        }
    }

    pub fn handle(&self) -> AspectHandle<A::Settings> {
        AspectHandle {
            settings: self.settings.clone(),
        }
    }

    pub fn aspect(&self) -> &A {
        &self.aspect
    }

    /// Parse, compare, apply and publish. The published settings only change
    /// when `apply` succeeds; on any error the last-known-good settings stay.
    pub async fn update(&self, data: &ConfigData) -> Result<AspectUpdate, AspectError> {
        let mut applied = self.applied.lock().await;

        let next = self.aspect.parse(data)?;
        if *applied && *self.settings.load_full() == next {
            return Ok(AspectUpdate::Unchanged);
        }

        self.aspect.apply(&next).await?;
        self.settings.store(Arc::new(next));
        *applied = true;
        Ok(AspectUpdate::Applied)
    }
}

/// Object-safe view of a [`ConfigAspect`], so the pipeline can hold aspects
/// with different settings types.
#[async_trait]
pub(crate) trait DynAspect: Send + Sync {
    fn name(&self) -> &'static str;
    fn source(&self) -> &'static str;
    async fn update_logged(&self, data: &ConfigData) -> Result<AspectUpdate, AspectError>;
}

#[async_trait]
impl<A: Aspect> DynAspect for ConfigAspect<A> {
    fn name(&self) -> &'static str {
        A::NAME
    }

    fn source(&self) -> &'static str {
        self.aspect.source()
    }

    async fn update_logged(&self, data: &ConfigData) -> Result<AspectUpdate, AspectError> {
        let result = self.update(data).await;
        let label = match &result {
            Ok(AspectUpdate::Applied) => {
                info!(aspect = A::NAME, settings = ?*self.settings.load(), "config aspect applied");
                "applied"
            }
            Ok(AspectUpdate::Unchanged) => "unchanged",
            Err(e) => {
                warn!(
                    aspect = A::NAME,
                    error = %e,
                    "config aspect update rejected, keeping previous settings"
                );
                e.result_label()
            }
        };
        metrics::counter!(
            METRIC_ASPECT_UPDATES,
            "aspect" => A::NAME,
            "result" => label
        )
        .increment(1);
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Aspect that accepts `level` values and counts applies.
    pub(crate) struct LevelAspect {
        pub(crate) applies: Arc<AtomicUsize>,
        pub(crate) fail_apply: bool,
    }

    impl LevelAspect {
        pub(crate) fn new() -> Self {
            Self {
                applies: Arc::new(AtomicUsize::new(0)),
                fail_apply: false,
            }
        }
    }

    #[async_trait]
    impl Aspect for LevelAspect {
        type Settings = u8;
        const NAME: &'static str = "level";

        fn source(&self) -> &'static str {
            "config-level"
        }

        fn defaults(&self) -> u8 {
            1
        }

        fn parse(&self, data: &ConfigData) -> Result<u8, AspectError> {
            match data.get("level") {
                None => Ok(1),
                Some(raw) => raw
                    .parse()
                    .map_err(|e: std::num::ParseIntError| AspectError::invalid("level", e)),
            }
        }

        async fn apply(&self, _settings: &u8) -> Result<(), AspectError> {
            if self.fail_apply {
                return Err(AspectError::Apply("refused".to_string()));
            }
            self.applies.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn data(pairs: &[(&str, &str)]) -> ConfigData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn first_update_applies_even_with_default_values() {
        let aspect = ConfigAspect::new(LevelAspect::new());
        let applies = aspect.aspect().applies.clone();

        assert_eq!(aspect.update(&data(&[])).await.unwrap(), AspectUpdate::Applied);
        assert_eq!(applies.load(Ordering::SeqCst), 1);
        assert_eq!(
            aspect.update(&data(&[])).await.unwrap(),
            AspectUpdate::Unchanged
        );
        assert_eq!(applies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_value_keeps_last_good_settings() {
        let aspect = ConfigAspect::new(LevelAspect::new());
        let handle = aspect.handle();

        aspect.update(&data(&[("level", "4")])).await.unwrap();
        assert_eq!(*handle.load(), 4);

        let err = aspect
            .update(&data(&[("level", "loud")]))
            .await
            .unwrap_err();
        assert!(matches!(err, AspectError::Invalid { ref key, .. } if key == "level"));
        assert_eq!(*handle.load(), 4);
    }

    #[tokio::test]
    async fn failed_apply_does_not_publish() {
        let mut level = LevelAspect::new();
        level.fail_apply = true;
        let aspect = ConfigAspect::new(level);
        let handle = aspect.handle();

        let err = aspect.update(&data(&[("level", "7")])).await.unwrap_err();
        assert!(matches!(err, AspectError::Apply(_)));
        assert_eq!(*handle.load(), 1);
    }
}

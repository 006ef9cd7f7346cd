use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use lifecycle::Lifetime;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::aspect::{Aspect, AspectHandle, AspectUpdate, ConfigAspect, ConfigData, DynAspect};
use crate::error::AspectError;
use crate::snapshot::ConfigSnapshot;

pub type UpdateReport = Vec<(&'static str, Result<AspectUpdate, AspectError>)>;

/// Routes configuration snapshots to the aspects bound to their source.
///
/// Aspects are updated independently: an error in one never prevents the
/// others from applying.
#[derive(Default)]
pub struct ConfigPipeline {
    aspects: Vec<Arc<dyn DynAspect>>,
    last_seen: Mutex<HashMap<String, ConfigData>>,
}

impl ConfigPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A: Aspect>(&mut self, aspect: A) -> AspectHandle<A::Settings> {
        let aspect = ConfigAspect::new(aspect);
        let handle = aspect.handle();
        self.aspects.push(Arc::new(aspect));
        handle
    }

    /// Names of all sources some aspect reads, sorted.
    pub fn sources(&self) -> BTreeSet<&'static str> {
        self.aspects.iter().map(|aspect| aspect.source()).collect()
    }

    /// Apply one snapshot to every aspect bound to its source. A snapshot
    /// identical to the last fully applied one for that source is skipped
    /// and yields an empty report.
    pub async fn apply_snapshot(&self, snapshot: &ConfigSnapshot) -> UpdateReport {
        let mut last_seen = self.last_seen.lock().await;
        if last_seen.get(&snapshot.name) == Some(&snapshot.data) {
            debug!(source = %snapshot.name, "config source unchanged, skipping");
            return Vec::new();
        }

        let mut report = Vec::new();
        for aspect in self
            .aspects
            .iter()
            .filter(|aspect| aspect.source() == snapshot.name)
        {
            let result = aspect.update_logged(&snapshot.data).await;
            report.push((aspect.name(), result));
        }

        // Only remember fully applied data, so a failed apply is retried on
        // the next event for the same source.
        if report.iter().all(|(_, result)| result.is_ok()) {
            last_seen.insert(snapshot.name.clone(), snapshot.data.clone());
        }
        report
    }

    /// Materialize every aspect. Sources without a snapshot are applied as
    /// empty, which puts their aspects on default settings.
    pub async fn apply_all(&self, snapshots: Vec<ConfigSnapshot>) -> UpdateReport {
        let mut by_name: HashMap<String, ConfigSnapshot> = snapshots
            .into_iter()
            .map(|snapshot| (snapshot.name.clone(), snapshot))
            .collect();

        let mut report = Vec::new();
        for source in self.sources() {
            let snapshot = by_name
                .remove(source)
                .unwrap_or_else(|| ConfigSnapshot::empty(source));
            report.extend(self.apply_snapshot(&snapshot).await);
        }
        for unused in by_name.keys() {
            debug!(source = %unused, "no aspect reads config source, ignoring");
        }
        report
    }

    /// Apply snapshots as they arrive until `lifetime` is cancelled or the
    /// channel closes.
    pub async fn watch(
        &self,
        mut updates: mpsc::UnboundedReceiver<ConfigSnapshot>,
        lifetime: Lifetime,
    ) {
        loop {
            tokio::select! {
                _ = lifetime.cancelled() => break,
                snapshot = updates.recv() => match snapshot {
                    Some(snapshot) => {
                        self.apply_snapshot(&snapshot).await;
                    }
                    None => break,
                },
            }
        }
        info!("config pipeline stopped watching");
    }
}

//! Upgrade rule executor for stored configuration blobs.
//!
//! Runs relocation rules ahead of conversion rules, replays the resolved
//! upgrade path over the stored raw text, re-stamps the version tag, merges
//! annotation side-car fields from the previous text, and suppresses
//! write-backs that would not change the stored value semantically.
//!
//! The executor is synchronous and takes no locks; safety under concurrent
//! execution rests on the version-tag skip and on annotation-insensitive
//! equality making repeated runs no-ops.

use std::collections::BTreeMap;

use config_kernel_core::{
    copy_comments, resolve_upgrade_path, structural_equals, NamedLocation, ShapeError, ShapeId,
    ShapeRegistry, ShapeTransform, UpgradeStep, VersionTag,
};
use serde_json::Value;

/// Top-level field identifying the shape version of a stored blob.
pub const VERSION_FIELD: &str = "Version";

#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("conversion {from} -> {to} failed: {source}")]
    Conversion {
        from: ShapeId,
        to: ShapeId,
        #[source]
        source: ShapeError,
    },
    #[error("codec failure for shape {shape}: {source}")]
    Codec {
        shape: ShapeId,
        #[source]
        source: anyhow::Error,
    },
    #[error("persistence failure at {location}: {source}")]
    Persistence {
        location: NamedLocation,
        #[source]
        source: anyhow::Error,
    },
}

/// Raw text persistence, implemented by the host.
pub trait RawConfigStore {
    /// # Errors
    /// Returns an error when the hosting store is unavailable.
    fn read_raw(&self, location: &NamedLocation) -> anyhow::Result<Option<String>>;

    /// # Errors
    /// Returns an error when the hosting store rejects the write.
    fn write_raw(&mut self, location: &NamedLocation, text: &str) -> anyhow::Result<()>;

    /// # Errors
    /// Returns an error when the hosting store rejects the removal.
    fn remove_raw(&mut self, location: &NamedLocation) -> anyhow::Result<()>;
}

/// Shape-bound (de)serialization, implemented by the host or provided by
/// [`JsonShapeCodec`].
pub trait ShapeCodec {
    /// # Errors
    /// Returns an error when the text is not a valid instance of the shape.
    fn deserialize(&self, shape: &ShapeId, text: &str) -> anyhow::Result<Value>;

    /// # Errors
    /// Returns an error when the instance cannot be rendered as text.
    fn serialize(&self, shape: &ShapeId, instance: &Value) -> anyhow::Result<String>;

    /// Construct a fresh default instance of the shape, for mutator
    /// transforms to fill in.
    ///
    /// # Errors
    /// Returns an error when no default can be constructed.
    fn default_instance(&self, shape: &ShapeId) -> anyhow::Result<Value>;
}

/// Default codec: plain JSON text, with per-shape default instances
/// registered at startup. Shapes without a registered default start from an
/// empty object.
#[derive(Debug, Default)]
pub struct JsonShapeCodec {
    defaults: BTreeMap<ShapeId, Value>,
}

impl JsonShapeCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_default(mut self, shape: impl Into<ShapeId>, instance: Value) -> Self {
        self.defaults.insert(shape.into(), instance);
        self
    }
}

impl ShapeCodec for JsonShapeCodec {
    fn deserialize(&self, shape: &ShapeId, text: &str) -> anyhow::Result<Value> {
        serde_json::from_str(text)
            .map_err(|err| anyhow::anyhow!("invalid JSON for shape {shape}: {err}"))
    }

    fn serialize(&self, shape: &ShapeId, instance: &Value) -> anyhow::Result<String> {
        serde_json::to_string(instance)
            .map_err(|err| anyhow::anyhow!("cannot render shape {shape}: {err}"))
    }

    fn default_instance(&self, shape: &ShapeId) -> anyhow::Result<Value> {
        Ok(self.defaults.get(shape).cloned().unwrap_or_else(|| Value::Object(serde_json::Map::new())))
    }
}

/// In-memory reference store, used by the engine's own tests and usable by
/// host test suites.
#[derive(Debug, Default, Clone)]
pub struct MemoryConfigStore {
    entries: BTreeMap<NamedLocation, String>,
}

impl MemoryConfigStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&mut self, location: NamedLocation, text: impl Into<String>) {
        self.entries.insert(location, text.into());
    }

    #[must_use]
    pub fn text_at(&self, location: &NamedLocation) -> Option<&str> {
        self.entries.get(location).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RawConfigStore for MemoryConfigStore {
    fn read_raw(&self, location: &NamedLocation) -> anyhow::Result<Option<String>> {
        Ok(self.entries.get(location).cloned())
    }

    fn write_raw(&mut self, location: &NamedLocation, text: &str) -> anyhow::Result<()> {
        self.entries.insert(location.clone(), text.to_string());
        Ok(())
    }

    fn remove_raw(&mut self, location: &NamedLocation) -> anyhow::Result<()> {
        self.entries.remove(location);
        Ok(())
    }
}

/// Moves raw text from a legacy location to the current one, independent of
/// shape versioning. A no-op when the source holds nothing; skipped when the
/// target already holds data.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RelocationRule {
    pub source: NamedLocation,
    pub target: NamedLocation,
    pub remove_source: bool,
}

impl RelocationRule {
    #[must_use]
    pub fn new(source: NamedLocation, target: NamedLocation) -> Self {
        Self { source, target, remove_source: true }
    }

    #[must_use]
    pub fn keep_source(mut self) -> Self {
        self.remove_source = false;
        self
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SkipReason {
    /// No usable upgrade chain was declared for the requested shape.
    NoUpgradePath,
    /// The current location holds no stored value.
    NoStoredValue,
    /// The stored version tag does not match the chain's starting version;
    /// the data is already at a different version.
    VersionMismatch { stored: VersionTag, expected: VersionTag },
    /// The conversion produced output semantically identical to the stored
    /// value; the write-back was suppressed.
    UnchangedOutput,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UpgradeReport {
    pub relocated: bool,
    pub converted: bool,
    pub skipped: Option<SkipReason>,
}

impl UpgradeReport {
    #[must_use]
    pub fn mutated_storage(&self) -> bool {
        self.relocated || self.converted
    }

    fn skipped(relocated: bool, reason: SkipReason) -> Self {
        Self { relocated, converted: false, skipped: Some(reason) }
    }
}

/// Replays declared upgrade rules against stored configuration text.
pub struct UpgradeExecutor<'a> {
    registry: &'a dyn ShapeRegistry,
    codec: &'a dyn ShapeCodec,
}

impl<'a> UpgradeExecutor<'a> {
    #[must_use]
    pub fn new(registry: &'a dyn ShapeRegistry, codec: &'a dyn ShapeCodec) -> Self {
        Self { registry, codec }
    }

    /// Upgrade the blob at `location` to the shape the running code expects.
    ///
    /// Returns `true` iff a relocation or a conversion actually mutated
    /// storage.
    ///
    /// # Errors
    /// Returns [`UpgradeError::Conversion`] or [`UpgradeError::Codec`] when a
    /// step of the chain fails (nothing has been persisted at that point), and
    /// [`UpgradeError::Persistence`] when the hosting store itself fails.
    pub fn upgrade_stored_configuration(
        &self,
        store: &mut dyn RawConfigStore,
        location: &NamedLocation,
        requested: &ShapeId,
        relocations: &[RelocationRule],
    ) -> Result<bool, UpgradeError> {
        self.upgrade_with_report(store, location, requested, relocations)
            .map(|report| report.mutated_storage())
    }

    /// Like [`Self::upgrade_stored_configuration`], returning the full
    /// relocation/conversion/skip breakdown.
    ///
    /// # Errors
    /// Same failure modes as [`Self::upgrade_stored_configuration`].
    pub fn upgrade_with_report(
        &self,
        store: &mut dyn RawConfigStore,
        location: &NamedLocation,
        requested: &ShapeId,
        relocations: &[RelocationRule],
    ) -> Result<UpgradeReport, UpgradeError> {
        let relocated = self.run_relocations(store, relocations)?;

        let resolution = resolve_upgrade_path(self.registry, requested);
        let (Some(first_step), Some(last_step)) =
            (resolution.path.first(), resolution.path.last())
        else {
            tracing::debug!("no upgrade path for shape {requested}; nothing to do");
            return Ok(UpgradeReport::skipped(relocated, SkipReason::NoUpgradePath));
        };

        let stored_text = match store.read_raw(location) {
            Ok(Some(text)) => text,
            Ok(None) => {
                tracing::debug!("no stored value at {location}; nothing to upgrade");
                return Ok(UpgradeReport::skipped(relocated, SkipReason::NoStoredValue));
            }
            Err(source) => {
                return Err(UpgradeError::Persistence { location: location.clone(), source });
            }
        };

        let stored_tag = stored_version(&stored_text);
        if !stored_tag.is_zero() && stored_tag != first_step.from_version {
            tracing::debug!(
                "stored value at {location} is at version {stored_tag}, chain starts at {}; skipping",
                first_step.from_version
            );
            return Ok(UpgradeReport::skipped(
                relocated,
                SkipReason::VersionMismatch {
                    stored: stored_tag,
                    expected: first_step.from_version,
                },
            ));
        }

        let mut text = stored_text.clone();
        for step in &resolution.path {
            text = self.apply_step(step, &text)?;
        }

        let mut upgraded = self
            .codec
            .deserialize(&last_step.to_shape, &text)
            .map_err(|source| UpgradeError::Codec { shape: last_step.to_shape.clone(), source })?;
        stamp_version(&mut upgraded, location, last_step.to_version);

        if let Ok(original) = serde_json::from_str::<Value>(&stored_text) {
            copy_comments(&original, &mut upgraded);
            if structural_equals(&original, &upgraded) {
                tracing::debug!(
                    "upgrade of {location} produced semantically identical output; write suppressed"
                );
                return Ok(UpgradeReport::skipped(relocated, SkipReason::UnchangedOutput));
            }
        }

        let final_text = self
            .codec
            .serialize(&last_step.to_shape, &upgraded)
            .map_err(|source| UpgradeError::Codec { shape: last_step.to_shape.clone(), source })?;
        store
            .write_raw(location, &final_text)
            .map_err(|source| UpgradeError::Persistence { location: location.clone(), source })?;

        tracing::info!(
            "upgraded {location} from version {} to {} across {} step(s)",
            first_step.from_version,
            last_step.to_version,
            resolution.path.len()
        );
        Ok(UpgradeReport { relocated, converted: true, skipped: None })
    }

    fn run_relocations(
        &self,
        store: &mut dyn RawConfigStore,
        relocations: &[RelocationRule],
    ) -> Result<bool, UpgradeError> {
        let mut moved = false;
        for rule in relocations {
            let source_text = store
                .read_raw(&rule.source)
                .map_err(|source| UpgradeError::Persistence {
                    location: rule.source.clone(),
                    source,
                })?;
            let Some(source_text) = source_text else {
                continue;
            };

            let target_occupied = store
                .read_raw(&rule.target)
                .map_err(|source| UpgradeError::Persistence {
                    location: rule.target.clone(),
                    source,
                })?
                .is_some();
            if target_occupied {
                tracing::warn!(
                    "relocation conflict: both {} and {} hold data; leaving both in place",
                    rule.source,
                    rule.target
                );
                continue;
            }

            store.write_raw(&rule.target, &source_text).map_err(|source| {
                UpgradeError::Persistence { location: rule.target.clone(), source }
            })?;
            if rule.remove_source {
                store.remove_raw(&rule.source).map_err(|source| UpgradeError::Persistence {
                    location: rule.source.clone(),
                    source,
                })?;
            }
            tracing::info!("relocated configuration: {} -> {}", rule.source, rule.target);
            moved = true;
        }
        Ok(moved)
    }

    fn apply_step(&self, step: &UpgradeStep, text: &str) -> Result<String, UpgradeError> {
        let instance = self
            .codec
            .deserialize(&step.from_shape, text)
            .map_err(|source| UpgradeError::Codec { shape: step.from_shape.clone(), source })?;

        let transform = self
            .registry
            .lookup(&step.transform_owner)
            .and_then(|descriptor| descriptor.transform.as_ref())
            .ok_or_else(|| UpgradeError::Conversion {
                from: step.from_shape.clone(),
                to: step.to_shape.clone(),
                source: ShapeError::MissingTransform(step.transform_owner.clone()),
            })?;

        let output = match transform {
            ShapeTransform::Factory { apply, .. } => apply(&instance),
            ShapeTransform::Mutator { apply, .. } => {
                let mut fresh = self.codec.default_instance(&step.to_shape).map_err(|source| {
                    UpgradeError::Codec { shape: step.to_shape.clone(), source }
                })?;
                apply(&mut fresh, &instance).map(|()| fresh)
            }
        }
        .map_err(|source| UpgradeError::Conversion {
            from: step.from_shape.clone(),
            to: step.to_shape.clone(),
            source,
        })?;

        self.codec
            .serialize(&step.to_shape, &output)
            .map_err(|source| UpgradeError::Codec { shape: step.to_shape.clone(), source })
    }
}

fn stored_version(text: &str) -> VersionTag {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return VersionTag::ZERO;
    };
    value.get(VERSION_FIELD).and_then(Value::as_str).map_or(VersionTag::ZERO, VersionTag::parse)
}

/// Defensive fix-up for a transform callable that forgot to stamp the
/// version: ensure the emitted object carries the chain's final version.
fn stamp_version(upgraded: &mut Value, location: &NamedLocation, expected: VersionTag) {
    let Value::Object(map) = upgraded else {
        tracing::warn!("upgraded value at {location} is not a JSON object; version tag not stamped");
        return;
    };
    let current = map.get(VERSION_FIELD).and_then(Value::as_str).map(VersionTag::parse);
    if current != Some(expected) {
        tracing::warn!(
            "upgraded value at {location} carries version {:?}, expected {expected}; overwriting",
            current
        );
        map.insert(VERSION_FIELD.to_string(), Value::String(expected.to_string()));
    }
}

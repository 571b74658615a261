use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved suffix marking an annotation side-car field next to a data field.
pub const COMMENT_SUFFIX: &str = "-Comment";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ShapeError {
    #[error("transform failed: {0}")]
    Transform(String),
    #[error("shape {0} declares no transform")]
    MissingTransform(ShapeId),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VersionTag {
    pub major: u32,
    pub minor: u32,
}

impl VersionTag {
    pub const ZERO: Self = Self { major: 0, minor: 0 };

    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse a "Major.Minor" text tag. Missing or unparsable input yields "0.0";
    /// a tag is never absent once constructed.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let Some((major, minor)) = text.trim().split_once('.') else {
            return Self::ZERO;
        };
        match (major.trim().parse(), minor.trim().parse()) {
            (Ok(major), Ok(minor)) => Self { major, minor },
            _ => Self::ZERO,
        }
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }
}

impl Display for VersionTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ShapeId(pub String);

impl ShapeId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ShapeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl Display for ShapeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies where one raw configuration blob is persisted. The triple is
/// opaque to the engine; only the host's store gives it meaning.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NamedLocation {
    pub store_kind: String,
    pub namespace: String,
    pub key: String,
}

impl NamedLocation {
    #[must_use]
    pub fn new(
        store_kind: impl Into<String>,
        namespace: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self { store_kind: store_kind.into(), namespace: namespace.into(), key: key.into() }
    }
}

impl Display for NamedLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.store_kind, self.namespace, self.key)
    }
}

pub type FactoryFn = Box<dyn Fn(&Value) -> Result<Value, ShapeError> + Send + Sync>;
pub type MutatorFn = Box<dyn Fn(&mut Value, &Value) -> Result<(), ShapeError> + Send + Sync>;

/// The declared conversion producing an instance of the shape that carries it.
///
/// A `Factory` builds the new instance outright; a `Mutator` fills in a freshly
/// constructed default instance of the target shape from the old instance.
/// `parameter` is `None` when the input type carries no shape identity (raw
/// text or a generic structured blob), which forces the resolver onto the
/// explicit-predecessor discovery strategy.
pub enum ShapeTransform {
    Factory { parameter: Option<ShapeId>, apply: FactoryFn },
    Mutator { parameter: Option<ShapeId>, apply: MutatorFn },
}

impl ShapeTransform {
    #[must_use]
    pub fn factory(
        parameter: Option<ShapeId>,
        apply: impl Fn(&Value) -> Result<Value, ShapeError> + Send + Sync + 'static,
    ) -> Self {
        Self::Factory { parameter, apply: Box::new(apply) }
    }

    #[must_use]
    pub fn mutator(
        parameter: Option<ShapeId>,
        apply: impl Fn(&mut Value, &Value) -> Result<(), ShapeError> + Send + Sync + 'static,
    ) -> Self {
        Self::Mutator { parameter, apply: Box::new(apply) }
    }

    #[must_use]
    pub fn parameter(&self) -> Option<&ShapeId> {
        match self {
            Self::Factory { parameter, .. } | Self::Mutator { parameter, .. } => parameter.as_ref(),
        }
    }

    #[must_use]
    pub fn is_factory(&self) -> bool {
        matches!(self, Self::Factory { .. })
    }
}

impl fmt::Debug for ShapeTransform {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Factory { parameter, .. } => {
                f.debug_struct("Factory").field("parameter", parameter).finish_non_exhaustive()
            }
            Self::Mutator { parameter, .. } => {
                f.debug_struct("Mutator").field("parameter", parameter).finish_non_exhaustive()
            }
        }
    }
}

/// Static metadata for one configuration shape: its declared version, at most
/// one predecessor shape, and the transform that produces it.
#[derive(Debug)]
pub struct ShapeDescriptor {
    pub shape_id: ShapeId,
    pub declared_version: VersionTag,
    pub predecessor: Option<ShapeId>,
    pub transform: Option<ShapeTransform>,
}

impl ShapeDescriptor {
    #[must_use]
    pub fn new(shape_id: impl Into<ShapeId>, declared_version: VersionTag) -> Self {
        Self { shape_id: shape_id.into(), declared_version, predecessor: None, transform: None }
    }

    #[must_use]
    pub fn with_predecessor(mut self, predecessor: impl Into<ShapeId>) -> Self {
        self.predecessor = Some(predecessor.into());
        self
    }

    #[must_use]
    pub fn with_transform(mut self, transform: ShapeTransform) -> Self {
        self.transform = Some(transform);
        self
    }
}

impl From<String> for ShapeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Host-declared shape metadata, consumed read-only by the resolver.
pub trait ShapeRegistry {
    fn lookup(&self, shape: &ShapeId) -> Option<&ShapeDescriptor>;
}

/// Explicit descriptor table built once at startup, replacing runtime type
/// introspection over host metadata.
#[derive(Debug, Default)]
pub struct StaticShapeRegistry {
    descriptors: BTreeMap<ShapeId, ShapeDescriptor>,
}

impl StaticShapeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one descriptor, returning any displaced descriptor for the
    /// same shape id.
    pub fn register(&mut self, descriptor: ShapeDescriptor) -> Option<ShapeDescriptor> {
        self.descriptors.insert(descriptor.shape_id.clone(), descriptor)
    }

    #[must_use]
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ShapeDescriptor>) -> Self {
        let mut registry = Self::new();
        for descriptor in descriptors {
            registry.register(descriptor);
        }
        registry
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl ShapeRegistry for StaticShapeRegistry {
    fn lookup(&self, shape: &ShapeId) -> Option<&ShapeDescriptor> {
        self.descriptors.get(shape)
    }
}

/// One executable link in an upgrade path. `transform_owner` names the
/// descriptor whose transform performs this step: the step's own `to_shape`
/// when the predecessor was discovered through the transform parameter, or the
/// `from_shape` when the predecessor was declared explicitly and carries the
/// forward transform itself.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UpgradeStep {
    pub from_shape: ShapeId,
    pub to_shape: ShapeId,
    pub from_version: VersionTag,
    pub to_version: VersionTag,
    pub transform_owner: ShapeId,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Resolution {
    pub found: bool,
    pub result_version: VersionTag,
    pub path: Vec<UpgradeStep>,
}

impl Resolution {
    fn not_found(result_version: VersionTag) -> Self {
        Self { found: false, result_version, path: Vec::new() }
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        !self.found
    }
}

/// Walk the predecessor chain backward from `requested` and assemble the
/// ordered oldest-to-newest upgrade path.
///
/// At each backward step the explicit predecessor declaration wins; the
/// transform's parameter shape is the fallback. The walk stops successfully at
/// a shape with neither, and stops keeping the accumulated path when the next
/// candidate cannot be resolved in the registry. Revisiting any shape within
/// one walk fails the entire resolution closed: no partial path survives a
/// cycle.
#[must_use]
pub fn resolve_upgrade_path(registry: &dyn ShapeRegistry, requested: &ShapeId) -> Resolution {
    let result_version =
        registry.lookup(requested).map_or(VersionTag::ZERO, |d| d.declared_version);

    let mut visited = BTreeSet::new();
    visited.insert(requested.clone());
    let mut current = requested.clone();
    let mut newest_first: Vec<UpgradeStep> = Vec::new();

    loop {
        let Some(descriptor) = registry.lookup(&current) else {
            break;
        };

        let (predecessor, owner) = if let Some(predecessor) = &descriptor.predecessor {
            // Oldest-declares-forward: the predecessor's own transform performs
            // predecessor -> current.
            (predecessor.clone(), predecessor.clone())
        } else if let Some(transform) = &descriptor.transform {
            match transform.parameter() {
                Some(parameter) if registry.lookup(parameter).is_some() => {
                    (parameter.clone(), current.clone())
                }
                // The parameter carries no resolvable shape identity; the walk
                // cannot continue structurally.
                _ => break,
            }
        } else {
            // Root shape.
            break;
        };

        if visited.contains(&predecessor) {
            return Resolution::not_found(result_version);
        }

        let Some(predecessor_descriptor) = registry.lookup(&predecessor) else {
            break;
        };

        let owner_has_transform = if owner == predecessor {
            predecessor_descriptor.transform.is_some()
        } else {
            descriptor.transform.is_some()
        };
        if !owner_has_transform {
            break;
        }

        newest_first.push(UpgradeStep {
            from_shape: predecessor.clone(),
            to_shape: current.clone(),
            from_version: predecessor_descriptor.declared_version,
            to_version: descriptor.declared_version,
            transform_owner: owner,
        });
        visited.insert(predecessor.clone());
        current = predecessor;
    }

    newest_first.reverse();
    Resolution { found: !newest_first.is_empty(), result_version, path: newest_first }
}

fn array_comment_target(data_key: &str) -> Option<(&str, usize)> {
    let (array_key, index) = data_key.rsplit_once('-')?;
    let index = index.parse::<usize>().ok()?;
    Some((array_key, index))
}

/// Carry annotation side-car fields from `source` into `target`, mutating
/// `target` in place.
///
/// A comment is copied only when its data key exists in `target` (any value,
/// including explicit null); orphaned comments are never created. Comments
/// present only in `target` are left untouched. Recursion descends into keys
/// whose values are objects on both sides, and position-wise into the
/// overlapping range of arrays where both elements are objects.
pub fn copy_comments(source: &Value, target: &mut Value) {
    let Value::Object(source_map) = source else {
        return;
    };
    let Value::Object(target_map) = target else {
        return;
    };

    for (key, comment) in source_map {
        let Some(data_key) = key.strip_suffix(COMMENT_SUFFIX) else {
            continue;
        };
        if target_map.contains_key(data_key) {
            target_map.insert(key.clone(), comment.clone());
            continue;
        }
        // "<ArrayProp>-<index>-Comment": existence means the target holds an
        // array with an element at that index.
        if let Some((array_key, index)) = array_comment_target(data_key) {
            if let Some(Value::Array(elements)) = target_map.get(array_key) {
                if index < elements.len() {
                    target_map.insert(key.clone(), comment.clone());
                }
            }
        }
    }

    for (key, source_value) in source_map {
        if key.ends_with(COMMENT_SUFFIX) {
            continue;
        }
        match (source_value, target_map.get_mut(key)) {
            (Value::Object(_), Some(target_value @ Value::Object(_))) => {
                copy_comments(source_value, target_value);
            }
            (Value::Array(source_elements), Some(Value::Array(target_elements))) => {
                let overlap = source_elements.len().min(target_elements.len());
                for position in 0..overlap {
                    let (Some(source_element), Some(target_element)) =
                        (source_elements.get(position), target_elements.get_mut(position))
                    else {
                        continue;
                    };
                    if source_element.is_object() && target_element.is_object() {
                        copy_comments(source_element, target_element);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Remove every annotation side-car field, recursively.
pub fn strip_comments(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|key, _| !key.ends_with(COMMENT_SUFFIX));
            for nested in map.values_mut() {
                strip_comments(nested);
            }
        }
        Value::Array(elements) => {
            for element in elements {
                strip_comments(element);
            }
        }
        _ => {}
    }
}

fn data_keys(map: &serde_json::Map<String, Value>) -> BTreeSet<&str> {
    map.keys().map(String::as_str).filter(|key| !key.ends_with(COMMENT_SUFFIX)).collect()
}

/// Annotation-insensitive deep equality.
///
/// Comment side-car fields are discarded before key sets are compared, object
/// values recurse, arrays compare element count and then element-wise (object
/// elements recurse, anything else compares by stable textual rendering).
/// Used to suppress a write-back when an upgrade pass only changed
/// serialization formatting or annotations.
#[must_use]
pub fn structural_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Object(map_a), Value::Object(map_b)) => {
            let keys = data_keys(map_a);
            if keys != data_keys(map_b) {
                return false;
            }
            keys.iter().all(|key| match (map_a.get(*key), map_b.get(*key)) {
                (Some(value_a), Some(value_b)) => structural_equals(value_a, value_b),
                _ => false,
            })
        }
        (Value::Array(elements_a), Value::Array(elements_b)) => {
            elements_a.len() == elements_b.len()
                && elements_a
                    .iter()
                    .zip(elements_b)
                    .all(|(element_a, element_b)| structural_equals(element_a, element_b))
        }
        _ => a.to_string() == b.to_string(),
    }
}

use static_assertions::assert_impl_all;

use crate::bus::{ObjectPath, PropertyMap};
use crate::uuid::Uuid;

/// GATT service recorded while enumerating a device's object tree.
#[derive(Clone, Debug)]
pub struct Service {
    path: ObjectPath,
    id: Uuid,
    primary: bool,
}

assert_impl_all!(Service: Send, Sync);

impl Service {
    /// `None` if the object has no parseable `UUID`.
    pub(in crate) fn from_properties(path: &ObjectPath, props: &PropertyMap) -> Option<Self> {
        let id = props.get("UUID")?.as_str()?.parse().ok()?;
        let primary = props.get("Primary").and_then(|v| v.as_bool()).unwrap_or(true);
        Some(Self {
            path: path.clone(),
            id,
            primary,
        })
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Indicates whether the type of service is primary or secondary.
    ///
    /// A primary service describes the primary function of a device. A secondary service is
    /// relevant only in the context of another service that references it.
    pub fn is_primary(&self) -> bool {
        self.primary
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for Service {}

impl std::hash::Hash for Service {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.path.hash(state)
    }
}

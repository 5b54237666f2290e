//! Object model (classes and their attributes) plus per-federate declarations.
//!
//! The model itself is static for the lifetime of a federation and is shared between
//! federations through an `Arc`. Declarations (what each federate publishes and subscribes
//! to) change at runtime and live in [`ObjectModelStore`].
//!
//! A model can be built programmatically or loaded from a TOML file:
//!
//! ```toml
//! [[classes]]
//! handle = 1
//! name = "Vehicle"
//! attributes = [1, 2, 3]
//! ```

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt::Display,
    path::Path,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use super::roster::FederateHandle;

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name($inner);

        impl $name {
            pub const fn new(raw: $inner) -> Self {
                Self(raw)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

handle_type!(ObjectClassHandle(u32));
handle_type!(AttributeHandle(u32));
handle_type!(
    /// Registered object instance, allocated by the federation.
    ObjectHandle(u64)
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectClass {
    pub handle: ObjectClassHandle,
    pub name: String,
    pub attributes: BTreeSet<AttributeHandle>,
}

#[derive(Debug, thiserror::Error)]
pub enum ObjectModelError {
    #[error("failed reading object model: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed object model: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("object class {0} is declared more than once")]
    DuplicateClass(ObjectClassHandle),
}

#[derive(Deserialize)]
struct ObjectModelFile {
    #[serde(default)]
    classes: Vec<ObjectClass>,
}

/// Static description of the object classes a federation exchanges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectModel {
    classes: BTreeMap<ObjectClassHandle, ObjectClass>,
}

impl ObjectModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(
        mut self,
        handle: ObjectClassHandle,
        name: impl Into<String>,
        attributes: impl IntoIterator<Item = AttributeHandle>,
    ) -> Self {
        self.classes.insert(
            handle,
            ObjectClass {
                handle,
                name: name.into(),
                attributes: attributes.into_iter().collect(),
            },
        );
        self
    }

    pub fn from_toml(source: &str) -> Result<Self, ObjectModelError> {
        let file: ObjectModelFile = toml::from_str(source)?;
        let mut classes = BTreeMap::new();
        for class in file.classes {
            let handle = class.handle;
            if classes.insert(handle, class).is_some() {
                return Err(ObjectModelError::DuplicateClass(handle));
            }
        }
        Ok(Self { classes })
    }

    pub fn load(path: &Path) -> Result<Self, ObjectModelError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml(&source)
    }

    pub fn class(&self, handle: ObjectClassHandle) -> Option<&ObjectClass> {
        self.classes.get(&handle)
    }

    pub fn classes(&self) -> impl Iterator<Item = &ObjectClass> {
        self.classes.values()
    }

    pub fn is_attribute_defined(&self, class: ObjectClassHandle, attribute: AttributeHandle) -> bool {
        self.classes
            .get(&class)
            .is_some_and(|c| c.attributes.contains(&attribute))
    }
}

/// Read-only queries the ownership engine needs from the object model.
pub trait ObjectModelView {
    fn is_attribute_defined(&self, class: ObjectClassHandle, attribute: AttributeHandle) -> bool;

    fn is_class_published(&self, federate: FederateHandle, class: ObjectClassHandle) -> bool;

    fn is_published(
        &self,
        federate: FederateHandle,
        class: ObjectClassHandle,
        attribute: AttributeHandle,
    ) -> bool;
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeclarationError {
    #[error("object class {0} is not defined")]
    ClassNotDefined(ObjectClassHandle),
    #[error("attribute {attribute} is not defined for object class {class}")]
    AttributeNotDefined {
        class: ObjectClassHandle,
        attribute: AttributeHandle,
    },
}

/// Object model plus the live publication and subscription declarations.
#[derive(Debug)]
pub struct ObjectModelStore {
    model: Arc<ObjectModel>,
    publications: HashMap<FederateHandle, HashMap<ObjectClassHandle, BTreeSet<AttributeHandle>>>,
    subscriptions: HashMap<ObjectClassHandle, BTreeSet<FederateHandle>>,
}

impl ObjectModelStore {
    pub fn new(model: Arc<ObjectModel>) -> Self {
        Self {
            model,
            publications: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    pub fn model(&self) -> &ObjectModel {
        &self.model
    }

    /// Replaces the set of attributes `federate` publishes for `class`.
    ///
    /// An empty attribute set unpublishes the class.
    pub fn publish(
        &mut self,
        federate: FederateHandle,
        class: ObjectClassHandle,
        attributes: BTreeSet<AttributeHandle>,
    ) -> Result<(), DeclarationError> {
        let definition = self
            .model
            .class(class)
            .ok_or(DeclarationError::ClassNotDefined(class))?;
        if let Some(attribute) = attributes
            .iter()
            .find(|a| !definition.attributes.contains(a))
        {
            return Err(DeclarationError::AttributeNotDefined {
                class,
                attribute: *attribute,
            });
        }
        let federate_publications = self.publications.entry(federate).or_default();
        if attributes.is_empty() {
            federate_publications.remove(&class);
        } else {
            federate_publications.insert(class, attributes);
        }
        Ok(())
    }

    pub fn subscribe(
        &mut self,
        federate: FederateHandle,
        class: ObjectClassHandle,
    ) -> Result<(), DeclarationError> {
        if self.model.class(class).is_none() {
            return Err(DeclarationError::ClassNotDefined(class));
        }
        self.subscriptions.entry(class).or_default().insert(federate);
        Ok(())
    }

    pub fn subscribers(&self, class: ObjectClassHandle) -> BTreeSet<FederateHandle> {
        self.subscriptions.get(&class).cloned().unwrap_or_default()
    }

    pub fn published_attributes(
        &self,
        federate: FederateHandle,
        class: ObjectClassHandle,
    ) -> BTreeSet<AttributeHandle> {
        self.publications
            .get(&federate)
            .and_then(|classes| classes.get(&class))
            .cloned()
            .unwrap_or_default()
    }

    pub fn remove_federate(&mut self, federate: FederateHandle) {
        self.publications.remove(&federate);
        for subscribers in self.subscriptions.values_mut() {
            subscribers.remove(&federate);
        }
    }
}

impl ObjectModelView for ObjectModelStore {
    fn is_attribute_defined(&self, class: ObjectClassHandle, attribute: AttributeHandle) -> bool {
        self.model.is_attribute_defined(class, attribute)
    }

    fn is_class_published(&self, federate: FederateHandle, class: ObjectClassHandle) -> bool {
        self.publications
            .get(&federate)
            .is_some_and(|classes| classes.contains_key(&class))
    }

    fn is_published(
        &self,
        federate: FederateHandle,
        class: ObjectClassHandle,
        attribute: AttributeHandle,
    ) -> bool {
        self.publications
            .get(&federate)
            .and_then(|classes| classes.get(&class))
            .is_some_and(|attributes| attributes.contains(&attribute))
    }
}

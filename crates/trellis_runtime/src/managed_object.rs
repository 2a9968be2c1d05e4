//! Managed objects - lazily sourced resources scoped to a thread or process.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use trellis_core::{CoreError, Escalation};

/// Object available to functions, unloaded when its scope completes
pub trait ManagedObject: Send {
    /// Object handed to functions
    fn object(&self) -> Arc<dyn Any + Send + Sync>;

    /// Release resources held by the object
    fn unload(&mut self) {}
}

/// Sources managed objects on first use
pub trait ManagedObjectSource: Send + Sync {
    /// Create a managed object
    ///
    /// # Errors
    ///
    /// Returns the escalation raised while sourcing.
    fn source(&self) -> Result<Box<dyn ManagedObject>, Escalation>;
}

impl<F> ManagedObjectSource for F
where
    F: Fn() -> Result<Box<dyn ManagedObject>, Escalation> + Send + Sync,
{
    fn source(&self) -> Result<Box<dyn ManagedObject>, Escalation> {
        self()
    }
}

/// Managed object wrapping a plain value with no unload behaviour
pub struct ValueObject(Arc<dyn Any + Send + Sync>);

impl ValueObject {
    /// Wrap a value
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }
}

impl ManagedObject for ValueObject {
    fn object(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.0)
    }
}

/// Lifetime of a managed object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ManagedObjectScope {
    /// One instance per thread state
    Thread,
    /// One instance per process
    Process,
}

/// Position of a managed object within its scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManagedObjectIndex {
    /// Scope of the object
    pub scope: ManagedObjectScope,
    /// Index within the scope's metadata
    pub index: usize,
}

impl ManagedObjectIndex {
    /// Thread scoped index
    #[must_use]
    pub const fn thread(index: usize) -> Self {
        Self {
            scope: ManagedObjectScope::Thread,
            index,
        }
    }

    /// Process scoped index
    #[must_use]
    pub const fn process(index: usize) -> Self {
        Self {
            scope: ManagedObjectScope::Process,
            index,
        }
    }
}

impl fmt::Display for ManagedObjectIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            ManagedObjectScope::Thread => write!(f, "thread:{}", self.index),
            ManagedObjectScope::Process => write!(f, "process:{}", self.index),
        }
    }
}

/// Configuration of a managed object
#[derive(Clone)]
pub struct ManagedObjectMetaData {
    name: String,
    source: Arc<dyn ManagedObjectSource>,
}

impl ManagedObjectMetaData {
    /// Create metadata
    pub fn new(name: impl Into<String>, source: impl ManagedObjectSource + 'static) -> Self {
        Self {
            name: name.into(),
            source: Arc::new(source),
        }
    }

    /// Name of the managed object
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ManagedObjectMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObjectMetaData")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Loaded managed object slot
pub struct ManagedObjectContainer {
    index: usize,
    managed_object: Box<dyn ManagedObject>,
    object: Arc<dyn Any + Send + Sync>,
    unloaded: bool,
}

impl ManagedObjectContainer {
    /// Source the object described by `meta`
    ///
    /// # Errors
    ///
    /// Returns the escalation raised by the source.
    pub fn load(index: usize, meta: &ManagedObjectMetaData) -> Result<Self, Escalation> {
        let managed_object = meta.source.source()?;
        let object = managed_object.object();
        Ok(Self {
            index,
            managed_object,
            object,
            unloaded: false,
        })
    }

    /// Index within its scope
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Loaded object
    #[must_use]
    pub fn object(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.object)
    }

    /// Unload the object. Returns false if already unloaded.
    pub fn unload(&mut self) -> bool {
        if self.unloaded {
            return false;
        }
        self.managed_object.unload();
        self.unloaded = true;
        true
    }
}

impl fmt::Debug for ManagedObjectContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObjectContainer")
            .field("index", &self.index)
            .field("unloaded", &self.unloaded)
            .finish_non_exhaustive()
    }
}

/// Resolves managed objects by index
pub trait ManagedObjectLookup: Send + Sync {
    /// Resolve the object at `index`, sourcing it if needed
    ///
    /// # Errors
    ///
    /// Returns the escalation raised while sourcing, or a not-found error.
    fn managed_object(
        &self,
        index: ManagedObjectIndex,
    ) -> Result<Arc<dyn Any + Send + Sync>, Escalation>;
}

/// Fixed set of objects, used as the fallback outside any thread state
#[derive(Default)]
pub struct StaticManagedObjects {
    objects: Vec<Arc<dyn Any + Send + Sync>>,
}

impl StaticManagedObjects {
    /// Empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an object at the next index
    #[must_use]
    pub fn with_object(mut self, object: Arc<dyn Any + Send + Sync>) -> Self {
        self.objects.push(object);
        self
    }
}

impl ManagedObjectLookup for StaticManagedObjects {
    fn managed_object(
        &self,
        index: ManagedObjectIndex,
    ) -> Result<Arc<dyn Any + Send + Sync>, Escalation> {
        self.objects
            .get(index.index)
            .cloned()
            .ok_or_else(|| CoreError::not_found("Managed object", index).into())
    }
}

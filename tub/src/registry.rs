use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use sturdy_common::error::RpcError;
use uuid::Uuid;

use crate::referenceable::Referenceable;

fn object_key(object: &Arc<dyn Referenceable>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

/// Validates a registered name: one or more `/`-separated descriptor path
/// segments.
fn validate_name(name: &str) -> Result<(), RpcError> {
    let valid = !name.is_empty()
        && name.split('/').all(|segment| {
            !segment.is_empty()
                && segment
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
        });
    if valid {
        Ok(())
    } else {
        Err(RpcError::Config(format!("'{name}' is not a valid object name")))
    }
}

#[derive(Default)]
struct Names {
    by_name:   HashMap<String, Arc<dyn Referenceable>>,
    by_object: HashMap<usize, String>,
}

/// Objects a tub publishes by name, resolved by the bootstrap object.
#[derive(Default)]
pub struct Registry {
    names: RwLock<Names>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `object` and returns the name it is reachable under.
    ///
    /// Registering an already published object returns its existing name.
    /// Without a name, an unguessable random one is chosen.
    pub fn register(
        &self,
        object: Arc<dyn Referenceable>,
        name: Option<&str>,
    ) -> Result<String, RpcError> {
        let mut names = self.names.write().unwrap_or_else(|e| e.into_inner());
        let key = object_key(&object);
        if let Some(existing) = names.by_object.get(&key) {
            return Ok(existing.clone());
        }

        let name = match name {
            Some(name) => {
                validate_name(name)?;
                if names.by_name.contains_key(name) {
                    return Err(RpcError::Config(format!(
                        "name '{name}' is already registered"
                    )));
                }
                name.to_string()
            }
            None => Uuid::new_v4().simple().to_string(),
        };

        names.by_name.insert(name.clone(), object);
        names.by_object.insert(key, name.clone());
        tracing::debug!(name = %name, "Registered object");
        Ok(name)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Referenceable>> {
        self.names
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_name
            .get(name)
            .cloned()
    }

    pub fn name_of(&self, object: &Arc<dyn Referenceable>) -> Option<String> {
        self.names
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_object
            .get(&object_key(object))
            .cloned()
    }

    /// Removes a name. The removed object is returned so the caller drops it
    /// after the lock is released.
    pub fn unregister_name(&self, name: &str) -> Option<Arc<dyn Referenceable>> {
        let mut names = self.names.write().unwrap_or_else(|e| e.into_inner());
        let object = names.by_name.remove(name)?;
        names.by_object.remove(&object_key(&object));
        Some(object)
    }

    pub fn unregister_object(&self, object: &Arc<dyn Referenceable>) -> Option<String> {
        let mut names = self.names.write().unwrap_or_else(|e| e.into_inner());
        let name = names.by_object.remove(&object_key(object))?;
        let removed = names.by_name.remove(&name);
        drop(names);
        drop(removed);
        Some(name)
    }

    pub fn len(&self) -> usize {
        self.names
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_name
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{referenceable::FnTarget, value::Value};

    fn object() -> Arc<dyn Referenceable> {
        Arc::new(FnTarget::new(|_, _, _| Ok(Value::None)))
    }

    #[test]
    fn test_register_is_idempotent_per_object() {
        let registry = Registry::new();
        let target = object();

        let name = registry.register(target.clone(), Some("root")).unwrap();
        assert_eq!(name, "root");
        assert_eq!(registry.register(target.clone(), None).unwrap(), "root");
        assert_eq!(registry.name_of(&target).as_deref(), Some("root"));
        assert!(registry.register(object(), Some("root")).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unnamed_objects_get_random_names() {
        let registry = Registry::new();
        let a = registry.register(object(), None).unwrap();
        let b = registry.register(object(), None).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(registry.lookup(&a).is_some());
    }

    #[test]
    fn test_unregister_by_name_and_object() {
        let registry = Registry::new();
        let a = object();
        let b = object();
        registry.register(a.clone(), Some("svc/a")).unwrap();
        registry.register(b.clone(), Some("svc/b")).unwrap();

        assert!(registry.unregister_name("svc/a").is_some());
        assert!(registry.lookup("svc/a").is_none());
        assert!(registry.name_of(&a).is_none());

        assert_eq!(registry.unregister_object(&b).as_deref(), Some("svc/b"));
        assert!(registry.unregister_object(&b).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_rejects_invalid_names() {
        let registry = Registry::new();
        for bad in ["", "a//b", "/a", "sp ace", "pct%20"] {
            assert!(registry.register(object(), Some(bad)).is_err(), "{bad}");
        }
    }
}

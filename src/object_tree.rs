//! Hosted-object dispatch.
//!
//! The connection engine only consumes this through [`ObjectTree::lookup`]; everything
//! about how an interface actually answers a call is the hosted object's own business.

use std::collections::HashMap;

use crate::value::Value;

/// A single D-Bus interface hosted at some object path.
pub trait Interface {
    /// The interface name this object answers to, e.g. `com.example.Greeter`.
    fn interface_name(&self) -> &str;

    /// Handle a method call. `Err` carries the D-Bus error name and body to send back.
    fn handle_call(&self, member: &str, args: &[Value]) -> Result<Vec<Value>, (String, Vec<Value>)>;
}

#[derive(Default)]
pub struct ObjectTree {
    objects: HashMap<String, Box<dyn Interface>>,
}

impl ObjectTree {
    pub fn new() -> Self {
        ObjectTree {
            objects: HashMap::new(),
        }
    }

    /// Register an interface at `path`. Returns `false` if `path` is already hosted.
    pub fn register(&mut self, path: impl Into<String>, interface: Box<dyn Interface>) -> bool {
        let path = path.into();
        if self.objects.contains_key(&path) {
            return false;
        }
        self.objects.insert(path, interface);
        true
    }

    /// Remove whatever is hosted at `path`, if anything.
    pub fn unregister(&mut self, path: &str) -> bool {
        self.objects.remove(path).is_some()
    }

    pub fn lookup(&self, path: &str) -> Option<&dyn Interface> {
        self.objects.get(path).map(|b| b.as_ref())
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Interface for Echo {
        fn interface_name(&self) -> &str {
            "com.example.Echo"
        }

        fn handle_call(&self, member: &str, args: &[Value]) -> Result<Vec<Value>, (String, Vec<Value>)> {
            match member {
                "Echo" => Ok(args.to_vec()),
                _ => Err(("org.freedesktop.DBus.Error.UnknownMethod".into(), vec![])),
            }
        }
    }

    #[test]
    fn register_then_lookup_finds_object() {
        let mut tree = ObjectTree::new();
        assert!(tree.register("/echo", Box::new(Echo)));
        let obj = tree.lookup("/echo").unwrap();
        assert_eq!(obj.interface_name(), "com.example.Echo");
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut tree = ObjectTree::new();
        assert!(tree.register("/echo", Box::new(Echo)));
        assert!(!tree.register("/echo", Box::new(Echo)));
    }

    #[test]
    fn lookup_on_unknown_path_is_none() {
        let tree = ObjectTree::new();
        assert!(tree.lookup("/nope").is_none());
    }

    #[test]
    fn unregister_removes_object() {
        let mut tree = ObjectTree::new();
        tree.register("/echo", Box::new(Echo));
        assert!(tree.unregister("/echo"));
        assert!(tree.lookup("/echo").is_none());
    }
}

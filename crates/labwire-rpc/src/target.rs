//! Exposed targets and their registry.

use crate::error::{CallError, Error, Result};
use crate::protocol::{CallArgs, TargetDescription};
use async_trait::async_trait;
use labwire_codec::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// An object whose methods can be called remotely.
///
/// Calls from different connections run concurrently on the same target;
/// implementations provide their own locking where state is shared.
#[async_trait]
pub trait Target: Send + Sync + 'static {
    /// Methods offered by the target.
    fn description(&self) -> TargetDescription;

    /// Invoke `method`.
    ///
    /// # Errors
    ///
    /// Returns a [`CallError`] that is reported to the caller.
    async fn invoke(&self, method: &str, args: CallArgs) -> std::result::Result<Value, CallError>;
}

type BoxFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, CallError>> + Send>>;
type Handler = Arc<dyn Fn(CallArgs) -> BoxFuture + Send + Sync>;

struct Method {
    signature: String,
    doc: Option<String>,
    fire_and_forget: bool,
    handler: Handler,
}

/// A [`Target`] assembled from explicitly registered closures.
///
/// # Example
///
/// ```
/// use labwire_rpc::{CallError, MethodTable};
///
/// let calc = MethodTable::new()
///     .doc("Integer calculator")
///     .sync_method("add", "(a, b)", "Add two integers.", |args| {
///         let a: i64 = args.get(0, "a")?;
///         let b: i64 = args.get(1, "b")?;
///         a.checked_add(b)
///             .map(Into::into)
///             .ok_or_else(|| CallError::new("OverflowError", "sum out of range"))
///     });
/// ```
#[derive(Default)]
pub struct MethodTable {
    docstring: Option<String>,
    methods: BTreeMap<String, Method>,
}

impl MethodTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target documentation.
    #[must_use]
    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.docstring = Some(doc.into());
        self
    }

    fn insert(mut self, name: &str, signature: &str, doc: &str, fire_and_forget: bool, handler: Handler) -> Self {
        let doc = (!doc.is_empty()).then(|| doc.to_string());
        self.methods.insert(
            name.to_string(),
            Method {
                signature: signature.to_string(),
                doc,
                fire_and_forget,
                handler,
            },
        );
        self
    }

    /// Register an async method.
    #[must_use]
    pub fn method<F, Fut>(self, name: &str, signature: &str, doc: &str, f: F) -> Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, CallError>> + Send + 'static,
    {
        self.insert(name, signature, doc, false, Arc::new(move |args| -> BoxFuture { Box::pin(f(args)) }))
    }

    /// Register a synchronous method.
    #[must_use]
    pub fn sync_method<F>(self, name: &str, signature: &str, doc: &str, f: F) -> Self
    where
        F: Fn(CallArgs) -> std::result::Result<Value, CallError> + Send + Sync + 'static,
    {
        self.insert(
            name,
            signature,
            doc,
            false,
            Arc::new(move |args| -> BoxFuture {
                let result = f(args);
                Box::pin(async move { result })
            }),
        )
    }

    /// Register a fire-and-forget method; callers do not wait for it.
    #[must_use]
    pub fn fire_and_forget<F, Fut>(self, name: &str, signature: &str, doc: &str, f: F) -> Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, CallError>> + Send + 'static,
    {
        self.insert(name, signature, doc, true, Arc::new(move |args| -> BoxFuture { Box::pin(f(args)) }))
    }
}

#[async_trait]
impl Target for MethodTable {
    fn description(&self) -> TargetDescription {
        TargetDescription {
            docstring: self.docstring.clone(),
            methods: self
                .methods
                .iter()
                .map(|(name, m)| (name.clone(), (m.signature.clone(), m.doc.clone())))
                .collect(),
            fire_and_forget: self
                .methods
                .iter()
                .filter(|(_, m)| m.fire_and_forget)
                .map(|(name, _)| name.clone())
                .collect(),
        }
    }

    async fn invoke(&self, method: &str, args: CallArgs) -> std::result::Result<Value, CallError> {
        let handler = self
            .methods
            .get(method)
            .map(|m| Arc::clone(&m.handler))
            .ok_or_else(|| CallError::new(CallError::UNKNOWN_METHOD, method))?;
        handler(args).await
    }
}

type Factory = Arc<dyn Fn() -> Arc<dyn Target> + Send + Sync>;

#[derive(Clone)]
enum Entry {
    Shared(Arc<dyn Target>),
    PerConnection(Factory),
}

/// Named targets served by one server.
///
/// Names are unique, non-empty and free of whitespace. The registry is
/// frozen once the server is bound.
#[derive(Clone, Default)]
pub struct TargetRegistry {
    entries: BTreeMap<String, Entry>,
}

impl TargetRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.chars().any(char::is_whitespace) || self.entries.contains_key(name) {
            return Err(Error::InvalidTargetName(name.to_string()));
        }
        Ok(())
    }

    /// Register a target shared by all connections.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTargetName`] for an invalid or duplicate name.
    pub fn insert(&mut self, name: &str, target: impl Target) -> Result<()> {
        self.insert_shared(name, Arc::new(target))
    }

    /// Register an already shared target.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTargetName`] for an invalid or duplicate name.
    pub fn insert_shared(&mut self, name: &str, target: Arc<dyn Target>) -> Result<()> {
        self.check_name(name)?;
        self.entries.insert(name.to_string(), Entry::Shared(target));
        Ok(())
    }

    /// Register a factory building a fresh target for every connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTargetName`] for an invalid or duplicate name.
    pub fn insert_factory<F, T>(&mut self, name: &str, factory: F) -> Result<()>
    where
        F: Fn() -> T + Send + Sync + 'static,
        T: Target,
    {
        self.check_name(name)?;
        self.entries.insert(
            name.to_string(),
            Entry::PerConnection(Arc::new(move || Arc::new(factory()) as Arc<dyn Target>)),
        );
        Ok(())
    }

    /// Builder form of [`TargetRegistry::insert`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTargetName`] for an invalid or duplicate name.
    pub fn with(mut self, name: &str, target: impl Target) -> Result<Self> {
        self.insert(name, target)?;
        Ok(self)
    }

    /// Sorted target names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Number of targets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Target for a new connection, building one if the entry is a factory.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Target>> {
        match self.entries.get(name)? {
            Entry::Shared(target) => Some(Arc::clone(target)),
            Entry::PerConnection(factory) => Some(factory()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn calc() -> MethodTable {
        MethodTable::new()
            .doc("Calculator")
            .sync_method("add", "(a, b)", "Add.", |args| {
                Ok(Value::from(args.get::<i64>(0, "a")? + args.get::<i64>(1, "b")?))
            })
            .fire_and_forget("log", "(msg)", "", |_| async { Ok(Value::None) })
    }

    #[tokio::test]
    async fn method_table_dispatch() {
        let t = calc();
        let d = t.description();
        assert_eq!(d.docstring.as_deref(), Some("Calculator"));
        assert_eq!(d.methods["add"], ("(a, b)".to_string(), Some("Add.".to_string())));
        assert_eq!(d.methods["log"].1, None);
        assert!(d.is_fire_and_forget("log"));
        assert!(!d.is_fire_and_forget("add"));

        let five = t
            .invoke("add", CallArgs::positional(vec![2.into(), 3.into()]))
            .await
            .unwrap();
        assert_eq!(five, Value::Int(5));

        let err = t.invoke("mul", CallArgs::default()).await.unwrap_err();
        assert_eq!(err.kind, CallError::UNKNOWN_METHOD);
    }

    #[test]
    fn registry_names() {
        let mut registry = TargetRegistry::new();
        registry.insert("zeta", calc()).unwrap();
        registry.insert("alpha", calc()).unwrap();
        assert_eq!(registry.names(), vec!["alpha", "zeta"]);

        for bad in ["", "two words", "tab\there", "alpha"] {
            assert!(matches!(registry.insert(bad, calc()), Err(Error::InvalidTargetName(_))));
        }
    }

    #[test]
    fn factory_builds_per_connection() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let mut registry = TargetRegistry::new();
        registry
            .insert_factory("session", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                calc()
            })
            .unwrap();

        assert!(registry.resolve("session").is_some());
        assert!(registry.resolve("session").is_some());
        assert!(registry.resolve("missing").is_none());
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }
}

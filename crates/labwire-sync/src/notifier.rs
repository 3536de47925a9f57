//! The mutation gateway of a published structure.

use crate::error::ModError;
use crate::mods::{apply_mod, lookup, Mod};
use labwire_codec::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Mods queued for each consumer before it is detached.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

struct State {
    root: Value,
    consumers: Vec<mpsc::Sender<Arc<Mod>>>,
}

/// Owns a structure and turns every change to it into a [`Mod`].
///
/// Clones share the same structure. Mutations go through [`Notifier::at`]
/// cursors; each one is applied under a lock and then queued for every
/// attached consumer, so consumers see mods in exactly the order they were
/// applied. A consumer that falls [`DEFAULT_QUEUE_CAPACITY`] mods behind is
/// detached instead of slowing down the caller.
///
/// ```
/// use labwire_codec::Value;
/// use labwire_sync::Notifier;
///
/// let n = Notifier::new(Value::List(vec![]));
/// n.root().append(Value::List(vec![])).unwrap();
/// n.at([0]).append(42).unwrap();
/// assert_eq!(n.raw_view(), Value::from(vec![vec![42]]));
/// ```
#[derive(Clone)]
pub struct Notifier {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Notifier")
            .field("root", &state.root)
            .field("consumers", &state.consumers.len())
            .finish()
    }
}

impl Notifier {
    /// Wrap `root`.
    #[must_use]
    pub fn new(root: impl Into<Value>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                root: root.into(),
                consumers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A copy of the current structure.
    #[must_use]
    pub fn raw_view(&self) -> Value {
        self.lock().root.clone()
    }

    /// Run `f` on the structure without copying it.
    ///
    /// Mutating the notifier from `f` deadlocks.
    pub fn read<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        f(&self.lock().root)
    }

    /// Cursor on the root.
    #[must_use]
    pub fn root(&self) -> Cursor<'_> {
        Cursor {
            notifier: self,
            path: Vec::new(),
        }
    }

    /// Cursor on the container at `path`.
    #[must_use]
    pub fn at<K: Into<Value>>(&self, path: impl IntoIterator<Item = K>) -> Cursor<'_> {
        Cursor {
            notifier: self,
            path: path.into_iter().map(Into::into).collect(),
        }
    }

    /// Replace the whole structure.
    pub fn replace(&self, root: impl Into<Value>) {
        // Init applies to any structure.
        let _ = self.mutate(Mod::Init(root.into()));
    }

    /// Bring a mapping root in line with `source`.
    ///
    /// See [`Cursor::update_from_map`].
    ///
    /// # Errors
    ///
    /// Returns [`ModError::WrongContainer`] if the root is not a mapping.
    pub fn update_from_map(&self, source: &BTreeMap<Value, Value>) -> Result<(), ModError> {
        self.root().update_from_map(source)
    }

    /// Take a snapshot and register a queue that receives every later mod.
    ///
    /// The receiver ends if the consumer falls `capacity` mods behind.
    #[must_use]
    pub fn attach(&self, capacity: usize) -> (Value, mpsc::Receiver<Arc<Mod>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut state = self.lock();
        state.consumers.push(tx);
        (state.root.clone(), rx)
    }

    /// Number of attached consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        let mut state = self.lock();
        state.consumers.retain(|tx| !tx.is_closed());
        state.consumers.len()
    }

    fn mutate(&self, m: Mod) -> Result<Option<Value>, ModError> {
        let mut state = self.lock();
        let removed = apply_mod(&mut state.root, &m)?;
        if state.consumers.is_empty() {
            return Ok(removed);
        }
        let m = Arc::new(m);
        state.consumers.retain(|tx| match tx.try_send(Arc::clone(&m)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(action = m.action(), "Consumer queue full, detaching consumer");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
        Ok(removed)
    }
}

/// A position inside a [`Notifier`]'s structure.
///
/// Every method applies one [`Mod`] to the container at the cursor's path.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    notifier: &'a Notifier,
    path: Vec<Value>,
}

impl Cursor<'_> {
    /// Descend into `key`.
    #[must_use]
    pub fn at(mut self, key: impl Into<Value>) -> Self {
        self.path.push(key.into());
        self
    }

    /// Path from the root.
    #[must_use]
    pub fn path(&self) -> &[Value] {
        &self.path
    }

    /// Copy of the value at this path, if it exists.
    #[must_use]
    pub fn get(&self) -> Option<Value> {
        self.notifier.read(|root| lookup(root, &self.path).cloned())
    }

    /// Append to a list.
    ///
    /// # Errors
    ///
    /// Returns a [`ModError`] if the path does not lead to a list.
    pub fn append(&self, x: impl Into<Value>) -> Result<(), ModError> {
        self.notifier
            .mutate(Mod::Append {
                path: self.path.clone(),
                x: x.into(),
            })
            .map(drop)
    }

    /// Insert into a list before index `i`.
    ///
    /// # Errors
    ///
    /// Returns a [`ModError`] if the path does not lead to a list.
    pub fn insert(&self, i: i64, x: impl Into<Value>) -> Result<(), ModError> {
        self.notifier
            .mutate(Mod::Insert {
                path: self.path.clone(),
                i,
                x: x.into(),
            })
            .map(drop)
    }

    /// Remove and return the element at index `i` of a list.
    ///
    /// # Errors
    ///
    /// Returns a [`ModError`] if the path does not lead to a list or `i` is
    /// out of range.
    pub fn pop(&self, i: i64) -> Result<Value, ModError> {
        self.notifier
            .mutate(Mod::Pop {
                path: self.path.clone(),
                i,
            })
            .map(Option::unwrap_or_default)
    }

    /// Set a mapping key or list index.
    ///
    /// # Errors
    ///
    /// Returns a [`ModError`] if the path does not lead to a mapping or a
    /// list, or a list index is out of range.
    pub fn set(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<(), ModError> {
        self.notifier
            .mutate(Mod::SetItem {
                path: self.path.clone(),
                key: key.into(),
                value: value.into(),
            })
            .map(drop)
    }

    /// Delete a mapping key or list index.
    ///
    /// # Errors
    ///
    /// Returns a [`ModError`] if the key or index does not exist.
    pub fn delete(&self, key: impl Into<Value>) -> Result<(), ModError> {
        self.notifier
            .mutate(Mod::DelItem {
                path: self.path.clone(),
                key: key.into(),
            })
            .map(drop)
    }

    /// Remove the first element equal to `x` from a list, or `x` from a set.
    ///
    /// # Errors
    ///
    /// Returns [`ModError::ValueNotFound`] if there is no such element.
    pub fn remove(&self, x: impl Into<Value>) -> Result<(), ModError> {
        self.notifier
            .mutate(Mod::Remove {
                path: self.path.clone(),
                x: x.into(),
            })
            .map(drop)
    }

    /// Empty a list, mapping or set.
    ///
    /// # Errors
    ///
    /// Returns a [`ModError`] if the path does not lead to one.
    pub fn clear(&self) -> Result<(), ModError> {
        self.notifier
            .mutate(Mod::Clear {
                path: self.path.clone(),
            })
            .map(drop)
    }

    /// Bring the mapping at this path in line with `source`.
    ///
    /// Only keys that disappeared are deleted and only changed or new keys
    /// are set. Nested containers are compared whole, not diffed.
    ///
    /// # Errors
    ///
    /// Returns [`ModError::WrongContainer`] if the path does not lead to an
    /// unordered mapping.
    pub fn update_from_map(&self, source: &BTreeMap<Value, Value>) -> Result<(), ModError> {
        let current = match self.get() {
            Some(Value::Dict(map)) => map,
            Some(other) => {
                return Err(ModError::WrongContainer {
                    action: "update",
                    found: other.type_name(),
                })
            }
            None => return Err(ModError::KeyNotFound(self.path.last().cloned().unwrap_or_default())),
        };
        for key in current.keys().filter(|k| !source.contains_key(*k)) {
            self.delete(key.clone())?;
        }
        for (key, value) in source {
            if current.get(key) != Some(value) {
                self.set(key.clone(), value.clone())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutations_reach_consumers_in_order() {
        let n = Notifier::new(Value::map([("counts", Value::List(vec![]))]));
        let (snapshot, mut rx) = n.attach(16);
        assert_eq!(snapshot, n.raw_view());

        let counts = n.at(["counts"]);
        counts.append(1).unwrap();
        counts.insert(0, 0).unwrap();
        assert_eq!(counts.pop(-1).unwrap(), Value::Int(1));
        n.root().set("done", true).unwrap();

        let actions: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|m| m.action())
            .collect();
        assert_eq!(actions, ["append", "insert", "pop", "setitem"]);
        assert_eq!(n.at(["counts"]).get(), Some(Value::from(vec![0])));
    }

    #[test]
    fn failed_mutation_is_not_published() {
        let n = Notifier::new(Value::List(vec![]));
        let (_, mut rx) = n.attach(4);
        assert!(n.root().pop(0).is_err());
        assert!(n.root().delete("x").is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn replicas_follow_the_master() {
        let n = Notifier::new(Value::map([("a", 1)]));
        let (mut replica, mut rx) = n.attach(16);

        n.root().set("b", Value::List(vec![])).unwrap();
        n.at(["b"]).append("x").unwrap();
        n.at(["b"]).append("y").unwrap();
        n.at(["b"]).remove("x").unwrap();
        n.root().delete("a").unwrap();
        n.replace(Value::map([("fresh", true)]));
        n.root().set("k", 2).unwrap();

        while let Ok(m) = rx.try_recv() {
            apply_mod(&mut replica, &m).unwrap();
        }
        assert_eq!(replica, n.raw_view());
    }

    #[test]
    fn slow_consumer_is_detached() {
        let n = Notifier::new(Value::List(vec![]));
        let (_, mut slow) = n.attach(2);
        let (_, mut fast) = n.attach(8);
        for i in 0..4 {
            n.root().append(i).unwrap();
        }
        assert_eq!(n.consumer_count(), 1);

        // The slow queue keeps what it had, then ends.
        assert!(slow.try_recv().is_ok());
        assert!(slow.try_recv().is_ok());
        assert!(matches!(slow.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
        assert_eq!(std::iter::from_fn(|| fast.try_recv().ok()).count(), 4);
    }

    #[test]
    fn update_from_map_emits_only_differences() {
        let n = Notifier::new(Value::map([("keep", 1), ("change", 2), ("drop", 3)]));
        let (_, mut rx) = n.attach(16);

        let source: BTreeMap<Value, Value> = [("keep", 1), ("change", 20), ("new", 4)]
            .into_iter()
            .map(|(k, v)| (Value::from(k), Value::from(v)))
            .collect();
        n.update_from_map(&source).unwrap();

        let mods: Vec<Arc<Mod>> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(mods.len(), 3);
        assert_eq!(n.raw_view(), Value::Dict(source));

        let list = Notifier::new(Value::List(vec![]));
        assert!(matches!(
            list.update_from_map(&BTreeMap::new()),
            Err(ModError::WrongContainer { found: "list", .. })
        ));
    }
}

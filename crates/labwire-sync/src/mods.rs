//! Mutation records and how they apply to a structure.
//!
//! A [`Mod`] names a container by its path from the root and one action on
//! it. The same [`apply_mod`] runs on the master, through the
//! [`crate::Notifier`], and on every replica, so both sides agree on what a
//! path and an action mean.
//!
//! Paths index lists and tuples by integer (negative counts from the end) and
//! mappings by key. Actions follow the usual sequence, mapping and set rules:
//! `insert` clamps its index, while `pop`, `setitem` and `delitem` on a list
//! require an index in range.

use crate::error::ModError;
use labwire_codec::Value;

/// One mutation of a replicated structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mod {
    /// Replace the whole structure
    Init(Value),
    /// Append `x` to a list
    Append {
        /// Container path
        path: Vec<Value>,
        /// Appended element
        x: Value,
    },
    /// Insert `x` before index `i` of a list
    Insert {
        /// Container path
        path: Vec<Value>,
        /// Position, clamped to the list
        i: i64,
        /// Inserted element
        x: Value,
    },
    /// Remove the element at index `i` of a list
    Pop {
        /// Container path
        path: Vec<Value>,
        /// Position
        i: i64,
    },
    /// Set `key` of a mapping, or an index of a list
    SetItem {
        /// Container path
        path: Vec<Value>,
        /// Key or index
        key: Value,
        /// New value
        value: Value,
    },
    /// Delete `key` of a mapping, or an index of a list
    DelItem {
        /// Container path
        path: Vec<Value>,
        /// Key or index
        key: Value,
    },
    /// Remove the first element equal to `x` from a list, or `x` from a set
    Remove {
        /// Container path
        path: Vec<Value>,
        /// Removed element
        x: Value,
    },
    /// Empty a list, mapping or set
    Clear {
        /// Container path
        path: Vec<Value>,
    },
}

impl Mod {
    /// Wire name of the action.
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Append { .. } => "append",
            Self::Insert { .. } => "insert",
            Self::Pop { .. } => "pop",
            Self::SetItem { .. } => "setitem",
            Self::DelItem { .. } => "delitem",
            Self::Remove { .. } => "remove",
            Self::Clear { .. } => "clear",
        }
    }

    /// Path of the mutated container; empty for `init`.
    #[must_use]
    pub fn path(&self) -> &[Value] {
        match self {
            Self::Init(_) => &[],
            Self::Append { path, .. }
            | Self::Insert { path, .. }
            | Self::Pop { path, .. }
            | Self::SetItem { path, .. }
            | Self::DelItem { path, .. }
            | Self::Remove { path, .. }
            | Self::Clear { path } => path,
        }
    }

    /// Wire form: a mapping with `action`, `path` and the action's fields.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut fields: Vec<(&str, Value)> = vec![("action", Value::from(self.action()))];
        if !matches!(self, Self::Init(_)) {
            fields.push(("path", Value::List(self.path().to_vec())));
        }
        match self {
            Self::Init(value) => fields.push(("struct", value.clone())),
            Self::Append { x, .. } | Self::Remove { x, .. } => fields.push(("x", x.clone())),
            Self::Insert { i, x, .. } => {
                fields.push(("i", Value::Int(*i)));
                fields.push(("x", x.clone()));
            }
            Self::Pop { i, .. } => fields.push(("i", Value::Int(*i))),
            Self::SetItem { key, value, .. } => {
                fields.push(("key", key.clone()));
                fields.push(("value", value.clone()));
            }
            Self::DelItem { key, .. } => fields.push(("key", key.clone())),
            Self::Clear { .. } => {}
        }
        Value::map(fields)
    }

    /// Parse the wire form.
    ///
    /// # Errors
    ///
    /// Returns [`ModError::Malformed`] for an unknown action or a missing field.
    pub fn from_value(value: &Value) -> Result<Self, ModError> {
        let field = |name: &str| {
            value
                .get_str(name)
                .cloned()
                .ok_or_else(|| ModError::Malformed(format!("missing field `{name}`")))
        };
        let index = |name: &str| {
            field(name)?
                .as_int()
                .ok_or_else(|| ModError::Malformed(format!("field `{name}` must be an integer")))
        };
        let action = value
            .get_str("action")
            .and_then(Value::as_str)
            .ok_or_else(|| ModError::Malformed("missing action".to_string()))?;
        if action == "init" {
            return Ok(Self::Init(field("struct")?));
        }
        let path = field("path")?
            .as_seq()
            .map(<[Value]>::to_vec)
            .ok_or_else(|| ModError::Malformed("path must be a list".to_string()))?;
        Ok(match action {
            "append" => Self::Append { path, x: field("x")? },
            "insert" => Self::Insert {
                path,
                i: index("i")?,
                x: field("x")?,
            },
            "pop" => Self::Pop { path, i: index("i")? },
            "setitem" => Self::SetItem {
                path,
                key: field("key")?,
                value: field("value")?,
            },
            "delitem" => Self::DelItem { path, key: field("key")? },
            "remove" => Self::Remove { path, x: field("x")? },
            "clear" => Self::Clear { path },
            other => return Err(ModError::Malformed(format!("unknown action `{other}`"))),
        })
    }
}

/// Apply `m` to `root`.
///
/// Returns the element removed by `pop` and `delitem`.
///
/// # Errors
///
/// Returns a [`ModError`] if the path does not exist or the action does not
/// fit the container; `root` is unchanged in that case.
pub fn apply_mod(root: &mut Value, m: &Mod) -> Result<Option<Value>, ModError> {
    if let Mod::Init(value) = m {
        *root = value.clone();
        return Ok(None);
    }
    let target = navigate(root, m.path())?;
    let found = target.type_name();
    let wrong = || ModError::WrongContainer {
        action: m.action(),
        found,
    };

    match (m, target) {
        (Mod::Append { x, .. }, Value::List(items)) => items.push(x.clone()),
        (Mod::Insert { i, x, .. }, Value::List(items)) => {
            let at = clamp(*i, items.len());
            items.insert(at, x.clone());
        }
        (Mod::Pop { i, .. }, Value::List(items)) => {
            let at = position(&Value::Int(*i), items.len())?;
            return Ok(Some(items.remove(at)));
        }
        (Mod::SetItem { key, value, .. }, Value::List(items)) => {
            let at = position(key, items.len())?;
            items[at] = value.clone();
        }
        (Mod::SetItem { key, value, .. }, Value::Dict(map)) => {
            map.insert(key.clone(), value.clone());
        }
        (Mod::SetItem { key, value, .. }, Value::OrderedDict(entries)) => {
            match entries.iter_mut().find(|(k, _)| k == key) {
                Some((_, slot)) => *slot = value.clone(),
                None => entries.push((key.clone(), value.clone())),
            }
        }
        (Mod::DelItem { key, .. }, Value::List(items)) => {
            let at = position(key, items.len())?;
            return Ok(Some(items.remove(at)));
        }
        (Mod::DelItem { key, .. }, Value::Dict(map)) => {
            return map
                .remove(key)
                .map(Some)
                .ok_or_else(|| ModError::KeyNotFound(key.clone()));
        }
        (Mod::DelItem { key, .. }, Value::OrderedDict(entries)) => {
            let at = entries
                .iter()
                .position(|(k, _)| k == key)
                .ok_or_else(|| ModError::KeyNotFound(key.clone()))?;
            return Ok(Some(entries.remove(at).1));
        }
        (Mod::Remove { x, .. }, Value::List(items)) => {
            let at = items
                .iter()
                .position(|item| item == x)
                .ok_or_else(|| ModError::ValueNotFound(x.clone()))?;
            items.remove(at);
        }
        (Mod::Remove { x, .. }, Value::Set(set)) => {
            if !set.remove(x) {
                return Err(ModError::ValueNotFound(x.clone()));
            }
        }
        (Mod::Clear { .. }, Value::List(items)) => items.clear(),
        (Mod::Clear { .. }, Value::Dict(map)) => map.clear(),
        (Mod::Clear { .. }, Value::OrderedDict(entries)) => entries.clear(),
        (Mod::Clear { .. }, Value::Set(set)) => set.clear(),
        _ => return Err(wrong()),
    }
    Ok(None)
}

/// The value at `path`, if it exists.
#[must_use]
pub fn lookup<'a>(root: &'a Value, path: &[Value]) -> Option<&'a Value> {
    path.iter().try_fold(root, |current, key| match current {
        Value::List(items) | Value::Tuple(items) => position(key, items.len()).ok().map(|i| &items[i]),
        mapping => mapping.get(key),
    })
}

fn navigate<'a>(mut current: &'a mut Value, path: &[Value]) -> Result<&'a mut Value, ModError> {
    for key in path {
        current = match current {
            Value::List(items) | Value::Tuple(items) => {
                let at = position(key, items.len())?;
                &mut items[at]
            }
            Value::Dict(map) => map
                .get_mut(key)
                .ok_or_else(|| ModError::KeyNotFound(key.clone()))?,
            Value::OrderedDict(entries) => entries
                .iter_mut()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v)
                .ok_or_else(|| ModError::KeyNotFound(key.clone()))?,
            other => {
                return Err(ModError::WrongContainer {
                    action: "index",
                    found: other.type_name(),
                })
            }
        };
    }
    Ok(current)
}

fn signed_len(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

/// Resolve a possibly negative index into `0..len`.
fn position(key: &Value, len: usize) -> Result<usize, ModError> {
    let Value::Int(index) = key else {
        return Err(ModError::InvalidIndex(key.type_name()));
    };
    let resolved = if *index < 0 { index + signed_len(len) } else { *index };
    usize::try_from(resolved)
        .ok()
        .filter(|&i| i < len)
        .ok_or(ModError::IndexOutOfRange { index: *index, len })
}

fn clamp(index: i64, len: usize) -> usize {
    let resolved = if index < 0 {
        (index + signed_len(len)).max(0)
    } else {
        index.min(signed_len(len))
    };
    usize::try_from(resolved).unwrap_or(len)
}

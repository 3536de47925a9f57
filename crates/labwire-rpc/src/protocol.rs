//! RPC message shapes.
//!
//! # Wire Format
//!
//! ```text
//! client: RPC1                                   (or RPCI for inspection)
//! server: {"targets":[...],"description":...}
//! client: "calc"
//! server: {"status":"ok","ret":{"docstring":...,"methods":{...},"fire_and_forget":...}}
//! client: {"action":"call","name":"add","args":...,"kwargs":{}}
//! server: {"status":"ok","ret":5}
//! ```

use crate::error::{CallError, Error, RemoteError, Result};
use labwire_codec::{FromValue, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Magic sent by programmatic clients.
pub const MAGIC_RPC: [u8; 4] = *b"RPC1";

/// Magic sent by inspection clients; the server identifies itself and closes.
pub const MAGIC_INSPECT: [u8; 4] = *b"RPCI";

/// Server identification sent right after the magic.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identification {
    /// Target names, sorted
    pub targets: Vec<String>,
    /// Free-form server description
    pub description: Option<String>,
}

impl Identification {
    /// Wire form.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::map([
            ("targets", Value::from(self.targets.clone())),
            ("description", Value::from(self.description.clone())),
        ])
    }

    /// Parse the wire form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandshakeMismatch`] if the value is not an identification.
    pub fn from_value(value: &Value) -> Result<Self> {
        let mismatch = || Error::HandshakeMismatch("unexpected server identification".to_string());
        let targets = value
            .get_str("targets")
            .ok_or_else(mismatch)?
            .extract::<Vec<String>>()
            .map_err(|_| mismatch())?;
        let description = match value.get_str("description") {
            None => None,
            Some(d) => d.extract::<Option<String>>().map_err(|_| mismatch())?,
        };
        Ok(Self {
            targets,
            description,
        })
    }
}

/// How a client picks its target.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TargetSelector {
    /// The only target of the server
    #[default]
    Auto,
    /// A target by name
    Named(String),
    /// No target yet; select one later
    None,
}

impl From<&str> for TargetSelector {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<String> for TargetSelector {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

impl TargetSelector {
    /// Resolve against the server's target list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTarget`] for a name the server does not offer
    /// (or `Auto` on a server without targets) and
    /// [`Error::AmbiguousTarget`] for `Auto` on a server with several.
    pub fn resolve(&self, targets: &[String]) -> Result<Option<String>> {
        match self {
            Self::None => Ok(None),
            Self::Named(name) if targets.contains(name) => Ok(Some(name.clone())),
            Self::Named(name) => Err(Error::UnknownTarget(name.clone())),
            Self::Auto => match targets {
                [only] => Ok(Some(only.clone())),
                [] => Err(Error::UnknownTarget("server exposes no targets".to_string())),
                _ => Err(Error::AmbiguousTarget(targets.to_vec())),
            },
        }
    }
}

/// Positional and keyword arguments of a call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallArgs {
    /// Positional arguments
    pub args: Vec<Value>,
    /// Keyword arguments
    pub kwargs: BTreeMap<String, Value>,
}

impl CallArgs {
    /// Positional arguments only.
    #[must_use]
    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: BTreeMap::new(),
        }
    }

    /// Add a keyword argument.
    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Argument at `index`, or keyword `name`, converted to `T`.
    ///
    /// # Errors
    ///
    /// Returns a `TypeError` if the argument is missing or has another type.
    pub fn get<T: FromValue>(&self, index: usize, name: &str) -> std::result::Result<T, CallError> {
        self.lookup(index, name)
            .ok_or_else(|| CallError::type_error(format!("missing required argument `{name}`")))?
            .extract()
            .map_err(|e| CallError::type_error(format!("argument `{name}`: {e}")))
    }

    /// Like [`CallArgs::get`], but a missing argument is `None`.
    ///
    /// # Errors
    ///
    /// Returns a `TypeError` if the argument has another type.
    pub fn get_opt<T: FromValue>(&self, index: usize, name: &str) -> std::result::Result<Option<T>, CallError> {
        self.lookup(index, name)
            .map(|v| {
                v.extract()
                    .map_err(|e| CallError::type_error(format!("argument `{name}`: {e}")))
            })
            .transpose()
    }

    fn lookup(&self, index: usize, name: &str) -> Option<&Value> {
        self.args.get(index).or_else(|| self.kwargs.get(name))
    }

    fn to_values(&self) -> (Value, Value) {
        let kwargs = self
            .kwargs
            .iter()
            .map(|(k, v)| (Value::from(k.as_str()), v.clone()))
            .collect();
        (Value::Tuple(self.args.clone()), Value::Dict(kwargs))
    }

    fn from_values(args: Option<&Value>, kwargs: Option<&Value>) -> std::result::Result<Self, CallError> {
        let args = match args {
            None | Some(Value::None) => Vec::new(),
            Some(v) => v
                .as_seq()
                .ok_or_else(|| CallError::type_error("positional arguments must be a sequence"))?
                .to_vec(),
        };
        let mut keyword = BTreeMap::new();
        match kwargs {
            None | Some(Value::None) => {}
            Some(v) => {
                let map = v
                    .as_dict()
                    .ok_or_else(|| CallError::type_error("keyword arguments must be a mapping"))?;
                for (k, v) in map {
                    let k = k
                        .as_str()
                        .ok_or_else(|| CallError::type_error("keyword names must be strings"))?;
                    keyword.insert(k.to_string(), v.clone());
                }
            }
        }
        Ok(Self {
            args,
            kwargs: keyword,
        })
    }
}

/// What a target exposes, as returned by target selection and `get_rpc_method_list`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TargetDescription {
    /// Documentation of the target itself
    pub docstring: Option<String>,
    /// Method name to `(signature, docstring)`
    pub methods: BTreeMap<String, (String, Option<String>)>,
    /// Methods invoked without waiting for a reply
    pub fire_and_forget: BTreeSet<String>,
}

impl TargetDescription {
    /// Whether `name` is a method of the target.
    #[must_use]
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Whether calls to `name` get no reply.
    #[must_use]
    pub fn is_fire_and_forget(&self, name: &str) -> bool {
        self.fire_and_forget.contains(name)
    }

    /// Wire form.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let methods = self
            .methods
            .iter()
            .map(|(name, (signature, doc))| {
                (
                    Value::from(name.as_str()),
                    Value::Tuple(vec![signature.as_str().into(), doc.clone().into()]),
                )
            })
            .collect();
        let fire_and_forget = self
            .fire_and_forget
            .iter()
            .map(|name| Value::from(name.as_str()))
            .collect();
        Value::map([
            ("docstring", Value::from(self.docstring.clone())),
            ("methods", Value::Dict(methods)),
            ("fire_and_forget", Value::Set(fire_and_forget)),
        ])
    }

    /// Parse the wire form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the payload is not a description.
    pub fn from_value(value: &Value) -> Result<Self> {
        let bad = || Error::Protocol("malformed target description".to_string());
        let docstring = match value.get_str("docstring") {
            None => None,
            Some(d) => d.extract::<Option<String>>()?,
        };
        let mut methods = BTreeMap::new();
        for (name, entry) in value.get_str("methods").and_then(Value::as_dict).ok_or_else(bad)? {
            let name = name.as_str().ok_or_else(bad)?;
            let (signature, doc) = match entry.as_seq() {
                Some([signature, doc]) => (
                    // Other servers may describe signatures as structured values.
                    signature
                        .as_str()
                        .map_or_else(|| signature.to_string(), str::to_string),
                    doc.extract::<Option<String>>()?,
                ),
                _ => return Err(bad()),
            };
            methods.insert(name.to_string(), (signature, doc));
        }
        let fire_and_forget = match value.get_str("fire_and_forget") {
            None | Some(Value::None) => BTreeSet::new(),
            Some(Value::Set(names)) => names
                .iter()
                .map(|n| n.as_str().map(str::to_string).ok_or_else(bad))
                .collect::<Result<_>>()?,
            Some(other) => other.extract::<Vec<String>>()?.into_iter().collect(),
        };
        Ok(Self {
            docstring,
            methods,
            fire_and_forget,
        })
    }
}

/// A request sent after target selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Invoke a method
    Call {
        /// Method name
        method: String,
        /// Arguments
        args: CallArgs,
        /// Sent as `call_async`; no reply follows
        fire_and_forget: bool,
    },
    /// Ask for the target description again
    MethodList,
}

impl Request {
    /// Wire form.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Call {
                method,
                args,
                fire_and_forget,
            } => {
                let (args, kwargs) = args.to_values();
                let action = if *fire_and_forget { "call_async" } else { "call" };
                Value::map([
                    ("action", Value::from(action)),
                    ("name", Value::from(method.as_str())),
                    ("args", args),
                    ("kwargs", kwargs),
                ])
            }
            Self::MethodList => Value::map([("action", "get_rpc_method_list")]),
        }
    }

    /// Parse the wire form.
    ///
    /// # Errors
    ///
    /// Returns a `ValueError` for unknown actions and a `TypeError` for
    /// malformed arguments.
    pub fn from_value(value: &Value) -> std::result::Result<Self, CallError> {
        let action = value
            .get_str("action")
            .and_then(Value::as_str)
            .ok_or_else(|| CallError::value_error("request without action"))?;
        match action {
            "get_rpc_method_list" => Ok(Self::MethodList),
            "call" | "call_async" => {
                let method = value
                    .get_str("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| CallError::value_error("call without method name"))?
                    .to_string();
                let args = CallArgs::from_values(value.get_str("args"), value.get_str("kwargs"))?;
                Ok(Self::Call {
                    method,
                    args,
                    fire_and_forget: action == "call_async",
                })
            }
            other => Err(CallError::value_error(format!("unknown action: {other}"))),
        }
    }
}

/// `{"status": "ok", "ret": ret}`.
#[must_use]
pub fn ok_response(ret: Value) -> Value {
    Value::map([("status", Value::from("ok")), ("ret", ret)])
}

/// `{"status": "failed", "exception": {...}}`.
#[must_use]
pub fn failed_response(error: &RemoteError) -> Value {
    Value::map([("status", Value::from("failed")), ("exception", error.to_value())])
}

/// Turn a reply into the call result.
///
/// Failures of class `UnknownMethod` and `UnknownTarget` map to the
/// matching local errors; every other failure is [`Error::Remote`].
///
/// # Errors
///
/// Returns the remote failure, or [`Error::Protocol`] for a reply that is
/// neither `ok` nor `failed`.
pub fn parse_response(reply: Value) -> Result<Value> {
    match reply.get_str("status").and_then(Value::as_str) {
        Some("ok") => Ok(reply.get_str("ret").cloned().unwrap_or_default()),
        Some("failed") => {
            let remote = RemoteError::from_value(reply.get_str("exception").ok_or_else(|| {
                Error::Protocol("failed reply without exception".to_string())
            })?)?;
            Err(match remote.kind.as_str() {
                CallError::UNKNOWN_METHOD => Error::UnknownMethod(remote.message),
                CallError::UNKNOWN_TARGET => Error::UnknownTarget(remote.message),
                _ => Error::Remote(remote),
            })
        }
        _ => Err(Error::Protocol(format!("unexpected reply: {reply}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labwire_codec::{decode, encode};

    #[test]
    fn auto_selection() {
        let one = vec!["calc".to_string()];
        let two = vec!["a".to_string(), "b".to_string()];
        assert_eq!(TargetSelector::Auto.resolve(&one).unwrap().as_deref(), Some("calc"));
        assert!(matches!(TargetSelector::Auto.resolve(&two), Err(Error::AmbiguousTarget(_))));
        assert!(matches!(TargetSelector::Auto.resolve(&[]), Err(Error::UnknownTarget(_))));
        assert!(matches!(TargetSelector::from("x").resolve(&two), Err(Error::UnknownTarget(_))));
        assert_eq!(TargetSelector::None.resolve(&two).unwrap(), None);
    }

    #[test]
    fn call_request_wire_form() {
        let request = Request::Call {
            method: "add".to_string(),
            args: CallArgs::positional(vec![2.into(), 3.into()]).kwarg("round", true),
            fire_and_forget: false,
        };
        let text = encode(&request.to_value());
        assert_eq!(
            text,
            r#"{"action":"call","args":{"__jsonclass__":["tuple",[[2,3]]]},"kwargs":{"round":true},"name":"add"}"#
        );
        assert_eq!(Request::from_value(&decode(&text).unwrap()).unwrap(), request);
    }

    #[test]
    fn call_args_lookup() {
        let args = CallArgs::positional(vec![2.into()]).kwarg("b", 3);
        assert_eq!(args.get::<i64>(0, "a").unwrap(), 2);
        assert_eq!(args.get::<i64>(1, "b").unwrap(), 3);
        assert_eq!(args.get_opt::<i64>(2, "c").unwrap(), None);
        let err = args.get::<String>(0, "a").unwrap_err();
        assert_eq!(err.kind, CallError::TYPE_ERROR);
    }

    #[test]
    fn unknown_action_is_value_error() {
        let err = Request::from_value(&Value::map([("action", "explode")])).unwrap_err();
        assert_eq!(err.kind, CallError::VALUE_ERROR);
    }

    #[test]
    fn description_round_trip() {
        let mut d = TargetDescription {
            docstring: Some("Calculator".to_string()),
            ..TargetDescription::default()
        };
        d.methods.insert("add".into(), ("(a, b)".into(), Some("Add.".into())));
        d.methods.insert("log".into(), ("(msg)".into(), None));
        d.fire_and_forget.insert("log".into());
        assert_eq!(TargetDescription::from_value(&d.to_value()).unwrap(), d);
    }

    #[test]
    fn responses() {
        assert_eq!(parse_response(ok_response(5.into())).unwrap(), Value::Int(5));
        let failed = failed_response(&RemoteError {
            kind: CallError::UNKNOWN_METHOD.to_string(),
            message: "nope".to_string(),
            traceback: Vec::new(),
        });
        assert!(matches!(parse_response(failed), Err(Error::UnknownMethod(m)) if m == "nope"));
        assert!(matches!(parse_response(Value::None), Err(Error::Protocol(_))));
    }
}

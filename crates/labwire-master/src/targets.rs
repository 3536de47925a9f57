//! Targets served by the master.

use labwire_codec::Value;
use labwire_rpc::{CallArgs, CallError, MethodTable};
use labwire_sync::{Broadcaster, LogRecord, Notifier};
use std::sync::{Arc, Mutex, PoisonError};

/// Broadcast channel carrying log records.
pub const LOG_CHANNEL: &str = "log";

/// Entry of the `log` channel for a record forwarded by another process.
#[must_use]
pub fn forwarded_entry(record: &LogRecord) -> Value {
    Value::map([
        ("level", Value::from(record.level.to_string().to_lowercase())),
        ("message", Value::from(record.message.as_str())),
        ("source", Value::from(record.source.as_str())),
        ("target", Value::from(record.target.as_str())),
    ])
}

/// Initial content of the published status structure.
#[must_use]
pub fn initial_status(description: &str) -> Value {
    Value::map([
        ("description", Value::from(description)),
        ("state", Value::from("idle")),
        ("calls", Value::from(0)),
        ("notes", Value::List(Vec::new())),
    ])
}

/// Shared state of the master's targets.
#[derive(Clone)]
pub struct Context {
    status: Notifier,
    log: Broadcaster,
    calls: Arc<Mutex<i64>>,
}

impl Context {
    /// Targets mutating `status` and logging to `log`.
    #[must_use]
    pub fn new(status: Notifier, log: Broadcaster) -> Self {
        Self {
            status,
            log,
            calls: Arc::default(),
        }
    }

    fn count_call(&self) {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        *calls += 1;
        // Published while holding the counter so subscribers never see it go back.
        if let Err(e) = self.status.root().set("calls", *calls) {
            tracing::warn!(error = %e, "Cannot publish call counter");
        }
    }

    fn log(&self, level: &str, message: &str) {
        self.log.broadcast(
            LOG_CHANNEL,
            &Value::map([("level", Value::from(level)), ("message", Value::from(message))]),
        );
    }
}

enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

fn arith(op: &Op, args: &CallArgs) -> Result<Value, CallError> {
    let a: Value = args.get(0, "a")?;
    let b: Value = args.get(1, "b")?;
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        if !matches!(op, Op::Div) {
            let result = match op {
                Op::Add => x.checked_add(y),
                Op::Sub => x.checked_sub(y),
                _ => x.checked_mul(y),
            };
            return result
                .map(Value::from)
                .ok_or_else(|| CallError::new("OverflowError", "integer overflow"));
        }
    }
    let (Some(x), Some(y)) = (a.as_float(), b.as_float()) else {
        return Err(CallError::type_error(format!(
            "unsupported operands: {} and {}",
            a.type_name(),
            b.type_name()
        )));
    };
    Ok(Value::Float(match op {
        Op::Add => x + y,
        Op::Sub => x - y,
        Op::Mul => x * y,
        Op::Div => {
            if y == 0.0 {
                return Err(CallError::new("ZeroDivisionError", "division by zero"));
            }
            x / y
        }
    }))
}

/// The `calc` target: arithmetic on numbers.
#[must_use]
pub fn calc(ctx: &Context) -> MethodTable {
    let binary = |op: Op, ctx: Context| {
        move |args: CallArgs| {
            ctx.count_call();
            arith(&op, &args)
        }
    };
    let sum_ctx = ctx.clone();
    MethodTable::new()
        .doc("Arithmetic on integers and floats.")
        .sync_method("add", "(a, b)", "Return a + b.", binary(Op::Add, ctx.clone()))
        .sync_method("sub", "(a, b)", "Return a - b.", binary(Op::Sub, ctx.clone()))
        .sync_method("mul", "(a, b)", "Return a * b.", binary(Op::Mul, ctx.clone()))
        .sync_method("div", "(a, b)", "Return a / b as a float.", binary(Op::Div, ctx.clone()))
        .sync_method("sum", "(values)", "Sum of a sequence of numbers.", move |args| {
            sum_ctx.count_call();
            let values: Value = args.get(0, "values")?;
            let items = values
                .as_seq()
                .ok_or_else(|| CallError::type_error("values must be a sequence"))?;
            let mut total = Value::from(0);
            for item in items {
                total = arith(&Op::Add, &CallArgs::positional(vec![total, item.clone()]))?;
            }
            Ok(total)
        })
}

/// The `status` target: reads and edits the published status.
#[must_use]
pub fn status(ctx: &Context) -> MethodTable {
    let get_ctx = ctx.clone();
    let state_ctx = ctx.clone();
    let note_ctx = ctx.clone();
    let clear_ctx = ctx.clone();
    MethodTable::new()
        .doc("The replicated status structure.")
        .sync_method("get", "()", "Current status.", move |_| Ok(get_ctx.status.raw_view()))
        .fire_and_forget("set_state", "(state)", "Change the state.", move |args| {
            let ctx = state_ctx.clone();
            async move {
                let state: String = args.get(0, "state")?;
                ctx.status
                    .root()
                    .set("state", state.as_str())
                    .map_err(|e| CallError::value_error(e.to_string()))?;
                tracing::info!(%state, "State changed");
                ctx.log("info", &format!("state is now {state}"));
                Ok::<_, CallError>(Value::None)
            }
        })
        .sync_method("note", "(text)", "Append a note and log it.", move |args| {
            let text: String = args.get(0, "text")?;
            note_ctx
                .status
                .at(["notes"])
                .append(text.as_str())
                .map_err(|e| CallError::value_error(e.to_string()))?;
            note_ctx.log("note", &text);
            Ok(Value::None)
        })
        .sync_method("clear_notes", "()", "Remove all notes.", move |_| {
            clear_ctx
                .status
                .at(["notes"])
                .clear()
                .map_err(|e| CallError::value_error(e.to_string()))?;
            Ok(Value::None)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(a: i64, b: i64) -> CallArgs {
        CallArgs::positional(vec![a.into(), b.into()])
    }

    #[test]
    fn integer_arithmetic_stays_integral() {
        assert_eq!(arith(&Op::Add, &ints(2, 3)).unwrap(), Value::from(5));
        assert_eq!(arith(&Op::Mul, &ints(-4, 3)).unwrap(), Value::from(-12));
        assert_eq!(arith(&Op::Div, &ints(7, 2)).unwrap(), Value::Float(3.5));
        let err = arith(&Op::Add, &ints(i64::MAX, 1)).unwrap_err();
        assert_eq!(err.kind, "OverflowError");
    }

    #[test]
    fn division_by_zero_and_bad_operands() {
        assert_eq!(arith(&Op::Div, &ints(1, 0)).unwrap_err().kind, "ZeroDivisionError");
        let args = CallArgs::positional(vec![Value::from("x"), Value::from(1)]);
        assert_eq!(arith(&Op::Sub, &args).unwrap_err().kind, CallError::TYPE_ERROR);
    }

    #[test]
    fn calls_are_counted_in_the_status() {
        let status = Notifier::new(initial_status("test"));
        let ctx = Context::new(status.clone(), Broadcaster::new());
        ctx.count_call();
        ctx.count_call();
        assert_eq!(status.read(|v| v.get_str("calls").and_then(Value::as_int)), Some(2));
    }
}

//! Scripted operation bodies
//!
//! Scenarios describe operations as short instruction lists instead of
//! evaluated VDM bodies. Every instruction maps onto one [`ThreadCx`]
//! primitive, so a script can exercise each suspension point and each
//! error path of the scheduler.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use vdm_scheduler::{
    AsyncHandle, ErrorKind, Location, ObjectId, Operation, PeriodicSpec, Priority, RunError,
    RunResult, ThreadCx, Time, Value,
};

/// A literal value or a reference to one of the call arguments
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    /// Positional argument; missing arguments read as void
    Arg {
        /// Argument index
        arg: usize,
    },
    /// Literal value
    Literal(Value),
}

impl Operand {
    fn resolve(&self, args: &[Value]) -> Value {
        match self {
            Operand::Arg { arg } => args.get(*arg).cloned().unwrap_or_default(),
            Operand::Literal(value) => value.clone(),
        }
    }
}

fn resolve_all(operands: &[Operand], args: &[Value]) -> Vec<Value> {
    operands.iter().map(|op| op.resolve(args)).collect()
}

fn one() -> i64 {
    1
}

fn runtime_kind() -> ErrorKind {
    ErrorKind::Runtime
}

/// One script instruction. `object` defaults to the operation's own object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instr {
    /// Consume `time` units of virtual time
    Duration {
        /// Time to consume
        time: Time,
    },
    /// Consume `count` CPU cycles
    Cycles {
        /// Cycle count
        count: u64,
    },
    /// Yield until the next clock advance
    Timestep,
    /// Sleep until an absolute time
    Sleep {
        /// Wake time
        until: Time,
    },
    /// Write an instance variable
    Set {
        /// Owning object
        object: Option<String>,
        /// Field name
        field: String,
        /// New value
        value: Operand,
    },
    /// Add to an integer instance variable
    Increment {
        /// Owning object
        object: Option<String>,
        /// Field name
        field: String,
        /// Amount added
        #[serde(default = "one")]
        by: i64,
    },
    /// Block until an integer instance variable reaches `value`
    AwaitAtLeast {
        /// Owning object
        object: Option<String>,
        /// Field name
        field: String,
        /// Threshold
        value: i64,
    },
    /// Precondition: fail unless an integer instance variable reaches `at_least`
    Require {
        /// Owning object
        object: Option<String>,
        /// Field name
        field: String,
        /// Threshold
        at_least: Operand,
    },
    /// Synchronous call on another thread
    Call {
        /// Called object
        object: Option<String>,
        /// Operation name
        operation: String,
        /// Arguments
        #[serde(default)]
        args: Vec<Operand>,
    },
    /// Inline invocation on the current thread
    Invoke {
        /// Operation name
        operation: String,
        /// Arguments
        #[serde(default)]
        args: Vec<Operand>,
    },
    /// Asynchronous call
    CallAsync {
        /// Called object
        object: Option<String>,
        /// Operation name
        operation: String,
        /// Arguments
        #[serde(default)]
        args: Vec<Operand>,
        /// Keep the reply for a later `await_reply`
        #[serde(default)]
        reply: bool,
    },
    /// Wait for the oldest outstanding asynchronous reply
    AwaitReply,
    /// Start a periodic or sporadic activation chain
    StartPeriodic {
        /// Target object
        object: Option<String>,
        /// Operation name
        operation: String,
        /// Arguments of every activation
        #[serde(default)]
        args: Vec<Operand>,
        /// Activation parameters
        spec: PeriodicSpec,
    },
    /// Raise an error
    Fail {
        /// Error classification
        #[serde(default = "runtime_kind")]
        kind: ErrorKind,
        /// Message
        message: String,
    },
    /// Finish the operation with a value
    Return {
        /// Returned value
        value: Operand,
    },
}

impl Instr {
    /// Object named by the instruction, if it names one other than `self`
    pub fn object_ref(&self) -> Option<&str> {
        let object = match self {
            Instr::Set { object, .. }
            | Instr::Increment { object, .. }
            | Instr::AwaitAtLeast { object, .. }
            | Instr::Require { object, .. }
            | Instr::Call { object, .. }
            | Instr::CallAsync { object, .. }
            | Instr::StartPeriodic { object, .. } => object.as_deref(),
            _ => None,
        };
        object.filter(|name| *name != "self")
    }

    /// Operation named by the instruction
    pub fn operation_ref(&self) -> Option<&str> {
        match self {
            Instr::Call { operation, .. }
            | Instr::Invoke { operation, .. }
            | Instr::CallAsync { operation, .. }
            | Instr::StartPeriodic { operation, .. } => Some(operation),
            _ => None,
        }
    }
}

/// Scenario definition of one operation
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScriptDef {
    /// Operation name
    pub name: String,
    /// Declared priority
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Instructions, run in order
    #[serde(default)]
    pub body: Vec<Instr>,
}

/// All scripted operations of a scenario, looked up by name
#[derive(Debug)]
pub struct Library {
    scripts: BTreeMap<String, Arc<ScriptDef>>,
    this: Weak<Library>,
}

impl Library {
    /// Build the library. Later definitions replace earlier ones of the same name.
    pub fn new(defs: Vec<ScriptDef>) -> Arc<Self> {
        Arc::new_cyclic(|this| Library {
            scripts: defs
                .into_iter()
                .map(|def| (def.name.clone(), Arc::new(def)))
                .collect(),
            this: this.clone(),
        })
    }

    /// Check if an operation is defined
    pub fn contains(&self, name: &str) -> bool {
        self.scripts.contains_key(name)
    }

    /// Operation handle for `name`
    pub fn get(&self, name: &str) -> Option<Arc<dyn Operation>> {
        self.scripts.get(name).map(|script| {
            Arc::new(ScriptOperation {
                script: Arc::clone(script),
                library: self.this.clone(),
            }) as Arc<dyn Operation>
        })
    }

    /// Number of operations
    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    /// Check if the library is empty
    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

/// An [`Operation`] whose body is a script
#[derive(Debug)]
pub struct ScriptOperation {
    script: Arc<ScriptDef>,
    library: Weak<Library>,
}

impl Operation for ScriptOperation {
    fn name(&self) -> &str {
        &self.script.name
    }

    fn priority(&self) -> Option<Priority> {
        self.script.priority
    }

    fn invoke(&self, cx: ThreadCx, args: Vec<Value>) -> BoxFuture<'static, RunResult<Value>> {
        let script = Arc::clone(&self.script);
        let library = self.library.clone();
        async move {
            let library = library
                .upgrade()
                .ok_or_else(|| cx.error(ErrorKind::Internal, "operation library dropped"))?;
            execute(&cx, &script, &library, &args).await
        }
        .boxed()
    }
}

fn object(cx: &ThreadCx, name: Option<&str>) -> RunResult<ObjectId> {
    match name {
        None | Some("self") => cx.this(),
        Some(name) => cx
            .lookup(name)
            .ok_or_else(|| cx.runtime_error(format!("unknown object {}", name))),
    }
}

fn lookup(cx: &ThreadCx, library: &Library, name: &str) -> RunResult<Arc<dyn Operation>> {
    library
        .get(name)
        .ok_or_else(|| cx.runtime_error(format!("unknown operation {}", name)))
}

/// Integer reading of a value; unwritten fields count as zero
fn int(cx: &ThreadCx, value: &Value) -> RunResult<i64> {
    match value {
        Value::Void => Ok(0),
        other => other.as_int().map_err(|e| cx.runtime_error(e.to_string())),
    }
}

/// Tag a failure with the script position that raised it, unless a deeper
/// frame already did
fn locate(err: RunError, script: &str, index: usize) -> RunError {
    if err.location.is_some() || err.is_cancelled() || err.kind == ErrorKind::Invocation {
        return err;
    }
    let line = u32::try_from(index + 1).unwrap_or(u32::MAX);
    err.at(Location::new(script, line, 1))
}

async fn execute(
    cx: &ThreadCx,
    script: &ScriptDef,
    library: &Library,
    args: &[Value],
) -> RunResult<Value> {
    let mut last = Value::Void;
    let mut pending: VecDeque<AsyncHandle> = VecDeque::new();

    for (index, instr) in script.body.iter().enumerate() {
        let returned = step(cx, instr, library, args, &mut last, &mut pending)
            .await
            .map_err(|err| locate(err, &script.name, index))?;
        if let Some(value) = returned {
            return Ok(value);
        }
    }
    Ok(last)
}

/// Run one instruction. `Some` ends the script with that value.
async fn step(
    cx: &ThreadCx,
    instr: &Instr,
    library: &Library,
    args: &[Value],
    last: &mut Value,
    pending: &mut VecDeque<AsyncHandle>,
) -> RunResult<Option<Value>> {
    match instr {
        Instr::Duration { time } => cx.duration(*time).await?,
        Instr::Cycles { count } => cx.cycles(*count).await?,
        Instr::Timestep => cx.timestep().await?,
        Instr::Sleep { until } => cx.sleep_until(*until).await?,
        Instr::Set {
            object: name,
            field,
            value,
        } => {
            let target = object(cx, name.as_deref())?;
            cx.write(target, field, value.resolve(args))?;
        }
        Instr::Increment {
            object: name,
            field,
            by,
        } => {
            let target = object(cx, name.as_deref())?;
            let next = cx
                .read(target, field)
                .add_int(*by)
                .map_err(|e| cx.runtime_error(format!("{}: {}", field, e)))?;
            cx.write(target, field, next)?;
        }
        Instr::AwaitAtLeast {
            object: name,
            field,
            value,
        } => {
            let target = object(cx, name.as_deref())?;
            let field = field.clone();
            let threshold = *value;
            cx.guard(move |view| view.int(target, &field) >= threshold)
                .await?;
        }
        Instr::Require {
            object: name,
            field,
            at_least,
        } => {
            let target = object(cx, name.as_deref())?;
            let threshold = int(cx, &at_least.resolve(args))?;
            if int(cx, &cx.read(target, field))? < threshold {
                return Err(cx.precondition_failed(format!("{} >= {}", field, threshold)));
            }
        }
        Instr::Call {
            object: name,
            operation,
            args: operands,
        } => {
            let target = object(cx, name.as_deref())?;
            let op = lookup(cx, library, operation)?;
            *last = cx.call(target, op, resolve_all(operands, args)).await?;
        }
        Instr::Invoke {
            operation,
            args: operands,
        } => {
            let op = lookup(cx, library, operation)?;
            *last = cx.invoke(None, op, resolve_all(operands, args)).await?;
        }
        Instr::CallAsync {
            object: name,
            operation,
            args: operands,
            reply,
        } => {
            let target = object(cx, name.as_deref())?;
            let op = lookup(cx, library, operation)?;
            let handle = cx.call_async(target, op, resolve_all(operands, args), *reply)?;
            if *reply {
                pending.push_back(handle);
            }
        }
        Instr::AwaitReply => {
            let handle = pending
                .pop_front()
                .ok_or_else(|| cx.runtime_error("no outstanding asynchronous call"))?;
            *last = cx.await_reply(handle).await?;
        }
        Instr::StartPeriodic {
            object: name,
            operation,
            args: operands,
            spec,
        } => {
            let target = object(cx, name.as_deref())?;
            let op = lookup(cx, library, operation)?;
            cx.start_periodic(target, op, resolve_all(operands, args), *spec)?;
        }
        Instr::Fail { kind, message } => return Err(cx.error(*kind, message.clone())),
        Instr::Return { value } => return Ok(Some(value.resolve(args))),
    }
    Ok(None)
}

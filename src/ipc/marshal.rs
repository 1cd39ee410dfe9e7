//! Spawn-argument marshalling.
//!
//! A task's positional arguments are extended with the logging channel and
//! every registry's handle list, in a fixed segment order:
//!
//! ```text
//! args... | LOG  chan | QUEUE  n h ... | SEMAPHORE n h ... | LOCK n h ... | RLOCK n h ... | COUNTER n h ...
//! ```
//!
//! Decoding finds the log-channel marker, then peels segments off the tail in
//! reverse append order (counters first, queues last). Markers and handles are
//! typed [`Arg`] variants, so no user value can be mistaken for either.
//!
//! Hooks and the global configuration ride in the keyword map under reserved
//! keys. A hook cannot cross a process boundary by value; its key only records
//! whether one is present, and the receiving side resolves it from its own
//! task table.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ipc::protocol::LogChannelDescriptor;
use crate::supervisor::Task;
use crate::sync::{HandleDescriptor, PrimitiveKind, Registry};
use crate::types::{Error, GlobalConfig, Result};

pub const TASK_INIT_KEY: &str = "__procvisor_task_init__";
pub const TASK_END_KEY: &str = "__procvisor_task_end__";
pub const GLOBAL_CONF_KEY: &str = "__procvisor_global_conf__";

/// Keyword keys owned by the protocol.
pub const RESERVED_KEYS: [&str; 3] = [TASK_INIT_KEY, TASK_END_KEY, GLOBAL_CONF_KEY];

/// Segment delimiters, in append order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    LogChannel,
    Queue,
    Semaphore,
    Lock,
    RLock,
    Counter,
}

impl Segment {
    fn kind(self) -> Option<PrimitiveKind> {
        match self {
            Segment::LogChannel => None,
            Segment::Queue => Some(PrimitiveKind::Queue),
            Segment::Semaphore => Some(PrimitiveKind::Semaphore),
            Segment::Lock => Some(PrimitiveKind::Lock),
            Segment::RLock => Some(PrimitiveKind::RLock),
            Segment::Counter => Some(PrimitiveKind::Counter),
        }
    }
}

/// One element of the encoded positional sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arg {
    Value(Value),
    Marker(Segment),
    Handle(HandleDescriptor),
    LogChannel(LogChannelDescriptor),
}

/// Everything a worker needs to rebuild its context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnPayload {
    pub args: Vec<Arg>,
    pub kwargs: Map<String, Value>,
}

/// Result of [`decode`].
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub log_channel: LogChannelDescriptor,
    pub init: bool,
    pub end: bool,
    pub global_config: Value,
    pub queues: Vec<(String, HandleDescriptor)>,
    pub semaphores: Vec<(String, HandleDescriptor)>,
    pub locks: Vec<(String, HandleDescriptor)>,
    pub rlocks: Vec<(String, HandleDescriptor)>,
    pub counters: Vec<(String, HandleDescriptor)>,
}

/// Reject keyword maps that use a protocol key.
pub fn check_reserved(task: &str, kwargs: &Map<String, Value>) -> Result<()> {
    match RESERVED_KEYS.iter().find(|key| kwargs.contains_key(**key)) {
        Some(key) => Err(Error::config(format!(
            "task {} uses reserved keyword {}",
            task, key
        ))),
        None => Ok(()),
    }
}

fn push_segment(out: &mut Vec<Arg>, segment: Segment, pairs: Vec<(String, HandleDescriptor)>) {
    out.push(Arg::Marker(segment));
    for (name, handle) in pairs {
        out.push(Arg::Value(Value::String(name)));
        out.push(Arg::Handle(handle));
    }
}

/// Build the spawn payload for `task`.
pub fn encode(
    task: &Task,
    registry: &Registry,
    log_channel: &LogChannelDescriptor,
    global: &GlobalConfig,
) -> Result<SpawnPayload> {
    check_reserved(task.name(), &task.kwargs)?;

    let mut args: Vec<Arg> = task.args.iter().cloned().map(Arg::Value).collect();
    args.push(Arg::Marker(Segment::LogChannel));
    args.push(Arg::LogChannel(log_channel.clone()));
    push_segment(&mut args, Segment::Queue, registry.queues().export());
    push_segment(&mut args, Segment::Semaphore, registry.semaphores().export());
    push_segment(&mut args, Segment::Lock, registry.locks().export());
    push_segment(&mut args, Segment::RLock, registry.rlocks().export());
    push_segment(&mut args, Segment::Counter, registry.counters().export());

    let mut kwargs = task.kwargs.clone();
    kwargs.insert(TASK_INIT_KEY.to_string(), Value::Bool(task.init.is_some()));
    kwargs.insert(TASK_END_KEY.to_string(), Value::Bool(task.end.is_some()));
    kwargs.insert(
        GLOBAL_CONF_KEY.to_string(),
        global.global_config().clone(),
    );

    Ok(SpawnPayload { args, kwargs })
}

fn take_flag(kwargs: &mut Map<String, Value>, key: &str) -> Result<bool> {
    match kwargs.remove(key) {
        Some(Value::Bool(flag)) => Ok(flag),
        Some(other) => Err(Error::protocol(format!(
            "{} must be a bool, got {}",
            key, other
        ))),
        None => Err(Error::protocol(format!("missing {}", key))),
    }
}

/// Split the trailing segment delimited by `segment` off `rest`.
fn peel(rest: &mut Vec<Arg>, segment: Segment) -> Result<Vec<(String, HandleDescriptor)>> {
    let pos = rest
        .iter()
        .rposition(|arg| *arg == Arg::Marker(segment))
        .ok_or_else(|| Error::protocol(format!("missing {:?} marker", segment)))?;
    let tail = rest.split_off(pos + 1);
    rest.truncate(pos);

    if tail.len() % 2 != 0 {
        return Err(Error::protocol(format!(
            "{:?} segment has an odd number of elements",
            segment
        )));
    }
    let expected = segment.kind();

    let mut pairs = Vec::with_capacity(tail.len() / 2);
    let mut items = tail.into_iter();
    while let (Some(name), Some(handle)) = (items.next(), items.next()) {
        match (name, handle) {
            (Arg::Value(Value::String(name)), Arg::Handle(handle))
                if Some(handle.kind) == expected =>
            {
                pairs.push((name, handle));
            }
            (name, handle) => {
                return Err(Error::protocol(format!(
                    "malformed {:?} pair: {:?} {:?}",
                    segment, name, handle
                )))
            }
        }
    }
    Ok(pairs)
}

/// Inverse of [`encode`].
pub fn decode(payload: SpawnPayload) -> Result<Decoded> {
    let SpawnPayload { mut args, mut kwargs } = payload;

    let init = take_flag(&mut kwargs, TASK_INIT_KEY)?;
    let end = take_flag(&mut kwargs, TASK_END_KEY)?;
    let global_config = kwargs
        .remove(GLOBAL_CONF_KEY)
        .ok_or_else(|| Error::protocol(format!("missing {}", GLOBAL_CONF_KEY)))?;

    let log_pos = args
        .iter()
        .position(|arg| *arg == Arg::Marker(Segment::LogChannel))
        .ok_or_else(|| Error::protocol("missing LogChannel marker"))?;
    let mut rest = args.split_off(log_pos);

    let counters = peel(&mut rest, Segment::Counter)?;
    let rlocks = peel(&mut rest, Segment::RLock)?;
    let locks = peel(&mut rest, Segment::Lock)?;
    let semaphores = peel(&mut rest, Segment::Semaphore)?;
    let queues = peel(&mut rest, Segment::Queue)?;

    let log_channel = match rest.as_slice() {
        [Arg::Marker(Segment::LogChannel), Arg::LogChannel(desc)] => desc.clone(),
        other => {
            return Err(Error::protocol(format!(
                "malformed log channel segment: {:?}",
                other
            )))
        }
    };

    let args = args
        .into_iter()
        .map(|arg| match arg {
            Arg::Value(value) => Ok(value),
            other => Err(Error::protocol(format!(
                "unexpected {:?} among task arguments",
                other
            ))),
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Decoded {
        args,
        kwargs,
        log_channel,
        init,
        end,
        global_config,
        queues,
        semaphores,
        locks,
        rlocks,
        counters,
    })
}

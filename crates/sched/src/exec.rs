//! Routine execution

use crate::dispatch::{Dispatcher, Routine};
use crate::promise::{decode_capture, Promise, Value};
use crate::empty_value;
use margay_core::Sid;
use margay_storage::{ReadResult, VHandle};
use margay_sync::SpinnerService;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// The signature of every routine body. Its first action is decoding the
/// capture context out of `ctx`.
pub type RoutineFn = fn(&mut RoutineCtx<'_>);

/// Runs routines on behalf of a core's worker.
///
/// Execution is run-to-completion with cooperative relief: while a
/// routine spins on a pending version, the executor runs strictly
/// more-urgent work from the same core's queues inline. Scheduling keys
/// strictly decrease down the relief nesting, so relief always
/// terminates.
pub struct Executor {
    dispatch: Arc<Dispatcher>,
    spinner: Arc<SpinnerService>,
    progress: Box<dyn Fn(usize, u64) + Send + Sync>,
}

impl Executor {
    /// Build an executor. `progress` is invoked with `(core, sched_key)`
    /// as each routine starts; the priority service tracks the batch
    /// frontier through it.
    pub fn new(
        dispatch: Arc<Dispatcher>,
        spinner: Arc<SpinnerService>,
        progress: impl Fn(usize, u64) + Send + Sync + 'static,
    ) -> Executor {
        Executor {
            dispatch,
            spinner,
            progress: Box::new(progress),
        }
    }

    /// The dispatch service.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatch
    }

    /// The spinner service.
    pub fn spinner(&self) -> &Arc<SpinnerService> {
        &self.spinner
    }

    /// Run one routine to completion on `core`, then complete its
    /// continuation promise with the routine's output.
    pub fn run(&self, core: usize, r: Routine) {
        (self.progress)(core, r.sched_key());
        let mut ctx = RoutineCtx {
            core,
            sched_key: r.sched_key(),
            exec: self,
            capture: r.inner.capture,
            input: r.input.clone(),
            output: None,
        };
        (r.inner.callback)(&mut ctx);
        let output = ctx.output.take().unwrap_or_else(empty_value);
        if let Some(next) = &r.inner.next {
            self.complete(next, output, core as u32);
        }
        self.dispatch.complete(core);
    }

    /// Deliver `value` to every routine attached to `promise`, routing
    /// each to its affinity (or `default_core` when unrouted). Each
    /// delivered routine is pre-counted on the global completion counter.
    pub fn complete(&self, promise: &Promise, value: Value, default_core: u32) {
        for inner in promise.take_routines() {
            inner.assign_default_affinity(default_core);
            let core = inner.affinity() as usize;
            self.dispatch.completion().increment(1);
            self.dispatch.add(
                core,
                [Routine {
                    inner,
                    input: value.clone(),
                }],
            );
        }
    }

    /// Pop and run the next routine on `core`. Returns false when the
    /// core is idle.
    pub fn run_one(&self, core: usize) -> bool {
        match self.dispatch.peek(core, |_| true) {
            Some(r) => {
                self.run(core, r);
                true
            }
            None => false,
        }
    }

    /// Relief step: run one routine strictly more urgent than
    /// `current_key`, if the head of the queue is one.
    pub fn assist(&self, core: usize, current_key: u64) {
        let popped = self
            .dispatch
            .peek(core, |r| r.sched_key() == 0 || r.sched_key() < current_key);
        if let Some(r) = popped {
            self.run(core, r);
        }
    }
}

/// Execution context handed to a routine body.
pub struct RoutineCtx<'a> {
    core: usize,
    sched_key: u64,
    exec: &'a Executor,
    capture: &'a [u8],
    input: Value,
    output: Option<Value>,
}

impl<'a> RoutineCtx<'a> {
    /// The core this routine runs on.
    pub fn core(&self) -> usize {
        self.core
    }

    /// The routine's scheduling key as a serial id.
    pub fn sid(&self) -> Sid {
        Sid::from_raw(self.sched_key)
    }

    /// Decode the capture context.
    pub fn capture<T: DeserializeOwned>(&self) -> T {
        decode_capture(self.capture)
    }

    /// The delivered input value.
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Set the value delivered to the continuation promise.
    pub fn emit(&mut self, value: Value) {
        self.output = Some(value);
    }

    /// The executor, for issuing follow-on work.
    pub fn executor(&self) -> &'a Executor {
        self.exec
    }

    /// Read `row` as of `sid`, relieving the core with more-urgent work
    /// while the target version is pending.
    pub fn read_row<'r>(&self, row: &'r VHandle, sid: Sid, mark_read: bool) -> ReadResult<'r> {
        let exec = self.exec;
        let core = self.core;
        let key = self.sched_key;
        row.read_with_version(sid, core, &exec.spinner, mark_read, || {
            exec.assist(core, key)
        })
    }

    /// Publish `payload` on `row` at `sid`, waking any waiters.
    pub fn write_row(&self, row: &VHandle, sid: Sid, payload: Option<&[u8]>) {
        row.write_with_version(sid, payload, &self.exec.spinner);
    }
}

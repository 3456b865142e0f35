//! Worker threads

use crate::runtime::{Phase, Runtime, WorkerCommand};
use margay_priority::PriorityCtx;
use margay_sched::empty_value;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;

/// Pin the calling thread to `cpu`.
fn pin_to_cpu(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        if cpu < libc::CPU_SETSIZE as usize {
            libc::CPU_SET(cpu, &mut set);
            if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                tracing::warn!(cpu, "sched_setaffinity failed; worker is unpinned");
            }
        }
    }
}

/// The per-core worker: phase calls on command, then the dispatcher
/// drain loop, then priority admission while the execute window is open.
pub(crate) fn worker_main(rt: Arc<Runtime>, core: usize, rx: Receiver<WorkerCommand>) {
    pin_to_cpu(core + rt.options().core_shifting);

    loop {
        match rx.try_recv() {
            Ok(WorkerCommand::Phase(phase)) => phase_call(&rt, core, phase),
            Ok(WorkerCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                while rt.exec().run_one(core) {}
                break;
            }
            Err(TryRecvError::Empty) => {}
        }

        let worked = rt.exec().run_one(core);

        // The bracket lets the phase driver wait out an admission that
        // straddles the Execute barrier.
        rt.note_admission_start();
        let mut admitted = false;
        if rt.in_execute() {
            if let Some(mut txn) = rt.service().pop_due(core) {
                let ctx = PriorityCtx {
                    core,
                    exec: rt.exec().as_ref(),
                    service: rt.service().as_ref(),
                    arena: rt.arena(core),
                };
                txn.run(&ctx);
                // Execution pieces hold pointers into the box; keep it
                // alive until the epoch is over.
                rt.service().retain(core, txn);
                admitted = true;
            }
        }
        rt.note_admission_end();

        if !worked && !admitted {
            std::thread::yield_now();
        }
    }
}

/// Iterate this core's slice of the epoch's transactions, invoke the
/// phase method on each, then hand every root promise to the dispatcher.
/// The last core to finish also completes the node's flush slot.
fn phase_call(rt: &Arc<Runtime>, core: usize, phase: Phase) {
    let set = rt.cur_txns();
    let txns = set.core_slice(core);

    if phase == Phase::Insert {
        for txn in txns {
            txn.prepare_state(rt, core);
        }
    }

    for txn in txns {
        txn.reset_root();
        match phase {
            Phase::Insert => txn.prepare_insert(rt, core),
            Phase::Initialize => txn.prepare(rt, core),
            Phase::Execute => txn.run(rt, core),
        }
    }

    if phase == Phase::Initialize {
        rt.run_gc_pass(core);
    }

    for txn in txns {
        let root = txn.root_promise();
        root.assign_default_affinity(core as u32);
        rt.exec().complete(&root, empty_value(), core as u32);
    }

    rt.dispatcher().completion().complete(1);
    if rt.phase_call_finished() {
        rt.dispatcher().completion().complete(1);
    }
}

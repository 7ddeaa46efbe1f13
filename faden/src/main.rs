use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use log::info;

use faden::{
    Capsule, DeliverResult, Executor, Fault, Heap, HeapConfig, HeapObject, Process, ProcessId,
    ProcessState, RunOutcome, Scheduler, SchedulerConfig, Value, Vm, VmCreateInfo,
};

#[derive(Parser, Debug)]
#[command(name = "faden", about = "actor runtime demo: a message pipeline")]
struct Args {
    /// Worker threads in the scheduler pool.
    #[arg(long, default_value_t = 4)]
    workers: usize,
    /// Pipeline stages (one process each).
    #[arg(long, default_value_t = 8)]
    processes: usize,
    /// Initial per-process heap capacity in bytes.
    #[arg(long, default_value_t = 16 * 1024)]
    heap_bytes: usize,
}

/// Each stage receives a counter cell, bumps it in its own heap, churns
/// some garbage, and forwards the sealed result to the next stage. The
/// last stage reports the total.
struct Pipeline {
    chain: HashMap<ProcessId, Option<ProcessId>>,
}

impl Executor for Pipeline {
    fn run(
        &self,
        vm: &Vm,
        sched: &Scheduler,
        process: &Arc<Process>,
        _quantum: usize,
    ) -> RunOutcome {
        let Some(msg) = process.extract_message() else {
            return RunOutcome::Waiting;
        };

        let received = {
            let root = msg.root();
            match root {
                Value::SmallInt(n) => n,
                Value::Ref(_) => {
                    let mut st = process.lock_state();
                    let opened = msg.open_into(&mut st.heap);
                    match st.heap.object(opened.expect_ref()) {
                        HeapObject::Cell {
                            value: Value::SmallInt(n),
                        } => *n,
                        other => {
                            return RunOutcome::Fault(Fault::new(format!(
                                "pipeline expects a counter cell, got {other:?}"
                            )));
                        }
                    }
                }
                other => {
                    return RunOutcome::Fault(Fault::new(format!(
                        "pipeline expects a counter, got {other:?}"
                    )));
                }
            }
        };

        let next = self.chain.get(&process.id).copied().flatten();
        let out = {
            let mut st = process.lock_state();
            let ProcessState { heap, roots, .. } = &mut *st;
            let cell = heap.allocate_cell(Value::small_int(received + 1), roots);
            roots.stack.push(Value::Ref(cell));
            for _ in 0..8 {
                let _ = heap.allocate_tuple(vec![Value::Nil; 4], roots);
            }
            // Churn may have collected; re-derive the cell from the roots.
            Capsule::seal(heap, roots.stack[0])
        };

        match next {
            Some(target) => {
                sched.deliver(vm, target, out);
            }
            None => info!("pipeline finished after {} stages", received + 1),
        }
        RunOutcome::Dead
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let vm = Vm::new(VmCreateInfo {
        heap: HeapConfig {
            initial_capacity: args.heap_bytes,
            ..Default::default()
        },
    });

    let stages: Vec<_> = (0..args.processes.max(1))
        .map(|_| vm.registry.spawn(None))
        .collect();
    let mut chain = HashMap::new();
    for pair in stages.windows(2) {
        chain.insert(pair[0].id, Some(pair[1].id));
    }
    let last = stages.last().expect("at least one stage");
    chain.insert(last.id, None);

    // Kick the first stage off with a zero counter.
    let scratch = Heap::new(HeapConfig::default());
    let entry = Capsule::seal(&scratch, Value::small_int(0));
    match stages[0].receive_message(entry) {
        DeliverResult::Delivered { .. } => {}
        other => unreachable!("entry delivery before the pool starts: {other:?}"),
    }

    let sched = Scheduler::new(SchedulerConfig {
        workers: args.workers.max(1),
        ..Default::default()
    });
    let seeds: Vec<ProcessId> = stages.iter().map(|p| p.id).collect();
    info!(
        "running {} stages on {} workers",
        args.processes.max(1),
        args.workers.max(1)
    );
    match sched.run(&vm, Arc::new(Pipeline { chain }), &seeds) {
        Ok(()) => info!("scheduler drained, all stages retired"),
        Err(fault) => {
            eprintln!("fatal fault: {}", fault.message);
            std::process::exit(1);
        }
    }
}

//! The worker pool. Workers pull runnable processes from one shared queue,
//! run them for a quantum through the [`Executor`] boundary, and react to
//! the outcome. The scheduler also owns the soft-stop protocol and the
//! process-level mark/sweep collector that runs under it.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, atomic::Ordering};
use std::thread;

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::{Color, Fault, Process, ProcessId, ProcessStatus, Vm};

/// One quantum's result, reported by the interpreter boundary.
#[derive(Debug)]
pub enum RunOutcome {
    /// More work pending, re-queue.
    Running,
    /// Mailbox empty, the process parked itself; a future delivery
    /// re-queues it.
    Waiting,
    /// Finished for good.
    Dead,
    /// Yield directly to the named process without a queue round-trip.
    ChangeTo(ProcessId),
    /// A user-level runtime error escaped the quantum.
    Fault(Fault),
}

/// The interpreter boundary: run `process` for at most `quantum` steps.
/// The scheduler guarantees no other thread runs the process concurrently.
pub trait Executor: Send + Sync + 'static {
    fn run(
        &self,
        vm: &Vm,
        sched: &Scheduler,
        process: &Arc<Process>,
        quantum: usize,
    ) -> RunOutcome;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub quantum: usize,
    /// Deaths between process-level collections, recomputed after each
    /// sweep from the reclaim count.
    pub gc_base_trigger: u64,
    pub gc_min_trigger: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            quantum: 1024,
            gc_base_trigger: 4096,
            gc_min_trigger: 64,
        }
    }
}

/// All shared scheduling state behind one lock: the run queue, worker
/// accounting, and the soft-stop flags. A process is in at most one of
/// {queue, running set, mailbox-wait}.
#[derive(Debug)]
struct Coord {
    queue: VecDeque<ProcessId>,
    queued: HashSet<ProcessId>,
    running: HashSet<ProcessId>,
    idle: usize,
    parked: usize,
    softstop: bool,
    done: bool,
    deaths: u64,
    gc_trigger: u64,
    fault: Option<Fault>,
}

#[derive(Debug)]
pub struct Scheduler {
    coord: Mutex<Coord>,
    /// Workers blocked waiting for queue entries.
    work_cv: Condvar,
    /// The soft-stop requester waiting for the others to go quiescent.
    stop_cv: Condvar,
    /// Parked workers waiting for the soft-stop to lift.
    resume_cv: Condvar,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        assert!(config.workers >= 1, "scheduler needs at least one worker");
        let gc_trigger = config.gc_base_trigger.max(config.gc_min_trigger);
        Arc::new(Self {
            coord: Mutex::new(Coord {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                running: HashSet::new(),
                idle: 0,
                parked: 0,
                softstop: false,
                done: false,
                deaths: 0,
                gc_trigger,
                fault: None,
            }),
            work_cv: Condvar::new(),
            stop_cv: Condvar::new(),
            resume_cv: Condvar::new(),
            config,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Make a process runnable. A process already queued or held by a
    /// worker is left alone.
    pub fn schedule(&self, pid: ProcessId) {
        let mut c = self.coord.lock();
        if c.done || c.queued.contains(&pid) || c.running.contains(&pid) {
            return;
        }
        c.queue.push_back(pid);
        c.queued.insert(pid);
        self.work_cv.notify_one();
    }

    /// Deliver a capsule, spinning through lock contention, and re-queue
    /// the receiver if the delivery woke it. Returns false when the
    /// receiver is dead or unknown (the payload is dropped).
    pub fn deliver(&self, vm: &Vm, target: ProcessId, capsule: crate::Capsule) -> bool {
        let Some(process) = vm.registry.get(target) else {
            return false;
        };
        let mut capsule = capsule;
        loop {
            match process.receive_message(capsule) {
                crate::DeliverResult::Delivered { was_waiting } => {
                    if was_waiting {
                        self.schedule(target);
                    }
                    return true;
                }
                crate::DeliverResult::Retry(back) => {
                    capsule = back;
                    thread::yield_now();
                }
                crate::DeliverResult::Dead(_) => return false,
            }
        }
    }

    /// Run the pool to completion: every worker simultaneously out of work
    /// with an empty queue. Returns the first fault that reached a process
    /// without an error handler.
    pub fn run(
        self: &Arc<Self>,
        vm: &Arc<Vm>,
        executor: Arc<dyn Executor>,
        seeds: &[ProcessId],
    ) -> Result<(), Fault> {
        {
            let mut c = self.coord.lock();
            c.done = false;
            c.softstop = false;
            c.idle = 0;
            c.parked = 0;
            c.deaths = 0;
            c.fault = None;
            for &pid in seeds {
                if !c.queued.contains(&pid) && !c.running.contains(&pid) {
                    c.queue.push_back(pid);
                    c.queued.insert(pid);
                }
            }
        }

        let mut handles = Vec::with_capacity(self.config.workers);
        for i in 0..self.config.workers {
            let sched = Arc::clone(self);
            let vm = Arc::clone(vm);
            let executor = Arc::clone(&executor);
            let handle = thread::Builder::new()
                .name(format!("faden-worker-{i}"))
                .spawn(move || sched.worker_loop(vm, executor))
                .expect("spawn worker");
            handles.push(handle);
        }
        for handle in handles {
            let _ = handle.join();
        }

        match self.coord.lock().fault.take() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn worker_loop(self: Arc<Self>, vm: Arc<Vm>, executor: Arc<dyn Executor>) {
        let mut next: Option<ProcessId> = None;
        loop {
            self.checkpoint();
            let pid = match next.take() {
                Some(pid) => pid,
                None => match self.acquire() {
                    Some(pid) => pid,
                    None => break,
                },
            };

            let Some(process) = vm.registry.get(pid) else {
                self.release(pid);
                continue;
            };
            if process.is_dead() {
                self.release(pid);
                continue;
            }

            match executor.run(&vm, &self, &process, self.config.quantum) {
                RunOutcome::Running => self.requeue(pid),
                RunOutcome::Waiting => self.release_waiting(&vm, pid),
                RunOutcome::Dead => self.retire(&vm, &process),
                RunOutcome::ChangeTo(target) => {
                    self.requeue(pid);
                    if self.try_adopt(target) {
                        next = Some(target);
                    } else {
                        // Pool stopping or target held elsewhere: route the
                        // target through the queue instead of dropping it.
                        self.schedule(target);
                    }
                }
                RunOutcome::Fault(fault) => self.route_fault(&vm, &process, fault),
            }
        }
    }

    /// Park while a soft-stop is in effect. Called with no process held or
    /// with the held process safely in the running set.
    fn checkpoint(&self) {
        let mut c = self.coord.lock();
        while c.softstop {
            c.parked += 1;
            self.stop_cv.notify_all();
            self.resume_cv.wait(&mut c);
            c.parked -= 1;
        }
    }

    /// Blocking fetch of the next runnable process. `None` means the
    /// system completed: every worker idle over an empty queue.
    fn acquire(&self) -> Option<ProcessId> {
        let mut c = self.coord.lock();
        loop {
            while c.softstop {
                c.parked += 1;
                self.stop_cv.notify_all();
                self.resume_cv.wait(&mut c);
                c.parked -= 1;
            }
            if c.done {
                return None;
            }
            if let Some(pid) = c.queue.pop_front() {
                c.queued.remove(&pid);
                c.running.insert(pid);
                return Some(pid);
            }
            c.idle += 1;
            if c.idle == self.config.workers && c.running.is_empty() {
                c.done = true;
                c.idle -= 1;
                self.work_cv.notify_all();
                self.stop_cv.notify_all();
                return None;
            }
            // A queue-blocked worker counts as stopped for the requester.
            self.stop_cv.notify_all();
            self.work_cv.wait(&mut c);
            c.idle -= 1;
        }
    }

    fn requeue(&self, pid: ProcessId) {
        let mut c = self.coord.lock();
        c.running.remove(&pid);
        if !c.queued.contains(&pid) {
            c.queue.push_back(pid);
            c.queued.insert(pid);
            self.work_cv.notify_one();
        }
    }

    fn release(&self, pid: ProcessId) {
        self.coord.lock().running.remove(&pid);
    }

    /// Drop a process that reported `Waiting`. A delivery can race the
    /// drop: it flips the status back to `Running` but cannot queue while
    /// we still hold the running-set entry, so re-check after releasing.
    fn release_waiting(&self, vm: &Vm, pid: ProcessId) {
        self.release(pid);
        if let Some(process) = vm.registry.get(pid) {
            if process.status() == ProcessStatus::Running {
                self.schedule(pid);
            }
        }
    }

    /// Claim a hand-off target for direct execution, pulling it out of the
    /// queue if it was already scheduled. Fails when another worker holds
    /// the target or the pool is stopping.
    fn try_adopt(&self, pid: ProcessId) -> bool {
        let mut c = self.coord.lock();
        if c.done || c.softstop || c.running.contains(&pid) {
            return false;
        }
        if c.queued.remove(&pid) {
            c.queue.retain(|&queued| queued != pid);
        }
        c.running.insert(pid);
        true
    }

    /// Tear down a finished process and count the death toward the next
    /// process-level collection.
    fn retire(&self, vm: &Vm, process: &Arc<Process>) {
        let pid = process.id;
        process.kill();
        vm.globals.unsubscribe_process(pid);
        vm.registry.remove(pid);
        let due = {
            let mut c = self.coord.lock();
            c.running.remove(&pid);
            c.deaths += 1;
            c.deaths >= c.gc_trigger
        };
        if due {
            self.soft_stop_collect(vm);
        }
    }

    fn route_fault(&self, vm: &Vm, process: &Arc<Process>, fault: Fault) {
        let pid = process.id;
        if process.lock_state().has_error_handler() {
            debug!("process {pid:?} fault routed to handler: {}", fault.message);
            process.set_pending_fault(fault);
            self.requeue(pid);
        } else {
            warn!("process {pid:?} fault without handler: {}", fault.message);
            self.coord.lock().fault.get_or_insert(fault);
            self.retire(vm, process);
        }
    }

    /// Bring every other worker to a quiescent point, run the process
    /// collector exclusively, then resume the pool. Only one requester;
    /// a concurrent one finds the flag set and parks like everyone else.
    fn soft_stop_collect(&self, vm: &Vm) {
        let mut c = self.coord.lock();
        if c.softstop || c.done {
            return;
        }
        c.softstop = true;
        self.work_cv.notify_all();
        while c.parked + c.idle < self.config.workers - 1 {
            self.stop_cv.wait(&mut c);
        }

        // Exclusive from here: every other worker is parked or blocked on
        // the queue. The probe makes any stray heap mutation fatal.
        let probe = vm.registry.stop_probe();
        probe.store(true, Ordering::SeqCst);
        let (marked, died) = self.collect_processes(vm, &mut c);
        probe.store(false, Ordering::SeqCst);

        c.deaths = 0;
        c.gc_trigger = self
            .config
            .gc_base_trigger
            .saturating_sub(died)
            .max(self.config.gc_min_trigger);
        info!(
            "process gc: marked {marked}, reclaimed {died}, next trigger {}",
            c.gc_trigger
        );
        c.softstop = false;
        self.resume_cv.notify_all();
        self.work_cv.notify_all();
    }

    /// Mark from globals, io-pending and running/queued processes across
    /// round-robin gray shards, then sweep the registry.
    fn collect_processes(&self, vm: &Vm, c: &mut Coord) -> (u64, u64) {
        let shard_count = self.config.workers;
        let mut gray: Vec<VecDeque<ProcessId>> = vec![VecDeque::new(); shard_count];
        let mut discovered: HashSet<ProcessId> = HashSet::new();
        let mut rr = 0usize;

        let mut roots = Vec::new();
        vm.globals.referenced_processes(&mut roots);
        roots.extend(vm.io_pending_snapshot());
        roots.extend(c.running.iter().copied());
        roots.extend(c.queue.iter().copied());
        for pid in roots {
            if discovered.insert(pid) {
                gray[rr % shard_count].push_back(pid);
                rr += 1;
            }
        }

        let mut marked = 0u64;
        let mut shard = 0usize;
        loop {
            let mut pid = None;
            for offset in 0..shard_count {
                let i = (shard + offset) % shard_count;
                if let Some(p) = gray[i].pop_front() {
                    shard = (i + 1) % shard_count;
                    pid = Some(p);
                    break;
                }
            }
            let Some(pid) = pid else { break };

            let Some(process) = vm.registry.get(pid) else {
                continue;
            };
            if process.is_dead() {
                continue;
            }

            // Keep a waiting process out of delivery wakeups from non-pool
            // threads while its references are read.
            let anesthesized = process.anesthesize();
            let mut found = Vec::new();
            process.lock_state().referenced_processes(&mut found);
            process.mark_black();
            marked += 1;
            if anesthesized && process.resolve_anesthesia() {
                if !c.queued.contains(&pid) && !c.running.contains(&pid) {
                    c.queue.push_back(pid);
                    c.queued.insert(pid);
                }
            }
            for target in found {
                if discovered.insert(target) {
                    gray[rr % shard_count].push_back(target);
                    rr += 1;
                }
            }
        }

        let mut died = 0u64;
        for process in vm.registry.snapshot() {
            if process.is_dead() {
                vm.registry.remove(process.id);
                continue;
            }
            if process.color() == Color::Black {
                process.reset_white();
            } else {
                debug!("process gc reclaiming unreachable {:?}", process.id);
                process.kill();
                vm.globals.unsubscribe_process(process.id);
                vm.registry.remove(process.id);
                died += 1;
            }
        }
        (marked, died)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::{
        Capsule, DeliverResult, Heap, HeapConfig, HeapObject, ProcessState, Value, Vm,
        VmCreateInfo,
    };

    fn small_vm() -> Arc<Vm> {
        Vm::new(VmCreateInfo {
            heap: HeapConfig {
                initial_capacity: 2048,
                headroom: 256,
                min_capacity: 512,
                ..Default::default()
            },
        })
    }

    /// Counts down from `start` one step per quantum, then dies.
    struct Countdown {
        start: i64,
    }

    impl Executor for Countdown {
        fn run(
            &self,
            _vm: &Vm,
            _sched: &Scheduler,
            process: &Arc<Process>,
            _quantum: usize,
        ) -> RunOutcome {
            let mut st = process.lock_state();
            if st.roots.stack.is_empty() {
                st.roots.stack.push(Value::small_int(self.start));
                return RunOutcome::Running;
            }
            let n = match st.roots.stack[0] {
                Value::SmallInt(n) => n - 1,
                other => panic!("unexpected counter {other:?}"),
            };
            st.roots.stack[0] = Value::small_int(n);
            if n == 0 {
                RunOutcome::Dead
            } else {
                RunOutcome::Running
            }
        }
    }

    #[test]
    fn pool_runs_every_seed_to_completion() {
        let vm = small_vm();
        let sched = Scheduler::new(SchedulerConfig {
            workers: 3,
            ..Default::default()
        });
        let seeds: Vec<ProcessId> = (0..6).map(|_| vm.registry.spawn(None).id).collect();

        let result = sched.run(&vm, Arc::new(Countdown { start: 5 }), &seeds);
        assert!(result.is_ok());
        assert!(vm.registry.is_empty(), "every process retired");
    }

    /// A builds a shared graph, seals it with an actor ref back to itself,
    /// sends it to B and waits. B opens it, churns its heap through a
    /// collection, sends the payload back and dies. A opens the reply,
    /// collects its own heap and verifies the graph survived both
    /// collections intact. With `sweep_before_extract` set, B first spawns
    /// a short-lived process so a process-level sweep runs while the
    /// request still sits in B's mailbox and A hangs off nothing but the
    /// capsule's actor ref.
    struct PingPong {
        a: ProcessId,
        b: ProcessId,
        sweep_before_extract: bool,
        a_verified: Arc<AtomicBool>,
        b_collected: Arc<AtomicBool>,
    }

    impl PingPong {
        fn run_a(&self, vm: &Vm, sched: &Scheduler, process: &Arc<Process>) -> RunOutcome {
            let phase_started = !process.lock_state().roots.stack.is_empty();
            if !phase_started {
                let capsule = {
                    let mut st = process.lock_state();
                    let ProcessState { heap, roots, .. } = &mut *st;
                    let leaf = heap.allocate_bytes(vec![1, 2, 3], roots);
                    let reply_to = heap.allocate_actor_ref(process.id, roots);
                    let pair = heap.allocate_tuple(
                        vec![
                            Value::Ref(leaf),
                            Value::Ref(leaf),
                            Value::small_int(7),
                            Value::Ref(reply_to),
                        ],
                        roots,
                    );
                    roots.stack.push(Value::small_int(1));
                    Capsule::seal(heap, Value::Ref(pair))
                };
                sched.deliver(vm, self.b, capsule);
            }
            match process.extract_message() {
                None => RunOutcome::Waiting,
                Some(reply) => {
                    let ok = self.verify(process, reply);
                    self.a_verified.store(ok, Ordering::SeqCst);
                    RunOutcome::Dead
                }
            }
        }

        fn verify(&self, process: &Arc<Process>, reply: Capsule) -> bool {
            let mut st = process.lock_state();
            let ProcessState { heap, roots, .. } = &mut *st;
            let root = reply.open_into(heap);
            roots.stack.push(root);
            if !check_graph(heap, root) {
                return false;
            }
            // Second cycle: A's own collection moves the opened payload.
            heap.collect(roots);
            let moved = roots.stack[1];
            moved != root && check_graph(heap, moved)
        }

        fn run_b(&self, vm: &Vm, sched: &Scheduler, process: &Arc<Process>) -> RunOutcome {
            if self.sweep_before_extract {
                let mut st = process.lock_state();
                if st.roots.stack.is_empty() {
                    st.roots.stack.push(Value::True);
                    drop(st);
                    // The death of this process forces a sweep while the
                    // request is still unextracted.
                    let doomed = vm.registry.spawn(None);
                    sched.schedule(doomed.id);
                    return RunOutcome::Running;
                }
            }
            match process.extract_message() {
                None => RunOutcome::Waiting,
                Some(msg) => {
                    let reply = {
                        let mut st = process.lock_state();
                        let ProcessState { heap, roots, .. } = &mut *st;
                        let root = msg.open_into(heap);
                        roots.stack.push(root);
                        let slot = roots.stack.len() - 1;
                        // First cycle: churn garbage until the heap collects.
                        let before = heap.stats().collections;
                        while heap.stats().collections == before {
                            let _ = heap.allocate_tuple(vec![Value::Nil; 8], roots);
                        }
                        self.b_collected.store(true, Ordering::SeqCst);
                        let moved = roots.stack[slot];
                        Capsule::seal(heap, moved)
                    };
                    sched.deliver(vm, self.a, reply);
                    RunOutcome::Dead
                }
            }
        }
    }

    fn check_graph(heap: &Heap, root: Value) -> bool {
        let pair = heap.object(root.expect_ref());
        if pair.element(2) != Value::small_int(7) {
            return false;
        }
        let e0 = pair.element(0).expect_ref();
        let e1 = pair.element(1).expect_ref();
        e0 == e1 && heap.object(e0) == &HeapObject::Bytes { data: vec![1, 2, 3] }
    }

    impl Executor for PingPong {
        fn run(
            &self,
            vm: &Vm,
            sched: &Scheduler,
            process: &Arc<Process>,
            _quantum: usize,
        ) -> RunOutcome {
            if process.id == self.a {
                self.run_a(vm, sched, process)
            } else if process.id == self.b {
                self.run_b(vm, sched, process)
            } else {
                RunOutcome::Dead
            }
        }
    }

    #[test]
    fn message_round_trip_survives_two_collections() {
        let vm = small_vm();
        let sched = Scheduler::new(SchedulerConfig {
            workers: 2,
            ..Default::default()
        });
        let a = vm.registry.spawn(None);
        let b = vm.registry.spawn(None);
        let a_verified = Arc::new(AtomicBool::new(false));
        let b_collected = Arc::new(AtomicBool::new(false));
        let executor = Arc::new(PingPong {
            a: a.id,
            b: b.id,
            sweep_before_extract: false,
            a_verified: Arc::clone(&a_verified),
            b_collected: Arc::clone(&b_collected),
        });

        let result = sched.run(&vm, executor, &[a.id, b.id]);
        assert!(result.is_ok());
        assert!(b_collected.load(Ordering::SeqCst), "receiver heap collected");
        assert!(
            a_verified.load(Ordering::SeqCst),
            "graph intact after round trip and both collections"
        );
    }

    #[test]
    fn message_round_trip_survives_an_interleaved_process_sweep() {
        let vm = small_vm();
        // One worker makes the order deterministic: A sends and parks, B
        // triggers the sweep before extracting, and the lowest trigger
        // sweeps on the very first death. A is unreferenced except for the
        // actor ref inside the capsule waiting in B's mailbox.
        let sched = Scheduler::new(SchedulerConfig {
            workers: 1,
            gc_base_trigger: 1,
            gc_min_trigger: 1,
            ..Default::default()
        });
        let a = vm.registry.spawn(None);
        let b = vm.registry.spawn(None);
        let a_verified = Arc::new(AtomicBool::new(false));
        let b_collected = Arc::new(AtomicBool::new(false));
        let executor = Arc::new(PingPong {
            a: a.id,
            b: b.id,
            sweep_before_extract: true,
            a_verified: Arc::clone(&a_verified),
            b_collected: Arc::clone(&b_collected),
        });

        let result = sched.run(&vm, executor, &[a.id, b.id]);
        assert!(result.is_ok());
        assert!(b_collected.load(Ordering::SeqCst), "receiver heap collected");
        assert!(
            a_verified.load(Ordering::SeqCst),
            "sender survived the sweep and verified the reply"
        );
        assert!(vm.registry.is_empty());
    }

    /// Every scheduled process dies on its first quantum.
    struct DieNow;

    impl Executor for DieNow {
        fn run(
            &self,
            _vm: &Vm,
            _sched: &Scheduler,
            _process: &Arc<Process>,
            _quantum: usize,
        ) -> RunOutcome {
            RunOutcome::Dead
        }
    }

    #[test]
    fn process_gc_reclaims_the_unreachable_and_keeps_the_referenced() {
        let vm = small_vm();
        let sched = Scheduler::new(SchedulerConfig {
            workers: 2,
            gc_base_trigger: 3,
            gc_min_trigger: 3,
            ..Default::default()
        });

        // Both park on their mailboxes; neither is ever scheduled.
        let orphan = vm.registry.spawn(None);
        let survivor = vm.registry.spawn(None);
        assert!(orphan.extract_message().is_none());
        assert!(survivor.extract_message().is_none());

        // Only the survivor is referenced, through a capsule in a global.
        let name = vm.symbols.intern("keeper");
        {
            let config = HeapConfig::default();
            let mut roots = crate::RootSet::new(config.history_slots);
            let mut heap = Heap::new(config);
            let addr = heap.allocate_actor_ref(survivor.id, &mut roots);
            vm.global_write(name, Capsule::seal(&heap, Value::Ref(addr)));
        }

        // Enough deaths to cross the trigger at least once.
        let seeds: Vec<ProcessId> = (0..6).map(|_| vm.registry.spawn(None).id).collect();
        let result = sched.run(&vm, Arc::new(DieNow), &seeds);
        assert!(result.is_ok());

        assert!(
            vm.registry.get(orphan.id).is_none(),
            "unreachable waiting process reclaimed"
        );
        let kept = vm.registry.get(survivor.id).expect("referenced process kept");
        assert_eq!(kept.status(), ProcessStatus::Waiting);
        assert_eq!(kept.color(), Color::White, "color reset after the sweep");
    }

    #[test]
    fn mailbox_capsule_reference_keeps_a_process_through_the_sweep() {
        let vm = small_vm();
        let sched = Scheduler::new(SchedulerConfig {
            workers: 2,
            gc_base_trigger: 3,
            gc_min_trigger: 3,
            ..Default::default()
        });

        // None of the three is ever scheduled.
        let holder = vm.registry.spawn(None);
        let survivor = vm.registry.spawn(None);
        let orphan = vm.registry.spawn(None);
        assert!(holder.extract_message().is_none());
        assert!(survivor.extract_message().is_none());
        assert!(orphan.extract_message().is_none());

        // The holder hangs off a global; the survivor hangs off nothing
        // but a capsule parked in the holder's mailbox.
        let config = HeapConfig::default();
        let mut roots = crate::RootSet::new(config.history_slots);
        let mut heap = Heap::new(config);
        let addr = heap.allocate_actor_ref(holder.id, &mut roots);
        let name = vm.symbols.intern("holder");
        vm.global_write(name, Capsule::seal(&heap, Value::Ref(addr)));
        let addr = heap.allocate_actor_ref(survivor.id, &mut roots);
        match holder.receive_message(Capsule::seal(&heap, Value::Ref(addr))) {
            DeliverResult::Delivered { .. } => {}
            other => panic!("delivery failed: {other:?}"),
        }

        let seeds: Vec<ProcessId> = (0..6).map(|_| vm.registry.spawn(None).id).collect();
        let result = sched.run(&vm, Arc::new(DieNow), &seeds);
        assert!(result.is_ok());

        assert!(vm.registry.get(holder.id).is_some(), "holder kept by the global");
        assert!(
            vm.registry.get(survivor.id).is_some(),
            "survivor kept only through the holder's mailbox"
        );
        assert!(
            vm.registry.get(orphan.id).is_none(),
            "unreferenced process reclaimed"
        );
    }

    /// Hands off to a fixed target once, then dies. The target is never
    /// scheduled, so it can only run through the direct hand-off.
    struct HandOff {
        target: ProcessId,
        target_ran: Arc<AtomicBool>,
    }

    impl Executor for HandOff {
        fn run(
            &self,
            _vm: &Vm,
            _sched: &Scheduler,
            process: &Arc<Process>,
            _quantum: usize,
        ) -> RunOutcome {
            if process.id == self.target {
                self.target_ran.store(true, Ordering::SeqCst);
                return RunOutcome::Dead;
            }
            let mut st = process.lock_state();
            if st.roots.stack.is_empty() {
                st.roots.stack.push(Value::True);
                RunOutcome::ChangeTo(self.target)
            } else {
                RunOutcome::Dead
            }
        }
    }

    #[test]
    fn change_to_runs_the_target_without_scheduling_it() {
        let vm = small_vm();
        let sched = Scheduler::new(SchedulerConfig {
            workers: 2,
            ..Default::default()
        });
        let source = vm.registry.spawn(None);
        let target = vm.registry.spawn(None);
        let target_ran = Arc::new(AtomicBool::new(false));
        let executor = Arc::new(HandOff {
            target: target.id,
            target_ran: Arc::clone(&target_ran),
        });

        let result = sched.run(&vm, executor, &[source.id]);
        assert!(result.is_ok());
        assert!(target_ran.load(Ordering::SeqCst), "hand-off reached the target");
        assert!(vm.registry.is_empty());
    }

    /// One seed dies at once and starts a sweep at the lowest trigger
    /// while the other is still mid-quantum; that one then hands off to a
    /// process that was never scheduled. The target must run either way:
    /// adopted directly, or re-queued when the stop refuses the adoption.
    struct StopThenHand {
        dier: ProcessId,
        target: ProcessId,
        target_ran: Arc<AtomicBool>,
    }

    impl Executor for StopThenHand {
        fn run(
            &self,
            _vm: &Vm,
            _sched: &Scheduler,
            process: &Arc<Process>,
            _quantum: usize,
        ) -> RunOutcome {
            if process.id == self.dier {
                return RunOutcome::Dead;
            }
            if process.id == self.target {
                self.target_ran.store(true, Ordering::SeqCst);
                return RunOutcome::Dead;
            }
            let mut st = process.lock_state();
            if st.roots.stack.is_empty() {
                st.roots.stack.push(Value::True);
                drop(st);
                // Hold the quantum open until the stop request is pending.
                thread::sleep(std::time::Duration::from_millis(30));
                RunOutcome::ChangeTo(self.target)
            } else {
                RunOutcome::Dead
            }
        }
    }

    #[test]
    fn hand_off_target_survives_a_concurrent_soft_stop() {
        let vm = small_vm();
        let sched = Scheduler::new(SchedulerConfig {
            workers: 2,
            gc_base_trigger: 1,
            gc_min_trigger: 1,
            ..Default::default()
        });
        let source = vm.registry.spawn(None);
        let target = vm.registry.spawn(None);
        let dier = vm.registry.spawn(None);
        let target_ran = Arc::new(AtomicBool::new(false));
        let executor = Arc::new(StopThenHand {
            dier: dier.id,
            target: target.id,
            target_ran: Arc::clone(&target_ran),
        });

        let result = sched.run(&vm, executor, &[source.id, dier.id]);
        assert!(result.is_ok());
        assert!(
            target_ran.load(Ordering::SeqCst),
            "hand-off target ran despite the sweep"
        );
        assert!(vm.registry.is_empty());
    }

    /// Faults on the first quantum; with a handler registered, the second
    /// quantum consumes the pending fault and finishes.
    struct Faulty {
        handled: Arc<AtomicUsize>,
    }

    impl Executor for Faulty {
        fn run(
            &self,
            _vm: &Vm,
            _sched: &Scheduler,
            process: &Arc<Process>,
            _quantum: usize,
        ) -> RunOutcome {
            match process.take_pending_fault() {
                Some(fault) => {
                    assert_eq!(fault.message, "boom");
                    self.handled.fetch_add(1, Ordering::SeqCst);
                    RunOutcome::Dead
                }
                None => RunOutcome::Fault(Fault::new("boom")),
            }
        }
    }

    #[test]
    fn fault_with_handler_is_redelivered_to_the_process() {
        let vm = small_vm();
        let sched = Scheduler::new(SchedulerConfig {
            workers: 1,
            ..Default::default()
        });
        let p = vm.registry.spawn(None);
        p.lock_state().roots.error_handler = Value::True;
        let handled = Arc::new(AtomicUsize::new(0));
        let executor = Arc::new(Faulty {
            handled: Arc::clone(&handled),
        });

        let result = sched.run(&vm, executor, &[p.id]);
        assert!(result.is_ok(), "handled fault never surfaces");
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fault_without_handler_kills_and_surfaces() {
        let vm = small_vm();
        let sched = Scheduler::new(SchedulerConfig {
            workers: 1,
            ..Default::default()
        });
        let p = vm.registry.spawn(None);
        let executor = Arc::new(Faulty {
            handled: Arc::new(AtomicUsize::new(0)),
        });

        let fault = sched.run(&vm, executor, &[p.id]).unwrap_err();
        assert_eq!(fault.message, "boom");
        assert!(vm.registry.is_empty(), "faulting process was killed");
    }

    /// The echo process parks on its mailbox until an external thread
    /// delivers; the keeper spins so the pool cannot declare completion
    /// before the delivery lands.
    struct EchoOnce {
        keeper: ProcessId,
        delivered: Arc<AtomicBool>,
        woke: Arc<AtomicBool>,
    }

    impl Executor for EchoOnce {
        fn run(
            &self,
            _vm: &Vm,
            _sched: &Scheduler,
            process: &Arc<Process>,
            _quantum: usize,
        ) -> RunOutcome {
            if process.id == self.keeper {
                return if self.delivered.load(Ordering::SeqCst) {
                    RunOutcome::Dead
                } else {
                    RunOutcome::Running
                };
            }
            match process.extract_message() {
                None => RunOutcome::Waiting,
                Some(msg) => {
                    self.woke.store(msg.root() == Value::small_int(3), Ordering::SeqCst);
                    RunOutcome::Dead
                }
            }
        }
    }

    #[test]
    fn delivery_from_outside_the_pool_wakes_a_waiting_process() {
        let vm = small_vm();
        let sched = Scheduler::new(SchedulerConfig {
            workers: 2,
            ..Default::default()
        });
        let p = vm.registry.spawn(None);
        let keeper = vm.registry.spawn(None);
        let delivered = Arc::new(AtomicBool::new(false));
        let woke = Arc::new(AtomicBool::new(false));
        let executor = Arc::new(EchoOnce {
            keeper: keeper.id,
            delivered: Arc::clone(&delivered),
            woke: Arc::clone(&woke),
        });

        let sender = {
            let sched = Arc::clone(&sched);
            let vm = Arc::clone(&vm);
            let target = p.id;
            let delivered = Arc::clone(&delivered);
            thread::spawn(move || {
                // Let the process park first, then wake it.
                thread::sleep(std::time::Duration::from_millis(20));
                let heap = Heap::new(HeapConfig::default());
                assert!(sched.deliver(&vm, target, Capsule::seal(&heap, Value::small_int(3))));
                delivered.store(true, Ordering::SeqCst);
            })
        };

        let result = sched.run(&vm, executor, &[p.id, keeper.id]);
        sender.join().unwrap();
        assert!(result.is_ok());
        assert!(woke.load(Ordering::SeqCst), "the delivered payload was read");
    }
}

//! RustPython backend implementation.
//!
//! Every session gets its own interpreter on a dedicated OS thread (the
//! interpreter is not `Send`). The async side submits jobs over a channel and
//! races the reply against the deadline, which starts when the worker picks
//! the job up. On expiry the caller gets the timeout reply at once and the job
//! is abandoned: a background task nudges the worker through the interpreter's
//! user-signal channel until the evaluation unwinds, and whatever it produces
//! is discarded. The next job waits for that unwind before its own deadline
//! starts.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rustpython_vm::builtins::{PyBaseExceptionRef, PyDictRef};
use rustpython_vm::compiler::{CompileError, Mode};
use rustpython_vm::function::{ArgMapping, FuncArgs};
use rustpython_vm::scope::Scope;
use rustpython_vm::signal::{user_signal_channel, UserSignal, UserSignalReceiver, UserSignalSender};
use rustpython_vm::{AsObject, Interpreter, PyObjectRef, PyResult, VirtualMachine};
use tokio::sync::oneshot;
use tracing::{debug, instrument, trace, warn};

use super::{ExecutionBackend, ExecutionResult, SessionEngine};
use crate::capture::{CaptureSink, SinkScope};
use crate::reclaim::{ReclaimReason, Reclaimer};

/// Filename reported in tracebacks for submitted code.
const SOURCE_NAME: &str = "<string>";

/// `active` value while the worker is between jobs.
const IDLE: u64 = 0;

/// Deep Python recursion needs far more than the default 2 MiB thread stack.
const WORKER_STACK_SIZE: usize = 32 * 1024 * 1024;

/// How often an abandoned evaluation is re-interrupted.
const NUDGE_INTERVAL: Duration = Duration::from_millis(50);

const WORKER_LOST: &str = "execution worker stopped unexpectedly";

const RECLAIM_SOURCE: &str = "import gc\ngc.collect()\n";

/// Backend that evaluates Python with an embedded RustPython interpreter.
#[derive(Debug, Clone)]
pub struct PythonBackend {
    deadline: Duration,
    python_path: Vec<String>,
    reclaimer: Reclaimer,
}

impl PythonBackend {
    /// Create a backend applying `deadline` to every execution.
    pub const fn new(deadline: Duration, reclaimer: Reclaimer) -> Self {
        Self {
            deadline,
            python_path: Vec::new(),
            reclaimer,
        }
    }

    /// Extra directories for the interpreter's module search path.
    #[must_use]
    pub fn with_python_path(mut self, python_path: Vec<String>) -> Self {
        self.python_path = python_path;
        self
    }

    /// Start a worker thread with a fresh interpreter and empty bindings.
    pub fn spawn_session(&self) -> Result<PythonSession> {
        let (jobs, job_rx) = mpsc::channel();
        let (interrupts, interrupt_rx) = user_signal_channel();
        let active = Arc::new(AtomicU64::new(IDLE));

        let worker = Worker {
            jobs: job_rx,
            active: Arc::clone(&active),
            reclaimer: self.reclaimer.clone(),
            python_path: self.python_path.clone(),
        };

        thread::Builder::new()
            .name("pyrunner-session".to_string())
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || worker.run(interrupt_rx))
            .context("Failed to spawn interpreter thread")?;

        Ok(PythonSession {
            jobs,
            interrupts: Arc::new(interrupts),
            active,
            generation: IDLE,
            deadline: self.deadline,
        })
    }
}

#[async_trait]
impl ExecutionBackend for PythonBackend {
    async fn open_session(&self) -> Result<Box<dyn SessionEngine>> {
        Ok(Box::new(self.spawn_session()?))
    }

    fn deadline(&self) -> Duration {
        self.deadline
    }
}

/// Async handle to one session's interpreter thread.
pub struct PythonSession {
    jobs: mpsc::Sender<Job>,
    interrupts: Arc<UserSignalSender>,
    /// Generation the worker is currently evaluating, or `IDLE`.
    active: Arc<AtomicU64>,
    /// Last generation handed to the worker.
    generation: u64,
    deadline: Duration,
}

impl PythonSession {
    fn interrupt(&self, generation: u64) {
        send_interrupt(&self.interrupts, &self.active, generation);
    }

    /// Hand an overdue evaluation to a background task that keeps
    /// interrupting it until the worker reports back.
    fn abandon(&self, generation: u64, mut outcome: oneshot::Receiver<ExecutionResult>) {
        let interrupts = Arc::clone(&self.interrupts);
        let active = Arc::clone(&self.active);

        tokio::spawn(async move {
            let mut nudges = tokio::time::interval(NUDGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = &mut outcome => {
                        debug!(generation, "Abandoned execution unwound");
                        return;
                    }
                    _ = nudges.tick() => {
                        if !send_interrupt(&interrupts, &active, generation) {
                            return;
                        }
                    }
                }
            }
        });
    }
}

/// Queue an interrupt for `generation`. Returns `false` once the worker is gone.
fn send_interrupt(interrupts: &UserSignalSender, active: &Arc<AtomicU64>, generation: u64) -> bool {
    if interrupts
        .send(interrupt_signal(Arc::clone(active), generation))
        .is_err()
    {
        trace!(generation, "Interrupt not delivered: worker has exited");
        return false;
    }
    true
}

#[async_trait]
impl SessionEngine for PythonSession {
    #[instrument(skip(self, code), fields(code_len = code.len(), generation = self.generation + 1))]
    async fn execute(&mut self, code: &str) -> ExecutionResult {
        self.generation += 1;
        let generation = self.generation;

        let (started, wait_started) = oneshot::channel();
        let (reply, mut outcome) = oneshot::channel();
        let job = Job {
            generation,
            code: code.to_owned(),
            started,
            reply,
        };
        if self.jobs.send(job).is_err() {
            warn!("Interpreter thread is gone");
            return ExecutionResult::failure(WORKER_LOST);
        }

        // The deadline covers evaluation only, not time queued behind an
        // earlier abandoned job.
        if wait_started.await.is_err() {
            warn!("Interpreter thread exited before starting the job");
            return ExecutionResult::failure(WORKER_LOST);
        }

        match tokio::time::timeout(self.deadline, &mut outcome).await {
            Ok(Ok(result)) => {
                debug!(is_error = result.is_error(), "Execution completed");
                result
            }
            Ok(Err(_)) => {
                warn!("Interpreter thread exited mid-execution");
                ExecutionResult::failure(WORKER_LOST)
            }
            Err(_) => {
                debug!(deadline = ?self.deadline, "Deadline expired, abandoning execution");
                self.interrupt(generation);
                self.abandon(generation, outcome);
                ExecutionResult::timed_out(self.deadline)
            }
        }
    }

    async fn shutdown(self: Box<Self>) {
        let generation = self.active.load(Ordering::Acquire);
        if generation != IDLE {
            debug!(generation, "Interrupting evaluation still running at teardown");
            self.interrupt(generation);
        }
        // Dropping the job sender ends the worker loop.
    }
}

/// One submission handed to the worker.
struct Job {
    generation: u64,
    code: String,
    started: oneshot::Sender<()>,
    reply: oneshot::Sender<ExecutionResult>,
}

struct Worker {
    jobs: mpsc::Receiver<Job>,
    active: Arc<AtomicU64>,
    reclaimer: Reclaimer,
    python_path: Vec<String>,
}

impl Worker {
    fn run(self, interrupts: UserSignalReceiver) {
        let interpreter = build_interpreter(&self.python_path, interrupts);
        let bindings = interpreter.enter(Bindings::new);
        debug!("Interpreter ready");

        while let Ok(job) = self.jobs.recv() {
            self.active.store(job.generation, Ordering::Release);
            // A dropped receiver means the caller went away; run the job anyway.
            let _ = job.started.send(());
            let result = interpreter.enter(|vm| evaluate(vm, &bindings, &job.code, &self.reclaimer));
            self.active.store(IDLE, Ordering::Release);

            if job.reply.send(result).is_err() {
                debug!(generation = job.generation, "Result discarded, execution was abandoned");
            }
        }

        interpreter.enter(move |vm| {
            drop(bindings);
            collect_garbage(vm, &self.reclaimer, ReclaimReason::SessionTeardown);
        });
        debug!("Interpreter released");
    }
}

fn build_interpreter(python_path: &[String], interrupts: UserSignalReceiver) -> Interpreter {
    let mut settings = rustpython_vm::Settings::default();
    // SIGINT belongs to the server's shutdown handling.
    settings.no_sig_int = true;
    settings.path_list.extend(python_path.iter().cloned());

    Interpreter::with_init(settings, move |vm| {
        vm.add_native_modules(rustpython_stdlib::get_module_inits());
        vm.set_user_signal_channel(interrupts);
    })
}

/// Raises `KeyboardInterrupt` in the worker if `generation` is still running.
/// Stale signals from earlier generations are no-ops.
fn interrupt_signal(active: Arc<AtomicU64>, generation: u64) -> UserSignal {
    Box::new(move |vm: &VirtualMachine| {
        if active.load(Ordering::Acquire) == generation {
            Err(vm.new_exception_msg(
                vm.ctx.exceptions.keyboard_interrupt.to_owned(),
                "execution deadline exceeded".to_owned(),
            ))
        } else {
            Ok(())
        }
    })
}

/// The session's persistent globals and locals.
struct Bindings {
    globals: PyDictRef,
    locals: PyDictRef,
}

impl Bindings {
    fn new(vm: &VirtualMachine) -> Self {
        let globals = vm.ctx.new_dict();
        let _ = globals.set_item("__name__", vm.ctx.new_str("__main__").into(), vm);
        Self {
            globals,
            locals: vm.ctx.new_dict(),
        }
    }

    fn scope(&self, vm: &VirtualMachine) -> Scope {
        Scope::with_builtins(
            Some(ArgMapping::from_dict_exact(self.locals.clone())),
            self.globals.clone(),
            vm,
        )
    }
}

/// Run one submission with stdout redirected into a fresh sink.
fn evaluate(
    vm: &VirtualMachine,
    bindings: &Bindings,
    source: &str,
    reclaimer: &Reclaimer,
) -> ExecutionResult {
    let scope = SinkScope::open();

    let memory_exhausted = {
        let _redirect = StdoutRedirect::install(vm, scope.sink().clone());
        match vm.compile(source, Mode::Exec, SOURCE_NAME.to_owned()) {
            Ok(code) => match vm.run_code_obj(code, bindings.scope(vm)) {
                Ok(_) => false,
                Err(exc) => {
                    let _ = scope.sink().record_error(&format_exception(vm, &exc));
                    exc.as_object()
                        .fast_isinstance(vm.ctx.exceptions.memory_error)
                }
            },
            Err(err) => {
                let _ = scope.sink().record_error(&format_syntax_error(&err, source));
                false
            }
        }
    };

    if memory_exhausted {
        collect_garbage(vm, reclaimer, ReclaimReason::MemoryExhausted);
    }

    let captured = scope.finish();
    collect_garbage(vm, reclaimer, ReclaimReason::AfterExecution);

    ExecutionResult {
        output: captured.output,
        error: captured.error,
    }
}

/// Swaps `sys.stdout` for a sink writer and puts the old one back on drop.
struct StdoutRedirect<'vm> {
    vm: &'vm VirtualMachine,
    previous: Option<PyObjectRef>,
}

impl<'vm> StdoutRedirect<'vm> {
    fn install(vm: &'vm VirtualMachine, sink: CaptureSink) -> Self {
        let previous = vm.sys_module.get_attr("stdout", vm).ok();
        let _ = vm.sys_module.set_attr("stdout", sink_writer(vm, sink), vm);
        Self { vm, previous }
    }
}

impl Drop for StdoutRedirect<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let _ = self.vm.sys_module.set_attr("stdout", previous, self.vm);
        }
    }
}

/// File-like object whose `write` appends to `sink`.
fn sink_writer(vm: &VirtualMachine, sink: CaptureSink) -> PyObjectRef {
    let write = vm.new_function(
        "write",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let Some(arg) = args.args.first() else {
                return Err(vm.new_type_error(
                    "write() takes exactly one argument (0 given)".to_owned(),
                ));
            };
            let text = arg.str(vm)?.as_str().to_owned();
            sink.write_output(&text)
                .map_err(|closed| vm.new_value_error(closed.to_string()))?;
            Ok(vm.ctx.new_int(text.chars().count()).into())
        },
    );
    let flush = vm.new_function(
        "flush",
        |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> { Ok(vm.ctx.none()) },
    );

    let writer = vm.new_module("<capture>", vm.ctx.new_dict(), None);
    let _ = writer.set_attr("write", write, vm);
    let _ = writer.set_attr("flush", flush, vm);
    let _ = writer.set_attr("closed", vm.ctx.new_bool(false), vm);
    let _ = writer.set_attr("encoding", vm.ctx.new_str("utf-8"), vm);
    writer.into()
}

/// Full traceback text, as the interpreter prints it.
fn format_exception(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> String {
    let mut trace = String::new();
    if vm.write_exception(&mut trace, exc).is_err() {
        trace.push_str("<failed to format traceback>\n");
    }
    trace
}

fn format_syntax_error(err: &CompileError, source: &str) -> String {
    let (row, col) = err.python_location();
    let (row, col) = (row as usize, col as usize);

    let mut trace = String::from("Traceback (most recent call last):\n");
    let _ = writeln!(trace, "  File \"{SOURCE_NAME}\", line {row}");
    if let Some(line) = source.lines().nth(row.saturating_sub(1)) {
        let _ = writeln!(trace, "    {}", line.trim_end());
        let _ = writeln!(trace, "    {}^", " ".repeat(col.saturating_sub(1)));
    }
    let _ = writeln!(trace, "SyntaxError: {err}");
    trace
}

/// Advisory collection pass. Failures only affect memory footprint.
fn collect_garbage(vm: &VirtualMachine, reclaimer: &Reclaimer, reason: ReclaimReason) {
    match vm.compile(RECLAIM_SOURCE, Mode::Exec, "<reclaim>".to_owned()) {
        Ok(code) => {
            if vm.run_code_obj(code, vm.new_scope_with_builtins()).is_err() {
                trace!(?reason, "gc.collect() raised, ignoring");
            }
        }
        Err(err) => trace!(?reason, error = %err, "Could not compile reclamation pass"),
    }
    reclaimer.record(reason);
}

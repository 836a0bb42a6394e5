//! Isolates: one V8 heap and execution engine each.
//!
//! An [`Isolate`] is a reference-counted handle. Contexts, values and
//! templates all keep their isolate alive, and the native isolate is disposed
//! once the last handle is dropped, in whatever order the handles of several
//! isolates are released. The engine does not support concurrent entry, so
//! an isolate is confined to the thread that created it.
//!
//! A native isolate is only entered for the duration of a single host call;
//! between calls none of a thread's isolates is current.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::rc::Rc;

use deno_core::v8;
use serde::Serialize;

use crate::callback::FunctionCallback;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::registry::HandleRegistry;

const DEFAULT_STACK_TRACE_FRAMES: i32 = 10;

/// State reachable from native callbacks through the isolate's slot
pub(crate) struct IsolateState {
    pub(crate) registry: Rc<HandleRegistry<Context>>,
    callbacks: RefCell<Vec<Rc<FunctionCallback>>>,
    /// Scope of the native callback currently running, if any
    active_scope: Cell<Option<NonNull<v8::HandleScope<'static, ()>>>>,
}

impl IsolateState {
    fn new(registry: Rc<HandleRegistry<Context>>) -> Self {
        Self {
            registry,
            callbacks: RefCell::new(Vec::new()),
            active_scope: Cell::new(None),
        }
    }

    pub(crate) fn add_callback(&self, callback: Rc<FunctionCallback>) -> i32 {
        let mut callbacks = self.callbacks.borrow_mut();
        callbacks.push(callback);
        (callbacks.len() - 1) as i32
    }

    pub(crate) fn callback(&self, index: i32) -> Result<Rc<FunctionCallback>> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.callbacks.borrow().get(i).cloned())
            .ok_or(Error::UnknownCallback(index))
    }

    pub(crate) fn in_callback(&self) -> bool {
        self.active_scope.get().is_some()
    }

    /// Run `f` with `scope` published as the re-entry point for host calls
    /// made while a native callback is on the stack.
    pub(crate) fn with_active_scope<R>(
        &self,
        scope: &mut v8::HandleScope<'_>,
        f: impl FnOnce() -> R,
    ) -> R {
        let base: &mut v8::HandleScope<'_, ()> = scope;
        let ptr = NonNull::from(base).cast::<v8::HandleScope<'static, ()>>();
        let previous = self.active_scope.replace(Some(ptr));
        let result = f();
        self.active_scope.set(previous);
        result
    }
}

struct IsolateInner {
    isolate: RefCell<v8::OwnedIsolate>,
    state: Rc<IsolateState>,
    terminate: v8::IsolateHandle,
}

impl Drop for IsolateInner {
    fn drop(&mut self) {
        log::debug!(
            "disposing isolate ({} registered contexts)",
            self.state.registry.len()
        );
        // `OwnedIsolate` exits itself on drop and must be current when it does
        // SAFETY: balanced by the exit in `OwnedIsolate::drop` right after this
        unsafe { self.isolate.get_mut().enter() };
    }
}

/// Keeps a native isolate entered on this thread until dropped
struct Entered(*mut v8::Isolate);

impl Entered {
    /// # Safety
    /// `isolate` must outlive the guard, and guards must drop in reverse
    /// order of creation.
    unsafe fn new(isolate: &mut v8::Isolate) -> Self {
        isolate.enter();
        Self(isolate)
    }
}

impl Drop for Entered {
    fn drop(&mut self) {
        // SAFETY: see `Entered::new`
        unsafe { (*self.0).exit() };
    }
}

/// Handle to a V8 isolate
#[derive(Clone)]
pub struct Isolate {
    inner: Rc<IsolateInner>,
}

impl Isolate {
    /// Create an isolate with default settings
    pub fn new() -> Self {
        IsolateBuilder::default().build()
    }

    pub fn builder() -> IsolateBuilder {
        IsolateBuilder::default()
    }

    /// The registry that maps context handles back to their wrappers
    pub fn registry(&self) -> &HandleRegistry<Context> {
        &self.inner.state.registry
    }

    /// Shared ownership of the registry, for handing to another isolate
    pub fn shared_registry(&self) -> Rc<HandleRegistry<Context>> {
        Rc::clone(&self.inner.state.registry)
    }

    pub(crate) fn state(&self) -> &IsolateState {
        &self.inner.state
    }

    /// Drain the microtask queue once.
    ///
    /// Pending promise reactions of every context on this isolate run, not
    /// only those of the caller's context.
    pub fn perform_microtask_checkpoint(&self) -> Result<()> {
        self.enter(|scope| scope.perform_microtask_checkpoint())
    }

    /// A thread-safe handle that can stop script execution on this isolate
    pub fn terminate_handle(&self) -> TerminateHandle {
        TerminateHandle {
            handle: self.inner.terminate.clone(),
        }
    }

    pub fn heap_statistics(&self) -> Result<HeapStatistics> {
        self.enter(|scope| {
            let mut stats = v8::HeapStatistics::default();
            scope.get_heap_statistics(&mut stats);
            HeapStatistics {
                total_heap_size: stats.total_heap_size(),
                total_heap_size_executable: stats.total_heap_size_executable(),
                total_physical_size: stats.total_physical_size(),
                total_available_size: stats.total_available_size(),
                used_heap_size: stats.used_heap_size(),
                heap_size_limit: stats.heap_size_limit(),
                malloced_memory: stats.malloced_memory(),
                external_memory: stats.external_memory(),
                peak_malloced_memory: stats.peak_malloced_memory(),
                number_of_native_contexts: stats.number_of_native_contexts(),
                number_of_detached_contexts: stats.number_of_detached_contexts(),
            }
        })
    }

    /// Enter the isolate with a fresh handle scope.
    ///
    /// The native isolate is made current for the call and exited again
    /// afterwards. From inside a native callback the isolate is already
    /// borrowed by the outer call; in that case the callback's scope is used
    /// as the parent.
    pub(crate) fn enter<R>(&self, f: impl FnOnce(&mut v8::HandleScope<'_, ()>) -> R) -> Result<R> {
        match self.inner.isolate.try_borrow_mut() {
            Ok(mut isolate) => {
                // SAFETY: the borrow outlives the guard, and the guard is
                // declared before the scope so it drops after it
                let _entered = unsafe { Entered::new(&mut isolate) };
                let scope = &mut v8::HandleScope::new(&mut *isolate);
                Ok(f(scope))
            }
            Err(_) => {
                let Some(mut active) = self.inner.state.active_scope.get() else {
                    return Err(Error::IsolateBusy);
                };
                // SAFETY: the pointer was published by `with_active_scope` for
                // the duration of a callback whose scope is the innermost one
                // on this isolate; the callback frame does not touch it until
                // the host call returns.
                let parent = unsafe { active.as_mut() };
                // The callback may have switched to another isolate in between
                // SAFETY: as above, and the guard drops after the scope
                let _entered = unsafe { Entered::new(&mut *parent) };
                let scope = &mut v8::HandleScope::new(parent);
                Ok(f(scope))
            }
        }
    }
}

impl Default for Isolate {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Isolate {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Isolate {}

impl std::fmt::Debug for Isolate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Isolate")
            .field("ptr", &Rc::as_ptr(&self.inner))
            .field("contexts", &self.inner.state.registry.len())
            .finish()
    }
}

/// Settings applied when the native isolate is created
#[derive(Default)]
pub struct IsolateBuilder {
    heap_limits: Option<(usize, usize)>,
    stack_trace_frames: Option<i32>,
    registry: Option<Rc<HandleRegistry<Context>>>,
}

impl IsolateBuilder {
    /// Initial and maximum heap size in bytes
    pub fn heap_limits(mut self, initial: usize, max: usize) -> Self {
        self.heap_limits = Some((initial, max));
        self
    }

    /// Frames captured for uncaught exceptions; 0 disables capture
    pub fn stack_trace_frames(mut self, frames: i32) -> Self {
        self.stack_trace_frames = Some(frames);
        self
    }

    /// Register contexts in an existing registry instead of a fresh one
    pub fn registry(mut self, registry: Rc<HandleRegistry<Context>>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Isolate {
        crate::ensure_v8();

        let mut params = v8::CreateParams::default();
        if let Some((initial, max)) = self.heap_limits {
            params = params.heap_limits(initial, max);
        }
        let mut isolate = v8::Isolate::new(params);

        // Promise reactions only run at an explicit checkpoint
        isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);

        let frames = self.stack_trace_frames.unwrap_or(DEFAULT_STACK_TRACE_FRAMES);
        isolate.set_capture_stack_trace_for_uncaught_exceptions(frames > 0, frames);

        let registry = self.registry.unwrap_or_default();
        let state = Rc::new(IsolateState::new(registry));
        isolate.set_slot(Rc::clone(&state));
        let terminate = isolate.thread_safe_handle();

        // Created isolates start out entered; `Isolate::enter` enters per call
        // SAFETY: paired with the enter in `IsolateInner::drop`
        unsafe { isolate.exit() };

        log::debug!("created isolate (stack trace frames: {})", frames);

        Isolate {
            inner: Rc::new(IsolateInner {
                isolate: RefCell::new(isolate),
                state,
                terminate,
            }),
        }
    }
}

/// Stops script execution from any thread.
///
/// Termination is not a recoverable script exception: the running script
/// unwinds completely and its caller receives a [`crate::ScriptError`] with
/// `terminated` set.
#[derive(Clone)]
pub struct TerminateHandle {
    handle: v8::IsolateHandle,
}

impl TerminateHandle {
    /// Returns false if the isolate has already been disposed
    pub fn terminate_execution(&self) -> bool {
        self.handle.terminate_execution()
    }

    pub fn cancel_terminate_execution(&self) -> bool {
        self.handle.cancel_terminate_execution()
    }

    pub fn is_execution_terminating(&self) -> bool {
        self.handle.is_execution_terminating()
    }
}

impl std::fmt::Debug for TerminateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminateHandle").finish_non_exhaustive()
    }
}

/// Snapshot of an isolate's heap usage, in bytes unless noted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeapStatistics {
    pub total_heap_size: usize,
    pub total_heap_size_executable: usize,
    pub total_physical_size: usize,
    pub total_available_size: usize,
    pub used_heap_size: usize,
    pub heap_size_limit: usize,
    pub malloced_memory: usize,
    pub external_memory: usize,
    pub peak_malloced_memory: usize,
    /// Count, not bytes
    pub number_of_native_contexts: usize,
    /// Count, not bytes
    pub number_of_detached_contexts: usize,
}

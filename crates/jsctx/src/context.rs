//! Contexts: global execution environments inside an isolate.
//!
//! A [`Context`] owns its native context, a table of the values it has handed
//! out, and an entry in its isolate's handle registry. The registry entry keeps
//! the context alive until [`Context::close`], which is never called
//! implicitly: dropping the last handle of an open context leaks it.

use std::cell::RefCell;
use std::ffi::c_void;
use std::rc::Rc;

use deno_core::v8;
use once_cell::unsync::OnceCell;

use crate::error::{Error, Result, ScriptError};
use crate::isolate::Isolate;
use crate::registry::{Handle, INVALID_HANDLE};
use crate::scope::{ValueRef, ValueScope, ValueTable};
use crate::template::ObjectTemplate;
use crate::value::{js_string, Object, Primitive, Value};

/// Embedder data slot holding a pointer to the context's registry handle.
/// Slot 0 is reserved for the inspector.
pub(crate) const CONTEXT_HANDLE_SLOT: i32 = 1;

/// A single option applied when constructing a context
#[derive(Clone)]
pub enum ContextOption {
    /// Reuse this isolate instead of creating one
    Isolate(Isolate),
    /// Instantiate the context's global object from this template
    GlobalTemplate(ObjectTemplate),
}

/// Options accumulated before a context is built
#[derive(Clone, Default)]
pub struct ContextOptions {
    isolate: Option<Isolate>,
    global_template: Option<ObjectTemplate>,
}

impl ContextOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, option: ContextOption) {
        match option {
            ContextOption::Isolate(iso) => self.isolate = Some(iso),
            ContextOption::GlobalTemplate(tmpl) => self.global_template = Some(tmpl),
        }
    }

    pub fn with_isolate(mut self, isolate: &Isolate) -> Self {
        self.apply(ContextOption::Isolate(isolate.clone()));
        self
    }

    pub fn with_global_template(mut self, template: &ObjectTemplate) -> Self {
        self.apply(ContextOption::GlobalTemplate(template.clone()));
        self
    }
}

impl FromIterator<ContextOption> for ContextOptions {
    fn from_iter<I: IntoIterator<Item = ContextOption>>(iter: I) -> Self {
        let mut options = ContextOptions::new();
        for option in iter {
            options.apply(option);
        }
        options
    }
}

struct ContextState {
    native: v8::Global<v8::Context>,
    values: ValueTable<v8::Global<v8::Value>>,
    /// Target of the embedder data pointer; must not move while the context is open
    handle_slot: Box<Handle>,
}

struct ContextInner {
    isolate: Isolate,
    handle: OnceCell<Handle>,
    state: RefCell<Option<ContextState>>,
}

/// Handle to a V8 context
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

impl Context {
    /// Create a context from a list of options.
    ///
    /// Without an isolate option a fresh isolate is created; it lives as long
    /// as any handle referring to it.
    pub fn new(options: impl IntoIterator<Item = ContextOption>) -> Result<Context> {
        Self::with_options(options.into_iter().collect())
    }

    pub fn with_options(options: ContextOptions) -> Result<Context> {
        let isolate = options.isolate.unwrap_or_default();
        if let Some(template) = &options.global_template {
            if template.isolate() != &isolate {
                return Err(Error::IsolateMismatch);
            }
        }

        let context = Context {
            inner: Rc::new(ContextInner {
                isolate: isolate.clone(),
                handle: OnceCell::new(),
                state: RefCell::new(None),
            }),
        };
        let handle = isolate.registry().register(context.clone());
        let _ = context.inner.handle.set(handle);

        let handle_slot = Box::new(handle);
        let slot_ptr = &*handle_slot as *const Handle as *mut c_void;
        let global_template = options.global_template.as_ref();

        let native = isolate.enter(|scope| {
            let template = global_template.map(|tmpl| v8::Local::new(scope, tmpl.global()));
            let local = v8::Context::new(
                scope,
                v8::ContextOptions {
                    global_template: template,
                    ..Default::default()
                },
            );
            // SAFETY: the slot is boxed and outlives the native context's use
            // of it; `close` clears the pointer before the box is freed.
            unsafe {
                local.set_aligned_pointer_in_embedder_data(CONTEXT_HANDLE_SLOT, slot_ptr);
            }
            v8::Global::new(scope, local)
        });
        let native = match native {
            Ok(native) => native,
            Err(err) => {
                isolate.registry().unregister(handle);
                return Err(err);
            }
        };

        *context.inner.state.borrow_mut() = Some(ContextState {
            native,
            values: ValueTable::new(),
            handle_slot,
        });
        log::debug!("opened context {}", handle);
        Ok(context)
    }

    /// The isolate this context belongs to
    pub fn isolate(&self) -> &Isolate {
        &self.inner.isolate
    }

    /// This context's key in its isolate's handle registry
    pub fn handle(&self) -> Handle {
        self.inner.handle.get().copied().unwrap_or(INVALID_HANDLE)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().is_none()
    }

    /// Compile and run `source` as a top-level script.
    ///
    /// `origin` labels the script in locations and stack traces, typically a
    /// file name.
    pub fn run_script(&self, source: &str, origin: &str) -> Result<Value> {
        self.enter(|scope| {
            let tc = &mut v8::TryCatch::new(scope);
            let code = js_string(tc, source)?;
            let name = js_string(tc, origin)?;
            let script_origin = v8::ScriptOrigin::new(
                tc,
                name.into(),
                0,
                0,
                false,
                0,
                None,
                false,
                false,
                false,
                None,
            );
            let script = v8::Script::compile(tc, code, Some(&script_origin));
            let script = caught(tc, script)?;
            let result = script.run(tc);
            let result = caught(tc, result)?;
            self.add_value(tc, result)
        })
    }

    /// The global proxy object.
    ///
    /// Its prototype is the real global object. Replacing that prototype is
    /// not supported by the engine.
    pub fn global(&self) -> Result<Object> {
        self.enter(|scope| {
            let global = scope.get_current_context().global(scope);
            self.add_value(scope, global.into()).map(Object::from_value)
        })
    }

    /// Parse `text` as JSON into a value owned by this context
    pub fn json_parse(&self, text: &str) -> Result<Value> {
        self.enter(|scope| {
            let tc = &mut v8::TryCatch::new(scope);
            let text = js_string(tc, text)?;
            let parsed = v8::json::parse(tc, text);
            let parsed = caught(tc, parsed)?;
            self.add_value(tc, parsed)
        })
    }

    /// Create a primitive value in this context
    pub fn new_value<'a>(&self, value: impl Into<Primitive<'a>>) -> Result<Value> {
        let value = value.into();
        self.enter(|scope| {
            let local = value.to_local(scope)?;
            self.add_value(scope, local)
        })
    }

    /// Drain the isolate's microtask queue once; affects every context
    /// sharing the isolate.
    pub fn perform_microtask_checkpoint(&self) -> Result<()> {
        self.check_open()?;
        self.inner.isolate.perform_microtask_checkpoint()
    }

    /// Dispose of the native context and remove its registry entry.
    ///
    /// Values created by this context are unusable afterwards. Closing twice
    /// fails with `Error::ContextClosed`.
    pub fn close(&self) -> Result<()> {
        self.check_open()?;
        self.inner.isolate.enter(|scope| {
            let state = self.inner.state.borrow();
            if let Some(state) = state.as_ref() {
                let local = v8::Local::new(scope, &state.native);
                // SAFETY: clearing the pointer so late callbacks see a closed context
                unsafe {
                    local.set_aligned_pointer_in_embedder_data(
                        CONTEXT_HANDLE_SLOT,
                        std::ptr::null_mut(),
                    );
                }
            }
        })?;

        let state = self.inner.state.borrow_mut().take();
        let released = state.as_ref().map_or(0, |s| s.values.len());
        drop(state);

        let handle = self.handle();
        self.inner.isolate.registry().unregister(handle);
        log::debug!("closed context {} ({} values released)", handle, released);
        Ok(())
    }

    /// Open a value scope; values created from now on are released when it
    /// is popped.
    pub fn push_value_scope(&self) -> Result<ValueScope> {
        self.with_state(|state| {
            let scope = state.values.push();
            log::trace!("context {}: pushed value scope {}", self.handle(), scope.id());
            scope
        })
    }

    /// Close the innermost value scope, releasing every value created since
    /// the matching push. Fails if `scope` is not the innermost one.
    pub fn pop_value_scope(&self, scope: ValueScope) -> Result<()> {
        self.with_state(|state| {
            let before = state.values.len();
            state.values.pop(scope)?;
            log::trace!(
                "context {}: popped value scope {} ({} values released)",
                self.handle(),
                scope.id(),
                before - state.values.len()
            );
            Ok(())
        })?
    }

    /// Run `callback` inside a fresh value scope.
    ///
    /// Values created during the callback are released when it returns, even
    /// if it panics, and must not be used afterwards. Use this to bound
    /// memory growth in a long-lived context.
    pub fn with_temporary_values<R>(&self, callback: impl FnOnce() -> R) -> Result<R> {
        let guard = TemporaryScope {
            context: self,
            scope: Some(self.push_value_scope()?),
        };
        let result = callback();
        guard.finish()?;
        Ok(result)
    }

    /// Enter the isolate and this context, then run `f`
    pub(crate) fn enter<R>(&self, f: impl FnOnce(&mut v8::HandleScope<'_>) -> Result<R>) -> Result<R> {
        self.check_open()?;
        self.inner.isolate.enter(|scope| {
            let local = {
                let state = self.inner.state.borrow();
                let state = state.as_ref().ok_or(Error::ContextClosed)?;
                v8::Local::new(scope, &state.native)
            };
            let scope = &mut v8::ContextScope::new(scope, local);
            f(scope)
        })?
    }

    /// Register a native value in the current value scope
    pub(crate) fn add_value(
        &self,
        scope: &mut v8::HandleScope<'_>,
        local: v8::Local<'_, v8::Value>,
    ) -> Result<Value> {
        let global = v8::Global::new(scope, local);
        let r = self.with_state(|state| state.values.add(global))?;
        Ok(Value::from_ref(self.clone(), r))
    }

    pub(crate) fn resolve<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        r: ValueRef,
    ) -> Result<v8::Local<'s, v8::Value>> {
        let state = self.inner.state.borrow();
        let state = state.as_ref().ok_or(Error::ContextClosed)?;
        match state.values.get(r) {
            Ok(global) => Ok(v8::Local::new(scope, global)),
            Err(err) => {
                log::warn!(
                    "context {}: use of released value #{} from scope {}",
                    self.handle(),
                    r.index,
                    r.scope
                );
                Err(err)
            }
        }
    }

    pub(crate) fn is_live(&self, r: ValueRef) -> bool {
        self.inner
            .state
            .borrow()
            .as_ref()
            .map_or(false, |state| state.values.is_live(r))
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ContextState) -> R) -> Result<R> {
        let mut state = self.inner.state.borrow_mut();
        let state = state.as_mut().ok_or(Error::ContextClosed)?;
        Ok(f(state))
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ContextClosed);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn value_count(&self) -> usize {
        self.inner
            .state
            .borrow()
            .as_ref()
            .map_or(0, |state| state.values.len())
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Context {}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("handle", &self.handle())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Pops a temporary value scope on every exit path
struct TemporaryScope<'a> {
    context: &'a Context,
    scope: Option<ValueScope>,
}

impl TemporaryScope<'_> {
    fn finish(mut self) -> Result<()> {
        match self.scope.take() {
            Some(scope) => self.context.pop_value_scope(scope),
            None => Ok(()),
        }
    }
}

impl Drop for TemporaryScope<'_> {
    fn drop(&mut self) {
        // Only reached without `finish` when the callback unwinds
        if let Some(scope) = self.scope.take() {
            if let Err(err) = self.context.pop_value_scope(scope) {
                log::error!("failed to pop temporary value scope {}: {}", scope.id(), err);
            }
        }
    }
}

/// Convert an empty engine result into the pending exception
pub(crate) fn caught<T>(tc: &mut v8::TryCatch<v8::HandleScope>, value: Option<T>) -> Result<T> {
    match value {
        Some(value) => Ok(value),
        None => Err(Error::Script(exception_error(tc))),
    }
}

pub(crate) fn exception_error(tc: &mut v8::TryCatch<v8::HandleScope>) -> ScriptError {
    if tc.has_terminated() {
        return ScriptError::terminated();
    }

    let message = match tc.exception() {
        Some(exception) => exception.to_rust_string_lossy(tc),
        None => "unknown script error".to_string(),
    };

    let location = tc.message().map(|msg| {
        let mut location = msg
            .get_script_resource_name(tc)
            .map(|name| name.to_rust_string_lossy(tc))
            .unwrap_or_default();
        if let Some(line) = msg.get_line_number(tc) {
            location.push_str(&format!(":{}", line));
        }
        // 1-based to match stack trace output
        location.push_str(&format!(":{}", msg.get_start_column() + 1));
        location
    });

    let stack = tc
        .stack_trace()
        .map(|stack| stack.to_rust_string_lossy(tc))
        .filter(|stack| !stack.is_empty() && stack != "undefined");

    ScriptError {
        message,
        location,
        stack,
        terminated: false,
    }
}

//! Native functions callable from script.
//!
//! Every function created from a [`crate::FunctionTemplate`] calls into
//! [`function_trampoline`]. The trampoline carries no pointers: the callback
//! is found by its index in the isolate's callback table (stored as the
//! function's data), and the calling [`Context`] is found by the registry
//! handle stored in the native context's embedder data.

use std::ffi::c_void;
use std::rc::Rc;

use deno_core::v8;

use crate::context::{Context, CONTEXT_HANDLE_SLOT};
use crate::error::{Error, Result};
use crate::isolate::IsolateState;
use crate::object::Object;
use crate::registry::Handle;
use crate::value::{js_string, Value};

/// Host function body. `Ok(None)` returns `undefined` to script; `Err` is
/// thrown as an `Error` with the error's message.
pub type FunctionCallback = dyn Fn(&FunctionCallbackInfo) -> Result<Option<Value>>;

/// The receiver and arguments of a call from script
#[derive(Debug)]
pub struct FunctionCallbackInfo {
    context: Context,
    this: Object,
    args: Vec<Value>,
}

impl FunctionCallbackInfo {
    /// The context the function was created in
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn this(&self) -> &Object {
        &self.this
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

/// Entry point the engine calls for every template-created function
pub(crate) fn function_trampoline<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    mut rv: v8::ReturnValue,
) {
    match dispatch(scope, &args) {
        Ok(Some(value)) => rv.set(value),
        Ok(None) => {}
        Err(err) => throw(scope, err),
    }
}

fn dispatch<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: &v8::FunctionCallbackArguments<'s>,
) -> Result<Option<v8::Local<'s, v8::Value>>> {
    let state = scope
        .get_slot::<Rc<IsolateState>>()
        .cloned()
        .ok_or(Error::IsolateMismatch)?;

    let context = calling_context(scope, &state)?;
    let index = args
        .data()
        .int32_value(scope)
        .ok_or(Error::UnknownCallback(-1))?;
    let callback = state.callback(index)?;

    let this = context.add_value(scope, args.this().into())?;
    let mut values = Vec::with_capacity(args.length().max(0) as usize);
    for i in 0..args.length() {
        values.push(context.add_value(scope, args.get(i))?);
    }
    let info = FunctionCallbackInfo {
        context: context.clone(),
        this: Object::from_value(this),
        args: values,
    };

    let result = state.with_active_scope(scope, || callback(&info))?;
    match result {
        Some(value) => value.local_in(context.isolate(), scope).map(Some),
        None => Ok(None),
    }
}

/// Resolve the wrapper of the native context the call is running in
fn calling_context(scope: &mut v8::HandleScope<'_>, state: &IsolateState) -> Result<Context> {
    let native = scope.get_current_context();
    // SAFETY: every context on this isolate is created by `Context::with_options`,
    // which stores a pointer to its boxed handle in this slot or null once closed.
    let ptr: *mut c_void =
        unsafe { native.get_aligned_pointer_from_embedder_data(CONTEXT_HANDLE_SLOT) };
    if ptr.is_null() {
        return Err(Error::ContextClosed);
    }
    // SAFETY: non-null pointers refer to the live box owned by the context state
    let handle = unsafe { *(ptr as *const Handle) };
    state.registry.resolve(handle)
}

fn throw(scope: &mut v8::HandleScope<'_>, err: Error) {
    if err.as_script_error().map_or(false, |e| e.terminated) {
        // Termination keeps unwinding on its own
        return;
    }
    log::warn!("native callback failed: {}", err);
    let message = match js_string(scope, &err.to_string()) {
        Ok(message) => message,
        Err(_) => v8::String::new(scope, "native callback failed")
            .unwrap_or_else(|| v8::String::empty(scope)),
    };
    let exception = v8::Exception::error(scope, message);
    scope.throw_exception(exception);
}

#[cfg(test)]
mod tests {
    use crate::context::{Context, ContextOption};
    use crate::error::Error;
    use crate::isolate::Isolate;
    use crate::template::FunctionTemplate;
    use crate::value::ValueKind;

    fn install(ctx: &Context, name: &str, template: &FunctionTemplate) {
        let function = template.get_function(ctx).unwrap();
        ctx.global().unwrap().set(name, &function).unwrap();
    }

    #[test]
    fn test_callback_called_from_script() {
        let iso = Isolate::new();
        let ctx = Context::new([ContextOption::Isolate(iso.clone())]).unwrap();
        let add = FunctionTemplate::new(&iso, |info| {
            let mut sum = 0.0;
            for arg in info.args() {
                sum += arg.to_number()?;
            }
            info.context().new_value(sum).map(Some)
        })
        .unwrap();
        install(&ctx, "add", &add);

        let value = ctx.run_script("add(1, 2, 3.5)", "add.js").unwrap();
        assert_eq!(value.to_number().unwrap(), 6.5);
        ctx.close().unwrap();
    }

    #[test]
    fn test_callback_receives_this_and_context() {
        let iso = Isolate::new();
        let ctx = Context::new([ContextOption::Isolate(iso.clone())]).unwrap();
        let expected = ctx.handle();
        let describe = FunctionTemplate::new(&iso, move |info| {
            if info.context().handle() != expected || !info.is_empty() {
                return Err(Error::callback("unexpected call"));
            }
            info.this().get("label").map(Some)
        })
        .unwrap();
        install(&ctx, "describe", &describe);

        let value = ctx
            .run_script("({ label: 'receiver', describe }).describe()", "this.js")
            .unwrap();
        assert_eq!(value.to_js_string().unwrap(), "receiver");
        ctx.close().unwrap();
    }

    #[test]
    fn test_callback_reenters_engine() {
        let iso = Isolate::new();
        let ctx = Context::new([ContextOption::Isolate(iso.clone())]).unwrap();
        let shout = FunctionTemplate::new(&iso, |info| {
            let arg = info.arg(0).ok_or_else(|| Error::callback("missing argument"))?;
            // Runs user code (toString) while the outer script is suspended
            let text = arg.to_js_string()?;
            let nested = info.context().run_script("'!'", "nested.js")?;
            let upper = format!("{}{}", text.to_uppercase(), nested.to_js_string()?);
            info.context().new_value(upper.as_str()).map(Some)
        })
        .unwrap();
        install(&ctx, "shout", &shout);

        let value = ctx
            .run_script("shout({ toString() { return 'hey'; } })", "shout.js")
            .unwrap();
        assert_eq!(value.to_js_string().unwrap(), "HEY!");
        ctx.close().unwrap();
    }

    #[test]
    fn test_callback_error_is_thrown_into_script() {
        let iso = Isolate::new();
        let ctx = Context::new([ContextOption::Isolate(iso.clone())]).unwrap();
        let fail = FunctionTemplate::new(&iso, |_| Err(Error::callback("host refused"))).unwrap();
        install(&ctx, "fail", &fail);

        let caught = ctx
            .run_script("try { fail(); 'no' } catch (e) { e.message }", "catch.js")
            .unwrap();
        assert_eq!(caught.to_js_string().unwrap(), "host refused");

        let err = ctx.run_script("fail()", "uncaught.js").unwrap_err();
        assert_eq!(err.as_script_error().unwrap().message, "Error: host refused");
        ctx.close().unwrap();
    }

    #[test]
    fn test_callback_returning_nothing_is_undefined() {
        let iso = Isolate::new();
        let ctx = Context::new([ContextOption::Isolate(iso.clone())]).unwrap();
        let noop = FunctionTemplate::new(&iso, |_| Ok(None)).unwrap();
        install(&ctx, "noop", &noop);

        let value = ctx.run_script("noop(1, 2)", "noop.js").unwrap();
        assert_eq!(value.kind().unwrap(), ValueKind::Undefined);
        ctx.close().unwrap();
    }

    #[test]
    fn test_callback_arguments_held_until_scope_pops() {
        let iso = Isolate::new();
        let ctx = Context::new([ContextOption::Isolate(iso.clone())]).unwrap();
        let sink = FunctionTemplate::new(&iso, |_| Ok(None)).unwrap();
        install(&ctx, "sink", &sink);

        let baseline = ctx.value_count();
        ctx.with_temporary_values(|| {
            ctx.run_script("for (let i = 0; i < 100; i++) sink(i);", "loop.js")
                .unwrap();
            // `this` plus one argument per call
            assert!(ctx.value_count() >= baseline + 200);
        })
        .unwrap();
        assert_eq!(ctx.value_count(), baseline);

        ctx.close().unwrap();
    }

    #[test]
    fn test_callback_resolves_each_context() {
        let iso = Isolate::new();
        let a = Context::new([ContextOption::Isolate(iso.clone())]).unwrap();
        let b = Context::new([ContextOption::Isolate(iso.clone())]).unwrap();
        let whoami = FunctionTemplate::new(&iso, |info| {
            let handle = info.context().handle() as i32;
            info.context().new_value(handle).map(Some)
        })
        .unwrap();
        install(&a, "whoami", &whoami);
        install(&b, "whoami", &whoami);

        let from_a = a.run_script("whoami()", "a.js").unwrap().to_int32().unwrap();
        let from_b = b.run_script("whoami()", "b.js").unwrap().to_int32().unwrap();
        assert_eq!(from_a as u64, a.handle());
        assert_eq!(from_b as u64, b.handle());

        a.close().unwrap();
        b.close().unwrap();
    }
}

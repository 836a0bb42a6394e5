//! Object, function and promise views over [`Value`].

use std::ops::Deref;

use deno_core::v8;

use crate::context::caught;
use crate::error::Result;
use crate::value::{downcast, js_string, Value};

/// A value known to be an object
#[derive(Clone, Debug)]
pub struct Object {
    value: Value,
}

impl Object {
    pub(crate) fn from_value(value: Value) -> Self {
        Self { value }
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// `object[key]`
    pub fn get(&self, key: &str) -> Result<Value> {
        self.with_object(|tc, object| {
            let key = js_string(tc, key)?;
            let value = object.get(tc, key.into());
            let value = caught(tc, value)?;
            self.context().add_value(tc, value)
        })
    }

    pub fn get_index(&self, index: u32) -> Result<Value> {
        self.with_object(|tc, object| {
            let value = object.get_index(tc, index);
            let value = caught(tc, value)?;
            self.context().add_value(tc, value)
        })
    }

    /// `object[key] = value`; setters and proxies may throw
    pub fn set(&self, key: &str, value: &Value) -> Result<()> {
        let isolate = self.context().isolate().clone();
        self.with_object(|tc, object| {
            let value = value.local_in(&isolate, tc)?;
            let key = js_string(tc, key)?;
            let done = object.set(tc, key.into(), value);
            caught(tc, done).map(|_| ())
        })
    }

    pub fn set_index(&self, index: u32, value: &Value) -> Result<()> {
        let isolate = self.context().isolate().clone();
        self.with_object(|tc, object| {
            let value = value.local_in(&isolate, tc)?;
            let done = object.set_index(tc, index, value);
            caught(tc, done).map(|_| ())
        })
    }

    /// `key in object`
    pub fn has(&self, key: &str) -> Result<bool> {
        self.with_object(|tc, object| {
            let key = js_string(tc, key)?;
            let found = object.has(tc, key.into());
            caught(tc, found)
        })
    }

    /// `delete object[key]`
    pub fn delete(&self, key: &str) -> Result<bool> {
        self.with_object(|tc, object| {
            let key = js_string(tc, key)?;
            let deleted = object.delete(tc, key.into());
            caught(tc, deleted)
        })
    }

    /// Own enumerable string keys, in property order
    pub fn keys(&self) -> Result<Vec<String>> {
        self.with_object(|tc, object| {
            let names = object.get_own_property_names(tc, v8::GetPropertyNamesArgs::default());
            let names = caught(tc, names)?;
            let mut keys = Vec::with_capacity(names.length() as usize);
            for i in 0..names.length() {
                let name = names.get_index(tc, i);
                let name = caught(tc, name)?;
                keys.push(name.to_rust_string_lossy(tc));
            }
            Ok(keys)
        })
    }

    /// The object's prototype, or `None` at the end of the chain
    pub fn prototype(&self) -> Result<Option<Object>> {
        self.with_object(|tc, object| {
            let proto = object.get_prototype(tc);
            let proto = caught(tc, proto)?;
            if proto.is_null_or_undefined() {
                return Ok(None);
            }
            self.context().add_value(tc, proto).map(|v| Some(Object::from_value(v)))
        })
    }

    /// `object[name](...args)`
    pub fn call_method(&self, name: &str, args: &[&Value]) -> Result<Value> {
        let method = self.get(name)?.as_function()?;
        method.call(self, args)
    }

    fn with_object<R>(
        &self,
        f: impl for<'s> FnOnce(
            &mut v8::TryCatch<'_, v8::HandleScope<'s>>,
            v8::Local<'s, v8::Object>,
        ) -> Result<R>,
    ) -> Result<R> {
        self.value.with_local(|scope, local| {
            let object = downcast::<v8::Object>(local, "object")?;
            let tc = &mut v8::TryCatch::new(scope);
            f(tc, object)
        })
    }
}

impl Deref for Object {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.value
    }
}

/// A callable object
#[derive(Clone, Debug)]
pub struct Function {
    object: Object,
}

impl Function {
    pub(crate) fn from_object(object: Object) -> Self {
        Self { object }
    }

    /// Call with an explicit receiver. Exceptions come back as script errors.
    pub fn call(&self, this: &Value, args: &[&Value]) -> Result<Value> {
        let isolate = self.context().isolate().clone();
        self.with_local(|scope, local| {
            let function = downcast::<v8::Function>(local, "function")?;
            let tc = &mut v8::TryCatch::new(scope);
            let receiver = this.local_in(&isolate, tc)?;
            let argv = args
                .iter()
                .map(|arg| arg.local_in(&isolate, tc))
                .collect::<Result<Vec<_>>>()?;
            let result = function.call(tc, receiver, &argv);
            let result = caught(tc, result)?;
            self.context().add_value(tc, result)
        })
    }

    /// `new function(...args)`
    pub fn construct(&self, args: &[&Value]) -> Result<Object> {
        let isolate = self.context().isolate().clone();
        self.with_local(|scope, local| {
            let function = downcast::<v8::Function>(local, "function")?;
            let tc = &mut v8::TryCatch::new(scope);
            let argv = args
                .iter()
                .map(|arg| arg.local_in(&isolate, tc))
                .collect::<Result<Vec<_>>>()?;
            let object = function.new_instance(tc, &argv);
            let object = caught(tc, object)?;
            self.context()
                .add_value(tc, object.into())
                .map(Object::from_value)
        })
    }
}

impl Deref for Function {
    type Target = Object;

    fn deref(&self) -> &Object {
        &self.object
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

#[derive(Clone, Debug)]
pub struct Promise {
    object: Object,
}

impl Promise {
    pub(crate) fn from_object(object: Object) -> Self {
        Self { object }
    }

    pub fn state(&self) -> Result<PromiseState> {
        self.with_local(|_, local| {
            let promise = downcast::<v8::Promise>(local, "promise")?;
            Ok(match promise.state() {
                v8::PromiseState::Pending => PromiseState::Pending,
                v8::PromiseState::Fulfilled => PromiseState::Fulfilled,
                v8::PromiseState::Rejected => PromiseState::Rejected,
            })
        })
    }

    /// The fulfillment value or rejection reason; `None` while pending
    pub fn result(&self) -> Result<Option<Value>> {
        self.with_local(|scope, local| {
            let promise = downcast::<v8::Promise>(local, "promise")?;
            if matches!(promise.state(), v8::PromiseState::Pending) {
                return Ok(None);
            }
            let result = promise.result(scope);
            self.context().add_value(scope, result).map(Some)
        })
    }

    /// Attach a fulfillment handler; it runs at the next microtask checkpoint
    pub fn then(&self, on_fulfilled: &Function) -> Result<Promise> {
        let isolate = self.context().isolate().clone();
        self.with_local(|scope, local| {
            let promise = downcast::<v8::Promise>(local, "promise")?;
            let tc = &mut v8::TryCatch::new(scope);
            let handler = on_fulfilled.local_in(&isolate, tc)?;
            let handler = downcast::<v8::Function>(handler, "function")?;
            let chained = promise.then(tc, handler);
            let chained = caught(tc, chained)?;
            self.context()
                .add_value(tc, chained.into())
                .map(|v| Promise::from_object(Object::from_value(v)))
        })
    }
}

impl Deref for Promise {
    type Target = Object;

    fn deref(&self) -> &Object {
        &self.object
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::error::Error;
    use crate::value::ValueKind;

    #[test]
    fn test_property_access() {
        let ctx = Context::new([]).unwrap();
        let object = ctx.run_script("({ a: 1, b: 'two' })", "o.js").unwrap().as_object().unwrap();

        assert_eq!(object.get("a").unwrap().to_int32().unwrap(), 1);
        assert_eq!(object.get("missing").unwrap().kind().unwrap(), ValueKind::Undefined);
        assert!(object.has("b").unwrap());
        assert!(!object.has("c").unwrap());

        let three = ctx.new_value(3).unwrap();
        object.set("c", &three).unwrap();
        assert_eq!(object.keys().unwrap(), vec!["a", "b", "c"]);

        assert!(object.delete("a").unwrap());
        assert!(!object.has("a").unwrap());
        assert_eq!(object.to_json().unwrap(), r#"{"b":"two","c":3}"#);
        ctx.close().unwrap();
    }

    #[test]
    fn test_indexed_access() {
        let ctx = Context::new([]).unwrap();
        let array = ctx.run_script("[10, 20]", "a.js").unwrap().as_object().unwrap();
        assert_eq!(array.get_index(1).unwrap().to_int32().unwrap(), 20);

        let value = ctx.new_value(30).unwrap();
        array.set_index(2, &value).unwrap();
        assert_eq!(array.get("length").unwrap().to_int32().unwrap(), 3);
        ctx.close().unwrap();
    }

    #[test]
    fn test_setter_exception_propagates() {
        let ctx = Context::new([]).unwrap();
        let object = ctx
            .run_script("({ set locked(v) { throw new TypeError('locked'); } })", "s.js")
            .unwrap()
            .as_object()
            .unwrap();
        let value = ctx.new_value(1).unwrap();
        let err = object.set("locked", &value).unwrap_err();
        assert_eq!(err.as_script_error().unwrap().message, "TypeError: locked");
        ctx.close().unwrap();
    }

    #[test]
    fn test_call_function_and_method() {
        let ctx = Context::new([]).unwrap();
        let add = ctx
            .run_script("(function (a, b) { return a + b; })", "f.js")
            .unwrap()
            .as_function()
            .unwrap();
        let undefined = ctx.run_script("undefined", "f.js").unwrap();
        let a = ctx.new_value(2).unwrap();
        let b = ctx.new_value(40).unwrap();
        assert_eq!(add.call(&undefined, &[&a, &b]).unwrap().to_int32().unwrap(), 42);

        let counter = ctx
            .run_script("({ n: 1, bump(by) { this.n += by; return this.n; } })", "m.js")
            .unwrap()
            .as_object()
            .unwrap();
        let result = counter.call_method("bump", &[&b]).unwrap();
        assert_eq!(result.to_int32().unwrap(), 41);

        assert!(matches!(
            counter.call_method("n", &[]),
            Err(Error::TypeMismatch { expected: "function", .. })
        ));
        ctx.close().unwrap();
    }

    #[test]
    fn test_construct() {
        let ctx = Context::new([]).unwrap();
        let class = ctx
            .run_script("(class Point { constructor(x) { this.x = x; } })", "c.js")
            .unwrap()
            .as_function()
            .unwrap();
        let x = ctx.new_value(5).unwrap();
        let point = class.construct(&[&x]).unwrap();
        assert_eq!(point.get("x").unwrap().to_int32().unwrap(), 5);
        ctx.close().unwrap();
    }

    #[test]
    fn test_call_rejects_value_from_other_isolate() {
        let ctx = Context::new([]).unwrap();
        let f = ctx.run_script("(x => x)", "f.js").unwrap().as_function().unwrap();

        let other = Context::new([]).unwrap();
        let foreign = other.new_value(1).unwrap();
        assert!(matches!(
            f.call(&foreign, &[]),
            Err(Error::IsolateMismatch)
        ));
        other.close().unwrap();
        ctx.close().unwrap();
    }

    #[test]
    fn test_promise_lifecycle() {
        let ctx = Context::new([]).unwrap();
        let promise = ctx
            .run_script("var settle; new Promise(r => { settle = r; })", "p.js")
            .unwrap()
            .as_promise()
            .unwrap();
        assert_eq!(promise.state().unwrap(), PromiseState::Pending);
        assert!(promise.result().unwrap().is_none());

        let double = ctx.run_script("(v => v * 2)", "p.js").unwrap().as_function().unwrap();
        let chained = promise.then(&double).unwrap();

        ctx.run_script("settle(21)", "p.js").unwrap();
        assert_eq!(promise.state().unwrap(), PromiseState::Fulfilled);
        assert_eq!(promise.result().unwrap().unwrap().to_int32().unwrap(), 21);

        // Reactions wait for a checkpoint
        assert_eq!(chained.state().unwrap(), PromiseState::Pending);
        ctx.perform_microtask_checkpoint().unwrap();
        assert_eq!(chained.state().unwrap(), PromiseState::Fulfilled);
        assert_eq!(chained.result().unwrap().unwrap().to_int32().unwrap(), 42);
        ctx.close().unwrap();
    }

    #[test]
    fn test_rejected_promise() {
        let ctx = Context::new([]).unwrap();
        let promise = ctx
            .run_script("Promise.reject(new Error('nope'))", "r.js")
            .unwrap()
            .as_promise()
            .unwrap();
        assert_eq!(promise.state().unwrap(), PromiseState::Rejected);
        let reason = promise.result().unwrap().unwrap();
        assert_eq!(reason.to_js_string().unwrap(), "Error: nope");
        ctx.close().unwrap();
    }
}

//! Values handed across the boundary.
//!
//! A [`Value`] is a context plus a slot in that context's value table. It is
//! usable while the context is open and the value scope that created it has
//! not been popped; afterwards every operation fails with
//! `Error::StaleValue` or `Error::ContextClosed`.

use deno_core::v8;
use serde::Serialize;

use crate::context::{caught, Context};
use crate::error::{Error, Result};
use crate::isolate::Isolate;
use crate::object::{Function, Object, Promise};
use crate::scope::ValueRef;

/// The JavaScript type of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Undefined,
    Null,
    Boolean,
    Number,
    BigInt,
    String,
    Symbol,
    Function,
    Object,
    Other,
}

impl ValueKind {
    pub(crate) fn of(local: v8::Local<'_, v8::Value>) -> Self {
        if local.is_undefined() {
            ValueKind::Undefined
        } else if local.is_null() {
            ValueKind::Null
        } else if local.is_boolean() {
            ValueKind::Boolean
        } else if local.is_number() {
            ValueKind::Number
        } else if local.is_big_int() {
            ValueKind::BigInt
        } else if local.is_string() {
            ValueKind::String
        } else if local.is_symbol() {
            ValueKind::Symbol
        } else if local.is_function() {
            ValueKind::Function
        } else if local.is_object() {
            ValueKind::Object
        } else {
            ValueKind::Other
        }
    }

    pub fn is_nullish(self) -> bool {
        matches!(self, ValueKind::Undefined | ValueKind::Null)
    }

    /// Functions are objects too
    pub fn is_object(self) -> bool {
        matches!(self, ValueKind::Object | ValueKind::Function)
    }
}

/// Primitive data that can be turned into a value without running script
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Primitive<'a> {
    Undefined,
    Null,
    Boolean(bool),
    Integer(i32),
    Number(f64),
    String(&'a str),
}

impl Primitive<'_> {
    pub(crate) fn to_local<'s>(
        &self,
        scope: &mut v8::HandleScope<'s, ()>,
    ) -> Result<v8::Local<'s, v8::Value>> {
        let local: v8::Local<v8::Value> = match *self {
            Primitive::Undefined => v8::undefined(scope).into(),
            Primitive::Null => v8::null(scope).into(),
            Primitive::Boolean(b) => v8::Boolean::new(scope, b).into(),
            Primitive::Integer(i) => v8::Integer::new(scope, i).into(),
            Primitive::Number(n) => v8::Number::new(scope, n).into(),
            Primitive::String(s) => js_string(scope, s)?.into(),
        };
        Ok(local)
    }
}

impl From<bool> for Primitive<'_> {
    fn from(b: bool) -> Self {
        Primitive::Boolean(b)
    }
}

impl From<i32> for Primitive<'_> {
    fn from(i: i32) -> Self {
        Primitive::Integer(i)
    }
}

impl From<f64> for Primitive<'_> {
    fn from(n: f64) -> Self {
        Primitive::Number(n)
    }
}

impl<'a> From<&'a str> for Primitive<'a> {
    fn from(s: &'a str) -> Self {
        Primitive::String(s)
    }
}

impl<'a> From<&'a String> for Primitive<'a> {
    fn from(s: &'a String) -> Self {
        Primitive::String(s.as_str())
    }
}

pub(crate) fn js_string<'s>(
    scope: &mut v8::HandleScope<'s, ()>,
    s: &str,
) -> Result<v8::Local<'s, v8::String>> {
    v8::String::new(scope, s).ok_or(Error::StringTooLong(s.len()))
}

/// Downcast a native value, reporting its actual kind on failure
pub(crate) fn downcast<'s, T>(
    local: v8::Local<'s, v8::Value>,
    expected: &'static str,
) -> Result<v8::Local<'s, T>>
where
    v8::Local<'s, T>: TryFrom<v8::Local<'s, v8::Value>>,
{
    let found = ValueKind::of(local);
    v8::Local::<T>::try_from(local).map_err(|_| Error::TypeMismatch { expected, found })
}

/// A reference to a JavaScript value owned by a context
#[derive(Clone)]
pub struct Value {
    ctx: Context,
    r: ValueRef,
}

impl Value {
    pub(crate) fn from_ref(ctx: Context, r: ValueRef) -> Self {
        Self { ctx, r }
    }

    /// Create a primitive value in `ctx`
    pub fn new<'a>(ctx: &Context, value: impl Into<Primitive<'a>>) -> Result<Value> {
        ctx.new_value(value)
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// False once the creating scope was popped or the context was closed
    pub fn is_valid(&self) -> bool {
        self.ctx.is_live(self.r)
    }

    pub fn kind(&self) -> Result<ValueKind> {
        self.with_local(|_, local| Ok(ValueKind::of(local)))
    }

    /// Convert with JavaScript's `String(value)` semantics
    pub fn to_js_string(&self) -> Result<String> {
        self.with_local(|scope, local| {
            let tc = &mut v8::TryCatch::new(scope);
            let string = local.to_string(tc);
            let string = caught(tc, string)?;
            Ok(string.to_rust_string_lossy(tc))
        })
    }

    /// A debug description that never runs user code, e.g. `[object Object]`
    pub fn to_detail_string(&self) -> Result<String> {
        self.with_local(|scope, local| {
            let tc = &mut v8::TryCatch::new(scope);
            let string = local.to_detail_string(tc);
            let string = caught(tc, string)?;
            Ok(string.to_rust_string_lossy(tc))
        })
    }

    pub fn to_number(&self) -> Result<f64> {
        self.with_local(|scope, local| {
            let tc = &mut v8::TryCatch::new(scope);
            let number = local.number_value(tc);
            caught(tc, number)
        })
    }

    pub fn to_int32(&self) -> Result<i32> {
        self.with_local(|scope, local| {
            let tc = &mut v8::TryCatch::new(scope);
            let number = local.int32_value(tc);
            caught(tc, number)
        })
    }

    pub fn to_integer(&self) -> Result<i64> {
        self.with_local(|scope, local| {
            let tc = &mut v8::TryCatch::new(scope);
            let number = local.integer_value(tc);
            caught(tc, number)
        })
    }

    pub fn to_boolean(&self) -> Result<bool> {
        self.with_local(|scope, local| Ok(local.boolean_value(scope)))
    }

    /// `JSON.stringify(value)`
    pub fn to_json(&self) -> Result<String> {
        self.with_local(|scope, local| {
            let tc = &mut v8::TryCatch::new(scope);
            let json = v8::json::stringify(tc, local);
            let json = caught(tc, json)?;
            Ok(json.to_rust_string_lossy(tc))
        })
    }

    /// Copy the value out as JSON data; `undefined` maps to `null`
    pub fn to_serde(&self) -> Result<serde_json::Value> {
        if self.kind()? == ValueKind::Undefined {
            return Ok(serde_json::Value::Null);
        }
        let json = self.to_json()?;
        Ok(serde_json::from_str(&json)?)
    }

    /// `Object.is(self, other)`
    pub fn same_value(&self, other: &Value) -> Result<bool> {
        let isolate = self.ctx.isolate().clone();
        self.with_local(|scope, local| {
            let other = other.local_in(&isolate, scope)?;
            Ok(local.same_value(other))
        })
    }

    /// View an object value as an [`Object`] without conversion
    pub fn as_object(&self) -> Result<Object> {
        let kind = self.kind()?;
        if !kind.is_object() {
            return Err(Error::TypeMismatch {
                expected: "object",
                found: kind,
            });
        }
        Ok(Object::from_value(self.clone()))
    }

    /// `Object(value)`: wraps primitives, fails for null and undefined
    pub fn to_object(&self) -> Result<Object> {
        self.with_local(|scope, local| {
            let tc = &mut v8::TryCatch::new(scope);
            let object = local.to_object(tc);
            let object = caught(tc, object)?;
            self.ctx.add_value(tc, object.into()).map(Object::from_value)
        })
    }

    pub fn as_function(&self) -> Result<Function> {
        self.with_local(|_, local| downcast::<v8::Function>(local, "function").map(|_| ()))?;
        Ok(Function::from_object(Object::from_value(self.clone())))
    }

    pub fn as_promise(&self) -> Result<Promise> {
        self.with_local(|_, local| downcast::<v8::Promise>(local, "promise").map(|_| ()))?;
        Ok(Promise::from_object(Object::from_value(self.clone())))
    }

    /// Enter the owning context with this value resolved
    pub(crate) fn with_local<R>(
        &self,
        f: impl for<'s> FnOnce(&mut v8::HandleScope<'s>, v8::Local<'s, v8::Value>) -> Result<R>,
    ) -> Result<R> {
        self.ctx.enter(|scope| {
            let local = self.ctx.resolve(scope, self.r)?;
            f(scope, local)
        })
    }

    /// Resolve inside a scope already entered on `isolate`
    pub(crate) fn local_in<'s>(
        &self,
        isolate: &Isolate,
        scope: &mut v8::HandleScope<'s>,
    ) -> Result<v8::Local<'s, v8::Value>> {
        if self.ctx.isolate() != isolate {
            return Err(Error::IsolateMismatch);
        }
        self.ctx.resolve(scope, self.r)
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Value")
            .field("context", &self.ctx.handle())
            .field("scope", &self.r.scope)
            .field("index", &self.r.index)
            .finish()
    }
}

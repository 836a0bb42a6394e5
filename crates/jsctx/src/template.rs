//! Object and function templates.
//!
//! Templates belong to an isolate rather than a context, so one template can
//! back the global object or functions of many contexts on the same isolate.

use std::rc::Rc;

use deno_core::v8;

use crate::callback::{function_trampoline, FunctionCallbackInfo};
use crate::context::{caught, Context};
use crate::error::{Error, Result};
use crate::isolate::Isolate;
use crate::object::{Function, Object};
use crate::value::{js_string, Primitive, Value};

/// Attributes of a template property
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropertyAttributes {
    pub read_only: bool,
    pub dont_enum: bool,
    pub dont_delete: bool,
}

impl PropertyAttributes {
    fn to_native(self) -> v8::PropertyAttribute {
        let mut attr = v8::PropertyAttribute::NONE;
        if self.read_only {
            attr = attr | v8::PropertyAttribute::READ_ONLY;
        }
        if self.dont_enum {
            attr = attr | v8::PropertyAttribute::DONT_ENUM;
        }
        if self.dont_delete {
            attr = attr | v8::PropertyAttribute::DONT_DELETE;
        }
        attr
    }
}

/// Something that can be stored as a template property
#[derive(Clone, Copy)]
pub enum TemplateValue<'a> {
    Primitive(Primitive<'a>),
    Object(&'a ObjectTemplate),
    Function(&'a FunctionTemplate),
}

impl<'a> From<Primitive<'a>> for TemplateValue<'a> {
    fn from(p: Primitive<'a>) -> Self {
        TemplateValue::Primitive(p)
    }
}

impl From<bool> for TemplateValue<'_> {
    fn from(b: bool) -> Self {
        TemplateValue::Primitive(b.into())
    }
}

impl From<i32> for TemplateValue<'_> {
    fn from(i: i32) -> Self {
        TemplateValue::Primitive(i.into())
    }
}

impl From<f64> for TemplateValue<'_> {
    fn from(n: f64) -> Self {
        TemplateValue::Primitive(n.into())
    }
}

impl<'a> From<&'a str> for TemplateValue<'a> {
    fn from(s: &'a str) -> Self {
        TemplateValue::Primitive(s.into())
    }
}

impl<'a> From<&'a ObjectTemplate> for TemplateValue<'a> {
    fn from(t: &'a ObjectTemplate) -> Self {
        TemplateValue::Object(t)
    }
}

impl<'a> From<&'a FunctionTemplate> for TemplateValue<'a> {
    fn from(t: &'a FunctionTemplate) -> Self {
        TemplateValue::Function(t)
    }
}

/// Blueprint for plain objects, including a context's global object
#[derive(Clone)]
pub struct ObjectTemplate {
    template: v8::Global<v8::ObjectTemplate>,
    isolate: Isolate,
}

impl ObjectTemplate {
    pub fn new(isolate: &Isolate) -> Result<Self> {
        let template = isolate.enter(|scope| {
            let template = v8::ObjectTemplate::new(scope);
            v8::Global::new(scope, template)
        })?;
        Ok(Self {
            template,
            isolate: isolate.clone(),
        })
    }

    pub fn set<'a>(&self, name: &str, value: impl Into<TemplateValue<'a>>) -> Result<()> {
        self.set_with_attributes(name, value, PropertyAttributes::default())
    }

    /// Values and nested templates must come from this template's isolate
    pub fn set_with_attributes<'a>(
        &self,
        name: &str,
        value: impl Into<TemplateValue<'a>>,
        attributes: PropertyAttributes,
    ) -> Result<()> {
        let value = value.into();
        match value {
            TemplateValue::Object(t) if t.isolate != self.isolate => {
                return Err(Error::IsolateMismatch)
            }
            TemplateValue::Function(t) if t.isolate != self.isolate => {
                return Err(Error::IsolateMismatch)
            }
            _ => {}
        }

        self.isolate.enter(|scope| {
            let template = v8::Local::new(scope, &self.template);
            let key = js_string(scope, name)?;
            let data: v8::Local<v8::Data> = match value {
                TemplateValue::Primitive(p) => p.to_local(scope)?.into(),
                TemplateValue::Object(t) => v8::Local::new(scope, &t.template).into(),
                TemplateValue::Function(t) => v8::Local::new(scope, &t.template).into(),
            };
            template.set_with_attr(key.into(), data, attributes.to_native());
            Ok(())
        })?
    }

    /// Create an object from this template inside `ctx`
    pub fn new_instance(&self, ctx: &Context) -> Result<Object> {
        if ctx.isolate() != &self.isolate {
            return Err(Error::IsolateMismatch);
        }
        ctx.enter(|scope| {
            let template = v8::Local::new(scope, &self.template);
            let tc = &mut v8::TryCatch::new(scope);
            let object = template.new_instance(tc);
            let object = caught(tc, object)?;
            ctx.add_value(tc, object.into()).map(Object::from_value)
        })
    }

    pub fn isolate(&self) -> &Isolate {
        &self.isolate
    }

    pub(crate) fn global(&self) -> &v8::Global<v8::ObjectTemplate> {
        &self.template
    }
}

impl std::fmt::Debug for ObjectTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectTemplate").finish_non_exhaustive()
    }
}

/// Blueprint for functions backed by a Rust closure
#[derive(Clone)]
pub struct FunctionTemplate {
    template: v8::Global<v8::FunctionTemplate>,
    isolate: Isolate,
    index: i32,
}

impl FunctionTemplate {
    /// The closure lives as long as the isolate and may be called from any
    /// context on it.
    ///
    /// Each call adds `this` and every argument to the calling context's
    /// innermost value scope, where they stay until that scope is popped. A
    /// script calling the function in a loop keeps growing the table for the
    /// whole `run_script`; wrap long-running work in
    /// [`Context::with_temporary_values`] or push a scope around it.
    pub fn new(
        isolate: &Isolate,
        callback: impl Fn(&FunctionCallbackInfo) -> Result<Option<Value>> + 'static,
    ) -> Result<Self> {
        let index = isolate.state().add_callback(Rc::new(callback));
        let template = isolate.enter(|scope| {
            let data = v8::Integer::new(scope, index);
            let template = v8::FunctionTemplate::builder(function_trampoline)
                .data(data.into())
                .build(scope);
            v8::Global::new(scope, template)
        })?;
        log::trace!("registered function callback {}", index);
        Ok(Self {
            template,
            isolate: isolate.clone(),
            index,
        })
    }

    /// Instantiate the function for `ctx`. Each context gets its own
    /// function object.
    pub fn get_function(&self, ctx: &Context) -> Result<Function> {
        if ctx.isolate() != &self.isolate {
            return Err(Error::IsolateMismatch);
        }
        ctx.enter(|scope| {
            let template = v8::Local::new(scope, &self.template);
            let tc = &mut v8::TryCatch::new(scope);
            let function = template.get_function(tc);
            let function = caught(tc, function)?;
            ctx.add_value(tc, function.into())
                .map(|v| Function::from_object(Object::from_value(v)))
        })
    }

    pub fn isolate(&self) -> &Isolate {
        &self.isolate
    }
}

impl std::fmt::Debug for FunctionTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTemplate")
            .field("callback", &self.index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextOption, ContextOptions};

    #[test]
    fn test_global_template() {
        let iso = Isolate::new();
        let global = ObjectTemplate::new(&iso).unwrap();
        global.set("version", "1.2.3").unwrap();
        global.set("answer", 42).unwrap();
        global.set("enabled", true).unwrap();

        let config = ObjectTemplate::new(&iso).unwrap();
        config.set("depth", 2.5).unwrap();
        global.set("config", &config).unwrap();

        let ctx = Context::with_options(
            ContextOptions::new()
                .with_isolate(&iso)
                .with_global_template(&global),
        )
        .unwrap();
        let value = ctx
            .run_script("`${version}:${answer}:${enabled}:${config.depth}`", "g.js")
            .unwrap();
        assert_eq!(value.to_js_string().unwrap(), "1.2.3:42:true:2.5");
        ctx.close().unwrap();
    }

    #[test]
    fn test_template_shared_between_contexts() {
        let iso = Isolate::new();
        let global = ObjectTemplate::new(&iso).unwrap();
        global.set("shared", 1).unwrap();

        let a = Context::new([
            ContextOption::Isolate(iso.clone()),
            ContextOption::GlobalTemplate(global.clone()),
        ])
        .unwrap();
        let b = Context::new([
            ContextOption::Isolate(iso.clone()),
            ContextOption::GlobalTemplate(global.clone()),
        ])
        .unwrap();

        a.run_script("shared = 100", "a.js").unwrap();
        assert_eq!(a.run_script("shared", "a.js").unwrap().to_int32().unwrap(), 100);
        assert_eq!(b.run_script("shared", "b.js").unwrap().to_int32().unwrap(), 1);

        a.close().unwrap();
        b.close().unwrap();
    }

    #[test]
    fn test_property_attributes() {
        let iso = Isolate::new();
        let template = ObjectTemplate::new(&iso).unwrap();
        template
            .set_with_attributes(
                "fixed",
                1,
                PropertyAttributes {
                    read_only: true,
                    dont_delete: true,
                    ..Default::default()
                },
            )
            .unwrap();
        template
            .set_with_attributes(
                "hidden",
                2,
                PropertyAttributes {
                    dont_enum: true,
                    ..Default::default()
                },
            )
            .unwrap();
        template.set("plain", 3).unwrap();

        let ctx = Context::new([ContextOption::Isolate(iso.clone())]).unwrap();
        let object = template.new_instance(&ctx).unwrap();
        ctx.global().unwrap().set("obj", &object).unwrap();

        ctx.run_script("obj.fixed = 99;", "w.js").unwrap();
        assert_eq!(object.get("fixed").unwrap().to_int32().unwrap(), 1);
        assert!(!object.delete("fixed").unwrap());
        assert!(object.has("fixed").unwrap());

        assert_eq!(object.keys().unwrap(), vec!["fixed", "plain"]);
        assert_eq!(object.get("hidden").unwrap().to_int32().unwrap(), 2);

        let strict = ctx.run_script("'use strict'; obj.fixed = 5;", "s.js").unwrap_err();
        assert!(strict.as_script_error().unwrap().message.starts_with("TypeError"));
        ctx.close().unwrap();
    }

    #[test]
    fn test_new_instance_creates_distinct_objects() {
        let iso = Isolate::new();
        let template = ObjectTemplate::new(&iso).unwrap();
        template.set("n", 0).unwrap();
        let ctx = Context::new([ContextOption::Isolate(iso.clone())]).unwrap();

        let first = template.new_instance(&ctx).unwrap();
        let second = template.new_instance(&ctx).unwrap();
        assert!(!first.same_value(&second).unwrap());

        let one = ctx.new_value(1).unwrap();
        first.set("n", &one).unwrap();
        assert_eq!(second.get("n").unwrap().to_int32().unwrap(), 0);
        ctx.close().unwrap();
    }

    #[test]
    fn test_function_template_in_global_template() {
        let iso = Isolate::new();
        let twice = FunctionTemplate::new(&iso, |info| {
            let n = match info.arg(0) {
                Some(arg) => arg.to_number()?,
                None => 0.0,
            };
            info.context().new_value(n * 2.0).map(Some)
        })
        .unwrap();
        let global = ObjectTemplate::new(&iso).unwrap();
        global.set("twice", &twice).unwrap();

        let ctx = Context::new([
            ContextOption::Isolate(iso.clone()),
            ContextOption::GlobalTemplate(global),
        ])
        .unwrap();
        let value = ctx.run_script("twice(21) + twice()", "t.js").unwrap();
        assert_eq!(value.to_number().unwrap(), 42.0);
        ctx.close().unwrap();
    }

    #[test]
    fn test_get_function_per_context() {
        let iso = Isolate::new();
        let template = FunctionTemplate::new(&iso, |_| Ok(None)).unwrap();
        let a = Context::new([ContextOption::Isolate(iso.clone())]).unwrap();
        let b = Context::new([ContextOption::Isolate(iso.clone())]).unwrap();

        let fa = template.get_function(&a).unwrap();
        let fb = template.get_function(&b).unwrap();
        assert_eq!(fa.context(), &a);
        assert_eq!(fb.context(), &b);
        assert!(!fa.same_value(&fb).unwrap());

        a.close().unwrap();
        b.close().unwrap();
    }

    #[test]
    fn test_templates_reject_other_isolate() {
        let iso = Isolate::new();
        let ctx = Context::new([ContextOption::Isolate(iso.clone())]).unwrap();
        let local = ObjectTemplate::new(&iso).unwrap();

        let other = Isolate::new();
        let foreign_object = ObjectTemplate::new(&other).unwrap();
        let foreign_function = FunctionTemplate::new(&other, |_| Ok(None)).unwrap();

        assert!(matches!(
            foreign_object.new_instance(&ctx),
            Err(Error::IsolateMismatch)
        ));
        assert!(matches!(
            foreign_function.get_function(&ctx),
            Err(Error::IsolateMismatch)
        ));

        assert!(matches!(
            local.set("nested", &foreign_object),
            Err(Error::IsolateMismatch)
        ));
        assert!(matches!(
            local.set("f", &foreign_function),
            Err(Error::IsolateMismatch)
        ));

        ctx.close().unwrap();
    }
}

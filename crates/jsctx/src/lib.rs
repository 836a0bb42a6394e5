//! V8 isolates, contexts and scoped value handles for Rust hosts
//!
//! This crate is a thin embedding layer over V8:
//! - [`Isolate`]: an engine instance with its own heap, shared by contexts
//! - [`Context`]: a global execution environment that runs scripts
//! - [`Value`]: a handle to a JavaScript value, valid until the value scope
//!   that created it is popped or its context is closed
//! - [`ObjectTemplate`] / [`FunctionTemplate`]: blueprints for objects and for
//!   functions implemented in Rust
//!
//! Engine handles are confined to the thread that created their isolate.
//! The one exception is [`TerminateHandle`], which can stop a running script
//! from any thread.

mod callback;
mod context;
mod error;
mod isolate;
mod object;
mod registry;
mod scope;
mod template;
mod value;

pub use callback::{FunctionCallback, FunctionCallbackInfo};
pub use context::{Context, ContextOption, ContextOptions};
pub use error::{Error, Result, ScriptError};
pub use isolate::{HeapStatistics, Isolate, IsolateBuilder, TerminateHandle};
pub use object::{Function, Object, Promise, PromiseState};
pub use registry::{Handle, HandleRegistry, INVALID_HANDLE};
pub use scope::ValueScope;
pub use template::{FunctionTemplate, ObjectTemplate, PropertyAttributes, TemplateValue};
pub use value::{Primitive, Value, ValueKind};

use deno_core::v8;
use once_cell::sync::OnceCell;

/// Process-wide V8 platform, initialized once
static V8_INIT: OnceCell<()> = OnceCell::new();

/// Initialize V8 for this process.
///
/// `flags` uses V8's command-line syntax, e.g. `"--max-old-space-size=64"`.
/// Flags only take effect on the first call; returns false when V8 was
/// already initialized, either by an earlier call or by the first isolate.
pub fn init_v8(flags: Option<&str>) -> bool {
    let mut initialized = false;
    V8_INIT.get_or_init(|| {
        if let Some(flags) = flags {
            v8::V8::set_flags_from_string(flags);
        }
        // Unprotected so isolates may be created on threads other than this one
        let platform = v8::new_unprotected_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform);
        v8::V8::initialize();
        log::debug!("V8 {} initialized", v8::V8::get_version());
        initialized = true;
    });
    initialized
}

pub(crate) fn ensure_v8() {
    init_v8(None);
}

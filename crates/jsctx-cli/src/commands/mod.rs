//! CLI command implementations

pub mod eval;
pub mod run;

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Args;
use console::style;
use jsctx::{
    Context, ContextOptions, FunctionTemplate, HeapStatistics, Isolate, ObjectTemplate,
    ScriptError, TerminateHandle, Value, ValueKind,
};
use serde::Serialize;

use crate::config::{Config, RunConfig};
use crate::OutputFormat;

/// Engine options shared by every command; flags override jsctx.toml
#[derive(Args, Debug, Default)]
pub struct EngineArgs {
    /// Configuration file (default: ./jsctx.toml if present)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Terminate scripts running longer than this many milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Flags passed to V8, e.g. "--max-old-space-size=64"
    #[arg(long)]
    pub v8_flags: Option<String>,

    /// Maximum heap size in MiB
    #[arg(long)]
    pub heap_max_mb: Option<usize>,

    /// Do not drain the microtask queue after each script
    #[arg(long)]
    pub no_microtasks: bool,

    /// Do not print script results
    #[arg(long)]
    pub no_results: bool,

    /// Report heap statistics after running
    #[arg(long)]
    pub stats: bool,
}

impl EngineArgs {
    /// Load the config file and apply command-line overrides
    pub fn resolve(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        if let Some(timeout) = self.timeout_ms {
            config.run.timeout_ms = Some(timeout);
        }
        if let Some(flags) = &self.v8_flags {
            config.engine.v8_flags = Some(flags.clone());
        }
        if let Some(max) = self.heap_max_mb {
            config.engine.heap_max_mb = Some(max);
        }
        if self.no_microtasks {
            config.run.microtask_checkpoint = false;
        }
        if self.no_results {
            config.run.print_results = false;
        }
        Ok(config)
    }
}

/// The result of evaluating one script
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub origin: String,
    /// Lines written with `print`
    pub output: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ValueKind>,
    /// The result as `String(result)` would render it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    /// The result as JSON data, when it has a JSON form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ScriptError>,
    pub elapsed_ms: u128,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// An isolate and a context that scripts share for the life of a command
pub struct Session {
    isolate: Isolate,
    context: Context,
    run: RunConfig,
    output: Rc<RefCell<Vec<String>>>,
}

impl Session {
    pub fn open(config: &Config) -> Result<Self> {
        if !jsctx::init_v8(config.engine.v8_flags.as_deref()) && config.engine.v8_flags.is_some() {
            log::warn!("V8 was already initialized, ignoring v8_flags");
        }
        let isolate = config.isolate_builder().build();
        let output = Rc::new(RefCell::new(Vec::new()));

        let global = ObjectTemplate::new(&isolate)?;
        let sink = Rc::clone(&output);
        let print = FunctionTemplate::new(&isolate, move |info| {
            let parts = info
                .args()
                .iter()
                .map(Value::to_js_string)
                .collect::<jsctx::Result<Vec<_>>>()?;
            sink.borrow_mut().push(parts.join(" "));
            Ok(None)
        })?;
        global.set("print", &print)?;

        let context = Context::with_options(
            ContextOptions::new()
                .with_isolate(&isolate)
                .with_global_template(&global),
        )?;
        log::debug!("session context {} ready", context.handle());

        Ok(Self {
            isolate,
            context,
            run: config.run.clone(),
            output,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn print_results(&self) -> bool {
        self.run.print_results
    }

    /// Run one script, then drain microtasks if configured.
    ///
    /// Script failures are reported in the outcome; only misuse of the
    /// engine surfaces as `Err`.
    pub fn evaluate(&self, source: &str, origin: &str) -> Result<Outcome> {
        let started = Instant::now();
        let watchdog = self
            .run
            .timeout_ms
            .map(|ms| Watchdog::start(self.isolate.terminate_handle(), Duration::from_millis(ms)));

        let evaluated = if self.run.temporary_values {
            self.context
                .with_temporary_values(|| self.run_and_render(source, origin))?
        } else {
            self.run_and_render(source, origin)
        };

        if let Some(watchdog) = watchdog {
            if watchdog.finish() {
                log::warn!("{}: terminated after {} ms", origin, started.elapsed().as_millis());
                self.isolate.terminate_handle().cancel_terminate_execution();
            }
        }

        let output = std::mem::take(&mut *self.output.borrow_mut());
        let mut outcome = Outcome {
            origin: origin.to_string(),
            output,
            kind: None,
            display: None,
            json: None,
            error: None,
            elapsed_ms: started.elapsed().as_millis(),
        };
        match evaluated {
            Ok(rendered) => {
                outcome.kind = Some(rendered.kind);
                outcome.display = Some(rendered.display);
                outcome.json = rendered.json;
            }
            Err(jsctx::Error::Script(err)) => outcome.error = Some(err),
            Err(err) => return Err(err.into()),
        }
        Ok(outcome)
    }

    pub fn heap_statistics(&self) -> Result<HeapStatistics> {
        Ok(self.isolate.heap_statistics()?)
    }

    pub fn close(self) -> Result<()> {
        self.context.close()?;
        Ok(())
    }

    fn run_and_render(&self, source: &str, origin: &str) -> jsctx::Result<Rendered> {
        let value = self.context.run_script(source, origin)?;
        if self.run.microtask_checkpoint {
            self.context.perform_microtask_checkpoint()?;
        }
        let kind = value.kind()?;
        let display = match value.to_js_string() {
            Ok(display) => display,
            Err(err) if err.is_script_error() => value.to_detail_string()?,
            Err(err) => return Err(err),
        };
        let json = match kind {
            ValueKind::Undefined | ValueKind::Function | ValueKind::Symbol | ValueKind::BigInt => None,
            _ => value.to_serde().ok(),
        };
        Ok(Rendered { kind, display, json })
    }
}

struct Rendered {
    kind: ValueKind,
    display: String,
    json: Option<serde_json::Value>,
}

/// Terminates the isolate if a script outlives its budget
struct Watchdog {
    stop: mpsc::Sender<()>,
    thread: JoinHandle<bool>,
}

impl Watchdog {
    fn start(handle: TerminateHandle, timeout: Duration) -> Self {
        let (stop, rx) = mpsc::channel::<()>();
        let thread = std::thread::spawn(move || match rx.recv_timeout(timeout) {
            Err(mpsc::RecvTimeoutError::Timeout) => handle.terminate_execution(),
            _ => false,
        });
        Self { stop, thread }
    }

    /// Stop watching; returns true if termination was requested
    fn finish(self) -> bool {
        let _ = self.stop.send(());
        self.thread.join().unwrap_or(false)
    }
}

/// Print an outcome in the requested format
pub fn report(outcome: &Outcome, format: OutputFormat, use_color: bool, print_result: bool) -> Result<()> {
    match format {
        OutputFormat::Text => {
            for line in &outcome.output {
                println!("{}", line);
            }
            if let Some(err) = &outcome.error {
                let text = format!("{:#}", err);
                if use_color {
                    eprintln!("{} {}", style("error:").red().bold(), text);
                } else {
                    eprintln!("error: {}", text);
                }
            } else if print_result && outcome.kind != Some(ValueKind::Undefined) {
                if let Some(display) = &outcome.display {
                    if use_color {
                        println!("{}", style(display).cyan());
                    } else {
                        println!("{}", display);
                    }
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(outcome)?);
        }
    }
    Ok(())
}

pub fn report_stats(stats: &HeapStatistics, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!();
            println!("Heap Statistics");
            println!("───────────────");
            println!("  used heap:       {:>12} bytes", stats.used_heap_size);
            println!("  total heap:      {:>12} bytes", stats.total_heap_size);
            println!("  heap limit:      {:>12} bytes", stats.heap_size_limit);
            println!("  malloced:        {:>12} bytes", stats.malloced_memory);
            println!("  native contexts: {:>12}", stats.number_of_native_contexts);
        }
        OutputFormat::Json => {
            let output = serde_json::json!({ "heap": stats });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

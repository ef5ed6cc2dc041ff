//! Compiles and runs user scripts inside a boxed environment.
//!
//! Every entry point returns an [`Outcome`]; nothing here returns `Err` to the host.
//! Each call builds a fresh [`RunContext`] (working directory, module search path,
//! `ARGV`) and applies it through an [`EnvGuard`], so the process environment is
//! restored whether the script succeeds, fails or halts.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, INT, FLOAT, AST};

use crate::canvas::{Canvas, RasterCanvas};
use crate::config::EngineLimits;
use crate::diagnostics::{self, ErrorKind, ScriptPhase, TraceContext};
use crate::gfx::{self, Graphics};
use crate::metadata::RunMetadata;
use crate::namespace::{Namespace, NamespaceTemplate};
use crate::outcome::{Outcome, Output};
use crate::run_context::{EnvGuard, RunContext, UNTITLED};
use crate::script_log::{register_output_api, OutputCapture, ScriptLogger};

/// Names of the animation hooks a script may define.
pub const HOOKS: [&str; 3] = ["setup", "draw", "stop"];

/// Mouse and keyboard state injected before each frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UiState {
    pub mouse_x: f64,
    pub mouse_y: f64,
    pub mousedown: bool,
    pub keydown: bool,
    pub key: String,
    pub keycode: i64,
}

/// The script being run. The compiled unit is dropped whenever the source changes.
#[derive(Debug, Default)]
pub struct Script {
    pub path: Option<PathBuf>,
    pub source: String,
    unit: Option<AST>,
}

impl Script {
    pub fn name(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| UNTITLED.to_string())
    }

    pub fn set_source(&mut self, source: &str) {
        if source != self.source {
            self.source = source.to_string();
            self.unit = None;
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.unit.is_some()
    }
}

fn host_template(capture: &OutputCapture) -> NamespaceTemplate {
    let ui = UiState::default();
    NamespaceTemplate::new()
        .with_global("FRAME", 1 as INT)
        .with_global("PAGENUM", 1 as INT)
        .with_global("ARGV", rhai::Array::new())
        .with_global("MOUSEX", ui.mouse_x as FLOAT)
        .with_global("MOUSEY", ui.mouse_y as FLOAT)
        .with_global("mousedown", ui.mousedown)
        .with_global("keydown", ui.keydown)
        .with_global("key", ui.key)
        .with_global("keycode", ui.keycode as INT)
        .with_global("log", Dynamic::from(ScriptLogger::new(capture.clone())))
}

pub struct ExecutionEngine {
    engine: Engine,
    script: Script,
    template: NamespaceTemplate,
    namespace: Namespace,
    graphics: Graphics,
    canvas: Box<dyn Canvas>,
    capture: OutputCapture,
    /// Globals as of the current call, visible read-only inside script functions.
    visible: Rc<RefCell<BTreeMap<String, Dynamic>>>,
    /// Persistent map bound to `this` inside animation hooks.
    anim: Dynamic,
    ui: UiState,
    crashed: bool,
}

impl ExecutionEngine {
    pub fn new(limits: &EngineLimits) -> Self {
        Self::with_canvas(limits, Box::new(RasterCanvas::new()))
    }

    pub fn with_canvas(limits: &EngineLimits, canvas: Box<dyn Canvas>) -> Self {
        let mut engine = Engine::new();
        limits.apply(&mut engine);

        let capture = OutputCapture::new(limits.max_output_entries);
        register_output_api(&mut engine, &capture);

        let graphics = Graphics::new();
        graphics.register(&mut engine);

        // script functions have no access to the caller's scope, so globals are
        // resolved from the per-call snapshot instead
        let visible: Rc<RefCell<BTreeMap<String, Dynamic>>> = Rc::default();
        let lookup = visible.clone();
        engine.on_var(move |name, _index, context| {
            if context.scope().contains(name) {
                return Ok(None);
            }
            Ok(lookup.borrow().get(name).cloned())
        });

        let template = graphics.template().merge(host_template(&capture));
        let namespace = Namespace::from_template(&template);

        Self {
            engine,
            script: Script::default(),
            template,
            namespace,
            graphics,
            canvas,
            capture,
            visible,
            anim: Dynamic::from(rhai::Map::new()),
            ui: UiState::default(),
            crashed: false,
        }
    }

    /// Merge externally supplied names into the template used for every run.
    pub fn extend_template(&mut self, extra: NamespaceTemplate) {
        self.template = std::mem::take(&mut self.template).merge(extra);
        self.namespace = Namespace::from_template(&self.template);
    }

    pub fn template(&self) -> &NamespaceTemplate {
        &self.template
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn set_path(&mut self, path: Option<PathBuf>) {
        if path != self.script.path {
            self.script.path = path;
            self.script.unit = None;
        }
    }

    pub fn set_source(&mut self, source: &str) {
        self.script.set_source(source);
    }

    pub fn set_ui_state(&mut self, ui: UiState) {
        self.ui = ui;
        self.inject_ui();
    }

    pub fn canvas(&self) -> &dyn Canvas {
        self.canvas.as_ref()
    }

    pub fn graphics(&self) -> &Graphics {
        &self.graphics
    }

    /// Frame rate requested by the script, if any.
    pub fn speed(&self) -> Option<f64> {
        self.graphics.speed()
    }

    /// Whether the last population pass defined a `draw` hook.
    pub fn animated(&self) -> bool {
        self.namespace.has_function("draw")
    }

    /// Whether the last call ended in an uncaught error.
    pub fn crashed(&self) -> bool {
        self.crashed
    }

    /// The map scripts see as `this` inside hooks.
    pub fn anim_state(&self) -> &Dynamic {
        &self.anim
    }

    fn script_dir(&self) -> Option<&Path> {
        self.script.path.as_deref().and_then(Path::parent)
    }

    /// Compile `source`. On failure the namespace holds only the template.
    pub fn compile(&mut self, source: &str) -> Outcome {
        self.script.set_source(source);
        self.script.unit = None;
        self.namespace = Namespace::from_template(&self.template);

        let name = self.script.name();
        match self.engine.compile(&self.script.source) {
            Ok(mut ast) => {
                ast.set_source(name.as_str());
                self.namespace = Namespace::from_template(&self.template).with_script_functions(&ast);
                self.script.unit = Some(ast);
                log::info!("compiled {}", name);
                Outcome::empty()
            }
            Err(err) => {
                let ctx = TraceContext {
                    script_name: &name,
                    script_dir: self.script_dir(),
                    source: &self.script.source,
                };
                let (diag, text) = diagnostics::from_parse_error(&err, &ctx);
                log::debug!("compile failed for {}: {}", name, diag.message);
                self.crashed = true;
                Outcome::failure(diag, vec![Output::stderr(text)])
            }
        }
    }

    fn ensure_compiled(&mut self) -> Option<Outcome> {
        if self.script.is_compiled() {
            return None;
        }
        let source = self.script.source.clone();
        let outcome = self.compile(&source);
        (!outcome.ok).then_some(outcome)
    }

    /// Start a fresh run: compile if needed, rebuild the namespace and reset the
    /// environment and animation state.
    fn preflight(&mut self) -> Option<Outcome> {
        self.graphics.reset_environment();
        self.crashed = false;
        self.anim = Dynamic::from(rhai::Map::new());

        if let Some(failed) = self.ensure_compiled() {
            return Some(failed);
        }
        if let Some(ast) = &self.script.unit {
            self.namespace = Namespace::from_template(&self.template).with_script_functions(ast);
        }
        self.inject_ui();
        None
    }

    fn inject_ui(&mut self) {
        let ui = &self.ui;
        let ns = &mut self.namespace;
        ns.set("MOUSEX", ui.mouse_x as FLOAT);
        ns.set("MOUSEY", ui.mouse_y as FLOAT);
        ns.set("mousedown", ui.mousedown);
        ns.set("keydown", ui.keydown);
        ns.set("key", ui.key.clone());
        ns.set("keycode", ui.keycode as INT);
    }

    /// Run the whole script (`None`) or one of its hooks inside the boxed environment.
    /// Missing hooks succeed with no output.
    pub fn call(&mut self, method: Option<&str>, meta: &RunMetadata) -> Outcome {
        if method.is_none() {
            if let Some(failed) = self.ensure_compiled() {
                meta.echo(&failed.output);
                return failed;
            }
        }
        if let Some(name) = method {
            if !self.namespace.has_function(name) {
                return Outcome::empty();
            }
        }
        let Some(ast) = self.script.unit.clone() else {
            return Outcome::empty();
        };

        let phase = ScriptPhase::for_method(method);
        let ctx = RunContext::for_script(self.script.path.as_deref(), meta);
        self.namespace.set("ARGV", ctx.argv_array());
        *self.visible.borrow_mut() = self.namespace.snapshot();
        self.engine.set_module_resolver(ctx.module_resolver());

        let result = match EnvGuard::enter(&ctx) {
            Ok(_guard) => self.invoke(&ast, method),
            Err(e) => {
                let outcome = Outcome::error(
                    ErrorKind::ConfigurationError,
                    phase,
                    format!("Cannot enter script directory {:?}: {}", ctx.cwd, e),
                );
                meta.echo(&outcome.output);
                return outcome;
            }
        };

        let outcome = match result {
            Ok(()) => Outcome::success(self.capture.take()),
            Err(err) if gfx::is_halt(&err) => {
                log::debug!("script halted in {:?}", method);
                Outcome::halted(self.capture.take())
            }
            Err(err) => self.report(phase, *err, method),
        };
        meta.echo(&outcome.output);
        outcome
    }

    fn invoke(&mut self, ast: &AST, method: Option<&str>) -> Result<(), Box<EvalAltResult>> {
        let arity = method
            .and_then(|name| self.namespace.function(name))
            .map_or(0, |f| f.arity);
        let scope = self.namespace.scope_mut();
        match method {
            None => self.engine.run_ast_with_scope(scope, ast),
            // `fn draw(anim)` receives the state map as an argument
            Some(name) if arity == 1 => {
                let shared = std::mem::take(&mut self.anim).into_shared();
                let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
                let result = self
                    .engine
                    .call_fn_with_options::<Dynamic>(options, scope, ast, name, (shared.clone(),))
                    .map(|_| ());
                self.anim = shared.flatten();
                result
            }
            Some(name) => {
                let options = CallFnOptions::new()
                    .eval_ast(false)
                    .rewind_scope(true)
                    .bind_this_ptr(&mut self.anim);
                self.engine
                    .call_fn_with_options::<Dynamic>(options, scope, ast, name, ())
                    .map(|_| ())
            }
        }
    }

    fn report(&mut self, phase: ScriptPhase, err: EvalAltResult, method: Option<&str>) -> Outcome {
        self.crashed = true;
        let name = self.script.name();
        let ctx = TraceContext {
            script_name: &name,
            script_dir: self.script_dir(),
            source: &self.script.source,
        };
        let (diag, text) =
            diagnostics::from_eval_error(phase, err, method.unwrap_or("<module>"), &ctx);
        self.capture.write(true, text);
        Outcome::failure(diag, self.capture.take())
    }

    /// Clear the canvas, reset per-frame state, inject counters and run `method`.
    /// `None` is the population pass and also resets the run.
    pub fn render(&mut self, method: Option<&str>, meta: &mut RunMetadata) -> Outcome {
        if method.is_none() {
            if let Some(failed) = self.preflight() {
                meta.echo(&failed.output);
                return failed;
            }
        }

        self.canvas.clear();
        self.graphics.reset_context();

        let (width, height) = self.graphics.size();
        self.namespace.set("WIDTH", width as INT);
        self.namespace.set("HEIGHT", height as INT);
        self.namespace.set("FRAME", meta.next as INT);
        self.namespace.set("PAGENUM", meta.next as INT);

        let outcome = self.call(method, meta);
        if outcome.ok {
            self.canvas.draw(self.graphics.take_drawing());
        }
        outcome
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("script", &self.script.name())
            .field("compiled", &self.script.is_compiled())
            .field("crashed", &self.crashed)
            .finish()
    }
}

//! Drawing built-ins exposed to scripts.
//!
//! Scripts do not paint pixels directly. Each call such as `rect(..)` records a
//! [`Grob`] into the shared [`Graphics`] state using the current style; after a
//! successful render the engine takes the recorded [`Drawing`] and hands it to the
//! canvas.
//!
//! State is split in two:
//! - the *environment* (`size`, `background`, `speed`) persists across frames and is
//!   reset only on the population pass;
//! - the *context* (fill, stroke, nib, translation stack) is reset before every frame.

use std::cell::RefCell;
use std::rc::Rc;

use rhai::{Dynamic, Engine, EvalAltResult, Position, FLOAT, INT};

use crate::namespace::NamespaceTemplate;

pub const DEFAULT_WIDTH: u32 = 512;
pub const DEFAULT_HEIGHT: u32 = 512;

/// Points per unit, for the `inch`/`cm`/`mm` constants.
pub const INCH: FLOAT = 72.0;
pub const CM: FLOAT = 28.346_457;
pub const MM: FLOAT = 2.834_645_7;

/// Value carried by the termination error raised by `halt()`.
pub const HALT_TOKEN: &str = "halt";

/// Names of the natively registered drawing functions.
pub const BUILTINS: &[&str] = &[
    "size",
    "speed",
    "background",
    "fill",
    "nofill",
    "stroke",
    "nostroke",
    "strokewidth",
    "rect",
    "oval",
    "line",
    "translate",
    "push",
    "pop",
    "halt",
];

/// RGBA color with components in 0..1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const BLACK: Color = Color::gray(0.0);
    pub const WHITE: Color = Color::gray(1.0);

    pub const fn gray(v: f32) -> Self {
        Self {
            r: v,
            g: v,
            b: v,
            a: 1.0,
        }
    }

    pub fn rgba(r: f64, g: f64, b: f64, a: f64) -> Self {
        let c = |v: f64| v.clamp(0.0, 1.0) as f32;
        Self {
            r: c(r),
            g: c(g),
            b: c(b),
            a: c(a),
        }
    }

    pub fn to_rgba8(self) -> [u8; 4] {
        let q = |v: f32| (v * 255.0).round() as u8;
        [q(self.r), q(self.g), q(self.b), q(self.a)]
    }
}

/// Paint applied to a shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Paint {
    pub fill: Option<Color>,
    pub stroke: Option<Color>,
    pub nib: f32,
}

/// A recorded graphic object, in canvas pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub enum Grob {
    Rect {
        x: f32,
        y: f32,
        w: f32,
        h: f32,
        paint: Paint,
    },
    Oval {
        x: f32,
        y: f32,
        w: f32,
        h: f32,
        paint: Paint,
    },
    Line {
        x1: f32,
        y1: f32,
        x2: f32,
        y2: f32,
        paint: Paint,
    },
}

/// Everything a canvas needs to produce one page or frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Drawing {
    pub width: u32,
    pub height: u32,
    pub background: Option<Color>,
    pub grobs: Vec<Grob>,
}

#[derive(Debug, Clone)]
struct Environment {
    width: u32,
    height: u32,
    background: Option<Color>,
    speed: Option<f64>,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            background: Some(Color::WHITE),
            speed: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Context {
    fill: Option<Color>,
    stroke: Option<Color>,
    nib: f32,
    offset: (f32, f32),
    saved: Vec<(Option<Color>, Option<Color>, f32, (f32, f32))>,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            fill: Some(Color::BLACK),
            stroke: None,
            nib: 1.0,
            offset: (0.0, 0.0),
            saved: Vec::new(),
        }
    }
}

impl Context {
    fn paint(&self) -> Paint {
        Paint {
            fill: self.fill,
            stroke: self.stroke,
            nib: self.nib,
        }
    }
}

#[derive(Debug, Default)]
struct GraphicsState {
    env: Environment,
    ctx: Context,
    grobs: Vec<Grob>,
}

/// Shared drawing state, cloned into every registered closure.
#[derive(Debug, Clone, Default)]
pub struct Graphics {
    state: Rc<RefCell<GraphicsState>>,
}

type FnResult = Result<(), Box<EvalAltResult>>;

fn num(v: &Dynamic) -> Result<f64, Box<EvalAltResult>> {
    if let Ok(f) = v.as_float() {
        return Ok(f as f64);
    }
    if let Ok(i) = v.as_int() {
        return Ok(i as f64);
    }
    Err(format!("expected a number, got {}", v.type_name()).into())
}

fn dimension(v: &Dynamic, what: &str) -> Result<u32, Box<EvalAltResult>> {
    let n = num(v)?;
    if !(1.0..=16_384.0).contains(&n) {
        return Err(format!("{} must be between 1 and 16384, got {}", what, n).into());
    }
    Ok(n.round() as u32)
}

impl Graphics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset size, background and speed (population pass).
    pub fn reset_environment(&self) {
        self.state.borrow_mut().env = Environment::default();
    }

    /// Reset per-frame style and discard recorded shapes.
    pub fn reset_context(&self) {
        let mut state = self.state.borrow_mut();
        state.ctx = Context::default();
        state.grobs.clear();
    }

    /// Frame rate requested by `speed()`, if any.
    pub fn speed(&self) -> Option<f64> {
        self.state.borrow().env.speed
    }

    pub fn size(&self) -> (u32, u32) {
        let env = &self.state.borrow().env;
        (env.width, env.height)
    }

    /// Move the recorded shapes out, along with the environment they were drawn in.
    pub fn take_drawing(&self) -> Drawing {
        let mut state = self.state.borrow_mut();
        Drawing {
            width: state.env.width,
            height: state.env.height,
            background: state.env.background,
            grobs: std::mem::take(&mut state.grobs),
        }
    }

    fn with_env(&self, f: impl FnOnce(&mut Environment)) {
        f(&mut self.state.borrow_mut().env);
    }

    fn with_ctx(&self, f: impl FnOnce(&mut Context)) {
        f(&mut self.state.borrow_mut().ctx);
    }

    fn record(&self, make: impl FnOnce((f32, f32), Paint) -> Grob) {
        let mut state = self.state.borrow_mut();
        let grob = make(state.ctx.offset, state.ctx.paint());
        state.grobs.push(grob);
    }

    fn shape(&self, oval: bool, x: &Dynamic, y: &Dynamic, w: &Dynamic, h: &Dynamic) -> FnResult {
        let (x, y, w, h) = (num(x)? as f32, num(y)? as f32, num(w)? as f32, num(h)? as f32);
        self.record(|(dx, dy), paint| {
            let (x, y) = (x + dx, y + dy);
            if oval {
                Grob::Oval { x, y, w, h, paint }
            } else {
                Grob::Rect { x, y, w, h, paint }
            }
        });
        Ok(())
    }

    /// Values seeded into every fresh namespace.
    pub fn template(&self) -> NamespaceTemplate {
        NamespaceTemplate::new()
            .with_global("WIDTH", DEFAULT_WIDTH as INT)
            .with_global("HEIGHT", DEFAULT_HEIGHT as INT)
            .with_global("inch", INCH)
            .with_global("cm", CM)
            .with_global("mm", MM)
            .with_builtins(BUILTINS.iter().copied())
    }

    /// Register the drawing functions on `engine`.
    pub fn register(&self, engine: &mut Engine) {
        let g = self.clone();
        engine.register_fn("size", move |w: Dynamic, h: Dynamic| -> FnResult {
            let (w, h) = (dimension(&w, "width")?, dimension(&h, "height")?);
            g.with_env(|env| {
                env.width = w;
                env.height = h;
            });
            Ok(())
        });

        let g = self.clone();
        engine.register_fn("speed", move |fps: Dynamic| -> FnResult {
            let fps = num(&fps)?;
            if fps < 0.0 {
                return Err(format!("speed must not be negative, got {}", fps).into());
            }
            g.with_env(|env| env.speed = Some(fps));
            Ok(())
        });

        self.register_color(engine, "background", |g, c| g.with_env(|env| env.background = Some(c)));
        self.register_color(engine, "fill", |g, c| g.with_ctx(|ctx| ctx.fill = Some(c)));
        self.register_color(engine, "stroke", |g, c| g.with_ctx(|ctx| ctx.stroke = Some(c)));

        let g = self.clone();
        engine.register_fn("nofill", move || g.with_ctx(|ctx| ctx.fill = None));
        let g = self.clone();
        engine.register_fn("nostroke", move || g.with_ctx(|ctx| ctx.stroke = None));

        let g = self.clone();
        engine.register_fn("strokewidth", move |w: Dynamic| -> FnResult {
            let w = num(&w)?.max(0.0) as f32;
            g.with_ctx(|ctx| ctx.nib = w);
            Ok(())
        });

        let g = self.clone();
        engine.register_fn(
            "rect",
            move |x: Dynamic, y: Dynamic, w: Dynamic, h: Dynamic| g.shape(false, &x, &y, &w, &h),
        );
        let g = self.clone();
        engine.register_fn(
            "oval",
            move |x: Dynamic, y: Dynamic, w: Dynamic, h: Dynamic| g.shape(true, &x, &y, &w, &h),
        );

        let g = self.clone();
        engine.register_fn(
            "line",
            move |x1: Dynamic, y1: Dynamic, x2: Dynamic, y2: Dynamic| -> FnResult {
                let (x1, y1) = (num(&x1)? as f32, num(&y1)? as f32);
                let (x2, y2) = (num(&x2)? as f32, num(&y2)? as f32);
                g.record(|(dx, dy), paint| Grob::Line {
                    x1: x1 + dx,
                    y1: y1 + dy,
                    x2: x2 + dx,
                    y2: y2 + dy,
                    paint,
                });
                Ok(())
            },
        );

        let g = self.clone();
        engine.register_fn("translate", move |x: Dynamic, y: Dynamic| -> FnResult {
            let (x, y) = (num(&x)? as f32, num(&y)? as f32);
            g.with_ctx(|ctx| {
                ctx.offset.0 += x;
                ctx.offset.1 += y;
            });
            Ok(())
        });

        let g = self.clone();
        engine.register_fn("push", move || {
            g.with_ctx(|ctx| {
                let saved = (ctx.fill, ctx.stroke, ctx.nib, ctx.offset);
                ctx.saved.push(saved);
            })
        });

        let g = self.clone();
        engine.register_fn("pop", move || -> FnResult {
            let mut state = g.state.borrow_mut();
            let ctx = &mut state.ctx;
            match ctx.saved.pop() {
                Some((fill, stroke, nib, offset)) => {
                    ctx.fill = fill;
                    ctx.stroke = stroke;
                    ctx.nib = nib;
                    ctx.offset = offset;
                    Ok(())
                }
                None => Err("pop() without matching push()".into()),
            }
        });

        engine.register_fn("halt", || -> FnResult {
            Err(EvalAltResult::ErrorTerminated(HALT_TOKEN.into(), Position::NONE).into())
        });
    }

    fn register_color(
        &self,
        engine: &mut Engine,
        name: &str,
        apply: fn(&Graphics, Color),
    ) {
        let g = self.clone();
        engine.register_fn(name, move |v: Dynamic| -> FnResult {
            let v = num(&v)?;
            apply(&g, Color::rgba(v, v, v, 1.0));
            Ok(())
        });
        let g = self.clone();
        engine.register_fn(name, move |r: Dynamic, gr: Dynamic, b: Dynamic| -> FnResult {
            apply(&g, Color::rgba(num(&r)?, num(&gr)?, num(&b)?, 1.0));
            Ok(())
        });
        let g = self.clone();
        engine.register_fn(
            name,
            move |r: Dynamic, gr: Dynamic, b: Dynamic, a: Dynamic| -> FnResult {
                apply(&g, Color::rgba(num(&r)?, num(&gr)?, num(&b)?, num(&a)?));
                Ok(())
            },
        );
    }
}

/// True if `err` is (or wraps) the termination raised by `halt()`.
pub fn is_halt(err: &EvalAltResult) -> bool {
    match err {
        EvalAltResult::ErrorTerminated(token, _) => {
            token.clone().into_string().map_or(false, |s| s == HALT_TOKEN)
        }
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => is_halt(inner),
        EvalAltResult::ErrorInModule(_, inner, _) => is_halt(inner),
        _ => false,
    }
}

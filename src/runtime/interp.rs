//! Default evaluator: a very small Lisp over [`Sexp`] values.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

use super::{Binding, EvalContext, EvalError, Evaluator, Introspector};
use crate::protocol::sexp::{parse_all, Sexp};

const CORE_NAMESPACE: &str = "core";
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// (name, indentation) for special forms with a body.
const SPECIAL_FORMS: &[(&str, i64)] = &[
    ("quote", -1),
    ("def", 1),
    ("do", 0),
    ("if", 1),
    ("in-ns", -1),
    ("throw", -1),
    ("load-file", -1),
];

/// (name, arglist, doc)
const BUILTINS: &[(&str, &str, &str)] = &[
    ("+", "([& xs])", "Returns the sum of the integers."),
    ("-", "([x & ys])", "Subtracts ys from x, or negates a single x."),
    ("*", "([& xs])", "Returns the product of the integers."),
    ("/", "([x & ys])", "Integer division of x by each y."),
    ("=", "([x & more])", "True when all arguments are equal."),
    ("<", "([x & more])", "True when the integers increase strictly."),
    (">", "([x & more])", "True when the integers decrease strictly."),
    ("<=", "([x & more])", "True when the integers never decrease."),
    (">=", "([x & more])", "True when the integers never increase."),
    ("inc", "([x])", "Returns x plus one."),
    ("dec", "([x])", "Returns x minus one."),
    ("not", "([x])", "True when x is nil."),
    ("str", "([& xs])", "Concatenates the printed arguments."),
    ("list", "([& xs])", "Returns a list of the arguments."),
    ("count", "([coll])", "Number of items in a list or characters in a string."),
    ("first", "([coll])", "First item of a list, or nil."),
    ("rest", "([coll])", "All but the first item of a list."),
    ("println", "([& xs])", "Prints the arguments followed by a newline."),
    ("print", "([& xs])", "Prints the arguments."),
    ("read-line", "([])", "Reads one line of input from the client."),
    ("y-or-n?", "([prompt])", "Asks the client a yes or no question."),
    ("sleep", "([ms])", "Sleeps for ms milliseconds; interruptible."),
    ("doc", "([name])", "Returns the documentation of a name."),
];

#[derive(Debug, Clone)]
struct Entry {
    value: Sexp,
    doc: Option<String>,
    file: Option<String>,
    line: Option<usize>,
}

/// Where the form being evaluated was read from.
#[derive(Debug, Clone, Copy)]
struct Origin<'a> {
    file: &'a str,
    line: usize,
}

#[derive(Debug, Default)]
pub struct Interp {
    namespaces: RwLock<HashMap<String, HashMap<String, Entry>>>,
}

impl Interp {
    pub fn new() -> Self {
        Self::default()
    }

    fn eval(
        &self,
        form: &Sexp,
        ctx: &mut EvalContext,
        origin: Option<Origin<'_>>,
    ) -> Result<Sexp, EvalError> {
        ctx.check_interrupt()?;
        match form {
            Sexp::Symbol(name) => self.lookup(name, ctx.namespace()),
            Sexp::List(items) if !items.is_empty() => self.eval_list(items, ctx, origin),
            other => Ok(other.clone()),
        }
    }

    fn lookup(&self, name: &str, namespace: &str) -> Result<Sexp, EvalError> {
        let (ns, local) = split_qualified(name, namespace);
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        namespaces
            .get(ns)
            .and_then(|entries| entries.get(local))
            .map(|entry| entry.value.clone())
            .ok_or_else(|| EvalError::Undefined(name.to_string()))
    }

    fn eval_list(
        &self,
        items: &[Sexp],
        ctx: &mut EvalContext,
        origin: Option<Origin<'_>>,
    ) -> Result<Sexp, EvalError> {
        let (head, args) = items.split_first().ok_or(EvalError::Type("empty call".into()))?;
        let Some(op) = head.as_symbol() else {
            return Err(EvalError::Type(format!("{head} is not a function")));
        };

        match op {
            "quote" => {
                expect_arity(op, args, 1)?;
                Ok(args[0].clone())
            }
            "def" => self.eval_def(args, ctx, origin),
            "do" => {
                let mut last = Sexp::Nil;
                for form in args {
                    last = self.eval(form, ctx, origin)?;
                }
                Ok(last)
            }
            "if" => {
                if !(2..=3).contains(&args.len()) {
                    return Err(EvalError::Arity {
                        name: op.into(),
                        got: args.len(),
                    });
                }
                if self.eval(&args[0], ctx, origin)?.is_truthy() {
                    self.eval(&args[1], ctx, origin)
                } else {
                    args.get(2)
                        .map_or(Ok(Sexp::Nil), |form| self.eval(form, ctx, origin))
                }
            }
            "in-ns" => {
                expect_arity(op, args, 1)?;
                let name = match self.eval(&args[0], ctx, origin)? {
                    Sexp::Symbol(name) | Sexp::Str(name) => name,
                    other => return Err(EvalError::Type(format!("in-ns expects a name, got {other}"))),
                };
                self.namespaces
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(name.clone())
                    .or_default();
                ctx.set_namespace(name.clone());
                Ok(Sexp::Symbol(name))
            }
            "throw" => {
                expect_arity(op, args, 1)?;
                let value = self.eval(&args[0], ctx, origin)?;
                Err(EvalError::Raised(value.display_value()))
            }
            "load-file" => {
                expect_arity(op, args, 1)?;
                let path = self.eval(&args[0], ctx, origin)?;
                let path = path
                    .as_str()
                    .ok_or_else(|| EvalError::Type("load-file expects a string path".into()))?;
                self.load_file(path, ctx)
            }
            _ => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, ctx, origin)?);
                }
                apply(op, &values, ctx, self)
            }
        }
    }

    fn eval_def(
        &self,
        args: &[Sexp],
        ctx: &mut EvalContext,
        origin: Option<Origin<'_>>,
    ) -> Result<Sexp, EvalError> {
        let (name, doc, value_form) = match args {
            [name, value] => (name, None, value),
            [name, Sexp::Str(doc), value] => (name, Some(doc.clone()), value),
            _ => {
                return Err(EvalError::Arity {
                    name: "def".into(),
                    got: args.len(),
                })
            }
        };
        let name = name
            .as_symbol()
            .ok_or_else(|| EvalError::Type(format!("def expects a symbol, got {name}")))?;
        let value = self.eval(value_form, ctx, origin)?;

        let namespace = ctx.namespace().to_string();
        self.namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(namespace.clone())
            .or_default()
            .insert(
                name.to_string(),
                Entry {
                    value,
                    doc,
                    file: origin.map(|o| o.file.to_string()),
                    line: origin.map(|o| o.line),
                },
            );
        Ok(Sexp::symbol(format!("#'{namespace}/{name}")))
    }

    fn load_file(&self, path: &str, ctx: &mut EvalContext) -> Result<Sexp, EvalError> {
        let load_error = |message: String| EvalError::Load {
            path: path.to_string(),
            message,
        };
        let text = std::fs::read_to_string(Path::new(path)).map_err(|e| load_error(e.to_string()))?;
        let forms = parse_all(&text).map_err(|e| load_error(e.to_string()))?;
        debug!("Loading {} forms from {}", forms.len(), path);

        let mut last = Sexp::Nil;
        for (line, form) in &forms {
            last = self.eval(form, ctx, Some(Origin { file: path, line: *line }))?;
        }
        Ok(last)
    }

    fn user_binding(&self, name: &str, namespace: &str) -> Option<Binding> {
        let (ns, local) = split_qualified(name, namespace);
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        let entry = namespaces.get(ns)?.get(local)?;
        Some(Binding {
            name: local.to_string(),
            namespace: ns.to_string(),
            arglist: None,
            doc: entry.doc.clone(),
            file: entry.file.clone(),
            line: entry.line,
        })
    }
}

impl Evaluator for Interp {
    fn evaluate(&self, form: &Sexp, ctx: &mut EvalContext) -> Result<Sexp, EvalError> {
        self.eval(form, ctx, None)
    }
}

impl Introspector for Interp {
    fn resolve(&self, name: &str, namespace: &str) -> Option<Binding> {
        if let Some(binding) = self.user_binding(name, namespace) {
            return Some(binding);
        }
        if let Some((_, arglist, doc)) = BUILTINS.iter().find(|(n, _, _)| *n == name) {
            return Some(Binding {
                name: name.to_string(),
                namespace: CORE_NAMESPACE.to_string(),
                arglist: Some(arglist.to_string()),
                doc: Some(doc.to_string()),
                ..Binding::default()
            });
        }
        SPECIAL_FORMS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|_| Binding {
                name: name.to_string(),
                namespace: CORE_NAMESPACE.to_string(),
                doc: Some("Special form.".to_string()),
                ..Binding::default()
            })
    }

    fn list_bindings_starting_with(&self, prefix: &str, namespace: &str) -> BTreeSet<String> {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        let user = namespaces
            .get(namespace)
            .into_iter()
            .flat_map(|entries| entries.keys().map(String::as_str));
        let core = BUILTINS
            .iter()
            .map(|(name, _, _)| *name)
            .chain(SPECIAL_FORMS.iter().map(|(name, _)| *name));

        user.chain(core)
            .filter(|name| name.starts_with(prefix))
            .map(str::to_string)
            .collect()
    }

    fn indentation_hints(&self, _namespace: &str) -> Vec<(String, i64)> {
        SPECIAL_FORMS
            .iter()
            .filter(|(_, indent)| *indent >= 0)
            .map(|(name, indent)| (name.to_string(), *indent))
            .collect()
    }
}

fn split_qualified<'a>(name: &'a str, namespace: &'a str) -> (&'a str, &'a str) {
    match name.split_once('/') {
        Some((ns, local)) if !ns.is_empty() && !local.is_empty() => (ns, local),
        _ => (namespace, name),
    }
}

fn expect_arity(name: &str, args: &[Sexp], expected: usize) -> Result<(), EvalError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(EvalError::Arity {
            name: name.to_string(),
            got: args.len(),
        })
    }
}

fn ints(name: &str, args: &[Sexp]) -> Result<Vec<i64>, EvalError> {
    args.iter()
        .map(|arg| {
            arg.as_int()
                .ok_or_else(|| EvalError::Type(format!("{name} expects integers, got {arg}")))
        })
        .collect()
}

fn overflow() -> EvalError {
    EvalError::Raised("integer overflow".to_string())
}

fn fold_ints(
    name: &str,
    args: &[Sexp],
    init: i64,
    op: impl Fn(i64, i64) -> Option<i64>,
) -> Result<Sexp, EvalError> {
    let mut acc = init;
    for n in ints(name, args)? {
        acc = op(acc, n).ok_or_else(overflow)?;
    }
    Ok(Sexp::Int(acc))
}

fn compare(name: &str, args: &[Sexp], ok: impl Fn(i64, i64) -> bool) -> Result<Sexp, EvalError> {
    if args.is_empty() {
        return Err(EvalError::Arity {
            name: name.to_string(),
            got: 0,
        });
    }
    let values = ints(name, args)?;
    Ok(Sexp::bool(values.windows(2).all(|pair| ok(pair[0], pair[1]))))
}

fn joined(args: &[Sexp], separator: &str) -> String {
    args.iter()
        .map(|arg| match arg {
            Sexp::Nil => String::new(),
            other => other.display_value(),
        })
        .collect::<Vec<_>>()
        .join(separator)
}

fn apply(name: &str, args: &[Sexp], ctx: &EvalContext, interp: &Interp) -> Result<Sexp, EvalError> {
    match name {
        "+" => fold_ints(name, args, 0, i64::checked_add),
        "*" => fold_ints(name, args, 1, i64::checked_mul),
        "-" => match ints(name, args)?.as_slice() {
            [] => Err(EvalError::Arity {
                name: name.into(),
                got: 0,
            }),
            [x] => x.checked_neg().map(Sexp::Int).ok_or_else(overflow),
            [x, rest @ ..] => rest
                .iter()
                .try_fold(*x, |acc, n| acc.checked_sub(*n))
                .map(Sexp::Int)
                .ok_or_else(overflow),
        },
        "/" => {
            let values = ints(name, args)?;
            let (first, rest) = match values.as_slice() {
                [] => {
                    return Err(EvalError::Arity {
                        name: name.into(),
                        got: 0,
                    })
                }
                [x] => (1, vec![*x]),
                [x, rest @ ..] => (*x, rest.to_vec()),
            };
            let mut acc = first;
            for divisor in rest {
                if divisor == 0 {
                    return Err(EvalError::DivideByZero);
                }
                acc = acc.checked_div(divisor).ok_or_else(overflow)?;
            }
            Ok(Sexp::Int(acc))
        }
        "=" => match args.split_first() {
            Some((first, rest)) => Ok(Sexp::bool(rest.iter().all(|arg| arg == first))),
            None => Err(EvalError::Arity {
                name: name.into(),
                got: 0,
            }),
        },
        "<" => compare(name, args, |a, b| a < b),
        ">" => compare(name, args, |a, b| a > b),
        "<=" => compare(name, args, |a, b| a <= b),
        ">=" => compare(name, args, |a, b| a >= b),
        "inc" | "dec" => {
            expect_arity(name, args, 1)?;
            let x = ints(name, args)?[0];
            let result = if name == "inc" {
                x.checked_add(1)
            } else {
                x.checked_sub(1)
            };
            result.map(Sexp::Int).ok_or_else(overflow)
        }
        "not" => {
            expect_arity(name, args, 1)?;
            Ok(Sexp::bool(!args[0].is_truthy()))
        }
        "str" => Ok(Sexp::Str(joined(args, ""))),
        "list" => Ok(Sexp::List(args.to_vec())),
        "count" => {
            expect_arity(name, args, 1)?;
            let n = match &args[0] {
                Sexp::Str(s) => s.chars().count(),
                other => other
                    .as_list()
                    .ok_or_else(|| EvalError::Type(format!("count not supported on {other}")))?
                    .len(),
            };
            Ok(Sexp::Int(n as i64))
        }
        "first" | "rest" => {
            expect_arity(name, args, 1)?;
            let items = args[0]
                .as_list()
                .ok_or_else(|| EvalError::Type(format!("{name} expects a list, got {}", args[0])))?;
            Ok(if name == "first" {
                items.first().cloned().unwrap_or(Sexp::Nil)
            } else {
                Sexp::List(items.iter().skip(1).cloned().collect())
            })
        }
        "println" => {
            ctx.console().write_output(&format!("{}\n", joined(args, " ")));
            Ok(Sexp::Nil)
        }
        "print" => {
            ctx.console().write_output(&joined(args, " "));
            Ok(Sexp::Nil)
        }
        "read-line" => {
            expect_arity(name, args, 0)?;
            ctx.console().read_line().map(Sexp::Str)
        }
        "y-or-n?" => {
            expect_arity(name, args, 1)?;
            ctx.console()
                .y_or_n(&args[0].display_value())
                .map(Sexp::bool)
        }
        "sleep" => {
            expect_arity(name, args, 1)?;
            let ms = ints(name, args)?[0].max(0) as u64;
            let deadline = Instant::now() + Duration::from_millis(ms);
            loop {
                ctx.check_interrupt()?;
                let now = Instant::now();
                if now >= deadline {
                    return Ok(Sexp::Nil);
                }
                std::thread::sleep(SLEEP_SLICE.min(deadline - now));
            }
        }
        "doc" => {
            expect_arity(name, args, 1)?;
            let target = args[0].display_value();
            Ok(interp
                .doc(&target, ctx.namespace())
                .map_or(Sexp::Nil, Sexp::Str))
        }
        _ => {
            if interp.lookup(name, ctx.namespace()).is_ok() {
                Err(EvalError::Type(format!("{name} is not a function")))
            } else {
                Err(EvalError::Undefined(name.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sexp::parse;
    use crate::runtime::test_support::{context, RecordingConsole};
    use std::sync::Arc;

    fn eval_str(interp: &Interp, ctx: &mut EvalContext, text: &str) -> Result<Sexp, EvalError> {
        interp.evaluate(&parse(text).expect("parse form"), ctx)
    }

    #[test]
    fn arithmetic() {
        let interp = Interp::new();
        let (mut ctx, _) = context(Arc::new(RecordingConsole::default()));
        assert_eq!(eval_str(&interp, &mut ctx, "(+ 1 2)"), Ok(Sexp::Int(3)));
        assert_eq!(eval_str(&interp, &mut ctx, "(- 10 3 2)"), Ok(Sexp::Int(5)));
        assert_eq!(eval_str(&interp, &mut ctx, "(- 4)"), Ok(Sexp::Int(-4)));
        assert_eq!(eval_str(&interp, &mut ctx, "(* 2 (inc 2))"), Ok(Sexp::Int(6)));
        assert_eq!(eval_str(&interp, &mut ctx, "(/ 7 2)"), Ok(Sexp::Int(3)));
        assert_eq!(eval_str(&interp, &mut ctx, "(< 1 2 3)"), Ok(Sexp::T));
        assert_eq!(eval_str(&interp, &mut ctx, "(= 1 2)"), Ok(Sexp::Nil));
    }

    #[test]
    fn division_by_zero_raises() {
        let interp = Interp::new();
        let (mut ctx, _) = context(Arc::new(RecordingConsole::default()));
        assert_eq!(
            eval_str(&interp, &mut ctx, "(/ 1 0)"),
            Err(EvalError::DivideByZero)
        );
    }

    #[test]
    fn def_binds_in_current_namespace() {
        let interp = Interp::new();
        let (mut ctx, _) = context(Arc::new(RecordingConsole::default()));
        assert_eq!(
            eval_str(&interp, &mut ctx, "(def answer \"The answer.\" 42)"),
            Ok(Sexp::symbol("#'user/answer"))
        );
        assert_eq!(eval_str(&interp, &mut ctx, "answer"), Ok(Sexp::Int(42)));
        assert_eq!(eval_str(&interp, &mut ctx, "user/answer"), Ok(Sexp::Int(42)));
        assert_eq!(
            interp.doc("answer", "user").as_deref(),
            Some("The answer.")
        );
    }

    #[test]
    fn in_ns_switches_namespace() {
        let interp = Interp::new();
        let (mut ctx, _) = context(Arc::new(RecordingConsole::default()));
        eval_str(&interp, &mut ctx, "(in-ns 'scratch)").expect("in-ns");
        assert_eq!(ctx.changed_namespace(), Some("scratch"));
        eval_str(&interp, &mut ctx, "(def x 1)").expect("def");
        assert!(interp.resolve("x", "scratch").is_some());
        assert!(interp.resolve("x", "user").is_none());
    }

    #[test]
    fn undefined_symbols_and_operators() {
        let interp = Interp::new();
        let (mut ctx, _) = context(Arc::new(RecordingConsole::default()));
        assert_eq!(
            eval_str(&interp, &mut ctx, "missing"),
            Err(EvalError::Undefined("missing".into()))
        );
        assert_eq!(
            eval_str(&interp, &mut ctx, "(frobnicate 1)"),
            Err(EvalError::Undefined("frobnicate".into()))
        );
    }

    #[test]
    fn throw_raises_message() {
        let interp = Interp::new();
        let (mut ctx, _) = context(Arc::new(RecordingConsole::default()));
        assert_eq!(
            eval_str(&interp, &mut ctx, "(throw (str \"bad \" 1))"),
            Err(EvalError::Raised("bad 1".into()))
        );
    }

    #[test]
    fn println_writes_to_console() {
        let interp = Interp::new();
        let console = Arc::new(RecordingConsole::default());
        let (mut ctx, _) = context(Arc::clone(&console));
        eval_str(&interp, &mut ctx, "(println \"hello\" 42)").expect("println");
        assert_eq!(*console.output.lock().expect("output"), "hello 42\n");
    }

    #[test]
    fn read_line_uses_console_input() {
        let interp = Interp::new();
        let console = Arc::new(RecordingConsole::default());
        console.input.lock().expect("input").push_back("typed".into());
        let (mut ctx, _) = context(Arc::clone(&console));
        assert_eq!(
            eval_str(&interp, &mut ctx, "(str \"got \" (read-line))"),
            Ok(Sexp::string("got typed"))
        );
    }

    #[test]
    fn raised_interrupt_stops_sleep() {
        let interp = Interp::new();
        let (mut ctx, interrupt) = context(Arc::new(RecordingConsole::default()));
        interrupt.raise();
        assert_eq!(
            eval_str(&interp, &mut ctx, "(sleep 10000)"),
            Err(EvalError::Interrupted)
        );
    }

    #[test]
    fn load_file_records_definition_lines() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("defs.clj");
        std::fs::write(&path, "; header\n(def first-thing 1)\n\n(def second-thing\n  2)\n")
            .expect("write source");
        let path = path.to_str().expect("utf8 path").to_string();

        let interp = Interp::new();
        let (mut ctx, _) = context(Arc::new(RecordingConsole::default()));
        eval_str(&interp, &mut ctx, &format!("(load-file {})", Sexp::string(path.clone())))
            .expect("load file");

        let binding = interp.resolve("second-thing", "user").expect("binding");
        assert_eq!(binding.file.as_deref(), Some(path.as_str()));
        assert_eq!(binding.line, Some(4));
    }

    #[test]
    fn completions_cover_user_and_core_names() {
        let interp = Interp::new();
        let (mut ctx, _) = context(Arc::new(RecordingConsole::default()));
        eval_str(&interp, &mut ctx, "(def decimal 10)").expect("def");
        let names: Vec<String> = interp
            .list_bindings_starting_with("de", "user")
            .into_iter()
            .collect();
        assert_eq!(names, vec!["dec", "decimal", "def"]);
    }
}

//! Editor operations called as `(swank/NAME args...)`.
//!
//! Arguments arrive as literals and are not evaluated; a quoted argument is
//! unwrapped. Each operation runs inside the evaluation actor and answers
//! with a plain [`Sexp`] that becomes the `(:ok value)` of the return.

use std::path::PathBuf;

use tracing::debug;

use super::{EvalContext, EvalError, Runtime};
use crate::config::CommunicationStyle;
use crate::protocol::sexp::{parse_all, Sexp};
use crate::protocol::{IMPLEMENTATION_NAME, PROTOCOL_VERSION, RPC_NAMESPACE};

/// Split `(swank/op args...)` into the operation name and its arguments.
pub fn as_call(form: &Sexp) -> Option<(&str, &[Sexp])> {
    let (head, args) = form.as_list()?.split_first()?;
    let op = head
        .as_symbol()?
        .strip_prefix(RPC_NAMESPACE)?
        .strip_prefix('/')?;
    Some((op, args))
}

pub fn call(
    runtime: &Runtime,
    op: &str,
    args: &[Sexp],
    ctx: &mut EvalContext,
) -> Result<Sexp, EvalError> {
    debug!("RPC {} from actor {}", op, ctx.actor());
    match op {
        "connection-info" => Ok(connection_info(runtime, ctx)),
        "create-repl" => {
            let ns = Sexp::string(ctx.namespace());
            Ok(Sexp::list([ns.clone(), ns]))
        }
        "interactive-eval" => {
            let value = eval_text(runtime, &text_arg(op, args, 0)?, ctx)?;
            Ok(Sexp::string(format!("=> {value}")))
        }
        "listener-eval" => {
            let value = eval_text(runtime, &text_arg(op, args, 0)?, ctx)?;
            ctx.console().write_result(&format!("{value}\n"));
            Ok(Sexp::Nil)
        }
        "simple-completions" => {
            let prefix = text_arg(op, args, 0)?;
            let namespace = namespace_arg(args, 1, ctx);
            let matches: Vec<String> = runtime
                .introspector
                .list_bindings_starting_with(&prefix, &namespace)
                .into_iter()
                .collect();
            let common = longest_common_prefix(&matches).unwrap_or(prefix);
            Ok(Sexp::list([
                Sexp::list(matches.into_iter().map(Sexp::Str)),
                Sexp::Str(common),
            ]))
        }
        "operator-arglist" => {
            let name = text_arg(op, args, 0)?;
            let namespace = namespace_arg(args, 1, ctx);
            Ok(runtime
                .introspector
                .resolve(&name, &namespace)
                .and_then(|binding| binding.arglist)
                .map_or(Sexp::Nil, Sexp::Str))
        }
        "documentation-symbol" => {
            let name = text_arg(op, args, 0)?;
            let doc = runtime
                .introspector
                .doc(&name, ctx.namespace())
                .unwrap_or_else(|| format!("No documentation for {name}"));
            Ok(Sexp::Str(doc))
        }
        "find-definitions-for-emacs" => {
            let name = text_arg(op, args, 0)?;
            Ok(find_definitions(runtime, &name, ctx))
        }
        "load-file" => {
            let path = text_arg(op, args, 0)?;
            let form = Sexp::list([Sexp::symbol("load-file"), Sexp::Str(path)]);
            runtime.evaluator.evaluate(&form, ctx)
        }
        "default-directory" => Ok(Sexp::Str(
            runtime.host.working_directory().display().to_string(),
        )),
        "buffer-first-change" => Ok(Sexp::Nil),
        "quit-lisp" => {
            ctx.console().request_quit();
            Ok(Sexp::Nil)
        }
        other => Err(EvalError::Undefined(format!("{RPC_NAMESPACE}/{other}"))),
    }
}

fn unquote(arg: &Sexp) -> &Sexp {
    match arg.as_list() {
        Some([Sexp::Symbol(head), inner]) if head == "quote" => inner,
        _ => arg,
    }
}

fn text_arg(op: &str, args: &[Sexp], index: usize) -> Result<String, EvalError> {
    match args.get(index).map(unquote) {
        Some(Sexp::Str(s) | Sexp::Symbol(s)) => Ok(s.clone()),
        Some(other) => Err(EvalError::Type(format!(
            "{RPC_NAMESPACE}/{op} expects a string, got {other}"
        ))),
        None => Err(EvalError::Arity {
            name: format!("{RPC_NAMESPACE}/{op}"),
            got: args.len(),
        }),
    }
}

fn namespace_arg(args: &[Sexp], index: usize, ctx: &EvalContext) -> String {
    match args.get(index).map(unquote) {
        Some(Sexp::Str(s) | Sexp::Symbol(s)) => s.clone(),
        _ => ctx.namespace().to_string(),
    }
}

/// Read and evaluate every form in `text`, returning the last value.
fn eval_text(runtime: &Runtime, text: &str, ctx: &mut EvalContext) -> Result<Sexp, EvalError> {
    let forms = parse_all(text).map_err(|e| EvalError::Raised(e.to_string()))?;
    let mut last = Sexp::Nil;
    for (_, form) in &forms {
        last = runtime.evaluator.evaluate(form, ctx)?;
    }
    Ok(last)
}

fn connection_info(runtime: &Runtime, ctx: &EvalContext) -> Sexp {
    let connection = ctx.connection();
    let style = match connection.style {
        CommunicationStyle::Spawn => Sexp::keyword("spawn"),
        CommunicationStyle::None => Sexp::Nil,
    };
    let namespace = Sexp::string(ctx.namespace());

    Sexp::list([
        Sexp::keyword("pid"),
        Sexp::string(runtime.host.current_process_id()),
        Sexp::keyword("style"),
        style,
        Sexp::keyword("encoding"),
        Sexp::list([
            Sexp::keyword("coding-systems"),
            Sexp::list([Sexp::string(connection.coding.name())]),
        ]),
        Sexp::keyword("lisp-implementation"),
        Sexp::list([
            Sexp::keyword("type"),
            Sexp::string(IMPLEMENTATION_NAME),
            Sexp::keyword("name"),
            Sexp::string(IMPLEMENTATION_NAME),
            Sexp::keyword("version"),
            Sexp::string(env!("CARGO_PKG_VERSION")),
        ]),
        Sexp::keyword("package"),
        Sexp::list([
            Sexp::keyword("name"),
            namespace.clone(),
            Sexp::keyword("prompt"),
            namespace,
        ]),
        Sexp::keyword("version"),
        Sexp::string(PROTOCOL_VERSION),
    ])
}

fn find_definitions(runtime: &Runtime, name: &str, ctx: &EvalContext) -> Sexp {
    let location = runtime
        .introspector
        .resolve(name, ctx.namespace())
        .and_then(|binding| {
            let file = binding.file?;
            let mut search: Vec<PathBuf> = runtime.source_paths.clone();
            search.push(runtime.host.working_directory());
            let path = runtime.sources.find_source_file(&file, &search)?;
            Some((path, binding.line.unwrap_or(1)))
        });

    let entry = match location {
        Some((path, line)) => Sexp::list([
            Sexp::keyword("location"),
            Sexp::list([Sexp::keyword("file"), Sexp::string(path.display().to_string())]),
            Sexp::list([Sexp::keyword("line"), Sexp::Int(line as i64)]),
            Sexp::Nil,
        ]),
        None => Sexp::list([
            Sexp::keyword("error"),
            Sexp::string(format!("No source location for {name}")),
        ]),
    };
    Sexp::list([Sexp::list([Sexp::string(name), entry])])
}

fn longest_common_prefix(names: &[String]) -> Option<String> {
    let (first, rest) = names.split_first()?;
    let mut len = first.len();
    for name in rest {
        len = first
            .char_indices()
            .zip(name.chars())
            .take_while(|((_, a), b)| a == b)
            .last()
            .map_or(0, |((i, a), _)| i + a.len_utf8())
            .min(len);
    }
    Some(first[..len].to_string())
}

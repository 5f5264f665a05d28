//! Typed protocol events, one closed set per direction.
//!
//! Client messages that do not match a known shape decode to
//! [`ClientEvent::Unknown`]; the dispatcher logs and drops them. Server
//! events without a dedicated variant travel as [`ServerEvent::Other`].

use super::constants::DEFAULT_NAMESPACE;
use super::sexp::Sexp;

/// Which actor a client message addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadSpec {
    /// `t`, `"default"` or `"all"`: a fresh worker for requests, every
    /// active evaluation for interrupts.
    Any,
    /// `:repl-thread` or `"repl"`.
    Repl,
    Id(u64),
    Name(String),
}

impl ThreadSpec {
    pub fn from_sexp(value: &Sexp) -> Option<Self> {
        match value {
            Sexp::T => Some(Self::Any),
            Sexp::Int(n) => u64::try_from(*n).ok().map(Self::Id),
            Sexp::Keyword(k) | Sexp::Str(k) | Sexp::Symbol(k) => Some(Self::from_name(k)),
            _ => None,
        }
    }

    fn from_name(name: &str) -> Self {
        match name {
            "default" | "all" => Self::Any,
            "repl" | "repl-thread" => Self::Repl,
            other => Self::Name(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    EvaluationRequest {
        form: Sexp,
        namespace: String,
        thread: ThreadSpec,
        id: i64,
    },
    InterruptRequest {
        thread: ThreadSpec,
    },
    /// Answer to a `read-string` prompt.
    ReturnString {
        thread: ThreadSpec,
        tag: u64,
        text: String,
    },
    /// Answer to a `y-or-n-p` prompt.
    ReturnValue {
        thread: ThreadSpec,
        tag: u64,
        value: Sexp,
    },
    Unknown(Sexp),
}

impl ClientEvent {
    pub fn from_sexp(msg: Sexp) -> Self {
        Self::decode(&msg).unwrap_or(Self::Unknown(msg))
    }

    fn decode(msg: &Sexp) -> Option<Self> {
        let items = msg.as_list()?;
        let (head, args) = items.split_first()?;
        match (head.as_keyword()?, args) {
            ("emacs-rex", [form, namespace, thread, id]) => Some(Self::EvaluationRequest {
                form: form.clone(),
                namespace: match namespace {
                    Sexp::Nil => DEFAULT_NAMESPACE.to_string(),
                    other => other.as_str()?.to_string(),
                },
                thread: ThreadSpec::from_sexp(thread)?,
                id: id.as_int()?,
            }),
            ("emacs-interrupt", [thread]) => Some(Self::InterruptRequest {
                thread: ThreadSpec::from_sexp(thread)?,
            }),
            ("emacs-return-string", [thread, tag, text]) => Some(Self::ReturnString {
                thread: ThreadSpec::from_sexp(thread)?,
                tag: u64::try_from(tag.as_int()?).ok()?,
                text: text.as_str()?.to_string(),
            }),
            ("emacs-return", [thread, tag, value]) => Some(Self::ReturnValue {
                thread: ThreadSpec::from_sexp(thread)?,
                tag: u64::try_from(tag.as_int()?).ok()?,
                value: value.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnStatus {
    Ok(Sexp),
    Abort,
}

impl ReturnStatus {
    pub fn to_sexp(&self) -> Sexp {
        match self {
            Self::Ok(value) => Sexp::list([Sexp::keyword("ok"), value.clone()]),
            Self::Abort => Sexp::list([Sexp::keyword("abort")]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugKind {
    Debug,
    Condition,
    Activate,
    Return,
}

impl DebugKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Condition => "debug-condition",
            Self::Activate => "debug-activate",
            Self::Return => "debug-return",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Return {
        status: ReturnStatus,
        id: i64,
    },
    WriteString {
        text: String,
        /// Target channel keyword, e.g. `repl-result`.
        channel: Option<String>,
    },
    NewPackage {
        name: String,
        prompt: String,
    },
    ReadString {
        thread: u64,
        tag: u64,
    },
    ReadAborted {
        thread: u64,
        tag: u64,
    },
    YOrNP {
        thread: u64,
        tag: u64,
        prompt: String,
    },
    IndentationUpdate(Vec<(String, i64)>),
    OpenDedicatedOutputStream {
        port: u16,
    },
    Debug {
        kind: DebugKind,
        thread: String,
        rest: Vec<Sexp>,
    },
    Other(Sexp),
}

impl ServerEvent {
    pub fn write_string(text: impl Into<String>) -> Self {
        Self::WriteString {
            text: text.into(),
            channel: None,
        }
    }

    pub fn to_sexp(&self) -> Sexp {
        let tagged = |tag: &str, rest: Vec<Sexp>| {
            let mut items = Vec::with_capacity(rest.len() + 1);
            items.push(Sexp::keyword(tag));
            items.extend(rest);
            Sexp::List(items)
        };
        let id = |n: u64| Sexp::Int(n as i64);

        match self {
            Self::Return { status, id } => tagged("return", vec![status.to_sexp(), Sexp::Int(*id)]),
            Self::WriteString { text, channel } => {
                let mut rest = vec![Sexp::string(text.clone())];
                if let Some(channel) = channel {
                    rest.push(Sexp::keyword(channel.clone()));
                }
                tagged("write-string", rest)
            }
            Self::NewPackage { name, prompt } => tagged(
                "new-package",
                vec![Sexp::string(name.clone()), Sexp::string(prompt.clone())],
            ),
            Self::ReadString { thread, tag } => tagged("read-string", vec![id(*thread), id(*tag)]),
            Self::ReadAborted { thread, tag } => {
                tagged("read-aborted", vec![id(*thread), id(*tag)])
            }
            Self::YOrNP { thread, tag, prompt } => tagged(
                "y-or-n-p",
                vec![id(*thread), id(*tag), Sexp::string(prompt.clone())],
            ),
            Self::IndentationUpdate(entries) => tagged(
                "indentation-update",
                vec![Sexp::list(entries.iter().map(|(name, indent)| {
                    Sexp::list([Sexp::string(name.clone()), Sexp::Int(*indent)])
                }))],
            ),
            Self::OpenDedicatedOutputStream { port } => tagged(
                "open-dedicated-output-stream",
                vec![Sexp::Int(i64::from(*port))],
            ),
            Self::Debug { kind, thread, rest } => {
                let mut items = vec![Sexp::string(thread.clone())];
                items.extend(rest.iter().cloned());
                tagged(kind.tag(), items)
            }
            Self::Other(msg) => msg.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sexp::parse;

    fn client(text: &str) -> ClientEvent {
        ClientEvent::from_sexp(parse(text).expect("parse client message"))
    }

    #[test]
    fn decodes_evaluation_request() {
        assert_eq!(
            client(r#"(:emacs-rex (+ 1 2) "user" t 1)"#),
            ClientEvent::EvaluationRequest {
                form: parse("(+ 1 2)").expect("form"),
                namespace: "user".into(),
                thread: ThreadSpec::Any,
                id: 1,
            }
        );
    }

    #[test]
    fn thread_designators() {
        let thread = |text: &str| ThreadSpec::from_sexp(&parse(text).expect("parse"));
        assert_eq!(thread("t"), Some(ThreadSpec::Any));
        assert_eq!(thread("\"default\""), Some(ThreadSpec::Any));
        assert_eq!(thread(":repl-thread"), Some(ThreadSpec::Repl));
        assert_eq!(thread("\"repl\""), Some(ThreadSpec::Repl));
        assert_eq!(thread("7"), Some(ThreadSpec::Id(7)));
        assert_eq!(thread("\"worker-3\""), Some(ThreadSpec::Name("worker-3".into())));
        assert_eq!(thread("-1"), None);
    }

    #[test]
    fn nil_package_means_default_namespace() {
        let ClientEvent::EvaluationRequest { namespace, .. } =
            client("(:emacs-rex (foo) nil :repl-thread 4)")
        else {
            panic!("expected evaluation request");
        };
        assert_eq!(namespace, DEFAULT_NAMESPACE);
    }

    #[test]
    fn decodes_prompt_answers() {
        assert_eq!(
            client(r#"(:emacs-return-string 3 1 "hello")"#),
            ClientEvent::ReturnString {
                thread: ThreadSpec::Id(3),
                tag: 1,
                text: "hello".into(),
            }
        );
        assert_eq!(
            client("(:emacs-return 3 2 t)"),
            ClientEvent::ReturnValue {
                thread: ThreadSpec::Id(3),
                tag: 2,
                value: Sexp::T,
            }
        );
    }

    #[test]
    fn malformed_shapes_are_unknown() {
        assert!(matches!(client("(:emacs-rex (+ 1 2))"), ClientEvent::Unknown(_)));
        assert!(matches!(client("(:ping 1)"), ClientEvent::Unknown(_)));
        assert!(matches!(client("42"), ClientEvent::Unknown(_)));
    }

    #[test]
    fn server_events_render_as_wire_sexps() {
        let ret = ServerEvent::Return {
            status: ReturnStatus::Ok(Sexp::Int(3)),
            id: 1,
        };
        assert_eq!(ret.to_sexp().to_string(), "(:return (:ok 3) 1)");

        let abort = ServerEvent::Return {
            status: ReturnStatus::Abort,
            id: 9,
        };
        assert_eq!(abort.to_sexp().to_string(), "(:return (:abort) 9)");

        let result = ServerEvent::WriteString {
            text: "3".into(),
            channel: Some("repl-result".into()),
        };
        assert_eq!(result.to_sexp().to_string(), "(:write-string \"3\" :repl-result)");

        let indent = ServerEvent::IndentationUpdate(vec![("do".into(), 0)]);
        assert_eq!(indent.to_sexp().to_string(), "(:indentation-update ((\"do\" 0)))");
    }
}

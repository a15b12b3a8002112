#![forbid(unsafe_code)]

//! Line protocol: whitespace-tokenized requests, newline-terminated
//! replies.

pub const OK: &str = "OK";
pub const KO: &str = "KO";
pub const NIL: &str = "(nil)";
pub const SYNTAX_ERROR: &str = "(error) ERR syntax error";
pub const WRONG_TYPE_ERROR: &str =
    "(error) WRONGTYPE Operation against a key holding the wrong kind of value";

/// Split one request line into command + argument tokens.
#[must_use]
pub fn tokenize(line: &str) -> Vec<&str> {
    line.split_ascii_whitespace().collect()
}

/// Everything a command can answer with. `render` produces the wire
/// form; the connection layer writes it verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Ko,
    Nil,
    SyntaxError,
    WrongTypeError,
    Value(String),
    Lines(Vec<String>),
}

impl Reply {
    /// Wire form, always ending in a newline. An empty listing renders
    /// as `(nil)` rather than a zero-line reply.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Ok => format!("{OK}\n"),
            Self::Ko => format!("{KO}\n"),
            Self::Nil => format!("{NIL}\n"),
            Self::SyntaxError => format!("{SYNTAX_ERROR}\n"),
            Self::WrongTypeError => format!("{WRONG_TYPE_ERROR}\n"),
            Self::Value(v) => format!("{v}\n"),
            Self::Lines(lines) => {
                if lines.is_empty() {
                    format!("{NIL}\n")
                } else {
                    let mut out = String::new();
                    for line in lines {
                        out.push_str(line);
                        out.push('\n');
                    }
                    out
                }
            }
        }
    }
}

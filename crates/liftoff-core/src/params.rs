//! Statement parameters.
//!
//! Parameters come in two shapes:
//! - Positional: bound to `?` / `?N` placeholders in order
//! - Keyed: bound to `:name` placeholders, rewritten to `?N` before execution

use std::borrow::Cow;
use std::fmt;

/// A single bound value.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    /// SQL `NULL`.
    Null,
    /// Boolean, stored as an integer by SQLite.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// Double precision float.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Null => f.write_str("NULL"),
            Param::Bool(v) => write!(f, "{v}"),
            Param::Int(v) => write!(f, "{v}"),
            Param::Float(v) => write!(f, "{v}"),
            Param::Text(v) => f.write_str(v),
            Param::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<bool> for Param {
    fn from(v: bool) -> Self {
        Param::Bool(v)
    }
}

impl From<i64> for Param {
    fn from(v: i64) -> Self {
        Param::Int(v)
    }
}

impl From<i32> for Param {
    fn from(v: i32) -> Self {
        Param::Int(v.into())
    }
}

impl From<f64> for Param {
    fn from(v: f64) -> Self {
        Param::Float(v)
    }
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Param::Text(v.to_string())
    }
}

impl From<String> for Param {
    fn from(v: String) -> Self {
        Param::Text(v)
    }
}

impl From<Vec<u8>> for Param {
    fn from(v: Vec<u8>) -> Self {
        Param::Bytes(v)
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(v: Option<T>) -> Self {
        v.map_or(Param::Null, Into::into)
    }
}

/// The full parameter set of one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Params {
    /// No parameters.
    #[default]
    None,
    /// Values bound in order.
    Positional(Vec<Param>),
    /// Values bound by name.
    Keyed(Vec<(String, Param)>),
}

impl Params {
    /// Build positional parameters.
    pub fn positional<I, P>(values: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Param>,
    {
        Params::Positional(values.into_iter().map(Into::into).collect())
    }

    /// Build keyed parameters.
    pub fn keyed<I, K, P>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, P)>,
        K: Into<String>,
        P: Into<Param>,
    {
        Params::Keyed(
            values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Values in binding order.
    pub fn values(&self) -> Vec<&Param> {
        match self {
            Params::None => Vec::new(),
            Params::Positional(values) => values.iter().collect(),
            Params::Keyed(values) => values.iter().map(|(_, v)| v).collect(),
        }
    }

    /// Number of bound values.
    pub fn len(&self) -> usize {
        match self {
            Params::None => 0,
            Params::Positional(values) => values.len(),
            Params::Keyed(values) => values.len(),
        }
    }

    /// Returns `true` if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable rendering for logs.
    ///
    /// Keyed parameters render as `name:value, name:value`, positional ones
    /// as `value, value`.
    pub fn render(&self) -> String {
        match self {
            Params::None => String::new(),
            Params::Positional(values) => values
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
            Params::Keyed(values) => values
                .iter()
                .map(|(name, value)| format!("{name}:{value}"))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    /// Rewrite `:name` placeholders to numbered `?N` placeholders.
    ///
    /// Positional and empty parameter sets return the statement untouched.
    /// Placeholders inside single-quoted literals are left alone.
    pub fn prepare<'a>(&self, statement: &'a str) -> Result<Cow<'a, str>, UnknownParameter> {
        let Params::Keyed(values) = self else {
            return Ok(Cow::Borrowed(statement));
        };

        let mut out = String::with_capacity(statement.len());
        let mut chars = statement.char_indices().peekable();
        let mut in_literal = false;
        let mut prev = '\0';

        while let Some((_, c)) = chars.next() {
            if c == '\'' {
                in_literal = !in_literal;
                out.push(c);
                prev = c;
                continue;
            }

            let starts_name = chars
                .peek()
                .is_some_and(|(_, next)| next.is_ascii_alphabetic() || *next == '_');

            if c == ':' && !in_literal && prev != ':' && starts_name {
                let mut name = String::new();
                while let Some((_, next)) = chars.peek() {
                    if next.is_ascii_alphanumeric() || *next == '_' {
                        name.push(*next);
                        chars.next();
                    } else {
                        break;
                    }
                }

                let index = values
                    .iter()
                    .position(|(key, _)| *key == name)
                    .ok_or_else(|| UnknownParameter { name: name.clone() })?;
                out.push('?');
                out.push_str(&(index + 1).to_string());
                prev = 'x';
                continue;
            }

            out.push(c);
            prev = c;
        }

        Ok(Cow::Owned(out))
    }
}

/// A keyed placeholder names a parameter that was not supplied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Statement references unknown parameter ':{name}'")]
pub struct UnknownParameter {
    /// The placeholder name.
    pub name: String,
}

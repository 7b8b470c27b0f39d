//! Message selection criteria.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Selection criterion evaluated server-side by searchable protocols.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchQuery {
    #[default]
    All,
    Unseen,
    Seen,
    From(String),
    Subject(String),
    Since(NaiveDate),
    Before(NaiveDate),
    And(Vec<SearchQuery>),
    Or(Box<SearchQuery>, Box<SearchQuery>),
    Not(Box<SearchQuery>),
}

impl SearchQuery {
    pub fn and(self, other: SearchQuery) -> Self {
        match self {
            Self::All => other,
            Self::And(mut terms) => {
                terms.push(other);
                Self::And(terms)
            }
            term => Self::And(vec![term, other]),
        }
    }

    pub fn or(self, other: SearchQuery) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }
}

/// Renders IMAP SEARCH key syntax (RFC 3501 §6.4.4).
impl fmt::Display for SearchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "ALL"),
            Self::Unseen => write!(f, "UNSEEN"),
            Self::Seen => write!(f, "SEEN"),
            Self::From(addr) => write!(f, "FROM {}", quoted(addr)),
            Self::Subject(text) => write!(f, "SUBJECT {}", quoted(text)),
            Self::Since(date) => write!(f, "SINCE {}", date.format("%-d-%b-%Y")),
            Self::Before(date) => write!(f, "BEFORE {}", date.format("%-d-%b-%Y")),
            Self::And(terms) if terms.is_empty() => write!(f, "ALL"),
            Self::And(terms) => {
                write!(f, "(")?;
                for (i, term) in terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{term}")?;
                }
                write!(f, ")")
            }
            Self::Or(a, b) => write!(f, "OR {a} {b}"),
            Self::Not(q) => write!(f, "NOT {q}"),
        }
    }
}

fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// What a job asks the fetcher to select.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    #[serde(default)]
    pub query: SearchQuery,
}

impl FetchRequest {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(query: SearchQuery) -> Self {
        Self { query }
    }

    /// True for the implicit "every message" request.
    pub fn is_select_all(&self) -> bool {
        self.query == SearchQuery::All
    }
}

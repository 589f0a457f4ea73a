//! Include/exclude term queries over unit content.
//!
//! # Responsibility
//! - Turn an argument vector into include and exclude term lists.
//! - Match content case-insensitively against those lists.
//!
//! # Invariants
//! - A query always has at least one term; empty queries are rejected.
//! - Content matches iff it contains at least one include term (when any
//!   exist) and none of the exclude terms.

use regex::{Regex, RegexBuilder};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Leading marker that turns an argument into an exclude term.
pub const EXCLUDE_MARKER: char = '-';

pub type SearchResult<T> = Result<T, SearchError>;

/// Query construction error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    /// Neither include nor exclude terms were given.
    EmptyQuery,
    /// A term could not be compiled into a matcher.
    InvalidTerm { term: String, message: String },
}

impl Display for SearchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyQuery => write!(f, "at least one search term is required"),
            Self::InvalidTerm { term, message } => {
                write!(f, "invalid search term `{term}`: {message}")
            }
        }
    }
}

impl Error for SearchError {}

/// Raw include/exclude term lists, as given by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchTerms {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl SearchTerms {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        Self { include, exclude }
    }

    /// Splits command arguments into include and exclude terms.
    ///
    /// `-word` excludes `word`. Empty arguments and a bare `-` are ignored.
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut terms = Self::default();
        for arg in args {
            let arg = arg.as_ref();
            match arg.strip_prefix(EXCLUDE_MARKER) {
                Some("") => {}
                Some(excluded) => terms.exclude.push(excluded.to_string()),
                None if arg.is_empty() => {}
                None => terms.include.push(arg.to_string()),
            }
        }
        terms
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// Compiles the term lists into a matcher.
    pub fn matcher(&self) -> SearchResult<TermMatcher> {
        if self.is_empty() {
            return Err(SearchError::EmptyQuery);
        }
        Ok(TermMatcher {
            include: compile_terms(&self.include)?,
            exclude: compile_terms(&self.exclude)?,
        })
    }
}

/// Compiled, case-insensitive substring matcher.
#[derive(Debug, Clone)]
pub struct TermMatcher {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl TermMatcher {
    pub fn matches(&self, content: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|term| term.is_match(content));
        included && !self.exclude.iter().any(|term| term.is_match(content))
    }
}

/// Builds a matcher for a single substring, used by bulk deletion.
///
/// A blank term is rejected instead of matching everything.
pub fn substring_matcher(term: &str) -> SearchResult<TermMatcher> {
    if term.trim().is_empty() {
        return Err(SearchError::EmptyQuery);
    }
    SearchTerms::new(vec![term.to_string()], Vec::new()).matcher()
}

fn compile_terms(terms: &[String]) -> SearchResult<Vec<Regex>> {
    terms
        .iter()
        .map(|term| {
            RegexBuilder::new(&regex::escape(term))
                .case_insensitive(true)
                .build()
                .map_err(|err| SearchError::InvalidTerm {
                    term: term.clone(),
                    message: err.to_string(),
                })
        })
        .collect()
}

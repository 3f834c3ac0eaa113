// ==============================================================================
// query.rs - Contig Query Layer
// ==============================================================================
// Description: Filtered, paginated lookups over the contig index
// Author: Matt Barham
// Created: 2026-10-03
// Modified: 2026-10-15
// Version: 1.1.0
// ==============================================================================

use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

use crate::models::{normalize_value, AnnotationCategory, Contig, UnknownCategory};
use crate::store::{ContigRow, ContigStore, StoreError, CONTIG_COLUMNS};

pub const DEFAULT_PAGE_SIZE: usize = 25;

/// What a filter matches within its category
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// Any value at all (presence flag)
    Any,
    /// One specific value, compared after normalization
    Exact(String),
}

impl From<&str> for Term {
    /// `*` or `any` (any case) select presence; everything else is exact
    fn from(s: &str) -> Self {
        let s = s.trim();
        if s == "*" || s.eq_ignore_ascii_case("any") {
            Term::Any
        } else {
            Term::Exact(s.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub category: AnnotationCategory,
    pub term: Term,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterParseError {
    #[error("Filter '{0}' is not of the form category=term")]
    Syntax(String),

    #[error(transparent)]
    Category(#[from] UnknownCategory),
}

impl Filter {
    pub fn any(category: AnnotationCategory) -> Self {
        Self {
            category,
            term: Term::Any,
        }
    }

    pub fn exact(category: AnnotationCategory, value: impl Into<String>) -> Self {
        Self {
            category,
            term: Term::Exact(value.into()),
        }
    }
}

impl FromStr for Filter {
    type Err = FilterParseError;

    /// `interpros=IPR000001`, `pfam=*`, `gos=any`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (category, term) = s
            .split_once('=')
            .ok_or_else(|| FilterParseError::Syntax(s.to_string()))?;
        if term.trim().is_empty() {
            return Err(FilterParseError::Syntax(s.to_string()));
        }
        Ok(Filter {
            category: category.parse()?,
            term: Term::from(term),
        })
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.term {
            Term::Any => write!(f, "{}=*", self.category),
            Term::Exact(value) => write!(f, "{}={}", self.category, value),
        }
    }
}

/// AND-combined filters plus a 1-based page window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContigQuery {
    pub filters: Vec<Filter>,
    pub page: usize,
    pub page_size: usize,
}

impl Default for ContigQuery {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ContigQuery {
    pub fn new(filters: Vec<Filter>) -> Self {
        Self {
            filters,
            ..Default::default()
        }
    }

    pub fn page(mut self, page: usize) -> Self {
        self.page = page;
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    fn offset(&self) -> usize {
        (self.page.max(1) - 1) * self.limit()
    }

    fn limit(&self) -> usize {
        self.page_size.max(1)
    }
}

/// Total matches plus the requested page of contigs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPage {
    pub count: usize,
    pub items: Vec<Contig>,
}

/// WHERE clause and its bound values for a filter list
fn where_clause(filters: &[Filter]) -> (String, Vec<Value>) {
    let mut clauses = Vec::with_capacity(filters.len());
    let mut values = Vec::new();

    for filter in filters {
        match &filter.term {
            Term::Any => {
                clauses.push(format!("c.{} = 1", filter.category.presence_column()));
            }
            Term::Exact(value) => {
                clauses.push(
                    "c.id IN (SELECT contig_id FROM contig_annotations WHERE category = ? AND value = ?)"
                        .to_string(),
                );
                values.push(Value::Text(filter.category.as_str().to_string()));
                values.push(Value::Text(normalize_value(value)));
            }
        }
    }

    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), values)
    }
}

impl ContigStore {
    /// Contigs matching every filter, in creation order
    pub fn query(&self, query: &ContigQuery) -> Result<QueryPage, StoreError> {
        let (clause, values) = where_clause(&query.filters);
        let conn = self.connection();

        let count_sql = format!("SELECT COUNT(*) FROM contigs c{}", clause);
        let count: i64 = conn.query_row(&count_sql, params_from_iter(values.iter()), |row| row.get(0))?;

        let mut page_values = values;
        page_values.push(Value::Integer(query.limit() as i64));
        page_values.push(Value::Integer(query.offset() as i64));

        let page_sql = format!(
            "SELECT {} FROM contigs c{} ORDER BY c.id LIMIT ? OFFSET ?",
            CONTIG_COLUMNS, clause
        );
        let mut stmt = conn.prepare(&page_sql)?;
        let rows = stmt
            .query_map(params_from_iter(page_values.iter()), ContigRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "Query [{}] page {}: {} of {} contigs",
            query.filters.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(", "),
            query.page.max(1),
            rows.len(),
            count
        );

        Ok(QueryPage {
            count: count as usize,
            items: self.hydrate_all(rows)?,
        })
    }
}

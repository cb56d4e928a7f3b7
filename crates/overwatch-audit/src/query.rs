//! Audit query filters, compiled to a parameterised SQL `WHERE` clause.

use chrono::{DateTime, Utc};
use overwatch_types::{ActorType, AuditCategory, AuditEventType, AuditSeverity};
use rusqlite::types::Value;

use crate::entry::format_timestamp;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Filters for [`AuditTrail::query`](crate::AuditTrail::query).
///
/// All filters are conjunctive. Archived entries are excluded unless
/// `include_archived` is set.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub actor_id: Option<String>,
    pub actor_type: Option<ActorType>,
    pub event_type: Option<AuditEventType>,
    pub category: Option<AuditCategory>,
    /// Entries at least this severe.
    pub min_severity: Option<AuditSeverity>,
    /// Inclusive.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive.
    pub to: Option<DateTime<Utc>>,
    /// Inclusive.
    pub from_sequence: Option<u64>,
    /// Inclusive.
    pub to_sequence: Option<u64>,
    pub include_archived: bool,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actor(mut self, actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        self.actor_type = Some(actor_type);
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn event_type(mut self, event_type: AuditEventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn category(mut self, category: AuditCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn min_severity(mut self, severity: AuditSeverity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn sequences(mut self, from: u64, to: u64) -> Self {
        self.from_sequence = Some(from);
        self.to_sequence = Some(to);
        self
    }

    pub fn include_archived(mut self) -> Self {
        self.include_archived = true;
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.order = SortOrder::Descending;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// `WHERE … ORDER BY … LIMIT …` tail plus its positional parameters.
    pub(crate) fn to_sql(&self) -> (String, Vec<Value>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Value> = Vec::new();

        let mut bind = |clause: &str, value: Value, clauses: &mut Vec<String>| {
            params.push(value);
            clauses.push(clause.replace('?', &format!("?{}", params.len())));
        };

        if let Some(actor_id) = &self.actor_id {
            bind("actor_id = ?", Value::Text(actor_id.clone()), &mut clauses);
        }
        if let Some(actor_type) = self.actor_type {
            bind("actor_type = ?", Value::Text(actor_type.as_str().into()), &mut clauses);
        }
        if let Some(event_type) = &self.event_type {
            bind("event_type = ?", Value::Text(event_type.as_str().into()), &mut clauses);
        }
        if let Some(category) = self.category {
            bind("category = ?", Value::Text(category.as_str().into()), &mut clauses);
        }
        if let Some(min) = self.min_severity {
            let allowed: Vec<&str> = [
                AuditSeverity::Info,
                AuditSeverity::Warning,
                AuditSeverity::Error,
                AuditSeverity::Critical,
            ]
            .iter()
            .filter(|s| **s >= min)
            .map(|s| s.as_str())
            .collect();
            // Severity names are fixed identifiers, safe to inline.
            clauses.push(format!("severity IN ('{}')", allowed.join("','")));
        }
        if let Some(from) = &self.from {
            bind("timestamp >= ?", Value::Text(format_timestamp(from)), &mut clauses);
        }
        if let Some(to) = &self.to {
            bind("timestamp < ?", Value::Text(format_timestamp(to)), &mut clauses);
        }
        if let Some(from) = self.from_sequence {
            bind("sequence >= ?", Value::Integer(from as i64), &mut clauses);
        }
        if let Some(to) = self.to_sequence {
            bind("sequence <= ?", Value::Integer(to as i64), &mut clauses);
        }
        if !self.include_archived {
            clauses.push("archived = 0".to_string());
        }

        let mut sql = String::new();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(match self.order {
            SortOrder::Ascending => " ORDER BY sequence ASC",
            SortOrder::Descending => " ORDER BY sequence DESC",
        });
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        (sql, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_query_only_hides_archived() {
        let (sql, params) = AuditQuery::new().to_sql();
        assert_eq!(sql, " WHERE archived = 0 ORDER BY sequence ASC");
        assert!(params.is_empty());
    }

    #[test]
    fn parameters_are_numbered_in_order() {
        let (sql, params) = AuditQuery::new()
            .actor(ActorType::Team, "alpha")
            .sequences(3, 9)
            .include_archived()
            .newest_first()
            .limit(5)
            .to_sql();
        assert_eq!(
            sql,
            " WHERE actor_id = ?1 AND actor_type = ?2 AND sequence >= ?3 AND sequence <= ?4 \
             ORDER BY sequence DESC LIMIT 5"
        );
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn min_severity_expands_to_allowed_set() {
        let (sql, _) = AuditQuery::new()
            .min_severity(AuditSeverity::Error)
            .to_sql();
        assert!(sql.contains("severity IN ('ERROR','CRITICAL')"));
    }
}

//! Predicate Query Builder
//!
//! Assembles structured filter expressions - type, property equality/range/
//! null checks, association membership, boolean grouping - and compiles
//! them into the SQL fragment consumed by the storage engine's search
//! operations. The general pattern is
//!
//! ```text
//! statement1 AND statement2 AND ...
//!  AND one_of()
//! statement3 OR statement4 OR ...
//! ```
//!
//! Either part may contain parenthesized groups, giving
//! `statement1 AND (statement2 OR statement3 ...) AND ...` before
//! `one_of()` and `statement4 OR (statement5 AND statement6 ...) OR ...`
//! after it.
//!
//! # Examples
//!
//! Search png or jpeg photos whose name starts with "bird":
//!
//! ```rust
//! use strata_core::services::QueryBuilder;
//! use strata_core::models::PropValue;
//!
//! let q = QueryBuilder::new()
//!     .types(&["photo"])
//!     .is("name", Some(&PropValue::from("bird*")))
//!     .one_of()
//!     .is("content-type", Some(&PropValue::from("image/jpeg")))
//!     .is("content-type", Some(&PropValue::from("image/png")));
//! let sql = q.build();
//! assert!(sql.contains("n.class='photo'"));
//! ```

use crate::db::codec;
use crate::models::PropValue;

const OPERATOR_DIFFERENT: &str = "<>";
const OPERATOR_LTE: &str = "<=";
const OPERATOR_GTE: &str = ">=";
const OPERATOR_EQUALS: &str = "=";
const OPERATOR_LIKE: &str = " like ";
const OPERATOR_NOT_LIKE: &str = " not like ";
const FILTER_AND: &str = " and ";
const FILTER_OR: &str = " or ";

/// Fluent filter-expression builder for the search operations.
///
/// Property filters each join a numbered `node_props` alias; association
/// filters join `node_assocs`. Values are embedded as escaped literals, so
/// the produced fragment is self-contained.
#[derive(Debug, Default, Clone)]
pub struct QueryBuilder {
    query: String,
    or: bool,
    group: bool,
    join_count: usize,
    has_and: bool,
    has_or: bool,
    has_parent_assoc: bool,
    has_child_assoc: bool,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the resulting fragment: property/association joins followed by
    /// the filter expression.
    pub fn build(&self) -> String {
        let mut result = String::with_capacity(512);
        for i in 0..self.join_count {
            result.push_str(&format!(
                "join node_props p{i} on n.id = p{i}.node_id "
            ));
        }
        if self.has_parent_assoc {
            result.push_str("join node_assocs pa on pa.target = n.id ");
        }
        if self.has_child_assoc {
            result.push_str("join node_assocs ca on ca.source = n.id ");
        }
        let mut query = self.query.clone();
        if self.group {
            query.push(')');
        }
        if self.or {
            query.push(')');
        }
        if !query.is_empty() {
            result.push_str(" where ");
            result.push_str(&query);
        }
        result
    }

    /// Whether any filter expression was added.
    pub fn is_empty(&self) -> bool {
        self.query.is_empty()
    }

    /// Type filter: `class in (...)` or `class = ?`.
    pub fn types(mut self, types: &[&str]) -> Self {
        if !types.is_empty() {
            self.and_or();
            if types.len() == 1 {
                self.query
                    .push_str(&format!("n.class='{}' ", escape(types[0])));
            } else {
                let joined = types
                    .iter()
                    .map(|t| escape(t))
                    .collect::<Vec<_>>()
                    .join("','");
                self.query.push_str(&format!("n.class in ('{joined}') "));
            }
        }
        self
    }

    /// Filter by value in a named property. A `*` wildcard in a string
    /// value turns the comparison into LIKE; `None` means "has no value"
    /// (same as [`is_null`](Self::is_null)).
    pub fn is(mut self, name: &str, value: Option<&PropValue>) -> Self {
        match value {
            Some(value) => {
                self.and_or();
                match wildcard(value) {
                    Some(pattern) => {
                        self.fill_operator(Some(name), &PropValue::Str(pattern), OPERATOR_LIKE)
                    }
                    None => self.fill_operator(Some(name), value, OPERATOR_EQUALS),
                }
                self.join_count += 1;
                self
            }
            None => self.is_null(&[name]),
        }
    }

    /// Negated [`is`](Self::is): `value != ?`, `NOT LIKE`, or not-null.
    pub fn is_not(mut self, name: &str, value: Option<&PropValue>) -> Self {
        match value {
            Some(value) => {
                self.and_or();
                match wildcard(value) {
                    Some(pattern) => {
                        self.fill_operator(Some(name), &PropValue::Str(pattern), OPERATOR_NOT_LIKE)
                    }
                    None => self.fill_operator(Some(name), value, OPERATOR_DIFFERENT),
                }
                self.join_count += 1;
                self
            }
            None => self.is_not_null(&[name]),
        }
    }

    /// Exclude nodes where the named property holds any of the values:
    /// `not in (select ... where name = ? and (value = ? or ...))`.
    pub fn is_not_any(mut self, name: &str, values: &[PropValue]) -> Self {
        if !values.is_empty() {
            self.and_or();
            self.query
                .push_str("n.id not in (select node_id from node_props where ");
            fill_prop_name_into(&mut self.query, name, "node_props");
            self.query.push('(');
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    self.query.push_str(FILTER_OR);
                }
                fill_value_into(&mut self.query, value, OPERATOR_EQUALS, "node_props");
            }
            self.query.push_str("))");
        }
        self
    }

    /// Filter by property absence. The repository never stores null values,
    /// so absence of rows is the check. Not supported after `one_of()`.
    pub fn is_null(mut self, names: &[&str]) -> Self {
        if !names.is_empty() {
            debug_assert!(!self.or, "is_null after one_of() is not supported");
            self.and();
            self.query
                .push_str("n.id not in (select node_id from node_props where ");
            for (i, name) in names.iter().enumerate() {
                if i > 0 {
                    self.query.push_str(FILTER_OR);
                }
                self.query.push('(');
                fill_prop_name_into(&mut self.query, name, "node_props");
                self.query.push(')');
            }
            self.query.push(')');
        }
        self
    }

    /// Filter by property presence. Not supported after `one_of()`.
    pub fn is_not_null(mut self, names: &[&str]) -> Self {
        if !names.is_empty() {
            debug_assert!(!self.or, "is_not_null after one_of() is not supported");
            self.and();
            self.query.push_str(" (");
            let table = format!("p{}", self.join_count);
            for (i, name) in names.iter().enumerate() {
                if i > 0 {
                    self.query.push_str(FILTER_OR);
                }
                fill_prop_name_into(&mut self.query, name, &table);
            }
            self.query.push(')');
            self.join_count += 1;
        }
        self
    }

    /// Filter by primary parent.
    pub fn primary_parent(mut self, parent_id: &str) -> Self {
        self.and_or();
        self.query
            .push_str(&format!("n.parent_id='{}'", escape(parent_id)));
        self
    }

    /// Range filter on a named property; either bound may be omitted.
    pub fn range(mut self, name: &str, min: Option<&PropValue>, max: Option<&PropValue>) -> Self {
        debug_assert!(min.is_some() || max.is_some());
        self.and_or();
        self.query.push_str(" (");
        let table = format!("p{}", self.join_count);
        fill_prop_name_into(&mut self.query, name, &table);
        self.query.push_str(FILTER_AND);
        if let Some(min) = min {
            fill_value_into(&mut self.query, min, OPERATOR_GTE, &table);
            if let Some(max) = max {
                self.query.push_str(FILTER_AND);
                fill_value_into(&mut self.query, max, OPERATOR_LTE, &table);
            }
        } else if let Some(max) = max {
            fill_value_into(&mut self.query, max, OPERATOR_LTE, &table);
        }
        self.query.push(')');
        self.join_count += 1;
        self
    }

    /// Filter by having an association from any of the given parents.
    pub fn parent_assoc(mut self, parents: &[&str]) -> Self {
        if !parents.is_empty() {
            self.and_or();
            in_or_eq(&mut self.query, "pa.source", parents);
            self.has_parent_assoc = true;
        }
        self
    }

    /// Exclude nodes having an association from any of the given parents.
    pub fn parent_assoc_not(mut self, parents: &[&str]) -> Self {
        if !parents.is_empty() {
            self.and_or();
            self.query
                .push_str(" n.id not in (select target from node_assocs where ");
            in_or_eq(&mut self.query, "source", parents);
            self.query.push(')');
        }
        self
    }

    /// Filter by having an association to any of the given children.
    pub fn child_assoc(mut self, children: &[&str]) -> Self {
        if !children.is_empty() {
            self.and_or();
            in_or_eq(&mut self.query, "ca.target", children);
            self.has_child_assoc = true;
        }
        self
    }

    /// Exclude nodes having an association to any of the given children.
    pub fn child_assoc_not(mut self, children: &[&str]) -> Self {
        if !children.is_empty() {
            self.and_or();
            self.query
                .push_str(" n.id not in (select source from node_assocs where ");
            in_or_eq(&mut self.query, "target", children);
            self.query.push(')');
        }
        self
    }

    /// Join nodes by value in a named property: the property value must be
    /// the id of a node whose `referenced_name` property matches
    /// `referenced_value`.
    pub fn reference(
        mut self,
        name: &str,
        referenced_name: &str,
        referenced_value: &PropValue,
    ) -> Self {
        self.and_or();
        self.query.push_str(" (");
        let table = format!("p{}", self.join_count);
        fill_prop_name_into(&mut self.query, name, &table);
        self.query.push_str(FILTER_AND);
        self.query.push_str(&format!(
            "{table}.value_s in (select node_id from node_props where name='{}' and value_s",
            escape(referenced_name)
        ));
        match wildcard(referenced_value) {
            Some(pattern) => {
                self.query
                    .push_str(&format!("{OPERATOR_LIKE}'{}'", escape(&pattern)));
            }
            None => match codec::string_slot(referenced_value) {
                Some(s) => self
                    .query
                    .push_str(&format!("{OPERATOR_EQUALS}'{}'", escape(&s))),
                None => {
                    if let Some(n) = codec::numeric_slot(referenced_value) {
                        self.query.push_str(&format!("{OPERATOR_EQUALS}'{n}'"));
                    }
                }
            },
        }
        self.query.push_str("))");
        self.join_count += 1;
        self
    }

    /// Start the second part of the query, where at least one of the
    /// following expressions must match. Can only be called once.
    pub fn one_of(mut self) -> Self {
        debug_assert!(!self.or, "one_of() can't be called twice");
        self.or = true;
        if self.group {
            self.query.push(')');
            self.group = false;
        }
        self.and();
        self.query.push('(');
        self.has_or = false;
        self.has_and = false;
        self
    }

    /// Start a parenthesized group of expressions. A group ends when the
    /// next group starts, `one_of()` is reached, or the query is built.
    pub fn group(mut self) -> Self {
        if self.or {
            if self.group {
                self.query.push(')');
                self.query.push_str(FILTER_OR);
            } else {
                self.or_separator();
            }
        } else if self.group {
            self.query.push(')');
            self.query.push_str(FILTER_AND);
        } else {
            self.and();
        }
        self.group = true;
        self.has_or = false;
        self.has_and = false;
        self.query.push('(');
        self
    }

    fn or_separator(&mut self) {
        if self.has_or {
            self.query.push_str(FILTER_OR);
        }
        self.has_or = true;
    }

    fn and(&mut self) {
        if self.has_and {
            self.query.push_str(FILTER_AND);
        }
        self.has_and = true;
    }

    fn and_or(&mut self) {
        // inside exactly one of (one_of-part, group) expressions chain with
        // OR; inside both or neither they chain with AND
        if self.or != self.group {
            self.or_separator();
        } else {
            self.and();
        }
    }

    fn fill_operator(&mut self, name: Option<&str>, value: &PropValue, op: &str) {
        self.has_and = true;
        self.query.push_str(" (");
        let table = format!("p{}", self.join_count);
        if let Some(name) = name {
            fill_prop_name_into(&mut self.query, name, &table);
            self.query.push_str(FILTER_AND);
        }
        fill_value_into(&mut self.query, value, op, &table);
        self.query.push(')');
    }
}

/// LIKE pattern when the value is a string containing the `*` wildcard.
fn wildcard(value: &PropValue) -> Option<String> {
    match value {
        PropValue::Str(s) if s.contains('*') => Some(s.replace('*', "%")),
        _ => None,
    }
}

fn fill_prop_name_into(query: &mut String, name: &str, table: &str) {
    query.push_str(&format!("{table}.name = '{}'", escape(name)));
}

fn fill_value_into(query: &mut String, value: &PropValue, op: &str, table: &str) {
    match codec::string_slot(value) {
        Some(s) => query.push_str(&format!("{table}.value_s {op} '{}'", escape(&s))),
        None => match codec::numeric_slot(value) {
            Some(n) => query.push_str(&format!("{table}.value_n {op} '{n}'")),
            None => query.push_str(&format!(
                "{table}.value_s is null and {table}.value_n is null"
            )),
        },
    }
}

fn in_or_eq(query: &mut String, field: &str, values: &[&str]) {
    if values.len() == 1 {
        query.push_str(&format!("{field}='{}'", escape(values[0])));
    } else {
        let joined = values
            .iter()
            .map(|v| escape(v))
            .collect::<Vec<_>>()
            .join("','");
        query.push_str(&format!("{field} in ('{joined}')"));
    }
}

/// Escape a literal for embedding in a single-quoted SQL string.
fn escape(value: &str) -> String {
    value.replace('\\', "").replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_builder_builds_empty_fragment() {
        let q = QueryBuilder::new();
        assert!(q.is_empty());
        assert_eq!(q.build(), "");
    }

    #[test]
    fn type_and_property_filters_chain_with_and() {
        let q = QueryBuilder::new()
            .types(&["photo"])
            .is("name", Some(&PropValue::from("bird")));
        let sql = q.build();
        assert!(sql.starts_with("join node_props p0 on n.id = p0.node_id "));
        assert!(sql.contains("n.class='photo'"));
        assert!(sql.contains("p0.name = 'name'"));
        assert!(sql.contains("p0.value_s = 'bird'"));
        assert!(sql.contains(" and "));
    }

    #[test]
    fn wildcard_becomes_like() {
        let sql = QueryBuilder::new()
            .is("name", Some(&PropValue::from("bird*")))
            .build();
        assert!(sql.contains("p0.value_s  like  'bird%'"));
    }

    #[test]
    fn numeric_values_use_numeric_slot() {
        let sql = QueryBuilder::new()
            .is("pages", Some(&PropValue::Int(12)))
            .build();
        assert!(sql.contains("p0.value_n = '12'"));
    }

    #[test]
    fn one_of_switches_to_or() {
        let sql = QueryBuilder::new()
            .types(&["photo"])
            .one_of()
            .is("content-type", Some(&PropValue::from("image/jpeg")))
            .is("content-type", Some(&PropValue::from("image/png")))
            .build();
        assert!(sql.contains("image/jpeg"));
        assert!(sql.contains(" or "));
        assert!(sql.trim_end().ends_with(')'));
    }

    #[test]
    fn null_checks_use_not_in_subselect() {
        let sql = QueryBuilder::new().is("name", None).build();
        assert!(sql.contains("n.id not in (select node_id from node_props where"));
        assert!(sql.contains("node_props.name = 'name'"));
    }

    #[test]
    fn range_emits_both_bounds() {
        let sql = QueryBuilder::new()
            .range(
                "pages",
                Some(&PropValue::Int(10)),
                Some(&PropValue::Int(20)),
            )
            .build();
        assert!(sql.contains("p0.value_n >= '10'"));
        assert!(sql.contains("p0.value_n <= '20'"));
    }

    #[test]
    fn assoc_filters_join_assoc_table() {
        let sql = QueryBuilder::new().parent_assoc(&["parent-1"]).build();
        assert!(sql.contains("join node_assocs pa on pa.target = n.id"));
        assert!(sql.contains("pa.source='parent-1'"));

        let sql = QueryBuilder::new().child_assoc_not(&["child-1"]).build();
        assert!(sql.contains("n.id not in (select source from node_assocs where target='child-1')"));
    }

    #[test]
    fn two_property_filters_use_distinct_joins() {
        let sql = QueryBuilder::new()
            .is("a", Some(&PropValue::from("1")))
            .is("b", Some(&PropValue::from("2")))
            .build();
        assert!(sql.contains("join node_props p0"));
        assert!(sql.contains("join node_props p1"));
        assert!(sql.contains("p1.name = 'b'"));
    }

    #[test]
    fn escapes_embedded_quotes() {
        let sql = QueryBuilder::new()
            .is("name", Some(&PropValue::from("o'brien")))
            .build();
        assert!(sql.contains("o''brien"));
    }

    #[test]
    fn groups_parenthesize() {
        let sql = QueryBuilder::new()
            .types(&["doc"])
            .group()
            .is("a", Some(&PropValue::from("1")))
            .is("b", Some(&PropValue::from("2")))
            .build();
        assert!(sql.contains(" and ("));
        // group closes at build time
        assert_eq!(sql.matches('(').count(), sql.matches(')').count());
    }
}

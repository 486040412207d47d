//! Row filters for the binlog decoder.
//!
//! Filters are written against column names (`@uid == 3`). Row events only
//! carry column positions, so every `@name` is rewritten to `@N` after
//! checking the column sits at the same position in every targeted table.

use crate::config::FlashbackConfig;
use crate::error::{Result, RollbackError};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use sqlx::{MySqlPool, Row};
use std::collections::{BTreeMap, BTreeSet, HashMap};

lazy_static! {
    // quoted literals are matched whole so an `@` inside a value is never a reference
    static ref COLUMN_REF: Regex =
        Regex::new(r#"'(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*"|@([A-Za-z_][A-Za-z0-9_$]*)"#).unwrap();
    static ref IDENT: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl RuleOp {
    fn symbol(&self) -> &'static str {
        match self {
            RuleOp::Eq => "==",
            RuleOp::Ne => "!=",
            RuleOp::Lt => "<",
            RuleOp::Le => "<=",
            RuleOp::Gt => ">",
            RuleOp::Ge => ">=",
            RuleOp::In => "in",
            RuleOp::NotIn => "not in",
        }
    }

    fn wants_list(&self) -> bool {
        matches!(self, RuleOp::In | RuleOp::NotIn)
    }
}

/// Declared type of a rule value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int,
    String,
    Bool,
    Array,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleValue {
    Int(i64),
    String(String),
    Bool(bool),
    Array(Vec<RuleValue>),
}

impl RuleValue {
    /// Decode `raw` as the declared type. Text forms are accepted since
    /// INI sources only carry strings.
    pub fn decode(tag: ValueType, raw: &serde_json::Value, item: ValueType) -> std::result::Result<Self, String> {
        use serde_json::Value;
        match (tag, raw) {
            (ValueType::Int, Value::Number(n)) => n.as_i64().map(RuleValue::Int).ok_or_else(|| format!("{} is not an integer", n)),
            (ValueType::Int, Value::String(s)) => s.trim().parse().map(RuleValue::Int).map_err(|_| format!("{:?} is not an integer", s)),
            (ValueType::String, Value::String(s)) => Ok(RuleValue::String(s.clone())),
            (ValueType::String, Value::Number(n)) => Ok(RuleValue::String(n.to_string())),
            (ValueType::Bool, Value::Bool(b)) => Ok(RuleValue::Bool(*b)),
            (ValueType::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(RuleValue::Bool(true)),
                "false" | "0" => Ok(RuleValue::Bool(false)),
                _ => Err(format!("{:?} is not a bool", s)),
            },
            (ValueType::Array, Value::Array(items)) => {
                if item == ValueType::Array {
                    return Err("nested arrays are not supported".to_string());
                }
                items
                    .iter()
                    .map(|v| RuleValue::decode(item, v, item))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map(RuleValue::Array)
            }
            (tag, other) => Err(format!("value {} does not match type {:?}", other, tag)),
        }
    }

    fn encode(&self) -> serde_json::Value {
        match self {
            RuleValue::Int(i) => serde_json::Value::from(*i),
            RuleValue::String(s) => serde_json::Value::from(s.as_str()),
            RuleValue::Bool(b) => serde_json::Value::from(*b),
            RuleValue::Array(items) => serde_json::Value::Array(items.iter().map(|i| i.encode()).collect()),
        }
    }

    fn value_type(&self) -> ValueType {
        match self {
            RuleValue::Int(_) => ValueType::Int,
            RuleValue::String(_) => ValueType::String,
            RuleValue::Bool(_) => ValueType::Bool,
            RuleValue::Array(_) => ValueType::Array,
        }
    }

    /// Literal as the decoder's filter language spells it.
    pub fn render(&self) -> String {
        match self {
            RuleValue::Int(i) => i.to_string(),
            RuleValue::String(s) => quote(s),
            RuleValue::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
            RuleValue::Array(items) => {
                format!("({})", items.iter().map(|i| i.render()).collect::<Vec<_>>().join(", "))
            }
        }
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawRule {
    column: String,
    op: RuleOp,
    #[serde(rename = "type")]
    value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    item_type: Option<ValueType>,
    value: serde_json::Value,
}

/// One `column op value` condition; rules are AND-ed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRule", into = "RawRule")]
pub struct FilterRule {
    pub column: String,
    pub op: RuleOp,
    pub value: RuleValue,
}

impl TryFrom<RawRule> for FilterRule {
    type Error = String;

    fn try_from(raw: RawRule) -> std::result::Result<Self, Self::Error> {
        if !IDENT.is_match(&raw.column) {
            return Err(format!("bad column name {:?}", raw.column));
        }
        let item = raw.item_type.unwrap_or(ValueType::String);
        let value = RuleValue::decode(raw.value_type, &raw.value, item)
            .map_err(|e| format!("rule on {}: {}", raw.column, e))?;
        if raw.op.wants_list() != matches!(value, RuleValue::Array(_)) {
            return Err(format!("rule on {}: {:?} and type {:?} do not fit", raw.column, raw.op, raw.value_type));
        }
        Ok(FilterRule {
            column: raw.column,
            op: raw.op,
            value,
        })
    }
}

impl From<FilterRule> for RawRule {
    fn from(rule: FilterRule) -> Self {
        let item_type = match &rule.value {
            RuleValue::Array(items) => items.first().map(|i| i.value_type()),
            _ => None,
        };
        RawRule {
            column: rule.column,
            op: rule.op,
            value_type: rule.value.value_type(),
            item_type,
            value: rule.value.encode(),
        }
    }
}

impl FilterRule {
    pub fn render(&self) -> String {
        format!("@{} {} {}", self.column, self.op.symbol(), self.value.render())
    }
}

pub fn rules_expr(rules: &[FilterRule]) -> String {
    rules.iter().map(|r| r.render()).collect::<Vec<_>>().join(" and ")
}

/// `@name` references in an expression, deduplicated. `@3` style
/// positional references and anything inside quotes are left alone.
pub fn column_refs(expr: &str) -> Vec<String> {
    COLUMN_REF
        .captures_iter(expr)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// CSV with a header of column names; each row becomes an AND-ed tuple
/// and the rows are OR-ed.
pub fn csv_filter(text: &str) -> Result<String> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| RollbackError::validation("row filter CSV is empty"))?
        .split(',')
        .map(str::trim)
        .collect();
    if let Some(bad) = header.iter().find(|h| !IDENT.is_match(h)) {
        return Err(RollbackError::validation(format!("bad column {:?} in CSV header", bad)));
    }

    let mut tuples = Vec::new();
    for (n, line) in lines.enumerate() {
        let values: Vec<&str> = line.split(',').map(str::trim).collect();
        if values.len() != header.len() {
            return Err(RollbackError::validation(format!(
                "CSV row {} has {} values, header has {}",
                n + 2,
                values.len(),
                header.len()
            )));
        }
        let conds: Vec<String> = header
            .iter()
            .zip(values)
            .map(|(col, v)| {
                let literal = match v.parse::<i64>() {
                    Ok(i) => i.to_string(),
                    Err(_) => quote(v.trim_matches('"')),
                };
                format!("@{} == {}", col, literal)
            })
            .collect();
        tuples.push(format!("({})", conds.join(" and ")));
    }
    if tuples.is_empty() {
        return Err(RollbackError::validation("row filter CSV has no rows"));
    }
    Ok(tuples.join(" or "))
}

/// The configured filter expression in column-name form, if any.
pub fn filter_expression(cfg: &FlashbackConfig) -> Result<Option<String>> {
    if !cfg.rows_filter.trim().is_empty() {
        return Ok(Some(cfg.rows_filter.trim().to_string()));
    }
    if let Some(path) = &cfg.rows_filter_file {
        return Ok(Some(csv_filter(&std::fs::read_to_string(path)?)?));
    }
    if !cfg.filter_rules.is_empty() {
        return Ok(Some(rules_expr(&cfg.filter_rules)));
    }
    Ok(None)
}

/// Exact `(db, table)` pairs. Column references are meaningless against
/// patterns, so wildcards are rejected here.
pub fn exact_tables(databases: &[String], tables: &[String]) -> Result<Vec<(String, String)>> {
    if tables.is_empty() {
        return Err(RollbackError::validation("column references in a row filter need an explicit table list"));
    }
    let mut out = Vec::with_capacity(tables.len());
    for entry in tables {
        if entry.contains('*') || entry.contains('%') {
            return Err(RollbackError::validation(format!(
                "table {:?} is a pattern; column references need exact tables",
                entry
            )));
        }
        match entry.split_once('.') {
            Some((db, t)) => out.push((db.to_string(), t.to_string())),
            None if databases.len() == 1 => out.push((databases[0].clone(), entry.clone())),
            None => {
                return Err(RollbackError::validation(format!(
                    "table {:?} needs a db. prefix unless exactly one database is given",
                    entry
                )))
            }
        }
    }
    Ok(out)
}

/// Position of each column, required to be identical across tables.
pub fn common_ordinals(
    per_table: &[(String, HashMap<String, usize>)],
    columns: &[String],
) -> Result<BTreeMap<String, usize>> {
    let mut out = BTreeMap::new();
    for column in columns {
        let mut seen: Option<(usize, &str)> = None;
        for (table, positions) in per_table {
            let pos = *positions.get(column).ok_or_else(|| {
                RollbackError::precheck(format!("column {} does not exist in {}", column, table))
            })?;
            match seen {
                Some((p, first)) if p != pos => {
                    return Err(RollbackError::precheck(format!(
                        "column {} is at position {} in {} but {} in {}",
                        column, p, first, pos, table
                    )))
                }
                Some(_) => {}
                None => seen = Some((pos, table)),
            }
        }
        if let Some((pos, _)) = seen {
            out.insert(column.clone(), pos);
        }
    }
    Ok(out)
}

/// Rewrite `@name` to `@N`. Every reference must be resolved.
pub fn translate(expr: &str, ordinals: &BTreeMap<String, usize>) -> Result<String> {
    if let Some(missing) = column_refs(expr).into_iter().find(|c| !ordinals.contains_key(c)) {
        return Err(RollbackError::precheck(format!("column {} could not be resolved", missing)));
    }
    Ok(COLUMN_REF
        .replace_all(expr, |c: &Captures| match c.get(1).and_then(|m| ordinals.get(m.as_str())) {
            Some(pos) => format!("@{}", pos),
            None => c[0].to_string(),
        })
        .into_owned())
}

pub async fn fetch_ordinals(pool: &MySqlPool, db: &str, table: &str) -> Result<HashMap<String, usize>> {
    let rows = sqlx::query(
        "SELECT COLUMN_NAME, CAST(ORDINAL_POSITION AS SIGNED) AS pos FROM information_schema.COLUMNS \
         WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
    )
    .bind(db)
    .bind(table)
    .fetch_all(pool)
    .await?;
    if rows.is_empty() {
        return Err(RollbackError::precheck(format!("table {}.{} does not exist", db, table)));
    }
    let mut out = HashMap::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("COLUMN_NAME")?;
        let pos: i64 = row.try_get("pos")?;
        out.insert(name, pos as usize);
    }
    Ok(out)
}

/// The decoder-ready filter: column names resolved against the live schema.
pub async fn resolve_row_filter(cfg: &FlashbackConfig, pool: &MySqlPool) -> Result<Option<String>> {
    let Some(expr) = filter_expression(cfg)? else {
        return Ok(None);
    };
    let columns = column_refs(&expr);
    if columns.is_empty() {
        return Ok(Some(expr));
    }
    let tables = exact_tables(&cfg.database_list(), &cfg.table_list())?;
    let mut per_table = Vec::with_capacity(tables.len());
    for (db, table) in &tables {
        per_table.push((format!("{}.{}", db, table), fetch_ordinals(pool, db, table).await?));
    }
    let ordinals = common_ordinals(&per_table, &columns)?;
    translate(&expr, &ordinals).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(cols: &[(&str, usize)]) -> HashMap<String, usize> {
        cols.iter().map(|(c, p)| (c.to_string(), *p)).collect()
    }

    #[test]
    fn test_rule_values_decoded_by_tag() {
        let rule: FilterRule =
            serde_json::from_str(r#"{"column":"uid","op":"eq","type":"int","value":"42"}"#).unwrap();
        assert_eq!(rule.value, RuleValue::Int(42));
        assert_eq!(rule.render(), "@uid == 42");

        let rule: FilterRule = serde_json::from_str(
            r#"{"column":"state","op":"in","type":"array","item_type":"string","value":["paid","it's"]}"#,
        )
        .unwrap();
        assert_eq!(rule.render(), r"@state in ('paid', 'it\'s')");

        let rule: FilterRule =
            serde_json::from_str(r#"{"column":"deleted","op":"ne","type":"bool","value":true}"#).unwrap();
        assert_eq!(rule.render(), "@deleted != 1");
    }

    #[test]
    fn test_rule_type_mismatch_rejected() {
        let bad = [
            r#"{"column":"uid","op":"eq","type":"int","value":"abc"}"#,
            r#"{"column":"uid","op":"in","type":"int","value":1}"#,
            r#"{"column":"uid","op":"eq","type":"array","value":[1]}"#,
            r#"{"column":"u id","op":"eq","type":"int","value":1}"#,
        ];
        for raw in bad {
            assert!(serde_json::from_str::<FilterRule>(raw).is_err(), "{}", raw);
        }
    }

    #[test]
    fn test_rules_serialize_back() {
        let rule = FilterRule {
            column: "uid".to_string(),
            op: RuleOp::In,
            value: RuleValue::Array(vec![RuleValue::Int(1), RuleValue::Int(2)]),
        };
        let json = serde_json::to_string(&rule).unwrap();
        let back: FilterRule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn test_csv_filter() {
        let expr = csv_filter("uid,name\n1,alice\n2,\"bob\"\n").unwrap();
        assert_eq!(expr, "(@uid == 1 and @name == 'alice') or (@uid == 2 and @name == 'bob')");
        assert!(csv_filter("uid,name\n1\n").is_err());
        assert!(csv_filter("uid\n").is_err());
    }

    #[test]
    fn test_translate_to_ordinals() {
        let per_table = vec![
            ("shop.orders_0".to_string(), positions(&[("id", 1), ("uid", 3)])),
            ("shop.orders_1".to_string(), positions(&[("id", 1), ("uid", 3)])),
        ];
        let expr = "@uid == 7 and @id > @2";
        let columns = column_refs(expr);
        assert_eq!(columns, vec!["id", "uid"]);
        let ordinals = common_ordinals(&per_table, &columns).unwrap();
        assert_eq!(translate(expr, &ordinals).unwrap(), "@3 == 7 and @1 > @2");
    }

    #[test]
    fn test_quoted_values_are_not_references() {
        let expr = csv_filter("uid,email\n7,alice@corp.com\n").unwrap();
        assert_eq!(column_refs(&expr), vec!["email", "uid"]);

        let mut ordinals: BTreeMap<String, usize> =
            [("uid".to_string(), 1), ("email".to_string(), 2)].into_iter().collect();
        assert_eq!(translate(&expr, &ordinals).unwrap(), "(@1 == 7 and @2 == 'alice@corp.com')");
        // a column that happens to share the name must not touch the value
        ordinals.insert("corp".to_string(), 5);
        assert_eq!(translate(&expr, &ordinals).unwrap(), "(@1 == 7 and @2 == 'alice@corp.com')");

        let rule: FilterRule =
            serde_json::from_str(r#"{"column":"note","op":"ne","type":"string","value":"it's @uid"}"#).unwrap();
        let expr = rules_expr(&[rule]);
        assert_eq!(column_refs(&expr), vec!["note"]);
        let ordinals: BTreeMap<String, usize> = [("note".to_string(), 4), ("uid".to_string(), 1)].into_iter().collect();
        assert_eq!(translate(&expr, &ordinals).unwrap(), r"@4 != 'it\'s @uid'");

        assert_eq!(column_refs(r#"@name == "x@y" or @id > 3"#), vec!["id", "name"]);
    }

    #[test]
    fn test_ordinal_must_match_across_tables() {
        let per_table = vec![
            ("a.t".to_string(), positions(&[("uid", 2)])),
            ("b.t".to_string(), positions(&[("uid", 4)])),
        ];
        let err = common_ordinals(&per_table, &["uid".to_string()]).unwrap_err();
        assert!(matches!(err, RollbackError::Precheck(ref m) if m.contains("position")));

        let per_table = vec![("a.t".to_string(), positions(&[("id", 1)]))];
        assert!(common_ordinals(&per_table, &["uid".to_string()]).is_err());
    }

    #[test]
    fn test_exact_tables() {
        let dbs = vec!["shop".to_string()];
        assert_eq!(
            exact_tables(&dbs, &["orders".to_string(), "bill.items".to_string()]).unwrap(),
            vec![
                ("shop".to_string(), "orders".to_string()),
                ("bill".to_string(), "items".to_string())
            ]
        );
        assert!(exact_tables(&dbs, &["order_*".to_string()]).is_err());
        assert!(exact_tables(&dbs, &[]).is_err());
        assert!(exact_tables(&[], &["orders".to_string()]).is_err());
    }
}

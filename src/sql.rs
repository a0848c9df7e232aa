use std::collections::BTreeSet;

use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBooking {
        id: Ulid,
        service_id: Ulid,
        staff_id: Ulid,
        date: NaiveDate,
        start: Minute,
        amount: Option<i64>,
    },
    InsertTransition {
        booking_id: Ulid,
        status: BookingStatus,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        id: Option<Ulid>,
    },
    SelectAvailability {
        staff_id: Ulid,
        date: NaiveDate,
        service_id: Option<Ulid>,
    },
    InsertService {
        service: Service,
    },
    DeleteService {
        id: Ulid,
    },
    SelectServices {
        id: Option<Ulid>,
    },
    InsertStaff {
        staff: StaffSchedule,
    },
    DeleteStaff {
        id: Ulid,
    },
    SelectStaff {
        id: Option<Ulid>,
    },
    InsertPolicy {
        policy: OperatingPolicy,
    },
    SelectPolicy,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let first = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [first] => first,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table a SELECT reads from, with `$n` parameters still unbound. Used to
/// describe result columns before execution.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Statement::Query(query) = stmts.first()? else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let v = extract_insert_values(insert)?;
    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.to_string().trim_matches('"').to_lowercase())
        .collect();
    check_insert_columns(&table, &columns, v.len())?;
    let arity = |min: usize| {
        if v.len() < min {
            Err(SqlError::WrongArity(table_label(&table), min, v.len()))
        } else {
            Ok(())
        }
    };

    match table.as_str() {
        "bookings" => {
            arity(5)?;
            Ok(Command::InsertBooking {
                id: parse_ulid(&v[0])?,
                service_id: parse_ulid(&v[1])?,
                staff_id: parse_ulid(&v[2])?,
                date: parse_date_expr(&v[3])?,
                start: parse_clock_expr(&v[4])?,
                amount: v.get(5).map(parse_i64_or_null).transpose()?.flatten(),
            })
        }
        "booking_transitions" => {
            arity(2)?;
            let status = parse_string(&v[1])?;
            Ok(Command::InsertTransition {
                booking_id: parse_ulid(&v[0])?,
                status: status.parse().map_err(SqlError::Parse)?,
            })
        }
        "services" => {
            arity(4)?;
            let duration = parse_i64(&v[2])?;
            Ok(Command::InsertService {
                service: Service {
                    id: parse_ulid(&v[0])?,
                    name: parse_string(&v[1])?,
                    duration: Minute::try_from(duration)
                        .map_err(|_| SqlError::Parse(format!("duration {duration} out of range")))?,
                    price: parse_i64(&v[3])?,
                    active: v.get(4).map(parse_bool).transpose()?.unwrap_or(true),
                },
            })
        }
        "staff" => {
            arity(7)?;
            Ok(Command::InsertStaff {
                staff: StaffSchedule {
                    id: parse_ulid(&v[0])?,
                    user_id: parse_ulid(&v[1])?,
                    name: parse_string(&v[2])?,
                    window: Span {
                        start: parse_clock_expr(&v[3])?,
                        end: parse_clock_expr(&v[4])?,
                    },
                    off_days: parse_weekdays(&v[5])?,
                    services: parse_ulid_list(&v[6])?,
                    active: true,
                },
            })
        }
        "salon_config" => {
            arity(4)?;
            let hours = match (parse_clock_or_null(&v[0])?, parse_clock_or_null(&v[1])?) {
                (Some(start), Some(end)) => Some(Span { start, end }),
                (None, None) => None,
                _ => {
                    return Err(SqlError::Parse(
                        "opening_time and closing_time must both be set or both be NULL".into(),
                    ));
                }
            };
            Ok(Command::InsertPolicy {
                policy: OperatingPolicy {
                    hours,
                    off_days: parse_weekdays(&v[2])?,
                    holidays: parse_date_list(&v[3])?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = match &delete.selection {
        Some(expr) => eq_filters(expr)?,
        None => Vec::new(),
    };
    let id = required_ulid(&filters, "id")?;

    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking { id }),
        "services" => Ok(Command::DeleteService { id }),
        "staff" => Ok(Command::DeleteStaff { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = match &select.selection {
        Some(expr) => eq_filters(expr)?,
        None => Vec::new(),
    };

    match table.as_str() {
        "bookings" => Ok(Command::SelectBookings {
            id: optional_ulid(&filters, "id")?,
        }),
        "services" => Ok(Command::SelectServices {
            id: optional_ulid(&filters, "id")?,
        }),
        "staff" => Ok(Command::SelectStaff {
            id: optional_ulid(&filters, "id")?,
        }),
        "salon_config" => Ok(Command::SelectPolicy),
        "availability" => Ok(Command::SelectAvailability {
            staff_id: required_ulid(&filters, "staff_id")?,
            date: filter(&filters, "date")
                .ok_or(SqlError::MissingFilter("date"))
                .and_then(parse_date_expr)?,
            service_id: optional_ulid(&filters, "service_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` pairs from an AND chain. Anything else in WHERE is refused
/// rather than silently ignored.
fn eq_filters(expr: &Expr) -> Result<Vec<(String, &Expr)>, SqlError> {
    let mut out = Vec::new();
    collect_eq_filters(expr, &mut out)?;
    Ok(out)
}

fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn filter<'a>(filters: &[(String, &'a Expr)], col: &str) -> Option<&'a Expr> {
    filters.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
}

fn optional_ulid(filters: &[(String, &Expr)], col: &str) -> Result<Option<Ulid>, SqlError> {
    filter(filters, col).map(parse_ulid).transpose()
}

fn required_ulid(filters: &[(String, &Expr)], col: &'static str) -> Result<Ulid, SqlError> {
    optional_ulid(filters, col)?.ok_or(SqlError::MissingFilter(col))
}

/// Positional column order of each insertable table.
fn insert_columns(table: &str) -> Option<&'static [&'static str]> {
    let columns: &'static [&'static str] = match table {
        "bookings" => &["id", "service_id", "staff_id", "date", "start_time", "amount"],
        "booking_transitions" => &["booking_id", "status"],
        "services" => &["id", "name", "duration", "price", "active"],
        "staff" => &["id", "user_id", "name", "start_time", "end_time", "off_days", "service_ids"],
        "salon_config" => &["opening_time", "closing_time", "off_days", "holidays"],
        _ => return None,
    };
    Some(columns)
}

/// Values are read by position, so a column list must name the leading
/// columns in table order, one per value.
fn check_insert_columns(table: &str, columns: &[String], values: usize) -> Result<(), SqlError> {
    let Some(expected) = insert_columns(table) else {
        return Ok(());
    };
    if values > expected.len() {
        return Err(SqlError::Parse(format!(
            "{table}: at most {} values, got {values}",
            expected.len()
        )));
    }
    if columns.is_empty() {
        return Ok(());
    }
    let in_order = columns.len() == values
        && columns
            .iter()
            .zip(expected)
            .all(|(col, want)| col == want);
    if !in_order {
        return Err(SqlError::Unsupported(format!(
            "column list for {table} must be ({})",
            expected[..values].join(", ")
        )));
    }
    Ok(())
}

fn table_label(table: &str) -> &'static str {
    match table {
        "bookings" => "bookings",
        "booking_transitions" => "booking_transitions",
        "services" => "services",
        "staff" => "staff",
        "salon_config" => "salon_config",
        _ => "table",
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// The single VALUES row. Multi-row inserts are refused.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

/// Comma-separated ULIDs in one string. `''` or NULL is the empty set.
fn parse_ulid_list(expr: &Expr) -> Result<BTreeSet<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(BTreeSet::new());
    }
    parse_string(expr)?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}"))))
        .collect()
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    parse_date(&s).ok_or_else(|| SqlError::Parse(format!("bad date {s:?}, expected YYYY-MM-DD")))
}

fn parse_date_list(expr: &Expr) -> Result<BTreeSet<NaiveDate>, SqlError> {
    if is_null(expr) {
        return Ok(BTreeSet::new());
    }
    parse_string(expr)?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_date(s).ok_or_else(|| SqlError::Parse(format!("bad date {s:?}, expected YYYY-MM-DD"))))
        .collect()
}

fn parse_clock_expr(expr: &Expr) -> Result<Minute, SqlError> {
    let s = parse_string(expr)?;
    parse_clock(&s).ok_or_else(|| SqlError::Parse(format!("bad time {s:?}, expected HH:MM")))
}

fn parse_clock_or_null(expr: &Expr) -> Result<Option<Minute>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_clock_expr(expr).map(Some)
}

fn parse_weekdays(expr: &Expr) -> Result<WeekdaySet, SqlError> {
    if is_null(expr) {
        return Ok(WeekdaySet::EMPTY);
    }
    parse_string(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_i64(expr).map(Some)
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

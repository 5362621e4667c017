use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSeat {
        seat: Seat,
    },
    SetMaintenance {
        seat_id: Ulid,
        on: bool,
    },
    InsertBooking {
        id: Ulid,
        seat_id: Ulid,
        date: NaiveDate,
        window: Window,
        /// Explicit device id; derived from the connection when absent.
        device_id: Option<String>,
    },
    ConfirmAttendance {
        booking_id: Ulid,
        present: bool,
    },
    StartBreak {
        booking_id: Ulid,
        window: Window,
    },
    EndBreak {
        booking_id: Ulid,
    },
    CancelBooking {
        booking_id: Ulid,
        reason: Option<String>,
    },
    /// Without a seat, the caller's own bookings.
    SelectBookings {
        seat_id: Option<Ulid>,
        date: Option<NaiveDate>,
    },
    SelectSeats {
        filter: SeatFilter,
        slot: Option<(NaiveDate, Window)>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let need = |n: usize| {
        if values.len() < n {
            Err(SqlError::WrongArity(table_label(&table), n, values.len()))
        } else {
            Ok(())
        }
    };

    match table.as_str() {
        "seats" => {
            need(5)?;
            Ok(Command::InsertSeat {
                seat: Seat {
                    id: parse_ulid(&values[0])?,
                    building: parse_string(&values[1])?,
                    floor: parse_string(&values[2])?,
                    section: parse_string(&values[3])?,
                    number: parse_string(&values[4])?,
                },
            })
        }
        "maintenance" => {
            need(1)?;
            Ok(Command::SetMaintenance {
                seat_id: parse_ulid(&values[0])?,
                on: true,
            })
        }
        "bookings" => {
            need(5)?;
            let device_id = match values.get(5) {
                Some(expr) => parse_string_or_null(expr)?,
                None => None,
            };
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                seat_id: parse_ulid(&values[1])?,
                date: parse_date_expr(&values[2])?,
                window: parse_window(&values[3], &values[4])?,
                device_id,
            })
        }
        "attendance" => {
            need(2)?;
            Ok(Command::ConfirmAttendance {
                booking_id: parse_ulid(&values[0])?,
                present: parse_bool(&values[1])?,
            })
        }
        "breaks" => {
            need(3)?;
            Ok(Command::StartBreak {
                booking_id: parse_ulid(&values[0])?,
                window: parse_window(&values[1], &values[2])?,
            })
        }
        "cancellations" => {
            need(1)?;
            let reason = match values.get(1) {
                Some(expr) => parse_string_or_null(expr)?,
                None => None,
            };
            Ok(Command::CancelBooking {
                booking_id: parse_ulid(&values[0])?,
                reason,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "maintenance" => Ok(Command::SetMaintenance {
            seat_id: extract_where_ulid(&delete.selection, "seat_id")?,
            on: false,
        }),
        "breaks" => Ok(Command::EndBreak {
            booking_id: extract_where_ulid(&delete.selection, "booking_id")?,
        }),
        "bookings" => Ok(Command::CancelBooking {
            booking_id: extract_where_ulid(&delete.selection, "id")?,
            reason: None,
        }),
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "bookings" => {
            let mut seat_id = None;
            let mut date = None;
            for (col, expr) in &filters {
                match col.as_str() {
                    "seat_id" => seat_id = Some(parse_ulid(expr)?),
                    "date" => date = Some(parse_date_expr(expr)?),
                    other => return Err(SqlError::Unsupported(format!("filter on {other}"))),
                }
            }
            Ok(Command::SelectBookings { seat_id, date })
        }
        "seats" => {
            let mut filter = SeatFilter::default();
            let (mut date, mut start, mut end) = (None, None, None);
            for (col, expr) in &filters {
                match col.as_str() {
                    "building" => filter.building = Some(parse_string(expr)?),
                    "floor" => filter.floor = Some(parse_string(expr)?),
                    "section" => filter.section = Some(parse_string(expr)?),
                    "date" => date = Some(parse_date_expr(expr)?),
                    "start" => start = Some(parse_time_expr(expr)?),
                    "end" => end = Some(parse_time_expr(expr)?),
                    other => return Err(SqlError::Unsupported(format!("filter on {other}"))),
                }
            }
            let slot = match (date, start, end) {
                (None, None, None) => None,
                (Some(date), Some(start), Some(end)) => Some((date, Window::new(start, end)?)),
                (None, _, _) => return Err(SqlError::MissingFilter("date")),
                (_, None, _) => return Err(SqlError::MissingFilter("start")),
                (_, _, None) => return Err(SqlError::MissingFilter("end")),
            };
            Ok(Command::SelectSeats { filter, slot })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y AND ...` into `(column, value)` pairs.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref().clone()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn table_label(table: &str) -> &'static str {
    match table {
        "seats" => "seats",
        "maintenance" => "maintenance",
        "bookings" => "bookings",
        "attendance" => "attendance",
        "breaks" => "breaks",
        "cancellations" => "cancellations",
        _ => "table",
    }
}

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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn extract_where_ulid(selection: &Option<Expr>, column: &'static str) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter(column))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some(column) => parse_ulid(right),
        _ => Err(SqlError::MissingFilter(column)),
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    Ok(parse_date(&parse_string(expr)?)?)
}

fn parse_time_expr(expr: &Expr) -> Result<TimeOfDay, SqlError> {
    Ok(TimeOfDay::parse(&parse_string(expr)?)?)
}

fn parse_window(start: &Expr, end: &Expr) -> Result<Window, SqlError> {
    Ok(Window::new(parse_time_expr(start)?, parse_time_expr(end)?)?)
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
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    /// Well-formed SQL carrying a bad date or time.
    #[error(transparent)]
    Invalid(#[from] ParseError),
}

use chrono::NaiveDate;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertRoom {
        id: RoomId,
        hotel_id: HotelId,
        nightly_price: i64,
        total_units: u32,
    },
    DeleteRoom {
        id: RoomId,
    },
    InsertBooking {
        room_id: RoomId,
        user_id: UserId,
        date_from: NaiveDate,
        date_to: NaiveDate,
    },
    DeleteBooking {
        id: ReservationId,
        user_id: UserId,
    },
    SelectRooms {
        hotel_id: Option<HotelId>,
    },
    SelectBookings {
        user_id: Option<UserId>,
        page: Page,
    },
    SelectAvailability {
        room_id: RoomId,
        date_from: NaiveDate,
        date_to: NaiveDate,
    },
    SelectAvailableRooms {
        hotel_id: HotelId,
        date_from: NaiveDate,
        date_to: NaiveDate,
        page: Page,
    },
}

const ROOM_COLUMNS: [&str; 4] = ["id", "hotel_id", "nightly_price", "total_units"];
const BOOKING_COLUMNS: [&str; 4] = ["room_id", "user_id", "date_from", "date_to"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table whose rows a statement returns, if any: the FROM table of a SELECT,
/// or `bookings` for a booking INSERT (it returns the created row). Works on
/// statements that still contain `$n` placeholders.
pub fn result_table(sql: &str) -> Option<String> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    match stmts.first()? {
        Statement::Insert(insert) => {
            insert_table_name(insert).ok().filter(|t| t == "bookings")
        }
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => select
                .from
                .first()
                .and_then(|from| table_factor_name(&from.relation).ok()),
            _ => None,
        },
        _ => None,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "rooms" => {
            let row = Row::from_insert(insert, &ROOM_COLUMNS)?;
            Ok(Command::UpsertRoom {
                id: parse_i64_expr(row.get("id")?)?,
                hotel_id: parse_i64_expr(row.get("hotel_id")?)?,
                nightly_price: parse_i64_expr(row.get("nightly_price")?)?,
                total_units: parse_u32(row.get("total_units")?)?,
            })
        }
        "bookings" => {
            let row = Row::from_insert(insert, &BOOKING_COLUMNS)?;
            Ok(Command::InsertBooking {
                room_id: parse_i64_expr(row.get("room_id")?)?,
                user_id: parse_i64_expr(row.get("user_id")?)?,
                date_from: parse_date_expr(row.get("date_from")?)?,
                date_to: parse_date_expr(row.get("date_to")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "rooms" => {
            filters.only(&["id"])?;
            Ok(Command::DeleteRoom {
                id: filters.required_i64("id")?,
            })
        }
        "bookings" => {
            filters.only(&["id", "user_id"])?;
            Ok(Command::DeleteBooking {
                id: filters.required_i64("id")?,
                user_id: filters.required_i64("user_id")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "rooms" => {
            filters.only(&["hotel_id"])?;
            Ok(Command::SelectRooms {
                hotel_id: filters.optional_i64("hotel_id")?,
            })
        }
        "bookings" => {
            filters.only(&["user_id", "page", "per_page"])?;
            Ok(Command::SelectBookings {
                user_id: filters.optional_i64("user_id")?,
                page: filters.page()?,
            })
        }
        "availability" => {
            filters.only(&["room_id", "date_from", "date_to"])?;
            Ok(Command::SelectAvailability {
                room_id: filters.required_i64("room_id")?,
                date_from: filters.required_date("date_from")?,
                date_to: filters.required_date("date_to")?,
            })
        }
        "available_rooms" => {
            filters.only(&["hotel_id", "date_from", "date_to", "page", "per_page"])?;
            Ok(Command::SelectAvailableRooms {
                hotel_id: filters.required_i64("hotel_id")?,
                date_from: filters.required_date("date_from")?,
                date_to: filters.required_date("date_to")?,
                page: filters.page()?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Rows and filters ──────────────────────────────────────────

/// One VALUES row keyed by column name. Without a column list, values are
/// taken in the table's canonical order.
struct Row<'a> {
    values: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn from_insert(insert: &'a ast::Insert, canonical: &[&str]) -> Result<Self, SqlError> {
        let rows = extract_insert_rows(insert)?;
        if rows.len() > 1 {
            return Err(SqlError::Unsupported("multi-row INSERT".into()));
        }
        let exprs = &rows[0];
        let names: Vec<String> = if insert.columns.is_empty() {
            canonical.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if names.len() != exprs.len() {
            return Err(SqlError::WrongArity(names.len(), exprs.len()));
        }
        if let Some(unknown) = names.iter().find(|n| !canonical.contains(&n.as_str())) {
            return Err(SqlError::UnknownColumn(unknown.clone()));
        }
        Ok(Self {
            values: names.into_iter().zip(exprs.iter()).collect(),
        })
    }

    fn get(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| *expr)
            .ok_or(SqlError::MissingColumn(column))
    }
}

/// `col = value` terms of a WHERE clause joined by AND.
struct Filters<'a> {
    terms: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut terms = Vec::new();
        if let Some(expr) = selection {
            collect_eq_terms(expr, &mut terms)?;
        }
        Ok(Self { terms })
    }

    /// Reject any column outside `allowed`.
    fn only(&self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.terms.iter().find(|(col, _)| !allowed.contains(&col.as_str())) {
            Some((col, _)) => Err(SqlError::UnknownColumn(col.clone())),
            None => Ok(()),
        }
    }

    fn find(&self, column: &str) -> Option<&'a Expr> {
        self.terms
            .iter()
            .find(|(col, _)| col == column)
            .map(|(_, expr)| *expr)
    }

    fn optional_i64(&self, column: &str) -> Result<Option<i64>, SqlError> {
        self.find(column).map(parse_i64_expr).transpose()
    }

    fn required_i64(&self, column: &'static str) -> Result<i64, SqlError> {
        self.optional_i64(column)?
            .ok_or(SqlError::MissingFilter(column))
    }

    fn required_date(&self, column: &'static str) -> Result<NaiveDate, SqlError> {
        let expr = self.find(column).ok_or(SqlError::MissingFilter(column))?;
        parse_date_expr(expr)
    }

    /// Out-of-range numbers saturate so the engine reports them as an
    /// invalid page rather than a parse error.
    fn page(&self) -> Result<Page, SqlError> {
        let default = Page::default();
        let clamp = |v: i64| u32::try_from(v.max(0)).unwrap_or(u32::MAX);
        Ok(Page {
            page: self.optional_i64("page")?.map_or(default.page, clamp),
            per_page: self.optional_i64("per_page")?.map_or(default.per_page, clamp),
        })
    }
}

fn collect_eq_terms<'a>(
    expr: &'a Expr,
    terms: &mut Vec<(String, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_terms(inner, terms),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_terms(left, terms)?;
                collect_eq_terms(right, terms)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                if terms.iter().any(|(c, _)| *c == col) {
                    return Err(SqlError::Unsupported(format!("duplicate filter on {col}")));
                }
                terms.push((col, right.as_ref()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
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

/// Integers arrive bare or quoted; extended-query parameters are always
/// substituted as quoted strings.
fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected integer, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        parse_i64_expr(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("integer out of range".into()))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range for a unit count")))
}

/// `'YYYY-MM-DD'`, optionally cast: `'2025-03-01'::date`.
fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    if let Expr::Cast { expr: inner, .. } = expr {
        return parse_date_expr(inner);
    }
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected 'YYYY-MM-DD', got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

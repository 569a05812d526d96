use chrono::NaiveDate;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::{BookingKind, CandidateStatus, Ms, Resolution};

/// Parsed command from SQL input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    UpsertCandidate {
        id: Ulid,
        first_name: String,
        status: CandidateStatus,
    },
    SetCandidateStatus {
        id: Ulid,
        status: CandidateStatus,
        reason: Option<String>,
    },
    InsertLink {
        id: Ulid,
        candidate_id: Ulid,
        kind: BookingKind,
        expires_at: Ms,
        max_uses: u32,
        duration_min: Option<u32>,
        job: Option<String>,
        branch: Option<String>,
    },
    RevokeLink {
        id: Ulid,
    },
    SetSchedule {
        kind: BookingKind,
        config_json: String,
    },
    SetBlocks {
        config_json: String,
    },
    SelectAvailability {
        token: String,
    },
    SelectSlots {
        token: String,
        date: NaiveDate,
    },
    InsertBooking {
        token: String,
        date: NaiveDate,
        time: String,
    },
    ResolveInterview {
        id: Ulid,
        resolution: Resolution,
        notes: Option<String>,
        date: Option<NaiveDate>,
        time: Option<String>,
    },
    SelectInterviews {
        date: Option<NaiveDate>,
        candidate_id: Option<Ulid>,
    },
    SelectLink {
        id: Ulid,
    },
    SweepInterviews,
    SweepLinks,
    Listen {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }
    if let Some(rest) = upper.strip_prefix("SWEEP ") {
        return match rest.trim().trim_matches(';') {
            "INTERVIEWS" => Ok(Command::SweepInterviews),
            "LINKS" => Ok(Command::SweepLinks),
            other => Err(SqlError::Unsupported(format!("SWEEP {other}"))),
        };
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update { table, assignments, selection, .. } => {
            parse_update(table, assignments, selection)
        }
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "candidates" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("candidates", 3, values.len()));
            }
            Ok(Command::UpsertCandidate {
                id: parse_ulid(&values[0])?,
                first_name: parse_string(&values[1])?,
                status: parse_candidate_status(&values[2])?,
            })
        }
        "links" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("links", 4, values.len()));
            }
            let max_uses = if values.len() >= 5 { parse_u32(&values[4])? } else { 1 };
            let duration_min = if values.len() >= 6 {
                parse_u32_or_null(&values[5])?
            } else {
                None
            };
            let job = if values.len() >= 7 { parse_string_or_null(&values[6])? } else { None };
            let branch =
                if values.len() >= 8 { parse_string_or_null(&values[7])? } else { None };
            Ok(Command::InsertLink {
                id: parse_ulid(&values[0])?,
                candidate_id: parse_ulid(&values[1])?,
                kind: parse_kind(&values[2])?,
                expires_at: parse_i64(&values[3])?,
                max_uses,
                duration_min,
                job,
                branch,
            })
        }
        "bookings" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("bookings", 3, values.len()));
            }
            Ok(Command::InsertBooking {
                token: parse_string(&values[0])?,
                date: parse_date(&values[1])?,
                time: parse_string(&values[2])?,
            })
        }
        "schedules" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("schedules", 2, values.len()));
            }
            Ok(Command::SetSchedule {
                kind: parse_kind(&values[0])?,
                config_json: parse_string(&values[1])?,
            })
        }
        "blocks" => {
            if values.is_empty() {
                return Err(SqlError::WrongArity("blocks", 1, 0));
            }
            Ok(Command::SetBlocks { config_json: parse_string(&values[0])? })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "links" => Ok(Command::RevokeLink { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    match table.as_str() {
        "candidates" => {
            let mut status = None;
            let mut reason = None;
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "status" => status = Some(parse_candidate_status(&a.value)?),
                    "reason" => reason = parse_string_or_null(&a.value)?,
                    other => {
                        return Err(SqlError::Parse(format!("unknown column: {other}")));
                    }
                }
            }
            let status = status.ok_or(SqlError::MissingFilter("status"))?;
            Ok(Command::SetCandidateStatus { id, status, reason })
        }
        "interviews" => {
            let mut resolution = None;
            let mut notes = None;
            let mut date = None;
            let mut time = None;
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "resolution" => {
                        let s = parse_string(&a.value)?;
                        resolution = Some(
                            Resolution::parse(&s)
                                .ok_or_else(|| SqlError::Parse(format!("bad resolution: {s}")))?,
                        );
                    }
                    "notes" => notes = parse_string_or_null(&a.value)?,
                    "date" => date = Some(parse_date(&a.value)?),
                    "time" => time = Some(parse_string(&a.value)?),
                    other => {
                        return Err(SqlError::Parse(format!("unknown column: {other}")));
                    }
                }
            }
            let resolution = resolution.ok_or(SqlError::MissingFilter("resolution"))?;
            Ok(Command::ResolveInterview { id, resolution, notes, date, time })
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            token: filters.token.ok_or(SqlError::MissingFilter("token"))?,
        }),
        "slots" => Ok(Command::SelectSlots {
            token: filters.token.ok_or(SqlError::MissingFilter("token"))?,
            date: filters.date.ok_or(SqlError::MissingFilter("date"))?,
        }),
        "interviews" => {
            if filters.date.is_none() && filters.candidate_id.is_none() {
                return Err(SqlError::MissingFilter("date or candidate_id"));
            }
            Ok(Command::SelectInterviews {
                date: filters.date,
                candidate_id: filters.candidate_id,
            })
        }
        "links" => Ok(Command::SelectLink {
            id: filters.id.ok_or(SqlError::MissingFilter("id"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters {
    token: Option<String>,
    date: Option<NaiveDate>,
    id: Option<Ulid>,
    candidate_id: Option<Ulid>,
}

fn collect_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                collect_filters(left, filters)?;
                collect_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("token") => filters.token = Some(parse_string(right)?),
                Some("date") => filters.date = Some(parse_date(right)?),
                Some("id") => filters.id = Some(parse_ulid(right)?),
                Some("candidate_id") => filters.candidate_id = Some(parse_ulid(right)?),
                _ => {}
            },
            _ => {}
        }
    }
    Ok(())
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn assignment_column(a: &ast::Assignment) -> Result<String, SqlError> {
    match &a.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            Value::Number(s, _) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => {
                s.parse().map_err(|e| SqlError::Parse(format!("bad i64: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } = expr {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    parse_u32(expr).map(Some)
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date '{s}': {e}")))
}

fn parse_kind(expr: &Expr) -> Result<BookingKind, SqlError> {
    let s = parse_string(expr)?;
    BookingKind::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad booking kind: {s}")))
}

fn parse_candidate_status(expr: &Expr) -> Result<CandidateStatus, SqlError> {
    let s = parse_string(expr)?;
    CandidateStatus::parse(&s)
        .ok_or_else(|| SqlError::Parse(format!("bad candidate status: {s}")))
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
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    #[test]
    fn parse_upsert_candidate() {
        let sql =
            format!("INSERT INTO candidates (id, first_name, status) VALUES ('{ID}', 'Dana', 'invite_sent')");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::UpsertCandidate { id, first_name, status } => {
                assert_eq!(id.to_string(), ID);
                assert_eq!(first_name, "Dana");
                assert_eq!(status, CandidateStatus::InviteSent);
            }
            _ => panic!("expected UpsertCandidate, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_link_minimal() {
        let sql = format!(
            "INSERT INTO links (id, candidate_id, kind, expires_at) VALUES ('{ID}', '{ID}', 'interview', 1900000000000)"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertLink { kind, expires_at, max_uses, duration_min, .. } => {
                assert_eq!(kind, BookingKind::Interview);
                assert_eq!(expires_at, 1_900_000_000_000);
                assert_eq!(max_uses, 1);
                assert_eq!(duration_min, None);
            }
            _ => panic!("expected InsertLink, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_link_full() {
        let sql = format!(
            "INSERT INTO links (id, candidate_id, kind, expires_at, max_uses, duration, job, branch) \
             VALUES ('{ID}', '{ID}', 'trial', 1900000000000, 3, 60, 'barista', NULL)"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertLink { kind, max_uses, duration_min, job, branch, .. } => {
                assert_eq!(kind, BookingKind::Trial);
                assert_eq!(max_uses, 3);
                assert_eq!(duration_min, Some(60));
                assert_eq!(job.as_deref(), Some("barista"));
                assert_eq!(branch, None);
            }
            _ => panic!("expected InsertLink, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_submit_booking() {
        let sql = "INSERT INTO bookings (token, date, time) VALUES ('abc', '2025-06-02', '09:30')";
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::InsertBooking { token, date, time } => {
                assert_eq!(token, "abc");
                assert_eq!(date, NaiveDate::from_ymd_opt(2025, 6, 2).unwrap());
                assert_eq!(time, "09:30");
            }
            _ => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_revoke_link() {
        let sql = format!("DELETE FROM links WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::RevokeLink { .. }));
    }

    #[test]
    fn parse_select_availability() {
        let cmd = parse_sql("SELECT * FROM availability WHERE token = 'tok'").unwrap();
        match cmd {
            Command::SelectAvailability { token } => assert_eq!(token, "tok"),
            _ => panic!("expected SelectAvailability, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_slots() {
        let cmd =
            parse_sql("SELECT * FROM slots WHERE token = 'tok' AND date = '2025-06-02'").unwrap();
        match cmd {
            Command::SelectSlots { token, date } => {
                assert_eq!(token, "tok");
                assert_eq!(date, NaiveDate::from_ymd_opt(2025, 6, 2).unwrap());
            }
            _ => panic!("expected SelectSlots, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_slots_requires_date() {
        assert!(matches!(
            parse_sql("SELECT * FROM slots WHERE token = 'tok'"),
            Err(SqlError::MissingFilter("date"))
        ));
    }

    #[test]
    fn parse_select_interviews_by_either_filter() {
        let cmd = parse_sql("SELECT * FROM interviews WHERE date = '2025-06-02'").unwrap();
        assert!(matches!(cmd, Command::SelectInterviews { date: Some(_), candidate_id: None }));

        let sql = format!("SELECT * FROM interviews WHERE candidate_id = '{ID}'");
        let cmd = parse_sql(&sql).unwrap();
        assert!(matches!(cmd, Command::SelectInterviews { date: None, candidate_id: Some(_) }));

        assert!(parse_sql("SELECT * FROM interviews").is_err());
    }

    #[test]
    fn parse_update_candidate_status() {
        let sql =
            format!("UPDATE candidates SET status = 'withdrawn', reason = 'moved away' WHERE id = '{ID}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::SetCandidateStatus { status, reason, .. } => {
                assert_eq!(status, CandidateStatus::Withdrawn);
                assert_eq!(reason.as_deref(), Some("moved away"));
            }
            _ => panic!("expected SetCandidateStatus, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_resolve_interview() {
        let sql = format!("UPDATE interviews SET resolution = 'no_show' WHERE id = '{ID}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::ResolveInterview { resolution, notes, date, time, .. } => {
                assert_eq!(resolution, Resolution::NoShow);
                assert_eq!(notes, None);
                assert_eq!(date, None);
                assert_eq!(time, None);
            }
            _ => panic!("expected ResolveInterview, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_resolve_interview_reschedule() {
        let sql = format!(
            "UPDATE interviews SET resolution = 'rescheduled', date = '2025-06-09', time = '10:00' WHERE id = '{ID}'"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::ResolveInterview { resolution, date, time, .. } => {
                assert_eq!(resolution, Resolution::Rescheduled);
                assert_eq!(date, Some(NaiveDate::from_ymd_opt(2025, 6, 9).unwrap()));
                assert_eq!(time.as_deref(), Some("10:00"));
            }
            _ => panic!("expected ResolveInterview, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_schedules_and_blocks() {
        let cmd = parse_sql(
            r#"INSERT INTO schedules (kind, config) VALUES ('interview', '{"slot_duration_min":45}')"#,
        )
        .unwrap();
        match cmd {
            Command::SetSchedule { kind, config_json } => {
                assert_eq!(kind, BookingKind::Interview);
                assert!(config_json.contains("45"));
            }
            _ => panic!("expected SetSchedule, got {cmd:?}"),
        }

        let cmd =
            parse_sql(r#"INSERT INTO blocks (config) VALUES ('{"bank_holidays":[]}')"#).unwrap();
        assert!(matches!(cmd, Command::SetBlocks { .. }));
    }

    #[test]
    fn parse_sweeps() {
        assert_eq!(parse_sql("SWEEP INTERVIEWS").unwrap(), Command::SweepInterviews);
        assert_eq!(parse_sql("sweep links;").unwrap(), Command::SweepLinks);
        assert!(parse_sql("SWEEP EVERYTHING").is_err());
    }

    #[test]
    fn parse_listen() {
        let sql = format!("LISTEN candidate_{ID}");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::Listen { channel } => {
                assert_eq!(channel, format!("candidate_{ID}"));
            }
            _ => panic!("expected Listen, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(parse_sql(&format!("INSERT INTO foobar (id) VALUES ('{ID}')")).is_err());
        assert!(parse_sql("SELECT * FROM foobar WHERE id = '1'").is_err());
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::engine::{now_ms, Engine, EngineError};
use crate::model::*;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct IntakeHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<IntakeQueryParser>,
}

impl IntakeHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self { tenant_manager, query_parser: Arc::new(IntakeQueryParser) }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = crate::observability::command_label(&cmd);
        metrics::counter!(crate::observability::QUERIES_TOTAL, "command" => label).increment(1);
        let started = std::time::Instant::now();
        let result = self.dispatch(engine, cmd).await;
        metrics::histogram!(crate::observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn dispatch(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::UpsertCandidate { id, first_name, status } => {
                engine
                    .upsert_candidate(id, first_name, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SetCandidateStatus { id, status, reason } => {
                engine
                    .set_candidate_status(id, status, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertLink {
                id,
                candidate_id,
                kind,
                expires_at,
                max_uses,
                duration_min,
                job,
                branch,
            } => {
                let secret = engine
                    .create_link(id, candidate_id, kind, duration_min, job, branch, expires_at, max_uses)
                    .await
                    .map_err(engine_err)?;

                // The secret's single appearance anywhere.
                let schema = Arc::new(link_secret_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&id.to_string())?;
                encoder.encode_field(&secret)?;
                let row = encoder.take_row();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(vec![Ok(row)])))])
            }
            Command::RevokeLink { id } => {
                engine.revoke_link(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SetSchedule { kind, config_json } => {
                let config: AvailabilityConfig =
                    serde_json::from_str(&config_json).map_err(|e| {
                        user_err("22023", format!("bad schedule config: {e}"))
                    })?;
                engine.set_schedule(kind, config).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SetBlocks { config_json } => {
                let blocks: BookingBlocks = serde_json::from_str(&config_json)
                    .map_err(|e| user_err("22023", format!("bad blocks config: {e}")))?;
                engine.set_blocks(blocks).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectAvailability { token } => {
                let summary = engine
                    .availability_summary(&token, now_ms())
                    .await
                    .map_err(engine_err)?;
                let payload = serde_json::to_string(&summary)
                    .map_err(|e| user_err("XX000", format!("encode error: {e}")))?;

                let schema = Arc::new(availability_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&payload)?;
                let row = encoder.take_row();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(vec![Ok(row)])))])
            }
            Command::SelectSlots { token, date } => {
                let listing = engine
                    .time_slots(&token, date, now_ms())
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<_>> = match listing {
                    DaySlots::Blocked { reason } => {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&None::<&str>)?;
                        encoder.encode_field(&false)?;
                        encoder.encode_field(&reason)?;
                        encoder.encode_field(&true)?;
                        vec![Ok(encoder.take_row())]
                    }
                    DaySlots::Open { slots } => slots
                        .into_iter()
                        .map(|slot| {
                            let mut encoder = DataRowEncoder::new(schema.clone());
                            encoder.encode_field(&format_hhmm(slot.start_minute))?;
                            encoder.encode_field(&slot.available)?;
                            encoder.encode_field(&slot.reason.map(|r| r.as_str()))?;
                            encoder.encode_field(&false)?;
                            Ok(encoder.take_row())
                        })
                        .collect(),
                };
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertBooking { token, date, time } => {
                let receipt = engine
                    .submit_booking(&token, date, &time, now_ms())
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(receipt_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&receipt.interview_id.to_string())?;
                encoder.encode_field(&receipt.confirmation_code)?;
                let row = encoder.take_row();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(vec![Ok(row)])))])
            }
            Command::ResolveInterview { id, resolution, notes, date, time } => {
                let new_at = match (date, time) {
                    (Some(date), Some(time)) => {
                        let minute = parse_hhmm(&time)
                            .ok_or_else(|| user_err("22023", "time must be HH:MM".into()))?;
                        Some(instant_at(date, minute, engine.offset_min()))
                    }
                    (None, None) => None,
                    _ => {
                        return Err(user_err(
                            "22023",
                            "reschedule needs both date and time".into(),
                        ));
                    }
                };
                let status = engine
                    .resolve_interview(id, resolution, notes, new_at, now_ms())
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(resolution_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&status.as_str())?;
                let row = encoder.take_row();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(vec![Ok(row)])))])
            }
            Command::SelectInterviews { date, candidate_id } => {
                let interviews = match (date, candidate_id) {
                    (Some(date), _) => engine.interviews_on(date).await,
                    (None, Some(candidate_id)) => engine.interviews_for(candidate_id).await,
                    (None, None) => Vec::new(),
                };

                let offset = engine.offset_min();
                let schema = Arc::new(interviews_schema());
                let rows: Vec<PgWireResult<_>> = interviews
                    .into_iter()
                    .map(|i| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&i.id.to_string())?;
                        encoder.encode_field(&i.candidate_id.to_string())?;
                        encoder.encode_field(&i.kind.as_str())?;
                        encoder.encode_field(&local_date(i.scheduled_at, offset).to_string())?;
                        encoder
                            .encode_field(&format_hhmm(local_minute(i.scheduled_at, offset)))?;
                        encoder.encode_field(&(i.duration_min as i32))?;
                        encoder.encode_field(&i.status.as_str())?;
                        encoder.encode_field(&i.confirmation_code)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectLink { id } => {
                let schema = Arc::new(links_schema());
                let rows: Vec<PgWireResult<_>> = match engine.get_link(id).await {
                    Some(link) => {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&link.id.to_string())?;
                        encoder.encode_field(&link.candidate_id.to_string())?;
                        encoder.encode_field(&link.kind.as_str())?;
                        encoder.encode_field(&link.status.as_str())?;
                        encoder.encode_field(&link.expires_at)?;
                        encoder.encode_field(&(link.max_uses as i32))?;
                        encoder.encode_field(&(link.use_count as i32))?;
                        vec![Ok(encoder.take_row())]
                    }
                    None => Vec::new(),
                };
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SweepInterviews => {
                let report = engine
                    .sweep_lapsed_interviews(now_ms())
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("SWEEP").with_rows(report.transitions() as usize),
                )])
            }
            Command::SweepLinks => {
                let report = engine.sweep_expired_links(now_ms()).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("SWEEP").with_rows(report.transitions() as usize),
                )])
            }
            Command::Listen { channel } => {
                let candidate_str = channel.strip_prefix("candidate_").ok_or_else(|| {
                    user_err(
                        "42000",
                        format!("invalid channel: {channel} (expected candidate_{{id}})"),
                    )
                })?;
                let _candidate_id = Ulid::from_string(candidate_str)
                    .map_err(|e| user_err("42000", format!("bad ULID in channel: {e}")))?;
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text_field("availability")]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text_field("time"),
        FieldInfo::new("available".into(), None, None, Type::BOOL, FieldFormat::Text),
        text_field("reason"),
        FieldInfo::new("blocked".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn receipt_schema() -> Vec<FieldInfo> {
    vec![text_field("interview_id"), text_field("confirmation_code")]
}

fn link_secret_schema() -> Vec<FieldInfo> {
    vec![text_field("link_id"), text_field("token")]
}

fn resolution_schema() -> Vec<FieldInfo> {
    vec![text_field("status")]
}

fn interviews_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("candidate_id"),
        text_field("kind"),
        text_field("date"),
        text_field("time"),
        FieldInfo::new("duration".into(), None, None, Type::INT4, FieldFormat::Text),
        text_field("status"),
        text_field("confirmation_code"),
    ]
}

fn links_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("candidate_id"),
        text_field("kind"),
        text_field("status"),
        FieldInfo::new("expires_at".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("max_uses".into(), None, None, Type::INT4, FieldFormat::Text),
        FieldInfo::new("use_count".into(), None, None, Type::INT4, FieldFormat::Text),
    ]
}

/// Best-effort schema sniffing for Describe, mirroring the statement
/// shapes the parser accepts.
fn schema_for_statement(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("SELECT") && upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("SELECT") && upper.contains("SLOTS") {
        slots_schema()
    } else if upper.contains("SELECT") && upper.contains("INTERVIEWS") {
        interviews_schema()
    } else if upper.contains("SELECT") && upper.contains("LINKS") {
        links_schema()
    } else if upper.contains("INSERT") && upper.contains("BOOKINGS") {
        receipt_schema()
    } else if upper.contains("INSERT") && upper.contains("LINKS") {
        link_secret_schema()
    } else if upper.contains("UPDATE") && upper.contains("INTERVIEWS") {
        resolution_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for IntakeHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute_command(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct IntakeQueryParser;

#[async_trait]
impl QueryParser for IntakeQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for_statement(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for IntakeHandler {
    type Statement = String;
    type QueryParser = IntakeQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(&engine, cmd).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for_statement(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for_statement(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
                && n > max
            {
                max = n;
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values
/// (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct IntakeFactory {
    handler: Arc<IntakeHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<crate::auth::IntakeAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl IntakeFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = crate::auth::IntakeAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(IntakeHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for IntakeFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one accepted TCP connection until the client goes away.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), std::io::Error> {
    let factory = Arc::new(IntakeFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_err(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// Engine errors keep their taxonomy visible through stable SQLSTATE
/// codes; `conflict` maps to serialization_failure so clients treat it
/// as retryable.
fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::InvalidInput(_) => "22023",
        EngineError::InvalidToken => "28000",
        EngineError::InThePast | EngineError::BlockedHoliday | EngineError::BlockedLunch => {
            "22007"
        }
        EngineError::Conflict => "40001",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    };
    user_err(code, e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_err("42601", e.to_string())
}

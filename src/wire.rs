use std::fmt::Debug;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
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

use crate::auth::SeatdAuthSource;
use crate::device::{DeviceId, DeviceSignals};
use crate::engine::{now_local, BookingRequest, Engine, EngineError, ErrorCategory};
use crate::model::*;
use crate::observability;
use crate::site::SiteManager;
use crate::sql::{self, Command, SqlError};

/// Who is asking, and from where. Built from the connection's startup
/// parameters on every query.
struct Session {
    engine: Arc<Engine>,
    member_id: String,
    signals: DeviceSignals,
}

impl Session {
    fn device(&self, explicit: Option<String>) -> Result<DeviceId, EngineError> {
        let device = match explicit {
            Some(raw) => DeviceId::parse(&raw)?,
            None => self.signals.fingerprint()?,
        };
        Ok(device)
    }
}

pub struct SeatdHandler {
    sites: Arc<SiteManager>,
    query_parser: Arc<SeatdQueryParser>,
}

impl SeatdHandler {
    pub fn new(sites: Arc<SiteManager>) -> Self {
        Self {
            sites,
            query_parser: Arc::new(SeatdQueryParser),
        }
    }

    fn session<C: ClientInfo>(&self, client: &C) -> PgWireResult<Session> {
        let metadata = client.metadata();
        let site = metadata
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let engine = self
            .sites
            .get_or_create(&site)
            .map_err(|e| user_error("08006", format!("site error: {e}")))?;
        let member_id = metadata
            .get("user")
            .cloned()
            .ok_or_else(|| user_error("28000", "no user in startup parameters".into()))?;
        let signals = DeviceSignals {
            user_agent: metadata.get("application_name").cloned(),
            accept: None,
            accept_language: None,
            accept_encoding: metadata.get("client_encoding").cloned(),
            client_addr: Some(client.socket_addr().ip()),
        };
        Ok(Session {
            engine,
            member_id,
            signals,
        })
    }

    async fn run(&self, session: &Session, query: &str) -> PgWireResult<Response> {
        let start = std::time::Instant::now();
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let result = self.execute_command(session, cmd, now_local()).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        session: &Session,
        cmd: Command,
        now: NaiveDateTime,
    ) -> PgWireResult<Response> {
        let engine = &session.engine;
        let member = session.member_id.as_str();
        match cmd {
            Command::InsertSeat { seat } => {
                engine.create_seat(seat).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SetMaintenance { seat_id, on } => {
                engine.set_maintenance(seat_id, on).await.map_err(engine_err)?;
                let tag = if on { "INSERT" } else { "DELETE" };
                Ok(Response::Execution(Tag::new(tag).with_rows(1)))
            }
            Command::InsertBooking {
                id,
                seat_id,
                date,
                window,
                device_id,
            } => {
                let req = BookingRequest {
                    id,
                    seat_id,
                    member_id: session.member_id.clone(),
                    device_id: session.device(device_id).map_err(engine_err)?,
                    date,
                    window,
                };
                engine.book(req, now).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::ConfirmAttendance { booking_id, present } => {
                match engine.confirm_attendance(booking_id, member, present, now).await {
                    Ok(_) => Ok(Response::Execution(Tag::new("INSERT").with_rows(1))),
                    Err(e @ EngineError::AttendanceWindowElapsed { .. }) => {
                        if let Err(sweep_err) = engine.sweep_booking(booking_id, now).await {
                            tracing::warn!("expiration check for {booking_id} failed: {sweep_err}");
                        }
                        Err(engine_err(e))
                    }
                    Err(e) => Err(engine_err(e)),
                }
            }
            Command::StartBreak { booking_id, window } => {
                engine
                    .start_break(booking_id, member, window, now)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::EndBreak { booking_id } => {
                engine
                    .end_break(booking_id, member, now)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::CancelBooking { booking_id, reason } => {
                engine
                    .cancel(booking_id, member, reason, now)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectBookings { seat_id, date } => {
                let bookings = match seat_id {
                    Some(seat_id) => engine
                        .bookings_for_seat(&seat_id, date, now)
                        .await
                        .map_err(engine_err)?,
                    None => {
                        engine.sweep_member(member, now).await;
                        engine
                            .list_member_bookings(member)
                            .await
                            .into_iter()
                            .filter(|b| date.is_none_or(|d| b.date == d))
                            .collect()
                    }
                };
                booking_rows(bookings)
            }
            Command::SelectSeats { filter, slot } => {
                let seats = engine.seat_availability(&filter, slot, now).await;
                seat_rows(seats)
            }
        }
    }
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("seat_id", Type::VARCHAR),
        field("member_id", Type::VARCHAR),
        field("device_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("attendance_confirmed", Type::BOOL),
        field("attendance_confirmed_at", Type::VARCHAR),
        field("current_break", Type::VARCHAR),
        field("breaks", Type::VARCHAR),
        field("cancellation_reason", Type::VARCHAR),
        field("created_at", Type::VARCHAR),
        field("completed_at", Type::VARCHAR),
        field("cancelled_at", Type::VARCHAR),
    ]
}

fn seat_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("building", Type::VARCHAR),
        field("floor", Type::VARCHAR),
        field("section", Type::VARCHAR),
        field("number", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("annotation", Type::VARCHAR),
    ]
}

fn timestamp(t: Option<NaiveDateTime>) -> Option<String> {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

fn json<T: serde::Serialize>(value: &T) -> PgWireResult<String> {
    serde_json::to_string(value).map_err(|e| user_error("XX000", format!("encode error: {e}")))
}

fn booking_rows(bookings: Vec<Booking>) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .iter()
        .map(|b| {
            let row = BookingRow::from(b);
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&row.id.to_string())?;
            encoder.encode_field(&row.seat_id.to_string())?;
            encoder.encode_field(&row.member_id)?;
            encoder.encode_field(&row.device_id)?;
            encoder.encode_field(&row.date.to_string())?;
            encoder.encode_field(&row.start_time)?;
            encoder.encode_field(&row.end_time)?;
            encoder.encode_field(&row.status.as_str().to_string())?;
            encoder.encode_field(&row.attendance_confirmed)?;
            encoder.encode_field(&timestamp(row.attendance_confirmed_at))?;
            let current_break = row.current_break.as_ref().map(json).transpose()?;
            encoder.encode_field(&current_break)?;
            encoder.encode_field(&json(&row.breaks)?)?;
            encoder.encode_field(&row.cancellation_reason)?;
            encoder.encode_field(&timestamp(Some(row.created_at)))?;
            encoder.encode_field(&timestamp(row.completed_at))?;
            encoder.encode_field(&timestamp(row.cancelled_at))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn seat_rows(seats: Vec<SeatAvailability>) -> PgWireResult<Response> {
    let schema = Arc::new(seat_schema());
    let rows: Vec<PgWireResult<_>> = seats
        .iter()
        .map(|s| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&s.seat.id.to_string())?;
            encoder.encode_field(&s.seat.building)?;
            encoder.encode_field(&s.seat.floor)?;
            encoder.encode_field(&s.seat.section)?;
            encoder.encode_field(&s.seat.number)?;
            encoder.encode_field(&s.status.as_str().to_string())?;
            encoder.encode_field(&s.annotation.map(|a| a.as_str().to_string()))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Result columns for a statement, judged from its text. Parameter
/// placeholders keep it from going through the full parser.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if !upper.starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("BOOKINGS") {
        booking_schema()
    } else if upper.contains("SEATS") {
        seat_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SeatdHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let session = self.session(client)?;
        Ok(vec![self.run(&session, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SeatdQueryParser;

#[async_trait]
impl QueryParser for SeatdQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SeatdHandler {
    type Statement = String;
    type QueryParser = SeatdQueryParser;

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
        let session = self.session(client)?;
        let sql = substitute_params(portal);
        self.run(&session, &sql).await
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
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
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass, so text inside a bound value is never read as a
/// placeholder. Unknown indexes are left as written.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let param = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match param {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
                rest = &after[digits..];
            }
            Some(None) => {
                out.push_str("NULL");
                rest = &after[digits..];
            }
            None => {
                out.push('$');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SeatdFactory {
    handler: Arc<SeatdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SeatdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SeatdFactory {
    pub fn new(sites: Arc<SiteManager>, password: String) -> Self {
        let auth_source = SeatdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SeatdHandler::new(sites)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SeatdFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    sites: Arc<SiteManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SeatdFactory::new(sites, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn sqlstate(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Validation => "22023",
        ErrorCategory::Conflict(_) => "23P01",
        ErrorCategory::NotFound => "02000",
        ErrorCategory::Forbidden => "42501",
        ErrorCategory::Storage => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(e.category()), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::Invalid(_) => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
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

use crate::auth::InnkeeperAuthSource;
use crate::engine::{Engine, EngineError, PricingError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct InnkeeperHandler {
    engine: Arc<Engine>,
    query_parser: Arc<InnkeeperQueryParser>,
}

impl InnkeeperHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(InnkeeperQueryParser),
        }
    }

    /// Parse and run one statement, recording query metrics.
    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = match &result {
            Ok(_) => "ok",
            Err(e) if e.is_client_error() => "rejected",
            Err(_) => "error",
        };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result.map_err(engine_err)
    }

    async fn execute_command(&self, cmd: Command) -> Result<Response, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::UpsertRoom {
                id,
                hotel_id,
                nightly_price,
                total_units,
            } => {
                engine
                    .upsert_room(id, hotel_id, nightly_price, total_units)
                    .await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteRoom { id } => {
                engine.delete_room(id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertBooking {
                room_id,
                user_id,
                date_from,
                date_to,
            } => {
                let reservation = engine
                    .create_booking(room_id, user_id, date_from, date_to)
                    .await?;
                Ok(bookings_response(vec![reservation]))
            }
            Command::DeleteBooking { id, user_id } => {
                let cancelled = engine.cancel_booking(id, user_id).await?;
                Ok(Response::Execution(
                    Tag::new("DELETE").with_rows(usize::from(cancelled)),
                ))
            }
            Command::SelectRooms { hotel_id } => {
                let rooms = engine.list_rooms(hotel_id).await;
                let schema = Arc::new(rooms_schema());
                let rows: Vec<PgWireResult<_>> = rooms
                    .into_iter()
                    .map(|room| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&room.id)?;
                        encoder.encode_field(&room.hotel_id)?;
                        encoder.encode_field(&room.nightly_price)?;
                        encoder.encode_field(&i64::from(room.total_units))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectBookings { user_id, page } => {
                let bookings = match user_id {
                    Some(user_id) => engine.list_user_bookings(user_id, page).await?,
                    None => engine.list_all_bookings(page).await?,
                };
                Ok(bookings_response(bookings))
            }
            Command::SelectAvailability {
                room_id,
                date_from,
                date_to,
            } => {
                let snap = engine.room_availability(room_id, date_from, date_to).await?;
                let schema = Arc::new(availability_schema());
                let rows: Vec<PgWireResult<_>> = [snap]
                    .into_iter()
                    .map(|snap| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&snap.room_id)?;
                        encoder.encode_field(&i64::from(snap.total_units))?;
                        encoder.encode_field(&(snap.booked as i64))?;
                        encoder.encode_field(&i64::from(snap.free_units))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectAvailableRooms {
                hotel_id,
                date_from,
                date_to,
                page,
            } => {
                let rooms = engine
                    .list_available_rooms(hotel_id, date_from, date_to, page)
                    .await?;
                let schema = Arc::new(available_rooms_schema());
                let rows: Vec<PgWireResult<_>> = rooms
                    .into_iter()
                    .map(|available| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&available.room.id)?;
                        encoder.encode_field(&available.room.hotel_id)?;
                        encoder.encode_field(&available.room.nightly_price)?;
                        encoder.encode_field(&i64::from(available.room.total_units))?;
                        encoder.encode_field(&i64::from(available.free_units))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn bookings_response(bookings: Vec<Reservation>) -> Response {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id)?;
            encoder.encode_field(&r.room_id)?;
            encoder.encode_field(&r.user_id)?;
            encoder.encode_field(&r.date_from.to_string())?;
            encoder.encode_field(&r.date_to.to_string())?;
            encoder.encode_field(&r.total_price)?;
            encoder.encode_field(&r.created_at.to_rfc3339())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Result schemas ───────────────────────────────────────────────

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn rooms_schema() -> Vec<FieldInfo> {
    vec![
        int_field("id"),
        int_field("hotel_id"),
        int_field("nightly_price"),
        int_field("total_units"),
    ]
}

/// Dates travel as `YYYY-MM-DD` text, `created_at` as RFC 3339.
fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        int_field("id"),
        int_field("room_id"),
        int_field("user_id"),
        text_field("date_from"),
        text_field("date_to"),
        int_field("total_price"),
        text_field("created_at"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        int_field("room_id"),
        int_field("total_units"),
        int_field("booked"),
        int_field("free_units"),
    ]
}

fn available_rooms_schema() -> Vec<FieldInfo> {
    vec![
        int_field("id"),
        int_field("hotel_id"),
        int_field("nightly_price"),
        int_field("total_units"),
        int_field("free_units"),
    ]
}

/// Row shape of a statement, for Describe. Empty for commands without rows.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::result_table(sql).as_deref() {
        Some("rooms") => rooms_schema(),
        Some("bookings") => bookings_schema(),
        Some("availability") => availability_schema(),
        Some("available_rooms") => available_rooms_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for InnkeeperHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct InnkeeperQueryParser;

#[async_trait]
impl QueryParser for InnkeeperQueryParser {
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
impl ExtendedQueryHandler for InnkeeperHandler {
    type Statement = String;
    type QueryParser = InnkeeperQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&sql).await
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

/// Highest `$N` placeholder in the SQL string.
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
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Replace `$1, $2, ...` with bound values as quoted text literals, in one
/// left-to-right pass so a bound value is never scanned for placeholders.
/// Placeholders without a bound value are left as written.
fn substitute_params(sql: &str, params: &[Option<Bytes>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let bound = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match bound {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes);
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            Some(None) => result.push_str("NULL"),
            None => result.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    result.push_str(rest);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct InnkeeperFactory {
    handler: Arc<InnkeeperHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<InnkeeperAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl InnkeeperFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = InnkeeperAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(InnkeeperHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for InnkeeperFactory {
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
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = InnkeeperFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE reported for each engine outcome.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::RoomNotFound(_) => "P0002",
        EngineError::InvalidDateRange { .. } => "22008",
        EngineError::InvalidStay(PricingError::NonPositiveStay { .. }) => "22008",
        EngineError::InvalidStay(PricingError::Overflow) => "22003",
        EngineError::RoomUnavailable { .. } => "23P01",
        EngineError::PermissionDenied { .. } => "42501",
        EngineError::InvalidRoom(_) | EngineError::InvalidPage(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Storage(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if e.is_client_error() {
        tracing::debug!("request rejected: {e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    tracing::debug!("bad statement: {e}");
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::Sink;
use futures::stream;
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

use crate::auth::{self, SalonAuthSource};
use crate::engine::{Engine, EngineError, NewBooking};
use crate::model::*;
use crate::observability::{AUTH_FAILURES_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::salon::Salons;
use crate::sql::{self, Command, SqlError};

pub struct SalonHandler {
    salons: Arc<Salons>,
    query_parser: Arc<SalonQueryParser>,
}

impl SalonHandler {
    pub fn new(salons: Arc<Salons>) -> Self {
        Self {
            salons,
            query_parser: Arc::new(SalonQueryParser),
        }
    }

    /// The salon comes from the database name, the caller from the user name.
    fn resolve<C: ClientInfo>(&self, client: &C) -> PgWireResult<(Arc<Engine>, Principal)> {
        let metadata = client.metadata();
        let user = metadata.get("user").map(String::as_str).unwrap_or_default();
        let principal = auth::parse_principal(user).map_err(|e| {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!("login refused: {e}");
            user_error("28000", format!("invalid identity: {e}"))
        })?;

        let db = metadata.get("database").map(String::as_str).unwrap_or("default");
        let engine = self
            .salons
            .get_or_open(db)
            .map_err(|e| user_error("08006", format!("salon error: {e}")))?;
        Ok((engine, principal))
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let (engine, principal) = self.resolve(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);

        let started = Instant::now();
        let result = self.execute_command(&engine, &principal, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        principal: &Principal,
        cmd: Command,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertBooking {
                id,
                service_id,
                staff_id,
                date,
                start,
                amount,
            } => {
                let req = NewBooking {
                    id,
                    service_id,
                    staff_id,
                    date,
                    start,
                    amount,
                };
                engine.create_booking(principal, req).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertTransition { booking_id, status } => {
                engine
                    .update_status(principal, booking_id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(principal, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBookings { id } => {
                let bookings = match id {
                    Some(id) => vec![engine.get_booking(principal, id).map_err(engine_err)?],
                    None => engine.list_bookings(principal),
                };
                Ok(rows(booking_schema(), &bookings, encode_booking))
            }
            Command::SelectAvailability {
                staff_id,
                date,
                service_id,
            } => {
                let spans = engine
                    .availability(staff_id, date, service_id)
                    .await
                    .map_err(engine_err)?;
                let slots: Vec<(Ulid, NaiveDate, Span)> = spans.into_iter().map(|s| (staff_id, date, s)).collect();
                Ok(rows(availability_schema(), &slots, encode_slot))
            }
            Command::InsertService { service } => {
                engine.register_service(principal, service).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteService { id } => {
                engine.retire_service(principal, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectServices { id } => {
                let services: Vec<Service> = match id {
                    Some(id) => engine.list_services().into_iter().filter(|s| s.id == id).collect(),
                    None => engine.list_services(),
                };
                Ok(rows(service_schema(), &services, encode_service))
            }
            Command::InsertStaff { staff } => {
                engine.register_staff(principal, staff).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteStaff { id } => {
                engine.retire_staff(principal, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectStaff { id } => {
                let staff: Vec<StaffSchedule> = match id {
                    Some(id) => engine.list_staff().into_iter().filter(|s| s.id == id).collect(),
                    None => engine.list_staff(),
                };
                Ok(rows(staff_schema(), &staff, encode_staff))
            }
            Command::InsertPolicy { policy } => {
                engine.set_policy(principal, policy).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectPolicy => {
                let policy = engine.policy();
                Ok(rows(policy_schema(), std::slice::from_ref(policy.as_ref()), encode_policy))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn column(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        column("id", Type::VARCHAR),
        column("customer_id", Type::VARCHAR),
        column("service_id", Type::VARCHAR),
        column("staff_id", Type::VARCHAR),
        column("date", Type::VARCHAR),
        column("start_time", Type::VARCHAR),
        column("end_time", Type::VARCHAR),
        column("status", Type::VARCHAR),
        column("amount", Type::INT8),
        column("created_at", Type::INT8),
        column("updated_at", Type::INT8),
        column("deleted_at", Type::INT8),
    ]
}

fn encode_booking(encoder: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.customer_id.to_string())?;
    encoder.encode_field(&b.service_id.to_string())?;
    encoder.encode_field(&b.staff_id.to_string())?;
    encoder.encode_field(&b.interval.date.to_string())?;
    encoder.encode_field(&format_clock(b.interval.span.start))?;
    encoder.encode_field(&format_clock(b.interval.span.end))?;
    encoder.encode_field(&b.status.as_str().to_string())?;
    encoder.encode_field(&b.amount)?;
    encoder.encode_field(&b.created_at)?;
    encoder.encode_field(&b.updated_at)?;
    encoder.encode_field(&b.deleted_at)?;
    Ok(())
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        column("staff_id", Type::VARCHAR),
        column("date", Type::VARCHAR),
        column("start_time", Type::VARCHAR),
        column("end_time", Type::VARCHAR),
    ]
}

fn encode_slot(encoder: &mut DataRowEncoder, slot: &(Ulid, NaiveDate, Span)) -> PgWireResult<()> {
    let (staff_id, date, span) = slot;
    encoder.encode_field(&staff_id.to_string())?;
    encoder.encode_field(&date.to_string())?;
    encoder.encode_field(&format_clock(span.start))?;
    encoder.encode_field(&format_clock(span.end))?;
    Ok(())
}

fn service_schema() -> Vec<FieldInfo> {
    vec![
        column("id", Type::VARCHAR),
        column("name", Type::VARCHAR),
        column("duration", Type::INT4),
        column("price", Type::INT8),
        column("active", Type::BOOL),
    ]
}

fn encode_service(encoder: &mut DataRowEncoder, s: &Service) -> PgWireResult<()> {
    encoder.encode_field(&s.id.to_string())?;
    encoder.encode_field(&s.name)?;
    encoder.encode_field(&i32::from(s.duration))?;
    encoder.encode_field(&s.price)?;
    encoder.encode_field(&s.active)?;
    Ok(())
}

fn staff_schema() -> Vec<FieldInfo> {
    vec![
        column("id", Type::VARCHAR),
        column("user_id", Type::VARCHAR),
        column("name", Type::VARCHAR),
        column("start_time", Type::VARCHAR),
        column("end_time", Type::VARCHAR),
        column("off_days", Type::VARCHAR),
        column("service_ids", Type::VARCHAR),
        column("active", Type::BOOL),
    ]
}

fn encode_staff(encoder: &mut DataRowEncoder, s: &StaffSchedule) -> PgWireResult<()> {
    let services: Vec<String> = s.services.iter().map(Ulid::to_string).collect();
    encoder.encode_field(&s.id.to_string())?;
    encoder.encode_field(&s.user_id.to_string())?;
    encoder.encode_field(&s.name)?;
    encoder.encode_field(&format_clock(s.window.start))?;
    encoder.encode_field(&format_clock(s.window.end))?;
    encoder.encode_field(&s.off_days.to_string())?;
    encoder.encode_field(&services.join(","))?;
    encoder.encode_field(&s.active)?;
    Ok(())
}

fn policy_schema() -> Vec<FieldInfo> {
    vec![
        column("opening_time", Type::VARCHAR),
        column("closing_time", Type::VARCHAR),
        column("off_days", Type::VARCHAR),
        column("holidays", Type::VARCHAR),
    ]
}

fn encode_policy(encoder: &mut DataRowEncoder, p: &OperatingPolicy) -> PgWireResult<()> {
    let holidays: Vec<String> = p.holidays.iter().map(NaiveDate::to_string).collect();
    encoder.encode_field(&p.hours.map(|h| format_clock(h.start)))?;
    encoder.encode_field(&p.hours.map(|h| format_clock(h.end)))?;
    encoder.encode_field(&p.off_days.to_string())?;
    encoder.encode_field(&holidays.join(","))?;
    Ok(())
}

/// Result columns for a statement, known from its table before execution.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    match sql::select_table(sql).as_deref() {
        Some("bookings") => booking_schema(),
        Some("availability") => availability_schema(),
        Some("services") => service_schema(),
        Some("staff") => staff_schema(),
        Some("salon_config") => policy_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SalonHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SalonQueryParser;

#[async_trait]
impl QueryParser for SalonQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SalonHandler {
    type Statement = String;
    type QueryParser = SalonQueryParser;

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
        let sql = substitute_params(portal);
        self.run(client, &sql).await
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
        Ok(DescribeStatementResponse::new(param_types, schema_for(&target.statement)))
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
        Ok(DescribePortalResponse::new(schema_for(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder in the statement.
/// Each `$n` placeholder outside a quoted literal, as its byte range and `n`.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                // A doubled quote is an escaped one, so it just reopens the literal.
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'$' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[start..end].parse::<usize>() {
                    found.push((i..end, n));
                }
                i = end;
            }
            _ => i += 1,
        }
    }
    found
}

fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Inline bound values as quoted literals in one pass, so text inside a
/// value is never scanned again.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SalonFactory {
    handler: Arc<SalonHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SalonAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SalonFactory {
    pub fn new(salons: Arc<Salons>, password: String) -> Self {
        Self {
            handler: Arc::new(SalonHandler::new(salons)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SalonAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SalonFactory {
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
    salons: Arc<Salons>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, SalonFactory::new(salons, password)).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine error.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(..) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Rejected(_) => "23514",
        EngineError::SlotTaken(_) => "23P01",
        EngineError::Forbidden => "42501",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::Invalid(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::Rejection;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM bookings"), 0);
        assert_eq!(count_params("SELECT * FROM availability WHERE staff_id = $1 AND date = $2"), 2);
        assert_eq!(count_params("INSERT INTO bookings VALUES ($10, $2)"), 10);
        assert_eq!(count_params("SELECT '$' FROM staff"), 0);
        assert_eq!(count_params("SELECT * FROM staff WHERE name = 'Promo $3' AND id = $1"), 1);
    }

    #[test]
    fn bound_text_is_not_rescanned() {
        let params: [Option<&[u8]>; 4] = [
            Some(b"01JQ0000000000000000000000"),
            Some(b"Promo $1 off, it's $10"),
            Some(b"30"),
            None,
        ];
        assert_eq!(
            bind_params("INSERT INTO services VALUES ($1, $2, $3, $4)", &params),
            "INSERT INTO services VALUES ('01JQ0000000000000000000000', 'Promo $1 off, it''s $10', '30', NULL)"
        );
    }

    #[test]
    fn placeholders_inside_literals_stay() {
        let params: [Option<&[u8]>; 1] = [Some(b"x")];
        assert_eq!(
            bind_params("SELECT * FROM staff WHERE name = 'a $1 ''b'' $1' AND id = $1", &params),
            "SELECT * FROM staff WHERE name = 'a $1 ''b'' $1' AND id = 'x'"
        );
        assert_eq!(bind_params("VALUES ($1, $2)", &params), "VALUES ('x', $2)");
    }

    #[test]
    fn sqlstate_per_error() {
        let id = Ulid::new();
        assert_eq!(sqlstate(&EngineError::NotFound("booking", id)), "P0002");
        assert_eq!(sqlstate(&EngineError::SlotTaken(id)), "23P01");
        assert_eq!(sqlstate(&EngineError::Forbidden), "42501");
        assert_eq!(sqlstate(&EngineError::AlreadyExists(id)), "23505");
        assert_eq!(
            sqlstate(&EngineError::InvalidTransition {
                from: BookingStatus::Confirmed,
                to: BookingStatus::Cancelled,
            }),
            "55000"
        );
        assert_eq!(sqlstate(&EngineError::Rejected(Rejection::StaffOffDay)), "23514");
    }

    #[test]
    fn schema_follows_table() {
        assert_eq!(schema_for("SELECT * FROM bookings WHERE id = $1").len(), 12);
        assert_eq!(schema_for("SELECT * FROM availability WHERE staff_id = $1 AND date = $2").len(), 4);
        assert_eq!(schema_for("SELECT * FROM salon_config").len(), 4);
        assert!(schema_for("DELETE FROM bookings WHERE id = $1").is_empty());
    }
}

use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, SecondsFormat, Utc};
use chrono_tz::Tz;
use futures::{stream, Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::auth::AgendaAuthSource;
use crate::calendar::{self, CalendarError, DayStep};
use crate::config::Config;
use crate::engine::{AppointmentFilter, AppointmentPatch, DeletePolicy, Engine, EngineError, NewAppointment};
use crate::engine::{ClientDraft, ServiceDraft, TenantDraft};
use crate::limits::MAX_LISTEN_CHANNELS;
use crate::model::*;
use crate::notify;
use crate::observability;
use crate::session::{Role, SessionError};
use crate::sql::{self, AppointmentField, AppointmentQuery, Command, SqlError, TimeInput};

/// Backend "process id" reported in NotificationResponse messages.
static NEXT_PID: AtomicI32 = AtomicI32::new(1);

#[derive(Debug, thiserror::Error)]
enum CommandError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Sql(#[from] SqlError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Calendar(#[from] CalendarError),
    #[error("day {day} is outside the navigation window ({first} to {last})")]
    OutsideWindow {
        day: NaiveDate,
        first: NaiveDate,
        last: NaiveDate,
    },
    #[error("invalid channel: {0} (expected tenant_<id>)")]
    Channel(String),
    #[error(transparent)]
    Wire(#[from] PgWireError),
}

impl CommandError {
    fn sqlstate(&self) -> &'static str {
        match self {
            CommandError::Engine(e) => e.sqlstate(),
            CommandError::Sql(_) => "42601",
            CommandError::Session(e) => e.sqlstate(),
            CommandError::Calendar(_) | CommandError::OutsideWindow { .. } => "22008",
            CommandError::Channel(_) => "42602",
            CommandError::Wire(_) => "XX000",
        }
    }

    fn into_pg(self) -> PgWireError {
        match self {
            CommandError::Wire(e) => e,
            other => PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                other.sqlstate().into(),
                other.to_string(),
            ))),
        }
    }
}

type CommandResult<T> = Result<T, CommandError>;

/// One handler per connection: it owns the connection's LISTEN set.
pub struct AgendaHandler {
    engine: Arc<Engine>,
    config: Arc<Config>,
    query_parser: Arc<AgendaQueryParser>,
    pid: i32,
    listeners: Mutex<HashMap<String, broadcast::Receiver<ChangeNotice>>>,
}

impl AgendaHandler {
    pub fn new(engine: Arc<Engine>, config: Arc<Config>) -> Self {
        Self {
            engine,
            config,
            query_parser: Arc::new(AgendaQueryParser),
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    fn role<C: ClientInfo>(&self, client: &C) -> PgWireResult<Role> {
        let metadata = client.metadata();
        Role::resolve(
            metadata.get("user").map(String::as_str),
            metadata.get("database").map(String::as_str),
            &self.config.master_user,
        )
        .map_err(|e| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            CommandError::from(e).into_pg()
        })
    }

    /// Parse, execute and account for one statement, then hand over any
    /// notices that arrived for this connection's channels.
    async fn run<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let role = self.role(client)?;
        let cmd = sql::parse_sql(query).map_err(|e| CommandError::from(e).into_pg())?;
        let label = observability::command_label(&cmd);
        let started = std::time::Instant::now();

        let result = self.execute_command(role, cmd).await;

        let status = match &result {
            Ok(_) => "ok",
            Err(CommandError::Engine(e)) if !e.is_rejection() => {
                warn!(command = label, "store unavailable: {e}");
                "unavailable"
            }
            Err(e) => {
                debug!(command = label, "rejected: {e}");
                "rejected"
            }
        };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        self.deliver_notices(client).await?;
        result.map_err(CommandError::into_pg)
    }

    async fn deliver_notices<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        {
            let mut listeners = self.listeners.lock().await;
            listeners.retain(|channel, rx| loop {
                match rx.try_recv() {
                    Ok(notice) => pending.push((channel.clone(), notice)),
                    Err(broadcast::error::TryRecvError::Empty) => break true,
                    Err(broadcast::error::TryRecvError::Lagged(n)) => {
                        warn!("{channel}: listener lagged, dropped {n} notice(s)");
                    }
                    // Tenant removed.
                    Err(broadcast::error::TryRecvError::Closed) => break false,
                }
            });
        }

        for (channel, notice) in pending {
            let payload = match serde_json::to_string(&notice) {
                Ok(json) => json,
                Err(e) => {
                    warn!("{channel}: cannot encode notice: {e}");
                    continue;
                }
            };
            client
                .send(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    self.pid, channel, payload,
                )))
                .await?;
        }
        Ok(())
    }

    async fn execute_command(&self, role: Role, cmd: Command) -> CommandResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            // ── Tenants ──
            Command::InsertTenant { id, fields } => {
                role.require_master()?;
                let mut draft = TenantDraft {
                    name: String::new(),
                    contact: Contact::default(),
                    timezone: self.config.default_timezone,
                    default_duration_minutes: None,
                };
                fields.into_iter().for_each(|f| f.apply(&mut draft));
                engine.register_tenant(id, draft).await?;
                Ok(vec![insert_tag()])
            }
            Command::UpdateTenant { id, fields } => {
                if let Role::Tenant(own) = role
                    && own != id
                {
                    return Err(SessionError::Forbidden("another tenant's profile").into());
                }
                engine
                    .modify_tenant(id, |draft| fields.into_iter().for_each(|f| f.apply(draft)))
                    .await?;
                Ok(vec![update_tag()])
            }
            Command::DeleteTenant { id } => {
                role.require_master()?;
                engine.remove_tenant(id).await?;
                Ok(vec![delete_tag()])
            }

            // ── Clients ──
            Command::InsertClient { id, fields } => {
                let tenant_id = role.writable_tenant()?;
                let mut draft = ClientDraft::default();
                fields.into_iter().for_each(|f| f.apply(&mut draft));
                engine.create_client(tenant_id, id, draft).await?;
                Ok(vec![insert_tag()])
            }
            Command::UpdateClient { id, fields } => {
                let tenant_id = role.writable_tenant()?;
                engine
                    .modify_client(tenant_id, id, |draft| fields.into_iter().for_each(|f| f.apply(draft)))
                    .await?;
                Ok(vec![update_tag()])
            }
            Command::DeleteClient { id, cascade } => {
                let tenant_id = role.writable_tenant()?;
                engine.delete_client(tenant_id, id, delete_policy(cascade)).await?;
                Ok(vec![delete_tag()])
            }

            // ── Services ──
            Command::InsertService { id, fields } => {
                let tenant_id = role.writable_tenant()?;
                let mut draft = ServiceDraft::default();
                fields.into_iter().for_each(|f| f.apply(&mut draft));
                engine.create_service(tenant_id, id, draft).await?;
                Ok(vec![insert_tag()])
            }
            Command::UpdateService { id, fields } => {
                let tenant_id = role.writable_tenant()?;
                engine
                    .modify_service(tenant_id, id, |draft| fields.into_iter().for_each(|f| f.apply(draft)))
                    .await?;
                Ok(vec![update_tag()])
            }
            Command::DeleteService { id, cascade } => {
                let tenant_id = role.writable_tenant()?;
                engine.delete_service(tenant_id, id, delete_policy(cascade)).await?;
                Ok(vec![delete_tag()])
            }

            // ── Appointments ──
            Command::InsertAppointment {
                id,
                client_id,
                service_id,
                start,
                notes,
            } => {
                let tenant_id = role.writable_tenant()?;
                let start = self.resolve_time(tenant_id, start).await?;
                let request = NewAppointment {
                    id,
                    client_id,
                    service_id,
                    start,
                    notes,
                };
                engine.create_appointment(tenant_id, request).await?;
                Ok(vec![insert_tag()])
            }
            Command::UpdateAppointment { id, fields } => {
                let tenant_id = role.writable_tenant()?;
                let mut patch = AppointmentPatch::default();
                for field in fields {
                    match field {
                        AppointmentField::Start(t) => patch.start = Some(self.resolve_time(tenant_id, t).await?),
                        AppointmentField::ClientId(v) => patch.client_id = Some(v),
                        AppointmentField::ServiceId(v) => patch.service_id = Some(v),
                        AppointmentField::Notes(v) => patch.notes = Some(v),
                        AppointmentField::Status(v) => patch.status = Some(v),
                    }
                }
                engine.edit_appointment(tenant_id, id, patch).await?;
                Ok(vec![update_tag()])
            }
            Command::DeleteAppointment { id } => {
                let tenant_id = role.writable_tenant()?;
                engine.cancel(tenant_id, id).await?;
                Ok(vec![delete_tag()])
            }

            // ── Reads ──
            Command::SelectTenants { id } => {
                let tenants = match (role, id) {
                    (Role::Master, None) => engine.list_tenants().await?,
                    (Role::Master, Some(id)) => found(engine.get_tenant(id).await, id)?.into_iter().collect(),
                    (Role::Tenant(own), requested) => {
                        if requested.is_some_and(|id| id != own) {
                            return Err(SessionError::Forbidden("another tenant's profile").into());
                        }
                        vec![engine.get_tenant(own).await?]
                    }
                };
                Ok(vec![tenant_rows(&tenants)?])
            }
            Command::SelectClients { tenant_id, id } => {
                let mut clients = Vec::new();
                for tenant_id in self.readable_tenants(role, tenant_id).await? {
                    match id {
                        Some(id) => clients.extend(found(engine.get_client(tenant_id, id).await, id)?),
                        None => clients.extend(engine.list_clients(tenant_id).await?),
                    }
                }
                Ok(vec![client_rows(&clients)?])
            }
            Command::SelectServices { tenant_id, id } => {
                let mut services = Vec::new();
                for tenant_id in self.readable_tenants(role, tenant_id).await? {
                    match id {
                        Some(id) => services.extend(found(engine.get_service(tenant_id, id).await, id)?),
                        None => services.extend(engine.list_services(tenant_id).await?),
                    }
                }
                Ok(vec![service_rows(&services)?])
            }
            Command::SelectAppointments { tenant_id, query } => {
                let mut appointments = Vec::new();
                for tenant_id in self.readable_tenants(role, tenant_id).await? {
                    appointments.extend(self.query_appointments(tenant_id, &query).await?);
                }
                appointments.sort_by_key(|a| a.span.start);
                Ok(vec![appointment_rows(&appointments)?])
            }
            Command::SelectConflicts {
                tenant_id,
                service_id,
                start,
                exclude_id,
            } => {
                let tenant_id = role
                    .readable_tenant(tenant_id)?
                    .ok_or(SqlError::MissingFilter("tenant_id"))?;
                let start = self.resolve_time(tenant_id, start).await?;
                let conflicts = engine
                    .preview_conflicts(tenant_id, service_id, start, exclude_id)
                    .await?;
                Ok(vec![appointment_rows(&conflicts)?])
            }
            Command::SelectDayWindow { tenant_id, day } => {
                let tz = match role.readable_tenant(tenant_id)? {
                    Some(tenant_id) => engine.get_tenant(tenant_id).await?.timezone,
                    None => self.config.default_timezone,
                };
                let today = calendar::today_in(tz, Utc::now());
                let day = day.unwrap_or(today);
                Ok(vec![day_window_row(self.config.day_window, today, day)?])
            }

            // ── Realtime ──
            Command::Listen { channel } => {
                let tenant_id = notify::parse_channel(&channel).ok_or_else(|| CommandError::Channel(channel.clone()))?;
                role.readable_tenant(Some(tenant_id))?;
                if engine.tenant_state(&tenant_id).is_none() {
                    return Err(EngineError::NotFound(tenant_id).into());
                }
                let mut listeners = self.listeners.lock().await;
                if !listeners.contains_key(&channel) {
                    if listeners.len() >= MAX_LISTEN_CHANNELS {
                        return Err(EngineError::LimitExceeded("too many LISTEN channels").into());
                    }
                    listeners.insert(channel, engine.notify.subscribe(tenant_id));
                }
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                self.listeners.lock().await.remove(&channel);
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                self.listeners.lock().await.clear();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }

    /// Tenants a read covers: one, or every tenant for an unfiltered master read.
    async fn readable_tenants(&self, role: Role, requested: Option<TenantId>) -> CommandResult<Vec<TenantId>> {
        Ok(match role.readable_tenant(requested)? {
            Some(tenant_id) => vec![tenant_id],
            None => self.engine.list_tenants().await?.into_iter().map(|t| t.id).collect(),
        })
    }

    async fn tenant_timezone(&self, tenant_id: TenantId) -> CommandResult<Tz> {
        Ok(self.engine.get_tenant(tenant_id).await?.timezone)
    }

    async fn resolve_time(&self, tenant_id: TenantId, input: TimeInput) -> CommandResult<Instant> {
        match input {
            TimeInput::At(t) => Ok(t),
            TimeInput::Local(_) => Ok(input.resolve(self.tenant_timezone(tenant_id).await?)?),
        }
    }

    async fn query_appointments(&self, tenant_id: TenantId, query: &AppointmentQuery) -> CommandResult<Vec<Appointment>> {
        let tz = match query.tz {
            Some(tz) => tz,
            None => self.tenant_timezone(tenant_id).await?,
        };
        let filter = AppointmentFilter {
            status: query.status,
            client_id: query.client_id,
            service_id: query.service_id,
            from: query.from.map(|t| t.resolve(tz)).transpose()?,
            to: query.to.map(|t| t.resolve(tz)).transpose()?,
        };

        let base = if let Some(id) = query.id {
            found(self.engine.get_appointment(tenant_id, id).await, id)?
                .into_iter()
                .collect()
        } else if let Some(day) = query.day {
            if let Some(window) = self.config.day_window {
                let today = calendar::today_in(tz, Utc::now());
                if !window.contains(today, day) {
                    let (first, last) = window.bounds(today);
                    return Err(CommandError::OutsideWindow { day, first, last });
                }
            }
            self.engine.list_day(tenant_id, day, Some(tz)).await?
        } else {
            return Ok(self.engine.list_appointments(tenant_id, &filter).await?);
        };
        Ok(base.into_iter().filter(|a| filter.matches(a)).collect())
    }
}

fn delete_policy(cascade: bool) -> DeletePolicy {
    if cascade {
        DeletePolicy::Cascade
    } else {
        DeletePolicy::Block
    }
}

/// Lookups by id read as SQL: no match is zero rows, not an error. A missing
/// tenant is still an error.
fn found<T>(result: Result<T, EngineError>, id: ulid::Ulid) -> Result<Option<T>, EngineError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(EngineError::NotFound(missing)) if missing == id => Ok(None),
        Err(e) => Err(e),
    }
}

fn insert_tag() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn update_tag() -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(1))
}

fn delete_tag() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

// ── Result sets ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn tenant_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("phone", Type::VARCHAR),
        field("email", Type::VARCHAR),
        field("timezone", Type::VARCHAR),
        field("default_duration_minutes", Type::INT4),
    ]
}

fn client_schema() -> Vec<FieldInfo> {
    [
        "id",
        "tenant_id",
        "name",
        "phone",
        "email",
        "street",
        "number",
        "district",
        "city",
        "state",
        "postal_code",
    ]
    .into_iter()
    .map(|name| field(name, Type::VARCHAR))
    .collect()
}

fn service_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("tenant_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("price", Type::VARCHAR),
        field("duration_minutes", Type::INT4),
        field("description", Type::VARCHAR),
    ]
}

fn appointment_schema() -> Vec<FieldInfo> {
    ["id", "tenant_id", "client_id", "service_id", "start", "end", "status", "notes"]
        .into_iter()
        .map(|name| field(name, Type::VARCHAR))
        .collect()
}

fn day_window_schema() -> Vec<FieldInfo> {
    let mut schema: Vec<FieldInfo> = ["today", "day", "previous", "next", "first", "last"]
        .into_iter()
        .map(|name| field(name, Type::VARCHAR))
        .collect();
    schema.push(field("in_window", Type::BOOL));
    schema
}

fn query_response<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn timestamp(t: Instant) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn minutes(m: Option<u32>) -> Option<i32> {
    m.and_then(|m| i32::try_from(m).ok())
}

fn tenant_rows(tenants: &[Tenant]) -> PgWireResult<Response> {
    query_response(tenant_schema(), tenants, |e, t| {
        e.encode_field(&t.id.to_string())?;
        e.encode_field(&t.name)?;
        e.encode_field(&t.contact.phone)?;
        e.encode_field(&t.contact.email)?;
        e.encode_field(&t.timezone.name())?;
        e.encode_field(&minutes(t.default_duration_minutes))
    })
}

fn client_rows(clients: &[Client]) -> PgWireResult<Response> {
    query_response(client_schema(), clients, |e, c| {
        e.encode_field(&c.id.to_string())?;
        e.encode_field(&c.tenant_id.to_string())?;
        e.encode_field(&c.name)?;
        e.encode_field(&c.contact.phone)?;
        e.encode_field(&c.contact.email)?;
        e.encode_field(&c.address.street)?;
        e.encode_field(&c.address.number)?;
        e.encode_field(&c.address.district)?;
        e.encode_field(&c.address.city)?;
        e.encode_field(&c.address.state)?;
        e.encode_field(&c.address.postal_code)
    })
}

fn service_rows(services: &[Service]) -> PgWireResult<Response> {
    query_response(service_schema(), services, |e, s| {
        e.encode_field(&s.id.to_string())?;
        e.encode_field(&s.tenant_id.to_string())?;
        e.encode_field(&s.name)?;
        e.encode_field(&format!("{:.2}", s.price))?;
        e.encode_field(&minutes(s.duration_minutes))?;
        e.encode_field(&s.description)
    })
}

fn appointment_rows(appointments: &[Appointment]) -> PgWireResult<Response> {
    query_response(appointment_schema(), appointments, |e, a| {
        e.encode_field(&a.id.to_string())?;
        e.encode_field(&a.tenant_id.to_string())?;
        e.encode_field(&a.client_id.to_string())?;
        e.encode_field(&a.service_id.to_string())?;
        e.encode_field(&timestamp(a.span.start))?;
        e.encode_field(&timestamp(a.span.end))?;
        e.encode_field(&a.status.as_str())?;
        e.encode_field(&a.notes)
    })
}

/// Navigation state for a dashboard showing `day`. With the window off,
/// every day is reachable and `first`/`last` are NULL.
fn day_window_row(window: Option<calendar::DayWindow>, today: NaiveDate, day: NaiveDate) -> PgWireResult<Response> {
    let (previous, next, bounds, in_window) = match window {
        Some(w) => (
            w.step(today, day, DayStep::Previous),
            w.step(today, day, DayStep::Next),
            Some(w.bounds(today)),
            w.contains(today, day),
        ),
        None => (day.pred_opt(), day.succ_opt(), None, true),
    };
    let date = |d: Option<NaiveDate>| d.map(|d| d.to_string());
    let row = [(today, day, previous, next, bounds, in_window)];
    query_response(day_window_schema(), &row, |e, (today, day, previous, next, bounds, in_window)| {
        e.encode_field(&today.to_string())?;
        e.encode_field(&day.to_string())?;
        e.encode_field(&date(*previous))?;
        e.encode_field(&date(*next))?;
        e.encode_field(&date(bounds.map(|b| b.0)))?;
        e.encode_field(&date(bounds.map(|b| b.1)))?;
        e.encode_field(in_window)
    })
}

/// Result schema of a statement, from the table it selects from.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mut words = lower.split(|c: char| c.is_whitespace() || c == ';');
    if words.next() != Some("select") {
        return vec![];
    }
    let table = words.skip_while(|w| *w != "from").nth(1).unwrap_or("");
    match table.trim_matches('"') {
        "tenants" => tenant_schema(),
        "clients" => client_schema(),
        "services" => service_schema(),
        "appointments" | "conflicts" => appointment_schema(),
        "day_window" => day_window_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for AgendaHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AgendaQueryParser;

#[async_trait]
impl QueryParser for AgendaQueryParser {
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
impl ExtendedQueryHandler for AgendaHandler {
    type Statement = String;
    type QueryParser = AgendaQueryParser;

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
        let responses = self.run(client, &sql).await?;
        Ok(responses.into_iter().next().unwrap_or(Response::EmptyQuery))
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
    let mut result = portal.statement.statement.to_string();
    // Highest index first so $1 does not clobber $10.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
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

pub struct AgendaFactory {
    handler: Arc<AgendaHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<AgendaAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl AgendaFactory {
    pub fn new(engine: Arc<Engine>, config: Arc<Config>) -> Self {
        let auth_source = AgendaAuthSource::new(
            config.password.clone(),
            config.master_user.clone(),
            config.master_password.clone(),
        );
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(AgendaHandler::new(engine, config)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AgendaFactory {
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
    config: Arc<Config>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(AgendaFactory::new(engine, config));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

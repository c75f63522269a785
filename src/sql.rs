use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::calendar::{self, CalendarError};
use crate::engine::{ClientDraft, ServiceDraft, TenantDraft};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertTenant {
        id: TenantId,
        fields: Vec<TenantField>,
    },
    UpdateTenant {
        id: TenantId,
        fields: Vec<TenantField>,
    },
    DeleteTenant {
        id: TenantId,
    },
    InsertClient {
        id: ClientId,
        fields: Vec<ClientField>,
    },
    UpdateClient {
        id: ClientId,
        fields: Vec<ClientField>,
    },
    DeleteClient {
        id: ClientId,
        cascade: bool,
    },
    InsertService {
        id: ServiceId,
        fields: Vec<ServiceField>,
    },
    UpdateService {
        id: ServiceId,
        fields: Vec<ServiceField>,
    },
    DeleteService {
        id: ServiceId,
        cascade: bool,
    },
    InsertAppointment {
        id: AppointmentId,
        client_id: ClientId,
        service_id: ServiceId,
        start: TimeInput,
        notes: Option<String>,
    },
    UpdateAppointment {
        id: AppointmentId,
        fields: Vec<AppointmentField>,
    },
    /// Appointments are never removed; DELETE cancels.
    DeleteAppointment {
        id: AppointmentId,
    },
    SelectTenants {
        id: Option<TenantId>,
    },
    SelectClients {
        tenant_id: Option<TenantId>,
        id: Option<ClientId>,
    },
    SelectServices {
        tenant_id: Option<TenantId>,
        id: Option<ServiceId>,
    },
    SelectAppointments {
        tenant_id: Option<TenantId>,
        query: AppointmentQuery,
    },
    SelectConflicts {
        tenant_id: Option<TenantId>,
        service_id: ServiceId,
        start: TimeInput,
        exclude_id: Option<AppointmentId>,
    },
    SelectDayWindow {
        tenant_id: Option<TenantId>,
        day: Option<NaiveDate>,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

/// A point in time as typed by the user: absolute, or a wall-clock time to be
/// read in the tenant's timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeInput {
    At(Instant),
    Local(NaiveDateTime),
}

const LOCAL_FORMATS: [&str; 4] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"];

impl TimeInput {
    /// RFC 3339, `YYYY-MM-DD HH:MM:SS+HH` (what PostgreSQL prints), Unix
    /// milliseconds, or a naive local `YYYY-MM-DD[T ]HH:MM[:SS]`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if let Ok(ms) = raw.parse::<i64>() {
            return DateTime::<Utc>::from_timestamp_millis(ms)
                .map(TimeInput::At)
                .ok_or_else(|| format!("{ms} ms is out of range"));
        }
        if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
            return Ok(TimeInput::At(t.with_timezone(&Utc)));
        }
        if let Ok(t) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%#z") {
            return Ok(TimeInput::At(t.with_timezone(&Utc)));
        }
        LOCAL_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .map(TimeInput::Local)
            .ok_or_else(|| format!("unrecognized timestamp {raw:?}"))
    }

    /// Ambiguous wall-clock times take the earlier instant.
    pub fn resolve(self, tz: Tz) -> Result<Instant, CalendarError> {
        match self {
            TimeInput::At(t) => Ok(t),
            TimeInput::Local(local) => calendar::resolve_local(local, tz),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TenantField {
    Name(String),
    Phone(Option<String>),
    Email(Option<String>),
    Timezone(Tz),
    DefaultDuration(Option<u32>),
}

impl TenantField {
    pub fn apply(self, draft: &mut TenantDraft) {
        match self {
            TenantField::Name(v) => draft.name = v,
            TenantField::Phone(v) => draft.contact.phone = v,
            TenantField::Email(v) => draft.contact.email = v,
            TenantField::Timezone(tz) => draft.timezone = tz,
            TenantField::DefaultDuration(v) => draft.default_duration_minutes = v,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientField {
    Name(String),
    Phone(Option<String>),
    Email(Option<String>),
    Street(Option<String>),
    Number(Option<String>),
    District(Option<String>),
    City(Option<String>),
    State(Option<String>),
    PostalCode(Option<String>),
}

impl ClientField {
    pub fn apply(self, draft: &mut ClientDraft) {
        let address = &mut draft.address;
        match self {
            ClientField::Name(v) => draft.name = v,
            ClientField::Phone(v) => draft.contact.phone = v,
            ClientField::Email(v) => draft.contact.email = v,
            ClientField::Street(v) => address.street = v,
            ClientField::Number(v) => address.number = v,
            ClientField::District(v) => address.district = v,
            ClientField::City(v) => address.city = v,
            ClientField::State(v) => address.state = v,
            ClientField::PostalCode(v) => address.postal_code = v,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceField {
    Name(String),
    Price(Decimal),
    Duration(Option<u32>),
    Description(Option<String>),
}

impl ServiceField {
    pub fn apply(self, draft: &mut ServiceDraft) {
        match self {
            ServiceField::Name(v) => draft.name = v,
            ServiceField::Price(v) => draft.price = v,
            ServiceField::Duration(v) => draft.duration_minutes = v,
            ServiceField::Description(v) => draft.description = v,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppointmentField {
    Start(TimeInput),
    ClientId(ClientId),
    ServiceId(ServiceId),
    Notes(Option<String>),
    Status(AppointmentStatus),
}

/// WHERE clause of `SELECT * FROM appointments`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppointmentQuery {
    pub id: Option<AppointmentId>,
    /// Local calendar day, read in `tz` or the tenant's timezone.
    pub day: Option<NaiveDate>,
    pub tz: Option<Tz>,
    pub status: Option<AppointmentStatus>,
    pub client_id: Option<ClientId>,
    pub service_id: Option<ServiceId>,
    /// `start >= ...`
    pub from: Option<TimeInput>,
    /// `start < ...`
    pub to: Option<TimeInput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Tenants,
    Clients,
    Services,
    Appointments,
}

impl Table {
    fn parse(name: &str) -> Result<Self, SqlError> {
        match name {
            "tenants" => Ok(Table::Tenants),
            "clients" => Ok(Table::Clients),
            "services" => Ok(Table::Services),
            "appointments" => Ok(Table::Appointments),
            _ => Err(SqlError::UnknownTable(name.to_string())),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Table::Tenants => "tenants",
            Table::Clients => "clients",
            Table::Services => "services",
            Table::Appointments => "appointments",
        }
    }

    /// Column order for positional INSERTs.
    fn insert_columns(self) -> &'static [&'static str] {
        match self {
            Table::Tenants => &["id", "name", "phone", "email", "timezone", "default_duration_minutes"],
            Table::Clients => &[
                "id",
                "name",
                "phone",
                "email",
                "street",
                "number",
                "district",
                "city",
                "state",
                "postal_code",
            ],
            Table::Services => &["id", "name", "price", "duration_minutes", "description"],
            Table::Appointments => &["id", "client_id", "service_id", "start", "notes"],
        }
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(cmd) = parse_listen(trimmed) {
        return cmd;
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// LISTEN and UNLISTEN are matched textually; the channel is validated by
/// the connection.
fn parse_listen(sql: &str) -> Option<Result<Command, SqlError>> {
    let (keyword, rest) = sql.split_once(char::is_whitespace).unwrap_or((sql, ""));
    let channel = rest.trim().trim_matches('"').to_string();
    if keyword.eq_ignore_ascii_case("LISTEN") {
        if channel.is_empty() {
            return Some(Err(SqlError::Parse("LISTEN without channel".into())));
        }
        return Some(Ok(Command::Listen { channel }));
    }
    if keyword.eq_ignore_ascii_case("UNLISTEN") {
        return Some(match channel.as_str() {
            "" => Err(SqlError::Parse("UNLISTEN without channel".into())),
            "*" => Ok(Command::UnlistenAll),
            _ => Ok(Command::Unlisten { channel }),
        });
    }
    None
}

// ── INSERT / UPDATE ───────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = Table::parse(&insert_table_name(insert)?)?;
    let values = extract_insert_values(insert)?;

    let columns: Vec<String> = if insert.columns.is_empty() {
        let positional = table.insert_columns();
        if values.len() > positional.len() {
            return Err(SqlError::WrongArity(table.name(), positional.len(), values.len()));
        }
        positional.iter().map(|c| c.to_string()).collect()
    } else {
        if insert.columns.len() != values.len() {
            return Err(SqlError::WrongArity(table.name(), insert.columns.len(), values.len()));
        }
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };

    let mut row = Vec::with_capacity(values.len());
    for (column, expr) in columns.into_iter().zip(values.iter()) {
        row.push((column, literal(expr)?));
    }

    let id_pos = row
        .iter()
        .position(|(c, _)| c == "id")
        .ok_or(SqlError::MissingColumn("id"))?;
    let (_, id_lit) = row.remove(id_pos);
    let id = ulid_value("id", &id_lit)?;

    match table {
        Table::Tenants => Ok(Command::InsertTenant {
            id,
            fields: tenant_fields(row)?,
        }),
        Table::Clients => Ok(Command::InsertClient {
            id,
            fields: client_fields(row)?,
        }),
        Table::Services => Ok(Command::InsertService {
            id,
            fields: service_fields(row)?,
        }),
        Table::Appointments => {
            let (mut client_id, mut service_id, mut start, mut notes) = (None, None, None, None);
            for field in appointment_fields(row)? {
                match field {
                    AppointmentField::ClientId(v) => client_id = Some(v),
                    AppointmentField::ServiceId(v) => service_id = Some(v),
                    AppointmentField::Start(v) => start = Some(v),
                    AppointmentField::Notes(v) => notes = v,
                    AppointmentField::Status(_) => {
                        return Err(SqlError::Unsupported("new appointments always start open".into()));
                    }
                }
            }
            Ok(Command::InsertAppointment {
                id,
                client_id: client_id.ok_or(SqlError::MissingColumn("client_id"))?,
                service_id: service_id.ok_or(SqlError::MissingColumn("service_id"))?,
                start: start.ok_or(SqlError::MissingColumn("start"))?,
                notes,
            })
        }
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = Table::parse(&table_factor_name(relation)?)?;
    let id = extract_where_id(selection)?;

    let mut row = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        if column == "id" || column == "tenant_id" {
            return Err(SqlError::Unsupported(format!("{column} cannot be changed")));
        }
        row.push((column, literal(&assignment.value)?));
    }
    if row.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }

    match table {
        Table::Tenants => Ok(Command::UpdateTenant {
            id,
            fields: tenant_fields(row)?,
        }),
        Table::Clients => Ok(Command::UpdateClient {
            id,
            fields: client_fields(row)?,
        }),
        Table::Services => Ok(Command::UpdateService {
            id,
            fields: service_fields(row)?,
        }),
        Table::Appointments => Ok(Command::UpdateAppointment {
            id,
            fields: appointment_fields(row)?,
        }),
    }
}

type Row = Vec<(String, Literal)>;

fn tenant_fields(row: Row) -> Result<Vec<TenantField>, SqlError> {
    row.into_iter()
        .map(|(column, lit)| {
            Ok(match column.as_str() {
                "name" => TenantField::Name(text_value(&column, &lit)?),
                "phone" => TenantField::Phone(opt_text(&lit)),
                "email" => TenantField::Email(opt_text(&lit)),
                "timezone" => TenantField::Timezone(tz_value(&column, &lit)?),
                "default_duration_minutes" => TenantField::DefaultDuration(opt_u32(&column, &lit)?),
                _ => return Err(unknown_column(Table::Tenants, column)),
            })
        })
        .collect()
}

fn client_fields(row: Row) -> Result<Vec<ClientField>, SqlError> {
    row.into_iter()
        .map(|(column, lit)| {
            Ok(match column.as_str() {
                "name" => ClientField::Name(text_value(&column, &lit)?),
                "phone" => ClientField::Phone(opt_text(&lit)),
                "email" => ClientField::Email(opt_text(&lit)),
                "street" => ClientField::Street(opt_text(&lit)),
                "number" => ClientField::Number(opt_text(&lit)),
                "district" => ClientField::District(opt_text(&lit)),
                "city" => ClientField::City(opt_text(&lit)),
                "state" => ClientField::State(opt_text(&lit)),
                "postal_code" => ClientField::PostalCode(opt_text(&lit)),
                _ => return Err(unknown_column(Table::Clients, column)),
            })
        })
        .collect()
}

fn service_fields(row: Row) -> Result<Vec<ServiceField>, SqlError> {
    row.into_iter()
        .map(|(column, lit)| {
            Ok(match column.as_str() {
                "name" => ServiceField::Name(text_value(&column, &lit)?),
                "price" => ServiceField::Price(price_value(&column, &lit)?),
                "duration_minutes" => ServiceField::Duration(opt_u32(&column, &lit)?),
                "description" => ServiceField::Description(opt_text(&lit)),
                _ => return Err(unknown_column(Table::Services, column)),
            })
        })
        .collect()
}

fn appointment_fields(row: Row) -> Result<Vec<AppointmentField>, SqlError> {
    row.into_iter()
        .map(|(column, lit)| {
            Ok(match column.as_str() {
                "start" => AppointmentField::Start(time_value(&column, &lit)?),
                "client_id" => AppointmentField::ClientId(ulid_value(&column, &lit)?),
                "service_id" => AppointmentField::ServiceId(ulid_value(&column, &lit)?),
                "notes" => AppointmentField::Notes(opt_text(&lit)),
                "status" => AppointmentField::Status(status_value(&column, &lit)?),
                _ => return Err(unknown_column(Table::Appointments, column)),
            })
        })
        .collect()
}

fn unknown_column(table: Table, column: String) -> SqlError {
    SqlError::UnknownColumn {
        table: table.name(),
        column,
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = Table::parse(&delete_table_name(delete)?)?;
    let filters = Filters::from_selection(&delete.selection)?;
    filters.only(&["id", "cascade"])?;
    let id = ulid_value("id", filters.eq("id").ok_or(SqlError::MissingFilter("id"))?)?;
    let cascade = match filters.eq("cascade") {
        Some(lit) => bool_value("cascade", lit)?,
        None => false,
    };
    if cascade && !matches!(table, Table::Clients | Table::Services) {
        return Err(SqlError::Unsupported(format!("cascade on {}", table.name())));
    }

    match table {
        Table::Tenants => Ok(Command::DeleteTenant { id }),
        Table::Clients => Ok(Command::DeleteClient { id, cascade }),
        Table::Services => Ok(Command::DeleteService { id, cascade }),
        Table::Appointments => Ok(Command::DeleteAppointment { id }),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = Filters::from_selection(&select.selection)?;
    let tenant_id = filters.opt_ulid("tenant_id")?;

    match table.as_str() {
        "tenants" => {
            filters.only(&["id"])?;
            Ok(Command::SelectTenants {
                id: filters.opt_ulid("id")?,
            })
        }
        "clients" => {
            filters.only(&["id", "tenant_id"])?;
            Ok(Command::SelectClients {
                tenant_id,
                id: filters.opt_ulid("id")?,
            })
        }
        "services" => {
            filters.only(&["id", "tenant_id"])?;
            Ok(Command::SelectServices {
                tenant_id,
                id: filters.opt_ulid("id")?,
            })
        }
        "appointments" => {
            filters.only(&["id", "tenant_id", "day", "tz", "status", "client_id", "service_id", "start"])?;
            Ok(Command::SelectAppointments {
                tenant_id,
                query: appointment_query(&filters)?,
            })
        }
        "conflicts" => {
            filters.only(&["tenant_id", "service_id", "start", "exclude_id"])?;
            let service_id = filters.eq("service_id").ok_or(SqlError::MissingFilter("service_id"))?;
            let start = filters.eq("start").ok_or(SqlError::MissingFilter("start"))?;
            Ok(Command::SelectConflicts {
                tenant_id,
                service_id: ulid_value("service_id", service_id)?,
                start: time_value("start", start)?,
                exclude_id: filters.opt_ulid("exclude_id")?,
            })
        }
        "day_window" => {
            filters.only(&["tenant_id", "day"])?;
            Ok(Command::SelectDayWindow {
                tenant_id,
                day: filters.eq("day").map(|lit| date_value("day", lit)).transpose()?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn appointment_query(filters: &Filters) -> Result<AppointmentQuery, SqlError> {
    let mut query = AppointmentQuery {
        id: filters.opt_ulid("id")?,
        day: filters.eq("day").map(|lit| date_value("day", lit)).transpose()?,
        tz: filters.eq("tz").map(|lit| tz_value("tz", lit)).transpose()?,
        status: filters.eq("status").map(|lit| status_value("status", lit)).transpose()?,
        client_id: filters.opt_ulid("client_id")?,
        service_id: filters.opt_ulid("service_id")?,
        ..Default::default()
    };
    for p in filters.0.iter().filter(|p| p.column == "start") {
        let t = time_value("start", &p.value)?;
        match p.op {
            Op::GtEq | Op::Gt => query.from = Some(t),
            Op::Lt | Op::LtEq => query.to = Some(t),
            Op::Eq => return Err(SqlError::Unsupported("start = ...; use a range".into())),
        }
    }
    Ok(query)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Gt,
    GtEq,
    Lt,
    LtEq,
}

#[derive(Debug)]
struct Predicate {
    column: String,
    op: Op,
    value: Literal,
}

/// Conjunction of `column <op> literal` comparisons.
#[derive(Debug, Default)]
struct Filters(Vec<Predicate>);

impl Filters {
    fn from_selection(selection: &Option<Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters::default();
        if let Some(expr) = selection {
            collect_predicates(expr, &mut filters.0)?;
        }
        Ok(filters)
    }

    fn eq(&self, column: &str) -> Option<&Literal> {
        self.0
            .iter()
            .find(|p| p.op == Op::Eq && p.column == column)
            .map(|p| &p.value)
    }

    fn opt_ulid(&self, column: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.eq(column).map(|lit| ulid_value(column, lit)).transpose()
    }

    fn only(&self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.0.iter().find(|p| !allowed.contains(&p.column.as_str())) {
            Some(p) => Err(SqlError::Unsupported(format!("filter on {}", p.column))),
            None => Ok(()),
        }
    }
}

fn collect_predicates(expr: &Expr, out: &mut Vec<Predicate>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_predicates(left, out)?;
                    return collect_predicates(right, out);
                }
                ast::BinaryOperator::Eq => Op::Eq,
                ast::BinaryOperator::Gt => Op::Gt,
                ast::BinaryOperator::GtEq => Op::GtEq,
                ast::BinaryOperator::Lt => Op::Lt,
                ast::BinaryOperator::LtEq => Op::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("comparison {expr}")))?;
            out.push(Predicate {
                column,
                op,
                value: literal(right)?,
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("condition {other}"))),
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

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let filters = Filters::from_selection(selection)?;
    filters.only(&["id"])?;
    let lit = filters.eq("id").ok_or(SqlError::MissingFilter("id"))?;
    ulid_value("id", lit)
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// A SQL literal, reduced to what column parsers need.
#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Null,
    Text(String),
    Bool(bool),
}

fn literal(expr: &Expr) -> Result<Literal, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(Literal::Null),
            Value::Boolean(b) => Ok(Literal::Bool(*b)),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Literal::Text(s.clone())),
            other => Err(SqlError::Parse(format!("unsupported literal {other}"))),
        },
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => match literal(expr)? {
            Literal::Text(s) => Ok(Literal::Text(format!("-{s}"))),
            _ => Err(SqlError::Parse(format!("cannot negate {expr}"))),
        },
        Expr::Nested(inner) => literal(inner),
        other => Err(SqlError::Parse(format!("expected value, got {other}"))),
    }
}

fn bad_value(column: &str, reason: impl ToString) -> SqlError {
    SqlError::BadValue {
        column: column.to_string(),
        reason: reason.to_string(),
    }
}

fn text_value(column: &str, lit: &Literal) -> Result<String, SqlError> {
    match lit {
        Literal::Text(s) => Ok(s.clone()),
        Literal::Null => Err(bad_value(column, "must not be NULL")),
        Literal::Bool(b) => Ok(b.to_string()),
    }
}

fn opt_text(lit: &Literal) -> Option<String> {
    match lit {
        Literal::Null => None,
        Literal::Text(s) => Some(s.clone()),
        Literal::Bool(b) => Some(b.to_string()),
    }
}

fn ulid_value(column: &str, lit: &Literal) -> Result<Ulid, SqlError> {
    let s = text_value(column, lit)?;
    Ulid::from_string(s.trim()).map_err(|e| bad_value(column, format!("bad ULID: {e}")))
}

fn opt_u32(column: &str, lit: &Literal) -> Result<Option<u32>, SqlError> {
    match opt_text(lit) {
        None => Ok(None),
        Some(s) => s.trim().parse().map(Some).map_err(|e| bad_value(column, e)),
    }
}

/// Accepts `35.50` and `35,50`.
fn price_value(column: &str, lit: &Literal) -> Result<Decimal, SqlError> {
    let s = text_value(column, lit)?;
    Decimal::from_str(&s.trim().replace(',', ".")).map_err(|e| bad_value(column, e))
}

fn tz_value(column: &str, lit: &Literal) -> Result<Tz, SqlError> {
    let s = text_value(column, lit)?;
    s.trim().parse::<Tz>().map_err(|e| bad_value(column, e))
}

fn status_value(column: &str, lit: &Literal) -> Result<AppointmentStatus, SqlError> {
    let s = text_value(column, lit)?;
    AppointmentStatus::parse(&s).ok_or_else(|| bad_value(column, format!("unknown status {s:?}")))
}

fn time_value(column: &str, lit: &Literal) -> Result<TimeInput, SqlError> {
    let s = text_value(column, lit)?;
    TimeInput::parse(&s).map_err(|e| bad_value(column, e))
}

fn date_value(column: &str, lit: &Literal) -> Result<NaiveDate, SqlError> {
    let s = text_value(column, lit)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| bad_value(column, e))
}

fn bool_value(column: &str, lit: &Literal) -> Result<bool, SqlError> {
    match lit {
        Literal::Bool(b) => Ok(*b),
        Literal::Text(s) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(bad_value(column, format!("bad bool: {s}"))),
        },
        Literal::Null => Err(bad_value(column, "must not be NULL")),
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
    #[error("unknown column {column} in {table}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("missing value for {0}")]
    MissingColumn(&'static str),
    #[error("bad value for {column}: {reason}")]
    BadValue { column: String, reason: String },
}

//! Entities and a scripted connection shared by the unit tests.

use crate::identity::EntityRef;
use asupersync::CancelReason;
use rowtrack_core::{
    ConnectionError, ConnectionErrorKind, Cx, Dialect, Entity, Error, FieldInfo, Generated, IsolationLevel,
    Outcome, PropertyNotifier, QueryError, QueryErrorKind, Result, Row, SqlType, TransactionOps,
    Value,
};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

pub(crate) fn shared<E>(entity: E) -> EntityRef<E> {
    Arc::new(RwLock::new(entity))
}

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Blog {
    pub id: i32,
    pub name: Option<String>,
    pub rating: i16,
}

impl Blog {
    pub(crate) fn named(name: &str) -> Self {
        Self {
            id: 0,
            name: Some(name.to_string()),
            rating: 0,
        }
    }

    pub(crate) fn stored(id: i32, name: &str) -> Self {
        Self {
            id,
            ..Self::named(name)
        }
    }
}

impl Entity for Blog {
    const TABLE_NAME: &'static str = "blog";

    fn fields() -> &'static [FieldInfo] {
        static FIELDS: [FieldInfo; 3] = [
            FieldInfo::new("id", "id", SqlType::Integer).identity(),
            FieldInfo::new("name", "name", SqlType::Text).nullable(true),
            FieldInfo::new("rating", "rating", SqlType::SmallInt),
        ];
        &FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::Int(self.id)),
            ("name", self.name.clone().into()),
            ("rating", Value::SmallInt(self.rating)),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            rating: row.get_named("rating")?,
        })
    }

    fn set_column(&mut self, column: &str, value: Value) -> Result<()> {
        match column {
            "id" => self.id = value.try_into()?,
            "name" => self.name = value.try_into()?,
            "rating" => self.rating = value.try_into()?,
            _ => {}
        }
        Ok(())
    }
}

/// A row as SQLite hands it back: every integer widened to `BigInt`.
pub(crate) fn blog_row(id: i64, name: Option<&str>) -> Row {
    Row::new(
        vec!["id".into(), "name".into(), "rating".into()],
        vec![Value::BigInt(id), name.into(), Value::BigInt(0)],
    )
}

#[derive(Debug)]
pub(crate) struct NotifyingBlog {
    pub id: i32,
    pub name: Option<String>,
    pub notifier: PropertyNotifier,
}

impl NotifyingBlog {
    pub(crate) fn named(name: &str) -> Self {
        Self {
            id: 0,
            name: Some(name.to_string()),
            notifier: PropertyNotifier::new(),
        }
    }

    pub(crate) fn stored(id: i32, name: &str) -> Self {
        Self {
            id,
            ..Self::named(name)
        }
    }

    pub(crate) fn set_name(&mut self, name: Option<String>) {
        if self.name != name {
            self.name = name;
            self.notifier.notify("name");
        }
    }
}

impl Entity for NotifyingBlog {
    const TABLE_NAME: &'static str = "notifying_blog";

    fn fields() -> &'static [FieldInfo] {
        static FIELDS: [FieldInfo; 2] = [
            FieldInfo::new("id", "id", SqlType::Integer).identity(),
            FieldInfo::new("name", "name", SqlType::Text).nullable(true),
        ];
        &FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("id", Value::Int(self.id)), ("name", self.name.clone().into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            notifier: PropertyNotifier::new(),
        })
    }

    fn set_column(&mut self, column: &str, value: Value) -> Result<()> {
        match column {
            "id" => {
                self.id = value.try_into()?;
                self.notifier.notify("id");
            }
            "name" => self.set_name(value.try_into()?),
            _ => {}
        }
        Ok(())
    }

    fn change_notifier(&self) -> Option<&PropertyNotifier> {
        Some(&self.notifier)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Post {
    pub id: i32,
    pub blog_id: i32,
    pub title: String,
}

impl Post {
    pub(crate) fn new(blog_id: i32, title: &str) -> Self {
        Self {
            id: 0,
            blog_id,
            title: title.to_string(),
        }
    }

    pub(crate) fn stored(id: i32, blog_id: i32, title: &str) -> Self {
        Self {
            id,
            ..Self::new(blog_id, title)
        }
    }
}

impl Entity for Post {
    const TABLE_NAME: &'static str = "post";

    fn fields() -> &'static [FieldInfo] {
        static FIELDS: [FieldInfo; 3] = [
            FieldInfo::new("id", "id", SqlType::Integer).identity(),
            FieldInfo::new("blog_id", "blog_id", SqlType::Integer).foreign_key("blog.id"),
            FieldInfo::new("title", "title", SqlType::Text),
        ];
        &FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::Int(self.id)),
            ("blog_id", Value::Int(self.blog_id)),
            ("title", Value::Text(self.title.clone())),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            blog_id: row.get_named("blog_id")?,
            title: row.get_named("title")?,
        })
    }

    fn set_column(&mut self, column: &str, value: Value) -> Result<()> {
        match column {
            "id" => self.id = value.try_into()?,
            "blog_id" => self.blog_id = value.try_into()?,
            "title" => self.title = value.try_into()?,
            _ => {}
        }
        Ok(())
    }
}

/// A row whose version is bumped by the database on every write.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Versioned {
    pub id: i32,
    pub name: String,
    pub version: i64,
}

impl Versioned {
    pub(crate) fn stored(id: i32, name: &str, version: i64) -> Self {
        Self {
            id,
            name: name.to_string(),
            version,
        }
    }
}

impl Entity for Versioned {
    const TABLE_NAME: &'static str = "versioned";

    fn fields() -> &'static [FieldInfo] {
        static FIELDS: [FieldInfo; 3] = [
            FieldInfo::new("id", "id", SqlType::Integer).identity(),
            FieldInfo::new("name", "name", SqlType::Text),
            FieldInfo::new("version", "version", SqlType::BigInt)
                .generated(Generated::Always)
                .concurrency_token(true),
        ];
        &FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::Int(self.id)),
            ("name", Value::Text(self.name.clone())),
            ("version", Value::BigInt(self.version)),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            version: row.get_named("version")?,
        })
    }

    fn set_column(&mut self, column: &str, value: Value) -> Result<()> {
        match column {
            "id" => self.id = value.try_into()?,
            "name" => self.name = value.try_into()?,
            "version" => self.version = value.try_into()?,
            _ => {}
        }
        Ok(())
    }
}

/// Half of a mutual reference: a team names its captain.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Team {
    pub id: i32,
    pub captain_id: Option<i32>,
}

impl Team {
    pub(crate) fn new(id: i32, captain_id: Option<i32>) -> Self {
        Self { id, captain_id }
    }
}

impl Entity for Team {
    const TABLE_NAME: &'static str = "team";

    fn fields() -> &'static [FieldInfo] {
        static FIELDS: [FieldInfo; 2] = [
            FieldInfo::new("id", "id", SqlType::Integer).primary_key(true),
            FieldInfo::new("captain_id", "captain_id", SqlType::Integer)
                .nullable(true)
                .foreign_key("player.id"),
        ];
        &FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("id", Value::Int(self.id)), ("captain_id", self.captain_id.into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            captain_id: row.get_named("captain_id")?,
        })
    }

    fn set_column(&mut self, column: &str, value: Value) -> Result<()> {
        match column {
            "id" => self.id = value.try_into()?,
            "captain_id" => self.captain_id = value.try_into()?,
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Player {
    pub id: i32,
    pub team_id: Option<i32>,
}

impl Player {
    pub(crate) fn new(id: i32, team_id: Option<i32>) -> Self {
        Self { id, team_id }
    }
}

impl Entity for Player {
    const TABLE_NAME: &'static str = "player";

    fn fields() -> &'static [FieldInfo] {
        static FIELDS: [FieldInfo; 2] = [
            FieldInfo::new("id", "id", SqlType::Integer).primary_key(true),
            FieldInfo::new("team_id", "team_id", SqlType::Integer)
                .nullable(true)
                .foreign_key("team.id"),
        ];
        &FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("id", Value::Int(self.id)), ("team_id", self.team_id.into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            team_id: row.get_named("team_id")?,
        })
    }

    fn set_column(&mut self, column: &str, value: Value) -> Result<()> {
        match column {
            "id" => self.id = value.try_into()?,
            "team_id" => self.team_id = value.try_into()?,
            _ => {}
        }
        Ok(())
    }
}

// ============================================================================
// Scripted connection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Failure {
    Constraint,
    Disconnect,
    Other,
}

impl Failure {
    fn into_error(self, sql: &str) -> Error {
        match self {
            Failure::Constraint => Error::Query(
                QueryError::new(QueryErrorKind::Constraint, "FOREIGN KEY constraint failed")
                    .with_sql(sql),
            ),
            Failure::Disconnect => Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Disconnected,
                message: "connection reset".into(),
                source: None,
            }),
            Failure::Other => {
                Error::Query(QueryError::new(QueryErrorKind::Database, "disk I/O error").with_sql(sql))
            }
        }
    }
}

/// What the mock has seen, plus knobs for what it should do.
#[derive(Debug, Default)]
pub(crate) struct MockState {
    /// Statements run inside transactions, in order.
    pub executed: Vec<(String, Vec<Value>)>,
    /// Statements run directly on the connection.
    pub queries: Vec<String>,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
    /// Rows answered to every connection-level query.
    pub select_rows: Vec<Row>,
    /// Last key handed out by a RETURNING clause.
    pub next_id: i64,
    /// Statements containing this text report zero affected rows.
    pub zero_rows_on: Option<String>,
    /// Statements containing this text fail.
    pub fail_on: Option<(String, Failure)>,
    /// Statements containing this text come back cancelled.
    pub cancel_on: Option<String>,
}

impl MockState {
    fn scripted_failure(&self, sql: &str) -> Option<Error> {
        self.fail_on
            .as_ref()
            .filter(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, failure)| failure.into_error(sql))
    }

    fn cancels(&self, sql: &str) -> bool {
        self.cancel_on
            .as_ref()
            .is_some_and(|pattern| sql.contains(pattern.as_str()))
    }

    fn affects_nothing(&self, sql: &str) -> bool {
        self.zero_rows_on
            .as_ref()
            .is_some_and(|pattern| sql.contains(pattern.as_str()))
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    pub(crate) fn new(state: Arc<Mutex<MockState>>) -> Self {
        Self { state }
    }
}

impl rowtrack_core::Connection for MockConnection {
    type Tx<'conn>
        = MockTransaction
    where
        Self: 'conn;

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        _params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let state = Arc::clone(&self.state);
        let sql = sql.to_string();
        async move {
            let mut guard = lock(&state);
            if let Some(e) = guard.scripted_failure(&sql) {
                return Outcome::Err(e);
            }
            guard.queries.push(sql);
            Outcome::Ok(guard.select_rows.clone())
        }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        _params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let state = Arc::clone(&self.state);
        let sql = sql.to_string();
        async move {
            lock(&state).queries.push(sql);
            Outcome::Ok(0)
        }
    }

    fn begin_with(
        &self,
        _cx: &Cx,
        _isolation: IsolationLevel,
    ) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            lock(&state).begins += 1;
            Outcome::Ok(MockTransaction { state })
        }
    }

    fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }
}

#[derive(Debug)]
pub(crate) struct MockTransaction {
    state: Arc<Mutex<MockState>>,
}

impl TransactionOps for MockTransaction {
    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let state = Arc::clone(&self.state);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = lock(&state);
            if let Some(e) = guard.scripted_failure(&sql) {
                return Outcome::Err(e);
            }
            if guard.cancels(&sql) {
                return Outcome::Cancelled(CancelReason::user("statement cancelled"));
            }
            let nothing = guard.affects_nothing(&sql);
            guard.executed.push((sql, params));
            if nothing {
                return Outcome::Ok(vec![]);
            }
            guard.next_id += 1;
            Outcome::Ok(vec![Row::new(vec!["id".into()], vec![Value::BigInt(guard.next_id)])])
        }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let state = Arc::clone(&self.state);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = lock(&state);
            if let Some(e) = guard.scripted_failure(&sql) {
                return Outcome::Err(e);
            }
            if guard.cancels(&sql) {
                return Outcome::Cancelled(CancelReason::user("statement cancelled"));
            }
            let affected = u64::from(!guard.affects_nothing(&sql));
            guard.executed.push((sql, params));
            Outcome::Ok(affected)
        }
    }

    fn commit(self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            lock(&self.state).commits += 1;
            Outcome::Ok(())
        }
    }

    fn rollback(self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            lock(&self.state).rollbacks += 1;
            Outcome::Ok(())
        }
    }
}

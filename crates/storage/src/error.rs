use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("session name '{raw}' is empty"))]
    InvalidSessionName { stage: &'static str, raw: String },
    #[snafu(display("storage entity '{entity}' with id '{id}' was not found"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("session '{name}' already exists"))]
    SessionExists { stage: &'static str, name: String },
    #[snafu(display("storage id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("storage invariant violation: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to create sqlite directory at {path}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse sqlite connection URL '{database_url}'"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to connect sqlite database '{database_url}'"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to run sqlite migrations"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("sqlite query failed at {stage}: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
}

impl StorageError {
    /// The step that produced this error.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::InvalidSessionName { stage, .. }
            | Self::NotFound { stage, .. }
            | Self::SessionExists { stage, .. }
            | Self::InvalidId { stage, .. }
            | Self::InvariantViolation { stage, .. }
            | Self::CreateSqliteDirectory { stage, .. }
            | Self::SqliteConnectOptions { stage, .. }
            | Self::SqliteConnect { stage, .. }
            | Self::SqliteMigrate { stage, .. }
            | Self::SqliteQuery { stage, .. } => stage,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when a create was rejected because the name is taken.
    pub fn is_duplicate_session(&self) -> bool {
        matches!(self, Self::SessionExists { .. })
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

// dumpship/src/config/mod.rs
pub mod settings;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

use crate::errors::ConfigError;
pub use settings::*;

// Structs for deserializing the config document (JSON or YAML)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfig {
    pub temp_dir: Option<PathBuf>,
    pub database: Option<RawDatabaseConfig>,
    pub container: Option<RawContainerConfig>,
    pub s3: Option<RawS3Config>,
    pub github: Option<RawGithubConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDatabaseConfig {
    pub name: Option<String>,
    pub all_databases: Option<bool>,
    pub compression_level: Option<i64>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub os_user: Option<String>,
    pub pg_dump: Option<String>,
    pub pg_dumpall: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawContainerConfig {
    pub name_pattern: Option<String>,
    pub id: Option<String>,
    pub cli: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawS3Config {
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub bucket: Option<String>,
    #[serde(alias = "accessKeyId")]
    pub access_key_id: Option<String>,
    #[serde(
        alias = "secret_access_key",
        alias = "accessKeySecret",
        alias = "secretAccessKey"
    )]
    pub access_key_secret: Option<String>,
    pub prefix: Option<String>,
    pub force_path_style: Option<bool>,
    pub streaming: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawGithubConfig {
    #[serde(alias = "actor")]
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub token: Option<String>,
    pub api_url: Option<String>,
    pub branch: Option<String>,
    pub path_prefix: Option<String>,
}

/// Values supplied on the command line. Every `Some` wins over the document.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub temp_dir: Option<PathBuf>,
    pub db_name: Option<String>,
    pub all_databases: bool,
    pub compression_level: Option<i64>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub container_pattern: Option<String>,
    pub container_id: Option<String>,
    pub container_cli: Option<String>,
    pub no_stream: bool,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,
    pub github_owner: Option<String>,
    pub github_repo: Option<String>,
    pub github_token: Option<String>,
}

/// Loads the config document. `.yaml`/`.yml` files are parsed as YAML, anything else as JSON.
pub fn load_document(path: &Path) -> Result<RawConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

    let parsed = if is_yaml {
        serde_yaml::from_str(&content).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&content).map_err(|e| e.to_string())
    };

    parsed.map_err(|message| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    })
}

impl RawConfig {
    /// Layers CLI overrides on top of the document.
    pub fn apply_overrides(mut self, overrides: ConfigOverrides) -> Self {
        if overrides.temp_dir.is_some() {
            self.temp_dir = overrides.temp_dir;
        }

        let db = self.database.get_or_insert_with(Default::default);
        set_if_some(&mut db.name, overrides.db_name);
        if overrides.all_databases {
            db.all_databases = Some(true);
        }
        set_if_some(&mut db.compression_level, overrides.compression_level);
        set_if_some(&mut db.host, overrides.host);
        set_if_some(&mut db.port, overrides.port);
        set_if_some(&mut db.username, overrides.username);
        set_if_some(&mut db.password, overrides.password);

        if overrides.container_pattern.is_some() || overrides.container_id.is_some() {
            let container = self.container.get_or_insert_with(Default::default);
            set_if_some(&mut container.name_pattern, overrides.container_pattern);
            set_if_some(&mut container.id, overrides.container_id);
        }
        if let Some(container) = self.container.as_mut() {
            set_if_some(&mut container.cli, overrides.container_cli);
        }

        let s3_flags = [
            &overrides.s3_bucket,
            &overrides.s3_region,
            &overrides.s3_endpoint,
        ];
        if s3_flags.iter().any(|flag| flag.is_some()) || self.s3.is_some() {
            let s3 = self.s3.get_or_insert_with(Default::default);
            set_if_some(&mut s3.bucket, overrides.s3_bucket);
            set_if_some(&mut s3.region, overrides.s3_region);
            set_if_some(&mut s3.endpoint, overrides.s3_endpoint);
            set_if_some(&mut s3.access_key_id, overrides.s3_access_key_id);
            set_if_some(&mut s3.access_key_secret, overrides.s3_secret_access_key);
            if overrides.no_stream {
                s3.streaming = Some(false);
            }
        }

        let github_flags = [&overrides.github_owner, &overrides.github_repo];
        if github_flags.iter().any(|flag| flag.is_some()) || self.github.is_some() {
            let github = self.github.get_or_insert_with(Default::default);
            set_if_some(&mut github.owner, overrides.github_owner);
            set_if_some(&mut github.repo, overrides.github_repo);
            set_if_some(&mut github.token, overrides.github_token);
        }

        self
    }
}

fn set_if_some<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

/// Treats empty or whitespace-only strings as absent.
fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn required(value: &Option<String>, field: &'static str) -> Result<String, ConfigError> {
    present(value)
        .map(str::to_string)
        .ok_or(ConfigError::MissingField(field))
}

/// Resolves a layered config into a validated plan. `started_at` stamps the dump name.
pub fn resolve(raw: &RawConfig, started_at: DateTime<Utc>) -> Result<BackupPlan, ConfigError> {
    let db = raw.database.clone().unwrap_or_default();

    let scope = resolve_scope(&db)?;
    let compression = match db.compression_level {
        Some(level) => CompressionLevel::new(level)?,
        None => CompressionLevel::default(),
    };
    let container = raw.container.as_ref().map(resolve_container).transpose()?;
    let connection = resolve_connection(&db, container.is_some())?;
    let upload_target = resolve_upload_target(raw)?;

    let tools = DumpTools {
        pg_dump: present(&db.pg_dump)
            .map(str::to_string)
            .unwrap_or_else(|| DumpTools::default().pg_dump),
        pg_dumpall: present(&db.pg_dumpall)
            .map(str::to_string)
            .unwrap_or_else(|| DumpTools::default().pg_dumpall),
    };

    let plan = BackupPlan {
        scope,
        container,
        compression,
        connection,
        upload_target,
        tools,
        os_user: present(&db.os_user).unwrap_or(DEFAULT_OS_USER).to_string(),
        temp_dir: raw.temp_dir.clone().unwrap_or_else(std::env::temp_dir),
        started_at,
    };
    debug!(?plan, "Configuration resolved");
    Ok(plan)
}

fn resolve_scope(db: &RawDatabaseConfig) -> Result<DatabaseScope, ConfigError> {
    let all = db.all_databases.unwrap_or(false);
    match present(&db.name) {
        Some(_) if all => Err(ConfigError::InvalidField {
            field: "database.all_databases",
            reason: "cannot be combined with database.name".to_string(),
        }),
        Some(name) if name.starts_with('-') => Err(ConfigError::InvalidField {
            field: "database.name",
            reason: format!("'{}' would be read as a command-line option", name),
        }),
        Some(name) => Ok(DatabaseScope::SingleDatabase(name.to_string())),
        None if all => Ok(DatabaseScope::AllDatabases),
        None => Err(ConfigError::MissingField("database.name")),
    }
}

fn resolve_container(raw: &RawContainerConfig) -> Result<ContainerRequest, ConfigError> {
    let target = if let Some(id) = present(&raw.id) {
        ContainerId::new(id)
            .map(ContainerTarget::Id)
            .ok_or_else(|| ConfigError::InvalidField {
                field: "container.id",
                reason: format!("'{}' is not a valid container identifier", id),
            })?
    } else {
        ContainerTarget::Pattern(required(&raw.name_pattern, "container.name_pattern")?)
    };

    Ok(ContainerRequest {
        target,
        cli: present(&raw.cli).unwrap_or(DEFAULT_CONTAINER_CLI).to_string(),
    })
}

fn resolve_connection(
    db: &RawDatabaseConfig,
    containerized: bool,
) -> Result<Option<Connection>, ConfigError> {
    // A host or port names a server other than the local socket, which needs credentials.
    let remote = present(&db.host).is_some() || db.port.is_some();
    let username = match present(&db.username) {
        Some(username) => username.to_string(),
        None if containerized || remote => {
            return Err(ConfigError::MissingField("database.username"));
        }
        None => return Ok(None),
    };

    Connection::new(
        present(&db.host).unwrap_or(DEFAULT_HOST),
        db.port.unwrap_or(DEFAULT_PORT),
        &username,
        present(&db.password),
    )
    .map(Some)
}

fn resolve_upload_target(raw: &RawConfig) -> Result<UploadTarget, ConfigError> {
    match (&raw.s3, &raw.github) {
        (Some(_), Some(_)) => Err(ConfigError::ConflictingUploadTargets),
        (None, None) => Err(ConfigError::NoUploadTarget),
        (Some(s3), None) => resolve_s3(s3).map(UploadTarget::ObjectStore),
        (None, Some(github)) => resolve_github(github).map(UploadTarget::RepositoryContents),
    }
}

fn resolve_s3(raw: &RawS3Config) -> Result<ObjectStoreTarget, ConfigError> {
    let endpoint = match present(&raw.endpoint) {
        Some(endpoint) => {
            Url::parse(endpoint).map_err(|e| ConfigError::InvalidField {
                field: "s3.endpoint",
                reason: e.to_string(),
            })?;
            Some(endpoint.trim_end_matches('/').to_string())
        }
        None => None,
    };
    let region = match (present(&raw.region), &endpoint) {
        (Some(region), _) => region.to_string(),
        (None, Some(_)) => DEFAULT_S3_REGION.to_string(),
        (None, None) => return Err(ConfigError::MissingField("s3.region")),
    };

    Ok(ObjectStoreTarget {
        endpoint,
        bucket: required(&raw.bucket, "s3.bucket")?,
        region,
        access_key_id: required(&raw.access_key_id, "s3.access_key_id")?,
        secret_key: required(&raw.access_key_secret, "s3.access_key_secret")?,
        prefix: present(&raw.prefix).map(str::to_string),
        force_path_style: raw.force_path_style.unwrap_or(false),
        streaming: raw.streaming,
    })
}

fn resolve_github(raw: &RawGithubConfig) -> Result<GithubTarget, ConfigError> {
    let api_url = present(&raw.api_url).unwrap_or(DEFAULT_GITHUB_API_URL);
    let api_url = Url::parse(api_url).map_err(|e| ConfigError::InvalidField {
        field: "github.api_url",
        reason: e.to_string(),
    })?;

    Ok(GithubTarget {
        owner: required(&raw.owner, "github.owner")?,
        repo: required(&raw.repo, "github.repo")?,
        token: required(&raw.token, "github.token")?,
        api_url,
        branch: present(&raw.branch).map(str::to_string),
        path_prefix: present(&raw.path_prefix)
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty()),
    })
}

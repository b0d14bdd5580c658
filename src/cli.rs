// dumpship/src/cli.rs
use clap::Parser;
use std::path::PathBuf;

use crate::config::ConfigOverrides;

/// CLI for dumpship: capture a PostgreSQL dump and upload it.
#[derive(Parser, Debug)]
#[clap(name = "dumpship", version, about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Cli {
    /// JSON or YAML config document (`.yaml`/`.yml` are read as YAML)
    #[clap(long, short = 'c', env = "DUMPSHIP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print the command and destination, then exit without dumping
    #[clap(long)]
    pub dry_run: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[clap(long, short = 'v')]
    pub verbose: bool,

    /// Directory for the temporary dump file
    #[clap(long, env = "DUMPSHIP_TEMP_DIR")]
    pub temp_dir: Option<PathBuf>,

    /// Database to dump
    #[clap(long = "db", short = 'd', env = "DUMPSHIP_DB_NAME")]
    pub db_name: Option<String>,

    /// Dump every database of the instance with pg_dumpall
    #[clap(long, env = "DUMPSHIP_ALL_DATABASES")]
    pub all_databases: bool,

    /// pg_dump compression level, 0 to 9
    #[clap(long, short = 'z', env = "DUMPSHIP_COMPRESSION_LEVEL", allow_negative_numbers = true)]
    pub compression_level: Option<i64>,

    #[clap(long, env = "DUMPSHIP_DB_HOST")]
    pub host: Option<String>,

    #[clap(long, short = 'p', env = "DUMPSHIP_DB_PORT")]
    pub port: Option<u16>,

    #[clap(long, short = 'U', env = "DUMPSHIP_DB_USER")]
    pub username: Option<String>,

    #[clap(long, env = "PGPASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Dump inside the first container whose name starts with this
    #[clap(long, env = "DUMPSHIP_CONTAINER")]
    pub container: Option<String>,

    /// Dump inside this container, skipping the name lookup
    #[clap(long, env = "DUMPSHIP_CONTAINER_ID")]
    pub container_id: Option<String>,

    /// Container CLI (docker, podman, ...)
    #[clap(long, env = "DUMPSHIP_CONTAINER_CLI")]
    pub container_cli: Option<String>,

    /// Capture to a temporary file before uploading to object storage
    #[clap(long)]
    pub no_stream: bool,

    #[clap(long, env = "DUMPSHIP_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    #[clap(long, env = "DUMPSHIP_S3_REGION")]
    pub s3_region: Option<String>,

    #[clap(long, env = "DUMPSHIP_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    #[clap(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    pub s3_access_key_id: Option<String>,

    #[clap(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub s3_secret_access_key: Option<String>,

    /// Owner of the GitHub repository receiving the dump
    #[clap(long, env = "DUMPSHIP_GITHUB_OWNER")]
    pub github_owner: Option<String>,

    #[clap(long, env = "DUMPSHIP_GITHUB_REPO")]
    pub github_repo: Option<String>,

    #[clap(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,
}

impl Cli {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            temp_dir: self.temp_dir.clone(),
            db_name: self.db_name.clone(),
            all_databases: self.all_databases,
            compression_level: self.compression_level,
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            container_pattern: self.container.clone(),
            container_id: self.container_id.clone(),
            container_cli: self.container_cli.clone(),
            no_stream: self.no_stream,
            s3_bucket: self.s3_bucket.clone(),
            s3_region: self.s3_region.clone(),
            s3_endpoint: self.s3_endpoint.clone(),
            s3_access_key_id: self.s3_access_key_id.clone(),
            s3_secret_access_key: self.s3_secret_access_key.clone(),
            github_owner: self.github_owner.clone(),
            github_repo: self.github_repo.clone(),
            github_token: self.github_token.clone(),
        }
    }
}

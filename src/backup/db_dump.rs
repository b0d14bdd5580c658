// dumpship/src/backup/db_dump.rs
use std::fmt;
use std::path::PathBuf;
use url::Url;

use crate::config::{BackupSettings, CaptureMode, DatabaseScope, ExecutionContext};

/// Where the dump tool puts its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpOutput {
    /// The tool was given `-f <path>` and writes the file itself.
    ToolWritesFile(PathBuf),
    /// The dump arrives on the process's standard output.
    Stdout,
}

/// A fully argv'd invocation. Executed directly, never through a shell.
#[derive(Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub output: DumpOutput,
}

impl ProcessSpec {
    /// Program followed by its arguments.
    #[cfg(test)]
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }

    /// Command line with passwords masked, safe for logs.
    pub fn redacted(&self) -> String {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().map(|arg| redact_arg(arg)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSpec")
            .field("command", &self.redacted())
            .field(
                "env",
                &self.env.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            )
            .field("output", &self.output)
            .finish()
    }
}

fn redact_arg(arg: &str) -> String {
    let Some(uri) = arg.strip_prefix("--dbname=") else {
        return arg.to_string();
    };
    match Url::parse(uri) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            format!("--dbname={}", parsed)
        }
        _ => arg.to_string(),
    }
}

/// Builds the dump invocation for the run. Pure: same settings, same argv.
pub fn build(settings: &BackupSettings) -> ProcessSpec {
    match &settings.execution {
        ExecutionContext::LocalProcess => build_local(settings),
        ExecutionContext::ContainerizedProcess { container_id, cli } => {
            build_containerized(settings, container_id.as_str(), cli)
        }
    }
}

/// Single-database dumps use the compressed custom format; whole-instance dumps are plain SQL.
fn tool_and_format_flags(settings: &BackupSettings) -> (String, Vec<String>) {
    match &settings.scope {
        DatabaseScope::SingleDatabase(_) => (
            settings.tools.pg_dump.clone(),
            vec![
                format!("-Z{}", settings.compression.get()),
                "-Fc".to_string(),
            ],
        ),
        DatabaseScope::AllDatabases => (settings.tools.pg_dumpall.clone(), Vec::new()),
    }
}

fn build_local(settings: &BackupSettings) -> ProcessSpec {
    let (program, mut args) = tool_and_format_flags(settings);
    let mut env = Vec::new();

    if let Some(conn) = &settings.connection {
        args.extend([
            "-h".to_string(),
            conn.host.clone(),
            "-p".to_string(),
            conn.port.to_string(),
            "-U".to_string(),
            conn.username.clone(),
        ]);
        if let Some(password) = &conn.password {
            env.push(("PGPASSWORD".to_string(), password.clone()));
        }
    }

    if let DatabaseScope::SingleDatabase(name) = &settings.scope {
        args.push(name.clone());
    }

    let output = match settings.capture_mode() {
        CaptureMode::Streaming => DumpOutput::Stdout,
        CaptureMode::File => {
            let path = settings.dump_path();
            args.push("-f".to_string());
            args.push(path.to_string_lossy().into_owned());
            DumpOutput::ToolWritesFile(path)
        }
    };

    ProcessSpec {
        program,
        args,
        env,
        output,
    }
}

/// Credentials travel in the `--dbname` URI so the container CLI need not forward env vars.
/// The output is always stdout; a file inside the container would be out of reach.
fn build_containerized(settings: &BackupSettings, container_id: &str, cli: &str) -> ProcessSpec {
    let (tool, flags) = tool_and_format_flags(settings);
    let mut args = vec!["exec".to_string(), container_id.to_string(), tool];
    args.extend(flags);

    if let Some(conn) = &settings.connection {
        let database = match &settings.scope {
            DatabaseScope::SingleDatabase(name) => Some(name.as_str()),
            DatabaseScope::AllDatabases => None,
        };
        args.push(format!("--dbname={}", conn.uri(database)));
    }

    ProcessSpec {
        program: cli.to_string(),
        args,
        env: Vec::new(),
        output: DumpOutput::Stdout,
    }
}

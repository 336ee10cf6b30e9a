use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::RegistrationError;
use crate::context::{AgentContext, HOST_TAG};
use crate::datapoint::{parse_tags, valid_tag, DataPoint, TagSet, ValidationError, Value};
use crate::dispatch::Emitter;

/// A malformed line of external program output.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LineError {
    #[error("bad line: {0:?}")]
    TooFewFields(String),

    #[error("bad timestamp {0:?}")]
    Timestamp(String),

    #[error("bad value {0:?}")]
    Value(String),

    #[error("bad tag {tag:?}: {source}")]
    Tag {
        tag: String,
        #[source]
        source: ValidationError,
    },

    #[error("line is not valid UTF-8: {0:?}")]
    Encoding(String),

    #[error("invalid datapoint: {0}")]
    Invalid(#[from] ValidationError),
}

/// Result of parsing one output line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub datapoint: DataPoint,
    /// Set when a tag token was rejected. The point keeps the tags parsed
    /// before it; later tokens are ignored.
    pub tag_error: Option<LineError>,
}

/// Parses `<metric> <timestamp> <value> [key=value ...]`.
///
/// A `host=` token removes the host tag. The returned point is already
/// canonicalized through `ctx`.
pub fn parse_line(line: &str, ctx: &AgentContext) -> Result<ParsedLine, LineError> {
    let line = line.trim();
    let fields: Vec<&str> = line.split_whitespace().collect();
    let [metric, ts, value, tokens @ ..] = fields.as_slice() else {
        return Err(LineError::TooFewFields(line.to_string()));
    };

    let timestamp: i64 = ts
        .parse()
        .map_err(|_| LineError::Timestamp((*ts).to_string()))?;
    let value: Value = value
        .parse()
        .map_err(|_| LineError::Value((*value).to_string()))?;

    let mut tags = TagSet::new();
    let mut tag_error = None;
    for token in tokens {
        if token.strip_prefix(HOST_TAG).and_then(|r| r.strip_prefix('=')) == Some("") {
            tags.insert(HOST_TAG, "");
            continue;
        }
        match parse_tag_token(token) {
            Ok(parsed) => {
                tags.merge(&parsed);
            }
            Err(source) => {
                tag_error = Some(LineError::Tag {
                    tag: (*token).to_string(),
                    source,
                });
                break;
            }
        }
    }

    let datapoint = ctx.canonicalize(metric, timestamp, value, tags)?;

    Ok(ParsedLine {
        datapoint,
        tag_error,
    })
}

/// Like [`parse_tags`], but wildcard and alternative values are rejected.
fn parse_tag_token(token: &str) -> Result<TagSet, ValidationError> {
    let tags = parse_tags(token)?;
    if let Some((_, v)) = tags.iter().find(|(_, v)| !valid_tag(v)) {
        return Err(ValidationError::InvalidCharacter(v.to_string()));
    }
    Ok(tags)
}

/// An external executable speaking the line protocol on stdout.
pub struct ProgramCollector {
    path: PathBuf,
    name: String,
    interval: Duration,
}

impl ProgramCollector {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self {
            path,
            name,
            interval,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts the program, and restarts it `interval` after each start (the
    /// default interval when zero) once it has exited.
    pub(crate) async fn run(self, ctx: Arc<AgentContext>, out: Emitter, cancel: CancellationToken) {
        let period = if self.interval.is_zero() {
            ctx.freq()
        } else {
            self.interval
        };

        loop {
            let next = Instant::now() + period;

            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.run_program(&ctx, &out) => result,
            };
            if let Err(e) = result {
                warn!(program = %self.name, error = %e, "program run failed");
            }
            if out.is_closed() {
                return;
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(next) => {}
            }

            ctx.health()
                .program_restarts
                .with_label_values(&[self.name.as_str()])
                .inc();
            info!(program = %self.name, "restarting");
        }
    }

    /// One lifetime of the child process. Returns once stdout closes and the
    /// child has exited.
    async fn run_program(&self, ctx: &AgentContext, out: &Emitter) -> Result<()> {
        let mut child = Command::new(&self.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("starting {}", self.path.display()))?;

        let stdout = child.stdout.take().context("capturing stdout")?;
        let stderr = child.stderr.take().context("capturing stderr")?;

        let program = self.name.clone();
        let stderr_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim();
                        if !line.is_empty() {
                            error!(program = %program, "{line}");
                        }
                    }
                    Err(e) => {
                        warn!(program = %program, error = %e, "reading stderr");
                        break;
                    }
                }
            }
        });

        // stdout is dropped before waiting so the child sees a closed pipe.
        let read = self.read_stdout(stdout, ctx, out).await;

        let status = child.wait().await.context("waiting for program")?;
        if let Err(e) = stderr_task.await {
            warn!(program = %self.name, error = %e, "stderr reader failed");
        }
        if !status.success() {
            warn!(program = %self.name, %status, "program exited unsuccessfully");
        }

        read
    }

    /// Parses and emits stdout line by line. Malformed lines are counted and
    /// skipped.
    async fn read_stdout(&self, stdout: ChildStdout, ctx: &AgentContext, out: &Emitter) -> Result<()> {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await.context("reading stdout")? == 0 {
                return Ok(());
            }

            match decode_line(&buf).and_then(|line| parse_line(line, ctx)) {
                Ok(parsed) => {
                    if let Some(e) = parsed.tag_error {
                        ctx.health().program_parse_errors.inc();
                        warn!(program = %self.name, error = %e, "ignoring remaining tags");
                    }
                    if !out.emit(parsed.datapoint).await {
                        return Ok(());
                    }
                }
                Err(LineError::Invalid(e)) => {
                    ctx.health().datapoints_rejected.inc();
                    warn!(program = %self.name, error = %e, "rejected datapoint");
                }
                Err(e) => {
                    ctx.health().program_parse_errors.inc();
                    error!(program = %self.name, error = %e, "skipping line");
                }
            }
        }
    }
}

fn decode_line(raw: &[u8]) -> Result<&str, LineError> {
    std::str::from_utf8(raw)
        .map_err(|_| LineError::Encoding(String::from_utf8_lossy(raw).trim().to_string()))
}

/// Registers every executable under `dir/<seconds>/`.
///
/// Folder names give the interval in seconds; bad folders are logged and
/// skipped.
pub fn init_programs(dir: &Path) -> Vec<ProgramCollector> {
    let (programs, errors) = scan_programs(dir);
    for e in &errors {
        warn!(error = %e, "skipping program registration");
    }
    info!(dir = %dir.display(), count = programs.len(), "registered external programs");
    programs
}

pub(crate) fn scan_programs(dir: &Path) -> (Vec<ProgramCollector>, Vec<RegistrationError>) {
    let mut programs = Vec::new();
    let mut errors = Vec::new();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(source) => {
            errors.push(RegistrationError::Unreadable {
                path: dir.to_path_buf(),
                source,
            });
            return (programs, errors);
        }
    };

    let mut folders: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    folders.sort();

    for folder in folders {
        let name = folder
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Ok(secs) = name.parse::<u64>() else {
            errors.push(RegistrationError::BadFolder(name));
            continue;
        };
        let interval = Duration::from_secs(secs);

        let files = match fs::read_dir(&folder) {
            Ok(files) => files,
            Err(source) => {
                errors.push(RegistrationError::Unreadable {
                    path: folder,
                    source,
                });
                continue;
            }
        };

        let mut paths: Vec<PathBuf> = files
            .filter_map(|f| f.ok())
            .filter(|f| f.metadata().is_ok_and(|m| m.is_file() && is_executable(&m)))
            .map(|f| f.path())
            .collect();
        paths.sort();

        programs.extend(paths.into_iter().map(|p| ProgramCollector::new(p, interval)));
    }

    (programs, errors)
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::health::HealthMetrics;

    fn ctx() -> AgentContext {
        let health = Arc::new(HealthMetrics::new("").expect("health metrics"));
        AgentContext::new("web01", health)
    }

    #[test]
    fn test_parse_line_with_host_tag() {
        let parsed = parse_line("foo.bar 1000 5 host=x", &ctx()).expect("parse");
        assert_eq!(
            parsed.datapoint,
            DataPoint::new("foo.bar", 1000, 5, TagSet::from([("host", "x")]))
        );
        assert!(parsed.tag_error.is_none());
    }

    #[test]
    fn test_parse_line_injects_host_and_defaults() {
        let ctx = ctx().with_default_tags(TagSet::from([("env", "prod")]));
        let parsed = parse_line("  disk.free 1000 2.5 env=dev mount=/  ", &ctx).expect("parse");
        let dp = parsed.datapoint;
        assert_eq!(dp.value, Value::Float(2.5));
        assert_eq!(dp.tags.get("host"), Some("web01"));
        assert_eq!(dp.tags.get("env"), Some("dev"));
        assert_eq!(dp.tags.get("mount"), Some("/"));
    }

    #[test]
    fn test_parse_line_host_opt_out() {
        let parsed = parse_line("foo 1 1 host= a=b", &ctx()).expect("parse");
        assert!(!parsed.datapoint.tags.contains_key("host"));
        assert_eq!(parsed.datapoint.tags.get("a"), Some("b"));
    }

    #[test]
    fn test_parse_line_errors() {
        let ctx = ctx();
        assert_eq!(
            parse_line("bad line", &ctx),
            Err(LineError::TooFewFields("bad line".to_string()))
        );
        assert_eq!(parse_line("", &ctx), Err(LineError::TooFewFields(String::new())));
        assert_eq!(
            parse_line("foo nope 1", &ctx),
            Err(LineError::Timestamp("nope".to_string()))
        );
        assert_eq!(
            parse_line("foo 1 NaNx", &ctx),
            Err(LineError::Value("NaNx".to_string()))
        );
        assert!(matches!(
            parse_line("!!! 1 1", &ctx),
            Err(LineError::Invalid(ValidationError::Metric { .. }))
        ));
    }

    #[test]
    fn test_parse_line_bad_tag_keeps_earlier_tags() {
        let parsed = parse_line("foo 1 1 a=b c=* d=e", &ctx()).expect("parse");
        let tags = &parsed.datapoint.tags;
        assert_eq!(tags.get("a"), Some("b"));
        assert!(!tags.contains_key("c"));
        assert!(!tags.contains_key("d"));
        assert!(matches!(parsed.tag_error, Some(LineError::Tag { ref tag, .. }) if tag == "c=*"));
    }

    #[test]
    fn test_scan_programs_unreadable_dir() {
        let (programs, errors) = scan_programs(Path::new("/nonexistent/hostcollect"));
        assert!(programs.is_empty());
        assert!(matches!(errors.as_slice(), [RegistrationError::Unreadable { .. }]));
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_programs_folders() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let zero = dir.path().join("0");
        let thirty = dir.path().join("30");
        fs::create_dir(&zero).expect("mkdir");
        fs::create_dir(&thirty).expect("mkdir");
        fs::create_dir(dir.path().join("weekly")).expect("mkdir");

        for (path, mode) in [
            (zero.join("a.sh"), 0o755),
            (thirty.join("b.sh"), 0o700),
            (thirty.join("notes.txt"), 0o644),
        ] {
            fs::write(&path, "#!/bin/sh\n").expect("write");
            fs::set_permissions(&path, fs::Permissions::from_mode(mode)).expect("chmod");
        }

        let (programs, errors) = scan_programs(dir.path());
        let found: Vec<(String, Duration)> = programs
            .iter()
            .map(|p| {
                let file = p.path().file_name().map(|n| n.to_string_lossy().into_owned());
                (file.unwrap_or_default(), p.interval())
            })
            .collect();
        assert_eq!(
            found,
            vec![
                ("a.sh".to_string(), Duration::ZERO),
                ("b.sh".to_string(), Duration::from_secs(30)),
            ]
        );
        assert!(matches!(errors.as_slice(), [RegistrationError::BadFolder(n)] if n == "weekly"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_program_emits_and_skips_bad_lines() {
        use crate::dispatch::Dispatcher;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("emit.sh");
        fs::write(
            &script,
            "#!/bin/sh\n\
             echo 'foo.bar 1000 5 host=x'\n\
             echo 'bad line'\n\
             echo 'oops' >&2\n\
             echo 'foo.baz 1001 6'\n",
        )
        .expect("write");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");

        let health = Arc::new(HealthMetrics::new("").expect("health metrics"));
        let ctx = AgentContext::new("web01", Arc::clone(&health));
        let mut d = Dispatcher::new(16, Arc::clone(&health));
        let mut rx = d.take_receiver().expect("receiver");

        let program = ProgramCollector::new(&script, Duration::from_secs(60));
        program
            .run_program(&ctx, &d.emitter(program.name()))
            .await
            .expect("run program");

        let first = rx.recv().await.expect("first");
        let second = rx.recv().await.expect("second");
        assert_eq!(first.metric, "foo.bar");
        assert_eq!(first.tags.get("host"), Some("x"));
        assert_eq!(second.metric, "foo.baz");
        assert_eq!(second.tags.get("host"), Some("web01"));
        assert!(rx.try_recv().is_err());
        assert_eq!(health.program_parse_errors.get() as u64, 1);
    }

    #[tokio::test]
    async fn test_run_program_missing_executable() {
        use crate::dispatch::Dispatcher;

        let health = Arc::new(HealthMetrics::new("").expect("health metrics"));
        let ctx = AgentContext::new("web01", Arc::clone(&health));
        let d = Dispatcher::new(4, health);
        let program = ProgramCollector::new("/nonexistent/collector", Duration::ZERO);
        assert!(program.run_program(&ctx, &d.emitter("x")).await.is_err());
    }
    #[cfg(unix)]
    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invalid_utf8_skips_only_that_line() {
        use crate::dispatch::Dispatcher;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = script(
            dir.path(),
            "binary.sh",
            "printf 'a.one 1 1\\nbad \\377\\na.two 2 2\\n'\n\
             printf 'warn \\377\\n' >&2\n\
             yes noise | head -n 20000 >&2\n\
             echo 'a.three 3 3'\n",
        );

        let health = Arc::new(HealthMetrics::new("").expect("health metrics"));
        let ctx = AgentContext::new("web01", Arc::clone(&health));
        let mut d = Dispatcher::new(16, Arc::clone(&health));
        let mut rx = d.take_receiver().expect("receiver");

        let program = ProgramCollector::new(&path, Duration::ZERO);
        tokio::time::timeout(
            Duration::from_secs(30),
            program.run_program(&ctx, &d.emitter(program.name())),
        )
        .await
        .expect("program finished")
        .expect("run program");

        let mut metrics = Vec::new();
        while let Ok(dp) = rx.try_recv() {
            metrics.push(dp.metric);
        }
        assert_eq!(metrics, vec!["a.one", "a.two", "a.three"]);
        assert_eq!(health.program_parse_errors.get() as u64, 1);
    }

    #[test]
    fn test_decode_line_rejects_invalid_utf8() {
        assert_eq!(decode_line(b"a.b 1 2\n"), Ok("a.b 1 2\n"));
        assert!(matches!(decode_line(b"bad \xff\n"), Err(LineError::Encoding(_))));
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_restart_scheduled_from_previous_start() {
        use crate::dispatch::Dispatcher;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = script(dir.path(), "tick.sh", "echo 'restart.tick 1 1'\n");

        let cases = [
            (Duration::from_secs(30), Duration::from_secs(15), Duration::from_secs(30)),
            (Duration::ZERO, Duration::from_secs(45), Duration::from_secs(45)),
        ];
        for (interval, freq, period) in cases {
            let health = Arc::new(HealthMetrics::new("").expect("health metrics"));
            let ctx = Arc::new(AgentContext::new("web01", Arc::clone(&health)).with_freq(freq));
            let mut d = Dispatcher::new(16, Arc::clone(&health));
            let mut rx = d.take_receiver().expect("receiver");

            let program = ProgramCollector::new(&path, interval);
            let name = program.name().to_string();
            let cancel = CancellationToken::new();
            let started = Instant::now();
            let task = tokio::spawn(program.run(ctx, d.emitter(&name), cancel.clone()));

            let first = rx.recv().await.expect("first run");
            let second = rx.recv().await.expect("second run");
            assert_eq!(first.metric, "restart.tick");
            assert_eq!(second.metric, "restart.tick");
            assert!(started.elapsed() >= period, "restarted before {period:?}");
            assert_eq!(
                health
                    .program_restarts
                    .with_label_values(&[name.as_str()])
                    .get() as u64,
                1
            );

            cancel.cancel();
            task.await.expect("runner task");
        }
    }
}

//! Z39.50 sessions driven through the `yaz-client` command-line tool.
//!
//! Each session owns one `yaz-client` child process. Commands are written to
//! its stdin and the transcript is read from stdout up to the next `Z> `
//! prompt. Hit counts and record blocks are parsed from that transcript.

use crate::error::ZexportError;
use crate::models::{QuerySyntax, Record, SearchQuery, TargetConfig};
use crate::services::session::{RecordSession, SessionConnector};

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

const PROMPT: &[u8] = b"Z> ";

/// Default number of records fetched per `show` command.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Opens sessions by spawning `yaz-client`.
#[derive(Debug, Clone)]
pub struct YazClientConnector {
    program: PathBuf,
    batch_size: usize,
}

impl YazClientConnector {
    /// Create a connector for the given executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), batch_size: DEFAULT_BATCH_SIZE }
    }

    /// Set how many records each `show` retrieves.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

#[async_trait]
impl SessionConnector for YazClientConnector {
    async fn connect(&self, target: &TargetConfig) -> Result<Box<dyn RecordSession>, ZexportError> {
        let mut child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ZexportError::connection_with_source(
                    format!("Failed to start {}", self.program.display()),
                    e,
                )
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ZexportError::connection("yaz-client stdio was not captured"));
        };

        let mut session = YazSession {
            child,
            stdin,
            stdout,
            buffer: Vec::new(),
            batch_size: self.batch_size,
            syntax: None,
        };

        session.read_to_prompt().await.map_err(|e| {
            ZexportError::connection(format!("yaz-client did not start: {e}"))
        })?;

        let address = format!("tcp:{}:{}/{}", target.host, target.port, target.database);
        let transcript = session
            .command(&format!("open {address}"))
            .await
            .map_err(|e| ZexportError::connection(format!("Failed to open {address}: {e}")))?;

        if !transcript.contains("Connection accepted") {
            let reason = first_line_containing(&transcript, &["refused", "rejected", "failed", "Could not"])
                .unwrap_or("no connection accepted");
            return Err(ZexportError::connection(format!(
                "{} refused the session: {}",
                target.display_url(),
                reason.trim()
            )));
        }

        Ok(Box::new(session))
    }
}

struct YazSession {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    buffer: Vec<u8>,
    batch_size: usize,
    syntax: Option<QuerySyntax>,
}

impl YazSession {
    async fn command(&mut self, line: &str) -> Result<String, ZexportError> {
        tracing::trace!(command = line, "yaz-client");
        self.stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| ZexportError::internal(format!("Write to yaz-client failed: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| ZexportError::internal(format!("Write to yaz-client failed: {e}")))?;
        self.read_to_prompt().await
    }

    async fn read_to_prompt(&mut self) -> Result<String, ZexportError> {
        let mut chunk = [0u8; 8192];
        loop {
            if self.buffer.ends_with(PROMPT) {
                let transcript = String::from_utf8_lossy(&self.buffer[..self.buffer.len() - PROMPT.len()])
                    .into_owned();
                self.buffer.clear();
                return Ok(transcript);
            }

            let n = self
                .stdout
                .read(&mut chunk)
                .await
                .map_err(|e| ZexportError::internal(format!("Read from yaz-client failed: {e}")))?;
            if n == 0 {
                return Err(ZexportError::internal("yaz-client exited"));
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

#[async_trait]
impl RecordSession for YazSession {
    async fn search(&mut self, query: &SearchQuery) -> Result<Vec<Record>, ZexportError> {
        if self.syntax != Some(query.syntax) {
            self.command(&format!("querytype {}", query.syntax.as_str())).await?;
            self.syntax = Some(query.syntax);
        }

        let transcript = self.command(&format!("find {}", query.text)).await?;
        check_search_succeeded(&transcript)?;

        let hits = parse_hit_count(&transcript)
            .ok_or_else(|| ZexportError::internal("Search response carried no hit count"))?;
        let wanted = query.limit.map_or(hits, |limit| limit.min(hits));

        let mut records = Vec::with_capacity(wanted);
        while records.len() < wanted {
            let start = records.len() + 1;
            let count = self.batch_size.min(wanted - records.len());
            let transcript = self.command(&format!("show {start}+{count}")).await?;

            let batch = parse_records(&transcript);
            if batch.is_empty() {
                return Err(ZexportError::internal(format!(
                    "Present at position {start} returned no records"
                )));
            }
            records.extend(batch);
        }
        records.truncate(wanted);

        tracing::debug!(hits, fetched = records.len(), "yaz-client search finished");
        Ok(records)
    }

    async fn close(&mut self) -> Result<(), ZexportError> {
        let _ = self.command("close").await;
        let _ = self.stdin.write_all(b"quit\n").await;
        let _ = self.stdin.flush().await;

        self.child
            .wait()
            .await
            .map_err(|e| ZexportError::internal(format!("Waiting for yaz-client failed: {e}")))?;
        Ok(())
    }
}

/// Fail if the transcript reports an unsuccessful search.
fn check_search_succeeded(transcript: &str) -> Result<(), ZexportError> {
    if transcript.contains("Search was a success") {
        return Ok(());
    }
    let reason = first_line_containing(transcript, &["failure", "Diagnostic", "error", "Not connected"])
        .unwrap_or("no search response");
    Err(ZexportError::internal(format!("Search failed: {}", reason.trim())))
}

/// Extract the hit count from a `find` transcript.
pub fn parse_hit_count(transcript: &str) -> Option<usize> {
    transcript.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("Number of hits:")?;
        rest.split(',').next()?.trim().parse().ok()
    })
}

/// Extract record bodies from a `show` transcript.
///
/// A record starts after a `[<database>]Record type: ...` header line and
/// runs until the next header, `nextResultSetPosition` or `Elapsed:`.
pub fn parse_records(transcript: &str) -> Vec<Record> {
    let mut records = Vec::new();
    let mut current: Option<Vec<&str>> = None;

    for line in transcript.lines() {
        if is_record_header(line) {
            if let Some(lines) = current.take() {
                records.push(finish_record(lines));
            }
            current = Some(Vec::new());
        } else if line.starts_with("nextResultSetPosition") || line.starts_with("Elapsed:") {
            if let Some(lines) = current.take() {
                records.push(finish_record(lines));
            }
        } else if let Some(lines) = current.as_mut() {
            lines.push(line);
        }
    }

    if let Some(lines) = current {
        records.push(finish_record(lines));
    }
    records
}

fn is_record_header(line: &str) -> bool {
    line.starts_with('[')
        && line.find("]Record type:").is_some_and(|pos| pos > 1)
}

fn finish_record(mut lines: Vec<&str>) -> Record {
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    Record::new(lines.join("\n"))
}

fn first_line_containing<'a>(transcript: &'a str, needles: &[&str]) -> Option<&'a str> {
    transcript.lines().find(|line| needles.iter().any(|n| line.contains(n)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIND: &str = "Sent searchRequest.\n\
        Received SearchResponse.\n\
        Search was a success.\n\
        Number of hits: 3, setno 1\n\
        records returned: 0\n\
        Elapsed: 0.104\n";

    const SHOW: &str = "Sent presentRequest (1+2).\n\
        Records: 2\n\
        [svod]Record type: USmarc\n\
        001 RU\\NLR\\bib\\1\n\
        245 10 $a First title\n\
        \n\
        [svod]Record type: USmarc\n\
        001 RU\\NLR\\bib\\2\n\
        245 10 $a Second title\n\
        nextResultSetPosition = 3\n\
        Elapsed: 0.021\n";

    #[test]
    fn test_parse_hit_count() {
        assert_eq!(parse_hit_count(FIND), Some(3));
        assert_eq!(parse_hit_count("Number of hits: 0\n"), Some(0));
        assert_eq!(parse_hit_count("Search was a bloomin' failure.\n"), None);
    }

    #[test]
    fn test_parse_records() {
        let records = parse_records(SHOW);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data(), "001 RU\\NLR\\bib\\1\n245 10 $a First title");
        assert_eq!(records[1].data(), "001 RU\\NLR\\bib\\2\n245 10 $a Second title");
    }

    #[test]
    fn test_parse_records_ignores_noise() {
        assert!(parse_records("Sent presentRequest (1+1).\nRecords: 0\nElapsed: 0.01\n").is_empty());
        assert!(!is_record_header("[]Record type: USmarc"));
    }

    #[test]
    fn test_check_search_succeeded() {
        assert!(check_search_succeeded(FIND).is_ok());

        let err = check_search_succeeded(
            "Sent searchRequest.\nReceived SearchResponse.\nSearch was a bloomin' failure.\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("failure"));
    }

    /// Stand-in for `yaz-client`: three hits, one line per record, every
    /// command appended to `commands.log` next to the script.
    #[cfg(unix)]
    fn fake_yaz_client(dir: &tempfile::TempDir) -> (PathBuf, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.path().join("yaz-client");
        let log = dir.path().join("commands.log");
        let body = format!(
            r#"#!/bin/sh
printf 'Z> '
while IFS= read -r line; do
  echo "$line" >> '{log}'
  case "$line" in
    "open tcp:refused.example.org"*)
      printf 'Connecting...\nConnection rejected by v3 target.\n' ;;
    open*)
      printf 'Connecting...OK.\nSent initrequest.\nConnection accepted by v3 target.\n' ;;
    find*)
      printf 'Sent searchRequest.\nReceived SearchResponse.\nSearch was a success.\nNumber of hits: 3, setno 1\nrecords returned: 0\nElapsed: 0.010\n' ;;
    show*)
      spec=${{line#show }}
      i=${{spec%+*}}
      end=$((i + ${{spec#*+}}))
      while [ "$i" -lt "$end" ]; do
        printf '[books]Record type: SUTRS\nrecord %s\n\n' "$i"
        i=$((i + 1))
      done
      printf 'nextResultSetPosition = %s\nElapsed: 0.005\n' "$end" ;;
    quit)
      exit 0 ;;
  esac
  printf 'Z> '
done
"#,
            log = log.display()
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script, log)
    }

    #[cfg(unix)]
    fn logged_commands(log: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(log).unwrap().lines().map(String::from).collect()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_session_fetches_in_batches_and_closes() {
        let dir = tempfile::TempDir::new().unwrap();
        let (script, log) = fake_yaz_client(&dir);
        let connector = YazClientConnector::new(script).with_batch_size(2);
        let target = TargetConfig::new("z.example.org", 210, "books");

        let mut session = connector.connect(&target).await.unwrap();
        let records = session.search(&SearchQuery::all()).await.unwrap();
        session.close().await.unwrap();

        assert_eq!(
            records,
            vec![Record::new("record 1"), Record::new("record 2"), Record::new("record 3")]
        );
        assert_eq!(
            logged_commands(&log),
            vec![
                "open tcp:z.example.org:210/books".to_string(),
                format!("querytype {}", SearchQuery::all().syntax.as_str()),
                format!("find {}", SearchQuery::all().text),
                "show 1+2".to_string(),
                "show 3+1".to_string(),
                "close".to_string(),
                "quit".to_string(),
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_single_record_batches_and_limit() {
        let dir = tempfile::TempDir::new().unwrap();
        let (script, log) = fake_yaz_client(&dir);
        let connector = YazClientConnector::new(script).with_batch_size(1);
        let target = TargetConfig::new("z.example.org", 210, "books");

        let mut session = connector.connect(&target).await.unwrap();
        let all = session.search(&SearchQuery::all()).await.unwrap();
        let probe = session.search(&SearchQuery::all().probe()).await.unwrap();
        session.close().await.unwrap();

        assert_eq!(all.len(), 3);
        assert_eq!(probe, vec![Record::new("record 1")]);

        let commands = logged_commands(&log);
        assert_eq!(commands.iter().filter(|c| c.starts_with("show ")).count(), 4);
        assert_eq!(commands.iter().filter(|c| c.starts_with("querytype ")).count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_refused_open_is_connection_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let (script, _log) = fake_yaz_client(&dir);
        let target = TargetConfig::new("refused.example.org", 210, "books");

        let err = match YazClientConnector::new(script).connect(&target).await {
            Ok(_) => panic!("refused target opened a session"),
            Err(e) => e,
        };

        assert!(matches!(err, ZexportError::Connection { .. }));
        assert!(err.to_string().contains("rejected"));
    }

    #[tokio::test]
    async fn test_missing_executable_is_connection_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = TargetConfig::new("z.example.org", 210, "books");

        let err = match YazClientConnector::new(dir.path().join("no-such-yaz-client")).connect(&target).await {
            Ok(_) => panic!("missing executable opened a session"),
            Err(e) => e,
        };

        assert!(matches!(err, ZexportError::Connection { .. }));
    }
}

// GMP client for one Greenbone/OpenVAS engine

use std::time::Duration;

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};

use super::{EngineError, ScanEngine, TaskStatus};
use crate::config::{ProbeConfig, ScanConfig};

// ============================================
// Configuration Constants
// ============================================

/// Timeout for establishing the TCP + TLS connection
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Timeout for ordinary GMP commands
const COMMAND_TIMEOUT_SECS: u64 = 30;

/// Timeout for report downloads (full reports can be large)
const REPORT_TIMEOUT_SECS: u64 = 180;

// ============================================
// Client Implementation
// ============================================

struct Connection {
    stream: tokio_native_tls::TlsStream<TcpStream>,
    authenticated: bool,
}

/// Handle for one probe. A single GMP session is kept per probe and
/// commands are serialized over it; transport errors drop the session and
/// the next attempt reconnects and re-authenticates.
pub struct GmpClient {
    host: String,
    port: u16,
    username: String,
    password: String,
    scan_config: String,
    scanner: String,
    default_port_range: String,
    retry_attempts: u32,
    retry_delay: Duration,
    conn: Mutex<Option<Connection>>,
}

impl GmpClient {
    pub fn new(probe: &ProbeConfig, scan: &ScanConfig) -> Self {
        Self {
            host: probe.host.clone(),
            port: probe.port,
            username: probe.username.clone(),
            password: probe.password.clone(),
            scan_config: scan.gvm_scan_config.clone(),
            scanner: scan.gvm_scanner.clone(),
            default_port_range: scan.default_port_list.clone(),
            retry_attempts: scan.retry_attempts,
            retry_delay: Duration::from_secs(scan.retry_delay),
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<Connection, EngineError> {
        let addr = format!("{}:{}", self.host, self.port);

        let tcp = timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| EngineError::Timeout)?
        .map_err(|e| EngineError::Unavailable(format!("connect {addr}: {e}")))?;

        // GVM engines ship self-signed certificates on 9390.
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| EngineError::Unavailable(format!("tls setup: {e}")))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);

        let stream = timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            connector.connect(&self.host, tcp),
        )
        .await
        .map_err(|_| EngineError::Timeout)?
        .map_err(|e| EngineError::Unavailable(format!("tls handshake {addr}: {e}")))?;

        Ok(Connection {
            stream,
            authenticated: false,
        })
    }

    /// Write one command and read until its `_response` element is closed.
    /// GMP has no framing; the response root's close tag is the delimiter.
    async fn transact(
        conn: &mut Connection,
        cmd_name: &str,
        command: &str,
        timeout_secs: u64,
    ) -> Result<String, EngineError> {
        let io = async {
            conn.stream
                .write_all(command.as_bytes())
                .await
                .map_err(|e| EngineError::Unavailable(format!("write: {e}")))?;
            conn.stream
                .flush()
                .await
                .map_err(|e| EngineError::Unavailable(format!("flush: {e}")))?;

            let close_tag = format!("</{cmd_name}_response>");
            let open_prefix = format!("<{cmd_name}_response");
            let mut buf = Vec::new();
            let mut chunk = [0u8; 8192];

            loop {
                let n = conn
                    .stream
                    .read(&mut chunk)
                    .await
                    .map_err(|e| EngineError::Unavailable(format!("read: {e}")))?;
                if n == 0 {
                    return Err(EngineError::Unavailable("connection closed".to_string()));
                }
                buf.extend_from_slice(&chunk[..n]);

                let text = String::from_utf8_lossy(&buf);
                if text.contains(&close_tag) {
                    return Ok(text.into_owned());
                }
                // Self-closing responses, e.g. <authenticate_response status="200"/>
                if let Some(pos) = text.find(&open_prefix) {
                    if let Some(end) = text[pos..].find('>') {
                        if text[pos..pos + end + 1].ends_with("/>") {
                            return Ok(text.into_owned());
                        }
                    }
                }
            }
        };

        timeout(Duration::from_secs(timeout_secs), io)
            .await
            .map_err(|_| EngineError::Timeout)?
    }

    async fn authenticate(&self, conn: &mut Connection) -> Result<(), EngineError> {
        if conn.authenticated {
            return Ok(());
        }

        let command = format!(
            "<authenticate><credentials><username>{}</username><password>{}</password></credentials></authenticate>",
            escape(&self.username),
            escape(&self.password)
        );
        let response =
            Self::transact(conn, "authenticate", &command, COMMAND_TIMEOUT_SECS).await?;
        let (status, status_text) = response_status(&response, "authenticate")?;

        if status.starts_with('2') {
            conn.authenticated = true;
            Ok(())
        } else {
            Err(EngineError::AuthFailed(status_text))
        }
    }

    async fn request_once(
        &self,
        cmd_name: &str,
        command: &str,
        timeout_secs: u64,
    ) -> Result<String, EngineError> {
        let mut guard = self.conn.lock().await;

        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(EngineError::Unavailable("connection lost".to_string()));
        };

        if let Err(e) = self.authenticate(conn).await {
            *guard = None;
            return Err(e);
        }

        match Self::transact(conn, cmd_name, command, timeout_secs).await {
            Ok(response) => Ok(response),
            Err(e) => {
                // The session is in an unknown state after a transport
                // error; force a reconnect on the next attempt.
                *guard = None;
                Err(e)
            }
        }
    }

    /// Fixed-backoff retry up to `retry_attempts`, reconnecting between
    /// attempts. Safe because creation is keyed by adapter-chosen names.
    async fn request(
        &self,
        cmd_name: &str,
        command: &str,
        timeout_secs: u64,
    ) -> Result<String, EngineError> {
        let mut last_err = EngineError::Unavailable("no attempt made".to_string());

        for attempt in 0..=self.retry_attempts {
            if attempt > 0 {
                sleep(self.retry_delay).await;
            }
            match self.request_once(cmd_name, command, timeout_secs).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        "GMP {} against {} failed (attempt {}): {}",
                        cmd_name,
                        self.host,
                        attempt + 1,
                        e
                    );
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err)
    }

    /// Look up an existing engine object by its adapter-chosen name.
    async fn find_by_name(
        &self,
        plural: &str,
        entity: &str,
        name: &str,
    ) -> Result<Option<String>, EngineError> {
        let cmd_name = format!("get_{plural}");
        let command = format!("<get_{plural} filter=\"name={}\"/>", escape(name));
        let response = self.request(&cmd_name, &command, COMMAND_TIMEOUT_SECS).await?;
        ensure_ok(&response, &cmd_name)?;
        Ok(find_named_entity(&response, entity, name))
    }

    async fn resolve_id(
        &self,
        plural: &str,
        entity: &str,
        name: &str,
    ) -> Result<String, EngineError> {
        self.find_by_name(plural, entity, name).await?.ok_or_else(|| {
            EngineError::Protocol(format!("engine has no {entity} named {name:?}"))
        })
    }
}

#[async_trait::async_trait]
impl ScanEngine for GmpClient {
    async fn ping(&self) -> Result<(), EngineError> {
        let response = self
            .request("get_version", "<get_version/>", COMMAND_TIMEOUT_SECS)
            .await?;
        ensure_ok(&response, "get_version")
    }

    async fn create_target(
        &self,
        name: &str,
        host: &str,
        ports: Option<&[u16]>,
    ) -> Result<String, EngineError> {
        if let Some(id) = self.find_by_name("targets", "target", name).await? {
            return Ok(id);
        }

        let port_range = match ports {
            Some(ports) => ports
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(","),
            None => self.default_port_range.clone(),
        };

        let command = format!(
            "<create_target><name>{}</name><hosts>{}</hosts><port_range>{}</port_range></create_target>",
            escape(name),
            escape(host),
            escape(&port_range)
        );
        let response = self
            .request("create_target", &command, COMMAND_TIMEOUT_SECS)
            .await?;
        let (status, status_text) = response_status(&response, "create_target")?;

        if status.starts_with('2') {
            root_attr(&response, "create_target_response", "id").ok_or_else(|| {
                EngineError::Protocol("create_target response missing id".to_string())
            })
        } else if status_text.to_lowercase().contains("exist") {
            // Lost a race against our own earlier attempt; reuse it.
            self.resolve_id("targets", "target", name).await
        } else {
            Err(EngineError::Protocol(format!(
                "create_target: status {status}: {status_text}"
            )))
        }
    }

    async fn create_task(&self, name: &str, target_id: &str) -> Result<String, EngineError> {
        if let Some(id) = self.find_by_name("tasks", "task", name).await? {
            return Ok(id);
        }

        let config_id = self.resolve_id("configs", "config", &self.scan_config).await?;
        let scanner_id = self.resolve_id("scanners", "scanner", &self.scanner).await?;

        let command = format!(
            "<create_task><name>{}</name><config id=\"{}\"/><target id=\"{}\"/><scanner id=\"{}\"/></create_task>",
            escape(name),
            escape(&config_id),
            escape(target_id),
            escape(&scanner_id)
        );
        let response = self
            .request("create_task", &command, COMMAND_TIMEOUT_SECS)
            .await?;
        let (status, status_text) = response_status(&response, "create_task")?;

        if status.starts_with('2') {
            root_attr(&response, "create_task_response", "id").ok_or_else(|| {
                EngineError::Protocol("create_task response missing id".to_string())
            })
        } else if status_text.to_lowercase().contains("exist") {
            self.resolve_id("tasks", "task", name).await
        } else {
            Err(EngineError::Protocol(format!(
                "create_task: status {status}: {status_text}"
            )))
        }
    }

    async fn start_task(&self, task_id: &str) -> Result<String, EngineError> {
        let command = format!("<start_task task_id=\"{}\"/>", escape(task_id));
        let response = self
            .request("start_task", &command, COMMAND_TIMEOUT_SECS)
            .await?;
        ensure_ok(&response, "start_task")?;

        first_text(&response, "report_id").ok_or_else(|| {
            EngineError::Protocol("start_task response missing report_id".to_string())
        })
    }

    async fn get_task(&self, task_id: &str) -> Result<TaskStatus, EngineError> {
        let command = format!("<get_tasks task_id=\"{}\"/>", escape(task_id));
        let response = self
            .request("get_tasks", &command, COMMAND_TIMEOUT_SECS)
            .await?;
        ensure_ok(&response, "get_tasks")?;

        let status = first_text(&response, "status").ok_or_else(|| {
            EngineError::Protocol("get_tasks response missing status".to_string())
        })?;
        let progress = first_text(&response, "progress")
            .and_then(|p| p.trim().parse::<i32>().ok())
            .unwrap_or(0)
            .clamp(0, 100);

        Ok(TaskStatus { status, progress })
    }

    async fn get_report(&self, report_id: &str) -> Result<String, EngineError> {
        let command = format!(
            "<get_reports report_id=\"{}\" details=\"1\" ignore_pagination=\"1\"/>",
            escape(report_id)
        );
        let response = self
            .request("get_reports", &command, REPORT_TIMEOUT_SECS)
            .await?;
        ensure_ok(&response, "get_reports")?;
        Ok(response)
    }

    async fn stop_task(&self, task_id: &str) -> Result<(), EngineError> {
        let command = format!("<stop_task task_id=\"{}\"/>", escape(task_id));
        let response = self
            .request("stop_task", &command, COMMAND_TIMEOUT_SECS)
            .await?;
        ensure_ok(&response, "stop_task")
    }

    async fn delete_task(&self, task_id: &str) -> Result<(), EngineError> {
        let command = format!("<delete_task task_id=\"{}\" ultimate=\"1\"/>", escape(task_id));
        let response = self
            .request("delete_task", &command, COMMAND_TIMEOUT_SECS)
            .await?;
        ensure_ok(&response, "delete_task")
    }

    async fn delete_target(&self, target_id: &str) -> Result<(), EngineError> {
        let command = format!(
            "<delete_target target_id=\"{}\" ultimate=\"1\"/>",
            escape(target_id)
        );
        let response = self
            .request("delete_target", &command, COMMAND_TIMEOUT_SECS)
            .await?;
        ensure_ok(&response, "delete_target")
    }
}

// ============================================
// Response parsing
// ============================================

fn get_attr(element: &BytesStart<'_>, name: &str) -> Option<String> {
    element
        .try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|attr| attr.unescape_value().ok())
        .map(|value| value.into_owned())
}

/// `status` and `status_text` attributes of the `<{cmd}_response>` root.
fn response_status(xml: &str, cmd: &str) -> Result<(String, String), EngineError> {
    let root = format!("{cmd}_response");
    let mut reader = Reader::from_str(xml);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e))
                if e.name().as_ref() == root.as_bytes() =>
            {
                let status_text = get_attr(&e, "status_text").unwrap_or_default();
                return get_attr(&e, "status")
                    .map(|status| (status, status_text))
                    .ok_or_else(|| {
                        EngineError::Protocol(format!("{root} missing status attribute"))
                    });
            }
            Ok(Event::Eof) => {
                return Err(EngineError::Protocol(format!("no {root} element in response")));
            }
            Err(e) => {
                return Err(EngineError::Protocol(format!("malformed response: {e}")));
            }
            _ => {}
        }
    }
}

fn ensure_ok(xml: &str, cmd: &str) -> Result<(), EngineError> {
    let (status, status_text) = response_status(xml, cmd)?;
    if status.starts_with('2') {
        Ok(())
    } else {
        Err(EngineError::Protocol(format!(
            "{cmd}: status {status}: {status_text}"
        )))
    }
}

/// An attribute on the response root element (e.g. the id of a created
/// resource).
fn root_attr(xml: &str, root: &str, name: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.name().as_ref() == root.as_bytes() => {
                return get_attr(&e, name);
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Text content of the first `<{tag}>` element.
fn first_text(xml: &str, tag: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    let mut inside = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == tag.as_bytes() => inside = true,
            Ok(Event::Text(t)) if inside => {
                return t.unescape().ok().map(|value| value.into_owned());
            }
            Ok(Event::End(e)) if e.name().as_ref() == tag.as_bytes() => inside = false,
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Id of the `<{entity}>` whose direct `<name>` child equals `wanted`.
/// Nested `<name>` elements (permissions, owners) must not match, so the
/// depth inside the current entity is tracked.
fn find_named_entity(xml: &str, entity: &str, wanted: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    let mut current_id: Option<String> = None;
    let mut depth = 0usize;
    let mut in_direct_name = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if current_id.is_none() {
                    if e.name().as_ref() == entity.as_bytes() {
                        current_id = get_attr(&e, "id");
                        depth = 0;
                    }
                } else {
                    depth += 1;
                    in_direct_name = depth == 1 && e.name().as_ref() == b"name";
                }
            }
            Ok(Event::Text(t)) if in_direct_name => {
                if t.unescape().ok().as_deref() == Some(wanted) {
                    return current_id;
                }
            }
            Ok(Event::End(e)) => {
                if current_id.is_some() {
                    if depth == 0 {
                        if e.name().as_ref() == entity.as_bytes() {
                            current_id = None;
                        }
                    } else {
                        depth -= 1;
                        in_direct_name = false;
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_status_reads_root_attributes() {
        let xml = r#"<create_target_response status="201" status_text="OK, resource created" id="t-1"/>"#;
        let (status, text) = response_status(xml, "create_target").unwrap();
        assert_eq!(status, "201");
        assert_eq!(text, "OK, resource created");
        assert_eq!(
            root_attr(xml, "create_target_response", "id").as_deref(),
            Some("t-1")
        );
    }

    #[test]
    fn response_status_rejects_missing_root() {
        let err = response_status("<unrelated/>", "get_tasks").unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[test]
    fn first_text_finds_nested_element() {
        let xml = r#"<start_task_response status="202" status_text="OK"><report_id>r-99</report_id></start_task_response>"#;
        assert_eq!(first_text(xml, "report_id").as_deref(), Some("r-99"));
        assert_eq!(first_text(xml, "missing"), None);
    }

    #[test]
    fn find_named_entity_skips_nested_names() {
        let xml = r#"
            <get_targets_response status="200" status_text="OK">
              <target id="other-id">
                <name>scan-other</name>
                <permissions><permission><name>scan-abc</name></permission></permissions>
              </target>
              <target id="wanted-id">
                <name>scan-abc</name>
              </target>
            </get_targets_response>"#;
        assert_eq!(
            find_named_entity(xml, "target", "scan-abc").as_deref(),
            Some("wanted-id")
        );
        assert_eq!(find_named_entity(xml, "target", "scan-none"), None);
    }

    #[test]
    fn task_status_parses_status_and_progress() {
        let xml = r#"
            <get_tasks_response status="200" status_text="OK">
              <task id="task-1">
                <name>scan-abc</name>
                <status>Running</status>
                <progress>42</progress>
              </task>
            </get_tasks_response>"#;
        assert_eq!(first_text(xml, "status").as_deref(), Some("Running"));
        assert_eq!(first_text(xml, "progress").as_deref(), Some("42"));
    }
}

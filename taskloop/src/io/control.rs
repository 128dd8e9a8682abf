//! Control channel into a running orchestrator.
//!
//! A Unix domain socket carrying one JSON request per line and one JSON
//! response per line. The orchestrator owns the listening side and polls it
//! without blocking between iterations; `taskloop control` is the client.

use std::path::Path;
#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Stop starting new iterations until resumed.
    Pause,
    Resume,
    /// Stop after the current iteration.
    Cancel,
    SkipTask {
        task_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Return a failed (possibly exhausted) task to pending.
    RetryTask { task_id: String },
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub data: Option<Value>,
}

impl ControlResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
            data: None,
        }
    }

    pub fn with_data(data: Value) -> Self {
        Self {
            ok: true,
            error: None,
            data: Some(data),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(msg.into()),
            data: None,
        }
    }
}

#[cfg(unix)]
pub use unix::{ControlServer, send_control};

#[cfg(unix)]
mod unix {
    use std::fs;
    use std::io::{BufRead, BufReader, ErrorKind, Write};
    use std::os::unix::net::{UnixListener, UnixStream};

    use anyhow::{Context, anyhow};
    use tracing::{debug, warn};

    use super::*;

    const IO_TIMEOUT: Duration = Duration::from_secs(5);

    /// Listening side, owned by the running loop. The socket file is removed on drop.
    #[derive(Debug)]
    pub struct ControlServer {
        listener: UnixListener,
        path: PathBuf,
    }

    impl ControlServer {
        pub fn bind(path: &Path) -> Result<Self> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create socket dir {}", parent.display()))?;
            }
            // A leftover file from a dead orchestrator blocks bind.
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "removed leftover control socket"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("remove {}", path.display())),
            }
            let listener = UnixListener::bind(path)
                .with_context(|| format!("bind control socket {}", path.display()))?;
            listener
                .set_nonblocking(true)
                .context("set control socket non-blocking")?;
            Ok(Self {
                listener,
                path: path.to_path_buf(),
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Serve every pending connection, then return how many requests were handled.
        pub fn poll<F>(&self, mut handler: F) -> Result<usize>
        where
            F: FnMut(ControlRequest) -> ControlResponse,
        {
            let mut handled = 0;
            loop {
                match self.listener.accept() {
                    Ok((stream, _)) => match serve(stream, &mut handler) {
                        Ok(n) => handled += n,
                        Err(e) => warn!(err = %e, "control connection failed"),
                    },
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(handled),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e).context("accept control connection"),
                }
            }
        }
    }

    impl Drop for ControlServer {
        fn drop(&mut self) {
            if let Err(e) = fs::remove_file(&self.path)
                && e.kind() != ErrorKind::NotFound
            {
                warn!(path = %self.path.display(), err = %e, "failed to remove control socket");
            }
        }
    }

    fn serve<F>(stream: UnixStream, handler: &mut F) -> Result<usize>
    where
        F: FnMut(ControlRequest) -> ControlResponse,
    {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;
        let mut writer = stream.try_clone().context("clone control stream")?;
        let reader = BufReader::new(stream);

        let mut handled = 0;
        for line in reader.lines() {
            let line = line.context("read control request")?;
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<ControlRequest>(&line) {
                Ok(request) => {
                    debug!(?request, "control request");
                    handled += 1;
                    handler(request)
                }
                Err(e) => ControlResponse::error(format!("invalid request: {e}")),
            };
            write_line(&mut writer, &response)?;
        }
        Ok(handled)
    }

    fn write_line(stream: &mut UnixStream, response: &ControlResponse) -> Result<()> {
        let json = serde_json::to_string(response).context("serialize control response")?;
        writeln!(stream, "{json}").context("write control response")?;
        stream.flush().context("flush control response")
    }

    /// Send one request to the orchestrator listening on `socket`.
    pub fn send_control(socket: &Path, request: &ControlRequest) -> Result<ControlResponse> {
        let mut stream = UnixStream::connect(socket)
            .with_context(|| format!("connect to orchestrator at {}", socket.display()))?;
        // The loop only polls between iterations, so a reply can take a full iteration.
        stream.set_read_timeout(None)?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;

        let json = serde_json::to_string(request).context("serialize control request")?;
        writeln!(stream, "{json}").context("write control request")?;
        stream.flush()?;
        stream
            .shutdown(std::net::Shutdown::Write)
            .context("close control request stream")?;

        let reader = BufReader::new(&stream);
        for line in reader.lines() {
            let line = line.context("read control response")?;
            if !line.trim().is_empty() {
                return serde_json::from_str(&line).context("parse control response");
            }
        }
        Err(anyhow!("orchestrator closed the connection without replying"))
    }
}

#[cfg(not(unix))]
#[derive(Debug)]
pub struct ControlServer;

#[cfg(not(unix))]
impl ControlServer {
    pub fn bind(_path: &Path) -> Result<Self> {
        anyhow::bail!("control channel unsupported on this platform")
    }

    pub fn path(&self) -> &Path {
        Path::new("")
    }

    pub fn poll<F>(&self, _handler: F) -> Result<usize>
    where
        F: FnMut(ControlRequest) -> ControlResponse,
    {
        Ok(0)
    }
}

#[cfg(not(unix))]
pub fn send_control(_socket: &Path, _request: &ControlRequest) -> Result<ControlResponse> {
    anyhow::bail!("control channel unsupported on this platform")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_use_cmd_tag() {
        let raw = r#"{"cmd":"skip_task","task_id":"1.2","reason":"obsolete"}"#;
        let parsed: ControlRequest = serde_json::from_str(raw).expect("parse");
        assert_eq!(
            parsed,
            ControlRequest::SkipTask {
                task_id: "1.2".to_string(),
                reason: Some("obsolete".to_string()),
            }
        );
        let pause = serde_json::to_string(&ControlRequest::Pause).expect("serialize");
        assert_eq!(pause, r#"{"cmd":"pause"}"#);
    }

    #[test]
    fn response_flattens_data() {
        let resp = ControlResponse::with_data(json!({"paused": true}));
        let raw = serde_json::to_value(&resp).expect("serialize");
        assert_eq!(raw, json!({"ok": true, "paused": true}));
    }

    #[cfg(unix)]
    #[test]
    fn server_answers_client_between_polls() {
        let temp = tempfile::tempdir().expect("tempdir");
        let socket = temp.path().join("control.sock");
        let server = ControlServer::bind(&socket).expect("bind");
        assert_eq!(server.poll(|_| ControlResponse::ok()).expect("idle poll"), 0);

        let client_socket = socket.clone();
        let client = std::thread::spawn(move || {
            send_control(&client_socket, &ControlRequest::Pause).expect("send")
        });

        let mut seen = Vec::new();
        while seen.is_empty() {
            server
                .poll(|req| {
                    seen.push(req);
                    ControlResponse::with_data(json!({"paused": true}))
                })
                .expect("poll");
            std::thread::sleep(Duration::from_millis(10));
        }

        let response = client.join().expect("join");
        assert!(response.ok);
        assert_eq!(seen, vec![ControlRequest::Pause]);
        assert_eq!(response.data, Some(json!({"paused": true})));

        drop(server);
        assert!(!socket.exists());
    }
}

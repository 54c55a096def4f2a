//! TCP client for a beanstalkd-compatible broker.
//!
//! Speaks the text protocol: CRLF-delimited command lines, length-prefixed
//! bodies, YAML stats payloads. A lost connection is re-established with
//! bounded retries before a [`QueueError::Socket`] surfaces.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::info;

use super::{JobStats, QueueError, ReservedJob, TubeStats, WorkQueue};

/// beanstalkd default priority (lower is more urgent).
const DEFAULT_PRI: u32 = 1 << 31;

/// Reconnect attempts after a socket failure before giving up.
const RECONNECT_RETRIES: u32 = 2;

#[derive(Debug)]
enum Request<'a> {
    Use(&'a str),
    Watch(&'a str),
    Ignore(&'a str),
    Put {
        delay: u64,
        ttr: u64,
        body: &'a [u8],
    },
    Reserve {
        timeout: Option<u64>,
    },
    Delete(u64),
    Release {
        id: u64,
        delay: u64,
    },
    Bury(u64),
    Touch(u64),
    StatsJob(u64),
    StatsTube(&'a str),
    ListTubes,
}

#[derive(Debug)]
enum Response {
    Inserted(u64),
    Reserved(u64, Vec<u8>),
    TimedOut,
    Done,
    NotFound,
    Payload(Vec<u8>),
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(host: &str, port: u16) -> std::io::Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
        })
    }

    async fn read_line(&mut self) -> std::io::Result<String> {
        let mut line = Vec::new();
        loop {
            let byte = self.reader.read_u8().await?;
            if byte == b'\n' {
                break;
            }
            if byte != b'\r' {
                line.push(byte);
            }
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Read an `<n bytes>\r\n<data>\r\n` payload.
    async fn read_payload(&mut self, n_bytes: usize) -> std::io::Result<Vec<u8>> {
        let mut data = vec![0u8; n_bytes + 2];
        self.reader.read_exact(&mut data).await?;
        data.truncate(n_bytes);
        Ok(data)
    }

    async fn exec(&mut self, request: &Request<'_>) -> Result<Response, QueueError> {
        let line = match request {
            Request::Use(tube) => format!("use {tube}"),
            Request::Watch(tube) => format!("watch {tube}"),
            Request::Ignore(tube) => format!("ignore {tube}"),
            Request::Put { delay, ttr, body } => {
                format!("put {DEFAULT_PRI} {delay} {ttr} {}", body.len())
            }
            Request::Reserve { timeout: Some(t) } => format!("reserve-with-timeout {t}"),
            Request::Reserve { timeout: None } => "reserve".to_string(),
            Request::Delete(id) => format!("delete {id}"),
            Request::Release { id, delay } => format!("release {id} {DEFAULT_PRI} {delay}"),
            Request::Bury(id) => format!("bury {id} {DEFAULT_PRI}"),
            Request::Touch(id) => format!("touch {id}"),
            Request::StatsJob(id) => format!("stats-job {id}"),
            Request::StatsTube(tube) => format!("stats-tube {tube}"),
            Request::ListTubes => "list-tubes".to_string(),
        };

        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        if let Request::Put { body, .. } = request {
            self.writer.write_all(body).await?;
            self.writer.write_all(b"\r\n").await?;
        }
        self.writer.flush().await?;

        let reply = self.read_line().await?;
        let mut parts = reply.split_whitespace();
        let word = parts.next().unwrap_or("");
        match word {
            "INSERTED" => Ok(Response::Inserted(parse_int(parts.next(), &reply)?)),
            "RESERVED" => {
                let id = parse_int(parts.next(), &reply)?;
                let n_bytes = parse_int(parts.next(), &reply)? as usize;
                let body = self.read_payload(n_bytes).await?;
                Ok(Response::Reserved(id, body))
            }
            "OK" => {
                let n_bytes = parse_int(parts.next(), &reply)? as usize;
                Ok(Response::Payload(self.read_payload(n_bytes).await?))
            }
            "TIMED_OUT" | "DEADLINE_SOON" => Ok(Response::TimedOut),
            "DELETED" | "RELEASED" | "TOUCHED" | "USING" | "WATCHING" => Ok(Response::Done),
            // BURIED answers both `bury` and an out-of-memory `put`
            "BURIED" => Ok(Response::Done),
            "NOT_IGNORED" => Ok(Response::Done),
            "NOT_FOUND" => Ok(Response::NotFound),
            _ => Err(QueueError::Protocol(reply)),
        }
    }
}

fn parse_int(token: Option<&str>, reply: &str) -> Result<u64, QueueError> {
    token
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| QueueError::Protocol(reply.to_string()))
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::Socket(err.to_string())
    }
}

/// One-tube handle on a beanstalkd broker.
pub struct BeanstalkQueue {
    host: String,
    port: u16,
    tube: String,
    conn: Mutex<Option<Connection>>,
}

impl BeanstalkQueue {
    /// Connect and attach to `tube`.
    pub async fn connect(host: &str, port: u16, tube: &str) -> Result<Self, QueueError> {
        let queue = Self {
            host: host.to_string(),
            port,
            tube: tube.to_string(),
            conn: Mutex::new(None),
        };
        queue.attach().await?;
        Ok(queue)
    }

    async fn attach_conn(&self, conn: &mut Connection) -> Result<(), QueueError> {
        conn.exec(&Request::Ignore("default")).await?;
        conn.exec(&Request::Use(&self.tube)).await?;
        conn.exec(&Request::Watch(&self.tube)).await?;
        Ok(())
    }

    /// Execute a request, reconnecting and re-attaching on socket loss.
    ///
    /// Mirrors the lease contract: any non-socket broker reply passes
    /// through; only transport failures are retried.
    async fn request(&self, request: Request<'_>) -> Result<Response, QueueError> {
        let mut guard = self.conn.lock().await;

        if let Some(conn) = guard.as_mut() {
            match conn.exec(&request).await {
                Err(QueueError::Socket(_)) => *guard = None,
                other => return other,
            }
        }

        info!(tube = %self.tube, "attempting to connect to work queue broker");
        let mut last = QueueError::Socket("not connected".to_string());
        for attempt in 0..=RECONNECT_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            match Connection::open(&self.host, self.port).await {
                Ok(mut conn) => {
                    self.attach_conn(&mut conn).await?;
                    match conn.exec(&request).await {
                        Err(QueueError::Socket(err)) => last = QueueError::Socket(err),
                        other => {
                            info!(tube = %self.tube, "reconnected to work queue broker");
                            *guard = Some(conn);
                            return other;
                        }
                    }
                }
                Err(err) => last = err.into(),
            }
        }
        Err(last)
    }

    fn unexpected(response: Response) -> QueueError {
        QueueError::Protocol(format!("unexpected broker response: {response:?}"))
    }
}

#[async_trait::async_trait]
impl WorkQueue for BeanstalkQueue {
    fn tube(&self) -> &str {
        &self.tube
    }

    async fn put(&self, body: &str, delay: u64, ttr: u64) -> Result<u64, QueueError> {
        match self
            .request(Request::Put {
                delay,
                ttr,
                body: body.as_bytes(),
            })
            .await?
        {
            Response::Inserted(id) => Ok(id),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn reserve(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<ReservedJob>, QueueError> {
        let timeout = timeout.map(|t| t.as_secs());
        match self.request(Request::Reserve { timeout }).await? {
            Response::Reserved(id, body) => Ok(Some(ReservedJob {
                id,
                body: String::from_utf8_lossy(&body).into_owned(),
            })),
            Response::TimedOut => Ok(None),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn delete(&self, id: u64) -> Result<(), QueueError> {
        match self.request(Request::Delete(id)).await? {
            Response::Done => Ok(()),
            Response::NotFound => Err(QueueError::NotFound(id)),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn release(&self, id: u64, delay: u64) -> Result<(), QueueError> {
        match self.request(Request::Release { id, delay }).await? {
            Response::Done => Ok(()),
            Response::NotFound => Err(QueueError::NotFound(id)),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn bury(&self, id: u64) -> Result<(), QueueError> {
        match self.request(Request::Bury(id)).await? {
            Response::Done => Ok(()),
            Response::NotFound => Err(QueueError::NotFound(id)),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn touch(&self, id: u64) -> Result<(), QueueError> {
        match self.request(Request::Touch(id)).await? {
            Response::Done => Ok(()),
            Response::NotFound => Err(QueueError::NotFound(id)),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn stats_job(&self, id: u64) -> Result<JobStats, QueueError> {
        match self.request(Request::StatsJob(id)).await? {
            Response::Payload(yaml) => serde_yaml::from_slice(&yaml)
                .map_err(|e| QueueError::Protocol(format!("bad stats-job payload: {e}"))),
            Response::NotFound => Err(QueueError::NotFound(id)),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn attach(&self) -> Result<(), QueueError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(Connection::open(&self.host, self.port).await?);
        }
        if let Some(conn) = guard.as_mut() {
            self.attach_conn(conn).await?;
        }
        Ok(())
    }

    async fn detach(&self) -> Result<(), QueueError> {
        let result = self.request(Request::Use("default")).await;
        match result? {
            Response::Done => {}
            other => return Err(Self::unexpected(other)),
        }
        match self.request(Request::Ignore(&self.tube)).await? {
            Response::Done => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn list_tubes(&self) -> Result<Vec<String>, QueueError> {
        match self.request(Request::ListTubes).await? {
            Response::Payload(yaml) => serde_yaml::from_slice(&yaml)
                .map_err(|e| QueueError::Protocol(format!("bad list-tubes payload: {e}"))),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn stats_tube(&self, tube: &str) -> Result<TubeStats, QueueError> {
        match self.request(Request::StatsTube(tube)).await? {
            Response::Payload(yaml) => serde_yaml::from_slice(&yaml)
                .map_err(|e| QueueError::Protocol(format!("bad stats-tube payload: {e}"))),
            Response::NotFound => {
                Err(QueueError::Protocol(format!("no such tube: {tube}")))
            }
            other => Err(Self::unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    /// Scripted broker: answers each command line with a canned reply.
    async fn scripted_broker(replies: Vec<String>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut replies = replies.into_iter();
            while let Ok(Some(line)) = lines.next_line().await {
                // put carries a body line that is not a command
                if line.starts_with("put ") {
                    lines.next_line().await.unwrap();
                }
                if line.starts_with("use ")
                    || line.starts_with("watch ")
                    || line.starts_with("ignore ")
                {
                    let reply = if line.starts_with("use ") {
                        "USING x\r\n".to_string()
                    } else {
                        "WATCHING 1\r\n".to_string()
                    };
                    write.write_all(reply.as_bytes()).await.unwrap();
                    continue;
                }
                match replies.next() {
                    Some(reply) => write.write_all(reply.as_bytes()).await.unwrap(),
                    None => break,
                }
            }
        });
        port
    }

    #[tokio::test]
    async fn put_parses_inserted_id() {
        let port = scripted_broker(vec!["INSERTED 42\r\n".to_string()]).await;
        let queue = BeanstalkQueue::connect("127.0.0.1", port, "jobs").await.unwrap();
        let id = queue.put("hello", 0, 60).await.unwrap();
        assert_eq!(id, 42);
    }

    #[tokio::test]
    async fn reserve_reads_length_prefixed_body() {
        let port = scripted_broker(vec!["RESERVED 7 5\r\nhello\r\n".to_string()]).await;
        let queue = BeanstalkQueue::connect("127.0.0.1", port, "jobs").await.unwrap();
        let job = queue
            .reserve(Some(Duration::ZERO))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, 7);
        assert_eq!(job.body, "hello");
    }

    #[tokio::test]
    async fn reserve_timeout_is_empty_not_an_error() {
        let port = scripted_broker(vec!["TIMED_OUT\r\n".to_string()]).await;
        let queue = BeanstalkQueue::connect("127.0.0.1", port, "jobs").await.unwrap();
        assert!(queue.reserve(Some(Duration::ZERO)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_job_parses_yaml_counters() {
        let yaml = "---\nreserves: 4\ntimeouts: 1\nreleases: 2\nstate: ready\n";
        let reply = format!("OK {}\r\n{}\r\n", yaml.len(), yaml);
        let port = scripted_broker(vec![reply]).await;
        let queue = BeanstalkQueue::connect("127.0.0.1", port, "jobs").await.unwrap();
        let stats = queue.stats_job(1).await.unwrap();
        assert_eq!(stats.reserves, 4);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.releases, 2);
        assert_eq!(stats.state, "ready");
    }

    #[tokio::test]
    async fn delete_not_found_surfaces_distinctly() {
        let port = scripted_broker(vec!["NOT_FOUND\r\n".to_string()]).await;
        let queue = BeanstalkQueue::connect("127.0.0.1", port, "jobs").await.unwrap();
        let err = queue.delete(9).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound(9)));
    }
}

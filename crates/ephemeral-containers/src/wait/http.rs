//! Wait for an HTTP endpoint to answer as expected

use super::{DEFAULT_POLL_INTERVAL, DEFAULT_STARTUP_TIMEOUT, Verdict, WaitStrategy, WaitTarget};
use async_trait::async_trait;
use container_runtime::Protocol;
use reqwest::{Client, Method};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

type StatusMatcher = Arc<dyn Fn(u16) -> bool + Send + Sync>;
type BodyMatcher = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Ready once a request to the container returns an accepted response.
///
/// Defaults: `GET`, plain HTTP, the lowest bound TCP port, and status 200.
#[derive(Clone)]
pub struct HttpStrategy {
    path: String,
    port: Option<String>,
    tls: bool,
    insecure: bool,
    method: Method,
    status: StatusMatcher,
    body: Option<BodyMatcher>,
    poll_interval: Duration,
    startup_timeout: Duration,
}

impl fmt::Debug for HttpStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStrategy")
            .field("path", &self.path)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("method", &self.method)
            .field("body_matcher", &self.body.is_some())
            .finish()
    }
}

/// Wait until a request to `path` succeeds
pub fn for_http(path: impl Into<String>) -> HttpStrategy {
    let mut path = path.into();
    if !path.starts_with('/') {
        path.insert(0, '/');
    }
    HttpStrategy {
        path,
        port: None,
        tls: false,
        insecure: false,
        method: Method::GET,
        status: Arc::new(|status| status == 200),
        body: None,
        poll_interval: DEFAULT_POLL_INTERVAL,
        startup_timeout: DEFAULT_STARTUP_TIMEOUT,
    }
}

impl HttpStrategy {
    /// Probe this container port instead of the lowest bound TCP one
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    /// Use HTTPS
    pub fn with_tls(mut self) -> Self {
        self.tls = true;
        self
    }

    /// Use HTTPS and accept any certificate
    pub fn with_insecure_tls(mut self) -> Self {
        self.tls = true;
        self.insecure = true;
        self
    }

    /// Request method
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Accept responses whose status satisfies `matcher`
    pub fn with_status(mut self, matcher: impl Fn(u16) -> bool + Send + Sync + 'static) -> Self {
        self.status = Arc::new(matcher);
        self
    }

    /// Additionally require the body to satisfy `matcher`
    pub fn with_body(mut self, matcher: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.body = Some(Arc::new(matcher));
        self
    }

    /// Override the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Override the startup timeout
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    async fn resolve_port(&self, target: &dyn WaitTarget) -> Result<u16, Verdict> {
        let port = match &self.port {
            Some(port) => port.clone(),
            None => match target.exposed_ports().await {
                Ok(ports) => match ports.iter().find(|p| p.protocol == Protocol::Tcp) {
                    Some(port) => port.to_string(),
                    None if ports.is_empty() => {
                        return Err(Verdict::Failed("no exposed port to probe".to_string()));
                    }
                    None => return Err(Verdict::Failed("no TCP port to probe".to_string())),
                },
                Err(e) => return Err(Verdict::Pending(e.to_string())),
            },
        };
        if let Err(e) = port.parse::<container_runtime::PortQuery>() {
            return Err(Verdict::Failed(e.to_string()));
        }
        target
            .mapped_port(&port)
            .await
            .map_err(|e| Verdict::Pending(e.to_string()))
    }
}

#[async_trait]
impl WaitStrategy for HttpStrategy {
    async fn check(&self, target: &dyn WaitTarget) -> Verdict {
        match target.status().await {
            Ok(status) if status.is_terminal() => {
                return Verdict::Failed(format!("container is {}", status));
            }
            Ok(_) => {}
            Err(e) => return Verdict::Pending(e.to_string()),
        }

        let host = match target.host().await {
            Ok(host) => host,
            Err(e) => return Verdict::Pending(e.to_string()),
        };
        let port = match self.resolve_port(target).await {
            Ok(port) => port,
            Err(verdict) => return verdict,
        };

        let client = match Client::builder()
            .no_proxy()
            .danger_accept_invalid_certs(self.insecure)
            .build()
        {
            Ok(client) => client,
            Err(e) => return Verdict::Failed(format!("cannot build HTTP client: {}", e)),
        };

        let scheme = if self.tls { "https" } else { "http" };
        let url = format!("{}://{}:{}{}", scheme, host, port, self.path);
        let response = match client.request(self.method.clone(), &url).send().await {
            Ok(response) => response,
            Err(e) => return Verdict::Pending(format!("{} {}: {}", self.method, url, e)),
        };

        let status = response.status().as_u16();
        if !(self.status)(status) {
            return Verdict::Pending(format!("{} {} returned status {}", self.method, url, status));
        }

        if let Some(matcher) = &self.body {
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => return Verdict::Pending(format!("reading body of {}: {}", url, e)),
            };
            if !matcher(&body) {
                return Verdict::Pending(format!(
                    "{} {} returned an unexpected body",
                    self.method, url
                ));
            }
        }

        Verdict::Ready
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::testing::FakeTarget;
    use container_runtime::ContainerStatus;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer every connection with a fixed HTTP response
    async fn serve(status_line: &'static str, body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn test_default_expects_200_on_lowest_port() {
        let port = serve("200 OK", "hello").await;
        let target = FakeTarget::running();
        target.map_port("80/tcp", port);
        target.map_port("8443/tcp", 1);

        assert_eq!(for_http("/").check(&target).await, Verdict::Ready);
    }

    #[tokio::test]
    async fn test_status_and_body_matchers() {
        let port = serve("503 Service Unavailable", "starting").await;
        let target = FakeTarget::running();
        target.map_port("8080/tcp", port);

        let strict = for_http("health").with_port("8080/tcp");
        assert!(matches!(strict.check(&target).await, Verdict::Pending(_)));

        let lenient = for_http("health")
            .with_port("8080")
            .with_status(|status| status == 503)
            .with_body(|body| body == "starting");
        assert_eq!(lenient.check(&target).await, Verdict::Ready);

        let wrong_body = for_http("health")
            .with_status(|status| status == 503)
            .with_body(|body| body.contains("ready"));
        assert!(matches!(wrong_body.check(&target).await, Verdict::Pending(_)));
    }

    #[tokio::test]
    async fn test_failed_when_container_exited() {
        let target = FakeTarget::running();
        target.map_port("80/tcp", 1);
        target.set_status(ContainerStatus::Dead);

        assert!(matches!(for_http("/").check(&target).await, Verdict::Failed(_)));
    }

    #[tokio::test]
    async fn test_default_port_skips_udp() {
        let port = serve("200 OK", "hello").await;
        let target = FakeTarget::running();
        target.map_port("53/udp", 1);
        target.map_port("8080/tcp", port);

        assert_eq!(for_http("/").check(&target).await, Verdict::Ready);
    }

    #[tokio::test]
    async fn test_failed_without_tcp_ports() {
        let target = FakeTarget::running();
        target.map_port("53/udp", 1);

        assert!(matches!(for_http("/").check(&target).await, Verdict::Failed(_)));
    }

    #[tokio::test]
    async fn test_failed_without_exposed_ports() {
        let target = FakeTarget::running();
        assert!(matches!(for_http("/").check(&target).await, Verdict::Failed(_)));
    }
}

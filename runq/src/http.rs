//! JSON-over-HTTP implementations of the runner and builder seams.
//!
//! Runner server layout, relative to the registered location:
//!
//! | Call               | Request                                        |
//! |--------------------|------------------------------------------------|
//! | list runners       | `GET    runners`                               |
//! | ping               | `GET    ping`                                  |
//! | runner state       | `GET    runners/{name}/state`                  |
//! | start process      | `POST   runners/{name}/processes` (RunRequest) |
//! | process status     | `GET    runners/{name}/processes/{id}`         |
//! | stop process       | `DELETE runners/{name}/processes/{id}`         |
//!
//! Runner names may contain `/`; they are sent as a single encoded segment.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use reqwest::{Client, Method, Response, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::build::{BuildHandle, BuildOptions, BuilderService};
use crate::runner::{
    ProcessHandle, ProcessStatus, RunRequest, RunnerDescriptor, RunnerHandle, RunnerServerClient,
    RunnerState,
};

const USER_AGENT: &str = concat!("runq/", env!("CARGO_PKG_VERSION"));

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn build_client(timeout: Duration) -> anyhow::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .context("failed to create HTTP client")
}

/// Append `segments` to `base`, encoding each one.
fn endpoint(base: &Url, segments: &[&str]) -> anyhow::Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| anyhow!("{base} cannot be used as a base URL"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn parse_base(location: &str) -> anyhow::Result<Url> {
    Url::parse(location).with_context(|| format!("invalid location {location}"))
}

async fn check(response: Response) -> anyhow::Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if body.is_empty() {
        bail!("HTTP {status}");
    }
    bail!("HTTP {status}: {body}")
}

/// Shared request plumbing for the runner and builder clients.
#[derive(Clone)]
struct JsonTransport {
    client: Client,
}

impl JsonTransport {
    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> anyhow::Result<Response> {
        let mut request = self.client.request(method.clone(), url.clone());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("{method} {url} failed"))?;
        check(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> anyhow::Result<T> {
        let response = self.send::<()>(Method::GET, url, None).await?;
        response.json().await.context("invalid response body")
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> anyhow::Result<T> {
        let response = self.send(Method::POST, url, Some(body)).await?;
        response.json().await.context("invalid response body")
    }
}

/// Connects to runner servers over HTTP.
#[derive(Clone)]
pub struct HttpRunnerServerClient {
    transport: JsonTransport,
    timeout: Duration,
}

impl fmt::Debug for HttpRunnerServerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRunnerServerClient")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpRunnerServerClient {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            transport: JsonTransport {
                client: build_client(timeout)?,
            },
            timeout,
        })
    }
}

#[async_trait]
impl RunnerServerClient for HttpRunnerServerClient {
    async fn connect(&self, location: &str) -> anyhow::Result<Vec<Arc<dyn RunnerHandle>>> {
        let base = parse_base(location)?;
        let descriptors: Vec<RunnerDescriptor> = self
            .transport
            .get_json(endpoint(&base, &["runners"])?)
            .await?;

        Ok(descriptors
            .into_iter()
            .map(|descriptor| {
                Arc::new(HttpRunnerHandle {
                    transport: self.transport.clone(),
                    base: base.clone(),
                    descriptor,
                }) as Arc<dyn RunnerHandle>
            })
            .collect())
    }

    async fn ping(&self, location: &str) -> anyhow::Result<()> {
        let base = parse_base(location)?;
        self.transport
            .send::<()>(Method::GET, endpoint(&base, &["ping"])?, None)
            .await?;
        Ok(())
    }
}

/// One runner on a remote runner server.
pub struct HttpRunnerHandle {
    transport: JsonTransport,
    base: Url,
    descriptor: RunnerDescriptor,
}

impl fmt::Debug for HttpRunnerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRunnerHandle")
            .field("base", &self.base.as_str())
            .field("runner", &self.descriptor.name)
            .finish()
    }
}

impl HttpRunnerHandle {
    fn url(&self, tail: &[&str]) -> anyhow::Result<Url> {
        let mut segments = vec!["runners", self.descriptor.name.as_str()];
        segments.extend_from_slice(tail);
        endpoint(&self.base, &segments)
    }
}

#[async_trait]
impl RunnerHandle for HttpRunnerHandle {
    fn descriptor(&self) -> &RunnerDescriptor {
        &self.descriptor
    }

    async fn state(&self) -> anyhow::Result<RunnerState> {
        self.transport.get_json(self.url(&["state"])?).await
    }

    async fn run(&self, request: &RunRequest) -> anyhow::Result<ProcessHandle> {
        self.transport
            .post_json(self.url(&["processes"])?, request)
            .await
    }

    async fn process_status(&self, process_id: u64) -> anyhow::Result<ProcessStatus> {
        let id = process_id.to_string();
        self.transport
            .get_json(self.url(&["processes", &id])?)
            .await
    }

    async fn stop(&self, process_id: u64) -> anyhow::Result<()> {
        let id = process_id.to_string();
        self.transport
            .send::<()>(Method::DELETE, self.url(&["processes", &id])?, None)
            .await?;
        Ok(())
    }
}

#[derive(Serialize)]
struct StartBuild<'a> {
    workspace: &'a str,
    project: &'a str,
    #[serde(flatten)]
    options: &'a BuildOptions,
}

/// Builder service reached over HTTP.
///
/// `POST builds` starts a build, `GET builds/{id}` reports it and
/// `POST builds/{id}/cancel` cancels it.
#[derive(Clone)]
pub struct HttpBuilderService {
    transport: JsonTransport,
    base: Url,
}

impl fmt::Debug for HttpBuilderService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpBuilderService")
            .field("base", &self.base.as_str())
            .finish()
    }
}

impl HttpBuilderService {
    pub fn new(base: &str) -> anyhow::Result<Self> {
        Self::with_timeout(base, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            transport: JsonTransport {
                client: build_client(timeout)?,
            },
            base: parse_base(base)?,
        })
    }
}

#[async_trait]
impl BuilderService for HttpBuilderService {
    async fn start_build(
        &self,
        workspace: &str,
        project: &str,
        options: &BuildOptions,
    ) -> anyhow::Result<BuildHandle> {
        let body = StartBuild {
            workspace,
            project,
            options,
        };
        self.transport
            .post_json(endpoint(&self.base, &["builds"])?, &body)
            .await
    }

    async fn status(&self, build_id: &str) -> anyhow::Result<BuildHandle> {
        self.transport
            .get_json(endpoint(&self.base, &["builds", build_id])?)
            .await
    }

    async fn cancel_build(&self, build_id: &str) -> anyhow::Result<()> {
        self.transport
            .send::<()>(
                Method::POST,
                endpoint(&self.base, &["builds", build_id, "cancel"])?,
                None,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_encodes_runner_names() {
        let base = parse_base("http://runner-1:8080/api/").unwrap();
        let url = endpoint(&base, &["runners", "java/web", "state"]).unwrap();
        assert_eq!(url.as_str(), "http://runner-1:8080/api/runners/java%2Fweb/state");
    }

    #[test]
    fn test_endpoint_without_trailing_slash() {
        let base = parse_base("http://runner-1:8080").unwrap();
        let url = endpoint(&base, &["ping"]).unwrap();
        assert_eq!(url.as_str(), "http://runner-1:8080/ping");
    }

    #[test]
    fn test_invalid_locations_are_rejected() {
        assert!(parse_base("not a url").is_err());
        let base = parse_base("mailto:ops@example.com").unwrap();
        assert!(endpoint(&base, &["ping"]).is_err());
    }

    #[test]
    fn test_start_build_body_flattens_options() {
        let options = BuildOptions {
            builder: "maven".into(),
            targets: vec!["package".into()],
            ..Default::default()
        };
        let body = serde_json::to_value(StartBuild {
            workspace: "ws1",
            project: "/app",
            options: &options,
        })
        .unwrap();
        assert_eq!(body["workspace"], "ws1");
        assert_eq!(body["builder"], "maven");
        assert_eq!(body["targets"][0], "package");
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_to_connect() {
        let client = HttpRunnerServerClient::with_timeout(Duration::from_millis(200)).unwrap();
        // Port 9 (discard) on localhost is closed in test environments.
        assert!(client.connect("http://127.0.0.1:9").await.is_err());
    }

    #[test]
    fn test_client_debug_hides_internals() {
        let client = HttpRunnerServerClient::with_timeout(Duration::from_secs(5)).unwrap();
        let debug = format!("{client:?}");
        assert!(debug.contains("HttpRunnerServerClient"));
        assert!(debug.contains("5s"));
    }
}

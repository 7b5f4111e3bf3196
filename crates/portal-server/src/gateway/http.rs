//! HTTP login gateway.
//!
//! One request per connection: read the head, route on the request line,
//! write a single response and close. Credentials arrive in the query string
//! of a `GET`; a successful login allows the client in the authorization
//! table and releases it in the firewall before the response is written.

use super::client_ip;
use super::limit::TaskLimiter;
use crate::auth::LoginRateLimiter;
use crate::firewall::Firewall;
use portal_core::http::{self, Credentials, HttpResponse, Status, HEADER_TERMINATOR};
use portal_core::{
    AuthorizationTable, CredentialStore, HttpRequest, PortalError, PortalResult, Templates,
};
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Login form.
pub const FRONT_PAGE: &str = "front.html";
/// Shown after a successful login; receives `username`.
pub const SUCCESS_PAGE: &str = "success.html";
/// Shown after a rejected login.
pub const ERROR_PAGE: &str = "error.html";
/// Body of every 404.
pub const NOT_FOUND_PAGE: &str = "not_found.html";

const LOGOUT_PATH: &str = "/logout";

/// Largest request head accepted.
const MAX_HEAD: usize = 8 * 1024;

/// Served when even the not-found template is unavailable.
const FALLBACK_NOT_FOUND: &str =
    "<!DOCTYPE html><html><head><title>404 Not Found</title></head>\
     <body><h1>404 Not Found</h1></body></html>";

/// Collaborators and state shared by every connection.
pub struct HttpGateway {
    table: Arc<AuthorizationTable>,
    credentials: Arc<dyn CredentialStore>,
    firewall: Arc<dyn Firewall>,
    templates: Templates,
    /// Directory static files are served from.
    web_root: PathBuf,
    login_limiter: LoginRateLimiter,
    read_timeout: Duration,
}

impl HttpGateway {
    pub fn new(
        table: Arc<AuthorizationTable>,
        credentials: Arc<dyn CredentialStore>,
        firewall: Arc<dyn Firewall>,
        web_root: PathBuf,
        login_limiter: LoginRateLimiter,
        read_timeout: Duration,
    ) -> Self {
        Self {
            table,
            credentials,
            firewall,
            templates: Templates::new(web_root.clone()),
            web_root,
            login_limiter,
            read_timeout,
        }
    }

    pub fn login_limiter(&self) -> &LoginRateLimiter {
        &self.login_limiter
    }

    /// Serve one connection. Malformed or timed-out requests are closed
    /// without a response.
    pub async fn handle_connection<S>(&self, mut stream: S, client: IpAddr) -> PortalResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let head = read_head(&mut stream, self.read_timeout).await?;
        let request = HttpRequest::parse(&head)?;
        debug!(client = %client, method = %request.method, path = %request.path, "HTTP request");

        let response = self.respond(&request, client).await;
        stream.write_all(&response.to_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Route a parsed request.
    pub async fn respond(&self, request: &HttpRequest, client: IpAddr) -> HttpResponse {
        if request.method == "GET" {
            if let Some(credentials) = request.credentials() {
                return self.login(credentials, client).await;
            }
        }

        if request.is_root() {
            return self.page(FRONT_PAGE, Vec::new()).await;
        }

        if request.path == LOGOUT_PATH {
            info!(client = %client, "client logged out");
            self.table.block(client);
            self.firewall.block_client(client);
            return self.page(FRONT_PAGE, Vec::new()).await;
        }

        self.static_file(&request.path).await
    }

    async fn login(&self, credentials: Credentials, client: IpAddr) -> HttpResponse {
        if !self.login_limiter.check_and_record(client) {
            warn!(client = %client, username = %credentials.username, "too many login attempts");
            return self.page(ERROR_PAGE, Vec::new()).await;
        }

        if !self.check_credentials(&credentials).await {
            info!(client = %client, username = %credentials.username, "login failed");
            return self.page(ERROR_PAGE, Vec::new()).await;
        }

        info!(client = %client, username = %credentials.username, "login succeeded");
        self.table.allow(client);
        self.firewall.release_client(client);

        let username = escape_html(&credentials.username);
        self.page(SUCCESS_PAGE, vec![("username", username)]).await
    }

    /// Ask the credential store on the blocking pool; it reads from disk.
    async fn check_credentials(&self, credentials: &Credentials) -> bool {
        let store = self.credentials.clone();
        let Credentials { username, password } = credentials.clone();
        tokio::task::spawn_blocking(move || store.check(&username, &password))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "credential check task failed");
                false
            })
    }

    /// Load and fill a template on the blocking pool.
    async fn render(
        &self,
        name: &'static str,
        vars: Vec<(&'static str, String)>,
    ) -> PortalResult<String> {
        let templates = self.templates.clone();
        tokio::task::spawn_blocking(move || {
            let vars: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
            templates.render(name, &vars)
        })
        .await
        .map_err(|e| PortalError::Template(format!("render task failed: {e}")))?
    }

    /// Render a template with status 200, or the not-found page if the
    /// template cannot be loaded.
    async fn page(&self, name: &'static str, vars: Vec<(&'static str, String)>) -> HttpResponse {
        match self.render(name, vars).await {
            Ok(body) => HttpResponse::html(body),
            Err(e) => {
                warn!(template = name, error = %e, "cannot render page");
                self.not_found().await
            }
        }
    }

    async fn not_found(&self) -> HttpResponse {
        let body = self
            .render(NOT_FOUND_PAGE, Vec::new())
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "cannot render not-found page");
                FALLBACK_NOT_FOUND.to_string()
            });
        HttpResponse::not_found(body)
    }

    async fn static_file(&self, path: &str) -> HttpResponse {
        let Some(relative) = safe_relative(path) else {
            debug!(path, "rejected static path");
            return self.not_found().await;
        };
        let full = self.web_root.join(relative);

        match tokio::fs::metadata(&full).await {
            Ok(meta) if meta.is_file() => {}
            _ => return self.not_found().await,
        }

        match tokio::fs::read(&full).await {
            Ok(body) => HttpResponse {
                status: Status::Ok,
                content_type: http::content_type_for(path),
                body,
            },
            Err(e) => {
                warn!(path = %full.display(), error = %e, "cannot read static file");
                self.not_found().await
            }
        }
    }

    /// Accept loop. Returns once `shutdown` flips to `true` or its sender is
    /// dropped; the listener is closed on return.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        limiter: TaskLimiter,
        mut shutdown: watch::Receiver<bool>,
    ) -> PortalResult<()> {
        if *shutdown.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let Some(guard) = limiter.try_acquire() else {
                                debug!(peer = %peer, active = limiter.active(), "HTTP task limit reached, closing connection");
                                continue;
                            };
                            let gateway = self.clone();
                            tokio::spawn(async move {
                                let _guard = guard;
                                if let Err(e) = gateway.handle_connection(stream, client_ip(peer)).await {
                                    debug!(peer = %peer, error = %e, "HTTP connection closed");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "HTTP accept failed");
                        }
                    }
                }
            }
        }

        info!("HTTP listener stopped");
        Ok(())
    }
}

/// Read until the end of the request head or EOF, bounded by `limit`.
async fn read_head<S>(stream: &mut S, limit: Duration) -> PortalResult<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let read = async {
        let mut head = Vec::with_capacity(1024);
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            head.extend_from_slice(&chunk[..n]);
            if contains(&head, HEADER_TERMINATOR) {
                break;
            }
            if head.len() > MAX_HEAD {
                return Err(PortalError::Malformed("request head too large".into()));
            }
        }
        Ok(head)
    };

    let head = tokio::time::timeout(limit, read)
        .await
        .map_err(|_| PortalError::Timeout)??;
    if head.is_empty() {
        return Err(PortalError::Malformed("empty request".into()));
    }
    Ok(head)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Strip the leading `/` and refuse anything that could leave the web root.
fn safe_relative(path: &str) -> Option<&Path> {
    let relative = Path::new(path.trim_start_matches('/'));
    if relative.as_os_str().is_empty() {
        return None;
    }
    relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        .then_some(relative)
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::testing::{FirewallCall, RecordingFirewall};
    use portal_core::{ClientState, JsonUserStore};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        table: Arc<AuthorizationTable>,
        firewall: Arc<RecordingFirewall>,
        gateway: HttpGateway,
    }

    fn fixture_with_limit(login_attempts: u32) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join(FRONT_PAGE), "<form>login</form>").unwrap();
        std::fs::write(root.join(SUCCESS_PAGE), "<p>Welcome {{username}}</p>").unwrap();
        std::fs::write(root.join(ERROR_PAGE), "<p>Login failed</p>").unwrap();
        std::fs::write(root.join(NOT_FOUND_PAGE), "<p>Nothing here</p>").unwrap();
        std::fs::write(root.join("style.css"), "body { color: red; }").unwrap();
        std::fs::create_dir(root.join("assets")).unwrap();
        std::fs::write(
            root.join("users.json"),
            r#"{"usuarios": [{"username": "alice", "password": "correct"}]}"#,
        )
        .unwrap();

        let table = Arc::new(AuthorizationTable::new());
        let firewall = Arc::new(RecordingFirewall::default());
        let gateway = HttpGateway::new(
            table.clone(),
            Arc::new(JsonUserStore::new(root.join("users.json"))),
            firewall.clone(),
            root.to_path_buf(),
            LoginRateLimiter::new(login_attempts, Duration::from_secs(60)),
            Duration::from_millis(200),
        );
        Fixture {
            _dir: dir,
            table,
            firewall,
            gateway,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_limit(10)
    }

    fn client() -> IpAddr {
        "10.0.0.5".parse().unwrap()
    }

    async fn get(gateway: &HttpGateway, target: &str) -> HttpResponse {
        let raw = format!("GET {target} HTTP/1.1\r\nHost: portal\r\n\r\n");
        let request = HttpRequest::parse(raw.as_bytes()).unwrap();
        gateway.respond(&request, client()).await
    }

    #[tokio::test]
    async fn test_successful_login_allows_client() {
        let f = fixture();
        f.table.observe(client());

        let resp = get(&f.gateway, "/?username=alice&password=correct").await;
        assert_eq!(resp.status, Status::Ok);
        assert!(resp.body_text().contains("Welcome alice"));
        assert!(f.table.is_allowed(&client()));
        assert_eq!(f.firewall.calls(), vec![FirewallCall::Release(client())]);
    }

    #[tokio::test]
    async fn test_failed_login_leaves_state() {
        let f = fixture();
        f.table.observe(client());

        let resp = get(&f.gateway, "/?user=alice&pass=wrong").await;
        assert_eq!(resp.status, Status::Ok);
        assert_eq!(resp.body_text(), "<p>Login failed</p>");
        assert_eq!(f.table.state(&client()), Some(ClientState::Blocked));
        assert!(f.firewall.calls().is_empty());
    }

    #[tokio::test]
    async fn test_login_rate_limit() {
        let f = fixture_with_limit(1);
        let resp = get(&f.gateway, "/?user=alice&pass=wrong").await;
        assert_eq!(resp.body_text(), "<p>Login failed</p>");

        // Correct password, but the attempt budget is spent.
        let resp = get(&f.gateway, "/?user=alice&pass=correct").await;
        assert_eq!(resp.body_text(), "<p>Login failed</p>");
        assert!(!f.table.is_allowed(&client()));
    }

    #[tokio::test]
    async fn test_username_is_escaped() {
        let f = fixture();
        std::fs::write(
            f.gateway.web_root.join("users.json"),
            r#"{"usuarios": [{"username": "<b>", "password": "x"}]}"#,
        )
        .unwrap();
        let resp = get(&f.gateway, "/?user=%3Cb%3E&pass=x").await;
        assert_eq!(resp.body_text(), "<p>Welcome &lt;b&gt;</p>");
    }

    #[tokio::test]
    async fn test_root_renders_login_form() {
        let f = fixture();
        let resp = get(&f.gateway, "/").await;
        assert_eq!(resp.status, Status::Ok);
        assert_eq!(resp.body_text(), "<form>login</form>");
    }

    #[tokio::test]
    async fn test_credentials_need_get() {
        let f = fixture();
        let request =
            HttpRequest::parse(b"POST /?username=alice&password=correct HTTP/1.1\r\n\r\n").unwrap();
        let resp = f.gateway.respond(&request, client()).await;
        assert_eq!(resp.body_text(), "<form>login</form>");
        assert!(!f.table.is_allowed(&client()));
    }

    #[tokio::test]
    async fn test_logout_blocks_client() {
        let f = fixture();
        f.table.allow(client());

        let resp = get(&f.gateway, "/logout").await;
        assert_eq!(resp.body_text(), "<form>login</form>");
        assert_eq!(f.table.state(&client()), Some(ClientState::Blocked));
        assert_eq!(f.firewall.calls(), vec![FirewallCall::Block(client())]);
    }

    #[tokio::test]
    async fn test_static_file() {
        let f = fixture();
        let resp = get(&f.gateway, "/style.css").await;
        assert_eq!(resp.status, Status::Ok);
        assert_eq!(resp.content_type, "text/css");
        assert_eq!(resp.body, b"body { color: red; }");
    }

    #[tokio::test]
    async fn test_missing_file_is_404() {
        let f = fixture();
        let resp = get(&f.gateway, "/nonexistent.png").await;
        assert_eq!(resp.status, Status::NotFound);
        assert_eq!(resp.body_text(), "<p>Nothing here</p>");
    }

    #[tokio::test]
    async fn test_directory_and_traversal_are_404() {
        let f = fixture();
        assert_eq!(get(&f.gateway, "/assets").await.status, Status::NotFound);
        assert_eq!(
            get(&f.gateway, "/../etc/passwd").await.status,
            Status::NotFound
        );
        assert_eq!(
            get(&f.gateway, "/%2e%2e/etc/passwd").await.status,
            Status::NotFound
        );
    }

    #[tokio::test]
    async fn test_missing_template_falls_back_to_404() {
        let f = fixture();
        std::fs::remove_file(f.gateway.web_root.join(FRONT_PAGE)).unwrap();
        std::fs::remove_file(f.gateway.web_root.join(NOT_FOUND_PAGE)).unwrap();

        let resp = get(&f.gateway, "/").await;
        assert_eq!(resp.status, Status::NotFound);
        assert_eq!(resp.body_text(), FALLBACK_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_connection_roundtrip() {
        let f = fixture();
        let (mut peer, server) = tokio::io::duplex(4096);

        peer.write_all(b"GET /?username=alice&password=correct HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        f.gateway.handle_connection(server, client()).await.unwrap();

        let mut raw = Vec::new();
        peer.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 20\r\n"));
        assert!(text.contains("Access-Control-Allow-Origin: *\r\n"));
        assert!(text.ends_with("<p>Welcome alice</p>"));
        assert!(f.table.is_allowed(&client()));
    }

    #[tokio::test]
    async fn test_malformed_request_gets_no_response() {
        let f = fixture();
        let (mut peer, server) = tokio::io::duplex(4096);
        peer.write_all(b"GET\r\n\r\n").await.unwrap();

        assert!(f.gateway.handle_connection(server, client()).await.is_err());
        let mut raw = Vec::new();
        peer.read_to_end(&mut raw).await.unwrap();
        assert!(raw.is_empty());
    }

    #[tokio::test]
    async fn test_idle_client_times_out() {
        let f = fixture();
        let (_peer, server) = tokio::io::duplex(4096);
        let result = f.gateway.handle_connection(server, client()).await;
        assert!(matches!(result, Err(PortalError::Timeout)));
    }

    /// Store that remembers which thread answered.
    struct ThreadRecordingStore {
        checked_on: std::sync::Mutex<Option<std::thread::ThreadId>>,
    }

    impl CredentialStore for ThreadRecordingStore {
        fn check(&self, _username: &str, _password: &str) -> bool {
            *self.checked_on.lock().unwrap() = Some(std::thread::current().id());
            true
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_credential_check_runs_off_the_runtime_thread() {
        let f = fixture();
        let store = Arc::new(ThreadRecordingStore {
            checked_on: std::sync::Mutex::new(None),
        });
        let gateway = HttpGateway::new(
            f.table.clone(),
            store.clone(),
            f.firewall.clone(),
            f.gateway.web_root.clone(),
            LoginRateLimiter::new(0, Duration::from_secs(60)),
            Duration::from_millis(200),
        );

        let request = HttpRequest::parse(b"GET /?user=anyone&pass=x HTTP/1.1\r\n\r\n").unwrap();
        let resp = gateway.respond(&request, client()).await;
        assert!(resp.body_text().contains("Welcome anyone"));

        let checked_on = store.checked_on.lock().unwrap().unwrap();
        assert_ne!(checked_on, std::thread::current().id());
    }

    #[tokio::test]
    async fn test_full_limiter_closes_connections() {
        let f = fixture();
        let gateway = Arc::new(f.gateway);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let limiter = TaskLimiter::new(1);
        let held = limiter.try_acquire().unwrap();
        let handle = tokio::spawn(gateway.serve(listener, limiter.clone(), shutdown_rx));

        // Shed: closed without a single byte.
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut raw = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut raw))
            .await
            .unwrap()
            .unwrap();
        assert!(raw.is_empty());

        drop(held);
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut raw = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut raw))
            .await
            .unwrap()
            .unwrap();
        assert!(String::from_utf8(raw).unwrap().ends_with("<form>login</form>"));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}

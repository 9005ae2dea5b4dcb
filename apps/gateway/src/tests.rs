use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::header::{COOKIE, HOST, LOCATION, SEC_WEBSOCKET_KEY, UPGRADE};
use axum::http::{Request, StatusCode, header};
use futures::FutureExt;
use futures::future::BoxFuture;
use http_body_util::BodyExt;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tower::ServiceExt;
use workbench_client::{
    GatewayMessage, LaunchedWorker, WorkbenchOptions, WorkerError, WorkerLauncher, WorkerMessage,
    WorkerSupervisor,
};

use crate::auth::{SESSION_COOKIE_NAME, session_token};
use crate::build_router_with_supervisor;
use crate::config::{AuthMode, Config};
use crate::settings::Settings;

const PASSWORD: &str = "hunter2";

fn test_config(root: &std::path::Path) -> Config {
    Config {
        bind_addr: "127.0.0.1:0".parse().expect("addr"),
        log_filter: "info".to_string(),
        static_dir: root.join("static"),
        webview_dir: root.join("webview"),
        worker_command: PathBuf::from("unused-worker"),
        worker_args: Vec::new(),
        session_sock_dir: root.join("socks"),
        settings_path: root.join("settings.json"),
        auth_mode: AuthMode::Password,
        password: Some(PASSWORD.to_string()),
        handshake_timeout: Duration::from_secs(5),
        commit: "development".to_string(),
        start_path_arg: None,
    }
}

fn app(config: Config, launcher: Arc<dyn WorkerLauncher>) -> Router {
    let supervisor = Arc::new(WorkerSupervisor::new(launcher, config.handshake_timeout));
    build_router_with_supervisor(config, supervisor)
}

fn session_cookie() -> String {
    format!("{SESSION_COOKIE_NAME}={}", session_token(PASSWORD))
}

fn encode_path(path: &str) -> String {
    path.replace('/', "%2F")
}

/// Launcher whose worker never starts.
struct FailingLauncher;

impl WorkerLauncher for FailingLauncher {
    fn launch(&self) -> BoxFuture<'static, Result<LaunchedWorker, WorkerError>> {
        async {
            Err(WorkerError::LaunchFailed {
                detail: "no worker binary".to_string(),
            })
        }
        .boxed()
    }
}

/// Launcher backed by an in-memory worker that answers every init with
/// options reflecting the request back.
struct EchoLauncher;

impl WorkerLauncher for EchoLauncher {
    fn launch(&self) -> BoxFuture<'static, Result<LaunchedWorker, WorkerError>> {
        async {
            let (stdin_gateway, stdin_worker) = tokio::io::duplex(64 * 1024);
            let (stdout_worker, stdout_gateway) = tokio::io::duplex(64 * 1024);
            tokio::spawn(echo_worker(stdin_worker, stdout_worker));
            Ok(LaunchedWorker {
                stdin: Box::new(stdin_gateway),
                stdout: Box::new(stdout_gateway),
                child: None,
                session_sock: None,
            })
        }
        .boxed()
    }
}

async fn echo_worker(input: DuplexStream, mut output: DuplexStream) {
    let mut ready = serde_json::to_vec(&WorkerMessage::Ready).expect("encode ready");
    ready.push(b'\n');
    if output.write_all(&ready).await.is_err() {
        return;
    }

    let mut lines = BufReader::new(input).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let GatewayMessage::Init { id, options } =
            serde_json::from_str(&line).expect("init message")
        else {
            continue;
        };
        let reply = WorkerMessage::Options {
            id,
            options: WorkbenchOptions {
                remote_user_data_uri: json!("vscode-remote://user-data"),
                product_configuration: json!({"nameShort": "Workbench"}),
                workbench_web_configuration: json!({
                    "remoteAuthority": options.remote_authority,
                    "startPath": options.start_path,
                }),
                nls_configuration: json!({"locale": "en"}),
            },
        };
        let mut encoded = serde_json::to_vec(&reply).expect("encode options");
        encoded.push(b'\n');
        if output.write_all(&encoded).await.is_err() {
            return;
        }
    }
}

fn get(uri: &str, authenticated: bool) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if authenticated {
        builder = builder.header(COOKIE, session_cookie());
    }
    builder.body(Body::empty()).expect("request")
}

#[tokio::test]
async fn healthz_needs_no_authentication() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = app(test_config(dir.path()), Arc::new(FailingLauncher));

    let response = app.oneshot(get("/healthz", false)).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn resource_requires_authentication() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = app(test_config(dir.path()), Arc::new(FailingLauncher));

    let response = app
        .oneshot(get("/resource?path=%2Ftmp%2Fx", false))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn resource_serves_file_bytes_with_a_content_type() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("notes.txt");
    tokio::fs::write(&file, "hello resource")
        .await
        .expect("fixture");

    let app = app(test_config(dir.path()), Arc::new(FailingLauncher));
    let uri = format!(
        "/vscode-remote-resource?path={}",
        encode_path(&file.display().to_string())
    );
    let response = app.oneshot(get(&uri, true)).await.expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .expect("content type")
        .to_string();
    assert!(content_type.starts_with("text/plain"), "{content_type}");

    let body = response.into_body().collect().await.expect("body").to_bytes();
    assert_eq!(&body[..], b"hello resource");
}

#[tokio::test]
async fn missing_resource_is_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = app(test_config(dir.path()), Arc::new(FailingLauncher));

    let uri = format!(
        "/resource?path={}",
        encode_path(&dir.path().join("absent.txt").display().to_string())
    );
    let response = app.oneshot(get(&uri, true)).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn resource_without_a_path_parameter_is_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = app(test_config(dir.path()), Arc::new(FailingLauncher));

    let response = app.oneshot(get("/resource", true)).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn root_redirects_unauthenticated_visitors_to_login() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = app(test_config(dir.path()), Arc::new(FailingLauncher));

    let response = app.oneshot(get("/", false)).await.expect("response");
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .expect("location");
    assert_eq!(location, "/login?to=/");
}

#[tokio::test]
async fn webview_rejects_parent_traversal() {
    let dir = tempfile::tempdir().expect("tempdir");
    tokio::fs::create_dir_all(dir.path().join("webview"))
        .await
        .expect("webview dir");
    tokio::fs::write(dir.path().join("secret.txt"), "secret")
        .await
        .expect("fixture");

    let app = app(test_config(dir.path()), Arc::new(FailingLauncher));
    let response = app
        .oneshot(get("/webview/../secret.txt", true))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webview_serves_the_preload_bundle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let webview = dir.path().join("webview");
    tokio::fs::create_dir_all(&webview).await.expect("webview dir");
    tokio::fs::write(webview.join("main.js"), "console.log('preload')")
        .await
        .expect("fixture");

    let app = app(test_config(dir.path()), Arc::new(FailingLauncher));
    let response = app
        .oneshot(get("/webview/main.js", true))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.expect("body").to_bytes();
    assert_eq!(&body[..], b"console.log('preload')");
}

#[tokio::test]
async fn webview_resource_scheme_maps_to_absolute_paths() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("asset.css");
    tokio::fs::write(&file, "body {}").await.expect("fixture");

    let app = app(test_config(dir.path()), Arc::new(FailingLauncher));
    let uri = format!("/webview/vscode-resource/file{}", file.display());
    let response = app.oneshot(get(&uri, true)).await.expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.expect("body").to_bytes();
    assert_eq!(&body[..], b"body {}");
}

#[tokio::test]
async fn root_page_renders_worker_options_and_persists_the_visit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    tokio::fs::create_dir_all(&config.static_dir)
        .await
        .expect("static dir");
    let template = concat!(
        r#"<script>const userData = "{{REMOTE_USER_DATA_URI}}";"#,
        r#"const product = "{{PRODUCT_CONFIGURATION}}";"#,
        r#"const web = "{{WORKBENCH_WEB_CONFIGURATION}}";"#,
        r#"const nls = "{{NLS_CONFIGURATION}}";</script>"#,
    );
    tokio::fs::write(config.static_dir.join("workbench.html"), template)
        .await
        .expect("template");

    let folder = dir.path().join("project");
    tokio::fs::create_dir_all(&folder).await.expect("folder");
    let settings_path = config.settings_path.clone();

    let app = app(config, Arc::new(EchoLauncher));
    let uri = format!("/?folder={}", encode_path(&folder.display().to_string()));
    let request = Request::builder()
        .uri(uri)
        .header(COOKIE, session_cookie())
        .header(HOST, "workbench.local:8080")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.expect("body").to_bytes();
    let html = String::from_utf8(body.to_vec()).expect("utf8");
    assert!(!html.contains("{{"), "unsubstituted marker in {html}");
    assert!(html.contains("workbench.local:8080"));
    assert!(html.contains(&folder.display().to_string()));
    assert!(html.contains(r#""gatewayVersion""#));

    let raw = tokio::fs::read_to_string(&settings_path)
        .await
        .expect("settings written");
    let settings: Settings = serde_json::from_str(&raw).expect("settings parse");
    let last_visited = settings.last_visited.expect("last visited recorded");
    assert_eq!(last_visited.url, folder.display().to_string());
    assert!(!last_visited.workspace);
}

#[tokio::test]
async fn root_page_reports_a_missing_worker_as_bad_gateway() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = app(test_config(dir.path()), Arc::new(FailingLauncher));

    let response = app.oneshot(get("/", true)).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = response.into_body().collect().await.expect("body").to_bytes();
    let payload: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(payload["error"], "workbench_unavailable");
    assert!(
        payload["message"]
            .as_str()
            .expect("message")
            .contains("It might not have finished compiling."),
    );
}

#[tokio::test]
async fn session_upgrade_requires_websocket_headers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = app(test_config(dir.path()), Arc::new(EchoLauncher));

    let response = app.oneshot(get("/session", true)).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn session_upgrade_without_a_worker_is_unavailable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = app(test_config(dir.path()), Arc::new(FailingLauncher));

    let request = Request::builder()
        .uri("/session")
        .header(COOKIE, session_cookie())
        .header(UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header(SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn unknown_routes_are_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = app(test_config(dir.path()), Arc::new(FailingLauncher));

    let response = app.oneshot(get("/nope", true)).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

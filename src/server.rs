// HTTP 服务：路由、跨域与启动

use crate::commands::jobs::ProcessRegistry;
use crate::commands::{download, jobs, models, process, system};
use crate::config::{AppConfig, DataPaths};
use crate::database::JobStore;
use crate::error::AppResult;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::info;

/// 预检请求的缓存时间（秒）
const PREFLIGHT_MAX_AGE: &str = "600";

const ALLOWED_METHODS: &str = "DELETE, GET, HEAD, OPTIONS, PATCH, POST, PUT";

/// 请求处理共享状态
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub paths: Arc<DataPaths>,
    pub jobs: Arc<JobStore>,
    pub registry: Arc<ProcessRegistry>,
    /// 分轨并发上限
    pub limiter: Arc<Semaphore>,
}

impl AppState {
    pub fn new(config: AppConfig, paths: DataPaths, jobs: JobStore) -> Self {
        let permits = config.separation.max_concurrent_jobs.max(1);
        Self {
            config: Arc::new(config),
            paths: Arc::new(paths),
            jobs: Arc::new(jobs),
            registry: Arc::new(ProcessRegistry::default()),
            limiter: Arc::new(Semaphore::new(permits)),
        }
    }
}

/// 构建路由
pub fn build_router(state: AppState) -> Router {
    let cors_origins = Arc::new(state.config.server.cors_allow_origins.clone());
    let body_limit = state.config.server.max_upload_bytes;

    Router::new()
        .route("/ping", get(system::ping))
        .route("/process-audio/", post(process::process_audio))
        .route("/process-audio", post(process::process_audio))
        .route("/download/*full_path", get(download::download_file))
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/:job_id", get(jobs::get_job))
        .route("/jobs/:job_id/cancel", post(jobs::cancel_job))
        .route("/models", get(models::list_models))
        .route("/system/dependencies", get(system::dependencies))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(cors_origins, cors))
        .with_state(state)
}

/// 根据配置决定 Access-Control-Allow-Origin
fn allowed_origin(origins: &[String], origin: &HeaderValue) -> Option<HeaderValue> {
    if origins.iter().any(|o| o == "*") {
        return Some(HeaderValue::from_static("*"));
    }
    let origin_str = origin.to_str().ok()?;
    origins
        .iter()
        .any(|o| o == origin_str)
        .then(|| origin.clone())
}

/// 跨域中间件，只处理带 Origin 的请求
async fn cors(State(origins): State<Arc<Vec<String>>>, request: Request, next: Next) -> Response {
    let origin = match request.headers().get(header::ORIGIN) {
        Some(origin) => origin.clone(),
        None => return next.run(request).await,
    };
    let allow_origin = allowed_origin(&origins, &origin);

    let is_preflight = request.method() == Method::OPTIONS
        && request
            .headers()
            .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD);

    if is_preflight {
        let allow_origin = match allow_origin {
            Some(value) => value,
            None => return (StatusCode::BAD_REQUEST, "Disallowed CORS origin").into_response(),
        };

        let mut response = (StatusCode::OK, "OK").into_response();
        let headers = response.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOWED_METHODS),
        );
        if let Some(requested) = request.headers().get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }
        headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static(PREFLIGHT_MAX_AGE));
        headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        return response;
    }

    let mut response = next.run(request).await;
    if let Some(value) = allow_origin {
        let headers = response.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    }
    response
}

/// 启动 HTTP 服务，收到 Ctrl-C / SIGTERM 后优雅退出
pub async fn run_server(state: AppState, host: &str, port: u16) -> AppResult<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "HTTP 服务已启动");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP 服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("监听 Ctrl-C 失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("监听 SIGTERM 失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("收到退出信号，正在关闭服务...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{JobRecord, JobStatus};
    use crate::utils::now_string;
    use serde_json::Value;
    use std::io::Read;
    use std::time::Duration;

    struct TestServer {
        base_url: String,
        state: AppState,
        _dir: tempfile::TempDir,
    }

    struct TestResponse {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    impl TestResponse {
        fn json(&self) -> Value {
            serde_json::from_slice(&self.body).unwrap()
        }

        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }
    }

    async fn start_server() -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.separation.separator_path = Some("/nonexistent/stemsplit-test-separator".to_string());
        config.separation.max_concurrent_jobs = 1;
        let paths = DataPaths::new(dir.path(), &config);
        paths.ensure_dirs().unwrap();

        let state = AppState::new(config, paths, JobStore::open_in_memory().unwrap());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestServer {
            base_url: format!("http://{}", addr),
            state,
            _dir: dir,
        }
    }

    fn into_test_response(result: Result<ureq::Response, ureq::Error>) -> TestResponse {
        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(e) => panic!("请求失败: {}", e),
        };
        let status = response.status();
        let headers = response
            .headers_names()
            .into_iter()
            .filter_map(|name| {
                let value = response.header(&name)?.to_string();
                Some((name, value))
            })
            .collect();
        let mut body = Vec::new();
        response.into_reader().read_to_end(&mut body).unwrap();
        TestResponse { status, headers, body }
    }

    async fn send<F>(f: F) -> TestResponse
    where
        F: FnOnce() -> Result<ureq::Response, ureq::Error> + Send + 'static,
    {
        tokio::task::spawn_blocking(move || into_test_response(f()))
            .await
            .unwrap()
    }

    async fn http_get(url: String) -> TestResponse {
        send(move || ureq::get(&url).call()).await
    }

    fn multipart_body(boundary: &str, parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, file_name, data) in parts {
            body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
            match file_name {
                Some(file_name) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: audio/mpeg\r\n\r\n",
                            name, file_name
                        )
                        .as_bytes(),
                    );
                }
                None => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                    );
                }
            }
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
        body
    }

    async fn upload(url: String, body: Vec<u8>) -> TestResponse {
        send(move || {
            ureq::post(&url)
                .set("Content-Type", "multipart/form-data; boundary=stemsplit-boundary")
                .send_bytes(&body)
        })
        .await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ping() {
        let server = start_server().await;
        let response = http_get(format!("{}/ping", server.base_url)).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.json()["status"], "alive");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_download_rejects_paths_outside_output() {
        let server = start_server().await;
        std::fs::write(server.state.paths.data_dir.join("secret.txt"), "secret").unwrap();

        for path in ["secret.txt", "output/..%2Fsecret.txt", "output%2F..%2Fsecret.txt"] {
            let response = http_get(format!("{}/download/{}", server.base_url, path)).await;
            assert_eq!(response.status, 400, "path: {}", path);
            assert_eq!(response.json()["detail"], "Invalid file path");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_download_missing_file() {
        let server = start_server().await;
        let response = http_get(format!("{}/download/output/none/vocals.wav", server.base_url)).await;
        assert_eq!(response.status, 404);
        assert_eq!(response.json()["detail"], "File not found");

        // 目录不是文件
        std::fs::create_dir_all(server.state.paths.output_dir.join("song")).unwrap();
        let response = http_get(format!("{}/download/output/song", server.base_url)).await;
        assert_eq!(response.status, 404);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_download_existing_stem() {
        let server = start_server().await;
        let stem_dir = server.state.paths.output_dir.join("song");
        std::fs::create_dir_all(&stem_dir).unwrap();
        std::fs::write(stem_dir.join("vocals.wav"), b"RIFF-test").unwrap();

        let response = http_get(format!("{}/download/output/song/vocals.wav", server.base_url)).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"RIFF-test");
        assert_eq!(response.header("content-type"), Some("audio/x-wav"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_process_audio_accepts_upload_and_tracks_job() {
        let server = start_server().await;
        let body = multipart_body(
            "stemsplit-boundary",
            &[("audio_file", Some("song.mp3"), b"not really audio")],
        );

        let response = upload(format!("{}/process-audio/", server.base_url), body).await;
        assert_eq!(response.status, 200);
        let json = response.json();
        assert_eq!(json["message"], "Uploaded. Separation is in progress.");
        assert_eq!(
            json["download_paths"],
            serde_json::json!(["output/song/vocals.wav", "output/song/accompaniment.wav"])
        );

        let saved = server.state.paths.upload_dir.join("song.mp3");
        assert_eq!(std::fs::read(&saved).unwrap(), b"not really audio");

        // 分轨程序不存在，任务最终失败
        let job_id = json["job_id"].as_str().unwrap().to_string();
        let mut status = String::new();
        for _ in 0..100 {
            let job = http_get(format!("{}/jobs/{}", server.base_url, job_id)).await;
            assert_eq!(job.status, 200);
            status = job.json()["status"].as_str().unwrap().to_string();
            if status == "failed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(status, "failed");

        let list = http_get(format!("{}/jobs", server.base_url)).await;
        assert_eq!(list.json().as_array().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_process_audio_task_field_and_sanitized_name() {
        let server = start_server().await;
        let body = multipart_body(
            "stemsplit-boundary",
            &[
                ("task", None, b"spleeter:4stems"),
                ("audio_file", Some("../../evil.wav"), b"data"),
            ],
        );

        let response = upload(format!("{}/process-audio", server.base_url), body).await;
        assert_eq!(response.status, 200);
        let paths = response.json()["download_paths"].as_array().unwrap().len();
        assert_eq!(paths, 4);
        assert!(server.state.paths.upload_dir.join("evil.wav").is_file());
        assert!(!server.state.paths.data_dir.join("evil.wav").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_process_audio_requires_file() {
        let server = start_server().await;
        let body = multipart_body("stemsplit-boundary", &[("other", None, b"x")]);
        let response = upload(format!("{}/process-audio/", server.base_url), body).await;
        assert_eq!(response.status, 422);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_process_audio_rejects_unknown_task() {
        let server = start_server().await;
        let body = multipart_body(
            "stemsplit-boundary",
            &[("task", None, b"spleeter:3stems"), ("audio_file", Some("a.mp3"), b"x")],
        );
        let response = upload(format!("{}/process-audio/", server.base_url), body).await;
        assert_eq!(response.status, 400);
        assert!(!server.state.paths.upload_dir.join("a.mp3").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_job() {
        let server = start_server().await;
        let response = http_get(format!("{}/jobs/does-not-exist", server.base_url)).await;
        assert_eq!(response.status, 404);

        let url = format!("{}/jobs/does-not-exist/cancel", server.base_url);
        let response = send(move || ureq::post(&url).call()).await;
        assert_eq!(response.status, 404);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_pending_job() {
        let server = start_server().await;
        let now = now_string();
        let job = JobRecord {
            id: "job-1".to_string(),
            filename: "song.mp3".to_string(),
            input_path: "/tmp/song.mp3".to_string(),
            input_sha256: String::new(),
            task: "spleeter:2stems".to_string(),
            output_dir: "output/song".to_string(),
            status: JobStatus::Pending,
            progress: 0.0,
            error: None,
            duration: None,
            created_at: now.clone(),
            updated_at: now,
        };
        server.state.jobs.insert_job(&job).unwrap();
        let flag = server.state.registry.reset_cancel_flag("job-1");

        let url = format!("{}/jobs/job-1/cancel", server.base_url);
        let response = send(move || ureq::post(&url).call()).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.json()["status"], "cancelled");
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_models_listing() {
        let server = start_server().await;
        let response = http_get(format!("{}/models", server.base_url)).await;
        assert_eq!(response.status, 200);
        let models = response.json();
        let models = models.as_array().unwrap();
        assert_eq!(models.len(), 3);
        assert_eq!(models[0]["id"], "spleeter:2stems");
        assert_eq!(models[0]["status"]["downloaded"], false);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cors_headers() {
        let server = start_server().await;

        let url = format!("{}/ping", server.base_url);
        let response = send(move || ureq::get(&url).set("Origin", "http://example.com").call()).await;
        assert_eq!(response.header("access-control-allow-origin"), Some("*"));

        let url = format!("{}/process-audio/", server.base_url);
        let response = send(move || {
            ureq::request("OPTIONS", &url)
                .set("Origin", "http://example.com")
                .set("Access-Control-Request-Method", "POST")
                .set("Access-Control-Request-Headers", "content-type")
                .call()
        })
        .await;
        assert_eq!(response.status, 200);
        assert_eq!(response.header("access-control-allow-origin"), Some("*"));
        assert!(response
            .header("access-control-allow-methods")
            .unwrap()
            .contains("POST"));
        assert_eq!(response.header("access-control-allow-headers"), Some("content-type"));
    }

    #[test]
    fn test_allowed_origin_list() {
        let origins = vec!["http://a.example".to_string()];
        let a = HeaderValue::from_static("http://a.example");
        let b = HeaderValue::from_static("http://b.example");
        assert_eq!(allowed_origin(&origins, &a), Some(a.clone()));
        assert_eq!(allowed_origin(&origins, &b), None);
    }
}

//! Dropbox implementation of `RemoteStorage`.
//!
//! Uses the HTTP API v2: RPC endpoints on the api host take JSON bodies,
//! content endpoints on the content host take raw bytes with the arguments in
//! the `Dropbox-API-Arg` header.

use super::token::{needs_refresh, AccessToken, TokenResponse};
use super::{ensure_leading_slash, RemoteEntry, RemoteStorage};
use crate::catalog::ARCHIVE_SUFFIX;
use crate::utils::{Result, VolbackError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

const API_ARG_HEADER: &str = "Dropbox-API-Arg";
const OCTET_STREAM: &str = "application/octet-stream";

/// Base URLs of the three Dropbox hosts.
#[derive(Debug, Clone)]
pub struct DropboxEndpoints {
    pub api_url: String,
    pub content_url: String,
    pub token_url: String,
}

impl Default for DropboxEndpoints {
    fn default() -> Self {
        Self {
            api_url: "https://api.dropboxapi.com".to_string(),
            content_url: "https://content.dropboxapi.com".to_string(),
            token_url: "https://api.dropbox.com/oauth2/token".to_string(),
        }
    }
}

/// Long-lived app credentials used for the refresh-token grant.
#[derive(Debug, Clone)]
pub struct DropboxCredentials {
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Serialize)]
struct UploadArg<'a> {
    path: &'a str,
    mode: &'a str,
    autorename: bool,
    mute: bool,
    strict_conflict: bool,
}

#[derive(Debug, Serialize)]
struct Cursor<'a> {
    session_id: &'a str,
    offset: u64,
}

#[derive(Debug, Serialize)]
struct AppendArg<'a> {
    cursor: Cursor<'a>,
    close: bool,
}

#[derive(Debug, Serialize)]
struct CommitInfo<'a> {
    path: &'a str,
    mode: &'a str,
}

#[derive(Debug, Serialize)]
struct FinishArg<'a> {
    cursor: Cursor<'a>,
    commit: CommitInfo<'a>,
}

#[derive(Debug, Deserialize)]
struct ListFolderResponse {
    entries: Vec<ListFolderEntry>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListFolderEntry {
    #[serde(rename = ".tag")]
    tag: Option<String>,
    path_display: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteResponse {
    metadata: DeletedMetadata,
}

#[derive(Debug, Deserialize)]
struct DeletedMetadata {
    path_display: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionStartResponse {
    session_id: String,
}

/// Dropbox client with an in-place refreshed bearer token.
pub struct DropboxClient {
    http: reqwest::Client,
    credentials: DropboxCredentials,
    endpoints: DropboxEndpoints,
    token: Mutex<Option<AccessToken>>,
}

impl DropboxClient {
    pub fn new(credentials: DropboxCredentials) -> Self {
        Self::with_endpoints(credentials, DropboxEndpoints::default())
    }

    pub fn with_endpoints(credentials: DropboxCredentials, endpoints: DropboxEndpoints) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials,
            endpoints,
            token: Mutex::new(None),
        }
    }

    /// Current bearer token, refreshing it first when missing or expired.
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if needs_refresh(cached.as_ref(), Utc::now()) {
            let fresh = self.refresh_token().await?;
            debug!("Access token refreshed, expires at {}", fresh.expires_at);
            *cached = Some(fresh);
        }

        cached
            .as_ref()
            .map(|t| t.value.clone())
            .ok_or_else(|| VolbackError::Auth("no access token available".to_string()))
    }

    async fn refresh_token(&self) -> Result<AccessToken> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", self.credentials.refresh_token.as_str()),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
        ];

        let resp = self
            .http
            .post(&self.endpoints.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| VolbackError::Auth(format!("failed to execute token request: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(VolbackError::Auth(format!(
                "token refresh failed with status {}: {}",
                status.as_u16(),
                body
            )));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| VolbackError::Auth(format!("failed to decode token response: {}", e)))?;

        AccessToken::from_response(token, Utc::now())
    }

    async fn rpc<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let token = self.access_token().await?;
        let url = format!("{}/2/{}", self.endpoints.api_url, endpoint);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        check_status(resp).await
    }

    async fn content<A: Serialize>(
        &self,
        endpoint: &str,
        arg: Option<&A>,
        body: reqwest::Body,
    ) -> Result<reqwest::Response> {
        let token = self.access_token().await?;
        let url = format!("{}/2/{}", self.endpoints.content_url, endpoint);

        let mut request = self
            .http
            .post(&url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, OCTET_STREAM);
        if let Some(arg) = arg {
            request = request.header(API_ARG_HEADER, serde_json::to_string(arg)?);
        }

        let resp = request.body(body).send().await?;
        check_status(resp).await
    }
}

/// Map a non-success response to `VolbackError::Remote` with its body.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(VolbackError::Remote {
        status: status.as_u16(),
        body,
    })
}

fn archive_entries(entries: Vec<ListFolderEntry>) -> impl Iterator<Item = RemoteEntry> {
    entries
        .into_iter()
        // A folder can carry an archive-like name; deleting it would remove its contents
        .filter(|e| e.tag.as_deref() == Some("file"))
        .filter_map(|e| e.path_display)
        .filter(|p| p.ends_with(ARCHIVE_SUFFIX))
        .map(RemoteEntry::new)
}

#[async_trait]
impl RemoteStorage for DropboxClient {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let path = ensure_leading_slash(path);
        let body = serde_json::json!({ "path": path, "recursive": false });

        let resp = self.rpc("files/list_folder", &body).await?;
        let mut page: ListFolderResponse = resp.json().await?;
        let mut entries: Vec<RemoteEntry> = archive_entries(page.entries).collect();

        while page.has_more {
            let Some(cursor) = page.cursor.take() else {
                break;
            };
            let body = serde_json::json!({ "cursor": cursor });
            let resp = self.rpc("files/list_folder/continue", &body).await?;
            page = resp.json().await?;
            entries.extend(archive_entries(page.entries));
        }

        debug!("Listed {} archives under {}", entries.len(), path);
        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = ensure_leading_slash(path);
        let body = serde_json::json!({ "path": path });

        let deleted: DeleteResponse = self.rpc("files/delete_v2", &body).await?.json().await?;
        debug!(
            "Deleted file: {}",
            deleted.metadata.path_display.as_deref().unwrap_or(&path)
        );
        Ok(())
    }

    async fn upload_small(&self, local_file: &Path, remote_path: &str) -> Result<()> {
        let file = tokio::fs::File::open(local_file).await?;
        let arg = UploadArg {
            path: remote_path,
            mode: "add",
            autorename: true,
            mute: false,
            strict_conflict: false,
        };

        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        self.content("files/upload", Some(&arg), body).await?;
        info!("Uploaded {} to {}", local_file.display(), remote_path);
        Ok(())
    }

    async fn start_session(&self, first_chunk: Bytes) -> Result<String> {
        let resp = self
            .content::<()>("files/upload_session/start", None, first_chunk.into())
            .await?;
        let started: SessionStartResponse = resp.json().await?;
        Ok(started.session_id)
    }

    async fn append_session(&self, session_id: &str, offset: u64, chunk: Bytes) -> Result<()> {
        let arg = AppendArg {
            cursor: Cursor { session_id, offset },
            close: false,
        };
        self.content("files/upload_session/append_v2", Some(&arg), chunk.into())
            .await?;
        Ok(())
    }

    async fn finish_session(&self, session_id: &str, offset: u64, remote_path: &str) -> Result<()> {
        let arg = FinishArg {
            cursor: Cursor { session_id, offset },
            commit: CommitInfo {
                path: remote_path,
                mode: "add",
            },
        };
        let body = reqwest::Body::from(Vec::new());
        self.content("files/upload_session/finish", Some(&arg), body)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Form, Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Requests seen by the mock Dropbox server.
    #[derive(Default)]
    struct Seen {
        expires_in: i64,
        token_requests: usize,
        authorizations: Vec<String>,
        api_args: Vec<(String, Value)>,
        bodies: Vec<(String, Vec<u8>)>,
        deleted: Vec<String>,
    }

    type Shared = Arc<std::sync::Mutex<Seen>>;

    fn record(seen: &Shared, endpoint: &str, headers: &HeaderMap, body: &[u8]) {
        let mut s = seen.lock().unwrap();
        if let Some(auth) = headers.get("authorization") {
            s.authorizations.push(auth.to_str().unwrap().to_string());
        }
        if let Some(arg) = headers.get(API_ARG_HEADER) {
            let arg: Value = serde_json::from_str(arg.to_str().unwrap()).unwrap();
            s.api_args.push((endpoint.to_string(), arg));
        }
        s.bodies.push((endpoint.to_string(), body.to_vec()));
    }

    async fn token(
        State(seen): State<Shared>,
        Form(form): Form<HashMap<String, String>>,
    ) -> (StatusCode, Json<Value>) {
        let mut s = seen.lock().unwrap();
        s.token_requests += 1;
        if form.get("refresh_token").map(String::as_str) != Some("good-refresh") {
            let error = json!({"error": "invalid_grant"});
            return (StatusCode::BAD_REQUEST, Json(error));
        }
        assert_eq!(form["grant_type"], "refresh_token");
        let token = json!({
            "access_token": format!("token-{}", s.token_requests),
            "expires_in": s.expires_in,
            "token_type": "bearer"
        });
        (StatusCode::OK, Json(token))
    }

    async fn list_folder(
        State(seen): State<Shared>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        record(&seen, "list_folder", &headers, &[]);
        if body["path"] == "/missing" {
            let error = json!({"error_summary": "path/not_found/"});
            return (StatusCode::CONFLICT, Json(error));
        }
        let page = json!({
            "entries": [
                {".tag": "file", "path_display": "/b/app/20240101.000000.7z"},
                {".tag": "file", "path_display": "/b/app/readme.txt"},
                {".tag": "folder", "path_display": "/b/app/old"},
                {".tag": "folder", "path_display": "/b/app/20231231.000000.7z"}
            ],
            "has_more": true,
            "cursor": "page-2"
        });
        (StatusCode::OK, Json(page))
    }

    async fn list_continue(Json(body): Json<Value>) -> Json<Value> {
        assert_eq!(body["cursor"], "page-2");
        let page = json!({
            "entries": [{".tag": "file", "path_display": "/b/app/20240102.000000.7z"}],
            "has_more": false,
            "cursor": "done"
        });
        Json(page)
    }

    async fn delete_v2(State(seen): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
        let path = body["path"].as_str().unwrap().to_string();
        seen.lock().unwrap().deleted.push(path.clone());
        let deleted = json!({"metadata": {".tag": "file", "path_display": path}});
        Json(deleted)
    }

    async fn upload(State(seen): State<Shared>, headers: HeaderMap, body: Bytes) -> Json<Value> {
        record(&seen, "upload", &headers, &body);
        Json(json!({"path_display": "/b/app/x.7z"}))
    }

    async fn session_start(
        State(seen): State<Shared>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Json<Value> {
        record(&seen, "start", &headers, &body);
        Json(json!({"session_id": "sess-1"}))
    }

    async fn session_append(
        State(seen): State<Shared>,
        headers: HeaderMap,
        body: Bytes,
    ) -> StatusCode {
        record(&seen, "append", &headers, &body);
        StatusCode::OK
    }

    /// Rejects the commit as Dropbox does for an existing path.
    async fn session_finish(
        State(seen): State<Shared>,
        headers: HeaderMap,
        body: Bytes,
    ) -> (StatusCode, &'static str) {
        record(&seen, "finish", &headers, &body);
        (StatusCode::CONFLICT, "path/conflict/file/")
    }

    async fn spawn_mock(expires_in: i64) -> (DropboxEndpoints, Shared) {
        let state = Seen {
            expires_in,
            ..Default::default()
        };
        let seen: Shared = Arc::new(std::sync::Mutex::new(state));

        let app = Router::new()
            .route("/oauth2/token", post(token))
            .route("/2/files/list_folder", post(list_folder))
            .route("/2/files/list_folder/continue", post(list_continue))
            .route("/2/files/delete_v2", post(delete_v2))
            .route("/2/files/upload", post(upload))
            .route("/2/files/upload_session/start", post(session_start))
            .route("/2/files/upload_session/append_v2", post(session_append))
            .route("/2/files/upload_session/finish", post(session_finish))
            .with_state(seen.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let base = format!("http://{}", addr);
        let endpoints = DropboxEndpoints {
            api_url: base.clone(),
            content_url: base.clone(),
            token_url: format!("{}/oauth2/token", base),
        };
        (endpoints, seen)
    }

    fn credentials(refresh: &str) -> DropboxCredentials {
        DropboxCredentials {
            refresh_token: refresh.to_string(),
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn test_list_filters_archives_and_follows_pages() {
        let (endpoints, seen) = spawn_mock(14400).await;
        let client = DropboxClient::with_endpoints(credentials("good-refresh"), endpoints);

        let entries = client.list("b/app").await.unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["/b/app/20240101.000000.7z", "/b/app/20240102.000000.7z"]
        );

        let s = seen.lock().unwrap();
        assert_eq!(s.token_requests, 1);
        assert_eq!(s.authorizations, vec!["Bearer token-1"]);
    }

    #[tokio::test]
    async fn test_token_is_cached_until_expiry() {
        let (endpoints, seen) = spawn_mock(14400).await;
        let client = DropboxClient::with_endpoints(credentials("good-refresh"), endpoints);

        client.delete("/b/app/20240101.000000.7z").await.unwrap();
        client.delete("b/app/20240102.000000.7z").await.unwrap();

        let s = seen.lock().unwrap();
        assert_eq!(s.token_requests, 1);
        assert_eq!(
            s.deleted,
            vec!["/b/app/20240101.000000.7z", "/b/app/20240102.000000.7z"]
        );
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_before_each_call() {
        // Lifetime shorter than the expiry margin forces a refresh every time
        let (endpoints, seen) = spawn_mock(1).await;
        let client = DropboxClient::with_endpoints(credentials("good-refresh"), endpoints);

        client.list("/b/app").await.unwrap();
        client.delete("/b/app/20240101.000000.7z").await.unwrap();

        assert!(seen.lock().unwrap().token_requests >= 2);
    }

    #[tokio::test]
    async fn test_refresh_failure_is_auth_error() {
        let (endpoints, _seen) = spawn_mock(14400).await;
        let client = DropboxClient::with_endpoints(credentials("revoked"), endpoints);

        let err = client.list("/b/app").await.unwrap_err();
        match err {
            VolbackError::Auth(msg) => assert!(msg.contains("400"), "{}", msg),
            other => panic!("expected auth error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_success_maps_to_remote_error() {
        let (endpoints, _seen) = spawn_mock(14400).await;
        let client = DropboxClient::with_endpoints(credentials("good-refresh"), endpoints);

        match client.list("/missing").await.unwrap_err() {
            VolbackError::Remote { status, body } => {
                assert_eq!(status, 409);
                assert!(body.contains("path/not_found"));
            }
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upload_small_sends_autorename_arg_and_file_bytes() {
        let (endpoints, seen) = spawn_mock(14400).await;
        let client = DropboxClient::with_endpoints(credentials("good-refresh"), endpoints);

        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("app.7z");
        std::fs::write(&file, b"small archive").unwrap();

        client
            .upload_small(&file, "/b/app/20240101.000000.7z")
            .await
            .unwrap();

        let s = seen.lock().unwrap();
        let (_, arg) = s.api_args.iter().find(|(e, _)| e == "upload").unwrap();
        assert_eq!(arg["path"], "/b/app/20240101.000000.7z");
        assert_eq!(arg["mode"], "add");
        assert_eq!(arg["autorename"], true);
        assert_eq!(arg["strict_conflict"], false);
        let (_, body) = s.bodies.iter().find(|(e, _)| e == "upload").unwrap();
        assert_eq!(body.as_slice(), b"small archive");
    }

    #[tokio::test]
    async fn test_session_calls_carry_cursor_and_commit() {
        let (endpoints, seen) = spawn_mock(14400).await;
        let client = DropboxClient::with_endpoints(credentials("good-refresh"), endpoints);

        let first = Bytes::from_static(b"first");
        let id = client.start_session(first).await.unwrap();
        assert_eq!(id, "sess-1");
        client
            .append_session(&id, 5, Bytes::from_static(b"second"))
            .await
            .unwrap();

        let err = client
            .finish_session(&id, 11, "/b/app/x.7z")
            .await
            .unwrap_err();
        assert!(matches!(err, VolbackError::Remote { status: 409, .. }));

        let s = seen.lock().unwrap();
        let args: HashMap<&str, &Value> =
            s.api_args.iter().map(|(e, v)| (e.as_str(), v)).collect();
        assert!(!args.contains_key("start"));
        assert_eq!(args["append"]["cursor"]["session_id"], "sess-1");
        assert_eq!(args["append"]["cursor"]["offset"], 5);
        assert_eq!(args["append"]["close"], false);
        assert_eq!(args["finish"]["cursor"]["offset"], 11);
        assert_eq!(args["finish"]["commit"]["path"], "/b/app/x.7z");
        assert_eq!(args["finish"]["commit"]["mode"], "add");
        assert!(args["finish"]["commit"].get("autorename").is_none());

        let bodies: HashMap<&str, &Vec<u8>> =
            s.bodies.iter().map(|(e, b)| (e.as_str(), b)).collect();
        assert_eq!(bodies["start"].as_slice(), b"first");
        assert_eq!(bodies["append"].as_slice(), b"second");
        assert!(bodies["finish"].is_empty());
    }
}

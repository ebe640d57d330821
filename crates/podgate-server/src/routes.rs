use axum::{
    Router,
    extract::{Json, Multipart, Path, State},
    routing::{get, post},
};

use podgate_controller::batch::Operation;
use podgate_controller::device::DeviceRecord;
use podgate_controller::ingest::parse_csv_bytes;
use podgate_controller::registry::DeviceRegistry;

use serde::Deserialize;

use serde_json::{Value, json};

use tower_http::trace::TraceLayer;

use tracing::info;

use crate::responses::error::ErrorResponse;
use crate::responses::success::{
    CreateResponse, DeleteResponse, DeviceCreated, DeviceDeleted, DeviceFound, FetchResponse,
    PodOpening, Source,
};
use crate::state::AppState;

// Name of the multipart field carrying the uploaded file.
const FILE_FIELD: &str = "file";

type HandlerResult<T> = Result<Json<T>, ErrorResponse>;

/// Body of the requests reading a device list from a shared spreadsheet.
#[derive(Debug, Deserialize)]
pub struct SheetRequest {
    /// `CSV` export URL of the spreadsheet.
    pub sheet_url: String,
}

/// Builds the gateway router.
pub fn router<R>(state: AppState<R>) -> Router
where
    R: DeviceRegistry + Clone + 'static,
{
    Router::new()
        .route("/pods/{pod_id}/open", post(open_pod::<R>))
        .route("/pods/new-device/csv", post(create_from_csv::<R>))
        .route("/pods/new-device/google-sheet", post(create_from_sheet::<R>))
        .route("/pods/new-device/{pod_id}", post(create_device::<R>))
        .route(
            "/pods/device/csv",
            get(fetch_from_csv::<R>).delete(delete_from_csv::<R>),
        )
        .route(
            "/pods/device/google-sheet",
            get(fetch_from_sheet::<R>).delete(delete_from_sheet::<R>),
        )
        .route(
            "/pods/device/{pod_id}",
            get(get_device::<R>).delete(delete_device::<R>),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Command opening both the air vent and the door of a pod.
#[must_use]
pub fn open_pod_command() -> Value {
    json!([
        { "type": "air", "action": "OPEN_AIR" },
        { "type": "door", "action": "OPEN_DOOR" },
    ])
}

async fn open_pod<R: DeviceRegistry>(
    State(state): State<AppState<R>>,
    Path(pod_id): Path<u32>,
) -> HandlerResult<PodOpening> {
    let Some(device_id) = state.pods.device_for(pod_id) else {
        return Err(ErrorResponse::not_found("Pod not found"));
    };

    state
        .dispatcher()
        .send_command(device_id, open_pod_command())?;

    info!("Opening pod {pod_id} through device `{device_id}`");
    Ok(Json(PodOpening::accepted(pod_id, device_id.to_string())))
}

async fn create_device<R: DeviceRegistry>(
    State(state): State<AppState<R>>,
    Path(pod_id): Path<String>,
) -> HandlerResult<DeviceCreated> {
    state.dispatcher().create_device(pod_id.clone(), None)?;
    Ok(Json(DeviceCreated::new(pod_id)))
}

async fn get_device<R: DeviceRegistry>(
    State(state): State<AppState<R>>,
    Path(pod_id): Path<String>,
) -> HandlerResult<DeviceFound> {
    match state.registry().get_device(&pod_id).await? {
        Some(device_info) => Ok(Json(DeviceFound::new(device_info))),
        None => Err(ErrorResponse::not_found("Device not found")),
    }
}

async fn delete_device<R: DeviceRegistry>(
    State(state): State<AppState<R>>,
    Path(pod_id): Path<String>,
) -> HandlerResult<DeviceDeleted> {
    if state.registry().delete_device(&pod_id).await? {
        Ok(Json(DeviceDeleted::new(pod_id)))
    } else {
        Err(ErrorResponse::not_found("Device not found"))
    }
}

async fn create_from_csv<R: DeviceRegistry>(
    State(state): State<AppState<R>>,
    multipart: Multipart,
) -> HandlerResult<CreateResponse> {
    let records = read_csv_upload(multipart).await?;
    let result = state.batches.process(records, Operation::Create).await;
    Ok(Json(CreateResponse::new(Source::Csv, result)))
}

async fn create_from_sheet<R: DeviceRegistry>(
    State(state): State<AppState<R>>,
    Json(request): Json<SheetRequest>,
) -> HandlerResult<CreateResponse> {
    let records = state.sheets.fetch_devices(&request.sheet_url).await?;
    let result = state.batches.process(records, Operation::Create).await;
    Ok(Json(CreateResponse::new(Source::GoogleSheet, result)))
}

async fn fetch_from_csv<R: DeviceRegistry>(
    State(state): State<AppState<R>>,
    multipart: Multipart,
) -> HandlerResult<FetchResponse> {
    let records = read_csv_upload(multipart).await?;
    let result = state.batches.process(records, Operation::Fetch).await;
    Ok(Json(FetchResponse::new(Source::Csv, result)))
}

async fn fetch_from_sheet<R: DeviceRegistry>(
    State(state): State<AppState<R>>,
    Json(request): Json<SheetRequest>,
) -> HandlerResult<FetchResponse> {
    let records = state.sheets.fetch_devices(&request.sheet_url).await?;
    let result = state.batches.process(records, Operation::Fetch).await;
    Ok(Json(FetchResponse::new(Source::GoogleSheet, result)))
}

async fn delete_from_csv<R: DeviceRegistry>(
    State(state): State<AppState<R>>,
    multipart: Multipart,
) -> HandlerResult<DeleteResponse> {
    let records = read_csv_upload(multipart).await?;
    let result = state.batches.process(records, Operation::Delete).await;
    Ok(Json(DeleteResponse::new(Source::Csv, result)))
}

async fn delete_from_sheet<R: DeviceRegistry>(
    State(state): State<AppState<R>>,
    Json(request): Json<SheetRequest>,
) -> HandlerResult<DeleteResponse> {
    let records = state.sheets.fetch_devices(&request.sheet_url).await?;
    let result = state.batches.process(records, Operation::Delete).await;
    Ok(Json(DeleteResponse::new(Source::GoogleSheet, result)))
}

// Reads the device list uploaded in the `file` field.
async fn read_csv_upload(mut multipart: Multipart) -> Result<Vec<DeviceRecord>, ErrorResponse> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ErrorResponse::invalid_data_with_error("Invalid multipart body", e.body_text()))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        if !field.file_name().is_some_and(|name| name.ends_with(".csv")) {
            return Err(ErrorResponse::invalid_data("Only CSV files are allowed"));
        }

        let bytes = field.bytes().await.map_err(|e| {
            ErrorResponse::invalid_data_with_error("Unable to read the uploaded file", e.body_text())
        })?;

        return Ok(parse_csv_bytes(&bytes)?);
    }

    Err(ErrorResponse::invalid_data("Missing `file` field"))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::Router;
    use axum::body::Body;
    use axum::http::header::CONTENT_TYPE;
    use axum::http::{Method, Request, StatusCode};
    use axum::routing::get;

    use indexmap::IndexMap;

    use podgate_controller::device::{DeviceInfo, DeviceStatus};
    use podgate_controller::error::{Error, Result};
    use podgate_controller::registry::DeviceRegistry;

    use serde_json::{Value, json};

    use tokio::net::TcpListener;

    use tower::ServiceExt;

    use crate::config::PodMap;
    use crate::state::AppState;

    use super::{open_pod_command, router};

    const BROKEN_DEVICE: &str = "broken";

    // An in-memory registry. The `broken` device always fails.
    #[derive(Debug, Clone, Default)]
    struct MemoryRegistry {
        devices: Arc<Mutex<IndexMap<String, DeviceStatus>>>,
        commands: Arc<Mutex<Vec<(String, Value)>>>,
    }

    impl MemoryRegistry {
        fn with_devices(ids: &[&str]) -> Self {
            let registry = Self::default();
            for id in ids {
                let _ = registry
                    .devices
                    .lock()
                    .unwrap()
                    .insert((*id).to_string(), DeviceStatus::Enabled);
            }
            registry
        }

        fn status(&self, id: &str) -> Option<DeviceStatus> {
            self.devices.lock().unwrap().get(id).copied()
        }

        fn check(id: &str) -> Result<()> {
            if id == BROKEN_DEVICE {
                return Err(Error::remote(500, "registry failure"));
            }
            Ok(())
        }
    }

    impl DeviceRegistry for MemoryRegistry {
        async fn create_or_update_device(&self, id: &str, status: Option<&str>) -> Result<()> {
            Self::check(id)?;
            let _ = self
                .devices
                .lock()
                .unwrap()
                .insert(id.into(), DeviceStatus::normalize(status));
            Ok(())
        }

        async fn get_device(&self, id: &str) -> Result<Option<DeviceInfo>> {
            Self::check(id)?;
            Ok(self
                .status(id)
                .map(|status| json!({ "deviceId": id, "status": status })))
        }

        async fn delete_device(&self, id: &str) -> Result<bool> {
            Self::check(id)?;
            Ok(self.devices.lock().unwrap().shift_remove(id).is_some())
        }

        async fn send_command(&self, id: &str, payload: &Value) -> Result<()> {
            Self::check(id)?;
            self.commands
                .lock()
                .unwrap()
                .push((id.into(), payload.clone()));
            Ok(())
        }
    }

    fn app(registry: &MemoryRegistry) -> Router {
        let pods: PodMap = "1=pod-a,2=broken".parse().unwrap();
        let (state, _worker) = AppState::new(registry.clone(), pods).unwrap();
        router(state)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn empty(method: Method, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn upload(method: Method, uri: &str, file_name: &str, content: &str) -> Request<Body> {
        let boundary = "podgate-boundary";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
             Content-Type: text/csv\r\n\r\n\
             {content}\r\n\
             --{boundary}--\r\n"
        );

        Request::builder()
            .method(method)
            .uri(uri)
            .header(
                CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn sheet(method: Method, uri: &str, sheet_url: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "sheet_url": sheet_url }).to_string()))
            .unwrap()
    }

    async fn eventually(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn spawn_sheet_server(content: &'static str) -> String {
        let app = Router::new()
            .route("/export", get(move || async move { content }))
            .route("/private", get(|| async { StatusCode::FORBIDDEN }));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move { axum::serve(listener, app).await });

        format!("http://{address}")
    }

    #[tokio::test]
    async fn open_pod() {
        let registry = MemoryRegistry::default();

        let (status, body) = send(app(&registry), empty(Method::POST, "/pods/1/open")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({ "status": "accepted", "pod_id": 1, "device_id": "pod-a" })
        );

        eventually(|| !registry.commands.lock().unwrap().is_empty()).await;
        assert_eq!(
            *registry.commands.lock().unwrap(),
            vec![("pod-a".to_string(), open_pod_command())]
        );
    }

    #[tokio::test]
    async fn open_pod_failures() {
        let registry = MemoryRegistry::default();

        let (status, body) = send(app(&registry), empty(Method::POST, "/pods/9/open")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NotFound");
        assert_eq!(body["description"], "Pod not found");

        // A failing command is only logged, the request is still accepted.
        let (status, body) = send(app(&registry), empty(Method::POST, "/pods/2/open")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["device_id"], BROKEN_DEVICE);
    }

    #[tokio::test]
    async fn create_single_device() {
        let registry = MemoryRegistry::default();

        let (status, body) = send(
            app(&registry),
            empty(Method::POST, "/pods/new-device/pod-7"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({ "status": "device creation initiated", "pod_id": "pod-7" })
        );

        eventually(|| registry.status("pod-7").is_some()).await;
        assert_eq!(registry.status("pod-7"), Some(DeviceStatus::Enabled));
    }

    #[tokio::test]
    async fn create_from_csv() {
        let registry = MemoryRegistry::default();

        let (status, body) = send(
            app(&registry),
            upload(
                Method::POST,
                "/pods/new-device/csv",
                "devices.csv",
                "DeviceId,Status\nA,\nA,disabled\nB,bogus\nC,0",
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "status": "device creation initiated",
                "source": "csv",
                "created": ["A", "B", "C"],
                "duplicated": ["A"],
                "total": 3,
                "errors": {},
            })
        );

        eventually(|| registry.devices.lock().unwrap().len() == 3).await;
        assert_eq!(registry.status("A"), Some(DeviceStatus::Enabled));
        assert_eq!(registry.status("B"), Some(DeviceStatus::Enabled));
        assert_eq!(registry.status("C"), Some(DeviceStatus::Disabled));
    }

    #[tokio::test]
    async fn invalid_uploads() {
        let registry = MemoryRegistry::default();

        let (status, body) = send(
            app(&registry),
            upload(
                Method::POST,
                "/pods/new-device/csv",
                "devices.txt",
                "DeviceId\nA",
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["description"], "Only CSV files are allowed");

        let (status, body) = send(
            app(&registry),
            upload(Method::GET, "/pods/device/csv", "devices.csv", "Id\nA"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "InvalidData");
        assert_eq!(body["info"], "Ingestion: Missing `DeviceId` column");
    }

    #[tokio::test]
    async fn single_device() {
        let registry = MemoryRegistry::with_devices(&["pod-1"]);

        let (status, body) = send(app(&registry), empty(Method::GET, "/pods/device/pod-1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "status": "success",
                "device_info": { "deviceId": "pod-1", "status": "enabled" },
            })
        );

        let (status, _) = send(app(&registry), empty(Method::GET, "/pods/device/pod-2")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(app(&registry), empty(Method::GET, "/pods/device/broken")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["info"], "Remote Registry (500): registry failure");

        let (status, body) = send(app(&registry), empty(Method::DELETE, "/pods/device/pod-1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "success", "deleted": "pod-1" }));
        assert_eq!(registry.status("pod-1"), None);

        let (status, _) = send(app(&registry), empty(Method::DELETE, "/pods/device/pod-1")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn fetch_from_csv() {
        let registry = MemoryRegistry::with_devices(&["pod-1", "pod-3"]);

        let (status, body) = send(
            app(&registry),
            upload(
                Method::GET,
                "/pods/device/csv",
                "devices.csv",
                "DeviceId\npod-1\nmissing\nbroken\npod-1\npod-3",
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["source"], "csv");
        assert_eq!(body["total"], 4);
        assert_eq!(
            body["found"],
            json!({
                "pod-1": { "deviceId": "pod-1", "status": "enabled" },
                "pod-3": { "deviceId": "pod-3", "status": "enabled" },
            })
        );
        assert_eq!(body["not_found"], json!(["missing"]));
        assert_eq!(body["duplicated"], json!(["pod-1"]));
        assert_eq!(
            body["errors"],
            json!({ "broken": "Remote Registry (500): registry failure" })
        );
    }

    #[tokio::test]
    async fn delete_from_csv() {
        let registry = MemoryRegistry::with_devices(&["pod-1", "pod-2"]);

        let (status, body) = send(
            app(&registry),
            upload(
                Method::DELETE,
                "/pods/device/csv",
                "devices.csv",
                "DeviceId,Status\npod-2,\nmissing,\npod-1,\npod-2,",
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "status": "success",
                "source": "csv",
                "total": 3,
                "deleted": ["pod-2", "pod-1"],
                "not_found": ["missing"],
                "duplicated": ["pod-2"],
                "errors": {},
            })
        );
        assert!(registry.devices.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn google_sheet() {
        let registry = MemoryRegistry::with_devices(&["pod-1"]);
        let base = spawn_sheet_server("DeviceId,Status\npod-1,\npod-2,disabled\n").await;
        let sheet_url = format!("{base}/export");

        let (status, body) = send(
            app(&registry),
            sheet(Method::GET, "/pods/device/google-sheet", &sheet_url),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "google_sheet");
        assert_eq!(body["not_found"], json!(["pod-2"]));

        let (status, body) = send(
            app(&registry),
            sheet(Method::POST, "/pods/new-device/google-sheet", &sheet_url),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["created"], json!(["pod-1", "pod-2"]));

        eventually(|| registry.status("pod-2").is_some()).await;
        assert_eq!(registry.status("pod-2"), Some(DeviceStatus::Disabled));

        let (status, body) = send(
            app(&registry),
            sheet(Method::DELETE, "/pods/device/google-sheet", &sheet_url),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], json!(["pod-1", "pod-2"]));
    }

    #[tokio::test]
    async fn google_sheet_failures() {
        let registry = MemoryRegistry::default();
        let base = spawn_sheet_server("DeviceId\n").await;

        let (status, _) = send(
            app(&registry),
            sheet(Method::POST, "/pods/new-device/google-sheet", "not a url"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            app(&registry),
            sheet(
                Method::GET,
                "/pods/device/google-sheet",
                &format!("{base}/private"),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "Upstream");
    }
}

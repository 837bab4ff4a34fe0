//! HTTP API tests.
//!
//! The axum `Router` is driven in-process with `tower::ServiceExt::oneshot`;
//! no socket is opened. A scripted recognizer stands in for tesseract.

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use edgequake_ocr::pipeline::preprocess::PreparedPage;
use edgequake_ocr::{
    router, AppState, OcrConfig, OcrEngine, PreprocessOptions, Recognition, RecognizeError,
    Recognizer,
};
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use serde_json::Value;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const BOUNDARY: &str = "ocr-test-boundary";

struct Scripted {
    delay: Duration,
}

#[async_trait]
impl Recognizer for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn recognize(
        &self,
        page: &PreparedPage,
        languages: &[String],
    ) -> Result<Recognition, RecognizeError> {
        tokio::time::sleep(self.delay).await;
        Ok(Recognition {
            text: format!("page {} [{}]", page.index, languages.join("+")),
            confidence: 0.8,
            words: Vec::new(),
        })
    }
}

fn app_with(delay_ms: u64, active: usize, queued: usize, max_input_bytes: usize) -> Router {
    let config = OcrConfig::builder()
        .preprocess(PreprocessOptions::none())
        .max_active_documents(active)
        .max_queued_documents(queued)
        .max_input_bytes(max_input_bytes)
        .build()
        .unwrap();
    let engine = OcrEngine::new(
        config,
        Arc::new(Scripted {
            delay: Duration::from_millis(delay_ms),
        }),
    );
    router(AppState::new(engine))
}

fn app() -> Router {
    app_with(0, 2, 4, 1024 * 1024)
}

fn png() -> Vec<u8> {
    let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(12, 12, Luma([255])));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

/// A multipart field: name, optional (file name, content type), data.
struct Part<'a> {
    name: &'a str,
    file: Option<(&'a str, &'a str)>,
    data: &'a [u8],
}

fn file_part<'a>(data: &'a [u8], content_type: &'a str) -> Part<'a> {
    Part {
        name: "file",
        file: Some(("upload.bin", content_type)),
        data,
    }
}

fn text_part<'a>(name: &'a str, value: &'a str) -> Part<'a> {
    Part {
        name,
        file: None,
        data: value.as_bytes(),
    }
}

fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part.file {
            Some((file_name, content_type)) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                         Content-Type: {}\r\n\r\n",
                        part.name, file_name, content_type
                    )
                    .as_bytes(),
                );
            }
            None => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", part.name)
                        .as_bytes(),
                );
            }
        }
        body.extend_from_slice(part.data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn upload(uri: &str, parts: &[Part<'_>]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

async fn wait_terminal(app: &Router, id: &str) -> Value {
    for _ in 0..200 {
        let (status, body) = send(app, get(&format!("/v1/documents/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        if matches!(body["status"].as_str(), Some("done" | "failed" | "cancelled")) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("document {id} did not finish");
}

// ── Health ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_engine() {
    let (status, body) = send(&app(), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["engine"], "scripted");
    assert_eq!(body["engine_available"], true);
}

// ── Synchronous OCR ──────────────────────────────────────────────────────────

#[tokio::test]
async fn sync_ocr_returns_the_result() {
    let data = png();
    let (status, body) = send(
        &app(),
        upload(
            "/v1/ocr",
            &[
                file_part(&data, "image/png"),
                text_part("languages", "deu,eng"),
            ],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "done");
    assert_eq!(body["text"], "page 0 [deu+eng]");
    assert_eq!(body["pages"].as_array().unwrap().len(), 1);
    assert_eq!(body["metadata"]["media_type"], "image/png");
}

#[tokio::test]
async fn octet_stream_is_sniffed() {
    let data = png();
    let (status, body) = send(
        &app(),
        upload("/v1/ocr", &[file_part(&data, "application/octet-stream")]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metadata"]["media_type"], "image/png");
}

#[tokio::test]
async fn unsupported_type_is_415() {
    let (status, body) = send(
        &app(),
        upload("/v1/ocr", &[file_part(b"GIF89a....", "image/gif")]),
    )
    .await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(body["error"]["kind"], "unsupported_format");
    assert!(body["error"]["message"].as_str().unwrap().contains("image/gif"));
}

#[tokio::test]
async fn corrupt_image_is_422() {
    let mut data = png();
    data.truncate(20);
    let (status, body) = send(&app(), upload("/v1/ocr", &[file_part(&data, "image/png")])).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["kind"], "corrupt_input");
}

#[tokio::test]
async fn missing_file_field_is_400() {
    let (status, body) = send(&app(), upload("/v1/ocr", &[text_part("languages", "eng")])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "invalid_request");
}

#[tokio::test]
async fn bad_language_and_page_fields_are_400() {
    let data = png();
    let (status, body) = send(
        &app(),
        upload(
            "/v1/ocr",
            &[file_part(&data, "image/png"), text_part("languages", "en g")],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "invalid_request");

    let (status, _) = send(
        &app(),
        upload(
            "/v1/ocr",
            &[file_part(&data, "image/png"), text_part("pages", "3-1")],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app(),
        upload(
            "/v1/ocr",
            &[file_part(&data, "image/png"), text_part("pages", "4")],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "page_out_of_range");
}

#[tokio::test]
async fn oversized_upload_is_413() {
    let app = app_with(0, 1, 1, 1_000);
    let data = vec![0u8; 2_000];
    let (status, body) = send(&app, upload("/v1/ocr", &[file_part(&data, "image/png")])).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"]["kind"], "input_too_large");
}

// ── Asynchronous documents ───────────────────────────────────────────────────

#[tokio::test]
async fn submit_poll_and_collect() {
    let app = app();
    let data = png();
    let (status, body) = send(
        &app,
        upload("/v1/documents", &[file_part(&data, "image/png")]),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["id"].as_str().unwrap().to_string();

    let summary = wait_terminal(&app, &id).await;
    assert_eq!(summary["status"], "done");
    assert_eq!(summary["completed_pages"], 1);

    let (status, result) = send(&app, get(&format!("/v1/documents/{id}/result"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["text"], "page 0 [eng]");
    assert_eq!(result["document_id"], id.as_str());

    // Handed out once.
    let (status, body) = send(&app, get(&format!("/v1/documents/{id}/result"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");
}

#[tokio::test]
async fn result_while_running_is_409() {
    let app = app_with(500, 1, 1, 1024 * 1024);
    let data = png();
    let (_, body) = send(
        &app,
        upload("/v1/documents", &[file_part(&data, "image/png")]),
    )
    .await;
    let id = body["id"].as_str().unwrap();

    let (status, body) = send(&app, get(&format!("/v1/documents/{id}/result"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "not_ready");
}

#[tokio::test]
async fn full_queue_is_429_with_retry_after() {
    let app = app_with(500, 1, 0, 1024 * 1024);
    let data = png();
    let (status, _) = send(
        &app,
        upload("/v1/documents", &[file_part(&data, "image/png")]),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let response = app
        .clone()
        .oneshot(upload("/v1/documents", &[file_part(&data, "image/png")]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
}

#[tokio::test]
async fn delete_cancels_a_queued_document() {
    let app = app_with(300, 1, 1, 1024 * 1024);
    let data = png();
    let (_, first) = send(&app, upload("/v1/documents", &[file_part(&data, "image/png")])).await;
    let (_, second) = send(&app, upload("/v1/documents", &[file_part(&data, "image/png")])).await;
    let second_id = second["id"].as_str().unwrap();

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/v1/documents/{second_id}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["cancel_requested"], true);

    assert_eq!(wait_terminal(&app, second_id).await["status"], "cancelled");
    assert_eq!(
        wait_terminal(&app, first["id"].as_str().unwrap()).await["status"],
        "done"
    );
}

#[tokio::test]
async fn unknown_and_malformed_ids_are_404() {
    let app = app();
    let (status, _) = send(
        &app,
        get("/v1/documents/6f1c2a7e-0000-4000-8000-000000000000"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, get("/v1/documents/not-a-uuid/result")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");
}

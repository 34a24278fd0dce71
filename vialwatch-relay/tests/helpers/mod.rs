//! Shared helpers for vialwatch-relay integration tests

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Request},
};
use serde_json::Value;
use std::path::Path;
use vialwatch_common::{RelayConfig, RetryPolicy};

pub const BOUNDARY: &str = "vialwatch-test-boundary";

/// Config rooted in `root` with waits short enough for tests
pub fn test_config(root: &Path) -> RelayConfig {
    let mut config = RelayConfig::rooted_at(root);
    config.analysis.program = "vialwatch-test-missing-program".to_string();
    config.tail.discovery = RetryPolicy::fixed(10, 5);
    config.tail.follow_interval_ms = 20;
    config.results.volume_retry = RetryPolicy::fixed(10, 3);
    config.cleanup.settle_ms = 0;
    config
}

/// One part of a multipart form
pub enum FormPart<'a> {
    File {
        name: &'a str,
        file_name: &'a str,
        content_type: &'a str,
        data: &'a [u8],
    },
    Text {
        name: &'a str,
        value: &'a str,
    },
}

pub fn multipart_body(parts: &[FormPart<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            FormPart::File {
                name,
                file_name,
                content_type,
                data,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                        name, file_name, content_type
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
            FormPart::Text { name, value } => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n{}", name, value)
                        .as_bytes(),
                );
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

pub fn upload_request(parts: &[FormPart<'_>]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap()
}

pub fn image_upload(content_type: &str, data: &[u8]) -> Request<Body> {
    upload_request(&[FormPart::File {
        name: "file",
        file_name: "vials.jpg",
        content_type,
        data,
    }])
}

pub fn test_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn extract_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("Should read body");
    serde_json::from_slice(&bytes).expect("Should parse JSON")
}

/// Number of regular files in `dir` (0 if it does not exist)
pub fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.path().is_file())
                .count()
        })
        .unwrap_or(0)
}

/// Local-time log stamp `secs_ago` seconds in the past
pub fn stamp_secs_ago(secs_ago: i64) -> String {
    (chrono::Local::now() - chrono::Duration::seconds(secs_ago))
        .format("%Y-%m-%d-%H-%M-%S")
        .to_string()
}

/// Append one line to an existing log file
pub fn append_line(path: &Path, line: &str) {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
    writeln!(file, "{}", line).unwrap();
}

/// Write a rotated log file stamped `stamp` (`YYYY-MM-DD-HH-mm-ss`)
pub fn write_log(log_dir: &Path, stamp: &str, contents: &str) -> std::path::PathBuf {
    std::fs::create_dir_all(log_dir).unwrap();
    let path = log_dir.join(format!("instance_seg.log_{}", stamp));
    std::fs::write(&path, contents).unwrap();
    path
}

//! vialwatch-submit - command-line client for vialwatch-relay
//!
//! Uploads one image, polls the relay until the analysis completes, saves
//! the result images, prints the per-vial volumes and cleans up.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use vialwatch_common::monitor::{MonitorPolicy, PollOutcome, RunMonitor, StatusReport};
use vialwatch_common::volume::{render_volumes, VolumeResult};
use vialwatch_common::{AnalysisParameters, ClientId, StatusMarkers};

const RESULT_IMAGES: [&str; 2] = ["output.jpg", "turbidites.jpg"];

#[derive(Parser, Debug)]
#[command(name = "vialwatch-submit")]
#[command(about = "Submit an image to vialwatch-relay and print the vial volumes")]
#[command(version)]
struct Args {
    /// Image to analyze (JPEG or PNG)
    image: PathBuf,

    #[arg(short, long, default_value = "http://127.0.0.1:3000", env = "VIALWATCH_URL")]
    server: String,

    #[arg(long, default_value_t = 0.1)]
    nms_iou: f64,

    #[arg(long, default_value_t = 0.2)]
    confidence: f64,

    #[arg(long, default_value_t = 32)]
    batch_size: u32,

    /// Save result images here
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Leave the relay's log files in place
    #[arg(long)]
    no_cleanup: bool,

    /// Print log lines while polling
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    client_id: ClientId,
}

#[derive(Debug, Deserialize)]
struct ProgressResponse {
    logs: Vec<String>,
    cursor: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CleanupResponse {
    deleted_files: usize,
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

struct Relay {
    http: reqwest::Client,
    base: String,
}

impl Relay {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base.trim_end_matches('/'), path)
    }

    async fn upload(&self, image: &Path, mime: &str, params: &AnalysisParameters) -> Result<ClientId> {
        let data = tokio::fs::read(image)
            .await
            .with_context(|| format!("Failed to read {}", image.display()))?;
        let file_name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        let form = Form::new()
            .part("file", Part::bytes(data).file_name(file_name).mime_str(mime)?)
            .text("nmsIou", params.nms_iou.to_string())
            .text("confidence", params.confidence.to_string())
            .text("batchSize", params.batch_size.to_string());

        let response = self.http.post(self.url("/upload")).multipart(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("upload rejected ({}): {}", status, body);
        }
        let accepted: UploadResponse = response.json().await.context("Malformed upload response")?;
        Ok(accepted.client_id)
    }

    async fn status(&self, client_id: &ClientId) -> std::result::Result<StatusReport, String> {
        let response = self
            .http
            .get(self.url(&format!("/status/{}", client_id)))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("status request failed: {}", response.status()));
        }
        response.json().await.map_err(|e| e.to_string())
    }

    /// Log lines newer than `since`; `None` while the relay has no session
    async fn progress(&self, client_id: &ClientId, since: u64) -> Result<Option<(Vec<String>, u64)>> {
        let response = self
            .http
            .get(self.url(&format!("/progress/{}", client_id)))
            .query(&[("since", since)])
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("progress request failed ({})", response.status());
        }
        let progress: ProgressResponse = response.json().await?;
        Ok(progress.cursor.map(|cursor| (progress.logs, cursor)))
    }

    async fn fetch_image(&self, name: &str) -> Result<Vec<u8>> {
        // Cache-busting query, as the browser client does
        let stamp = chrono::Utc::now().timestamp_millis();
        let response = self
            .http
            .get(self.url(&format!("/results/{}?t={}", name, stamp)))
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("result image {} unavailable ({})", name, response.status());
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn volume_data(&self, client_id: &ClientId) -> Result<Value> {
        let response = self
            .http
            .get(self.url(&format!("/volume-data/{}", client_id)))
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await.context("Malformed volume data response")?;
        if !status.is_success() {
            bail!("volume data unavailable ({}): {}", status, body);
        }
        Ok(body)
    }

    async fn cleanup(&self, client_id: &ClientId) -> Result<usize> {
        let response = self
            .http
            .post(self.url(&format!("/cleanup/{}", client_id)))
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("cleanup failed ({})", response.status());
        }
        let report: CleanupResponse = response.json().await?;
        Ok(report.deleted_files)
    }
}

async fn fetch_results(relay: &Relay, client_id: &ClientId, output_dir: Option<&Path>) -> Result<VolumeResult> {
    for name in RESULT_IMAGES {
        let bytes = relay.fetch_image(name).await?;
        match output_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                let path = dir.join(name);
                tokio::fs::write(&path, &bytes).await?;
                info!("Saved {}", path.display());
            }
            None => debug!(image = name, bytes = bytes.len(), "Result image available"),
        }
    }

    let doc = relay.volume_data(client_id).await?;
    Ok(VolumeResult::from_value(&doc)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vialwatch_submit=info,vialwatch_common=warn".into()),
        )
        .init();

    let args = Args::parse();
    let params = AnalysisParameters {
        nms_iou: args.nms_iou,
        confidence: args.confidence,
        batch_size: args.batch_size,
    };
    params.validate()?;

    let relay = Relay {
        http: reqwest::Client::new(),
        base: args.server.clone(),
    };
    let mut monitor = RunMonitor::new(MonitorPolicy::default(), StatusMarkers::default());

    let file_name = args.image.display().to_string();
    let mime = mime_for(&args.image);
    monitor.select_file(&file_name, mime)?;
    monitor.begin_upload()?;

    let client_id = match relay.upload(&args.image, mime, &params).await {
        Ok(id) => id,
        Err(e) => {
            monitor.upload_failed(e.to_string());
            return Err(e);
        }
    };
    monitor.upload_accepted(client_id.clone(), Instant::now())?;
    info!("Analysis started, client id {}", client_id);

    let mut cursor = 0u64;
    loop {
        tokio::time::sleep(monitor.policy().poll_interval).await;

        if args.verbose {
            match relay.progress(&client_id, cursor).await {
                Ok(Some((lines, next))) => {
                    for line in lines {
                        println!("  | {}", line);
                    }
                    cursor = next;
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Progress poll failed"),
            }
        }

        let poll = relay.status(&client_id).await;
        match monitor.observe(poll, Instant::now()) {
            PollOutcome::Continue => continue,
            PollOutcome::Completed => break,
            PollOutcome::Failed(reason) => return Err(anyhow!("analysis failed: {}", reason)),
        }
    }

    let result = match fetch_results(&relay, &client_id, args.output_dir.as_deref()).await {
        Ok(result) => result,
        Err(e) => {
            monitor.result_failed(e.to_string());
            return Err(e);
        }
    };

    for vial in render_volumes(&result) {
        println!("{}", vial.title);
        for line in vial.lines {
            println!("  {}", line);
        }
    }

    if !args.no_cleanup {
        match relay.cleanup(&client_id).await {
            Ok(count) => info!("Cleanup removed {} log file(s)", count),
            Err(e) => warn!("Cleanup failed: {}", e),
        }
    }

    Ok(())
}

//! Thin client for the faceregd REST API.

use anyhow::{bail, Context, Result};
use base64::Engine;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::path::Path;

pub struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    pub fn new(server: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: server.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn list(&self) -> Result<Value> {
        self.send(self.http.get(self.url("/get_persons"))).await
    }

    pub async fn status(&self) -> Result<Value> {
        self.send(self.http.get(self.url("/status"))).await
    }

    pub async fn register(&self, name: &str, image: &Path) -> Result<Value> {
        let body = json!({ "name": name, "image": image_data_uri(image)? });
        self.send(self.http.post(self.url("/register_face")).json(&body)).await
    }

    pub async fn recognize(&self, image: &Path) -> Result<Value> {
        let body = json!({ "image": image_data_uri(image)? });
        self.send(self.http.post(self.url("/recognize_faces")).json(&body)).await
    }

    pub async fn rename(&self, id: i64, name: &str) -> Result<Value> {
        let url = self.url(&format!("/update_person/{id}"));
        self.send(self.http.put(url).json(&json!({ "name": name }))).await
    }

    pub async fn delete(&self, id: i64) -> Result<Value> {
        self.send(self.http.delete(self.url(&format!("/delete_person/{id}")))).await
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Value> {
        let resp = req
            .send()
            .await
            .with_context(|| format!("cannot reach faceregd at {}", self.base))?;
        let status = resp.status();
        let text = resp.text().await.context("failed to read faceregd response")?;
        tracing::debug!(status = status.as_u16(), bytes = text.len(), "response received");
        parse_response(status, &text)
    }
}

/// Success bodies must be JSON. Error bodies are searched for `{error}`.
fn parse_response(status: StatusCode, text: &str) -> Result<Value> {
    if status.is_success() {
        return serde_json::from_str(text).context("invalid JSON from faceregd");
    }
    let body: Option<Value> = serde_json::from_str(text).ok();
    let message = body
        .as_ref()
        .and_then(|b| b["error"].as_str())
        .unwrap_or("no error message");
    bail!("faceregd returned {status}: {message}")
}

/// Read an image file and wrap it in a `data:` URI.
pub fn image_data_uri(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(encode_data_uri(&bytes))
}

fn encode_data_uri(bytes: &[u8]) -> String {
    let mime = image::guess_format(bytes)
        .map(|f| f.to_mime_type())
        .unwrap_or("image/jpeg");
    format!(
        "data:{mime};base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

//! LinkedIn UGC publish adapter

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::{PublishError, Result};
use crate::publisher::PublishAdapter;

pub struct LinkedInAdapter {
    http: reqwest::Client,
    publish_url: String,
}

impl LinkedInAdapter {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.publish_timeout_secs))
            .build()
            .map_err(|e| PublishError::Connection(e.to_string()))?;

        Ok(Self {
            http,
            publish_url: config.publish_url.clone(),
        })
    }

    fn build_body(author_id: &str, content: &str, image_ref: Option<&str>) -> Value {
        let share_content = match image_ref {
            Some(url) => json!({
                "shareCommentary": { "text": content },
                "shareMediaCategory": "ARTICLE",
                "media": [{ "status": "READY", "originalUrl": url }],
            }),
            None => json!({
                "shareCommentary": { "text": content },
                "shareMediaCategory": "NONE",
            }),
        };

        json!({
            "author": author_id,
            "lifecycleState": "PUBLISHED",
            "specificContent": { "com.linkedin.ugc.ShareContent": share_content },
            "visibility": { "com.linkedin.ugc.MemberNetworkVisibility": "PUBLIC" },
        })
    }
}

#[async_trait]
impl PublishAdapter for LinkedInAdapter {
    async fn publish(
        &self,
        access_token: &str,
        author_id: &str,
        content: &str,
        image_ref: Option<&str>,
    ) -> Result<String> {
        let body = Self::build_body(author_id, content, image_ref);

        let response = self
            .http
            .post(&self.publish_url)
            .bearer_auth(access_token)
            .header("X-Restli-Protocol-Version", "2.0.0")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PublishError::Timeout(e.to_string())
                } else {
                    PublishError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        debug!(status = status.as_u16(), "linkedin publish response");

        if status.is_success() {
            // Post id arrives in the body or the X-RestLi-Id header
            let header_id = response
                .headers()
                .get("x-restli-id")
                .and_then(|v| v.to_str().ok())
                .map(String::from);

            let body: Value = response.json().await.unwrap_or(Value::Null);
            let post_id = body
                .get("id")
                .and_then(|v| v.as_str())
                .map(String::from)
                .or(header_id);

            return post_id.ok_or_else(|| {
                PublishError::Protocol("publish succeeded but response carried no post id".to_string())
                    .into()
            });
        }

        let code = status.as_u16();
        let detail = truncated_body(response).await;

        let error = match code {
            401 | 403 => PublishError::Auth { status: code },
            429 => PublishError::RateLimited(detail),
            500..=599 => PublishError::Server {
                status: code,
                detail,
            },
            _ => PublishError::Rejected {
                status: code,
                detail,
            },
        };
        Err(error.into())
    }

    fn name(&self) -> &str {
        "linkedin"
    }
}

async fn truncated_body(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();
    text.chars().take(200).collect()
}

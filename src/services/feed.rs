// Upstream feed client
// One GET per scan cycle; bearer token and opaque cookies come from the
// credential store, which an external utility rewrites.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::index::{NewCreator, NewVideo};
use crate::services::credentials::CredentialStore;

/// Upstream request deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Feed client for the upstream content provider.
pub struct FeedClient {
    client: Client,
    feed_url: String,
    user_agent: String,
    credentials: Arc<CredentialStore>,
}

/// One page of the upstream feed.
#[derive(Debug, Deserialize)]
pub struct FeedPage {
    #[serde(default)]
    pub items: Vec<FeedItem>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FeedItem {
    pub post: FeedPost,
    pub profile: FeedProfile,
}

#[derive(Debug, Deserialize)]
pub struct FeedPost {
    pub id: String,
    #[serde(default)]
    pub text: Option<String>,
    /// Unix seconds.
    pub posted_at: i64,
    #[serde(default)]
    pub permalink: Option<String>,
    #[serde(default)]
    pub like_count: Option<i64>,
    #[serde(default)]
    pub view_count: Option<i64>,
    #[serde(default)]
    pub attachments: Vec<FeedAttachment>,
}

#[derive(Debug, Deserialize)]
pub struct FeedAttachment {
    #[serde(default)]
    pub width: Option<i64>,
    #[serde(default)]
    pub height: Option<i64>,
    #[serde(default)]
    pub encodings: Option<FeedEncodings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FeedEncodings {
    #[serde(default)]
    pub source: Option<FeedEncoding>,
    #[serde(default)]
    pub md: Option<FeedEncoding>,
    #[serde(default)]
    pub thumbnail: Option<FeedEncoding>,
    #[serde(default)]
    pub gif: Option<FeedEncoding>,
}

#[derive(Debug, Deserialize)]
pub struct FeedEncoding {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FeedProfile {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub follower_count: Option<i64>,
    #[serde(default)]
    pub post_count: Option<i64>,
    #[serde(default)]
    pub verified: Option<bool>,
}

impl FeedClient {
    pub fn new(
        feed_url: String,
        user_agent: String,
        credentials: Arc<CredentialStore>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Fatal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            feed_url,
            user_agent,
            credentials,
        })
    }

    /// Fetch one feed page. Error classification drives the scanner's
    /// recovery: `Credentials` for auth rejections, `Upstream` for malformed
    /// bodies, `Transient` for transport failures.
    pub async fn fetch_page(&self, limit: u32, cursor: Option<&str>) -> Result<FeedPage> {
        let mut url = format!("{}?limit={}", self.feed_url, limit);
        if let Some(cursor) = cursor {
            url.push_str(&format!("&cursor={}", urlencoding::encode(cursor)));
        }

        let mut request = self
            .client
            .get(&url)
            .header(header::USER_AGENT, &self.user_agent);

        let token = self.credentials.token().await;
        if !token.is_empty() {
            request = request.bearer_auth(token);
        }
        if let Some(cookies) = self.credentials.cookies().await {
            request = request.header(header::COOKIE, cookies);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                Error::Transient(format!("feed request failed: {}", e))
            } else {
                Error::Upstream(format!("feed request failed: {}", e))
            }
        })?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(Error::Credentials(format!(
                    "upstream returned {}",
                    response.status()
                )));
            }
            status if status.is_server_error() => {
                return Err(Error::Transient(format!("upstream returned {}", status)));
            }
            status if !status.is_success() => {
                return Err(Error::Upstream(format!("upstream returned {}", status)));
            }
            _ => {}
        }

        // A 200 with an HTML interstitial body is the credential-looking
        // failure mode; surface it as a parse error, not a panic.
        let body = response
            .text()
            .await
            .map_err(|e| Error::Transient(format!("failed to read feed body: {}", e)))?;

        serde_json::from_str(&body)
            .map_err(|e| Error::Upstream(format!("feed body is not valid JSON: {}", e)))
    }
}

/// Convert one feed item into index rows. Returns `None` when the post has
/// no playable media attachment.
pub fn convert_item(item: &FeedItem) -> Option<(NewCreator, NewVideo)> {
    let attachment = item.post.attachments.first()?;
    let encodings = attachment.encodings.as_ref()?;
    let media_url = encodings.source.as_ref()?.path.clone()?;

    let creator = NewCreator {
        id: item.profile.id.clone(),
        username: item.profile.username.clone(),
        profile_url: item.profile.url.clone(),
        follower_count: item.profile.follower_count,
        post_count: item.profile.post_count,
        verified: item.profile.verified.unwrap_or(false),
    };

    let encoding_path = |e: &Option<FeedEncoding>| e.as_ref().and_then(|e| e.path.clone());

    let video = NewVideo {
        id: item.post.id.clone(),
        creator_id: item.profile.id.clone(),
        description: item.post.text.clone().unwrap_or_default(),
        posted_at: item.post.posted_at,
        permalink: item.post.permalink.clone(),
        media_url,
        media_url_md: encoding_path(&encodings.md),
        thumbnail_url: encoding_path(&encodings.thumbnail),
        gif_url: encoding_path(&encodings.gif),
        width: attachment.width,
        height: attachment.height,
        like_count: item.post.like_count,
        view_count: item.post.view_count,
    };

    Some((creator, video))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn store_with_token(dir: &tempfile::TempDir, token: &str) -> Arc<CredentialStore> {
        let path = dir.path().join("creds.json");
        std::fs::write(
            &path,
            format!(r#"{{"token":"{}","cookies":"cf_clearance=xyz"}}"#, token),
        )
        .unwrap();
        Arc::new(CredentialStore::open(path, None).await)
    }

    fn sample_page_json() -> serde_json::Value {
        serde_json::json!({
            "items": [{
                "post": {
                    "id": "p1",
                    "text": "a cat video",
                    "posted_at": 1700000000,
                    "permalink": "https://upstream.test/p/p1",
                    "like_count": 5,
                    "attachments": [{
                        "width": 1920,
                        "height": 1080,
                        "encodings": {
                            "source": {"path": "https://cdn.test/p1.mp4"},
                            "thumbnail": {"path": "https://cdn.test/p1.jpg"}
                        }
                    }]
                },
                "profile": {
                    "id": "u1",
                    "username": "catperson",
                    "verified": true
                }
            }],
            "cursor": "next-page"
        })
    }

    #[tokio::test]
    async fn test_fetch_page_sends_auth_and_parses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(query_param("limit", "200"))
            .and(header("authorization", "Bearer tok-1"))
            .and(header("cookie", "cf_clearance=xyz"))
            .respond_with(ResponseTemplate::new(200).set_body_json(sample_page_json()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = store_with_token(&dir, "tok-1").await;
        let client = FeedClient::new(
            format!("{}/feed", server.uri()),
            "vidwall-test".to_string(),
            store,
        )
        .unwrap();

        let page = client.fetch_page(200, None).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.cursor.as_deref(), Some("next-page"));

        let (creator, video) = convert_item(&page.items[0]).unwrap();
        assert_eq!(creator.id, "u1");
        assert!(creator.verified);
        assert_eq!(video.id, "p1");
        assert_eq!(video.media_url, "https://cdn.test/p1.mp4");
        assert_eq!(video.width, Some(1920));
    }

    #[tokio::test]
    async fn test_html_body_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html>Just a moment...</html>")
                    .insert_header("content-type", "text/html"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = store_with_token(&dir, "tok-1").await;
        let client = FeedClient::new(
            format!("{}/feed", server.uri()),
            "vidwall-test".to_string(),
            store,
        )
        .unwrap();

        let err = client.fetch_page(200, None).await.unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
    }

    #[tokio::test]
    async fn test_unauthorized_is_credentials_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = store_with_token(&dir, "stale").await;
        let client = FeedClient::new(
            format!("{}/feed", server.uri()),
            "vidwall-test".to_string(),
            store,
        )
        .unwrap();

        let err = client.fetch_page(200, None).await.unwrap_err();
        assert!(matches!(err, Error::Credentials(_)));
    }

    #[test]
    fn test_convert_item_without_media_is_none() {
        let item: FeedItem = serde_json::from_value(serde_json::json!({
            "post": {"id": "p2", "posted_at": 1700000001, "attachments": []},
            "profile": {"id": "u1", "username": "someone"}
        }))
        .unwrap();
        assert!(convert_item(&item).is_none());
    }
}

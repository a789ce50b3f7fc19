//! Azure Blob Storage backend.
//!
//! Lists, writes and deletes blobs in one container using the Blob REST API
//! with Shared Key authentication, and issues read-only service SAS URLs so
//! external services can fetch a single blob anonymously.
//!
//! Signing uses only `hmac`, `sha2` and `base64`; no Azure SDK.
//!
//! # Configuration
//!
//! ```toml
//! [storage]
//! account = "contracts"
//! container = "data"
//! # endpoint_url = "http://127.0.0.1:10000/devstoreaccount1"   # Azurite
//! ```
//!
//! # Environment Variables
//!
//! - `AZURE_STORAGE_CONNECTION_STRING`: `AccountName=...;AccountKey=...;...`
//! - `AZURE_STORAGE_ACCOUNT_KEY`: used with `storage.account` when no
//!   connection string is set

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::StorageConfig;
use crate::models::StoredObject;

use super::{BlobStore, Metadata};

type HmacSha256 = Hmac<Sha256>;

/// REST API version sent in `x-ms-version` and signed into SAS tokens.
const API_VERSION: &str = "2021-08-06";

/// Account credentials and endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AccountCredentials {
    account: String,
    key: String,
    endpoint: Option<String>,
}

impl AccountCredentials {
    fn from_env(storage: &StorageConfig) -> Result<Self> {
        if let Ok(conn) = std::env::var("AZURE_STORAGE_CONNECTION_STRING") {
            return parse_connection_string(&conn);
        }
        let account = storage.account.clone().context(
            "storage.account must be set when AZURE_STORAGE_CONNECTION_STRING is not",
        )?;
        let key = std::env::var("AZURE_STORAGE_ACCOUNT_KEY")
            .context("AZURE_STORAGE_ACCOUNT_KEY environment variable not set")?;
        Ok(Self {
            account,
            key,
            endpoint: None,
        })
    }
}

/// Parse `Key=Value;...` storage connection strings.
fn parse_connection_string(conn: &str) -> Result<AccountCredentials> {
    let fields: BTreeMap<&str, &str> = conn
        .split(';')
        .filter_map(|part| part.trim().split_once('='))
        .collect();

    let account = fields
        .get("AccountName")
        .context("connection string has no AccountName")?
        .to_string();
    let key = fields
        .get("AccountKey")
        .context("connection string has no AccountKey")?
        .to_string();

    let endpoint = match fields.get("BlobEndpoint") {
        Some(ep) => Some(ep.trim_end_matches('/').to_string()),
        None => {
            let protocol = fields.get("DefaultEndpointsProtocol").unwrap_or(&"https");
            let suffix = fields.get("EndpointSuffix").unwrap_or(&"core.windows.net");
            Some(format!("{}://{}.blob.{}", protocol, account, suffix))
        }
    };

    Ok(AccountCredentials {
        account,
        key,
        endpoint,
    })
}

/// A container in an Azure storage account.
pub struct AzureBlobStore {
    client: reqwest::Client,
    account: String,
    key: Vec<u8>,
    container: String,
    /// Service endpoint without trailing slash, e.g. `https://acct.blob.core.windows.net`.
    endpoint: String,
    /// Path component of `endpoint` (non-empty for path-style endpoints).
    endpoint_path: String,
}

impl AzureBlobStore {
    /// Create a store from configuration and environment credentials.
    pub fn new(storage: &StorageConfig, client: reqwest::Client) -> Result<Self> {
        let creds = AccountCredentials::from_env(storage)?;
        let endpoint = storage
            .endpoint_url
            .clone()
            .or(creds.endpoint)
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", creds.account));
        Self::from_parts(
            &creds.account,
            &creds.key,
            &storage.container,
            &endpoint,
            client,
        )
    }

    /// Create a store from explicit account name, base64 key, container and endpoint.
    pub fn from_parts(
        account: &str,
        key_base64: &str,
        container: &str,
        endpoint: &str,
        client: reqwest::Client,
    ) -> Result<Self> {
        let key = STANDARD
            .decode(key_base64.trim())
            .context("storage account key is not valid base64")?;
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let parsed = url::Url::parse(&endpoint)
            .with_context(|| format!("invalid blob endpoint: {}", endpoint))?;
        let endpoint_path = parsed.path().trim_end_matches('/').to_string();

        Ok(Self {
            client,
            account: account.to_string(),
            key,
            container: container.to_string(),
            endpoint,
            endpoint_path,
        })
    }

    fn encoded_blob_path(&self, name: &str) -> String {
        let encoded = name.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        format!("{}/{}", self.container, encoded)
    }

    fn blob_url(&self, name: &str) -> String {
        format!("{}/{}", self.endpoint, self.encoded_blob_path(name))
    }

    /// Build the `Authorization` header for a request.
    fn authorization(
        &self,
        verb: &str,
        encoded_path: &str,
        query: &[(String, String)],
        ms_headers: &[(String, String)],
        content_length: usize,
        content_type: &str,
    ) -> Result<String> {
        let resource = canonical_resource(
            &self.account,
            &format!("{}/{}", self.endpoint_path, encoded_path),
            query,
        );
        let to_sign = string_to_sign(verb, content_length, content_type, ms_headers, &resource);
        let signature = STANDARD.encode(hmac_sha256(&self.key, to_sign.as_bytes())?);
        Ok(format!("SharedKey {}:{}", self.account, signature))
    }

    fn base_headers() -> Vec<(String, String)> {
        vec![
            ("x-ms-date".to_string(), http_date(Utc::now())),
            ("x-ms-version".to_string(), API_VERSION.to_string()),
        ]
    }

    async fn list_page(
        &self,
        prefix: Option<&str>,
        marker: Option<&str>,
    ) -> Result<(Vec<StoredObject>, Option<String>)> {
        let mut query = vec![
            ("comp".to_string(), "list".to_string()),
            ("restype".to_string(), "container".to_string()),
        ];
        if let Some(p) = prefix.filter(|p| !p.is_empty()) {
            query.push(("prefix".to_string(), p.to_string()));
        }
        if let Some(m) = marker {
            query.push(("marker".to_string(), m.to_string()));
        }

        let headers = Self::base_headers();
        let auth = self.authorization("GET", &self.container, &query, &headers, 0, "")?;
        let query_string = query
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let url = format!("{}/{}?{}", self.endpoint, self.container, query_string);

        let mut req = self.client.get(&url).header("Authorization", auth);
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("Failed to list blobs in container {}", self.container))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "List Blobs failed (HTTP {}): {}",
                status,
                body.chars().take(500).collect::<String>()
            );
        }

        let xml = resp.text().await?;
        parse_list_blobs_response(&xml)
    }
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<StoredObject>> {
        let mut objects = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let (batch, next) = self.list_page(prefix, marker.as_deref()).await?;
            objects.extend(batch);
            match next {
                Some(m) if !m.is_empty() => marker = Some(m),
                _ => break,
            }
        }
        tracing::debug!(count = objects.len(), ?prefix, "listed blobs");
        Ok(objects)
    }

    async fn put(
        &self,
        name: &str,
        body: Vec<u8>,
        content_type: &str,
        metadata: &Metadata,
    ) -> Result<()> {
        let mut headers = Self::base_headers();
        headers.push(("x-ms-blob-type".to_string(), "BlockBlob".to_string()));
        for (k, v) in metadata {
            headers.push((format!("x-ms-meta-{}", k.to_ascii_lowercase()), v.clone()));
        }

        let path = self.encoded_blob_path(name);
        let auth = self.authorization("PUT", &path, &[], &headers, body.len(), content_type)?;

        let mut req = self
            .client
            .put(self.blob_url(name))
            .header("Authorization", auth)
            .header("Content-Type", content_type);
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to upload blob {}", name))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!(
                "Put Blob failed (HTTP {}) for '{}': {}",
                status,
                name,
                text.chars().take(500).collect::<String>()
            );
        }
        tracing::debug!(blob = name, "uploaded blob");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let headers = Self::base_headers();
        let path = self.encoded_blob_path(name);
        let auth = self.authorization("DELETE", &path, &[], &headers, 0, "")?;

        let mut req = self.client.delete(self.blob_url(name)).header("Authorization", auth);
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("Failed to delete blob {}", name))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!(blob = name, "blob already absent");
            return Ok(());
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!(
                "Delete Blob failed (HTTP {}) for '{}': {}",
                status,
                name,
                text.chars().take(500).collect::<String>()
            );
        }
        tracing::debug!(blob = name, "deleted blob");
        Ok(())
    }

    fn signed_read_url(&self, name: &str, ttl: Duration) -> Result<String> {
        let expiry = Utc::now() + chrono::Duration::from_std(ttl)?;
        let sas = self.read_sas(name, expiry)?;
        Ok(format!("{}?{}", self.blob_url(name), sas))
    }
}

impl AzureBlobStore {
    /// Service SAS query string granting read access to one blob until `expiry`.
    fn read_sas(&self, name: &str, expiry: DateTime<Utc>) -> Result<String> {
        let expiry = expiry.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let resource = format!("/blob/{}/{}/{}", self.account, self.container, name);
        // sp, st, se, resource, si, sip, spr, sv, sr, snapshot, ses,
        // rscc, rscd, rsce, rscl, rsct
        let to_sign = [
            "r",
            "",
            expiry.as_str(),
            resource.as_str(),
            "",
            "",
            "",
            API_VERSION,
            "b",
            "",
            "",
            "",
            "",
            "",
            "",
            "",
        ]
        .join("\n");
        let signature = STANDARD.encode(hmac_sha256(&self.key, to_sign.as_bytes())?);
        Ok(format!(
            "sv={}&sr=b&sp=r&se={}&sig={}",
            API_VERSION,
            uri_encode(&expiry),
            uri_encode(&signature)
        ))
    }
}

// ============ Shared Key Helpers ============

/// `CanonicalizedResource`: `/{account}{path}` followed by one
/// `\n{name}:{value}` line per query parameter, sorted by name.
fn canonical_resource(account: &str, path: &str, query: &[(String, String)]) -> String {
    let mut grouped: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for (k, v) in query {
        grouped.entry(k.to_ascii_lowercase()).or_default().push(v);
    }
    let mut out = format!("/{}{}", account, path);
    for (k, mut values) in grouped {
        values.sort_unstable();
        out.push_str(&format!("\n{}:{}", k, values.join(",")));
    }
    out
}

/// Shared Key string-to-sign for the blob service.
fn string_to_sign(
    verb: &str,
    content_length: usize,
    content_type: &str,
    ms_headers: &[(String, String)],
    canonical_resource: &str,
) -> String {
    let length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };
    // VERB, Content-Encoding, Content-Language, Content-Length, Content-MD5,
    // Content-Type, Date, If-Modified-Since, If-Match, If-None-Match,
    // If-Unmodified-Since, Range
    let standard = [
        verb,
        "",
        "",
        length.as_str(),
        "",
        content_type,
        "",
        "",
        "",
        "",
        "",
        "",
    ];

    let mut headers: Vec<(String, &str)> = ms_headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.trim()))
        .filter(|(k, _)| k.starts_with("x-ms-"))
        .collect();
    headers.sort_by(|a, b| a.0.cmp(&b.0));
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    let mut out = String::new();
    for field in standard {
        out.push_str(field);
        out.push('\n');
    }
    out.push_str(&canonical_headers);
    out.push_str(canonical_resource);
    out
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| anyhow::anyhow!("invalid HMAC key: {}", e))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// RFC 1123 date as required by `x-ms-date`.
fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// URI-encode a string per RFC 3986.
///
/// Encodes all characters except unreserved characters:
/// `A-Z a-z 0-9 - _ . ~`
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

// ============ XML Parsing ============

/// Parse a List Blobs response into objects and the next page marker.
fn parse_list_blobs_response(xml: &str) -> Result<(Vec<StoredObject>, Option<String>)> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut objects = Vec::new();
    let mut next_marker = None;
    let mut path: Vec<String> = Vec::new();
    let mut current: Option<StoredObject> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "Blob" {
                    current = Some(StoredObject { name: String::new() });
                }
                path.push(name);
            }
            Ok(Event::Text(te)) => {
                let text = te.unescape()?.into_owned();
                let depth = path.len();
                let leaf = path.last().map(String::as_str).unwrap_or("");
                let parent = if depth >= 2 { path[depth - 2].as_str() } else { "" };
                match (current.as_mut(), parent, leaf) {
                    (Some(obj), "Blob", "Name") => obj.name = text,
                    (None, "EnumerationResults", "NextMarker") => next_marker = Some(text),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"Blob" {
                    if let Some(obj) = current.take() {
                        if !obj.name.is_empty() {
                            objects.push(obj);
                        }
                    }
                }
                path.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => bail!("Invalid List Blobs response: {}", e),
            _ => {}
        }
    }

    Ok((objects, next_marker))
}

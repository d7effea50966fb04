/// Attachment object storage.
///
/// Clients upload attachments straight to an S3-compatible bucket through a
/// short-lived presigned URL; the server only signs and deletes. Requests
/// are signed with AWS Signature V4 using path-style addressing
/// (`{endpoint}/{bucket}/{key}`), which every S3-compatible provider accepts.
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

type HmacSha256 = Hmac<Sha256>;

/// Presigned upload URLs stay valid for six minutes.
pub const UPLOAD_URL_TTL: Duration = Duration::from_secs(360);

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const PUT_SIGNED_HEADERS: &str = "content-length;content-type;host";

/// Object storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    pub access_key_id: String,
    pub secret_access_key: String,
    /// S3 API endpoint, e.g. `https://s3.us-east-1.amazonaws.com`
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    /// Public base URL objects are served from
    pub public_url: String,
}

impl ObjectStoreConfig {
    /// Load from environment variables. `Ok(None)` when object storage is not
    /// configured at all; an error when it is only partly configured.
    pub fn from_env() -> Result<Option<Self>> {
        const KEYS: [&str; 6] = [
            "AWS_ACCESS_KEY_ID",
            "AWS_SECRET_ACCESS_KEY",
            "AWS_ENDPOINT_URL_S3",
            "AWS_REGION",
            "AWS_BUCKET_NAME",
            "AWS_BUCKET_URL",
        ];

        let values: Vec<Option<String>> = KEYS
            .iter()
            .map(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
            .collect();

        if values.iter().all(Option::is_none) {
            return Ok(None);
        }

        let missing: Vec<&str> = KEYS
            .iter()
            .zip(&values)
            .filter(|(_, value)| value.is_none())
            .map(|(key, _)| *key)
            .collect();
        if !missing.is_empty() {
            anyhow::bail!("object storage config incomplete, missing: {}", missing.join(", "));
        }

        let mut values = values.into_iter().flatten();
        let mut next = || values.next().unwrap_or_default();
        Ok(Some(Self {
            access_key_id: next(),
            secret_access_key: next(),
            endpoint: next(),
            region: next(),
            bucket: next(),
            public_url: next(),
        }))
    }
}

/// A signed upload target handed to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUpload {
    pub presigned_url: String,
    pub key: String,
    /// Where the object will be readable once uploaded.
    pub url: String,
}

/// The object a presigned PUT is allowed to create.
#[derive(Debug, Clone, Copy)]
pub struct UploadTarget<'a> {
    pub key: &'a str,
    pub content_type: &'a str,
    pub size: u64,
}

pub struct ObjectStore {
    config: ObjectStoreConfig,
    endpoint: Url,
    client: Client,
}

impl ObjectStore {
    pub fn new(config: ObjectStoreConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .with_context(|| format!("invalid object storage endpoint '{}'", config.endpoint))?;
        if endpoint.host_str().is_none() {
            anyhow::bail!("object storage endpoint '{}' has no host", config.endpoint);
        }
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            config,
            endpoint,
            client,
        })
    }

    /// Unique object key for an uploaded file.
    pub fn object_key(file_name: &str) -> String {
        let file_name = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
        format!("{}-{}", uuid::Uuid::new_v4(), file_name)
    }

    pub fn public_url(&self, key: &str) -> String {
        format!(
            "{}/{}",
            self.config.public_url.trim_end_matches('/'),
            uri_encode(key, false)
        )
    }

    pub fn presign_upload(&self, file_name: &str, content_type: &str, size: u64) -> Result<PresignedUpload> {
        let key = Self::object_key(file_name);
        let upload = UploadTarget {
            key: &key,
            content_type,
            size,
        };
        let presigned_url = self.presign_put(&upload, UPLOAD_URL_TTL, Utc::now())?;
        Ok(PresignedUpload {
            url: self.public_url(&key),
            presigned_url,
            key,
        })
    }

    /// Query-string presigned PUT URL. The content type and length are
    /// signed, so the upload must send exactly those headers.
    pub fn presign_put(
        &self,
        upload: &UploadTarget<'_>,
        expires: Duration,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let scope = self.credential_scope(&now);
        let path = self.object_path(upload.key);
        let host = self.host();
        let content_type = upload.content_type.trim();

        let credential = format!("{}/{}", self.config.access_key_id, scope);
        let query = [
            ("X-Amz-Algorithm", ALGORITHM.to_string()),
            ("X-Amz-Credential", credential),
            ("X-Amz-Date", amz_date.clone()),
            ("X-Amz-Expires", expires.as_secs().to_string()),
            ("X-Amz-SignedHeaders", PUT_SIGNED_HEADERS.to_string()),
        ]
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k, true), uri_encode(v, true)))
        .collect::<Vec<_>>()
        .join("&");

        let canonical_request = format!(
            "PUT\n{path}\n{query}\ncontent-length:{}\ncontent-type:{content_type}\nhost:{host}\n\n{PUT_SIGNED_HEADERS}\n{UNSIGNED_PAYLOAD}",
            upload.size
        );
        let signature = self.sign(&canonical_request, &amz_date, &scope, &now)?;

        Ok(format!(
            "{}{}?{}&X-Amz-Signature={}",
            self.origin(),
            path,
            query,
            signature
        ))
    }

    pub async fn delete_object(&self, key: &str) -> Result<()> {
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let scope = self.credential_scope(&now);
        let path = self.object_path(key);
        let host = self.host();
        let payload_hash = hex::encode(Sha256::digest(b""));

        let signed_headers = "host;x-amz-content-sha256;x-amz-date";
        let canonical_request = format!(
            "DELETE\n{path}\n\nhost:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n\n{signed_headers}\n{payload_hash}"
        );
        let signature = self.sign(&canonical_request, &amz_date, &scope, &now)?;
        let authorization = format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.config.access_key_id
        );

        let response = self
            .client
            .delete(format!("{}{}", self.origin(), path))
            .header(header::AUTHORIZATION, authorization)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date)
            .send()
            .await
            .context("object storage connection failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("object delete failed: {} - {}", status, body);
        }

        tracing::info!(key, "deleted attachment object");
        Ok(())
    }

    fn credential_scope(&self, now: &DateTime<Utc>) -> String {
        format!(
            "{}/{}/{}/aws4_request",
            now.format("%Y%m%d"),
            self.config.region,
            SERVICE
        )
    }

    fn object_path(&self, key: &str) -> String {
        let base = self.endpoint.path().trim_end_matches('/');
        format!(
            "{}/{}/{}",
            base,
            uri_encode(&self.config.bucket, false),
            uri_encode(key, false)
        )
    }

    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    fn origin(&self) -> String {
        format!("{}://{}", self.endpoint.scheme(), self.host())
    }

    fn sign(
        &self,
        canonical_request: &str,
        amz_date: &str,
        scope: &str,
        now: &DateTime<Utc>,
    ) -> Result<String> {
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let secret = format!("AWS4{}", self.config.secret_access_key);
        let date = now.format("%Y%m%d").to_string();
        let k_date = hmac_sha256(secret.as_bytes(), date.as_bytes())?;
        let k_region = hmac_sha256(&k_date, self.config.region.as_bytes())?;
        let k_service = hmac_sha256(&k_region, SERVICE.as_bytes())?;
        let k_signing = hmac_sha256(&k_service, b"aws4_request")?;

        Ok(hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).context("invalid HMAC key")?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// SigV4 URI encoding: everything but unreserved characters is
/// percent-encoded; `/` is kept in paths.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

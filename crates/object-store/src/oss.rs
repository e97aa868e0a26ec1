//! Alibaba Cloud OSS adapter.
//!
//! Implements [`ObjectStore`] over the OSS REST API with V1 header signing:
//! `Authorization: OSS <AccessKeyId>:<base64(hmac-sha1(secret, string-to-sign))>`.
//! Credentials are treated as an opaque signing capability; token issuance
//! is out of scope.

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::Utc;
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderValue};
use sha1::Sha1;
use tracing::debug;

use crate::{BackendError, CompletedPart, ErrorKind, ObjectEntry, ObjectMeta, ObjectStore};

/// Header OSS uses to report the whole-object CRC-64/XZ.
const CRC64_HEADER: &str = "x-oss-hash-crc64ecma";

/// Characters kept verbatim when encoding an object key into a URL path.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

/// Characters kept verbatim when encoding a query value.
const QUERY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Connection settings for one OSS bucket.
#[derive(Debug, Clone)]
pub struct OssConfig {
    /// Endpoint host without scheme or bucket, e.g. `oss-cn-hangzhou.aliyuncs.com`.
    pub endpoint: String,
    pub bucket: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    /// Use HTTPS (default true).
    pub secure: bool,
}

impl OssConfig {
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        access_key_id: impl Into<String>,
        access_key_secret: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            access_key_id: access_key_id.into(),
            access_key_secret: access_key_secret.into(),
            secure: true,
        }
    }
}

/// [`ObjectStore`] implementation for Alibaba Cloud OSS.
pub struct OssStore {
    config: OssConfig,
    client: reqwest::Client,
}

impl OssStore {
    pub fn new(config: OssConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| BackendError::other(format!("http client init failed: {e}")))?;
        Ok(Self { config, client })
    }

    fn scheme(&self) -> &'static str {
        if self.config.secure { "https" } else { "http" }
    }

    fn host(&self) -> String {
        format!("{}.{}", self.config.bucket, self.config.endpoint)
    }

    fn object_url(&self, key: &str, subresource: &str) -> String {
        let encoded = utf8_percent_encode(key, KEY_ENCODE_SET);
        format!("{}://{}/{}{}", self.scheme(), self.host(), encoded, subresource)
    }

    /// Signs `string_to_sign` with the bucket secret.
    fn sign(&self, string_to_sign: &str) -> String {
        // new_from_slice only fails on invalid key lengths; HMAC accepts any.
        let mut mac = Hmac::<Sha1>::new_from_slice(self.config.access_key_secret.as_bytes())
            .expect("hmac accepts keys of any length");
        mac.update(string_to_sign.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    fn authorization(&self, verb: &Method, date: &str, resource: &str) -> String {
        let string_to_sign = format!("{verb}\n\n\n{date}\n{resource}");
        format!(
            "OSS {}:{}",
            self.config.access_key_id,
            self.sign(&string_to_sign)
        )
    }

    /// Canonicalized resource for header signing: `/bucket/key` plus any
    /// signed subresource (already `?`-prefixed, parameters sorted).
    fn canonical_resource(&self, key: &str, subresource: &str) -> String {
        format!("/{}/{}{}", self.config.bucket, key, subresource)
    }

    async fn send(
        &self,
        method: Method,
        key: &str,
        subresource: &str,
        body: Option<Vec<u8>>,
        extra_headers: HeaderMap,
    ) -> Result<reqwest::Response, BackendError> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let resource = self.canonical_resource(key, subresource);
        let auth = self.authorization(&method, &date, &resource);
        let url = self.object_url(key, subresource);

        debug!(%method, key, subresource, "oss request");

        let mut req = self
            .client
            .request(method, &url)
            .header("Date", date)
            .header("Authorization", auth)
            .headers(extra_headers);
        if let Some(body) = body {
            req = req.body(body);
        }

        let resp = req.send().await.map_err(map_reqwest_error)?;
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(map_status(status, &body))
    }
}

#[async_trait]
impl ObjectStore for OssStore {
    async fn init_multipart(&self, key: &str) -> Result<String, BackendError> {
        let resp = self
            .send(Method::POST, key, "?uploads", None, HeaderMap::new())
            .await?;
        let body = resp
            .text()
            .await
            .map_err(|e| BackendError::transient(format!("reading init response: {e}")))?;
        xml_text(&body, "UploadId")
            .map(str::to_owned)
            .ok_or_else(|| BackendError::other("init response missing UploadId"))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<String, BackendError> {
        let sub = format!("?partNumber={part_number}&uploadId={upload_id}");
        let resp = self
            .send(Method::PUT, key, &sub, Some(data), HeaderMap::new())
            .await?;
        header_str(resp.headers(), "ETag")
            .map(|t| t.trim_matches('"').to_owned())
            .ok_or_else(|| BackendError::other("part response missing ETag"))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectMeta, BackendError> {
        let mut body = String::from("<CompleteMultipartUpload>");
        for p in parts {
            body.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>\"{}\"</ETag></Part>",
                p.number, p.etag
            ));
        }
        body.push_str("</CompleteMultipartUpload>");

        let sub = format!("?uploadId={upload_id}");
        let resp = self
            .send(
                Method::POST,
                key,
                &sub,
                Some(body.into_bytes()),
                HeaderMap::new(),
            )
            .await?;

        Ok(ObjectMeta {
            size: 0, // complete response carries no size; callers head when needed
            etag: header_str(resp.headers(), "ETag").map(|t| t.trim_matches('"').to_owned()),
            crc64: header_str(resp.headers(), CRC64_HEADER).and_then(|v| v.parse().ok()),
        })
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), BackendError> {
        let sub = format!("?uploadId={upload_id}");
        self.send(Method::DELETE, key, &sub, None, HeaderMap::new())
            .await?;
        Ok(())
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMeta, BackendError> {
        let resp = self
            .send(Method::HEAD, key, "", None, HeaderMap::new())
            .await?;
        let headers = resp.headers();
        let size = header_str(headers, "Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(ObjectMeta {
            size,
            etag: header_str(headers, "ETag").map(|t| t.trim_matches('"').to_owned()),
            crc64: header_str(headers, CRC64_HEADER).and_then(|v| v.parse().ok()),
        })
    }

    async fn get_object_range(
        &self,
        key: &str,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, BackendError> {
        let mut headers = HeaderMap::new();
        let range = format!("bytes={}-{}", offset, offset + len - 1);
        headers.insert(
            "Range",
            HeaderValue::from_str(&range)
                .map_err(|e| BackendError::other(format!("invalid range header: {e}")))?,
        );
        let resp = self.send(Method::GET, key, "", None, headers).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| BackendError::transient(format!("reading range body: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn put_object(&self, key: &str, data: Vec<u8>) -> Result<ObjectMeta, BackendError> {
        let size = data.len() as u64;
        let resp = self
            .send(Method::PUT, key, "", Some(data), HeaderMap::new())
            .await?;
        Ok(ObjectMeta {
            size,
            etag: header_str(resp.headers(), "ETag").map(|t| t.trim_matches('"').to_owned()),
            crc64: header_str(resp.headers(), CRC64_HEADER).and_then(|v| v.parse().ok()),
        })
    }

    async fn delete_object(&self, key: &str) -> Result<(), BackendError> {
        // OSS returns 204 whether or not the key existed.
        self.send(Method::DELETE, key, "", None, HeaderMap::new())
            .await?;
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, BackendError> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let resource = format!("/{}/", self.config.bucket);
        let auth = self.authorization(&Method::GET, &date, &resource);
        let url = format!(
            "{}://{}/?prefix={}&max-keys=1000",
            self.scheme(),
            self.host(),
            utf8_percent_encode(prefix, QUERY_ENCODE_SET)
        );

        let resp = self
            .client
            .get(&url)
            .header("Date", date)
            .header("Authorization", auth)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| BackendError::transient(format!("reading list response: {e}")))?;

        let mut entries = Vec::new();
        for block in xml_blocks(&body, "Contents") {
            let Some(key) = xml_text(block, "Key") else {
                continue;
            };
            let size = xml_text(block, "Size")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let last_modified = xml_text(block, "LastModified")
                .and_then(|s| s.parse::<chrono::DateTime<chrono::Utc>>().ok());
            entries.push(ObjectEntry {
                key: key.to_owned(),
                size,
                last_modified,
            });
        }
        Ok(entries)
    }

    fn sign_url(&self, key: &str, expires_in: Duration) -> Result<String, BackendError> {
        let expires = Utc::now().timestamp() + expires_in.as_secs() as i64;
        Ok(self.sign_url_at(key, expires))
    }
}

impl OssStore {
    /// Query-signed GET URL expiring at the given unix timestamp.
    fn sign_url_at(&self, key: &str, expires: i64) -> String {
        let resource = self.canonical_resource(key, "");
        let string_to_sign = format!("GET\n\n\n{expires}\n{resource}");
        let signature = self.sign(&string_to_sign);
        format!(
            "{}://{}/{}?OSSAccessKeyId={}&Expires={}&Signature={}",
            self.scheme(),
            self.host(),
            utf8_percent_encode(key, KEY_ENCODE_SET),
            self.config.access_key_id,
            expires,
            utf8_percent_encode(&signature, QUERY_ENCODE_SET),
        )
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn map_reqwest_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() || e.is_connect() {
        BackendError::transient(format!("network error: {e}"))
    } else {
        BackendError::other(format!("request error: {e}"))
    }
}

fn map_status(status: reqwest::StatusCode, body: &str) -> BackendError {
    let detail = xml_text(body, "Message")
        .or_else(|| xml_text(body, "Code"))
        .unwrap_or("no detail");
    let message = format!("oss returned {status}: {detail}");
    let kind = match status.as_u16() {
        404 => ErrorKind::NotFound,
        401 | 403 => ErrorKind::Forbidden,
        408 | 429 => ErrorKind::Transient,
        s if s >= 500 => ErrorKind::Transient,
        _ => ErrorKind::Other,
    };
    BackendError { kind, message }
}

/// Extracts the text of the first `<tag>..</tag>` element.
///
/// The handful of fields we read from OSS responses (`UploadId`, listing
/// entries, error `Code`/`Message`) never contain nested markup, so a tag
/// scan suffices and keeps the dependency surface flat.
fn xml_text<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(&body[start..end])
}

/// Returns the inner text of every `<tag>..</tag>` block.
fn xml_blocks<'a>(body: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut blocks = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else { break };
        blocks.push(&after[..end]);
        rest = &after[end + close.len()..];
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> OssStore {
        OssStore::new(OssConfig::new(
            "oss-cn-hangzhou.aliyuncs.com",
            "examplebucket",
            "AKIDEXAMPLE",
            "secret",
        ))
        .unwrap()
    }

    #[test]
    fn canonical_resource_includes_bucket_and_subresource() {
        let store = test_store();
        assert_eq!(
            store.canonical_resource("bt_backup/site/a.tar.gz", "?uploads"),
            "/examplebucket/bt_backup/site/a.tar.gz?uploads"
        );
    }

    #[test]
    fn object_url_encodes_key_but_keeps_slashes() {
        let store = test_store();
        let url = store.object_url("dir/file name.tar.gz", "");
        assert_eq!(
            url,
            "https://examplebucket.oss-cn-hangzhou.aliyuncs.com/dir/file%20name.tar.gz"
        );
    }

    #[test]
    fn signing_is_deterministic_and_key_sensitive() {
        let store = test_store();
        let a = store.sign("GET\n\n\nWed, 01 Jan 2025 00:00:00 GMT\n/b/k");
        let b = store.sign("GET\n\n\nWed, 01 Jan 2025 00:00:00 GMT\n/b/k");
        assert_eq!(a, b);

        let other = OssStore::new(OssConfig::new(
            "oss-cn-hangzhou.aliyuncs.com",
            "examplebucket",
            "AKIDEXAMPLE",
            "other-secret",
        ))
        .unwrap();
        assert_ne!(a, other.sign("GET\n\n\nWed, 01 Jan 2025 00:00:00 GMT\n/b/k"));
    }

    #[test]
    fn signed_url_carries_query_credentials() {
        let store = test_store();
        let url = store.sign_url_at("backup/db_x.sql.gz", 1_900_000_000);
        assert!(url.starts_with(
            "https://examplebucket.oss-cn-hangzhou.aliyuncs.com/backup/db_x.sql.gz?"
        ));
        assert!(url.contains("OSSAccessKeyId=AKIDEXAMPLE"));
        assert!(url.contains("Expires=1900000000"));
        assert!(url.contains("Signature="));
        // The base64 signature must be percent-encoded: no raw '+' survives.
        let sig = url.split("Signature=").nth(1).unwrap();
        assert!(!sig.contains('+'));
    }

    #[test]
    fn xml_text_extracts_first_element() {
        let body = "<InitiateMultipartUploadResult><Bucket>b</Bucket>\
                    <Key>k</Key><UploadId>0004B9894A22E5B1888A1E29F823</UploadId>\
                    </InitiateMultipartUploadResult>";
        assert_eq!(xml_text(body, "UploadId"), Some("0004B9894A22E5B1888A1E29F823"));
        assert_eq!(xml_text(body, "Missing"), None);
    }

    #[test]
    fn xml_blocks_returns_every_entry() {
        let body = "<ListBucketResult>\
                    <Contents><Key>a</Key><Size>1</Size></Contents>\
                    <Contents><Key>b</Key><Size>2</Size></Contents>\
                    </ListBucketResult>";
        let blocks = xml_blocks(body, "Contents");
        assert_eq!(blocks.len(), 2);
        assert_eq!(xml_text(blocks[0], "Key"), Some("a"));
        assert_eq!(xml_text(blocks[1], "Size"), Some("2"));
    }

    #[test]
    fn status_mapping_follows_error_taxonomy() {
        use reqwest::StatusCode;
        assert_eq!(map_status(StatusCode::NOT_FOUND, "").kind, ErrorKind::NotFound);
        assert_eq!(map_status(StatusCode::FORBIDDEN, "").kind, ErrorKind::Forbidden);
        assert_eq!(
            map_status(StatusCode::INTERNAL_SERVER_ERROR, "").kind,
            ErrorKind::Transient
        );
        assert_eq!(
            map_status(StatusCode::TOO_MANY_REQUESTS, "").kind,
            ErrorKind::Transient
        );
        assert_eq!(map_status(StatusCode::CONFLICT, "").kind, ErrorKind::Other);
    }

    #[test]
    fn status_mapping_extracts_oss_error_message() {
        let body = "<Error><Code>NoSuchKey</Code><Message>The specified key does not exist.</Message></Error>";
        let err = map_status(reqwest::StatusCode::NOT_FOUND, body);
        assert!(err.message.contains("The specified key does not exist."));
    }
}

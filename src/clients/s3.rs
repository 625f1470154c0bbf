//! S3-compatible [`ObjectStore`] over plain signed REST.
//!
//! Requests are signed with Signature V4 (path-style addressing) so the
//! per-part `x-amz-checksum-sha256` header stays under our control — the
//! whole point of the engine's checksum discipline.  A custom endpoint
//! turns this into a MinIO/R2 client unchanged.

use std::io::Read;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::Method;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{CompletedPart, MultipartUpload, ObjectStore, RemoteObject, UploadRequest};
use crate::error::{Error, Result};
use crate::hash;

type HmacSha256 = Hmac<Sha256>;

/// Hex SHA-256 of the empty payload, per the SigV4 specification.
const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Everything except unreserved characters gets percent-encoded.
const STRICT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

pub struct S3Client {
    http:        Client,
    region:      String,
    access_key:  String,
    secret_key:  String,
    /// `https://host` without a trailing slash; derived from the region
    /// unless overridden for S3-compatible stores.
    endpoint:    String,
    host:        String,
    max_retries: u32,
}

impl S3Client {
    pub fn new(
        access_key: &str,
        secret_key: &str,
        region: &str,
        endpoint: Option<&str>,
        max_retries: u32,
    ) -> Result<Self> {
        let endpoint = endpoint
            .map(|e| e.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("https://s3.{region}.amazonaws.com"));
        let host = endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string();

        let http = Client::builder()
            .timeout(Duration::from_secs(2 * 60 * 60))
            .build()?;

        Ok(S3Client {
            http,
            region: region.to_string(),
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            endpoint,
            host,
            max_retries: max_retries.max(1),
        })
    }

    // ── SigV4 ────────────────────────────────────────────────────────────────

    /// Sign and dispatch one request.  `query` must be pre-sorted by key;
    /// `amz_headers` are lowercase `x-amz-*`/`content-type` pairs that end
    /// up both on the wire and in the signature.
    fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        amz_headers: &[(&str, String)],
        payload_sha256_hex: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        let now: DateTime<Utc> = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let canonical_uri: String = path
            .split('/')
            .map(|seg| percent_encode(seg.as_bytes(), STRICT).to_string())
            .collect::<Vec<_>>()
            .join("/");
        let canonical_query = query
            .iter()
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    percent_encode(k.as_bytes(), STRICT),
                    percent_encode(v.as_bytes(), STRICT)
                )
            })
            .collect::<Vec<_>>()
            .join("&");

        // host + x-amz-content-sha256 + x-amz-date always; callers add the rest.
        let mut signed: Vec<(String, String)> = vec![
            ("host".into(), self.host.clone()),
            ("x-amz-content-sha256".into(), payload_sha256_hex.to_string()),
            ("x-amz-date".into(), amz_date.clone()),
        ];
        for (k, v) in amz_headers {
            signed.push((k.to_string(), v.trim().to_string()));
        }
        signed.sort();

        let canonical_headers: String =
            signed.iter().map(|(k, v)| format!("{k}:{v}\n")).collect();
        let signed_names =
            signed.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>().join(";");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_query,
            canonical_headers,
            signed_names,
            payload_sha256_hex
        );

        let scope = format!("{date}/{}/s3/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let k_date = hmac_sha256(format!("AWS4{}", self.secret_key).as_bytes(), date.as_bytes())?;
        let k_region = hmac_sha256(&k_date, self.region.as_bytes())?;
        let k_service = hmac_sha256(&k_region, b"s3")?;
        let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
        let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?);

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_names}, Signature={signature}",
            self.access_key
        );

        let url = if canonical_query.is_empty() {
            format!("{}{canonical_uri}", self.endpoint)
        } else {
            format!("{}{canonical_uri}?{canonical_query}", self.endpoint)
        };

        let mut req: RequestBuilder = self
            .http
            .request(method, &url)
            .header("authorization", authorization)
            .header("x-amz-content-sha256", payload_sha256_hex)
            .header("x-amz-date", amz_date);
        for (k, v) in amz_headers {
            req = req.header(*k, v.as_str());
        }
        if let Some(body) = body {
            req = req.body(body);
        }
        Ok(req.send()?)
    }

    fn check(resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().unwrap_or_default();
        Err(Error::RemoteRejected { status: status.as_u16(), body })
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::State(format!("hmac key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

// ── XML response shapes ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct InitiateMultipartUploadResult {
    #[serde(rename = "Bucket")]
    bucket: String,
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "UploadId")]
    upload_id: String,
}

#[derive(Deserialize)]
struct ListMultipartUploadsResult {
    #[serde(rename = "Upload", default)]
    uploads: Vec<UploadEntry>,
}

#[derive(Deserialize)]
struct UploadEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "UploadId")]
    upload_id: String,
    #[serde(rename = "Initiated")]
    initiated: Option<String>,
}

// ── ObjectStore impl ─────────────────────────────────────────────────────────

impl ObjectStore for S3Client {
    fn head(&self, bucket: &str, key: &str) -> Result<Option<RemoteObject>> {
        let resp = self.send(
            Method::HEAD,
            &format!("/{bucket}/{key}"),
            &[],
            &[("x-amz-checksum-mode", "ENABLED".to_string())],
            EMPTY_PAYLOAD_SHA256,
            None,
        )?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let resp = Self::check(resp)?;

        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let size = header("content-length").parse::<i64>().unwrap_or(0);
        Ok(Some(RemoteObject { size, checksum_sha256: header("x-amz-checksum-sha256") }))
    }

    fn put(
        &self,
        bucket: &str,
        key: &str,
        body: &[u8],
        checksum: &str,
        content_type: &str,
        storage_class: &str,
    ) -> Result<()> {
        let payload_hex = hex::encode(hash::hash_bytes(body));
        let mut headers = vec![
            ("content-type", content_type.to_string()),
            ("x-amz-checksum-sha256", checksum.to_string()),
        ];
        if !storage_class.is_empty() {
            headers.push(("x-amz-storage-class", storage_class.to_string()));
        }
        headers.sort();

        let resp = self.send(
            Method::PUT,
            &format!("/{bucket}/{key}"),
            &[],
            &headers,
            &payload_hex,
            Some(body.to_vec()),
        )?;
        Self::check(resp)?;
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Box<dyn Read>> {
        let resp = self.send(
            Method::GET,
            &format!("/{bucket}/{key}"),
            &[],
            &[],
            EMPTY_PAYLOAD_SHA256,
            None,
        )?;
        let resp = Self::check(resp)?;
        Ok(Box::new(resp))
    }

    fn create_multipart(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        storage_class: &str,
    ) -> Result<UploadRequest> {
        let mut headers = vec![
            ("content-type", content_type.to_string()),
            ("x-amz-checksum-algorithm", "SHA256".to_string()),
        ];
        if !storage_class.is_empty() {
            headers.push(("x-amz-storage-class", storage_class.to_string()));
        }
        headers.sort();

        let resp = self.send(
            Method::POST,
            &format!("/{bucket}/{key}"),
            &[("uploads", "")],
            &headers,
            EMPTY_PAYLOAD_SHA256,
            None,
        )?;
        let text = Self::check(resp)?.text()?;
        let parsed: InitiateMultipartUploadResult = quick_xml::de::from_str(&text)
            .map_err(|e| Error::State(format!("bad CreateMultipartUpload reply: {e}")))?;
        log::debug!("created multipart upload {} for {}/{}", parsed.upload_id, bucket, key);

        Ok(UploadRequest {
            bucket:    parsed.bucket,
            key:       parsed.key,
            upload_id: parsed.upload_id,
        })
    }

    fn upload_part(
        &self,
        request: &UploadRequest,
        part_no: i64,
        body: &[u8],
        checksum: &str,
    ) -> Result<String> {
        let payload_hex = hex::encode(hash::hash_bytes(body));
        let part_no_s = part_no.to_string();
        let query = [("partNumber", part_no_s.as_str()), ("uploadId", request.upload_id.as_str())];
        let headers = [("x-amz-checksum-sha256", checksum.to_string())];

        let mut last_err = None;
        for attempt in 1..=self.max_retries {
            log::debug!(
                "uploading part {part_no} of {} (attempt {attempt}/{})",
                request.key,
                self.max_retries
            );
            let sent = self
                .send(
                    Method::PUT,
                    &format!("/{}/{}", request.bucket, request.key),
                    &query,
                    &headers,
                    &payload_hex,
                    Some(body.to_vec()),
                )
                .and_then(Self::check);
            match sent {
                Ok(resp) => {
                    let etag = resp
                        .headers()
                        .get("etag")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .trim_matches('"')
                        .to_string();
                    return Ok(etag);
                }
                Err(e) => {
                    log::warn!("part {part_no} attempt {attempt} failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::State("no upload attempt made".into())))
    }

    fn complete(
        &self,
        request: &UploadRequest,
        parts: &[CompletedPart],
        checksum: &str,
    ) -> Result<()> {
        let mut xml = String::from("<CompleteMultipartUpload>");
        for p in parts {
            xml.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag><ChecksumSHA256>{}</ChecksumSHA256></Part>",
                p.part_no,
                xml_escape(&p.etag),
                xml_escape(&p.checksum)
            ));
        }
        xml.push_str("</CompleteMultipartUpload>");
        let body = xml.into_bytes();
        let payload_hex = hex::encode(hash::hash_bytes(&body));

        let resp = self.send(
            Method::POST,
            &format!("/{}/{}", request.bucket, request.key),
            &[("uploadId", request.upload_id.as_str())],
            &[("x-amz-checksum-sha256", checksum.to_string())],
            &payload_hex,
            Some(body),
        )?;
        let resp = Self::check(resp)?;

        // S3 reports some completion failures inside a 200 body.
        let text = resp.text()?;
        if text.contains("<Error>") {
            return Err(Error::RemoteRejected { status: 200, body: text });
        }
        Ok(())
    }

    fn abort(&self, request: &UploadRequest) -> Result<()> {
        log::info!("aborting multipart upload {} of {}", request.upload_id, request.key);
        let resp = self.send(
            Method::DELETE,
            &format!("/{}/{}", request.bucket, request.key),
            &[("uploadId", request.upload_id.as_str())],
            &[],
            EMPTY_PAYLOAD_SHA256,
            None,
        )?;
        Self::check(resp)?;
        Ok(())
    }

    fn list_multipart(&self, bucket: &str) -> Result<Vec<MultipartUpload>> {
        let resp = self.send(
            Method::GET,
            &format!("/{bucket}"),
            &[("uploads", "")],
            &[],
            EMPTY_PAYLOAD_SHA256,
            None,
        )?;
        let text = Self::check(resp)?.text()?;
        let parsed: ListMultipartUploadsResult = quick_xml::de::from_str(&text)
            .map_err(|e| Error::State(format!("bad ListMultipartUploads reply: {e}")))?;

        Ok(parsed
            .uploads
            .into_iter()
            .map(|u| MultipartUpload {
                key:       u.key,
                upload_id: u.upload_id,
                initiated: u
                    .initiated
                    .and_then(|t| t.parse::<DateTime<Utc>>().ok()),
            })
            .collect())
    }
}

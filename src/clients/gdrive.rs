//! Google Drive v3 [`DocStore`] implementation.
//!
//! Auth state lives in two JSON files: the OAuth client credentials
//! (`credentials.json`, "installed app" shape) and the token file written
//! by `lomob util gcloud-auth`.  Before every call the token expiry is
//! checked and refreshed through the refresh-token grant when past due.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::{Body, Client};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{DocStore, RemoteEntry, Upload};
use crate::error::{Error, Result};

const API: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_API: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const SCOPE: &str = "https://www.googleapis.com/auth/drive";

// ── Auth files ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CredFile {
    installed: CredEntry,
}

#[derive(Deserialize)]
struct CredEntry {
    client_id:     String,
    client_secret: String,
    auth_uri:      String,
    token_uri:     String,
}

#[derive(Serialize, Deserialize, Clone)]
struct Token {
    access_token:  String,
    refresh_token: String,
    #[serde(default)]
    token_type:    String,
    expiry:        DateTime<Utc>,
}

fn read_creds(path: &Path) -> Result<CredEntry> {
    let raw = fs::read_to_string(path)?;
    let cred: CredFile = serde_json::from_str(&raw)
        .map_err(|e| Error::UserInput(format!("bad credentials file {}: {e}", path.display())))?;
    Ok(cred.installed)
}

fn read_token(path: &Path) -> Result<Token> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| Error::UserInput(format!("bad token file {}: {e}", path.display())))
}

#[derive(Deserialize)]
struct TokenReply {
    access_token: String,
    expires_in:   i64,
    #[serde(default)]
    refresh_token: String,
}

/// Consent URL for the out-of-band authorization flow.
pub fn consent_url(cred_path: &Path) -> Result<String> {
    let cred = read_creds(cred_path)?;
    Ok(format!(
        "{}?client_id={}&redirect_uri=urn:ietf:wg:oauth:2.0:oob&response_type=code&scope={}&access_type=offline",
        cred.auth_uri, cred.client_id, SCOPE
    ))
}

/// Exchange a pasted authorization code for tokens and persist them.
pub fn exchange_code(cred_path: &Path, token_path: &Path, code: &str) -> Result<()> {
    let cred = read_creds(cred_path)?;
    let http = Client::new();
    let resp = http
        .post(&cred.token_uri)
        .form(&[
            ("client_id", cred.client_id.as_str()),
            ("client_secret", cred.client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", "urn:ietf:wg:oauth:2.0:oob"),
        ])
        .send()?;
    let reply: TokenReply = check(resp)?.json()?;

    write_token(
        token_path,
        &Token {
            access_token:  reply.access_token,
            refresh_token: reply.refresh_token,
            token_type:    "Bearer".into(),
            expiry:        Utc::now() + chrono::Duration::seconds(reply.expires_in),
        },
    )
}

fn write_token(path: &Path, token: &Token) -> Result<()> {
    let raw = serde_json::to_string_pretty(token)
        .map_err(|e| Error::State(format!("encode token: {e}")))?;
    fs::write(path, raw)?;
    Ok(())
}

fn check(resp: reqwest::blocking::Response) -> Result<reqwest::blocking::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().unwrap_or_default();
    Err(Error::RemoteRejected { status: status.as_u16(), body })
}

// ── Client ───────────────────────────────────────────────────────────────────

pub struct DriveClient {
    http:       Client,
    cred:       CredEntry,
    token:      Token,
    token_path: PathBuf,
}

impl DriveClient {
    pub fn new(cred_path: &Path, token_path: &Path) -> Result<Self> {
        Ok(DriveClient {
            http:       Client::builder().timeout(Duration::from_secs(2 * 60 * 60)).build()?,
            cred:       read_creds(cred_path)?,
            token:      read_token(token_path)?,
            token_path: token_path.to_path_buf(),
        })
    }

    /// Refresh the access token when it is (about to be) expired.
    pub fn ensure_token(&mut self) -> Result<()> {
        if self.token.expiry > Utc::now() + chrono::Duration::seconds(60) {
            return Ok(());
        }
        log::info!("access token expired, refreshing");
        let resp = self
            .http
            .post(&self.cred.token_uri)
            .form(&[
                ("client_id", self.cred.client_id.as_str()),
                ("client_secret", self.cred.client_secret.as_str()),
                ("refresh_token", self.token.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()?;
        let reply: TokenReply = check(resp)?.json()?;

        self.token.access_token = reply.access_token;
        self.token.expiry = Utc::now() + chrono::Duration::seconds(reply.expires_in);
        write_token(&self.token_path, &self.token)
    }

    /// Refresh unconditionally (the `gcloud-auth-refresh` verb).
    pub fn force_refresh(&mut self) -> Result<()> {
        self.token.expiry = Utc::now() - chrono::Duration::seconds(1);
        self.ensure_token()
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token.access_token)
    }

    /// Create a folder or a file under `parent`; returns the new id.
    fn create(
        &mut self,
        name: &str,
        parent: Option<&str>,
        item: Upload,
        mod_time: Option<DateTime<Utc>>,
    ) -> Result<String> {
        self.ensure_token()?;

        let mut meta = json!({ "name": name });
        if let Some(p) = parent {
            meta["parents"] = json!([p]);
        }
        if let Some(t) = mod_time {
            meta["modifiedTime"] = json!(t.to_rfc3339());
        }

        match item {
            Upload::Folder => {
                meta["mimeType"] = json!(FOLDER_MIME);
                let resp = self
                    .http
                    .post(format!("{API}/files"))
                    .header("authorization", self.bearer())
                    .json(&meta)
                    .send()?;
                let created: IdReply = check(resp)?.json()?;
                Ok(created.id)
            }
            Upload::File(body) => {
                // Resumable upload: metadata first, then the byte stream to
                // the session URL from the Location header.
                let resp = self
                    .http
                    .post(format!("{UPLOAD_API}/files?uploadType=resumable"))
                    .header("authorization", self.bearer())
                    .header("x-upload-content-type", "application/octet-stream")
                    .json(&meta)
                    .send()?;
                let resp = check(resp)?;
                let session = resp
                    .headers()
                    .get("location")
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| Error::State("resumable upload without session URL".into()))?
                    .to_string();

                let resp = self
                    .http
                    .put(session)
                    .header("authorization", self.bearer())
                    .body(Body::new(body))
                    .send()?;
                let created: IdReply = check(resp)?.json()?;
                Ok(created.id)
            }
        }
    }
}

#[derive(Deserialize)]
struct IdReply {
    id: String,
}

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileEntry>,
}

#[derive(Deserialize)]
struct FileEntry {
    id:   String,
    name: String,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default, rename = "mimeType")]
    mime_type: String,
    /// Drive encodes int64 as a JSON string.
    #[serde(default)]
    size: Option<String>,
    #[serde(default, rename = "modifiedTime")]
    modified_time: Option<DateTime<Utc>>,
}

/// Drive query strings quote values with single quotes; escape embedded ones.
fn q_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

impl DocStore for DriveClient {
    fn get_file_id(
        &mut self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<Option<(String, String)>> {
        self.ensure_token()?;

        let mut q = format!("name = '{}' and trashed = false", q_escape(name));
        if let Some(p) = parent {
            q.push_str(&format!(" and '{}' in parents", q_escape(p)));
        }
        let resp = self
            .http
            .get(format!("{API}/files"))
            .header("authorization", self.bearer())
            .query(&[
                ("q", q.as_str()),
                ("pageSize", "1"),
                ("fields", "files(id, name, parents)"),
            ])
            .send()?;
        let list: FileList = check(resp)?.json()?;

        let Some(entry) = list.files.into_iter().next() else {
            return Ok(None);
        };
        if entry.parents.is_empty() {
            log::warn!("'{name}' is not in any folder");
        }
        let parent_id = entry.parents.into_iter().next().unwrap_or_default();
        Ok(Some((entry.id, parent_id)))
    }

    fn get_or_create_folder(
        &mut self,
        name: &str,
        parent: Option<&str>,
        mod_time: Option<DateTime<Utc>>,
    ) -> Result<(bool, String)> {
        if let Some((id, parent_id)) = self.get_file_id(name, parent)? {
            if let Some(p) = parent {
                if parent_id != p {
                    return Err(Error::State(format!(
                        "folder '{name}' found under unexpected parent {parent_id}"
                    )));
                }
            }
            return Ok((true, id));
        }
        let id = self.create(name, parent, Upload::Folder, mod_time)?;
        Ok((false, id))
    }

    fn create_file(
        &mut self,
        name: &str,
        parent: Option<&str>,
        body: Box<dyn Read + Send>,
        mod_time: Option<DateTime<Utc>>,
    ) -> Result<String> {
        self.create(name, parent, Upload::File(body), mod_time)
    }

    fn download(&mut self, id: &str) -> Result<Box<dyn Read>> {
        self.ensure_token()?;
        let resp = self
            .http
            .get(format!("{API}/files/{id}"))
            .header("authorization", self.bearer())
            .query(&[("alt", "media")])
            .send()?;
        Ok(Box::new(check(resp)?))
    }

    fn update_app_properties(&mut self, id: &str, props: &[(&str, &str)]) -> Result<()> {
        self.ensure_token()?;
        let map: serde_json::Map<String, serde_json::Value> = props
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect();
        let resp = self
            .http
            .patch(format!("{API}/files/{id}"))
            .header("authorization", self.bearer())
            .json(&json!({ "appProperties": map }))
            .send()?;
        check(resp)?;
        Ok(())
    }

    fn list(&mut self, folder_id: &str) -> Result<(Vec<RemoteEntry>, Vec<RemoteEntry>)> {
        self.ensure_token()?;
        let q = format!("'{}' in parents and trashed = false", q_escape(folder_id));
        let resp = self
            .http
            .get(format!("{API}/files"))
            .header("authorization", self.bearer())
            .query(&[
                ("q", q.as_str()),
                ("pageSize", "1000"),
                ("fields", "files(id, name, mimeType, size, modifiedTime)"),
            ])
            .send()?;
        let list: FileList = check(resp)?.json()?;

        let mut folders = Vec::new();
        let mut files = Vec::new();
        for entry in list.files {
            let is_folder = entry.mime_type == FOLDER_MIME;
            let item = RemoteEntry {
                id:        entry.id,
                name:      entry.name,
                is_folder,
                size:      entry.size.and_then(|s| s.parse().ok()).unwrap_or(0),
                mod_time:  entry.modified_time,
            };
            if is_folder {
                folders.push(item);
            } else {
                files.push(item);
            }
        }
        Ok((folders, files))
    }
}

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! C11: transport glue. Derives the three HTTP endpoints from a connection
//! string, exchanges a single payload blob with a peer, and drives the
//! check/download/apply and encode/upload-request/upload/upload-commit
//! loops described in §6.5.
//!
//! Kept as a thin, synchronous client: the design's concurrency model (§5)
//! is single-threaded cooperative, so `send_changes`/`check_for_changes`
//! block the caller exactly like every other host I/O call the core makes.

use crate::context::Context;
use crate::error::{Error, ErrorKind, Result};
use crate::settings::{self, keys};
use crate::sync::payload::{self, ApplyReport};
use crate::uuid7;
use reqwest::blocking::{Client, Response};
use serde::Serialize;
use std::time::Duration;
use url::Url;

/// Network-facing half of [`crate::context::Config`]: a connection string
/// of the form `scheme://host[:port]/database[?apikey=...|?token=...]`
/// (§6.5) plus a request timeout.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub connection_string: String,
    pub timeout: Duration,
}

impl NetworkConfig {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// The three endpoints derived from a connection string, per §6.5. Parsed
/// once at [`Transport::new`] time rather than re-parsed per request.
#[derive(Debug, Clone)]
struct Endpoints {
    origin: String,
    database: String,
    auth: Option<(String, String)>,
}

impl Endpoints {
    fn parse(connection_string: &str) -> Result<Self> {
        let url = Url::parse(connection_string)?;
        let scheme = url.scheme();
        let host = url
            .host_str()
            .ok_or_else(|| Error::from(ErrorKind::Misuse("connection string is missing a host".into())))?;
        let origin = match url.port() {
            Some(port) => format!("{scheme}://{host}:{port}"),
            None => format!("{scheme}://{host}"),
        };
        let database = url.path().trim_matches('/').to_string();
        if database.is_empty() {
            return Err(Error::from(ErrorKind::Misuse(
                "connection string is missing a database path segment".into(),
            )));
        }
        let auth = url
            .query_pairs()
            .find(|(k, _)| k == "apikey" || k == "token")
            .map(|(k, v)| (k.into_owned(), v.into_owned()));
        Ok(Self { origin, database, auth })
    }

    fn with_auth(&self, url: String) -> String {
        match &self.auth {
            Some((k, v)) => {
                let sep = if url.contains('?') { '&' } else { '?' };
                format!("{url}{sep}{k}={v}")
            }
            None => url,
        }
    }

    fn check_url(&self, site_id: &str, db_version: i64, seq: i64) -> String {
        self.with_auth(format!(
            "{}/v1/cloudsync/{}/{}/{}/{}/check",
            self.origin, self.database, site_id, db_version, seq
        ))
    }

    fn upload_request_url(&self, site_id: &str) -> String {
        self.with_auth(format!("{}/v1/cloudsync/{}/{}/upload", self.origin, self.database, site_id))
    }
}

#[derive(Serialize)]
struct UploadCommitBody<'a> {
    url: &'a str,
}

/// A blocking HTTP client bound to one peer's connection string.
pub struct Transport {
    client: Client,
    endpoints: Endpoints,
}

impl Transport {
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        let endpoints = Endpoints::parse(&config.connection_string)?;
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, endpoints })
    }

    fn check_status(resp: Response) -> Result<Response> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = Some(resp.status().as_u16());
            let body = resp.text().ok().filter(|b| !b.is_empty());
            Err(Error::from(ErrorKind::Transport { status, body }))
        }
    }

    /// `GET .../{site_id}/{db_version}/{seq}/check`. An empty response body
    /// means no new changes; otherwise the body is the URL of a blob to
    /// download.
    pub fn check(&self, site_id: &str, db_version: i64, seq: i64) -> Result<Option<String>> {
        let url = self.endpoints.check_url(site_id, db_version, seq);
        log::debug!("cloudsync: GET {url}");
        let resp = Self::check_status(self.client.get(&url).send()?)?;
        let body = resp.text()?;
        let body = body.trim();
        Ok(if body.is_empty() { None } else { Some(body.to_string()) })
    }

    pub fn download_blob(&self, url: &str) -> Result<Vec<u8>> {
        log::debug!("cloudsync: GET {url}");
        let resp = Self::check_status(self.client.get(url).send()?)?;
        Ok(resp.bytes()?.to_vec())
    }

    /// `GET .../{site_id}/upload` -- returns a pre-signed URL to `PUT` the
    /// payload blob to.
    pub fn upload_request(&self, site_id: &str) -> Result<String> {
        let url = self.endpoints.upload_request_url(site_id);
        log::debug!("cloudsync: GET {url}");
        let resp = Self::check_status(self.client.get(&url).send()?)?;
        Ok(resp.text()?.trim().to_string())
    }

    pub fn put_blob(&self, presigned_url: &str, body: Vec<u8>) -> Result<()> {
        log::debug!("cloudsync: PUT {presigned_url} ({} bytes)", body.len());
        Self::check_status(
            self.client
                .put(presigned_url)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(body)
                .send()?,
        )?;
        Ok(())
    }

    /// `POST .../{site_id}/upload` with `{"url": "..."}`, notifying the
    /// server that the pre-signed upload has completed.
    pub fn upload_commit(&self, site_id: &str, uploaded_url: &str) -> Result<()> {
        let url = self.endpoints.upload_request_url(site_id);
        log::debug!("cloudsync: POST {url}");
        Self::check_status(
            self.client
                .post(&url)
                .json(&UploadCommitBody { url: uploaded_url })
                .send()?,
        )?;
        Ok(())
    }
}

/// Encode every local change since the `send_dbversion`/`send_seq` cursor,
/// upload it via the request/put/commit triple, and advance the cursor
/// past the encoded rows. Returns `false` if there was nothing to send.
pub fn send_changes(ctx: &Context) -> Result<bool> {
    let transport = require_transport(ctx)?;
    let since = cursor(&ctx.conn, keys::SEND_DBVERSION)?;
    let rows = {
        let registry = ctx.registry.borrow();
        crate::changes::select_changes(
            &ctx.conn,
            &registry,
            &crate::changes::ChangeFilter {
                min_db_version: since,
                site_id: None,
            },
        )?
    };
    if rows.is_empty() {
        log::debug!("cloudsync: nothing to send since db_version {since:?}");
        return Ok(false);
    }
    let max_db_version = rows.iter().map(|r| r.db_version).max().unwrap();
    let max_seq = rows
        .iter()
        .filter(|r| r.db_version == max_db_version)
        .map(|r| r.seq)
        .max()
        .unwrap();
    let hash = crate::schema_hash::compute(&ctx.conn, &ctx.registry.borrow())?;
    let blob = payload::encode(&rows, hash)?;

    let site_id = uuid7::to_plain_hex(&ctx.site_id);
    let presigned = transport.upload_request(&site_id)?;
    transport.put_blob(&presigned, blob)?;
    transport.upload_commit(&site_id, &presigned)?;

    settings::set(&ctx.conn, keys::SEND_DBVERSION, &max_db_version.to_string())?;
    settings::set(&ctx.conn, keys::SEND_SEQ, &max_seq.to_string())?;
    log::debug!("cloudsync: sent {} rows up to db_version {max_db_version}", rows.len());
    Ok(true)
}

/// Poll `check`, and if a blob is available, download and apply it,
/// advancing the `check_dbversion`/`check_seq` cursor to whatever actually
/// committed (§7: a payload apply never partially advances past a group
/// that rolled back).
pub fn check_for_changes(ctx: &Context) -> Result<ApplyReport> {
    let transport = require_transport(ctx)?;
    let site_id = uuid7::to_plain_hex(&ctx.site_id);
    let db_version = cursor(&ctx.conn, keys::CHECK_DBVERSION)?.unwrap_or(0);
    let seq = cursor(&ctx.conn, keys::CHECK_SEQ)?.unwrap_or(0);

    let Some(blob_url) = transport.check(&site_id, db_version, seq)? else {
        log::debug!("cloudsync: no new changes as of db_version {db_version}/{seq}");
        return Ok(ApplyReport::default());
    };
    let blob = transport.download_blob(&blob_url)?;
    let report = payload::apply(ctx, &blob)?;
    if let Some(dv) = report.max_db_version {
        settings::set(&ctx.conn, keys::CHECK_DBVERSION, &dv.to_string())?;
    }
    if let Some(seq) = report.max_seq {
        settings::set(&ctx.conn, keys::CHECK_SEQ, &seq.to_string())?;
    }
    log::debug!("cloudsync: applied {} rows from {blob_url}", report.applied);
    Ok(report)
}

/// Send then poll for inbound changes, retrying the poll up to
/// `max_retries` times with a sleep of `wait` between passes -- the exact
/// shape `network.c`'s `cloudsync_network_sync` loop uses, not a generic
/// "some retry" (§10.5).
pub fn sync(ctx: &Context, wait: Duration, max_retries: u32) -> Result<ApplyReport> {
    send_changes(ctx)?;
    let mut attempt = 0;
    loop {
        let report = check_for_changes(ctx)?;
        if report.applied > 0 || attempt >= max_retries {
            return Ok(report);
        }
        attempt += 1;
        std::thread::sleep(wait);
    }
}

/// Forget all four sync cursor keys, forcing the next `send_changes`/
/// `check_for_changes` pair to start from the beginning of the change log
/// -- used to repair a corrupted cursor (§10.5), independent of a full
/// [`Context::terminate`].
pub fn network_reset_sync_version(ctx: &Context) -> Result<()> {
    for key in [keys::SEND_DBVERSION, keys::SEND_SEQ, keys::CHECK_DBVERSION, keys::CHECK_SEQ] {
        settings::delete(&ctx.conn, key)?;
    }
    Ok(())
}

fn cursor(db: &rusqlite::Connection, key: &str) -> Result<Option<i64>> {
    Ok(settings::get(db, key)?.and_then(|v| v.parse().ok()))
}

fn require_transport(ctx: &Context) -> Result<&Transport> {
    ctx.transport
        .as_ref()
        .ok_or_else(|| Error::from(ErrorKind::Misuse("no network config supplied to this context".into())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_parse_scheme_host_port_and_database() {
        let e = Endpoints::parse("https://sync.example.com:8443/mydb?apikey=abc123").unwrap();
        assert_eq!(e.origin, "https://sync.example.com:8443");
        assert_eq!(e.database, "mydb");
        assert_eq!(e.auth, Some(("apikey".to_string(), "abc123".to_string())));
    }

    #[test]
    fn endpoints_parse_without_explicit_port_or_auth() {
        let e = Endpoints::parse("https://sync.example.com/mydb").unwrap();
        assert_eq!(e.origin, "https://sync.example.com");
        assert_eq!(e.database, "mydb");
        assert_eq!(e.auth, None);
    }

    #[test]
    fn check_url_matches_the_documented_path_shape() {
        let e = Endpoints::parse("https://h/db?token=tok").unwrap();
        assert_eq!(
            e.check_url("deadbeef", 7, 2),
            "https://h/v1/cloudsync/db/deadbeef/7/2/check?token=tok"
        );
    }

    #[test]
    fn upload_request_url_matches_the_documented_path_shape() {
        let e = Endpoints::parse("https://h/db").unwrap();
        assert_eq!(e.upload_request_url("deadbeef"), "https://h/v1/cloudsync/db/deadbeef/upload");
    }

    #[test]
    fn missing_database_segment_is_rejected() {
        assert!(Endpoints::parse("https://h/").is_err());
    }
}

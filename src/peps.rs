//! Access to the PEPS catalog and download endpoints.
use crate::config::Credentials;
use crate::product::Collection;
use crate::verify::json_document;
use anyhow::{anyhow, Result};
use reqwest::Client;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tracing::debug;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://peps.cnes.fr/resto/";
const ISSUER_ID: &str = "peps";

pub trait PepsOps {
    /// Raw body of one catalog search.
    async fn search(
        self: &Self,
        collection: Collection,
        params: &[(&str, String)],
    ) -> anyhow::Result<String>;

    /// Asks the archive to bring a tape product back to disk. The response body is never read.
    async fn stage(self: &Self, collection: Collection, feature_id: &str) -> anyhow::Result<()>;

    /// Streams a product to `dst` and returns the number of bytes written.
    async fn download_to(
        self: &Self,
        collection: Collection,
        feature_id: &str,
        dst: &Path,
    ) -> anyhow::Result<u64>;
}

pub fn search_url(base: &Url, collection: Collection, params: &[(&str, String)]) -> Result<Url> {
    let mut url = base.join(&format!("api/collections/{collection}/search.json"))?;
    url.query_pairs_mut()
        .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())));
    Ok(url)
}

pub fn download_url(base: &Url, collection: Collection, feature_id: &str) -> Result<Url> {
    let mut url = base.join(&format!("collections/{collection}/{feature_id}/download/"))?;
    url.query_pairs_mut().append_pair("issuerId", ISSUER_ID);
    Ok(url)
}

pub struct Peps {
    client: Client,
    base_url: Url,
    credentials: Credentials,
}

impl Peps {
    pub fn new(base_url: &str, credentials: Credentials) -> Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        // `join` replaces the last path segment unless the base ends with a slash
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }
        Ok(Self {
            client: Client::new(),
            base_url,
            credentials,
        })
    }

    async fn get_product(
        self: &Self,
        collection: Collection,
        feature_id: &str,
    ) -> Result<reqwest::Response> {
        let url = download_url(&self.base_url, collection, feature_id)?;
        let response = self
            .client
            .get(url)
            .basic_auth(&self.credentials.user, Some(&self.credentials.password))
            .send()
            .await?;
        Ok(response)
    }
}

impl PepsOps for Peps {
    async fn search(
        self: &Self,
        collection: Collection,
        params: &[(&str, String)],
    ) -> anyhow::Result<String> {
        let url = search_url(&self.base_url, collection, params)?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        // Error documents carry the catalog's own code and are decoded by the caller.
        if !status.is_success() && json_document(body.as_bytes()).is_none() {
            return Err(anyhow!("Catalog answered {status}"));
        }
        Ok(body)
    }

    async fn stage(self: &Self, collection: Collection, feature_id: &str) -> anyhow::Result<()> {
        let response = self.get_product(collection, feature_id).await?;
        debug!(feature_id, status = %response.status(), "Stage request answered");
        Ok(())
    }

    async fn download_to(
        self: &Self,
        collection: Collection,
        feature_id: &str,
        dst: &Path,
    ) -> anyhow::Result<u64> {
        let mut response = self.get_product(collection, feature_id).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await?;
            if json_document(&body).is_none() {
                return Err(anyhow!("Download of {feature_id} answered {status}"));
            }
            // Kept for the verifier, which reports it as refused credentials.
            fs::write(dst, &body)?;
            return Ok(body.len() as u64);
        }
        let mut file = File::create(dst)
            .map_err(|e| anyhow!("Creating {}: {e}", dst.display()))?;

        let mut byte_count = 0_u64;
        while let Some(bytes) = response.chunk().await? {
            file.write_all(&bytes)?;
            byte_count += bytes.len() as u64;
        }
        file.flush()?;
        Ok(byte_count)
    }
}

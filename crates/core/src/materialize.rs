use crate::error::IngestError;
use crate::models::{DocumentReference, RemoteDescriptor, SupportedFormat};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use reqwest::Client;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::debug;
use url::Url;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// A reference resolved to a local file. Temp files created during
/// resolution are owned here and deleted when the value drops, on every
/// exit path.
pub struct Materialized {
    path: PathBuf,
    guards: Vec<NamedTempFile>,
}

impl Materialized {
    fn passthrough(path: PathBuf) -> Self {
        Self {
            path,
            guards: Vec::new(),
        }
    }

    fn owned(file: NamedTempFile) -> Self {
        Self {
            path: file.path().to_path_buf(),
            guards: vec![file],
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn temp_file_count(&self) -> usize {
        self.guards.len()
    }
}

/// Client for the remote document store's content API. Download failures
/// propagate without local retry; retrying is the remote side's concern.
pub struct RemoteStoreClient {
    client: Client,
    api_base: String,
    bearer_token: Option<String>,
}

impl RemoteStoreClient {
    pub fn new(
        api_base: impl Into<String>,
        bearer_token: Option<String>,
    ) -> Result<Self, IngestError> {
        let client = Client::builder().timeout(DOWNLOAD_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            bearer_token,
        })
    }

    pub async fn download(&self, descriptor: &RemoteDescriptor) -> Result<Vec<u8>, IngestError> {
        let url = resolve_download_url(&self.api_base, descriptor)?;
        debug!(%url, "downloading remote document");

        let mut request = self.client.get(&url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|error| IngestError::DownloadFailed(error.to_string()))?;

        if !response.status().is_success() {
            return Err(IngestError::DownloadFailed(format!(
                "{url} returned {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|error| IngestError::DownloadFailed(error.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Policy cascade for turning a remote descriptor into one content URL:
/// absolute content URL, then a recognizable web URL via the share-id
/// endpoint, then site host plus server-relative path, then the
/// drive/item pair as last resort.
pub fn resolve_download_url(
    api_base: &str,
    descriptor: &RemoteDescriptor,
) -> Result<String, IngestError> {
    if let Some(content_url) = &descriptor.content_url {
        return Ok(content_url.clone());
    }

    if let Some(web_url) = &descriptor.web_url {
        let parsed = Url::parse(web_url).map_err(|error| {
            IngestError::UnresolvableReference(format!("web url {web_url:?}: {error}"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(IngestError::UnresolvableReference(format!(
                "web url {web_url:?} has no recognizable host"
            )));
        }
        let share_id = format!("u!{}", URL_SAFE_NO_PAD.encode(web_url.as_bytes()));
        return Ok(format!("{api_base}/shares/{share_id}/driveItem/content"));
    }

    if let (Some(host), Some(relative)) =
        (&descriptor.site_host, &descriptor.server_relative_path)
    {
        let relative = if relative.starts_with('/') {
            relative.clone()
        } else {
            format!("/{relative}")
        };
        return Ok(format!(
            "{api_base}/sites/{host}/drive/root:{relative}:/content"
        ));
    }

    if let (Some(drive_id), Some(item_id)) = (&descriptor.drive_id, &descriptor.item_id) {
        return Ok(format!("{api_base}/drives/{drive_id}/items/{item_id}/content"));
    }

    Err(IngestError::UnresolvableReference(
        "descriptor has no usable location fields".to_string(),
    ))
}

/// Resolve any document reference to a local path plus a cleanup list.
/// Local paths pass through unchanged; embedded payloads and remote
/// downloads land in drop-guarded temp files under the configured roots.
pub async fn materialize(
    reference: &DocumentReference,
    data_root: &Path,
    image_root: &Path,
    remote: Option<&RemoteStoreClient>,
) -> Result<Materialized, IngestError> {
    match reference {
        DocumentReference::Local { path } => {
            let path = PathBuf::from(path);
            std::fs::metadata(&path)?;
            Ok(Materialized::passthrough(path))
        }
        DocumentReference::Embedded { name, payload } => {
            let bytes = STANDARD.decode(payload.trim()).map_err(|error| {
                IngestError::InvalidPayload(format!("{name}: {error}"))
            })?;
            if bytes.is_empty() {
                return Err(IngestError::InvalidPayload(format!(
                    "{name}: payload decodes to zero bytes"
                )));
            }
            let file = write_temp(&bytes, extension_of(name).as_deref(), data_root, image_root)?;
            Ok(Materialized::owned(file))
        }
        DocumentReference::Remote { descriptor } => {
            let client = remote.ok_or_else(|| {
                IngestError::UnresolvableReference("remote store is not configured".to_string())
            })?;
            let bytes = client.download(descriptor).await?;
            let extension = remote_extension(descriptor);
            let file = write_temp(&bytes, extension.as_deref(), data_root, image_root)?;
            Ok(Materialized::owned(file))
        }
    }
}

fn remote_extension(descriptor: &RemoteDescriptor) -> Option<String> {
    descriptor
        .file_name
        .as_deref()
        .and_then(|name| extension_of(name))
        .or_else(|| {
            descriptor
                .server_relative_path
                .as_deref()
                .and_then(extension_of)
        })
        .or_else(|| descriptor.web_url.as_deref().and_then(extension_of))
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

fn write_temp(
    bytes: &[u8],
    extension: Option<&str>,
    data_root: &Path,
    image_root: &Path,
) -> Result<NamedTempFile, IngestError> {
    let is_image = extension.is_some_and(|ext| {
        matches!(
            SupportedFormat::from_path(Path::new(&format!("f.{ext}"))),
            Ok(SupportedFormat::Image)
        )
    });
    let root = if is_image { image_root } else { data_root };
    std::fs::create_dir_all(root)?;

    let mut builder = tempfile::Builder::new();
    builder.prefix("docpipe-");
    let suffix = extension.map(|ext| format!(".{ext}"));
    if let Some(suffix) = &suffix {
        builder.suffix(suffix.as_str());
    }

    let mut file = builder.tempfile_in(root)?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(file)
}

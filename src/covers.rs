use bytes::Bytes;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Upload a cover image and return its public URL.
///
/// Storage failure here is fatal to the caller: no book record may ever
/// reference an image that was never stored.
pub async fn store_cover(
    st: &AppState,
    owner_id: Uuid,
    book_id: Uuid,
    body: Bytes,
    content_type: &str,
) -> ApiResult<String> {
    let ext = ext_from_mime(content_type).ok_or_else(|| {
        ApiError::InvalidInput(format!("unsupported image type: {content_type}"))
    })?;
    // Random suffix so a replacement cover never collides with the old key.
    let key = format!("covers/{}/{}-{}.{}", owner_id, book_id, Uuid::new_v4(), ext);
    st.storage
        .put_object(&key, body, content_type)
        .await
        .map_err(|e| ApiError::Storage(e.to_string()))?;
    Ok(format!("{}/{}", st.config.s3.public_url, key))
}

/// Delete a previously stored cover by its public URL.
///
/// Callers treat failure as non-fatal: losing the reclaim must not block
/// removing or updating the catalog entry.
pub async fn delete_cover(st: &AppState, image_url: &str) -> anyhow::Result<()> {
    let key = key_from_url(&st.config.s3.public_url, image_url)
        .ok_or_else(|| anyhow::anyhow!("image url outside configured public base: {image_url}"))?;
    st.storage.delete_object(&key).await
}

fn key_from_url(public_url: &str, url: &str) -> Option<String> {
    url.strip_prefix(public_url)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

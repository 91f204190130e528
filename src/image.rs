use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{StoreError, StoreResult};

pub const IMAGE_SIZE_LIMIT: usize = 5 * 1024 * 1024; // 5 MB decoded

const ALLOWED_MIME: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/bmp",
];

/// Normalize a card image field. Empty input means "no image"; anything else
/// must be a base64 `data:image/...` URI whose payload sniffs as an allowed image.
pub fn validate_card_image(image: Option<&str>) -> StoreResult<Option<String>> {
    let uri = match image.map(str::trim) {
        None | Some("") => return Ok(None),
        Some(s) => s,
    };
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| StoreError::validation("image must be a data URI"))?;
    let (mime, payload) = rest
        .split_once(";base64,")
        .ok_or_else(|| StoreError::validation("image data URI must be base64 encoded"))?;
    if !mime.starts_with("image/") {
        return Err(StoreError::validation(format!("unsupported image type '{mime}'")));
    }
    // cheap bound before decoding
    if payload.len() / 4 * 3 > IMAGE_SIZE_LIMIT + 3 {
        return Err(StoreError::validation("image exceeds 5MB"));
    }
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| StoreError::validation(format!("image payload is not valid base64: {e}")))?;
    if bytes.len() > IMAGE_SIZE_LIMIT {
        return Err(StoreError::validation("image exceeds 5MB"));
    }
    let sniffed = infer::get(&bytes).map(|t| t.mime_type()).unwrap_or("application/octet-stream");
    if !ALLOWED_MIME.contains(&sniffed) {
        return Err(StoreError::validation(format!("unsupported image content '{sniffed}'")));
    }
    Ok(Some(uri.to_string()))
}

#[cfg(test)]
pub(crate) fn png_data_uri(extra: usize) -> String {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.resize(8 + extra, 0);
    format!("data:image/png;base64,{}", STANDARD.encode(bytes))
}

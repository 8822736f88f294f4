//! Image ingestion for the upload endpoint: a small multipart/form-data
//! parser plus the normalization that turns uploaded files into `image_url`
//! data-URI parts on the message list.

use base64::prelude::*;
use bytes::Bytes;

use crate::error::ProxyError;
use crate::types::{
    ChatCompletionRequest, ChatMessage, ContentPart, ImageUrl, MessageContent,
};

#[derive(Debug, Clone)]
pub struct MultipartPart {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

fn find_subslice(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(start);
    }
    if start >= haystack.len() {
        return None;
    }
    let first = needle[0];
    let mut pos = start;
    while pos + needle.len() <= haystack.len() {
        let rel = haystack[pos..].iter().position(|&b| b == first)?;
        pos += rel;
        if pos + needle.len() > haystack.len() {
            return None;
        }
        if &haystack[pos..pos + needle.len()] == needle {
            return Some(pos);
        }
        pos += 1;
    }
    None
}

fn multipart_boundary(content_type: &str) -> Result<String, ProxyError> {
    for part in content_type.split(';').map(str::trim) {
        if !part.to_ascii_lowercase().starts_with("boundary=") {
            continue;
        }
        let value = part["boundary=".len()..].trim();
        let unquoted = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        if !unquoted.trim().is_empty() {
            return Ok(unquoted.to_string());
        }
    }
    Err(ProxyError::invalid_request("multipart boundary is missing"))
}

pub fn parse_multipart_form(
    content_type: &str,
    body: &Bytes,
) -> Result<Vec<MultipartPart>, ProxyError> {
    let boundary = multipart_boundary(content_type)?;
    let boundary_marker = format!("--{boundary}");
    let boundary_bytes = boundary_marker.as_bytes();
    let delimiter = format!("\r\n{boundary_marker}");
    let delimiter_bytes = delimiter.as_bytes();

    let bytes = body.as_ref();
    let Some(mut cursor) = find_subslice(bytes, boundary_bytes, 0) else {
        return Err(ProxyError::invalid_request(
            "multipart body missing boundary marker",
        ));
    };
    cursor += boundary_bytes.len();

    let mut parts = Vec::<MultipartPart>::new();
    loop {
        if bytes.get(cursor..cursor + 2) == Some(b"--") {
            break;
        }
        if bytes.get(cursor..cursor + 2) == Some(b"\r\n") {
            cursor += 2;
        } else if bytes.get(cursor..cursor + 1) == Some(b"\n") {
            cursor += 1;
        }

        let (headers_end, header_sep_len) =
            if let Some(idx) = find_subslice(bytes, b"\r\n\r\n", cursor) {
                (idx, 4)
            } else if let Some(idx) = find_subslice(bytes, b"\n\n", cursor) {
                (idx, 2)
            } else {
                return Err(ProxyError::invalid_request(
                    "multipart part missing header separator",
                ));
            };

        let headers_raw = String::from_utf8_lossy(&bytes[cursor..headers_end]);
        let mut name: Option<String> = None;
        let mut filename: Option<String> = None;
        let mut content_type: Option<String> = None;

        for line in headers_raw.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            if key.eq_ignore_ascii_case("content-disposition") {
                for item in value.split(';').map(str::trim) {
                    if let Some(value) = item.strip_prefix("name=") {
                        name = Some(unquote(value));
                    } else if let Some(value) = item.strip_prefix("filename=") {
                        filename = Some(unquote(value));
                    }
                }
            } else if key.eq_ignore_ascii_case("content-type") && !value.is_empty() {
                content_type = Some(value.to_string());
            }
        }

        let name = name.ok_or_else(|| {
            ProxyError::invalid_request("multipart part missing content-disposition name")
        })?;
        let data_start = headers_end + header_sep_len;

        let Some(delim_pos) = find_subslice(bytes, delimiter_bytes, data_start) else {
            return Err(ProxyError::invalid_request(
                "multipart part missing trailing boundary",
            ));
        };

        parts.push(MultipartPart {
            name,
            filename,
            content_type,
            data: body.slice(data_start..delim_pos),
        });

        cursor = delim_pos + delimiter_bytes.len();
        if bytes.get(cursor..cursor + 2) == Some(b"--") {
            break;
        }
        if bytes.get(cursor..cursor + 2) == Some(b"\r\n") {
            cursor += 2;
        } else if bytes.get(cursor..cursor + 1) == Some(b"\n") {
            cursor += 1;
        }
    }

    Ok(parts)
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

/// Turns a multipart upload into a normal chat-completion request: `model`,
/// `messages` (JSON string) and `stream` fields plus `files[]` images that
/// become data-URI `image_url` parts on the last user message. After this
/// the standard pipeline applies.
pub fn ingest_upload(
    content_type: &str,
    body: &Bytes,
    allowed_image_types: &[String],
) -> Result<ChatCompletionRequest, ProxyError> {
    let parts = parse_multipart_form(content_type, body)?;

    let field = |name: &str| {
        parts
            .iter()
            .find(|part| part.name == name && part.filename.is_none())
            .map(|part| String::from_utf8_lossy(&part.data).trim().to_string())
    };

    let model = field("model")
        .filter(|model| !model.is_empty())
        .ok_or_else(|| ProxyError::InvalidRequest {
            message: "missing form field 'model'".to_string(),
            param: Some("model".to_string()),
        })?;

    let raw_messages = field("messages").ok_or_else(|| ProxyError::InvalidRequest {
        message: "missing form field 'messages'".to_string(),
        param: Some("messages".to_string()),
    })?;
    let mut messages: Vec<ChatMessage> =
        serde_json::from_str(&raw_messages).map_err(|err| ProxyError::InvalidRequest {
            message: format!("invalid 'messages' JSON: {err}"),
            param: Some("messages".to_string()),
        })?;

    let stream = field("stream")
        .map(|raw| matches!(raw.to_ascii_lowercase().as_str(), "true" | "1"))
        .unwrap_or(false);

    let mut image_parts = Vec::new();
    for part in parts
        .iter()
        .filter(|part| part.filename.is_some() && (part.name == "files" || part.name == "files[]"))
    {
        let mime = part
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream")
            .to_ascii_lowercase();
        if !allowed_image_types.iter().any(|allowed| *allowed == mime) {
            return Err(ProxyError::UnsupportedMediaType(format!(
                "unsupported image type '{mime}'"
            )));
        }
        image_parts.push(ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: format!("data:{mime};base64,{}", BASE64_STANDARD.encode(&part.data)),
            },
        });
    }

    if !image_parts.is_empty() {
        attach_images(&mut messages, image_parts);
    }

    let mut request = ChatCompletionRequest::new(model, messages);
    request.stream = stream;
    Ok(request)
}

fn attach_images(messages: &mut Vec<ChatMessage>, image_parts: Vec<ContentPart>) {
    let target = messages
        .iter_mut()
        .rev()
        .find(|message| message.role == "user");

    match target {
        Some(message) => {
            let mut parts = match std::mem::replace(
                &mut message.content,
                MessageContent::Text(String::new()),
            ) {
                MessageContent::Text(text) => {
                    if text.is_empty() {
                        Vec::new()
                    } else {
                        vec![ContentPart::Text { text }]
                    }
                }
                MessageContent::Parts(parts) => parts,
            };
            parts.extend(image_parts);
            message.content = MessageContent::Parts(parts);
        }
        None => messages.push(ChatMessage {
            role: "user".to_string(),
            content: MessageContent::Parts(image_parts),
        }),
    }
}

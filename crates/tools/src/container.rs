use base64::{Engine as _, engine::general_purpose::STANDARD};
use thiserror::Error;

use super::*;

#[derive(Debug, Error)]
pub enum ContainerToolError {
    #[error("arguments are not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("arguments are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("tool `{name}` does not run through the container tool executable")]
    NotRelayable { name: String },
}

/// Encodes tool arguments for the `--args-b64` flag. The standard alphabet
/// needs no shell quoting.
pub(crate) fn encode_arguments(arguments: &Value) -> Result<String, serde_json::Error> {
    Ok(STANDARD.encode(serde_json::to_vec(arguments)?))
}

fn decode_arguments(encoded: &str) -> Result<Value, ContainerToolError> {
    let bytes = STANDARD.decode(encoded.trim())?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// JSON escaping grows text by at most this factor (`\u001f` for one byte).
const JSON_ESCAPE_FACTOR: usize = 6;

/// Room for the result envelope, error text and truncation marker.
const RELAY_ENVELOPE_BYTES: usize = 64 * 1024;

/// Capture bound that always fits the JSON reply of a relayed tool whose
/// output is limited to `max_output_bytes`.
pub(crate) fn relay_capture_limit(max_output_bytes: usize) -> usize {
    max_output_bytes
        .saturating_mul(JSON_ESCAPE_FACTOR)
        .saturating_add(RELAY_ENVELOPE_BYTES)
}

/// Entry point of the in-container tool executable: runs one filesystem
/// tool against container paths with its output bounded to
/// `max_output_bytes`. Every failure is folded into the result.
pub async fn run_container_tool(
    name: &str,
    encoded_arguments: &str,
    max_output_bytes: usize,
) -> ToolExecResult {
    match try_run_container_tool(name, encoded_arguments, max_output_bytes).await {
        Ok(result) => result,
        Err(error) => ToolExecResult::failed(String::new(), error.to_string()),
    }
}

async fn try_run_container_tool(
    name: &str,
    encoded_arguments: &str,
    max_output_bytes: usize,
) -> Result<ToolExecResult, ContainerToolError> {
    let arguments = decode_arguments(encoded_arguments)?;
    let registry = ToolRegistry::builder()
        .max_output_bytes(max_output_bytes)
        .enable(name)?
        .build();
    let Some(tool) = registry.get(name) else {
        return Err(RegistryError::UnknownTool {
            name: name.to_owned(),
        }
        .into());
    };
    if !matches!(tool.footprint(), ToolFootprint::Filesystem { .. }) {
        return Err(ContainerToolError::NotRelayable {
            name: name.to_owned(),
        });
    }

    Ok(
        match registry
            .execute(name, &arguments, &ToolContext::default())
            .await
        {
            Ok(result) => result,
            Err(error) => ToolExecResult::failed(String::new(), error.to_string()),
        },
    )
}
